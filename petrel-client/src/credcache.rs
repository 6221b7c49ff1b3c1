//! Credential cache.
//!
//! Maps (uid, gid) to a signed credential. Cache entries expire before the
//! credential itself (a safety margin below the credential's own expiry) so
//! a clone handed to an in-flight operation cannot lapse mid-call.
//! Negative credentials (no signature) are returned to the caller but never
//! cached. Completions carrying a permission error purge the entry, forcing
//! regeneration on the next request.

use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::debug;

use tcache::{Lookup, Params, Tcache};

use crate::options::CacheOptions;
use crate::sys::{Credential, Sys};

/// Cache entries expire this many seconds before their credential does.
const CRED_TIMEOUT_MARGIN_SECS: u64 = 5;

pub struct CredentialCache {
    cache: Tcache<(u32, u32), Credential>,
    epoch: Instant,
    keypath: Option<PathBuf>,
}

impl CredentialCache {
    /// Build from the `--ccache-*` option family (timeout in seconds).
    pub fn new(opts: &CacheOptions, keypath: Option<PathBuf>) -> Self {
        let mut params = Params::new(opts.timeout * 1000);
        if opts.soft_limit_set {
            params.soft_limit = opts.soft_limit as usize;
        }
        if opts.hard_limit_set {
            params.hard_limit = opts.hard_limit as usize;
        }
        if opts.reclaim_percentage_set {
            params.reclaim_percentage = opts.reclaim_percentage as u8;
        }
        Self {
            cache: Tcache::new(params),
            epoch: Instant::now(),
            keypath: keypath.filter(|p| !p.as_os_str().is_empty()),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Look up a credential for (uid, gid), generating and caching one on a
    /// miss. The returned value is always a clone; the cache keeps its own.
    pub fn lookup(&mut self, uid: u32, gid: u32, sys: &mut dyn Sys) -> Option<Credential> {
        let now = self.now_ms();
        match self.cache.lookup(&(uid, gid), now) {
            Lookup::Fresh(cred) => {
                debug!(target: "security", "credential cache hit for ({uid}, {gid})");
                return Some(cred.clone());
            }
            Lookup::Expired => {
                debug!(target: "security", "expired credential for ({uid}, {gid}) evicted");
            }
            Lookup::Miss => {}
        }

        debug!(target: "security", "credential cache miss for ({uid}, {gid})");
        let lifetime_secs = (self.cache.params().timeout_ms / 1000).max(1);
        let cred = match sys.gen_credential(uid, gid, lifetime_secs, self.keypath.as_deref()) {
            Ok(cred) => cred,
            Err(e) => {
                log::error!("unable to generate credential for ({uid}, {gid}): {e}");
                return None;
            }
        };

        if cred.is_signed() {
            let unix_now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let remaining_secs = cred
                .timeout_secs
                .saturating_sub(unix_now + CRED_TIMEOUT_MARGIN_SECS);
            let expiry_ms = now + (remaining_secs * 1000).min(self.cache.params().timeout_ms);
            if self
                .cache
                .insert_with_expiry((uid, gid), cred.clone(), expiry_ms, now)
                .is_err()
            {
                debug!(target: "security", "credential cache full; ({uid}, {gid}) not cached");
            }
        }
        Some(cred)
    }

    /// Drop the entry for (uid, gid). Called on permission-denied
    /// completions before the downcall is written.
    pub fn remove(&mut self, uid: u32, gid: u32) {
        if self.cache.remove(&(uid, gid)).is_some() {
            debug!(target: "security", "removed credential ({uid}, {gid}) from cache");
        }
    }

    pub fn contains(&mut self, uid: u32, gid: u32) -> bool {
        matches!(self.cache.lookup(&(uid, gid), self.now_ms()), Lookup::Fresh(_))
    }

    /// Param-op access: timeout is exposed in seconds, limits directly.
    pub fn param_get(&self, param: u32) -> Result<i64, i32> {
        let p = self.cache.params();
        match param {
            petrel_abi::param_kind::TIMEOUT_MSECS => Ok((p.timeout_ms / 1000) as i64),
            petrel_abi::param_kind::SOFT_LIMIT => Ok(p.soft_limit as i64),
            petrel_abi::param_kind::HARD_LIMIT => Ok(p.hard_limit as i64),
            petrel_abi::param_kind::RECLAIM_PERCENTAGE => Ok(p.reclaim_percentage as i64),
            _ => Err(petrel_abi::err::EINVAL),
        }
    }

    pub fn param_set(&mut self, param: u32, value: i64) -> Result<(), i32> {
        if value < 0 {
            return Err(petrel_abi::err::EINVAL);
        }
        match param {
            petrel_abi::param_kind::TIMEOUT_MSECS => {
                self.cache.set_timeout_ms(value as u64 * 1000)
            }
            petrel_abi::param_kind::SOFT_LIMIT => self.cache.set_soft_limit(value as usize),
            petrel_abi::param_kind::HARD_LIMIT => self.cache.set_hard_limit(value as usize),
            petrel_abi::param_kind::RECLAIM_PERCENTAGE => {
                self.cache.set_reclaim_percentage(value as u8)
            }
            _ => return Err(petrel_abi::err::EINVAL),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::local::LocalSys;

    fn cache(timeout_secs: u64) -> CredentialCache {
        let opts = CacheOptions {
            timeout: timeout_secs,
            ..Default::default()
        };
        CredentialCache::new(&opts, None)
    }

    #[test]
    fn miss_generates_and_caches() {
        let mut sys = LocalSys::new();
        let mut cc = cache(600);
        assert!(!cc.contains(1000, 1000));
        let cred = cc.lookup(1000, 1000, &mut sys).unwrap();
        assert!(cred.is_signed());
        assert!(cc.contains(1000, 1000));
        assert_eq!(cc.len(), 1);
    }

    #[test]
    fn hit_returns_equal_clone() {
        let mut sys = LocalSys::new();
        let mut cc = cache(600);
        let first = cc.lookup(42, 42, &mut sys).unwrap();
        let second = cc.lookup(42, 42, &mut sys).unwrap();
        assert_eq!(first, second);
        assert_eq!(cc.len(), 1);
    }

    #[test]
    fn negative_credential_not_cached() {
        let mut sys = LocalSys::new();
        let opts = CacheOptions {
            timeout: 600,
            ..Default::default()
        };
        let mut cc = CredentialCache::new(&opts, Some(PathBuf::from("/no/such/keyfile")));
        let cred = cc.lookup(7, 7, &mut sys).unwrap();
        assert!(!cred.is_signed());
        assert!(cc.is_empty());
    }

    #[test]
    fn remove_purges_entry() {
        let mut sys = LocalSys::new();
        let mut cc = cache(600);
        cc.lookup(1000, 1000, &mut sys).unwrap();
        cc.remove(1000, 1000);
        assert!(!cc.contains(1000, 1000));
    }

    #[test]
    fn params_round_trip_in_seconds() {
        let mut cc = cache(600);
        assert_eq!(cc.param_get(petrel_abi::param_kind::TIMEOUT_MSECS), Ok(600));
        cc.param_set(petrel_abi::param_kind::TIMEOUT_MSECS, 30).unwrap();
        assert_eq!(cc.param_get(petrel_abi::param_kind::TIMEOUT_MSECS), Ok(30));
        cc.param_set(petrel_abi::param_kind::SOFT_LIMIT, 99).unwrap();
        assert_eq!(cc.param_get(petrel_abi::param_kind::SOFT_LIMIT), Ok(99));
        assert_eq!(cc.param_get(77), Err(petrel_abi::err::EINVAL));
    }
}
