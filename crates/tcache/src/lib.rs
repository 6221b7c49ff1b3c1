//! A bounded, time-indexed cache.
//!
//! Designed for `no_std` + `alloc` environments. Entries carry an absolute
//! expiry in caller-supplied milliseconds; the cache never reads a clock of
//! its own, so tests and embedders control time completely.
//!
//! Capacity is governed by three knobs: a soft limit (crossing it triggers a
//! reclaim sweep), a hard limit (inserts fail once reclaim cannot get below
//! it), and a reclaim percentage (how much of the cache a sweep may evict
//! beyond expired entries).

#![no_std]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Tunable parameters for a [`Tcache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    /// Default entry lifetime in milliseconds. Zero effectively disables
    /// caching: every lookup after insert reports the entry expired.
    pub timeout_ms: u64,
    /// Entry count above which a reclaim sweep runs on insert.
    pub soft_limit: usize,
    /// Entry count the cache never exceeds.
    pub hard_limit: usize,
    /// Percentage (0-100) of entries a reclaim sweep may evict in addition
    /// to already-expired ones.
    pub reclaim_percentage: u8,
}

impl Params {
    /// Conservative defaults; callers normally override from configuration.
    pub const fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            soft_limit: 5120,
            hard_limit: 10240,
            reclaim_percentage: 25,
        }
    }
}

/// Result of a cache probe.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<'a, V> {
    /// Entry present and not expired.
    Fresh(&'a V),
    /// Entry was present but past its expiry; it has been removed.
    Expired,
    /// No entry for the key.
    Miss,
}

/// Error returned when an insert would exceed the hard limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheFull;

/// A bounded map from `K` to `V` where every entry expires.
pub struct Tcache<K: Ord, V> {
    entries: BTreeMap<K, Entry<V>>,
    params: Params,
}

struct Entry<V> {
    value: V,
    expires_at_ms: u64,
}

impl<K: Ord + Clone, V> Tcache<K, V> {
    pub fn new(params: Params) -> Self {
        Self {
            entries: BTreeMap::new(),
            params,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn params(&self) -> Params {
        self.params
    }

    /// Replace the default timeout. Existing entries keep their expiry.
    pub fn set_timeout_ms(&mut self, timeout_ms: u64) {
        self.params.timeout_ms = timeout_ms;
    }

    pub fn set_soft_limit(&mut self, soft_limit: usize) {
        self.params.soft_limit = soft_limit;
    }

    pub fn set_hard_limit(&mut self, hard_limit: usize) {
        self.params.hard_limit = hard_limit;
    }

    pub fn set_reclaim_percentage(&mut self, pct: u8) {
        self.params.reclaim_percentage = if pct > 100 { 100 } else { pct };
    }

    /// Insert with the default timeout.
    pub fn insert(&mut self, key: K, value: V, now_ms: u64) -> Result<(), CacheFull> {
        let expires = now_ms.saturating_add(self.params.timeout_ms);
        self.insert_with_expiry(key, value, expires, now_ms)
    }

    /// Insert with an explicit absolute expiry.
    ///
    /// Crossing the soft limit triggers a reclaim sweep; if the cache is
    /// still at the hard limit afterwards the insert is refused.
    pub fn insert_with_expiry(
        &mut self,
        key: K,
        value: V,
        expires_at_ms: u64,
        now_ms: u64,
    ) -> Result<(), CacheFull> {
        if !self.entries.contains_key(&key) {
            if self.entries.len() >= self.params.soft_limit {
                self.reclaim(now_ms);
            }
            if self.entries.len() >= self.params.hard_limit {
                return Err(CacheFull);
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at_ms,
            },
        );
        Ok(())
    }

    /// Probe for a key. Expired entries are removed as a side effect.
    pub fn lookup(&mut self, key: &K, now_ms: u64) -> Lookup<'_, V> {
        let expired = match self.entries.get(key) {
            None => return Lookup::Miss,
            Some(entry) => now_ms >= entry.expires_at_ms,
        };
        if expired {
            self.entries.remove(key);
            return Lookup::Expired;
        }
        match self.entries.get(key) {
            Some(entry) => Lookup::Fresh(&entry.value),
            None => Lookup::Miss,
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop every expired entry, then, if still above the soft limit, evict
    /// the soonest-to-expire entries up to `reclaim_percentage` of the
    /// current count.
    pub fn reclaim(&mut self, now_ms: u64) {
        self.entries.retain(|_, e| now_ms < e.expires_at_ms);

        if self.entries.len() <= self.params.soft_limit {
            return;
        }
        let budget = self.entries.len() * self.params.reclaim_percentage as usize / 100;
        if budget == 0 {
            return;
        }
        let mut victims: Vec<(u64, K)> = self
            .entries
            .iter()
            .map(|(k, e)| (e.expires_at_ms, k.clone()))
            .collect();
        victims.sort_by_key(|(exp, _)| *exp);
        for (_, key) in victims.into_iter().take(budget) {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(timeout_ms: u64) -> Tcache<u32, &'static str> {
        let mut params = Params::new(timeout_ms);
        params.soft_limit = 4;
        params.hard_limit = 6;
        params.reclaim_percentage = 50;
        Tcache::new(params)
    }

    #[test]
    fn fresh_hit_within_timeout() {
        let mut c = small(100);
        c.insert(1, "a", 0).unwrap();
        assert_eq!(c.lookup(&1, 99), Lookup::Fresh(&"a"));
    }

    #[test]
    fn expired_entry_removed_on_lookup() {
        let mut c = small(100);
        c.insert(1, "a", 0).unwrap();
        assert_eq!(c.lookup(&1, 100), Lookup::Expired);
        assert_eq!(c.lookup(&1, 100), Lookup::Miss);
    }

    #[test]
    fn zero_timeout_disables_caching() {
        let mut c = small(0);
        c.insert(1, "a", 50).unwrap();
        assert_eq!(c.lookup(&1, 50), Lookup::Expired);
    }

    #[test]
    fn explicit_expiry_overrides_default() {
        let mut c = small(100);
        c.insert_with_expiry(1, "a", 10, 0).unwrap();
        assert_eq!(c.lookup(&1, 9), Lookup::Fresh(&"a"));
        assert_eq!(c.lookup(&1, 10), Lookup::Expired);
    }

    #[test]
    fn soft_limit_sweep_removes_expired() {
        let mut c = small(100);
        for k in 0..4 {
            c.insert(k, "x", 0).unwrap();
        }
        // All four are expired by t=200; the fifth insert triggers reclaim.
        c.insert(10, "y", 200).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.lookup(&10, 200), Lookup::Fresh(&"y"));
    }

    #[test]
    fn hard_limit_refuses_when_nothing_reclaimable() {
        let mut params = Params::new(1_000_000);
        params.soft_limit = 2;
        params.hard_limit = 2;
        params.reclaim_percentage = 0;
        let mut c: Tcache<u32, u32> = Tcache::new(params);
        c.insert(1, 1, 0).unwrap();
        c.insert(2, 2, 0).unwrap();
        assert_eq!(c.insert(3, 3, 0), Err(CacheFull));
        // Replacing an existing key is always allowed.
        c.insert(2, 20, 0).unwrap();
        assert_eq!(c.lookup(&2, 1), Lookup::Fresh(&20));
    }

    #[test]
    fn reclaim_evicts_soonest_expiring_first() {
        let mut params = Params::new(1_000_000);
        params.soft_limit = 2;
        params.hard_limit = 10;
        params.reclaim_percentage = 34;
        let mut c: Tcache<u32, u32> = Tcache::new(params);
        c.insert_with_expiry(1, 1, 100, 0).unwrap();
        c.insert_with_expiry(2, 2, 50, 0).unwrap();
        c.insert_with_expiry(3, 3, 200, 0).unwrap();
        c.reclaim(0);
        // 3 entries * 34% = 1 victim: key 2 expires soonest.
        assert_eq!(c.lookup(&2, 0), Lookup::Miss);
        assert_eq!(c.lookup(&1, 0), Lookup::Fresh(&1));
        assert_eq!(c.lookup(&3, 0), Lookup::Fresh(&3));
    }

    #[test]
    fn remove_returns_value() {
        let mut c = small(100);
        c.insert(7, "gone", 0).unwrap();
        assert_eq!(c.remove(&7), Some("gone"));
        assert_eq!(c.lookup(&7, 0), Lookup::Miss);
    }
}
