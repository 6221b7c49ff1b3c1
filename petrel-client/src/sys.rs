//! The system interface: the seam between the client core and the Petrel
//! cluster engine.
//!
//! Every `isys_*` call is non-blocking: it validates arguments, queues the
//! operation, and returns an [`OpId`]. Completions are collected with
//! [`Sys::testany`], which is the request loop's only blocking point. The
//! `token` passed at submit time is returned verbatim in the completion so
//! the caller can route it back to its own state.
//!
//! The clustered engine lives outside this tree; [`local::LocalSys`] is the
//! embedded single-node engine used in standalone mode and by the tests.

pub mod local;

use std::path::Path;
use std::time::Duration;

use petrel_abi::dirent::ReaddirPage;
use petrel_abi::{RwxPair, WireAttr};

/// Scalar engine-side object handle.
pub type Handle = u64;

/// Filesystem identifier.
pub type FsId = i32;

/// Identifier of one posted non-blocking operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u64);

impl OpId {
    /// Sentinel for operations serviced inline (no engine round-trip).
    pub const INLINE: OpId = OpId(u64::MAX);
}

/// Engine-side object reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectRef {
    pub handle: Handle,
    pub fs_id: FsId,
}

impl ObjectRef {
    pub const NULL: Self = Self {
        handle: 0,
        fs_id: 0,
    };
}

/// A signed (uid, gid, timeout, issuer) token required by engine calls.
///
/// An empty signature marks a negative credential: usable for the current
/// call chain but never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    /// Absolute expiry, seconds since the epoch.
    pub timeout_secs: u64,
    pub issuer: String,
    pub signature: Vec<u8>,
}

impl Credential {
    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}

/// Per-operation hints: always the caller's uid, plus a host identifier
/// when event tracing is enabled.
#[derive(Debug, Clone, Default)]
pub struct Hints {
    pub uid: u32,
    pub host: Option<String>,
}

/// Attributes plus the optional heap-allocated link target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysAttr {
    pub attr: WireAttr,
    pub link_target: Option<String>,
}

/// A parsed `proto://server/fsname` mount entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub protocol: String,
    pub server: String,
    pub fs_name: String,
}

impl MountEntry {
    /// Parse the kernel-provided config-server string.
    pub fn parse(spec: &str) -> Option<Self> {
        let (protocol, rest) = spec.split_once("://")?;
        let (server, fs_name) = rest.split_once('/')?;
        if protocol.is_empty() || server.is_empty() || fs_name.is_empty() {
            return None;
        }
        Some(Self {
            protocol: protocol.to_string(),
            server: server.to_string(),
            fs_name: fs_name.to_string(),
        })
    }
}

/// Value returned by a completed operation.
#[derive(Debug, Clone, Default)]
pub enum SysReply {
    #[default]
    None,
    Ref(ObjectRef),
    Getattr(SysAttr),
    Readdir(ReaddirPage),
    ReaddirPlus {
        page: ReaddirPage,
        errors: Vec<i32>,
        attrs: Vec<SysAttr>,
    },
    Statfs(StatfsReply),
    /// `data` carries the bytes of a completed read; writes return `None`.
    Io {
        total_completed: i64,
        data: Option<Vec<u8>>,
    },
    GetXattr(Vec<u8>),
    ListXattr {
        token: u64,
        keys: Vec<Vec<u8>>,
    },
    Mount {
        fs_id: FsId,
        root_handle: Handle,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatfsReply {
    pub bytes_total: i64,
    pub bytes_available: i64,
    pub handles_total: i64,
    pub handles_available: i64,
}

/// One completed operation surfaced by [`Sys::testany`].
#[derive(Debug)]
pub struct Completion {
    pub op_id: OpId,
    /// Caller token passed at submit time.
    pub token: u64,
    /// Zero or a negative errno.
    pub error: i32,
    pub reply: SysReply,
}

/// Server-derived cache timeouts, consulted on mount and umount.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerCacheTimeouts {
    pub acache_ms: Option<u64>,
    pub ncache_ms: Option<u64>,
}

/// The non-blocking engine interface.
///
/// All submit methods return `Ok(OpId)` or a negative errno. Blocking
/// helpers (`ref_lookup`, `fs_remove`, `get_fs_key`) exist only for paths
/// the original protocol services synchronously.
#[allow(clippy::too_many_arguments)]
pub trait Sys {
    // -------------------------------------------------------------------
    // Non-blocking operations
    // -------------------------------------------------------------------
    fn isys_lookup(
        &mut self,
        parent: ObjectRef,
        name: &str,
        sym_follow: bool,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_create(
        &mut self,
        name: &str,
        parent: ObjectRef,
        attr: WireAttr,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_symlink(
        &mut self,
        name: &str,
        parent: ObjectRef,
        target: &str,
        attr: WireAttr,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_getattr(
        &mut self,
        refn: ObjectRef,
        mask: u32,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_setattr(
        &mut self,
        refn: ObjectRef,
        attr: WireAttr,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_remove(
        &mut self,
        name: &str,
        parent: ObjectRef,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_mkdir(
        &mut self,
        name: &str,
        parent: ObjectRef,
        attr: WireAttr,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_readdir(
        &mut self,
        refn: ObjectRef,
        dir_token: u64,
        count: u32,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_readdirplus(
        &mut self,
        refn: ObjectRef,
        dir_token: u64,
        count: u32,
        mask: u32,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_rename(
        &mut self,
        old_name: &str,
        old_parent: ObjectRef,
        new_name: &str,
        new_parent: ObjectRef,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_truncate(
        &mut self,
        refn: ObjectRef,
        size: i64,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_getxattr(
        &mut self,
        refn: ObjectRef,
        key: &[u8],
        max_value: usize,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_setxattr(
        &mut self,
        refn: ObjectRef,
        key: &[u8],
        value: &[u8],
        flags: i32,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_removexattr(
        &mut self,
        refn: ObjectRef,
        key: &[u8],
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_listxattr(
        &mut self,
        refn: ObjectRef,
        list_token: u64,
        count: u32,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_statfs(
        &mut self,
        fs_id: FsId,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    /// Contiguous file I/O. For writes `write_data` carries the bytes; for
    /// reads the completion carries them back.
    fn isys_io(
        &mut self,
        refn: ObjectRef,
        io_type: i32,
        offset: i64,
        len: usize,
        write_data: Option<Vec<u8>>,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    /// Scatter/gather file I/O over an explicit (offset, length) list.
    fn isys_io_list(
        &mut self,
        refn: ObjectRef,
        io_type: i32,
        pairs: &[RwxPair],
        write_data: Option<Vec<u8>>,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_fsync(
        &mut self,
        refn: ObjectRef,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    fn isys_fs_add(
        &mut self,
        mntent: &MountEntry,
        cred: &Credential,
        hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32>;

    // -------------------------------------------------------------------
    // Completion multiplexer and cancellation
    // -------------------------------------------------------------------

    /// Collect up to `max` completions, waiting at most `timeout`.
    fn testany(&mut self, max: usize, timeout: Duration) -> Vec<Completion>;

    /// Cancel a posted I/O operation. The operation still completes
    /// through `testany`, with `ECANCELED`.
    fn io_cancel(&mut self, op_id: OpId) -> Result<(), i32>;

    // -------------------------------------------------------------------
    // Blocking helpers
    // -------------------------------------------------------------------

    /// Blocking lookup of `name` under `parent`, used on the create
    /// recovery path.
    fn ref_lookup(
        &mut self,
        parent: ObjectRef,
        name: &str,
        cred: &Credential,
        sym_follow: bool,
    ) -> Result<ObjectRef, i32>;

    /// Remove a mounted filesystem.
    fn fs_remove(&mut self, mntent: &MountEntry) -> Result<(), i32>;

    /// The shared secret key for a filesystem.
    fn get_fs_key(&mut self, fs_id: FsId) -> Result<Vec<u8>, i32>;

    /// Generate a signed credential for (uid, gid).
    fn gen_credential(
        &mut self,
        uid: u32,
        gid: u32,
        timeout_secs: u64,
        keypath: Option<&Path>,
    ) -> Result<Credential, i32>;

    // -------------------------------------------------------------------
    // Configuration and counters
    // -------------------------------------------------------------------

    /// Cache timeouts derived from the mounted servers' configuration.
    fn server_cache_timeouts(&self) -> ServerCacheTimeouts;

    /// Read one engine-side cache parameter (acache/ncache/capcache).
    fn cache_param_get(&self, subsystem: u32, param: u32) -> Result<i64, i32>;

    /// Set one engine-side cache parameter.
    fn cache_param_set(&mut self, subsystem: u32, param: u32, value: i64) -> Result<(), i32>;

    /// Human-readable perf counter snapshot for a subsystem.
    fn perf_snapshot(&self, subsystem: u32) -> Option<String>;

    /// Configure perf counter history depth and rollover interval.
    fn set_perf_params(&mut self, subsystem: u32, history: u64, interval_secs: u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_entry_parses_config_server() {
        let m = MountEntry::parse("tcp://server1:3334/pfs").unwrap();
        assert_eq!(m.protocol, "tcp");
        assert_eq!(m.server, "server1:3334");
        assert_eq!(m.fs_name, "pfs");
    }

    #[test]
    fn mount_entry_rejects_malformed_specs() {
        assert!(MountEntry::parse("").is_none());
        assert!(MountEntry::parse("tcp://serveronly").is_none());
        assert!(MountEntry::parse("://server/fs").is_none());
        assert!(MountEntry::parse("tcp://server/").is_none());
    }

    #[test]
    fn negative_credential_is_unsigned() {
        let cred = Credential {
            uid: 1,
            gid: 1,
            timeout_secs: 0,
            issuer: String::new(),
            signature: Vec::new(),
        };
        assert!(!cred.is_signed());
    }
}
