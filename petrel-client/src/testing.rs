//! Test support: a scripted device and engine instrumentation.
//!
//! `MockDevice` stands in for the request character device: tests queue
//! upcalls on it and inspect the downcalls the core writes back.
//! `CountingSys` wraps any engine and counts submissions, letting tests
//! assert that coalesced or cached reads generated no extra engine
//! traffic.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use petrel_abi::{Downcall, DowncallHeader, Upcall, UPCALL_SIZE};

use crate::buffers::{BufferPool, PoolParams};
use crate::client::ClientCore;
use crate::device::{Remounter, UnexpectedInfo, VfsDevice};
use crate::options::ClientOptions;
use crate::remount::RemountState;
use crate::sys::Sys;

/// One downcall captured by the mock device.
#[derive(Debug, Clone)]
pub struct CapturedDowncall {
    pub tag: u64,
    pub header: DowncallHeader,
    pub payload: Vec<u8>,
    pub trailer: Option<Vec<u8>>,
}

#[derive(Default)]
struct MockState {
    incoming: VecDeque<UnexpectedInfo>,
    written: Vec<CapturedDowncall>,
}

/// Handle shared between the test and the core-owned device.
#[derive(Clone, Default)]
pub struct MockDeviceHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockDeviceHandle {
    /// Queue an upcall for the core's next device drain.
    pub fn push_upcall(&self, tag: u64, upcall: &Upcall, trailer: &[u8]) {
        let mut buf = vec![0u8; UPCALL_SIZE + trailer.len()];
        let mut upcall = *upcall;
        upcall.trailer_size = trailer.len() as i64;
        upcall.encode(&mut buf);
        buf[UPCALL_SIZE..].copy_from_slice(trailer);
        self.state
            .lock()
            .unwrap()
            .incoming
            .push_back(UnexpectedInfo { tag, buf });
    }

    /// Downcalls written so far, oldest first.
    pub fn written(&self) -> Vec<CapturedDowncall> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn take_written(&self) -> Vec<CapturedDowncall> {
        std::mem::take(&mut self.state.lock().unwrap().written)
    }
}

/// A device whose upcalls are scripted by the test.
pub struct MockDevice {
    handle: MockDeviceHandle,
}

impl MockDevice {
    pub fn new() -> (Self, MockDeviceHandle) {
        let handle = MockDeviceHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

struct NoopRemounter;

impl Remounter for NoopRemounter {
    fn remount(&self) -> io::Result<()> {
        Ok(())
    }
}

impl VfsDevice for MockDevice {
    fn recv_unexpected(&mut self) -> io::Result<Option<UnexpectedInfo>> {
        Ok(self.handle.state.lock().unwrap().incoming.pop_front())
    }

    fn write_downcall(
        &mut self,
        tag: u64,
        primary: &[u8],
        trailer: Option<&[u8]>,
    ) -> io::Result<()> {
        let header = Downcall::decode_header(primary)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short downcall"))?;
        let payload = primary[core::mem::size_of::<DowncallHeader>()..].to_vec();
        self.handle.state.lock().unwrap().written.push(CapturedDowncall {
            tag,
            header,
            payload,
            trailer: trailer.map(|t| t.to_vec()),
        });
        Ok(())
    }

    fn map_pools(
        &mut self,
        io: PoolParams,
        readdir: PoolParams,
    ) -> io::Result<(BufferPool, BufferPool)> {
        Ok((
            BufferPool::heap(io.count, io.size),
            BufferPool::heap(readdir.count, readdir.size),
        ))
    }

    fn remounter(&self) -> Box<dyn Remounter> {
        Box::new(NoopRemounter)
    }
}

/// Engine submission counters.
#[derive(Default)]
pub struct SysCounters {
    pub io: AtomicUsize,
    pub io_list: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl SysCounters {
    pub fn io_posts(&self) -> usize {
        self.io.load(Ordering::SeqCst)
    }

    pub fn io_list_posts(&self) -> usize {
        self.io_list.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

/// An engine wrapper that counts I/O submissions and cancellations.
pub struct CountingSys<S> {
    inner: S,
    counters: Arc<SysCounters>,
}

impl<S: Sys> CountingSys<S> {
    pub fn new(inner: S) -> (Self, Arc<SysCounters>) {
        let counters = Arc::new(SysCounters::default());
        (
            Self {
                inner,
                counters: Arc::clone(&counters),
            },
            counters,
        )
    }
}

impl<S: Sys> Sys for CountingSys<S> {
    fn isys_lookup(
        &mut self,
        parent: crate::sys::ObjectRef,
        name: &str,
        sym_follow: bool,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner.isys_lookup(parent, name, sym_follow, cred, hints, token)
    }

    fn isys_create(
        &mut self,
        name: &str,
        parent: crate::sys::ObjectRef,
        attr: petrel_abi::WireAttr,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner.isys_create(name, parent, attr, cred, hints, token)
    }

    fn isys_symlink(
        &mut self,
        name: &str,
        parent: crate::sys::ObjectRef,
        target: &str,
        attr: petrel_abi::WireAttr,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner
            .isys_symlink(name, parent, target, attr, cred, hints, token)
    }

    fn isys_getattr(
        &mut self,
        refn: crate::sys::ObjectRef,
        mask: u32,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner.isys_getattr(refn, mask, cred, hints, token)
    }

    fn isys_setattr(
        &mut self,
        refn: crate::sys::ObjectRef,
        attr: petrel_abi::WireAttr,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner.isys_setattr(refn, attr, cred, hints, token)
    }

    fn isys_remove(
        &mut self,
        name: &str,
        parent: crate::sys::ObjectRef,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner.isys_remove(name, parent, cred, hints, token)
    }

    fn isys_mkdir(
        &mut self,
        name: &str,
        parent: crate::sys::ObjectRef,
        attr: petrel_abi::WireAttr,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner.isys_mkdir(name, parent, attr, cred, hints, token)
    }

    fn isys_readdir(
        &mut self,
        refn: crate::sys::ObjectRef,
        dir_token: u64,
        count: u32,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner
            .isys_readdir(refn, dir_token, count, cred, hints, token)
    }

    fn isys_readdirplus(
        &mut self,
        refn: crate::sys::ObjectRef,
        dir_token: u64,
        count: u32,
        mask: u32,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner
            .isys_readdirplus(refn, dir_token, count, mask, cred, hints, token)
    }

    fn isys_rename(
        &mut self,
        old_name: &str,
        old_parent: crate::sys::ObjectRef,
        new_name: &str,
        new_parent: crate::sys::ObjectRef,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner
            .isys_rename(old_name, old_parent, new_name, new_parent, cred, hints, token)
    }

    fn isys_truncate(
        &mut self,
        refn: crate::sys::ObjectRef,
        size: i64,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner.isys_truncate(refn, size, cred, hints, token)
    }

    fn isys_getxattr(
        &mut self,
        refn: crate::sys::ObjectRef,
        key: &[u8],
        max_value: usize,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner
            .isys_getxattr(refn, key, max_value, cred, hints, token)
    }

    fn isys_setxattr(
        &mut self,
        refn: crate::sys::ObjectRef,
        key: &[u8],
        value: &[u8],
        flags: i32,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner
            .isys_setxattr(refn, key, value, flags, cred, hints, token)
    }

    fn isys_removexattr(
        &mut self,
        refn: crate::sys::ObjectRef,
        key: &[u8],
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner.isys_removexattr(refn, key, cred, hints, token)
    }

    fn isys_listxattr(
        &mut self,
        refn: crate::sys::ObjectRef,
        list_token: u64,
        count: u32,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner
            .isys_listxattr(refn, list_token, count, cred, hints, token)
    }

    fn isys_statfs(
        &mut self,
        fs_id: crate::sys::FsId,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner.isys_statfs(fs_id, cred, hints, token)
    }

    fn isys_io(
        &mut self,
        refn: crate::sys::ObjectRef,
        io_type: i32,
        offset: i64,
        len: usize,
        write_data: Option<Vec<u8>>,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.counters.io.fetch_add(1, Ordering::SeqCst);
        self.inner
            .isys_io(refn, io_type, offset, len, write_data, cred, hints, token)
    }

    fn isys_io_list(
        &mut self,
        refn: crate::sys::ObjectRef,
        io_type: i32,
        pairs: &[petrel_abi::RwxPair],
        write_data: Option<Vec<u8>>,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.counters.io_list.fetch_add(1, Ordering::SeqCst);
        self.inner
            .isys_io_list(refn, io_type, pairs, write_data, cred, hints, token)
    }

    fn isys_fsync(
        &mut self,
        refn: crate::sys::ObjectRef,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner.isys_fsync(refn, cred, hints, token)
    }

    fn isys_fs_add(
        &mut self,
        mntent: &crate::sys::MountEntry,
        cred: &crate::sys::Credential,
        hints: &crate::sys::Hints,
        token: u64,
    ) -> Result<crate::sys::OpId, i32> {
        self.inner.isys_fs_add(mntent, cred, hints, token)
    }

    fn testany(&mut self, max: usize, timeout: Duration) -> Vec<crate::sys::Completion> {
        self.inner.testany(max, timeout)
    }

    fn io_cancel(&mut self, op_id: crate::sys::OpId) -> Result<(), i32> {
        self.counters.cancels.fetch_add(1, Ordering::SeqCst);
        self.inner.io_cancel(op_id)
    }

    fn ref_lookup(
        &mut self,
        parent: crate::sys::ObjectRef,
        name: &str,
        cred: &crate::sys::Credential,
        sym_follow: bool,
    ) -> Result<crate::sys::ObjectRef, i32> {
        self.inner.ref_lookup(parent, name, cred, sym_follow)
    }

    fn fs_remove(&mut self, mntent: &crate::sys::MountEntry) -> Result<(), i32> {
        self.inner.fs_remove(mntent)
    }

    fn get_fs_key(&mut self, fs_id: crate::sys::FsId) -> Result<Vec<u8>, i32> {
        self.inner.get_fs_key(fs_id)
    }

    fn gen_credential(
        &mut self,
        uid: u32,
        gid: u32,
        timeout_secs: u64,
        keypath: Option<&std::path::Path>,
    ) -> Result<crate::sys::Credential, i32> {
        self.inner.gen_credential(uid, gid, timeout_secs, keypath)
    }

    fn server_cache_timeouts(&self) -> crate::sys::ServerCacheTimeouts {
        self.inner.server_cache_timeouts()
    }

    fn cache_param_get(&self, subsystem: u32, param: u32) -> Result<i64, i32> {
        self.inner.cache_param_get(subsystem, param)
    }

    fn cache_param_set(&mut self, subsystem: u32, param: u32, value: i64) -> Result<(), i32> {
        self.inner.cache_param_set(subsystem, param, value)
    }

    fn perf_snapshot(&self, subsystem: u32) -> Option<String> {
        self.inner.perf_snapshot(subsystem)
    }

    fn set_perf_params(&mut self, subsystem: u32, history: u64, interval_secs: u64) {
        self.inner.set_perf_params(subsystem, history, interval_secs)
    }
}

/// Build a core wired to a mock device and the given engine, with the
/// remount handshake already complete.
pub fn harness(opts: ClientOptions, sys: Box<dyn Sys>) -> (ClientCore, MockDeviceHandle) {
    harness_with_remount(opts, sys, RemountState::completed())
}

/// Like [`harness`], but with an explicit remount state (for pre-mount
/// gating tests).
pub fn harness_with_remount(
    opts: ClientOptions,
    sys: Box<dyn Sys>,
    remount: std::sync::Arc<RemountState>,
) -> (ClientCore, MockDeviceHandle) {
    let (mut dev, handle) = MockDevice::new();
    let (io_pool, dir_pool) = dev
        .map_pools(
            PoolParams {
                count: opts.desc_count,
                size: opts.desc_size,
            },
            PoolParams {
                count: 8,
                size: 65536,
            },
        )
        .expect("heap pools cannot fail");
    let core = ClientCore::new(opts, Box::new(dev), sys, io_pool, dir_pool, remount);
    (core, handle)
}
