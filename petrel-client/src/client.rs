//! The request-servicing core.
//!
//! A fixed ring of descriptors is parked against the device; each
//! iteration drains pending upcalls, dispatches them, then polls the
//! engine's `testany` for completions. Completion routing finishes
//! descriptors: sub-operation countdown for vectored I/O, waiter fan-out
//! for readahead fills, downcall write, and repost. The engine poll is the
//! loop's only blocking point.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use petrel_abi::{err, Downcall, DowncallData, IoDown, OpKind, Upcall, UpcallData, DOWNCALL_SIZE};

use crate::buffers::{BufferPool, PoolKind};
use crate::credcache::CredentialCache;
use crate::device::{UnexpectedInfo, VfsDevice};
use crate::dispatch::PostOutcome;
use crate::error::RunError;
use crate::inprogress::InProgressTable;
use crate::options::ClientOptions;
use crate::racache::{BlockId, RaLookup, ReadaheadCache};
use crate::remount::{RemountState, RemountStatus};
use crate::request::{RaState, ReqId, RequestSlab, MAX_NUM_OPS};
use crate::signals;
use crate::sys::{Credential, Hints, ObjectRef, OpId, Sys, SysReply};

/// Engine poll timeout per loop iteration.
pub const TEST_TIMEOUT_MS: u64 = 10;

/// Phantom descriptor slots beyond the unexpected ring.
const PHANTOM_SLOTS: usize = MAX_NUM_OPS;

pub struct ClientCore {
    pub(crate) opts: ClientOptions,
    pub(crate) dev: Box<dyn VfsDevice>,
    pub(crate) sys: Box<dyn Sys>,
    pub(crate) io_pool: BufferPool,
    pub(crate) dir_pool: BufferPool,
    pub(crate) slab: RequestSlab,
    pub(crate) parked: VecDeque<ReqId>,
    pub(crate) in_progress: InProgressTable,
    pub(crate) racache: ReadaheadCache,
    pub(crate) creds: CredentialCache,
    pub(crate) remount: Arc<RemountState>,
    pub(crate) next_mount_id: i32,
    pub(crate) host_hint: Option<String>,
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..len].to_vec()).ok()
}

impl ClientCore {
    pub fn new(
        opts: ClientOptions,
        dev: Box<dyn VfsDevice>,
        sys: Box<dyn Sys>,
        io_pool: BufferPool,
        dir_pool: BufferPool,
        remount: Arc<RemountState>,
    ) -> Self {
        let slab = RequestSlab::new(MAX_NUM_OPS, PHANTOM_SLOTS);
        let parked = (0..MAX_NUM_OPS).map(ReqId).collect();
        let racache = ReadaheadCache::new(
            opts.readahead_count,
            opts.readahead_size,
            opts.readahead_readcnt,
            opts.readahead_pinned,
        );
        let creds = CredentialCache::new(&opts.ccache, opts.keypath.clone().map(Into::into));
        let host_hint = hostname();
        Self {
            opts,
            dev,
            sys,
            io_pool,
            dir_pool,
            slab,
            parked,
            in_progress: InProgressTable::new(),
            racache,
            creds,
            remount,
            next_mount_id: 1,
            host_hint,
        }
    }

    // -----------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------

    /// Run until a termination signal is observed or the remount
    /// handshake fails.
    pub fn process_requests(&mut self) -> Result<(), RunError> {
        debug!("start processing loop");
        while !signals::stop_requested() {
            self.run_iteration(Duration::from_millis(TEST_TIMEOUT_MS));

            // A failed remount means the kernel still holds mount state we
            // can never learn; exit retriable and let the supervisor
            // restart us.
            if self.remount.status() == RemountStatus::Failed {
                debug!("remount not completed successfully, no longer handling requests");
                return Err(RunError::RemountFailed);
            }
        }
        info!(
            "client core caught signal {} - halt processing",
            signals::last_signal()
        );
        Ok(())
    }

    /// One loop iteration: drain device upcalls, then poll completions.
    /// Public so tests can drive the loop deterministically.
    pub fn run_iteration(&mut self, timeout: Duration) {
        while !self.parked.is_empty() {
            match self.dev.recv_unexpected() {
                Ok(Some(info)) => {
                    let id = self.parked.pop_front().expect("parked ring checked above");
                    self.handle_unexpected(id, info);
                }
                Ok(None) => break,
                Err(e) => {
                    // Short or failed device read: nothing was bound to a
                    // descriptor, so there is nothing to repost.
                    error!("device read failed: {e}");
                    break;
                }
            }
        }

        let completions = self.sys.testany(MAX_NUM_OPS, timeout);
        for completion in completions {
            self.handle_completion(completion);
        }
    }

    /// Release everything the loop still holds, in teardown order.
    pub fn shutdown(&mut self) {
        debug!("finalize ops in progress");
        self.in_progress.clear();
        self.parked.clear();
    }

    // -----------------------------------------------------------------
    // Unexpected (new upcall) handling
    // -----------------------------------------------------------------

    fn handle_unexpected(&mut self, id: ReqId, info: UnexpectedInfo) {
        let req = self.slab.get_mut(id);
        req.is_unexpected = false;
        req.tag = info.tag;

        let (up, trailer_bytes) = match Upcall::decode(&info.buf) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("short or invalid upcall from device ({e:?}); discarding");
                self.repost(id, "invalid device read");
                return;
            }
        };

        debug!(
            "[+] dev req: tag: {}, type: {}, trailer: {}",
            info.tag,
            up.kind.name(),
            up.trailer_size
        );

        // Before the remount handshake finishes, only the operations that
        // drive it (and cancels, which must never wait) are serviced.
        // Everything else is quietly discarded so the kernel retries.
        if self.remount.status() == RemountStatus::NotCompleted
            && !matches!(up.kind, OpKind::Mount | OpKind::Cancel | OpKind::Features)
        {
            debug!(
                "got a {} upcall before mounting; ignoring",
                up.kind.name()
            );
            self.repost(id, "mount pending");
            return;
        }

        // A duplicate tag is a kernel retry of an operation we are still
        // working on; discard it and let the original finish.
        if self.in_progress.contains(info.tag) {
            warn!(
                "duplicate upcall of type {} already in progress (tag={})",
                up.kind.name(),
                info.tag
            );
            self.repost(id, "op already in progress");
            return;
        }

        let trailer_len = (up.trailer_size.max(0) as usize).min(trailer_bytes.len());
        let req = self.slab.get_mut(id);
        req.upcall = Some(up);
        req.trailer = trailer_bytes[..trailer_len].to_vec();
        req.started = Some(Instant::now());
        req.num_ops = 1;
        req.num_incomplete_ops = 1;

        match self.dispatch(id, up) {
            Ok(PostOutcome::Posted) | Ok(PostOutcome::Waiting) => {
                let speculative = self.slab.get(id).is_speculative;
                debug_assert!(!speculative, "ring descriptors are never speculative");
                if self.in_progress.insert(info.tag, id).is_err() {
                    error!("tag {} reinserted while in progress", info.tag);
                }
            }
            Ok(PostOutcome::Inline) => {
                self.slab.get_mut(id).handled_inline = true;
                self.complete_inline(id);
            }
            Err(status) => {
                error!("post of op {} failed: {status}", up.kind.name());
                let req = self.slab.get_mut(id);
                let mut dc = Downcall::new(up.kind);
                dc.status = status;
                req.downcall = Some(dc);
                self.complete_inline(id);
            }
        }
    }

    /// Finish an inline-serviced request: credential scrub, downcall
    /// write, repost.
    fn complete_inline(&mut self, id: ReqId) {
        let (uid, gid, status) = {
            let req = self.slab.get(id);
            let up = req.upcall.as_ref().expect("inline request has an upcall");
            let status = req.downcall.as_ref().map(|d| d.status).unwrap_or(0);
            (up.uid, up.gid, status)
        };
        if status == err::EPERM || status == err::EACCES {
            self.creds.remove(uid, gid);
        }
        self.write_downcall_for(id);
        self.repost(id, "inlined completion");
    }

    // -----------------------------------------------------------------
    // Completion routing
    // -----------------------------------------------------------------

    fn handle_completion(&mut self, completion: crate::sys::Completion) {
        let slot = completion.token as usize;
        let id = ReqId(slot);
        {
            let req = match self.slab.try_get(id) {
                Some(req) => req,
                None => {
                    error!("completion token {slot} out of range");
                    return;
                }
            };
            if req.is_unexpected || req.upcall.is_none() {
                error!(
                    "op_id {:?} completed against a recycled descriptor",
                    completion.op_id
                );
                return;
            }
        }

        if self.slab.get(id).num_ops > 1 {
            self.handle_sub_completion(id, completion);
            return;
        }

        if self.slab.get(id).op_id != completion.op_id {
            error!(
                "op_id {:?} != completed op id {:?}",
                self.slab.get(id).op_id,
                completion.op_id
            );
            return;
        }

        let req = self.slab.get_mut(id);
        req.num_incomplete_ops -= 1;
        req.reply = completion.reply;
        self.finish_request(id, completion.error);
    }

    fn handle_sub_completion(&mut self, id: ReqId, completion: crate::sys::Completion) {
        let pos = {
            let req = self.slab.get(id);
            match req
                .sub_ops
                .iter()
                .position(|s| s.op_id == completion.op_id && !s.complete)
            {
                Some(pos) => pos,
                None => {
                    error!("completed op id {:?} is unknown", completion.op_id);
                    return;
                }
            }
        };

        // Scatter read data back into the shared slice at this group's
        // memory offset.
        if completion.error == 0 {
            if let SysReply::Io {
                total_completed,
                data,
            } = &completion.reply
            {
                let (mem_offset, buf_index) = {
                    let req = self.slab.get(id);
                    let buf_index = match req.upcall.as_ref().map(|u| u.data) {
                        Some(UpcallData::FileIox(iox)) => iox.buf_index,
                        _ => -1,
                    };
                    (req.sub_ops[pos].mem_offset, buf_index)
                };
                if let Some(data) = data {
                    if let Some(slice) = self.io_pool.slice_mut(buf_index) {
                        let end = (mem_offset + data.len()).min(slice.len());
                        if mem_offset < end {
                            slice[mem_offset..end].copy_from_slice(&data[..end - mem_offset]);
                        }
                    }
                }
                self.slab.get_mut(id).amt_complete += total_completed;
            }
        } else {
            self.slab.get_mut(id).error = completion.error;
        }

        let req = self.slab.get_mut(id);
        req.sub_ops[pos].complete = true;
        req.num_incomplete_ops -= 1;
        if req.num_incomplete_ops > 0 {
            return;
        }
        let error = req.error;
        self.finish_request(id, error);
    }

    fn log_timing(&self, id: ReqId) {
        let req = self.slab.get(id);
        if let (Some(up), Some(started)) = (&req.upcall, req.started) {
            debug!(
                target: "timing",
                "{} complete (tag {}) wtime = {:.6}s",
                up.kind.name(),
                req.tag,
                started.elapsed().as_secs_f64()
            );
        }
    }

    /// All sub-operations of a request have completed; route it to its
    /// finalization path.
    fn finish_request(&mut self, id: ReqId, error: i32) {
        self.log_timing(id);

        let (kind, ra_state) = {
            let req = self.slab.get(id);
            let kind = req.upcall.as_ref().map(|u| u.kind);
            (kind, req.racache_state)
        };

        if kind == Some(OpKind::FileIo) && ra_state == RaState::Posted {
            self.finish_racache_fill(id, error);
            return;
        }

        let req = self.slab.get(id);
        debug_assert!(!req.is_speculative, "phantoms only exist on the racache path");
        let tag = req.tag;
        let cancelled = req.was_cancelled;
        if self.in_progress.remove(tag).is_none() {
            error!("failed to remove op in progress from table (tag={tag})");
            self.repost(id, "error completion");
            return;
        }

        let mut error = error;
        self.package_downcall(id, &mut error);

        if cancelled {
            // Writing a cancelled I/O downcall is legal but pointless; the
            // kernel already gave up on the tag.
            debug!("skipping downcall write due to previous cancellation");
            self.repost(id, "cancellation");
        } else {
            self.write_downcall_for(id);
            self.repost(id, "normal completion");
        }
    }

    // -----------------------------------------------------------------
    // Readahead orchestration
    // -----------------------------------------------------------------

    /// The primary reader of a racache block completed its full-block
    /// read: fill the block, wake the waiters in arrival order, then
    /// consider extending the speculation chain.
    fn finish_racache_fill(&mut self, id: ReqId, error: i32) {
        let (speculative, cancelled, block, tag) = {
            let req = self.slab.get(id);
            (
                req.is_speculative,
                req.was_cancelled,
                req.racache_block,
                req.tag,
            )
        };

        if !speculative && self.in_progress.remove(tag).is_none() && !cancelled {
            error!("racache fill tag {tag} missing from in-progress table");
        }

        // Cancellation or flush already tore the block down; there is
        // nothing to fan out.
        let Some(block) = block else {
            if speculative {
                self.slab.free_phantom(id);
            } else {
                self.repost(id, "cancellation");
            }
            return;
        };
        if cancelled {
            self.racache.make_free(block);
            self.slab.get_mut(id).racache_block = None;
            if speculative {
                self.slab.free_phantom(id);
            } else {
                self.repost(id, "cancellation");
            }
            return;
        }

        if error == 0 {
            let data = match std::mem::take(&mut self.slab.get_mut(id).reply) {
                SysReply::Io {
                    data: Some(data), ..
                } => data,
                _ => Vec::new(),
            };
            self.racache.complete_fill(block, &data);
            if !speculative {
                self.check_for_speculative(id, block);
            }
        }

        self.racache.clear_primary(block);
        let waiters = self.racache.take_waiters(block);

        if speculative {
            debug!(target: "racache", "posted speculative read completed into block");
            self.slab.get_mut(id).racache_block = None;
            self.slab.free_phantom(id);
        } else {
            self.complete_cached_read(id, block, error);
        }

        for waiter in waiters {
            let wtag = self.slab.get(waiter).tag;
            if self.in_progress.remove(wtag).is_none() {
                error!("racache waiter tag {wtag} missing from in-progress table");
            }
            self.complete_cached_read(waiter, block, error);
        }

        if error != 0 || self.racache.is_being_freed(block) {
            self.racache.make_free(block);
        }
    }

    /// Complete one (non-speculative) request from a filled block: copy
    /// its byte range into its shared slice, write the downcall, repost.
    fn complete_cached_read(&mut self, id: ReqId, block: BlockId, error: i32) {
        let up = *self
            .slab
            .get(id)
            .upcall
            .as_ref()
            .expect("cached read has an upcall");
        let UpcallData::FileIo(io) = up.data else {
            error!("non-io request on a racache block");
            self.repost(id, "error completion");
            return;
        };

        let mut amt: i64 = 0;
        if error == 0 {
            let delta = io.offset - self.racache.file_offset(block);
            if delta >= 0 && (delta as usize) < self.racache.data_sz(block) {
                let delta = delta as usize;
                let n = (io.count.max(0) as usize).min(self.racache.data_sz(block) - delta);
                if let Some(slice) = self.io_pool.slice_mut(io.buf_index) {
                    let n = n.min(slice.len());
                    let src = &self.racache.buffer(block)[delta..delta + n];
                    slice[..n].copy_from_slice(src);
                    amt = n as i64;
                }
            }
        }

        let status = if error == err::ECANCELED {
            err::ETIMEDOUT
        } else {
            error
        };
        let req = self.slab.get_mut(id);
        let mut dc = Downcall::new(OpKind::FileIo);
        dc.status = status;
        dc.data = DowncallData::Io(IoDown { amt_complete: amt });
        req.downcall = Some(dc);
        req.racache_block = None;

        if error == err::EPERM || error == err::EACCES {
            self.creds.remove(up.uid, up.gid);
        }

        self.write_downcall_for(id);
        self.repost(id, "waiting completion");
    }

    /// Post a full-block read for `block` on behalf of `id` (real request
    /// or phantom).
    pub(crate) fn post_io_readahead(&mut self, id: ReqId, block: BlockId) -> Result<(), i32> {
        let up = *self
            .slab
            .get(id)
            .upcall
            .as_ref()
            .expect("readahead request has an upcall");
        let UpcallData::FileIo(io) = up.data else {
            return Err(err::EINVAL);
        };
        let refn = ObjectRef {
            handle: io.refn.khandle.to_handle(),
            fs_id: io.refn.fs_id,
        };
        let offset = self.racache.file_offset(block);
        let len = self.racache.buff_size();
        debug!(
            target: "racache",
            "posting block read ({}, {}) offset {offset} len {len}",
            refn.fs_id, refn.handle
        );

        let cred = self.credential(up.uid, up.gid);
        let hints = self.hints(up.uid);
        let op_id = self.sys.isys_io(
            refn,
            petrel_abi::io_type::READ,
            offset,
            len,
            None,
            &cred,
            &hints,
            id.0 as u64,
        )?;

        let req = self.slab.get_mut(id);
        req.op_id = op_id;
        req.racache_block = Some(block);
        req.racache_state = RaState::Posted;
        Ok(())
    }

    /// Extend the speculation chain after a full (non-EOF) block fill.
    pub(crate) fn check_for_speculative(&mut self, id: ReqId, prev_block: BlockId) {
        if self.slab.get(id).is_speculative {
            return;
        }
        if self.racache.data_sz(prev_block) < self.racache.buff_size() {
            debug!(target: "racache", "speculation stops at EOF");
            return;
        }
        let readcnt = self.racache.readcnt(prev_block);
        if readcnt < 1 {
            return;
        }

        let up = *self
            .slab
            .get(id)
            .upcall
            .as_ref()
            .expect("speculating request has an upcall");
        let UpcallData::FileIo(io) = up.data else {
            return;
        };
        let refn = ObjectRef {
            handle: io.refn.khandle.to_handle(),
            fs_id: io.refn.fs_id,
        };
        let base = self.racache.file_offset(prev_block);
        let block_size = self.racache.buff_size() as i64;

        debug!(
            target: "racache",
            "speculating up to {} blocks past offset {base}",
            readcnt - 1
        );
        for step in 1..readcnt {
            let offset = base + step as i64 * block_size;
            let Some(phantom) = self.slab.alloc_phantom() else {
                debug!(target: "racache", "phantom pool exhausted; speculation ends");
                return;
            };

            // The phantom borrows the parent's identity: same object, same
            // credentials, full-block extent, no kernel tag.
            let mut phantom_up = up;
            phantom_up.trailer_size = 0;
            if let UpcallData::FileIo(pio) = &mut phantom_up.data {
                pio.offset = offset;
                pio.count = block_size;
                pio.buf_index = -1;
            }
            {
                let req = self.slab.get_mut(phantom);
                req.upcall = Some(phantom_up);
                req.num_ops = 1;
                req.num_incomplete_ops = 1;
            }

            let (status, new_block) =
                self.racache
                    .get_block(refn, offset, block_size as usize, true, phantom);
            match (status, new_block) {
                (RaLookup::Read, Some(new_block)) => {
                    if let Err(e) = self.post_io_readahead(phantom, new_block) {
                        debug!(target: "racache", "speculative post failed: {e}");
                        self.racache.clear_primary(new_block);
                        self.racache.make_free(new_block);
                        self.slab.free_phantom(phantom);
                    }
                }
                (RaLookup::Hit { .. }, _) | (RaLookup::Wait, _) => {
                    // Another chain already covers this extent.
                    self.slab.free_phantom(phantom);
                }
                _ => {
                    debug!(target: "racache", "no block available; speculation ends");
                    self.slab.free_phantom(phantom);
                    return;
                }
            }
        }
    }

    /// Tear down every cache block for `refn` before a mutating operation
    /// proceeds.
    pub(crate) fn flush_racache(&mut self, refn: ObjectRef) {
        if !self.racache.enabled() {
            return;
        }
        debug!(
            target: "racache",
            "flushing blocks for ({}, {})", refn.fs_id, refn.handle
        );
        let teardowns = self.racache.flush(refn);
        for teardown in teardowns {
            if let Some(primary) = teardown.primary {
                let op_id = self.slab.get(primary).op_id;
                if self.sys.io_cancel(op_id).is_err() {
                    debug!(target: "racache", "block fill {op_id:?} already completed");
                }
                // The primary keeps its block reference: its (cancelled)
                // completion releases the block.
                self.slab.get_mut(primary).was_cancelled = true;
            }
            for waiter in teardown.waiters {
                let tag = self.slab.get(waiter).tag;
                self.in_progress.remove(tag);
                self.slab.get_mut(waiter).racache_block = None;
                // No downcall: the kernel retries the tag and the retry
                // takes the non-cached path.
                self.repost(waiter, "cache invalidation");
            }
            if teardown.primary.is_none() {
                self.racache.make_free(teardown.block);
            }
        }
    }

    // -----------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------

    /// Service a cancel upcall for `op_tag`. Returns the downcall status:
    /// `EINTR` when an I/O was cancelled, success when the target is gone
    /// or not cancellable (the cancel arrived too late).
    pub(crate) fn cancel_op_in_progress(&mut self, op_tag: u64) -> i32 {
        let Some(target) = self.in_progress.get(op_tag) else {
            debug!("op in progress cannot be found (tag = {op_tag})");
            return 0;
        };
        let kind = match self.slab.get(target).upcall.as_ref() {
            Some(up) => up.kind,
            None => return 0,
        };
        match kind {
            OpKind::FileIo => {
                debug!("cancelling I/O req from tag {op_tag}");
                if self.slab.get(target).racache_state != RaState::Wait {
                    let op_id = self.slab.get(target).op_id;
                    if let Err(e) = self.sys.io_cancel(op_id) {
                        debug!("io_cancel failed: {e}");
                    }
                }
                self.cancel_readahead_request(target);
                err::EINTR
            }
            OpKind::FileIox => {
                debug!("cancelling vectored I/O req from tag {op_tag}");
                let sub_ops: Vec<OpId> = self
                    .slab
                    .get(target)
                    .sub_ops
                    .iter()
                    .filter(|s| !s.complete)
                    .map(|s| s.op_id)
                    .collect();
                for op_id in sub_ops {
                    let _ = self.sys.io_cancel(op_id);
                }
                self.slab.get_mut(target).was_cancelled = true;
                err::EINTR
            }
            // Only I/O is cancellable; anything else means the operation
            // finished before the cancel arrived.
            _ => 0,
        }
    }

    /// Unwind a cancelled I/O request's readahead state. Idempotent via
    /// `was_cancelled`.
    pub(crate) fn cancel_readahead_request(&mut self, id: ReqId) {
        if self.slab.get(id).was_cancelled {
            return;
        }
        let state = self.slab.get(id).racache_state;
        let block = self.slab.get(id).racache_block;
        match state {
            RaState::Posted => {
                let Some(block) = block else {
                    error!("badly formed readahead cache structures");
                    return;
                };
                // Everyone queued behind this fill goes back to the kernel
                // for a retry; the block dies with the fill.
                let waiters = self.racache.take_waiters(block);
                for waiter in waiters {
                    let tag = self.slab.get(waiter).tag;
                    self.in_progress.remove(tag);
                    self.slab.get_mut(waiter).racache_block = None;
                    self.repost(waiter, "cancellation");
                }
                self.racache.clear_primary(block);
                self.racache.make_free(block);
                self.slab.get_mut(id).racache_block = None;
            }
            RaState::Wait => {
                if let Some(block) = block {
                    if !self.racache.remove_waiter(block, id) {
                        // Reached only if descriptor tracking is broken;
                        // property tests pin the invariant.
                        error!("tried to cancel waiting request not on wait list");
                    }
                }
                let tag = self.slab.get(id).tag;
                self.in_progress.remove(tag);
                self.slab.get_mut(id).racache_block = None;
                self.repost(id, "cancellation");
                return;
            }
            RaState::Hit | RaState::None => {}
        }
        self.slab.get_mut(id).was_cancelled = true;
    }

    // -----------------------------------------------------------------
    // Downcall write and repost
    // -----------------------------------------------------------------

    pub(crate) fn write_downcall_for(&mut self, id: ReqId) {
        let req = self.slab.get(id);
        let Some(mut dc) = req.downcall else {
            error!("downcall write without a packaged downcall (tag={})", req.tag);
            return;
        };
        let tag = req.tag;

        let trailer: Option<&[u8]> = match req.trailer_out {
            Some((PoolKind::Readdir, index, len)) => {
                dc.trailer_size = len as i64;
                self.dir_pool.slice(index).map(|s| &s[..len.min(s.len())])
            }
            Some((PoolKind::Io, index, len)) => {
                dc.trailer_size = len as i64;
                self.io_pool.slice(index).map(|s| &s[..len.min(s.len())])
            }
            None => None,
        };

        let mut buf = [0u8; DOWNCALL_SIZE];
        dc.encode(&mut buf);
        debug!("writing downcall for tag {tag}");
        if let Err(e) = self.dev.write_downcall(tag, &buf, trailer) {
            // The descriptor is reposted regardless; the kernel will time
            // the tag out.
            error!("write_downcall failed (tag={tag}): {e}");
        }
    }

    /// Wipe a descriptor and park it for the next upcall.
    pub(crate) fn repost(&mut self, id: ReqId, why: &str) {
        if self.slab.get(id).is_speculative {
            error!("tried to repost speculative request from {why}");
            return;
        }
        if self.in_progress.get(self.slab.get(id).tag) == Some(id) {
            error!("tried to repost request still on progress list");
            return;
        }
        self.slab.get_mut(id).wipe();
        self.parked.push_back(id);
        debug!("[-] reposted unexp req due to {why}");
    }

    // -----------------------------------------------------------------
    // Shared helpers for dispatch and downcall assembly
    // -----------------------------------------------------------------

    /// Clone a credential for (uid, gid); falls back to an unsigned
    /// credential when generation fails so the engine can reject it.
    pub(crate) fn credential(&mut self, uid: u32, gid: u32) -> Credential {
        self.creds
            .lookup(uid, gid, self.sys.as_mut())
            .unwrap_or(Credential {
                uid,
                gid,
                timeout_secs: 0,
                issuer: String::new(),
                signature: Vec::new(),
            })
    }

    pub(crate) fn hints(&self, uid: u32) -> Hints {
        Hints {
            uid,
            host: if self.opts.events.is_some() {
                self.host_hint.clone()
            } else {
                None
            },
        }
    }

    /// Re-derive acache/ncache timeouts from server configuration unless
    /// pinned on the command line. Runs on mount and umount.
    pub(crate) fn reset_cache_timeouts(&mut self) {
        use petrel_abi::{param_kind, subsystem};
        let server = self.sys.server_cache_timeouts();

        let acache_ms = if self.opts.acache.timeout_set {
            Some(self.opts.acache.timeout)
        } else {
            server.acache_ms
        };
        if let Some(ms) = acache_ms {
            let _ = self
                .sys
                .cache_param_set(subsystem::ACACHE, param_kind::TIMEOUT_MSECS, ms as i64);
        }

        let ncache_ms = if self.opts.ncache.timeout_set {
            Some(self.opts.ncache.timeout)
        } else {
            server.ncache_ms
        };
        if let Some(ms) = ncache_ms {
            let _ = self
                .sys
                .cache_param_set(subsystem::NCACHE, param_kind::TIMEOUT_MSECS, ms as i64);
        }
    }
}

// Read-side accessors, mostly for tests and the daemon front end.
impl ClientCore {
    pub fn racache(&self) -> &ReadaheadCache {
        &self.racache
    }

    pub fn credentials(&mut self) -> &mut CredentialCache {
        &mut self.creds
    }

    pub fn in_progress_len(&self) -> usize {
        self.in_progress.len()
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    pub fn io_pool(&self) -> &BufferPool {
        &self.io_pool
    }

    pub fn io_pool_mut(&mut self) -> &mut BufferPool {
        &mut self.io_pool
    }

    pub fn sys_mut(&mut self) -> &mut dyn Sys {
        self.sys.as_mut()
    }
}

impl std::fmt::Debug for ClientCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCore")
            .field("parked", &self.parked.len())
            .field("in_progress", &self.in_progress.len())
            .field("blocks_in_use", &self.racache.blocks_in_use())
            .finish()
    }
}
