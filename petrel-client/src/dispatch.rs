//! Per-kind upcall handlers.
//!
//! Each handler fills hints and a credential clone, converts the 16-byte
//! kernel handle into the engine's scalar reference, allocates bounded
//! response buffers, and submits the non-blocking engine call. Inline-only
//! kinds (umount, perf, param, fs-key, cancel, features, ra-flush) never
//! touch the engine: they build their downcall synchronously.

use log::{debug, error};

use petrel_abi::{
    err, io_type, Downcall, DowncallData, FeaturesDown, FsKeyDown, IoDown, IoRequest, IoxRequest,
    KernelRef, OpKind, ParamDown, ParamRequest, PerfCountDown, Upcall, UpcallData, FS_KEY_MAX,
    MAX_DIRENTS, MAX_XATTR_LIST, MAX_XATTR_VALUE, PERF_BUF_SIZE, RA_READCNT_UNSET,
};

use crate::client::ClientCore;
use crate::iox::{parse_trailer, split_groups};
use crate::racache::RaLookup;
use crate::request::{RaState, ReqId, SubOp};
use crate::sys::{MountEntry, ObjectRef, OpId};

/// How a dispatched upcall left the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// A non-blocking engine operation was submitted.
    Posted,
    /// The request joined a racache block's waiter queue; no engine
    /// operation exists, but the tag is cancellable and in progress.
    Waiting,
    /// The downcall was produced synchronously.
    Inline,
}

fn obj(kref: &KernelRef) -> ObjectRef {
    ObjectRef {
        handle: kref.khandle.to_handle(),
        fs_id: kref.fs_id,
    }
}

impl ClientCore {
    pub(crate) fn dispatch(&mut self, id: ReqId, up: Upcall) -> Result<PostOutcome, i32> {
        match up.data {
            UpcallData::Lookup(args) => {
                debug!(
                    "got a lookup request for {} (fsid {})",
                    args.name.as_str(),
                    args.parent.fs_id
                );
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self.sys.isys_lookup(
                    obj(&args.parent),
                    args.name.as_str(),
                    args.sym_follow != 0,
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::Create(args) => {
                debug!(
                    "got a create request for {} (fsid {})",
                    args.name.as_str(),
                    args.parent.fs_id
                );
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self.sys.isys_create(
                    args.name.as_str(),
                    obj(&args.parent),
                    args.attributes,
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::Symlink(args) => {
                debug!(
                    "got a symlink request from {} to {}",
                    args.name.as_str(),
                    args.target.as_str()
                );
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self.sys.isys_symlink(
                    args.name.as_str(),
                    obj(&args.parent),
                    args.target.as_str(),
                    args.attributes,
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::Getattr(args) => {
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id =
                    self.sys
                        .isys_getattr(obj(&args.refn), args.mask, &cred, &hints, id.0 as u64)?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::Setattr(args) => {
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self.sys.isys_setattr(
                    obj(&args.refn),
                    args.attributes,
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::Remove(args) => {
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self.sys.isys_remove(
                    args.name.as_str(),
                    obj(&args.parent),
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                if !args.refn.khandle.is_null() {
                    self.flush_racache(obj(&args.refn));
                }
                Ok(PostOutcome::Posted)
            }
            UpcallData::Mkdir(args) => {
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self.sys.isys_mkdir(
                    args.name.as_str(),
                    obj(&args.parent),
                    args.attributes,
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::Readdir(args) => {
                self.dir_pool.slice(args.buf_index).ok_or(err::EINVAL)?;
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let count = args.count.min(MAX_DIRENTS as u32);
                let op_id = self.sys.isys_readdir(
                    obj(&args.refn),
                    args.token,
                    count,
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::ReaddirPlus(args) => {
                self.dir_pool.slice(args.buf_index).ok_or(err::EINVAL)?;
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let count = args.count.min(MAX_DIRENTS as u32);
                let op_id = self.sys.isys_readdirplus(
                    obj(&args.refn),
                    args.token,
                    count,
                    args.mask,
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::Rename(args) => {
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self.sys.isys_rename(
                    args.old_name.as_str(),
                    obj(&args.old_parent),
                    args.new_name.as_str(),
                    obj(&args.new_parent),
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::Truncate(args) => {
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self.sys.isys_truncate(
                    obj(&args.refn),
                    args.size,
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                self.flush_racache(obj(&args.refn));
                Ok(PostOutcome::Posted)
            }
            UpcallData::GetXattr(args) => {
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self.sys.isys_getxattr(
                    obj(&args.refn),
                    args.key.as_bytes(),
                    MAX_XATTR_VALUE,
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::SetXattr(args) => {
                let value = {
                    let req = self.slab.get(id);
                    let val_sz = args.val_sz as usize;
                    if val_sz > MAX_XATTR_VALUE || val_sz > req.trailer.len() {
                        return Err(err::EINVAL);
                    }
                    req.trailer[..val_sz].to_vec()
                };
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self.sys.isys_setxattr(
                    obj(&args.refn),
                    args.key.as_bytes(),
                    &value,
                    args.flags,
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::RemoveXattr(args) => {
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self.sys.isys_removexattr(
                    obj(&args.refn),
                    args.key.as_bytes(),
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::ListXattr(args) => {
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let count = args.requested_count.min(MAX_XATTR_LIST as u32);
                let op_id = self.sys.isys_listxattr(
                    obj(&args.refn),
                    args.token,
                    count,
                    &cred,
                    &hints,
                    id.0 as u64,
                )?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::Statfs(args) => {
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self
                    .sys
                    .isys_statfs(args.fs_id, &cred, &hints, id.0 as u64)?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::Mount(args) => {
                let spec = args.config_server.as_str();
                debug!("got a mount request via {spec}");
                let mntent = MountEntry::parse(spec).ok_or(err::EINVAL)?;
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self
                    .sys
                    .isys_fs_add(&mntent, &cred, &hints, id.0 as u64)?;
                self.slab.get_mut(id).op_id = op_id;
                Ok(PostOutcome::Posted)
            }
            UpcallData::FileIo(args) => self.post_io(id, up, args),
            UpcallData::FileIox(args) => self.post_iox(id, up, args),
            UpcallData::Fsync(args) => {
                debug!("got a flush request for ({}, {})", args.refn.fs_id, args.refn.khandle.to_handle());
                let cred = self.credential(up.uid, up.gid);
                let hints = self.hints(up.uid);
                let op_id = self
                    .sys
                    .isys_fsync(obj(&args.refn), &cred, &hints, id.0 as u64)?;
                self.slab.get_mut(id).op_id = op_id;
                self.flush_racache(obj(&args.refn));
                Ok(PostOutcome::Posted)
            }

            // Inline-only kinds below: no engine round-trip, downcall built
            // synchronously, sentinel op id.
            UpcallData::Umount(args) => {
                let status = match MountEntry::parse(args.config_server.as_str()) {
                    Some(mntent) => match self.sys.fs_remove(&mntent) {
                        Ok(()) => {
                            self.reset_cache_timeouts();
                            0
                        }
                        Err(e) => {
                            error!("failed to umount via {}", args.config_server.as_str());
                            e
                        }
                    },
                    None => err::EINVAL,
                };
                self.finish_inline(id, {
                    let mut dc = Downcall::new(OpKind::Umount);
                    dc.status = status;
                    dc
                })
            }
            UpcallData::PerfCount(args) => {
                let mut dc = Downcall::new(OpKind::PerfCount);
                match self.sys.perf_snapshot(args.kind) {
                    Some(text) => {
                        let mut down = PerfCountDown {
                            buffer: [0; PERF_BUF_SIZE],
                        };
                        let bytes = text.as_bytes();
                        let n = bytes.len().min(PERF_BUF_SIZE - 1);
                        down.buffer[..n].copy_from_slice(&bytes[..n]);
                        dc.data = DowncallData::PerfCount(down);
                    }
                    None => dc.status = err::EINVAL,
                }
                self.finish_inline(id, dc)
            }
            UpcallData::Param(args) => {
                let dc = self.service_param(args);
                self.finish_inline(id, dc)
            }
            UpcallData::FsKey(args) => {
                let mut dc = Downcall::new(OpKind::FsKey);
                match self.sys.get_fs_key(args.fs_id) {
                    Ok(key) => {
                        let mut down = FsKeyDown {
                            keylen: 0,
                            _pad: 0,
                            key: [0; FS_KEY_MAX],
                        };
                        let n = key.len().min(FS_KEY_MAX);
                        down.key[..n].copy_from_slice(&key[..n]);
                        down.keylen = n as i32;
                        dc.data = DowncallData::FsKey(down);
                    }
                    Err(e) => dc.status = e,
                }
                self.finish_inline(id, dc)
            }
            UpcallData::RaFlush(args) => {
                self.flush_racache(obj(&args.refn));
                self.finish_inline(id, Downcall::new(OpKind::RaFlush))
            }
            UpcallData::Cancel(args) => {
                let status = self.cancel_op_in_progress(args.op_tag);
                let mut dc = Downcall::new(OpKind::Cancel);
                dc.status = status;
                self.finish_inline(id, dc)
            }
            UpcallData::Features(_) => {
                let mut dc = Downcall::new(OpKind::Features);
                dc.data = DowncallData::Features(FeaturesDown {
                    features: if self.racache.enabled() {
                        petrel_abi::FEATURE_READAHEAD
                    } else {
                        0
                    },
                });
                self.finish_inline(id, dc)
            }
        }
    }

    fn finish_inline(&mut self, id: ReqId, dc: Downcall) -> Result<PostOutcome, i32> {
        let req = self.slab.get_mut(id);
        req.op_id = OpId::INLINE;
        req.num_incomplete_ops = 0;
        req.downcall = Some(dc);
        Ok(PostOutcome::Inline)
    }

    fn service_param(&mut self, args: ParamRequest) -> Downcall {
        use petrel_abi::{param_op, subsystem};
        let mut dc = Downcall::new(OpKind::Param);
        let result: Result<i64, i32> = match (args.op, args.subsystem) {
            (param_op::GET, subsystem::CCACHE) => self.creds.param_get(args.param),
            (param_op::SET, subsystem::CCACHE) => {
                self.creds.param_set(args.param, args.value).map(|_| 0)
            }
            (param_op::GET, sub) => self.sys.cache_param_get(sub, args.param),
            (param_op::SET, sub) => self
                .sys
                .cache_param_set(sub, args.param, args.value)
                .map(|_| 0),
            _ => Err(err::EINVAL),
        };
        match result {
            Ok(value) => dc.data = DowncallData::Param(ParamDown { value }),
            Err(e) => dc.status = e,
        }
        dc
    }

    /// File I/O: reads may be served from, wait on, or fill a readahead
    /// block; writes invalidate the object's blocks first. Everything else
    /// is a plain engine transfer through the shared slice.
    fn post_io(&mut self, id: ReqId, up: Upcall, args: IoRequest) -> Result<PostOutcome, i32> {
        let refn = obj(&args.refn);

        if args.io_type == io_type::READ {
            debug!(
                target: "racache",
                "new read: {} bytes at {} (readahead {})",
                args.count, args.offset, args.readahead_size
            );
            if self.racache.eligible(args.count, args.readahead_size) {
                let (status, block) =
                    self.racache
                        .get_block(refn, args.offset, args.count.max(0) as usize, false, id);
                if let Some(block) = block {
                    if args.readahead_size != RA_READCNT_UNSET {
                        let readcnt = self.racache.readcnt_for(args.readahead_size);
                        self.racache.set_readcnt(block, readcnt);
                    }
                }
                match status {
                    RaLookup::Hit { amt } if amt >= args.count.max(0) as usize => {
                        debug!(target: "racache", "readahead cache hit");
                        let block = block.expect("hit carries a block");
                        let delta = (args.offset - self.racache.file_offset(block)) as usize;
                        let slice = self.io_pool.slice_mut(args.buf_index).ok_or(err::EINVAL)?;
                        let n = amt.min(slice.len());
                        slice[..n].copy_from_slice(&self.racache.buffer(block)[delta..delta + n]);

                        let req = self.slab.get_mut(id);
                        req.racache_state = RaState::Hit;
                        let mut dc = Downcall::new(OpKind::FileIo);
                        dc.data = DowncallData::Io(IoDown {
                            amt_complete: n as i64,
                        });
                        req.downcall = Some(dc);
                        req.op_id = OpId::INLINE;
                        req.num_incomplete_ops = 0;

                        self.check_for_speculative(id, block);
                        return Ok(PostOutcome::Inline);
                    }
                    RaLookup::Hit { .. } => {
                        // Short data near the filled edge; take the plain
                        // path rather than splicing two sources.
                        debug!(target: "racache", "hit with insufficient data");
                    }
                    RaLookup::Wait => {
                        debug!(target: "racache", "readahead cache wait");
                        let req = self.slab.get_mut(id);
                        req.racache_state = RaState::Wait;
                        req.racache_block = block;
                        return Ok(PostOutcome::Waiting);
                    }
                    RaLookup::Read => {
                        debug!(target: "racache", "readahead cache read");
                        let block = block.expect("read carries a block");
                        match self.post_io_readahead(id, block) {
                            Ok(()) => return Ok(PostOutcome::Posted),
                            Err(e) => {
                                debug!(target: "racache", "readahead posting failed: {e}");
                                self.racache.clear_primary(block);
                                self.racache.make_free(block);
                                let req = self.slab.get_mut(id);
                                req.racache_state = RaState::None;
                                req.racache_block = None;
                            }
                        }
                    }
                    RaLookup::None => {
                        debug!(target: "racache", "no block available");
                    }
                }
            }
        } else {
            // Write consistency: tear down cached blocks before the write
            // is submitted.
            self.flush_racache(refn);
        }

        let len = args.count.max(0) as usize;
        debug!(
            "posted {}: off {} size {} tag {}",
            if args.io_type == io_type::READ { "read" } else { "write" },
            args.offset,
            len,
            self.slab.get(id).tag
        );

        let slice = self.io_pool.slice(args.buf_index).ok_or(err::EINVAL)?;
        let write_data = if args.io_type == io_type::WRITE {
            Some(slice[..len.min(slice.len())].to_vec())
        } else {
            None
        };

        let cred = self.credential(up.uid, up.gid);
        let hints = self.hints(up.uid);
        let op_id = self.sys.isys_io(
            refn,
            args.io_type,
            args.offset,
            len,
            write_data,
            &cred,
            &hints,
            id.0 as u64,
        )?;
        self.slab.get_mut(id).op_id = op_id;
        Ok(PostOutcome::Posted)
    }

    /// Vectored I/O: split the trailer's (offset, length) pairs into
    /// hindexed groups, one engine sub-operation each. All groups share
    /// the slice and credential; a failed submission cancels the rest.
    fn post_iox(&mut self, id: ReqId, up: Upcall, args: IoxRequest) -> Result<PostOutcome, i32> {
        let refn = obj(&args.refn);
        let pairs = parse_trailer(&self.slab.get(id).trailer)?;
        let groups = split_groups(&pairs);
        debug!(
            "{}: {} pairs in {} groups",
            if args.io_type == io_type::READ { "readx" } else { "writex" },
            pairs.len(),
            groups.len()
        );

        if args.io_type == io_type::WRITE {
            self.flush_racache(refn);
        }

        let slice_len = self
            .io_pool
            .slice(args.buf_index)
            .ok_or(err::EINVAL)?
            .len();

        let cred = self.credential(up.uid, up.gid);
        let hints = self.hints(up.uid);
        let mut sub_ops: Vec<SubOp> = Vec::with_capacity(groups.len());
        for group in &groups {
            let write_data = if args.io_type == io_type::WRITE {
                if group.mem_offset + group.mem_len > slice_len {
                    break;
                }
                let slice = self.io_pool.slice(args.buf_index).ok_or(err::EINVAL)?;
                Some(slice[group.mem_offset..group.mem_offset + group.mem_len].to_vec())
            } else {
                None
            };
            let group_pairs = &pairs[group.pairs_start..group.pairs_start + group.pairs_len];
            match self.sys.isys_io_list(
                refn,
                args.io_type,
                group_pairs,
                write_data,
                &cred,
                &hints,
                id.0 as u64,
            ) {
                Ok(op_id) => sub_ops.push(SubOp {
                    op_id,
                    mem_offset: group.mem_offset,
                    len: group.mem_len,
                    complete: false,
                }),
                Err(e) => {
                    // All-or-nothing: unwind the groups already in flight.
                    for sub in &sub_ops {
                        let _ = self.sys.io_cancel(sub.op_id);
                    }
                    return Err(e);
                }
            }
        }
        if sub_ops.len() != groups.len() {
            for sub in &sub_ops {
                let _ = self.sys.io_cancel(sub.op_id);
            }
            return Err(err::EINVAL);
        }

        let req = self.slab.get_mut(id);
        req.num_ops = sub_ops.len();
        req.num_incomplete_ops = sub_ops.len();
        req.op_id = sub_ops[0].op_id;
        req.sub_ops = sub_ops;
        Ok(PostOutcome::Posted)
    }
}
