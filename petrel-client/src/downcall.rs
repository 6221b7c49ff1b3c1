//! Downcall assembly.
//!
//! Packages a completed operation into its downcall, rewriting error codes
//! where the kernel expects something other than what the engine reports:
//! a create that failed with `EEXIST` is recovered through a lookup (the
//! kernel's open path handles `O_EXCL` itself, so existence is success
//! here), and cancelled I/O surfaces as `ETIMEDOUT`. Permission errors
//! evict the caller's cached credential before the downcall goes out.

use log::{debug, error};

use petrel_abi::dirent::{encode_dirents, encode_readdirplus, PlusEntry};
use petrel_abi::{
    err, Downcall, DowncallData, GetXattrDown, GetattrDown, IoDown, KernelRef, ListXattrDown,
    MountDown, ReaddirDown, RefDown, StatfsDown, UpcallData, WireName, MAX_XATTR_VALUE,
    XATTR_LIST_BUF,
};

use crate::buffers::PoolKind;
use crate::client::ClientCore;
use crate::request::ReqId;
use crate::sys::{ObjectRef, SysReply};

fn kref(refn: ObjectRef) -> KernelRef {
    KernelRef::new(refn.handle, refn.fs_id)
}

fn ref_down(reply: &SysReply, error: i32) -> RefDown {
    match (error, reply) {
        (0, SysReply::Ref(refn)) => RefDown { refn: kref(*refn) },
        _ => RefDown {
            refn: KernelRef::NULL,
        },
    }
}

impl ClientCore {
    /// Build `req.downcall` from the completed operation's reply. May
    /// rewrite `error` (create recovery, cancellation mapping).
    pub(crate) fn package_downcall(&mut self, id: ReqId, error: &mut i32) {
        let up = *self
            .slab
            .get(id)
            .upcall
            .as_ref()
            .expect("completed request has an upcall");
        debug!(
            "packaging downcall: op {} error code: {}",
            up.kind.name(),
            *error
        );

        let reply = std::mem::take(&mut self.slab.get_mut(id).reply);
        let mut dc = Downcall::new(up.kind);

        match up.data {
            UpcallData::Lookup(_) => {
                dc.data = DowncallData::Ref(ref_down(&reply, *error));
            }
            UpcallData::Create(args) => {
                if *error == err::EEXIST {
                    // The object already exists. Look it up and report
                    // success with its reference; only if even the lookup
                    // fails does the caller see an error (access denied,
                    // since the name is demonstrably taken).
                    let cred = self.credential(up.uid, up.gid);
                    let parent = ObjectRef {
                        handle: args.parent.khandle.to_handle(),
                        fs_id: args.parent.fs_id,
                    };
                    match self
                        .sys
                        .ref_lookup(parent, args.name.as_str(), &cred, true)
                    {
                        Ok(refn) => {
                            debug!("overwriting error code EEXIST with 0 (create)");
                            *error = 0;
                            dc.data = DowncallData::Ref(RefDown { refn: kref(refn) });
                        }
                        Err(e) => {
                            error!(
                                "lookup failed in create failure path: {e} (name {})",
                                args.name.as_str()
                            );
                            *error = err::EACCES;
                            dc.data = DowncallData::Ref(RefDown {
                                refn: KernelRef::NULL,
                            });
                        }
                    }
                } else {
                    dc.data = DowncallData::Ref(ref_down(&reply, *error));
                }
            }
            UpcallData::Symlink(_) | UpcallData::Mkdir(_) => {
                dc.data = DowncallData::Ref(ref_down(&reply, *error));
            }
            UpcallData::Getattr(_) => {
                if *error == 0 {
                    if let SysReply::Getattr(sys_attr) = &reply {
                        // The link target is copied into the fixed inline
                        // field; its heap allocation dies with the reply.
                        let link_target = sys_attr
                            .link_target
                            .as_deref()
                            .map(WireName::from_str)
                            .unwrap_or(WireName::EMPTY);
                        dc.data = DowncallData::Getattr(GetattrDown {
                            attributes: sys_attr.attr,
                            link_target,
                        });
                    }
                }
            }
            UpcallData::Readdir(args) => {
                if *error == 0 {
                    if let SysReply::Readdir(page) = &reply {
                        match self.dir_pool.slice_mut(args.buf_index) {
                            Some(slice) => match encode_dirents(page, slice) {
                                Ok(len) => {
                                    dc.data = DowncallData::Readdir(ReaddirDown {
                                        token: page.token,
                                        directory_version: page.directory_version,
                                        entry_count: page.entries.len() as u32,
                                        _pad: 0,
                                    });
                                    self.slab.get_mut(id).trailer_out =
                                        Some((PoolKind::Readdir, args.buf_index, len));
                                }
                                Err(e) => {
                                    error!("dirent encoding failed: {e:?}");
                                    *error = err::EINVAL;
                                }
                            },
                            None => *error = err::EINVAL,
                        }
                    }
                }
            }
            UpcallData::ReaddirPlus(args) => {
                if *error == 0 {
                    if let SysReply::ReaddirPlus {
                        page,
                        errors,
                        attrs,
                    } = &reply
                    {
                        let plus: Vec<PlusEntry> = errors
                            .iter()
                            .zip(attrs)
                            .map(|(e, a)| PlusEntry {
                                error: *e,
                                attr: a.attr,
                                link_target: a.link_target.clone(),
                            })
                            .collect();
                        match self.dir_pool.slice_mut(args.buf_index) {
                            Some(slice) => match encode_readdirplus(page, &plus, slice) {
                                Ok(len) => {
                                    dc.data = DowncallData::Readdir(ReaddirDown {
                                        token: page.token,
                                        directory_version: page.directory_version,
                                        entry_count: page.entries.len() as u32,
                                        _pad: 0,
                                    });
                                    self.slab.get_mut(id).trailer_out =
                                        Some((PoolKind::Readdir, args.buf_index, len));
                                }
                                Err(e) => {
                                    error!("direntplus encoding failed: {e:?}");
                                    *error = err::EINVAL;
                                }
                            },
                            None => *error = err::EINVAL,
                        }
                    }
                }
            }
            UpcallData::Statfs(_) => {
                if *error == 0 {
                    if let SysReply::Statfs(statfs) = &reply {
                        // Report block counts in data-plane transfer units
                        // so kernel-side size math matches the I/O pool.
                        let block_size = self.io_pool.slice_size() as i64;
                        dc.data = DowncallData::Statfs(StatfsDown {
                            block_size,
                            blocks_total: statfs.bytes_total / block_size,
                            blocks_avail: statfs.bytes_available / block_size,
                            files_total: statfs.handles_total,
                            files_avail: statfs.handles_available,
                        });
                    }
                }
            }
            UpcallData::FileIo(args) => {
                // Cancellation is modelled as a timeout above this layer.
                if *error == err::ECANCELED {
                    *error = err::ETIMEDOUT;
                }
                let mut amt = 0i64;
                if *error == 0 {
                    if let SysReply::Io {
                        total_completed,
                        data,
                    } = &reply
                    {
                        amt = *total_completed;
                        if let Some(data) = data {
                            match self.io_pool.slice_mut(args.buf_index) {
                                Some(slice) => {
                                    let n = data.len().min(slice.len());
                                    slice[..n].copy_from_slice(&data[..n]);
                                    amt = n as i64;
                                }
                                None => *error = err::EINVAL,
                            }
                        }
                    }
                }
                dc.data = DowncallData::Io(IoDown { amt_complete: amt });
            }
            UpcallData::FileIox(_) => {
                if *error == err::ECANCELED {
                    *error = err::ETIMEDOUT;
                }
                dc.data = DowncallData::Io(IoDown {
                    amt_complete: self.slab.get(id).amt_complete,
                });
            }
            UpcallData::GetXattr(_) => {
                if *error == 0 {
                    if let SysReply::GetXattr(value) = &reply {
                        if value.len() > MAX_XATTR_VALUE {
                            *error = err::EINVAL;
                        } else {
                            let mut down = GetXattrDown {
                                val_sz: value.len() as u32,
                                _pad: 0,
                                val: [0; MAX_XATTR_VALUE],
                            };
                            down.val[..value.len()].copy_from_slice(value);
                            dc.data = DowncallData::GetXattr(down);
                        }
                    }
                } else if *error != err::ENOENT {
                    debug!("getxattr failed: {}", *error);
                }
            }
            UpcallData::ListXattr(args) => {
                if *error == 0 {
                    if let SysReply::ListXattr { token, keys } = &reply {
                        let mut down = ListXattrDown {
                            token: *token,
                            returned_count: keys.len() as u32,
                            keylen: 0,
                            lengths: [0; petrel_abi::MAX_XATTR_LIST],
                            key: [0; XATTR_LIST_BUF],
                        };
                        if args.requested_count == 0 {
                            down.token = petrel_abi::ITERATE_START;
                        }
                        let mut keylen = 0usize;
                        for (i, key) in keys.iter().enumerate() {
                            if keylen + key.len() > XATTR_LIST_BUF
                                || i >= petrel_abi::MAX_XATTR_LIST
                            {
                                break;
                            }
                            down.key[keylen..keylen + key.len()].copy_from_slice(key);
                            down.lengths[i] = key.len() as u32;
                            keylen += key.len();
                        }
                        down.keylen = keylen as u32;
                        dc.data = DowncallData::ListXattr(down);
                    }
                }
            }
            UpcallData::Mount(args) => {
                if *error == 0 {
                    if let SysReply::Mount {
                        fs_id,
                        root_handle,
                    } = &reply
                    {
                        // Cache horizons follow the server configuration of
                        // whatever is now mounted.
                        self.reset_cache_timeouts();
                        let mount_id = self.next_mount_id;
                        self.next_mount_id += 1;
                        debug!("fs mount got root handle {root_handle} on fs id {fs_id}");
                        dc.data = DowncallData::Mount(MountDown {
                            fs_id: *fs_id,
                            id: mount_id,
                            root_khandle: petrel_abi::Khandle::from_handle(*root_handle),
                        });
                    }
                } else {
                    error!(
                        "failed to mount via {}: {}",
                        args.config_server.as_str(),
                        *error
                    );
                }
            }
            // Status-only replies.
            UpcallData::Setattr(_)
            | UpcallData::Remove(_)
            | UpcallData::Rename(_)
            | UpcallData::Truncate(_)
            | UpcallData::SetXattr(_)
            | UpcallData::RemoveXattr(_)
            | UpcallData::Fsync(_) => {}
            // Inline kinds never reach completion packaging.
            UpcallData::Umount(_)
            | UpcallData::PerfCount(_)
            | UpcallData::Param(_)
            | UpcallData::FsKey(_)
            | UpcallData::RaFlush(_)
            | UpcallData::Cancel(_)
            | UpcallData::Features(_) => {
                error!("completed upcall of inline type {}", up.kind.name());
            }
        }

        // A permission error invalidates whatever credential produced it.
        if *error == err::EPERM || *error == err::EACCES {
            self.creds.remove(up.uid, up.gid);
        }

        dc.status = *error;
        self.slab.get_mut(id).downcall = Some(dc);
        debug!(
            "packaged downcall: op {} status {}",
            up.kind.name(),
            dc.status
        );
    }
}
