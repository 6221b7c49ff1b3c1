//! Embedded single-node engine.
//!
//! Serves the full [`Sys`](super::Sys) surface from an in-process
//! namespace. Operations queue at submit time and complete on a later
//! `testany`, preserving the non-blocking contract the request loop is
//! built around. Used by `--standalone` mode and by the integration tests;
//! the clustered engine lives outside this tree.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use petrel_abi::dirent::{DirEntry, ReaddirPage};
use petrel_abi::{attrmask, err, io_type, objtype, param_kind, subsystem, RwxPair, WireAttr};

use super::{
    Completion, Credential, FsId, Handle, Hints, MountEntry, ObjectRef, OpId, ServerCacheTimeouts,
    StatfsReply, Sys, SysAttr, SysReply,
};

struct Node {
    attr: WireAttr,
    data: Vec<u8>,
    children: BTreeMap<String, Handle>,
    link_target: Option<String>,
    xattrs: BTreeMap<Vec<u8>, Vec<u8>>,
    version: u64,
}

impl Node {
    fn new(objtype: i32, owner: u32, group: u32, perms: u32) -> Self {
        let mut attr = WireAttr::ZERO;
        attr.objtype = objtype;
        attr.owner = owner;
        attr.group = group;
        attr.perms = perms;
        attr.mask = attrmask::COMMON | attrmask::SIZE;
        Self {
            attr,
            data: Vec::new(),
            children: BTreeMap::new(),
            link_target: None,
            xattrs: BTreeMap::new(),
            version: 1,
        }
    }
}

enum Op {
    Lookup {
        parent: ObjectRef,
        name: String,
        sym_follow: bool,
    },
    Create {
        parent: ObjectRef,
        name: String,
        attr: WireAttr,
    },
    Symlink {
        parent: ObjectRef,
        name: String,
        target: String,
        attr: WireAttr,
    },
    Getattr {
        refn: ObjectRef,
        mask: u32,
    },
    Setattr {
        refn: ObjectRef,
        attr: WireAttr,
    },
    Remove {
        parent: ObjectRef,
        name: String,
    },
    Mkdir {
        parent: ObjectRef,
        name: String,
        attr: WireAttr,
    },
    Readdir {
        refn: ObjectRef,
        dir_token: u64,
        count: u32,
    },
    ReaddirPlus {
        refn: ObjectRef,
        dir_token: u64,
        count: u32,
        mask: u32,
    },
    Rename {
        old_parent: ObjectRef,
        old_name: String,
        new_parent: ObjectRef,
        new_name: String,
    },
    Truncate {
        refn: ObjectRef,
        size: i64,
    },
    GetXattr {
        refn: ObjectRef,
        key: Vec<u8>,
        max_value: usize,
    },
    SetXattr {
        refn: ObjectRef,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    RemoveXattr {
        refn: ObjectRef,
        key: Vec<u8>,
    },
    ListXattr {
        refn: ObjectRef,
        list_token: u64,
        count: u32,
    },
    Statfs {
        fs_id: FsId,
    },
    Io {
        refn: ObjectRef,
        io_type: i32,
        offset: i64,
        len: usize,
        write_data: Option<Vec<u8>>,
    },
    IoList {
        refn: ObjectRef,
        io_type: i32,
        pairs: Vec<RwxPair>,
        write_data: Option<Vec<u8>>,
    },
    Fsync,
    FsAdd {
        mntent: MountEntry,
    },
}

struct Pending {
    op_id: OpId,
    token: u64,
    uid: u32,
    cancelled: bool,
    op: Op,
}

#[derive(Default)]
struct Perf {
    history: u64,
    interval_secs: u64,
    ops: u64,
}

/// The in-process engine.
pub struct LocalSys {
    nodes: BTreeMap<Handle, Node>,
    fs_roots: BTreeMap<FsId, Handle>,
    fs_by_name: BTreeMap<String, FsId>,
    next_handle: Handle,
    next_fs_id: FsId,
    next_op: u64,
    pending: VecDeque<Pending>,
    cache_params: BTreeMap<u32, [i64; 4]>,
    perf: BTreeMap<u32, Perf>,
}

impl Default for LocalSys {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSys {
    pub fn new() -> Self {
        let mut cache_params = BTreeMap::new();
        for sub in [subsystem::ACACHE, subsystem::NCACHE, subsystem::CAPCACHE] {
            cache_params.insert(sub, [5000, 5120, 10240, 25]);
        }
        Self {
            nodes: BTreeMap::new(),
            fs_roots: BTreeMap::new(),
            fs_by_name: BTreeMap::new(),
            next_handle: 0x1000,
            next_fs_id: 1,
            next_op: 1,
            pending: VecDeque::new(),
            cache_params,
            perf: BTreeMap::new(),
        }
    }

    fn alloc_handle(&mut self) -> Handle {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn submit(&mut self, uid: u32, token: u64, op: Op) -> Result<OpId, i32> {
        let op_id = OpId(self.next_op);
        self.next_op += 1;
        self.pending.push_back(Pending {
            op_id,
            token,
            uid,
            cancelled: false,
            op,
        });
        Ok(op_id)
    }

    fn node(&self, refn: ObjectRef) -> Result<&Node, i32> {
        self.nodes.get(&refn.handle).ok_or(err::ENOENT)
    }

    fn node_mut(&mut self, refn: ObjectRef) -> Result<&mut Node, i32> {
        self.nodes.get_mut(&refn.handle).ok_or(err::ENOENT)
    }

    fn check_read(node: &Node, uid: u32) -> Result<(), i32> {
        let perms = node.attr.perms;
        let allowed = uid == 0
            || (uid == node.attr.owner && perms & 0o400 != 0)
            || (uid != node.attr.owner && perms & 0o004 != 0);
        if allowed { Ok(()) } else { Err(err::EACCES) }
    }

    fn check_write(node: &Node, uid: u32) -> Result<(), i32> {
        let perms = node.attr.perms;
        let allowed = uid == 0
            || (uid == node.attr.owner && perms & 0o200 != 0)
            || (uid != node.attr.owner && perms & 0o002 != 0);
        if allowed { Ok(()) } else { Err(err::EACCES) }
    }

    fn lookup_in(&self, parent: ObjectRef, name: &str) -> Result<Handle, i32> {
        let dir = self.node(parent)?;
        if dir.attr.objtype != objtype::DIRECTORY {
            return Err(err::EINVAL);
        }
        dir.children.get(name).copied().ok_or(err::ENOENT)
    }

    fn dir_page(&self, refn: ObjectRef, dir_token: u64, count: u32) -> Result<ReaddirPage, i32> {
        let dir = self.node(refn)?;
        if dir.attr.objtype != objtype::DIRECTORY {
            return Err(err::EINVAL);
        }
        let start = if dir_token == petrel_abi::ITERATE_START {
            0
        } else {
            dir_token as usize
        };
        let entries: Vec<DirEntry> = dir
            .children
            .iter()
            .skip(start)
            .take(count as usize)
            .map(|(name, handle)| DirEntry {
                name: name.clone(),
                handle: *handle,
            })
            .collect();
        let token = (start + entries.len()) as u64;
        Ok(ReaddirPage {
            token,
            directory_version: dir.version,
            entries,
        })
    }

    fn sys_attr(&self, handle: Handle, mask: u32) -> Result<SysAttr, i32> {
        let node = self.nodes.get(&handle).ok_or(err::ENOENT)?;
        let mut attr = node.attr;
        attr.size = node.data.len() as i64;
        attr.mask = mask & attrmask::ALL;
        let link_target = if attr.is_symlink() && mask & attrmask::LNK_TARGET != 0 {
            node.link_target.clone()
        } else {
            None
        };
        Ok(SysAttr { attr, link_target })
    }

    fn execute(&mut self, uid: u32, op: Op) -> Result<SysReply, i32> {
        match op {
            Op::Lookup {
                parent,
                name,
                sym_follow,
            } => {
                let handle = self.lookup_in(parent, &name)?;
                let node = self.nodes.get(&handle).ok_or(err::ENOENT)?;
                Self::check_read(node, uid)?;
                let mut resolved = handle;
                if sym_follow && node.attr.objtype == objtype::SYMLINK {
                    if let Some(target) = node.link_target.clone() {
                        if let Ok(t) = self.lookup_in(parent, target.trim_start_matches("./")) {
                            resolved = t;
                        }
                    }
                }
                Ok(SysReply::Ref(ObjectRef {
                    handle: resolved,
                    fs_id: parent.fs_id,
                }))
            }
            Op::Create { parent, name, attr } => {
                if self.lookup_in(parent, &name).is_ok() {
                    return Err(err::EEXIST);
                }
                let dir = self.node(parent)?;
                Self::check_write(dir, uid)?;
                let handle = self.alloc_handle();
                let mut node = Node::new(objtype::FILE, attr.owner, attr.group, attr.perms);
                node.attr.atime = attr.atime;
                node.attr.mtime = attr.mtime;
                self.nodes.insert(handle, node);
                let dir = self.node_mut(parent)?;
                dir.children.insert(name, handle);
                dir.version += 1;
                Ok(SysReply::Ref(ObjectRef {
                    handle,
                    fs_id: parent.fs_id,
                }))
            }
            Op::Symlink {
                parent,
                name,
                target,
                attr,
            } => {
                if self.lookup_in(parent, &name).is_ok() {
                    return Err(err::EEXIST);
                }
                let handle = self.alloc_handle();
                let mut node = Node::new(objtype::SYMLINK, attr.owner, attr.group, 0o777);
                node.link_target = Some(target);
                self.nodes.insert(handle, node);
                let dir = self.node_mut(parent)?;
                dir.children.insert(name, handle);
                dir.version += 1;
                Ok(SysReply::Ref(ObjectRef {
                    handle,
                    fs_id: parent.fs_id,
                }))
            }
            Op::Getattr { refn, mask } => {
                let node = self.node(refn)?;
                Self::check_read(node, uid)?;
                Ok(SysReply::Getattr(self.sys_attr(refn.handle, mask)?))
            }
            Op::Setattr { refn, attr } => {
                let node = self.node_mut(refn)?;
                if attr.mask & attrmask::COMMON != 0 {
                    node.attr.perms = attr.perms;
                    node.attr.owner = attr.owner;
                    node.attr.group = attr.group;
                    node.attr.atime = attr.atime;
                    node.attr.mtime = attr.mtime;
                }
                Ok(SysReply::None)
            }
            Op::Remove { parent, name } => {
                let handle = self.lookup_in(parent, &name)?;
                if let Some(node) = self.nodes.get(&handle) {
                    if node.attr.objtype == objtype::DIRECTORY && !node.children.is_empty() {
                        return Err(err::EINVAL);
                    }
                }
                self.nodes.remove(&handle);
                let dir = self.node_mut(parent)?;
                dir.children.remove(&name);
                dir.version += 1;
                Ok(SysReply::None)
            }
            Op::Mkdir { parent, name, attr } => {
                if self.lookup_in(parent, &name).is_ok() {
                    return Err(err::EEXIST);
                }
                let handle = self.alloc_handle();
                self.nodes.insert(
                    handle,
                    Node::new(objtype::DIRECTORY, attr.owner, attr.group, attr.perms),
                );
                let dir = self.node_mut(parent)?;
                dir.children.insert(name, handle);
                dir.version += 1;
                Ok(SysReply::Ref(ObjectRef {
                    handle,
                    fs_id: parent.fs_id,
                }))
            }
            Op::Readdir {
                refn,
                dir_token,
                count,
            } => Ok(SysReply::Readdir(self.dir_page(refn, dir_token, count)?)),
            Op::ReaddirPlus {
                refn,
                dir_token,
                count,
                mask,
            } => {
                let page = self.dir_page(refn, dir_token, count)?;
                let mut errors = Vec::with_capacity(page.entries.len());
                let mut attrs = Vec::with_capacity(page.entries.len());
                for entry in &page.entries {
                    match self.sys_attr(entry.handle, mask) {
                        Ok(attr) => {
                            errors.push(0);
                            attrs.push(attr);
                        }
                        Err(e) => {
                            errors.push(e);
                            attrs.push(SysAttr {
                                attr: WireAttr::ZERO,
                                link_target: None,
                            });
                        }
                    }
                }
                Ok(SysReply::ReaddirPlus {
                    page,
                    errors,
                    attrs,
                })
            }
            Op::Rename {
                old_parent,
                old_name,
                new_parent,
                new_name,
            } => {
                let handle = self.lookup_in(old_parent, &old_name)?;
                let dir = self.node_mut(old_parent)?;
                dir.children.remove(&old_name);
                dir.version += 1;
                let dir = self.node_mut(new_parent)?;
                dir.children.insert(new_name, handle);
                dir.version += 1;
                Ok(SysReply::None)
            }
            Op::Truncate { refn, size } => {
                let node = self.node_mut(refn)?;
                Self::check_write(node, uid)?;
                node.data.resize(size.max(0) as usize, 0);
                node.attr.size = node.data.len() as i64;
                Ok(SysReply::None)
            }
            Op::GetXattr {
                refn,
                key,
                max_value,
            } => {
                let node = self.node(refn)?;
                let value = node.xattrs.get(&key).ok_or(err::ENOENT)?;
                if value.len() > max_value {
                    return Err(err::EINVAL);
                }
                Ok(SysReply::GetXattr(value.clone()))
            }
            Op::SetXattr { refn, key, value } => {
                let node = self.node_mut(refn)?;
                node.xattrs.insert(key, value);
                Ok(SysReply::None)
            }
            Op::RemoveXattr { refn, key } => {
                let node = self.node_mut(refn)?;
                node.xattrs.remove(&key).ok_or(err::ENOENT)?;
                Ok(SysReply::None)
            }
            Op::ListXattr {
                refn,
                list_token,
                count,
            } => {
                let node = self.node(refn)?;
                let start = if list_token == petrel_abi::ITERATE_START {
                    0
                } else {
                    list_token as usize
                };
                let keys: Vec<Vec<u8>> = node
                    .xattrs
                    .keys()
                    .skip(start)
                    .take(count as usize)
                    .cloned()
                    .collect();
                let token = (start + keys.len()) as u64;
                Ok(SysReply::ListXattr { token, keys })
            }
            Op::Statfs { fs_id } => {
                if !self.fs_roots.contains_key(&fs_id) {
                    return Err(err::ENODEV);
                }
                let used: i64 = self.nodes.values().map(|n| n.data.len() as i64).sum();
                Ok(SysReply::Statfs(StatfsReply {
                    bytes_total: 1 << 40,
                    bytes_available: (1 << 40) - used,
                    handles_total: 1 << 20,
                    handles_available: (1 << 20) - self.nodes.len() as i64,
                }))
            }
            Op::Io {
                refn,
                io_type: direction,
                offset,
                len,
                write_data,
            } => {
                let node = self.node_mut(refn)?;
                let offset = offset.max(0) as usize;
                if direction == io_type::READ {
                    Self::check_read(node, uid)?;
                    let end = (offset + len).min(node.data.len());
                    let data = if offset < node.data.len() {
                        node.data[offset..end].to_vec()
                    } else {
                        Vec::new()
                    };
                    Ok(SysReply::Io {
                        total_completed: data.len() as i64,
                        data: Some(data),
                    })
                } else {
                    Self::check_write(node, uid)?;
                    let data = write_data.ok_or(err::EINVAL)?;
                    if node.data.len() < offset + data.len() {
                        node.data.resize(offset + data.len(), 0);
                    }
                    node.data[offset..offset + data.len()].copy_from_slice(&data);
                    node.attr.size = node.data.len() as i64;
                    Ok(SysReply::Io {
                        total_completed: data.len() as i64,
                        data: None,
                    })
                }
            }
            Op::IoList {
                refn,
                io_type: direction,
                pairs,
                write_data,
            } => {
                let node = self.node_mut(refn)?;
                if direction == io_type::READ {
                    Self::check_read(node, uid)?;
                    let mut out = Vec::new();
                    for pair in &pairs {
                        let off = pair.off.max(0) as usize;
                        let end = (off + pair.len.max(0) as usize).min(node.data.len());
                        if off < node.data.len() {
                            out.extend_from_slice(&node.data[off..end]);
                        }
                    }
                    Ok(SysReply::Io {
                        total_completed: out.len() as i64,
                        data: Some(out),
                    })
                } else {
                    Self::check_write(node, uid)?;
                    let data = write_data.ok_or(err::EINVAL)?;
                    let mut consumed = 0usize;
                    for pair in &pairs {
                        let off = pair.off.max(0) as usize;
                        let len = pair.len.max(0) as usize;
                        let chunk = &data[consumed..(consumed + len).min(data.len())];
                        if node.data.len() < off + chunk.len() {
                            node.data.resize(off + chunk.len(), 0);
                        }
                        node.data[off..off + chunk.len()].copy_from_slice(chunk);
                        consumed += chunk.len();
                    }
                    node.attr.size = node.attr.size.max(node.data.len() as i64);
                    Ok(SysReply::Io {
                        total_completed: consumed as i64,
                        data: None,
                    })
                }
            }
            Op::Fsync => Ok(SysReply::None),
            Op::FsAdd { mntent } => {
                let fs_id = match self.fs_by_name.get(&mntent.fs_name) {
                    Some(id) => *id,
                    None => {
                        let fs_id = self.next_fs_id;
                        self.next_fs_id += 1;
                        let root = self.alloc_handle();
                        self.nodes
                            .insert(root, Node::new(objtype::DIRECTORY, 0, 0, 0o777));
                        self.fs_roots.insert(fs_id, root);
                        self.fs_by_name.insert(mntent.fs_name.clone(), fs_id);
                        fs_id
                    }
                };
                let root_handle = self.fs_roots[&fs_id];
                Ok(SysReply::Mount {
                    fs_id,
                    root_handle,
                })
            }
        }
    }
}

impl Sys for LocalSys {
    fn isys_lookup(
        &mut self,
        parent: ObjectRef,
        name: &str,
        sym_follow: bool,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::Lookup {
                parent,
                name: name.to_string(),
                sym_follow,
            },
        )
    }

    fn isys_create(
        &mut self,
        name: &str,
        parent: ObjectRef,
        attr: WireAttr,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::Create {
                parent,
                name: name.to_string(),
                attr,
            },
        )
    }

    fn isys_symlink(
        &mut self,
        name: &str,
        parent: ObjectRef,
        target: &str,
        attr: WireAttr,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::Symlink {
                parent,
                name: name.to_string(),
                target: target.to_string(),
                attr,
            },
        )
    }

    fn isys_getattr(
        &mut self,
        refn: ObjectRef,
        mask: u32,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(cred.uid, token, Op::Getattr { refn, mask })
    }

    fn isys_setattr(
        &mut self,
        refn: ObjectRef,
        attr: WireAttr,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(cred.uid, token, Op::Setattr { refn, attr })
    }

    fn isys_remove(
        &mut self,
        name: &str,
        parent: ObjectRef,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::Remove {
                parent,
                name: name.to_string(),
            },
        )
    }

    fn isys_mkdir(
        &mut self,
        name: &str,
        parent: ObjectRef,
        attr: WireAttr,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::Mkdir {
                parent,
                name: name.to_string(),
                attr,
            },
        )
    }

    fn isys_readdir(
        &mut self,
        refn: ObjectRef,
        dir_token: u64,
        count: u32,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::Readdir {
                refn,
                dir_token,
                count,
            },
        )
    }

    fn isys_readdirplus(
        &mut self,
        refn: ObjectRef,
        dir_token: u64,
        count: u32,
        mask: u32,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::ReaddirPlus {
                refn,
                dir_token,
                count,
                mask,
            },
        )
    }

    fn isys_rename(
        &mut self,
        old_name: &str,
        old_parent: ObjectRef,
        new_name: &str,
        new_parent: ObjectRef,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::Rename {
                old_parent,
                old_name: old_name.to_string(),
                new_parent,
                new_name: new_name.to_string(),
            },
        )
    }

    fn isys_truncate(
        &mut self,
        refn: ObjectRef,
        size: i64,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(cred.uid, token, Op::Truncate { refn, size })
    }

    fn isys_getxattr(
        &mut self,
        refn: ObjectRef,
        key: &[u8],
        max_value: usize,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::GetXattr {
                refn,
                key: key.to_vec(),
                max_value,
            },
        )
    }

    fn isys_setxattr(
        &mut self,
        refn: ObjectRef,
        key: &[u8],
        value: &[u8],
        _flags: i32,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::SetXattr {
                refn,
                key: key.to_vec(),
                value: value.to_vec(),
            },
        )
    }

    fn isys_removexattr(
        &mut self,
        refn: ObjectRef,
        key: &[u8],
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::RemoveXattr {
                refn,
                key: key.to_vec(),
            },
        )
    }

    fn isys_listxattr(
        &mut self,
        refn: ObjectRef,
        list_token: u64,
        count: u32,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::ListXattr {
                refn,
                list_token,
                count,
            },
        )
    }

    fn isys_statfs(
        &mut self,
        fs_id: FsId,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(cred.uid, token, Op::Statfs { fs_id })
    }

    fn isys_io(
        &mut self,
        refn: ObjectRef,
        io_type: i32,
        offset: i64,
        len: usize,
        write_data: Option<Vec<u8>>,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::Io {
                refn,
                io_type,
                offset,
                len,
                write_data,
            },
        )
    }

    fn isys_io_list(
        &mut self,
        refn: ObjectRef,
        io_type: i32,
        pairs: &[RwxPair],
        write_data: Option<Vec<u8>>,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::IoList {
                refn,
                io_type,
                pairs: pairs.to_vec(),
                write_data,
            },
        )
    }

    fn isys_fsync(
        &mut self,
        _refn: ObjectRef,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(cred.uid, token, Op::Fsync)
    }

    fn isys_fs_add(
        &mut self,
        mntent: &MountEntry,
        cred: &Credential,
        _hints: &Hints,
        token: u64,
    ) -> Result<OpId, i32> {
        self.submit(
            cred.uid,
            token,
            Op::FsAdd {
                mntent: mntent.clone(),
            },
        )
    }

    fn testany(&mut self, max: usize, timeout: Duration) -> Vec<Completion> {
        if self.pending.is_empty() {
            if !timeout.is_zero() {
                std::thread::sleep(timeout.min(Duration::from_millis(10)));
            }
            return Vec::new();
        }
        let mut out = Vec::new();
        while out.len() < max {
            let Some(pending) = self.pending.pop_front() else {
                break;
            };
            if pending.cancelled {
                out.push(Completion {
                    op_id: pending.op_id,
                    token: pending.token,
                    error: err::ECANCELED,
                    reply: SysReply::None,
                });
                continue;
            }
            let (error, reply) = match self.execute(pending.uid, pending.op) {
                Ok(reply) => (0, reply),
                Err(e) => (e, SysReply::None),
            };
            out.push(Completion {
                op_id: pending.op_id,
                token: pending.token,
                error,
                reply,
            });
        }
        out
    }

    fn io_cancel(&mut self, op_id: OpId) -> Result<(), i32> {
        for pending in self.pending.iter_mut() {
            if pending.op_id == op_id {
                pending.cancelled = true;
                return Ok(());
            }
        }
        Err(err::EINVAL)
    }

    fn ref_lookup(
        &mut self,
        parent: ObjectRef,
        name: &str,
        cred: &Credential,
        sym_follow: bool,
    ) -> Result<ObjectRef, i32> {
        match self.execute(
            cred.uid,
            Op::Lookup {
                parent,
                name: name.to_string(),
                sym_follow,
            },
        )? {
            SysReply::Ref(refn) => Ok(refn),
            _ => Err(err::EINVAL),
        }
    }

    fn fs_remove(&mut self, mntent: &MountEntry) -> Result<(), i32> {
        // The namespace stays; only the mount registration is checked, so
        // a later remount sees the same filesystem.
        self.fs_by_name
            .get(&mntent.fs_name)
            .map(|_| ())
            .ok_or(err::ENODEV)
    }

    fn get_fs_key(&mut self, fs_id: FsId) -> Result<Vec<u8>, i32> {
        let name = self
            .fs_by_name
            .iter()
            .find(|(_, id)| **id == fs_id)
            .map(|(name, _)| name.clone())
            .ok_or(err::ENOENT)?;
        let mut key = Vec::with_capacity(FS_KEY_LEN);
        // Deterministic per-fs key material.
        let mut acc: u64 = 0x9e37_79b9_7f4a_7c15 ^ fs_id as u64;
        for b in name.bytes() {
            acc = acc.rotate_left(7) ^ b as u64;
        }
        while key.len() < FS_KEY_LEN {
            acc = acc.wrapping_mul(0x2545_f491_4f6c_dd1d).wrapping_add(1);
            key.extend_from_slice(&acc.to_le_bytes());
        }
        key.truncate(FS_KEY_LEN);
        Ok(key)
    }

    fn gen_credential(
        &mut self,
        uid: u32,
        gid: u32,
        timeout_secs: u64,
        keypath: Option<&Path>,
    ) -> Result<Credential, i32> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let signature = match keypath {
            Some(path) if !path.exists() => Vec::new(),
            _ => format!("sig:{uid}:{gid}:{timeout_secs}").into_bytes(),
        };
        Ok(Credential {
            uid,
            gid,
            timeout_secs: now + timeout_secs,
            issuer: String::from("petrel-local"),
            signature,
        })
    }

    fn server_cache_timeouts(&self) -> ServerCacheTimeouts {
        ServerCacheTimeouts {
            acache_ms: self
                .cache_params
                .get(&subsystem::ACACHE)
                .map(|p| p[param_kind::TIMEOUT_MSECS as usize] as u64),
            ncache_ms: self
                .cache_params
                .get(&subsystem::NCACHE)
                .map(|p| p[param_kind::TIMEOUT_MSECS as usize] as u64),
        }
    }

    fn cache_param_get(&self, subsystem: u32, param: u32) -> Result<i64, i32> {
        let params = self.cache_params.get(&subsystem).ok_or(err::EINVAL)?;
        params.get(param as usize).copied().ok_or(err::EINVAL)
    }

    fn cache_param_set(&mut self, subsystem: u32, param: u32, value: i64) -> Result<(), i32> {
        let params = self.cache_params.get_mut(&subsystem).ok_or(err::EINVAL)?;
        let slot = params.get_mut(param as usize).ok_or(err::EINVAL)?;
        *slot = value;
        Ok(())
    }

    fn perf_snapshot(&self, subsystem: u32) -> Option<String> {
        let perf = self.perf.get(&subsystem);
        Some(format!(
            "subsystem {} history {} samples {}\n",
            subsystem,
            perf.map(|p| p.history).unwrap_or(0),
            perf.map(|p| p.ops).unwrap_or(0),
        ))
    }

    fn set_perf_params(&mut self, subsystem: u32, history: u64, interval_secs: u64) {
        let perf = self.perf.entry(subsystem).or_default();
        perf.history = history;
        perf.interval_secs = interval_secs;
    }
}

const FS_KEY_LEN: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(uid: u32) -> Credential {
        Credential {
            uid,
            gid: uid,
            timeout_secs: u64::MAX,
            issuer: String::from("test"),
            signature: b"sig".to_vec(),
        }
    }

    fn mounted() -> (LocalSys, ObjectRef) {
        let mut sys = LocalSys::new();
        let mntent = MountEntry::parse("tcp://server:3334/pfs").unwrap();
        sys.isys_fs_add(&mntent, &cred(0), &Hints::default(), 1)
            .unwrap();
        let completions = sys.testany(16, Duration::ZERO);
        let (fs_id, root_handle) = match completions[0].reply {
            SysReply::Mount {
                fs_id,
                root_handle,
            } => (fs_id, root_handle),
            ref other => panic!("expected mount reply: {other:?}"),
        };
        (
            sys,
            ObjectRef {
                handle: root_handle,
                fs_id,
            },
        )
    }

    #[test]
    fn operations_complete_on_testany_not_submit() {
        let (mut sys, root) = mounted();
        sys.isys_mkdir(
            "d",
            root,
            WireAttr::ZERO,
            &cred(0),
            &Hints::default(),
            7,
        )
        .unwrap();
        assert_eq!(sys.testany(16, Duration::ZERO).len(), 1);
        assert!(sys.testany(16, Duration::ZERO).is_empty());
    }

    #[test]
    fn create_then_duplicate_create_returns_eexist() {
        let (mut sys, root) = mounted();
        let c = cred(0);
        sys.isys_create("f", root, WireAttr::ZERO, &c, &Hints::default(), 1)
            .unwrap();
        sys.isys_create("f", root, WireAttr::ZERO, &c, &Hints::default(), 2)
            .unwrap();
        let completions = sys.testany(16, Duration::ZERO);
        assert_eq!(completions[0].error, 0);
        assert_eq!(completions[1].error, err::EEXIST);
    }

    #[test]
    fn read_returns_written_bytes() {
        let (mut sys, root) = mounted();
        let c = cred(0);
        let mut attr = WireAttr::ZERO;
        attr.perms = 0o644;
        sys.isys_create("f", root, attr, &c, &Hints::default(), 1)
            .unwrap();
        let file = match &sys.testany(16, Duration::ZERO)[0].reply {
            SysReply::Ref(refn) => *refn,
            other => panic!("expected ref: {other:?}"),
        };
        sys.isys_io(
            file,
            io_type::WRITE,
            0,
            5,
            Some(b"hello".to_vec()),
            &c,
            &Hints::default(),
            2,
        )
        .unwrap();
        sys.isys_io(file, io_type::READ, 0, 5, None, &c, &Hints::default(), 3)
            .unwrap();
        let completions = sys.testany(16, Duration::ZERO);
        match &completions[1].reply {
            SysReply::Io {
                total_completed,
                data,
            } => {
                assert_eq!(*total_completed, 5);
                assert_eq!(data.as_deref(), Some(b"hello".as_slice()));
            }
            other => panic!("expected io reply: {other:?}"),
        }
    }

    #[test]
    fn unreadable_node_denies_other_users() {
        let (mut sys, root) = mounted();
        let mut attr = WireAttr::ZERO;
        attr.perms = 0o600;
        attr.owner = 0;
        sys.isys_create("private", root, attr, &cred(0), &Hints::default(), 1)
            .unwrap();
        let file = match &sys.testany(16, Duration::ZERO)[0].reply {
            SysReply::Ref(refn) => *refn,
            other => panic!("expected ref: {other:?}"),
        };
        sys.isys_getattr(file, attrmask::ALL, &cred(1000), &Hints::default(), 2)
            .unwrap();
        assert_eq!(sys.testany(16, Duration::ZERO)[0].error, err::EACCES);
    }

    #[test]
    fn cancelled_op_completes_with_ecanceled() {
        let (mut sys, root) = mounted();
        let c = cred(0);
        let op = sys
            .isys_io(root, io_type::READ, 0, 16, None, &c, &Hints::default(), 9)
            .unwrap();
        sys.io_cancel(op).unwrap();
        let completions = sys.testany(16, Duration::ZERO);
        assert_eq!(completions[0].error, err::ECANCELED);
        assert_eq!(completions[0].token, 9);
    }

    #[test]
    fn readdir_pages_through_entries() {
        let (mut sys, root) = mounted();
        let c = cred(0);
        for name in ["a", "b", "c"] {
            sys.isys_create(name, root, WireAttr::ZERO, &c, &Hints::default(), 0)
                .unwrap();
        }
        sys.testany(16, Duration::ZERO);
        sys.isys_readdir(root, petrel_abi::ITERATE_START, 2, &c, &Hints::default(), 1)
            .unwrap();
        let page = match &sys.testany(16, Duration::ZERO)[0].reply {
            SysReply::Readdir(page) => page.clone(),
            other => panic!("expected readdir: {other:?}"),
        };
        assert_eq!(page.entries.len(), 2);
        sys.isys_readdir(root, page.token, 2, &c, &Hints::default(), 2)
            .unwrap();
        let page2 = match &sys.testany(16, Duration::ZERO)[0].reply {
            SysReply::Readdir(page) => page.clone(),
            other => panic!("expected readdir: {other:?}"),
        };
        assert_eq!(page2.entries.len(), 1);
    }
}
