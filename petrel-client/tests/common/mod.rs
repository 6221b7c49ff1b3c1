//! Shared helpers for the end-to-end scenario tests.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::time::Duration;

use petrel_abi::{
    attrmask, io_type, CreateRequest, GetattrRequest, IoRequest, KernelRef, MountRequest, OpKind,
    Upcall, UpcallData, WireAttr, WireName, RA_READCNT_UNSET,
};
use petrel_client::client::ClientCore;
use petrel_client::options::ClientOptions;
use petrel_client::testing::{CapturedDowncall, MockDeviceHandle};
use zerocopy::FromBytes;

/// Readahead block size used across the scenarios.
pub const BLOCK: usize = 8192;

/// Options with a small, fully exercised readahead cache.
pub fn racache_opts(readcnt: i32) -> ClientOptions {
    ClientOptions {
        readahead_size: BLOCK,
        readahead_count: 8,
        readahead_readcnt: readcnt,
        desc_count: 16,
        desc_size: BLOCK,
        ..ClientOptions::default()
    }
}

pub fn run(core: &mut ClientCore, iterations: usize) {
    for _ in 0..iterations {
        core.run_iteration(Duration::ZERO);
    }
}

pub fn upcall(kind: OpKind, uid: u32, data: UpcallData) -> Upcall {
    Upcall {
        kind,
        uid,
        gid: uid,
        trailer_size: 0,
        data,
    }
}

pub fn attr(owner: u32, perms: u32) -> WireAttr {
    WireAttr {
        owner,
        group: owner,
        perms,
        mask: attrmask::COMMON,
        ..WireAttr::ZERO
    }
}

/// Last downcall written for `tag`.
pub fn downcall_for(handle: &MockDeviceHandle, tag: u64) -> CapturedDowncall {
    handle
        .written()
        .into_iter()
        .rev()
        .find(|w| w.tag == tag)
        .unwrap_or_else(|| panic!("no downcall written for tag {tag}"))
}

/// Parse a fixed-size payload struct out of a captured downcall.
pub fn payload<T: FromBytes>(dc: &CapturedDowncall) -> T {
    T::read_from_prefix(&dc.payload)
        .map(|(v, _)| v)
        .expect("payload too short")
}

/// Mount the default filesystem and return its root reference.
pub fn mount(core: &mut ClientCore, handle: &MockDeviceHandle, tag: u64) -> KernelRef {
    let up = upcall(
        OpKind::Mount,
        0,
        UpcallData::Mount(MountRequest {
            config_server: WireName::from_str("tcp://server:3334/pfs"),
        }),
    );
    handle.push_upcall(tag, &up, &[]);
    run(core, 1);
    let dc = downcall_for(handle, tag);
    assert_eq!(dc.header.status, 0, "mount failed");
    let down: petrel_abi::MountDown = payload(&dc);
    KernelRef {
        khandle: down.root_khandle,
        fs_id: down.fs_id,
        _pad: 0,
    }
}

/// Create a file under `parent` and return its reference.
pub fn create(
    core: &mut ClientCore,
    handle: &MockDeviceHandle,
    tag: u64,
    uid: u32,
    parent: KernelRef,
    name: &str,
    attributes: WireAttr,
) -> KernelRef {
    let up = upcall(
        OpKind::Create,
        uid,
        UpcallData::Create(CreateRequest {
            parent,
            attributes,
            name: WireName::from_str(name),
        }),
    );
    handle.push_upcall(tag, &up, &[]);
    run(core, 1);
    let dc = downcall_for(handle, tag);
    assert_eq!(dc.header.status, 0, "create {name} failed");
    let down: petrel_abi::RefDown = payload(&dc);
    down.refn
}

/// Write `data` to `refn` at `offset` through the upcall path, staging the
/// bytes in shared slice `buf_index`.
pub fn write_file(
    core: &mut ClientCore,
    handle: &MockDeviceHandle,
    tag: u64,
    uid: u32,
    refn: KernelRef,
    offset: i64,
    data: &[u8],
    buf_index: i32,
) {
    core.io_pool_mut().slice_mut(buf_index).unwrap()[..data.len()].copy_from_slice(data);
    let up = upcall(
        OpKind::FileIo,
        uid,
        UpcallData::FileIo(IoRequest {
            io_type: io_type::WRITE,
            buf_index,
            count: data.len() as i64,
            offset,
            refn,
            readahead_size: 0,
            _pad: 0,
        }),
    );
    handle.push_upcall(tag, &up, &[]);
    run(core, 1);
    let dc = downcall_for(handle, tag);
    assert_eq!(dc.header.status, 0, "write failed");
}

pub fn read_upcall(uid: u32, refn: KernelRef, offset: i64, count: i64, buf_index: i32) -> Upcall {
    upcall(
        OpKind::FileIo,
        uid,
        UpcallData::FileIo(IoRequest {
            io_type: io_type::READ,
            buf_index,
            count,
            offset,
            refn,
            readahead_size: RA_READCNT_UNSET,
            _pad: 0,
        }),
    )
}

pub fn getattr_upcall(uid: u32, refn: KernelRef) -> Upcall {
    upcall(
        OpKind::Getattr,
        uid,
        UpcallData::Getattr(GetattrRequest {
            refn,
            mask: attrmask::ALL,
            _pad: 0,
        }),
    )
}

/// Deterministic test pattern.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// The engine-side object reference for a kernel reference.
pub fn obj(refn: KernelRef) -> petrel_client::sys::ObjectRef {
    petrel_client::sys::ObjectRef {
        handle: refn.khandle.to_handle(),
        fs_id: refn.fs_id,
    }
}
