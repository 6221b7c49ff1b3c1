//! End-to-end request servicing scenarios: error rewriting, credential
//! eviction, pre-mount gating, duplicate tags, vectored I/O, and the
//! inline-serviced operations.

mod common;

use common::*;

use petrel_abi::dirent::decode_dirents;
use petrel_abi::{
    err, io_type, subsystem, CreateRequest, FeaturesDown, FeaturesRequest, FsKeyDown,
    FsKeyRequest, IoDown, IoxRequest, KernelRef, OpKind, ParamDown, ParamRequest, ReaddirDown,
    ReaddirRequest, RefDown, RwxPair, StatfsDown, StatfsRequest, UpcallData, WireName,
    ITERATE_START,
};
use petrel_client::remount::RemountState;
use petrel_client::sys::local::LocalSys;
use petrel_client::testing::{harness, harness_with_remount, CountingSys};
use zerocopy::IntoBytes;

fn plain_harness() -> (petrel_client::ClientCore, petrel_client::testing::MockDeviceHandle) {
    harness(racache_opts(1), Box::new(LocalSys::new()))
}

#[test]
fn create_eexist_recovers_to_success_with_looked_up_handle() {
    let (mut core, dev) = plain_harness();
    let root = mount(&mut core, &dev, 1);
    let first = create(&mut core, &dev, 2, 1000, root, "x", attr(1000, 0o644));

    // The second create races an existing name: the engine reports EEXIST,
    // the recovery lookup resolves it, and the kernel sees success with
    // the existing object's reference.
    let up = upcall(
        OpKind::Create,
        1000,
        UpcallData::Create(CreateRequest {
            parent: root,
            attributes: attr(1000, 0o644),
            name: WireName::from_str("x"),
        }),
    );
    dev.push_upcall(3, &up, &[]);
    run(&mut core, 1);

    let dc = downcall_for(&dev, 3);
    assert_eq!(dc.header.status, 0);
    let down: RefDown = payload(&dc);
    assert_eq!(down.refn.khandle, first.khandle);
}

#[test]
fn create_eexist_with_failed_lookup_becomes_eacces() {
    let (mut core, dev) = plain_harness();
    let root = mount(&mut core, &dev, 1);
    // An existing object the recovering caller cannot read.
    create(&mut core, &dev, 2, 0, root, "priv", attr(0, 0o600));

    let up = upcall(
        OpKind::Create,
        1000,
        UpcallData::Create(CreateRequest {
            parent: root,
            attributes: attr(1000, 0o644),
            name: WireName::from_str("priv"),
        }),
    );
    dev.push_upcall(3, &up, &[]);
    run(&mut core, 1);

    let dc = downcall_for(&dev, 3);
    assert_eq!(dc.header.status, err::EACCES);
    let down: RefDown = payload(&dc);
    assert!(down.refn.khandle.is_null());
}

#[test]
fn permission_error_evicts_cached_credential() {
    let (mut core, dev) = plain_harness();
    let root = mount(&mut core, &dev, 1);
    let secret = create(&mut core, &dev, 2, 0, root, "secret", attr(0, 0o600));

    // The getattr dispatch itself populates the credential cache for the
    // caller before the engine rejects the operation.
    dev.push_upcall(10, &getattr_upcall(1000, secret), &[]);
    run(&mut core, 1);

    let dc = downcall_for(&dev, 10);
    assert_eq!(dc.header.status, err::EACCES);
    assert!(
        !core.credentials().contains(1000, 1000),
        "permission error must purge the credential entry"
    );
}

#[test]
fn upcalls_before_mount_completion_are_discarded() {
    let (mut core, dev) = harness_with_remount(
        racache_opts(1),
        Box::new(LocalSys::new()),
        RemountState::new(),
    );
    let parked = core.parked_len();

    let bogus = KernelRef::new(0x99, 1);
    dev.push_upcall(5, &getattr_upcall(0, bogus), &[]);
    run(&mut core, 2);

    // Quietly dropped: no downcall, descriptor reposted, nothing tracked.
    assert!(dev.written().is_empty());
    assert_eq!(core.parked_len(), parked);
    assert_eq!(core.in_progress_len(), 0);

    // Features (part of the startup handshake) is serviced regardless.
    let up = upcall(
        OpKind::Features,
        0,
        UpcallData::Features(FeaturesRequest { mask: 0 }),
    );
    dev.push_upcall(6, &up, &[]);
    run(&mut core, 1);
    let dc = downcall_for(&dev, 6);
    assert_eq!(dc.header.status, 0);
}

#[test]
fn duplicate_tag_is_discarded_while_original_runs() {
    let (mut core, dev) = plain_harness();
    let root = mount(&mut core, &dev, 1);
    let file = create(&mut core, &dev, 2, 1000, root, "f", attr(1000, 0o644));
    dev.take_written();

    // Same tag twice in one batch: the second is a kernel retry and must
    // not spawn a second operation.
    dev.push_upcall(70, &getattr_upcall(1000, file), &[]);
    dev.push_upcall(70, &getattr_upcall(1000, file), &[]);
    run(&mut core, 2);

    let written = dev.written();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].tag, 70);
    assert_eq!(written[0].header.status, 0);
    assert_eq!(core.in_progress_len(), 0);
}

#[test]
fn iox_read_gathers_scattered_extents() {
    let (counting, counters) = CountingSys::new(LocalSys::new());
    let (mut core, dev) = harness(racache_opts(1), Box::new(counting));
    let root = mount(&mut core, &dev, 1);
    let file = create(&mut core, &dev, 2, 1000, root, "f", attr(1000, 0o644));
    let data = pattern(4096, 11);
    write_file(&mut core, &dev, 3, 1000, file, 0, &data, 0);
    dev.take_written();

    let pairs = [
        RwxPair { off: 0, len: 100 },
        RwxPair { off: 500, len: 200 },
        RwxPair { off: 900, len: 50 },
    ];
    let mut trailer = Vec::new();
    for p in &pairs {
        trailer.extend_from_slice(p.as_bytes());
    }
    let up = upcall(
        OpKind::FileIox,
        1000,
        UpcallData::FileIox(IoxRequest {
            io_type: io_type::READ,
            buf_index: 1,
            count: 350,
            refn: file,
        }),
    );
    dev.push_upcall(80, &up, &trailer);
    run(&mut core, 1);

    let dc = downcall_for(&dev, 80);
    assert_eq!(dc.header.status, 0);
    assert_eq!(payload::<IoDown>(&dc).amt_complete, 350);
    // Gathered bytes land consecutively in the shared slice.
    let slice = core.io_pool().slice(1).unwrap();
    assert_eq!(&slice[..100], &data[0..100]);
    assert_eq!(&slice[100..300], &data[500..700]);
    assert_eq!(&slice[300..350], &data[900..950]);
    // Three pairs fit one hindexed group.
    assert_eq!(counters.io_list_posts(), 1);
}

#[test]
fn iox_write_scatters_from_the_shared_slice() {
    let (mut core, dev) = plain_harness();
    let root = mount(&mut core, &dev, 1);
    let file = create(&mut core, &dev, 2, 1000, root, "f", attr(1000, 0o644));

    let payload_bytes = pattern(300, 42);
    core.io_pool_mut().slice_mut(1).unwrap()[..300].copy_from_slice(&payload_bytes);
    let pairs = [
        RwxPair { off: 0, len: 100 },
        RwxPair {
            off: 1000,
            len: 200,
        },
    ];
    let mut trailer = Vec::new();
    for p in &pairs {
        trailer.extend_from_slice(p.as_bytes());
    }
    let up = upcall(
        OpKind::FileIox,
        1000,
        UpcallData::FileIox(IoxRequest {
            io_type: io_type::WRITE,
            buf_index: 1,
            count: 300,
            refn: file,
        }),
    );
    dev.push_upcall(81, &up, &trailer);
    run(&mut core, 1);
    assert_eq!(downcall_for(&dev, 81).header.status, 0);

    // Read the extents back and verify placement.
    dev.push_upcall(82, &read_upcall(1000, file, 0, 1200, 2), &[]);
    run(&mut core, 1);
    let slice = core.io_pool().slice(2).unwrap();
    assert_eq!(&slice[..100], &payload_bytes[..100]);
    assert_eq!(&slice[1000..1200], &payload_bytes[100..300]);
}

#[test]
fn readdir_serializes_dirents_into_the_trailer() {
    let (mut core, dev) = plain_harness();
    let root = mount(&mut core, &dev, 1);
    for (i, name) in ["alpha", "beta", "gamma"].iter().enumerate() {
        create(
            &mut core,
            &dev,
            10 + i as u64,
            1000,
            root,
            name,
            attr(1000, 0o644),
        );
    }
    dev.take_written();

    let up = upcall(
        OpKind::Readdir,
        1000,
        UpcallData::Readdir(ReaddirRequest {
            refn: root,
            token: ITERATE_START,
            count: 16,
            buf_index: 0,
        }),
    );
    dev.push_upcall(20, &up, &[]);
    run(&mut core, 1);

    let dc = downcall_for(&dev, 20);
    assert_eq!(dc.header.status, 0);
    let down: ReaddirDown = payload(&dc);
    assert_eq!(down.entry_count, 3);
    let trailer = dc.trailer.as_deref().expect("readdir carries a trailer");
    assert_eq!(dc.header.trailer_size as usize, trailer.len());
    let (page, _) = decode_dirents(trailer).unwrap();
    let names: Vec<&str> = page.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["alpha", "beta", "gamma"]);
    assert!(page.entries.iter().all(|e| e.handle != 0));
}

#[test]
fn statfs_reports_io_pool_block_geometry() {
    let (mut core, dev) = plain_harness();
    let root = mount(&mut core, &dev, 1);

    let up = upcall(
        OpKind::Statfs,
        1000,
        UpcallData::Statfs(StatfsRequest {
            fs_id: root.fs_id,
            _pad: 0,
        }),
    );
    dev.push_upcall(30, &up, &[]);
    run(&mut core, 1);

    let dc = downcall_for(&dev, 30);
    assert_eq!(dc.header.status, 0);
    let down: StatfsDown = payload(&dc);
    // Kernel-side size math must agree with the data-plane transfer unit.
    assert_eq!(down.block_size as usize, BLOCK);
    assert!(down.blocks_total > 0);
}

#[test]
fn fs_key_param_and_features_are_serviced_inline() {
    let (mut core, dev) = plain_harness();
    let root = mount(&mut core, &dev, 1);

    // fs-key: bounded key material for the mounted filesystem.
    let up = upcall(
        OpKind::FsKey,
        0,
        UpcallData::FsKey(FsKeyRequest {
            fs_id: root.fs_id,
            _pad: 0,
        }),
    );
    dev.push_upcall(40, &up, &[]);
    run(&mut core, 1);
    let dc = downcall_for(&dev, 40);
    assert_eq!(dc.header.status, 0);
    let down: FsKeyDown = payload(&dc);
    assert!(down.keylen > 0 && down.keylen as usize <= petrel_abi::FS_KEY_MAX);

    // param: set then get the acache timeout through the engine.
    let set = upcall(
        OpKind::Param,
        0,
        UpcallData::Param(ParamRequest {
            op: petrel_abi::param_op::SET,
            subsystem: subsystem::ACACHE,
            param: petrel_abi::param_kind::TIMEOUT_MSECS,
            _pad: 0,
            value: 12345,
        }),
    );
    dev.push_upcall(41, &set, &[]);
    let get = upcall(
        OpKind::Param,
        0,
        UpcallData::Param(ParamRequest {
            op: petrel_abi::param_op::GET,
            subsystem: subsystem::ACACHE,
            param: petrel_abi::param_kind::TIMEOUT_MSECS,
            _pad: 0,
            value: 0,
        }),
    );
    dev.push_upcall(42, &get, &[]);
    run(&mut core, 1);
    assert_eq!(downcall_for(&dev, 41).header.status, 0);
    let dc = downcall_for(&dev, 42);
    assert_eq!(dc.header.status, 0);
    assert_eq!(payload::<ParamDown>(&dc).value, 12345);

    // features: the readahead capability bit follows the cache config.
    let up = upcall(
        OpKind::Features,
        0,
        UpcallData::Features(FeaturesRequest { mask: 0 }),
    );
    dev.push_upcall(43, &up, &[]);
    run(&mut core, 1);
    let dc = downcall_for(&dev, 43);
    assert_eq!(dc.header.status, 0);
    assert_eq!(
        payload::<FeaturesDown>(&dc).features,
        petrel_abi::FEATURE_READAHEAD
    );
}

#[test]
fn cancel_of_unknown_or_noncancellable_tag_succeeds_quietly() {
    let (mut core, dev) = plain_harness();
    mount(&mut core, &dev, 1);
    dev.take_written();

    let up = upcall(
        OpKind::Cancel,
        1000,
        UpcallData::Cancel(petrel_abi::CancelRequest { op_tag: 9999 }),
    );
    dev.push_upcall(50, &up, &[]);
    run(&mut core, 1);

    // The target finished (or never existed): cancellation arrived too
    // late, which is success.
    let dc = downcall_for(&dev, 50);
    assert_eq!(dc.header.status, 0);
}
