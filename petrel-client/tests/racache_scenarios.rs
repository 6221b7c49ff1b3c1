//! End-to-end readahead cache scenarios, driven through the mock device
//! and the embedded engine.

mod common;

use common::*;

use petrel_abi::{err, CancelRequest, IoDown, OpKind, UpcallData};
use petrel_client::sys::local::LocalSys;
use petrel_client::testing::{harness, CountingSys};

#[test]
fn cold_read_fills_block_and_speculates() {
    let (counting, counters) = CountingSys::new(LocalSys::new());
    let (mut core, dev) = harness(racache_opts(4), Box::new(counting));

    let root = mount(&mut core, &dev, 1);
    let file = create(&mut core, &dev, 2, 1000, root, "data", attr(1000, 0o644));

    // Four blocks of file content.
    let data = pattern(BLOCK * 4, 7);
    for (i, chunk) in data.chunks(BLOCK).enumerate() {
        write_file(
            &mut core,
            &dev,
            10 + i as u64,
            1000,
            file,
            (i * BLOCK) as i64,
            chunk,
            0,
        );
    }
    let writes = counters.io_posts();
    dev.take_written();

    // Cold read of the first 4 KiB: misses, fills block 0, then issues
    // readcnt-1 speculative block reads.
    dev.push_upcall(20, &read_upcall(1000, file, 0, 4096, 2), &[]);
    run(&mut core, 1);

    let dc = downcall_for(&dev, 20);
    assert_eq!(dc.header.status, 0);
    let io: IoDown = payload(&dc);
    assert_eq!(io.amt_complete, 4096);
    assert_eq!(&core.io_pool().slice(2).unwrap()[..4096], &data[..4096]);
    assert!(core.racache().has_valid_block(obj(file)));
    // One primary read plus three phantoms were posted.
    assert_eq!(counters.io_posts(), writes + 4);

    // Let the phantom fills complete.
    run(&mut core, 2);
    assert_eq!(core.racache().blocks_in_use(), 4);
    assert_eq!(core.in_progress_len(), 0);

    // The second half of block 0 is now a pure cache hit: no new engine
    // traffic, data served from the block.
    dev.take_written();
    dev.push_upcall(21, &read_upcall(1000, file, 4096, 4096, 3), &[]);
    run(&mut core, 1);
    let dc = downcall_for(&dev, 21);
    assert_eq!(dc.header.status, 0);
    let io: IoDown = payload(&dc);
    assert_eq!(io.amt_complete, 4096);
    assert_eq!(
        &core.io_pool().slice(3).unwrap()[..4096],
        &data[4096..8192]
    );
    assert_eq!(counters.io_posts(), writes + 4);

    // A read in a speculatively fetched block also hits. Its speculation
    // chain reaches one block past the file's known extent, so exactly one
    // more phantom goes out (and comes back empty).
    dev.push_upcall(22, &read_upcall(1000, file, BLOCK as i64, 4096, 4), &[]);
    run(&mut core, 1);
    let dc = downcall_for(&dev, 22);
    assert_eq!(dc.header.status, 0);
    assert_eq!(
        &core.io_pool().slice(4).unwrap()[..4096],
        &data[BLOCK..BLOCK + 4096]
    );
    assert_eq!(counters.io_posts(), writes + 5);
}

#[test]
fn concurrent_readers_coalesce_on_one_block() {
    let (counting, counters) = CountingSys::new(LocalSys::new());
    // readcnt 1: no speculation, so engine traffic is exactly the fills.
    let (mut core, dev) = harness(racache_opts(1), Box::new(counting));

    let root = mount(&mut core, &dev, 1);
    let file = create(&mut core, &dev, 2, 1000, root, "data", attr(1000, 0o644));
    let data = pattern(BLOCK, 3);
    write_file(&mut core, &dev, 3, 1000, file, 0, &data, 0);
    let baseline = counters.io_posts();
    dev.take_written();

    // Both readers arrive before the block fill completes: the first
    // triggers the read, the second joins its waiter queue.
    dev.push_upcall(30, &read_upcall(1000, file, 0, 2048, 1), &[]);
    dev.push_upcall(31, &read_upcall(1000, file, 2048, 2048, 2), &[]);
    run(&mut core, 1);

    let a = downcall_for(&dev, 30);
    let b = downcall_for(&dev, 31);
    assert_eq!(a.header.status, 0);
    assert_eq!(b.header.status, 0);
    assert_eq!(payload::<IoDown>(&a).amt_complete, 2048);
    assert_eq!(payload::<IoDown>(&b).amt_complete, 2048);
    assert_eq!(&core.io_pool().slice(1).unwrap()[..2048], &data[..2048]);
    assert_eq!(&core.io_pool().slice(2).unwrap()[..2048], &data[2048..4096]);

    // Exactly one engine read serviced both.
    assert_eq!(counters.io_posts(), baseline + 1);
    assert_eq!(core.in_progress_len(), 0);
}

#[test]
fn write_invalidates_cached_blocks() {
    let (counting, counters) = CountingSys::new(LocalSys::new());
    let (mut core, dev) = harness(racache_opts(1), Box::new(counting));

    let root = mount(&mut core, &dev, 1);
    let file = create(&mut core, &dev, 2, 1000, root, "data", attr(1000, 0o644));
    let data = pattern(BLOCK, 9);
    write_file(&mut core, &dev, 3, 1000, file, 0, &data, 0);

    dev.push_upcall(40, &read_upcall(1000, file, 0, 2048, 1), &[]);
    run(&mut core, 1);
    assert!(core.racache().has_valid_block(obj(file)));

    // The write tears the object's blocks down before it is submitted.
    let update = pattern(1024, 77);
    write_file(&mut core, &dev, 41, 1000, file, 0, &update, 0);
    assert!(!core.racache().has_valid_block(obj(file)));

    // The next read misses and fetches fresh data, including the update.
    let before = counters.io_posts();
    dev.push_upcall(42, &read_upcall(1000, file, 0, 2048, 2), &[]);
    run(&mut core, 1);
    assert_eq!(counters.io_posts(), before + 1);
    assert_eq!(&core.io_pool().slice(2).unwrap()[..1024], &update[..]);
    assert_eq!(&core.io_pool().slice(2).unwrap()[1024..2048], &data[1024..2048]);
}

#[test]
fn cancellation_mid_read_frees_block_and_suppresses_downcall() {
    let (counting, counters) = CountingSys::new(LocalSys::new());
    let (mut core, dev) = harness(racache_opts(1), Box::new(counting));

    let root = mount(&mut core, &dev, 1);
    let file = create(&mut core, &dev, 2, 1000, root, "data", attr(1000, 0o644));
    write_file(&mut core, &dev, 3, 1000, file, 0, &pattern(BLOCK, 1), 0);
    dev.take_written();
    let parked_before = core.parked_len();

    // The read posts a block fill; the cancel lands before the fill
    // completes and unwinds it.
    dev.push_upcall(50, &read_upcall(1000, file, 0, 2048, 1), &[]);
    dev.push_upcall(
        51,
        &upcall(
            OpKind::Cancel,
            1000,
            UpcallData::Cancel(CancelRequest { op_tag: 50 }),
        ),
        &[],
    );
    run(&mut core, 2);

    let written = dev.written();
    // Only the cancel's own downcall was written; the cancelled read's was
    // suppressed.
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].tag, 51);
    assert_eq!(written[0].header.status, err::EINTR);
    assert_eq!(counters.cancel_calls(), 1);

    // Block freed, table drained, both descriptors back on the ring.
    assert_eq!(core.racache().blocks_in_use(), 0);
    assert_eq!(core.in_progress_len(), 0);
    assert_eq!(core.parked_len(), parked_before);
}

#[test]
fn speculation_stops_at_eof() {
    let (counting, counters) = CountingSys::new(LocalSys::new());
    let (mut core, dev) = harness(racache_opts(4), Box::new(counting));

    let root = mount(&mut core, &dev, 1);
    let file = create(&mut core, &dev, 2, 1000, root, "small", attr(1000, 0o644));
    // One and a half blocks: block 0 fills completely, block 1 is short.
    write_file(&mut core, &dev, 3, 1000, file, 0, &pattern(BLOCK, 5), 0);
    write_file(
        &mut core,
        &dev,
        4,
        1000,
        file,
        BLOCK as i64,
        &pattern(BLOCK / 2, 6),
        0,
    );
    let baseline = counters.io_posts();

    dev.push_upcall(60, &read_upcall(1000, file, 0, 2048, 1), &[]);
    run(&mut core, 2);
    // Primary fill plus three phantoms (blocks 1-3).
    assert_eq!(counters.io_posts(), baseline + 4);

    // Block 1 came back short (EOF): a completed phantom at EOF must not
    // extend the chain further.
    run(&mut core, 2);
    assert_eq!(counters.io_posts(), baseline + 4);
}
