//! Readahead cache.
//!
//! Sequential mmap/read workloads otherwise generate many small synchronous
//! engine round-trips; this cache coalesces them into full-block reads with
//! speculative prefetch. Blocks are fixed-size, aligned file regions keyed
//! by (object, offset). At most one request fills a block; everyone else
//! arriving for the same block queues on it in FIFO order and is completed
//! from the filled buffer.
//!
//! The cache owns no engine state: the request loop posts the block fill,
//! reports its completion, and tears blocks down on writes and cancels.

use std::collections::VecDeque;

use log::debug;

use petrel_abi::RA_READCNT_UNSET;

use crate::request::ReqId;
use crate::sys::ObjectRef;

/// Stable identity of a cache block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockId(pub usize);

/// Result of a block lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaLookup {
    /// A valid block covers the request; `amt` bytes are available from
    /// the requested offset (may be short near EOF).
    Hit { amt: usize },
    /// The block exists but is still being filled; the requester was
    /// queued (unless speculative).
    Wait,
    /// A block was allocated and the requester is now its primary reader.
    Read,
    /// No block could be allocated.
    None,
}

struct RaBlock {
    buff_id: usize,
    buffer: Vec<u8>,
    refn: ObjectRef,
    file_offset: i64,
    data_sz: usize,
    valid: bool,
    readcnt: i32,
    primary: Option<ReqId>,
    waiters: VecDeque<ReqId>,
    being_freed: bool,
    in_use: bool,
    last_use: u64,
}

/// Teardown record handed to the request loop by [`ReadaheadCache::flush`].
#[derive(Debug)]
pub struct Teardown {
    pub block: BlockId,
    /// Primary reader of a still-filling block; its engine op must be
    /// cancelled by the caller.
    pub primary: Option<ReqId>,
    pub waiters: Vec<ReqId>,
}

pub struct ReadaheadCache {
    blocks: Vec<RaBlock>,
    buff_size: usize,
    default_readcnt: i32,
    pinned: bool,
    tick: u64,
}

impl ReadaheadCache {
    pub fn new(count: usize, size: usize, readcnt: i32, pinned: bool) -> Self {
        let blocks = (0..count)
            .map(|buff_id| RaBlock {
                buff_id,
                buffer: vec![0u8; size],
                refn: ObjectRef::NULL,
                file_offset: 0,
                data_sz: 0,
                valid: false,
                readcnt: 0,
                primary: None,
                waiters: VecDeque::new(),
                being_freed: false,
                in_use: false,
                last_use: 0,
            })
            .collect();
        Self {
            blocks,
            buff_size: size,
            default_readcnt: readcnt,
            pinned,
            tick: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.blocks.is_empty() && self.buff_size > 0
    }

    pub fn buff_size(&self) -> usize {
        self.buff_size
    }

    pub fn default_readcnt(&self) -> i32 {
        self.default_readcnt
    }

    /// Whether an incoming read may use the cache at all.
    pub fn eligible(&self, count: i64, readahead_size: i32) -> bool {
        self.enabled()
            && count > 0
            && count as usize * 2 <= self.buff_size
            && readahead_size != 0
            && (readahead_size != RA_READCNT_UNSET || self.default_readcnt != 0)
    }

    /// Read count for a block, derived from the upcall's advertised
    /// readahead extent.
    pub fn readcnt_for(&self, readahead_size: i32) -> i32 {
        if readahead_size == RA_READCNT_UNSET || readahead_size < 0 {
            self.default_readcnt
        } else {
            readahead_size / self.buff_size as i32 + 1
        }
    }

    fn touch(&mut self, id: usize) {
        self.tick += 1;
        self.blocks[id].last_use = self.tick;
    }

    fn find(&self, refn: ObjectRef, aligned: i64) -> Option<usize> {
        self.blocks.iter().position(|b| {
            b.in_use && !b.being_freed && b.refn == refn && b.file_offset == aligned
        })
    }

    fn allocate(&mut self) -> Option<usize> {
        if let Some(id) = self.blocks.iter().position(|b| !b.in_use) {
            return Some(id);
        }
        if self.pinned {
            // Resident blocks are never reclaimed for another extent.
            return None;
        }
        // LRU over valid, quiescent blocks. A block with a primary or any
        // waiter is pinned until its readers drain.
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.in_use && b.valid && b.primary.is_none() && b.waiters.is_empty() && !b.being_freed
            })
            .min_by_key(|(_, b)| b.last_use)
            .map(|(id, _)| id)
    }

    /// Look up (object, offset) for a read of `len` bytes.
    pub fn get_block(
        &mut self,
        refn: ObjectRef,
        offset: i64,
        len: usize,
        speculative: bool,
        req: ReqId,
    ) -> (RaLookup, Option<BlockId>) {
        let aligned = offset - offset.rem_euclid(self.buff_size as i64);

        if let Some(id) = self.find(refn, aligned) {
            self.touch(id);
            let block = &mut self.blocks[id];
            if block.valid {
                let delta = (offset - block.file_offset) as usize;
                let amt = len.min(block.data_sz.saturating_sub(delta));
                return (RaLookup::Hit { amt }, Some(BlockId(id)));
            }
            if !speculative {
                block.waiters.push_back(req);
            }
            return (RaLookup::Wait, Some(BlockId(id)));
        }

        let Some(id) = self.allocate() else {
            return (RaLookup::None, None);
        };
        self.touch(id);
        let block = &mut self.blocks[id];
        debug!(target: "racache",
               "block {} assigned to ({}, {}) offset {}",
               block.buff_id, refn.fs_id, refn.handle, aligned);
        block.refn = refn;
        block.file_offset = aligned;
        block.data_sz = 0;
        block.valid = false;
        block.readcnt = self.default_readcnt;
        block.primary = Some(req);
        block.waiters.clear();
        block.being_freed = false;
        block.in_use = true;
        (RaLookup::Read, Some(BlockId(id)))
    }

    pub fn set_readcnt(&mut self, id: BlockId, readcnt: i32) {
        self.blocks[id.0].readcnt = readcnt;
    }

    pub fn readcnt(&self, id: BlockId) -> i32 {
        self.blocks[id.0].readcnt
    }

    pub fn file_offset(&self, id: BlockId) -> i64 {
        self.blocks[id.0].file_offset
    }

    pub fn refn(&self, id: BlockId) -> ObjectRef {
        self.blocks[id.0].refn
    }

    pub fn data_sz(&self, id: BlockId) -> usize {
        self.blocks[id.0].data_sz
    }

    pub fn is_valid(&self, id: BlockId) -> bool {
        self.blocks[id.0].valid
    }

    pub fn is_being_freed(&self, id: BlockId) -> bool {
        self.blocks[id.0].being_freed
    }

    pub fn primary(&self, id: BlockId) -> Option<ReqId> {
        self.blocks[id.0].primary
    }

    pub fn buffer(&self, id: BlockId) -> &[u8] {
        &self.blocks[id.0].buffer
    }

    /// Copy fill data into the block and mark it valid. Returns the number
    /// of bytes stored (short data indicates EOF).
    pub fn complete_fill(&mut self, id: BlockId, data: &[u8]) -> usize {
        let block = &mut self.blocks[id.0];
        let n = data.len().min(block.buffer.len());
        block.buffer[..n].copy_from_slice(&data[..n]);
        block.data_sz = n;
        block.valid = true;
        debug!(target: "racache", "block {} filled with {} bytes", block.buff_id, n);
        n
    }

    /// Drain the waiter queue in arrival order. The primary is not part of
    /// the queue; [`Self::clear_primary`] releases it separately.
    pub fn take_waiters(&mut self, id: BlockId) -> Vec<ReqId> {
        self.blocks[id.0].waiters.drain(..).collect()
    }

    pub fn has_waiters(&self, id: BlockId) -> bool {
        !self.blocks[id.0].waiters.is_empty()
    }

    /// Remove one waiter (cancellation path). Returns false when the
    /// request was not queued on this block.
    pub fn remove_waiter(&mut self, id: BlockId, req: ReqId) -> bool {
        let waiters = &mut self.blocks[id.0].waiters;
        match waiters.iter().position(|w| *w == req) {
            Some(at) => {
                waiters.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn clear_primary(&mut self, id: BlockId) {
        self.blocks[id.0].primary = None;
    }

    pub fn mark_being_freed(&mut self, id: BlockId) {
        self.blocks[id.0].being_freed = true;
    }

    /// Release a block back to the free pool.
    pub fn make_free(&mut self, id: BlockId) {
        let block = &mut self.blocks[id.0];
        debug!(target: "racache", "block {} made free", block.buff_id);
        block.in_use = false;
        block.valid = false;
        block.data_sz = 0;
        block.primary = None;
        block.waiters.clear();
        block.being_freed = false;
        block.refn = ObjectRef::NULL;
    }

    /// Tear down every block belonging to `refn`, whatever its state.
    /// Valid quiescent blocks are freed here; blocks with a pending fill or
    /// waiters are marked `being_freed` and returned so the caller can
    /// cancel the fill and repost the waiters before releasing them.
    pub fn flush(&mut self, refn: ObjectRef) -> Vec<Teardown> {
        let mut teardowns = Vec::new();
        for id in 0..self.blocks.len() {
            let block = &mut self.blocks[id];
            if !block.in_use || block.refn != refn {
                continue;
            }
            if block.valid && block.primary.is_none() && block.waiters.is_empty() {
                self.make_free(BlockId(id));
                continue;
            }
            block.being_freed = true;
            let primary = block.primary.take();
            let waiters = block.waiters.drain(..).collect();
            teardowns.push(Teardown {
                block: BlockId(id),
                primary,
                waiters,
            });
        }
        teardowns
    }

    /// Number of blocks currently holding data or being filled.
    pub fn blocks_in_use(&self) -> usize {
        self.blocks.iter().filter(|b| b.in_use).count()
    }

    /// Whether any valid block exists for `refn`.
    pub fn has_valid_block(&self, refn: ObjectRef) -> bool {
        self.blocks
            .iter()
            .any(|b| b.in_use && b.valid && b.refn == refn)
    }
}
