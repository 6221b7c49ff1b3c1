//! Request descriptors.
//!
//! A fixed ring of descriptors is allocated at startup; each represents one
//! upcall's lifetime and is wiped and reposted when its downcall is
//! written. Speculative readahead requests ("phantoms") are allocated from
//! extra slab slots: they carry no kernel tag, never enter the in-progress
//! table, and never produce a downcall.

use std::time::Instant;

use petrel_abi::Upcall;

use crate::buffers::PoolKind;
use crate::racache::BlockId;
use crate::sys::{OpId, SysReply};

/// Maximum concurrent operations, and the size of the descriptor ring.
pub const MAX_NUM_OPS: usize = 64;

/// Stable identity of a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReqId(pub usize);

/// Readahead-cache relationship of an I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaState {
    /// Not using the cache.
    #[default]
    None,
    /// Served from a valid block.
    Hit,
    /// Queued on a block another request is filling.
    Wait,
    /// This request posted the block fill and owns its completion.
    Posted,
}

/// One in-flight sub-operation of a vectored I/O request.
#[derive(Debug, Clone, Copy)]
pub struct SubOp {
    pub op_id: OpId,
    /// Byte offset of this group's data within the shared slice.
    pub mem_offset: usize,
    pub len: usize,
    pub complete: bool,
}

/// One upcall's lifetime.
#[derive(Debug, Default)]
pub struct VfsRequest {
    pub tag: u64,
    /// Parked as a device receive, waiting for an upcall.
    pub is_unexpected: bool,
    pub upcall: Option<Upcall>,
    pub trailer: Vec<u8>,

    pub downcall: Option<petrel_abi::Downcall>,
    /// Downcall trailer location: (pool, slice index, byte length).
    pub trailer_out: Option<(PoolKind, i32, usize)>,

    pub op_id: OpId,
    pub sub_ops: Vec<SubOp>,
    pub num_ops: usize,
    pub num_incomplete_ops: usize,
    /// Aggregate bytes completed across sub-operations.
    pub amt_complete: i64,

    pub was_cancelled: bool,
    pub handled_inline: bool,

    pub is_speculative: bool,
    pub racache_state: RaState,
    pub racache_block: Option<BlockId>,

    pub reply: SysReply,
    pub error: i32,
    pub started: Option<Instant>,
}

impl VfsRequest {
    /// Reset to the parked state. Every heap field is dropped so a reposted
    /// descriptor carries nothing from its previous life.
    pub fn wipe(&mut self) {
        *self = VfsRequest {
            is_unexpected: true,
            ..VfsRequest::default()
        };
    }
}

/// Fixed-capacity descriptor slab: the unexpected ring plus phantom slots.
pub struct RequestSlab {
    slots: Vec<VfsRequest>,
    ring: usize,
    free_phantoms: Vec<usize>,
}

impl RequestSlab {
    /// `ring` descriptors parked for device receives plus `extra` slots for
    /// speculative requests.
    pub fn new(ring: usize, extra: usize) -> Self {
        let mut slots = Vec::with_capacity(ring + extra);
        for _ in 0..ring + extra {
            let mut req = VfsRequest::default();
            req.wipe();
            slots.push(req);
        }
        let free_phantoms = (ring..ring + extra).rev().collect();
        Self {
            slots,
            ring,
            free_phantoms,
        }
    }

    pub fn ring_len(&self) -> usize {
        self.ring
    }

    pub fn get(&self, id: ReqId) -> &VfsRequest {
        &self.slots[id.0]
    }

    /// Range-checked access for externally supplied completion tokens.
    pub fn try_get(&self, id: ReqId) -> Option<&VfsRequest> {
        self.slots.get(id.0)
    }

    pub fn get_mut(&mut self, id: ReqId) -> &mut VfsRequest {
        &mut self.slots[id.0]
    }

    /// Allocate a phantom descriptor, or `None` when the phantom pool is
    /// exhausted (the speculation chain just ends).
    pub fn alloc_phantom(&mut self) -> Option<ReqId> {
        let slot = self.free_phantoms.pop()?;
        let req = &mut self.slots[slot];
        req.wipe();
        req.is_unexpected = false;
        req.is_speculative = true;
        Some(ReqId(slot))
    }

    /// Return a phantom slot to the pool.
    pub fn free_phantom(&mut self, id: ReqId) {
        debug_assert!(self.slots[id.0].is_speculative);
        self.slots[id.0].wipe();
        self.slots[id.0].is_unexpected = false;
        self.free_phantoms.push(id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wipe_clears_all_operation_state() {
        let mut req = VfsRequest::default();
        req.tag = 42;
        req.trailer = vec![1, 2, 3];
        req.sub_ops.push(SubOp {
            op_id: OpId(9),
            mem_offset: 0,
            len: 10,
            complete: false,
        });
        req.num_ops = 3;
        req.was_cancelled = true;
        req.racache_state = RaState::Posted;
        req.racache_block = Some(BlockId(2));
        req.error = -5;
        req.wipe();
        assert_eq!(req.tag, 0);
        assert!(req.is_unexpected);
        assert!(req.trailer.is_empty());
        assert!(req.sub_ops.is_empty());
        assert!(!req.was_cancelled);
        assert_eq!(req.racache_state, RaState::None);
        assert_eq!(req.racache_block, None);
        assert_eq!(req.error, 0);
    }

    #[test]
    fn phantom_slots_recycle() {
        let mut slab = RequestSlab::new(4, 2);
        let a = slab.alloc_phantom().unwrap();
        let b = slab.alloc_phantom().unwrap();
        assert!(slab.alloc_phantom().is_none());
        assert!(slab.get(a).is_speculative);
        slab.free_phantom(a);
        let c = slab.alloc_phantom().unwrap();
        assert_eq!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn ring_descriptors_start_parked() {
        let slab = RequestSlab::new(3, 1);
        for i in 0..3 {
            assert!(slab.get(ReqId(i)).is_unexpected);
        }
    }
}
