//! Tag-to-descriptor map of outstanding non-inline operations.
//!
//! Tags are kernel-assigned and unique per upcall round-trip; a second
//! upcall carrying a tag already in the table is a kernel retry and is
//! discarded by the caller.

use std::collections::BTreeMap;

use crate::request::ReqId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateTag;

#[derive(Default)]
pub struct InProgressTable {
    ops: BTreeMap<u64, ReqId>,
}

impl InProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn insert(&mut self, tag: u64, req: ReqId) -> Result<(), DuplicateTag> {
        if self.ops.contains_key(&tag) {
            return Err(DuplicateTag);
        }
        self.ops.insert(tag, req);
        Ok(())
    }

    pub fn contains(&self, tag: u64) -> bool {
        self.ops.contains_key(&tag)
    }

    pub fn get(&self, tag: u64) -> Option<ReqId> {
        self.ops.get(&tag).copied()
    }

    /// Remove the entry for `tag`, returning its descriptor.
    pub fn remove(&mut self, tag: u64) -> Option<ReqId> {
        self.ops.remove(&tag)
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_tags_are_rejected() {
        let mut table = InProgressTable::new();
        table.insert(7, ReqId(0)).unwrap();
        assert_eq!(table.insert(7, ReqId(1)), Err(DuplicateTag));
        // The original mapping survives the rejected insert.
        assert_eq!(table.get(7), Some(ReqId(0)));
    }

    #[test]
    fn remove_is_single_shot() {
        let mut table = InProgressTable::new();
        table.insert(1, ReqId(4)).unwrap();
        assert_eq!(table.remove(1), Some(ReqId(4)));
        assert_eq!(table.remove(1), None);
        assert!(table.is_empty());
    }

    #[test]
    fn same_tag_reusable_after_removal() {
        let mut table = InProgressTable::new();
        table.insert(3, ReqId(0)).unwrap();
        table.remove(3);
        table.insert(3, ReqId(5)).unwrap();
        assert_eq!(table.get(3), Some(ReqId(5)));
    }
}
