//! Vectored I/O fan-out.
//!
//! An iox upcall carries a trailer of (offset, length) pairs describing a
//! scatter/gather pattern against one object. The pairs are partitioned
//! into groups of at most [`IOX_GROUP_MAX`]; each group becomes one
//! engine sub-operation whose memory extent is the sum of the group's
//! lengths, placed consecutively in the shared slice.

use petrel_abi::{err, RwxPair};
use zerocopy::FromBytes;

/// Maximum (offset, length) pairs per sub-operation.
pub const IOX_GROUP_MAX: usize = 64;

/// One sub-operation's slice of the pair list and of the shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoxGroup {
    /// Index of the first pair in this group.
    pub pairs_start: usize,
    /// Number of pairs in this group.
    pub pairs_len: usize,
    /// Byte offset of this group's data within the shared slice.
    pub mem_offset: usize,
    /// Total bytes transferred by this group.
    pub mem_len: usize,
}

/// Interpret an iox trailer as an array of [`RwxPair`]s.
pub fn parse_trailer(trailer: &[u8]) -> Result<Vec<RwxPair>, i32> {
    let pair_size = core::mem::size_of::<RwxPair>();
    if trailer.is_empty() || trailer.len() % pair_size != 0 {
        return Err(err::EINVAL);
    }
    let count = trailer.len() / pair_size;
    let mut pairs = Vec::with_capacity(count);
    for chunk in trailer.chunks_exact(pair_size) {
        let pair = RwxPair::read_from_bytes(chunk).map_err(|_| err::EINVAL)?;
        if pair.len < 0 || pair.off < 0 {
            return Err(err::EINVAL);
        }
        pairs.push(pair);
    }
    Ok(pairs)
}

/// Partition pairs into submission groups with consecutive memory extents.
pub fn split_groups(pairs: &[RwxPair]) -> Vec<IoxGroup> {
    let mut groups = Vec::with_capacity(pairs.len().div_ceil(IOX_GROUP_MAX));
    let mut mem_offset = 0usize;
    let mut start = 0usize;
    while start < pairs.len() {
        let len = (pairs.len() - start).min(IOX_GROUP_MAX);
        let mem_len: usize = pairs[start..start + len]
            .iter()
            .map(|p| p.len as usize)
            .sum();
        groups.push(IoxGroup {
            pairs_start: start,
            pairs_len: len,
            mem_offset,
            mem_len,
        });
        mem_offset += mem_len;
        start += len;
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn pairs(n: usize) -> Vec<RwxPair> {
        (0..n)
            .map(|i| RwxPair {
                off: (i * 1000) as i64,
                len: 100,
            })
            .collect()
    }

    #[test]
    fn trailer_round_trips() {
        let original = pairs(3);
        let mut bytes = Vec::new();
        for p in &original {
            bytes.extend_from_slice(p.as_bytes());
        }
        assert_eq!(parse_trailer(&bytes).unwrap(), original);
    }

    #[test]
    fn trailer_must_be_pair_aligned() {
        assert_eq!(parse_trailer(&[]), Err(err::EINVAL));
        assert_eq!(parse_trailer(&[0u8; 15]), Err(err::EINVAL));
    }

    #[test]
    fn trailer_rejects_negative_extents() {
        let bad = RwxPair { off: -1, len: 100 };
        assert_eq!(parse_trailer(bad.as_bytes()), Err(err::EINVAL));
    }

    #[test]
    fn small_lists_are_one_group() {
        let groups = split_groups(&pairs(3));
        assert_eq!(
            groups,
            vec![IoxGroup {
                pairs_start: 0,
                pairs_len: 3,
                mem_offset: 0,
                mem_len: 300,
            }]
        );
    }

    #[test]
    fn groups_split_at_the_hindexed_limit() {
        let groups = split_groups(&pairs(IOX_GROUP_MAX * 2 + 5));
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].pairs_len, IOX_GROUP_MAX);
        assert_eq!(groups[1].pairs_start, IOX_GROUP_MAX);
        assert_eq!(groups[2].pairs_len, 5);
        // Memory extents are consecutive.
        assert_eq!(groups[1].mem_offset, groups[0].mem_len);
        assert_eq!(
            groups[2].mem_offset,
            groups[0].mem_len + groups[1].mem_len
        );
    }

    #[test]
    fn exact_multiple_has_no_empty_tail_group() {
        let groups = split_groups(&pairs(IOX_GROUP_MAX));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].pairs_len, IOX_GROUP_MAX);
    }
}
