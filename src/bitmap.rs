//! Inode bitmap (ialloc): one bit per inode slot in a group, densely
//! packed in little-endian order (bit `i` is bit `i % 8` of byte `i / 8`).

use crate::device::BufferCache;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::ids::{GroupNumber, InodeNumber};
use crate::locks::GroupLocks;

/// Tests whether bit `i` is set in a packed bitmap byte slice.
#[must_use]
pub fn test_bit(bitmap: &[u8], i: u32) -> bool {
    let byte = bitmap[(i / 8) as usize];
    (byte >> (i % 8)) & 1 != 0
}

/// Sets bit `i` in a packed bitmap byte slice.
pub fn set_bit(bitmap: &mut [u8], i: u32) {
    bitmap[(i / 8) as usize] |= 1 << (i % 8);
}

/// Clears bit `i` in a packed bitmap byte slice.
pub fn clear_bit(bitmap: &mut [u8], i: u32) {
    bitmap[(i / 8) as usize] &= !(1 << (i % 8));
}

/// Finds the first unset bit in `bitmap`, scanning up to `limit` bits.
/// Returns `None` if every bit in range is set.
#[must_use]
pub fn find_first_zero(bitmap: &[u8], limit: u32) -> Option<u32> {
    for i in 0..limit {
        if !test_bit(bitmap, i) {
            return Some(i);
        }
    }
    None
}

/// Allocates a free inode number, starting the search at `parent`'s group
/// and wrapping around every other group in order (§4.2). Uses strict
/// `>=` when wrapping past `num_groups`, so group 0 is never skipped on
/// wrap.
pub fn alloc_inode(
    geo: &Geometry,
    cache: &dyn BufferCache,
    locks: &GroupLocks,
    parent: InodeNumber,
) -> Result<InodeNumber> {
    let (start_group, _) = geo.inode_location(parent);
    for offset in 0..geo.num_groups {
        let group = GroupNumber((start_group.0 + offset) % geo.num_groups);
        let found = locks.with(group, || alloc_in_group(geo, cache, group))?;
        if let Some(ino) = found {
            return Ok(ino);
        }
    }
    Err(Error::no_space())
}

fn alloc_in_group(
    geo: &Geometry,
    cache: &dyn BufferCache,
    group: GroupNumber,
) -> Result<Option<InodeNumber>> {
    let bitmap_blocks = geo.inode_bitmap_blocks();
    let group_inodes = geo.group_inode_count(group);
    for blk_idx in 0..bitmap_blocks {
        let blk = geo.bitmap_start(group) + u64::from(blk_idx);
        let mut handle = cache.get(blk)?;
        let bits_per_block = geo.block_size * 8;
        let base_bit = blk_idx * bits_per_block;
        if base_bit >= group_inodes {
            break;
        }
        let limit = core::cmp::min(bits_per_block, group_inodes - base_bit);
        if let Some(local_bit) = find_first_zero(handle.bytes(), limit) {
            set_bit(handle.bytes_mut(), local_bit);
            handle.mark_dirty();
            let local = base_bit + local_bit;
            return Ok(Some(geo.compose_inode(group, local)));
        }
    }
    Ok(None)
}

/// Frees an inode number's bitmap bit. Double-free is tolerated (clearing
/// an already-clear bit is a no-op), matching spec's "not required to be
/// idempotent, but not a panic either" stance.
pub fn free_inode(
    geo: &Geometry,
    cache: &dyn BufferCache,
    locks: &GroupLocks,
    ino: InodeNumber,
) -> Result<()> {
    let (group, local) = geo.inode_location(ino);
    locks.with(group, || -> Result<()> {
        let blk_idx = local / (geo.block_size * 8);
        let bit_in_block = local % (geo.block_size * 8);
        let blk = geo.bitmap_start(group) + u64::from(blk_idx);
        let mut handle = cache.get(blk)?;
        clear_bit(handle.bytes_mut(), bit_in_block);
        handle.mark_dirty();
        Ok(())
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bit_ops_round_trip() {
        let mut bitmap = [0u8; 4];
        assert!(!test_bit(&bitmap, 5));
        set_bit(&mut bitmap, 5);
        assert!(test_bit(&bitmap, 5));
        assert_eq!(find_first_zero(&bitmap, 32), Some(0));
        clear_bit(&mut bitmap, 5);
        assert!(!test_bit(&bitmap, 5));
    }

    #[test]
    fn find_first_zero_returns_none_when_full() {
        let bitmap = [0xffu8; 2];
        assert_eq!(find_first_zero(&bitmap, 16), None);
    }

    #[test]
    fn find_first_zero_respects_limit() {
        let bitmap = [0x01u8; 1];
        // bit 0 is set; limit of 1 means "only look at bit 0", which is taken.
        assert_eq!(find_first_zero(&bitmap, 1), None);
        assert_eq!(find_first_zero(&bitmap, 8), Some(1));
    }
}
