//! Block mapper, grower, and truncator (§4.4–§4.6).
//!
//! A file's logical blocks are the concatenation, in array order, of its
//! inode's direct extents followed by the extents of each continuation
//! node in chain order. This module walks that structure to map
//! `(inode, lbn)` to a physical block, grows it on demand, and shrinks it
//! on truncate.

use crate::device::BufferCache;
use crate::error::{Error, Result};
use crate::geometry::{div_ceil_u64, Geometry};
use crate::ids::{BlockNumber, GroupNumber};
use crate::inode::{ExtentRaw, InodeState};
use crate::locks::GroupLocks;
use crate::refmap;
use crate::time::Timestamp;
use bytemuck::{Pod, Zeroable};

/// The overflow-node header: `{length, next}`, followed by a densely
/// packed array of [`ExtentRaw`] filling the rest of the block.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct ContinuationHeader {
    length: u64,
    next: u64,
}

const HEADER_LEN: usize = core::mem::size_of::<ContinuationHeader>();
const EXTENT_LEN: usize = core::mem::size_of::<ExtentRaw>();

fn cont_extents_count(geo: &Geometry) -> usize {
    (geo.block_size as usize - HEADER_LEN) / EXTENT_LEN
}

fn read_cont_header(cache: &dyn BufferCache, blk: BlockNumber) -> Result<ContinuationHeader> {
    let handle = cache.get(blk)?;
    Ok(*bytemuck::from_bytes(&handle.bytes()[..HEADER_LEN]))
}

fn set_cont_header(cache: &dyn BufferCache, blk: BlockNumber, header: ContinuationHeader) -> Result<()> {
    let mut handle = cache.get(blk)?;
    handle.bytes_mut()[..HEADER_LEN].copy_from_slice(bytemuck::bytes_of(&header));
    handle.mark_dirty();
    Ok(())
}

fn bump_cont_length(cache: &dyn BufferCache, blk: BlockNumber, delta: u32) -> Result<()> {
    let mut header = read_cont_header(cache, blk)?;
    header.length += u64::from(delta);
    set_cont_header(cache, blk, header)
}

fn set_cont_length(cache: &dyn BufferCache, blk: BlockNumber, length: u64) -> Result<()> {
    let mut header = read_cont_header(cache, blk)?;
    header.length = length;
    set_cont_header(cache, blk, header)
}

fn set_cont_next(cache: &dyn BufferCache, blk: BlockNumber, next: BlockNumber) -> Result<()> {
    let mut header = read_cont_header(cache, blk)?;
    header.next = next.0;
    set_cont_header(cache, blk, header)
}

fn read_cont_extent(cache: &dyn BufferCache, blk: BlockNumber, idx: usize) -> Result<ExtentRaw> {
    let handle = cache.get(blk)?;
    let off = HEADER_LEN + idx * EXTENT_LEN;
    Ok(*bytemuck::from_bytes(&handle.bytes()[off..off + EXTENT_LEN]))
}

fn write_cont_extent(cache: &dyn BufferCache, blk: BlockNumber, idx: usize, ext: ExtentRaw) -> Result<()> {
    let mut handle = cache.get(blk)?;
    let off = HEADER_LEN + idx * EXTENT_LEN;
    handle.bytes_mut()[off..off + EXTENT_LEN].copy_from_slice(bytemuck::bytes_of(&ext));
    handle.mark_dirty();
    Ok(())
}

/// Allocates and zeroes a single fresh continuation block.
fn alloc_cont_block(geo: &Geometry, cache: &dyn BufferCache, locks: &GroupLocks, hint: GroupNumber) -> Result<BlockNumber> {
    let a = refmap::alloc_blocks(geo, cache, locks, None, hint, 1, 1)?;
    let mut handle = cache.get(a.start)?;
    handle.bytes_mut().fill(0);
    handle.mark_dirty();
    Ok(a.start)
}

/// Result of a successful block-mapper lookup (`get_blocks`, §4.4).
#[derive(Clone, Copy, Debug)]
pub struct MappedRun {
    pub pbn: BlockNumber,
    pub count: u32,
    pub is_new: bool,
    pub boundary: bool,
    /// Number of fresh blocks the allocator handed out to satisfy this
    /// call (`0` for a plain lookup); lets a host-side counter track
    /// `free_blocks` without re-deriving it from the whole extent chain.
    pub allocated: u32,
}

fn mapped_from_extent(ext: ExtentRaw, offset: u64, max: u32) -> MappedRun {
    let avail = ext.len() - offset;
    let count = core::cmp::min(u64::from(max), avail) as u32;
    MappedRun {
        pbn: BlockNumber(ext.start + offset),
        count,
        is_new: false,
        boundary: avail <= u64::from(max),
        allocated: 0,
    }
}

/// Read-only walk of the inode's direct extents and continuation chain.
/// Returns `None` if `lbn` falls past the currently mapped range.
fn locate(geo: &Geometry, cache: &dyn BufferCache, state: &InodeState, lbn: u64, max: u32) -> Result<Option<MappedRun>> {
    let mut remaining = lbn;
    for ext in state.extents {
        if ext.is_empty() {
            return Ok(None);
        }
        let len = ext.len();
        if remaining < len {
            return Ok(Some(mapped_from_extent(ext, remaining, max)));
        }
        remaining -= len;
    }

    let mut blk = state.cont;
    while !blk.is_null() {
        let header = read_cont_header(cache, blk)?;
        if header.length <= remaining {
            remaining -= header.length;
            blk = BlockNumber(header.next);
            continue;
        }
        let count = cont_extents_count(geo);
        for idx in 0..count {
            let ext = read_cont_extent(cache, blk, idx)?;
            if ext.is_empty() {
                return Ok(None);
            }
            let len = ext.len();
            if remaining < len {
                return Ok(Some(mapped_from_extent(ext, remaining, max)));
            }
            remaining -= len;
        }
        return Ok(None);
    }
    Ok(None)
}

/// Sum of every extent's length reachable from this inode: direct slots
/// plus each continuation node's `length` header (avoids re-walking every
/// extent in the chain just to total it).
fn total_len(cache: &dyn BufferCache, state: &InodeState) -> Result<u64> {
    let mut total: u64 = state.extents.iter().map(|e| e.len()).sum();
    let mut blk = state.cont;
    while !blk.is_null() {
        let header = read_cont_header(cache, blk)?;
        total += header.length;
        blk = BlockNumber(header.next);
    }
    Ok(total)
}

/// Performs one incremental growth step: extends the last direct or
/// continuation extent if contiguous space is free, else fills the next
/// empty slot, else chains a new continuation node. Tries to request
/// enough blocks to both skip past what's already mapped and cover the
/// caller's requested window, but tolerates the allocator returning less.
fn grow_step(
    geo: &Geometry,
    cache: &dyn BufferCache,
    locks: &GroupLocks,
    hint: GroupNumber,
    state: &mut InodeState,
    lbn: u64,
    max: u32,
) -> Result<u32> {
    let mapped = total_len(cache, state)?;
    let remaining_to_lbn = lbn.saturating_sub(mapped);
    let want = remaining_to_lbn
        .saturating_add(u64::from(max))
        .min(u64::from(u32::MAX)) as u32;
    let want = want.max(1);

    if let Some(i) = state.extents.iter().position(ExtentRaw::is_empty) {
        if i > 0 {
            let prev_end = state.extents[i - 1].end;
            if let Ok(a) = refmap::alloc_blocks(geo, cache, locks, Some(BlockNumber(prev_end)), hint, 0, want) {
                if a.len > 0 {
                    state.extents[i - 1].end += u64::from(a.len);
                    return Ok(a.len);
                }
            }
        }
        let a = refmap::alloc_blocks(geo, cache, locks, None, hint, 1, want)?;
        state.extents[i] = ExtentRaw {
            start: a.start.0,
            end: a.start.0 + u64::from(a.len),
        };
        return Ok(a.len);
    }

    if state.cont.is_null() {
        state.cont = alloc_cont_block(geo, cache, locks, hint)?;
        return Ok(0);
    }

    let mut blk = state.cont;
    loop {
        let header = read_cont_header(cache, blk)?;
        let count = cont_extents_count(geo);
        let mut filled = 0usize;
        while filled < count {
            if read_cont_extent(cache, blk, filled)?.is_empty() {
                break;
            }
            filled += 1;
        }

        if filled < count {
            if filled > 0 {
                let prev = read_cont_extent(cache, blk, filled - 1)?;
                if let Ok(a) = refmap::alloc_blocks(geo, cache, locks, Some(BlockNumber(prev.end)), hint, 0, want) {
                    if a.len > 0 {
                        write_cont_extent(
                            cache,
                            blk,
                            filled - 1,
                            ExtentRaw {
                                start: prev.start,
                                end: prev.end + u64::from(a.len),
                            },
                        )?;
                        bump_cont_length(cache, blk, a.len)?;
                        return Ok(a.len);
                    }
                }
            }
            let a = refmap::alloc_blocks(geo, cache, locks, None, hint, 1, want)?;
            let new_ext = ExtentRaw {
                start: a.start.0,
                end: a.start.0 + u64::from(a.len),
            };
            write_cont_extent(cache, blk, filled, new_ext)?;
            bump_cont_length(cache, blk, a.len)?;
            return Ok(a.len);
        }

        if header.next == 0 {
            let new_blk = alloc_cont_block(geo, cache, locks, hint)?;
            set_cont_next(cache, blk, new_blk)?;
            return Ok(0);
        }
        blk = BlockNumber(header.next);
    }
}

/// Maximum number of growth steps a single `get_blocks(create=true)` call
/// will take before giving up; bounds runaway loops from a corrupt chain.
const MAX_GROWTH_STEPS: usize = 4096;

/// Read-only block mapping: `(inode, lbn) -> pbn`, for callers (the
/// directory engine's find/readdir/empty_dir) that only ever read an
/// already-mapped range and never need to grow it.
pub fn map_block(geo: &Geometry, cache: &dyn BufferCache, state: &InodeState, lbn: u64, max: u32) -> Result<MappedRun> {
    locate(geo, cache, state, lbn, max)?.ok_or_else(Error::io)
}

/// Maps `(inode, lbn)` to a physical block, allocating on demand when
/// `create` is set (§4.4–§4.5). The caller is expected to hold the
/// inode's block-map mutex for the duration of this call when `create`
/// is `true` (§5).
pub fn get_blocks(
    geo: &Geometry,
    cache: &dyn BufferCache,
    locks: &GroupLocks,
    hint: GroupNumber,
    state: &mut InodeState,
    lbn: u64,
    max: u32,
    create: bool,
) -> Result<MappedRun> {
    if let Some(run) = locate(geo, cache, state, lbn, max)? {
        return Ok(run);
    }
    if !create {
        return Err(Error::io());
    }
    let mut allocated = 0u32;
    for _ in 0..MAX_GROWTH_STEPS {
        allocated += grow_step(geo, cache, locks, hint, state, lbn, max)?;
        if let Some(run) = locate(geo, cache, state, lbn, max)? {
            return Ok(MappedRun { is_new: true, allocated, ..run });
        }
    }
    Err(Error::io())
}

/// Shrinks the inode's block-mapped body to `new_size` bytes, freeing
/// every block no longer covered and collapsing emptied continuation
/// nodes out of the chain (§4.6). Returns the total number of blocks
/// freed (data blocks plus any continuation nodes that emptied out),
/// so callers can keep a running `free_blocks` counter without
/// re-deriving it from the chain.
pub fn truncate(
    geo: &Geometry,
    cache: &dyn BufferCache,
    locks: &GroupLocks,
    state: &mut InodeState,
    new_size: u64,
    now: Timestamp,
) -> Result<u64> {
    let mut blocks = div_ceil_u64(new_size, u64::from(geo.block_size));
    let mut freed = 0u64;

    for ext in state.extents.iter_mut() {
        if ext.is_empty() {
            continue;
        }
        let len = ext.len();
        if blocks >= len {
            blocks -= len;
        } else if blocks > 0 {
            let free_start = ext.start + blocks;
            let free_len = (ext.end - free_start) as u32;
            refmap::free_blocks(geo, cache, locks, BlockNumber(free_start), free_len)?;
            freed += u64::from(free_len);
            ext.end = ext.start + blocks;
            blocks = 0;
        } else {
            refmap::free_blocks(geo, cache, locks, BlockNumber(ext.start), len as u32)?;
            freed += len;
            *ext = ExtentRaw::EMPTY;
        }
    }

    let mut blk = state.cont;
    let mut prev: Option<BlockNumber> = None;
    while !blk.is_null() {
        let header = read_cont_header(cache, blk)?;
        let count = cont_extents_count(geo);
        let mut new_length = 0u64;
        for idx in 0..count {
            let mut ext = read_cont_extent(cache, blk, idx)?;
            if ext.is_empty() {
                continue;
            }
            let len = ext.len();
            if blocks >= len {
                blocks -= len;
                new_length += len;
            } else if blocks > 0 {
                let free_start = ext.start + blocks;
                let free_len = (ext.end - free_start) as u32;
                refmap::free_blocks(geo, cache, locks, BlockNumber(free_start), free_len)?;
                freed += u64::from(free_len);
                ext.end = ext.start + blocks;
                write_cont_extent(cache, blk, idx, ext)?;
                new_length += ext.len();
                blocks = 0;
            } else {
                refmap::free_blocks(geo, cache, locks, BlockNumber(ext.start), len as u32)?;
                freed += len;
                write_cont_extent(cache, blk, idx, ExtentRaw::EMPTY)?;
            }
        }
        let next = BlockNumber(header.next);
        if new_length == 0 {
            refmap::free_blocks(geo, cache, locks, blk, 1)?;
            freed += 1;
            match prev {
                Some(p) => set_cont_next(cache, p, BlockNumber(0))?,
                None => state.cont = BlockNumber(0),
            }
        } else {
            set_cont_length(cache, blk, new_length)?;
            prev = Some(blk);
        }
        blk = next;
    }

    state.size = new_size;
    state.mtime = now;
    state.ctime = now;
    Ok(freed)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::{SuperblockRaw, MAGIC};
    use crate::inode::DIRECT_EXTENTS;
    use crate::test_support::{MemBlockDevice, MemBufferCache};

    fn geo() -> Geometry {
        let sb = SuperblockRaw {
            magic: MAGIC,
            log_block_size: 10,
            flags: 0,
            num_blocks: 512,
            num_groups: 4,
            local_inode_bits: 10,
            group_size: 128,
            group_data_blocks: 96,
            group_inodes: 64,
            offset_group: 2,
            offset_inodes: 1,
            offset_refmap: 17,
            offset_data: 32,
            label: [0; 48],
            uuid: [0; 16],
            default_root: 0,
            checksum: 0,
        };
        Geometry::from_raw(&sb).unwrap()
    }

    fn fresh_state() -> InodeState {
        InodeState {
            mode: 0o100644,
            nlinks: 1,
            uid: 0,
            gid: 0,
            flags: 0,
            size: 0,
            mtime: Timestamp::default(),
            atime: Timestamp::default(),
            ctime: Timestamp::default(),
            extents: [ExtentRaw::EMPTY; DIRECT_EXTENTS],
            cont: BlockNumber(0),
        }
    }

    #[test]
    fn create_write_read_maps_first_extent() {
        let geo = geo();
        let dev = MemBlockDevice::new(1024, geo.num_blocks);
        let cache = MemBufferCache::new(&dev);
        let locks = GroupLocks::new();
        let mut state = fresh_state();

        let run = get_blocks(&geo, &cache, &locks, GroupNumber(0), &mut state, 0, 3, true).unwrap();
        assert!(run.is_new);
        assert_eq!(state.extents[0], ExtentRaw { start: 34, end: 37 });

        let r0 = get_blocks(&geo, &cache, &locks, GroupNumber(0), &mut state, 0, 1, false).unwrap();
        assert_eq!(r0.pbn, BlockNumber(34));
        let r2 = get_blocks(&geo, &cache, &locks, GroupNumber(0), &mut state, 2, 1, false).unwrap();
        assert_eq!(r2.pbn, BlockNumber(36));
        assert!(r2.boundary);
        assert!(get_blocks(&geo, &cache, &locks, GroupNumber(0), &mut state, 3, 1, false).is_err());
    }

    #[test]
    fn contiguous_extension_grows_same_slot() {
        let geo = geo();
        let dev = MemBlockDevice::new(1024, geo.num_blocks);
        let cache = MemBufferCache::new(&dev);
        let locks = GroupLocks::new();
        let mut state = fresh_state();

        get_blocks(&geo, &cache, &locks, GroupNumber(0), &mut state, 0, 3, true).unwrap();
        get_blocks(&geo, &cache, &locks, GroupNumber(0), &mut state, 3, 2, true).unwrap();
        assert_eq!(state.extents[0], ExtentRaw { start: 34, end: 39 });
        assert!(state.extents[1].is_empty());
    }

    #[test]
    fn non_contiguous_request_opens_new_slot() {
        let geo = geo();
        let dev = MemBlockDevice::new(1024, geo.num_blocks);
        let cache = MemBufferCache::new(&dev);
        let locks = GroupLocks::new();
        let mut state = fresh_state();

        get_blocks(&geo, &cache, &locks, GroupNumber(0), &mut state, 0, 5, true).unwrap();
        // block 39 (next after {34,39}) gets marked used by someone else.
        refmap::alloc_blocks(&geo, &cache, &locks, Some(BlockNumber(39)), GroupNumber(0), 1, 1).unwrap();

        get_blocks(&geo, &cache, &locks, GroupNumber(0), &mut state, 5, 1, true).unwrap();
        assert_eq!(state.extents[0], ExtentRaw { start: 34, end: 39 });
        assert_eq!(state.extents[1], ExtentRaw { start: 40, end: 41 });
    }

    #[test]
    fn overflow_to_continuation_node_once_direct_slots_are_full() {
        let geo = geo();
        let dev = MemBlockDevice::new(1024, geo.num_blocks);
        let cache = MemBufferCache::new(&dev);
        let locks = GroupLocks::new();
        let mut state = fresh_state();

        let mut lbn = 0u64;
        for slot in 0..DIRECT_EXTENTS {
            get_blocks(&geo, &cache, &locks, GroupNumber(0), &mut state, lbn, 1, true).unwrap();
            lbn += 1;
            // poison the block right after this extent so the next slot's
            // growth can't just extend it into one long run.
            let last = state.extents[slot].end;
            let _ = refmap::alloc_blocks(&geo, &cache, &locks, Some(BlockNumber(last)), GroupNumber(0), 1, 1);
        }
        assert!(state.extents.iter().all(|e| !e.is_empty()));
        assert!(state.cont.is_null());

        get_blocks(&geo, &cache, &locks, GroupNumber(0), &mut state, lbn, 1, true).unwrap();
        assert!(!state.cont.is_null());
        let header = read_cont_header(&cache, state.cont).unwrap();
        assert_eq!(header.length, 1);
    }

    #[test]
    fn truncate_frees_partial_tail_and_updates_times() {
        let geo = geo();
        let dev = MemBlockDevice::new(1024, geo.num_blocks);
        let cache = MemBufferCache::new(&dev);
        let locks = GroupLocks::new();
        let mut state = fresh_state();

        get_blocks(&geo, &cache, &locks, GroupNumber(0), &mut state, 0, 5, true).unwrap();
        state.size = 5 * 1024;
        let now = Timestamp { seconds: 42, millis: 0 };

        let freed = truncate(&geo, &cache, &locks, &mut state, 4 * 1024, now).unwrap();
        assert_eq!(freed, 1);
        assert_eq!(state.extents[0], ExtentRaw { start: 34, end: 38 });
        assert_eq!(state.mtime, now);
        assert_eq!(state.ctime, now);

        let a = refmap::alloc_blocks(&geo, &cache, &locks, None, GroupNumber(0), 1, 1).unwrap();
        assert_eq!(a.start, BlockNumber(38));
    }

    #[test]
    fn truncate_to_zero_empties_every_extent() {
        let geo = geo();
        let dev = MemBlockDevice::new(1024, geo.num_blocks);
        let cache = MemBufferCache::new(&dev);
        let locks = GroupLocks::new();
        let mut state = fresh_state();

        get_blocks(&geo, &cache, &locks, GroupNumber(0), &mut state, 0, 5, true).unwrap();
        state.size = 5 * 1024;
        let freed = truncate(&geo, &cache, &locks, &mut state, 0, Timestamp::default()).unwrap();
        assert_eq!(freed, 5);
        assert!(state.extents.iter().all(ExtentRaw::is_empty));
        assert!(state.cont.is_null());
        assert_eq!(state.size, 0);
    }
}
