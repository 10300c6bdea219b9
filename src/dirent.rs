//! Directory entry engine (§4.7).
//!
//! A directory is an ordinary block-mapped file whose data is a sequence
//! of chunks (one per block), each packed with variable-length records
//! `{ino: u64, size: u16, name_len: u8, name}`, 8-byte aligned and never
//! crossing a chunk boundary. `ino = 0` marks a tombstone; its `size` is
//! kept so the slot can be reused or absorbed by a neighbor.

use crate::device::BufferCache;
use crate::error::{Error, Result};
use crate::extent;
use crate::geometry::{div_ceil_u64, Geometry};
use crate::ids::{GroupNumber, InodeNumber};
use crate::inode::InodeState;
use crate::locks::GroupLocks;
use crate::time::Timestamp;

/// Fixed portion of a dirent record preceding its name: `ino(8) + size(2)
/// + name_len(1)`.
const HEADER_LEN: usize = 11;

/// Longest name a dirent can carry.
pub const MAX_NAME_LEN: usize = 255;

/// The on-disk slot size for a name of length `name_len`: the header plus
/// the name, rounded up to a multiple of 8.
#[must_use]
pub fn dirent_size(name_len: usize) -> u16 {
    (((HEADER_LEN + name_len) + 7) & !7) as u16
}

fn num_chunks(size: u64, block_size: u32) -> u64 {
    div_ceil_u64(size, u64::from(block_size))
}

fn read_record(chunk: &[u8], off: usize) -> Result<(u64, u16, u8)> {
    if off + HEADER_LEN > chunk.len() {
        return Err(Error::corrupt());
    }
    let ino = u64::from_le_bytes(chunk[off..off + 8].try_into().unwrap());
    let size = u16::from_le_bytes(chunk[off + 8..off + 10].try_into().unwrap());
    let name_len = chunk[off + 10];
    if size == 0 || size % 8 != 0 {
        return Err(Error::corrupt());
    }
    if off + size as usize > chunk.len() {
        return Err(Error::corrupt());
    }
    if HEADER_LEN + name_len as usize > size as usize {
        return Err(Error::corrupt());
    }
    Ok((ino, size, name_len))
}

fn record_name(chunk: &[u8], off: usize, name_len: u8) -> &[u8] {
    &chunk[off + HEADER_LEN..off + HEADER_LEN + name_len as usize]
}

fn set_ino(chunk: &mut [u8], off: usize, ino: u64) {
    chunk[off..off + 8].copy_from_slice(&ino.to_le_bytes());
}

fn set_size(chunk: &mut [u8], off: usize, size: u16) {
    chunk[off + 8..off + 10].copy_from_slice(&size.to_le_bytes());
}

fn write_entry(chunk: &mut [u8], off: usize, size: u16, ino: InodeNumber, name: &[u8]) {
    chunk[off..off + 8].copy_from_slice(&ino.0.to_le_bytes());
    chunk[off + 8..off + 10].copy_from_slice(&size.to_le_bytes());
    chunk[off + 10] = name.len() as u8;
    chunk[off + HEADER_LEN..off + HEADER_LEN + name.len()].copy_from_slice(name);
}

/// Linear scan for `name`, matching `(name_len, memcmp(name))` on every
/// live (`ino != 0`) record.
pub fn find_entry(geo: &Geometry, cache: &dyn BufferCache, state: &InodeState, name: &[u8]) -> Result<InodeNumber> {
    let chunks = num_chunks(state.size, geo.block_size);
    for chunk in 0..chunks {
        let run = extent::map_block(geo, cache, state, chunk, 1)?;
        let handle = cache.get(run.pbn)?;
        let bytes = handle.bytes();
        let mut off = 0usize;
        while off < bytes.len() {
            let (ino, size, name_len) = read_record(bytes, off)?;
            if ino != 0 && name_len as usize == name.len() && record_name(bytes, off, name_len) == name {
                return Ok(InodeNumber(ino));
            }
            off += size as usize;
        }
    }
    Err(Error::not_found())
}

/// Adds `name -> ino` to the directory (§4.7's *Add*): reuses a tombstone
/// large enough, else splits a live entry with spare room, else extends
/// the file by one fresh chunk whose sole entry spans it.
pub fn add_link(
    geo: &Geometry,
    cache: &dyn BufferCache,
    locks: &GroupLocks,
    hint: GroupNumber,
    state: &mut InodeState,
    name: &[u8],
    ino: InodeNumber,
    now: Timestamp,
) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::name_too_long());
    }
    if find_entry(geo, cache, state, name).is_ok() {
        return Err(Error::exists());
    }

    let needed = dirent_size(name.len());
    let chunks = num_chunks(state.size, geo.block_size);

    for chunk in 0..chunks {
        let run = extent::map_block(geo, cache, state, chunk, 1)?;
        let mut handle = cache.get(run.pbn)?;
        let len = handle.bytes().len();
        let mut off = 0usize;
        while off < len {
            let (rec_ino, size, name_len) = read_record(handle.bytes(), off)?;
            if rec_ino == 0 {
                if size >= needed {
                    write_entry(handle.bytes_mut(), off, size, ino, name);
                    handle.mark_dirty();
                    return Ok(());
                }
            } else {
                let min_existing = dirent_size(name_len as usize);
                if size >= needed + min_existing {
                    let split_off = off + min_existing as usize;
                    let new_size = size - min_existing;
                    set_size(handle.bytes_mut(), off, min_existing);
                    write_entry(handle.bytes_mut(), split_off, new_size, ino, name);
                    handle.mark_dirty();
                    return Ok(());
                }
            }
            off += size as usize;
        }
    }

    let new_chunk = chunks;
    let run = extent::get_blocks(geo, cache, locks, hint, state, new_chunk, 1, true)?;
    let mut handle = cache.get(run.pbn)?;
    let bytes = handle.bytes_mut();
    bytes.fill(0);
    let whole = bytes.len() as u16;
    write_entry(bytes, 0, whole, ino, name);
    handle.mark_dirty();
    state.size = (new_chunk + 1) * u64::from(geo.block_size);
    state.mtime = now;
    state.ctime = now;
    Ok(())
}

/// Removes `name` (§4.7's *Delete*): absorbs the victim's size into its
/// predecessor in the same chunk, or simply tombstones it if it is the
/// chunk's first record. Never merges across chunks.
pub fn delete_entry(geo: &Geometry, cache: &dyn BufferCache, state: &InodeState, name: &[u8]) -> Result<InodeNumber> {
    let chunks = num_chunks(state.size, geo.block_size);
    for chunk in 0..chunks {
        let run = extent::map_block(geo, cache, state, chunk, 1)?;
        let mut handle = cache.get(run.pbn)?;
        let len = handle.bytes().len();
        let mut off = 0usize;
        let mut prev: Option<usize> = None;
        while off < len {
            let (rec_ino, size, name_len) = read_record(handle.bytes(), off)?;
            if rec_ino != 0 && name_len as usize == name.len() && record_name(handle.bytes(), off, name_len) == name {
                let found = InodeNumber(rec_ino);
                if let Some(prev_off) = prev {
                    let (_, prev_size, _) = read_record(handle.bytes(), prev_off)?;
                    set_size(handle.bytes_mut(), prev_off, prev_size + size);
                }
                set_ino(handle.bytes_mut(), off, 0);
                handle.mark_dirty();
                return Ok(found);
            }
            prev = Some(off);
            off += size as usize;
        }
    }
    Err(Error::not_found())
}

/// Repoints an existing live entry at a different inode, used by rename
/// to retarget a name in place without touching directory structure.
pub fn set_link(geo: &Geometry, cache: &dyn BufferCache, state: &InodeState, name: &[u8], new_ino: InodeNumber) -> Result<()> {
    let chunks = num_chunks(state.size, geo.block_size);
    for chunk in 0..chunks {
        let run = extent::map_block(geo, cache, state, chunk, 1)?;
        let mut handle = cache.get(run.pbn)?;
        let len = handle.bytes().len();
        let mut off = 0usize;
        while off < len {
            let (rec_ino, size, name_len) = read_record(handle.bytes(), off)?;
            if rec_ino != 0 && name_len as usize == name.len() && record_name(handle.bytes(), off, name_len) == name {
                set_ino(handle.bytes_mut(), off, new_ino.0);
                handle.mark_dirty();
                return Ok(());
            }
            off += size as usize;
        }
    }
    Err(Error::not_found())
}

/// Writes a freshly allocated first chunk containing `.` and `..`, for a
/// newly created directory inode.
pub fn make_empty(
    geo: &Geometry,
    cache: &dyn BufferCache,
    locks: &GroupLocks,
    hint: GroupNumber,
    state: &mut InodeState,
    me: InodeNumber,
    parent: InodeNumber,
    now: Timestamp,
) -> Result<()> {
    let run = extent::get_blocks(geo, cache, locks, hint, state, 0, 1, true)?;
    let mut handle = cache.get(run.pbn)?;
    let bytes = handle.bytes_mut();
    bytes.fill(0);
    let dot_size = dirent_size(1);
    write_entry(bytes, 0, dot_size, me, b".");
    let rest = bytes.len() as u16 - dot_size;
    write_entry(bytes, dot_size as usize, rest, parent, b"..");
    handle.mark_dirty();
    state.size = u64::from(geo.block_size);
    state.mtime = now;
    state.ctime = now;
    Ok(())
}

/// Returns the inode `..` resolves to: the second dirent of the first
/// chunk, by construction (not "whatever garbage pointer the original
/// left lying around" — see the open question this fixes).
pub fn dotdot(geo: &Geometry, cache: &dyn BufferCache, state: &InodeState) -> Result<InodeNumber> {
    let run = extent::map_block(geo, cache, state, 0, 1)?;
    let handle = cache.get(run.pbn)?;
    let bytes = handle.bytes();
    let (_, first_size, _) = read_record(bytes, 0)?;
    let (ino, _, _) = read_record(bytes, first_size as usize)?;
    Ok(InodeNumber(ino))
}

/// Passes iff every live entry is `.` pointing at `me` or `..`.
pub fn empty_dir(geo: &Geometry, cache: &dyn BufferCache, state: &InodeState, me: InodeNumber) -> Result<bool> {
    let chunks = num_chunks(state.size, geo.block_size);
    for chunk in 0..chunks {
        let run = extent::map_block(geo, cache, state, chunk, 1)?;
        let handle = cache.get(run.pbn)?;
        let bytes = handle.bytes();
        let mut off = 0usize;
        while off < bytes.len() {
            let (ino, size, name_len) = read_record(bytes, off)?;
            if ino != 0 {
                let name = record_name(bytes, off, name_len);
                let is_dot = name == b"." && InodeNumber(ino) == me;
                let is_dotdot = name == b"..";
                if !is_dot && !is_dotdot {
                    return Ok(false);
                }
            }
            off += size as usize;
        }
    }
    Ok(true)
}

/// Streams live entries from byte offset `start` in file order, calling
/// `visit(offset, ino, name)` for each; stops early if `visit` returns
/// `false`. Returns the offset reached (end of file if not stopped
/// early), suitable as the next call's `start`.
pub fn readdir(
    geo: &Geometry,
    cache: &dyn BufferCache,
    state: &InodeState,
    start: u64,
    mut visit: impl FnMut(u64, InodeNumber, &[u8]) -> bool,
) -> Result<u64> {
    let block_size = u64::from(geo.block_size);
    let chunks = num_chunks(state.size, geo.block_size);
    let mut chunk = start / block_size;
    let mut off = (start % block_size) as usize;
    while chunk < chunks {
        let run = extent::map_block(geo, cache, state, chunk, 1)?;
        let handle = cache.get(run.pbn)?;
        let bytes = handle.bytes();
        while off < bytes.len() {
            let (ino, size, name_len) = read_record(bytes, off)?;
            if ino != 0 {
                let pos = chunk * block_size + off as u64;
                if !visit(pos, InodeNumber(ino), record_name(bytes, off, name_len)) {
                    return Ok(pos);
                }
            }
            off += size as usize;
        }
        off = 0;
        chunk += 1;
    }
    Ok(chunks * block_size)
}
