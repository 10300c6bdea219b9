//! The mount-level facade (§6): ties geometry, allocators, the extent
//! walker, and the directory engine together behind the Host (VFS)
//! interface, owning the counters lock (§5) that tracks `free_blocks`
//! and `free_inodes` without re-deriving them from the allocator state.

use crate::bitmap;
use crate::device::{BlockDevice, BufferCache, InodeCache};
use crate::dirent;
use crate::error::{Error, ErrorKind, Result};
use crate::extent;
use crate::geometry::{Geometry, SuperblockRaw, SUPERBLOCK_OFFSET};
use crate::ids::{BlockNumber, GroupNumber, InodeNumber};
use crate::inode::{FileType, Inode};
use crate::locks::GroupLocks;
use crate::mount_opts;
use crate::time::{Clock, Timestamp};
use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;

/// Running free-resource counters, guarded by a single lock (§5) so a
/// caller never has to walk every group's refmap/bitmap to answer
/// `statfs`.
struct Counters {
    free_blocks: u64,
    free_inodes: u64,
}

/// Result of a successful `get_block` call (§6): the mapped physical
/// block, whether it was freshly allocated, and whether it is the last
/// block of its extent.
#[derive(Clone, Copy, Debug)]
pub struct BlockMapping {
    pub pbn: BlockNumber,
    pub is_new: bool,
    pub boundary: bool,
}

/// Aggregate volume usage, as returned by `statfs` (§6).
#[derive(Clone, Copy, Debug)]
pub struct Statfs {
    pub blocks: u64,
    pub free_blocks: u64,
    pub files: u64,
    pub free_inodes: u64,
}

/// A mounted volume. Carries one lifetime, `'a`, because its buffer
/// cache may itself borrow the block device (as the in-memory test
/// cache does); a host whose cache owns its device outright can just
/// as well instantiate `Jbfs<'static>`.
pub struct Jbfs<'a> {
    geo: Geometry,
    cache: Box<dyn BufferCache + 'a>,
    inodes: Box<dyn InodeCache>,
    clock: Box<dyn Clock>,
    locks: GroupLocks,
    counters: Mutex<Counters>,
    root: InodeNumber,
}

impl<'a> Jbfs<'a> {
    /// Reads and validates the superblock, parses mount options, and
    /// builds a mounted volume (§6). The superblock is read directly off
    /// the drive at its fixed byte offset before any block-size-aware
    /// abstraction exists.
    pub fn mount(
        dev: &dyn BlockDevice,
        cache: Box<dyn BufferCache + 'a>,
        inodes: Box<dyn InodeCache>,
        clock: Box<dyn Clock>,
        opts: &str,
    ) -> Result<Self> {
        let sector = dev.block_size();
        if sector == 0 || SUPERBLOCK_OFFSET as usize % sector != 0 {
            return Err(Error::with_detail(ErrorKind::InvalidArgument, "device sector size can't address the superblock"));
        }
        let lba = BlockNumber(SUPERBLOCK_OFFSET / sector as u64);
        let mut raw_block = alloc::vec![0u8; sector];
        dev.read_block(lba, &mut raw_block)?;
        if raw_block.len() < core::mem::size_of::<SuperblockRaw>() {
            return Err(Error::with_detail(ErrorKind::InvalidArgument, "device block too small for superblock"));
        }
        let sb: SuperblockRaw = *bytemuck::from_bytes(&raw_block[..core::mem::size_of::<SuperblockRaw>()]);
        let geo = Geometry::from_raw(&sb)?;

        if geo.block_size as usize != sector {
            crate::log_error!("fs", "superblock block_size {} does not match device block_size {}", geo.block_size, sector);
            return Err(Error::with_detail(ErrorKind::InvalidArgument, "geometry/device block size mismatch"));
        }

        let parsed = mount_opts::parse(opts)?;
        let root = parsed.root.unwrap_or(geo.default_root);

        crate::log_info!("fs", "mounted: {} groups, {} blocks, root={}", geo.num_groups, geo.num_blocks, root);

        let counters = Self::count_free_resources(&geo, cache.as_ref())?;

        Ok(Self {
            geo,
            cache,
            inodes,
            clock,
            locks: GroupLocks::new(),
            counters: Mutex::new(counters),
            root,
        })
    }

    /// Scans every group's inode bitmap and refmap once at mount time to
    /// seed the running counters; after mount, every mutation updates
    /// them incrementally instead of re-scanning.
    fn count_free_resources(geo: &Geometry, cache: &dyn BufferCache) -> Result<Counters> {
        let mut free_blocks = 0u64;
        let mut free_inodes = 0u64;
        for g in 0..geo.num_groups {
            let group = GroupNumber(g);
            let data_len = geo.group_data_len(group);
            let refmap_blocks = geo.refmap_blocks(group);
            let mut counted = 0u32;
            'outer: for blk_idx in 0..refmap_blocks {
                let blk = geo.refmap_start(group) + u64::from(blk_idx);
                let handle = cache.get(blk)?;
                let bytes = handle.bytes();
                for &b in bytes {
                    if counted >= data_len {
                        break 'outer;
                    }
                    if b == 0 {
                        free_blocks += 1;
                    }
                    counted += 1;
                }
            }

            let inode_count = geo.group_inode_count(group);
            let bitmap_blocks = geo.inode_bitmap_blocks();
            let bits_per_block = geo.block_size * 8;
            let mut seen = 0u32;
            'outer_inodes: for blk_idx in 0..bitmap_blocks {
                let blk = geo.bitmap_start(group) + u64::from(blk_idx);
                let handle = cache.get(blk)?;
                let bytes = handle.bytes();
                let base_bit = blk_idx * bits_per_block;
                if base_bit >= inode_count {
                    break;
                }
                let limit = core::cmp::min(bits_per_block, inode_count - base_bit);
                for i in 0..limit {
                    if seen >= inode_count {
                        break 'outer_inodes;
                    }
                    if !bitmap::test_bit(bytes, i) {
                        free_inodes += 1;
                    }
                    seen += 1;
                }
            }
        }
        Ok(Counters { free_blocks, free_inodes })
    }

    fn now(&self) -> Timestamp {
        let (seconds, nanos) = self.clock.now();
        Timestamp::from_unix(seconds, nanos)
    }

    fn fetch(&self, ino: InodeNumber) -> Result<Arc<Inode>> {
        if let Some(inode) = self.inodes.lookup(ino) {
            return Ok(inode);
        }
        self.read_inode_from_disk(ino)
    }

    fn inode_block(&self, ino: InodeNumber) -> BlockNumber {
        let (group, local) = self.geo.inode_location(ino);
        let inode_size = core::mem::size_of::<crate::inode::InodeRaw>();
        let per_block = self.geo.block_size as usize / inode_size;
        let table_start = self.geo.inodes_start(group);
        table_start + u64::from(local) / per_block as u64
    }

    fn inode_offset(&self, ino: InodeNumber) -> usize {
        let (_, local) = self.geo.inode_location(ino);
        let inode_size = core::mem::size_of::<crate::inode::InodeRaw>();
        let per_block = self.geo.block_size as usize / inode_size;
        (local as usize % per_block) * inode_size
    }

    fn read_inode_from_disk(&self, ino: InodeNumber) -> Result<Arc<Inode>> {
        let blk = self.inode_block(ino);
        let off = self.inode_offset(ino);
        let inode_size = core::mem::size_of::<crate::inode::InodeRaw>();
        let handle = self.cache.get(blk)?;
        let raw: crate::inode::InodeRaw = *bytemuck::from_bytes(&handle.bytes()[off..off + inode_size]);
        let inode = Arc::new(Inode::from_raw(ino, &raw)?);
        self.inodes.insert(ino, inode.clone());
        Ok(inode)
    }

    /// `read_inode` (§6): decodes a cached or on-disk inode record.
    pub fn read_inode(&self, ino: InodeNumber) -> Result<Arc<Inode>> {
        self.fetch(ino)
    }

    /// `write_inode` (§6): serializes the in-memory state back to its
    /// on-disk slot.
    pub fn write_inode(&self, inode: &Inode) -> Result<()> {
        let blk = self.inode_block(inode.ino);
        let off = self.inode_offset(inode.ino);
        let inode_size = core::mem::size_of::<crate::inode::InodeRaw>();
        let raw = inode.to_raw();
        let mut handle = self.cache.get(blk)?;
        handle.bytes_mut()[off..off + inode_size].copy_from_slice(bytemuck::bytes_of(&raw));
        handle.mark_dirty();
        Ok(())
    }

    /// `new_inode` (§6): allocates a free inode number near `parent`'s
    /// group and seeds a fresh in-memory record.
    pub fn new_inode(&self, parent: InodeNumber, mode: u16) -> Result<Arc<Inode>> {
        let ino = bitmap::alloc_inode(&self.geo, self.cache.as_ref(), &self.locks, parent)?;
        {
            let mut c = self.counters.lock();
            c.free_inodes = c.free_inodes.saturating_sub(1);
        }
        let now = self.now();
        let inode = Arc::new(Inode::new_inode(ino, mode, 0, 0, now));
        self.write_inode(&inode)?;
        self.inodes.insert(ino, inode.clone());
        Ok(inode)
    }

    /// `delete_inode` (§6): truncates the inode's body to zero, releases
    /// its bitmap bit, and evicts it from the inode cache.
    pub fn delete_inode(&self, ino: InodeNumber) -> Result<()> {
        let inode = self.fetch(ino)?;
        let now = self.now();
        {
            let mut state = inode.lock();
            let freed = extent::truncate(&self.geo, self.cache.as_ref(), &self.locks, &mut state, 0, now)?;
            if freed > 0 {
                let mut c = self.counters.lock();
                c.free_blocks = c.free_blocks.saturating_add(freed);
            }
        }
        bitmap::free_inode(&self.geo, self.cache.as_ref(), &self.locks, ino)?;
        {
            let mut c = self.counters.lock();
            c.free_inodes = c.free_inodes.saturating_add(1);
        }
        self.inodes.remove(ino);
        Ok(())
    }

    /// `get_block` (§6): maps `(inode, lbn)` to a physical block,
    /// allocating on demand when `create` is set.
    pub fn get_block(&self, inode: &Inode, lbn: u64, create: bool) -> Result<BlockMapping> {
        let hint = self.geo.inode_location(inode.ino).0;
        let mut state = inode.lock();
        let run = extent::get_blocks(&self.geo, self.cache.as_ref(), &self.locks, hint, &mut state, lbn, 1, create)?;
        if run.allocated > 0 {
            let mut c = self.counters.lock();
            c.free_blocks = c.free_blocks.saturating_sub(u64::from(run.allocated));
        }
        Ok(BlockMapping {
            pbn: run.pbn,
            is_new: run.is_new,
            boundary: run.boundary,
        })
    }

    /// `truncate` (§6): shrinks an inode's block-mapped body, crediting
    /// freed blocks back to the running counter.
    pub fn truncate(&self, inode: &Inode, new_size: u64) -> Result<()> {
        let now = self.now();
        let mut state = inode.lock();
        let freed = extent::truncate(&self.geo, self.cache.as_ref(), &self.locks, &mut state, new_size, now)?;
        if freed > 0 {
            let mut c = self.counters.lock();
            c.free_blocks = c.free_blocks.saturating_add(freed);
        }
        Ok(())
    }

    /// `add_link` (§6).
    pub fn add_link(&self, dir: &Inode, name: &[u8], ino: InodeNumber) -> Result<()> {
        let hint = self.geo.inode_location(dir.ino).0;
        let now = self.now();
        let mut state = dir.lock();
        dirent::add_link(&self.geo, self.cache.as_ref(), &self.locks, hint, &mut state, name, ino, now)
    }

    /// `find_entry` (§6).
    pub fn find_entry(&self, dir: &Inode, name: &[u8]) -> Result<InodeNumber> {
        let state = dir.lock();
        dirent::find_entry(&self.geo, self.cache.as_ref(), &state, name)
    }

    /// `delete_entry` (§6).
    pub fn delete_entry(&self, dir: &Inode, name: &[u8]) -> Result<InodeNumber> {
        let state = dir.lock();
        dirent::delete_entry(&self.geo, self.cache.as_ref(), &state, name)
    }

    /// `set_link` (§6).
    pub fn set_link(&self, dir: &Inode, name: &[u8], new_ino: InodeNumber) -> Result<()> {
        let state = dir.lock();
        dirent::set_link(&self.geo, self.cache.as_ref(), &state, name, new_ino)
    }

    /// `make_empty` (§6): writes a fresh directory's `.`/`..` chunk.
    pub fn make_empty(&self, dir: &Inode, parent: InodeNumber) -> Result<()> {
        let hint = self.geo.inode_location(dir.ino).0;
        let now = self.now();
        let mut state = dir.lock();
        dirent::make_empty(&self.geo, self.cache.as_ref(), &self.locks, hint, &mut state, dir.ino, parent, now)
    }

    /// `empty_dir` (§6).
    pub fn empty_dir(&self, dir: &Inode) -> Result<bool> {
        let state = dir.lock();
        dirent::empty_dir(&self.geo, self.cache.as_ref(), &state, dir.ino)
    }

    /// The inode `..` resolves to: the second dirent of the directory's
    /// first chunk.
    pub fn dotdot(&self, dir: &Inode) -> Result<InodeNumber> {
        let state = dir.lock();
        dirent::dotdot(&self.geo, self.cache.as_ref(), &state)
    }

    /// Streams a directory's live entries (§4.7's *Readdir*).
    pub fn readdir(&self, dir: &Inode, start: u64, visit: impl FnMut(u64, InodeNumber, &[u8]) -> bool) -> Result<u64> {
        let state = dir.lock();
        dirent::readdir(&self.geo, self.cache.as_ref(), &state, start, visit)
    }

    /// `statfs` (§6).
    pub fn statfs(&self) -> Statfs {
        let c = self.counters.lock();
        Statfs {
            blocks: self.geo.num_blocks,
            free_blocks: c.free_blocks,
            files: self.geo.num_groups * u64::from(self.geo.group_inodes),
            free_inodes: c.free_inodes,
        }
    }

    /// The mount's root inode number (`root=` override or the
    /// superblock's `default_root`).
    #[must_use]
    pub fn root(&self) -> InodeNumber {
        self.root
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// File type of a device inode's encoded `rdev`, stored in
    /// `extents[0].start` for device nodes rather than a real extent
    /// (§4.8).
    pub fn device_number(&self, inode: &Inode) -> Option<(u32, u32)> {
        let state = inode.lock();
        let ft = FileType::from_mode(state.mode)?;
        if !ft.is_device() {
            return None;
        }
        Some(crate::inode::decode_dev(state.extents[0].start))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::MAGIC;
    use crate::test_support::{FixedClock, MemBlockDevice, MemBufferCache};
    use crate::device::HashMapInodeCache;
    use alloc::vec;

    fn make_volume() -> MemBlockDevice {
        let dev = MemBlockDevice::new(1024, 512);
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
            default_root: 1,
            checksum: 0,
        };
        let mut buf = vec![0u8; 1024];
        buf[..core::mem::size_of::<SuperblockRaw>()].copy_from_slice(bytemuck::bytes_of(&sb));
        dev.write_block(BlockNumber(1), &buf).unwrap();
        dev
    }

    fn mount(dev: &MemBlockDevice) -> Jbfs<'_> {
        let cache = MemBufferCache::new(dev);
        Jbfs::mount(dev, Box::new(cache), Box::new(HashMapInodeCache::new()), Box::new(FixedClock { seconds: 1000 }), "").unwrap()
    }

    #[test]
    fn mount_reads_geometry_and_default_root() {
        let dev = make_volume();
        let fs = mount(&dev);
        assert_eq!(fs.root(), InodeNumber(1));
        assert_eq!(fs.geometry().num_groups, 4);
    }

    #[test]
    fn mount_root_option_overrides_default() {
        let dev = make_volume();
        let cache = MemBufferCache::new(&dev);
        let fs = Jbfs::mount(&dev, Box::new(cache), Box::new(HashMapInodeCache::new()), Box::new(FixedClock { seconds: 0 }), "root=5").unwrap();
        assert_eq!(fs.root(), InodeNumber(5));
    }

    #[test]
    fn create_write_read_and_statfs_track_usage() {
        let dev = make_volume();
        let fs = mount(&dev);
        let before = fs.statfs();

        let file = fs.new_inode(InodeNumber(1), 0o100644).unwrap();
        let mapping = fs.get_block(&file, 0, true).unwrap();
        assert!(mapping.is_new);
        fs.truncate(&file, 1024).unwrap();
        fs.write_inode(&file).unwrap();

        let after = fs.statfs();
        assert!(after.free_blocks < before.free_blocks);
        assert_eq!(after.free_inodes, before.free_inodes - 1);
    }

    #[test]
    fn new_inode_then_delete_reclaims_inode_and_blocks() {
        let dev = make_volume();
        let fs = mount(&dev);
        let before = fs.statfs();

        let file = fs.new_inode(InodeNumber(1), 0o100644).unwrap();
        fs.get_block(&file, 0, true).unwrap();
        fs.get_block(&file, 1, true).unwrap();
        let ino = file.ino;
        fs.delete_inode(ino).unwrap();

        let after = fs.statfs();
        assert_eq!(after.free_inodes, before.free_inodes);
        assert_eq!(after.free_blocks, before.free_blocks);
    }

    #[test]
    fn directory_round_trip_through_the_facade() {
        let dev = make_volume();
        let fs = mount(&dev);

        let root = fs.new_inode(InodeNumber(0), 0o040755).unwrap();
        fs.make_empty(&root, root.ino).unwrap();
        let child = fs.new_inode(root.ino, 0o100644).unwrap();
        fs.add_link(&root, b"hello.txt", child.ino).unwrap();

        assert_eq!(fs.find_entry(&root, b"hello.txt").unwrap(), child.ino);
        assert!(!fs.empty_dir(&root).unwrap());
        assert_eq!(fs.dotdot(&root).unwrap(), root.ino);

        fs.delete_entry(&root, b"hello.txt").unwrap();
        assert!(fs.find_entry(&root, b"hello.txt").is_err());
    }

    /// Marks one physical block as used directly in its group's refmap,
    /// simulating another file already owning it.
    fn mark_used(fs: &Jbfs<'_>, pbn: BlockNumber) {
        let geo = fs.geometry();
        let group = geo.extract_group(pbn);
        let local = geo.extract_local(pbn);
        let blk = geo.refmap_start(group) + u64::from(local) / u64::from(geo.block_size);
        let byte_off = (local % geo.block_size) as usize;
        let mut handle = fs.cache.get(blk).unwrap();
        handle.bytes_mut()[byte_off] = 1;
        handle.mark_dirty();
    }

    #[test]
    fn worked_example_end_to_end() {
        let dev = make_volume();
        let fs = mount(&dev);

        let root = fs.new_inode(InodeNumber(0), 0o040755).unwrap();
        assert_eq!(root.ino, InodeNumber(1));
        fs.make_empty(&root, root.ino).unwrap();

        // 1. create, write, read.
        let file = fs.new_inode(root.ino, 0o100644).unwrap();
        assert_eq!(file.ino, InodeNumber(2));
        for lbn in 0..3u64 {
            fs.get_block(&file, lbn, true).unwrap();
        }
        assert_eq!(file.lock().extents[0], crate::inode::ExtentRaw { start: 34, end: 37 });
        assert_eq!(fs.get_block(&file, 0, false).unwrap().pbn, BlockNumber(34));
        let boundary = fs.get_block(&file, 2, false).unwrap();
        assert_eq!(boundary.pbn, BlockNumber(36));
        assert!(boundary.boundary);
        assert!(fs.get_block(&file, 3, false).is_err());

        // 2. contiguous extension.
        fs.get_block(&file, 3, true).unwrap();
        fs.get_block(&file, 4, true).unwrap();
        assert_eq!(file.lock().extents[0], crate::inode::ExtentRaw { start: 34, end: 39 });

        // 3. non-contiguous new extent: block 39 is already taken.
        mark_used(&fs, BlockNumber(39));
        fs.get_block(&file, 5, true).unwrap();
        assert_eq!(file.lock().extents[0], crate::inode::ExtentRaw { start: 34, end: 39 });
        assert_eq!(file.lock().extents[1], crate::inode::ExtentRaw { start: 40, end: 41 });

        // 5. truncate to 4 blocks: slot 0 trimmed, slot 1 cleared.
        fs.truncate(&file, 4 * 1024).unwrap();
        assert_eq!(file.lock().extents[0], crate::inode::ExtentRaw { start: 34, end: 38 });
        assert!(file.lock().extents[1].is_empty());

        // 6. unlink and reuse: drop to zero links, delete, then a fresh
        // create reuses inode 2 and the freed data blocks.
        file.set_nlinks(0);
        fs.delete_inode(file.ino).unwrap();

        let reused = fs.new_inode(root.ino, 0o100644).unwrap();
        assert_eq!(reused.ino, InodeNumber(2));
        let mapping = fs.get_block(&reused, 0, true).unwrap();
        assert_eq!(mapping.pbn, BlockNumber(34));
    }

    #[test]
    fn unknown_mount_option_rejects_the_mount() {
        let dev = make_volume();
        let cache = MemBufferCache::new(&dev);
        let result = Jbfs::mount(&dev, Box::new(cache), Box::new(HashMapInodeCache::new()), Box::new(FixedClock { seconds: 0 }), "noatime");
        assert!(result.is_err());
    }
}
