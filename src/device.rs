//! Host contracts: the three collaborators the core engine requires and
//! owns none of a `BlockDevice`, a `BufferCache`, and an `InodeCache` (plus
//! the [`Clock`](crate::time::Clock) contract defined alongside timestamp
//! packing). The engine is generic over all of them; nothing downstream of
//! these traits (page cache wiring, dentry lookup, mount option parsing
//! for anything beyond `root=`) is this crate's concern.

use crate::error::Result;
use crate::ids::{BlockNumber, InodeNumber};
use crate::inode::Inode;
use alloc::boxed::Box;
use alloc::sync::Arc;
use hashbrown::HashMap;
use spin::RwLock;

/// A block device: reads and writes fixed-size blocks by number.
pub trait BlockDevice: Send + Sync {
    /// Size in bytes of one block on this device.
    fn block_size(&self) -> usize;

    /// Total number of blocks on the device.
    fn block_count(&self) -> u64;

    fn read_block(&self, blk: BlockNumber, buf: &mut [u8]) -> Result<()>;

    fn write_block(&self, blk: BlockNumber, buf: &[u8]) -> Result<()>;
}

/// A pinned, dirty-trackable, writable handle onto one block's bytes,
/// handed out by a [`BufferCache`]. Every acquire from the cache must be
/// paired with dropping the handle on all exit paths; a handle mutated
/// through [`BufferHandle::bytes_mut`] must be marked dirty before it is
/// dropped, or the mutation is not guaranteed to reach the device.
pub trait BufferHandle {
    fn bytes(&self) -> &[u8];

    fn bytes_mut(&mut self) -> &mut [u8];

    /// Marks the buffer as dirty so the cache writes it back.
    fn mark_dirty(&mut self);
}

/// A buffer cache: hands out pinned, writable, reference-counted buffers
/// for blocks of a single device.
pub trait BufferCache: Send + Sync {
    fn get(&self, blk: BlockNumber) -> Result<Box<dyn BufferHandle + '_>>;
}

/// An inode cache: hands out per-inode mutable state keyed by inode
/// number, shared across every caller that has looked the inode up.
///
/// This crate ships [`HashMapInodeCache`], a reference implementation
/// built on `hashbrown` + `spin::RwLock`; hosts with their own eviction
/// policy or page-cache integration can substitute their own
/// `InodeCache` instead.
pub trait InodeCache: Send + Sync {
    fn lookup(&self, ino: InodeNumber) -> Option<Arc<Inode>>;

    fn insert(&self, ino: InodeNumber, inode: Arc<Inode>);

    fn remove(&self, ino: InodeNumber) -> Option<Arc<Inode>>;
}

/// Reference [`InodeCache`] implementation.
#[derive(Default)]
pub struct HashMapInodeCache {
    table: RwLock<HashMap<InodeNumber, Arc<Inode>>>,
}

impl HashMapInodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }
}

impl InodeCache for HashMapInodeCache {
    fn lookup(&self, ino: InodeNumber) -> Option<Arc<Inode>> {
        self.table.read().get(&ino).cloned()
    }

    fn insert(&self, ino: InodeNumber, inode: Arc<Inode>) {
        self.table.write().insert(ino, inode);
    }

    fn remove(&self, ino: InodeNumber) -> Option<Arc<Inode>> {
        self.table.write().remove(&ino)
    }
}
