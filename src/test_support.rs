//! Minimal host implementations used only by this crate's own unit and
//! scenario tests: an in-memory block device, a write-through buffer
//! cache built on it, and a fixed clock. None of this is exposed outside
//! `#[cfg(test)]`; a real host supplies its own.

use crate::device::{BlockDevice, BufferCache, BufferHandle};
use crate::error::{Error, Result};
use crate::ids::BlockNumber;
use crate::time::Clock;
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

pub struct MemBlockDevice {
    block_size: usize,
    blocks: Mutex<Vec<Vec<u8>>>,
}

impl MemBlockDevice {
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            block_size,
            blocks: Mutex::new(vec![vec![0u8; block_size]; block_count as usize]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.blocks.lock().len() as u64
    }

    fn read_block(&self, blk: BlockNumber, buf: &mut [u8]) -> Result<()> {
        let blocks = self.blocks.lock();
        let block = blocks.get(blk.0 as usize).ok_or_else(Error::invalid_argument)?;
        buf.copy_from_slice(block);
        Ok(())
    }

    fn write_block(&self, blk: BlockNumber, buf: &[u8]) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .get_mut(blk.0 as usize)
            .ok_or_else(Error::invalid_argument)?;
        block.copy_from_slice(buf);
        Ok(())
    }
}

/// A write-through buffer: every mutation is flushed to the device as soon
/// as the handle is dropped, whether or not `mark_dirty` was actually
/// called (tests are not expected to exercise the dirty-tracking
/// optimization, only the engine's correctness).
pub struct MemBufferHandle<'a> {
    dev: &'a dyn BlockDevice,
    blk: BlockNumber,
    bytes: Vec<u8>,
    dirty: bool,
}

impl BufferHandle for MemBufferHandle<'_> {
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.bytes
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Drop for MemBufferHandle<'_> {
    fn drop(&mut self) {
        if self.dirty {
            let _ = self.dev.write_block(self.blk, &self.bytes);
        }
    }
}

pub struct MemBufferCache<'a> {
    dev: &'a dyn BlockDevice,
}

impl<'a> MemBufferCache<'a> {
    pub fn new(dev: &'a dyn BlockDevice) -> Self {
        Self { dev }
    }
}

impl BufferCache for MemBufferCache<'_> {
    fn get(&self, blk: BlockNumber) -> Result<Box<dyn BufferHandle + '_>> {
        let mut bytes = vec![0u8; self.dev.block_size()];
        self.dev.read_block(blk, &mut bytes)?;
        Ok(Box::new(MemBufferHandle {
            dev: self.dev,
            blk,
            bytes,
            dirty: false,
        }))
    }
}

pub struct FixedClock {
    pub seconds: u64,
}

impl Clock for FixedClock {
    fn now(&self) -> (u64, u32) {
        (self.seconds, 0)
    }
}
