//! JBFS core allocation and extent-mapping engine.
//!
//! Implements the on-disk format and concurrency model of a Unix-style
//! block filesystem: superblock/geometry derivation, the inode bitmap
//! and reference-map allocators, the extent walker/grower/truncator,
//! the directory entry engine, and inode (de)serialization, all behind
//! a small set of host contracts (`BlockDevice`, `BufferCache`,
//! `InodeCache`, `Clock`) so any VFS layer willing to implement them
//! can drive it.
#![no_std]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod bitmap;
pub mod crc32;
pub mod device;
pub mod dirent;
pub mod error;
pub mod extent;
pub mod fs;
pub mod geometry;
pub mod ids;
pub mod inode;
pub mod locks;
pub mod mount_opts;
pub mod refmap;
pub mod time;

#[cfg(test)]
mod test_support;

pub use error::{Error, ErrorKind, Result};
pub use fs::Jbfs;
