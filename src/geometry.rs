//! Superblock parsing and group geometry.
//!
//! Blocks 0 and 1 are reserved; the superblock lives at byte offset 1024.
//! Beyond it, `num_groups` equally sized groups begin at block
//! `offset_group`, each laid out as `[descriptor][inode bitmap][inode
//! table][reference map][data region]`.

use crate::error::{Error, Result};
use crate::ids::{BlockNumber, GroupNumber, InodeNumber};
use bytemuck::{Pod, Zeroable};

/// The filesystem's magic number, as it appears in [`SuperblockRaw::magic`].
pub const MAGIC: u32 = 0x1205_0109;

/// Number of per-group locks the mount shares groups across (§5).
pub const N_LOCKS: usize = 32;

/// The on-disk superblock, byte-for-byte, little-endian throughout.
///
/// Every field is declared in on-disk order so that `repr(C)`'s natural
/// alignment introduces no padding: each `u64` field falls on an 8-byte
/// boundary without help, so this struct can be read directly out of a
/// buffer-cache block with [`bytemuck::from_bytes`].
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct SuperblockRaw {
    pub magic: u32,
    pub log_block_size: u32,
    pub flags: u64,
    pub num_blocks: u64,
    pub num_groups: u64,
    pub local_inode_bits: u32,
    pub group_size: u32,
    pub group_data_blocks: u32,
    pub group_inodes: u32,
    pub offset_group: u32,
    pub offset_inodes: u32,
    pub offset_refmap: u32,
    pub offset_data: u32,
    pub label: [u8; 48],
    pub uuid: [u8; 16],
    pub default_root: u64,
    pub checksum: u32,
}

impl SuperblockRaw {
    /// Computes the CRC32 of every field but `checksum` itself.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let bytes = bytemuck::bytes_of(self);
        crate::crc32::compute(&bytes[..bytes.len() - core::mem::size_of::<u32>()])
    }

    /// Verifies the on-disk checksum, per §9: a stored `0` means
    /// "unchecked" and always passes; any other value must match.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        self.checksum == 0 || self.checksum == self.compute_checksum()
    }

    /// Recomputes and stores the checksum field, for hosts that write a
    /// superblock back out.
    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }
}

/// Byte offset of the superblock within the volume.
pub const SUPERBLOCK_OFFSET: u64 = 1024;

/// A validated, derived view of the volume's geometry: the superblock plus
/// everything computed from it that the allocator and walker need on every
/// call, so they never have to re-derive it.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub block_size: u32,
    pub num_blocks: u64,
    pub num_groups: u64,
    pub local_inode_bits: u32,
    pub group_size: u32,
    pub group_data_blocks: u32,
    pub group_inodes: u32,
    pub offset_group: u32,
    pub offset_inodes: u32,
    pub offset_refmap: u32,
    pub offset_data: u32,
    pub default_root: InodeNumber,
}

impl Geometry {
    /// Validates a raw superblock's invariants (§3) and derives a
    /// [`Geometry`] from it.
    pub fn from_raw(sb: &SuperblockRaw) -> Result<Self> {
        if sb.magic != MAGIC {
            return Err(Error::with_detail(
                crate::error::ErrorKind::InvalidArgument,
                "bad superblock magic",
            ));
        }
        if !sb.verify_checksum() {
            return Err(Error::with_detail(
                crate::error::ErrorKind::InvalidArgument,
                "superblock checksum mismatch",
            ));
        }
        if !(sb.offset_inodes >= 2
            && sb.offset_inodes < sb.offset_refmap
            && sb.offset_refmap < sb.offset_data
            && sb.offset_data + sb.group_data_blocks <= sb.group_size)
        {
            return Err(Error::with_detail(
                crate::error::ErrorKind::InvalidArgument,
                "inconsistent group offsets",
            ));
        }
        if sb.num_groups == 0 {
            return Err(Error::with_detail(
                crate::error::ErrorKind::InvalidArgument,
                "no groups",
            ));
        }
        // Only the *metadata* portion (descriptor, inode bitmap, inode
        // table, reference map) of every group, including the last, must
        // fit inside the volume; the last group's data region is allowed to
        // be narrower than `group_data_blocks` and is clamped to the
        // volume's actual end (`Geometry::group_data_len`).
        let last_group_desc = (sb.num_groups - 1)
            .checked_mul(u64::from(sb.group_size))
            .and_then(|span| span.checked_add(u64::from(sb.offset_group)))
            .ok_or_else(|| {
                Error::with_detail(crate::error::ErrorKind::InvalidArgument, "geometry overflow")
            })?;
        let last_group_metadata_end = last_group_desc + u64::from(sb.offset_data);
        if last_group_metadata_end > sb.num_blocks {
            return Err(Error::with_detail(
                crate::error::ErrorKind::InvalidArgument,
                "groups extend past the volume",
            ));
        }
        let block_size = 1u32
            .checked_shl(sb.log_block_size)
            .ok_or_else(|| Error::with_detail(crate::error::ErrorKind::InvalidArgument, "bad log_block_size"))?;

        Ok(Self {
            block_size,
            num_blocks: sb.num_blocks,
            num_groups: sb.num_groups,
            local_inode_bits: sb.local_inode_bits,
            group_size: sb.group_size,
            group_data_blocks: sb.group_data_blocks,
            group_inodes: sb.group_inodes,
            offset_group: sb.offset_group,
            offset_inodes: sb.offset_inodes,
            offset_refmap: sb.offset_refmap,
            offset_data: sb.offset_data,
            default_root: InodeNumber(if sb.default_root == 0 {
                1
            } else {
                sb.default_root
            }),
        })
    }

    /// Block number of group `g`'s 1-block descriptor.
    #[must_use]
    pub fn group_desc_block(&self, g: GroupNumber) -> BlockNumber {
        BlockNumber(u64::from(self.offset_group) + g.0 * u64::from(self.group_size))
    }

    /// First block of group `g`'s inode bitmap.
    #[must_use]
    pub fn bitmap_start(&self, g: GroupNumber) -> BlockNumber {
        self.group_desc_block(g) + 1
    }

    /// First block of group `g`'s inode table.
    #[must_use]
    pub fn inodes_start(&self, g: GroupNumber) -> BlockNumber {
        self.group_desc_block(g) + u64::from(self.offset_inodes)
    }

    /// First block of group `g`'s reference map.
    #[must_use]
    pub fn refmap_start(&self, g: GroupNumber) -> BlockNumber {
        self.group_desc_block(g) + u64::from(self.offset_refmap)
    }

    /// First block of group `g`'s data region.
    #[must_use]
    pub fn data_start(&self, g: GroupNumber) -> BlockNumber {
        self.group_desc_block(g) + u64::from(self.offset_data)
    }

    /// Composes a physical block number from a group and a local data-region
    /// index.
    #[must_use]
    pub fn compose_block(&self, g: GroupNumber, local: u32) -> BlockNumber {
        self.data_start(g) + u64::from(local)
    }

    /// Recovers the group a physical block belongs to.
    #[must_use]
    pub fn extract_group(&self, blk: BlockNumber) -> GroupNumber {
        GroupNumber((blk.0 - u64::from(self.offset_group)) / u64::from(self.group_size))
    }

    /// Recovers the local data-region index of a physical block within its
    /// group.
    #[must_use]
    pub fn extract_local(&self, blk: BlockNumber) -> u32 {
        let within_group = (blk.0 - u64::from(self.offset_group)) % u64::from(self.group_size);
        (within_group - u64::from(self.offset_data)) as u32
    }

    /// Number of data blocks usable in group `g`: `group_data_blocks` for
    /// every group but the last, which is clamped to the volume's actual
    /// end.
    #[must_use]
    pub fn group_data_len(&self, g: GroupNumber) -> u32 {
        if g.0 + 1 == self.num_groups {
            let last_block = BlockNumber(self.num_blocks - 1);
            self.extract_local(last_block) + 1
        } else {
            self.group_data_blocks
        }
    }

    /// Number of inode slots in group `g`.
    #[must_use]
    pub fn group_inode_count(&self, g: GroupNumber) -> u32 {
        let _ = g;
        self.group_inodes
    }

    /// The group and local index an inode number decomposes into.
    #[must_use]
    pub fn inode_location(&self, ino: InodeNumber) -> (GroupNumber, u32) {
        let zero_based = ino.0 - 1;
        let group = zero_based >> self.local_inode_bits;
        let local_mask = (1u64 << self.local_inode_bits) - 1;
        let local = zero_based & local_mask;
        (GroupNumber(group), local as u32)
    }

    /// Recomposes an inode number from a group and local index.
    #[must_use]
    pub fn compose_inode(&self, g: GroupNumber, local: u32) -> InodeNumber {
        InodeNumber((g.0 << self.local_inode_bits) + u64::from(local) + 1)
    }

    /// Number of blocks needed to hold the inode bitmap of one group.
    #[must_use]
    pub fn inode_bitmap_blocks(&self) -> u32 {
        div_ceil_u32(self.group_inodes, self.block_size * 8)
    }

    /// Number of blocks needed to hold the reference map of one group.
    #[must_use]
    pub fn refmap_blocks(&self, g: GroupNumber) -> u32 {
        div_ceil_u32(self.group_data_len(g), self.block_size)
    }
}

/// Ceiling-division helper for `u32` geometry quantities.
#[must_use]
pub fn div_ceil_u32(n: u32, d: u32) -> u32 {
    (n + d - 1) / d
}

/// Ceiling-division helper for byte sizes expressed as `u64`, used to turn a
/// file size into a block count.
#[must_use]
pub fn div_ceil_u64(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}
