//! On-disk and in-memory inode representation (§3, §4.8).
//!
//! The on-disk record is 256 bytes, fields laid out in on-disk order so
//! `repr(C)` introduces no implicit padding beyond the trailing reserved
//! bytes needed to round the struct out to 256.

use crate::error::{Error, Result};
use crate::ids::{BlockNumber, InodeNumber};
use crate::time::Timestamp;
use bytemuck::{Pod, Zeroable};
use spin::Mutex;

/// Number of direct extent slots carried in every inode.
pub const DIRECT_EXTENTS: usize = 12;

/// One on-disk extent record: the half-open physical block run `[start, end)`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct ExtentRaw {
    pub start: u64,
    pub end: u64,
}

impl ExtentRaw {
    pub const EMPTY: Self = Self { start: 0, end: 0 };

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.start == 0
    }

    #[must_use]
    pub const fn len(self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.end - self.start
        }
    }
}

/// The 256-byte on-disk inode record.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct InodeRaw {
    pub mode: u16,
    pub nlinks: u16,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    pub size: u64,
    pub mtime: u64,
    pub atime: u64,
    pub ctime: u64,
    pub extents: [ExtentRaw; DIRECT_EXTENTS],
    pub cont: u64,
    reserved: [u8; 8],
}

/// File type, as decoded from the high bits of `mode` (the Unix `S_IFMT`
/// convention).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
    Fifo,
    CharDevice,
    Directory,
    BlockDevice,
    Regular,
    Symlink,
    Socket,
}

const S_IFMT: u16 = 0xF000;
const S_IFIFO: u16 = 0x1000;
const S_IFCHR: u16 = 0x2000;
const S_IFDIR: u16 = 0x4000;
const S_IFBLK: u16 = 0x6000;
const S_IFREG: u16 = 0x8000;
const S_IFLNK: u16 = 0xA000;
const S_IFSOCK: u16 = 0xC000;

impl FileType {
    #[must_use]
    pub fn from_mode(mode: u16) -> Option<Self> {
        Some(match mode & S_IFMT {
            S_IFIFO => Self::Fifo,
            S_IFCHR => Self::CharDevice,
            S_IFDIR => Self::Directory,
            S_IFBLK => Self::BlockDevice,
            S_IFREG => Self::Regular,
            S_IFLNK => Self::Symlink,
            S_IFSOCK => Self::Socket,
            _ => return None,
        })
    }

    /// Device nodes store their `rdev` encoding in `extents[0].start`
    /// rather than a real extent (§4.8).
    #[must_use]
    pub fn is_device(self) -> bool {
        matches!(self, Self::CharDevice | Self::BlockDevice)
    }
}

/// Encodes a (major, minor) device pair using the traditional Linux "huge"
/// encoding, so a device number fits in the 64-bit slot `extents[0].start`
/// occupies.
#[must_use]
pub fn encode_dev(major: u32, minor: u32) -> u64 {
    let low = (minor & 0xff) | (major << 8) | ((minor & !0xff) << 12);
    u64::from(low)
}

/// Inverse of [`encode_dev`].
#[must_use]
pub fn decode_dev(raw: u64) -> (u32, u32) {
    let raw = raw as u32;
    let major = (raw & 0x000f_ff00) >> 8;
    let minor = (raw & 0xff) | ((raw >> 12) & 0x000f_ff00);
    (major, minor)
}

/// Mutable in-memory inode state, guarded by a single mutex that also
/// serializes block-map mutation (§4.4, §5): grow and truncate both take
/// this lock for the duration of their walk, readers proceeding lock-free
/// once a mutation has committed.
#[derive(Clone, Debug)]
pub struct InodeState {
    pub mode: u16,
    pub nlinks: u16,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    pub size: u64,
    pub mtime: Timestamp,
    pub atime: Timestamp,
    pub ctime: Timestamp,
    pub extents: [ExtentRaw; DIRECT_EXTENTS],
    pub cont: BlockNumber,
}

/// A cached inode: its number plus its mutable state.
pub struct Inode {
    pub ino: InodeNumber,
    state: Mutex<InodeState>,
}

impl Inode {
    /// Builds a freshly allocated, zeroed inode (`new_inode`, §3).
    #[must_use]
    pub fn new_inode(ino: InodeNumber, mode: u16, uid: u32, gid: u32, now: Timestamp) -> Self {
        Self {
            ino,
            state: Mutex::new(InodeState {
                mode,
                nlinks: 1,
                uid,
                gid,
                flags: 0,
                size: 0,
                mtime: now,
                atime: now,
                ctime: now,
                extents: [ExtentRaw::EMPTY; DIRECT_EXTENTS],
                cont: BlockNumber(0),
            }),
        }
    }

    /// Decodes a cached inode from its on-disk record (`iget`, §4.8).
    /// Rejects a record whose `nlinks` is zero (§7: *stale*).
    pub fn from_raw(ino: InodeNumber, raw: &InodeRaw) -> Result<Self> {
        if raw.nlinks == 0 {
            return Err(Error::stale());
        }
        Ok(Self {
            ino,
            state: Mutex::new(InodeState {
                mode: raw.mode,
                nlinks: raw.nlinks,
                uid: raw.uid,
                gid: raw.gid,
                flags: raw.flags,
                size: raw.size,
                mtime: Timestamp::decode(raw.mtime),
                atime: Timestamp::decode(raw.atime),
                ctime: Timestamp::decode(raw.ctime),
                extents: raw.extents,
                cont: BlockNumber(raw.cont),
            }),
        })
    }

    /// Serializes the current state back into an on-disk record
    /// (`write_inode`, §4.8).
    #[must_use]
    pub fn to_raw(&self) -> InodeRaw {
        let s = self.state.lock();
        InodeRaw {
            mode: s.mode,
            nlinks: s.nlinks,
            uid: s.uid,
            gid: s.gid,
            flags: s.flags,
            size: s.size,
            mtime: s.mtime.encode(),
            atime: s.atime.encode(),
            ctime: s.ctime.encode(),
            extents: s.extents,
            cont: s.cont.0,
            reserved: [0; 8],
        }
    }

    #[must_use]
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.state.lock().mode)
    }

    #[must_use]
    pub fn lock(&self) -> spin::MutexGuard<'_, InodeState> {
        self.state.lock()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    #[must_use]
    pub fn nlinks(&self) -> u16 {
        self.state.lock().nlinks
    }

    pub fn set_nlinks(&self, n: u16) {
        self.state.lock().nlinks = n;
    }
}
