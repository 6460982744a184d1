#![forbid(unsafe_code)]
//! On-disk record types for HexFS.
//!
//! Everything that is persisted — inodes, directory entries, blocks — lives
//! here, together with explicit little-endian encoders and decoders. The
//! layouts are fixed; correctness must not depend on host endianness or
//! struct padding, so nothing in this crate reinterprets memory.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

// ── Fundamental constants ───────────────────────────────────────────────────

/// Size of one block in bytes. Shared by file data, indirection tables,
/// symlink targets, and xattr regions.
pub const BLOCK_SIZE: usize = 4096;

/// Number of `u64` child indices that fit in one block.
pub const INDICES_PER_BLOCK: u64 = (BLOCK_SIZE / 8) as u64;

/// Total addressable slots per inode across the five indirection trees:
/// `1 + N + N² + N³ + N⁴` with `N = 512`.
pub const MAX_SLOT_COUNT: u64 = 1
    + INDICES_PER_BLOCK
    + INDICES_PER_BLOCK * INDICES_PER_BLOCK
    + INDICES_PER_BLOCK * INDICES_PER_BLOCK * INDICES_PER_BLOCK
    + INDICES_PER_BLOCK * INDICES_PER_BLOCK * INDICES_PER_BLOCK * INDICES_PER_BLOCK;

/// Sentinel marking an unused slot, tree root, or block reference.
pub const INVALID_INDEX: u64 = u64::MAX;

/// Size of the zero-padded dirent name field (usable length + 1 for NUL).
pub const NAME_FIELD_LEN: usize = 256;

/// Maximum usable name length in bytes.
pub const MAX_NAME_LEN: usize = NAME_FIELD_LEN - 1;

/// Encoded size of an [`Inode`] record.
pub const INODE_SIZE: usize = 118;

/// Encoded size of a [`Dirent`] record.
pub const DIRENT_SIZE: usize = NAME_FIELD_LEN + 8;

// ── Type and mode bits ──────────────────────────────────────────────────────

pub const TYPE_MASK: u16 = 0o170_000;
pub const TYPE_SOCK: u16 = 0o140_000;
pub const TYPE_LNK: u16 = 0o120_000;
pub const TYPE_REG: u16 = 0o100_000;
pub const TYPE_BLK: u16 = 0o060_000;
pub const TYPE_DIR: u16 = 0o040_000;
pub const TYPE_CHR: u16 = 0o020_000;
pub const TYPE_FIFO: u16 = 0o010_000;

pub const MODE_MASK: u16 = 0o7777;
pub const MODE_SUID: u16 = 0o4000;
pub const MODE_SGID: u16 = 0o2000;
pub const MODE_SVTX: u16 = 0o1000;
pub const MODE_RWXU: u16 = 0o0700;

/// The file type carried in the high nibble of `type_and_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Decode the type nibble of a `type_and_mode` word.
    #[must_use]
    pub fn from_type_and_mode(type_and_mode: u16) -> Option<Self> {
        match type_and_mode & TYPE_MASK {
            TYPE_REG => Some(Self::Regular),
            TYPE_DIR => Some(Self::Directory),
            TYPE_LNK => Some(Self::Symlink),
            TYPE_BLK => Some(Self::BlockDevice),
            TYPE_CHR => Some(Self::CharDevice),
            TYPE_FIFO => Some(Self::Fifo),
            TYPE_SOCK => Some(Self::Socket),
            _ => None,
        }
    }

    /// The type bits for this kind.
    #[must_use]
    pub fn type_bits(self) -> u16 {
        match self {
            Self::Regular => TYPE_REG,
            Self::Directory => TYPE_DIR,
            Self::Symlink => TYPE_LNK,
            Self::BlockDevice => TYPE_BLK,
            Self::CharDevice => TYPE_CHR,
            Self::Fifo => TYPE_FIFO,
            Self::Socket => TYPE_SOCK,
        }
    }
}

// ── Timestamps ──────────────────────────────────────────────────────────────

/// A filesystem timestamp: seconds since the epoch plus nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Time {
    pub seconds: i64,
    pub nanoseconds: u32,
}

impl Time {
    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                seconds: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                nanoseconds: d.subsec_nanos(),
            },
            Err(e) => {
                let d = e.duration();
                Self {
                    seconds: -i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                    nanoseconds: d.subsec_nanos(),
                }
            }
        }
    }

    #[must_use]
    pub fn is_older_than(&self, other: &Self) -> bool {
        self.seconds < other.seconds
            || (self.seconds == other.seconds && self.nanoseconds < other.nanoseconds)
    }
}

// ── Little-endian field helpers ─────────────────────────────────────────────

#[inline]
fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0_u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

#[inline]
fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// An inode record. Same information as `struct stat`, with explicit field
/// widths, plus the five slot tree roots and the xattr block reference.
///
/// Encoded layout (little-endian, 118 bytes):
///
/// | offset | field |
/// |---|---|
/// | 0 | `atime` seconds (u64) + nanoseconds (u32) |
/// | 12 | `ctime` seconds + nanoseconds |
/// | 24 | `mtime` seconds + nanoseconds |
/// | 36 | `uid` (u32) |
/// | 40 | `gid` (u32) |
/// | 44 | `type_and_mode` (u16) |
/// | 46 | `nlink` (u64) |
/// | 54 | `rdev` (u64) |
/// | 62 | `size` (u64) |
/// | 70 | `slot_tree_roots` (5 × u64) |
/// | 110 | `xattr_block` (u64) |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub atime: Time,
    pub ctime: Time,
    pub mtime: Time,
    pub uid: u32,
    pub gid: u32,
    pub type_and_mode: u16,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub slot_tree_roots: [u64; 5],
    pub xattr_block: u64,
}

impl Default for Inode {
    fn default() -> Self {
        Self {
            atime: Time::default(),
            ctime: Time::default(),
            mtime: Time::default(),
            uid: 0,
            gid: 0,
            type_and_mode: 0,
            nlink: 0,
            rdev: 0,
            size: 0,
            slot_tree_roots: [INVALID_INDEX; 5],
            xattr_block: INVALID_INDEX,
        }
    }
}

impl Inode {
    /// A fresh inode with all three timestamps set to now and `nlink` 1.
    #[must_use]
    pub fn empty(uid: u32, gid: u32) -> Self {
        let t = Time::now();
        Self {
            atime: t,
            ctime: t,
            mtime: t,
            uid,
            gid,
            nlink: 1,
            ..Self::default()
        }
    }

    /// A new directory. Inherits the group (and the setgid bit) from a
    /// setgid parent, and starts with `nlink` 2 for `.` and `..`.
    #[must_use]
    pub fn directory(parent: Option<&Inode>, mode: u16, uid: u32, gid: u32) -> Self {
        let mut inode = Self::empty(uid, gid);
        inode.type_and_mode = TYPE_DIR | (mode & !TYPE_MASK);
        if let Some(parent) = parent {
            if parent.type_and_mode & MODE_SGID != 0 {
                inode.gid = parent.gid;
                inode.type_and_mode |= MODE_SGID;
            }
        }
        inode.nlink = 2;
        inode
    }

    /// A new non-directory node (regular file, device, fifo, socket).
    #[must_use]
    pub fn node(type_and_mode: u16, rdev: u64, uid: u32, gid: u32) -> Self {
        let mut inode = Self::empty(uid, gid);
        inode.type_and_mode = type_and_mode;
        inode.rdev = rdev;
        inode
    }

    /// A new symbolic link whose target occupies `target_len` bytes of the
    /// block at `block_index` (stored in tree root 0, never as a slot).
    #[must_use]
    pub fn symlink(target_len: u64, block_index: u64, uid: u32, gid: u32) -> Self {
        let mut inode = Self::empty(uid, gid);
        inode.type_and_mode = TYPE_LNK | 0o777;
        inode.size = target_len;
        inode.slot_tree_roots[0] = block_index;
        inode
    }

    /// The type bits of `type_and_mode`.
    #[must_use]
    pub fn type_bits(&self) -> u16 {
        self.type_and_mode & TYPE_MASK
    }

    /// The file kind, if the type nibble is valid.
    #[must_use]
    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_type_and_mode(self.type_and_mode)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.type_bits() == TYPE_DIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.type_bits() == TYPE_REG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.type_bits() == TYPE_LNK
    }

    /// Encode into the fixed little-endian layout.
    #[must_use]
    pub fn encode(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0_u8; INODE_SIZE];
        #[allow(clippy::cast_sign_loss)]
        {
            put_u64(&mut buf, 0, self.atime.seconds as u64);
            put_u32(&mut buf, 8, self.atime.nanoseconds);
            put_u64(&mut buf, 12, self.ctime.seconds as u64);
            put_u32(&mut buf, 20, self.ctime.nanoseconds);
            put_u64(&mut buf, 24, self.mtime.seconds as u64);
            put_u32(&mut buf, 32, self.mtime.nanoseconds);
        }
        put_u32(&mut buf, 36, self.uid);
        put_u32(&mut buf, 40, self.gid);
        put_u16(&mut buf, 44, self.type_and_mode);
        put_u64(&mut buf, 46, self.nlink);
        put_u64(&mut buf, 54, self.rdev);
        put_u64(&mut buf, 62, self.size);
        for (i, root) in self.slot_tree_roots.iter().enumerate() {
            put_u64(&mut buf, 70 + i * 8, *root);
        }
        put_u64(&mut buf, 110, self.xattr_block);
        buf
    }

    /// Decode from the fixed little-endian layout.
    #[must_use]
    pub fn decode(buf: &[u8; INODE_SIZE]) -> Self {
        #[allow(clippy::cast_possible_wrap)]
        let time_at = |off: usize| Time {
            seconds: get_u64(buf, off) as i64,
            nanoseconds: get_u32(buf, off + 8),
        };
        let mut slot_tree_roots = [0_u64; 5];
        for (i, root) in slot_tree_roots.iter_mut().enumerate() {
            *root = get_u64(buf, 70 + i * 8);
        }
        Self {
            atime: time_at(0),
            ctime: time_at(12),
            mtime: time_at(24),
            uid: get_u32(buf, 36),
            gid: get_u32(buf, 40),
            type_and_mode: get_u16(buf, 44),
            nlink: get_u64(buf, 46),
            rdev: get_u64(buf, 54),
            size: get_u64(buf, 62),
            slot_tree_roots,
            xattr_block: get_u64(buf, 110),
        }
    }
}

// ── Dirent ──────────────────────────────────────────────────────────────────

/// A directory entry: a zero-padded name and the index of the inode it
/// points to. Owned by exactly one directory inode at exactly one slot.
#[derive(Clone, Copy)]
pub struct Dirent {
    name: [u8; NAME_FIELD_LEN],
    pub inode_index: u64,
}

impl Dirent {
    /// Build a dirent. `name` must be 1..=[`MAX_NAME_LEN`] bytes and free of
    /// NUL bytes; returns `None` otherwise.
    #[must_use]
    pub fn new(name: &[u8], inode_index: u64) -> Option<Self> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains(&0) {
            return None;
        }
        let mut field = [0_u8; NAME_FIELD_LEN];
        field[..name.len()].copy_from_slice(name);
        Some(Self {
            name: field,
            inode_index,
        })
    }

    /// The name bytes, without the zero padding.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_FIELD_LEN);
        &self.name[..end]
    }

    /// Replace the name in place. Same validity rules as [`Dirent::new`].
    pub fn set_name(&mut self, name: &[u8]) -> bool {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains(&0) {
            return false;
        }
        self.name = [0_u8; NAME_FIELD_LEN];
        self.name[..name.len()].copy_from_slice(name);
        true
    }

    #[must_use]
    pub fn encode(&self) -> [u8; DIRENT_SIZE] {
        let mut buf = [0_u8; DIRENT_SIZE];
        buf[..NAME_FIELD_LEN].copy_from_slice(&self.name);
        put_u64(&mut buf, NAME_FIELD_LEN, self.inode_index);
        buf
    }

    #[must_use]
    pub fn decode(buf: &[u8; DIRENT_SIZE]) -> Self {
        let mut name = [0_u8; NAME_FIELD_LEN];
        name.copy_from_slice(&buf[..NAME_FIELD_LEN]);
        Self {
            name,
            inode_index: get_u64(buf, NAME_FIELD_LEN),
        }
    }
}

impl fmt::Debug for Dirent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dirent")
            .field("name", &String::from_utf8_lossy(self.name()))
            .field("inode_index", &self.inode_index)
            .finish()
    }
}

impl PartialEq for Dirent {
    fn eq(&self, other: &Self) -> bool {
        self.inode_index == other.inode_index && self.name[..] == other.name[..]
    }
}

impl Eq for Dirent {}

// ── Block ───────────────────────────────────────────────────────────────────

/// A 4096-byte buffer. The owning slot's context determines whether it holds
/// raw file bytes, `N` child-indirection indices, a symlink target, or an
/// xattr region.
#[derive(Clone)]
pub struct Block {
    bytes: [u8; BLOCK_SIZE],
}

impl Block {
    /// An all-zero block (file data / symlink target / xattr region).
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bytes: [0_u8; BLOCK_SIZE],
        }
    }

    /// A block whose `N` indices are all [`INVALID_INDEX`].
    #[must_use]
    pub fn invalid_indices() -> Self {
        Self {
            bytes: [0xFF_u8; BLOCK_SIZE],
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.bytes
    }

    /// Read child index `i` (little-endian).
    #[must_use]
    pub fn index_at(&self, i: usize) -> u64 {
        get_u64(&self.bytes, i * 8)
    }

    /// Write child index `i` (little-endian).
    pub fn set_index(&mut self, i: usize, v: u64) {
        put_u64(&mut self.bytes, i * 8, v);
    }

    /// Whether every child index is [`INVALID_INDEX`]. An indirection block
    /// in this state is dead and must be removed.
    #[must_use]
    pub fn all_indices_invalid(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0xFF)
    }

    /// Zero the byte range `[from, to)`.
    pub fn zero_range(&mut self, from: usize, to: usize) {
        self.bytes[from..to].fill(0);
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.bytes[..] == other.bytes[..]
    }
}

impl Eq for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nonzero = self.bytes.iter().filter(|b| **b != 0).count();
        write!(f, "Block {{ nonzero_bytes: {nonzero} }}")
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_line_up() {
        assert_eq!(INDICES_PER_BLOCK, 512);
        assert_eq!(MAX_SLOT_COUNT, 68_853_957_121);
        assert_eq!(DIRENT_SIZE, 264);
        assert_eq!(MAX_NAME_LEN, 255);
    }

    #[test]
    fn inode_codec_round_trip() {
        let mut inode = Inode::directory(None, 0o755, 1000, 1000);
        inode.size = 42;
        inode.nlink = 3;
        inode.rdev = 0xDEAD_BEEF;
        inode.slot_tree_roots = [7, INVALID_INDEX, 9, INVALID_INDEX, 11];
        inode.xattr_block = 1234;
        let decoded = Inode::decode(&inode.encode());
        assert_eq!(decoded, inode);
    }

    #[test]
    fn inode_codec_is_little_endian() {
        let mut inode = Inode::default();
        inode.type_and_mode = TYPE_REG | 0o644;
        inode.size = 0x0102_0304_0506_0708;
        let buf = inode.encode();
        assert_eq!(buf[44], (TYPE_REG | 0o644) as u8);
        assert_eq!(buf[62], 0x08);
        assert_eq!(buf[69], 0x01);
    }

    #[test]
    fn inode_negative_timestamp_survives() {
        let mut inode = Inode::default();
        inode.mtime = Time {
            seconds: -1,
            nanoseconds: 999_999_999,
        };
        let decoded = Inode::decode(&inode.encode());
        assert_eq!(decoded.mtime.seconds, -1);
        assert_eq!(decoded.mtime.nanoseconds, 999_999_999);
    }

    #[test]
    fn directory_inherits_setgid_group() {
        let mut parent = Inode::directory(None, 0o755, 0, 0);
        parent.gid = 4242;
        parent.type_and_mode |= MODE_SGID;
        let child = Inode::directory(Some(&parent), 0o700, 1000, 1000);
        assert_eq!(child.gid, 4242);
        assert_ne!(child.type_and_mode & MODE_SGID, 0);
        assert_eq!(child.nlink, 2);
    }

    #[test]
    fn symlink_stores_target_reference() {
        let inode = Inode::symlink(11, 99, 1, 1);
        assert!(inode.is_symlink());
        assert_eq!(inode.size, 11);
        assert_eq!(inode.slot_tree_roots[0], 99);
        assert_eq!(inode.slot_tree_roots[1], INVALID_INDEX);
    }

    #[test]
    fn kind_mapping_round_trips() {
        for kind in [
            FileKind::Regular,
            FileKind::Directory,
            FileKind::Symlink,
            FileKind::BlockDevice,
            FileKind::CharDevice,
            FileKind::Fifo,
            FileKind::Socket,
        ] {
            assert_eq!(
                FileKind::from_type_and_mode(kind.type_bits() | 0o644),
                Some(kind)
            );
        }
        assert_eq!(FileKind::from_type_and_mode(0o644), None);
    }

    #[test]
    fn dirent_rejects_bad_names() {
        assert!(Dirent::new(b"", 0).is_none());
        assert!(Dirent::new(&[b'a'; 256], 0).is_none());
        assert!(Dirent::new(b"a\0b", 0).is_none());
        assert!(Dirent::new(&[b'a'; 255], 0).is_some());
    }

    #[test]
    fn dirent_codec_round_trip() {
        let dirent = Dirent::new(b"hello.txt", 17).expect("valid name");
        let decoded = Dirent::decode(&dirent.encode());
        assert_eq!(decoded.name(), b"hello.txt");
        assert_eq!(decoded.inode_index, 17);
        assert_eq!(decoded, dirent);
    }

    #[test]
    fn dirent_set_name_clears_old_padding() {
        let mut dirent = Dirent::new(b"longer-name", 1).expect("valid name");
        assert!(dirent.set_name(b"x"));
        assert_eq!(dirent.name(), b"x");
        let buf = dirent.encode();
        assert!(buf[1..NAME_FIELD_LEN].iter().all(|b| *b == 0));
    }

    #[test]
    fn block_index_accessors() {
        let mut block = Block::invalid_indices();
        assert!(block.all_indices_invalid());
        assert_eq!(block.index_at(0), INVALID_INDEX);
        block.set_index(3, 77);
        assert!(!block.all_indices_invalid());
        assert_eq!(block.index_at(3), 77);
        block.set_index(3, INVALID_INDEX);
        assert!(block.all_indices_invalid());
    }

    #[test]
    fn block_zero_range() {
        let mut block = Block::zeroed();
        block.as_bytes_mut().fill(0xAA);
        block.zero_range(100, 200);
        assert!(block.as_bytes()[100..200].iter().all(|b| *b == 0));
        assert_eq!(block.as_bytes()[99], 0xAA);
        assert_eq!(block.as_bytes()[200], 0xAA);
    }

    #[test]
    fn time_ordering() {
        let a = Time {
            seconds: 5,
            nanoseconds: 10,
        };
        let b = Time {
            seconds: 5,
            nanoseconds: 11,
        };
        let c = Time {
            seconds: 6,
            nanoseconds: 0,
        };
        assert!(a.is_older_than(&b));
        assert!(b.is_older_than(&c));
        assert!(!c.is_older_than(&a));
        assert!(!a.is_older_than(&a));
    }
}
