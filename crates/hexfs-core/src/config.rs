//! Mount-time configuration.

use hexfs_error::{HexfsError, Result};
use std::path::PathBuf;

/// Number of bytes expected in a key file: a 32-byte sealing key followed
/// by 8 reserved bytes (ignored).
pub const KEY_FILE_LEN: usize = 40;

/// Which host container implementation backs the six files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process byte vectors; nothing survives unmount.
    Memory,
    /// Regular files accessed with positional reads and writes.
    File,
    /// Memory-mapped files.
    Mmap,
}

/// Ownership applied to newly created inodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Everything the core needs to bring a filesystem up. All subsequent
/// behavior is derived from these inputs.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub backend: BackendKind,
    /// Directory holding the six container files. Ignored for the memory
    /// backend.
    pub dir: PathBuf,
    /// Approximate storage budget in bytes; 0 means unbounded.
    pub max_size: u64,
    /// Sealing key; `None` mounts unencrypted.
    pub key: Option<[u8; 32]>,
    /// Ask the host to punch holes for blocks freed in the middle of the
    /// block container.
    pub punch_holes: bool,
    /// Owner of the root inode if this mount formats the containers.
    pub root_owner: Owner,
}

impl MountConfig {
    /// A memory-backed throwaway configuration (tests, scratch mounts).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            dir: PathBuf::new(),
            max_size: 0,
            key: None,
            punch_holes: false,
            root_owner: Owner { uid: 0, gid: 0 },
        }
    }
}

/// Extract the sealing key from the raw contents of a key file.
///
/// The file carries [`KEY_FILE_LEN`] bytes; the first 32 are the key, the
/// trailing 8 are reserved and ignored.
pub fn parse_key_file(raw: &[u8]) -> Result<[u8; 32]> {
    if raw.len() != KEY_FILE_LEN {
        return Err(HexfsError::InvalidArgument);
    }
    let mut key = [0_u8; 32];
    key.copy_from_slice(&raw[..32]);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_file_must_be_exactly_forty_bytes() {
        assert!(parse_key_file(&[0_u8; 32]).is_err());
        assert!(parse_key_file(&[0_u8; 41]).is_err());
        let mut raw = [0_u8; KEY_FILE_LEN];
        raw[0] = 0xAB;
        raw[39] = 0xFF; // reserved tail, ignored
        let key = parse_key_file(&raw).expect("key");
        assert_eq!(key[0], 0xAB);
        assert_eq!(key[31], 0);
    }
}
