//! Extended attributes.
//!
//! Each inode owns at most one auxiliary block holding its entire xattr
//! set. The block is a concatenation of entries
//! `[name_len:u8 | value_len:u16le | name | value]`, terminated by a zero
//! length byte (or the end of the block). The encoded set never exceeds
//! one block; the block is allocated on the first set and freed when the
//! last attribute is removed.

use crate::handle::{HandleState, InodeHandle};
use crate::store::Store;
use hexfs_error::{HexfsError, Result};
use hexfs_types::{Block, Time, BLOCK_SIZE, INVALID_INDEX};

const ENTRY_HEADER_LEN: usize = 3;
const NAME_MAX: usize = 255;

/// Conflict handling for [`InodeHandle::xattr_set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrSetMode {
    /// Insert or replace.
    Upsert,
    /// Fail with `EEXIST` if the attribute already exists.
    Create,
    /// Fail with `ENODATA` if the attribute does not exist.
    Replace,
}

struct XattrEntry {
    name: Vec<u8>,
    value: Vec<u8>,
}

fn encoded_len(entries: &[XattrEntry]) -> usize {
    entries
        .iter()
        .map(|e| ENTRY_HEADER_LEN + e.name.len() + e.value.len())
        .sum()
}

fn parse_entries(block: &Block, block_index: u64) -> Result<Vec<XattrEntry>> {
    let bytes = block.as_bytes();
    let mut entries = Vec::new();
    let mut pos = 0_usize;
    while pos < BLOCK_SIZE {
        let name_len = bytes[pos] as usize;
        if name_len == 0 {
            break;
        }
        let malformed = HexfsError::Integrity {
            index: block_index,
            detail: "malformed xattr region",
        };
        if pos + ENTRY_HEADER_LEN > BLOCK_SIZE {
            return Err(malformed);
        }
        let value_len = u16::from_le_bytes([bytes[pos + 1], bytes[pos + 2]]) as usize;
        let name_start = pos + ENTRY_HEADER_LEN;
        let value_start = name_start + name_len;
        let entry_end = value_start + value_len;
        if entry_end > BLOCK_SIZE {
            return Err(malformed);
        }
        entries.push(XattrEntry {
            name: bytes[name_start..value_start].to_vec(),
            value: bytes[value_start..entry_end].to_vec(),
        });
        pos = entry_end;
    }
    Ok(entries)
}

fn encode_entries(entries: &[XattrEntry]) -> Block {
    let mut block = Block::zeroed();
    let bytes = block.as_bytes_mut();
    let mut pos = 0_usize;
    for entry in entries {
        bytes[pos] = entry.name.len() as u8;
        bytes[pos + 1..pos + 3].copy_from_slice(&(entry.value.len() as u16).to_le_bytes());
        let name_start = pos + ENTRY_HEADER_LEN;
        bytes[name_start..name_start + entry.name.len()].copy_from_slice(&entry.name);
        let value_start = name_start + entry.name.len();
        bytes[value_start..value_start + entry.value.len()].copy_from_slice(&entry.value);
        pos = value_start + entry.value.len();
    }
    // A zero length byte terminates; when the set fills the block exactly,
    // the block end does.
    block
}

fn load_entries(store: &Store, state: &HandleState) -> Result<Vec<XattrEntry>> {
    if state.inode.xattr_block == INVALID_INDEX {
        return Ok(Vec::new());
    }
    let mut block = Block::zeroed();
    store.block_read(state.inode.xattr_block, &mut block)?;
    parse_entries(&block, state.inode.xattr_block)
}

/// Persist `entries`, allocating or freeing the xattr block as needed, and
/// stamp ctime.
fn store_entries(
    store: &Store,
    state: &mut HandleState,
    inode_index: u64,
    entries: &[XattrEntry],
) -> Result<()> {
    if entries.is_empty() {
        if state.inode.xattr_block != INVALID_INDEX {
            store.block_remove(state.inode.xattr_block)?;
            state.inode.xattr_block = INVALID_INDEX;
        }
    } else {
        if encoded_len(entries) > BLOCK_SIZE {
            return Err(HexfsError::NoSpace);
        }
        let block = encode_entries(entries);
        if state.inode.xattr_block == INVALID_INDEX {
            state.inode.xattr_block = store.block_add(&block)?;
        } else {
            store.block_write(state.inode.xattr_block, &block)?;
        }
    }
    state.inode.ctime = Time::now();
    store.inode_write(inode_index, &state.inode)
}

impl InodeHandle {
    /// All attribute names, in insertion order, each terminated by a NUL.
    pub(crate) fn xattr_list(&self, store: &Store) -> Result<Vec<u8>> {
        let state = self.state_write();
        let entries = load_entries(store, &state)?;
        let mut out = Vec::new();
        for entry in &entries {
            out.extend_from_slice(&entry.name);
            out.push(0);
        }
        Ok(out)
    }

    /// The value of attribute `name`.
    pub(crate) fn xattr_get(&self, store: &Store, name: &[u8]) -> Result<Vec<u8>> {
        let state = self.state_write();
        let entries = load_entries(store, &state)?;
        entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.clone())
            .ok_or(HexfsError::NoAttribute)
    }

    /// Insert, replace, or upsert attribute `name`.
    pub(crate) fn xattr_set(
        &self,
        store: &Store,
        name: &[u8],
        value: &[u8],
        mode: XattrSetMode,
    ) -> Result<()> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(HexfsError::NameTooLong);
        }
        let mut state = self.state_write();
        let mut entries = load_entries(store, &state)?;

        let existing = entries.iter().position(|e| e.name == name);
        match (mode, existing) {
            (XattrSetMode::Create, Some(_)) => return Err(HexfsError::Exists),
            (XattrSetMode::Replace, None) => return Err(HexfsError::NoAttribute),
            _ => {}
        }

        match existing {
            Some(i) => entries[i].value = value.to_vec(),
            None => entries.push(XattrEntry {
                name: name.to_vec(),
                value: value.to_vec(),
            }),
        }

        store_entries(store, &mut state, self.index(), &entries)
    }

    /// Remove attribute `name`; the block is freed when it becomes empty.
    pub(crate) fn xattr_remove(&self, store: &Store, name: &[u8]) -> Result<()> {
        let mut state = self.state_write();
        let mut entries = load_entries(store, &state)?;
        let Some(i) = entries.iter().position(|e| e.name == name) else {
            return Err(HexfsError::NoAttribute);
        };
        entries.remove(i);
        store_entries(store, &mut state, self.index(), &entries)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MountConfig, Owner};
    use crate::table::HandleTable;
    use hexfs_types::{Inode, TYPE_REG};
    use std::sync::Arc;

    fn fixture() -> (Store, HandleTable, Arc<InodeHandle>) {
        let (store, _) = Store::open(&MountConfig::in_memory()).expect("open");
        store.create_root_node(Owner { uid: 0, gid: 0 }).expect("root");
        let index = store
            .inode_add(&Inode::node(TYPE_REG | 0o644, 0, 0, 0))
            .expect("add");
        let table = HandleTable::new();
        let handle = table.get(&store, index).expect("get");
        (store, table, handle)
    }

    #[test]
    fn set_get_list_remove_round_trip() {
        let (store, _table, handle) = fixture();

        handle
            .xattr_set(&store, b"user.alpha", b"one", XattrSetMode::Upsert)
            .expect("set");
        handle
            .xattr_set(&store, b"user.beta", b"two", XattrSetMode::Upsert)
            .expect("set");

        assert_eq!(handle.xattr_get(&store, b"user.alpha").expect("get"), b"one");
        assert_eq!(
            handle.xattr_list(&store).expect("list"),
            b"user.alpha\0user.beta\0".to_vec()
        );

        handle.xattr_remove(&store, b"user.alpha").expect("remove");
        assert!(matches!(
            handle.xattr_get(&store, b"user.alpha"),
            Err(HexfsError::NoAttribute)
        ));
        assert_eq!(handle.xattr_list(&store).expect("list"), b"user.beta\0");
    }

    #[test]
    fn create_and_replace_modes_enforce_existence() {
        let (store, _table, handle) = fixture();
        assert!(matches!(
            handle.xattr_set(&store, b"user.a", b"v", XattrSetMode::Replace),
            Err(HexfsError::NoAttribute)
        ));
        handle
            .xattr_set(&store, b"user.a", b"v", XattrSetMode::Create)
            .expect("create");
        assert!(matches!(
            handle.xattr_set(&store, b"user.a", b"w", XattrSetMode::Create),
            Err(HexfsError::Exists)
        ));
        handle
            .xattr_set(&store, b"user.a", b"w", XattrSetMode::Replace)
            .expect("replace");
        assert_eq!(handle.xattr_get(&store, b"user.a").expect("get"), b"w");
    }

    #[test]
    fn block_is_allocated_lazily_and_freed_when_empty() {
        let (store, _table, handle) = fixture();
        assert_eq!(handle.inode().xattr_block, INVALID_INDEX);

        handle
            .xattr_set(&store, b"user.k", b"v", XattrSetMode::Upsert)
            .expect("set");
        let block_index = handle.inode().xattr_block;
        assert_ne!(block_index, INVALID_INDEX);

        handle.xattr_remove(&store, b"user.k").expect("remove");
        assert_eq!(handle.inode().xattr_block, INVALID_INDEX);
    }

    #[test]
    fn oversized_set_is_rejected_until_space_is_freed() {
        let (store, _table, handle) = fixture();
        handle
            .xattr_set(&store, b"user.a", &[0_u8; 4000], XattrSetMode::Upsert)
            .expect("set");
        // 4000 + 200 bodies plus headers exceed one block.
        assert!(matches!(
            handle.xattr_set(&store, b"user.b", &[0_u8; 200], XattrSetMode::Upsert),
            Err(HexfsError::NoSpace)
        ));
        // Shrinking the first attribute makes room.
        handle
            .xattr_set(&store, b"user.a", &[0_u8; 100], XattrSetMode::Upsert)
            .expect("shrink");
        handle
            .xattr_set(&store, b"user.b", &[0_u8; 200], XattrSetMode::Upsert)
            .expect("set");
        assert_eq!(
            handle.xattr_get(&store, b"user.b").expect("get").len(),
            200
        );
    }

    #[test]
    fn set_updates_ctime() {
        let (store, _table, handle) = fixture();
        let before = handle.inode().ctime;
        std::thread::sleep(std::time::Duration::from_millis(5));
        handle
            .xattr_set(&store, b"user.t", b"v", XattrSetMode::Upsert)
            .expect("set");
        assert!(before.is_older_than(&handle.inode().ctime));
    }
}
