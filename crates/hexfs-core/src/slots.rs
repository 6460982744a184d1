//! Slot addressing over the five indirection trees.
//!
//! A logical slot `s` addresses one payload element (a file block or a
//! dirent). Slot 0 lives directly in tree root 0; the next `N` slots go
//! through one indirection block rooted at tree 1; tree 2 covers `N²`
//! slots, and so on through tree 4. Interior blocks materialize on demand
//! when a non-invalid value is stored and are freed, cascading upward, as
//! soon as their last entry becomes invalid.

use crate::handle::HandleState;
use crate::store::Store;
use hexfs_error::{EmergencyKind, HexfsError, Result};
use hexfs_types::{Block, INDICES_PER_BLOCK as N, INVALID_INDEX, MAX_SLOT_COUNT};
use tracing::error;

/// Decompose a slot into its tree number and up to four intra-tree
/// coordinates (unused coordinates are [`INVALID_INDEX`]).
pub(crate) fn slot_to_tree_indices(slot: u64) -> (usize, [u64; 4]) {
    if slot == 0 {
        return (0, [INVALID_INDEX; 4]);
    }
    let mut s = slot - 1;
    if s < N {
        return (1, [s, INVALID_INDEX, INVALID_INDEX, INVALID_INDEX]);
    }
    s -= N;
    if s < N * N {
        let i = s / N;
        return (2, [i, s - i * N, INVALID_INDEX, INVALID_INDEX]);
    }
    s -= N * N;
    if s < N * N * N {
        let i = s / (N * N);
        s -= i * (N * N);
        let j = s / N;
        return (3, [i, j, s - j * N, INVALID_INDEX]);
    }
    s -= N * N * N;
    let i = s / (N * N * N);
    s -= i * (N * N * N);
    let j = s / (N * N);
    s -= j * (N * N);
    let k = s / N;
    (4, [i, j, k, s - k * N])
}

impl HandleState {
    fn slot_bounds_check(&self, store: &Store, slot: u64, op: &'static str) -> Result<()> {
        if slot >= self.slot_count {
            error!(
                slot,
                slot_count = self.slot_count,
                op,
                "slot access beyond the inode's slot count"
            );
            store.emergency().raise(EmergencyKind::Bug);
            return Err(HexfsError::Unrecoverable);
        }
        Ok(())
    }

    /// Load `block_index` into the cache slot for `level`, unless it is
    /// already there.
    fn cache_block(&mut self, store: &Store, level: usize, block_index: u64) -> Result<()> {
        if self.cached_block_indices[level] != block_index {
            match store.block_read(block_index, &mut self.cached_blocks[level]) {
                Ok(()) => self.cached_block_indices[level] = block_index,
                Err(e) => {
                    self.cached_block_indices[level] = INVALID_INDEX;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// The value stored at `slot`, using and filling the block cache.
    pub(crate) fn get_slot(&mut self, store: &Store, slot: u64) -> Result<u64> {
        self.slot_bounds_check(store, slot, "get")?;
        let (tree, ijkl) = slot_to_tree_indices(slot);
        if tree == 0 {
            return Ok(self.inode.slot_tree_roots[0]);
        }

        let mut block_index = self.inode.slot_tree_roots[tree];
        for level in 0..tree {
            if block_index == INVALID_INDEX {
                return Ok(INVALID_INDEX);
            }
            self.cache_block(store, level, block_index)?;
            let next = self.cached_blocks[level].index_at(ijkl[level] as usize);
            if level == tree - 1 {
                return Ok(next);
            }
            block_index = next;
        }
        unreachable!("tree walk always returns inside the loop");
    }

    /// Read-only variant of [`get_slot`](Self::get_slot): consults the
    /// cache when it happens to match but never populates it, so a shared
    /// handle lock suffices.
    pub(crate) fn peek_slot(&self, store: &Store, slot: u64) -> Result<u64> {
        self.slot_bounds_check(store, slot, "peek")?;
        let (tree, ijkl) = slot_to_tree_indices(slot);
        if tree == 0 {
            return Ok(self.inode.slot_tree_roots[0]);
        }

        let mut scratch = Block::zeroed();
        let mut block_index = self.inode.slot_tree_roots[tree];
        for level in 0..tree {
            if block_index == INVALID_INDEX {
                return Ok(INVALID_INDEX);
            }
            let next = if self.cached_block_indices[level] == block_index {
                self.cached_blocks[level].index_at(ijkl[level] as usize)
            } else {
                store.block_read(block_index, &mut scratch)?;
                scratch.index_at(ijkl[level] as usize)
            };
            if level == tree - 1 {
                return Ok(next);
            }
            block_index = next;
        }
        unreachable!("tree walk always returns inside the loop");
    }

    /// Store `value` at `slot`. Interior blocks are created on the way down
    /// when writing a real value; storing [`INVALID_INDEX`] removes any
    /// interior block whose entries all become invalid, cascading toward
    /// the root.
    pub(crate) fn set_slot(&mut self, store: &Store, slot: u64, value: u64) -> Result<()> {
        self.slot_bounds_check(store, slot, "set")?;
        let (tree, ijkl) = slot_to_tree_indices(slot);
        if tree == 0 {
            self.inode.slot_tree_roots[0] = value;
            return Ok(());
        }

        let mut block_index = self.inode.slot_tree_roots[tree];
        for level in 0..tree {
            if block_index == INVALID_INDEX {
                if value == INVALID_INDEX {
                    // The whole subtree is unmaterialized; the slot already
                    // reads as invalid.
                    return Ok(());
                }
                // Materialize the missing interior block and hook it into
                // its parent (or the tree root).
                self.cached_blocks[level] = Block::invalid_indices();
                block_index = match store.block_add(&self.cached_blocks[level]) {
                    Ok(index) => index,
                    Err(e) => {
                        self.cached_block_indices[level] = INVALID_INDEX;
                        return Err(e);
                    }
                };
                self.cached_block_indices[level] = block_index;
                if level > 0 {
                    let parent_entry = ijkl[level - 1] as usize;
                    self.cached_blocks[level - 1].set_index(parent_entry, block_index);
                    store.block_write(
                        self.cached_block_indices[level - 1],
                        &self.cached_blocks[level - 1],
                    )?;
                } else {
                    self.inode.slot_tree_roots[tree] = block_index;
                }
            }
            self.cache_block(store, level, block_index)?;

            if level == tree - 1 {
                let entry = ijkl[level] as usize;
                let old_value = self.cached_blocks[level].index_at(entry);
                self.cached_blocks[level].set_index(entry, value);

                if value == INVALID_INDEX && self.cached_blocks[level].all_indices_invalid() {
                    // The leaf block died; remove it and every ancestor
                    // that becomes empty in turn.
                    let mut dying = level;
                    loop {
                        store.block_remove(self.cached_block_indices[dying])?;
                        self.cached_block_indices[dying] = INVALID_INDEX;
                        if dying == 0 {
                            self.inode.slot_tree_roots[tree] = INVALID_INDEX;
                            break;
                        }
                        let parent = dying - 1;
                        self.cached_blocks[parent].set_index(ijkl[parent] as usize, INVALID_INDEX);
                        if !self.cached_blocks[parent].all_indices_invalid() {
                            store.block_write(
                                self.cached_block_indices[parent],
                                &self.cached_blocks[parent],
                            )?;
                            break;
                        }
                        dying = parent;
                    }
                } else if let Err(e) =
                    store.block_write(self.cached_block_indices[level], &self.cached_blocks[level])
                {
                    self.cached_blocks[level].set_index(entry, old_value);
                    return Err(e);
                }
                return Ok(());
            }

            block_index = self.cached_blocks[level].index_at(ijkl[level] as usize);
        }
        unreachable!("tree walk always returns inside the loop");
    }

    /// Shift slots `[slot, slot_count)` up by one and store `value` at
    /// `slot`. Grows the slot count by one.
    pub(crate) fn insert_slot(&mut self, store: &Store, slot: u64, value: u64) -> Result<()> {
        if slot > self.slot_count {
            error!(
                slot,
                slot_count = self.slot_count,
                "insert beyond the end of the slot sequence"
            );
            store.emergency().raise(EmergencyKind::Bug);
            return Err(HexfsError::Unrecoverable);
        }
        if self.slot_count == MAX_SLOT_COUNT {
            return Err(HexfsError::NoSpace);
        }

        self.slot_count += 1;
        let mut i = self.slot_count - 1;
        while i > slot {
            let moved = self.get_slot(store, i - 1)?;
            self.set_slot(store, i, moved)?;
            i -= 1;
        }
        self.set_slot(store, slot, value)
    }

    /// Shift slots `(slot, slot_count)` down by one, shrinking the slot
    /// count. With `free_payload`, the dirent or block the slot referenced
    /// is removed from its chunk store.
    pub(crate) fn remove_slot(&mut self, store: &Store, slot: u64, free_payload: bool) -> Result<()> {
        self.slot_bounds_check(store, slot, "remove")?;

        let mut payload_index = INVALID_INDEX;
        if free_payload {
            payload_index = self.get_slot(store, slot)?;
        }

        for i in slot..self.slot_count - 1 {
            let moved = self.get_slot(store, i + 1)?;
            self.set_slot(store, i, moved)?;
        }
        self.set_slot(store, self.slot_count - 1, INVALID_INDEX)?;

        if free_payload && payload_index != INVALID_INDEX {
            if self.inode.is_dir() {
                store.dirent_remove(payload_index)?;
            } else if self.inode.is_regular() {
                store.block_remove(payload_index)?;
            } else {
                return Err(HexfsError::InvalidArgument);
            }
        }

        self.slot_count -= 1;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MountConfig, Owner};
    use crate::handle::InodeHandle;
    use crate::table::HandleTable;
    use hexfs_types::{Dirent, Inode, TYPE_REG};

    #[test]
    fn tree_indices_direct_slot() {
        assert_eq!(slot_to_tree_indices(0), (0, [INVALID_INDEX; 4]));
    }

    #[test]
    fn tree_indices_single_indirection() {
        let (tree, ijkl) = slot_to_tree_indices(1);
        assert_eq!((tree, ijkl[0]), (1, 0));
        let (tree, ijkl) = slot_to_tree_indices(N);
        assert_eq!((tree, ijkl[0]), (1, N - 1));
    }

    #[test]
    fn tree_indices_double_indirection() {
        let (tree, ijkl) = slot_to_tree_indices(1 + N);
        assert_eq!((tree, ijkl[0], ijkl[1]), (2, 0, 0));
        let (tree, ijkl) = slot_to_tree_indices(N + N * N);
        assert_eq!((tree, ijkl[0], ijkl[1]), (2, N - 1, N - 1));
    }

    #[test]
    fn tree_indices_triple_and_quad() {
        let (tree, ijkl) = slot_to_tree_indices(1 + N + N * N);
        assert_eq!((tree, ijkl[0], ijkl[1], ijkl[2]), (3, 0, 0, 0));

        let first_quad = 1 + N + N * N + N * N * N;
        let (tree, ijkl) = slot_to_tree_indices(first_quad);
        assert_eq!((tree, ijkl), (4, [0, 0, 0, 0]));

        let (tree, ijkl) = slot_to_tree_indices(MAX_SLOT_COUNT - 1);
        assert_eq!(tree, 4);
        assert_eq!(ijkl, [N - 1, N - 1, N - 1, N - 1]);
    }

    #[test]
    fn tree_indices_cover_disjoint_contiguous_ranges() {
        // The first slot of each tree follows the last slot of the one
        // before it.
        let boundaries = [1, 1 + N, 1 + N + N * N, 1 + N + N * N + N * N * N];
        for b in boundaries {
            let (tree_before, _) = slot_to_tree_indices(b - 1);
            let (tree_at, ijkl) = slot_to_tree_indices(b);
            assert_eq!(tree_at, tree_before + 1);
            for coord in ijkl.iter().take(tree_at) {
                assert_eq!(*coord, 0);
            }
        }
    }

    fn file_fixture() -> (crate::store::Store, HandleTable, std::sync::Arc<InodeHandle>) {
        let (store, _) = crate::store::Store::open(&MountConfig::in_memory()).expect("open");
        store.create_root_node(Owner { uid: 0, gid: 0 }).expect("root");
        let inode = Inode::node(TYPE_REG | 0o644, 0, 0, 0);
        let index = store.inode_add(&inode).expect("add");
        let table = HandleTable::new();
        let handle = table.get(&store, index).expect("get");
        (store, table, handle)
    }

    #[test]
    fn set_slot_materializes_and_collapses_interior_blocks() {
        let (store, _table, handle) = file_fixture();
        let mut state = handle.state_write();

        // Give the file enough slots to land in tree 2.
        state.inode.size = (2 + N) * 4096;
        state.slot_count = 2 + N;

        let slot = 1 + N; // first slot of tree 2
        assert_eq!(state.get_slot(&store, slot).expect("get"), INVALID_INDEX);

        state.set_slot(&store, slot, 7777).expect("set");
        assert_eq!(state.get_slot(&store, slot).expect("get"), 7777);
        assert_ne!(state.inode.slot_tree_roots[2], INVALID_INDEX);

        // Clearing the only entry collapses the whole interior chain.
        state.set_slot(&store, slot, INVALID_INDEX).expect("clear");
        assert_eq!(state.get_slot(&store, slot).expect("get"), INVALID_INDEX);
        assert_eq!(state.inode.slot_tree_roots[2], INVALID_INDEX);
    }

    #[test]
    fn insert_and_remove_shift_neighbors() {
        let (store, _table, handle) = file_fixture();
        let mut state = handle.state_write();
        state.inode.type_and_mode = hexfs_types::TYPE_DIR | 0o755;

        // Build a directory-like slot sequence 10, 20, 30.
        for (i, v) in [10_u64, 20, 30].into_iter().enumerate() {
            state.insert_slot(&store, i as u64, v).expect("insert");
        }
        // Insert 15 at slot 1: sequence becomes 10, 15, 20, 30.
        state.insert_slot(&store, 1, 15).expect("insert");
        let collected: Vec<u64> = (0..4)
            .map(|i| state.get_slot(&store, i).expect("get"))
            .collect();
        assert_eq!(collected, vec![10, 15, 20, 30]);

        // Remove slot 2 (the 20): sequence becomes 10, 15, 30.
        state.remove_slot(&store, 2, false).expect("remove");
        let collected: Vec<u64> = (0..3)
            .map(|i| state.get_slot(&store, i).expect("get"))
            .collect();
        assert_eq!(collected, vec![10, 15, 30]);
        assert_eq!(state.slot_count, 3);
    }

    #[test]
    fn peek_matches_get_without_touching_cache() {
        let (store, _table, handle) = file_fixture();
        let mut state = handle.state_write();
        state.inode.size = (5 + N) * 4096;
        state.slot_count = 5 + N;

        for slot in [0_u64, 1, 4, N, N + 2] {
            state.set_slot(&store, slot, slot + 100).expect("set");
        }
        let cache_before = state.cached_block_indices;
        for slot in [0_u64, 1, 4, N, N + 2, 2] {
            let expected = if slot == 2 { INVALID_INDEX } else { slot + 100 };
            assert_eq!(state.peek_slot(&store, slot).expect("peek"), expected);
        }
        assert_eq!(state.cached_block_indices, cache_before);
    }

    #[test]
    fn out_of_range_access_is_unrecoverable() {
        let (store, _table, handle) = file_fixture();
        let mut state = handle.state_write();
        assert!(matches!(
            state.get_slot(&store, 0),
            Err(HexfsError::Unrecoverable)
        ));
        assert!(store.emergency().is_raised());
    }

    #[test]
    fn dirent_reference_is_freed_with_slot() {
        let (store, _table, handle) = file_fixture();
        let mut state = handle.state_write();
        state.inode.type_and_mode = hexfs_types::TYPE_DIR | 0o755;

        let dirent = Dirent::new(b"x", 1).expect("dirent");
        let dirent_index = store.dirent_add(&dirent).expect("add");
        state.insert_slot(&store, 0, dirent_index).expect("insert");
        state.remove_slot(&store, 0, true).expect("remove");
        // The dirent chunk is gone; reading it again must fail.
        assert!(store.dirent_read(dirent_index).is_err());
    }
}
