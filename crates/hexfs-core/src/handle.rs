//! Per-inode handles.
//!
//! An [`InodeHandle`] mediates every operation on one inode. It keeps a
//! cached copy of the inode record and a four-level indirection-block cache
//! (one block per tree depth), all behind the handle's reader/writer lock.
//! Mutations go to the cache and are written through at the points noted on
//! each operation.

use crate::store::Store;
use crate::table::HandleTable;
use hexfs_error::{EmergencyKind, HexfsError, Result};
use hexfs_types::{
    Block, Dirent, Inode, Time, BLOCK_SIZE, INVALID_INDEX, MAX_NAME_LEN, MAX_SLOT_COUNT,
    MODE_SGID, MODE_SUID, TYPE_MASK,
};
use parking_lot::RwLock;
use tracing::error;

/// Outcome of a directory-entry lookup: either the entry, or the slot at
/// which the name would have to be inserted to keep the directory sorted.
#[derive(Debug)]
pub(crate) enum DirentLookup {
    Found {
        slot: u64,
        dirent_index: u64,
        dirent: Dirent,
    },
    Missing {
        insert_slot: u64,
    },
}

/// Mutable state of a handle, guarded by the handle lock.
pub(crate) struct HandleState {
    pub(crate) inode: Inode,
    pub(crate) slot_count: u64,
    pub(crate) append: bool,
    pub(crate) remove_once_unused: bool,
    pub(crate) cached_block_indices: [u64; 4],
    pub(crate) cached_blocks: [Block; 4],
}

/// Number of payload slots an inode addresses, derived from its size and
/// type: one per 4096-byte block for regular files, one per entry for
/// directories, none for everything else.
pub(crate) fn slot_count_of(inode: &Inode) -> u64 {
    if inode.is_regular() {
        inode.size / BLOCK_SIZE as u64 + u64::from(inode.size % BLOCK_SIZE as u64 != 0)
    } else if inode.is_dir() {
        inode.size
    } else {
        0
    }
}

impl HandleState {
    /// Update atime following the relatime rule: only when it is older than
    /// ctime, older than mtime, or more than a day old. Returns whether the
    /// inode changed.
    pub(crate) fn update_atime(&mut self) -> bool {
        let now = Time::now();
        let day_ago = Time {
            seconds: now.seconds - 60 * 60 * 24,
            nanoseconds: now.nanoseconds,
        };
        if self.inode.atime.is_older_than(&self.inode.ctime)
            || self.inode.atime.is_older_than(&self.inode.mtime)
            || self.inode.atime.is_older_than(&day_ago)
        {
            self.inode.atime = now;
            true
        } else {
            false
        }
    }

    /// Grow or shrink a regular file to `length` bytes. Slots are added as
    /// holes and removed with their payload; when growing a file whose old
    /// tail block was partial, the stale tail bytes are zeroed so they can
    /// never resurface.
    pub(crate) fn truncate_now(&mut self, store: &Store, length: u64) -> Result<()> {
        if length == self.inode.size {
            return Ok(());
        }
        let block = BLOCK_SIZE as u64;
        let orig_size = self.inode.size;
        let orig_slot_count = self.slot_count;
        let new_slot_count = length / block + u64::from(length % block != 0);

        while new_slot_count < self.slot_count {
            self.remove_slot(store, self.slot_count - 1, true)?;
        }
        while new_slot_count > self.slot_count {
            self.insert_slot(store, self.slot_count, INVALID_INDEX)?;
        }

        if length > orig_size && orig_size % block != 0 {
            let last_orig_slot = orig_slot_count - 1;
            let valid = (orig_size % block) as usize;
            let index = self.get_slot(store, last_orig_slot)?;
            if index != INVALID_INDEX {
                let mut tail = Block::zeroed();
                store.block_read(index, &mut tail)?;
                tail.zero_range(valid, BLOCK_SIZE);
                store.block_write(index, &tail)?;
            }
        }

        self.inode.size = length;
        Ok(())
    }
}

/// A reference-counted accessor to one inode. Created and released only
/// through the [`HandleTable`].
pub struct InodeHandle {
    index: u64,
    state: RwLock<HandleState>,
}

impl InodeHandle {
    pub(crate) fn new(index: u64, inode: Inode) -> Self {
        let slot_count = slot_count_of(&inode);
        Self {
            index,
            state: RwLock::new(HandleState {
                inode,
                slot_count,
                append: false,
                remove_once_unused: false,
                cached_block_indices: [INVALID_INDEX; 4],
                cached_blocks: [
                    Block::zeroed(),
                    Block::zeroed(),
                    Block::zeroed(),
                    Block::zeroed(),
                ],
            }),
        }
    }

    /// The inode index this handle mediates.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// A copy of the cached inode.
    #[must_use]
    pub fn inode(&self) -> Inode {
        self.state.read().inode
    }

    /// Inode index and record in one locked step.
    #[must_use]
    pub fn get_attr(&self) -> (u64, Inode) {
        (self.index, self.state.read().inode)
    }

    #[must_use]
    pub(crate) fn remove_once_unused(&self) -> bool {
        self.state.read().remove_once_unused
    }

    /// Defer removal to the moment the last reference is released.
    pub(crate) fn mark_remove_once_unused(&self) {
        self.state.write().remove_once_unused = true;
    }

    // ── Link and removal ────────────────────────────────────────────────

    /// Add one hard link: bump `nlink`, stamp ctime, write the inode back.
    /// Only regular files can be hard linked.
    pub(crate) fn link(&self, store: &Store) -> Result<()> {
        let mut state = self.state.write();
        if !state.inode.is_regular() {
            return Err(HexfsError::InvalidArgument);
        }
        if state.inode.nlink == u64::MAX {
            return Err(HexfsError::TooManyLinks);
        }
        let old_ctime = state.inode.ctime;
        state.inode.nlink += 1;
        state.inode.ctime = Time::now();
        let inode = state.inode;
        if let Err(e) = store.inode_write(self.index, &inode) {
            state.inode.nlink -= 1;
            state.inode.ctime = old_ctime;
            return Err(e);
        }
        Ok(())
    }

    /// Take the handle lock and run the removal immediately. Called from
    /// the table's release path once the reference count is zero.
    pub(crate) fn remove_now_locked(&self, store: &Store) -> Result<()> {
        let mut state = self.state.write();
        self.remove_now(store, &mut state)
    }

    /// Drop one link; when the link count reaches zero, destroy the inode
    /// and everything it owns.
    ///
    /// Destroying a large regular file walks all payload slots flat and
    /// frees each indirection block the first time the walk moves past it,
    /// instead of rewriting interior blocks slot by slot.
    fn remove_now(&self, store: &Store, state: &mut HandleState) -> Result<()> {
        let xattr_block = state.inode.xattr_block;
        let free_xattr = |destroyed: bool| -> Result<()> {
            if destroyed && xattr_block != INVALID_INDEX {
                store.block_remove(xattr_block)?;
            }
            Ok(())
        };

        if state.inode.is_regular() {
            if state.inode.nlink == 0 {
                error!(inode = self.index, "nlink was zero before unlink decrement");
                store.emergency().raise(EmergencyKind::Bug);
                return Err(HexfsError::Unrecoverable);
            }
            state.inode.nlink -= 1;
            if state.inode.nlink == 0 {
                store.inode_remove(self.index)?;
                let mut last_removed = [INVALID_INDEX; 4];
                for slot in 0..state.slot_count {
                    let block_index = state.get_slot(store, slot)?;
                    if block_index != INVALID_INDEX {
                        store.block_remove(block_index)?;
                    }
                    for level in 0..4 {
                        if state.cached_block_indices[level] != last_removed[level] {
                            if state.cached_block_indices[level] != INVALID_INDEX {
                                store.block_remove(state.cached_block_indices[level])?;
                            }
                            last_removed[level] = state.cached_block_indices[level];
                        }
                    }
                }
                free_xattr(true)?;
            } else {
                state.inode.ctime = Time::now();
                store.inode_write(self.index, &state.inode)?;
            }
        } else if state.inode.is_symlink() {
            store.inode_remove(self.index)?;
            store.block_remove(state.inode.slot_tree_roots[0])?;
            free_xattr(true)?;
        } else {
            store.inode_remove(self.index)?;
            free_xattr(true)?;
        }
        Ok(())
    }

    // ── Directory entries ───────────────────────────────────────────────

    /// Relatime atime maintenance when a directory stream is opened.
    pub(crate) fn open_dir(&self, store: &Store) -> Result<()> {
        let mut state = self.state.write();
        if !state.inode.is_dir() {
            return Err(HexfsError::NotDirectory);
        }
        let old = state.inode;
        if state.update_atime() {
            if let Err(e) = store.inode_write(self.index, &state.inode) {
                state.inode = old;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Binary search for `name` over the sorted dirent slots. Each probe
    /// reads one dirent. On a miss, the returned insertion slot is where
    /// the name belongs.
    pub(crate) fn find_dirent(&self, store: &Store, name: &[u8]) -> Result<DirentLookup> {
        let state = self.state.read();
        Self::find_dirent_now(store, &state, name)
    }

    /// The search itself, usable while the caller already holds the state
    /// lock in either mode. Probes bypass the block cache rather than
    /// populate it, so a shared lock suffices.
    pub(crate) fn find_dirent_now(
        store: &Store,
        state: &HandleState,
        name: &[u8],
    ) -> Result<DirentLookup> {
        let mut low = 0_u64;
        let mut high = state.slot_count; // exclusive
        while low < high {
            let slot = low + (high - low) / 2;
            let dirent_index = state.peek_slot(store, slot)?;
            let dirent = store.dirent_read(dirent_index)?;
            match name.cmp(dirent.name()) {
                std::cmp::Ordering::Greater => low = slot + 1,
                std::cmp::Ordering::Less => high = slot,
                std::cmp::Ordering::Equal => {
                    return Ok(DirentLookup::Found {
                        slot,
                        dirent_index,
                        dirent,
                    });
                }
            }
        }
        Ok(DirentLookup::Missing { insert_slot: low })
    }

    /// The dirent at directory stream position `slot`, or `None` past the
    /// end.
    pub(crate) fn read_dirent(&self, store: &Store, slot: u64) -> Result<Option<Dirent>> {
        let mut state = self.state.write();
        if slot >= state.slot_count {
            return Ok(None);
        }
        let dirent_index = state.get_slot(store, slot)?;
        Ok(Some(store.dirent_read(dirent_index)?))
    }

    /// Like [`read_dirent`](Self::read_dirent), plus the target inode.
    pub(crate) fn read_dirent_plus(
        &self,
        store: &Store,
        slot: u64,
    ) -> Result<Option<(Dirent, Inode)>> {
        let mut state = self.state.write();
        if slot >= state.slot_count {
            return Ok(None);
        }
        let dirent_index = state.get_slot(store, slot)?;
        let dirent = store.dirent_read(dirent_index)?;
        let inode = store.inode_read(dirent.inode_index)?;
        Ok(Some((dirent, inode)))
    }

    /// Create a directory entry named `name` in this directory. For new
    /// inodes `creator` builds the record from the parent; the hard-link
    /// path passes the existing inode index instead.
    pub(crate) fn mkdirent(
        &self,
        store: &Store,
        name: &[u8],
        existing_inode_index: Option<u64>,
        creator: impl FnOnce(&Inode) -> Inode,
    ) -> Result<()> {
        let mut state = self.state.write();
        if !state.inode.is_dir() {
            return Err(HexfsError::NotDirectory);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(HexfsError::NameTooLong);
        }
        if state.inode.nlink == u64::MAX {
            return Err(HexfsError::TooManyLinks);
        }
        if state.slot_count == MAX_SLOT_COUNT {
            return Err(HexfsError::NoSpace);
        }

        let insert_slot = match Self::find_dirent_now(store, &state, name)? {
            DirentLookup::Found { .. } => return Err(HexfsError::Exists),
            DirentLookup::Missing { insert_slot } => insert_slot,
        };

        let inode_index = match existing_inode_index {
            Some(index) => index,
            None => {
                let new_inode = creator(&state.inode);
                store.inode_add(&new_inode)?
            }
        };

        let dirent = Dirent::new(name, inode_index).ok_or(HexfsError::InvalidArgument)?;
        let dirent_index = store.dirent_add(&dirent)?;
        state.insert_slot(store, insert_slot, dirent_index)?;

        state.inode.size += 1;
        let t = Time::now();
        state.inode.mtime = t;
        state.inode.ctime = t;
        state.inode.nlink += 1;
        store.inode_write(self.index, &state.inode)
    }

    /// Remove the entry named `name`. `checker` sees the target inode and
    /// may veto (non-empty directory, type mismatches). The target loses
    /// one link; if it becomes unreferenced and no handle is open, it is
    /// destroyed now, otherwise on last release.
    pub(crate) fn rmdirent(
        &self,
        store: &Store,
        table: &HandleTable,
        name: &[u8],
        checker: impl FnOnce(&Inode) -> Result<()>,
    ) -> Result<()> {
        let mut state = self.state.write();
        if !state.inode.is_dir() {
            return Err(HexfsError::NotDirectory);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(HexfsError::NameTooLong);
        }
        if state.inode.nlink == 2 {
            // Only "." and "..": nothing to remove.
            return Err(HexfsError::NotFound);
        }

        let (slot, dirent) = match Self::find_dirent_now(store, &state, name)? {
            DirentLookup::Found { slot, dirent, .. } => (slot, dirent),
            DirentLookup::Missing { .. } => return Err(HexfsError::NotFound),
        };

        let target = table.get(store, dirent.inode_index)?;
        let verdict = checker(&target.inode())
            .and_then(|()| state.remove_slot(store, slot, true))
            .map(|()| target.mark_remove_once_unused());
        let released = table.release(store, &target);
        verdict?;
        released?;

        state.inode.size -= 1;
        let t = Time::now();
        state.inode.mtime = t;
        state.inode.ctime = t;
        state.inode.nlink -= 1;
        store.inode_write(self.index, &state.inode)
    }

    // ── Metadata ────────────────────────────────────────────────────────

    /// The symlink target bytes. Updates atime per relatime.
    pub(crate) fn readlink(&self, store: &Store) -> Result<Vec<u8>> {
        let mut state = self.state.write();
        if !state.inode.is_symlink() {
            return Err(HexfsError::InvalidArgument);
        }
        let mut block = Block::zeroed();
        store.block_read(state.inode.slot_tree_roots[0], &mut block)?;
        let len = (state.inode.size as usize).min(BLOCK_SIZE);
        let target = block.as_bytes()[..len].to_vec();

        let old = state.inode;
        if state.update_atime() && store.inode_write(self.index, &state.inode).is_err() {
            state.inode = old;
        }
        Ok(target)
    }

    pub(crate) fn chmod(&self, store: &Store, mode: u16) -> Result<()> {
        let mut state = self.state.write();
        let old = state.inode;
        state.inode.type_and_mode = (state.inode.type_and_mode & TYPE_MASK) | (mode & !TYPE_MASK);
        state.inode.ctime = Time::now();
        let inode = state.inode;
        if let Err(e) = store.inode_write(self.index, &inode) {
            state.inode = old;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn chown(&self, store: &Store, uid: u32, gid: u32) -> Result<()> {
        let mut state = self.state.write();
        let old = state.inode;
        state.inode.uid = uid;
        state.inode.gid = gid;
        state.inode.type_and_mode &= !(MODE_SUID | MODE_SGID);
        state.inode.ctime = Time::now();
        let inode = state.inode;
        if let Err(e) = store.inode_write(self.index, &inode) {
            state.inode = old;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn utimens(
        &self,
        store: &Store,
        atime: Option<Time>,
        mtime: Option<Time>,
        ctime: Option<Time>,
    ) -> Result<()> {
        if atime.is_none() && mtime.is_none() && ctime.is_none() {
            return Ok(());
        }
        let mut state = self.state.write();
        let old = state.inode;
        if let Some(t) = atime {
            state.inode.atime = t;
        }
        if let Some(t) = mtime {
            state.inode.mtime = t;
        }
        if let Some(t) = ctime {
            state.inode.ctime = t;
        }
        let inode = state.inode;
        if let Err(e) = store.inode_write(self.index, &inode) {
            state.inode = old;
            return Err(e);
        }
        Ok(())
    }

    /// Truncate a regular file, clearing setuid/setgid and stamping times.
    pub(crate) fn truncate(&self, store: &Store, length: u64) -> Result<()> {
        let mut state = self.state.write();
        state.truncate_now(store, length)?;
        state.inode.type_and_mode &= !(MODE_SUID | MODE_SGID);
        let t = Time::now();
        state.inode.mtime = t;
        state.inode.ctime = t;
        store.inode_write(self.index, &state.inode)
    }

    // ── File I/O ────────────────────────────────────────────────────────

    /// Prepare the handle for file I/O: apply `O_TRUNC`, record append
    /// mode, and maintain timestamps (relatime on read-only opens, mtime
    /// and ctime plus setuid/setgid clearing on writable ones).
    pub(crate) fn open(
        &self,
        store: &Store,
        read_only: bool,
        trunc: bool,
        append: bool,
    ) -> Result<()> {
        let mut state = self.state.write();
        if !state.inode.is_regular() {
            return Err(HexfsError::InvalidArgument);
        }
        state.append = append;
        if trunc && state.inode.size != 0 {
            state.truncate_now(store, 0)?;
        }
        let updated = if read_only {
            state.update_atime()
        } else {
            let t = Time::now();
            state.inode.mtime = t;
            state.inode.ctime = t;
            state.inode.type_and_mode &= !(MODE_SUID | MODE_SGID);
            true
        };
        if updated || trunc {
            store.inode_write(self.index, &state.inode)?;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`, clipped to the file size.
    /// Slots holding [`INVALID_INDEX`] contribute zeros. Returns the number
    /// of bytes read.
    pub(crate) fn read(&self, store: &Store, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.write();
        let block_u64 = BLOCK_SIZE as u64;

        let mut count = buf.len();
        if offset >= state.inode.size {
            count = 0;
        } else if offset + count as u64 > state.inode.size {
            count = (state.inode.size - offset) as usize;
        }
        let total = count;

        let mut offset = offset;
        let mut pos = 0_usize;
        let mut block = Block::zeroed();
        while pos < total {
            let slot = offset / block_u64;
            let block_index = state.get_slot(store, slot)?;
            if block_index == INVALID_INDEX {
                block = Block::zeroed();
            } else {
                store.block_read(block_index, &mut block)?;
            }
            let block_offset = (offset % block_u64) as usize;
            let len = (total - pos).min(BLOCK_SIZE - block_offset);
            buf[pos..pos + len]
                .copy_from_slice(&block.as_bytes()[block_offset..block_offset + len]);
            offset += len as u64;
            pos += len;
        }

        Ok(total)
    }

    /// Write `buf` at `offset` (rebased to EOF in append mode). Writing
    /// past EOF first extends the file sparsely; writing into a hole
    /// materializes a block. The inode is written back only if it changed.
    pub(crate) fn write(&self, store: &Store, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.write();
        let block_u64 = BLOCK_SIZE as u64;
        let orig_inode = state.inode;

        let mut offset = if state.append {
            state.inode.size
        } else {
            offset
        };
        if offset > state.inode.size {
            state.truncate_now(store, offset)?;
        }

        let result = (|| -> Result<()> {
            let mut input = buf;
            let mut block = Block::zeroed();
            while !input.is_empty() {
                let slot = offset / block_u64;
                let block_offset = (offset % block_u64) as usize;
                let len = input.len().min(BLOCK_SIZE - block_offset);

                if slot >= MAX_SLOT_COUNT {
                    return Err(HexfsError::NoSpace);
                }
                if slot > state.slot_count {
                    error!(
                        inode = self.index,
                        slot,
                        slot_count = state.slot_count,
                        "write moved past the slot frontier"
                    );
                    store.emergency().raise(EmergencyKind::Bug);
                    return Err(HexfsError::Unrecoverable);
                }

                let mut block_index = INVALID_INDEX;
                if slot < state.slot_count {
                    block_index = state.get_slot(store, slot)?;
                }

                if block_index == INVALID_INDEX {
                    if !(block_offset == 0 && len == BLOCK_SIZE) {
                        block = Block::zeroed();
                    }
                    block.as_bytes_mut()[block_offset..block_offset + len]
                        .copy_from_slice(&input[..len]);
                    block_index = store.block_add(&block)?;
                    if slot == state.slot_count {
                        state.insert_slot(store, slot, block_index)?;
                    } else {
                        state.set_slot(store, slot, block_index)?;
                    }
                } else {
                    if !(block_offset == 0 && len == BLOCK_SIZE) {
                        store.block_read(block_index, &mut block)?;
                    }
                    block.as_bytes_mut()[block_offset..block_offset + len]
                        .copy_from_slice(&input[..len]);
                    store.block_write(block_index, &block)?;
                }

                if offset + len as u64 > state.inode.size {
                    state.inode.size = offset + len as u64;
                }
                offset += len as u64;
                input = &input[len..];
            }
            Ok(())
        })();

        if state.inode != orig_inode {
            store.inode_write(self.index, &state.inode)?;
        }
        result.map(|()| buf.len())
    }

    // ── Rename helpers ──────────────────────────────────────────────────

    /// Install a dirent index at `slot` and grow the directory by one.
    pub(crate) fn rename_helper_add(
        &self,
        store: &Store,
        slot: u64,
        dirent_index: u64,
    ) -> Result<()> {
        let mut state = self.state.write();
        state.insert_slot(store, slot, dirent_index)?;
        state.inode.size += 1;
        store.inode_write(self.index, &state.inode)
    }

    /// Remove `slot` (keeping the dirent entity) and shrink by one.
    pub(crate) fn rename_helper_remove(&self, store: &Store, slot: u64) -> Result<()> {
        let mut state = self.state.write();
        state.remove_slot(store, slot, false)?;
        state.inode.size -= 1;
        store.inode_write(self.index, &state.inode)
    }

    /// Point `slot` at a different dirent entity.
    pub(crate) fn rename_helper_replace(
        &self,
        store: &Store,
        slot: u64,
        new_dirent_index: u64,
    ) -> Result<()> {
        let mut state = self.state.write();
        state.set_slot(store, slot, new_dirent_index)?;
        store.inode_write(self.index, &state.inode)
    }

    // ── State access for the sibling modules ────────────────────────────

    pub(crate) fn state_write(&self) -> parking_lot::RwLockWriteGuard<'_, HandleState> {
        self.state.write()
    }
}
