//! The filesystem surface.
//!
//! A [`Filesystem`] owns the [`Store`], the handle table, and the structure
//! lock. Operations come in two addressings that share one implementation:
//! path-based (the `getattr`/`mkdir`/`rename`-style surface) and
//! parent-plus-name / inode-index based (what a kernel shim delivers).
//!
//! Every operation takes the structure lock: exclusive when the namespace
//! graph can change (create, remove, link, rename, open and close — the
//! latter two because an unlink deferred to last close must be
//! serialized), shared otherwise.

use crate::config::{MountConfig, Owner};
use crate::handle::{DirentLookup, InodeHandle};
use crate::sparse::{FallocateMode, SeekWhence};
use crate::store::{StatvfsReport, Store};
use crate::table::HandleTable;
use crate::xattr::XattrSetMode;
use hexfs_error::{EmergencyKind, HexfsError, Result};
use hexfs_types::{Block, Dirent, Inode, Time, BLOCK_SIZE, INVALID_INDEX, MAX_NAME_LEN};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Inode index of the root directory.
pub const ROOT_INODE: u64 = 0;

/// How `rename` treats an existing destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameMode {
    /// Replace the destination if present (type rules permitting).
    Normal,
    /// Fail with `EEXIST` if the destination exists.
    NoReplace,
    /// Atomically swap source and destination; both must exist.
    Exchange,
}

/// An open file or directory stream: one handle-table reference that must
/// be returned through [`Filesystem::close`].
pub struct FileHandle {
    handle: Arc<InodeHandle>,
}

impl FileHandle {
    /// The inode index behind this open handle.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.handle.index()
    }
}

/// A mounted HexFS instance.
pub struct Filesystem {
    store: Store,
    table: HandleTable,
    structure: RwLock<()>,
}

/// Split `path` into its parent prefix and final component, keeping the
/// original's convention that the parent of a top-level name is `/`.
fn separate(path: &[u8]) -> Result<(&[u8], &[u8])> {
    let mut parent_len = path.len() - 1;
    while parent_len > 0 && path[parent_len] != b'/' {
        parent_len -= 1;
    }
    let parent = if parent_len == 0 {
        &path[..1]
    } else {
        &path[..parent_len]
    };
    let name_offset = if parent_len == 0 { 1 } else { parent_len + 1 };
    let name = &path[name_offset..];
    if name.len() > MAX_NAME_LEN {
        return Err(HexfsError::NameTooLong);
    }
    Ok((parent, name))
}

impl Filesystem {
    /// Open the containers and create the root inode if the store is
    /// unformatted.
    pub fn mount(config: &MountConfig) -> Result<Self> {
        let (store, needs_root) = Store::open(config)?;
        if needs_root {
            let index = store.create_root_node(config.root_owner)?;
            debug!(inode = index, "created root node");
        }
        debug!(backend = ?config.backend, encrypted = config.key.is_some(), "mounted");
        Ok(Self {
            store,
            table: HandleTable::new(),
            structure: RwLock::new(()),
        })
    }

    /// Sync and close the containers. The filesystem must not be used
    /// afterwards.
    pub fn unmount(&self) -> Result<()> {
        let _guard = self.structure.write();
        let result = self.store.close();
        debug!(ok = result.is_ok(), "unmounted");
        result
    }

    /// Direct store access for integration tests and tooling.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    // ── Internal plumbing (caller holds the structure lock) ─────────────

    fn with_handle<T>(
        &self,
        index: u64,
        f: impl FnOnce(&Arc<InodeHandle>) -> Result<T>,
    ) -> Result<T> {
        let handle = self.table.get(&self.store, index)?;
        let result = f(&handle);
        let released = self.table.release(&self.store, &handle);
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }

    fn lookup_child(&self, parent: u64, name: &[u8]) -> Result<u64> {
        self.with_handle(parent, |h| {
            if !h.inode().is_dir() {
                return Err(HexfsError::NotDirectory);
            }
            match h.find_dirent(&self.store, name)? {
                DirentLookup::Found { dirent, .. } => Ok(dirent.inode_index),
                DirentLookup::Missing { .. } => Err(HexfsError::NotFound),
            }
        })
    }

    fn resolve_inner(&self, path: &[u8]) -> Result<u64> {
        if path.len() == 1 {
            return Ok(ROOT_INODE);
        }
        let (parent, name) = separate(path)?;
        let parent_index = self.resolve_inner(parent)?;
        self.lookup_child(parent_index, name)
    }

    fn resolve(&self, path: &str) -> Result<u64> {
        let bytes = path.as_bytes();
        if bytes.first() != Some(&b'/') {
            return Err(HexfsError::NotFound);
        }
        self.resolve_inner(bytes)
    }

    fn resolve_parent<'p>(&self, path: &'p str) -> Result<(u64, &'p [u8])> {
        let bytes = path.as_bytes();
        if bytes.first() != Some(&b'/') || bytes.len() < 2 {
            return Err(HexfsError::NotFound);
        }
        let (parent, name) = separate(bytes)?;
        let parent_index = self.resolve_inner(parent)?;
        Ok((parent_index, name))
    }

    fn attr_of(&self, index: u64) -> Result<Inode> {
        self.with_handle(index, |h| Ok(h.inode()))
    }

    fn lookup_attr(&self, parent: u64, name: &[u8]) -> Result<(u64, Inode)> {
        let child = self.lookup_child(parent, name)?;
        Ok((child, self.attr_of(child)?))
    }

    // ── Lookup and attributes ───────────────────────────────────────────

    /// Resolve one name inside a directory.
    pub fn lookup(&self, parent: u64, name: &[u8]) -> Result<(u64, Inode)> {
        let _guard = self.structure.read();
        self.lookup_attr(parent, name)
    }

    pub fn getattr_at(&self, index: u64) -> Result<Inode> {
        let _guard = self.structure.read();
        self.attr_of(index)
    }

    /// Attributes by path: the index and the inode record.
    pub fn getattr(&self, path: &str) -> Result<(u64, Inode)> {
        let _guard = self.structure.read();
        let index = self.resolve(path)?;
        Ok((index, self.attr_of(index)?))
    }

    /// Attributes through an open handle, without touching the table.
    #[must_use]
    pub fn getattr_handle(&self, fh: &FileHandle) -> Inode {
        let _guard = self.structure.read();
        fh.handle.get_attr().1
    }

    pub fn statvfs(&self) -> Result<StatvfsReport> {
        let _guard = self.structure.read();
        self.store.statvfs()
    }

    // ── Namespace creation and removal ──────────────────────────────────

    pub fn mkdir_at(&self, parent: u64, name: &[u8], mode: u16, owner: Owner) -> Result<(u64, Inode)> {
        let _guard = self.structure.write();
        let result = self.with_handle(parent, |h| {
            h.mkdirent(&self.store, name, None, |parent_inode| {
                Inode::directory(Some(parent_inode), mode, owner.uid, owner.gid)
            })
        });
        debug!(parent, name = %String::from_utf8_lossy(name), ok = result.is_ok(), "mkdir");
        result?;
        self.lookup_attr(parent, name)
    }

    pub fn mkdir(&self, path: &str, mode: u16, owner: Owner) -> Result<()> {
        let _guard = self.structure.write();
        let (parent, name) = self.resolve_parent(path)?;
        let result = self.with_handle(parent, |h| {
            h.mkdirent(&self.store, name, None, |parent_inode| {
                Inode::directory(Some(parent_inode), mode, owner.uid, owner.gid)
            })
        });
        debug!(path, ok = result.is_ok(), "mkdir");
        result
    }

    pub fn mknod_at(
        &self,
        parent: u64,
        name: &[u8],
        type_and_mode: u16,
        rdev: u64,
        owner: Owner,
    ) -> Result<(u64, Inode)> {
        let _guard = self.structure.write();
        let result = self.with_handle(parent, |h| {
            h.mkdirent(&self.store, name, None, |_| {
                Inode::node(type_and_mode, rdev, owner.uid, owner.gid)
            })
        });
        debug!(parent, name = %String::from_utf8_lossy(name), ok = result.is_ok(), "mknod");
        result?;
        self.lookup_attr(parent, name)
    }

    pub fn mknod(&self, path: &str, type_and_mode: u16, rdev: u64, owner: Owner) -> Result<()> {
        let _guard = self.structure.write();
        let (parent, name) = self.resolve_parent(path)?;
        let result = self.with_handle(parent, |h| {
            h.mkdirent(&self.store, name, None, |_| {
                Inode::node(type_and_mode, rdev, owner.uid, owner.gid)
            })
        });
        debug!(path, ok = result.is_ok(), "mknod");
        result
    }

    fn rmdir_checker(inode: &Inode) -> Result<()> {
        if !inode.is_dir() {
            return Err(HexfsError::NotDirectory);
        }
        if inode.size > 0 {
            return Err(HexfsError::NotEmpty);
        }
        Ok(())
    }

    fn unlink_checker(inode: &Inode) -> Result<()> {
        if inode.is_dir() {
            return Err(HexfsError::IsDirectory);
        }
        Ok(())
    }

    pub fn rmdir_at(&self, parent: u64, name: &[u8]) -> Result<()> {
        let _guard = self.structure.write();
        let result = self.with_handle(parent, |h| {
            h.rmdirent(&self.store, &self.table, name, Self::rmdir_checker)
        });
        debug!(parent, name = %String::from_utf8_lossy(name), ok = result.is_ok(), "rmdir");
        result
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let _guard = self.structure.write();
        let (parent, name) = self.resolve_parent(path)?;
        let result = self.with_handle(parent, |h| {
            h.rmdirent(&self.store, &self.table, name, Self::rmdir_checker)
        });
        debug!(path, ok = result.is_ok(), "rmdir");
        result
    }

    pub fn unlink_at(&self, parent: u64, name: &[u8]) -> Result<()> {
        let _guard = self.structure.write();
        let result = self.with_handle(parent, |h| {
            h.rmdirent(&self.store, &self.table, name, Self::unlink_checker)
        });
        debug!(parent, name = %String::from_utf8_lossy(name), ok = result.is_ok(), "unlink");
        result
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let _guard = self.structure.write();
        let (parent, name) = self.resolve_parent(path)?;
        let result = self.with_handle(parent, |h| {
            h.rmdirent(&self.store, &self.table, name, Self::unlink_checker)
        });
        debug!(path, ok = result.is_ok(), "unlink");
        result
    }

    // ── Symlinks and hard links ─────────────────────────────────────────

    fn symlink_inner(&self, parent: u64, name: &[u8], target: &[u8], owner: Owner) -> Result<()> {
        if target.len() > BLOCK_SIZE {
            return Err(HexfsError::NameTooLong);
        }
        let mut block = Block::zeroed();
        block.as_bytes_mut()[..target.len()].copy_from_slice(target);
        let block_index = self.store.block_add(&block)?;

        let result = self.with_handle(parent, |h| {
            h.mkdirent(&self.store, name, None, |_| {
                Inode::symlink(target.len() as u64, block_index, owner.uid, owner.gid)
            })
        });
        if result.is_err() {
            if let Err(e) = self.store.block_remove(block_index) {
                error!(
                    block = block_index,
                    error = %e,
                    "cannot recover from symlink failure; a dead block remains"
                );
            }
        }
        result
    }

    pub fn symlink_at(
        &self,
        parent: u64,
        name: &[u8],
        target: &[u8],
        owner: Owner,
    ) -> Result<(u64, Inode)> {
        let _guard = self.structure.write();
        let result = self.symlink_inner(parent, name, target, owner);
        debug!(parent, name = %String::from_utf8_lossy(name), ok = result.is_ok(), "symlink");
        result?;
        self.lookup_attr(parent, name)
    }

    pub fn symlink(&self, target: &[u8], linkpath: &str, owner: Owner) -> Result<()> {
        let _guard = self.structure.write();
        let (parent, name) = self.resolve_parent(linkpath)?;
        let result = self.symlink_inner(parent, name, target, owner);
        debug!(linkpath, ok = result.is_ok(), "symlink");
        result
    }

    pub fn readlink_at(&self, index: u64) -> Result<Vec<u8>> {
        let _guard = self.structure.read();
        self.with_handle(index, |h| h.readlink(&self.store))
    }

    pub fn readlink(&self, path: &str) -> Result<Vec<u8>> {
        let _guard = self.structure.read();
        let index = self.resolve(path)?;
        self.with_handle(index, |h| h.readlink(&self.store))
    }

    fn link_inner(&self, index: u64, new_parent: u64, name: &[u8]) -> Result<Inode> {
        let handle = self.table.get(&self.store, index)?;
        let mut result = handle.link(&self.store);
        if result.is_ok() {
            result = self.with_handle(new_parent, |h| {
                h.mkdirent(&self.store, name, Some(index), |_| Inode::default())
            });
            if result.is_err() {
                // Undo the link count bump; the decrement runs when the
                // last reference goes away.
                handle.mark_remove_once_unused();
            }
        }
        let attr = handle.inode();
        let released = self.table.release(&self.store, &handle);
        match (result, released) {
            (Ok(()), Ok(())) => Ok(attr),
            (Ok(()), Err(e)) | (Err(e), Ok(())) => Err(e),
            (Err(_), Err(e2)) => {
                error!(inode = index, error = %e2, "cannot recover from link failure");
                self.store.emergency().raise(EmergencyKind::SystemFailure);
                Err(HexfsError::Unrecoverable)
            }
        }
    }

    pub fn link_at(&self, index: u64, new_parent: u64, name: &[u8]) -> Result<Inode> {
        let _guard = self.structure.write();
        let result = self.link_inner(index, new_parent, name);
        debug!(inode = index, new_parent, ok = result.is_ok(), "link");
        result
    }

    pub fn link(&self, old_path: &str, new_path: &str) -> Result<()> {
        let _guard = self.structure.write();
        let index = self.resolve(old_path)?;
        let (new_parent, name) = self.resolve_parent(new_path)?;
        let result = self.link_inner(index, new_parent, name);
        debug!(old_path, new_path, ok = result.is_ok(), "link");
        result.map(|_| ())
    }

    // ── Rename ──────────────────────────────────────────────────────────

    #[allow(clippy::too_many_lines)]
    fn rename_inner(
        &self,
        old_parent: u64,
        old_name: &[u8],
        new_parent: u64,
        new_name: &[u8],
        mode: RenameMode,
    ) -> Result<()> {
        if old_name.len() > MAX_NAME_LEN || new_name.len() > MAX_NAME_LEN {
            return Err(HexfsError::NameTooLong);
        }
        let store = &self.store;

        let old_parent_handle = self.table.get(store, old_parent)?;
        let new_parent_handle = match self.table.get(store, new_parent) {
            Ok(h) => h,
            Err(e) => {
                let _ = self.table.release(store, &old_parent_handle);
                return Err(e);
            }
        };

        let result = (|| -> Result<()> {
            if !old_parent_handle.inode().is_dir() || !new_parent_handle.inode().is_dir() {
                return Err(HexfsError::NotDirectory);
            }

            let (mut old_slot, old_dirent_index, mut old_dirent) =
                match old_parent_handle.find_dirent(store, old_name)? {
                    DirentLookup::Found {
                        slot,
                        dirent_index,
                        dirent,
                    } => (slot, dirent_index, dirent),
                    DirentLookup::Missing { .. } => return Err(HexfsError::NotFound),
                };

            let (new_exists, new_slot, new_dirent_index, new_dirent) =
                match new_parent_handle.find_dirent(store, new_name)? {
                    DirentLookup::Found {
                        slot,
                        dirent_index,
                        dirent,
                    } => (true, slot, dirent_index, Some(dirent)),
                    DirentLookup::Missing { insert_slot } => {
                        (false, insert_slot, INVALID_INDEX, None)
                    }
                };

            let old_inode = store.inode_read(old_dirent.inode_index)?;
            let new_inode = match &new_dirent {
                Some(d) => Some(store.inode_read(d.inode_index)?),
                None => None,
            };

            if let Some(new_inode) = &new_inode {
                if old_inode.is_dir() && !new_inode.is_dir() {
                    return Err(HexfsError::NotDirectory);
                }
                if !old_inode.is_dir() && new_inode.is_dir() {
                    return Err(HexfsError::IsDirectory);
                }
                if mode == RenameMode::NoReplace {
                    return Err(HexfsError::Exists);
                }
                if mode == RenameMode::Normal && new_inode.is_dir() && new_inode.size > 0 {
                    return Err(HexfsError::NotEmpty);
                }
            } else if mode == RenameMode::Exchange {
                return Err(HexfsError::NotFound);
            }

            if let Some(d) = &new_dirent {
                if old_inode.is_regular() && d.inode_index == old_dirent.inode_index {
                    // Both names are hard links to the same file; POSIX
                    // says do nothing.
                    return Ok(());
                }
            }

            match mode {
                RenameMode::Normal | RenameMode::NoReplace => {
                    old_dirent.set_name(new_name);
                    store.dirent_write(old_dirent_index, &old_dirent)?;

                    let mut undo = false;
                    let mut result = if new_exists {
                        let r = new_parent_handle.rename_helper_replace(
                            store,
                            new_slot,
                            old_dirent_index,
                        );
                        if r.is_ok() {
                            if let Err(e) = store.dirent_remove(new_dirent_index) {
                                warn!(
                                    dirent = new_dirent_index,
                                    error = %e,
                                    "cannot remove replaced directory entry; it remains"
                                );
                            }
                            let target = new_dirent
                                .as_ref()
                                .map(|d| d.inode_index)
                                .unwrap_or(INVALID_INDEX);
                            match self.table.get(store, target) {
                                Ok(h) => {
                                    h.mark_remove_once_unused();
                                    if let Err(e) = self.table.release(store, &h) {
                                        warn!(
                                            inode = target,
                                            error = %e,
                                            "removing the replaced inode might have failed"
                                        );
                                    }
                                }
                                Err(e) => {
                                    warn!(
                                        inode = target,
                                        error = %e,
                                        "cannot reach the replaced inode; it remains"
                                    );
                                }
                            }
                        } else {
                            undo = true;
                        }
                        r
                    } else {
                        let r =
                            new_parent_handle.rename_helper_add(store, new_slot, old_dirent_index);
                        if r.is_ok() {
                            if old_parent == new_parent && old_slot >= new_slot {
                                // The insert shifted everything at and
                                // above the destination slot up by one.
                                old_slot += 1;
                            }
                        } else {
                            undo = true;
                        }
                        r
                    };

                    if result.is_ok() {
                        result = old_parent_handle.rename_helper_remove(store, old_slot);
                        if result.is_err() {
                            undo = true;
                        }
                    }

                    if undo {
                        old_dirent.set_name(old_name);
                        if let Err(e) = store.dirent_write(old_dirent_index, &old_dirent) {
                            error!(error = %e, "cannot recover from rename failure");
                            store.emergency().raise(EmergencyKind::SystemFailure);
                            return Err(HexfsError::Unrecoverable);
                        }
                    }
                    result
                }
                RenameMode::Exchange => {
                    old_parent_handle.rename_helper_replace(store, old_slot, new_dirent_index)?;
                    if let Err(e) =
                        new_parent_handle.rename_helper_replace(store, new_slot, old_dirent_index)
                    {
                        if let Err(e2) = old_parent_handle.rename_helper_replace(
                            store,
                            old_slot,
                            old_dirent_index,
                        ) {
                            error!(error = %e2, "cannot recover from rename exchange failure");
                            store.emergency().raise(EmergencyKind::SystemFailure);
                            return Err(HexfsError::Unrecoverable);
                        }
                        return Err(e);
                    }
                    Ok(())
                }
            }
        })();

        if let Err(e) = self.table.release(store, &old_parent_handle) {
            warn!(error = %e, "release of the old parent after rename failed");
        }
        if let Err(e) = self.table.release(store, &new_parent_handle) {
            warn!(error = %e, "release of the new parent after rename failed");
        }
        result
    }

    pub fn rename_at(
        &self,
        old_parent: u64,
        old_name: &[u8],
        new_parent: u64,
        new_name: &[u8],
        mode: RenameMode,
    ) -> Result<()> {
        let _guard = self.structure.write();
        let result = self.rename_inner(old_parent, old_name, new_parent, new_name, mode);
        debug!(old_parent, new_parent, ?mode, ok = result.is_ok(), "rename");
        result
    }

    pub fn rename(&self, old_path: &str, new_path: &str, mode: RenameMode) -> Result<()> {
        let _guard = self.structure.write();
        let (old_parent, old_name) = self.resolve_parent(old_path)?;
        let (new_parent, new_name) = self.resolve_parent(new_path)?;
        let result = self.rename_inner(old_parent, old_name, new_parent, new_name, mode);
        debug!(old_path, new_path, ?mode, ok = result.is_ok(), "rename");
        result
    }

    // ── Metadata updates ────────────────────────────────────────────────

    pub fn chmod_at(&self, index: u64, mode: u16) -> Result<()> {
        let _guard = self.structure.read();
        self.with_handle(index, |h| h.chmod(&self.store, mode))
    }

    pub fn chmod(&self, path: &str, mode: u16) -> Result<()> {
        let _guard = self.structure.read();
        let index = self.resolve(path)?;
        self.with_handle(index, |h| h.chmod(&self.store, mode))
    }

    pub fn chown_at(&self, index: u64, uid: u32, gid: u32) -> Result<()> {
        let _guard = self.structure.read();
        self.with_handle(index, |h| h.chown(&self.store, uid, gid))
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let _guard = self.structure.read();
        let index = self.resolve(path)?;
        self.with_handle(index, |h| h.chown(&self.store, uid, gid))
    }

    pub fn utimens_at(
        &self,
        index: u64,
        atime: Option<Time>,
        mtime: Option<Time>,
        ctime: Option<Time>,
    ) -> Result<()> {
        let _guard = self.structure.read();
        self.with_handle(index, |h| h.utimens(&self.store, atime, mtime, ctime))
    }

    pub fn utimens(
        &self,
        path: &str,
        atime: Option<Time>,
        mtime: Option<Time>,
        ctime: Option<Time>,
    ) -> Result<()> {
        let _guard = self.structure.read();
        let index = self.resolve(path)?;
        self.with_handle(index, |h| h.utimens(&self.store, atime, mtime, ctime))
    }

    pub fn truncate_at(&self, index: u64, length: u64) -> Result<()> {
        let _guard = self.structure.read();
        self.with_handle(index, |h| {
            if !h.inode().is_regular() {
                return Err(HexfsError::InvalidArgument);
            }
            h.truncate(&self.store, length)
        })
    }

    pub fn truncate(&self, path: &str, length: u64) -> Result<()> {
        let _guard = self.structure.read();
        let index = self.resolve(path)?;
        self.with_handle(index, |h| {
            if !h.inode().is_regular() {
                return Err(HexfsError::InvalidArgument);
            }
            h.truncate(&self.store, length)
        })
    }

    // ── Open files and directory streams ────────────────────────────────

    fn open_inner(&self, index: u64, read_only: bool, trunc: bool, append: bool) -> Result<FileHandle> {
        let handle = self.table.get(&self.store, index)?;
        if let Err(e) = handle.open(&self.store, read_only, trunc, append) {
            if let Err(e2) = self.table.release(&self.store, &handle) {
                warn!(inode = index, error = %e2, "release after failed open also failed");
            }
            debug!(inode = index, ok = false, "open");
            return Err(e);
        }
        debug!(inode = index, read_only, trunc, append, ok = true, "open");
        Ok(FileHandle { handle })
    }

    pub fn open_at(
        &self,
        index: u64,
        read_only: bool,
        trunc: bool,
        append: bool,
    ) -> Result<FileHandle> {
        let _guard = self.structure.write();
        self.open_inner(index, read_only, trunc, append)
    }

    pub fn open(&self, path: &str, read_only: bool, trunc: bool, append: bool) -> Result<FileHandle> {
        let _guard = self.structure.write();
        let index = self.resolve(path)?;
        self.open_inner(index, read_only, trunc, append)
    }

    fn opendir_inner(&self, index: u64) -> Result<FileHandle> {
        let handle = self.table.get(&self.store, index)?;
        if let Err(e) = handle.open_dir(&self.store) {
            if let Err(e2) = self.table.release(&self.store, &handle) {
                warn!(inode = index, error = %e2, "release after failed opendir also failed");
            }
            return Err(e);
        }
        Ok(FileHandle { handle })
    }

    pub fn opendir_at(&self, index: u64) -> Result<FileHandle> {
        let _guard = self.structure.write();
        self.opendir_inner(index)
    }

    pub fn opendir(&self, path: &str) -> Result<FileHandle> {
        let _guard = self.structure.write();
        let index = self.resolve(path)?;
        self.opendir_inner(index)
    }

    /// Return the handle's table reference. The file or directory may be
    /// destroyed here if an unlink was deferred to last close.
    pub fn close(&self, fh: FileHandle) -> Result<()> {
        let _guard = self.structure.write();
        let index = fh.handle.index();
        let result = self.table.release(&self.store, &fh.handle);
        debug!(inode = index, ok = result.is_ok(), "close");
        result
    }

    pub fn readdir(&self, fh: &FileHandle, slot: u64) -> Result<Option<Dirent>> {
        let _guard = self.structure.read();
        fh.handle.read_dirent(&self.store, slot)
    }

    pub fn readdir_plus(&self, fh: &FileHandle, slot: u64) -> Result<Option<(Dirent, Inode)>> {
        let _guard = self.structure.read();
        fh.handle.read_dirent_plus(&self.store, slot)
    }

    // ── File I/O ────────────────────────────────────────────────────────

    pub fn read(&self, fh: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let _guard = self.structure.read();
        fh.handle.read(&self.store, offset, buf)
    }

    pub fn write(&self, fh: &FileHandle, offset: u64, buf: &[u8]) -> Result<usize> {
        let _guard = self.structure.read();
        fh.handle.write(&self.store, offset, buf)
    }

    pub fn fallocate(
        &self,
        fh: &FileHandle,
        offset: u64,
        length: u64,
        mode: FallocateMode,
    ) -> Result<()> {
        let _guard = self.structure.read();
        fh.handle.fallocate(&self.store, offset, length, mode)
    }

    pub fn lseek(&self, fh: &FileHandle, offset: u64, whence: SeekWhence) -> Result<u64> {
        let _guard = self.structure.read();
        fh.handle.lseek(&self.store, offset, whence)
    }

    // ── Extended attributes ─────────────────────────────────────────────

    pub fn xattr_set_at(
        &self,
        index: u64,
        name: &[u8],
        value: &[u8],
        mode: XattrSetMode,
    ) -> Result<()> {
        let _guard = self.structure.read();
        self.with_handle(index, |h| h.xattr_set(&self.store, name, value, mode))
    }

    pub fn xattr_set(&self, path: &str, name: &[u8], value: &[u8], mode: XattrSetMode) -> Result<()> {
        let _guard = self.structure.read();
        let index = self.resolve(path)?;
        self.with_handle(index, |h| h.xattr_set(&self.store, name, value, mode))
    }

    pub fn xattr_get_at(&self, index: u64, name: &[u8]) -> Result<Vec<u8>> {
        let _guard = self.structure.read();
        self.with_handle(index, |h| h.xattr_get(&self.store, name))
    }

    pub fn xattr_get(&self, path: &str, name: &[u8]) -> Result<Vec<u8>> {
        let _guard = self.structure.read();
        let index = self.resolve(path)?;
        self.with_handle(index, |h| h.xattr_get(&self.store, name))
    }

    pub fn xattr_list_at(&self, index: u64) -> Result<Vec<u8>> {
        let _guard = self.structure.read();
        self.with_handle(index, |h| h.xattr_list(&self.store))
    }

    pub fn xattr_list(&self, path: &str) -> Result<Vec<u8>> {
        let _guard = self.structure.read();
        let index = self.resolve(path)?;
        self.with_handle(index, |h| h.xattr_list(&self.store))
    }

    pub fn xattr_remove_at(&self, index: u64, name: &[u8]) -> Result<()> {
        let _guard = self.structure.read();
        self.with_handle(index, |h| h.xattr_remove(&self.store, name))
    }

    pub fn xattr_remove(&self, path: &str, name: &[u8]) -> Result<()> {
        let _guard = self.structure.read();
        let index = self.resolve(path)?;
        self.with_handle(index, |h| h.xattr_remove(&self.store, name))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separate_splits_like_the_namespace_expects() {
        let (parent, name) = separate(b"/a").expect("separate");
        assert_eq!((parent, name), (&b"/"[..], &b"a"[..]));

        let (parent, name) = separate(b"/a/b").expect("separate");
        assert_eq!((parent, name), (&b"/a"[..], &b"b"[..]));

        let (parent, name) = separate(b"/a/b/c").expect("separate");
        assert_eq!((parent, name), (&b"/a/b"[..], &b"c"[..]));

        let long = [b'x'; 256];
        let mut path = b"/".to_vec();
        path.extend_from_slice(&long);
        assert!(matches!(separate(&path), Err(HexfsError::NameTooLong)));
    }

    #[test]
    fn resolve_walks_the_tree() {
        let fs = Filesystem::mount(&MountConfig::in_memory()).expect("mount");
        let owner = Owner { uid: 0, gid: 0 };
        fs.mkdir("/a", 0o755, owner).expect("mkdir");
        fs.mkdir("/a/b", 0o755, owner).expect("mkdir");

        assert_eq!(fs.resolve("/").expect("resolve"), ROOT_INODE);
        let a = fs.resolve("/a").expect("resolve");
        let b = fs.resolve("/a/b").expect("resolve");
        assert_ne!(a, b);
        assert!(matches!(fs.resolve("/a/c"), Err(HexfsError::NotFound)));
        assert!(matches!(fs.resolve("a"), Err(HexfsError::NotFound)));

        let (index, inode) = fs.getattr("/a/b").expect("getattr");
        assert_eq!(index, b);
        assert!(inode.is_dir());
    }

    #[test]
    fn lookup_through_a_file_component_fails() {
        let fs = Filesystem::mount(&MountConfig::in_memory()).expect("mount");
        let owner = Owner { uid: 0, gid: 0 };
        fs.mknod("/f", hexfs_types::TYPE_REG | 0o644, 0, owner)
            .expect("mknod");
        assert!(matches!(
            fs.resolve("/f/child"),
            Err(HexfsError::NotDirectory)
        ));
    }
}
