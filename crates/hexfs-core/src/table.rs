//! The process-wide handle table.
//!
//! Handles are created on demand, keyed by inode index, and reference
//! counted: every open, opendir, lookup, or link acquisition pairs with
//! exactly one [`HandleTable::release`]. Release is the only place a handle
//! is dropped and the only place deferred unlink may run.

use crate::handle::InodeHandle;
use crate::store::Store;
use hexfs_error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct TableEntry {
    handle: Arc<InodeHandle>,
    refs: u64,
}

/// Map from inode index to live handle.
#[derive(Default)]
pub struct HandleTable {
    entries: Mutex<HashMap<u64, TableEntry>>,
}

impl HandleTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the handle for `inode_index`, creating it from the on-disk
    /// inode if none is live, and take one reference.
    pub fn get(&self, store: &Store, inode_index: u64) -> Result<Arc<InodeHandle>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&inode_index) {
            entry.refs += 1;
            return Ok(Arc::clone(&entry.handle));
        }
        let inode = store.inode_read(inode_index)?;
        let handle = Arc::new(InodeHandle::new(inode_index, inode));
        entries.insert(
            inode_index,
            TableEntry {
                handle: Arc::clone(&handle),
                refs: 1,
            },
        );
        Ok(handle)
    }

    /// Drop one reference. When the count reaches zero the handle is
    /// evicted, and if a remove was deferred it runs now; errors from that
    /// removal surface here.
    pub fn release(&self, store: &Store, handle: &Arc<InodeHandle>) -> Result<()> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&handle.index()) else {
            return Ok(());
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(dead) = entries.remove(&handle.index()) {
                if dead.handle.remove_once_unused() {
                    return dead.handle.remove_now_locked(store);
                }
            }
        }
        Ok(())
    }

    /// Number of live handles (test and statistics aid).
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MountConfig, Owner};

    fn store_with_root() -> Store {
        let (store, _) = Store::open(&MountConfig::in_memory()).expect("open");
        store.create_root_node(Owner { uid: 0, gid: 0 }).expect("root");
        store
    }

    #[test]
    fn get_shares_one_handle_per_inode() {
        let store = store_with_root();
        let table = HandleTable::new();
        let a = table.get(&store, 0).expect("get");
        let b = table.get(&store, 0).expect("get");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.live_handles(), 1);

        table.release(&store, &a).expect("release");
        assert_eq!(table.live_handles(), 1);
        table.release(&store, &b).expect("release");
        assert_eq!(table.live_handles(), 0);
    }

    #[test]
    fn get_of_missing_inode_fails() {
        let store = store_with_root();
        let table = HandleTable::new();
        assert!(table.get(&store, 999).is_err());
        assert_eq!(table.live_handles(), 0);
    }
}
