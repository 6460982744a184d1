//! The entity store: six host containers bound into three chunk stores.
//!
//! All persistent state flows through here. The store owns the inode,
//! dirent, and block chunk stores, applies the mount-time size budget to
//! every allocation, and carries the per-filesystem emergency latch.

use crate::config::{BackendKind, MountConfig, Owner};
use hexfs_chunk::{ChunkStore, Sealer};
use hexfs_error::{Emergency, HexfsError, Result};
use hexfs_store::Container;
use hexfs_types::{Block, Dirent, Inode, BLOCK_SIZE, DIRENT_SIZE, INODE_SIZE};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const INODE_MAP_FILE: &str = "inodemap.6fs";
const INODE_DAT_FILE: &str = "inodedat.6fs";
const DIRENT_MAP_FILE: &str = "direnmap.6fs";
const DIRENT_DAT_FILE: &str = "direndat.6fs";
const BLOCK_MAP_FILE: &str = "blockmap.6fs";
const BLOCK_DAT_FILE: &str = "blockdat.6fs";

/// Inputs for the statvfs reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatvfsReport {
    pub block_size: u64,
    pub max_name_len: u64,
    pub max_block_count: u64,
    pub free_block_count: u64,
    pub max_inode_count: u64,
    pub free_inode_count: u64,
}

/// The persistent side of a mounted filesystem.
#[derive(Debug)]
pub struct Store {
    inodes: ChunkStore,
    dirents: ChunkStore,
    blocks: ChunkStore,
    max_size: u64,
    emergency: Arc<Emergency>,
}

fn open_container(backend: BackendKind, dir: &Path, name: &str) -> Result<Container> {
    match backend {
        BackendKind::Memory => Ok(Container::memory()),
        BackendKind::File => Container::file(&dir.join(name)),
        BackendKind::Mmap => Container::mmap(&dir.join(name)),
    }
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;
    if bytes >= TIB {
        format!("{:.2} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

impl Store {
    /// Open (creating if absent) the six containers and bind them into the
    /// three chunk stores. Returns the store and whether the containers are
    /// unformatted (no inode 0 yet).
    pub fn open(config: &MountConfig) -> Result<(Self, bool)> {
        let emergency = Arc::new(Emergency::new());
        let backend = config.backend;
        let dir = config.dir.as_path();

        let inode_map = open_container(backend, dir, INODE_MAP_FILE)?;
        let inode_dat = open_container(backend, dir, INODE_DAT_FILE)?;
        let dirent_map = open_container(backend, dir, DIRENT_MAP_FILE)?;
        let dirent_dat = open_container(backend, dir, DIRENT_DAT_FILE)?;
        let block_map = open_container(backend, dir, BLOCK_MAP_FILE)?;
        let block_dat = open_container(backend, dir, BLOCK_DAT_FILE)?;

        let sealer_for = |key: &Option<[u8; 32]>| key.as_ref().map(Sealer::new);

        let inodes = ChunkStore::new(
            inode_map,
            inode_dat,
            INODE_SIZE,
            sealer_for(&config.key),
            false,
            Arc::clone(&emergency),
        )?;
        let dirents = ChunkStore::new(
            dirent_map,
            dirent_dat,
            DIRENT_SIZE,
            sealer_for(&config.key),
            false,
            Arc::clone(&emergency),
        )?;
        let blocks = ChunkStore::new(
            block_map,
            block_dat,
            BLOCK_SIZE,
            sealer_for(&config.key),
            config.punch_holes,
            Arc::clone(&emergency),
        )?;

        let store = Self {
            inodes,
            dirents,
            blocks,
            max_size: config.max_size,
            emergency,
        };

        let needs_root = store.inodes.chunks_in_storage() == 0;
        if !needs_root {
            // The presence of a well-formed root directory is the
            // "formatted" signal; anything else is not ours to mount.
            let root = store.inode_read(0)?;
            if !root.is_dir() {
                return Err(HexfsError::BadContainer);
            }
        }

        Ok((store, needs_root))
    }

    /// Create inode 0 as an empty directory, mode 0700.
    pub fn create_root_node(&self, owner: Owner) -> Result<u64> {
        let root = Inode::directory(None, 0o700, owner.uid, owner.gid);
        self.inode_add(&root)
    }

    /// The emergency latch shared by every component of this filesystem.
    #[must_use]
    pub fn emergency(&self) -> &Arc<Emergency> {
        &self.emergency
    }

    /// Total bytes currently held by the six containers.
    #[must_use]
    pub fn storage_size_in_bytes(&self) -> u64 {
        self.inodes.storage_size_in_bytes()
            + self.dirents.storage_size_in_bytes()
            + self.blocks.storage_size_in_bytes()
    }

    /// Gate a mutation: the emergency latch demotes everything to `EROFS`,
    /// and allocations must fit the configured budget with headroom for the
    /// indirection blocks the allocation may force into existence.
    pub fn check_write_action(&self, additional_bytes: u64) -> Result<()> {
        if self.emergency.is_raised() {
            return Err(HexfsError::ReadOnly);
        }
        if self.max_size > 0 && additional_bytes > 0 {
            let additional = additional_bytes + 4 * BLOCK_SIZE as u64;
            if self.storage_size_in_bytes() + additional > self.max_size {
                return Err(HexfsError::NoSpace);
            }
        }
        Ok(())
    }

    // ── Typed entity I/O ────────────────────────────────────────────────

    pub fn inode_add(&self, inode: &Inode) -> Result<u64> {
        self.check_write_action(self.inodes.stored_chunk_size())?;
        self.inodes.add(&inode.encode())
    }

    pub fn inode_remove(&self, index: u64) -> Result<()> {
        self.check_write_action(0)?;
        self.inodes.remove(index)
    }

    pub fn inode_read(&self, index: u64) -> Result<Inode> {
        let mut buf = [0_u8; INODE_SIZE];
        self.inodes.read(index, &mut buf)?;
        Ok(Inode::decode(&buf))
    }

    pub fn inode_write(&self, index: u64, inode: &Inode) -> Result<()> {
        self.inodes.write(index, &inode.encode())
    }

    pub fn dirent_add(&self, dirent: &Dirent) -> Result<u64> {
        self.check_write_action(self.dirents.stored_chunk_size())?;
        self.dirents.add(&dirent.encode())
    }

    pub fn dirent_remove(&self, index: u64) -> Result<()> {
        self.check_write_action(0)?;
        self.dirents.remove(index)
    }

    pub fn dirent_read(&self, index: u64) -> Result<Dirent> {
        let mut buf = [0_u8; DIRENT_SIZE];
        self.dirents.read(index, &mut buf)?;
        Ok(Dirent::decode(&buf))
    }

    pub fn dirent_write(&self, index: u64, dirent: &Dirent) -> Result<()> {
        self.dirents.write(index, &dirent.encode())
    }

    pub fn block_add(&self, block: &Block) -> Result<u64> {
        self.check_write_action(self.blocks.stored_chunk_size())?;
        self.blocks.add(block.as_bytes())
    }

    pub fn block_remove(&self, index: u64) -> Result<()> {
        self.check_write_action(0)?;
        self.blocks.remove(index)
    }

    pub fn block_read(&self, index: u64, block: &mut Block) -> Result<()> {
        self.blocks.read(index, block.as_bytes_mut())
    }

    pub fn block_write(&self, index: u64, block: &Block) -> Result<()> {
        self.blocks.write(index, block.as_bytes())
    }

    // ── Reporting ───────────────────────────────────────────────────────

    /// Inputs for statvfs: counts are derived from the configured budget,
    /// or from the host filesystem's capacity when the budget is unbounded.
    pub fn statvfs(&self) -> Result<StatvfsReport> {
        let (host_max, host_available) = self.blocks.stat()?;
        let current = self.storage_size_in_bytes();

        let (max_size, available) = if self.max_size == 0 {
            (host_max, host_available)
        } else {
            (self.max_size, self.max_size.saturating_sub(current))
        };

        let block = BLOCK_SIZE as u64;
        let per_inode = (INODE_SIZE + DIRENT_SIZE) as u64;
        Ok(StatvfsReport {
            block_size: block,
            max_name_len: hexfs_types::MAX_NAME_LEN as u64,
            max_block_count: max_size / block,
            free_block_count: available / block,
            max_inode_count: max_size / per_inode,
            free_inode_count: available / per_inode,
        })
    }

    /// Sync and close all six containers, logging transfer statistics.
    pub fn close(&self) -> Result<()> {
        let results = [
            self.blocks.close(),
            self.dirents.close(),
            self.inodes.close(),
        ];

        for (name, chunks) in [
            ("inodes", &self.inodes),
            ("dirents", &self.dirents),
            ("blocks", &self.blocks),
        ] {
            let (map_in, map_out) = chunks.bitmap_transfers();
            let (ent_in, ent_out, punched) = chunks.entity_transfers();
            let size = chunks.stored_chunk_size();
            info!(
                entity = name,
                chunk_size = size,
                bitmap_in = map_in,
                bitmap_out = map_out,
                entities_in = ent_in,
                entities_out = ent_out,
                punched_holes = punched,
                read = %format_bytes(ent_in * size),
                written = %format_bytes(ent_out * size),
                "container transfer statistics"
            );
        }

        results.into_iter().collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use hexfs_error::EmergencyKind;

    fn memory_store() -> Store {
        let (store, needs_root) = Store::open(&MountConfig::in_memory()).expect("open");
        assert!(needs_root);
        store
    }

    #[test]
    fn root_creation_formats_the_store() {
        let store = memory_store();
        let index = store
            .create_root_node(Owner { uid: 7, gid: 8 })
            .expect("root");
        assert_eq!(index, 0);
        let root = store.inode_read(0).expect("read");
        assert!(root.is_dir());
        assert_eq!(root.type_and_mode & 0o7777, 0o700);
        assert_eq!((root.uid, root.gid), (7, 8));
        assert_eq!(root.nlink, 2);
    }

    #[test]
    fn entity_round_trips() {
        let store = memory_store();
        let inode = Inode::node(hexfs_types::TYPE_REG | 0o644, 0, 1, 1);
        let idx = store.inode_add(&inode).expect("add");
        assert_eq!(store.inode_read(idx).expect("read"), inode);

        let dirent = Dirent::new(b"file", idx).expect("dirent");
        let didx = store.dirent_add(&dirent).expect("add");
        assert_eq!(store.dirent_read(didx).expect("read"), dirent);

        let mut block = Block::zeroed();
        block.as_bytes_mut()[0] = 0x42;
        let bidx = store.block_add(&block).expect("add");
        let mut readback = Block::zeroed();
        store.block_read(bidx, &mut readback).expect("read");
        assert_eq!(readback, block);
    }

    #[test]
    fn budget_rejects_allocations_past_max_size() {
        let mut config = MountConfig::in_memory();
        // Room for the root inode plus the safety margin, not much else.
        config.max_size = 8 * BLOCK_SIZE as u64;
        let (store, _) = Store::open(&config).expect("open");
        store.create_root_node(Owner { uid: 0, gid: 0 }).expect("root");

        let mut failed = false;
        for _ in 0..16 {
            if store.block_add(&Block::zeroed()).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed, "budget never kicked in");
        // Writes of existing entities are not budget-gated.
        store
            .inode_write(0, &store.inode_read(0).expect("read"))
            .expect("write");
    }

    #[test]
    fn emergency_latch_demotes_mutations_to_read_only() {
        let store = memory_store();
        store.create_root_node(Owner { uid: 0, gid: 0 }).expect("root");
        store.emergency().raise(EmergencyKind::SystemFailure);

        assert!(matches!(
            store.block_add(&Block::zeroed()),
            Err(HexfsError::ReadOnly)
        ));
        assert!(matches!(store.inode_remove(0), Err(HexfsError::ReadOnly)));
        // Reads keep working.
        assert!(store.inode_read(0).is_ok());
    }

    #[test]
    fn statvfs_uses_the_configured_budget() {
        let mut config = MountConfig::in_memory();
        config.max_size = 1 << 20;
        let (store, _) = Store::open(&config).expect("open");
        let report = store.statvfs().expect("statvfs");
        assert_eq!(report.block_size, 4096);
        assert_eq!(report.max_name_len, 255);
        assert_eq!(report.max_block_count, (1 << 20) / 4096);
        assert!(report.free_block_count <= report.max_block_count);
        assert_eq!(
            report.max_inode_count,
            (1 << 20) / (INODE_SIZE + DIRENT_SIZE) as u64
        );
    }

    #[test]
    fn mounting_foreign_content_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = MountConfig::in_memory();
        config.backend = BackendKind::File;
        config.dir = dir.path().to_path_buf();

        {
            let (store, needs_root) = Store::open(&config).expect("open");
            assert!(needs_root);
            // Format with something that is not a directory at inode 0.
            let bogus = Inode::node(hexfs_types::TYPE_REG | 0o644, 0, 0, 0);
            store.inode_add(&bogus).expect("add");
            store.close().expect("close");
        }

        let err = Store::open(&config).expect_err("must refuse");
        assert!(matches!(err, HexfsError::BadContainer));
    }
}
