#![forbid(unsafe_code)]
//! Chunk stores.
//!
//! A [`ChunkStore`] binds one allocation [`Bitmap`] to one entity
//! [`Container`] carrying fixed-size chunks (inodes, dirents, or blocks).
//! It hands out chunk indices on `add`, trims the container tail when the
//! highest chunks are freed, and optionally punches host-side holes for
//! chunks freed in the middle.
//!
//! With a key configured, every chunk is sealed as
//! `[0xFF | nonce | ciphertext‖tag]`. The marker byte distinguishes a
//! punched-hole region (all zero bytes) from ciphertext: a zero marker
//! decodes to an all-zero payload without touching the cipher, and any
//! nonzero marker that fails authentication is an integrity error for that
//! chunk. Bitmap containers are never sealed.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hexfs_alloc::Bitmap;
use hexfs_error::{Emergency, EmergencyKind, HexfsError, Result};
use hexfs_store::Container;
use parking_lot::RwLock;
use rand::RngCore;
use std::sync::Arc;
use tracing::error;

// ── Sealing ─────────────────────────────────────────────────────────────────

const MARKER_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes added to each chunk when sealing is active: marker + nonce + tag.
pub const SEAL_OVERHEAD: usize = MARKER_LEN + NONCE_LEN + TAG_LEN;

/// Sealing failed to authenticate (or the buffer is malformed).
#[derive(Debug)]
struct UnsealError;

/// Per-chunk authenticated encryption with a random nonce per write.
pub struct Sealer {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Sealer")
    }
}

impl Sealer {
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Seal `payload` into `out` (`payload.len() + SEAL_OVERHEAD` bytes).
    ///
    /// The marker byte is always `0xFF` so that a sealed chunk can never be
    /// mistaken for a punched-hole region, whose first byte is zero.
    fn seal(&self, payload: &[u8], out: &mut [u8]) {
        debug_assert_eq!(out.len(), payload.len() + SEAL_OVERHEAD);
        out[0] = 0xFF;
        let mut nonce_bytes = [0_u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        out[MARKER_LEN..MARKER_LEN + NONCE_LEN].copy_from_slice(&nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = self
            .cipher
            .encrypt(nonce, payload)
            .expect("ChaCha20-Poly1305 encryption is infallible for in-memory buffers");
        out[MARKER_LEN + NONCE_LEN..].copy_from_slice(&sealed);
    }

    /// Unseal `sealed` into `out`. A zero marker yields an all-zero payload
    /// without invoking the cipher.
    fn open(&self, sealed: &[u8], out: &mut [u8]) -> std::result::Result<(), UnsealError> {
        debug_assert_eq!(sealed.len(), out.len() + SEAL_OVERHEAD);
        if sealed[0] == 0 {
            // This chunk was turned into a hole: the payload is all zero.
            out.fill(0);
            return Ok(());
        }
        let nonce = Nonce::from_slice(&sealed[MARKER_LEN..MARKER_LEN + NONCE_LEN]);
        let payload = self
            .cipher
            .decrypt(nonce, &sealed[MARKER_LEN + NONCE_LEN..])
            .map_err(|_| UnsealError)?;
        if payload.len() != out.len() {
            return Err(UnsealError);
        }
        out.copy_from_slice(&payload);
        Ok(())
    }
}

// ── Chunk store ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ChunkState {
    map: Bitmap,
    chunks_in_storage: u64,
}

/// A bitmap-managed array of fixed-size entity chunks.
///
/// Reads and in-place writes of existing chunks take the store lock shared;
/// `add`, `remove`, and `sync` take it exclusively (the bitmap is only ever
/// touched inside the exclusive section, except for the cache-bypassing
/// freed-slot probe on the read path).
#[derive(Debug)]
pub struct ChunkStore {
    chunks: Container,
    state: RwLock<ChunkState>,
    payload_size: usize,
    punch_holes_for_empty_chunks: bool,
    sealer: Option<Sealer>,
    emergency: Arc<Emergency>,
}

impl ChunkStore {
    /// Bind `map_container` (the bitmap) to `chunk_container` (the entity
    /// array). The stored chunk size is `payload_size`, enlarged by
    /// [`SEAL_OVERHEAD`] when a sealer is supplied.
    pub fn new(
        map_container: Container,
        mut chunk_container: Container,
        payload_size: usize,
        sealer: Option<Sealer>,
        punch_holes_for_empty_chunks: bool,
        emergency: Arc<Emergency>,
    ) -> Result<Self> {
        let stored_size = if sealer.is_some() {
            payload_size + SEAL_OVERHEAD
        } else {
            payload_size
        };
        chunk_container.set_chunk_size(stored_size as u64);
        let map = Bitmap::new(map_container, Arc::clone(&emergency))?;
        let chunks_in_storage = chunk_container.size()?;
        Ok(Self {
            chunks: chunk_container,
            state: RwLock::new(ChunkState {
                map,
                chunks_in_storage,
            }),
            payload_size,
            punch_holes_for_empty_chunks,
            sealer,
            emergency,
        })
    }

    /// Payload bytes per chunk (the entity size, before sealing).
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Stored bytes per chunk (payload plus sealing overhead if active).
    #[must_use]
    pub fn stored_chunk_size(&self) -> u64 {
        self.chunks.chunk_size()
    }

    /// Number of chunk slots currently backed by the container.
    #[must_use]
    pub fn chunks_in_storage(&self) -> u64 {
        self.state.read().chunks_in_storage
    }

    /// Bytes occupied by the entity container plus its bitmap.
    #[must_use]
    pub fn storage_size_in_bytes(&self) -> u64 {
        let state = self.state.read();
        state.chunks_in_storage * self.chunks.chunk_size() + state.map.storage_size_in_bytes()
    }

    /// Capacity and free space of the host holding the entity container.
    pub fn stat(&self) -> Result<(u64, u64)> {
        self.chunks.stat()
    }

    fn seal_buf(&self, payload: &[u8]) -> Vec<u8> {
        match &self.sealer {
            Some(sealer) => {
                let mut out = vec![0_u8; payload.len() + SEAL_OVERHEAD];
                sealer.seal(payload, &mut out);
                out
            }
            None => payload.to_vec(),
        }
    }

    /// Store `payload` in a free chunk and return its index.
    pub fn add(&self, payload: &[u8]) -> Result<u64> {
        debug_assert_eq!(payload.len(), self.payload_size);
        let mut state = self.state.write();

        let index = state.map.first_zero()?;
        state.map.set_one(index)?;

        let mut grew = false;
        if index >= state.chunks_in_storage {
            state.chunks_in_storage = index + 1;
            grew = true;
            if let Err(e) = self.chunks.set_size(state.chunks_in_storage) {
                state.chunks_in_storage -= 1;
                if let Err(e2) = state.map.set_zero(index) {
                    error!(
                        index,
                        error = %e2,
                        "cannot recover from failure to grow the chunk container; a dead chunk remains"
                    );
                }
                return Err(e);
            }
        }

        let sealed = self.seal_buf(payload);
        if let Err(e) = self.chunks.write(index, 1, &sealed) {
            let rollback = state.map.set_zero(index).and_then(|()| {
                if grew {
                    state.chunks_in_storage -= 1;
                    self.chunks.set_size(state.chunks_in_storage)
                } else {
                    Ok(())
                }
            });
            if let Err(e2) = rollback {
                error!(
                    index,
                    error = %e2,
                    "cannot recover from failure to write chunk; a dead chunk remains"
                );
            }
            return Err(e);
        }

        Ok(index)
    }

    /// Free chunk `index`. Freeing the tail chunk peels all trailing free
    /// chunks off the container; freeing a middle chunk optionally punches
    /// a host hole (punch failures are swallowed).
    pub fn remove(&self, index: u64) -> Result<()> {
        let mut state = self.state.write();

        if index >= state.chunks_in_storage {
            error!(
                index,
                stored = state.chunks_in_storage,
                chunk_size = self.chunks.chunk_size(),
                "cannot remove a chunk beyond the container tail"
            );
            self.emergency.raise(EmergencyKind::Bug);
            return Err(HexfsError::Unrecoverable);
        }

        state.map.set_zero(index)?;

        if index + 1 == state.chunks_in_storage {
            // At the end of the storage: drop this chunk and every free
            // chunk preceding it to give the space back to the host.
            state.chunks_in_storage -= 1;
            let mut probe = index;
            while probe > 0 {
                probe -= 1;
                let live = match state.map.get(probe) {
                    Ok(live) => live,
                    Err(e) => {
                        error!(
                            index = probe,
                            error = %e,
                            "cannot determine how many trailing chunks to trim"
                        );
                        self.emergency.raise(EmergencyKind::SystemFailure);
                        return Err(HexfsError::Unrecoverable);
                    }
                };
                if live {
                    break;
                }
                state.chunks_in_storage -= 1;
            }
            if let Err(e) = self.chunks.set_size(state.chunks_in_storage) {
                error!(error = %e, "cannot trim trailing free chunks");
                self.emergency.raise(EmergencyKind::SystemFailure);
                return Err(HexfsError::Unrecoverable);
            }
        } else if self.punch_holes_for_empty_chunks {
            self.chunks.punch_hole(index, 1);
        }

        Ok(())
    }

    /// Read the payload of chunk `index`.
    ///
    /// Reading a freed slot never returns stale plaintext: sealed stores
    /// yield the zero payload (the hole semantics), plain stores fail with
    /// an integrity error.
    pub fn read(&self, index: u64, payload: &mut [u8]) -> Result<()> {
        debug_assert_eq!(payload.len(), self.payload_size);
        let state = self.state.read();

        if index >= state.chunks_in_storage {
            error!(
                index,
                stored = state.chunks_in_storage,
                "cannot read a chunk beyond the container tail"
            );
            self.emergency.raise(EmergencyKind::Bug);
            return Err(HexfsError::Unrecoverable);
        }

        if !state.map.peek(index)? {
            if self.sealer.is_some() {
                payload.fill(0);
                return Ok(());
            }
            return Err(HexfsError::Integrity {
                index,
                detail: "read of a freed chunk",
            });
        }

        match &self.sealer {
            Some(sealer) => {
                let mut sealed = vec![0_u8; self.payload_size + SEAL_OVERHEAD];
                self.chunks.read(index, 1, &mut sealed)?;
                sealer.open(&sealed, payload).map_err(|UnsealError| {
                    HexfsError::Integrity {
                        index,
                        detail: "authentication failed",
                    }
                })
            }
            None => self.chunks.read(index, 1, payload),
        }
    }

    /// Overwrite the payload of an existing chunk in place.
    pub fn write(&self, index: u64, payload: &[u8]) -> Result<()> {
        debug_assert_eq!(payload.len(), self.payload_size);
        let state = self.state.read();

        if index >= state.chunks_in_storage {
            error!(
                index,
                stored = state.chunks_in_storage,
                "cannot write a chunk beyond the container tail"
            );
            self.emergency.raise(EmergencyKind::Bug);
            return Err(HexfsError::Unrecoverable);
        }

        let sealed = self.seal_buf(payload);
        self.chunks.write(index, 1, &sealed)
    }

    /// Flush the bitmap's cached chunk and trim its tail.
    pub fn sync(&self) -> Result<()> {
        self.state.write().map.sync()
    }

    /// Sync, then finalize both containers. The entity container closes
    /// before the bitmap container, mirroring the open order.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        state.map.sync()?;
        self.chunks.close()?;
        state.map.close()
    }

    /// Transfer counters of the entity container: (in, out, punched).
    #[must_use]
    pub fn entity_transfers(&self) -> (u64, u64, u64) {
        (
            self.chunks.chunks_in(),
            self.chunks.chunks_out(),
            self.chunks.chunks_punched(),
        )
    }

    /// Transfer counters of the bitmap container: (in, out).
    #[must_use]
    pub fn bitmap_transfers(&self) -> (u64, u64) {
        self.state.read().map.transfer_counts()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_store(payload_size: usize) -> ChunkStore {
        ChunkStore::new(
            Container::memory(),
            Container::memory(),
            payload_size,
            None,
            false,
            Arc::new(Emergency::new()),
        )
        .expect("store")
    }

    fn sealed_store(payload_size: usize, key: &[u8; 32]) -> ChunkStore {
        ChunkStore::new(
            Container::memory(),
            Container::memory(),
            payload_size,
            Some(Sealer::new(key)),
            false,
            Arc::new(Emergency::new()),
        )
        .expect("store")
    }

    #[test]
    fn add_hands_out_lowest_free_index() {
        let store = plain_store(16);
        assert_eq!(store.add(&[1_u8; 16]).expect("add"), 0);
        assert_eq!(store.add(&[2_u8; 16]).expect("add"), 1);
        assert_eq!(store.add(&[3_u8; 16]).expect("add"), 2);
        store.remove(1).expect("remove");
        assert_eq!(store.add(&[4_u8; 16]).expect("add"), 1);
    }

    #[test]
    fn read_write_round_trip() {
        let store = plain_store(16);
        let index = store.add(&[0xAB_u8; 16]).expect("add");
        let mut buf = [0_u8; 16];
        store.read(index, &mut buf).expect("read");
        assert_eq!(buf, [0xAB_u8; 16]);

        store.write(index, &[0xCD_u8; 16]).expect("write");
        store.read(index, &mut buf).expect("read");
        assert_eq!(buf, [0xCD_u8; 16]);
    }

    #[test]
    fn removing_tail_chunks_trims_the_container() {
        let store = plain_store(16);
        for fill in 0..4_u8 {
            store.add(&[fill; 16]).expect("add");
        }
        assert_eq!(store.chunks_in_storage(), 4);

        // Free 2, then 3: freeing the tail peels both trailing free chunks.
        store.remove(2).expect("remove");
        assert_eq!(store.chunks_in_storage(), 4);
        store.remove(3).expect("remove");
        assert_eq!(store.chunks_in_storage(), 2);
    }

    #[test]
    fn removing_everything_empties_the_container() {
        let store = plain_store(16);
        for fill in 0..3_u8 {
            store.add(&[fill; 16]).expect("add");
        }
        store.remove(0).expect("remove");
        store.remove(1).expect("remove");
        store.remove(2).expect("remove");
        assert_eq!(store.chunks_in_storage(), 0);
        assert_eq!(store.add(&[9_u8; 16]).expect("add"), 0);
    }

    #[test]
    fn out_of_bounds_access_raises_the_emergency_flag() {
        let emergency = Arc::new(Emergency::new());
        let store = ChunkStore::new(
            Container::memory(),
            Container::memory(),
            16,
            None,
            false,
            Arc::clone(&emergency),
        )
        .expect("store");
        let mut buf = [0_u8; 16];
        assert!(matches!(
            store.read(5, &mut buf),
            Err(HexfsError::Unrecoverable)
        ));
        assert!(emergency.is_raised());
    }

    #[test]
    fn freed_plain_chunk_reads_as_integrity_error() {
        let store = plain_store(16);
        store.add(&[1_u8; 16]).expect("add");
        store.add(&[2_u8; 16]).expect("add");
        store.remove(0).expect("remove");
        let mut buf = [0_u8; 16];
        assert!(matches!(
            store.read(0, &mut buf),
            Err(HexfsError::Integrity { index: 0, .. })
        ));
    }

    #[test]
    fn freed_sealed_chunk_reads_as_zeros() {
        let key = [7_u8; 32];
        let store = sealed_store(16, &key);
        store.add(&[1_u8; 16]).expect("add");
        store.add(&[2_u8; 16]).expect("add");
        store.remove(0).expect("remove");
        let mut buf = [0xEE_u8; 16];
        store.read(0, &mut buf).expect("read");
        assert_eq!(buf, [0_u8; 16]);
    }

    #[test]
    fn sealed_round_trip() {
        let key = [42_u8; 32];
        let store = sealed_store(32, &key);
        let index = store.add(&[0x11_u8; 32]).expect("add");
        assert_eq!(store.stored_chunk_size(), 32 + SEAL_OVERHEAD as u64);
        let mut buf = [0_u8; 32];
        store.read(index, &mut buf).expect("read");
        assert_eq!(buf, [0x11_u8; 32]);
    }

    #[test]
    fn sealer_zero_marker_decodes_to_zero_payload() {
        let sealer = Sealer::new(&[3_u8; 32]);
        let sealed = vec![0_u8; 16 + SEAL_OVERHEAD];
        let mut payload = [0xFF_u8; 16];
        sealer.open(&sealed, &mut payload).expect("zero marker");
        assert_eq!(payload, [0_u8; 16]);
    }

    #[test]
    fn tampered_chunk_fails_authentication() {
        let dir = tempfile::tempdir().expect("tempdir");
        let map_path = dir.path().join("map.6fs");
        let dat_path = dir.path().join("dat.6fs");
        let key = [9_u8; 32];

        let store = ChunkStore::new(
            Container::file(&map_path).expect("map"),
            Container::file(&dat_path).expect("dat"),
            16,
            Some(Sealer::new(&key)),
            false,
            Arc::new(Emergency::new()),
        )
        .expect("store");
        let index = store.add(&[0x55_u8; 16]).expect("add");
        store.close().expect("close");
        drop(store);

        // Flip one ciphertext byte on disk.
        let mut raw = std::fs::read(&dat_path).expect("read file");
        let victim = SEAL_OVERHEAD; // first payload byte of chunk 0
        raw[victim] ^= 0x01;
        std::fs::write(&dat_path, &raw).expect("write file");

        let reopened = ChunkStore::new(
            Container::file(&map_path).expect("map"),
            Container::file(&dat_path).expect("dat"),
            16,
            Some(Sealer::new(&key)),
            false,
            Arc::new(Emergency::new()),
        )
        .expect("store");
        let mut buf = [0_u8; 16];
        let err = reopened.read(index, &mut buf).expect_err("tamper");
        assert_eq!(err.to_errno(), libc::EIO);
    }
}
