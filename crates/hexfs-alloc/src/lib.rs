#![forbid(unsafe_code)]
//! Slot allocation bitmaps.
//!
//! A [`Bitmap`] tracks which fixed-size slots of a companion entity
//! container are live: bit `i` is 1 iff chunk `i` is allocated. The bitmap
//! is itself persisted in a dedicated [`Container`] whose chunk size is
//! 8 bytes (one `u64` holds 64 bits).
//!
//! Exactly one 64-bit chunk is cached at any time. All access goes through
//! that cache; switching chunks syncs the old one first. A
//! `first_zero_candidate` cursor makes allocation scans start where the
//! previous one left off instead of at bit 0.

use hexfs_error::{Emergency, EmergencyKind, HexfsError, Result};
use hexfs_store::Container;
use std::sync::Arc;
use tracing::error;

const BITS_PER_CHUNK: u64 = 64;
const NO_CHUNK: u64 = u64::MAX;

fn chunk_of(index: u64) -> u64 {
    index / BITS_PER_CHUNK
}

fn bit_of(index: u64) -> u64 {
    index % BITS_PER_CHUNK
}

/// A persistent bitmap over a dedicated 8-byte-chunk container.
#[derive(Debug)]
pub struct Bitmap {
    store: Container,
    emergency: Arc<Emergency>,
    chunks_in_store: u64,
    current: u64,
    current_index: u64,
    modified: bool,
    first_zero_candidate: u64,
}

impl Bitmap {
    /// Wrap `store` (its chunk size is forced to 8 bytes) and load the
    /// first bit chunk, creating it if the container is empty.
    pub fn new(mut store: Container, emergency: Arc<Emergency>) -> Result<Self> {
        store.set_chunk_size(8);
        let mut bitmap = Self {
            store,
            emergency,
            chunks_in_store: 0,
            current: 0,
            current_index: NO_CHUNK,
            modified: false,
            first_zero_candidate: 0,
        };
        bitmap.chunks_in_store = bitmap.store.size()?;
        if bitmap.chunks_in_store == 0 {
            bitmap.current = 0;
            bitmap.chunks_in_store = 1;
            bitmap.store.set_size(1)?;
        } else {
            bitmap.current = bitmap.read_chunk(0)?;
        }
        bitmap.current_index = 0;
        Ok(bitmap)
    }

    fn read_chunk(&self, chunk_index: u64) -> Result<u64> {
        let mut buf = [0_u8; 8];
        self.store.read(chunk_index, 1, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_chunk(&self, chunk_index: u64, value: u64) -> Result<()> {
        self.store.write(chunk_index, 1, &value.to_le_bytes())
    }

    /// Make `chunk_index` the cached chunk, syncing the old one first.
    /// Chunks beyond the stored tail materialize as zero.
    fn switch_to_chunk(&mut self, chunk_index: u64) -> Result<()> {
        if chunk_index == self.current_index {
            return Ok(());
        }
        self.sync()?;
        if chunk_index >= self.chunks_in_store {
            self.current = 0;
            self.chunks_in_store = chunk_index + 1;
            self.store.set_size(self.chunks_in_store)?;
        } else {
            self.current = self.read_chunk(chunk_index)?;
        }
        self.current_index = chunk_index;
        Ok(())
    }

    /// The lowest index whose bit is 0.
    ///
    /// Scans forward from the candidate cursor one chunk at a time; inside a
    /// chunk the first zero is the number of trailing ones, i.e. the
    /// trailing zeros of the complement.
    pub fn first_zero(&mut self) -> Result<u64> {
        let mut chunk_index = chunk_of(self.first_zero_candidate);
        let bit_index = loop {
            self.switch_to_chunk(chunk_index)?;
            if self.current != u64::MAX {
                break u64::from((!self.current).trailing_zeros());
            }
            chunk_index += 1;
        };
        self.first_zero_candidate = chunk_index * BITS_PER_CHUNK + bit_index;
        Ok(self.first_zero_candidate)
    }

    /// Set or clear bit `index`, maintaining the allocation cursor: a clear
    /// below the candidate lowers it, a set at the candidate advances it.
    pub fn set(&mut self, index: u64, value: bool) -> Result<()> {
        self.switch_to_chunk(chunk_of(index))?;
        let previous = self.current;
        let mask = 1_u64 << bit_of(index);
        if value {
            self.current |= mask;
            if index == self.first_zero_candidate {
                self.first_zero_candidate += 1;
            }
        } else {
            self.current &= !mask;
            if index < self.first_zero_candidate {
                self.first_zero_candidate = index;
            }
        }
        self.modified |= previous != self.current;
        Ok(())
    }

    pub fn set_one(&mut self, index: u64) -> Result<()> {
        self.set(index, true)
    }

    pub fn set_zero(&mut self, index: u64) -> Result<()> {
        self.set(index, false)
    }

    /// Read bit `index` through the chunk cache.
    pub fn get(&mut self, index: u64) -> Result<bool> {
        self.switch_to_chunk(chunk_of(index))?;
        Ok(self.current & (1_u64 << bit_of(index)) != 0)
    }

    /// Read bit `index` without disturbing the chunk cache. Bits beyond the
    /// stored tail are 0. Used by shared-lock read paths that must not
    /// mutate allocator state.
    pub fn peek(&self, index: u64) -> Result<bool> {
        let chunk_index = chunk_of(index);
        let chunk = if chunk_index == self.current_index {
            self.current
        } else if chunk_index >= self.chunks_in_store {
            0
        } else {
            self.read_chunk(chunk_index)?
        };
        Ok(chunk & (1_u64 << bit_of(index)) != 0)
    }

    /// Write the cached chunk back if dirty, then trim trailing all-zero
    /// chunks off the container tail, always leaving at least one chunk.
    pub fn sync(&mut self) -> Result<()> {
        if self.current_index >= self.chunks_in_store {
            error!(
                chunk = self.current_index,
                stored = self.chunks_in_store,
                "bitmap cache points outside the container"
            );
            self.emergency.raise(EmergencyKind::Bug);
            return Err(HexfsError::Unrecoverable);
        }

        if self.modified {
            self.write_chunk(self.current_index, self.current)?;
            self.modified = false;
        }

        if self.current == 0 && self.current_index + 1 == self.chunks_in_store {
            let mut new_len = self.current_index.max(1);
            while new_len > 1 {
                if self.read_chunk(new_len - 1)? != 0 {
                    break;
                }
                new_len -= 1;
            }
            if new_len != self.chunks_in_store {
                self.store.set_size(new_len)?;
                self.chunks_in_store = new_len;
                self.current_index = new_len - 1;
                self.current = self.read_chunk(self.current_index)?;
            }
        }

        Ok(())
    }

    /// Bytes occupied by the bitmap container.
    #[must_use]
    pub fn storage_size_in_bytes(&self) -> u64 {
        self.chunks_in_store * 8
    }

    /// Transfer counters of the backing container: (chunks in, chunks out).
    #[must_use]
    pub fn transfer_counts(&self) -> (u64, u64) {
        (self.store.chunks_in(), self.store.chunks_out())
    }

    /// Finalize the backing container (mmap backends restore their on-disk
    /// size). Call after the last `sync`.
    pub fn close(&self) -> Result<()> {
        self.store.close()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Bitmap {
        Bitmap::new(Container::memory(), Arc::new(Emergency::new())).expect("bitmap")
    }

    #[test]
    fn empty_bitmap_allocates_from_zero() {
        let mut bitmap = fresh();
        assert_eq!(bitmap.first_zero().expect("first_zero"), 0);
        bitmap.set_one(0).expect("set");
        assert_eq!(bitmap.first_zero().expect("first_zero"), 1);
    }

    #[test]
    fn set_and_get_round_trip() {
        let mut bitmap = fresh();
        for index in [0_u64, 1, 63, 64, 65, 1000] {
            assert!(!bitmap.get(index).expect("get"));
            bitmap.set_one(index).expect("set");
            assert!(bitmap.get(index).expect("get"));
        }
        bitmap.set_zero(64).expect("clear");
        assert!(!bitmap.get(64).expect("get"));
        assert!(bitmap.get(65).expect("get"));
    }

    #[test]
    fn candidate_lowers_on_clear_below() {
        let mut bitmap = fresh();
        for index in 0..10 {
            bitmap.set_one(index).expect("set");
        }
        assert_eq!(bitmap.first_zero().expect("first_zero"), 10);
        bitmap.set_zero(3).expect("clear");
        assert_eq!(bitmap.first_zero().expect("first_zero"), 3);
        bitmap.set_one(3).expect("set");
        assert_eq!(bitmap.first_zero().expect("first_zero"), 10);
    }

    #[test]
    fn first_zero_crosses_full_chunks() {
        let mut bitmap = fresh();
        for index in 0..130 {
            bitmap.set_one(index).expect("set");
        }
        assert_eq!(bitmap.first_zero().expect("first_zero"), 130);
    }

    #[test]
    fn peek_does_not_move_the_cache() {
        let mut bitmap = fresh();
        bitmap.set_one(0).expect("set");
        bitmap.set_one(200).expect("set far"); // cache is now on chunk 3
        bitmap.sync().expect("sync");
        assert!(bitmap.peek(0).expect("peek"));
        assert!(!bitmap.peek(1).expect("peek"));
        assert!(bitmap.peek(200).expect("peek"));
        // Way past the tail: implicitly free.
        assert!(!bitmap.peek(1 << 20).expect("peek"));
    }

    #[test]
    fn sync_trims_trailing_zero_chunks() {
        let mut bitmap = fresh();
        bitmap.set_one(5 * 64).expect("set"); // grows to 6 chunks
        bitmap.sync().expect("sync");
        assert_eq!(bitmap.storage_size_in_bytes(), 6 * 8);

        bitmap.set_zero(5 * 64).expect("clear");
        bitmap.sync().expect("sync");
        // All chunks empty: one chunk remains.
        assert_eq!(bitmap.storage_size_in_bytes(), 8);
        assert_eq!(bitmap.first_zero().expect("first_zero"), 0);
    }

    #[test]
    fn sync_trim_stops_at_live_chunk() {
        let mut bitmap = fresh();
        bitmap.set_one(70).expect("set"); // chunk 1
        bitmap.set_one(300).expect("set"); // chunk 4
        bitmap.set_zero(300).expect("clear");
        bitmap.sync().expect("sync");
        assert_eq!(bitmap.storage_size_in_bytes(), 2 * 8);
        assert!(bitmap.get(70).expect("get"));
    }

    #[test]
    fn state_survives_reopen_on_file_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("map.6fs");
        let emergency = Arc::new(Emergency::new());

        let mut bitmap =
            Bitmap::new(Container::file(&path).expect("open"), Arc::clone(&emergency))
                .expect("bitmap");
        bitmap.set_one(2).expect("set");
        bitmap.set_one(64).expect("set");
        bitmap.sync().expect("sync");
        drop(bitmap);

        let mut reopened =
            Bitmap::new(Container::file(&path).expect("reopen"), emergency).expect("bitmap");
        assert!(reopened.get(2).expect("get"));
        assert!(!reopened.get(3).expect("get"));
        assert!(reopened.get(64).expect("get"));
        assert_eq!(reopened.first_zero().expect("first_zero"), 0);
    }
}
