//! Hole punching, preallocation, and sparse-region queries.
//!
//! A slot holding [`INVALID_INDEX`] is a hole and always reads as zeros,
//! no matter what the host container does with punched regions. The
//! operations here only move slots between the hole and materialized
//! states (plus in-place zeroing for partial edge blocks), so that
//! guarantee is carried end to end.

use crate::handle::{HandleState, InodeHandle};
use crate::store::Store;
use hexfs_error::{HexfsError, Result};
use hexfs_types::{Block, Time, BLOCK_SIZE, INVALID_INDEX, MAX_SLOT_COUNT};

/// The supported `fallocate` modes, mirroring the Linux flag combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallocateMode {
    /// Reserve the range. Without `keep_size` the file grows (sparsely) to
    /// cover it; with `keep_size` blocks inside the current size are
    /// materialized eagerly and the size is untouched.
    Allocate { keep_size: bool },
    /// Deallocate whole blocks in the range and zero the partial edges.
    /// The file size never changes (`KEEP_SIZE` is mandatory on Linux).
    PunchHole,
    /// Zero the range. Without `keep_size` the file may grow to cover it.
    ZeroRange { keep_size: bool },
    /// Remove the block-aligned range, shifting the tail left.
    CollapseRange,
    /// Open a block-aligned hole at `offset`, shifting the tail right.
    InsertRange,
}

/// Target of an `lseek` sparse query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Data,
    Hole,
}

const BLOCK_U64: u64 = BLOCK_SIZE as u64;

/// Zero `[from, to)` (block-internal offsets) of the block behind `slot`.
/// Holes already read as zero and are left alone.
fn zero_within_block(
    state: &mut HandleState,
    store: &Store,
    slot: u64,
    from: usize,
    to: usize,
) -> Result<bool> {
    if from >= to {
        return Ok(false);
    }
    let block_index = state.get_slot(store, slot)?;
    if block_index == INVALID_INDEX {
        return Ok(false);
    }
    let mut block = Block::zeroed();
    store.block_read(block_index, &mut block)?;
    block.zero_range(from, to);
    store.block_write(block_index, &block)?;
    Ok(true)
}

/// Turn every whole block inside `[from, to)` back into a hole and zero
/// the partial edges in place. Returns whether anything changed.
fn punch_range(state: &mut HandleState, store: &Store, from: u64, to: u64) -> Result<bool> {
    let to = to.min(state.inode.size);
    if from >= to {
        return Ok(false);
    }

    let mut changed = false;
    let first_slot = from / BLOCK_U64;
    let last_slot = (to - 1) / BLOCK_U64;

    if first_slot == last_slot {
        return zero_within_block(
            state,
            store,
            first_slot,
            (from % BLOCK_U64) as usize,
            ((to - 1) % BLOCK_U64) as usize + 1,
        );
    }

    if from % BLOCK_U64 != 0 {
        changed |= zero_within_block(
            state,
            store,
            first_slot,
            (from % BLOCK_U64) as usize,
            BLOCK_SIZE,
        )?;
    }

    let full_start = from.div_ceil(BLOCK_U64);
    let full_end = to / BLOCK_U64;
    for slot in full_start..full_end {
        let block_index = state.get_slot(store, slot)?;
        if block_index != INVALID_INDEX {
            state.set_slot(store, slot, INVALID_INDEX)?;
            store.block_remove(block_index)?;
            changed = true;
        }
    }

    if to % BLOCK_U64 != 0 {
        changed |= zero_within_block(state, store, last_slot, 0, (to % BLOCK_U64) as usize)?;
    }

    Ok(changed)
}

impl InodeHandle {
    /// Manipulate the allocation of `[offset, offset + length)`.
    pub(crate) fn fallocate(
        &self,
        store: &Store,
        offset: u64,
        length: u64,
        mode: FallocateMode,
    ) -> Result<()> {
        if length == 0 {
            return Err(HexfsError::InvalidArgument);
        }
        let end = offset
            .checked_add(length)
            .ok_or(HexfsError::InvalidArgument)?;

        let mut state = self.state_write();
        if !state.inode.is_regular() {
            return Err(HexfsError::InvalidArgument);
        }
        let orig_inode = state.inode;

        match mode {
            FallocateMode::Allocate { keep_size: false } => {
                if end > state.inode.size {
                    state.truncate_now(store, end)?;
                    let t = Time::now();
                    state.inode.mtime = t;
                    state.inode.ctime = t;
                }
            }
            FallocateMode::Allocate { keep_size: true } => {
                // Slots at or past the slot frontier must not be touched;
                // reservation beyond EOF is a no-op for this filesystem.
                if state.slot_count > 0 && offset < state.inode.size {
                    let first = offset / BLOCK_U64;
                    let last = ((end - 1) / BLOCK_U64).min(state.slot_count - 1);
                    for slot in first..=last {
                        if state.get_slot(store, slot)? == INVALID_INDEX {
                            let block_index = store.block_add(&Block::zeroed())?;
                            state.set_slot(store, slot, block_index)?;
                        }
                    }
                }
                if state.inode != orig_inode {
                    state.inode.ctime = Time::now();
                }
            }
            FallocateMode::PunchHole => {
                if punch_range(&mut state, store, offset, end)? {
                    let t = Time::now();
                    state.inode.mtime = t;
                    state.inode.ctime = t;
                }
            }
            FallocateMode::ZeroRange { keep_size } => {
                if !keep_size && end > state.inode.size {
                    state.truncate_now(store, end)?;
                }
                punch_range(&mut state, store, offset, end)?;
                let t = Time::now();
                state.inode.mtime = t;
                state.inode.ctime = t;
            }
            FallocateMode::CollapseRange => {
                if offset % BLOCK_U64 != 0 || length % BLOCK_U64 != 0 {
                    return Err(HexfsError::InvalidArgument);
                }
                if end >= state.inode.size {
                    return Err(HexfsError::InvalidArgument);
                }
                let first = offset / BLOCK_U64;
                for _ in 0..length / BLOCK_U64 {
                    state.remove_slot(store, first, true)?;
                }
                state.inode.size -= length;
                let t = Time::now();
                state.inode.mtime = t;
                state.inode.ctime = t;
            }
            FallocateMode::InsertRange => {
                if offset % BLOCK_U64 != 0 || length % BLOCK_U64 != 0 {
                    return Err(HexfsError::InvalidArgument);
                }
                if offset >= state.inode.size {
                    return Err(HexfsError::InvalidArgument);
                }
                let count = length / BLOCK_U64;
                if state.slot_count + count > MAX_SLOT_COUNT {
                    return Err(HexfsError::NoSpace);
                }
                let first = offset / BLOCK_U64;
                for _ in 0..count {
                    state.insert_slot(store, first, INVALID_INDEX)?;
                }
                state.inode.size += length;
                let t = Time::now();
                state.inode.mtime = t;
                state.inode.ctime = t;
            }
        }

        if state.inode != orig_inode {
            store.inode_write(self.index(), &state.inode)?;
        }
        Ok(())
    }

    /// Find the next data or hole position at or after `offset`.
    ///
    /// Holes exist at slot granularity (`INVALID_INDEX` slots) and, inside
    /// materialized blocks, at byte granularity: zero bytes count as hole,
    /// so a short write into a sparse block does not hide the zeros behind
    /// it. There is always an implicit hole at EOF.
    pub(crate) fn lseek(&self, store: &Store, offset: u64, whence: SeekWhence) -> Result<u64> {
        let mut state = self.state_write();
        if !state.inode.is_regular() {
            return Err(HexfsError::InvalidArgument);
        }
        let size = state.inode.size;

        match whence {
            SeekWhence::Data => {
                if offset >= size {
                    return Err(HexfsError::NoSeekTarget);
                }
                let mut block = Block::zeroed();
                for slot in offset / BLOCK_U64..state.slot_count {
                    let block_index = state.get_slot(store, slot)?;
                    if block_index == INVALID_INDEX {
                        continue;
                    }
                    store.block_read(block_index, &mut block)?;
                    let start = if slot == offset / BLOCK_U64 {
                        (offset % BLOCK_U64) as usize
                    } else {
                        0
                    };
                    let limit = BLOCK_SIZE.min((size - slot * BLOCK_U64) as usize);
                    if let Some(p) = block.as_bytes()[start..limit].iter().position(|b| *b != 0)
                    {
                        return Ok(slot * BLOCK_U64 + (start + p) as u64);
                    }
                }
                Err(HexfsError::NoSeekTarget)
            }
            SeekWhence::Hole => {
                if offset > size {
                    return Err(HexfsError::NoSeekTarget);
                }
                let mut block = Block::zeroed();
                for slot in offset / BLOCK_U64..state.slot_count {
                    let start = if slot == offset / BLOCK_U64 {
                        (offset % BLOCK_U64) as usize
                    } else {
                        0
                    };
                    let block_index = state.get_slot(store, slot)?;
                    if block_index == INVALID_INDEX {
                        return Ok(slot * BLOCK_U64 + start as u64);
                    }
                    store.block_read(block_index, &mut block)?;
                    let limit = BLOCK_SIZE.min((size - slot * BLOCK_U64) as usize);
                    if let Some(p) = block.as_bytes()[start..limit].iter().position(|b| *b == 0)
                    {
                        return Ok(slot * BLOCK_U64 + (start + p) as u64);
                    }
                }
                Ok(size)
            }
        }
    }
}
