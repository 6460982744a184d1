//! Host containers for HexFS.
//!
//! A [`Container`] is a byte-addressed blob that grows and shrinks on
//! demand, with a chunk-oriented layer on top (all six HexFS container
//! files are arrays of fixed-size chunks). Three interchangeable backends:
//!
//! - in-process memory (a byte vector; tests and throwaway mounts),
//! - a regular file (`pread`/`pwrite`, `ftruncate`, best-effort hole
//!   punching),
//! - a memory-mapped file (page-rounded mapping, remapped on growth; the
//!   on-disk size is restored to the logical size on close).
//!
//! Backends must tolerate concurrent reads and writes to disjoint ranges;
//! size changes are serialized by the owning chunk store.
//!
//! This is the only crate in the workspace that contains `unsafe` code: the
//! mmap calls and the `statvfs`/`sysinfo` probes used for capacity
//! reporting.

use hexfs_error::{HexfsError, Result};
use memmap2::{MmapMut, MmapOptions, RemapOptions};
use parking_lot::RwLock;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

// ── Capacity probes ─────────────────────────────────────────────────────────

/// Capacity and free space of the filesystem holding `path`.
#[allow(clippy::unnecessary_cast)]
fn statvfs_of(path: &Path) -> Result<(u64, u64)> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| HexfsError::InvalidArgument)?;
    let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: cpath is a valid NUL-terminated string and buf is a properly
    // sized out-parameter.
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut buf) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    let capacity = buf.f_blocks as u64 * buf.f_frsize as u64;
    let available = buf.f_bavail as u64 * buf.f_frsize as u64;
    Ok((capacity, available))
}

/// Total and free RAM, for the in-memory backend's capacity report.
#[allow(clippy::unnecessary_cast)]
fn meminfo() -> Result<(u64, u64)> {
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    // SAFETY: info is a properly sized out-parameter.
    let rc = unsafe { libc::sysinfo(&mut info) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    let unit = info.mem_unit as u64;
    Ok((info.totalram as u64 * unit, info.freeram as u64 * unit))
}

fn page_size() -> u64 {
    // SAFETY: sysconf with a valid name has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if sz <= 0 {
        4096
    } else {
        sz.unsigned_abs()
    }
}

fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?)
}

// ── Memory backend ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryBacking {
    bytes: RwLock<Vec<u8>>,
}

impl MemoryBacking {
    fn size_in_bytes(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let offset = usize::try_from(offset).map_err(|_| HexfsError::InvalidArgument)?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(HexfsError::InvalidArgument)?;
        if end > bytes.len() {
            return Err(HexfsError::from_errno(libc::EIO));
        }
        buf.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let offset = usize::try_from(offset).map_err(|_| HexfsError::InvalidArgument)?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(HexfsError::InvalidArgument)?;
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn set_size_bytes(&self, size: u64) -> Result<()> {
        let size = usize::try_from(size).map_err(|_| HexfsError::NoSpace)?;
        self.bytes.write().resize(size, 0);
        Ok(())
    }
}

// ── File backend ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct FileBacking {
    path: PathBuf,
    file: File,
}

impl FileBacking {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: open_rw(path)?,
        })
    }

    fn size_in_bytes(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_bytes(&self, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.file.read_at(buf, offset)?;
            if n == 0 {
                return Err(HexfsError::from_errno(libc::EIO));
            }
            let rest = buf;
            buf = &mut rest[n..];
            offset += n as u64;
        }
        Ok(())
    }

    fn write_bytes(&self, mut offset: u64, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.file.write_at(buf, offset)?;
            buf = &buf[n..];
            offset += n as u64;
        }
        Ok(())
    }

    fn punch_hole_bytes(&self, offset: u64, size: u64) {
        #[allow(clippy::cast_possible_wrap)]
        // SAFETY: plain fd-based syscall; the fd is owned by self.file.
        let rc = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                size as libc::off_t,
            )
        };
        if rc != 0 {
            // Not all filesystems support this; the bitmap already records
            // the chunk as free, so the structure stays valid.
            trace!(
                path = %self.path.display(),
                offset,
                size,
                "hole punch unsupported or failed; continuing"
            );
        }
    }

    fn set_size_bytes(&self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }
}

// ── Mmap backend ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct MmapState {
    file: Option<File>,
    map: Option<MmapMut>,
    /// Mapped length: logical size rounded up to the page size, at least one
    /// page.
    mapped_len: u64,
    /// Logical size in bytes; the file is truncated back to this on close.
    logical_size: u64,
}

#[derive(Debug)]
struct MmapBacking {
    path: PathBuf,
    page_size: u64,
    state: RwLock<MmapState>,
}

fn mapped_len_for(page_size: u64, size: u64) -> u64 {
    let mut len = size;
    if len % page_size != 0 {
        len = (len / page_size + 1) * page_size;
    }
    if len == 0 {
        len = page_size;
    }
    len
}

impl MmapBacking {
    fn open(path: &Path) -> Result<Self> {
        let file = open_rw(path)?;
        let logical_size = file.metadata()?.len();
        let page_size = page_size();
        let mapped_len = mapped_len_for(page_size, logical_size);
        file.set_len(mapped_len)?;
        let len = usize::try_from(mapped_len).map_err(|_| HexfsError::NoSpace)?;
        // SAFETY: the mapping is backed by a file we own exclusively for the
        // lifetime of this container; concurrent access goes through the
        // state lock.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self {
            path: path.to_path_buf(),
            page_size,
            state: RwLock::new(MmapState {
                file: Some(file),
                map: Some(map),
                mapped_len,
                logical_size,
            }),
        })
    }

    fn size_in_bytes(&self) -> u64 {
        self.state.read().logical_size
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let state = self.state.read();
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(HexfsError::InvalidArgument)?;
        if end > state.logical_size {
            return Err(HexfsError::from_errno(libc::EIO));
        }
        let map = state.map.as_ref().ok_or(HexfsError::BadContainer)?;
        let offset = usize::try_from(offset).map_err(|_| HexfsError::InvalidArgument)?;
        buf.copy_from_slice(&map[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(HexfsError::InvalidArgument)?;
        if end > state.logical_size {
            Self::resize_locked(&mut state, self.page_size, end)?;
        }
        let map = state.map.as_mut().ok_or(HexfsError::BadContainer)?;
        let offset = usize::try_from(offset).map_err(|_| HexfsError::InvalidArgument)?;
        map[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn set_size_bytes(&self, size: u64) -> Result<()> {
        let mut state = self.state.write();
        Self::resize_locked(&mut state, self.page_size, size)
    }

    fn resize_locked(state: &mut MmapState, page_size: u64, size: u64) -> Result<()> {
        let new_len = mapped_len_for(page_size, size);
        if new_len != state.mapped_len {
            let file = state.file.as_ref().ok_or(HexfsError::BadContainer)?;
            file.set_len(new_len)?;
            let map = state.map.as_mut().ok_or(HexfsError::BadContainer)?;
            let len = usize::try_from(new_len).map_err(|_| HexfsError::NoSpace)?;
            // SAFETY: remap of our exclusively owned mapping; the state lock
            // is held, so no reader observes the move.
            unsafe { map.remap(len, RemapOptions::new().may_move(true))? };
            state.mapped_len = new_len;
        }
        state.logical_size = size;
        Ok(())
    }

    /// Unmap and restore the on-disk file to its logical size.
    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        state.map = None;
        if let Some(file) = state.file.take() {
            file.set_len(state.logical_size)?;
        }
        Ok(())
    }
}

// ── Container ───────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Backing {
    Memory(MemoryBacking),
    File(FileBacking),
    Mmap(MmapBacking),
}

/// A growable, shrinkable host-side blob carrying fixed-size chunks.
///
/// The chunk size defaults to 1 (pure byte addressing) and is set once by
/// the owning store before any chunk I/O.
#[derive(Debug)]
pub struct Container {
    chunk_size: u64,
    backing: Backing,
    chunks_in: AtomicU64,
    chunks_out: AtomicU64,
    chunks_punched: AtomicU64,
}

impl Container {
    /// An in-process memory container.
    #[must_use]
    pub fn memory() -> Self {
        Self::new(Backing::Memory(MemoryBacking::default()))
    }

    /// A regular-file container at `path` (created if missing).
    pub fn file(path: &Path) -> Result<Self> {
        Ok(Self::new(Backing::File(FileBacking::open(path)?)))
    }

    /// A memory-mapped file container at `path` (created if missing).
    pub fn mmap(path: &Path) -> Result<Self> {
        Ok(Self::new(Backing::Mmap(MmapBacking::open(path)?)))
    }

    fn new(backing: Backing) -> Self {
        Self {
            chunk_size: 1,
            backing,
            chunks_in: AtomicU64::new(0),
            chunks_out: AtomicU64::new(0),
            chunks_punched: AtomicU64::new(0),
        }
    }

    pub fn set_chunk_size(&mut self, chunk_size: u64) {
        debug_assert!(chunk_size > 0);
        self.chunk_size = chunk_size;
    }

    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Capacity and free space of whatever hosts this container, for
    /// statvfs reporting.
    pub fn stat(&self) -> Result<(u64, u64)> {
        match &self.backing {
            Backing::Memory(_) => meminfo(),
            Backing::File(b) => statvfs_of(&b.path),
            Backing::Mmap(b) => statvfs_of(&b.path),
        }
    }

    pub fn size_in_bytes(&self) -> Result<u64> {
        match &self.backing {
            Backing::Memory(b) => Ok(b.size_in_bytes()),
            Backing::File(b) => b.size_in_bytes(),
            Backing::Mmap(b) => Ok(b.size_in_bytes()),
        }
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match &self.backing {
            Backing::Memory(b) => b.read_bytes(offset, buf),
            Backing::File(b) => b.read_bytes(offset, buf),
            Backing::Mmap(b) => b.read_bytes(offset, buf),
        }
    }

    fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<()> {
        match &self.backing {
            Backing::Memory(b) => b.write_bytes(offset, buf),
            Backing::File(b) => b.write_bytes(offset, buf),
            Backing::Mmap(b) => b.write_bytes(offset, buf),
        }
    }

    fn set_size_bytes(&self, size: u64) -> Result<()> {
        match &self.backing {
            Backing::Memory(b) => b.set_size_bytes(size),
            Backing::File(b) => b.set_size_bytes(size),
            Backing::Mmap(b) => b.set_size_bytes(size),
        }
    }

    /// Number of whole chunks currently in the container.
    pub fn size(&self) -> Result<u64> {
        Ok(self.size_in_bytes()? / self.chunk_size)
    }

    /// Read `count` chunks starting at chunk `index` into `buf`.
    pub fn read(&self, index: u64, count: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, count * self.chunk_size);
        self.read_bytes(index * self.chunk_size, buf)?;
        self.chunks_in.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    /// Write `count` chunks starting at chunk `index`, growing on demand.
    pub fn write(&self, index: u64, count: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, count * self.chunk_size);
        self.write_bytes(index * self.chunk_size, buf)?;
        self.chunks_out.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    /// Punch a hole covering `count` chunks at chunk `index`. Failure is
    /// silently swallowed; backends that cannot punch do nothing.
    pub fn punch_hole(&self, index: u64, count: u64) {
        if let Backing::File(b) = &self.backing {
            b.punch_hole_bytes(index * self.chunk_size, count * self.chunk_size);
        }
        self.chunks_punched.fetch_add(count, Ordering::Relaxed);
    }

    /// Truncate or extend the container to exactly `chunks` chunks.
    pub fn set_size(&self, chunks: u64) -> Result<()> {
        self.set_size_bytes(chunks * self.chunk_size)
    }

    /// Finalize the container. Only the mmap backend has real work to do
    /// here: the on-disk file is truncated from the page-rounded mapping
    /// length back to the logical size.
    pub fn close(&self) -> Result<()> {
        match &self.backing {
            Backing::Mmap(b) => b.close(),
            Backing::Memory(_) | Backing::File(_) => Ok(()),
        }
    }

    #[must_use]
    pub fn chunks_in(&self) -> u64 {
        self.chunks_in.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn chunks_out(&self) -> u64 {
        self.chunks_out.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn chunks_punched(&self) -> u64 {
        self.chunks_punched.load(Ordering::Relaxed)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(mut c: Container, chunk_size: u64) -> Container {
        c.set_chunk_size(chunk_size);
        c
    }

    #[test]
    fn memory_grows_on_write() {
        let c = chunked(Container::memory(), 8);
        assert_eq!(c.size().expect("size"), 0);
        c.write(3, 1, &[7_u8; 8]).expect("write");
        assert_eq!(c.size().expect("size"), 4);
        let mut buf = [0_u8; 8];
        c.read(3, 1, &mut buf).expect("read");
        assert_eq!(buf, [7_u8; 8]);
        // The gap created by the sparse write reads as zeros.
        c.read(0, 1, &mut buf).expect("read");
        assert_eq!(buf, [0_u8; 8]);
    }

    #[test]
    fn memory_read_past_end_fails() {
        let c = chunked(Container::memory(), 8);
        let mut buf = [0_u8; 8];
        assert!(c.read(0, 1, &mut buf).is_err());
    }

    #[test]
    fn memory_set_size_shrinks_and_extends() {
        let c = chunked(Container::memory(), 8);
        c.write(0, 2, &[1_u8; 16]).expect("write");
        c.set_size(1).expect("shrink");
        assert_eq!(c.size().expect("size"), 1);
        c.set_size(3).expect("extend");
        let mut buf = [0xAA_u8; 8];
        c.read(2, 1, &mut buf).expect("read");
        assert_eq!(buf, [0_u8; 8]);
    }

    #[test]
    fn transfer_counters_accumulate() {
        let c = chunked(Container::memory(), 4);
        c.write(0, 2, &[0_u8; 8]).expect("write");
        let mut buf = [0_u8; 4];
        c.read(0, 1, &mut buf).expect("read");
        c.punch_hole(0, 1);
        assert_eq!(c.chunks_out(), 2);
        assert_eq!(c.chunks_in(), 1);
        assert_eq!(c.chunks_punched(), 1);
    }

    #[test]
    fn file_backend_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.bin");
        let c = chunked(Container::file(&path).expect("open"), 16);
        c.write(0, 1, &[0x5A_u8; 16]).expect("write");
        c.write(2, 1, &[0xA5_u8; 16]).expect("write");
        assert_eq!(c.size().expect("size"), 3);

        let mut buf = [0_u8; 16];
        c.read(2, 1, &mut buf).expect("read");
        assert_eq!(buf, [0xA5_u8; 16]);
        // Hole punching must not fail even where unsupported.
        c.punch_hole(0, 1);
        c.close().expect("close");

        // Reopen and confirm persistence.
        let c2 = chunked(Container::file(&path).expect("reopen"), 16);
        let mut buf = [0_u8; 16];
        c2.read(2, 1, &mut buf).expect("read");
        assert_eq!(buf, [0xA5_u8; 16]);
    }

    #[test]
    fn file_backend_shrinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.bin");
        let c = chunked(Container::file(&path).expect("open"), 8);
        c.write(0, 4, &[1_u8; 32]).expect("write");
        c.set_size(1).expect("shrink");
        assert_eq!(c.size().expect("size"), 1);
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), 8);
    }

    #[test]
    fn mmap_backend_round_trip_and_close_resets_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.bin");
        let c = chunked(Container::mmap(&path).expect("open"), 8);
        c.write(0, 1, &[3_u8; 8]).expect("write");
        c.write(100, 1, &[9_u8; 8]).expect("write far");
        assert_eq!(c.size().expect("size"), 101);

        let mut buf = [0_u8; 8];
        c.read(100, 1, &mut buf).expect("read");
        assert_eq!(buf, [9_u8; 8]);

        // While mapped, the file is page-rounded; close restores it.
        c.close().expect("close");
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), 101 * 8);

        let c2 = chunked(Container::mmap(&path).expect("reopen"), 8);
        let mut buf = [0_u8; 8];
        c2.read(100, 1, &mut buf).expect("read");
        assert_eq!(buf, [9_u8; 8]);
        c2.close().expect("close");
    }

    #[test]
    fn mmap_read_beyond_logical_size_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.bin");
        let c = chunked(Container::mmap(&path).expect("open"), 8);
        c.write(0, 1, &[1_u8; 8]).expect("write");
        let mut buf = [0_u8; 8];
        // Chunk 1 is inside the page-rounded mapping but past the logical
        // size; it must not be readable.
        assert!(c.read(1, 1, &mut buf).is_err());
        c.close().expect("close");
    }

    #[test]
    fn stat_reports_nonzero_capacity() {
        let c = Container::memory();
        let (capacity, _free) = c.stat().expect("stat");
        assert!(capacity > 0);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.bin");
        let c = Container::file(&path).expect("open");
        let (capacity, _free) = c.stat().expect("stat");
        assert!(capacity > 0);
    }
}
