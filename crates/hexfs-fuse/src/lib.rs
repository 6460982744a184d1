#![forbid(unsafe_code)]
//! FUSE adapter for HexFS.
//!
//! A thin translation layer: kernel requests arrive via the `fuser` crate,
//! get forwarded to the [`Filesystem`] core, and errors are mapped through
//! `HexfsError::to_errno()`. The kernel's root inode is 1 while the core's
//! is 0, so inode numbers are shifted by one at this boundary. Open files
//! and directory streams live in an fh table owned by the adapter.

use fuser::{
    FileAttr, FileType, Filesystem as FuseFilesystem, KernelConfig, MountOption, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyDirectoryPlus, ReplyEmpty, ReplyEntry,
    ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use hexfs_core::{
    FallocateMode, FileHandle, Filesystem, Owner, RenameMode, SeekWhence, XattrSetMode,
};
use hexfs_error::HexfsError;
use hexfs_error::Result as HexResult;
use hexfs_types::{FileKind, Inode, Time};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

/// TTL for cached attributes and entries. The namespace is writable, so
/// keep it short.
const ATTR_TTL: Duration = Duration::from_secs(1);

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

// ── Conversions ─────────────────────────────────────────────────────────────

fn to_ino(index: u64) -> u64 {
    index + 1
}

fn to_index(ino: u64) -> u64 {
    ino - 1
}

fn to_fuser_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Regular => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::Fifo => FileType::NamedPipe,
        FileKind::Socket => FileType::Socket,
    }
}

fn to_system_time(t: Time) -> SystemTime {
    if t.seconds >= 0 {
        UNIX_EPOCH + Duration::new(t.seconds.unsigned_abs(), t.nanoseconds)
    } else {
        UNIX_EPOCH - Duration::new(t.seconds.unsigned_abs(), 0)
            + Duration::from_nanos(u64::from(t.nanoseconds))
    }
}

fn to_time(t: SystemTime) -> Time {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => Time {
            seconds: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            nanoseconds: d.subsec_nanos(),
        },
        Err(e) => Time {
            seconds: -i64::try_from(e.duration().as_secs()).unwrap_or(i64::MAX),
            nanoseconds: e.duration().subsec_nanos(),
        },
    }
}

fn time_or_now(t: TimeOrNow) -> Time {
    match t {
        TimeOrNow::SpecificTime(t) => to_time(t),
        TimeOrNow::Now => Time::now(),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_file_attr(index: u64, inode: &Inode) -> FileAttr {
    FileAttr {
        ino: to_ino(index),
        size: inode.size,
        blocks: inode.size / 512,
        atime: to_system_time(inode.atime),
        mtime: to_system_time(inode.mtime),
        ctime: to_system_time(inode.ctime),
        crtime: to_system_time(inode.ctime),
        kind: inode
            .kind()
            .map_or(FileType::RegularFile, to_fuser_file_type),
        perm: inode.type_and_mode & 0o7777,
        nlink: inode.nlink.min(u64::from(u32::MAX)) as u32,
        uid: inode.uid,
        gid: inode.gid,
        rdev: inode.rdev.min(u64::from(u32::MAX)) as u32,
        blksize: 4096,
        flags: 0,
    }
}

fn owner_of(req: &Request<'_>) -> Owner {
    Owner {
        uid: req.uid(),
        gid: req.gid(),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn node_mode(mode: u32, umask: u32) -> u16 {
    (mode & !(umask & 0o7777)) as u16
}

#[allow(clippy::unnecessary_cast)]
fn rename_mode(flags: u32) -> Option<RenameMode> {
    match flags {
        0 => Some(RenameMode::Normal),
        f if f == libc::RENAME_NOREPLACE as u32 => Some(RenameMode::NoReplace),
        f if f == libc::RENAME_EXCHANGE as u32 => Some(RenameMode::Exchange),
        _ => None,
    }
}

fn fallocate_mode(mode: i32) -> Option<FallocateMode> {
    match mode {
        0 => Some(FallocateMode::Allocate { keep_size: false }),
        m if m == libc::FALLOC_FL_KEEP_SIZE => Some(FallocateMode::Allocate { keep_size: true }),
        m if m == libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE => {
            Some(FallocateMode::PunchHole)
        }
        m if m == libc::FALLOC_FL_ZERO_RANGE => Some(FallocateMode::ZeroRange { keep_size: false }),
        m if m == libc::FALLOC_FL_ZERO_RANGE | libc::FALLOC_FL_KEEP_SIZE => {
            Some(FallocateMode::ZeroRange { keep_size: true })
        }
        m if m == libc::FALLOC_FL_COLLAPSE_RANGE => Some(FallocateMode::CollapseRange),
        m if m == libc::FALLOC_FL_INSERT_RANGE => Some(FallocateMode::InsertRange),
        _ => None,
    }
}

fn xattr_set_mode(flags: i32) -> Option<XattrSetMode> {
    match flags {
        0 => Some(XattrSetMode::Upsert),
        f if f == libc::XATTR_CREATE => Some(XattrSetMode::Create),
        f if f == libc::XATTR_REPLACE => Some(XattrSetMode::Replace),
        _ => None,
    }
}

// ── The adapter ─────────────────────────────────────────────────────────────

/// FUSE adapter holding the core filesystem and the open-handle table.
pub struct HexFuse {
    fs: Arc<Filesystem>,
    handles: Mutex<HashMap<u64, FileHandle>>,
    next_fh: AtomicU64,
}

impl HexFuse {
    #[must_use]
    pub fn new(fs: Arc<Filesystem>) -> Self {
        Self {
            fs,
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn stash(&self, handle: FileHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fh, handle);
        fh
    }

    fn close_fh(&self, fh: u64) -> HexResult<()> {
        let Some(handle) = self.handles.lock().remove(&fh) else {
            return Err(HexfsError::InvalidArgument);
        };
        self.fs.close(handle)
    }

    /// Run `f` with the open handle behind `fh`, or fail with `EBADF`-like
    /// behavior when the kernel hands us an fh we never issued.
    fn with_fh<T>(&self, fh: u64, f: impl FnOnce(&FileHandle) -> HexResult<T>) -> HexResult<T> {
        let handles = self.handles.lock();
        let handle = handles.get(&fh).ok_or(HexfsError::InvalidArgument)?;
        f(handle)
    }

    fn entry_reply(result: HexResult<(u64, Inode)>, reply: ReplyEntry) {
        match result {
            Ok((index, inode)) => reply.entry(&ATTR_TTL, &to_file_attr(index, &inode), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn empty_reply(result: HexResult<()>, reply: ReplyEmpty) {
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn apply_setattr(
        &self,
        index: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
    ) -> HexResult<Inode> {
        #[allow(clippy::cast_possible_truncation)]
        if let Some(mode) = mode {
            self.fs.chmod_at(index, mode as u16)?;
        }
        if uid.is_some() || gid.is_some() {
            let current = self.fs.getattr_at(index)?;
            self.fs.chown_at(
                index,
                uid.unwrap_or(current.uid),
                gid.unwrap_or(current.gid),
            )?;
        }
        if let Some(size) = size {
            self.fs.truncate_at(index, size)?;
        }
        if atime.is_some() || mtime.is_some() || ctime.is_some() {
            self.fs.utimens_at(
                index,
                atime.map(time_or_now),
                mtime.map(time_or_now),
                ctime.map(to_time),
            )?;
        }
        self.fs.getattr_at(index)
    }
}

impl FuseFilesystem for HexFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {}

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.fs.lookup(to_index(parent), name.as_bytes());
        if let Err(e) = &result {
            // Missing entries are routine; anything else deserves a line.
            if e.to_errno() != libc::ENOENT {
                warn!(parent, ?name, error = %e, "lookup failed");
            }
        }
        Self::entry_reply(result, reply);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let index = to_index(ino);
        let result = match fh {
            Some(fh) => self.with_fh(fh, |handle| Ok(self.fs.getattr_handle(handle))),
            None => self.fs.getattr_at(index),
        };
        match result {
            Ok(inode) => reply.attr(&ATTR_TTL, &to_file_attr(index, &inode)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let index = to_index(ino);
        match self.apply_setattr(index, mode, uid, gid, size, atime, mtime, ctime) {
            Ok(inode) => reply.attr(&ATTR_TTL, &to_file_attr(index, &inode)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.fs.readlink_at(to_index(ino)) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.fs.mknod_at(
            to_index(parent),
            name.as_bytes(),
            node_mode(mode, umask),
            u64::from(rdev),
            owner_of(req),
        );
        Self::entry_reply(result, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.fs.mkdir_at(
            to_index(parent),
            name.as_bytes(),
            node_mode(mode, umask),
            owner_of(req),
        );
        Self::entry_reply(result, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        Self::empty_reply(self.fs.unlink_at(to_index(parent), name.as_bytes()), reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        Self::empty_reply(self.fs.rmdir_at(to_index(parent), name.as_bytes()), reply);
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.fs.symlink_at(
            to_index(parent),
            link_name.as_bytes(),
            target.as_os_str().as_bytes(),
            owner_of(req),
        );
        Self::entry_reply(result, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let Some(mode) = rename_mode(flags) else {
            reply.error(libc::EINVAL);
            return;
        };
        Self::empty_reply(
            self.fs.rename_at(
                to_index(parent),
                name.as_bytes(),
                to_index(newparent),
                newname.as_bytes(),
                mode,
            ),
            reply,
        );
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let index = to_index(ino);
        let result = self
            .fs
            .link_at(index, to_index(newparent), newname.as_bytes())
            .map(|inode| (index, inode));
        Self::entry_reply(result, reply);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let read_only = flags & libc::O_ACCMODE == libc::O_RDONLY;
        let trunc = flags & libc::O_TRUNC != 0;
        let append = flags & libc::O_APPEND != 0;
        match self.fs.open_at(to_index(ino), read_only, trunc, append) {
            Ok(handle) => reply.opened(self.stash(handle), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let read_only = flags & libc::O_ACCMODE == libc::O_RDONLY;
        let append = flags & libc::O_APPEND != 0;
        let result = self
            .fs
            .mknod_at(
                to_index(parent),
                name.as_bytes(),
                node_mode(mode, umask),
                0,
                owner_of(req),
            )
            .and_then(|(index, _)| {
                let handle = self.fs.open_at(index, read_only, false, append)?;
                let inode = self.fs.getattr_handle(&handle);
                Ok((index, inode, self.stash(handle)))
            });
        match result {
            Ok((index, inode, fh)) => {
                reply.created(&ATTR_TTL, &to_file_attr(index, &inode), 0, fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        #[allow(clippy::cast_sign_loss)]
        let result = self.with_fh(fh, |handle| {
            let mut buf = vec![0_u8; size as usize];
            let n = self.fs.read(handle, offset as u64, &mut buf)?;
            buf.truncate(n);
            Ok(buf)
        });
        match result {
            Ok(buf) => reply.data(&buf),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        #[allow(clippy::cast_sign_loss)]
        let result = self.with_fh(fh, |handle| self.fs.write(handle, offset as u64, data));
        match result {
            #[allow(clippy::cast_possible_truncation)]
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        Self::empty_reply(self.close_fh(fh), reply);
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.fs.opendir_at(to_index(ino)) {
            Ok(handle) => reply.opened(self.stash(handle), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        #[allow(clippy::cast_sign_loss)]
        let mut next = offset as u64;
        let result = self.with_fh(fh, |handle| {
            if next == 0 {
                if reply.add(ino, 1, FileType::Directory, ".") {
                    return Ok(());
                }
                next = 1;
            }
            if next == 1 {
                if reply.add(ino, 2, FileType::Directory, "..") {
                    return Ok(());
                }
                next = 2;
            }
            loop {
                let slot = next - 2;
                let Some((dirent, inode)) = self.fs.readdir_plus(handle, slot)? else {
                    return Ok(());
                };
                let kind = inode
                    .kind()
                    .map_or(FileType::RegularFile, to_fuser_file_type);
                #[allow(clippy::cast_possible_wrap)]
                let full = reply.add(
                    to_ino(dirent.inode_index),
                    (next + 1) as i64,
                    kind,
                    OsStr::from_bytes(dirent.name()),
                );
                if full {
                    return Ok(());
                }
                next += 1;
            }
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        #[allow(clippy::cast_sign_loss)]
        let mut next = offset as u64;
        let result = self.with_fh(fh, |handle| loop {
            let Some((dirent, inode)) = self.fs.readdir_plus(handle, next)? else {
                return Ok(());
            };
            #[allow(clippy::cast_possible_wrap)]
            let full = reply.add(
                to_ino(dirent.inode_index),
                (next + 1) as i64,
                OsStr::from_bytes(dirent.name()),
                &ATTR_TTL,
                &to_file_attr(dirent.inode_index, &inode),
                0,
            );
            if full {
                return Ok(());
            }
            next += 1;
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        Self::empty_reply(self.close_fh(fh), reply);
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statvfs() {
            #[allow(clippy::cast_possible_truncation)]
            Ok(report) => reply.statfs(
                report.max_block_count,
                report.free_block_count,
                report.free_block_count,
                report.max_inode_count,
                report.free_inode_count,
                report.block_size as u32,
                report.max_name_len as u32,
                report.block_size as u32,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(mode) = xattr_set_mode(flags) else {
            reply.error(libc::EINVAL);
            return;
        };
        Self::empty_reply(
            self.fs
                .xattr_set_at(to_index(ino), name.as_bytes(), value, mode),
            reply,
        );
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        match self.fs.xattr_get_at(to_index(ino), name.as_bytes()) {
            Ok(value) => {
                #[allow(clippy::cast_possible_truncation)]
                let needed = value.len() as u32;
                if size == 0 {
                    reply.size(needed);
                } else if needed > size {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&value);
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.fs.xattr_list_at(to_index(ino)) {
            Ok(names) => {
                #[allow(clippy::cast_possible_truncation)]
                let needed = names.len() as u32;
                if size == 0 {
                    reply.size(needed);
                } else if needed > size {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&names);
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        Self::empty_reply(self.fs.xattr_remove_at(to_index(ino), name.as_bytes()), reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        if offset < 0 || length <= 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let Some(mode) = fallocate_mode(mode) else {
            reply.error(libc::EOPNOTSUPP);
            return;
        };
        #[allow(clippy::cast_sign_loss)]
        let result = self.with_fh(fh, |handle| {
            self.fs
                .fallocate(handle, offset as u64, length as u64, mode)
        });
        Self::empty_reply(result, reply);
    }

    fn lseek(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let whence = match whence {
            libc::SEEK_DATA => SeekWhence::Data,
            libc::SEEK_HOLE => SeekWhence::Hole,
            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        #[allow(clippy::cast_sign_loss)]
        let result = self.with_fh(fh, |handle| self.fs.lseek(handle, offset as u64, whence));
        match result {
            #[allow(clippy::cast_possible_wrap)]
            Ok(position) => reply.offset(position as i64),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

// ── Mounting ────────────────────────────────────────────────────────────────

/// Mount `fs` at `mountpoint` and serve requests until unmounted. The core
/// filesystem is left mounted; callers run `Filesystem::unmount` afterwards.
pub fn mount(fs: Arc<Filesystem>, mountpoint: &Path, options: &MountOptions) -> Result<(), FuseError> {
    if !mountpoint.is_dir() {
        return Err(FuseError::InvalidMountpoint(
            mountpoint.display().to_string(),
        ));
    }
    let mut mount_options = vec![
        MountOption::FSName("hexfs".to_owned()),
        MountOption::DefaultPermissions,
    ];
    if options.allow_other {
        mount_options.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        mount_options.push(MountOption::AutoUnmount);
    }
    fuser::mount2(HexFuse::new(fs), mountpoint, &mount_options)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ino_mapping_is_shifted_by_one() {
        assert_eq!(to_ino(0), 1);
        assert_eq!(to_index(1), 0);
        assert_eq!(to_index(to_ino(41)), 41);
    }

    #[test]
    #[allow(clippy::unnecessary_cast)]
    fn rename_flags_map_to_modes() {
        assert_eq!(rename_mode(0), Some(RenameMode::Normal));
        assert_eq!(
            rename_mode(libc::RENAME_NOREPLACE as u32),
            Some(RenameMode::NoReplace)
        );
        assert_eq!(
            rename_mode(libc::RENAME_EXCHANGE as u32),
            Some(RenameMode::Exchange)
        );
        assert_eq!(
            rename_mode(libc::RENAME_NOREPLACE as u32 | libc::RENAME_EXCHANGE as u32),
            None
        );
    }

    #[test]
    fn fallocate_flag_combinations() {
        assert_eq!(
            fallocate_mode(0),
            Some(FallocateMode::Allocate { keep_size: false })
        );
        assert_eq!(
            fallocate_mode(libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE),
            Some(FallocateMode::PunchHole)
        );
        // Punching without KEEP_SIZE is not a thing.
        assert_eq!(fallocate_mode(libc::FALLOC_FL_PUNCH_HOLE), None);
        assert_eq!(
            fallocate_mode(libc::FALLOC_FL_COLLAPSE_RANGE),
            Some(FallocateMode::CollapseRange)
        );
    }

    #[test]
    fn mode_and_umask_combine() {
        assert_eq!(node_mode(0o100_666, 0o022), 0o100_644_u16 & 0o177_777);
        assert_eq!(node_mode(0o040_777, 0o077), 0o040_700);
    }
}
