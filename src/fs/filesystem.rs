//! FUSE filesystem implementation
//!
//! Translates inode-addressed kernel requests into path-addressed
//! [`CryptCore`] calls and core errors into errno replies.

use fuser::{
    FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request,
    TimeOrNow,
};
use libc::{c_int, ENOENT};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

use super::attr::FileAttributes;
use super::core::{CryptCore, TimeUpdate};
use super::inode::{InodeTable, ROOT_INO};
use crate::error::Error;

const TTL: Duration = Duration::from_secs(1);

/// Errno for a failed operation, logged unless it is a plain miss
fn errno(op: &str, err: Error) -> c_int {
    let code = err.errno();
    if code == ENOENT {
        debug!("{}: {}", op, err);
    } else {
        error!("{} failed: {}", op, err);
    }
    code
}

fn time_update(time: Option<TimeOrNow>) -> TimeUpdate {
    match time {
        None => TimeUpdate::Omit,
        Some(TimeOrNow::Now) => TimeUpdate::Now,
        Some(TimeOrNow::SpecificTime(t)) => TimeUpdate::At(t),
    }
}

/// Kernel lock range (inclusive end, `u64::MAX` = to EOF) as a flock
fn to_flock(start: u64, end: u64, typ: i32, pid: u32) -> libc::flock {
    let len = if end == u64::MAX {
        0
    } else {
        end.saturating_sub(start).saturating_add(1) as libc::off_t
    };
    libc::flock {
        l_type: typ as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: start as libc::off_t,
        l_len: len,
        l_pid: pid as libc::pid_t,
    }
}

/// (start, end, type, pid) of a flock as the kernel expects it
fn from_flock(lock: &libc::flock) -> (u64, u64, i32, u32) {
    let start = lock.l_start.max(0) as u64;
    let end = if lock.l_len <= 0 {
        u64::MAX
    } else {
        start + lock.l_len as u64 - 1
    };
    (start, end, lock.l_type as i32, lock.l_pid.max(0) as u32)
}

/// How to answer an xattr request of `size` for a value of `len` bytes
///
/// `Ok(Some(n))` replies with the size only, `Ok(None)` with the data.
fn xattr_fit(len: usize, size: u32) -> Result<Option<u32>, c_int> {
    if size == 0 {
        Ok(Some(len as u32))
    } else if len <= size as usize {
        Ok(None)
    } else {
        Err(libc::ERANGE)
    }
}

/// The mounted filesystem
pub struct CipherFs {
    core: CryptCore,
    inodes: InodeTable,
}

impl CipherFs {
    pub fn new(core: CryptCore) -> Self {
        Self {
            core,
            inodes: InodeTable::new(),
        }
    }

    pub fn core(&self) -> &CryptCore {
        &self.core
    }

    fn path(&self, ino: u64) -> Result<PathBuf, c_int> {
        self.inodes.path(ino).ok_or(ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<PathBuf, c_int> {
        self.inodes.child_path(parent, name).ok_or(ENOENT)
    }

    /// Stat a path and register it as looked up
    fn entry(&self, path: &Path) -> Result<fuser::FileAttr, c_int> {
        let attrs = self.core.getattr(path).map_err(|e| errno("getattr", e))?;
        let ino = self.inodes.lookup(path);
        Ok(attrs.to_fuser_attr(ino))
    }

    fn reply_entry(&self, path: &Path, reply: ReplyEntry) {
        match self.entry(path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    /// Directory entries of `path` (inode `ino`), including `.` and `..`
    fn listing(&self, ino: u64, path: &Path) -> Result<Vec<(u64, FileType, OsString)>, c_int> {
        let listing = self.core.readdir(path).map_err(|e| errno("readdir", e))?;

        let parent_ino = path
            .parent()
            .and_then(|p| self.inodes.ino(p))
            .unwrap_or(ROOT_INO);

        let mut entries = vec![
            (ino, FileType::Directory, ".".into()),
            (parent_ino, FileType::Directory, "..".into()),
        ];
        for entry in listing {
            // Names never looked up report their backing inode number
            let child = self.inodes.ino(&path.join(&entry.name)).unwrap_or(entry.ino);
            entries.push((child, entry.kind.to_fuser_type(), entry.name));
        }
        Ok(entries)
    }
}

impl Filesystem for CipherFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("serving {:?}", self.core.resolver().base());
        Ok(())
    }

    fn destroy(&mut self) {
        let failed = self.core.release_all();
        info!("unmounted ({} handles failed to release)", failed);
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.child(parent, name) {
            Ok(path) => self.reply_entry(&path, reply),
            Err(code) => reply.error(code),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        let result = self
            .path(ino)
            .and_then(|path| self.core.getattr(&path).map_err(|e| errno("getattr", e)));
        match result {
            Ok(attrs) => reply.attr(&TTL, &attrs.to_fuser_attr(ino)),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?}, fh={:?})",
            ino, mode, uid, gid, size, fh
        );

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(code) => {
                reply.error(code);
                return;
            }
        };

        let result = (|| -> crate::error::Result<FileAttributes> {
            if let Some(mode) = mode {
                self.core.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.core.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                match fh {
                    Some(fh) => self.core.ftruncate(fh, size)?,
                    None => self.core.truncate(&path, size)?,
                }
            }
            if atime.is_some() || mtime.is_some() {
                self.core
                    .utimens(&path, time_update(atime), time_update(mtime))?;
            }
            match fh {
                Some(fh) => self.core.fgetattr(fh),
                None => self.core.getattr(&path),
            }
        })();

        match result {
            Ok(attrs) => reply.attr(&TTL, &attrs.to_fuser_attr(ino)),
            Err(e) => reply.error(errno("setattr", e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        let result = self
            .path(ino)
            .and_then(|path| self.core.readlink(&path).map_err(|e| errno("readlink", e)));
        match result {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(code) => reply.error(code),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:#o})", parent, name, mode);

        let result = self.child(parent, name).and_then(|path| {
            self.core
                .mknod(&path, mode & !(umask & 0o7777), rdev as u64)
                .map_err(|e| errno("mknod", e))
                .map(|_| path)
        });
        match result {
            Ok(path) => self.reply_entry(&path, reply),
            Err(code) => reply.error(code),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode);

        let result = self.child(parent, name).and_then(|path| {
            self.core
                .mkdir(&path, mode & !umask & 0o7777)
                .map_err(|e| errno("mkdir", e))
                .map(|_| path)
        });
        match result {
            Ok(path) => self.reply_entry(&path, reply),
            Err(code) => reply.error(code),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let result = self.child(parent, name).and_then(|path| {
            self.core.unlink(&path).map_err(|e| errno("unlink", e))?;
            self.inodes.unlink(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let result = self.child(parent, name).and_then(|path| {
            self.core.rmdir(&path).map_err(|e| errno("rmdir", e))?;
            self.inodes.unlink(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!(
            "symlink(parent={}, name={:?}, target={:?})",
            parent, link_name, target
        );

        let result = self.child(parent, link_name).and_then(|path| {
            self.core
                .symlink(target, &path)
                .map_err(|e| errno("symlink", e))
                .map(|_| path)
        });
        match result {
            Ok(path) => self.reply_entry(&path, reply),
            Err(code) => reply.error(code),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?}, flags={:#x})",
            parent, name, newparent, newname, flags
        );

        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let result = self.child(parent, name).and_then(|from| {
            let to = self.child(newparent, newname)?;
            self.core.rename(&from, &to).map_err(|e| errno("rename", e))?;
            self.inodes.rename(&from, &to);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);

        let result = self.path(ino).and_then(|from| {
            let to = self.child(newparent, newname)?;
            self.core.link(&from, &to).map_err(|e| errno("link", e))?;
            Ok(to)
        });
        match result {
            Ok(to) => self.reply_entry(&to, reply),
            Err(code) => reply.error(code),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);

        let result = self
            .path(ino)
            .and_then(|path| self.core.open(&path, flags).map_err(|e| errno("open", e)));
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={:#x}, offset={}, size={})", ino, fh, offset, size);

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.core.read(fh, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!(
            "write(ino={}, fh={:#x}, offset={}, len={})",
            ino,
            fh,
            offset,
            data.len()
        );

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.core.write(fh, offset as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno("write", e)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={:#x})", ino, fh);

        match self.core.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={:#x})", ino, fh);

        match self.core.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", e)),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={:#x}, datasync={})", ino, fh, datasync);

        match self.core.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(code) => {
                reply.error(code);
                return;
            }
        };

        let entries = match self.listing(ino, &path) {
            Ok(entries) => entries,
            Err(code) => {
                reply.error(code);
                return;
            }
        };

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let buffer_full = reply.add(*child_ino, (i + 1) as i64, *kind, name);
            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        debug!("statfs(ino={})", ino);

        let path = self.path(ino).unwrap_or_else(|_| PathBuf::from("/"));
        match self.core.statfs(&path) {
            Ok(s) => reply.statfs(
                s.blocks,
                s.blocks_free,
                s.blocks_available,
                s.files,
                s.files_free,
                s.block_size,
                s.name_max,
                s.fragment_size,
            ),
            Err(e) => reply.error(errno("statfs", e)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr(ino={}, name={:?})", ino, name);

        let result = self.path(ino).and_then(|path| {
            self.core
                .setxattr(&path, name, value, flags)
                .map_err(|e| errno("setxattr", e))
        });
        match result {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);

        let result = self
            .path(ino)
            .and_then(|path| self.core.getxattr(&path, name).map_err(|e| e.errno()));
        match result.and_then(|value| xattr_fit(value.len(), size).map(|fit| (value, fit))) {
            Ok((_, Some(len))) => reply.size(len),
            Ok((value, None)) => reply.data(&value),
            Err(code) => reply.error(code),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={}, size={})", ino, size);

        let result = self.path(ino).and_then(|path| {
            self.core
                .listxattr(&path)
                .map_err(|e| errno("listxattr", e))
        });
        let names = match result {
            Ok(names) => names,
            Err(code) => {
                reply.error(code);
                return;
            }
        };

        let mut data = Vec::new();
        for name in names {
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }
        match xattr_fit(data.len(), size) {
            Ok(Some(len)) => reply.size(len),
            Ok(None) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr(ino={}, name={:?})", ino, name);

        let result = self.path(ino).and_then(|path| {
            self.core
                .removexattr(&path, name)
                .map_err(|e| errno("removexattr", e))
        });
        match result {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        let result = self
            .path(ino)
            .and_then(|path| self.core.access(&path, mask).map_err(|e| e.errno()));
        match result {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!(
            "create(parent={}, name={:?}, mode={:#o}, flags={:#x})",
            parent, name, mode, flags
        );

        let result = self.child(parent, name).and_then(|path| {
            let fh = self
                .core
                .create(&path, mode & !umask & 0o7777, flags)
                .map_err(|e| errno("create", e))?;
            match self.core.fgetattr(fh) {
                Ok(attrs) => Ok((fh, attrs.to_fuser_attr(self.inodes.lookup(&path)))),
                Err(e) => {
                    let _ = self.core.release(fh);
                    Err(errno("create", e))
                }
            }
        });
        match result {
            Ok((fh, attr)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getlk(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        debug!("getlk(ino={}, fh={:#x}, start={}, end={})", ino, fh, start, end);

        let mut lock = to_flock(start, end, typ, pid);
        match self.core.lock(fh, libc::F_GETLK, &mut lock) {
            Ok(()) => {
                let (start, end, typ, pid) = from_flock(&lock);
                reply.locked(start, end, typ, pid);
            }
            Err(e) => reply.error(errno("getlk", e)),
        }
    }

    fn setlk(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        _sleep: bool,
        reply: ReplyEmpty,
    ) {
        debug!(
            "setlk(ino={}, fh={:#x}, start={}, end={}, type={})",
            ino, fh, start, end, typ
        );

        // Never block the request loop; waiting callers retry on EAGAIN
        let mut lock = to_flock(start, end, typ, pid);
        match self.core.lock(fh, libc::F_SETLK, &mut lock) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }
}
