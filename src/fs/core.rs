//! Encrypting filesystem core
//!
//! Path-addressed operations behind the FUSE bridge. Only attribute
//! lookup, truncation and the open-file lifecycle go through the cipher;
//! everything else is passed through to the resolved backing path.

use crate::config::Config;
use crate::crypto::{KeyProvider, StreamCipher};
use crate::error::{Error, Result};
use crate::fs::attr::{FileAttributes, NodeKind};
use crate::fs::handle::HandleTable;
use crate::fs::path::{is_staging_name, PathResolver};
use crate::fs::staging::StagingManager;
use libc::c_int;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::AccessFlags;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{DirBuilder, Permissions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, DirEntryExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Timestamp change requested by `utimens`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUpdate {
    /// Leave unchanged
    Omit,
    /// Set to the current time
    Now,
    /// Set to a specific time
    At(SystemTime),
}

impl TimeUpdate {
    fn to_timespec(self) -> libc::timespec {
        match self {
            TimeUpdate::Omit => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            TimeUpdate::Now => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_NOW,
            },
            TimeUpdate::At(time) => {
                let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
                libc::timespec {
                    tv_sec: since.as_secs() as libc::time_t,
                    tv_nsec: since.subsec_nanos() as libc::c_long,
                }
            }
        }
    }
}

/// Backing filesystem statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
    pub fragment_size: u32,
}

/// Directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: NodeKind,
    /// Inode number in the backing directory
    pub ino: u64,
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidPath(format!("interior NUL in {:?}", path)))
}

fn last_os_error() -> Error {
    Error::Io(std::io::Error::last_os_error())
}

/// The encrypting filesystem core
///
/// Owns the path resolver, the staging manager and the open-handle arena.
/// Virtual paths are absolute (`/dir/file`); file handles are the opaque ids
/// returned by [`CryptCore::open`] and [`CryptCore::create`].
pub struct CryptCore {
    resolver: PathResolver,
    staging: StagingManager,
    handles: HandleTable,
}

impl CryptCore {
    pub fn new(config: &Config, keys: Arc<dyn KeyProvider>) -> Self {
        let resolver = PathResolver::new(&config.mount.backing_dir, config.max_path_len);
        let staging = StagingManager::new(
            StreamCipher::new(config.crypto.block_size),
            keys,
            config.staging.file_mode,
        );

        CryptCore {
            resolver,
            staging,
            handles: HandleTable::new(),
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn staging(&self) -> &StagingManager {
        &self.staging
    }

    /// Number of open file handles
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    // ---- attributes ----

    /// Attributes of a path, with plaintext size for regular files
    pub fn getattr(&self, path: &Path) -> Result<FileAttributes> {
        let cipher = self.resolver.resolve_visible(path)?;
        let meta = std::fs::symlink_metadata(&cipher)?;
        let mut attrs = FileAttributes::from_metadata(&meta);

        if meta.is_file() {
            let staging = self.resolver.staging_path(&cipher)?;
            let plain = self.staging.plaintext_metadata(&cipher, &staging)?;
            attrs.overlay_plaintext(&plain);
        }
        Ok(attrs)
    }

    /// Attributes through an open handle
    pub fn fgetattr(&self, fh: u64) -> Result<FileAttributes> {
        let handle = self.handles.get(fh)?;
        let mut attrs = FileAttributes::from_metadata(&handle.cipher_file().metadata()?);
        attrs.overlay_plaintext(&handle.plain_file().metadata()?);
        Ok(attrs)
    }

    pub fn access(&self, path: &Path, mask: c_int) -> Result<()> {
        let cipher = self.resolver.resolve(path)?;
        nix::unistd::access(&cipher, AccessFlags::from_bits_truncate(mask))?;
        Ok(())
    }

    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let cipher = self.resolver.resolve(path)?;
        Ok(std::fs::read_link(cipher)?)
    }

    // ---- namespace ----

    /// Create a filesystem node; regular files get a valid empty ciphertext
    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode & 0o7777);

        if kind == SFlag::S_IFREG || kind.is_empty() {
            let fh = self.create(path, mode & 0o7777, libc::O_WRONLY | libc::O_EXCL)?;
            return self.release(fh);
        }

        let cipher = self.resolver.resolve_new(path)?;
        if kind == SFlag::S_IFIFO {
            nix::unistd::mkfifo(&cipher, perm)?;
        } else {
            nix::sys::stat::mknod(&cipher, kind, perm, rdev as libc::dev_t)?;
        }
        Ok(())
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        let cipher = self.resolver.resolve_new(path)?;
        DirBuilder::new().mode(mode).create(cipher)?;
        Ok(())
    }

    /// Remove a file; handles still open on it keep working until released
    pub fn unlink(&self, path: &Path) -> Result<()> {
        let cipher = self.resolver.resolve(path)?;
        std::fs::remove_file(&cipher)?;
        self.staging.detach(&cipher)
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        let cipher = self.resolver.resolve(path)?;
        Ok(std::fs::remove_dir(cipher)?)
    }

    /// Create a symlink at `link` whose target is stored verbatim
    pub fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let cipher = self.resolver.resolve_new(link)?;
        Ok(std::os::unix::fs::symlink(target, cipher)?)
    }

    pub fn link(&self, from: &Path, to: &Path) -> Result<()> {
        let from = self.resolver.resolve(from)?;
        let to = self.resolver.resolve_new(to)?;
        Ok(std::fs::hard_link(from, to)?)
    }

    /// Rename, carrying a live staging file along with its ciphertext
    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = self.resolver.resolve(from)?;
        let to = self.resolver.resolve_new(to)?;
        let to_staging = self.resolver.staging_path(&to)?;
        std::fs::rename(&from, &to)?;
        self.staging.rename(&from, &to, &to_staging)
    }

    pub fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let dir = self.resolver.resolve(path)?;
        let mut entries = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if is_staging_name(&name) {
                continue;
            }
            entries.push(DirEntry {
                name,
                kind: NodeKind::from(entry.file_type()?),
                ino: entry.ino(),
            });
        }
        Ok(entries)
    }

    // ---- metadata ----

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        let cipher = self.resolver.resolve(path)?;
        std::fs::set_permissions(cipher, Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let cipher = self.resolver.resolve(path)?;
        std::os::unix::fs::lchown(cipher, uid, gid)?;
        Ok(())
    }

    pub fn utimens(&self, path: &Path, atime: TimeUpdate, mtime: TimeUpdate) -> Result<()> {
        let cipher = c_path(&self.resolver.resolve(path)?)?;
        let times = [atime.to_timespec(), mtime.to_timespec()];

        // SAFETY: `cipher` is NUL-terminated and `times` holds exactly two entries
        let rc = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                cipher.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc != 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    /// Truncate the plaintext of a path and re-encrypt it
    pub fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        let cipher = self.resolver.resolve_visible(path)?;
        let staging = self.resolver.staging_path(&cipher)?;
        debug!("truncate {:?} to {}", cipher, size);
        self.staging.truncate(&cipher, &staging, size)
    }

    /// Truncate the plaintext through an open handle
    ///
    /// The ciphertext is reconciled on the next flush, fsync or release.
    pub fn ftruncate(&self, fh: u64, size: u64) -> Result<()> {
        let handle = self.handles.get(fh)?;
        handle.plain_file().set_len(size)?;
        handle.mark_dirty();
        Ok(())
    }

    pub fn statfs(&self, path: &Path) -> Result<FsStats> {
        let cipher = self.resolver.resolve(path)?;
        let stat = nix::sys::statvfs::statvfs(&cipher)?;
        Ok(FsStats {
            blocks: stat.blocks() as u64,
            blocks_free: stat.blocks_free() as u64,
            blocks_available: stat.blocks_available() as u64,
            files: stat.files() as u64,
            files_free: stat.files_free() as u64,
            block_size: stat.block_size() as u32,
            name_max: stat.name_max() as u32,
            fragment_size: stat.fragment_size() as u32,
        })
    }

    // ---- open files ----

    /// Create (or open, without `O_EXCL`) a regular file and return its handle
    pub fn create(&self, path: &Path, mode: u32, flags: c_int) -> Result<u64> {
        let cipher = self.resolver.resolve_new(path)?;
        let staging = self.resolver.staging_path(&cipher)?;

        let handle = self
            .staging
            .open_or_create(&cipher, &staging, flags, mode, true)?;
        let fh = self.handles.insert(handle);
        debug!("created {:?} as fh {:#x}", cipher, fh);
        Ok(fh)
    }

    /// Open an existing regular file and return its handle
    pub fn open(&self, path: &Path, flags: c_int) -> Result<u64> {
        let cipher = self.resolver.resolve_visible(path)?;
        let staging = self.resolver.staging_path(&cipher)?;
        let handle = self
            .staging
            .open_or_create(&cipher, &staging, flags, 0, false)?;
        let fh = self.handles.insert(handle);
        debug!("opened {:?} as fh {:#x}", cipher, fh);
        Ok(fh)
    }

    pub fn read(&self, fh: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        let handle = self.handles.get(fh)?;
        let mut buf = vec![0u8; size];
        let n = handle.read_at(&mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        self.handles.get(fh)?.write_at(data, offset)
    }

    pub fn flush(&self, fh: u64) -> Result<()> {
        let handle = self.handles.get(fh)?;
        self.staging.flush(&handle)
    }

    pub fn fsync(&self, fh: u64, data_only: bool) -> Result<()> {
        let handle = self.handles.get(fh)?;
        self.staging.fsync(&handle, data_only)
    }

    /// Close a handle; its id is invalid afterwards even if this fails
    pub fn release(&self, fh: u64) -> Result<()> {
        let handle = self.handles.remove(fh)?;
        debug!("releasing fh {:#x}", fh);
        self.staging.release(handle)
    }

    /// Release every open handle, returning how many failed
    pub fn release_all(&self) -> usize {
        let mut failed = 0;
        for fh in self.handles.ids() {
            if let Err(e) = self.release(fh) {
                warn!("failed to release fh {:#x}: {}", fh, e);
                failed += 1;
            }
        }
        failed
    }

    // ---- locks ----

    /// POSIX record lock (`F_GETLK`, `F_SETLK`, `F_SETLKW`) on the plaintext
    pub fn lock(&self, fh: u64, cmd: c_int, lock: &mut libc::flock) -> Result<()> {
        if ![libc::F_GETLK, libc::F_SETLK, libc::F_SETLKW].contains(&cmd) {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EINVAL)));
        }

        let handle = self.handles.get(fh)?;
        // SAFETY: the descriptor is owned by a live handle and `lock` is a valid flock
        let rc = unsafe {
            libc::fcntl(
                handle.plain_file().as_raw_fd(),
                cmd,
                lock as *mut libc::flock,
            )
        };
        if rc == -1 {
            return Err(last_os_error());
        }
        Ok(())
    }

    /// BSD whole-file lock on the plaintext
    pub fn flock(&self, fh: u64, operation: c_int) -> Result<()> {
        let handle = self.handles.get(fh)?;
        // SAFETY: the descriptor is owned by a live handle
        let rc = unsafe { libc::flock(handle.plain_file().as_raw_fd(), operation) };
        if rc == -1 {
            return Err(last_os_error());
        }
        Ok(())
    }

    // ---- extended attributes ----

    /// Set an attribute, honouring `XATTR_CREATE` / `XATTR_REPLACE`
    pub fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: c_int) -> Result<()> {
        let cipher = self.resolver.resolve(path)?;

        if flags & (libc::XATTR_CREATE | libc::XATTR_REPLACE) != 0 {
            let exists = xattr::get(&cipher, name)?.is_some();
            if flags & libc::XATTR_CREATE != 0 && exists {
                return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EEXIST)));
            }
            if flags & libc::XATTR_REPLACE != 0 && !exists {
                return Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENODATA)));
            }
        }

        xattr::set(&cipher, name, value)?;
        Ok(())
    }

    pub fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>> {
        let cipher = self.resolver.resolve(path)?;
        xattr::get(&cipher, name)?
            .ok_or_else(|| Error::Io(std::io::Error::from_raw_os_error(libc::ENODATA)))
    }

    pub fn listxattr(&self, path: &Path) -> Result<Vec<OsString>> {
        let cipher = self.resolver.resolve(path)?;
        Ok(xattr::list(&cipher)?.collect())
    }

    pub fn removexattr(&self, path: &Path, name: &OsStr) -> Result<()> {
        let cipher = self.resolver.resolve(path)?;
        xattr::remove(&cipher, name)?;
        Ok(())
    }
}

impl Drop for CryptCore {
    fn drop(&mut self) {
        let failed = self.release_all();
        if failed > 0 {
            warn!("{} handles failed to release on shutdown", failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StaticKeyProvider;
    use std::os::unix::fs::MetadataExt;
    use tempfile::{tempdir, TempDir};

    fn core() -> (TempDir, CryptCore) {
        let dir = tempdir().unwrap();
        let config = Config::for_backing_dir(dir.path());
        let core = CryptCore::new(&config, Arc::new(StaticKeyProvider::new("secret")));
        (dir, core)
    }

    fn write_file(core: &CryptCore, path: &str, content: &[u8]) {
        let fh = core
            .create(Path::new(path), 0o644, libc::O_WRONLY | libc::O_CREAT)
            .unwrap();
        core.write(fh, 0, content).unwrap();
        core.release(fh).unwrap();
    }

    #[test]
    fn test_create_write_read_back() {
        let (dir, core) = core();
        write_file(&core, "/a.txt", b"hello");

        let raw = std::fs::read(dir.path().join("a.txt")).unwrap();
        assert_eq!(raw.len(), 16);
        assert_ne!(&raw[..5], b"hello");

        let fh = core.open(Path::new("/a.txt"), libc::O_RDONLY).unwrap();
        assert_eq!(core.read(fh, 0, 5).unwrap(), b"hello");
        assert_eq!(core.read(fh, 3, 100).unwrap(), b"lo");
        core.release(fh).unwrap();
        assert_eq!(core.open_handles(), 0);
    }

    #[test]
    fn test_getattr_reports_plaintext_size() {
        let (dir, core) = core();
        write_file(&core, "/sized", &[1u8; 40]);

        let attrs = core.getattr(Path::new("/sized")).unwrap();
        assert_eq!(attrs.size, 40);
        assert_eq!(attrs.kind, NodeKind::RegularFile);
        assert_eq!(std::fs::metadata(dir.path().join("sized")).unwrap().len(), 48);

        let root = core.getattr(Path::new("/")).unwrap();
        assert_eq!(root.kind, NodeKind::Directory);
    }

    #[test]
    fn test_fgetattr_sees_unflushed_writes() {
        let (_dir, core) = core();
        let fh = core
            .create(Path::new("/f"), 0o600, libc::O_RDWR | libc::O_CREAT)
            .unwrap();
        core.write(fh, 0, b"0123456789").unwrap();

        assert_eq!(core.fgetattr(fh).unwrap().size, 10);
        assert_eq!(core.getattr(Path::new("/f")).unwrap().size, 10);
        core.release(fh).unwrap();
    }

    #[test]
    fn test_create_exclusive_on_existing_fails() {
        let (_dir, core) = core();
        write_file(&core, "/x", b"data");

        let err = core
            .create(Path::new("/x"), 0o644, libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL)
            .unwrap_err();
        assert!(err.is_os(libc::EEXIST));
        assert_eq!(core.getattr(Path::new("/x")).unwrap().size, 4);
    }

    #[test]
    fn test_ftruncate_and_truncate() {
        let (_dir, core) = core();
        write_file(&core, "/t", b"0123456789");

        let fh = core.open(Path::new("/t"), libc::O_RDWR).unwrap();
        core.ftruncate(fh, 6).unwrap();
        core.release(fh).unwrap();
        assert_eq!(core.getattr(Path::new("/t")).unwrap().size, 6);

        core.truncate(Path::new("/t"), 2).unwrap();
        let fh = core.open(Path::new("/t"), libc::O_RDONLY).unwrap();
        assert_eq!(core.read(fh, 0, 10).unwrap(), b"01");
        core.release(fh).unwrap();
    }

    #[test]
    fn test_readdir_hides_staging_files() {
        let (dir, core) = core();
        write_file(&core, "/visible", b"v");
        core.mkdir(Path::new("/sub"), 0o755).unwrap();

        let fh = core.open(Path::new("/visible"), libc::O_RDONLY).unwrap();
        assert!(dir.path().join(".visible.decrypt").exists());

        let mut names: Vec<_> = core
            .readdir(Path::new("/"))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec![OsString::from("sub"), OsString::from("visible")]);
        core.release(fh).unwrap();
    }

    #[test]
    fn test_staging_names_are_reserved() {
        let (dir, core) = core();
        write_file(&core, "/x", b"plain");
        let fh = core.open(Path::new("/x"), libc::O_RDONLY).unwrap();
        assert!(dir.path().join(".x.decrypt").exists());

        let reserved = Path::new("/.x.decrypt");
        let flags = libc::O_WRONLY | libc::O_CREAT;
        assert_eq!(core.create(reserved, 0o644, flags).unwrap_err().errno(), libc::EINVAL);
        assert!(matches!(core.mkdir(reserved, 0o755), Err(Error::InvalidPath(_))));
        assert!(matches!(core.rename(Path::new("/x"), reserved), Err(Error::InvalidPath(_))));
        assert!(core.getattr(reserved).unwrap_err().is_os(libc::ENOENT));
        assert!(core.open(reserved, libc::O_RDONLY).unwrap_err().is_os(libc::ENOENT));

        core.release(fh).unwrap();
        assert!(!dir.path().join(".x.decrypt").exists());
        assert!(dir.path().join("x").exists());
    }

    #[test]
    fn test_namespace_passthrough() {
        let (dir, core) = core();
        core.mkdir(Path::new("/d"), 0o750).unwrap();
        write_file(&core, "/d/f", b"content");

        core.symlink(Path::new("f"), Path::new("/d/l")).unwrap();
        assert_eq!(core.readlink(Path::new("/d/l")).unwrap(), PathBuf::from("f"));
        assert_eq!(
            core.getattr(Path::new("/d/l")).unwrap().kind,
            NodeKind::Symlink
        );

        core.link(Path::new("/d/f"), Path::new("/d/h")).unwrap();
        assert_eq!(core.getattr(Path::new("/d/h")).unwrap().nlink, 2);

        core.rename(Path::new("/d/h"), Path::new("/g")).unwrap();
        assert!(dir.path().join("g").exists());
        core.unlink(Path::new("/g")).unwrap();
        core.unlink(Path::new("/d/l")).unwrap();
        core.unlink(Path::new("/d/f")).unwrap();
        core.rmdir(Path::new("/d")).unwrap();
        assert!(!dir.path().join("d").exists());

        let err = core.rmdir(Path::new("/d")).unwrap_err();
        assert!(err.is_os(libc::ENOENT));
    }

    #[test]
    fn test_rename_open_file() {
        let (dir, core) = core();
        write_file(&core, "/old", b"abc");

        let fh = core.open(Path::new("/old"), libc::O_RDWR).unwrap();
        core.rename(Path::new("/old"), Path::new("/new")).unwrap();
        core.write(fh, 3, b"def").unwrap();
        core.release(fh).unwrap();

        assert!(!dir.path().join(".old.decrypt").exists());
        assert!(!dir.path().join(".new.decrypt").exists());
        let fh = core.open(Path::new("/new"), libc::O_RDONLY).unwrap();
        assert_eq!(core.read(fh, 0, 6).unwrap(), b"abcdef");
        core.release(fh).unwrap();
    }

    #[test]
    fn test_unlink_open_file_then_recreate() {
        let (dir, core) = core();
        write_file(&core, "/u", b"first");

        let old = core.open(Path::new("/u"), libc::O_RDWR).unwrap();
        core.unlink(Path::new("/u")).unwrap();
        write_file(&core, "/u", b"second");

        assert_eq!(core.read(old, 0, 5).unwrap(), b"first");
        core.write(old, 0, b"FIRST").unwrap();
        core.release(old).unwrap();

        assert!(!dir.path().join(".u.decrypt").exists());
        let fh = core.open(Path::new("/u"), libc::O_RDONLY).unwrap();
        assert_eq!(core.read(fh, 0, 6).unwrap(), b"second");
        core.release(fh).unwrap();
    }

    #[test]
    fn test_mknod_regular_and_fifo() {
        let (dir, core) = core();
        core.mknod(Path::new("/reg"), libc::S_IFREG | 0o644, 0).unwrap();
        assert_eq!(core.getattr(Path::new("/reg")).unwrap().size, 0);
        assert_eq!(std::fs::metadata(dir.path().join("reg")).unwrap().len(), 16);

        core.mknod(Path::new("/pipe"), libc::S_IFIFO | 0o600, 0).unwrap();
        assert_eq!(core.getattr(Path::new("/pipe")).unwrap().kind, NodeKind::Fifo);
    }

    #[test]
    fn test_chmod_and_utimens() {
        let (dir, core) = core();
        write_file(&core, "/m", b"x");

        core.chmod(Path::new("/m"), 0o640).unwrap();
        assert_eq!(core.getattr(Path::new("/m")).unwrap().perm, 0o640);

        let when = UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        core.utimens(Path::new("/m"), TimeUpdate::Omit, TimeUpdate::At(when))
            .unwrap();
        let meta = std::fs::metadata(dir.path().join("m")).unwrap();
        assert_eq!(meta.mtime(), 1_000_000);

        let uid = meta.uid();
        core.chown(Path::new("/m"), Some(uid), None).unwrap();
    }

    #[test]
    fn test_access_and_statfs() {
        let (_dir, core) = core();
        write_file(&core, "/acc", b"x");
        core.access(Path::new("/acc"), libc::F_OK).unwrap();
        assert!(core.access(Path::new("/missing"), libc::F_OK).is_err());

        let stats = core.statfs(Path::new("/")).unwrap();
        assert!(stats.block_size > 0);
        assert!(stats.blocks >= stats.blocks_free);
    }

    #[test]
    fn test_locks_on_open_handle() {
        let (_dir, core) = core();
        let fh = core
            .create(Path::new("/lk"), 0o644, libc::O_RDWR | libc::O_CREAT)
            .unwrap();

        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = libc::F_WRLCK as libc::c_short;
        lock.l_whence = libc::SEEK_SET as libc::c_short;
        core.lock(fh, libc::F_SETLK, &mut lock).unwrap();

        // Our own lock never conflicts with ourselves
        core.lock(fh, libc::F_GETLK, &mut lock).unwrap();
        assert_eq!(lock.l_type, libc::F_UNLCK as libc::c_short);

        core.flock(fh, libc::LOCK_EX | libc::LOCK_NB).unwrap();
        core.flock(fh, libc::LOCK_UN).unwrap();

        let mut bogus: libc::flock = unsafe { std::mem::zeroed() };
        assert!(core.lock(fh, libc::F_DUPFD, &mut bogus).is_err());
        core.release(fh).unwrap();
    }

    #[test]
    fn test_xattrs_when_supported() {
        let (_dir, core) = core();
        write_file(&core, "/xa", b"x");
        let path = Path::new("/xa");
        let name = OsStr::new("user.cipherfs.test");

        match core.setxattr(path, name, b"value", 0) {
            Err(e) if e.is_os(libc::ENOTSUP) || e.is_os(libc::EPERM) => return,
            other => other.unwrap(),
        }
        assert_eq!(core.getxattr(path, name).unwrap(), b"value");
        assert!(core.listxattr(path).unwrap().iter().any(|n| n == name));

        let err = core.setxattr(path, name, b"again", libc::XATTR_CREATE).unwrap_err();
        assert!(err.is_os(libc::EEXIST));

        core.removexattr(path, name).unwrap();
        assert!(core.getxattr(path, name).unwrap_err().is_os(libc::ENODATA));
    }

    #[test]
    fn test_stale_handle() {
        let (_dir, core) = core();
        write_file(&core, "/s", b"x");
        let fh = core.open(Path::new("/s"), libc::O_RDONLY).unwrap();
        core.release(fh).unwrap();

        assert!(matches!(core.read(fh, 0, 1), Err(Error::BadHandle(_))));
        assert!(matches!(core.release(fh), Err(Error::BadHandle(_))));
    }

    #[test]
    fn test_drop_releases_open_handles() {
        let dir = tempdir().unwrap();
        let config = Config::for_backing_dir(dir.path());
        {
            let core = CryptCore::new(&config, Arc::new(StaticKeyProvider::new("secret")));
            let fh = core
                .create(Path::new("/pending"), 0o644, libc::O_RDWR | libc::O_CREAT)
                .unwrap();
            core.write(fh, 0, b"unsaved").unwrap();
        }

        assert!(!dir.path().join(".pending.decrypt").exists());
        let core = CryptCore::new(&config, Arc::new(StaticKeyProvider::new("secret")));
        assert_eq!(core.getattr(Path::new("/pending")).unwrap().size, 7);
    }
}
