//! Decrypt-before-use / encrypt-before-discard around a file pair
//!
//! Every ciphertext path that has a live plaintext copy owns a
//! [`StagingSlot`]. The first open decrypts into the staging file; later
//! opens of the same path share it; the last release removes it. All
//! transitions of a slot happen under its mutex, so two opens of one path
//! can never race on creating, decrypting or deleting the staging file.

use crate::crypto::{CipherMode, KeyProvider, StreamCipher};
use crate::error::{Error, Result};
use crate::fs::handle::FileHandle;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::{File, Metadata, OpenOptions, Permissions};
use std::io::ErrorKind;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared reference to a staging slot
pub type SlotRef = Arc<Mutex<StagingSlot>>;

/// Flags that never reach the underlying open(2) as given by the caller
#[cfg(target_os = "linux")]
const MANAGED_FLAGS: i32 = libc::O_ACCMODE
    | libc::O_CREAT
    | libc::O_EXCL
    | libc::O_TRUNC
    | libc::O_APPEND
    | libc::O_DIRECT;
#[cfg(not(target_os = "linux"))]
const MANAGED_FLAGS: i32 =
    libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC | libc::O_APPEND;

/// Live plaintext state of one ciphertext path
#[derive(Debug)]
pub struct StagingSlot {
    cipher_path: PathBuf,
    staging_path: PathBuf,
    /// Our own read-write descriptor on the staging file while it is live
    staging: Option<File>,
    /// Open handles sharing the staging file
    handles: usize,
    /// Slot no longer reachable by path (file unlinked or replaced)
    detached: bool,
}

impl StagingSlot {
    pub(crate) fn new(cipher_path: &Path) -> Self {
        StagingSlot {
            cipher_path: cipher_path.to_path_buf(),
            staging_path: PathBuf::new(),
            staging: None,
            handles: 0,
            detached: false,
        }
    }

    pub fn cipher_path(&self) -> &Path {
        &self.cipher_path
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    /// True while a staging file is materialized
    pub fn is_live(&self) -> bool {
        self.staging.is_some()
    }

    pub fn handle_count(&self) -> usize {
        self.handles
    }

    fn live_staging(&self) -> Result<&File> {
        self.staging.as_ref().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("no live staging file for {:?}", self.cipher_path),
            ))
        })
    }
}

fn is_writable(flags: i32) -> bool {
    let mode = flags & libc::O_ACCMODE;
    mode == libc::O_WRONLY || mode == libc::O_RDWR
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Orchestrates staging files and the cipher passes around them
pub struct StagingManager {
    cipher: StreamCipher,
    keys: Arc<dyn KeyProvider>,
    staging_mode: u32,
    slots: DashMap<PathBuf, SlotRef>,
}

impl StagingManager {
    pub fn new(cipher: StreamCipher, keys: Arc<dyn KeyProvider>, staging_mode: u32) -> Self {
        StagingManager {
            cipher,
            keys,
            staging_mode,
            slots: DashMap::new(),
        }
    }

    /// Number of paths with live or in-use slots
    pub fn active_slots(&self) -> usize {
        self.slots.len()
    }

    /// True if a staging file for `cipher_path` is currently materialized
    pub fn is_staged(&self, cipher_path: &Path) -> bool {
        self.slots
            .get(cipher_path)
            .map(|slot| Arc::clone(&*slot))
            .map(|slot| slot.lock().is_live())
            .unwrap_or(false)
    }

    /// Run `f` with the attached slot for `cipher_path` locked
    fn with_slot<T, F>(&self, cipher_path: &Path, f: F) -> Result<T>
    where
        F: FnOnce(&SlotRef, &mut StagingSlot) -> Result<T>,
    {
        let result = loop {
            let slot_ref = Arc::clone(
                &*self
                    .slots
                    .entry(cipher_path.to_path_buf())
                    .or_insert_with(|| Arc::new(Mutex::new(StagingSlot::new(cipher_path)))),
            );
            let mut slot = slot_ref.lock();
            if slot.detached {
                // Lost a race with unlink/rename; the map now holds a fresh slot
                continue;
            }
            break f(&slot_ref, &mut slot);
        };

        self.prune(cipher_path);
        result
    }

    /// Drop the map entry for an idle slot nobody else references
    fn prune(&self, cipher_path: &Path) {
        self.slots.remove_if(cipher_path, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot
                    .try_lock()
                    .map_or(false, |s| s.handles == 0 && s.staging.is_none())
        });
    }

    fn create_staging(&self, staging_path: &Path) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.staging_mode)
            .open(staging_path)?;
        // A leftover staging file keeps its old mode across O_CREAT
        file.set_permissions(Permissions::from_mode(self.staging_mode))?;
        Ok(file)
    }

    /// Decrypt all of `cipher` into `staging`, replacing its content
    fn decrypt_into(&self, cipher: &File, staging: &File) -> Result<u64> {
        let key = self.keys.passphrase()?;
        staging.set_len(0)?;
        let (mut input, mut output) = (cipher, staging);
        self.cipher
            .transform(&mut input, &mut output, CipherMode::Decrypt, Some(key.as_slice()))
    }

    /// Encrypt all of `staging` into `cipher`, replacing its content
    fn encrypt_into(&self, staging: &File, cipher: &File) -> Result<u64> {
        let key = self.keys.passphrase()?;
        cipher.set_len(0)?;
        let (mut input, mut output) = (staging, cipher);
        self.cipher
            .transform(&mut input, &mut output, CipherMode::Encrypt, Some(key.as_slice()))
    }

    fn open_cipher(&self, cipher_path: &Path, flags: i32, existed: bool, mode: u32) -> Result<File> {
        let mut opts = OpenOptions::new();
        opts.read(true).custom_flags(flags & !MANAGED_FLAGS);

        if existed {
            opts.write(is_writable(flags));
        } else {
            // Fresh files are written once here even for read-only opens
            opts.write(true).mode(mode);
            if flags & libc::O_EXCL != 0 {
                opts.create_new(true);
            } else {
                opts.create(true).truncate(true);
            }
        }

        Ok(opts.open(cipher_path)?)
    }

    fn open_plain(&self, staging_path: &Path, flags: i32) -> Result<File> {
        let access = flags & libc::O_ACCMODE;
        let writable = is_writable(flags);
        let plain = OpenOptions::new()
            .read(access != libc::O_WRONLY)
            .write(writable)
            .append(writable && flags & libc::O_APPEND != 0)
            .custom_flags(flags & !MANAGED_FLAGS)
            .open(staging_path)?;
        // OpenOptions refuses append together with truncate
        if writable && flags & libc::O_TRUNC != 0 {
            plain.set_len(0)?;
        }
        Ok(plain)
    }

    /// Open (or create) the file pair for a caller
    ///
    /// With `create`, the ciphertext is created unless it already exists (or
    /// always, failing if it exists, under `O_EXCL`); the empty plaintext is
    /// encrypted straight away so the ciphertext is valid from the start.
    /// Otherwise the ciphertext is decrypted into the staging file unless
    /// another handle already has it live. A writable open with `O_TRUNC`
    /// starts dirty.
    ///
    /// A ciphertext created here is removed again if the open fails.
    pub fn open_or_create(
        &self,
        cipher_path: &Path,
        staging_path: &Path,
        flags: i32,
        mode: u32,
        create: bool,
    ) -> Result<FileHandle> {
        self.with_slot(cipher_path, |slot_ref, slot| {
            let existed = !create
                || (flags & libc::O_EXCL == 0 && std::fs::symlink_metadata(cipher_path).is_ok());
            let cipher = self.open_cipher(cipher_path, flags, existed, mode)?;

            let attached = self.attach(slot_ref, slot, cipher, staging_path, flags, existed);
            if attached.is_err() && !existed {
                if let Err(rm) = remove_if_present(cipher_path) {
                    warn!("failed to remove new ciphertext {:?}: {}", cipher_path, rm);
                }
            }
            attached
        })
    }

    /// Make the staging file live for `cipher` and wrap both in a handle
    fn attach(
        &self,
        slot_ref: &SlotRef,
        slot: &mut StagingSlot,
        cipher: File,
        staging_path: &Path,
        flags: i32,
        existed: bool,
    ) -> Result<FileHandle> {
        let first = !slot.is_live();

        if first {
            let staging = self.create_staging(staging_path)?;
            let prepared = if existed {
                debug!("decrypting {:?} -> {:?}", slot.cipher_path, staging_path);
                self.decrypt_into(&cipher, &staging)
            } else {
                debug!("initializing new ciphertext {:?}", slot.cipher_path);
                self.encrypt_into(&staging, &cipher)
            };

            if let Err(e) = prepared {
                drop(staging);
                if let Err(rm) = remove_if_present(staging_path) {
                    warn!("failed to remove staging file {:?}: {}", staging_path, rm);
                }
                return Err(e);
            }

            slot.staging_path = staging_path.to_path_buf();
            slot.staging = Some(staging);
        } else if !existed {
            // Recreated underneath live handles: everyone now sees it empty
            let staging = slot.live_staging()?;
            staging.set_len(0)?;
            self.encrypt_into(staging, &cipher)?;
        }

        let plain = match self.open_plain(&slot.staging_path, flags) {
            Ok(plain) => plain,
            Err(e) => {
                if first {
                    slot.staging = None;
                    if let Err(rm) = remove_if_present(staging_path) {
                        warn!("failed to remove staging file {:?}: {}", staging_path, rm);
                    }
                }
                return Err(e);
            }
        };

        slot.handles += 1;
        let handle = FileHandle::new(cipher, plain, Arc::clone(slot_ref), flags);
        if is_writable(flags) && flags & libc::O_TRUNC != 0 {
            handle.mark_dirty();
        }
        Ok(handle)
    }

    /// Re-encrypt the shared staging file through this handle if it is dirty
    ///
    /// Returns true if a cipher pass ran.
    pub fn sync(&self, handle: &FileHandle) -> Result<bool> {
        if !handle.is_dirty() {
            return Ok(false);
        }

        let slot = handle.slot().lock();
        let staging = slot.live_staging()?;
        debug!("encrypting {:?} -> {:?}", slot.staging_path, slot.cipher_path);
        self.encrypt_into(staging, handle.cipher_file())?;
        handle.clear_dirty();
        Ok(true)
    }

    /// Flush: settle both descriptors, then re-encrypt if dirty
    pub fn flush(&self, handle: &FileHandle) -> Result<()> {
        handle.soft_close()?;
        self.sync(handle)?;
        Ok(())
    }

    /// Fsync: re-encrypt if dirty, then sync the ciphertext descriptor
    pub fn fsync(&self, handle: &FileHandle, data_only: bool) -> Result<()> {
        self.sync(handle)?;
        if data_only {
            handle.cipher_file().sync_data()?;
        } else {
            handle.cipher_file().sync_all()?;
        }
        Ok(())
    }

    /// Release: re-encrypt if dirty, close both descriptors, and remove the
    /// staging file once no handle uses it
    ///
    /// Descriptors are closed and the staging file is removed even when
    /// encryption fails; the first error is returned, encryption first.
    pub fn release(&self, handle: impl Into<Arc<FileHandle>>) -> Result<()> {
        let handle = handle.into();
        let encrypted = self.sync(&handle);
        let slot_ref = Arc::clone(handle.slot());
        let closed = match Arc::try_unwrap(handle) {
            Ok(handle) => handle.close(),
            // An in-flight operation still holds it; the descriptors close on its drop
            Err(_) => Ok(()),
        };

        let cleanup = {
            let mut slot = slot_ref.lock();
            slot.handles = slot.handles.saturating_sub(1);

            if slot.handles == 0 {
                slot.staging = None;
                if slot.detached {
                    Ok(())
                } else {
                    if encrypted.is_err() {
                        warn!(
                            "discarding unsaved plaintext of {:?} after failed encryption",
                            slot.cipher_path
                        );
                    }
                    debug!("removing staging file {:?}", slot.staging_path);
                    remove_if_present(&slot.staging_path)
                }
            } else {
                Ok(())
            }
        };

        let cipher_path = slot_ref.lock().cipher_path.clone();
        drop(slot_ref);
        self.prune(&cipher_path);

        encrypted?;
        closed?;
        cleanup?;
        Ok(())
    }

    /// Plaintext metadata for a path with no handle of the caller's own
    ///
    /// Uses the live staging file if there is one, otherwise decrypts into a
    /// throwaway staging file, stats it and removes it.
    pub fn plaintext_metadata(&self, cipher_path: &Path, staging_path: &Path) -> Result<Metadata> {
        self.with_slot(cipher_path, |_, slot| {
            if let Some(staging) = slot.staging.as_ref() {
                return Ok(staging.metadata()?);
            }

            let cipher = File::open(cipher_path)?;
            let staging = self.create_staging(staging_path)?;
            let result = self
                .decrypt_into(&cipher, &staging)
                .and_then(|_| Ok(staging.metadata()?));
            drop(staging);

            remove_if_present(staging_path)?;
            result
        })
    }

    /// Truncate the plaintext of a path without a handle and re-encrypt
    pub fn truncate(&self, cipher_path: &Path, staging_path: &Path, size: u64) -> Result<()> {
        self.with_slot(cipher_path, |_, slot| {
            let cipher = OpenOptions::new()
                .read(true)
                .write(true)
                .open(cipher_path)?;

            if let Some(staging) = slot.staging.as_ref() {
                staging.set_len(size)?;
                self.encrypt_into(staging, &cipher)?;
                return Ok(());
            }

            let staging = self.create_staging(staging_path)?;
            let result = self
                .decrypt_into(&cipher, &staging)
                .and_then(|_| Ok(staging.set_len(size)?))
                .and_then(|_| self.encrypt_into(&staging, &cipher));
            drop(staging);

            remove_if_present(staging_path)?;
            result.map(|_| ())
        })
    }

    /// Forget the staging state of a path whose ciphertext was removed or replaced
    ///
    /// Handles still open keep working on their (now unlinked) staging file.
    pub fn detach(&self, cipher_path: &Path) -> Result<()> {
        let slot_ref = match self.slots.get(cipher_path) {
            Some(slot) => Arc::clone(&*slot),
            None => return Ok(()),
        };

        let mut slot = slot_ref.lock();
        if slot.detached {
            return Ok(());
        }
        slot.detached = true;
        self.slots
            .remove_if(cipher_path, |_, current| Arc::ptr_eq(current, &slot_ref));

        if slot.is_live() {
            debug!("detaching staging file {:?}", slot.staging_path);
            remove_if_present(&slot.staging_path)?;
        }
        Ok(())
    }

    /// Move the staging state of a renamed ciphertext to its new paths
    pub fn rename(&self, from: &Path, to: &Path, to_staging: &Path) -> Result<()> {
        self.detach(to)?;

        let slot_ref = match self.slots.get(from) {
            Some(slot) => Arc::clone(&*slot),
            None => return Ok(()),
        };

        let mut slot = slot_ref.lock();
        if slot.detached {
            return Ok(());
        }
        self.slots
            .remove_if(from, |_, current| Arc::ptr_eq(current, &slot_ref));

        if slot.is_live() {
            debug!("moving staging file {:?} -> {:?}", slot.staging_path, to_staging);
            std::fs::rename(&slot.staging_path, to_staging)?;
            slot.staging_path = to_staging.to_path_buf();
        }
        slot.cipher_path = to.to_path_buf();
        self.slots.insert(to.to_path_buf(), Arc::clone(&slot_ref));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Passphrase, StaticKeyProvider};
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use zeroize::Zeroizing;
    use tempfile::tempdir;

    const CREATE: bool = true;
    const OPEN: bool = false;

    fn manager() -> StagingManager {
        StagingManager::new(
            StreamCipher::default(),
            Arc::new(StaticKeyProvider::new("secret")),
            0o600,
        )
    }

    /// Hands out the passphrase `budget` times, then reports it unavailable
    struct FlakyKeys {
        budget: AtomicUsize,
    }

    impl KeyProvider for FlakyKeys {
        fn passphrase(&self) -> Result<Passphrase> {
            self.budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .map_err(|_| Error::KeyUnavailable("key service down".to_string()))?;
            Ok(Zeroizing::new(b"secret".to_vec()))
        }
    }

    fn flaky_manager(budget: usize) -> StagingManager {
        StagingManager::new(
            StreamCipher::default(),
            Arc::new(FlakyKeys {
                budget: AtomicUsize::new(budget),
            }),
            0o600,
        )
    }

    fn paths(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
        (dir.join(name), dir.join(format!(".{}.decrypt", name)))
    }

    fn encrypt_file(mgr: &StagingManager, path: &Path, content: &[u8]) {
        let plain = tempfile::tempfile().unwrap();
        std::io::Write::write_all(&mut &plain, content).unwrap();
        let cipher = File::create(path).unwrap();
        mgr.encrypt_into(&plain, &cipher).unwrap();
    }

    #[test]
    fn test_create_initializes_valid_ciphertext() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let (cipher, staging) = paths(dir.path(), "new");

        let handle = mgr
            .open_or_create(&cipher, &staging, libc::O_RDWR | libc::O_CREAT, 0o644, CREATE)
            .unwrap();
        assert!(!handle.is_dirty());
        assert!(staging.exists());
        // Empty plaintext encrypts to one padding block
        assert_eq!(std::fs::metadata(&cipher).unwrap().len(), 16);

        mgr.release(handle).unwrap();
        assert!(!staging.exists());
        assert_eq!(mgr.active_slots(), 0);
    }

    #[test]
    fn test_open_decrypts_and_release_cleans_up() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let (cipher, staging) = paths(dir.path(), "a.txt");
        encrypt_file(&mgr, &cipher, b"hello");

        let handle = mgr
            .open_or_create(&cipher, &staging, libc::O_RDONLY, 0, OPEN)
            .unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(handle.read_at(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert!(mgr.is_staged(&cipher));

        mgr.release(handle).unwrap();
        assert!(!staging.exists());
        assert!(!mgr.is_staged(&cipher));
    }

    #[test]
    fn test_flush_only_when_dirty() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let (cipher, staging) = paths(dir.path(), "f");
        encrypt_file(&mgr, &cipher, b"original");
        let before = std::fs::read(&cipher).unwrap();

        let handle = mgr
            .open_or_create(&cipher, &staging, libc::O_RDWR, 0, OPEN)
            .unwrap();
        mgr.flush(&handle).unwrap();
        assert_eq!(std::fs::read(&cipher).unwrap(), before);

        handle.write_at(b"ORIGINAL", 0).unwrap();
        assert!(mgr.sync(&handle).unwrap());
        assert!(!mgr.sync(&handle).unwrap());
        assert_ne!(std::fs::read(&cipher).unwrap(), before);

        mgr.release(handle).unwrap();
    }

    #[test]
    fn test_shared_staging_between_handles() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let (cipher, staging) = paths(dir.path(), "shared");
        encrypt_file(&mgr, &cipher, b"abc");

        let a = mgr.open_or_create(&cipher, &staging, libc::O_RDWR, 0, OPEN).unwrap();
        let b = mgr.open_or_create(&cipher, &staging, libc::O_RDONLY, 0, OPEN).unwrap();
        assert_eq!(a.slot().lock().handle_count(), 2);

        a.write_at(b"XYZ", 0).unwrap();
        let mut buf = [0u8; 3];
        b.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"XYZ");

        mgr.release(a).unwrap();
        assert!(staging.exists());
        mgr.release(b).unwrap();
        assert!(!staging.exists());

        let mut decrypted = Vec::new();
        let c = mgr.open_or_create(&cipher, &staging, libc::O_RDONLY, 0, OPEN).unwrap();
        (&*c.plain_file()).read_to_end(&mut decrypted).unwrap();
        assert_eq!(decrypted, b"XYZ");
        mgr.release(c).unwrap();
    }

    #[test]
    fn test_open_missing_file_fails_without_staging() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let (cipher, staging) = paths(dir.path(), "missing");

        let err = mgr
            .open_or_create(&cipher, &staging, libc::O_RDONLY, 0, OPEN)
            .unwrap_err();
        assert!(err.is_os(libc::ENOENT));
        assert!(!staging.exists());
    }

    #[test]
    fn test_corrupt_ciphertext_aborts_open() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let (cipher, staging) = paths(dir.path(), "corrupt");
        std::fs::write(&cipher, b"not a multiple of sixteen").unwrap();

        let err = mgr
            .open_or_create(&cipher, &staging, libc::O_RDONLY, 0, OPEN)
            .unwrap_err();
        assert!(matches!(err, Error::Cipher(_)));
        assert!(!staging.exists());
        assert_eq!(mgr.active_slots(), 0);
    }

    #[test]
    fn test_plaintext_metadata_throwaway() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let (cipher, staging) = paths(dir.path(), "sized");
        encrypt_file(&mgr, &cipher, &[7u8; 100]);

        let meta = mgr.plaintext_metadata(&cipher, &staging).unwrap();
        assert_eq!(meta.len(), 100);
        assert!(!staging.exists());
    }

    #[test]
    fn test_truncate_without_handle() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let (cipher, staging) = paths(dir.path(), "trunc");
        encrypt_file(&mgr, &cipher, b"0123456789");

        mgr.truncate(&cipher, &staging, 4).unwrap();
        assert!(!staging.exists());
        assert_eq!(mgr.plaintext_metadata(&cipher, &staging).unwrap().len(), 4);
    }

    #[test]
    fn test_o_trunc_starts_dirty() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let (cipher, staging) = paths(dir.path(), "t");
        encrypt_file(&mgr, &cipher, b"old content");

        let handle = mgr
            .open_or_create(&cipher, &staging, libc::O_WRONLY | libc::O_TRUNC, 0, OPEN)
            .unwrap();
        assert!(handle.is_dirty());
        mgr.release(handle).unwrap();

        assert_eq!(mgr.plaintext_metadata(&cipher, &staging).unwrap().len(), 0);
    }

    #[test]
    fn test_detach_keeps_open_handle_working() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let (cipher, staging) = paths(dir.path(), "gone");
        encrypt_file(&mgr, &cipher, b"data");

        let handle = mgr.open_or_create(&cipher, &staging, libc::O_RDWR, 0, OPEN).unwrap();
        std::fs::remove_file(&cipher).unwrap();
        mgr.detach(&cipher).unwrap();
        assert!(!staging.exists());

        handle.write_at(b"more", 4).unwrap();
        mgr.release(handle).unwrap();
        assert!(!cipher.exists());
        assert_eq!(mgr.active_slots(), 0);
    }

    #[test]
    fn test_rename_moves_staging() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let (from, from_staging) = paths(dir.path(), "old");
        let (to, to_staging) = paths(dir.path(), "new");
        encrypt_file(&mgr, &from, b"moving");

        let handle = mgr.open_or_create(&from, &from_staging, libc::O_RDWR, 0, OPEN).unwrap();
        std::fs::rename(&from, &to).unwrap();
        mgr.rename(&from, &to, &to_staging).unwrap();

        assert!(!from_staging.exists());
        assert!(to_staging.exists());
        assert!(mgr.is_staged(&to));

        mgr.release(handle).unwrap();
        assert!(!to_staging.exists());
    }

    #[test]
    fn test_failed_release_still_cleans_up() {
        let dir = tempdir().unwrap();
        let mgr = flaky_manager(1);
        let (cipher, staging) = paths(dir.path(), "secret.txt");

        let handle = mgr
            .open_or_create(&cipher, &staging, libc::O_RDWR | libc::O_CREAT, 0o644, CREATE)
            .unwrap();
        handle.write_at(b"PLAINTEXT-SECRET", 0).unwrap();

        let err = mgr.release(handle).unwrap_err();
        assert!(matches!(err, Error::KeyUnavailable(_)));
        assert!(!staging.exists());
        assert_eq!(mgr.active_slots(), 0);
        // The ciphertext still holds the last successful encryption
        assert_eq!(std::fs::metadata(&cipher).unwrap().len(), 16);
    }

    #[test]
    fn test_failed_flush_keeps_handle_dirty() {
        let dir = tempdir().unwrap();
        let mgr = flaky_manager(1);
        let (cipher, staging) = paths(dir.path(), "f");

        let handle = mgr
            .open_or_create(&cipher, &staging, libc::O_RDWR | libc::O_CREAT, 0o644, CREATE)
            .unwrap();
        handle.write_at(b"data", 0).unwrap();

        assert!(matches!(mgr.flush(&handle), Err(Error::KeyUnavailable(_))));
        assert!(handle.is_dirty());
        assert!(staging.exists());

        assert!(mgr.release(handle).is_err());
        assert!(!staging.exists());
    }

    #[test]
    fn test_key_failure_aborts_open() {
        let dir = tempdir().unwrap();
        let (cipher, staging) = paths(dir.path(), "locked");
        encrypt_file(&manager(), &cipher, b"contents");
        let mgr = flaky_manager(0);

        let err = mgr
            .open_or_create(&cipher, &staging, libc::O_RDONLY, 0, OPEN)
            .unwrap_err();
        assert!(matches!(err, Error::KeyUnavailable(_)));
        assert!(!staging.exists());
        assert_eq!(mgr.active_slots(), 0);
        assert!(cipher.exists());
    }

    #[test]
    fn test_failed_create_removes_new_ciphertext() {
        let dir = tempdir().unwrap();
        let mgr = flaky_manager(0);
        let (cipher, staging) = paths(dir.path(), "fresh");

        let err = mgr
            .open_or_create(&cipher, &staging, libc::O_WRONLY | libc::O_CREAT, 0o644, CREATE)
            .unwrap_err();
        assert!(matches!(err, Error::KeyUnavailable(_)));
        assert!(!cipher.exists());
        assert!(!staging.exists());
    }

    #[test]
    fn test_append_with_trunc() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let (cipher, staging) = paths(dir.path(), "log");
        encrypt_file(&mgr, &cipher, b"old lines\n");

        let flags = libc::O_WRONLY | libc::O_APPEND | libc::O_TRUNC;
        let handle = mgr.open_or_create(&cipher, &staging, flags, 0, OPEN).unwrap();
        assert!(handle.is_dirty());
        handle.write_at(b"new\n", 0).unwrap();
        mgr.release(handle).unwrap();

        let handle = mgr
            .open_or_create(&cipher, &staging, flags | libc::O_CREAT, 0o644, CREATE)
            .unwrap();
        handle.write_at(b"again\n", 0).unwrap();
        mgr.release(handle).unwrap();
        assert_eq!(mgr.plaintext_metadata(&cipher, &staging).unwrap().len(), 6);
    }

    #[test]
    fn test_create_without_excl_keeps_live_content() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let (cipher, staging) = paths(dir.path(), "race");

        let first = mgr
            .open_or_create(&cipher, &staging, libc::O_RDWR | libc::O_CREAT, 0o644, CREATE)
            .unwrap();
        first.write_at(b"written", 0).unwrap();

        // A second create of the same path sees the file and just opens it
        let second = mgr
            .open_or_create(&cipher, &staging, libc::O_RDWR | libc::O_CREAT, 0o644, CREATE)
            .unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(second.read_at(&mut buf, 0).unwrap(), 7);
        assert_eq!(&buf, b"written");

        mgr.release(second).unwrap();
        mgr.release(first).unwrap();
    }
}
