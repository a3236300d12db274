//! Open file state and the handle table

use crate::error::{Error, Result};
use crate::fs::staging::SlotRef;
use parking_lot::RwLock;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Represents an open regular file: the ciphertext/plaintext descriptor pair
#[derive(Debug)]
pub struct FileHandle {
    /// Descriptor on the backing ciphertext file
    cipher: File,
    /// Descriptor on the staging plaintext file
    plain: File,
    /// Staging state shared with other handles on the same file
    slot: SlotRef,
    /// Open flags as requested by the caller
    flags: i32,
    /// Written since the last successful re-encryption
    dirty: AtomicBool,
}

impl FileHandle {
    pub fn new(cipher: File, plain: File, slot: SlotRef, flags: i32) -> Self {
        FileHandle {
            cipher,
            plain,
            slot,
            flags,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn cipher_file(&self) -> &File {
        &self.cipher
    }

    pub fn plain_file(&self) -> &File {
        &self.plain
    }

    pub fn slot(&self) -> &SlotRef {
        &self.slot
    }

    /// Current ciphertext path (follows renames)
    pub fn cipher_path(&self) -> PathBuf {
        self.slot.lock().cipher_path().to_path_buf()
    }

    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    /// Mark as dirty
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Check if dirty
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Clear dirty flag
    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    /// Positioned read from the plaintext; short only at end of file
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.plain.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    /// Positioned write of all of `data` to the plaintext; marks the handle dirty
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.plain.write_all_at(data, offset)?;
        self.mark_dirty();
        Ok(data.len())
    }

    /// Duplicate and close both descriptors without closing the handle
    pub fn soft_close(&self) -> Result<()> {
        for fd in [self.plain.as_raw_fd(), self.cipher.as_raw_fd()] {
            let dup = nix::unistd::dup(fd)?;
            nix::unistd::close(dup)?;
        }
        Ok(())
    }

    /// Close both descriptors, reporting the first failure
    ///
    /// Both closes are always attempted.
    pub fn close(self) -> Result<()> {
        let cipher_result = nix::unistd::close(self.cipher.into_raw_fd());
        let plain_result = nix::unistd::close(self.plain.into_raw_fd());
        cipher_result?;
        plain_result?;
        Ok(())
    }
}

struct Slot {
    generation: u32,
    handle: Option<Arc<FileHandle>>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Generation-checked table of open handles
///
/// A handle id packs `generation << 32 | slot`; ids of released handles
/// stop resolving even after the slot is reused.
pub struct HandleTable {
    arena: RwLock<Arena>,
}

fn pack(generation: u32, index: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

fn unpack(fh: u64) -> (u32, u32) {
    ((fh >> 32) as u32, fh as u32)
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            arena: RwLock::new(Arena::default()),
        }
    }

    /// Register a handle and return its id
    pub fn insert(&self, handle: FileHandle) -> u64 {
        let mut arena = self.arena.write();
        let handle = Some(Arc::new(handle));

        if let Some(index) = arena.free.pop() {
            let slot = &mut arena.slots[index as usize];
            slot.handle = handle;
            return pack(slot.generation, index);
        }

        let index = arena.slots.len() as u32;
        arena.slots.push(Slot {
            generation: 1,
            handle,
        });
        pack(1, index)
    }

    /// Get a handle by id
    pub fn get(&self, fh: u64) -> Result<Arc<FileHandle>> {
        let (generation, index) = unpack(fh);
        let arena = self.arena.read();
        arena
            .slots
            .get(index as usize)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.handle.clone())
            .ok_or(Error::BadHandle(fh))
    }

    /// Remove a handle, invalidating its id
    pub fn remove(&self, fh: u64) -> Result<Arc<FileHandle>> {
        let (generation, index) = unpack(fh);
        let mut arena = self.arena.write();

        let slot = arena
            .slots
            .get_mut(index as usize)
            .filter(|slot| slot.generation == generation && slot.handle.is_some())
            .ok_or(Error::BadHandle(fh))?;

        let handle = slot.handle.take().ok_or(Error::BadHandle(fh))?;
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        arena.free.push(index);

        Ok(handle)
    }

    /// Check if a handle id is live
    pub fn is_valid(&self, fh: u64) -> bool {
        self.get(fh).is_ok()
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.arena
            .read()
            .slots
            .iter()
            .filter(|slot| slot.handle.is_some())
            .count()
    }

    /// Ids of all open handles
    pub fn ids(&self) -> Vec<u64> {
        self.arena
            .read()
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.handle.is_some())
            .map(|(index, slot)| pack(slot.generation, index as u32))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
