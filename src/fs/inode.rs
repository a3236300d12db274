//! Inode management for the kernel bridge
//!
//! The core is path-addressed; the kernel speaks inode numbers. This table
//! hands out stable inode numbers for virtual paths and keeps them in step
//! with renames and removals.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Inode number of the mount root
pub const ROOT_INO: u64 = 1;

#[derive(Debug, Clone)]
struct InodeEntry {
    /// Virtual path (absolute, rooted at the mount)
    path: PathBuf,
    /// Outstanding kernel lookups
    lookups: u64,
}

#[derive(Default)]
struct Tables {
    /// ino -> entry
    inodes: HashMap<u64, InodeEntry>,
    /// path -> ino
    paths: HashMap<PathBuf, u64>,
}

/// Maps inode numbers to virtual paths and back
pub struct InodeTable {
    /// Next inode number to hand out
    next_ino: AtomicU64,
    tables: RwLock<Tables>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            tables: RwLock::new(Tables::default()),
        };

        let root = PathBuf::from("/");
        let mut tables = table.tables.write();
        tables.inodes.insert(
            ROOT_INO,
            InodeEntry {
                path: root.clone(),
                lookups: 1,
            },
        );
        tables.paths.insert(root, ROOT_INO);
        drop(tables);

        table
    }

    /// Virtual path of an inode
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.tables.read().inodes.get(&ino).map(|e| e.path.clone())
    }

    /// Virtual path of `name` inside directory `parent`
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path(parent).map(|p| p.join(name))
    }

    /// Inode of a path, if known
    pub fn ino(&self, path: &Path) -> Option<u64> {
        self.tables.read().paths.get(path).copied()
    }

    /// Inode for a path, allocating one if needed, counting one kernel lookup
    pub fn lookup(&self, path: &Path) -> u64 {
        let mut tables = self.tables.write();

        if let Some(&ino) = tables.paths.get(path) {
            if let Some(entry) = tables.inodes.get_mut(&ino) {
                entry.lookups += 1;
            }
            return ino;
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        tables.inodes.insert(
            ino,
            InodeEntry {
                path: path.to_path_buf(),
                lookups: 1,
            },
        );
        tables.paths.insert(path.to_path_buf(), ino);
        ino
    }

    /// Drop `nlookup` kernel references; the inode is forgotten at zero
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }

        let mut tables = self.tables.write();
        let remove = match tables.inodes.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                entry.lookups == 0
            }
            None => false,
        };

        if remove {
            if let Some(entry) = tables.inodes.remove(&ino) {
                if tables.paths.get(&entry.path) == Some(&ino) {
                    tables.paths.remove(&entry.path);
                }
            }
        }
    }

    /// Detach a removed path; the inode lives on until forgotten
    pub fn unlink(&self, path: &Path) {
        self.tables.write().paths.remove(path);
    }

    /// Move a path and everything under it
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut tables = self.tables.write();
        let Tables { inodes, paths } = &mut *tables;

        // Whatever the target replaced is no longer reachable by path
        paths.remove(to);

        let moved: Vec<(PathBuf, u64)> = paths
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect();

        for (old, ino) in moved {
            paths.remove(&old);
            let new = match old.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            if let Some(entry) = inodes.get_mut(&ino) {
                entry.path = new.clone();
            }
            paths.insert(new, ino);
        }
    }

    /// Number of known inodes
    pub fn len(&self) -> usize {
        self.tables.read().inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
