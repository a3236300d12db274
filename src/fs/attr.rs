//! File attributes with plaintext size overlay

use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::time::{Duration, SystemTime};

/// File type as reported to the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<std::fs::FileType> for NodeKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_file() {
            NodeKind::RegularFile
        } else if ft.is_dir() {
            NodeKind::Directory
        } else if ft.is_symlink() {
            NodeKind::Symlink
        } else if ft.is_block_device() {
            NodeKind::BlockDevice
        } else if ft.is_char_device() {
            NodeKind::CharDevice
        } else if ft.is_fifo() {
            NodeKind::Fifo
        } else {
            NodeKind::Socket
        }
    }
}

impl NodeKind {
    pub fn to_fuser_type(self) -> fuser::FileType {
        match self {
            NodeKind::RegularFile => fuser::FileType::RegularFile,
            NodeKind::Directory => fuser::FileType::Directory,
            NodeKind::Symlink => fuser::FileType::Symlink,
            NodeKind::BlockDevice => fuser::FileType::BlockDevice,
            NodeKind::CharDevice => fuser::FileType::CharDevice,
            NodeKind::Fifo => fuser::FileType::NamedPipe,
            NodeKind::Socket => fuser::FileType::Socket,
        }
    }
}

/// Attributes of a backing file as exposed through the mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub kind: NodeKind,
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
}

impl FileAttributes {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            kind: NodeKind::from(meta.file_type()),
            ino: meta.ino(),
            size: meta.size(),
            blocks: meta.blocks(),
            blksize: meta.blksize() as u32,
            atime: to_system_time(meta.atime(), meta.atime_nsec()),
            mtime: to_system_time(meta.mtime(), meta.mtime_nsec()),
            ctime: to_system_time(meta.ctime(), meta.ctime_nsec()),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
        }
    }

    /// Replace size fields with those of the plaintext staging file
    ///
    /// Everything else (mode, ownership, timestamps) stays as the backing
    /// file reports it.
    pub fn overlay_plaintext(&mut self, plain: &Metadata) {
        self.size = plain.size();
        self.blksize = plain.blksize() as u32;
        self.blocks = plain.blocks();
    }

    /// Convert to fuser FileAttr under the given inode number
    pub fn to_fuser_attr(&self, ino: u64) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.ctime,
            kind: self.kind.to_fuser_type(),
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: self.blksize,
            flags: 0,
        }
    }
}

fn to_system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0)
    }
}
