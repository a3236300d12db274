//! FUSE filesystem implementation
//!
//! Path mapping, staging and the encrypting core, plus the bridge that
//! serves them to the kernel through fuser.

pub mod attr;
pub mod core;
mod filesystem;
pub mod handle;
mod inode;
pub mod path;
pub mod staging;

pub use self::core::{CryptCore, DirEntry, FsStats, TimeUpdate};
pub use attr::{FileAttributes, NodeKind};
pub use filesystem::CipherFs;
pub use handle::{FileHandle, HandleTable};
pub use inode::{InodeTable, ROOT_INO};
pub use path::{is_staging_name, PathResolver};
pub use staging::StagingManager;

use crate::config::MountConfig;
use fuser::MountOption;

/// Name the mount shows up under in the mount table
pub const FS_NAME: &str = "cipherfs";

/// Translate the mount configuration into fuser mount options
///
/// Recognized `-o` strings map onto their typed options; anything else is
/// passed through verbatim.
pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(FS_NAME.to_string()),
        MountOption::DefaultPermissions,
    ];

    if config.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    if config.allow_root {
        options.push(MountOption::AllowRoot);
    }

    for raw in &config.fuse_options {
        let option = match raw.trim() {
            "" => continue,
            "allow_other" => MountOption::AllowOther,
            "allow_root" => MountOption::AllowRoot,
            "auto_unmount" => MountOption::AutoUnmount,
            "default_permissions" => MountOption::DefaultPermissions,
            "ro" => MountOption::RO,
            "rw" => MountOption::RW,
            "exec" => MountOption::Exec,
            "noexec" => MountOption::NoExec,
            "suid" => MountOption::Suid,
            "nosuid" => MountOption::NoSuid,
            "dev" => MountOption::Dev,
            "nodev" => MountOption::NoDev,
            "atime" => MountOption::Atime,
            "noatime" => MountOption::NoAtime,
            "sync" => MountOption::Sync,
            "async" => MountOption::Async,
            "dirsync" => MountOption::DirSync,
            other => MountOption::CUSTOM(other.to_string()),
        };
        if !options.contains(&option) {
            options.push(option);
        }
    }

    options
}
