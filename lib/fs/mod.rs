//! Useful filesystem generalizations.
/// Lower-directory entry cache keyed on case-folded names.
pub mod dentry;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`stacked::EsdFs`].
pub mod fuser;
/// Identity-mapped cache of stacked inodes.
pub mod icache;
/// The stacked filesystem: lookup, interposition, derivation and forwarding.
pub mod stacked;

pub use stacked::{Caller, EsdFs};

use std::ffi::OsString;
use std::time::SystemTime;

use bitflags::bitflags;

/// Type representing an inode identifier.
pub type InodeAddr = u64;

/// Type representing a file handle.
pub type FileHandle = u64;

/// The FUSE root inode address.
pub const ROOT_INO: InodeAddr = 1;

/// Inode number reported by `readdir` for entries that have not been looked up yet.
pub const UNKNOWN_INO: InodeAddr = 0xffff_ffff;

/// Filesystem-type identifier reported by `statfs`.
pub const ESDFS_SUPER_MAGIC: u32 = 0x00e5_d5f5;

bitflags! {
    /// Permission bits for an inode, similar to Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodePerms: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Sticky bit.
        const STICKY        = 1 << 9;
        /// Set-group-ID bit.
        const SETGID        = 1 << 10;
        /// Set-user-ID bit.
        const SETUID        = 1 << 11;

        /// Execute bits for every class.
        const ALL_EXECUTE = Self::OWNER_EXECUTE.bits()
            | Self::GROUP_EXECUTE.bits()
            | Self::OTHER_EXECUTE.bits();
    }
}

impl InodePerms {
    /// Build from the permission part of a raw `st_mode`, discarding type bits.
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "masked to the low 12 bits"
    )]
    pub fn from_mode(mode: u32) -> Self {
        Self::from_bits_truncate((mode & 0o7777) as u16)
    }
}

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;

        /// Synchronous writes.
        const SYNC = libc::O_SYNC;
        /// Synchronous data integrity writes.
        const DSYNC = libc::O_DSYNC;
        /// Do not follow symlinks.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Fail if not a directory.
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

impl OpenFlags {
    /// The access mask a caller must hold to open with these flags.
    #[must_use]
    pub fn access_mask(self) -> AccessMask {
        let mut mask = match self.bits() & libc::O_ACCMODE {
            libc::O_WRONLY => AccessMask::WRITE,
            libc::O_RDWR => AccessMask::READ | AccessMask::WRITE,
            _ => AccessMask::READ,
        };
        if self.contains(Self::TRUNC) {
            mask |= AccessMask::WRITE;
        }
        mask
    }

    /// Whether these flags request write access to the file.
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self.bits() & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR)
    }
}

bitflags! {
    /// Access request passed to permission checks, mirroring access(2) plus a create intent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessMask: u32 {
        /// Search or execute.
        const EXEC = 1;
        /// Modify contents.
        const WRITE = 2;
        /// Read contents.
        const READ = 4;
        /// A new entry is about to be created in the target directory.
        const CREATE = 1 << 8;

        /// The bits an underlying mode check understands.
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

impl AccessMask {
    /// Whether this request modifies the target.
    #[must_use]
    pub fn wants_write(self) -> bool {
        self.intersects(Self::WRITE | Self::CREATE)
    }
}

/// The type of an inode entry in the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum INodeType {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// A named pipe.
    NamedPipe,
    /// A Unix domain socket.
    Socket,
    /// A character device.
    CharDevice,
    /// A block device.
    BlockDevice,
}

impl INodeType {
    /// Classify a raw `st_mode`.
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => Self::Directory,
            libc::S_IFLNK => Self::Symlink,
            libc::S_IFIFO => Self::NamedPipe,
            libc::S_IFSOCK => Self::Socket,
            libc::S_IFCHR => Self::CharDevice,
            libc::S_IFBLK => Self::BlockDevice,
            _ => Self::File,
        }
    }
}

/// Attributes of a stacked inode as presented to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct INode {
    /// The address of this inode, which serves as its unique identifier.
    pub addr: InodeAddr,
    /// The derived permissions of this inode.
    pub permissions: InodePerms,
    /// The derived owner.
    pub uid: u32,
    /// The derived group.
    pub gid: u32,
    /// Size in bytes, copied up from the lower inode.
    pub size: u64,
    /// Allocated 512-byte blocks, copied up from the lower inode.
    pub blocks: u64,
    /// Hard link count, copied up from the lower inode.
    pub nlink: u32,
    /// Last access time.
    pub atime: SystemTime,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last status change time.
    pub ctime: SystemTime,
    /// The kind of object.
    pub itype: INodeType,
}

impl INode {
    /// Check if this inode is the root inode.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.addr == ROOT_INO
    }

    /// Whether `caller` may access the presented object with `mask`. Supplementary groups count
    /// for the group class.
    #[must_use]
    pub fn permits(&self, caller: &Caller, mask: AccessMask) -> bool {
        let mask = mask & AccessMask::RWX;
        let bits = u32::from(self.permissions.bits());
        if caller.uid == 0 {
            return !mask.contains(AccessMask::EXEC)
                || self.itype == INodeType::Directory
                || bits & 0o111 != 0;
        }
        let class = if caller.uid == self.uid {
            (bits >> 6) & 0o7
        } else if caller.in_group(self.gid) {
            (bits >> 3) & 0o7
        } else {
            bits & 0o7
        };
        AccessMask::from_bits_truncate(class).contains(mask)
    }
}

/// A directory entry yielded by [`EsdFs::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// The name of this entry within its parent directory.
    pub name: OsString,
    /// Stacked inode address if the entry has been interposed, otherwise an unknown marker.
    pub ino: InodeAddr,
    /// The kind of object.
    pub itype: INodeType,
}

/// Filesystem statistics returned by [`EsdFs::statfs`].
///
/// Block-related sizes are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem-type identifier.
    pub magic: u32,
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Fragment size (bytes).
    pub fragment_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Total number of file nodes (inodes).
    pub total_inodes: u64,
    /// Number of free file nodes.
    pub free_inodes: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}

/// A timestamp update carried by [`SetAttr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    /// Set to the current time.
    Now,
    /// Set to the given time.
    At(SystemTime),
}

impl SetTime {
    /// Resolve to a concrete time.
    #[must_use]
    pub fn resolve(self) -> SystemTime {
        match self {
            Self::Now => SystemTime::now(),
            Self::At(t) => t,
        }
    }
}

/// Attribute change request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttr {
    /// Requested mode.
    pub mode: Option<u32>,
    /// Requested owner.
    pub uid: Option<u32>,
    /// Requested group.
    pub gid: Option<u32>,
    /// Requested size.
    pub size: Option<u64>,
    /// Requested access time.
    pub atime: Option<SetTime>,
    /// Requested modification time.
    pub mtime: Option<SetTime>,
}

impl SetAttr {
    /// Drop ownership and mode changes; those are always derived, never set.
    #[must_use]
    pub fn without_ownership(self) -> Self {
        Self {
            mode: None,
            uid: None,
            gid: None,
            ..self
        }
    }

    /// Whether nothing is left to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_mode_keeps_special_types() {
        assert_eq!(INodeType::from_mode(libc::S_IFIFO | 0o644), INodeType::NamedPipe);
        assert_eq!(INodeType::from_mode(libc::S_IFSOCK | 0o755), INodeType::Socket);
        assert_eq!(INodeType::from_mode(libc::S_IFCHR), INodeType::CharDevice);
        assert_eq!(INodeType::from_mode(libc::S_IFBLK), INodeType::BlockDevice);
        assert_eq!(INodeType::from_mode(libc::S_IFREG | 0o600), INodeType::File);
    }

    #[test]
    fn any_group_of_the_caller_selects_the_group_class() {
        let now = SystemTime::now();
        let shown = INode {
            addr: 2,
            permissions: InodePerms::from_mode(0o770),
            uid: 0,
            gid: 1028,
            size: 0,
            blocks: 0,
            nlink: 2,
            atime: now,
            mtime: now,
            ctime: now,
            itype: INodeType::Directory,
        };
        let outsider = Caller {
            uid: 4242,
            gid: 4242,
            groups: vec![3003],
        };
        assert!(!shown.permits(&outsider, AccessMask::READ));

        let member = Caller {
            groups: vec![3003, 1028],
            ..outsider
        };
        assert!(member.in_group(1028));
        assert!(shown.permits(&member, AccessMask::READ | AccessMask::WRITE));
    }
}
