//! The capability set the stacked filesystem needs from the filesystem underneath it.
//!
//! Every call takes an absolute lower path. Calls are made with the credential override already in
//! effect, so implementations simply act as the calling thread.

pub mod host;

pub use host::HostLower;

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;

use crate::cred::Identity;
use crate::fs::{AccessMask, FsStats, INodeType, OpenFlags, SetAttr};

/// Identity of a lower inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LowerId {
    /// Device the inode lives on.
    pub dev: u64,
    /// Inode number on that device.
    pub ino: u64,
}

/// Attributes of a lower inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowerAttr {
    /// Identity.
    pub id: LowerId,
    /// Raw `st_mode`, including type bits.
    pub mode: u32,
    /// Raw owner.
    pub uid: u32,
    /// Raw group.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Allocated 512-byte blocks.
    pub blocks: u64,
    /// Hard link count.
    pub nlink: u32,
    /// Last access time.
    pub atime: SystemTime,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last status change time.
    pub ctime: SystemTime,
}

impl LowerAttr {
    /// The kind of object.
    #[must_use]
    pub fn itype(&self) -> INodeType {
        INodeType::from_mode(self.mode)
    }

    /// Whether `who` may access this inode with `mask` under plain Unix mode rules.
    ///
    /// Root passes every read/write check and may execute anything with at least one execute bit
    /// set, or any directory.
    #[must_use]
    pub fn permits(&self, who: Identity, mask: AccessMask) -> bool {
        let mask = mask & AccessMask::RWX;
        if who.uid == 0 {
            return !mask.contains(AccessMask::EXEC)
                || self.itype() == INodeType::Directory
                || self.mode & 0o111 != 0;
        }
        let class = if who.uid == self.uid {
            (self.mode >> 6) & 0o7
        } else if who.gid == self.gid {
            (self.mode >> 3) & 0o7
        } else {
            self.mode & 0o7
        };
        AccessMask::from_bits_truncate(class).contains(mask)
    }
}

/// A lower directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerDirEntry {
    /// Entry name as stored.
    pub name: OsString,
    /// Lower inode number.
    pub ino: u64,
    /// The kind of object.
    pub itype: INodeType,
}

/// An open lower file.
pub trait LowerFile: Send + Sync + 'static {
    /// Read up to `size` bytes at `offset`.
    fn read_at(&self, offset: u64, size: u32) -> io::Result<Bytes>;

    /// Write `data` at `offset`, returning the number of bytes written.
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<u32>;

    /// Flush data (and metadata unless `datasync`) to stable storage.
    fn fsync(&self, datasync: bool) -> io::Result<()>;

    /// Attributes of the open file.
    fn getattr(&self) -> io::Result<LowerAttr>;
}

/// The filesystem underneath a stacked mount.
pub trait LowerFs: Send + Sync + 'static {
    /// Open file type.
    type File: LowerFile;

    /// Attributes of `path`, not following a trailing symlink.
    fn getattr(&self, path: &Path) -> io::Result<LowerAttr>;

    /// Entries of the directory at `path`, excluding `.` and `..`.
    fn readdir(&self, path: &Path) -> io::Result<Vec<LowerDirEntry>>;

    /// Create and open a regular file with exactly `mode` permission bits.
    fn create(&self, path: &Path, mode: u32, flags: OpenFlags) -> io::Result<Self::File>;

    /// Create a directory with exactly `mode` permission bits.
    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Remove a non-directory.
    fn unlink(&self, path: &Path) -> io::Result<()>;

    /// Remove an empty directory.
    fn rmdir(&self, path: &Path) -> io::Result<()>;

    /// Atomically rename `from` to `to`.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Open an existing file.
    fn open(&self, path: &Path, flags: OpenFlags) -> io::Result<Self::File>;

    /// Apply size and time changes.
    fn setattr(&self, path: &Path, attr: &SetAttr) -> io::Result<()>;

    /// Target of the symlink at `path`.
    fn readlink(&self, path: &Path) -> io::Result<PathBuf>;

    /// Statistics of the filesystem containing `path`.
    fn statfs(&self, path: &Path) -> io::Result<FsStats>;
}

/// Look `name` up in `dir`, falling back to an ASCII case-insensitive scan.
///
/// Returns the name as stored in the lower directory with its attributes.
pub fn lookup_nocase<L: LowerFs + ?Sized>(
    lower: &L,
    dir: &Path,
    name: &OsStr,
) -> io::Result<(OsString, LowerAttr)> {
    match lower.getattr(&dir.join(name)) {
        Ok(attr) => return Ok((name.to_os_string(), attr)),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
        Err(e) => return Err(e),
    }

    let found = lower
        .readdir(dir)?
        .into_iter()
        .find(|entry| entry.name.as_encoded_bytes().eq_ignore_ascii_case(name.as_encoded_bytes()))
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
    let attr = lower.getattr(&dir.join(&found.name))?;
    Ok((found.name, attr))
}
