//! A lower filesystem backed by a directory on the host.
use std::fs::{self, DirBuilder, File, FileTimes, Metadata, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt as _, DirEntryExt as _, FileExt as _, FileTypeExt as _};
use std::os::unix::fs::{MetadataExt as _, OpenOptionsExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use nix::sys::statvfs::statvfs;

use super::{LowerAttr, LowerDirEntry, LowerFile, LowerFs, LowerId};
use crate::fs::{ESDFS_SUPER_MAGIC, FsStats, INodeType, OpenFlags, SetAttr};

/// Open flags forwarded verbatim; access mode and creation flags are expressed through
/// [`OpenOptions`] instead.
const PASSTHROUGH_FLAGS: OpenFlags = OpenFlags::SYNC
    .union(OpenFlags::DSYNC)
    .union(OpenFlags::NOFOLLOW)
    .union(OpenFlags::DIRECTORY);

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nsecs.unsigned_abs());
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs.unsigned_abs()) + nanos
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

fn attr_from_metadata(meta: &Metadata) -> LowerAttr {
    LowerAttr {
        id: LowerId {
            dev: meta.dev(),
            ino: meta.ino(),
        },
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        blocks: meta.blocks(),
        nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
        atime: unix_time(meta.atime(), meta.atime_nsec()),
        mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
        ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
    }
}

fn itype_from_file_type(ft: fs::FileType) -> INodeType {
    if ft.is_dir() {
        INodeType::Directory
    } else if ft.is_symlink() {
        INodeType::Symlink
    } else if ft.is_fifo() {
        INodeType::NamedPipe
    } else if ft.is_socket() {
        INodeType::Socket
    } else if ft.is_char_device() {
        INodeType::CharDevice
    } else if ft.is_block_device() {
        INodeType::BlockDevice
    } else {
        INodeType::File
    }
}

/// An open host file.
#[derive(Debug)]
pub struct HostFile {
    file: File,
}

impl LowerFile for HostFile {
    fn read_at(&self, offset: u64, size: u32) -> io::Result<Bytes> {
        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            match self.file.read_at(&mut buffer[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        buffer.truncate(filled);
        Ok(Bytes::from(buffer))
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<u32> {
        self.file.write_all_at(data, offset)?;
        u32::try_from(data.len()).map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))
    }

    fn fsync(&self, datasync: bool) -> io::Result<()> {
        if datasync {
            self.file.sync_data()
        } else {
            self.file.sync_all()
        }
    }

    fn getattr(&self) -> io::Result<LowerAttr> {
        Ok(attr_from_metadata(&self.file.metadata()?))
    }
}

/// Host directory tree used as the lower filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostLower;

impl HostLower {
    /// Create a host lower filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl LowerFs for HostLower {
    type File = HostFile;

    fn getattr(&self, path: &Path) -> io::Result<LowerAttr> {
        Ok(attr_from_metadata(&fs::symlink_metadata(path)?))
    }

    fn readdir(&self, path: &Path) -> io::Result<Vec<LowerDirEntry>> {
        fs::read_dir(path)?
            .map(|entry| {
                let entry = entry?;
                Ok(LowerDirEntry {
                    ino: entry.ino(),
                    itype: itype_from_file_type(entry.file_type()?),
                    name: entry.file_name(),
                })
            })
            .collect()
    }

    fn create(&self, path: &Path, mode: u32, flags: OpenFlags) -> io::Result<HostFile> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).mode(mode);
        if flags.contains(OpenFlags::EXCL) {
            options.create_new(true);
        } else {
            options.create(true).truncate(flags.contains(OpenFlags::TRUNC));
        }
        let file = options
            .append(flags.contains(OpenFlags::APPEND))
            .custom_flags((flags & PASSTHROUGH_FLAGS).bits())
            .open(path)?;
        // The daemon's umask must not narrow the configured mode.
        file.set_permissions(Permissions::from_mode(mode))?;
        Ok(HostFile { file })
    }

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        DirBuilder::new().mode(mode).create(path)?;
        fs::set_permissions(path, Permissions::from_mode(mode))
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn rmdir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> io::Result<HostFile> {
        let file = OpenOptions::new()
            .read(!flags.is_writable() || flags.contains(OpenFlags::RDWR))
            .write(flags.is_writable() && !flags.contains(OpenFlags::APPEND))
            .append(flags.contains(OpenFlags::APPEND))
            .truncate(flags.contains(OpenFlags::TRUNC))
            .custom_flags((flags & PASSTHROUGH_FLAGS).bits())
            .open(path)?;
        Ok(HostFile { file })
    }

    fn setattr(&self, path: &Path, attr: &SetAttr) -> io::Result<()> {
        if let Some(size) = attr.size {
            OpenOptions::new().write(true).open(path)?.set_len(size)?;
        }
        if attr.atime.is_some() || attr.mtime.is_some() {
            let mut times = FileTimes::new();
            if let Some(atime) = attr.atime {
                times = times.set_accessed(atime.resolve());
            }
            if let Some(mtime) = attr.mtime {
                times = times.set_modified(mtime.resolve());
            }
            File::open(path)?.set_times(times)?;
        }
        Ok(())
    }

    fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    fn statfs(&self, path: &Path) -> io::Result<FsStats> {
        let stat = statvfs(path)?;

        Ok(FsStats {
            magic: ESDFS_SUPER_MAGIC,
            block_size: stat.block_size().try_into().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "block size too large to fit into u32",
                )
            })?,
            fragment_size: stat.fragment_size().try_into().unwrap_or(u32::MAX),
            #[allow(clippy::allow_attributes)]
            #[allow(clippy::useless_conversion)]
            total_blocks: u64::from(stat.blocks()),
            #[allow(clippy::allow_attributes)]
            #[allow(clippy::useless_conversion)]
            free_blocks: u64::from(stat.blocks_free()),
            #[allow(clippy::allow_attributes)]
            #[allow(clippy::useless_conversion)]
            available_blocks: u64::from(stat.blocks_available()),
            #[allow(clippy::allow_attributes)]
            #[allow(clippy::useless_conversion)]
            total_inodes: u64::from(stat.files()),
            #[allow(clippy::allow_attributes)]
            #[allow(clippy::useless_conversion)]
            free_inodes: u64::from(stat.files_free()),
            #[expect(
                clippy::cast_possible_truncation,
                reason = "max filename length always fits in u32"
            )]
            max_filename_length: stat.name_max() as u32,
        })
    }
}
