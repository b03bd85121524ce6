//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`EsdFs`].

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info, instrument};

use super::{AccessMask, Caller, EsdFs, INode, INodeType, OpenFlags, SetAttr, SetTime};
use crate::lower::LowerFs;

/// Convert an I/O error to the corresponding errno value for FUSE replies.
#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "ErrorKind is non_exhaustive; EIO is the safe default"
)]
fn io_to_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or_else(|| match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::AlreadyExists => libc::EEXIST,
        std::io::ErrorKind::InvalidInput => libc::EINVAL,
        _ => libc::EIO,
    })
}

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyEmpty,
    fuser::ReplyCreate,
    fuser::ReplyWrite,
    fuser::ReplyStatfs,
);

/// Extension trait on `Result<T, std::io::Error>` for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, std::io::Error> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(io_to_errno(&e));
            }
        }
    }
}

fn inode_type_to_fuser(itype: INodeType) -> fuser::FileType {
    match itype {
        INodeType::Directory => fuser::FileType::Directory,
        INodeType::Symlink => fuser::FileType::Symlink,
        INodeType::File => fuser::FileType::RegularFile,
        INodeType::NamedPipe => fuser::FileType::NamedPipe,
        INodeType::Socket => fuser::FileType::Socket,
        INodeType::CharDevice => fuser::FileType::CharDevice,
        INodeType::BlockDevice => fuser::FileType::BlockDevice,
    }
}

const BLOCK_SIZE: u32 = 4096;

/// Convert an `INode` to the fuser-specific `FileAttr`.
fn inode_to_fuser_attr(inode: &INode) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: inode.addr,
        size: inode.size,
        blocks: inode.blocks,
        atime: inode.atime,
        mtime: inode.mtime,
        ctime: inode.ctime,
        crtime: inode.ctime,
        kind: inode_type_to_fuser(inode.itype),
        perm: inode.permissions.bits(),
        nlink: inode.nlink,
        uid: inode.uid,
        gid: inode.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Attributes of a negative entry; inode 0 tells the kernel to cache the miss.
fn negative_attr() -> fuser::FileAttr {
    fuser::FileAttr {
        ino: 0,
        size: 0,
        blocks: 0,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: fuser::FileType::RegularFile,
        perm: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn set_time(time: Option<fuser::TimeOrNow>) -> Option<SetTime> {
    time.map(|t| match t {
        fuser::TimeOrNow::Now => SetTime::Now,
        fuser::TimeOrNow::SpecificTime(at) => SetTime::At(at),
    })
}

/// The `Groups:` line of a `/proc/<pid>/status` file.
fn parse_groups(status: &str) -> Option<Vec<u32>> {
    let line = status.lines().find_map(|l| l.strip_prefix("Groups:"))?;
    line.split_whitespace().map(|g| g.parse().ok()).collect()
}

/// FUSE requests carry no supplementary groups; read them from the requesting process.
fn supplementary_groups(pid: u32) -> Vec<u32> {
    let status = match std::fs::read_to_string(format!("/proc/{pid}/status")) {
        Ok(status) => status,
        Err(e) => {
            debug!(pid, error = %e, "caller groups unavailable");
            return Vec::new();
        }
    };
    parse_groups(&status).unwrap_or_else(|| {
        debug!(pid, "caller status has no usable groups line");
        Vec::new()
    })
}

fn caller(req: &fuser::Request<'_>) -> Caller {
    Caller {
        uid: req.uid(),
        gid: req.gid(),
        groups: supplementary_groups(req.pid()),
    }
}

/// Bridges an [`EsdFs`] to the [`fuser::Filesystem`] trait.
pub struct FuserAdapter<L: LowerFs> {
    fs: Arc<EsdFs<L>>,
}

impl<L: LowerFs> FuserAdapter<L> {
    // TODO: raise this once lookups and attribute changes push notify_inval_entry /
    // notify_inval_inode; until then a short TTL bounds how long re-derivation stays hidden.
    const SHAMEFUL_TTL: Duration = Duration::from_secs(1);

    /// Serve `fs` over FUSE.
    pub fn new(fs: Arc<EsdFs<L>>) -> Self {
        Self { fs }
    }
}

impl<L: LowerFs> fuser::Filesystem for FuserAdapter<L> {
    #[instrument(name = "FuserAdapter::init", skip(self, _req, _config))]
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        info!(options = %self.fs.options(), "session started");
        Ok(())
    }

    #[instrument(name = "FuserAdapter::destroy", skip(self))]
    fn destroy(&mut self) {
        info!(inodes = self.fs.cached_inodes(), "session ended");
    }

    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        match self.fs.lookup(parent, name) {
            Ok(inode) => {
                let f_attr = inode_to_fuser_attr(&inode);
                debug!(?f_attr, "replying...");
                reply.entry(&Self::SHAMEFUL_TTL, &f_attr, 0);
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                debug!("replying negative entry");
                reply.entry(&Self::SHAMEFUL_TTL, &negative_attr(), 0);
            }
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(io_to_errno(&e));
            }
        }
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.fs.forget(ino, nlookup);
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.fs.getattr(ino).fuse_reply(reply, |inode, reply| {
            let attr = inode_to_fuser_attr(&inode);
            debug!(?attr, "replying...");
            reply.attr(&Self::SHAMEFUL_TTL, &attr);
        });
    }

    #[instrument(
        name = "FuserAdapter::setattr",
        skip(self, req, _ctime, _fh, _crtime, _chgtime, _bkuptime, _flags, reply)
    )]
    fn setattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let change = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: set_time(atime),
            mtime: set_time(mtime),
        };
        self.fs
            .setattr(caller(req), ino, change)
            .fuse_reply(reply, |inode, reply| {
                let attr = inode_to_fuser_attr(&inode);
                debug!(?attr, "replying...");
                reply.attr(&Self::SHAMEFUL_TTL, &attr);
            });
    }

    #[instrument(name = "FuserAdapter::readlink", skip(self, _req, reply))]
    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        self.fs.readlink(ino).fuse_reply(reply, |target, reply| {
            debug!(?target, "replying...");
            reply.data(target.as_os_str().as_encoded_bytes());
        });
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, req, _umask, reply))]
    fn mkdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.fs
            .mkdir(caller(req), parent, name, mode)
            .fuse_reply(reply, |inode, reply| {
                let f_attr = inode_to_fuser_attr(&inode);
                debug!(?f_attr, "replying...");
                reply.entry(&Self::SHAMEFUL_TTL, &f_attr, 0);
            });
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, req, reply))]
    fn unlink(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs
            .unlink(caller(req), parent, name)
            .fuse_reply(reply, |(), reply| {
                debug!("replying ok");
                reply.ok();
            });
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, req, reply))]
    fn rmdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs
            .rmdir(caller(req), parent, name)
            .fuse_reply(reply, |(), reply| {
                debug!("replying ok");
                reply.ok();
            });
    }

    #[instrument(name = "FuserAdapter::rename", skip(self, req, reply))]
    fn rename(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs
            .rename(caller(req), parent, name, newparent, newname, flags)
            .fuse_reply(reply, |(), reply| {
                debug!("replying ok");
                reply.ok();
            });
    }

    #[instrument(name = "FuserAdapter::open", skip(self, req, flags, reply))]
    fn open(&mut self, req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags = OpenFlags::from_bits_truncate(flags);
        self.fs
            .open(caller(req), ino, flags)
            .fuse_reply(reply, |fh, reply| {
                debug!(handle = fh, "replying...");
                reply.opened(fh, 0);
            });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        self.fs
            .read(fh, offset.cast_unsigned(), size)
            .fuse_reply(reply, |data, reply| {
                debug!(read_bytes = data.len(), "replying...");
                reply.data(&data);
            });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, _req, _ino, data, _write_flags, _flags, _lock_owner, reply)
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        self.fs
            .write(fh, offset.cast_unsigned(), data)
            .fuse_reply(reply, |written, reply| {
                debug!(written, "replying...");
                reply.written(written);
            });
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, _ino, _lock_owner, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.flush(fh).fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::fsync", skip(self, _req, _ino, reply))]
    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs
            .fsync(fh, datasync)
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.release(fh).fuse_reply(reply, |(), reply| {
            debug!("replying ok");
            reply.ok();
        });
    }

    #[instrument(name = "FuserAdapter::opendir", skip(self, req, _flags, reply))]
    fn opendir(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        _flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        self.fs
            .opendir(caller(req), ino)
            .fuse_reply(reply, |fh, reply| {
                debug!(handle = fh, "replying...");
                reply.opened(fh, 0);
            });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _ino, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let mut overflow = false;
        let result = self.fs.readdir(fh, offset.cast_unsigned(), |entry, next| {
            let Ok(next) = i64::try_from(next) else {
                error!(next, "directory offset too large for fuser");
                overflow = true;
                return true;
            };
            debug!(name = ?entry.name, ino = entry.ino, "adding entry to reply...");
            let full = reply.add(entry.ino, next, inode_type_to_fuser(entry.itype), &entry.name);
            if full {
                debug!("buffer full for now, stopping readdir");
            }
            full
        });

        if let Err(e) = result {
            debug!(error = %e, "replying error");
            reply.error(io_to_errno(&e));
            return;
        }
        if overflow {
            reply.error(libc::EIO);
            return;
        }
        debug!("finalizing reply...");
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::releasedir", skip(self, _req, _ino, _flags, reply))]
    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.releasedir(fh).fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        self.fs.statfs().fuse_reply(reply, |stats, reply| {
            debug!(?stats, "replying...");
            reply.statfs(
                stats.total_blocks,
                stats.free_blocks,
                stats.available_blocks,
                stats.total_inodes,
                stats.free_inodes,
                stats.block_size,
                stats.max_filename_length,
                stats.fragment_size,
            );
        });
    }

    #[instrument(name = "FuserAdapter::access", skip(self, req, reply))]
    fn access(&mut self, req: &fuser::Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty) {
        let mask = AccessMask::from_bits_truncate(mask.cast_unsigned()) & AccessMask::RWX;
        self.fs
            .access(caller(req), ino, mask)
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::create", skip(self, req, _umask, flags, reply))]
    fn create(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let flags = OpenFlags::from_bits_truncate(flags);
        self.fs
            .create(caller(req), parent, name, mode, flags)
            .fuse_reply(reply, |(inode, fh), reply| {
                let f_attr = inode_to_fuser_attr(&inode);
                debug!(?f_attr, handle = fh, "replying...");
                reply.created(&Self::SHAMEFUL_TTL, &f_attr, 0, fh, 0);
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_files_keep_their_type() {
        for (itype, expected) in [
            (INodeType::NamedPipe, fuser::FileType::NamedPipe),
            (INodeType::Socket, fuser::FileType::Socket),
            (INodeType::CharDevice, fuser::FileType::CharDevice),
            (INodeType::BlockDevice, fuser::FileType::BlockDevice),
            (INodeType::File, fuser::FileType::RegularFile),
        ] {
            assert_eq!(inode_type_to_fuser(itype), expected);
        }
    }

    #[test]
    fn groups_come_from_the_status_file() {
        let status = "Name:\tcamera\nUid:\t10050\t10050\t10050\t10050\nGroups:\t1015 1028 3003 \nNgid:\t0\n";
        assert_eq!(parse_groups(status), Some(vec![1015, 1028, 3003]));
        assert_eq!(parse_groups("Groups:\t\n"), Some(vec![]));
        assert_eq!(parse_groups("Name:\tx\n"), None);
        assert_eq!(parse_groups("Groups:\tabc\n"), None);
    }

    #[test]
    fn own_groups_are_readable() {
        let groups = supplementary_groups(std::process::id());
        let expected: Vec<u32> = nix::unistd::getgroups()
            .unwrap()
            .into_iter()
            .map(|g| g.as_raw())
            .collect();
        assert_eq!(groups, expected);
    }
}
