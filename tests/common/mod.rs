#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use esdfs::cred::Identity;
use esdfs::fs::{Caller, DirEntry, EsdFs, FsStats, INode, InodeAddr, OpenFlags, ROOT_INO, SetAttr};
use esdfs::lower::{HostLower, LowerAttr, LowerDirEntry, LowerFs};
use esdfs::pkgdb::PackageDb;
use tempfile::TempDir;

/// Presented owner used by every test mount.
pub const UPPER_UID: u32 = 0;

/// A mounted filesystem over a scratch lower directory.
///
/// The lower identity is the test process itself, so the credential override is a no-op and the
/// suite runs unprivileged.
pub struct Mounted<L: LowerFs = HostLower> {
    pub lower: TempDir,
    pub fs: EsdFs<L>,
    pub packages: Arc<PackageDb>,
}

impl<L: LowerFs> Mounted<L> {
    pub fn lower_path(&self, rel: &str) -> PathBuf {
        self.lower.path().join(rel)
    }

    /// Create `rel` and its parents in the lower directory.
    pub fn lower_mkdir(&self, rel: &str) {
        std::fs::create_dir_all(self.lower_path(rel)).unwrap();
    }

    /// Write a file in the lower directory, creating its parents.
    pub fn lower_write(&self, rel: &str, contents: &[u8]) {
        let path = self.lower_path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    /// Walk `rel` from the root one lookup at a time.
    pub fn resolve(&self, rel: &str) -> std::io::Result<INode> {
        let mut node = self.fs.getattr(ROOT_INO)?;
        for name in Path::new(rel).iter() {
            node = self.fs.lookup(node.addr, name)?;
        }
        Ok(node)
    }

    pub fn ino(&self, rel: &str) -> InodeAddr {
        self.resolve(rel).unwrap().addr
    }

    /// Complete listing of directory `ino`.
    pub fn list(&self, ino: InodeAddr) -> Vec<DirEntry> {
        let fh = self.fs.opendir(Caller::ROOT, ino).unwrap();
        let mut out = Vec::new();
        self.fs
            .readdir(fh, 0, |entry, _| {
                out.push(entry.clone());
                false
            })
            .unwrap();
        self.fs.releasedir(fh).unwrap();
        out
    }

    pub fn names(&self, ino: InodeAddr) -> Vec<String> {
        self.list(ino)
            .into_iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect()
    }

    /// Feed a complete package list.
    pub fn push_packages(&self, list: &str) {
        let text = format!("{}\n\n", list.trim_end());
        self.packages.ingest(text.as_bytes()).unwrap().unwrap();
    }
}

/// Mount a fresh scratch directory with `extra` appended to the base options.
pub fn mount_with(extra: &str, setup: impl FnOnce(&Path)) -> Mounted {
    mount_over(HostLower::new(), extra, setup)
}

/// Like [`mount_with`], reaching the scratch directory through `lower_fs`.
pub fn mount_over<L: LowerFs>(lower_fs: L, extra: &str, setup: impl FnOnce(&Path)) -> Mounted<L> {
    let lower = tempfile::tempdir().unwrap();
    setup(lower.path());
    let me = Identity::current();
    let opts = format!(
        "lower={}:{}:0664:0775,upper={UPPER_UID}:{}:0664:0775,{extra}",
        me.uid, me.gid, me.gid
    );
    let packages = Arc::new(PackageDb::new());
    let fs = EsdFs::mount(
        lower_fs,
        lower.path(),
        opts.parse().unwrap(),
        Arc::clone(&packages),
    )
    .unwrap();
    Mounted {
        lower,
        fs,
        packages,
    }
}

pub fn mount(extra: &str) -> Mounted {
    mount_with(extra, |_| {})
}

pub fn name(s: &str) -> &OsStr {
    OsStr::new(s)
}

pub fn errno(result: std::io::Result<impl std::fmt::Debug>) -> i32 {
    result.unwrap_err().raw_os_error().unwrap()
}

/// Permission bits of a lower path.
pub fn lower_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

/// The host filesystem with injected misbehavior.
#[derive(Default)]
pub struct FaultyLower {
    pub inner: HostLower,
    /// Entries with this name report a different device, as if another filesystem were
    /// mounted there.
    pub foreign: Option<OsString>,
    /// Unlink removes the file and then reports `EBUSY`, as a network filesystem does after a
    /// silly rename.
    pub busy_unlink: bool,
}

impl LowerFs for FaultyLower {
    type File = <HostLower as LowerFs>::File;

    fn getattr(&self, path: &Path) -> io::Result<LowerAttr> {
        let mut attr = self.inner.getattr(path)?;
        if self.foreign.is_some() && path.file_name() == self.foreign.as_deref() {
            attr.id.dev = attr.id.dev.wrapping_add(1);
        }
        Ok(attr)
    }

    fn readdir(&self, path: &Path) -> io::Result<Vec<LowerDirEntry>> {
        self.inner.readdir(path)
    }

    fn create(&self, path: &Path, mode: u32, flags: OpenFlags) -> io::Result<Self::File> {
        self.inner.create(path, mode, flags)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.inner.mkdir(path, mode)
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        self.inner.unlink(path)?;
        if self.busy_unlink {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        Ok(())
    }

    fn rmdir(&self, path: &Path) -> io::Result<()> {
        self.inner.rmdir(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to)
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> io::Result<Self::File> {
        self.inner.open(path, flags)
    }

    fn setattr(&self, path: &Path, attr: &SetAttr) -> io::Result<()> {
        self.inner.setattr(path, attr)
    }

    fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        self.inner.readlink(path)
    }

    fn statfs(&self, path: &Path) -> io::Result<FsStats> {
        self.inner.statfs(path)
    }
}
