//! The stacked filesystem.
//!
//! [`EsdFs`] shadows every lower object it hands out with a [`StackedInode`], presents it with
//! derived ownership and permissions, redirects the shared `obb` directory through the
//! [`LinkEngine`], and forwards everything else to the lower filesystem while acting as the
//! mount's lower identity.
//!
//! All operations are synchronous and run on the calling thread; the credential override is
//! per-thread.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use super::dentry::{EntryCache, LinkState, StackedEntry};
use super::icache::{InodeCache, Location, StackedInode, Stamp};
use super::{
    AccessMask, DirEntry, FileHandle, FsStats, INode, INodeType, InodeAddr, OpenFlags, ROOT_INO,
    SetAttr, UNKNOWN_INO,
};
use crate::cred::with_overridden_identity;
use crate::derive::access::{WriteTarget, check_write};
use crate::derive::{Derived, TreeClass, apply_mode, derive, name_is};
use crate::drop_ward::{DropWard, StatelessDrop};
use crate::link::LinkEngine;
use crate::lower::{LowerAttr, LowerDirEntry, LowerFile as _, LowerFs, LowerId, lookup_nocase};
use crate::options::MountOptions;
use crate::pkgdb::{PackageDb, PackageSnapshot};
use crate::sync::atomic::{AtomicU64, Ordering};

/// Names refused directly under a storage root.
const SECURE_NAMES: [&str; 3] = [".android_secure", "android_secure", "autorun.inf"];

/// Marker keeping media scanners out of app-private trees.
const NOMEDIA: &str = ".nomedia";

/// Deepest chain of stale ancestors re-derived in one go.
const MAX_DERIVE_DEPTH: usize = 4096;

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn is_errno(e: &io::Error, code: i32) -> bool {
    e.raw_os_error() == Some(code)
}

fn is_secure_name(parent: Derived, name: &OsStr) -> bool {
    matches!(parent.tree, TreeClass::Root | TreeClass::RootLegacy)
        && SECURE_NAMES.iter().any(|secure| name_is(name, secure))
}

/// Identity a request arrived with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caller {
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
    /// Supplementary groups.
    pub groups: Vec<u32>,
}

impl Caller {
    /// The superuser.
    pub const ROOT: Self = Self {
        uid: 0,
        gid: 0,
        groups: Vec::new(),
    };

    /// Whether `gid` is the caller's primary or one of its supplementary groups.
    #[must_use]
    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// What an inode's last lookup count releases.
struct EvictCtx {
    inodes: Arc<InodeCache>,
    entries: Arc<EntryCache>,
}

struct InodeEvict;

impl StatelessDrop<EvictCtx, InodeAddr> for InodeEvict {
    fn delete(ctx: &EvictCtx, addr: &InodeAddr) {
        ctx.entries.evict(*addr);
        ctx.inodes.evict(*addr);
    }
}

struct OpenFile<F> {
    ino: InodeAddr,
    file: Arc<F>,
}

/// Where a lookup really happens.
struct Redirect {
    dir: Arc<StackedInode>,
    link: LinkState,
    stub_missing: bool,
}

fn lock_pair<'a>(
    a: &'a StackedInode,
    b: &'a StackedInode,
) -> (
    parking_lot::MutexGuard<'a, ()>,
    Option<parking_lot::MutexGuard<'a, ()>>,
) {
    if a.addr == b.addr {
        (a.lock_dir(), None)
    } else if a.addr < b.addr {
        let first = a.lock_dir();
        (first, Some(b.lock_dir()))
    } else {
        let first = b.lock_dir();
        (first, Some(a.lock_dir()))
    }
}

/// One mounted stacked filesystem over a lower directory.
pub struct EsdFs<L: LowerFs> {
    lower: L,
    options: MountOptions,
    packages: Arc<PackageDb>,
    link: LinkEngine,
    root_dev: u64,
    root_derived: Derived,
    inodes: Arc<InodeCache>,
    entries: Arc<EntryCache>,
    ward: parking_lot::Mutex<DropWard<EvictCtx, InodeAddr, InodeEvict>>,
    files: scc::HashMap<FileHandle, OpenFile<L::File>>,
    dirs: scc::HashMap<FileHandle, Arc<[DirEntry]>>,
    next_fh: AtomicU64,
    /// Namespace lock. A rename holds it exclusively from the lower move until every cached
    /// location is updated; operations resolving lower paths hold it shared.
    namespace: parking_lot::RwLock<()>,
    /// Bumped on every directory rename; part of every derivation stamp.
    epoch: AtomicU64,
}

impl<L: LowerFs> EsdFs<L> {
    /// Stack a filesystem over the lower directory at `root`.
    pub fn mount(
        lower: L,
        root: impl Into<PathBuf>,
        options: MountOptions,
        packages: Arc<PackageDb>,
    ) -> io::Result<Self> {
        let root = root.into();
        let root_attr = with_overridden_identity(
            options.lower.identity(),
            options.label.as_deref(),
            || lower.getattr(&root),
        )?;
        if root_attr.itype() != INodeType::Directory {
            return Err(errno(libc::ENOTDIR));
        }

        let root_derived = Derived::root(options.root_class());
        let inodes = Arc::new(InodeCache::new(root.clone(), root_attr, root_derived));
        let entries = Arc::new(EntryCache::new());
        let link = LinkEngine::new(&options);
        if options.legacy() {
            // The legacy layout keeps the shared tree directly under the root.
            link.pin(ROOT_INO);
        }

        info!(lower = %root.display(), %options, "mounted");
        Ok(Self {
            ward: parking_lot::Mutex::new(DropWard::new(EvictCtx {
                inodes: Arc::clone(&inodes),
                entries: Arc::clone(&entries),
            })),
            lower,
            options,
            packages,
            link,
            root_dev: root_attr.id.dev,
            root_derived,
            inodes,
            entries,
            files: scc::HashMap::new(),
            dirs: scc::HashMap::new(),
            next_fh: AtomicU64::new(1),
            namespace: parking_lot::RwLock::new(()),
            epoch: AtomicU64::new(0),
        })
    }

    /// Options this filesystem was mounted with.
    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// The package database consulted for derivation and write checks.
    #[must_use]
    pub fn packages(&self) -> &Arc<PackageDb> {
        &self.packages
    }

    /// The pinned link source, once known.
    #[must_use]
    pub fn link_source(&self) -> Option<InodeAddr> {
        self.link.source()
    }

    /// Number of stacked inodes alive, the root included.
    #[must_use]
    pub fn cached_inodes(&self) -> usize {
        self.inodes.len()
    }

    /// Outstanding lookup count of `ino`.
    #[must_use]
    pub fn lookup_count(&self, ino: InodeAddr) -> usize {
        self.ward.lock().count(&ino)
    }

    fn as_lower<T>(&self, f: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
        with_overridden_identity(
            self.options.lower.identity(),
            self.options.label.as_deref(),
            f,
        )
    }

    /// Shared hold on the namespace; nests inside an operation already holding it.
    fn paths_stable(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.namespace.read_recursive()
    }

    fn inode(&self, addr: InodeAddr) -> io::Result<Arc<StackedInode>> {
        self.inodes.get(addr).ok_or_else(|| {
            debug!(addr, "inode not in table");
            errno(libc::ENOENT)
        })
    }

    fn stamp(&self, snapshot: &PackageSnapshot) -> Stamp {
        Stamp {
            packages: snapshot.version(),
            epoch: self.epoch.load(Ordering::Acquire),
        }
    }

    /// An inode reached through a link that can now be completed must be looked up again.
    fn check_stale(&self, inode: &StackedInode) -> io::Result<()> {
        if inode.link_pending() && self.link.source().is_some() {
            debug!(addr = inode.addr, "unresolved link entry is stale");
            return Err(errno(libc::ESTALE));
        }
        Ok(())
    }

    /// Current derivation of `inode`, recomputed along its natural ancestry when stale.
    fn derived(&self, inode: &Arc<StackedInode>) -> io::Result<Derived> {
        if inode.addr == ROOT_INO {
            return Ok(self.root_derived);
        }
        let snapshot = self.packages.snapshot();
        let stamp = self.stamp(&snapshot);
        if let Some(derived) = inode.fresh_derived(stamp) {
            return Ok(derived);
        }

        let mut chain: Vec<(Arc<StackedInode>, OsString)> = Vec::new();
        let mut cursor = Arc::clone(inode);
        let base = loop {
            if chain.len() >= MAX_DERIVE_DEPTH {
                return Err(errno(libc::ELOOP));
            }
            let natural = cursor.natural().ok_or_else(|| errno(libc::ESTALE))?;
            let parent = self
                .inodes
                .get(natural.parent)
                .ok_or_else(|| errno(libc::ESTALE))?;
            chain.push((cursor, natural.name));
            if parent.addr == ROOT_INO {
                break self.root_derived;
            }
            if let Some(derived) = parent.fresh_derived(stamp) {
                break derived;
            }
            cursor = parent;
        };

        let restricted = self.options.restricted();
        let mut derived = base;
        for (node, name) in chain.into_iter().rev() {
            derived = derive(derived, &name, restricted, &snapshot);
            node.set_derived(derived, stamp);
        }
        Ok(derived)
    }

    fn project(&self, inode: &StackedInode, derived: Derived) -> INode {
        let attr = inode.attr();
        let shown = apply_mode(derived, &self.options.upper, inode.itype);
        INode {
            addr: inode.addr,
            permissions: shown.perms,
            uid: shown.uid,
            gid: shown.gid,
            size: attr.size,
            blocks: attr.blocks,
            nlink: attr.nlink,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            itype: inode.itype,
        }
    }

    fn present(&self, inode: &Arc<StackedInode>) -> io::Result<INode> {
        let derived = self.derived(inode)?;
        Ok(self.project(inode, derived))
    }

    /// Presented mode check, then the lower inode's own check as the lower identity, then the
    /// package write policy on confined mounts.
    fn permission(
        &self,
        caller: &Caller,
        inode: &StackedInode,
        derived: Derived,
        mask: AccessMask,
    ) -> io::Result<()> {
        let shown = self.project(inode, derived);
        if !shown.permits(caller, mask) {
            debug!(addr = inode.addr, ?mask, "presented mode denies access");
            return Err(errno(libc::EACCES));
        }
        if !inode.attr().permits(self.options.lower.identity(), mask) {
            debug!(addr = inode.addr, ?mask, "lower mode denies access");
            return Err(errno(libc::EACCES));
        }
        if self.options.confined() && mask.wants_write() {
            let target = WriteTarget {
                tree: derived.tree,
                owner: shown.uid,
                is_root: inode.addr == ROOT_INO,
            };
            let snapshot = self.packages.snapshot();
            if !check_write(target, mask, caller.uid, self.options.restricted(), &snapshot) {
                debug!(addr = inode.addr, uid = caller.uid, "write policy denies access");
                return Err(errno(libc::EACCES));
            }
        }
        Ok(())
    }

    /// Look `name` up in the lower directory at `dir`, mapping `ENOENT` to `None`.
    fn probe(&self, dir: &Path, name: &OsStr) -> io::Result<Option<(OsString, LowerAttr)>> {
        match self.as_lower(|| lookup_nocase(&self.lower, dir, name)) {
            Ok(found) => Ok(Some(found)),
            Err(e) if is_errno(&e, libc::ENOENT) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn redirect(
        &self,
        parent: &Arc<StackedInode>,
        parent_path: &Path,
        parent_derived: Derived,
        name: &OsStr,
    ) -> io::Result<Redirect> {
        if !self.link.should_link(parent_derived, name) {
            return Ok(Redirect {
                dir: Arc::clone(parent),
                link: LinkState::natural(),
                stub_missing: false,
            });
        }

        let natural = self.probe(parent_path, name)?;
        let stub_missing = natural.is_none();
        let stub = natural.map_or_else(|| name.to_os_string(), |(stub, _)| stub);
        match self.link.source().and_then(|src| self.inodes.get(src)) {
            Some(source) => {
                debug!(source = source.addr, "redirecting lookup to link source");
                let link = LinkState::linked(stub, source.addr);
                Ok(Redirect {
                    dir: source,
                    link,
                    stub_missing,
                })
            }
            None => Ok(Redirect {
                dir: Arc::clone(parent),
                link: LinkState::unresolved(stub),
                stub_missing: false,
            }),
        }
    }

    /// The directory namespace changes to `name` under `parent` really apply to.
    ///
    /// Returns the real parent and, for a redirected name, the stub at the natural location.
    fn locate(
        &self,
        parent: &Arc<StackedInode>,
        parent_derived: Derived,
        name: &OsStr,
    ) -> io::Result<(Arc<StackedInode>, Option<OsString>)> {
        if !self.link.should_link(parent_derived, name) {
            return Ok((Arc::clone(parent), None));
        }
        let source = self
            .link
            .source()
            .and_then(|src| self.inodes.get(src))
            .ok_or_else(|| errno(libc::ESTALE))?;
        let stub = self
            .entries
            .lookup(parent.addr, name)
            .and_then(|entry| entry.link().stub().map(OsStr::to_os_string))
            .unwrap_or_else(|| name.to_os_string());
        Ok((source, Some(stub)))
    }

    fn ensure_stub(&self, parent: InodeAddr, stub: &OsStr) {
        let path = match self.inodes.lower_path(parent) {
            Ok(dir) => dir.join(stub),
            Err(e) => {
                debug!(error = %e, "natural parent gone, skipping link stub");
                return;
            }
        };
        match self.as_lower(|| self.lower.mkdir(&path, self.options.lower.dmode)) {
            Ok(()) => debug!(path = %path.display(), "created link stub"),
            Err(e) if is_errno(&e, libc::EEXIST) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to create link stub"),
        }
    }

    fn remove_stub(&self, parent: InodeAddr, stub: &OsStr) {
        let Ok(dir) = self.inodes.lower_path(parent) else {
            return;
        };
        let path = dir.join(stub);
        if let Err(e) = self.as_lower(|| self.lower.rmdir(&path)) {
            debug!(path = %path.display(), error = %e, "link stub not removed");
        }
    }

    /// Resolve `name` under `parent` in the lower filesystem and interpose the result.
    ///
    /// Adds one lookup reference to the returned inode.
    fn resolve_child(
        &self,
        parent: &Arc<StackedInode>,
        parent_derived: Derived,
        name: &OsStr,
    ) -> io::Result<Arc<StackedInode>> {
        let parent_path = self.inodes.lower_path(parent.addr)?;
        let redirect = self.redirect(parent, &parent_path, parent_derived, name)?;
        let real_path = if redirect.dir.addr == parent.addr {
            parent_path
        } else {
            self.inodes.lower_path(redirect.dir.addr)?
        };

        let (lower_name, attr) = self.as_lower(|| lookup_nocase(&self.lower, &real_path, name))?;
        if attr.id.dev != self.root_dev {
            warn!(name = ?lower_name, dev = attr.id.dev, "lower lookup crossed a mount point");
            return Err(errno(libc::EXDEV));
        }

        let snapshot = self.packages.snapshot();
        let stamp = self.stamp(&snapshot);
        let derived = derive(
            parent_derived,
            &lower_name,
            self.options.restricted(),
            &snapshot,
        );

        let inode = {
            let mut ward = self.ward.lock();
            let (inode, _) = self.inodes.interpose(
                attr,
                Location::new(redirect.dir.addr, lower_name.clone()),
                Location::new(parent.addr, lower_name.clone()),
                derived,
                stamp,
            );
            inode.set_derived(derived, stamp);
            inode.set_link_pending(redirect.link.is_pending());
            ward.inc(inode.addr);
            self.entries.insert(
                parent.addr,
                StackedEntry::new(inode.addr, lower_name.clone(), redirect.link.clone()),
            );
            inode
        };

        if redirect.stub_missing
            && let Some(stub) = redirect.link.stub()
        {
            self.ensure_stub(parent.addr, stub);
        }
        let is_dir = inode.itype == INodeType::Directory;
        if self
            .link
            .offer_source(parent_derived, &lower_name, inode.addr, is_dir)
        {
            self.ward.lock().inc(inode.addr);
            info!(addr = inode.addr, "pinned link source");
        }
        Ok(inode)
    }

    /// Reuse a cached entry if it still names the same lower object.
    fn revalidate(
        &self,
        parent: &StackedInode,
        name: &OsStr,
    ) -> io::Result<Option<Arc<StackedInode>>> {
        let Some(entry) = self.entries.lookup(parent.addr, name) else {
            return Ok(None);
        };
        if entry.link().is_pending() && self.link.source().is_some() {
            debug!(ino = entry.ino, "dropping unresolved link entry");
            self.entries.remove(parent.addr, name);
            return Ok(None);
        }
        let Some(inode) = self.inodes.get(entry.ino) else {
            return Ok(None);
        };
        let Ok(path) = self.inodes.lower_path(inode.addr) else {
            return Ok(None);
        };
        match self.as_lower(|| self.lower.getattr(&path)) {
            Ok(attr) if attr.id == inode.lower_id && attr.itype() == inode.itype => {
                inode.set_attr(attr);
            }
            Ok(_) => {
                self.entries.remove(parent.addr, name);
                return Ok(None);
            }
            Err(e) if is_errno(&e, libc::ENOENT) => {
                self.entries.remove(parent.addr, name);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let mut ward = self.ward.lock();
        if self.inodes.get(inode.addr).is_none() {
            return Ok(None);
        }
        ward.inc(inode.addr);
        Ok(Some(inode))
    }

    /// Resolve the parent of a namespace change and check the caller may make it.
    fn dir_for_change(
        &self,
        caller: &Caller,
        parent: InodeAddr,
        name: &OsStr,
        mask: AccessMask,
    ) -> io::Result<(Arc<StackedInode>, Derived)> {
        let dir = self.inode(parent)?;
        if dir.itype != INodeType::Directory {
            return Err(errno(libc::ENOTDIR));
        }
        self.check_stale(&dir)?;
        let derived = self.derived(&dir)?;
        if is_secure_name(derived, name) {
            return Err(errno(libc::EACCES));
        }
        self.permission(caller, &dir, derived, mask)?;
        Ok((dir, derived))
    }

    /// Drop cached names of a removed object and stop mapping its identity once it is gone.
    fn forget_removed(
        &self,
        natural: InodeAddr,
        real: InodeAddr,
        name: &OsStr,
        attr: LowerAttr,
    ) {
        self.entries.remove(natural, name);
        if real != natural {
            self.entries.remove(real, name);
        }
        if (attr.nlink <= 1 || attr.itype() == INodeType::Directory)
            && let Some(addr) = self.inodes.addr_of(attr.id)
        {
            self.inodes.unhash(addr);
        }
    }

    fn is_ancestor(&self, ancestor: InodeAddr, mut node: InodeAddr) -> bool {
        for _ in 0..MAX_DERIVE_DEPTH {
            if node == ancestor {
                return true;
            }
            if node == ROOT_INO {
                return false;
            }
            match self.inodes.get(node).and_then(|inode| inode.location()) {
                Some(location) => node = location.parent,
                None => return false,
            }
        }
        false
    }

    fn create_nomedia(&self, dir: &StackedInode) {
        let path = match self.inodes.lower_path(dir.addr) {
            Ok(path) => path.join(NOMEDIA),
            Err(e) => {
                warn!(addr = dir.addr, error = %e, "cannot locate new directory for .nomedia");
                return;
            }
        };
        let flags = OpenFlags::WRONLY | OpenFlags::CREAT;
        match self.as_lower(|| self.lower.create(&path, self.options.lower.fmode, flags)) {
            Ok(_) => debug!(path = %path.display(), "created .nomedia"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to create .nomedia"),
        }
    }

    fn register(&self, ino: InodeAddr, file: L::File) -> FileHandle {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let open = OpenFile {
            ino,
            file: Arc::new(file),
        };
        if self.files.insert_sync(fh, open).is_err() {
            unreachable!("file handle {fh} handed out twice");
        }
        fh
    }

    fn file(&self, fh: FileHandle) -> io::Result<(InodeAddr, Arc<L::File>)> {
        self.files
            .read_sync(&fh, |_, open| (open.ino, Arc::clone(&open.file)))
            .ok_or_else(|| errno(libc::EBADF))
    }

    fn entry_hint(&self, parent: InodeAddr, entry: &LowerDirEntry) -> InodeAddr {
        self.entries
            .lookup(parent, &entry.name)
            .map(|cached| cached.ino)
            .or_else(|| {
                self.inodes.addr_of(LowerId {
                    dev: self.root_dev,
                    ino: entry.ino,
                })
            })
            .unwrap_or(UNKNOWN_INO)
    }

    /// Resolve `name` in directory `parent`.
    ///
    /// Every successful call adds one lookup reference, released through [`Self::forget`].
    #[instrument(name = "EsdFs::lookup", skip(self))]
    pub fn lookup(&self, parent: InodeAddr, name: &OsStr) -> io::Result<INode> {
        let _paths = self.paths_stable();
        let dir = self.inode(parent)?;
        if dir.itype != INodeType::Directory {
            return Err(errno(libc::ENOTDIR));
        }
        self.check_stale(&dir)?;
        let parent_derived = self.derived(&dir)?;
        if is_secure_name(parent_derived, name) {
            debug!("denying security-sensitive name");
            return Err(errno(libc::EACCES));
        }

        let inode = match self.revalidate(&dir, name)? {
            Some(inode) => inode,
            None => self.resolve_child(&dir, parent_derived, name)?,
        };
        self.present(&inode)
    }

    /// Release `nlookup` lookup references of `ino`, evicting it at zero.
    #[instrument(name = "EsdFs::forget", skip(self))]
    pub fn forget(&self, ino: InodeAddr, nlookup: u64) {
        let count = usize::try_from(nlookup).unwrap_or(usize::MAX);
        if self.ward.lock().dec_count(&ino, count) == Some(0) {
            debug!(ino, "inode evicted");
        }
    }

    /// Current attributes of `ino`, copied up from the lower inode and re-derived.
    #[instrument(name = "EsdFs::getattr", skip(self))]
    pub fn getattr(&self, ino: InodeAddr) -> io::Result<INode> {
        let _paths = self.paths_stable();
        let inode = self.inode(ino)?;
        self.check_stale(&inode)?;
        let path = self.inodes.lower_path(ino)?;
        let attr = self.as_lower(|| self.lower.getattr(&path))?;
        inode.set_attr(attr);
        self.present(&inode)
    }

    /// Apply size and time changes; ownership and mode requests are dropped.
    #[instrument(name = "EsdFs::setattr", skip(self))]
    pub fn setattr(&self, caller: Caller, ino: InodeAddr, attr: SetAttr) -> io::Result<INode> {
        let _paths = self.paths_stable();
        let inode = self.inode(ino)?;
        self.check_stale(&inode)?;
        let applied = attr.without_ownership();
        if applied != attr {
            debug!("dropping ownership and mode changes");
        }
        if applied.size.is_some() {
            if inode.itype == INodeType::Directory {
                return Err(errno(libc::EISDIR));
            }
            let derived = self.derived(&inode)?;
            self.permission(&caller, &inode, derived, AccessMask::WRITE)?;
        }
        if !applied.is_empty() {
            let path = self.inodes.lower_path(ino)?;
            self.as_lower(|| self.lower.setattr(&path, &applied))?;
        }
        self.getattr(ino)
    }

    /// Check whether `caller` may access `ino` with `mask`.
    #[instrument(name = "EsdFs::access", skip(self))]
    pub fn access(&self, caller: Caller, ino: InodeAddr, mask: AccessMask) -> io::Result<()> {
        let _paths = self.paths_stable();
        let inode = self.inode(ino)?;
        self.check_stale(&inode)?;
        let derived = self.derived(&inode)?;
        self.permission(&caller, &inode, derived, mask)
    }

    /// Target of the symlink `ino`.
    #[instrument(name = "EsdFs::readlink", skip(self))]
    pub fn readlink(&self, ino: InodeAddr) -> io::Result<PathBuf> {
        let _paths = self.paths_stable();
        let inode = self.inode(ino)?;
        if inode.itype != INodeType::Symlink {
            return Err(errno(libc::EINVAL));
        }
        let path = self.inodes.lower_path(ino)?;
        self.as_lower(|| self.lower.readlink(&path))
    }

    /// Create directory `name` in `parent`.
    ///
    /// The lower directory always gets the configured lower directory mode; `mode` is ignored.
    #[instrument(name = "EsdFs::mkdir", skip(self))]
    pub fn mkdir(
        &self,
        caller: Caller,
        parent: InodeAddr,
        name: &OsStr,
        mode: u32,
    ) -> io::Result<INode> {
        let _paths = self.paths_stable();
        let create = AccessMask::WRITE | AccessMask::EXEC | AccessMask::CREATE;
        let (dir, parent_derived) = self.dir_for_change(&caller, parent, name, create)?;
        let (real, _) = self.locate(&dir, parent_derived, name)?;
        {
            let _guard = real.lock_dir();
            let real_path = self.inodes.lower_path(real.addr)?;
            if self.probe(&real_path, name)?.is_some() {
                return Err(errno(libc::EEXIST));
            }
            let path = real_path.join(name);
            self.as_lower(|| self.lower.mkdir(&path, self.options.lower.dmode))?;
        }

        let inode = self.resolve_child(&dir, parent_derived, name)?;
        let derived = self.derived(&inode)?;
        if matches!(derived.tree, TreeClass::AndroidData | TreeClass::AndroidObb)
            && !inode.link_pending()
        {
            self.create_nomedia(&inode);
        }
        self.present(&inode)
    }

    /// Create and open regular file `name` in `parent`.
    ///
    /// The lower file always gets the configured lower file mode; `mode` only selects the type.
    #[instrument(name = "EsdFs::create", skip(self))]
    pub fn create(
        &self,
        caller: Caller,
        parent: InodeAddr,
        name: &OsStr,
        mode: u32,
        flags: OpenFlags,
    ) -> io::Result<(INode, FileHandle)> {
        let _paths = self.paths_stable();
        let kind = mode & libc::S_IFMT;
        if kind != 0 && kind != libc::S_IFREG {
            return Err(errno(libc::EINVAL));
        }
        let create = AccessMask::WRITE | AccessMask::EXEC | AccessMask::CREATE;
        let (dir, parent_derived) = self.dir_for_change(&caller, parent, name, create)?;
        let (real, _) = self.locate(&dir, parent_derived, name)?;
        let file = {
            let _guard = real.lock_dir();
            let real_path = self.inodes.lower_path(real.addr)?;
            let target = match self.probe(&real_path, name)? {
                Some(_) if flags.contains(OpenFlags::EXCL) => return Err(errno(libc::EEXIST)),
                Some((existing, _)) => existing,
                None => name.to_os_string(),
            };
            let path = real_path.join(target);
            self.as_lower(|| self.lower.create(&path, self.options.lower.fmode, flags))?
        };

        let inode = self.resolve_child(&dir, parent_derived, name)?;
        let fh = self.register(inode.addr, file);
        Ok((self.present(&inode)?, fh))
    }

    /// Remove non-directory `name` from `parent`.
    #[instrument(name = "EsdFs::unlink", skip(self))]
    pub fn unlink(&self, caller: Caller, parent: InodeAddr, name: &OsStr) -> io::Result<()> {
        let _paths = self.paths_stable();
        let mask = AccessMask::WRITE | AccessMask::EXEC;
        let (dir, parent_derived) = self.dir_for_change(&caller, parent, name, mask)?;
        let (real, _) = self.locate(&dir, parent_derived, name)?;
        let attr = {
            let _guard = real.lock_dir();
            let real_path = self.inodes.lower_path(real.addr)?;
            let (lower_name, attr) =
                self.as_lower(|| lookup_nocase(&self.lower, &real_path, name))?;
            if attr.itype() == INodeType::Directory {
                return Err(errno(libc::EISDIR));
            }
            match self.as_lower(|| self.lower.unlink(&real_path.join(&lower_name))) {
                Ok(()) => {}
                Err(e) if is_errno(&e, libc::EBUSY) => {
                    debug!("lower unlink busy after silly rename, treating as removed");
                }
                Err(e) => return Err(e),
            }
            attr
        };
        self.forget_removed(dir.addr, real.addr, name, attr);
        Ok(())
    }

    /// Remove empty directory `name` from `parent`.
    #[instrument(name = "EsdFs::rmdir", skip(self))]
    pub fn rmdir(&self, caller: Caller, parent: InodeAddr, name: &OsStr) -> io::Result<()> {
        let _paths = self.paths_stable();
        let mask = AccessMask::WRITE | AccessMask::EXEC;
        let (dir, parent_derived) = self.dir_for_change(&caller, parent, name, mask)?;
        let (real, stub) = self.locate(&dir, parent_derived, name)?;
        let attr = {
            let _guard = real.lock_dir();
            let real_path = self.inodes.lower_path(real.addr)?;
            let (lower_name, attr) =
                self.as_lower(|| lookup_nocase(&self.lower, &real_path, name))?;
            if attr.itype() != INodeType::Directory {
                return Err(errno(libc::ENOTDIR));
            }
            self.as_lower(|| self.lower.rmdir(&real_path.join(&lower_name)))?;
            attr
        };
        self.forget_removed(dir.addr, real.addr, name, attr);
        if let Some(stub) = stub {
            self.remove_stub(dir.addr, &stub);
        }
        Ok(())
    }

    /// Move `name` in `parent` to `newname` in `newparent`.
    ///
    /// Moving a directory beneath itself fails with `EINVAL`; replacing an ancestor of the source
    /// fails with `ENOTEMPTY`. Rename flags are not supported.
    #[instrument(name = "EsdFs::rename", skip(self))]
    pub fn rename(
        &self,
        caller: Caller,
        parent: InodeAddr,
        name: &OsStr,
        newparent: InodeAddr,
        newname: &OsStr,
        flags: u32,
    ) -> io::Result<()> {
        if flags != 0 {
            return Err(errno(libc::EINVAL));
        }
        let remove = AccessMask::WRITE | AccessMask::EXEC;
        let (src_parent, src_derived) = self.dir_for_change(&caller, parent, name, remove)?;
        let (dst_parent, dst_derived) =
            self.dir_for_change(&caller, newparent, newname, remove | AccessMask::CREATE)?;

        let _rename = self.namespace.write();
        let (src_dir, src_stub) = self.locate(&src_parent, src_derived, name)?;
        let (dst_dir, _) = self.locate(&dst_parent, dst_derived, newname)?;
        let guards = lock_pair(&src_dir, &dst_dir);

        let src_path = self.inodes.lower_path(src_dir.addr)?;
        let dst_path = self.inodes.lower_path(dst_dir.addr)?;
        let (src_name, src_attr) =
            self.as_lower(|| lookup_nocase(&self.lower, &src_path, name))?;
        let existing = self.probe(&dst_path, newname)?;
        let src_addr = self.inodes.addr_of(src_attr.id);

        if src_attr.itype() == INodeType::Directory
            && src_addr.is_some_and(|src| self.is_ancestor(src, dst_dir.addr))
        {
            debug!("rename would move a directory beneath itself");
            return Err(errno(libc::EINVAL));
        }
        if let Some((_, dst_attr)) = &existing {
            if dst_attr.id == src_attr.id {
                return Ok(());
            }
            if self
                .inodes
                .addr_of(dst_attr.id)
                .is_some_and(|dst| self.is_ancestor(dst, src_dir.addr))
            {
                debug!("rename target is an ancestor of the source");
                return Err(errno(libc::ENOTEMPTY));
            }
        }

        let dst_name = existing
            .as_ref()
            .map_or_else(|| newname.to_os_string(), |(found, _)| found.clone());
        self.as_lower(|| {
            self.lower
                .rename(&src_path.join(&src_name), &dst_path.join(&dst_name))
        })?;

        self.entries.remove(src_parent.addr, name);
        self.entries.remove(src_dir.addr, name);
        self.entries.remove(dst_parent.addr, newname);
        self.entries.remove(dst_dir.addr, newname);
        if let Some((_, dst_attr)) = existing
            && let Some(replaced) = self.inodes.addr_of(dst_attr.id)
        {
            self.inodes.unhash(replaced);
        }
        if src_attr.itype() == INodeType::Directory {
            // Everything below the moved directory derives from a new ancestry.
            self.epoch.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(moved) = src_addr.and_then(|addr| self.inodes.get(addr)) {
            let snapshot = self.packages.snapshot();
            let derived = derive(
                dst_derived,
                &dst_name,
                self.options.restricted(),
                &snapshot,
            );
            moved.set_locations(
                Location::new(dst_dir.addr, dst_name.clone()),
                Location::new(dst_parent.addr, dst_name),
            );
            moved.set_derived(derived, self.stamp(&snapshot));
        }
        drop(guards);

        if let Some(stub) = src_stub {
            self.remove_stub(src_parent.addr, &stub);
        }
        Ok(())
    }

    /// Open `ino` for I/O.
    #[instrument(name = "EsdFs::open", skip(self))]
    pub fn open(&self, caller: Caller, ino: InodeAddr, flags: OpenFlags) -> io::Result<FileHandle> {
        let _paths = self.paths_stable();
        let inode = self.inode(ino)?;
        self.check_stale(&inode)?;
        if inode.itype == INodeType::Directory {
            return Err(errno(libc::EISDIR));
        }
        let derived = self.derived(&inode)?;
        self.permission(&caller, &inode, derived, flags.access_mask())?;
        let path = self.inodes.lower_path(ino)?;
        let file = self.as_lower(|| self.lower.open(&path, flags))?;
        if flags.contains(OpenFlags::TRUNC) {
            inode.set_attr(file.getattr()?);
        }
        Ok(self.register(ino, file))
    }

    /// Read up to `size` bytes at `offset`.
    #[instrument(name = "EsdFs::read", skip(self))]
    pub fn read(&self, fh: FileHandle, offset: u64, size: u32) -> io::Result<Bytes> {
        let (_, file) = self.file(fh)?;
        file.read_at(offset, size)
    }

    /// Write `data` at `offset`, then copy the lower size and times up.
    #[instrument(name = "EsdFs::write", skip(self, data), fields(len = data.len()))]
    pub fn write(&self, fh: FileHandle, offset: u64, data: &[u8]) -> io::Result<u32> {
        let (ino, file) = self.file(fh)?;
        let written = file.write_at(offset, data)?;
        match file.getattr() {
            Ok(attr) => {
                if let Some(inode) = self.inodes.get(ino) {
                    inode.set_attr(attr);
                }
            }
            Err(e) => debug!(error = %e, "could not refresh attributes after write"),
        }
        Ok(written)
    }

    /// Nothing is buffered at this layer; only checks the handle.
    #[instrument(name = "EsdFs::flush", skip(self))]
    pub fn flush(&self, fh: FileHandle) -> io::Result<()> {
        self.file(fh).map(drop)
    }

    /// Flush the lower file to stable storage.
    #[instrument(name = "EsdFs::fsync", skip(self))]
    pub fn fsync(&self, fh: FileHandle, datasync: bool) -> io::Result<()> {
        let (_, file) = self.file(fh)?;
        file.fsync(datasync)
    }

    /// Close a file handle.
    #[instrument(name = "EsdFs::release", skip(self))]
    pub fn release(&self, fh: FileHandle) -> io::Result<()> {
        self.files
            .remove_sync(&fh)
            .map(drop)
            .ok_or_else(|| errno(libc::EBADF))
    }

    /// Open directory `ino`, snapshotting its listing.
    #[instrument(name = "EsdFs::opendir", skip(self))]
    pub fn opendir(&self, caller: Caller, ino: InodeAddr) -> io::Result<FileHandle> {
        let _paths = self.paths_stable();
        let inode = self.inode(ino)?;
        self.check_stale(&inode)?;
        if inode.itype != INodeType::Directory {
            return Err(errno(libc::ENOTDIR));
        }
        let derived = self.derived(&inode)?;
        self.permission(&caller, &inode, derived, AccessMask::READ)?;

        let path = self.inodes.lower_path(ino)?;
        let mut listing = self.as_lower(|| self.lower.readdir(&path))?;
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        let entries: Arc<[DirEntry]> = listing
            .into_iter()
            .map(|entry| DirEntry {
                ino: self.entry_hint(ino, &entry),
                itype: entry.itype,
                name: entry.name,
            })
            .collect();

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        if self.dirs.insert_sync(fh, entries).is_err() {
            unreachable!("directory handle {fh} handed out twice");
        }
        Ok(fh)
    }

    /// Yield entries of an open directory starting at `offset`.
    ///
    /// `filler` receives each entry with the offset of the next one and returns `true` when the
    /// caller's buffer is full.
    #[instrument(name = "EsdFs::readdir", skip(self, filler))]
    pub fn readdir(
        &self,
        fh: FileHandle,
        offset: u64,
        mut filler: impl FnMut(&DirEntry, u64) -> bool,
    ) -> io::Result<()> {
        let entries = self
            .dirs
            .read_sync(&fh, |_, entries| Arc::clone(entries))
            .ok_or_else(|| errno(libc::EBADF))?;
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        for (next, entry) in (1u64..).zip(entries.iter()).skip(skip) {
            if filler(entry, next) {
                break;
            }
        }
        Ok(())
    }

    /// Close a directory handle.
    #[instrument(name = "EsdFs::releasedir", skip(self))]
    pub fn releasedir(&self, fh: FileHandle) -> io::Result<()> {
        self.dirs
            .remove_sync(&fh)
            .map(drop)
            .ok_or_else(|| errno(libc::EBADF))
    }

    /// Statistics of the lower filesystem, tagged with this filesystem's magic.
    #[instrument(name = "EsdFs::statfs", skip(self))]
    pub fn statfs(&self) -> io::Result<FsStats> {
        self.as_lower(|| self.lower.statfs(self.inodes.root_path()))
    }
}
