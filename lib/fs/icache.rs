use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::trace;

use crate::derive::Derived;
use crate::fs::{INodeType, InodeAddr, ROOT_INO};
use crate::lower::{LowerAttr, LowerId};
use crate::sync::atomic::{AtomicU64, Ordering};

/// Deepest directory chain walked when rebuilding a lower path.
const MAX_PATH_DEPTH: usize = 4096;

/// A `(parent, name)` edge of the lower tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Directory holding the object.
    pub parent: InodeAddr,
    /// Name as stored in that directory.
    pub name: OsString,
}

impl Location {
    /// An edge named `name` under `parent`.
    pub fn new(parent: InodeAddr, name: impl Into<OsString>) -> Self {
        Self {
            parent,
            name: name.into(),
        }
    }
}

/// What a derivation was computed against: the package table version and the rename epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    /// Package database version.
    pub packages: u64,
    /// Number of directory renames the mount has seen.
    pub epoch: u64,
}

#[derive(Debug)]
struct InodeState {
    /// Where the object really lives in the lower tree.
    location: Option<Location>,
    /// Where it was looked up from; derivation follows this edge.
    natural: Option<Location>,
    derived: Derived,
    stamp: Stamp,
    attr: LowerAttr,
    link_pending: bool,
}

/// The stacked shadow of one lower inode.
#[derive(Debug)]
pub struct StackedInode {
    /// Address handed to the kernel.
    pub addr: InodeAddr,
    /// Identity of the shadowed lower inode.
    pub lower_id: LowerId,
    /// The kind of object, fixed for the inode's life.
    pub itype: INodeType,
    state: parking_lot::Mutex<InodeState>,
    dir_lock: parking_lot::Mutex<()>,
}

impl StackedInode {
    fn new(
        addr: InodeAddr,
        attr: LowerAttr,
        location: Option<Location>,
        natural: Option<Location>,
        derived: Derived,
        stamp: Stamp,
    ) -> Self {
        Self {
            addr,
            lower_id: attr.id,
            itype: attr.itype(),
            state: parking_lot::Mutex::new(InodeState {
                location,
                natural,
                derived,
                stamp,
                attr,
                link_pending: false,
            }),
            dir_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Real lower location; `None` for the root.
    #[must_use]
    pub fn location(&self) -> Option<Location> {
        self.state.lock().location.clone()
    }

    /// Location the object was last reached from.
    #[must_use]
    pub fn natural(&self) -> Option<Location> {
        self.state.lock().natural.clone()
    }

    /// Record both the real and the natural edge in one step.
    pub fn set_locations(&self, location: Location, natural: Location) {
        let mut state = self.state.lock();
        state.location = Some(location);
        state.natural = Some(natural);
    }

    /// Cached derivation if it was computed against `stamp`.
    #[must_use]
    pub fn fresh_derived(&self, stamp: Stamp) -> Option<Derived> {
        let state = self.state.lock();
        (state.stamp == stamp).then_some(state.derived)
    }

    /// Store a derivation computed against `stamp`.
    pub fn set_derived(&self, derived: Derived, stamp: Stamp) {
        let mut state = self.state.lock();
        state.derived = derived;
        state.stamp = stamp;
    }

    /// Last lower attributes copied up.
    #[must_use]
    pub fn attr(&self) -> LowerAttr {
        self.state.lock().attr
    }

    /// Copy up fresh lower attributes.
    pub fn set_attr(&self, attr: LowerAttr) {
        self.state.lock().attr = attr;
    }

    /// The inode was reached through a link whose source was not yet known.
    #[must_use]
    pub fn link_pending(&self) -> bool {
        self.state.lock().link_pending
    }

    /// Mark or clear an unfinished link.
    pub fn set_link_pending(&self, pending: bool) {
        self.state.lock().link_pending = pending;
    }

    /// Serialize namespace changes inside this directory.
    pub fn lock_dir(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.dir_lock.lock()
    }
}

/// Stacked inodes by address, with one stacked inode per lower inode.
#[derive(Debug)]
pub struct InodeCache {
    inodes: scc::HashMap<InodeAddr, Arc<StackedInode>>,
    by_lower: scc::HashMap<LowerId, InodeAddr>,
    next_addr: AtomicU64,
    root_path: PathBuf,
}

impl InodeCache {
    /// A cache holding only the root, which shadows the lower directory at `root_path`.
    #[must_use]
    pub fn new(root_path: PathBuf, root_attr: LowerAttr, root_derived: Derived) -> Self {
        let stamp = Stamp {
            packages: 0,
            epoch: 0,
        };
        let root = Arc::new(StackedInode::new(
            ROOT_INO,
            root_attr,
            None,
            None,
            root_derived,
            stamp,
        ));
        let inodes = scc::HashMap::new();
        let by_lower = scc::HashMap::new();
        if inodes.insert_sync(ROOT_INO, root).is_err()
            || by_lower.insert_sync(root_attr.id, ROOT_INO).is_err()
        {
            unreachable!("a freshly built inode table already holds the root");
        }
        Self {
            inodes,
            by_lower,
            next_addr: AtomicU64::new(ROOT_INO + 1),
            root_path,
        }
    }

    /// Lower path of the root.
    #[must_use]
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// The stacked inode at `addr`.
    #[must_use]
    pub fn get(&self, addr: InodeAddr) -> Option<Arc<StackedInode>> {
        self.inodes.read_sync(&addr, |_, v| Arc::clone(v))
    }

    /// Stacked address currently shadowing `id`, if any.
    #[must_use]
    pub fn addr_of(&self, id: LowerId) -> Option<InodeAddr> {
        self.by_lower.read_sync(&id, |_, &v| v)
    }

    /// Find or create the stacked inode shadowing the lower object described by `attr`.
    ///
    /// An existing inode has its edges and attributes refreshed; a new one starts with
    /// `derived`. The second value reports whether the inode was created.
    pub fn interpose(
        &self,
        attr: LowerAttr,
        location: Location,
        natural: Location,
        derived: Derived,
        stamp: Stamp,
    ) -> (Arc<StackedInode>, bool) {
        let existing = self
            .by_lower
            .read_sync(&attr.id, |_, &v| v)
            .and_then(|addr| self.get(addr))
            .filter(|inode| inode.itype == attr.itype());
        if let Some(inode) = existing {
            inode.set_locations(location, natural);
            inode.set_attr(attr);
            return (inode, false);
        }

        match self.by_lower.entry_sync(attr.id) {
            scc::hash_map::Entry::Occupied(mut occ) => {
                if let Some(inode) = self.get(*occ.get()).filter(|i| i.itype == attr.itype()) {
                    drop(occ);
                    inode.set_locations(location, natural);
                    inode.set_attr(attr);
                    return (inode, false);
                }
                let inode = self.allocate(attr, location, natural, derived, stamp);
                *occ.get_mut() = inode.addr;
                (inode, true)
            }
            scc::hash_map::Entry::Vacant(vac) => {
                let inode = self.allocate(attr, location, natural, derived, stamp);
                vac.insert_entry(inode.addr);
                (inode, true)
            }
        }
    }

    fn allocate(
        &self,
        attr: LowerAttr,
        location: Location,
        natural: Location,
        derived: Derived,
        stamp: Stamp,
    ) -> Arc<StackedInode> {
        let addr = self.next_addr.fetch_add(1, Ordering::Relaxed);
        let inode = Arc::new(StackedInode::new(
            addr,
            attr,
            Some(location),
            Some(natural),
            derived,
            stamp,
        ));
        if self.inodes.insert_sync(addr, Arc::clone(&inode)).is_err() {
            unreachable!("inode address {addr} handed out twice");
        }
        trace!(addr, lower = ?attr.id, "interposed new inode");
        inode
    }

    /// Stop mapping the lower identity of `addr` to it, so a recycled lower inode number gets a
    /// fresh stacked inode. The stacked inode itself stays until evicted.
    pub fn unhash(&self, addr: InodeAddr) {
        if let Some(inode) = self.get(addr) {
            self.by_lower
                .remove_if_sync(&inode.lower_id, |v| *v == addr);
        }
    }

    /// Drop `addr` entirely. The root is never evicted.
    pub fn evict(&self, addr: InodeAddr) {
        if addr == ROOT_INO {
            return;
        }
        if let Some((_, inode)) = self.inodes.remove_sync(&addr) {
            self.by_lower
                .remove_if_sync(&inode.lower_id, |v| *v == addr);
            trace!(addr, "evicted inode");
        }
    }

    /// Rebuild the lower path of `addr` by walking its real edges up to the root.
    pub fn lower_path(&self, addr: InodeAddr) -> io::Result<PathBuf> {
        let mut names = Vec::new();
        let mut cursor = addr;
        while cursor != ROOT_INO {
            if names.len() >= MAX_PATH_DEPTH {
                return Err(io::Error::from_raw_os_error(libc::ELOOP));
            }
            let location = self
                .get(cursor)
                .and_then(|inode| inode.location())
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ESTALE))?;
            cursor = location.parent;
            names.push(location.name);
        }
        let mut path = self.root_path.clone();
        path.extend(names.iter().rev());
        Ok(path)
    }

    /// Number of cached inodes, the root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    /// Whether only the root is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}
