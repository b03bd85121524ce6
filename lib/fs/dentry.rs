use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::sync::{Arc, PoisonError, RwLock};

use crate::fs::InodeAddr;

/// Link bookkeeping of one entry.
///
/// A real parent is only ever recorded together with a stub, so an entry that has a real parent
/// always also has a placeholder at its natural location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    stub: Option<OsString>,
    real_parent: Option<InodeAddr>,
}

impl LinkState {
    /// An entry that is not subject to redirection.
    #[must_use]
    pub fn natural() -> Self {
        Self::default()
    }

    /// An entry that should be redirected but whose link source is not known yet.
    #[must_use]
    pub fn unresolved(stub: OsString) -> Self {
        Self {
            stub: Some(stub),
            real_parent: None,
        }
    }

    /// An entry resolved through `real_parent`, with a placeholder named `stub` left at its
    /// natural location.
    #[must_use]
    pub fn linked(stub: OsString, real_parent: InodeAddr) -> Self {
        Self {
            stub: Some(stub),
            real_parent: Some(real_parent),
        }
    }

    /// The placeholder's name in the natural parent.
    #[must_use]
    pub fn stub(&self) -> Option<&OsStr> {
        self.stub.as_deref()
    }

    /// The directory the entry really lives in, when redirected.
    #[must_use]
    pub fn real_parent(&self) -> Option<InodeAddr> {
        self.real_parent
    }

    /// Redirection is wanted but has not completed; the entry must be looked up again.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.stub.is_some() && self.real_parent.is_none()
    }
}

/// One resolved name.
#[derive(Debug)]
pub struct StackedEntry {
    /// Stacked inode the name resolves to.
    pub ino: InodeAddr,
    /// Name as stored in the lower directory.
    pub name: OsString,
    link: parking_lot::Mutex<LinkState>,
}

impl StackedEntry {
    /// A new entry for `ino`.
    #[must_use]
    pub fn new(ino: InodeAddr, name: OsString, link: LinkState) -> Self {
        Self {
            ino,
            name,
            link: parking_lot::Mutex::new(link),
        }
    }

    /// A consistent copy of the link bookkeeping.
    #[must_use]
    pub fn link(&self) -> LinkState {
        self.link.lock().clone()
    }

    /// Replace the link bookkeeping.
    pub fn set_link(&self, link: LinkState) {
        *self.link.lock() = link;
    }
}

/// Cache key: names are matched ASCII case-insensitively.
fn fold(name: &OsStr) -> OsString {
    name.to_ascii_lowercase()
}

/// Per-parent children map.
#[derive(Default)]
struct DirState {
    children: RwLock<BTreeMap<OsString, Arc<StackedEntry>>>,
}

/// Entry cache with per-parent child maps.
///
/// A stacked inode may be reachable from more than one parent (the natural location of a link
/// and its real one), so the reverse index maps each inode to every `(parent, key)` naming it.
#[derive(Default)]
pub struct EntryCache {
    dirs: scc::HashMap<InodeAddr, Arc<DirState>>,
    names_of: scc::HashMap<InodeAddr, Vec<(InodeAddr, OsString)>>,
}

impl EntryCache {
    /// Creates an empty entry cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the [`DirState`] for `parent`, creating one if absent.
    fn dir_state(&self, parent: InodeAddr) -> Arc<DirState> {
        if let Some(state) = self.dirs.read_sync(&parent, |_, v| Arc::clone(v)) {
            return state;
        }
        match self.dirs.entry_sync(parent) {
            scc::hash_map::Entry::Occupied(occ) => Arc::clone(occ.get()),
            scc::hash_map::Entry::Vacant(vac) => {
                let state = Arc::new(DirState::default());
                vac.insert_entry(Arc::clone(&state));
                state
            }
        }
    }

    fn forget_name(&self, ino: InodeAddr, parent: InodeAddr, key: &OsStr) {
        self.names_of.update_sync(&ino, |_, names| {
            names.retain(|(p, k)| !(*p == parent && k == key));
        });
        self.names_of.remove_if_sync(&ino, |names| names.is_empty());
    }

    /// Looks up `name` under `parent`.
    #[must_use]
    pub fn lookup(&self, parent: InodeAddr, name: &OsStr) -> Option<Arc<StackedEntry>> {
        let state = self.dirs.read_sync(&parent, |_, v| Arc::clone(v))?;
        let children = state.children.read().unwrap_or_else(PoisonError::into_inner);
        children.get(&fold(name)).cloned()
    }

    /// Inserts or overwrites the entry for `entry.name` under `parent`.
    pub fn insert(&self, parent: InodeAddr, entry: StackedEntry) -> Arc<StackedEntry> {
        let state = self.dir_state(parent);
        let key = fold(&entry.name);
        let ino = entry.ino;
        let entry = Arc::new(entry);
        let mut children = state.children.write().unwrap_or_else(PoisonError::into_inner);
        match children.insert(key.clone(), Arc::clone(&entry)) {
            Some(old) if old.ino == ino => return entry,
            Some(old) => self.forget_name(old.ino, parent, &key),
            None => {}
        }
        self.names_of
            .entry_sync(ino)
            .or_default()
            .get_mut()
            .push((parent, key));
        entry
    }

    /// Removes `name` under `parent`.
    pub fn remove(&self, parent: InodeAddr, name: &OsStr) -> Option<Arc<StackedEntry>> {
        let state = self.dirs.read_sync(&parent, |_, v| Arc::clone(v))?;
        let key = fold(name);
        let mut children = state.children.write().unwrap_or_else(PoisonError::into_inner);
        let removed = children.remove(&key)?;
        self.forget_name(removed.ino, parent, &key);
        Some(removed)
    }

    /// Drops every entry naming `ino` and every cached child of `ino`.
    pub fn evict(&self, ino: InodeAddr) {
        if let Some((_, names)) = self.names_of.remove_sync(&ino) {
            for (parent, key) in names {
                if let Some(state) = self.dirs.read_sync(&parent, |_, v| Arc::clone(v)) {
                    let mut children =
                        state.children.write().unwrap_or_else(PoisonError::into_inner);
                    if children.get(&key).is_some_and(|e| e.ino == ino) {
                        children.remove(&key);
                    }
                }
            }
        }
        if let Some((_, state)) = self.dirs.remove_sync(&ino) {
            let children = state.children.read().unwrap_or_else(PoisonError::into_inner);
            for (key, entry) in children.iter() {
                self.forget_name(entry.ino, ino, key);
            }
        }
    }

    /// Number of parents with cached children.
    #[must_use]
    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let cache = EntryCache::new();
        cache.insert(1, StackedEntry::new(2, "Android".into(), LinkState::natural()));
        assert_eq!(cache.lookup(1, OsStr::new("ANDROID")).map(|e| e.ino), Some(2));
        assert_eq!(cache.lookup(1, OsStr::new("android")).unwrap().name, "Android");
    }

    #[test]
    fn only_ascii_letters_are_folded() {
        use std::os::unix::ffi::OsStrExt as _;

        let cache = EntryCache::new();
        cache.insert(1, StackedEntry::new(2, "Über".into(), LinkState::natural()));
        assert_eq!(cache.lookup(1, OsStr::new("Über")).map(|e| e.ino), Some(2));
        assert!(cache.lookup(1, OsStr::new("über")).is_none());

        // Names that are not valid UTF-8 fold byte for byte.
        let raw = OsStr::from_bytes(b"Raw\xff");
        cache.insert(1, StackedEntry::new(3, raw.to_os_string(), LinkState::natural()));
        assert_eq!(cache.lookup(1, OsStr::from_bytes(b"rAW\xff")).map(|e| e.ino), Some(3));
    }

    #[test]
    fn overwrite_moves_reverse_index() {
        let cache = EntryCache::new();
        cache.insert(1, StackedEntry::new(2, "a".into(), LinkState::natural()));
        cache.insert(1, StackedEntry::new(3, "A".into(), LinkState::natural()));
        cache.evict(2);
        assert_eq!(cache.lookup(1, OsStr::new("a")).map(|e| e.ino), Some(3));
    }

    #[test]
    fn evict_removes_every_name_and_children() {
        let cache = EntryCache::new();
        cache.insert(1, StackedEntry::new(5, "obb".into(), LinkState::natural()));
        cache.insert(4, StackedEntry::new(5, "obb".into(), LinkState::linked("obb".into(), 1)));
        cache.insert(5, StackedEntry::new(6, "game".into(), LinkState::natural()));
        cache.evict(5);
        assert!(cache.lookup(1, OsStr::new("obb")).is_none());
        assert!(cache.lookup(4, OsStr::new("obb")).is_none());
        assert!(cache.lookup(5, OsStr::new("game")).is_none());
        assert_eq!(cache.dir_count(), 2);
    }

    #[test]
    fn remove_returns_the_entry() {
        let cache = EntryCache::new();
        cache.insert(1, StackedEntry::new(2, "x".into(), LinkState::natural()));
        assert_eq!(cache.remove(1, OsStr::new("X")).map(|e| e.ino), Some(2));
        assert!(cache.remove(1, OsStr::new("x")).is_none());
    }

    #[test]
    fn link_state_pending_until_real_parent_recorded() {
        assert!(!LinkState::natural().is_pending());
        let unresolved = LinkState::unresolved("obb".into());
        assert!(unresolved.is_pending());
        assert_eq!(unresolved.stub(), Some(OsStr::new("obb")));
        let linked = LinkState::linked("obb".into(), 9);
        assert!(!linked.is_pending());
        assert_eq!(linked.real_parent(), Some(9));

        let entry = StackedEntry::new(3, "obb".into(), unresolved);
        entry.set_link(linked.clone());
        assert_eq!(entry.link(), linked);
    }
}
