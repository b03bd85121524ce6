//! Pseudo hard link for the shared `obb` directory.
//!
//! Every user's `Android/obb` resolves to one real directory: the `obb` child of the pinned link
//! source. On unified mounts the source is the first `Android` directory seen directly under the
//! primary user's root; on legacy mounts it is the mount root itself, whose `obb` child holds the
//! shared tree. The natural location keeps a placeholder directory so listings still show the
//! entry.

use std::ffi::OsStr;
use std::sync::OnceLock;

use crate::derive::{Derived, TreeClass, name_is};
use crate::fs::InodeAddr;
use crate::options::MountOptions;

/// Name whose lookups are redirected.
pub const LINK_NAME: &str = "obb";

const SOURCE_NAME: &str = "Android";

/// Redirect state of one mount.
#[derive(Debug)]
pub struct LinkEngine {
    source: OnceLock<InodeAddr>,
    legacy: bool,
    unified: bool,
}

impl LinkEngine {
    /// Link policy for a mount with `options`.
    #[must_use]
    pub fn new(options: &MountOptions) -> Self {
        Self {
            source: OnceLock::new(),
            legacy: options.legacy(),
            unified: options.unified(),
        }
    }

    /// The pinned link source, once one has been seen.
    #[must_use]
    pub fn source(&self) -> Option<InodeAddr> {
        self.source.get().copied()
    }

    /// Pin `ino` as the link source unconditionally. Returns whether this call pinned it.
    pub fn pin(&self, ino: InodeAddr) -> bool {
        self.source.set(ino).is_ok()
    }

    /// Pin `ino` if it is the primary user's `Android` directory on a unified mount.
    ///
    /// Only the first candidate is pinned. Returns whether this call pinned it.
    pub fn offer_source(&self, parent: Derived, name: &OsStr, ino: InodeAddr, is_dir: bool) -> bool {
        self.unified
            && is_dir
            && parent.tree == TreeClass::Root
            && parent.userid == 0
            && name_is(name, SOURCE_NAME)
            && self.pin(ino)
    }

    /// Whether `name` under a parent in state `parent` is a redirect candidate at all.
    #[must_use]
    pub fn is_trigger(parent: Derived, name: &OsStr) -> bool {
        parent.tree == TreeClass::Android && name_is(name, LINK_NAME)
    }

    /// Whether a lookup of `name` under `parent` must resolve through the link source.
    #[must_use]
    pub fn should_link(&self, parent: Derived, name: &OsStr) -> bool {
        Self::is_trigger(parent, name) && (self.legacy || (self.unified && parent.userid != 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(s: &str) -> MountOptions {
        s.parse().unwrap()
    }

    fn android(userid: u32) -> Derived {
        Derived {
            tree: TreeClass::Android,
            userid,
            appid: 0,
        }
    }

    #[test]
    fn primary_users_android_is_pinned_once() {
        let link = LinkEngine::new(&opts("derive=unified"));
        let root = Derived::root(TreeClass::Root);
        assert!(!link.offer_source(root, OsStr::new("Android"), 5, false));
        assert!(link.offer_source(root, OsStr::new("ANDROID"), 7, true));
        assert!(!link.offer_source(root, OsStr::new("Android"), 9, true));
        assert_eq!(link.source(), Some(7));
    }

    #[test]
    fn secondary_user_roots_are_not_sources() {
        let link = LinkEngine::new(&opts("derive=unified"));
        let user = Derived {
            tree: TreeClass::Root,
            userid: 10,
            appid: 0,
        };
        assert!(!link.offer_source(user, OsStr::new("Android"), 7, true));
        assert_eq!(link.source(), None);
    }

    #[test]
    fn non_unified_mounts_never_pin_from_lookups() {
        let link = LinkEngine::new(&opts("derive=public"));
        let root = Derived::root(TreeClass::Root);
        assert!(!link.offer_source(root, OsStr::new("Android"), 7, true));
    }

    #[test]
    fn only_secondary_users_link_on_unified_mounts() {
        let link = LinkEngine::new(&opts("derive=unified"));
        assert!(!link.should_link(android(0), OsStr::new("obb")));
        assert!(link.should_link(android(10), OsStr::new("OBB")));
        assert!(!link.should_link(android(10), OsStr::new("data")));
        let media = Derived {
            tree: TreeClass::Media,
            userid: 10,
            appid: 0,
        };
        assert!(!link.should_link(media, OsStr::new("obb")));
    }

    #[test]
    fn legacy_mounts_link_every_user() {
        let link = LinkEngine::new(&opts("derive=legacy"));
        assert!(link.should_link(android(0), OsStr::new("obb")));
        assert!(link.should_link(android(3), OsStr::new("obb")));
    }

    #[test]
    fn public_mounts_never_link() {
        let link = LinkEngine::new(&opts("derive=public"));
        assert!(!link.should_link(android(10), OsStr::new("obb")));
    }
}
