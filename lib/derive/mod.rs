//! Permission derivation.
//!
//! Every object's classification is a function of its parent's classification and its own name.
//! The classification then selects a fixed owner, group and mode for presentation; the lower
//! filesystem's own ownership and mode bits are never shown.

pub mod access;

use std::ffi::OsStr;

use crate::fs::{INodeType, InodePerms};
use crate::options::PermTuple;
use crate::pkgdb::{AID_SDCARD_ALL, AID_SDCARD_R, AID_USER_OFFSET, PackageSnapshot};

/// Position of an object in the emulated storage layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeClass {
    /// Derivation disabled.
    None,
    /// Root of a single-user legacy layout.
    RootLegacy,
    /// A per-user storage root.
    Root,
    /// Ordinary shared media.
    Media,
    /// The `Android` directory of a user root.
    Android,
    /// `Android/data`.
    AndroidData,
    /// `Android/obb`.
    AndroidObb,
    /// `Android/media`.
    AndroidMedia,
    /// A package directory beneath data, obb or media.
    AndroidApp,
    /// `Android/user`, holding nested per-user roots.
    AndroidUser,
}

impl TreeClass {
    /// Every classification.
    pub const ALL: [Self; 10] = [
        Self::None,
        Self::RootLegacy,
        Self::Root,
        Self::Media,
        Self::Android,
        Self::AndroidData,
        Self::AndroidObb,
        Self::AndroidMedia,
        Self::AndroidApp,
        Self::AndroidUser,
    ];

    /// The subtree guarded against broad storage writers on restricted mounts.
    #[must_use]
    pub fn is_protected_android(self) -> bool {
        matches!(
            self,
            Self::Android
                | Self::AndroidData
                | Self::AndroidObb
                | Self::AndroidMedia
                | Self::AndroidApp
        )
    }
}

/// Derived state of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Derived {
    /// Classification.
    pub tree: TreeClass,
    /// Android user the object belongs to.
    pub userid: u32,
    /// Owning app id, 0 when unresolved.
    pub appid: u32,
}

impl Derived {
    /// State of the mount root.
    #[must_use]
    pub fn root(tree: TreeClass) -> Self {
        Self {
            tree,
            userid: 0,
            appid: 0,
        }
    }
}

/// Presented owner, group and permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Presentation {
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Permission bits.
    pub perms: InodePerms,
}

/// ASCII case-insensitive name comparison.
pub(crate) fn name_is(name: &OsStr, expected: &str) -> bool {
    name.as_encoded_bytes()
        .eq_ignore_ascii_case(expected.as_bytes())
}

fn parse_userid(name: &OsStr) -> Option<u32> {
    name.to_str()?.parse().ok()
}

/// Derive a child's state from its parent's.
///
/// `restricted` enables the `Android/user` transition.
#[must_use]
pub fn derive(
    parent: Derived,
    name: &OsStr,
    restricted: bool,
    packages: &PackageSnapshot,
) -> Derived {
    let mut child = parent;
    match parent.tree {
        TreeClass::None | TreeClass::Media | TreeClass::AndroidApp => {}
        TreeClass::RootLegacy => {
            if name_is(name, "obb") {
                child.tree = TreeClass::AndroidObb;
            } else {
                child.tree = TreeClass::Root;
                if let Some(userid) = parse_userid(name) {
                    child.userid = userid;
                }
            }
        }
        TreeClass::Root => {
            if name_is(name, "Android") {
                child.tree = TreeClass::Android;
            } else {
                child.tree = TreeClass::Media;
                if let Some(userid) = parse_userid(name) {
                    child.userid = userid;
                }
            }
        }
        TreeClass::Android => {
            if name_is(name, "data") {
                child.tree = TreeClass::AndroidData;
            } else if name_is(name, "obb") {
                child.tree = TreeClass::AndroidObb;
            } else if name_is(name, "media") {
                child.tree = TreeClass::AndroidMedia;
            } else if restricted && name_is(name, "user") {
                child.tree = TreeClass::AndroidUser;
            }
        }
        TreeClass::AndroidData | TreeClass::AndroidObb | TreeClass::AndroidMedia => {
            child.tree = TreeClass::AndroidApp;
            if let Some(appid) = name.to_str().and_then(|n| packages.classify(n)) {
                child.appid = appid;
            }
        }
        TreeClass::AndroidUser => {
            // A nested root always names its own user; anything unparsable is the primary one.
            child.tree = TreeClass::Root;
            child.appid = 0;
            child.userid = parse_userid(name).unwrap_or(0);
        }
    }
    child
}

/// Owner, group and mode presented for an object with state `derived`.
///
/// `upper` supplies the default owner and the file/directory modes for the shared parts of the
/// tree. Regular files never carry execute bits.
#[must_use]
pub fn apply_mode(derived: Derived, upper: &PermTuple, itype: INodeType) -> Presentation {
    let is_dir = itype == INodeType::Directory;
    let configured = if is_dir { upper.dmode } else { upper.fmode };

    let (uid, gid, mode) = match derived.tree {
        TreeClass::None => (upper.uid, upper.gid, configured),
        TreeClass::RootLegacy | TreeClass::Root | TreeClass::Media => {
            (upper.uid, AID_SDCARD_R, configured)
        }
        TreeClass::Android
        | TreeClass::AndroidData
        | TreeClass::AndroidObb
        | TreeClass::AndroidMedia => (upper.uid, AID_SDCARD_R, 0o771),
        TreeClass::AndroidApp => {
            let uid = if derived.appid == 0 {
                upper.uid
            } else {
                derived
                    .userid
                    .saturating_mul(AID_USER_OFFSET)
                    .saturating_add(derived.appid % AID_USER_OFFSET)
            };
            (uid, AID_SDCARD_R, 0o770)
        }
        TreeClass::AndroidUser => (upper.uid, AID_SDCARD_ALL, 0o770),
    };

    let mut perms = InodePerms::from_mode(mode);
    match itype {
        INodeType::Directory => {}
        INodeType::Symlink => perms = InodePerms::from_mode(0o777),
        _ => perms.remove(InodePerms::ALL_EXECUTE),
    }
    Presentation { uid, gid, perms }
}
