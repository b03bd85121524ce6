//! Package-based write policy layered on top of the ordinary mode check.

use super::TreeClass;
use crate::fs::AccessMask;
use crate::pkgdb::{AccessFlags, PackageSnapshot};

/// The object a write is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTarget {
    /// Classification of the target.
    pub tree: TreeClass,
    /// Presented owner of the target.
    pub owner: u32,
    /// Whether the target is the mount root.
    pub is_root: bool,
}

/// Decide whether `caller_uid` may perform `mask` on `target`.
///
/// Reads are never restricted here, nor are the owner and root. Other writers need a storage
/// grant from the package database: the media grant always suffices, the broad storage grant
/// suffices outside the protected Android subtree of a restricted mount and except for creating
/// entries directly in the root.
#[must_use]
pub fn check_write(
    target: WriteTarget,
    mask: AccessMask,
    caller_uid: u32,
    restricted: bool,
    packages: &PackageSnapshot,
) -> bool {
    if !mask.wants_write() || caller_uid == 0 || caller_uid == target.owner {
        return true;
    }

    let grants = packages.access_flags(caller_uid);
    if grants.contains(AccessFlags::MEDIA_RW) {
        return true;
    }
    if grants.contains(AccessFlags::SDCARD_RW) {
        let protected = restricted && target.tree.is_protected_android();
        let creating_in_root = mask.contains(AccessMask::CREATE) && target.is_root;
        return !protected && !creating_in_root;
    }
    false
}
