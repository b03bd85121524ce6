//! Scoped credential override for operations on the lower filesystem.
//!
//! Lower-filesystem calls run as the mount's configured lower identity rather than as the daemon
//! or the caller. The switch is per-thread: the raw `setresuid`/`setresgid` syscalls only touch the
//! calling thread, unlike the libc wrappers which broadcast the change to every thread in the
//! process. [`CredGuard`] restores the previous identity (and security label) when dropped, on
//! every exit path.

use std::fs::OpenOptions;
use std::io::{self, Read as _, Write as _};

use thiserror::Error;
use tracing::{error, warn};

/// A uid/gid pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

impl Identity {
    /// The calling thread's effective identity.
    #[must_use]
    pub fn current() -> Self {
        Self {
            uid: effective_uid(),
            gid: effective_gid(),
        }
    }
}

/// Failures acquiring a credential override.
#[derive(Debug, Error)]
pub enum CredError {
    /// The thread could not assume the identity.
    #[error("cannot switch to uid {uid} gid {gid}: {source}")]
    Switch {
        /// Requested uid.
        uid: u32,
        /// Requested gid.
        gid: u32,
        /// Underlying syscall failure.
        source: io::Error,
    },
    /// The file-creation security label could not be set.
    #[error("cannot set file creation label: {0}")]
    Label(#[source] io::Error),
}

impl From<CredError> for io::Error {
    fn from(e: CredError) -> Self {
        match e {
            CredError::Switch { source, .. } | CredError::Label(source) => {
                io::Error::from_raw_os_error(source.raw_os_error().unwrap_or(libc::EPERM))
            }
        }
    }
}

#[cfg(not(target_arch = "arm"))]
mod nr {
    pub const SETRESUID: libc::c_long = libc::SYS_setresuid;
    pub const SETRESGID: libc::c_long = libc::SYS_setresgid;
    pub const GETEUID: libc::c_long = libc::SYS_geteuid;
    pub const GETEGID: libc::c_long = libc::SYS_getegid;
}

#[cfg(target_arch = "arm")]
mod nr {
    pub const SETRESUID: libc::c_long = libc::SYS_setresuid32;
    pub const SETRESGID: libc::c_long = libc::SYS_setresgid32;
    pub const GETEUID: libc::c_long = libc::SYS_geteuid32;
    pub const GETEGID: libc::c_long = libc::SYS_getegid32;
}

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "ids are 32-bit"
)]
fn effective_uid() -> u32 {
    // SAFETY: takes no arguments and cannot fail.
    unsafe { libc::syscall(nr::GETEUID) as u32 }
}

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "ids are 32-bit"
)]
fn effective_gid() -> u32 {
    // SAFETY: takes no arguments and cannot fail.
    unsafe { libc::syscall(nr::GETEGID) as u32 }
}

macro_rules! scoped_id {
    ($name:ident, $syscall_nr:expr) => {
        #[derive(Debug)]
        struct $name {
            old: u32,
        }

        impl $name {
            /// Switch the thread's effective id to `val`; `None` when it already is `val`.
            fn new(val: u32, old: u32) -> io::Result<Option<Self>> {
                if val == old {
                    return Ok(None);
                }
                // SAFETY: no memory is touched; the return value is checked.
                let res = unsafe { libc::syscall($syscall_nr, -1, val, -1) };
                if res == 0 {
                    Ok(Some(Self { old }))
                } else {
                    Err(io::Error::last_os_error())
                }
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                // SAFETY: no memory is touched; the return value is checked.
                let res = unsafe { libc::syscall($syscall_nr, -1, self.old, -1) };
                if res < 0 {
                    error!(
                        old = self.old,
                        error = %io::Error::last_os_error(),
                        "failed to restore credentials"
                    );
                }
            }
        }
    };
}

scoped_id!(ScopedUid, nr::SETRESUID);
scoped_id!(ScopedGid, nr::SETRESGID);

const FSCREATE_ATTR: &str = "/proc/thread-self/attr/fscreate";

/// Holds the thread's previous file-creation label.
#[derive(Debug)]
struct ScopedLabel {
    old: Vec<u8>,
}

impl ScopedLabel {
    fn new(label: &str) -> io::Result<Self> {
        let mut old = Vec::new();
        OpenOptions::new()
            .read(true)
            .open(FSCREATE_ATTR)?
            .read_to_end(&mut old)?;
        write_fscreate(label.as_bytes())?;
        Ok(Self { old })
    }
}

impl Drop for ScopedLabel {
    fn drop(&mut self) {
        if let Err(error) = write_fscreate(&self.old) {
            warn!(%error, "failed to restore file creation label");
        }
    }
}

fn write_fscreate(value: &[u8]) -> io::Result<()> {
    // A lone NUL resets the label to the default.
    let value = if value.is_empty() { b"\0".as_slice() } else { value };
    OpenOptions::new()
        .write(true)
        .open(FSCREATE_ATTR)?
        .write_all(value)
}

/// Restores the thread's identity and label on drop.
///
/// Fields drop in declaration order: label, uid, then gid. The uid must come back before the gid
/// because changing the gid needs the privileges the original uid holds.
#[derive(Debug)]
#[must_use = "the override ends when the guard is dropped"]
pub struct CredGuard {
    _label: Option<ScopedLabel>,
    _uid: Option<ScopedUid>,
    _gid: Option<ScopedGid>,
}

impl CredGuard {
    /// Assume `id` (and optionally `label`) on the calling thread.
    pub fn acquire(id: Identity, label: Option<&str>) -> Result<Self, CredError> {
        let current = Identity::current();
        let switch = |source| CredError::Switch {
            uid: id.uid,
            gid: id.gid,
            source,
        };
        // The gid goes first: once the uid is dropped the gid can no longer be changed.
        let gid = ScopedGid::new(id.gid, current.gid).map_err(switch)?;
        let uid = ScopedUid::new(id.uid, current.uid).map_err(switch)?;
        let label = label
            .map(ScopedLabel::new)
            .transpose()
            .map_err(CredError::Label)?;
        Ok(Self {
            _label: label,
            _uid: uid,
            _gid: gid,
        })
    }
}

/// Run `f` as `id`, restoring the previous identity afterwards.
pub fn with_overridden_identity<T>(
    id: Identity,
    label: Option<&str>,
    f: impl FnOnce() -> io::Result<T>,
) -> io::Result<T> {
    let _guard = CredGuard::acquire(id, label)?;
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overriding_to_self_is_a_no_op() {
        let me = Identity::current();
        let guard = CredGuard::acquire(me, None).unwrap();
        assert!(guard._uid.is_none());
        assert!(guard._gid.is_none());
        drop(guard);
        assert_eq!(Identity::current(), me);
    }

    #[test]
    fn closure_result_is_returned_and_identity_restored() {
        let me = Identity::current();
        let out = with_overridden_identity(me, None, || Ok(7)).unwrap();
        assert_eq!(out, 7);
        let err = with_overridden_identity(me, None, || -> io::Result<()> {
            Err(io::Error::from_raw_os_error(libc::ENOSPC))
        })
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));
        assert_eq!(Identity::current(), me);
    }

    #[test]
    fn unprivileged_switch_fails_cleanly() {
        let me = Identity::current();
        if me.uid == 0 {
            return;
        }
        let other = Identity {
            uid: me.uid.wrapping_add(1),
            gid: me.gid,
        };
        let err = CredGuard::acquire(other, None).unwrap_err();
        assert!(matches!(err, CredError::Switch { .. }));
        assert_eq!(Identity::current(), me);
    }
}
