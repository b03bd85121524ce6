//! Pre-mount checks for FUSE and credential switching.

use std::os::unix::fs::FileTypeExt as _;
use std::path::Path;

use esdfs::cred::Identity;
use esdfs::options::MountOptions;

const FUSE_DEVICE: &str = "/dev/fuse";

/// Errors that can occur when verifying the host can run the daemon.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    /// The FUSE device node is missing.
    #[error(
        "{FUSE_DEVICE} not found. Load the fuse kernel module (modprobe fuse) or run the \
         container with --device /dev/fuse."
    )]
    NotInstalled,

    /// Something other than a character device sits at the device path.
    #[error("{FUSE_DEVICE} exists but is not a character device.")]
    NotADevice,

    /// Lower operations would need a credential switch this process cannot make.
    #[error(
        "lower={uid}:{gid} differs from the current identity and esdfs is not running as \
         root; lower-filesystem access would fail with EPERM."
    )]
    CannotSwitchIdentity {
        /// Requested lower uid.
        uid: u32,
        /// Requested lower gid.
        gid: u32,
    },
}

/// Verify that FUSE is available and that the lower identity in `options` is reachable.
pub fn ensure_fuse(options: &MountOptions) -> Result<(), FuseCheckError> {
    let meta = std::fs::metadata(Path::new(FUSE_DEVICE)).map_err(|_| FuseCheckError::NotInstalled)?;
    if !meta.file_type().is_char_device() {
        return Err(FuseCheckError::NotADevice);
    }

    let wanted = options.lower.identity();
    if wanted != Identity::current() && !nix::unistd::Uid::effective().is_root() {
        return Err(FuseCheckError::CannotSwitchIdentity {
            uid: wanted.uid,
            gid: wanted.gid,
        });
    }

    Ok(())
}
