use std::sync::Arc;

use tokio::select;

use esdfs::control::ControlServer;
use esdfs::fs::EsdFs;
use esdfs::lower::HostLower;
use esdfs::pkgdb::PackageDb;

use crate::app_config;
use tracing::{debug, error, info};

mod managed_fuse {
    //! Lifecycle of the FUSE session. fuser only does a regular unmount when the
    //! `BackgroundSession` is dropped; we detach the mount aggressively afterwards so a busy
    //! mount point does not outlive the daemon.
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use nix::errno::Errno;

    use super::{EsdFs, HostLower, debug, error};
    use esdfs::fs::fuser::FuserAdapter;
    use fuser::BackgroundSession;

    pub struct FuseCoreScope {
        _session: BackgroundSession,
    }

    impl FuseCoreScope {
        fn spawn(
            fs: Arc<EsdFs<HostLower>>,
            mount_point: PathBuf,
            allow_other: bool,
        ) -> Result<Self, std::io::Error> {
            let fuse_adapter = FuserAdapter::new(fs);
            let mut mount_opts = vec![
                fuser::MountOption::FSName("esdfs".to_owned()),
                fuser::MountOption::Subtype("esdfs".to_owned()),
                fuser::MountOption::NoDev,
                fuser::MountOption::NoSuid,
                fuser::MountOption::DefaultPermissions,
            ];
            if allow_other {
                mount_opts.push(fuser::MountOption::AllowOther);
            }

            Ok(Self {
                _session: fuser::spawn_mount2(fuse_adapter, mount_point, &mount_opts)?,
            })
        }
    }

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(mount_point: PathBuf) -> Self {
            Self { mount_point }
        }

        pub fn spawn(
            &self,
            fs: Arc<EsdFs<HostLower>>,
            allow_other: bool,
        ) -> Result<FuseCoreScope, std::io::Error> {
            FuseCoreScope::spawn(fs, self.mount_point.clone(), allow_other)
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for i in 0..UMOUNT_ATTEMPT_COUNT {
                let result = {
                    #[cfg(target_os = "macos")]
                    {
                        nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE)
                    }

                    #[cfg(target_os = "linux")]
                    {
                        nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH)
                    }
                };

                match result {
                    Ok(()) => {
                        debug!(
                            "Successfully unmounted FUSE filesystem on attempt {}",
                            i + 1
                        );
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(
                            "FUSE filesystem still busy on attempt {}. Retrying...",
                            i + 1
                        );
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!("FUSE filesystem already unmounted (attempt {})", i + 1);
                        break;
                    }
                    Err(e) => {
                        error!(
                            "Failed to unmount FUSE filesystem on attempt {}: {}",
                            i + 1,
                            e
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &std::path::Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Main entry point for the daemon.
pub async fn run(config: app_config::Config) -> Result<(), std::io::Error> {
    let options = config
        .parsed_mount_options()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let lower_path = config.lower_path.clone().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "no lower directory configured")
    })?;

    prepare_mount_point(&config.mount_point).await?;

    let packages = Arc::new(PackageDb::new());
    let control = Arc::new(ControlServer::new(
        Arc::clone(&packages),
        config.control_socket.clone(),
    ));
    let listener = control.bind().await?;
    let control_task = tokio::spawn(Arc::clone(&control).serve(listener));

    let fs = Arc::new(EsdFs::mount(
        HostLower::new(),
        lower_path.clone(),
        options,
        packages,
    )?);

    info!(
        lower = %lower_path.display(),
        mount_point = %config.mount_point.display(),
        options = %fs.options(),
        "Mounting filesystem."
    );

    let fuse = managed_fuse::ManagedFuse::new(config.mount_point.clone());
    {
        let _session = fuse.spawn(fs, config.allow_other)?;
        info!("esdfs is running. Press Ctrl+C to stop.");

        wait_for_exit().await?;
    }

    control_task.abort();
    if let Err(e) = tokio::fs::remove_file(control.socket_path()).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        error!(error = %e, "Failed to remove control socket.");
    }
    Ok(())
}

pub fn spawn(config: app_config::Config) -> Result<(), std::io::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}
