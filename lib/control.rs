//! Package-list control socket.
//!
//! Replaces the kernel's write-only `packages_list` control file. A producer connects, streams
//! raw package-list bytes and half-closes. Each connection owns one [`ListWriter`](crate::pkgdb::ListWriter), so a list may
//! span several writes but never several connections: a connection that ends before the blank
//! terminating line is answered with an error and its bytes are dropped. The server answers with
//! one status line before closing.
//!
//! The socket is created mode 0600 and only root or the daemon's own user may write to it.

use std::fs::Permissions;
use std::io;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::pkgdb::{IngestOutcome, PackageDb};

const READ_CHUNK: usize = 64 * 1024;
const SOCKET_MODE: u32 = 0o600;

/// Whether a peer running as `peer_uid` may replace the package list of a daemon running as
/// `owner_uid`.
fn peer_allowed(peer_uid: u32, owner_uid: u32) -> bool {
    peer_uid == 0 || peer_uid == owner_uid
}

/// Status line for a committed list.
fn committed_line(outcome: &IngestOutcome) -> String {
    format!(
        "ok committed={} skipped={} version={}\n",
        outcome.committed, outcome.skipped, outcome.version
    )
}

/// Serves package-list writes on a Unix socket.
#[derive(Debug)]
pub struct ControlServer {
    packages: Arc<PackageDb>,
    socket_path: PathBuf,
    owner_uid: u32,
}

impl ControlServer {
    /// A server feeding `packages` from connections to `socket_path`.
    #[must_use]
    pub fn new(packages: Arc<PackageDb>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            packages,
            socket_path: socket_path.into(),
            owner_uid: nix::unistd::geteuid().as_raw(),
        }
    }

    /// Path the server listens on.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket mode 0600, replacing a stale one left by a previous run.
    pub async fn bind(&self) -> io::Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => debug!(path = %self.socket_path.display(), "removed stale control socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        tokio::fs::set_permissions(&self.socket_path, Permissions::from_mode(SOCKET_MODE)).await?;
        info!(path = %self.socket_path.display(), "control socket listening");
        Ok(listener)
    }

    /// Accept connections until the task is cancelled, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream).await {
                            debug!(error = %e, "control connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "control socket accept failed"),
            }
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> io::Result<()> {
        let peer = stream.peer_cred()?;
        if !peer_allowed(peer.uid(), self.owner_uid) {
            warn!(uid = peer.uid(), pid = ?peer.pid(), "refusing control connection");
            stream.write_all(b"error: permission denied\n").await?;
            stream.shutdown().await?;
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }

        let mut writer = self.packages.writer();
        let mut buffer = vec![0u8; READ_CHUNK];
        let mut last = None;
        loop {
            let n = stream.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            match writer.ingest(&buffer[..n]) {
                Ok(Some(outcome)) => last = Some(outcome),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "rejecting package list write");
                    stream.write_all(format!("error: {e}\n").as_bytes()).await?;
                    stream.shutdown().await?;
                    return Err(io::Error::from_raw_os_error(i32::from(e)));
                }
            }
        }

        let status = match last {
            Some(outcome) if writer.pending() == 0 => committed_line(&outcome),
            _ => {
                debug!(pending = writer.pending(), "connection closed mid-list");
                "error: package list ended without a blank line; discarded\n".to_owned()
            }
        };
        drop(writer);
        stream.write_all(status.as_bytes()).await?;
        stream.shutdown().await
    }
}

/// Stream `list` to the control socket at `socket_path` and return the server's status line.
///
/// A status line starting with `error:` is returned as an error.
pub async fn push(socket_path: &Path, mut list: impl AsyncRead + Unpin) -> io::Result<String> {
    let mut stream = UnixStream::connect(socket_path).await?;
    tokio::io::copy(&mut list, &mut stream).await?;
    stream.shutdown().await?;

    let mut status = String::new();
    stream.read_to_string(&mut status).await?;
    let status = status.trim_end().to_owned();
    match status.strip_prefix("error: ") {
        Some(message) => Err(io::Error::other(message.to_owned())),
        None => Ok(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_root_and_the_owner_may_push() {
        assert!(peer_allowed(0, 1000));
        assert!(peer_allowed(1000, 1000));
        assert!(!peer_allowed(1001, 1000));
        assert!(peer_allowed(0, 0));
        assert!(!peer_allowed(10050, 0));
    }
}
