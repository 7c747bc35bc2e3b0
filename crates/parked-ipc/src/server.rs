use crate::protocol::{ClientMessage, ServerMessage};
use crate::wire::{self, FrameReader};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tokio::net::unix::OwnedWriteHalf;
use tracing::debug;

/// The daemon's control socket. Owns the socket file and removes it on drop.
#[allow(missing_debug_implementations)]
pub struct IpcServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl IpcServer {
    /// Bind the control socket. A socket file still on disk from a daemon
    /// that died without cleaning up is replaced.
    pub fn bind(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create socket directory {}", parent.display())
            })?;
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;
        debug!(path = %socket_path.display(), "control socket bound");

        Ok(Self {
            socket_path,
            listener,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn accept(&self) -> Result<IpcConnection> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .context("failed to accept operator connection")?;
        let (reader, writer) = wire::split(stream);
        Ok(IpcConnection { reader, writer })
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// One operator or agent-runner connection as seen by the daemon.
#[allow(missing_debug_implementations)]
pub struct IpcConnection {
    reader: FrameReader,
    writer: OwnedWriteHalf,
}

impl IpcConnection {
    /// Next request, or `None` once the client hung up. A hang-up during
    /// `run_turn` is how the daemon learns to abort that turn.
    pub async fn recv(&mut self) -> Result<Option<ClientMessage>> {
        wire::read_frame(&mut self.reader).await
    }

    pub async fn send(&mut self, message: ServerMessage) -> Result<()> {
        wire::write_frame(&mut self.writer, &message).await
    }
}
