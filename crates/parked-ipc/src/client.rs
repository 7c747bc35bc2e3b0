use crate::protocol::{ClientMessage, PROTOCOL_VERSION, ServerMessage};
use crate::wire::{self, FrameReader};
use anyhow::{Context, Result, anyhow, bail};
use std::path::Path;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;

/// Operator side of the control socket, used by `parked deliver`, `run`,
/// `watch` and the other client commands.
///
/// Requests are answered in order on the same connection. `run` and `watch`
/// keep reading after the first reply, so those use `send` and `recv`
/// directly instead of `request`.
#[allow(missing_debug_implementations)]
pub struct IpcClient {
    reader: FrameReader,
    writer: OwnedWriteHalf,
}

impl IpcClient {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
        let (reader, writer) = wire::split(stream);
        Ok(Self { reader, writer })
    }

    /// Connect and agree on the protocol version before anything is
    /// delivered. Returns the id of the daemon that answered.
    pub async fn connect_with_handshake(socket_path: &Path) -> Result<(Self, String)> {
        let mut client = Self::connect(socket_path).await?;
        let reply = client
            .request(ClientMessage::Hello {
                version: PROTOCOL_VERSION,
            })
            .await?;
        match reply {
            ServerMessage::Hello { version, daemon_id } if version == PROTOCOL_VERSION => {
                Ok((client, daemon_id))
            }
            ServerMessage::Hello { version, .. } => {
                bail!("daemon speaks protocol {version}, expected {PROTOCOL_VERSION}")
            }
            ServerMessage::Error { message } => bail!("daemon refused connection: {message}"),
            other => bail!("unexpected handshake reply: {other:?}"),
        }
    }

    pub async fn send(&mut self, message: ClientMessage) -> Result<()> {
        wire::write_frame(&mut self.writer, &message).await
    }

    /// Next message from the daemon. A closed connection is an error here:
    /// the client only reads when it expects an answer or a turn event.
    pub async fn recv(&mut self) -> Result<ServerMessage> {
        wire::read_frame(&mut self.reader)
            .await?
            .ok_or_else(|| anyhow!("daemon closed the connection"))
    }

    pub async fn request(&mut self, message: ClientMessage) -> Result<ServerMessage> {
        self.send(message).await?;
        self.recv().await
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::IpcServer;
    use serde_json::json;

    fn socket_in(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("parked.sock")
    }

    #[tokio::test]
    async fn handshake_returns_daemon_id() {
        let dir = tempfile::tempdir().unwrap();
        let server = IpcServer::bind(socket_in(&dir)).unwrap();

        let server_task = tokio::spawn(async move {
            let mut connection = server.accept().await.unwrap();
            assert_eq!(
                connection.recv().await.unwrap(),
                Some(ClientMessage::Hello {
                    version: PROTOCOL_VERSION
                })
            );
            connection
                .send(ServerMessage::Hello {
                    version: PROTOCOL_VERSION,
                    daemon_id: "mailroom".into(),
                })
                .await
                .unwrap();
        });

        let (_client, daemon_id) = IpcClient::connect_with_handshake(&socket_in(&dir))
            .await
            .unwrap();
        assert_eq!(daemon_id, "mailroom");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_other_protocol_version() {
        let dir = tempfile::tempdir().unwrap();
        let server = IpcServer::bind(socket_in(&dir)).unwrap();

        let server_task = tokio::spawn(async move {
            let mut connection = server.accept().await.unwrap();
            let _ = connection.recv().await.unwrap();
            connection
                .send(ServerMessage::Hello {
                    version: PROTOCOL_VERSION + 1,
                    daemon_id: "main".into(),
                })
                .await
                .unwrap();
        });

        let err = IpcClient::connect_with_handshake(&socket_in(&dir))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("protocol"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn delivery_request_gets_its_ack() {
        let dir = tempfile::tempdir().unwrap();
        let server = IpcServer::bind(socket_in(&dir)).unwrap();

        let server_task = tokio::spawn(async move {
            let mut connection = server.accept().await.unwrap();
            let Some(ClientMessage::Deliver {
                conversation_id,
                call_id,
                payload,
                ..
            }) = connection.recv().await.unwrap()
            else {
                panic!("expected a delivery");
            };
            assert_eq!(payload, json!({"status": "approved"}));
            connection
                .send(ServerMessage::Delivery {
                    conversation_id,
                    call_id,
                    ack: parked_core::DeliveryAck::AlreadyResolved,
                })
                .await
                .unwrap();
        });

        let mut client = IpcClient::connect(&socket_in(&dir)).await.unwrap();
        let reply = client
            .request(ClientMessage::Deliver {
                conversation_id: "conv".into(),
                call_id: "c1".into(),
                payload: json!({"status": "approved"}),
                success: true,
            })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            ServerMessage::Delivery {
                ack: parked_core::DeliveryAck::AlreadyResolved,
                ..
            }
        ));
        server_task.await.unwrap();

        // The daemon hung up after answering.
        assert!(client.recv().await.is_err());
    }

    #[tokio::test]
    async fn connect_without_daemon_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(IpcClient::connect(&socket_in(&dir)).await.is_err());
    }
}
