//! Framing shared by both ends of the control socket: one JSON message per
//! line, blank lines ignored.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

pub(crate) type FrameReader = Lines<BufReader<OwnedReadHalf>>;

pub(crate) fn split(stream: UnixStream) -> (FrameReader, OwnedWriteHalf) {
    let (read_half, write_half) = stream.into_split();
    (BufReader::new(read_half).lines(), write_half)
}

/// Write one message, newline included, in a single write.
pub(crate) async fn write_frame<T: Serialize>(
    writer: &mut OwnedWriteHalf,
    message: &T,
) -> Result<()> {
    let mut frame = serde_json::to_string(message).context("failed to encode message")?;
    frame.push('\n');
    writer
        .write_all(frame.as_bytes())
        .await
        .context("failed to write message")?;
    writer.flush().await.context("failed to flush message")
}

/// Next message, or `None` when the peer closed its end.
pub(crate) async fn read_frame<T: DeserializeOwned>(
    reader: &mut FrameReader,
) -> Result<Option<T>> {
    while let Some(line) = reader.next_line().await.context("failed to read message")? {
        if line.trim().is_empty() {
            continue;
        }
        let message = serde_json::from_str(&line)
            .with_context(|| format!("failed to decode message: {line}"))?;
        return Ok(Some(message));
    }
    Ok(None)
}
