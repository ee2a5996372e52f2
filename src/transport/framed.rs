//! Line-framed stream transport.
//!
//! Wire format: a 4-byte little-endian payload length followed by that
//! many bytes of UTF-8 JSON; one request per frame. Responses are framed
//! the same way and may be written out of request order — requests are
//! handled concurrently, a writer task serialises the frames.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Transport;
use crate::protocol::ProtocolHandler;
use crate::{HuginnError, Result};

/// Frames larger than this are rejected rather than buffered.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Encode one payload into a length-prefixed frame.
pub fn encode_frame(payload: &str) -> Vec<u8> {
    let bytes = payload.as_bytes();
    let mut frame = Vec::with_capacity(4 + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(bytes);
    frame
}

/// Decode one frame from a buffer. Returns the payload and the bytes
/// consumed, or `None` when the buffer does not yet hold a whole frame.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(String, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(HuginnError::invalid_input(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
        )));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let payload = std::str::from_utf8(&buf[4..4 + len])
        .map_err(|e| HuginnError::invalid_input(format!("frame is not UTF-8: {e}")))?
        .to_string();
    Ok(Some((payload, 4 + len)))
}

/// Read one frame from an async reader. `Ok(None)` is clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(HuginnError::Internal(format!("frame read: {e}"))),
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(HuginnError::invalid_input(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
        )));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| HuginnError::Internal(format!("frame read: {e}")))?;
    String::from_utf8(payload)
        .map(Some)
        .map_err(|e| HuginnError::invalid_input(format!("frame is not UTF-8: {e}")))
}

/// Write one frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &str) -> Result<()> {
    writer
        .write_all(&encode_frame(payload))
        .await
        .map_err(|e| HuginnError::Internal(format!("frame write: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| HuginnError::Internal(format!("frame flush: {e}")))
}

/// The stdio (or any stream pair) transport.
#[derive(Default)]
pub struct FramedTransport;

impl FramedTransport {
    /// Serve one stream pair. Used directly by tests with in-memory
    /// duplex streams; [`Transport::serve`] wires it to stdio.
    pub async fn serve_stream<R, W>(
        protocol: Arc<ProtocolHandler>,
        mut reader: R,
        mut writer: W,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection = protocol.connection();
        // Bounded fan-in: concurrent handlers block when the writer falls
        // behind instead of buffering unbounded frames.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(64);

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &message).await {
                    warn!(error = %e, "response write failed");
                    break;
                }
            }
        });

        info!("framed transport ready");
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(Some(raw)) => {
                    debug!(bytes = raw.len(), "frame received");
                    let connection = connection.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Some(response) = connection.handle_raw(&raw).await {
                            match serde_json::to_string(&response) {
                                Ok(encoded) => {
                                    let _ = tx.send(encoded).await;
                                }
                                Err(e) => warn!(error = %e, "response encode failed"),
                            }
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "bad frame, closing connection");
                    break;
                }
            }
        }

        // Closing the transport cancels all in-flight requests.
        connection.close();
        drop(tx);
        let _ = writer_task.await;
        info!("framed transport closed");
        Ok(())
    }
}

#[async_trait]
impl Transport for FramedTransport {
    async fn serve(
        self: Box<Self>,
        protocol: Arc<ProtocolHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        Self::serve_stream(protocol, tokio::io::stdin(), tokio::io::stdout(), shutdown).await
    }
}
