//! Byte transport for the control connection.
//!
//! Provides split reader/writer halves:
//! - [`FrameReader`] yields decoded [`Frame`]s via async stream
//! - [`FrameWriter`] encodes and sends [`Command`]s
//!
//! How the bytes are carried is behind [`Connector`]; [`TcpConnector`]
//! is the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument, trace};

use crate::codec::{self, Frame, FrameBuffer};
use crate::msg::Command;
use crate::{Error, Result};

const READ_CHUNK: usize = 4096;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens a fresh byte stream to the server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(BoxedReader, BoxedWriter)>;
}

/// Plain TCP to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    #[instrument(skip(self), fields(addr = %self.addr))]
    async fn connect(&self) -> Result<(BoxedReader, BoxedWriter)> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "TCP connected");
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }
}

/// Connect with a deadline.
pub async fn connect_with_timeout(
    connector: &dyn Connector,
    timeout: Duration,
) -> Result<(BoxedReader, BoxedWriter)> {
    tokio::time::timeout(timeout, connector.connect())
        .await
        .map_err(|_| {
            Error::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })?
}

// ============================================================================
// Reader
// ============================================================================

/// Reader half of a connection.
///
/// Convert to a stream of frames with `into_stream()`.
pub struct FrameReader {
    io: BoxedReader,
}

impl FrameReader {
    pub fn new(io: BoxedReader) -> Self {
        Self { io }
    }

    /// Convert into an async stream of frames.
    ///
    /// Reads may split or merge frames arbitrarily; the stream yields whole
    /// frames in order. It ends at EOF and fails on a malformed length.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Frame>> {
        async_stream::try_stream! {
            let mut buf = FrameBuffer::new();
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                let n = self.io.read(&mut chunk).await?;
                if n == 0 {
                    debug!(pending = buf.pending(), "RX: EOF");
                    break;
                }
                trace!(n, "RX: Bytes");
                buf.extend(&chunk[..n]);
                while let Some(frame) = buf.next_frame()? {
                    yield frame;
                }
            }
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Writer half of a connection.
pub struct FrameWriter {
    io: BoxedWriter,
}

impl FrameWriter {
    pub fn new(io: BoxedWriter) -> Self {
        Self { io }
    }

    /// Encode and send one command.
    pub async fn send(&mut self, cmd: &Command) -> Result<()> {
        debug!("TX: {}", describe(cmd));
        let bytes = codec::encode(cmd)?;
        self.io.write_all(&bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Shut down the write side.
    pub async fn close(&mut self) -> Result<()> {
        debug!("TX: Close");
        self.io.shutdown().await?;
        Ok(())
    }
}

/// One-line summary of a command for logs.
pub fn describe(cmd: &Command) -> String {
    match cmd {
        Command::Handshake { capabilities: c } => format!(
            "HELO name={:?} model={:?} reconnect={} formats={}",
            c.name,
            c.model,
            c.reconnect,
            c.formats.len()
        ),
        Command::StreamDirective(d) => format!(
            "strm {:?} format={:?} offset={}ms",
            d.code,
            d.format,
            d.start_offset.as_millis()
        ),
        Command::SettingRequest { id, payload } => {
            format!("setd id={id} len={}", payload.len())
        }
        Command::GainUpdate(g) => format!("audg {:.3}/{:.3}", g.left, g.right),
        Command::StatusReport(r) => format!(
            "STAT {} pos={}ms",
            String::from_utf8_lossy(r.kind.code()),
            r.position.as_millis()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::StatusReport;
    use crate::types::StatusKind;
    use futures::StreamExt;

    fn stat(kind: StatusKind, ms: u64) -> Command {
        Command::StatusReport(StatusReport::new(kind, Duration::from_millis(ms)))
    }

    #[tokio::test]
    async fn writer_frames_reach_reader_in_order() {
        let (client, server) = tokio::io::duplex(64);
        let (_client_rd, client_wr) = tokio::io::split(client);
        let (server_rd, _server_wr) = tokio::io::split(server);

        let mut writer = FrameWriter::new(Box::new(client_wr));
        let frames = FrameReader::new(Box::new(server_rd)).into_stream();
        tokio::pin!(frames);

        let sent = vec![
            stat(StatusKind::Connected, 0),
            stat(StatusKind::Heartbeat, 1234),
            stat(StatusKind::Flushed, 99),
        ];
        let to_send = sent.clone();
        let send = tokio::spawn(async move {
            for cmd in &to_send {
                writer.send(cmd).await.unwrap();
            }
            writer.close().await.unwrap();
        });

        let mut got = Vec::new();
        while let Some(frame) = frames.next().await {
            got.push(Command::decode(&frame.unwrap()).unwrap());
        }
        send.await.unwrap();
        assert_eq!(got, sent);
    }

    #[tokio::test]
    async fn malformed_length_ends_stream_with_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let (server_rd, _server_wr) = tokio::io::split(server);
        client.write_all(&[0, 0, 0, 0]).await.unwrap();

        let frames = FrameReader::new(Box::new(server_rd)).into_stream();
        tokio::pin!(frames);
        let first = frames.next().await.unwrap();
        assert!(matches!(first, Err(Error::MalformedFrame { len: 0 })));
        assert!(frames.next().await.is_none());
    }

    #[test]
    fn describe_names_status_code() {
        assert_eq!(describe(&stat(StatusKind::Paused, 5)), "STAT STMp pos=5ms");
    }
}
