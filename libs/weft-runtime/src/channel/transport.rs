//! Frame transports underneath a capability channel.
//!
//! A transport is a pair of unbounded queues of [`Envelope`]s. Backends adapt their
//! I/O into this shape: the in-process backend wires two transports together,
//! the process backend pumps newline-delimited JSON over the child's stdio.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec};

use crate::protocol::Envelope;

/// Longest accepted line; a longer line is dropped and reading continues.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub struct Transport {
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl Transport {
    /// Two connected in-memory endpoints.
    #[must_use]
    pub fn pair() -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Transport {
                outbound: a_tx,
                inbound: b_rx,
            },
            Transport {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Newline-delimited decoder that never fails on content.
///
/// Invalid UTF-8 is replaced rather than rejected and overlong lines are
/// skipped, so only I/O errors end the stream.
#[derive(Debug, Default)]
pub struct LossyLineCodec {
    /// Offset already scanned for a newline.
    next_index: usize,
    /// Inside an overlong line; drop bytes until its newline.
    discarding: bool,
}

impl LossyLineCodec {
    fn take_line(buf: &mut BytesMut, len: usize, consumed: usize) -> String {
        let raw = buf.split_to(consumed);
        let line = raw[..len].strip_suffix(b"\r").unwrap_or(&raw[..len]);
        String::from_utf8_lossy(line).into_owned()
    }
}

impl Decoder for LossyLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, std::io::Error> {
        loop {
            let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');
            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(offset)) => {
                    let len = self.next_index + offset;
                    self.next_index = 0;
                    if len > MAX_FRAME_LEN {
                        tracing::warn!(len, "Dropping overlong line");
                        buf.advance(len + 1);
                        continue;
                    }
                    return Ok(Some(Self::take_line(buf, len, len + 1)));
                }
                (false, None) if buf.len() > MAX_FRAME_LEN => {
                    tracing::warn!(len = buf.len(), "Dropping overlong line");
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, std::io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        let len = buf.len();
        Ok(Some(Self::take_line(buf, len, len)))
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("outbound_closed", &self.outbound.is_closed())
            .finish_non_exhaustive()
    }
}

/// Pump newline-delimited JSON frames over a byte stream pair.
///
/// Lines read from `reader` that do not decode as an envelope are handed to
/// `on_line` (typically the log forwarder). The returned handles finish when the
/// respective side of the stream closes.
pub fn spawn_line_transport<R, W, F>(
    reader: R,
    writer: W,
    on_line: F,
) -> (Transport, JoinHandle<()>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Fn(&str) + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();

    let read_task = tokio::spawn(async move {
        let mut lines = FramedRead::new(reader, LossyLineCodec::default());
        while let Some(item) = lines.next().await {
            let line = match item {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "Frame reader failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match Envelope::decode(&line) {
                Ok(envelope) => {
                    if in_tx.send(envelope).is_err() {
                        break;
                    }
                }
                Err(_) => on_line(&line),
            }
        }
    });

    let write_task = tokio::spawn(async move {
        let mut sink = FramedWrite::new(writer, LinesCodec::new());
        while let Some(envelope) = out_rx.recv().await {
            let line = match envelope.encode() {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(kind = envelope.body.kind(), error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                tracing::debug!(error = %e, "Frame writer closed");
                break;
            }
        }
    });

    (
        Transport {
            outbound: out_tx,
            inbound: in_rx,
        },
        read_task,
        write_task,
    )
}
