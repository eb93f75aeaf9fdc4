// packages/runner/src/protocol/transport.rs
//! Duplex message transport
//!
//! A [`Transport`] is a stream of inbound messages plus a sink for outbound
//! ones. The protocol never looks below this seam, so pipes, sockets and
//! in-memory pairs are interchangeable.

use crate::protocol::message::Message;
use crate::utils::errors::ProtocolError;
use bytes::{Buf, BytesMut};
use futures::future;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{info, warn};

/// Buffer size of each direction of an in-memory pair
const PAIR_BUFFER_BYTES: usize = 64 * 1024;

/// Longest inbound line kept; longer lines are dropped
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One line of worker output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// Line text, with invalid UTF-8 replaced
    Text(String),

    /// A line longer than the limit was dropped
    Oversize,
}

/// Splits a byte stream into lines without requiring UTF-8
///
/// Neither binary output nor an overlong line is an error: the stream of
/// lines keeps going after both.
#[derive(Debug, Clone)]
pub struct OutputLineCodec {
    max_length: usize,

    /// Where the next newline search starts
    next_index: usize,

    /// Dropping the rest of an overlong line
    discarding: bool,
}

impl OutputLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for OutputLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn text_line(bytes: &[u8]) -> OutputLine {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    OutputLine::Text(String::from_utf8_lossy(bytes).into_owned())
}

impl Decoder for OutputLineCodec {
    type Item = OutputLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<OutputLine>> {
        loop {
            let newline = buf[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(end)) => {
                    buf.advance(end + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    return Ok(Some(OutputLine::Oversize));
                }
                (true, None) => {
                    buf.advance(buf.len());
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(end)) if end > self.max_length => {
                    buf.advance(end + 1);
                    self.next_index = 0;
                    return Ok(Some(OutputLine::Oversize));
                }
                (false, Some(end)) => {
                    let line = buf.split_to(end + 1);
                    self.next_index = 0;
                    return Ok(Some(text_line(&line[..end])));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<OutputLine>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(Some(OutputLine::Oversize));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let line = buf.split();
        Ok(Some(text_line(&line)))
    }
}

/// Inbound half of a transport
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, ProtocolError>> + Send>>;

/// Outbound half of a transport
pub type MessageSink = Pin<Box<dyn Sink<Message, Error = ProtocolError> + Send>>;

/// A duplex message channel to the peer
pub struct Transport {
    reader: MessageStream,
    writer: MessageSink,
}

impl Transport {
    pub fn new(reader: MessageStream, writer: MessageSink) -> Self {
        Self { reader, writer }
    }

    /// Line-oriented transport over a byte stream (e.g. a child's stdout/stdin)
    ///
    /// Inbound lines without the message prefix are re-emitted as worker
    /// output; undecodable message lines and overlong lines are logged and
    /// skipped. Only a failing byte stream ends the reader.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader = FramedRead::new(reader, OutputLineCodec::new()).filter_map(|line| {
            future::ready(match line {
                Ok(OutputLine::Oversize) => {
                    warn!("Skipping worker output line longer than {} bytes", MAX_LINE_BYTES);
                    None
                }
                Ok(OutputLine::Text(line)) => match Message::decode(&line) {
                    Some(Ok(message)) => Some(Ok(message)),
                    Some(Err(e)) => {
                        warn!("Skipping undecodable protocol line: {}", e);
                        None
                    }
                    None => {
                        info!(target: "worker", "{}", line);
                        None
                    }
                },
                Err(e) => Some(Err(ProtocolError::Transport(e.to_string()))),
            })
        });

        let lines = FramedWrite::new(writer, LinesCodec::new());
        let lines = SinkExt::<String>::sink_map_err(lines, |e: LinesCodecError| {
            ProtocolError::Transport(e.to_string())
        });
        let writer =
            SinkExt::<String>::with(lines, |message: Message| future::ready(message.encode()));

        Self::new(Box::pin(reader), Box::pin(writer))
    }

    /// Two connected in-memory transports
    pub fn pair() -> (Transport, Transport) {
        let (left, right) = tokio::io::duplex(PAIR_BUFFER_BYTES);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (
            Transport::from_io(left_read, left_write),
            Transport::from_io(right_read, right_write),
        )
    }

    pub fn into_parts(self) -> (MessageStream, MessageSink) {
        (self.reader, self.writer)
    }
}
