use crate::error::ClientError;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use tracing::{debug, warn};

/// Marker that introduces a payload line in the event stream.
pub const FRAME_PREFIX: &str = "data: ";

/// Accumulates raw bytes and hands out complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Next complete line without its terminator (`\n` or `\r\n`).
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|byte| *byte == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Payload of a `data: ` line, or `None` for anything else.
fn frame_payload(line: &[u8]) -> Option<String> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(err) => {
            warn!(%err, "skipping stream line that is not valid UTF-8");
            return None;
        }
    };
    match text.strip_prefix(FRAME_PREFIX) {
        Some(payload) => Some(payload.to_string()),
        None => {
            if !text.is_empty() {
                debug!(line = text, "skipping non-data stream line");
            }
            None
        }
    }
}

/// Turns a response byte stream into `data: ` payload frames.
///
/// Owns its byte stream; once it reports the end or an error it stays
/// finished.
pub struct FrameDecoder<S> {
    bytes: S,
    buffer: LineBuffer,
    finished: bool,
}

impl<S, E> FrameDecoder<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    pub fn new(bytes: S) -> Self {
        Self {
            bytes,
            buffer: LineBuffer::default(),
            finished: false,
        }
    }

    /// `None` on clean end of stream; a read failure is reported once as
    /// [`ClientError::StreamRead`].
    pub async fn next_frame(&mut self) -> Option<Result<String, ClientError>> {
        loop {
            while let Some(line) = self.buffer.next_line() {
                if let Some(payload) = frame_payload(&line) {
                    return Some(Ok(payload));
                }
            }
            if self.finished {
                return None;
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => self.buffer.push(&chunk),
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(Err(ClientError::StreamRead(err.to_string())));
                }
                None => {
                    self.finished = true;
                    if self.buffer.has_partial() {
                        debug!("stream closed mid-line, discarding partial frame");
                    }
                    return None;
                }
            }
        }
    }
}
