use crate::error::ClientError;
use crate::frame::FrameDecoder;
use crate::models::Message;
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use std::fmt::Display;
use tracing::{debug, warn};

/// One parsed event of a streamed reply.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Init {
        #[serde(default)]
        conversation_id: Option<i64>,
        /// Persisted copy of the user message, when the service sends it.
        #[serde(default)]
        message: Option<Message>,
    },
    Chunk {
        #[serde(default)]
        content: String,
    },
    Done {
        #[serde(default)]
        conversation_id: Option<i64>,
        #[serde(default)]
        assistant_message: Option<Message>,
    },
    Error {
        #[serde(default, alias = "message")]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Chunk { .. } => "chunk",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// Decode one frame payload. Malformed JSON and unknown event types are
/// logged and skipped.
pub fn parse_frame(payload: &str) -> Option<StreamEvent> {
    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(StreamEvent::Unknown) => {
            debug!(payload, "skipping stream event with unknown type");
            None
        }
        Ok(event) => Some(event),
        Err(err) => {
            warn!(%err, payload, "skipping malformed stream frame");
            None
        }
    }
}

/// Frames from a [`FrameDecoder`] parsed into [`StreamEvent`]s, in arrival order.
pub struct EventStream<S> {
    frames: FrameDecoder<S>,
}

impl<S, E> EventStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    pub fn new(frames: FrameDecoder<S>) -> Self {
        Self { frames }
    }

    pub fn from_bytes(bytes: S) -> Self {
        Self::new(FrameDecoder::new(bytes))
    }

    pub async fn next_event(&mut self) -> Option<Result<StreamEvent, ClientError>> {
        loop {
            match self.frames.next_frame().await? {
                Ok(payload) => {
                    if let Some(event) = parse_frame(&payload) {
                        return Some(Ok(event));
                    }
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
