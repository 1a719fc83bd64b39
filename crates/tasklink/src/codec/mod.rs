//! Request/response codecs for tasks.
//!
//! A task carries one [`TaskCodec`] that turns its request into the bytes
//! handed to the transport and turns the transport's response bytes back
//! into a typed value. Two formats ship with the crate:
//!
//! - **binary**: compact binary encoding of any serde data model
//! - **json**: UTF-8 JSON, by default over `serde_json::Value` trees
//!
//! [`TaskHooks`] run synchronously around the codec on the dispatch worker.
//! A hook that blocks stalls every task behind it; hooks should only do
//! light finalization (filling tokens, timestamps) or post-processing.

pub mod binary;
pub mod json;

use bytes::Bytes;

pub use binary::BinaryCodec;
pub use json::JsonCodec;

/// Payloads above this size are logged at info level.
const LARGE_PAYLOAD_BYTES: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode request: {0}")]
    Encode(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Serializes a request and deserializes the matching response.
pub trait TaskCodec: Send + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn encode(&self, request: &Self::Request) -> Result<Bytes, CodecError>;

    fn decode(&self, buf: &[u8]) -> Result<Self::Response, CodecError>;
}

/// Extension points invoked immediately before encoding and immediately
/// after a successful decode.
///
/// `before_encode` runs on every submission attempt, so it runs again when
/// the transport is unavailable and the task is retried. Implementations
/// should be idempotent (overwrite fields rather than append).
pub trait TaskHooks<Req, Resp>: Send + 'static {
    fn before_encode(&mut self, _request: &mut Req) {}

    fn after_decode(&mut self, _response: &mut Resp) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl<Req, Resp> TaskHooks<Req, Resp> for NoHooks {}

pub(crate) fn trace_encoded(format: &'static str, len: usize) {
    tracing::trace!(target: "tasklink::codec", format, payload_size_bytes = len, "Encoded request");
    if len > LARGE_PAYLOAD_BYTES {
        tracing::info!(
            target: "tasklink::codec",
            format,
            payload_size_bytes = len,
            payload_size_kb = len / 1024,
            "Large request payload encoded"
        );
    }
}

pub(crate) fn trace_decoding(format: &'static str, len: usize) {
    tracing::trace!(target: "tasklink::codec", format, payload_size_bytes = len, "Decoding response");
}
