//! chatsync-wire: wire layer for the chat event stream
//!
//! This crate turns the raw bytes of the backend's event stream into typed
//! envelopes: record framing, UTF-8 decoding across reads, and the envelope
//! decoder/validator. It also holds the transports that open the stream and
//! the retrieval client for history and task state.

pub mod envelope;
pub mod error;
pub mod frame;
pub mod retrieval;
pub mod transport;
pub mod types;

pub use envelope::{
    ChunkPayload, EnvelopeBody, EnvelopeKind, ErrorEvent, EventEnvelope, FinalPayload,
    MessageComplete, StreamChunk, TaskOperation, TurnStart, decode, decode_frame, try_decode,
};
pub use error::{DecodeError, Error, Result};
pub use frame::{Frame, FrameBuffer, Utf8ChunkDecoder, parse_frame, split_records};
pub use retrieval::{Endpoints, RetrievalClient};
pub use transport::{ByteStream, ChatRequest, ChatTransport, HttpTransport, ReplayTransport};
pub use types::*;
