//! Streaming text service
//!
//! Queries go out as one HTTPS POST each; the reply comes back as
//! line-delimited event records that are forwarded fragment by fragment.

mod client;
mod record;

pub use client::{
    ChatRequest, RequestId, RequestSettings, StreamEvent, StreamHandle, StreamSink,
    StreamingTextClient, TextStreamer,
};
pub use record::{EVENT_MARKER, LineBuffer, StreamRecord, TEXT_RECORD, parse_line, text_fragment};
