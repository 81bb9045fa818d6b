//! Messages into and out of the control loop

use super::state::ConversationState;
use crate::stream::{RequestId, StreamEvent};
use crate::voice::RecognitionEvent;

/// Input to the control loop
///
/// Collaborators running on their own threads report through these, so
/// every state change happens on the loop, one event at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Start the session
    Start,
    /// Stop the session
    Stop,
    /// Stop the session and end the control loop
    Shutdown,
    /// The wake engine heard the wake word
    Wake { keyword: String },
    /// The wake engine's capture failed and it has stopped
    CaptureFailed(String),
    /// Recognizer output for a listening attempt
    Recognition {
        attempt: u64,
        event: RecognitionEvent,
    },
    /// Streaming client output for a request
    Stream {
        request: RequestId,
        event: StreamEvent,
    },
    /// The playback queue drained
    PlaybackComplete { generation: u64 },
    /// A scheduled re-entry into listening is due
    Resume { token: u64 },
    /// Change the continuous dialog preference
    SetContinuousDialog(bool),
}

/// Output of the control loop for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// State changed
    State {
        from: ConversationState,
        to: ConversationState,
    },
    /// Intermediate transcript
    PartialTranscript(String),
    /// Final transcript sent as the query
    Transcript(String),
    /// Reply fragment
    ResponseText(String),
    /// Full reply once the stream completes
    ResponseComplete(String),
    /// The answer in progress was cut off by a wake word
    Interrupted,
    /// Something went wrong; the session carries on unless it stopped
    Error(String),
}
