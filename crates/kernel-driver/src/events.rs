//! Typed kernel events decoded from raw iopub traffic.
//!
//! The driver reads `JupyterMessage`s off the iopub socket and narrows them
//! to the handful of shapes the notebook routes to cells. Everything else
//! (comm traffic, input echoes, clear_output, ...) is dropped at this
//! boundary so the consumer never sees a raw protocol message.

use jupyter_protocol::{JupyterMessage, JupyterMessageContent, MediaType};

/// Which standard stream a piece of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        }
    }
}

/// Decoded payload of a kernel event relevant to cell execution.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// stdout/stderr text.
    Stream { name: StreamName, text: String },
    /// The result value of an execution, text/plain representation.
    ExecuteResult { text: String },
    /// A rich display payload, text/plain representation.
    DisplayData { text: String },
    /// An exception and its rendered traceback.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    /// The kernel started working on a request.
    Busy,
    /// The kernel went idle: all output for the request has been emitted.
    Idle,
    /// The connection died; no further events will arrive.
    Disconnected,
}

/// One kernel event, tagged with the correlation token (the `msg_id` of the
/// execute_request that caused it, taken from the parent header).
#[derive(Debug, Clone)]
pub struct KernelEvent {
    pub token: Option<String>,
    pub payload: EventPayload,
}

impl KernelEvent {
    pub fn disconnected() -> Self {
        KernelEvent {
            token: None,
            payload: EventPayload::Disconnected,
        }
    }
}

/// Extract the text/plain representation from a media bundle.
fn plain_text(media: &jupyter_protocol::Media) -> Option<String> {
    media.content.iter().find_map(|m| match m {
        MediaType::Plain(text) => Some(text.clone()),
        _ => None,
    })
}

/// Decode an iopub message into a `KernelEvent`, if it is one we route.
///
/// Results and display payloads without a text/plain representation are
/// dropped here; the terminal has nothing to show for them.
pub fn decode_iopub(message: &JupyterMessage) -> Option<KernelEvent> {
    let token = message.parent_header.as_ref().map(|h| h.msg_id.clone());
    let payload = match &message.content {
        JupyterMessageContent::StreamContent(stream) => EventPayload::Stream {
            name: match stream.name {
                jupyter_protocol::Stdio::Stdout => StreamName::Stdout,
                jupyter_protocol::Stdio::Stderr => StreamName::Stderr,
            },
            text: stream.text.clone(),
        },
        JupyterMessageContent::ExecuteResult(result) => EventPayload::ExecuteResult {
            text: plain_text(&result.data)?,
        },
        JupyterMessageContent::DisplayData(data) => EventPayload::DisplayData {
            text: plain_text(&data.data)?,
        },
        JupyterMessageContent::ErrorOutput(error) => EventPayload::Error {
            ename: error.ename.clone(),
            evalue: error.evalue.clone(),
            traceback: error.traceback.clone(),
        },
        JupyterMessageContent::Status(status) => match status.execution_state {
            jupyter_protocol::ExecutionState::Busy => EventPayload::Busy,
            jupyter_protocol::ExecutionState::Idle => EventPayload::Idle,
            _ => return None,
        },
        _ => return None,
    };
    Some(KernelEvent { token, payload })
}
