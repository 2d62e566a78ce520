//! Protocol error taxonomy.

use thiserror::Error;

/// Errors raised while framing, decoding or sequencing protocol messages.
///
/// Every variant is fatal to the session that produced it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The underlying transport failed (read, write, or an unexpected EOF
    /// in the middle of a frame).
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame payload was not valid JSON, or did not fit the shape its
    /// distinguishing field promised.
    #[error("malformed frame payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The payload was valid JSON but matched no known message shape.
    #[error("unrecognized message shape: {0}")]
    UnrecognizedMessage(String),

    /// A well-formed message arrived in a state that does not accept it.
    #[error("expected {expected}, received {received}")]
    Unexpected {
        expected: &'static str,
        received: String,
    },

    /// The coordinator sent a test case while another one was still awaiting
    /// its terminal result.
    #[error("received test case {received} while {in_flight} is still in flight")]
    TestCaseInFlight { in_flight: String, received: String },

    /// The peer closed the connection at a point where the session could not
    /// be considered complete.
    #[error("connection closed while {during}")]
    ConnectionClosed { during: &'static str },
}
