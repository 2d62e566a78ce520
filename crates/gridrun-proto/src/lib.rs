//! Wire types and framing for the gridrun coordinator protocol.
//!
//! Every message travels as a frame: a 4-byte big-endian payload length
//! followed by a UTF-8 JSON payload. Framing is symmetric, so the same codec
//! serves the runner and the coordinator.
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | JSON payload     |
//! +----------------------------+------------------+
//! ```
//!
//! Messages are modelled as explicit sum types per direction:
//! - [`RunnerMessage`] — runner → coordinator (spawn announcement, manifest,
//!   init acknowledgement, results)
//! - [`CoordinatorMessage`] — coordinator → runner (init, test case)
//!
//! Decoding classifies a payload by its distinguishing field and rejects any
//! shape it does not recognise with [`ProtocolError::UnrecognizedMessage`].

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{DEFAULT_MAX_FRAME_LEN, FrameBuffer, FrameCodec, LENGTH_PREFIX_LEN, encode_frame};
pub use error::ProtocolError;
pub use messages::{
    CoordinatorMessage, Focus, InitMessage, InitSuccessMessage, Location, Manifest,
    ManifestGroup, ManifestMember, ManifestMessage, ManifestTest, Nanoseconds,
    NativeRunnerSpawned, ResultMessage, RunnerMessage, TestCase, TestCaseMessage, TestMeta,
    TestResult, TestResultStatus, WireMessage,
};
