//! TCP multiplexing over a single transport connection (C7 + C8): one
//! `/tcp-mux` WebSocket carries many independent streams, each opened,
//! flow-controlled, and torn down without disturbing the others.

pub mod frame;
pub mod session;
pub mod stream;

pub use frame::{Frame, FrameParser, OpenAckResult, DEFAULT_MAX_FRAME_PAYLOAD_BYTES, SESSION_STREAM_ID};
pub use session::{MuxSession, MuxSessionConfig};
pub use stream::{StreamEvent, StreamOutcome, StreamState};
