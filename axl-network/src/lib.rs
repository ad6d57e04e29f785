#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod frame;
mod message;
mod protocol;

pub use frame::{Frame, encode_frame, parse_frame};
pub use message::HelloPayload;
pub use protocol::{Command, FrameHeader, PROTOCOL_VERSION};

pub const FRAME_HEADER_SIZE: usize = 28;
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;
