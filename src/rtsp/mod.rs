//! RTSP control-channel handling: response parsing, `Transport:` header
//! parsing, interleaved binary framing, and the per-flow session state
//! machine that ties them together.

pub mod interleaved;
pub mod response;
pub mod session;
pub mod transport;

pub use session::{RtspSession, State as RtspSessionState};
