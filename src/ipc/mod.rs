//! Newline-delimited JSON bridge between a front-end and the monitor.

mod protocol;
mod session;

pub use protocol::{parse_request, BridgeCommand, BridgeError, BridgeReply, ErrorCode, ReplyValue};
pub use session::{run_ipc_mode, serve, BridgeSession};
