//! SOCKS5 command parsing module
//!
//! Handles decoding the CONNECT request and building replies.

mod parser;
mod reply;

pub use parser::ConnectRequest;
pub use reply::{build_reply, encode_reply, send_not_allowed, send_success};
