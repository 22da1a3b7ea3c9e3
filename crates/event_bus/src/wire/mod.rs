//! The line-oriented wire protocol.
//!
//! Every frame is one `\n`-terminated ASCII line of the form
//! `<channelId> <rest>`. This module is pure parsing and formatting; it
//! holds no connection state.

mod codec;
mod messages;

pub use codec::{format_frame, split_frame, LineReader, DEFAULT_MAX_LINE_LENGTH};
pub use messages::{ClientMessage, ServerMessage};
