//! chat_stream - Streaming chat replies
//!
//! - `session` - offset-based parser of `data:` lines
//! - `throttle` - which fragments trigger a UI update
//! - `receiver` - the streaming call, hard timeout and legacy fallback

pub mod receiver;
pub mod session;
pub mod throttle;

pub use receiver::{ChatStreamClient, ChatStreamRequest, StreamOutcome};
pub use session::{StreamItem, StreamSession};
pub use throttle::UiThrottle;
