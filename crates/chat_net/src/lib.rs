//! chat_net - One-stop wiring of the chat network layer
//!
//! [`NetworkServices`] owns the transport, dispatcher, offline queue, batch
//! coalescer, tool tracker and stream client, and drives their lifecycle.

pub mod services;

pub use services::{NetworkServices, TOKEN_ENV};
