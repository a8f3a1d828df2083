// SPDX-License-Identifier: Apache-2.0

//! Blocking key-value client speaking RESP2.
//!
//! Exposes a synchronous TCP client with per-request deadlines and
//! cancellation, the [`KeyValueCommands`] string-command surface, an
//! in-memory backend with matching semantics, and a loopback test server.

pub mod client;
pub mod commands;
pub mod context;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod testing;

pub use crate::client::{
    dial, with_client_name, with_dial_timeout, with_request_timeout, Client, ClientConfig,
    ClientOption, DEFAULT_ADDR,
};
pub use crate::commands::{Existence, Expiry, KeyValueCommands, SetOptions};
pub use crate::context::RequestContext;
pub use crate::error::{is_server_error, Error, Result, ServerError};
pub use crate::memory::MemoryStore;
pub use crate::protocol::Value;
