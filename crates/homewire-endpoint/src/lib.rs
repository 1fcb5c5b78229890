//! `homewire-endpoint` – duplex message endpoints and the relay between them.
//!
//! # Modules
//!
//! - [`endpoint`] – the [`Endpoint`] capability trait and
//!   [`pipe_endpoints`], the bidirectional copy loop.
//! - [`process`] – [`ProcessEndpoint`]: a child process's stdin/stdout,
//!   one message per line.
//! - [`transport`] – [`TransportEndpoint`]: one websocket connection, one
//!   message per text frame.

pub mod endpoint;
pub mod process;
pub mod transport;

pub use endpoint::{Endpoint, pipe_endpoints};
pub use process::ProcessEndpoint;
pub use transport::TransportEndpoint;
