//! `homewire-hub` – the device routing hub.
//!
//! Binds device serial numbers to live websocket endpoints and routes
//! inbound envelopes between controllers (`c_type = "rest"`) and devices.
//!
//! # Modules
//!
//! - [`registry`] – [`DeviceRegistry`]: the lock-guarded serial → endpoint
//!   table with compare-and-delete unbinding.
//! - [`dispatcher`] – [`RoutingDispatcher`]: the per-envelope state machine
//!   and liveness fan-out.
//! - [`session`] – [`ConnectionSession`] state and [`serve_session`], the
//!   per-connection read loop.

pub mod dispatcher;
pub mod registry;
pub mod session;

pub use dispatcher::RoutingDispatcher;
pub use registry::{Binding, DeviceRegistry, PeerRef};
pub use session::{ConnectionSession, SessionState, serve_session};
