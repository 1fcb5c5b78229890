//! `homewire-server` – the websocket daemon.
//!
//! # Modules
//!
//! - [`server`] – [`HubServer`]: listener, upgrade handling, fork limiting
//!   and the choice between hub and process serving.
//! - [`launch`] – request capture, script resolution and the CGI-style
//!   environment given to child processes.

pub mod launch;
pub mod server;

pub use launch::{RequestInfo, UrlInfo, build_env, resolve_script};
pub use server::{DEFAULT_PORT, HubServer, ServeMode, ServerConfig};
