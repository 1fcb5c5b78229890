//! `homewire` – websocket daemon and device routing hub.
//!
//! Serves either one child process per websocket connection
//! (`homewire [OPTIONS] COMMAND [ARGS]...` or `homewire --dir DIR`) or the
//! device routing hub (`homewire --hub`).
//!
//! Settings come from `~/.homewire/config.toml`, then `HOMEWIRE_*`
//! environment variables, then the flags below.

mod config;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use homewire_server::HubServer;
use homewire_types::HubError;
use tracing::{error, info};

/// Listener could not be opened.
const EXIT_LISTEN_FAILED: u8 = 3;
/// Invalid parameters or configuration.
const EXIT_BAD_PARAMETERS: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "homewire")]
#[command(version, about = "Websocket daemon: pipe connections to processes, or route between devices")]
struct Args {
    /// Alternate config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Interface to listen on.
    #[arg(long)]
    address: Option<String>,

    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Run the device routing hub.
    #[arg(long)]
    hub: bool,

    /// Serve scripts from this directory, selected by request path.
    #[arg(long = "dir")]
    script_dir: Option<PathBuf>,

    /// Maximum concurrent child processes (0 = unlimited).
    #[arg(long = "maxforks")]
    max_forks: Option<usize>,

    /// Environment variables passed through to children.
    #[arg(long = "passenv", value_delimiter = ',')]
    pass_env: Vec<String>,

    /// Milliseconds a child gets to exit after its stdin closes.
    #[arg(long = "closems")]
    close_ms: Option<u64>,

    /// Default log filter (`RUST_LOG` takes precedence).
    #[arg(long = "loglevel")]
    log_level: Option<String>,

    /// Program to launch per connection, and its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Args {
    /// Overlay the flags that were given onto `cfg`.
    fn apply(self, cfg: &mut config::Config) {
        if let Some(address) = self.address {
            cfg.address = address;
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if self.hub {
            cfg.hub = true;
        }
        if let Some(dir) = self.script_dir {
            cfg.script_dir = Some(dir);
        }
        if let Some(n) = self.max_forks {
            cfg.max_forks = n;
        }
        if !self.pass_env.is_empty() {
            cfg.pass_env = self.pass_env;
        }
        if let Some(ms) = self.close_ms {
            cfg.close_ms = ms;
        }
        if let Some(level) = self.log_level {
            cfg.log_level = level;
        }
        let mut command = self.command.into_iter();
        if let Some(program) = command.next() {
            cfg.command = Some(program);
            cfg.args = command.collect();
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let path = args.config.clone().unwrap_or_else(config::config_path);
    let loaded = config::load(&path).map(|mut cfg| {
        args.apply(&mut cfg);
        cfg
    });
    let log_level = loaded
        .as_ref()
        .map(|cfg| cfg.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());

    let _guard = telemetry::init_tracing("homewire", &log_level);

    let server_config = match loaded.and_then(|cfg| cfg.server_config()) {
        Ok(server_config) => server_config,
        Err(e) => {
            error!(error = %e, "invalid parameters");
            return ExitCode::from(EXIT_BAD_PARAMETERS);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start async runtime");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %server_config.address,
        port = server_config.port,
        "starting homewire"
    );
    match runtime.block_on(HubServer::new(server_config).run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ HubError::Transport(_)) => {
            error!(error = %e, "cannot listen");
            ExitCode::from(EXIT_LISTEN_FAILED)
        }
        Err(e) => {
            error!(error = %e, "server stopped");
            ExitCode::FAILURE
        }
    }
}
