//! [`HubServer`] – TCP listener and websocket upgrade for both serving modes.
//!
//! * Non-upgrade HTTP requests → `426 Upgrade Required`.
//! * Hub mode → every connection runs [`serve_session`] against one shared
//!   [`RoutingDispatcher`].
//! * Process mode → every connection gets its own child process, spawned
//!   during the handshake and piped to the websocket with [`pipe_endpoints`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use homewire_endpoint::{Endpoint, ProcessEndpoint, TransportEndpoint, pipe_endpoints};
use homewire_hub::{ConnectionSession, DeviceRegistry, PeerRef, RoutingDispatcher, serve_session};
use homewire_types::{DEFAULT_AUTH_TOKEN, HubError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::launch::{RequestInfo, build_env, inherited_env, resolve_script};

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 8080;

/// Bytes peeked to classify a request.
const PEEK_LEN: usize = 4096;

/// Longest wait for a complete request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

const PEEK_RETRY: Duration = Duration::from_millis(10);

/// What a connection is served with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeMode {
    /// Device routing hub.
    Hub { auth_token: String },
    /// One fixed program per connection.
    Command { program: String, args: Vec<String> },
    /// The script the request path names under `dir`.
    ScriptDir { dir: PathBuf, args: Vec<String> },
}

/// Everything the server needs to run.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub mode: ServeMode,
    /// Concurrent child processes allowed; `0` is unlimited.
    pub max_forks: usize,
    pub pass_env: Vec<String>,
    pub close_grace: Duration,
}

impl ServerConfig {
    pub fn new(mode: ServeMode) -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            mode,
            max_forks: 0,
            pass_env: Vec::new(),
            close_grace: homewire_endpoint::process::DEFAULT_CLOSE_GRACE,
        }
    }

    pub fn hub() -> Self {
        Self::new(ServeMode::Hub {
            auth_token: DEFAULT_AUTH_TOKEN.to_string(),
        })
    }
}

/// State shared by every connection task.
struct Shared {
    config: ServerConfig,
    dispatcher: Option<RoutingDispatcher>,
    forks: Option<Arc<Semaphore>>,
}

/// The websocket daemon.
///
/// # Example
///
/// ```rust,no_run
/// use homewire_server::{HubServer, ServerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     HubServer::new(ServerConfig::hub())
///         .run()
///         .await
///         .expect("server failed");
/// }
/// ```
pub struct HubServer {
    shared: Arc<Shared>,
}

impl HubServer {
    pub fn new(config: ServerConfig) -> Self {
        let dispatcher = match &config.mode {
            ServeMode::Hub { auth_token } => Some(
                RoutingDispatcher::new(Arc::new(DeviceRegistry::new())).with_auth_token(auth_token.clone()),
            ),
            _ => None,
        };
        let forks = (config.max_forks > 0).then(|| Arc::new(Semaphore::new(config.max_forks)));
        Self {
            shared: Arc::new(Shared {
                config,
                dispatcher,
                forks,
            }),
        }
    }

    /// Bind the configured address and serve until the process exits.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Transport`] if the listener cannot bind.
    pub async fn run(self) -> Result<(), HubError> {
        let addr = format!("{}:{}", self.shared.config.address, self.shared.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| HubError::Transport(format!("cannot listen on {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HubError> {
        let local = listener
            .local_addr()
            .map_err(|e| HubError::Transport(format!("listener has no local address: {e}")))?;
        info!(addr = %local, mode = mode_name(&self.shared.config.mode), "serving");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, shared).await {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }
}

fn mode_name(mode: &ServeMode) -> &'static str {
    match mode {
        ServeMode::Hub { .. } => "hub",
        ServeMode::Command { .. } => "command",
        ServeMode::ScriptDir { .. } => "script-dir",
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Per-connection handling
// ────────────────────────────────────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) -> Result<(), HubError> {
    let mut buf = [0u8; PEEK_LEN];
    let n = peek_request_head(&stream, &mut buf)
        .await
        .map_err(|e| HubError::Transport(format!("peek error from {peer}: {e}")))?;
    let head = String::from_utf8_lossy(&buf[..n]);
    let is_upgrade = head.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    });
    if !is_upgrade {
        return reject(stream, StatusCode::UPGRADE_REQUIRED).await;
    }

    let conn_id = Uuid::new_v4().to_string();
    let span = info_span!("session", conn_id = %conn_id, remote = %peer);
    match &shared.dispatcher {
        Some(_) => serve_hub(stream, peer, conn_id, Arc::clone(&shared)).instrument(span).await,
        None => serve_process(stream, peer, conn_id, Arc::clone(&shared)).instrument(span).await,
    }
}

/// Peek until the request head is complete, `buf` is full, the peer stops
/// sending, or [`HEAD_TIMEOUT`] passes.  Returns the bytes available.
async fn peek_request_head(stream: &TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let deadline = tokio::time::Instant::now() + HEAD_TIMEOUT;
    let mut seen = 0;
    loop {
        let n = stream.peek(buf).await?;
        let complete = buf[..n].windows(4).any(|w| w == b"\r\n\r\n");
        if complete || n == 0 || n == buf.len() || tokio::time::Instant::now() >= deadline {
            return Ok(n);
        }
        if n == seen {
            // Nothing new yet; peek would return the same bytes immediately.
            tokio::time::sleep(PEEK_RETRY).await;
        }
        seen = n;
    }
}

async fn serve_hub(stream: TcpStream, peer: SocketAddr, conn_id: String, shared: Arc<Shared>) -> Result<(), HubError> {
    let Some(dispatcher) = shared.dispatcher.as_ref() else {
        return Ok(());
    };
    let ws = accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        debug!(path = %req.uri().path(), "hub: upgrade");
        Ok(resp)
    })
    .await
    .map_err(|e| HubError::Transport(format!("handshake from {peer}: {e}")))?;

    let endpoint: PeerRef = Arc::new(TransportEndpoint::new(ws));
    serve_session(dispatcher, ConnectionSession::new(conn_id, endpoint)).await;
    Ok(())
}

async fn serve_process(
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: String,
    shared: Arc<Shared>,
) -> Result<(), HubError> {
    let _permit: Option<OwnedSemaphorePermit> = match &shared.forks {
        Some(forks) => match Arc::clone(forks).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!("fork limit reached, refusing connection");
                return reject(stream, StatusCode::TOO_MANY_REQUESTS).await;
            }
        },
        None => None,
    };

    let config = &shared.config;
    let mut launched: Option<(ProcessEndpoint, RequestInfo)> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let info = RequestInfo::capture(&conn_id, peer, req);
        let (program, args, url) = match &config.mode {
            ServeMode::Command { program, args } => {
                let url = resolve_script(&info.path, None).map_err(|e| error_response(StatusCode::NOT_FOUND, &e))?;
                (program.clone(), args.clone(), url)
            }
            ServeMode::ScriptDir { dir, args } => {
                let url = resolve_script(&info.path, Some(dir.as_path())).map_err(|e| {
                    info!(path = %info.path, "NOT FOUND");
                    error_response(StatusCode::NOT_FOUND, &e)
                })?;
                let program = url
                    .file_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (program, args.clone(), url)
            }
            ServeMode::Hub { .. } => {
                return Err(error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &HubError::Config("hub mode has no process to launch".to_string()),
                ));
            }
        };

        let env = build_env(&info, &url, config.port, inherited_env(&config.pass_env));
        let process = ProcessEndpoint::launch(&program, &args, &env, config.close_grace).map_err(|e| {
            warn!(error = %e, "cannot launch process");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        })?;
        launched = Some((process, info));
        Ok(resp)
    };

    let handshake = accept_hdr_async(stream, callback).await;
    let ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            // A process launched before a failed handshake still gets reaped.
            if let Some((process, _)) = launched.take() {
                process.terminate().await;
            }
            return Err(HubError::Transport(format!("handshake from {peer}: {e}")));
        }
    };
    let Some((process, info)) = launched else {
        return Err(HubError::Transport(format!("no process launched for {peer}")));
    };

    info!(path = %info.path, pid = ?process.pid(), "CONNECT");
    let transport = TransportEndpoint::new(ws);
    pipe_endpoints(&transport, &process).await;
    info!(path = %info.path, "DISCONNECT");
    Ok(())
}

fn error_response(status: StatusCode, error: &HubError) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(error.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Answer a plain HTTP request with `status` and close.
async fn reject(mut stream: TcpStream, status: StatusCode) -> Result<(), HubError> {
    // Drain what was peeked so closing does not reset the connection.
    let mut buf = [0u8; PEEK_LEN];
    let _ = stream.read(&mut buf).await;

    let reason = status.canonical_reason().unwrap_or("Error");
    let body = format!("{} {}\n", status.as_u16(), reason);
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status.as_u16(),
        reason,
        body.len(),
        body
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| HubError::Transport(format!("HTTP write error: {e}")))?;
    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, Stream, StreamExt};
    use serde_json::{Value, json};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    async fn start(config: ServerConfig) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(HubServer::new(config).serve(listener));
        addr
    }

    fn command(program: &str, args: &[&str]) -> ServerConfig {
        ServerConfig::new(ServeMode::Command {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn next_text<S>(ws: &mut S) -> String
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame");
        match frame {
            Some(Ok(Message::Text(text))) => text.as_str().to_string(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    fn status_of(result: Result<impl Sized, WsError>) -> u16 {
        match result {
            Err(WsError::Http(resp)) => resp.status().as_u16(),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("handshake should be refused"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_mode_relays_lines_both_ways() {
        let addr = start(command("/bin/cat", &[])).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/echo")).await.unwrap();

        ws.send(Message::Text("hello".to_string().into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "hello");
        ws.send(Message::Text("again".to_string().into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "again");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_sees_request_environment() {
        let addr = start(command("/bin/sh", &["-c", "echo \"$PATH_INFO|$QUERY_STRING|$GATEWAY_INTERFACE\""])).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/lamp/on?room=hall")).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "/lamp/on|room=hall|websocketd-CGI/0.1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exit_closes_the_websocket() {
        let addr = start(command("/bin/sh", &["-c", "echo bye"])).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "bye");

        let end = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(end.is_ok());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn client_close_reaps_the_child() {
        let addr = start(command("/bin/sh", &["-c", "echo $$; exec /bin/sleep 30"])).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        let pid: u32 = next_text(&mut ws).await.trim().parse().unwrap();
        let proc_entry = PathBuf::from(format!("/proc/{pid}"));
        assert!(proc_entry.exists());

        ws.close(None).await.unwrap();
        drop(ws);

        // A zombie keeps its /proc entry until it is waited on.
        let reaped = tokio::time::timeout(Duration::from_secs(5), async {
            while proc_entry.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(reaped.is_ok(), "pid {pid} still present after client close");
    }

    #[tokio::test]
    async fn launch_failure_refuses_the_upgrade() {
        let addr = start(command("/nonexistent/homewire-child", &[])).await;
        assert_eq!(status_of(connect_async(format!("ws://{addr}/")).await), 500);
    }

    #[tokio::test]
    async fn unknown_script_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start(ServerConfig::new(ServeMode::ScriptDir {
            dir: dir.path().to_path_buf(),
            args: Vec::new(),
        }))
        .await;
        assert_eq!(status_of(connect_async(format!("ws://{addr}/missing.sh")).await), 404);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fork_limit_refuses_extra_connections() {
        let mut config = command("/bin/cat", &[]);
        config.max_forks = 1;
        let addr = start(config).await;

        let (mut first, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        assert_eq!(status_of(connect_async(format!("ws://{addr}/")).await), 429);

        first.send(Message::Text("still here".to_string().into())).await.unwrap();
        assert_eq!(next_text(&mut first).await, "still here");
    }

    #[tokio::test]
    async fn plain_http_gets_upgrade_required() {
        let addr = start(ServerConfig::hub()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 426"), "{response}");
    }

    #[tokio::test]
    async fn upgrade_split_across_segments_is_accepted() {
        let addr = start(ServerConfig::hub()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.set_nodelay(true).unwrap();

        stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        stream
            .write_all(
                b"Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        tokio::time::timeout(Duration::from_secs(5), async {
            while !head.ends_with(b"\r\n\r\n") {
                stream.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
        })
        .await
        .unwrap();
        let head = String::from_utf8_lossy(&head);
        assert!(head.starts_with("HTTP/1.1 101"), "{head}");
    }

    #[tokio::test]
    async fn hub_mode_routes_between_clients() {
        let addr = start(ServerConfig::hub()).await;
        let url = format!("ws://{addr}/");
        let (mut ctl, _) = connect_async(url.as_str()).await.unwrap();
        let (mut lamp, _) = connect_async(url.as_str()).await.unwrap();

        for (ws, sn, c_type) in [(&mut ctl, "CTL", "rest"), (&mut lamp, "X", "light")] {
            ws.send(Message::Text(json!({"type": "auth", "mac": "m", "sn": sn}).to_string().into()))
                .await
                .unwrap();
            assert_eq!(next_text(ws).await, r#"{"token":"12345678"}"#);
            ws.send(Message::Text(
                json!({"type": "connect", "sn": sn, "token": "12345678", "c_type": c_type})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
            assert_eq!(next_text(ws).await, r#"{"message":"connected"}"#);
        }

        let online: Value = serde_json::from_str(&next_text(&mut ctl).await).unwrap();
        assert_eq!(online["from"], "X");
        assert_eq!(online["data"]["state"], "online");

        ctl.send(Message::Text(
            json!({"type": "rest", "sn": "X", "wsid": "w", "data": {"power": "off"}})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
        let forwarded: Value = serde_json::from_str(&next_text(&mut lamp).await).unwrap();
        assert_eq!(forwarded, json!({"type": "rest", "wsid": "w", "from": "CTL", "data": {"power": "off"}}));
    }

    #[tokio::test]
    async fn run_reports_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = ServerConfig::hub();
        config.address = "127.0.0.1".to_string();
        config.port = taken.local_addr().unwrap().port();
        assert!(matches!(HubServer::new(config).run().await, Err(HubError::Transport(_))));
    }
}
