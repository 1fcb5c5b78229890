//! [`ProcessEndpoint`] – a child process seen as a line-delimited endpoint.
//!
//! Stdout lines become messages; every sent message is written to stdin as
//! one line.  Stderr lines are logged and never relayed.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use homewire_types::HubError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, OutputChannel, lock};

/// Default time a child gets to exit on its own after stdin closes.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Endpoint backed by a spawned child process.
pub struct ProcessEndpoint {
    pid: Option<u32>,
    child: tokio::sync::Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
    stderr: Mutex<Option<ChildStderr>>,
    output: OutputChannel,
    close_grace: Duration,
}

impl ProcessEndpoint {
    /// Spawn `program` with `args` and exactly the environment in `env`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Launch`] when the process cannot be started
    /// (missing binary, permission denied, …).  No endpoint exists then.
    pub fn launch(
        program: &str,
        args: &[String],
        env: &[(String, String)],
        close_grace: Duration,
    ) -> Result<Self, HubError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| HubError::Launch {
            command: program.to_string(),
            details: e.to_string(),
        })?;
        info!(command = program, pid = ?child.id(), "process launched");
        Self::from_child(child, close_grace).ok_or_else(|| HubError::Launch {
            command: program.to_string(),
            details: "child standard streams are not piped".to_string(),
        })
    }

    /// Wrap an already spawned child.  Returns `None` unless stdin and stdout
    /// are both piped.
    pub fn from_child(mut child: Child, close_grace: Duration) -> Option<Self> {
        let stdin = child.stdin.take()?;
        let stdout = child.stdout.take()?;
        let stderr = child.stderr.take();
        Some(Self {
            pid: child.id(),
            child: tokio::sync::Mutex::new(Some(child)),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            stdout: Mutex::new(Some(stdout)),
            stderr: Mutex::new(stderr),
            output: OutputChannel::new(),
            close_grace,
        })
    }

    /// OS process id, if the child was still running when wrapped.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl Endpoint for ProcessEndpoint {
    fn start_reading(&self) {
        let Some(stdout) = lock(&self.stdout).take() else {
            return;
        };
        let pid = self.pid;
        self.output.start(move |tx| async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(?pid, "process stdout closed");
                        break;
                    }
                    Err(e) => {
                        warn!(?pid, error = %e, "process stdout read failed");
                        break;
                    }
                }
            }
        });

        if let Some(stderr) = lock(&self.stderr).take() {
            self.output.attach(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(?pid, stderr = %line, "process wrote to stderr");
                }
            }));
        }
    }

    async fn recv(&self) -> Option<String> {
        self.output.recv().await
    }

    async fn send(&self, message: &str) -> bool {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return false;
        };
        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(pid = ?self.pid, error = %e, "process stdin write failed");
                false
            }
        }
    }

    async fn terminate(&self) {
        self.output.close();
        // Dropping stdin delivers EOF to the child.
        self.stdin.lock().await.take();

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(self.close_grace, child.wait()).await {
            Ok(Ok(status)) => info!(pid = ?self.pid, %status, "process exited"),
            Ok(Err(e)) => warn!(pid = ?self.pid, error = %e, "process wait failed"),
            Err(_) => match child.kill().await {
                Ok(()) => info!(pid = ?self.pid, "process killed after close grace"),
                Err(e) => warn!(pid = ?self.pid, error = %e, "process kill failed"),
            },
        }
    }
}
