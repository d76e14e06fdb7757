//! Runs the user's script inside the sandbox and bridges its resource calls.
//!
//! The script is a separate process (grandchild of the host). It reaches the
//! façade through a second inherited socket, [`RESOURCE_FD_ENV`], speaking
//! the same request/response lines as the host channel minus the `kind`
//! field:
//!
//! ```text
//! → {"id":"1","type":"listModels"}
//! ← {"id":"1","success":true,"data":[...]}
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::engine::SANDBOX_POLICY_ENV;
use super::facade::{FacadeError, Resources};
use crate::ipc::channel::{IPC_FD_ENV, MessageReader, RESOURCE_FD_ENV, inheritable_pair, spawn_writer};
use crate::ipc::protocol::{InitMessage, Response, decode_request};

/// Seam between the executor and whatever actually runs the app.
///
/// The façade is passed in explicitly; nothing is read from process-global
/// state.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run the script to completion and return its exit code.
    async fn run(&self, init: &InitMessage, resources: Arc<dyn Resources>) -> Result<i32>;
}

/// Interpreter for a script, chosen by extension. `None` runs it directly.
pub fn interpreter_for(script: &Path) -> Option<&'static str> {
    let ext = script.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "sh" => Some("sh"),
        "py" => Some("python3"),
        "js" | "mjs" | "cjs" => Some("node"),
        "ts" => Some("bun"),
        "rb" => Some("ruby"),
        _ => None,
    }
}

/// Exit code of a finished process, `128 + n` when killed by signal `n`.
pub fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => {
            let name = nix::sys::signal::Signal::try_from(signal)
                .map(|s| s.as_str())
                .unwrap_or("unknown signal");
            debug!("Process killed by {}", name);
            128 + signal
        }
        (None, None) => 1,
    }
}

/// Runs the script as a child process with the resource bridge attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessScriptRunner;

#[async_trait]
impl ScriptRunner for ProcessScriptRunner {
    async fn run(&self, init: &InitMessage, resources: Arc<dyn Resources>) -> Result<i32> {
        let (bridge, child_end) = inheritable_pair()?;

        let mut cmd = match interpreter_for(&init.script_path) {
            Some(interpreter) => {
                let mut cmd = tokio::process::Command::new(interpreter);
                cmd.arg(&init.script_path);
                cmd
            }
            None => tokio::process::Command::new(&init.script_path),
        };
        cmd.args(&init.args)
            .current_dir(&init.invoke_dir)
            .env(RESOURCE_FD_ENV, child_end.as_raw_fd().to_string())
            .env_remove(IPC_FD_ENV)
            .env_remove(SANDBOX_POLICY_ENV)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start {}", init.script_path.display()))?;
        drop(child_end);

        let (read_half, write_half) = tokio::io::split(bridge);
        let bridge_task = tokio::spawn(serve_bridge(read_half, write_half, resources));

        let status = child.wait().await.context("Failed to wait for script")?;
        bridge_task.abort();

        Ok(exit_code(status))
    }
}

/// Relay script requests through the façade until the script hangs up.
pub async fn serve_bridge<R, W>(read: R, write: W, resources: Arc<dyn Resources>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, writer) = spawn_writer::<_, Response>(write);
    let mut reader = MessageReader::new(read);

    loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("Resource bridge read failed: {}", e);
                break;
            }
        };

        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                debug!("Ignoring malformed bridge frame: {}", e);
                continue;
            }
        };

        let request = match decode_request(value) {
            Ok(request) => request,
            Err(rejection) => {
                if let Some(id) = rejection.id {
                    let _ = tx.send(Response::failure(id, rejection.reason));
                } else {
                    debug!("Ignoring bridge frame without id: {}", rejection.reason);
                }
                continue;
            }
        };

        let tx = tx.clone();
        let resources = resources.clone();
        tokio::spawn(async move {
            let id = request.id;
            let response = match resources.call(request.call).await {
                Ok(data) => Response::ok(id, data),
                Err(FacadeError::Cancelled) => Response::cancelled(id),
                Err(e) => Response::failure(id, e.to_string()),
            };
            let _ = tx.send(response);
        });
    }

    drop(tx);
    if let Ok(Err(e)) = writer.await {
        warn!("Resource bridge write failed: {}", e);
    }
}
