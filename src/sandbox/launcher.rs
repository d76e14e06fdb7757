//! Host launcher.
//!
//! Spawns the sandbox executor (wrapped by the isolation engine), sends it the
//! single `init` message, serves its requests through the [`ResourceProvider`]
//! and resolves once the child has exited.

use futures::FutureExt;
use serde_json::Value;
use std::os::fd::AsRawFd;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::engine::{IsolationEngine, SandboxCommand};
use super::policy::SandboxPolicy;
use super::runner::exit_code;
use crate::app_id::AppId;
use crate::ipc::channel::{IPC_FD_ENV, MessageReader, inheritable_pair, spawn_writer};
use crate::ipc::protocol::{
    CompleteMessage, Decoded, GrantedPermissions, InitMessage, IpcMessage, Request, Response,
};
use crate::provider::ResourceProvider;

/// How long to keep reading the channel after the child has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum LaunchError {
    /// The executor process never started. Not retried.
    #[error("Failed to start sandboxed process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Setup(#[from] anyhow::Error),

    #[error("Sandboxed process I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One app run.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub script_path: PathBuf,
    pub args: Vec<String>,
    pub app_id: AppId,
    pub invoke_dir: PathBuf,
    pub policy: SandboxPolicy,
    pub allow_credentials: bool,

    /// Extra environment for the executor
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchOutcome {
    pub exit_code: i32,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,

    /// Things the user should know about how the run was confined
    pub warnings: Vec<String>,
}

pub struct Launcher {
    engine: Box<dyn IsolationEngine>,
    executor: Option<PathBuf>,
}

impl Launcher {
    pub fn new(engine: Box<dyn IsolationEngine>) -> Self {
        Self {
            engine,
            executor: None,
        }
    }

    /// Start `exe` as the executor instead of the current binary.
    pub fn with_executor(mut self, exe: impl Into<PathBuf>) -> Self {
        self.executor = Some(exe.into());
        self
    }

    pub async fn launch(
        &self,
        request: LaunchRequest,
        provider: Arc<ResourceProvider>,
    ) -> Result<LaunchOutcome, LaunchError> {
        let invoke_dir = std::path::absolute(&request.invoke_dir)?;
        let script_path = absolutize(&request.script_path, &invoke_dir);

        let warnings = self.confinement_warnings(&request);
        for warning in &warnings {
            warn!("{}", warning);
        }

        let exe = match self.executor {
            Some(ref exe) => exe.clone(),
            None => std::env::current_exe()?,
        };

        let (channel, child_end) = inheritable_pair()?;
        let mut env = request.env.clone();
        env.push((IPC_FD_ENV.to_string(), child_end.as_raw_fd().to_string()));

        let mut command = SandboxCommand::executor(exe, env);
        if self.engine.is_supported() {
            command = self.engine.wrap(command, &request.policy)?;
        }

        debug!(
            "Launching {} via {} ({})",
            script_path.display(),
            command.program.display(),
            self.engine.name()
        );

        let mut child = command
            .to_tokio()
            .current_dir(&invoke_dir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(LaunchError::Spawn)?;
        drop(child_end);

        let (read_half, write_half) = channel.into_split();
        let (tx, writer) = spawn_writer::<_, IpcMessage>(write_half);
        let mut reader = MessageReader::new(read_half);
        let mut session = Session {
            provider,
            tx,
            handlers: JoinSet::new(),
            complete: None,
        };

        let _ = session.tx.send(IpcMessage::Init(InitMessage {
            script_path,
            args: request.args,
            app_id: request.app_id,
            invoke_dir,
            permissions: GrantedPermissions {
                allow_credentials: request.allow_credentials,
            },
        }));

        let mut channel_open = true;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                frame = reader.next_message(), if channel_open => match frame {
                    Ok(Some(decoded)) => session.dispatch(decoded),
                    Ok(None) => channel_open = false,
                    Err(e) => {
                        debug!("IPC channel read failed: {}", e);
                        channel_open = false;
                    }
                },
                Some(joined) = session.handlers.join_next() => {
                    if let Err(e) = joined {
                        debug!("Request handler ended abnormally: {}", e);
                    }
                }
            }
        };

        // A completion written just before exit may still be in flight.
        if channel_open {
            let drain = async {
                while let Ok(Some(decoded)) = reader.next_message().await {
                    session.dispatch(decoded);
                }
            };
            if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                debug!("IPC channel still open {}s after exit", DRAIN_GRACE.as_secs());
            }
        }

        let Session {
            tx,
            mut handlers,
            complete,
            ..
        } = session;
        handlers.shutdown().await;
        drop(tx);
        if let Ok(Err(e)) = writer.await {
            debug!("IPC channel write failed: {}", e);
        }

        Ok(resolve(exit_code(status), complete, warnings))
    }

    fn confinement_warnings(&self, request: &LaunchRequest) -> Vec<String> {
        if self.engine.is_supported() {
            return self.engine.limitations(&request.policy);
        }
        let reason = if self.engine.name() == "none" {
            "Sandboxing is disabled".to_string()
        } else {
            format!("OS-level sandboxing ({}) is not supported here", self.engine.name())
        };
        vec![format!(
            "{}; {} runs without filesystem or network confinement",
            reason, request.app_id
        )]
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Final outcome from the exit code and the completion message, if one came.
fn resolve(exit_code: i32, complete: Option<CompleteMessage>, warnings: Vec<String>) -> LaunchOutcome {
    match complete {
        Some(complete) => LaunchOutcome {
            exit_code,
            success: complete.success,
            result: complete.result,
            error: complete.error,
            warnings,
        },
        None => LaunchOutcome {
            exit_code,
            success: exit_code == 0,
            result: None,
            error: (exit_code != 0)
                .then(|| format!("Sandboxed process exited with code {}", exit_code)),
            warnings,
        },
    }
}

/// Per-run state of the host side of the channel.
struct Session {
    provider: Arc<ResourceProvider>,
    tx: mpsc::UnboundedSender<IpcMessage>,
    handlers: JoinSet<()>,
    complete: Option<CompleteMessage>,
}

impl Session {
    fn dispatch(&mut self, decoded: Decoded) {
        match decoded {
            Decoded::Message(IpcMessage::Request(request)) => self.serve(request),
            Decoded::Message(IpcMessage::Complete(complete)) => {
                debug!("Executor completed (success: {})", complete.success);
                self.complete = Some(complete);
            }
            Decoded::Message(other) => debug!("Ignoring unexpected guest message: {:?}", other),
            Decoded::Rejected { id, reason } => {
                debug!("Rejecting request {}: {}", id, reason);
                let _ = self
                    .tx
                    .send(IpcMessage::Response(ResourceProvider::reject(id, reason)));
            }
            Decoded::Invalid(reason) => debug!("Ignoring invalid frame: {}", reason),
        }
    }

    /// Serve one request on its own task; a panicking handler still answers.
    fn serve(&mut self, request: Request) {
        let provider = self.provider.clone();
        let tx = self.tx.clone();
        self.handlers.spawn(async move {
            let id = request.id.clone();
            let response = AssertUnwindSafe(provider.handle(request))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!("Handler for request {} panicked", id);
                    Response::failure(id, "Internal error while serving request")
                });
            let _ = tx.send(IpcMessage::Response(response));
        });
    }
}
