//! Guest-side executor: the state machine that runs inside the confined child.
//!
//! `WaitingForInit → Executing → {Completed | Failed}`. Nothing the host sends
//! before `init` is acted on, and the script starts exactly once.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::EXIT_CANCELLED;
use super::facade::{Facade, FacadeError};
use super::runner::ScriptRunner;
use crate::ipc::channel::{MessageReader, spawn_writer};
use crate::ipc::protocol::{CompleteMessage, Decoded, InitMessage, IpcMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    WaitingForInit,
    Executing,
    Completed,
    Failed,
}

/// How an executor run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOutcome {
    pub state: ExecutorState,
    pub exit_code: i32,
}

pub struct Executor<R> {
    runner: R,
    request_timeout: Option<Duration>,
}

impl<R: ScriptRunner> Executor<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            request_timeout: None,
        }
    }

    /// Bound every façade call by `timeout` instead of the per-type defaults.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Serve the host channel until the script has run.
    pub async fn run<S>(&self, stream: S) -> ExecutorOutcome
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, writer) = spawn_writer::<_, IpcMessage>(write_half);
        let mut reader = MessageReader::new(read_half);

        debug!(state = ?ExecutorState::WaitingForInit, "Executor started");
        let Some(init) = wait_for_init(&mut reader).await else {
            warn!("Host channel closed before init");
            drop(tx);
            let _ = writer.await;
            return ExecutorOutcome {
                state: ExecutorState::Failed,
                exit_code: 1,
            };
        };
        debug!(
            state = ?ExecutorState::Executing,
            "Running {} for {}",
            init.script_path.display(),
            init.app_id
        );

        let mut facade = Facade::new(tx.clone());
        if let Some(timeout) = self.request_timeout {
            facade = facade.with_timeout(timeout);
        }
        let facade = Arc::new(facade);
        let router = tokio::spawn(route_responses(reader, facade.clone()));

        let (complete, outcome) = match self.runner.run(&init, facade.clone()).await {
            Ok(0) => (
                CompleteMessage {
                    success: true,
                    result: None,
                    error: None,
                },
                ExecutorOutcome {
                    state: ExecutorState::Completed,
                    exit_code: 0,
                },
            ),
            Ok(code) => (
                CompleteMessage {
                    success: false,
                    result: None,
                    error: Some(format!("Script exited with code {}", code)),
                },
                ExecutorOutcome {
                    state: ExecutorState::Failed,
                    exit_code: code,
                },
            ),
            Err(e) => {
                let cancelled = e
                    .downcast_ref::<FacadeError>()
                    .is_some_and(FacadeError::is_cancelled);
                (
                    CompleteMessage {
                        success: false,
                        result: None,
                        error: Some(format!("{:#}", e)),
                    },
                    ExecutorOutcome {
                        state: ExecutorState::Failed,
                        exit_code: if cancelled { EXIT_CANCELLED } else { 1 },
                    },
                )
            }
        };

        let _ = tx.send(IpcMessage::Complete(complete));
        router.abort();
        drop(facade);
        drop(tx);
        if let Ok(Err(e)) = writer.await {
            warn!("Failed to report completion to host: {}", e);
        }

        outcome
    }
}

async fn wait_for_init<R: AsyncRead + Unpin>(reader: &mut MessageReader<R>) -> Option<InitMessage> {
    loop {
        match reader.next_message().await {
            Ok(Some(Decoded::Message(IpcMessage::Init(init)))) => return Some(init),
            Ok(Some(other)) => debug!("Ignoring message before init: {:?}", other),
            Ok(None) => return None,
            Err(e) => {
                warn!("Host channel read failed: {}", e);
                return None;
            }
        }
    }
}

/// Feed host responses to the façade until the host hangs up.
async fn route_responses<R: AsyncRead + Unpin>(mut reader: MessageReader<R>, facade: Arc<Facade>) {
    loop {
        match reader.next_message().await {
            Ok(Some(Decoded::Message(IpcMessage::Response(response)))) => {
                facade.resolve(response);
            }
            Ok(Some(Decoded::Message(IpcMessage::Init(_)))) => {
                debug!("Ignoring repeated init");
            }
            Ok(Some(other)) => debug!("Ignoring unexpected host message: {:?}", other),
            Ok(None) => break,
            Err(e) => {
                debug!("Host channel read failed: {}", e);
                break;
            }
        }
    }
    facade.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_id::AppId;
    use crate::ipc::channel::MessageWriter;
    use crate::ipc::protocol::{ModelSummary, Response};
    use crate::sandbox::facade::Resources;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;

    fn init_message() -> InitMessage {
        InitMessage {
            script_path: PathBuf::from("/apps/demo.sh"),
            args: vec![],
            app_id: AppId::local(std::path::Path::new("/apps/demo.sh")),
            invoke_dir: PathBuf::from("/apps"),
            permissions: Default::default(),
        }
    }

    /// Issues a burst of concurrent listModels calls.
    struct BurstRunner {
        calls: usize,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ScriptRunner for BurstRunner {
        async fn run(&self, _init: &InitMessage, resources: Arc<dyn Resources>) -> Result<i32> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let calls = (0..self.calls).map(|_| {
                let r = resources.clone();
                async move { r.list_models().await }
            });
            for result in futures::future::join_all(calls).await {
                let models = result?;
                assert_eq!(models[0].name, "claude");
            }
            Ok(0)
        }
    }

    struct ExitWith(i32);

    #[async_trait]
    impl ScriptRunner for ExitWith {
        async fn run(&self, _init: &InitMessage, _resources: Arc<dyn Resources>) -> Result<i32> {
            Ok(self.0)
        }
    }

    struct ConfirmThenStop;

    #[async_trait]
    impl ScriptRunner for ConfirmThenStop {
        async fn run(&self, _init: &InitMessage, resources: Arc<dyn Resources>) -> Result<i32> {
            resources
                .confirm(crate::ipc::protocol::ConfirmPrompt {
                    message: "Proceed?".into(),
                    default: None,
                })
                .await?;
            Ok(0)
        }
    }

    /// A host that answers every request from `responder` and returns the
    /// completion it saw.
    async fn fake_host<S, F>(stream: S, send_init_twice: bool, responder: F) -> CompleteMessage
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: Fn(&crate::ipc::protocol::Request) -> Response,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut writer = MessageWriter::new(write_half);
        let mut reader = MessageReader::new(read_half);

        writer.send(&IpcMessage::Init(init_message())).await.unwrap();
        if send_init_twice {
            writer.send(&IpcMessage::Init(init_message())).await.unwrap();
        }

        loop {
            match reader.next_message().await.unwrap() {
                Some(Decoded::Message(IpcMessage::Request(request))) => {
                    writer
                        .send(&IpcMessage::Response(responder(&request)))
                        .await
                        .unwrap();
                }
                Some(Decoded::Message(IpcMessage::Complete(complete))) => return complete,
                Some(other) => panic!("unexpected guest message: {:?}", other),
                None => panic!("guest hung up without completing"),
            }
        }
    }

    fn models_response(request: &crate::ipc::protocol::Request) -> Response {
        let models = vec![ModelSummary {
            name: "claude".into(),
            provider: "anthropic".into(),
            model: "claude-sonnet-4-5".into(),
            current: true,
        }];
        Response::ok(request.id.clone(), serde_json::to_value(models).unwrap())
    }

    #[tokio::test]
    async fn burst_after_init_resolves_and_second_init_is_ignored() {
        let (guest, host) = tokio::io::duplex(64 * 1024);
        let runs = Arc::new(AtomicUsize::new(0));
        let executor = Executor::new(BurstRunner {
            calls: 20,
            runs: runs.clone(),
        });

        let host = tokio::spawn(fake_host(host, true, models_response));
        let outcome = executor.run(guest).await;
        let complete = host.await.unwrap();

        assert_eq!(outcome.state, ExecutorState::Completed);
        assert_eq!(outcome.exit_code, 0);
        assert!(complete.success);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_zero_script_exit_is_reported() {
        let (guest, host) = tokio::io::duplex(4096);
        let host = tokio::spawn(fake_host(host, false, models_response));
        let outcome = Executor::new(ExitWith(3)).run(guest).await;
        let complete = host.await.unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.state, ExecutorState::Failed);
        assert!(!complete.success);
        assert_eq!(complete.error.as_deref(), Some("Script exited with code 3"));
    }

    #[tokio::test]
    async fn cancellation_exits_with_distinguished_code() {
        let (guest, host) = tokio::io::duplex(4096);
        let host = tokio::spawn(fake_host(host, false, |r| Response::cancelled(r.id.clone())));
        let outcome = Executor::new(ConfirmThenStop).run(guest).await;
        let complete = host.await.unwrap();

        assert_eq!(outcome.exit_code, EXIT_CANCELLED);
        assert!(!complete.success);
    }

    #[tokio::test]
    async fn remote_failure_fails_the_run() {
        let (guest, host) = tokio::io::duplex(4096);
        let host = tokio::spawn(fake_host(host, false, |r| {
            Response::failure(r.id.clone(), "host exploded")
        }));
        let outcome = Executor::new(ConfirmThenStop).run(guest).await;
        let complete = host.await.unwrap();

        assert_eq!(outcome.exit_code, 1);
        assert!(complete.error.unwrap().contains("host exploded"));
    }

    #[tokio::test]
    async fn host_hangup_before_init_fails() {
        let (guest, host) = tokio::io::duplex(4096);
        drop(host);
        let outcome = Executor::new(ExitWith(0)).run(guest).await;
        assert_eq!(outcome.state, ExecutorState::Failed);
        assert_eq!(outcome.exit_code, 1);
    }

    #[tokio::test]
    async fn stray_frames_before_init_are_ignored() {
        let (guest, host) = tokio::io::duplex(4096);
        let (host_read, mut host_write) = tokio::io::split(host);
        host_write
            .write_all(b"not json\n{\"kind\":\"response\",\"id\":\"x\",\"success\":true}\n")
            .await
            .unwrap();

        let host = tokio::spawn(async move {
            let mut writer = MessageWriter::new(host_write);
            writer.send(&IpcMessage::Init(init_message())).await.unwrap();
            let mut reader = MessageReader::new(host_read);
            loop {
                if let Some(Decoded::Message(IpcMessage::Complete(c))) =
                    reader.next_message().await.unwrap()
                {
                    return c;
                }
            }
        });

        let outcome = Executor::new(ExitWith(0)).run(guest).await;
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(
            host.await.unwrap(),
            CompleteMessage {
                success: true,
                result: None,
                error: None,
            }
        );
    }
}
