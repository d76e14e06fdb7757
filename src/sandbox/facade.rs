//! Guest-side resource façade.
//!
//! Every call becomes a request on the IPC channel and waits for the response
//! carrying the same id. Calls are independent: responses may arrive in any
//! order, and each call is bounded by its own timeout.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::ipc::protocol::{
    ConfirmPrompt, FormPrompt, InputPrompt, IpcMessage, LogLevel, LogPayload, ModelConfig,
    ModelQuery, ModelSummary, MultiSelectPrompt, Request, ResourceCall, Response, SelectPrompt,
};

#[derive(Debug, Error)]
pub enum FacadeError {
    /// The user aborted a prompt; callers may stop quietly.
    #[error("Cancelled by user")]
    Cancelled,

    #[error("{request} request timed out after {}s", .after.as_secs())]
    Timeout {
        request: &'static str,
        after: Duration,
    },

    #[error("{0}")]
    Remote(String),

    #[error("IPC channel closed")]
    ChannelClosed,

    #[error("Unexpected response data: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FacadeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FacadeError::Cancelled)
    }
}

/// What a running script can ask the host for.
#[async_trait]
pub trait Resources: Send + Sync {
    /// Send one call and wait for its data.
    async fn call(&self, call: ResourceCall) -> Result<Value, FacadeError>;

    async fn list_models(&self) -> Result<Vec<ModelSummary>, FacadeError> {
        decode(self.call(ResourceCall::ListModels {}).await?)
    }

    async fn model_config(&self, name: Option<String>) -> Result<ModelConfig, FacadeError> {
        decode(self.call(ResourceCall::GetModelConfig(ModelQuery { name })).await?)
    }

    async fn log(&self, level: LogLevel, message: String) -> Result<(), FacadeError> {
        self.call(ResourceCall::Log(LogPayload { level, message }))
            .await
            .map(|_| ())
    }

    async fn input(&self, prompt: InputPrompt) -> Result<String, FacadeError> {
        decode(self.call(ResourceCall::Input(prompt)).await?)
    }

    async fn select(&self, prompt: SelectPrompt) -> Result<String, FacadeError> {
        decode(self.call(ResourceCall::Select(prompt)).await?)
    }

    async fn confirm(&self, prompt: ConfirmPrompt) -> Result<bool, FacadeError> {
        decode(self.call(ResourceCall::Confirm(prompt)).await?)
    }

    /// Values of the picked choices, in choice order.
    async fn multiselect(&self, prompt: MultiSelectPrompt) -> Result<Vec<String>, FacadeError> {
        decode(self.call(ResourceCall::MultiSelect(prompt)).await?)
    }

    /// Answers keyed by field name.
    async fn form(&self, prompt: FormPrompt) -> Result<Map<String, Value>, FacadeError> {
        decode(self.call(ResourceCall::Form(prompt)).await?)
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, FacadeError> {
    Ok(serde_json::from_value(value)?)
}

/// [`Resources`] over the executor's channel to the host.
pub struct Facade {
    outbound: mpsc::UnboundedSender<IpcMessage>,
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    timeout_override: Option<Duration>,
}

impl Facade {
    pub fn new(outbound: mpsc::UnboundedSender<IpcMessage>) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            timeout_override: None,
        }
    }

    /// Use one bound for every call instead of the per-type defaults.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    /// Hand a response to the call waiting for it.
    ///
    /// Returns false for responses nobody waits for (timed out, or unknown);
    /// those are dropped.
    pub fn resolve(&self, response: Response) -> bool {
        let waiter = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&response.id),
            Err(_) => None,
        };
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!("Dropping orphaned response {}", response.id);
                false
            }
        }
    }

    /// Fail every outstanding call; the host is gone.
    pub fn close(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Send `call` and wait for its raw response.
    pub async fn request(&self, call: ResourceCall) -> Result<Response, FacadeError> {
        let id = uuid::Uuid::new_v4().to_string();
        let kind = call.type_name();
        let timeout = self.timeout_override.unwrap_or_else(|| call.timeout());

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| FacadeError::ChannelClosed)?
            .insert(id.clone(), tx);

        if self
            .outbound
            .send(IpcMessage::Request(Request::new(id.clone(), call)))
            .is_err()
        {
            self.forget(&id);
            return Err(FacadeError::ChannelClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(FacadeError::ChannelClosed),
            Err(_) => {
                self.forget(&id);
                Err(FacadeError::Timeout {
                    request: kind,
                    after: timeout,
                })
            }
        }
    }

    fn forget(&self, id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(id);
        }
    }
}

#[async_trait]
impl Resources for Facade {
    async fn call(&self, call: ResourceCall) -> Result<Value, FacadeError> {
        let response = self.request(call).await?;
        if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else if response.cancelled {
            Err(FacadeError::Cancelled)
        } else {
            Err(FacadeError::Remote(
                response
                    .error
                    .unwrap_or_else(|| "Request failed".to_string()),
            ))
        }
    }
}
