//! Host-side resource provider.
//!
//! Serves every request a sandboxed app sends. `handle` never fails: whatever
//! goes wrong while serving one request becomes that request's
//! `success:false` response.

pub mod models;
pub mod prompt;

pub use models::{ConfigModelStore, CredentialStore};
pub use prompt::{PromptAnswer, Prompter, TerminalPrompter, sanitize_for_terminal};

use anyhow::{Result, bail};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::app_id::AppId;
use crate::ipc::protocol::{LogLevel, LogPayload, Request, ResourceCall, Response};

pub struct ResourceProvider {
    models: Arc<dyn CredentialStore>,
    prompter: Arc<dyn Prompter>,
    app_id: AppId,
    allow_credentials: bool,
}

impl ResourceProvider {
    pub fn new(
        models: Arc<dyn CredentialStore>,
        prompter: Arc<dyn Prompter>,
        app_id: AppId,
        allow_credentials: bool,
    ) -> Self {
        Self {
            models,
            prompter,
            app_id,
            allow_credentials,
        }
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    /// Serve one request.
    pub async fn handle(&self, request: Request) -> Response {
        let kind = request.call.type_name();
        debug!("Serving {} request {}", kind, request.id);

        match self.serve(request.call).await {
            Ok(PromptAnswer::Answered(data)) => Response::ok(request.id, data),
            Ok(PromptAnswer::Cancelled) => Response::cancelled(request.id),
            Err(e) => {
                debug!("{} request {} failed: {:#}", kind, request.id, e);
                Response::failure(request.id, format!("{:#}", e))
            }
        }
    }

    /// Answer for a request that could not be decoded.
    pub fn reject(id: impl Into<String>, reason: impl Into<String>) -> Response {
        Response::failure(id, reason)
    }

    async fn serve(&self, call: ResourceCall) -> Result<PromptAnswer<Value>> {
        let answered = |v: Value| -> Result<PromptAnswer<Value>> { Ok(PromptAnswer::Answered(v)) };

        match call {
            ResourceCall::ListModels {} => answered(serde_json::to_value(self.models.list())?),
            ResourceCall::GetModelConfig(query) => {
                if !self.allow_credentials {
                    bail!("Access to API keys was not granted to this app");
                }
                let config = self.models.resolve(query.name)?;
                answered(serde_json::to_value(config)?)
            }
            ResourceCall::Log(payload) => {
                self.log(&payload);
                answered(Value::Null)
            }
            ResourceCall::Input(prompt) => Ok(self.prompter.input(&prompt).await?.map(Value::String)),
            ResourceCall::Select(prompt) => {
                Ok(self.prompter.select(&prompt).await?.map(Value::String))
            }
            ResourceCall::Confirm(prompt) => {
                Ok(self.prompter.confirm(&prompt).await?.map(Value::Bool))
            }
            ResourceCall::MultiSelect(prompt) => Ok(self
                .prompter
                .multiselect(&prompt)
                .await?
                .map(|picked| Value::Array(picked.into_iter().map(Value::String).collect()))),
            ResourceCall::Form(prompt) => Ok(self.prompter.form(&prompt).await?.map(Value::Object)),
        }
    }

    fn log(&self, payload: &LogPayload) {
        let message = sanitize_for_terminal(&payload.message);
        let app = self.app_id.as_str();
        match payload.level {
            LogLevel::Debug => debug!(target: "kly::app", app, "{}", message),
            LogLevel::Info => info!(target: "kly::app", app, "{}", message),
            LogLevel::Warn => warn!(target: "kly::app", app, "{}", message),
            LogLevel::Error => error!(target: "kly::app", app, "{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{ConfirmPrompt, ModelConfig, ModelQuery, ModelSummary};
    use models::MockCredentialStore;
    use prompt::MockPrompter;
    use serde_json::json;
    use std::path::Path;

    fn credentials() -> MockCredentialStore {
        let mut store = MockCredentialStore::new();
        store.expect_list().returning(|| {
            vec![ModelSummary {
                name: "claude".into(),
                provider: "anthropic".into(),
                model: "sonnet".into(),
                current: true,
            }]
        });
        store.expect_resolve().returning(|name| {
            Ok(ModelConfig {
                name: name.unwrap_or_else(|| "claude".into()),
                provider: "anthropic".into(),
                model: "sonnet".into(),
                api_key: Some("sk-secret".into()),
                base_url: None,
            })
        });
        store
    }

    fn provider(allow_credentials: bool, prompter: MockPrompter) -> ResourceProvider {
        ResourceProvider::new(
            Arc::new(credentials()),
            Arc::new(prompter),
            AppId::local(Path::new("/apps/a.sh")),
            allow_credentials,
        )
    }

    fn get_config(id: &str) -> Request {
        Request::new(id, ResourceCall::GetModelConfig(ModelQuery::default()))
    }

    #[tokio::test]
    async fn credentials_are_gated() {
        let denied = provider(false, MockPrompter::new()).handle(get_config("1")).await;
        assert!(!denied.success);
        assert!(denied.data.is_none());
        assert!(denied.error.unwrap().contains("not granted"));

        let granted = provider(true, MockPrompter::new()).handle(get_config("2")).await;
        assert!(granted.success);
        assert_eq!(granted.id, "2");
        assert_eq!(granted.data.unwrap()["apiKey"], "sk-secret");
    }

    #[tokio::test]
    async fn list_models_and_log_need_no_grant() {
        let p = provider(false, MockPrompter::new());

        let list = p.handle(Request::new("l", ResourceCall::ListModels {})).await;
        assert!(list.success);
        assert_eq!(list.data.unwrap()[0]["name"], "claude");

        let log = p
            .handle(Request::new(
                "g",
                ResourceCall::Log(LogPayload {
                    level: LogLevel::Warn,
                    message: "hello \x1b[31m".into(),
                }),
            ))
            .await;
        assert!(log.success);
    }

    #[tokio::test]
    async fn prompt_cancel_and_failure_are_distinct() {
        let confirm = || {
            Request::new(
                "c",
                ResourceCall::Confirm(ConfirmPrompt {
                    message: "continue?".into(),
                    default: None,
                }),
            )
        };

        let mut cancelling = MockPrompter::new();
        cancelling
            .expect_confirm()
            .returning(|_| Ok(PromptAnswer::Cancelled));
        let response = provider(false, cancelling).handle(confirm()).await;
        assert!(!response.success);
        assert!(response.cancelled);

        let mut failing = MockPrompter::new();
        failing
            .expect_confirm()
            .returning(|_| Err(anyhow::anyhow!("terminal went away")));
        let response = provider(false, failing).handle(confirm()).await;
        assert!(!response.success);
        assert!(!response.cancelled);
        assert_eq!(response.error.as_deref(), Some("terminal went away"));

        let mut answering = MockPrompter::new();
        answering
            .expect_confirm()
            .returning(|_| Ok(PromptAnswer::Answered(true)));
        let response = provider(false, answering).handle(confirm()).await;
        assert_eq!(response.data, Some(json!(true)));
    }

    #[test]
    fn rejection_is_a_failure_response() {
        let response = ResourceProvider::reject("z", "Unknown request type: fs:read");
        assert_eq!(response.id, "z");
        assert!(!response.success);
        assert!(!response.cancelled);
    }
}
