//! Message vocabulary shared by the host launcher and the sandboxed executor.
//!
//! Every frame is a JSON object with a `kind` discriminator:
//!
//! | kind | direction | sent |
//! |------|-----------|------|
//! | `init` | host → guest | exactly once, first |
//! | `request` | guest → host | any number, correlated by `id` |
//! | `response` | host → guest | one per request, same `id` |
//! | `complete` | guest → host | exactly once, at script exit |
//!
//! Requests carry `type` and an object `payload`. Decoding never fails hard:
//! a request with a usable `id` but an unknown `type` or bad payload is
//! [`Decoded::Rejected`] so the host can answer it, anything else that does
//! not validate is [`Decoded::Invalid`] and ignored by the reader.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::app_id::AppId;

/// Bound for non-interactive round trips.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound for round trips that wait on a human.
pub const PROMPT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IpcMessage {
    Init(InitMessage),
    Request(Request),
    Response(Response),
    Complete(CompleteMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    pub script_path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub app_id: AppId,
    pub invoke_dir: PathBuf,
    pub permissions: GrantedPermissions,
}

/// What the broker granted for this run, as seen by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantedPermissions {
    pub allow_credentials: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireRequest")]
pub struct Request {
    pub id: String,
    #[serde(flatten)]
    pub call: ResourceCall,
}

impl Request {
    pub fn new(id: impl Into<String>, call: ResourceCall) -> Self {
        Self {
            id: id.into(),
            call,
        }
    }
}

/// Loose request shape used to tell an unknown `type` apart from garbage.
#[derive(Debug, Deserialize)]
struct WireRequest {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default = "empty_object")]
    payload: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl TryFrom<WireRequest> for Request {
    type Error = String;

    fn try_from(wire: WireRequest) -> Result<Self, Self::Error> {
        let call = ResourceCall::from_parts(&wire.kind, wire.payload)?;
        Ok(Self { id: wire.id, call })
    }
}

/// Every operation a sandboxed script may ask the host to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ResourceCall {
    #[serde(rename = "listModels")]
    ListModels {},
    #[serde(rename = "getModelConfig")]
    GetModelConfig(ModelQuery),
    #[serde(rename = "log")]
    Log(LogPayload),
    #[serde(rename = "prompt:input")]
    Input(InputPrompt),
    #[serde(rename = "prompt:select")]
    Select(SelectPrompt),
    #[serde(rename = "prompt:confirm")]
    Confirm(ConfirmPrompt),
    #[serde(rename = "prompt:multiselect")]
    MultiSelect(MultiSelectPrompt),
    #[serde(rename = "prompt:form")]
    Form(FormPrompt),
}

impl ResourceCall {
    pub const TYPES: &'static [&'static str] = &[
        "listModels",
        "getModelConfig",
        "log",
        "prompt:input",
        "prompt:select",
        "prompt:confirm",
        "prompt:multiselect",
        "prompt:form",
    ];

    /// Build a call from its wire `type` and `payload`.
    pub fn from_parts(kind: &str, payload: Value) -> Result<Self, String> {
        if !Self::TYPES.contains(&kind) {
            return Err(format!("Unknown request type: {}", kind));
        }
        let payload = if payload.is_null() {
            empty_object()
        } else {
            payload
        };
        serde_json::from_value(serde_json::json!({ "type": kind, "payload": payload }))
            .map_err(|e| format!("Invalid payload for {}: {}", kind, e))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ResourceCall::ListModels {} => "listModels",
            ResourceCall::GetModelConfig(_) => "getModelConfig",
            ResourceCall::Log(_) => "log",
            ResourceCall::Input(_) => "prompt:input",
            ResourceCall::Select(_) => "prompt:select",
            ResourceCall::Confirm(_) => "prompt:confirm",
            ResourceCall::MultiSelect(_) => "prompt:multiselect",
            ResourceCall::Form(_) => "prompt:form",
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            ResourceCall::Input(_)
                | ResourceCall::Select(_)
                | ResourceCall::Confirm(_)
                | ResourceCall::MultiSelect(_)
                | ResourceCall::Form(_)
        )
    }

    /// How long the guest waits for the matching response.
    pub fn timeout(&self) -> Duration {
        if self.is_interactive() {
            PROMPT_TIMEOUT
        } else {
            REQUEST_TIMEOUT
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelQuery {
    /// Model name; `None` means the configured current model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Choice {
    pub fn new(value: &str, label: &str) -> Self {
        Self {
            value: value.to_string(),
            label: Some(label.to_string()),
            description: None,
        }
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPrompt {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectPrompt {
    pub message: String,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmPrompt {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiSelectPrompt {
    pub message: String,
    pub choices: Vec<Choice>,
    /// At least one choice must be picked
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Number,
    Boolean,
    Select,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    /// Options for `select` fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormPrompt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub fields: Vec<FormField>,
}

/// Listing entry returned by `listModels`. Never carries a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub provider: String,
    pub model: String,
    pub current: bool,
}

/// Full model configuration returned by `getModelConfig`, secret included.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub name: String,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The user aborted an interactive prompt. Not a failure to report.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl Response {
    pub fn ok(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
            cancelled: false,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            cancelled: false,
        }
    }

    pub fn cancelled(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some("Cancelled by user".to_string()),
            cancelled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteMessage {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(IpcMessage),
    /// A request that can be answered but not served
    Rejected { id: String, reason: String },
    /// Not a valid message; the reader drops it
    Invalid(String),
}

/// Decode one frame.
pub fn decode(line: &str) -> Decoded {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Decoded::Invalid(format!("not JSON: {}", e)),
    };

    match value.get("kind").and_then(Value::as_str) {
        Some("request") => match decode_request(value) {
            Ok(request) => Decoded::Message(IpcMessage::Request(request)),
            Err(RequestRejection { id: Some(id), reason }) => Decoded::Rejected { id, reason },
            Err(RequestRejection { id: None, reason }) => Decoded::Invalid(reason),
        },
        Some(_) => serde_json::from_value(value)
            .map(Decoded::Message)
            .unwrap_or_else(|e| Decoded::Invalid(e.to_string())),
        None => Decoded::Invalid("missing kind".to_string()),
    }
}

/// Why a request could not be decoded, with its id when one was readable.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRejection {
    pub id: Option<String>,
    pub reason: String,
}

/// Decode a request object (with or without the `kind` field).
pub fn decode_request(value: Value) -> Result<Request, RequestRejection> {
    let id = value.get("id").and_then(Value::as_str).map(String::from);

    let wire: WireRequest = serde_json::from_value(value).map_err(|e| RequestRejection {
        id: id.clone(),
        reason: format!("Malformed request: {}", e),
    })?;

    Request::try_from(wire).map_err(|reason| RequestRejection { id, reason })
}

/// Encode one frame (no trailing newline).
pub fn encode<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message)
}
