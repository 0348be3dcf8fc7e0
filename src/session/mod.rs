//! Host-side agent sessions
//!
//! - `driver` - runs one turn over a `HostBridge`
//! - `host_tools` - conversation search and memories served to the guest
//! - `store` - on-disk session transcripts and memories

pub mod driver;
pub mod host_tools;
pub mod store;

use async_trait::async_trait;
use serde_json::Value;

pub use driver::{SessionDriver, SessionError, TurnOutcome};
pub use host_tools::LocalHostTools;
pub use store::{MemoryStore, SessionRecord, SessionStore};

use crate::protocol::{HostToolRequest, HostToolResponse, PermissionRequest, PermissionResponse};

/// Decides guest permission requests (usually by asking the user)
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn decide(&self, request: &PermissionRequest) -> PermissionResponse;
}

/// Executes host tools on behalf of the guest engine
#[async_trait]
pub trait HostToolHandler: Send + Sync {
    async fn call(&self, request: &HostToolRequest) -> HostToolResponse;
}

/// Answers every permission request the same way
#[derive(Debug, Clone, Copy)]
pub struct FixedPermission {
    allow: bool,
}

impl FixedPermission {
    pub fn allow_all() -> Self {
        Self { allow: true }
    }

    pub fn deny_all() -> Self {
        Self { allow: false }
    }
}

#[async_trait]
impl PermissionHandler for FixedPermission {
    async fn decide(&self, request: &PermissionRequest) -> PermissionResponse {
        if self.allow {
            PermissionResponse::allow(Some(first_option_answers(&request.tool_input)))
        } else {
            PermissionResponse::deny(format!("{} was not approved", request.tool_name))
        }
    }
}

/// `input` with every question answered by its first option
///
/// The first option of a policy confirmation is the approve label.
fn first_option_answers(input: &Value) -> Value {
    let mut answers = serde_json::Map::new();
    for question in input
        .get("questions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let text = question.get("question").and_then(Value::as_str);
        let label = question
            .get("options")
            .and_then(Value::as_array)
            .and_then(|options| options.first())
            .and_then(|option| option.get("label"))
            .and_then(Value::as_str);
        if let (Some(text), Some(label)) = (text, label) {
            answers.insert(text.to_string(), Value::String(label.to_string()));
        }
    }
    let mut updated = input.clone();
    if let Some(obj) = updated.as_object_mut() {
        if !answers.is_empty() {
            obj.insert("answers".into(), Value::Object(answers));
        }
    }
    updated
}

/// Host-tool handler for sessions that expose none
pub struct NoHostTools;

#[async_trait]
impl HostToolHandler for NoHostTools {
    async fn call(&self, request: &HostToolRequest) -> HostToolResponse {
        HostToolResponse::failure(format!("host tool `{}` is not available", request.tool_name))
    }
}
