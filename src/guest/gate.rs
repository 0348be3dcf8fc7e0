//! Tool gate: the engine's `can_use_tool` hook
//!
//! ```text
//!   tool call ─► normalize host paths ─► deny-list? ──yes──► Deny
//!                                          │ no
//!                                          ▼
//!                              user-question tool? ──yes──► ask host, relay answer
//!                                          │ no
//!                                          ▼
//!                                   safety policy ──Confirm──► ask host (Allow/Deny)
//!                                          │ Allow
//!                                          ▼
//!                                        Allow (normalized input)
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::normalize::PathNormalizer;
use crate::metrics::{PERMISSION_DECISIONS, TOOL_GATE_DECISIONS};
use crate::policy::{
    self, confirmation_input, is_approved, BoundaryContext, PolicyDecision, BLOCKED_TOOLS,
    USER_QUESTION_TOOL,
};
use crate::protocol::{
    AgentRequest, ConfirmationMode, PendingOutcome, PermissionRequest, PermissionResponse,
};

pub const TIMEOUT_MESSAGE: &str = "Permission request timed out";
pub const ABORTED_MESSAGE: &str = "Session was aborted";

/// Answer to the engine's `can_use_tool`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum ToolDecision {
    Allow {
        #[serde(rename = "updatedInput")]
        updated_input: Value,
    },
    Deny {
        message: String,
    },
}

impl ToolDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, ToolDecision::Allow { .. })
    }
}

/// Sends a permission request to the host and waits for the answer
#[async_trait]
pub trait PermissionAsker: Send + Sync {
    async fn ask(&self, permission: PermissionRequest) -> PendingOutcome<PermissionResponse>;
}

/// Per-request gate state
#[derive(Debug, Clone)]
pub struct ToolGate {
    boundary: BoundaryContext,
    normalizer: PathNormalizer,
    confirmation_mode: ConfirmationMode,
}

impl ToolGate {
    /// # Arguments
    /// * `request` - supplies cwd, workspace root and mounts
    /// * `home` - guest home directory of the daemon user
    pub fn new(request: &AgentRequest, home: Option<PathBuf>) -> Self {
        let boundary = BoundaryContext::new(&request.cwd, &request.workspace_root)
            .with_skills_root(request.skills_root().cloned())
            .with_home_dir(home);
        Self {
            boundary,
            normalizer: PathNormalizer::for_request(request),
            confirmation_mode: request.confirmation_mode,
        }
    }

    /// Decide one tool call, asking the host when the policy escalates
    pub async fn check(&self, tool: &str, input: Value, asker: &dyn PermissionAsker) -> ToolDecision {
        let (input, rewrites) = self.normalizer.normalize(&input);
        for rewrite in &rewrites {
            debug!(tool, from = %rewrite.from, to = %rewrite.to, "rewrote host path");
        }

        if BLOCKED_TOOLS.contains(&tool) {
            TOOL_GATE_DECISIONS.with_label_values(&["blocked"]).inc();
            info!(tool, "blocked tool call");
            return ToolDecision::Deny {
                message: format!("`{tool}` is not available inside the sandbox"),
            };
        }

        if tool == USER_QUESTION_TOOL {
            TOOL_GATE_DECISIONS.with_label_values(&["ask_user"]).inc();
            let response = self.ask(tool, input.clone(), asker).await;
            return match response {
                Ok(r) if r.is_allow() => ToolDecision::Allow {
                    updated_input: r.updated_input.unwrap_or(input),
                },
                Ok(r) => ToolDecision::Deny {
                    message: r.message.unwrap_or_else(|| "User declined to answer".into()),
                },
                Err(message) => ToolDecision::Deny { message },
            };
        }

        let decision = policy::evaluate(tool, &input, &self.boundary);
        TOOL_GATE_DECISIONS
            .with_label_values(&[decision.label()])
            .inc();

        match decision {
            PolicyDecision::Allow => ToolDecision::Allow {
                updated_input: input,
            },
            PolicyDecision::Block { reason } => ToolDecision::Deny { message: reason },
            PolicyDecision::Confirm(escalation) => {
                info!(tool, kind = escalation.kind.as_str(), reason = %escalation.reason, "tool call needs confirmation");
                let question = confirmation_input(tool, &escalation);
                match self.ask(USER_QUESTION_TOOL, question, asker).await {
                    Ok(r) if is_approved(&r) => ToolDecision::Allow {
                        updated_input: input,
                    },
                    Ok(_) => ToolDecision::Deny {
                        message: format!("User denied the tool call: {}", escalation.reason),
                    },
                    Err(message) => ToolDecision::Deny { message },
                }
            }
        }
    }

    /// One permission exchange; `Err` carries the deny message
    async fn ask(
        &self,
        tool: &str,
        input: Value,
        asker: &dyn PermissionAsker,
    ) -> Result<PermissionResponse, String> {
        let permission = PermissionRequest {
            request_id: Uuid::now_v7().to_string(),
            tool_name: tool.to_string(),
            tool_input: input,
            confirmation_mode: self.confirmation_mode,
        };
        let permission_id = permission.request_id.clone();

        let outcome = asker.ask(permission).await;
        let label = match &outcome {
            PendingOutcome::Resolved(r) if r.is_allow() => "allow",
            PendingOutcome::Resolved(_) => "deny",
            PendingOutcome::TimedOut => "timeout",
            PendingOutcome::Cancelled => "aborted",
        };
        PERMISSION_DECISIONS
            .with_label_values(&["guest", label])
            .inc();

        match outcome {
            PendingOutcome::Resolved(r) => Ok(r),
            PendingOutcome::TimedOut => {
                warn!(permission_id = %permission_id, tool, "no answer from host");
                Err(TIMEOUT_MESSAGE.into())
            }
            PendingOutcome::Cancelled => Err(ABORTED_MESSAGE.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeAsker {
        answer: PendingOutcome<PermissionResponse>,
        asked: Mutex<Vec<PermissionRequest>>,
    }

    impl FakeAsker {
        fn new(answer: PendingOutcome<PermissionResponse>) -> Self {
            Self {
                answer,
                asked: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PermissionAsker for FakeAsker {
        async fn ask(&self, permission: PermissionRequest) -> PendingOutcome<PermissionResponse> {
            self.asked.lock().unwrap().push(permission);
            self.answer.clone()
        }
    }

    fn request() -> AgentRequest {
        serde_json::from_value(json!({
            "id": "r1",
            "cwd": "/workspace/project",
            "prompt": "tidy up",
            "workspaceRoot": "/workspace/project",
            "hostWorkspaceRoot": "/Users/dev/project",
        }))
        .unwrap()
    }

    fn approve() -> PermissionResponse {
        PermissionResponse::allow(Some(json!({"answers": {"Allow `Bash`?": "Allow"}})))
    }

    #[tokio::test]
    async fn test_delete_inside_workspace_asks_once() {
        let gate = ToolGate::new(&request(), None);
        let input = json!({"command": "rm -rf ./build"});

        let denier = FakeAsker::new(PendingOutcome::Resolved(PermissionResponse::deny("no")));
        let decision = gate.check("Bash", input.clone(), &denier).await;
        assert!(!decision.is_allow());
        let asked = denier.asked.lock().unwrap();
        assert_eq!(asked.len(), 1);
        assert_eq!(asked[0].tool_name, USER_QUESTION_TOOL);
        assert!(asked[0].tool_input.to_string().to_lowercase().contains("delete"));

        let approver = FakeAsker::new(PendingOutcome::Resolved(approve()));
        let decision = gate.check("Bash", input.clone(), &approver).await;
        assert_eq!(decision, ToolDecision::Allow { updated_input: input });
    }

    #[tokio::test]
    async fn test_read_outside_workspace_names_path() {
        let gate = ToolGate::new(&request(), None);
        let asker = FakeAsker::new(PendingOutcome::Resolved(PermissionResponse::deny("no")));
        let decision = gate
            .check("Read", json!({"file_path": "/etc/passwd"}), &asker)
            .await;
        assert!(!decision.is_allow());
        let asked = asker.asked.lock().unwrap();
        assert_eq!(asked.len(), 1);
        assert!(asked[0].tool_input.to_string().contains("/etc/passwd"));
    }

    #[tokio::test]
    async fn test_host_paths_rewritten_before_policy() {
        let gate = ToolGate::new(&request(), None);
        let asker = FakeAsker::new(PendingOutcome::TimedOut);
        let decision = gate
            .check("Read", json!({"file_path": "/Users/dev/project/src/main.rs"}), &asker)
            .await;
        assert_eq!(
            decision,
            ToolDecision::Allow {
                updated_input: json!({"file_path": "/workspace/project/src/main.rs"})
            }
        );
        assert!(asker.asked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_tool_never_asks() {
        let gate = ToolGate::new(&request(), None);
        let asker = FakeAsker::new(PendingOutcome::Resolved(approve()));
        let decision = gate.check("WebFetch", json!({"url": "https://example.com"}), &asker).await;
        assert!(!decision.is_allow());
        assert!(asker.asked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_and_abort_deny() {
        let gate = ToolGate::new(&request(), None);
        let input = json!({"file_path": "/etc/hosts"});

        let decision = gate.check("Read", input.clone(), &FakeAsker::new(PendingOutcome::TimedOut)).await;
        assert_eq!(decision, ToolDecision::Deny { message: TIMEOUT_MESSAGE.into() });

        let decision = gate.check("Read", input, &FakeAsker::new(PendingOutcome::Cancelled)).await;
        assert_eq!(decision, ToolDecision::Deny { message: ABORTED_MESSAGE.into() });
    }

    #[tokio::test]
    async fn test_user_question_relays_answers() {
        let gate = ToolGate::new(&request(), None);
        let answers = json!({"questions": [], "answers": {"Pick": "B"}});
        let asker = FakeAsker::new(PendingOutcome::Resolved(PermissionResponse::allow(Some(answers.clone()))));
        let decision = gate
            .check(USER_QUESTION_TOOL, json!({"questions": []}), &asker)
            .await;
        assert_eq!(decision, ToolDecision::Allow { updated_input: answers });
        assert_eq!(asker.asked.lock().unwrap()[0].tool_name, USER_QUESTION_TOOL);
    }

    #[test]
    fn test_decision_wire_shape() {
        let allow = serde_json::to_value(ToolDecision::Allow { updated_input: json!({"a": 1}) }).unwrap();
        assert_eq!(allow, json!({"behavior": "allow", "updatedInput": {"a": 1}}));
        let deny = serde_json::to_value(ToolDecision::Deny { message: "x".into() }).unwrap();
        assert_eq!(deny, json!({"behavior": "deny", "message": "x"}));
    }
}
