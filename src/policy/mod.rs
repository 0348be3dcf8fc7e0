//! Safety policy for tool calls inside the guest
//!
//! A pure function of the tool call and the request's roots. The guest tool
//! gate calls [`evaluate`] before every tool invocation.
//!
//! ```text
//!   deny-list? ──yes──► Block
//!       │no
//!   delete-like? ──yes──► Confirm(Delete)   (location irrelevant)
//!       │no
//!   path outside workspace/skills? ──yes──► Confirm(Boundary)
//!       │no
//!   Allow
//! ```

pub mod boundary;
pub mod confirm;
pub mod delete;

use serde_json::Value;

pub use boundary::BoundaryContext;
pub use confirm::{confirmation_input, is_approved, USER_QUESTION_TOOL};

/// Built-in networking tools that never run in the sandbox
pub const BLOCKED_TOOLS: &[&str] = &["WebSearch", "WebFetch"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationKind {
    Delete,
    Boundary,
}

impl EscalationKind {
    /// Short header shown above the question
    pub fn header(&self) -> &'static str {
        match self {
            EscalationKind::Delete => "Delete files",
            EscalationKind::Boundary => "Outside workspace",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationKind::Delete => "confirm_delete",
            EscalationKind::Boundary => "confirm_boundary",
        }
    }
}

/// A tool call that needs a human yes/no before it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub kind: EscalationKind,
    pub reason: String,
    /// Offending paths, for boundary escalations and delete calls that also cross it
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Block { reason: String },
    Confirm(Escalation),
}

impl PolicyDecision {
    pub fn label(&self) -> &'static str {
        match self {
            PolicyDecision::Allow => "allow",
            PolicyDecision::Block { .. } => "blocked",
            PolicyDecision::Confirm(e) => e.kind.as_str(),
        }
    }
}

/// Classify one tool call
pub fn evaluate(tool_name: &str, input: &Value, ctx: &BoundaryContext) -> PolicyDecision {
    if BLOCKED_TOOLS.contains(&tool_name) {
        return PolicyDecision::Block {
            reason: format!("`{tool_name}` is not available inside the sandbox"),
        };
    }

    let outside = boundary::outside_paths(tool_name, input, ctx);

    if let Some(delete_reason) = delete::classify(tool_name, input) {
        let reason = if outside.is_empty() {
            delete_reason
        } else {
            format!(
                "{delete_reason}; touches paths outside the workspace: {}",
                boundary::summarize_paths(&outside)
            )
        };
        return PolicyDecision::Confirm(Escalation {
            kind: EscalationKind::Delete,
            reason,
            paths: outside,
        });
    }

    if !outside.is_empty() {
        return PolicyDecision::Confirm(Escalation {
            kind: EscalationKind::Boundary,
            reason: format!(
                "accesses paths outside the workspace: {}",
                boundary::summarize_paths(&outside)
            ),
            paths: outside,
        });
    }

    PolicyDecision::Allow
}
