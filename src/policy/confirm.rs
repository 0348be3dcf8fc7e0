//! Interactive confirmation over the permission channel
//!
//! An escalated tool call is turned into a synthetic user-question call. The
//! host renders it like any other question; only an `allow` whose answers
//! carry the approve label lets the gated call through.

use serde_json::{json, Value};

use super::Escalation;
use crate::protocol::PermissionResponse;

/// Tool the engine uses to ask the user a question
pub const USER_QUESTION_TOOL: &str = "AskUserQuestion";

pub const APPROVE_LABEL: &str = "Allow";
pub const DENY_LABEL: &str = "Deny";

/// Build the synthetic question input for an escalated call
pub fn confirmation_input(tool_name: &str, escalation: &Escalation) -> Value {
    json!({
        "questions": [{
            "header": escalation.kind.header(),
            "question": format!("Allow `{tool_name}`? {}", escalation.reason),
            "multiSelect": false,
            "options": [
                { "label": APPROVE_LABEL, "description": "Run this tool call once" },
                { "label": DENY_LABEL, "description": "Refuse and tell the agent why" },
            ],
        }],
        "toolName": tool_name,
    })
}

/// Whether a response to a synthetic question approves the call
pub fn is_approved(response: &PermissionResponse) -> bool {
    if !response.is_allow() {
        return false;
    }
    response
        .updated_input
        .as_ref()
        .and_then(|input| input.get("answers"))
        .is_some_and(contains_approve_label)
}

// Answers arrive either as {question: label} or as a list of labels.
fn contains_approve_label(value: &Value) -> bool {
    match value {
        Value::String(s) => s.trim() == APPROVE_LABEL,
        Value::Array(items) => items.iter().any(contains_approve_label),
        Value::Object(map) => map.values().any(contains_approve_label),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::EscalationKind;

    #[test]
    fn test_only_allow_with_label_approves() {
        let approved = PermissionResponse::allow(Some(json!({
            "answers": {"Allow `Bash`? command uses delete command": "Allow"}
        })));
        assert!(is_approved(&approved));

        let as_list = PermissionResponse::allow(Some(json!({"answers": ["Allow"]})));
        assert!(is_approved(&as_list));

        let picked_deny = PermissionResponse::allow(Some(json!({"answers": {"q": "Deny"}})));
        assert!(!is_approved(&picked_deny));

        let no_answers = PermissionResponse::allow(None);
        assert!(!is_approved(&no_answers));

        assert!(!is_approved(&PermissionResponse::deny("no")));
    }

    #[test]
    fn test_confirmation_input_offers_both_labels() {
        let escalation = Escalation {
            kind: EscalationKind::Delete,
            reason: "command uses delete command".into(),
            paths: vec![],
        };
        let input = confirmation_input("Bash", &escalation);
        let options = input["questions"][0]["options"].as_array().unwrap();
        let labels: Vec<&str> = options.iter().filter_map(|o| o["label"].as_str()).collect();
        assert_eq!(labels, vec![APPROVE_LABEL, DENY_LABEL]);
        assert!(input["questions"][0]["question"]
            .as_str()
            .unwrap()
            .contains("delete command"));
    }
}
