//! Safety policy against the tool calls agents actually make

use std::path::PathBuf;

use serde_json::json;

use sandvisor::policy::{evaluate, BoundaryContext, EscalationKind, PolicyDecision};

fn project() -> BoundaryContext {
    BoundaryContext::new("/workspace/project", "/workspace/project")
        .with_skills_root(Some(PathBuf::from("/mnt/skills")))
        .with_home_dir(Some(PathBuf::from("/home/agent")))
}

fn kind(decision: &PolicyDecision) -> Option<EscalationKind> {
    match decision {
        PolicyDecision::Confirm(e) => Some(e.kind),
        _ => None,
    }
}

#[test]
fn test_workspace_reads_and_writes_pass() {
    let ctx = project();
    for (tool, input) in [
        ("Read", json!({"file_path": "/workspace/project/src/lib.rs"})),
        ("Write", json!({"file_path": "notes/todo.md", "content": "x"})),
        ("Glob", json!({"pattern": "**/*.rs", "path": "src"})),
        ("Read", json!({"file_path": "/mnt/skills/pdf/SKILL.md"})),
        ("Bash", json!({"command": "cargo build --release > /dev/null"})),
        ("Bash", json!({"command": "ls -la"})),
    ] {
        assert_eq!(evaluate(tool, &input, &ctx), PolicyDecision::Allow, "{tool} {input}");
    }
}

#[test]
fn test_deletes_always_confirmed() {
    let ctx = project();
    for (tool, input) in [
        ("Bash", json!({"command": "rm -rf ./build"})),
        ("Bash", json!({"command": "cd out && rm report.txt"})),
        ("Bash", json!({"command": "find . -name '*.tmp' -delete"})),
        ("Bash", json!({"command": "git clean -fdx"})),
        ("Bash", json!({"command": "find . -name '*.o' -exec rm {} +"})),
        ("Bash", json!({"command": "sh -c 'rm -rf build'"})),
        ("Bash", json!({"command": "if true; then rm -rf build; fi"})),
        ("Bash", json!({"command": "nohup rm -rf build"})),
        ("PowerShell", json!({"command": "Remove-Item -Recurse build"})),
        ("DeleteFile", json!({"path": "old.txt"})),
    ] {
        assert_eq!(kind(&evaluate(tool, &input, &ctx)), Some(EscalationKind::Delete), "{tool} {input}");
    }
}

#[test]
fn test_outside_paths_confirmed_and_named() {
    let ctx = project();
    let decision = evaluate("Read", &json!({"file_path": "/etc/passwd"}), &ctx);
    match decision {
        PolicyDecision::Confirm(e) => {
            assert_eq!(e.kind, EscalationKind::Boundary);
            assert_eq!(e.paths, vec!["/etc/passwd".to_string()]);
            assert!(e.reason.contains("/etc/passwd"));
        }
        other => panic!("expected boundary confirmation, got {other:?}"),
    }

    let escape = evaluate("Write", &json!({"file_path": "../other/x.txt"}), &ctx);
    assert_eq!(kind(&escape), Some(EscalationKind::Boundary));

    let shell = evaluate("Bash", &json!({"command": "cat ~/.ssh/id_rsa"}), &ctx);
    assert_eq!(kind(&shell), Some(EscalationKind::Boundary));
}

#[test]
fn test_delete_outside_workspace_lists_paths() {
    let decision = evaluate("Bash", &json!({"command": "rm -rf /var/lib/data"}), &project());
    match decision {
        PolicyDecision::Confirm(e) => {
            assert_eq!(e.kind, EscalationKind::Delete);
            assert_eq!(e.paths, vec!["/var/lib/data".to_string()]);
        }
        other => panic!("expected delete confirmation, got {other:?}"),
    }
}

#[test]
fn test_network_tools_blocked() {
    for tool in ["WebSearch", "WebFetch"] {
        assert!(matches!(
            evaluate(tool, &json!({"query": "x"}), &project()),
            PolicyDecision::Block { .. }
        ));
    }
}
