//! Delete-like tool call detection
//!
//! A call is delete-like when the tool itself is a deletion tool, or when a
//! shell tool's command line invokes a delete-capable command. Any match
//! forces confirmation no matter where the target lives.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Tools whose only purpose is removing files
pub const DELETE_TOOL_NAMES: &[&str] = &[
    "Delete",
    "DeleteFile",
    "delete_file",
    "RemoveFile",
    "remove_file",
];

/// Tools that run an arbitrary shell command line
pub const SHELL_TOOL_NAMES: &[&str] = &[
    "Bash",
    "bash",
    "Shell",
    "shell",
    "PowerShell",
    "run_command",
    "execute_command",
];

/// Argument keys that may carry the command line of a shell tool
const COMMAND_KEYS: &[&str] = &["command", "cmd", "script"];

// Command words must start a simple command: line start, after an operator,
// quote, subshell/backtick or shell keyword, as the argument of `find -exec`,
// or behind wrappers such as `sudo`, `nohup` or `time` (flags, numeric
// arguments and env assignments in between are skipped).
static DELETE_COMMAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?:^|[;&|(`\n'"{!]|\$\(|\b(?:then|do|else|elif)\s|\s-(?:exec|execdir|ok|okdir)\s)\s*(?:[a-z_][a-z0-9_]*=\S*\s+)*(?:(?:sudo|doas|xargs|exec|command|builtin|env|nohup|time|nice|ionice|timeout|stdbuf)\s+(?:(?:-\S+|\d\S*|[a-z_][a-z0-9_]*=\S*)\s+)*)*(?:\S*[/\\])?(?:rm|rmdir|unlink|del|erase|remove-item|ri)(?:\.exe)?(?:\s|$|[;&|)'"`])"#,
    )
    .expect("delete command pattern is valid")
});

static FIND_DELETE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bfind\b[^;&|\n]*\s-delete\b").expect("find pattern is valid"));

// Global options may take a value (`git -C repo clean`).
static GIT_CLEAN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bgit\s+(?:-\S+\s+(?:[^-\s]\S*\s+)?)*clean\b")
        .expect("git clean pattern is valid")
});

pub fn is_shell_tool(tool_name: &str) -> bool {
    SHELL_TOOL_NAMES.contains(&tool_name)
}

pub fn is_delete_tool(tool_name: &str) -> bool {
    DELETE_TOOL_NAMES.contains(&tool_name)
}

/// Command line of a shell tool call, if it has one
pub fn shell_command(input: &Value) -> Option<&str> {
    COMMAND_KEYS
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
}

/// Why a command line counts as deleting, if it does
pub fn classify_command(command: &str) -> Option<&'static str> {
    if DELETE_COMMAND.is_match(command) {
        Some("delete command")
    } else if FIND_DELETE.is_match(command) {
        Some("find -delete")
    } else if GIT_CLEAN.is_match(command) {
        Some("git clean")
    } else {
        None
    }
}

/// Classify a tool call. Returns a short human-readable reason when delete-like.
pub fn classify(tool_name: &str, input: &Value) -> Option<String> {
    if is_delete_tool(tool_name) {
        return Some(format!("`{tool_name}` deletes files"));
    }
    if is_shell_tool(tool_name) {
        let command = shell_command(input)?;
        return classify_command(command)
            .map(|label| format!("command uses {label}: `{}`", truncate(command, 120)));
    }
    None
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delete_commands_detected() {
        for cmd in [
            "rm -rf ./build",
            "cd out && rm file.txt",
            "sudo rm -r /tmp/x",
            "rmdir empty",
            "unlink link",
            "del C:\\temp\\a.txt",
            "erase a.txt",
            "Remove-Item -Recurse dist",
            "find . -name '*.o' -delete",
            "git clean -fdx",
            "git -C repo clean -n",
            "ls | xargs rm",
            "echo $(rm a)",
            "find . -name '*.o' -exec rm {} +",
            "find . -type d -execdir rmdir {} \\;",
            "sh -c 'rm -rf build'",
            "bash -c \"rm -rf ./build\"",
            "if true; then rm -rf build; fi",
            "for f in *.log; do rm $f; done",
            "nohup rm -rf build",
            "time rm -rf build",
            "nice -n 10 rm -rf build",
            "timeout 5 rm -rf build",
            "FORCE=1 rm -rf build",
            "/bin/rm -rf build",
            "! rm missing",
        ] {
            assert!(classify_command(cmd).is_some(), "expected delete: {cmd}");
        }
    }

    #[test]
    fn test_benign_commands_pass() {
        for cmd in [
            "ls -la",
            "cargo build --release",
            "grep -r rm src",
            "echo format",
            "npm run deleted-items",
            "git status",
            "find . -name '*.rs'",
            "cat rmfile.txt",
            "todo list",
            "grep -rn 'format' src",
            "cargo test -- --nocapture",
        ] {
            assert!(classify_command(cmd).is_none(), "unexpected delete: {cmd}");
        }
    }

    #[test]
    fn test_classify_by_tool_name() {
        assert!(classify("DeleteFile", &json!({"path": "a"})).is_some());
        assert!(classify("Read", &json!({"file_path": "rm"})).is_none());
        let reason = classify("Bash", &json!({"command": "rm -rf ./build"})).unwrap();
        assert!(reason.contains("delete command"));
    }
}
