//! Workspace boundary analysis
//!
//! Collects every string in a tool input that could name a file, resolves it
//! the way the tool would (relative to cwd, `~` and `file://` expanded,
//! symlinks followed) and reports the ones that land outside the allowed roots.
//!
//! ```text
//!   tool input (JSON tree)
//!        │
//!        ├── key ends in path/paths, or file/dir/src/... ──► always a candidate
//!        ├── path-sensitive tool, other strings ─────────► candidate if path-like
//!        └── shell tool, command line ───────────────────► tokenized, filtered
//!        │
//!        ▼
//!   resolve ──► contained in workspaceRoot or skillsRoot? ──► else offending
//! ```

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::delete::{is_shell_tool, shell_command};
use crate::protocol::paths::{canonicalize_existing_prefix, normalize_lexically};

/// Tools whose every string argument is checked for path-likeness
pub const PATH_SENSITIVE_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "MultiEdit",
    "NotebookEdit",
    "Glob",
    "Grep",
    "LS",
];

/// Exact key names (besides `*path`/`*paths`) treated as paths
const PATH_KEYS: &[&str] = &[
    "file",
    "filename",
    "dir",
    "directory",
    "cwd",
    "destination",
    "dest",
    "source",
    "src",
    "target",
];

/// Device paths harmless to reference from anywhere
const NEUTRAL_PATHS: &[&str] = &["/dev/null", "/dev/stdin", "/dev/stdout", "/dev/stderr", "NUL"];

/// How many offending paths a reason lists before summarizing
const MAX_LISTED: usize = 3;

static ENV_ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").expect("env assignment pattern is valid"));

static WINDOWS_DRIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]:[\\/]").expect("drive pattern is valid"));

/// Roots and locations a tool call is judged against
#[derive(Debug, Clone)]
pub struct BoundaryContext {
    pub cwd: PathBuf,
    pub workspace_root: PathBuf,
    pub skills_root: Option<PathBuf>,
    pub home_dir: Option<PathBuf>,
}

impl BoundaryContext {
    pub fn new(cwd: impl Into<PathBuf>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            workspace_root: workspace_root.into(),
            skills_root: None,
            home_dir: std::env::var_os("HOME").map(PathBuf::from),
        }
    }

    pub fn with_skills_root(mut self, skills_root: Option<PathBuf>) -> Self {
        self.skills_root = skills_root;
        self
    }

    pub fn with_home_dir(mut self, home_dir: Option<PathBuf>) -> Self {
        self.home_dir = home_dir;
        self
    }

    fn allowed_roots(&self) -> Vec<PathBuf> {
        std::iter::once(&self.workspace_root)
            .chain(self.skills_root.iter())
            .map(|root| canonicalize_existing_prefix(&normalize_lexically(root)))
            .collect()
    }
}

fn is_path_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.ends_with("path") || lower.ends_with("paths") || PATH_KEYS.contains(&lower.as_str())
}

/// Heuristic for free-form strings in path-sensitive tools
pub fn looks_like_path(s: &str) -> bool {
    if s.is_empty() || s.len() > 4096 || s.contains('\n') {
        return false;
    }
    s.starts_with('/')
        || s == "~"
        || s.starts_with("~/")
        || s.starts_with("./")
        || s.starts_with("../")
        || s == ".."
        || s.starts_with("file://")
        || s.starts_with("\\\\")
        || WINDOWS_DRIVE.is_match(s)
}

/// Split a shell command line into words, honoring quotes
///
/// Operators (`;`, `|`, `&`, `<`, `>`, parentheses) end a word, so a
/// redirect target comes out as its own token.
pub fn shell_tokens(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('"') if c == '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => quote = Some(c),
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                c if c.is_whitespace() || ";|&<>()`".contains(c) => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Tokens from a command line that may name files
fn shell_path_candidates(command: &str) -> Vec<String> {
    shell_tokens(command)
        .into_iter()
        .filter(|t| !t.starts_with('-'))
        .filter(|t| !ENV_ASSIGNMENT.is_match(t))
        .filter(|t| !t.contains('$'))
        .filter(|t| !t.contains("://") || t.starts_with("file://"))
        .filter(|t| looks_like_path(t) || t.contains('/'))
        .collect()
}

/// Walk a tool input and collect candidate path strings
pub fn collect_candidates(tool_name: &str, input: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let path_sensitive = PATH_SENSITIVE_TOOLS.contains(&tool_name);
    walk(input, None, path_sensitive, &mut out);

    if is_shell_tool(tool_name) {
        if let Some(command) = shell_command(input) {
            out.extend(shell_path_candidates(command));
        }
    }

    out.retain(|c| !NEUTRAL_PATHS.contains(&c.as_str()));
    let mut seen = std::collections::HashSet::new();
    out.retain(|c| seen.insert(c.clone()));
    out
}

fn walk(value: &Value, key: Option<&str>, path_sensitive: bool, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                walk(v, Some(k), path_sensitive, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, key, path_sensitive, out);
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return;
            }
            let by_key = key.is_some_and(is_path_key);
            if by_key || (path_sensitive && looks_like_path(trimmed)) {
                out.push(trimmed.to_string());
            }
        }
        _ => {}
    }
}

/// Resolve a candidate as the tool would see it
pub fn resolve_candidate(raw: &str, ctx: &BoundaryContext) -> PathBuf {
    let mut path = if raw.starts_with("file://") {
        url::Url::parse(raw)
            .ok()
            .and_then(|u| u.to_file_path().ok())
            .unwrap_or_else(|| PathBuf::from(raw.trim_start_matches("file://")))
    } else if raw == "~" || raw.starts_with("~/") {
        match &ctx.home_dir {
            Some(home) => home.join(raw.trim_start_matches('~').trim_start_matches('/')),
            None => PathBuf::from(raw),
        }
    } else {
        PathBuf::from(raw)
    };

    if path.is_relative() && !WINDOWS_DRIVE.is_match(raw) {
        path = ctx.cwd.join(path);
    }
    canonicalize_existing_prefix(&normalize_lexically(&path))
}

/// Candidates of a tool call that resolve outside every allowed root
pub fn outside_paths(tool_name: &str, input: &Value, ctx: &BoundaryContext) -> Vec<String> {
    let roots = ctx.allowed_roots();
    collect_candidates(tool_name, input)
        .into_iter()
        .filter(|raw| {
            let resolved = resolve_candidate(raw, ctx);
            !roots.iter().any(|root| resolved.starts_with(root))
        })
        .collect()
}

/// "a, b, c (+2 more)"
pub fn summarize_paths(paths: &[String]) -> String {
    let listed = paths
        .iter()
        .take(MAX_LISTED)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if paths.len() > MAX_LISTED {
        format!("{listed} (+{} more)", paths.len() - MAX_LISTED)
    } else {
        listed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> BoundaryContext {
        BoundaryContext::new("/workspace/project", "/workspace/project")
            .with_skills_root(Some(PathBuf::from("/skills")))
            .with_home_dir(Some(PathBuf::from("/home/agent")))
    }

    #[test]
    fn test_tokenizer_strips_quotes_and_splits_operators() {
        let tokens = shell_tokens(r#"cat "my file.txt" 'a b'>/tmp/out; echo \"x"#);
        assert_eq!(
            tokens,
            vec!["cat", "my file.txt", "a b", "/tmp/out", "echo", "\"x"]
        );
    }

    #[test]
    fn test_shell_candidates_skip_flags_env_urls_and_vars() {
        let c = shell_path_candidates(
            "FOO=/etc/x curl -o ./out https://example.com/a $HOME/x cat /etc/hosts",
        );
        assert_eq!(c, vec!["./out", "/etc/hosts"]);
    }

    #[test]
    fn test_path_keys_always_candidates() {
        let input = json!({"notebook_path": "nb.ipynb", "options": {"dest": "out"}, "text": "/etc"});
        let c = collect_candidates("Unknown", &input);
        assert_eq!(c, vec!["nb.ipynb", "out"]);
    }

    #[test]
    fn test_path_sensitive_tool_checks_free_strings() {
        let c = collect_candidates("Grep", &json!({"pattern": "foo", "glob": "/etc/*.conf"}));
        assert_eq!(c, vec!["/etc/*.conf"]);
    }

    #[test]
    fn test_outside_paths() {
        let c = ctx();
        assert_eq!(
            outside_paths("Read", &json!({"file_path": "/etc/passwd"}), &c),
            vec!["/etc/passwd"]
        );
        assert!(outside_paths("Read", &json!({"file_path": "src/main.rs"}), &c).is_empty());
        assert!(outside_paths("Read", &json!({"file_path": "/skills/pdf/SKILL.md"}), &c).is_empty());
        assert_eq!(
            outside_paths("Read", &json!({"file_path": "../other/secret"}), &c),
            vec!["../other/secret"]
        );
        assert_eq!(
            outside_paths("Write", &json!({"file_path": "~/notes.md"}), &c),
            vec!["~/notes.md"]
        );
        assert_eq!(
            outside_paths("Read", &json!({"file_path": "file:///etc/hosts"}), &c),
            vec!["file:///etc/hosts"]
        );
    }

    #[test]
    fn test_shell_redirect_to_dev_null_is_neutral() {
        let c = ctx();
        assert!(outside_paths("Bash", &json!({"command": "ls src > /dev/null 2>&1"}), &c).is_empty());
        assert_eq!(
            outside_paths("Bash", &json!({"command": "cp build/app /usr/local/bin/"}), &c),
            vec!["/usr/local/bin/"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_detected() {
        let workspace = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), workspace.path().join("link")).unwrap();
        let c = BoundaryContext::new(workspace.path(), workspace.path());
        assert_eq!(
            outside_paths("Read", &json!({"file_path": "link/x"}), &c),
            vec!["link/x"]
        );
        assert!(outside_paths("Read", &json!({"file_path": "x"}), &c).is_empty());
    }

    #[test]
    fn test_summarize_paths() {
        let paths: Vec<String> = ["/a", "/b", "/c", "/d", "/e"].iter().map(|s| s.to_string()).collect();
        assert_eq!(summarize_paths(&paths), "/a, /b, /c (+2 more)");
        assert_eq!(summarize_paths(&paths[..2]), "/a, /b");
    }
}
