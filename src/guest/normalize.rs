//! Rewrite host-perspective paths in tool input
//!
//! The engine sometimes echoes paths the user typed on the host
//! (`/Users/me/project/report.md`, `C:\Users\me\project\a.txt`) or a skills
//! placeholder. Before the policy sees a tool call, those are mapped to the
//! guest mount points so boundary checks and the tool itself see real
//! guest paths.

use serde_json::Value;

use crate::protocol::AgentRequest;

/// Placeholders expanded to the guest skills mount
pub const SKILLS_MARKERS: &[&str] = &["${SKILLS_ROOT}", "$SKILLS_ROOT"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
struct Mapping {
    host: String,
    guest: String,
    windows: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PathNormalizer {
    mappings: Vec<Mapping>,
    skills_root: Option<String>,
}

impl PathNormalizer {
    /// Mappings from the request's mounts and workspace roots
    pub fn for_request(request: &AgentRequest) -> Self {
        let mut pairs: Vec<(String, String)> = request
            .mounts
            .iter()
            .map(|m| (m.host_path.display().to_string(), m.guest_path.display().to_string()))
            .collect();
        pairs.push((
            request.host_workspace_root.display().to_string(),
            request.workspace_root.display().to_string(),
        ));
        let skills_root = request.skills_root().map(|p| p.display().to_string());
        Self::from_pairs(pairs, skills_root)
    }

    pub fn from_pairs(pairs: Vec<(String, String)>, skills_root: Option<String>) -> Self {
        let mut mappings: Vec<Mapping> = pairs
            .into_iter()
            .map(|(host, guest)| (trim_separator(&host), trim_separator(&guest)))
            .filter(|(host, guest)| !host.is_empty() && host != guest)
            .map(|(host, guest)| Mapping {
                windows: host.contains('\\'),
                host,
                guest,
            })
            .collect();
        // Longest prefix first so nested mounts win over the workspace root
        mappings.sort_by(|a, b| b.host.len().cmp(&a.host.len()));
        mappings.dedup_by(|a, b| a.host == b.host);
        Self {
            mappings,
            skills_root,
        }
    }

    /// Rewrite every string in `input`; returns the new value and what changed
    pub fn normalize(&self, input: &Value) -> (Value, Vec<Rewrite>) {
        let mut rewrites = Vec::new();
        let value = self.walk(input, &mut rewrites);
        (value, rewrites)
    }

    fn walk(&self, value: &Value, rewrites: &mut Vec<Rewrite>) -> Value {
        match value {
            Value::String(s) => match self.rewrite(s) {
                Some(new) => {
                    rewrites.push(Rewrite {
                        from: s.clone(),
                        to: new.clone(),
                    });
                    Value::String(new)
                }
                None => value.clone(),
            },
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.walk(v, rewrites)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.walk(v, rewrites)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Rewritten string, or `None` if nothing matched
    pub fn rewrite(&self, s: &str) -> Option<String> {
        let mut current = s.to_string();
        let mut changed = false;

        if let Some(skills) = &self.skills_root {
            for marker in SKILLS_MARKERS {
                if current.contains(marker) {
                    current = current.replace(marker, skills);
                    changed = true;
                }
            }
        }
        for mapping in &self.mappings {
            if let Some(new) = replace_prefix(&current, mapping) {
                current = new;
                changed = true;
            }
        }
        changed.then_some(current)
    }
}

fn trim_separator(path: &str) -> String {
    let trimmed = path.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        path.to_string()
    } else {
        trimmed.to_string()
    }
}

fn is_boundary(c: char) -> bool {
    c.is_whitespace() || matches!(c, '"' | '\'' | '`' | '=' | '(' | ')' | ';' | ',' | '<' | '>')
}

/// Replace whole-path occurrences of `mapping.host` inside `s`
fn replace_prefix(s: &str, mapping: &Mapping) -> Option<String> {
    let host = mapping.host.as_str();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    let mut changed = false;

    while let Some(rel) = s[i..].find(host) {
        let start = i + rel;
        let end = start + host.len();
        let prev_ok = s[..start].chars().next_back().map_or(true, is_boundary);
        let next_ok = s[end..]
            .chars()
            .next()
            .map_or(true, |c| c == '/' || c == '\\' || is_boundary(c));
        if !(prev_ok && next_ok) {
            out.push_str(&s[i..end]);
            i = end;
            continue;
        }

        out.push_str(&s[i..start]);
        out.push_str(&mapping.guest);
        i = end;
        if mapping.windows {
            let tail_end = s[end..].find(is_boundary).map_or(s.len(), |p| end + p);
            out.push_str(&s[end..tail_end].replace('\\', "/"));
            i = tail_end;
        }
        changed = true;
    }

    if !changed {
        return None;
    }
    out.push_str(&s[i..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer() -> PathNormalizer {
        PathNormalizer::from_pairs(
            vec![
                ("/Users/me/project".into(), "/workspace".into()),
                ("/Users/me/project/skills/".into(), "/mnt/skills".into()),
                ("C:\\Users\\me\\proj".into(), "/workspace".into()),
            ],
            Some("/mnt/skills".into()),
        )
    }

    #[test]
    fn test_rewrites_host_paths() {
        let n = normalizer();
        assert_eq!(
            n.rewrite("/Users/me/project/report.md").as_deref(),
            Some("/workspace/report.md")
        );
        assert_eq!(
            n.rewrite("/Users/me/project/skills/pdf/SKILL.md").as_deref(),
            Some("/mnt/skills/pdf/SKILL.md")
        );
        assert_eq!(
            n.rewrite("C:\\Users\\me\\proj\\data\\a.csv").as_deref(),
            Some("/workspace/data/a.csv")
        );
        assert_eq!(
            n.rewrite("cat '/Users/me/project/a b.txt' > out").as_deref(),
            Some("cat '/workspace/a b.txt' > out")
        );
    }

    #[test]
    fn test_leaves_lookalikes_alone() {
        let n = normalizer();
        assert_eq!(n.rewrite("/Users/me/project2/x"), None);
        assert_eq!(n.rewrite("/workspace/x"), None);
        assert_eq!(n.rewrite("see /tmp/Users/me/project"), None);
    }

    #[test]
    fn test_skills_marker_and_tree_walk() {
        let n = normalizer();
        let (value, rewrites) = n.normalize(&json!({
            "file_path": "${SKILLS_ROOT}/docx/SKILL.md",
            "edits": [{"path": "/Users/me/project/a.txt"}],
            "count": 3,
        }));
        assert_eq!(value["file_path"], "/mnt/skills/docx/SKILL.md");
        assert_eq!(value["edits"][0]["path"], "/workspace/a.txt");
        assert_eq!(value["count"], 3);
        assert_eq!(rewrites.len(), 2);
    }
}
