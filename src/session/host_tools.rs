//! Host tools the guest engine can call back into
//!
//! These read the user's saved sessions and memories, which only exist on
//! the host.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::store::{MemoryStore, SessionStore};
use super::HostToolHandler;
use crate::protocol::{HostToolRequest, HostToolResponse};

pub const CONVERSATION_SEARCH: &str = "conversation_search";
pub const RECENT_SESSIONS: &str = "recent_sessions";
pub const MEMORY_LIST: &str = "memory_list";
pub const MEMORY_ADD: &str = "memory_add";
pub const MEMORY_UPDATE: &str = "memory_update";
pub const MEMORY_DELETE: &str = "memory_delete";

pub const HOST_TOOL_NAMES: &[&str] = &[
    CONVERSATION_SEARCH,
    RECENT_SESSIONS,
    MEMORY_LIST,
    MEMORY_ADD,
    MEMORY_UPDATE,
    MEMORY_DELETE,
];

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 50;

/// Host tools backed by on-disk stores
pub struct LocalHostTools {
    sessions: SessionStore,
    memories: MemoryStore,
}

impl LocalHostTools {
    pub fn new(sessions: SessionStore, memories: MemoryStore) -> Self {
        Self { sessions, memories }
    }

    /// Stores under `base_dir/history` and `base_dir/memories.json`
    pub fn open(base_dir: &Path) -> io::Result<Self> {
        Ok(Self::new(
            SessionStore::new(base_dir.join("history"))?,
            MemoryStore::new(base_dir.join("memories.json"))?,
        ))
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn memories(&self) -> &MemoryStore {
        &self.memories
    }

    /// Run one tool call synchronously
    pub fn dispatch(&self, tool_name: &str, input: &Value) -> HostToolResponse {
        let result = match tool_name {
            CONVERSATION_SEARCH => {
                let Some(query) = str_arg(input, "query") else {
                    return HostToolResponse::failure("missing `query`");
                };
                self.sessions
                    .search(query, limit_arg(input))
                    .map(|hits| json!({ "results": hits }))
            }
            RECENT_SESSIONS => self
                .sessions
                .recent(limit_arg(input))
                .map(|sessions| json!({ "sessions": sessions })),
            MEMORY_LIST => self
                .memories
                .list()
                .map(|memories| json!({ "memories": memories })),
            MEMORY_ADD => {
                let Some(content) = str_arg(input, "content") else {
                    return HostToolResponse::failure("missing `content`");
                };
                self.memories
                    .add(content)
                    .map(|memory| json!({ "memory": memory }))
            }
            MEMORY_UPDATE => {
                let (Some(id), Some(content)) = (str_arg(input, "id"), str_arg(input, "content"))
                else {
                    return HostToolResponse::failure("missing `id` or `content`");
                };
                match self.memories.update(id, content) {
                    Ok(Some(memory)) => Ok(json!({ "memory": memory })),
                    Ok(None) => return HostToolResponse::failure(format!("no memory `{id}`")),
                    Err(e) => Err(e),
                }
            }
            MEMORY_DELETE => {
                let Some(id) = str_arg(input, "id") else {
                    return HostToolResponse::failure("missing `id`");
                };
                self.memories
                    .delete(id)
                    .map(|deleted| json!({ "deleted": deleted }))
            }
            other => return HostToolResponse::failure(format!("unknown host tool `{other}`")),
        };

        match result {
            Ok(value) => HostToolResponse::ok(value),
            Err(e) => {
                warn!(tool = tool_name, error = %e, "host tool failed");
                HostToolResponse::failure(e.to_string())
            }
        }
    }
}

#[async_trait]
impl HostToolHandler for LocalHostTools {
    async fn call(&self, request: &HostToolRequest) -> HostToolResponse {
        debug!(tool = %request.tool_name, request_id = %request.request_id, "host tool call");
        self.dispatch(&request.tool_name, &request.tool_input)
    }
}

fn str_arg<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str)
}

fn limit_arg(input: &Value) -> usize {
    input
        .get("limit")
        .and_then(Value::as_u64)
        .map(|n| (n as usize).clamp(1, MAX_LIMIT))
        .unwrap_or(DEFAULT_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::SessionRecord;

    fn tools() -> (tempfile::TempDir, LocalHostTools) {
        let dir = tempfile::tempdir().unwrap();
        let tools = LocalHostTools::open(dir.path()).unwrap();
        (dir, tools)
    }

    #[test]
    fn test_memory_tools() {
        let (_dir, tools) = tools();
        let added = tools.dispatch(MEMORY_ADD, &json!({"content": "likes tea"}));
        assert!(added.success);
        let id = added.result.unwrap()["memory"]["id"].as_str().unwrap().to_string();

        let listed = tools.dispatch(MEMORY_LIST, &json!({}));
        assert_eq!(listed.result.unwrap()["memories"].as_array().unwrap().len(), 1);

        let updated = tools.dispatch(MEMORY_UPDATE, &json!({"id": id, "content": "likes coffee"}));
        assert_eq!(updated.result.unwrap()["memory"]["content"], "likes coffee");

        let missing = tools.dispatch(MEMORY_UPDATE, &json!({"id": "nope", "content": "x"}));
        assert!(!missing.success);

        let deleted = tools.dispatch(MEMORY_DELETE, &json!({"id": id}));
        assert_eq!(deleted.result.unwrap()["deleted"], true);
    }

    #[test]
    fn test_search_and_recent() {
        let (_dir, tools) = tools();
        let mut record = SessionRecord::new("Budget review");
        record.add_entry("user", "compare the invoices from march");
        tools.sessions().save(&record).unwrap();

        let found = tools.dispatch(CONVERSATION_SEARCH, &json!({"query": "invoices"}));
        assert_eq!(found.result.unwrap()["results"][0]["sessionId"], record.id.as_str());

        let recent = tools.dispatch(RECENT_SESSIONS, &json!({"limit": 0}));
        assert_eq!(recent.result.unwrap()["sessions"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_bad_calls_fail_cleanly() {
        let (_dir, tools) = tools();
        assert!(!tools.dispatch(CONVERSATION_SEARCH, &json!({})).success);
        let unknown = tools.dispatch("launch_rockets", &json!({}));
        assert!(unknown.error.unwrap().contains("launch_rockets"));
    }
}
