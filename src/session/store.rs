//! Saved sessions and user memories on the host
//!
//! Backs the host tools the guest engine can call (conversation search,
//! recent sessions, memory CRUD). One JSON file per session, one JSON
//! file for all memories.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::protocol::layout::is_valid_id;

/// One line of a saved session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    /// "user" or "assistant"
    pub role: String,
    pub text: String,
}

/// A saved session transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub updated_at: u64,
    pub title: String,
    /// Engine session id, for resuming
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_session_id: Option<String>,
    #[serde(default)]
    pub entries: Vec<TranscriptEntry>,
}

impl SessionRecord {
    pub fn new(title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            title: title.into(),
            engine_session_id: None,
            entries: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, role: impl Into<String>, text: impl Into<String>) {
        self.entries.push(TranscriptEntry {
            role: role.into(),
            text: text.into(),
        });
        self.updated_at = now_millis();
    }
}

/// Summary of a session for listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub updated_at: u64,
    pub entries: usize,
}

/// A search match
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub session_id: String,
    pub title: String,
    pub snippet: String,
    pub updated_at: u64,
}

/// SessionRecord storage manager
pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn save(&self, record: &SessionRecord) -> io::Result<()> {
        let path = self.path(&record.id)?;
        let json = serde_json::to_string_pretty(record).map_err(invalid_data)?;
        std::fs::write(path, json)
    }

    pub fn load(&self, id: &str) -> io::Result<SessionRecord> {
        load_json(&self.path(id)?)
    }

    pub fn delete(&self, id: &str) -> io::Result<()> {
        std::fs::remove_file(self.path(id)?)
    }

    /// All readable sessions, most recently updated first
    pub fn all(&self) -> io::Result<Vec<SessionRecord>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Ok(record) = load_json::<SessionRecord>(&path) {
                    out.push(record);
                }
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    pub fn recent(&self, limit: usize) -> io::Result<Vec<SessionSummary>> {
        Ok(self
            .all()?
            .into_iter()
            .take(limit)
            .map(|c| SessionSummary {
                entries: c.entries.len(),
                id: c.id,
                title: truncate(&c.title, 80),
                updated_at: c.updated_at,
            })
            .collect())
    }

    /// Case-insensitive substring search over titles and transcript text
    pub fn search(&self, query: &str, limit: usize) -> io::Result<Vec<SearchHit>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits = Vec::new();
        for record in self.all()? {
            let matched = std::iter::once(record.title.as_str())
                .chain(record.entries.iter().map(|e| e.text.as_str()))
                .find(|text| text.to_lowercase().contains(&needle));
            if let Some(text) = matched {
                hits.push(SearchHit {
                    session_id: record.id.clone(),
                    title: record.title.clone(),
                    snippet: snippet(text, &needle, 160),
                    updated_at: record.updated_at,
                });
                if hits.len() >= limit {
                    break;
                }
            }
        }
        Ok(hits)
    }

    fn path(&self, id: &str) -> io::Result<PathBuf> {
        if !is_valid_id(id) {
            return Err(io::Error::new(ErrorKind::InvalidInput, format!("invalid id `{id}`")));
        }
        Ok(self.base_dir.join(format!("{id}.json")))
    }
}

/// A remembered fact about the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: String,
    pub content: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// User memories in a single JSON file
pub struct MemoryStore {
    path: PathBuf,
}

impl MemoryStore {
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn list(&self) -> io::Result<Vec<Memory>> {
        match load_json(&self.path) {
            Ok(memories) => Ok(memories),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub fn add(&self, content: impl Into<String>) -> io::Result<Memory> {
        let mut memories = self.list()?;
        let now = now_millis();
        let memory = Memory {
            id: uuid::Uuid::now_v7().to_string(),
            content: content.into(),
            created_at: now,
            updated_at: now,
        };
        memories.push(memory.clone());
        self.write(&memories)?;
        Ok(memory)
    }

    /// Replace the content of `id`; `None` if no such memory
    pub fn update(&self, id: &str, content: impl Into<String>) -> io::Result<Option<Memory>> {
        let mut memories = self.list()?;
        let Some(memory) = memories.iter_mut().find(|m| m.id == id) else {
            return Ok(None);
        };
        memory.content = content.into();
        memory.updated_at = now_millis();
        let updated = memory.clone();
        self.write(&memories)?;
        Ok(Some(updated))
    }

    /// Remove `id`; returns whether it existed
    pub fn delete(&self, id: &str) -> io::Result<bool> {
        let mut memories = self.list()?;
        let before = memories.len();
        memories.retain(|m| m.id != id);
        if memories.len() == before {
            return Ok(false);
        }
        self.write(&memories)?;
        Ok(true)
    }

    fn write(&self, memories: &[Memory]) -> io::Result<()> {
        let json = serde_json::to_string_pretty(memories).map_err(invalid_data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(tmp, &self.path)
    }
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> io::Result<T> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(invalid_data)
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, e)
}

pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Truncate to `max_chars`, adding an ellipsis if needed
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

/// Up to `width` chars of `text` around the first match of `needle`
fn snippet(text: &str, needle: &str, width: usize) -> String {
    let lower = text.to_lowercase();
    // Lowercasing can change byte lengths; fall back to the start on mismatch.
    let start_byte = lower
        .find(needle)
        .filter(|_| lower.len() == text.len())
        .unwrap_or(0);
    let start_char = text[..start_byte].chars().count();
    let skip = start_char.saturating_sub(width / 4);
    let body: String = text.chars().skip(skip).take(width).collect();
    if skip > 0 {
        format!("...{body}")
    } else {
        body
    }
}
