// Memory tools: an in-process note store exposed as internal tools

use crate::protocol::ToolSchema;
use crate::tools::{
    json_schema_array, json_schema_integer, json_schema_object, json_schema_string, InternalToolRegistry,
    ToolError, ToolHandler,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

const DEFAULT_MEMORY_CAPACITY: usize = 1000;
const DEFAULT_RECALL_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryNote {
    pub id: u64,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl MemoryNote {
    fn matches(&self, needle: &str) -> bool {
        self.content.to_lowercase().contains(needle)
            || self.tags.iter().any(|t| t.to_lowercase().contains(needle))
    }
}

/// Bounded, transient note store. The oldest note is dropped past capacity.
pub struct MemoryStore {
    notes: Mutex<VecDeque<MemoryNote>>,
    next_id: Mutex<u64>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            notes: Mutex::new(VecDeque::new()),
            next_id: Mutex::new(1),
            capacity: capacity.max(1),
        }
    }

    fn notes(&self) -> MutexGuard<'_, VecDeque<MemoryNote>> {
        self.notes.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn remember(&self, content: String, tags: Vec<String>) -> MemoryNote {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|p| p.into_inner());
            let id = *next;
            *next += 1;
            id
        };
        let note = MemoryNote {
            id,
            content,
            tags,
            created_at: Utc::now(),
        };

        let mut notes = self.notes();
        notes.push_back(note.clone());
        while notes.len() > self.capacity {
            notes.pop_front();
        }
        note
    }

    /// Notes matching every whitespace-separated term, newest first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<MemoryNote> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        self.notes()
            .iter()
            .rev()
            .filter(|note| terms.iter().all(|t| note.matches(t)))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<MemoryNote> {
        self.notes().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.notes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

/// Register `remember`, `search_memory` and `recall_recent` against one store.
pub fn register_memory_tools(registry: &mut InternalToolRegistry, store: Arc<MemoryStore>) {
    registry.register(Arc::new(RememberTool {
        store: Arc::clone(&store),
    }));
    registry.register(Arc::new(SearchMemoryTool {
        store: Arc::clone(&store),
    }));
    registry.register(Arc::new(RecallRecentTool { store }));
}

pub struct RememberTool {
    store: Arc<MemoryStore>,
}

#[derive(Debug, Deserialize)]
struct RememberArgs {
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[async_trait::async_trait]
impl ToolHandler for RememberTool {
    fn definition(&self) -> ToolSchema {
        ToolSchema {
            name: "remember".to_string(),
            description: "Store a note in the hub's short-term memory".to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "content": json_schema_string("Text to remember"),
                    "tags": json_schema_array(json_schema_string("Tag"), "Optional tags for later lookup")
                }),
                vec!["content"],
            ),
        }
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let args: RememberArgs = serde_json::from_value(arguments)?;
        if args.content.trim().is_empty() {
            return Err(ToolError::InvalidArguments("'content' must not be empty".into()));
        }
        let note = self.store.remember(args.content, args.tags);
        Ok(serde_json::json!({ "stored": true, "id": note.id }))
    }
}

pub struct SearchMemoryTool {
    store: Arc<MemoryStore>,
}

#[derive(Debug, Deserialize)]
struct SearchMemoryArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait::async_trait]
impl ToolHandler for SearchMemoryTool {
    fn definition(&self) -> ToolSchema {
        ToolSchema {
            name: "search_memory".to_string(),
            description: "Search remembered notes by text or tag".to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "query": json_schema_string("Words that must all appear in the note or its tags"),
                    "limit": json_schema_integer("Maximum number of notes (default: 10)")
                }),
                vec!["query"],
            ),
        }
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let args: SearchMemoryArgs = serde_json::from_value(arguments)?;
        let notes = self
            .store
            .search(&args.query, args.limit.unwrap_or(DEFAULT_RECALL_LIMIT));
        Ok(serde_json::json!({ "notes": notes }))
    }
}

pub struct RecallRecentTool {
    store: Arc<MemoryStore>,
}

#[derive(Debug, Default, Deserialize)]
struct RecallArgs {
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait::async_trait]
impl ToolHandler for RecallRecentTool {
    fn definition(&self) -> ToolSchema {
        ToolSchema {
            name: "recall_recent".to_string(),
            description: "Return the most recently remembered notes".to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "limit": json_schema_integer("Maximum number of notes (default: 10)")
                }),
                vec![],
            ),
        }
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let args: RecallArgs = if arguments.is_null() {
            RecallArgs::default()
        } else {
            serde_json::from_value(arguments)?
        };
        let notes = self.store.recent(args.limit.unwrap_or(DEFAULT_RECALL_LIMIT));
        Ok(serde_json::json!({ "notes": notes }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_store_drops_oldest_past_capacity() {
        let store = MemoryStore::new(2);
        store.remember("one".into(), vec![]);
        store.remember("two".into(), vec![]);
        store.remember("three".into(), vec![]);

        let recent: Vec<_> = store.recent(10).into_iter().map(|n| n.content).collect();
        assert_eq!(recent, vec!["three", "two"]);
    }

    #[test]
    fn test_search_matches_tags_case_insensitively() {
        let store = MemoryStore::default();
        store.remember("deploy checklist".into(), vec!["Release".into()]);
        store.remember("lunch order".into(), vec![]);

        let hits = store.search("release", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "deploy checklist");
        assert!(store.search("deploy lunch", 10).is_empty());
    }

    #[tokio::test]
    async fn test_memory_tools_share_one_store() {
        let store = Arc::new(MemoryStore::default());
        let mut registry = InternalToolRegistry::new();
        register_memory_tools(&mut registry, Arc::clone(&store));

        let remember = registry.get("remember").unwrap();
        let out = remember
            .invoke(json!({"content": "hub port is 8080", "tags": ["config"]}))
            .await
            .unwrap();
        assert_eq!(out["stored"], true);

        let search = registry.get("search_memory").unwrap();
        let out = search.invoke(json!({"query": "port"})).await.unwrap();
        assert_eq!(out["notes"][0]["content"], "hub port is 8080");

        let recall = registry.get("recall_recent").unwrap();
        let out = recall.invoke(json!({})).await.unwrap();
        assert_eq!(out["notes"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remember_rejects_empty_content() {
        let tool = RememberTool {
            store: Arc::new(MemoryStore::default()),
        };
        let err = tool.invoke(json!({"content": "  "})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
