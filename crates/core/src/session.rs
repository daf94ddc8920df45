//! Progressive disclosure session store.
//!
//! Each live client connection owns a bounded, insertion-ordered set of
//! visible tool names. The set lives exactly as long as the connection's
//! [`SessionGuard`]; dropping the guard discards it.

use crate::error::{HubError, HubResult};
use crate::types::SessionId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

pub const DEFAULT_VISIBLE_CAPACITY: usize = 200;

/// Bounded FIFO set of tool names
#[derive(Debug, Clone)]
pub struct VisibleSet {
    names: VecDeque<String>,
    capacity: usize,
}

/// What a `load` did to the set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Already visible; the set was left untouched.
    AlreadyVisible,
    /// Appended; oldest entries evicted to stay within capacity.
    Loaded { evicted: Vec<String> },
}

impl LoadOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }
}

impl VisibleSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            names: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn load(&mut self, name: &str) -> LoadOutcome {
        if self.contains(name) {
            return LoadOutcome::AlreadyVisible;
        }

        self.names.push_back(name.to_string());
        let mut evicted = Vec::new();
        while self.names.len() > self.capacity {
            if let Some(oldest) = self.names.pop_front() {
                evicted.push(oldest);
            }
        }
        LoadOutcome::Loaded { evicted }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Names in insertion order, oldest first.
    pub fn names(&self) -> Vec<String> {
        self.names.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

struct SessionEntry {
    visible: VisibleSet,
    created_at: DateTime<Utc>,
    notifier: Option<mpsc::UnboundedSender<serde_json::Value>>,
}

/// Summary of one live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub visible_count: usize,
    pub capacity: usize,
    pub created_at: DateTime<Utc>,
}

/// Store of all live sessions, keyed by [`SessionId`]
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    capacity: usize,
}

impl SessionStore {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        })
    }

    // Entries are plain data, so a poisoned lock still holds a usable map.
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a session. It is destroyed when the returned guard is dropped.
    ///
    /// `notifier` receives server-initiated JSON-RPC notifications for the
    /// session (e.g. `notifications/tools/list_changed`).
    pub fn open(
        self: &Arc<Self>,
        notifier: Option<mpsc::UnboundedSender<serde_json::Value>>,
    ) -> SessionGuard {
        let id = SessionId::new();
        self.lock().insert(
            id,
            SessionEntry {
                visible: VisibleSet::new(self.capacity),
                created_at: Utc::now(),
                notifier,
            },
        );
        tracing::info!(session = %id, "session opened");
        SessionGuard {
            id,
            store: Arc::clone(self),
        }
    }

    fn close(&self, id: &SessionId) {
        if self.lock().remove(id).is_some() {
            tracing::info!(session = %id, "session closed");
        }
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.lock().contains_key(id)
    }

    /// Visible names for a session, oldest first.
    pub fn visible(&self, id: &SessionId) -> HubResult<Vec<String>> {
        self.lock()
            .get(id)
            .map(|entry| entry.visible.names())
            .ok_or_else(|| session_not_found(id))
    }

    pub fn is_visible(&self, id: &SessionId, name: &str) -> HubResult<bool> {
        self.lock()
            .get(id)
            .map(|entry| entry.visible.contains(name))
            .ok_or_else(|| session_not_found(id))
    }

    /// Add a tool to the session's visible set, evicting FIFO past capacity.
    ///
    /// The caller checks the name against the catalog first.
    pub fn load(&self, id: &SessionId, name: &str) -> HubResult<LoadOutcome> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(id).ok_or_else(|| session_not_found(id))?;
        let outcome = entry.visible.load(name);

        if let LoadOutcome::Loaded { evicted } = &outcome {
            if !evicted.is_empty() {
                tracing::debug!(session = %id, evicted = ?evicted, "visible set over capacity, evicted oldest");
            }
        }
        Ok(outcome)
    }

    /// Push a notification to the session's live stream, if it has one.
    pub fn notify(&self, id: &SessionId, message: serde_json::Value) {
        if let Some(notifier) = self.lock().get(id).and_then(|e| e.notifier.as_ref()) {
            // Receiver gone means the stream is closing; the guard cleans up.
            let _ = notifier.send(message);
        }
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .lock()
            .iter()
            .map(|(id, entry)| SessionSummary {
                id: *id,
                visible_count: entry.visible.len(),
                capacity: entry.visible.capacity(),
                created_at: entry.created_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn session_not_found(id: &SessionId) -> HubError {
    HubError::SessionNotFound { id: id.to_string() }
}

/// Scoped ownership of one session
pub struct SessionGuard {
    id: SessionId,
    store: Arc<SessionStore>,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.store.close(&self.id);
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_is_idempotent() {
        let mut set = VisibleSet::new(3);
        assert!(set.load("a").changed());
        assert!(set.load("b").changed());
        assert_eq!(set.load("a"), LoadOutcome::AlreadyVisible);
        assert_eq!(set.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_fifo_eviction_never_exceeds_capacity() {
        let mut set = VisibleSet::new(200);
        for i in 0..201 {
            set.load(&format!("tool_{}", i));
            assert!(set.len() <= 200);
        }
        let names = set.names();
        assert_eq!(names.len(), 200);
        assert!(!set.contains("tool_0"));
        assert_eq!(names.first().map(String::as_str), Some("tool_1"));
        assert_eq!(names.last().map(String::as_str), Some("tool_200"));
    }

    #[test]
    fn test_eviction_reports_evicted_names() {
        let mut set = VisibleSet::new(2);
        set.load("a");
        set.load("b");
        assert_eq!(
            set.load("c"),
            LoadOutcome::Loaded {
                evicted: vec!["a".to_string()]
            }
        );
    }

    #[test]
    fn test_guard_drop_destroys_session() {
        let store = SessionStore::new(10);
        let guard = store.open(None);
        let id = guard.id();

        store.load(&id, "x").unwrap();
        assert_eq!(store.visible(&id).unwrap(), vec!["x"]);

        drop(guard);
        assert!(!store.contains(&id));
        assert!(matches!(
            store.visible(&id),
            Err(HubError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn test_sessions_are_independent() {
        let store = SessionStore::new(10);
        let a = store.open(None);
        let b = store.open(None);

        store.load(&a.id(), "only_a").unwrap();
        assert!(store.is_visible(&a.id(), "only_a").unwrap());
        assert!(!store.is_visible(&b.id(), "only_a").unwrap());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_new_session_starts_empty_after_reconnect() {
        let store = SessionStore::new(10);
        let first = store.open(None);
        store.load(&first.id(), "x").unwrap();
        drop(first);

        let second = store.open(None);
        assert!(store.visible(&second.id()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notify_reaches_session_stream() {
        let store = SessionStore::new(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = store.open(Some(tx));

        store.notify(&guard.id(), serde_json::json!({"method": "ping"}));
        assert_eq!(rx.recv().await.unwrap()["method"], "ping");
    }
}
