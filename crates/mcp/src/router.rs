//! Aggregation Router.
//!
//! Merges internal tools and every ready upstream's tool list into one
//! [`Catalog`] and dispatches calls to the right origin.
//!
//! The catalog is never edited in place. It is rebuilt wholesale when the
//! upstream manager's revision moves and swapped in behind an `Arc`, so a
//! reader holding the old one keeps a consistent view.

use crate::tools::InternalToolRegistry;
use crate::upstream::UpstreamManager;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use switchboard_core::events::{CallOutcome, EventBus, EventType};
use switchboard_core::search;
use switchboard_core::{
    namespaced_tool_name, ConnectionState, HubError, HubResult, ToolDefinition, UpstreamKind, UpstreamStatus,
    INTERNAL_ORIGIN,
};

/// Where a catalog entry's calls go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Internal,
    Upstream { upstream_id: String, tool_name: String },
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub definition: ToolDefinition,
    pub route: Route,
}

/// Immutable snapshot of the merged tool catalog
#[derive(Debug, Default)]
pub struct Catalog {
    entries: HashMap<String, CatalogEntry>,
    order: Vec<String>,
    revision: u64,
}

impl Catalog {
    /// Internal tools first (bare names), then each upstream in id order
    /// as `<id>__<tool>`. A name already taken is dropped with a warning.
    fn build(
        internal: &InternalToolRegistry,
        upstreams: Vec<(String, Arc<Vec<crate::protocol::ToolSchema>>)>,
        revision: u64,
    ) -> Self {
        let mut catalog = Self {
            revision,
            ..Default::default()
        };

        for definition in internal.definitions() {
            catalog.insert(definition, Route::Internal);
        }

        for (upstream_id, tools) in upstreams {
            for schema in tools.iter() {
                let name = namespaced_tool_name(&upstream_id, &schema.name);
                let definition = ToolDefinition::new(
                    name,
                    schema.description.clone(),
                    schema.input_schema.clone(),
                    upstream_id.clone(),
                );
                catalog.insert(
                    definition,
                    Route::Upstream {
                        upstream_id: upstream_id.clone(),
                        tool_name: schema.name.clone(),
                    },
                );
            }
        }
        catalog
    }

    fn insert(&mut self, definition: ToolDefinition, route: Route) {
        if let Some(existing) = self.entries.get(&definition.name) {
            tracing::warn!(
                tool = %definition.name,
                kept = %existing.definition.origin_id,
                dropped = %definition.origin_id,
                "duplicate tool name in catalog"
            );
            return;
        }
        self.order.push(definition.name.clone());
        self.entries
            .insert(definition.name.clone(), CatalogEntry { definition, route });
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Definitions in catalog order
    pub fn tools(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name).map(|e| &e.definition))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

pub struct AggregationRouter {
    internal: Arc<InternalToolRegistry>,
    upstreams: Arc<UpstreamManager>,
    catalog: RwLock<Arc<Catalog>>,
    events: EventBus,
}

impl AggregationRouter {
    pub fn new(internal: Arc<InternalToolRegistry>, upstreams: Arc<UpstreamManager>) -> Self {
        let events = upstreams.events().clone();
        let revision = upstreams.revision();
        let catalog = Catalog::build(&internal, upstreams.ready_tools(), revision);
        Self {
            internal,
            upstreams,
            catalog: RwLock::new(Arc::new(catalog)),
            events,
        }
    }

    /// Current catalog, rebuilt first if any upstream's tools changed.
    pub fn catalog(&self) -> Arc<Catalog> {
        let revision = self.upstreams.revision();
        {
            let current = self.catalog.read().unwrap_or_else(|p| p.into_inner());
            if current.revision == revision {
                return Arc::clone(&current);
            }
        }

        let mut slot = self.catalog.write().unwrap_or_else(|p| p.into_inner());
        if slot.revision != revision {
            let rebuilt = Catalog::build(&self.internal, self.upstreams.ready_tools(), revision);
            tracing::debug!(revision, tools = rebuilt.len(), "catalog rebuilt");
            *slot = Arc::new(rebuilt);
        }
        Arc::clone(&slot)
    }

    /// Every tool from internal providers and ready upstreams.
    pub fn list_all_tools(&self) -> Vec<ToolDefinition> {
        self.catalog().tools().cloned().collect()
    }

    pub fn resolve(&self, name: &str) -> Option<ToolDefinition> {
        self.catalog().get(name).map(|e| e.definition.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.catalog().contains(name)
    }

    /// Fuzzy search over the full catalog, best first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(u32, ToolDefinition)> {
        let catalog = self.catalog();
        search::search(catalog.tools(), query, limit)
            .into_iter()
            .map(|hit| (hit.score, hit.tool.clone()))
            .collect()
    }

    /// Dispatch a call by catalog name, publishing pre/post events.
    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> HubResult<serde_json::Value> {
        let route = self
            .catalog()
            .get(name)
            .map(|e| e.route.clone())
            .ok_or_else(|| HubError::ToolNotFound { name: name.to_string() })?;

        self.events.publish(EventType::PreToolCall {
            tool_name: name.to_string(),
            arguments: arguments.clone(),
        });
        let started = Instant::now();

        let result = match &route {
            Route::Internal => match self.internal.get(name) {
                Some(handler) => handler.invoke(arguments.clone()).await.map_err(HubError::from),
                None => Err(HubError::ToolNotFound { name: name.to_string() }),
            },
            Route::Upstream {
                upstream_id,
                tool_name,
            } => {
                self.upstreams
                    .call_tool(upstream_id, tool_name, arguments.clone())
                    .await
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let outcome = match &result {
            Ok(value) => CallOutcome::Success { result: value.clone() },
            Err(err) => CallOutcome::Failure {
                kind: err.kind().to_string(),
                error: err.to_string(),
            },
        };
        match &result {
            Ok(_) => tracing::debug!(tool = %name, duration_ms, "tool call succeeded"),
            Err(err) => tracing::warn!(tool = %name, duration_ms, error = %err, "tool call failed"),
        }
        self.events.publish(EventType::PostToolCall {
            tool_name: name.to_string(),
            arguments,
            outcome,
            duration_ms,
        });

        result
    }

    /// Status of the internal source followed by every upstream.
    pub fn statuses(&self) -> Vec<UpstreamStatus> {
        let mut statuses = vec![UpstreamStatus {
            id: INTERNAL_ORIGIN.to_string(),
            kind: UpstreamKind::Internal,
            state: ConnectionState::Ready,
            last_error: None,
            tool_count: self.internal.len(),
        }];
        statuses.extend(self.upstreams.statuses());
        statuses
    }

    pub fn internal(&self) -> &InternalToolRegistry {
        &self.internal
    }

    pub fn upstreams(&self) -> &Arc<UpstreamManager> {
        &self.upstreams
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::ToolSchema;
    use crate::tools::{ToolError, ToolHandler};
    use crate::upstream::testing::{tool, MockConnector};
    use crate::upstream::{UpstreamConfig, UpstreamTimeouts};
    use serde_json::json;
    use switchboard_core::secrets::StaticSecrets;

    fn internal_schema(name: &str) -> ToolSchema {
        ToolSchema {
            name: name.to_string(),
            description: format!("internal {}", name),
            input_schema: json!({"type": "object"}),
        }
    }

    pub(crate) async fn router_with(
        connector: Arc<MockConnector>,
        internal: InternalToolRegistry,
        upstream_ids: &[&str],
    ) -> AggregationRouter {
        let manager = Arc::new(UpstreamManager::new(
            connector,
            Arc::new(StaticSecrets::new()),
            UpstreamTimeouts::default(),
            EventBus::default(),
        ));
        for id in upstream_ids {
            manager
                .start(UpstreamConfig::local(*id, format!("{}-mcp", id), vec![]))
                .await
                .unwrap();
        }
        AggregationRouter::new(Arc::new(internal), manager)
    }

    #[tokio::test]
    async fn test_identical_names_are_namespaced_by_origin() {
        let connector = MockConnector::with_tools(&[
            ("github", vec![tool("search", "Search code")]),
            ("jira", vec![tool("search", "Search tickets")]),
        ]);
        let router = router_with(connector, InternalToolRegistry::new(), &["github", "jira"]).await;

        let names: Vec<String> = router.list_all_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["github__search", "jira__search"]);
        assert_eq!(router.resolve("jira__search").unwrap().origin_id, "jira");

        let out = router.call_tool("jira__search", json!({"q": "bug"})).await.unwrap();
        assert_eq!(out["content"][0]["text"], "jira handled search");
    }

    #[tokio::test]
    async fn test_internal_tools_come_first_and_win_collisions() {
        let connector = MockConnector::with_tools(&[("github", vec![tool("x", "upstream x")])]);
        let mut internal = InternalToolRegistry::new();
        internal.register_fn(internal_schema("github__x"), |_| async { Ok(json!("internal")) });
        internal.register_fn(internal_schema("remember"), |_| async { Ok(json!("ok")) });
        let router = router_with(connector, internal, &["github"]).await;

        let tools = router.list_all_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["github__x", "remember"]);
        assert_eq!(tools[0].origin_id, INTERNAL_ORIGIN);

        let out = router.call_tool("github__x", json!({})).await.unwrap();
        assert_eq!(out, json!("internal"));
    }

    #[tokio::test]
    async fn test_stop_removes_tools_on_next_list() {
        let connector = MockConnector::with_tools(&[("github", vec![tool("create_issue", "")])]);
        let router = router_with(connector, InternalToolRegistry::new(), &["github"]).await;
        assert!(router.contains("github__create_issue"));
        let before = router.catalog();

        router.upstreams().stop("github").await.unwrap();

        assert!(router.list_all_tools().is_empty());
        // Old snapshot is untouched
        assert!(before.contains("github__create_issue"));
        let err = router.call_tool("github__create_issue", json!({})).await.unwrap_err();
        assert!(matches!(err, HubError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let router = router_with(MockConnector::with_tools(&[]), InternalToolRegistry::new(), &[]).await;
        let err = router.call_tool("nope", json!({})).await.unwrap_err();
        assert_eq!(err, HubError::ToolNotFound { name: "nope".to_string() });
    }

    #[tokio::test]
    async fn test_call_publishes_pre_and_post_events() {
        let connector = MockConnector::with_tools(&[("github", vec![tool("create_issue", "")])]);
        let router = router_with(connector, InternalToolRegistry::new(), &["github"]).await;
        let mut rx = router.events().subscribe();

        router
            .call_tool("github__create_issue", json!({"title": "t"}))
            .await
            .unwrap();

        let pre = rx.recv().await.unwrap();
        assert_eq!(pre.event_type.name(), "pre_tool_call");
        let post = rx.recv().await.unwrap();
        match post.event_type {
            EventType::PostToolCall {
                tool_name,
                arguments,
                outcome,
                ..
            } => {
                assert_eq!(tool_name, "github__create_issue");
                assert_eq!(arguments, json!({"title": "t"}));
                assert!(outcome.is_success());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_internal_failure_is_reported_in_post_event() {
        struct Broken;

        #[async_trait::async_trait]
        impl ToolHandler for Broken {
            fn definition(&self) -> ToolSchema {
                internal_schema("broken")
            }

            async fn invoke(&self, _: serde_json::Value) -> Result<serde_json::Value, ToolError> {
                Err(ToolError::failed("disk full"))
            }
        }

        let mut internal = InternalToolRegistry::new();
        internal.register(Arc::new(Broken));
        let router = router_with(MockConnector::with_tools(&[]), internal, &[]).await;
        let mut rx = router.events().subscribe();

        let err = router.call_tool("broken", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));

        let _pre = rx.recv().await.unwrap();
        match rx.recv().await.unwrap().event_type {
            EventType::PostToolCall { outcome, .. } => assert!(!outcome.is_success()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_search_reads_full_catalog() {
        let connector = MockConnector::with_tools(&[
            ("github", vec![tool("create_issue", "Open a GitHub issue")]),
            ("slack", vec![tool("post_message", "Send a chat message")]),
        ]);
        let router = router_with(connector, InternalToolRegistry::new(), &["github", "slack"]).await;

        let hits = router.search("github", 10);
        assert_eq!(hits[0].1.name, "github__create_issue");
        assert!(hits.iter().all(|(_, t)| t.name != "slack__post_message"));
    }

    #[tokio::test]
    async fn test_statuses_lead_with_internal_source() {
        let connector = MockConnector::with_tools(&[("github", vec![tool("create_issue", "")])]);
        let mut internal = InternalToolRegistry::new();
        internal.register_fn(internal_schema("remember"), |_| async { Ok(json!(null)) });
        let router = router_with(connector, internal, &["github"]).await;

        let statuses = router.statuses();
        assert_eq!(statuses[0].id, INTERNAL_ORIGIN);
        assert_eq!(statuses[0].tool_count, 1);
        assert_eq!(statuses[1].id, "github");
    }
}
