// Hub-level meta-tools: discovery (search_tools) and disclosure (load_tool)

use crate::protocol::{tools_list_changed, ToolSchema};
use crate::router::AggregationRouter;
use crate::tools::{json_schema_array, json_schema_integer, json_schema_object, json_schema_string};
use serde::Deserialize;
use switchboard_core::search::DEFAULT_SEARCH_LIMIT;
use switchboard_core::session::{LoadOutcome, SessionStore};
use switchboard_core::{HubError, HubResult, SessionId};

pub const SEARCH_TOOLS: &str = "search_tools";
pub const LOAD_TOOL: &str = "load_tool";
pub const RUN_CODE: &str = "run_code";
pub const RUN_AGENT: &str = "run_agent";
/// Accepted in `tools/call` as another name for `run_code`.
pub const EXECUTE_CODE: &str = "execute_code";

/// Meta-tools in the order `tools/list` shows them
pub const META_TOOLS: [&str; 4] = [SEARCH_TOOLS, LOAD_TOOL, RUN_CODE, RUN_AGENT];

pub fn is_meta_tool(name: &str) -> bool {
    META_TOOLS.contains(&name) || name == EXECUTE_CODE
}

pub fn definitions() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: SEARCH_TOOLS.to_string(),
            description: "Search every tool the hub can reach by name or description. \
                          Results are not callable until loaded with load_tool."
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "query": json_schema_string("Words to match against tool names and descriptions"),
                    "limit": json_schema_integer("Maximum number of results (default: 10, max: 50)")
                }),
                vec!["query"],
            ),
        },
        ToolSchema {
            name: LOAD_TOOL.to_string(),
            description: "Make a tool from search_tools visible and callable in this session. \
                          The oldest loaded tools are unloaded past the session limit."
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "name": json_schema_string("Exact tool name as returned by search_tools"),
                    "names": json_schema_array(json_schema_string("Tool name"), "Several tool names at once")
                }),
                vec![],
            ),
        },
        ToolSchema {
            name: RUN_CODE.to_string(),
            description: "Run a tool script: a JSON array of steps {\"tool\", \"arguments\", \"as\"} \
                          executed in order. \"$name\" in an argument refers to an earlier step's \
                          result, \"$prev\" to the previous one. Any catalog tool may be called."
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "code": {
                        "description": "Array of steps, or a string containing one",
                        "type": ["array", "string"]
                    }
                }),
                vec!["code"],
            ),
        },
        ToolSchema {
            name: RUN_AGENT.to_string(),
            description: "Run a configured CLI agent with a prompt and return its output".to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "agent": json_schema_string("Agent name (see resources/list for agent:// entries)"),
                    "prompt": json_schema_string("Task for the agent")
                }),
                vec!["agent", "prompt"],
            ),
        },
    ]
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    #[serde(default)]
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

/// Read-only: never touches the session's visible set.
pub(crate) fn search_tools(
    router: &AggregationRouter,
    sessions: &SessionStore,
    session: &SessionId,
    arguments: serde_json::Value,
) -> HubResult<serde_json::Value> {
    let args: SearchArgs = serde_json::from_value(arguments)?;
    let hits = router.search(&args.query, args.limit.unwrap_or(DEFAULT_SEARCH_LIMIT));
    let visible = sessions.visible(session)?;

    let tools: Vec<serde_json::Value> = hits
        .into_iter()
        .map(|(score, tool)| {
            serde_json::json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": tool.input_schema,
                "origin": tool.origin_id,
                "score": score,
                "loaded": visible.contains(&tool.name),
            })
        })
        .collect();

    tracing::debug!(session = %session, query = %args.query, hits = tools.len(), "search_tools");
    Ok(serde_json::json!({
        "query": args.query,
        "count": tools.len(),
        "tools": tools,
    }))
}

#[derive(Debug, Deserialize)]
struct LoadArgs {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    names: Vec<String>,
}

/// Add tools to the session's visible set, notifying the client on change.
///
/// Every name is checked against the catalog before any is loaded. Meta and
/// always-visible tools are reported as already visible and take no slot.
/// A batch larger than the free capacity evicts its own earlier names; those
/// are reported as evicted only.
pub(crate) fn load_tool(
    router: &AggregationRouter,
    sessions: &SessionStore,
    always_visible: &[String],
    session: &SessionId,
    arguments: serde_json::Value,
) -> HubResult<serde_json::Value> {
    let args: LoadArgs = serde_json::from_value(arguments)?;
    let mut names = args.names;
    if let Some(name) = args.name {
        names.insert(0, name);
    }
    if names.is_empty() {
        return Err(HubError::malformed("load_tool needs 'name' or 'names'"));
    }

    let catalog = router.catalog();
    if let Some(missing) = names.iter().find(|n| !is_meta_tool(n) && !catalog.contains(n)) {
        return Err(HubError::ToolNotFound { name: missing.clone() });
    }

    let mut loaded = Vec::new();
    let mut already_visible = Vec::new();
    let mut evicted = Vec::new();
    for name in names {
        if is_meta_tool(&name) || always_visible.contains(&name) {
            already_visible.push(name);
            continue;
        }
        match sessions.load(session, &name)? {
            LoadOutcome::AlreadyVisible => already_visible.push(name),
            LoadOutcome::Loaded { evicted: dropped } => {
                evicted.extend(dropped);
                loaded.push(name);
            }
        }
    }

    let visible = sessions.visible(session)?;
    loaded.retain(|name| visible.contains(name));
    already_visible.retain(|name| !evicted.contains(name));

    if !loaded.is_empty() || !evicted.is_empty() {
        sessions.notify(session, tools_list_changed());
        tracing::info!(session = %session, loaded = ?loaded, evicted = evicted.len(), "tools loaded");
    }

    Ok(serde_json::json!({
        "loaded": loaded,
        "already_visible": already_visible,
        "evicted": evicted,
        "visible_count": visible.len(),
    }))
}
