//! Tool scripts for `run_code`.
//!
//! A script is a JSON array of steps run in order through the router, so
//! it reaches the full catalog regardless of session visibility:
//!
//! ```json
//! [
//!   {"tool": "github__search_issues", "arguments": {"q": "crash"}, "as": "issues"},
//!   {"tool": "remember", "arguments": {"content": "$issues"}}
//! ]
//! ```

use super::meta::is_meta_tool;
use crate::router::AggregationRouter;
use serde::Deserialize;
use switchboard_core::{HubError, HubResult};

pub const MAX_SCRIPT_STEPS: usize = 32;

const PREV: &str = "prev";

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptStep {
    pub tool: String,
    #[serde(default = "empty_object")]
    pub arguments: serde_json::Value,
    #[serde(default, rename = "as")]
    pub alias: Option<String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Deserialize)]
struct RunCodeArgs {
    code: serde_json::Value,
}

/// Accepts the step array itself or a string holding it.
pub fn parse_script(code: serde_json::Value) -> HubResult<Vec<ScriptStep>> {
    let steps: Vec<ScriptStep> = match code {
        serde_json::Value::String(source) => serde_json::from_str(&source)?,
        value @ serde_json::Value::Array(_) => serde_json::from_value(value)?,
        _ => return Err(HubError::malformed("'code' must be an array of steps or a JSON string")),
    };

    if steps.is_empty() {
        return Err(HubError::malformed("script has no steps"));
    }
    if steps.len() > MAX_SCRIPT_STEPS {
        return Err(HubError::malformed(format!(
            "script has {} steps, limit is {}",
            steps.len(),
            MAX_SCRIPT_STEPS
        )));
    }
    if let Some((n, step)) = steps.iter().enumerate().find(|(_, s)| is_meta_tool(&s.tool)) {
        return Err(HubError::malformed(format!(
            "step {}: '{}' cannot be called from a script",
            n + 1,
            step.tool
        )));
    }
    Ok(steps)
}

pub(crate) async fn run_code(router: &AggregationRouter, arguments: serde_json::Value) -> HubResult<serde_json::Value> {
    let args: RunCodeArgs = serde_json::from_value(arguments)?;
    let steps = parse_script(args.code)?;
    run_script(router, steps).await
}

/// Run steps sequentially, stopping at the first failure.
pub async fn run_script(router: &AggregationRouter, steps: Vec<ScriptStep>) -> HubResult<serde_json::Value> {
    let mut results = serde_json::Map::new();
    let mut prev = serde_json::Value::Null;

    for (index, step) in steps.into_iter().enumerate() {
        let n = index + 1;
        let arguments = substitute(step.arguments, &results, &prev).map_err(|e| at_step(e, n))?;

        tracing::debug!(step = n, tool = %step.tool, "script step");
        let value = router
            .call_tool(&step.tool, arguments)
            .await
            .map_err(|e| at_step(e, n))?;

        let key = step.alias.unwrap_or_else(|| format!("step{}", n));
        results.insert(key, value.clone());
        prev = value;
    }

    Ok(serde_json::json!({
        "results": results,
        "last": prev,
    }))
}

/// Replace `"$key"` strings with earlier results. `"$$x"` is the literal `"$x"`.
fn substitute(
    value: serde_json::Value,
    results: &serde_json::Map<String, serde_json::Value>,
    prev: &serde_json::Value,
) -> HubResult<serde_json::Value> {
    use serde_json::Value;

    Ok(match value {
        Value::String(s) => match s.strip_prefix('$') {
            Some(escaped) if escaped.starts_with('$') => Value::String(escaped.to_string()),
            Some(PREV) => prev.clone(),
            Some(key) if !key.is_empty() => results
                .get(key)
                .cloned()
                .ok_or_else(|| HubError::malformed(format!("unknown reference '${}'", key)))?,
            _ => Value::String(s),
        },
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute(v, results, prev))
                .collect::<HubResult<_>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| substitute(v, results, prev).map(|v| (k, v)))
                .collect::<HubResult<_>>()?,
        ),
        other => other,
    })
}

fn at_step(err: HubError, n: usize) -> HubError {
    match err {
        HubError::Upstream { origin, message } => HubError::Upstream {
            origin,
            message: format!("step {}: {}", n, message),
        },
        HubError::MalformedRequest(message) => HubError::MalformedRequest(format!("step {}: {}", n, message)),
        HubError::Internal(message) => HubError::Internal(format!("step {}: {}", n, message)),
        other => other,
    }
}
