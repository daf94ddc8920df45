// run_agent: launch a library agent's CLI with a prompt

use crate::protocol::{CallToolResult, ToolContent};
use crate::tools::run_command;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use switchboard_core::library::{Library, AGENT_SCHEME};
use switchboard_core::{HubError, HubResult};

/// Environment variable carrying the agent's instructions to its process.
pub const INSTRUCTIONS_ENV: &str = "SWITCHBOARD_AGENT_INSTRUCTIONS";

#[derive(Debug, Deserialize)]
struct RunAgentArgs {
    agent: String,
    prompt: String,
}

/// Run the agent's command with the prompt as its final argument.
///
/// A non-zero exit is a tool-level error (`isError`), not a protocol error.
pub(crate) async fn run_agent(
    library: &Library,
    arguments: serde_json::Value,
    timeout: Duration,
) -> HubResult<serde_json::Value> {
    let args: RunAgentArgs = serde_json::from_value(arguments)?;

    let agent = library.agent(&args.agent).ok_or_else(|| HubError::ResourceNotFound {
        uri: format!("{}://{}", AGENT_SCHEME, args.agent),
    })?;
    let command = agent
        .command
        .as_deref()
        .ok_or_else(|| HubError::malformed(format!("agent '{}' has no command to run", agent.name)))?;

    let mut argv = agent.args.clone();
    argv.push(args.prompt);

    let mut env = HashMap::new();
    if !agent.instructions.is_empty() {
        env.insert(INSTRUCTIONS_ENV.to_string(), agent.instructions.clone());
    }

    tracing::info!(agent = %agent.name, command = %command, "running agent");
    let output = run_command(command, &argv, &env, None, None, timeout)
        .await
        .map_err(|e| HubError::upstream(format!("{}://{}", AGENT_SCHEME, agent.name), e))?;

    let mut content = vec![ToolContent::text(output.stdout.clone())];
    if !output.success() && !output.stderr.is_empty() {
        content.push(ToolContent::text(output.stderr.clone()));
    }
    let result = CallToolResult {
        content,
        is_error: (!output.success()).then_some(true),
    };
    Ok(result.into_value())
}
