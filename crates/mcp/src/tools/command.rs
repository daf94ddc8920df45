// Shell commands exposed as internal tools

use crate::protocol::ToolSchema;
use crate::tools::{json_schema_array, json_schema_object, json_schema_string, ToolError, ToolHandler};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Output is cut to this many bytes per stream.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// A command registered as an internal tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a command to completion, feeding `stdin` if given.
///
/// The child is killed if `timeout` elapses.
pub async fn run_command(
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
    cwd: Option<&str>,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<CommandOutput, ToolError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ToolError::Failed(format!("failed to spawn '{}': {}", program, e)))?;

    let pipe = child.stdin.take();
    let feed = async move {
        if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
            // A child that never reads stdin is not an error.
            if let Err(e) = pipe.write_all(&input).await {
                tracing::debug!(command = %program, error = %e, "stdin write failed");
            }
        }
    };

    // Stdin is fed under the same deadline as the wait.
    let run = async move {
        let (_, output) = tokio::join!(feed, child.wait_with_output());
        output
    };
    let output = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| ToolError::Failed(format!("'{}' timed out after {:?}", program, timeout)))?
        .map_err(|e| ToolError::Failed(format!("'{}' failed: {}", program, e)))?;

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: lossy_truncated(&output.stdout),
        stderr: lossy_truncated(&output.stderr),
    })
}

fn lossy_truncated(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_OUTPUT_BYTES);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Internal tool wrapping one [`CommandSpec`]
pub struct CommandTool {
    spec: CommandSpec,
    timeout: Duration,
}

impl CommandTool {
    pub fn new(spec: CommandSpec, timeout: Duration) -> Self {
        Self { spec, timeout }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CommandArgs {
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    stdin: Option<String>,
}

#[async_trait::async_trait]
impl ToolHandler for CommandTool {
    fn definition(&self) -> ToolSchema {
        let description = if self.spec.description.is_empty() {
            format!("Run `{}`", self.spec.command)
        } else {
            self.spec.description.clone()
        };
        ToolSchema {
            name: self.spec.name.clone(),
            description,
            input_schema: json_schema_object(
                serde_json::json!({
                    "args": json_schema_array(json_schema_string("Argument"), "Extra arguments appended to the command"),
                    "stdin": json_schema_string("Text written to the command's stdin")
                }),
                vec![],
            ),
        }
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let call: CommandArgs = if arguments.is_null() {
            CommandArgs::default()
        } else {
            serde_json::from_value(arguments)?
        };

        let mut args = self.spec.args.clone();
        args.extend(call.args);

        tracing::debug!(tool = %self.spec.name, command = %self.spec.command, "running command tool");
        let output = run_command(
            &self.spec.command,
            &args,
            &self.spec.env,
            self.spec.cwd.as_deref(),
            call.stdin.map(String::into_bytes),
            self.timeout,
        )
        .await?;

        Ok(serde_json::to_value(output)?)
    }
}
