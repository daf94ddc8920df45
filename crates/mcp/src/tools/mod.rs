pub mod command;
pub mod memory;
mod registry;

pub use command::{run_command, CommandOutput, CommandSpec, CommandTool};
pub use memory::{register_memory_tools, MemoryStore};
pub use registry::{
    json_schema_array, json_schema_integer, json_schema_object, json_schema_string, InternalToolRegistry,
    ToolError, ToolHandler,
};
