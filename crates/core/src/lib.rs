// Core types and functionality for the Switchboard MCP hub

pub mod error;
pub mod events;
pub mod library;
pub mod search;
pub mod secrets;
pub mod session;
pub mod types;

pub use error::{HubError, HubResult};
pub use types::*;
