// MCP (Model Context Protocol) hub: protocol, upstream connections,
// aggregation routing and the hub protocol handler

pub mod hub;
pub mod protocol;
pub mod router;
pub mod server;
pub mod tools;
pub mod upstream;

pub use hub::{HubConfig, HubHandler};
pub use router::AggregationRouter;
pub use server::McpServer;
pub use upstream::{UpstreamConfig, UpstreamManager};
