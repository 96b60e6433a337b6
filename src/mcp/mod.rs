//! Tool server subsystem: stdio JSON-RPC clients, the process supervisor,
//! and the capability router on top of both.

mod client;
mod registry;
mod supervisor;

pub use client::McpClient;
pub use registry::{validate_args, ToolCallError, ToolRegistry};
pub use supervisor::{ProcessSupervisor, ServerSnapshot};
