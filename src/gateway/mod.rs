//! The front end: one MCP server over the merged namespace, plus the task
//! that keeps it in line with the configuration file.

pub mod hot_reload;
pub mod server;
