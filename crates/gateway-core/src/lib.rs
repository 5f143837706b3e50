//! Core library for the remote MCP gateway: OAuth 2.1 authorization server,
//! JSON-RPC/SSE transport, federated consent bridging to Enable Banking, and
//! the financial tool handlers built on top of it.

pub mod categorize;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod ids;
pub mod logging;
pub mod model;
pub mod oauth;
pub mod server;
pub mod session;
pub mod sse;
pub mod store;
pub mod tools;
pub mod upstream;
