//! Agent orchestration shell
//!
//! Core pieces:
//! - `deploy`: the deployment server — package install, port
//!   allocation, process supervision, and its REST control plane
//! - `mcp`: JSON-RPC sessions to external tool providers and the
//!   aggregated tool registry
//! - `plugins`: compiled-in agent kinds behind a shared trait
//! - `config`: server configuration and agent definition files

pub mod config;
pub mod deploy;
pub mod mcp;
pub mod plugins;
