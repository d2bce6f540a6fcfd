// src/lib.rs
//! Gateflow: the dispatch core of an HTTP API gateway.
//!
//! Inbound requests are matched against an exact-match route table, driven
//! through the matched route's plugin chain, fanned out across one or more
//! health-checked backend clusters, and merged into a single reply
//! envelope.

pub mod backend;
pub mod cluster;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod node;
pub mod plugin;
pub mod proxy;
pub mod render;
pub mod route;

// Re-export the types most callers need
pub use backend::{Backend, BackendConfig, BackendStatus};
pub use cluster::{Cluster, ClusterRegistry};
pub use config::{ClusterConfig, GatewayConfig};
pub use context::{ChainState, Context, RequestParts};
pub use engine::Engine;
pub use error::{GatewayError, Result};
pub use node::{ExecInfo, Node, NodeResult, Param, ParamLocation};
pub use plugin::{Plugin, PluginInfo};
pub use route::Route;
