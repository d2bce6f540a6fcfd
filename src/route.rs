//! The route table: method-partitioned, exact-match storage of routes.

use crate::error::{GatewayError, Result};
use crate::node::Node;
use crate::plugin::Plugin;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Upper bound on the nodes a single route may fan out to.
pub const MAX_NODES: usize = 5;

/// Supported HTTP methods; one table bucket each.
pub const METHODS: [&str; 9] = [
    "GET", "POST", "DELETE", "PUT", "PATCH", "HEAD", "OPTIONS", "CONNECT", "TRACE",
];

/// A (method, url) binding to a plugin chain and one or more nodes.
///
/// The execution chain is resolved once at registration; later changes to
/// the engine's plugin registry do not affect an already-registered route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub name: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub domain: String,
    /// Declared middleware names, resolved at registration.
    #[serde(default)]
    pub handlers: Vec<String>,
    #[serde(default, rename = "nodeGroup")]
    pub node_group: Vec<Node>,
    #[serde(skip)]
    pub(crate) chain: Vec<Arc<dyn Plugin>>,
}

impl Route {
    /// Compile every declared param validation pattern.
    pub(crate) fn compile_rules(&mut self) -> Result<()> {
        for node in &mut self.node_group {
            for param in &mut node.param_group {
                if !param.validation.is_empty() {
                    let rule = Regex::new(&param.validation).map_err(|_| {
                        GatewayError::InvalidValidation(param.validation.clone())
                    })?;
                    param.rule = Some(rule);
                }
            }
        }
        Ok(())
    }

    /// The resolved execution chain.
    pub fn chain(&self) -> &[Arc<dyn Plugin>] {
        &self.chain
    }
}

#[derive(Debug)]
struct MethodBucket {
    method: &'static str,
    routes: RwLock<Vec<Arc<Route>>>,
}

/// Exact-match route storage, partitioned per method to keep cross-method
/// contention off the hot path. Lookup is a linear scan within the bucket.
#[derive(Debug)]
pub struct RouteTable {
    buckets: Vec<MethodBucket>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            buckets: METHODS
                .iter()
                .map(|method| MethodBucket {
                    method,
                    routes: RwLock::new(Vec::new()),
                })
                .collect(),
        }
    }

    fn bucket(&self, method: &str) -> Result<&MethodBucket> {
        self.buckets
            .iter()
            .find(|bucket| bucket.method == method)
            .ok_or_else(|| GatewayError::UnknownMethod(method.to_string()))
    }

    /// Append a route; fails when its (method, url) pair is taken.
    pub fn add(&self, route: Arc<Route>) -> Result<()> {
        let bucket = self.bucket(&route.method)?;
        let mut routes = bucket.routes.write();
        if routes.iter().any(|existing| existing.url == route.url) {
            return Err(GatewayError::RouteAlreadyExists);
        }
        routes.push(route);
        Ok(())
    }

    pub fn remove(&self, method: &str, url: &str) -> Result<()> {
        let bucket = self.bucket(method)?;
        let mut routes = bucket.routes.write();
        let index = routes
            .iter()
            .position(|route| route.url == url)
            .ok_or(GatewayError::ApiNotFound)?;
        routes.remove(index);
        Ok(())
    }

    /// Upsert: replace in place when present, append when absent.
    pub fn update(&self, method: &str, url: &str, route: Arc<Route>) -> Result<()> {
        let bucket = self.bucket(method)?;
        let mut routes = bucket.routes.write();
        match routes.iter().position(|existing| existing.url == url) {
            Some(index) => routes[index] = route,
            None => routes.push(route),
        }
        Ok(())
    }

    /// Exact-match lookup; `None` covers unknown methods as well.
    pub fn get(&self, method: &str, url: &str) -> Option<Arc<Route>> {
        let bucket = self.bucket(method).ok()?;
        let routes = bucket.routes.read();
        routes.iter().find(|route| route.url == url).cloned()
    }

    /// All registered routes, across every method bucket.
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.routes.read().clone())
            .collect()
    }
}
