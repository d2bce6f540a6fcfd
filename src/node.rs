//! Per-node parameter mapping and the outbound backend call.
//!
//! A node is one backend call declared as part of a route: it names the
//! target cluster, the rewrite path on the chosen backend, and how request
//! parameters map into the outbound call. Each node executes as an
//! independent branch; a failure is captured in that branch's tagged
//! result and never escalates to its siblings.

use crate::cluster::ClusterRegistry;
use crate::context::RequestParts;
use crate::engine::HttpClient;
use crate::error::{GatewayError, Result};
use bytes::Bytes;
use hyper::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use hyper::{Body, Request};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Header carrying the selected cluster name to the backend.
pub const CLUSTER_HEADER: &str = "x-gateflow-cluster";
/// Header forwarding the inbound client IP to the backend.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Where a parameter is read from or written to.
///
/// Wire values are numeric: 1 = header, 2 = query, 3 = body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ParamLocation {
    Header,
    Query,
    Body,
}

impl TryFrom<u8> for ParamLocation {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(ParamLocation::Header),
            2 => Ok(ParamLocation::Query),
            3 => Ok(ParamLocation::Body),
            other => Err(format!("unknown param location {other}")),
        }
    }
}

impl From<ParamLocation> for u8 {
    fn from(location: ParamLocation) -> u8 {
        match location {
            ParamLocation::Header => 1,
            ParamLocation::Query => 2,
            ParamLocation::Body => 3,
        }
    }
}

/// One parameter mapping from the inbound request into the outbound call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    /// Source name in the inbound request.
    pub attr: String,
    pub from: ParamLocation,
    pub to: ParamLocation,
    #[serde(rename = "toName")]
    pub to_name: String,
    #[serde(default)]
    pub required: bool,
    /// Optional validation pattern, compiled once at route registration.
    #[serde(default)]
    pub validation: String,
    #[serde(skip)]
    pub(crate) rule: Option<Regex>,
}

/// A single backend call declared as part of a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Result key in the merged reply.
    pub attr: String,
    /// Target cluster name.
    pub cluster: String,
    /// Path on the chosen backend.
    #[serde(default)]
    pub rewrite: String,
    #[serde(default, rename = "paramGroup")]
    pub param_group: Vec<Param>,
}

/// One entry of the per-request execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecInfo {
    pub addr: String,
    pub uri: String,
    pub success: bool,
    #[serde(rename = "execTimeMs")]
    pub exec_time_ms: u64,
}

/// Tagged outcome of one branch: the node's attribute name plus either the
/// raw upstream body or the branch's failure.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub attr: String,
    pub outcome: Result<Bytes>,
}

/// Outbound parameter set, keyed by destination location.
#[derive(Debug, Default)]
struct MappedParams {
    header: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Vec<(String, String)>,
}

impl Node {
    /// Read, check and map every declared parameter.
    fn map_params(&self, parts: &RequestParts) -> Result<MappedParams> {
        let mut mapped = MappedParams::default();
        for param in &self.param_group {
            let value = match param.from {
                ParamLocation::Header => parts.header(&param.attr),
                ParamLocation::Query => parts.query(&param.attr),
                ParamLocation::Body => parts.form_value(&param.attr),
            }
            .unwrap_or_default();
            if value.is_empty() && param.required {
                return Err(GatewayError::ParamRequired(param.attr.clone()));
            }
            if let Some(rule) = &param.rule {
                if !rule.is_match(value) {
                    return Err(GatewayError::ParamInvalid(param.attr.clone()));
                }
            }
            let slot = (param.to_name.clone(), value.to_string());
            match param.to {
                ParamLocation::Header => mapped.header.push(slot),
                ParamLocation::Query => mapped.query.push(slot),
                ParamLocation::Body => mapped.body.push(slot),
            }
        }
        Ok(mapped)
    }

    /// Execute this node's branch: resolve the cluster, balance to a
    /// backend, map parameters and issue the outbound call.
    ///
    /// A trace entry is recorded once a call is attempted; failures before
    /// backend selection yield a tagged error result without a trace.
    pub(crate) async fn execute(
        &self,
        method: &str,
        parts: &RequestParts,
        clusters: &ClusterRegistry,
        client: &HttpClient,
    ) -> (NodeResult, Option<ExecInfo>) {
        let fail = |err: GatewayError| {
            (
                NodeResult {
                    attr: self.attr.clone(),
                    outcome: Err(err),
                },
                None,
            )
        };

        let cluster = match clusters.get(&self.cluster) {
            Some(cluster) => cluster,
            None => return fail(GatewayError::ClusterNotFound),
        };
        let backend = match cluster.balance() {
            Ok(backend) => backend,
            Err(err) => return fail(err),
        };
        let mapped = match self.map_params(parts) {
            Ok(mapped) => mapped,
            Err(err) => return fail(err),
        };

        let query = encode_pairs(&mapped.query);
        let uri = if query.is_empty() {
            format!(
                "{}://{}{}",
                backend.config().schema,
                backend.addr(),
                self.rewrite
            )
        } else {
            format!(
                "{}://{}{}?{}",
                backend.config().schema,
                backend.addr(),
                self.rewrite,
                query
            )
        };

        let request = match build_request(method, &uri, &mapped, cluster.name(), &parts.client_ip) {
            Ok(request) => request,
            Err(err) => {
                warn!(attr = %self.attr, uri = %uri, error = %err, "failed to build outbound request");
                return fail(GatewayError::BackendServiceError);
            }
        };

        backend.begin_call();
        let started = Instant::now();
        let timeout = Duration::from_secs(backend.config().timeout);
        let outcome = tokio::time::timeout(timeout, client.request(request)).await;
        let exec_time_ms = started.elapsed().as_millis() as u64;
        backend.end_call();

        let mut exec = ExecInfo {
            addr: backend.addr().to_string(),
            uri,
            success: true,
            exec_time_ms,
        };
        let outcome = match outcome {
            Ok(Ok(response)) => match hyper::body::to_bytes(response.into_body()).await {
                Ok(body) => Ok(body),
                Err(err) => {
                    debug!(attr = %self.attr, error = %err, "failed to read backend response body");
                    exec.success = false;
                    Err(GatewayError::BackendServiceError)
                }
            },
            Ok(Err(err)) => {
                warn!(attr = %self.attr, addr = %exec.addr, error = %err, "backend call failed");
                exec.success = false;
                Err(GatewayError::BackendServiceError)
            }
            Err(_) => {
                warn!(attr = %self.attr, addr = %exec.addr, timeout_secs = backend.config().timeout, "backend call timed out");
                exec.success = false;
                Err(GatewayError::BackendServiceError)
            }
        };

        (
            NodeResult {
                attr: self.attr.clone(),
                outcome,
            },
            Some(exec),
        )
    }
}

fn build_request(
    method: &str,
    uri: &str,
    mapped: &MappedParams,
    cluster_name: &str,
    client_ip: &str,
) -> anyhow::Result<Request<Body>> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in &mapped.header {
        builder = builder.header(
            HeaderName::try_from(name.as_str())?,
            HeaderValue::from_str(value)?,
        );
    }
    // POST bodies default to the form encoding the mapped params use
    if method == "POST" {
        builder = builder.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
    }
    builder = builder.header(CLUSTER_HEADER, HeaderValue::from_str(cluster_name)?);
    if !client_ip.is_empty() {
        builder = builder.header(FORWARDED_FOR_HEADER, HeaderValue::from_str(client_ip)?);
    }
    Ok(builder.body(Body::from(encode_pairs(&mapped.body)))?)
}

/// Re-encode key/value pairs as a query or form-urlencoded string.
fn encode_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}
