//! Pooled per-request context and the chain-execution cursor.

use crate::error::Result;
use crate::node::{ExecInfo, NodeResult};
use crate::plugin::Plugin;
use crate::route::Route;
use hyper::{Body, HeaderMap, Request, Response};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Upper bound on idle contexts kept for reuse.
const MAX_POOLED_CONTEXTS: usize = 1024;

/// Immutable snapshot of the inbound request, taken once at dispatch.
///
/// Fan-out branches share this snapshot through an `Arc` instead of the
/// mutable context; results flow back through the completion barrier.
#[derive(Debug, Default)]
pub struct RequestParts {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    /// Parsed form-urlencoded body pairs; empty for other content types.
    pub form: Vec<(String, String)>,
    pub client_ip: String,
}

impl RequestParts {
    /// Consume an inbound request into a snapshot, aggregating the body
    /// when it carries form parameters.
    pub async fn from_request(req: Request<Body>) -> Self {
        let (head, body) = req.into_parts();
        let method = head.method.as_str().to_string();
        let path = head.uri.path().to_string();
        let query = head.uri.query().map(parse_pairs).unwrap_or_default();
        let headers = head.headers;
        let client_ip = client_ip(&headers);
        let form = if is_form_content(&headers) {
            match hyper::body::to_bytes(body).await {
                Ok(bytes) => parse_pairs(&String::from_utf8_lossy(&bytes)),
                Err(err) => {
                    debug!(error = %err, "failed to read request body");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        Self {
            method,
            path,
            headers,
            query,
            form,
            client_ip,
        }
    }

    /// First query value for `key`, if present.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// First form-body value for `key`, if present.
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Decode `k=v&k2=v2` pairs from a query string or form body.
pub(crate) fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for piece in raw.split('&') {
        if piece.is_empty() {
            continue;
        }
        let (key, value) = match piece.find('=') {
            Some(index) => (&piece[..index], &piece[index + 1..]),
            None => (piece, ""),
        };
        pairs.push((
            urlencoding::decode(key).unwrap_or_default().into_owned(),
            urlencoding::decode(value).unwrap_or_default().into_owned(),
        ));
    }
    pairs
}

/// Client IP from `X-Real-Ip`, falling back to the first
/// `X-Forwarded-For` element.
fn client_ip(headers: &HeaderMap) -> String {
    if let Some(ip) = headers.get("x-real-ip").and_then(|value| value.to_str().ok()) {
        let ip = ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .unwrap_or_default()
}

fn is_form_content(headers: &HeaderMap) -> bool {
    headers
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Chain progress: a stage may abort, which stops the dispatch loop before
/// any later stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Running,
    Aborted,
}

/// Per-request transient state, reused through [`ContextPool`].
///
/// Never shared between concurrently in-flight requests.
#[derive(Debug)]
pub struct Context {
    parts: Arc<RequestParts>,
    pub request_id: Uuid,
    route: Option<Arc<Route>>,
    chain: Vec<Arc<dyn Plugin>>,
    cursor: usize,
    state: ChainState,
    keys: HashMap<String, Value>,
    /// Per-node execution traces, surfaced under `exec` with `debug=true`.
    pub exec_infos: Vec<ExecInfo>,
    /// Tagged per-node results collected by the dispatch stage.
    pub results: Vec<NodeResult>,
    response: Option<Response<Body>>,
}

impl Context {
    pub(crate) fn new() -> Self {
        Self {
            parts: Arc::new(RequestParts::default()),
            request_id: Uuid::nil(),
            route: None,
            chain: Vec::new(),
            cursor: 0,
            state: ChainState::Running,
            keys: HashMap::new(),
            exec_infos: Vec::new(),
            results: Vec::new(),
            response: None,
        }
    }

    /// Bind a fresh request snapshot.
    pub(crate) fn bind(&mut self, parts: Arc<RequestParts>, request_id: Uuid) {
        self.parts = parts;
        self.request_id = request_id;
    }

    /// Bind the matched route and its resolved chain, cursor before the
    /// first stage.
    pub(crate) fn bind_route(&mut self, route: Arc<Route>) {
        self.chain = route.chain().to_vec();
        self.route = Some(route);
        self.cursor = 0;
        self.state = ChainState::Running;
    }

    pub fn parts(&self) -> &RequestParts {
        &self.parts
    }

    pub fn parts_arc(&self) -> Arc<RequestParts> {
        self.parts.clone()
    }

    pub fn route(&self) -> Option<&Arc<Route>> {
        self.route.as_ref()
    }

    /// Advance the chain, invoking each remaining stage in order.
    pub async fn next(&mut self) -> Result<()> {
        while self.state == ChainState::Running && self.cursor < self.chain.len() {
            let stage = self.chain[self.cursor].clone();
            self.cursor += 1;
            stage.handle(self).await?;
        }
        Ok(())
    }

    /// Stop the chain; no later stage will run.
    pub fn abort(&mut self) {
        self.state = ChainState::Aborted;
    }

    pub fn is_aborted(&self) -> bool {
        self.state == ChainState::Aborted
    }

    /// Store a scratch value for later stages.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.keys.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.keys.get(key)
    }

    pub(crate) fn push_branch(&mut self, result: NodeResult, exec: Option<ExecInfo>) {
        if let Some(exec) = exec {
            self.exec_infos.push(exec);
        }
        self.results.push(result);
    }

    /// Install the reply; the first render wins.
    pub fn set_response(&mut self, response: Response<Body>) {
        if self.response.is_none() {
            self.response = Some(response);
        }
    }

    pub(crate) fn take_response(&mut self) -> Option<Response<Body>> {
        self.response.take()
    }

    fn reset(&mut self) {
        self.parts = Arc::new(RequestParts::default());
        self.request_id = Uuid::nil();
        self.route = None;
        self.chain.clear();
        self.cursor = 0;
        self.state = ChainState::Running;
        self.keys.clear();
        self.exec_infos.clear();
        self.results.clear();
        self.response = None;
    }
}

/// Explicit free list of contexts.
///
/// Contexts are reset on release, so an acquired context never carries
/// state from an earlier request.
#[derive(Debug, Default)]
pub struct ContextPool {
    free: Mutex<Vec<Box<Context>>>,
}

impl ContextPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> Box<Context> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(Context::new()))
    }

    pub fn release(&self, mut context: Box<Context>) {
        context.reset();
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED_CONTEXTS {
            free.push(context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pairs_decodes_values() {
        let pairs = parse_pairs("a=1&b=hello%20world&empty=&flag");
        assert_eq!(pairs, vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "hello world".to_string()),
            ("empty".to_string(), String::new()),
            ("flag".to_string(), String::new()),
        ]);
    }

    #[test]
    fn client_ip_prefers_real_ip_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.1.1.1, 2.2.2.2".parse().unwrap());
        assert_eq!(client_ip(&headers), "1.1.1.1");

        headers.insert("x-real-ip", "9.9.9.9".parse().unwrap());
        assert_eq!(client_ip(&headers), "9.9.9.9");
    }

    #[tokio::test]
    async fn form_body_parsed_for_form_content_type() {
        let req = Request::builder()
            .method("POST")
            .uri("http://gw/login?debug=true")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("user=alice&device=ios"))
            .unwrap();
        let parts = RequestParts::from_request(req).await;
        assert_eq!(parts.method, "POST");
        assert_eq!(parts.path, "/login");
        assert_eq!(parts.query("debug"), Some("true"));
        assert_eq!(parts.form_value("user"), Some("alice"));
        assert_eq!(parts.form_value("device"), Some("ios"));
    }

    #[tokio::test]
    async fn non_form_body_is_not_parsed() {
        let req = Request::builder()
            .method("POST")
            .uri("http://gw/login")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"user":"alice"}"#))
            .unwrap();
        let parts = RequestParts::from_request(req).await;
        assert!(parts.form.is_empty());
    }

    #[test]
    fn abort_flips_chain_state() {
        let mut ctx = Context::new();
        assert!(!ctx.is_aborted());
        ctx.abort();
        assert!(ctx.is_aborted());
    }

    #[test]
    fn pool_resets_released_contexts() {
        let pool = ContextPool::new();
        let mut ctx = pool.acquire();
        ctx.set("user", Value::from("alice"));
        ctx.abort();
        ctx.results.push(crate::node::NodeResult {
            attr: "info".to_string(),
            outcome: Err(crate::error::GatewayError::ClusterNotFound),
        });
        pool.release(ctx);

        let reused = pool.acquire();
        assert!(reused.get("user").is_none());
        assert!(!reused.is_aborted());
        assert!(reused.results.is_empty());
        assert!(reused.route().is_none());
    }
}
