//! The engine: plugin registry, route table, cluster registry, context
//! pool and the per-request dispatch loop.

use crate::cluster::{Cluster, ClusterRegistry};
use crate::context::{Context, ContextPool, RequestParts};
use crate::error::{GatewayError, Result};
use crate::plugin::{Plugin, PluginInfo, Recovery};
use crate::proxy::ProxyDispatch;
use crate::render;
use crate::route::{Route, RouteTable, MAX_NODES};
use hyper::client::HttpConnector;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, Server};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use metrics::{counter, histogram};
use parking_lot::RwLock;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared outbound HTTP client; connection pooling lives in hyper, the
/// per-backend timeout is applied per call.
pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

fn build_client() -> HttpClient {
    let https = HttpsConnectorBuilder::new()
        .with_native_roots()
        .https_or_http()
        .enable_http1()
        .build();

    Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(100)
        .build(https)
}

/// The gateway engine.
///
/// Owns every shared structure of the dispatch core. Routes resolve their
/// plugin chains against the registry once, at registration time.
pub struct Engine {
    clusters: Arc<ClusterRegistry>,
    route_table: RouteTable,
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    recovery: Arc<dyn Plugin>,
    dispatcher: Arc<dyn Plugin>,
    pool: ContextPool,
    shutdown: broadcast::Sender<()>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        let clusters = Arc::new(ClusterRegistry::new());
        let recovery: Arc<dyn Plugin> = Arc::new(Recovery);
        let dispatcher: Arc<dyn Plugin> =
            Arc::new(ProxyDispatch::new(clusters.clone(), build_client()));
        let (shutdown, _) = broadcast::channel(16);
        Self {
            clusters,
            route_table: RouteTable::new(),
            plugins: RwLock::new(vec![recovery.clone(), dispatcher.clone()]),
            recovery,
            dispatcher,
            pool: ContextPool::new(),
            shutdown,
        }
    }

    // ---- plugin registry ----

    /// Register a plugin under its name; names are unique.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let mut plugins = self.plugins.write();
        if plugins.iter().any(|existing| existing.name() == plugin.name()) {
            return Err(GatewayError::PluginAlreadyExists);
        }
        plugins.push(plugin);
        Ok(())
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .iter()
            .find(|plugin| plugin.name() == name)
            .cloned()
    }

    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.plugins
            .read()
            .iter()
            .map(|plugin| PluginInfo {
                name: plugin.name().to_string(),
                private: plugin.private(),
                version: plugin.version().to_string(),
            })
            .collect()
    }

    // ---- cluster registry ----

    pub fn add_cluster(&self, name: &str, description: &str) -> Result<Arc<Cluster>> {
        self.clusters.add(name, description)
    }

    pub fn remove_cluster(&self, name: &str) -> Result<()> {
        self.clusters.remove(name)
    }

    pub fn update_cluster(&self, name: &str, description: &str) -> Result<Arc<Cluster>> {
        self.clusters.update(name, description)
    }

    pub fn cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.get(name)
    }

    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        self.clusters.clusters()
    }

    // ---- routes ----

    /// Register a route, resolving its declared handler names into the
    /// execution chain.
    pub fn register_route(&self, route: Route) -> Result<()> {
        let route = self.prepare_route(route)?;
        self.route_table.add(Arc::new(route))
    }

    /// Upsert a route under (method, url).
    pub fn update_route(&self, method: &str, url: &str, route: Route) -> Result<()> {
        let route = self.prepare_route(route)?;
        self.route_table.update(method, url, Arc::new(route))
    }

    pub fn remove_route(&self, method: &str, url: &str) -> Result<()> {
        self.route_table.remove(method, url)
    }

    pub fn route(&self, method: &str, url: &str) -> Option<Arc<Route>> {
        self.route_table.get(method, url)
    }

    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.route_table.routes()
    }

    fn prepare_route(&self, mut route: Route) -> Result<Route> {
        if route.method.is_empty() || route.url.is_empty() {
            return Err(GatewayError::UrlNotValid);
        }
        if route.node_group.len() > MAX_NODES {
            return Err(GatewayError::TooManyNodes);
        }
        route.compile_rules()?;
        route.chain = self.resolve_chain(&route.handlers);
        Ok(route)
    }

    /// The chain is recovery, then the declared handlers in listed order,
    /// then the dispatch stage. An unresolvable name is skipped rather
    /// than treated as an error.
    fn resolve_chain(&self, handlers: &[String]) -> Vec<Arc<dyn Plugin>> {
        let mut chain: Vec<Arc<dyn Plugin>> = Vec::with_capacity(handlers.len() + 2);
        chain.push(self.recovery.clone());
        for name in handlers {
            match self.plugin(name) {
                Some(plugin) => chain.push(plugin),
                None => warn!(plugin = %name, "unknown plugin in handler list, skipping"),
            }
        }
        chain.push(self.dispatcher.clone());
        chain
    }

    // ---- dispatch ----

    /// Serve one inbound request through the routing table and the
    /// matched route's chain.
    pub async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        counter!("gateflow_requests_total", 1);
        let started = Instant::now();
        let parts = Arc::new(RequestParts::from_request(req).await);
        let request_id = Uuid::new_v4();

        let mut ctx = self.pool.acquire();
        ctx.bind(parts.clone(), request_id);

        let response = match self.route_table.get(&parts.method, &parts.path) {
            Some(route) => {
                debug!(%request_id, method = %parts.method, path = %parts.path, route = %route.name, "dispatching");
                ctx.bind_route(route);
                if let Err(err) = ctx.next().await {
                    // recovery heads every chain, so an error surfacing
                    // here means the chain was driven without it
                    error!(%request_id, error = %err, "chain failed outside recovery");
                }
                match ctx.take_response() {
                    Some(response) => response,
                    None => {
                        render::render_envelope(&parts, render::merge_results(&ctx.results), &ctx.exec_infos)
                    }
                }
            }
            None => {
                counter!("gateflow_route_misses_total", 1);
                debug!(%request_id, method = %parts.method, path = %parts.path, "no route matched");
                render::render_envelope(&parts, render::error_value(&GatewayError::ApiNotFound), &[])
            }
        };

        histogram!(
            "gateflow_request_duration_ms",
            started.elapsed().as_secs_f64() * 1000.0
        );
        self.pool.release(ctx);
        response
    }

    // ---- server ----

    /// Serve inbound HTTP on `addr` until [`Engine::shutdown`] is called.
    pub async fn run(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid listen address '{addr}': {err}"))?;

        let engine = self.clone();
        let make_service = make_service_fn(move |_conn| {
            let engine = engine.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let engine = engine.clone();
                    async move { Ok::<_, Infallible>(engine.dispatch(req).await) }
                }))
            }
        });

        let mut shutdown = self.shutdown.subscribe();
        let server = Server::try_bind(&addr)?
            .serve(make_service)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("gateway received shutdown signal");
            });

        info!(%addr, "gateway listening");
        server
            .await
            .map_err(|err| anyhow::anyhow!("gateway server error: {err}"))
    }

    /// Signal the serving loop to drain and stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}
