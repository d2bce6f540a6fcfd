//! The built-in dispatch stage: executes a route's nodes and renders the
//! merged reply. Terminal stage of every chain.

use crate::cluster::ClusterRegistry;
use crate::context::Context;
use crate::engine::HttpClient;
use crate::error::{GatewayError, Result};
use crate::node::NodeResult;
use crate::plugin::Plugin;
use crate::render;
use async_trait::async_trait;
use futures_util::future::join_all;
use hyper::header::{HeaderValue, SERVER};
use metrics::counter;
use std::sync::Arc;
use tracing::error;

pub(crate) const DISPATCH_PLUGIN: &str = "proxy";

/// Server identification attached to dispatched replies.
const SERVER_TOKEN: &str = concat!("gateflow/", env!("CARGO_PKG_VERSION"));

/// Node executor behavior is keyed on the route's node count. A single
/// node executes inline on the calling task; several nodes fan out one
/// task each and join on a completion barrier. Branches never cancel each
/// other, and a failure is captured in that branch's tagged result only.
#[derive(Debug)]
pub struct ProxyDispatch {
    clusters: Arc<ClusterRegistry>,
    client: HttpClient,
}

impl ProxyDispatch {
    pub(crate) fn new(clusters: Arc<ClusterRegistry>, client: HttpClient) -> Self {
        Self { clusters, client }
    }
}

#[async_trait]
impl Plugin for ProxyDispatch {
    fn name(&self) -> &str {
        DISPATCH_PLUGIN
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn private(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &mut Context) -> Result<()> {
        let route = ctx
            .route()
            .cloned()
            .ok_or_else(|| GatewayError::Internal("dispatch stage without a route".to_string()))?;

        match route.node_group.len() {
            0 => {
                // merge_results on an empty collection renders the
                // service-error envelope
            }
            1 => {
                let (result, exec) = route.node_group[0]
                    .execute(&route.method, ctx.parts(), &self.clusters, &self.client)
                    .await;
                if result.outcome.is_err() {
                    counter!("gateflow_branch_failures_total", 1);
                }
                ctx.push_branch(result, exec);
            }
            fanout => {
                let mut branches = Vec::with_capacity(fanout);
                for index in 0..fanout {
                    let route = route.clone();
                    let clusters = self.clusters.clone();
                    let client = self.client.clone();
                    let parts = ctx.parts_arc();
                    branches.push(tokio::spawn(async move {
                        route.node_group[index]
                            .execute(&route.method, &parts, &clusters, &client)
                            .await
                    }));
                }
                // completion barrier: every branch finishes, successfully
                // or not, before rendering
                for (index, joined) in join_all(branches).await.into_iter().enumerate() {
                    match joined {
                        Ok((result, exec)) => {
                            if result.outcome.is_err() {
                                counter!("gateflow_branch_failures_total", 1);
                            }
                            ctx.push_branch(result, exec);
                        }
                        Err(join_err) => {
                            error!(attr = %route.node_group[index].attr, error = %join_err, "branch task failed");
                            counter!("gateflow_branch_failures_total", 1);
                            ctx.push_branch(
                                NodeResult {
                                    attr: route.node_group[index].attr.clone(),
                                    outcome: Err(GatewayError::Internal(
                                        "branch task failed".to_string(),
                                    )),
                                },
                                None,
                            );
                        }
                    }
                }
            }
        }

        let payload = render::merge_results(&ctx.results);
        let mut response = render::render_envelope(ctx.parts(), payload, &ctx.exec_infos);
        response
            .headers_mut()
            .insert(SERVER, HeaderValue::from_static(SERVER_TOKEN));
        ctx.set_response(response);
        Ok(())
    }
}
