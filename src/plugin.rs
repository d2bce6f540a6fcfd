//! The middleware plugin contract and the built-in recovery stage.

use crate::context::Context;
use crate::error::{GatewayError, Result};
use crate::render;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use tracing::{error, warn};

/// A middleware stage in a route's execution chain.
///
/// Any component exposing identity, version and a single handle operation
/// may be registered into the engine's plugin registry and referenced by
/// name from a route's declared handler list. A stage may render a reply
/// and call [`Context::abort`] to short-circuit the chain; returning an
/// error hands control to the recovery stage.
#[async_trait]
pub trait Plugin: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Private plugins are built-ins not meant for route handler lists.
    fn private(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &mut Context) -> Result<()>;
}

/// Registry listing entry for one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub private: bool,
    pub version: String,
}

/// First stage of every chain: drives the remaining stages and converts
/// any uncaught failure (an error return or a panic) into a generic
/// failure envelope instead of terminating the serving task.
#[derive(Debug, Default)]
pub struct Recovery;

pub(crate) const RECOVERY_PLUGIN: &str = "recovery";

#[async_trait]
impl Plugin for Recovery {
    fn name(&self) -> &str {
        RECOVERY_PLUGIN
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn private(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &mut Context) -> Result<()> {
        let outcome = AssertUnwindSafe(ctx.next()).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(request_id = %ctx.request_id, error = %err, "chain stage failed");
                let failure = GatewayError::Internal(err.to_string());
                let response =
                    render::render_envelope(ctx.parts(), render::error_value(&failure), &ctx.exec_infos);
                ctx.set_response(response);
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!(request_id = %ctx.request_id, panic = %message, "chain stage panicked");
                let failure = GatewayError::Internal(message);
                let response =
                    render::render_envelope(ctx.parts(), render::error_value(&failure), &ctx.exec_infos);
                ctx.set_response(response);
            }
        }
        Ok(())
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestParts;
    use std::sync::Arc;
    use uuid::Uuid;

    #[derive(Debug)]
    struct Failing;

    #[async_trait]
    impl Plugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn version(&self) -> &str {
            "0.0"
        }

        async fn handle(&self, _ctx: &mut Context) -> Result<()> {
            Err(GatewayError::ClusterNotFound)
        }
    }

    #[derive(Debug)]
    struct Panicking;

    #[async_trait]
    impl Plugin for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn version(&self) -> &str {
            "0.0"
        }

        async fn handle(&self, _ctx: &mut Context) -> Result<()> {
            panic!("stage blew up");
        }
    }

    fn chain_context(tail: Arc<dyn Plugin>) -> Context {
        let mut route = crate::route::Route {
            name: String::new(),
            method: "GET".to_string(),
            url: "/x".to_string(),
            domain: String::new(),
            handlers: Vec::new(),
            node_group: Vec::new(),
            chain: vec![Arc::new(Recovery) as Arc<dyn Plugin>, tail],
        };
        route.compile_rules().unwrap();
        let mut ctx = Context::new();
        ctx.bind(Arc::new(RequestParts::default()), Uuid::new_v4());
        ctx.bind_route(Arc::new(route));
        ctx
    }

    async fn rendered_code(mut ctx: Context) -> i64 {
        ctx.next().await.unwrap();
        let response = ctx.take_response().expect("recovery must render");
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        value["code"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn recovery_converts_stage_error() {
        let ctx = chain_context(Arc::new(Failing));
        assert_eq!(rendered_code(ctx).await, -9099);
    }

    #[tokio::test]
    async fn recovery_converts_stage_panic() {
        let ctx = chain_context(Arc::new(Panicking));
        assert_eq!(rendered_code(ctx).await, -9099);
    }
}
