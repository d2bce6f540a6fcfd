//! Bootstrap configuration: clusters, backends and routes loaded from a
//! file and applied to the engine at startup.

use crate::backend::BackendConfig;
use crate::engine::Engine;
use crate::route::Route;
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl GatewayConfig {
    /// Load configuration from a file, dispatching on the extension:
    /// `.json` is JSON, anything else is YAML.
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read config file {path}"))?;

        let config: GatewayConfig = if path.ends_with(".json") {
            serde_json::from_str(&content)
                .with_context(|| format!("invalid JSON config in {path}"))?
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("invalid YAML config in {path}"))?
        };

        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let content = if path.ends_with(".json") {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };
        fs::write(path, content).with_context(|| format!("failed to write config file {path}"))?;
        Ok(())
    }

    /// Structural checks before anything touches the engine.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(anyhow::anyhow!("listen_addr cannot be empty"));
        }

        let mut cluster_names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                return Err(anyhow::anyhow!("cluster name cannot be empty"));
            }
            if !cluster_names.insert(&cluster.name) {
                return Err(anyhow::anyhow!("duplicate cluster name: {}", cluster.name));
            }
        }

        let mut route_keys = HashSet::new();
        for route in &self.routes {
            if !route_keys.insert((&route.method, &route.url)) {
                return Err(anyhow::anyhow!(
                    "duplicate route: {} {}",
                    route.method,
                    route.url
                ));
            }
        }

        Ok(())
    }

    /// Register every cluster, backend and route into the engine.
    pub fn apply(&self, engine: &Engine) -> crate::error::Result<()> {
        for cluster_config in &self.clusters {
            let cluster = engine.add_cluster(&cluster_config.name, &cluster_config.description)?;
            for backend in &cluster_config.backends {
                cluster.add(backend.clone())?;
            }
        }
        for route in &self.routes {
            engine.register_route(route.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
listen_addr: "127.0.0.1:8080"
clusters:
  - name: UserCluster
    description: user services
    backends:
      - schema: http
        addr: "127.0.0.1:9000"
        heartDisabled: true
        maxQPS: 100
routes:
  - name: login
    method: GET
    url: /login
    domain: main
    handlers: []
    nodeGroup:
      - attr: info
        cluster: UserCluster
        rewrite: /user/login
        paramGroup:
          - attr: token
            from: 2
            to: 2
            toName: token
            required: true
"#;

    #[test]
    fn parses_yaml_sample() {
        let config: GatewayConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].backends[0].max_qps, 100);
        assert_eq!(config.routes[0].node_group[0].rewrite, "/user/login");
        assert!(config.routes[0].node_group[0].param_group[0].required);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_duplicates() {
        let mut config: GatewayConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.clusters.push(config.clusters[0].clone());
        assert!(config.validate().is_err());

        let mut config: GatewayConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.routes.push(config.routes[0].clone());
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn apply_registers_clusters_and_routes() {
        let config: GatewayConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let engine = Engine::new();
        config.apply(&engine).unwrap();

        let cluster = engine.cluster("UserCluster").unwrap();
        assert_eq!(cluster.len(), 1);

        let route = engine.route("GET", "/login").unwrap();
        assert_eq!(route.node_group.len(), 1);
        // recovery + dispatch resolved at registration
        assert_eq!(route.chain().len(), 2);
    }
}
