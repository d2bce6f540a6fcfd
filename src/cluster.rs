//! Clusters of interchangeable backends and the load-balancing policy.

use crate::backend::{Backend, BackendConfig};
use crate::error::{GatewayError, Result};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A named, mutable collection of backends.
///
/// Membership changes run under the cluster's write lock; `balance` works
/// on a snapshot taken under the read lock so a concurrent add/remove can
/// never shift the list mid-sort.
#[derive(Debug)]
pub struct Cluster {
    name: String,
    description: RwLock<String>,
    backends: RwLock<Vec<Arc<Backend>>>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: RwLock::new(description.into()),
            backends: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> String {
        self.description.read().clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        *self.description.write() = description.into();
    }

    /// Snapshot of the current membership.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }

    /// Add a backend, starting its prober unless heartbeats are disabled.
    pub fn add(&self, config: BackendConfig) -> Result<Arc<Backend>> {
        config.validate()?;
        let mut backends = self.backends.write();
        if backends.iter().any(|b| b.addr() == config.addr) {
            return Err(GatewayError::BackendAlreadyExists);
        }
        let backend = Self::start(config);
        backends.push(backend.clone());
        Ok(backend)
    }

    /// Remove a backend by address, stopping its prober.
    pub fn remove(&self, addr: &str) -> Result<()> {
        let mut backends = self.backends.write();
        let index = backends
            .iter()
            .position(|b| b.addr() == addr)
            .ok_or(GatewayError::BackendNotFound)?;
        let backend = backends.remove(index);
        backend.stop_prober();
        debug!(cluster = %self.name, addr, "backend removed");
        Ok(())
    }

    /// Replace a backend by address; an unknown address is an implicit add.
    ///
    /// A replacement always stops the old prober before starting the new
    /// one, even when the address is unchanged.
    pub fn update(&self, config: BackendConfig) -> Result<Arc<Backend>> {
        config.validate()?;
        let mut backends = self.backends.write();
        match backends.iter().position(|b| b.addr() == config.addr) {
            Some(index) => {
                backends[index].stop_prober();
                let backend = Self::start(config);
                backends[index] = backend.clone();
                Ok(backend)
            }
            None => {
                let backend = Self::start(config);
                backends.push(backend.clone());
                Ok(backend)
            }
        }
    }

    fn start(config: BackendConfig) -> Arc<Backend> {
        let heart_disabled = config.heart_disabled;
        let backend = Arc::new(Backend::new(config));
        if !heart_disabled {
            backend.spawn_prober();
        }
        backend
    }

    /// Select one backend for an outbound call.
    ///
    /// Sorts a snapshot by the composite key (any Up backend ahead of any
    /// Down backend, lower `waiting / maxQPS` first among equal health)
    /// and returns the first Up backend.
    pub fn balance(&self) -> Result<Arc<Backend>> {
        let mut snapshot = self.backends.read().clone();
        if snapshot.is_empty() {
            return Err(GatewayError::NoBackendAvailable);
        }
        snapshot.sort_by(|a, b| {
            let down_order = (!a.is_up()).cmp(&!b.is_up());
            down_order.then_with(|| {
                a.normalized_load()
                    .partial_cmp(&b.normalized_load())
                    .unwrap_or(Ordering::Equal)
            })
        });
        snapshot
            .into_iter()
            .find(|backend| backend.is_up())
            .ok_or(GatewayError::NoBackendAvailable)
    }
}

/// Name-keyed collection of clusters behind one registry-wide lock.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    clusters: RwLock<HashMap<String, Arc<Cluster>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, description: &str) -> Result<Arc<Cluster>> {
        if name.is_empty() {
            return Err(GatewayError::ClusterNameEmpty);
        }
        let mut clusters = self.clusters.write();
        if clusters.contains_key(name) {
            return Err(GatewayError::ClusterAlreadyExists);
        }
        let cluster = Arc::new(Cluster::new(name, description));
        clusters.insert(name.to_string(), cluster.clone());
        Ok(cluster)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.clusters
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or(GatewayError::ClusterNotFound)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.read().get(name).cloned()
    }

    /// Upsert cluster metadata. An existing cluster only has its
    /// description copied; its live backends are untouched.
    pub fn update(&self, name: &str, description: &str) -> Result<Arc<Cluster>> {
        if name.is_empty() {
            return Err(GatewayError::ClusterNameEmpty);
        }
        let mut clusters = self.clusters.write();
        if let Some(cluster) = clusters.get(name) {
            cluster.set_description(description);
            return Ok(cluster.clone());
        }
        let cluster = Arc::new(Cluster::new(name, description));
        clusters.insert(name.to_string(), cluster.clone());
        Ok(cluster)
    }

    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        self.clusters.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendStatus;
    use std::time::Duration;

    fn quiet_backend(addr: &str) -> BackendConfig {
        BackendConfig {
            schema: "http".to_string(),
            addr: addr.to_string(),
            heart_disabled: true,
            heart_path: String::new(),
            heart_response_body: String::new(),
            heart_duration: 0,
            timeout: 0,
            max_qps: 100,
        }
    }

    fn probed_backend(addr: &str) -> BackendConfig {
        BackendConfig {
            heart_disabled: false,
            heart_path: "/ping".to_string(),
            heart_duration: 1,
            ..quiet_backend(addr)
        }
    }

    #[test]
    fn add_rejects_duplicate_addr() {
        let cluster = Cluster::new("users", "");
        cluster.add(quiet_backend("a:1")).unwrap();
        assert_eq!(
            cluster.add(quiet_backend("a:1")),
            Err(GatewayError::BackendAlreadyExists)
        );
    }

    #[test]
    fn remove_unknown_addr_fails() {
        let cluster = Cluster::new("users", "");
        assert_eq!(cluster.remove("a:1"), Err(GatewayError::BackendNotFound));
    }

    #[test]
    fn update_unknown_addr_is_implicit_add() {
        let cluster = Cluster::new("users", "");
        cluster.update(quiet_backend("a:1")).unwrap();
        assert_eq!(cluster.len(), 1);
    }

    #[test]
    fn update_is_idempotent() {
        let cluster = Cluster::new("users", "");
        cluster.update(quiet_backend("a:1")).unwrap();
        cluster.update(quiet_backend("a:1")).unwrap();
        assert_eq!(cluster.len(), 1);
        assert_eq!(cluster.backends()[0].addr(), "a:1");
        assert_eq!(cluster.backends()[0].status(), BackendStatus::Up);
    }

    #[test]
    fn balance_empty_cluster_fails() {
        let cluster = Cluster::new("users", "");
        assert_eq!(
            cluster.balance().map(|_| ()),
            Err(GatewayError::NoBackendAvailable)
        );
    }

    #[test]
    fn balance_all_down_fails() {
        let cluster = Cluster::new("users", "");
        let backend = cluster.add(quiet_backend("a:1")).unwrap();
        for _ in 0..3 {
            backend.observe_failure();
        }
        assert_eq!(
            cluster.balance().map(|_| ()),
            Err(GatewayError::NoBackendAvailable)
        );
    }

    #[test]
    fn balance_never_returns_down_backend() {
        let cluster = Cluster::new("users", "");
        let down = cluster.add(quiet_backend("down:1")).unwrap();
        cluster.add(quiet_backend("up:1")).unwrap();
        for _ in 0..3 {
            down.observe_failure();
        }
        for _ in 0..20 {
            assert_eq!(cluster.balance().unwrap().addr(), "up:1");
        }
    }

    #[test]
    fn balance_prefers_lower_normalized_load() {
        let cluster = Cluster::new("users", "");
        let busy = cluster.add(quiet_backend("busy:1")).unwrap();
        cluster.add(quiet_backend("idle:1")).unwrap();
        for _ in 0..50 {
            busy.begin_call();
        }
        assert_eq!(cluster.balance().unwrap().addr(), "idle:1");
    }

    #[test]
    fn registry_membership() {
        let registry = ClusterRegistry::new();
        registry.add("users", "user services").unwrap();
        assert_eq!(
            registry.add("users", "").map(|_| ()),
            Err(GatewayError::ClusterAlreadyExists)
        );
        assert_eq!(registry.add("", "").map(|_| ()), Err(GatewayError::ClusterNameEmpty));
        assert!(registry.get("users").is_some());
        registry.remove("users").unwrap();
        assert_eq!(registry.remove("users"), Err(GatewayError::ClusterNotFound));
    }

    #[test]
    fn registry_update_copies_description_only() {
        let registry = ClusterRegistry::new();
        let cluster = registry.add("users", "old").unwrap();
        cluster.add(quiet_backend("a:1")).unwrap();

        registry.update("users", "new").unwrap();
        let updated = registry.get("users").unwrap();
        assert_eq!(updated.description(), "new");
        assert_eq!(updated.len(), 1, "backends must survive a metadata update");
    }

    // A probed backend pointed at a dead address: the prober keeps ticking
    // until the backend is removed, after which no further attempts happen.
    #[tokio::test]
    async fn removing_backend_stops_its_prober() {
        // grab a port with no listener behind it
        let dead_addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let cluster = Cluster::new("users", "");
        let backend = cluster.add(probed_backend(&dead_addr)).unwrap();

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(backend.last_probe().is_some(), "prober should have ticked");

        cluster.remove(&dead_addr).unwrap();
        let frozen = backend.last_probe();
        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(backend.last_probe(), frozen, "prober ticked after removal");

        assert_eq!(
            cluster.balance().map(|_| ()),
            Err(GatewayError::NoBackendAvailable)
        );
    }

    #[tokio::test]
    async fn replacing_backend_restarts_prober() {
        let dead_addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let cluster = Cluster::new("users", "");
        let old = cluster.add(probed_backend(&dead_addr)).unwrap();
        tokio::time::sleep(Duration::from_millis(1300)).await;

        let new = cluster.update(probed_backend(&dead_addr)).unwrap();
        let frozen = old.last_probe();
        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(old.last_probe(), frozen, "old prober survived replacement");
        assert!(new.last_probe().is_some(), "replacement prober never ticked");
    }
}
