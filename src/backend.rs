//! Backend endpoints and their liveness state machine.
//!
//! Each backend owns a prober task that periodically issues a heartbeat
//! GET and drives the Up/Down transition: three consecutive failures take
//! a backend out of rotation, and a single success restores it.

use crate::error::{GatewayError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Heartbeat interval applied when the configured one is missing or zero.
pub const DEFAULT_HEART_INTERVAL_SECS: u64 = 5;
/// Call timeout applied when the configured one is missing or zero.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3;
/// Consecutive probe failures required to take a backend Down.
pub const MAX_HEART_FAILURES: u64 = 3;

/// Liveness state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Up,
    Down,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendStatus::Up => write!(f, "up"),
            BackendStatus::Down => write!(f, "down"),
        }
    }
}

/// Static configuration of one upstream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Access protocol, `http` or `https`.
    pub schema: String,
    /// Network address, e.g. `127.0.0.1:9000`.
    pub addr: String,
    #[serde(default, rename = "heartDisabled")]
    pub heart_disabled: bool,
    /// Path probed by the heartbeat GET.
    #[serde(default, rename = "heartPath")]
    pub heart_path: String,
    /// Expected probe body; empty means "any 200 is healthy".
    #[serde(default, rename = "heartResponseBody")]
    pub heart_response_body: String,
    /// Heartbeat interval in seconds.
    #[serde(default, rename = "heartDuration")]
    pub heart_duration: u64,
    /// Outbound call timeout in seconds.
    #[serde(default)]
    pub timeout: u64,
    /// Concurrency-weighted throughput cap; must be at least 1.
    #[serde(default, rename = "maxQPS")]
    pub max_qps: u64,
}

impl BackendConfig {
    /// Field validation applied before a backend enters a cluster.
    pub fn validate(&self) -> Result<()> {
        if self.schema != "http" && self.schema != "https" {
            return Err(GatewayError::UnknownSchema(self.schema.clone()));
        }
        if self.addr.is_empty() {
            return Err(GatewayError::EmptyAddr);
        }
        if !self.heart_disabled && self.heart_path.is_empty() {
            return Err(GatewayError::HeartPathEmpty);
        }
        if self.max_qps < 1 {
            return Err(GatewayError::MaxQpsZero);
        }
        Ok(())
    }

    fn apply_defaults(&mut self) {
        if self.timeout < 1 {
            self.timeout = DEFAULT_TIMEOUT_SECS;
        }
        if self.heart_duration < 1 {
            self.heart_duration = DEFAULT_HEART_INTERVAL_SECS;
        }
    }
}

/// Stop handle for a backend's prober task.
///
/// Owned by the backend entity itself; each backend stops exactly its own
/// prober when it is removed or replaced.
#[derive(Debug)]
pub(crate) struct ProberHandle {
    stop: broadcast::Sender<()>,
}

/// Runtime state of one upstream endpoint.
#[derive(Debug)]
pub struct Backend {
    config: BackendConfig,
    status: RwLock<BackendStatus>,
    /// In-flight outbound calls.
    waiting: AtomicU64,
    /// Total outbound call attempts.
    qps: AtomicU64,
    heart_failures: AtomicU64,
    last_probe: RwLock<Option<Instant>>,
    prober: Mutex<Option<ProberHandle>>,
}

impl Backend {
    /// Build a backend from validated configuration, applying defaults.
    ///
    /// Initial status is Up when the heartbeat is disabled (such backends
    /// are never probed), Down otherwise until the first successful probe.
    pub fn new(mut config: BackendConfig) -> Self {
        config.apply_defaults();
        let status = if config.heart_disabled {
            BackendStatus::Up
        } else {
            BackendStatus::Down
        };
        Self {
            config,
            status: RwLock::new(status),
            waiting: AtomicU64::new(0),
            qps: AtomicU64::new(0),
            heart_failures: AtomicU64::new(0),
            last_probe: RwLock::new(None),
            prober: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    pub fn status(&self) -> BackendStatus {
        *self.status.read()
    }

    pub fn is_up(&self) -> bool {
        self.status() == BackendStatus::Up
    }

    pub fn waiting(&self) -> u64 {
        self.waiting.load(Ordering::Relaxed)
    }

    pub fn qps(&self) -> u64 {
        self.qps.load(Ordering::Relaxed)
    }

    /// In-flight load normalized by capacity; the balancer's sort key.
    pub fn normalized_load(&self) -> f64 {
        self.waiting.load(Ordering::Relaxed) as f64 / self.config.max_qps as f64
    }

    pub fn last_probe(&self) -> Option<Instant> {
        *self.last_probe.read()
    }

    pub(crate) fn begin_call(&self) {
        self.waiting.fetch_add(1, Ordering::Relaxed);
        self.qps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn end_call(&self) {
        self.waiting.fetch_sub(1, Ordering::Relaxed);
    }

    fn set_status(&self, next: BackendStatus) {
        let mut status = self.status.write();
        if *status != next {
            info!(addr = %self.config.addr, from = %*status, to = %next, "backend status changed");
            *status = next;
        }
    }

    /// A successful probe resets the failure counter and restores the
    /// backend immediately.
    pub(crate) fn observe_success(&self) {
        self.heart_failures.store(0, Ordering::Relaxed);
        self.set_status(BackendStatus::Up);
    }

    /// A failed probe counts toward the Down threshold.
    pub(crate) fn observe_failure(&self) {
        let failures = self.heart_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= MAX_HEART_FAILURES {
            self.set_status(BackendStatus::Down);
        }
    }

    /// Start the heartbeat prober task for this backend.
    ///
    /// Must not be called for heartbeat-disabled backends; callers guard on
    /// `config.heart_disabled`.
    pub(crate) fn spawn_prober(self: &Arc<Self>) {
        let (stop, mut stop_rx) = broadcast::channel(1);
        *self.prober.lock() = Some(ProberHandle { stop });

        let backend = Arc::clone(self);
        tokio::spawn(async move {
            let uri = format!(
                "{}://{}{}",
                backend.config.schema, backend.config.addr, backend.config.heart_path
            );
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(backend.config.timeout))
                .build()
                .expect("failed to create heartbeat HTTP client");
            let period = Duration::from_secs(backend.config.heart_duration);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            debug!(addr = %backend.config.addr, uri = %uri, "heartbeat prober started");
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        debug!(addr = %backend.config.addr, "heartbeat prober stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        backend.probe(&client, &uri).await;
                    }
                }
            }
        });
    }

    /// Stop this backend's prober, if one is running.
    pub(crate) fn stop_prober(&self) {
        if let Some(handle) = self.prober.lock().take() {
            let _ = handle.stop.send(());
        }
    }

    async fn probe(&self, client: &reqwest::Client, uri: &str) {
        *self.last_probe.write() = Some(Instant::now());
        match client.get(uri).send().await {
            Err(err) => {
                warn!(addr = %self.config.addr, error = %err, "heartbeat probe failed");
                self.observe_failure();
            }
            Ok(response) => {
                if self.config.heart_response_body.is_empty() {
                    if response.status() == reqwest::StatusCode::OK {
                        self.observe_success();
                    } else {
                        self.observe_failure();
                    }
                } else {
                    match response.text().await {
                        Ok(body) if body == self.config.heart_response_body => {
                            self.observe_success()
                        }
                        _ => self.observe_failure(),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(addr: &str) -> BackendConfig {
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

    #[test]
    fn defaults_applied_on_creation() {
        let backend = Backend::new(config("127.0.0.1:9000"));
        assert_eq!(backend.config().timeout, DEFAULT_TIMEOUT_SECS);
        assert_eq!(backend.config().heart_duration, DEFAULT_HEART_INTERVAL_SECS);
    }

    #[test]
    fn heart_disabled_starts_up_enabled_starts_down() {
        assert_eq!(Backend::new(config("a:1")).status(), BackendStatus::Up);

        let mut probed = config("a:1");
        probed.heart_disabled = false;
        probed.heart_path = "/ping".to_string();
        assert_eq!(Backend::new(probed).status(), BackendStatus::Down);
    }

    #[test]
    fn three_failures_take_backend_down() {
        let backend = Backend::new(config("a:1"));
        backend.observe_failure();
        backend.observe_failure();
        assert_eq!(backend.status(), BackendStatus::Up);
        backend.observe_failure();
        assert_eq!(backend.status(), BackendStatus::Down);
        // further failures are a no-op
        backend.observe_failure();
        assert_eq!(backend.status(), BackendStatus::Down);
    }

    #[test]
    fn single_success_restores_and_resets_counter() {
        let backend = Backend::new(config("a:1"));
        for _ in 0..3 {
            backend.observe_failure();
        }
        assert_eq!(backend.status(), BackendStatus::Down);

        backend.observe_success();
        assert_eq!(backend.status(), BackendStatus::Up);

        // counter was reset: two fresh failures must not take it down again
        backend.observe_failure();
        backend.observe_failure();
        assert_eq!(backend.status(), BackendStatus::Up);
    }

    #[test]
    fn call_counters() {
        let backend = Backend::new(config("a:1"));
        backend.begin_call();
        backend.begin_call();
        assert_eq!(backend.waiting(), 2);
        assert_eq!(backend.qps(), 2);
        backend.end_call();
        assert_eq!(backend.waiting(), 1);
        assert_eq!(backend.qps(), 2);
    }

    #[test]
    fn validation_rejects_bad_fields() {
        let mut cfg = config("a:1");
        cfg.schema = "ftp".to_string();
        assert_eq!(cfg.validate(), Err(GatewayError::UnknownSchema("ftp".into())));

        let mut cfg = config("");
        cfg.addr.clear();
        assert_eq!(cfg.validate(), Err(GatewayError::EmptyAddr));

        let mut cfg = config("a:1");
        cfg.heart_disabled = false;
        cfg.heart_path.clear();
        assert_eq!(cfg.validate(), Err(GatewayError::HeartPathEmpty));

        let mut cfg = config("a:1");
        cfg.max_qps = 0;
        assert_eq!(cfg.validate(), Err(GatewayError::MaxQpsZero));
    }
}
