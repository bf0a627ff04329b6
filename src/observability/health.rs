//! Health check HTTP server for container orchestration
//!
//! Readiness tracks the broker connection: a worker that cannot reach the
//! broker can neither consume work nor complete persistence calls, so it
//! reports not-ready and orchestration stops routing probes to it.

use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::Filter;

/// Shared liveness/readiness state, updated by the transport and pipeline.
#[derive(Debug, Default)]
pub struct WorkerStatus {
    broker_connected: AtomicBool,
    last_item_processed: AtomicU64,
}

impl WorkerStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.broker_connected.store(connected, Ordering::Relaxed);
    }

    pub fn broker_connected(&self) -> bool {
        self.broker_connected.load(Ordering::Relaxed)
    }

    /// Record that a work item just finished processing.
    pub fn mark_item_processed(&self) {
        self.last_item_processed
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn last_item_processed(&self) -> u64 {
        self.last_item_processed.load(Ordering::Relaxed)
    }
}

/// HTTP health check server
pub struct HealthServer {
    worker_id: String,
    port: u16,
    status: Arc<WorkerStatus>,
    started_at: u64,
}

impl HealthServer {
    pub fn new(worker_id: String, port: u16, status: Arc<WorkerStatus>) -> Self {
        Self {
            worker_id,
            port,
            status,
            started_at: current_timestamp(),
        }
    }

    /// Bind the server socket and return the address plus the serve future.
    ///
    /// Binding happens before the future is spawned so a port conflict is a
    /// startup error, not a silently dead endpoint.
    pub fn bind(
        self: Arc<Self>,
    ) -> Result<(SocketAddr, impl std::future::Future<Output = ()> + Send), warp::Error> {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - comprehensive health status
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.health_status();
                let status_code = if status.status == "healthy" { 200 } else { 503 };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&status),
                    warp::http::StatusCode::from_u16(status_code).unwrap(),
                ))
            }
        });

        // GET /ready - Kubernetes readiness probe
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.status.broker_connected();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let status_code = if ready { 200 } else { 503 };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&response),
                    warp::http::StatusCode::from_u16(status_code).unwrap(),
                ))
            }
        });

        // GET /live - Kubernetes liveness probe
        let live_route = warp::path("live").and(warp::get()).and_then(move || async move {
            let response = LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            };
            Ok::<_, Infallible>(warp::reply::json(&response))
        });

        let routes = health_route
            .or(ready_route)
            .or(live_route)
            .with(warp::cors().allow_any_origin());

        warp::serve(routes).try_bind_ephemeral(([0, 0, 0, 0], self.port))
    }

    fn health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let mut checks = HashMap::new();

        checks.insert("broker".to_string(), self.check_broker_health(now));
        checks.insert(
            "item_processing".to_string(),
            self.check_item_processing_health(now),
        );

        let overall_healthy = checks.values().all(|check| check.status == "healthy");
        let status = if overall_healthy {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        };

        HealthStatus {
            status,
            timestamp: now,
            worker_id: self.worker_id.clone(),
            uptime_seconds: now.saturating_sub(self.started_at),
            checks,
        }
    }

    fn check_broker_health(&self, now: u64) -> HealthCheck {
        if self.status.broker_connected() {
            HealthCheck {
                status: "healthy".to_string(),
                message: Some("Broker connection established".to_string()),
                last_check: now,
            }
        } else {
            HealthCheck {
                status: "unhealthy".to_string(),
                message: Some("Broker connection failed or disconnected".to_string()),
                last_check: now,
            }
        }
    }

    fn check_item_processing_health(&self, now: u64) -> HealthCheck {
        const ITEM_STALENESS_THRESHOLD_SECONDS: u64 = 300;

        let last_item = self.status.last_item_processed();

        if last_item == 0 {
            // No items processed yet - healthy for a fresh worker
            HealthCheck {
                status: "healthy".to_string(),
                message: Some("No items processed yet - worker ready".to_string()),
                last_check: now,
            }
        } else if now.saturating_sub(last_item) > ITEM_STALENESS_THRESHOLD_SECONDS {
            let stale_duration = now - last_item;
            HealthCheck {
                status: "stale".to_string(),
                message: Some(format!("No item activity for {stale_duration} seconds")),
                last_check: now,
            }
        } else {
            HealthCheck {
                status: "healthy".to_string(),
                message: Some("Recent item activity".to_string()),
                last_check: now,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    worker_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> HealthServer {
        HealthServer::new(
            "test-worker".to_string(),
            0,
            Arc::new(WorkerStatus::new()),
        )
    }

    #[test]
    fn test_broker_status_drives_readiness_state() {
        let server = server();

        let check = server.check_broker_health(current_timestamp());
        assert_eq!(check.status, "unhealthy");

        server.status.set_broker_connected(true);
        let check = server.check_broker_health(current_timestamp());
        assert_eq!(check.status, "healthy");
    }

    #[test]
    fn test_item_processing_staleness() {
        let server = server();
        let now = current_timestamp();

        // No items yet is healthy
        assert_eq!(server.check_item_processing_health(now).status, "healthy");

        server.status.mark_item_processed();
        assert_eq!(server.check_item_processing_health(now).status, "healthy");

        // Simulate stale activity by checking far in the future
        assert_eq!(
            server.check_item_processing_health(now + 600).status,
            "stale"
        );
    }

    #[test]
    fn test_overall_status_degrades_without_broker() {
        let server = server();
        assert_eq!(server.health_status().status, "degraded");

        server.status.set_broker_connected(true);
        let status = server.health_status();
        assert_eq!(status.status, "healthy");
        assert_eq!(status.worker_id, "test-worker");
        assert!(status.checks.contains_key("broker"));
        assert!(status.checks.contains_key("item_processing"));
    }

    #[tokio::test]
    async fn test_bind_on_ephemeral_port() {
        let (addr, _server) = Arc::new(server()).bind().unwrap();
        assert_ne!(addr.port(), 0);
    }
}
