//! Operator HTTP surface
//!
//! Liveness, readiness and health probes, a metrics export, and a `/query`
//! endpoint that lets the node's owner start a session over HTTP.

use crate::agent::node::ElmnetNode;
use crate::error::ElmnetError;
use crate::observability::metrics::metrics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// HTTP server bound to one node
pub struct HealthServer {
    node: Arc<ElmnetNode>,
    port: u16,
}

impl HealthServer {
    pub fn new(node: Arc<ElmnetNode>, port: u16) -> Self {
        Self { node, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All routes, without binding a socket
    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let health_node = self.node.clone();
        let ready_node = self.node.clone();
        let query_node = self.node.clone();

        // GET /health - component checks
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let node = health_node.clone();
                async move {
                    let status = health_status(&node);
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /metrics
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /ready - started and not shutting down
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let ready = ready_node.is_ready();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&response), code)
            });

        // GET /live
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET /query?topic=..&q=..
        let query_route = warp::path("query")
            .and(warp::path::end())
            .and(warp::get())
            .and(warp::query::<QueryParams>())
            .and_then(move |params: QueryParams| {
                let node = query_node.clone();
                async move { Ok::<_, Infallible>(run_query(&node, params).await) }
            });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(query_route)
    }

    /// Serve until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), warp::Error> {
        let signal = async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        };
        let (addr, server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(SocketAddr::from(([0, 0, 0, 0], self.port)), signal)?;
        tracing::info!(%addr, "Starting operator HTTP server");
        server.await;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    topic: String,
    q: String,
}

async fn run_query(node: &ElmnetNode, params: QueryParams) -> warp::reply::WithStatus<warp::reply::Json> {
    match node.query(&params.topic, &params.q).await {
        Ok(report) => warp::reply::with_status(warp::reply::json(&report), StatusCode::OK),
        Err(e) => {
            let code = match e {
                ElmnetError::Topic(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let response = ErrorResponse {
                error: e.to_string(),
                timestamp: current_timestamp(),
            };
            warp::reply::with_status(warp::reply::json(&response), code)
        }
    }
}

fn health_status(node: &ElmnetNode) -> HealthStatus {
    let now = current_timestamp();
    let mut checks = HashMap::new();

    checks.insert(
        "lifecycle".to_string(),
        if node.is_ready() {
            HealthCheck::healthy("Node running", now)
        } else {
            HealthCheck::new("unhealthy", "Node not started or shutting down", now)
        },
    );

    let peers = node.gossip().peers().len();
    checks.insert(
        "gossip".to_string(),
        if peers > 0 {
            HealthCheck::healthy(format!("{peers} gossip peers"), now)
        } else {
            HealthCheck::new("isolated", "No gossip peers", now)
        },
    );

    let records = node.index().len();
    checks.insert(
        "directory".to_string(),
        HealthCheck::healthy(format!("{records} records indexed"), now),
    );

    let healthy = checks.values().all(|check| check.status == "healthy");
    metrics().update_health_status(healthy);

    HealthStatus {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: now,
        agent_id: node.agent_id().to_string(),
        role: node.role().to_string(),
        uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
        checks,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn new(status: &str, message: impl Into<String>, now: u64) -> Self {
        Self {
            status: status.to_string(),
            message: Some(message.into()),
            last_check: now,
        }
    }

    fn healthy(message: impl Into<String>, now: u64) -> Self {
        Self::new("healthy", message, now)
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    agent_id: String,
    role: String,
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

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
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
    use crate::agent::answer::DecliningAnswerEngine;
    use crate::agent::node::NodeComponents;
    use crate::config::NodeConfig;
    use crate::protocol::messages::Role;
    use crate::routing::payment::NoPayments;
    use crate::testing::{mem_endpoint, test_identity, MemoryNetwork};
    use serde_json::Value;

    fn server() -> HealthServer {
        let network = MemoryNetwork::new();
        let mut config = NodeConfig::for_role(Role::Router, "127.0.0.1:0");
        config.node.endpoint = Some(mem_endpoint("r1"));
        let identity = test_identity(1);
        let components = NodeComponents {
            transport: Arc::new(network.client(identity.agent_id().clone())),
            answers: Arc::new(DecliningAnswerEngine),
            payments: Arc::new(NoPayments),
            persistence: None,
        };
        let node = ElmnetNode::new(config, identity, components).unwrap();
        network.register("r1", node.clone());
        HealthServer::new(node, 0)
    }

    #[tokio::test]
    async fn test_probes_before_start() {
        let server = server();
        let routes = server.routes();

        let live = warp::test::request().path("/live").reply(&routes).await;
        assert_eq!(live.status(), StatusCode::OK);

        let ready = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

        let health = warp::test::request().path("/health").reply(&routes).await;
        assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_slice(health.body()).unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["role"], "router");
        assert_eq!(body["checks"]["gossip"]["status"], "isolated");
    }

    #[tokio::test]
    async fn test_metrics_export() {
        let routes = server().routes();
        let response = warp::test::request().path("/metrics").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body.get("routing").is_some());
        assert!(body.get("gossip").is_some());
    }

    #[tokio::test]
    async fn test_query_endpoint() {
        let routes = server().routes();

        let bad = warp::test::request()
            .path("/query?topic=food/*/vegan&q=hi")
            .reply(&routes)
            .await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        // Nothing is indexed, so the node's own hop finds no route
        let response = warp::test::request()
            .path("/query?topic=food/vegan&q=dinner")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["state"]["failed"], "no_route");
    }
}
