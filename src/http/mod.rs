//! HTTP surface.
//!
//! Both services expose the probes:
//! - `GET /health`: session health as JSON, always 200
//! - `GET /ready`: 200 while messaging is usable, 503 once it has been down
//!   longer than the readiness grace period
//!
//! The auth service adds `POST /auth/register` (see [`auth`]).

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::broker::{BrokerSession, SessionHealth};
use crate::utils::shutdown::ShutdownSignal;

pub mod auth;

#[derive(Clone)]
struct ProbeState {
    session: BrokerSession,
    readiness_grace: Duration,
}

#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    #[serde(flatten)]
    health: SessionHealth,
}

/// Probe routes for a service whose messaging runs on `session`.
pub fn probe_router(session: BrokerSession, readiness_grace: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(ProbeState {
            session,
            readiness_grace,
        })
}

/// Serve `app` on `addr` until `shutdown` fires.
///
/// The bound address is logged, so port 0 can be used to pick a free port.
pub async fn serve(
    app: Router,
    addr: &str,
    shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    let app = app.layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.recv().await })
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<ProbeState>) -> Json<SessionHealth> {
    Json(state.session.health())
}

async fn ready(State(state): State<ProbeState>) -> (StatusCode, Json<ReadyResponse>) {
    let ready = state.session.is_ready(state.readiness_grace);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            ready,
            health: state.session.health(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, QueueSpec, SessionConfig};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn session(broker: &MemoryBroker) -> BrokerSession {
        let config = SessionConfig {
            queues: vec![QueueSpec::durable("UserRegistered")],
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        };
        BrokerSession::new(Arc::new(broker.connector()), config)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_connected_session() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        session.start().await;
        session.ensure_connected().await.unwrap();

        let (status, json) = get_json(probe_router(session, Duration::from_secs(30)), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "connected");
        assert_eq!(json["generation"], 1);
        assert!(json["unavailable_ms"].is_null());
    }

    #[tokio::test]
    async fn test_ready_while_connected() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        session.start().await;
        session.ensure_connected().await.unwrap();

        let (status, json) = get_json(probe_router(session, Duration::from_millis(10)), "/ready").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ready"], true);
    }

    #[tokio::test]
    async fn test_not_ready_after_grace_expires() {
        let broker = MemoryBroker::new();
        broker.set_unavailable(true);
        let session = session(&broker);
        session.start().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let (status, json) = get_json(probe_router(session.clone(), Duration::from_millis(10)), "/ready").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["ready"], false);
        assert!(json["consecutive_failures"].as_u64().unwrap() > 0);
        session.shutdown().await;
    }
}
