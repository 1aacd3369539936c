//! HTTP task submission surface.
//!
//! | Method | Path        | Response                                  |
//! |--------|-------------|-------------------------------------------|
//! | GET    | `/`         | name, version, uptime                     |
//! | GET    | `/health`   | kernel health: adapters, bus, breakers    |
//! | GET    | `/services` | built-in services and adapter routes      |
//! | POST   | `/task`     | envelope in, routed result or error body  |

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::kernel::{Kernel, KernelHealth};
use crate::types::{Error, ErrorCode};

/// HTTP status for each error code.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidEnvelope | ErrorCode::ProtocolError => StatusCode::BAD_REQUEST,
        ErrorCode::AccessDenied => StatusCode::FORBIDDEN,
        ErrorCode::NoRoute => StatusCode::NOT_FOUND,
        ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::DispatchFailed => StatusCode::BAD_GATEWAY,
        ErrorCode::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::InternalServiceError | ErrorCode::ConfigurationError | ErrorCode::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (status_for(self.code()), Json(self.to_body())).into_response()
    }
}

/// Build the router over a shared kernel.
pub fn router(kernel: Arc<Kernel>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/services", get(services))
        .route("/task", post(submit_task))
        .layer(TraceLayer::new_for_http())
        .with_state(kernel)
}

/// Serve until `cancel` fires.
pub async fn serve(
    kernel: Arc<Kernel>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router(kernel))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn root(State(kernel): State<Arc<Kernel>>) -> Json<Value> {
    Json(json!({
        "name": "polyroute-kernel",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": kernel.uptime_secs(),
        "endpoints": ["/health", "/services", "/task"],
    }))
}

async fn health(State(kernel): State<Arc<Kernel>>) -> Json<KernelHealth> {
    Json(kernel.health())
}

async fn services(State(kernel): State<Arc<Kernel>>) -> Json<Value> {
    Json(kernel.services())
}

async fn submit_task(State(kernel): State<Arc<Kernel>>, body: Bytes) -> Result<Json<Value>, Error> {
    let raw: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::invalid_envelope(vec![format!("body is not valid JSON: {e}")]))?;
    kernel.submit_raw(&raw).await.map(Json)
}
