//! HTTP routes and middleware.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{error, warn};

use tollgate_capability::{Cid, DispatchServer};
use tollgate_consolidator::{Consolidator, ConsolidatorError};
use tollgate_metrics::Metrics;
use tollgate_tables::TableError;

const BUNDLE_CONTENT_TYPE: &str = "application/octet-stream";

pub struct AppState {
    pub dispatch: Arc<DispatchServer>,
    pub consolidator: Arc<Consolidator>,
    pub metrics: Arc<Metrics>,
    /// Bearer token for the metrics route; `None` disables it.
    pub metrics_token: Option<String>,
    pub service_did: String,
    /// The key-bound DID, present when the service runs under a named
    /// identifier.
    pub unwrapped_did: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/", get(root).post(invocations))
        .route("/receipts/:cid", get(receipt));

    if state.metrics_token.is_some() {
        router = router.route("/metrics", get(metrics));
    } else {
        warn!("metrics endpoint is disabled");
    }

    router.layer(middleware::from_fn(cors)).with_state(state)
}

/// Plain-text status banner.
async fn root(State(state): State<Arc<AppState>>) -> String {
    let mut banner = format!("🌉 tollgate {}\n", env!("CARGO_PKG_VERSION"));
    banner.push_str(&format!("- {}\n", state.service_did));
    if let Some(did) = &state.unwrapped_did {
        banner.push_str(&format!("- {did}\n"));
    }
    banner
}

/// The invocation endpoint: a bundle of signed invocations in, a bundle
/// of signed receipts out. Transport failures return 4xx without a
/// receipt.
async fn invocations(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match state.dispatch.request(&body).await {
        Ok(response) => (
            [(header::CONTENT_TYPE, BUNDLE_CONTENT_TYPE)],
            response,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "handling invocation request");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}

/// Single-receipt bundle for a consolidate-invocation id.
async fn receipt(State(state): State<Arc<AppState>>, Path(cid): Path<String>) -> Response {
    let cause: Cid = match cid.parse() {
        Ok(cause) => cause,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "invalid invocation CID").into_response();
        }
    };

    match state.consolidator.get_receipt(&cause).await {
        Ok(receipt) => match receipt.archive() {
            Ok(bytes) => (
                [(header::CONTENT_TYPE, BUNDLE_CONTENT_TYPE)],
                bytes,
            )
                .into_response(),
            Err(e) => {
                error!(error = %e, "encoding receipt bundle");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Err(ConsolidatorError::Table(TableError::NotFound)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(error = %e, "getting receipt");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Prometheus scrape, gated by a bearer token.
async fn metrics(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
) -> Response {
    let Some(token) = &state.metrics_token else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let expected = format!("Bearer {token}");
    match headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        Some(value) if value == expected => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            state.metrics.render(),
        )
            .into_response(),
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

/// Allow cross-origin requests from anywhere, with a 24-hour preflight
/// cache.
async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        apply_cors_headers(&mut response);
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(&mut response);
    response
}

fn apply_cors_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
}
