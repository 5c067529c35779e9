//! HTTP server for image endpoints
//!
//! Provides /health and `GET /{*path}`, which serves the source image at
//! `path` transformed by the query string commands.

use crate::error::{ImageServerError, Result};
use crate::request::{ImageRequest, RequestPipeline};
use crate::storage::StorageRouter;
use crate::transform::{content_type, transform, Limits, TransformOptions};
use crate::types::{ErrorResponse, HealthResponse};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use hybrid_cache::{Fingerprint, HybridCache, ProducerError};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: HybridCache,
    pub storage: Arc<StorageRouter>,
    pub pipeline: RequestPipeline,
    pub limits: Limits,
    pub cache_control: HeaderValue,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(
        cache: HybridCache,
        storage: StorageRouter,
        pipeline: RequestPipeline,
        cache_control: &str,
    ) -> Result<Self> {
        let cache_control = HeaderValue::from_str(cache_control).map_err(|e| {
            ImageServerError::Config(format!("invalid cache control '{}': {}", cache_control, e))
        })?;
        Ok(Self {
            cache,
            storage: Arc::new(storage),
            pipeline,
            limits: Limits::default(),
            cache_control,
            started_at: Utc::now(),
        })
    }
}

pub type SharedState = Arc<ServerState>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/{*path}", get(get_image))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server, returning once `shutdown` resolves and in-flight
/// requests have finished
pub async fn start_server(
    state: SharedState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        caching: state.cache.is_enabled(),
        cache: state.cache.stats(),
    })
}

/// Serve a (possibly transformed) image
async fn get_image(
    State(state): State<SharedState>,
    Path(path): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Response {
    let path = format!("/{}", path);
    match serve_image(&state, &path, query).await {
        Ok(response) => response,
        Err(e) => {
            if e.status_code().is_server_error() {
                error!(path = %path, error = %e, "Failed to serve image");
            } else {
                debug!(path = %path, error = %e, "Rejected image request");
            }
            e.into_response()
        }
    }
}

async fn serve_image(
    state: &ServerState,
    path: &str,
    query: BTreeMap<String, String>,
) -> Result<Response> {
    let request = state.pipeline.apply(ImageRequest::new(path, query))?;
    let options = TransformOptions::from_commands(request.commands(), request.transforms())?;

    let source = state.storage.resolve(request.path())?;
    let version = state.storage.version(&source).await?;
    let fingerprint = Fingerprint::from_parts([
        source.identity().as_bytes(),
        version.as_bytes(),
        request.canonical_query().as_bytes(),
    ]);

    let storage = Arc::clone(&state.storage);
    let limits = state.limits;
    let derivative = state
        .cache
        .get_or_compute(fingerprint, move || async move {
            let bytes = storage.fetch(&source).await?;
            if options.passthrough {
                return Ok(bytes);
            }
            tokio::task::spawn_blocking(move || transform(&bytes, &options, &limits))
                .await
                .map_err(|e| ImageServerError::Config(format!("transform task failed: {}", e)))?
        })
        .await;

    let derivative = match derivative {
        Ok(derivative) => derivative,
        Err(e) => return Ok(producer_error_response(&e)),
    };

    debug!(
        path = %path,
        size = derivative.bytes.len(),
        status = derivative.status.as_str(),
        "Served image"
    );

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static(content_type(&derivative.bytes)),
            ),
            (header::CACHE_CONTROL, state.cache_control.clone()),
        ],
        [("X-Cache", derivative.status.as_str())],
        Body::from(derivative.bytes),
    )
        .into_response())
}

/// Map a producer failure back to the status of the error that caused it
fn producer_error_response(err: &ProducerError) -> Response {
    let (status, message) = match err.downcast_ref::<ImageServerError>() {
        Some(e) => (e.status_code(), e.to_string()),
        None => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    if status.is_server_error() {
        warn!(error = %message, "Image producer failed");
    }
    (status, Json(ErrorResponse { error: message })).into_response()
}
