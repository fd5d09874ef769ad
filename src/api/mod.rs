use crate::events::{
    EventEngine,
    handlers::{HandlerConfig, builtin},
    registry::Services,
    store::{PgCounterStore, PgDirectory, PgRuleStore},
};
use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware,
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, debug_span, info};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;

pub mod handlers;
pub mod hooks;
mod openapi;

pub use openapi::openapi;

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Engine backed by `PostgreSQL` stores and the built-in handlers.
///
/// # Errors
/// Returns an error if the outbound HTTP client cannot be built.
pub fn engine(pool: &PgPool, config: &HandlerConfig) -> Result<EventEngine> {
    let registry = builtin(config).context("Failed to build action handlers")?;
    let directory = Arc::new(PgDirectory::new(pool.clone()));
    let services = Services {
        tokens: directory.clone(),
        users: directory,
        counters: Arc::new(PgCounterStore::new(pool.clone())),
    };
    Ok(EventEngine::new(
        registry,
        Arc::new(PgRuleStore::new(pool.clone())),
        services,
    ))
}

/// Served application: routes, the event hook and the request-id/trace layers.
/// Requests need `ConnectInfo<SocketAddr>` for the `client_ip` condition.
#[must_use]
pub fn app(engine: Arc<EventEngine>, max_body_bytes: usize) -> Router {
    let pipeline = Arc::new(hooks::Pipeline {
        engine: engine.clone(),
        max_body_bytes,
    });

    let (router, _openapi) = router().split_for_parts();
    router
        .route_layer(middleware::from_fn(hooks::hook))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(pipeline))
                .layer(Extension(engine)),
        )
}

/// Connect to the database and serve the API until interrupted.
///
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn new(
    port: u16,
    dsn: &str,
    config: &HandlerConfig,
    max_body_bytes: usize,
) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")?;

    let engine = Arc::new(engine(&pool, config)?);
    let app = app(engine, max_body_bytes).layer(Extension(pool));

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {err}");
        }
        info!("Gracefully shutdown");
    })
    .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let headers = request.headers();
    let path = request.uri().path();
    let request_id = headers
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", path, ?headers, request_id)
}
