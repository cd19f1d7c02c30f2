//! HTTP companion for an instigate instance: inspect schedules and sensors,
//! start and stop them, move cursors and dry-run evaluations.

pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post, put};
use axum::Router;
use std::future::Future;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve_on()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/server_info", get(routes::info::server_info))
        .route(
            "/api/instigators",
            get(routes::instigators::list_instigators),
        )
        .route(
            "/api/instigators/{location}/{repository}/{name}",
            get(routes::instigators::get_instigator),
        )
        .route(
            "/api/instigators/{location}/{repository}/{name}/ticks",
            get(routes::instigators::list_ticks),
        )
        .route(
            "/api/instigators/{location}/{repository}/{name}/start",
            post(routes::instigators::start_instigator),
        )
        .route(
            "/api/instigators/{location}/{repository}/{name}/stop",
            post(routes::instigators::stop_instigator),
        )
        .route(
            "/api/instigators/{location}/{repository}/{name}/cursor",
            put(routes::instigators::set_cursor),
        )
        .route(
            "/api/instigators/{location}/{repository}/{name}/test",
            post(routes::instigators::test_instigator),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Bind `host:port` and serve until `shutdown` resolves.
pub async fn serve<F>(
    host: &str,
    port: u16,
    app_state: AppState,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    serve_on(listener, app_state, shutdown).await
}

/// Serve on a pre-bound listener. With `port = 0` the caller can read the
/// chosen port from the listener first.
pub async fn serve_on<F>(
    listener: tokio::net::TcpListener,
    app_state: AppState,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    let app = build_router(app_state);

    tracing::info!("instigate API listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("instigate API stopped");
    Ok(())
}
