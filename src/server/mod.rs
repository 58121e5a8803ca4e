pub mod handlers;
pub mod html;
pub mod state;

use crate::config::Config;
use crate::metrics;
use axum::{
    Router,
    extract::{MatchedPath, Request},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, put},
};
use handlers::{cache_status, download, health, simple, webapi};
use state::AppState;
use std::net::SocketAddr;
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

/// Build the router with all routes and middleware.
///
/// Separated from [`start`] so tests can drive it with `oneshot`.
pub fn build_router(state: AppState) -> Router {
    let download_route = format!("/{}/{{token}}/{{*path}}", state.config.download_endpoint);

    Router::new()
        .route("/", get(health::index_page))
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics_endpoint))
        .route("/settings", get(health::settings_page))
        .route("/settings/", get(health::settings_page))
        .route("/simple", get(simple::list_projects))
        .route("/simple/", get(simple::list_projects))
        .route("/simple/{project}", get(simple::project_page))
        .route("/simple/{project}/", get(simple::project_page))
        .route(&download_route, get(download::download_file))
        .route("/cache_status", get(cache_status::index))
        .route("/cache_status/", get(cache_status::index))
        .route(
            "/cache_status/{project}",
            get(cache_status::project_metadata),
        )
        .route(
            "/cache_status/{project}/",
            get(cache_status::project_metadata),
        )
        .route(
            "/cache_status/project_files/{project}",
            get(cache_status::project_files),
        )
        .route(
            "/cache_status/project_files/{project}/",
            get(cache_status::project_files),
        )
        .route("/webapi/list_projects", get(webapi::list_all_projects))
        .route("/webapi/list_projects/", get(webapi::list_all_projects))
        .route(
            "/webapi/list_projects/{page_size}/{page_number}",
            get(webapi::list_paginated_projects),
        )
        .route(
            "/webapi/list_projects/{page_size}/{page_number}/{*mask}",
            get(webapi::list_filtered_projects),
        )
        .route("/webapi/offline_mode", get(webapi::get_offline_mode))
        .route(
            "/webapi/offline_mode/{value}",
            put(webapi::set_offline_mode),
        )
        .route("/webapi/projects/{project}", delete(webapi::delete_project))
        .layer(middleware::from_fn(track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Record per-route metrics and stamp the version header.
async fn track_requests(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let mut response = next.run(req).await;

    metrics::record_request(&route, response.status().as_u16());
    metrics::record_duration(&route, start);
    response.headers_mut().insert(
        "x-offgrid-version",
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::new(config.listen_ip, config.port);
    metrics::init();

    let state = AppState::new(config).await?;
    info!("Proxied links point at {}", state.config.proxy_base_url);
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Server listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
