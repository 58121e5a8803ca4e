use crate::{
    cache::{human_readable_duration, human_readable_size},
    error::Result,
    metrics,
    server::html,
    server::state::AppState,
};
use axum::{
    Json,
    extract::State,
    http::header,
    response::{Html, IntoResponse},
};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};
use tracing::warn;

/// Liveness plus a few numbers for dashboards
pub async fn health_check(State(state): State<AppState>) -> Result<Json<Value>> {
    let uptime = state.started_at.elapsed().as_secs();

    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": human_readable_duration(uptime),
        "offline_mode": state.offline_mode().await?,
    })))
}

pub async fn index_page(State(state): State<AppState>) -> Result<Html<String>> {
    let uptime = human_readable_duration(state.started_at.elapsed().as_secs());
    let projects = state.store.list_projects(None, None, None).await?.len();
    let offline = state.offline_mode().await?;

    Ok(Html(html::landing(
        env!("CARGO_PKG_VERSION"),
        &uptime,
        projects,
        offline,
    )))
}

/// Effective configuration plus host facts.
pub async fn settings_page(State(state): State<AppState>) -> Result<Html<String>> {
    let config = &state.config;
    let cache_dir = config.cache_dir.clone();
    let free = tokio::task::spawn_blocking(move || free_space(&cache_dir))
        .await
        .unwrap_or_else(|e| {
            warn!("Disk space lookup failed: {}", e);
            None
        });
    let free = free.map_or_else(|| "unknown".to_string(), human_readable_size);

    let os = format!(
        "{} {}",
        System::name().unwrap_or_else(|| "unknown".to_string()),
        System::os_version().unwrap_or_default()
    );

    let rows = [
        ("Listen IP", config.listen_ip.to_string()),
        ("Listen port", config.port.to_string()),
        ("Proxy server base URL", config.proxy_base_url.clone()),
        (
            "Cache directory",
            format!("{} (free space: {})", config.cache_dir.display(), free),
        ),
        ("Cache layout", config.cache_layout.to_string()),
        ("Metadata database", config.db_path.display().to_string()),
        ("Remote index simple URL", config.remote_index_simple.clone()),
        ("Remote index JSON URL", config.remote_index_json.clone()),
        ("Connection timeout", format!("{:?}", config.connect_timeout)),
        ("Download timeout", format!("{:?}", config.download_timeout)),
        ("Remote access retries", config.max_retries.to_string()),
        ("Offline mode", state.offline_mode().await?.to_string()),
        ("Server OS", os.trim().to_string()),
        ("Server uptime", human_readable_duration(System::uptime())),
        (
            "Proxy uptime",
            human_readable_duration(state.started_at.elapsed().as_secs()),
        ),
    ];

    Ok(Html(html::settings(&rows)))
}

/// Available bytes on the disk holding `dir`.
fn free_space(dir: &Path) -> Option<u64> {
    let dir: PathBuf = std::fs::canonicalize(dir).ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| dir.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Prometheus scrape endpoint
pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
