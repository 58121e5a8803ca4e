//! JSON endpoints for scripts and the admin UI.

use super::checked_project;
use crate::{
    error::{OffgridError, Result},
    server::state::{AppState, parse_switch},
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

/// `{name: summary}` for every stored project.
pub async fn list_all_projects(State(state): State<AppState>) -> Result<Json<Map<String, Value>>> {
    project_summaries(&state, None, None, None).await
}

pub async fn list_paginated_projects(
    Path((page_size, page_number)): Path<(u32, u32)>,
    State(state): State<AppState>,
) -> Result<Json<Map<String, Value>>> {
    project_summaries(&state, None, Some(page_size), Some(page_number)).await
}

pub async fn list_filtered_projects(
    Path((page_size, page_number, mask)): Path<(u32, u32, String)>,
    State(state): State<AppState>,
) -> Result<Json<Map<String, Value>>> {
    project_summaries(&state, Some(&mask), Some(page_size), Some(page_number)).await
}

async fn project_summaries(
    state: &AppState,
    mask: Option<&str>,
    page_size: Option<u32>,
    page_number: Option<u32>,
) -> Result<Json<Map<String, Value>>> {
    debug!(
        "list_projects requested, mask: {:?}, page_size: {:?}, page_number: {:?}",
        mask, page_size, page_number
    );

    let names = state.store.list_projects(mask, page_size, page_number).await?;
    let mut summaries = Map::new();
    for name in names {
        let summary = state.store.get_project_summary(&name).await?;
        summaries.insert(name, summary.map_or(Value::Null, Value::String));
    }
    Ok(Json(summaries))
}

pub async fn get_offline_mode(State(state): State<AppState>) -> Result<Json<Value>> {
    let on = state.offline_mode().await?;
    Ok(Json(json!({ "offline_mode": on })))
}

pub async fn set_offline_mode(
    Path(value): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>> {
    let on = parse_switch(&value);
    state.set_offline_mode(on).await?;
    info!("Offline mode switched {}", if on { "on" } else { "off" });
    Ok(Json(json!({ "offline_mode": on })))
}

/// Drop a project's cached files and stored records.
///
/// `files_removed` is `false` when some artifact could not be deleted; the
/// records are removed either way.
pub async fn delete_project(
    Path(project): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>> {
    let project = checked_project(&project)?;
    let links = state
        .store
        .get_project_links(project)
        .await?
        .ok_or_else(|| OffgridError::NotFound(format!("Project {project} not found")))?;

    let paths: Vec<_> = links
        .iter()
        .filter_map(|link| match state.cache.cache_key_for(&link.href) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("No cache path for {}: {}", link.href, e);
                None
            }
        })
        .collect();

    let files_removed = state.cache.delete_artifacts(&paths).await;
    state.store.delete_project(project).await?;
    info!(
        "Deleted project {} ({} file(s), complete: {})",
        project,
        paths.len(),
        files_removed
    );

    Ok(Json(json!({
        "project": project,
        "files": paths.len(),
        "files_removed": files_removed,
    })))
}
