use super::checked_project;
use crate::{
    error::{OffgridError, Result},
    server::{html, state::AppState},
};
use axum::{
    Json,
    extract::{Path, State},
    response::Html,
};
use serde::Serialize;
use serde_json::{Value, json};

/// Cache state of one listed artifact.
#[derive(Debug, Serialize)]
pub struct CachedFileInfo {
    pub file_name: String,
    pub file_exists: bool,
    pub file_size: Option<u64>,
    pub human_file_size: Option<String>,
    pub remote_url: String,
    pub proxified_url: Option<String>,
    pub cached_file_path: Option<String>,
}

pub async fn index(State(state): State<AppState>) -> Result<Html<String>> {
    let projects = state.store.list_projects(None, None, None).await?;
    Ok(Html(html::cache_status_index(&projects)))
}

/// Stored JSON metadata of a project.
pub async fn project_metadata(
    Path(project): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>> {
    let project = checked_project(&project)?;
    let metadata = state
        .store
        .get_project_metadata(project)
        .await?
        .ok_or_else(|| OffgridError::NotFound(format!("Project {project} not found in cache")))?;

    Ok(Json(json!({
        "project_name": project,
        "proxy_base_url": state.config.proxy_base_url,
        "project_info": metadata,
    })))
}

/// Per-file cache status, cached files first, then by name.
pub async fn project_files(
    Path(project): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<CachedFileInfo>>> {
    let project = checked_project(&project)?;
    let links = state
        .store
        .get_project_links(project)
        .await?
        .ok_or_else(|| OffgridError::NotFound(format!("Project {project} not found")))?;

    let mut files = Vec::with_capacity(links.len());
    for link in links {
        let cached = state.cache.lookup(&link.href).await.ok();
        files.push(CachedFileInfo {
            file_exists: cached.as_ref().is_some_and(|c| c.exists),
            file_size: cached.as_ref().and_then(|c| c.size),
            human_file_size: cached.as_ref().and_then(|c| c.human_size.clone()),
            cached_file_path: cached.map(|c| c.path.display().to_string()),
            proxified_url: state.codec.proxify(&link.href).ok(),
            remote_url: link.href,
            file_name: link.label,
        });
    }

    files.sort_by(|a, b| {
        b.file_exists
            .cmp(&a.file_exists)
            .then_with(|| a.file_name.cmp(&b.file_name))
    });
    Ok(Json(files))
}
