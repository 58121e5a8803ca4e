//! PEP 503 listing endpoints.
//!
//! A project page is always rendered from the metadata store: the upstream
//! result is written there first and read back, so an upstream outage falls
//! back to the last stored listing instead of failing the request.

use super::checked_project;
use crate::{
    error::{OffgridError, Result},
    metrics,
    models::Link,
    server::{html, state::AppState},
};
use axum::{
    extract::{Path, State},
    response::Html,
};
use tracing::{debug, info, warn};

pub async fn list_projects(State(state): State<AppState>) -> Result<Html<String>> {
    let projects = state.store.list_projects(None, None, None).await?;
    debug!("Listing {} project(s)", projects.len());
    Ok(Html(html::simple_index(&projects)))
}

pub async fn project_page(
    Path(project): Path<String>,
    State(state): State<AppState>,
) -> Result<Html<String>> {
    let project = checked_project(&project)?;
    info!("Listing files for project {}", project);

    if state.offline_mode().await? {
        debug!("Offline mode: serving {} from the store only", project);
    } else {
        refresh_from_upstream(&state, project).await;
    }

    let links = state
        .store
        .get_project_links(project)
        .await?
        .filter(|links| !links.is_empty())
        .ok_or_else(|| OffgridError::NotFound(format!("Project {project} not found")))?;

    let proxied: Vec<Link> = links
        .into_iter()
        .filter_map(|link| match state.codec.proxify(&link.href) {
            Ok(href) => Some(Link::new(link.label, href)),
            Err(e) => {
                warn!("Skipping link {} of {}: {}", link.label, project, e);
                None
            }
        })
        .collect();

    Ok(Html(html::project_page(project, &proxied)))
}

/// Fetch links and JSON metadata and store whatever arrived.
///
/// Failures are logged and swallowed; the caller reads the store afterwards.
async fn refresh_from_upstream(state: &AppState, project: &str) {
    let (links, metadata) = tokio::join!(
        state.upstream.fetch_simple_links(project),
        state.upstream.fetch_project_json(project),
    );

    match links {
        Ok(links) => {
            if let Err(e) = state.store.upsert_project_links(project, &links).await {
                warn!("Failed to store links for {}: {}", project, e);
            }
        }
        Err(e) => {
            metrics::record_upstream_error();
            warn!("Failed to get links for {} from upstream: {}", project, e);
        }
    }

    match metadata {
        Ok(Some(metadata)) => {
            if let Err(e) = state.store.upsert_project_metadata(project, &metadata).await {
                warn!("Failed to store metadata for {}: {}", project, e);
            }
        }
        Ok(None) => debug!("Upstream has no JSON metadata for {}", project),
        Err(e) => {
            metrics::record_upstream_error();
            warn!("Failed to get metadata for {} from upstream: {}", project, e);
        }
    }
}
