use crate::{
    address,
    cache::{Artifact, CachedFile},
    error::{OffgridError, Result},
    metrics,
    server::state::AppState,
};
use axum::{
    body::Body,
    extract::{OriginalUri, Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::path::Path as FsPath;
use tokio_util::io::ReaderStream;
use tracing::info;

/// Serve an artifact from the cache, fetching and caching it on a miss.
///
/// The token names the upstream origin; the remaining path is forwarded
/// as received, escapes included. In offline mode a miss is answered with 503.
pub async fn download_file(
    Path((token, path)): Path<(String, String)>,
    OriginalUri(uri): OriginalUri,
    State(state): State<AppState>,
) -> Result<Response> {
    let raw_path = address::split_proxy_path(uri.path(), &state.config.download_endpoint)
        .map(|(_, raw)| raw)
        .unwrap_or(&path);
    let upstream_url = address::resolve_upstream(&token, raw_path)?;
    info!("Download requested for {}", upstream_url);

    if state.offline_mode().await? {
        let cached = state.cache.lookup(&upstream_url).await?;
        if !cached.exists {
            metrics::record_cache_miss();
            return Err(OffgridError::Offline(format!(
                "{upstream_url} is not cached"
            )));
        }
        metrics::record_cache_hit();
        return serve_cached(cached).await;
    }

    let upstream = state.upstream.clone();
    let artifact = state
        .cache
        .fetch_through(&upstream_url, || async {
            upstream.open_download(&upstream_url).await
        })
        .await
        .inspect_err(|e| {
            if matches!(e, OffgridError::UpstreamUnavailable { .. }) {
                metrics::record_upstream_error();
            }
        })?;

    match artifact {
        Artifact::Cached(cached) => {
            metrics::record_cache_hit();
            serve_cached(cached).await
        }
        Artifact::Streaming {
            content_type,
            content_length,
            body,
        } => {
            metrics::record_cache_miss();
            let content_type = content_type.unwrap_or_else(|| guess_content_type(&path).to_string());

            let mut response = Response::new(Body::from_stream(body));
            set_content_type(&mut response, &content_type);
            if let Some(len) = content_length {
                response
                    .headers_mut()
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
            Ok(response)
        }
    }
}

async fn serve_cached(cached: CachedFile) -> Result<Response> {
    let file = tokio::fs::File::open(&cached.path).await?;
    let content_type = guess_content_type(&cached.path);

    let mut response = (StatusCode::OK, Body::from_stream(ReaderStream::new(file))).into_response();
    set_content_type(&mut response, content_type);
    if let Some(size) = cached.size {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    Ok(response)
}

fn set_content_type(response: &mut Response, content_type: &str) {
    let value = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    response.headers_mut().insert(header::CONTENT_TYPE, value);
}

/// Content type from the file extension, `application/octet-stream` if unknown.
pub fn guess_content_type(path: impl AsRef<FsPath>) -> &'static str {
    let name = path
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".gz") {
        "application/gzip"
    } else if name.ends_with(".whl") || name.ends_with(".zip") || name.ends_with(".egg") {
        "application/zip"
    } else if name.ends_with(".tar.bz2") || name.ends_with(".bz2") {
        "application/x-bzip2"
    } else if name.ends_with(".tar") {
        "application/x-tar"
    } else if name.ends_with(".json") {
        "application/json"
    } else if name.ends_with(".html") || name.ends_with(".htm") {
        "text/html"
    } else if name.ends_with(".txt") || name.ends_with(".metadata") {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_guesses() {
        assert_eq!(guess_content_type("a/demo-1.0.tar.gz"), "application/gzip");
        assert_eq!(guess_content_type("demo-1.0-py3-none-any.whl"), "application/zip");
        assert_eq!(
            guess_content_type("demo-1.0-py3-none-any.whl.metadata"),
            "text/plain"
        );
        assert_eq!(guess_content_type("DEMO.ZIP"), "application/zip");
        assert_eq!(guess_content_type("demo.exe"), "application/octet-stream");
        assert_eq!(guess_content_type(""), "application/octet-stream");
    }
}
