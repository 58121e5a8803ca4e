use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

pub type Result<T> = std::result::Result<T, OffgridError>;

#[derive(Error, Debug)]
pub enum OffgridError {
    /// Proxy token could not be turned back into an upstream origin
    #[error("Malformed proxy token: {0}")]
    Decode(String),

    #[error("Invalid artifact path: {0}")]
    InvalidPath(String),

    /// Every attempt against the upstream index failed
    #[error("Upstream unavailable after {attempts} attempt(s) for {url}: {source}")]
    UpstreamUnavailable {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    /// The upstream connection broke after the first byte was sent
    #[error("Download failed for {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Offline mode is enabled: {0} is not cached")]
    Offline(String),

    #[error("Invalid project metadata: {0}")]
    InvalidMetadata(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OffgridError {
    /// HTTP status the calling layer answers with for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            OffgridError::Decode(_) | OffgridError::NotFound(_) => StatusCode::NOT_FOUND,
            OffgridError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            OffgridError::UpstreamUnavailable { .. } | OffgridError::Offline(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OffgridError::DownloadFailed { .. } => StatusCode::BAD_GATEWAY,
            OffgridError::InvalidMetadata(_)
            | OffgridError::Database(_)
            | OffgridError::Io(_)
            | OffgridError::HttpClient(_)
            | OffgridError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OffgridError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed with {}: {}", status, self);
        } else {
            warn!("Request rejected with {}: {}", status, self);
        }

        (status, format!("{}\n", self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_and_not_found_map_to_404() {
        assert_eq!(
            OffgridError::Decode("!!".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            OffgridError::NotFound("requests".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn offline_and_download_failures_are_distinct() {
        assert_eq!(
            OffgridError::Offline("x".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            OffgridError::DownloadFailed {
                url: "https://files.example.com/a.whl".to_string(),
                reason: "connection reset".to_string(),
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn io_error_converts() {
        let err: OffgridError = std::io::Error::other("disk full").into();
        assert!(matches!(err, OffgridError::Io(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
