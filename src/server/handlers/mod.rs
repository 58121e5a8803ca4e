pub mod cache_status;
pub mod download;
pub mod health;
pub mod simple;
pub mod webapi;

use crate::error::{OffgridError, Result};
use crate::models::is_valid_project_name;

/// Reject names that could never be a project before touching store or upstream.
pub(crate) fn checked_project(project: &str) -> Result<&str> {
    if is_valid_project_name(project) {
        Ok(project)
    } else {
        Err(OffgridError::NotFound(format!("Project {project} not found")))
    }
}
