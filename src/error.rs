//! Error taxonomy shared by the resolution engine and the HTTP layer.

use thiserror::Error;

/// Every way a resolution or cache operation can fail in a caller-visible
/// manner. Relay health failures are deliberately absent: they only ever
/// demote a request to the next source.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("podcast not found: {0}")]
    NotFound(String),

    #[error("no remote source available for {0}")]
    NoSourceAvailable(String),

    #[error("download failed for {id}: {reason}")]
    DownloadFailed { id: String, reason: String },

    #[error("catalog unavailable: {0}")]
    Catalog(#[source] anyhow::Error),

    #[error("cache directory error: {0}")]
    Cache(#[source] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ResolveError {
    /// HTTP status code the API surface maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            ResolveError::NotFound(_) => 404,
            ResolveError::NoSourceAvailable(_) => 400,
            ResolveError::DownloadFailed { .. }
            | ResolveError::Catalog(_)
            | ResolveError::Cache(_)
            | ResolveError::Internal(_) => 500,
        }
    }
}

pub type ResolveResult<T> = Result<T, ResolveError>;
