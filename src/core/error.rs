use http::StatusCode;
use thiserror::Error;

/// Errors surfaced at the job manager boundary.
#[derive(Debug, Error)]
pub enum LogiconError
{
    #[error("Job [{0}] does not exist.")]
    JobNotFound(String),

    #[error("Job with name [{0}] already exists.")]
    JobExists(String),

    #[error("Invalid job manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A transition was requested whose preconditions do not hold (yet).
    #[error("{0}")]
    Precondition(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LogiconError
{
    pub fn status_code(&self) -> StatusCode
    {
        match self
        {
            LogiconError::JobNotFound(_) => StatusCode::NOT_FOUND,
            LogiconError::JobExists(_) => StatusCode::CONFLICT,
            LogiconError::InvalidManifest(_) | LogiconError::InvalidRequest(_) =>
            {
                StatusCode::BAD_REQUEST
            }
            LogiconError::Precondition(_) => StatusCode::FORBIDDEN,
            LogiconError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str
    {
        match self
        {
            LogiconError::JobNotFound(_) => "job_not_found",
            LogiconError::JobExists(_) => "job_exists",
            LogiconError::InvalidManifest(_) => "invalid_manifest",
            LogiconError::InvalidRequest(_) => "invalid_request",
            LogiconError::Precondition(_) => "precondition",
            LogiconError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, LogiconError>;
