use thiserror::Error;

/// Failure reported by a [`crate::Vcs`] driver.
#[derive(Debug, Clone, Error)]
pub enum VcsError {
    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("unknown ref: {0}")]
    UnknownRef(String),

    #[error("repository has no refs")]
    EmptyRepository,
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("application name already in use: {0}")]
    DuplicateName(String),

    #[error("invalid application name: {0:?}")]
    InvalidName(String),

    #[error("application not found: {0}")]
    NotFound(String),

    #[error("ref {reference} not found for application {app}")]
    RefNotFound { app: String, reference: String },

    #[error("another operation is in progress for application {0}")]
    Conflict(String),

    /// The switch failed and the previous ref could not be checked out again,
    /// so the directory may hold a partial tree.
    #[error("switching {app} failed ({cause}); restoring {reference} also failed: {restore}")]
    RestoreFailed {
        app: String,
        reference: String,
        cause: VcsError,
        restore: VcsError,
    },

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to persist application registry: {0}")]
    Persist(String),
}

pub type DeployResult<T> = Result<T, DeployError>;
