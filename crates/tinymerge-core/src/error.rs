use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, MergeError>;

/// Everything that can go wrong while publishing a tree.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{op} {}: not found", path.display())]
    NotFound { op: &'static str, path: PathBuf },

    #[error("{}: not a directory", path.display())]
    NotADirectory { path: PathBuf },

    #[error("{}: is a directory", path.display())]
    IsADirectory { path: PathBuf },

    #[error("{}: already exists", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("merge cancelled")]
    Cancelled,

    #[error("merge deadline exceeded")]
    DeadlineExceeded,

    #[error("merge task failed: {0}")]
    TaskFailed(String),

    /// The merge failed and at least one compensating action failed too.
    /// The destination may be inconsistent.
    #[error("{cause}; {failures}")]
    RollbackFailure {
        cause: Box<MergeError>,
        failures: RollbackFailure,
    },
}

impl MergeError {
    /// Classify an I/O error by kind, keeping the operation and path.
    pub fn io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { op, path },
            io::ErrorKind::AlreadyExists => Self::AlreadyExists { path },
            _ => Self::Io { op, path, source },
        }
    }

    /// Shorthand for `map_err(MergeError::with(op, path))`.
    pub fn with<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
        move |e| Self::io(op, path, e)
    }

    /// True for the errors a worker returns after observing cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// One compensating action that could not be applied.
#[derive(Debug)]
pub struct FailedUndo {
    pub description: String,
    pub error: MergeError,
}

/// All undo failures from a single ledger replay.
#[derive(Debug, Default)]
pub struct RollbackFailure {
    pub failures: Vec<FailedUndo>,
}

impl RollbackFailure {
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rollback failed for {} action(s)", self.failures.len())?;
        for failed in &self.failures {
            write!(f, "\n  {}: {}", failed.description, failed.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for RollbackFailure {}
