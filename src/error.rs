use std::io;

use thiserror::Error;

/// Why a simulated operation failed.
///
/// The first three variants are the failures the demo operations know about. Anything else lands
/// in [`ErrorKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    #[error("first api call failed")]
    First,
    #[error("second api call failed")]
    Second,
    #[error("third api call failed")]
    Third,
    #[error("unclassified failure: {0}")]
    Other(String),
}

/// The error type of this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A [`NamedOperation`][crate::NamedOperation] ran to completion and failed.
    #[error("operation '{name}' failed: {kind}")]
    Operation { name: String, kind: ErrorKind },

    /// The work was cancelled at a suspension point.
    #[error("cancelled")]
    Cancelled,

    /// The execution context (a region, the main context or the pool) is gone.
    #[error("execution context '{0}' has shut down")]
    ContextClosed(String),

    /// An awaited region call was made from a thread that is itself running a region job.
    ///
    /// Blocking there could deadlock if the target region hops back; use
    /// [`RegionHandle::dispatch`][crate::RegionHandle::dispatch] instead.
    #[error("cannot wait on region '{to}' from inside region '{from}', dispatch instead")]
    NestedAccess { from: String, to: String },

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),
}

impl Error {
    /// Returns the [`ErrorKind`] recorded for this error in a task group outcome.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Operation { kind, .. } => kind.clone(),
            other => ErrorKind::Other(other.to_string()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
