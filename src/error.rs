//! Error types shared across the supervisor.
//!
//! Request-level failures never terminate the process: they are written into
//! the request entry, appended to history and surfaced through the history
//! endpoint. Deployment-level failures are reported synchronously at `/deploy`.

use serde_json::Value;
use thiserror::Error;

/// Failure while reconciling declared file mounts with the files actually
/// available for a run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MountError {
    /// A required mount has no source in the deployment data files nor in the
    /// files uploaded with the request.
    #[error("missing input file \"{0}\"")]
    MissingInputFile(String),
    /// The request uploaded a file under a path that no execution-stage mount
    /// declares.
    #[error("unexpected input file \"{0}\"")]
    UnexpectedInputFile(String),
    /// An execution-stage upload collides with a deployment-stage path.
    #[error("input file already mapped to \"{0}\"")]
    DuplicateMount(String),
}

/// Collected non-2xx responses (or transport errors) from pulling a module
/// binary or its data files. One entry per failed URL.
#[derive(Debug, Default)]
pub struct FetchFailures {
    pub errors: Vec<Value>,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Malformed deployment descriptor, unknown media type or schema mismatch.
    #[error("invalid deployment descriptor: {0}")]
    Descriptor(String),

    #[error("{} fetch failure(s) while pulling deployment artifacts", .0.errors.len())]
    Fetch(FetchFailures),

    #[error("module load failed: {0}")]
    ModuleLoad(String),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error("memory access failed: {0}")]
    Memory(String),

    #[error("invocation failed: {0}")]
    Invocation(String),

    #[error("sub-call failed: {0}")]
    SubCall(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}
