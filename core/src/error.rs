use std::io;
use thiserror::Error;
use tokio::task::JoinError;

use crate::canonical::PathError;
use crate::resolve::ResolutionError;

pub type Result<T> = std::result::Result<T, WardenErr>;

#[derive(Error, Debug)]
pub enum SandboxErr {
    /// The report channel dropped a record or the writer went away while
    /// the agent still had reports to send. Fatal to the sandbox instance.
    #[error("report channel lost a record: {0}")]
    ReportLost(String),

    /// The pip exceeded its wall-clock limit and the tree was killed.
    #[error("pip timed out")]
    Timeout,

    /// The controller was asked to cancel and tore the tree down.
    #[error("pip was cancelled")]
    Cancelled,

    /// The root process was killed by a signal.
    #[error("root process was killed by signal {0}")]
    Signal(i32),
}

#[derive(Error, Debug)]
pub enum WardenErr {
    /// The root process could not be spawned or the agent could not be
    /// injected. No accesses were observed.
    #[error("failed to launch root process: {0}")]
    Launch(io::Error),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxErr),

    #[error("{0}")]
    Path(#[from] PathError),

    #[error("{0}")]
    Resolution(#[from] ResolutionError),

    /// Manifest buffer or report stream failed to parse.
    #[error("wire error: {0}")]
    Wire(#[from] warden_protocol::WireError),

    #[error("manifest error: {0}")]
    Manifest(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}
