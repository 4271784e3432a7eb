//! Root of the `warden-core` library: the policy-manifest data model, the
//! interception/resolution/reporting pipeline, and the controller that
//! runs a pip's process tree under observation.

// Prevent accidental direct writes to stdout/stderr in library code. All
// diagnostics go through the tracing stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod agent;
pub mod canonical;
pub mod channel;
pub mod classify;
pub mod controller;
pub mod error;
pub mod fs;
pub mod manifest;
pub mod manifest_wire;
pub mod resolve;
pub mod translate;

pub use agent::InterceptDisposition;
pub use agent::SandboxAgent;
pub use canonical::CanonicalPath;
pub use canonical::PathCanonicalizer;
pub use channel::ReportSink;
pub use channel::spawn_report_writer;
pub use classify::AccessVerdict;
pub use classify::FileOperation;
pub use controller::Controller;
pub use controller::PipDefinition;
pub use controller::SandboxOptions;
pub use controller::SandboxedProcessResult;
pub use controller::SandboxedProcessStatus;
pub use error::Result;
pub use error::SandboxErr;
pub use error::WardenErr;
pub use manifest::Manifest;
pub use manifest::PathPolicy;
pub use manifest::PolicyBits;
pub use manifest::build_manifest;
