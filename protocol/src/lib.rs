//! Wire contract between the injected sandbox agent and the controller.
//!
//! This crate deliberately contains no I/O: it defines the record types and
//! the framing codec, and nothing else, so the agent can link it without
//! dragging in the controller's runtime.

mod access;
mod report;

pub use access::FileAccessStatus;
pub use access::OperationKind;
pub use access::ReportKind;
pub use access::RequestedAccess;
pub use report::AccessReport;
pub use report::DebugReport;
pub use report::MAX_RECORD_LEN;
pub use report::ProcessDataReport;
pub use report::ProcessEvent;
pub use report::Report;
pub use report::ReportDecoder;
pub use report::ReportHeader;
pub use report::WireError;
