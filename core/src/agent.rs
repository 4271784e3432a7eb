//! The in-process side of the sandbox: one [`SandboxAgent`] lives inside
//! every monitored process and is what the OS hook layer calls for each
//! intercepted file-system primitive.
//!
//! The agent never unwinds across the syscall boundary: every failure
//! becomes a report and a disposition.

use std::sync::Arc;
use std::sync::Mutex;

use tracing::trace;
use warden_protocol::ProcessDataReport;
use warden_protocol::ProcessEvent;
use warden_protocol::Report;
use warden_protocol::ReportHeader;

use crate::canonical::CanonicalPath;
use crate::canonical::PathCanonicalizer;
use crate::channel::ReportSink;
use crate::classify::AccessClassifier;
use crate::classify::ClassifierOptions;
use crate::classify::FileOperation;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::manifest::Manifest;
use crate::manifest_wire;
use crate::resolve::ReparseResolver;
use crate::resolve::ResolvedPathCache;

/// What the hook layer should do with the intercepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptDisposition {
    /// Forward the call to the OS unchanged.
    Continue,
    /// Fail the call with the given OS error instead of forwarding it.
    FailCall { error_code: u32 },
}

pub struct SandboxAgent {
    process_id: u32,
    parent_process_id: u32,
    classifier: AccessClassifier,
    sink: ReportSink,
    cwd: Mutex<CanonicalPath>,
}

impl SandboxAgent {
    /// Builds an agent around an already-decoded manifest. The resolved
    /// path cache is created here: one instance per process, shared by
    /// every thread.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manifest: Arc<Manifest>,
        fs: Arc<dyn FileSystem>,
        sink: ReportSink,
        options: ClassifierOptions,
        case_insensitive: bool,
        process_id: u32,
        parent_process_id: u32,
        executable: &str,
        cwd: CanonicalPath,
    ) -> Result<Self> {
        let canonicalizer = PathCanonicalizer::new(case_insensitive);
        let resolver = ReparseResolver::new(
            fs.clone(),
            Arc::new(ResolvedPathCache::new()),
            canonicalizer.clone(),
        );
        let classifier = AccessClassifier::new(manifest, canonicalizer, resolver, fs, options);
        let agent = Self {
            process_id,
            parent_process_id,
            classifier,
            sink,
            cwd: Mutex::new(cwd),
        };
        agent.sink.report(Report::ProcessData(ProcessDataReport {
            header: agent.header(process_id as u64),
            event: ProcessEvent::Start,
            exit_code: 0,
            executable: executable.to_string(),
        }))?;
        Ok(agent)
    }

    /// Builds an agent from the serialized manifest buffer handed over at
    /// process start. Magic, version, and checksum are validated before
    /// anything else happens; a bad buffer aborts injection.
    #[allow(clippy::too_many_arguments)]
    pub fn from_manifest_buffer(
        buffer: &[u8],
        fs: Arc<dyn FileSystem>,
        sink: ReportSink,
        options: ClassifierOptions,
        case_insensitive: bool,
        process_id: u32,
        parent_process_id: u32,
        executable: &str,
        cwd: CanonicalPath,
    ) -> Result<Self> {
        let manifest = manifest_wire::decode(buffer)?;
        Self::new(
            Arc::new(manifest),
            fs,
            sink,
            options,
            case_insensitive,
            process_id,
            parent_process_id,
            executable,
            cwd,
        )
    }

    fn header(&self, thread_id: u64) -> ReportHeader {
        ReportHeader {
            process_id: self.process_id,
            parent_process_id: self.parent_process_id,
            thread_id,
        }
    }

    /// The process changed its working directory; subsequent relative
    /// paths resolve against the new one.
    pub fn set_cwd(&self, cwd: CanonicalPath) {
        if let Ok(mut current) = self.cwd.lock() {
            *current = cwd;
        }
    }

    /// Runs the full intercept pipeline for one call: classify, report,
    /// decide. Cache invalidation for allowed writes happens here, before
    /// the call is forwarded; invalidating early can only cost a
    /// re-resolution, never a stale chain.
    pub fn on_operation(&self, thread_id: u64, op: &FileOperation) -> Result<InterceptDisposition> {
        let cwd = self
            .cwd
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|_| CanonicalPath::unix_root());
        let classification = self.classifier.classify(self.header(thread_id), &cwd, op);

        for report in classification.reports {
            self.sink.report(Report::FileAccess(report))?;
        }

        if let Some(error_code) = classification.fail_call_error {
            trace!("failing {} on {} with {error_code}", op.kind, op.path);
            return Ok(InterceptDisposition::FailCall { error_code });
        }
        let cache = self.classifier.resolver().cache();
        for path in &classification.invalidate {
            cache.invalidate(path);
        }
        Ok(InterceptDisposition::Continue)
    }

    /// Ships a free-form diagnostic line to the controller.
    pub fn debug(&self, thread_id: u64, message: impl Into<String>) -> Result<()> {
        self.sink.report(Report::Debug(warden_protocol::DebugReport {
            header: self.header(thread_id),
            message: message.into(),
        }))
    }

    /// Reports process exit and closes the queue. The caller must await
    /// the writer handle afterwards; exit is only acknowledged once every
    /// queued report has reached the transport.
    pub fn shutdown(&self, exit_code: i32, executable: &str) -> Result<()> {
        self.sink.report(Report::ProcessData(ProcessDataReport {
            header: self.header(self.process_id as u64),
            event: ProcessEvent::Exit,
            exit_code,
            executable: executable.to_string(),
        }))?;
        self.sink.close();
        Ok(())
    }
}
