mod controller;
mod scenarios;

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use warden_core::Result;
use warden_core::agent::SandboxAgent;
use warden_core::canonical::CanonicalPath;
use warden_core::channel::DEFAULT_QUEUE_CAPACITY;
use warden_core::channel::spawn_report_writer;
use warden_core::classify::ClassifierOptions;
use warden_core::fs::MemFileSystem;
use warden_core::manifest::Manifest;
use warden_protocol::AccessReport;
use warden_protocol::Report;
use warden_protocol::ReportDecoder;

pub(crate) fn p(s: &str) -> CanonicalPath {
    CanonicalPath::from_canonical(s).expect("canonical")
}

/// One agent wired to an in-memory filesystem and an in-memory transport,
/// the way an injected hook layer would host it.
pub(crate) struct AgentHarness {
    pub fs: Arc<MemFileSystem>,
    pub agent: SandboxAgent,
    reader: DuplexStream,
    writer: JoinHandle<Result<()>>,
}

impl AgentHarness {
    pub fn new(manifest: Manifest, options: ClassifierOptions) -> Self {
        let fs = Arc::new(MemFileSystem::new());
        let (transport, reader) = tokio::io::duplex(64 * 1024);
        let (sink, writer) = spawn_report_writer(transport, DEFAULT_QUEUE_CAPACITY);
        let agent = SandboxAgent::new(
            Arc::new(manifest),
            fs.clone(),
            sink,
            options,
            false,
            100,
            1,
            "/usr/bin/pip-under-test",
            p("/work"),
        )
        .expect("agent start report fits the queue");
        Self {
            fs,
            agent,
            reader,
            writer,
        }
    }

    /// Shuts the agent down and returns every file-access record that hit
    /// the wire, in arrival order.
    pub async fn finish(self) -> Vec<AccessReport> {
        self.agent.shutdown(0, "/usr/bin/pip-under-test").expect("exit report fits");
        self.writer
            .await
            .expect("writer task")
            .expect("transport flushed");

        let mut reader = self.reader;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.expect("transport readable");
        let mut decoder = ReportDecoder::new();
        decoder.extend(&bytes);

        let mut accesses = Vec::new();
        while let Some(report) = decoder.next_record().expect("well-formed stream") {
            if let Report::FileAccess(access) = report {
                accesses.push(access);
            }
        }
        accesses
    }
}
