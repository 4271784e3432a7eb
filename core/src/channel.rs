//! The agent side of the report stream: a bounded in-process queue drained
//! by a background writer that frames records onto the transport.
//!
//! Ordering: one queue per process, so reports from a single thread reach
//! the controller in program order. Back-pressure: a full queue blocks the
//! intercepted call until the writer catches up; the sandbox never drops a
//! record silently.

use std::collections::HashSet;
use std::sync::Mutex;

use bytes::BytesMut;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::trace;
use tracing::warn;
use warden_protocol::FileAccessStatus;
use warden_protocol::OperationKind;
use warden_protocol::Report;
use warden_protocol::RequestedAccess;

use crate::error::Result;
use crate::error::SandboxErr;

/// Hard bound on queued-but-unwritten reports per process.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// The writer coalesces whatever is already queued into batches of roughly
/// this size before touching the transport.
const FLUSH_THRESHOLD: usize = 16 * 1024;

type DedupKey = (String, OperationKind, RequestedAccess, FileAccessStatus);

/// Producer half handed to the agent. Cheap to clone; all clones feed the
/// same writer.
#[derive(Clone)]
pub struct ReportSink {
    tx: async_channel::Sender<Report>,
    seen: std::sync::Arc<Mutex<HashSet<DedupKey>>>,
}

impl ReportSink {
    /// Enqueues one report from hook context, blocking when the queue is
    /// full. Identical file accesses within this process are coalesced;
    /// the first occurrence (and its error code) is the one that ships.
    pub fn report(&self, report: Report) -> Result<()> {
        if self.is_duplicate(&report) {
            return Ok(());
        }
        self.tx
            .send_blocking(report)
            .map_err(|e| SandboxErr::ReportLost(e.to_string()).into())
    }

    /// Async flavor of [`ReportSink::report`] for callers already on the
    /// runtime.
    pub async fn report_async(&self, report: Report) -> Result<()> {
        if self.is_duplicate(&report) {
            return Ok(());
        }
        self.tx
            .send(report)
            .await
            .map_err(|e| SandboxErr::ReportLost(e.to_string()).into())
    }

    fn is_duplicate(&self, report: &Report) -> bool {
        let Report::FileAccess(access) = report else {
            return false;
        };
        match self.seen.lock() {
            Ok(mut seen) => !seen.insert(access.dedup_key()),
            // A poisoned dedup set only costs duplicate records.
            Err(_) => false,
        }
    }

    /// Closes the queue. Already-enqueued reports still reach the
    /// transport; the writer exits once they have.
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Spawns the background writer and returns the sink feeding it. The
/// returned handle resolves once the queue is closed and fully flushed;
/// process exit must await it before being acknowledged.
pub fn spawn_report_writer<W>(mut transport: W, capacity: usize) -> (ReportSink, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, rx) = async_channel::bounded::<Report>(capacity);
    let handle = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(FLUSH_THRESHOLD);
        while let Ok(report) = rx.recv().await {
            report.encode_into(&mut buf);
            // Opportunistically batch whatever else is already queued.
            while buf.len() < FLUSH_THRESHOLD {
                match rx.try_recv() {
                    Ok(next) => next.encode_into(&mut buf),
                    Err(_) => break,
                }
            }
            trace!("flushing {} report bytes", buf.len());
            if let Err(e) = transport.write_all(&buf).await {
                warn!("report transport write failed: {e}");
                rx.close();
                return Err(SandboxErr::ReportLost(e.to_string()).into());
            }
            transport.flush().await.map_err(crate::error::WardenErr::Io)?;
            buf.clear();
        }
        // Queue closed and drained: tell the controller we are done.
        transport.shutdown().await.map_err(crate::error::WardenErr::Io)?;
        Ok(())
    });
    (
        ReportSink {
            tx,
            seen: std::sync::Arc::new(Mutex::new(HashSet::new())),
        },
        handle,
    )
}
