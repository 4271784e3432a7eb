//! The out-of-process side: spawns the root process, multiplexes the
//! report stream from the whole tree, and assembles the final result.

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::warn;
use warden_protocol::AccessReport;
use warden_protocol::FileAccessStatus;
use warden_protocol::ProcessEvent;
use warden_protocol::Report;
use warden_protocol::ReportDecoder;
use warden_protocol::RequestedAccess;

use crate::canonical::CanonicalPath;
use crate::classify::ClassifierOptions;
use crate::error::Result;
#[cfg(unix)]
use crate::error::SandboxErr;
use crate::error::WardenErr;
use crate::manifest::Manifest;

const SIGKILL_CODE: i32 = 9;
const TIMEOUT_CODE: i32 = 64;

/// How long after root-process exit the controller waits for the rest of
/// the tree to flush and close the transport.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One unit of work: a process invocation plus everything needed to run
/// it under the sandbox.
#[derive(Debug, Clone)]
pub struct PipDefinition {
    pub executable: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
    /// `None` means no wall-clock bound.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxOptions {
    /// Denied accesses fail the offending call inside the agent.
    pub fail_unexpected_file_accesses: bool,
    /// Denied accesses turn a completed pip into a failed one.
    pub unexpected_accesses_are_errors: bool,
    /// Directory creation over an existing directory counts as a write.
    pub enforce_creation_policy: bool,
}

impl SandboxOptions {
    pub fn classifier_options(&self) -> ClassifierOptions {
        ClassifierOptions {
            fail_unexpected_file_accesses: self.fail_unexpected_file_accesses,
            enforce_creation_policy: self.enforce_creation_policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxedProcessStatus {
    Succeeded,
    ExecutionFailed,
    TimedOut,
    Cancelled,
}

/// Everything observed while the pip ran.
#[derive(Debug)]
pub struct SandboxedProcessResult {
    pub exit_code: i32,
    pub status: SandboxedProcessStatus,
    pub accesses: Vec<AccessReport>,
    /// Denied accesses. Whether these fail the build is the scheduler's
    /// call, steered by [`SandboxOptions::unexpected_accesses_are_errors`].
    pub violations: Vec<AccessReport>,
    /// Directory path -> names the enumeration returned, for the
    /// observed-input fingerprint.
    pub observed_directory_enumerations: HashMap<String, Vec<String>>,
    /// Child pid -> parent pid for every process that reported in.
    pub process_tree: HashMap<u32, u32>,
}

/// Observes each report as it is decoded, before aggregation. Handed in at
/// construction; there is no global registration.
pub trait AccessListener: Send + Sync {
    fn on_report(&self, _report: &Report) {}
}

#[derive(Debug, Clone, Copy)]
pub enum StdioPolicy {
    /// Detach the pip from the controller's stdio. Build output is
    /// captured by the pip's own redirections, not by the sandbox.
    RedirectForPip,
    Inherit,
}

pub struct Controller {
    options: SandboxOptions,
    stdio_policy: StdioPolicy,
    listener: Option<Arc<dyn AccessListener>>,
}

impl Controller {
    pub fn new(options: SandboxOptions) -> Self {
        Self {
            options,
            stdio_policy: StdioPolicy::RedirectForPip,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn AccessListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_stdio_policy(mut self, stdio_policy: StdioPolicy) -> Self {
        self.stdio_policy = stdio_policy;
        self
    }

    /// The buffer the injector hands to every agent in the tree. Encoding
    /// happens once per pip, not per process.
    pub fn manifest_buffer(&self, manifest: &Manifest) -> bytes::Bytes {
        crate::manifest_wire::encode(manifest)
    }

    /// Runs the pip to completion: spawns the root process, consumes the
    /// report transport until EOF, enforces timeout and cancellation, and
    /// aggregates the observations.
    ///
    /// `transport` is the read half of whatever channel the injected
    /// agents write to (named pipe, anonymous pipe, message queue).
    pub async fn run<R>(
        &self,
        pip: &PipDefinition,
        transport: R,
        ctrl_c: Arc<Notify>,
    ) -> Result<SandboxedProcessResult>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut child = self.spawn_root(pip).map_err(WardenErr::Launch)?;

        let listener = self.listener.clone();
        let reader = tokio::spawn(async move { read_reports(transport, listener).await });

        let interrupted = ctrl_c.notified();
        let mut status = SandboxedProcessStatus::Succeeded;
        let exit_status = match pip.timeout {
            Some(timeout) => {
                tokio::select! {
                    result = tokio::time::timeout(timeout, child.wait()) => {
                        match result {
                            Ok(wait_result) => wait_result?,
                            Err(_) => {
                                status = SandboxedProcessStatus::TimedOut;
                                kill_tree(&mut child)?;
                                synthetic_exit_status(128 + TIMEOUT_CODE)
                            }
                        }
                    }
                    _ = interrupted => {
                        status = SandboxedProcessStatus::Cancelled;
                        kill_tree(&mut child)?;
                        synthetic_exit_status(128 + SIGKILL_CODE)
                    }
                }
            }
            None => {
                tokio::select! {
                    wait_result = child.wait() => wait_result?,
                    _ = interrupted => {
                        status = SandboxedProcessStatus::Cancelled;
                        kill_tree(&mut child)?;
                        synthetic_exit_status(128 + SIGKILL_CODE)
                    }
                }
            }
        };

        // Every process has exited (or been killed); the agents now flush
        // and close the transport. A tree that never does is a transport
        // failure, not a hang.
        let (reports, drained) = match tokio::time::timeout(DRAIN_TIMEOUT, reader).await {
            Ok(joined) => joined?,
            Err(_) => {
                warn!("report transport did not close after process exit");
                if status == SandboxedProcessStatus::Succeeded {
                    status = SandboxedProcessStatus::ExecutionFailed;
                }
                (Vec::new(), false)
            }
        };
        if !drained && status == SandboxedProcessStatus::Succeeded {
            status = SandboxedProcessStatus::ExecutionFailed;
        }

        // A root process that died of a signal on its own (not one of our
        // synthetic kill statuses) is surfaced as such rather than folded
        // into an ambiguous -1 exit code.
        #[cfg(unix)]
        if status == SandboxedProcessStatus::Succeeded
            && let Some(signal) = exit_status.signal()
        {
            return Err(SandboxErr::Signal(signal).into());
        }

        let exit_code = exit_status.code().unwrap_or(-1);
        let mut result = aggregate(reports, exit_code, status);
        if self.options.unexpected_accesses_are_errors
            && !result.violations.is_empty()
            && result.status == SandboxedProcessStatus::Succeeded
        {
            result.status = SandboxedProcessStatus::ExecutionFailed;
        }
        Ok(result)
    }

    fn spawn_root(&self, pip: &PipDefinition) -> io::Result<Child> {
        if pip.executable.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "pip executable is empty",
            ));
        }
        let mut cmd = Command::new(&pip.executable);
        cmd.args(&pip.args);
        cmd.current_dir(&pip.cwd);

        // Override variables individually rather than `env_clear()`: a
        // cleared environment interacts badly with some platform sandbox
        // layers, and the surgical form keeps the diff observable.
        let mut remaining_overrides = pip.env.clone();
        for (key, current_val) in std::env::vars() {
            if let Some(desired_val) = remaining_overrides.remove(&key)
                && desired_val != current_val
            {
                cmd.env(&key, desired_val);
            }
        }
        for (key, val) in remaining_overrides {
            cmd.env(key, val);
        }

        match self.stdio_policy {
            StdioPolicy::RedirectForPip => {
                // No stdin: a pip waiting on console input would hang the
                // whole schedule.
                cmd.stdin(Stdio::null());
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
            StdioPolicy::Inherit => {
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
        }

        cmd.kill_on_drop(true).spawn()
    }
}

fn kill_tree(child: &mut Child) -> Result<()> {
    child.start_kill()?;
    Ok(())
}

/// Decodes the transport until EOF. Returns the reports plus whether the
/// stream ended cleanly.
async fn read_reports<R>(
    mut transport: R,
    listener: Option<Arc<dyn AccessListener>>,
) -> (Vec<Report>, bool)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = ReportDecoder::new();
    let mut reports = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        match transport.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                decoder.extend(&chunk[..n]);
                loop {
                    match decoder.next_record() {
                        Ok(Some(report)) => {
                            if let Some(listener) = &listener {
                                listener.on_report(&report);
                            }
                            reports.push(report);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("corrupt report stream: {e}");
                            return (reports, false);
                        }
                    }
                }
            }
            Err(e) => {
                warn!("report transport read failed: {e}");
                return (reports, false);
            }
        }
    }
    (reports, true)
}

fn aggregate(
    reports: Vec<Report>,
    exit_code: i32,
    status: SandboxedProcessStatus,
) -> SandboxedProcessResult {
    let mut accesses = Vec::new();
    let mut violations = Vec::new();
    let mut enumerations: HashMap<String, Vec<String>> = HashMap::new();
    let mut process_tree = HashMap::new();

    for report in reports {
        match report {
            Report::FileAccess(access) => {
                if access.requested_access == RequestedAccess::ENUMERATE {
                    enumerations.entry(access.path.clone()).or_default();
                } else if access.requested_access == RequestedAccess::ENUMERATION_PROBE
                    && let Some(path) = CanonicalPath::from_canonical(&access.path)
                    && let (Some(parent), Some(name)) = (path.parent(), path.last_atom())
                {
                    enumerations
                        .entry(parent.to_string())
                        .or_default()
                        .push(name.to_string());
                }
                if access.status == FileAccessStatus::Denied {
                    violations.push(access.clone());
                }
                accesses.push(access);
            }
            Report::ProcessData(data) => {
                if data.event == ProcessEvent::Start {
                    process_tree.insert(data.header.process_id, data.header.parent_process_id);
                }
            }
            Report::Debug(_) => {}
        }
    }

    SandboxedProcessResult {
        exit_code,
        status,
        accesses,
        violations,
        observed_directory_enumerations: enumerations,
        process_tree,
    }
}

#[cfg(unix)]
fn synthetic_exit_status(code: i32) -> ExitStatus {
    ExitStatus::from_raw(code)
}

#[cfg(windows)]
fn synthetic_exit_status(code: i32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    #[expect(clippy::unwrap_used)]
    ExitStatus::from_raw(code.try_into().unwrap())
}
