//! Controller tests: real child processes, simulated agents on an
//! in-memory transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::Notify;
use warden_core::channel::DEFAULT_QUEUE_CAPACITY;
use warden_core::channel::spawn_report_writer;
use warden_core::controller::Controller;
use warden_core::controller::PipDefinition;
use warden_core::controller::SandboxOptions;
use warden_core::controller::SandboxedProcessStatus;
use warden_protocol::AccessReport;
use warden_protocol::FileAccessStatus;
use warden_protocol::OperationKind;
use warden_protocol::ProcessDataReport;
use warden_protocol::ProcessEvent;
use warden_protocol::Report;
use warden_protocol::ReportHeader;
use warden_protocol::RequestedAccess;

fn sh(script: &str, timeout: Option<Duration>) -> PipDefinition {
    PipDefinition {
        executable: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: HashMap::new(),
        cwd: std::env::temp_dir(),
        timeout,
    }
}

fn header(pid: u32) -> ReportHeader {
    ReportHeader {
        process_id: pid,
        parent_process_id: 1,
        thread_id: pid as u64,
    }
}

fn access(pid: u32, path: &str, status: FileAccessStatus) -> Report {
    Report::FileAccess(AccessReport {
        header: header(pid),
        operation: OperationKind::CreateFile,
        requested_access: RequestedAccess::READ,
        status,
        explicitly_reported: true,
        error_code: 0,
        desired_access: 0,
        share_mode: 0,
        creation_disposition: 0,
        flags_and_attributes: 0,
        path: path.to_string(),
        enumerate_pattern: String::new(),
    })
}

fn process_event(pid: u32, event: ProcessEvent) -> Report {
    Report::ProcessData(ProcessDataReport {
        header: header(pid),
        event,
        exit_code: 0,
        executable: "/usr/bin/cc".to_string(),
    })
}

/// Plays the role of the injected tree: emits the given reports, then
/// flushes and closes the transport.
fn simulate_agent(
    transport: tokio::io::DuplexStream,
    reports: Vec<Report>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (sink, writer) = spawn_report_writer(transport, DEFAULT_QUEUE_CAPACITY);
        for report in reports {
            sink.report_async(report).await.expect("queue open");
        }
        sink.close();
        writer.await.expect("writer task").expect("clean flush");
    })
}

#[cfg(unix)]
#[tokio::test]
async fn completed_pip_returns_exit_code_and_accesses() {
    let (agent_side, controller_side) = tokio::io::duplex(64 * 1024);
    let agent = simulate_agent(
        agent_side,
        vec![
            process_event(100, ProcessEvent::Start),
            access(100, "/repo/in.txt", FileAccessStatus::Allowed),
            process_event(100, ProcessEvent::Exit),
        ],
    );

    let controller = Controller::new(SandboxOptions::default());
    let result = controller
        .run(&sh("exit 7", None), controller_side, Arc::new(Notify::new()))
        .await
        .expect("pip ran");
    agent.await.expect("agent task");

    assert_eq!(result.exit_code, 7);
    assert_eq!(result.status, SandboxedProcessStatus::Succeeded);
    assert_eq!(result.accesses.len(), 1);
    assert_eq!(result.accesses[0].path, "/repo/in.txt");
    assert!(result.violations.is_empty());
    assert_eq!(result.process_tree.get(&100), Some(&1));
}

#[cfg(unix)]
#[tokio::test]
async fn denied_accesses_become_violations() {
    let (agent_side, controller_side) = tokio::io::duplex(64 * 1024);
    let agent = simulate_agent(
        agent_side,
        vec![
            access(100, "/repo/in.txt", FileAccessStatus::Allowed),
            access(100, "/secret/key", FileAccessStatus::Denied),
        ],
    );

    let controller = Controller::new(SandboxOptions {
        unexpected_accesses_are_errors: true,
        ..Default::default()
    });
    let result = controller
        .run(&sh("exit 0", None), controller_side, Arc::new(Notify::new()))
        .await
        .expect("pip ran");
    agent.await.expect("agent task");

    assert_eq!(result.exit_code, 0);
    // The pip completed, but the violation fails it.
    assert_eq!(result.status, SandboxedProcessStatus::ExecutionFailed);
    assert_eq!(result.violations.len(), 1);
    assert_eq!(result.violations[0].path, "/secret/key");
}

#[cfg(unix)]
#[tokio::test]
async fn timed_out_pip_is_killed_and_marked() {
    let (agent_side, controller_side) = tokio::io::duplex(64 * 1024);
    let agent = simulate_agent(agent_side, vec![process_event(100, ProcessEvent::Start)]);

    let controller = Controller::new(SandboxOptions::default());
    let result = controller
        .run(
            &sh("sleep 30", Some(Duration::from_millis(200))),
            controller_side,
            Arc::new(Notify::new()),
        )
        .await
        .expect("pip ran");
    agent.await.expect("agent task");

    assert_eq!(result.status, SandboxedProcessStatus::TimedOut);
    assert_eq!(result.exit_code, -1);
    // Partial reports are preserved.
    assert_eq!(result.process_tree.get(&100), Some(&1));
}

#[cfg(unix)]
#[tokio::test]
async fn cancellation_kills_the_tree() {
    let (agent_side, controller_side) = tokio::io::duplex(64 * 1024);
    let agent = simulate_agent(agent_side, vec![]);

    let ctrl_c = Arc::new(Notify::new());
    let canceller = ctrl_c.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.notify_one();
    });

    let controller = Controller::new(SandboxOptions::default());
    let result = controller
        .run(&sh("sleep 30", None), controller_side, ctrl_c)
        .await
        .expect("pip ran");
    agent.await.expect("agent task");

    assert_eq!(result.status, SandboxedProcessStatus::Cancelled);
}

#[cfg(unix)]
#[tokio::test]
async fn root_process_killed_by_signal_surfaces_as_signal_error() {
    let (agent_side, controller_side) = tokio::io::duplex(64 * 1024);
    let agent = simulate_agent(agent_side, vec![]);

    let controller = Controller::new(SandboxOptions::default());
    let err = controller
        .run(
            &sh("kill -9 $$", None),
            controller_side,
            Arc::new(Notify::new()),
        )
        .await
        .expect_err("a signal death is not a normal completion");
    agent.await.expect("agent task");

    assert!(matches!(
        err,
        warden_core::WardenErr::Sandbox(warden_core::SandboxErr::Signal(9))
    ));
}

#[tokio::test]
async fn missing_executable_is_a_launch_error() {
    let (_agent_side, controller_side) = tokio::io::duplex(1024);
    let controller = Controller::new(SandboxOptions::default());
    let pip = PipDefinition {
        executable: "/nonexistent/tool-xyz".to_string(),
        args: vec![],
        env: HashMap::new(),
        cwd: std::env::temp_dir(),
        timeout: None,
    };
    let err = controller
        .run(&pip, controller_side, Arc::new(Notify::new()))
        .await
        .expect_err("spawn must fail");
    assert!(matches!(err, warden_core::WardenErr::Launch(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn enumeration_reports_feed_the_observed_map() {
    let (agent_side, controller_side) = tokio::io::duplex(64 * 1024);
    let mut enumerate = access(100, "/d", FileAccessStatus::Allowed);
    if let Report::FileAccess(a) = &mut enumerate {
        a.operation = OperationKind::FindFirstFile;
        a.requested_access = RequestedAccess::ENUMERATE;
        a.enumerate_pattern = "*".to_string();
    }
    let mut probe_a = access(100, "/d/a.txt", FileAccessStatus::Allowed);
    if let Report::FileAccess(a) = &mut probe_a {
        a.operation = OperationKind::FindFirstFile;
        a.requested_access = RequestedAccess::ENUMERATION_PROBE;
    }
    let mut probe_b = access(100, "/d/b.txt", FileAccessStatus::Allowed);
    if let Report::FileAccess(a) = &mut probe_b {
        a.operation = OperationKind::FindFirstFile;
        a.requested_access = RequestedAccess::ENUMERATION_PROBE;
    }
    let agent = simulate_agent(agent_side, vec![enumerate, probe_a, probe_b]);

    let controller = Controller::new(SandboxOptions::default());
    let result = controller
        .run(&sh("exit 0", None), controller_side, Arc::new(Notify::new()))
        .await
        .expect("pip ran");
    agent.await.expect("agent task");

    assert_eq!(
        result.observed_directory_enumerations.get("/d"),
        Some(&vec!["a.txt".to_string(), "b.txt".to_string()])
    );
}
