//! End-to-end walks of the interception pipeline: filesystem fixture in,
//! ordered wire records out.

use pretty_assertions::assert_eq;
use warden_core::agent::InterceptDisposition;
use warden_core::classify::ClassifierOptions;
use warden_core::classify::ERROR_ACCESS_DENIED;
use warden_core::classify::ERROR_FILE_NOT_FOUND;
use warden_core::classify::Enumeration;
use warden_core::classify::FileOperation;
use warden_core::fs::LinkKind;
use warden_core::manifest::Manifest;
use warden_core::manifest::PolicyBits;
use warden_protocol::FileAccessStatus;
use warden_protocol::OperationKind;
use warden_protocol::RequestedAccess;

use super::AgentHarness;
use super::p;

const READ: PolicyBits = PolicyBits::ALLOW_READ;
const READ_REPORT: PolicyBits = PolicyBits::ALLOW_READ.union(PolicyBits::REPORT_ACCESS);

#[tokio::test]
async fn open_through_two_symlinks_reports_chain_then_final() {
    let manifest = Manifest::builder(PolicyBits::empty())
        .policy(p("/x/src.lnk"), READ_REPORT)
        .policy(p("/x/mid.lnk"), READ_REPORT)
        .policy(p("/x/target.txt"), READ_REPORT)
        .build();
    let h = AgentHarness::new(manifest, ClassifierOptions::default());
    h.fs.add_link("/x/src.lnk", "/x/mid.lnk", LinkKind::FileSymlink);
    h.fs.add_link("/x/mid.lnk", "/x/target.txt", LinkKind::FileSymlink);
    h.fs.add_file("/x/target.txt");

    let disposition = h
        .agent
        .on_operation(100, &FileOperation::read_open("/x/src.lnk"))
        .expect("channel open");
    assert_eq!(disposition, InterceptDisposition::Continue);

    let accesses = h.finish().await;
    let observed: Vec<(OperationKind, String, RequestedAccess, FileAccessStatus)> = accesses
        .iter()
        .map(|a| (a.operation, a.path.clone(), a.requested_access, a.status))
        .collect();
    assert_eq!(
        observed,
        vec![
            (
                OperationKind::ReparsePointTarget,
                "/x/src.lnk".to_string(),
                RequestedAccess::READ,
                FileAccessStatus::Allowed,
            ),
            (
                OperationKind::ReparsePointTarget,
                "/x/mid.lnk".to_string(),
                RequestedAccess::READ,
                FileAccessStatus::Allowed,
            ),
            (
                OperationKind::CreateFile,
                "/x/target.txt".to_string(),
                RequestedAccess::READ,
                FileAccessStatus::Allowed,
            ),
        ]
    );
}

#[tokio::test]
async fn unpermitted_intermediate_link_fails_the_call() {
    let manifest = Manifest::builder(PolicyBits::empty())
        .policy(p("/x/src.lnk"), READ)
        .policy(p("/x/target.txt"), READ)
        .build();
    let h = AgentHarness::new(
        manifest,
        ClassifierOptions {
            fail_unexpected_file_accesses: true,
            ..Default::default()
        },
    );
    h.fs.add_link("/x/src.lnk", "/x/mid.lnk", LinkKind::FileSymlink);
    h.fs.add_link("/x/mid.lnk", "/x/target.txt", LinkKind::FileSymlink);
    h.fs.add_file("/x/target.txt");

    let disposition = h
        .agent
        .on_operation(100, &FileOperation::read_open("/x/src.lnk"))
        .expect("channel open");
    assert_eq!(
        disposition,
        InterceptDisposition::FailCall {
            error_code: ERROR_ACCESS_DENIED
        }
    );

    let accesses = h.finish().await;
    let mid = accesses
        .iter()
        .find(|a| a.path == "/x/mid.lnk")
        .expect("denied link is on the wire");
    assert_eq!(mid.status, FileAccessStatus::Denied);
    assert_eq!(mid.operation, OperationKind::ReparsePointTarget);
}

#[tokio::test]
async fn deleting_a_missing_file_is_one_allowed_probe() {
    let manifest = Manifest::builder(PolicyBits::empty())
        .policy(
            p("/out"),
            PolicyBits::ALLOW_PROBE | PolicyBits::SCOPE,
        )
        .build();
    let h = AgentHarness::new(manifest, ClassifierOptions::default());
    h.fs.add_dir("/out");

    let disposition = h
        .agent
        .on_operation(
            100,
            &FileOperation::new(OperationKind::DeleteFile, "/out/never-built.o"),
        )
        .expect("channel open");
    // The call itself proceeds; the OS will answer FileNotFound.
    assert_eq!(disposition, InterceptDisposition::Continue);

    let accesses = h.finish().await;
    assert_eq!(accesses.len(), 1);
    assert_eq!(accesses[0].operation, OperationKind::DeleteFile);
    assert_eq!(accesses[0].requested_access, RequestedAccess::PROBE);
    assert_eq!(accesses[0].status, FileAccessStatus::Allowed);
    assert_eq!(accesses[0].error_code, ERROR_FILE_NOT_FOUND);
}

#[tokio::test]
async fn enumerating_a_directory_probes_both_members() {
    let manifest = Manifest::builder(PolicyBits::empty())
        .policy(
            p("/d"),
            PolicyBits::ALLOW_ENUMERATE | PolicyBits::ALLOW_PROBE | PolicyBits::SCOPE,
        )
        .build();
    let h = AgentHarness::new(manifest, ClassifierOptions::default());
    h.fs.add_file("/d/a.txt");
    h.fs.add_file("/d/b.txt");

    let mut op = FileOperation::new(OperationKind::FindFirstFile, "/d");
    op.enumeration = Some(Enumeration {
        pattern: "*".to_string(),
        entries: vec!["a.txt".to_string(), "b.txt".to_string()],
    });
    h.agent.on_operation(100, &op).expect("channel open");

    let accesses = h.finish().await;
    assert_eq!(accesses.len(), 3);
    assert_eq!(accesses[0].requested_access, RequestedAccess::ENUMERATE);
    assert_eq!(accesses[0].path, "/d");
    assert_eq!(accesses[0].enumerate_pattern, "*");
    assert_eq!(accesses[1].requested_access, RequestedAccess::ENUMERATION_PROBE);
    assert_eq!(accesses[1].path, "/d/a.txt");
    assert_eq!(accesses[2].path, "/d/b.txt");
    assert!(accesses.iter().all(|a| a.status == FileAccessStatus::Allowed));
}

#[tokio::test]
async fn cached_resolution_reports_cached_kind_until_invalidated() {
    let manifest = Manifest::builder(PolicyBits::empty())
        .policy(
            p("/x"),
            PolicyBits::ALLOW_READ | PolicyBits::ALLOW_WRITE | PolicyBits::SCOPE,
        )
        .build();
    let h = AgentHarness::new(manifest, ClassifierOptions::default());
    h.fs.add_link("/x/src.lnk", "/x/target.txt", LinkKind::FileSymlink);
    h.fs.add_file("/x/target.txt");

    let read = FileOperation::read_open("/x/src.lnk");
    h.agent.on_operation(100, &read).expect("channel open");
    h.agent.on_operation(100, &read).expect("channel open");
    // A successful write to the target invalidates the cached chain, so
    // the next read resolves fresh.
    h.agent
        .on_operation(100, &FileOperation::write_open("/x/target.txt"))
        .expect("channel open");
    h.agent.on_operation(100, &read).expect("channel open");

    let accesses = h.finish().await;
    let link_kinds: Vec<OperationKind> = accesses
        .iter()
        .filter(|a| a.path == "/x/src.lnk")
        .map(|a| a.operation)
        .collect();
    // First read resolves, second hits the cache, third resolves again.
    // The fresh re-resolution dedups against the first read's identical
    // record, so exactly one of each kind reaches the wire.
    assert_eq!(
        link_kinds,
        vec![
            OperationKind::ReparsePointTarget,
            OperationKind::ReparsePointTargetCached,
        ]
    );
}

#[tokio::test]
async fn directory_rename_under_write_scope_reports_both_endpoints() {
    let manifest = Manifest::builder(PolicyBits::empty())
        .policy(
            p("/w"),
            PolicyBits::ALLOW_WRITE | PolicyBits::SCOPE,
        )
        .build();
    let h = AgentHarness::new(manifest, ClassifierOptions::default());
    h.fs.add_file("/w/old/inner.txt");

    let mut op = FileOperation::new(OperationKind::MoveFile, "/w/old");
    op.destination = Some("/w/new".to_string());
    let disposition = h.agent.on_operation(100, &op).expect("channel open");
    assert_eq!(disposition, InterceptDisposition::Continue);

    let accesses = h.finish().await;
    let observed: Vec<(String, RequestedAccess, FileAccessStatus)> = accesses
        .iter()
        .map(|a| (a.path.clone(), a.requested_access, a.status))
        .collect();
    // The scope covers the subtree: nothing inside `old/` is reported.
    assert_eq!(
        observed,
        vec![
            (
                "/w/old".to_string(),
                RequestedAccess::WRITE,
                FileAccessStatus::Allowed,
            ),
            (
                "/w/new".to_string(),
                RequestedAccess::WRITE,
                FileAccessStatus::Allowed,
            ),
        ]
    );
}

#[tokio::test]
async fn relative_paths_resolve_against_the_agent_cwd() {
    let manifest = Manifest::builder(PolicyBits::empty())
        .policy(
            p("/work/pip7"),
            PolicyBits::ALLOW_READ | PolicyBits::ALLOW_PROBE | PolicyBits::SCOPE,
        )
        .build();
    let h = AgentHarness::new(manifest, ClassifierOptions::default());
    h.fs.add_file("/work/pip7/input.txt");

    h.agent.set_cwd(p("/work/pip7"));
    h.agent
        .on_operation(100, &FileOperation::read_open("input.txt"))
        .expect("channel open");

    let accesses = h.finish().await;
    assert_eq!(accesses.len(), 1);
    assert_eq!(accesses[0].path, "/work/pip7/input.txt");
    assert_eq!(accesses[0].status, FileAccessStatus::Allowed);
}

#[tokio::test]
async fn translated_prefix_attributes_policy_to_the_declared_form() {
    let manifest = Manifest::builder(PolicyBits::empty())
        .policy(
            p("/builds/src"),
            PolicyBits::ALLOW_READ | PolicyBits::ALLOW_PROBE | PolicyBits::SCOPE,
        )
        .translation(p("/mnt/b"), p("/builds"))
        .build();
    let h = AgentHarness::new(manifest, ClassifierOptions::default());
    h.fs.add_file("/builds/src/main.c");

    h.agent
        .on_operation(100, &FileOperation::read_open("/mnt/b/src/main.c"))
        .expect("channel open");

    let accesses = h.finish().await;
    assert_eq!(accesses.len(), 1);
    assert_eq!(accesses[0].path, "/builds/src/main.c");
    assert_eq!(accesses[0].status, FileAccessStatus::Allowed);
}
