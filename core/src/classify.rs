//! Per-syscall access classification: canonicalize, translate, resolve,
//! look up policy, and emit the ordered report list.
//!
//! The classifier is pure with respect to the OS call itself: it never
//! performs the access, it only decides what the access *is*, whether the
//! manifest permits it, and what must be reported. Chain links are always
//! reported before the final access.

use std::sync::Arc;

use tracing::debug;
use warden_protocol::AccessReport;
use warden_protocol::FileAccessStatus;
use warden_protocol::OperationKind;
use warden_protocol::ReportHeader;
use warden_protocol::RequestedAccess;

use crate::canonical::CanonicalPath;
use crate::canonical::PathCanonicalizer;
use crate::fs::FileSystem;
use crate::fs::FsNodeKind;
use crate::manifest::Manifest;
use crate::manifest::PolicyBits;
use crate::manifest::PolicyLookup;
use crate::resolve::ReparseResolver;
use crate::resolve::ResolvedChain;

// OS error codes surfaced in reports.
pub const ERROR_SUCCESS: u32 = 0;
pub const ERROR_FILE_NOT_FOUND: u32 = 2;
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_INVALID_NAME: u32 = 123;
pub const ERROR_CANT_RESOLVE_FILENAME: u32 = 1921;

// Desired-access bits recognized when deriving the requested access.
pub const GENERIC_READ: u32 = 0x8000_0000;
pub const GENERIC_WRITE: u32 = 0x4000_0000;
pub const FILE_READ_DATA: u32 = 0x0001;
pub const FILE_WRITE_DATA: u32 = 0x0002;
pub const FILE_APPEND_DATA: u32 = 0x0004;
pub const DELETE: u32 = 0x0001_0000;

// Flags-and-attributes bits the classifier reacts to.
pub const FLAG_OPEN_REPARSE_POINT: u32 = 0x0020_0000;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x10;

// Creation dispositions (CreateFile semantics).
pub const CREATE_NEW: u32 = 1;
pub const CREATE_ALWAYS: u32 = 2;
pub const OPEN_EXISTING: u32 = 3;
pub const OPEN_ALWAYS: u32 = 4;
pub const TRUNCATE_EXISTING: u32 = 5;

/// A directory scan as the hook layer observed it: the search pattern and
/// the names the OS returned.
#[derive(Debug, Clone, Default)]
pub struct Enumeration {
    pub pattern: String,
    pub entries: Vec<String>,
}

/// One intercepted call, described in OS terms. The hook layer fills in
/// whatever the concrete syscall provides and leaves the rest zeroed.
#[derive(Debug, Clone)]
pub struct FileOperation {
    pub kind: OperationKind,
    pub path: String,
    /// Rename/move destination. For link creation this is the link
    /// target, which policy never touches.
    pub destination: Option<String>,
    pub desired_access: u32,
    pub share_mode: u32,
    pub creation_disposition: u32,
    pub flags_and_attributes: u32,
    pub enumeration: Option<Enumeration>,
}

impl FileOperation {
    pub fn new(kind: OperationKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            destination: None,
            desired_access: 0,
            share_mode: 0,
            creation_disposition: 0,
            flags_and_attributes: 0,
            enumeration: None,
        }
    }

    pub fn read_open(path: impl Into<String>) -> Self {
        let mut op = Self::new(OperationKind::CreateFile, path);
        op.desired_access = GENERIC_READ;
        op.creation_disposition = OPEN_EXISTING;
        op
    }

    pub fn write_open(path: impl Into<String>) -> Self {
        let mut op = Self::new(OperationKind::CreateFile, path);
        op.desired_access = GENERIC_WRITE;
        op.creation_disposition = CREATE_ALWAYS;
        op
    }

    fn no_follow(&self) -> bool {
        self.flags_and_attributes & FLAG_OPEN_REPARSE_POINT != 0
    }

    fn is_directory_creation(&self) -> bool {
        self.flags_and_attributes & FILE_ATTRIBUTE_DIRECTORY != 0
            && matches!(self.creation_disposition, CREATE_NEW | OPEN_ALWAYS)
    }

    fn wants_write(&self) -> bool {
        self.desired_access & (GENERIC_WRITE | FILE_WRITE_DATA | FILE_APPEND_DATA | DELETE) != 0
            || matches!(
                self.creation_disposition,
                CREATE_NEW | CREATE_ALWAYS | TRUNCATE_EXISTING
            )
    }

    fn reads_data(&self) -> bool {
        self.desired_access & (GENERIC_READ | FILE_READ_DATA) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessVerdict {
    Allow,
    AllowAndReport,
    Deny,
    DenyAndReport,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifierOptions {
    /// Deny verdicts fail the OS call instead of merely being recorded.
    pub fail_unexpected_file_accesses: bool,
    /// Creating a directory that already exists counts as a write rather
    /// than a probe.
    pub enforce_creation_policy: bool,
}

/// Everything the agent needs to act on one intercepted call.
#[derive(Debug)]
pub struct Classification {
    pub verdict: AccessVerdict,
    pub reports: Vec<AccessReport>,
    /// Error code to fail the call with, when the verdict demands it.
    pub fail_call_error: Option<u32>,
    /// Paths whose cached chains must be dropped once the call succeeds.
    pub invalidate: Vec<CanonicalPath>,
}

impl Classification {
    fn allowed(reports: Vec<AccessReport>, explicit: bool, invalidate: Vec<CanonicalPath>) -> Self {
        let verdict = if explicit {
            AccessVerdict::AllowAndReport
        } else {
            AccessVerdict::Allow
        };
        Self {
            verdict,
            reports,
            fail_call_error: None,
            invalidate,
        }
    }
}

pub struct AccessClassifier {
    manifest: Arc<Manifest>,
    canonicalizer: PathCanonicalizer,
    resolver: ReparseResolver,
    fs: Arc<dyn FileSystem>,
    options: ClassifierOptions,
}

/// How one path's final access classified, before the verdict is taken.
struct ClassifiedAccess {
    requested: RequestedAccess,
    status: FileAccessStatus,
    lookup: PolicyLookup,
    error_code: u32,
    is_write: bool,
}

impl AccessClassifier {
    pub fn new(
        manifest: Arc<Manifest>,
        canonicalizer: PathCanonicalizer,
        resolver: ReparseResolver,
        fs: Arc<dyn FileSystem>,
        options: ClassifierOptions,
    ) -> Self {
        Self {
            manifest,
            canonicalizer,
            resolver,
            fs,
            options,
        }
    }

    pub fn resolver(&self) -> &ReparseResolver {
        &self.resolver
    }

    pub fn classify(
        &self,
        header: ReportHeader,
        cwd: &CanonicalPath,
        op: &FileOperation,
    ) -> Classification {
        // Pipes carry no path policy at all.
        if matches!(
            op.kind,
            OperationKind::CreatePipe | OperationKind::CreateNamedPipe
        ) {
            let report = self.report(header, op, op.path.clone(), RequestedAccess::empty(), FileAccessStatus::Allowed, ERROR_SUCCESS, false);
            return Classification::allowed(vec![report], false, Vec::new());
        }

        // [Canonicalize]
        let canonical = match self.canonicalizer.canonicalize(&op.path, cwd) {
            Ok(p) => p,
            Err(_) => return self.classify_unknown_path(header, op),
        };

        // [Translate]
        let translated = self.manifest.translator().translate(&canonical);

        if self.manifest.is_untracked(&translated) {
            return Classification::allowed(Vec::new(), false, Vec::new());
        }

        // [Resolve reparse points]
        let preserve_last = op.no_follow() || acts_on_link_itself(op.kind);
        let resolved = match self.resolver.resolve(&translated, preserve_last) {
            Ok(resolved) => resolved,
            Err(err) => {
                debug!("resolution failed for {translated}: {err}");
                let report = self.report(
                    header,
                    op,
                    translated.to_string(),
                    requested_for_kind(op),
                    FileAccessStatus::Denied,
                    ERROR_CANT_RESOLVE_FILENAME,
                    false,
                );
                return Classification {
                    verdict: AccessVerdict::DenyAndReport,
                    reports: vec![report],
                    fail_call_error: Some(ERROR_CANT_RESOLVE_FILENAME),
                    invalidate: Vec::new(),
                };
            }
        };

        let mut reports = Vec::new();
        let mut any_denied = false;

        // Each traversed link is a synthetic read that must be permitted.
        let link_kind = if resolved.from_cache {
            OperationKind::ReparsePointTargetCached
        } else {
            OperationKind::ReparsePointTarget
        };
        for (link, _) in &resolved.chain.links {
            let lookup = self.manifest.lookup(link);
            let allowed = lookup.bits.contains(PolicyBits::ALLOW_READ);
            let status = if allowed {
                FileAccessStatus::Allowed
            } else {
                any_denied = true;
                FileAccessStatus::Denied
            };
            let explicit = lookup.bits.contains(PolicyBits::REPORT_ACCESS);
            reports.push(AccessReport {
                header,
                operation: link_kind,
                requested_access: RequestedAccess::READ,
                status,
                explicitly_reported: explicit,
                error_code: if allowed { ERROR_SUCCESS } else { ERROR_ACCESS_DENIED },
                desired_access: 0,
                share_mode: 0,
                creation_disposition: 0,
                flags_and_attributes: 0,
                path: link.to_string(),
                enumerate_pattern: String::new(),
            });
        }

        // [Classify access] + [Lookup manifest] for the final path.
        let final_path = resolved.chain.final_path.clone();
        let access = self.classify_final(op, &resolved);

        let mut invalidate = Vec::new();
        let mut explicit = access.lookup.bits.contains(PolicyBits::REPORT_ACCESS)
            || access.lookup.bits.contains(PolicyBits::REPORT_ALL_ACCESSES);
        if access.status == FileAccessStatus::Denied {
            any_denied = true;
        } else if access.is_write {
            invalidate.push(final_path.clone());
        }
        reports.push(self.report(
            header,
            op,
            final_path.to_string(),
            access.requested,
            access.status,
            access.error_code,
            explicit,
        ));
        if let Some(enumeration) = &op.enumeration {
            if let Some(last) = reports.last_mut() {
                last.enumerate_pattern = enumeration.pattern.clone();
            }
            self.classify_enumeration_entries(header, op, &final_path, enumeration, &mut reports, &mut any_denied);
        }

        // Rename/move touches a second path. (Link creation does not: the
        // link itself is the only write, the target goes unreported.)
        if let Some(dest) = &op.destination
            && matches!(
                op.kind,
                OperationKind::MoveFile | OperationKind::SetFileInformationRename
            )
        {
            match self.classify_secondary(header, op, cwd, dest, &final_path) {
                Ok((report, dest_path, denied)) => {
                    if denied {
                        any_denied = true;
                    } else {
                        invalidate.push(dest_path);
                    }
                    explicit = explicit || report.explicitly_reported;
                    reports.push(report);
                }
                Err(classification) => return classification,
            }
        }

        if any_denied {
            let fail_call_error = self
                .options
                .fail_unexpected_file_accesses
                .then_some(ERROR_ACCESS_DENIED);
            debug!("denied access to {final_path} ({})", op.kind);
            return Classification {
                verdict: AccessVerdict::DenyAndReport,
                reports,
                fail_call_error,
                // A failed call writes nothing.
                invalidate: if fail_call_error.is_some() { Vec::new() } else { invalidate },
            };
        }
        Classification::allowed(reports, explicit, invalidate)
    }

    /// The path could not be canonicalized; policy cannot be attributed.
    /// The access is reported against the raw text and the manifest's
    /// unknown-path default decides the verdict.
    fn classify_unknown_path(&self, header: ReportHeader, op: &FileOperation) -> Classification {
        let default = self.manifest.default_policy();
        let allowed = default
            .intersects(PolicyBits::ALLOW_READ | PolicyBits::ALLOW_WRITE | PolicyBits::ALLOW_PROBE);
        let report = self.report(
            header,
            op,
            op.path.clone(),
            requested_for_kind(op),
            FileAccessStatus::CannotDetermineByPolicy,
            ERROR_INVALID_NAME,
            false,
        );
        Classification {
            verdict: if allowed {
                AccessVerdict::AllowAndReport
            } else {
                AccessVerdict::DenyAndReport
            },
            reports: vec![report],
            fail_call_error: None,
            invalidate: Vec::new(),
        }
    }

    fn classify_final(&self, op: &FileOperation, resolved: &ResolvedChain) -> ClassifiedAccess {
        let exists = resolved.chain.final_exists;
        let lookup = self.manifest.lookup(&resolved.chain.final_path);

        let (requested, required, is_write, error_code) = match op.kind {
            OperationKind::FindFirstFile | OperationKind::FindNextFile => (
                RequestedAccess::ENUMERATE,
                PolicyBits::ALLOW_ENUMERATE,
                false,
                ERROR_SUCCESS,
            ),
            OperationKind::ProbeDirectory | OperationKind::GetFileAttributes => (
                RequestedAccess::PROBE,
                PolicyBits::ALLOW_PROBE | PolicyBits::ALLOW_READ,
                false,
                if exists { ERROR_SUCCESS } else { ERROR_FILE_NOT_FOUND },
            ),
            OperationKind::DeleteFile | OperationKind::SetFileInformationDisposition => {
                if exists {
                    (
                        RequestedAccess::WRITE,
                        PolicyBits::ALLOW_WRITE,
                        true,
                        ERROR_SUCCESS,
                    )
                } else {
                    // Deleting nothing observes nothing: it is a probe.
                    (
                        RequestedAccess::PROBE,
                        PolicyBits::ALLOW_PROBE | PolicyBits::ALLOW_READ,
                        false,
                        ERROR_FILE_NOT_FOUND,
                    )
                }
            }
            OperationKind::CreateSymbolicLink => (
                RequestedAccess::WRITE,
                PolicyBits::ALLOW_SYMLINK_CREATE | PolicyBits::ALLOW_WRITE,
                true,
                ERROR_SUCCESS,
            ),
            OperationKind::CreateHardLink | OperationKind::SetFileInformationLink => (
                RequestedAccess::WRITE,
                PolicyBits::ALLOW_WRITE,
                true,
                ERROR_SUCCESS,
            ),
            OperationKind::MoveFile | OperationKind::SetFileInformationRename => (
                RequestedAccess::WRITE,
                PolicyBits::ALLOW_WRITE,
                true,
                ERROR_SUCCESS,
            ),
            OperationKind::SetReparsePoint => (
                RequestedAccess::WRITE,
                PolicyBits::ALLOW_WRITE,
                true,
                ERROR_SUCCESS,
            ),
            OperationKind::GetReparsePoint => (
                RequestedAccess::READ,
                PolicyBits::ALLOW_READ,
                false,
                ERROR_SUCCESS,
            ),
            OperationKind::WriteFile => (
                RequestedAccess::WRITE,
                PolicyBits::ALLOW_WRITE,
                true,
                ERROR_SUCCESS,
            ),
            OperationKind::CreateProcess => (
                RequestedAccess::READ,
                PolicyBits::ALLOW_READ,
                false,
                ERROR_SUCCESS,
            ),
            OperationKind::ReadFile => (
                RequestedAccess::READ,
                PolicyBits::ALLOW_READ,
                false,
                ERROR_SUCCESS,
            ),
            // Generic opens: CreateFile, NtCreateFile, OpenFile.
            _ => self.classify_open(op, exists),
        };

        let mut allowed = lookup.bits.intersects(required);
        // Renaming a directory drags its whole subtree along; that is only
        // sound when a scope write covers it.
        if is_write
            && matches!(
                op.kind,
                OperationKind::MoveFile | OperationKind::SetFileInformationRename
            )
            && self.is_directory(&resolved.chain.final_path)
        {
            allowed = allowed && has_scope_write(&lookup);
        }

        let status = if allowed {
            FileAccessStatus::Allowed
        } else {
            FileAccessStatus::Denied
        };
        ClassifiedAccess {
            requested,
            status,
            lookup,
            error_code: if allowed || error_code != ERROR_SUCCESS {
                error_code
            } else {
                ERROR_ACCESS_DENIED
            },
            is_write: is_write && allowed,
        }
    }

    /// Rules for plain open calls: writes need write policy; reads split
    /// into data reads and probes; absent targets are probes.
    fn classify_open(
        &self,
        op: &FileOperation,
        exists: bool,
    ) -> (RequestedAccess, PolicyBits, bool, u32) {
        if op.is_directory_creation() {
            return if !exists || self.options.enforce_creation_policy {
                (RequestedAccess::WRITE, PolicyBits::ALLOW_WRITE, true, ERROR_SUCCESS)
            } else {
                // Re-creating an existing directory only observes it.
                (
                    RequestedAccess::PROBE,
                    PolicyBits::ALLOW_PROBE | PolicyBits::ALLOW_READ,
                    false,
                    ERROR_SUCCESS,
                )
            };
        }
        if op.wants_write() {
            return (RequestedAccess::WRITE, PolicyBits::ALLOW_WRITE, true, ERROR_SUCCESS);
        }
        if exists && op.reads_data() {
            (RequestedAccess::READ, PolicyBits::ALLOW_READ, false, ERROR_SUCCESS)
        } else if exists {
            (
                RequestedAccess::PROBE,
                PolicyBits::ALLOW_PROBE | PolicyBits::ALLOW_READ,
                false,
                ERROR_SUCCESS,
            )
        } else {
            (
                RequestedAccess::PROBE,
                PolicyBits::ALLOW_PROBE | PolicyBits::ALLOW_READ,
                false,
                ERROR_FILE_NOT_FOUND,
            )
        }
    }

    /// Every name an enumeration returned is probed against the manifest;
    /// the set of names feeds the observed-input fingerprint.
    fn classify_enumeration_entries(
        &self,
        header: ReportHeader,
        op: &FileOperation,
        dir: &CanonicalPath,
        enumeration: &Enumeration,
        reports: &mut Vec<AccessReport>,
        any_denied: &mut bool,
    ) {
        for name in &enumeration.entries {
            let entry = dir.join(name);
            let lookup = self.manifest.lookup(&entry);
            let allowed = lookup
                .bits
                .intersects(PolicyBits::ALLOW_ENUMERATE | PolicyBits::ALLOW_PROBE | PolicyBits::ALLOW_READ);
            if !allowed {
                *any_denied = true;
            }
            reports.push(AccessReport {
                header,
                operation: op.kind,
                requested_access: RequestedAccess::ENUMERATION_PROBE,
                status: if allowed {
                    FileAccessStatus::Allowed
                } else {
                    FileAccessStatus::Denied
                },
                explicitly_reported: lookup.bits.contains(PolicyBits::REPORT_ACCESS),
                error_code: if allowed { ERROR_SUCCESS } else { ERROR_ACCESS_DENIED },
                desired_access: 0,
                share_mode: 0,
                creation_disposition: 0,
                flags_and_attributes: 0,
                path: entry.to_string(),
                enumerate_pattern: String::new(),
            });
        }
    }

    /// Classifies the destination of a rename/move/hard-link. Both sides
    /// are writes; a directory source additionally needs scope coverage.
    #[allow(clippy::type_complexity)]
    fn classify_secondary(
        &self,
        header: ReportHeader,
        op: &FileOperation,
        cwd: &CanonicalPath,
        dest: &str,
        source_final: &CanonicalPath,
    ) -> Result<(AccessReport, CanonicalPath, bool), Classification> {
        let canonical = match self.canonicalizer.canonicalize(dest, cwd) {
            Ok(p) => p,
            Err(_) => {
                let mut fallback = self.classify_unknown_path(header, op);
                if let Some(report) = fallback.reports.first_mut() {
                    report.path = dest.to_string();
                }
                return Err(fallback);
            }
        };
        let translated = self.manifest.translator().translate(&canonical);
        // Destination may not exist yet; resolve what does.
        let dest_final = match self.resolver.resolve(&translated, true) {
            Ok(resolved) => resolved.chain.final_path.clone(),
            Err(_) => translated,
        };
        let lookup = self.manifest.lookup(&dest_final);
        let mut allowed = lookup.bits.contains(PolicyBits::ALLOW_WRITE);
        if self.is_directory(source_final)
            && matches!(
                op.kind,
                OperationKind::MoveFile | OperationKind::SetFileInformationRename
            )
        {
            allowed = allowed && has_scope_write(&lookup);
        }
        let report = AccessReport {
            header,
            operation: op.kind,
            requested_access: RequestedAccess::WRITE,
            status: if allowed {
                FileAccessStatus::Allowed
            } else {
                FileAccessStatus::Denied
            },
            explicitly_reported: lookup.bits.contains(PolicyBits::REPORT_ACCESS),
            error_code: if allowed { ERROR_SUCCESS } else { ERROR_ACCESS_DENIED },
            desired_access: op.desired_access,
            share_mode: op.share_mode,
            creation_disposition: op.creation_disposition,
            flags_and_attributes: op.flags_and_attributes,
            path: dest_final.to_string(),
            enumerate_pattern: String::new(),
        };
        Ok((report, dest_final, !allowed))
    }

    fn is_directory(&self, path: &CanonicalPath) -> bool {
        matches!(self.fs.node_kind(path), Some(FsNodeKind::Directory))
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        header: ReportHeader,
        op: &FileOperation,
        path: String,
        requested_access: RequestedAccess,
        status: FileAccessStatus,
        error_code: u32,
        explicitly_reported: bool,
    ) -> AccessReport {
        AccessReport {
            header,
            operation: op.kind,
            requested_access,
            status,
            explicitly_reported,
            error_code,
            desired_access: op.desired_access,
            share_mode: op.share_mode,
            creation_disposition: op.creation_disposition,
            flags_and_attributes: op.flags_and_attributes,
            path,
            enumerate_pattern: String::new(),
        }
    }
}

/// Operations that act on the link itself rather than what it points at.
fn acts_on_link_itself(kind: OperationKind) -> bool {
    matches!(
        kind,
        OperationKind::DeleteFile
            | OperationKind::SetFileInformationDisposition
            | OperationKind::MoveFile
            | OperationKind::SetFileInformationRename
            | OperationKind::GetReparsePoint
            | OperationKind::SetReparsePoint
            | OperationKind::CreateSymbolicLink
            | OperationKind::CreateHardLink
            | OperationKind::SetFileInformationLink
    )
}

fn has_scope_write(lookup: &PolicyLookup) -> bool {
    lookup.bits.contains(PolicyBits::ALLOW_WRITE)
        && (lookup.scope_applied || lookup.bits.contains(PolicyBits::SCOPE))
}

fn requested_for_kind(op: &FileOperation) -> RequestedAccess {
    match op.kind {
        OperationKind::FindFirstFile | OperationKind::FindNextFile => RequestedAccess::ENUMERATE,
        OperationKind::WriteFile
        | OperationKind::DeleteFile
        | OperationKind::MoveFile
        | OperationKind::SetFileInformationRename
        | OperationKind::SetFileInformationLink
        | OperationKind::SetFileInformationDisposition
        | OperationKind::CreateHardLink
        | OperationKind::CreateSymbolicLink
        | OperationKind::SetReparsePoint => RequestedAccess::WRITE,
        OperationKind::GetFileAttributes | OperationKind::ProbeDirectory => RequestedAccess::PROBE,
        _ => RequestedAccess::READ,
    }
}
