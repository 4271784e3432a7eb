//! Operation kinds, requested-access bits, and statuses shared between the
//! injected agent and the controller.
//!
//! Every type here has a stable wire encoding: enum discriminants are small
//! integers and must never be renumbered, only appended to.

use bitflags::bitflags;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Syscall classes the sandbox recognizes. The discriminant is the on-wire
/// `operation_kind` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OperationKind {
    CreateFile = 0,
    NtCreateFile = 1,
    OpenFile = 2,
    ReadFile = 3,
    WriteFile = 4,
    DeleteFile = 5,
    MoveFile = 6,
    SetFileInformationRename = 7,
    SetFileInformationLink = 8,
    SetFileInformationDisposition = 9,
    CreateHardLink = 10,
    CreateSymbolicLink = 11,
    GetFileAttributes = 12,
    FindFirstFile = 13,
    FindNextFile = 14,
    GetReparsePoint = 15,
    SetReparsePoint = 16,
    CreateProcess = 17,
    CreatePipe = 18,
    CreateNamedPipe = 19,
    ReparsePointTarget = 20,
    ReparsePointTargetCached = 21,
    ProbeDirectory = 22,
}

impl OperationKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for OperationKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use OperationKind::*;
        let kind = match value {
            0 => CreateFile,
            1 => NtCreateFile,
            2 => OpenFile,
            3 => ReadFile,
            4 => WriteFile,
            5 => DeleteFile,
            6 => MoveFile,
            7 => SetFileInformationRename,
            8 => SetFileInformationLink,
            9 => SetFileInformationDisposition,
            10 => CreateHardLink,
            11 => CreateSymbolicLink,
            12 => GetFileAttributes,
            13 => FindFirstFile,
            14 => FindNextFile,
            15 => GetReparsePoint,
            16 => SetReparsePoint,
            17 => CreateProcess,
            18 => CreatePipe,
            19 => CreateNamedPipe,
            20 => ReparsePointTarget,
            21 => ReparsePointTargetCached,
            22 => ProbeDirectory,
            other => return Err(other),
        };
        Ok(kind)
    }
}

bitflags! {
    /// What the intercepted call asked the filesystem for, independent of
    /// the OS-level flag soup that expressed it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestedAccess: u8 {
        const READ = 1;
        const WRITE = 2;
        const PROBE = 4;
        const ENUMERATE = 8;
        const ENUMERATION_PROBE = 16;
    }
}

impl Serialize for RequestedAccess {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for RequestedAccess {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Ok(RequestedAccess::from_bits_truncate(bits))
    }
}

/// Outcome of the policy evaluation for a single reported access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FileAccessStatus {
    #[default]
    Allowed = 0,
    Denied = 1,
    /// The path could not be canonicalized, so no policy node applies.
    CannotDetermineByPolicy = 2,
}

impl TryFrom<u8> for FileAccessStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FileAccessStatus::Allowed),
            1 => Ok(FileAccessStatus::Denied),
            2 => Ok(FileAccessStatus::CannotDetermineByPolicy),
            other => Err(other),
        }
    }
}

/// On-wire record kinds. Unknown kinds must be skipped by length, never
/// treated as an error, so old controllers tolerate new agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(u8)]
pub enum ReportKind {
    FileAccess = 0,
    DebugMessage = 1,
    ProcessData = 2,
    AgentStatus = 3,
}

impl TryFrom<u8> for ReportKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReportKind::FileAccess),
            1 => Ok(ReportKind::DebugMessage),
            2 => Ok(ReportKind::ProcessData),
            3 => Ok(ReportKind::AgentStatus),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::expect_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn operation_kind_round_trips_through_wire_byte() {
        for raw in 0u8..=22 {
            let kind = OperationKind::try_from(raw).expect("all ids below 23 are assigned");
            assert_eq!(kind.as_u8(), raw);
        }
        assert_eq!(OperationKind::try_from(23), Err(23));
    }

    #[test]
    fn requested_access_bits_match_contract() {
        assert_eq!(RequestedAccess::READ.bits(), 1);
        assert_eq!(RequestedAccess::WRITE.bits(), 2);
        assert_eq!(RequestedAccess::PROBE.bits(), 4);
        assert_eq!(RequestedAccess::ENUMERATE.bits(), 8);
        assert_eq!(RequestedAccess::ENUMERATION_PROBE.bits(), 16);
    }
}
