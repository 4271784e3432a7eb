//! The length-prefixed record stream flowing from every agent instance to
//! the controller.
//!
//! Layout of a frame (all integers little-endian):
//!
//! ```text
//! u32  record_length     // bytes following this field
//! u8   record_kind       // see ReportKind
//! u32  process_id
//! u32  parent_process_id
//! u64  thread_id
//! ...  kind-specific body
//! ```
//!
//! The `FileAccess` body carries the full access description; `DebugMessage`
//! and `ProcessData` reuse the same header. A decoder encountering a
//! `record_kind` it does not understand must skip `record_length` bytes and
//! continue.

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use thiserror::Error;

use crate::access::FileAccessStatus;
use crate::access::OperationKind;
use crate::access::ReportKind;
use crate::access::RequestedAccess;

/// Upper bound on a single record. A frame longer than this is treated as
/// stream corruption rather than buffered indefinitely.
pub const MAX_RECORD_LEN: u32 = 1024 * 1024;

#[derive(Debug, PartialEq, Error)]
pub enum WireError {
    #[error("record length {0} exceeds maximum {MAX_RECORD_LEN}")]
    OversizedRecord(u32),
    #[error("record truncated: needed {needed} more bytes for {context}")]
    Truncated { context: &'static str, needed: usize },
    #[error("unknown operation kind {0}")]
    BadOperationKind(u8),
    #[error("unknown access status {0}")]
    BadStatus(u8),
    #[error("path is not valid utf-8")]
    BadUtf8,
}

/// Identity of the reporting thread, common to every record kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportHeader {
    pub process_id: u32,
    pub parent_process_id: u32,
    pub thread_id: u64,
}

/// A single observed file-system access, the core currency of the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessReport {
    pub header: ReportHeader,
    pub operation: OperationKind,
    pub requested_access: RequestedAccess,
    pub status: FileAccessStatus,
    /// Set when the manifest asked for this access to be forwarded even
    /// though it was allowed, for cache-fingerprinting purposes.
    pub explicitly_reported: bool,
    pub error_code: u32,
    /// OS-level flag words, passed through untouched.
    pub desired_access: u32,
    pub share_mode: u32,
    pub creation_disposition: u32,
    pub flags_and_attributes: u32,
    /// The canonical path, or the manifest path when the full path could
    /// not be constructed.
    pub path: String,
    /// Search pattern for enumeration operations, empty otherwise.
    pub enumerate_pattern: String,
}

impl AccessReport {
    pub fn is_denied(&self) -> bool {
        self.status == FileAccessStatus::Denied
    }

    /// Key under which identical reports are coalesced within one process.
    pub fn dedup_key(&self) -> (String, OperationKind, RequestedAccess, FileAccessStatus) {
        (
            self.path.clone(),
            self.operation,
            self.requested_access,
            self.status,
        )
    }
}

/// Free-form diagnostic line from an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugReport {
    pub header: ReportHeader,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Start = 0,
    Exit = 1,
}

/// Lifecycle record for one process in the monitored tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDataReport {
    pub header: ReportHeader,
    pub event: ProcessEvent,
    pub exit_code: i32,
    pub executable: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    FileAccess(AccessReport),
    Debug(DebugReport),
    ProcessData(ProcessDataReport),
}

impl Report {
    pub fn header(&self) -> &ReportHeader {
        match self {
            Report::FileAccess(r) => &r.header,
            Report::Debug(r) => &r.header,
            Report::ProcessData(r) => &r.header,
        }
    }

    fn kind(&self) -> ReportKind {
        match self {
            Report::FileAccess(_) => ReportKind::FileAccess,
            Report::Debug(_) => ReportKind::DebugMessage,
            Report::ProcessData(_) => ReportKind::ProcessData,
        }
    }

    /// Appends the framed record to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let len_pos = buf.len();
        buf.put_u32_le(0); // patched below
        buf.put_u8(self.kind() as u8);
        let header = self.header();
        buf.put_u32_le(header.process_id);
        buf.put_u32_le(header.parent_process_id);
        buf.put_u64_le(header.thread_id);

        match self {
            Report::FileAccess(r) => {
                buf.put_u8(r.operation.as_u8());
                buf.put_u8(r.requested_access.bits());
                buf.put_u8(r.status as u8);
                buf.put_u8(u8::from(r.explicitly_reported));
                buf.put_u32_le(r.error_code);
                buf.put_u32_le(r.desired_access);
                buf.put_u32_le(r.share_mode);
                buf.put_u32_le(r.creation_disposition);
                buf.put_u32_le(r.flags_and_attributes);
                put_str(buf, &r.path);
                put_str(buf, &r.enumerate_pattern);
            }
            Report::Debug(r) => {
                put_str(buf, &r.message);
            }
            Report::ProcessData(r) => {
                buf.put_u8(r.event as u8);
                buf.put_i32_le(r.exit_code);
                put_str(buf, &r.executable);
            }
        }

        let record_len = (buf.len() - len_pos - 4) as u32;
        buf[len_pos..len_pos + 4].copy_from_slice(&record_len.to_le_bytes());
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Incremental decoder over the report stream. Feed it bytes as they
/// arrive; it yields complete records and skips kinds it does not know.
#[derive(Default)]
pub struct ReportDecoder {
    buf: BytesMut,
}

impl ReportDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete record, `Ok(None)` when more bytes are
    /// needed, or an error when the stream is corrupt.
    pub fn next_record(&mut self) -> Result<Option<Report>, WireError> {
        loop {
            if self.buf.len() < 4 {
                return Ok(None);
            }
            let record_len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if record_len > MAX_RECORD_LEN {
                return Err(WireError::OversizedRecord(record_len));
            }
            if self.buf.len() < 4 + record_len as usize {
                return Ok(None);
            }
            self.buf.advance(4);
            let mut record = self.buf.split_to(record_len as usize);
            let raw_kind = take_u8(&mut record, "record_kind")?;
            match ReportKind::try_from(raw_kind) {
                Ok(ReportKind::FileAccess) => {
                    return decode_file_access(&mut record).map(Some);
                }
                Ok(ReportKind::DebugMessage) => {
                    let header = take_header(&mut record)?;
                    let message = take_str(&mut record, "debug message")?;
                    return Ok(Some(Report::Debug(DebugReport { header, message })));
                }
                Ok(ReportKind::ProcessData) => {
                    let header = take_header(&mut record)?;
                    let event = match take_u8(&mut record, "process event")? {
                        0 => ProcessEvent::Start,
                        _ => ProcessEvent::Exit,
                    };
                    let exit_code = take_u32(&mut record, "exit code")? as i32;
                    let executable = take_str(&mut record, "executable")?;
                    return Ok(Some(Report::ProcessData(ProcessDataReport {
                        header,
                        event,
                        exit_code,
                        executable,
                    })));
                }
                // AgentStatus and anything newer: skip the whole record.
                Ok(ReportKind::AgentStatus) | Err(_) => continue,
            }
        }
    }
}

fn decode_file_access(record: &mut BytesMut) -> Result<Report, WireError> {
    let header = take_header(record)?;
    let operation = OperationKind::try_from(take_u8(record, "operation kind")?)
        .map_err(WireError::BadOperationKind)?;
    let requested_access = RequestedAccess::from_bits_truncate(take_u8(record, "access bits")?);
    let status =
        FileAccessStatus::try_from(take_u8(record, "status")?).map_err(WireError::BadStatus)?;
    let explicitly_reported = take_u8(record, "explicitly_reported")? != 0;
    let error_code = take_u32(record, "error code")?;
    let desired_access = take_u32(record, "desired access")?;
    let share_mode = take_u32(record, "share mode")?;
    let creation_disposition = take_u32(record, "creation disposition")?;
    let flags_and_attributes = take_u32(record, "flags and attributes")?;
    let path = take_str(record, "path")?;
    let enumerate_pattern = take_str(record, "enumerate pattern")?;
    Ok(Report::FileAccess(AccessReport {
        header,
        operation,
        requested_access,
        status,
        explicitly_reported,
        error_code,
        desired_access,
        share_mode,
        creation_disposition,
        flags_and_attributes,
        path,
        enumerate_pattern,
    }))
}

fn take_header(record: &mut BytesMut) -> Result<ReportHeader, WireError> {
    Ok(ReportHeader {
        process_id: take_u32(record, "process id")?,
        parent_process_id: take_u32(record, "parent process id")?,
        thread_id: take_u64(record, "thread id")?,
    })
}

fn take_u8(record: &mut BytesMut, context: &'static str) -> Result<u8, WireError> {
    if record.is_empty() {
        return Err(WireError::Truncated { context, needed: 1 });
    }
    Ok(record.get_u8())
}

fn take_u32(record: &mut BytesMut, context: &'static str) -> Result<u32, WireError> {
    if record.len() < 4 {
        return Err(WireError::Truncated {
            context,
            needed: 4 - record.len(),
        });
    }
    Ok(record.get_u32_le())
}

fn take_u64(record: &mut BytesMut, context: &'static str) -> Result<u64, WireError> {
    if record.len() < 8 {
        return Err(WireError::Truncated {
            context,
            needed: 8 - record.len(),
        });
    }
    Ok(record.get_u64_le())
}

fn take_str(record: &mut BytesMut, context: &'static str) -> Result<String, WireError> {
    let len = take_u32(record, context)? as usize;
    if record.len() < len {
        return Err(WireError::Truncated {
            context,
            needed: len - record.len(),
        });
    }
    let raw = record.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::BadUtf8)
}
