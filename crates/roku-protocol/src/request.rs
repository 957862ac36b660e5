//! Debugger requests and their wire encoders.
//!
//! Every request serializes a 12-byte base header
//! (`packet_size`, `request_id`, `command`) followed by a command-specific
//! payload. The encoder computes `packet_size` up front, writes exactly
//! that many bytes, and verifies the count afterwards. Decoders exist for
//! the benefit of fake targets and round-trip tests.

use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Write};

use crate::codec::{utf8z_len, WireReader, WireWriter};
use crate::error::ProtocolError;
use crate::version::{FeatureSet, ProtocolFeature};

/// Base header: `packet_size`, `request_id`, `command`.
const BASE_HEADER_SIZE: u32 = 3 * 4;

/// Closed set of command codes understood by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    // 0 is skipped: it reads as "no command" in hex dumps
    Stop = 1,
    Continue = 2,
    Threads = 3,
    Stacktrace = 4,
    Variables = 5,
    Step = 6,
    AddBreakpoints = 7,
    ListBreakpoints = 8,
    RemoveBreakpoints = 9,
    Execute = 10,
    AddConditionalBreakpoints = 11,
    ExitChannel = 122,
}

impl Command {
    pub fn from_u32(raw: u32) -> Result<Self, ProtocolError> {
        Ok(match raw {
            1 => Command::Stop,
            2 => Command::Continue,
            3 => Command::Threads,
            4 => Command::Stacktrace,
            5 => Command::Variables,
            6 => Command::Step,
            7 => Command::AddBreakpoints,
            8 => Command::ListBreakpoints,
            9 => Command::RemoveBreakpoints,
            10 => Command::Execute,
            11 => Command::AddConditionalBreakpoints,
            122 => Command::ExitChannel,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }

    fn name(self) -> &'static str {
        match self {
            Command::Stop => "stop",
            Command::Continue => "continue",
            Command::Threads => "threads",
            Command::Stacktrace => "stacktrace",
            Command::Variables => "variables",
            Command::Step => "step",
            Command::AddBreakpoints => "add_breakpoints",
            Command::ListBreakpoints => "list_breakpoints",
            Command::RemoveBreakpoints => "remove_breakpoints",
            Command::Execute => "execute",
            Command::AddConditionalBreakpoints => "add_conditional_breakpoints",
            Command::ExitChannel => "exit_channel",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), *self as u32)
    }
}

/// Granularity of a step command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StepType {
    Line = 1,
    Out = 2,
    Over = 3,
}

impl StepType {
    pub fn from_u8(raw: u8) -> Result<Self, ProtocolError> {
        Ok(match raw {
            1 => StepType::Line,
            2 => StepType::Out,
            3 => StepType::Over,
            other => return Err(ProtocolError::UnknownStepType(other)),
        })
    }
}

// VARIABLES request flags (one byte on the wire).
const VARIABLES_FLAG_GET_CHILD_KEYS: u8 = 0x01;
const VARIABLES_FLAG_CASE_SENSITIVITY_OPTIONS: u8 = 0x02;

/// One breakpoint in an add request. `file_uri` uses `pkg:/<path>` or
/// `lib:/<name>/<path>` form; the encoder downgrades it to a bare path
/// for targets without URI support.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointSpec {
    pub file_uri: String,
    pub line_number: u32,
    pub ignore_count: u32,
    /// Condition expression; only sent by the conditional variant.
    pub cond_expr: Option<String>,
}

impl BreakpointSpec {
    pub fn new(file_uri: impl Into<String>, line_number: u32, ignore_count: u32) -> Self {
        Self { file_uri: file_uri.into(), line_number, ignore_count, cond_expr: None }
    }

    pub fn with_condition(mut self, cond_expr: impl Into<String>) -> Self {
        self.cond_expr = Some(cond_expr.into());
        self
    }
}

/// Arguments of a VARIABLES request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VariablesArgs {
    pub thread_index: u32,
    pub frame_index: u32,
    /// Path from the frame's locals to the variable of interest; empty
    /// means "all locals in the frame".
    pub variable_path: Vec<String>,
    /// Per-component lookup case-insensitivity; same length as
    /// `variable_path`.
    pub force_case_insensitive: Vec<bool>,
    pub get_child_keys: bool,
}

/// Typed request arguments, one variant per command.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestArgs {
    Stop,
    Continue,
    Threads,
    ListBreakpoints,
    ExitChannel,
    Stacktrace { thread_index: u32 },
    Step { thread_index: u32, step_type: StepType },
    Variables(VariablesArgs),
    AddBreakpoints { breakpoints: Vec<BreakpointSpec> },
    AddConditionalBreakpoints { breakpoints: Vec<BreakpointSpec> },
    RemoveBreakpoints { remote_ids: Vec<u32> },
    Execute { thread_index: u32, frame_index: u32, source_code: String },
}

impl RequestArgs {
    pub fn command(&self) -> Command {
        match self {
            RequestArgs::Stop => Command::Stop,
            RequestArgs::Continue => Command::Continue,
            RequestArgs::Threads => Command::Threads,
            RequestArgs::ListBreakpoints => Command::ListBreakpoints,
            RequestArgs::ExitChannel => Command::ExitChannel,
            RequestArgs::Stacktrace { .. } => Command::Stacktrace,
            RequestArgs::Step { .. } => Command::Step,
            RequestArgs::Variables(_) => Command::Variables,
            RequestArgs::AddBreakpoints { .. } => Command::AddBreakpoints,
            RequestArgs::AddConditionalBreakpoints { .. } => Command::AddConditionalBreakpoints,
            RequestArgs::RemoveBreakpoints { .. } => Command::RemoveBreakpoints,
            RequestArgs::Execute { .. } => Command::Execute,
        }
    }
}

/// A request bound for the target: command arguments, the wire request id,
/// and an opaque caller payload copied verbatim onto the matching
/// response (the DAP bridge stores the originating IDE message there).
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Assigned by the client when the request is sent; 0 means unsent.
    pub request_id: u32,
    pub args: RequestArgs,
    pub caller_data: Option<serde_json::Value>,
}

impl Request {
    pub fn new(args: RequestArgs) -> Self {
        Self { request_id: 0, args, caller_data: None }
    }

    pub fn with_caller_data(mut self, data: serde_json::Value) -> Self {
        self.caller_data = Some(data);
        self
    }

    pub fn command(&self) -> Command {
        self.args.command()
    }

    /// Total bytes this request occupies on the wire, header included.
    pub fn packet_size(&self, features: &FeatureSet) -> u32 {
        let mut size = BASE_HEADER_SIZE;
        match &self.args {
            RequestArgs::Stop
            | RequestArgs::Continue
            | RequestArgs::Threads
            | RequestArgs::ListBreakpoints
            | RequestArgs::ExitChannel => {}
            RequestArgs::Stacktrace { .. } => size += 4,
            RequestArgs::Step { .. } => size += 4 + 1,
            RequestArgs::Variables(args) => {
                size += 1 + 3 * 4;
                for (entry, force) in args.variable_path.iter().zip(&args.force_case_insensitive) {
                    size += utf8z_len(&path_entry_for_wire(entry, *force, features));
                }
                if features.has(ProtocolFeature::CaseSensitivity) {
                    size += args.variable_path.len() as u32;
                }
            }
            RequestArgs::AddBreakpoints { breakpoints } => {
                size += 4;
                for bp in breakpoints {
                    size += utf8z_len(&breakpoint_uri_for_wire(&bp.file_uri, features));
                    size += 2 * 4;
                }
            }
            RequestArgs::AddConditionalBreakpoints { breakpoints } => {
                size += 4 + 4; // flags, count
                for bp in breakpoints {
                    // Conditional breakpoints always transmit URIs verbatim.
                    size += utf8z_len(&bp.file_uri);
                    size += 2 * 4;
                    size += utf8z_len(bp.cond_expr.as_deref().unwrap_or(""));
                }
            }
            RequestArgs::RemoveBreakpoints { remote_ids } => {
                size += 4 + remote_ids.len() as u32 * 4;
            }
            RequestArgs::Execute { source_code, .. } => {
                size += 2 * 4 + utf8z_len(source_code);
            }
        }
        size
    }

    /// Serialize onto the control socket. Returns the bytes written, which
    /// is verified to equal the declared packet size.
    pub fn encode<W: Write>(
        &self,
        features: &FeatureSet,
        writer: &mut WireWriter<W>,
    ) -> Result<u32, ProtocolError> {
        let declared = self.packet_size(features);
        writer.reset_byte_count();

        writer.write_u32(declared)?;
        writer.write_u32(self.request_id)?;
        writer.write_u32(self.command() as u32)?;

        match &self.args {
            RequestArgs::Stop
            | RequestArgs::Continue
            | RequestArgs::Threads
            | RequestArgs::ListBreakpoints
            | RequestArgs::ExitChannel => {}
            RequestArgs::Stacktrace { thread_index } => {
                writer.write_u32(*thread_index)?;
            }
            RequestArgs::Step { thread_index, step_type } => {
                writer.write_u32(*thread_index)?;
                writer.write_u8(*step_type as u8)?;
            }
            RequestArgs::Variables(args) => {
                let supports_ci = features.has(ProtocolFeature::CaseSensitivity);
                let mut flags = 0u8;
                if args.get_child_keys {
                    flags |= VARIABLES_FLAG_GET_CHILD_KEYS;
                }
                if supports_ci {
                    flags |= VARIABLES_FLAG_CASE_SENSITIVITY_OPTIONS;
                }
                writer.write_u8(flags)?;
                writer.write_u32(args.thread_index)?;
                writer.write_u32(args.frame_index)?;
                writer.write_u32(args.variable_path.len() as u32)?;
                for (entry, force) in args.variable_path.iter().zip(&args.force_case_insensitive) {
                    writer.write_utf8z(&path_entry_for_wire(entry, *force, features))?;
                }
                if supports_ci {
                    for force in &args.force_case_insensitive {
                        writer.write_u8(u8::from(*force))?;
                    }
                }
            }
            RequestArgs::AddBreakpoints { breakpoints } => {
                writer.write_u32(breakpoints.len() as u32)?;
                for bp in breakpoints {
                    writer.write_utf8z(&breakpoint_uri_for_wire(&bp.file_uri, features))?;
                    writer.write_u32(bp.line_number)?;
                    writer.write_u32(bp.ignore_count)?;
                }
            }
            RequestArgs::AddConditionalBreakpoints { breakpoints } => {
                writer.write_u32(0)?; // flags, reserved
                writer.write_u32(breakpoints.len() as u32)?;
                for bp in breakpoints {
                    writer.write_utf8z(&bp.file_uri)?;
                    writer.write_u32(bp.line_number)?;
                    writer.write_u32(bp.ignore_count)?;
                    writer.write_utf8z(bp.cond_expr.as_deref().unwrap_or(""))?;
                }
            }
            RequestArgs::RemoveBreakpoints { remote_ids } => {
                writer.write_u32(remote_ids.len() as u32)?;
                for id in remote_ids {
                    writer.write_u32(*id)?;
                }
            }
            RequestArgs::Execute { thread_index, frame_index, source_code } => {
                writer.write_u32(*thread_index)?;
                writer.write_u32(*frame_index)?;
                writer.write_utf8z(source_code)?;
            }
        }

        writer.flush()?;
        let written = writer.bytes_written();
        if written != u64::from(declared) {
            return Err(ProtocolError::PacketSizeMismatch { declared, written });
        }
        Ok(declared)
    }
}

/// Breakpoint path as transmitted: URIs go out verbatim when the target
/// understands them, otherwise `pkg:/p` becomes `p` and `lib:/<name>/p`
/// becomes `p`.
fn breakpoint_uri_for_wire<'a>(uri: &'a str, features: &FeatureSet) -> Cow<'a, str> {
    if features.has(ProtocolFeature::BreakpointsUriSupport) {
        return Cow::Borrowed(uri);
    }
    if let Some(path) = uri.strip_prefix("pkg:/") {
        return Cow::Borrowed(path);
    }
    if let Some(rest) = uri.strip_prefix("lib:/") {
        // lib:/<libname>/<path> -> <path>
        if let Some((_, path)) = rest.split_once('/') {
            return Cow::Borrowed(path);
        }
    }
    Cow::Borrowed(uri)
}

/// Variable path component as transmitted. Targets without the
/// case-sensitivity option expect lower case, which is the canonical
/// form for BrightScript identifiers.
fn path_entry_for_wire<'a>(entry: &'a str, force_insensitive: bool, features: &FeatureSet) -> Cow<'a, str> {
    if force_insensitive && !features.has(ProtocolFeature::CaseSensitivity) {
        Cow::Owned(entry.to_lowercase())
    } else {
        Cow::Borrowed(entry)
    }
}

/// Decode one request from a byte stream. Used by fake targets and by
/// the encode/decode round-trip tests; the consumed byte count is
/// verified against the declared packet size.
pub fn read_request<R: Read>(reader: &mut WireReader<R>) -> Result<Request, ProtocolError> {
    reader.reset_byte_count();
    let declared = reader.read_u32()?;
    let request_id = reader.read_u32()?;
    let command = Command::from_u32(reader.read_u32()?)?;

    let args = match command {
        Command::Stop => RequestArgs::Stop,
        Command::Continue => RequestArgs::Continue,
        Command::Threads => RequestArgs::Threads,
        Command::ListBreakpoints => RequestArgs::ListBreakpoints,
        Command::ExitChannel => RequestArgs::ExitChannel,
        Command::Stacktrace => RequestArgs::Stacktrace { thread_index: reader.read_u32()? },
        Command::Step => {
            let thread_index = reader.read_u32()?;
            let step_type = StepType::from_u8(reader.read_u8()?)?;
            RequestArgs::Step { thread_index, step_type }
        }
        Command::Variables => {
            let flags = reader.read_u8()?;
            let thread_index = reader.read_u32()?;
            let frame_index = reader.read_u32()?;
            let path_len = reader.read_u32()? as usize;
            let mut variable_path = Vec::with_capacity(path_len);
            for _ in 0..path_len {
                variable_path.push(reader.read_utf8z()?);
            }
            let mut force_case_insensitive = vec![false; path_len];
            if flags & VARIABLES_FLAG_CASE_SENSITIVITY_OPTIONS != 0 {
                for force in force_case_insensitive.iter_mut() {
                    *force = reader.read_bool()?;
                }
            }
            RequestArgs::Variables(VariablesArgs {
                thread_index,
                frame_index,
                variable_path,
                force_case_insensitive,
                get_child_keys: flags & VARIABLES_FLAG_GET_CHILD_KEYS != 0,
            })
        }
        Command::AddBreakpoints => {
            let count = reader.read_u32()?;
            let mut breakpoints = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let file_uri = reader.read_utf8z()?;
                let line_number = reader.read_u32()?;
                let ignore_count = reader.read_u32()?;
                breakpoints.push(BreakpointSpec { file_uri, line_number, ignore_count, cond_expr: None });
            }
            RequestArgs::AddBreakpoints { breakpoints }
        }
        Command::AddConditionalBreakpoints => {
            let _flags = reader.read_u32()?;
            let count = reader.read_u32()?;
            let mut breakpoints = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let file_uri = reader.read_utf8z()?;
                let line_number = reader.read_u32()?;
                let ignore_count = reader.read_u32()?;
                let cond_expr = reader.read_utf8z()?;
                breakpoints.push(BreakpointSpec {
                    file_uri,
                    line_number,
                    ignore_count,
                    cond_expr: Some(cond_expr),
                });
            }
            RequestArgs::AddConditionalBreakpoints { breakpoints }
        }
        Command::RemoveBreakpoints => {
            let count = reader.read_u32()?;
            let mut remote_ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                remote_ids.push(reader.read_u32()?);
            }
            RequestArgs::RemoveBreakpoints { remote_ids }
        }
        Command::Execute => {
            let thread_index = reader.read_u32()?;
            let frame_index = reader.read_u32()?;
            let source_code = reader.read_utf8z()?;
            RequestArgs::Execute { thread_index, frame_index, source_code }
        }
    };

    let consumed = reader.bytes_read();
    if consumed != u64::from(declared) {
        return Err(ProtocolError::PacketLengthMismatch { declared, consumed });
    }

    Ok(Request { request_id, args, caller_data: None })
}
