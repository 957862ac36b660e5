//! Messages from the target: solicited responses and asynchronous updates.
//!
//! Every inbound message begins with an optional packet length (protocol
//! 3.0+), a request id, and an error code. A non-zero request id marks a
//! response whose payload shape is determined by the originating request's
//! command; a zero request id marks an asynchronous update introduced by
//! an update-type word. The demultiplexer lives in [`read_update`].
//!
//! Encoders for each variant are provided as well; real targets are the
//! only producers in production, but fake targets in the test suites and
//! the decode/encode round-trip tests need them.

use std::io::{Read, Write};

use crate::codec::{WireReader, WireWriter};
use crate::error::ProtocolError;
use crate::request::{Command, Request};
use crate::version::{FeatureSet, ProtocolFeature};

/// Structured error codes reported by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrCode {
    Ok = 0,
    OtherErr = 1,
    /// Fatal: the target rejected the conversation outright.
    InvalidProtocol = 2,
    CantContinue = 3,
    NotStopped = 4,
    InvalidArgs = 5,
    ThreadDetached = 6,
    ExecutionTimeout = 7,
}

impl ErrCode {
    pub fn from_u32(raw: u32) -> Result<Self, ProtocolError> {
        Ok(match raw {
            0 => ErrCode::Ok,
            1 => ErrCode::OtherErr,
            2 => ErrCode::InvalidProtocol,
            3 => ErrCode::CantContinue,
            4 => ErrCode::NotStopped,
            5 => ErrCode::InvalidArgs,
            6 => ErrCode::ThreadDetached,
            7 => ErrCode::ExecutionTimeout,
            other => return Err(ProtocolError::UnknownErrCode(other)),
        })
    }

    pub fn user_str(self) -> &'static str {
        match self {
            ErrCode::Ok => "OK",
            ErrCode::OtherErr => "OTHER_ERR",
            ErrCode::InvalidProtocol => "INVALID_PROTOCOL",
            ErrCode::CantContinue => "CANT_CONTINUE",
            ErrCode::NotStopped => "NOT_STOPPED",
            ErrCode::InvalidArgs => "INVALID_ARGS",
            ErrCode::ThreadDetached => "THREAD_DETACHED",
            ErrCode::ExecutionTimeout => "EXECUTION_TIMEOUT",
        }
    }
}

// Error-payload flag bits (protocol 3.1+ with ErrorFlags).
pub const ERR_FLAG_INVALID_VALUE_IN_PATH: u32 = 0x0001;
pub const ERR_FLAG_MISSING_KEY_IN_PATH: u32 = 0x0002;

/// Extra data carried by an error response when the target supports
/// error flags. At most one of the path indexes is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorData {
    pub err_flags: u32,
    pub invalid_value_path_index: Option<i32>,
    pub missing_key_path_index: Option<i32>,
}

/// Asynchronous update types sent without a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum UpdateType {
    ConnectIoPort = 1,
    AllThreadsStopped = 2,
    ThreadAttached = 3,
    BreakpointError = 4,
    CompileError = 5,
}

impl UpdateType {
    pub fn from_u32(raw: u32) -> Result<Self, ProtocolError> {
        Ok(match raw {
            1 => UpdateType::ConnectIoPort,
            2 => UpdateType::AllThreadsStopped,
            3 => UpdateType::ThreadAttached,
            4 => UpdateType::BreakpointError,
            5 => UpdateType::CompileError,
            other => return Err(ProtocolError::UnknownUpdateType(other)),
        })
    }
}

/// Why a thread is (or is not) stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStopReason {
    Undefined = 0,
    NotStopped = 1,
    NormalExit = 2,
    StopStatement = 3,
    Break = 4,
    Error = 5,
}

impl ThreadStopReason {
    pub fn from_u32(raw: u32) -> Result<Self, ProtocolError> {
        Ok(match raw {
            0 => ThreadStopReason::Undefined,
            1 => ThreadStopReason::NotStopped,
            2 => ThreadStopReason::NormalExit,
            3 => ThreadStopReason::StopStatement,
            4 => ThreadStopReason::Break,
            5 => ThreadStopReason::Error,
            other => return Err(ProtocolError::UnknownStopReason(other)),
        })
    }

    pub fn user_str(self) -> &'static str {
        match self {
            ThreadStopReason::Undefined => "<UNKNOWN>",
            ThreadStopReason::NotStopped => "Not Stopped",
            ThreadStopReason::NormalExit => "Normal Exit",
            ThreadStopReason::StopStatement => "STOP Statement",
            ThreadStopReason::Break => "Break",
            ThreadStopReason::Error => "Crash",
        }
    }
}

/// Variable type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VariableType {
    // There is no 0 value; it reads as "absent" in hex dumps
    Aa = 1,
    Array = 2,
    Boolean = 3,
    Double = 4,
    Float = 5,
    Function = 6,
    Integer = 7,
    Interface = 8,
    Invalid = 9,
    List = 10,
    LongInteger = 11,
    Object = 12,
    String = 13,
    Subroutine = 14,
    SubtypedObject = 15,
    /// Variable has a name but neither type nor value.
    Uninitialized = 16,
    /// Valid variable of a type this protocol version cannot express.
    Unknown = 17,
}

impl VariableType {
    pub fn from_u8(raw: u8) -> Result<Self, ProtocolError> {
        Ok(match raw {
            1 => VariableType::Aa,
            2 => VariableType::Array,
            3 => VariableType::Boolean,
            4 => VariableType::Double,
            5 => VariableType::Float,
            6 => VariableType::Function,
            7 => VariableType::Integer,
            8 => VariableType::Interface,
            9 => VariableType::Invalid,
            10 => VariableType::List,
            11 => VariableType::LongInteger,
            12 => VariableType::Object,
            13 => VariableType::String,
            14 => VariableType::Subroutine,
            15 => VariableType::SubtypedObject,
            16 => VariableType::Uninitialized,
            17 => VariableType::Unknown,
            other => return Err(ProtocolError::UnknownVariableType(other)),
        })
    }

    /// AA, Array and List always have sub-elements.
    pub fn is_always_container(self) -> bool {
        matches!(self, VariableType::Aa | VariableType::Array | VariableType::List)
    }

    /// Object and SubtypedObject sometimes do.
    pub fn may_be_container(self) -> bool {
        self.is_always_container()
            || matches!(self, VariableType::Object | VariableType::SubtypedObject)
    }
}

// VARINFO flag bits (one byte on the wire).
const VARINFO_IS_CHILD_KEY: u8 = 0x01;
const VARINFO_IS_CONST: u8 = 0x02;
const VARINFO_IS_CONTAINER: u8 = 0x04;
const VARINFO_IS_NAME_HERE: u8 = 0x08;
const VARINFO_IS_REF_COUNTED: u8 = 0x10;
const VARINFO_IS_VALUE_HERE: u8 = 0x20;
const VARINFO_IS_KEYS_CASE_SENSITIVE: u8 = 0x40;

/// Scalar payload of a variable, shaped by its type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    Boolean(bool),
    Integer(i32),
    LongInteger(i64),
    Float(f32),
    Double(f64),
    /// String, Function and Subroutine values.
    String(String),
}

/// One variable (or container child) from a VARIABLES response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Variable {
    /// Absent for array-indexed children.
    pub name: Option<String>,
    pub var_type: Option<VariableType>,
    /// Object/Interface/SubtypedObject runtime type, e.g. `roSGNode`.
    pub subtype: Option<String>,
    /// Second subtype of a SubtypedObject, e.g. `Node` in `roSGNode:Node`.
    pub sub_subtype: Option<String>,
    pub ref_count: Option<u32>,
    /// Key type of a container (String or Integer).
    pub key_type: Option<VariableType>,
    /// Element count of a container; `Some(0)` is a valid empty container.
    pub element_count: Option<u32>,
    pub value: Option<VariableValue>,
    pub is_child_key: bool,
    pub is_const: bool,
    pub is_container: bool,
    pub is_ref_counted: bool,
    /// Only meaningful for containers.
    pub keys_case_sensitive: bool,
}

impl Variable {
    fn read<R: Read>(reader: &mut WireReader<R>) -> Result<Self, ProtocolError> {
        let flags = reader.read_u8()?;
        let var_type = VariableType::from_u8(reader.read_u8()?)?;

        let mut var = Variable {
            var_type: Some(var_type),
            is_child_key: flags & VARINFO_IS_CHILD_KEY != 0,
            is_const: flags & VARINFO_IS_CONST != 0,
            ..Variable::default()
        };

        if flags & VARINFO_IS_NAME_HERE != 0 {
            var.name = Some(reader.read_utf8z()?);
        }
        if flags & VARINFO_IS_REF_COUNTED != 0 {
            var.is_ref_counted = true;
            var.ref_count = Some(reader.read_u32()?);
        }
        if flags & VARINFO_IS_CONTAINER != 0 {
            var.is_container = true;
            var.keys_case_sensitive = flags & VARINFO_IS_KEYS_CASE_SENSITIVE != 0;
            var.key_type = Some(VariableType::from_u8(reader.read_u8()?)?);
            var.element_count = Some(reader.read_u32()?);
        } else if flags & VARINFO_IS_KEYS_CASE_SENSITIVE != 0 {
            return Err(ProtocolError::CaseSensitivityOnScalar);
        }
        if flags & VARINFO_IS_VALUE_HERE != 0 {
            var.read_value(reader)?;
        }
        Ok(var)
    }

    fn read_value<R: Read>(&mut self, reader: &mut WireReader<R>) -> Result<(), ProtocolError> {
        let Some(var_type) = self.var_type else {
            return Err(ProtocolError::UnexpectedValue("<none>"));
        };
        match var_type {
            VariableType::Aa => return Err(ProtocolError::UnexpectedValue("AA")),
            VariableType::Array => return Err(ProtocolError::UnexpectedValue("Array")),
            VariableType::List => return Err(ProtocolError::UnexpectedValue("List")),
            VariableType::Boolean => self.value = Some(VariableValue::Boolean(reader.read_bool()?)),
            VariableType::Double => self.value = Some(VariableValue::Double(reader.read_f64()?)),
            VariableType::Float => self.value = Some(VariableValue::Float(reader.read_f32()?)),
            VariableType::Integer => self.value = Some(VariableValue::Integer(reader.read_i32()?)),
            VariableType::LongInteger => {
                self.value = Some(VariableValue::LongInteger(reader.read_i64()?))
            }
            VariableType::String | VariableType::Function | VariableType::Subroutine => {
                self.value = Some(VariableValue::String(reader.read_utf8z()?))
            }
            VariableType::Interface | VariableType::Object => {
                self.subtype = Some(reader.read_utf8z()?)
            }
            VariableType::SubtypedObject => {
                self.subtype = Some(reader.read_utf8z()?);
                self.sub_subtype = Some(reader.read_utf8z()?);
            }
            // Invalid carries no bytes; Uninitialized/Unknown never set the flag
            VariableType::Invalid => {}
            VariableType::Uninitialized => {
                return Err(ProtocolError::UnexpectedValue("Uninitialized"))
            }
            VariableType::Unknown => return Err(ProtocolError::UnexpectedValue("Unknown")),
        }
        Ok(())
    }

    fn write<W: Write>(&self, writer: &mut WireWriter<W>) -> Result<(), ProtocolError> {
        let mut flags = 0u8;
        if self.is_child_key {
            flags |= VARINFO_IS_CHILD_KEY;
        }
        if self.is_const {
            flags |= VARINFO_IS_CONST;
        }
        if self.is_container {
            flags |= VARINFO_IS_CONTAINER;
        }
        if self.name.is_some() {
            flags |= VARINFO_IS_NAME_HERE;
        }
        if self.is_ref_counted {
            flags |= VARINFO_IS_REF_COUNTED;
        }
        if self.has_wire_value() {
            flags |= VARINFO_IS_VALUE_HERE;
        }
        if self.keys_case_sensitive {
            flags |= VARINFO_IS_KEYS_CASE_SENSITIVE;
        }
        writer.write_u8(flags)?;
        writer.write_u8(self.var_type.unwrap_or(VariableType::Unknown) as u8)?;
        if let Some(name) = &self.name {
            writer.write_utf8z(name)?;
        }
        if self.is_ref_counted {
            writer.write_u32(self.ref_count.unwrap_or(0))?;
        }
        if self.is_container {
            writer.write_u8(self.key_type.unwrap_or(VariableType::String) as u8)?;
            writer.write_u32(self.element_count.unwrap_or(0))?;
        }
        if self.has_wire_value() {
            match (&self.value, self.var_type) {
                (Some(VariableValue::Boolean(v)), _) => writer.write_bool(*v)?,
                (Some(VariableValue::Integer(v)), _) => writer.write_i32(*v)?,
                (Some(VariableValue::LongInteger(v)), _) => writer.write_i64(*v)?,
                (Some(VariableValue::Float(v)), _) => writer.write_f32(*v)?,
                (Some(VariableValue::Double(v)), _) => writer.write_f64(*v)?,
                (Some(VariableValue::String(v)), _) => writer.write_utf8z(v)?,
                (None, Some(VariableType::SubtypedObject)) => {
                    writer.write_utf8z(self.subtype.as_deref().unwrap_or(""))?;
                    writer.write_utf8z(self.sub_subtype.as_deref().unwrap_or(""))?;
                }
                (None, _) => {
                    writer.write_utf8z(self.subtype.as_deref().unwrap_or(""))?;
                }
            }
        }
        Ok(())
    }

    /// Whether the wire representation sets IS_VALUE_HERE.
    fn has_wire_value(&self) -> bool {
        self.value.is_some() || self.subtype.is_some()
    }

    /// Runtime type name shown to users.
    pub fn type_name_for_user(&self) -> String {
        let subtype = self.subtype.as_deref().unwrap_or("");
        match self.var_type {
            Some(VariableType::Aa) => "roAssociativeArray".into(),
            Some(VariableType::Array) => "roArray".into(),
            Some(VariableType::Boolean) => "Boolean".into(),
            Some(VariableType::Double) => "Double".into(),
            Some(VariableType::Float) => "Float".into(),
            Some(VariableType::Function) => "Function".into(),
            Some(VariableType::Integer) => "Integer".into(),
            Some(VariableType::Interface) => format!("Interface:{subtype}"),
            Some(VariableType::Invalid) => "Invalid".into(),
            Some(VariableType::List) => "roList".into(),
            Some(VariableType::LongInteger) => "LongInteger".into(),
            Some(VariableType::Object) => subtype.into(),
            Some(VariableType::String) => {
                if self.is_const {
                    "String (VT_STR_CONST)".into()
                } else {
                    "roString".into()
                }
            }
            Some(VariableType::Subroutine) => "Subroutine".into(),
            Some(VariableType::SubtypedObject) => {
                format!("{subtype}:{}", self.sub_subtype.as_deref().unwrap_or(""))
            }
            Some(VariableType::Uninitialized) => "<uninitialized>".into(),
            Some(VariableType::Unknown) | None => "<UNKNOWN>".into(),
        }
    }

    /// Value rendering shown to users; falls back to the type name for
    /// opaque values when `use_type_if_no_value` is set.
    pub fn value_str_for_user(&self, use_type_if_no_value: bool) -> String {
        let mut s = match (&self.value, self.var_type) {
            (Some(VariableValue::Boolean(v)), _) => if *v { "true" } else { "false" }.to_string(),
            (_, Some(VariableType::Invalid)) => "invalid".into(),
            (Some(VariableValue::String(v)), Some(VariableType::String)) => format!("\"{v}\""),
            (Some(VariableValue::String(v)), _) => v.clone(),
            (Some(VariableValue::Integer(v)), _) => v.to_string(),
            (Some(VariableValue::LongInteger(v)), _) => v.to_string(),
            (Some(VariableValue::Float(v)), _) => v.to_string(),
            (Some(VariableValue::Double(v)), _) => v.to_string(),
            (_, Some(VariableType::Uninitialized)) => "<uninitialized>".into(),
            (None, _) if use_type_if_no_value => self.type_name_for_user(),
            (None, _) => String::new(),
        };
        if self.keys_case_sensitive {
            if !s.is_empty() {
                s.push(' ');
            }
            s.push_str("casesensitive");
        }
        if let Some(count) = self.element_count {
            if !s.is_empty() {
                s.push(' ');
            }
            s.push_str(&format!("el_cnt={count}"));
        }
        if let Some(refs) = self.ref_count {
            if !s.is_empty() {
                s.push(' ');
            }
            s.push_str(&format!("ref_cnt={refs}"));
        }
        s
    }
}

// THREADINFO flag bits.
const THREADINFO_IS_PRIMARY: u8 = 0x01;
const THREADINFO_IS_DETACHED: u8 = 0x02;

/// One thread from a THREADS response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub is_primary: bool,
    pub is_detached: bool,
    pub stop_reason: ThreadStopReason,
    pub stop_reason_detail: String,
    pub line_number: u32,
    pub function_name: String,
    pub file_path: String,
    /// May be empty; some firmware drops the snippet.
    pub code_snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThreadsResponse {
    pub threads: Vec<ThreadInfo>,
}

impl ThreadsResponse {
    pub fn primary_index(&self) -> Option<usize> {
        self.threads.iter().position(|t| t.is_primary)
    }
}

/// One frame from a STACKTRACE response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub line_number: u32,
    pub function_name: String,
    pub file_path: String,
}

/// Frames ordered oldest-first: index 0 is the outermost call, the last
/// entry is the innermost (current) frame. The wire order is reversed
/// during decoding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StacktraceResponse {
    pub frames: Vec<StackFrame>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VariablesResponse {
    pub variables: Vec<Variable>,
}

impl VariablesResponse {
    /// The looked-up variable itself (as opposed to its children); absent
    /// when the request targeted a whole stack frame.
    pub fn parent_var(&self) -> Option<&Variable> {
        self.variables.iter().find(|v| !v.is_child_key)
    }

    pub fn child_vars(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter().filter(|v| v.is_child_key)
    }
}

/// Per-breakpoint result in add/list/remove responses. Entries correspond
/// positionally to the request. `ignore_count` is only on the wire when
/// the target accepted the breakpoint (non-zero `remote_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointInfo {
    pub remote_id: u32,
    pub err_code: ErrCode,
    pub ignore_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BreakpointsResponse {
    pub breakpoints: Vec<BreakpointInfo>,
}

/// EXECUTE response (protocol 3.0+; earlier targets send no payload).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecuteResponse {
    pub run_success: bool,
    pub run_stop_code: u8,
    pub compile_errors: Vec<String>,
    pub runtime_errors: Vec<String>,
    pub other_errors: Vec<String>,
}

/// BREAKPOINT_ERROR asynchronous update.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BreakpointErrorUpdate {
    pub flags: u32,
    pub breakpoint_id: u32,
    pub compile_errors: Vec<String>,
    pub runtime_errors: Vec<String>,
    pub other_errors: Vec<String>,
}

/// COMPILE_ERROR asynchronous update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileErrorUpdate {
    pub flags: u32,
    pub error_message: String,
    pub file_uri: String,
    pub line_number: u32,
    /// Empty string on the wire means "no library".
    pub library_name: Option<String>,
}

impl CompileErrorUpdate {
    pub fn format_for_user(&self) -> String {
        let mut s = format!("{}: {}", self.error_message, self.file_uri);
        if self.line_number > 0 {
            s.push_str(&format!("({})", self.line_number));
        }
        if let Some(lib) = &self.library_name {
            s.push_str(&format!(" (lib {lib})"));
        }
        s
    }
}

/// Typed payload of a decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePayload {
    /// Successful response with no payload (stop, continue, step,
    /// exit_channel, and pre-3.0 execute).
    CommandAck,
    Threads(ThreadsResponse),
    Stacktrace(StacktraceResponse),
    Variables(VariablesResponse),
    Breakpoints(BreakpointsResponse),
    Execute(ExecuteResponse),
    /// Response with `err_code != OK`.
    TargetError(ErrorData),
    ConnectIoPort {
        io_port: u32,
    },
    AllThreadsStopped {
        primary_thread_index: i32,
        stop_reason: ThreadStopReason,
        stop_reason_detail: String,
    },
    ThreadAttached {
        thread_index: i32,
        stop_reason: ThreadStopReason,
        stop_reason_detail: String,
    },
    BreakpointError(BreakpointErrorUpdate),
    CompileError(CompileErrorUpdate),
}

impl UpdatePayload {
    /// Wire update type for asynchronous payloads; `None` for responses.
    pub fn update_type(&self) -> Option<UpdateType> {
        match self {
            UpdatePayload::ConnectIoPort { .. } => Some(UpdateType::ConnectIoPort),
            UpdatePayload::AllThreadsStopped { .. } => Some(UpdateType::AllThreadsStopped),
            UpdatePayload::ThreadAttached { .. } => Some(UpdateType::ThreadAttached),
            UpdatePayload::BreakpointError(_) => Some(UpdateType::BreakpointError),
            UpdatePayload::CompileError(_) => Some(UpdateType::CompileError),
            _ => None,
        }
    }
}

/// A decoded message from the target, with the originating request (if
/// any) reattached by the demultiplexer.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub request_id: u32,
    pub err_code: ErrCode,
    /// Declared length, when the feature is active.
    pub packet_length: Option<u32>,
    /// The request this message answers; `None` for asynchronous updates
    /// that did not resolve a pending request.
    pub request: Option<Request>,
    pub payload: UpdatePayload,
}

impl Update {
    pub fn is_response(&self) -> bool {
        self.request_id != 0
    }

    pub fn is_error(&self) -> bool {
        self.err_code != ErrCode::Ok
    }

    pub fn update_type(&self) -> Option<UpdateType> {
        self.payload.update_type()
    }
}

/// Read and demultiplex one message from the target.
///
/// `take_request` must remove and return the pending request with the
/// given id; a response without a pending entry is a fatal protocol
/// error. Matching asynchronous updates against pending requests that
/// allow them (e.g. a step resolving via ALL_THREADS_STOPPED) is the
/// caller's job after this returns, since it needs registry access this
/// function does not have.
pub fn read_update<R, F>(
    reader: &mut WireReader<R>,
    features: &FeatureSet,
    take_request: F,
) -> Result<Update, ProtocolError>
where
    R: Read,
    F: FnOnce(u32) -> Option<Request>,
{
    reader.reset_byte_count();

    let packet_length = if features.has(ProtocolFeature::UpdatesHavePacketLength) {
        Some(reader.read_u32()?)
    } else {
        None
    };
    let request_id = reader.read_u32()?;
    let err_code = ErrCode::from_u32(reader.read_u32()?)?;

    let request = if request_id != 0 {
        match take_request(request_id) {
            Some(request) => Some(request),
            None => return Err(ProtocolError::UnknownRequestId(request_id)),
        }
    } else {
        None
    };

    let payload = if err_code != ErrCode::Ok {
        UpdatePayload::TargetError(read_error_data(reader, features)?)
    } else if let Some(request) = &request {
        read_response_payload(reader, features, request.command())?
    } else {
        let update_type = UpdateType::from_u32(reader.read_u32()?)?;
        read_async_payload(reader, update_type)?
    };

    // Forward compatibility: newer targets may append fields we do not
    // understand; skip up to the declared length.
    if let Some(declared) = packet_length {
        let consumed = reader.bytes_read();
        if consumed < u64::from(declared) {
            reader.skip(u64::from(declared) - consumed)?;
        } else if consumed > u64::from(declared) {
            return Err(ProtocolError::PacketLengthMismatch { declared, consumed });
        }
    }

    Ok(Update { request_id, err_code, packet_length, request, payload })
}

fn read_error_data<R: Read>(
    reader: &mut WireReader<R>,
    features: &FeatureSet,
) -> Result<ErrorData, ProtocolError> {
    let mut data = ErrorData::default();
    if features.has(ProtocolFeature::ErrorFlags) {
        data.err_flags = reader.read_u32()?;
        if data.err_flags & ERR_FLAG_INVALID_VALUE_IN_PATH != 0 {
            data.invalid_value_path_index = Some(reader.read_i32()?);
        }
        if data.err_flags & ERR_FLAG_MISSING_KEY_IN_PATH != 0 {
            data.missing_key_path_index = Some(reader.read_i32()?);
        }
    }
    Ok(data)
}

fn read_response_payload<R: Read>(
    reader: &mut WireReader<R>,
    features: &FeatureSet,
    command: Command,
) -> Result<UpdatePayload, ProtocolError> {
    Ok(match command {
        Command::Stop | Command::Continue | Command::Step | Command::ExitChannel => {
            UpdatePayload::CommandAck
        }
        Command::Threads => {
            let count = reader.read_u32()?;
            let mut threads = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let flags = reader.read_u8()?;
                let stop_reason = ThreadStopReason::from_u32(reader.read_u32()?)?;
                let stop_reason_detail = reader.read_utf8z()?;
                let line_number = reader.read_u32()?;
                let function_name = reader.read_utf8z()?;
                let file_path = reader.read_utf8z()?;
                let code_snippet = reader.read_utf8z()?;
                threads.push(ThreadInfo {
                    is_primary: flags & THREADINFO_IS_PRIMARY != 0,
                    is_detached: flags & THREADINFO_IS_DETACHED != 0,
                    stop_reason,
                    stop_reason_detail,
                    line_number,
                    function_name,
                    file_path,
                    code_snippet,
                });
            }
            UpdatePayload::Threads(ThreadsResponse { threads })
        }
        Command::Stacktrace => {
            let count = reader.read_u32()?;
            let mut frames = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let line_number = reader.read_u32()?;
                let function_name = reader.read_utf8z()?;
                let file_path = reader.read_utf8z()?;
                frames.push(StackFrame { line_number, function_name, file_path });
            }
            // The wire carries innermost-first; callers index oldest-first.
            frames.reverse();
            UpdatePayload::Stacktrace(StacktraceResponse { frames })
        }
        Command::Variables => {
            let count = reader.read_u32()?;
            let mut variables = Vec::with_capacity(count as usize);
            for _ in 0..count {
                variables.push(Variable::read(reader)?);
            }
            UpdatePayload::Variables(VariablesResponse { variables })
        }
        Command::AddBreakpoints
        | Command::AddConditionalBreakpoints
        | Command::ListBreakpoints
        | Command::RemoveBreakpoints => {
            let count = reader.read_u32()?;
            let mut breakpoints = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let remote_id = reader.read_u32()?;
                let err_code = ErrCode::from_u32(reader.read_u32()?)?;
                let ignore_count = if remote_id != 0 { Some(reader.read_u32()?) } else { None };
                breakpoints.push(BreakpointInfo { remote_id, err_code, ignore_count });
            }
            UpdatePayload::Breakpoints(BreakpointsResponse { breakpoints })
        }
        Command::Execute => {
            if !features.has(ProtocolFeature::ExecuteReturnsErrors) {
                return Ok(UpdatePayload::CommandAck);
            }
            let run_success = reader.read_bool()?;
            let run_stop_code = reader.read_u8()?;
            let compile_errors = read_string_list(reader)?;
            let runtime_errors = read_string_list(reader)?;
            let other_errors = read_string_list(reader)?;
            UpdatePayload::Execute(ExecuteResponse {
                run_success,
                run_stop_code,
                compile_errors,
                runtime_errors,
                other_errors,
            })
        }
    })
}

fn read_async_payload<R: Read>(
    reader: &mut WireReader<R>,
    update_type: UpdateType,
) -> Result<UpdatePayload, ProtocolError> {
    Ok(match update_type {
        UpdateType::ConnectIoPort => UpdatePayload::ConnectIoPort { io_port: reader.read_u32()? },
        UpdateType::AllThreadsStopped => {
            let primary_thread_index = reader.read_i32()?;
            let stop_reason = ThreadStopReason::from_u32(u32::from(reader.read_u8()?))?;
            let stop_reason_detail = reader.read_utf8z()?;
            UpdatePayload::AllThreadsStopped {
                primary_thread_index,
                stop_reason,
                stop_reason_detail,
            }
        }
        UpdateType::ThreadAttached => {
            let thread_index = reader.read_i32()?;
            let stop_reason = ThreadStopReason::from_u32(u32::from(reader.read_u8()?))?;
            let stop_reason_detail = reader.read_utf8z()?;
            UpdatePayload::ThreadAttached { thread_index, stop_reason, stop_reason_detail }
        }
        UpdateType::BreakpointError => {
            let flags = reader.read_u32()?;
            let breakpoint_id = reader.read_u32()?;
            let compile_errors = read_string_list(reader)?;
            let runtime_errors = read_string_list(reader)?;
            let other_errors = read_string_list(reader)?;
            UpdatePayload::BreakpointError(BreakpointErrorUpdate {
                flags,
                breakpoint_id,
                compile_errors,
                runtime_errors,
                other_errors,
            })
        }
        UpdateType::CompileError => {
            let flags = reader.read_u32()?;
            let error_message = reader.read_utf8z()?;
            let file_uri = reader.read_utf8z()?;
            let line_number = reader.read_u32()?;
            let library_name = match reader.read_utf8z()? {
                s if s.is_empty() => None,
                s => Some(s),
            };
            UpdatePayload::CompileError(CompileErrorUpdate {
                flags,
                error_message,
                file_uri,
                line_number,
                library_name,
            })
        }
    })
}

fn read_string_list<R: Read>(reader: &mut WireReader<R>) -> Result<Vec<String>, ProtocolError> {
    let count = reader.read_u32()?;
    let mut list = Vec::with_capacity(count as usize);
    for _ in 0..count {
        list.push(reader.read_utf8z()?);
    }
    Ok(list)
}

/// Serialize one message the way a target would. Fake targets and the
/// decode/encode round-trip tests are the consumers.
pub fn write_update<W: Write>(
    update: &Update,
    features: &FeatureSet,
    writer: &mut WireWriter<W>,
) -> Result<(), ProtocolError> {
    // Body first so the packet length can be computed.
    let mut body = WireWriter::new(Vec::new());
    body.write_u32(update.request_id)?;
    body.write_u32(update.err_code as u32)?;
    if let Some(update_type) = update.payload.update_type() {
        body.write_u32(update_type as u32)?;
    }
    write_payload(&update.payload, features, &mut body)?;
    let body = body.into_inner();

    if features.has(ProtocolFeature::UpdatesHavePacketLength) {
        writer.write_u32(body.len() as u32 + 4)?;
    }
    writer.write_bytes(&body)?;
    writer.flush()?;
    Ok(())
}

fn write_payload<W: Write>(
    payload: &UpdatePayload,
    features: &FeatureSet,
    writer: &mut WireWriter<W>,
) -> Result<(), ProtocolError> {
    match payload {
        UpdatePayload::CommandAck => {}
        UpdatePayload::TargetError(data) => {
            if features.has(ProtocolFeature::ErrorFlags) {
                writer.write_u32(data.err_flags)?;
                if let Some(index) = data.invalid_value_path_index {
                    writer.write_i32(index)?;
                }
                if let Some(index) = data.missing_key_path_index {
                    writer.write_i32(index)?;
                }
            }
        }
        UpdatePayload::Threads(response) => {
            writer.write_u32(response.threads.len() as u32)?;
            for t in &response.threads {
                let mut flags = 0u8;
                if t.is_primary {
                    flags |= THREADINFO_IS_PRIMARY;
                }
                if t.is_detached {
                    flags |= THREADINFO_IS_DETACHED;
                }
                writer.write_u8(flags)?;
                writer.write_u32(t.stop_reason as u32)?;
                writer.write_utf8z(&t.stop_reason_detail)?;
                writer.write_u32(t.line_number)?;
                writer.write_utf8z(&t.function_name)?;
                writer.write_utf8z(&t.file_path)?;
                writer.write_utf8z(&t.code_snippet)?;
            }
        }
        UpdatePayload::Stacktrace(response) => {
            // Emit innermost-first, as the target does.
            writer.write_u32(response.frames.len() as u32)?;
            for frame in response.frames.iter().rev() {
                writer.write_u32(frame.line_number)?;
                writer.write_utf8z(&frame.function_name)?;
                writer.write_utf8z(&frame.file_path)?;
            }
        }
        UpdatePayload::Variables(response) => {
            writer.write_u32(response.variables.len() as u32)?;
            for var in &response.variables {
                var.write(writer)?;
            }
        }
        UpdatePayload::Breakpoints(response) => {
            writer.write_u32(response.breakpoints.len() as u32)?;
            for info in &response.breakpoints {
                writer.write_u32(info.remote_id)?;
                writer.write_u32(info.err_code as u32)?;
                if info.remote_id != 0 {
                    writer.write_u32(info.ignore_count.unwrap_or(0))?;
                }
            }
        }
        UpdatePayload::Execute(response) => {
            writer.write_bool(response.run_success)?;
            writer.write_u8(response.run_stop_code)?;
            write_string_list(writer, &response.compile_errors)?;
            write_string_list(writer, &response.runtime_errors)?;
            write_string_list(writer, &response.other_errors)?;
        }
        UpdatePayload::ConnectIoPort { io_port } => {
            writer.write_u32(*io_port)?;
        }
        UpdatePayload::AllThreadsStopped {
            primary_thread_index,
            stop_reason,
            stop_reason_detail,
        } => {
            writer.write_i32(*primary_thread_index)?;
            writer.write_u8(*stop_reason as u8)?;
            writer.write_utf8z(stop_reason_detail)?;
        }
        UpdatePayload::ThreadAttached { thread_index, stop_reason, stop_reason_detail } => {
            writer.write_i32(*thread_index)?;
            writer.write_u8(*stop_reason as u8)?;
            writer.write_utf8z(stop_reason_detail)?;
        }
        UpdatePayload::BreakpointError(update) => {
            writer.write_u32(update.flags)?;
            writer.write_u32(update.breakpoint_id)?;
            write_string_list(writer, &update.compile_errors)?;
            write_string_list(writer, &update.runtime_errors)?;
            write_string_list(writer, &update.other_errors)?;
        }
        UpdatePayload::CompileError(update) => {
            writer.write_u32(update.flags)?;
            writer.write_utf8z(&update.error_message)?;
            writer.write_utf8z(&update.file_uri)?;
            writer.write_u32(update.line_number)?;
            writer.write_utf8z(update.library_name.as_deref().unwrap_or(""))?;
        }
    }
    Ok(())
}

fn write_string_list<W: Write>(
    writer: &mut WireWriter<W>,
    list: &[String],
) -> Result<(), ProtocolError> {
    writer.write_u32(list.len() as u32)?;
    for s in list {
        writer.write_utf8z(s)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestArgs;
    use crate::version::ProtocolVersion;
    use std::io::Cursor;

    fn features_v3() -> FeatureSet {
        FeatureSet::from_version(
            ProtocolVersion::new(3, 1, 1).with_platform_revision(1_700_000_000_000),
        )
    }

    fn features_v1() -> FeatureSet {
        FeatureSet::from_version(ProtocolVersion::new(1, 2, 0))
    }

    fn round_trip(update: Update, features: &FeatureSet, request: Option<Request>) -> Update {
        let mut writer = WireWriter::new(Vec::new());
        write_update(&update, features, &mut writer).unwrap();
        let mut reader = WireReader::new(Cursor::new(writer.into_inner()));
        let decoded = read_update(&mut reader, features, move |_| request).unwrap();
        assert_eq!(decoded.payload, update.payload);
        assert_eq!(decoded.request_id, update.request_id);
        assert_eq!(decoded.err_code, update.err_code);
        decoded
    }

    fn response(request_id: u32, payload: UpdatePayload) -> Update {
        Update { request_id, err_code: ErrCode::Ok, packet_length: None, request: None, payload }
    }

    fn async_update(payload: UpdatePayload) -> Update {
        Update { request_id: 0, err_code: ErrCode::Ok, packet_length: None, request: None, payload }
    }

    fn pending(request_id: u32, args: RequestArgs) -> Request {
        let mut request = Request::new(args);
        request.request_id = request_id;
        request
    }

    #[test]
    fn round_trips_threads_response() {
        let update = response(
            5,
            UpdatePayload::Threads(ThreadsResponse {
                threads: vec![
                    ThreadInfo {
                        is_primary: true,
                        is_detached: false,
                        stop_reason: ThreadStopReason::Break,
                        stop_reason_detail: "Break".into(),
                        line_number: 10,
                        function_name: "main".into(),
                        file_path: "pkg:/source/main.brs".into(),
                        code_snippet: "print i".into(),
                    },
                    ThreadInfo {
                        is_primary: false,
                        is_detached: false,
                        stop_reason: ThreadStopReason::Break,
                        stop_reason_detail: "Break".into(),
                        line_number: 42,
                        function_name: "task".into(),
                        file_path: "pkg:/components/task.brs".into(),
                        code_snippet: String::new(),
                    },
                ],
            }),
        );
        let decoded = round_trip(update, &features_v3(), Some(pending(5, RequestArgs::Threads)));
        let UpdatePayload::Threads(threads) = decoded.payload else { panic!("wrong payload") };
        assert_eq!(threads.primary_index(), Some(0));
    }

    #[test]
    fn stacktrace_frames_reversed_to_oldest_first() {
        // Wire order is innermost-first; the decoded response is
        // oldest-first, so the round trip preserves our order while the
        // bytes carry the reverse.
        let frames = vec![
            StackFrame { line_number: 1, function_name: "main".into(), file_path: "pkg:/source/main.brs".into() },
            StackFrame { line_number: 17, function_name: "helper".into(), file_path: "pkg:/source/util.brs".into() },
        ];
        let update = response(9, UpdatePayload::Stacktrace(StacktraceResponse { frames }));
        let features = features_v3();

        let mut writer = WireWriter::new(Vec::new());
        write_update(&update, &features, &mut writer).unwrap();
        let bytes = writer.into_inner();

        // First frame on the wire is the innermost one (line 17).
        // Layout: packet_length(4) request_id(4) err(4) count(4) line(4)...
        assert_eq!(&bytes[12..16], &[2, 0, 0, 0]);
        assert_eq!(&bytes[16..20], &[17, 0, 0, 0]);

        let mut reader = WireReader::new(Cursor::new(bytes));
        let decoded = read_update(&mut reader, &features, |_| {
            Some(pending(9, RequestArgs::Stacktrace { thread_index: 0 }))
        })
        .unwrap();
        let UpdatePayload::Stacktrace(st) = decoded.payload else { panic!("wrong payload") };
        assert_eq!(st.frames[0].function_name, "main");
        assert_eq!(st.frames[1].function_name, "helper");
    }

    #[test]
    fn round_trips_variable_shapes() {
        let variables = vec![
            Variable {
                name: Some("m".into()),
                var_type: Some(VariableType::Aa),
                key_type: Some(VariableType::String),
                element_count: Some(3),
                ref_count: Some(2),
                is_ref_counted: true,
                is_container: true,
                keys_case_sensitive: true,
                ..Variable::default()
            },
            Variable {
                name: Some("count".into()),
                var_type: Some(VariableType::Integer),
                value: Some(VariableValue::Integer(-3)),
                is_child_key: true,
                ..Variable::default()
            },
            Variable {
                name: Some("ratio".into()),
                var_type: Some(VariableType::Float),
                value: Some(VariableValue::Float(0.5)),
                is_child_key: true,
                ..Variable::default()
            },
            Variable {
                name: Some("title".into()),
                var_type: Some(VariableType::String),
                value: Some(VariableValue::String("Hello".into())),
                is_child_key: true,
                is_const: true,
                ..Variable::default()
            },
            Variable {
                name: Some("node".into()),
                var_type: Some(VariableType::SubtypedObject),
                subtype: Some("roSGNode".into()),
                sub_subtype: Some("Node".into()),
                is_child_key: true,
                ..Variable::default()
            },
            Variable {
                name: Some("port".into()),
                var_type: Some(VariableType::Object),
                subtype: Some("roMessagePort".into()),
                is_child_key: true,
                ..Variable::default()
            },
            Variable {
                name: Some("big".into()),
                var_type: Some(VariableType::LongInteger),
                value: Some(VariableValue::LongInteger(1 << 40)),
                is_child_key: true,
                ..Variable::default()
            },
            Variable {
                name: Some("nothing".into()),
                var_type: Some(VariableType::Uninitialized),
                is_child_key: true,
                ..Variable::default()
            },
        ];
        let update = response(3, UpdatePayload::Variables(VariablesResponse { variables }));
        let decoded = round_trip(
            update,
            &features_v3(),
            Some(pending(3, RequestArgs::Variables(Default::default()))),
        );
        let UpdatePayload::Variables(vars) = decoded.payload else { panic!("wrong payload") };
        assert!(vars.parent_var().is_some());
        assert_eq!(vars.child_vars().count(), 7);
    }

    #[test]
    fn case_sensitive_flag_on_scalar_is_fatal() {
        let features = features_v1();
        let mut writer = WireWriter::new(Vec::new());
        writer.write_u32(4).unwrap(); // request_id
        writer.write_u32(0).unwrap(); // OK
        writer.write_u32(1).unwrap(); // one variable
        writer.write_u8(VARINFO_IS_KEYS_CASE_SENSITIVE).unwrap();
        writer.write_u8(VariableType::Integer as u8).unwrap();
        let mut reader = WireReader::new(Cursor::new(writer.into_inner()));
        let result = read_update(&mut reader, &features, |_| {
            Some(pending(4, RequestArgs::Variables(Default::default())))
        });
        assert!(matches!(result, Err(ProtocolError::CaseSensitivityOnScalar)));
    }

    #[test]
    fn round_trips_breakpoint_responses() {
        let update = response(
            7,
            UpdatePayload::Breakpoints(BreakpointsResponse {
                breakpoints: vec![
                    BreakpointInfo { remote_id: 1001, err_code: ErrCode::Ok, ignore_count: Some(0) },
                    BreakpointInfo { remote_id: 1002, err_code: ErrCode::Ok, ignore_count: Some(5) },
                    // Rejected entry: no remote id, no ignore count on the wire.
                    BreakpointInfo {
                        remote_id: 0,
                        err_code: ErrCode::InvalidArgs,
                        ignore_count: None,
                    },
                ],
            }),
        );
        round_trip(
            update,
            &features_v3(),
            Some(pending(7, RequestArgs::AddBreakpoints { breakpoints: vec![] })),
        );
    }

    #[test]
    fn round_trips_execute_response() {
        let update = response(
            11,
            UpdatePayload::Execute(ExecuteResponse {
                run_success: false,
                run_stop_code: 2,
                compile_errors: vec!["syntax error".into()],
                runtime_errors: vec![],
                other_errors: vec!["mystery".into()],
            }),
        );
        round_trip(
            update,
            &features_v3(),
            Some(pending(
                11,
                RequestArgs::Execute { thread_index: 0, frame_index: 0, source_code: "?1".into() },
            )),
        );
    }

    #[test]
    fn execute_response_is_bare_ack_before_v3() {
        let features = features_v1();
        let update = response(2, UpdatePayload::CommandAck);
        let mut writer = WireWriter::new(Vec::new());
        write_update(&update, &features, &mut writer).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 8); // no packet length, no payload
        let mut reader = WireReader::new(Cursor::new(bytes));
        let decoded = read_update(&mut reader, &features, |_| {
            Some(pending(
                2,
                RequestArgs::Execute { thread_index: 0, frame_index: 0, source_code: "?1".into() },
            ))
        })
        .unwrap();
        assert_eq!(decoded.payload, UpdatePayload::CommandAck);
    }

    #[test]
    fn round_trips_async_updates() {
        let features = features_v3();
        round_trip(async_update(UpdatePayload::ConnectIoPort { io_port: 8085 }), &features, None);
        round_trip(
            async_update(UpdatePayload::AllThreadsStopped {
                primary_thread_index: 0,
                stop_reason: ThreadStopReason::Break,
                stop_reason_detail: String::new(),
            }),
            &features,
            None,
        );
        round_trip(
            async_update(UpdatePayload::ThreadAttached {
                thread_index: -1,
                stop_reason: ThreadStopReason::Undefined,
                stop_reason_detail: "entered".into(),
            }),
            &features,
            None,
        );
        round_trip(
            async_update(UpdatePayload::BreakpointError(BreakpointErrorUpdate {
                flags: 0,
                breakpoint_id: 1001,
                compile_errors: vec!["bad condition".into()],
                runtime_errors: vec![],
                other_errors: vec![],
            })),
            &features,
            None,
        );
        round_trip(
            async_update(UpdatePayload::CompileError(CompileErrorUpdate {
                flags: 0,
                error_message: "Syntax Error".into(),
                file_uri: "pkg:/source/main.brs".into(),
                line_number: 12,
                library_name: None,
            })),
            &features,
            None,
        );
    }

    #[test]
    fn negative_thread_index_preserved() {
        let features = features_v3();
        let decoded = round_trip(
            async_update(UpdatePayload::AllThreadsStopped {
                primary_thread_index: -2,
                stop_reason: ThreadStopReason::Error,
                stop_reason_detail: "crash".into(),
            }),
            &features,
            None,
        );
        let UpdatePayload::AllThreadsStopped { primary_thread_index, .. } = decoded.payload else {
            panic!("wrong payload");
        };
        assert_eq!(primary_thread_index, -2);
    }

    #[test]
    fn error_response_with_missing_key_index() {
        let features = features_v3();
        let update = Update {
            request_id: 13,
            err_code: ErrCode::InvalidArgs,
            packet_length: None,
            request: None,
            payload: UpdatePayload::TargetError(ErrorData {
                err_flags: ERR_FLAG_MISSING_KEY_IN_PATH,
                invalid_value_path_index: None,
                missing_key_path_index: Some(1),
            }),
        };
        let decoded = round_trip(
            update,
            &features,
            Some(pending(13, RequestArgs::Variables(Default::default()))),
        );
        assert!(decoded.is_error());
        let UpdatePayload::TargetError(data) = decoded.payload else { panic!("wrong payload") };
        assert_eq!(data.missing_key_path_index, Some(1));
        assert_eq!(data.invalid_value_path_index, None);
    }

    #[test]
    fn error_response_without_error_flags_feature_has_no_extra_data() {
        let features = features_v1();
        let mut writer = WireWriter::new(Vec::new());
        writer.write_u32(21).unwrap();
        writer.write_u32(ErrCode::NotStopped as u32).unwrap();
        let mut reader = WireReader::new(Cursor::new(writer.into_inner()));
        let decoded = read_update(&mut reader, &features, |_| {
            Some(pending(21, RequestArgs::Threads))
        })
        .unwrap();
        assert_eq!(decoded.err_code, ErrCode::NotStopped);
        assert_eq!(decoded.payload, UpdatePayload::TargetError(ErrorData::default()));
    }

    #[test]
    fn padding_after_payload_is_skipped() {
        let features = features_v3();
        // Hand-build: packet_length covers 4 extra trailing bytes.
        let mut body = WireWriter::new(Vec::new());
        body.write_u32(0).unwrap(); // request_id: async
        body.write_u32(0).unwrap(); // OK
        body.write_u32(UpdateType::ConnectIoPort as u32).unwrap();
        body.write_u32(8085).unwrap();
        let mut body = body.into_inner();
        body.extend_from_slice(&[0xEE; 4]);

        let mut framed = WireWriter::new(Vec::new());
        framed.write_u32(body.len() as u32 + 4).unwrap();
        let mut framed = framed.into_inner();
        framed.extend_from_slice(&body);

        let mut reader = WireReader::new(Cursor::new(framed));
        let decoded = read_update(&mut reader, &features, |_| None).unwrap();
        assert_eq!(decoded.payload, UpdatePayload::ConnectIoPort { io_port: 8085 });
        assert_eq!(decoded.packet_length, Some(24));
        assert_eq!(reader.bytes_read(), 24);
    }

    #[test]
    fn overrun_of_declared_packet_length_is_fatal() {
        let features = features_v3();
        let mut writer = WireWriter::new(Vec::new());
        writer.write_u32(8).unwrap(); // declared: header only, too short
        writer.write_u32(0).unwrap();
        writer.write_u32(0).unwrap();
        writer.write_u32(UpdateType::ConnectIoPort as u32).unwrap();
        writer.write_u32(8085).unwrap();
        let mut reader = WireReader::new(Cursor::new(writer.into_inner()));
        let result = read_update(&mut reader, &features, |_| None);
        assert!(matches!(result, Err(ProtocolError::PacketLengthMismatch { declared: 8, .. })));
    }

    #[test]
    fn response_for_unknown_request_id_is_fatal() {
        let features = features_v1();
        let mut writer = WireWriter::new(Vec::new());
        writer.write_u32(77).unwrap();
        writer.write_u32(0).unwrap();
        let mut reader = WireReader::new(Cursor::new(writer.into_inner()));
        let result = read_update(&mut reader, &features, |_| None);
        assert!(matches!(result, Err(ProtocolError::UnknownRequestId(77))));
    }

    #[test]
    fn unknown_update_type_is_fatal() {
        let features = features_v1();
        let mut writer = WireWriter::new(Vec::new());
        writer.write_u32(0).unwrap();
        writer.write_u32(0).unwrap();
        writer.write_u32(42).unwrap();
        let mut reader = WireReader::new(Cursor::new(writer.into_inner()));
        let result = read_update(&mut reader, &features, |_| None);
        assert!(matches!(result, Err(ProtocolError::UnknownUpdateType(42))));
    }

    #[test]
    fn variable_user_strings() {
        let var = Variable {
            name: Some("node".into()),
            var_type: Some(VariableType::SubtypedObject),
            subtype: Some("roSGNode".into()),
            sub_subtype: Some("Node".into()),
            is_container: true,
            key_type: Some(VariableType::String),
            element_count: Some(4),
            ..Variable::default()
        };
        assert_eq!(var.type_name_for_user(), "roSGNode:Node");
        assert_eq!(var.value_str_for_user(true), "el_cnt=4");

        let s = Variable {
            var_type: Some(VariableType::String),
            value: Some(VariableValue::String("hi".into())),
            ..Variable::default()
        };
        assert_eq!(s.value_str_for_user(true), "\"hi\"");
    }
}
