//! Wire protocol for the BrightScript remote debugger.
//!
//! This crate implements the binary protocol a Roku device speaks on its
//! debug control port: little-endian framing primitives, the handshake
//! and version/feature negotiation, one encoder per request command, and
//! the demultiplexing decoder that turns inbound bytes into typed
//! responses and asynchronous updates.
//!
//! It is a policy-free layer: no sockets are opened here and no threads
//! are spawned. The session logic (connection lifecycle, pending-request
//! registry, caches, listener threads) lives in `roku-client`.
//!
//! # Message flow
//!
//! ```text
//! Request ──encode──► control socket ──read_update──► Update
//!                         ▲                              │
//!                 handshake::perform              typed payloads
//! ```
//!
//! Requests carry an opaque `caller_data` blob that the demultiplexer
//! copies verbatim onto the matching response; front-ends use it to chain
//! their own state through a round trip.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod request;
pub mod update;
pub mod version;

pub use codec::{WireReader, WireWriter};
pub use error::ProtocolError;
pub use handshake::{Handshake, DEBUGGER_MAGIC, DEBUGGER_PORT};
pub use request::{
    read_request, BreakpointSpec, Command, Request, RequestArgs, StepType, VariablesArgs,
};
pub use update::{
    read_update, write_update, BreakpointErrorUpdate, BreakpointInfo, BreakpointsResponse,
    ERR_FLAG_INVALID_VALUE_IN_PATH, ERR_FLAG_MISSING_KEY_IN_PATH,
    CompileErrorUpdate, ErrCode, ErrorData, ExecuteResponse, StackFrame, StacktraceResponse,
    ThreadInfo, ThreadStopReason, ThreadsResponse, Update, UpdatePayload, UpdateType, Variable,
    VariableType, VariableValue, VariablesResponse,
};
pub use version::{FeatureSet, ProtocolFeature, ProtocolVersion, SUPPORTED_MAJOR_VERSIONS};
