//! Debug Adapter Protocol bridge for the BrightScript remote debugger.
//!
//! Translates between an IDE speaking DAP over a Content-Length framed
//! stream and a Roku device speaking its binary debug protocol:
//!
//! - [`DapBridge`] is the state machine: launch (package, sideload,
//!   connect), breakpoint configuration, execution control, and the
//!   multi-stage request chains behind `scopes`/`variables`/`evaluate`.
//! - [`transport`] frames messages; a shared writer keeps events emitted
//!   from the target-update thread from interleaving with responses.
//! - [`OutputPacketizer`] batches the target's stdout into DAP output
//!   events.
//! - [`LaunchSupport`] abstracts the packager and installer the launch
//!   path delegates to.

pub mod bridge;
pub mod error;
pub mod launch;
pub mod packetizer;
pub mod protocol;
pub mod transport;

pub use bridge::DapBridge;
pub use error::DapError;
pub use launch::LaunchSupport;
pub use packetizer::{OutputEmitter, OutputPacketizer};
pub use transport::{DapReader, DapWriter};
