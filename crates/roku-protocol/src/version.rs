//! Protocol version negotiation and feature inference.
//!
//! The target reports a `(major, minor, patch)` triple during the
//! handshake; protocol 3.0+ also reports a platform revision timestamp
//! (milliseconds). Together they determine the target's capabilities,
//! including a couple of known firmware bugs this client works around.
//! Feature queries after the handshake are O(1) via [`FeatureSet`].

use std::fmt;

use crate::error::ProtocolError;

const MAJOR_VERSION_MAX: u32 = 999;
const MINOR_VERSION_MAX: u32 = 999;
const PATCH_LEVEL_MAX: u32 = 999;

/// Protocol major versions this client can talk to.
pub const SUPPORTED_MAJOR_VERSIONS: [u32; 3] = [1, 2, 3];

// Pre-release platform revisions inside the 3.1.x cycle where behavior
// differs from the final release. Values are millisecond timestamps
// reported in the handshake.
const URI_SUPPORT_MIN_REVISION: i64 = 1_650_905_541_605;
const ERROR_FLAGS_MIN_REVISION: i64 = 1_658_337_558_223;
const STACKTRACE_LINE_FIX_REVISION: i64 = 1_660_254_781_319;

/// Version triple negotiated during the handshake, plus the optional
/// platform revision timestamp reported by protocol 3.0+.
///
/// Ordering and equality consider only the triple; the revision is a
/// build marker consulted by a handful of feature predicates.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    platform_revision: Option<i64>,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch, platform_revision: None }
    }

    pub const fn with_platform_revision(mut self, revision: i64) -> Self {
        self.platform_revision = Some(revision);
        self
    }

    pub fn platform_revision(&self) -> Option<i64> {
        self.platform_revision
    }

    /// Sanity bounds on the components; the target is embedded firmware
    /// and absurd values indicate a corrupt handshake.
    pub fn is_valid(&self) -> bool {
        self.major <= MAJOR_VERSION_MAX
            && self.minor <= MINOR_VERSION_MAX
            && self.patch <= PATCH_LEVEL_MAX
    }

    /// Errors unless the major version is one this client supports.
    pub fn check_supported(&self) -> Result<(), ProtocolError> {
        if !self.is_valid() {
            return Err(ProtocolError::InvalidVersion(*self));
        }
        if !SUPPORTED_MAJOR_VERSIONS.contains(&self.major) {
            return Err(ProtocolError::UnsupportedVersion(*self));
        }
        Ok(())
    }

    fn as_ordinal(&self) -> u64 {
        u64::from(self.major) * 1_000_000 + u64::from(self.minor) * 1_000 + u64::from(self.patch)
    }

    /// Whether the target described by this version implements `feature`.
    ///
    /// Pure function of the triple plus, for a few pre-release windows,
    /// the platform revision.
    pub fn has_feature(&self, feature: ProtocolFeature) -> bool {
        use ProtocolFeature::*;
        match feature {
            // 1.1
            StepCommands => *self >= ProtocolVersion::new(1, 1, 0),

            // Introduced in 1.1.1, fixed during the 3.1.1 release cycle.
            BadLineNumberInStacktraceBug => {
                if *self >= ProtocolVersion::new(1, 1, 1) && *self < ProtocolVersion::new(3, 1, 1) {
                    return true;
                }
                if *self == ProtocolVersion::new(3, 1, 1) {
                    if let Some(revision) = self.platform_revision {
                        if revision < STACKTRACE_LINE_FIX_REVISION {
                            tracing::debug!(version = %self, "pre-release build still has stacktrace line bug");
                            return true;
                        }
                    }
                }
                false
            }

            // 1.2
            Breakpoints => *self >= ProtocolVersion::new(1, 2, 0),

            // 2.0
            StopOnLaunchAlways => *self >= ProtocolVersion::new(2, 0, 0),
            AttachedMessageDuringStepBug => *self >= ProtocolVersion::new(2, 0, 0),

            // 2.1
            ExecuteCommand => *self >= ProtocolVersion::new(2, 1, 0),

            // 3.0
            ExecuteReturnsErrors => *self >= ProtocolVersion::new(3, 0, 0),
            UpdatesHavePacketLength => *self >= ProtocolVersion::new(3, 0, 0),

            // 3.1
            BreakpointsUriSupport => {
                if *self < ProtocolVersion::new(3, 1, 0) {
                    return false;
                }
                match self.platform_revision {
                    Some(revision) if revision < URI_SUPPORT_MIN_REVISION => {
                        tracing::debug!(version = %self, "pre-release build lacks breakpoint URI support");
                        false
                    }
                    _ => true,
                }
            }
            CaseSensitivity => *self >= ProtocolVersion::new(3, 1, 0),
            ConditionalBreakpoints => *self >= ProtocolVersion::new(3, 1, 0),
            ErrorFlags => {
                if *self < ProtocolVersion::new(3, 1, 0) {
                    return false;
                }
                match self.platform_revision {
                    Some(revision) if revision < ERROR_FLAGS_MIN_REVISION => {
                        tracing::debug!(version = %self, "pre-release build lacks error flags");
                        false
                    }
                    _ => true,
                }
            }

            // 3.1.1
            ConditionalBreakpointsAllowEmptyCondition => *self >= ProtocolVersion::new(3, 1, 1),
        }
    }
}

impl PartialEq for ProtocolVersion {
    fn eq(&self, other: &Self) -> bool {
        self.as_ordinal() == other.as_ordinal()
    }
}

impl Eq for ProtocolVersion {}

impl PartialOrd for ProtocolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProtocolVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_ordinal().cmp(&other.as_ordinal())
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Capabilities (and known bugs) implied by a protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFeature {
    /// Target emits a spurious THREAD_ATTACHED update during step in/over/out.
    AttachedMessageDuringStepBug,
    /// Stacktrace responses carry a wrong line number for the stop site.
    BadLineNumberInStacktraceBug,
    Breakpoints,
    /// Breakpoint paths may be sent as `pkg:/` and `lib:/<name>/` URIs.
    BreakpointsUriSupport,
    /// Variable lookups accept per-component case-sensitivity flags.
    CaseSensitivity,
    ExecuteCommand,
    /// EXECUTE responses carry structured compile/runtime error lists.
    ExecuteReturnsErrors,
    /// Target always stops all threads immediately after launch.
    StopOnLaunchAlways,
    StepCommands,
    /// Every update/response from the target begins with a packet length.
    UpdatesHavePacketLength,
    ConditionalBreakpoints,
    /// Error responses carry a flags word with extra data.
    ErrorFlags,
    /// An empty condition string means "unconditional".
    ConditionalBreakpointsAllowEmptyCondition,
}

impl ProtocolFeature {
    pub const ALL: [ProtocolFeature; 13] = [
        ProtocolFeature::AttachedMessageDuringStepBug,
        ProtocolFeature::BadLineNumberInStacktraceBug,
        ProtocolFeature::Breakpoints,
        ProtocolFeature::BreakpointsUriSupport,
        ProtocolFeature::CaseSensitivity,
        ProtocolFeature::ExecuteCommand,
        ProtocolFeature::ExecuteReturnsErrors,
        ProtocolFeature::StopOnLaunchAlways,
        ProtocolFeature::StepCommands,
        ProtocolFeature::UpdatesHavePacketLength,
        ProtocolFeature::ConditionalBreakpoints,
        ProtocolFeature::ErrorFlags,
        ProtocolFeature::ConditionalBreakpointsAllowEmptyCondition,
    ];

    fn bit(self) -> u16 {
        let index = ProtocolFeature::ALL
            .iter()
            .position(|f| *f == self)
            .unwrap_or_default();
        1 << index
    }

    /// Short token shown to users (e.g. in the `status` command).
    pub fn user_name(self) -> &'static str {
        match self {
            ProtocolFeature::AttachedMessageDuringStepBug => "attached_message_during_step_bug",
            ProtocolFeature::BadLineNumberInStacktraceBug => "bad_line_number_in_stacktrace_bug",
            ProtocolFeature::Breakpoints => "breakpoints",
            ProtocolFeature::BreakpointsUriSupport => "breakpoints_uri_support",
            ProtocolFeature::CaseSensitivity => "case_sensitivity",
            ProtocolFeature::ExecuteCommand => "execute_command",
            ProtocolFeature::ExecuteReturnsErrors => "execute_returns_errors",
            // To users it is not "always"
            ProtocolFeature::StopOnLaunchAlways => "stop_on_launch",
            ProtocolFeature::StepCommands => "step_commands",
            ProtocolFeature::UpdatesHavePacketLength => "updates_have_packet_length",
            ProtocolFeature::ConditionalBreakpoints => "conditional_breakpoints",
            ProtocolFeature::ErrorFlags => "error_flags",
            ProtocolFeature::ConditionalBreakpointsAllowEmptyCondition => {
                "conditional_breakpoints_allow_empty_condition"
            }
        }
    }
}

/// The feature set of a connected target, precomputed once after the
/// handshake so queries on the hot decode path are a bit test.
#[derive(Debug, Clone, Copy)]
pub struct FeatureSet {
    version: ProtocolVersion,
    bits: u16,
}

impl FeatureSet {
    pub fn from_version(version: ProtocolVersion) -> Self {
        let mut bits = 0;
        for feature in ProtocolFeature::ALL {
            if version.has_feature(feature) {
                bits |= feature.bit();
            }
        }
        Self { version, bits }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn has(&self, feature: ProtocolFeature) -> bool {
        self.bits & feature.bit() != 0
    }

    /// Enabled features, for diagnostics.
    pub fn iter(&self) -> impl Iterator<Item = ProtocolFeature> + '_ {
        ProtocolFeature::ALL.into_iter().filter(|f| self.has(*f))
    }
}

/// User-facing list of supported protocol lines, e.g. `1.x,2.x,3.x`.
pub fn supported_majors_str() -> String {
    let mut s = String::new();
    for major in SUPPORTED_MAJOR_VERSIONS {
        if !s.is_empty() {
            s.push(',');
        }
        s.push_str(&format!("{major}.x"));
    }
    s
}
