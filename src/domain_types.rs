//! Domain types for the telebridge core
//!
//! This module defines strongly-typed domain values to prevent primitive obsession
//! and improve type safety throughout the codebase.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation identifier attached to every tool invocation
///
/// Threads through logs, traces, and error envelopes so a single
/// request can be followed across components.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Creates a new random correlation ID
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

fn is_filename_safe(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// Unique identifier for an outbound event
///
/// Assigned by the pipeline when the caller does not provide one.
/// Appears in the drop-zone filename, so it must stay filesystem-safe.
#[nutype(
    validate(predicate = is_filename_safe),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    )
)]
pub struct EventId(String);

impl EventId {
    /// Creates a new random event ID (128-bit, hex form)
    pub fn generate() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self::try_new(id).unwrap_or_else(|_| unreachable!("hex uuid is always a valid event id"))
    }
}

/// Task correlation key carried on events and responses
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    )
)]
pub struct TaskId(String);

/// Authenticated client identity
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    )
)]
pub struct ClientId(String);

/// Name of a registered MCP tool
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    )
)]
pub struct ToolName(String);

/// Human-readable event title
#[nutype(
    validate(len_char_min = 1, len_char_max = 200),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    )
)]
pub struct EventTitle(String);

/// Human-readable event description (may be empty)
#[nutype(
    validate(len_char_max = 4000),
    derive(
        Debug,
        Clone,
        Default,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    ),
    default = ""
)]
pub struct EventDescription(String);

/// Producer identifier stamped on outbound events
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        Default,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    ),
    default = "agent"
)]
pub struct SourceName(String);

/// Maximum retry attempts for a retryable operation
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 3
)]
pub struct MaxAttempts(u32);

impl MaxAttempts {
    /// Gets the value as u32
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Consecutive failures before a circuit breaker opens
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 5
)]
pub struct FailureThreshold(u32);

impl FailureThreshold {
    /// Gets the value as u32
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Trial successes before a half-open breaker closes
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 2
)]
pub struct SuccessThreshold(u32);

impl SuccessThreshold {
    /// Gets the value as u32
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Upper bound on pooled buffers held at once
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1024),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 32
)]
pub struct PoolCapacity(usize);

impl PoolCapacity {
    /// Gets the value as usize
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Length of a sliding rate-limit window, in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 86_400_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 60_000
)]
pub struct WindowMs(u64);

impl WindowMs {
    /// Window length as a [`std::time::Duration`]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }

    /// Window length in whole seconds, rounded up
    pub fn as_secs_ceil(&self) -> u64 {
        self.into_inner().div_ceil(1000)
    }
}

/// Threat indicator confidence, 0..=100
#[nutype(
    validate(less_or_equal = 100),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 0
)]
pub struct Confidence(u8);

impl Confidence {
    /// Confidence bump applied on each re-observation of an indicator
    const OBSERVATION_STEP: u8 = 5;

    /// Raises confidence by one observation step, saturating at 100
    pub fn observe(self) -> Self {
        let bumped = self
            .into_inner()
            .saturating_add(Self::OBSERVATION_STEP)
            .min(100);
        Self::try_new(bumped).unwrap_or(self)
    }
}

/// Severity attached to events, alerts, and security findings
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// All severities, lowest first
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
