//! Security subsystem: request inspection and output scrubbing

pub mod monitor;
pub mod sanitizer;

pub use monitor::{
    IndicatorType, InspectRequest, MitigationAction, MitigationRule, SecurityEvent,
    SecurityMonitor, SecurityVerdict, ThreatIndicator,
};
pub use sanitizer::{REDACTED, Sanitizer, confine, normalize_path};
