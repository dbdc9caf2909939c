//! Field redaction and path confinement
//!
//! Anything that leaves the process through a log record or an error
//! envelope passes through here first. Paths supplied by callers are
//! normalized and confined to their owning drop-zone.

use crate::error::{CoreError, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Replacement for redacted keys and matched secrets
pub const REDACTED: &str = "[REDACTED]";

/// Key names whose values are always redacted, compared case-insensitively
const REDACT_KEYS: [&str; 10] = [
    "token",
    "bot_token",
    "api_key",
    "apikey",
    "password",
    "secret",
    "authorization",
    "cookie",
    "session",
    "credential",
];

/// Built-in secret shapes scrubbed out of free-form strings
const SECRET_PATTERNS: [&str; 4] = [
    // Telegram bot tokens
    r"\b\d{8,10}:[A-Za-z0-9_-]{35}\b",
    // bearer/basic auth headers
    r"(?i)\b(?:bearer|basic)\s+[A-Za-z0-9+/_.=-]{8,}",
    // key=value style credentials
    r"(?i)\b(?:token|password|secret|api[_-]?key)\s*[=:]\s*\S+",
    // long hex blobs that look like keys
    r"\b[0-9a-fA-F]{40,}\b",
];

/// Scrubs secrets from strings and structured values
#[derive(Debug)]
pub struct Sanitizer {
    redact_keys: HashSet<String>,
    patterns: Vec<Regex>,
}

impl Sanitizer {
    /// Builds a sanitizer from the built-in sets plus configured extras
    pub fn new(extra_patterns: &[String]) -> Result<Self> {
        let mut patterns = Vec::with_capacity(SECRET_PATTERNS.len() + extra_patterns.len());
        for pattern in SECRET_PATTERNS.iter().copied() {
            patterns.push(Regex::new(pattern).map_err(|err| CoreError::Internal {
                message: format!("built-in sanitizer pattern failed to compile: {err}"),
            })?);
        }
        for pattern in extra_patterns {
            patterns.push(
                Regex::new(pattern).map_err(|err| CoreError::Validation {
                    field: "security.suspicious_patterns".to_string(),
                    reason: err.to_string(),
                    constraint: "valid regex".to_string(),
                })?,
            );
        }
        Ok(Self {
            redact_keys: REDACT_KEYS.iter().map(|k| (*k).to_string()).collect(),
            patterns,
        })
    }

    /// Scrubs secret shapes out of a message string
    pub fn sanitize_message(&self, message: &str) -> String {
        let mut out = message.to_string();
        for pattern in &self.patterns {
            if pattern.is_match(&out) {
                out = pattern.replace_all(&out, REDACTED).into_owned();
            }
        }
        out
    }

    /// Whether a map key is in the redact set
    pub fn is_redacted_key(&self, key: &str) -> bool {
        let lower = key.to_ascii_lowercase();
        self.redact_keys
            .iter()
            .any(|k| lower == *k || lower.ends_with(&format!("_{k}")))
    }

    /// Recursively sanitizes a JSON value in place
    pub fn sanitize_value(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, entry) in map.iter_mut() {
                    if self.is_redacted_key(key) {
                        *entry = Value::String(REDACTED.to_string());
                    } else {
                        self.sanitize_value(entry);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.sanitize_value(item);
                }
            }
            Value::String(s) => {
                let scrubbed = self.sanitize_message(s);
                if scrubbed != *s {
                    *s = scrubbed;
                }
            }
            _ => {}
        }
    }
}

/// Lexically normalizes a path: resolves `.` and `..` without touching
/// the filesystem
///
/// Returns `None` when `..` would climb above the path's own root.
pub fn normalize_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(name) => {
                out.push(name);
                depth += 1;
            }
        }
    }
    Some(out)
}

/// Joins `candidate` under `base` and rejects escapes
///
/// The candidate must be relative; after normalization the result must
/// still live under `base`.
pub fn confine(base: &Path, candidate: &Path) -> Result<PathBuf> {
    if candidate.is_absolute() {
        return Err(CoreError::Validation {
            field: "path".to_string(),
            reason: "absolute paths are not allowed".to_string(),
            constraint: "relative to drop-zone".to_string(),
        });
    }
    let joined = base.join(candidate);
    let normalized = normalize_path(&joined).ok_or_else(|| CoreError::Validation {
        field: "path".to_string(),
        reason: "path escapes its base directory".to_string(),
        constraint: "confined to drop-zone".to_string(),
    })?;
    if !normalized.starts_with(base) {
        return Err(CoreError::Validation {
            field: "path".to_string(),
            reason: "path escapes its base directory".to_string(),
            constraint: "confined to drop-zone".to_string(),
        });
    }
    Ok(normalized)
}
