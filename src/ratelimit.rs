//! Sliding-window rate limiting
//!
//! Four windows guard every invocation: global, per-client, per-tool, and a
//! short burst window. Windows hold raw request timestamps sharded per key;
//! a check prunes expired entries, compares, and only commits the request to
//! every window once all of them allow it, so a rejection in one scope never
//! consumes budget in another.

use crate::config::RateLimitConfig;
use crate::domain_types::{ClientId, ToolName};
use crate::time_provider::SharedTimeProvider;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

/// Verdict for one scope (the tightest one on success, the failing one on
/// rejection)
#[derive(Debug, Clone, Serialize)]
pub struct RateVerdict {
    pub allowed: bool,
    pub scope: String,
    pub remaining: u32,
    /// Epoch millis when the constraining window frees a slot
    pub reset_at_ms: u64,
    pub window_s: u64,
    pub retry_after_s: u64,
}

struct Scope {
    key: String,
    limit: u32,
    window_ms: u64,
}

/// Sliding-window rate limiter, sharded per scope key
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Vec<u64>>,
    time: SharedTimeProvider,
}

impl RateLimiter {
    /// Creates a limiter over the configured windows
    pub fn new(config: RateLimitConfig, time: SharedTimeProvider) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            time,
        }
    }

    /// Checks all scopes and commits the request when every one allows it
    pub fn check(&self, client: Option<&ClientId>, tool: &ToolName) -> RateVerdict {
        if !self.config.enabled {
            return RateVerdict {
                allowed: true,
                scope: "disabled".to_string(),
                remaining: u32::MAX,
                reset_at_ms: 0,
                window_s: 0,
                retry_after_s: 0,
            };
        }

        let now = self.time.epoch_millis();
        let scopes = self.scopes(client, tool);

        // phase 1: prune and test every scope without committing
        let mut tightest: Option<RateVerdict> = None;
        for scope in &scopes {
            let verdict = self.peek(scope, now);
            if !verdict.allowed {
                debug!(scope = %verdict.scope, "rate limit exceeded");
                return verdict;
            }
            let replace = tightest
                .as_ref()
                .map(|t| verdict.remaining < t.remaining)
                .unwrap_or(true);
            if replace {
                tightest = Some(verdict);
            }
        }

        // phase 2: all allowed, commit the timestamp to every window
        for scope in &scopes {
            self.windows.entry(scope.key.clone()).or_default().push(now);
        }

        tightest.unwrap_or(RateVerdict {
            allowed: true,
            scope: "global".to_string(),
            remaining: self.config.max_requests,
            reset_at_ms: now,
            window_s: self.config.window_ms.as_secs_ceil(),
            retry_after_s: 0,
        })
    }

    fn scopes(&self, client: Option<&ClientId>, tool: &ToolName) -> Vec<Scope> {
        let window_ms: u64 = self.config.window_ms.into_inner();
        let burst_ms: u64 = self.config.burst_window_ms.into_inner();
        let mut scopes = vec![Scope {
            key: "global".to_string(),
            limit: self.config.max_requests,
            window_ms,
        }];
        if let Some(client) = client {
            scopes.push(Scope {
                key: format!("client:{client}"),
                limit: self.config.per_client_max,
                window_ms,
            });
        }
        scopes.push(Scope {
            key: format!("tool:{tool}"),
            limit: self.config.per_tool_max,
            window_ms,
        });
        let burst_key = client.map_or_else(
            || "burst".to_string(),
            |client| format!("burst:{client}"),
        );
        scopes.push(Scope {
            key: burst_key,
            limit: self.config.burst_max,
            window_ms: burst_ms,
        });
        scopes
    }

    /// Prunes one window and reports whether another request fits
    fn peek(&self, scope: &Scope, now: u64) -> RateVerdict {
        let mut window = self.windows.entry(scope.key.clone()).or_default();
        let cutoff = now.saturating_sub(scope.window_ms);
        window.retain(|ts| *ts > cutoff);

        let used = u32::try_from(window.len()).unwrap_or(u32::MAX);
        let allowed = used < scope.limit;
        let oldest = window.first().copied().unwrap_or(now);
        let reset_at_ms = oldest + scope.window_ms;
        let retry_after_s = if allowed {
            0
        } else {
            // at least one second so callers never busy-loop
            reset_at_ms.saturating_sub(now).div_ceil(1000).max(1)
        };

        RateVerdict {
            allowed,
            scope: scope.key.clone(),
            remaining: scope.limit.saturating_sub(used).saturating_sub(u32::from(allowed)),
            reset_at_ms,
            window_s: scope.window_ms.div_ceil(1000),
            retry_after_s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::WindowMs;
    use crate::time_provider::test_time_provider;

    fn limiter(per_tool: u32) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig {
                enabled: true,
                window_ms: WindowMs::try_new(60_000).unwrap(),
                max_requests: 1000,
                per_client_max: 300,
                per_tool_max: per_tool,
                burst_window_ms: WindowMs::try_new(10_000).unwrap(),
                burst_max: 1000,
            },
            test_time_provider(),
        )
    }

    fn tool(name: &str) -> ToolName {
        ToolName::try_new(name).unwrap()
    }

    #[test]
    fn requests_at_the_threshold_are_rejected() {
        let limiter = limiter(2);
        let tool = tool("send_event");
        assert!(limiter.check(None, &tool).allowed);
        assert!(limiter.check(None, &tool).allowed);

        let verdict = limiter.check(None, &tool);
        assert!(!verdict.allowed);
        assert_eq!(verdict.scope, "tool:send_event");
        assert!(verdict.retry_after_s > 0);
    }

    #[test]
    fn rejection_does_not_consume_other_scopes() {
        let limiter = limiter(1);
        let constrained = tool("send_event");
        let other = tool("get_responses");

        assert!(limiter.check(None, &constrained).allowed);
        assert!(!limiter.check(None, &constrained).allowed);

        // the rejected call must not have burned global budget
        for _ in 0..10 {
            assert!(limiter.check(None, &other).allowed);
        }
    }

    #[test]
    fn scopes_are_isolated_per_client() {
        let limiter = RateLimiter::new(
            RateLimitConfig {
                enabled: true,
                window_ms: WindowMs::try_new(60_000).unwrap(),
                max_requests: 1000,
                per_client_max: 1,
                per_tool_max: 1000,
                burst_window_ms: WindowMs::try_new(10_000).unwrap(),
                burst_max: 1000,
            },
            test_time_provider(),
        );
        let a = ClientId::try_new("alpha").unwrap();
        let b = ClientId::try_new("beta").unwrap();
        let tool = tool("send_event");

        assert!(limiter.check(Some(&a), &tool).allowed);
        assert!(!limiter.check(Some(&a), &tool).allowed);
        assert!(limiter.check(Some(&b), &tool).allowed);
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(
            RateLimitConfig {
                enabled: false,
                ..RateLimitConfig::default()
            },
            test_time_provider(),
        );
        let tool = tool("send_event");
        for _ in 0..5000 {
            assert!(limiter.check(None, &tool).allowed);
        }
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = limiter(3);
        let tool = tool("send_event");
        let first = limiter.check(None, &tool);
        let second = limiter.check(None, &tool);
        assert_eq!(first.remaining, 2);
        assert_eq!(second.remaining, 1);
    }
}
