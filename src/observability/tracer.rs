//! Minimal tracer: span lifecycle, sampling, propagation
//!
//! Spans are identified W3C-style (32-hex trace id, 16-hex span id) so the
//! context can travel in headers toward the bridge. Sampling is decided at
//! trace start and inherited by children.

use crate::time_provider::SharedTimeProvider;
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Propagated identifiers of one span
#[derive(Debug, Clone, Serialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub sampled: bool,
}

impl TraceContext {
    /// Serializes into a `traceparent`-style header value
    pub fn to_traceparent(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!("00-{}-{}-{flags}", self.trace_id, self.span_id)
    }

    /// Parses a `traceparent`-style header value
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.split('-');
        let _version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if trace_id.len() != 32 || span_id.len() != 16 {
            return None;
        }
        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            sampled: flags == "01",
        })
    }
}

/// Completed span record
#[derive(Debug, Clone, Serialize)]
pub struct FinishedSpan {
    pub trace_id: String,
    pub span_id: String,
    pub operation: String,
    pub duration_ms: u64,
    pub ok: bool,
}

struct ActiveSpan {
    operation: String,
    trace_id: String,
    started: Instant,
    sampled: bool,
}

/// Span factory with head-based sampling
pub struct Tracer {
    sampling_ratio: f64,
    active: DashMap<String, ActiveSpan>,
    time: SharedTimeProvider,
}

impl Tracer {
    /// Creates a tracer sampling the given ratio of new traces
    pub fn new(sampling_ratio: f64, time: SharedTimeProvider) -> Self {
        Self {
            sampling_ratio: sampling_ratio.clamp(0.0, 1.0),
            active: DashMap::new(),
            time,
        }
    }

    /// Starts a new root span, deciding sampling for the whole trace
    pub fn start_trace(&self, operation: &str) -> TraceContext {
        let sampled = rand::thread_rng().gen_bool(self.sampling_ratio);
        let trace_id = Uuid::new_v4().simple().to_string();
        self.start_span_inner(operation, trace_id, sampled)
    }

    /// Starts a child span inheriting the parent's trace and sampling
    pub fn start_child(&self, parent: &TraceContext, operation: &str) -> TraceContext {
        self.start_span_inner(operation, parent.trace_id.clone(), parent.sampled)
    }

    fn start_span_inner(&self, operation: &str, trace_id: String, sampled: bool) -> TraceContext {
        let span_id = short_id();
        if sampled {
            self.active.insert(
                span_id.clone(),
                ActiveSpan {
                    operation: operation.to_string(),
                    trace_id: trace_id.clone(),
                    started: self.time.instant(),
                    sampled,
                },
            );
        }
        TraceContext {
            trace_id,
            span_id,
            sampled,
        }
    }

    /// Ends a span; unsampled or unknown spans return `None`
    pub fn end_span(&self, context: &TraceContext, ok: bool) -> Option<FinishedSpan> {
        let (_, span) = self.active.remove(&context.span_id)?;
        let finished = FinishedSpan {
            trace_id: span.trace_id,
            span_id: context.span_id.clone(),
            operation: span.operation,
            duration_ms: span.started.elapsed().as_millis() as u64,
            ok,
        };
        if span.sampled {
            debug!(
                trace_id = %finished.trace_id,
                span_id = %finished.span_id,
                operation = %finished.operation,
                duration_ms = finished.duration_ms,
                ok,
                "span finished"
            );
        }
        Some(finished)
    }

    /// Number of spans currently open
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// 16-hex-char span id
fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::test_time_provider;

    #[test]
    fn sampled_trace_produces_finished_spans() {
        let tracer = Tracer::new(1.0, test_time_provider());
        let ctx = tracer.start_trace("invoke");
        assert!(ctx.sampled);
        let finished = tracer.end_span(&ctx, true).unwrap();
        assert_eq!(finished.operation, "invoke");
        assert_eq!(tracer.active_count(), 0);
    }

    #[test]
    fn unsampled_trace_records_nothing() {
        let tracer = Tracer::new(0.0, test_time_provider());
        let ctx = tracer.start_trace("invoke");
        assert!(!ctx.sampled);
        assert!(tracer.end_span(&ctx, true).is_none());
        assert_eq!(tracer.active_count(), 0);
    }

    #[test]
    fn children_inherit_trace_and_sampling() {
        let tracer = Tracer::new(1.0, test_time_provider());
        let root = tracer.start_trace("invoke");
        let child = tracer.start_child(&root, "event_write");
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
        assert!(child.sampled);
    }

    #[test]
    fn traceparent_round_trip() {
        let tracer = Tracer::new(1.0, test_time_provider());
        let ctx = tracer.start_trace("invoke");
        let parsed = TraceContext::from_traceparent(&ctx.to_traceparent()).unwrap();
        assert_eq!(parsed.trace_id, ctx.trace_id);
        assert_eq!(parsed.span_id, ctx.span_id);
        assert!(parsed.sampled);
    }

    #[test]
    fn malformed_traceparent_is_rejected() {
        assert!(TraceContext::from_traceparent("00-short-id-01").is_none());
        assert!(TraceContext::from_traceparent("garbage").is_none());
    }
}
