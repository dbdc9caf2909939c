//! Tool dispatch: the single entry point for MCP invocations
//!
//! The dispatcher is a pure function of its registry plus the incoming
//! invocation: authentication, tool lookup, schema validation, rate
//! limiting, and the security pre-check run in that order before the
//! handler executes under the caller's deadline. It keeps no per-call
//! state; concurrent invocations are safe.

pub mod handlers;

use crate::bridge::BridgeManager;
use crate::bus::{Signal, SignalPublisher};
use crate::config::Config;
use crate::domain_types::{ClientId, CorrelationId, ToolName};
use crate::error::{CoreError, Result};
use crate::events::{EventLedger, EventPipeline};
use crate::observability::{MetricsRegistry, RecordLevel, RecordParams, StructuredLogger, Tracer};
use crate::ratelimit::RateLimiter;
use crate::responses::ResponseEngine;
use crate::security::{InspectRequest, SecurityMonitor};
use crate::tasks::TaskAggregator;
use crate::time_provider::SharedTimeProvider;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything a handler may touch, constructed once at startup
pub struct Components {
    pub config: Arc<Config>,
    pub pipeline: Arc<EventPipeline>,
    pub bridge: Arc<BridgeManager>,
    pub responses: Arc<ResponseEngine>,
    pub tasks: TaskAggregator,
    pub ledger: Arc<EventLedger>,
    pub metrics: Arc<MetricsRegistry>,
    pub logger: Arc<StructuredLogger>,
    pub tracer: Arc<Tracer>,
    pub publisher: SignalPublisher,
    pub time: SharedTimeProvider,
}

/// Unauthenticated caller identity
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub api_key: Option<String>,
    pub source_ip: Option<String>,
    /// Caller-supplied deadline for the whole invocation
    pub deadline: Option<Duration>,
}

/// Identity after authentication
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub client_id: ClientId,
    pub permissions: Vec<String>,
}

/// Primitive field kinds accepted by the lightweight schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    StringArray,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::StringArray => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
        }
    }

    fn json_type(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Bool => "boolean",
            FieldKind::Object => "object",
            FieldKind::StringArray => "array",
        }
    }
}

/// One declared argument
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    /// Closed value set for string fields
    pub allowed: Option<&'static [&'static str]>,
}

impl FieldSpec {
    /// Required field of the given kind
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            allowed: None,
        }
    }

    /// Optional field of the given kind
    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            allowed: None,
        }
    }

    /// Restricts a string field to a closed value set
    pub const fn one_of(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = Some(allowed);
        self
    }
}

/// Invocations running longer than this are reported as SLA violations
const INVOKE_SLA_MS: u64 = 5_000;

/// Handler signature: components + validated arguments + cancellation
pub type HandlerFn = Arc<
    dyn Fn(Arc<Components>, Value, CancellationToken) -> BoxFuture<'static, Result<Value>>
        + Send
        + Sync,
>;

/// One registry entry
#[derive(Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Capability an authenticated client must hold to call this tool
    pub capability: &'static str,
    pub fields: Vec<FieldSpec>,
    pub handler: HandlerFn,
}

impl ToolSpec {
    /// Renders the declared fields as a JSON-Schema fragment for
    /// `tools/list`
    pub fn input_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut spec = serde_json::Map::new();
            spec.insert("type".to_string(), json!(field.kind.json_type()));
            if field.kind == FieldKind::StringArray {
                spec.insert("items".to_string(), json!({"type": "string"}));
            }
            if let Some(allowed) = field.allowed {
                spec.insert("enum".to_string(), json!(allowed));
            }
            properties.insert(field.name.to_string(), Value::Object(spec));
            if field.required {
                required.push(field.name);
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    fn validate(&self, arguments: &Value) -> Result<()> {
        let object = arguments.as_object().ok_or_else(|| CoreError::Validation {
            field: "arguments".to_string(),
            reason: "arguments must be an object".to_string(),
            constraint: "object".to_string(),
        })?;

        for field in &self.fields {
            match object.get(field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(CoreError::Validation {
                        field: field.name.to_string(),
                        reason: "required field is missing".to_string(),
                        constraint: "required".to_string(),
                    });
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    if !field.kind.accepts(value) {
                        return Err(CoreError::Validation {
                            field: field.name.to_string(),
                            reason: format!("expected {}", field.kind.json_type()),
                            constraint: field.kind.json_type().to_string(),
                        });
                    }
                    if let (Some(allowed), Some(text)) = (field.allowed, value.as_str()) {
                        if !allowed.contains(&text) {
                            return Err(CoreError::Validation {
                                field: field.name.to_string(),
                                reason: format!("{text} is not in the allowed set"),
                                constraint: allowed.join(" | "),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// The dispatcher
pub struct ToolDispatcher {
    registry: HashMap<&'static str, ToolSpec>,
    components: Arc<Components>,
    ratelimit: Arc<RateLimiter>,
    security: Arc<SecurityMonitor>,
    api_keys: HashMap<String, AuthContext>,
    auth_enabled: bool,
}

impl ToolDispatcher {
    /// Builds the dispatcher over the standard tool registry
    pub fn new(
        components: Arc<Components>,
        ratelimit: Arc<RateLimiter>,
        security: Arc<SecurityMonitor>,
    ) -> Self {
        let mut api_keys = HashMap::new();
        if let Some(key) = &components.config.default_api_key {
            api_keys.insert(
                key.clone(),
                AuthContext {
                    client_id: ClientId::try_new("default")
                        .unwrap_or_else(|_| unreachable!("static id is valid")),
                    permissions: vec!["*".to_string()],
                },
            );
        }
        let auth_enabled = components.config.enable_auth;
        let registry = handlers::registry()
            .into_iter()
            .map(|spec| (spec.name, spec))
            .collect();
        Self {
            registry,
            components,
            ratelimit,
            security,
            api_keys,
            auth_enabled,
        }
    }

    /// Registered tools in declaration order, for `tools/list`
    pub fn tool_specs(&self) -> Vec<&ToolSpec> {
        let mut specs: Vec<&ToolSpec> = self.registry.values().collect();
        specs.sort_by_key(|spec| spec.name);
        specs
    }

    /// Full invocation path; errors are already folded into the envelope
    pub async fn invoke_enveloped(
        &self,
        tool_name: &str,
        arguments: Value,
        identity: ClientIdentity,
    ) -> Value {
        let correlation_id = CorrelationId::generate();
        match self.invoke(tool_name, arguments, identity, correlation_id).await {
            Ok(result) => result,
            Err(err) => {
                if err.kind() == crate::error::ErrorKind::InternalError {
                    warn!(%err, %correlation_id, "tool invocation failed internally");
                }
                err.to_envelope(correlation_id)
            }
        }
    }

    /// Authn → lookup → validate → rate-limit → security → dispatch
    pub async fn invoke(
        &self,
        tool_name: &str,
        arguments: Value,
        identity: ClientIdentity,
        correlation_id: CorrelationId,
    ) -> Result<Value> {
        let started = self.components.time.instant();
        let trace = self.components.tracer.start_trace(tool_name);

        // 1. authentication
        let auth = self.authenticate(&identity)?;

        // 2. tool lookup
        let spec = self
            .registry
            .get(tool_name)
            .ok_or_else(|| CoreError::UnknownTool {
                name: tool_name.to_string(),
            })?;
        let tool = ToolName::try_new(tool_name.to_string()).map_err(|_| CoreError::UnknownTool {
            name: tool_name.to_string(),
        })?;

        // authenticated identities must hold the tool's capability
        if let Some(auth) = &auth {
            let permitted = auth
                .permissions
                .iter()
                .any(|p| p == "*" || p == spec.capability);
            if !permitted {
                return Err(CoreError::Authorization {
                    client: auth.client_id.to_string(),
                    tool,
                });
            }
        }

        // 3. schema validation
        spec.validate(&arguments)?;

        // 4. rate limiting
        let verdict = self.ratelimit.check(auth.as_ref().map(|a| &a.client_id), &tool);
        if !verdict.allowed {
            self.components
                .metrics
                .inc_counter("rate_limited_total", &[("tool", tool_name)], 1.0);
            return Err(CoreError::RateLimitExceeded {
                scope: verdict.scope,
                retry_after_s: verdict.retry_after_s,
            });
        }

        // 5. security pre-check
        let body = arguments.to_string();
        let security = self.security.inspect(InspectRequest {
            tool: tool_name,
            body: &body,
            source_ip: identity.source_ip.as_deref(),
            client_id: auth.as_ref().map(|a| a.client_id.as_str()),
        });
        if security.blocked {
            self.components
                .metrics
                .inc_counter("security_blocked_total", &[("tool", tool_name)], 1.0);
            return Err(CoreError::SecurityBlocked {
                rule: security.blocking_rule.unwrap_or_else(|| "unknown".to_string()),
                detail: "request matched a critical security rule".to_string(),
            });
        }

        // 6. dispatch under the caller's deadline
        let result = self
            .dispatch(spec, arguments, identity.deadline, tool_name)
            .await;

        // 7. bookkeeping
        let elapsed = started.elapsed();
        let ok = result.is_ok();
        self.components.tracer.end_span(&trace, ok);
        self.components.metrics.inc_counter(
            "tool_calls_total",
            &[("tool", tool_name), ("ok", if ok { "true" } else { "false" })],
            1.0,
        );
        self.components.metrics.observe_histogram(
            "invoke_duration_ms",
            &[("tool", tool_name)],
            elapsed.as_millis() as f64,
        );
        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed_ms > INVOKE_SLA_MS {
            self.components.publisher.publish(Signal::SlaViolation {
                operation: tool_name.to_string(),
                duration_ms: elapsed_ms,
                budget_ms: INVOKE_SLA_MS,
                at: self.components.time.now_utc(),
            });
        }
        self.components.logger.log(
            if ok { RecordLevel::Info } else { RecordLevel::Warn },
            &format!("tool {tool_name} {}", if ok { "succeeded" } else { "failed" }),
            correlation_id,
            RecordParams {
                component: Some("dispatcher".to_string()),
                operation: Some(tool_name.to_string()),
                duration_ms: Some(elapsed.as_millis() as u64),
                trace_id: Some(trace.trace_id.clone()),
                span_id: Some(trace.span_id.clone()),
                error: result.as_ref().err().map(ToString::to_string),
                ..RecordParams::default()
            },
        );

        result
    }

    async fn dispatch(
        &self,
        spec: &ToolSpec,
        arguments: Value,
        deadline: Option<Duration>,
        tool_name: &str,
    ) -> Result<Value> {
        let cancel = CancellationToken::new();
        let future = (spec.handler)(Arc::clone(&self.components), arguments, cancel.clone());

        match deadline {
            Some(deadline) if deadline.is_zero() => Err(CoreError::Timeout {
                operation: tool_name.to_string(),
                timeout_ms: 0,
            }),
            Some(deadline) => match tokio::time::timeout(deadline, future).await {
                Ok(result) => result,
                Err(_) => {
                    // abort in-flight retries promptly
                    cancel.cancel();
                    Err(CoreError::Timeout {
                        operation: tool_name.to_string(),
                        timeout_ms: deadline.as_millis() as u64,
                    })
                }
            },
            None => future.await,
        }
    }

    fn authenticate(&self, identity: &ClientIdentity) -> Result<Option<AuthContext>> {
        if !self.auth_enabled {
            return Ok(None);
        }
        let Some(api_key) = identity.api_key.as_deref() else {
            return Err(CoreError::Authentication {
                reason: "missing API key".to_string(),
            });
        };
        match self.api_keys.get(api_key) {
            Some(context) => {
                debug!(client = %context.client_id, "authenticated");
                Ok(Some(context.clone()))
            }
            None => Err(CoreError::Authentication {
                reason: "unrecognized API key".to_string(),
            }),
        }
    }
}
