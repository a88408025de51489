//! Engine configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::billing::BillingClient;
use crate::capabilities::CapabilitiesRegistry;
use crate::clock::{Clock, SystemClock};
use crate::error::{EngineError, EngineResult, ResourceLimited};
use crate::events::{EventSink, TracingSink};
use crate::limits::{ExecutionRateLimiter, GovernorRateLimiter, ResourceLimiter, WorkflowLimiter};
use crate::module::Module;
use crate::secrets::ShareCombiner;
use crate::store::{ExecutionStatus, ExecutionStore};

const DEFAULT_WORKFLOW_EXECUTION_TIMEOUT_MS: u64 = 10 * 60 * 1000;
const DEFAULT_CAPABILITY_CALL_TIMEOUT_MS: u64 = 8 * 60 * 1000;
const DEFAULT_TRIGGER_SUBSCRIPTION_REQUEST_TIMEOUT_MS: u64 = 500;
const DEFAULT_TRIGGER_ALL_REGISTRATIONS_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_TRIGGER_SUBSCRIPTIONS: usize = 10;
const DEFAULT_TRIGGER_EVENT_QUEUE_SIZE: usize = 1_000;
const DEFAULT_TRIGGER_EVENT_MAX_AGE_MS: u64 = 10 * 60 * 1000;
const DEFAULT_MAX_CONCURRENT_WORKFLOW_EXECUTIONS: usize = 100;
const DEFAULT_MAX_CONCURRENT_CAPABILITY_CALLS: usize = 10;
const DEFAULT_MAX_CONCURRENT_SECRETS_CALLS: usize = 5;
const DEFAULT_MODULE_EXECUTE_MAX_RESPONSE_SIZE_BYTES: u64 = 100_000;
const DEFAULT_MAX_USER_LOG_EVENTS_PER_EXECUTION: usize = 1_000;
const DEFAULT_MAX_USER_LOG_LINE_LENGTH: usize = 1_000;
const DEFAULT_HEARTBEAT_FREQUENCY_MS: u64 = 60 * 1000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Local limits for one engine. Zero means unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
    pub workflow_execution_timeout_ms: u64,
    pub capability_call_timeout_ms: u64,
    pub trigger_subscription_request_timeout_ms: u64,
    pub trigger_all_registrations_timeout_ms: u64,
    pub max_trigger_subscriptions: usize,
    pub trigger_event_queue_size: usize,
    pub trigger_event_max_age_ms: u64,
    pub max_concurrent_workflow_executions: usize,
    pub max_concurrent_capability_calls_per_workflow: usize,
    pub max_concurrent_secrets_calls_per_workflow: usize,
    pub module_execute_max_response_size_bytes: u64,
    pub max_user_log_events_per_execution: usize,
    pub max_user_log_line_length: usize,
    pub heartbeat_frequency_ms: u64,
    pub shutdown_timeout_ms: u64,
}

fn or_default<T: Default + PartialEq>(value: &mut T, default: T) {
    if *value == T::default() {
        *value = default;
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl EngineLimits {
    /// Load limits from `ENGINE_*` environment variables. Unset or
    /// unparsable variables stay unset.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            workflow_execution_timeout_ms: env_var("ENGINE_WORKFLOW_EXECUTION_TIMEOUT_MS").unwrap_or(0),
            capability_call_timeout_ms: env_var("ENGINE_CAPABILITY_CALL_TIMEOUT_MS").unwrap_or(0),
            trigger_subscription_request_timeout_ms: env_var("ENGINE_TRIGGER_SUBSCRIPTION_REQUEST_TIMEOUT_MS")
                .unwrap_or(0),
            trigger_all_registrations_timeout_ms: env_var("ENGINE_TRIGGER_ALL_REGISTRATIONS_TIMEOUT_MS")
                .unwrap_or(0),
            max_trigger_subscriptions: env_var("ENGINE_MAX_TRIGGER_SUBSCRIPTIONS").unwrap_or(0),
            trigger_event_queue_size: env_var("ENGINE_TRIGGER_EVENT_QUEUE_SIZE").unwrap_or(0),
            trigger_event_max_age_ms: env_var("ENGINE_TRIGGER_EVENT_MAX_AGE_MS").unwrap_or(0),
            max_concurrent_workflow_executions: env_var("ENGINE_MAX_CONCURRENT_WORKFLOW_EXECUTIONS").unwrap_or(0),
            max_concurrent_capability_calls_per_workflow: env_var("ENGINE_MAX_CONCURRENT_CAPABILITY_CALLS")
                .unwrap_or(0),
            max_concurrent_secrets_calls_per_workflow: env_var("ENGINE_MAX_CONCURRENT_SECRETS_CALLS").unwrap_or(0),
            module_execute_max_response_size_bytes: env_var("ENGINE_MODULE_EXECUTE_MAX_RESPONSE_SIZE_BYTES")
                .unwrap_or(0),
            max_user_log_events_per_execution: env_var("ENGINE_MAX_USER_LOG_EVENTS_PER_EXECUTION").unwrap_or(0),
            max_user_log_line_length: env_var("ENGINE_MAX_USER_LOG_LINE_LENGTH").unwrap_or(0),
            heartbeat_frequency_ms: env_var("ENGINE_HEARTBEAT_FREQUENCY_MS").unwrap_or(0),
            shutdown_timeout_ms: env_var("ENGINE_SHUTDOWN_TIMEOUT_MS").unwrap_or(0),
        })
    }

    /// Fill every unset limit with its default.
    pub fn with_defaults(mut self) -> Self {
        or_default(&mut self.workflow_execution_timeout_ms, DEFAULT_WORKFLOW_EXECUTION_TIMEOUT_MS);
        or_default(&mut self.capability_call_timeout_ms, DEFAULT_CAPABILITY_CALL_TIMEOUT_MS);
        or_default(
            &mut self.trigger_subscription_request_timeout_ms,
            DEFAULT_TRIGGER_SUBSCRIPTION_REQUEST_TIMEOUT_MS,
        );
        or_default(
            &mut self.trigger_all_registrations_timeout_ms,
            DEFAULT_TRIGGER_ALL_REGISTRATIONS_TIMEOUT_MS,
        );
        or_default(&mut self.max_trigger_subscriptions, DEFAULT_MAX_TRIGGER_SUBSCRIPTIONS);
        or_default(&mut self.trigger_event_queue_size, DEFAULT_TRIGGER_EVENT_QUEUE_SIZE);
        or_default(&mut self.trigger_event_max_age_ms, DEFAULT_TRIGGER_EVENT_MAX_AGE_MS);
        or_default(
            &mut self.max_concurrent_workflow_executions,
            DEFAULT_MAX_CONCURRENT_WORKFLOW_EXECUTIONS,
        );
        or_default(
            &mut self.max_concurrent_capability_calls_per_workflow,
            DEFAULT_MAX_CONCURRENT_CAPABILITY_CALLS,
        );
        or_default(
            &mut self.max_concurrent_secrets_calls_per_workflow,
            DEFAULT_MAX_CONCURRENT_SECRETS_CALLS,
        );
        or_default(
            &mut self.module_execute_max_response_size_bytes,
            DEFAULT_MODULE_EXECUTE_MAX_RESPONSE_SIZE_BYTES,
        );
        or_default(
            &mut self.max_user_log_events_per_execution,
            DEFAULT_MAX_USER_LOG_EVENTS_PER_EXECUTION,
        );
        or_default(&mut self.max_user_log_line_length, DEFAULT_MAX_USER_LOG_LINE_LENGTH);
        or_default(&mut self.heartbeat_frequency_ms, DEFAULT_HEARTBEAT_FREQUENCY_MS);
        or_default(&mut self.shutdown_timeout_ms, DEFAULT_SHUTDOWN_TIMEOUT_MS);
        self
    }

    pub fn workflow_execution_timeout(&self) -> Duration {
        Duration::from_millis(self.workflow_execution_timeout_ms)
    }

    pub fn capability_call_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_call_timeout_ms)
    }

    pub fn trigger_subscription_request_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_subscription_request_timeout_ms)
    }

    pub fn trigger_all_registrations_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_all_registrations_timeout_ms)
    }

    pub fn trigger_event_max_age(&self) -> Duration {
        Duration::from_millis(self.trigger_event_max_age_ms)
    }

    pub fn heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.heartbeat_frequency_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Called once `init` finishes, with the reason if it failed.
pub type InitializedHook = Arc<dyn Fn(Result<(), &EngineError>) + Send + Sync>;
/// Called with the registration IDs after every trigger registered.
pub type SubscribedHook = Arc<dyn Fn(&[String]) + Send + Sync>;
/// Called once per execution with its final status.
pub type ExecutionFinishedHook = Arc<dyn Fn(&str, ExecutionStatus) + Send + Sync>;
/// Called once per execution with the module's result or error.
pub type ResultReceivedHook = Arc<dyn Fn(&str, Result<&serde_json::Value, &str>) + Send + Sync>;
/// Called when a trigger event is refused by the execution rate limiter.
pub type RateLimitedHook = Arc<dyn Fn(&str, &ResourceLimited) + Send + Sync>;

/// Caller-supplied lifecycle callbacks. Every hook defaults to a no-op.
#[derive(Clone)]
pub struct LifecycleHooks {
    pub on_initialized: InitializedHook,
    pub on_subscribed_to_triggers: SubscribedHook,
    pub on_execution_finished: ExecutionFinishedHook,
    pub on_result_received: ResultReceivedHook,
    pub on_rate_limited: RateLimitedHook,
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self {
            on_initialized: Arc::new(|_: Result<(), &EngineError>| {}),
            on_subscribed_to_triggers: Arc::new(|_: &[String]| {}),
            on_execution_finished: Arc::new(|_: &str, _: ExecutionStatus| {}),
            on_result_received: Arc::new(|_: &str, _: Result<&serde_json::Value, &str>| {}),
            on_rate_limited: Arc::new(|_: &str, _: &ResourceLimited| {}),
        }
    }
}

impl LifecycleHooks {
    pub fn on_initialized(mut self, hook: impl Fn(Result<(), &EngineError>) + Send + Sync + 'static) -> Self {
        self.on_initialized = Arc::new(hook);
        self
    }

    pub fn on_subscribed_to_triggers(mut self, hook: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
        self.on_subscribed_to_triggers = Arc::new(hook);
        self
    }

    pub fn on_execution_finished(mut self, hook: impl Fn(&str, ExecutionStatus) + Send + Sync + 'static) -> Self {
        self.on_execution_finished = Arc::new(hook);
        self
    }

    pub fn on_result_received(
        mut self,
        hook: impl Fn(&str, Result<&serde_json::Value, &str>) + Send + Sync + 'static,
    ) -> Self {
        self.on_result_received = Arc::new(hook);
        self
    }

    pub fn on_rate_limited(mut self, hook: impl Fn(&str, &ResourceLimited) + Send + Sync + 'static) -> Self {
        self.on_rate_limited = Arc::new(hook);
        self
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks").finish_non_exhaustive()
    }
}

/// Everything needed to build an [`crate::Engine`].
#[derive(Clone)]
pub struct EngineConfig {
    pub workflow_id: String,
    pub workflow_owner: String,
    pub workflow_name: String,
    pub module: Arc<dyn Module>,
    pub registry: Arc<dyn CapabilitiesRegistry>,
    pub store: Arc<dyn ExecutionStore>,
    pub limits: EngineLimits,
    pub clock: Option<Arc<dyn Clock>>,
    pub global_limiter: Option<Arc<dyn ResourceLimiter>>,
    pub rate_limiter: Option<Arc<dyn ExecutionRateLimiter>>,
    pub billing: Option<Arc<dyn BillingClient>>,
    pub event_sink: Option<Arc<dyn EventSink>>,
    pub share_combiner: Option<ShareCombiner>,
    pub hooks: LifecycleHooks,
    /// Mirror user logs to the tracing output.
    pub debug: bool,
}

impl EngineConfig {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_owner: impl Into<String>,
        workflow_name: impl Into<String>,
        module: Arc<dyn Module>,
        registry: Arc<dyn CapabilitiesRegistry>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_owner: workflow_owner.into(),
            workflow_name: workflow_name.into(),
            module,
            registry,
            store,
            limits: EngineLimits::default(),
            clock: None,
            global_limiter: None,
            rate_limiter: None,
            billing: None,
            event_sink: None,
            share_combiner: None,
            hooks: LifecycleHooks::default(),
            debug: false,
        }
    }

    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_global_limiter(mut self, limiter: Arc<dyn ResourceLimiter>) -> Self {
        self.global_limiter = Some(limiter);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn ExecutionRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_billing(mut self, billing: Arc<dyn BillingClient>) -> Self {
        self.billing = Some(billing);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn with_share_combiner(mut self, combiner: ShareCombiner) -> Self {
        self.share_combiner = Some(combiner);
        self
    }

    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Check identity fields and fill every unset limit and collaborator.
    pub fn validate(self) -> EngineResult<ValidatedConfig> {
        let workflow_id_format = Regex::new(r"^[0-9a-fA-F]{64}$")
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        let owner_format = Regex::new(r"^(0x)?[0-9a-fA-F]{40}$")
            .map_err(|e| EngineError::Configuration(e.to_string()))?;

        if !workflow_id_format.is_match(&self.workflow_id) {
            return Err(EngineError::Configuration(format!(
                "invalid workflow id {:?}: expected 64 hex characters",
                self.workflow_id
            )));
        }
        if !owner_format.is_match(&self.workflow_owner) {
            return Err(EngineError::Configuration(format!(
                "invalid workflow owner {:?}: expected 40 hex characters",
                self.workflow_owner
            )));
        }
        if self.workflow_name.trim().is_empty() {
            return Err(EngineError::Configuration("workflow name is required".to_string()));
        }

        Ok(ValidatedConfig {
            workflow_id: self.workflow_id,
            workflow_owner: self.workflow_owner,
            workflow_name: self.workflow_name,
            module: self.module,
            registry: self.registry,
            store: self.store,
            limits: self.limits.with_defaults(),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            global_limiter: self
                .global_limiter
                .unwrap_or_else(|| Arc::new(WorkflowLimiter::unbounded())),
            rate_limiter: self
                .rate_limiter
                .unwrap_or_else(|| Arc::new(GovernorRateLimiter::unlimited())),
            billing: self.billing,
            event_sink: self.event_sink.unwrap_or_else(|| Arc::new(TracingSink)),
            share_combiner: self.share_combiner.unwrap_or_else(|| {
                Arc::new(|_: &str, _: &[String]| -> anyhow::Result<String> {
                    anyhow::bail!("no share combiner configured")
                })
            }),
            hooks: self.hooks,
            debug: self.debug,
        })
    }
}

/// Configuration after validation: every field is usable as-is.
pub struct ValidatedConfig {
    pub workflow_id: String,
    pub workflow_owner: String,
    pub workflow_name: String,
    pub module: Arc<dyn Module>,
    pub registry: Arc<dyn CapabilitiesRegistry>,
    pub store: Arc<dyn ExecutionStore>,
    pub limits: EngineLimits,
    pub clock: Arc<dyn Clock>,
    pub global_limiter: Arc<dyn ResourceLimiter>,
    pub rate_limiter: Arc<dyn ExecutionRateLimiter>,
    /// Absent billing puts every report in metering mode.
    pub billing: Option<Arc<dyn BillingClient>>,
    pub event_sink: Arc<dyn EventSink>,
    pub share_combiner: ShareCombiner,
    pub hooks: LifecycleHooks,
    pub debug: bool,
}
