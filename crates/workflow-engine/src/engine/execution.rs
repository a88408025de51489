//! One workflow execution, from admission to final status.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::capabilities::{CapabilityRequest, CapabilityResponse, MeteringNodeDetail, RequestMetadata};
use crate::metering::{DeductOpt, Report, COMPUTE_RESOURCE};
use crate::module::{CapabilityCall, ExecuteRequest, ExecutionHelper, ExecutionResult};
use crate::secrets::{SecretRequest, SecretResponse};
use crate::store::{ExecutionRecord, ExecutionStatus};

use super::{EngineInner, EnqueuedTriggerEvent};

/// Step reference of the compute earmark in every report.
const COMPUTE_STEP_REF: &str = "compute";

/// Extra compute reserved on top of the execution timeout to cover teardown.
const COMPUTE_CANCELLATION_PADDING_MS: u64 = 1_000;

/// Deterministic execution ID: hex SHA-256 of the workflow ID followed by
/// the trigger event ID.
pub fn generate_execution_id(workflow_id: &str, trigger_event_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workflow_id.as_bytes());
    hasher.update(trigger_event_id.as_bytes());
    hex::encode(hasher.finalize())
}

impl EngineInner {
    /// Run one admitted trigger event to completion. Every outcome is
    /// recorded; nothing is returned to the dispatcher.
    pub(crate) async fn run_execution(self: &Arc<Self>, queued: EnqueuedTriggerEvent) {
        let execution_id = generate_execution_id(&self.cfg.workflow_id, &queued.event.id);
        let started_at = self.cfg.clock.now();
        let started = Instant::now();

        tracing::info!(
            workflow_id = %self.cfg.workflow_id,
            execution_id = %execution_id,
            trigger_id = %queued.trigger_capability_id,
            event_id = %queued.event.id,
            "Execution started"
        );

        let report = self.start_metering(&execution_id).await;

        self.record(ExecutionRecord {
            execution_id: execution_id.clone(),
            workflow_id: self.cfg.workflow_id.clone(),
            status: ExecutionStatus::Started,
            started_at,
            finished_at: None,
            error: None,
        })
        .await;
        self.emitter
            .emit_execution_started(&execution_id, &queued.trigger_capability_id)
            .await;

        let helper = Arc::new(EngineExecutionHelper::new(self.clone(), execution_id.clone(), report.clone()));
        let limits = &self.cfg.limits;
        let request = ExecuteRequest::trigger(
            queued.trigger_index as u64,
            queued.event.payload.clone(),
            limits.module_execute_max_response_size_bytes,
        );

        let outcome = tokio::time::timeout(
            limits.workflow_execution_timeout(),
            self.cfg.module.execute(request, helper.clone()),
        )
        .await;
        helper.cancel.cancel();
        let duration = started.elapsed();

        if let Some(report) = report {
            self.finish_metering(&report, duration).await;
        }

        let (status, result) = match outcome {
            Err(_) => (
                ExecutionStatus::Timeout,
                Err(format!(
                    "execution timed out after {}ms",
                    limits.workflow_execution_timeout_ms
                )),
            ),
            Ok(Err(e)) => (ExecutionStatus::Errored, Err(format!("{:#}", e))),
            Ok(Ok(ExecutionResult::Value(value))) => (ExecutionStatus::Completed, Ok(value)),
            Ok(Ok(ExecutionResult::Subscriptions(_))) => (
                ExecutionStatus::Errored,
                Err("module returned subscriptions for a trigger request".to_string()),
            ),
        };

        (self.cfg.hooks.on_result_received)(&execution_id, result.as_ref().map_err(String::as_str));

        let error = result.err();
        match &error {
            None => tracing::info!(
                workflow_id = %self.cfg.workflow_id,
                execution_id = %execution_id,
                duration_ms = duration.as_millis() as u64,
                "Execution completed"
            ),
            Some(e) => tracing::warn!(
                workflow_id = %self.cfg.workflow_id,
                execution_id = %execution_id,
                status = %status,
                duration_ms = duration.as_millis() as u64,
                error = %e,
                "Execution failed"
            ),
        }

        metrics::counter!(
            "workflow_engine_executions_total",
            "workflow_id" => self.cfg.workflow_id.clone(),
            "status" => status.as_str()
        )
        .increment(1);
        metrics::histogram!(
            "workflow_engine_execution_duration_ms",
            "workflow_id" => self.cfg.workflow_id.clone(),
            "status" => status.as_str()
        )
        .record(duration.as_secs_f64() * 1000.0);

        self.record(ExecutionRecord {
            execution_id: execution_id.clone(),
            workflow_id: self.cfg.workflow_id.clone(),
            status,
            started_at,
            finished_at: Some(self.cfg.clock.now()),
            error: error.clone(),
        })
        .await;
        self.emitter
            .emit_execution_finished(
                &execution_id,
                status.as_str(),
                duration.as_millis() as u64,
                error.as_deref(),
            )
            .await;

        (self.cfg.hooks.on_execution_finished)(&execution_id, status);
    }

    async fn record(&self, record: ExecutionRecord) {
        let execution_id = record.execution_id.clone();
        if let Err(e) = self.cfg.store.upsert(record).await {
            tracing::warn!(
                workflow_id = %self.cfg.workflow_id,
                execution_id = %execution_id,
                error = %e,
                "Failed to persist execution status"
            );
        }
    }

    /// Open a report, reserve credits and earmark compute for the full
    /// execution timeout. Returns `None` if the execution runs unmetered.
    async fn start_metering(&self, execution_id: &str) -> Option<Arc<Report>> {
        let report = match self.reports.start(execution_id) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(
                    workflow_id = %self.cfg.workflow_id,
                    execution_id,
                    error = %e,
                    "Failed to open metering report"
                );
                return None;
            }
        };

        if let Err(e) = report.reserve().await {
            tracing::warn!(
                workflow_id = %self.cfg.workflow_id,
                execution_id,
                error = %e,
                "Credit reservation failed; executing without metering"
            );
            if let Err(e) = self.reports.end(execution_id).await {
                tracing::debug!(execution_id, error = %e, "Discarded unreserved metering report");
            }
            return None;
        }

        let compute_ms = self.cfg.limits.workflow_execution_timeout_ms + COMPUTE_CANCELLATION_PADDING_MS;
        if let Err(e) = report.deduct(
            COMPUTE_STEP_REF,
            DeductOpt::by_resource(COMPUTE_RESOURCE, compute_ms as f64),
        ) {
            tracing::warn!(
                workflow_id = %self.cfg.workflow_id,
                execution_id,
                error = %e,
                "Failed to earmark compute credits"
            );
        }

        Some(report)
    }

    /// Settle compute against the measured duration and close the report.
    async fn finish_metering(&self, report: &Report, duration: Duration) {
        let execution_id = report.labels().execution_id.clone();

        if report.step(COMPUTE_STEP_REF).is_some() {
            let peer_id = match self.local_node().await {
                Ok(node) => node.peer_id.clone(),
                Err(e) => {
                    tracing::debug!(error = %e, "Local node unavailable for compute settlement");
                    String::new()
                }
            };
            let spend = MeteringNodeDetail {
                peer_id,
                spend_unit: COMPUTE_RESOURCE.to_string(),
                spend_value: duration.as_millis().to_string(),
            };
            if let Err(e) = report.settle(COMPUTE_STEP_REF, &[spend]) {
                tracing::warn!(
                    workflow_id = %self.cfg.workflow_id,
                    execution_id = %execution_id,
                    error = %e,
                    "Failed to settle compute spend"
                );
            }
        }

        if let Err(e) = self.reports.end(&execution_id).await {
            tracing::warn!(
                workflow_id = %self.cfg.workflow_id,
                execution_id = %execution_id,
                error = %e,
                "Failed to submit metering report"
            );
        }
    }
}

/// [`ExecutionHelper`] bound to one execution.
pub(crate) struct EngineExecutionHelper {
    engine: Arc<EngineInner>,
    execution_id: String,
    report: Option<Arc<Report>>,
    /// Fires when the execution ends; pending capability and secrets calls
    /// stop waiting for permits. Engine shutdown does not fire it.
    cancel: CancellationToken,
    user_logs: AtomicUsize,
    user_log_limit_logged: AtomicBool,
}

impl EngineExecutionHelper {
    fn new(engine: Arc<EngineInner>, execution_id: String, report: Option<Arc<Report>>) -> Self {
        Self {
            engine,
            execution_id,
            report,
            cancel: CancellationToken::new(),
            user_logs: AtomicUsize::new(0),
            user_log_limit_logged: AtomicBool::new(false),
        }
    }

    async fn invoke_capability(&self, call: CapabilityCall) -> Result<CapabilityResponse> {
        let cfg = &self.engine.cfg;
        let capability = cfg
            .registry
            .get_executable(&call.id)
            .await
            .with_context(|| format!("capability {} not found", call.id))?;

        let step_ref = call.call_id.to_string();
        let mut spend_limits = Vec::new();
        let mut metered = false;

        if let Some(report) = &self.report {
            let capability_config = self.capability_config(&call.id).await;
            let calls = &self.engine.capability_calls;
            // This call holds one of the permits.
            let open_slots = calls.capacity().saturating_sub(calls.len()) + 1;

            match report.deduct(
                &step_ref,
                DeductOpt::by_derived_availability(call.spend_limit, open_slots, capability.info(), capability_config),
            ) {
                Ok(limits) => {
                    spend_limits = limits;
                    metered = true;
                }
                Err(e) => tracing::warn!(
                    execution_id = %self.execution_id,
                    capability_id = %call.id,
                    error = %e,
                    "Failed to earmark capability spend; calling without spend limits"
                ),
            }
        }

        let request = CapabilityRequest {
            method: call.method,
            payload: call.payload,
            config: call.config,
            metadata: RequestMetadata {
                workflow_id: cfg.workflow_id.clone(),
                workflow_owner: cfg.workflow_owner.clone(),
                workflow_name: cfg.workflow_name.clone(),
                workflow_execution_id: self.execution_id.clone(),
                reference_id: step_ref.clone(),
                spend_limits,
            },
        };

        let response = capability
            .execute(request)
            .await
            .with_context(|| format!("capability {} failed", call.id))?;

        if let (true, Some(report)) = (metered, &self.report) {
            if let Err(e) = report.settle(&step_ref, &response.metering) {
                tracing::warn!(
                    execution_id = %self.execution_id,
                    capability_id = %call.id,
                    error = %e,
                    "Failed to settle capability spend"
                );
            }
        }

        Ok(response)
    }

    /// The capability's configuration for the local workflow DON, or null.
    async fn capability_config(&self, capability_id: &str) -> serde_json::Value {
        let registry = &self.engine.cfg.registry;
        let don_id = match self.engine.local_node().await {
            Ok(node) => node.workflow_don.id,
            Err(e) => {
                tracing::debug!(error = %e, "Local node unavailable for capability config");
                return serde_json::Value::Null;
            }
        };

        match registry.config_for_capability(capability_id, don_id).await {
            Ok(config) => config.config,
            Err(e) => {
                tracing::debug!(capability_id, error = %e, "No capability config");
                serde_json::Value::Null
            }
        }
    }
}

#[async_trait]
impl ExecutionHelper for EngineExecutionHelper {
    async fn call_capability(&self, call: CapabilityCall) -> Result<CapabilityResponse> {
        let timeout = self.engine.cfg.limits.capability_call_timeout();
        let capability_id = call.id.clone();

        self.engine
            .capability_calls
            .when_acquired(&self.cancel, || async {
                match tokio::time::timeout(timeout, self.invoke_capability(call)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!(
                        "capability {} timed out after {}ms",
                        capability_id,
                        timeout.as_millis()
                    )),
                }
            })
            .await
    }

    async fn get_secrets(&self, requests: Vec<SecretRequest>) -> Result<Vec<SecretResponse>> {
        let timeout = self.engine.cfg.limits.capability_call_timeout();

        let responses = tokio::time::timeout(
            timeout,
            self.engine.secrets.get_secrets(&self.cancel, &self.execution_id, requests),
        )
        .await
        .map_err(|_| anyhow!("secrets fetch timed out after {}ms", timeout.as_millis()))??;
        Ok(responses)
    }

    fn workflow_execution_id(&self) -> &str {
        &self.execution_id
    }

    fn emit_user_log(&self, message: &str) {
        let limits = &self.engine.cfg.limits;

        let emitted = self.user_logs.fetch_add(1, Ordering::SeqCst);
        if emitted >= limits.max_user_log_events_per_execution {
            if !self.user_log_limit_logged.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    execution_id = %self.execution_id,
                    limit = limits.max_user_log_events_per_execution,
                    "User log limit reached; dropping further logs"
                );
            }
            return;
        }

        let line = truncate_to_char_boundary(message, limits.max_user_log_line_length).to_string();
        if self.engine.cfg.debug {
            tracing::info!(execution_id = %self.execution_id, user_log = %line, "User log");
        }

        let emitter = self.engine.emitter.clone();
        let execution_id = self.execution_id.clone();
        self.engine.tasks.spawn(async move {
            emitter.emit_user_log(&execution_id, &line).await;
        });
    }
}

/// Longest prefix of `s` no longer than `max` bytes that ends on a char
/// boundary.
fn truncate_to_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
