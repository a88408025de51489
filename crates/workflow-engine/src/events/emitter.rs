//! Event emitter with retry logic.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metering::MeteringReport;

/// Telemetry event published by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Unique event identifier.
    pub event_id: uuid::Uuid,

    /// Event type (e.g., "execution.started", "user.log").
    pub event_type: String,

    /// Workflow the event belongs to.
    pub workflow_id: String,

    /// Execution ID, when the event is execution-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,

    /// Emission time.
    pub timestamp: DateTime<Utc>,

    /// Event payload.
    pub payload: serde_json::Value,
}

/// Destination for engine telemetry.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: EngineEvent) -> Result<()>;
}

/// Sink that writes events to the tracing subscriber.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn publish(&self, event: EngineEvent) -> Result<()> {
        tracing::info!(
            event_type = %event.event_type,
            workflow_id = %event.workflow_id,
            execution_id = event.execution_id.as_deref().unwrap_or(""),
            payload = %event.payload,
            "Engine event"
        );
        Ok(())
    }
}

/// Event emitter with automatic retry.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    workflow_id: String,
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl EventEmitter {
    /// Create a new event emitter.
    pub fn new(sink: Arc<dyn EventSink>, workflow_id: impl Into<String>) -> Self {
        Self {
            sink,
            workflow_id: workflow_id.into(),
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Create an event emitter with custom retry settings.
    pub fn with_retry(
        sink: Arc<dyn EventSink>,
        workflow_id: impl Into<String>,
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            sink,
            workflow_id: workflow_id.into(),
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    /// Emit an event with retry.
    pub async fn emit(
        &self,
        event_type: &str,
        execution_id: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<()> {
        let event = EngineEvent {
            event_id: uuid::Uuid::new_v4(),
            event_type: event_type.to_string(),
            workflow_id: self.workflow_id.clone(),
            execution_id: execution_id.map(str::to_string),
            timestamp: Utc::now(),
            payload,
        };

        let mut delay = self.initial_delay;

        for attempt in 0..=self.max_retries {
            match self.sink.publish(event.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %e,
                        event_type = %event.event_type,
                        "Event emission failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.max_delay);
                }
                Err(e) => {
                    tracing::error!(
                        event_type = %event.event_type,
                        error = %e,
                        "Event emission failed after all retries"
                    );
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Emit an event, logging instead of returning failures.
    pub async fn emit_best_effort(
        &self,
        event_type: &str,
        execution_id: Option<&str>,
        payload: serde_json::Value,
    ) {
        // Failures are already logged by `emit`.
        let _ = self.emit(event_type, execution_id, payload).await;
    }

    /// Emit an execution.started event.
    pub async fn emit_execution_started(&self, execution_id: &str, trigger_id: &str) {
        self.emit_best_effort(
            "execution.started",
            Some(execution_id),
            serde_json::json!({ "trigger_id": trigger_id }),
        )
        .await
    }

    /// Emit an execution.finished event.
    pub async fn emit_execution_finished(
        &self,
        execution_id: &str,
        status: &str,
        duration_ms: u64,
        error: Option<&str>,
    ) {
        self.emit_best_effort(
            "execution.finished",
            Some(execution_id),
            serde_json::json!({
                "status": status,
                "duration_ms": duration_ms,
                "error": error,
            }),
        )
        .await
    }

    /// Emit a user.log event.
    pub async fn emit_user_log(&self, execution_id: &str, message: &str) {
        self.emit_best_effort(
            "user.log",
            Some(execution_id),
            serde_json::json!({ "message": message }),
        )
        .await
    }

    /// Emit a metering.report event.
    pub async fn emit_metering_report(&self, execution_id: &str, report: &MeteringReport) -> Result<()> {
        self.emit(
            "metering.report",
            Some(execution_id),
            serde_json::to_value(report)?,
        )
        .await
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("workflow_id", &self.workflow_id)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
