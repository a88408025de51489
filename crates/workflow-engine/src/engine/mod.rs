//! Workflow engine.
//!
//! One [`Engine`] drives one workflow: it asks the module which triggers to
//! subscribe to, registers them all or none, then turns trigger events into
//! bounded, time-limited, metered executions until it is closed.
//!
//! ## Lifecycle
//!
//! `Created -> Starting -> Running -> Closing -> Closed`. `start` and `close`
//! may each be called once. Initialization runs in the background and is
//! reported through [`crate::LifecycleHooks::on_initialized`].

mod execution;
mod triggers;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::capabilities::{CapabilityResponse, Node};
use crate::config::{EngineConfig, ValidatedConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::EventEmitter;
use crate::metering::Reports;
use crate::secrets::SecretsFetcher;
use crate::semaphore::Semaphore;

pub use execution::generate_execution_id;
pub use triggers::{trigger_registration_id, EnqueuedTriggerEvent};

use triggers::TriggerRegistration;

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Starting,
    Running,
    Closing,
    Closed,
}

pub(crate) struct EngineInner {
    cfg: ValidatedConfig,
    state: Mutex<EngineState>,
    triggers: tokio::sync::Mutex<HashMap<String, TriggerRegistration>>,
    event_tx: mpsc::Sender<EnqueuedTriggerEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<EnqueuedTriggerEvent>>>,
    executions: Arc<tokio::sync::Semaphore>,
    capability_calls: Semaphore<CapabilityResponse>,
    secrets: SecretsFetcher,
    reports: Reports,
    emitter: EventEmitter,
    local_node: tokio::sync::OnceCell<Node>,
    holds_global_slot: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Runs one workflow.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Validate `config` and build an engine in the `Created` state.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let cfg = config.validate()?;
        let limits = &cfg.limits;

        let emitter = EventEmitter::new(cfg.event_sink.clone(), cfg.workflow_id.clone());
        let (event_tx, event_rx) = mpsc::channel(limits.trigger_event_queue_size);

        let secrets = SecretsFetcher::new(
            cfg.registry.clone(),
            limits.max_concurrent_secrets_calls_per_workflow,
            cfg.share_combiner.clone(),
            cfg.workflow_owner.clone(),
            cfg.workflow_id.clone(),
            cfg.workflow_name.clone(),
        );
        let reports = Reports::new(
            cfg.billing.clone(),
            cfg.workflow_owner.clone(),
            cfg.workflow_id.clone(),
            emitter.clone(),
        );

        let inner = EngineInner {
            state: Mutex::new(EngineState::Created),
            triggers: tokio::sync::Mutex::new(HashMap::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            executions: Arc::new(tokio::sync::Semaphore::new(limits.max_concurrent_workflow_executions)),
            capability_calls: Semaphore::new(limits.max_concurrent_capability_calls_per_workflow),
            secrets,
            reports,
            emitter,
            local_node: tokio::sync::OnceCell::new(),
            holds_global_slot: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            cfg,
        };

        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.cfg.workflow_id
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    /// Metering reports of in-flight executions.
    pub fn reports(&self) -> &Reports {
        &self.inner.reports
    }

    /// IDs of the currently registered triggers.
    pub async fn registered_triggers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.triggers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start the module and spawn the background tasks.
    ///
    /// Returns once the tasks are spawned; initialization finishes in the
    /// background.
    pub fn start(&self) -> EngineResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != EngineState::Created {
                return Err(EngineError::InvalidState(format!(
                    "cannot start engine in state {:?}",
                    *state
                )));
            }
            *state = EngineState::Starting;
        }

        let inner = &self.inner;
        tracing::info!(
            workflow_id = %inner.cfg.workflow_id,
            workflow_owner = %inner.cfg.workflow_owner,
            workflow_name = %inner.cfg.workflow_name,
            "Starting workflow engine"
        );

        inner.cfg.module.start();
        inner.tasks.spawn(inner.clone().heartbeat());
        inner.tasks.spawn(inner.clone().init());
        inner.tasks.spawn(inner.clone().dispatch_trigger_events());

        *inner.state.lock() = EngineState::Running;
        Ok(())
    }

    /// Stop the engine.
    ///
    /// Unregisters every trigger, waits up to the shutdown timeout for
    /// background work, closes the module and returns the global limiter
    /// slot. In-flight executions still running after the timeout keep their
    /// own deadlines.
    pub async fn close(&self) -> EngineResult<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            match *state {
                EngineState::Created => {
                    *state = EngineState::Closed;
                    return Ok(());
                }
                EngineState::Closing | EngineState::Closed => {
                    return Err(EngineError::InvalidState("engine already closed".to_string()));
                }
                EngineState::Starting | EngineState::Running => *state = EngineState::Closing,
            }
        }

        tracing::info!(workflow_id = %inner.cfg.workflow_id, "Closing workflow engine");
        inner.shutdown.cancel();

        let drain = async {
            inner.unregister_all_triggers().await;
            inner.tasks.close();
            inner.tasks.wait().await;
        };
        if tokio::time::timeout(inner.cfg.limits.shutdown_timeout(), drain).await.is_err() {
            tracing::warn!(
                workflow_id = %inner.cfg.workflow_id,
                timeout_ms = inner.cfg.limits.shutdown_timeout_ms,
                "Engine shutdown timed out; abandoning remaining tasks"
            );
        }

        inner.cfg.module.close();

        metrics::gauge!(
            "workflow_engine_metering_mode",
            "workflow_id" => inner.cfg.workflow_id.clone()
        )
        .set(0.0);

        if inner.holds_global_slot.swap(false, Ordering::SeqCst) {
            inner.cfg.global_limiter.free_slots(&inner.cfg.workflow_owner, 1).await;
        }

        *inner.state.lock() = EngineState::Closed;
        tracing::info!(workflow_id = %inner.cfg.workflow_id, "Workflow engine closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Stop background tasks if the owner never called close.
        self.inner.shutdown.cancel();
    }
}

impl EngineInner {
    async fn init(self: Arc<Self>) {
        let owner = &self.cfg.workflow_owner;

        if let Err(limited) = self.cfg.global_limiter.use_slots(owner, 1).await {
            tracing::warn!(
                workflow_id = %self.cfg.workflow_id,
                workflow_owner = %owner,
                scope = %limited.scope,
                limit = limited.limit,
                "Workflow engine refused by global limiter"
            );
            metrics::counter!(
                "workflow_engine_init_limited_total",
                "scope" => limited.scope.to_string()
            )
            .increment(1);
            let err = EngineError::ResourceLimited(limited);
            (self.cfg.hooks.on_initialized)(Err(&err));
            return;
        }
        self.holds_global_slot.store(true, Ordering::SeqCst);

        match self.subscribe_to_triggers().await {
            Ok(ids) => {
                tracing::info!(
                    workflow_id = %self.cfg.workflow_id,
                    triggers = ids.len(),
                    "Workflow engine initialized"
                );
                (self.cfg.hooks.on_subscribed_to_triggers)(&ids);
                (self.cfg.hooks.on_initialized)(Ok(()));
                self.log_organization_credits().await;
            }
            Err(e) => {
                tracing::error!(
                    workflow_id = %self.cfg.workflow_id,
                    error = %e,
                    "Workflow engine initialization failed"
                );
                (self.cfg.hooks.on_initialized)(Err(&e));
            }
        }
    }

    async fn log_organization_credits(&self) {
        match self.reports.organization_credits().await {
            Ok(Some(credits)) => tracing::info!(
                workflow_id = %self.cfg.workflow_id,
                credits,
                "Organization credits available"
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!(
                workflow_id = %self.cfg.workflow_id,
                error = %e,
                "Failed to fetch organization credits"
            ),
        }
    }

    async fn heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cfg.limits.heartbeat_frequency());
        ticker.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    metrics::counter!(
                        "workflow_engine_heartbeat_total",
                        "workflow_id" => self.cfg.workflow_id.clone()
                    )
                    .increment(1);
                    tracing::debug!(workflow_id = %self.cfg.workflow_id, "Engine heartbeat");
                }
            }
        }
    }

    /// Admit queued trigger events one at a time: drop stale or rate-limited
    /// ones, wait for an execution permit, then run the execution on its own
    /// task.
    async fn dispatch_trigger_events(self: Arc<Self>) {
        let Some(mut events) = self.event_rx.lock().take() else {
            return;
        };
        let max_age = self.cfg.limits.trigger_event_max_age();

        loop {
            let queued = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                queued = events.recv() => match queued {
                    Some(queued) => queued,
                    None => break,
                },
            };

            let age = (self.cfg.clock.now() - queued.enqueued_at)
                .to_std()
                .unwrap_or_default();
            if age > max_age {
                tracing::warn!(
                    workflow_id = %self.cfg.workflow_id,
                    event_id = %queued.event.id,
                    age_ms = age.as_millis() as u64,
                    "Dropping stale trigger event"
                );
                self.count_dropped_event("stale");
                continue;
            }

            if let Err(limited) = self.cfg.rate_limiter.allow(&self.cfg.workflow_owner) {
                tracing::warn!(
                    workflow_id = %self.cfg.workflow_id,
                    event_id = %queued.event.id,
                    scope = %limited.scope,
                    "Execution rate limited, dropping trigger event"
                );
                self.count_dropped_event("rate_limited");
                (self.cfg.hooks.on_rate_limited)(&queued.event.id, &limited);
                continue;
            }

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.executions.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let inner = self.clone();
            self.tasks.spawn(async move {
                let _permit = permit;
                inner.run_execution(queued).await;
            });
        }

        tracing::debug!(workflow_id = %self.cfg.workflow_id, "Trigger event dispatcher stopped");
    }

    fn count_dropped_event(&self, reason: &'static str) {
        metrics::counter!(
            "workflow_engine_trigger_events_dropped_total",
            "workflow_id" => self.cfg.workflow_id.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    /// The local node, fetched once.
    async fn local_node(&self) -> anyhow::Result<&Node> {
        self.local_node
            .get_or_try_init(|| self.cfg.registry.local_node())
            .await
    }
}
