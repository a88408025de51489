//! Trigger subscription phase and per-trigger listeners.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::capabilities::{TriggerCapability, TriggerEvent, TriggerRegistrationRequest, TriggerResponse};
use crate::error::{EngineError, EngineResult};
use crate::module::{DisallowedExecutionHelper, ExecuteRequest, ExecutionResult};

use super::EngineInner;

/// A live registration with a trigger capability.
pub(crate) struct TriggerRegistration {
    pub(crate) capability: Arc<dyn TriggerCapability>,
    pub(crate) request: TriggerRegistrationRequest,
}

/// A trigger event waiting for admission.
#[derive(Debug, Clone)]
pub struct EnqueuedTriggerEvent {
    pub trigger_capability_id: String,
    pub trigger_index: usize,
    pub enqueued_at: DateTime<Utc>,
    pub event: TriggerEvent,
}

/// Registration ID for the subscription at `index`.
pub fn trigger_registration_id(workflow_id: &str, index: usize) -> String {
    format!("trigger_reg_{}_{}", workflow_id, index)
}

impl EngineInner {
    /// Ask the module for its subscriptions and register them all, or none.
    ///
    /// Returns the registration IDs.
    pub(crate) async fn subscribe_to_triggers(self: &Arc<Self>) -> EngineResult<Vec<String>> {
        let limits = &self.cfg.limits;

        let request = ExecuteRequest::subscribe(limits.module_execute_max_response_size_bytes);
        let result = tokio::time::timeout(
            limits.trigger_subscription_request_timeout(),
            self.cfg.module.execute(request, Arc::new(DisallowedExecutionHelper)),
        )
        .await
        .map_err(|_| EngineError::Timeout {
            operation: "trigger subscription request",
            timeout_ms: limits.trigger_subscription_request_timeout_ms,
        })?
        .map_err(|e| EngineError::Module(e.to_string()))?;

        let subscriptions = match result {
            ExecutionResult::Subscriptions(subscriptions) => subscriptions,
            ExecutionResult::Value(_) => {
                return Err(EngineError::Module(
                    "subscribe request returned a value instead of subscriptions".to_string(),
                ))
            }
        };

        if subscriptions.len() > limits.max_trigger_subscriptions {
            return Err(EngineError::TooManySubscriptions {
                count: subscriptions.len(),
                max: limits.max_trigger_subscriptions,
            });
        }

        // Resolve everything before registering anything.
        let mut resolved = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let capability = self
                .cfg
                .registry
                .get_trigger(&subscription.id)
                .await
                .map_err(|e| EngineError::CapabilityNotFound {
                    id: subscription.id.clone(),
                    reason: e.to_string(),
                })?;
            resolved.push((subscription, capability));
        }

        let mut triggers = self.triggers.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(shutting_down());
        }

        let deadline = tokio::time::Instant::now() + limits.trigger_all_registrations_timeout();
        let mut registered: Vec<(usize, TriggerRegistration, mpsc::Receiver<TriggerResponse>)> = Vec::new();

        for (index, (subscription, capability)) in resolved.into_iter().enumerate() {
            let request = TriggerRegistrationRequest {
                trigger_id: trigger_registration_id(&self.cfg.workflow_id, index),
                workflow_id: self.cfg.workflow_id.clone(),
                workflow_owner: self.cfg.workflow_owner.clone(),
                workflow_name: self.cfg.workflow_name.clone(),
                method: subscription.method.clone(),
                payload: subscription.payload.clone(),
            };

            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => Err(shutting_down()),
                result = tokio::time::timeout_at(deadline, capability.register_trigger(request.clone())) => {
                    match result {
                        Ok(Ok(events)) => Ok(events),
                        Ok(Err(e)) => Err(EngineError::Registration {
                            id: subscription.id.clone(),
                            reason: e.to_string(),
                        }),
                        Err(_) => Err(EngineError::Timeout {
                            operation: "trigger registrations",
                            timeout_ms: limits.trigger_all_registrations_timeout_ms,
                        }),
                    }
                }
            };

            let error = match outcome {
                Ok(events) => {
                    tracing::debug!(
                        workflow_id = %self.cfg.workflow_id,
                        trigger_id = %request.trigger_id,
                        capability_id = %subscription.id,
                        "Trigger registered"
                    );
                    registered.push((index, TriggerRegistration { capability, request }, events));
                    continue;
                }
                Err(error) => error,
            };

            tracing::error!(
                workflow_id = %self.cfg.workflow_id,
                capability_id = %subscription.id,
                error = %error,
                rollback = registered.len(),
                "Trigger registration failed, rolling back"
            );
            rollback(&registered).await;
            return Err(error);
        }

        // Shutdown may have started while the last registration completed.
        if self.shutdown.is_cancelled() {
            tracing::warn!(
                workflow_id = %self.cfg.workflow_id,
                rollback = registered.len(),
                "Engine closed during trigger registration, rolling back"
            );
            rollback(&registered).await;
            return Err(shutting_down());
        }

        let mut ids = Vec::with_capacity(registered.len());
        for (index, registration, events) in registered {
            let trigger_id = registration.request.trigger_id.clone();
            let capability_id = registration.capability.info().id;
            self.spawn_trigger_listener(capability_id, index, events);
            triggers.insert(trigger_id.clone(), registration);
            ids.push(trigger_id);
        }

        Ok(ids)
    }

    /// Forward a trigger's events into the shared queue until it closes or
    /// the engine shuts down.
    fn spawn_trigger_listener(
        self: &Arc<Self>,
        capability_id: String,
        index: usize,
        mut events: mpsc::Receiver<TriggerResponse>,
    ) {
        let inner = self.clone();

        self.tasks.spawn(async move {
            loop {
                let response = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    response = events.recv() => response,
                };

                let event = match response {
                    Some(Ok(event)) => event,
                    Some(Err(error)) => {
                        tracing::warn!(
                            workflow_id = %inner.cfg.workflow_id,
                            capability_id = %capability_id,
                            error = %error,
                            "Dropping errored trigger event"
                        );
                        inner.count_dropped_event("errored");
                        continue;
                    }
                    None => {
                        tracing::debug!(
                            workflow_id = %inner.cfg.workflow_id,
                            capability_id = %capability_id,
                            "Trigger channel closed"
                        );
                        break;
                    }
                };

                let queued = EnqueuedTriggerEvent {
                    trigger_capability_id: capability_id.clone(),
                    trigger_index: index,
                    enqueued_at: inner.cfg.clock.now(),
                    event,
                };

                match inner.event_tx.try_send(queued) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dropped)) => {
                        tracing::warn!(
                            workflow_id = %inner.cfg.workflow_id,
                            capability_id = %capability_id,
                            event_id = %dropped.event.id,
                            "Trigger event queue full, dropping event"
                        );
                        inner.count_dropped_event("queue_full");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        });
    }

    /// Unregister every trigger and clear the map. Failures are logged.
    pub(crate) async fn unregister_all_triggers(&self) {
        let registrations: Vec<TriggerRegistration> = {
            let mut triggers = self.triggers.lock().await;
            triggers.drain().map(|(_, registration)| registration).collect()
        };
        futures::future::join_all(registrations.iter().map(unregister)).await;
    }
}

fn shutting_down() -> EngineError {
    EngineError::InvalidState("engine is shutting down".to_string())
}

/// Undo registrations in reverse order.
async fn rollback(registered: &[(usize, TriggerRegistration, mpsc::Receiver<TriggerResponse>)]) {
    for (_, registration, _) in registered.iter().rev() {
        unregister(registration).await;
    }
}

async fn unregister(registration: &TriggerRegistration) {
    if let Err(e) = registration
        .capability
        .unregister_trigger(registration.request.clone())
        .await
    {
        tracing::warn!(
            trigger_id = %registration.request.trigger_id,
            error = %e,
            "Failed to unregister trigger"
        );
    }
}
