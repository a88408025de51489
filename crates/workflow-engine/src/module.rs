//! Compute module contract.
//!
//! The module runs the workflow program. The engine calls it once with a
//! subscribe request to learn which triggers to register, then once per
//! admitted trigger event.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capabilities::CapabilityResponse;
use crate::secrets::{SecretRequest, SecretResponse};

/// A trigger the workflow wants to be driven by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSubscription {
    /// Trigger capability ID.
    pub id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// What the module is asked to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Subscribe,
    Trigger {
        /// Index of the subscription that fired.
        id: u64,
        payload: serde_json::Value,
    },
}

/// Request to [`Module::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub kind: RequestKind,
    pub max_response_size: u64,
}

impl ExecuteRequest {
    pub fn subscribe(max_response_size: u64) -> Self {
        Self {
            kind: RequestKind::Subscribe,
            max_response_size,
        }
    }

    pub fn trigger(index: u64, payload: serde_json::Value, max_response_size: u64) -> Self {
        Self {
            kind: RequestKind::Trigger { id: index, payload },
            max_response_size,
        }
    }
}

/// Response from [`Module::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    Subscriptions(Vec<TriggerSubscription>),
    Value(serde_json::Value),
}

/// A capability call made by the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityCall {
    /// Capability ID.
    pub id: String,
    /// Unique per execution; used as the metering step reference.
    pub call_id: u64,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub config: serde_json::Value,
    /// User-supplied credit ceiling for this call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spend_limit: Option<f64>,
}

/// Services the engine offers a running module.
#[async_trait]
pub trait ExecutionHelper: Send + Sync {
    async fn call_capability(&self, call: CapabilityCall) -> Result<CapabilityResponse>;

    async fn get_secrets(&self, requests: Vec<SecretRequest>) -> Result<Vec<SecretResponse>>;

    fn workflow_execution_id(&self) -> &str;

    /// Record a line of user log output. Volume and length are capped.
    fn emit_user_log(&self, message: &str);
}

/// The workflow program.
#[async_trait]
pub trait Module: Send + Sync {
    fn start(&self);

    async fn execute(&self, request: ExecuteRequest, helper: Arc<dyn ExecutionHelper>) -> Result<ExecutionResult>;

    fn close(&self);
}

/// Helper handed to the module while it only declares subscriptions.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisallowedExecutionHelper;

#[async_trait]
impl ExecutionHelper for DisallowedExecutionHelper {
    async fn call_capability(&self, call: CapabilityCall) -> Result<CapabilityResponse> {
        anyhow::bail!("capability calls are not allowed during subscription (capability {})", call.id)
    }

    async fn get_secrets(&self, _requests: Vec<SecretRequest>) -> Result<Vec<SecretResponse>> {
        anyhow::bail!("secrets are not available during subscription")
    }

    fn workflow_execution_id(&self) -> &str {
        ""
    }

    fn emit_user_log(&self, message: &str) {
        tracing::debug!(message, "Dropping user log emitted during subscription");
    }
}
