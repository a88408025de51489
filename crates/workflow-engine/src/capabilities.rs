//! Capability registry contract.
//!
//! The engine resolves trigger and executable capabilities by ID, reads
//! per-capability configuration, and looks up node identity for the
//! workflow DON when gathering encryption keys.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Kind of capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    Trigger,
    Action,
    Consensus,
    Target,
}

/// Static description of a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub id: String,
    pub capability_type: CapabilityType,
    #[serde(default)]
    pub description: String,
    /// Resource dimensions this capability bills against.
    #[serde(default)]
    pub spend_types: Vec<String>,
}

/// Per-DON configuration for a capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityConfiguration {
    /// Free-form configuration. `spendRatios` lives here.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Resource spend reported by one node for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringNodeDetail {
    pub peer_id: String,
    pub spend_unit: String,
    /// Decimal string.
    pub spend_value: String,
}

/// Ceiling on how much of a resource a call may consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendLimit {
    pub spend_type: String,
    /// Decimal string.
    pub limit: String,
}

/// Metadata attached to every capability request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub workflow_id: String,
    pub workflow_owner: String,
    pub workflow_name: String,
    pub workflow_execution_id: String,
    pub reference_id: String,
    #[serde(default)]
    pub spend_limits: Vec<SpendLimit>,
}

/// Request to an executable capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub method: String,
    pub payload: serde_json::Value,
    pub config: serde_json::Value,
    pub metadata: RequestMetadata,
}

/// Response from an executable capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityResponse {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metering: Vec<MeteringNodeDetail>,
}

/// Event delivered by a trigger capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Unique per event; feeds the execution ID.
    pub id: String,
    pub trigger_type: String,
    pub payload: serde_json::Value,
}

/// One item from a trigger's delivery channel.
pub type TriggerResponse = std::result::Result<TriggerEvent, String>;

/// Request to start or stop a trigger registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRegistrationRequest {
    pub trigger_id: String,
    pub workflow_id: String,
    pub workflow_owner: String,
    pub workflow_name: String,
    pub method: String,
    pub payload: serde_json::Value,
}

/// A capability that pushes events to the engine.
#[async_trait]
pub trait TriggerCapability: Send + Sync {
    fn info(&self) -> CapabilityInfo;

    /// Register and return the channel events will arrive on.
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<mpsc::Receiver<TriggerResponse>>;

    async fn unregister_trigger(&self, request: TriggerRegistrationRequest) -> Result<()>;
}

/// A capability invoked by a workflow step.
#[async_trait]
pub trait ExecutableCapability: Send + Sync {
    fn info(&self) -> CapabilityInfo;

    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResponse>;
}

/// A decentralised oracle network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Don {
    pub id: u32,
    pub members: Vec<String>,
}

/// A node as known to the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    pub peer_id: String,
    /// Hex-encoded public key used to encrypt secret shares for this node.
    pub encryption_public_key: String,
    pub workflow_don: Don,
}

/// Resolves capabilities and node identity.
#[async_trait]
pub trait CapabilitiesRegistry: Send + Sync {
    async fn get_trigger(&self, id: &str) -> Result<Arc<dyn TriggerCapability>>;

    async fn get_executable(&self, id: &str) -> Result<Arc<dyn ExecutableCapability>>;

    async fn config_for_capability(&self, capability_id: &str, don_id: u32) -> Result<CapabilityConfiguration>;

    async fn local_node(&self) -> Result<Node>;

    async fn node_by_peer_id(&self, peer_id: &str) -> Result<Node>;
}
