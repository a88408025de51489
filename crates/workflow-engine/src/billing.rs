//! Billing service client contract.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Request for the credits available to a workflow's organisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOrganizationCreditsRequest {
    pub workflow_id: String,
}

/// Credits available to the organisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOrganizationCreditsResponse {
    pub credits: f64,
}

/// Request for the rate card applied to a workflow's executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetWorkflowExecutionRatesRequest {
    pub workflow_owner: String,
    pub workflow_id: String,
}

/// Credits charged per unit of a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRate {
    pub resource_type: String,
    /// Decimal string.
    pub units_per_credit: String,
}

/// Rate card for a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetWorkflowExecutionRatesResponse {
    pub rates: Vec<ResourceRate>,
}

/// Request to earmark credits for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveCreditsRequest {
    pub workflow_owner: String,
    pub workflow_id: String,
    pub workflow_execution_id: String,
}

/// Outcome of a reservation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReserveCreditsResponse {
    /// False when the organisation cannot fund the execution.
    pub success: bool,
    /// Credits granted to the execution.
    pub credits: f64,
    /// Rate card; may be empty, in which case it is fetched separately.
    #[serde(default)]
    pub rates: Vec<ResourceRate>,
}

/// Final metering receipt for an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitWorkflowReceiptRequest {
    pub workflow_owner: String,
    pub workflow_id: String,
    pub workflow_execution_id: String,
    pub metering: crate::metering::MeteringReport,
}

/// Acknowledgement of a receipt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitWorkflowReceiptResponse {
    pub success: bool,
}

/// Billing RPC backend.
#[async_trait]
pub trait BillingClient: Send + Sync {
    async fn get_organization_credits_by_workflow(
        &self,
        request: GetOrganizationCreditsRequest,
    ) -> Result<GetOrganizationCreditsResponse>;

    async fn get_workflow_execution_rates(
        &self,
        request: GetWorkflowExecutionRatesRequest,
    ) -> Result<GetWorkflowExecutionRatesResponse>;

    async fn reserve_credits(&self, request: ReserveCreditsRequest) -> Result<ReserveCreditsResponse>;

    async fn submit_workflow_receipt(
        &self,
        request: SubmitWorkflowReceiptRequest,
    ) -> Result<SubmitWorkflowReceiptResponse>;
}

/// Parse a rate card into `resource -> credits per unit`.
pub fn to_rate_card(rates: &[ResourceRate]) -> Result<HashMap<String, f64>> {
    rates
        .iter()
        .map(|rate| {
            let value: f64 = rate.units_per_credit.trim().parse().map_err(|e| {
                anyhow::anyhow!(
                    "invalid rate {:?} for resource {}: {}",
                    rate.units_per_credit,
                    rate.resource_type,
                    e
                )
            })?;
            Ok((rate.resource_type.clone(), value))
        })
        .collect()
}
