//! Registry of in-flight metering reports.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::billing::{BillingClient, GetOrganizationCreditsRequest};
use crate::error::MeteringError;
use crate::events::EventEmitter;
use crate::metering::report::{Report, ReportLabels};

/// One live [`Report`] per execution ID, shared by every execution of a
/// workflow.
pub struct Reports {
    reports: Mutex<HashMap<String, Arc<Report>>>,
    owner: String,
    workflow_id: String,
    client: Option<Arc<dyn BillingClient>>,
    emitter: EventEmitter,
}

impl Reports {
    pub fn new(
        client: Option<Arc<dyn BillingClient>>,
        owner: impl Into<String>,
        workflow_id: impl Into<String>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            reports: Mutex::new(HashMap::new()),
            owner: owner.into(),
            workflow_id: workflow_id.into(),
            client,
            emitter,
        }
    }

    /// Open a report for `execution_id`.
    pub fn start(&self, execution_id: &str) -> Result<Arc<Report>, MeteringError> {
        let mut reports = self.reports.lock();
        if reports.contains_key(execution_id) {
            return Err(MeteringError::ReportExists(execution_id.to_string()));
        }

        let report = Arc::new(Report::new(
            ReportLabels {
                owner: self.owner.clone(),
                workflow_id: self.workflow_id.clone(),
                execution_id: execution_id.to_string(),
            },
            self.client.clone(),
            self.emitter.clone(),
        ));
        reports.insert(execution_id.to_string(), report.clone());

        Ok(report)
    }

    pub fn get(&self, execution_id: &str) -> Option<Arc<Report>> {
        self.reports.lock().get(execution_id).cloned()
    }

    /// Close the report for `execution_id`, emitting and sending its receipt.
    ///
    /// The entry is removed even when either receipt fails; the failures are
    /// returned together.
    pub async fn end(&self, execution_id: &str) -> Result<(), MeteringError> {
        let report = self
            .reports
            .lock()
            .remove(execution_id)
            .ok_or_else(|| MeteringError::ReportNotFound(execution_id.to_string()))?;

        let mut errors = Vec::new();
        if let Err(e) = report.emit_receipt().await {
            errors.push(e);
        }
        if let Err(e) = report.send_receipt().await {
            errors.push(e);
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(MeteringError::Joined(errors)),
        }
    }

    /// Number of live reports.
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Credits available to the workflow's organisation, if billing is configured.
    pub async fn organization_credits(&self) -> Result<Option<f64>> {
        let Some(client) = &self.client else {
            return Ok(None);
        };

        let response = client
            .get_organization_credits_by_workflow(GetOrganizationCreditsRequest {
                workflow_id: self.workflow_id.clone(),
            })
            .await?;

        Ok(Some(response.credits))
    }
}

impl std::fmt::Debug for Reports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reports")
            .field("workflow_id", &self.workflow_id)
            .field("live", &self.len())
            .finish()
    }
}
