//! Per-execution metering ledger.
//!
//! A [`Report`] moves through `reserve -> deduct -> settle -> receipt`.
//! Billing anomalies never fail an execution: instead the report switches,
//! once and for good, into metering mode where spends are still recorded
//! but the balance is no longer debited.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::billing::{
    to_rate_card, BillingClient, GetWorkflowExecutionRatesRequest, ReserveCreditsRequest,
    SubmitWorkflowReceiptRequest,
};
use crate::capabilities::{CapabilityInfo, MeteringNodeDetail, SpendLimit};
use crate::error::MeteringError;
use crate::events::EventEmitter;
use crate::metering::balance::BalanceStore;

/// Resource unit used for the engine's own compute time, in milliseconds.
pub const COMPUTE_RESOURCE: &str = "COMPUTE";

/// Capability config key holding per-spend-type ratios.
pub const SPEND_RATIOS_KEY: &str = "spendRatios";

/// Identity of the execution a report belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLabels {
    pub owner: String,
    pub workflow_id: String,
    pub execution_id: String,
}

/// Whether spends are enforced or only recorded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MeteringMode {
    #[default]
    Normal,
    /// Recording only; `cause` is the first anomaly seen.
    Metering { cause: String },
}

impl MeteringMode {
    pub fn is_metering(&self) -> bool {
        matches!(self, MeteringMode::Metering { .. })
    }
}

/// Spend reported by one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportStepDetail {
    pub peer_id: String,
    pub spend_value: String,
}

/// Ledger entry for one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportStep {
    /// Credits earmarked by `deduct`.
    pub deduction: f64,
    /// Per-node spends grouped by resource unit, set by `settle`.
    pub spends: Option<BTreeMap<String, Vec<ReportStepDetail>>>,
}

/// How a deduction is sized.
#[derive(Debug, Clone)]
pub enum DeductOpt {
    /// Earmark a fixed amount of a resource.
    ByResource { unit: String, amount: f64 },
    /// Earmark an equal share of what is left for each open call slot,
    /// capped by the user's own limit, and derive per-spend-type limits.
    ByDerivedAvailability {
        user_limit: Option<f64>,
        open_slots: usize,
        info: CapabilityInfo,
        config: serde_json::Value,
    },
}

impl DeductOpt {
    pub fn by_resource(unit: impl Into<String>, amount: f64) -> Self {
        DeductOpt::ByResource {
            unit: unit.into(),
            amount,
        }
    }

    pub fn by_derived_availability(
        user_limit: Option<f64>,
        open_slots: usize,
        info: CapabilityInfo,
        config: serde_json::Value,
    ) -> Self {
        DeductOpt::ByDerivedAvailability {
            user_limit,
            open_slots,
            info,
            config,
        }
    }
}

/// Wire form of one step in a metering report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeteringReportStep {
    pub peer_to_peer: Vec<MeteringNodeDetail>,
}

/// Wire form of a report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeteringReport {
    pub steps: BTreeMap<String, MeteringReportStep>,
    pub metering: bool,
    #[serde(default)]
    pub message: String,
}

struct ReportState {
    balance: BalanceStore,
    ready: bool,
    mode: MeteringMode,
    steps: HashMap<String, ReportStep>,
}

impl ReportState {
    /// The only place metering mode is entered. Never left.
    fn switch_to_metering_mode(&mut self, labels: &ReportLabels, cause: impl Display) {
        if self.mode.is_metering() {
            return;
        }

        let cause = cause.to_string();
        tracing::warn!(
            workflow_id = %labels.workflow_id,
            execution_id = %labels.execution_id,
            cause = %cause,
            "Switching to metering mode"
        );
        metrics::gauge!("workflow_engine_metering_mode", "workflow_id" => labels.workflow_id.clone())
            .set(1.0);
        self.mode = MeteringMode::Metering { cause };
    }

    fn credit_to_spend_limits(
        &mut self,
        labels: &ReportLabels,
        info: &CapabilityInfo,
        config: &serde_json::Value,
        credits: f64,
    ) -> Vec<SpendLimit> {
        if self.mode.is_metering() || info.spend_types.is_empty() {
            return Vec::new();
        }

        let ratios: Vec<(String, f64)> = if info.spend_types.len() == 1 {
            vec![(info.spend_types[0].clone(), 1.0)]
        } else {
            match parse_spend_ratios(&info.spend_types, config) {
                Ok(ratios) => ratios,
                Err(cause) => {
                    self.switch_to_metering_mode(labels, format!("capability {}: {}", info.id, cause));
                    return Vec::new();
                }
            }
        };

        let mut limits = Vec::with_capacity(ratios.len());
        for (spend_type, ratio) in ratios {
            let conversion = self.balance.convert_from_balance(&spend_type, credits * ratio);
            if !conversion.rate_found {
                self.switch_to_metering_mode(labels, MeteringError::RateNotFound(spend_type));
                return Vec::new();
            }
            // Free resources carry no ceiling.
            if conversion.value.is_finite() {
                limits.push(SpendLimit {
                    spend_type,
                    limit: conversion.value.to_string(),
                });
            }
        }

        limits
    }
}

fn parse_spend_ratios(
    spend_types: &[String],
    config: &serde_json::Value,
) -> Result<Vec<(String, f64)>, String> {
    let ratios = config
        .get(SPEND_RATIOS_KEY)
        .and_then(|v| v.as_object())
        .ok_or_else(|| format!("missing {} for {} spend types", SPEND_RATIOS_KEY, spend_types.len()))?;

    if ratios.len() != spend_types.len() {
        return Err(format!(
            "{} spend ratios configured for {} spend types",
            ratios.len(),
            spend_types.len()
        ));
    }

    spend_types
        .iter()
        .map(|spend_type| {
            let raw = ratios
                .get(spend_type)
                .ok_or_else(|| format!("no spend ratio for {}", spend_type))?;
            let ratio = match raw {
                serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                serde_json::Value::Number(n) => n.as_f64(),
                _ => None,
            }
            .filter(|r| r.is_finite() && *r >= 0.0)
            .ok_or_else(|| format!("invalid spend ratio {} for {}", raw, spend_type))?;
            Ok((spend_type.clone(), ratio))
        })
        .collect()
}

/// Median of a non-empty set of values.
pub(crate) fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Metering ledger for one workflow execution.
pub struct Report {
    labels: ReportLabels,
    client: Option<Arc<dyn BillingClient>>,
    emitter: EventEmitter,
    state: Mutex<ReportState>,
}

impl Report {
    pub fn new(labels: ReportLabels, client: Option<Arc<dyn BillingClient>>, emitter: EventEmitter) -> Self {
        Self {
            labels,
            client,
            emitter,
            state: Mutex::new(ReportState {
                balance: BalanceStore::empty(),
                ready: false,
                mode: MeteringMode::Normal,
                steps: HashMap::new(),
            }),
        }
    }

    pub fn labels(&self) -> &ReportLabels {
        &self.labels
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    pub fn metering_mode(&self) -> MeteringMode {
        self.state.lock().mode.clone()
    }

    /// Current balance in credits.
    pub fn balance(&self) -> f64 {
        self.state.lock().balance.get()
    }

    pub fn step(&self, step_ref: &str) -> Option<ReportStep> {
        self.state.lock().steps.get(step_ref).cloned()
    }

    fn fall_back(&self, cause: impl Display) {
        let mut state = self.state.lock();
        state.switch_to_metering_mode(&self.labels, cause);
        state.ready = true;
    }

    /// Reserve credits for the execution.
    ///
    /// A missing client or a failing RPC puts the report in metering mode
    /// and succeeds. Only an explicit funding denial is an error.
    pub async fn reserve(&self) -> Result<(), MeteringError> {
        if self.is_ready() {
            return Ok(());
        }

        let Some(client) = self.client.clone() else {
            self.fall_back(MeteringError::NoBillingClient);
            return Ok(());
        };

        let response = match client
            .reserve_credits(ReserveCreditsRequest {
                workflow_owner: self.labels.owner.clone(),
                workflow_id: self.labels.workflow_id.clone(),
                workflow_execution_id: self.labels.execution_id.clone(),
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.fall_back(format!("reserve credits: {}", e));
                return Ok(());
            }
        };

        if !response.success {
            return Err(MeteringError::InsufficientFunding);
        }

        let rates = if response.rates.is_empty() {
            match client
                .get_workflow_execution_rates(GetWorkflowExecutionRatesRequest {
                    workflow_owner: self.labels.owner.clone(),
                    workflow_id: self.labels.workflow_id.clone(),
                })
                .await
            {
                Ok(card) => card.rates,
                Err(e) => {
                    self.fall_back(format!("get execution rates: {}", e));
                    return Ok(());
                }
            }
        } else {
            response.rates
        };

        let balance = to_rate_card(&rates)
            .map_err(|e| e.to_string())
            .and_then(|card| BalanceStore::new(response.credits, card).map_err(|e| e.to_string()));

        let mut state = self.state.lock();
        match balance {
            Ok(balance) => state.balance = balance,
            Err(cause) => state.switch_to_metering_mode(&self.labels, cause),
        }
        state.ready = true;

        tracing::debug!(
            execution_id = %self.labels.execution_id,
            credits = response.credits,
            metering = state.mode.is_metering(),
            "Credits reserved"
        );

        Ok(())
    }

    /// Earmark credits for `step_ref` and return any spend limits the
    /// capability should honour.
    pub fn deduct(&self, step_ref: &str, opt: DeductOpt) -> Result<Vec<SpendLimit>, MeteringError> {
        let mut state = self.state.lock();

        if !state.ready {
            return Err(MeteringError::NoReserve);
        }
        if state.steps.contains_key(step_ref) {
            return Err(MeteringError::StepDeductExists(step_ref.to_string()));
        }

        match opt {
            DeductOpt::ByResource { unit, amount } => {
                if !amount.is_finite() || amount < 0.0 {
                    return Err(MeteringError::InvalidAmount(amount));
                }

                let conversion = state.balance.convert_to_balance(&unit, amount);
                if !conversion.rate_found {
                    state.switch_to_metering_mode(&self.labels, MeteringError::RateNotFound(unit));
                }
                if !state.mode.is_metering() {
                    state.balance.minus(conversion.value)?;
                }

                state.steps.insert(
                    step_ref.to_string(),
                    ReportStep {
                        deduction: conversion.value,
                        spends: None,
                    },
                );
                Ok(Vec::new())
            }
            DeductOpt::ByDerivedAvailability {
                user_limit,
                open_slots,
                info,
                config,
            } => {
                if open_slots == 0 {
                    return Err(MeteringError::NoOpenCalls);
                }
                if let Some(limit) = user_limit {
                    if !limit.is_finite() || limit < 0.0 {
                        return Err(MeteringError::InvalidAmount(limit));
                    }
                }

                let mut spend_limit = state.balance.get() / open_slots as f64;
                if let Some(limit) = user_limit {
                    spend_limit = spend_limit.min(limit);
                }

                if !state.mode.is_metering() {
                    state.balance.minus(spend_limit)?;
                }

                state.steps.insert(
                    step_ref.to_string(),
                    ReportStep {
                        deduction: spend_limit,
                        spends: None,
                    },
                );

                Ok(state.credit_to_spend_limits(&self.labels, &info, &config, spend_limit))
            }
        }
    }

    /// Record what `step_ref` actually cost and refund the unspent earmark.
    ///
    /// Each resource settles on the median of the values reported by the
    /// nodes. Unparsable values are skipped.
    pub fn settle(&self, step_ref: &str, details: &[MeteringNodeDetail]) -> Result<(), MeteringError> {
        let mut state = self.state.lock();

        let deduction = match state.steps.get(step_ref) {
            None => return Err(MeteringError::NoDeduct(step_ref.to_string())),
            Some(step) if step.spends.is_some() => {
                return Err(MeteringError::StepSpendExists(step_ref.to_string()))
            }
            Some(step) => step.deduction,
        };

        let mut spends: BTreeMap<String, Vec<ReportStepDetail>> = BTreeMap::new();
        let mut values: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        for detail in details {
            spends
                .entry(detail.spend_unit.clone())
                .or_default()
                .push(ReportStepDetail {
                    peer_id: detail.peer_id.clone(),
                    spend_value: detail.spend_value.clone(),
                });

            match detail.spend_value.trim().parse::<f64>() {
                Ok(value) if value.is_finite() => {
                    values.entry(detail.spend_unit.clone()).or_default().push(value)
                }
                _ => tracing::warn!(
                    execution_id = %self.labels.execution_id,
                    step_ref,
                    peer_id = %detail.peer_id,
                    spend_value = %detail.spend_value,
                    "Skipping unparsable spend value"
                ),
            }
        }

        let mut settled = 0.0;
        for (unit, mut unit_values) in values {
            let value = median(&mut unit_values);
            let conversion = state.balance.convert_to_balance(&unit, value);
            if !conversion.rate_found {
                state.switch_to_metering_mode(
                    &self.labels,
                    format!("spend unit {} has no billing rate", unit),
                );
            }
            settled += conversion.value;
        }

        if !state.mode.is_metering() {
            let refund = deduction - settled;
            if refund < 0.0 {
                tracing::error!(
                    execution_id = %self.labels.execution_id,
                    step_ref,
                    deduction,
                    settled,
                    "Settled spend exceeds deduction"
                );
            } else if let Err(e) = state.balance.add(refund) {
                tracing::error!(
                    execution_id = %self.labels.execution_id,
                    step_ref,
                    error = %e,
                    "Failed to refund unspent deduction"
                );
            }
        }

        if let Some(step) = state.steps.get_mut(step_ref) {
            step.spends = Some(spends);
        }

        Ok(())
    }

    /// Wire form of every step plus the metering flag.
    pub fn format_report(&self) -> MeteringReport {
        let state = self.state.lock();

        let steps = state
            .steps
            .iter()
            .map(|(step_ref, step)| {
                let peer_to_peer = step
                    .spends
                    .iter()
                    .flatten()
                    .flat_map(|(unit, details)| {
                        details.iter().map(move |d| MeteringNodeDetail {
                            peer_id: d.peer_id.clone(),
                            spend_unit: unit.clone(),
                            spend_value: d.spend_value.clone(),
                        })
                    })
                    .collect();
                (step_ref.clone(), MeteringReportStep { peer_to_peer })
            })
            .collect();

        let (metering, message) = match &state.mode {
            MeteringMode::Normal => (false, String::new()),
            MeteringMode::Metering { cause } => (true, cause.clone()),
        };

        MeteringReport {
            steps,
            metering,
            message,
        }
    }

    /// Submit the receipt to billing.
    pub async fn send_receipt(&self) -> Result<(), MeteringError> {
        if !self.is_ready() {
            return Err(MeteringError::NoReserve);
        }
        let client = self.client.as_ref().ok_or(MeteringError::NoBillingClient)?;

        let response = client
            .submit_workflow_receipt(SubmitWorkflowReceiptRequest {
                workflow_owner: self.labels.owner.clone(),
                workflow_id: self.labels.workflow_id.clone(),
                workflow_execution_id: self.labels.execution_id.clone(),
                metering: self.format_report(),
            })
            .await
            .map_err(|e| MeteringError::Billing(e.to_string()))?;

        if !response.success {
            return Err(MeteringError::Billing("receipt not confirmed".to_string()));
        }
        Ok(())
    }

    /// Publish the receipt to telemetry.
    pub async fn emit_receipt(&self) -> Result<(), MeteringError> {
        if !self.is_ready() {
            return Err(MeteringError::NoReserve);
        }
        let report = self.format_report();
        self.emitter
            .emit_metering_report(&self.labels.execution_id, &report)
            .await
            .map_err(|e| MeteringError::Emit(e.to_string()))
    }
}

impl std::fmt::Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Report")
            .field("labels", &self.labels)
            .field("has_client", &self.client.is_some())
            .finish()
    }
}
