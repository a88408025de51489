//! Engine error types.

use std::fmt;

use thiserror::Error;

/// Returned when a caller's cancellation fires before a permit was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled before a permit was acquired")]
pub struct Cancelled;

/// Scope that denied a resource request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// Limit applied to a single workflow owner.
    Owner,
    /// Limit applied across every workflow on the node.
    Global,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitScope::Owner => write!(f, "owner"),
            LimitScope::Global => write!(f, "global"),
        }
    }
}

/// A limiter refused to hand out capacity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("resource limited: {scope} limit of {limit} reached")]
pub struct ResourceLimited {
    /// Which scope ran out.
    pub scope: LimitScope,
    /// The configured ceiling for that scope.
    pub limit: usize,
}

/// Errors raised by the metering ledger.
#[derive(Debug, Clone, Error)]
pub enum MeteringError {
    /// Billing denied the reservation for this execution.
    #[error("insufficient funding")]
    InsufficientFunding,

    /// A debit would take the balance below zero.
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: f64, available: f64 },

    /// Negative or non-finite amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(f64),

    /// A rate card entry is negative.
    #[error("invalid rate for resource {0}: rates must be non-negative")]
    InvalidRate(String),

    /// No configured rate for the resource.
    #[error("rate not found for resource {0}")]
    RateNotFound(String),

    /// Deduct or receipt attempted before a reservation.
    #[error("report has no reservation")]
    NoReserve,

    /// Settle attempted on a step that was never deducted.
    #[error("no deduction recorded for step {0}")]
    NoDeduct(String),

    /// Deduct attempted twice on the same step.
    #[error("deduction already recorded for step {0}")]
    StepDeductExists(String),

    /// Settle attempted twice on the same step.
    #[error("spend already settled for step {0}")]
    StepSpendExists(String),

    /// Derived availability requested with zero open call slots.
    #[error("no open concurrent call slots")]
    NoOpenCalls,

    /// Receipt submission requested without a billing client.
    #[error("no billing client configured")]
    NoBillingClient,

    /// Billing RPC failed or did not confirm.
    #[error("billing error: {0}")]
    Billing(String),

    /// The metering report could not be published to telemetry.
    #[error("failed to emit metering report: {0}")]
    Emit(String),

    /// A report for the execution is already live.
    #[error("report already exists for execution {0}")]
    ReportExists(String),

    /// No live report for the execution.
    #[error("report not found for execution {0}")]
    ReportNotFound(String),

    /// Several failures collected while ending a report.
    #[error("{}", join_errors(.0))]
    Joined(Vec<MeteringError>),
}

fn join_errors(errors: &[MeteringError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by the secrets fetcher for a whole batch.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// Cancelled while waiting for a fetch slot.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    /// The vault capability could not be resolved.
    #[error("vault capability {id} unavailable: {reason}")]
    CapabilityNotFound { id: String, reason: String },

    /// Node identity or encryption keys could not be resolved.
    #[error("failed to resolve encryption keys: {0}")]
    EncryptionKeys(String),

    /// The vault call itself failed.
    #[error("vault call failed: {0}")]
    VaultCall(String),

    /// The vault answered with a payload we could not read.
    #[error("invalid vault response: {0}")]
    InvalidResponse(String),
}

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration rejected at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The global or per-owner workflow limit was reached.
    #[error(transparent)]
    ResourceLimited(#[from] ResourceLimited),

    /// The module asked for more subscriptions than allowed.
    #[error("too many trigger subscriptions: {count} exceeds limit of {max}")]
    TooManySubscriptions { count: usize, max: usize },

    /// A capability could not be resolved from the registry.
    #[error("capability {id} not found: {reason}")]
    CapabilityNotFound { id: String, reason: String },

    /// A trigger registration failed.
    #[error("failed to register trigger {id}: {reason}")]
    Registration { id: String, reason: String },

    /// A call into the compute module failed.
    #[error("module error: {0}")]
    Module(String),

    /// A bounded operation ran past its deadline.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    /// Engine lifecycle misuse.
    #[error("invalid engine state: {0}")]
    InvalidState(String),

    /// Cancelled while waiting on a permit.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
