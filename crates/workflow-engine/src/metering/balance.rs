//! Credit ledger with resource to credit conversion.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::MeteringError;

/// Outcome of converting between resource units and credits.
///
/// A resource without a configured rate converts 1:1 and is flagged with
/// `rate_found == false` so callers can decide whether that matters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conversion {
    pub value: f64,
    pub rate_found: bool,
}

impl Conversion {
    /// Treat a missing rate as an error.
    pub fn require_rate(self, resource: &str) -> Result<f64, MeteringError> {
        if self.rate_found {
            Ok(self.value)
        } else {
            Err(MeteringError::RateNotFound(resource.to_string()))
        }
    }
}

#[derive(Debug)]
struct Ledger {
    balance: f64,
    rates: HashMap<String, f64>,
}

impl Ledger {
    fn to_balance(&self, resource: &str, amount: f64) -> Conversion {
        match self.rates.get(resource) {
            Some(rate) => Conversion {
                value: amount * rate,
                rate_found: true,
            },
            None => Conversion {
                value: amount,
                rate_found: false,
            },
        }
    }

    fn from_balance(&self, resource: &str, credits: f64) -> Conversion {
        match self.rates.get(resource) {
            Some(rate) if *rate != 0.0 => Conversion {
                value: credits / rate,
                rate_found: true,
            },
            // A zero rate means the resource is free; any amount of it fits.
            Some(_) => Conversion {
                value: f64::INFINITY,
                rate_found: true,
            },
            None => Conversion {
                value: credits,
                rate_found: false,
            },
        }
    }

    fn add(&mut self, amount: f64) -> Result<(), MeteringError> {
        validate_amount(amount)?;
        self.balance += amount;
        Ok(())
    }

    fn minus(&mut self, amount: f64) -> Result<(), MeteringError> {
        validate_amount(amount)?;
        if amount > self.balance {
            return Err(MeteringError::InsufficientBalance {
                requested: amount,
                available: self.balance,
            });
        }
        self.balance -= amount;
        Ok(())
    }
}

fn validate_amount(amount: f64) -> Result<(), MeteringError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(MeteringError::InvalidAmount(amount));
    }
    Ok(())
}

/// Mutex-guarded credit balance for a single execution.
///
/// The balance never drops below zero: debits that exceed it are rejected
/// and leave it unchanged.
#[derive(Debug)]
pub struct BalanceStore {
    inner: RwLock<Ledger>,
}

impl BalanceStore {
    /// Create a store holding `balance` credits priced by `rates`
    /// (credits per resource unit).
    pub fn new(balance: f64, rates: HashMap<String, f64>) -> Result<Self, MeteringError> {
        validate_amount(balance)?;
        if let Some((resource, _)) = rates.iter().find(|(_, rate)| !(**rate >= 0.0)) {
            return Err(MeteringError::InvalidRate(resource.clone()));
        }

        Ok(Self {
            inner: RwLock::new(Ledger { balance, rates }),
        })
    }

    /// Empty store with no rates.
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(Ledger {
                balance: 0.0,
                rates: HashMap::new(),
            }),
        }
    }

    /// Convert a resource amount to credits.
    pub fn convert_to_balance(&self, resource: &str, amount: f64) -> Conversion {
        self.inner.read().to_balance(resource, amount)
    }

    /// Convert credits to resource units.
    pub fn convert_from_balance(&self, resource: &str, credits: f64) -> Conversion {
        self.inner.read().from_balance(resource, credits)
    }

    /// Whether a rate is configured for `resource`.
    pub fn has_rate(&self, resource: &str) -> bool {
        self.inner.read().rates.contains_key(resource)
    }

    /// Current balance in credits.
    pub fn get(&self) -> f64 {
        self.inner.read().balance
    }

    /// Current balance expressed in `resource` units.
    pub fn get_as(&self, resource: &str) -> Conversion {
        let ledger = self.inner.read();
        ledger.from_balance(resource, ledger.balance)
    }

    /// Increase the balance by `amount` credits.
    pub fn add(&self, amount: f64) -> Result<(), MeteringError> {
        self.inner.write().add(amount)
    }

    /// Increase the balance by `amount` units of `resource`.
    pub fn add_as(&self, resource: &str, amount: f64) -> Result<(), MeteringError> {
        let mut ledger = self.inner.write();
        let credits = ledger.to_balance(resource, amount).value;
        ledger.add(credits)
    }

    /// Decrease the balance by `amount` credits.
    pub fn minus(&self, amount: f64) -> Result<(), MeteringError> {
        self.inner.write().minus(amount)
    }

    /// Decrease the balance by `amount` units of `resource`.
    pub fn minus_as(&self, resource: &str, amount: f64) -> Result<(), MeteringError> {
        let mut ledger = self.inner.write();
        let credits = ledger.to_balance(resource, amount).value;
        ledger.minus(credits)
    }
}
