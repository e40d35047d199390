// Engine configuration

use crate::money::Currency;
use crate::supplier::Supplier;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Currency every supplier price is normalized to for audit.
    pub reference_currency: Currency,
    pub supplier_timeout_ms: u64,
    pub payment_timeout_ms: u64,
    pub retry: RetryConfig,
    /// Upper bound on bookings settled concurrently within one capture batch.
    pub capture_concurrency: usize,
    /// Suppliers allowed to push asynchronous booking updates.
    pub async_suppliers: Vec<Supplier>,
    pub reference_code_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reference_currency: Currency::Usd,
            supplier_timeout_ms: 30_000,
            payment_timeout_ms: 15_000,
            retry: RetryConfig::default(),
            capture_concurrency: 8,
            async_suppliers: vec![Supplier::Netstorming],
            reference_code_prefix: "HTL".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn supplier_timeout(&self) -> Duration {
        Duration::from_millis(self.supplier_timeout_ms)
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_millis(self.payment_timeout_ms)
    }
}

// Retry policy for transient supplier failures on retry-safe operations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    // Exponential backoff with jitter
    pub fn backoff(&self, retry_attempt: u32) -> Duration {
        let base_backoff_ms = (self.initial_backoff_ms as f64
            * self.backoff_multiplier.powf(retry_attempt as f64))
        .min(self.max_backoff_ms as f64);

        // Jitter keeps retries from many callers from lining up
        let jitter = rand::random::<f64>() * self.jitter_factor * base_backoff_ms;
        let backoff_ms = base_backoff_ms * (1.0 - self.jitter_factor / 2.0) + jitter;

        Duration::from_millis(backoff_ms as u64)
    }
}
