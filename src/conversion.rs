// Currency conversion capability used by the pricing pipeline and payment audit

use crate::money::Currency;
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("No exchange rate from {source_currency} to {target}")]
    MissingRate {
        source_currency: Currency,
        target: Currency,
    },

    #[error("Conversion service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CurrencyConverter: Send + Sync + 'static {
    async fn convert(
        &self,
        source: Currency,
        target: Currency,
        amount: Decimal,
    ) -> Result<Decimal, ConversionError>;
}

/// Converts through USD using a table of "units of currency per 1 USD".
/// No rounding is applied; callers round once at the end of their calculation.
pub struct RateTableConverter {
    per_usd: DashMap<Currency, Decimal>,
}

impl RateTableConverter {
    pub fn new() -> Self {
        let per_usd = DashMap::new();
        per_usd.insert(Currency::Usd, Decimal::ONE);
        Self { per_usd }
    }

    pub fn with_rates(rates: impl IntoIterator<Item = (Currency, Decimal)>) -> Self {
        let converter = Self::new();
        for (currency, rate) in rates {
            converter.set_rate(currency, rate);
        }
        converter
    }

    pub fn set_rate(&self, currency: Currency, units_per_usd: Decimal) {
        self.per_usd.insert(currency, units_per_usd);
    }

    fn rate(&self, currency: Currency) -> Option<Decimal> {
        self.per_usd
            .get(&currency)
            .map(|r| *r.value())
            .filter(|r| !r.is_zero())
    }
}

impl Default for RateTableConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CurrencyConverter for RateTableConverter {
    async fn convert(
        &self,
        source: Currency,
        target: Currency,
        amount: Decimal,
    ) -> Result<Decimal, ConversionError> {
        if source == target {
            return Ok(amount);
        }

        let missing = || ConversionError::MissingRate {
            source_currency: source,
            target,
        };
        let source_rate = self.rate(source).ok_or_else(missing)?;
        let target_rate = self.rate(target).ok_or_else(missing)?;

        Ok(amount / source_rate * target_rate)
    }
}
