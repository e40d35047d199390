// Markup pricing pipeline: supplier price -> audited reference price -> marked-up agent price

use crate::booking::{AgencyId, AgentId, CounterpartyId};
use crate::conversion::{ConversionError, CurrencyConverter};
use crate::money::{Currency, Money};
use crate::repository::{MarkupPolicyRepository, RepositoryError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PricingError {
    #[error("Currency conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Could not load markup policies: {0}")]
    PolicySource(#[from] RepositoryError),

    #[error("Supplier price must be positive, got {0}")]
    InvalidSupplierPrice(Money),

    #[error("Markups produced a non-positive price {0}")]
    NonPositiveResult(Money),
}

/// Who is asking for the price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContext {
    pub agent_id: AgentId,
    pub agency_id: AgencyId,
    pub counterparty_id: CounterpartyId,
    /// Currency the agency is quoted and charged in.
    pub currency: Currency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "camelCase")]
pub enum MarkupScope {
    Global,
    Counterparty(CounterpartyId),
    Agency(AgencyId),
    Agent(AgentId),
}

impl MarkupScope {
    /// Broadest tier first; narrower tiers apply later.
    pub fn tier(&self) -> u8 {
        match self {
            MarkupScope::Global => 0,
            MarkupScope::Counterparty(_) => 1,
            MarkupScope::Agency(_) => 2,
            MarkupScope::Agent(_) => 3,
        }
    }

    pub fn applies_to(&self, agent: &AgentContext) -> bool {
        match self {
            MarkupScope::Global => true,
            MarkupScope::Counterparty(id) => *id == agent.counterparty_id,
            MarkupScope::Agency(id) => *id == agent.agency_id,
            MarkupScope::Agent(id) => *id == agent.agent_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MarkupFunction {
    /// `5` means +5%.
    Percent { value: Decimal },
    Fixed { amount: Money },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkupPolicy {
    pub id: u64,
    pub scope: MarkupScope,
    pub function: MarkupFunction,
    /// Order within a tier, ascending.
    pub priority: i32,
    #[serde(default)]
    pub description: String,
}

/// Audit record of one policy application. Amounts are unrounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedMarkup {
    pub policy_id: u64,
    pub scope: MarkupScope,
    pub function: MarkupFunction,
    pub delta: Money,
    pub price_after: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedQuote {
    pub supplier_price: Money,
    pub supplier_price_in_reference: Money,
    pub final_price: Money,
    pub applied_markups: Vec<AppliedMarkup>,
}

pub struct MarkupPricingPipeline {
    policies: Arc<dyn MarkupPolicyRepository>,
    converter: Arc<dyn CurrencyConverter>,
    reference_currency: Currency,
}

impl MarkupPricingPipeline {
    pub fn new(
        policies: Arc<dyn MarkupPolicyRepository>,
        converter: Arc<dyn CurrencyConverter>,
        reference_currency: Currency,
    ) -> Self {
        Self {
            policies,
            converter,
            reference_currency,
        }
    }

    /// Applicable policies for an agent, broadest tier first, then by priority.
    pub async fn resolve_policies(
        &self,
        agent: &AgentContext,
    ) -> Result<Vec<MarkupPolicy>, PricingError> {
        let mut policies: Vec<MarkupPolicy> = self
            .policies
            .policies_for(agent)
            .await?
            .into_iter()
            .filter(|p| p.scope.applies_to(agent))
            .collect();
        policies.sort_by_key(|p| (p.scope.tier(), p.priority, p.id));
        Ok(policies)
    }

    pub async fn quote(
        &self,
        supplier_price: Money,
        agent: &AgentContext,
    ) -> Result<PricedQuote, PricingError> {
        if !supplier_price.is_positive() {
            return Err(PricingError::InvalidSupplierPrice(supplier_price));
        }

        let policies = self.resolve_policies(agent).await?;

        // Reference-currency figure first: nothing is marked up on an unconverted price
        let in_reference = self
            .converter
            .convert(
                supplier_price.currency,
                self.reference_currency,
                supplier_price.amount,
            )
            .await?;
        let supplier_price_in_reference =
            Money::new(in_reference, self.reference_currency).rounded();

        let target = agent.currency;
        let mut price = self
            .converter
            .convert(supplier_price.currency, target, supplier_price.amount)
            .await?;

        let mut applied_markups = Vec::with_capacity(policies.len());
        for policy in policies {
            let delta = match policy.function {
                MarkupFunction::Percent { value } => price * value / Decimal::ONE_HUNDRED,
                MarkupFunction::Fixed { amount } => {
                    self.converter
                        .convert(amount.currency, target, amount.amount)
                        .await?
                }
            };
            price += delta;

            debug!(
                policy_id = policy.id,
                tier = policy.scope.tier(),
                %delta,
                %price,
                "Applied markup"
            );

            applied_markups.push(AppliedMarkup {
                policy_id: policy.id,
                scope: policy.scope,
                function: policy.function,
                delta: Money::new(delta, target),
                price_after: Money::new(price, target),
            });
        }

        // Single rounding step at the very end
        let final_price = Money::new(price, target).rounded();
        if !final_price.is_positive() {
            return Err(PricingError::NonPositiveResult(final_price));
        }

        Ok(PricedQuote {
            supplier_price,
            supplier_price_in_reference,
            final_price,
            applied_markups,
        })
    }
}
