// Umbrella error for the booking engine facade

use crate::booking::{InvalidBooking, ReferenceCode, TransitionError};
use crate::locks::LockError;
use crate::markup::PricingError;
use crate::repository::RepositoryError;
use crate::settlement::{PaymentError, SettlementError};
use crate::supplier::ProviderError;
use crate::supplier_response::ReconciliationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    InvalidBooking(#[from] InvalidBooking),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Pricing(#[from] PricingError),

    #[error("Storage error: {0}")]
    Storage(#[from] RepositoryError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Booking {0} not found")]
    NotFound(String),

    /// The supplier holds the booking but it could not be stored locally.
    #[error("Supplier booked {reference_code} but it was not stored: {source}")]
    Unrecorded {
        reference_code: ReferenceCode,
        source: RepositoryError,
    },
}

impl From<PaymentError> for EngineError {
    fn from(e: PaymentError) -> Self {
        EngineError::Settlement(SettlementError::Payment(e))
    }
}

impl EngineError {
    /// The remote effect is unknown; reconcile before acting again.
    pub fn is_ambiguous(&self) -> bool {
        match self {
            EngineError::Provider(e) => e.is_ambiguous(),
            EngineError::Settlement(e) => e.is_ambiguous(),
            EngineError::Reconciliation(ReconciliationError::Settlement(e)) => e.is_ambiguous(),
            EngineError::Unrecorded { .. } => true,
            _ => false,
        }
    }

    /// A concurrent writer got there first.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::Storage(RepositoryError::Conflict { .. })
                | EngineError::Transition(TransitionError::Concurrency { .. })
                | EngineError::Settlement(SettlementError::Storage(RepositoryError::Conflict { .. }))
        )
    }
}
