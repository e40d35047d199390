// Reconciles supplier-reported booking state (pushed callbacks and pulled refreshes)
// back into local bookings

use crate::booking::{
    Booking, BookingDetails, BookingStateMachine, BookingStatus, PaymentStatus, ReferenceCode,
    StatusEvent, Transition, TransitionError,
};
use crate::locks::{KeyedLock, LockError};
use crate::notifications::{StatusChangeEvent, StatusChangeNotifier};
use crate::repository::{BookingChange, BookingRepository, RepositoryError, StatusHistoryEntry};
use crate::settlement::{PaymentSettlementCoordinator, SettlementError};
use crate::supplier::{ProviderError, ProviderRouter, Supplier};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("{supplier} does not send asynchronous responses; accepted suppliers: {allowed}")]
    UnsupportedSupplier { supplier: Supplier, allowed: String },

    #[error("Could not decode supplier response: {0}")]
    Unparseable(#[from] ProviderError),

    #[error("No booking with reference code {0}")]
    UnknownBooking(ReferenceCode),

    #[error("Booking {reference_code} was made with {expected}, not {actual}")]
    SupplierMismatch {
        reference_code: ReferenceCode,
        expected: Supplier,
        actual: Supplier,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Storage error: {0}")]
    Storage(#[from] RepositoryError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// The reported status was applied but the authorized funds are still held.
    #[error("Status applied but funds were not voided: {0}")]
    Settlement(#[from] SettlementError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// The reported state already held (e.g. a redelivered callback).
    Unchanged(Booking),
    Applied {
        booking: Booking,
        from: BookingStatus,
        to: BookingStatus,
    },
}

impl Reconciliation {
    pub fn booking(&self) -> &Booking {
        match self {
            Reconciliation::Unchanged(booking) => booking,
            Reconciliation::Applied { booking, .. } => booking,
        }
    }

    pub fn into_booking(self) -> Booking {
        match self {
            Reconciliation::Unchanged(booking) => booking,
            Reconciliation::Applied { booking, .. } => booking,
        }
    }
}

pub struct SupplierResponseProcessor {
    router: Arc<ProviderRouter>,
    bookings: Arc<dyn BookingRepository>,
    locks: Arc<dyn KeyedLock>,
    notifier: Arc<dyn StatusChangeNotifier>,
    settlement: Arc<PaymentSettlementCoordinator>,
    async_suppliers: Vec<Supplier>,
}

impl SupplierResponseProcessor {
    pub fn new(
        router: Arc<ProviderRouter>,
        bookings: Arc<dyn BookingRepository>,
        locks: Arc<dyn KeyedLock>,
        notifier: Arc<dyn StatusChangeNotifier>,
        settlement: Arc<PaymentSettlementCoordinator>,
        async_suppliers: Vec<Supplier>,
    ) -> Self {
        Self {
            router,
            bookings,
            locks,
            notifier,
            settlement,
            async_suppliers,
        }
    }

    pub fn accepts(&self, supplier: Supplier) -> bool {
        self.async_suppliers.contains(&supplier)
    }

    pub async fn process_async_response(
        &self,
        payload: Bytes,
        supplier: Supplier,
        now: DateTime<Utc>,
    ) -> Result<Reconciliation, ReconciliationError> {
        if !self.accepts(supplier) {
            let allowed = self
                .async_suppliers
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ReconciliationError::UnsupportedSupplier { supplier, allowed });
        }

        // Decode outside the booking lock
        let details = self
            .router
            .process_async_response(supplier, payload)
            .await
            .map_err(|e| {
                warn!(%supplier, problem = %e.problem, "Rejected asynchronous supplier response");
                ReconciliationError::Unparseable(e)
            })?;

        let actor = format!("supplier:{}", supplier);
        self.reconcile(supplier, details, &actor, now).await
    }

    /// Moves a booking to the status its supplier reports, through the state machine.
    pub async fn reconcile(
        &self,
        supplier: Supplier,
        details: BookingDetails,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Reconciliation, ReconciliationError> {
        let reference_code = details.reference_code().clone();
        let reported = BookingStatus::from(details.status());

        let lease = self.locks.acquire(reference_code.as_str()).await?;
        let mut booking = self
            .bookings
            .get_by_reference(&reference_code)
            .await?
            .ok_or_else(|| {
                warn!(%reference_code, %supplier, "Supplier reported an unknown booking");
                ReconciliationError::UnknownBooking(reference_code.clone())
            })?;

        if booking.supplier != supplier {
            return Err(ReconciliationError::SupplierMismatch {
                reference_code,
                expected: booking.supplier,
                actual: supplier,
            });
        }

        let (from, to) =
            match BookingStateMachine::apply_status(&mut booking, StatusEvent::SupplierReported(reported), now)? {
                Transition::Status { from, to } => (from, to),
                _ => {
                    warn!(%reference_code, status = %reported, "Supplier state already applied");
                    drop(lease);
                    // A redelivery retries a void that failed the first time
                    let booking = self.void_stranded_hold(booking, actor, now).await?;
                    return Ok(Reconciliation::Unchanged(booking));
                }
            };

        let booking_id = booking.id;
        booking.booking_details = Some(details);
        let change = BookingChange::new(booking).with_status_change(StatusHistoryEntry {
            booking_id,
            reference_code: reference_code.clone(),
            from,
            to,
            actor: actor.to_string(),
            timestamp: now,
        });
        let booking = self.bookings.commit(change).await?;
        drop(lease);

        info!(%reference_code, %supplier, %from, %to, "Reconciled supplier booking state");

        self.notifier
            .notify(StatusChangeEvent {
                booking_id: booking.id,
                reference_code: reference_code.clone(),
                old_status: from,
                new_status: to,
                timestamp: now,
            })
            .await;

        let booking = self.void_stranded_hold(booking, actor, now).await?;
        Ok(Reconciliation::Applied { booking, from, to })
    }

    // Terminal bookings must not keep an authorization open
    async fn void_stranded_hold(
        &self,
        booking: Booking,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Booking, ReconciliationError> {
        if !booking.status().is_terminal() || booking.payment_status() != PaymentStatus::Authorized {
            return Ok(booking);
        }
        self.settlement
            .void_if_needed(&booking.reference_code, actor, now)
            .await
            .map_err(|e| {
                error!(
                    reference_code = %booking.reference_code,
                    error = %e,
                    "Could not void funds after supplier update"
                );
                ReconciliationError::Settlement(e)
            })
    }
}
