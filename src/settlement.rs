// Payment settlement: authorize, capture, void and refund against the gateways,
// always guarded by the booking state machine and serialized per reference code

use crate::booking::{
    Booking, BookingId, BookingStateMachine, PaymentHold, PaymentStatus, PaymentType,
    ReferenceCode, TransitionError,
};
use crate::config::EngineConfig;
use crate::conversion::CurrencyConverter;
use crate::locks::{KeyedLock, LockError};
use crate::money::{Currency, Money};
use crate::repository::{
    AuditOutcome, BookingChange, BookingRepository, PaymentAuditLogEntry, PaymentEvent,
    RepositoryError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PaymentError {
    #[error("Payment declined: {0}")]
    Declined(String),

    /// The gateway may or may not have acted; reconcile before retrying.
    #[error("Payment outcome unknown: {0}")]
    Ambiguous(String),

    #[error("No payment gateway configured for {0:?}")]
    NoGateway(PaymentType),
}

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Storage error: {0}")]
    Storage(#[from] RepositoryError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Booking {0} not found")]
    NotFound(String),

    #[error("Booking {0} has no payment hold")]
    MissingHold(ReferenceCode),
}

impl SettlementError {
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, SettlementError::Payment(PaymentError::Ambiguous(_)))
    }
}

/// Tokenized instrument handed to the gateway; only the masked form is ever stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInstrument {
    pub token: String,
    pub masked: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayReceipt {
    pub transaction_id: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync + 'static {
    async fn authorize(
        &self,
        reference_code: &ReferenceCode,
        amount: Money,
        instrument: &PaymentInstrument,
    ) -> Result<PaymentHold, PaymentError>;

    async fn capture(&self, hold: &PaymentHold) -> Result<GatewayReceipt, PaymentError>;

    async fn void(&self, hold: &PaymentHold) -> Result<GatewayReceipt, PaymentError>;

    async fn refund(&self, hold: &PaymentHold) -> Result<GatewayReceipt, PaymentError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureFailure {
    pub booking_id: BookingId,
    pub reason: String,
    pub ambiguous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedCapture {
    pub booking_id: BookingId,
    pub reason: String,
}

/// Per-booking outcome of a batch capture.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureReport {
    pub succeeded: Vec<BookingId>,
    pub failed: Vec<CaptureFailure>,
    pub skipped: Vec<SkippedCapture>,
}

impl CaptureReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }
}

enum CaptureOutcome {
    Succeeded(BookingId),
    Failed(CaptureFailure),
    Skipped(SkippedCapture),
}

pub struct PaymentSettlementCoordinator {
    bookings: Arc<dyn BookingRepository>,
    locks: Arc<dyn KeyedLock>,
    converter: Arc<dyn CurrencyConverter>,
    gateways: HashMap<PaymentType, Arc<dyn PaymentGateway>>,
    reference_currency: Currency,
    payment_timeout: Duration,
    capture_concurrency: usize,
}

impl PaymentSettlementCoordinator {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        locks: Arc<dyn KeyedLock>,
        converter: Arc<dyn CurrencyConverter>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            bookings,
            locks,
            converter,
            gateways: HashMap::new(),
            reference_currency: config.reference_currency,
            payment_timeout: config.payment_timeout(),
            capture_concurrency: config.capture_concurrency.max(1),
        }
    }

    /// Offline payments have no gateway and are never registered.
    pub fn with_gateway(mut self, payment_type: PaymentType, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.insert(payment_type, gateway);
        self
    }

    fn gateway(&self, payment_type: PaymentType) -> Result<&Arc<dyn PaymentGateway>, PaymentError> {
        self.gateways
            .get(&payment_type)
            .ok_or(PaymentError::NoGateway(payment_type))
    }

    async fn with_timeout<T, F>(&self, call: F) -> Result<T, PaymentError>
    where
        F: Future<Output = Result<T, PaymentError>>,
    {
        match tokio::time::timeout(self.payment_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PaymentError::Ambiguous(format!(
                "gateway did not answer within {:?}",
                self.payment_timeout
            ))),
        }
    }

    async fn in_reference(&self, amount: Money) -> Option<Money> {
        match self
            .converter
            .convert(amount.currency, self.reference_currency, amount.amount)
            .await
        {
            Ok(converted) => Some(Money::new(converted, self.reference_currency).rounded()),
            Err(e) => {
                warn!(error = %e, "Audit amount left unconverted");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit_entry(
        &self,
        reference_code: &ReferenceCode,
        event: PaymentEvent,
        outcome: AuditOutcome,
        amount: Money,
        masked_instrument: &str,
        gateway_reference: Option<String>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> PaymentAuditLogEntry {
        PaymentAuditLogEntry {
            reference_code: reference_code.clone(),
            event,
            outcome,
            amount,
            amount_in_reference: self.in_reference(amount).await,
            masked_instrument: masked_instrument.to_string(),
            gateway_reference,
            acting_user: actor.to_string(),
            timestamp: now,
        }
    }

    // Failed attempts are logged on their own; the booking itself is untouched
    #[allow(clippy::too_many_arguments)]
    async fn record_failure(
        &self,
        reference_code: &ReferenceCode,
        event: PaymentEvent,
        err: &PaymentError,
        amount: Money,
        masked_instrument: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        let outcome = match err {
            PaymentError::Ambiguous(reason) => AuditOutcome::Unknown(reason.clone()),
            other => AuditOutcome::Declined(other.to_string()),
        };
        let entry = self
            .audit_entry(reference_code, event, outcome, amount, masked_instrument, None, actor, now)
            .await;
        self.bookings.append_payment_entry(entry).await?;
        Ok(())
    }

    async fn load(&self, reference_code: &ReferenceCode) -> Result<Booking, SettlementError> {
        self.bookings
            .get_by_reference(reference_code)
            .await?
            .ok_or_else(|| SettlementError::NotFound(reference_code.to_string()))
    }

    /// Places a hold before the booking exists (card payments pre-authorize
    /// ahead of the supplier call). Never retried.
    pub async fn pre_authorize(
        &self,
        reference_code: &ReferenceCode,
        payment_type: PaymentType,
        amount: Money,
        instrument: &PaymentInstrument,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentHold, SettlementError> {
        let gateway = self.gateway(payment_type)?;
        let result = self
            .with_timeout(gateway.authorize(reference_code, amount, instrument))
            .await;

        match result {
            Ok(hold) => {
                let entry = self
                    .audit_entry(
                        reference_code,
                        PaymentEvent::Authorize,
                        AuditOutcome::Succeeded,
                        amount,
                        &hold.masked_instrument,
                        Some(hold.authorization_id.clone()),
                        actor,
                        now,
                    )
                    .await;
                self.bookings.append_payment_entry(entry).await?;
                info!(%reference_code, authorization_id = %hold.authorization_id, "Funds pre-authorized");
                Ok(hold)
            }
            Err(e) => {
                warn!(%reference_code, error = %e, "Pre-authorization failed");
                self.record_failure(reference_code, PaymentEvent::Authorize, &e, amount, &instrument.masked, actor, now)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Releases a pre-authorized hold that never got a booking row.
    pub async fn release_hold(
        &self,
        reference_code: &ReferenceCode,
        payment_type: PaymentType,
        hold: &PaymentHold,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        let gateway = self.gateway(payment_type)?;
        match self.with_timeout(gateway.void(hold)).await {
            Ok(receipt) => {
                let entry = self
                    .audit_entry(
                        reference_code,
                        PaymentEvent::Void,
                        AuditOutcome::Succeeded,
                        hold.amount,
                        &hold.masked_instrument,
                        Some(receipt.transaction_id),
                        actor,
                        now,
                    )
                    .await;
                self.bookings.append_payment_entry(entry).await?;
                info!(%reference_code, "Released unused hold");
                Ok(())
            }
            Err(e) => {
                error!(%reference_code, error = %e, "Could not release unused hold");
                self.record_failure(reference_code, PaymentEvent::Void, &e, hold.amount, &hold.masked_instrument, actor, now)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Authorizes an existing booking (virtual accounts authorize after
    /// supplier confirmation). A booking already holding funds is returned as is.
    pub async fn authorize(
        &self,
        reference_code: &ReferenceCode,
        instrument: &PaymentInstrument,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Booking, SettlementError> {
        let _lease = self.locks.acquire(reference_code.as_str()).await?;
        let mut booking = self.load(reference_code).await?;

        if booking.payment_status() == PaymentStatus::Authorized {
            return Ok(booking);
        }
        BookingStateMachine::check_payment(&booking, PaymentStatus::Authorized, now)?;

        let gateway = self.gateway(booking.payment_type)?;
        let amount = booking.total_price;
        let hold = match self
            .with_timeout(gateway.authorize(reference_code, amount, instrument))
            .await
        {
            Ok(hold) => hold,
            Err(e) => {
                warn!(%reference_code, error = %e, "Authorization failed");
                self.record_failure(reference_code, PaymentEvent::Authorize, &e, amount, &instrument.masked, actor, now)
                    .await?;
                return Err(e.into());
            }
        };

        let entry = self
            .audit_entry(
                reference_code,
                PaymentEvent::Authorize,
                AuditOutcome::Succeeded,
                amount,
                &hold.masked_instrument,
                Some(hold.authorization_id.clone()),
                actor,
                now,
            )
            .await;
        BookingStateMachine::apply_authorization(&mut booking, hold, now)?;
        let booking = self
            .bookings
            .commit(BookingChange::new(booking).with_payment_entry(entry))
            .await?;

        info!(%reference_code, booking_id = %booking.id, "Funds authorized");
        Ok(booking)
    }

    /// Captures every id independently, at most `capture_concurrency` at a time.
    pub async fn capture(&self, booking_ids: &[BookingId], actor: &str, now: DateTime<Utc>) -> CaptureReport {
        let outcomes: Vec<CaptureOutcome> = stream::iter(booking_ids.iter().copied())
            .map(|id| self.capture_one(id, actor, now))
            .buffer_unordered(self.capture_concurrency)
            .collect()
            .await;

        let mut report = CaptureReport::default();
        for outcome in outcomes {
            match outcome {
                CaptureOutcome::Succeeded(id) => report.succeeded.push(id),
                CaptureOutcome::Failed(failure) => report.failed.push(failure),
                CaptureOutcome::Skipped(skip) => report.skipped.push(skip),
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Capture batch finished"
        );
        report
    }

    async fn capture_one(&self, booking_id: BookingId, actor: &str, now: DateTime<Utc>) -> CaptureOutcome {
        let failed = |reason: String, ambiguous: bool| {
            warn!(%booking_id, %reason, "Capture failed");
            CaptureOutcome::Failed(CaptureFailure {
                booking_id,
                reason,
                ambiguous,
            })
        };
        let skipped = |reason: String| {
            warn!(%booking_id, %reason, "Capture skipped");
            CaptureOutcome::Skipped(SkippedCapture { booking_id, reason })
        };

        let reference_code = match self.bookings.get(booking_id).await {
            Ok(Some(booking)) => booking.reference_code,
            Ok(None) => return skipped("booking not found".to_string()),
            Err(e) => return failed(e.to_string(), false),
        };

        let _lease = match self.locks.acquire(reference_code.as_str()).await {
            Ok(lease) => lease,
            Err(e) => return failed(e.to_string(), false),
        };

        // Re-read under the lock
        let mut booking = match self.bookings.get(booking_id).await {
            Ok(Some(booking)) => booking,
            Ok(None) => return skipped("booking not found".to_string()),
            Err(e) => return failed(e.to_string(), false),
        };

        if booking.payment_status() == PaymentStatus::Captured {
            return CaptureOutcome::Succeeded(booking_id);
        }
        if !booking.is_capture_candidate(now) {
            return skipped(format!(
                "not due for capture ({} / {})",
                booking.status(),
                booking.payment_status()
            ));
        }
        if let Err(e) = BookingStateMachine::check_payment(&booking, PaymentStatus::Captured, now) {
            return skipped(e.to_string());
        }

        let hold = match booking.payment_hold() {
            Some(hold) => hold.clone(),
            None => return failed(SettlementError::MissingHold(reference_code).to_string(), false),
        };
        let gateway = match self.gateway(booking.payment_type) {
            Ok(gateway) => gateway,
            Err(e) => return failed(e.to_string(), false),
        };

        let receipt = match self.with_timeout(gateway.capture(&hold)).await {
            Ok(receipt) => receipt,
            Err(e) => {
                if let Err(log_err) = self
                    .record_failure(&reference_code, PaymentEvent::Capture, &e, hold.amount, &hold.masked_instrument, actor, now)
                    .await
                {
                    error!(%reference_code, error = %log_err, "Could not record failed capture");
                }
                let ambiguous = matches!(e, PaymentError::Ambiguous(_));
                return failed(e.to_string(), ambiguous);
            }
        };

        let entry = self
            .audit_entry(
                &reference_code,
                PaymentEvent::Capture,
                AuditOutcome::Succeeded,
                hold.amount,
                &hold.masked_instrument,
                Some(receipt.transaction_id),
                actor,
                now,
            )
            .await;
        if let Err(e) = BookingStateMachine::apply_payment(&mut booking, PaymentStatus::Captured, now) {
            return failed(e.to_string(), false);
        }

        match self
            .bookings
            .commit(BookingChange::new(booking).with_payment_entry(entry))
            .await
        {
            Ok(_) => {
                info!(%reference_code, %booking_id, amount = %hold.amount, "Funds captured");
                CaptureOutcome::Succeeded(booking_id)
            }
            Err(e) => {
                // Money moved but the record did not
                error!(%reference_code, %booking_id, error = %e, "Captured at gateway but not recorded");
                failed(format!("captured at gateway but not recorded: {}", e), true)
            }
        }
    }

    /// Voids authorized funds of a booking that reached a terminal status.
    /// Returns the booking unchanged when there is nothing to release.
    pub async fn void_if_needed(
        &self,
        reference_code: &ReferenceCode,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Booking, SettlementError> {
        let _lease = self.locks.acquire(reference_code.as_str()).await?;
        let mut booking = self.load(reference_code).await?;

        if booking.payment_status() != PaymentStatus::Authorized || !booking.status().is_terminal() {
            return Ok(booking);
        }
        BookingStateMachine::check_payment(&booking, PaymentStatus::Voided, now)?;

        let hold = booking
            .payment_hold()
            .cloned()
            .ok_or_else(|| SettlementError::MissingHold(reference_code.clone()))?;
        let gateway = self.gateway(booking.payment_type)?;

        let receipt = match self.with_timeout(gateway.void(&hold)).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(%reference_code, error = %e, "Void failed");
                self.record_failure(reference_code, PaymentEvent::Void, &e, hold.amount, &hold.masked_instrument, actor, now)
                    .await?;
                return Err(e.into());
            }
        };

        let entry = self
            .audit_entry(
                reference_code,
                PaymentEvent::Void,
                AuditOutcome::Succeeded,
                hold.amount,
                &hold.masked_instrument,
                Some(receipt.transaction_id),
                actor,
                now,
            )
            .await;
        BookingStateMachine::apply_payment(&mut booking, PaymentStatus::Voided, now)?;
        let booking = self
            .bookings
            .commit(BookingChange::new(booking).with_payment_entry(entry))
            .await?;

        info!(%reference_code, status = %booking.status(), "Authorized funds voided");
        Ok(booking)
    }

    /// Returns captured funds of a cancelled booking. Repeating it is a no-op.
    pub async fn refund(
        &self,
        reference_code: &ReferenceCode,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Booking, SettlementError> {
        let _lease = self.locks.acquire(reference_code.as_str()).await?;
        let mut booking = self.load(reference_code).await?;

        if booking.payment_status() == PaymentStatus::Refunded {
            return Ok(booking);
        }
        BookingStateMachine::check_payment(&booking, PaymentStatus::Refunded, now)?;

        let hold = booking
            .payment_hold()
            .cloned()
            .ok_or_else(|| SettlementError::MissingHold(reference_code.clone()))?;
        let gateway = self.gateway(booking.payment_type)?;

        let receipt = match self.with_timeout(gateway.refund(&hold)).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(%reference_code, error = %e, "Refund failed");
                self.record_failure(reference_code, PaymentEvent::Refund, &e, hold.amount, &hold.masked_instrument, actor, now)
                    .await?;
                return Err(e.into());
            }
        };

        let entry = self
            .audit_entry(
                reference_code,
                PaymentEvent::Refund,
                AuditOutcome::Succeeded,
                hold.amount,
                &hold.masked_instrument,
                Some(receipt.transaction_id),
                actor,
                now,
            )
            .await;
        BookingStateMachine::apply_payment(&mut booking, PaymentStatus::Refunded, now)?;
        let booking = self
            .bookings
            .commit(BookingChange::new(booking).with_payment_entry(entry))
            .await?;

        info!(%reference_code, amount = %hold.amount, "Captured funds refunded");
        Ok(booking)
    }
}
