// Booking state machine
//
// Status × PaymentStatus jointly define where a booking is. Every mutation of
// either field goes through here; an illegal request leaves the record untouched.

use super::{Booking, BookingStatus, PaymentHold, PaymentStatus, ReferenceCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("Booking {reference_code}: status {from} cannot move to {to}")]
    InvalidStatus {
        reference_code: ReferenceCode,
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("Booking {reference_code}: payment {from} cannot move to {to} while status is {status}")]
    InvalidPayment {
        reference_code: ReferenceCode,
        status: BookingStatus,
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("Booking {reference_code}: {reason}")]
    GuardFailed {
        reference_code: ReferenceCode,
        reason: String,
    },

    #[error("Booking {reference_code} was modified concurrently (expected version {expected}, found {found})")]
    Concurrency {
        reference_code: ReferenceCode,
        expected: u64,
        found: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusEvent {
    SupplierConfirmed,
    Reject,
    Discard,
    Cancel,
    SupplierCancelled,
    /// A supplier refresh or callback reported this status.
    SupplierReported(BookingStatus),
}

/// A committed change, as seen by audit and notification consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Status {
        from: BookingStatus,
        to: BookingStatus,
    },
    Payment {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    /// The requested state already held; nothing changed.
    Unchanged,
}

impl Transition {
    pub fn is_change(&self) -> bool {
        !matches!(self, Transition::Unchanged)
    }
}

pub struct BookingStateMachine;

impl BookingStateMachine {
    /// Resolves the status an event leads to from `current`.
    pub fn next_status(
        current: BookingStatus,
        event: StatusEvent,
    ) -> Option<BookingStatus> {
        use BookingStatus::*;

        match (current, event) {
            (Pending, StatusEvent::SupplierConfirmed) => Some(Confirmed),
            (Pending, StatusEvent::Reject) => Some(Rejected),
            (Pending, StatusEvent::Discard) => Some(Discarded),
            (Confirmed, StatusEvent::Cancel) => Some(Cancelled),
            (Confirmed, StatusEvent::SupplierCancelled) => Some(Cancelled),
            // Suppliers can never report an internal discard
            (_, StatusEvent::SupplierReported(Discarded)) => None,
            (from, StatusEvent::SupplierReported(to)) if !from.is_terminal() => Some(to),
            _ => None,
        }
    }

    /// Whether a booking may hold `payment` while its status is `status`.
    pub fn is_compatible(status: BookingStatus, payment: PaymentStatus) -> bool {
        use BookingStatus::*;

        match payment {
            PaymentStatus::NotPaid | PaymentStatus::Authorized | PaymentStatus::Voided => true,
            PaymentStatus::Captured => matches!(status, Confirmed | Cancelled),
            PaymentStatus::Refunded => status == Cancelled,
        }
    }

    fn payment_edge_exists(from: PaymentStatus, to: PaymentStatus) -> bool {
        use PaymentStatus::*;

        matches!(
            (from, to),
            (NotPaid, Authorized) | (Authorized, Captured) | (Authorized, Voided) | (Captured, Refunded)
        )
    }

    /// Checks whether `target` is a legal next payment status, without mutating.
    pub fn check_payment(
        booking: &Booking,
        target: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let from = booking.payment_status;
        let status = booking.status;
        let invalid = || TransitionError::InvalidPayment {
            reference_code: booking.reference_code.clone(),
            status,
            from,
            to: target,
        };

        if !Self::payment_edge_exists(from, target) {
            return Err(invalid());
        }

        match target {
            PaymentStatus::Authorized if status.is_terminal() => Err(invalid()),
            PaymentStatus::Captured if status != BookingStatus::Confirmed => Err(invalid()),
            PaymentStatus::Voided => {
                let released_by_status = status.is_terminal();
                let within_free_window = !booking.capture_due(now);
                if released_by_status || within_free_window {
                    Ok(())
                } else {
                    Err(TransitionError::GuardFailed {
                        reference_code: booking.reference_code.clone(),
                        reason: format!(
                            "funds cannot be voided after the deadline while status is {}",
                            status
                        ),
                    })
                }
            }
            PaymentStatus::Refunded if status != BookingStatus::Cancelled => Err(invalid()),
            _ => Ok(()),
        }
    }

    /// Applies a status event. Re-applying an event whose target already holds
    /// is reported as `Transition::Unchanged`.
    pub fn apply_status(
        booking: &mut Booking,
        event: StatusEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let from = booking.status;

        let to = match Self::next_status(from, event) {
            Some(to) => to,
            None => match Self::idempotent_target(from, event) {
                Some(_) => return Ok(Transition::Unchanged),
                None => {
                    return Err(TransitionError::InvalidStatus {
                        reference_code: booking.reference_code.clone(),
                        from,
                        to: Self::nominal_target(event),
                    })
                }
            },
        };

        if to == from {
            return Ok(Transition::Unchanged);
        }

        if !Self::is_compatible(to, booking.payment_status) {
            return Err(TransitionError::GuardFailed {
                reference_code: booking.reference_code.clone(),
                reason: format!(
                    "status {} is incompatible with payment status {}",
                    to, booking.payment_status
                ),
            });
        }

        booking.status = to;
        booking.updated = now;
        Ok(Transition::Status { from, to })
    }

    pub fn apply_payment(
        booking: &mut Booking,
        target: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        if booking.payment_status == target {
            return Ok(Transition::Unchanged);
        }

        Self::check_payment(booking, target, now)?;

        let from = booking.payment_status;
        booking.payment_status = target;
        booking.updated = now;
        Ok(Transition::Payment { from, to: target })
    }

    /// NotPaid -> Authorized, recording the hold placed at the gateway.
    pub fn apply_authorization(
        booking: &mut Booking,
        hold: PaymentHold,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let transition = Self::apply_payment(booking, PaymentStatus::Authorized, now)?;
        if transition.is_change() {
            booking.payment_hold = Some(hold);
        }
        Ok(transition)
    }

    /// Marks a persisted copy as one version newer; called by storage on commit.
    pub fn bump_version(booking: &mut Booking) {
        booking.version += 1;
    }

    /// Fails with a concurrency error unless `booking` is still at `expected`.
    pub fn ensure_version(booking: &Booking, expected: u64) -> Result<(), TransitionError> {
        if booking.version == expected {
            Ok(())
        } else {
            Err(TransitionError::Concurrency {
                reference_code: booking.reference_code.clone(),
                expected,
                found: booking.version,
            })
        }
    }

    // Repeating a cancel/discard/reject on a booking already there is a no-op
    fn idempotent_target(current: BookingStatus, event: StatusEvent) -> Option<BookingStatus> {
        let target = Self::nominal_target(event);
        (target == current).then_some(target)
    }

    fn nominal_target(event: StatusEvent) -> BookingStatus {
        match event {
            StatusEvent::SupplierConfirmed => BookingStatus::Confirmed,
            StatusEvent::Reject => BookingStatus::Rejected,
            StatusEvent::Discard => BookingStatus::Discarded,
            StatusEvent::Cancel | StatusEvent::SupplierCancelled => BookingStatus::Cancelled,
            StatusEvent::SupplierReported(status) => status,
        }
    }
}
