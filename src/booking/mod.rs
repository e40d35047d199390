// Booking record: identity, owner context, dates and the joint status/payment state.
//
// `status`, `payment_status`, `payment_hold` and `version` are private to this module
// tree, so the only code able to change them is `state_machine`.

pub mod details;
pub mod state_machine;

use crate::markup::AppliedMarkup;
use crate::money::Money;
use crate::supplier::Supplier;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use details::{BookingDetails, ServiceDetails, SupplierBookingStatus};
pub use state_machine::{BookingStateMachine, StatusEvent, Transition, TransitionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BookingId(pub u64);

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgencyId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterpartyId(pub u64);

/// Externally visible, immutable booking identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceCode(String);

impl ReferenceCode {
    const SUFFIX_LEN: usize = 8;

    // PREFIX-AGENCY-SUFFIX, e.g. HTL-0042-7KQ3M9TZ
    pub fn generate(prefix: &str, agency: AgencyId) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(Self::SUFFIX_LEN)
            .map(|c| (c as char).to_ascii_uppercase())
            .collect();
        Self(format!("{}-{:04}-{}", prefix, agency.0, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ReferenceCode {
    fn from(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

impl From<String> for ReferenceCode {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl fmt::Display for ReferenceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Rejected,
    Discarded,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Cancelled | BookingStatus::Rejected | BookingStatus::Discarded
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PaymentStatus {
    NotPaid,
    Authorized,
    Captured,
    Voided,
    Refunded,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PaymentType {
    CreditCard,
    VirtualAccount,
    Offline,
}

/// Funds held at the gateway for a booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentHold {
    pub authorization_id: String,
    pub masked_instrument: String,
    pub amount: Money,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidBooking {
    #[error("Deadline {deadline} is after check-in {check_in}")]
    DeadlineAfterCheckIn {
        deadline: DateTime<Utc>,
        check_in: DateTime<Utc>,
    },

    #[error("Check-out {check_out} is not after check-in {check_in}")]
    CheckOutBeforeCheckIn {
        check_in: DateTime<Utc>,
        check_out: DateTime<Utc>,
    },

    #[error("Booking price must be positive, got {0}")]
    NonPositivePrice(Money),
}

// Everything needed to persist a freshly confirmed booking
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub reference_code: ReferenceCode,
    pub supplier: Supplier,
    pub agency_id: AgencyId,
    pub agent_id: AgentId,
    pub payment_type: PaymentType,
    pub created: DateTime<Utc>,
    pub check_in: DateTime<Utc>,
    pub check_out: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub total_price: Money,
    pub applied_markups: Vec<AppliedMarkup>,
    pub service_details: ServiceDetails,
    pub booking_details: Option<BookingDetails>,
    /// Present when funds were authorized before the supplier confirmed.
    pub payment_hold: Option<PaymentHold>,
}

impl NewBooking {
    pub fn validate(&self) -> Result<(), InvalidBooking> {
        if self.check_out <= self.check_in {
            return Err(InvalidBooking::CheckOutBeforeCheckIn {
                check_in: self.check_in,
                check_out: self.check_out,
            });
        }
        if let Some(deadline) = self.deadline {
            if deadline > self.check_in {
                return Err(InvalidBooking::DeadlineAfterCheckIn {
                    deadline,
                    check_in: self.check_in,
                });
            }
        }
        if !self.total_price.is_positive() {
            return Err(InvalidBooking::NonPositivePrice(self.total_price));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub reference_code: ReferenceCode,
    pub supplier: Supplier,
    pub agency_id: AgencyId,
    pub agent_id: AgentId,
    pub payment_type: PaymentType,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub check_in: DateTime<Utc>,
    pub check_out: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub total_price: Money,
    pub applied_markups: Vec<AppliedMarkup>,
    pub service_details: ServiceDetails,
    pub booking_details: Option<BookingDetails>,
    status: BookingStatus,
    payment_status: PaymentStatus,
    payment_hold: Option<PaymentHold>,
    version: u64,
}

impl Booking {
    /// Builds the initial record: `(Pending, NotPaid)`, or `(Pending, Authorized)`
    /// when funds were held before supplier confirmation.
    pub fn create(id: BookingId, new: NewBooking) -> Result<Self, InvalidBooking> {
        new.validate()?;

        let payment_status = if new.payment_hold.is_some() {
            PaymentStatus::Authorized
        } else {
            PaymentStatus::NotPaid
        };

        Ok(Self {
            id,
            reference_code: new.reference_code,
            supplier: new.supplier,
            agency_id: new.agency_id,
            agent_id: new.agent_id,
            payment_type: new.payment_type,
            created: new.created,
            updated: new.created,
            check_in: new.check_in,
            check_out: new.check_out,
            deadline: new.deadline,
            total_price: new.total_price,
            applied_markups: new.applied_markups,
            service_details: new.service_details,
            booking_details: new.booking_details,
            status: BookingStatus::Pending,
            payment_status,
            payment_hold: new.payment_hold,
            version: 0,
        })
    }

    pub fn status(&self) -> BookingStatus {
        self.status
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.payment_status
    }

    pub fn payment_hold(&self) -> Option<&PaymentHold> {
        self.payment_hold.as_ref()
    }

    /// Optimistic concurrency token, bumped on every committed transition.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map_or(false, |deadline| deadline <= now)
    }

    pub fn check_in_reached(&self, now: DateTime<Utc>) -> bool {
        self.check_in <= now
    }

    /// Authorized funds are due for capture once the free-cancellation deadline
    /// has passed, or at check-in when the booking has no deadline.
    pub fn capture_due(&self, now: DateTime<Utc>) -> bool {
        match self.deadline {
            Some(_) => self.deadline_passed(now),
            None => self.check_in_reached(now),
        }
    }

    /// Filter used to pick candidates for batch capture.
    pub fn is_capture_candidate(&self, now: DateTime<Utc>) -> bool {
        self.payment_status == PaymentStatus::Authorized
            && matches!(
                self.status,
                BookingStatus::Pending | BookingStatus::Confirmed
            )
            && self.capture_due(now)
    }

    // Fixture hook for placing a record in an arbitrary joint state
    #[cfg(test)]
    pub(crate) fn with_state(mut self, status: BookingStatus, payment: PaymentStatus) -> Self {
        self.status = status;
        self.payment_status = payment;
        self
    }
}
