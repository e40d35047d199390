// Typed supplier payloads, decoded once at the connector boundary

use super::{BookingStatus, ReferenceCode};
use crate::money::Money;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What the supplier quoted when the booking was made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ServiceDetails {
    #[serde(rename = "accommodation.v1")]
    AccommodationV1(AccommodationService),
}

impl ServiceDetails {
    pub fn supplier_price(&self) -> Money {
        match self {
            ServiceDetails::AccommodationV1(service) => service.supplier_price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccommodationService {
    pub accommodation_id: String,
    pub accommodation_name: String,
    pub room_contract_set_id: String,
    pub rooms: Vec<RoomContract>,
    pub supplier_price: Money,
    #[serde(default)]
    pub cancellation_policies: Vec<CancellationPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomContract {
    pub room_type: String,
    pub board_basis: String,
    pub adults: u8,
    #[serde(default)]
    pub children: u8,
    pub price: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationPolicy {
    pub from: DateTime<Utc>,
    /// Share of the total price charged when cancelling from `from` on.
    pub penalty_percentage: Decimal,
}

/// The supplier's view of a booking, as returned from `Book`, status
/// checks and asynchronous callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum BookingDetails {
    #[serde(rename = "accommodation.v1")]
    AccommodationV1(AccommodationBookingDetails),
}

impl BookingDetails {
    pub fn reference_code(&self) -> &ReferenceCode {
        match self {
            BookingDetails::AccommodationV1(details) => &details.reference_code,
        }
    }

    pub fn status(&self) -> SupplierBookingStatus {
        match self {
            BookingDetails::AccommodationV1(details) => details.status,
        }
    }

    pub fn supplier_reference(&self) -> Option<&str> {
        match self {
            BookingDetails::AccommodationV1(details) => details.supplier_reference.as_deref(),
        }
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            BookingDetails::AccommodationV1(details) => details.deadline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccommodationBookingDetails {
    pub reference_code: ReferenceCode,
    #[serde(default)]
    pub supplier_reference: Option<String>,
    pub status: SupplierBookingStatus,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rooms: Vec<RoomContract>,
}

// Statuses a supplier can report; Discarded is internal-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SupplierBookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Rejected,
}

impl From<SupplierBookingStatus> for BookingStatus {
    fn from(status: SupplierBookingStatus) -> Self {
        match status {
            SupplierBookingStatus::Pending => BookingStatus::Pending,
            SupplierBookingStatus::Confirmed => BookingStatus::Confirmed,
            SupplierBookingStatus::Cancelled => BookingStatus::Cancelled,
            SupplierBookingStatus::Rejected => BookingStatus::Rejected,
        }
    }
}
