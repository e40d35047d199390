// Supplier connector capability, shared request/response types and connector errors

pub mod http;
pub mod router;

use crate::booking::details::{CancellationPolicy, RoomContract};
use crate::booking::{BookingDetails, ReferenceCode};
use crate::money::Money;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use router::{Operation, ProviderError, ProviderErrorKind, ProviderRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Supplier {
    Netstorming,
    Illusions,
    Etg,
    Columbus,
    DirectContracts,
}

impl fmt::Display for Supplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// HTTP-problem style error payload shared by every connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type", default = "ProblemDetails::default_type")]
    pub problem_type: String,
    pub title: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

impl ProblemDetails {
    fn default_type() -> String {
        "about:blank".to_string()
    }

    pub fn new(title: impl Into<String>, detail: impl Into<String>, status: Option<u16>) -> Self {
        Self {
            problem_type: Self::default_type(),
            title: title.into(),
            detail: Some(detail.into()),
            status,
        }
    }
}

impl fmt::Display for ProblemDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.title, detail),
            None => f.write_str(&self.title),
        }
    }
}

// Raw connector failures, before the router classifies them
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectorError {
    #[error("Supplier call timed out")]
    Timeout,

    /// The request was never delivered; the supplier did nothing.
    #[error("Request not delivered: {0}")]
    NotDelivered(String),

    /// The connection broke after the request may have reached the supplier.
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Supplier unavailable ({status}): {detail}")]
    Unavailable { status: u16, detail: String },

    #[error("Supplier rejected the request: {0}")]
    Rejected(ProblemDetails),

    #[error("Malformed supplier payload: {0}")]
    Malformed(String),

    #[error("Operation not supported by supplier: {0}")]
    NotSupported(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomOccupancy {
    pub adults: u8,
    #[serde(default)]
    pub children_ages: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityRequest {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub accommodation_ids: Vec<String>,
    pub rooms: Vec<RoomOccupancy>,
    pub nationality: String,
    pub residency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomContractSet {
    pub id: String,
    pub price: Money,
    pub rooms: Vec<RoomContract>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccommodationAvailability {
    pub accommodation_id: String,
    pub accommodation_name: String,
    pub room_contract_sets: Vec<RoomContractSet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Availability {
    pub availability_id: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub results: Vec<AccommodationAvailability>,
}

/// A single room contract set re-checked right before booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExactAvailability {
    pub availability_id: String,
    pub accommodation_id: String,
    pub accommodation_name: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub room_contract_set: RoomContractSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accommodation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub rating: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deadline {
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub policies: Vec<CancellationPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplierBookingRequest {
    pub reference_code: ReferenceCode,
    pub availability_id: String,
    pub accommodation_id: String,
    pub room_contract_set_id: String,
    pub rooms: Vec<RoomOccupancy>,
    pub lead_guest: String,
    pub nationality: String,
    pub residency: String,
}

// One implementation per supplier, selected by `supplier()`
#[async_trait]
pub trait SupplierConnector: Send + Sync + 'static {
    fn supplier(&self) -> Supplier;

    async fn get_availability(
        &self,
        request: &AvailabilityRequest,
    ) -> Result<Availability, ConnectorError>;

    async fn get_exact_availability(
        &self,
        availability_id: &str,
        accommodation_id: &str,
        room_contract_set_id: &str,
    ) -> Result<ExactAvailability, ConnectorError>;

    async fn get_accommodation(&self, accommodation_id: &str)
        -> Result<Accommodation, ConnectorError>;

    async fn get_deadline(
        &self,
        availability_id: &str,
        room_contract_set_id: &str,
    ) -> Result<Deadline, ConnectorError>;

    async fn book(&self, request: &SupplierBookingRequest)
        -> Result<BookingDetails, ConnectorError>;

    /// Cancelling an already-cancelled booking must succeed.
    async fn cancel_booking(&self, reference_code: &ReferenceCode) -> Result<(), ConnectorError>;

    async fn get_booking_status(
        &self,
        reference_code: &ReferenceCode,
    ) -> Result<BookingDetails, ConnectorError>;

    /// Decodes a pushed supplier callback. Synchronous-only suppliers keep the default.
    async fn process_async_response(&self, _payload: Bytes) -> Result<BookingDetails, ConnectorError> {
        Err(ConnectorError::NotSupported("asynchronous booking responses"))
    }
}
