// JSON-over-HTTP supplier connector. Booking callbacks from these suppliers are
// pushed as XML notifications, decoded here with quick-xml.

use super::{
    Accommodation, Availability, AvailabilityRequest, ConnectorError, Deadline, ExactAvailability,
    ProblemDetails, Supplier, SupplierBookingRequest, SupplierConnector,
};
use crate::booking::details::{AccommodationBookingDetails, SupplierBookingStatus};
use crate::booking::{BookingDetails, ReferenceCode};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::de::from_str;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpConnectorConfig {
    pub supplier: Supplier,
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
}

pub struct HttpSupplierConnector {
    config: HttpConnectorConfig,
    client: Client,
}

impl HttpSupplierConnector {
    pub fn new(config: HttpConnectorConfig) -> Result<Self, ConnectorError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ConnectorError::NotDelivered(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.config.api_key)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ConnectorError> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ConnectorError::Malformed(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ConnectorError> {
        debug!(supplier = %self.config.supplier, path, "GET");
        self.send(self.client.get(self.url(path))).await
    }

    async fn post<B: serde::Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ConnectorError> {
        debug!(supplier = %self.config.supplier, path, "POST");
        self.send(self.client.post(self.url(path)).json(body)).await
    }
}

#[async_trait]
impl SupplierConnector for HttpSupplierConnector {
    fn supplier(&self) -> Supplier {
        self.config.supplier
    }

    async fn get_availability(
        &self,
        request: &AvailabilityRequest,
    ) -> Result<Availability, ConnectorError> {
        self.post("availabilities", request).await
    }

    async fn get_exact_availability(
        &self,
        availability_id: &str,
        accommodation_id: &str,
        room_contract_set_id: &str,
    ) -> Result<ExactAvailability, ConnectorError> {
        self.get(&format!(
            "availabilities/{}/accommodations/{}/room-contract-sets/{}",
            availability_id, accommodation_id, room_contract_set_id
        ))
        .await
    }

    async fn get_accommodation(
        &self,
        accommodation_id: &str,
    ) -> Result<Accommodation, ConnectorError> {
        self.get(&format!("accommodations/{}", accommodation_id))
            .await
    }

    async fn get_deadline(
        &self,
        availability_id: &str,
        room_contract_set_id: &str,
    ) -> Result<Deadline, ConnectorError> {
        self.get(&format!(
            "availabilities/{}/room-contract-sets/{}/deadline",
            availability_id, room_contract_set_id
        ))
        .await
    }

    async fn book(
        &self,
        request: &SupplierBookingRequest,
    ) -> Result<BookingDetails, ConnectorError> {
        self.post("bookings", request).await
    }

    async fn cancel_booking(&self, reference_code: &ReferenceCode) -> Result<(), ConnectorError> {
        let path = format!("bookings/{}/cancel", reference_code);
        let result: Result<serde_json::Value, ConnectorError> =
            self.post(&path, &serde_json::json!({})).await;

        match result {
            Ok(_) => Ok(()),
            // The supplier answers 409 when the booking is already cancelled
            Err(ConnectorError::Rejected(problem)) if problem.status == Some(409) => {
                debug!(%reference_code, "Booking already cancelled at supplier");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_booking_status(
        &self,
        reference_code: &ReferenceCode,
    ) -> Result<BookingDetails, ConnectorError> {
        self.get(&format!("bookings/{}", reference_code)).await
    }

    async fn process_async_response(&self, payload: Bytes) -> Result<BookingDetails, ConnectorError> {
        parse_booking_notification(&payload)
    }
}

fn classify_transport(error: reqwest::Error) -> ConnectorError {
    if error.is_timeout() {
        ConnectorError::Timeout
    } else if error.is_connect() || error.is_builder() {
        ConnectorError::NotDelivered(error.to_string())
    } else {
        ConnectorError::Transport(error.to_string())
    }
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> ConnectorError {
    if status.is_server_error() {
        return ConnectorError::Unavailable {
            status: status.as_u16(),
            detail: body.chars().take(512).collect(),
        };
    }

    let problem = serde_json::from_str::<ProblemDetails>(body).unwrap_or_else(|_| {
        ProblemDetails::new(
            status.canonical_reason().unwrap_or("Supplier error"),
            body.chars().take(512).collect::<String>(),
            Some(status.as_u16()),
        )
    });

    ConnectorError::Rejected(ProblemDetails {
        status: problem.status.or(Some(status.as_u16())),
        ..problem
    })
}

// XML booking notification pushed by asynchronous suppliers
#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
#[serde(rename = "BookingNotification")]
struct XmlBookingNotification {
    #[serde(rename = "@reference")]
    reference: String,
    #[serde(rename = "@supplierReference")]
    supplier_reference: String,
    status: String,
    check_in: String,
    check_out: String,
    deadline: String,
}

pub(crate) fn parse_booking_notification(payload: &[u8]) -> Result<BookingDetails, ConnectorError> {
    let xml = std::str::from_utf8(payload)
        .map_err(|e| ConnectorError::Malformed(format!("payload is not UTF-8: {}", e)))?;
    let notification: XmlBookingNotification =
        from_str(xml).map_err(|e| ConnectorError::Malformed(e.to_string()))?;

    if notification.reference.trim().is_empty() {
        return Err(ConnectorError::Malformed(
            "notification has no booking reference".to_string(),
        ));
    }

    let status = match notification.status.trim().to_ascii_lowercase().as_str() {
        "pending" | "onrequest" | "on_request" => SupplierBookingStatus::Pending,
        "confirmed" | "ok" => SupplierBookingStatus::Confirmed,
        "cancelled" | "canceled" => SupplierBookingStatus::Cancelled,
        "rejected" | "failed" | "ko" => SupplierBookingStatus::Rejected,
        other => {
            return Err(ConnectorError::Malformed(format!(
                "unknown booking status '{}'",
                other
            )))
        }
    };

    let parse_date = |field: &str, value: &str| {
        NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
            .map_err(|e| ConnectorError::Malformed(format!("{} '{}': {}", field, value, e)))
    };

    let deadline = match notification.deadline.trim() {
        "" => None,
        value => Some(
            DateTime::parse_from_rfc3339(value)
                .map_err(|e| ConnectorError::Malformed(format!("Deadline '{}': {}", value, e)))?
                .with_timezone(&Utc),
        ),
    };

    let supplier_reference = Some(notification.supplier_reference.trim().to_string())
        .filter(|s| !s.is_empty());

    Ok(BookingDetails::AccommodationV1(AccommodationBookingDetails {
        reference_code: ReferenceCode::from(notification.reference.as_str()),
        supplier_reference,
        status,
        check_in: parse_date("CheckIn", &notification.check_in)?,
        check_out: parse_date("CheckOut", &notification.check_out)?,
        deadline,
        rooms: Vec::new(),
    }))
}
