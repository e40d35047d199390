// Provider router: dispatches supplier operations to the registered connector,
// bounds every call with a timeout and folds connector failures into one error shape

use super::{
    Accommodation, Availability, AvailabilityRequest, ConnectorError, Deadline, ExactAvailability,
    ProblemDetails, Supplier, SupplierBookingRequest, SupplierConnector,
};
use crate::booking::{BookingDetails, ReferenceCode};
use crate::config::RetryConfig;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    GetAvailability,
    GetExactAvailability,
    GetAccommodation,
    GetDeadline,
    Book,
    CancelBooking,
    GetBookingStatus,
    ProcessAsyncResponse,
}

impl Operation {
    /// Operations whose remote effect is the same no matter how often they run.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Operation::Book)
    }

    /// Operations the router may re-issue on a transient failure.
    pub fn is_retry_safe(self) -> bool {
        matches!(
            self,
            Operation::GetAvailability
                | Operation::GetExactAvailability
                | Operation::GetAccommodation
                | Operation::GetDeadline
                | Operation::CancelBooking
                | Operation::GetBookingStatus
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderErrorKind {
    UnknownProvider,
    Validation,
    /// Timeout or outage with no lasting effect; safe to try again later.
    Transient,
    /// The supplier explicitly refused.
    Definite,
    /// A non-idempotent call failed and the supplier-side effect is unknown.
    Ambiguous,
}

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("{operation} via {supplier} failed ({kind:?}): {problem}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub supplier: Supplier,
    pub operation: Operation,
    pub problem: ProblemDetails,
}

impl ProviderError {
    pub fn is_ambiguous(&self) -> bool {
        self.kind == ProviderErrorKind::Ambiguous
    }

    fn unknown_provider(supplier: Supplier, operation: Operation) -> Self {
        Self {
            kind: ProviderErrorKind::UnknownProvider,
            supplier,
            operation,
            problem: ProblemDetails {
                problem_type: "urn:booking-engine:unknown-provider".to_string(),
                title: "Unknown provider".to_string(),
                detail: Some(format!("No connector is registered for {}", supplier)),
                status: Some(400),
            },
        }
    }

    // Every connector failure lands here; callers never branch on supplier identity
    pub fn normalize(supplier: Supplier, operation: Operation, error: ConnectorError) -> Self {
        let uncertain = if operation.is_idempotent() {
            ProviderErrorKind::Transient
        } else {
            ProviderErrorKind::Ambiguous
        };

        let (kind, problem) = match error {
            ConnectorError::Timeout => (
                uncertain,
                problem("timeout", "Supplier timeout", "The supplier did not answer in time", 504),
            ),
            ConnectorError::NotDelivered(detail) => (
                ProviderErrorKind::Transient,
                problem("not-delivered", "Supplier unreachable", detail, 503),
            ),
            ConnectorError::Transport(detail) => (
                uncertain,
                problem("transport", "Supplier connection failed", detail, 502),
            ),
            ConnectorError::Unavailable { status, detail } => (
                uncertain,
                problem("unavailable", "Supplier unavailable", detail, status),
            ),
            ConnectorError::Rejected(details) => (ProviderErrorKind::Definite, details),
            ConnectorError::Malformed(detail) => {
                let kind = match operation {
                    Operation::Book => ProviderErrorKind::Ambiguous,
                    Operation::ProcessAsyncResponse => ProviderErrorKind::Validation,
                    _ => ProviderErrorKind::Definite,
                };
                (kind, problem("malformed", "Malformed supplier response", detail, 502))
            }
            ConnectorError::NotSupported(what) => (
                ProviderErrorKind::Validation,
                problem(
                    "not-supported",
                    "Operation not supported",
                    format!("{} does not support {}", supplier, what),
                    400,
                ),
            ),
        };

        Self {
            kind,
            supplier,
            operation,
            problem,
        }
    }
}

fn problem(kind: &str, title: &str, detail: impl Into<String>, status: u16) -> ProblemDetails {
    ProblemDetails {
        problem_type: format!("urn:booking-engine:supplier:{}", kind),
        title: title.to_string(),
        detail: Some(detail.into()),
        status: Some(status),
    }
}

pub struct ProviderRouter {
    connectors: DashMap<Supplier, Arc<dyn SupplierConnector>>,
    retry: RetryConfig,
    timeout: Duration,
}

impl ProviderRouter {
    pub fn new(retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            connectors: DashMap::new(),
            retry,
            timeout,
        }
    }

    pub fn register(&self, connector: Arc<dyn SupplierConnector>) {
        let supplier = connector.supplier();
        debug!(%supplier, "Registering supplier connector");
        self.connectors.insert(supplier, connector);
    }

    pub fn is_registered(&self, supplier: Supplier) -> bool {
        self.connectors.contains_key(&supplier)
    }

    fn connector(
        &self,
        supplier: Supplier,
        operation: Operation,
    ) -> Result<Arc<dyn SupplierConnector>, ProviderError> {
        self.connectors
            .get(&supplier)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| ProviderError::unknown_provider(supplier, operation))
    }

    async fn dispatch<T, F, Fut>(
        &self,
        supplier: Supplier,
        operation: Operation,
        call: F,
    ) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn SupplierConnector>) -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let connector = self.connector(supplier, operation)?;
        let mut attempt = 0;

        loop {
            let outcome = tokio::time::timeout(self.timeout, call(Arc::clone(&connector)))
                .await
                .unwrap_or(Err(ConnectorError::Timeout));

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => ProviderError::normalize(supplier, operation, e),
            };

            let retryable = error.kind == ProviderErrorKind::Transient && operation.is_retry_safe();
            if !retryable || attempt >= self.retry.max_retries {
                if error.is_ambiguous() {
                    warn!(%supplier, %operation, problem = %error.problem, "Supplier outcome unknown");
                }
                return Err(error);
            }

            let backoff = self.retry.backoff(attempt);
            warn!(
                %supplier,
                %operation,
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                problem = %error.problem,
                "Retrying transient supplier failure"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    pub async fn get_availability(
        &self,
        supplier: Supplier,
        request: &AvailabilityRequest,
    ) -> Result<Availability, ProviderError> {
        self.dispatch(supplier, Operation::GetAvailability, |c| async move {
            c.get_availability(request).await
        })
        .await
    }

    pub async fn get_exact_availability(
        &self,
        supplier: Supplier,
        availability_id: &str,
        accommodation_id: &str,
        room_contract_set_id: &str,
    ) -> Result<ExactAvailability, ProviderError> {
        self.dispatch(supplier, Operation::GetExactAvailability, |c| async move {
            c.get_exact_availability(availability_id, accommodation_id, room_contract_set_id)
                .await
        })
        .await
    }

    pub async fn get_accommodation(
        &self,
        supplier: Supplier,
        accommodation_id: &str,
    ) -> Result<Accommodation, ProviderError> {
        self.dispatch(supplier, Operation::GetAccommodation, |c| async move {
            c.get_accommodation(accommodation_id).await
        })
        .await
    }

    pub async fn get_deadline(
        &self,
        supplier: Supplier,
        availability_id: &str,
        room_contract_set_id: &str,
    ) -> Result<Deadline, ProviderError> {
        self.dispatch(supplier, Operation::GetDeadline, |c| async move {
            c.get_deadline(availability_id, room_contract_set_id).await
        })
        .await
    }

    /// Never retried; a timeout surfaces as `Ambiguous`.
    pub async fn book(
        &self,
        supplier: Supplier,
        request: &SupplierBookingRequest,
    ) -> Result<BookingDetails, ProviderError> {
        self.dispatch(supplier, Operation::Book, |c| async move {
            c.book(request).await
        })
        .await
    }

    pub async fn cancel_booking(
        &self,
        supplier: Supplier,
        reference_code: &ReferenceCode,
    ) -> Result<(), ProviderError> {
        self.dispatch(supplier, Operation::CancelBooking, |c| async move {
            c.cancel_booking(reference_code).await
        })
        .await
    }

    pub async fn get_booking_status(
        &self,
        supplier: Supplier,
        reference_code: &ReferenceCode,
    ) -> Result<BookingDetails, ProviderError> {
        self.dispatch(supplier, Operation::GetBookingStatus, |c| async move {
            c.get_booking_status(reference_code).await
        })
        .await
    }

    pub async fn process_async_response(
        &self,
        supplier: Supplier,
        payload: Bytes,
    ) -> Result<BookingDetails, ProviderError> {
        self.dispatch(supplier, Operation::ProcessAsyncResponse, |c| {
            let payload = payload.clone();
            async move { c.process_async_response(payload).await }
        })
        .await
    }
}
