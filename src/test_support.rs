// Shared fixtures and scripted collaborators for unit tests

use crate::booking::details::{
    AccommodationBookingDetails, AccommodationService, RoomContract,
};
use crate::booking::{
    AgencyId, AgentId, Booking, BookingDetails, BookingId, BookingStatus, NewBooking, PaymentHold,
    PaymentStatus, PaymentType, ReferenceCode, ServiceDetails, SupplierBookingStatus,
};
use crate::engine::Clock;
use crate::money::{Currency, Money};
use crate::repository::PaymentEvent;
use crate::settlement::{GatewayReceipt, PaymentError, PaymentGateway, PaymentInstrument};
use crate::supplier::{
    Accommodation, Availability, AvailabilityRequest, ConnectorError, Deadline, ExactAvailability,
    Operation, RoomContractSet, RoomOccupancy, Supplier, SupplierBookingRequest, SupplierConnector,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn date(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

pub fn day(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

pub fn usd(cents: i64) -> Money {
    Money::new(Decimal::new(cents, 2), Currency::Usd)
}

pub fn room() -> RoomContract {
    RoomContract {
        room_type: "Double".to_string(),
        board_basis: "BB".to_string(),
        adults: 2,
        children: 0,
        price: usd(9999),
    }
}

pub fn service_details() -> ServiceDetails {
    ServiceDetails::AccommodationV1(AccommodationService {
        accommodation_id: "ACC-1".to_string(),
        accommodation_name: "Harbour View".to_string(),
        room_contract_set_id: "RCS-1".to_string(),
        rooms: vec![room()],
        supplier_price: usd(9999),
        cancellation_policies: vec![],
    })
}

pub fn instrument() -> PaymentInstrument {
    PaymentInstrument {
        token: "tok_visa".to_string(),
        masked: "**** **** **** 4242".to_string(),
    }
}

pub fn hold_for(reference: &str) -> PaymentHold {
    PaymentHold {
        authorization_id: format!("AUTH-{}", reference),
        masked_instrument: "**** **** **** 4242".to_string(),
        amount: usd(10709),
    }
}

/// Card booking at Netstorming: check-in 2021-12-10, deadline 2021-12-08, not yet paid.
pub fn new_booking(reference: &str) -> NewBooking {
    NewBooking {
        reference_code: ReferenceCode::from(reference),
        supplier: Supplier::Netstorming,
        agency_id: AgencyId(3),
        agent_id: AgentId(7),
        payment_type: PaymentType::CreditCard,
        created: date(2021, 11, 20),
        check_in: date(2021, 12, 10),
        check_out: date(2021, 12, 12),
        deadline: Some(date(2021, 12, 8)),
        total_price: usd(10709),
        applied_markups: vec![],
        service_details: service_details(),
        booking_details: None,
        payment_hold: None,
    }
}

pub fn booking_with(status: BookingStatus, payment: PaymentStatus) -> Booking {
    let mut new = new_booking("HTL-0001-FIXTURE1");
    if payment != PaymentStatus::NotPaid {
        new.payment_hold = Some(hold_for("HTL-0001-FIXTURE1"));
    }
    Booking::create(BookingId(1), new)
        .unwrap()
        .with_state(status, payment)
}

pub fn booking_details(reference: &str, status: SupplierBookingStatus) -> BookingDetails {
    BookingDetails::AccommodationV1(AccommodationBookingDetails {
        reference_code: ReferenceCode::from(reference),
        supplier_reference: Some(format!("SUP-{}", reference)),
        status,
        check_in: day(2021, 12, 10),
        check_out: day(2021, 12, 12),
        deadline: None,
        rooms: vec![room()],
    })
}

/// JSON callback body as understood by `ScriptedConnector`.
pub fn details_payload(reference: &str, status: SupplierBookingStatus) -> Bytes {
    Bytes::from(serde_json::to_vec(&booking_details(reference, status)).unwrap())
}

pub fn availability_request() -> AvailabilityRequest {
    AvailabilityRequest {
        check_in: day(2021, 12, 10),
        check_out: day(2021, 12, 12),
        accommodation_ids: vec!["ACC-1".to_string()],
        rooms: vec![RoomOccupancy {
            adults: 2,
            children_ages: vec![],
        }],
        nationality: "GB".to_string(),
        residency: "GB".to_string(),
    }
}

pub fn booking_request(reference: &str) -> SupplierBookingRequest {
    SupplierBookingRequest {
        reference_code: ReferenceCode::from(reference),
        availability_id: "AV-1".to_string(),
        accommodation_id: "ACC-1".to_string(),
        room_contract_set_id: "RCS-1".to_string(),
        rooms: availability_request().rooms,
        lead_guest: "Jane Doe".to_string(),
        nationality: "GB".to_string(),
        residency: "GB".to_string(),
    }
}

pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock() = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

/// In-memory supplier whose answers and failures are scripted per test.
pub struct ScriptedConnector {
    supplier: Supplier,
    calls: Mutex<HashMap<Operation, usize>>,
    availability_failures: Mutex<VecDeque<ConnectorError>>,
    book_failure: Mutex<Option<ConnectorError>>,
    book_delay: Mutex<Option<Duration>>,
    book_status: Mutex<SupplierBookingStatus>,
    reported_status: Mutex<SupplierBookingStatus>,
    price: Mutex<Money>,
    deadline: Mutex<Option<DateTime<Utc>>>,
    stay: Mutex<(NaiveDate, NaiveDate)>,
}

impl ScriptedConnector {
    pub fn new(supplier: Supplier) -> Self {
        Self {
            supplier,
            calls: Mutex::new(HashMap::new()),
            availability_failures: Mutex::new(VecDeque::new()),
            book_failure: Mutex::new(None),
            book_delay: Mutex::new(None),
            book_status: Mutex::new(SupplierBookingStatus::Confirmed),
            reported_status: Mutex::new(SupplierBookingStatus::Confirmed),
            price: Mutex::new(usd(9999)),
            deadline: Mutex::new(Some(date(2021, 12, 8))),
            stay: Mutex::new((day(2021, 12, 10), day(2021, 12, 12))),
        }
    }

    /// Each queued error fails one availability call; later calls succeed.
    pub fn fail_availability(&self, errors: Vec<ConnectorError>) {
        self.availability_failures.lock().extend(errors);
    }

    pub fn fail_book(&self, error: ConnectorError) {
        *self.book_failure.lock() = Some(error);
    }

    pub fn set_book_delay(&self, delay: Duration) {
        *self.book_delay.lock() = Some(delay);
    }

    pub fn set_book_status(&self, status: SupplierBookingStatus) {
        *self.book_status.lock() = status;
    }

    pub fn set_reported_status(&self, status: SupplierBookingStatus) {
        *self.reported_status.lock() = status;
    }

    pub fn set_deadline(&self, deadline: Option<DateTime<Utc>>) {
        *self.deadline.lock() = deadline;
    }

    /// Check-in and check-out the exact availability re-check answers with.
    pub fn set_stay(&self, check_in: NaiveDate, check_out: NaiveDate) {
        *self.stay.lock() = (check_in, check_out);
    }

    pub fn calls(&self, operation: Operation) -> usize {
        self.calls.lock().get(&operation).copied().unwrap_or(0)
    }

    fn record(&self, operation: Operation) {
        *self.calls.lock().entry(operation).or_insert(0) += 1;
    }

    fn contract_set(&self) -> RoomContractSet {
        RoomContractSet {
            id: "RCS-1".to_string(),
            price: *self.price.lock(),
            rooms: vec![room()],
            deadline: *self.deadline.lock(),
        }
    }
}

#[async_trait]
impl SupplierConnector for ScriptedConnector {
    fn supplier(&self) -> Supplier {
        self.supplier
    }

    async fn get_availability(&self, request: &AvailabilityRequest) -> Result<Availability, ConnectorError> {
        self.record(Operation::GetAvailability);
        if let Some(error) = self.availability_failures.lock().pop_front() {
            return Err(error);
        }
        Ok(Availability {
            availability_id: "AV-1".to_string(),
            check_in: request.check_in,
            check_out: request.check_out,
            results: vec![crate::supplier::AccommodationAvailability {
                accommodation_id: "ACC-1".to_string(),
                accommodation_name: "Harbour View".to_string(),
                room_contract_sets: vec![self.contract_set()],
            }],
        })
    }

    async fn get_exact_availability(
        &self,
        availability_id: &str,
        accommodation_id: &str,
        _room_contract_set_id: &str,
    ) -> Result<ExactAvailability, ConnectorError> {
        self.record(Operation::GetExactAvailability);
        let (check_in, check_out) = *self.stay.lock();
        Ok(ExactAvailability {
            availability_id: availability_id.to_string(),
            accommodation_id: accommodation_id.to_string(),
            accommodation_name: "Harbour View".to_string(),
            check_in,
            check_out,
            room_contract_set: self.contract_set(),
        })
    }

    async fn get_accommodation(&self, accommodation_id: &str) -> Result<Accommodation, ConnectorError> {
        self.record(Operation::GetAccommodation);
        Ok(Accommodation {
            id: accommodation_id.to_string(),
            name: "Harbour View".to_string(),
            country_code: Some("AE".to_string()),
            rating: Some(4),
        })
    }

    async fn get_deadline(&self, _availability_id: &str, _room_contract_set_id: &str) -> Result<Deadline, ConnectorError> {
        self.record(Operation::GetDeadline);
        Ok(Deadline {
            date: *self.deadline.lock(),
            policies: vec![],
        })
    }

    async fn book(&self, request: &SupplierBookingRequest) -> Result<BookingDetails, ConnectorError> {
        self.record(Operation::Book);
        let delay = *self.book_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.book_failure.lock().clone() {
            return Err(error);
        }
        let status = *self.book_status.lock();
        Ok(booking_details(request.reference_code.as_str(), status))
    }

    async fn cancel_booking(&self, _reference_code: &ReferenceCode) -> Result<(), ConnectorError> {
        self.record(Operation::CancelBooking);
        Ok(())
    }

    async fn get_booking_status(&self, reference_code: &ReferenceCode) -> Result<BookingDetails, ConnectorError> {
        self.record(Operation::GetBookingStatus);
        let status = *self.reported_status.lock();
        Ok(booking_details(reference_code.as_str(), status))
    }

    async fn process_async_response(&self, payload: Bytes) -> Result<BookingDetails, ConnectorError> {
        self.record(Operation::ProcessAsyncResponse);
        serde_json::from_slice(&payload).map_err(|e| ConnectorError::Malformed(e.to_string()))
    }
}

/// Gateway double; holds are named `AUTH-<reference>` so failures can be scripted per booking.
pub struct ScriptedGateway {
    calls: Mutex<HashMap<PaymentEvent, usize>>,
    failures: Mutex<HashMap<(String, PaymentEvent), PaymentError>>,
    delay: Mutex<Option<Duration>>,
    transactions: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            transactions: AtomicUsize::new(0),
        }
    }

    /// Fails the next `event` for this booking with `error`.
    pub fn fail_for(&self, reference: &ReferenceCode, event: PaymentEvent, error: PaymentError) {
        self.failures
            .lock()
            .insert((reference.to_string(), event), error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self, event: PaymentEvent) -> usize {
        self.calls.lock().get(&event).copied().unwrap_or(0)
    }

    async fn attempt(&self, reference: &str, event: PaymentEvent) -> Result<GatewayReceipt, PaymentError> {
        *self.calls.lock().entry(event).or_insert(0) += 1;
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failures.lock().remove(&(reference.to_string(), event)) {
            return Err(error);
        }
        let n = self.transactions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(GatewayReceipt {
            transaction_id: format!("TX-{}", n),
        })
    }

    fn reference_of(hold: &PaymentHold) -> &str {
        hold.authorization_id
            .strip_prefix("AUTH-")
            .unwrap_or(&hold.authorization_id)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn authorize(
        &self,
        reference_code: &ReferenceCode,
        amount: Money,
        instrument: &PaymentInstrument,
    ) -> Result<PaymentHold, PaymentError> {
        self.attempt(reference_code.as_str(), PaymentEvent::Authorize).await?;
        Ok(PaymentHold {
            authorization_id: format!("AUTH-{}", reference_code),
            masked_instrument: instrument.masked.clone(),
            amount,
        })
    }

    async fn capture(&self, hold: &PaymentHold) -> Result<GatewayReceipt, PaymentError> {
        self.attempt(Self::reference_of(hold), PaymentEvent::Capture).await
    }

    async fn void(&self, hold: &PaymentHold) -> Result<GatewayReceipt, PaymentError> {
        self.attempt(Self::reference_of(hold), PaymentEvent::Void).await
    }

    async fn refund(&self, hold: &PaymentHold) -> Result<GatewayReceipt, PaymentError> {
        self.attempt(Self::reference_of(hold), PaymentEvent::Refund).await
    }
}
