// Booking engine facade: the operations booking-flow callers use

use crate::booking::details::AccommodationService;
use crate::booking::{
    AgencyId, Booking, BookingId, BookingStateMachine, BookingStatus, NewBooking, PaymentStatus,
    PaymentType, ReferenceCode, ServiceDetails, StatusEvent, SupplierBookingStatus, Transition,
};
use crate::config::EngineConfig;
use crate::conversion::CurrencyConverter;
use crate::error::EngineError;
use crate::locks::{InProcessLocks, KeyedLock};
use crate::markup::{AgentContext, MarkupPricingPipeline, PricedQuote};
use crate::money::Money;
use crate::notifications::{BroadcastNotifier, StatusChangeEvent, StatusChangeNotifier};
use crate::repository::{
    BookingChange, BookingRepository, MarkupPolicyRepository, PaymentAuditLogEntry,
    RepositoryError, StatusHistoryEntry,
};
use crate::settlement::{
    CaptureReport, PaymentGateway, PaymentInstrument, PaymentSettlementCoordinator,
};
use crate::supplier::{
    Availability, AvailabilityRequest, ProviderRouter, RoomOccupancy, Supplier,
    SupplierBookingRequest, SupplierConnector,
};
use crate::supplier_response::{Reconciliation, SupplierResponseProcessor};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

const REFERENCE_CODE_ATTEMPTS: usize = 5;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A booking request for a room contract set found through availability search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub supplier: Supplier,
    pub availability_id: String,
    pub accommodation_id: String,
    pub room_contract_set_id: String,
    pub rooms: Vec<RoomOccupancy>,
    pub lead_guest: String,
    pub nationality: String,
    pub residency: String,
    pub payment_type: PaymentType,
    /// Required for card payments, which authorize before the supplier call.
    #[serde(default)]
    pub instrument: Option<PaymentInstrument>,
}

pub struct BookingEngineBuilder {
    config: EngineConfig,
    router: ProviderRouter,
    bookings: Arc<dyn BookingRepository>,
    policies: Arc<dyn MarkupPolicyRepository>,
    converter: Arc<dyn CurrencyConverter>,
    locks: Arc<dyn KeyedLock>,
    notifier: Arc<dyn StatusChangeNotifier>,
    clock: Arc<dyn Clock>,
    gateways: Vec<(PaymentType, Arc<dyn PaymentGateway>)>,
}

impl BookingEngineBuilder {
    pub fn connector(self, connector: Arc<dyn SupplierConnector>) -> Self {
        self.router.register(connector);
        self
    }

    pub fn gateway(mut self, payment_type: PaymentType, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.push((payment_type, gateway));
        self
    }

    pub fn locks(mut self, locks: Arc<dyn KeyedLock>) -> Self {
        self.locks = locks;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn StatusChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> BookingEngine {
        let router = Arc::new(self.router);

        let settlement = self.gateways.into_iter().fold(
            PaymentSettlementCoordinator::new(
                self.bookings.clone(),
                self.locks.clone(),
                self.converter.clone(),
                &self.config,
            ),
            |coordinator, (payment_type, gateway)| coordinator.with_gateway(payment_type, gateway),
        );
        let settlement = Arc::new(settlement);

        let responses = SupplierResponseProcessor::new(
            router.clone(),
            self.bookings.clone(),
            self.locks.clone(),
            self.notifier.clone(),
            settlement.clone(),
            self.config.async_suppliers.clone(),
        );

        BookingEngine {
            pricing: MarkupPricingPipeline::new(
                self.policies,
                self.converter,
                self.config.reference_currency,
            ),
            config: self.config,
            router,
            bookings: self.bookings,
            locks: self.locks,
            notifier: self.notifier,
            settlement,
            responses,
            clock: self.clock,
        }
    }
}

pub struct BookingEngine {
    config: EngineConfig,
    pricing: MarkupPricingPipeline,
    router: Arc<ProviderRouter>,
    bookings: Arc<dyn BookingRepository>,
    locks: Arc<dyn KeyedLock>,
    notifier: Arc<dyn StatusChangeNotifier>,
    settlement: Arc<PaymentSettlementCoordinator>,
    responses: SupplierResponseProcessor,
    clock: Arc<dyn Clock>,
}

impl BookingEngine {
    pub fn builder(
        config: EngineConfig,
        bookings: Arc<dyn BookingRepository>,
        policies: Arc<dyn MarkupPolicyRepository>,
        converter: Arc<dyn CurrencyConverter>,
    ) -> BookingEngineBuilder {
        let router = ProviderRouter::new(config.retry.clone(), config.supplier_timeout());
        BookingEngineBuilder {
            config,
            router,
            bookings,
            policies,
            converter,
            locks: Arc::new(InProcessLocks::default()),
            notifier: Arc::new(BroadcastNotifier::default()),
            clock: Arc::new(SystemClock),
            gateways: Vec::new(),
        }
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    pub async fn availability(
        &self,
        supplier: Supplier,
        request: &AvailabilityRequest,
    ) -> Result<Availability, EngineError> {
        Ok(self.router.get_availability(supplier, request).await?)
    }

    #[instrument(skip_all, fields(agency = agent.agency_id.0, price = %supplier_price))]
    pub async fn quote(
        &self,
        supplier_price: Money,
        agent: &AgentContext,
    ) -> Result<PricedQuote, EngineError> {
        Ok(self.pricing.quote(supplier_price, agent).await?)
    }

    /// Re-checks the offer, prices it, books it with the supplier and stores
    /// the result. Nothing is stored unless the supplier gave an answer.
    #[instrument(skip_all, fields(supplier = %request.supplier, agency = agent.agency_id.0))]
    pub async fn book(
        &self,
        request: BookingRequest,
        agent: &AgentContext,
        actor: &str,
    ) -> Result<Booking, EngineError> {
        if request.rooms.is_empty() {
            return Err(EngineError::Validation("at least one room is required".to_string()));
        }
        let instrument = match (request.payment_type, &request.instrument) {
            (PaymentType::CreditCard, None) => {
                return Err(EngineError::Validation(
                    "card bookings need a payment instrument".to_string(),
                ))
            }
            (PaymentType::CreditCard, Some(instrument)) => Some(instrument),
            _ => None,
        };

        let now = self.clock.now();
        let supplier = request.supplier;

        let exact = self
            .router
            .get_exact_availability(
                supplier,
                &request.availability_id,
                &request.accommodation_id,
                &request.room_contract_set_id,
            )
            .await?;
        let deadline = self
            .router
            .get_deadline(supplier, &request.availability_id, &request.room_contract_set_id)
            .await?;
        let quote = self.pricing.quote(exact.room_contract_set.price, agent).await?;

        let check_in = start_of_day(exact.check_in);
        let check_out = start_of_day(exact.check_out);
        // Free cancellation can never outlast the stay itself
        let deadline_date = deadline
            .date
            .or(exact.room_contract_set.deadline)
            .map(|d| d.min(check_in));

        let reference_code = self.unused_reference_code(agent.agency_id).await?;
        debug!(%reference_code, price = %quote.final_price, "Booking priced");

        // Anything the store would refuse must be refused before money or the supplier move
        let mut new_booking = NewBooking {
            reference_code: reference_code.clone(),
            supplier,
            agency_id: agent.agency_id,
            agent_id: agent.agent_id,
            payment_type: request.payment_type,
            created: now,
            check_in,
            check_out,
            deadline: deadline_date,
            total_price: quote.final_price,
            applied_markups: quote.applied_markups,
            service_details: ServiceDetails::AccommodationV1(AccommodationService {
                accommodation_id: exact.accommodation_id,
                accommodation_name: exact.accommodation_name,
                room_contract_set_id: exact.room_contract_set.id,
                rooms: exact.room_contract_set.rooms,
                supplier_price: exact.room_contract_set.price,
                cancellation_policies: deadline.policies,
            }),
            booking_details: None,
            payment_hold: None,
        };
        new_booking.validate()?;

        let hold = match instrument {
            Some(instrument) => Some(
                self.settlement
                    .pre_authorize(
                        &reference_code,
                        request.payment_type,
                        quote.final_price,
                        instrument,
                        actor,
                        now,
                    )
                    .await?,
            ),
            None => None,
        };

        let supplier_request = SupplierBookingRequest {
            reference_code: reference_code.clone(),
            availability_id: request.availability_id,
            accommodation_id: request.accommodation_id,
            room_contract_set_id: request.room_contract_set_id,
            rooms: request.rooms,
            lead_guest: request.lead_guest,
            nationality: request.nationality,
            residency: request.residency,
        };

        let details = match self.router.book(supplier, &supplier_request).await {
            Ok(details) => details,
            Err(e) if e.is_ambiguous() => {
                // The supplier may hold a booking we never recorded.
                // The hold stays until reconciled.
                warn!(%reference_code, %supplier, problem = %e.problem, "Booking outcome unknown");
                return Err(e.into());
            }
            Err(e) => {
                info!(%reference_code, %supplier, problem = %e.problem, "Supplier did not book");
                if let Some(hold) = &hold {
                    if let Err(release) = self
                        .settlement
                        .release_hold(&reference_code, request.payment_type, hold, actor, now)
                        .await
                    {
                        error!(
                            %reference_code,
                            error = %release,
                            "Hold left in place after failed booking"
                        );
                    }
                }
                return Err(e.into());
            }
        };

        new_booking.booking_details = Some(details.clone());
        new_booking.payment_hold = hold;
        let booking = self.bookings.insert(new_booking).await.map_err(|source| {
            error!(
                %reference_code,
                %supplier,
                error = %source,
                "Supplier booked but the booking was not stored"
            );
            EngineError::Unrecorded {
                reference_code: reference_code.clone(),
                source,
            }
        })?;

        info!(
            %reference_code,
            booking_id = %booking.id,
            %supplier,
            price = %booking.total_price,
            "Booking created"
        );

        if details.status() == SupplierBookingStatus::Pending {
            return Ok(booking);
        }
        match self.responses.reconcile(supplier, details, actor, now).await {
            Ok(reconciled) => Ok(reconciled.into_booking()),
            Err(e) => {
                // The booking exists with the supplier and locally; a refresh finishes the job
                warn!(%reference_code, error = %e, "Booking stored but supplier status not applied");
                match self.bookings.get_by_reference(&reference_code).await {
                    Ok(Some(stored)) => Ok(stored),
                    _ => Ok(booking),
                }
            }
        }
    }

    async fn unused_reference_code(&self, agency: AgencyId) -> Result<ReferenceCode, EngineError> {
        let mut last = None;
        for _ in 0..REFERENCE_CODE_ATTEMPTS {
            let candidate = ReferenceCode::generate(&self.config.reference_code_prefix, agency);
            if self.bookings.get_by_reference(&candidate).await?.is_none() {
                return Ok(candidate);
            }
            debug!(reference_code = %candidate, "Reference code taken, regenerating");
            last = Some(candidate);
        }
        let taken = last.unwrap_or_else(|| {
            ReferenceCode::generate(&self.config.reference_code_prefix, agency)
        });
        Err(RepositoryError::DuplicateReference(taken).into())
    }

    async fn load(&self, reference_code: &ReferenceCode) -> Result<Booking, EngineError> {
        self.bookings
            .get_by_reference(reference_code)
            .await?
            .ok_or_else(|| EngineError::NotFound(reference_code.to_string()))
    }

    pub async fn get_booking(
        &self,
        reference_code: &ReferenceCode,
    ) -> Result<Booking, EngineError> {
        self.load(reference_code).await
    }

    /// Cancels with the supplier, then locally. Cancelling twice succeeds.
    #[instrument(skip_all, fields(reference_code = %reference_code))]
    pub async fn cancel_booking(
        &self,
        reference_code: &ReferenceCode,
        actor: &str,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        let booking = self.load(reference_code).await?;
        if booking.status() == BookingStatus::Cancelled {
            info!("Booking already cancelled");
            return self.void_stranded_hold(booking, actor, now).await;
        }

        // Refuse before the supplier hears about it
        BookingStateMachine::apply_status(&mut booking.clone(), StatusEvent::Cancel, now)?;

        // No lock across the supplier call; the transition below re-reads
        self.router
            .cancel_booking(booking.supplier, reference_code)
            .await?;

        self.transition(reference_code, StatusEvent::Cancel, actor, now).await
    }

    /// Drops a pending booking that was never committed with the supplier.
    #[instrument(skip_all, fields(reference_code = %reference_code))]
    pub async fn discard(
        &self,
        reference_code: &ReferenceCode,
        actor: &str,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        self.transition(reference_code, StatusEvent::Discard, actor, now).await
    }

    #[instrument(skip_all, fields(reference_code = %reference_code))]
    pub async fn reject(
        &self,
        reference_code: &ReferenceCode,
        actor: &str,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        self.transition(reference_code, StatusEvent::Reject, actor, now).await
    }

    async fn transition(
        &self,
        reference_code: &ReferenceCode,
        event: StatusEvent,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Booking, EngineError> {
        let lease = self.locks.acquire(reference_code.as_str()).await?;
        let mut booking = self.load(reference_code).await?;

        let (from, to) = match BookingStateMachine::apply_status(&mut booking, event, now)? {
            Transition::Status { from, to } => (from, to),
            _ => {
                drop(lease);
                return self.void_stranded_hold(booking, actor, now).await;
            }
        };

        let booking_id = booking.id;
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

        info!(%reference_code, %from, %to, actor, "Booking status changed");
        self.notifier
            .notify(StatusChangeEvent {
                booking_id,
                reference_code: reference_code.clone(),
                old_status: from,
                new_status: to,
                timestamp: now,
            })
            .await;

        self.void_stranded_hold(booking, actor, now).await
    }

    // The status change stays committed when the void fails; repeating the
    // operation or calling `void_if_needed` retries it.
    async fn void_stranded_hold(
        &self,
        booking: Booking,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Booking, EngineError> {
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
                    "Could not void funds after status change"
                );
                e.into()
            })
    }

    /// Releases the hold of a cancelled, rejected or discarded booking that still has one.
    #[instrument(skip_all, fields(reference_code = %reference_code))]
    pub async fn void_if_needed(
        &self,
        reference_code: &ReferenceCode,
        actor: &str,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        Ok(self.settlement.void_if_needed(reference_code, actor, now).await?)
    }

    /// Places a hold on an existing booking, e.g. a virtual-account booking after confirmation.
    #[instrument(skip_all, fields(reference_code = %reference_code))]
    pub async fn authorize(
        &self,
        reference_code: &ReferenceCode,
        instrument: &PaymentInstrument,
        actor: &str,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        Ok(self.settlement.authorize(reference_code, instrument, actor, now).await?)
    }

    #[instrument(skip_all, fields(bookings = booking_ids.len()))]
    pub async fn capture(&self, booking_ids: &[BookingId], actor: &str) -> CaptureReport {
        let now = self.clock.now();
        self.settlement.capture(booking_ids, actor, now).await
    }

    /// Captures every booking whose funds are due now.
    #[instrument(skip_all)]
    pub async fn capture_due(&self, actor: &str) -> Result<CaptureReport, EngineError> {
        let now = self.clock.now();
        let candidates = self.bookings.capture_candidates(now).await?;
        Ok(self.settlement.capture(&candidates, actor, now).await)
    }

    #[instrument(skip_all, fields(reference_code = %reference_code))]
    pub async fn refund(
        &self,
        reference_code: &ReferenceCode,
        actor: &str,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        Ok(self.settlement.refund(reference_code, actor, now).await?)
    }

    #[instrument(skip_all, fields(supplier = %supplier, bytes = payload.len()))]
    pub async fn process_async_response(
        &self,
        payload: Bytes,
        supplier: Supplier,
    ) -> Result<Reconciliation, EngineError> {
        let now = self.clock.now();
        Ok(self
            .responses
            .process_async_response(payload, supplier, now)
            .await?)
    }

    /// Pulls the supplier's current view of a booking and reconciles it.
    #[instrument(skip_all, fields(reference_code = %reference_code))]
    pub async fn refresh_status(
        &self,
        reference_code: &ReferenceCode,
        actor: &str,
    ) -> Result<Reconciliation, EngineError> {
        let now = self.clock.now();
        let booking = self.load(reference_code).await?;
        let details = self
            .router
            .get_booking_status(booking.supplier, reference_code)
            .await?;
        Ok(self
            .responses
            .reconcile(booking.supplier, details, actor, now)
            .await?)
    }

    pub async fn payment_log(&self, reference_code: &ReferenceCode) -> Result<Vec<PaymentAuditLogEntry>, EngineError> {
        Ok(self.bookings.payment_log(reference_code).await?)
    }

    pub async fn status_history(&self, reference_code: &ReferenceCode) -> Result<Vec<StatusHistoryEntry>, EngineError> {
        Ok(self.bookings.status_history(reference_code).await?)
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::{AgentId, CounterpartyId};
    use crate::conversion::RateTableConverter;
    use crate::markup::{MarkupFunction, MarkupPolicy, MarkupScope};
    use crate::money::Currency;
    use crate::repository::{InMemoryBookingStore, InMemoryMarkupPolicies, PaymentEvent};
    use crate::supplier::{ConnectorError, Operation, ProblemDetails, ProviderErrorKind};
    use crate::booking::InvalidBooking;
    use crate::locks::{LockError, LockLease};
    use crate::settlement::{PaymentError, SettlementError};
    use crate::test_support::{
        date, day, details_payload, instrument, FixedClock, ScriptedConnector, ScriptedGateway,
    };
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Times out the first `failures` acquisitions, then behaves like the in-process table.
    struct FlakyLocks {
        inner: InProcessLocks,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl KeyedLock for FlakyLocks {
        async fn acquire(&self, key: &str) -> Result<LockLease, LockError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(LockError::Timeout(key.to_string()));
            }
            self.inner.acquire(key).await
        }
    }

    struct Harness {
        engine: BookingEngine,
        store: Arc<InMemoryBookingStore>,
        supplier: Arc<ScriptedConnector>,
        gateway: Arc<ScriptedGateway>,
        clock: Arc<FixedClock>,
        notifier: Arc<BroadcastNotifier>,
    }

    fn agent() -> AgentContext {
        AgentContext {
            agent_id: AgentId(7),
            agency_id: AgencyId(3),
            counterparty_id: CounterpartyId(1),
            currency: Currency::Usd,
        }
    }

    fn percent(id: u64, scope: MarkupScope, value: &str) -> MarkupPolicy {
        MarkupPolicy {
            id,
            scope,
            function: MarkupFunction::Percent {
                value: Decimal::from_str(value).unwrap(),
            },
            priority: 0,
            description: String::new(),
        }
    }

    fn harness(supplier: Supplier) -> Harness {
        harness_with_locks(supplier, Arc::new(InProcessLocks::default()))
    }

    fn harness_with_locks(supplier: Supplier, locks: Arc<dyn KeyedLock>) -> Harness {
        let config = EngineConfig {
            supplier_timeout_ms: 100,
            payment_timeout_ms: 100,
            retry: crate::config::RetryConfig::no_retries(),
            ..EngineConfig::default()
        };
        let store = Arc::new(InMemoryBookingStore::new());
        let policies = Arc::new(InMemoryMarkupPolicies::with_policies(vec![
            percent(1, MarkupScope::Global, "5"),
            percent(2, MarkupScope::Agency(AgencyId(3)), "2"),
        ]));
        let connector = Arc::new(ScriptedConnector::new(supplier));
        let gateway = Arc::new(ScriptedGateway::new());
        let clock = Arc::new(FixedClock::new(date(2021, 11, 20)));
        let notifier = Arc::new(BroadcastNotifier::default());

        let engine = BookingEngine::builder(config, store.clone(), policies, Arc::new(RateTableConverter::new()))
            .connector(connector.clone())
            .gateway(PaymentType::CreditCard, gateway.clone())
            .gateway(PaymentType::VirtualAccount, gateway.clone())
            .clock(clock.clone())
            .notifier(notifier.clone())
            .locks(locks)
            .build();

        Harness {
            engine,
            store,
            supplier: connector,
            gateway,
            clock,
            notifier,
        }
    }

    fn request(supplier: Supplier, payment_type: PaymentType) -> BookingRequest {
        BookingRequest {
            supplier,
            availability_id: "AV-1".to_string(),
            accommodation_id: "ACC-1".to_string(),
            room_contract_set_id: "RCS-1".to_string(),
            rooms: vec![RoomOccupancy {
                adults: 2,
                children_ages: vec![],
            }],
            lead_guest: "Jane Doe".to_string(),
            nationality: "GB".to_string(),
            residency: "GB".to_string(),
            payment_type,
            instrument: (payment_type == PaymentType::CreditCard).then(instrument),
        }
    }

    #[tokio::test]
    async fn test_card_booking_is_priced_authorized_and_confirmed() {
        let h = harness(Supplier::Illusions);
        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap();

        assert_eq!(booking.status(), BookingStatus::Confirmed);
        assert_eq!(booking.payment_status(), PaymentStatus::Authorized);
        assert_eq!(booking.total_price.amount, Decimal::from_str("107.09").unwrap());
        assert_eq!(booking.applied_markups.len(), 2);
        assert_eq!(booking.deadline, Some(date(2021, 12, 8)));
        assert_eq!(booking.check_in, date(2021, 12, 10));
        assert!(booking.reference_code.as_str().starts_with("HTL-0003-"));

        let log = h.engine.payment_log(&booking.reference_code).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].event, PaymentEvent::Authorize);
        assert_eq!(log[0].amount, booking.total_price);

        let history = h.engine.status_history(&booking.reference_code).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_card_booking_without_instrument_is_invalid() {
        let h = harness(Supplier::Illusions);
        let mut req = request(Supplier::Illusions, PaymentType::CreditCard);
        req.instrument = None;

        let result = h.engine.book(req, &agent(), "agent-7").await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert_eq!(h.supplier.calls(Operation::Book), 0);
    }

    #[tokio::test]
    async fn test_book_timeout_is_ambiguous_and_stores_nothing() {
        let h = harness(Supplier::Illusions);
        h.supplier.set_book_delay(Duration::from_millis(500));

        let error = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap_err();

        assert!(error.is_ambiguous());
        assert!(matches!(&error, EngineError::Provider(e) if e.kind == ProviderErrorKind::Ambiguous));
        assert!(h.store.is_empty());
        assert_eq!(h.supplier.calls(Operation::Book), 1);
        // Outcome unknown: the hold is not released blindly
        assert_eq!(h.gateway.calls(PaymentEvent::Void), 0);
    }

    #[tokio::test]
    async fn test_definite_rejection_releases_the_hold() {
        let h = harness(Supplier::Illusions);
        h.supplier.fail_book(ConnectorError::Rejected(ProblemDetails::new(
            "Sold out",
            "No rooms left",
            Some(409),
        )));

        let error = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap_err();

        assert!(!error.is_ambiguous());
        assert!(matches!(&error, EngineError::Provider(e) if e.kind == ProviderErrorKind::Definite));
        assert!(h.store.is_empty());
        assert_eq!(h.gateway.calls(PaymentEvent::Authorize), 1);
        assert_eq!(h.gateway.calls(PaymentEvent::Void), 1);
    }

    #[tokio::test]
    async fn test_supplier_reported_rejection_is_recorded_and_voided() {
        let h = harness(Supplier::Illusions);
        h.supplier.set_book_status(SupplierBookingStatus::Rejected);

        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap();

        assert_eq!(booking.status(), BookingStatus::Rejected);
        assert_eq!(booking.payment_status(), PaymentStatus::Voided);
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_unanswered_pre_authorization_never_reaches_the_supplier() {
        let h = harness(Supplier::Illusions);
        h.gateway.set_delay(Duration::from_millis(500));

        let error = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap_err();
        assert!(error.is_ambiguous());
        assert_eq!(h.supplier.calls(Operation::Book), 0);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_twice_transitions_once() {
        let h = harness(Supplier::Illusions);
        let mut events = h.notifier.subscribe();
        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap();
        let _confirmed = events.recv().await.unwrap();

        let first = h.engine.cancel_booking(&booking.reference_code, "agent-7").await.unwrap();
        let second = h.engine.cancel_booking(&booking.reference_code, "agent-7").await.unwrap();

        assert_eq!(first.status(), BookingStatus::Cancelled);
        assert_eq!(second.status(), BookingStatus::Cancelled);
        assert_eq!(first.payment_status(), PaymentStatus::Voided);
        assert_eq!(second.version(), first.version());
        assert_eq!(h.supplier.calls(Operation::CancelBooking), 1);

        let cancelled = events.recv().await.unwrap();
        assert_eq!(cancelled.old_status, BookingStatus::Confirmed);
        assert_eq!(cancelled.new_status, BookingStatus::Cancelled);
        assert!(events.try_recv().is_err());

        let history = h.engine.status_history(&booking.reference_code).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_capture_due_after_deadline_only_confirmed() {
        let h = harness(Supplier::Illusions);
        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap();

        // Before the 2021-12-08 deadline nothing is due
        h.clock.set(date(2021, 12, 7));
        let report = h.engine.capture_due("batch").await.unwrap();
        assert_eq!(report.total(), 0);

        h.clock.set(date(2021, 12, 8));
        let report = h.engine.capture_due("batch").await.unwrap();
        assert_eq!(report.succeeded, vec![booking.id]);

        let stored = h.engine.get_booking(&booking.reference_code).await.unwrap();
        assert_eq!(stored.payment_status(), PaymentStatus::Captured);
        assert_eq!(stored.status(), BookingStatus::Confirmed);

        // Rerun of the batch is harmless
        let rerun = h.engine.capture(&[booking.id], "batch").await;
        assert_eq!(rerun.succeeded, vec![booking.id]);
        assert_eq!(h.gateway.calls(PaymentEvent::Capture), 1);
    }

    #[tokio::test]
    async fn test_async_supplier_confirms_by_webhook() {
        let h = harness(Supplier::Netstorming);
        h.supplier.set_book_status(SupplierBookingStatus::Pending);

        let booking = h
            .engine
            .book(request(Supplier::Netstorming, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap();
        assert_eq!(booking.status(), BookingStatus::Pending);
        assert_eq!(booking.payment_status(), PaymentStatus::Authorized);

        let payload = details_payload(booking.reference_code.as_str(), SupplierBookingStatus::Confirmed);
        let first = h
            .engine
            .process_async_response(payload.clone(), Supplier::Netstorming)
            .await
            .unwrap();
        assert_eq!(first.booking().status(), BookingStatus::Confirmed);

        let again = h
            .engine
            .process_async_response(payload, Supplier::Netstorming)
            .await
            .unwrap();
        assert!(matches!(again, Reconciliation::Unchanged(_)));
    }

    #[tokio::test]
    async fn test_refresh_reconciles_supplier_cancellation() {
        let h = harness(Supplier::Illusions);
        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap();

        h.supplier.set_reported_status(SupplierBookingStatus::Cancelled);
        let reconciled = h
            .engine
            .refresh_status(&booking.reference_code, "refresh-job")
            .await
            .unwrap();

        let booking = reconciled.into_booking();
        assert_eq!(booking.status(), BookingStatus::Cancelled);
        assert_eq!(booking.payment_status(), PaymentStatus::Voided);
    }

    #[tokio::test]
    async fn test_virtual_account_authorizes_after_confirmation() {
        let h = harness(Supplier::Illusions);
        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::VirtualAccount), &agent(), "agent-7")
            .await
            .unwrap();
        assert_eq!(booking.status(), BookingStatus::Confirmed);
        assert_eq!(booking.payment_status(), PaymentStatus::NotPaid);
        assert_eq!(h.gateway.calls(PaymentEvent::Authorize), 0);

        let authorized = h
            .engine
            .authorize(&booking.reference_code, &instrument(), "agent-7")
            .await
            .unwrap();
        assert_eq!(authorized.payment_status(), PaymentStatus::Authorized);
    }

    #[tokio::test]
    async fn test_discard_only_while_pending() {
        let h = harness(Supplier::Illusions);
        let confirmed = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::Offline), &agent(), "agent-7")
            .await
            .unwrap();

        let result = h.engine.discard(&confirmed.reference_code, "admin").await;
        assert!(matches!(result, Err(EngineError::Transition(_))));

        h.supplier.set_book_status(SupplierBookingStatus::Pending);
        let pending = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::Offline), &agent(), "agent-7")
            .await
            .unwrap();
        let discarded = h.engine.discard(&pending.reference_code, "admin").await.unwrap();
        assert_eq!(discarded.status(), BookingStatus::Discarded);
        assert_eq!(discarded.payment_status(), PaymentStatus::NotPaid);
    }

    #[tokio::test]
    async fn test_cancel_of_pending_booking_is_refused_before_supplier_call() {
        let h = harness(Supplier::Illusions);
        h.supplier.set_book_status(SupplierBookingStatus::Pending);
        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::Offline), &agent(), "agent-7")
            .await
            .unwrap();

        let result = h.engine.cancel_booking(&booking.reference_code, "agent-7").await;
        assert!(matches!(result, Err(EngineError::Transition(_))));
        assert_eq!(h.supplier.calls(Operation::CancelBooking), 0);
    }

    #[tokio::test]
    async fn test_storage_outage_surfaces_without_partial_writes() {
        let h = harness(Supplier::Illusions);
        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::Offline), &agent(), "agent-7")
            .await
            .unwrap();

        h.store.set_unavailable(true);
        let result = h.engine.cancel_booking(&booking.reference_code, "agent-7").await;
        assert!(matches!(result, Err(EngineError::Storage(RepositoryError::Unavailable(_)))));

        h.store.set_unavailable(false);
        let stored = h.engine.get_booking(&booking.reference_code).await.unwrap();
        assert_eq!(stored.status(), BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_refund_after_cancellation_of_captured_booking() {
        let h = harness(Supplier::Illusions);
        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap();
        h.clock.set(date(2021, 12, 9));
        h.engine.capture(&[booking.id], "batch").await;

        let cancelled = h.engine.cancel_booking(&booking.reference_code, "agent-7").await.unwrap();
        // Captured funds are not voided by a cancellation
        assert_eq!(cancelled.payment_status(), PaymentStatus::Captured);

        let refunded = h.engine.refund(&booking.reference_code, "finance").await.unwrap();
        assert_eq!(refunded.payment_status(), PaymentStatus::Refunded);

        let events: Vec<PaymentEvent> = h
            .engine
            .payment_log(&booking.reference_code)
            .await
            .unwrap()
            .iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(
            events,
            vec![PaymentEvent::Authorize, PaymentEvent::Capture, PaymentEvent::Refund]
        );
    }

    #[tokio::test]
    async fn test_failed_void_on_cancel_is_reported_and_retried() {
        let h = harness(Supplier::Illusions);
        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap();
        h.gateway.fail_for(
            &booking.reference_code,
            PaymentEvent::Void,
            PaymentError::Declined("issuer unavailable".to_string()),
        );

        let error = h
            .engine
            .cancel_booking(&booking.reference_code, "agent-7")
            .await
            .unwrap_err();
        assert!(matches!(
            &error,
            EngineError::Settlement(SettlementError::Payment(PaymentError::Declined(reason)))
                if reason == "issuer unavailable"
        ));
        let stored = h.engine.get_booking(&booking.reference_code).await.unwrap();
        assert_eq!(stored.status(), BookingStatus::Cancelled);
        assert_eq!(stored.payment_status(), PaymentStatus::Authorized);

        let again = h.engine.cancel_booking(&booking.reference_code, "agent-7").await.unwrap();
        assert_eq!(again.status(), BookingStatus::Cancelled);
        assert_eq!(again.payment_status(), PaymentStatus::Voided);
        assert_eq!(h.supplier.calls(Operation::CancelBooking), 1);
        assert_eq!(h.gateway.calls(PaymentEvent::Void), 2);

        let report = h.engine.capture(&[booking.id], "batch").await;
        assert!(report.succeeded.is_empty());
        assert_eq!(h.gateway.calls(PaymentEvent::Capture), 0);

        let events: Vec<PaymentEvent> = h
            .engine
            .payment_log(&booking.reference_code)
            .await
            .unwrap()
            .iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(
            events,
            vec![PaymentEvent::Authorize, PaymentEvent::Void, PaymentEvent::Void]
        );
    }

    #[tokio::test]
    async fn test_hold_left_by_discard_is_released_on_demand() {
        let h = harness(Supplier::Illusions);
        h.supplier.set_book_status(SupplierBookingStatus::Pending);
        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap();
        h.gateway.fail_for(
            &booking.reference_code,
            PaymentEvent::Void,
            PaymentError::Ambiguous("gateway timeout".to_string()),
        );

        let error = h.engine.discard(&booking.reference_code, "admin").await.unwrap_err();
        assert!(error.is_ambiguous());

        let voided = h.engine.void_if_needed(&booking.reference_code, "admin").await.unwrap();
        assert_eq!(voided.status(), BookingStatus::Discarded);
        assert_eq!(voided.payment_status(), PaymentStatus::Voided);

        // Nothing left to release
        let again = h.engine.void_if_needed(&booking.reference_code, "admin").await.unwrap();
        assert_eq!(again.version(), voided.version());
        assert_eq!(h.gateway.calls(PaymentEvent::Void), 2);
    }

    #[tokio::test]
    async fn test_repeated_reject_retries_a_failed_void() {
        let h = harness(Supplier::Illusions);
        h.supplier.set_book_status(SupplierBookingStatus::Pending);
        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap();
        h.gateway.fail_for(
            &booking.reference_code,
            PaymentEvent::Void,
            PaymentError::Declined("try again later".to_string()),
        );

        assert!(h.engine.reject(&booking.reference_code, "admin").await.is_err());
        let rejected = h.engine.reject(&booking.reference_code, "admin").await.unwrap();
        assert_eq!(rejected.status(), BookingStatus::Rejected);
        assert_eq!(rejected.payment_status(), PaymentStatus::Voided);

        let history = h.engine.status_history(&booking.reference_code).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_stored_booking_is_returned_when_status_cannot_be_applied() {
        let locks = Arc::new(FlakyLocks {
            inner: InProcessLocks::new(Duration::from_millis(50)),
            failures: AtomicUsize::new(1),
        });
        let h = harness_with_locks(Supplier::Illusions, locks);

        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::Offline), &agent(), "agent-7")
            .await
            .unwrap();
        assert_eq!(booking.status(), BookingStatus::Pending);
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.supplier.calls(Operation::Book), 1);

        let refreshed = h
            .engine
            .refresh_status(&booking.reference_code, "refresh-job")
            .await
            .unwrap();
        assert!(matches!(
            refreshed,
            Reconciliation::Applied { from: BookingStatus::Pending, to: BookingStatus::Confirmed, .. }
        ));
    }

    #[tokio::test]
    async fn test_store_outage_after_supplier_booked_is_ambiguous() {
        let h = harness(Supplier::Illusions);
        let req = request(Supplier::Illusions, PaymentType::Offline);

        // Reference lookup succeeds, the insert after the supplier call does not
        let store = h.store.clone();
        let supplier = h.supplier.clone();
        let outage = tokio::spawn(async move {
            while supplier.calls(Operation::Book) == 0 {
                tokio::task::yield_now().await;
            }
            store.set_unavailable(true);
        });
        h.supplier.set_book_delay(Duration::from_millis(20));

        let error = h.engine.book(req, &agent(), "agent-7").await.unwrap_err();
        outage.await.unwrap();

        assert!(error.is_ambiguous());
        assert!(matches!(error, EngineError::Unrecorded { .. }));
        h.store.set_unavailable(false);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_impossible_stay_is_refused_before_payment_and_supplier() {
        let h = harness(Supplier::Illusions);
        h.supplier.set_stay(day(2021, 12, 12), day(2021, 12, 12));

        let error = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            EngineError::InvalidBooking(InvalidBooking::CheckOutBeforeCheckIn { .. })
        ));
        assert_eq!(h.gateway.calls(PaymentEvent::Authorize), 0);
        assert_eq!(h.supplier.calls(Operation::Book), 0);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_supplier_deadline_after_check_in_is_clamped() {
        let h = harness(Supplier::Illusions);
        h.supplier.set_deadline(Some(date(2021, 12, 15)));

        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::Offline), &agent(), "agent-7")
            .await
            .unwrap();
        assert_eq!(booking.deadline, Some(date(2021, 12, 10)));
    }

    #[tokio::test]
    async fn test_concurrent_capture_and_cancel_commit_one_consistent_outcome() {
        let h = harness(Supplier::Illusions);
        let booking = h
            .engine
            .book(request(Supplier::Illusions, PaymentType::CreditCard), &agent(), "agent-7")
            .await
            .unwrap();
        h.clock.set(date(2021, 12, 9));
        h.gateway.set_delay(Duration::from_millis(20));

        let ids = [booking.id];
        let (report, cancelled) = tokio::join!(
            h.engine.capture(&ids, "batch"),
            h.engine.cancel_booking(&booking.reference_code, "agent-7"),
        );

        let cancelled = cancelled.unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(cancelled.status(), BookingStatus::Cancelled);

        let stored = h.engine.get_booking(&booking.reference_code).await.unwrap();
        assert_eq!(stored, cancelled);

        let events: Vec<PaymentEvent> = h
            .engine
            .payment_log(&booking.reference_code)
            .await
            .unwrap()
            .iter()
            .map(|e| e.event)
            .collect();
        match stored.payment_status() {
            PaymentStatus::Captured => {
                assert_eq!(report.succeeded, vec![booking.id]);
                assert_eq!(events, vec![PaymentEvent::Authorize, PaymentEvent::Capture]);
            }
            PaymentStatus::Voided => {
                assert_eq!(report.skipped.len(), 1);
                assert_eq!(events, vec![PaymentEvent::Authorize, PaymentEvent::Void]);
            }
            other => panic!("unexpected payment status {}", other),
        }

        let history = h.engine.status_history(&booking.reference_code).await.unwrap();
        let transitions: Vec<(BookingStatus, BookingStatus)> =
            history.iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(
            transitions,
            vec![
                (BookingStatus::Pending, BookingStatus::Confirmed),
                (BookingStatus::Confirmed, BookingStatus::Cancelled),
            ]
        );
    }
}
