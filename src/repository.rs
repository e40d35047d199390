// Persistence capabilities the engine consumes, plus in-memory implementations

use crate::booking::{
    Booking, BookingId, BookingStateMachine, BookingStatus, InvalidBooking, NewBooking,
    ReferenceCode,
};
use crate::markup::{AgentContext, MarkupPolicy};
use crate::money::Money;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Reference code {0} is already taken")]
    DuplicateReference(ReferenceCode),

    #[error("Booking {reference_code} changed concurrently (expected version {expected}, found {found})")]
    Conflict {
        reference_code: ReferenceCode,
        expected: u64,
        found: u64,
    },

    #[error("Booking {0} not found")]
    NotFound(String),

    #[error("Invalid booking record: {0}")]
    Invalid(#[from] InvalidBooking),

    #[error("Storage unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PaymentEvent {
    Authorize,
    Capture,
    Void,
    Refund,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "camelCase")]
pub enum AuditOutcome {
    Succeeded,
    Declined(String),
    /// The gateway call failed without telling us whether it took effect.
    Unknown(String),
}

/// Append-only record of a payment attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAuditLogEntry {
    pub reference_code: ReferenceCode,
    pub event: PaymentEvent,
    pub outcome: AuditOutcome,
    pub amount: Money,
    pub amount_in_reference: Option<Money>,
    pub masked_instrument: String,
    pub gateway_reference: Option<String>,
    pub acting_user: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub booking_id: BookingId,
    pub reference_code: ReferenceCode,
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

/// One atomic write: the booking as transitioned plus its audit rows.
/// `booking.version()` is the version the change was computed from.
#[derive(Debug, Clone)]
pub struct BookingChange {
    pub booking: Booking,
    pub status_change: Option<StatusHistoryEntry>,
    pub payment_entries: Vec<PaymentAuditLogEntry>,
}

impl BookingChange {
    pub fn new(booking: Booking) -> Self {
        Self {
            booking,
            status_change: None,
            payment_entries: Vec::new(),
        }
    }

    pub fn with_status_change(mut self, entry: StatusHistoryEntry) -> Self {
        self.status_change = Some(entry);
        self
    }

    pub fn with_payment_entry(mut self, entry: PaymentAuditLogEntry) -> Self {
        self.payment_entries.push(entry);
        self
    }
}

#[async_trait]
pub trait BookingRepository: Send + Sync + 'static {
    /// Persists a new booking; fails with `DuplicateReference` if the code is taken.
    async fn insert(&self, booking: NewBooking) -> Result<Booking, RepositoryError>;

    async fn get(&self, id: BookingId) -> Result<Option<Booking>, RepositoryError>;

    async fn get_by_reference(
        &self,
        reference_code: &ReferenceCode,
    ) -> Result<Option<Booking>, RepositoryError>;

    /// Writes the change atomically, or nothing at all on a version conflict.
    async fn commit(&self, change: BookingChange) -> Result<Booking, RepositoryError>;

    async fn append_payment_entry(&self, entry: PaymentAuditLogEntry) -> Result<(), RepositoryError>;

    async fn payment_log(
        &self,
        reference_code: &ReferenceCode,
    ) -> Result<Vec<PaymentAuditLogEntry>, RepositoryError>;

    async fn status_history(
        &self,
        reference_code: &ReferenceCode,
    ) -> Result<Vec<StatusHistoryEntry>, RepositoryError>;

    /// Ids of bookings whose authorized funds are due for capture at `now`.
    async fn capture_candidates(&self, now: DateTime<Utc>) -> Result<Vec<BookingId>, RepositoryError>;
}

#[async_trait]
pub trait MarkupPolicyRepository: Send + Sync + 'static {
    /// Policies that may apply to the agent; ordering is the pipeline's job.
    async fn policies_for(&self, agent: &AgentContext) -> Result<Vec<MarkupPolicy>, RepositoryError>;
}

#[derive(Default)]
struct StoreInner {
    bookings: BTreeMap<BookingId, Booking>,
    by_reference: HashMap<ReferenceCode, BookingId>,
    payment_log: Vec<PaymentAuditLogEntry>,
    status_history: Vec<StatusHistoryEntry>,
    next_id: u64,
}

#[derive(Default)]
pub struct InMemoryBookingStore {
    inner: RwLock<StoreInner>,
    unavailable: AtomicBool,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.read().bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RepositoryError::Unavailable(anyhow::anyhow!(
                "in-memory store is marked unavailable"
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BookingRepository for InMemoryBookingStore {
    async fn insert(&self, booking: NewBooking) -> Result<Booking, RepositoryError> {
        self.ensure_available()?;
        let mut inner = self.inner.write();

        if inner.by_reference.contains_key(&booking.reference_code) {
            return Err(RepositoryError::DuplicateReference(booking.reference_code));
        }

        let id = BookingId(inner.next_id + 1);
        let booking = Booking::create(id, booking)?;
        inner.next_id = id.0;
        inner.by_reference.insert(booking.reference_code.clone(), id);
        inner.bookings.insert(id, booking.clone());
        Ok(booking)
    }

    async fn get(&self, id: BookingId) -> Result<Option<Booking>, RepositoryError> {
        self.ensure_available()?;
        Ok(self.inner.read().bookings.get(&id).cloned())
    }

    async fn get_by_reference(
        &self,
        reference_code: &ReferenceCode,
    ) -> Result<Option<Booking>, RepositoryError> {
        self.ensure_available()?;
        let inner = self.inner.read();
        Ok(inner
            .by_reference
            .get(reference_code)
            .and_then(|id| inner.bookings.get(id))
            .cloned())
    }

    async fn commit(&self, change: BookingChange) -> Result<Booking, RepositoryError> {
        self.ensure_available()?;
        let mut inner = self.inner.write();

        let mut booking = change.booking;
        let current = inner
            .bookings
            .get(&booking.id)
            .ok_or_else(|| RepositoryError::NotFound(booking.reference_code.to_string()))?;

        if current.version() != booking.version() {
            return Err(RepositoryError::Conflict {
                reference_code: booking.reference_code.clone(),
                expected: booking.version(),
                found: current.version(),
            });
        }

        BookingStateMachine::bump_version(&mut booking);
        inner.bookings.insert(booking.id, booking.clone());
        if let Some(entry) = change.status_change {
            inner.status_history.push(entry);
        }
        inner.payment_log.extend(change.payment_entries);
        Ok(booking)
    }

    async fn append_payment_entry(&self, entry: PaymentAuditLogEntry) -> Result<(), RepositoryError> {
        self.ensure_available()?;
        self.inner.write().payment_log.push(entry);
        Ok(())
    }

    async fn payment_log(
        &self,
        reference_code: &ReferenceCode,
    ) -> Result<Vec<PaymentAuditLogEntry>, RepositoryError> {
        self.ensure_available()?;
        Ok(self
            .inner
            .read()
            .payment_log
            .iter()
            .filter(|e| &e.reference_code == reference_code)
            .cloned()
            .collect())
    }

    async fn status_history(
        &self,
        reference_code: &ReferenceCode,
    ) -> Result<Vec<StatusHistoryEntry>, RepositoryError> {
        self.ensure_available()?;
        Ok(self
            .inner
            .read()
            .status_history
            .iter()
            .filter(|e| &e.reference_code == reference_code)
            .cloned()
            .collect())
    }

    async fn capture_candidates(&self, now: DateTime<Utc>) -> Result<Vec<BookingId>, RepositoryError> {
        self.ensure_available()?;
        Ok(self
            .inner
            .read()
            .bookings
            .values()
            .filter(|b| b.is_capture_candidate(now))
            .map(|b| b.id)
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryMarkupPolicies {
    policies: RwLock<Vec<MarkupPolicy>>,
}

impl InMemoryMarkupPolicies {
    pub fn with_policies(policies: Vec<MarkupPolicy>) -> Self {
        Self {
            policies: RwLock::new(policies),
        }
    }

    pub fn add(&self, policy: MarkupPolicy) {
        self.policies.write().push(policy);
    }
}

#[async_trait]
impl MarkupPolicyRepository for InMemoryMarkupPolicies {
    async fn policies_for(&self, agent: &AgentContext) -> Result<Vec<MarkupPolicy>, RepositoryError> {
        Ok(self
            .policies
            .read()
            .iter()
            .filter(|p| p.scope.applies_to(agent))
            .cloned()
            .collect())
    }
}
