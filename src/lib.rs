// Booking lifecycle and payment settlement engine for accommodation suppliers

pub mod booking;
pub mod config;
pub mod conversion;
pub mod engine;
pub mod error;
pub mod locks;
pub mod markup;
pub mod money;
pub mod notifications;
pub mod repository;
pub mod settlement;
pub mod supplier;
pub mod supplier_response;

#[cfg(test)]
mod test_support;

// Re-export key types for convenience
pub use booking::{
    Booking, BookingDetails, BookingId, BookingStateMachine, BookingStatus, NewBooking,
    PaymentStatus, PaymentType, ReferenceCode, ServiceDetails, TransitionError,
};
pub use config::{EngineConfig, RetryConfig};
pub use conversion::{CurrencyConverter, RateTableConverter};
pub use engine::{BookingEngine, BookingEngineBuilder, BookingRequest, Clock, SystemClock};
pub use error::EngineError;
pub use locks::{InProcessLocks, KeyedLock};
pub use markup::{
    AgentContext, AppliedMarkup, MarkupFunction, MarkupPolicy, MarkupPricingPipeline, MarkupScope,
    PricedQuote,
};
pub use money::{Currency, Money};
pub use notifications::{BroadcastNotifier, StatusChangeEvent, StatusChangeNotifier};
pub use repository::{
    BookingRepository, InMemoryBookingStore, InMemoryMarkupPolicies, MarkupPolicyRepository,
    PaymentAuditLogEntry, StatusHistoryEntry,
};
pub use settlement::{
    CaptureReport, PaymentError, PaymentGateway, PaymentInstrument, PaymentSettlementCoordinator,
};
pub use supplier::http::{HttpConnectorConfig, HttpSupplierConnector};
pub use supplier::{ProblemDetails, ProviderError, ProviderRouter, Supplier, SupplierConnector};
pub use supplier_response::{Reconciliation, ReconciliationError, SupplierResponseProcessor};
