// Booking status change notifications

use crate::booking::{BookingId, BookingStatus, ReferenceCode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    pub booking_id: BookingId,
    pub reference_code: ReferenceCode,
    pub old_status: BookingStatus,
    pub new_status: BookingStatus,
    pub timestamp: DateTime<Utc>,
}

/// Receives an event after each committed status change. Delivery failures
/// are the notifier's problem; they never roll back the booking.
#[async_trait]
pub trait StatusChangeNotifier: Send + Sync + 'static {
    async fn notify(&self, event: StatusChangeEvent);
}

pub struct BroadcastNotifier {
    sender: broadcast::Sender<StatusChangeEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl StatusChangeNotifier for BroadcastNotifier {
    async fn notify(&self, event: StatusChangeEvent) {
        let reference_code = event.reference_code.clone();
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            debug!(%reference_code, "No subscribers for status change");
        }
    }
}
