//! Notifications to offer parties
//!
//! Delivery (push, email, in-app) belongs to another service. The lifecycle
//! hands every notification to a [`Notifier`]; the default one emits it as a
//! structured log event for the delivery pipeline to pick up.

use serde::Serialize;

use crate::models::{OfferId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    OfferReceived,
    OfferCountered,
    OfferAccepted,
    OfferRejected,
    OfferWithdrawn,
    OfferExpired,
    /// A listing the offer involved went to another trade.
    OfferSuperseded,
    TimerExtended,
    DownpaymentPaid,
    DownpaymentConfirmed,
    TradeConfirmed,
    TradeCompleted,
    DealLocked,
    PickupAttemptsExhausted,
    DisputeRaised,
    DisputeResolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipient: UserId,
    pub offer_id: OfferId,
    pub kind: NotificationKind,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Emits notifications on the `notifications` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        tracing::info!(
            target: "notifications",
            recipient = %notification.recipient,
            offer_id = %notification.offer_id,
            kind = ?notification.kind,
            "Notification queued"
        );
    }
}
