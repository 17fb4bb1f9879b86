//! Background expiry sweep
//!
//! Expiry is already enforced lazily on every read and transition. The sweep
//! only writes `expired` into overdue records so stored state, listings and
//! notifications catch up without waiting for someone to touch the offer.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::offers::OfferService;

pub fn spawn(offers: Arc<OfferService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match offers.expire_overdue(Utc::now()).await {
                Ok(0) => {}
                Ok(count) => info!(count, "Expired overdue offers"),
                Err(e) => warn!(error = %e, "Expiry sweep failed"),
            }
        }
    })
}
