//! Persistence for offers, listings and seller settings
//!
//! The offer service only relies on the contract of [`OfferStore`]; any
//! backend providing an atomic conditional update per offer can stand behind
//! it. [`MemoryStore`] is the in-process implementation the server runs with.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::lifecycle::OfferStatus;
use crate::models::{BrandSettings, Listing, ListingId, Offer, OfferId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer changed the offer since it was read.
    #[error("offer {offer_id} was modified concurrently (expected version {expected_version})")]
    Conflict {
        offer_id: OfferId,
        expected_version: u64,
    },

    #[error("offer not found: {0}")]
    OfferNotFound(OfferId),

    #[error("listing not found: {0}")]
    ListingNotFound(ListingId),

    /// The listing already went to another trade.
    #[error("listing {0} is no longer available")]
    ListingUnavailable(ListingId),

    #[error("record already exists: {0}")]
    Duplicate(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Storage contract for the offer lifecycle.
///
/// ## Conditional updates
///
/// `update_offer` must behave like
/// `UPDATE offers SET ... WHERE id = ? AND version = expected_version`:
/// it writes only when the stored version still equals `expected_version`,
/// stores the record with the version incremented, and otherwise fails with
/// [`StoreError::Conflict`] leaving the record untouched. This is the only
/// serialization point between concurrent requests on the same offer.
#[async_trait]
pub trait OfferStore: Send + Sync + 'static {
    /// Insert a new offer. Fails with `Duplicate` if the id is taken.
    async fn insert_offer(&self, offer: Offer) -> Result<(), StoreError>;

    async fn get_offer(&self, id: OfferId) -> Result<Option<Offer>, StoreError>;

    /// Offers where `user_id` is buyer or seller, newest first.
    async fn list_offers_for(&self, user_id: &str) -> Result<Vec<Offer>, StoreError>;

    /// All offers, optionally only those stored with `status`, newest first.
    async fn list_offers(&self, status: Option<OfferStatus>) -> Result<Vec<Offer>, StoreError>;

    /// Conditionally replace an offer. Returns the stored record.
    async fn update_offer(&self, offer: Offer, expected_version: u64) -> Result<Offer, StoreError>;

    async fn insert_listing(&self, listing: Listing) -> Result<(), StoreError>;

    async fn get_listing(&self, id: ListingId) -> Result<Option<Listing>, StoreError>;

    /// Atomically mark the listing sold to `offer_id` and close it to offers.
    /// Succeeds again for the same offer; fails with `ListingUnavailable`
    /// if another offer holds it or it was closed.
    async fn claim_listing(&self, id: ListingId, offer_id: OfferId) -> Result<(), StoreError>;

    /// Undo a claim made by `offer_id`. Claims held by other offers stay.
    async fn release_listing(&self, id: ListingId, offer_id: OfferId) -> Result<(), StoreError>;

    /// Failed pickup PIN entries for an offer. Kept apart from the offer
    /// record, which a rejected attempt must not change.
    async fn pin_failures(&self, offer_id: OfferId) -> Result<u32, StoreError>;

    /// Count one more failed PIN entry and return the new total.
    async fn record_pin_failure(&self, offer_id: OfferId) -> Result<u32, StoreError>;

    async fn get_brand_settings(&self, seller_id: &str)
        -> Result<Option<BrandSettings>, StoreError>;

    async fn put_brand_settings(&self, settings: BrandSettings) -> Result<(), StoreError>;
}

/// In-memory store backed by concurrent maps.
///
/// Conditional updates run under the map's per-key write lock, so the version
/// check and the write are a single step.
#[derive(Default)]
pub struct MemoryStore {
    offers: DashMap<OfferId, Offer>,
    listings: DashMap<ListingId, Listing>,
    brand_settings: DashMap<UserId, BrandSettings>,
    pin_failures: DashMap<OfferId, u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn newest_first(mut offers: Vec<Offer>) -> Vec<Offer> {
        offers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        offers
    }
}

#[async_trait]
impl OfferStore for MemoryStore {
    async fn insert_offer(&self, offer: Offer) -> Result<(), StoreError> {
        match self.offers.entry(offer.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("offer {}", offer.id))),
            Entry::Vacant(slot) => {
                slot.insert(offer);
                Ok(())
            }
        }
    }

    async fn get_offer(&self, id: OfferId) -> Result<Option<Offer>, StoreError> {
        Ok(self.offers.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list_offers_for(&self, user_id: &str) -> Result<Vec<Offer>, StoreError> {
        let offers = self
            .offers
            .iter()
            .filter(|entry| entry.buyer_id == user_id || entry.seller_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        Ok(Self::newest_first(offers))
    }

    async fn list_offers(&self, status: Option<OfferStatus>) -> Result<Vec<Offer>, StoreError> {
        let offers = self
            .offers
            .iter()
            .filter(|entry| status.map_or(true, |s| entry.status == s))
            .map(|entry| entry.value().clone())
            .collect();
        Ok(Self::newest_first(offers))
    }

    async fn update_offer(
        &self,
        mut offer: Offer,
        expected_version: u64,
    ) -> Result<Offer, StoreError> {
        let mut stored = self
            .offers
            .get_mut(&offer.id)
            .ok_or(StoreError::OfferNotFound(offer.id))?;

        if stored.version != expected_version {
            return Err(StoreError::Conflict {
                offer_id: offer.id,
                expected_version,
            });
        }

        offer.version = expected_version + 1;
        *stored = offer.clone();
        Ok(offer)
    }

    async fn insert_listing(&self, listing: Listing) -> Result<(), StoreError> {
        match self.listings.entry(listing.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("listing {}", listing.id))),
            Entry::Vacant(slot) => {
                slot.insert(listing);
                Ok(())
            }
        }
    }

    async fn get_listing(&self, id: ListingId) -> Result<Option<Listing>, StoreError> {
        Ok(self.listings.get(&id).map(|entry| entry.value().clone()))
    }

    async fn claim_listing(&self, id: ListingId, offer_id: OfferId) -> Result<(), StoreError> {
        let mut listing = self
            .listings
            .get_mut(&id)
            .ok_or(StoreError::ListingNotFound(id))?;

        if !listing.is_available_to(offer_id) {
            return Err(StoreError::ListingUnavailable(id));
        }
        listing.sold_to = Some(offer_id);
        listing.open_to_offers = false;
        Ok(())
    }

    async fn release_listing(&self, id: ListingId, offer_id: OfferId) -> Result<(), StoreError> {
        let mut listing = self
            .listings
            .get_mut(&id)
            .ok_or(StoreError::ListingNotFound(id))?;

        if listing.sold_to == Some(offer_id) {
            listing.sold_to = None;
            listing.open_to_offers = true;
        }
        Ok(())
    }

    async fn pin_failures(&self, offer_id: OfferId) -> Result<u32, StoreError> {
        Ok(self.pin_failures.get(&offer_id).map_or(0, |count| *count))
    }

    async fn record_pin_failure(&self, offer_id: OfferId) -> Result<u32, StoreError> {
        let mut count = self.pin_failures.entry(offer_id).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn get_brand_settings(
        &self,
        seller_id: &str,
    ) -> Result<Option<BrandSettings>, StoreError> {
        Ok(self
            .brand_settings
            .get(seller_id)
            .map(|entry| entry.value().clone()))
    }

    async fn put_brand_settings(&self, settings: BrandSettings) -> Result<(), StoreError> {
        self.brand_settings
            .insert(settings.seller_id.clone(), settings);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Terms;
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use uuid::Uuid;

    fn offer(buyer: &str, seller: &str) -> Offer {
        let now = Utc::now();
        Offer::new(
            Uuid::new_v4(),
            buyer.to_string(),
            seller.to_string(),
            Terms {
                offered_items: vec![],
                offered_cash_cents: 100,
                currency_code: "USD".to_string(),
                message: None,
            },
            now,
            now + Duration::minutes(60),
        )
    }

    #[tokio::test]
    async fn test_update_bumps_version() {
        let store = MemoryStore::new();
        let mut o = offer("b", "s");
        store.insert_offer(o.clone()).await.unwrap();

        o.status = OfferStatus::Accepted;
        let saved = store.update_offer(o, 0).await.unwrap();
        assert_eq!(saved.version, 1);

        let read = store.get_offer(saved.id).await.unwrap().unwrap();
        assert_eq!(read.status, OfferStatus::Accepted);
        assert_eq!(read.version, 1);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts_and_leaves_record() {
        let store = MemoryStore::new();
        let o = offer("b", "s");
        store.insert_offer(o.clone()).await.unwrap();

        let mut first = o.clone();
        first.status = OfferStatus::Accepted;
        store.update_offer(first, 0).await.unwrap();

        let mut stale = o.clone();
        stale.status = OfferStatus::Rejected;
        let err = store.update_offer(stale, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected_version: 0, .. }));

        let read = store.get_offer(o.id).await.unwrap().unwrap();
        assert_eq!(read.status, OfferStatus::Accepted);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        let o = offer("b", "s");
        store.insert_offer(o.clone()).await.unwrap();
        assert!(matches!(
            store.insert_offer(o).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_updates_exactly_one_wins() {
        let store = Arc::new(MemoryStore::new());
        let o = offer("b", "s");
        store.insert_offer(o.clone()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            let mut candidate = o.clone();
            candidate.status = OfferStatus::Accepted;
            handles.push(tokio::spawn(async move {
                store.update_offer(candidate, 0).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    fn listing() -> Listing {
        Listing {
            id: Uuid::new_v4(),
            owner_id: "s".to_string(),
            title: "Desk".to_string(),
            price_cents: 100,
            currency_code: "USD".to_string(),
            trade_mode: crate::models::TradeMode::Cash,
            open_to_offers: true,
            sold_to: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_exactly_one_wins() {
        let store = Arc::new(MemoryStore::new());
        let l = listing();
        store.insert_listing(l.clone()).await.unwrap();
        let id = l.id;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.claim_listing(id, Uuid::new_v4()).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(!store.get_listing(l.id).await.unwrap().unwrap().open_to_offers);
    }

    #[tokio::test]
    async fn test_release_only_undoes_own_claim() {
        let store = MemoryStore::new();
        let l = listing();
        store.insert_listing(l.clone()).await.unwrap();
        let (winner, other) = (Uuid::new_v4(), Uuid::new_v4());

        store.claim_listing(l.id, winner).await.unwrap();
        store.claim_listing(l.id, winner).await.unwrap();
        assert!(matches!(
            store.claim_listing(l.id, other).await,
            Err(StoreError::ListingUnavailable(_))
        ));

        store.release_listing(l.id, other).await.unwrap();
        assert_eq!(store.get_listing(l.id).await.unwrap().unwrap().sold_to, Some(winner));

        store.release_listing(l.id, winner).await.unwrap();
        let reopened = store.get_listing(l.id).await.unwrap().unwrap();
        assert!(reopened.open_to_offers);
        assert_eq!(reopened.sold_to, None);
    }

    #[tokio::test]
    async fn test_pin_failures_count_per_offer() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(store.pin_failures(a).await.unwrap(), 0);
        assert_eq!(store.record_pin_failure(a).await.unwrap(), 1);
        assert_eq!(store.record_pin_failure(a).await.unwrap(), 2);
        assert_eq!(store.pin_failures(a).await.unwrap(), 2);
        assert_eq!(store.pin_failures(b).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_listing_by_party() {
        let store = MemoryStore::new();
        store.insert_offer(offer("alice", "bob")).await.unwrap();
        store.insert_offer(offer("carol", "alice")).await.unwrap();
        store.insert_offer(offer("carol", "bob")).await.unwrap();

        assert_eq!(store.list_offers_for("alice").await.unwrap().len(), 2);
        assert_eq!(store.list_offers(None).await.unwrap().len(), 3);
        assert_eq!(
            store
                .list_offers(Some(OfferStatus::Disputed))
                .await
                .unwrap()
                .len(),
            0
        );
    }
}
