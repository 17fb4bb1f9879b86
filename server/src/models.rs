//! Data models for offers, listings and seller settings, and API payloads

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::{self, Action, OfferStatus, Party};
use crate::middleware::Caller;

pub type OfferId = Uuid;
pub type ListingId = Uuid;
pub type UserId = String;

/// Shortest and longest response window a seller may configure, in minutes.
pub const MIN_TIMER_MINUTES: i64 = 10;
pub const MAX_TIMER_MINUTES: i64 = 1440;

/// Upper bound for a percentage downpayment.
pub const MAX_DOWNPAYMENT_PERCENT: i64 = 50;

/// Largest listing price accepted, in minor units.
pub const MAX_PRICE_CENTS: i64 = 1_000_000_000_000;

/// Kinds of consideration a listing accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Cash,
    Barter,
    #[default]
    Hybrid,
}

impl TradeMode {
    pub fn accepts_cash(self) -> bool {
        matches!(self, TradeMode::Cash | TradeMode::Hybrid)
    }

    pub fn accepts_items(self) -> bool {
        matches!(self, TradeMode::Barter | TradeMode::Hybrid)
    }
}

/// A marketplace listing offers can target or include.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: ListingId,
    pub owner_id: UserId,
    pub title: String,
    pub price_cents: u64,
    pub currency_code: String,
    pub trade_mode: TradeMode,
    pub open_to_offers: bool,
    /// The offer whose trade took this listing.
    #[serde(default)]
    pub sold_to: Option<OfferId>,
    pub created_at: DateTime<Utc>,
}

impl Listing {
    /// Whether the trade of `offer_id` may still take this listing.
    pub fn is_available_to(&self, offer_id: OfferId) -> bool {
        match self.sold_to {
            Some(owner) => owner == offer_id,
            None => self.open_to_offers,
        }
    }
}

/// One of the buyer's listings put up in exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferedItem {
    pub listing_id: ListingId,
    pub quantity: u32,
}

/// What the buyer gives for the target listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Terms {
    pub offered_items: Vec<OfferedItem>,
    pub offered_cash_cents: u64,
    pub currency_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownpaymentStatus {
    #[default]
    None,
    AwaitingPayment,
    Paid,
    Confirmed,
}

impl DownpaymentStatus {
    /// A downpayment was required and has not been confirmed yet.
    pub fn is_outstanding(self) -> bool {
        matches!(
            self,
            DownpaymentStatus::AwaitingPayment | DownpaymentStatus::Paid
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeOutcome {
    /// The trade goes through as agreed.
    Release,
    /// The trade is called off.
    Void,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeResolution {
    pub outcome: DisputeOutcome,
    pub resolved_by: UserId,
    pub note: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispute {
    pub raised_by: UserId,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
    pub resolution: Option<DisputeResolution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMethod {
    BothConfirmed,
    PickupVerified,
    DisputeResolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferEvent {
    Created,
    Transition(Action),
    Expired,
    /// Cancelled because a listing it involves went to another trade.
    Superseded,
}

/// One entry of an offer's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    /// `None` for system events such as expiry.
    pub actor: Option<UserId>,
    pub event: OfferEvent,
    pub status: OfferStatus,
}

/// A buyer's proposal against a seller's listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub id: OfferId,
    pub target_listing_id: ListingId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    #[serde(flatten)]
    pub terms: Terms,
    pub status: OfferStatus,
    /// Author of the live terms.
    pub last_proposer_id: UserId,
    /// The party whose response the live terms wait for.
    pub awaiting_response_from: UserId,

    pub downpayment_status: DownpaymentStatus,
    pub downpayment_amount_cents: u64,
    pub downpayment_paid_at: Option<DateTime<Utc>>,
    pub downpayment_confirmed_at: Option<DateTime<Utc>>,

    pub expires_at: Option<DateTime<Utc>>,
    pub timer_extensions: u32,

    pub buyer_confirmed_at: Option<DateTime<Utc>>,
    pub seller_confirmed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pickup_pin: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub dispute: Option<Dispute>,

    pub completed_at: Option<DateTime<Utc>>,
    pub completion_method: Option<CompletionMethod>,

    pub terms_history: Vec<Terms>,
    pub timeline: Vec<TimelineEntry>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Offer {
    /// A fresh `pending` offer awaiting the seller's response.
    pub fn new(
        target_listing_id: ListingId,
        buyer_id: UserId,
        seller_id: UserId,
        terms: Terms,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let mut offer = Self {
            id: Uuid::new_v4(),
            target_listing_id,
            last_proposer_id: buyer_id.clone(),
            awaiting_response_from: seller_id.clone(),
            buyer_id: buyer_id.clone(),
            seller_id,
            terms,
            status: OfferStatus::Pending,
            downpayment_status: DownpaymentStatus::None,
            downpayment_amount_cents: 0,
            downpayment_paid_at: None,
            downpayment_confirmed_at: None,
            expires_at: Some(expires_at),
            timer_extensions: 0,
            buyer_confirmed_at: None,
            seller_confirmed_at: None,
            pickup_pin: None,
            locked_at: None,
            dispute: None,
            completed_at: None,
            completion_method: None,
            terms_history: Vec::new(),
            timeline: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        };
        offer.record(now, Some(&buyer_id), OfferEvent::Created);
        offer
    }

    pub fn party_of(&self, user_id: &str) -> Party {
        if user_id == self.buyer_id {
            Party::Buyer
        } else if user_id == self.seller_id {
            Party::Seller
        } else {
            Party::Outsider
        }
    }

    /// The target listing followed by every offered item.
    pub fn listing_ids(&self) -> Vec<ListingId> {
        std::iter::once(self.target_listing_id)
            .chain(self.terms.offered_items.iter().map(|item| item.listing_id))
            .collect()
    }

    /// The other party. Callers must be a party to the offer.
    pub fn counterparty_of(&self, user_id: &str) -> &UserId {
        if user_id == self.buyer_id {
            &self.seller_id
        } else {
            &self.buyer_id
        }
    }

    /// Appends a timeline entry for the offer's current status.
    pub fn record(&mut self, at: DateTime<Utc>, actor: Option<&str>, event: OfferEvent) {
        self.timeline.push(TimelineEntry {
            at,
            actor: actor.map(str::to_string),
            event,
            status: self.status,
        });
    }
}

/// Offer as presented to one caller: status evaluated at read time and the
/// pickup PIN shown only to the buyer, who hands it over at pickup.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferView {
    #[serde(flatten)]
    pub offer: Offer,
    pub dispute_raised: bool,
}

impl OfferView {
    pub fn for_caller(offer: &Offer, caller: &Caller, now: DateTime<Utc>) -> Self {
        let mut offer = offer.clone();
        offer.status = lifecycle::effective_status(&offer, now);
        if offer.party_of(&caller.user_id) != Party::Buyer {
            offer.pickup_pin = None;
        }
        Self {
            dispute_raised: offer.dispute.is_some(),
            offer,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownpaymentType {
    /// `downpayment_value` is an amount in cents.
    #[default]
    Fixed,
    /// `downpayment_value` is a percentage of the listing price.
    Percentage,
}

/// Per-seller configuration read when offers on their listings are created
/// and accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrandSettings {
    pub seller_id: UserId,
    pub require_downpayment: bool,
    pub downpayment_type: DownpaymentType,
    pub downpayment_value: u64,
    /// Minutes the counterparty has to respond.
    pub default_timer_duration: u32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl BrandSettings {
    /// Settings for a seller who never configured any.
    pub fn defaults_for(seller_id: &str, default_timer_duration: u32) -> Self {
        Self {
            seller_id: seller_id.to_string(),
            require_downpayment: false,
            downpayment_type: DownpaymentType::Fixed,
            downpayment_value: 0,
            default_timer_duration,
            updated_at: None,
        }
    }

    /// Downpayment owed on a listing priced at `price_cents`.
    pub fn downpayment_for(&self, price_cents: u64) -> u64 {
        match self.downpayment_type {
            DownpaymentType::Fixed => self.downpayment_value,
            DownpaymentType::Percentage => {
                let amount = u128::from(price_cents) * u128::from(self.downpayment_value) / 100;
                u64::try_from(amount).unwrap_or(u64::MAX)
            }
        }
    }

    pub fn timer(&self) -> Duration {
        Duration::minutes(i64::from(self.default_timer_duration))
    }
}

/// Receipt for a completed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub receipt_number: String,
    pub offer_id: OfferId,
    pub listing_id: ListingId,
    pub listing_title: String,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub offered_items: Vec<OfferedItem>,
    pub cash_cents: u64,
    pub cash_display: String,
    pub currency_code: String,
    pub downpayment_cents: u64,
    pub downpayment_display: String,
    pub completion_method: CompletionMethod,
    pub completed_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
}

// ── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateListingRequest {
    pub title: String,
    pub price_cents: i64,
    pub currency_code: String,
    #[serde(default)]
    pub trade_mode: TradeMode,
}

/// Offered item as submitted; quantities are checked before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferedItemInput {
    pub listing_id: ListingId,
    pub quantity: i64,
}

/// Terms as submitted with a new offer or a counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermsInput {
    #[serde(default)]
    pub offered_items: Vec<OfferedItemInput>,
    pub offered_cash_cents: Option<i64>,
    pub currency_code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOfferRequest {
    pub target_listing_id: ListingId,
    #[serde(flatten)]
    pub terms: TermsInput,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtendTimerRequest {
    pub minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyPickupRequest {
    pub pin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveDisputeRequest {
    pub outcome: DisputeOutcome,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBrandSettingsRequest {
    pub require_downpayment: bool,
    #[serde(default)]
    pub downpayment_type: DownpaymentType,
    #[serde(default)]
    pub downpayment_value: i64,
    pub default_timer_duration: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferDirection {
    /// Offers the caller made as buyer.
    Sent,
    /// Offers on the caller's listings.
    Received,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferQuery {
    #[serde(rename = "type")]
    pub direction: Option<OfferDirection>,
    pub status: Option<OfferStatus>,
    pub listing_id: Option<ListingId>,
}

// ── Responses ───────────────────────────────────────────────────────────────

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(kind: DownpaymentType, value: u64) -> BrandSettings {
        BrandSettings {
            require_downpayment: true,
            downpayment_type: kind,
            downpayment_value: value,
            ..BrandSettings::defaults_for("seller", 60)
        }
    }

    #[test]
    fn test_downpayment_amounts() {
        assert_eq!(settings(DownpaymentType::Fixed, 1000).downpayment_for(25_000), 1000);
        assert_eq!(settings(DownpaymentType::Percentage, 20).downpayment_for(25_000), 5000);
        assert_eq!(settings(DownpaymentType::Percentage, 50).downpayment_for(999), 499);
    }

    #[test]
    fn test_percentage_downpayment_on_huge_price() {
        let half = settings(DownpaymentType::Percentage, 50);
        assert_eq!(half.downpayment_for(u64::MAX), u64::MAX / 2);
        assert_eq!(
            half.downpayment_for(i64::MAX as u64),
            (i64::MAX as u64) / 2
        );
    }

    #[test]
    fn test_sold_listing_is_only_available_to_its_trade() {
        let winner = Uuid::new_v4();
        let mut listing = Listing {
            id: Uuid::new_v4(),
            owner_id: "seller".into(),
            title: "Lamp".into(),
            price_cents: 100,
            currency_code: "USD".into(),
            trade_mode: TradeMode::Cash,
            open_to_offers: true,
            sold_to: None,
            created_at: Utc::now(),
        };
        assert!(listing.is_available_to(winner));

        listing.open_to_offers = false;
        listing.sold_to = Some(winner);
        assert!(listing.is_available_to(winner));
        assert!(!listing.is_available_to(Uuid::new_v4()));
    }

    #[test]
    fn test_new_offer_awaits_seller() {
        let now = Utc::now();
        let offer = Offer::new(
            Uuid::new_v4(),
            "buyer".into(),
            "seller".into(),
            Terms {
                offered_items: vec![],
                offered_cash_cents: 100,
                currency_code: "USD".into(),
                message: Some("hi".into()),
            },
            now,
            now + Duration::minutes(30),
        );
        assert_eq!(offer.status, OfferStatus::Pending);
        assert_eq!(offer.last_proposer_id, "buyer");
        assert_eq!(offer.awaiting_response_from, "seller");
        assert_eq!(offer.timeline.len(), 1);
        assert_eq!(offer.timeline[0].event, OfferEvent::Created);
        assert_eq!(offer.counterparty_of("seller"), "buyer");
    }

    #[test]
    fn test_view_hides_pin_from_seller() {
        let now = Utc::now();
        let mut offer = Offer::new(
            Uuid::new_v4(),
            "buyer".into(),
            "seller".into(),
            Terms {
                offered_items: vec![],
                offered_cash_cents: 100,
                currency_code: "USD".into(),
                message: None,
            },
            now,
            now + Duration::minutes(30),
        );
        offer.status = OfferStatus::Locked;
        offer.pickup_pin = Some("123456".into());

        let seller_view = OfferView::for_caller(&offer, &Caller::user("seller"), now);
        let buyer_view = OfferView::for_caller(&offer, &Caller::user("buyer"), now);
        assert_eq!(seller_view.offer.pickup_pin, None);
        assert_eq!(buyer_view.offer.pickup_pin.as_deref(), Some("123456"));
    }

    #[test]
    fn test_offer_query_reads_type_param() {
        let query: OfferQuery =
            serde_json::from_str(r#"{"type":"received","status":"countered"}"#).unwrap();
        assert_eq!(query.direction, Some(OfferDirection::Received));
        assert_eq!(query.status, Some(OfferStatus::Countered));
        assert_eq!(query.listing_id, None);
    }
}
