//! Offer lifecycle manager
//!
//! Each mutating operation follows the same sequence: load the offer, check
//! the action against its effective status and the caller's rights, apply
//! the change to a copy, and write it back conditionally on the version that
//! was read. A failed check returns before anything is written; a lost race
//! surfaces as [`AppError::Conflict`].

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::currency;
use crate::error::AppError;
use crate::lifecycle::{self, Action, OfferStatus, Party};
use crate::middleware::Caller;
use crate::models::*;
use crate::services::notify::{Notification, NotificationKind, Notifier};
use crate::services::store::{OfferStore, StoreError};

/// Longest free-text message or dispute reason accepted.
const MAX_TEXT_LEN: usize = 2000;

/// Tunables of the lifecycle that are not per-seller.
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    pub default_timer_minutes: u32,
    pub extension_minutes: u32,
    pub max_extensions: u32,
    pub pin_length: usize,
    pub max_pin_attempts: u32,
    pub max_counters: u32,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for LifecyclePolicy {
    fn from(config: &Config) -> Self {
        Self {
            default_timer_minutes: config.default_timer_minutes,
            extension_minutes: config.timer_extension_minutes,
            max_extensions: config.max_timer_extensions,
            pin_length: config.pickup_pin_length,
            max_pin_attempts: config.max_pin_attempts,
            max_counters: config.max_counters,
        }
    }
}

pub struct OfferService {
    store: Arc<dyn OfferStore>,
    notifier: Arc<dyn Notifier>,
    policy: LifecyclePolicy,
}

impl OfferService {
    pub fn new(
        store: Arc<dyn OfferStore>,
        notifier: Arc<dyn Notifier>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            policy,
        }
    }

    // ── Listings ────────────────────────────────────────────────────────────

    pub async fn create_listing(
        &self,
        caller: &Caller,
        request: CreateListingRequest,
    ) -> Result<Listing, AppError> {
        let title = request.title.trim();
        if title.is_empty() {
            return Err(AppError::Validation("title must not be empty".into()));
        }
        if !(0..=MAX_PRICE_CENTS).contains(&request.price_cents) {
            return Err(AppError::Validation(format!(
                "priceCents must be between 0 and {MAX_PRICE_CENTS}"
            )));
        }
        let price_cents = request.price_cents as u64;
        let currency = currency::lookup(&request.currency_code).ok_or_else(|| {
            AppError::Validation(format!("unsupported currency {}", request.currency_code))
        })?;

        let listing = Listing {
            id: Uuid::new_v4(),
            owner_id: caller.user_id.clone(),
            title: title.to_string(),
            price_cents,
            currency_code: currency.code.to_string(),
            trade_mode: request.trade_mode,
            open_to_offers: true,
            sold_to: None,
            created_at: Utc::now(),
        };
        self.store.insert_listing(listing.clone()).await?;

        info!(listing_id = %listing.id, owner = %listing.owner_id, "Listing created");
        Ok(listing)
    }

    pub async fn get_listing(&self, id: ListingId) -> Result<Listing, AppError> {
        self.store
            .get_listing(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("listing {id}")))
    }

    // ── Brand settings ──────────────────────────────────────────────────────

    /// The caller's own settings, or the defaults if never saved.
    pub async fn brand_settings(&self, caller: &Caller) -> Result<BrandSettings, AppError> {
        self.settings_for(&caller.user_id).await
    }

    pub async fn update_brand_settings(
        &self,
        caller: &Caller,
        request: UpdateBrandSettingsRequest,
    ) -> Result<BrandSettings, AppError> {
        if !(MIN_TIMER_MINUTES..=MAX_TIMER_MINUTES).contains(&request.default_timer_duration) {
            return Err(AppError::Validation(format!(
                "defaultTimerDuration must be between {MIN_TIMER_MINUTES} and {MAX_TIMER_MINUTES} minutes"
            )));
        }
        if request.downpayment_value < 0 {
            return Err(AppError::Validation(
                "downpaymentValue must be non-negative".into(),
            ));
        }
        if request.downpayment_type == DownpaymentType::Percentage
            && request.downpayment_value > MAX_DOWNPAYMENT_PERCENT
        {
            return Err(AppError::Validation(format!(
                "percentage downpayment must be between 0 and {MAX_DOWNPAYMENT_PERCENT}"
            )));
        }

        let settings = BrandSettings {
            seller_id: caller.user_id.clone(),
            require_downpayment: request.require_downpayment,
            downpayment_type: request.downpayment_type,
            downpayment_value: request.downpayment_value as u64,
            default_timer_duration: request.default_timer_duration as u32,
            updated_at: Some(Utc::now()),
        };
        self.store.put_brand_settings(settings.clone()).await?;

        info!(
            seller = %settings.seller_id,
            require_downpayment = settings.require_downpayment,
            timer_minutes = settings.default_timer_duration,
            "Brand settings updated"
        );
        Ok(settings)
    }

    // ── Offers: creation and reads ──────────────────────────────────────────

    pub async fn create_offer(
        &self,
        caller: &Caller,
        request: CreateOfferRequest,
    ) -> Result<OfferView, AppError> {
        let now = Utc::now();
        let listing = self.get_listing(request.target_listing_id).await?;

        if listing.owner_id == caller.user_id {
            return Err(AppError::Forbidden(
                "sellers cannot make offers on their own listing".into(),
            ));
        }
        if !listing.open_to_offers {
            return Err(AppError::InvalidState(format!(
                "listing {} is not open to offers",
                listing.id
            )));
        }

        let terms = self
            .validate_terms(request.terms, &listing, &caller.user_id)
            .await?;
        let settings = self.settings_for(&listing.owner_id).await?;

        let offer = Offer::new(
            listing.id,
            caller.user_id.clone(),
            listing.owner_id.clone(),
            terms,
            now,
            now + settings.timer(),
        );
        self.store.insert_offer(offer.clone()).await?;

        info!(
            offer_id = %offer.id,
            listing_id = %listing.id,
            buyer = %offer.buyer_id,
            seller = %offer.seller_id,
            cash_cents = offer.terms.offered_cash_cents,
            items = offer.terms.offered_items.len(),
            "Offer created"
        );
        self.notify(&offer.seller_id, &offer, NotificationKind::OfferReceived);

        Ok(OfferView::for_caller(&offer, caller, now))
    }

    pub async fn get_offer(&self, caller: &Caller, id: OfferId) -> Result<OfferView, AppError> {
        let offer = self.load(id).await?;
        if !lifecycle::can_view(&offer, caller) {
            return Err(AppError::Forbidden(
                "caller is not a party to this offer".into(),
            ));
        }
        Ok(OfferView::for_caller(&offer, caller, Utc::now()))
    }

    /// Offers visible to the caller, filtered by direction, effective status
    /// and target listing. Administrators without a direction see everything.
    pub async fn list_offers(
        &self,
        caller: &Caller,
        query: &OfferQuery,
    ) -> Result<Vec<OfferView>, AppError> {
        let now = Utc::now();
        let offers = if caller.is_admin() && query.direction.is_none() {
            self.store.list_offers(None).await?
        } else {
            self.store.list_offers_for(&caller.user_id).await?
        };

        Ok(offers
            .iter()
            .filter(|offer| match query.direction {
                Some(OfferDirection::Sent) => offer.buyer_id == caller.user_id,
                Some(OfferDirection::Received) => offer.seller_id == caller.user_id,
                None => true,
            })
            .filter(|offer| {
                query
                    .listing_id
                    .map_or(true, |listing| offer.target_listing_id == listing)
            })
            .map(|offer| OfferView::for_caller(offer, caller, now))
            .filter(|view| query.status.map_or(true, |s| view.offer.status == s))
            .collect())
    }

    // ── Negotiation ─────────────────────────────────────────────────────────

    pub async fn counter_offer(
        &self,
        caller: &Caller,
        id: OfferId,
        input: TermsInput,
    ) -> Result<OfferView, AppError> {
        let (mut offer, next, now) = self.prepare(caller, id, Action::Counter).await?;
        if offer.terms_history.len() >= self.policy.max_counters as usize {
            return Err(AppError::InvalidState(format!(
                "offer already countered {} times; accept or reject it",
                offer.terms_history.len()
            )));
        }
        let listing = self.get_listing(offer.target_listing_id).await?;
        if !listing.is_available_to(offer.id) {
            return Err(AppError::InvalidState(format!(
                "listing {} is no longer available",
                listing.id
            )));
        }
        let terms = self.validate_terms(input, &listing, &offer.buyer_id).await?;
        let settings = self.settings_for(&offer.seller_id).await?;

        let previous = std::mem::replace(&mut offer.terms, terms);
        offer.terms_history.push(previous);
        offer.status = next;
        offer.last_proposer_id = caller.user_id.clone();
        offer.awaiting_response_from = offer.counterparty_of(&caller.user_id).clone();
        offer.expires_at = Some(now + settings.timer());

        let saved = self.commit(offer, caller, Action::Counter, now).await?;
        self.notify(&saved.awaiting_response_from, &saved, NotificationKind::OfferCountered);
        Ok(OfferView::for_caller(&saved, caller, now))
    }

    pub async fn accept_offer(&self, caller: &Caller, id: OfferId) -> Result<OfferView, AppError> {
        let (mut offer, next, now) = self.prepare(caller, id, Action::Accept).await?;
        self.ensure_available(&offer).await?;
        let listing = self.get_listing(offer.target_listing_id).await?;
        let settings = self.settings_for(&offer.seller_id).await?;

        offer.status = next;
        if settings.require_downpayment {
            offer.downpayment_status = DownpaymentStatus::AwaitingPayment;
            offer.downpayment_amount_cents = settings.downpayment_for(listing.price_cents);
        }
        offer.expires_at = Some(now + settings.timer());

        let saved = self.commit(offer, caller, Action::Accept, now).await?;
        self.notify_counterparty(&saved, caller, NotificationKind::OfferAccepted);
        Ok(OfferView::for_caller(&saved, caller, now))
    }

    pub async fn reject_offer(&self, caller: &Caller, id: OfferId) -> Result<OfferView, AppError> {
        let (mut offer, next, now) = self.prepare(caller, id, Action::Reject).await?;
        offer.status = next;
        offer.expires_at = None;

        let saved = self.commit(offer, caller, Action::Reject, now).await?;
        self.notify_counterparty(&saved, caller, NotificationKind::OfferRejected);
        Ok(OfferView::for_caller(&saved, caller, now))
    }

    /// Retract the caller's own live terms before the other side responds.
    pub async fn withdraw_offer(
        &self,
        caller: &Caller,
        id: OfferId,
    ) -> Result<OfferView, AppError> {
        let (mut offer, next, now) = self.prepare(caller, id, Action::Withdraw).await?;
        offer.status = next;
        offer.expires_at = None;

        let saved = self.commit(offer, caller, Action::Withdraw, now).await?;
        self.notify_counterparty(&saved, caller, NotificationKind::OfferWithdrawn);
        Ok(OfferView::for_caller(&saved, caller, now))
    }

    pub async fn extend_trade_timer(
        &self,
        caller: &Caller,
        id: OfferId,
        minutes: Option<i64>,
    ) -> Result<OfferView, AppError> {
        let minutes = minutes.unwrap_or(i64::from(self.policy.extension_minutes));
        if !(MIN_TIMER_MINUTES..=MAX_TIMER_MINUTES).contains(&minutes) {
            return Err(AppError::Validation(format!(
                "extension must be between {MIN_TIMER_MINUTES} and {MAX_TIMER_MINUTES} minutes"
            )));
        }

        let (mut offer, next, now) = self.prepare(caller, id, Action::ExtendTimer).await?;
        if offer.timer_extensions >= self.policy.max_extensions {
            return Err(AppError::InvalidState(format!(
                "timer already extended {} times",
                offer.timer_extensions
            )));
        }
        let deadline = offer
            .expires_at
            .ok_or_else(|| AppError::InvalidState("offer has no running timer".into()))?;

        offer.status = next;
        offer.expires_at = Some(deadline + Duration::minutes(minutes));
        offer.timer_extensions += 1;

        let saved = self.commit(offer, caller, Action::ExtendTimer, now).await?;
        self.notify_counterparty(&saved, caller, NotificationKind::TimerExtended);
        Ok(OfferView::for_caller(&saved, caller, now))
    }

    // ── Downpayment ─────────────────────────────────────────────────────────

    pub async fn mark_downpayment_paid(
        &self,
        caller: &Caller,
        id: OfferId,
    ) -> Result<OfferView, AppError> {
        let (mut offer, next, now) = self
            .prepare(caller, id, Action::MarkDownpaymentPaid)
            .await?;
        if offer.downpayment_status != DownpaymentStatus::AwaitingPayment {
            return Err(AppError::InvalidState(
                "downpayment is not awaiting payment".into(),
            ));
        }

        offer.status = next;
        offer.downpayment_status = DownpaymentStatus::Paid;
        offer.downpayment_paid_at = Some(now);

        let saved = self
            .commit(offer, caller, Action::MarkDownpaymentPaid, now)
            .await?;
        self.notify(&saved.seller_id, &saved, NotificationKind::DownpaymentPaid);
        Ok(OfferView::for_caller(&saved, caller, now))
    }

    pub async fn confirm_downpayment_receipt(
        &self,
        caller: &Caller,
        id: OfferId,
    ) -> Result<OfferView, AppError> {
        let (mut offer, next, now) = self
            .prepare(caller, id, Action::ConfirmDownpayment)
            .await?;
        if offer.downpayment_status != DownpaymentStatus::Paid {
            return Err(AppError::InvalidState(
                "downpayment has not been marked paid".into(),
            ));
        }

        offer.status = next;
        offer.downpayment_status = DownpaymentStatus::Confirmed;
        offer.downpayment_confirmed_at = Some(now);

        let saved = self
            .commit(offer, caller, Action::ConfirmDownpayment, now)
            .await?;
        self.notify(&saved.buyer_id, &saved, NotificationKind::DownpaymentConfirmed);
        Ok(OfferView::for_caller(&saved, caller, now))
    }

    // ── Completion ──────────────────────────────────────────────────────────

    /// Record the caller's confirmation; the trade completes once both
    /// parties have confirmed. Confirming twice is a no-op.
    pub async fn confirm_trade(&self, caller: &Caller, id: OfferId) -> Result<OfferView, AppError> {
        let (mut offer, completed, now) = self.prepare(caller, id, Action::ConfirmTrade).await?;
        ensure_downpayment_settled(&offer)?;

        let slot = match offer.party_of(&caller.user_id) {
            Party::Buyer => &mut offer.buyer_confirmed_at,
            _ => &mut offer.seller_confirmed_at,
        };
        if slot.is_some() {
            debug!(offer_id = %offer.id, actor = %caller.user_id, "Trade already confirmed by caller");
            return Ok(OfferView::for_caller(&offer, caller, now));
        }
        *slot = Some(now);

        let both = offer.buyer_confirmed_at.is_some() && offer.seller_confirmed_at.is_some();
        if both {
            offer.status = completed;
            offer.completed_at = Some(now);
            offer.completion_method = Some(CompletionMethod::BothConfirmed);
            offer.expires_at = None;
        }

        let saved = if both {
            self.commit_completion(offer, caller, Action::ConfirmTrade, now)
                .await?
        } else {
            self.commit(offer, caller, Action::ConfirmTrade, now).await?
        };
        if both {
            self.finish_trade(&saved).await;
        } else {
            self.notify_counterparty(&saved, caller, NotificationKind::TradeConfirmed);
        }
        Ok(OfferView::for_caller(&saved, caller, now))
    }

    /// Freeze the accepted terms for an in-person exchange and issue the
    /// pickup PIN to the buyer.
    pub async fn lock_deal(&self, caller: &Caller, id: OfferId) -> Result<OfferView, AppError> {
        let (mut offer, next, now) = self.prepare(caller, id, Action::Lock).await?;
        self.ensure_available(&offer).await?;

        offer.status = next;
        offer.pickup_pin = Some(generate_pin(self.policy.pin_length));
        offer.locked_at = Some(now);
        offer.expires_at = None;

        let saved = self.commit(offer, caller, Action::Lock, now).await?;
        self.notify_counterparty(&saved, caller, NotificationKind::DealLocked);
        Ok(OfferView::for_caller(&saved, caller, now))
    }

    /// The seller enters the PIN the buyer presents at pickup.
    pub async fn verify_pickup(
        &self,
        caller: &Caller,
        id: OfferId,
        pin: &str,
    ) -> Result<OfferView, AppError> {
        let (mut offer, next, now) = self.prepare(caller, id, Action::VerifyPickup).await?;
        ensure_downpayment_settled(&offer)?;

        let limit = self.policy.max_pin_attempts;
        if self.store.pin_failures(offer.id).await? >= limit {
            return Err(AppError::Forbidden(
                "too many wrong pickup PINs; raise a dispute to settle this trade".into(),
            ));
        }
        if !pin_matches(offer.pickup_pin.as_deref(), pin) {
            let failures = self.store.record_pin_failure(offer.id).await?;
            warn!(offer_id = %offer.id, actor = %caller.user_id, failures, "Pickup PIN mismatch");
            if failures >= limit {
                self.notify(&offer.buyer_id, &offer, NotificationKind::PickupAttemptsExhausted);
                self.notify(&offer.seller_id, &offer, NotificationKind::PickupAttemptsExhausted);
            }
            return Err(AppError::Forbidden("pickup PIN does not match".into()));
        }

        offer.status = next;
        offer.completed_at = Some(now);
        offer.completion_method = Some(CompletionMethod::PickupVerified);

        let saved = self
            .commit_completion(offer, caller, Action::VerifyPickup, now)
            .await?;
        self.finish_trade(&saved).await;
        Ok(OfferView::for_caller(&saved, caller, now))
    }

    // ── Disputes ────────────────────────────────────────────────────────────

    pub async fn raise_dispute(
        &self,
        caller: &Caller,
        id: OfferId,
        reason: &str,
    ) -> Result<OfferView, AppError> {
        let reason = required_text("reason", reason)?;
        let (mut offer, next, now) = self.prepare(caller, id, Action::RaiseDispute).await?;

        offer.status = next;
        offer.expires_at = None;
        offer.dispute = Some(Dispute {
            raised_by: caller.user_id.clone(),
            reason,
            raised_at: now,
            resolution: None,
        });

        let saved = self.commit(offer, caller, Action::RaiseDispute, now).await?;
        warn!(offer_id = %saved.id, raised_by = %caller.user_id, "Dispute raised");
        self.notify_counterparty(&saved, caller, NotificationKind::DisputeRaised);
        Ok(OfferView::for_caller(&saved, caller, now))
    }

    pub async fn resolve_dispute(
        &self,
        caller: &Caller,
        id: OfferId,
        request: ResolveDisputeRequest,
    ) -> Result<OfferView, AppError> {
        let note = optional_text("note", request.note)?;
        let action = Action::ResolveDispute(request.outcome);
        let (mut offer, next, now) = self.prepare(caller, id, action).await?;
        let release = next == OfferStatus::Completed;
        if release {
            ensure_downpayment_settled(&offer)?;
        }

        offer.status = next;
        if let Some(dispute) = offer.dispute.as_mut() {
            dispute.resolution = Some(DisputeResolution {
                outcome: request.outcome,
                resolved_by: caller.user_id.clone(),
                note,
                resolved_at: now,
            });
        }
        if release {
            offer.completed_at = Some(now);
            offer.completion_method = Some(CompletionMethod::DisputeResolved);
        }

        let saved = if release {
            self.commit_completion(offer, caller, action, now).await?
        } else {
            self.commit(offer, caller, action, now).await?
        };
        self.notify(&saved.buyer_id, &saved, NotificationKind::DisputeResolved);
        self.notify(&saved.seller_id, &saved, NotificationKind::DisputeResolved);
        if release {
            self.supersede_competing(&saved, now).await;
        }
        Ok(OfferView::for_caller(&saved, caller, now))
    }

    pub async fn list_disputes(&self, caller: &Caller) -> Result<Vec<OfferView>, AppError> {
        if !caller.is_admin() {
            return Err(AppError::Forbidden(
                lifecycle::Denial::AdminOnly.to_string(),
            ));
        }
        let now = Utc::now();
        Ok(self
            .store
            .list_offers(Some(OfferStatus::Disputed))
            .await?
            .iter()
            .map(|offer| OfferView::for_caller(offer, caller, now))
            .collect())
    }

    // ── Receipts ────────────────────────────────────────────────────────────

    pub async fn get_receipt(&self, caller: &Caller, id: OfferId) -> Result<Receipt, AppError> {
        let offer = self.load(id).await?;
        if !lifecycle::can_view(&offer, caller) {
            return Err(AppError::Forbidden(
                "caller is not a party to this offer".into(),
            ));
        }
        let (Some(completed_at), Some(completion_method)) =
            (offer.completed_at, offer.completion_method)
        else {
            return Err(AppError::InvalidState(
                "receipts are only available for completed trades".into(),
            ));
        };
        let listing = self.get_listing(offer.target_listing_id).await?;
        let code = &offer.terms.currency_code;

        Ok(Receipt {
            receipt_number: receipt_number(&offer, completed_at),
            offer_id: offer.id,
            listing_id: listing.id,
            listing_title: listing.title,
            buyer_id: offer.buyer_id.clone(),
            seller_id: offer.seller_id.clone(),
            offered_items: offer.terms.offered_items.clone(),
            cash_cents: offer.terms.offered_cash_cents,
            cash_display: currency::format_minor(offer.terms.offered_cash_cents, code),
            currency_code: code.clone(),
            downpayment_cents: offer.downpayment_amount_cents,
            downpayment_display: currency::format_minor(offer.downpayment_amount_cents, code),
            completion_method,
            completed_at,
            issued_at: Utc::now(),
        })
    }

    // ── Expiry ──────────────────────────────────────────────────────────────

    /// Persist `expired` on every offer whose deadline passed by `now`.
    /// Offers changed concurrently are left for the next sweep.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let mut expired = 0;
        for mut offer in self.store.list_offers(None).await? {
            if lifecycle::effective_status(&offer, now) != OfferStatus::Expired
                || offer.status == OfferStatus::Expired
            {
                continue;
            }

            let version = offer.version;
            offer.status = OfferStatus::Expired;
            offer.updated_at = now;
            offer.record(now, None, OfferEvent::Expired);

            match self.store.update_offer(offer, version).await {
                Ok(saved) => {
                    expired += 1;
                    debug!(offer_id = %saved.id, "Offer expired");
                    self.notify(&saved.buyer_id, &saved, NotificationKind::OfferExpired);
                    self.notify(&saved.seller_id, &saved, NotificationKind::OfferExpired);
                }
                Err(StoreError::Conflict { offer_id, .. }) => {
                    debug!(%offer_id, "Skipping expiry of concurrently updated offer");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(expired)
    }

    // ── Internals ───────────────────────────────────────────────────────────

    async fn load(&self, id: OfferId) -> Result<Offer, AppError> {
        self.store
            .get_offer(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("offer {id}")))
    }

    async fn settings_for(&self, seller_id: &str) -> Result<BrandSettings, AppError> {
        Ok(self
            .store
            .get_brand_settings(seller_id)
            .await?
            .unwrap_or_else(|| {
                BrandSettings::defaults_for(seller_id, self.policy.default_timer_minutes)
            }))
    }

    /// Load the offer and admit `action`, returning the offer as read, the
    /// status the action leads to, and the instant the decision was made.
    async fn prepare(
        &self,
        caller: &Caller,
        id: OfferId,
        action: Action,
    ) -> Result<(Offer, OfferStatus, DateTime<Utc>), AppError> {
        let now = Utc::now();
        let offer = self.load(id).await?;
        let next = admit(&offer, action, caller, now).map_err(|e| {
            debug!(offer_id = %id, actor = %caller.user_id, %action, error = %e, "Transition refused");
            e
        })?;
        Ok((offer, next, now))
    }

    /// Write the changed offer back, conditional on the version it was read at.
    async fn commit(
        &self,
        mut offer: Offer,
        caller: &Caller,
        action: Action,
        now: DateTime<Utc>,
    ) -> Result<Offer, AppError> {
        let expected_version = offer.version;
        offer.updated_at = now;
        offer.record(now, Some(&caller.user_id), OfferEvent::Transition(action));

        let saved = self
            .store
            .update_offer(offer, expected_version)
            .await
            .map_err(|e| {
                if matches!(e, StoreError::Conflict { .. }) {
                    warn!(actor = %caller.user_id, %action, "Lost race on offer update");
                }
                AppError::from(e)
            })?;

        info!(
            offer_id = %saved.id,
            actor = %caller.user_id,
            %action,
            status = %saved.status,
            version = saved.version,
            "Offer updated"
        );
        Ok(saved)
    }

    /// Commit a completing write. Every listing the trade involves is
    /// claimed first, so two trades can never both take the same listing;
    /// the claims are released again if the write loses its race.
    async fn commit_completion(
        &self,
        offer: Offer,
        caller: &Caller,
        action: Action,
        now: DateTime<Utc>,
    ) -> Result<Offer, AppError> {
        let offer_id = offer.id;
        let listing_ids = offer.listing_ids();

        for (claimed, listing_id) in listing_ids.iter().enumerate() {
            if let Err(e) = self.store.claim_listing(*listing_id, offer_id).await {
                debug!(%offer_id, %listing_id, error = %e, "Listing claim refused");
                self.release_listings(offer_id, &listing_ids[..claimed]).await;
                return Err(e.into());
            }
        }

        match self.commit(offer, caller, action, now).await {
            Ok(saved) => Ok(saved),
            Err(e) => {
                self.release_listings(offer_id, &listing_ids).await;
                Err(e)
            }
        }
    }

    async fn release_listings(&self, offer_id: OfferId, listing_ids: &[ListingId]) {
        for listing_id in listing_ids {
            if let Err(e) = self.store.release_listing(*listing_id, offer_id).await {
                warn!(%offer_id, %listing_id, error = %e, "Failed to release listing claim");
            }
        }
    }

    /// Every listing the offer involves must still be free for its trade.
    async fn ensure_available(&self, offer: &Offer) -> Result<(), AppError> {
        for listing_id in offer.listing_ids() {
            if !self.get_listing(listing_id).await?.is_available_to(offer.id) {
                return Err(AppError::InvalidState(format!(
                    "listing {listing_id} is no longer available"
                )));
            }
        }
        Ok(())
    }

    async fn finish_trade(&self, offer: &Offer) {
        info!(offer_id = %offer.id, method = ?offer.completion_method, "Trade completed");
        self.notify(&offer.buyer_id, offer, NotificationKind::TradeCompleted);
        self.notify(&offer.seller_id, offer, NotificationKind::TradeCompleted);
        self.supersede_competing(offer, Utc::now()).await;
    }

    /// Cancel the live offers that involve a listing `sold` just took. The
    /// trade is already committed, so failures here are only logged; the
    /// listing claims keep those offers from completing regardless.
    async fn supersede_competing(&self, sold: &Offer, now: DateTime<Utc>) {
        let taken = sold.listing_ids();
        let offers = match self.store.list_offers(None).await {
            Ok(offers) => offers,
            Err(e) => {
                warn!(offer_id = %sold.id, error = %e, "Failed to load competing offers");
                return;
            }
        };

        for mut offer in offers {
            let live = matches!(
                lifecycle::effective_status(&offer, now),
                OfferStatus::Pending
                    | OfferStatus::Countered
                    | OfferStatus::Accepted
                    | OfferStatus::Locked
            );
            if offer.id == sold.id || !live || !offer.listing_ids().iter().any(|id| taken.contains(id)) {
                continue;
            }

            let version = offer.version;
            offer.status = OfferStatus::Cancelled;
            offer.expires_at = None;
            offer.updated_at = now;
            offer.record(now, None, OfferEvent::Superseded);

            match self.store.update_offer(offer, version).await {
                Ok(saved) => {
                    info!(offer_id = %saved.id, sold_to = %sold.id, "Offer superseded");
                    self.notify(&saved.buyer_id, &saved, NotificationKind::OfferSuperseded);
                    self.notify(&saved.seller_id, &saved, NotificationKind::OfferSuperseded);
                }
                Err(e) => {
                    warn!(sold_to = %sold.id, error = %e, "Failed to supersede competing offer");
                }
            }
        }
    }

    /// Check and normalize submitted terms against the target listing.
    async fn validate_terms(
        &self,
        input: TermsInput,
        listing: &Listing,
        buyer_id: &str,
    ) -> Result<Terms, AppError> {
        let cash = input.offered_cash_cents.unwrap_or(0);
        let offered_cash_cents = u64::try_from(cash)
            .map_err(|_| AppError::Validation("offeredCashCents must be non-negative".into()))?;

        let mut seen = HashSet::new();
        let mut offered_items = Vec::with_capacity(input.offered_items.len());
        for item in &input.offered_items {
            let quantity = u32::try_from(item.quantity)
                .ok()
                .filter(|q| *q >= 1)
                .ok_or_else(|| {
                    AppError::Validation(format!(
                        "quantity for listing {} must be at least 1",
                        item.listing_id
                    ))
                })?;
            if item.listing_id == listing.id {
                return Err(AppError::Validation(
                    "the target listing cannot be offered in exchange for itself".into(),
                ));
            }
            if !seen.insert(item.listing_id) {
                return Err(AppError::Validation(format!(
                    "listing {} is offered more than once",
                    item.listing_id
                )));
            }
            offered_items.push(OfferedItem {
                listing_id: item.listing_id,
                quantity,
            });
        }

        if offered_cash_cents == 0 && offered_items.is_empty() {
            return Err(AppError::Validation(
                "an offer must include cash or at least one item".into(),
            ));
        }
        if offered_cash_cents > 0 && !listing.trade_mode.accepts_cash() {
            return Err(AppError::Validation(
                "this listing only accepts barter offers".into(),
            ));
        }
        if !offered_items.is_empty() && !listing.trade_mode.accepts_items() {
            return Err(AppError::Validation(
                "this listing only accepts cash offers".into(),
            ));
        }

        let currency_code = match input.currency_code.as_deref() {
            Some(code) => currency::lookup(code)
                .ok_or_else(|| AppError::Validation(format!("unsupported currency {code}")))?
                .code
                .to_string(),
            None => listing.currency_code.clone(),
        };
        if currency_code != listing.currency_code {
            return Err(AppError::Validation(format!(
                "offer currency {currency_code} does not match listing currency {}",
                listing.currency_code
            )));
        }

        let message = optional_text("message", input.message)?;

        for item in &offered_items {
            let offered = self.get_listing(item.listing_id).await?;
            if offered.owner_id != buyer_id {
                return Err(AppError::Validation(format!(
                    "listing {} does not belong to the buyer",
                    item.listing_id
                )));
            }
            if !offered.open_to_offers {
                return Err(AppError::InvalidState(format!(
                    "listing {} is no longer available",
                    item.listing_id
                )));
            }
        }

        Ok(Terms {
            offered_items,
            offered_cash_cents,
            currency_code,
            message,
        })
    }

    fn notify(&self, recipient: &str, offer: &Offer, kind: NotificationKind) {
        self.notifier.notify(Notification {
            recipient: recipient.to_string(),
            offer_id: offer.id,
            kind,
        });
    }

    fn notify_counterparty(&self, offer: &Offer, caller: &Caller, kind: NotificationKind) {
        let recipient = offer.counterparty_of(&caller.user_id).clone();
        self.notify(&recipient, offer, kind);
    }
}

/// Admission check for `action`: party membership, status legality, then the
/// caller's role and turn.
fn admit(
    offer: &Offer,
    action: Action,
    caller: &Caller,
    now: DateTime<Utc>,
) -> Result<OfferStatus, AppError> {
    let outsider = offer.party_of(&caller.user_id) == Party::Outsider;
    if (action.is_admin_only() && !caller.is_admin()) || (!action.is_admin_only() && outsider) {
        let denial = lifecycle::authorize(action, offer, caller)
            .err()
            .unwrap_or(lifecycle::Denial::NotParty);
        return Err(AppError::Forbidden(denial.to_string()));
    }

    let current = lifecycle::effective_status(offer, now);
    let next = lifecycle::transition(current, action).ok_or_else(|| {
        AppError::InvalidState(format!("cannot {action} an offer that is {current}"))
    })?;

    lifecycle::authorize(action, offer, caller).map_err(|d| AppError::Forbidden(d.to_string()))?;
    Ok(next)
}

fn ensure_downpayment_settled(offer: &Offer) -> Result<(), AppError> {
    if offer.downpayment_status.is_outstanding() {
        return Err(AppError::InvalidState(
            "the downpayment must be confirmed before the trade can complete".into(),
        ));
    }
    Ok(())
}

fn required_text(field: &str, value: &str) -> Result<String, AppError> {
    optional_text(field, Some(value.to_string()))?
        .ok_or_else(|| AppError::Validation(format!("{field} must not be empty")))
}

fn optional_text(field: &str, value: Option<String>) -> Result<Option<String>, AppError> {
    let Some(text) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(AppError::Validation(format!(
            "{field} must be at most {MAX_TEXT_LEN} characters"
        )));
    }
    Ok(Some(text))
}

/// Constant-time comparison of the supplied PIN against the issued one.
fn pin_matches(issued: Option<&str>, supplied: &str) -> bool {
    let supplied = supplied.trim();
    match issued {
        Some(issued) if issued.len() == supplied.len() => {
            issued.as_bytes().ct_eq(supplied.as_bytes()).into()
        }
        _ => false,
    }
}

fn generate_pin(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// `BW-` followed by the first 16 hex digits of a SHA-256 digest over the
/// finalized terms.
fn receipt_number(offer: &Offer, completed_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(offer.id.as_bytes());
    hasher.update(offer.target_listing_id.as_bytes());
    hasher.update(offer.buyer_id.as_bytes());
    hasher.update(offer.seller_id.as_bytes());
    hasher.update(offer.terms.offered_cash_cents.to_be_bytes());
    hasher.update(offer.terms.currency_code.as_bytes());
    for item in &offer.terms.offered_items {
        hasher.update(item.listing_id.as_bytes());
        hasher.update(item.quantity.to_be_bytes());
    }
    hasher.update(completed_at.to_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("BW-{}", digest[..16].to_uppercase())
}
