//! Offer state machine
//!
//! Every legality check for offer transitions lives here: the closed status
//! enumeration, the transition table, lazy expiry, and the authorization
//! predicate deciding which party may perform which action. Nothing in this
//! module touches storage or HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::middleware::Caller;
use crate::models::{DisputeOutcome, Offer};

/// Status of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Countered,
    Accepted,
    Rejected,
    Expired,
    Locked,
    Disputed,
    Completed,
    Cancelled,
}

impl OfferStatus {
    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OfferStatus::Rejected
                | OfferStatus::Expired
                | OfferStatus::Completed
                | OfferStatus::Cancelled
        )
    }

    /// Statuses governed by a response or trade deadline.
    pub fn has_running_timer(self) -> bool {
        matches!(
            self,
            OfferStatus::Pending | OfferStatus::Countered | OfferStatus::Accepted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OfferStatus::Pending => "pending",
            OfferStatus::Countered => "countered",
            OfferStatus::Accepted => "accepted",
            OfferStatus::Rejected => "rejected",
            OfferStatus::Expired => "expired",
            OfferStatus::Locked => "locked",
            OfferStatus::Disputed => "disputed",
            OfferStatus::Completed => "completed",
            OfferStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutating operation on an existing offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Counter,
    Accept,
    Reject,
    Withdraw,
    ExtendTimer,
    MarkDownpaymentPaid,
    ConfirmDownpayment,
    ConfirmTrade,
    Lock,
    VerifyPickup,
    RaiseDispute,
    ResolveDispute(DisputeOutcome),
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Counter => "counter",
            Action::Accept => "accept",
            Action::Reject => "reject",
            Action::Withdraw => "withdraw",
            Action::ExtendTimer => "extend the timer of",
            Action::MarkDownpaymentPaid => "mark the downpayment paid on",
            Action::ConfirmDownpayment => "confirm the downpayment on",
            Action::ConfirmTrade => "confirm",
            Action::Lock => "lock",
            Action::VerifyPickup => "verify pickup on",
            Action::RaiseDispute => "dispute",
            Action::ResolveDispute(_) => "resolve",
        }
    }

    /// Actions only a verified user may take.
    pub fn requires_verification(self) -> bool {
        matches!(self, Action::Accept | Action::Lock | Action::RaiseDispute)
    }

    pub fn is_admin_only(self) -> bool {
        matches!(self, Action::ResolveDispute(_))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition table.
///
/// Returns the status `action` leads to from `from`, or `None` when the
/// action is illegal there. Actions that only touch sub-state (timer,
/// downpayment) map a status onto itself. `ConfirmTrade` names its final
/// target; the offer stays `accepted` until both parties have confirmed.
pub fn transition(from: OfferStatus, action: Action) -> Option<OfferStatus> {
    use OfferStatus::*;

    match (from, action) {
        (Pending | Countered, Action::Counter) => Some(Countered),
        (Pending | Countered, Action::Accept) => Some(Accepted),
        (Pending | Countered, Action::Reject) => Some(Rejected),
        (Pending | Countered, Action::Withdraw) => Some(Cancelled),
        (Pending | Countered | Accepted, Action::ExtendTimer) => Some(from),
        (Accepted | Locked, Action::MarkDownpaymentPaid | Action::ConfirmDownpayment) => {
            Some(from)
        }
        (Accepted, Action::ConfirmTrade) => Some(Completed),
        (Accepted, Action::Lock) => Some(Locked),
        (Locked, Action::VerifyPickup) => Some(Completed),
        (Accepted | Locked, Action::RaiseDispute) => Some(Disputed),
        (Disputed, Action::ResolveDispute(DisputeOutcome::Release)) => Some(Completed),
        (Disputed, Action::ResolveDispute(DisputeOutcome::Void)) => Some(Cancelled),
        _ => None,
    }
}

/// Status of `offer` as observed at `now`.
///
/// An offer whose deadline has passed while its timer was running is
/// `expired` whether or not the sweeper has persisted that yet.
pub fn effective_status(offer: &Offer, now: DateTime<Utc>) -> OfferStatus {
    match offer.expires_at {
        Some(deadline) if offer.status.has_running_timer() && deadline <= now => {
            OfferStatus::Expired
        }
        _ => offer.status,
    }
}

/// The caller's relation to an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Buyer,
    Seller,
    Outsider,
}

/// Why a caller may not perform an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("caller is not a party to this offer")]
    NotParty,
    #[error("it is the other party's turn to respond")]
    NotYourTurn,
    #[error("only the buyer may perform this action")]
    BuyerOnly,
    #[error("only the seller may perform this action")]
    SellerOnly,
    #[error("this action requires a verified account")]
    Unverified,
    #[error("this action requires an administrator")]
    AdminOnly,
}

/// Decides whether `caller` may perform `action` on `offer`.
///
/// Status legality is a separate concern, see [`transition`].
pub fn authorize(action: Action, offer: &Offer, caller: &Caller) -> Result<(), Denial> {
    if action.is_admin_only() {
        return if caller.is_admin() {
            Ok(())
        } else {
            Err(Denial::AdminOnly)
        };
    }

    let party = offer.party_of(&caller.user_id);
    if party == Party::Outsider {
        return Err(Denial::NotParty);
    }

    match action {
        Action::Counter | Action::Accept | Action::Reject
            if caller.user_id != offer.awaiting_response_from =>
        {
            return Err(Denial::NotYourTurn)
        }
        Action::Withdraw if caller.user_id != offer.last_proposer_id => {
            return Err(Denial::NotYourTurn)
        }
        Action::MarkDownpaymentPaid if party != Party::Buyer => return Err(Denial::BuyerOnly),
        Action::ConfirmDownpayment | Action::VerifyPickup if party != Party::Seller => {
            return Err(Denial::SellerOnly)
        }
        _ => {}
    }

    if action.requires_verification() && !caller.verified {
        return Err(Denial::Unverified);
    }

    Ok(())
}

/// Boolean form of [`authorize`].
pub fn can_perform(action: Action, offer: &Offer, caller: &Caller) -> bool {
    authorize(action, offer, caller).is_ok()
}

/// Parties and administrators may read an offer.
pub fn can_view(offer: &Offer, caller: &Caller) -> bool {
    caller.is_admin() || offer.party_of(&caller.user_id) != Party::Outsider
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Offer, Terms};
    use chrono::Duration;
    use uuid::Uuid;

    const ALL: [OfferStatus; 9] = [
        OfferStatus::Pending,
        OfferStatus::Countered,
        OfferStatus::Accepted,
        OfferStatus::Rejected,
        OfferStatus::Expired,
        OfferStatus::Locked,
        OfferStatus::Disputed,
        OfferStatus::Completed,
        OfferStatus::Cancelled,
    ];

    fn offer() -> Offer {
        let now = Utc::now();
        Offer::new(
            Uuid::new_v4(),
            "buyer".to_string(),
            "seller".to_string(),
            Terms {
                offered_items: vec![],
                offered_cash_cents: 5000,
                currency_code: "USD".to_string(),
                message: None,
            },
            now,
            now + Duration::minutes(60),
        )
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        let actions = [
            Action::Counter,
            Action::Accept,
            Action::Reject,
            Action::Withdraw,
            Action::ExtendTimer,
            Action::MarkDownpaymentPaid,
            Action::ConfirmDownpayment,
            Action::ConfirmTrade,
            Action::Lock,
            Action::VerifyPickup,
            Action::RaiseDispute,
            Action::ResolveDispute(DisputeOutcome::Release),
            Action::ResolveDispute(DisputeOutcome::Void),
        ];
        for status in ALL.into_iter().filter(|s| s.is_terminal()) {
            for action in actions {
                assert_eq!(transition(status, action), None, "{status} --{action}-->");
            }
        }
    }

    #[test]
    fn test_negotiation_edges() {
        use OfferStatus::*;
        assert_eq!(transition(Pending, Action::Counter), Some(Countered));
        assert_eq!(transition(Countered, Action::Counter), Some(Countered));
        assert_eq!(transition(Countered, Action::Accept), Some(Accepted));
        assert_eq!(transition(Pending, Action::Reject), Some(Rejected));
        assert_eq!(transition(Pending, Action::Withdraw), Some(Cancelled));
        assert_eq!(transition(Accepted, Action::Counter), None);
        assert_eq!(transition(Rejected, Action::Accept), None);
    }

    #[test]
    fn test_trade_edges() {
        use OfferStatus::*;
        assert_eq!(transition(Accepted, Action::Lock), Some(Locked));
        assert_eq!(transition(Locked, Action::VerifyPickup), Some(Completed));
        assert_eq!(transition(Accepted, Action::VerifyPickup), None);
        assert_eq!(transition(Locked, Action::ConfirmTrade), None);
        assert_eq!(transition(Locked, Action::RaiseDispute), Some(Disputed));
        assert_eq!(transition(Pending, Action::RaiseDispute), None);
        assert_eq!(transition(Disputed, Action::Lock), None);
        assert_eq!(
            transition(Disputed, Action::ResolveDispute(DisputeOutcome::Void)),
            Some(Cancelled)
        );
        assert_eq!(transition(Locked, Action::ExtendTimer), None);
    }

    #[test]
    fn test_effective_status_expires_only_running_timers() {
        let mut offer = offer();
        let later = offer.created_at + Duration::minutes(61);
        assert_eq!(effective_status(&offer, offer.created_at), OfferStatus::Pending);
        assert_eq!(effective_status(&offer, later), OfferStatus::Expired);

        offer.status = OfferStatus::Locked;
        assert_eq!(effective_status(&offer, later), OfferStatus::Locked);
    }

    #[test]
    fn test_turn_taking() {
        let offer = offer();
        let buyer = Caller::verified("buyer");
        let seller = Caller::verified("seller");

        assert_eq!(
            authorize(Action::Accept, &offer, &buyer),
            Err(Denial::NotYourTurn)
        );
        assert!(can_perform(Action::Accept, &offer, &seller));
        assert!(can_perform(Action::Counter, &offer, &seller));
        assert!(can_perform(Action::Withdraw, &offer, &buyer));
        assert!(!can_perform(Action::Withdraw, &offer, &seller));
    }

    #[test]
    fn test_role_reservations() {
        let offer = offer();
        let buyer = Caller::verified("buyer");
        let seller = Caller::verified("seller");

        assert!(can_perform(Action::MarkDownpaymentPaid, &offer, &buyer));
        assert_eq!(
            authorize(Action::MarkDownpaymentPaid, &offer, &seller),
            Err(Denial::BuyerOnly)
        );
        assert!(can_perform(Action::ConfirmDownpayment, &offer, &seller));
        assert_eq!(
            authorize(Action::VerifyPickup, &offer, &buyer),
            Err(Denial::SellerOnly)
        );
    }

    #[test]
    fn test_verification_and_outsiders() {
        let offer = offer();
        assert_eq!(
            authorize(Action::Accept, &offer, &Caller::user("seller")),
            Err(Denial::Unverified)
        );
        assert_eq!(
            authorize(Action::Lock, &offer, &Caller::verified("mallory")),
            Err(Denial::NotParty)
        );
        assert!(!can_view(&offer, &Caller::user("mallory")));
        assert!(can_view(&offer, &Caller::admin("ops")));
    }

    #[test]
    fn test_resolution_is_admin_only() {
        let offer = offer();
        let resolve = Action::ResolveDispute(DisputeOutcome::Release);
        assert_eq!(
            authorize(resolve, &offer, &Caller::verified("buyer")),
            Err(Denial::AdminOnly)
        );
        assert!(can_perform(resolve, &offer, &Caller::admin("ops")));
    }
}
