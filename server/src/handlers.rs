//! HTTP handlers for listings, brand settings and the offer lifecycle

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::error::AppError;
use crate::middleware::Caller;
use crate::models::*;
use crate::services::offers::OfferService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub offers: Arc<OfferService>,
}

impl AppState {
    pub fn new(offers: OfferService) -> Self {
        Self {
            offers: Arc::new(offers),
        }
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

// ── Listings ────────────────────────────────────────────────────────────────

pub async fn create_listing(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<CreateListingRequest>,
) -> Result<(StatusCode, Json<Listing>), AppError> {
    let listing = state.offers.create_listing(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(listing)))
}

pub async fn get_listing(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<ListingId>,
) -> ApiResult<Listing> {
    Ok(Json(state.offers.get_listing(id).await?))
}

// ── Brand settings ──────────────────────────────────────────────────────────

pub async fn get_brand_settings(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<BrandSettings> {
    Ok(Json(state.offers.brand_settings(&caller).await?))
}

pub async fn update_brand_settings(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<UpdateBrandSettingsRequest>,
) -> ApiResult<BrandSettings> {
    Ok(Json(
        state.offers.update_brand_settings(&caller, request).await?,
    ))
}

// ── Offers ──────────────────────────────────────────────────────────────────

pub async fn create_offer(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<CreateOfferRequest>,
) -> Result<(StatusCode, Json<OfferView>), AppError> {
    let offer = state.offers.create_offer(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(offer)))
}

pub async fn list_offers(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<OfferQuery>,
) -> ApiResult<Vec<OfferView>> {
    Ok(Json(state.offers.list_offers(&caller, &query).await?))
}

pub async fn get_offer(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
) -> ApiResult<OfferView> {
    Ok(Json(state.offers.get_offer(&caller, id).await?))
}

pub async fn counter_offer(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
    Json(terms): Json<TermsInput>,
) -> ApiResult<OfferView> {
    Ok(Json(state.offers.counter_offer(&caller, id, terms).await?))
}

pub async fn accept_offer(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
) -> ApiResult<OfferView> {
    Ok(Json(state.offers.accept_offer(&caller, id).await?))
}

pub async fn reject_offer(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
) -> ApiResult<OfferView> {
    Ok(Json(state.offers.reject_offer(&caller, id).await?))
}

pub async fn withdraw_offer(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
) -> ApiResult<OfferView> {
    Ok(Json(state.offers.withdraw_offer(&caller, id).await?))
}

pub async fn extend_timer(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
    request: Option<Json<ExtendTimerRequest>>,
) -> ApiResult<OfferView> {
    let minutes = request.and_then(|Json(r)| r.minutes);
    Ok(Json(
        state.offers.extend_trade_timer(&caller, id, minutes).await?,
    ))
}

pub async fn mark_downpayment_paid(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
) -> ApiResult<OfferView> {
    Ok(Json(state.offers.mark_downpayment_paid(&caller, id).await?))
}

pub async fn confirm_downpayment(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
) -> ApiResult<OfferView> {
    Ok(Json(
        state.offers.confirm_downpayment_receipt(&caller, id).await?,
    ))
}

pub async fn confirm_trade(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
) -> ApiResult<OfferView> {
    Ok(Json(state.offers.confirm_trade(&caller, id).await?))
}

pub async fn lock_deal(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
) -> ApiResult<OfferView> {
    Ok(Json(state.offers.lock_deal(&caller, id).await?))
}

pub async fn verify_pickup(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
    Json(request): Json<VerifyPickupRequest>,
) -> ApiResult<OfferView> {
    Ok(Json(
        state.offers.verify_pickup(&caller, id, &request.pin).await?,
    ))
}

pub async fn raise_dispute(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
    Json(request): Json<DisputeRequest>,
) -> ApiResult<OfferView> {
    Ok(Json(
        state.offers.raise_dispute(&caller, id, &request.reason).await?,
    ))
}

pub async fn resolve_dispute(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
    Json(request): Json<ResolveDisputeRequest>,
) -> ApiResult<OfferView> {
    Ok(Json(
        state.offers.resolve_dispute(&caller, id, request).await?,
    ))
}

pub async fn get_receipt(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<OfferId>,
) -> ApiResult<Receipt> {
    Ok(Json(state.offers.get_receipt(&caller, id).await?))
}

// ── Admin ───────────────────────────────────────────────────────────────────

pub async fn list_disputes(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Vec<OfferView>> {
    Ok(Json(state.offers.list_disputes(&caller).await?))
}
