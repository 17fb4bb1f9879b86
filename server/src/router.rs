//! HTTP router setup

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{self, AppState};

/// Build the application router.
pub fn create(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health))

        // Listings
        .route("/api/v1/listings", post(handlers::create_listing))
        .route("/api/v1/listings/:id", get(handlers::get_listing))

        // Seller configuration
        .route(
            "/api/v1/brand-settings",
            get(handlers::get_brand_settings).put(handlers::update_brand_settings),
        )

        // Offer lifecycle
        .route(
            "/api/v1/offers",
            get(handlers::list_offers).post(handlers::create_offer),
        )
        .route("/api/v1/offers/:id", get(handlers::get_offer))
        .route("/api/v1/offers/:id/counter", post(handlers::counter_offer))
        .route("/api/v1/offers/:id/accept", post(handlers::accept_offer))
        .route("/api/v1/offers/:id/reject", post(handlers::reject_offer))
        .route("/api/v1/offers/:id/withdraw", post(handlers::withdraw_offer))
        .route("/api/v1/offers/:id/extend-timer", post(handlers::extend_timer))
        .route("/api/v1/offers/:id/downpayment/paid", post(handlers::mark_downpayment_paid))
        .route("/api/v1/offers/:id/downpayment/confirm", post(handlers::confirm_downpayment))
        .route("/api/v1/offers/:id/confirm", post(handlers::confirm_trade))
        .route("/api/v1/offers/:id/lock", post(handlers::lock_deal))
        .route("/api/v1/offers/:id/verify-pickup", post(handlers::verify_pickup))
        .route("/api/v1/offers/:id/dispute", post(handlers::raise_dispute))
        .route("/api/v1/offers/:id/resolve", post(handlers::resolve_dispute))
        .route("/api/v1/offers/:id/receipt", get(handlers::get_receipt))

        // Moderation
        .route("/api/v1/admin/disputes", get(handlers::list_disputes))

        // State
        .with_state(state)

        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
