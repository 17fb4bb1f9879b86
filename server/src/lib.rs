//! BarterWave offer service
//!
//! Runs the negotiation and settlement lifecycle of marketplace offers: cash,
//! barter and hybrid proposals, counters, acceptance, seller downpayments,
//! locked in-person pickups with PIN verification, and disputes.
//!
//! ## Endpoints
//! - `POST /api/v1/offers` - Make an offer on a listing
//! - `POST /api/v1/offers/:id/{counter,accept,reject,...}` - Lifecycle transitions
//! - `GET /api/v1/offers/:id/receipt` - Receipt for a completed trade
//! - `GET|PUT /api/v1/brand-settings` - Seller downpayment and timer policy

pub mod config;
pub mod currency;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod middleware;
pub mod models;
mod router;
pub mod services;

pub use config::Config;
pub use error::AppError;
pub use handlers::AppState;
pub use router::create as create_router;
