//! HTTP surface tests: routing, identity headers and error mapping.

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use barterwave_server::middleware::{USER_ID_HEADER, USER_ROLE_HEADER, USER_VERIFIED_HEADER};
use barterwave_server::services::notify::TracingNotifier;
use barterwave_server::services::offers::{LifecyclePolicy, OfferService};
use barterwave_server::services::store::MemoryStore;
use barterwave_server::{create_router, AppState};

fn app() -> Router {
    let offers = OfferService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(TracingNotifier),
        LifecyclePolicy::default(),
    );
    create_router(AppState::new(offers))
}

struct As<'a> {
    user: &'a str,
    verified: bool,
    admin: bool,
}

const BUYER: As<'static> = As {
    user: "buyer",
    verified: true,
    admin: false,
};
const SELLER: As<'static> = As {
    user: "seller",
    verified: true,
    admin: false,
};

async fn call(
    app: &Router,
    who: Option<&As<'_>>,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(who) = who {
        request = request
            .header(USER_ID_HEADER, who.user)
            .header(USER_VERIFIED_HEADER, who.verified.to_string());
        if who.admin {
            request = request.header(USER_ROLE_HEADER, "admin");
        }
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn create_listing(app: &Router, owner: &As<'_>) -> String {
    let (status, listing) = call(
        app,
        Some(owner),
        Method::POST,
        "/api/v1/listings",
        Some(json!({ "title": "Road bike", "priceCents": 10000, "currencyCode": "USD" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    listing["id"].as_str().unwrap().to_string()
}

async fn create_offer(app: &Router, listing_id: &str) -> String {
    let (status, offer) = call(
        app,
        Some(&BUYER),
        Method::POST,
        "/api/v1/offers",
        Some(json!({ "targetListingId": listing_id, "offeredCashCents": 5000 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(offer["status"], "pending");
    offer["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_needs_no_identity() {
    let app = app();
    let (status, body) = call(&app, None, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let app = app();
    let (status, body) = call(&app, None, Method::GET, "/api/v1/offers", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "unauthorized");
    assert_eq!(body["code"], 401);
}

#[tokio::test]
async fn create_and_fetch_offer() {
    let app = app();
    let listing_id = create_listing(&app, &SELLER).await;
    let offer_id = create_offer(&app, &listing_id).await;

    let (status, offer) = call(
        &app,
        Some(&SELLER),
        Method::GET,
        &format!("/api/v1/offers/{offer_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(offer["targetListingId"], listing_id.as_str());
    assert_eq!(offer["offeredCashCents"], 5000);
    assert_eq!(offer["currencyCode"], "USD");
    assert_eq!(offer["awaitingResponseFrom"], "seller");
    assert_eq!(offer["disputeRaised"], false);

    let (status, received) = call(
        &app,
        Some(&SELLER),
        Method::GET,
        "/api/v1/offers?type=received&status=pending",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(received.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let app = app();
    let listing_id = create_listing(&app, &SELLER).await;

    // Negative cash never reaches the store.
    let (status, body) = call(
        &app,
        Some(&BUYER),
        Method::POST,
        "/api/v1/offers",
        Some(json!({ "targetListingId": listing_id, "offeredCashCents": -100 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation_error");

    let offer_id = create_offer(&app, &listing_id).await;
    let offer_uri = |action: &str| format!("/api/v1/offers/{offer_id}/{action}");

    let outsider = As {
        user: "mallory",
        verified: true,
        admin: false,
    };
    let (status, body) = call(&app, Some(&outsider), Method::POST, &offer_uri("accept"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "forbidden");

    let (status, _) = call(&app, Some(&SELLER), Method::POST, &offer_uri("reject"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, Some(&SELLER), Method::POST, &offer_uri("accept"), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "invalid_state");

    let missing = uuid::Uuid::new_v4();
    let (status, _) = call(
        &app,
        Some(&SELLER),
        Method::GET,
        &format!("/api/v1/offers/{missing}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pickup_flow_over_http() {
    let app = app();
    let listing_id = create_listing(&app, &SELLER).await;
    let offer_id = create_offer(&app, &listing_id).await;
    let offer_uri = |action: &str| format!("/api/v1/offers/{offer_id}/{action}");

    let (status, _) = call(&app, Some(&SELLER), Method::POST, &offer_uri("accept"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, locked) = call(&app, Some(&SELLER), Method::POST, &offer_uri("lock"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(locked["status"], "locked");
    assert!(locked.get("pickupPin").is_none());

    let (_, buyer_view) = call(
        &app,
        Some(&BUYER),
        Method::GET,
        &format!("/api/v1/offers/{offer_id}"),
        None,
    )
    .await;
    let pin = buyer_view["pickupPin"].as_str().unwrap().to_string();

    let (status, done) = call(
        &app,
        Some(&SELLER),
        Method::POST,
        &offer_uri("verify-pickup"),
        Some(json!({ "pin": pin })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["status"], "completed");

    let (status, receipt) = call(&app, Some(&BUYER), Method::GET, &offer_uri("receipt"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["cashDisplay"], "$50.00");
    assert_eq!(receipt["completionMethod"], "pickup_verified");
}

#[tokio::test]
async fn extend_timer_accepts_empty_body() {
    let app = app();
    let listing_id = create_listing(&app, &SELLER).await;
    let offer_id = create_offer(&app, &listing_id).await;
    let uri = format!("/api/v1/offers/{offer_id}/extend-timer");

    let (status, offer) = call(&app, Some(&BUYER), Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(offer["timerExtensions"], 1);

    let (status, _) = call(&app, Some(&BUYER), Method::POST, &uri, Some(json!({ "minutes": 2 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_routes_require_admin_role() {
    let app = app();
    let (status, _) = call(&app, Some(&BUYER), Method::GET, "/api/v1/admin/disputes", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = As {
        user: "ops",
        verified: true,
        admin: true,
    };
    let (status, disputes) = call(&app, Some(&admin), Method::GET, "/api/v1/admin/disputes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(disputes, json!([]));
}

#[tokio::test]
async fn brand_settings_roundtrip() {
    let app = app();
    let (status, defaults) = call(&app, Some(&SELLER), Method::GET, "/api/v1/brand-settings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(defaults["requireDownpayment"], false);

    let (status, saved) = call(
        &app,
        Some(&SELLER),
        Method::PUT,
        "/api/v1/brand-settings",
        Some(json!({
            "requireDownpayment": true,
            "downpaymentType": "PERCENTAGE",
            "downpaymentValue": 25,
            "defaultTimerDuration": 45
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(saved["downpaymentType"], "PERCENTAGE");
    assert_eq!(saved["defaultTimerDuration"], 45);
}

/// End to end over a real socket, the way the trading agent talks to it.
#[tokio::test]
async fn serves_over_tcp() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app()).await.unwrap();
    });

    let client = reqwest::Client::new();
    let listing: Value = client
        .post(format!("http://{addr}/api/v1/listings"))
        .header(USER_ID_HEADER, "seller")
        .json(&json!({ "title": "Lamp", "priceCents": 2500, "currencyCode": "EUR", "tradeMode": "cash" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["tradeMode"], "cash");
    assert_eq!(listing["openToOffers"], true);

    let response = client
        .get(format!("http://{addr}/api/v1/listings/{}", listing["id"].as_str().unwrap()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}
