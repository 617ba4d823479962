use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use matchday_server::config::Config;
use matchday_server::gateways::{
    GatewayError, PaymentGateway, SmsReceipt, SmsSender, StkPushAccepted, StkPushRequest,
    StkQueryStatus,
};
use matchday_server::models::NewMatch;
use matchday_server::routes::create_routes;
use matchday_server::state::AppState;
use matchday_server::store::{MemoryStore, Store};

const ADMIN: &str = "admin-1";
const FAN: &str = "fan-7";
const CALLBACK_TOKEN: &str = "cb-secret";

struct FakeGateway {
    reject: bool,
    /// Whether STK queries report the push as paid.
    confirms: bool,
    pushes: AtomicUsize,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn initiate_stk_push(
        &self,
        request: &StkPushRequest,
    ) -> Result<StkPushAccepted, GatewayError> {
        assert_eq!(request.account_reference.len(), 12);
        if self.reject {
            return Err(GatewayError::Rejected {
                service: "M-Pesa",
                code: Some("500.001.1001".to_string()),
                message: "Unable to lock subscriber".to_string(),
            });
        }
        let n = self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(StkPushAccepted {
            merchant_request_id: format!("29115-{}", n),
            checkout_request_id: format!("ws_CO_TEST_{}", n),
            customer_message: "Success. Request accepted for processing".to_string(),
        })
    }

    async fn query_stk_status(&self, _: &str) -> Result<StkQueryStatus, GatewayError> {
        if self.confirms {
            Ok(StkQueryStatus::Completed)
        } else {
            Ok(StkQueryStatus::Pending)
        }
    }
}

#[derive(Default)]
struct RecordingSms {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SmsSender for RecordingSms {
    async fn send(&self, to: &str, message: &str) -> Result<SmsReceipt, GatewayError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), message.to_string()));
        Ok(SmsReceipt {
            message_id: Some("ATXid_1".to_string()),
            status: "Success".to_string(),
        })
    }
}

struct Harness {
    app: Router,
    store: Arc<MemoryStore>,
    sms: Arc<RecordingSms>,
}

struct Options {
    reject_pushes: bool,
    gateway_confirms: bool,
    callback_token: Option<&'static str>,
}

fn harness(reject_pushes: bool) -> Harness {
    harness_with(Options {
        reject_pushes,
        gateway_confirms: true,
        callback_token: Some(CALLBACK_TOKEN),
    })
}

fn harness_with(options: Options) -> Harness {
    let mut vars: HashMap<&str, &str> = HashMap::from([
        ("STORAGE_BACKEND", "memory"),
        ("ADMIN_USER_IDS", ADMIN),
        ("MAX_SEATS_PER_BOOKING", "4"),
        ("PUBLIC_BASE_URL", "https://tickets.example/"),
    ]);
    if let Some(token) = options.callback_token {
        vars.insert("MPESA_CALLBACK_TOKEN", token);
    }
    let config = Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

    let store = Arc::new(MemoryStore::new());
    let sms = Arc::new(RecordingSms::default());
    let gateway = Arc::new(FakeGateway {
        reject: options.reject_pushes,
        confirms: options.gateway_confirms,
        pushes: AtomicUsize::new(0),
    });
    let state = AppState::new(config, store.clone(), gateway, sms.clone());
    Harness {
        app: create_routes(state),
        store,
        sms,
    }
}

async fn seed_match(store: &MemoryStore, seats: i32) -> Uuid {
    store
        .create_match(NewMatch {
            home_team: "Gor Mahia".to_string(),
            away_team: "AFC Leopards".to_string(),
            venue: "Nyayo Stadium".to_string(),
            match_date: Utc::now() + chrono::Duration::days(10),
            ticket_price: Decimal::new(500, 0),
            vip_ticket_price: Some(Decimal::new(1500, 0)),
            total_seats: seats,
        })
        .await
        .unwrap()
        .id
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn booking(match_id: Uuid, seats: &[&str]) -> Value {
    json!({
        "matchId": match_id,
        "phone": "0712345678",
        "seats": seats.iter().map(|s| json!({ "seatNumber": s })).collect::<Vec<_>>(),
    })
}

fn callback(checkout_id: &str, result_code: i64) -> Value {
    let desc = if result_code == 0 {
        "The service request is processed successfully."
    } else {
        "Request cancelled by user"
    };
    let mut stk = json!({
        "MerchantRequestID": "29115-0",
        "CheckoutRequestID": checkout_id,
        "ResultCode": result_code,
        "ResultDesc": desc,
    });
    if result_code == 0 {
        stk["CallbackMetadata"] = json!({
            "Item": [
                { "Name": "Amount", "Value": 1000 },
                { "Name": "MpesaReceiptNumber", "Value": "QK7AB12CD3" },
                { "Name": "TransactionDate", "Value": 20260314150102_i64 },
                { "Name": "PhoneNumber", "Value": 254712345678_i64 }
            ]
        });
    }
    json!({ "Body": { "stkCallback": stk } })
}

async fn available_seats(store: &MemoryStore, match_id: Uuid) -> i32 {
    store.get_match(match_id).await.unwrap().available_seats
}

async fn wait_for_sms(sms: &RecordingSms, count: usize) {
    for _ in 0..100 {
        if sms.sent.lock().unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_paid_booking_confirms_tickets_once() {
    let h = harness(false);
    let match_id = seed_match(&h.store, 50).await;

    let (status, body) = call(
        &h.app,
        "POST",
        "/api/bookings",
        Some(FAN),
        Some(booking(match_id, &["a1", "A2"])),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let checkout_id = body["data"]["checkoutRequestId"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["tickets"].as_array().unwrap().len(), 2);
    assert_eq!(available_seats(&h.store, match_id).await, 48);

    let poll = format!("/api/mpesa/check-payment?checkoutRequestId={}", checkout_id);
    let (status, body) = call(&h.app, "GET", &poll, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["paymentConfirmed"], false);

    let hook = format!("/api/mpesa/callback?token={}", CALLBACK_TOKEN);
    for _ in 0..2 {
        let (status, ack) = call(&h.app, "POST", &hook, None, Some(callback(&checkout_id, 0))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack, json!({ "ResultCode": 0, "ResultDesc": "Accepted" }));
    }

    let (_, body) = call(&h.app, "GET", &poll, None, None).await;
    assert_eq!(body["data"]["status"], "completed");
    assert_eq!(body["data"]["paymentConfirmed"], true);
    assert_eq!(body["data"]["mpesaReceipt"], "QK7AB12CD3");
    let tickets = body["data"]["tickets"].as_array().unwrap();
    assert!(tickets.iter().all(|t| t["status"] == "active"));

    // Seats were taken at booking; settlement does not take them again.
    assert_eq!(available_seats(&h.store, match_id).await, 48);

    wait_for_sms(&h.sms, 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let sent = h.sms.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "254712345678");
    assert!(sent[0].1.contains("https://tickets.example/tickets/"));

    drop(sent);
    let (status, mine) = call(&h.app, "GET", "/api/users/me/tickets", Some(FAN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mine["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_cancelled_payment_releases_seats() {
    let h = harness(false);
    let match_id = seed_match(&h.store, 10).await;

    let (_, body) = call(&h.app, "POST", "/api/mpesa/stk-push", None, Some(booking(match_id, &["C3"]))).await;
    let checkout_id = body["data"]["checkoutRequestId"].as_str().unwrap().to_string();
    assert_eq!(available_seats(&h.store, match_id).await, 9);

    let hook = format!("/api/mpesa/callback?token={}", CALLBACK_TOKEN);
    let (status, _) = call(&h.app, "POST", &hook, None, Some(callback(&checkout_id, 1032))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(available_seats(&h.store, match_id).await, 10);

    let poll = format!("/api/mpesa/check-payment?checkoutRequestId={}", checkout_id);
    let (_, body) = call(&h.app, "GET", &poll, None, None).await;
    assert_eq!(body["data"]["status"], "failed");
    assert!(body["data"].get("tickets").is_none());

    // The released seat can be booked again.
    let (status, _) = call(&h.app, "POST", "/api/bookings", None, Some(booking(match_id, &["C3"]))).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_sold_out_and_taken_seats_conflict() {
    let h = harness(false);
    let match_id = seed_match(&h.store, 2).await;

    let (status, _) = call(&h.app, "POST", "/api/bookings", None, Some(booking(match_id, &["A1"]))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = call(&h.app, "POST", "/api/bookings", None, Some(booking(match_id, &["A1"]))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "CONFLICT");

    let (status, _) = call(&h.app, "POST", "/api/bookings", None, Some(booking(match_id, &["B1", "B2"]))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(available_seats(&h.store, match_id).await, 1);
}

#[tokio::test]
async fn test_rejected_push_holds_no_seats() {
    let h = harness(true);
    let match_id = seed_match(&h.store, 5).await;

    let (status, body) = call(&h.app, "POST", "/api/bookings", None, Some(booking(match_id, &["A1", "A2"]))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "PAYMENT_GATEWAY_ERROR");
    assert_eq!(available_seats(&h.store, match_id).await, 5);
}

#[tokio::test]
async fn test_admin_routes_reject_other_callers() {
    let h = harness(false);
    let new_match = json!({
        "homeTeam": "Tusker",
        "awayTeam": "Bandari",
        "venue": "Kasarani",
        "matchDate": (Utc::now() + chrono::Duration::days(5)).to_rfc3339(),
        "ticketPrice": "300",
        "totalSeats": 100
    });

    let (status, _) = call(&h.app, "POST", "/api/matches", None, Some(new_match.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(&h.app, "POST", "/api/matches", Some(FAN), Some(new_match.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "FORBIDDEN");

    let (status, body) = call(&h.app, "POST", "/api/matches", Some(ADMIN), Some(new_match)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["availableSeats"], 100);

    let (status, _) = call(
        &h.app,
        "POST",
        "/api/sms/send",
        Some(FAN),
        Some(json!({ "to": "0712345678", "message": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, list) = call(&h.app, "GET", "/api/matches", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_guest_secret_grants_ticket_access() {
    let h = harness(false);
    let match_id = seed_match(&h.store, 5).await;

    let (_, body) = call(&h.app, "POST", "/api/bookings", None, Some(booking(match_id, &["D4"]))).await;
    let ticket = &body["data"]["tickets"][0];
    let id = ticket["id"].as_str().unwrap();
    let secret = ticket["guestSecret"].as_str().unwrap();

    let (status, view) = call(&h.app, "GET", &format!("/api/tickets/{}?secret={}", id, secret), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["data"]["ticket"]["seatNumber"], "D4");
    assert!(view["data"]["ticket"].get("guestSecret").is_none());

    let (status, _) = call(&h.app, "GET", &format!("/api/tickets/{}?secret=wrong", id), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&h.app, "GET", &format!("/api/tickets/{}", id), Some(FAN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&h.app, "GET", &format!("/api/tickets/{}", id), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_callback_requires_shared_token() {
    let h = harness(false);
    let match_id = seed_match(&h.store, 5).await;
    let (_, body) = call(&h.app, "POST", "/api/bookings", None, Some(booking(match_id, &["A1"]))).await;
    let checkout_id = body["data"]["checkoutRequestId"].as_str().unwrap().to_string();

    let (status, _) = call(&h.app, "POST", "/api/mpesa/callback?token=guess", None, Some(callback(&checkout_id, 0))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let poll = format!("/api/mpesa/check-payment?checkoutRequestId={}", checkout_id);
    let (_, body) = call(&h.app, "GET", &poll, None, None).await;
    assert_eq!(body["data"]["status"], "pending");
}

#[tokio::test]
async fn test_unverified_success_callback_settles_nothing() {
    let h = harness_with(Options {
        reject_pushes: false,
        gateway_confirms: false,
        callback_token: None,
    });
    let match_id = seed_match(&h.store, 5).await;
    let (_, body) = call(&h.app, "POST", "/api/bookings", None, Some(booking(match_id, &["B7"]))).await;
    let checkout_id = body["data"]["checkoutRequestId"].as_str().unwrap().to_string();

    // Without a token anyone can reach the callback; the gateway has the final word.
    let (status, ack) = call(&h.app, "POST", "/api/mpesa/callback", None, Some(callback(&checkout_id, 0))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ResultCode"], 0);

    let poll = format!("/api/mpesa/check-payment?checkoutRequestId={}", checkout_id);
    let (_, body) = call(&h.app, "GET", &poll, None, None).await;
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["paymentConfirmed"], false);
    assert!(h.store.payments_for_match(match_id).await.unwrap().is_empty());
    assert!(h.sms.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_match_with_payments_cannot_be_deleted() {
    let h = harness(false);
    let match_id = seed_match(&h.store, 5).await;
    let (_, body) = call(&h.app, "POST", "/api/bookings", None, Some(booking(match_id, &["H8"]))).await;
    let checkout_id = body["data"]["checkoutRequestId"].as_str().unwrap().to_string();
    let ticket_id = body["data"]["tickets"][0]["id"].as_str().unwrap().to_string();

    let hook = format!("/api/mpesa/callback?token={}", CALLBACK_TOKEN);
    call(&h.app, "POST", &hook, None, Some(callback(&checkout_id, 0))).await;
    let cancel = format!("/api/tickets/{}/cancel", ticket_id);
    let (status, _) = call(&h.app, "POST", &cancel, Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(available_seats(&h.store, match_id).await, 5);

    let (status, _) = call(&h.app, "DELETE", &format!("/api/matches/{}", match_id), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(h.store.payments_for_match(match_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_redeem_then_cancel_is_refused() {
    let h = harness(false);
    let match_id = seed_match(&h.store, 5).await;
    let (_, body) = call(&h.app, "POST", "/api/bookings", None, Some(booking(match_id, &["E5"]))).await;
    let checkout_id = body["data"]["checkoutRequestId"].as_str().unwrap().to_string();
    let ticket_id = body["data"]["tickets"][0]["id"].as_str().unwrap().to_string();

    // Not yet paid.
    let redeem = format!("/api/tickets/{}/redeem", ticket_id);
    let (status, _) = call(&h.app, "POST", &redeem, Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let hook = format!("/api/mpesa/callback?token={}", CALLBACK_TOKEN);
    call(&h.app, "POST", &hook, None, Some(callback(&checkout_id, 0))).await;

    let (status, body) = call(&h.app, "POST", &redeem, Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "used");

    let cancel = format!("/api/tickets/{}/cancel", ticket_id);
    let (status, _) = call(&h.app, "POST", &cancel, Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}
