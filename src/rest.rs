//! REST API for the scanning UI (Axum, port 11111 by default)
//!
//! Public: health, operator registration and login.
//! Bearer-protected: scanning, event listing, sync and revocation management.

use axum::{
    extract::{Query, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::auth::{hash_password, verify_password, TokenIssuer};
use crate::entry::{EntryService, SyncReport};
use crate::error::{Error, Result};
use crate::models::{AccessAction, AccessEvent, Operator, OperatorClaims, QrPayload, ScanResult, SyncStatus};
use crate::qr;

/// Shared app state for REST handlers (Arc-wrapped for concurrency)
pub struct AppState {
    entry: EntryService,
    tokens: TokenIssuer,
}

#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Serialize, Deserialize)]
pub struct ScanRequest {
    pub qr: String,
    pub action: AccessAction,
}

#[derive(Serialize, Deserialize)]
pub struct DecodeRequest {
    pub qr: String,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub status: Option<SyncStatus>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationList {
    pub auth_ids: Vec<i64>,
}

/// Generic REST response (JSON)
#[derive(Serialize)]
pub struct RestResponse {
    pub success: bool,
    pub message: String,
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = state
        .tokens
        .validate(token)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Create Axum router with station endpoints
pub fn create_router(entry: EntryService, tokens: TokenIssuer) -> Router {
    let state = Arc::new(AppState { entry, tokens });

    let auth_routes = Router::new()
        .route("/scans", post(scan_handler))
        .route("/scans/decode", post(decode_handler))
        .route("/events", get(list_events_handler))
        .route("/sync", post(sync_handler))
        .route("/revocations", get(get_revocations_handler).put(put_revocations_handler))
        .route("/revocations/refresh", post(refresh_revocations_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/register", post(register_handler))
        .route("/login", post(login_handler))
        .route("/health", get(health_handler))
        .merge(auth_routes)
        .with_state(state)
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Credentials>,
) -> Result<(StatusCode, Json<RestResponse>)> {
    let operator = Operator {
        username: payload.username.clone(),
        password_hash: hash_password(&payload.password)?,
    };
    state.entry.storage().create_operator(operator)?;
    info!(username = %payload.username, "operator registered");
    Ok((
        StatusCode::CREATED,
        Json(RestResponse {
            success: true,
            message: "Operator registered".to_string(),
        }),
    ))
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Credentials>,
) -> Result<Json<LoginResponse>> {
    let operator = state
        .entry
        .storage()
        .get_operator(&payload.username)?
        .ok_or(Error::Unauthorized)?;

    if !verify_password(&payload.password, &operator.password_hash)? {
        return Err(Error::Unauthorized);
    }

    let token = state.tokens.issue(&operator.username)?;
    Ok(Json(LoginResponse { token }))
}

/// Handler: validate a scanned code and record the access event
async fn scan_handler(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<OperatorClaims>,
    Json(payload): Json<ScanRequest>,
) -> Result<Json<AccessEvent>> {
    let event = state
        .entry
        .scan(&payload.qr, payload.action, Some(claims.sub), Utc::now())
        .await?;
    Ok(Json(event))
}

/// Handler: decode only, nothing is recorded
async fn decode_handler(Json(payload): Json<DecodeRequest>) -> Response {
    match qr::parse(&payload.qr) {
        Ok(parsed) => Json::<QrPayload>(parsed.payload).into_response(),
        Err(_) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "success": false, "scanResult": ScanResult::FormatError })),
        )
            .into_response(),
    }
}

async fn list_events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<AccessEvent>>> {
    Ok(Json(state.entry.storage().list_events(query.status)?))
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Result<Json<SyncReport>> {
    Ok(Json(state.entry.sync_pending(Utc::now()).await?))
}

async fn get_revocations_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RevocationList>> {
    let mut auth_ids: Vec<i64> = state.entry.storage().revoked_ids()?.into_iter().collect();
    auth_ids.sort_unstable();
    Ok(Json(RevocationList { auth_ids }))
}

async fn put_revocations_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RevocationList>,
) -> Result<Json<RestResponse>> {
    state.entry.storage().replace_revocations(&payload.auth_ids)?;
    Ok(Json(RestResponse {
        success: true,
        message: format!("{} revocations cached", payload.auth_ids.len()),
    }))
}

async fn refresh_revocations_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RestResponse>> {
    let count = state.entry.refresh_revocations().await?;
    Ok(Json(RestResponse {
        success: true,
        message: format!("{count} revocations cached"),
    }))
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "message": "Atlas entry station healthy",
        "online": state.entry.has_backend(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::verify::tests::{ring, sign_code, signing_key};
    use axum::body::{to_bytes, Body};
    use tower::ServiceExt; // For .oneshot() testing

    fn app() -> Router {
        let storage = Storage::open_temporary().expect("Storage for REST test");
        let entry = EntryService::new(storage, ring(&signing_key()), 5);
        create_router(entry, TokenIssuer::new(b"test-secret", 600))
    }

    fn json_request(method: &str, uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .uri(uri)
            .method(method)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn login(app: &Router) -> String {
        let credentials = json!({"username": "porter", "password": "gate"});
        let response = app
            .clone()
            .oneshot(json_request("POST", "/register", None, credentials.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(json_request("POST", "/login", None, credentials))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_and_auth_required() {
        let app = app();
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["online"], false);

        let response = app
            .clone()
            .oneshot(json_request("POST", "/scans", None, json!({"qr": "x.y", "action": "ENTRY"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(json_request("GET", "/events", Some("not-a-token"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_login_rejects_bad_password_and_duplicate_register() {
        let app = app();
        login(&app).await;

        let response = app
            .clone()
            .oneshot(json_request("POST", "/login", None, json!({"username": "porter", "password": "nope"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(json_request("POST", "/register", None, json!({"username": "porter", "password": "x"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_scan_records_pending_event() {
        let app = app();
        let token = login(&app).await;
        // valid for the next hour, whatever the wall clock says
        let now = Utc::now().timestamp();
        let qr = sign_code(
            &signing_key(),
            &json!({"a": 9, "o": 1, "u": "D-4", "f": now - 60, "t": now + 3600, "k": "k1"}),
        );

        let response = app
            .clone()
            .oneshot(json_request("POST", "/scans", Some(&token), json!({"qr": qr, "action": "ENTRY"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let event = body_json(response).await;
        assert_eq!(event["scanResult"], "VALID");
        assert_eq!(event["syncStatus"], "PENDING");
        assert_eq!(event["operator"], "porter");
        assert_eq!(event["authId"], 9);

        let response = app
            .clone()
            .oneshot(json_request("GET", "/events?status=PENDING", Some(&token), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

        // offline station cannot sync
        let response = app
            .oneshot(json_request("POST", "/sync", Some(&token), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_decode_endpoint() {
        let app = app();
        let token = login(&app).await;

        let qr = "eyJhIjoxMjMsIm8iOjQ1NiwidSI6IkEtMTAxIiwiZiI6MTcwMDAwMDAwMCwidCI6MTcwMDAwMzYwMCwiayI6ImsxIn0.c2lnbmF0dXJlYnl0ZXM";
        let response = app
            .clone()
            .oneshot(json_request("POST", "/scans/decode", Some(&token), json!({"qr": qr})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["authId"], 123);
        assert_eq!(payload["validFrom"], "2023-11-14T22:13:20.000Z");

        let response = app
            .oneshot(json_request("POST", "/scans/decode", Some(&token), json!({"qr": "not-a-valid-qr-code"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["scanResult"], "FORMAT_ERROR");
    }

    #[tokio::test]
    async fn test_revocations_round_trip() {
        let app = app();
        let token = login(&app).await;

        let response = app
            .clone()
            .oneshot(json_request("PUT", "/revocations", Some(&token), json!({"authIds": [5, 3]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(json_request("GET", "/revocations", Some(&token), json!({})))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["authIds"], json!([3, 5]));
    }
}
