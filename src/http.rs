use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::CookieJar;
use chrono::Utc;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::warn;

use crate::admin::{self, CreateKeysRequest};
use crate::error::{ApiError, ApiResult};
use crate::grants;
use crate::identity::{Identity, identify};
use crate::ledger;
use crate::pipeline::{self, InputLookup};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateBody {
    bg_color: Option<String>,
    images: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckBody {
    key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RedeemBody {
    key: Option<String>,
    asset_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InputQuery {
    token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.allow_origins);
    let body_limit = state.config.max_body_bytes;
    Router::new()
        .route("/api/id/generate", post(generate))
        .route("/api/id/asset/{asset_id}/preview", get(preview))
        .route("/api/id/input/{asset_id}", get(input))
        .route("/api/id/key/check", post(check_key))
        .route("/api/id/key/redeem", post(redeem_key))
        .route("/api/id/dl/{grant_id}", get(download))
        .route("/api/admin/keys/create", post(create_keys))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new().include_headers(false)))
        .with_state(state)
}

/// Exact-match origin allow-list with credentials.
pub fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

fn now() -> i64 {
    Utc::now().timestamp()
}

/// Unreadable bodies count as empty ones so field validation reports them.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> T {
    serde_json::from_slice(body).unwrap_or_default()
}

fn json_ok(value: Value) -> Response {
    let mut response = Json(value).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn with_jar(jar: CookieJar, result: ApiResult<Response>) -> Response {
    match result {
        Ok(response) => (jar, response).into_response(),
        Err(err) => (jar, err).into_response(),
    }
}

fn bytes_response(bytes: Vec<u8>, content_type: &str, cache_control: &'static str) -> Response {
    let mut response = (StatusCode::OK, bytes).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    response
}

async fn identify_request(state: &AppState, jar: CookieJar) -> Result<(Identity, CookieJar), Response> {
    identify(&state.db, jar, state.config.cookie_secure)
        .await
        .map_err(|err| ApiError::from(err).into_response())
}

async fn generate(State(state): State<AppState>, jar: CookieJar, body: Bytes) -> Response {
    let (identity, jar) = match identify_request(&state, jar).await {
        Ok(value) => value,
        Err(response) => return response,
    };
    let request: GenerateBody = parse_body(&body);
    let bg_color = request
        .bg_color
        .filter(|color| !color.trim().is_empty())
        .unwrap_or_else(|| "white".to_string());
    let images = request.images.unwrap_or_default();
    let result = pipeline::generate(&state, &identity.user_id, &bg_color, &images, now())
        .await
        .map(|generated| {
            json_ok(json!({
                "ok": true,
                "assetId": generated.asset_id,
                "previewUrl": generated.preview_url,
            }))
        });
    with_jar(jar, result)
}

async fn preview(State(state): State<AppState>, Path(asset_id): Path<String>) -> Response {
    match pipeline::load_preview(&state, &asset_id).await {
        Ok(object) => bytes_response(object.bytes, &object.content_type, "public, max-age=300"),
        Err(err) => err.into_response(),
    }
}

async fn input(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    Query(query): Query<InputQuery>,
) -> Response {
    let token = query.token.unwrap_or_default();
    match pipeline::load_input(&state, &asset_id, &token, now()).await {
        Ok(InputLookup::Found(object)) => {
            bytes_response(object.bytes, &object.content_type, "private, max-age=0")
        }
        Ok(InputLookup::NotFound) => (StatusCode::NOT_FOUND, "not found").into_response(),
        Ok(InputLookup::Forbidden) => (StatusCode::FORBIDDEN, "forbidden").into_response(),
        Ok(InputLookup::Expired) => (StatusCode::FORBIDDEN, "expired").into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn check_key(State(state): State<AppState>, body: Bytes) -> Response {
    let request: CheckBody = parse_body(&body);
    let key = request.key.unwrap_or_default();
    match ledger::check(&state.db, &key, now()).await {
        Ok(remaining) => json_ok(json!({ "ok": true, "remainingUses": remaining })),
        Err(err) => err.into_response(),
    }
}

async fn redeem_key(State(state): State<AppState>, jar: CookieJar, body: Bytes) -> Response {
    let (identity, jar) = match identify_request(&state, jar).await {
        Ok(value) => value,
        Err(response) => return response,
    };
    let request: RedeemBody = parse_body(&body);
    let key = request.key.unwrap_or_default();
    let asset_id = request.asset_id.unwrap_or_default();
    let result = ledger::redeem(
        &state.db,
        state.grant_policy(),
        &identity.user_id,
        &key,
        &asset_id,
        now(),
    )
    .await
    .map(|redemption| {
        json_ok(json!({
            "ok": true,
            "remainingUses": redemption.remaining_uses,
            "downloadUrl": redemption.download_url,
        }))
    });
    with_jar(jar, result)
}

async fn download(
    State(state): State<AppState>,
    Path(grant_id): Path<String>,
    jar: CookieJar,
) -> Response {
    let (identity, jar) = match identify_request(&state, jar).await {
        Ok(value) => value,
        Err(response) => return response,
    };
    let result = grants::download(&state.db, &state.storage, &grant_id, &identity.user_id, now())
        .await
        .map(|download| {
            let disposition = format!("attachment; filename=\"{}\"", download.filename);
            let mut response =
                bytes_response(download.bytes, &download.content_type, "private, max-age=0");
            if let Ok(value) = HeaderValue::from_str(&disposition) {
                response
                    .headers_mut()
                    .insert(header::CONTENT_DISPOSITION, value);
            }
            response
        });
    with_jar(jar, result)
}

async fn create_keys(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !admin::is_authorized(state.config.admin_api_key.as_deref(), &headers) {
        return ApiError::Unauthorized.into_response();
    }
    let request: CreateKeysRequest = parse_body(&body);
    match admin::create_keys(&state.db, &state.config.redeem_code_prefix, request, now()).await {
        Ok(created) => match serde_json::to_value(&created) {
            Ok(value) => json_ok(value),
            Err(err) => ApiError::Internal(err.into()).into_response(),
        },
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn not_found() -> Response {
    ApiError::NotFound.into_response()
}
