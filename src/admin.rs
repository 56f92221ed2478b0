use axum::http::{HeaderMap, header};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::db::{Database, RedeemCode};
use crate::ledger::{hash_code, hint_code};

const DEFAULT_COUNT: u64 = 200;
const MAX_COUNT: u64 = 5000;
const MAX_EXPIRES_DAYS: f64 = 36_500.0;
const MAX_COLLISION_ROUNDS: usize = 8;
const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeysRequest {
    #[serde(default, deserialize_with = "lenient_number")]
    pub count: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub total_uses: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub expires_days: Option<f64>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub note: Option<String>,
}

/// Accepts JSON numbers and numeric strings; anything else reads as absent.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let number = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(number.filter(|number| number.is_finite()))
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedKeys {
    pub ok: bool,
    pub keys: Vec<String>,
    pub total_uses: i64,
    pub expires_at: Option<i64>,
}

pub fn is_authorized(admin_api_key: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = admin_api_key.filter(|key| !key.is_empty()) else {
        return false;
    };
    let auth = match headers.get(header::AUTHORIZATION) {
        Some(value) => value.to_str().unwrap_or(""),
        None => return false,
    };
    let mut parts = auth.split_whitespace();
    let (Some(scheme), Some(token)) = (parts.next(), parts.next()) else {
        return false;
    };
    if scheme.eq_ignore_ascii_case("bearer") {
        return bool::from(expected.as_bytes().ct_eq(token.as_bytes()));
    }
    false
}

fn generate_code(prefix: &str) -> String {
    let mut bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let hex = hex::encode_upper(bytes);
    format!("{prefix}-{}-{}", &hex[..4], &hex[4..])
}

fn provisioned(code: &str, total_uses: i64, expires_at: Option<i64>, now: i64, note: &str) -> RedeemCode {
    RedeemCode {
        code_hash: hash_code(code),
        code_hint: hint_code(code),
        total_uses,
        used_uses: 0,
        expires_at,
        created_at: now,
        note: note.to_string(),
    }
}

/// Provisions a batch of codes. Only hashes and hints are stored; the
/// plaintext codes exist solely in the returned value.
pub async fn create_keys(
    db: &Database,
    prefix: &str,
    request: CreateKeysRequest,
    now: i64,
) -> anyhow::Result<CreatedKeys> {
    let count = request
        .count
        .map_or(DEFAULT_COUNT, |count| count.clamp(1.0, MAX_COUNT as f64) as u64)
        as usize;
    let total_uses = request
        .total_uses
        .map_or(1, |uses| uses.clamp(1.0, i32::MAX as f64) as i64);
    let expires_at = request
        .expires_days
        .filter(|days| *days > 0.0)
        .map(|days| days.min(MAX_EXPIRES_DAYS))
        .map(|days| now.saturating_add((days * SECONDS_PER_DAY as f64).round() as i64));
    let note = request.note.unwrap_or_default();

    let mut pending: Vec<String> = (0..count).map(|_| generate_code(prefix)).collect();
    let mut keys = Vec::with_capacity(count);
    for _ in 0..MAX_COLLISION_ROUNDS {
        if pending.is_empty() {
            break;
        }
        let rows: Vec<RedeemCode> = pending
            .iter()
            .map(|code| provisioned(code, total_uses, expires_at, now, &note))
            .collect();
        let skipped = db.insert_redeem_codes(&rows).await?;
        let mut retry = Vec::with_capacity(skipped.len());
        for (index, code) in pending.into_iter().enumerate() {
            if skipped.contains(&index) {
                retry.push(generate_code(prefix));
            } else {
                keys.push(code);
            }
        }
        pending = retry;
    }
    if !pending.is_empty() {
        warn!(missing = pending.len(), "could not provision every requested code");
    }
    info!(count = keys.len(), total_uses, expires_at, "redeem codes provisioned");

    Ok(CreatedKeys {
        ok: true,
        keys,
        total_uses,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_db;
    use axum::http::HeaderValue;

    #[test]
    fn authorize_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert!(is_authorized(Some("secret"), &headers));
        assert!(!is_authorized(None, &headers));
        assert!(!is_authorized(Some(""), &headers));
    }

    #[test]
    fn reject_invalid_auth() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(!is_authorized(Some("secret"), &headers));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic secret"));
        assert!(!is_authorized(Some("secret"), &headers));
        assert!(!is_authorized(Some("secret"), &HeaderMap::new()));
    }

    #[test]
    fn codes_follow_prefix_layout() {
        let code = generate_code("IDPHOTO");
        let parts: Vec<&str> = code.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "IDPHOTO");
        assert!(parts[1..]
            .iter()
            .all(|part| part.len() == 4 && part.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_lowercase())));
    }

    #[tokio::test]
    async fn creates_hashed_codes_only() {
        let (_dir, db) = test_db().await;
        let created = create_keys(
            &db,
            "IDPHOTO",
            CreateKeysRequest {
                count: Some(5.0),
                total_uses: Some(2.0),
                expires_days: Some(1.0),
                note: Some("launch".to_string()),
            },
            1_000,
        )
        .await
        .unwrap();
        assert_eq!(created.keys.len(), 5);
        assert_eq!(created.total_uses, 2);
        assert_eq!(created.expires_at, Some(1_000 + SECONDS_PER_DAY));

        for key in &created.keys {
            assert!(db.find_redeem_code(key).await.unwrap().is_none());
            let row = db.find_redeem_code(&hash_code(key)).await.unwrap().unwrap();
            assert_eq!(row.total_uses, 2);
            assert_eq!(row.used_uses, 0);
            assert_eq!(row.note, "launch");
            assert_ne!(row.code_hint, *key);
        }
    }

    #[tokio::test]
    async fn clamps_requested_values() {
        let (_dir, db) = test_db().await;
        let created = create_keys(
            &db,
            "IDPHOTO",
            CreateKeysRequest {
                count: Some(0.0),
                total_uses: Some(-3.0),
                expires_days: Some(-1.0),
                note: None,
            },
            0,
        )
        .await
        .unwrap();
        assert_eq!(created.keys.len(), 1);
        assert_eq!(created.total_uses, 1);
        assert_eq!(created.expires_at, None);
    }

    #[test]
    fn request_fields_are_coerced_one_by_one() {
        let request: CreateKeysRequest = serde_json::from_str(
            r#"{"count":3.0,"totalUses":"5","expiresDays":" 7 ","note":42}"#,
        )
        .unwrap();
        assert_eq!(request.count, Some(3.0));
        assert_eq!(request.total_uses, Some(5.0));
        assert_eq!(request.expires_days, Some(7.0));
        assert_eq!(request.note.as_deref(), Some("42"));

        let request: CreateKeysRequest =
            serde_json::from_str(r#"{"count":[1],"totalUses":"many","expiresDays":null}"#).unwrap();
        assert_eq!(request.count, None);
        assert_eq!(request.total_uses, None);
        assert_eq!(request.expires_days, None);
    }

    #[tokio::test]
    async fn string_fields_keep_requested_values() {
        let (_dir, db) = test_db().await;
        let request: CreateKeysRequest =
            serde_json::from_str(r#"{"count":3,"totalUses":5,"note":"x","expiresDays":"7"}"#)
                .unwrap();
        let created = create_keys(&db, "IDPHOTO", request, 100).await.unwrap();
        assert_eq!(created.keys.len(), 3);
        assert_eq!(created.total_uses, 5);
        assert_eq!(created.expires_at, Some(100 + 7 * SECONDS_PER_DAY));
    }

    #[tokio::test]
    async fn huge_expiry_is_capped() {
        let (_dir, db) = test_db().await;
        let request: CreateKeysRequest =
            serde_json::from_str(r#"{"count":1,"expiresDays":1e300}"#).unwrap();
        let created = create_keys(&db, "IDPHOTO", request, 1_000).await.unwrap();
        assert_eq!(
            created.expires_at,
            Some(1_000 + MAX_EXPIRES_DAYS as i64 * SECONDS_PER_DAY)
        );
        let row = db
            .find_redeem_code(&hash_code(&created.keys[0]))
            .await
            .unwrap()
            .unwrap();
        assert!(!row.is_expired(1_000));
    }
}
