use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::db::{AuditEntry, ConditionalUpdate, Database, Grant, RedeemCode};
use crate::error::{ApiError, ApiResult};
use crate::grants::{self, GrantPolicy};
use crate::storage::compute_hash;

#[derive(Debug, Clone)]
pub struct Redemption {
    pub grant: Grant,
    pub remaining_uses: i64,
    pub download_url: String,
}

/// Operator-facing hint such as `IDPHO…3F9A`; never enough to replay a code.
pub fn hint_code(code: &str) -> String {
    let compact: Vec<char> = code.chars().filter(|ch| !ch.is_whitespace()).collect();
    let head: String = compact.iter().take(5).collect();
    let tail: String = compact[compact.len().saturating_sub(4)..].iter().collect();
    format!("{head}…{tail}")
}

pub fn hash_code(code: &str) -> String {
    compute_hash(code.trim())
}

/// Maps a code row to the caller-visible outcome: remaining uses when the
/// code is usable, otherwise the first reason it is not.
fn classify(code: Option<&RedeemCode>, now: i64) -> ApiResult<i64> {
    let code = code.ok_or(ApiError::KeyInvalid)?;
    if code.is_expired(now) {
        return Err(ApiError::KeyExpired);
    }
    let remaining = code.remaining_uses();
    if remaining <= 0 {
        return Err(ApiError::KeyUsedUp);
    }
    Ok(remaining)
}

/// Read-only probe. Returns the remaining use count.
pub async fn check(db: &Database, code: &str, now: i64) -> ApiResult<i64> {
    let code = code.trim();
    if code.is_empty() {
        return Err(ApiError::BadRequest);
    }
    let row = db.find_redeem_code(&hash_code(code)).await?;
    classify(row.as_ref(), now)
}

/// Consumes one use of `code` and binds a fresh grant for `asset_id` to
/// `user_id`.
///
/// The use is taken by a single conditional update. Grant creation is a
/// separate write: if it fails the use stays consumed and the failure is
/// logged for operators instead of being rolled back.
pub async fn redeem(
    db: &Database,
    policy: GrantPolicy,
    user_id: &str,
    code: &str,
    asset_id: &str,
    now: i64,
) -> ApiResult<Redemption> {
    let code = code.trim();
    let asset_id = asset_id.trim();
    if code.is_empty() || asset_id.is_empty() {
        return Err(ApiError::BadRequest);
    }
    if db.find_asset(asset_id).await?.is_none() {
        return Err(ApiError::AssetNotFound);
    }

    let code_hash = hash_code(code);
    let hint = hint_code(code);
    let consumed = db
        .conditional_update(ConditionalUpdate::ConsumeCodeUse {
            code_hash: &code_hash,
            now,
        })
        .await?;
    if consumed.is_none() {
        let row = db.find_redeem_code(&code_hash).await?;
        let reason = match classify(row.as_ref(), now) {
            Ok(_) => ApiError::KeyRedeemFailed,
            Err(reason) => reason,
        };
        info!(code_hint = %hint, asset_id, reason = reason.code(), "redeem rejected");
        return Err(reason);
    }

    let remaining_uses = db
        .find_redeem_code(&code_hash)
        .await?
        .map(|row| row.remaining_uses())
        .unwrap_or(0);

    let grant = match grants::issue(db, policy, user_id, asset_id, now).await {
        Ok(grant) => grant,
        Err(err) => {
            error!(
                code_hint = %hint,
                asset_id,
                error = ?err,
                "redeem consumed a use but grant creation failed"
            );
            return Err(err.into());
        }
    };

    db.append_audit(&AuditEntry {
        id: Uuid::new_v4().to_string(),
        user_id: Some(user_id.to_string()),
        event: "id_grant_redeem".to_string(),
        meta: json!({
            "grantId": grant.grant_id,
            "assetId": asset_id,
            "codeHint": hint,
        })
        .to_string(),
        created_at: now,
    })
    .await?;
    info!(code_hint = %hint, asset_id, grant_id = %grant.grant_id, remaining_uses, "code redeemed");

    Ok(Redemption {
        download_url: grants::download_path(&grant.grant_id),
        grant,
        remaining_uses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_asset, redeem_code, test_db};
    use std::sync::Arc;

    const POLICY: GrantPolicy = GrantPolicy {
        ttl_seconds: 600,
        max_downloads: 3,
    };

    async fn provision(db: &Database, code: &str, total_uses: i64, expires_at: Option<i64>) {
        let mut row = redeem_code(&hash_code(code), total_uses, expires_at);
        row.code_hint = hint_code(code);
        db.insert_redeem_codes(&[row]).await.unwrap();
    }

    #[test]
    fn hints_keep_only_edges() {
        assert_eq!(hint_code("IDPHOTO-1A2B-3C4D"), "IDPHO…3C4D");
        assert_eq!(hint_code(" AB CD "), "ABCD…ABCD");
    }

    #[tokio::test]
    async fn check_reports_in_priority_order() {
        let (_dir, db) = test_db().await;
        provision(&db, "CODE-LIVE-0001", 2, None).await;
        provision(&db, "CODE-OLD-00001", 1, Some(100)).await;

        assert!(matches!(check(&db, "never-issued", 0).await, Err(ApiError::KeyInvalid)));
        assert!(matches!(check(&db, "CODE-OLD-00001", 100).await, Err(ApiError::KeyExpired)));
        assert!(matches!(check(&db, "   ", 0).await, Err(ApiError::BadRequest)));
        assert_eq!(check(&db, " CODE-LIVE-0001 ", 0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn check_never_mutates() {
        let (_dir, db) = test_db().await;
        provision(&db, "CODE-LIVE-0001", 1, None).await;
        for _ in 0..5 {
            assert_eq!(check(&db, "CODE-LIVE-0001", 0).await.unwrap(), 1);
        }
        let row = db
            .find_redeem_code(&hash_code("CODE-LIVE-0001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.used_uses, 0);
    }

    #[tokio::test]
    async fn redeem_issues_grant_and_audits_hint() {
        let (_dir, db) = test_db().await;
        insert_asset(&db, "id_asset0000000001").await;
        provision(&db, "CODE-LIVE-0001", 2, None).await;

        let redemption = redeem(&db, POLICY, "user-0000000001", "CODE-LIVE-0001", "id_asset0000000001", 1_000)
            .await
            .unwrap();
        assert_eq!(redemption.remaining_uses, 1);
        assert_eq!(
            redemption.download_url,
            format!("/api/id/dl/{}", redemption.grant.grant_id)
        );
        assert_eq!(redemption.grant.expires_at, 1_600);
        assert_eq!(redemption.grant.max_downloads, 3);

        let audit = db.list_audit("id_grant_redeem").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].meta.contains("CODE-…0001"));
        assert!(!audit[0].meta.contains("CODE-LIVE-0001"));
    }

    #[tokio::test]
    async fn redeem_missing_asset_leaves_code_untouched() {
        let (_dir, db) = test_db().await;
        provision(&db, "CODE-LIVE-0001", 1, None).await;
        let result = redeem(&db, POLICY, "user-0000000001", "CODE-LIVE-0001", "id_missing", 0).await;
        assert!(matches!(result, Err(ApiError::AssetNotFound)));
        let row = db
            .find_redeem_code(&hash_code("CODE-LIVE-0001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.used_uses, 0);
    }

    #[tokio::test]
    async fn redeem_explains_rejections() {
        let (_dir, db) = test_db().await;
        insert_asset(&db, "id_asset0000000001").await;
        provision(&db, "CODE-OLD-00001", 1, Some(10)).await;
        provision(&db, "CODE-ONCE-0001", 1, None).await;

        let expired = redeem(&db, POLICY, "u-000000001", "CODE-OLD-00001", "id_asset0000000001", 10).await;
        assert!(matches!(expired, Err(ApiError::KeyExpired)));
        let invalid = redeem(&db, POLICY, "u-000000001", "CODE-NOPE-0001", "id_asset0000000001", 10).await;
        assert!(matches!(invalid, Err(ApiError::KeyInvalid)));

        redeem(&db, POLICY, "u-000000001", "CODE-ONCE-0001", "id_asset0000000001", 10)
            .await
            .unwrap();
        let used_up = redeem(&db, POLICY, "u-000000001", "CODE-ONCE-0001", "id_asset0000000001", 10).await;
        assert!(matches!(used_up, Err(ApiError::KeyUsedUp)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redeems_never_overspend() {
        let (_dir, db) = test_db().await;
        insert_asset(&db, "id_asset0000000001").await;
        provision(&db, "CODE-MULTI-001", 3, None).await;
        let db = Arc::new(db);

        let mut handles = Vec::new();
        for index in 0..12 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                let user = format!("user-concurrent-{index:02}");
                redeem(&db, POLICY, &user, "CODE-MULTI-001", "id_asset0000000001", 0).await
            }));
        }
        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(err) => assert!(matches!(err, ApiError::KeyUsedUp)),
            }
        }
        assert_eq!(successes, 3);
        let row = db
            .find_redeem_code(&hash_code("CODE-MULTI-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.used_uses, row.total_uses);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_simultaneous_redeems_of_single_use_code() {
        let (_dir, db) = test_db().await;
        insert_asset(&db, "id_asset0000000001").await;
        provision(&db, "CODE-ONCE-0001", 1, None).await;
        let db = Arc::new(db);

        let first = {
            let db = db.clone();
            tokio::spawn(async move {
                redeem(&db, POLICY, "user-a-000001", "CODE-ONCE-0001", "id_asset0000000001", 0).await
            })
        };
        let second = {
            let db = db.clone();
            tokio::spawn(async move {
                redeem(&db, POLICY, "user-b-000001", "CODE-ONCE-0001", "id_asset0000000001", 0).await
            })
        };
        let outcomes = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|outcome| matches!(outcome, Err(ApiError::KeyUsedUp))));
    }
}
