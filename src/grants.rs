use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{ConditionalUpdate, Database, Grant};
use crate::error::{ApiError, ApiResult};
use crate::storage::{LocalFileStorage, get_extension_from_mime_type};

#[derive(Debug, Clone, Copy)]
pub struct GrantPolicy {
    pub ttl_seconds: i64,
    pub max_downloads: i64,
}

#[derive(Debug)]
pub struct Download {
    pub asset_id: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub filename: String,
    pub download_count: i64,
}

pub fn download_path(grant_id: &str) -> String {
    format!("/api/id/dl/{grant_id}")
}

fn new_grant_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("g_{}", &raw[..18])
}

pub async fn issue(
    db: &Database,
    policy: GrantPolicy,
    user_id: &str,
    asset_id: &str,
    now: i64,
) -> anyhow::Result<Grant> {
    let grant = Grant {
        grant_id: new_grant_id(),
        user_id: user_id.to_string(),
        asset_id: asset_id.to_string(),
        kind: "redeem".to_string(),
        expires_at: now + policy.ttl_seconds,
        max_downloads: policy.max_downloads,
        download_count: 0,
        used_at: None,
        created_at: now,
    };
    db.insert_grant(&grant).await?;
    Ok(grant)
}

fn gate(grant: &Grant, now: i64) -> ApiResult<()> {
    if now >= grant.expires_at {
        return Err(ApiError::GrantExpired);
    }
    if grant.download_count >= grant.max_downloads {
        return Err(ApiError::GrantDownloadLimit);
    }
    Ok(())
}

/// One fetch attempt against a grant.
///
/// The attempt is counted before any bytes are read, so a retried transfer
/// spends quota like any other request.
pub async fn download(
    db: &Database,
    storage: &LocalFileStorage,
    grant_id: &str,
    user_id: &str,
    now: i64,
) -> ApiResult<Download> {
    let grant = db
        .find_grant(grant_id, user_id)
        .await?
        .ok_or(ApiError::GrantNotFound)?;
    gate(&grant, now)?;

    let counted = db
        .conditional_update(ConditionalUpdate::CountDownload {
            grant_id,
            user_id,
            now,
        })
        .await?;
    let Some(download_count) = counted else {
        // Lost a race against another fetch; report whatever stopped us.
        let current = db
            .find_grant(grant_id, user_id)
            .await?
            .ok_or(ApiError::GrantNotFound)?;
        gate(&current, now)?;
        return Err(ApiError::GrantDownloadLimit);
    };
    info!(grant_id, asset_id = %grant.asset_id, download_count, "grant download counted");

    let asset = db
        .find_asset(&grant.asset_id)
        .await?
        .ok_or(ApiError::AssetNotFound)?;
    let object = match storage.get(&asset.hd_key).await? {
        Some(object) => object,
        None => {
            warn!(asset_id = %asset.asset_id, key = %asset.hd_key, "full-resolution object missing");
            return Err(ApiError::HdNotFound);
        }
    };
    let ext = get_extension_from_mime_type(&object.content_type);
    Ok(Download {
        filename: format!("idphoto_{}.{ext}", asset.asset_id),
        asset_id: asset.asset_id,
        bytes: object.bytes,
        content_type: object.content_type,
        download_count,
    })
}
