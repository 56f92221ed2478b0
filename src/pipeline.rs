use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{Asset, AuditEntry, InputToken};
use crate::error::{ApiError, ApiResult};
use crate::image_processing::{self, ImagePayload};
use crate::prompt::BgColor;
use crate::state::AppState;
use crate::storage::{self, StoredObject, get_extension_from_mime_type};

#[derive(Debug, Clone)]
pub struct GeneratedAsset {
    pub asset_id: String,
    pub preview_url: String,
    pub input_token: String,
}

pub enum InputLookup {
    Found(StoredObject),
    NotFound,
    Forbidden,
    Expired,
}

pub fn preview_path(asset_id: &str) -> String {
    format!("/api/id/asset/{asset_id}/preview")
}

fn new_asset_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("id_{}", &raw[..16])
}

fn new_input_token() -> String {
    format!("t_{}", Uuid::new_v4().simple())
}

/// Turns one uploaded photo into a stored, immutable asset.
///
/// Nothing is recorded in `id_assets` until the provider output is stored
/// under both keys, so a failure anywhere before that leaves no asset behind.
pub async fn generate(
    state: &AppState,
    user_id: &str,
    bg_color: &str,
    images: &[String],
    now: i64,
) -> ApiResult<GeneratedAsset> {
    let bg_color: BgColor = bg_color.parse().map_err(|_| ApiError::BadBgColor)?;
    let data_url = match images {
        [single] if !single.trim().is_empty() => single,
        _ => return Err(ApiError::MissingImage),
    };
    let decoded = image_processing::decode_data_url(data_url).map_err(|err| {
        debug!(error = %err, "rejected data url");
        ApiError::BadDataUrl
    })?;

    let (input, dimensions) = downscale(decoded, state).await;
    if let Some((width, height)) = dimensions {
        debug!(width, height, bytes = input.bytes.len(), "input prepared");
    }

    let asset_id = new_asset_id();
    let input_key = storage::input_key(&asset_id, get_extension_from_mime_type(&input.mime_type));
    state
        .storage
        .put(&input_key, &input.bytes, &input.mime_type)
        .await?;
    let input_token = new_input_token();
    state
        .db
        .put_input_token(&InputToken {
            asset_id: asset_id.clone(),
            token: input_token.clone(),
            input_key,
            expires_at: now + state.config.input_ttl_seconds,
            created_at: now,
        })
        .await?;

    let image = image_processing::to_data_url(&input.mime_type, &input.bytes);
    let generated = state.generator.generate(bg_color.prompt(), &image).await?;
    let output = state.generator.fetch_result(&generated.result_url).await?;

    let ext = get_extension_from_mime_type(&output.mime_type);
    let hd_key = storage::hd_key(&asset_id, ext);
    let preview_key = storage::preview_key(&asset_id, ext);
    state
        .storage
        .put(&hd_key, &output.bytes, &output.mime_type)
        .await?;
    state
        .storage
        .put(&preview_key, &output.bytes, &output.mime_type)
        .await?;

    let asset = Asset {
        asset_id: asset_id.clone(),
        bg_color: bg_color.to_string(),
        preview_key,
        hd_key,
        mime_type: output.mime_type.clone(),
        meta: json!({ "providerSize": generated.meta.size, "providerModel": generated.meta.model })
            .to_string(),
        created_at: now,
    };
    let audit = AuditEntry {
        id: Uuid::new_v4().to_string(),
        user_id: Some(user_id.to_string()),
        event: "id_generate".to_string(),
        meta: json!({ "assetId": asset_id, "bgColor": bg_color.as_str() }).to_string(),
        created_at: now,
    };
    state.db.insert_asset(&asset, &audit).await?;
    info!(asset_id = %asset_id, bg_color = %bg_color, bytes = output.bytes.len(), "asset generated");

    Ok(GeneratedAsset {
        preview_url: preview_path(&asset_id),
        asset_id,
        input_token,
    })
}

async fn downscale(input: ImagePayload, state: &AppState) -> (ImagePayload, Option<(u32, u32)>) {
    let limits = state.config.downscale;
    let fallback = input.clone();
    tokio::task::spawn_blocking(move || image_processing::downscale_to_jpeg(input, &limits))
        .await
        .unwrap_or((fallback, None))
}

pub async fn load_preview(state: &AppState, asset_id: &str) -> ApiResult<StoredObject> {
    let asset = state
        .db
        .find_asset(asset_id)
        .await?
        .ok_or(ApiError::AssetNotFound)?;
    state
        .storage
        .get(&asset.preview_key)
        .await?
        .ok_or(ApiError::PreviewNotFound)
}

/// Diagnostic access to the stored upload, gated by its short-lived token.
pub async fn load_input(
    state: &AppState,
    asset_id: &str,
    token: &str,
    now: i64,
) -> anyhow::Result<InputLookup> {
    let Some(row) = state.db.find_input_token(asset_id).await? else {
        return Ok(InputLookup::NotFound);
    };
    if token.is_empty() || token != row.token {
        return Ok(InputLookup::Forbidden);
    }
    if row.expires_at <= now {
        return Ok(InputLookup::Expired);
    }
    Ok(match state.storage.get(&row.input_key).await? {
        Some(object) => InputLookup::Found(object),
        None => InputLookup::NotFound,
    })
}
