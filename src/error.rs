use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::ark::{GenerationError, truncate_diagnostic};

/// Every failure a handler can report. The wire code is what clients key on.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("BAD_REQUEST")]
    BadRequest,
    #[error("BAD_BG_COLOR")]
    BadBgColor,
    #[error("MISSING_IMAGE")]
    MissingImage,
    #[error("BAD_DATA_URL")]
    BadDataUrl,
    #[error("ASSET_NOT_FOUND")]
    AssetNotFound,
    #[error("PREVIEW_NOT_FOUND")]
    PreviewNotFound,
    #[error("HD_NOT_FOUND")]
    HdNotFound,
    #[error("KEY_INVALID")]
    KeyInvalid,
    #[error("KEY_EXPIRED")]
    KeyExpired,
    #[error("KEY_USED_UP")]
    KeyUsedUp,
    #[error("KEY_REDEEM_FAILED")]
    KeyRedeemFailed,
    #[error("GRANT_NOT_FOUND")]
    GrantNotFound,
    #[error("GRANT_EXPIRED")]
    GrantExpired,
    #[error("GRANT_DOWNLOAD_LIMIT")]
    GrantDownloadLimit,
    #[error("UNAUTHORIZED")]
    Unauthorized,
    #[error("NOT_FOUND")]
    NotFound,
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest => "BAD_REQUEST",
            ApiError::BadBgColor => "BAD_BG_COLOR",
            ApiError::MissingImage => "MISSING_IMAGE",
            ApiError::BadDataUrl => "BAD_DATA_URL",
            ApiError::AssetNotFound => "ASSET_NOT_FOUND",
            ApiError::PreviewNotFound => "PREVIEW_NOT_FOUND",
            ApiError::HdNotFound => "HD_NOT_FOUND",
            ApiError::KeyInvalid => "KEY_INVALID",
            ApiError::KeyExpired => "KEY_EXPIRED",
            ApiError::KeyUsedUp => "KEY_USED_UP",
            ApiError::KeyRedeemFailed => "KEY_REDEEM_FAILED",
            ApiError::GrantNotFound => "GRANT_NOT_FOUND",
            ApiError::GrantExpired => "GRANT_EXPIRED",
            ApiError::GrantDownloadLimit => "GRANT_DOWNLOAD_LIMIT",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::Generation(_) | ApiError::Internal(_) => "SERVER_ERROR",
        }
    }

    /// Logical entitlement outcomes travel in a 200 envelope; only
    /// validation, missing resources, auth and server faults change status.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest
            | ApiError::BadBgColor
            | ApiError::MissingImage
            | ApiError::BadDataUrl => StatusCode::BAD_REQUEST,
            ApiError::AssetNotFound
            | ApiError::PreviewNotFound
            | ApiError::HdNotFound
            | ApiError::GrantNotFound
            | ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::KeyInvalid
            | ApiError::KeyExpired
            | ApiError::KeyUsedUp
            | ApiError::KeyRedeemFailed
            | ApiError::GrantExpired
            | ApiError::GrantDownloadLimit => StatusCode::OK,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Generation(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Generation(err) => {
                let reason = match err {
                    GenerationError::Fetch { .. } => err.to_string(),
                    _ => "GENERATION_FAILED".to_string(),
                };
                error!(error = %err, "generation failed");
                json!({
                    "ok": false,
                    "error": self.code(),
                    "reason": reason,
                    "detail": truncate_diagnostic(&err.to_string()),
                })
            }
            ApiError::Internal(err) => {
                error!(error = ?err, "request failed");
                json!({
                    "ok": false,
                    "error": self.code(),
                    "detail": truncate_diagnostic(&err.to_string()),
                })
            }
            _ => json!({ "ok": false, "error": self.code() }),
        };
        let mut response = (status, Json(body)).into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}
