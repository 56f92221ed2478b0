//! Shared fixtures for unit tests.

use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use tempfile::{TempDir, tempdir};

use crate::ark::{FetchedImage, GeneratedImage, GenerationError, ImageGenerator, ProviderMeta};
use crate::config::Config;
use crate::db::{Asset, AuditEntry, Database, RedeemCode};
use crate::image_processing;
use crate::state::AppState;
use crate::storage::{self, LocalFileStorage};

pub fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 7 % 256) as u8, (y * 11 % 256) as u8, 128])
    });
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn png_data_url(width: u32, height: u32) -> String {
    image_processing::to_data_url("image/png", &sample_png(width, height))
}

pub async fn test_db() -> (TempDir, Database) {
    let dir = tempdir().unwrap();
    let db = Database::connect(&dir.path().join("test.db"), Duration::from_secs(5))
        .await
        .unwrap();
    (dir, db)
}

pub fn test_storage(dir: &Path) -> LocalFileStorage {
    LocalFileStorage::new(dir.join("objects"), Duration::from_secs(5))
}

pub fn redeem_code(code_hash: &str, total_uses: i64, expires_at: Option<i64>) -> RedeemCode {
    RedeemCode {
        code_hash: code_hash.to_string(),
        code_hint: "hint".to_string(),
        total_uses,
        used_uses: 0,
        expires_at,
        created_at: 0,
        note: String::new(),
    }
}

pub async fn insert_asset(db: &Database, asset_id: &str) -> Asset {
    let asset = Asset {
        asset_id: asset_id.to_string(),
        bg_color: "white".to_string(),
        preview_key: storage::preview_key(asset_id, "png"),
        hd_key: storage::hd_key(asset_id, "png"),
        mime_type: "image/png".to_string(),
        meta: "{}".to_string(),
        created_at: 0,
    };
    let audit = AuditEntry {
        id: format!("log-{asset_id}"),
        user_id: None,
        event: "id_generate".to_string(),
        meta: "{}".to_string(),
        created_at: 0,
    };
    db.insert_asset(&asset, &audit).await.unwrap();
    asset
}

pub fn test_config(dir: &Path) -> Config {
    let data_dir = dir.to_string_lossy().to_string();
    Config::from_lookup(move |key| {
        let value = match key {
            "ARK_API_KEY" => "ark-test",
            "DATA_DIR" => data_dir.as_str(),
            "ADMIN_API_KEY" => "admin-secret",
            "ALLOW_ORIGINS" => "https://app.example",
            "COOKIE_SECURE" => "false",
            _ => return None,
        };
        Some(value.to_string())
    })
    .unwrap()
}

/// Records every call and answers with a small PNG, or fails on demand.
#[derive(Clone, Default)]
pub struct StubGenerator {
    calls: Arc<Mutex<Vec<(String, String)>>>,
    fail: bool,
}

impl StubGenerator {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageGenerator for StubGenerator {
    async fn generate(&self, prompt: &str, image: &str) -> Result<GeneratedImage, GenerationError> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), image.to_string()));
        if self.fail {
            return Err(GenerationError::MalformedResponse {
                detail: "no data".to_string(),
            });
        }
        Ok(GeneratedImage {
            result_url: "https://cdn.example.com/result.png".to_string(),
            meta: ProviderMeta {
                model: "stub-model".to_string(),
                size: "2K".to_string(),
            },
        })
    }

    async fn fetch_result(&self, _result_url: &str) -> Result<FetchedImage, GenerationError> {
        Ok(FetchedImage {
            bytes: sample_png(24, 32),
            mime_type: "image/png".to_string(),
        })
    }
}

pub async fn test_state(generator: StubGenerator) -> (TempDir, AppState) {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let db = Database::new(&config).await.unwrap();
    let storage = LocalFileStorage::new(config.storage_dir.clone(), config.store_timeout);
    let state = AppState::new(config, db, storage, Arc::new(generator));
    (dir, state)
}
