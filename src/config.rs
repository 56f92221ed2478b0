use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_ARK_ENDPOINT: &str = "https://ark.cn-beijing.volces.com/api/v3/images/generations";
const DEFAULT_ARK_MODEL: &str = "doubao-seedream-4-5-251128";
const DEFAULT_ARK_SIZE: &str = "2K";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub storage_dir: PathBuf,
    pub admin_api_key: Option<String>,
    pub allow_origins: Vec<String>,
    pub ark: ArkConfig,
    pub store_timeout: Duration,
    pub grant_ttl_seconds: i64,
    pub grant_max_downloads: i64,
    pub input_ttl_seconds: i64,
    pub downscale: DownscaleConfig,
    pub max_body_bytes: usize,
    pub cookie_secure: bool,
    pub redeem_code_prefix: String,
}

#[derive(Debug, Clone)]
pub struct ArkConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub size: String,
    pub timeout: Duration,
}

/// Limits applied to the uploaded photo before it is sent to the provider.
#[derive(Debug, Clone, Copy)]
pub struct DownscaleConfig {
    pub max_edge: u32,
    pub quality_high: u8,
    pub quality_low: u8,
    pub max_bytes: usize,
}

impl Default for DownscaleConfig {
    fn default() -> Self {
        Self {
            max_edge: 1280,
            quality_high: 85,
            quality_low: 70,
            max_bytes: 1_500_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let seconds = |key: &str, default: u32| i64::from(parse_or(var(key), default));

        let data_dir = resolve_data_dir(var("DATA_DIR"));
        let db_path = var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("idphoto.db"));
        let storage_dir = var("STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("objects"));

        let api_key = var("ARK_API_KEY")
            .map(|value| value.trim().to_string())
            .context("ARK_API_KEY is required for photo generation")?;
        let ark = ArkConfig {
            api_key,
            endpoint: var("ARK_ENDPOINT").unwrap_or_else(|| DEFAULT_ARK_ENDPOINT.to_string()),
            model: var("ARK_MODEL")
                .map(|value| value.trim().to_string())
                .unwrap_or_else(|| DEFAULT_ARK_MODEL.to_string()),
            size: var("ARK_SIZE")
                .map(|value| value.trim().to_string())
                .unwrap_or_else(|| DEFAULT_ARK_SIZE.to_string()),
            timeout: Duration::from_secs(parse_or(var("GENERATION_TIMEOUT_SECONDS"), 90)),
        };

        let defaults = DownscaleConfig::default();
        let downscale = DownscaleConfig {
            max_edge: parse_or(var("DOWNSCALE_MAX_EDGE"), defaults.max_edge),
            quality_high: parse_or(var("DOWNSCALE_QUALITY_HIGH"), defaults.quality_high)
                .clamp(1, 100),
            quality_low: parse_or(var("DOWNSCALE_QUALITY_LOW"), defaults.quality_low)
                .clamp(1, 100),
            max_bytes: parse_or(var("DOWNSCALE_MAX_BYTES"), defaults.max_bytes),
        };

        Ok(Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(var("PORT"), 3000u16),
            db_path,
            storage_dir,
            admin_api_key: var("ADMIN_API_KEY").map(|value| value.trim().to_string()),
            allow_origins: parse_list(var("ALLOW_ORIGINS")),
            ark,
            store_timeout: Duration::from_secs(parse_or(var("STORE_TIMEOUT_SECONDS"), 5u64).max(1)),
            grant_ttl_seconds: seconds("GRANT_TTL_SECONDS", 600),
            grant_max_downloads: i64::from(parse_or(var("GRANT_MAX_DOWNLOADS"), 3u32).max(1)),
            input_ttl_seconds: seconds("INPUT_TTL_SECONDS", 600),
            downscale,
            max_body_bytes: parse_or(var("MAX_BODY_BYTES"), 20 * 1024 * 1024usize),
            cookie_secure: var("COOKIE_SECURE")
                .map(|value| !matches!(value.trim(), "0" | "false" | "no"))
                .unwrap_or(true),
            redeem_code_prefix: var("REDEEM_CODE_PREFIX")
                .map(|value| value.trim().to_uppercase())
                .unwrap_or_else(|| "IDPHOTO".to_string()),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Values that do not parse into the target type (including out-of-range
/// numbers) fall back to the default.
fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn resolve_data_dir(explicit: Option<String>) -> PathBuf {
    if let Some(dir) = explicit {
        return PathBuf::from(dir);
    }
    let mut base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push("idphoto-gate");
    base
}

fn parse_list(raw: Option<String>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
    .unwrap_or_default()
}
