use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::config::ArkConfig;

const MAX_DIAGNOSTIC_CHARS: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("provider request timed out")]
    Timeout,
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider rejected request ({status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("provider returned no usable result: {detail}")]
    MalformedResponse { detail: String },
    #[error("FETCH_IMG_{status}")]
    Fetch { status: u16 },
}

impl GenerationError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GenerationError::Timeout
        } else {
            GenerationError::Transport(truncate_diagnostic(&err.to_string()))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMeta {
    pub model: String,
    pub size: String,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub result_url: String,
    pub meta: ProviderMeta,
}

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Image-to-image provider used by the asset pipeline.
///
/// Implementations never retry; a failed call surfaces to the caller as-is.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// `image` is a self-contained data URL so the provider never needs to
    /// reach back into this service.
    async fn generate(&self, prompt: &str, image: &str) -> Result<GeneratedImage, GenerationError>;

    async fn fetch_result(&self, result_url: &str) -> Result<FetchedImage, GenerationError>;
}

#[derive(Debug, Deserialize)]
struct ImageGenerationResponse {
    data: Option<Vec<ImageGenerationItem>>,
}

#[derive(Debug, Deserialize)]
struct ImageGenerationItem {
    url: Option<String>,
    size: Option<String>,
}

#[derive(Clone)]
pub struct ArkClient {
    client: Client,
    config: ArkConfig,
}

impl ArkClient {
    pub fn new(config: ArkConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ImageGenerator for ArkClient {
    async fn generate(&self, prompt: &str, image: &str) -> Result<GeneratedImage, GenerationError> {
        let body = json!({
            "model": self.config.model,
            "prompt": prompt,
            "image": image,
            "size": self.config.size,
            "watermark": false,
        });

        debug!(
            model = %self.config.model,
            size = %self.config.size,
            image_chars = image.len(),
            "ark generation request"
        );

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(GenerationError::from_reqwest)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(GenerationError::from_reqwest)?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "ark generation rejected");
            return Err(GenerationError::Rejected {
                status: status.as_u16(),
                detail: truncate_diagnostic(&text),
            });
        }

        let item = serde_json::from_str::<ImageGenerationResponse>(&text)
            .ok()
            .and_then(|payload| payload.data)
            .and_then(|items| items.into_iter().next());
        let (result_url, size) = match item {
            Some(ImageGenerationItem {
                url: Some(url),
                size,
            }) if !url.trim().is_empty() => (url, size.unwrap_or_default()),
            _ => {
                return Err(GenerationError::MalformedResponse {
                    detail: truncate_diagnostic(&text),
                });
            }
        };
        let result_url = validate_result_url(&result_url)?;

        Ok(GeneratedImage {
            result_url,
            meta: ProviderMeta {
                model: self.config.model.clone(),
                size,
            },
        })
    }

    async fn fetch_result(&self, result_url: &str) -> Result<FetchedImage, GenerationError> {
        let response = self
            .client
            .get(result_url)
            .send()
            .await
            .map_err(GenerationError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Fetch {
                status: status.as_u16(),
            });
        }
        let mime_from_header = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(GenerationError::from_reqwest)?;
        let mime_type = crate::image_processing::detect_mime_type(&bytes)
            .map(str::to_string)
            .or(mime_from_header)
            .unwrap_or_else(|| "image/png".to_string());
        Ok(FetchedImage {
            bytes: bytes.to_vec(),
            mime_type,
        })
    }
}

fn validate_result_url(raw: &str) -> Result<String, GenerationError> {
    let parsed = Url::parse(raw.trim()).map_err(|err| GenerationError::MalformedResponse {
        detail: truncate_diagnostic(&format!("invalid result url: {err}")),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.to_string()),
        scheme => Err(GenerationError::MalformedResponse {
            detail: format!("unsupported result url scheme: {scheme}"),
        }),
    }
}

/// Caps provider text so it never bloats logs or responses.
pub fn truncate_diagnostic(text: &str) -> String {
    text.chars().take(MAX_DIAGNOSTIC_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_are_capped() {
        let long = "x".repeat(5000);
        assert_eq!(truncate_diagnostic(&long).chars().count(), MAX_DIAGNOSTIC_CHARS);
        assert_eq!(truncate_diagnostic("short"), "short");
    }

    #[test]
    fn result_url_must_be_http() {
        assert!(validate_result_url("https://cdn.example.com/out.png").is_ok());
        assert!(matches!(
            validate_result_url("file:///etc/passwd"),
            Err(GenerationError::MalformedResponse { .. })
        ));
        assert!(matches!(
            validate_result_url("not a url"),
            Err(GenerationError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn fetch_error_names_status() {
        assert_eq!(GenerationError::Fetch { status: 403 }.to_string(), "FETCH_IMG_403");
    }
}
