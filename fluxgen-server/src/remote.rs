use anyhow::{Context, Result};
use fluxgen_core::GenerationRequest;
use reqwest::header::CONTENT_TYPE;

use crate::api::{ErrorResponse, ModelResponse, SEED_HEADER};

/// Seed shown when the endpoint did not report one.
pub const UNKNOWN_SEED: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    Image { bytes: Vec<u8>, seed: String },
    Rejected { message: String, seed: String },
}

/// Client for a model server's REST endpoint.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn model(&self) -> Result<String> {
        let url = format!("{}/model", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?
            .error_for_status()?;
        Ok(response.json::<ModelResponse>().await?.model)
    }

    /// Posts `request` to `/generate`. Any non-success status is an error.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<RemoteOutcome> {
        let url = format!("{}/generate", self.base_url);
        tracing::debug!("POST {url}");
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?
            .error_for_status()?;

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        if is_json {
            let body: ErrorResponse = response
                .json()
                .await
                .context("unexpected JSON body from /generate")?;
            return Ok(RemoteOutcome::Rejected {
                message: body.error.message,
                seed: body
                    .error
                    .seed
                    .map_or_else(|| UNKNOWN_SEED.to_string(), |s| s.to_string()),
            });
        }

        let seed = response
            .headers()
            .get(SEED_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(UNKNOWN_SEED)
            .to_string();
        let bytes = response.bytes().await?.to_vec();
        Ok(RemoteOutcome::Image { bytes, seed })
    }
}
