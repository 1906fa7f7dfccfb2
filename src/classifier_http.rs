//! HTTP presence classifier.
//! Sends the prepared 512x512 grayscale frame as a base64 PNG to a model
//! server and reads back `{"detected": bool, "confidence": f32}`.
//! Latency: network dependent, typically 50-500ms.

use std::io::Cursor;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use image::{ImageFormat, RgbImage};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::classifier::{prepare_input, ClassifyFuture, Presence, PresenceClassifier};
use crate::error::VisionError;

const RETRY_DELAY_MS: u64 = 500;

// *************** Request/Response Types ***************

#[derive(Serialize)]
struct ClassifyRequest {
    image: String,
    width: u32,
    height: u32,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    detected: bool,
    confidence: f32,
}

// *************** Public API ***************

pub struct HttpPresenceClassifier {
    endpoint: String,
    client: Client,
    max_retries: u32,
}

impl HttpPresenceClassifier {
    pub fn new(endpoint: &str, timeout_secs: u64, max_retries: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self::with_client(endpoint, client, max_retries))
    }

    pub fn with_client(endpoint: &str, client: Client, max_retries: u32) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            client,
            max_retries,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Classifies one frame, retrying network and server errors.
    pub async fn detect(&self, image: &RgbImage) -> Result<Presence> {
        let request = build_request(image)?;
        call_api_with_retry(&self.client, &self.endpoint, &request, self.max_retries).await
    }
}

impl PresenceClassifier for HttpPresenceClassifier {
    fn name(&self) -> &str {
        &self.endpoint
    }

    fn classify<'a>(&'a self, image: &'a RgbImage) -> ClassifyFuture<'a> {
        Box::pin(async move {
            self.detect(image)
                .await
                .map_err(|e| VisionError::Classifier(format!("{e:#}")))
        })
    }
}

// *************** Internal Functions ***************

fn build_request(image: &RgbImage) -> Result<ClassifyRequest> {
    let input = prepare_input(image);
    let mut png = Cursor::new(Vec::new());
    input
        .write_to(&mut png, ImageFormat::Png)
        .context("Failed to encode classifier input")?;
    Ok(ClassifyRequest {
        image: general_purpose::STANDARD.encode(png.into_inner()),
        width: input.width(),
        height: input.height(),
    })
}

async fn call_api_with_retry(
    client: &Client,
    endpoint: &str,
    request: &ClassifyRequest,
    max_retries: u32,
) -> Result<Presence> {
    let mut last_error = None;

    for attempt in 1..=max_retries + 1 {
        match call_api(client, endpoint, request).await {
            Ok(presence) => return Ok(presence),
            Err(e) => {
                log::warn!("classifier attempt {}/{} failed: {e:#}", attempt, max_retries + 1);
                last_error = Some(e);
                if attempt <= max_retries {
                    tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("classifier was never called")))
}

async fn call_api(client: &Client, endpoint: &str, request: &ClassifyRequest) -> Result<Presence> {
    let response = client
        .post(endpoint)
        .json(request)
        .send()
        .await
        .with_context(|| format!("Failed to send request to {endpoint}"))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("classifier error {}: {}", status, body);
    }

    let parsed: ClassifyResponse = response
        .json()
        .await
        .context("Failed to parse classifier response")?;

    Ok(Presence {
        detected: parsed.detected,
        confidence: parsed.confidence.clamp(0.0, 1.0),
    })
}

// *************** Tests ***************
