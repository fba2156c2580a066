use crate::config::AppConfig;
use crate::types::WordsResult;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use std::cell::Cell;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum OcrError {
    #[error("could not build HTTP client: {0}")]
    Client(String),
    #[error("{0}")]
    Network(String),
    #[error("OCR request failed ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("invalid JSON from OCR service: {0}")]
    InvalidJson(String),
    #[error("OCR service error {code}: {message}")]
    Service { code: i64, message: String },
    #[error("response has no words_result")]
    MissingWordsResult,
    #[error("token endpoint returned no access_token ({error}: {description})")]
    TokenMissing { error: String, description: String },
}

/// Short-lived bearer token from the OAuth endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something that can hand out a bearer token for the recognition endpoint.
pub trait TokenSource {
    fn access_token(&self) -> Result<AccessToken, OcrError>;
}

/// Abstraction over the VAT invoice recognizer.
/// Implementations accept raw image bytes and return the `words_result` map.
pub trait InvoiceRecognizer {
    fn recognize(&self, image: &[u8], token: &AccessToken) -> Result<WordsResult, OcrError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VatInvoiceResponse {
    #[serde(default)]
    words_result: Option<WordsResult>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error_msg: Option<String>,
}

/// Standard base64 of the image bytes, as the `image` form field expects.
pub fn encode_image(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Parse the OAuth token endpoint body.
pub fn parse_token_response(body: &str) -> Result<AccessToken, OcrError> {
    let parsed: TokenResponse =
        serde_json::from_str(body).map_err(|e| OcrError::InvalidJson(e.to_string()))?;
    match parsed.access_token.filter(|t| !t.is_empty()) {
        Some(token) => {
            tracing::debug!(expires_in = ?parsed.expires_in, "access token acquired");
            Ok(AccessToken(token))
        }
        None => Err(OcrError::TokenMissing {
            error: parsed.error.unwrap_or_else(|| "unknown".to_string()),
            description: parsed.error_description.unwrap_or_default(),
        }),
    }
}

/// Parse the `vat_invoice` endpoint body into its `words_result` map.
pub fn parse_vat_response(body: &str) -> Result<WordsResult, OcrError> {
    let parsed: VatInvoiceResponse =
        serde_json::from_str(body).map_err(|e| OcrError::InvalidJson(e.to_string()))?;
    if let Some(code) = parsed.error_code {
        return Err(OcrError::Service {
            code,
            message: parsed.error_msg.unwrap_or_default(),
        });
    }
    parsed.words_result.ok_or(OcrError::MissingWordsResult)
}

fn map_send_error(e: reqwest::Error) -> OcrError {
    let hint = if e.is_connect() || e.is_timeout() {
        "Check your internet connection and try again."
    } else {
        "Network error."
    };
    OcrError::Network(format!("{hint} ({e})"))
}

fn read_success_body(response: Response) -> Result<String, OcrError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(OcrError::Status {
            status: status.as_u16(),
            body: if body.is_empty() {
                "Invalid key or endpoint?".to_string()
            } else {
                body
            },
        });
    }
    response.text().map_err(map_send_error)
}

/// Blocking client for Baidu's OAuth and `vat_invoice` endpoints.
pub struct BaiduClient {
    client: Client,
    config: AppConfig,
}

impl BaiduClient {
    pub fn new(config: AppConfig) -> Result<Self, OcrError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OcrError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

impl TokenSource for BaiduClient {
    fn access_token(&self) -> Result<AccessToken, OcrError> {
        tracing::debug!(url = %self.config.token_url, "requesting access token");
        let response = self
            .client
            .post(&self.config.token_url)
            .query(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.api_key.as_str()),
                ("client_secret", self.config.secret_key.as_str()),
            ])
            .send()
            .map_err(map_send_error)?;
        let body = read_success_body(response)?;
        parse_token_response(&body)
    }
}

impl InvoiceRecognizer for BaiduClient {
    fn recognize(&self, image: &[u8], token: &AccessToken) -> Result<WordsResult, OcrError> {
        let encoded = encode_image(image);
        tracing::debug!(image_bytes = image.len(), "calling vat_invoice");
        let response = self
            .client
            .post(&self.config.vat_url)
            .query(&[("access_token", token.as_str())])
            .form(&[("image", encoded.as_str())])
            .send()
            .map_err(map_send_error)?;
        let body = read_success_body(response)?;
        parse_vat_response(&body)
    }
}

// ── Mock backend (always available, used for tests) ──────────────────────────

/// Answers from a table keyed by image bytes; unknown images fail with
/// [`OcrError::MissingWordsResult`]. Counts calls so callers can assert
/// whether the service would have been hit.
#[derive(Debug, Default)]
pub struct MockRecognizer {
    responses: HashMap<Vec<u8>, Result<WordsResult, OcrError>>,
    token_calls: Cell<usize>,
    recognize_calls: Cell<usize>,
}

impl MockRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, image: impl Into<Vec<u8>>, words: WordsResult) -> Self {
        self.responses.insert(image.into(), Ok(words));
        self
    }

    pub fn with_error(mut self, image: impl Into<Vec<u8>>, error: OcrError) -> Self {
        self.responses.insert(image.into(), Err(error));
        self
    }

    pub fn token_calls(&self) -> usize {
        self.token_calls.get()
    }

    pub fn recognize_calls(&self) -> usize {
        self.recognize_calls.get()
    }
}

impl TokenSource for MockRecognizer {
    fn access_token(&self) -> Result<AccessToken, OcrError> {
        self.token_calls.set(self.token_calls.get() + 1);
        Ok(AccessToken::new("mock-token"))
    }
}

impl InvoiceRecognizer for MockRecognizer {
    fn recognize(&self, image: &[u8], _token: &AccessToken) -> Result<WordsResult, OcrError> {
        self.recognize_calls.set(self.recognize_calls.get() + 1);
        self.responses
            .get(image)
            .cloned()
            .unwrap_or(Err(OcrError::MissingWordsResult))
    }
}
