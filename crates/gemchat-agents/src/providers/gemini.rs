use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use gemchat_common::{Error, Message, Result, Role};
use gemchat_config::ProviderConfig;
use gemchat_security::CredentialLookup;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::sse;
use super::{FragmentStream, StreamClient, classify_failure, replayable_history};

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const MAX_ERROR_BODY: usize = 800;

/// Streaming client for the Gemini `streamGenerateContent` endpoint.
///
/// Holds no HTTP client and no key: both are created for every request so a
/// credential swapped between two messages is picked up by the second.
pub struct GeminiProvider {
    model: String,
    base_url: String,
    connect_timeout: Duration,
    credentials: Arc<dyn CredentialLookup>,
}

impl GeminiProvider {
    pub fn new(model: impl Into<String>, credentials: Arc<dyn CredentialLookup>) -> Self {
        Self {
            model: model.into(),
            base_url: GEMINI_API_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            credentials,
        }
    }

    pub fn from_config(config: &ProviderConfig, credentials: Arc<dyn CredentialLookup>) -> Self {
        Self {
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            connect_timeout: config.connect_timeout(),
            credentials,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }

    fn http_client(&self) -> Result<Client> {
        Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| Error::Stream(format!("failed to build HTTP client: {e}")))
    }

    /// Request body: replayable history, then the new user turn.
    pub fn build_request_body(
        &self,
        message: &str,
        system_instruction: &str,
        history: &[Message],
    ) -> GeminiRequest {
        let mut contents: Vec<GeminiContent> = replayable_history(history)
            .map(|m| GeminiContent::text(role_name(m.role), &m.content))
            .collect();
        contents.push(GeminiContent::text("user", message));

        let system_instruction = (!system_instruction.trim().is_empty()).then(|| GeminiSystem {
            parts: vec![GeminiPart {
                text: system_instruction.to_string(),
            }],
        });

        GeminiRequest {
            contents,
            system_instruction,
        }
    }
}

#[async_trait]
impl StreamClient for GeminiProvider {
    fn provider_id(&self) -> &str {
        "gemini"
    }

    async fn open_stream(
        &self,
        message: &str,
        system_instruction: &str,
        history: &[Message],
    ) -> Result<FragmentStream> {
        // Vault lookups derive a key with PBKDF2; keep that off the runtime.
        let credentials = Arc::clone(&self.credentials);
        let api_key = tokio::task::spawn_blocking(move || credentials.lookup())
            .await
            .map_err(|e| Error::Stream(format!("credential lookup failed: {e}")))?
            .ok_or_else(|| Error::Auth("no API key configured".to_string()))?;

        let body = self.build_request_body(message, system_instruction, history);
        debug!(
            "opening gemini stream: model={}, turns={}",
            self.model,
            body.contents.len()
        );

        let response = self
            .http_client()?
            .post(self.endpoint())
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_failure(None, &format!("Gemini request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let detail = error_message(&error_text).unwrap_or_else(|| truncate(&error_text));
            warn!("gemini returned {status}: {detail}");
            return Err(classify_failure(
                Some(status.as_u16()),
                &format!("Gemini API error ({status}): {detail}"),
            ));
        }

        let fragments = sse::data_lines(response.bytes_stream())
            .try_filter_map(|data| async move { parse_chunk(&data) })
            .boxed();
        Ok(fragments)
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "model",
    }
}

/// Text carried by one streamed chunk, or the error it reports.
fn parse_chunk(data: &str) -> Result<Option<String>> {
    let chunk: GeminiChunk = serde_json::from_str(data)
        .map_err(|e| Error::Stream(format!("malformed Gemini chunk: {e}")))?;

    if let Some(error) = chunk.error {
        return Err(classify_failure(
            error.code,
            &format!("Gemini stream error: {}", error.message),
        ));
    }

    let text: String = chunk
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|c| c.parts.iter().filter_map(|p| p.text.as_deref()).collect())
        .unwrap_or_default();

    Ok((!text.is_empty()).then_some(text))
}

/// The `error.message` field of a Gemini error body, if present.
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let value = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };
    value["error"]["message"].as_str().map(str::to_string)
}

fn truncate(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() > MAX_ERROR_BODY {
        let cut: String = body.chars().take(MAX_ERROR_BODY).collect();
        format!("{cut}...")
    } else {
        body.to_string()
    }
}

// Request types
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiSystem>,
}

#[derive(Debug, Serialize)]
pub struct GeminiContent {
    pub role: String,
    pub parts: Vec<GeminiPart>,
}

impl GeminiContent {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: role.to_string(),
            parts: vec![GeminiPart {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GeminiSystem {
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
pub struct GeminiPart {
    pub text: String,
}

// Response types
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GeminiChunk {
    candidates: Vec<GeminiCandidate>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GeminiCandidateContent {
    parts: Vec<GeminiCandidatePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    code: Option<u16>,
    #[serde(default)]
    message: String,
}
