use async_trait::async_trait;
use futures::stream::BoxStream;
use gemchat_common::{Error, Message, Result};

pub mod gemini;
pub mod sse;

pub use gemini::GeminiProvider;

/// Lazy, finite sequence of text fragments from one model response.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// A model backend able to stream a chat reply.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Provider identifier (e.g. "gemini").
    fn provider_id(&self) -> &str;

    /// Start a fresh streaming request. Each call is a new upstream request;
    /// the returned stream cannot be restarted.
    ///
    /// Fails with [`Error::Auth`] when the credential is missing or rejected
    /// and [`Error::Stream`] for anything else. Errors may also arrive as
    /// items of the stream once it has started.
    async fn open_stream(
        &self,
        message: &str,
        system_instruction: &str,
        history: &[Message],
    ) -> Result<FragmentStream>;
}

/// Provider error texts that mean the credential is missing or invalid.
const AUTH_SIGNATURES: &[&str] = &[
    "requested entity was not found",
    "entity not found",
    "api key",
    "api_key",
];

/// Map a provider failure to `Auth` or `Stream`.
pub fn classify_failure(status: Option<u16>, message: &str) -> Error {
    let lower = message.to_ascii_lowercase();
    let auth_status = matches!(status, Some(401 | 403));
    if auth_status || AUTH_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
        Error::Auth(message.to_string())
    } else {
        Error::Stream(message.to_string())
    }
}

/// History that may be replayed upstream: anything still streaming is
/// dropped, as are messages with no content.
pub fn replayable_history(history: &[Message]) -> impl Iterator<Item = &Message> {
    history
        .iter()
        .filter(|m| !m.is_streaming() && !m.content.is_empty())
}
