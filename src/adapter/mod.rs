//! Translation between the provider-neutral request shape and each wire format.

pub mod gemini;
pub mod openai;

pub use gemini::Gemini;
pub use openai::OpenAiCompatible;

use thiserror::Error;

use crate::config::GenerationParams;
use crate::format::ChatMessage;
use crate::registry::{MODEL_PLACEHOLDER, ProviderConfig, ProviderFamily};

/// Text carried by one response frame, before trimming.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameDelta {
    pub reasoning: Option<String>,
    pub content: Option<String>,
}

impl FrameDelta {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            reasoning: None,
            content: Some(text.into()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("provider returned an error: {0}")]
    Api(String),
}

impl From<serde_json::Error> for FrameError {
    fn from(e: serde_json::Error) -> Self {
        FrameError::Malformed(e.to_string())
    }
}

/// Capabilities of one provider family.
pub trait ProviderAdapter: Send + Sync {
    /// Whether responses arrive as incremental `data:` frames.
    fn streams(&self) -> bool;

    fn endpoint(&self, provider: &ProviderConfig, model: &str, token: &str) -> String;

    /// `None` when the provider has no model list endpoint.
    fn model_list_endpoint(&self, provider: &ProviderConfig, token: &str) -> Option<String>;

    /// Value for the `Authorization` header, if the token travels in a header.
    fn auth_header(&self, token: &str) -> Option<String>;

    fn build_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<serde_json::Value, serde_json::Error>;

    fn parse_stream_frame(&self, raw: &str) -> Result<FrameDelta, FrameError>;

    /// Parse a complete, non-incremental response body.
    fn parse_response(&self, body: &[u8]) -> Result<FrameDelta, FrameError>;

    fn parse_model_list(&self, body: &[u8]) -> Result<Vec<String>, FrameError>;
}

static OPENAI_COMPATIBLE: OpenAiCompatible = OpenAiCompatible;
static GEMINI: Gemini = Gemini;

impl ProviderFamily {
    pub fn adapter(self) -> &'static dyn ProviderAdapter {
        match self {
            ProviderFamily::OpenAiCompatible => &OPENAI_COMPATIBLE,
            ProviderFamily::Gemini => &GEMINI,
        }
    }
}

/// Substitute the model into a URL template.
pub(crate) fn expand_model(url: &str, model: &str) -> String {
    url.replace(MODEL_PLACEHOLDER, &encode_query_value(model))
}

/// Append `name=value` to a URL's query string.
pub(crate) fn with_query(url: &str, name: &str, value: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{name}={}", encode_query_value(value))
}

fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
