use super::{FrameDelta, FrameError, ProviderAdapter, expand_model};
use crate::config::GenerationParams;
use crate::format::ChatMessage;
use crate::format::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ModelsResponse,
};
use crate::registry::ProviderConfig;

/// `/chat/completions` dialect shared by most hosted providers.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiCompatible;

impl ProviderAdapter for OpenAiCompatible {
    fn streams(&self) -> bool {
        true
    }

    fn endpoint(&self, provider: &ProviderConfig, model: &str, _token: &str) -> String {
        expand_model(&provider.chat_completions_url, model)
    }

    fn model_list_endpoint(&self, provider: &ProviderConfig, _token: &str) -> Option<String> {
        provider
            .has_model_list()
            .then(|| provider.model_list_url.trim().to_string())
    }

    fn auth_header(&self, token: &str) -> Option<String> {
        Some(format!("Bearer {}", token))
    }

    fn build_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(ChatCompletionRequest {
            model,
            messages,
            stream: true,
            max_tokens: params.max_tokens,
            stop: None,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            frequency_penalty: params.frequency_penalty,
            n: params.n,
        })
    }

    fn parse_stream_frame(&self, raw: &str) -> Result<FrameDelta, FrameError> {
        let chunk: ChatCompletionChunk = serde_json::from_str(raw)?;

        if let Some(error) = chunk.error {
            return Err(FrameError::Api(error.message));
        }

        let delta = chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .unwrap_or_default();

        Ok(FrameDelta {
            reasoning: delta.reasoning_content.or(delta.reasoning),
            content: delta.content,
        })
    }

    fn parse_response(&self, body: &[u8]) -> Result<FrameDelta, FrameError> {
        let response: ChatCompletionResponse = serde_json::from_slice(body)?;

        if let Some(error) = response.error {
            return Err(FrameError::Api(error.message));
        }

        let message = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .unwrap_or_default();

        Ok(FrameDelta {
            reasoning: message.reasoning_content,
            content: message.content,
        })
    }

    fn parse_model_list(&self, body: &[u8]) -> Result<Vec<String>, FrameError> {
        let response: ModelsResponse = serde_json::from_slice(body)?;
        Ok(response.data.into_iter().map(|m| m.id).collect())
    }
}
