use super::{FrameDelta, FrameError, ProviderAdapter, expand_model, with_query};
use crate::config::GenerationParams;
use crate::format::google::{
    Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, ModelsResponse,
};
use crate::format::{ChatMessage, Role};
use crate::registry::ProviderConfig;

/// Google `generateContent`: one request, one JSON document back.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gemini;

impl ProviderAdapter for Gemini {
    fn streams(&self) -> bool {
        false
    }

    fn endpoint(&self, provider: &ProviderConfig, model: &str, token: &str) -> String {
        with_query(
            &expand_model(&provider.chat_completions_url, model),
            "key",
            token,
        )
    }

    fn model_list_endpoint(&self, provider: &ProviderConfig, token: &str) -> Option<String> {
        provider
            .has_model_list()
            .then(|| with_query(provider.model_list_url.trim(), "key", token))
    }

    fn auth_header(&self, _token: &str) -> Option<String> {
        None
    }

    fn build_request(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<serde_json::Value, serde_json::Error> {
        let mut contents = Vec::with_capacity(messages.len());
        let mut system_parts = Vec::new();

        for message in messages {
            match message.role() {
                Role::System => {
                    system_parts.extend(Content::text(None, message.content()).parts)
                }
                Role::User => contents.push(Content::text(Some("user"), message.content())),
                Role::Assistant => contents.push(Content::text(Some("model"), message.content())),
            }
        }

        let system_instruction = (!system_parts.is_empty()).then(|| Content {
            role: None,
            parts: system_parts,
        });

        serde_json::to_value(GenerateContentRequest {
            contents,
            system_instruction,
            generation_config: Some(GenerationConfig {
                max_output_tokens: Some(params.max_tokens),
                temperature: Some(params.temperature),
                top_p: Some(params.top_p),
                top_k: Some(params.top_k),
                frequency_penalty: Some(params.frequency_penalty),
                candidate_count: Some(params.n),
            }),
        })
    }

    fn parse_stream_frame(&self, raw: &str) -> Result<FrameDelta, FrameError> {
        // `streamGenerateContent?alt=sse` frames carry whole response objects
        self.parse_response(raw.as_bytes())
    }

    fn parse_response(&self, body: &[u8]) -> Result<FrameDelta, FrameError> {
        let response: GenerateContentResponse = serde_json::from_slice(body)?;

        if let Some(error) = response.error {
            return Err(FrameError::Api(format!(
                "Google API error ({}): {}",
                error.status, error.message
            )));
        }

        let parts = response
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| content.parts)
            .unwrap_or_default();

        let mut reasoning = String::new();
        let mut content = String::new();
        for part in parts {
            let Some(text) = part.text else {
                continue;
            };
            if part.thought == Some(true) {
                reasoning.push_str(&text);
            } else {
                content.push_str(&text);
            }
        }

        Ok(FrameDelta {
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            content: (!content.is_empty()).then_some(content),
        })
    }

    fn parse_model_list(&self, body: &[u8]) -> Result<Vec<String>, FrameError> {
        let response: ModelsResponse = serde_json::from_slice(body)?;
        Ok(response
            .models
            .into_iter()
            .map(|m| {
                m.name
                    .strip_prefix("models/")
                    .map(str::to_string)
                    .unwrap_or(m.name)
            })
            .collect())
    }
}
