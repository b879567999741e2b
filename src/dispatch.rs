//! Executes admitted envelopes against the provider's HTTP API.

use std::time::Instant;

use http_body_util::BodyExt;
use hyper::body::Bytes;
use tracing::{debug, warn};

use crate::adapter::{FrameError, ProviderAdapter};
use crate::config::{Config, GenerationParams, StreamConfig};
use crate::decoder::StreamDecoder;
use crate::delta::{DeltaKind, DeltaSink, StreamEvent};
use crate::error::{Error, Result};
use crate::format::ChatMessage;
use crate::http::{self, HttpClient, Response};
use crate::queue::{Envelope, Handler, Route};

pub struct ChatDispatcher {
    http: HttpClient,
    params: GenerationParams,
    stream: StreamConfig,
    log_requests: bool,
}

impl ChatDispatcher {
    pub fn new(config: &Config) -> Self {
        Self::with_http(HttpClient::new(), config)
    }

    pub fn with_http(http: HttpClient, config: &Config) -> Self {
        Self {
            http,
            params: config.generation,
            stream: config.stream,
            log_requests: config.logging.log_requests,
        }
    }

    async fn send(
        &self,
        route: &Route,
        messages: &[ChatMessage],
        adapter: &dyn ProviderAdapter,
    ) -> Result<Response> {
        let body = adapter.build_request(&route.model, messages, &self.params)?;
        let body = serde_json::to_vec(&body)?;

        if self.log_requests {
            debug!(body = %String::from_utf8_lossy(&body), "Request body");
        }

        let url = adapter.endpoint(&route.provider, &route.model, &route.token);
        let auth = adapter.auth_header(&route.token);

        let mut headers = vec![("Content-Type", "application/json")];
        if adapter.streams() {
            headers.push(("Accept", "text/event-stream"));
        }
        if let Some(auth) = auth.as_deref() {
            headers.push(("Authorization", auth));
        }

        let response = self.http.post_raw(&url, &headers, Bytes::from(body)).await?;
        if !response.status().is_success() {
            return Err(http::api_error(response).await);
        }
        Ok(response)
    }

    /// Feed body frames through the decoder until it completes or the body ends.
    async fn pump(
        &self,
        response: Response,
        adapter: &'static dyn ProviderAdapter,
        sink: &mut DeltaSink,
    ) -> Result<()> {
        let mut decoder = StreamDecoder::new(adapter, &self.stream);
        let mut body = response.into_body();

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| Error::Http(e.to_string()))?;
            let Ok(data) = frame.into_data() else {
                continue;
            };

            for event in decoder.feed(&data) {
                sink.emit(event);
            }
            if decoder.is_done() {
                return Ok(());
            }
        }

        for event in decoder.finish() {
            sink.emit(event);
        }
        Ok(())
    }

    /// Read a whole single-shot response and deliver it as one delta per channel.
    async fn single_shot(
        &self,
        response: Response,
        adapter: &dyn ProviderAdapter,
        sink: &mut DeltaSink,
    ) -> Result<()> {
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .to_bytes();

        let delta = match adapter.parse_response(&body) {
            Ok(delta) => delta,
            Err(FrameError::Malformed(e)) => {
                warn!(error = %e, "Failed to parse response body");
                sink.emit(StreamEvent::NullContent);
                return Ok(());
            }
            Err(FrameError::Api(message)) => {
                warn!(message = %message, "Provider returned an error");
                sink.emit(StreamEvent::NullContent);
                return Ok(());
            }
        };

        let trim = self.stream.trim_deltas;
        let mut delivered = false;
        for (kind, text) in [
            (DeltaKind::Reasoning, delta.reasoning),
            (DeltaKind::Content, delta.content),
        ] {
            let Some(text) = text else { continue };
            let text = if trim { text.trim().to_string() } else { text };
            if text.trim().is_empty() {
                continue;
            }
            sink.emit(StreamEvent::Delta { kind, text });
            delivered = true;
        }

        if !delivered {
            sink.emit(StreamEvent::NullContent);
        }
        Ok(())
    }
}

impl Handler for ChatDispatcher {
    async fn handle(&self, envelope: Envelope) {
        let Envelope {
            id,
            route,
            messages,
            mut sink,
        } = envelope;
        let adapter = route.provider.family.adapter();
        let started = Instant::now();

        debug!(
            id = %id,
            provider = %route.provider.display_name,
            model = %route.model,
            messages = messages.len(),
            "Sending chat request"
        );

        let response = match self.send(&route, &messages, adapter).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    id = %id,
                    provider = %route.provider.display_name,
                    model = %route.model,
                    error = %e,
                    suggestion = e.suggestion(),
                    "Chat request failed"
                );
                sink.fail();
                return;
            }
        };

        let result = if adapter.streams() {
            self.pump(response, adapter, &mut sink).await
        } else {
            self.single_shot(response, adapter, &mut sink).await
        };

        match result {
            Ok(()) => debug!(
                id = %id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Chat request completed"
            ),
            Err(e) => {
                warn!(id = %id, error = %e, "Response body failed mid-read");
                sink.emit(StreamEvent::NullContent);
            }
        }
        sink.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::StreamSummary;
    use crate::http::testing::{Canned, serve};
    use crate::registry::{ProviderConfig, ProviderFamily};

    fn route(base: &str, family: ProviderFamily) -> Route {
        let chat_completions_url = match family {
            ProviderFamily::OpenAiCompatible => format!("{base}/v1/chat/completions"),
            ProviderFamily::Gemini => format!("{base}/v1beta/models/{{model}}:generateContent"),
        };
        Route {
            provider: ProviderConfig {
                display_name: "Local".to_string(),
                chat_completions_url,
                model_list_url: String::new(),
                default_model: "local-model".to_string(),
                family,
                fallback_models: vec![],
            },
            model: "local-model".to_string(),
            token: "sk-local".to_string(),
        }
    }

    async fn run(route: Route, messages: Vec<ChatMessage>) -> (Vec<StreamEvent>, StreamSummary) {
        let (sink, mut stream) = DeltaSink::channel();
        let dispatcher = ChatDispatcher::new(&Config::default());
        dispatcher.handle(Envelope::new(route, messages, sink)).await;

        let mut events = Vec::new();
        let mut summary = StreamSummary::default();
        while let Some(event) = stream.next().await {
            match &event {
                StreamEvent::Delta {
                    kind: DeltaKind::Content,
                    text,
                } => summary.content = text.clone(),
                StreamEvent::Delta {
                    kind: DeltaKind::Reasoning,
                    text,
                } => summary.reasoning = text.clone(),
                StreamEvent::NullContent => summary.null_events += 1,
                StreamEvent::Done => {}
            }
            events.push(event);
        }
        (events, summary)
    }

    #[tokio::test]
    async fn test_streaming_request_and_deltas() {
        let (base, recorded) = serve(vec![Canned::event_stream(&[
            b"data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"thinking\"}}]}\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\ndata: {\"choi",
            b"ces\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
            b"data: [DONE]\n",
        ])])
        .await;

        let (events, summary) = run(
            route(&base, ProviderFamily::OpenAiCompatible),
            vec![ChatMessage::user("hi")],
        )
        .await;

        assert_eq!(summary.reasoning, "thinking");
        assert_eq!(summary.content, "Hello");
        assert_eq!(summary.null_events, 0);
        assert_eq!(events.iter().filter(|e| **e == StreamEvent::Done).count(), 1);

        let requests = recorded.lock();
        let request = &requests[0];
        assert_eq!(request.request_line(), "POST /v1/chat/completions HTTP/1.1");
        assert_eq!(request.header("authorization").as_deref(), Some("Bearer sk-local"));
        assert_eq!(request.header("accept").as_deref(), Some("text/event-stream"));
        let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(body["model"], "local-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[tokio::test]
    async fn test_error_status_fails_envelope() {
        let (base, _) = serve(vec![Canned::json(429, r#"{"error":{"message":"slow"}}"#)]).await;
        let (events, summary) = run(
            route(&base, ProviderFamily::OpenAiCompatible),
            vec![ChatMessage::user("hi")],
        )
        .await;
        assert_eq!(events, vec![StreamEvent::NullContent, StreamEvent::Done]);
        assert_eq!(summary.content, "");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_envelope() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let (events, _) = run(
            route(&base, ProviderFamily::OpenAiCompatible),
            vec![ChatMessage::user("hi")],
        )
        .await;
        assert_eq!(events, vec![StreamEvent::NullContent, StreamEvent::Done]);
    }

    #[tokio::test]
    async fn test_empty_endpoint_fails_envelope() {
        let mut route = route("", ProviderFamily::OpenAiCompatible);
        route.provider.chat_completions_url = String::new();
        let (events, _) = run(route, vec![ChatMessage::user("hi")]).await;
        assert_eq!(events, vec![StreamEvent::NullContent, StreamEvent::Done]);
    }

    #[tokio::test]
    async fn test_stream_without_done_completes_at_body_end() {
        let (base, _) = serve(vec![Canned::event_stream(&[
            b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n",
        ])])
        .await;
        let (events, summary) = run(
            route(&base, ProviderFamily::OpenAiCompatible),
            vec![ChatMessage::user("hi")],
        )
        .await;
        assert_eq!(summary.content, "partial");
        assert_eq!(events.last(), Some(&StreamEvent::Done));
    }

    #[tokio::test]
    async fn test_malformed_and_embedded_error_frames() {
        let (base, _) = serve(vec![Canned::event_stream(&[
            b"data: {broken\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
            b"data: {\"error\":{\"message\":\"upstream overloaded\"}}\n",
        ])])
        .await;
        let (events, summary) = run(
            route(&base, ProviderFamily::OpenAiCompatible),
            vec![ChatMessage::user("hi")],
        )
        .await;
        assert_eq!(summary.content, "ok");
        assert_eq!(summary.null_events, 2);
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        assert_eq!(events.iter().filter(|e| **e == StreamEvent::Done).count(), 1);
    }

    #[tokio::test]
    async fn test_gemini_single_shot() {
        let (base, recorded) = serve(vec![Canned::json(
            200,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":" Bonjour "}]}}]}"#,
        )])
        .await;

        let (events, summary) = run(
            route(&base, ProviderFamily::Gemini),
            vec![ChatMessage::system("french"), ChatMessage::user("hello")],
        )
        .await;
        assert_eq!(summary.content, "Bonjour");
        assert_eq!(events.len(), 2);

        let requests = recorded.lock();
        let request = &requests[0];
        assert_eq!(
            request.request_line(),
            "POST /v1beta/models/local-model:generateContent?key=sk-local HTTP/1.1"
        );
        assert_eq!(request.header("authorization"), None);
        let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "french");
        assert_eq!(body["contents"][0]["role"], "user");
    }

    #[tokio::test]
    async fn test_gemini_error_body() {
        let (base, _) = serve(vec![Canned::json(
            200,
            r#"{"error":{"code":400,"message":"bad","status":"INVALID_ARGUMENT"}}"#,
        )])
        .await;
        let (events, _) = run(
            route(&base, ProviderFamily::Gemini),
            vec![ChatMessage::user("hello")],
        )
        .await;
        assert_eq!(events, vec![StreamEvent::NullContent, StreamEvent::Done]);
    }
}
