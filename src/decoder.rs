//! Incremental decoding of `data:`-framed response bodies into cumulative deltas.

use tracing::{debug, warn};

use crate::adapter::{FrameDelta, FrameError, ProviderAdapter};
use crate::config::StreamConfig;
use crate::delta::{DeltaKind, StreamEvent};

/// Stateful UTF-8 decoder that carries incomplete sequences between chunks.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + chunk` as possible. Invalid sequences
    /// become U+FFFD; a truncated trailing sequence waits for the next chunk.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending.len());
        let mut input: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    input = &[];
                    break;
                }
                Err(e) => {
                    let valid_len = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&input[..valid_len]));
                    match e.error_len() {
                        Some(bad_len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &input[valid_len + bad_len..];
                        }
                        None => {
                            input = &input[valid_len..];
                            break;
                        }
                    }
                }
            }
        }

        let consumed = self.pending.len() - input.len();
        self.pending.drain(..consumed);
        out
    }

    /// Flush whatever is left, replacing a truncated sequence with U+FFFD.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Longest unterminated line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Per-request text buffers plus the consecutive stall counter.
#[derive(Debug, Default, Clone)]
pub struct StreamAccumulator {
    pub content: String,
    pub reasoning: String,
    pub stalls: u32,
}

pub struct StreamDecoder {
    adapter: &'static dyn ProviderAdapter,
    utf8: Utf8Decoder,
    line: String,
    acc: StreamAccumulator,
    stall_threshold: u32,
    trim_deltas: bool,
    frames: u64,
    /// Dropping the remainder of an oversized line.
    discarding: bool,
    done: bool,
}

impl StreamDecoder {
    pub fn new(adapter: &'static dyn ProviderAdapter, config: &StreamConfig) -> Self {
        Self {
            adapter,
            utf8: Utf8Decoder::new(),
            line: String::with_capacity(4096),
            acc: StreamAccumulator::default(),
            stall_threshold: config.stall_threshold.max(1),
            trim_deltas: config.trim_deltas,
            frames: 0,
            discarding: false,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn accumulator(&self) -> &StreamAccumulator {
        &self.acc
    }

    /// Feed one body chunk and return the events it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        let mut text = self.utf8.decode(bytes);
        if self.discarding {
            match text.find('\n') {
                Some(pos) => {
                    text.drain(..=pos);
                    self.discarding = false;
                }
                None => return events,
            }
        }
        self.line.push_str(&text);

        while let Some(pos) = self.line.find('\n') {
            let line: String = self.line.drain(..=pos).collect();
            self.process_line(&line, &mut events);
            if self.done {
                self.line.clear();
                return events;
            }
        }

        if self.line.len() > MAX_LINE_BYTES {
            warn!(bytes = self.line.len(), "Dropping oversized stream line");
            self.line.clear();
            self.discarding = true;
            events.push(StreamEvent::NullContent);
        }

        events
    }

    /// The body ended: process any unterminated last line and complete.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        let tail = self.utf8.finish();
        if !self.discarding {
            self.line.push_str(&tail);
        }
        let line = std::mem::take(&mut self.line);
        if !line.trim().is_empty() {
            self.process_line(&line, &mut events);
        }

        if !self.done {
            debug!(frames = self.frames, "Stream ended without [DONE]");
            self.complete(&mut events);
        }
        events
    }

    fn complete(&mut self, events: &mut Vec<StreamEvent>) {
        self.done = true;
        events.push(StreamEvent::Done);
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        let line = line.trim_end_matches(['\n', '\r']);
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();

        // keep-alive
        if data.is_empty() {
            return;
        }

        if data == "[DONE]" {
            debug!(frames = self.frames, "Received [DONE] marker");
            self.complete(events);
            return;
        }

        self.frames += 1;
        match self.adapter.parse_stream_frame(data) {
            Ok(delta) => self.apply(delta, events),
            Err(FrameError::Malformed(e)) => {
                debug!(
                    error = %e,
                    data = %data.chars().take(200).collect::<String>(),
                    "Failed to parse stream frame"
                );
                events.push(StreamEvent::NullContent);
            }
            Err(FrameError::Api(message)) => {
                warn!(message = %message, "Provider error in stream");
                events.push(StreamEvent::NullContent);
                self.complete(events);
            }
        }
    }

    fn apply(&mut self, delta: FrameDelta, events: &mut Vec<StreamEvent>) {
        let trim = self.trim_deltas;
        let normalize = |text: Option<String>| {
            text.map(|t| if trim { t.trim().to_string() } else { t })
                .filter(|t| !t.trim().is_empty())
        };
        let reasoning = normalize(delta.reasoning);
        let content = normalize(delta.content);

        if reasoning.is_none() && content.is_none() {
            self.acc.stalls += 1;
            if self.acc.stalls >= self.stall_threshold {
                debug!(
                    stalls = self.acc.stalls,
                    frames = self.frames,
                    "Stream stalled, completing"
                );
                self.complete(events);
            }
            return;
        }

        self.acc.stalls = 0;

        if let Some(text) = reasoning {
            self.acc.reasoning.push_str(&text);
            events.push(StreamEvent::Delta {
                kind: DeltaKind::Reasoning,
                text: self.acc.reasoning.clone(),
            });
        }

        if let Some(text) = content {
            self.acc.content.push_str(&text);
            events.push(StreamEvent::Delta {
                kind: DeltaKind::Content,
                text: self.acc.content.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProviderFamily;

    fn decoder() -> StreamDecoder {
        StreamDecoder::new(
            ProviderFamily::OpenAiCompatible.adapter(),
            &StreamConfig::default(),
        )
    }

    fn content(text: &str) -> StreamEvent {
        StreamEvent::Delta {
            kind: DeltaKind::Content,
            text: text.to_string(),
        }
    }

    fn content_frame(text: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}\n",
            serde_json::to_string(text).unwrap()
        )
    }

    const EMPTY_FRAME: &str = "data: {\"choices\":[{\"delta\":{}}]}\n";

    #[test]
    fn test_utf8_split_across_chunks() {
        let bytes = "héllo 世界".as_bytes();
        // split inside the 3-byte '世'
        let split = "héllo ".len() + 1;
        let mut utf8 = Utf8Decoder::new();
        let first = utf8.decode(&bytes[..split]);
        let second = utf8.decode(&bytes[split..]);
        assert_eq!(first, "héllo ");
        assert_eq!(format!("{first}{second}"), "héllo 世界");
        assert_eq!(utf8.finish(), "");
    }

    #[test]
    fn test_utf8_byte_at_a_time() {
        let text = "😀 ok";
        let mut utf8 = Utf8Decoder::new();
        let decoded: String = text.as_bytes().iter().map(|b| utf8.decode(&[*b])).collect();
        assert_eq!(decoded, text);
    }

    #[test]
    fn test_utf8_invalid_and_truncated() {
        let mut utf8 = Utf8Decoder::new();
        assert_eq!(utf8.decode(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
        assert_eq!(utf8.decode(&[0xE4, 0xB8]), "");
        assert_eq!(utf8.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_cumulative_content_then_done() {
        let mut decoder = decoder();
        let mut events = decoder.feed(content_frame("Hel").as_bytes());
        events.extend(decoder.feed(content_frame("lo").as_bytes()));
        events.extend(decoder.feed(b"data: [DONE]\n"));
        events.extend(decoder.finish());

        assert_eq!(events, vec![content("Hel"), content("Hello"), StreamEvent::Done]);
    }

    #[test]
    fn test_multibyte_character_split_inside_frame() {
        let frame = content_frame("日本");
        let bytes = frame.as_bytes();
        let split = bytes.iter().position(|&b| b == 0xE6).unwrap() + 1;

        let mut decoder = decoder();
        let mut events = decoder.feed(&bytes[..split]);
        assert!(events.is_empty());
        events.extend(decoder.feed(&bytes[split..]));
        assert_eq!(events, vec![content("日本")]);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let frame = content_frame("chunked");
        let (a, b) = frame.split_at(17);
        let mut decoder = decoder();
        assert!(decoder.feed(a.as_bytes()).is_empty());
        assert_eq!(decoder.feed(b.as_bytes()), vec![content("chunked")]);
    }

    #[test]
    fn test_malformed_frame_does_not_end_stream() {
        let mut decoder = decoder();
        let mut events = decoder.feed(b"data: {\"choices\":[{\"delta\"\n");
        assert_eq!(events, vec![StreamEvent::NullContent]);
        assert!(!decoder.is_done());

        events = decoder.feed(content_frame("still here").as_bytes());
        assert_eq!(events, vec![content("still here")]);
    }

    #[test]
    fn test_stall_threshold_forces_completion() {
        let mut decoder = decoder();
        let mut events = Vec::new();
        for _ in 0..4 {
            events.extend(decoder.feed(EMPTY_FRAME.as_bytes()));
        }
        assert!(events.is_empty());
        assert!(!decoder.is_done());

        events.extend(decoder.feed(EMPTY_FRAME.as_bytes()));
        assert_eq!(events, vec![StreamEvent::Done]);
        assert!(decoder.is_done());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_delta_resets_stall_counter() {
        let mut decoder = decoder();
        for _ in 0..4 {
            decoder.feed(EMPTY_FRAME.as_bytes());
        }
        decoder.feed(content_frame("x").as_bytes());
        assert_eq!(decoder.accumulator().stalls, 0);
        for _ in 0..4 {
            decoder.feed(EMPTY_FRAME.as_bytes());
        }
        assert!(!decoder.is_done());
    }

    #[test]
    fn test_lines_without_data_prefix_ignored() {
        let mut decoder = decoder();
        let events = decoder.feed(b": keep-alive\nevent: message\nid: 7\n\n");
        assert!(events.is_empty());
        assert_eq!(decoder.accumulator().stalls, 0);
    }

    #[test]
    fn test_reasoning_and_content_channels() {
        let mut decoder = decoder();
        let events = decoder.feed(
            b"data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"Let me\",\"content\":null}}]}\n\
              data: {\"choices\":[{\"delta\":{\"reasoning_content\":\" think\"}}]}\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"42\"}}]}\n",
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta {
                    kind: DeltaKind::Reasoning,
                    text: "Let me".to_string()
                },
                StreamEvent::Delta {
                    kind: DeltaKind::Reasoning,
                    text: "Let methink".to_string()
                },
                content("42"),
            ]
        );
    }

    #[test]
    fn test_untrimmed_deltas_when_configured() {
        let config = StreamConfig {
            trim_deltas: false,
            ..StreamConfig::default()
        };
        let mut decoder = StreamDecoder::new(ProviderFamily::OpenAiCompatible.adapter(), &config);
        decoder.feed(content_frame("Hello").as_bytes());
        let events = decoder.feed(content_frame(" world").as_bytes());
        assert_eq!(events, vec![content("Hello world")]);
    }

    #[test]
    fn test_embedded_error_fails_stream() {
        let mut decoder = decoder();
        let events = decoder.feed(
            b"data: {\"error\":{\"message\":\"model not found\"}}\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n",
        );
        assert_eq!(events, vec![StreamEvent::NullContent, StreamEvent::Done]);
        assert!(decoder.feed(content_frame("late").as_bytes()).is_empty());
    }

    #[test]
    fn test_finish_processes_unterminated_line() {
        let mut decoder = decoder();
        let frame = content_frame("tail");
        let events = decoder.feed(frame.trim_end().as_bytes());
        assert!(events.is_empty());
        assert_eq!(decoder.finish(), vec![content("tail"), StreamEvent::Done]);
    }

    #[test]
    fn test_oversized_line_is_dropped() {
        let mut decoder = decoder();
        let mut huge = String::from("data: {\"choices\":[{\"delta\":{\"content\":\"");
        huge.push_str(&"x".repeat(MAX_LINE_BYTES));

        assert_eq!(decoder.feed(huge.as_bytes()), vec![StreamEvent::NullContent]);
        assert!(decoder.feed(b"still the same line").is_empty());

        let rest = format!("\"}}}}]}}\n{}", content_frame("ok"));
        assert_eq!(decoder.feed(rest.as_bytes()), vec![content("ok")]);
        assert!(!decoder.is_done());
        assert_eq!(decoder.accumulator().content, "ok");
    }

    #[test]
    fn test_crlf_lines() {
        let mut decoder = decoder();
        let frame = content_frame("crlf").replace('\n', "\r\n");
        assert_eq!(decoder.feed(frame.as_bytes()), vec![content("crlf")]);
    }

    #[test]
    fn test_done_is_emitted_once() {
        let mut decoder = decoder();
        let mut events = decoder.feed(b"data: [DONE]\ndata: [DONE]\n");
        events.extend(decoder.feed(b"data: [DONE]\n"));
        events.extend(decoder.finish());
        assert_eq!(events, vec![StreamEvent::Done]);
    }
}
