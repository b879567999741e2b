//! Delivery channel between a dispatched request and its caller.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    /// Final-answer text
    Content,
    /// Reasoning / "thinking" text
    Reasoning,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Content => "content",
            DeltaKind::Reasoning => "reasoning_content",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Cumulative text of one channel so far, not just the latest piece
    Delta { kind: DeltaKind, text: String },
    /// A frame or request failed; no text accompanies it
    NullContent,
    /// End of stream, sent exactly once
    Done,
}

/// Producing half of a request's event channel.
///
/// `Done` is delivered exactly once: by `finish`, by `fail`, or on drop.
#[derive(Debug)]
pub struct DeltaSink {
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl DeltaSink {
    pub fn channel() -> (DeltaSink, DeltaStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DeltaSink { tx: Some(tx) }, DeltaStream { rx, done: false })
    }

    /// Forward one event; anything after `Done` is discarded.
    pub fn emit(&mut self, event: StreamEvent) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };

        let is_done = event == StreamEvent::Done;
        // A dropped receiver only means the caller stopped listening.
        let _ = tx.send(event);
        if is_done {
            self.tx = None;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.tx.is_none()
    }

    pub fn finish(mut self) {
        self.emit(StreamEvent::Done);
    }

    /// Deliver a null content value followed by completion.
    pub fn fail(mut self) {
        self.emit(StreamEvent::NullContent);
        self.emit(StreamEvent::Done);
    }
}

impl Drop for DeltaSink {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(StreamEvent::Done);
        }
    }
}

/// Consuming half: a finite, non-restartable sequence of events ending in `Done`.
#[derive(Debug)]
pub struct DeltaStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    done: bool,
}

/// Final state of a stream once `Done` has been seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub content: String,
    pub reasoning: String,
    /// Number of null content events observed
    pub null_events: usize,
}

impl DeltaStream {
    /// Next event, or `None` once `Done` has been returned.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }

        // Sender gone without `Done` counts as completion.
        let event = self.rx.recv().await.unwrap_or(StreamEvent::Done);
        if event == StreamEvent::Done {
            self.done = true;
        }
        Some(event)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Drain the stream and keep the final cumulative text of each channel.
    pub async fn collect(mut self) -> StreamSummary {
        let mut summary = StreamSummary::default();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Delta {
                    kind: DeltaKind::Content,
                    text,
                } => summary.content = text,
                StreamEvent::Delta {
                    kind: DeltaKind::Reasoning,
                    text,
                } => summary.reasoning = text,
                StreamEvent::NullContent => summary.null_events += 1,
                StreamEvent::Done => {}
            }
        }
        summary
    }
}
