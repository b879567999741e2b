//! Rate-limited FIFO dispatch of chat requests.
//!
//! Envelopes wait in a queue until an admission pass finds room in the
//! per-second and per-minute quota windows. Admitted envelopes are handed to
//! a [`Handler`] on their own tasks. A single driver task runs admission
//! passes, woken by enqueues, dispatch completions and the [`Scheduler`].

pub mod clock;
pub mod observer;
pub mod quota;
pub mod scheduler;

pub use clock::{Clock, SystemClock, TokioClock};
pub use observer::{SubscriptionId, ThrottleObserver, ThrottleObservers};
pub use quota::{Admission, QueueError, QuotaWindow};
pub use scheduler::Scheduler;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, SchedulerConfig};
use crate::delta::DeltaSink;
use crate::format::ChatMessage;
use crate::registry::ProviderConfig;

/// Where a request goes, captured when it is enqueued.
#[derive(Debug, Clone)]
pub struct Route {
    pub provider: ProviderConfig,
    pub model: String,
    pub token: String,
}

/// One queued chat request and its delivery channel.
#[derive(Debug)]
pub struct Envelope {
    pub id: Uuid,
    pub route: Route,
    pub messages: Vec<ChatMessage>,
    pub sink: DeltaSink,
}

impl Envelope {
    pub fn new(route: Route, messages: Vec<ChatMessage>, sink: DeltaSink) -> Self {
        Self {
            id: Uuid::new_v4(),
            route,
            messages,
            sink,
        }
    }
}

/// Performs the network call for an admitted envelope.
///
/// The envelope's sink must be completed (or dropped) when the future ends.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, envelope: Envelope) -> impl Future<Output = ()> + Send;
}

struct QueueState {
    pending: VecDeque<Envelope>,
    window: QuotaWindow,
    scheduler: Scheduler,
    /// Set while an admission pass is running
    processing: bool,
    active: usize,
    /// Observers were last told the queue is throttled
    throttled: bool,
}

struct Shared<H: Handler> {
    state: Mutex<QueueState>,
    handler: Arc<H>,
    clock: Arc<dyn Clock>,
    observers: Arc<ThrottleObservers>,
    timing: SchedulerConfig,
    wake: mpsc::UnboundedSender<()>,
}

/// What one admission pass decided, applied after the state lock is released.
#[derive(Default)]
struct PassOutcome {
    batch: Vec<Envelope>,
    notify: Option<bool>,
    backoff: bool,
}

pub struct DispatchQueue<H: Handler> {
    shared: Arc<Shared<H>>,
}

impl<H: Handler> DispatchQueue<H> {
    /// Create the queue and spawn its driver task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(handler: H, config: &Config, clock: Arc<dyn Clock>) -> Self {
        let (wake, wake_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                window: QuotaWindow::new(config.quota),
                scheduler: Scheduler::new(),
                processing: false,
                active: 0,
                throttled: false,
            }),
            handler: Arc::new(handler),
            clock,
            observers: Arc::new(ThrottleObservers::new()),
            timing: config.scheduler,
            wake,
        });

        tokio::spawn(drive(Arc::downgrade(&shared), wake_rx));

        debug!(
            per_second = config.quota.per_second,
            per_minute = config.quota.per_minute,
            "Dispatch queue started"
        );

        Self { shared }
    }

    /// Append an envelope and trigger admission. Never fails.
    pub fn enqueue(&self, envelope: Envelope) {
        let pending = {
            let mut state = self.shared.state.lock();
            state.pending.push_back(envelope);
            state.pending.len()
        };
        debug!(pending, "Envelope queued");
        self.shared.wake();
    }

    /// Envelopes waiting for admission.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Dispatches started but not yet finished.
    pub fn active(&self) -> usize {
        self.shared.state.lock().active
    }

    pub fn is_throttled(&self) -> bool {
        self.shared.state.lock().throttled
    }

    pub fn observers(&self) -> &Arc<ThrottleObservers> {
        &self.shared.observers
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.shared.handler
    }
}

impl<H: Handler> std::fmt::Debug for DispatchQueue<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DispatchQueue")
            .field("pending", &state.pending.len())
            .field("active", &state.active)
            .field("throttled", &state.throttled)
            .finish()
    }
}

/// Driver loop: sleep until woken or the scheduled deadline, then run a pass.
/// Exits once the queue is dropped.
async fn drive<H: Handler>(shared: Weak<Shared<H>>, mut wake_rx: mpsc::UnboundedReceiver<()>) {
    loop {
        let deadline = match shared.upgrade() {
            Some(shared) => shared.state.lock().scheduler.deadline(),
            None => return,
        };

        match deadline {
            Some(at) => {
                tokio::select! {
                    message = wake_rx.recv() => {
                        if message.is_none() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            None => {
                if wake_rx.recv().await.is_none() {
                    return;
                }
            }
        }

        // coalesce wake-ups that arrived meanwhile
        while wake_rx.try_recv().is_ok() {}

        match shared.upgrade() {
            Some(shared) => shared.run_pass(),
            None => return,
        }
    }
}

impl<H: Handler> Shared<H> {
    fn wake(&self) {
        // The driver only goes away together with the queue.
        let _ = self.wake.send(());
    }

    fn throttle_message(&self, per_minute: u32) -> String {
        format!(
            "Rate limit reached: at most {} requests per minute, waiting for the window to reset",
            per_minute
        )
    }

    fn run_pass(self: &Arc<Self>) {
        let now = Instant::now();

        let outcome = {
            let mut state = self.state.lock();
            state.scheduler.take_due(now);
            if state.processing || state.pending.is_empty() {
                return;
            }
            state.processing = true;

            match self.admit(&mut state, now) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "Admission pass failed, retrying");
                    state.scheduler.schedule_after(now, self.timing.error_backoff());
                    PassOutcome {
                        backoff: true,
                        ..PassOutcome::default()
                    }
                }
            }
        };

        for envelope in outcome.batch {
            self.dispatch(envelope);
        }

        let per_minute = {
            let mut state = self.state.lock();
            state.processing = false;
            if !state.pending.is_empty() && !outcome.backoff {
                state.scheduler.schedule_after(now, self.timing.drain_interval());
            }
            state.window.per_minute()
        };

        // Observers run last, with the pass fully settled.
        if let Some(throttled) = outcome.notify {
            let message = if throttled {
                self.throttle_message(per_minute)
            } else {
                String::new()
            };
            self.observers.notify(throttled, &message);
        }
    }

    fn admit(&self, state: &mut QueueState, now: Instant) -> Result<PassOutcome, QueueError> {
        state.window.refresh(self.clock.now_ms())?;

        let available = match state.window.check() {
            Admission::Throttled {
                second_full,
                minute_full,
            } => {
                let delay = if second_full {
                    self.timing.second_backoff()
                } else {
                    self.timing.minute_backoff()
                };
                state.scheduler.schedule_after(now, delay);

                let notify = (minute_full && !state.throttled).then(|| {
                    state.throttled = true;
                    true
                });
                if notify.is_some() {
                    info!(
                        pending = state.pending.len(),
                        per_minute = state.window.per_minute(),
                        "Per-minute quota reached, holding queue"
                    );
                } else {
                    debug!(
                        pending = state.pending.len(),
                        second_full,
                        minute_full,
                        delay_ms = delay.as_millis() as u64,
                        "Quota window full"
                    );
                }

                return Ok(PassOutcome {
                    notify,
                    backoff: true,
                    ..PassOutcome::default()
                });
            }
            Admission::Open { available } => available,
        };

        let notify = state.throttled.then(|| {
            state.throttled = false;
            false
        });

        if available == 0 {
            state.scheduler.schedule_after(now, self.timing.error_backoff());
            return Ok(PassOutcome {
                notify,
                backoff: true,
                ..PassOutcome::default()
            });
        }

        let n = (available as usize).min(state.pending.len());
        state.window.record(n as u32);
        state.active += n;
        let batch: Vec<Envelope> = state.pending.drain(..n).collect();

        debug!(
            admitted = n,
            pending = state.pending.len(),
            active = state.active,
            second_count = state.window.second_count(),
            minute_count = state.window.minute_count(),
            "Admitted envelopes"
        );

        Ok(PassOutcome {
            batch,
            notify,
            backoff: false,
        })
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let guard = ActiveGuard {
            shared: Arc::clone(self),
        };
        let handler = Arc::clone(&self.handler);
        let id = envelope.id;

        tokio::spawn(async move {
            let _guard = guard;
            debug!(id = %id, "Dispatching envelope");
            handler.handle(envelope).await;
        });
    }
}

/// Releases an active slot when a dispatch task ends, including by panic.
struct ActiveGuard<H: Handler> {
    shared: Arc<Shared<H>>,
}

impl<H: Handler> Drop for ActiveGuard<H> {
    fn drop(&mut self) {
        let has_pending = {
            let mut state = self.shared.state.lock();
            state.active = state.active.saturating_sub(1);
            !state.pending.is_empty()
        };
        if has_pending {
            self.shared.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaConfig;
    use crate::delta::{DeltaKind, DeltaStream, StreamEvent};
    use crate::registry::{ProviderId, builtin_config};

    /// Records the clock time at which each envelope reached the handler.
    struct Recorder {
        clock: TokioClock,
        calls: Mutex<Vec<(String, i64)>>,
    }

    impl Handler for Recorder {
        async fn handle(&self, mut envelope: Envelope) {
            let label = envelope.messages[0].content().to_string();
            self.calls.lock().push((label.clone(), self.clock.now_ms()));
            if label == "boom" {
                panic!("handler failure");
            }
            envelope.sink.emit(StreamEvent::Delta {
                kind: DeltaKind::Content,
                text: label,
            });
            envelope.sink.finish();
        }
    }

    fn route() -> Route {
        let provider = builtin_config(ProviderId::SiliconFlow);
        Route {
            model: provider.default_model.clone(),
            provider,
            token: "sk-test".to_string(),
        }
    }

    fn queue(config: &Config) -> (DispatchQueue<Recorder>, TokioClock) {
        let clock = TokioClock::starting_at(0);
        let recorder = Recorder {
            clock,
            calls: Mutex::new(Vec::new()),
        };
        (DispatchQueue::new(recorder, config, Arc::new(clock)), clock)
    }

    fn send(queue: &DispatchQueue<Recorder>, label: &str) -> DeltaStream {
        let (sink, stream) = DeltaSink::channel();
        queue.enqueue(Envelope::new(
            route(),
            vec![ChatMessage::user(label)],
            sink,
        ));
        stream
    }

    fn calls(queue: &DispatchQueue<Recorder>) -> Vec<(String, i64)> {
        queue.handler().calls.lock().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_second_ceiling() {
        let (queue, _clock) = queue(&Config::default());
        let streams: Vec<_> = (0..5).map(|i| send(&queue, &i.to_string())).collect();

        for stream in streams {
            stream.collect().await;
        }

        let calls = calls(&queue);
        assert_eq!(calls.len(), 5);
        let first_second = calls.iter().filter(|(_, at)| *at < 1_000).count();
        assert_eq!(first_second, 3);
        assert!(calls[3].1 >= 1_000);
        assert!(calls[4].1 >= 1_000 && calls[4].1 < 2_000);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_minute_ceiling_notifies_observers() {
        let (queue, _clock) = queue(&Config::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        queue.observers().subscribe(move |throttled, message| {
            sink.lock().push((throttled, message.to_string()));
        });

        let streams: Vec<_> = (0..11).map(|i| send(&queue, &i.to_string())).collect();
        for stream in streams {
            stream.collect().await;
        }

        let calls = calls(&queue);
        assert_eq!(calls.len(), 11);
        assert!(calls[..10].iter().all(|(_, at)| *at < 60_000));
        assert!(calls[10].1 >= 60_000);

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].0);
        assert!(seen[0].1.contains("10 requests per minute"));
        assert_eq!(seen[1], (false, String::new()));
        assert!(!queue.is_throttled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_second_throttle_is_silent() {
        let (queue, _clock) = queue(&Config::default());
        let notified = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&notified);
        queue.observers().subscribe(move |_, _| *counter.lock() += 1);

        let streams: Vec<_> = (0..6).map(|i| send(&queue, &i.to_string())).collect();
        for stream in streams {
            stream.collect().await;
        }
        assert_eq!(*notified.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_admission() {
        let (queue, _clock) = queue(&Config::default());
        let labels: Vec<String> = (0..7).map(|i| format!("m{i}")).collect();
        let streams: Vec<_> = labels.iter().map(|l| send(&queue, l)).collect();
        for stream in streams {
            stream.collect().await;
        }

        let order: Vec<String> = calls(&queue).into_iter().map(|(l, _)| l).collect();
        assert_eq!(order, labels);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_ceilings() {
        let config = Config {
            quota: QuotaConfig {
                per_second: 1,
                per_minute: 100,
            },
            ..Config::default()
        };
        let (queue, _clock) = queue(&config);
        let streams: Vec<_> = (0..3).map(|i| send(&queue, &i.to_string())).collect();
        for stream in streams {
            stream.collect().await;
        }

        let seconds: Vec<i64> = calls(&queue).iter().map(|(_, at)| at / 1_000).collect();
        assert_eq!(seconds, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_still_completes() {
        let (queue, _clock) = queue(&Config::default());
        let boom = send(&queue, "boom");
        let ok = send(&queue, "fine");

        let summary = boom.collect().await;
        assert_eq!(summary.content, "");
        let summary = ok.collect().await;
        assert_eq!(summary.content, "fine");

        // let the panicked task unwind
        tokio::task::yield_now().await;
        assert_eq!(queue.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_skipped_while_processing() {
        let (queue, _clock) = queue(&Config::default());
        queue.shared.state.lock().processing = true;

        let (sink, _stream) = DeltaSink::channel();
        queue
            .shared
            .state
            .lock()
            .pending
            .push_back(Envelope::new(route(), vec![ChatMessage::user("x")], sink));

        queue.shared.run_pass();
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.active(), 0);

        queue.shared.state.lock().processing = false;
        queue.shared.run_pass();
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_observer_does_not_stall_queue() {
        let (queue, _clock) = queue(&Config::default());
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&transitions);
        queue.observers().subscribe(|_, _| panic!("observer failure"));
        queue.observers().subscribe(move |throttled, _| log.lock().push(throttled));

        let streams: Vec<_> = (0..11).map(|i| send(&queue, &i.to_string())).collect();
        for stream in streams {
            stream.collect().await;
        }
        assert_eq!(calls(&queue).len(), 11);

        let late = send(&queue, "late").collect().await;
        assert_eq!(late.content, "late");
        assert_eq!(calls(&queue).len(), 12);

        tokio::task::yield_now().await;
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.active(), 0);
        assert!(!queue.shared.state.lock().processing);
        assert_eq!(*transitions.lock(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_regression_retries() {
        let (queue, _clock) = queue(&Config::default());
        queue.shared.state.lock().window.refresh(600_000).unwrap();

        let stream = send(&queue, "after-regression");
        let summary = stream.collect().await;
        assert_eq!(summary.content, "after-regression");

        let calls = calls(&queue);
        assert!(calls[0].1 >= 1_000);
    }
}
