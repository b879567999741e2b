//! Public entry point: configuration, sending, model catalog.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::delta::{DeltaKind, DeltaSink, DeltaStream, StreamEvent};
use crate::dispatch::ChatDispatcher;
use crate::error::Result;
use crate::format::ChatMessage;
use crate::http::HttpClient;
use crate::models::{ModelCatalog, fetch_catalog};
use crate::queue::{Clock, DispatchQueue, Envelope, Route, SubscriptionId, SystemClock};
use crate::registry::{CustomProviderPatch, ProviderConfig, ProviderEntry, ProviderId, Registry};
use crate::store::{KEY_MODEL, KEY_PROVIDER, KEY_TOKEN, KeyValueStore};

const MASK: &str = "***…***";
const MASK_PREFIX_CHARS: usize = 4;
const MASK_SUFFIX_CHARS: usize = 6;

#[derive(Debug, Clone)]
struct Settings {
    token: String,
    provider: ProviderId,
    model: String,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    registry: Registry,
    http: HttpClient,
    settings: RwLock<Settings>,
    catalog: watch::Sender<ModelCatalog>,
    /// Bumped per refresh request; only the latest may publish.
    refresh_generation: AtomicU64,
}

/// Rate-limited, streaming chat client.
///
/// Construct inside a tokio runtime: the dispatch queue spawns its driver task.
pub struct ChatClient {
    config: Config,
    inner: Arc<Inner>,
    queue: DispatchQueue<ChatDispatcher>,
}

impl ChatClient {
    pub fn new(config: Config, store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let registry = Registry::new(Arc::clone(&store));

        let token = store.get(KEY_TOKEN).unwrap_or_default();
        let provider = match store.get(KEY_PROVIDER) {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!(provider = %raw, error = %e, "Ignoring stored provider");
                ProviderId::default()
            }),
            None => ProviderId::default(),
        };
        let provider_config = registry.config(provider);
        let model = store
            .get(KEY_MODEL)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| provider_config.default_model.clone());

        debug!(
            provider = %provider,
            model = %model,
            token_set = !token.is_empty(),
            "Restored client settings"
        );

        let (catalog, _) = watch::channel(ModelCatalog::fallback(provider, &provider_config));

        let inner = Arc::new(Inner {
            store,
            registry,
            http: HttpClient::new(),
            settings: RwLock::new(Settings {
                token,
                provider,
                model,
            }),
            catalog,
            refresh_generation: AtomicU64::new(0),
        });

        let queue = DispatchQueue::new(ChatDispatcher::new(&config), &config, clock);

        Self {
            config,
            inner,
            queue,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Queue `messages` for the current provider and model. Never fails here;
    /// transport problems arrive on the stream as `NullContent` then `Done`.
    pub fn send_message(&self, messages: Vec<ChatMessage>) -> DeltaStream {
        let (sink, stream) = DeltaSink::channel();
        let envelope = Envelope::new(self.route(), messages, sink);
        debug!(id = %envelope.id, model = %envelope.route.model, "Queueing message");
        self.queue.enqueue(envelope);
        stream
    }

    /// Callback form of [`send_message`](Self::send_message).
    ///
    /// `on_delta` receives the cumulative text of a channel, or `None` when a
    /// frame or the request failed. `on_complete` runs exactly once.
    pub fn send_message_with<D, C>(&self, mut on_delta: D, on_complete: C, messages: Vec<ChatMessage>)
    where
        D: FnMut(Option<&str>, DeltaKind) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let mut stream = self.send_message(messages);
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::Delta { kind, text } => on_delta(Some(&text), kind),
                    StreamEvent::NullContent => on_delta(None, DeltaKind::Content),
                    StreamEvent::Done => {}
                }
            }
            on_complete();
        });
    }

    pub fn set_token(&self, token: &str) -> Result<()> {
        let token = token.trim();
        self.inner.store.set(KEY_TOKEN, token)?;
        self.inner.settings.write().token = token.to_string();
        info!(token_set = !token.is_empty(), "API token updated");
        Ok(())
    }

    /// Switch provider; the active model resets to the provider's default.
    pub fn set_provider(&self, provider: ProviderId) -> Result<()> {
        let config = self.inner.registry.config(provider);
        let model = config.default_model.clone();

        self.inner.store.set(KEY_PROVIDER, provider.as_str())?;
        self.inner.store.set(KEY_MODEL, &model)?;
        {
            let mut settings = self.inner.settings.write();
            settings.provider = provider;
            settings.model = model.clone();
        }
        self.inner
            .catalog
            .send_replace(ModelCatalog::fallback(provider, &config));

        info!(provider = %provider, model = %model, "Provider changed");
        self.spawn_refresh();
        Ok(())
    }

    pub fn set_model(&self, model: &str) -> Result<()> {
        let model = model.trim();
        self.inner.store.set(KEY_MODEL, model)?;
        self.inner.settings.write().model = model.to_string();

        info!(model = %model, "Model changed");
        self.spawn_refresh();
        Ok(())
    }

    /// Merge `patch` into the custom provider slot and persist it.
    pub fn set_custom_provider_config(&self, patch: CustomProviderPatch) -> Result<()> {
        self.inner.registry.set_custom(patch)?;

        if self.provider() != ProviderId::Custom {
            return Ok(());
        }

        let config = self.inner.registry.config(ProviderId::Custom);
        let needs_model = self.inner.settings.read().model.trim().is_empty();
        if needs_model && !config.default_model.is_empty() {
            self.inner.store.set(KEY_MODEL, &config.default_model)?;
            self.inner.settings.write().model = config.default_model.clone();
        }

        self.spawn_refresh();
        Ok(())
    }

    pub fn token_ready(&self) -> bool {
        !self.inner.settings.read().token.is_empty()
    }

    /// Display form of the token, `None` when no token is set.
    pub fn masked_token(&self) -> Option<String> {
        let settings = self.inner.settings.read();
        (!settings.token.is_empty()).then(|| mask_token(&settings.token))
    }

    /// Fetch the model list for the current provider and publish it.
    pub async fn refresh_models(&self) -> ModelCatalog {
        let generation = self.inner.begin_refresh();
        self.inner.refresh(generation).await
    }

    pub fn models(&self) -> ModelCatalog {
        self.inner.catalog.borrow().clone()
    }

    pub fn watch_models(&self) -> watch::Receiver<ModelCatalog> {
        self.inner.catalog.subscribe()
    }

    pub fn subscribe_throttle<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(bool, &str) + Send + Sync + 'static,
    {
        self.queue.observers().subscribe(observer)
    }

    pub fn unsubscribe_throttle(&self, id: SubscriptionId) -> bool {
        self.queue.observers().unsubscribe(id)
    }

    pub fn providers(&self) -> Vec<ProviderEntry> {
        self.inner.registry.list()
    }

    pub fn provider(&self) -> ProviderId {
        self.inner.settings.read().provider
    }

    pub fn model(&self) -> String {
        self.inner.settings.read().model.clone()
    }

    pub fn provider_config(&self) -> ProviderConfig {
        self.inner.registry.config(self.provider())
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Envelopes waiting for admission.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Requests currently in flight.
    pub fn active(&self) -> usize {
        self.queue.active()
    }

    fn route(&self) -> Route {
        let settings = self.inner.settings.read().clone();
        Route {
            provider: self.inner.registry.config(settings.provider),
            model: settings.model,
            token: settings.token,
        }
    }

    fn spawn_refresh(&self) {
        let inner = Arc::clone(&self.inner);
        let generation = inner.begin_refresh();
        tokio::spawn(async move {
            inner.refresh(generation).await;
        });
    }
}

impl Inner {
    fn begin_refresh(&self) -> u64 {
        self.refresh_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fetch with the current settings; publish unless a newer refresh was
    /// requested or the provider changed meanwhile.
    async fn refresh(&self, generation: u64) -> ModelCatalog {
        let (provider, token) = {
            let settings = self.settings.read();
            (settings.provider, settings.token.clone())
        };
        let config = self.registry.config(provider);
        let catalog = fetch_catalog(&self.http, provider, &config, &token).await;

        let latest = self.refresh_generation.load(Ordering::SeqCst);
        if latest != generation {
            debug!(
                provider = %provider,
                generation,
                latest,
                "Newer refresh requested, discarding model list"
            );
        } else if self.settings.read().provider != provider {
            debug!(provider = %provider, "Provider changed during refresh, discarding model list");
        } else {
            self.catalog.send_replace(catalog.clone());
        }
        catalog
    }
}

/// Keep the first 4 and last 6 characters; shorter tokens are masked entirely.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= MASK_PREFIX_CHARS + MASK_SUFFIX_CHARS {
        return MASK.to_string();
    }

    let prefix: String = chars[..MASK_PREFIX_CHARS].iter().collect();
    let suffix: String = chars[chars.len() - MASK_SUFFIX_CHARS..].iter().collect();
    format!("{prefix} {MASK} {suffix}")
}
