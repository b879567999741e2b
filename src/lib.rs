//! Rate-limited, streaming client for LLM chat-completion APIs.
//!
//! Requests go through a FIFO [`queue::DispatchQueue`] that admits at most a
//! configured number of calls per second and per minute. Responses are decoded
//! incrementally and delivered as cumulative deltas on a [`DeltaStream`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use chatrelay::{ChatClient, ChatMessage, Config, FileStore};
//!
//! # async fn run() -> chatrelay::Result<()> {
//! let config = Config::load()?;
//! chatrelay::logging::init(config.logging.debug);
//!
//! let store = Arc::new(FileStore::open(FileStore::default_path())?);
//! let client = ChatClient::new(config, store);
//! client.set_token("sk-...")?;
//!
//! let summary = client
//!     .send_message(vec![ChatMessage::user("Hello")])
//!     .collect()
//!     .await;
//! println!("{}", summary.content);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod client;
pub mod config;
pub mod decoder;
pub mod delta;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod http;
pub mod logging;
pub mod models;
pub mod queue;
pub mod registry;
pub mod store;

pub use client::{ChatClient, mask_token};
pub use config::Config;
pub use delta::{DeltaKind, DeltaSink, DeltaStream, StreamEvent, StreamSummary};
pub use error::{Error, Result};
pub use format::{ChatMessage, Role};
pub use models::ModelCatalog;
pub use queue::{SubscriptionId, ThrottleObserver};
pub use registry::{CustomProviderPatch, ProviderConfig, ProviderFamily, ProviderId};
pub use store::{FileStore, KeyValueStore, MemoryStore};
