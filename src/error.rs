use thiserror::Error;

use crate::adapter::FrameError;
use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected provider response: {0}")]
    Response(#[from] FrameError),
}

impl Error {
    /// Hint attached to `warn!` lines when a request or model list fetch fails.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Api { status: 401, .. } | Error::Api { status: 403, .. } => {
                Some("Check that the API token is valid for the selected provider")
            }
            Error::Api { status: 429, .. } => Some("Too many requests, slow down"),
            Error::Api { status: 500..=599, .. } => {
                Some("The provider is having trouble, try again in a few minutes")
            }
            Error::UnknownProvider(_) => Some("Use one of the identifiers from the provider list"),
            Error::Http(_) => Some("Check your internet connection and try again"),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("corrupted store file {path}: {source}")]
    Corrupted {
        path: String,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
