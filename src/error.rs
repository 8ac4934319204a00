//! Error types for ingestion and reconciliation.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("no pass config available: preference store has no rules")]
    NoPassConfig,

    #[error("config error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("run cancelled")]
    Cancelled,
}

impl IngestError {
    /// Wrap a store error with what the engine was doing when it failed.
    pub fn persistence(context: impl Into<String>, source: rusqlite::Error) -> Self {
        IngestError::Persistence {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
