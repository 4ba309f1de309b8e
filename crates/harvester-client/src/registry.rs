//! Source clients and parsers built from `sources.toml`.
//!
//! [`SourceClient`] returns `impl Future`, so it is not object safe.
//! [`SourceClientEnum`] provides runtime selection between the HTTP and the
//! file client, and [`SourceRegistry`] holds one client and one parser per
//! configured stream.

use std::collections::BTreeMap;

use harvester_core::config::SourceConfig;
use harvester_core::error::AppError;
use harvester_core::models::{Position, RawPayload, StreamKey};
use harvester_core::traits::SourceClient;

use crate::file::FileSourceClient;
use crate::http::HttpSourceClient;
use crate::parser::JsonEntityParser;
use crate::session::SessionHandle;

/// Source client chosen from the URL template scheme.
#[derive(Clone)]
pub enum SourceClientEnum {
    Http(HttpSourceClient),
    /// `file://` templates, served from disk.
    File(FileSourceClient),
}

impl SourceClientEnum {
    pub fn from_source(source: &SourceConfig) -> Result<Self, AppError> {
        if FileSourceClient::handles(&source.url_template) {
            Ok(Self::File(FileSourceClient::from_source(source)?))
        } else {
            Ok(Self::Http(HttpSourceClient::from_source(source)?))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::File(_) => "file",
        }
    }

    /// Session of an HTTP source. File sources have none.
    pub fn session(&self) -> Option<&SessionHandle> {
        match self {
            Self::Http(c) => Some(c.session()),
            Self::File(_) => None,
        }
    }
}

impl SourceClient for SourceClientEnum {
    async fn fetch(&self, position: Position) -> Result<RawPayload, AppError> {
        match self {
            Self::Http(c) => c.fetch(position).await,
            Self::File(c) => c.fetch(position).await,
        }
    }

    async fn on_session_expired(&self) -> Result<(), AppError> {
        match self {
            Self::Http(c) => c.on_session_expired().await,
            Self::File(c) => c.on_session_expired().await,
        }
    }
}

/// Everything needed to run one stream.
#[derive(Clone)]
pub struct RegisteredSource {
    pub config: SourceConfig,
    pub client: SourceClientEnum,
    pub parser: JsonEntityParser,
}

/// Streams by key, in key order.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<StreamKey, RegisteredSource>,
}

impl SourceRegistry {
    /// Validates every entry and builds its client and parser.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` for invalid or duplicate entries.
    pub fn from_sources<'a>(
        sources: impl IntoIterator<Item = &'a SourceConfig>,
    ) -> Result<Self, AppError> {
        let mut registry = Self::default();
        for source in sources {
            registry.register(source.clone())?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, config: SourceConfig) -> Result<(), AppError> {
        config.validate()?;
        let key = config.key();
        if self.sources.contains_key(&key) {
            return Err(AppError::ConfigError(format!("duplicate stream {}", key)));
        }

        let client = SourceClientEnum::from_source(&config)?;
        let parser = JsonEntityParser::new(config.entities.clone())
            .map_err(|e| AppError::ConfigError(format!("{}: {}", key, e)))?;

        tracing::debug!(stream = %key, client = client.name(), "Registered source");
        self.sources.insert(
            key,
            RegisteredSource {
                config,
                client,
                parser,
            },
        );
        Ok(())
    }

    pub fn get(&self, key: &StreamKey) -> Option<&RegisteredSource> {
        self.sources.get(key)
    }

    /// Streams of the source `name` (case-insensitive).
    pub fn for_source(&self, name: &str) -> Vec<&RegisteredSource> {
        self.sources
            .values()
            .filter(|s| s.config.name.eq_ignore_ascii_case(name))
            .collect()
    }

    pub fn keys(&self) -> Vec<StreamKey> {
        self.sources.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
