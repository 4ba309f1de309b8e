//! Source client that reads positions from local files.
//!
//! Selected for `file://` URL templates, e.g.
//! `file:///var/lib/harvester/fixtures/{position}.json`. Useful for replaying
//! captured responses together with the memory checkpoint backend.

use std::io::ErrorKind;
use std::path::PathBuf;

use harvester_core::config::SourceConfig;
use harvester_core::error::AppError;
use harvester_core::models::{Position, RawPayload};
use harvester_core::traits::SourceClient;

use crate::http::{POSITION_PLACEHOLDER, ResponseRules};

const FILE_SCHEME: &str = "file://";

#[derive(Debug, Clone)]
pub struct FileSourceClient {
    path_template: String,
    rules: ResponseRules,
}

impl FileSourceClient {
    /// Returns true if `url_template` should be served from disk.
    pub fn handles(url_template: &str) -> bool {
        url_template.starts_with(FILE_SCHEME)
    }

    pub fn from_source(source: &SourceConfig) -> Result<Self, AppError> {
        let path_template = source
            .url_template
            .strip_prefix(FILE_SCHEME)
            .ok_or_else(|| {
                AppError::InvalidUrl(format!("{} is not a file:// template", source.url_template))
            })?
            .to_string();

        Ok(Self {
            path_template,
            rules: ResponseRules::from_source(source),
        })
    }

    pub fn path_for(&self, position: Position) -> PathBuf {
        PathBuf::from(
            self.path_template
                .replace(POSITION_PLACEHOLDER, &position.to_string()),
        )
    }
}

impl SourceClient for FileSourceClient {
    async fn fetch(&self, position: Position) -> Result<RawPayload, AppError> {
        let path = self.path_for(position);
        let body = match tokio::fs::read_to_string(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AppError::NotFound(format!("position {}", position)));
            }
            Err(e) => {
                return Err(AppError::ClientError(format!(
                    "Cannot read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        self.rules.check_body(position, &body)?;
        Ok(RawPayload::new(body))
    }
}
