//! Prompt templates for the filter and summary calls.
//!
//! Each template contains one `$MESSAGE` marker that is replaced by a JSON
//! payload. Templates can be fixed in memory or re-read from disk on every
//! use so prompt edits apply without a restart.

use std::path::Path;

use crate::config::PromptPaths;
use crate::error::ConfigError;

/// Substitution marker for the JSON payload.
pub const MESSAGE_MARKER: &str = "$MESSAGE";

/// The filter and summary templates used for one batch or request.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    filter: String,
    summary: String,
}

impl PromptTemplates {
    /// Build templates from in-memory text.
    pub fn new(filter: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            summary: summary.into(),
        }
    }

    /// Read both templates from disk.
    pub async fn load(paths: &PromptPaths) -> Result<Self, ConfigError> {
        Ok(Self {
            filter: read_template(&paths.filter).await?,
            summary: read_template(&paths.summary).await?,
        })
    }

    pub fn fill_filter(&self, payload: &str) -> String {
        self.filter.replace(MESSAGE_MARKER, payload)
    }

    pub fn fill_summary(&self, payload: &str) -> String {
        self.summary.replace(MESSAGE_MARKER, payload)
    }
}

async fn read_template(path: &Path) -> Result<String, ConfigError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::PromptRead {
            path: path.display().to_string(),
            source,
        })?;
    if !text.contains(MESSAGE_MARKER) {
        return Err(ConfigError::PromptMarkerMissing {
            path: path.display().to_string(),
            marker: MESSAGE_MARKER.to_string(),
        });
    }
    Ok(text)
}

/// Where templates come from.
#[derive(Debug, Clone)]
pub enum PromptSource {
    /// Same templates for every use.
    Fixed(PromptTemplates),
    /// Re-read from these files on every use.
    Files(PromptPaths),
}

impl PromptSource {
    pub async fn load(&self) -> Result<PromptTemplates, ConfigError> {
        match self {
            Self::Fixed(templates) => Ok(templates.clone()),
            Self::Files(paths) => PromptTemplates::load(paths).await,
        }
    }
}
