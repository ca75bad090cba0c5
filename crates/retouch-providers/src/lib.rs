//! Retouch Providers
//!
//! Chat-completions style image editing client plus a tolerant parser for the
//! image results it returns

mod client;
pub mod parser;

pub use client::{EditApiSettings, ImageEditClient};
pub use parser::{extract_images, is_valid_image_url};

use thiserror::Error;

/// Images found in one upstream answer, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditedImages {
    pub urls: Vec<String>,
    pub data_uris: Vec<String>,
}

impl EditedImages {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.data_uris.is_empty()
    }

    pub fn len(&self) -> usize {
        self.urls.len() + self.data_uris.len()
    }
}

/// Upstream failures. `Display` is what the chat user sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error("API key is not configured")]
    MissingApiKey,
    #[error("API access denied, check the key and its permissions")]
    AccessDenied,
    #[error("API request failed (status {status}): {detail}")]
    Http { status: u16, detail: String },
    #[error("Request timed out ({secs} seconds)")]
    Timeout { secs: u64 },
    #[error("Request error: {0}")]
    Transport(String),
    #[error("Failed to decode API response JSON: {error}, body: {body}")]
    Decode { error: String, body: String },
    #[error("Invalid response format: {0}")]
    InvalidResponse(String),
    #[error("No valid image found in API response")]
    NoImages,
    #[error("All retry attempts failed")]
    Exhausted,
}

impl EditError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EditError::Http { .. } | EditError::Timeout { .. } | EditError::Transport(_)
        )
    }
}

#[async_trait::async_trait]
pub trait ImageEditor: Send + Sync {
    fn name(&self) -> &str;
    async fn edit(&self, prompt: &str, image_data_uri: &str) -> Result<EditedImages, EditError>;
    async fn health_check(&self) -> anyhow::Result<bool>;
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}
