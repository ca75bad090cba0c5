//! Seams to the chat platform and the optional file relay.

use std::path::Path;

/// Platform action endpoint, OneBot style: `get_msg`, `get_image`, ...
#[async_trait::async_trait]
pub trait MessageQuery: Send + Sync {
    async fn call_action(
        &self,
        action: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

/// An image handed to the platform for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingImage {
    Url(String),
    /// Local path, or whatever path reference the relay handed back.
    File(String),
}

/// Replies into the conversation the request came from.
#[async_trait::async_trait]
pub trait ReplySink: Send + Sync {
    async fn send_text(&self, text: &str) -> anyhow::Result<()>;
    async fn send_images(&self, images: &[OutgoingImage]) -> anyhow::Result<()>;
}

/// Forwards a local file to the platform's media host and returns the path
/// the platform should use instead. `Ok(None)` means the relay had nothing
/// usable to return.
#[async_trait::async_trait]
pub trait FileRelay: Send + Sync {
    async fn send_file(&self, path: &Path, host: &str, port: u16)
        -> anyhow::Result<Option<String>>;
}
