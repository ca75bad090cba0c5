//! Writes inline image results to disk and prepares them for delivery.

use crate::media;
use crate::platform::FileRelay;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct RelayTarget {
    host: String,
    port: u16,
    relay: Arc<dyn FileRelay>,
}

pub struct Materializer {
    images_dir: PathBuf,
    retain: bool,
    relay: Option<RelayTarget>,
}

impl Materializer {
    /// `retain` keeps delivered files on disk instead of removing them.
    pub fn new(images_dir: impl Into<PathBuf>, retain: bool) -> Self {
        Self {
            images_dir: images_dir.into(),
            retain,
            relay: None,
        }
    }

    pub fn with_relay(mut self, host: &str, port: u16, relay: Arc<dyn FileRelay>) -> Self {
        self.relay = Some(RelayTarget {
            host: host.to_string(),
            port,
            relay,
        });
        self
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Decodes each `data:` URI into a file under the images directory.
    /// Entries that fail to decode or write are skipped.
    pub async fn materialize(&self, data_uris: &[String]) -> Vec<PathBuf> {
        if data_uris.is_empty() {
            return Vec::new();
        }
        if let Err(err) = tokio::fs::create_dir_all(&self.images_dir).await {
            warn!(
                dir = %self.images_dir.display(),
                error = %err,
                "Failed to create image directory"
            );
            return Vec::new();
        }

        let mut saved = Vec::with_capacity(data_uris.len());
        for uri in data_uris {
            let image = match media::decode_data_uri(uri) {
                Ok(image) => image,
                Err(err) => {
                    warn!(error = %err, "Skipping undecodable image result");
                    continue;
                }
            };
            let path = self.images_dir.join(result_file_name(&image.extension));
            match tokio::fs::write(&path, &image.bytes).await {
                Ok(()) => {
                    debug!(path = %path.display(), bytes = image.bytes.len(), "Saved image result");
                    saved.push(path);
                }
                Err(err) => warn!(path = %path.display(), error = %err, "Failed to save image result"),
            }
        }
        saved
    }

    /// Path to hand the platform. Goes through the relay when one is
    /// configured, falling back to the local path.
    pub async fn prepare_for_delivery(&self, path: &Path) -> String {
        let local = path.to_string_lossy().to_string();
        let Some(target) = &self.relay else {
            return local;
        };
        match target
            .relay
            .send_file(path, &target.host, target.port)
            .await
        {
            Ok(Some(remote)) if !remote.trim().is_empty() => {
                info!(local = %local, remote = %remote, "Relayed image file");
                remote
            }
            Ok(_) => local,
            Err(err) => {
                warn!(path = %local, error = %err, "File relay failed, using local path");
                local
            }
        }
    }

    pub async fn cleanup(&self, path: &Path) {
        if self.retain {
            return;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "Removed delivered image"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "Failed to remove image"),
        }
    }
}

fn result_file_name(extension: &str) -> String {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("retouch_{}_{}.{}", stamp, &suffix[..8], extension)
}
