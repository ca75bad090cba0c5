//! Per-user edit orchestration: access gate, image lookup, background edit
//! task, delivery and cleanup.

use crate::content::IncomingMessage;
use crate::materializer::Materializer;
use crate::platform::{FileRelay, MessageQuery, OutgoingImage, ReplySink};
use crate::resolver::ImageResolver;
use anyhow::{anyhow, Result};
use retouch_config::{Config, StatusMessageMode};
use retouch_policy::{AccessGate, AccessPolicy};
use retouch_providers::{EditApiSettings, EditError, ImageEditClient, ImageEditor};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const EDIT_COMMAND: &str = "/retouch";
pub const STATUS_COMMAND: &str = "/retouch-status";
pub const HELP_COMMAND: &str = "/retouch-help";

const BUSY_MESSAGE: &str =
    "⚠️ You already have an image edit in progress, please wait for it to finish.";
const NO_IMAGE_MESSAGE: &str =
    "❌ Image editing needs an image in your message or a quoted message that contains one.";
const ADMIN_ONLY_MESSAGE: &str = "This command is restricted to administrators";

/// Why a background edit produced nothing to deliver.
#[derive(Debug, Error)]
pub enum EditFailure {
    #[error("Image editing is disabled")]
    Disabled,
    #[error("No image found, include one in your message or quote a message that has one")]
    NoImage,
    #[error(transparent)]
    Upstream(#[from] EditError),
}

/// A finished edit: remote URLs plus files written under the images directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditResult {
    pub urls: Vec<String>,
    pub files: Vec<PathBuf>,
}

impl EditResult {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.files.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct EditRequest {
    pub message: IncomingMessage,
    pub prompt: String,
}

impl EditRequest {
    pub fn new(message: IncomingMessage, prompt: impl Into<String>) -> Self {
        Self {
            message,
            prompt: prompt.into(),
        }
    }
}

/// Outcome of [`EditService::submit_edit`]. The user has already been told
/// either way.
#[derive(Debug)]
pub enum Submission {
    Rejected(String),
    Accepted {
        task_id: String,
        handle: JoinHandle<()>,
    },
}

type PendingMap = Arc<Mutex<HashMap<String, String>>>;

/// Holds a user's busy slot; dropping it frees the slot if the token still
/// matches, including when the task unwinds.
struct PendingSlot {
    pending: PendingMap,
    user_id: String,
    task_id: String,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if pending.get(&self.user_id) == Some(&self.task_id) {
            pending.remove(&self.user_id);
            info!(user_id = %self.user_id, task_id = %self.task_id, "Image edit task finished");
        }
    }
}

pub struct EditService {
    config: Arc<Config>,
    gate: AccessGate,
    resolver: ImageResolver,
    editor: Arc<dyn ImageEditor>,
    materializer: Materializer,
    pending: PendingMap,
}

impl EditService {
    pub fn new(config: Arc<Config>, editor: Arc<dyn ImageEditor>) -> Result<Self> {
        let gate = AccessGate::new(AccessPolicy::from_config(&config.access));
        let materializer =
            Materializer::new(config.images_dir(), config.output.save_image_enabled);
        Ok(Self {
            gate,
            resolver: ImageResolver::new()?,
            editor,
            materializer,
            pending: Arc::new(Mutex::new(HashMap::new())),
            config,
        })
    }

    /// Service backed by the HTTP edit client described in `config.api`.
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        let client = ImageEditClient::new(EditApiSettings::from_config(&config)?)?;
        Self::new(config, Arc::new(client))
    }

    /// Routes delivered files through `relay` when `[relay]` names a target.
    pub fn with_relay(mut self, relay: Arc<dyn FileRelay>) -> Self {
        if let Some((host, port)) = self.config.relay.target() {
            self.materializer = Materializer::new(
                self.config.images_dir(),
                self.config.output.save_image_enabled,
            )
            .with_relay(&host, port, relay);
        }
        self
    }

    pub fn is_busy(&self, user_id: &str) -> bool {
        lock_pending(&self.pending).contains_key(user_id)
    }

    /// Handles an edit command. Checks run in the caller's task; the edit
    /// itself runs on a spawned task that reports back through `sink`.
    pub async fn submit_edit(
        self: &Arc<Self>,
        request: EditRequest,
        query: Option<Arc<dyn MessageQuery>>,
        sink: Arc<dyn ReplySink>,
    ) -> Result<Submission> {
        let EditRequest { message, prompt } = request;
        let user_id = message.sender_id.clone();

        if let Some(denial) = self.gate.check(message.group_id.as_deref()).await {
            return reject(sink.as_ref(), denial.to_string()).await;
        }

        if self.is_busy(&user_id) {
            return reject(sink.as_ref(), BUSY_MESSAGE.to_string()).await;
        }

        let images = match self.resolver.resolve(&message, query.as_deref()).await {
            Ok(images) if images.is_empty() => {
                return reject(sink.as_ref(), NO_IMAGE_MESSAGE.to_string()).await
            }
            Ok(images) => images,
            Err(err) => return reject(sink.as_ref(), format!("❌ {}", err)).await,
        };

        // Image lookup may have raced another request from the same user.
        let task_id = new_task_id();
        let registered = {
            let mut pending = lock_pending(&self.pending);
            if pending.contains_key(&user_id) {
                false
            } else {
                pending.insert(user_id.clone(), task_id.clone());
                true
            }
        };
        if !registered {
            return reject(sink.as_ref(), BUSY_MESSAGE.to_string()).await;
        }
        let slot = PendingSlot {
            pending: self.pending.clone(),
            user_id: user_id.clone(),
            task_id: task_id.clone(),
        };

        if self.config.output.status_message_mode != StatusMessageMode::Silent {
            let ack = format!(
                "🖼️ Editing your image, please wait...\n🆔 Task ID: {}\n📝 If a timeout is reported but the image arrives later, delivery succeeded.",
                task_id
            );
            if let Err(err) = sink.send_text(&ack).await {
                warn!(user_id = %user_id, error = %err, "Failed to send edit acknowledgement");
            }
        }

        info!(
            user_id = %user_id,
            task_id = %task_id,
            editor = self.editor.name(),
            images = images.len(),
            "Starting image edit task"
        );

        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _slot = slot;
            // The edit runs on its own task so a panic still reaches the user.
            let worker = {
                let sink = Arc::clone(&sink);
                tokio::spawn(async move { service.run_task(&prompt, images, sink.as_ref()).await })
            };
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(anyhow!("edit task aborted: {}", join_err)),
            };
            if let Err(err) = outcome {
                error!(user_id = %user_id, error = %err, "Image edit task failed");
                let notice = format!("❌ Image editing hit a problem: {}", err);
                if let Err(send_err) = sink.send_text(&notice).await {
                    warn!(user_id = %user_id, error = %send_err, "Failed to report edit failure");
                }
            }
        });

        Ok(Submission::Accepted { task_id, handle })
    }

    async fn run_task(&self, prompt: &str, images: Vec<String>, sink: &dyn ReplySink) -> Result<()> {
        let result = match self.generate(prompt, &images).await {
            Ok(result) => result,
            Err(failure) => {
                sink.send_text(&format!("❌ {}", failure)).await?;
                return Ok(());
            }
        };

        if result.is_empty() {
            sink.send_text("❌ Image editing failed, please try again later")
                .await?;
            return Ok(());
        }

        let delivered = self.deliver(&result, sink).await;
        for file in &result.files {
            self.materializer.cleanup(file).await;
        }
        delivered
    }

    /// Edits the first image and writes inline results to disk.
    pub async fn generate(&self, prompt: &str, images: &[String]) -> Result<EditResult, EditFailure> {
        if !self.config.core.enabled {
            return Err(EditFailure::Disabled);
        }
        let source = images.first().ok_or(EditFailure::NoImage)?;
        let edited = self.editor.edit(prompt, source).await?;
        let files = self.materializer.materialize(&edited.data_uris).await;
        Ok(EditResult {
            urls: edited.urls,
            files,
        })
    }

    async fn deliver(&self, result: &EditResult, sink: &dyn ReplySink) -> Result<()> {
        let verbose = self.config.output.status_message_mode == StatusMessageMode::Verbose;
        if verbose {
            sink.send_text("🖼️ Sending the edited images, please wait...")
                .await?;
        }

        let (urls, files) = cap_deliverables(
            &result.urls,
            &result.files,
            self.config.output.max_images_per_response,
        );
        let mut outgoing: Vec<OutgoingImage> =
            urls.into_iter().map(OutgoingImage::Url).collect();
        for file in &files {
            outgoing.push(OutgoingImage::File(
                self.materializer.prepare_for_delivery(file).await,
            ));
        }
        if outgoing.is_empty() {
            return Ok(());
        }

        let limit = Duration::from_secs(self.config.output.delivery_timeout_secs);
        match tokio::time::timeout(limit, sink.send_images(&outgoing)).await {
            Ok(sent) => {
                sent?;
                if verbose {
                    sink.send_text("✅ Images sent!").await?;
                }
            }
            Err(_) => {
                warn!(
                    images = outgoing.len(),
                    timeout_secs = limit.as_secs(),
                    "Image delivery timed out, transfer may still complete"
                );
                if verbose {
                    sink.send_text(
                        "⚠️ Sending the images timed out, but they may still be on the way.\nIf they arrive later, delivery succeeded.",
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Admin status report for `user_id`.
    pub async fn status_for(&self, user_id: &str) -> String {
        if !self.config.access.is_admin(user_id) {
            return ADMIN_ONLY_MESSAGE.to_string();
        }
        self.status_report().await
    }

    /// Configuration summary plus a live connectivity check.
    pub async fn status_report(&self) -> String {
        let config = &self.config;
        let mut lines = vec![
            "🔍 Retouch image editing status".to_string(),
            "=".repeat(30),
            String::new(),
        ];
        lines.push(if config.api.api_key.trim().is_empty() {
            "❌ API key is not configured".to_string()
        } else {
            "✅ API key is configured".to_string()
        });
        lines.push(format!(
            "📡 API endpoint: {}",
            config
                .api_endpoint()
                .unwrap_or_else(|_| config.api.server_url.clone())
        ));
        lines.push(format!("🤖 Model: {}", config.api.model_id));
        lines.push(format!("⏱️ Timeout: {} seconds", config.api.timeout_secs));
        lines.push(format!("🔄 Max retries: {}", config.api.max_retry_attempts));
        lines.push(format!(
            "📁 Image directory: {}",
            self.materializer.images_dir().display()
        ));
        lines.push(format!(
            "🖼️ Max images per response: {}",
            config.output.max_images_per_response
        ));
        lines.push(if config.core.enabled {
            "✅ Image editing is enabled".to_string()
        } else {
            "❌ Image editing is disabled".to_string()
        });
        lines.push(match self.editor.health_check().await {
            Ok(true) => "🌐 API connectivity: ok".to_string(),
            Ok(false) => "🌐 API connectivity: unreachable".to_string(),
            Err(err) => format!("🌐 API connectivity: error ({})", err),
        });
        lines.join("\n")
    }

    pub fn help_text() -> String {
        format!(
            "🖼️ Retouch image editing help\n\n\
             Usage:\n\
             1. Send an image\n\
             2. Quote it and send: {edit} <prompt>\n\n\
             Examples:\n\
             • {edit} give the character sunglasses\n\
             • {edit} make it cyberpunk style\n\
             • {edit} replace the background with snowy mountains\n\n\
             Admin commands:\n\
             • {status} - check the API connection\n\
             • {help} - show this help\n\n\
             Note: editing takes a while, please be patient",
            edit = EDIT_COMMAND,
            status = STATUS_COMMAND,
            help = HELP_COMMAND,
        )
    }

    pub async fn shutdown(&self) {
        self.gate.clear().await;
        info!("Retouch edit service stopped");
    }
}

/// Caps the total at `max`, remote URLs first.
pub fn cap_deliverables(
    urls: &[String],
    files: &[PathBuf],
    max: usize,
) -> (Vec<String>, Vec<PathBuf>) {
    let urls: Vec<String> = urls.iter().take(max).cloned().collect();
    let remaining = max.saturating_sub(urls.len());
    let files = files.iter().take(remaining).cloned().collect();
    (urls, files)
}

async fn reject(sink: &dyn ReplySink, reason: String) -> Result<Submission> {
    sink.send_text(&reason)
        .await
        .map_err(|e| anyhow!("failed to send rejection: {}", e))?;
    Ok(Submission::Rejected(reason))
}

fn lock_pending(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
