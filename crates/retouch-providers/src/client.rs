use crate::{parser, truncate_chars, EditError, EditedImages, ImageEditor};
use reqwest::Client;
use retouch_config::Config;
use std::time::Duration;
use tokio::time::sleep;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LOG_BODY_CHARS: usize = 500;
const ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct EditApiSettings {
    pub server_url: String,
    pub endpoint: String,
    pub model_id: String,
    pub api_key: String,
    pub prompt_prefix: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub transport_retry_delay: Duration,
}

impl EditApiSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            server_url: config.api.server_url.clone(),
            endpoint: config.api_endpoint()?,
            model_id: config.api.model_id.clone(),
            api_key: config.api.api_key.clone(),
            prompt_prefix: config.api.prompt_prefix.clone(),
            timeout: Duration::from_secs(config.api.timeout_secs),
            max_attempts: config.api.max_retry_attempts.max(1),
            retry_delay: Duration::from_millis(config.api.retry_delay_ms),
            transport_retry_delay: Duration::from_millis(config.api.transport_retry_delay_ms),
        })
    }
}

/// Sends one image plus instruction to `/v1/chat/completions` and extracts
/// the edited images from the answer.
pub struct ImageEditClient {
    client: Client,
    settings: EditApiSettings,
}

impl ImageEditClient {
    pub fn new(settings: EditApiSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(settings.timeout)
            .build()?;
        Ok(Self { client, settings })
    }

    pub fn final_prompt(&self, prompt: &str) -> String {
        let prompt = prompt.trim();
        let prefix = self.settings.prompt_prefix.trim();
        match (prefix.is_empty(), prompt.is_empty()) {
            (true, _) => prompt.to_string(),
            (false, true) => prefix.to_string(),
            (false, false) => format!("{}\n{}", prefix, prompt),
        }
    }

    pub fn request_body(&self, prompt: &str, image_data_uri: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.settings.model_id,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        {"type": "text", "text": self.final_prompt(prompt)},
                        {"type": "image_url", "image_url": {"url": image_data_uri}}
                    ]
                }
            ]
        })
    }

    fn error_detail(raw_body: &str) -> String {
        let detail = match serde_json::from_str::<serde_json::Value>(raw_body) {
            Ok(parsed) => {
                let field = parsed.get("error").or_else(|| parsed.get("message"));
                match field {
                    Some(serde_json::Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                    None => parsed.to_string(),
                }
            }
            Err(_) => raw_body.to_string(),
        };
        truncate_chars(&detail, ERROR_BODY_CHARS)
    }

    async fn send_once(&self, body: &serde_json::Value) -> Result<(u16, String), reqwest::Error> {
        let response = self
            .client
            .post(&self.settings.endpoint)
            .header("Authorization", format!("Bearer {}", self.settings.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let raw_body = response.text().await?;
        Ok((status, raw_body))
    }

    fn classify_transport(&self, err: &reqwest::Error) -> EditError {
        if err.is_timeout() {
            EditError::Timeout {
                secs: self.settings.timeout.as_secs(),
            }
        } else {
            EditError::Transport(err.to_string())
        }
    }
}

#[async_trait::async_trait]
impl ImageEditor for ImageEditClient {
    fn name(&self) -> &str {
        &self.settings.model_id
    }

    async fn edit(&self, prompt: &str, image_data_uri: &str) -> Result<EditedImages, EditError> {
        if self.settings.api_key.trim().is_empty() {
            return Err(EditError::MissingApiKey);
        }

        let body = self.request_body(prompt, image_data_uri);
        let max_attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let last_attempt = attempt == max_attempts;
            tracing::info!(
                attempt = attempt,
                max_attempts = max_attempts,
                "Calling image edit API"
            );
            tracing::debug!(
                endpoint = %self.settings.endpoint,
                model = %self.settings.model_id,
                "Image edit request target"
            );

            let (error, delay) = match self.send_once(&body).await {
                Ok((status, raw_body)) => {
                    tracing::info!(status = status, attempt = attempt, "Image edit API responded");
                    tracing::debug!(
                        body = %truncate_chars(&raw_body, LOG_BODY_CHARS),
                        "Image edit API response body"
                    );

                    if status == 200 {
                        let parsed: serde_json::Value =
                            serde_json::from_str(&raw_body).map_err(|e| EditError::Decode {
                                error: e.to_string(),
                                body: truncate_chars(&raw_body, ERROR_BODY_CHARS),
                            })?;
                        return parser::extract_images(&parsed);
                    }

                    let error = if status == 403 {
                        EditError::AccessDenied
                    } else {
                        EditError::Http {
                            status,
                            detail: Self::error_detail(&raw_body),
                        }
                    };
                    (error, self.settings.retry_delay)
                }
                Err(err) => (
                    self.classify_transport(&err),
                    self.settings.transport_retry_delay,
                ),
            };

            if last_attempt || !error.is_retryable() {
                return Err(error);
            }
            tracing::warn!(
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying image edit request"
            );
            sleep(delay).await;
        }

        Err(EditError::Exhausted)
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        let url = format!("{}/v1/models", self.settings.server_url.trim_end_matches('/'));
        match self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.settings.api_key))
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(err) => {
                tracing::debug!(url = %url, error = %err, "Health check request failed");
                Ok(false)
            }
        }
    }
}
