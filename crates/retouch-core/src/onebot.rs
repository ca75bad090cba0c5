//! OneBot v11 HTTP API client used to look up quoted messages.

use crate::platform::MessageQuery;
use anyhow::{anyhow, Result};
use reqwest::Client;
use retouch_config::OneBotConfig;
use std::time::Duration;

pub struct OneBotHttpApi {
    client: Client,
    api_url: String,
    access_token: Option<String>,
}

impl OneBotHttpApi {
    pub fn new(config: &OneBotConfig) -> Result<Self> {
        let api_url = config.api_url.trim().trim_end_matches('/').to_string();
        if api_url.is_empty() {
            return Err(anyhow!("OneBot api_url is empty"));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_url,
            access_token: config
                .access_token
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        })
    }

    pub fn action_url(&self, action: &str) -> String {
        format!("{}/{}", self.api_url, action.trim_start_matches('/'))
    }
}

#[async_trait::async_trait]
impl MessageQuery for OneBotHttpApi {
    async fn call_action(
        &self,
        action: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = self.action_url(action);
        let mut request = self.client.post(&url).json(&params);
        if let Some(token) = &self.access_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        let raw = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "OneBot action '{}' returned HTTP {}: {}",
                action,
                status.as_u16(),
                raw.chars().take(200).collect::<String>()
            ));
        }
        serde_json::from_str(&raw).map_err(|e| {
            anyhow!(
                "OneBot action '{}' decode failed: {} | body={}",
                action,
                e,
                raw.chars().take(200).collect::<String>()
            )
        })
    }
}
