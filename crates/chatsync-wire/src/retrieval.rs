//! Client for the history and task retrieval endpoints

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::types::{HistoryMessage, TaskState};

/// Endpoint templates. `{id}` is replaced with the conversation id.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub chat_path: String,
    pub messages_path: String,
    pub tasks_path: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            chat_path: "/api/chat".to_string(),
            messages_path: "/api/chats/{id}/messages".to_string(),
            tasks_path: "/api/chats/{id}/tasks".to_string(),
        }
    }
}

/// Fetches authoritative conversation state outside the streaming path
pub struct RetrievalClient {
    client: reqwest::Client,
    base_url: String,
    endpoints: Endpoints,
}

impl RetrievalClient {
    pub fn new(base_url: impl Into<String>, endpoints: Endpoints) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            endpoints,
        }
    }

    fn url(&self, template: &str, conversation_id: &str) -> String {
        format!("{}{}", self.base_url, template.replace("{id}", conversation_id))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        tracing::debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| status.to_string());
            return Err(Error::api(status.as_u16(), message));
        }
        Ok(response.json::<T>().await?)
    }

    /// Full message history of a conversation
    pub async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<HistoryMessage>> {
        let url = self.url(&self.endpoints.messages_path, conversation_id);
        self.get_json(&url).await
    }

    /// Authoritative task tree of a conversation
    pub async fn fetch_task_state(&self, conversation_id: &str) -> Result<TaskState> {
        let url = self.url(&self.endpoints.tasks_path, conversation_id);
        self.get_json(&url).await
    }
}
