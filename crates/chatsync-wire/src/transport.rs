//! Transports that open the chat event stream

use std::path::PathBuf;
use std::pin::Pin;

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_stream::Stream;

use crate::error::{Error, Result};

/// Raw byte chunks as they come off the wire
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Body of the chat request that starts a turn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Existing conversation, or `None` to start a new one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl ChatRequest {
    /// Create a request for a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Target an existing conversation
    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Something that can open the event stream for a chat request
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Issue the request and return the response body as a byte stream
    async fn open(&self, request: &ChatRequest) -> Result<ByteStream>;
}

/// HTTP transport against the chat backend
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    /// Create a transport posting to `{base_url}{chat_path}`
    pub fn new(base_url: &str, chat_path: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}{}", base_url.trim_end_matches('/'), chat_path),
        }
    }

    /// Reuse an existing client
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, request: &ChatRequest) -> Result<ByteStream> {
        tracing::debug!("Opening chat stream: {}", self.url);

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| status.to_string());
            return Err(Error::api(status.as_u16(), message));
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Transport(e.to_string())));
        Ok(Box::pin(body))
    }
}

/// Replays a recorded event-stream transcript from disk.
///
/// The file is read in fixed-size chunks so record boundaries land at
/// arbitrary offsets, the same way they do on a live connection.
pub struct ReplayTransport {
    path: PathBuf,
    chunk_size: usize,
}

impl ReplayTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            chunk_size: 512,
        }
    }

    /// Set the read size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

#[async_trait]
impl ChatTransport for ReplayTransport {
    async fn open(&self, _request: &ChatRequest) -> Result<ByteStream> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let chunk_size = self.chunk_size;

        Ok(Box::pin(stream! {
            let mut buf = vec![0u8; chunk_size];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => yield Ok(Bytes::copy_from_slice(&buf[..n])),
                    Err(e) => {
                        yield Err(Error::Io(e));
                        break;
                    }
                }
            }
        }))
    }
}
