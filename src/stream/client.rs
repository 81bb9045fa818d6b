//! Streaming text client
//!
//! Sends one query per request and forwards the reply's text fragments as
//! they arrive. Each request ends in exactly one terminal event, `Complete`
//! or `Failed`, unless it is cancelled first, in which case nothing more is
//! reported.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::json;

use super::record::{LineBuffer, text_fragment};
use crate::config::StreamConfig;
use crate::{Error, Result};

/// Identifies one request; increases monotonically per client
pub type RequestId = u64;

/// What a request reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A reply fragment, in arrival order
    Text(String),
    /// The body ended normally
    Complete,
    /// The request or body read failed
    Failed(String),
}

/// Receives events tagged with the request they belong to
pub type StreamSink = Arc<dyn Fn(RequestId, StreamEvent) + Send + Sync>;

/// Handle to an in-flight request
#[derive(Debug)]
pub struct StreamHandle {
    id: RequestId,
    cancelled: Arc<AtomicBool>,
    task: Option<tokio::task::AbortHandle>,
}

impl StreamHandle {
    /// Create a handle for a request driven elsewhere
    #[must_use]
    pub fn new(id: RequestId, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            id,
            cancelled,
            task: None,
        }
    }

    /// The request id its events are tagged with
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Stop reading the body; no further events are reported
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            tracing::debug!(request = self.id, "stream cancelled");
        }
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// Whether [`cancel`](Self::cancel) was called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Opens streaming queries
pub trait TextStreamer: Send + Sync {
    /// Start a request for `query`, reporting to `sink`
    ///
    /// Must be called from within a tokio runtime.
    fn open(&self, query: &str, sink: StreamSink) -> StreamHandle;
}

/// Request body for the chat endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    model: String,
    prompt: String,
    plugin: String,
    display_prompt: String,
    display_prompt_type: u8,
    options: serde_json::Value,
    multimedia: Vec<serde_json::Value>,
    agent_id: String,
    support_hint: u8,
    ext_report_params: Option<serde_json::Value>,
    is_atom_input: bool,
    version: &'static str,
    chat_model_id: String,
    chat_model_ext_info: String,
    application_id_list: Vec<String>,
    support_functions: Vec<&'static str>,
}

impl ChatRequest {
    /// Build the body for `prompt`
    #[must_use]
    pub fn new(config: &RequestSettings, prompt: &str) -> Self {
        let ext_info = json!({
            "modelId": config.chat_model_id,
            "subModelId": "",
            "supportFunctions": { "internetSearch": "closeInternetSearch" },
        });

        Self {
            model: config.model.clone(),
            prompt: prompt.to_string(),
            plugin: config.plugin.clone(),
            display_prompt: prompt.to_string(),
            display_prompt_type: 1,
            options: json!({
                "imageIntention": {
                    "needIntentionModel": true,
                    "backendUpdateFlag": 2,
                    "intentionStatus": true,
                }
            }),
            multimedia: Vec::new(),
            agent_id: config.agent_id.clone(),
            support_hint: 1,
            ext_report_params: None,
            is_atom_input: false,
            version: "v2",
            chat_model_id: config.chat_model_id.clone(),
            chat_model_ext_info: ext_info.to_string(),
            application_id_list: Vec::new(),
            support_functions: vec!["closeInternetSearch"],
        }
    }
}

/// Fields copied into every request
#[derive(Debug, Clone)]
pub struct RequestSettings {
    pub model: String,
    pub chat_model_id: String,
    pub agent_id: String,
    pub plugin: String,
}

impl From<&StreamConfig> for RequestSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            model: config.model.clone(),
            chat_model_id: config.chat_model_id.clone(),
            agent_id: config.agent_id.clone(),
            plugin: config.plugin.clone(),
        }
    }
}

struct Inner {
    client: reqwest::Client,
    url: String,
    cookie: Option<SecretString>,
    settings: RequestSettings,
}

impl Inner {
    async fn send(&self, prompt: &str) -> Result<reqwest::Response> {
        let body = ChatRequest::new(&self.settings, prompt);

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(cookie) = &self.cookie {
            request = request.header(reqwest::header::COOKIE, cookie.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = %status, "stream request rejected");
            return Err(Error::Stream(format!("HTTP error: {}", status.as_u16())));
        }
        Ok(response)
    }

    /// Send `prompt` and feed each text fragment to `on_text`
    async fn stream<F>(&self, prompt: &str, mut on_text: F) -> Result<()>
    where
        F: FnMut(String),
    {
        let response = self.send(prompt).await?;
        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for line in lines.push(&chunk) {
                if let Some(text) = text_fragment(&line) {
                    on_text(text);
                }
            }
        }

        if let Some(text) = lines.finish().as_deref().and_then(text_fragment) {
            on_text(text);
        }
        Ok(())
    }
}

/// HTTP client for the streaming chat endpoint
#[derive(Clone)]
pub struct StreamingTextClient {
    inner: Arc<Inner>,
    next_id: Arc<AtomicU64>,
}

impl StreamingTextClient {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()?;

        let cookie = config
            .cookie
            .as_ref()
            .map(|c| SecretString::from(c.expose_secret().to_string()));

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                url: config.url.clone(),
                cookie,
                settings: RequestSettings::from(config),
            }),
            next_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Run one query to completion, calling `on_text` for each fragment
    ///
    /// Returns the full reply.
    ///
    /// # Errors
    ///
    /// Returns error if the request or body read fails
    pub async fn query<F>(&self, prompt: &str, mut on_text: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        let mut reply = String::new();
        self.inner
            .stream(prompt, |text| {
                on_text(&text);
                reply.push_str(&text);
            })
            .await?;
        Ok(reply)
    }
}

impl TextStreamer for StreamingTextClient {
    fn open(&self, query: &str, sink: StreamSink) -> StreamHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancelled = Arc::new(AtomicBool::new(false));

        let inner = Arc::clone(&self.inner);
        let flag = Arc::clone(&cancelled);
        let query = query.to_string();

        tracing::debug!(request = id, query = %query, "opening stream");

        let task = tokio::spawn(async move {
            let emit = |event: StreamEvent| {
                if !flag.load(Ordering::SeqCst) {
                    sink(id, event);
                }
            };

            match inner.stream(&query, |text| emit(StreamEvent::Text(text))).await {
                Ok(()) => emit(StreamEvent::Complete),
                Err(e) => {
                    tracing::warn!(request = id, error = %e, "stream failed");
                    emit(StreamEvent::Failed(failure_message(&e)));
                }
            }
        });

        StreamHandle {
            id,
            cancelled,
            task: Some(task.abort_handle()),
        }
    }
}

fn failure_message(error: &Error) -> String {
    match error {
        Error::Stream(message) => message.clone(),
        Error::Http(e) if e.is_timeout() => format!("Network timeout: {e}"),
        Error::Http(e) => format!("Network error: {e}"),
        other => other.to_string(),
    }
}
