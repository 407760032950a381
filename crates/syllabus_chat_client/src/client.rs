//! HTTP client for the chatbot's `ask_stream` endpoint: one GET per question,
//! body read incrementally and framed into [`StreamEvent`]s.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Url;

use crate::config::Config;
use crate::frame::{Frame, FrameParser};
use crate::messages::StreamEvent;

/// Whole-request timeout used when the config does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const ASK_STREAM_PATH: &str = "chatbot/ask_stream";

/// Failure of one streaming request. Any of these ends the turn.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid API base URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP error! status: {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
}

/// What a finished stream contained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub events: usize,
    pub diagnostics: usize,
    /// A `complete` event was received.
    pub completed: bool,
    /// Message of the last `error` event, if any.
    pub server_error: Option<String>,
}

impl StreamSummary {
    fn record(&mut self, frame: &Frame) {
        match frame {
            Frame::Event(event) => {
                self.events += 1;
                match event {
                    StreamEvent::Complete => self.completed = true,
                    StreamEvent::Error(message) => self.server_error = Some(message.clone()),
                    _ => {}
                }
            }
            Frame::Diagnostic(_) => self.diagnostics += 1,
        }
    }
}

/// Client for the question-answering API.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl Client {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SessionError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SessionError::Transport)?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, SessionError> {
        Self::new(config.api_base_url(), config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/chatbot/ask_stream?question=...[&email=...]`
    pub fn ask_stream_url(&self, question: &str, email: Option<&str>) -> Result<Url, SessionError> {
        let raw = format!("{}/{}", self.base_url.trim_end_matches('/'), ASK_STREAM_PATH);
        let mut url = Url::parse(&raw).map_err(|e| SessionError::InvalidUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("question", question);
            if let Some(email) = email {
                query.append_pair("email", email);
            }
        }
        Ok(url)
    }

    /// Ask one question and hand every frame to `on_frame`, in arrival order,
    /// until the server closes the body.
    ///
    /// The server sends `sources` after `complete`, so the body is drained to
    /// its end rather than abandoned at `complete`. Frames already handed out
    /// stay handed out if the transport fails part way.
    pub async fn ask_stream<F>(
        &self,
        question: &str,
        email: Option<&str>,
        mut on_frame: F,
    ) -> Result<StreamSummary, SessionError>
    where
        F: FnMut(Frame),
    {
        let url = self.ask_stream_url(question, email)?;
        tracing::info!(base_url = %self.base_url, "asking question");

        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!(status, "ask_stream rejected");
            return Err(SessionError::Status { status, message });
        }

        let mut body = response.bytes_stream();
        let mut parser = FrameParser::new();
        let mut summary = StreamSummary::default();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| self.classify(e))?;
            for frame in parser.push_bytes(&chunk) {
                summary.record(&frame);
                on_frame(frame);
            }
        }
        for frame in parser.finish() {
            summary.record(&frame);
            on_frame(frame);
        }

        tracing::info!(
            events = summary.events,
            diagnostics = summary.diagnostics,
            completed = summary.completed,
            "stream ended"
        );
        Ok(summary)
    }

    /// Ask one question and collect every decoded event.
    pub async fn ask(
        &self,
        question: &str,
        email: Option<&str>,
    ) -> Result<Vec<StreamEvent>, SessionError> {
        let mut events = Vec::new();
        self.ask_stream(question, email, |frame| {
            if let Frame::Event(event) = frame {
                events.push(event);
            }
        })
        .await?;
        Ok(events)
    }

    fn classify(&self, error: reqwest::Error) -> SessionError {
        if error.is_timeout() {
            tracing::error!(timeout = ?self.timeout, "ask_stream timed out");
            SessionError::Timeout(self.timeout)
        } else {
            tracing::error!(%error, "ask_stream transport failure");
            SessionError::Transport(error)
        }
    }
}
