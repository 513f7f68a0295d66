//! HTTP client for the question-answering backend.

use std::path::Path;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use reqwest::{header, multipart, Client, Response};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::decode::is_blank;
use crate::error::{ExchangeError, ExchangeResult};

/// Shown when a buffered reply carries no `response` text.
pub const NO_RESPONSE: &str = "No response received";

/// Body chunks in arrival order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = ExchangeResult<Bytes>> + Send>>;

/// How the backend chose to deliver the answer.
pub enum AnswerBody {
    /// Plain-text body, read chunk by chunk.
    Streamed(ChunkStream),
    /// A complete JSON document, e.g. `{"response": "..."}`.
    Buffered(String),
}

impl std::fmt::Debug for AnswerBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnswerBody::Streamed(_) => f.write_str("Streamed(..)"),
            AnswerBody::Buffered(body) => f.debug_tuple("Buffered").field(body).finish(),
        }
    }
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(default)]
    has_content: bool,
}

#[derive(Deserialize, Default)]
struct UploadResponse {
    message: Option<String>,
}

/// What the backend said about an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub file_name: String,
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct AskClient {
    client: Client,
    base_url: String,
    accept_plain_text: bool,
}

impl AskClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            accept_plain_text: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.api_url()).with_accept_plain_text(config.accept_plain_text())
    }

    /// Whether to send `Accept: text/plain` with questions.
    pub fn with_accept_plain_text(mut self, accept_plain_text: bool) -> Self {
        self.accept_plain_text = accept_plain_text;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a question. The form carries one field, `question`.
    #[instrument(skip(self, question), fields(len = question.len()))]
    pub async fn ask(&self, question: &str) -> ExchangeResult<AnswerBody> {
        let url = format!("{}/api/ask", self.base_url);
        let form = multipart::Form::new().text("question", question.to_string());

        let mut request = self.client.post(&url).multipart(form);
        if self.accept_plain_text {
            request = request.header(header::ACCEPT, "text/plain");
        }

        let response = check_status(request.send().await?).await?;

        if is_json(&response) {
            debug!("backend replied with a buffered JSON body");
            let body = response.text().await?;
            Ok(AnswerBody::Buffered(body))
        } else {
            debug!("backend replied with a streamed body");
            let stream = response.bytes_stream().map_err(ExchangeError::from);
            Ok(AnswerBody::Streamed(Box::pin(stream)))
        }
    }

    /// Whether the backend already holds document content.
    pub async fn status(&self) -> ExchangeResult<bool> {
        let url = format!("{}/api/status", self.base_url);

        let response = check_status(self.client.get(&url).send().await?).await?;
        let body = response.text().await?;
        let status: StatusResponse = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::InvalidBody(format!("Invalid status response: {}", e)))?;
        Ok(status.has_content)
    }

    /// Upload a document for the backend to index.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn upload_document(&self, path: &Path) -> ExchangeResult<UploadReceipt> {
        let url = format!("{}/api/upload", self.base_url);

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ExchangeError::Transport(format!("Could not read {}: {}", path.display(), e)))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());

        let part = multipart::Part::bytes(data)
            .file_name(file_name.clone())
            .mime_str(mime_for(path))?;
        let form = multipart::Form::new().part("file", part);

        let response = check_status(self.client.post(&url).multipart(form).send().await?).await?;
        let body = response.text().await?;
        let reply: UploadResponse = serde_json::from_str(&body).unwrap_or_default();

        info!(file = %file_name, "document uploaded");
        Ok(UploadReceipt {
            file_name,
            message: reply.message,
        })
    }
}

/// Answer text from a buffered JSON body.
pub fn buffered_answer(body: &str) -> ExchangeResult<String> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| ExchangeError::InvalidBody(format!("Invalid JSON response: {}", e)))?;

    match value.get("error") {
        Some(serde_json::Value::String(message)) if !message.is_empty() => {
            return Err(ExchangeError::InBand(message.clone()));
        }
        Some(other) if !is_blank(other) => return Err(ExchangeError::InBand(other.to_string())),
        _ => {}
    }

    let answer = match value.get("response") {
        Some(serde_json::Value::String(text)) if !text.is_empty() => text.clone(),
        Some(other) if !is_blank(other) => other.to_string(),
        _ => NO_RESPONSE.to_string(),
    };
    Ok(answer)
}

async fn check_status(response: Response) -> ExchangeResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ExchangeError::from_status_body(status.as_u16(), &body))
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false)
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        _ => "text/plain",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_answer_response_field() {
        assert_eq!(buffered_answer(r#"{"response":"42"}"#).unwrap(), "42");
    }

    #[test]
    fn test_buffered_answer_missing_field() {
        assert_eq!(buffered_answer(r#"{"other":"x"}"#).unwrap(), NO_RESPONSE);
        assert_eq!(buffered_answer(r#"{"response":""}"#).unwrap(), NO_RESPONSE);
    }

    #[test]
    fn test_buffered_answer_scalar_response() {
        assert_eq!(buffered_answer(r#"{"response":42}"#).unwrap(), "42");
        assert_eq!(buffered_answer(r#"{"response":true}"#).unwrap(), "true");
        assert_eq!(buffered_answer(r#"{"response":0}"#).unwrap(), NO_RESPONSE);
        assert_eq!(buffered_answer(r#"{"response":null}"#).unwrap(), NO_RESPONSE);
    }

    #[test]
    fn test_buffered_answer_error_field() {
        let err = buffered_answer(r#"{"error":"no documents"}"#).unwrap_err();
        assert_eq!(err, ExchangeError::InBand("no documents".into()));
    }

    #[test]
    fn test_buffered_answer_invalid_json() {
        let err = buffered_answer("not json").unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidBody(_)));
    }

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for(Path::new("report.PDF")), "application/pdf");
        assert_eq!(mime_for(Path::new("notes.txt")), "text/plain");
        assert_eq!(mime_for(Path::new("README")), "text/plain");
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        assert_eq!(AskClient::new("http://localhost:7860/").base_url(), "http://localhost:7860");
    }
}
