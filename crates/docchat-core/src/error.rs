//! Error taxonomy for a single question/answer exchange.
//!
//! Every variant renders as the bare human-readable message. The conversation
//! state adds the `"Error: "` prefix when the failure is shown to the user.

use thiserror::Error;

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    /// The request never completed, or the body could not be read.
    #[error("{0}")]
    Transport(String),

    /// Non-success HTTP status. `message` comes from the JSON `error` field
    /// when the body carried one.
    #[error("{message}")]
    Status { status: u16, message: String },

    /// A `{"error": ...}` object arrived inside an otherwise successful stream.
    #[error("{0}")]
    InBand(String),

    /// A buffered JSON body that could not be parsed.
    #[error("{0}")]
    InvalidBody(String),
}

impl ExchangeError {
    /// Build the status error from a failed response body.
    pub fn from_status_body(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|value| {
                value
                    .get("error")
                    .and_then(|e| e.as_str())
                    .filter(|e| !e.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("HTTP error! status: {}", status));

        ExchangeError::Status { status, message }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            ExchangeError::Transport(format!("Failed to connect to backend: {}", err))
        } else {
            ExchangeError::Transport(format!("Network error: {}", err))
        }
    }
}
