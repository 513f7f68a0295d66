pub mod client;
pub mod config;
pub mod decode;
pub mod error;
pub mod session;
pub mod state;

// Re-export main types for convenience
pub use client::{AnswerBody, AskClient, UploadReceipt};
pub use config::Config;
pub use error::{ExchangeError, ExchangeResult};
pub use session::{run_exchange, ChatSession, ExchangeEvent, Submission};
pub use state::{ChatMessage, ChatRole, Conversation, ExchangeId, RunningAnswer, Transcript, Update};
