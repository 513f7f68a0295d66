use std::path::PathBuf;

use docchat_core::{AskClient, ChatRole, ChatSession, ExchangeError, ExchangeEvent, UploadReceipt};
use ratatui::layout::Rect;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::tui::AppEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Upload,
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Uploading(PathBuf),
    Failed(String),
}

/// Single-line text input with a character (not byte) cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextInput {
    pub value: String,
    pub cursor: usize,
}

/// Convert a character index to a byte index for UTF-8 safe string operations
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

impl TextInput {
    pub fn insert(&mut self, c: char) {
        let byte_pos = char_to_byte_index(&self.value, self.cursor);
        self.value.insert(byte_pos, c);
        self.cursor += 1;
    }

    pub fn backspace(&mut self) {
        if self.cursor > 0 {
            self.cursor -= 1;
            let byte_pos = char_to_byte_index(&self.value, self.cursor);
            self.value.remove(byte_pos);
        }
    }

    pub fn delete(&mut self) {
        if self.cursor < self.len() {
            let byte_pos = char_to_byte_index(&self.value, self.cursor);
            self.value.remove(byte_pos);
        }
    }

    pub fn left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn right(&mut self) {
        self.cursor = (self.cursor + 1).min(self.len());
    }

    pub fn home(&mut self) {
        self.cursor = 0;
    }

    pub fn end(&mut self) {
        self.cursor = self.len();
    }

    pub fn clear(&mut self) {
        self.value.clear();
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.value.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub screen: Screen,
    pub input_mode: InputMode,

    // Upload state
    pub path_input: TextInput,
    pub upload_state: UploadState,
    pub document: Option<String>,

    // Chat state
    pub question: TextInput,
    pub session: ChatSession,
    pub chat_scroll: u16,
    pub chat_height: u16, // Inner height of the chat area for scroll calculations
    pub chat_width: u16,  // Inner width of the chat area for wrap calculations
    pub follow_output: bool,
    pub animation_frame: u8,

    // Layout areas for mouse hit-testing
    pub chat_area: Option<Rect>,

    client: AskClient,
    events: UnboundedSender<AppEvent>,
}

impl App {
    pub fn new(client: AskClient, events: UnboundedSender<AppEvent>) -> Self {
        Self {
            should_quit: false,
            screen: Screen::Upload,
            input_mode: InputMode::Editing,

            path_input: TextInput::default(),
            upload_state: UploadState::Idle,
            document: None,

            question: TextInput::default(),
            session: ChatSession::new(),
            chat_scroll: 0,
            chat_height: 0,
            chat_width: 0,
            follow_output: true,
            animation_frame: 0,

            chat_area: None,

            client,
            events,
        }
    }

    pub fn backend_url(&self) -> &str {
        self.client.base_url()
    }

    pub fn is_streaming(&self) -> bool {
        self.session.is_streaming()
    }

    /// Ask the backend whether a document is already loaded.
    pub fn check_backend_status(&self) {
        let client = self.client.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            match client.status().await {
                Ok(has_content) => {
                    let _ = events.send(AppEvent::BackendStatus(has_content));
                }
                Err(e) => warn!(error = %e, "backend status check failed"),
            }
        });
    }

    pub fn on_backend_status(&mut self, has_content: bool) {
        if has_content && self.screen == Screen::Upload && self.upload_state == UploadState::Idle {
            info!("backend already has a document, opening chat");
            self.open_chat();
        }
    }

    pub fn start_upload(&mut self) {
        if matches!(self.upload_state, UploadState::Uploading(_)) {
            return;
        }
        let raw = self.path_input.value.trim();
        if raw.is_empty() {
            return;
        }
        let path = expand_home(raw);
        self.upload_state = UploadState::Uploading(path.clone());

        let client = self.client.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = client.upload_document(&path).await;
            let _ = events.send(AppEvent::Upload(result));
        });
    }

    pub fn on_upload_finished(&mut self, result: Result<UploadReceipt, ExchangeError>) {
        match result {
            Ok(receipt) => {
                self.document = Some(receipt.file_name);
                self.upload_state = UploadState::Idle;
                self.path_input.clear();
                self.open_chat();
            }
            Err(e) => {
                warn!(error = %e, "upload failed");
                self.upload_state = UploadState::Failed(e.to_string());
            }
        }
    }

    fn open_chat(&mut self) {
        self.screen = Screen::Chat;
        self.input_mode = InputMode::Editing;
    }

    /// Back to the upload screen with a fresh conversation.
    /// Refused while an answer is still streaming.
    pub fn new_document(&mut self) -> bool {
        if self.is_streaming() {
            return false;
        }
        self.screen = Screen::Upload;
        self.input_mode = InputMode::Editing;
        self.session = ChatSession::new();
        self.question.clear();
        self.chat_scroll = 0;
        self.follow_output = true;
        self.upload_state = UploadState::Idle;
        true
    }

    /// Send the current question. The input is left in place until the
    /// exchange settles.
    pub fn submit_question(&mut self) -> bool {
        let Some(submission) = self.session.submit(&self.question.value) else {
            return false;
        };

        self.follow_output = true;
        self.scroll_to_bottom();

        let client = self.client.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            docchat_core::run_exchange(&client, submission, move |event| {
                let _ = events.send(AppEvent::Exchange(event));
            })
            .await;
        });
        true
    }

    pub fn on_exchange_event(&mut self, event: ExchangeEvent) {
        let settles = matches!(event, ExchangeEvent::Settled { .. });
        self.session.apply(event);

        if settles && !self.session.is_streaming() {
            self.question.clear();
        }
        if self.follow_output {
            self.scroll_to_bottom();
        }
    }

    /// True between submission and the first piece of the answer.
    pub fn awaiting_answer(&self) -> bool {
        self.is_streaming()
            && self
                .session
                .transcript()
                .messages()
                .last()
                .map(|m| m.role == ChatRole::User)
                .unwrap_or(false)
    }

    /// Tick animation frame (called by Tick event)
    pub fn tick_animation(&mut self) {
        if self.awaiting_answer() {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    pub fn scroll_up(&mut self, lines: u16) {
        self.chat_scroll = self.chat_scroll.saturating_sub(lines);
        self.follow_output = false;
    }

    pub fn scroll_down(&mut self, lines: u16) {
        let max = self.max_scroll();
        self.chat_scroll = self.chat_scroll.saturating_add(lines).min(max);
        self.follow_output = self.chat_scroll >= max;
    }

    pub fn scroll_to_top(&mut self) {
        self.chat_scroll = 0;
        self.follow_output = false;
    }

    /// Scroll chat to bottom so the newest text is visible
    pub fn scroll_to_bottom(&mut self) {
        self.chat_scroll = self.max_scroll();
        self.follow_output = true;
    }

    fn max_scroll(&self) -> u16 {
        let visible_height = if self.chat_height > 0 {
            self.chat_height
        } else {
            20
        };
        self.chat_lines().saturating_sub(visible_height)
    }

    /// Rendered line count of the conversation at the current width.
    fn chat_lines(&self) -> u16 {
        // Use actual chat width for wrap calculation, default to 50 if not set
        let wrap_width = if self.chat_width > 0 {
            self.chat_width as usize
        } else {
            50
        };

        let mut total_lines: usize = 0;
        for msg in self.session.transcript().messages() {
            total_lines += 1; // Role line ("You:" or "AI:")
            total_lines += wrapped_lines(&msg.content, wrap_width);
            total_lines += 1; // Blank line after message
        }
        if self.awaiting_answer() {
            total_lines += 2; // "AI:" + "Thinking..."
        }

        total_lines.min(u16::MAX as usize) as u16
    }
}

fn wrapped_lines(text: &str, width: usize) -> usize {
    text.lines()
        .map(|line| {
            // Use character count, not byte length, for proper UTF-8 handling
            let char_count = line.chars().count();
            if char_count == 0 {
                1
            } else {
                char_count.div_ceil(width)
            }
        })
        .sum::<usize>()
        .max(1)
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    }
}
