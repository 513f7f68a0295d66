use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docchat_core::{AskClient, ChatSession, Config, ExchangeEvent, RunningAnswer, Update};
use tokio::sync::oneshot;

mod app;
mod handler;
mod logging;
mod tui;
mod ui;

use app::App;
use tui::EventHandler;

#[derive(Parser)]
#[command(name = "docchat")]
#[command(version, about = "Ask questions about an uploaded document")]
struct Cli {
    /// Backend base URL (overrides DOCCHAT_API_URL and the config file)
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (default)
    Chat,
    /// Ask one question and stream the answer to stdout
    Ask {
        /// Your question
        question: String,
    },
    /// Upload a document for the backend to index
    Upload {
        /// PDF or text file
        path: PathBuf,
    },
    /// Show whether the backend has a document loaded
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Ignoring config file: {:#}", e);
        Config::new()
    });
    let _log_guard = match logging::init_logging(&config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging disabled: {:#}", e);
            None
        }
    };

    let client = match &cli.api_url {
        Some(url) => AskClient::new(url).with_accept_plain_text(config.accept_plain_text()),
        None => AskClient::from_config(&config),
    };
    tracing::info!(backend = client.base_url(), "starting");

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => run_chat(client).await,
        Commands::Ask { question } => ask_once(&client, &question).await,
        Commands::Upload { path } => upload(&client, &path).await,
        Commands::Status => status(&client).await,
    }
}

async fn run_chat(client: AskClient) -> Result<()> {
    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = EventHandler::new();

    let mut app = App::new(client, events.sender());
    app.check_backend_status();

    let result = async {
        while !app.should_quit {
            terminal.draw(|frame| ui::render(&mut app, frame))?;
            match events.next().await {
                Some(event) => handler::handle_event(&mut app, event)?,
                None => break,
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    tui::restore()?;
    result
}

/// Single-response mode: one running answer, printed as it grows.
async fn ask_once(client: &AskClient, question: &str) -> Result<()> {
    let mut session: ChatSession<RunningAnswer> = ChatSession::new();
    let Some(submission) = session.submit(question) else {
        bail!("Question is empty");
    };

    let mut stdout = std::io::stdout();
    let mut printed = 0usize;
    let mut failure: Option<String> = None;
    let mut write_error: Option<std::io::Error> = None;
    let (broken_tx, broken_rx) = oneshot::channel::<()>();
    let mut broken_tx = Some(broken_tx);

    let exchange = docchat_core::run_exchange(client, submission, |event| {
        if let ExchangeEvent::Update { update: Update::Failed(message), .. } = &event {
            failure = Some(message.clone());
        }
        session.apply(event);
        if failure.is_some() || write_error.is_some() {
            return;
        }

        if let Err(e) = write_delta(&mut stdout, session.transcript().text(), &mut printed) {
            write_error = Some(e);
            if let Some(tx) = broken_tx.take() {
                let _ = tx.send(());
            }
        }
    });

    // Stop reading the answer once stdout is gone
    tokio::select! {
        _ = exchange => {}
        Ok(()) = broken_rx => {}
    }

    if let Some(e) = write_error {
        return Err(e).context("Failed to write the answer to stdout");
    }
    if printed > 0 {
        println!();
    }
    // anyhow prints the "Error: " prefix itself
    match failure {
        Some(message) => bail!("{}", message),
        None => Ok(()),
    }
}

/// Write the part of `text` past `printed`, then advance `printed`.
fn write_delta<W: Write>(out: &mut W, text: &str, printed: &mut usize) -> std::io::Result<()> {
    if let Some(new) = text.get(*printed..) {
        out.write_all(new.as_bytes())?;
        out.flush()?;
    }
    *printed = text.len();
    Ok(())
}

async fn upload(client: &AskClient, path: &std::path::Path) -> Result<()> {
    let receipt = client.upload_document(path).await?;
    match receipt.message {
        Some(message) => println!("Uploaded {}: {}", receipt.file_name, message),
        None => println!("Uploaded {}", receipt.file_name),
    }
    Ok(())
}

async fn status(client: &AskClient) -> Result<()> {
    if client.status().await? {
        println!("{}: a document is loaded", client.base_url());
    } else {
        println!("{}: no document loaded, upload one first", client.base_url());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_delta_prints_only_new_text() {
        let mut out = Vec::new();
        let mut printed = 0;
        write_delta(&mut out, "Hello", &mut printed).unwrap();
        write_delta(&mut out, "Hello, world", &mut printed).unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "Hello, world");
        assert_eq!(printed, 12);
    }

    #[test]
    fn test_write_delta_reports_closed_pipe() {
        let mut printed = 0;
        let err = write_delta(&mut ClosedPipe, "Hello", &mut printed).unwrap_err();

        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
        assert_eq!(printed, 0);
    }
}
