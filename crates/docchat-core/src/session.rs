//! One question/answer exchange at a time, from submission to settlement.
//!
//! `ChatSession` owns the conversation and the streaming flag. The network
//! side (`run_exchange`) reports back through `ExchangeEvent`s, so it can run
//! inline or on a spawned task feeding a channel.

use std::future::Future;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::{debug, info_span, warn, Instrument};

use crate::client::{buffered_answer, AnswerBody, AskClient};
use crate::decode::StreamDecoder;
use crate::error::ExchangeResult;
use crate::state::{Conversation, ExchangeId, Transcript, Update};

/// An accepted question, ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub exchange: ExchangeId,
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    Update { exchange: ExchangeId, update: Update },
    /// The exchange is over, successfully or not.
    Settled { exchange: ExchangeId },
}

#[derive(Debug, Clone, Default)]
pub struct ChatSession<T: Transcript = Conversation> {
    transcript: T,
    streaming: bool,
    current: Option<ExchangeId>,
    next_id: u64,
}

impl<T: Transcript> ChatSession<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcript(&self) -> &T {
        &self.transcript
    }

    /// True exactly while an exchange is outstanding.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn current_exchange(&self) -> Option<ExchangeId> {
        self.current
    }

    /// Accept a question, unless it is blank or another exchange is in flight.
    pub fn submit(&mut self, question: &str) -> Option<Submission> {
        let question = question.trim();
        if question.is_empty() || self.streaming {
            return None;
        }

        self.next_id += 1;
        let exchange = ExchangeId(self.next_id);
        self.streaming = true;
        self.current = Some(exchange);
        self.transcript = self.transcript.begin(exchange, question);

        Some(Submission {
            exchange,
            question: question.to_string(),
        })
    }

    pub fn apply(&mut self, event: ExchangeEvent) {
        match event {
            ExchangeEvent::Update { exchange, update } => {
                if self.current != Some(exchange) || !self.streaming {
                    debug!(%exchange, "dropping update for inactive exchange");
                    return;
                }
                self.transcript = self.transcript.apply(exchange, &update);
            }
            ExchangeEvent::Settled { exchange } => {
                if self.current == Some(exchange) {
                    self.streaming = false;
                }
            }
        }
    }

    /// Run a whole exchange inline. Returns `None` when the question was rejected.
    pub async fn ask(&mut self, client: &AskClient, question: &str) -> Option<ExchangeId> {
        let submission = self.submit(question)?;
        let exchange = submission.exchange;
        run_exchange(client, submission, |event| self.apply(event)).await;
        Some(exchange)
    }
}

/// Emits `Settled` when dropped, so every exit path releases the streaming flag.
struct SettleGuard<F: FnMut(ExchangeEvent)> {
    exchange: ExchangeId,
    emit: F,
}

impl<F: FnMut(ExchangeEvent)> SettleGuard<F> {
    fn update(&mut self, update: Update) {
        (self.emit)(ExchangeEvent::Update {
            exchange: self.exchange,
            update,
        });
    }
}

impl<F: FnMut(ExchangeEvent)> Drop for SettleGuard<F> {
    fn drop(&mut self) {
        (self.emit)(ExchangeEvent::Settled {
            exchange: self.exchange,
        });
    }
}

/// Send the question with `client` and report the exchange through `emit`.
///
/// `Settled` is emitted even when the returned future is dropped before it
/// is first polled.
pub fn run_exchange<'a, F>(
    client: &'a AskClient,
    submission: Submission,
    emit: F,
) -> impl Future<Output = ()> + 'a
where
    F: FnMut(ExchangeEvent) + 'a,
{
    let guard = SettleGuard {
        exchange: submission.exchange,
        emit,
    };
    let question = submission.question;
    settle(guard, async move { client.ask(&question).await })
}

/// Report one exchange whose response is produced by `response`.
pub fn drive<R, F>(submission: Submission, response: R, emit: F) -> impl Future<Output = ()>
where
    R: Future<Output = ExchangeResult<AnswerBody>>,
    F: FnMut(ExchangeEvent),
{
    let guard = SettleGuard {
        exchange: submission.exchange,
        emit,
    };
    settle(guard, response)
}

// The guard is owned by the returned future from the start, so dropping it
// at any point releases the streaming flag.
fn settle<R, F>(mut guard: SettleGuard<F>, response: R) -> impl Future<Output = ()>
where
    R: Future<Output = ExchangeResult<AnswerBody>>,
    F: FnMut(ExchangeEvent),
{
    let span = info_span!("exchange", id = guard.exchange.0);
    async move {
        deliver(response.await, |update| guard.update(update)).await;
    }
    .instrument(span)
}

/// Reduce a response (or the failure to get one) to updates.
pub async fn deliver<F>(response: ExchangeResult<AnswerBody>, mut emit: F)
where
    F: FnMut(Update),
{
    match response {
        Err(err) => {
            warn!(error = %err, "exchange failed before any content");
            emit(Update::Failed(err.to_string()));
        }
        Ok(AnswerBody::Buffered(body)) => match buffered_answer(&body) {
            Ok(answer) => emit(Update::Complete(answer)),
            Err(err) => {
                warn!(error = %err, "buffered response carried no answer");
                emit(Update::Failed(err.to_string()));
            }
        },
        Ok(AnswerBody::Streamed(stream)) => consume_stream(stream, emit).await,
    }
}

/// Decode a chunk stream in arrival order. Stops reading at the first error.
pub async fn consume_stream<S, F>(mut stream: S, mut emit: F)
where
    S: Stream<Item = ExchangeResult<Bytes>> + Unpin,
    F: FnMut(Update),
{
    let mut decoder = StreamDecoder::new();
    let mut chunks = 0usize;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                chunks += 1;
                if let Some(update) = decoder.push(&bytes) {
                    emit(update);
                }
                if decoder.is_failed() {
                    warn!(chunks, "in-band error, abandoning the rest of the stream");
                    return;
                }
            }
            Err(err) => {
                warn!(chunks, error = %err, "stream broke off");
                emit(Update::Failed(err.to_string()));
                return;
            }
        }
    }

    if let Some(update) = decoder.finish() {
        emit(update);
    }
    debug!(chunks, "stream finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::state::RunningAnswer;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn streamed(chunks: &[&str]) -> ExchangeResult<AnswerBody> {
        let items: Vec<ExchangeResult<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        Ok(AnswerBody::Streamed(Box::pin(stream::iter(items))))
    }

    async fn exchange_with<T: Transcript>(
        session: &mut ChatSession<T>,
        question: &str,
        response: ExchangeResult<AnswerBody>,
    ) {
        let submission = session.submit(question).expect("question accepted");
        drive(submission, async { response }, |event| session.apply(event)).await;
    }

    #[test]
    fn test_submit_sets_streaming_synchronously() {
        let mut session: ChatSession = ChatSession::new();
        assert!(!session.is_streaming());

        let submission = session.submit("  What is it?  ").unwrap();
        assert!(session.is_streaming());
        assert_eq!(submission.question, "What is it?");
        assert_eq!(session.transcript().messages()[0].content, "What is it?");
    }

    #[test]
    fn test_submit_rejected_while_streaming() {
        let mut session: ChatSession = ChatSession::new();
        session.submit("first").unwrap();
        let before = session.transcript().clone();

        assert!(session.submit("second").is_none());
        assert_eq!(session.transcript(), &before);
        assert_eq!(session.current_exchange(), Some(ExchangeId(1)));
    }

    #[test]
    fn test_submit_rejects_blank() {
        let mut session: ChatSession = ChatSession::new();
        assert!(session.submit("   \n").is_none());
        assert!(!session.is_streaming());
        assert!(session.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_streamed_chunks_concatenate() {
        let mut session: ChatSession = ChatSession::new();
        exchange_with(&mut session, "q", streamed(&["Hello, ", "world!"])).await;

        assert_eq!(session.transcript().answer(), Some("Hello, world!"));
        assert_eq!(session.transcript().len(), 2);
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn test_in_band_error_stops_processing() {
        let mut session: ChatSession = ChatSession::new();
        exchange_with(
            &mut session,
            "q",
            streamed(&["Partial ", r#"{"error":"bad input"}"#, "ignored"]),
        )
        .await;

        assert_eq!(session.transcript().answer(), Some("Error: bad input"));
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn test_stream_not_polled_after_error() {
        let polled = Arc::new(AtomicUsize::new(0));
        let counter = polled.clone();
        let chunks = stream::iter(vec![r#"{"error":"stop"}"#, "one", "two"]).map(move |c| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ExchangeError>(Bytes::from(c))
        });

        let mut updates = Vec::new();
        consume_stream(Box::pin(chunks), |u| updates.push(u)).await;

        assert_eq!(updates, vec![Update::Failed("stop".into())]);
        assert_eq!(polled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_buffered_response() {
        let mut session: ChatSession = ChatSession::new();
        let body = Ok(AnswerBody::Buffered(r#"{"response":"42"}"#.to_string()));
        exchange_with(&mut session, "q", body).await;

        assert_eq!(session.transcript().answer(), Some("42"));
    }

    #[tokio::test]
    async fn test_buffered_response_without_field() {
        let mut session: ChatSession = ChatSession::new();
        let body = Ok(AnswerBody::Buffered("{}".to_string()));
        exchange_with(&mut session, "q", body).await;

        assert_eq!(session.transcript().answer(), Some("No response received"));
    }

    #[tokio::test]
    async fn test_status_error_settles() {
        let mut session: ChatSession = ChatSession::new();
        let err = ExchangeError::from_status_body(401, r#"{"error":"unauthorized"}"#);
        exchange_with(&mut session, "q", Err(err)).await;

        assert_eq!(session.transcript().answer(), Some("Error: unauthorized"));
        assert!(!session.is_streaming());
        assert!(session.submit("next").is_some());
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream() {
        let items: Vec<ExchangeResult<Bytes>> = vec![
            Ok(Bytes::from("Hel")),
            Err(ExchangeError::Transport("connection reset".into())),
        ];
        let mut session: ChatSession = ChatSession::new();
        let body = Ok(AnswerBody::Streamed(Box::pin(stream::iter(items))));
        exchange_with(&mut session, "q", body).await;

        assert_eq!(session.transcript().answer(), Some("Error: connection reset"));
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn test_same_chunks_same_result() {
        let chunks = ["The ", "answer ", r#"{"response":"is"}"#, " 42"];
        let mut first: ChatSession<RunningAnswer> = ChatSession::new();
        let mut second: ChatSession<RunningAnswer> = ChatSession::new();

        exchange_with(&mut first, "q", streamed(&chunks)).await;
        exchange_with(&mut second, "q", streamed(&chunks)).await;

        assert_eq!(first.transcript().text(), "The answer is 42");
        assert_eq!(first.transcript(), second.transcript());
    }

    #[tokio::test]
    async fn test_two_exchanges_keep_history() {
        let mut session: ChatSession = ChatSession::new();
        exchange_with(&mut session, "one", streamed(&["first"])).await;
        exchange_with(&mut session, "two", streamed(&["second"])).await;

        let contents: Vec<&str> = session
            .transcript()
            .messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["one", "first", "two", "second"]);
    }

    #[test]
    fn test_stale_events_ignored() {
        let mut session: ChatSession = ChatSession::new();
        session.submit("q").unwrap();
        session.apply(ExchangeEvent::Update {
            exchange: ExchangeId(99),
            update: Update::Fragment("stray".into()),
        });
        session.apply(ExchangeEvent::Settled {
            exchange: ExchangeId(99),
        });

        assert!(session.is_streaming());
        assert_eq!(session.transcript().answer(), None);
    }

    #[tokio::test]
    async fn test_abort_still_settles() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut session: ChatSession = ChatSession::new();
        let submission = session.submit("q").unwrap();

        let task = tokio::spawn(drive(
            submission,
            std::future::pending::<ExchangeResult<AnswerBody>>(),
            move |event| {
                let _ = tx.send(event);
            },
        ));
        // Let the task start and park on the pending response
        tokio::task::yield_now().await;
        task.abort();
        let _ = task.await;

        while let Some(event) = rx.recv().await {
            session.apply(event);
        }
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn test_abort_before_first_poll_still_settles() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut session: ChatSession = ChatSession::new();
        let submission = session.submit("q").unwrap();

        let task = tokio::spawn(drive(
            submission,
            std::future::pending::<ExchangeResult<AnswerBody>>(),
            move |event| {
                let _ = tx.send(event);
            },
        ));
        task.abort();
        let _ = task.await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event.clone());
            session.apply(event);
        }
        assert_eq!(events, vec![ExchangeEvent::Settled { exchange: ExchangeId(1) }]);
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn test_dropped_exchange_settles() {
        let client = AskClient::new("http://127.0.0.1:9");
        let mut events = Vec::new();
        let submission = Submission {
            exchange: ExchangeId(3),
            question: "q".into(),
        };

        drop(run_exchange(&client, submission, |event| events.push(event)));

        assert_eq!(events, vec![ExchangeEvent::Settled { exchange: ExchangeId(3) }]);
    }
}
