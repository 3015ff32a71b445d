//! Request dispatch: one question in, one answer (buffered or streamed) out.
//!
//! The dispatcher owns the request lifecycle policy:
//!
//! - at most one request in flight; a second `begin` fails with [`Error::Busy`];
//! - a first-data deadline, after which the transport is dropped and [`Error::Timeout`] reported;
//! - an optional whole-exchange deadline measured from request start;
//! - explicit abort through an [`AbortHandle`];
//! - response-mode detection from the content type.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::DispatchConfig;
use crate::decoder::{StreamEvent, decode_stream};
use crate::error::{Error, Result};
use crate::observability::{
    DISPATCH_ABORTS, DISPATCH_BUFFERED, DISPATCH_BUSY, DISPATCH_ERRORS, DISPATCH_REQUESTS,
    DISPATCH_STREAMED, DISPATCH_TIMEOUTS, DISPATCH_TTFB, STREAM_DURATION,
};
use crate::transport::{ByteStream, ChatRequest, ChatResponse, Transport};

/// A buffered answer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    /// The reply text.  Empty when the backend omitted it.
    #[serde(default)]
    pub answer: String,
    /// Passages the backend used to build the answer, when it reports them.
    #[serde(default)]
    pub context_used: Vec<String>,
}

/// What the backend sent back.
pub enum Reply {
    /// The backend answered in one JSON document.
    Full(Answer),
    /// The backend is streaming newline-delimited records.
    Stream(AnswerStream),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Full(answer) => f.debug_tuple("Full").field(answer).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Aborts an in-flight request from anywhere.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    /// Stops the request.  Pending reads and timers end at their next poll.
    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Returns true once `abort` has been called or a deadline fired.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Clears the dispatcher's in-flight flag when dropped.
#[derive(Debug)]
struct InFlight {
    flag: Arc<AtomicBool>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Issues chat requests against one backend.
#[derive(Clone)]
pub struct RequestDispatcher {
    transport: Arc<dyn Transport>,
    config: DispatchConfig,
    in_flight: Arc<AtomicBool>,
}

impl RequestDispatcher {
    /// Creates a dispatcher.
    pub fn new(transport: Arc<dyn Transport>, config: DispatchConfig) -> Self {
        Self {
            transport,
            config,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Returns the active configuration for mutation.  Changes apply to the next request.
    pub fn config_mut(&mut self) -> &mut DispatchConfig {
        &mut self.config
    }

    /// Returns true while a request (or its response stream) is outstanding.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claims the in-flight slot and prepares a request for `question`.
    ///
    /// The clock starts here.  Fails with [`Error::Busy`] if another request is outstanding.
    pub fn begin(&self, question: &str) -> Result<PendingRequest> {
        let url = self.config.chat_url()?;
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            DISPATCH_BUSY.click();
            return Err(Error::busy("a request is already in flight"));
        }
        let guard = InFlight {
            flag: Arc::clone(&self.in_flight),
        };
        let started = Instant::now();
        Ok(PendingRequest {
            question: question.to_string(),
            url,
            transport: Arc::clone(&self.transport),
            started,
            deadline: started + self.config.timeout,
            total_deadline: self.config.total_timeout.map(|t| started + t),
            timeout: self.config.timeout,
            cold_start_statuses: self.config.cold_start_statuses.clone(),
            token: CancellationToken::new(),
            guard,
        })
    }

    /// Sends `question` and waits for the backend to commit to a response mode.
    pub async fn send(&self, question: &str) -> Result<Reply> {
        self.begin(question)?.response().await
    }
}

/// The single outstanding request.
///
/// Holding a `PendingRequest` (or the [`AnswerStream`] it turns into) keeps the dispatcher
/// busy; dropping it frees the slot.
pub struct PendingRequest {
    question: String,
    url: Url,
    transport: Arc<dyn Transport>,
    started: Instant,
    deadline: Instant,
    total_deadline: Option<Instant>,
    timeout: Duration,
    cold_start_statuses: Vec<u16>,
    token: CancellationToken,
    guard: InFlight,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("question", &self.question)
            .field("url", &self.url.as_str())
            .field("started", &self.started)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl PendingRequest {
    /// The question being asked.
    pub fn question(&self) -> &str {
        &self.question
    }

    /// When the request started.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// When the first-data deadline expires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns a handle that aborts this request.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.token.clone(),
        }
    }

    /// Performs the request and classifies the response.
    ///
    /// Resolves once the headers arrive for a stream, or once the whole body has been read for
    /// a buffered answer.
    pub async fn response(self) -> Result<Reply> {
        let PendingRequest {
            question,
            url,
            transport,
            started,
            deadline,
            total_deadline,
            timeout,
            cold_start_statuses,
            token,
            guard,
        } = self;
        DISPATCH_REQUESTS.click();
        tracing::debug!(url = %url, "dispatching chat request");
        let request = ChatRequest::new(question);
        // The first-data deadline and the whole-exchange deadline both count from `started`.
        let first_deadline = match total_deadline {
            Some(total) if total < deadline => total,
            _ => deadline,
        };
        let mut response = guarded(
            &token,
            until(Some(first_deadline)),
            timeout,
            transport.post_chat(&url, &request),
        )
        .await
        .inspect_err(record_failure)?;
        DISPATCH_TTFB.add(started.elapsed().as_secs_f64());

        if !response.is_success() {
            let err = error_from_response(response, &cold_start_statuses, &token).await;
            record_failure(&err);
            return Err(err);
        }

        let body_deadline = BodyDeadline {
            first: first_deadline,
            total: total_deadline,
            received: Arc::new(AtomicBool::new(false)),
        };
        response.body = body_deadline.watch(response.body);

        if response.is_buffered_json() {
            DISPATCH_BUFFERED.click();
            tracing::debug!("backend answered in buffered mode");
            let body = guarded(&token, body_deadline.expiry(), timeout, response.text())
                .await
                .inspect_err(record_failure)?;
            let answer = serde_json::from_str::<Answer>(&body).map_err(|e| {
                Error::serialization(
                    format!("Failed to parse answer: {e}"),
                    Some(Box::new(e)),
                )
            })?;
            drop(guard);
            return Ok(Reply::Full(answer));
        }

        DISPATCH_STREAMED.click();
        tracing::debug!(content_type = ?response.content_type, "backend answered in stream mode");
        Ok(Reply::Stream(AnswerStream {
            events: Box::pin(decode_stream(response.body)),
            token,
            started,
            body_deadline,
            timeout,
            guard: Some(guard),
        }))
    }
}

/// Answer deltas, decoded lazily as the body arrives.
pub struct AnswerStream {
    events: Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>,
    token: CancellationToken,
    started: Instant,
    body_deadline: BodyDeadline,
    timeout: Duration,
    guard: Option<InFlight>,
}

impl AnswerStream {
    /// Returns the next event, or `None` once the stream has ended.
    ///
    /// An `Err` is terminal: the stream reports `None` afterwards.
    pub async fn next(&mut self) -> Option<Result<StreamEvent>> {
        self.guard.as_ref()?;
        let events = &mut self.events;
        let item = guarded(
            &self.token,
            self.body_deadline.expiry(),
            self.timeout,
            async move { Ok(events.next().await) },
        )
        .await;
        match item {
            Ok(Some(Ok(event))) => Some(Ok(event)),
            Ok(None) => {
                self.close();
                None
            }
            Ok(Some(Err(err))) | Err(err) => {
                record_failure(&err);
                self.close();
                Some(Err(err))
            }
        }
    }

    /// Returns a handle that aborts this stream.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.token.clone(),
        }
    }

    /// Returns true once the stream has ended, failed, or been aborted.
    pub fn is_closed(&self) -> bool {
        self.guard.is_none()
    }

    fn close(&mut self) {
        if self.guard.take().is_some() {
            STREAM_DURATION.add(self.started.elapsed().as_secs_f64());
        }
    }
}

/// Deadlines for reading a response body.
///
/// Until the first body bytes arrive the first-data deadline applies; after that only the
/// whole-exchange deadline, if any, does.
#[derive(Clone, Debug)]
struct BodyDeadline {
    first: Instant,
    total: Option<Instant>,
    received: Arc<AtomicBool>,
}

impl BodyDeadline {
    /// Wraps `body` so the first non-empty chunk is noticed.
    fn watch(&self, body: ByteStream) -> ByteStream {
        let received = Arc::clone(&self.received);
        Box::pin(body.inspect(move |chunk| {
            if matches!(chunk, Ok(bytes) if !bytes.is_empty()) {
                received.store(true, Ordering::Release);
            }
        }))
    }

    /// Resolves when the applicable deadline passes.
    ///
    /// A read that receives data after this future was created moves on to the
    /// whole-exchange deadline instead of expiring at the first-data one.
    fn expiry(&self) -> impl Future<Output = ()> + Send + 'static {
        let received = Arc::clone(&self.received);
        let first = (!received.load(Ordering::Acquire)).then_some(self.first);
        let total = self.total;
        async move {
            if let Some(first) = first {
                tokio::time::sleep_until(first).await;
                if !received.load(Ordering::Acquire) {
                    return;
                }
            }
            until(total).await
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending::<()>().await,
    }
}

/// Races `fut` against abort and `expiry`.  Expiry cancels the token so every other holder of
/// it stops too.
async fn guarded<T, F, E>(
    token: &CancellationToken,
    expiry: E,
    timeout: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
    E: Future<Output = ()>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::abort("request aborted")),
        result = fut => result,
        _ = expiry => {
            token.cancel();
            Err(Error::timeout(
                "no data from backend before the deadline",
                Some(timeout.as_secs_f64()),
            ))
        }
    }
}

fn record_failure(err: &Error) {
    if err.is_abort() {
        DISPATCH_ABORTS.click();
    } else if err.is_timeout() {
        DISPATCH_TIMEOUTS.click();
    } else {
        DISPATCH_ERRORS.click();
    }
}

async fn error_from_response(
    response: ChatResponse,
    cold_start_statuses: &[u16],
    token: &CancellationToken,
) -> Error {
    #[derive(Deserialize)]
    struct ErrorBody {
        detail: Option<serde_json::Value>,
    }

    let status = response.status;
    let retry_after = response.retry_after;
    // A stalled error body should not hold up the failure report.
    let body = guarded(
        token,
        until(Some(Instant::now() + Duration::from_secs(5))),
        Duration::from_secs(5),
        response.text(),
    )
    .await
    .unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.detail)
        .map(|detail| match detail {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .unwrap_or(body);

    if cold_start_statuses.contains(&status) {
        tracing::info!(status, ?retry_after, "backend signalled a cold start");
        Error::cold_start(Some(status), message, retry_after)
    } else {
        Error::api(status, message)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::testing::{Script, ScriptedTransport};

    fn dispatcher(scripts: Vec<Script>) -> (RequestDispatcher, ScriptedTransport) {
        let transport = ScriptedTransport::new(scripts);
        let config = DispatchConfig::new(Url::parse("http://localhost:8000").unwrap());
        (
            RequestDispatcher::new(Arc::new(transport.clone()), config),
            transport,
        )
    }

    async fn collect_text(mut stream: AnswerStream) -> String {
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            if let StreamEvent::Delta(delta) = event.unwrap() {
                text.push_str(&delta);
            }
        }
        text
    }

    #[tokio::test]
    async fn buffered_answer() {
        let (dispatcher, transport) = dispatcher(vec![Script::json(
            200,
            r#"{"answer":"Net pay is take-home pay.","context_used":["doc 1"]}"#,
        )]);
        let reply = dispatcher.send("What is net pay?").await.unwrap();
        match reply {
            Reply::Full(answer) => {
                assert_eq!(answer.answer, "Net pay is take-home pay.");
                assert_eq!(answer.context_used, vec!["doc 1".to_string()]);
            }
            Reply::Stream(_) => panic!("expected a buffered answer"),
        }
        assert_eq!(transport.questions(), vec!["What is net pay?".to_string()]);
        assert!(!dispatcher.is_busy());
    }

    #[tokio::test]
    async fn streamed_answer() {
        let (dispatcher, _) = dispatcher(vec![Script::ndjson(&[
            "{\"answer\":\"Net\"}\n{\"ans",
            "wer\":\" pay is...\"}\n",
        ])]);
        let Reply::Stream(stream) = dispatcher.send("What is net pay?").await.unwrap() else {
            panic!("expected a stream");
        };
        assert!(dispatcher.is_busy());
        assert_eq!(collect_text(stream).await, "Net pay is...");
        assert!(!dispatcher.is_busy());
    }

    #[tokio::test]
    async fn second_request_is_busy() {
        let (dispatcher, transport) = dispatcher(vec![Script::Hang]);
        let pending = dispatcher.begin("first").unwrap();
        let err = dispatcher.begin("second").unwrap_err();
        assert!(err.is_busy());
        drop(pending);
        assert!(!dispatcher.is_busy());
        assert!(transport.questions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn first_byte_timeout() {
        let (mut dispatcher, _) = dispatcher(vec![Script::Hang]);
        dispatcher.config_mut().timeout = Duration::from_secs(30);
        let start = Instant::now();
        let pending = dispatcher.begin("hello").unwrap();
        let abort = pending.abort_handle();
        let err = pending.response().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert!(abort.is_aborted());
        assert!(!dispatcher.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn total_timeout_bounds_the_stream() {
        let (mut dispatcher, _) = dispatcher(vec![Script::ndjson(&["{\"answer\":\"a\"}\n"]).stalled()]);
        dispatcher.config_mut().total_timeout = Some(Duration::from_secs(90));
        let Reply::Stream(mut stream) = dispatcher.send("hello").await.unwrap() else {
            panic!("expected a stream");
        };
        assert_eq!(stream.next().await.unwrap().unwrap().as_delta(), Some("a"));
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert!(stream.next().await.is_none());
        assert!(stream.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_hits_first_data_deadline() {
        let (dispatcher, _) = dispatcher(vec![Script::ndjson(&[]).stalled()]);
        let start = Instant::now();
        let Reply::Stream(mut stream) = dispatcher.send("hello").await.unwrap() else {
            panic!("expected a stream");
        };
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert!(stream.next().await.is_none());
        assert!(!dispatcher.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_record_moves_to_total_deadline() {
        let (mut dispatcher, _) = dispatcher(vec![Script::Respond {
            delay: Duration::ZERO,
            status: 200,
            content_type: Some("application/x-ndjson"),
            retry_after: None,
            chunks: vec![(Duration::from_secs(10), b"{\"answ".to_vec())],
            stall: true,
        }]);
        dispatcher.config_mut().total_timeout = Some(Duration::from_secs(90));
        let start = Instant::now();
        let Reply::Stream(mut stream) = dispatcher.send("hello").await.unwrap() else {
            panic!("expected a stream");
        };
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(start.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_buffered_body_hits_first_data_deadline() {
        let (dispatcher, _) = dispatcher(vec![Script::json(200, "").stalled()]);
        let start = Instant::now();
        let err = dispatcher.send("hello").await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert!(!dispatcher.is_busy());
    }

    #[test]
    fn pending_request_debug_names_the_question() {
        let (dispatcher, _) = dispatcher(vec![]);
        let pending = dispatcher.begin("What is net pay?").unwrap();
        let rendered = format!("{pending:?}");
        assert!(rendered.starts_with("PendingRequest"));
        assert!(rendered.contains("What is net pay?"));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_before_headers() {
        let (dispatcher, _) = dispatcher(vec![Script::Hang]);
        let pending = dispatcher.begin("hello").unwrap();
        let abort = pending.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            abort.abort();
        });
        let err = pending.response().await.unwrap_err();
        assert!(err.is_abort());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_mid_stream_keeps_earlier_deltas() {
        let (dispatcher, _) = dispatcher(vec![Script::ndjson(&["{\"answer\":\"partial\"}\n"]).stalled()]);
        let Reply::Stream(mut stream) = dispatcher.send("hello").await.unwrap() else {
            panic!("expected a stream");
        };
        assert_eq!(
            stream.next().await.unwrap().unwrap().as_delta(),
            Some("partial")
        );
        stream.abort_handle().abort();
        assert!(stream.next().await.unwrap().unwrap_err().is_abort());
        assert!(!dispatcher.is_busy());
    }

    #[tokio::test]
    async fn cold_start_status() {
        let (dispatcher, _) = dispatcher(vec![Script::status(503)]);
        let err = dispatcher.send("hello").await.unwrap_err();
        assert!(err.is_cold_start());
        assert_eq!(err.status_code(), Some(503));
    }

    #[tokio::test]
    async fn api_error_uses_detail() {
        let (dispatcher, _) = dispatcher(vec![Script::json(
            500,
            r#"{"detail":"Index not initialized."}"#,
        )]);
        let err = dispatcher.send("hello").await.unwrap_err();
        assert_eq!(err.status_code(), Some(500));
        assert_eq!(err.to_string(), "API error (500): Index not initialized.");
    }

    #[tokio::test]
    async fn connection_refused() {
        let (dispatcher, _) = dispatcher(vec![Script::Fail {
            delay: Duration::ZERO,
            error: Error::connection("connection refused", None),
        }]);
        let err = dispatcher.send("hello").await.unwrap_err();
        assert!(err.is_connection());
        assert!(!dispatcher.is_busy());
    }

    #[tokio::test]
    async fn buffered_answer_without_answer_field() {
        let (dispatcher, _) = dispatcher(vec![Script::json(200, "{}")]);
        let Reply::Full(answer) = dispatcher.send("hello").await.unwrap() else {
            panic!("expected a buffered answer");
        };
        assert!(answer.answer.is_empty());
    }

    #[tokio::test]
    async fn buffered_answer_that_is_not_json() {
        let (dispatcher, _) = dispatcher(vec![Script::json(200, "<html>")]);
        let err = dispatcher.send("hello").await.unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
