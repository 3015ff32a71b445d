//! The session controller: the one object a front end talks to.
//!
//! A [`SessionController`] owns the conversation log, the dispatcher, and the cold-start
//! countdown, and moves between [`SessionState`]s as work completes.  It is driven from the
//! outside: [`submit`](SessionController::submit) starts work and
//! [`step`](SessionController::step) performs the next unit of it, returning a
//! [`SessionEvent`] for the front end to show.
//!
//! ```ignore
//! match session.submit("What is net pay?") {
//!     Submission::Accepted => session.run_until_idle(&mut renderer).await,
//!     Submission::Busy | Submission::Empty => {}
//! }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::cold_start::{ColdStartRetry, Tick};
use crate::config::{ColdStartConfig, DispatchConfig, FallbackText};
use crate::decoder::StreamEvent;
use crate::dispatcher::{AbortHandle, AnswerStream, Reply, RequestDispatcher};
use crate::error::{Error, ErrorKind, Result};
use crate::log::{ConversationLog, Turn};
use crate::observability::{COLD_START_RETRIES, SESSION_FAILURES, SESSION_TURNS};
use crate::render::Renderer;
use crate::transport::Transport;

/// Where the session is in the life of the current question.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing in flight.  The only state that accepts a submission.
    Idle,
    /// Request sent; waiting for the backend to start answering.
    Sending,
    /// Deltas are arriving.
    Streaming,
    /// The backend is warming up; the question will be re-sent after this many seconds.
    ColdStartWait(u32),
    /// The current question failed.  Transient: the session returns to `Idle` right away.
    Failed(ErrorKind),
}

/// What happened to a call to [`SessionController::submit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    /// The question was logged and sent.
    Accepted,
    /// Another question is still in progress; nothing changed.
    Busy,
    /// The text was blank; nothing changed.
    Empty,
}

/// One unit of visible progress.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Text appended to the assistant turn.
    Text(String),
    /// A record in the stream was unreadable and skipped.
    Warning(Error),
    /// The question failed; `fallback` was appended to the assistant turn.
    Failed { error: Error, fallback: String },
    /// The cold-start countdown has this many seconds left.
    Countdown(u32),
    /// The countdown ended and the question was re-sent.
    Retrying,
    /// The user stopped the answer.
    Interrupted,
    /// The assistant turn is complete.
    Done,
}

/// Counters for the life of one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Questions accepted.
    pub turns: u64,
    /// Requests sent, retries included.
    pub requests: u64,
    /// Questions that ended in a fallback message.
    pub failures: u64,
    /// Cold-start countdowns started.
    pub cold_starts: u64,
    /// Questions re-sent after a countdown.
    pub retries: u64,
    /// Stream records skipped as unreadable.
    pub malformed: u64,
}

/// Session behavior beyond how to reach the backend.
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    /// Countdown policy for a backend that is still starting.
    pub cold_start: ColdStartConfig,
    /// Text placed in the assistant turn when no answer arrives.
    pub fallback: FallbackText,
    /// Assistant turn placed in the log before the first question.
    pub greeting: Option<String>,
}

impl SessionOptions {
    /// Sets the countdown policy.
    pub fn with_cold_start(mut self, cold_start: ColdStartConfig) -> Self {
        self.cold_start = cold_start;
        self
    }

    /// Sets the fallback text.
    pub fn with_fallback(mut self, fallback: FallbackText) -> Self {
        self.fallback = fallback;
        self
    }

    /// Seeds the log with an assistant greeting.
    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }
}

/// Stops the current answer from any thread.
///
/// Cloneable and `Send + Sync`, so it can live in a signal handler.  An interrupt that
/// arrives while the session is idle is forgotten at the next submission.
#[derive(Clone, Debug)]
pub struct Interrupter {
    tx: Arc<watch::Sender<u64>>,
}

impl Interrupter {
    /// Stops the answer in progress, if any.
    pub fn interrupt(&self) {
        self.tx.send_modify(|n| *n = n.wrapping_add(1));
    }
}

enum Phase {
    Idle,
    Sending {
        abort: AbortHandle,
        response: BoxFuture<'static, Result<Reply>>,
    },
    Streaming {
        stream: AnswerStream,
    },
    Countdown {
        ticker: Interval,
    },
}

enum Progress {
    Interrupted,
    Reply(Result<Reply>),
    Event(Option<Result<StreamEvent>>),
    Tick,
}

/// Drives one conversation against one backend.
pub struct SessionController {
    dispatcher: RequestDispatcher,
    cold_start: ColdStartRetry,
    fallback: FallbackText,
    log: ConversationLog,
    state: watch::Sender<SessionState>,
    phase: Phase,
    question: Option<String>,
    outbox: VecDeque<SessionEvent>,
    interrupter: Interrupter,
    interrupts: watch::Receiver<u64>,
    stats: SessionStats,
}

impl SessionController {
    /// Creates an idle session.  The greeting, if any, becomes the first turn.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: DispatchConfig,
        options: SessionOptions,
    ) -> Self {
        let SessionOptions {
            cold_start,
            fallback,
            greeting,
        } = options;
        let mut log = ConversationLog::new();
        if let Some(greeting) = greeting {
            log.append(Turn::assistant(greeting));
        }
        let (state, _) = watch::channel(SessionState::Idle);
        let (tx, interrupts) = watch::channel(0u64);
        Self {
            dispatcher: RequestDispatcher::new(transport, config),
            cold_start: ColdStartRetry::new(cold_start),
            fallback,
            log,
            state,
            phase: Phase::Idle,
            question: None,
            outbox: VecDeque::new(),
            interrupter: Interrupter { tx: Arc::new(tx) },
            interrupts,
            stats: SessionStats::default(),
        }
    }

    /// Logs `text` as a question and sends it.
    ///
    /// Only an idle session accepts a question; otherwise the log is left untouched.
    pub fn submit(&mut self, text: &str) -> Submission {
        if !matches!(self.phase, Phase::Idle) {
            tracing::debug!(state = ?self.state(), "submission rejected while busy");
            return Submission::Busy;
        }
        if text.trim().is_empty() {
            return Submission::Empty;
        }
        self.interrupts.borrow_and_update();
        self.cold_start.reset();
        self.log.append(Turn::user(text));
        self.log.append(Turn::assistant(""));
        self.question = Some(text.to_string());
        self.stats.turns += 1;
        SESSION_TURNS.click();
        self.dispatch(text.to_string());
        Submission::Accepted
    }

    /// Performs the next unit of work and reports it.
    ///
    /// Returns `None` once the session is idle and every event has been reported.
    pub async fn step(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.outbox.pop_front() {
                return Some(event);
            }
            let interrupts = &mut self.interrupts;
            let progress = match &mut self.phase {
                Phase::Idle => return None,
                Phase::Sending { response, .. } => tokio::select! {
                    biased;
                    _ = interrupts.changed() => Progress::Interrupted,
                    reply = response => Progress::Reply(reply),
                },
                Phase::Streaming { stream } => tokio::select! {
                    biased;
                    _ = interrupts.changed() => Progress::Interrupted,
                    event = stream.next() => Progress::Event(event),
                },
                Phase::Countdown { ticker } => tokio::select! {
                    biased;
                    _ = interrupts.changed() => Progress::Interrupted,
                    _ = ticker.tick() => Progress::Tick,
                },
            };
            self.advance(progress);
        }
    }

    /// Steps until idle, handing every event to `renderer`.
    ///
    /// Skipped stream records are not shown; they are logged and counted in
    /// [`SessionStats::malformed`].
    pub async fn run_until_idle(&mut self, renderer: &mut dyn Renderer) {
        while let Some(event) = self.step().await {
            match event {
                SessionEvent::Text(text) => renderer.print_text(&text),
                SessionEvent::Warning(_) => {}
                SessionEvent::Failed { error, fallback } => {
                    renderer.print_failure(&fallback, &error.to_string())
                }
                SessionEvent::Countdown(remaining) => renderer.print_countdown(remaining),
                SessionEvent::Retrying => renderer.print_retrying(),
                SessionEvent::Interrupted => renderer.print_interrupted(),
                SessionEvent::Done => renderer.finish_response(),
            }
        }
    }

    /// Stops the current request or countdown.  Returns false if there was nothing to stop.
    ///
    /// Text already in the assistant turn stays.
    pub fn abort(&mut self) -> bool {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => return false,
            Phase::Sending { abort, .. } => abort.abort(),
            Phase::Streaming { stream } => stream.abort_handle().abort(),
            Phase::Countdown { .. } => {
                self.cold_start.cancel();
            }
        }
        self.interrupted();
        true
    }

    /// Returns a handle that aborts from outside the task driving [`step`](Self::step).
    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    /// Cancels everything in progress.  Dropping the session does the same.
    pub fn shutdown(&mut self) {
        if self.abort() {
            tracing::debug!("session shut down with work in progress");
        }
        self.outbox.clear();
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watches state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Returns the conversation so far.
    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    /// Returns counters for this session.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Returns how the backend is reached.
    pub fn dispatch_config(&self) -> &DispatchConfig {
        self.dispatcher.config()
    }

    /// Changes take effect with the next request.
    pub fn dispatch_config_mut(&mut self) -> &mut DispatchConfig {
        self.dispatcher.config_mut()
    }

    /// Returns the countdown policy.
    pub fn cold_start_config(&self) -> &ColdStartConfig {
        self.cold_start.config()
    }

    /// Changes apply from the next countdown.
    pub fn cold_start_config_mut(&mut self) -> &mut ColdStartConfig {
        self.cold_start.config_mut()
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn dispatch(&mut self, question: String) {
        match self.dispatcher.begin(&question) {
            Ok(pending) => {
                self.stats.requests += 1;
                let abort = pending.abort_handle();
                self.phase = Phase::Sending {
                    abort,
                    response: Box::pin(pending.response()),
                };
                self.set_state(SessionState::Sending);
            }
            Err(err) => self.fail(err),
        }
    }

    fn advance(&mut self, progress: Progress) {
        match progress {
            Progress::Interrupted => {
                self.abort();
            }
            Progress::Reply(Ok(Reply::Full(answer))) => {
                self.phase = Phase::Idle;
                self.cold_start.succeeded();
                let text = if answer.answer.is_empty() {
                    self.fallback.no_response.clone()
                } else {
                    answer.answer
                };
                self.append(&text);
                self.outbox.push_back(SessionEvent::Text(text));
                self.finish();
            }
            Progress::Reply(Ok(Reply::Stream(stream))) => {
                self.cold_start.succeeded();
                self.phase = Phase::Streaming { stream };
                self.set_state(SessionState::Streaming);
            }
            Progress::Reply(Err(err)) => {
                self.phase = Phase::Idle;
                if !self.cold_start.classify(&err) {
                    self.fail(err);
                    return;
                }
                let armed = match self.question.as_deref() {
                    Some(question) => self.cold_start.arm(question, err.retry_after()),
                    None => None,
                };
                match armed {
                    Some(remaining) => self.countdown(remaining),
                    None => self.fail(err),
                }
            }
            Progress::Event(Some(Ok(StreamEvent::Delta(delta)))) => {
                if !delta.is_empty() {
                    self.append(&delta);
                    self.outbox.push_back(SessionEvent::Text(delta));
                }
            }
            Progress::Event(Some(Ok(StreamEvent::Warning(err)))) => {
                self.stats.malformed += 1;
                self.outbox.push_back(SessionEvent::Warning(err));
            }
            Progress::Event(Some(Err(err))) => {
                self.phase = Phase::Idle;
                if err.is_abort() {
                    self.interrupted();
                } else {
                    self.fail(err);
                }
            }
            Progress::Event(None) => {
                self.phase = Phase::Idle;
                if self.placeholder_is_empty() {
                    let text = self.fallback.no_response.clone();
                    self.append(&text);
                    self.outbox.push_back(SessionEvent::Text(text));
                }
                self.finish();
            }
            Progress::Tick => match self.cold_start.tick() {
                Tick::Waiting(remaining) => {
                    self.set_state(SessionState::ColdStartWait(remaining));
                    self.outbox.push_back(SessionEvent::Countdown(remaining));
                }
                Tick::Fire(question) => {
                    self.phase = Phase::Idle;
                    self.stats.retries += 1;
                    COLD_START_RETRIES.click();
                    tracing::info!("countdown finished; re-sending question");
                    self.outbox.push_back(SessionEvent::Retrying);
                    self.dispatch(question);
                }
                Tick::Idle => {
                    self.phase = Phase::Idle;
                    self.finish();
                }
            },
        }
    }

    fn countdown(&mut self, remaining: u32) {
        self.stats.cold_starts += 1;
        let start = if remaining == 0 {
            Instant::now()
        } else {
            Instant::now() + Duration::from_secs(1)
        };
        let mut ticker = tokio::time::interval_at(start, Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.phase = Phase::Countdown { ticker };
        self.set_state(SessionState::ColdStartWait(remaining));
        self.outbox.push_back(SessionEvent::Countdown(remaining));
    }

    fn fail(&mut self, error: Error) {
        self.phase = Phase::Idle;
        self.stats.failures += 1;
        SESSION_FAILURES.click();
        tracing::error!(error = %error, kind = %error.kind(), "question failed");
        let fallback = match error.kind() {
            ErrorKind::Timeout => self.fallback.timeout.clone(),
            ErrorKind::ColdStart => self.fallback.cold_start.clone(),
            _ => self.fallback.unavailable.clone(),
        };
        if self.placeholder_is_empty() {
            self.append(&fallback);
        } else {
            self.append(&format!("\n\n{fallback}"));
        }
        self.set_state(SessionState::Failed(error.kind()));
        self.outbox.push_back(SessionEvent::Failed { error, fallback });
        self.finish();
    }

    fn interrupted(&mut self) {
        if self.placeholder_is_empty() {
            let text = self.fallback.interrupted.clone();
            self.append(&text);
        }
        self.outbox.push_back(SessionEvent::Interrupted);
        self.finish();
    }

    fn finish(&mut self) {
        self.question = None;
        self.set_state(SessionState::Idle);
        self.outbox.push_back(SessionEvent::Done);
    }

    fn placeholder_is_empty(&self) -> bool {
        self.log.last().is_some_and(|turn| turn.text.is_empty())
    }

    fn append(&mut self, text: &str) {
        if let Err(err) = self.log.append_to_last(text) {
            tracing::error!(error = %err, "could not extend the assistant turn");
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
