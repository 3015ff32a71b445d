//! Cold-start countdown bookkeeping.
//!
//! A backend on a free hosting tier sleeps when idle and answers the first request with a
//! gateway error while it boots.  [`ColdStartRetry`] decides whether such a failure starts a
//! countdown, counts it down one second per [`tick`](ColdStartRetry::tick), and hands the
//! question back when it is time to re-issue it.  It owns no timers; the session drives it.

use crate::config::ColdStartConfig;
use crate::error::Error;
use crate::observability::COLD_START_COUNTDOWNS;

/// Outcome of one countdown tick.
///
/// The tick that would bring the countdown to zero fires the retry instead, so a countdown of
/// `n` seconds reports `Waiting(n - 1)` down to `Waiting(1)` and never `Waiting(0)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tick {
    /// Still waiting; this many seconds remain.
    Waiting(u32),
    /// The countdown finished; re-issue this question.
    Fire(String),
    /// No countdown is running.
    Idle,
}

#[derive(Clone, Debug)]
struct Countdown {
    question: String,
    remaining: u32,
}

/// Countdown state for one session.
#[derive(Clone, Debug, Default)]
pub struct ColdStartRetry {
    config: ColdStartConfig,
    pending: Option<Countdown>,
    consecutive: u32,
}

impl ColdStartRetry {
    /// Creates an idle countdown governed by `config`.
    pub fn new(config: ColdStartConfig) -> Self {
        Self {
            config,
            pending: None,
            consecutive: 0,
        }
    }

    /// Returns the countdown policy.
    pub fn config(&self) -> &ColdStartConfig {
        &self.config
    }

    /// Returns the countdown policy for mutation.  A running countdown keeps its length.
    pub fn config_mut(&mut self) -> &mut ColdStartConfig {
        &mut self.config
    }

    /// Returns true if `err` signals that the backend is still starting.
    pub fn classify(&self, err: &Error) -> bool {
        err.is_cold_start() || (self.config.timeout_is_cold_start && err.is_timeout())
    }

    /// Starts a countdown for `question`.
    ///
    /// The countdown lasts `countdown_secs`, or longer if the backend's `Retry-After` asked for
    /// more.  Returns the countdown length, or `None` when auto-retry is off, a countdown is
    /// already running, or this question has already used its allowance of countdowns.
    pub fn arm(&mut self, question: &str, retry_after: Option<u64>) -> Option<u32> {
        if !self.config.auto_retry
            || self.pending.is_some()
            || self.consecutive >= self.config.max_consecutive
        {
            return None;
        }
        self.consecutive += 1;
        COLD_START_COUNTDOWNS.click();
        let requested = retry_after.map_or(0, |secs| u32::try_from(secs).unwrap_or(u32::MAX));
        let remaining = self.config.countdown_secs.max(requested);
        tracing::info!(
            remaining,
            ?retry_after,
            attempt = self.consecutive,
            "backend is starting; retrying after countdown"
        );
        self.pending = Some(Countdown {
            question: question.to_string(),
            remaining,
        });
        Some(remaining)
    }

    /// Advances the countdown by one second.
    pub fn tick(&mut self) -> Tick {
        let Some(countdown) = self.pending.as_mut() else {
            return Tick::Idle;
        };
        if countdown.remaining <= 1 {
            let question = std::mem::take(&mut countdown.question);
            self.pending = None;
            return Tick::Fire(question);
        }
        countdown.remaining -= 1;
        Tick::Waiting(countdown.remaining)
    }

    /// Drops a running countdown.  The consecutive count is kept.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Forgets all history; used when a new question is submitted.
    pub fn reset(&mut self) {
        self.pending = None;
        self.consecutive = 0;
    }

    /// Records that the backend answered.
    pub fn succeeded(&mut self) {
        self.consecutive = 0;
    }

    /// Returns true while a countdown is running.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Seconds left on the running countdown.
    pub fn remaining(&self) -> Option<u32> {
        self.pending.as_ref().map(|c| c.remaining)
    }

    /// Countdowns started for the current question.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(countdown_secs: u32) -> ColdStartRetry {
        ColdStartRetry::new(ColdStartConfig {
            countdown_secs,
            ..ColdStartConfig::default()
        })
    }

    #[test]
    fn counts_down_then_fires() {
        let mut retry = retry(3);
        assert_eq!(retry.arm("What is net pay?", None), Some(3));
        assert_eq!(retry.tick(), Tick::Waiting(2));
        assert_eq!(retry.tick(), Tick::Waiting(1));
        assert_eq!(retry.tick(), Tick::Fire("What is net pay?".to_string()));
        assert_eq!(retry.tick(), Tick::Idle);
        assert!(!retry.is_pending());
    }

    #[test]
    fn retry_after_only_lengthens_countdown() {
        let mut retry = retry(3);
        assert_eq!(retry.arm("q", Some(5)), Some(5));
        assert_eq!(retry.tick(), Tick::Waiting(4));
        retry.reset();
        assert_eq!(retry.arm("q", Some(1)), Some(3));
        retry.reset();
        assert_eq!(retry.arm("q", Some(u64::MAX)), Some(u32::MAX));
    }

    #[test]
    fn cannot_arm_twice() {
        let mut retry = retry(3);
        assert_eq!(retry.arm("a", None), Some(3));
        assert_eq!(retry.arm("b", None), None);
        assert_eq!(retry.remaining(), Some(3));
    }

    #[test]
    fn bounded_consecutive_countdowns() {
        let mut retry = ColdStartRetry::new(ColdStartConfig {
            countdown_secs: 1,
            max_consecutive: 2,
            ..ColdStartConfig::default()
        });
        for _ in 0..2 {
            assert_eq!(retry.arm("q", None), Some(1));
            assert_eq!(retry.tick(), Tick::Fire("q".to_string()));
        }
        assert_eq!(retry.arm("q", None), None);
        retry.reset();
        assert_eq!(retry.arm("q", None), Some(1));
    }

    #[test]
    fn auto_retry_off() {
        let mut retry = ColdStartRetry::new(ColdStartConfig {
            auto_retry: false,
            ..ColdStartConfig::default()
        });
        assert_eq!(retry.arm("q", None), None);
        assert_eq!(retry.tick(), Tick::Idle);
    }

    #[test]
    fn cancel_keeps_history() {
        let mut retry = retry(5);
        retry.arm("q", None);
        assert!(retry.cancel());
        assert!(!retry.cancel());
        assert_eq!(retry.consecutive(), 1);
    }

    #[test]
    fn classify() {
        let mut retry = retry(5);
        assert!(retry.classify(&Error::cold_start(Some(503), "starting", None)));
        assert!(!retry.classify(&Error::timeout("slow", Some(60.0))));
        assert!(!retry.classify(&Error::api(500, "boom")));
        retry.config_mut().timeout_is_cold_start = true;
        assert!(retry.classify(&Error::timeout("slow", Some(60.0))));
    }
}
