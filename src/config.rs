//! Configuration for the session core.
//!
//! The core never decides where the backend lives or how patient to be; those values arrive
//! here from the caller.  The REPL builds them from flags, the environment, and YAML files
//! (see `chat::ChatConfig`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Result;

/// Path of the chat endpoint, relative to the base URL.
pub const CHAT_PATH: &str = "chat";

/// Default time to wait for the first byte of a response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default statuses that mean "the backend is still starting".
pub const DEFAULT_COLD_START_STATUSES: [u16; 3] = [502, 503, 504];

/// Default length of the cold-start countdown.
pub const DEFAULT_COUNTDOWN_SECS: u32 = 30;

/// Default bound on back-to-back countdowns for one question.
pub const DEFAULT_MAX_CONSECUTIVE: u32 = 3;

/// How the dispatcher reaches the backend and how long it waits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Origin (and optional path prefix) of the backend.
    pub base_url: Url,
    /// Deadline for the first data (headers or first byte), measured from request start.
    pub timeout: Duration,
    /// Deadline for the whole exchange, measured from request start.  `None` disables it.
    pub total_timeout: Option<Duration>,
    /// Non-success statuses treated as a cold-start signal.
    pub cold_start_statuses: Vec<u16>,
}

impl DispatchConfig {
    /// Creates a configuration with default timeouts for `base_url`.
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: DEFAULT_TIMEOUT,
            total_timeout: None,
            cold_start_statuses: DEFAULT_COLD_START_STATUSES.to_vec(),
        }
    }

    /// Sets the first-data timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the whole-exchange timeout.
    pub fn with_total_timeout(mut self, total_timeout: Option<Duration>) -> Self {
        self.total_timeout = total_timeout;
        self
    }

    /// Sets the statuses that signal a cold start.
    pub fn with_cold_start_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.cold_start_statuses = statuses;
        self
    }

    /// Returns true if `status` means the backend is warming up.
    pub fn is_cold_start_status(&self, status: u16) -> bool {
        self.cold_start_statuses.contains(&status)
    }

    /// Resolves the chat endpoint against the base URL.
    ///
    /// The base URL is treated as a directory, so `https://host/api` resolves to
    /// `https://host/api/chat`.
    pub fn chat_url(&self) -> Result<Url> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base.join(CHAT_PATH)?)
    }
}

/// Cold-start countdown policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdStartConfig {
    /// Re-issue the question automatically when the countdown ends.
    pub auto_retry: bool,
    /// Length of the countdown, in seconds.
    pub countdown_secs: u32,
    /// Countdowns allowed back to back for one question before giving up.
    pub max_consecutive: u32,
    /// Treat a first-byte timeout as a cold-start signal.
    pub timeout_is_cold_start: bool,
}

impl Default for ColdStartConfig {
    fn default() -> Self {
        Self {
            auto_retry: true,
            countdown_secs: DEFAULT_COUNTDOWN_SECS,
            max_consecutive: DEFAULT_MAX_CONSECUTIVE,
            timeout_is_cold_start: false,
        }
    }
}

/// User-facing text placed in the assistant turn when a request does not produce an answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackText {
    /// No data arrived in time.
    pub timeout: String,
    /// The backend could not be reached or returned an error.
    pub unavailable: String,
    /// The backend is warming up and no automatic retry will happen.
    pub cold_start: String,
    /// The user aborted before any text arrived.
    pub interrupted: String,
    /// The backend answered with nothing.
    pub no_response: String,
}

impl Default for FallbackText {
    fn default() -> Self {
        Self {
            timeout: "The server is taking too long to respond. It may be waking up; please wait a minute and try again.".to_string(),
            unavailable: "Error connecting to the server.".to_string(),
            cold_start: "The server is starting up. Please wait a minute and try again.".to_string(),
            interrupted: "[interrupted]".to_string(),
            no_response: "No response".to_string(),
        }
    }
}
