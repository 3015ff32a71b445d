//! Configuration types for the chat REPL.
//!
//! Values are layered, lowest precedence first: built-in defaults, a YAML file named with
//! `--config`, the `PARLEY_BASE_URL` environment variable, and command-line flags.

use std::path::Path;
use std::time::Duration;

use arrrg_derive::CommandLine;
use serde::Deserialize;
use url::Url;

use crate::config::{ColdStartConfig, DEFAULT_COLD_START_STATUSES, DispatchConfig, FallbackText};
use crate::error::{Error, Result};
use crate::session::SessionOptions;

/// Backend used when nothing else is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Environment variable consulted for the backend URL.
pub const BASE_URL_ENV: &str = "PARLEY_BASE_URL";

/// First assistant turn shown in a new session.
pub const DEFAULT_GREETING: &str = "Hello! I am your Payroll Assistant. How can I help you today?";

/// Command-line arguments for the parley-chat tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct ChatArgs {
    /// Backend base URL.
    #[arrrg(optional, "Backend base URL (default: $PARLEY_BASE_URL or http://localhost:8000)", "URL")]
    pub base_url: Option<String>,

    /// Seconds to wait for the first byte of an answer.
    #[arrrg(optional, "Seconds to wait for the server to start answering (default: 60)", "SECS")]
    pub timeout_secs: Option<u64>,

    /// Seconds allowed for a whole answer.
    #[arrrg(optional, "Seconds allowed for a whole answer (default: unlimited)", "SECS")]
    pub total_timeout_secs: Option<u64>,

    /// Length of the cold-start countdown.
    #[arrrg(optional, "Seconds to wait before retrying a sleeping server (default: 30)", "SECS")]
    pub cold_start_secs: Option<u32>,

    /// Show "wait and retry" text instead of retrying automatically.
    #[arrrg(flag, "Do not retry automatically while the server wakes up")]
    pub no_auto_retry: bool,

    /// Replace the greeting.
    #[arrrg(optional, "Greeting shown when the chat starts", "TEXT")]
    pub greeting: Option<String>,

    /// Start without a greeting.
    #[arrrg(flag, "Start without a greeting")]
    pub no_greeting: bool,

    /// YAML configuration file.
    #[arrrg(optional, "YAML configuration file", "PATH")]
    pub config: Option<String>,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,
}

/// Contents of a YAML configuration file.  Every key is optional.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub total_timeout_secs: Option<u64>,
    pub cold_start_statuses: Option<Vec<u16>>,
    pub cold_start: Option<ColdStartConfig>,
    pub fallback: Option<FallbackText>,
    pub greeting: Option<String>,
    pub color: Option<bool>,
}

/// Resolved configuration for a chat session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Backend base URL.  Parsed when the session is built.
    pub base_url: String,

    /// Deadline for the first byte of an answer.
    pub timeout: Duration,

    /// Deadline for a whole answer.
    pub total_timeout: Option<Duration>,

    /// Statuses that mean the backend is still starting.
    pub cold_start_statuses: Vec<u16>,

    /// Cold-start countdown policy.
    pub cold_start: ColdStartConfig,

    /// Text shown when a question fails.
    pub fallback: FallbackText,

    /// First assistant turn, if any.
    pub greeting: Option<String>,

    /// Whether to use ANSI colors and styles in output.
    pub use_color: bool,
}

impl ChatConfig {
    /// Creates a new ChatConfig with default values.
    ///
    /// Defaults:
    /// - Base URL: http://localhost:8000
    /// - Timeout: 60 seconds to first byte, no overall limit
    /// - Cold start: automatic retry after 30 seconds, at most 3 times
    /// - Greeting: the payroll assistant welcome
    /// - Color: enabled
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: crate::config::DEFAULT_TIMEOUT,
            total_timeout: None,
            cold_start_statuses: DEFAULT_COLD_START_STATUSES.to_vec(),
            cold_start: ColdStartConfig::default(),
            fallback: FallbackText::default(),
            greeting: Some(DEFAULT_GREETING.to_string()),
            use_color: true,
        }
    }

    /// Builds the configuration from `args`, the YAML file it names, and the environment.
    pub fn load(args: ChatArgs) -> Result<Self> {
        let config = match args.config.as_deref() {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::new(),
        };
        let config = match std::env::var(BASE_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => config.with_base_url(url.trim()),
            _ => config,
        };
        Ok(config.with_args(args))
    }

    /// Reads a YAML configuration file on top of the defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::io(format!("Failed to read config file {}", path.display()), e)
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Parses YAML configuration on top of the defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(yaml)?;
        Ok(Self::new().with_file(file))
    }

    fn with_file(mut self, file: ConfigFile) -> Self {
        if let Some(base_url) = file.base_url {
            self.base_url = base_url;
        }
        if let Some(secs) = file.timeout_secs {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.total_timeout_secs {
            self.total_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(statuses) = file.cold_start_statuses {
            self.cold_start_statuses = statuses;
        }
        if let Some(cold_start) = file.cold_start {
            self.cold_start = cold_start;
        }
        if let Some(fallback) = file.fallback {
            self.fallback = fallback;
        }
        if let Some(greeting) = file.greeting {
            self.greeting = (!greeting.is_empty()).then_some(greeting);
        }
        if let Some(color) = file.color {
            self.use_color = color;
        }
        self
    }

    /// Applies command-line flags on top of this configuration.
    pub fn with_args(mut self, args: ChatArgs) -> Self {
        if let Some(base_url) = args.base_url {
            self.base_url = base_url;
        }
        if let Some(secs) = args.timeout_secs {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = args.total_timeout_secs {
            self.total_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = args.cold_start_secs {
            self.cold_start.countdown_secs = secs;
        }
        if args.no_auto_retry {
            self.cold_start.auto_retry = false;
        }
        if let Some(greeting) = args.greeting {
            self.greeting = Some(greeting);
        }
        if args.no_greeting {
            self.greeting = None;
        }
        if args.no_color {
            self.use_color = false;
        }
        self
    }

    /// Sets the backend base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the first-byte timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the whole-answer timeout.
    pub fn with_total_timeout(mut self, total_timeout: Option<Duration>) -> Self {
        self.total_timeout = total_timeout;
        self
    }

    /// Sets the cold-start policy.
    pub fn with_cold_start(mut self, cold_start: ColdStartConfig) -> Self {
        self.cold_start = cold_start;
        self
    }

    /// Sets the greeting.  `None` starts the session empty.
    pub fn with_greeting(mut self, greeting: Option<String>) -> Self {
        self.greeting = greeting;
        self
    }

    /// Disables ANSI color output.
    pub fn without_color(mut self) -> Self {
        self.use_color = false;
        self
    }

    /// Returns the dispatcher configuration.  Fails if the base URL does not parse.
    pub fn dispatch_config(&self) -> Result<DispatchConfig> {
        let base_url = Url::parse(&self.base_url).map_err(|e| {
            Error::url(format!("Invalid base URL {:?}: {e}", self.base_url), Some(e))
        })?;
        Ok(DispatchConfig::new(base_url)
            .with_timeout(self.timeout)
            .with_total_timeout(self.total_timeout)
            .with_cold_start_statuses(self.cold_start_statuses.clone()))
    }

    /// Returns the session options.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            cold_start: self.cold_start.clone(),
            fallback: self.fallback.clone(),
            greeting: self.greeting.clone(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl From<ChatArgs> for ChatConfig {
    fn from(args: ChatArgs) -> Self {
        ChatConfig::new().with_args(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ChatConfig::new();
        assert_eq!(config.base_url, "http://localhost:8000");
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert!(config.total_timeout.is_none());
        assert!(config.cold_start.auto_retry);
        assert_eq!(config.cold_start.countdown_secs, 30);
        assert_eq!(config.greeting.as_deref(), Some(DEFAULT_GREETING));
        assert!(config.use_color);
    }

    #[test]
    fn config_from_args_defaults() {
        let config = ChatConfig::from(ChatArgs::default());
        assert_eq!(config, ChatConfig::new());
    }

    #[test]
    fn config_from_args_custom() {
        let args = ChatArgs {
            base_url: Some("https://payroll.example.com".to_string()),
            timeout_secs: Some(30),
            total_timeout_secs: Some(120),
            cold_start_secs: Some(10),
            no_auto_retry: true,
            greeting: None,
            no_greeting: true,
            config: None,
            no_color: true,
        };
        let config = ChatConfig::from(args);
        assert_eq!(config.base_url, "https://payroll.example.com");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.total_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.cold_start.countdown_secs, 10);
        assert!(!config.cold_start.auto_retry);
        assert!(config.greeting.is_none());
        assert!(!config.use_color);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let config = ChatConfig::from_yaml_str(
            r#"
base_url: https://payroll.example.com/api
timeout_secs: 30
cold_start_statuses: [503]
cold_start:
  auto_retry: false
fallback:
  unavailable: "Error: Backend not reachable"
greeting: ""
"#,
        )
        .unwrap();
        assert_eq!(config.base_url, "https://payroll.example.com/api");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.cold_start_statuses, vec![503]);
        assert!(!config.cold_start.auto_retry);
        assert_eq!(config.cold_start.countdown_secs, 30);
        assert_eq!(config.fallback.unavailable, "Error: Backend not reachable");
        assert_eq!(config.fallback.no_response, "No response");
        assert!(config.greeting.is_none());
    }

    #[test]
    fn yaml_rejects_unknown_keys() {
        assert!(ChatConfig::from_yaml_str("base_uri: http://x\n").is_err());
    }

    #[test]
    fn flags_override_yaml() {
        let config = ChatConfig::from_yaml_str("timeout_secs: 30\ncolor: true\n")
            .unwrap()
            .with_args(ChatArgs {
                timeout_secs: Some(90),
                no_color: true,
                ..ChatArgs::default()
            });
        assert_eq!(config.timeout, Duration::from_secs(90));
        assert!(!config.use_color);
    }

    #[test]
    fn dispatch_config_parses_url() {
        let config = ChatConfig::new()
            .with_base_url("https://payroll.example.com")
            .with_timeout(Duration::from_secs(30));
        let dispatch = config.dispatch_config().unwrap();
        assert_eq!(
            dispatch.chat_url().unwrap().as_str(),
            "https://payroll.example.com/chat"
        );
        assert_eq!(dispatch.timeout, Duration::from_secs(30));

        let err = ChatConfig::new()
            .with_base_url("not a url")
            .dispatch_config()
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Other);
    }

    #[test]
    fn session_options_carry_greeting() {
        let options = ChatConfig::new()
            .with_greeting(Some("Hi".to_string()))
            .session_options();
        assert_eq!(options.greeting.as_deref(), Some("Hi"));
    }

    #[test]
    fn builder_turns_off_color_and_retry() {
        let config = ChatConfig::new().without_color().with_cold_start(ColdStartConfig {
            auto_retry: false,
            ..ColdStartConfig::default()
        });
        assert!(!config.use_color);
        assert!(!config.session_options().cold_start.auto_retry);
    }
}
