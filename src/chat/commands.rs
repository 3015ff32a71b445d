//! Slash command parsing for the chat REPL.
//!
//! Input that starts with `/` controls the session instead of being sent as a question.

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Display help information.
    Help,

    /// Exit the chat application.
    Quit,

    /// Print the conversation so far.
    History,

    /// Display session statistics.
    Stats,

    /// Show the current configuration.
    ShowConfig,

    /// Set the first-byte timeout, in seconds.
    Timeout(u64),

    /// Turn automatic retry after a cold start on or off.
    Retry(bool),

    /// Report a parsing error back to the caller.
    Invalid(String),
}

/// Parses user input for slash commands.
///
/// Returns `Some(ChatCommand)` if the input is a command, or `None` if it is a question.
///
/// # Examples
///
/// ```
/// # use parley::chat::parse_command;
/// assert!(parse_command("/quit").is_some());
/// assert!(parse_command("/timeout 30").is_some());
/// assert!(parse_command("What is net pay?").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next()?.to_lowercase();
    let argument = parts.next().map(|s| s.trim()).filter(|s| !s.is_empty());

    let result = match command.as_str() {
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        "history" => ChatCommand::History,
        "stats" | "status" => ChatCommand::Stats,
        "config" => ChatCommand::ShowConfig,
        "timeout" => match argument {
            Some(arg) => match arg.parse::<u64>() {
                Ok(secs) if secs > 0 => ChatCommand::Timeout(secs),
                _ => ChatCommand::Invalid("/timeout expects a positive number of seconds".to_string()),
            },
            None => ChatCommand::Invalid("/timeout requires a value".to_string()),
        },
        "retry" => match argument.and_then(parse_on_off) {
            Some(value) => ChatCommand::Retry(value),
            None => ChatCommand::Invalid("/retry expects 'on' or 'off'".to_string()),
        },
        _ => ChatCommand::Invalid(format!("Unknown command: /{}", command)),
    };

    Some(result)
}

fn parse_on_off(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "on" | "true" | "yes" => Some(true),
        "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Returns help text describing available commands.
pub fn help_text() -> &'static str {
    r#"Available commands:
  /history               Show the conversation so far
  /timeout <secs>        Set how long to wait for the server to answer
  /retry on|off          Retry automatically while the server wakes up
  /stats                 Show session statistics
  /config                Show current configuration
  /help                  Show this help message
  /quit                  Exit the chat

Press Ctrl+C while an answer is arriving to stop it."#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_quit_commands() {
        assert_eq!(parse_command("/quit"), Some(ChatCommand::Quit));
        assert_eq!(parse_command("/exit"), Some(ChatCommand::Quit));
        assert_eq!(parse_command("/q"), Some(ChatCommand::Quit));
        assert_eq!(parse_command("  /QUIT  "), Some(ChatCommand::Quit));
    }

    #[test]
    fn parse_timeout() {
        assert_eq!(parse_command("/timeout 30"), Some(ChatCommand::Timeout(30)));
        assert_eq!(
            parse_command("/timeout   90  "),
            Some(ChatCommand::Timeout(90))
        );
        assert!(matches!(
            parse_command("/timeout"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("requires")
        ));
        assert!(matches!(
            parse_command("/timeout 0"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("positive")
        ));
        assert!(matches!(
            parse_command("/timeout soon"),
            Some(ChatCommand::Invalid(_))
        ));
    }

    #[test]
    fn parse_retry_toggle() {
        assert_eq!(parse_command("/retry on"), Some(ChatCommand::Retry(true)));
        assert_eq!(parse_command("/retry off"), Some(ChatCommand::Retry(false)));
        assert!(matches!(
            parse_command("/retry maybe"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("expects")
        ));
    }

    #[test]
    fn parse_informational_commands() {
        assert_eq!(parse_command("/help"), Some(ChatCommand::Help));
        assert_eq!(parse_command("/history"), Some(ChatCommand::History));
        assert_eq!(parse_command("/stats"), Some(ChatCommand::Stats));
        assert_eq!(parse_command("/config"), Some(ChatCommand::ShowConfig));
    }

    #[test]
    fn unknown_command() {
        assert_eq!(
            parse_command("/clear"),
            Some(ChatCommand::Invalid("Unknown command: /clear".to_string()))
        );
    }

    #[test]
    fn non_commands() {
        assert_eq!(parse_command("What is net pay?"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("  "), None);
    }

    #[test]
    fn help_text_lists_commands() {
        let help = help_text();
        assert!(help.contains("/quit"));
        assert!(help.contains("/timeout"));
        assert!(help.contains("/retry"));
        assert!(help.contains("/history"));
    }
}
