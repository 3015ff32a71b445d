//! Interactive chat with a payroll question/answer backend.
//!
//! # Usage
//!
//! ```bash
//! # Talk to a backend on localhost:8000
//! parley-chat
//!
//! # Talk to a hosted backend that may be asleep
//! parley-chat --base-url https://payroll.example.com --cold-start-secs 45
//!
//! # Load settings from a file; flags still win
//! parley-chat --config parley.yaml --no-color
//! ```
//!
//! Set `PARLEY_LOG` (e.g. `PARLEY_LOG=parley=debug`) to see request logging on stderr.
//!
//! # Commands
//!
//! - `/help` - Show available commands
//! - `/history` - Show the conversation so far
//! - `/timeout <secs>` - Change how long to wait for the server
//! - `/retry on|off` - Toggle automatic retry while the server wakes up
//! - `/stats` - Show session statistics
//! - `/quit` - Exit the application

use std::sync::Arc;
use std::time::Duration;

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use parley::chat::{
    ChatArgs, ChatCommand, ChatConfig, PlainTextRenderer, Renderer, help_text, parse_command,
};
use parley::{HttpTransport, Role, SessionController, Submission};

/// Environment variable holding the log filter.
const LOG_ENV: &str = "PARLEY_LOG";

fn setup_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Main entry point for the parley-chat application.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (args, _) = ChatArgs::from_command_line_relaxed("parley-chat [OPTIONS]");
    setup_logging();

    let config = ChatConfig::load(args)?;
    let transport = Arc::new(HttpTransport::new()?);
    let mut session = SessionController::new(
        transport,
        config.dispatch_config()?,
        config.session_options(),
    );
    let mut renderer = PlainTextRenderer::with_color(config.use_color);
    let mut rl = DefaultEditor::new()?;

    // Ctrl+C while an answer is in progress stops that answer.
    let interrupter = session.interrupter();
    ctrlc::set_handler(move || {
        interrupter.interrupt();
    })?;

    println!("Payroll chat (server: {})", config.base_url);
    println!("Type /help for commands, /quit to exit\n");
    for turn in session.log() {
        println!("Assistant: {}\n", turn.text);
    }

    loop {
        let readline = rl.readline("You: ");

        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                if let Some(cmd) = parse_command(line) {
                    match cmd {
                        ChatCommand::Quit => {
                            println!("Goodbye!");
                            break;
                        }
                        ChatCommand::Help => {
                            for line in help_text().lines() {
                                println!("    {}", line);
                            }
                        }
                        ChatCommand::History => print_history(&session),
                        ChatCommand::Stats => print_stats(&session),
                        ChatCommand::ShowConfig => print_config(&session),
                        ChatCommand::Timeout(secs) => {
                            session.dispatch_config_mut().timeout = Duration::from_secs(secs);
                            renderer.print_info(&format!("Timeout set to {secs} seconds."));
                        }
                        ChatCommand::Retry(on) => {
                            session.cold_start_config_mut().auto_retry = on;
                            if on {
                                renderer.print_info("Automatic retry enabled.");
                            } else {
                                renderer.print_info("Automatic retry disabled.");
                            }
                        }
                        ChatCommand::Invalid(message) => {
                            renderer.print_error(&message);
                        }
                    }
                    continue;
                }

                match session.submit(line) {
                    Submission::Accepted => {
                        println!("Assistant:");
                        session.run_until_idle(&mut renderer).await;
                    }
                    Submission::Busy => renderer.print_error("Still answering; please wait."),
                    Submission::Empty => {}
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl+C at prompt - soft interrupt
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                // Ctrl+D - exit
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                renderer.print_error(&format!("Input error: {}", err));
                break;
            }
        }
    }

    session.shutdown();
    Ok(())
}

fn print_history(session: &SessionController) {
    if session.log().is_empty() {
        println!("    (no messages yet)");
        return;
    }
    for turn in session.log() {
        let label = match turn.role {
            Role::User => "You",
            Role::Assistant => "Assistant",
        };
        println!("    {label}: {}", turn.text);
    }
}

fn print_stats(session: &SessionController) {
    let stats = session.stats();
    println!("    Session Statistics:");
    println!("      Messages: {}", session.log().len());
    println!("      Questions: {}", stats.turns);
    println!("      Requests: {}", stats.requests);
    println!("      Failures: {}", stats.failures);
    println!(
        "      Cold starts: {} ({} retries)",
        stats.cold_starts, stats.retries
    );
    println!("      Malformed records skipped: {}", stats.malformed);
}

fn print_config(session: &SessionController) {
    let dispatch = session.dispatch_config();
    let cold_start = session.cold_start_config();
    println!("    Current Configuration:");
    println!("      Server: {}", dispatch.base_url);
    println!("      Timeout: {}s", dispatch.timeout.as_secs());
    match dispatch.total_timeout {
        Some(total) => println!("      Total timeout: {}s", total.as_secs()),
        None => println!("      Total timeout: (none)"),
    }
    println!(
        "      Cold-start statuses: {}",
        dispatch
            .cold_start_statuses
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "      Automatic retry: {}",
        if cold_start.auto_retry { "on" } else { "off" }
    );
    println!("      Countdown: {}s", cold_start.countdown_secs);
    println!("      Max consecutive retries: {}", cold_start.max_consecutive);
}
