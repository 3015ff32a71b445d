//! Output rendering for the chat front end.
//!
//! [`SessionController::run_until_idle`](crate::SessionController::run_until_idle) forwards
//! each session event to a [`Renderer`].  The default implementation writes to the terminal,
//! optionally styled with ANSI escape codes.

use std::io::{self, Stdout, Write};

/// ANSI escape code for dim text (used for error detail).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for yellow text (used for the countdown).
const ANSI_YELLOW: &str = "\x1b[33m";

/// ANSI escape code for red text (used for failures).
const ANSI_RED: &str = "\x1b[31m";

/// ANSI escape code to clear the current line after a carriage return.
const ANSI_CLEAR_LINE: &str = "\x1b[2K";

/// Trait for rendering session output.
pub trait Renderer: Send {
    /// Print a chunk of assistant text.
    ///
    /// Called incrementally as deltas arrive.
    fn print_text(&mut self, text: &str);

    /// Print the fallback message of a failed question along with the underlying error.
    fn print_failure(&mut self, fallback: &str, detail: &str);

    /// Print an error message.
    fn print_error(&mut self, error: &str);

    /// Print an informational message.
    fn print_info(&mut self, info: &str);

    /// Show the cold-start countdown.
    ///
    /// Called once per second with a strictly decreasing count.
    fn print_countdown(&mut self, remaining: u32);

    /// Called when the countdown ends and the question is sent again.
    fn print_retrying(&mut self);

    /// Called when the answer is interrupted by the user.
    fn print_interrupted(&mut self);

    /// Called when an answer is complete.
    fn finish_response(&mut self);
}

/// Plain text renderer with optional ANSI styling.
pub struct PlainTextRenderer {
    stdout: Stdout,
    use_color: bool,
    in_countdown: bool,
}

impl PlainTextRenderer {
    /// Creates a new PlainTextRenderer with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new PlainTextRenderer with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self {
            stdout: io::stdout(),
            use_color,
            in_countdown: false,
        }
    }

    /// Pushes partial lines to the terminal.
    fn flush(&mut self) {
        let _ = self.stdout.flush();
    }

    /// Ends the countdown line so the next output starts fresh.
    fn end_countdown(&mut self) {
        if self.in_countdown {
            println!();
            self.in_countdown = false;
        }
    }

    fn countdown_line(&self, remaining: u32) -> String {
        let plural = if remaining == 1 { "" } else { "s" };
        let line =
            format!("Server is waking up; retrying in {remaining} second{plural}...");
        if self.use_color {
            format!("\r{ANSI_CLEAR_LINE}{ANSI_YELLOW}{line}{ANSI_RESET}")
        } else {
            format!("\r{line}")
        }
    }
}

impl Default for PlainTextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for PlainTextRenderer {
    fn print_text(&mut self, text: &str) {
        self.end_countdown();
        print!("{text}");
        self.flush();
    }

    fn print_failure(&mut self, fallback: &str, detail: &str) {
        self.end_countdown();
        if self.use_color {
            print!("{ANSI_RED}{fallback}{ANSI_RESET}");
            eprint!("\n{ANSI_DIM}({detail}){ANSI_RESET}");
        } else {
            print!("{fallback}");
            eprint!("\n({detail})");
        }
        self.flush();
    }

    fn print_error(&mut self, error: &str) {
        self.end_countdown();
        if self.use_color {
            eprintln!("{ANSI_RED}Error: {error}{ANSI_RESET}");
        } else {
            eprintln!("Error: {error}");
        }
    }

    fn print_info(&mut self, info: &str) {
        self.end_countdown();
        println!("{info}");
    }

    fn print_countdown(&mut self, remaining: u32) {
        print!("{}", self.countdown_line(remaining));
        self.in_countdown = true;
        self.flush();
    }

    fn print_retrying(&mut self) {
        self.end_countdown();
        println!("Retrying...");
        self.flush();
    }

    fn print_interrupted(&mut self) {
        self.end_countdown();
        println!("\n[interrupted]");
        self.flush();
    }

    fn finish_response(&mut self) {
        self.end_countdown();
        println!();
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renderer_default_has_color() {
        let renderer = PlainTextRenderer::new();
        assert!(renderer.use_color);
    }

    #[test]
    fn renderer_without_color() {
        let renderer = PlainTextRenderer::with_color(false);
        assert!(!renderer.use_color);
    }

    #[test]
    fn countdown_line_rewrites_in_place() {
        let renderer = PlainTextRenderer::with_color(false);
        assert_eq!(
            renderer.countdown_line(30),
            "\rServer is waking up; retrying in 30 seconds..."
        );
        assert_eq!(
            renderer.countdown_line(1),
            "\rServer is waking up; retrying in 1 second..."
        );
    }

    #[test]
    fn countdown_line_with_color() {
        let renderer = PlainTextRenderer::new();
        let line = renderer.countdown_line(5);
        assert!(line.starts_with('\r'));
        assert!(line.contains(ANSI_YELLOW));
        assert!(line.ends_with(ANSI_RESET));
    }
}
