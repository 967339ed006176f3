//! Subcommand implementations.

pub mod init;
pub mod log;
pub mod pull;
pub mod resolve;
pub mod stage;
pub mod status;
pub mod style;
pub mod submit;

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Spinner shown while a long-running operation is in flight.
pub fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}
