//! Terminal progress output.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Spinner shown while the cluster boots.
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    /// Start spinning with `message`.
    pub fn start(message: impl Into<String>) -> Self {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        bar.set_message(message.into());
        bar.enable_steady_tick(TICK_INTERVAL);
        Self { bar }
    }

    /// A spinner that draws nothing. Used when output is not a terminal
    /// or logs are structured.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn success(self, message: impl Into<String>) {
        self.bar
            .finish_with_message(format!("✓ {}", message.into()));
    }

    pub fn fail(self, message: impl Into<String>) {
        self.bar
            .abandon_with_message(format!("✗ {}", message.into()));
    }
}
