//! Progress bar utilities for long-running operations
//!
//! Visual feedback while the optimizer works through its batches and while the
//! CLI loads data, using the indicatif crate.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Progress bar for optimizer trials
pub struct OptimizationProgress {
    pub progress: ProgressBar,
    pub total_trials: usize,
}

impl OptimizationProgress {
    /// Create a progress bar; a hidden one when `visible` is false
    pub fn new(total_trials: usize, visible: bool) -> Self {
        let progress = if visible {
            ProgressBar::new(total_trials as u64)
        } else {
            ProgressBar::hidden()
        };
        progress.set_style(bar_style(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})\n{msg}",
        ));

        Self { progress, total_trials }
    }

    /// Grow the bar when a new phase adds trials
    pub fn extend(&mut self, additional: usize) {
        self.total_trials += additional;
        self.progress.set_length(self.total_trials as u64);
    }

    /// Update progress with trials done and the best score so far
    pub fn update(&self, done: usize, best_score: Option<f64>, phase: &str) {
        self.progress.set_position(done as u64);
        match best_score {
            Some(score) => self
                .progress
                .set_message(format!("🎯 Best Score: {:.4} | Phase: {}", score, phase)),
            None => self.progress.set_message(format!("Phase: {}", phase)),
        }
    }

    /// Mark optimization as complete
    pub fn finish(&self, best_score: Option<f64>) {
        match best_score {
            Some(score) => self.progress.finish_with_message(format!(
                "✅ Optimization complete! Best score: {:.4}",
                score
            )),
            None => self
                .progress
                .finish_with_message("✅ Optimization complete, no successful trials"),
        }
    }

    /// Mark optimization as stopped early
    pub fn abandon(&self, reason: &str) {
        self.progress.abandon_with_message(format!("⏸️  Stopped: {}", reason));
    }
}

/// Spinner for quick operations
pub struct Spinner {
    pub spinner: ProgressBar,
}

impl Spinner {
    pub fn new(message: &str) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner.set_message(message.to_string());

        Self { spinner }
    }

    pub fn finish(&self, message: &str) {
        self.spinner.finish_with_message(format!("✅ {}", message));
    }

    pub fn finish_with_error(&self, message: &str) {
        self.spinner.finish_with_message(format!("❌ {}", message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimization_progress() {
        let mut progress = OptimizationProgress::new(12, false);
        progress.update(4, Some(0.75), "coarse");
        progress.extend(8);
        assert_eq!(progress.total_trials, 20);
        progress.finish(Some(0.85));
    }

    #[test]
    fn test_spinner() {
        let spinner = Spinner::new("Loading candles...");
        std::thread::sleep(Duration::from_millis(50));
        spinner.finish("Loaded");
    }
}
