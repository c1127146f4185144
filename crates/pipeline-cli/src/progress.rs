//! Progress reporting module with TTY detection.
//!
//! Shows a live progress bar while stages run when stdout is a TTY, and
//! falls back to plain line-per-event output otherwise (piped output,
//! CI logs).

use std::time::Instant;

use atty::Stream;
use indicatif::{ProgressBar, ProgressStyle};

/// Detects whether stdout is connected to a TTY.
pub fn is_tty() -> bool {
    atty::is(Stream::Stdout)
}

/// Progress reporter that shows a progress bar in TTY mode and falls back
/// to simple text output otherwise.
pub struct StageProgressReporter {
    is_tty: bool,
    total_stages: usize,
    current_stage: usize,
    current_name: String,
    progress_bar: Option<ProgressBar>,
    start_time: Instant,
}

impl StageProgressReporter {
    /// Creates a new progress reporter for a run with `total_stages` stages.
    pub fn new(total_stages: usize) -> Self {
        let is_tty = is_tty();
        let progress_bar = if is_tty {
            let pb = ProgressBar::new(total_stages as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        Self {
            is_tty,
            total_stages,
            current_stage: 0,
            current_name: String::new(),
            progress_bar,
            start_time: Instant::now(),
        }
    }

    /// Creates a silent progress reporter that always uses non-TTY mode.
    #[allow(dead_code)]
    pub fn silent(total_stages: usize) -> Self {
        Self {
            is_tty: false,
            total_stages,
            current_stage: 0,
            current_name: String::new(),
            progress_bar: None,
            start_time: Instant::now(),
        }
    }

    /// Marks `name` as the stage currently running, at 1-indexed `index`.
    pub fn set_stage(&mut self, index: usize, name: &str) {
        self.current_stage = index;
        self.current_name = name.to_string();

        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                let elapsed = self.start_time.elapsed();
                let msg = format!(
                    "[{}/{}] Running stage {}... ({elapsed:?})",
                    self.current_stage, self.total_stages, self.current_name
                );
                pb.set_message(msg);
                pb.set_position((self.current_stage - 1) as u64);
            }
        } else {
            let elapsed = self.start_time.elapsed();
            eprintln!(
                "[{}/{}] Running stage {}... ({elapsed:?})",
                self.current_stage, self.total_stages, self.current_name
            );
        }
    }

    /// Marks the current stage as completed.
    #[allow(clippy::collapsible_if)]
    #[allow(dead_code)]
    pub fn finish_stage(&mut self) {
        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                pb.inc(1);
            }
        }
    }

    /// Finishes the progress reporting.
    pub fn finish(self) {
        if self.is_tty {
            if let Some(pb) = self.progress_bar {
                let elapsed = self.start_time.elapsed();
                let msg = format!(
                    "Completed {} stages in {:?}",
                    self.total_stages, elapsed
                );
                pb.set_message(msg);
                pb.finish();
            }
        } else {
            let elapsed = self.start_time.elapsed();
            eprintln!(
                "Completed {}/{} stages in {:?}",
                self.total_stages, self.total_stages, elapsed
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_tty_returns_bool() {
        let result = is_tty();
        assert!(matches!(result, true | false));
    }

    #[test]
    fn test_silent_reporter_disables_tty() {
        let reporter = StageProgressReporter::silent(3);
        assert!(!reporter.is_tty);
        assert!(reporter.progress_bar.is_none());
    }

    #[test]
    fn test_set_stage_updates_state() {
        let mut reporter = StageProgressReporter::silent(3);
        reporter.set_stage(1, "build");
        assert_eq!(reporter.current_stage, 1);
        assert_eq!(reporter.current_name, "build");
    }

    #[test]
    fn test_finish_stage_increments() {
        let mut reporter = StageProgressReporter::silent(3);
        reporter.set_stage(1, "build");
        reporter.finish_stage();
    }

    #[test]
    fn test_finish_completes_without_panic() {
        let reporter = StageProgressReporter::silent(3);
        reporter.finish();
    }
}
