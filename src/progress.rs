//! Cargo-style progress display
//!
//! Operations scroll above a single status line that stays at the bottom and
//! follows the size and speed events of the running job.

use crossterm::{
    cursor,
    style::{Color, Stylize},
    ExecutableCommand,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::time::{Duration, Instant};

use crate::job::{JobEvent, JobId};
use crate::protocol::timeouts::PROGRESS_TICK_MS;

fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / 1_048_576.0
}

pub struct TransferProgress {
    spinner: ProgressBar,
    start_time: Instant,
    stage: String,
    top: JobId,
    total: u64,
    processed: u64,
    speed: Option<u64>,
    visible: bool,
}

impl TransferProgress {
    /// Status line for job `top`; `visible = false` keeps everything quiet.
    pub fn new(stage: &str, top: JobId, visible: bool) -> Self {
        let spinner = if visible {
            let _ = io::stderr().execute(cursor::Hide);
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
            );
            spinner.enable_steady_tick(Duration::from_millis(PROGRESS_TICK_MS));
            spinner
        } else {
            ProgressBar::hidden()
        };
        Self {
            spinner,
            start_time: Instant::now(),
            stage: stage.to_string(),
            top,
            total: 0,
            processed: 0,
            speed: None,
            visible,
        }
    }

    /// Print an operation above the status line
    pub fn print_op(&self, operation: &str, target: &str) {
        if !self.visible {
            return;
        }
        self.spinner.suspend(|| {
            eprintln!("  {} {}", operation.with(Color::Green).bold(), target.with(Color::Cyan));
        });
    }

    /// Feed one job event. Sizes may come from any subjob; processed bytes
    /// count only when reported by the job the bar is for.
    pub fn on_event(&mut self, event: &JobEvent) {
        match event {
            JobEvent::TotalSize { size, .. } => self.total = self.total.max(*size),
            JobEvent::ProcessedSize { job, size } if *job == self.top => self.processed = *size,
            JobEvent::Speed { job, bytes_per_sec } if *job == self.top => self.speed = Some(*bytes_per_sec),
            JobEvent::Redirection { url, .. } => self.print_op("Redirected", url),
            _ => return,
        }
        self.refresh();
    }

    fn refresh(&self) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let speed = match self.speed {
            Some(bps) => format!(" @ {:.1} MB/s", megabytes(bps)),
            None if elapsed > 0.1 => format!(" @ {:.1} MB/s", megabytes(self.processed) / elapsed),
            None => String::new(),
        };
        let msg = if self.total > 0 {
            format!(
                "{} {:.1}/{:.1} MB in {:.1}s{}",
                self.stage.as_str().with(Color::Green).bold(),
                megabytes(self.processed),
                megabytes(self.total),
                elapsed,
                speed
            )
        } else {
            format!(
                "{} {:.1} MB in {:.1}s{}",
                self.stage.as_str().with(Color::Green).bold(),
                megabytes(self.processed),
                elapsed,
                speed
            )
        };
        self.spinner.set_message(msg);
    }

    pub fn finish_success(&self) {
        let elapsed = self.start_time.elapsed().as_secs_f64().max(0.001);
        self.spinner.finish_with_message(format!(
            "{} {:.1} MB in {:.1}s ({:.1} MB/s)",
            "Completed".with(Color::Green).bold(),
            megabytes(self.processed),
            elapsed,
            megabytes(self.processed) / elapsed
        ));
        self.cleanup();
    }

    pub fn finish_error(&self, msg: &str) {
        self.spinner
            .finish_with_message(format!("{} {}", "Failed".with(Color::Red).bold(), msg));
        self.cleanup();
    }

    fn cleanup(&self) {
        if self.visible {
            let _ = io::stderr().execute(cursor::Show);
        }
    }
}

impl Drop for TransferProgress {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_only_top_job_progress() {
        let mut p = TransferProgress::new("Copying", JobId(1), false);
        p.on_event(&JobEvent::TotalSize { job: JobId(2), size: 100 });
        p.on_event(&JobEvent::ProcessedSize { job: JobId(3), size: 70 });
        p.on_event(&JobEvent::ProcessedSize { job: JobId(1), size: 40 });
        assert_eq!(p.total, 100);
        assert_eq!(p.processed, 40);
    }
}
