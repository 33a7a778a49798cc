//! Terminal rendering of a running job.
//!
//! One bar per display slot plus a job-wide bar pinned at the bottom:
//! - slot bars show the file currently owning the slot
//! - the job bar shows bytes (`ByteSum`) or files (`ItemCount`)
//! - skipped/failed files scroll above the bars
//!
//! The orchestrator drives a [`ProgressView`] from its own thread only.

use crate::orchestrator::JobReport;
use crate::types::AggregationMode;
use crossterm::style::{Color, Stylize};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

pub trait ProgressView {
    fn slot_opened(&mut self, _slot: usize, _name: &str, _total: u64) {}
    fn slot_advanced(&mut self, _slot: usize, _done: u64) {}
    fn slot_closed(&mut self, _slot: usize) {}
    fn aggregate(&mut self, _value: u64) {}
    /// A line worth keeping on screen (skips, failures).
    fn note(&mut self, _line: &str) {}
    fn finish(&mut self, _report: &JobReport) {}
}

/// Renders nothing.
pub struct NoopView;
impl ProgressView for NoopView {}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

pub struct BarView {
    multi: MultiProgress,
    overall: ProgressBar,
    slots: Vec<ProgressBar>,
    active: ProgressStyle,
    idle: ProgressStyle,
    mode: AggregationMode,
    start_time: Instant,
    show_files: bool,
}

impl BarView {
    /// `expected` is the job-wide target: total bytes in `ByteSum` mode,
    /// number of files in `ItemCount` mode. Zero means unknown.
    pub fn new(slots: usize, mode: AggregationMode, expected: u64, verbose: bool) -> Self {
        Self::with_target(ProgressDrawTarget::stderr(), slots, mode, expected, verbose)
    }

    pub fn hidden(slots: usize, mode: AggregationMode, expected: u64) -> Self {
        Self::with_target(ProgressDrawTarget::hidden(), slots, mode, expected, false)
    }

    fn with_target(
        target: ProgressDrawTarget,
        slots: usize,
        mode: AggregationMode,
        expected: u64,
        verbose: bool,
    ) -> Self {
        let multi = MultiProgress::with_draw_target(target);
        let active = style("  {spinner:.green} {msg:30} [{bar:30.cyan/blue}] {bytes}/{total_bytes}");
        let idle = style("  {msg}");

        let slots: Vec<_> = (0..slots)
            .map(|_| {
                let bar = multi.add(ProgressBar::new(0));
                bar.set_style(idle.clone());
                bar
            })
            .collect();

        let overall = multi.add(ProgressBar::new(expected));
        overall.set_style(match mode {
            AggregationMode::ByteSum => style(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.green/white}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            ),
            AggregationMode::ItemCount => {
                style("{spinner:.green} [{elapsed_precise}] [{bar:40.green/white}] {pos}/{len} files ({eta})")
            }
        });
        overall.enable_steady_tick(Duration::from_millis(120));

        Self {
            multi,
            overall,
            slots,
            active,
            idle,
            mode,
            start_time: Instant::now(),
            show_files: verbose,
        }
    }
}

impl ProgressView for BarView {
    fn slot_opened(&mut self, slot: usize, name: &str, total: u64) {
        if let Some(bar) = self.slots.get(slot) {
            bar.reset();
            bar.set_style(self.active.clone());
            bar.set_length(total);
            bar.set_message(name.to_string());
        }
    }

    fn slot_advanced(&mut self, slot: usize, done: u64) {
        if let Some(bar) = self.slots.get(slot) {
            bar.set_position(done);
        }
    }

    fn slot_closed(&mut self, slot: usize) {
        if let Some(bar) = self.slots.get(slot) {
            bar.set_style(self.idle.clone());
            bar.set_message(String::new());
        }
    }

    fn aggregate(&mut self, value: u64) {
        // Unknown or undershot targets grow with the job.
        if self.overall.length().is_some_and(|len| value > len) {
            self.overall.set_length(value);
        }
        self.overall.set_position(value);
    }

    fn note(&mut self, line: &str) {
        if self.show_files {
            let _ = self.multi.println(format!("  {}", line.with(Color::Cyan)));
        }
    }

    fn finish(&mut self, report: &JobReport) {
        for bar in &self.slots {
            bar.finish_and_clear();
        }
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let amount = match self.mode {
            AggregationMode::ByteSum => {
                let mb = report.aggregate as f64 / 1_048_576.0;
                let rate = if elapsed > 0.1 { mb / elapsed } else { 0.0 };
                format!("{mb:.1} MB, {rate:.1} MB/s")
            }
            AggregationMode::ItemCount => format!("{} files", report.aggregate),
        };
        let label = if report.failure.is_empty() {
            "Completed".with(Color::Green).bold()
        } else {
            "Finished with errors".with(Color::Red).bold()
        };
        self.overall.finish_with_message(String::new());
        let _ = self.multi.println(format!(
            "{} {} ok, {} skipped, {} failed ({}) in {:.1}s",
            label,
            report.success.len() - report.skipped(),
            report.skipped(),
            report.failure.len(),
            amount,
            elapsed
        ));
    }
}
