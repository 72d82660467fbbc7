use std::sync::Mutex;
use std::time::Duration;

use colored::*;
use fortress_core::orchestrator::{ProgressEvent, ProgressObserver};
use fortress_common::audit::PluginOutcome;
use fortress_common::lifecycle::StageStatus;
use indicatif::{ProgressBar, ProgressStyle};

static ACTIVE: Mutex<Option<ProgressBar>> = Mutex::new(None);

const TICKS: &[&str] = &[
    "▁▁▁▁▁",
    "▁▂▂▂▁",
    "▁▄▂▄▁",
    "▂▄▆▄▂",
    "▄▆█▆▄",
    "▂▄▆▄▂",
    "▁▄▂▄▁",
    "▁▂▂▂▁",
];

/// Shows a spinner until [`finish`] is called. Log lines are printed
/// above it.
pub fn start(message: impl Into<String>) {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.blue} {msg}") {
        pb.set_style(style.tick_strings(TICKS));
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message.into());

    if let Ok(mut active) = ACTIVE.lock() {
        if let Some(previous) = active.replace(pb) {
            previous.finish_and_clear();
        }
    }
}

pub fn set_message(message: impl Into<String>) {
    if let Ok(active) = ACTIVE.lock() {
        if let Some(pb) = active.as_ref() {
            pb.set_message(message.into());
        }
    }
}

pub fn finish() {
    if let Ok(mut active) = ACTIVE.lock() {
        if let Some(pb) = active.take() {
            pb.finish_and_clear();
        }
    }
}

/// Prints a line, above the spinner when one is running.
pub fn println(msg: &str) {
    let active = ACTIVE.lock().ok();
    match active.as_ref().and_then(|a| a.as_ref()) {
        Some(pb) => pb.println(msg),
        None => println!("{msg}"),
    }
}

/// Routes log output around the spinner.
pub struct SpinnerWriter;

impl std::io::Write for SpinnerWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = String::from_utf8_lossy(buf);
        println(msg.trim_end());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Mirrors run progress on the spinner line.
pub struct SpinnerObserver;

impl ProgressObserver for SpinnerObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Run { to, .. } => set_message(format!("run {}", to.to_string().bold())),
            ProgressEvent::Stage { stage, to, .. } => {
                let status = match to {
                    StageStatus::Succeeded => to.to_string().green(),
                    StageStatus::Failed => to.to_string().red(),
                    StageStatus::Skipped => to.to_string().yellow(),
                    _ => to.to_string().normal(),
                };
                set_message(format!("{} stage {status}", stage.as_str().bold()));
            }
            ProgressEvent::Plugin { plugin, outcome, stage, .. } => {
                let outcome = match outcome {
                    PluginOutcome::Succeeded => outcome.to_string().green(),
                    PluginOutcome::Failed | PluginOutcome::Cancelled => outcome.to_string().red(),
                    _ => outcome.to_string().yellow(),
                };
                set_message(format!("{stage}: {} {outcome}", plugin.bold()));
            }
        }
    }
}
