//! Progress indicators with CI fallback

use super::context::UiContext;
use crate::build::engine::StepEvent;
use crate::build::report::CacheStatus;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    /// Start the spinner; a no-op outside a terminal
    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop(message);
        } else if !self.interactive {
            println!("{} {}", style("[OK]").green(), message);
        }
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.error(message);
        } else if !self.interactive {
            println!("{} {}", style("[FAIL]").red(), message);
        }
    }
}

/// Progress bar fed by the engine's step events.
///
/// Only drawn in interactive mode; the final report covers CI output.
pub struct BuildProgress {
    bar: Option<ProgressBar>,
}

impl BuildProgress {
    pub fn new(ctx: &UiContext, total_steps: usize) -> Self {
        if !ctx.use_fancy_output() {
            return Self { bar: None };
        }

        let bar = ProgressBar::new(total_steps as u64);
        if let Ok(template) = ProgressStyle::default_bar().template(
            "  {spinner:.blue} Building  {bar:20.blue/dim} {pos}/{len} {msg:.dim}  {elapsed:.dim}",
        ) {
            bar.set_style(
                template
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
                    .progress_chars("━╸─"),
            );
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar: Some(bar) }
    }

    /// Advance by one executed step
    pub fn on_event(&self, event: &StepEvent) {
        if let Some(ref bar) = self.bar {
            bar.inc(1);
            bar.set_message(describe_event(event));
        }
    }

    /// Finish and clear the progress bar
    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

fn describe_event(event: &StepEvent) -> String {
    let status = match event.status {
        CacheStatus::Hit => "cached",
        CacheStatus::Miss => "built",
    };
    format!(
        "{} #{} {} {}",
        event.stage, event.index, event.kind, status
    )
}
