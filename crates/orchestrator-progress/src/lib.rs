//! CLI progress reporting, distinct from the structured log stream:
//! human-facing feedback for the `orchestrator` binary's foreground
//! commands (submitting a pipeline, running the dispatcher loop).

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// What the CLI tells the user about as work happens. Implementations
/// decide how (or whether) to render it; a no-op implementation backs
/// non-interactive / scripted invocations.
pub trait ProgressReporter: Send + Sync {
    fn run_started(&self, run_id: &str, pipeline_name: &str);
    fn node_started(&self, node_id: &str);
    fn node_finished(&self, node_id: &str, succeeded: bool);
    fn run_finished(&self, run_id: &str, status: &str);
    fn dispatcher_tick(&self, fired: usize, skipped: usize);
    fn message(&self, text: &str);
}

/// A `ProgressBar`-backed reporter for interactive terminals.
pub struct TerminalProgressReporter {
    bar: ProgressBar,
}

impl TerminalProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    /// Whether stdout looks like an interactive terminal. Callers use this
    /// to choose between [`TerminalProgressReporter`] and [`SilentProgressReporter`].
    pub fn stdout_is_tty() -> bool {
        atty::is(atty::Stream::Stdout)
    }
}

impl Default for TerminalProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for TerminalProgressReporter {
    fn run_started(&self, run_id: &str, pipeline_name: &str) {
        self.bar.set_message(format!("run {run_id} ({pipeline_name}) started"));
    }

    fn node_started(&self, node_id: &str) {
        self.bar.set_message(format!("node {node_id} running"));
    }

    fn node_finished(&self, node_id: &str, succeeded: bool) {
        let verb = if succeeded { "succeeded" } else { "failed" };
        self.bar.set_message(format!("node {node_id} {verb}"));
    }

    fn run_finished(&self, run_id: &str, status: &str) {
        self.bar.finish_with_message(format!("run {run_id} {status}"));
    }

    fn dispatcher_tick(&self, fired: usize, skipped: usize) {
        self.bar.set_message(format!("tick: fired {fired}, skipped {skipped}"));
    }

    fn message(&self, text: &str) {
        self.bar.println(text);
    }
}

/// A reporter that discards everything — used for scripted / piped
/// invocations where progress output would just add noise.
pub struct SilentProgressReporter;

impl ProgressReporter for SilentProgressReporter {
    fn run_started(&self, _run_id: &str, _pipeline_name: &str) {}
    fn node_started(&self, _node_id: &str) {}
    fn node_finished(&self, _node_id: &str, _succeeded: bool) {}
    fn run_finished(&self, _run_id: &str, _status: &str) {}
    fn dispatcher_tick(&self, _fired: usize, _skipped: usize) {}
    fn message(&self, _text: &str) {}
}

/// Pick the reporter appropriate for the current process's stdout.
pub fn default_reporter() -> Box<dyn ProgressReporter> {
    if TerminalProgressReporter::stdout_is_tty() {
        Box::new(TerminalProgressReporter::new())
    } else {
        Box::new(SilentProgressReporter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_reporter_does_not_panic_on_any_call() {
        let reporter = SilentProgressReporter;
        reporter.run_started("r1", "p1");
        reporter.node_started("n1");
        reporter.node_finished("n1", true);
        reporter.dispatcher_tick(1, 0);
        reporter.run_finished("r1", "succeeded");
        reporter.message("hi");
    }

    #[test]
    fn terminal_reporter_can_be_driven_through_a_full_run() {
        let reporter = TerminalProgressReporter::new();
        reporter.run_started("r1", "p1");
        reporter.node_started("n1");
        reporter.node_finished("n1", false);
        reporter.run_finished("r1", "failed");
    }
}
