//! Step progress reporting
//!
//! The bring-up state machine reports each phase transition to an external
//! sink: `running` on entry, then `successful` or `failed` once. The sink is
//! purely observational; nothing in the engine reads it back.

use tracing::info;

/// Status of a single step or of the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// The step has started
    Running,
    /// The step finished successfully
    Successful,
    /// The step failed; the run is over
    Failed,
}

impl StepStatus {
    /// Lowercase wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }
}

/// Sink for step progress events
pub trait ProgressSink: Send + Sync {
    /// Publish one transition: the status, the step it applies to, and the
    /// full ordered step list for context
    fn publish(&self, status: StepStatus, step: &str, all_steps: &[&str]);
}

/// Sink that logs transitions through tracing
#[derive(Debug, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn publish(&self, status: StepStatus, step: &str, _all_steps: &[&str]) {
        info!(step, status = status.as_str(), "step transition");
    }
}

/// Sink that drops everything; for tests and embedders without a UI
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn publish(&self, _status: StepStatus, _step: &str, _all_steps: &[&str]) {}
}

/// An ordered, named list of phases with a cursor
///
/// Steps are strictly sequential: [`StepSequence::enter`] reports the next
/// step as running and advances the cursor; the terminal outcome for the
/// whole run is reported once through [`StepSequence::finish`].
pub struct StepSequence<'a> {
    steps: &'a [&'a str],
    current: usize,
    sink: &'a dyn ProgressSink,
}

impl<'a> StepSequence<'a> {
    /// Create a sequence over `steps` reporting to `sink`
    pub fn new(steps: &'a [&'a str], sink: &'a dyn ProgressSink) -> Self {
        Self {
            steps,
            current: 0,
            sink,
        }
    }

    /// Report the next step as running and return its name
    ///
    /// Calling past the end returns `None` and reports nothing.
    pub fn enter(&mut self) -> Option<&'a str> {
        let step = self.steps.get(self.current)?;
        self.current += 1;
        self.sink.publish(StepStatus::Running, step, self.steps);
        Some(step)
    }

    /// Name of the most recently entered step
    pub fn current(&self) -> Option<&'a str> {
        self.current
            .checked_sub(1)
            .and_then(|i| self.steps.get(i))
            .copied()
    }

    /// Report the terminal outcome for the whole run against the current step
    pub fn finish(&self, status: StepStatus) {
        let step = self.current().unwrap_or("");
        self.sink.publish(status, step, self.steps);
    }
}
