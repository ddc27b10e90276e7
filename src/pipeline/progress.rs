use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Analyzing,
    Processing,
    Validating,
    Applying,
    Complete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Analyzing => "analyzing",
            Stage::Processing => "processing",
            Stage::Validating => "validating",
            Stage::Applying => "applying",
            Stage::Complete => "complete",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    /// Percent complete, 0..=100.
    pub progress: u8,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(stage: Stage, progress: f64, message: impl Into<String>) -> Self {
        Self {
            stage,
            progress: progress.clamp(0.0, 100.0).round() as u8,
            message: message.into(),
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Logs every event at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, event: ProgressEvent) {
        info!(stage = %event.stage, progress = event.progress, "{}", event.message);
    }
}

/// Sink that drops everything.
#[cfg(test)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

#[cfg(test)]
impl ProgressSink for SilentProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Remaps a stage's own 0..100 range into `[start, end]` of the parent sink.
pub struct ScaledProgress<'a> {
    inner: &'a dyn ProgressSink,
    start: f64,
    end: f64,
}

impl<'a> ScaledProgress<'a> {
    pub fn new(inner: &'a dyn ProgressSink, start: f64, end: f64) -> Self {
        Self { inner, start, end }
    }
}

impl ProgressSink for ScaledProgress<'_> {
    fn report(&self, event: ProgressEvent) {
        let scaled = self.start + (self.end - self.start) * f64::from(event.progress) / 100.0;
        self.inner
            .report(ProgressEvent::new(event.stage, scaled, event.message));
    }
}

/// Cooperative cancellation shared between the caller and a running pipeline.
/// Checked between batches and between executor phases only.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct RecordingProgress {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

#[cfg(test)]
impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("events lock").clone()
    }
}

#[cfg(test)]
impl ProgressSink for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().expect("events lock").push(event);
    }
}
