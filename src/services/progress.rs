//! Load progress reporting
//!
//! Keeps progress concerns out of the load sequence so each frontend (CLI
//! progress bar, log output, an interactive client's channel) can render
//! updates its own way.

use instant::Instant;
use tokio::sync::mpsc;

/// Ordered stages of the model load sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadStage {
    /// Resolve model id, weight source and configuration files
    Configuration,
    /// Find (or fetch) the weight file
    LocateWeights,
    /// Instantiate the architecture on each backend
    Architecture,
    /// Strict weight load into the architecture
    BindWeights,
    /// Move to the compute target, switch to inference mode
    Transfer,
    /// Handle is ready
    Ready,
}

impl LoadStage {
    /// Every stage in execution order
    pub const ALL: [LoadStage; 6] = [
        LoadStage::Configuration,
        LoadStage::LocateWeights,
        LoadStage::Architecture,
        LoadStage::BindWeights,
        LoadStage::Transfer,
        LoadStage::Ready,
    ];

    /// Progress fraction reported when the stage starts
    #[must_use]
    pub fn fraction(self) -> f32 {
        match self {
            LoadStage::Configuration => 0.1,
            LoadStage::LocateWeights => 0.3,
            LoadStage::Architecture => 0.5,
            LoadStage::BindWeights => 0.7,
            LoadStage::Transfer => 0.9,
            LoadStage::Ready => 1.0,
        }
    }

    /// Human-readable message; `remote` selects the download wording
    #[must_use]
    pub fn message(self, remote: bool) -> &'static str {
        match (self, remote) {
            (LoadStage::Configuration, false) => "Loading configuration...",
            (LoadStage::Configuration, true) => "Downloading configuration...",
            (LoadStage::LocateWeights, false) => "Locating model weights...",
            (LoadStage::LocateWeights, true) => "Downloading model weights...",
            (LoadStage::Architecture, _) => "Creating model architecture...",
            (LoadStage::BindWeights, _) => "Loading weights into model...",
            (LoadStage::Transfer, _) => "Transferring to device...",
            (LoadStage::Ready, _) => "Ready!",
        }
    }
}

/// One progress update of a load sequence
#[derive(Debug, Clone, PartialEq)]
pub struct LoadProgress {
    pub stage: LoadStage,
    /// In `[0, 1]`, strictly increasing within one sequence
    pub fraction: f32,
    pub message: String,
    /// Milliseconds since the sequence started
    pub elapsed_ms: u64,
}

impl LoadProgress {
    #[must_use]
    pub fn new(stage: LoadStage, remote: bool, start: Instant) -> Self {
        Self {
            stage,
            fraction: stage.fraction(),
            message: stage.message(remote).to_string(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }
}

/// Trait for receiving model load progress
pub trait ProgressReporter: Send + Sync {
    /// Called before each stage starts, and once with [`LoadStage::Ready`]
    fn report_progress(&self, update: LoadProgress);

    /// Called once when a stage fails; the sequence stops afterwards
    fn report_error(&self, stage: LoadStage, error: &str) {
        let _ = (stage, error);
    }
}

/// No-op progress reporter that discards all progress updates
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn report_progress(&self, _update: LoadProgress) {}
}

/// Progress reporter that writes updates to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleProgressReporter;

impl ProgressReporter for ConsoleProgressReporter {
    fn report_progress(&self, update: LoadProgress) {
        tracing::info!(
            "[{:>3.0}%] {} ({}ms)",
            update.fraction * 100.0,
            update.message,
            update.elapsed_ms
        );
    }

    fn report_error(&self, stage: LoadStage, error: &str) {
        tracing::error!("Model load failed at '{}': {}", stage.message(false), error);
    }
}

/// Forwards updates over a bounded channel to a single consumer
///
/// Updates are dropped (not awaited) when the consumer falls behind, so the
/// loader never blocks on a slow renderer.
#[derive(Debug, Clone)]
pub struct ChannelProgressReporter {
    sender: mpsc::Sender<LoadProgress>,
}

impl ChannelProgressReporter {
    /// Reporter plus the receiving end of a channel holding `capacity` updates
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LoadProgress>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl ProgressReporter for ChannelProgressReporter {
    fn report_progress(&self, update: LoadProgress) {
        if let Err(e) = self.sender.try_send(update) {
            tracing::debug!("Dropped load progress update: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fractions_strictly_increase() {
        let fractions: Vec<f32> = LoadStage::ALL.iter().map(|s| s.fraction()).collect();
        assert_eq!(fractions, vec![0.1, 0.3, 0.5, 0.7, 0.9, 1.0]);
        assert!(fractions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_messages_follow_source() {
        assert_eq!(LoadStage::Configuration.message(false), "Loading configuration...");
        assert_eq!(LoadStage::Configuration.message(true), "Downloading configuration...");
        assert_eq!(LoadStage::LocateWeights.message(true), "Downloading model weights...");
        assert_eq!(LoadStage::Ready.message(true), "Ready!");
    }

    #[tokio::test]
    async fn test_channel_reporter_delivers_in_order() {
        let (reporter, mut rx) = ChannelProgressReporter::channel(8);
        let start = Instant::now();
        for stage in LoadStage::ALL {
            reporter.report_progress(LoadProgress::new(stage, false, start));
        }
        drop(reporter);

        let mut received = Vec::new();
        while let Some(update) = rx.recv().await {
            received.push(update.stage);
        }
        assert_eq!(received, LoadStage::ALL.to_vec());
    }

    #[test]
    fn test_channel_reporter_drops_when_full() {
        let (reporter, mut rx) = ChannelProgressReporter::channel(1);
        let start = Instant::now();
        reporter.report_progress(LoadProgress::new(LoadStage::Configuration, false, start));
        reporter.report_progress(LoadProgress::new(LoadStage::LocateWeights, false, start));
        assert_eq!(rx.try_recv().unwrap().stage, LoadStage::Configuration);
        assert!(rx.try_recv().is_err());
    }
}
