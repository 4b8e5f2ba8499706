//! Progress inference from the unstructured output of the worker.
//!
//! The worker has no progress protocol, it prints a fixed marker once per finished
//! image. Recognising that marker is the job of a [`LineClassifier`], so the rule can
//! be replaced without touching how the tracker counts.

use tracing::{debug, warn};

/// What a single output line means for progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    ItemCompleted,
    Other,
}

pub trait LineClassifier {
    fn classify(&self, line: &str) -> LineKind;
}

/// Substring rule, a line containing the marker anywhere completes one item
#[derive(Debug, Clone)]
pub struct MarkerClassifier {
    marker: String,
}

impl MarkerClassifier {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl LineClassifier for MarkerClassifier {
    fn classify(&self, line: &str) -> LineKind {
        if line.contains(self.marker.as_str()) {
            LineKind::ItemCompleted
        } else {
            LineKind::Other
        }
    }
}

impl<F: Fn(&str) -> LineKind> LineClassifier for F {
    fn classify(&self, line: &str) -> LineKind {
        self(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressState {
    pub items_total: usize,
    pub items_completed: usize,
    pub percent: u8,
}

impl ProgressState {
    /// floor(100 * completed / total), capped at 100
    fn compute_percent(completed: usize, total: usize) -> u8 {
        if total == 0 {
            return 0;
        }

        (completed.saturating_mul(100) / total).min(100) as u8
    }
}

/// Result of feeding one line to the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// an item finished, carries the percentage after counting it
    Progress(u8),
    /// any other line, passed on verbatim
    Log(String),
}

/// Marker count that does not agree with the number of items the run started with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anomaly {
    pub expected: usize,
    pub observed: usize,
}

#[derive(Debug, Clone)]
pub struct ProgressTracker<C: LineClassifier = MarkerClassifier> {
    classifier: C,
    state: ProgressState,
}

impl<C: LineClassifier> ProgressTracker<C> {
    pub fn new(classifier: C, items_total: usize) -> Self {
        Self {
            classifier,
            state: ProgressState {
                items_total,
                ..Default::default()
            },
        }
    }

    pub fn state(&self) -> ProgressState {
        self.state
    }

    /// Classify a line, every completion emits a progress event even if the
    /// percentage did not move
    pub fn observe(&mut self, line: String) -> ProgressEvent {
        match self.classifier.classify(&line) {
            LineKind::ItemCompleted => {
                self.state.items_completed += 1;
                self.state.percent = ProgressState::compute_percent(
                    self.state.items_completed,
                    self.state.items_total,
                );

                debug!(
                    completed = self.state.items_completed,
                    total = self.state.items_total,
                    percent = self.state.percent,
                    "Item completed"
                );

                ProgressEvent::Progress(self.state.percent)
            }
            LineKind::Other => ProgressEvent::Log(line),
        }
    }

    /// Force the run to 100% after a successful exit
    ///
    /// The markers may undercount (or overcount) what the worker actually did, the
    /// difference is handed back so it can be reported.
    pub fn complete(&mut self) -> Option<Anomaly> {
        let anomaly = (self.state.items_completed != self.state.items_total).then_some(Anomaly {
            expected: self.state.items_total,
            observed: self.state.items_completed,
        });

        if let Some(anomaly) = anomaly {
            warn!(
                expected = anomaly.expected,
                observed = anomaly.observed,
                "Completion markers do not match the number of images"
            );
        }

        self.state.percent = 100;

        anomaly
    }
}
