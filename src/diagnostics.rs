//! Side channel for scaling and data-loading diagnostics.
//!
//! The core never logs through a global; it reports [`CoreEvent`]s to the
//! sink it was built with. [`TracingSink`] is the default.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// A periodic scaling check ran.
    ScalingChecked { total_log_factor: f64, still_needed: bool },
    /// Scaling was switched off by the adaptive check.
    ScalingDisabled { total_log_factor: f64 },
    /// Scaling was switched on by a caller.
    ScalingEnabled,
    /// `set_node_partials` received more values than the buffer holds.
    PartialsTruncated {
        node: usize,
        supplied: usize,
        capacity: usize,
    },
}

pub trait DiagnosticSink: Send + Sync {
    fn record(&self, event: &CoreEvent);
}

pub type SharedSink = Arc<dyn DiagnosticSink>;

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, event: &CoreEvent) {
        match event {
            CoreEvent::ScalingChecked {
                total_log_factor,
                still_needed,
            } => {
                tracing::debug!(total_log_factor, still_needed, "likelihood core scaling check");
            }
            CoreEvent::ScalingDisabled { total_log_factor } => {
                tracing::info!(total_log_factor, "likelihood core scaling turned off");
            }
            CoreEvent::ScalingEnabled => {
                tracing::info!("likelihood core scaling turned on");
            }
            CoreEvent::PartialsTruncated {
                node,
                supplied,
                capacity,
            } => {
                tracing::warn!(node, supplied, capacity, "partials longer than buffer, surplus ignored");
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn record(&self, _event: &CoreEvent) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<CoreEvent>>,
}

impl CollectingSink {
    /// A fresh sink behind an `Arc`, ready to hand to a core while the
    /// caller keeps a handle for inspection.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl DiagnosticSink for CollectingSink {
    fn record(&self, event: &CoreEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

pub fn default_sink() -> SharedSink {
    Arc::new(TracingSink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn collecting_sink_keeps_order() {
        let sink = CollectingSink::shared();
        sink.record(&CoreEvent::ScalingEnabled);
        sink.record(&CoreEvent::ScalingDisabled {
            total_log_factor: 0.0,
        });
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], CoreEvent::ScalingEnabled);
    }

    #[traced_test]
    #[test]
    fn tracing_sink_emits_warning_for_truncation() {
        TracingSink.record(&CoreEvent::PartialsTruncated {
            node: 3,
            supplied: 10,
            capacity: 8,
        });
        assert!(logs_contain("surplus ignored"));
    }
}
