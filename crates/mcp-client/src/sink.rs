//! Event sink: where the client layer reports structured events.
//!
//! Sinks are invoked synchronously on the emitting task, so nothing is ever
//! logged after the operation that produced it has returned.

use parking_lot::Mutex;

use tm_domain::trace::TraceEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

/// Default sink: forwards to `tracing` via [`TraceEvent::emit`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: TraceEvent) {
        event.emit();
    }
}

/// Keeps every event in memory. Useful for tests and for embedding callers
/// that want to inspect what happened.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Events of one kind (see [`TraceEvent::kind`]).
    pub fn of_kind(&self, kind: &str) -> Vec<TraceEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_filters_by_kind() {
        let sink = RecordingSink::new();
        sink.emit(TraceEvent::ServerRemoved {
            server_id: "a".into(),
            reason: "gone".into(),
        });
        sink.emit(TraceEvent::CatalogBuilt {
            servers: 1,
            tools: 2,
            duplicates: 0,
        });
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.of_kind("catalog_built").len(), 1);
        assert!(sink.of_kind("tool_call").is_empty());
    }
}
