use std::sync::{Arc, Mutex};
use stratus_shared::DomainEvent;

/// Sink for domain events. `publish` must not block on delivery: subscribers
/// queue the event and return.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: DomainEvent);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: DomainEvent) {}
}

/// Hands each event to every inner publisher.
#[derive(Clone, Default)]
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutPublisher {
    pub fn new(publishers: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { publishers }
    }
}

impl EventPublisher for FanoutPublisher {
    fn publish(&self, event: DomainEvent) {
        for publisher in &self.publishers {
            publisher.publish(event.clone());
        }
    }
}

/// Keeps published events in memory; for tests and local inspection.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .map(|events| events.iter().map(|e| e.event_type.clone()).collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: DomainEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_reaches_every_publisher() {
        let first = Arc::new(RecordingPublisher::new());
        let second = Arc::new(RecordingPublisher::new());
        let fanout = FanoutPublisher::new(vec![first.clone(), second.clone()]);

        fanout.publish(DomainEvent::new("order.created", None, serde_json::json!({})));

        assert_eq!(first.event_types(), vec!["order.created"]);
        assert_eq!(second.event_types(), vec!["order.created"]);
    }
}
