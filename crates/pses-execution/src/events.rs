use futures::channel::mpsc;
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    engine::{BreakpointUpdate, DebuggerStopEvent, RunspaceDetails},
    runspace::SessionStateChange,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunspaceChangeReason {
    PushedSession,
    PoppedSession,
    EnteredProcess,
    ExitedProcess,
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunspaceChange {
    pub reason: RunspaceChangeReason,
    pub previous: RunspaceDetails,
    pub current: RunspaceDetails,
}

/// Notifications for the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    SessionStateChanged(SessionStateChange),
    DebuggerStop(DebuggerStopEvent),
    BreakpointUpdated(BreakpointUpdate),
    RunspaceChanged(RunspaceChange),
}

/// Fan-out of `ContextEvent`s. Publishing never blocks, so it is safe on the pipeline thread.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ContextEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ContextEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: ContextEvent) {
        trace!(target: "events", ?event, "publishing event");
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.unbounded_send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::engine::BreakpointUpdateKind;

    fn breakpoint(id: u32) -> ContextEvent {
        ContextEvent::BreakpointUpdated(BreakpointUpdate {
            id,
            kind: BreakpointUpdateKind::Set,
            script_name: None,
            line: 1,
        })
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(breakpoint(1));

        assert_eq!(first.next().await, Some(breakpoint(1)));
        assert_eq!(second.next().await, Some(breakpoint(1)));
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(breakpoint(2));
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
    }
}
