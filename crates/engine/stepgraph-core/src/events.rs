//! Notifications raised by the engine for external listeners.

use std::sync::mpsc::{self, Receiver, Sender};

use serde::{Deserialize, Serialize};

use crate::cursor::DebugPosition;
use crate::ids::NodeId;

/// Run state of a simulation as driven by its handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimulationState {
    #[default]
    Stopped,
    Running,
    Paused,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimulationEvent {
    /// A full step finished; `step` is the new step counter.
    StepCompleted { step: u64 },
    /// An interactive run reached its step target or a breakpoint.
    DebugTargetReached {
        step: u64,
        position: Option<DebugPosition>,
    },
    /// A group restructured its children.
    ModelChanged { node: NodeId },
}

/// Fan-out of events to any number of subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Vec<Sender<SimulationEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<SimulationEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver to every live subscriber, dropping those whose receiver is gone.
    pub fn emit(&mut self, event: SimulationEvent) {
        log::trace!("emit {event:?}");
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_receivers_are_forgotten() {
        let mut bus = EventBus::new();
        let rx = bus.subscribe();
        let gone = bus.subscribe();
        drop(gone);

        bus.emit(SimulationEvent::StepCompleted { step: 1 });
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(rx.try_recv().unwrap(), SimulationEvent::StepCompleted { step: 1 });
    }
}
