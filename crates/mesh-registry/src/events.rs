//! Registry change events

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::identity::ServiceIdentity;

/// Something observable happened to the set of known services
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A running instance registered itself
    Registered {
        /// Identity of the registered service
        identity: ServiceIdentity,
        /// Instance id of the registration
        instance_id: Uuid,
        /// Base URL the instance is reachable on
        base_url: String,
    },
    /// A launch was initiated and the instance is expected to register
    Starting {
        /// Identity being started
        identity: ServiceIdentity,
        /// Instance id the new process will register with
        instance_id: Uuid,
    },
    /// An instance was removed from the registry
    Unregistered {
        /// Identity of the removed instance
        identity: ServiceIdentity,
        /// Instance id that was removed
        instance_id: Uuid,
    },
    /// An artifact appeared for a service that is not running
    DormantDetected {
        /// Identity derived from the artifact name
        identity: ServiceIdentity,
    },
    /// A dormant artifact disappeared from its store
    DormantRemoved {
        /// Identity whose artifact went away
        identity: ServiceIdentity,
    },
}

/// Fan-out of events to any number of subscribers
///
/// Subscribers that drop their receiver are cleaned up on the next emit.
pub struct EventEmitter<E> {
    senders: Mutex<Vec<async_channel::Sender<E>>>,
}

impl<E: Clone> EventEmitter<E> {
    /// Create an emitter with no subscribers
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to all events emitted from now on
    pub fn subscribe(&self) -> async_channel::Receiver<E> {
        let (tx, rx) = async_channel::unbounded();
        self.senders.lock().unwrap().push(tx);
        rx
    }

    /// Deliver an event to all live subscribers
    pub fn emit(&self, event: E) {
        self.senders
            .lock()
            .unwrap()
            .retain(|sender| sender.try_send(event.clone()).is_ok());
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().unwrap().len()
    }
}

impl<E: Clone> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.senders.lock().unwrap().len())
            .finish()
    }
}

/// Shared handle to an event emitter
pub type SharedEvents<E> = Arc<EventEmitter<E>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn delivers_to_all_subscribers() {
        let emitter = EventEmitter::new();
        let rx1 = emitter.subscribe();
        let rx2 = emitter.subscribe();
        emitter.emit("hello".to_string());
        assert_eq!(rx1.recv().await.unwrap(), "hello");
        assert_eq!(rx2.recv().await.unwrap(), "hello");
    }

    #[smol_potat::test]
    async fn dropped_subscribers_are_pruned() {
        let emitter = EventEmitter::new();
        let rx = emitter.subscribe();
        drop(emitter.subscribe());
        emitter.emit(1u32);
        assert_eq!(rx.recv().await.unwrap(), 1);
        assert_eq!(emitter.subscriber_count(), 1);
    }
}
