//! DHT events module
//!
//! Lifecycle notifications delivered to listeners registered by the
//! embedding application.

use crate::dht::key::Key;
use crate::dht::message::MessageKind;
use crate::dht::node::Node;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Notifications emitted by a running node
#[derive(Debug, Clone)]
pub enum Event {
    /// A peer entered the routing table
    PeerDiscovered { node: Node },
    /// A peer was evicted after failing a liveness probe
    PeerEvicted { node: Node },
    /// An inbound request was received
    MessageReceived { kind: MessageKind, origin: Node },
    /// A value was written to local storage on behalf of a peer
    ValueStored { key: Key, origin: Node },
    /// An iterative node lookup finished
    NodeLookupCompleted { target: Key, closest: usize },
    /// An iterative value lookup finished
    ValueLookupCompleted { key: Key, found: bool },
}

/// Event listener callback
pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Registry of event listeners keyed by registration id
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<String, EventListener>>,
}

impl EventBus {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, replacing any listener with the same id
    pub fn add(&self, registration_id: impl Into<String>, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.listeners.write().insert(registration_id.into(), Arc::new(listener));
    }

    /// Remove a listener; returns whether one was registered
    pub fn remove(&self, registration_id: &str) -> bool {
        self.listeners.write().remove(registration_id).is_some()
    }

    /// Remove every listener
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every registered listener.
    ///
    /// Listeners run after the registry lock is released, so they may
    /// register or remove listeners themselves.
    pub fn emit(&self, event: Event) {
        let listeners: Vec<EventListener> = self.listeners.read().values().cloned().collect();
        if listeners.is_empty() {
            return;
        }
        trace!("Emitting {:?} to {} listeners", event, listeners.len());
        for listener in listeners {
            listener(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("listeners", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lookup_event() -> Event {
        Event::ValueLookupCompleted { key: Key::random(), found: false }
    }

    #[test]
    fn test_emit_reaches_all_listeners() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for id in ["a", "b"] {
            let count = count.clone();
            bus.add(id, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.emit(lookup_event());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_listener() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        bus.add("a", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(bus.remove("a"));
        assert!(!bus.remove("a"));
        bus.emit(lookup_event());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_same_id_replaces() {
        let bus = EventBus::new();
        bus.add("a", |_| {});
        bus.add("a", |_| {});
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn test_listener_may_modify_registry() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.add("self-removing", move |_| {
            inner.remove("self-removing");
        });
        bus.emit(lookup_event());
        assert!(bus.is_empty());
    }

    #[test]
    fn test_concurrent_registration_and_emit() {
        let bus = Arc::new(EventBus::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = format!("{}-{}", t, i);
                        bus.add(id.clone(), |_| {});
                        bus.emit(lookup_event());
                        bus.remove(&id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(bus.is_empty());
    }
}
