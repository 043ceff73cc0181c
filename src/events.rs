//! Lifecycle and message events.
//!
//! Listeners subscribe per [`EventKind`] and are called synchronously from the task that raised
//! the event, which for incoming messages is the reader task. A listener that blocks stalls
//! reading, so long work should be handed off to another task.
//!
//! Independently of listeners, a [`MessageHandler`] can replace the built-in handling of one
//! opcode: it receives every complete message with that opcode and nothing else happens for it.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use bytes::Bytes;

use crate::{close::CloseCode, frame::Frame, OpCode, WebSocketError};

/// Which side started the close handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Initiator {
    Client,
    Server,
}

/// Something that happened on a connection.
#[derive(Debug, Clone)]
pub enum Event {
    /// The upgrade succeeded and the connection is open.
    Open,
    /// The connection is closed.
    Close {
        code: CloseCode,
        reason: String,
        initiator: Initiator,
    },
    /// A frame was read, before reassembly.
    Frame(Frame),
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Error(Arc<WebSocketError>),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Open => EventKind::Open,
            Event::Close { .. } => EventKind::Close,
            Event::Frame(_) => EventKind::Frame,
            Event::Text(_) => EventKind::Text,
            Event::Binary(_) => EventKind::Binary,
            Event::Ping(_) => EventKind::Ping,
            Event::Pong(_) => EventKind::Pong,
            Event::Error(_) => EventKind::Error,
        }
    }
}

/// Discriminant of [`Event`], used to subscribe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Close,
    Frame,
    Text,
    Binary,
    Ping,
    Pong,
    Error,
}

/// Identifies a listener so it can be removed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A complete message, as handed to a [`MessageHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Opcode of the first frame of the message.
    pub opcode: OpCode,
    pub payload: Bytes,
}

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Listener registry of a connection.
#[derive(Default)]
pub struct Events {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(HandlerId, EventKind, Listener)>>,
    handlers: RwLock<HashMap<OpCode, MessageHandler>>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `listener` to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        write(&self.listeners).push((id, kind, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut listeners = write(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(other, _, _)| *other != id);
        listeners.len() != before
    }

    /// Calls every listener subscribed to the kind of `event`, in registration order.
    pub fn emit(&self, event: &Event) {
        let kind = event.kind();
        // listeners may subscribe or unsubscribe, so they run outside the lock
        let matching: Vec<Listener> = read(&self.listeners)
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();

        for listener in matching {
            listener(event);
        }
    }

    /// Whether anyone listens to `kind`.
    pub fn has_listeners(&self, kind: EventKind) -> bool {
        read(&self.listeners).iter().any(|(_, k, _)| *k == kind)
    }

    /// Replaces the built-in handling of messages with `opcode`.
    pub fn set_handler<F>(&self, opcode: OpCode, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        write(&self.handlers).insert(opcode, Arc::new(handler));
    }

    /// Restores the built-in handling of `opcode`. Returns `false` if no handler was set.
    pub fn remove_handler(&self, opcode: OpCode) -> bool {
        write(&self.handlers).remove(&opcode).is_some()
    }

    pub(crate) fn handler(&self, opcode: OpCode) -> Option<MessageHandler> {
        read(&self.handlers).get(&opcode).cloned()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_reaches_matching_listeners() {
        let events = Events::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let texts = Arc::clone(&seen);
        events.on(EventKind::Text, move |event| {
            if let Event::Text(text) = event {
                texts.lock().unwrap().push(text.clone());
            }
        });

        events.emit(&Event::Text("hello".into()));
        events.emit(&Event::Binary(Bytes::from_static(b"ignored")));
        events.emit(&Event::Text("world".into()));

        assert_eq!(*seen.lock().unwrap(), vec!["hello", "world"]);
    }

    #[test]
    fn test_emit_without_listeners_is_noop() {
        let events = Events::new();
        assert!(!events.has_listeners(EventKind::Open));
        events.emit(&Event::Open);
    }

    #[test]
    fn test_off_removes_listener() {
        let events = Events::new();
        let count = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&count);
        let id = events.on(EventKind::Open, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        events.emit(&Event::Open);
        assert!(events.off(id));
        assert!(!events.off(id));
        events.emit(&Event::Open);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_subscribe_while_emitting() {
        let events = Arc::new(Events::new());
        let inner = Arc::clone(&events);
        events.on(EventKind::Open, move |_| {
            inner.on(EventKind::Close, |_| {});
        });

        events.emit(&Event::Open);
        assert!(events.has_listeners(EventKind::Close));
    }

    #[test]
    fn test_opcode_handlers() {
        let events = Events::new();
        assert!(events.handler(OpCode::Text).is_none());

        let got = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&got);
        events.set_handler(OpCode::Text, move |message| {
            *slot.lock().unwrap() = Some(message);
        });

        let handler = events.handler(OpCode::Text).unwrap();
        handler(Message {
            opcode: OpCode::Text,
            payload: Bytes::from_static(b"raw"),
        });
        assert_eq!(got.lock().unwrap().as_ref().unwrap().payload, "raw");

        assert!(events.remove_handler(OpCode::Text));
        assert!(!events.remove_handler(OpCode::Text));
        assert!(events.handler(OpCode::Text).is_none());
    }
}
