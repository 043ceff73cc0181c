//! Connection lifecycle.
//!
//! ```text
//!            connect            handshake ok           close             teardown
//! Closed ───────────▶ Connecting ───────────▶ Open ───────────▶ Closing ───────────▶ Closed
//! ```
//!
//! Every check-and-set happens under one lock, so a local close racing a close sent by the server
//! resolves to exactly one winner. Forced transitions skip the guard but still take the lock.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

/// Lifecycle state of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Initial state, and the state of an in-flight connect.
    #[default]
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Guarded connection state plus the flags the reader and the close path coordinate through.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: Mutex<ConnectionState>,
    handshake_initiated: AtomicBool,
    polling: AtomicBool,
    reading: AtomicBool,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.lock()
    }

    /// Attempts to move to `to`.
    ///
    /// Returns `false` when the guard rejects the transition. With `force` the guard is skipped.
    ///
    /// | Target     | Guard                                                   |
    /// |------------|---------------------------------------------------------|
    /// | Connecting | no handshake in flight, state is Connecting or Closed   |
    /// | Open       | state is Connecting                                     |
    /// | Closing    | state is Open                                           |
    /// | Closed     | state is Closing                                        |
    pub fn transition(&self, to: ConnectionState, force: bool) -> bool {
        let mut state = self.lock();

        if !force && !self.allowed(*state, to) {
            #[cfg(feature = "logging")]
            log::debug!("rejected transition {:?} -> {to:?}", *state);
            return false;
        }

        match to {
            ConnectionState::Connecting => {
                self.handshake_initiated.store(true, Ordering::SeqCst);
                self.polling.store(true, Ordering::SeqCst);
            }
            ConnectionState::Open => {
                self.handshake_initiated.store(false, Ordering::SeqCst);
            }
            ConnectionState::Closing => {
                self.polling.store(false, Ordering::SeqCst);
            }
            ConnectionState::Closed => {
                self.handshake_initiated.store(false, Ordering::SeqCst);
                self.polling.store(false, Ordering::SeqCst);
            }
        }

        #[cfg(feature = "logging")]
        log::debug!("state {:?} -> {to:?}{}", *state, if force { " (forced)" } else { "" });

        *state = to;
        true
    }

    fn allowed(&self, from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::*;
        match to {
            Connecting => {
                !self.handshake_initiated.load(Ordering::SeqCst)
                    && matches!(from, Connecting | Closed)
            }
            Open => from == Connecting,
            Closing => from == Open,
            Closed => from == Closing,
        }
    }

    /// Whether a connect is in flight.
    pub fn handshake_initiated(&self) -> bool {
        self.handshake_initiated.load(Ordering::SeqCst)
    }

    /// Whether the reader should keep reading.
    pub fn polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    /// Whether the reader is inside a read.
    pub fn reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    pub(crate) fn set_reading(&self, reading: bool) {
        self.reading.store(reading, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        // the guarded value is a plain enum, a poisoned lock still holds a valid state
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ConnectionState::*;

    #[test]
    fn test_initial_state() {
        let sm = StateMachine::new();
        assert_eq!(sm.state(), Connecting);
        assert!(!sm.handshake_initiated());
        assert!(!sm.polling());
        assert!(!sm.reading());
    }

    #[test]
    fn test_full_lifecycle() {
        let sm = StateMachine::new();
        assert!(sm.transition(Connecting, false));
        assert!(sm.handshake_initiated());
        assert!(sm.polling());

        assert!(sm.transition(Open, false));
        assert!(!sm.handshake_initiated());
        assert!(sm.polling());

        assert!(sm.transition(Closing, false));
        assert!(!sm.polling());

        assert!(sm.transition(Closed, false));
        assert_eq!(sm.state(), Closed);
    }

    #[test]
    fn test_reconnect_from_closed() {
        let sm = StateMachine::new();
        sm.transition(Closed, true);
        assert!(sm.transition(Connecting, false));
        assert!(sm.transition(Open, false));
    }

    #[test]
    fn test_connect_rejected_while_open_or_in_flight() {
        let sm = StateMachine::new();
        assert!(sm.transition(Connecting, false));
        // second connect while the first is negotiating
        assert!(!sm.transition(Connecting, false));

        assert!(sm.transition(Open, false));
        assert!(!sm.transition(Connecting, false));
        assert_eq!(sm.state(), Open);
    }

    #[test]
    fn test_guard_table() {
        let sm = StateMachine::new();
        assert!(!sm.transition(Closing, false));
        assert!(!sm.transition(Closed, false));

        sm.transition(Open, true);
        assert!(!sm.transition(Open, false));
        assert!(!sm.transition(Closed, false));

        sm.transition(Closing, true);
        assert!(!sm.transition(Closing, false));
        assert!(!sm.transition(Open, false));
    }

    #[test]
    fn test_force_bypasses_guard() {
        let sm = StateMachine::new();
        assert!(sm.transition(Closed, true));
        assert_eq!(sm.state(), Closed);
        assert!(sm.transition(Open, true));
        assert_eq!(sm.state(), Open);
    }

    #[test]
    fn test_racing_closes_have_one_winner() {
        for _ in 0..100 {
            let sm = Arc::new(StateMachine::new());
            sm.transition(Connecting, false);
            sm.transition(Open, false);

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let sm = Arc::clone(&sm);
                    std::thread::spawn(move || sm.transition(Closing, false))
                })
                .collect();

            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
        }
    }
}
