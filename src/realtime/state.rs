//! Connection lifecycle state and its validated transitions.

use thiserror::Error;
use tokio::sync::watch;

/// Lifecycle state of a realtime connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out backoff between automatic reconnect attempts.
    Reconnecting,
    /// Shut down for good.
    Closed,
}

impl ConnectionState {
    /// Whether `self -> to` is a legal move.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Reconnecting)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
                | (Disconnected | Connecting | Connected | Reconnecting, Closed)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid connection state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Single source of truth for the connection state.
///
/// Transitions are validated and published atomically; observers subscribe
/// through a `watch` channel.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    tx: watch::Sender<ConnectionState>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Moves to `to`, returning the previous state.
    pub fn transition(&self, to: ConnectionState) -> Result<ConnectionState, InvalidTransition> {
        let mut outcome = Err(InvalidTransition {
            from: to,
            to,
        });
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(to) {
                outcome = Ok(*state);
                *state = to;
                true
            } else {
                outcome = Err(InvalidTransition { from: *state, to });
                false
            }
        });

        if let Ok(from) = outcome {
            tracing::debug!(event = "connection_state_changed", from = ?from, to = ?to);
        }
        outcome
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    #[test]
    fn follows_connect_lifecycle() {
        let machine = ConnectionStateMachine::new();
        assert_eq!(machine.current(), Disconnected);
        assert_eq!(machine.transition(Connecting), Ok(Disconnected));
        assert_eq!(machine.transition(Connected), Ok(Connecting));
        assert_eq!(machine.transition(Reconnecting), Ok(Connected));
        assert_eq!(machine.transition(Connecting), Ok(Reconnecting));
        assert_eq!(machine.transition(Reconnecting), Ok(Connecting));
        assert_eq!(machine.transition(Disconnected), Ok(Reconnecting));
        assert_eq!(machine.transition(Closed), Ok(Disconnected));
    }

    #[test]
    fn rejects_illegal_moves() {
        let machine = ConnectionStateMachine::new();
        assert_eq!(
            machine.transition(Connected),
            Err(InvalidTransition {
                from: Disconnected,
                to: Connected
            })
        );
        assert_eq!(machine.current(), Disconnected);
    }

    #[test]
    fn closed_is_terminal() {
        let machine = ConnectionStateMachine::new();
        machine.transition(Closed).expect("close");
        for to in [Disconnected, Connecting, Connected, Reconnecting, Closed] {
            assert!(machine.transition(to).is_err(), "{to:?} after Closed");
        }
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let machine = ConnectionStateMachine::new();
        let mut rx = machine.subscribe();
        machine.transition(Connecting).expect("connecting");
        rx.changed().await.expect("changed");
        assert_eq!(*rx.borrow_and_update(), Connecting);
    }
}
