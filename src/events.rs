//! Lifecycle signals and observer lists
//!
//! Observers are unbounded channels kept in registration order. Emitting
//! clones the event into each channel; observer code runs on the receiver's
//! own task, never inline with the dispatcher.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// Connection lifecycle signal
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Handshake finished and subscriptions are live.
    /// `resumed` is true when this follows a reconnect.
    Connected { resumed: bool },
    /// Transport closed or failed
    Disconnected { reason: String },
    /// Non-fatal problem worth surfacing (failed replay, auth rejection)
    Error { message: String },
    /// Reconnect budget exhausted; no further attempts will be made
    PermanentlyDisconnected { attempts: u32 },
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected { resumed: false } => write!(f, "connected"),
            Self::Connected { resumed: true } => write!(f, "reconnected"),
            Self::Disconnected { reason } => write!(f, "disconnected: {}", reason),
            Self::Error { message } => write!(f, "error: {}", message),
            Self::PermanentlyDisconnected { attempts } => {
                write!(f, "permanently disconnected after {} attempts", attempts)
            }
        }
    }
}

/// Ordered list of observers for one kind of event
pub struct Observers<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Observers<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Register a new observer; it receives events emitted from now on
    pub fn register(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    /// Deliver to every live observer in registration order.
    ///
    /// Observers whose receiver was dropped are pruned. Returns how many
    /// observers received the event.
    pub fn emit(&self, event: &T) -> usize {
        let mut senders = self.senders.lock();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        senders.len()
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}
