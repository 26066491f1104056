//! Input events delivered to the animator, and the bounded queue (C4) that carries them.

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::time::Duration;

/// Default capacity of a server's event queue, per this server's closed Open Question on
/// backpressure. Overridable via `ServerOptions::event_queue_capacity`.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// A single piece of input generated by a connected client, tagged by kind.
///
/// The server synthesises [`InputEvent::PointerClick`] events by diffing the button mask across
/// successive pointer messages; see [`crate::connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// A key was pressed or released.
    Key {
        /// X Window System keysym of the key.
        sym: u32,
        /// `true` if pressed, `false` if released.
        down: bool,
    },
    /// The pointer moved (and/or its button mask changed); position and full mask are reported.
    PointerMove {
        /// X coordinate.
        x: i32,
        /// Y coordinate.
        y: i32,
        /// Bitmask of currently pressed buttons.
        buttons: u8,
    },
    /// A single button's state changed, synthesised from consecutive `PointerMove` masks.
    PointerClick {
        /// X coordinate at the time of the click.
        x: i32,
        /// Y coordinate at the time of the click.
        y: i32,
        /// Index of the button whose state changed (bit position in the mask).
        button: u8,
        /// `true` if the button is now down, `false` if it was released.
        down: bool,
    },
}

/// A bounded, multi-producer single-consumer queue of [`InputEvent`]s.
///
/// Every connection thread is a producer; the animator is the single consumer. `push` blocks
/// when the queue is full rather than dropping the event — per the repo's design notes, a
/// non-draining animator is expected to apply backpressure upstream (e.g. by not reading from
/// its own window system) rather than have the server silently discard input.
pub struct EventQueue {
    tx: SyncSender<InputEvent>,
    rx: std::sync::Mutex<mpsc::Receiver<InputEvent>>,
}

impl EventQueue {
    /// Creates a queue with the given bounded capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        Self { tx, rx: std::sync::Mutex::new(rx) }
    }

    /// Returns a cheap, cloneable handle connection threads use to push events.
    #[must_use]
    pub fn sender(&self) -> EventSender {
        EventSender { tx: self.tx.clone() }
    }

    /// Pops the next event, blocking up to `timeout`. Returns `None` on timeout, matching the
    /// animator-facing `get_event(timeout)` API; this is not an error, just an empty queue.
    pub fn get_event(&self, timeout: Duration) -> Option<InputEvent> {
        let rx = self.rx.lock().unwrap();
        match rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// A cloneable producer handle for [`EventQueue`], held by each connection thread.
#[derive(Clone)]
pub struct EventSender {
    tx: SyncSender<InputEvent>,
}

impl EventSender {
    /// Pushes an event, blocking the calling (connection) thread if the queue is full.
    ///
    /// Returns `false` only if the consumer side has been dropped entirely (server shutdown
    /// mid-flight); the caller treats that the same as a closed connection.
    pub fn push(&self, event: InputEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}
