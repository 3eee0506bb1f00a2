use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use crossbeam::select;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
}

/// Closable multi-producer multi-consumer FIFO over crossbeam channels.
///
/// Items travel through one unbounded channel so forced and bounded sends keep
/// their relative order. The bound is a second channel of slot tokens: `send`
/// parks a token before enqueueing and `recv` takes it back. Dropping the
/// shutdown sender wakes every blocked `send` and `recv` at once.
#[derive(Debug)]
pub struct Queue<T> {
    items_tx: Sender<(T, bool)>,
    items_rx: Receiver<(T, bool)>,
    slots_tx: Sender<()>,
    slots_rx: Receiver<()>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    capacity: usize,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (items_tx, items_rx) = channel::unbounded();
        let (slots_tx, slots_rx) = channel::bounded(capacity);
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);
        Self {
            items_tx,
            items_rx,
            slots_tx,
            slots_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            capacity,
        }
    }

    fn push(&self, item: T, counted: bool) -> Result<(), QueueError> {
        self.items_tx
            .send((item, counted))
            .map_err(|_| QueueError::Closed)
    }

    fn take(&self, (item, counted): (T, bool)) -> T {
        if counted {
            let _ = self.slots_rx.try_recv();
        }
        item
    }

    /// Blocks while the queue is full.
    pub fn send(&self, item: T) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        select! {
            send(self.slots_tx, ()) -> slot => slot.map_err(|_| QueueError::Closed)?,
            recv(self.shutdown_rx) -> _ => return Err(QueueError::Closed),
        }
        if self.is_closed() {
            let _ = self.slots_rx.try_recv();
            return Err(QueueError::Closed);
        }
        self.push(item, true)
    }

    pub fn try_send(&self, item: T) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        match self.slots_tx.try_send(()) {
            Ok(()) => self.push(item, true),
            Err(TrySendError::Full(())) => Err(QueueError::Full),
            Err(TrySendError::Disconnected(())) => Err(QueueError::Closed),
        }
    }

    /// Enqueues past capacity. Never blocks.
    pub fn force_send(&self, item: T) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        self.push(item, false)
    }

    /// Blocks until an item arrives. `None` once closed.
    pub fn recv(&self) -> Option<T> {
        if self.is_closed() {
            return None;
        }
        select! {
            recv(self.items_rx) -> item => item.ok().map(|item| self.take(item)),
            recv(self.shutdown_rx) -> _ => None,
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        if self.is_closed() {
            return None;
        }
        self.items_rx.try_recv().ok().map(|item| self.take(item))
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        if self.is_closed() {
            return None;
        }
        select! {
            recv(self.items_rx) -> item => item.ok().map(|item| self.take(item)),
            recv(self.shutdown_rx) -> _ => None,
            default(timeout) => None,
        }
    }

    /// Drops everything queued and wakes all blocked senders and receivers.
    pub fn close(&self) {
        drop(self.shutdown_tx.lock().take());
        while self.items_rx.try_recv().is_ok() {}
        while self.slots_rx.try_recv().is_ok() {}
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown_tx.lock().is_none()
    }

    pub fn len(&self) -> usize {
        self.items_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items_rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
