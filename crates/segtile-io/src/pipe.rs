//! Bounded hand-off queues between pipeline stages.
//!
//! A [`Pipe`] is a fixed-capacity queue with blocking [`Pipe::enqueue`]
//! and [`Pipe::dequeue`]. Closing it wakes every blocked caller, which
//! then gets the closed signal instead of waiting forever. Every pipe of
//! a run also watches a shared [`CancelToken`]; cancelling it behaves
//! like closing all of them at once.
//!
//! Closing is immediate: items still queued are dropped with the pipe.

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Select, Sender, TryRecvError};
use parking_lot::Mutex;

/// A one-shot broadcast signal.
///
/// Nothing is ever sent on the channel; dropping the sender disconnects
/// it, which every receiver observes as "ready".
#[derive(Debug)]
struct Signal {
    trigger: Mutex<Option<Sender<()>>>,
    watch: Receiver<()>,
}

impl Signal {
    fn new() -> Self {
        let (trigger, watch) = channel::bounded(0);
        Self {
            trigger: Mutex::new(Some(trigger)),
            watch,
        }
    }

    fn raise(&self) {
        self.trigger.lock().take();
    }

    fn is_raised(&self) -> bool {
        matches!(self.watch.try_recv(), Err(TryRecvError::Disconnected))
    }
}

/// Run-wide cancellation, shared by every pipe of a run.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<Signal>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(Signal::new()))
    }

    /// Cancel the run. Idempotent.
    pub fn cancel(&self) {
        self.0.raise();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.is_raised()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned by [`Pipe::enqueue`] when the pipe is closed; gives the item
/// back to the caller.
#[derive(PartialEq, Eq)]
pub struct Closed<T>(pub T);

impl<T> fmt::Debug for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Closed(..)")
    }
}

impl<T> fmt::Display for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("pipe is closed")
    }
}

impl<T> std::error::Error for Closed<T> {}

/// A bounded, closable multi-producer multi-consumer queue.
pub struct Pipe<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    closed: Signal,
    cancel: CancelToken,
    capacity: usize,
}

impl<T> fmt::Debug for Pipe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("capacity", &self.capacity)
            .field("len", &self.receiver.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Pipe<T> {
    /// Create a pipe holding at most `capacity` items (at least one).
    #[must_use]
    pub fn new(capacity: usize, cancel: &CancelToken) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = channel::bounded(capacity);
        Self {
            sender,
            receiver,
            closed: Signal::new(),
            cancel: cancel.clone(),
            capacity,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Returns `true` once the pipe was closed or its run cancelled.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_raised() || self.cancel.is_cancelled()
    }

    /// Close the pipe, waking every blocked caller. Idempotent.
    pub fn close(&self) {
        self.closed.raise();
    }

    /// Add an item, blocking while the pipe is full.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] with the item if the pipe is closed before or
    /// while waiting.
    pub fn enqueue(&self, item: T) -> Result<(), Closed<T>> {
        if self.is_closed() {
            return Err(Closed(item));
        }

        let mut select = Select::new();
        let send_index = select.send(&self.sender);
        let closed_index = select.recv(&self.closed.watch);
        let cancel_index = select.recv(&self.cancel.0.watch);
        let operation = select.select();
        match operation.index() {
            i if i == send_index => operation
                .send(&self.sender, item)
                .map_err(|channel::SendError(item)| Closed(item)),
            i if i == closed_index => {
                let _ = operation.recv(&self.closed.watch);
                Err(Closed(item))
            }
            i => {
                debug_assert_eq!(i, cancel_index);
                let _ = operation.recv(&self.cancel.0.watch);
                Err(Closed(item))
            }
        }
    }

    /// Remove an item, blocking while the pipe is empty.
    ///
    /// Returns `None` once the pipe is closed.
    pub fn dequeue(&self) -> Option<T> {
        if self.is_closed() {
            return None;
        }

        let mut select = Select::new();
        let recv_index = select.recv(&self.receiver);
        let closed_index = select.recv(&self.closed.watch);
        let cancel_index = select.recv(&self.cancel.0.watch);
        let operation = select.select();
        match operation.index() {
            i if i == recv_index => operation.recv(&self.receiver).ok(),
            i if i == closed_index => {
                let _ = operation.recv(&self.closed.watch);
                None
            }
            i => {
                debug_assert_eq!(i, cancel_index);
                let _ = operation.recv(&self.cancel.0.watch);
                None
            }
        }
    }

    /// Remove an item if one is ready, without blocking.
    pub fn try_dequeue(&self) -> Option<T> {
        if self.is_closed() {
            return None;
        }
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn items_come_out_in_order() {
        let pipe = Pipe::new(3, &CancelToken::new());
        for i in 0..3 {
            pipe.enqueue(i).unwrap();
        }
        assert_eq!(pipe.len(), 3);
        assert_eq!(pipe.dequeue(), Some(0));
        assert_eq!(pipe.dequeue(), Some(1));
        assert_eq!(pipe.try_dequeue(), Some(2));
        assert_eq!(pipe.try_dequeue(), None);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let pipe = Pipe::<u8>::new(0, &CancelToken::new());
        assert_eq!(pipe.capacity(), 1);
    }

    #[test]
    fn full_pipe_blocks_until_space_frees() {
        let pipe = Pipe::new(1, &CancelToken::new());
        pipe.enqueue(1).unwrap();

        thread::scope(|s| {
            let producer = s.spawn(|| pipe.enqueue(2));
            thread::sleep(Duration::from_millis(50));
            assert!(!producer.is_finished());
            assert_eq!(pipe.dequeue(), Some(1));
            producer.join().unwrap().unwrap();
        });
        assert_eq!(pipe.dequeue(), Some(2));
    }

    #[test]
    fn close_wakes_blocked_consumers() {
        let pipe = Pipe::<u32>::new(2, &CancelToken::new());
        thread::scope(|s| {
            let consumers: Vec<_> = (0..3).map(|_| s.spawn(|| pipe.dequeue())).collect();
            thread::sleep(Duration::from_millis(50));
            pipe.close();
            for consumer in consumers {
                assert_eq!(consumer.join().unwrap(), None);
            }
        });
    }

    #[test]
    fn close_wakes_blocked_producer_and_returns_item() {
        let pipe = Pipe::new(1, &CancelToken::new());
        pipe.enqueue("first").unwrap();
        thread::scope(|s| {
            let producer = s.spawn(|| pipe.enqueue("second"));
            thread::sleep(Duration::from_millis(50));
            pipe.close();
            let Closed(item) = producer.join().unwrap().unwrap_err();
            assert_eq!(item, "second");
        });
    }

    #[test]
    fn closed_pipe_refuses_everything() {
        let pipe = Pipe::new(4, &CancelToken::new());
        pipe.enqueue(7).unwrap();
        pipe.close();
        pipe.close();
        assert!(pipe.is_closed());
        assert_eq!(pipe.dequeue(), None);
        assert_eq!(pipe.enqueue(8), Err(Closed(8)));
    }

    #[test]
    fn cancel_closes_every_pipe_of_the_run() {
        let token = CancelToken::new();
        let a = Pipe::<u8>::new(1, &token);
        let b = Pipe::<u8>::new(1, &token);
        let unrelated = Pipe::<u8>::new(1, &CancelToken::new());
        b.enqueue(1).unwrap();

        thread::scope(|s| {
            let waiting = s.spawn(|| a.dequeue());
            let blocked = s.spawn(|| b.enqueue(2));
            thread::sleep(Duration::from_millis(50));
            token.cancel();
            assert_eq!(waiting.join().unwrap(), None);
            assert!(blocked.join().unwrap().is_err());
        });
        assert!(token.is_cancelled());
        assert!(a.is_closed() && b.is_closed());
        assert!(!unrelated.is_closed());
    }
}
