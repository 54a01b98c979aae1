//! One-shot completion handles for asynchronous requests.
//!
//! **Why**: every request handed to a reader thread or the player tick must
//! complete exactly once, even when the worker panics, the reader is stopped,
//! or the request is cancelled. A `Promise` is consumed by `complete`/`cancel`,
//! and dropping one that was never completed sends the empty result, so the
//! waiting `Ticket` always wakes up.
//!
//! **Used by**: `Reader` (per-unit tickets), `Player` (frame tickets)
//!
//! `None` on the ticket side is the explicit "empty" result: end of stream,
//! cancelled, rejected, or decode failure.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Create a connected promise/ticket pair
pub fn pair<T>() -> (Promise<T>, Ticket<T>) {
    let (tx, rx) = bounded(1);
    (Promise { tx: Some(tx) }, Ticket { rx, taken: false })
}

/// Producer side. Completes at most once; completes empty when dropped.
#[derive(Debug)]
pub struct Promise<T> {
    tx: Option<Sender<Option<T>>>,
}

impl<T> Promise<T> {
    pub fn complete(mut self, value: T) {
        self.send(Some(value));
    }

    /// Complete with the empty result
    pub fn cancel(mut self) {
        self.send(None);
    }

    /// Complete with `Some` or the empty result
    pub fn resolve(mut self, value: Option<T>) {
        self.send(value);
    }

    fn send(&mut self, value: Option<T>) {
        if let Some(tx) = self.tx.take() {
            // Ticket may be gone; nobody is waiting then
            let _ = tx.try_send(value);
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        self.send(None);
    }
}

/// Returned by `Ticket::wait_timeout` when nothing arrived in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout;

/// Consumer side of a request
#[derive(Debug)]
pub struct Ticket<T> {
    rx: Receiver<Option<T>>,
    taken: bool,
}

impl<T> Ticket<T> {
    /// Already-completed ticket carrying `value`
    pub fn ready(value: T) -> Self {
        let (promise, ticket) = pair();
        promise.complete(value);
        ticket
    }

    /// Already-completed ticket carrying the empty result
    pub fn empty() -> Self {
        let (promise, ticket) = pair();
        promise.cancel();
        ticket
    }

    /// Block until completed
    pub fn wait(mut self) -> Option<T> {
        if self.taken {
            return None;
        }
        self.taken = true;
        self.rx.recv().ok().flatten()
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<T>, Timeout> {
        if self.taken {
            return Ok(None);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(v) => {
                self.taken = true;
                Ok(v)
            }
            Err(RecvTimeoutError::Timeout) => Err(Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                self.taken = true;
                Ok(None)
            }
        }
    }

    /// Non-blocking take: `None` while pending, `Some(result)` exactly once
    pub fn try_take(&mut self) -> Option<Option<T>> {
        if self.taken {
            return None;
        }
        match self.rx.try_recv() {
            Ok(v) => {
                self.taken = true;
                Some(v)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.taken = true;
                Some(None)
            }
        }
    }

    /// True once a result is waiting to be taken
    pub fn is_ready(&self) -> bool {
        !self.taken && !self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_complete_from_other_thread() {
        let (promise, ticket) = pair::<u32>();
        let h = thread::spawn(move || promise.complete(7));
        assert_eq!(ticket.wait(), Some(7));
        h.join().unwrap();
    }

    /// Test: dropping an uncompleted promise
    /// Validates: the ticket still completes, with the empty result
    #[test]
    fn test_drop_completes_empty() {
        let (promise, mut ticket) = pair::<u32>();
        assert!(!ticket.is_ready());
        assert!(ticket.try_take().is_none());
        drop(promise);
        assert!(ticket.is_ready());
        assert_eq!(ticket.try_take(), Some(None));
        // Only once
        assert_eq!(ticket.try_take(), None);
    }

    #[test]
    fn test_wait_timeout() {
        let (promise, mut ticket) = pair::<&str>();
        assert_eq!(ticket.wait_timeout(Duration::from_millis(10)), Err(Timeout));
        promise.complete("done");
        assert_eq!(ticket.wait_timeout(Duration::from_millis(10)), Ok(Some("done")));
    }

    #[test]
    fn test_prebuilt_tickets() {
        assert_eq!(Ticket::ready(3).wait(), Some(3));
        assert_eq!(Ticket::<u8>::empty().wait(), None);
    }

    #[test]
    fn test_resolve_either_way() {
        let (promise, ticket) = pair::<u8>();
        promise.resolve(Some(4));
        assert_eq!(ticket.wait(), Some(4));

        let (promise, mut ticket) = pair::<u8>();
        promise.resolve(None);
        assert_eq!(ticket.try_take(), Some(None));
    }

    #[test]
    fn test_completing_after_ticket_dropped_is_harmless() {
        let (promise, ticket) = pair::<Vec<u8>>();
        drop(ticket);
        promise.complete(vec![1, 2, 3]);
    }
}
