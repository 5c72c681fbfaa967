//! Channels (§4.2): an unbounded FIFO with independent send/recv waiter
//! queues. At most one of the two queues is ever non-empty, because a
//! send or recv that finds a waiting peer is delivered immediately instead
//! of queueing.

use std::collections::VecDeque;

use crate::value::Value;

/// A pending `recv` waiting for a value.
pub(crate) struct RecvWaiter {
    pub(crate) callback: Box<dyn FnOnce(RecvOutcome)>,
}

/// Outcome handed to a `recv` callback: a delivered value, or the channel closed.
pub(crate) enum RecvOutcome {
    Delivered(Value),
    Closed,
}

/// A pending `send` waiting for a receiver, plus the handle used to cancel it.
pub(crate) struct SendWaiter {
    pub(crate) value: Value,
    pub(crate) callback: Box<dyn FnOnce(bool)>,
}

#[derive(Default)]
pub(crate) struct ChannelState {
    pending_sends: VecDeque<SendWaiter>,
    pending_recvs: VecDeque<RecvWaiter>,
    closed: bool,
}

impl ChannelState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// `send(v, cb)`: delivers immediately to a waiting `recv`, otherwise queues.
    pub(crate) fn send(&mut self, value: Value, callback: Box<dyn FnOnce(bool)>) {
        if self.closed {
            callback(false);
            return;
        }
        if let Some(waiter) = self.pending_recvs.pop_front() {
            (waiter.callback)(RecvOutcome::Delivered(value));
            callback(true);
            return;
        }
        self.pending_sends.push_back(SendWaiter { value, callback });
    }

    /// `recv(cb)`: delivers immediately from a waiting `send`, otherwise queues.
    pub(crate) fn recv(&mut self, callback: Box<dyn FnOnce(RecvOutcome)>) {
        if let Some(waiter) = self.pending_sends.pop_front() {
            callback(RecvOutcome::Delivered(waiter.value));
            (waiter.callback)(true);
            return;
        }
        if self.closed {
            callback(RecvOutcome::Closed);
            return;
        }
        self.pending_recvs.push_back(RecvWaiter { callback });
    }

    /// `close()`: every pending send sees `false`, every pending recv sees `Closed`.
    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for waiter in self.pending_sends.drain(..) {
            (waiter.callback)(false);
        }
        for waiter in self.pending_recvs.drain(..) {
            (waiter.callback)(RecvOutcome::Closed);
        }
    }

    #[must_use]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

impl std::fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelState")
            .field("pending_sends", &self.pending_sends.len())
            .field("pending_recvs", &self.pending_recvs.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn fifo_per_direction() {
        let mut chan = ChannelState::new();
        let received = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let received = received.clone();
            chan.send(Value::Number(f64::from(i)), Box::new(move |_ok| received.borrow_mut().push(-1)));
        }
        for _ in 0..3 {
            let received = received.clone();
            chan.recv(Box::new(move |outcome| {
                if let RecvOutcome::Delivered(Value::Number(n)) = outcome {
                    received.borrow_mut().push(n as i64);
                }
            }));
        }
        assert_eq!(*received.borrow(), vec![0, -1, 1, -1, 2, -1]);
    }

    #[test]
    fn close_fails_pending_send_and_recv() {
        let mut chan = ChannelState::new();
        let send_ok = Rc::new(RefCell::new(None));
        let send_ok2 = send_ok.clone();
        chan.send(Value::Null, Box::new(move |ok| *send_ok2.borrow_mut() = Some(ok)));
        chan.close();
        assert_eq!(*send_ok.borrow(), Some(false));

        let mut chan2 = ChannelState::new();
        chan2.close();
        let recv_closed = Rc::new(RefCell::new(false));
        let recv_closed2 = recv_closed.clone();
        chan2.recv(Box::new(move |outcome| {
            *recv_closed2.borrow_mut() = matches!(outcome, RecvOutcome::Closed);
        }));
        assert!(*recv_closed.borrow());
    }
}
