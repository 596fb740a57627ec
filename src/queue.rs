//! Single-flight request queue for the UDP gateways.
//!
//! A gateway owns one socket and sends one request at a time. Requests are
//! queued in arrival order; the head goes on the wire only when nothing is
//! in flight, and stays the correlation target until it resolves, times
//! out, or is cancelled. Responses whose opcode does not match the head are
//! stale replies from earlier retries and are ignored by the caller.
//!
//! The queue itself never touches the socket: the owning gateway loop asks
//! for the next packet to send and reports what came back. Each pending
//! request carries a oneshot sender which is consumed on resolution, so a
//! request settles exactly once.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::Error;
use crate::mapping::Nonce;

/// A request waiting for its turn on the socket
pub(crate) struct Pending<R, C> {
    /// Request opcode, used to correlate the response
    pub opcode: u8,
    /// Encoded packet, kept for the (single) send
    pub packet: Vec<u8>,
    /// Resolved with the parsed response; `None` for gateway-internal
    /// requests such as refreshes, whose failures are only logged
    pub reply: Option<oneshot::Sender<Result<R, Error>>>,
    /// Mapping row tied to this request, when there is one
    pub nonce: Option<Nonce>,
    /// Per-request deadline, armed when the packet is sent
    pub timeout: Duration,
    /// Caller context the gateway needs back on completion
    pub ctx: C,
    deadline: Option<Instant>,
}

impl<R, C> Pending<R, C> {
    pub fn new(
        opcode: u8,
        packet: Vec<u8>,
        reply: Option<oneshot::Sender<Result<R, Error>>>,
        nonce: Option<Nonce>,
        timeout: Duration,
        ctx: C,
    ) -> Self {
        Self {
            opcode,
            packet,
            reply,
            nonce,
            timeout,
            ctx,
            deadline: None,
        }
    }

    /// Settles the request. A missing or dropped receiver is fine: the
    /// caller may have been cancelled from its side already.
    pub fn resolve(self, result: Result<R, Error>) {
        if let Some(tx) = self.reply {
            tx.send(result).ok();
        }
    }
}

pub(crate) struct RequestQueue<R, C> {
    pending: VecDeque<Pending<R, C>>,
    inflight: bool,
}

impl<R, C> RequestQueue<R, C> {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            inflight: false,
        }
    }

    pub fn push(&mut self, request: Pending<R, C>) {
        self.pending.push_back(request);
    }

    /// When idle and non-empty, marks the head as in flight, arms its
    /// deadline and returns the packet to put on the wire
    pub fn next_to_send(&mut self) -> Option<&[u8]> {
        if self.inflight {
            return None;
        }
        let head = self.pending.front_mut()?;
        head.deadline = Some(Instant::now() + head.timeout);
        self.inflight = true;
        Some(&head.packet)
    }

    /// Whether an in-flight request is waiting for a response
    pub fn in_flight(&self) -> bool {
        self.inflight
    }

    /// Whether the in-flight head was sent with this opcode
    pub fn head_matches(&self, opcode: u8) -> bool {
        self.inflight && self.pending.front().map(|p| p.opcode) == Some(opcode)
    }

    /// Deadline of the in-flight request, if any
    pub fn deadline(&self) -> Option<Instant> {
        if !self.inflight {
            return None;
        }
        self.pending.front().and_then(|p| p.deadline)
    }

    /// Takes the in-flight head off the queue for resolution
    pub fn complete(&mut self) -> Option<Pending<R, C>> {
        if !self.inflight {
            return None;
        }
        self.inflight = false;
        self.pending.pop_front()
    }

    /// Removes the pending request for this mapping, clearing the
    /// in-flight slot when it was the head
    pub fn cancel(&mut self, nonce: &Nonce) -> Option<Pending<R, C>> {
        let i = self
            .pending
            .iter()
            .position(|p| p.nonce.as_ref() == Some(nonce))?;
        if i == 0 {
            self.inflight = false;
        }
        self.pending.remove(i)
    }

    /// Whether some queued request already targets this mapping
    pub fn contains(&self, nonce: &Nonce) -> bool {
        self.pending.iter().any(|p| p.nonce.as_ref() == Some(nonce))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Empties the queue, returning every pending request for rejection
    pub fn drain(&mut self) -> impl Iterator<Item = Pending<R, C>> + '_ {
        self.inflight = false;
        self.pending.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(opcode: u8, nonce: Option<Nonce>) -> (Pending<u32, ()>, oneshot::Receiver<Result<u32, Error>>) {
        let (tx, rx) = oneshot::channel();
        let pending = Pending::new(
            opcode,
            vec![opcode],
            Some(tx),
            nonce,
            Duration::from_secs(10),
            (),
        );
        (pending, rx)
    }

    #[tokio::test]
    async fn fifo_single_flight() {
        let mut queue = RequestQueue::new();
        let (a, mut a_rx) = request(1, None);
        let (b, _b_rx) = request(2, None);
        queue.push(a);
        queue.push(b);

        // only the head goes on the wire
        assert_eq!(queue.next_to_send().unwrap(), &[1]);
        assert!(queue.next_to_send().is_none());
        assert!(queue.head_matches(1));
        assert!(!queue.head_matches(2));

        // B is not sent until A settles
        queue.complete().unwrap().resolve(Ok(7));
        assert_eq!(a_rx.try_recv().unwrap().unwrap(), 7);
        assert_eq!(queue.next_to_send().unwrap(), &[2]);
    }

    #[tokio::test]
    async fn cancelling_the_head_clears_the_inflight_slot() {
        let mut queue = RequestQueue::new();
        let nonce = [9u8; 12];
        let (a, _a_rx) = request(1, Some(nonce));
        let (b, _b_rx) = request(1, None);
        queue.push(a);
        queue.push(b);
        queue.next_to_send();

        assert!(queue.contains(&nonce));
        let cancelled = queue.cancel(&nonce).unwrap();
        cancelled.resolve(Err(Error::Aborted));
        assert!(!queue.in_flight());
        assert!(!queue.contains(&nonce));

        // the next request can now be sent
        assert!(queue.next_to_send().is_some());
    }

    #[tokio::test]
    async fn drain_rejects_everything_once() {
        let mut queue: RequestQueue<u32, ()> = RequestQueue::new();
        let (a, mut a_rx) = request(1, None);
        queue.push(a);
        queue.next_to_send();

        for pending in queue.drain().collect::<Vec<_>>() {
            pending.resolve(Err(Error::Closed));
        }
        assert!(matches!(a_rx.try_recv().unwrap(), Err(Error::Closed)));
        assert!(queue.is_empty());
        assert!(!queue.in_flight());
    }
}
