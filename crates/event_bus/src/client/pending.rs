//! Per-channel FIFO of outgoing operations with at most one in flight.

use crate::types::ChannelState;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Resolves to `true` once the broker acknowledged the publish, `false` if
/// the channel failed or closed first.
pub type PublishFuture = Shared<BoxFuture<'static, bool>>;

/// Resolves to the response, or `None` if the request was not handled or the
/// channel failed or closed first.
pub type RequestFuture = Shared<BoxFuture<'static, Option<String>>>;

struct Pending<T> {
    line: String,
    sender: oneshot::Sender<T>,
}

/// The queue state of one producer channel. `T` is the completion value,
/// `failed` what every future resolves to when the channel goes down.
pub(crate) struct PendingQueue<T> {
    state: ChannelState,
    failed: T,
    /// The front entry is on the wire when this is set
    in_flight: bool,
    queue: VecDeque<Pending<T>>,
    last: Option<Shared<BoxFuture<'static, T>>>,
}

impl<T> PendingQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(failed: T) -> Self {
        Self {
            state: ChannelState::Open,
            failed,
            in_flight: false,
            queue: VecDeque::new(),
            last: None,
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Queues `line` and returns its completion future, plus the line itself
    /// if it should go on the wire right away.
    pub(crate) fn enqueue(&mut self, line: String) -> (Shared<BoxFuture<'static, T>>, Option<String>) {
        if !self.state.is_open() {
            let failed = future::ready(self.failed.clone()).boxed().shared();
            self.last = Some(failed.clone());
            return (failed, None);
        }

        let (sender, receiver) = oneshot::channel();
        let failed = self.failed.clone();
        let completion = receiver.map(move |result| result.unwrap_or(failed)).boxed().shared();
        self.last = Some(completion.clone());

        let send_now = if self.in_flight {
            None
        } else {
            self.in_flight = true;
            Some(line.clone())
        };
        self.queue.push_back(Pending { line, sender });
        (completion, send_now)
    }

    /// Resolves the in-flight entry and returns the next line to send.
    ///
    /// Returns `Err(())` if nothing was in flight.
    pub(crate) fn complete(&mut self, value: T) -> Result<Option<String>, ()> {
        if !self.in_flight {
            return Err(());
        }
        if let Some(done) = self.queue.pop_front() {
            let _ = done.sender.send(value);
        }
        match self.queue.front() {
            Some(next) => Ok(Some(next.line.clone())),
            None => {
                self.in_flight = false;
                Ok(None)
            }
        }
    }

    /// Moves the channel to a terminal state and fails everything queued.
    /// Returns false if the channel was not open.
    pub(crate) fn fail(&mut self, state: ChannelState) -> bool {
        if !self.state.is_open() {
            return false;
        }
        self.state = state;
        self.in_flight = false;
        for pending in self.queue.drain(..) {
            let _ = pending.sender.send(self.failed.clone());
        }
        true
    }

    /// The future of the most recently enqueued operation, if any.
    pub(crate) fn last(&self) -> Option<Shared<BoxFuture<'static, T>>> {
        self.last.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_only_one_entry_in_flight() {
        let mut queue = PendingQueue::new(false);

        let (first, line) = queue.enqueue("1 SEND q:t:a\n".to_string());
        assert_eq!(line.as_deref(), Some("1 SEND q:t:a\n"));
        let (second, line) = queue.enqueue("1 SEND q:t:b\n".to_string());
        assert!(line.is_none());

        assert_eq!(queue.complete(true), Ok(Some("1 SEND q:t:b\n".to_string())));
        assert!(first.await);
        assert_eq!(queue.complete(true), Ok(None));
        assert!(second.await);
        assert!(!queue.has_in_flight());
        assert_eq!(queue.complete(true), Err(()));
    }

    #[tokio::test]
    async fn test_fail_resolves_pending_and_later_entries() {
        let mut queue: PendingQueue<Option<String>> = PendingQueue::new(None);
        let (first, _) = queue.enqueue("a".to_string());
        let (second, _) = queue.enqueue("b".to_string());

        assert!(queue.fail(ChannelState::Errored));
        assert!(!queue.fail(ChannelState::Closed));
        assert_eq!(queue.state(), ChannelState::Errored);
        assert_eq!(first.await, None);
        assert_eq!(second.clone().await, None);
        assert_eq!(second.await, None);

        let (late, line) = queue.enqueue("c".to_string());
        assert!(line.is_none());
        assert_eq!(late.await, None);
    }

    #[tokio::test]
    async fn test_last_tracks_most_recent_entry() {
        let mut queue = PendingQueue::new(false);
        assert!(queue.last().is_none());
        let _ = queue.enqueue("a".to_string());
        let _ = queue.enqueue("b".to_string());
        let last = queue.last().unwrap();

        queue.complete(true).unwrap();
        assert!(last.peek().is_none());
        queue.complete(true).unwrap();
        assert!(last.await);
    }
}
