//! Bounded FIFO of commands waiting for a device to come back.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::QueueFullPolicy;
use crate::error::LinkError;
use crate::protocol::{Command, Response};

pub(crate) type CommandReply = oneshot::Sender<Result<Response, LinkError>>;

/// A command parked until its device reconnects.
#[derive(Debug)]
pub struct QueuedCommand {
    pub id: Uuid,
    pub command: Command,
    pub enqueued_at: Instant,
    /// Send attempts made so far.
    pub attempts: u32,
    /// Per-send timeout requested by the caller.
    pub timeout: Duration,
    reply: CommandReply,
}

impl QueuedCommand {
    pub(crate) fn new(command: Command, timeout: Duration, attempts: u32, reply: CommandReply) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
            enqueued_at: Instant::now(),
            attempts,
            timeout,
            reply,
        }
    }

    /// The caller stopped waiting (dropped its future).
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    pub(crate) fn complete(self, result: Result<Response, LinkError>) {
        // Receiver gone means the caller gave up; nothing left to notify.
        let _ = self.reply.send(result);
    }
}

/// Result of offering a command to a queue.
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the oldest entry was evicted to make room.
    Evicted(QueuedCommand),
    /// Queue was full; the new entry was refused.
    Rejected(QueuedCommand),
}

/// FIFO with a hard capacity and a fixed overflow policy.
#[derive(Debug)]
pub struct CommandQueue {
    items: VecDeque<QueuedCommand>,
    capacity: usize,
    policy: QueueFullPolicy,
}

impl CommandQueue {
    pub fn new(capacity: usize, policy: QueueFullPolicy) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            policy,
        }
    }

    pub fn push(&mut self, command: QueuedCommand) -> PushOutcome {
        if self.items.len() < self.capacity {
            self.items.push_back(command);
            return PushOutcome::Queued;
        }

        match self.policy {
            QueueFullPolicy::RejectNew => PushOutcome::Rejected(command),
            QueueFullPolicy::DropOldest => match self.items.pop_front() {
                Some(oldest) => {
                    self.items.push_back(command);
                    PushOutcome::Evicted(oldest)
                }
                // Zero capacity: nothing to evict.
                None => PushOutcome::Rejected(command),
            },
        }
    }

    /// Put a command back at the head after a failed send.
    pub(crate) fn requeue(&mut self, command: QueuedCommand) {
        self.items.push_front(command);
    }

    pub fn pop_front(&mut self) -> Option<QueuedCommand> {
        self.items.pop_front()
    }

    /// Enqueue time of the oldest entry.
    pub fn oldest(&self) -> Option<Instant> {
        self.items.iter().map(|c| c.enqueued_at).min()
    }

    /// Remove entries that have waited longer than `max_wait`.
    pub fn take_expired(&mut self, max_wait: Duration) -> Vec<QueuedCommand> {
        let now = Instant::now();
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .items
            .drain(..)
            .partition(|c| now.saturating_duration_since(c.enqueued_at) >= max_wait);
        self.items = kept.into();
        expired
    }

    pub fn take_all(&mut self) -> Vec<QueuedCommand> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(payload: &str) -> (QueuedCommand, oneshot::Receiver<Result<Response, LinkError>>) {
        let (tx, rx) = oneshot::channel();
        (QueuedCommand::new(Command::new(payload), Duration::from_secs(1), 0, tx), rx)
    }

    #[tokio::test]
    async fn reject_new_keeps_the_bound() {
        let mut queue = CommandQueue::new(2, QueueFullPolicy::RejectNew);
        assert!(matches!(queue.push(queued("A").0), PushOutcome::Queued));
        assert!(matches!(queue.push(queued("B").0), PushOutcome::Queued));

        match queue.push(queued("C").0) {
            PushOutcome::Rejected(c) => assert_eq!(c.command.payload(), "C"),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().unwrap().command.payload(), "A");
    }

    #[tokio::test]
    async fn drop_oldest_evicts_the_head() {
        let mut queue = CommandQueue::new(2, QueueFullPolicy::DropOldest);
        queue.push(queued("A").0);
        queue.push(queued("B").0);

        match queue.push(queued("C").0) {
            PushOutcome::Evicted(old) => assert_eq!(old.command.payload(), "A"),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(queue.len(), 2);

        let order: Vec<_> = queue
            .take_all()
            .into_iter()
            .map(|c| c.command.payload().to_string())
            .collect();
        assert_eq!(order, vec!["B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_taken_out() {
        let mut queue = CommandQueue::new(10, QueueFullPolicy::RejectNew);
        queue.push(queued("old").0);
        tokio::time::advance(Duration::from_secs(30)).await;
        queue.push(queued("new").0);

        let expired = queue.take_expired(Duration::from_secs(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].command.payload(), "old");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn dropped_receiver_marks_abandoned() {
        let (cmd, rx) = queued("A");
        assert!(!cmd.is_abandoned());
        drop(rx);
        assert!(cmd.is_abandoned());
    }
}
