//! The two FIFO queues a session owns: outbound commands awaiting
//! delivery and inbound results nobody has claimed yet.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::envelope::{CommandEnvelope, CorrelationKey, ResultEnvelope};

/// Unbounded outbound queue. Producers never block; the single stream
/// consumer parks on [`CommandQueue::pop`] until work arrives.
#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: Mutex<VecDeque<CommandEnvelope>>,
    notify: Notify,
}

impl CommandQueue {
    pub fn push(&self, envelope: CommandEnvelope) {
        self.entries().push_back(envelope);
        self.notify.notify_waiters();
    }

    pub fn try_pop(&self) -> Option<CommandEnvelope> {
        self.entries().pop_front()
    }

    /// Waits until a command is available. Cancellation-safe: a command
    /// is only removed once this returns it.
    pub async fn pop(&self) -> CommandEnvelope {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(envelope) = self.try_pop() {
                return envelope;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<CommandEnvelope>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bounded holding pen for results that arrived with nobody waiting.
/// At capacity the oldest entry is evicted, never the newest.
#[derive(Debug)]
pub struct ResultQueue {
    entries: Mutex<VecDeque<ResultEnvelope>>,
    cap: usize,
}

impl ResultQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            cap: cap.max(1),
        }
    }

    /// Appends an entry, returning the evicted oldest one when full.
    pub fn push(&self, envelope: ResultEnvelope) -> Option<ResultEnvelope> {
        let mut entries = self.entries();
        let evicted = if entries.len() >= self.cap {
            entries.pop_front()
        } else {
            None
        };
        entries.push_back(envelope);
        evicted
    }

    pub fn try_pop(&self) -> Option<ResultEnvelope> {
        self.entries().pop_front()
    }

    /// Removes and returns the first entry matching the key, if any.
    pub fn take_match(&self, key: &CorrelationKey) -> Option<ResultEnvelope> {
        let mut entries = self.entries();
        let index = entries
            .iter()
            .position(|entry| entry.kind == key.kind && entry.key == key.key)?;
        entries.remove(index)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<ResultEnvelope>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::envelope::CommandKind;

    fn delete(block_id: &str) -> CommandEnvelope {
        CommandEnvelope::Delete {
            block_id: block_id.to_string(),
        }
    }

    fn result(kind: CommandKind, key: &str) -> ResultEnvelope {
        ResultEnvelope {
            kind,
            key: key.to_string(),
            success: true,
            error: None,
            created_id: None,
        }
    }

    #[test]
    fn commands_come_out_in_submission_order() {
        let queue = CommandQueue::default();
        queue.push(delete("a"));
        queue.push(delete("b"));
        queue.push(delete("c"));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop().unwrap().correlation_key(), "a");
        assert_eq!(queue.try_pop().unwrap().correlation_key(), "b");
        assert_eq!(queue.try_pop().unwrap().correlation_key(), "c");
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn pop_parks_until_a_command_arrives() {
        let queue = Arc::new(CommandQueue::default());
        let consumer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pop().await }
        });
        tokio::task::yield_now().await;
        queue.push(delete("late"));
        let envelope = consumer.await.unwrap();
        assert_eq!(envelope.correlation_key(), "late");
        assert!(queue.is_empty());
    }

    #[test]
    fn full_result_queue_evicts_the_oldest() {
        let queue = ResultQueue::new(2);
        assert!(queue.push(result(CommandKind::Delete, "k1")).is_none());
        assert!(queue.push(result(CommandKind::Delete, "k2")).is_none());
        let evicted = queue.push(result(CommandKind::Delete, "k3")).unwrap();
        assert_eq!(evicted.key, "k1");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn take_match_is_kind_aware() {
        let queue = ResultQueue::new(8);
        queue.push(result(CommandKind::Create, "shared"));
        queue.push(result(CommandKind::Delete, "shared"));
        let key = CorrelationKey {
            kind: CommandKind::Delete,
            key: "shared".to_string(),
        };
        let taken = queue.take_match(&key).unwrap();
        assert_eq!(taken.kind, CommandKind::Delete);
        assert_eq!(queue.len(), 1);
        assert!(queue.take_match(&key).is_none());
    }
}
