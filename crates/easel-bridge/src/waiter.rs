//! Correlation between submitted commands and their callbacks.
//!
//! Every in-flight command registers a oneshot channel keyed by its
//! [`CorrelationKey`]. Callback delivery resolves the channel directly;
//! there is no polling loop anywhere. Results that match no waiter are
//! parked in a bounded queue so a retried command can still claim an
//! answer that arrived after its first attempt gave up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until};
use tracing::warn;

use crate::envelope::{CorrelationKey, ResultEnvelope};
use crate::queue::ResultQueue;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("no result for {key} within {timeout_secs}s")]
    Timeout {
        key: CorrelationKey,
        timeout_secs: u64,
    },
    #[error("a result for {key} is already being awaited")]
    AlreadyPending { key: CorrelationKey },
    #[error("the result channel for {key} closed unexpectedly")]
    ChannelClosed { key: CorrelationKey },
}

/// What happened to a delivered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDisposition {
    /// Handed straight to a registered waiter.
    Claimed,
    /// Nobody was waiting; held in the parked queue.
    Parked,
}

impl ResultDisposition {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultDisposition::Claimed => "claimed",
            ResultDisposition::Parked => "parked",
        }
    }
}

#[derive(Debug)]
struct PendingSlot {
    /// Guards against a stale ticket's drop removing a newer
    /// registration that reuses the same key.
    generation: u64,
    sender: oneshot::Sender<ResultEnvelope>,
}

#[derive(Debug)]
pub struct CorrelationWaiter {
    pending: Mutex<HashMap<CorrelationKey, PendingSlot>>,
    parked: ResultQueue,
    generations: AtomicU64,
}

impl CorrelationWaiter {
    pub fn new(parked_cap: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            parked: ResultQueue::new(parked_cap),
            generations: AtomicU64::new(0),
        }
    }

    /// Claims the key for one in-flight command. Refused while an
    /// earlier command with the same key is still being awaited.
    pub fn register(&self, key: CorrelationKey) -> Result<PendingTicket<'_>, WaitError> {
        let (sender, receiver) = oneshot::channel();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending();
        if pending.contains_key(&key) {
            return Err(WaitError::AlreadyPending { key });
        }
        pending.insert(key.clone(), PendingSlot { generation, sender });
        drop(pending);
        Ok(PendingTicket {
            waiter: self,
            key,
            generation,
            receiver,
        })
    }

    /// Routes a result to its waiter, or parks it when nobody is
    /// waiting. Never fails and never blocks.
    pub fn deliver(&self, envelope: ResultEnvelope) -> ResultDisposition {
        let key = envelope.correlation_key();
        let mut pending = self.pending();
        if let Some(slot) = pending.remove(&key) {
            // Send while still holding the map lock: a waiter whose
            // timeout lost the race can then always recover the value
            // from its channel after it fails to find this entry.
            match slot.sender.send(envelope) {
                Ok(()) => return ResultDisposition::Claimed,
                Err(envelope) => {
                    drop(pending);
                    self.park(envelope);
                    return ResultDisposition::Parked;
                }
            }
        }
        drop(pending);
        self.park(envelope);
        ResultDisposition::Parked
    }

    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    fn park(&self, envelope: ResultEnvelope) {
        let key = envelope.correlation_key();
        if let Some(evicted) = self.parked.push(envelope) {
            warn!(
                key = %key,
                evicted = %evicted.correlation_key(),
                "parked result queue full, dropping the oldest entry"
            );
        }
    }

    fn deregister(&self, key: &CorrelationKey, generation: u64) -> bool {
        let mut pending = self.pending();
        match pending.get(key) {
            Some(slot) if slot.generation == generation => {
                pending.remove(key);
                true
            }
            _ => false,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<CorrelationKey, PendingSlot>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A registered claim on one correlation key. Dropping it (including by
/// cancellation) releases the key; a result already handed to it is
/// parked rather than lost.
#[derive(Debug)]
pub struct PendingTicket<'a> {
    waiter: &'a CorrelationWaiter,
    key: CorrelationKey,
    generation: u64,
    receiver: oneshot::Receiver<ResultEnvelope>,
}

impl PendingTicket<'_> {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Waits for the matching result, checking the parked queue first so
    /// an answer that outlived an earlier attempt is not lost.
    pub async fn wait(mut self, timeout: Duration) -> Result<ResultEnvelope, WaitError> {
        if let Some(parked) = self.waiter.parked.take_match(&self.key) {
            // Claim back the registration before consuming the parked
            // entry. A delivery that won the race to the map has
            // already sent into this channel; that envelope goes back
            // to the parked queue instead of vanishing with the
            // receiver.
            self.waiter.deregister(&self.key, self.generation);
            if let Ok(delivered) = self.receiver.try_recv() {
                self.waiter.park(delivered);
            }
            return Ok(parked);
        }
        let deadline = Instant::now() + timeout;
        tokio::select! {
            outcome = &mut self.receiver => {
                outcome.map_err(|_| WaitError::ChannelClosed { key: self.key.clone() })
            }
            () = sleep_until(deadline) => {
                if !self.waiter.deregister(&self.key, self.generation) {
                    // Delivery beat the timeout to the map; the value is
                    // already in our channel.
                    if let Ok(envelope) = self.receiver.try_recv() {
                        return Ok(envelope);
                    }
                }
                Err(WaitError::Timeout {
                    key: self.key.clone(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }
}

impl Drop for PendingTicket<'_> {
    fn drop(&mut self) {
        self.waiter.deregister(&self.key, self.generation);
        // A result delivered but never polled would otherwise vanish
        // with the receiver; push it back for a later waiter.
        if let Ok(delivered) = self.receiver.try_recv() {
            self.waiter.park(delivered);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::envelope::CommandKind;

    fn key(kind: CommandKind, id: &str) -> CorrelationKey {
        CorrelationKey {
            kind,
            key: id.to_string(),
        }
    }

    fn ok_result(kind: CommandKind, id: &str) -> ResultEnvelope {
        ResultEnvelope {
            kind,
            key: id.to_string(),
            success: true,
            error: None,
            created_id: Some("abc123".to_string()),
        }
    }

    #[tokio::test]
    async fn delivered_result_resolves_the_waiter() {
        let waiter = CorrelationWaiter::new(16);
        let ticket = waiter.register(key(CommandKind::Create, "r-1")).unwrap();
        let disposition = waiter.deliver(ok_result(CommandKind::Create, "r-1"));
        assert_eq!(disposition, ResultDisposition::Claimed);
        let envelope = ticket.wait(Duration::from_secs(8)).await.unwrap();
        assert_eq!(envelope.created_id.as_deref(), Some("abc123"));
        assert_eq!(waiter.pending_len(), 0);
        assert_eq!(waiter.parked_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_after_exactly_the_window() {
        let waiter = CorrelationWaiter::new(16);
        let ticket = waiter.register(key(CommandKind::Delete, "xyz")).unwrap();
        let started = Instant::now();
        let err = ticket.wait(Duration::from_secs(8)).await.unwrap_err();
        assert_eq!(started.elapsed(), Duration::from_secs(8));
        assert_eq!(
            err,
            WaitError::Timeout {
                key: key(CommandKind::Delete, "xyz"),
                timeout_secs: 8,
            }
        );
        assert_eq!(waiter.pending_len(), 0);
        assert_eq!(waiter.parked_len(), 0);
    }

    #[tokio::test]
    async fn unmatched_result_parks_until_claimed() {
        let waiter = CorrelationWaiter::new(16);
        let disposition = waiter.deliver(ok_result(CommandKind::Delete, "xyz"));
        assert_eq!(disposition, ResultDisposition::Parked);
        assert_eq!(waiter.parked_len(), 1);

        let ticket = waiter.register(key(CommandKind::Delete, "xyz")).unwrap();
        let envelope = ticket.wait(Duration::from_secs(8)).await.unwrap();
        assert!(envelope.success);
        assert_eq!(waiter.parked_len(), 0);
    }

    #[tokio::test]
    async fn result_claimed_before_the_first_poll_is_pushed_back() {
        let waiter = CorrelationWaiter::new(16);
        let stale = ResultEnvelope {
            kind: CommandKind::Delete,
            key: "xyz".to_string(),
            success: false,
            error: Some("not found".to_string()),
            created_id: None,
        };
        assert_eq!(waiter.deliver(stale), ResultDisposition::Parked);

        // A fresh result lands between registration and the first poll.
        let ticket = waiter.register(key(CommandKind::Delete, "xyz")).unwrap();
        assert_eq!(
            waiter.deliver(ok_result(CommandKind::Delete, "xyz")),
            ResultDisposition::Claimed
        );

        // Arrival order wins, and the claimed envelope survives for the
        // next waiter instead of vanishing with the receiver.
        let envelope = ticket.wait(Duration::from_secs(8)).await.unwrap();
        assert!(!envelope.success);
        assert_eq!(waiter.pending_len(), 0);
        assert_eq!(waiter.parked_len(), 1);

        let retry = waiter.register(key(CommandKind::Delete, "xyz")).unwrap();
        let recovered = retry.wait(Duration::from_secs(8)).await.unwrap();
        assert!(recovered.success);
        assert_eq!(waiter.parked_len(), 0);
    }

    #[tokio::test]
    async fn parked_results_do_not_match_other_kinds() {
        let waiter = CorrelationWaiter::new(16);
        waiter.deliver(ok_result(CommandKind::Create, "shared"));
        let ticket = waiter.register(key(CommandKind::Delete, "shared")).unwrap();
        waiter.deliver(ok_result(CommandKind::Delete, "shared"));
        let envelope = ticket.wait(Duration::from_secs(8)).await.unwrap();
        assert_eq!(envelope.kind, CommandKind::Delete);
        assert_eq!(waiter.parked_len(), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_is_refused() {
        let waiter = CorrelationWaiter::new(16);
        let first = waiter.register(key(CommandKind::Delete, "xyz")).unwrap();
        let second = waiter.register(key(CommandKind::Delete, "xyz"));
        assert_eq!(
            second.unwrap_err(),
            WaitError::AlreadyPending {
                key: key(CommandKind::Delete, "xyz"),
            }
        );
        waiter.deliver(ok_result(CommandKind::Delete, "xyz"));
        assert!(first.wait(Duration::from_secs(8)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_after_timeout_is_parked() {
        let waiter = CorrelationWaiter::new(16);
        let ticket = waiter.register(key(CommandKind::Delete, "xyz")).unwrap();
        let err = ticket.wait(Duration::from_secs(8)).await.unwrap_err();
        assert!(matches!(err, WaitError::Timeout { .. }));

        let disposition = waiter.deliver(ok_result(CommandKind::Delete, "xyz"));
        assert_eq!(disposition, ResultDisposition::Parked);
        assert_eq!(waiter.parked_len(), 1);
    }

    #[tokio::test]
    async fn dropping_a_ticket_releases_its_key() {
        let waiter = CorrelationWaiter::new(16);
        let ticket = waiter.register(key(CommandKind::Variable, "r-2")).unwrap();
        drop(ticket);
        assert_eq!(waiter.pending_len(), 0);
        assert!(waiter.register(key(CommandKind::Variable, "r-2")).is_ok());
    }

    #[tokio::test]
    async fn dropping_a_resolved_ticket_parks_its_result() {
        let waiter = CorrelationWaiter::new(16);
        let ticket = waiter.register(key(CommandKind::Delete, "xyz")).unwrap();
        assert_eq!(
            waiter.deliver(ok_result(CommandKind::Delete, "xyz")),
            ResultDisposition::Claimed
        );

        drop(ticket);
        assert_eq!(waiter.pending_len(), 0);
        assert_eq!(waiter.parked_len(), 1);
    }

    #[tokio::test]
    async fn stale_ticket_drop_spares_a_fresh_registration() {
        let waiter = CorrelationWaiter::new(16);
        let first = waiter.register(key(CommandKind::Delete, "xyz")).unwrap();
        waiter.deliver(ok_result(CommandKind::Delete, "xyz"));

        // Same key re-registered while the resolved first ticket is
        // still alive; dropping the first must not evict the second.
        let second = waiter.register(key(CommandKind::Delete, "xyz")).unwrap();
        drop(first);
        assert_eq!(waiter.pending_len(), 1);

        waiter.deliver(ok_result(CommandKind::Delete, "xyz"));
        assert!(second.wait(Duration::from_secs(8)).await.is_ok());
    }
}
