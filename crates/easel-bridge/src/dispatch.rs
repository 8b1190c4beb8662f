//! Delivery of queued commands to the one attached stream client.
//!
//! A session hands each new stream consumer a [`DispatchSession`] and
//! bumps a watch epoch; the previous consumer sees the bump and ends
//! its stream, so exactly one client drains the queue at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::envelope::{CommandEnvelope, CorrelationKey};
use crate::queue::CommandQueue;

/// One frame for the stream client: a command, or a liveness ping when
/// the channel has been quiet too long.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PushMessage {
    Command(CommandEnvelope),
    Heartbeat { heartbeat: bool },
}

impl PushMessage {
    fn heartbeat() -> Self {
        PushMessage::Heartbeat { heartbeat: true }
    }
}

/// Recently delivered keys, each barred from redelivery until its
/// cool-down expires. Bounds the damage of an enqueue-happy retry loop.
#[derive(Debug)]
pub struct DedupeSet {
    entries: Mutex<HashMap<CorrelationKey, Instant>>,
    cooldown: Duration,
}

impl DedupeSet {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cooldown,
        }
    }

    /// True when the key may be delivered now; records it for the
    /// cool-down window. Expired entries are pruned on the way in.
    pub fn try_admit(&self, key: &CorrelationKey) -> bool {
        let now = Instant::now();
        let mut entries = self.entries();
        entries.retain(|_, expires_at| *expires_at > now);
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.clone(), now + self.cooldown);
        true
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CorrelationKey, Instant>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The consuming side of one stream attachment.
#[derive(Debug)]
pub struct DispatchSession {
    commands: Arc<CommandQueue>,
    dedupe: Arc<DedupeSet>,
    epoch: watch::Receiver<u64>,
    my_epoch: u64,
    attached: Arc<AtomicBool>,
    heartbeat_after: Duration,
    last_emit: Instant,
}

impl DispatchSession {
    pub(crate) fn new(
        commands: Arc<CommandQueue>,
        dedupe: Arc<DedupeSet>,
        epoch: watch::Receiver<u64>,
        my_epoch: u64,
        attached: Arc<AtomicBool>,
        heartbeat_after: Duration,
    ) -> Self {
        Self {
            commands,
            dedupe,
            epoch,
            my_epoch,
            attached,
            heartbeat_after,
            last_emit: Instant::now(),
        }
    }

    /// The next frame to push, or `None` once this attachment has been
    /// superseded or its bridge torn down.
    ///
    /// Supersession is detected by comparing epoch values, not by
    /// change notification alone, so an attachment whose receiver
    /// started behind the current epoch still ends on its first poll.
    /// The biased branches keep a pending command ahead of the
    /// heartbeat timer. Commands inside the dedupe cool-down are
    /// dropped here, after the queue, so a duplicate never reaches the
    /// client.
    pub async fn next_message(&mut self) -> Option<PushMessage> {
        loop {
            let current = *self.epoch.borrow_and_update();
            if current != self.my_epoch {
                // A newer attachment took over. Queued commands stay
                // for the successor.
                info!(epoch = self.my_epoch, "push session superseded");
                return None;
            }
            let heartbeat_at = self.last_emit + self.heartbeat_after;
            tokio::select! {
                biased;
                changed = self.epoch.changed() => {
                    if changed.is_err() {
                        // Bridge dropped; no successor is coming.
                        return None;
                    }
                    // Loop back to compare epochs.
                }
                envelope = self.commands.pop() => {
                    let key = envelope.delivery_key();
                    if self.dedupe.try_admit(&key) {
                        self.last_emit = Instant::now();
                        debug!(key = %key, "delivering command");
                        return Some(PushMessage::Command(envelope));
                    }
                    warn!(key = %key, "suppressing duplicate delivery inside the cool-down");
                }
                () = sleep_until(heartbeat_at) => {
                    self.last_emit = Instant::now();
                    return Some(PushMessage::heartbeat());
                }
            }
        }
    }
}

impl Drop for DispatchSession {
    fn drop(&mut self) {
        // Only the current holder may clear the attached flag; a
        // superseded session must not clobber its successor's state.
        if *self.epoch.borrow() == self.my_epoch {
            self.attached.store(false, Ordering::Relaxed);
        }
    }
}
