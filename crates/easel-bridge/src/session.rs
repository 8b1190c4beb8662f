//! Per-session bridge state and the registry that owns it.
//!
//! A [`Bridge`] is everything one agent/workspace pair shares: the
//! command queue, the correlation waiter, the dedupe set, and the
//! attachment epoch. Nothing here is global; two sessions never touch
//! the same state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::dispatch::{DedupeSet, DispatchSession};
use crate::envelope::{CommandEnvelope, CorrelationKey, ResultEnvelope};
use crate::queue::CommandQueue;
use crate::waiter::{CorrelationWaiter, ResultDisposition};

/// The command/result plumbing for a single session.
#[derive(Debug)]
pub struct Bridge {
    pub(crate) config: BridgeConfig,
    commands: Arc<CommandQueue>,
    pub(crate) waiter: CorrelationWaiter,
    dedupe: Arc<DedupeSet>,
    epoch: watch::Sender<u64>,
    attached: Arc<AtomicBool>,
    /// First slot placement per interaction gets a corrective warning
    /// instead of executing; see the create issuer.
    pub(crate) slot_warning_armed: AtomicBool,
    created_at: DateTime<Utc>,
    last_touch: Mutex<Instant>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            commands: Arc::new(CommandQueue::default()),
            waiter: CorrelationWaiter::new(config.parked_results_cap),
            dedupe: Arc::new(DedupeSet::new(config.dedupe_cooldown)),
            epoch,
            attached: Arc::new(AtomicBool::new(false)),
            slot_warning_armed: AtomicBool::new(true),
            created_at: Utc::now(),
            last_touch: Mutex::new(Instant::now()),
            config,
        }
    }

    /// Queues a command for push delivery and returns its delivery key.
    pub fn submit(&self, envelope: CommandEnvelope) -> CorrelationKey {
        self.touch();
        let key = envelope.delivery_key();
        debug!(key = %key, "queueing command");
        self.commands.push(envelope);
        key
    }

    /// Hands a callback result to its waiter, parking it when nobody is
    /// waiting. Always succeeds.
    pub fn accept_result(&self, envelope: ResultEnvelope) -> ResultDisposition {
        self.touch();
        let key = envelope.correlation_key();
        let disposition = self.waiter.deliver(envelope);
        debug!(key = %key, disposition = disposition.as_str(), "result accepted");
        disposition
    }

    /// Attaches a stream client, superseding any previous attachment.
    /// The old client's next poll ends its stream; queued commands are
    /// untouched and drain to the new client.
    pub fn attach_client(&self) -> DispatchSession {
        self.touch();
        self.attached.store(true, Ordering::Relaxed);
        // Bump and capture in one step so racing attaches each own a
        // distinct epoch. The dispatch side compares values, which
        // keeps a receiver subscribed after a newer publish safe too.
        let mut my_epoch = 0;
        self.epoch.send_modify(|epoch| {
            *epoch += 1;
            my_epoch = *epoch;
        });
        let receiver = self.epoch.subscribe();
        debug!(epoch = my_epoch, "stream client attached");
        DispatchSession::new(
            Arc::clone(&self.commands),
            Arc::clone(&self.dedupe),
            receiver,
            my_epoch,
            Arc::clone(&self.attached),
            self.config.heartbeat_after,
        )
    }

    /// Re-arms the one-shot slot placement warning for a fresh user
    /// interaction.
    pub fn begin_interaction(&self) {
        self.touch();
        self.slot_warning_armed.store(true, Ordering::Relaxed);
    }

    pub fn client_attached(&self) -> bool {
        self.attached.load(Ordering::Relaxed)
    }

    pub fn queued_commands(&self) -> usize {
        self.commands.len()
    }

    pub fn pending_waiters(&self) -> usize {
        self.waiter.pending_len()
    }

    pub fn parked_results(&self) -> usize {
        self.waiter.parked_len()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_touch().elapsed()
    }

    pub fn snapshot(&self, session_id: &str) -> SessionSnapshot {
        SessionSnapshot {
            session_id: session_id.to_string(),
            client_attached: self.client_attached(),
            queued_commands: self.queued_commands(),
            parked_results: self.parked_results(),
            pending_waiters: self.pending_waiters(),
            created_at: self.created_at,
            idle_seconds: self.idle_for().as_secs(),
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_touch() = Instant::now();
    }

    fn last_touch(&self) -> MutexGuard<'_, Instant> {
        self.last_touch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Operational view of one session, as reported by the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub client_attached: bool,
    pub queued_commands: usize,
    pub parked_results: usize,
    pub pending_waiters: usize,
    pub created_at: DateTime<Utc>,
    pub idle_seconds: u64,
}

/// All live session bridges, keyed by session id.
#[derive(Debug)]
pub struct SessionRegistry {
    config: BridgeConfig,
    sessions: Mutex<HashMap<String, Arc<Bridge>>>,
}

impl SessionRegistry {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches the session's bridge, creating it on first touch. Every
    /// surface goes through here, so a session exists as soon as any
    /// side mentions it.
    pub fn get_or_create(&self, session_id: &str) -> Arc<Bridge> {
        let mut sessions = self.sessions();
        if let Some(bridge) = sessions.get(session_id) {
            return Arc::clone(bridge);
        }
        info!(session_id, "creating session bridge");
        let bridge = Arc::new(Bridge::new(self.config.clone()));
        sessions.insert(session_id.to_string(), Arc::clone(&bridge));
        bridge
    }

    /// Drops a session outright. Its attached stream, if any, ends on
    /// the client's next poll.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions().remove(session_id).is_some();
        if removed {
            info!(session_id, "removed session bridge");
        }
        removed
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = {
            let sessions = self.sessions();
            sessions
                .iter()
                .map(|(session_id, bridge)| bridge.snapshot(session_id))
                .collect()
        };
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    /// Reclaims sessions with no attached client that have been idle
    /// past the threshold. Returns how many were dropped.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|session_id, bridge| {
            let keep = bridge.client_attached() || bridge.idle_for() <= max_idle;
            if !keep {
                info!(
                    session_id = %session_id,
                    idle_seconds = bridge.idle_for().as_secs(),
                    "evicting idle session"
                );
            }
            keep
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Bridge>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dispatch::PushMessage;
    use crate::envelope::CommandKind;

    fn delete(block_id: &str) -> CommandEnvelope {
        CommandEnvelope::Delete {
            block_id: block_id.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attaching_supersedes_the_previous_client() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut old_session = bridge.attach_client();
        let mut new_session = bridge.attach_client();

        assert_eq!(old_session.next_message().await, None);

        bridge.submit(delete("b1"));
        assert_eq!(
            new_session.next_message().await,
            Some(PushMessage::Command(delete("b1")))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_bridge_ends_its_stream() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut session = bridge.attach_client();
        drop(bridge);
        assert_eq!(session.next_message().await, None);
    }

    #[tokio::test]
    async fn snapshot_counts_queue_waiters_and_parked() {
        let bridge = Bridge::new(BridgeConfig::default());
        bridge.submit(delete("a"));
        bridge.submit(delete("b"));
        let _ticket = bridge
            .waiter
            .register(CorrelationKey {
                kind: CommandKind::Create,
                key: "r-1".to_string(),
            })
            .unwrap();
        bridge.accept_result(ResultEnvelope {
            kind: CommandKind::Delete,
            key: "orphan".to_string(),
            success: true,
            error: None,
            created_id: None,
        });

        let snapshot = bridge.snapshot("s1");
        assert_eq!(snapshot.session_id, "s1");
        assert_eq!(snapshot.queued_commands, 2);
        assert_eq!(snapshot.pending_waiters, 1);
        assert_eq!(snapshot.parked_results, 1);
        assert!(!snapshot.client_attached);

        let _session = bridge.attach_client();
        assert!(bridge.snapshot("s1").client_attached);
    }

    #[test]
    fn registry_reuses_a_live_session() {
        let registry = SessionRegistry::new(BridgeConfig::default());
        let first = registry.get_or_create("alpha");
        let again = registry.get_or_create("alpha");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removal_forgets_all_session_state() {
        let registry = SessionRegistry::new(BridgeConfig::default());
        let bridge = registry.get_or_create("alpha");
        bridge.submit(delete("b1"));
        assert!(registry.remove("alpha"));
        assert!(!registry.remove("alpha"));

        let fresh = registry.get_or_create("alpha");
        assert!(!Arc::ptr_eq(&bridge, &fresh));
        assert_eq!(fresh.queued_commands(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_spares_attached_and_recently_used_sessions() {
        let registry = SessionRegistry::new(BridgeConfig::default());
        let attached = registry.get_or_create("attached");
        let _session = attached.attach_client();
        registry.get_or_create("stale");
        let busy = registry.get_or_create("busy");

        tokio::time::advance(Duration::from_secs(600)).await;
        busy.submit(delete("b1"));
        tokio::time::advance(Duration::from_secs(301)).await;

        assert_eq!(registry.evict_idle(Duration::from_secs(900)), 1);
        let ids: Vec<String> = registry
            .snapshots()
            .into_iter()
            .map(|snapshot| snapshot.session_id)
            .collect();
        assert_eq!(ids, vec!["attached".to_string(), "busy".to_string()]);
    }
}
