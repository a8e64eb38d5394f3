//! TTL expiry sweeps.
//!
//! Undelivered events do not live forever: anything older than the retention
//! window is bulk-deleted by a periodic sweep. Expiry and ACK processing can
//! race freely; both resolve to the same idempotent store delete, so an event
//! ACKed mid-sweep is simply already gone.

use tracing::info;

use crate::store::{EventStore, StoreError};

/// Default retention window: 14 days.
pub const DEFAULT_RETENTION_MILLIS: u64 = 14 * 24 * 60 * 60 * 1000;

/// Default sweep interval: once a day.
pub const DEFAULT_INTERVAL_MILLIS: u64 = 24 * 60 * 60 * 1000;

/// Periodic expiry of events past the retention window.
#[derive(Debug, Clone)]
pub struct Reaper {
    retention_millis: u64,
    interval_millis: u64,
    last_sweep_millis: Option<u64>,
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_MILLIS, DEFAULT_INTERVAL_MILLIS)
    }
}

impl Reaper {
    /// Create a reaper with the given retention window and sweep interval.
    pub fn new(retention_millis: u64, interval_millis: u64) -> Self {
        Self { retention_millis, interval_millis, last_sweep_millis: None }
    }

    /// Retention window in milliseconds.
    pub fn retention_millis(&self) -> u64 {
        self.retention_millis
    }

    /// Whether a scheduled sweep is due. The first call after startup is
    /// always due.
    pub fn due(&self, now_millis: u64) -> bool {
        match self.last_sweep_millis {
            Some(last) => now_millis.saturating_sub(last) >= self.interval_millis,
            None => true,
        }
    }

    /// Delete every event older than the retention window. Returns the
    /// number deleted. Also invoked out of band by the admin trigger, which
    /// resets the periodic schedule.
    pub fn sweep<S: EventStore>(&mut self, store: &S, now_millis: u64) -> Result<u64, StoreError> {
        let cutoff = now_millis.saturating_sub(self.retention_millis);
        let expired = store.expire_older_than(cutoff)?;
        self.last_sweep_millis = Some(now_millis);

        if expired > 0 {
            info!(expired, cutoff, "expired undelivered events");
        }

        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use shroud_proto::{EventDraft, EventType, Metadata};
    use uuid::Uuid;

    use super::*;
    use crate::store::MemoryStore;

    const DAY: u64 = 24 * 60 * 60 * 1000;

    fn enqueue_at(store: &MemoryStore, recipient: &str, timestamp: u64) -> Uuid {
        let draft = EventDraft {
            event_id: Uuid::new_v4(),
            recipient_id: recipient.to_string(),
            sender_id: Some("sender".to_string()),
            event_type: EventType::Message,
            timestamp,
            metadata: Metadata::new(),
            encrypted_payload: vec![1],
        };
        store.put(draft, timestamp).unwrap().event_id
    }

    #[test]
    fn sweep_deletes_only_past_retention() {
        let store = MemoryStore::new();
        let mut reaper = Reaper::default();

        let now = 100 * DAY;
        enqueue_at(&store, "alice", now - 15 * DAY);
        let kept = enqueue_at(&store, "alice", now - 13 * DAY);

        assert_eq!(reaper.sweep(&store, now).unwrap(), 1);

        let pending = store.list_pending("alice", 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, kept);
    }

    #[test]
    fn event_exactly_at_cutoff_survives() {
        let store = MemoryStore::new();
        let mut reaper = Reaper::default();

        let now = 100 * DAY;
        enqueue_at(&store, "alice", now - 14 * DAY);

        assert_eq!(reaper.sweep(&store, now).unwrap(), 0);
    }

    #[test]
    fn due_follows_the_interval() {
        let store = MemoryStore::new();
        let mut reaper = Reaper::new(14 * DAY, DAY);

        // First sweep is always due.
        assert!(reaper.due(50 * DAY));
        reaper.sweep(&store, 50 * DAY).unwrap();

        assert!(!reaper.due(50 * DAY + DAY / 2));
        assert!(reaper.due(51 * DAY));
    }

    #[test]
    fn manual_sweep_resets_schedule() {
        let store = MemoryStore::new();
        let mut reaper = Reaper::new(14 * DAY, DAY);

        reaper.sweep(&store, 50 * DAY).unwrap();
        // Admin-triggered sweep half a day later.
        reaper.sweep(&store, 50 * DAY + DAY / 2).unwrap();

        // The next periodic sweep counts from the manual one.
        assert!(!reaper.due(51 * DAY));
        assert!(reaper.due(51 * DAY + DAY / 2));
    }

    #[test]
    fn ack_before_sweep_is_not_double_counted() {
        let store = MemoryStore::new();
        let mut reaper = Reaper::default();

        let now = 100 * DAY;
        let event_id = enqueue_at(&store, "alice", now - 20 * DAY);
        store.delete(event_id, "alice").unwrap();

        assert_eq!(reaper.sweep(&store, now).unwrap(), 0);

        // A late ACK after expiry is equally silent.
        store.delete(event_id, "alice").unwrap();
    }
}
