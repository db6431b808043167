//! Per-meeting session bookkeeping.
//!
//! Guards the relay's two structural invariants: at most one active ingest
//! per meeting, and a bounded subscriber set. Also owns the per-meeting
//! segment counter, which only finals advance. All operations are atomic
//! with respect to concurrent callers; the map is sharded by meeting id.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestAttach {
    Attached,
    ConflictExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberAttach {
    Attached,
    OverLimit,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MeetingStats {
    pub subscribers: usize,
    pub ingest_active: bool,
}

#[derive(Debug)]
struct MeetingEntry {
    ingest_owner: Option<Uuid>,
    subscribers: HashSet<Uuid>,
    segment_counter: u64,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

impl Default for MeetingEntry {
    fn default() -> Self {
        Self {
            ingest_owner: None,
            subscribers: HashSet::new(),
            segment_counter: 0,
            created_at: Utc::now(),
        }
    }
}

impl MeetingEntry {
    fn is_quiescent(&self) -> bool {
        self.ingest_owner.is_none() && self.subscribers.is_empty()
    }
}

pub struct SessionRegistry {
    meetings: DashMap<String, MeetingEntry>,
    max_subscribers: usize,
    cleanup_grace: Duration,
}

impl SessionRegistry {
    pub fn new(max_subscribers: usize, cleanup_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            meetings: DashMap::new(),
            max_subscribers,
            cleanup_grace: cleanup_grace.max(Duration::from_secs(1)),
        })
    }

    /// Claims ingest ownership of a meeting. Succeeds only while no other
    /// session owns it; re-attaching the owning session is a no-op.
    pub fn attach_ingest(&self, meeting_id: &str, session: Uuid) -> IngestAttach {
        let mut entry = self.meetings.entry(meeting_id.to_string()).or_default();
        match entry.ingest_owner {
            Some(owner) if owner != session => IngestAttach::ConflictExists,
            _ => {
                entry.ingest_owner = Some(session);
                IngestAttach::Attached
            }
        }
    }

    /// Releases ingest ownership if `session` holds it.
    pub fn detach_ingest(self: &Arc<Self>, meeting_id: &str, session: Uuid) {
        let quiescent = {
            match self.meetings.get_mut(meeting_id) {
                Some(mut entry) => {
                    if entry.ingest_owner == Some(session) {
                        entry.ingest_owner = None;
                    }
                    entry.is_quiescent()
                }
                None => false,
            }
        };
        if quiescent {
            self.schedule_cleanup(meeting_id);
        }
    }

    /// Adds a subscriber, enforcing the per-meeting cap.
    pub fn attach_subscriber(&self, meeting_id: &str, session: Uuid) -> SubscriberAttach {
        let mut entry = self.meetings.entry(meeting_id.to_string()).or_default();
        if entry.subscribers.len() >= self.max_subscribers && !entry.subscribers.contains(&session)
        {
            return SubscriberAttach::OverLimit;
        }
        entry.subscribers.insert(session);
        SubscriberAttach::Attached
    }

    pub fn detach_subscriber(self: &Arc<Self>, meeting_id: &str, session: Uuid) {
        let quiescent = {
            match self.meetings.get_mut(meeting_id) {
                Some(mut entry) => {
                    entry.subscribers.remove(&session);
                    entry.is_quiescent()
                }
                None => false,
            }
        };
        if quiescent {
            self.schedule_cleanup(meeting_id);
        }
    }

    /// Atomically assigns the next final segment number, starting at 1.
    pub fn next_segment_no(&self, meeting_id: &str) -> u64 {
        let mut entry = self.meetings.entry(meeting_id.to_string()).or_default();
        entry.segment_counter += 1;
        entry.segment_counter
    }

    /// Number the next final will take; partials carry this as a
    /// provisional lookahead without advancing the counter.
    pub fn provisional_segment_no(&self, meeting_id: &str) -> u64 {
        self.meetings
            .get(meeting_id)
            .map(|e| e.segment_counter)
            .unwrap_or(0)
            + 1
    }

    pub fn stats(&self, meeting_id: &str) -> MeetingStats {
        match self.meetings.get(meeting_id) {
            Some(entry) => MeetingStats {
                subscribers: entry.subscribers.len(),
                ingest_active: entry.ingest_owner.is_some(),
            },
            None => MeetingStats {
                subscribers: 0,
                ingest_active: false,
            },
        }
    }

    pub fn meeting_count(&self) -> usize {
        self.meetings.len()
    }

    /// Removes a quiescent meeting after a short grace so rapid reconnects
    /// keep their segment counter.
    fn schedule_cleanup(self: &Arc<Self>, meeting_id: &str) {
        let registry = self.clone();
        let meeting_id = meeting_id.to_string();
        let grace = self.cleanup_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let removed = registry
                .meetings
                .remove_if(&meeting_id, |_, entry| entry.is_quiescent())
                .is_some();
            if removed {
                debug!(meeting_id, "meeting record removed after quiescence");
            }
        });
    }
}
