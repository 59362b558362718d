//! Live worker registry
//!
//! In-memory map of the workers this process is driving, keyed by file id and
//! holding the resume token the worker owns. A persisted active status without
//! a matching entry means the worker died with a previous process.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;

use crate::job::ResumeToken;
use crate::orchestrator::{JobHandle, JobOutcome};

struct LiveEntry {
    token: ResumeToken,
    /// Accepted but waiting for the model loader
    queued: bool,
    registered_at: DateTime<Utc>,
    outcome: watch::Receiver<Option<JobOutcome>>,
}

/// What the status projection needs to know about a live worker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveState {
    pub token: ResumeToken,
    pub queued: bool,
    pub registered_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct Registry {
    entries: DashMap<String, LiveEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `token` as the live owner of `file_id`, replacing any older owner
    pub fn register(
        &self,
        file_id: &str,
        token: ResumeToken,
        queued: bool,
        outcome: watch::Receiver<Option<JobOutcome>>,
    ) -> JobHandle {
        let handle = JobHandle::new(file_id, token, outcome.clone());
        self.entries.insert(
            file_id.to_string(),
            LiveEntry {
                token,
                queued,
                registered_at: Utc::now(),
                outcome,
            },
        );
        handle
    }

    pub fn mark_running(&self, file_id: &str, token: ResumeToken) {
        if let Some(mut entry) = self.entries.get_mut(file_id) {
            if entry.token == token {
                entry.queued = false;
            }
        }
    }

    pub fn live_token(&self, file_id: &str) -> Option<ResumeToken> {
        self.entries.get(file_id).map(|entry| entry.token)
    }

    pub fn is_live(&self, file_id: &str, token: ResumeToken) -> bool {
        self.live_token(file_id) == Some(token)
    }

    pub fn state(&self, file_id: &str) -> Option<LiveState> {
        self.entries.get(file_id).map(|entry| LiveState {
            token: entry.token,
            queued: entry.queued,
            registered_at: entry.registered_at,
        })
    }

    /// Handle on the live worker of `file_id`, if any
    pub fn handle(&self, file_id: &str) -> Option<JobHandle> {
        self.entries
            .get(file_id)
            .map(|entry| JobHandle::new(file_id, entry.token, entry.outcome.clone()))
    }

    /// Remove the entry only if it still belongs to `token`
    pub fn remove(&self, file_id: &str, token: ResumeToken) -> bool {
        self.entries
            .remove_if(file_id, |_, entry| entry.token == token)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_requires_matching_token() {
        let registry = Registry::new();
        let (_tx1, rx1) = watch::channel(None);
        let (_tx2, rx2) = watch::channel(None);

        registry.register("f", ResumeToken(1), false, rx1);
        registry.register("f", ResumeToken(2), true, rx2);
        assert!(registry.is_live("f", ResumeToken(2)));
        assert!(!registry.is_live("f", ResumeToken(1)));

        // The superseded worker exiting must not unregister its successor
        assert!(!registry.remove("f", ResumeToken(1)));
        assert_eq!(registry.len(), 1);

        assert!(registry.state("f").unwrap().queued);
        registry.mark_running("f", ResumeToken(2));
        assert!(!registry.state("f").unwrap().queued);

        assert!(registry.remove("f", ResumeToken(2)));
        assert!(registry.is_empty());
        assert!(registry.handle("f").is_none());
    }
}
