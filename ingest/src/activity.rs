use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

const MAX_ENTRIES: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActivityEntry {
    pub integration_id: String,
    pub action: String,
    pub level: Level,
    pub title: String,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    entries: VecDeque<ActivityEntry>,
    unhealthy: HashSet<String>,
}

/// Operator-visible diagnostics per integration.
///
/// Every entry is also emitted through `tracing`. An `Error` entry marks the
/// integration unhealthy until a later clean run calls [`ActivityLog::mark_healthy`].
#[derive(Clone, Default)]
pub struct ActivityLog {
    inner: Arc<RwLock<Inner>>,
}

impl ActivityLog {
    pub fn warning(&self, integration_id: &str, action: &str, title: impl Into<String>) {
        let title = title.into();
        tracing::warn!(integration_id, action, "{title}");
        self.record(integration_id, action, Level::Warning, title);
    }

    pub fn error(&self, integration_id: &str, action: &str, title: impl Into<String>) {
        let title = title.into();
        tracing::error!(integration_id, action, "{title}");
        self.record(integration_id, action, Level::Error, title);
    }

    fn record(&self, integration_id: &str, action: &str, level: Level, title: String) {
        let mut inner = self.inner.write();
        if inner.entries.len() == MAX_ENTRIES {
            inner.entries.pop_front();
        }
        inner.entries.push_back(ActivityEntry {
            integration_id: integration_id.to_string(),
            action: action.to_string(),
            level,
            title,
            at: Utc::now(),
        });
        if level == Level::Error {
            inner.unhealthy.insert(integration_id.to_string());
        }
    }

    /// Entries of one integration, oldest first.
    pub fn entries(&self, integration_id: &str) -> Vec<ActivityEntry> {
        self.inner
            .read()
            .entries
            .iter()
            .filter(|entry| entry.integration_id == integration_id)
            .cloned()
            .collect()
    }

    pub fn is_healthy(&self, integration_id: &str) -> bool {
        !self.inner.read().unhealthy.contains(integration_id)
    }

    pub fn mark_healthy(&self, integration_id: &str) {
        self.inner.write().unhealthy.remove(integration_id);
    }
}
