//! Audit trail for sensitive operations.
//!
//! A fixed-capacity ring buffer of [`AuditEntry`] records. Operations are
//! classified into tiers by a static table; only tiers named in the
//! configuration are recorded (default: admin only). Appends are O(1) and
//! overwrite the oldest slot when the buffer is full.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Audit classification of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Read,
    Write,
    Admin,
}

/// Static operation → tier table.
///
/// Auth, identity, and rule-set mutations are admin tier. Store mutations
/// are write tier. Everything else observes state and is read tier.
pub fn operation_tier(operation: &str) -> Tier {
    if operation.starts_with("auth.") || operation.starts_with("identity.") {
        return Tier::Admin;
    }
    match operation {
        "store.insert" | "store.update" | "store.delete" | "store.clear" => Tier::Write,
        "rules.add" | "rules.remove" | "rules.enable" | "rules.disable" => Tier::Admin,
        _ => Tier::Read,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub operation: String,
    pub resource: String,
    pub result: AuditResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub remote_address: String,
}

/// Callback invoked for every accepted entry, outside the internal lock.
pub type AuditSink = Arc<dyn Fn(&AuditEntry) + Send + Sync>;

#[derive(Clone)]
pub struct AuditConfig {
    /// Tiers that get recorded.
    pub tiers: HashSet<Tier>,
    pub max_entries: usize,
    pub sink: Option<AuditSink>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            tiers: HashSet::from([Tier::Admin]),
            max_entries: DEFAULT_MAX_ENTRIES,
            sink: None,
        }
    }
}

/// Conjunctive query filter. `from`/`to` are inclusive millisecond bounds;
/// `limit` applies after filtering.
#[derive(Debug, Default)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub operation: Option<String>,
    pub result: Option<AuditResult>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub limit: Option<usize>,
}

pub struct AuditLog {
    tiers: HashSet<Tier>,
    max_entries: usize,
    sink: Option<AuditSink>,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new(config: AuditConfig) -> Self {
        // A single-slot buffer is legal; zero is not.
        let max_entries = config.max_entries.max(1);
        Self {
            tiers: config.tiers,
            max_entries,
            sink: config.sink,
            entries: Mutex::new(VecDeque::with_capacity(max_entries.min(1024))),
        }
    }

    /// Whether operations of this tier are recorded at all. Callers can use
    /// this to skip building an entry for unaudited tiers.
    pub fn records(&self, tier: Tier) -> bool {
        self.tiers.contains(&tier)
    }

    /// Append one entry if its operation's tier is audited.
    ///
    /// The sink runs after the buffer lock is released, so a slow sink never
    /// blocks other appenders.
    pub fn append(&self, entry: AuditEntry) {
        if !self.records(operation_tier(&entry.operation)) {
            return;
        }
        {
            let mut entries = self.entries.lock().expect("audit lock poisoned");
            if entries.len() == self.max_entries {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        if let Some(sink) = &self.sink {
            sink(&entry);
        }
    }

    pub fn size(&self) -> usize {
        self.entries.lock().expect("audit lock poisoned").len()
    }

    /// Newest-first query with conjunctive filters.
    pub fn query(&self, filter: &AuditQuery) -> Vec<AuditEntry> {
        let entries = self.entries.lock().expect("audit lock poisoned");
        let matching = entries.iter().rev().filter(|e| {
            filter
                .user_id
                .as_ref()
                .is_none_or(|u| e.user_id.as_deref() == Some(u.as_str()))
                && filter.operation.as_ref().is_none_or(|op| &e.operation == op)
                && filter.result.is_none_or(|r| e.result == r)
                && filter.from.is_none_or(|from| e.timestamp >= from)
                && filter.to.is_none_or(|to| e.timestamp <= to)
        });
        match filter.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(operation: &str, user: &str, timestamp: i64) -> AuditEntry {
        AuditEntry {
            timestamp,
            user_id: Some(user.to_string()),
            session_id: None,
            operation: operation.to_string(),
            resource: "users".to_string(),
            result: AuditResult::Success,
            error: None,
            details: None,
            remote_address: "127.0.0.1:9".to_string(),
        }
    }

    fn admin_log(max_entries: usize) -> AuditLog {
        AuditLog::new(AuditConfig {
            max_entries,
            ..AuditConfig::default()
        })
    }

    #[test]
    fn tier_table() {
        assert_eq!(operation_tier("auth.login"), Tier::Admin);
        assert_eq!(operation_tier("identity.issueToken"), Tier::Admin);
        assert_eq!(operation_tier("rules.add"), Tier::Admin);
        assert_eq!(operation_tier("store.insert"), Tier::Write);
        assert_eq!(operation_tier("store.all"), Tier::Read);
        assert_eq!(operation_tier("store.subscribe"), Tier::Read);
        assert_eq!(operation_tier("rules.fire"), Tier::Read);
    }

    #[test]
    fn unaudited_tiers_are_skipped() {
        let log = admin_log(16);
        log.append(entry("store.insert", "u1", 1));
        log.append(entry("auth.login", "u1", 2));
        assert_eq!(log.size(), 1);
    }

    #[test]
    fn ring_drops_oldest_when_full() {
        let log = AuditLog::new(AuditConfig {
            tiers: HashSet::from([Tier::Read, Tier::Write, Tier::Admin]),
            max_entries: 3,
            sink: None,
        });
        for t in 1..=5 {
            log.append(entry("store.all", "u1", t));
        }
        assert_eq!(log.size(), 3);
        let all = log.query(&AuditQuery::default());
        let stamps: Vec<i64> = all.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![5, 4, 3]);
    }

    #[test]
    fn single_slot_buffer_keeps_newest() {
        let log = admin_log(1);
        for t in 1..=4 {
            log.append(entry("auth.login", "u1", t));
        }
        assert_eq!(log.size(), 1);
        assert_eq!(log.query(&AuditQuery::default())[0].timestamp, 4);
    }

    #[test]
    fn filters_are_conjunctive_and_limit_applies_after() {
        let log = admin_log(16);
        log.append(entry("auth.login", "alice", 10));
        log.append(entry("auth.login", "bob", 20));
        log.append(entry("auth.logout", "alice", 30));
        log.append(entry("auth.login", "alice", 40));

        let got = log.query(&AuditQuery {
            user_id: Some("alice".into()),
            operation: Some("auth.login".into()),
            ..AuditQuery::default()
        });
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].timestamp, 40);
        assert_eq!(got[1].timestamp, 10);

        let got = log.query(&AuditQuery {
            user_id: Some("alice".into()),
            limit: Some(2),
            ..AuditQuery::default()
        });
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].timestamp, 40);
        assert_eq!(got[1].timestamp, 30);

        let got = log.query(&AuditQuery {
            from: Some(20),
            to: Some(30),
            ..AuditQuery::default()
        });
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn sink_fires_per_accepted_entry() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_sink = hits.clone();
        let log = AuditLog::new(AuditConfig {
            tiers: HashSet::from([Tier::Admin]),
            max_entries: 4,
            sink: Some(Arc::new(move |_| {
                hits_sink.fetch_add(1, Ordering::SeqCst);
            })),
        });
        log.append(entry("auth.login", "u1", 1));
        log.append(entry("store.all", "u1", 2)); // read tier — not accepted
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
