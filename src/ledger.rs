use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Which component owns a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Dispatched by the admission queue.
    Call,
    /// Raced by the timeout guard.
    Request,
    /// A persistent-connection handshake in flight.
    Connection,
}

/// Request metadata attached to a ledger entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallMeta {
    pub url: String,
    pub method: String,
}

impl CallMeta {
    pub fn new(url: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
        }
    }
}

struct Entry {
    seq: u64,
    kind: EntryKind,
    meta: CallMeta,
    started_at: Instant,
    started_wall: DateTime<Utc>,
}

/// Read-only view of one in-flight entry.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerRecord {
    pub id: String,
    pub kind: EntryKind,
    pub url: String,
    pub method: String,
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_millis")]
    pub age: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

/// Bookkeeping map of in-flight calls and connection attempts.
///
/// Shared by the admission queue, the timeout guard and the socket client;
/// the health monitor only reads it through [`ConnectionLedger::snapshot`].
#[derive(Default)]
pub struct ConnectionLedger {
    inner: Mutex<Inner>,
}

impl ConnectionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new entry. Re-inserting an existing id restarts its clock.
    pub fn insert(&self, id: impl Into<String>, kind: EntryKind, meta: CallMeta) {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            id.into(),
            Entry {
                seq,
                kind,
                meta,
                started_at: Instant::now(),
                started_wall: Utc::now(),
            },
        );
    }

    pub fn remove(&self, id: &str) -> Option<CallMeta> {
        self.lock().entries.remove(id).map(|entry| entry.meta)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// Drop every entry. Returns how many were removed; safe on an empty ledger.
    pub fn force_clear(&self) -> usize {
        let mut inner = self.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        removed
    }

    /// Drop every entry of one kind, leaving other owners untouched.
    pub fn force_clear_kind(&self, kind: EntryKind) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.kind != kind);
        before - inner.entries.len()
    }

    /// Entries in insertion order.
    pub fn snapshot(&self) -> Vec<LedgerRecord> {
        let inner = self.lock();
        let now = Instant::now();
        let mut entries: Vec<(&String, &Entry)> = inner.entries.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.seq);
        entries
            .into_iter()
            .map(|(id, entry)| LedgerRecord {
                id: id.clone(),
                kind: entry.kind,
                url: entry.meta.url.clone(),
                method: entry.meta.method.clone(),
                started_at: entry.started_wall,
                age: now.saturating_duration_since(entry.started_at),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_kind(&self, kind: EntryKind) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.kind == kind)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Entries are plain data, a panicking holder cannot leave them half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
