use std::collections::VecDeque;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RejectionCode;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    QuerySubmitted {
        query_id: String,
        principal: String,
        role: String,
        query_hash: String,
    },
    PrivacyApplied {
        query_id: String,
        principal: String,
        method: String,
        mechanism: Option<String>,
        epsilon: Option<f64>,
        columns: Vec<String>,
        rows_suppressed: usize,
    },
    QueryRejected {
        query_id: String,
        principal: String,
        code: RejectionCode,
        reason: String,
    },
    BudgetConsumed {
        query_id: String,
        principal: String,
        transaction_id: u64,
        epsilon: f64,
        remaining: f64,
    },
    BudgetReset {
        principal: String,
    },
    ConfigReloaded {
        query_rules: usize,
        column_rules: usize,
    },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    QuerySubmitted,
    PrivacyApplied,
    QueryRejected,
    BudgetConsumed,
    BudgetReset,
    ConfigReloaded,
}

impl AuditEvent {
    pub fn submitted(query_id: &str, principal: &str, role: &str, query_hash: &str) -> Self {
        Self::QuerySubmitted {
            query_id: query_id.into(),
            principal: principal.into(),
            role: role.into(),
            query_hash: query_hash.into(),
        }
    }

    pub fn rejected(
        query_id: &str,
        principal: &str,
        code: RejectionCode,
        reason: impl Into<String>,
    ) -> Self {
        Self::QueryRejected {
            query_id: query_id.into(),
            principal: principal.into(),
            code,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> AuditEventKind {
        match self {
            AuditEvent::QuerySubmitted { .. } => AuditEventKind::QuerySubmitted,
            AuditEvent::PrivacyApplied { .. } => AuditEventKind::PrivacyApplied,
            AuditEvent::QueryRejected { .. } => AuditEventKind::QueryRejected,
            AuditEvent::BudgetConsumed { .. } => AuditEventKind::BudgetConsumed,
            AuditEvent::BudgetReset { .. } => AuditEventKind::BudgetReset,
            AuditEvent::ConfigReloaded { .. } => AuditEventKind::ConfigReloaded,
        }
    }

    pub fn principal(&self) -> Option<&str> {
        match self {
            AuditEvent::QuerySubmitted { principal, .. }
            | AuditEvent::PrivacyApplied { principal, .. }
            | AuditEvent::QueryRejected { principal, .. }
            | AuditEvent::BudgetConsumed { principal, .. }
            | AuditEvent::BudgetReset { principal } => Some(principal),
            AuditEvent::ConfigReloaded { .. } => None,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Drops every event.
#[derive(Clone, Debug, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _event: AuditEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    pub previous_hash: String,
    pub hash: String,
}

#[derive(Serialize)]
struct EntryBody<'a> {
    sequence: u64,
    timestamp: &'a DateTime<Utc>,
    event: &'a AuditEvent,
}

fn entry_hash(
    previous_hash: &str,
    sequence: u64,
    timestamp: &DateTime<Utc>,
    event: &AuditEvent,
) -> anyhow::Result<String> {
    let body = serde_json::to_vec(&EntryBody {
        sequence,
        timestamp,
        event,
    })
    .context("serialize audit entry")?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(&body);
    Ok(hasher.finalize().to_hex().to_string())
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("audit chain broken at sequence {sequence}")]
pub struct ChainBreak {
    pub sequence: u64,
}

struct ChainState {
    entries: VecDeque<AuditEntry>,
    head: String,
    next_sequence: u64,
}

/// Tamper-evident in-memory audit trail. Each entry hashes the previous
/// entry's hash together with its own canonical JSON body. Only the newest
/// `capacity` entries are retained; verification starts from the oldest
/// retained entry.
pub struct HashChainAuditLog {
    capacity: usize,
    state: Mutex<ChainState>,
}

impl HashChainAuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(ChainState {
                entries: VecDeque::new(),
                head: GENESIS_HASH.to_string(),
                next_sequence: 0,
            }),
        }
    }

    /// Links the next emitted entry to `last`, an entry persisted by an
    /// earlier log. Only an empty log can be continued.
    pub fn continue_from(&self, last: &AuditEntry) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if !state.entries.is_empty() {
            anyhow::bail!("audit log already holds {} entries", state.entries.len());
        }
        state.head = last.hash.clone();
        state.next_sequence = last.sequence + 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn head(&self) -> String {
        self.state.lock().head.clone()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.state.lock().entries.iter().cloned().collect()
    }

    pub fn by_principal(&self, principal: &str) -> Vec<AuditEntry> {
        self.filtered(|entry| entry.event.principal() == Some(principal))
    }

    pub fn by_kind(&self, kind: AuditEventKind) -> Vec<AuditEntry> {
        self.filtered(|entry| entry.event.kind() == kind)
    }

    pub fn verify_chain(&self) -> Result<(), ChainBreak> {
        let state = self.state.lock();
        verify(state.entries.iter())
    }

    fn filtered(&self, keep: impl Fn(&AuditEntry) -> bool) -> Vec<AuditEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|entry| keep(entry))
            .cloned()
            .collect()
    }
}

fn verify<'a>(entries: impl Iterator<Item = &'a AuditEntry>) -> Result<(), ChainBreak> {
    let mut expected_previous: Option<&str> = None;
    for entry in entries {
        let broken = ChainBreak {
            sequence: entry.sequence,
        };
        if let Some(previous) = expected_previous {
            if previous != entry.previous_hash {
                return Err(broken);
            }
        }
        let recomputed = entry_hash(
            &entry.previous_hash,
            entry.sequence,
            &entry.timestamp,
            &entry.event,
        )
        .map_err(|_| ChainBreak {
            sequence: entry.sequence,
        })?;
        if recomputed != entry.hash {
            return Err(broken);
        }
        expected_previous = Some(entry.hash.as_str());
    }
    Ok(())
}

impl AuditSink for HashChainAuditLog {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let timestamp = Utc::now();
        let sequence = state.next_sequence;
        let hash = entry_hash(&state.head, sequence, &timestamp, &event)?;
        let entry = AuditEntry {
            sequence,
            timestamp,
            event,
            previous_hash: state.head.clone(),
            hash: hash.clone(),
        };
        state.entries.push_back(entry);
        while state.entries.len() > self.capacity {
            state.entries.pop_front();
        }
        state.head = hash;
        state.next_sequence += 1;
        Ok(())
    }
}
