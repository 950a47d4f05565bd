//! Per-principal epsilon accounting.
//!
//! Every account sits behind its own mutex inside a concurrent map. The
//! check, the increment and the transaction append of
//! [`BudgetLedger::check_and_consume`] happen under that mutex, so two
//! requests that each fit but together overshoot can never both succeed.
//! Resets are driven from outside through [`BudgetLedger::run_scheduled_resets`];
//! the ledger owns no timers.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Duration, Months, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::BudgetConfig;

/// Float slack applied to the `consumed + epsilon <= total` check so that
/// charges summing exactly to the total are not refused by rounding.
pub const BUDGET_TOLERANCE: f64 = 1e-12;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum BudgetError {
    #[error(
        "privacy budget exhausted for {principal}: requested {requested}, remaining {remaining}"
    )]
    Exhausted {
        principal: String,
        requested: f64,
        remaining: f64,
        next_reset: Option<DateTime<Utc>>,
    },
    #[error("no budget account for principal {0}")]
    UnknownPrincipal(String),
    #[error("epsilon charge must be finite and greater than zero (got {0})")]
    InvalidCharge(f64),
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ResetFrequency {
    #[default]
    Daily,
    Weekly,
    /// Calendar month, clamped to the last day of shorter months.
    Monthly,
    Never,
}

impl ResetFrequency {
    pub fn next_after(&self, last_reset: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ResetFrequency::Daily => last_reset.checked_add_signed(Duration::days(1)),
            ResetFrequency::Weekly => last_reset.checked_add_signed(Duration::weeks(1)),
            ResetFrequency::Monthly => last_reset.checked_add_months(Months::new(1)),
            ResetFrequency::Never => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BudgetAccount {
    pub principal: String,
    pub role: String,
    pub total: f64,
    pub consumed: f64,
    pub reset_frequency: ResetFrequency,
    /// When the account was opened; the reset schedule starts here.
    pub anchor: DateTime<Utc>,
    pub last_reset: DateTime<Utc>,
    pub transaction_count: u64,
}

impl BudgetAccount {
    pub fn remaining(&self) -> f64 {
        (self.total - self.consumed).max(0.0)
    }

    pub fn next_reset(&self) -> Option<DateTime<Utc>> {
        self.reset_frequency.next_after(self.last_reset)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BudgetTransaction {
    pub transaction_id: u64,
    pub principal: String,
    pub query_id: String,
    pub query_hash: String,
    pub epsilon: f64,
    pub mechanism: String,
    pub timestamp: DateTime<Utc>,
}

/// What a DP release is about to spend.
#[derive(Clone, Debug, PartialEq)]
pub struct BudgetCharge {
    pub epsilon: f64,
    pub query_id: String,
    pub query_hash: String,
    pub mechanism: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BudgetReceipt {
    pub transaction_id: u64,
    pub principal: String,
    pub epsilon: f64,
    pub consumed: f64,
    pub remaining: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BudgetStatus {
    pub principal: String,
    pub role: String,
    pub total: f64,
    pub consumed: f64,
    pub remaining: f64,
    pub transaction_count: u64,
    pub last_reset: DateTime<Utc>,
    pub next_reset: Option<DateTime<Utc>>,
}

/// Serializable snapshot of the whole ledger.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LedgerState {
    pub accounts: Vec<BudgetAccount>,
    pub transactions: Vec<BudgetTransaction>,
}

#[derive(Debug)]
struct AccountState {
    account: BudgetAccount,
    transactions: Vec<BudgetTransaction>,
}

impl AccountState {
    fn status(&self) -> BudgetStatus {
        let account = &self.account;
        BudgetStatus {
            principal: account.principal.clone(),
            role: account.role.clone(),
            total: account.total,
            consumed: account.consumed,
            remaining: account.remaining(),
            transaction_count: account.transaction_count,
            last_reset: account.last_reset,
            next_reset: account.next_reset(),
        }
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.account
            .next_reset()
            .map(|next| next <= now)
            .unwrap_or(false)
    }

    fn reset(&mut self, now: DateTime<Utc>) {
        self.account.consumed = 0.0;
        self.account.last_reset = now;
    }
}

pub struct BudgetLedger {
    config: BudgetConfig,
    accounts: DashMap<String, Arc<Mutex<AccountState>>>,
    sequence: AtomicU64,
}

impl BudgetLedger {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            accounts: DashMap::new(),
            sequence: AtomicU64::new(1),
        }
    }

    /// Rebuilds a ledger from a persisted snapshot.
    pub fn from_state(config: BudgetConfig, state: LedgerState) -> Result<Self, BudgetError> {
        let ledger = Self::new(config);
        let mut next_id = 1;
        for account in state.accounts {
            ledger.accounts.insert(
                account.principal.clone(),
                Arc::new(Mutex::new(AccountState {
                    account,
                    transactions: Vec::new(),
                })),
            );
        }
        for transaction in state.transactions {
            let handle = ledger.handle(&transaction.principal)?;
            next_id = next_id.max(transaction.transaction_id + 1);
            handle.lock().transactions.push(transaction);
        }
        ledger.sequence.store(next_id, Ordering::SeqCst);
        Ok(ledger)
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Opens an account with the role's period total unless one exists.
    pub fn ensure_account(&self, principal: &str, role: &str) -> BudgetStatus {
        self.ensure_account_at(principal, role, Utc::now())
    }

    pub fn ensure_account_at(
        &self,
        principal: &str,
        role: &str,
        now: DateTime<Utc>,
    ) -> BudgetStatus {
        let handle = self
            .accounts
            .entry(principal.to_string())
            .or_insert_with(|| {
                let total = self.config.total_for_role(role);
                info!("budget account opened principal={principal} role={role} total={total}");
                Arc::new(Mutex::new(AccountState {
                    account: BudgetAccount {
                        principal: principal.to_string(),
                        role: role.to_string(),
                        total,
                        consumed: 0.0,
                        reset_frequency: self.config.reset_frequency,
                        anchor: now,
                        last_reset: now,
                        transaction_count: 0,
                    },
                    transactions: Vec::new(),
                }))
            })
            .value()
            .clone();
        let status = handle.lock().status();
        status
    }

    /// The single atomic budget operation.
    pub fn check_and_consume(
        &self,
        principal: &str,
        charge: &BudgetCharge,
    ) -> Result<BudgetReceipt, BudgetError> {
        if !charge.epsilon.is_finite() || charge.epsilon <= 0.0 {
            return Err(BudgetError::InvalidCharge(charge.epsilon));
        }
        let handle = self.handle(principal)?;
        let mut state = handle.lock();
        let account = &state.account;
        if account.consumed + charge.epsilon > account.total + BUDGET_TOLERANCE {
            let remaining = account.remaining();
            warn!(
                "budget exhausted principal={principal} requested={} remaining={remaining}",
                charge.epsilon
            );
            return Err(BudgetError::Exhausted {
                principal: principal.to_string(),
                requested: charge.epsilon,
                remaining,
                next_reset: account.next_reset(),
            });
        }
        let timestamp = Utc::now();
        let transaction_id = self.sequence.fetch_add(1, Ordering::SeqCst);
        state.account.consumed += charge.epsilon;
        state.account.transaction_count += 1;
        state.transactions.push(BudgetTransaction {
            transaction_id,
            principal: principal.to_string(),
            query_id: charge.query_id.clone(),
            query_hash: charge.query_hash.clone(),
            epsilon: charge.epsilon,
            mechanism: charge.mechanism.clone(),
            timestamp,
        });
        let receipt = BudgetReceipt {
            transaction_id,
            principal: principal.to_string(),
            epsilon: charge.epsilon,
            consumed: state.account.consumed,
            remaining: state.account.remaining(),
            timestamp,
        };
        info!(
            "budget consumed principal={principal} epsilon={} consumed={} remaining={}",
            receipt.epsilon, receipt.consumed, receipt.remaining
        );
        Ok(receipt)
    }

    pub fn status(&self, principal: &str) -> Result<BudgetStatus, BudgetError> {
        let handle = self.handle(principal)?;
        let status = handle.lock().status();
        Ok(status)
    }

    pub fn reset(&self, principal: &str) -> Result<BudgetStatus, BudgetError> {
        self.reset_at(principal, Utc::now())
    }

    pub fn reset_at(
        &self,
        principal: &str,
        now: DateTime<Utc>,
    ) -> Result<BudgetStatus, BudgetError> {
        let handle = self.handle(principal)?;
        let mut state = handle.lock();
        state.reset(now);
        info!("budget reset principal={principal}");
        Ok(state.status())
    }

    /// Changes the period total, e.g. after a role change.
    pub fn set_total(&self, principal: &str, total: f64) -> Result<BudgetStatus, BudgetError> {
        if !total.is_finite() || total < 0.0 {
            return Err(BudgetError::InvalidCharge(total));
        }
        let handle = self.handle(principal)?;
        let mut state = handle.lock();
        state.account.total = total;
        info!("budget total updated principal={principal} total={total}");
        Ok(state.status())
    }

    /// Principals whose next reset is at or before `now`.
    pub fn due_for_reset(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<String> = self
            .handles()
            .into_iter()
            .filter(|(_, handle)| handle.lock().is_due(now))
            .map(|(principal, _)| principal)
            .collect();
        due.sort();
        due
    }

    /// Entry point for the external scheduler. Returns the principals reset.
    pub fn run_scheduled_resets(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut reset = Vec::new();
        for (principal, handle) in self.handles() {
            let mut state = handle.lock();
            if state.is_due(now) {
                state.reset(now);
                reset.push(principal);
            }
        }
        reset.sort();
        if !reset.is_empty() {
            info!("scheduled budget resets count={}", reset.len());
        }
        reset
    }

    /// Newest first, at most `limit` entries.
    pub fn history(
        &self,
        principal: &str,
        limit: usize,
    ) -> Result<Vec<BudgetTransaction>, BudgetError> {
        let handle = self.handle(principal)?;
        let state = handle.lock();
        Ok(state.transactions.iter().rev().take(limit).cloned().collect())
    }

    pub fn export_state(&self) -> LedgerState {
        let mut state = LedgerState::default();
        for (_, handle) in self.handles() {
            let guard = handle.lock();
            state.accounts.push(guard.account.clone());
            state.transactions.extend(guard.transactions.iter().cloned());
        }
        state
            .accounts
            .sort_by(|left, right| left.principal.cmp(&right.principal));
        state.transactions.sort_by_key(|tx| tx.transaction_id);
        state
    }

    fn handle(&self, principal: &str) -> Result<Arc<Mutex<AccountState>>, BudgetError> {
        self.accounts
            .get(principal)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BudgetError::UnknownPrincipal(principal.to_string()))
    }

    /// Clones the handles out so no map shard stays locked while an account
    /// mutex is held.
    fn handles(&self) -> Vec<(String, Arc<Mutex<AccountState>>)> {
        self.accounts
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn charge(epsilon: f64) -> BudgetCharge {
        BudgetCharge {
            epsilon,
            query_id: "q".into(),
            query_hash: "0123456789abcdef".into(),
            mechanism: "laplace".into(),
        }
    }

    fn ledger() -> BudgetLedger {
        let mut config = BudgetConfig::default();
        config.role_budgets.insert("admin".into(), 10.0);
        config.role_budgets.insert("analyst".into(), 5.0);
        BudgetLedger::new(config)
    }

    #[test]
    fn accounts_pick_up_role_totals() {
        let ledger = ledger();
        assert_eq!(ledger.ensure_account("root", "admin").total, 10.0);
        assert_eq!(ledger.ensure_account("ana", "analyst").total, 5.0);
        assert_eq!(ledger.ensure_account("guest", "viewer").total, 1.0);
        // second call keeps the existing account
        ledger.check_and_consume("guest", &charge(0.5)).unwrap();
        assert_eq!(ledger.ensure_account("guest", "admin").consumed, 0.5);
    }

    #[test]
    fn exhaustion_leaves_consumption_unchanged() {
        let ledger = ledger();
        ledger.ensure_account("alice", "viewer");
        ledger.check_and_consume("alice", &charge(0.9)).unwrap();
        let err = ledger.check_and_consume("alice", &charge(0.5)).unwrap_err();
        match err {
            BudgetError::Exhausted {
                remaining,
                requested,
                next_reset,
                ..
            } => {
                assert!((remaining - 0.1).abs() < 1e-9);
                assert_eq!(requested, 0.5);
                assert!(next_reset.is_some());
            }
            other => panic!("unexpected error {other:?}"),
        }
        let status = ledger.status("alice").unwrap();
        assert!((status.consumed - 0.9).abs() < 1e-12);
        assert_eq!(status.transaction_count, 1);
    }

    #[test]
    fn exact_total_is_reachable_despite_rounding() {
        let ledger = ledger();
        ledger.ensure_account("bob", "viewer");
        for _ in 0..10 {
            ledger.check_and_consume("bob", &charge(0.1)).unwrap();
        }
        assert!(ledger.check_and_consume("bob", &charge(0.1)).is_err());
    }

    #[test]
    fn sequential_charges_compose_additively() {
        let ledger = ledger();
        ledger.ensure_account("carol", "analyst");
        ledger.check_and_consume("carol", &charge(0.3)).unwrap();
        let receipt = ledger.check_and_consume("carol", &charge(0.7)).unwrap();
        assert!((receipt.consumed - 1.0).abs() < 1e-12);
        assert!((receipt.remaining - 4.0).abs() < 1e-12);
    }

    #[test]
    fn invalid_and_unknown_charges() {
        let ledger = ledger();
        assert_eq!(
            ledger.check_and_consume("nobody", &charge(0.1)),
            Err(BudgetError::UnknownPrincipal("nobody".into()))
        );
        ledger.ensure_account("dave", "viewer");
        for epsilon in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                ledger.check_and_consume("dave", &charge(epsilon)),
                Err(BudgetError::InvalidCharge(_))
            ));
        }
        assert_eq!(ledger.status("dave").unwrap().consumed, 0.0);
    }

    #[test]
    fn concurrent_consumers_never_overspend() {
        let ledger = ledger();
        ledger.ensure_account("shared", "viewer");
        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        let _ = ledger.check_and_consume("shared", &charge(0.03));
                    }
                });
            }
        });
        let status = ledger.status("shared").unwrap();
        assert!(status.consumed <= 1.0 + BUDGET_TOLERANCE);
        assert_eq!(status.transaction_count, 33);
        assert_eq!(ledger.history("shared", usize::MAX).unwrap().len(), 33);
    }

    #[test]
    fn scheduled_resets_follow_frequency() {
        let ledger = ledger();
        let start = Utc::now();
        ledger.ensure_account_at("erin", "viewer", start);
        ledger.check_and_consume("erin", &charge(0.6)).unwrap();
        assert!(ledger.due_for_reset(start + Duration::hours(23)).is_empty());
        let later = start + Duration::hours(25);
        assert_eq!(ledger.due_for_reset(later), vec!["erin".to_string()]);
        assert_eq!(ledger.run_scheduled_resets(later), vec!["erin".to_string()]);
        let status = ledger.status("erin").unwrap();
        assert_eq!(status.consumed, 0.0);
        assert_eq!(status.last_reset, later);
        assert_eq!(status.transaction_count, 1);
    }

    #[test]
    fn history_is_newest_first() {
        let ledger = ledger();
        ledger.ensure_account("fay", "admin");
        for epsilon in [0.1, 0.2, 0.3] {
            ledger.check_and_consume("fay", &charge(epsilon)).unwrap();
        }
        let history = ledger.history("fay", 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].epsilon, 0.3);
        assert_eq!(history[1].epsilon, 0.2);
    }

    #[test]
    fn state_survives_export_and_restore() {
        let ledger = ledger();
        ledger.ensure_account("gus", "analyst");
        ledger.check_and_consume("gus", &charge(1.5)).unwrap();
        ledger.set_total("gus", 6.0).unwrap();
        let state = ledger.export_state();
        let json = serde_json::to_string(&state).unwrap();
        let restored =
            BudgetLedger::from_state(ledger.config().clone(), serde_json::from_str(&json).unwrap())
                .unwrap();
        assert_eq!(restored.export_state(), state);
        let receipt = restored.check_and_consume("gus", &charge(0.5)).unwrap();
        assert_eq!(receipt.transaction_id, 2);
        assert!((receipt.remaining - 4.0).abs() < 1e-12);
    }

    #[test]
    fn monthly_schedule_uses_calendar_months() {
        let jan31 = DateTime::parse_from_rfc3339("2024-01-31T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = ResetFrequency::Monthly.next_after(jan31).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-02-29T00:00:00+00:00");
        assert_eq!(ResetFrequency::Never.next_after(jan31), None);
    }
}
