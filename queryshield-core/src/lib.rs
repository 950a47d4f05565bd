//! QueryShield privacy pipeline.
//!
//! A request flows through the analyzer, the sensitivity calculator and the
//! policy engine, then through the DP or de-identification mechanisms, with
//! DP releases paid for from the per-principal budget ledger. The
//! [`ProtectionDriver`] wires the stages together; policy, ledger, executor
//! and audit sink are injected so callers control their lifetimes.

pub mod analyzer;
pub mod audit;
pub mod budget;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod executor;
pub mod policy;
pub mod sensitivity;
pub mod transform;

pub use queryshield_mechanisms as mechanisms;

pub use crate::analyzer::{analyze, query_fingerprint, AnalysisResult};
pub use crate::audit::{AuditEntry, AuditEvent, AuditSink, HashChainAuditLog, NoopAuditSink};
pub use crate::budget::{BudgetError, BudgetLedger, BudgetStatus, LedgerState, ResetFrequency};
pub use crate::config::{load_config, ConfigError, ConfigFormat, ShieldConfig};
pub use crate::context::RequestContext;
pub use crate::driver::{
    PrivacyMetadata, ProtectedPayload, ProtectedResult, ProtectionDriver, QueryResponse,
};
pub use crate::error::{Rejection, RejectionCode, ShieldError, ShieldResult};
pub use crate::executor::{InMemoryExecutor, QueryExecutor, QueryOutput};
pub use crate::policy::{MethodTag, PolicyDecision, PolicyEngine, ProtectionMethod};
pub use crate::sensitivity::{SensitivityCalculator, SensitivityEstimate};
