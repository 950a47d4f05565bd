//! One CLI invocation's worth of pipeline: configuration, dataset, a ledger
//! restored from disk and written back after every mutation.
//!
//! A service holds an exclusive advisory lock on `<ledger>.lock` from the
//! moment it loads the ledger until it is dropped, so concurrent invocations
//! against the same ledger run one after another instead of overwriting each
//! other's charges.

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use queryshield_core::{
    config::BudgetConfig, policy::PolicyEngine, AuditEntry, AuditSink, BudgetError, BudgetLedger,
    BudgetStatus, ConfigError, HashChainAuditLog, LedgerState, ProtectionDriver, QueryExecutor,
    QueryResponse, RequestContext, ShieldConfig, ShieldError,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Shield(#[from] ShieldError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error("ledger file {path}: {details}")]
    Ledger { path: PathBuf, details: String },
    #[error("audit log {path}: {source}")]
    AuditLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct ShieldService {
    driver: ProtectionDriver,
    audit: Arc<HashChainAuditLog>,
    ledger_path: Option<PathBuf>,
    // Released when the service drops.
    _ledger_lock: Option<File>,
}

/// Sibling file carrying the advisory lock. The ledger itself is replaced by
/// rename on every persist, so a lock on it would not survive the first
/// write.
pub fn lock_path(ledger: &Path) -> PathBuf {
    let mut name = ledger
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("ledger"));
    name.push(".lock");
    ledger.with_file_name(name)
}

impl ShieldService {
    /// Builds the driver, restoring the ledger from `ledger_path` when the
    /// file exists, and applies any resets that fell due while the ledger
    /// was on disk. Blocks until no other service holds the ledger.
    pub fn open(
        config: &ShieldConfig,
        executor: Arc<dyn QueryExecutor>,
        ledger_path: Option<PathBuf>,
        now: DateTime<Utc>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let ledger_lock = ledger_path.as_deref().map(acquire_lock).transpose()?;
        let ledger = match &ledger_path {
            Some(path) if path.exists() => load_ledger(path, config.budget.clone())?,
            _ => BudgetLedger::new(config.budget.clone()),
        };
        let ledger = Arc::new(ledger);
        let audit = Arc::new(HashChainAuditLog::new(config.driver.audit_capacity));
        let policy = Arc::new(PolicyEngine::new(config.policy.clone())?);
        let sink: Arc<dyn AuditSink> = audit.clone();
        let driver =
            ProtectionDriver::with_state(config, policy, Arc::clone(&ledger), executor, sink)?;

        let service = Self {
            driver,
            audit,
            ledger_path,
            _ledger_lock: ledger_lock,
        };
        let reset = ledger.run_scheduled_resets(now);
        if !reset.is_empty() {
            info!("scheduled resets applied principals={}", reset.join(","));
            service.persist()?;
        }
        Ok(service)
    }

    pub fn driver(&self) -> &ProtectionDriver {
        &self.driver
    }

    pub fn audit(&self) -> &HashChainAuditLog {
        &self.audit
    }

    pub fn query(
        &self,
        sql: &str,
        context: &RequestContext,
    ) -> Result<QueryResponse, ServiceError> {
        let response = self.driver.process_query(sql, context)?;
        self.persist()?;
        Ok(response)
    }

    pub fn budget(&self, principal: &str) -> Result<BudgetStatus, ServiceError> {
        Ok(self.driver.get_budget_status(principal)?)
    }

    pub fn reset(&self, principal: &str) -> Result<BudgetStatus, ServiceError> {
        let status = self.driver.reset_budget(principal)?;
        self.persist()?;
        Ok(status)
    }

    /// Writes the ledger next to its final location, then renames it into
    /// place.
    pub fn persist(&self) -> Result<(), ServiceError> {
        let Some(path) = &self.ledger_path else {
            return Ok(());
        };
        let ledger_error = |details: String| ServiceError::Ledger {
            path: path.clone(),
            details,
        };
        let state = self.driver.ledger().export_state();
        let encoded =
            serde_json::to_vec_pretty(&state).map_err(|err| ledger_error(err.to_string()))?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, encoded).map_err(|err| ledger_error(err.to_string()))?;
        fs::rename(&staging, path).map_err(|err| ledger_error(err.to_string()))?;
        info!(
            "ledger persisted path={} accounts={}",
            path.display(),
            state.accounts.len()
        );
        Ok(())
    }

    /// Continues the hash chain already stored in the JSON-lines file at
    /// `path`, so entries appended later link to its last line. A missing or
    /// empty file leaves the chain at genesis. Call before the first query.
    pub fn continue_audit(&self, path: &Path) -> Result<(), ServiceError> {
        let io_error = |source| ServiceError::AuditLog {
            path: path.to_path_buf(),
            source,
        };
        let Some(last) = last_entry(path).map_err(io_error)? else {
            return Ok(());
        };
        self.audit
            .continue_from(&last)
            .map_err(|err| io_error(std::io::Error::other(err)))?;
        debug!(
            "audit chain continued path={} sequence={}",
            path.display(),
            last.sequence
        );
        Ok(())
    }

    /// Appends the retained audit entries to `path` as JSON lines.
    pub fn append_audit(&self, path: &Path) -> Result<usize, ServiceError> {
        let io_error = |source| ServiceError::AuditLog {
            path: path.to_path_buf(),
            source,
        };
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_error)?;
        let entries = self.audit.entries();
        for entry in &entries {
            let line = serde_json::to_string(entry)
                .map_err(|err| io_error(std::io::Error::other(err)))?;
            writeln!(file, "{line}").map_err(io_error)?;
        }
        Ok(entries.len())
    }
}

fn acquire_lock(ledger: &Path) -> Result<File, ServiceError> {
    let path = lock_path(ledger);
    let ledger_error = |details: String| ServiceError::Ledger {
        path: ledger.to_path_buf(),
        details,
    };
    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(|err| ledger_error(format!("open lock {}: {err}", path.display())))?;
    file.lock_exclusive()
        .map_err(|err| ledger_error(format!("lock {}: {err}", path.display())))?;
    debug!("ledger lock acquired path={}", path.display());
    Ok(file)
}

fn load_ledger(path: &Path, config: BudgetConfig) -> Result<BudgetLedger, ServiceError> {
    let ledger_error = |details: String| ServiceError::Ledger {
        path: path.to_path_buf(),
        details,
    };
    let contents = fs::read_to_string(path).map_err(|err| ledger_error(err.to_string()))?;
    let state: LedgerState =
        serde_json::from_str(&contents).map_err(|err| ledger_error(err.to_string()))?;
    Ok(BudgetLedger::from_state(config, state)?)
}

fn last_entry(path: &Path) -> std::io::Result<Option<AuditEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    last.map(|line| serde_json::from_str(&line).map_err(std::io::Error::other))
        .transpose()
}
