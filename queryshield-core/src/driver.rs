//! The protection driver: one request from SQL text to a protected release.
//!
//! Steps run strictly in order: analyze, estimate sensitivity, decide,
//! validate the mechanism plan, execute, compute the release, charge the
//! budget (DP only) and package. The release is computed before the charge
//! and dropped if the charge fails, so nothing leaves the driver before the
//! budget has been debited and no budget is spent on a request that later
//! fails.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use queryshield_mechanisms::{
    anonymize, exponential, key_from_hex, CalibratedNoise, DpMechanism, NoiseEngine, NoiseParams,
    Row, SparseVector,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    analyzer::{analyze, query_fingerprint, AnalysisResult},
    audit::{AuditEvent, AuditSink},
    budget::{BudgetCharge, BudgetLedger, BudgetStatus},
    config::{ConfigError, ShieldConfig},
    context::RequestContext,
    error::{Rejection, RejectionCode, ShieldError, ShieldResult},
    executor::{QueryExecutor, QueryOutput},
    policy::{
        ColumnTransform, CompiledRuleSet, DeidPlan, DpParameters, MethodTag, PolicyConfig,
        PolicyDecision, PolicyEngine, ProtectionMethod,
    },
    sensitivity::SensitivityCalculator,
    transform::DeidToolkit,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProtectedPayload {
    Scalar(f64),
    Vector(Vec<f64>),
    Rows(Vec<Row>),
    /// Exponential-mechanism pick: the chosen row's keys, or `{"index": i}`.
    Selection(Row),
    /// Sparse-vector above-threshold answers.
    Flags(Vec<bool>),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PrivacyMetadata {
    pub method: MethodTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<String>,
    pub epsilon_spent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_scale: Option<f64>,
    pub columns_touched: Vec<String>,
    pub rows_suppressed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_budget: Option<f64>,
    pub rule: String,
    pub justification: String,
    pub query_hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProtectedResult {
    pub query_id: String,
    pub method: MethodTag,
    pub payload: ProtectedPayload,
    pub metadata: PrivacyMetadata,
}

/// Caller-facing envelope: either a protected result or a business
/// rejection.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    pub query_id: String,
    pub method: MethodTag,
    pub protected_result: Option<ProtectedPayload>,
    pub privacy_metadata: Option<PrivacyMetadata>,
    pub rejection: Option<Rejection>,
}

/// Validated mechanism plan. Built before anything executes.
enum Plan {
    Noise {
        params: DpParameters,
        noise: CalibratedNoise,
    },
    Select {
        params: DpParameters,
    },
    Sparse {
        params: DpParameters,
        svt: SparseVector,
    },
    Deid(DeidPlan),
    PassThrough,
}

impl Plan {
    fn build(method: &ProtectionMethod) -> ShieldResult<Self> {
        match method {
            ProtectionMethod::DifferentialPrivacy(params) => {
                let mut noise_params = NoiseParams::new(params.epsilon, params.sensitivity);
                if let Some(delta) = params.delta {
                    noise_params = noise_params.with_delta(delta);
                }
                noise_params.validate(params.mechanism)?;
                Ok(match params.mechanism {
                    DpMechanism::Laplace | DpMechanism::Gaussian => Plan::Noise {
                        noise: CalibratedNoise::calibrate(params.mechanism, &noise_params)?,
                        params: params.clone(),
                    },
                    DpMechanism::Exponential => Plan::Select {
                        params: params.clone(),
                    },
                    DpMechanism::SparseVector => Plan::Sparse {
                        svt: SparseVector::new(
                            params.threshold.unwrap_or_default(),
                            params.epsilon,
                            params.sensitivity,
                            params.max_positives.unwrap_or(1),
                        )?,
                        params: params.clone(),
                    },
                })
            }
            ProtectionMethod::DeIdentification(plan) => Ok(Plan::Deid(plan.clone())),
            ProtectionMethod::PassThrough => Ok(Plan::PassThrough),
            ProtectionMethod::Reject { code, reason } => Err(rejection_error(*code, reason)),
        }
    }

    fn dp(&self) -> Option<&DpParameters> {
        match self {
            Plan::Noise { params, .. } | Plan::Select { params } | Plan::Sparse { params, .. } => {
                Some(params)
            }
            Plan::Deid(_) | Plan::PassThrough => None,
        }
    }
}

struct Release {
    payload: ProtectedPayload,
    touched: BTreeSet<String>,
    suppressed: usize,
    epsilon: f64,
    noise_scale: Option<f64>,
    k: Option<usize>,
    l: Option<usize>,
}

impl Release {
    fn plain(payload: ProtectedPayload) -> Self {
        Self {
            payload,
            touched: BTreeSet::new(),
            suppressed: 0,
            epsilon: 0.0,
            noise_scale: None,
            k: None,
            l: None,
        }
    }
}

fn rejection_error(code: RejectionCode, reason: &str) -> ShieldError {
    match code {
        RejectionCode::UnboundedSensitivity => {
            ShieldError::UnboundedSensitivity(reason.to_string())
        }
        _ => ShieldError::PolicyRejected(reason.to_string()),
    }
}

/// Thread-safe entry point. Policy, ledger, executor and audit sink are
/// injected so several drivers can share them.
pub struct ProtectionDriver {
    policy: Arc<PolicyEngine>,
    ledger: Arc<BudgetLedger>,
    executor: Arc<dyn QueryExecutor>,
    audit: Arc<dyn AuditSink>,
    sensitivity: SensitivityCalculator,
    toolkit: DeidToolkit,
    noise_seed: Option<[u8; 32]>,
    requests: AtomicU64,
}

impl ProtectionDriver {
    pub fn new(
        config: &ShieldConfig,
        executor: Arc<dyn QueryExecutor>,
        audit: Arc<dyn AuditSink>,
    ) -> ShieldResult<Self> {
        config.validate()?;
        let policy = Arc::new(PolicyEngine::new(config.policy.clone())?);
        let ledger = Arc::new(BudgetLedger::new(config.budget.clone()));
        Self::with_state(config, policy, ledger, executor, audit)
    }

    /// Builds a driver around existing policy and ledger handles, e.g. a
    /// ledger restored from disk.
    pub fn with_state(
        config: &ShieldConfig,
        policy: Arc<PolicyEngine>,
        ledger: Arc<BudgetLedger>,
        executor: Arc<dyn QueryExecutor>,
        audit: Arc<dyn AuditSink>,
    ) -> ShieldResult<Self> {
        let toolkit = DeidToolkit::from_config(&config.deid)?;
        check_keys(&toolkit, &policy.snapshot())?;
        let noise_seed = config
            .driver
            .noise_seed
            .as_deref()
            .map(key_from_hex)
            .transpose()
            .map_err(|err| ConfigError::Validation(format!("driver.noise-seed: {err}")))?;
        Ok(Self {
            policy,
            ledger,
            executor,
            audit,
            sensitivity: SensitivityCalculator::new(config.sensitivity.clone()),
            toolkit,
            noise_seed,
            requests: AtomicU64::new(0),
        })
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    /// Runs one request. Business rejections and fatal errors both come
    /// back as `Err`; see [`ProtectionDriver::process_query`] for the split.
    pub fn process(&self, sql: &str, context: &RequestContext) -> ShieldResult<ProtectedResult> {
        let (query_id, sequence) = self.next_request(context);
        self.run(&query_id, sequence, sql, context)
    }

    /// Like [`ProtectionDriver::process`], but business rejections become a
    /// response with `rejection` set. Fatal errors stay `Err`.
    pub fn process_query(
        &self,
        sql: &str,
        context: &RequestContext,
    ) -> ShieldResult<QueryResponse> {
        let (query_id, sequence) = self.next_request(context);
        match self.run(&query_id, sequence, sql, context) {
            Ok(result) => Ok(QueryResponse {
                query_id,
                method: result.method,
                protected_result: Some(result.payload),
                privacy_metadata: Some(result.metadata),
                rejection: None,
            }),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => Ok(QueryResponse {
                query_id,
                method: MethodTag::Reject,
                protected_result: None,
                privacy_metadata: None,
                rejection: Some(err.rejection()),
            }),
        }
    }

    pub fn get_budget_status(&self, principal: &str) -> ShieldResult<BudgetStatus> {
        Ok(self.ledger.status(principal)?)
    }

    pub fn reset_budget(&self, principal: &str) -> ShieldResult<BudgetStatus> {
        let status = self.ledger.reset(principal)?;
        self.record(AuditEvent::BudgetReset {
            principal: principal.to_string(),
        })?;
        Ok(status)
    }

    /// Compiles and installs a new rule set. The running set stays in place
    /// when the new one is invalid or needs keys the driver does not hold.
    pub fn reload_policy(&self, config: PolicyConfig) -> ShieldResult<()> {
        let compiled = CompiledRuleSet::compile(config)?;
        check_keys(&self.toolkit, &compiled)?;
        let installed = self.policy.install(compiled);
        self.record(AuditEvent::ConfigReloaded {
            query_rules: installed.query_rule_count(),
            column_rules: installed.column_rule_count(),
        })
    }

    fn next_request(&self, context: &RequestContext) -> (String, u64) {
        let sequence = self.requests.fetch_add(1, Ordering::Relaxed);
        let query_id = context
            .request_id
            .clone()
            .unwrap_or_else(|| format!("q-{sequence:08}"));
        (query_id, sequence)
    }

    fn noise_engine(&self, sequence: u64) -> NoiseEngine {
        match &self.noise_seed {
            Some(seed) => NoiseEngine::derive(seed, sequence),
            None => NoiseEngine::from_entropy(),
        }
    }

    fn record(&self, event: AuditEvent) -> ShieldResult<()> {
        self.audit
            .emit(event)
            .map_err(|err| ShieldError::Audit(format!("{err:#}")))
    }

    /// Records an event for a charge the ledger has already committed. The
    /// ledger transaction is the record of the spend, so a sink failure here
    /// is logged and the release still goes out.
    fn record_committed(&self, event: AuditEvent) {
        let kind = event.kind();
        if let Err(err) = self.audit.emit(event) {
            warn!("audit sink failed after budget commit kind={kind:?} error={err:#}");
        }
    }

    fn run(
        &self,
        query_id: &str,
        sequence: u64,
        sql: &str,
        context: &RequestContext,
    ) -> ShieldResult<ProtectedResult> {
        let query_hash = query_fingerprint(sql);
        self.record(AuditEvent::submitted(
            query_id,
            &context.principal_id,
            &context.role,
            &query_hash,
        ))?;
        match self.protect(query_id, sequence, sql, &query_hash, context) {
            Ok(result) => Ok(result),
            Err(err) => {
                let rejection = err.rejection();
                warn!(
                    "query rejected query_id={query_id} principal={} code={} reason={}",
                    context.principal_id,
                    rejection.code.as_str(),
                    rejection.reason
                );
                self.record(AuditEvent::rejected(
                    query_id,
                    &context.principal_id,
                    rejection.code,
                    rejection.reason,
                ))?;
                Err(err)
            }
        }
    }

    fn protect(
        &self,
        query_id: &str,
        sequence: u64,
        sql: &str,
        query_hash: &str,
        context: &RequestContext,
    ) -> ShieldResult<ProtectedResult> {
        let analysis = analyze(sql)?;
        let estimate = analysis
            .has_aggregation()
            .then(|| self.sensitivity.estimate(&analysis));
        let decision = self.policy.decide(&analysis, estimate.as_ref(), context);
        info!(
            "driver decision query_id={query_id} method={} rule={}",
            decision.method.tag().as_str(),
            decision.rule
        );
        let plan = Plan::build(&decision.method)?;
        let output = self.executor.execute(sql)?;
        let mut engine = self.noise_engine(sequence);
        let release = self.release(&plan, &analysis, output, &mut engine)?;

        let remaining_budget = match plan.dp() {
            Some(params) => {
                self.ledger
                    .ensure_account(&context.principal_id, &context.role);
                let receipt = self.ledger.check_and_consume(
                    &context.principal_id,
                    &BudgetCharge {
                        epsilon: release.epsilon,
                        query_id: query_id.to_string(),
                        query_hash: query_hash.to_string(),
                        mechanism: params.mechanism.name().to_string(),
                    },
                )?;
                self.record_committed(AuditEvent::BudgetConsumed {
                    query_id: query_id.to_string(),
                    principal: context.principal_id.clone(),
                    transaction_id: receipt.transaction_id,
                    epsilon: receipt.epsilon,
                    remaining: receipt.remaining,
                });
                Some(receipt.remaining)
            }
            None => None,
        };

        let metadata = self.metadata(&plan, &decision, &release, remaining_budget, query_hash);
        let applied = AuditEvent::PrivacyApplied {
            query_id: query_id.to_string(),
            principal: context.principal_id.clone(),
            method: metadata.method.as_str().to_string(),
            mechanism: metadata.mechanism.clone(),
            epsilon: plan.dp().map(|_| metadata.epsilon_spent),
            columns: metadata.columns_touched.clone(),
            rows_suppressed: metadata.rows_suppressed,
        };
        if remaining_budget.is_some() {
            self.record_committed(applied);
        } else {
            self.record(applied)?;
        }
        info!(
            "query protected query_id={query_id} method={} epsilon={} columns={}",
            metadata.method.as_str(),
            metadata.epsilon_spent,
            metadata.columns_touched.len()
        );
        Ok(ProtectedResult {
            query_id: query_id.to_string(),
            method: metadata.method,
            payload: release.payload,
            metadata,
        })
    }

    fn metadata(
        &self,
        plan: &Plan,
        decision: &PolicyDecision,
        release: &Release,
        remaining_budget: Option<f64>,
        query_hash: &str,
    ) -> PrivacyMetadata {
        let params = plan.dp();
        PrivacyMetadata {
            method: decision.method.tag(),
            mechanism: params.map(|params| params.mechanism.name().to_string()),
            epsilon_spent: release.epsilon,
            delta: params.and_then(|params| params.delta),
            sensitivity: params.map(|params| params.sensitivity),
            noise_scale: release.noise_scale,
            columns_touched: release.touched.iter().cloned().collect(),
            rows_suppressed: release.suppressed,
            k: release.k,
            l: release.l,
            remaining_budget,
            rule: decision.rule.clone(),
            justification: decision.justification.clone(),
            query_hash: query_hash.to_string(),
        }
    }

    /// Computes the protected payload. Shape mismatches between plan and
    /// output surface here, before any budget is charged.
    fn release(
        &self,
        plan: &Plan,
        analysis: &AnalysisResult,
        output: QueryOutput,
        engine: &mut NoiseEngine,
    ) -> ShieldResult<Release> {
        match plan {
            Plan::PassThrough => Ok(Release::plain(match output {
                QueryOutput::Scalar(value) => ProtectedPayload::Scalar(value),
                QueryOutput::Vector(values) => ProtectedPayload::Vector(values),
                QueryOutput::Rows(rows) => ProtectedPayload::Rows(rows),
            })),
            Plan::Noise { params, noise } => {
                let aggregates = aggregate_columns(analysis);
                let (payload, touched) = match output {
                    QueryOutput::Scalar(value) => (
                        ProtectedPayload::Scalar(value + noise.sample(engine.rng())),
                        aggregates,
                    ),
                    QueryOutput::Vector(values) => (
                        ProtectedPayload::Vector(
                            values
                                .into_iter()
                                .map(|value| value + noise.sample(engine.rng()))
                                .collect(),
                        ),
                        aggregates,
                    ),
                    QueryOutput::Rows(rows) => {
                        require_aggregate_column(&rows, &aggregates)?;
                        trace_outputs(
                            analysis,
                            |column| covered_by(&params.key_transforms, column),
                            &rows,
                            &aggregates,
                        )?;
                        let (mut rows, mut touched) =
                            self.toolkit
                                .rewrite_rows(rows, &params.key_transforms, &aggregates);
                        for row in &mut rows {
                            for column in &aggregates {
                                if let Some(cell) = row.get_mut(column) {
                                    *cell = match cell.as_f64() {
                                        Some(value) => {
                                            Value::from(value + noise.sample(engine.rng()))
                                        }
                                        None => Value::Null,
                                    };
                                    touched.insert(column.clone());
                                }
                            }
                        }
                        (ProtectedPayload::Rows(rows), touched)
                    }
                };
                Ok(Release {
                    touched,
                    epsilon: params.epsilon,
                    noise_scale: Some(noise.scale()),
                    ..Release::plain(payload)
                })
            }
            Plan::Select { params } => {
                let aggregates = aggregate_columns(analysis);
                let (selection, touched) = match output {
                    QueryOutput::Scalar(_) => {
                        return Err(ShieldError::UnsupportedConstruct(
                            "the exponential mechanism needs several candidates".into(),
                        ))
                    }
                    QueryOutput::Vector(values) => {
                        let index = pick(&values, params, engine)?;
                        let mut row = Row::new();
                        row.insert("index".into(), Value::from(index));
                        (row, BTreeSet::new())
                    }
                    QueryOutput::Rows(rows) => {
                        let utilities = first_aggregate_values(&rows, &aggregates)?;
                        trace_outputs(
                            analysis,
                            |column| covered_by(&params.key_transforms, column),
                            &rows,
                            &aggregates,
                        )?;
                        let index = pick(&utilities, params, engine)?;
                        let chosen: Row = rows
                            .into_iter()
                            .nth(index)
                            .unwrap_or_default()
                            .into_iter()
                            .filter(|(column, _)| !aggregates.contains(column))
                            .collect();
                        let (mut rows, touched) = self.toolkit.rewrite_rows(
                            vec![chosen],
                            &params.key_transforms,
                            &aggregates,
                        );
                        (rows.pop().unwrap_or_default(), touched)
                    }
                };
                Ok(Release {
                    touched,
                    epsilon: params.epsilon,
                    ..Release::plain(ProtectedPayload::Selection(selection))
                })
            }
            Plan::Sparse { params, svt } => {
                let answers = match output {
                    QueryOutput::Scalar(value) => vec![value],
                    QueryOutput::Vector(values) => values,
                    QueryOutput::Rows(rows) => {
                        first_aggregate_values(&rows, &aggregate_columns(analysis))?
                    }
                };
                let outcome = svt.run(&answers, engine.rng());
                Ok(Release {
                    epsilon: outcome.epsilon_spent,
                    noise_scale: Some(
                        2.0 * params.max_positives.unwrap_or(1) as f64 * params.sensitivity
                            / params.epsilon,
                    ),
                    ..Release::plain(ProtectedPayload::Flags(outcome.flags))
                })
            }
            Plan::Deid(plan) => {
                let QueryOutput::Rows(rows) = output else {
                    return Err(ShieldError::UnsupportedConstruct(format!(
                        "de-identification needs row output, got {}",
                        output.shape()
                    )));
                };
                self.deidentify(plan, analysis, rows)
            }
        }
    }

    fn deidentify(
        &self,
        plan: &DeidPlan,
        analysis: &AnalysisResult,
        rows: Vec<Row>,
    ) -> ShieldResult<Release> {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for column in row.keys() {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
        }
        let mut skip = BTreeSet::new();
        let mut release = Release::plain(ProtectedPayload::Rows(Vec::new()));
        let params = plan
            .anonymity
            .as_ref()
            .and_then(|anonymity| anonymity.resolve(&columns));
        let rows = match params {
            Some(params) => {
                params.validate()?;
                let table = anonymize(&rows, &params)?;
                for qi in &params.quasi_identifiers {
                    skip.insert(qi.column.clone());
                }
                release.suppressed = table.suppressed;
                release.k = Some(params.k);
                release.l = params.l;
                table.rows
            }
            None => rows,
        };
        let protected = |column: &str| {
            covered_by(&plan.transforms, column)
                || plan.anonymity.as_ref().is_some_and(|anonymity| {
                    anonymity
                        .quasi_identifiers
                        .iter()
                        .any(|(selector, _)| selector.matches(column))
                })
        };
        trace_outputs(analysis, protected, &rows, &skip)?;
        let (rows, touched) = self.toolkit.rewrite_rows(rows, &plan.transforms, &skip);
        release.touched = touched;
        release.touched.extend(skip);
        release.payload = ProtectedPayload::Rows(rows);
        Ok(release)
    }
}

fn check_keys(toolkit: &DeidToolkit, rules: &CompiledRuleSet) -> Result<(), ConfigError> {
    match rules
        .methods_in_use()
        .into_iter()
        .find(|method| !toolkit.supports(method))
    {
        Some(method) => Err(ConfigError::Validation(format!(
            "policy uses {} but its key is not configured",
            method.name()
        ))),
        None => Ok(()),
    }
}

fn pick(utilities: &[f64], params: &DpParameters, engine: &mut NoiseEngine) -> ShieldResult<usize> {
    Ok(exponential(
        utilities,
        params.epsilon,
        params.sensitivity,
        engine.rng(),
    )?)
}

/// Output names of the aggregates, which are the columns noise applies to.
fn aggregate_columns(analysis: &AnalysisResult) -> BTreeSet<String> {
    let mut columns: BTreeSet<String> = analysis
        .aggregate_calls
        .iter()
        .map(|call| call.output_name.clone())
        .collect();
    for branch in &analysis.set_branches {
        columns.extend(aggregate_columns(branch));
    }
    columns
}

/// Fails closed when an unaliased select-list expression reads a protected
/// column and the executor named its output in a way no transform, alias or
/// plain reference accounts for.
fn trace_outputs(
    analysis: &AnalysisResult,
    protected: impl Fn(&str) -> bool,
    rows: &[Row],
    handled: &BTreeSet<String>,
) -> ShieldResult<()> {
    let mut unnamed = Vec::new();
    collect_unnamed(analysis, &mut unnamed);
    let reads_protected = unnamed
        .iter()
        .any(|sources| sources.iter().any(|source| protected(source)));
    if !reads_protected {
        return Ok(());
    }
    let mut known = BTreeSet::new();
    collect_known(analysis, &mut known);
    for column in rows.iter().flat_map(|row| row.keys()) {
        let covered = handled.contains(column)
            || protected(column)
            || known.contains(&column.to_lowercase());
        if !covered {
            return Err(ShieldError::UnsupportedConstruct(format!(
                "output column {column} cannot be traced to its source columns"
            )));
        }
    }
    Ok(())
}

fn covered_by(transforms: &[ColumnTransform], column: &str) -> bool {
    transforms
        .iter()
        .any(|transform| transform.selector.matches(column))
}

fn collect_unnamed<'a>(node: &'a AnalysisResult, out: &mut Vec<&'a Vec<String>>) {
    out.extend(
        node.unnamed_outputs
            .iter()
            .filter_map(|name| node.aliases.get(name)),
    );
    for branch in &node.set_branches {
        collect_unnamed(branch, out);
    }
}

/// Output names the analysis accounts for: plain references, aliases and
/// aggregate outputs.
fn collect_known(node: &AnalysisResult, out: &mut BTreeSet<String>) {
    out.extend(node.columns.iter().filter(|column| column.as_str() != "*").cloned());
    out.extend(node.aliases.keys().cloned());
    out.extend(node.aggregate_calls.iter().map(|call| call.output_name.clone()));
    for branch in &node.set_branches {
        collect_known(branch, out);
    }
}

/// Grouped output must carry at least one aggregate column; otherwise the
/// rows would leave without noise.
fn require_aggregate_column(rows: &[Row], aggregates: &BTreeSet<String>) -> ShieldResult<()> {
    if rows
        .iter()
        .all(|row| aggregates.iter().any(|column| row.contains_key(column)))
    {
        Ok(())
    } else {
        Err(ShieldError::UnsupportedConstruct(
            "grouped output has no recognisable aggregate column".into(),
        ))
    }
}

fn first_aggregate_values(rows: &[Row], aggregates: &BTreeSet<String>) -> ShieldResult<Vec<f64>> {
    rows.iter()
        .map(|row| {
            aggregates
                .iter()
                .find_map(|column| row.get(column))
                .and_then(Value::as_f64)
                .ok_or_else(|| {
                    ShieldError::UnsupportedConstruct(
                        "grouped output needs a numeric aggregate column".into(),
                    )
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        audit::{AuditEventKind, HashChainAuditLog},
        executor::InMemoryExecutor,
    };

    fn row(value: Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    fn driver(config: ShieldConfig) -> (ProtectionDriver, Arc<HashChainAuditLog>) {
        let executor = InMemoryExecutor::new()
            .with_table(
                "users",
                vec![
                    row(json!({"id": 1, "name": "Ann Lee", "dept": "eng", "age": 41})),
                    row(json!({"id": 2, "name": "Bo Chan", "dept": "eng", "age": 29})),
                    row(json!({"id": 3, "name": "Cy Diaz", "dept": "ops", "age": 35})),
                ],
            )
            .with_fixture("SELECT COUNT(*) FROM users", QueryOutput::Scalar(1000.0));
        let audit = Arc::new(HashChainAuditLog::new(128));
        let driver = ProtectionDriver::new(&config, Arc::new(executor), audit.clone()).unwrap();
        (driver, audit)
    }

    fn seeded() -> ShieldConfig {
        let mut config = ShieldConfig::default();
        config.driver.noise_seed = Some("42".repeat(32));
        config
    }

    /// Answers every query with one row under a fixed column name, the way
    /// a database names unaliased expression columns.
    struct ExpressionExecutor {
        column: &'static str,
    }

    impl QueryExecutor for ExpressionExecutor {
        fn execute(&self, _sql: &str) -> Result<QueryOutput, crate::executor::ExecutorError> {
            let mut row = Row::new();
            row.insert(self.column.to_string(), json!("ANN@EXAMPLE.COM"));
            Ok(QueryOutput::Rows(vec![row]))
        }
    }

    fn expression_driver(column: &'static str) -> ProtectionDriver {
        ProtectionDriver::new(
            &seeded(),
            Arc::new(ExpressionExecutor { column }),
            Arc::new(HashChainAuditLog::new(16)),
        )
        .unwrap()
    }

    #[test]
    fn unaliased_expressions_inherit_source_transforms() {
        let context = RequestContext::new("alice", "analyst");
        let response = expression_driver("upper(email)")
            .process_query("SELECT UPPER(email) FROM users", &context)
            .unwrap();
        assert_eq!(response.method, MethodTag::DeIdentification);
        let Some(ProtectedPayload::Rows(rows)) = response.protected_result else {
            panic!("expected rows");
        };
        assert_eq!(rows[0]["upper(email)"], json!("A***@EXAMPLE.COM"));
        assert_eq!(
            response.privacy_metadata.unwrap().columns_touched,
            vec!["upper(email)".to_string()]
        );
    }

    #[test]
    fn untraceable_expression_columns_are_refused() {
        let context = RequestContext::new("alice", "analyst");
        let response = expression_driver("upper")
            .process_query("SELECT UPPER(email) FROM users", &context)
            .unwrap();
        assert!(response.protected_result.is_none());
        assert_eq!(
            response.rejection.map(|rejection| rejection.code),
            Some(RejectionCode::UnsupportedConstruct)
        );
    }

    /// Refuses every event of one kind.
    struct FailingSink {
        refuse: AuditEventKind,
        inner: HashChainAuditLog,
    }

    impl AuditSink for FailingSink {
        fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
            if event.kind() == self.refuse {
                anyhow::bail!("sink unavailable");
            }
            self.inner.emit(event)
        }
    }

    #[test]
    fn audit_failure_after_commit_still_releases() {
        let executor = InMemoryExecutor::new()
            .with_fixture("SELECT COUNT(*) FROM users", QueryOutput::Scalar(1000.0));
        let sink = Arc::new(FailingSink {
            refuse: AuditEventKind::BudgetConsumed,
            inner: HashChainAuditLog::new(16),
        });
        let driver = ProtectionDriver::new(&seeded(), Arc::new(executor), sink.clone()).unwrap();

        let context = RequestContext::new("alice", "analyst");
        let response = driver
            .process_query("SELECT COUNT(*) FROM users", &context)
            .unwrap();
        assert_eq!(response.method, MethodTag::DifferentialPrivacy);
        assert!(response.protected_result.is_some());
        assert_eq!(driver.get_budget_status("alice").unwrap().consumed, 1.0);
        assert_eq!(sink.inner.by_kind(AuditEventKind::BudgetConsumed).len(), 0);
        assert_eq!(sink.inner.by_kind(AuditEventKind::PrivacyApplied).len(), 1);
    }

    #[test]
    fn audit_failure_before_commit_spends_nothing() {
        let executor = InMemoryExecutor::new()
            .with_fixture("SELECT COUNT(*) FROM users", QueryOutput::Scalar(1000.0));
        let sink = Arc::new(FailingSink {
            refuse: AuditEventKind::QuerySubmitted,
            inner: HashChainAuditLog::new(16),
        });
        let driver = ProtectionDriver::new(&seeded(), Arc::new(executor), sink).unwrap();

        let context = RequestContext::new("bob", "analyst");
        let result = driver.process_query("SELECT COUNT(*) FROM users", &context);
        assert!(result.is_err());
        let consumed = driver
            .get_budget_status("bob")
            .map(|status| status.consumed)
            .unwrap_or(0.0);
        assert_eq!(consumed, 0.0);
    }

    #[test]
    fn seeded_drivers_reproduce_noise() {
        let context = RequestContext::new("alice", "analyst");
        let (first, _) = driver(seeded());
        let (second, _) = driver(seeded());
        let a = first.process("SELECT COUNT(*) FROM users", &context).unwrap();
        let b = second.process("SELECT COUNT(*) FROM users", &context).unwrap();
        assert_eq!(a.payload, b.payload);
        assert_eq!(a.metadata.noise_scale, Some(1.0));
    }

    #[test]
    fn grouped_counts_keep_keys_and_noise_aggregates() {
        let (driver, _) = driver(seeded());
        let result = driver
            .process(
                "SELECT dept, COUNT(*) AS n FROM users GROUP BY dept",
                &RequestContext::new("alice", "analyst"),
            )
            .unwrap();
        let ProtectedPayload::Rows(rows) = result.payload else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["dept"], json!("eng"));
        assert!(rows[0]["n"].is_number());
        assert_eq!(result.metadata.columns_touched, vec!["n".to_string()]);
    }

    #[test]
    fn sensitive_group_keys_stay_protected() {
        let (driver, _) = driver(seeded());
        let result = driver
            .process(
                "SELECT name, COUNT(*) AS n FROM users GROUP BY name",
                &RequestContext::new("alice", "analyst"),
            )
            .unwrap();
        assert_eq!(result.method, MethodTag::DifferentialPrivacy);
        let ProtectedPayload::Rows(rows) = result.payload else {
            panic!("expected rows");
        };
        assert_eq!(rows[0]["name"], json!("A** L**"));
    }

    #[test]
    fn exponential_selection_releases_only_keys() {
        let mut config = seeded();
        config.policy.default_mechanism = DpMechanism::Exponential;
        let (driver, _) = driver(config);
        let result = driver
            .process(
                "SELECT dept, COUNT(*) AS n FROM users GROUP BY dept",
                &RequestContext::new("alice", "analyst"),
            )
            .unwrap();
        let ProtectedPayload::Selection(choice) = result.payload else {
            panic!("expected a selection");
        };
        assert!(choice.contains_key("dept"));
        assert!(!choice.contains_key("n"));
        assert_eq!(result.metadata.epsilon_spent, 1.0);
    }

    #[test]
    fn sparse_vector_flags_answers_and_costs_epsilon_once() {
        let mut config = seeded();
        config.policy.default_mechanism = DpMechanism::SparseVector;
        config.policy.sparse_vector.threshold = 1.5;
        config.policy.sparse_vector.max_positives = 2;
        let (driver, _) = driver(config);
        let result = driver
            .process(
                "SELECT dept, COUNT(*) AS n FROM users GROUP BY dept",
                &RequestContext::new("alice", "analyst"),
            )
            .unwrap();
        let ProtectedPayload::Flags(flags) = result.payload else {
            panic!("expected flags");
        };
        assert!(!flags.is_empty() && flags.len() <= 2);
        assert_eq!(driver.get_budget_status("alice").unwrap().consumed, 1.0);
    }

    #[test]
    fn invalid_parameters_are_fatal_and_spend_nothing() {
        let mut config = seeded();
        config.policy.default_mechanism = DpMechanism::Gaussian;
        let (driver, audit) = driver(config);
        let context = RequestContext::new("alice", "analyst");
        let err = driver.process_query("SELECT COUNT(*) FROM users", &context).unwrap_err();
        assert!(err.is_fatal());
        assert!(driver.get_budget_status("alice").is_err());
        assert!(audit.verify_chain().is_ok());
    }

    #[test]
    fn reload_refuses_methods_without_keys() {
        let (driver, audit) = driver(seeded());
        let mut policy = PolicyConfig::default();
        policy.column_rules[0].method = Some(crate::policy::DeidMethod::Encrypt);
        assert!(driver.reload_policy(policy).is_err());
        let mut policy = PolicyConfig::default();
        policy.default_epsilon = 0.5;
        driver.reload_policy(policy).unwrap();
        assert_eq!(driver.policy().snapshot().config().default_epsilon, 0.5);
        assert_eq!(
            audit
                .by_kind(crate::audit::AuditEventKind::ConfigReloaded)
                .len(),
            1
        );
    }
}
