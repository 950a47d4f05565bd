//! Method selection.
//!
//! Every built-in step and every matching query rule proposes a candidate
//! method; the most restrictive candidate wins
//! (`Reject > DP > DeID(k+l) > DeID > PassThrough`, ties to the earliest).
//! When de-identification wins, the column transforms of all
//! de-identification candidates are merged so no proposed protection is
//! dropped. The rule set lives behind an `Arc` that reload swaps whole.

mod rules;

use std::{collections::BTreeSet, sync::Arc};

use parking_lot::RwLock;
use queryshield_mechanisms::{AnonymityParams, DpMechanism, Hierarchy, QuasiIdentifier};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use rules::{
    default_column_rules, AnonymityPolicy, ColumnClass, ColumnRule, CompiledRuleSet, DeidMethod,
    PolicyConfig, QueryRule, RuleCondition, RuleOutcome, SparseVectorDefaults,
};

use crate::{
    analyzer::AnalysisResult,
    config::ConfigError,
    context::RequestContext,
    error::RejectionCode,
    sensitivity::SensitivityEstimate,
};
use rules::{CompiledColumnRule, RuleInput};

/// Parameters of a differentially private release.
#[derive(Clone, Debug)]
pub struct DpParameters {
    pub mechanism: DpMechanism,
    pub epsilon: f64,
    pub delta: Option<f64>,
    pub sensitivity: f64,
    pub threshold: Option<f64>,
    pub max_positives: Option<usize>,
    /// Transforms for non-aggregated key columns in grouped output.
    pub key_transforms: Vec<ColumnTransform>,
}

#[derive(Clone, Debug)]
pub enum ColumnSelector {
    Named(String),
    Pattern(Regex),
}

impl ColumnSelector {
    pub fn matches(&self, column: &str) -> bool {
        match self {
            ColumnSelector::Named(name) => name.eq_ignore_ascii_case(column),
            ColumnSelector::Pattern(regex) => regex.is_match(column),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ColumnSelector::Named(name) => name,
            ColumnSelector::Pattern(regex) => regex.as_str(),
        }
    }

    fn same_target(&self, other: &ColumnSelector) -> bool {
        match (self, other) {
            (ColumnSelector::Named(left), ColumnSelector::Named(right)) => {
                left.eq_ignore_ascii_case(right)
            }
            (ColumnSelector::Pattern(left), ColumnSelector::Pattern(right)) => {
                left.as_str() == right.as_str()
            }
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ColumnTransform {
    pub selector: ColumnSelector,
    pub method: DeidMethod,
    pub rule: String,
}

/// k-anonymity plan whose quasi-identifiers are resolved against the actual
/// output columns at execution time.
#[derive(Clone, Debug)]
pub struct AnonymityPlan {
    pub k: usize,
    pub l: Option<usize>,
    pub sensitive_column: Option<String>,
    pub quasi_identifiers: Vec<(ColumnSelector, Hierarchy)>,
}

impl AnonymityPlan {
    /// Parameters for the given output columns, or `None` when no
    /// quasi-identifier reaches the output. l-diversity is dropped when the
    /// sensitive column is not released.
    pub fn resolve(&self, columns: &[String]) -> Option<AnonymityParams> {
        let quasi_identifiers: Vec<QuasiIdentifier> = columns
            .iter()
            .filter_map(|column| {
                self.quasi_identifiers
                    .iter()
                    .find(|(selector, _)| selector.matches(column))
                    .map(|(_, hierarchy)| QuasiIdentifier {
                        column: column.clone(),
                        hierarchy: hierarchy.clone(),
                    })
            })
            .collect();
        if quasi_identifiers.is_empty() {
            return None;
        }
        let sensitive_column = self
            .sensitive_column
            .as_ref()
            .filter(|sensitive| columns.iter().any(|column| column.eq_ignore_ascii_case(sensitive)))
            .cloned();
        Some(AnonymityParams {
            k: self.k,
            quasi_identifiers,
            l: sensitive_column.as_ref().and(self.l),
            sensitive_column,
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct DeidPlan {
    /// Ordered: the first matching transform applies to a column.
    pub transforms: Vec<ColumnTransform>,
    pub anonymity: Option<AnonymityPlan>,
}

impl DeidPlan {
    pub fn transform_for(&self, column: &str) -> Option<&ColumnTransform> {
        self.transforms
            .iter()
            .find(|transform| transform.selector.matches(column))
    }

    fn merge(&mut self, other: DeidPlan) {
        for transform in other.transforms {
            if !self
                .transforms
                .iter()
                .any(|existing| existing.selector.same_target(&transform.selector))
            {
                self.transforms.push(transform);
            }
        }
        if self.anonymity.is_none() {
            self.anonymity = other.anonymity;
        }
    }

    /// Named selectors first so exact column decisions beat pattern ones.
    fn order(&mut self) {
        self.transforms
            .sort_by_key(|transform| matches!(transform.selector, ColumnSelector::Pattern(_)));
    }
}

#[derive(Clone, Debug)]
pub enum ProtectionMethod {
    DifferentialPrivacy(DpParameters),
    DeIdentification(DeidPlan),
    PassThrough,
    Reject { code: RejectionCode, reason: String },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MethodTag {
    DifferentialPrivacy,
    DeIdentification,
    PassThrough,
    Reject,
}

impl MethodTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodTag::DifferentialPrivacy => "DifferentialPrivacy",
            MethodTag::DeIdentification => "DeIdentification",
            MethodTag::PassThrough => "PassThrough",
            MethodTag::Reject => "Reject",
        }
    }
}

impl ProtectionMethod {
    pub fn tag(&self) -> MethodTag {
        match self {
            ProtectionMethod::DifferentialPrivacy(_) => MethodTag::DifferentialPrivacy,
            ProtectionMethod::DeIdentification(_) => MethodTag::DeIdentification,
            ProtectionMethod::PassThrough => MethodTag::PassThrough,
            ProtectionMethod::Reject { .. } => MethodTag::Reject,
        }
    }

    fn restrictiveness(&self) -> u8 {
        match self {
            ProtectionMethod::Reject { .. } => 4,
            ProtectionMethod::DifferentialPrivacy(_) => 3,
            ProtectionMethod::DeIdentification(plan) if plan.anonymity.is_some() => 2,
            ProtectionMethod::DeIdentification(_) => 1,
            ProtectionMethod::PassThrough => 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PolicyDecision {
    pub method: ProtectionMethod,
    /// Rule that produced the winning candidate.
    pub rule: String,
    pub justification: String,
}

impl PolicyDecision {
    fn new(
        method: ProtectionMethod,
        rule: impl Into<String>,
        justification: impl Into<String>,
    ) -> Self {
        Self {
            method,
            rule: rule.into(),
            justification: justification.into(),
        }
    }

    fn reject(code: RejectionCode, rule: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ProtectionMethod::Reject {
                code,
                reason: reason.clone(),
            },
            rule,
            reason,
        )
    }
}

pub struct PolicyEngine {
    rules: RwLock<Arc<CompiledRuleSet>>,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            rules: RwLock::new(Arc::new(CompiledRuleSet::compile(config)?)),
        })
    }

    /// Compiles `config` and swaps it in. A failed compile leaves the current
    /// rule set untouched.
    pub fn reload(&self, config: PolicyConfig) -> Result<Arc<CompiledRuleSet>, ConfigError> {
        Ok(self.install(CompiledRuleSet::compile(config)?))
    }

    /// Swaps in an already compiled rule set.
    pub fn install(&self, compiled: CompiledRuleSet) -> Arc<CompiledRuleSet> {
        let compiled = Arc::new(compiled);
        *self.rules.write() = Arc::clone(&compiled);
        info!(
            "policy reloaded query_rules={} column_rules={}",
            compiled.query_rule_count(),
            compiled.column_rule_count()
        );
        compiled
    }

    pub fn snapshot(&self) -> Arc<CompiledRuleSet> {
        Arc::clone(&self.rules.read())
    }

    pub fn decide(
        &self,
        analysis: &AnalysisResult,
        sensitivity: Option<&SensitivityEstimate>,
        context: &RequestContext,
    ) -> PolicyDecision {
        let rules = self.snapshot();
        Decider::new(&rules, analysis, sensitivity, context).decide()
    }
}

struct Decider<'a> {
    rules: &'a CompiledRuleSet,
    analysis: &'a AnalysisResult,
    context: &'a RequestContext,
    columns: BTreeSet<String>,
    wildcard: bool,
    export: bool,
    aggregated: bool,
    bound: Option<f64>,
    unbounded_reason: String,
}

impl<'a> Decider<'a> {
    fn new(
        rules: &'a CompiledRuleSet,
        analysis: &'a AnalysisResult,
        sensitivity: Option<&SensitivityEstimate>,
        context: &'a RequestContext,
    ) -> Self {
        let mut columns = analysis.referenced_columns();
        columns.remove("*");
        Self {
            rules,
            analysis,
            context,
            columns,
            wildcard: analysis.projects_wildcard(),
            export: context.export || analysis.is_export,
            aggregated: analysis.has_aggregation(),
            bound: sensitivity.and_then(SensitivityEstimate::bound),
            unbounded_reason: sensitivity
                .and_then(SensitivityEstimate::unbounded_reason)
                .unwrap_or("no sensitivity estimate")
                .to_string(),
        }
    }

    fn decide(&self) -> PolicyDecision {
        let config = self.rules.config();
        let unbounded = self.aggregated && self.bound.is_none();
        if unbounded && !config.deid_fallback_on_unbounded {
            return PolicyDecision::reject(
                RejectionCode::UnboundedSensitivity,
                "builtin:unbounded-sensitivity",
                format!("sensitivity is unbounded: {}", self.unbounded_reason),
            );
        }

        let mut candidates = Vec::new();
        if let Some(sensitivity) = self.bound {
            if self.aggregated {
                let params = self.dp_parameters(None, None, None, sensitivity);
                let justification = format!(
                    "aggregation with bounded sensitivity {sensitivity} -> {} epsilon={}",
                    params.mechanism.name(),
                    params.epsilon
                );
                candidates.push(PolicyDecision::new(
                    ProtectionMethod::DifferentialPrivacy(params),
                    "builtin:aggregation",
                    justification,
                ));
            }
        }
        if let Some((plan, rule)) = self.sensitive_column_plan() {
            let touched = describe(&plan.transforms);
            candidates.push(PolicyDecision::new(
                ProtectionMethod::DeIdentification(plan),
                rule,
                format!("sensitive columns [{touched}] are rewritten"),
            ));
        }
        if self.export {
            if let Some(anonymity) = self.anonymity_plan() {
                let justification = format!(
                    "bulk export over quasi-identifiers -> k={} l={}",
                    anonymity.k,
                    anonymity.l.map(|l| l.to_string()).unwrap_or_else(|| "-".into())
                );
                candidates.push(PolicyDecision::new(
                    ProtectionMethod::DeIdentification(DeidPlan {
                        transforms: Vec::new(),
                        anonymity: Some(anonymity),
                    }),
                    "builtin:export-anonymity",
                    justification,
                ));
            }
        }

        let input = RuleInput {
            analysis: self.analysis,
            context: self.context,
            columns: &self.columns,
            wildcard: self.wildcard,
            export: self.export,
        };
        for compiled in &self.rules.query_rules {
            if compiled.condition.evaluate(&input) {
                debug!("policy rule matched rule={}", compiled.rule.name);
                if let Some(candidate) = self.rule_candidate(compiled) {
                    candidates.push(candidate);
                }
            }
        }

        let decision = self.resolve(candidates);
        if unbounded && decision.method.tag() == MethodTag::PassThrough {
            return PolicyDecision::reject(
                RejectionCode::UnboundedSensitivity,
                "builtin:unbounded-sensitivity",
                format!(
                    "sensitivity is unbounded and no de-identification applies: {}",
                    self.unbounded_reason
                ),
            );
        }
        decision
    }

    fn resolve(&self, candidates: Vec<PolicyDecision>) -> PolicyDecision {
        let mut winner: Option<usize> = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let better = match winner {
                Some(current) => more_restrictive(&candidate.method, &candidates[current].method),
                None => true,
            };
            if better {
                winner = Some(index);
            }
        }
        let Some(winner) = winner else {
            return PolicyDecision::new(
                ProtectionMethod::PassThrough,
                "builtin:default",
                "no rule requires protection",
            );
        };

        let mut merged = DeidPlan::default();
        let mut saw_deid = false;
        let mut candidates = candidates;
        for candidate in &candidates {
            if let ProtectionMethod::DeIdentification(plan) = &candidate.method {
                merged.merge(plan.clone());
                saw_deid = true;
            }
        }
        merged.order();
        let mut decision = candidates.swap_remove(winner);
        match &mut decision.method {
            ProtectionMethod::DeIdentification(plan) => *plan = merged,
            ProtectionMethod::DifferentialPrivacy(params) if saw_deid => {
                params.key_transforms = merged.transforms;
            }
            _ => {}
        }
        decision
    }

    fn dp_parameters(
        &self,
        epsilon: Option<f64>,
        delta: Option<f64>,
        mechanism: Option<DpMechanism>,
        sensitivity: f64,
    ) -> DpParameters {
        let config = self.rules.config();
        let mechanism = mechanism.unwrap_or(config.default_mechanism);
        let epsilon = config
            .role_epsilon
            .get(&self.context.role)
            .copied()
            .or(epsilon)
            .unwrap_or(config.default_epsilon);
        let sparse = mechanism == DpMechanism::SparseVector;
        DpParameters {
            mechanism,
            epsilon,
            delta: delta.or(config.default_delta),
            sensitivity,
            threshold: sparse.then_some(config.sparse_vector.threshold),
            max_positives: sparse.then_some(config.sparse_vector.max_positives),
            key_transforms: Vec::new(),
        }
    }

    /// Step 3: every referenced column classified sensitive gets the method of
    /// its most specific rule. Wildcard projections carry every sensitive
    /// rule as a pattern.
    fn sensitive_column_plan(&self) -> Option<(DeidPlan, String)> {
        let mut plan = DeidPlan::default();
        let mut first_rule: Option<String> = None;
        for column in &self.columns {
            if let Some(rule) = self.rules.classify(column) {
                if rule.rule.class == ColumnClass::Sensitive {
                    first_rule.get_or_insert_with(|| rule.label());
                    self.push_named(&mut plan, column, rule.method(), rule.label());
                }
            }
        }
        if self.wildcard {
            for rule in self.rules.rules_of(ColumnClass::Sensitive) {
                first_rule.get_or_insert_with(|| rule.label());
                plan.transforms.push(ColumnTransform {
                    selector: ColumnSelector::Pattern(rule.regex.clone()),
                    method: rule.method(),
                    rule: rule.label(),
                });
            }
        }
        first_rule.map(|rule| (plan, rule))
    }

    /// Adds a named transform and repeats it for every select-list alias
    /// that reads the column.
    fn push_named(&self, plan: &mut DeidPlan, column: &str, method: DeidMethod, rule: String) {
        for alias in self.aliases_of(column) {
            plan.transforms.push(ColumnTransform {
                selector: ColumnSelector::Named(alias),
                method: method.clone(),
                rule: rule.clone(),
            });
        }
        plan.transforms.push(ColumnTransform {
            selector: ColumnSelector::Named(column.to_string()),
            method,
            rule,
        });
    }

    fn aliases_of(&self, column: &str) -> Vec<String> {
        let mut aliases = Vec::new();
        collect_aliases(self.analysis, column, &mut aliases);
        aliases
    }

    /// Step 4: quasi-identifiers reaching the output, with the configured
    /// k/l parameters.
    fn anonymity_plan(&self) -> Option<AnonymityPlan> {
        let anonymity = self.rules.config().anonymity.as_ref()?;
        let mut quasi_identifiers = Vec::new();
        for column in &self.columns {
            if let Some(rule) = self.rules.classify(column) {
                if let (ColumnClass::QuasiIdentifier, Some(hierarchy)) =
                    (rule.rule.class, rule.rule.hierarchy.as_ref())
                {
                    for alias in self.aliases_of(column) {
                        quasi_identifiers.push((ColumnSelector::Named(alias), hierarchy.clone()));
                    }
                    quasi_identifiers
                        .push((ColumnSelector::Named(column.clone()), hierarchy.clone()));
                }
            }
        }
        if self.wildcard {
            for rule in self.rules.rules_of(ColumnClass::QuasiIdentifier) {
                if let Some(hierarchy) = &rule.rule.hierarchy {
                    quasi_identifiers
                        .push((ColumnSelector::Pattern(rule.regex.clone()), hierarchy.clone()));
                }
            }
        }
        if quasi_identifiers.is_empty() {
            return None;
        }
        Some(AnonymityPlan {
            k: anonymity.k,
            l: anonymity.l,
            sensitive_column: anonymity.sensitive_column.clone(),
            quasi_identifiers,
        })
    }

    fn rule_candidate(&self, compiled: &rules::CompiledQueryRule) -> Option<PolicyDecision> {
        let rule = &compiled.rule;
        let label = format!("query-rule:{}", rule.name);
        match &rule.outcome {
            RuleOutcome::DifferentialPrivacy {
                epsilon,
                delta,
                mechanism,
            } => {
                let sensitivity = match (self.aggregated, self.bound) {
                    (true, Some(sensitivity)) => sensitivity,
                    (false, _) => {
                        return Some(PolicyDecision::reject(
                            RejectionCode::PolicyRejected,
                            label,
                            format!(
                                "rule {} requires differential privacy but the query does not aggregate",
                                rule.name
                            ),
                        ))
                    }
                    (true, None) => {
                        return Some(PolicyDecision::reject(
                            RejectionCode::UnboundedSensitivity,
                            label,
                            format!(
                                "rule {} requires differential privacy but sensitivity is unbounded: {}",
                                rule.name, self.unbounded_reason
                            ),
                        ))
                    }
                };
                let params = self.dp_parameters(*epsilon, *delta, *mechanism, sensitivity);
                let justification = format!(
                    "rule {} -> {} epsilon={} sensitivity={sensitivity}",
                    rule.name,
                    params.mechanism.name(),
                    params.epsilon
                );
                Some(PolicyDecision::new(
                    ProtectionMethod::DifferentialPrivacy(params),
                    label,
                    justification,
                ))
            }
            RuleOutcome::DeIdentify { method } => {
                let method = method.clone().unwrap_or(DeidMethod::Hash);
                let plan = self.rule_deid_plan(compiled, method, &label);
                if plan.transforms.is_empty() {
                    return None;
                }
                let justification =
                    format!("rule {} rewrites [{}]", rule.name, describe(&plan.transforms));
                Some(PolicyDecision::new(
                    ProtectionMethod::DeIdentification(plan),
                    label,
                    justification,
                ))
            }
            RuleOutcome::Anonymize => {
                let anonymity = self.anonymity_plan()?;
                Some(PolicyDecision::new(
                    ProtectionMethod::DeIdentification(DeidPlan {
                        transforms: Vec::new(),
                        anonymity: Some(anonymity),
                    }),
                    label,
                    format!("rule {} anonymizes quasi-identifiers", rule.name),
                ))
            }
            RuleOutcome::PassThrough => Some(PolicyDecision::new(
                ProtectionMethod::PassThrough,
                label,
                format!("rule {} allows raw results", rule.name),
            )),
            RuleOutcome::Reject { reason } => Some(PolicyDecision::reject(
                RejectionCode::PolicyRejected,
                label,
                reason.clone(),
            )),
        }
    }

    fn rule_deid_plan(
        &self,
        compiled: &rules::CompiledQueryRule,
        method: DeidMethod,
        label: &str,
    ) -> DeidPlan {
        let mut plan = DeidPlan::default();
        match compiled.condition.column_pattern() {
            Some(pattern) => {
                for column in self.columns.iter().filter(|column| pattern.is_match(column)) {
                    self.push_named(&mut plan, column, method.clone(), label.to_string());
                }
                if self.wildcard {
                    plan.transforms.push(ColumnTransform {
                        selector: ColumnSelector::Pattern(pattern.clone()),
                        method,
                        rule: label.to_string(),
                    });
                }
            }
            None => {
                for column in &self.columns {
                    let public = self
                        .rules
                        .classify(column)
                        .map(|rule: &CompiledColumnRule| rule.rule.class == ColumnClass::Public)
                        .unwrap_or(false);
                    if !public {
                        self.push_named(&mut plan, column, method.clone(), label.to_string());
                    }
                }
                if self.wildcard {
                    if let Ok(everything) = Regex::new(".*") {
                        plan.transforms.push(ColumnTransform {
                            selector: ColumnSelector::Pattern(everything),
                            method,
                            rule: label.to_string(),
                        });
                    }
                }
            }
        }
        plan
    }
}

/// Rank first; between two DP candidates the smaller epsilon is stricter.
fn more_restrictive(candidate: &ProtectionMethod, current: &ProtectionMethod) -> bool {
    match (candidate, current) {
        (
            ProtectionMethod::DifferentialPrivacy(left),
            ProtectionMethod::DifferentialPrivacy(right),
        ) => left.epsilon < right.epsilon,
        _ => candidate.restrictiveness() > current.restrictiveness(),
    }
}

fn collect_aliases(node: &AnalysisResult, column: &str, out: &mut Vec<String>) {
    for (alias, sources) in &node.aliases {
        if sources.iter().any(|source| source == column) && !out.contains(alias) {
            out.push(alias.clone());
        }
    }
    for nested in node.subqueries.iter().chain(node.set_branches.iter()) {
        collect_aliases(nested, column, out);
    }
}

fn describe(transforms: &[ColumnTransform]) -> String {
    transforms
        .iter()
        .map(|transform| format!("{}:{}", transform.selector.label(), transform.method.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use queryshield_mechanisms::MaskStyle;

    use super::*;
    use crate::{
        analyzer::analyze,
        sensitivity::{SensitivityCalculator, SensitivityConfig, ValueBound},
    };

    fn decide_with(engine: &PolicyEngine, sql: &str, context: &RequestContext) -> PolicyDecision {
        let analysis = analyze(sql).unwrap();
        let mut config = SensitivityConfig::default();
        config
            .column_bounds
            .insert("age".into(), ValueBound::new(0.0, 120.0));
        let estimate = SensitivityCalculator::new(config).estimate(&analysis);
        let sensitivity = analysis.has_aggregation().then_some(&estimate);
        engine.decide(&analysis, sensitivity, context)
    }

    fn analyst() -> RequestContext {
        RequestContext::new("alice", "analyst")
    }

    #[test]
    fn aggregation_gets_dp_with_role_override() {
        let mut config = PolicyConfig::default();
        config.role_epsilon.insert("analyst".into(), 0.25);
        let engine = PolicyEngine::new(config).unwrap();
        let decision = decide_with(&engine, "SELECT COUNT(*) FROM users", &analyst());
        let ProtectionMethod::DifferentialPrivacy(params) = decision.method else {
            panic!("expected DP, got {decision:?}");
        };
        assert_eq!(params.epsilon, 0.25);
        assert_eq!(params.sensitivity, 1.0);
        assert_eq!(params.mechanism, DpMechanism::Laplace);
        assert_eq!(decision.rule, "builtin:aggregation");

        let other = decide_with(&engine, "SELECT COUNT(*) FROM users", &RequestContext::new("b", "viewer"));
        let ProtectionMethod::DifferentialPrivacy(params) = other.method else {
            panic!("expected DP");
        };
        assert_eq!(params.epsilon, 1.0);
    }

    #[test]
    fn unbounded_aggregates_are_rejected() {
        let engine = PolicyEngine::new(PolicyConfig::default()).unwrap();
        let decision = decide_with(&engine, "SELECT SUM(amount) FROM orders", &analyst());
        assert!(matches!(
            decision.method,
            ProtectionMethod::Reject {
                code: RejectionCode::UnboundedSensitivity,
                ..
            }
        ));
    }

    #[test]
    fn fallback_uses_deid_when_available() {
        let config = PolicyConfig {
            deid_fallback_on_unbounded: true,
            ..PolicyConfig::default()
        };
        let engine = PolicyEngine::new(config).unwrap();
        let decision = decide_with(
            &engine,
            "SELECT name, SUM(amount) FROM orders GROUP BY name",
            &analyst(),
        );
        assert_eq!(decision.method.tag(), MethodTag::DeIdentification);
        let still_rejected = decide_with(&engine, "SELECT SUM(amount) FROM orders", &analyst());
        assert_eq!(still_rejected.method.tag(), MethodTag::Reject);
    }

    #[test]
    fn sensitive_columns_get_their_most_specific_method() {
        let engine = PolicyEngine::new(PolicyConfig::default()).unwrap();
        let decision = decide_with(
            &engine,
            "SELECT name, email, dept FROM users WHERE dept = 'ops'",
            &analyst(),
        );
        let ProtectionMethod::DeIdentification(plan) = decision.method else {
            panic!("expected DeID");
        };
        assert_eq!(
            plan.transform_for("email").unwrap().method,
            DeidMethod::Mask(MaskStyle::Email)
        );
        assert_eq!(
            plan.transform_for("name").unwrap().method,
            DeidMethod::Mask(MaskStyle::Name)
        );
        assert!(plan.transform_for("dept").is_none());
        assert!(plan.anonymity.is_none());
    }

    #[test]
    fn aliases_inherit_column_transforms() {
        let engine = PolicyEngine::new(PolicyConfig::default()).unwrap();
        let decision = decide_with(&engine, "SELECT email AS contact FROM users LIMIT 3", &analyst());
        let ProtectionMethod::DeIdentification(plan) = decision.method else {
            panic!("expected DeID");
        };
        assert!(plan.transform_for("contact").is_some());
    }

    #[test]
    fn exports_with_quasi_identifiers_get_anonymity_and_merge_transforms() {
        let engine = PolicyEngine::new(PolicyConfig::default()).unwrap();
        let decision = decide_with(&engine, "SELECT name, age, zipcode FROM users", &analyst());
        assert_eq!(decision.rule, "builtin:export-anonymity");
        let ProtectionMethod::DeIdentification(plan) = decision.method else {
            panic!("expected DeID");
        };
        let anonymity = plan.anonymity.as_ref().unwrap();
        assert_eq!(anonymity.k, 5);
        let params = anonymity
            .resolve(&["name".into(), "age".into(), "zipcode".into()])
            .unwrap();
        assert_eq!(params.quasi_identifiers.len(), 2);
        assert!(plan.transform_for("name").is_some());
    }

    #[test]
    fn wildcard_exports_carry_patterns() {
        let engine = PolicyEngine::new(PolicyConfig::default()).unwrap();
        let decision = decide_with(&engine, "SELECT * FROM users", &analyst());
        let ProtectionMethod::DeIdentification(plan) = decision.method else {
            panic!("expected DeID");
        };
        assert!(plan.transform_for("phone_number").is_some());
        assert!(plan.transform_for("department").is_none());
        assert!(plan.anonymity.unwrap().resolve(&["age".into()]).is_some());
    }

    #[test]
    fn plain_queries_pass_through() {
        let engine = PolicyEngine::new(PolicyConfig::default()).unwrap();
        let decision = decide_with(&engine, "SELECT dept FROM users WHERE dept = 'ops'", &analyst());
        assert_eq!(decision.method.tag(), MethodTag::PassThrough);
        assert_eq!(decision.rule, "builtin:default");
    }

    #[test]
    fn most_restrictive_rule_wins() {
        let mut config = PolicyConfig::sample();
        config.query_rules.push(QueryRule {
            name: "allow-ops".into(),
            condition: RuleCondition::RoleEquals { role: "guest".into() },
            outcome: RuleOutcome::PassThrough,
        });
        let engine = PolicyEngine::new(config).unwrap();
        let decision = decide_with(
            &engine,
            "SELECT dept FROM users",
            &RequestContext::new("g", "guest"),
        );
        assert_eq!(decision.method.tag(), MethodTag::Reject);
        assert_eq!(decision.rule, "query-rule:guests-never-export");
    }

    #[test]
    fn dp_rule_on_row_query_becomes_reject() {
        let mut config = PolicyConfig::default();
        config.query_rules.push(QueryRule {
            name: "ops-dp".into(),
            condition: RuleCondition::RoleEquals { role: "ops".into() },
            outcome: RuleOutcome::DifferentialPrivacy {
                epsilon: Some(0.1),
                delta: None,
                mechanism: None,
            },
        });
        let engine = PolicyEngine::new(config).unwrap();
        let context = RequestContext::new("o", "ops");
        let decision = decide_with(&engine, "SELECT dept FROM users WHERE dept = 'x'", &context);
        assert!(matches!(
            decision.method,
            ProtectionMethod::Reject {
                code: RejectionCode::PolicyRejected,
                ..
            }
        ));
        let aggregated = decide_with(&engine, "SELECT AVG(age) FROM users", &context);
        assert_eq!(aggregated.rule, "query-rule:ops-dp");
        let ProtectionMethod::DifferentialPrivacy(params) = aggregated.method else {
            panic!("expected DP");
        };
        assert_eq!(params.epsilon, 0.1);
        assert_eq!(params.sensitivity, 120.0);
    }

    #[test]
    fn reload_swaps_whole_rule_set() {
        let engine = PolicyEngine::new(PolicyConfig::default()).unwrap();
        let before = engine.snapshot();
        let mut config = PolicyConfig::default();
        config.default_epsilon = 0.1;
        engine.reload(config).unwrap();
        assert_eq!(before.config().default_epsilon, 1.0);
        assert_eq!(engine.snapshot().config().default_epsilon, 0.1);

        let mut broken = PolicyConfig::default();
        broken.default_epsilon = -1.0;
        assert!(engine.reload(broken).is_err());
        assert_eq!(engine.snapshot().config().default_epsilon, 0.1);
    }

    #[test]
    fn concurrent_readers_see_whole_rule_sets() {
        let engine = PolicyEngine::new(PolicyConfig::default()).unwrap();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..50 {
                    let mut config = PolicyConfig::default();
                    config.default_epsilon = if round % 2 == 0 { 0.5 } else { 1.0 };
                    config.role_epsilon.insert("x".into(), config.default_epsilon);
                    engine.reload(config).unwrap();
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        let rules = engine.snapshot();
                        let config = rules.config();
                        let epsilon = config
                            .role_epsilon
                            .get("x")
                            .copied()
                            .unwrap_or(config.default_epsilon);
                        assert_eq!(epsilon, config.default_epsilon);
                    }
                });
            }
        });
    }
}
