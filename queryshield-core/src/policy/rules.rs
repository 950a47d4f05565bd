use std::collections::{BTreeMap, BTreeSet};

use queryshield_mechanisms::{DateGranularity, DpMechanism, Hierarchy, MaskStyle};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::{analyzer::AnalysisResult, config::ConfigError, context::RequestContext};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnClass {
    Sensitive,
    QuasiIdentifier,
    Public,
}

/// Value-level rewrite applied to one output column.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DeidMethod {
    Mask(MaskStyle),
    Hash,
    Encrypt,
    FormatPreserving,
    Generalize {
        hierarchy: Hierarchy,
        #[serde(default = "default_generalize_level")]
        level: usize,
    },
    DateShift,
    /// Replaces the value with null.
    Suppress,
}

fn default_generalize_level() -> usize {
    1
}

impl DeidMethod {
    pub fn name(&self) -> &'static str {
        match self {
            DeidMethod::Mask(_) => "mask",
            DeidMethod::Hash => "hash",
            DeidMethod::Encrypt => "encrypt",
            DeidMethod::FormatPreserving => "format-preserving",
            DeidMethod::Generalize { .. } => "generalize",
            DeidMethod::DateShift => "date-shift",
            DeidMethod::Suppress => "suppress",
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let DeidMethod::Generalize { hierarchy, level } = self {
            hierarchy
                .validate()
                .map_err(|err| ConfigError::Validation(err.to_string()))?;
            if *level == 0 || *level > hierarchy.max_level() {
                return Err(ConfigError::Validation(format!(
                    "generalize level {level} outside 1..={}",
                    hierarchy.max_level()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ColumnRule {
    /// Case-insensitive regular expression over column names.
    pub pattern: String,
    pub class: ColumnClass,
    /// Transform for sensitive columns; hashing when unset.
    #[serde(default)]
    pub method: Option<DeidMethod>,
    /// Generalization ladder for quasi-identifiers.
    #[serde(default)]
    pub hierarchy: Option<Hierarchy>,
}

impl ColumnRule {
    fn sensitive(pattern: &str, method: DeidMethod) -> Self {
        Self {
            pattern: pattern.into(),
            class: ColumnClass::Sensitive,
            method: Some(method),
            hierarchy: None,
        }
    }

    fn quasi_identifier(pattern: &str, hierarchy: Hierarchy) -> Self {
        Self {
            pattern: pattern.into(),
            class: ColumnClass::QuasiIdentifier,
            method: None,
            hierarchy: Some(hierarchy),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "when", rename_all = "kebab-case")]
pub enum RuleCondition {
    HasAggregation,
    ColumnMatches { pattern: String },
    IsExport,
    RoleEquals { role: String },
    All { conditions: Vec<RuleCondition> },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum RuleOutcome {
    #[serde(rename_all = "kebab-case")]
    DifferentialPrivacy {
        #[serde(default)]
        epsilon: Option<f64>,
        #[serde(default)]
        delta: Option<f64>,
        #[serde(default)]
        mechanism: Option<DpMechanism>,
    },
    /// Rewrites the columns the rule's condition matched, or every non-public
    /// column when the condition names none.
    DeIdentify {
        #[serde(default)]
        method: Option<DeidMethod>,
    },
    /// k-anonymity (and l-diversity when configured) over the quasi-identifiers.
    Anonymize,
    PassThrough,
    Reject { reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct QueryRule {
    pub name: String,
    pub condition: RuleCondition,
    pub outcome: RuleOutcome,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AnonymityPolicy {
    pub k: usize,
    #[serde(default)]
    pub l: Option<usize>,
    #[serde(default)]
    pub sensitive_column: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SparseVectorDefaults {
    #[serde(default)]
    pub threshold: f64,
    #[serde(default = "default_max_positives")]
    pub max_positives: usize,
}

const fn default_max_positives() -> usize {
    1
}

impl Default for SparseVectorDefaults {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            max_positives: default_max_positives(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyConfig {
    #[serde(default = "default_epsilon")]
    pub default_epsilon: f64,
    #[serde(default)]
    pub default_delta: Option<f64>,
    #[serde(default)]
    pub default_mechanism: DpMechanism,
    /// Per-role epsilon overrides; they win over rule and default epsilon.
    #[serde(default)]
    pub role_epsilon: BTreeMap<String, f64>,
    #[serde(default = "default_column_rules")]
    pub column_rules: Vec<ColumnRule>,
    #[serde(default)]
    pub query_rules: Vec<QueryRule>,
    #[serde(default = "default_anonymity")]
    pub anonymity: Option<AnonymityPolicy>,
    /// Lets aggregates with unbounded sensitivity fall back to
    /// de-identification instead of being refused.
    #[serde(default)]
    pub deid_fallback_on_unbounded: bool,
    #[serde(default)]
    pub sparse_vector: SparseVectorDefaults,
}

fn default_epsilon() -> f64 {
    1.0
}

fn default_anonymity() -> Option<AnonymityPolicy> {
    Some(AnonymityPolicy {
        k: 5,
        l: None,
        sensitive_column: None,
    })
}

/// The built-in column catalogue.
pub fn default_column_rules() -> Vec<ColumnRule> {
    vec![
        ColumnRule::sensitive("name", DeidMethod::Mask(MaskStyle::Name)),
        ColumnRule::sensitive("e_?mail", DeidMethod::Mask(MaskStyle::Email)),
        ColumnRule::sensitive("phone|mobile", DeidMethod::Mask(MaskStyle::Phone)),
        ColumnRule::sensitive("ssn|id_card|password", DeidMethod::Hash),
        ColumnRule::quasi_identifier(
            "^age$",
            Hierarchy::Numeric {
                widths: vec![5.0, 10.0, 50.0],
            },
        ),
        ColumnRule::quasi_identifier(
            "^(zip|zipcode|zip_code|postal_code)$",
            Hierarchy::Prefix { keep: vec![3, 1] },
        ),
        ColumnRule::quasi_identifier(
            "birth_?date|^dob$",
            Hierarchy::Date {
                granularities: vec![DateGranularity::Month, DateGranularity::Year],
            },
        ),
    ]
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_epsilon: default_epsilon(),
            default_delta: None,
            default_mechanism: DpMechanism::default(),
            role_epsilon: BTreeMap::new(),
            column_rules: default_column_rules(),
            query_rules: Vec::new(),
            anonymity: default_anonymity(),
            deid_fallback_on_unbounded: false,
            sparse_vector: SparseVectorDefaults::default(),
        }
    }
}

impl PolicyConfig {
    pub fn sample() -> Self {
        let mut config = Self::default();
        config.role_epsilon.insert("admin".into(), 2.0);
        config.role_epsilon.insert("analyst".into(), 0.5);
        config.anonymity = Some(AnonymityPolicy {
            k: 5,
            l: Some(2),
            sensitive_column: Some("disease".into()),
        });
        config.query_rules = vec![
            QueryRule {
                name: "salary-columns-encrypted".into(),
                condition: RuleCondition::ColumnMatches {
                    pattern: "salary".into(),
                },
                outcome: RuleOutcome::DeIdentify {
                    method: Some(DeidMethod::Encrypt),
                },
            },
            QueryRule {
                name: "guests-never-export".into(),
                condition: RuleCondition::All {
                    conditions: vec![
                        RuleCondition::IsExport,
                        RuleCondition::RoleEquals {
                            role: "guest".into(),
                        },
                    ],
                },
                outcome: RuleOutcome::Reject {
                    reason: "guests may not export row-level data".into(),
                },
            },
        ];
        config
    }
}

#[derive(Clone, Debug)]
pub(crate) enum CompiledCondition {
    HasAggregation,
    ColumnMatches(Regex),
    IsExport,
    RoleEquals(String),
    All(Vec<CompiledCondition>),
}

/// Facts a condition is evaluated against.
pub(crate) struct RuleInput<'a> {
    pub analysis: &'a AnalysisResult,
    pub context: &'a RequestContext,
    /// Referenced columns without the `*` placeholder.
    pub columns: &'a BTreeSet<String>,
    pub wildcard: bool,
    pub export: bool,
}

impl CompiledCondition {
    /// A wildcard projection matches every column pattern, since any column
    /// may end up in the output.
    pub(crate) fn evaluate(&self, input: &RuleInput<'_>) -> bool {
        match self {
            CompiledCondition::HasAggregation => input.analysis.has_aggregation(),
            CompiledCondition::ColumnMatches(regex) => {
                input.wildcard || input.columns.iter().any(|column| regex.is_match(column))
            }
            CompiledCondition::IsExport => input.export,
            CompiledCondition::RoleEquals(role) => input.context.role.eq_ignore_ascii_case(role),
            CompiledCondition::All(conditions) => {
                conditions.iter().all(|condition| condition.evaluate(input))
            }
        }
    }

    /// The first column pattern this condition tests, if any.
    pub(crate) fn column_pattern(&self) -> Option<&Regex> {
        match self {
            CompiledCondition::ColumnMatches(regex) => Some(regex),
            CompiledCondition::All(conditions) => {
                conditions.iter().find_map(CompiledCondition::column_pattern)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct CompiledColumnRule {
    pub index: usize,
    pub regex: Regex,
    pub specificity: usize,
    pub rule: ColumnRule,
}

impl CompiledColumnRule {
    pub fn label(&self) -> String {
        format!("column-rule[{}]:{}", self.index, self.rule.pattern)
    }

    /// Transform applied to columns this rule marks sensitive.
    pub fn method(&self) -> DeidMethod {
        self.rule.method.clone().unwrap_or(DeidMethod::Hash)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct CompiledQueryRule {
    pub rule: QueryRule,
    pub condition: CompiledCondition,
}

/// A validated, immutable rule set. The engine swaps whole instances on
/// reload so a decision only ever sees one consistent set.
#[derive(Clone, Debug)]
pub struct CompiledRuleSet {
    config: PolicyConfig,
    pub(crate) column_rules: Vec<CompiledColumnRule>,
    pub(crate) query_rules: Vec<CompiledQueryRule>,
}

impl CompiledRuleSet {
    pub fn compile(config: PolicyConfig) -> Result<Self, ConfigError> {
        check_epsilon("default-epsilon", config.default_epsilon)?;
        if let Some(delta) = config.default_delta {
            check_delta("default-delta", delta)?;
        }
        for (role, epsilon) in &config.role_epsilon {
            check_epsilon(&format!("role-epsilon.{role}"), *epsilon)?;
        }
        if config.sparse_vector.max_positives == 0 || !config.sparse_vector.threshold.is_finite() {
            return Err(ConfigError::Validation(
                "sparse-vector needs a finite threshold and max-positives >= 1".into(),
            ));
        }

        let mut column_rules = Vec::with_capacity(config.column_rules.len());
        for (index, rule) in config.column_rules.iter().enumerate() {
            if let Some(method) = &rule.method {
                method.validate()?;
            }
            match (&rule.class, &rule.hierarchy) {
                (ColumnClass::QuasiIdentifier, None) => {
                    return Err(ConfigError::Validation(format!(
                        "quasi-identifier rule {} needs a hierarchy",
                        rule.pattern
                    )))
                }
                (_, Some(hierarchy)) => hierarchy
                    .validate()
                    .map_err(|err| ConfigError::Validation(format!("{}: {err}", rule.pattern)))?,
                _ => {}
            }
            column_rules.push(CompiledColumnRule {
                index,
                regex: compile_pattern(&rule.pattern)?,
                specificity: literal_length(&rule.pattern),
                rule: rule.clone(),
            });
        }

        let mut query_rules = Vec::with_capacity(config.query_rules.len());
        for rule in &config.query_rules {
            match &rule.outcome {
                RuleOutcome::DifferentialPrivacy { epsilon, delta, .. } => {
                    if let Some(epsilon) = epsilon {
                        check_epsilon(&rule.name, *epsilon)?;
                    }
                    if let Some(delta) = delta {
                        check_delta(&rule.name, *delta)?;
                    }
                }
                RuleOutcome::DeIdentify {
                    method: Some(method),
                } => method.validate()?,
                RuleOutcome::Anonymize if config.anonymity.is_none() => {
                    return Err(ConfigError::Validation(format!(
                        "rule {} anonymizes but no anonymity section is configured",
                        rule.name
                    )))
                }
                _ => {}
            }
            query_rules.push(CompiledQueryRule {
                condition: compile_condition(&rule.condition)?,
                rule: rule.clone(),
            });
        }

        if let Some(anonymity) = &config.anonymity {
            if anonymity.k == 0 {
                return Err(ConfigError::Validation("anonymity.k must be >= 1".into()));
            }
            match (anonymity.l, &anonymity.sensitive_column) {
                (Some(0), _) => {
                    return Err(ConfigError::Validation("anonymity.l must be >= 1".into()))
                }
                (Some(_), None) => {
                    return Err(ConfigError::Validation(
                        "anonymity.l needs a sensitive-column".into(),
                    ))
                }
                _ => {}
            }
        }

        Ok(Self {
            config,
            column_rules,
            query_rules,
        })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// The most specific column rule matching `column`: longest literal
    /// content, ties to the earlier rule.
    pub(crate) fn classify(&self, column: &str) -> Option<&CompiledColumnRule> {
        self.column_rules
            .iter()
            .filter(|rule| rule.regex.is_match(column))
            .fold(None, |best: Option<&CompiledColumnRule>, rule| match best {
                Some(current) if current.specificity >= rule.specificity => Some(current),
                _ => Some(rule),
            })
    }

    /// Column rules of one class, most specific first.
    pub(crate) fn rules_of(&self, class: ColumnClass) -> Vec<&CompiledColumnRule> {
        let mut rules: Vec<&CompiledColumnRule> = self
            .column_rules
            .iter()
            .filter(|rule| rule.rule.class == class)
            .collect();
        rules.sort_by(|left, right| {
            right
                .specificity
                .cmp(&left.specificity)
                .then(left.index.cmp(&right.index))
        });
        rules
    }

    /// Every de-identification method any rule can select.
    pub fn methods_in_use(&self) -> Vec<DeidMethod> {
        let mut methods: Vec<DeidMethod> = self
            .column_rules
            .iter()
            .filter(|rule| rule.rule.class == ColumnClass::Sensitive)
            .map(CompiledColumnRule::method)
            .collect();
        for rule in &self.query_rules {
            if let RuleOutcome::DeIdentify { method } = &rule.rule.outcome {
                methods.push(method.clone().unwrap_or(DeidMethod::Hash));
            }
        }
        methods
    }

    pub fn query_rule_count(&self) -> usize {
        self.query_rules.len()
    }

    pub fn column_rule_count(&self) -> usize {
        self.column_rules.len()
    }
}

fn check_epsilon(what: &str, epsilon: f64) -> Result<(), ConfigError> {
    if epsilon.is_finite() && epsilon > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "{what}: epsilon must be finite and > 0 (got {epsilon})"
        )))
    }
}

fn check_delta(what: &str, delta: f64) -> Result<(), ConfigError> {
    if delta > 0.0 && delta < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "{what}: delta must be in (0, 1) (got {delta})"
        )))
    }
}

pub(crate) fn compile_pattern(pattern: &str) -> Result<Regex, ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|err| ConfigError::Validation(format!("invalid column pattern {pattern}: {err}")))
}

fn compile_condition(condition: &RuleCondition) -> Result<CompiledCondition, ConfigError> {
    Ok(match condition {
        RuleCondition::HasAggregation => CompiledCondition::HasAggregation,
        RuleCondition::ColumnMatches { pattern } => {
            CompiledCondition::ColumnMatches(compile_pattern(pattern)?)
        }
        RuleCondition::IsExport => CompiledCondition::IsExport,
        RuleCondition::RoleEquals { role } => CompiledCondition::RoleEquals(role.clone()),
        RuleCondition::All { conditions } => {
            if conditions.is_empty() {
                return Err(ConfigError::Validation(
                    "an all-condition needs at least one member".into(),
                ));
            }
            CompiledCondition::All(
                conditions
                    .iter()
                    .map(compile_condition)
                    .collect::<Result<_, _>>()?,
            )
        }
    })
}

/// Number of literal word characters in a pattern; escapes such as `\d`
/// are not literal.
fn literal_length(pattern: &str) -> usize {
    let mut count = 0;
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            chars.next();
        } else if ch.is_alphanumeric() || ch == '_' {
            count += 1;
        }
    }
    count
}
