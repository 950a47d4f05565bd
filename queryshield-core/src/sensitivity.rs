//! Global sensitivity under add/remove-one-individual semantics.
//!
//! Composition rule, applied to every query level:
//!
//! * aggregate base sensitivity: `COUNT` is 1, `SUM(col)` is `max(|lo|, |hi|)`
//!   and `AVG/MIN/MAX(col)` is `hi - lo` of the configured bound for `col`;
//! * windowed aggregates are scaled by `max-rows-per-partition`;
//! * aggregates released together add up (L1 over the output vector);
//! * the result is scaled by `M = Σ m_t` over every contributing base table,
//!   where `m_t` bounds how many output rows one individual's records in `t`
//!   can influence (default 1, mandatory for every table once any level of
//!   the query joins relations);
//! * a nested query that aggregates multiplies the parent by `max(1, Δ_sub)`;
//! * set operations take the maximum over their branches.
//!
//! Anything the rule cannot bound is reported as unbounded, never clamped.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    analyzer::{AggregateCall, AggregateKind, AnalysisResult},
    config::ConfigError,
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValueBound {
    pub lower: f64,
    pub upper: f64,
}

impl ValueBound {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SensitivityConfig {
    /// Keyed by `column` or `table.column`.
    #[serde(default)]
    pub column_bounds: BTreeMap<String, ValueBound>,
    /// Per-table `m_t`: output rows one individual can influence through the table.
    #[serde(default)]
    pub table_contributions: BTreeMap<String, f64>,
    #[serde(default)]
    pub max_rows_per_partition: Option<f64>,
}

impl SensitivityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (column, bound) in &self.column_bounds {
            if !bound.lower.is_finite() || !bound.upper.is_finite() || bound.upper <= bound.lower {
                return Err(ConfigError::Validation(format!(
                    "column bound for {column} must satisfy lower < upper"
                )));
            }
        }
        for (table, contribution) in &self.table_contributions {
            if !contribution.is_finite() || *contribution < 1.0 {
                return Err(ConfigError::Validation(format!(
                    "table contribution for {table} must be >= 1"
                )));
            }
        }
        if let Some(cap) = self.max_rows_per_partition {
            if !cap.is_finite() || cap < 1.0 {
                return Err(ConfigError::Validation(
                    "max-rows-per-partition must be >= 1".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Sensitivity {
    Bounded { value: f64 },
    Unbounded { reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SensitivityEstimate {
    pub sensitivity: Sensitivity,
    /// How the bound was composed, one step per line.
    pub reasoning: Vec<String>,
}

impl SensitivityEstimate {
    pub fn bound(&self) -> Option<f64> {
        match self.sensitivity {
            Sensitivity::Bounded { value } => Some(value),
            Sensitivity::Unbounded { .. } => None,
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.bound().is_some()
    }

    pub fn unbounded_reason(&self) -> Option<&str> {
        match &self.sensitivity {
            Sensitivity::Unbounded { reason } => Some(reason),
            Sensitivity::Bounded { .. } => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SensitivityCalculator {
    config: SensitivityConfig,
}

impl SensitivityCalculator {
    pub fn new(config: SensitivityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SensitivityConfig {
        &self.config
    }

    pub fn estimate(&self, result: &AnalysisResult) -> SensitivityEstimate {
        let mut reasoning = Vec::new();
        let outcome = if result.has_aggregation() {
            self.node(result, &mut reasoning)
        } else {
            Err("query releases row-level data".to_string())
        };
        let sensitivity = match outcome {
            Ok(value) if value.is_finite() && value > 0.0 => Sensitivity::Bounded { value },
            Ok(value) => Sensitivity::Unbounded {
                reason: format!("composed sensitivity {value} is not a positive finite number"),
            },
            Err(reason) => Sensitivity::Unbounded { reason },
        };
        SensitivityEstimate {
            sensitivity,
            reasoning,
        }
    }

    fn node(&self, node: &AnalysisResult, reasoning: &mut Vec<String>) -> Result<f64, String> {
        let mut value = if node.set_branches.is_empty() {
            self.own_aggregates(node, reasoning)?
        } else {
            let mut worst: f64 = 0.0;
            for branch in &node.set_branches {
                if !branch.has_aggregation() {
                    return Err("set operation mixes aggregated and row-level branches".into());
                }
                worst = worst.max(self.node(branch, reasoning)?);
            }
            reasoning.push(format!(
                "set operation over {} branches: max = {worst}",
                node.set_branches.len()
            ));
            worst
        };
        for nested in node.subqueries.iter().filter(|nested| nested.aggregates_anywhere()) {
            let nested_value = self.node(nested, reasoning)?;
            value *= nested_value.max(1.0);
            reasoning.push(format!("nested aggregate scales by max(1, {nested_value})"));
        }
        Ok(value)
    }

    fn own_aggregates(
        &self,
        node: &AnalysisResult,
        reasoning: &mut Vec<String>,
    ) -> Result<f64, String> {
        let tables = node.base_tables();
        let multiplicity = self.multiplicity(node, &tables, reasoning)?;
        let mut total = 0.0;
        for call in &node.aggregate_calls {
            let base = self.base(call, &tables)?;
            let partition = if call.windowed {
                self.config.max_rows_per_partition.ok_or_else(|| {
                    format!(
                        "windowed {} has no max-rows-per-partition bound",
                        call.kind.as_str()
                    )
                })?
            } else {
                1.0
            };
            let contribution = base * partition * multiplicity;
            reasoning.push(format!(
                "{} -> base {base} x partition {partition} x multiplicity {multiplicity} = {contribution}",
                call.output_name
            ));
            total += contribution;
        }
        Ok(total)
    }

    fn base(&self, call: &AggregateCall, tables: &BTreeSet<String>) -> Result<f64, String> {
        if call.kind == AggregateKind::Count {
            return Ok(1.0);
        }
        let column = match call.column.as_deref() {
            Some(column) if column != "*" => column,
            _ => {
                return Err(format!(
                    "{} over an expression has no configured bound",
                    call.kind.as_str()
                ))
            }
        };
        let keys = tables
            .iter()
            .map(|table| format!("{table}.{column}"))
            .chain(std::iter::once(column.to_string()));
        let mut bound: Option<f64> = None;
        for key in keys {
            if let Some(range) = self.config.column_bounds.get(&key) {
                let value = match call.kind {
                    AggregateKind::Sum => range.lower.abs().max(range.upper.abs()),
                    _ => range.upper - range.lower,
                };
                bound = Some(bound.map_or(value, |current| current.max(value)));
            }
        }
        bound.ok_or_else(|| format!("no value bound configured for column {column}"))
    }

    fn multiplicity(
        &self,
        node: &AnalysisResult,
        tables: &BTreeSet<String>,
        reasoning: &mut Vec<String>,
    ) -> Result<f64, String> {
        if tables.is_empty() {
            return Ok(1.0);
        }
        // A join anywhere in the tree can fan one individual's rows out, even
        // when the join sits inside a derived table or CTE.
        let joined = node.joins_anywhere();
        let mut total = 0.0;
        for table in tables {
            let contribution = match self.config.table_contributions.get(table) {
                Some(value) => *value,
                None if joined => {
                    return Err(format!(
                        "table {table} is joined without a configured contribution bound"
                    ))
                }
                None => 1.0,
            };
            total += contribution;
        }
        reasoning.push(format!(
            "contributing tables [{}] -> multiplicity {total}",
            tables.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;

    fn calculator() -> SensitivityCalculator {
        let mut config = SensitivityConfig::default();
        config
            .column_bounds
            .insert("salary".into(), ValueBound::new(0.0, 200_000.0));
        config
            .column_bounds
            .insert("users.age".into(), ValueBound::new(0.0, 120.0));
        SensitivityCalculator::new(config)
    }

    fn bound(sql: &str, calculator: &SensitivityCalculator) -> Option<f64> {
        calculator.estimate(&analyze(sql).unwrap()).bound()
    }

    #[test]
    fn count_is_one_per_table() {
        assert_eq!(bound("SELECT COUNT(*) FROM users", &calculator()), Some(1.0));
        assert_eq!(
            bound(
                "SELECT COUNT(*) FROM users WHERE id IN (SELECT user_id FROM orders)",
                &calculator()
            ),
            Some(2.0)
        );
    }

    #[test]
    fn sums_use_configured_bounds() {
        let calc = calculator();
        assert_eq!(bound("SELECT SUM(salary) FROM employees", &calc), Some(200_000.0));
        assert_eq!(bound("SELECT AVG(age) FROM users", &calc), Some(120.0));
        assert_eq!(bound("SELECT COUNT(*), MAX(age) FROM users", &calc), Some(121.0));
    }

    #[test]
    fn missing_bounds_are_unbounded() {
        let calc = calculator();
        let estimate = calc.estimate(&analyze("SELECT SUM(amount) FROM orders").unwrap());
        assert!(!estimate.is_bounded());
        assert!(estimate.unbounded_reason().unwrap().contains("amount"));
        assert!(bound("SELECT SUM(salary * 2) FROM employees", &calc).is_none());
        assert!(bound("SELECT name FROM users", &calc).is_none());
    }

    #[test]
    fn joins_need_contribution_bounds() {
        let mut calc = calculator();
        let sql = "SELECT COUNT(*) FROM users u JOIN orders o ON u.id = o.user_id";
        assert!(bound(sql, &calc).is_none());
        calc.config.table_contributions.insert("users".into(), 1.0);
        calc.config.table_contributions.insert("orders".into(), 20.0);
        assert_eq!(bound(sql, &calc), Some(21.0));
    }

    #[test]
    fn nested_and_comma_joins_need_contribution_bounds() {
        let mut calc = calculator();
        let forms = [
            "SELECT COUNT(*) FROM (SELECT u.id FROM users u JOIN orders o ON u.id = o.user_id) t",
            "WITH j AS (SELECT u.id FROM users u JOIN orders o ON u.id = o.user_id) \
             SELECT COUNT(*) FROM j",
            "SELECT COUNT(*) FROM users u, orders o WHERE u.id = o.user_id",
        ];
        for sql in forms {
            let estimate = calc.estimate(&analyze(sql).unwrap());
            assert!(!estimate.is_bounded(), "{sql} was bounded");
            assert!(estimate
                .unbounded_reason()
                .unwrap()
                .contains("without a configured contribution bound"));
        }
        calc.config.table_contributions.insert("users".into(), 1.0);
        calc.config.table_contributions.insert("orders".into(), 1_000.0);
        for sql in forms {
            assert_eq!(bound(sql, &calc), Some(1_001.0), "{sql}");
        }
    }

    #[test]
    fn windows_need_partition_cap() {
        let mut calc = calculator();
        let sql = "SELECT SUM(salary) OVER (PARTITION BY dept) FROM employees";
        assert!(bound(sql, &calc).is_none());
        calc.config.max_rows_per_partition = Some(10.0);
        assert_eq!(bound(sql, &calc), Some(2_000_000.0));
    }

    #[test]
    fn unions_take_the_worst_branch() {
        let calc = calculator();
        assert_eq!(
            bound(
                "SELECT COUNT(*) FROM users UNION SELECT SUM(salary) FROM employees",
                &calc
            ),
            Some(200_000.0)
        );
    }

    #[test]
    fn nested_aggregates_multiply() {
        let calc = calculator();
        let sql = "SELECT COUNT(*) FROM employees WHERE salary > (SELECT AVG(salary) FROM employees)";
        let estimate = calc.estimate(&analyze(sql).unwrap());
        assert_eq!(estimate.bound(), Some(200_000.0));
        assert!(!estimate.reasoning.is_empty());
    }

    #[test]
    fn config_validation() {
        let mut config = SensitivityConfig::default();
        config
            .column_bounds
            .insert("x".into(), ValueBound::new(5.0, 5.0));
        assert!(config.validate().is_err());
    }
}
