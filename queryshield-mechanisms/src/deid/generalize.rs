use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    deid::cell_text,
    error::{MechanismError, MechanismResult},
};

pub const SUPPRESSED: &str = "*";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum DateGranularity {
    Month,
    Year,
    Decade,
}

/// A generalization ladder for one quasi-identifier. Level 0 is the raw value,
/// levels `1..=steps` follow the configured ladder and the final level is `*`.
/// Every ladder is nested: two values sharing a bucket at level `i` share a
/// bucket at every level above `i`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Hierarchy {
    Numeric { widths: Vec<f64> },
    Prefix { keep: Vec<usize> },
    Date { granularities: Vec<DateGranularity> },
}

impl Hierarchy {
    /// Highest level, which always renders as `*`.
    pub fn max_level(&self) -> usize {
        let steps = match self {
            Hierarchy::Numeric { widths } => widths.len(),
            Hierarchy::Prefix { keep } => keep.len(),
            Hierarchy::Date { granularities } => granularities.len(),
        };
        steps + 1
    }

    pub fn validate(&self) -> MechanismResult<()> {
        match self {
            Hierarchy::Numeric { widths } => {
                for width in widths {
                    if !width.is_finite() || *width <= 0.0 {
                        return Err(MechanismError::InvalidParameter(format!(
                            "numeric bucket width must be > 0 (got {width})"
                        )));
                    }
                }
                for pair in widths.windows(2) {
                    let ratio = pair[1] / pair[0];
                    if pair[1] <= pair[0] || (ratio - ratio.round()).abs() > 1e-9 {
                        return Err(MechanismError::InvalidParameter(format!(
                            "bucket width {} is not a multiple of {}",
                            pair[1], pair[0]
                        )));
                    }
                }
            }
            Hierarchy::Prefix { keep } => {
                if keep.windows(2).any(|pair| pair[1] >= pair[0]) {
                    return Err(MechanismError::InvalidParameter(
                        "prefix lengths must strictly decrease".into(),
                    ));
                }
            }
            Hierarchy::Date { granularities } => {
                if granularities.windows(2).any(|pair| pair[1] <= pair[0]) {
                    return Err(MechanismError::InvalidParameter(
                        "date granularities must strictly coarsen".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Renders `value` at `level`. Values the ladder cannot interpret
    /// generalize straight to `*`.
    pub fn label(&self, value: &Value, level: usize) -> Value {
        if level == 0 {
            return value.clone();
        }
        if level >= self.max_level() {
            return Value::String(SUPPRESSED.into());
        }
        let step = level - 1;
        let rendered = match self {
            Hierarchy::Numeric { widths } => {
                numeric_value(value).map(|v| numeric_bucket(v, widths[step]))
            }
            Hierarchy::Prefix { keep } => {
                cell_text(value).map(|text| prefix_code(&text, keep[step]))
            }
            Hierarchy::Date { granularities } => cell_text(value)
                .and_then(|text| parse_date(&text))
                .map(|date| round_date(date, granularities[step])),
        };
        Value::String(rendered.unwrap_or_else(|| SUPPRESSED.into()))
    }
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// `45` with width 10 becomes `40-49`; fractional widths render as `[lo, hi)`.
pub fn numeric_bucket(value: f64, width: f64) -> String {
    let lower = (value / width).floor() * width;
    let upper = lower + width;
    if width.fract() == 0.0 && lower.fract() == 0.0 {
        format!("{}-{}", lower as i64, upper as i64 - 1)
    } else {
        format!("[{lower}, {upper})")
    }
}

/// `90210` keeping 3 becomes `902**`.
pub fn prefix_code(code: &str, keep: usize) -> String {
    code.chars()
        .enumerate()
        .map(|(idx, c)| if idx < keep { c } else { '*' })
        .collect()
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let head = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

pub fn round_date(date: NaiveDate, granularity: DateGranularity) -> String {
    match granularity {
        DateGranularity::Month => format!("{:04}-{:02}", date.year(), date.month()),
        DateGranularity::Year => format!("{:04}", date.year()),
        DateGranularity::Decade => format!("{}s", date.year() - date.year().rem_euclid(10)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn numeric_ladder_is_nested() {
        let ages = Hierarchy::Numeric {
            widths: vec![10.0, 50.0],
        };
        ages.validate().unwrap();
        assert_eq!(ages.label(&json!(45), 0), json!(45));
        assert_eq!(ages.label(&json!(45), 1), json!("40-49"));
        assert_eq!(ages.label(&json!(45), 2), json!("0-49"));
        assert_eq!(ages.label(&json!(45), 3), json!("*"));
        assert_eq!(ages.label(&json!("52"), 1), json!("50-59"));
        assert_eq!(ages.label(&json!(null), 1), json!("*"));
    }

    #[test]
    fn rejects_non_nested_ladders() {
        let widths = Hierarchy::Numeric {
            widths: vec![10.0, 25.0],
        };
        assert!(widths.validate().is_err());
        let prefix = Hierarchy::Prefix { keep: vec![3, 3] };
        assert!(prefix.validate().is_err());
        let dates = Hierarchy::Date {
            granularities: vec![DateGranularity::Year, DateGranularity::Month],
        };
        assert!(dates.validate().is_err());
    }

    #[test]
    fn prefix_and_date_labels() {
        let zip = Hierarchy::Prefix { keep: vec![3, 1] };
        assert_eq!(zip.label(&json!("90210"), 1), json!("902**"));
        assert_eq!(zip.label(&json!(90210), 2), json!("9****"));
        let dob = Hierarchy::Date {
            granularities: vec![DateGranularity::Month, DateGranularity::Decade],
        };
        assert_eq!(dob.label(&json!("1987-06-15"), 1), json!("1987-06"));
        assert_eq!(dob.label(&json!("1987-06-15T10:00:00Z"), 2), json!("1980s"));
        assert_eq!(dob.label(&json!("garbage"), 1), json!("*"));
    }

    #[test]
    fn fractional_buckets() {
        assert_eq!(numeric_bucket(2.7, 0.5), "[2.5, 3)");
        assert_eq!(numeric_bucket(-3.0, 10.0), "-10--1");
    }
}
