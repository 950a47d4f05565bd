//! Cell-level de-identification over result rows.

use std::collections::BTreeSet;

use queryshield_mechanisms::{
    cell_text, hash_value, key_from_hex, mask, DateShifter, DeterministicCipher,
    FormatPreservingCipher, Row,
};
use serde_json::Value;
use tracing::debug;

use crate::{
    config::{ConfigError, DeidConfig},
    policy::{ColumnTransform, DeidMethod},
};

/// Keyed de-identification state built once from [`DeidConfig`].
#[derive(Clone)]
pub struct DeidToolkit {
    salt: String,
    hash_length: usize,
    cipher: Option<DeterministicCipher>,
    fpe: Option<FormatPreservingCipher>,
    shifter: Option<DateShifter>,
    identifier_column: String,
}

impl DeidToolkit {
    pub fn from_config(config: &DeidConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let invalid = |name: &str, err: queryshield_mechanisms::MechanismError| {
            ConfigError::Validation(format!("{name}: {err}"))
        };
        let cipher = config
            .encryption_key
            .as_deref()
            .map(DeterministicCipher::from_hex)
            .transpose()
            .map_err(|err| invalid("encryption-key", err))?;
        let fpe = config
            .fpe_key
            .as_deref()
            .map(FormatPreservingCipher::from_hex)
            .transpose()
            .map_err(|err| invalid("fpe-key", err))?;
        let shifter = match config.date_shift_key.as_deref() {
            Some(key) => Some(
                key_from_hex(key)
                    .and_then(|key| DateShifter::new(key, config.date_shift_max_days))
                    .map_err(|err| invalid("date-shift-key", err))?,
            ),
            None => None,
        };
        Ok(Self {
            salt: config.hash_salt.clone(),
            hash_length: config.hash_length,
            cipher,
            fpe,
            shifter,
            identifier_column: config.identifier_column.to_lowercase(),
        })
    }

    /// Whether the keys `method` needs are loaded.
    pub fn supports(&self, method: &DeidMethod) -> bool {
        match method {
            DeidMethod::Encrypt => self.cipher.is_some(),
            DeidMethod::FormatPreserving => self.fpe.is_some(),
            DeidMethod::DateShift => self.shifter.is_some(),
            _ => true,
        }
    }

    pub fn identifier_column(&self) -> &str {
        &self.identifier_column
    }

    /// Rewrites one cell. Nulls stay null; anything the method cannot
    /// interpret is suppressed rather than released raw.
    pub fn apply(&self, method: &DeidMethod, value: &Value, identifier: Option<&str>) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        if let DeidMethod::Generalize { hierarchy, level } = method {
            return hierarchy.label(value, *level);
        }
        let Some(text) = cell_text(value) else {
            return Value::Null;
        };
        let rewritten = match method {
            DeidMethod::Mask(style) => Some(mask(&text, style)),
            DeidMethod::Hash => Some(hash_value(&text, &self.salt, self.hash_length)),
            DeidMethod::Encrypt => self
                .cipher
                .as_ref()
                .and_then(|cipher| cipher.encrypt(&text).ok()),
            DeidMethod::FormatPreserving => self
                .fpe
                .as_ref()
                .map(|fpe| fpe.encrypt(&text, identifier.unwrap_or_default())),
            DeidMethod::DateShift => match (&self.shifter, identifier) {
                (Some(shifter), Some(identifier)) => shifter.shift_text(&text, identifier).ok(),
                _ => None,
            },
            DeidMethod::Suppress | DeidMethod::Generalize { .. } => None,
        };
        rewritten.map(Value::String).unwrap_or(Value::Null)
    }

    /// Applies the first matching transform to every column not in `skip`.
    /// Returns the rewritten rows and the columns that were touched.
    pub fn rewrite_rows(
        &self,
        rows: Vec<Row>,
        transforms: &[ColumnTransform],
        skip: &BTreeSet<String>,
    ) -> (Vec<Row>, BTreeSet<String>) {
        let mut touched = BTreeSet::new();
        if transforms.is_empty() {
            return (rows, touched);
        }
        let rows = rows
            .into_iter()
            .map(|row| {
                let identifier = row.get(&self.identifier_column).and_then(cell_text);
                row.into_iter()
                    .map(|(column, value)| {
                        if skip.contains(&column) {
                            return (column, value);
                        }
                        match transforms
                            .iter()
                            .find(|transform| transform.selector.matches(&column))
                        {
                            Some(transform) => {
                                let rewritten =
                                    self.apply(&transform.method, &value, identifier.as_deref());
                                touched.insert(column.clone());
                                (column, rewritten)
                            }
                            None => (column, value),
                        }
                    })
                    .collect()
            })
            .collect();
        debug!(
            "rewrote columns [{}]",
            touched.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        (rows, touched)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use queryshield_mechanisms::{Hierarchy, MaskStyle};
    use serde_json::json;

    use super::*;
    use crate::policy::ColumnSelector;

    fn toolkit() -> DeidToolkit {
        DeidToolkit::from_config(&DeidConfig {
            encryption_key: Some("11".repeat(32)),
            fpe_key: Some("22".repeat(32)),
            date_shift_key: Some("33".repeat(32)),
            ..DeidConfig::default()
        })
        .unwrap()
    }

    fn named(column: &str, method: DeidMethod) -> ColumnTransform {
        ColumnTransform {
            selector: ColumnSelector::Named(column.into()),
            method,
            rule: "test".into(),
        }
    }

    #[test]
    fn cells_are_rewritten_per_method() {
        let toolkit = toolkit();
        assert_eq!(
            toolkit.apply(&DeidMethod::Mask(MaskStyle::Email), &json!("jane@example.com"), None),
            json!("j***@example.com")
        );
        let hashed = toolkit.apply(&DeidMethod::Hash, &json!("123-45-6789"), None);
        assert_eq!(hashed.as_str().unwrap().len(), 16);
        assert_eq!(hashed, toolkit.apply(&DeidMethod::Hash, &json!("123-45-6789"), None));
        assert_eq!(toolkit.apply(&DeidMethod::Suppress, &json!("x"), None), Value::Null);
        assert_eq!(toolkit.apply(&DeidMethod::Hash, &Value::Null, None), Value::Null);
        assert_eq!(
            toolkit.apply(
                &DeidMethod::Generalize {
                    hierarchy: Hierarchy::Numeric {
                        widths: vec![10.0]
                    },
                    level: 1
                },
                &json!(45),
                None
            ),
            json!("40-49")
        );
    }

    #[test]
    fn date_shift_needs_an_identifier() {
        let toolkit = toolkit();
        let shifted = toolkit.apply(&DeidMethod::DateShift, &json!("2024-03-01"), Some("p1"));
        assert!(shifted.is_string());
        assert_eq!(
            toolkit.apply(&DeidMethod::DateShift, &json!("2024-03-01"), None),
            Value::Null
        );
        assert_eq!(
            toolkit.apply(&DeidMethod::DateShift, &json!("not a date"), Some("p1")),
            Value::Null
        );
    }

    #[test]
    fn missing_keys_are_reported() {
        let bare = DeidToolkit::from_config(&DeidConfig::default()).unwrap();
        assert!(!bare.supports(&DeidMethod::Encrypt));
        assert!(bare.supports(&DeidMethod::Hash));
        assert_eq!(bare.apply(&DeidMethod::Encrypt, &json!("x"), None), Value::Null);
    }

    #[test]
    fn rows_keep_identifier_driven_consistency() {
        let toolkit = toolkit();
        let rows: Vec<Row> = vec![
            [("id".to_string(), json!(7)), ("admitted".to_string(), json!("2024-01-10"))]
                .into_iter()
                .collect(),
            [("id".to_string(), json!(7)), ("admitted".to_string(), json!("2024-01-17"))]
                .into_iter()
                .collect(),
        ];
        let (rows, touched) = toolkit.rewrite_rows(
            rows,
            &[named("admitted", DeidMethod::DateShift)],
            &BTreeSet::new(),
        );
        assert_eq!(touched.into_iter().collect::<Vec<_>>(), vec!["admitted".to_string()]);
        let date = |row: &Row| {
            chrono::NaiveDate::parse_from_str(row["admitted"].as_str().unwrap(), "%Y-%m-%d")
                .unwrap()
        };
        let (first, second) = (date(&rows[0]), date(&rows[1]));
        assert_eq!((second - first).num_days(), 7);
        assert_eq!(rows[0]["id"], json!(7));
    }
}
