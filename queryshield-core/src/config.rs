use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use queryshield_mechanisms::{key_from_hex, DEFAULT_HASH_LENGTH};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    budget::ResetFrequency,
    policy::{CompiledRuleSet, DeidMethod, PolicyConfig},
    sensitivity::{SensitivityConfig, ValueBound},
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ShieldConfig {
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub sensitivity: SensitivityConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub deid: DeidConfig,
    #[serde(default)]
    pub driver: DriverConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct BudgetConfig {
    #[serde(default = "default_total_epsilon")]
    pub default_total: f64,
    /// Per-role period totals; roles missing here get `default-total`.
    #[serde(default)]
    pub role_budgets: BTreeMap<String, f64>,
    #[serde(default)]
    pub reset_frequency: ResetFrequency,
}

fn default_total_epsilon() -> f64 {
    1.0
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_total: default_total_epsilon(),
            role_budgets: BTreeMap::new(),
            reset_frequency: ResetFrequency::default(),
        }
    }
}

impl BudgetConfig {
    pub fn total_for_role(&self, role: &str) -> f64 {
        self.role_budgets
            .get(role)
            .copied()
            .unwrap_or(self.default_total)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let totals = std::iter::once(("default", self.default_total)).chain(
            self.role_budgets
                .iter()
                .map(|(role, total)| (role.as_str(), *total)),
        );
        for (role, total) in totals {
            if !total.is_finite() || total < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "budget total for {role} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DeidConfig {
    #[serde(default = "default_hash_salt")]
    pub hash_salt: String,
    #[serde(default = "default_hash_length")]
    pub hash_length: usize,
    /// 32-byte hex key for deterministic AES-256-GCM.
    #[serde(default)]
    pub encryption_key: Option<String>,
    /// 32-byte hex key for format-preserving encryption.
    #[serde(default)]
    pub fpe_key: Option<String>,
    #[serde(default)]
    pub date_shift_key: Option<String>,
    #[serde(default = "default_date_shift_days")]
    pub date_shift_max_days: i64,
    /// Column naming the individual a row belongs to; drives date-shift offsets
    /// and the FPE tweak.
    #[serde(default = "default_identifier_column")]
    pub identifier_column: String,
}

fn default_hash_salt() -> String {
    "queryshield".into()
}

const fn default_hash_length() -> usize {
    DEFAULT_HASH_LENGTH
}

const fn default_date_shift_days() -> i64 {
    30
}

fn default_identifier_column() -> String {
    "id".into()
}

impl Default for DeidConfig {
    fn default() -> Self {
        Self {
            hash_salt: default_hash_salt(),
            hash_length: default_hash_length(),
            encryption_key: None,
            fpe_key: None,
            date_shift_key: None,
            date_shift_max_days: default_date_shift_days(),
            identifier_column: default_identifier_column(),
        }
    }
}

impl DeidConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hash_length == 0 || self.hash_length > 64 {
            return Err(ConfigError::Validation(
                "hash-length must be within 1..=64".into(),
            ));
        }
        if self.date_shift_max_days <= 0 {
            return Err(ConfigError::Validation(
                "date-shift-max-days must be greater than zero".into(),
            ));
        }
        for (name, key) in [
            ("encryption-key", &self.encryption_key),
            ("fpe-key", &self.fpe_key),
            ("date-shift-key", &self.date_shift_key),
        ] {
            if let Some(key) = key {
                key_from_hex(key)
                    .map_err(|err| ConfigError::Validation(format!("{name}: {err}")))?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DriverConfig {
    /// Hex seed for reproducible noise. Requests draw from OS entropy when unset.
    #[serde(default)]
    pub noise_seed: Option<String>,
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
}

const fn default_audit_capacity() -> usize {
    10_000
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            noise_seed: None,
            audit_capacity: default_audit_capacity(),
        }
    }
}

impl ShieldConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rules = CompiledRuleSet::compile(self.policy.clone())?;
        self.sensitivity.validate()?;
        self.budget.validate()?;
        self.deid.validate()?;
        for method in rules.methods_in_use() {
            let missing = match method {
                DeidMethod::Encrypt if self.deid.encryption_key.is_none() => Some("encryption-key"),
                DeidMethod::FormatPreserving if self.deid.fpe_key.is_none() => Some("fpe-key"),
                DeidMethod::DateShift if self.deid.date_shift_key.is_none() => {
                    Some("date-shift-key")
                }
                _ => None,
            };
            if let Some(key) = missing {
                return Err(ConfigError::Validation(format!(
                    "policy uses {} but deid.{key} is not set",
                    method.name()
                )));
            }
        }
        if let Some(seed) = &self.driver.noise_seed {
            key_from_hex(seed)
                .map_err(|err| ConfigError::Validation(format!("driver.noise-seed: {err}")))?;
        }
        if self.driver.audit_capacity == 0 {
            return Err(ConfigError::Validation(
                "driver.audit-capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn sample() -> Self {
        let mut sensitivity = SensitivityConfig::default();
        sensitivity
            .column_bounds
            .insert("age".into(), ValueBound::new(0.0, 120.0));
        sensitivity
            .column_bounds
            .insert("salary".into(), ValueBound::new(0.0, 500_000.0));
        sensitivity.table_contributions.insert("users".into(), 1.0);
        sensitivity.table_contributions.insert("orders".into(), 50.0);
        sensitivity.max_rows_per_partition = Some(100.0);

        let mut budget = BudgetConfig::default();
        budget.role_budgets.insert("admin".into(), 10.0);
        budget.role_budgets.insert("analyst".into(), 5.0);

        Self {
            policy: PolicyConfig::sample(),
            sensitivity,
            budget,
            deid: DeidConfig {
                encryption_key: Some("11".repeat(32)),
                fpe_key: Some("22".repeat(32)),
                date_shift_key: Some("33".repeat(32)),
                ..DeidConfig::default()
            },
            driver: DriverConfig {
                noise_seed: None,
                audit_capacity: default_audit_capacity(),
            },
        }
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<ShieldConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&contents, resolve_format(path, format))
}

/// Parses and validates configuration text. `Auto` is treated as TOML.
pub fn parse_config(contents: &str, format: ConfigFormat) -> Result<ShieldConfig, ConfigError> {
    let config: ShieldConfig = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| ConfigError::Parse {
                format: ConfigFormat::Toml,
                details: err.to_string(),
            })
        }
    }?;
    config.validate()?;
    Ok(config)
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => ConfigFormat::Toml,
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn sample_is_valid() {
        ShieldConfig::sample().validate().unwrap();
        ShieldConfig::default().validate().unwrap();
    }

    #[test]
    fn detects_missing_cipher_key() {
        let mut config = ShieldConfig::sample();
        config.deid.encryption_key = None;
        config.policy.column_rules[0].method = Some(DeidMethod::Encrypt);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("encryption-key"));
    }

    #[test]
    fn rejects_negative_budget() {
        let mut config = ShieldConfig::sample();
        config.budget.role_budgets.insert("guest".into(), -1.0);
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn parses_toml_config() {
        let contents = r#"
            [policy]
            default-epsilon = 0.5

            [[policy.column-rules]]
            pattern = "email"
            class = "sensitive"
            method = { type = "mask", style = "email" }

            [sensitivity.column-bounds]
            age = { lower = 0.0, upper = 120.0 }

            [budget]
            default-total = 2.0
            reset-frequency = "weekly"

            [budget.role-budgets]
            admin = 10.0
        "#;
        let config = parse_config(contents, ConfigFormat::Toml).unwrap();
        assert_eq!(config.policy.default_epsilon, 0.5);
        assert_eq!(config.budget.total_for_role("admin"), 10.0);
        assert_eq!(config.budget.total_for_role("viewer"), 2.0);
        assert_eq!(config.budget.reset_frequency, ResetFrequency::Weekly);
        assert_eq!(config.deid.hash_length, DEFAULT_HASH_LENGTH);
    }

    #[test]
    fn loads_yaml_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "policy:\n  default-epsilon: 0.25\nbudget:\n  default-total: 3.0\n"
        )
        .unwrap();
        let config = load_config(file.path(), ConfigFormat::Auto).unwrap();
        assert_eq!(config.policy.default_epsilon, 0.25);
        assert_eq!(config.budget.default_total, 3.0);
    }

    #[test]
    fn reports_io_errors() {
        let err = load_config(Path::new("/nonexistent/queryshield.toml"), ConfigFormat::Auto)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
