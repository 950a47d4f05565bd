//! De-identification primitives. Everything here is deterministic for a given
//! key or salt so the same identifier maps to the same output within a run.

pub mod anonymity;
pub mod cipher;
pub mod date_shift;
pub mod generalize;
pub mod hashing;
pub mod masking;

use std::collections::BTreeMap;

use serde_json::Value;

/// A result row keyed by lower-cased column name.
pub type Row = BTreeMap<String, Value>;

/// Renders a cell as text for the string-oriented transforms.
pub fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        other => Some(other.to_string()),
    }
}

pub use anonymity::{
    anonymize, AnonymizedTable, AnonymityParams, EquivalenceClass, QuasiIdentifier,
};
pub use cipher::{key_from_hex, DeterministicCipher, FormatPreservingCipher};
pub use date_shift::DateShifter;
pub use generalize::{DateGranularity, Hierarchy};
pub use hashing::{hash_value, DEFAULT_HASH_LENGTH};
pub use masking::{mask, MaskStyle};
