use chrono::{Duration, NaiveDate};

use crate::error::{MechanismError, MechanismResult};

/// Shifts dates by a per-individual offset in `[-max_days, max_days]`. The
/// offset is a keyed hash of the identifier, so every date belonging to the
/// same individual moves by the same amount and intervals are preserved.
#[derive(Clone)]
pub struct DateShifter {
    key: [u8; 32],
    max_days: i64,
}

impl DateShifter {
    pub fn new(key: [u8; 32], max_days: i64) -> MechanismResult<Self> {
        if max_days <= 0 {
            return Err(MechanismError::InvalidParameter(format!(
                "date shift window must be > 0 days (got {max_days})"
            )));
        }
        Ok(Self {
            key: blake3::derive_key("queryshield date shift v1", &key),
            max_days,
        })
    }

    pub fn offset_days(&self, identifier: &str) -> i64 {
        let digest = blake3::keyed_hash(&self.key, identifier.as_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest.as_bytes()[..8]);
        let span = (2 * self.max_days + 1) as u64;
        (u64::from_le_bytes(word) % span) as i64 - self.max_days
    }

    pub fn shift(&self, date: NaiveDate, identifier: &str) -> MechanismResult<NaiveDate> {
        date.checked_add_signed(Duration::days(self.offset_days(identifier)))
            .ok_or_else(|| {
                MechanismError::InvalidParameter(format!("date {date} shifted out of range"))
            })
    }

    /// Shifts an ISO `YYYY-MM-DD` string, keeping any time suffix intact.
    pub fn shift_text(&self, text: &str, identifier: &str) -> MechanismResult<String> {
        let date = crate::deid::generalize::parse_date(text)
            .ok_or_else(|| MechanismError::InvalidParameter(format!("not an ISO date: {text}")))?;
        let shifted = self.shift(date, identifier)?;
        let suffix = text.get(10..).unwrap_or_default();
        Ok(format!("{}{}", shifted.format("%Y-%m-%d"), suffix))
    }
}
