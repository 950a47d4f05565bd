use thiserror::Error;

pub type MechanismResult<T> = Result<T, MechanismError>;

/// Parameter and input failures raised by the primitives before any noise is
/// drawn or any value is rewritten.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum MechanismError {
    #[error("epsilon must be finite and > 0 (got {0})")]
    InvalidEpsilon(f64),
    #[error("delta must be within (0,1) (got {0})")]
    InvalidDelta(f64),
    #[error("sensitivity must be finite and > 0 (got {0})")]
    InvalidSensitivity(f64),
    #[error("exponential mechanism needs at least one candidate")]
    EmptyCandidates,
    #[error("utility scores must be finite")]
    NonFiniteUtility,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("cipher failure: {0}")]
    Cipher(&'static str),
}

pub(crate) fn check_epsilon(epsilon: f64) -> MechanismResult<()> {
    if epsilon.is_finite() && epsilon > 0.0 {
        Ok(())
    } else {
        Err(MechanismError::InvalidEpsilon(epsilon))
    }
}

pub(crate) fn check_delta(delta: f64) -> MechanismResult<()> {
    if delta > 0.0 && delta < 1.0 {
        Ok(())
    } else {
        Err(MechanismError::InvalidDelta(delta))
    }
}

pub(crate) fn check_sensitivity(sensitivity: f64) -> MechanismResult<()> {
    if sensitivity.is_finite() && sensitivity > 0.0 {
        Ok(())
    } else {
        Err(MechanismError::InvalidSensitivity(sensitivity))
    }
}
