use chrono::{DateTime, Utc};
use queryshield_mechanisms::MechanismError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{budget::BudgetError, config::ConfigError, executor::ExecutorError};

pub type ShieldResult<T> = Result<T, ShieldError>;

#[derive(Debug, Error)]
pub enum ShieldError {
    #[error("query could not be parsed: {0}")]
    Parse(String),
    #[error("unsupported construct: {0}")]
    UnsupportedConstruct(String),
    #[error("sensitivity is unbounded: {0}")]
    UnboundedSensitivity(String),
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error("invalid mechanism parameters: {0}")]
    InvalidMechanismParameters(#[from] MechanismError),
    #[error("policy rejected query: {0}")]
    PolicyRejected(String),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("audit sink failed: {0}")]
    Audit(String),
}

/// Machine-readable reason attached to every refused request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    ParseError,
    UnsupportedConstruct,
    UnboundedSensitivity,
    BudgetExhausted,
    UnknownPrincipal,
    PolicyRejected,
    InvalidMechanismParameters,
    ExecutorFailure,
    ConfigurationError,
    AuditFailure,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::ParseError => "parse_error",
            RejectionCode::UnsupportedConstruct => "unsupported_construct",
            RejectionCode::UnboundedSensitivity => "unbounded_sensitivity",
            RejectionCode::BudgetExhausted => "budget_exhausted",
            RejectionCode::UnknownPrincipal => "unknown_principal",
            RejectionCode::PolicyRejected => "policy_rejected",
            RejectionCode::InvalidMechanismParameters => "invalid_mechanism_parameters",
            RejectionCode::ExecutorFailure => "executor_failure",
            RejectionCode::ConfigurationError => "configuration_error",
            RejectionCode::AuditFailure => "audit_failure",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Rejection {
    pub code: RejectionCode,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_reset: Option<DateTime<Utc>>,
}

impl ShieldError {
    pub fn code(&self) -> RejectionCode {
        match self {
            ShieldError::Parse(_) => RejectionCode::ParseError,
            ShieldError::UnsupportedConstruct(_) => RejectionCode::UnsupportedConstruct,
            ShieldError::UnboundedSensitivity(_) => RejectionCode::UnboundedSensitivity,
            ShieldError::Budget(BudgetError::Exhausted { .. }) => RejectionCode::BudgetExhausted,
            ShieldError::Budget(BudgetError::UnknownPrincipal(_)) => {
                RejectionCode::UnknownPrincipal
            }
            ShieldError::Budget(BudgetError::InvalidCharge(_)) => {
                RejectionCode::InvalidMechanismParameters
            }
            ShieldError::InvalidMechanismParameters(_) => RejectionCode::InvalidMechanismParameters,
            ShieldError::PolicyRejected(_) => RejectionCode::PolicyRejected,
            ShieldError::Executor(_) => RejectionCode::ExecutorFailure,
            ShieldError::Config(_) => RejectionCode::ConfigurationError,
            ShieldError::Audit(_) => RejectionCode::AuditFailure,
        }
    }

    /// Fatal errors signal a broken deployment (bad parameters, failing
    /// collaborators) rather than a request the caller may simply not make.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code(),
            RejectionCode::InvalidMechanismParameters
                | RejectionCode::ExecutorFailure
                | RejectionCode::ConfigurationError
                | RejectionCode::AuditFailure
        )
    }

    pub fn rejection(&self) -> Rejection {
        let (remaining_budget, next_reset) = match self {
            ShieldError::Budget(BudgetError::Exhausted {
                remaining,
                next_reset,
                ..
            }) => (Some(*remaining), *next_reset),
            _ => (None, None),
        };
        Rejection {
            code: self.code(),
            reason: self.to_string(),
            remaining_budget,
            next_reset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_not_fatal_and_carries_remaining() {
        let err = ShieldError::from(BudgetError::Exhausted {
            principal: "alice".into(),
            requested: 0.5,
            remaining: 0.1,
            next_reset: None,
        });
        assert!(!err.is_fatal());
        let rejection = err.rejection();
        assert_eq!(rejection.code, RejectionCode::BudgetExhausted);
        assert_eq!(rejection.remaining_budget, Some(0.1));
    }

    #[test]
    fn mechanism_errors_are_fatal() {
        let err = ShieldError::from(MechanismError::InvalidEpsilon(0.0));
        assert!(err.is_fatal());
        assert_eq!(err.code().as_str(), "invalid_mechanism_parameters");
        assert!(!ShieldError::Parse("x".into()).is_fatal());
    }
}
