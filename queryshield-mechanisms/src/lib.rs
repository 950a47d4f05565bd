//! QueryShield mechanism library: the stateless primitives behind every
//! protected query. Differential-privacy noise (Laplace, Gaussian,
//! Exponential, Sparse Vector) lives in [`dp`]; value rewriting and grouping
//! (masking, hashing, encryption, generalization, date shifting, k-anonymity,
//! l-diversity) lives in [`deid`]. Nothing here holds state between calls.

pub mod deid;
pub mod dp;
pub mod error;

pub use deid::{
    anonymize, cell_text, hash_value, key_from_hex, mask, AnonymityParams, AnonymizedTable,
    DateGranularity, DateShifter, DeterministicCipher, EquivalenceClass, FormatPreservingCipher,
    Hierarchy, MaskStyle, QuasiIdentifier, Row, DEFAULT_HASH_LENGTH,
};
pub use dp::{
    exponential, gaussian, laplace, laplace_noise, CalibratedNoise, DpMechanism, NoiseEngine,
    NoiseParams, SparseVector, SparseVectorOutcome,
};
pub use error::{MechanismError, MechanismResult};
