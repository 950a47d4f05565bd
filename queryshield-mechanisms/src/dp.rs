use rand::{rngs::OsRng, Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{check_delta, check_epsilon, check_sensitivity, MechanismError, MechanismResult};

/// Closed set of noise mechanisms. Dispatch is a `match`, never a lookup table.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DpMechanism {
    #[default]
    Laplace,
    Gaussian,
    Exponential,
    SparseVector,
}

impl DpMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            DpMechanism::Laplace => "laplace",
            DpMechanism::Gaussian => "gaussian",
            DpMechanism::Exponential => "exponential",
            DpMechanism::SparseVector => "sparse-vector",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct NoiseParams {
    pub epsilon: f64,
    pub delta: Option<f64>,
    pub sensitivity: f64,
}

impl NoiseParams {
    pub fn new(epsilon: f64, sensitivity: f64) -> Self {
        Self {
            epsilon,
            delta: None,
            sensitivity,
        }
    }

    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = Some(delta);
        self
    }

    /// Validates the parameters for `mechanism`. Gaussian noise additionally
    /// requires a delta in (0,1).
    pub fn validate(&self, mechanism: DpMechanism) -> MechanismResult<()> {
        check_epsilon(self.epsilon)?;
        check_sensitivity(self.sensitivity)?;
        match (mechanism, self.delta) {
            (DpMechanism::Gaussian, None) => Err(MechanismError::InvalidDelta(0.0)),
            (_, Some(delta)) => check_delta(delta),
            _ => Ok(()),
        }
    }

    /// Laplace scale `b = Δ/ε`.
    pub fn laplace_scale(&self) -> f64 {
        self.sensitivity / self.epsilon
    }

    /// Gaussian standard deviation `σ = Δ·√(2·ln(1.25/δ))/ε`.
    pub fn gaussian_sigma(&self) -> MechanismResult<f64> {
        self.validate(DpMechanism::Gaussian)?;
        let delta = self.delta.unwrap_or_default();
        Ok(self.sensitivity * (2.0 * (1.25 / delta).ln()).sqrt() / self.epsilon)
    }
}

/// Draws one sample from Lap(0, scale) by inverting the CDF.
pub fn laplace_noise<R: Rng + ?Sized>(scale: f64, rng: &mut R) -> f64 {
    loop {
        let u: f64 = rng.gen::<f64>() - 0.5;
        let magnitude = 1.0 - 2.0 * u.abs();
        if magnitude <= 0.0 {
            continue;
        }
        let sign = if u >= 0.0 { 1.0 } else { -1.0 };
        return -scale * sign * magnitude.ln();
    }
}

/// `value + Lap(0, Δ/ε)`.
pub fn laplace<R: Rng + ?Sized>(
    value: f64,
    params: &NoiseParams,
    rng: &mut R,
) -> MechanismResult<f64> {
    params.validate(DpMechanism::Laplace)?;
    Ok(value + laplace_noise(params.laplace_scale(), rng))
}

/// `value + N(0, σ²)` with the classic analytic calibration.
pub fn gaussian<R: Rng + ?Sized>(
    value: f64,
    params: &NoiseParams,
    rng: &mut R,
) -> MechanismResult<f64> {
    let sigma = params.gaussian_sigma()?;
    let normal = Normal::new(0.0, sigma)
        .map_err(|err| MechanismError::InvalidParameter(format!("gaussian sigma {sigma}: {err}")))?;
    Ok(value + normal.sample(rng))
}

/// An additive noise distribution whose parameters were checked up front, so
/// drawing from it cannot fail.
#[derive(Clone, Copy, Debug)]
pub enum CalibratedNoise {
    Laplace { scale: f64 },
    Gaussian { sigma: f64, normal: Normal<f64> },
}

impl CalibratedNoise {
    pub fn calibrate(mechanism: DpMechanism, params: &NoiseParams) -> MechanismResult<Self> {
        params.validate(mechanism)?;
        match mechanism {
            DpMechanism::Laplace => Ok(CalibratedNoise::Laplace {
                scale: params.laplace_scale(),
            }),
            DpMechanism::Gaussian => {
                let sigma = params.gaussian_sigma()?;
                let normal = Normal::new(0.0, sigma).map_err(|err| {
                    MechanismError::InvalidParameter(format!("gaussian sigma {sigma}: {err}"))
                })?;
                Ok(CalibratedNoise::Gaussian { sigma, normal })
            }
            DpMechanism::Exponential | DpMechanism::SparseVector => {
                Err(MechanismError::InvalidParameter(format!(
                    "{} is not an additive mechanism",
                    mechanism.name()
                )))
            }
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            CalibratedNoise::Laplace { scale } => laplace_noise(*scale, rng),
            CalibratedNoise::Gaussian { normal, .. } => normal.sample(rng),
        }
    }

    /// Laplace scale or Gaussian standard deviation.
    pub fn scale(&self) -> f64 {
        match self {
            CalibratedNoise::Laplace { scale } => *scale,
            CalibratedNoise::Gaussian { sigma, .. } => *sigma,
        }
    }
}

/// Selects a candidate index with probability proportional to
/// `exp(ε·u/(2Δ))`. Utilities are shifted by their maximum before
/// exponentiation so large scores cannot overflow.
pub fn exponential<R: Rng + ?Sized>(
    utilities: &[f64],
    epsilon: f64,
    sensitivity: f64,
    rng: &mut R,
) -> MechanismResult<usize> {
    check_epsilon(epsilon)?;
    check_sensitivity(sensitivity)?;
    if utilities.is_empty() {
        return Err(MechanismError::EmptyCandidates);
    }
    if utilities.iter().any(|u| !u.is_finite()) {
        return Err(MechanismError::NonFiniteUtility);
    }
    let beta = epsilon / (2.0 * sensitivity);
    let max = utilities.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = utilities
        .iter()
        .map(|u| (beta * (u - max)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    let mut pick = rng.gen::<f64>() * total;
    for (idx, weight) in weights.iter().enumerate() {
        if pick < *weight {
            return Ok(idx);
        }
        pick -= weight;
    }
    Ok(weights.len() - 1)
}

/// AboveThreshold with up to `max_positives` positive answers.
///
/// With `σ = 2cΔ/ε` the threshold is perturbed with `Lap(σ)` and redrawn after
/// every positive, while each query answer is perturbed with `Lap(2σ)`. The
/// whole run costs `ε` regardless of how many queries are evaluated; the run
/// halts once `c` positives have been reported.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SparseVector {
    pub threshold: f64,
    pub epsilon: f64,
    pub sensitivity: f64,
    pub max_positives: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SparseVectorOutcome {
    /// One flag per evaluated query; queries after the halt are not evaluated.
    pub flags: Vec<bool>,
    pub positives: usize,
    pub halted: bool,
    pub epsilon_spent: f64,
}

impl SparseVector {
    pub fn new(
        threshold: f64,
        epsilon: f64,
        sensitivity: f64,
        max_positives: usize,
    ) -> MechanismResult<Self> {
        check_epsilon(epsilon)?;
        check_sensitivity(sensitivity)?;
        if !threshold.is_finite() {
            return Err(MechanismError::InvalidParameter(
                "sparse vector threshold must be finite".into(),
            ));
        }
        if max_positives == 0 {
            return Err(MechanismError::InvalidParameter(
                "sparse vector needs max_positives >= 1".into(),
            ));
        }
        Ok(Self {
            threshold,
            epsilon,
            sensitivity,
            max_positives,
        })
    }

    fn sigma(&self) -> f64 {
        2.0 * self.max_positives as f64 * self.sensitivity / self.epsilon
    }

    pub fn run<R: Rng + ?Sized>(&self, answers: &[f64], rng: &mut R) -> SparseVectorOutcome {
        let sigma = self.sigma();
        let mut noisy_threshold = self.threshold + laplace_noise(sigma, rng);
        let mut outcome = SparseVectorOutcome {
            epsilon_spent: self.epsilon,
            ..SparseVectorOutcome::default()
        };
        for answer in answers {
            let above = answer + laplace_noise(2.0 * sigma, rng) >= noisy_threshold;
            outcome.flags.push(above);
            if above {
                outcome.positives += 1;
                if outcome.positives >= self.max_positives {
                    outcome.halted = true;
                    break;
                }
                noisy_threshold = self.threshold + laplace_noise(sigma, rng);
            }
        }
        outcome
    }
}

/// Per-request randomness. Each request owns its generator so concurrent
/// requests never share RNG state.
pub struct NoiseEngine {
    rng: ChaCha20Rng,
}

impl NoiseEngine {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: ChaCha20Rng::from_seed(seed),
        }
    }

    pub fn from_entropy() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Derives a request generator from a base seed and a request counter.
    pub fn derive(base: &[u8; 32], counter: u64) -> Self {
        let mut hasher = blake3::Hasher::new_keyed(base);
        hasher.update(b"queryshield/noise");
        hasher.update(&counter.to_le_bytes());
        Self::from_seed(*hasher.finalize().as_bytes())
    }

    pub fn rng(&mut self) -> &mut ChaCha20Rng {
        &mut self.rng
    }

    /// Perturbs every value independently with an additive mechanism.
    pub fn perturb(
        &mut self,
        mechanism: DpMechanism,
        values: &[f64],
        params: &NoiseParams,
    ) -> MechanismResult<Vec<f64>> {
        params.validate(mechanism)?;
        match mechanism {
            DpMechanism::Laplace => values
                .iter()
                .map(|value| laplace(*value, params, &mut self.rng))
                .collect(),
            DpMechanism::Gaussian => values
                .iter()
                .map(|value| gaussian(*value, params, &mut self.rng))
                .collect(),
            DpMechanism::Exponential | DpMechanism::SparseVector => {
                Err(MechanismError::InvalidParameter(format!(
                    "{} is not an additive mechanism",
                    mechanism.name()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_epsilon() {
        let mut engine = NoiseEngine::from_seed([1u8; 32]);
        let params = NoiseParams::new(0.0, 1.0);
        assert_eq!(
            laplace(10.0, &params, engine.rng()),
            Err(MechanismError::InvalidEpsilon(0.0))
        );
        let params = NoiseParams::new(f64::INFINITY, 1.0);
        assert!(laplace(10.0, &params, engine.rng()).is_err());
    }

    #[test]
    fn gaussian_requires_delta_in_open_interval() {
        let params = NoiseParams::new(1.0, 1.0);
        assert!(params.validate(DpMechanism::Gaussian).is_err());
        assert!(params.with_delta(1.0).validate(DpMechanism::Gaussian).is_err());
        assert!(params.with_delta(1e-5).validate(DpMechanism::Gaussian).is_ok());
    }

    #[test]
    fn gaussian_sigma_matches_formula() {
        let params = NoiseParams::new(0.5, 2.0).with_delta(1e-5);
        let expected = 2.0 * (2.0 * (1.25f64 / 1e-5).ln()).sqrt() / 0.5;
        let sigma = params.gaussian_sigma().unwrap();
        assert!((sigma - expected).abs() < 1e-12);
    }

    #[test]
    fn same_seed_same_noise() {
        let params = NoiseParams::new(1.0, 1.0);
        let mut a = NoiseEngine::derive(&[7u8; 32], 3);
        let mut b = NoiseEngine::derive(&[7u8; 32], 3);
        let mut c = NoiseEngine::derive(&[7u8; 32], 4);
        let va = a.perturb(DpMechanism::Laplace, &[100.0], &params).unwrap();
        let vb = b.perturb(DpMechanism::Laplace, &[100.0], &params).unwrap();
        let vc = c.perturb(DpMechanism::Laplace, &[100.0], &params).unwrap();
        assert_eq!(va, vb);
        assert_ne!(va, vc);
    }

    #[test]
    fn exponential_prefers_high_utility() {
        let mut engine = NoiseEngine::from_seed([9u8; 32]);
        let utilities = [0.0, 1.0, 50.0, 2.0];
        let mut hits = 0;
        for _ in 0..200 {
            if exponential(&utilities, 2.0, 1.0, engine.rng()).unwrap() == 2 {
                hits += 1;
            }
        }
        assert!(hits > 190, "hits = {hits}");
    }

    #[test]
    fn exponential_rejects_empty_and_non_finite() {
        let mut engine = NoiseEngine::from_seed([9u8; 32]);
        assert_eq!(
            exponential(&[], 1.0, 1.0, engine.rng()),
            Err(MechanismError::EmptyCandidates)
        );
        assert_eq!(
            exponential(&[1.0, f64::NAN], 1.0, 1.0, engine.rng()),
            Err(MechanismError::NonFiniteUtility)
        );
    }

    #[test]
    fn sparse_vector_halts_after_max_positives() {
        let svt = SparseVector::new(10.0, 50.0, 1.0, 2).unwrap();
        let mut engine = NoiseEngine::from_seed([4u8; 32]);
        let answers = [0.0, 1_000.0, 0.0, 1_000.0, 1_000.0, 1_000.0];
        let outcome = svt.run(&answers, engine.rng());
        assert!(outcome.halted);
        assert_eq!(outcome.positives, 2);
        assert_eq!(outcome.flags, vec![false, true, false, true]);
        assert_eq!(outcome.epsilon_spent, 50.0);
    }

    #[test]
    fn sparse_vector_cost_is_independent_of_length() {
        let svt = SparseVector::new(0.0, 1.0, 1.0, 1).unwrap();
        let mut engine = NoiseEngine::from_seed([5u8; 32]);
        let short = svt.run(&[-1e9; 3], engine.rng());
        let long = svt.run(&[-1e9; 300], engine.rng());
        assert_eq!(short.epsilon_spent, long.epsilon_spent);
        assert_eq!(long.flags.len(), 300);
        assert!(SparseVector::new(0.0, 1.0, 1.0, 0).is_err());
    }

    #[test]
    fn calibrated_noise_matches_mechanism_scale() {
        let params = NoiseParams::new(0.5, 2.0);
        let noise = CalibratedNoise::calibrate(DpMechanism::Laplace, &params).unwrap();
        assert_eq!(noise.scale(), 4.0);
        assert!(CalibratedNoise::calibrate(DpMechanism::Gaussian, &params).is_err());
        let gaussian =
            CalibratedNoise::calibrate(DpMechanism::Gaussian, &params.with_delta(1e-5)).unwrap();
        assert!(gaussian.scale() > 0.0);
        assert!(CalibratedNoise::calibrate(DpMechanism::Exponential, &params).is_err());
        let mut engine = NoiseEngine::from_seed([3u8; 32]);
        assert!(noise.sample(engine.rng()).is_finite());
    }

    #[test]
    fn non_additive_mechanisms_refuse_perturb() {
        let mut engine = NoiseEngine::from_seed([2u8; 32]);
        let params = NoiseParams::new(1.0, 1.0);
        assert!(engine
            .perturb(DpMechanism::Exponential, &[1.0], &params)
            .is_err());
    }
}
