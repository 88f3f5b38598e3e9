use rand::distributions::Distribution;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use statrs::distribution::{Continuous, Uniform};
use std::f64::consts::LN_10;

/// Prior distribution on a single parameter component.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum Prior {
    /// Flat between `pmin` and `pmax`
    Uniform { pmin: f64, pmax: f64 },
    /// Density proportional to `10^x` between `pmin` and `pmax`, i.e. flat in `10^x`
    LinearExp { pmin: f64, pmax: f64 },
}

impl Prior {
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            Prior::Uniform { pmin, pmax } | Prior::LinearExp { pmin, pmax } => (pmin, pmax),
        }
    }

    /// Log prior density. Returns `-inf` outside the support.
    pub fn logpdf(&self, x: f64) -> f64 {
        let (pmin, pmax) = self.bounds();
        if !(pmin..=pmax).contains(&x) {
            return f64::NEG_INFINITY;
        }

        match self {
            Prior::Uniform { .. } => Uniform::new(pmin, pmax)
                .map(|u| u.ln_pdf(x))
                .unwrap_or(f64::NEG_INFINITY),
            Prior::LinearExp { .. } => {
                LN_10.ln() + x * LN_10 - (10_f64.powf(pmax) - 10_f64.powf(pmin)).ln()
            }
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let (pmin, pmax) = self.bounds();
        match self {
            Prior::Uniform { .. } => match Uniform::new(pmin, pmax) {
                Ok(u) => u.sample(rng),
                Err(_) => pmin,
            },
            Prior::LinearExp { .. } => {
                let u: f64 = rng.gen();
                (10_f64.powf(pmin) + u * (10_f64.powf(pmax) - 10_f64.powf(pmin))).log10()
            }
        }
    }
}

/// What a parameter controls. Used by the sampler to split the parameter
/// vector into Gibbs blocks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    Efac,
    Equad,
    Ecorr,
    RedAmplitude,
    RedIndex,
    Rho,
}

impl ParameterKind {
    pub fn is_white(&self) -> bool {
        matches!(self, ParameterKind::Efac | ParameterKind::Equad)
    }

    pub fn is_red(&self) -> bool {
        matches!(self, ParameterKind::RedAmplitude | ParameterKind::RedIndex)
    }
}

/// A named model parameter. Vector parameters (e.g. a free spectrum) have
/// `size = Some(n)` and occupy `n` consecutive slots of the parameter vector,
/// all sharing one prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub prior: Prior,
    pub size: Option<usize>,
    pub kind: ParameterKind,
}

impl Parameter {
    pub fn new(name: impl Into<String>, prior: Prior, kind: ParameterKind) -> Self {
        Parameter {
            name: name.into(),
            prior,
            size: None,
            kind,
        }
    }

    pub fn vector(name: impl Into<String>, prior: Prior, kind: ParameterKind, size: usize) -> Self {
        Parameter {
            name: name.into(),
            prior,
            size: Some(size),
            kind,
        }
    }

    /// Number of slots this parameter occupies in the parameter vector.
    pub fn dim(&self) -> usize {
        self.size.unwrap_or(1)
    }

    /// Names of the individual slots, `name_i` for vector parameters.
    pub fn component_names(&self) -> Vec<String> {
        match self.size {
            Some(size) => (0..size).map(|i| format!("{}_{}", self.name, i)).collect(),
            None => vec![self.name.clone()],
        }
    }

    /// Draws one value per slot from the prior.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        (0..self.dim()).map(|_| self.prior.sample(rng)).collect()
    }

    pub fn logpdf(&self, values: &[f64]) -> f64 {
        values.iter().map(|&x| self.prior.logpdf(x)).sum()
    }
}

#[test]
fn test_uniform_logpdf() {
    let prior = Prior::Uniform { pmin: 0.0, pmax: 4.0 };
    assert!((prior.logpdf(1.0) - (0.25_f64).ln()).abs() < 1e-12);
    assert_eq!(prior.logpdf(4.5), f64::NEG_INFINITY);
}

#[test]
fn test_linear_exp_normalized() {
    // Integrate the density numerically over its support
    let prior = Prior::LinearExp { pmin: -2.0, pmax: 1.0 };
    let n = 30_000;
    let dx = 3.0 / n as f64;
    let integral: f64 = (0..n)
        .map(|i| prior.logpdf(-2.0 + (i as f64 + 0.5) * dx).exp() * dx)
        .sum();
    assert!((integral - 1.0).abs() < 1e-4);
}

#[test]
fn test_samples_within_bounds() {
    use rand::SeedableRng;
    let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(7);
    let param = Parameter::vector(
        "gw_log10_rho",
        Prior::LinearExp { pmin: -9.0, pmax: -4.0 },
        ParameterKind::Rho,
        25,
    );

    let values = param.sample(&mut rng);
    assert_eq!(values.len(), 25);
    assert!(values.iter().all(|x| (-9.0..=-4.0).contains(x)));
    assert!(param.logpdf(&values).is_finite());
    assert_eq!(param.component_names()[3], "gw_log10_rho_3");
}
