//! Adaptive Metropolis sampler with a mixture of single-component adaptive
//! (SCAM), full adaptive (AM) and differential evolution (DE) jumps. The
//! proposal covariance is learned from the running chain.
use crate::error::{GibbsError, Result};
use crate::utils::svd::symmetric_svd;
use nalgebra::{DMatrix, DVector};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_distr::StandardNormal;
use serde_derive::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Steps between refreshes of the proposal covariance
const COV_UPDATE: usize = 1000;

/// Every this many steps a state is kept for differential evolution
const HISTORY_THIN: usize = 10;

/// Maximum number of states kept for differential evolution
const HISTORY_SIZE: usize = 1000;

/// Differential evolution jumps start once this many states are kept
const DE_MIN_HISTORY: usize = 100;

/// Initial proposal variance of every parameter
const INITIAL_VARIANCE: f64 = 0.01;

/// Relative frequency of each jump type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JumpWeights {
    pub scam: f64,
    pub am: f64,
    pub de: f64,
}

impl Default for JumpWeights {
    fn default() -> Self {
        JumpWeights {
            scam: 30.0,
            am: 15.0,
            de: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Jump {
    Scam,
    Am,
    De,
}

#[derive(Debug, Clone)]
pub struct AdaptiveSampler {
    weights: JumpWeights,
    /// Parameters moved by jumps
    group: Vec<usize>,
    /// Covariance of all parameters
    cov: DMatrix<f64>,
    /// Eigenbasis and variances of the group's covariance
    u: DMatrix<f64>,
    s: DVector<f64>,
    // Running moments of the chain
    count: usize,
    mean: DVector<f64>,
    m2: DMatrix<f64>,
    history: VecDeque<DVector<f64>>,
    proposed: usize,
    accepted: usize,
}

impl AdaptiveSampler {
    pub fn new(ndim: usize, weights: JumpWeights) -> Result<AdaptiveSampler> {
        let cov = DMatrix::identity(ndim, ndim) * INITIAL_VARIANCE;
        let (u, s) = symmetric_svd(&cov)?;
        Ok(AdaptiveSampler {
            weights,
            group: (0..ndim).collect(),
            cov,
            u,
            s,
            count: 0,
            mean: DVector::zeros(ndim),
            m2: DMatrix::zeros(ndim, ndim),
            history: VecDeque::with_capacity(HISTORY_SIZE),
            proposed: 0,
            accepted: 0,
        })
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    pub fn group(&self) -> &[usize] {
        &self.group
    }

    pub fn acceptance_rate(&self) -> f64 {
        self.accepted as f64 / self.proposed.max(1) as f64
    }

    /// Runs `steps` adaptive steps from `x0`, learning the covariance as it
    /// goes. Returns the final state and its log posterior.
    pub fn run<R, F>(&mut self, x0: &DVector<f64>, steps: usize, mut target: F, rng: &mut R) -> Result<(DVector<f64>, f64)>
    where
        R: Rng + ?Sized,
        F: FnMut(&[f64]) -> Result<f64>,
    {
        let mut x = x0.clone();
        let mut lnpost = target(x.as_slice())?;

        for i in 0..steps {
            (x, lnpost) = self.step(&x, lnpost, &mut target, rng)?;
            self.record(&x, i);
            if (i + 1) % COV_UPDATE == 0 {
                self.update_covariance()?;
            }
        }

        log::debug!(
            "adaptive run of {} steps accepted {:.1}% of jumps",
            steps,
            100.0 * self.acceptance_rate()
        );
        Ok((x, lnpost))
    }

    /// One Metropolis step from `x`, whose log posterior is `lnpost`.
    pub fn step<R, F>(&mut self, x: &DVector<f64>, lnpost: f64, target: &mut F, rng: &mut R) -> Result<(DVector<f64>, f64)>
    where
        R: Rng + ?Sized,
        F: FnMut(&[f64]) -> Result<f64>,
    {
        let jump = self.choose_jump(rng);
        let q = match jump {
            Jump::Scam => self.scam_jump(x, rng),
            Jump::Am => self.am_jump(x, rng),
            Jump::De => self.de_jump(x, rng),
        };

        self.proposed += 1;
        let lnpost1 = target(q.as_slice())?;
        if lnpost1 - lnpost > rng.gen::<f64>().ln() {
            self.accepted += 1;
            Ok((q, lnpost1))
        } else {
            Ok((x.clone(), lnpost))
        }
    }

    /// Restricts future jumps to `indices`, keeping the learned covariance of
    /// those parameters.
    pub fn restrict(&mut self, indices: &[usize]) -> Result<()> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.cov.nrows()) {
            return Err(GibbsError::DimensionMismatch {
                expected: self.cov.nrows(),
                actual: bad + 1,
            });
        }
        self.group = indices.to_vec();
        self.refresh_eigenbasis()
    }

    fn record(&mut self, x: &DVector<f64>, step: usize) {
        // Welford update
        self.count += 1;
        let delta = x - &self.mean;
        self.mean += &delta / self.count as f64;
        let delta2 = x - &self.mean;
        self.m2 += &delta * delta2.transpose();

        if step % HISTORY_THIN == 0 {
            if self.history.len() == HISTORY_SIZE {
                self.history.pop_front();
            }
            self.history.push_back(x.clone());
        }
    }

    fn update_covariance(&mut self) -> Result<()> {
        if self.count < 2 {
            return Ok(());
        }
        let cov = &self.m2 / (self.count - 1) as f64;
        if cov.diagonal().iter().any(|&v| !(v > 0.0)) {
            log::warn!("chain has not moved in every parameter, keeping previous proposal covariance");
            return Ok(());
        }
        self.cov = cov;
        self.refresh_eigenbasis()
    }

    fn refresh_eigenbasis(&mut self) -> Result<()> {
        let group_cov = self.cov.select_rows(&self.group).select_columns(&self.group);
        (self.u, self.s) = symmetric_svd(&group_cov)?;
        Ok(())
    }

    fn choose_jump<R: Rng + ?Sized>(&self, rng: &mut R) -> Jump {
        let de = if self.history.len() >= DE_MIN_HISTORY {
            self.weights.de
        } else {
            0.0
        };
        match WeightedIndex::new([self.weights.scam, self.weights.am, de]) {
            Ok(index) => [Jump::Scam, Jump::Am, Jump::De][index.sample(rng)],
            Err(_) => Jump::Scam,
        }
    }

    /// Occasional very large and small steps
    fn jump_scale<R: Rng + ?Sized>(rng: &mut R) -> f64 {
        let p: f64 = rng.gen();
        if p > 0.97 {
            10.0
        } else if p > 0.9 {
            0.2
        } else {
            1.0
        }
    }

    /// Step along one eigenvector of the group covariance.
    fn scam_jump<R: Rng + ?Sized>(&self, x: &DVector<f64>, rng: &mut R) -> DVector<f64> {
        let mut q = x.clone();
        if self.group.is_empty() {
            return q;
        }
        let j = rng.gen_range(0..self.group.len());
        let cd = 2.4 / 2_f64.sqrt() * Self::jump_scale(rng);
        let step = rng.sample::<f64, _>(StandardNormal) * cd * self.s[j].sqrt();
        for (k, &i) in self.group.iter().enumerate() {
            q[i] += step * self.u[(k, j)];
        }
        q
    }

    /// Step along every eigenvector of the group covariance.
    fn am_jump<R: Rng + ?Sized>(&self, x: &DVector<f64>, rng: &mut R) -> DVector<f64> {
        let mut q = x.clone();
        let ndim = self.group.len();
        let cd = 2.4 / (2.0 * ndim as f64).sqrt() * Self::jump_scale(rng);
        let steps = DVector::from_iterator(
            ndim,
            self.s.iter().map(|s| rng.sample::<f64, _>(StandardNormal) * cd * s.sqrt()),
        );
        let delta = &self.u * steps;
        for (k, &i) in self.group.iter().enumerate() {
            q[i] += delta[k];
        }
        q
    }

    /// Step along the difference of two past states.
    fn de_jump<R: Rng + ?Sized>(&self, x: &DVector<f64>, rng: &mut R) -> DVector<f64> {
        let mut q = x.clone();
        let n = self.history.len();
        if n < 2 {
            return q;
        }
        let mm = rng.gen_range(0..n);
        let mut nn = rng.gen_range(0..n);
        while nn == mm {
            nn = rng.gen_range(0..n);
        }

        let scale = if rng.gen::<f64>() > 0.5 {
            1.0
        } else {
            rng.gen::<f64>() * 2.4 / (2.0 * self.group.len() as f64).sqrt()
        };
        for &i in &self.group {
            q[i] += scale * (self.history[mm][i] - self.history[nn][i]);
        }
        q
    }
}

#[cfg(test)]
fn seeded(seed: u64) -> rand_xoshiro::Xoshiro256PlusPlus {
    use rand::SeedableRng;
    rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(seed)
}

#[test]
fn test_learns_correlated_gaussian_covariance() {
    let mut rng = seeded(31);
    // Correlated Gaussian with unit variances and correlation 0.8
    let precision = DMatrix::from_row_slice(2, 2, &[1.0, -0.8, -0.8, 1.0]) / (1.0 - 0.64);
    let target = |x: &[f64]| -> Result<f64> {
        let v = DVector::from_column_slice(x);
        Ok(-0.5 * v.dot(&(&precision * &v)))
    };

    let mut sampler = AdaptiveSampler::new(2, JumpWeights::default()).unwrap();
    let (x, lnpost) = sampler.run(&DVector::zeros(2), 20_000, target, &mut rng).unwrap();

    assert!(lnpost.is_finite());
    assert!(x.iter().all(|v| v.is_finite()));
    let cov = sampler.cov();
    approx::assert_abs_diff_eq!(cov[(0, 0)], 1.0, epsilon = 0.3);
    approx::assert_abs_diff_eq!(cov[(1, 1)], 1.0, epsilon = 0.3);
    approx::assert_abs_diff_eq!(cov[(0, 1)], 0.8, epsilon = 0.3);
    assert!(sampler.acceptance_rate() > 0.1);
}

#[test]
fn test_restricted_jumps_leave_other_parameters() {
    let mut rng = seeded(32);
    let target = |x: &[f64]| -> Result<f64> { Ok(-0.5 * x.iter().map(|v| v * v).sum::<f64>()) };
    let mut sampler = AdaptiveSampler::new(4, JumpWeights::default()).unwrap();
    let (mut x, mut lnpost) = sampler.run(&DVector::zeros(4), 3000, target, &mut rng).unwrap();

    sampler.restrict(&[1, 2]).unwrap();
    assert_eq!(sampler.group(), &[1, 2]);
    let frozen = (x[0], x[3]);
    let mut target = target;
    for _ in 0..500 {
        (x, lnpost) = sampler.step(&x, lnpost, &mut target, &mut rng).unwrap();
    }
    assert_eq!((x[0], x[3]), frozen);
    assert!(lnpost.is_finite());
}

#[test]
fn test_restrict_rejects_out_of_range() {
    let mut sampler = AdaptiveSampler::new(3, JumpWeights::default()).unwrap();
    assert!(sampler.restrict(&[0, 5]).is_err());
}
