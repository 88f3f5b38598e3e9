//! Single-component Metropolis updates used for the white noise, ECORR and
//! free spectrum blocks.
use crate::constants::{JUMP_PROBS, JUMP_SIGMA_PER_PARAM, JUMP_SIZES};
use crate::error::Result;
use crate::utils::acor::acor;
use nalgebra::{DMatrix, DVector};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_distr::StandardNormal;

lazy_static! {
    static ref JUMP_SCALE: WeightedIndex<f64> =
        WeightedIndex::new(JUMP_PROBS).expect("jump probabilities are positive");
}

/// Perturbs one randomly chosen parameter among `indices` by a Gaussian step
/// of width `0.05 n` times a randomly chosen scale.
pub fn single_component_jump<R: Rng + ?Sized>(x: &mut DVector<f64>, indices: &[usize], rng: &mut R) {
    if indices.is_empty() {
        return;
    }
    let sigma = JUMP_SIGMA_PER_PARAM * indices.len() as f64;
    let scale = JUMP_SIZES[JUMP_SCALE.sample(rng)];
    let par = indices[rng.gen_range(0..indices.len())];
    x[par] += rng.sample::<f64, _>(StandardNormal) * sigma * scale;
}

/// Outcome of a run of Metropolis steps.
#[derive(Debug, Clone)]
pub struct MhRun {
    pub x: DVector<f64>,
    pub lnpost: f64,
    pub accepted: usize,
    /// Visited values of the updated parameters, one row per step
    pub samples: Option<DMatrix<f64>>,
}

/// Runs `steps` single-component Metropolis steps on the parameters at
/// `indices`, targeting the log posterior `target`.
pub fn single_component_mh<R, F>(
    x0: &DVector<f64>,
    indices: &[usize],
    steps: usize,
    mut target: F,
    rng: &mut R,
    record: bool,
) -> Result<MhRun>
where
    R: Rng + ?Sized,
    F: FnMut(&[f64]) -> Result<f64>,
{
    let mut x = x0.clone();
    let mut lnpost0 = target(x.as_slice())?;
    let mut accepted = 0;
    let mut samples = record.then(|| DMatrix::zeros(steps, indices.len()));

    for step in 0..steps {
        let mut q = x.clone();
        single_component_jump(&mut q, indices, rng);

        let lnpost1 = target(q.as_slice())?;
        if lnpost1 - lnpost0 > rng.gen::<f64>().ln() {
            x = q;
            lnpost0 = lnpost1;
            accepted += 1;
        }

        if let Some(samples) = samples.as_mut() {
            for (j, &i) in indices.iter().enumerate() {
                samples[(step, j)] = x[i];
            }
        }
    }

    Ok(MhRun {
        x,
        lnpost: lnpost0,
        accepted,
        samples,
    })
}

/// Covariance of the rows of `samples`.
pub fn sample_covariance(samples: &DMatrix<f64>) -> DMatrix<f64> {
    let n = samples.nrows();
    let mut centered = samples.clone();
    for mut column in centered.column_iter_mut() {
        let mean = column.mean();
        column.add_scalar_mut(-mean);
    }
    centered.transpose() * &centered / (n.max(2) - 1) as f64
}

/// What a short tuning chain learned about a block.
#[derive(Debug, Clone)]
pub struct MhTuning {
    pub cov: DMatrix<f64>,
    /// Steps per Gibbs iteration: the longest autocorrelation time among the
    /// block's parameters
    pub aclength: usize,
}

impl MhTuning {
    /// Tunes from the recorded samples of a short chain, dropping the first
    /// `burn` rows.
    pub fn from_samples(samples: &DMatrix<f64>, burn: usize) -> MhTuning {
        let burn = if samples.nrows() > burn { burn } else { 0 };
        let kept = samples.rows(burn, samples.nrows() - burn).into_owned();

        let aclength = kept
            .column_iter()
            .map(|column| {
                let series: Vec<f64> = column.iter().copied().collect();
                match acor(&series) {
                    Some(result) if result.tau.is_finite() => result.tau as usize,
                    _ => {
                        log::warn!("could not estimate autocorrelation from {} samples", series.len());
                        1
                    }
                }
            })
            .max()
            .unwrap_or(1)
            .max(1);

        MhTuning {
            cov: sample_covariance(&kept),
            aclength,
        }
    }
}

#[cfg(test)]
fn seeded(seed: u64) -> rand_xoshiro::Xoshiro256PlusPlus {
    use rand::SeedableRng;
    rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(seed)
}

#[test]
fn test_jump_touches_one_listed_parameter() {
    let mut rng = seeded(21);
    for _ in 0..100 {
        let mut x = DVector::zeros(5);
        single_component_jump(&mut x, &[1, 3], &mut rng);
        let moved: Vec<usize> = (0..5).filter(|&i| x[i] != 0.0).collect();
        assert_eq!(moved.len(), 1);
        assert!(moved[0] == 1 || moved[0] == 3);
    }
}

#[test]
fn test_mh_samples_gaussian_target() {
    let mut rng = seeded(22);
    let target = |x: &[f64]| -> Result<f64> { Ok(-0.5 * (x[0] - 2.0).powi(2) / 0.25) };
    let run = single_component_mh(&DVector::zeros(2), &[0], 100_000, target, &mut rng, true).unwrap();

    let samples = run.samples.unwrap();
    let kept = samples.rows(1000, 99_000);
    let mean = kept.column(0).mean();
    let var = kept.column(0).variance();
    approx::assert_abs_diff_eq!(mean, 2.0, epsilon = 0.05);
    approx::assert_abs_diff_eq!(var, 0.25, epsilon = 0.05);
    assert!(run.accepted > 0);
    // Unlisted parameters never move
    assert_eq!(run.x[1], 0.0);
}

#[test]
fn test_mh_never_accepts_outside_support() {
    let mut rng = seeded(23);
    let target = |x: &[f64]| -> Result<f64> {
        Ok(if (0.0..=1.0).contains(&x[0]) {
            0.0
        } else {
            f64::NEG_INFINITY
        })
    };
    let run = single_component_mh(&DVector::from_element(1, 0.5), &[0], 2000, target, &mut rng, true).unwrap();
    assert!(run.samples.unwrap().iter().all(|&v| (0.0..=1.0).contains(&v)));
}

#[test]
fn test_sample_covariance() {
    let samples = DMatrix::from_row_slice(4, 2, &[1.0, 2.0, 2.0, 4.0, 3.0, 6.0, 4.0, 8.0]);
    let cov = sample_covariance(&samples);
    approx::assert_relative_eq!(cov[(0, 0)], 5.0 / 3.0, epsilon = 1e-12);
    approx::assert_relative_eq!(cov[(0, 1)], 10.0 / 3.0, epsilon = 1e-12);
    approx::assert_relative_eq!(cov[(1, 1)], 20.0 / 3.0, epsilon = 1e-12);
}

#[test]
fn test_tuning_from_uncorrelated_samples() {
    let mut rng = seeded(24);
    let samples = DMatrix::from_fn(1000, 2, |_, _| rng.sample::<f64, _>(StandardNormal));
    let tuning = MhTuning::from_samples(&samples, 100);
    assert!(tuning.aclength >= 1 && tuning.aclength <= 3);
    assert_eq!(tuning.cov.shape(), (2, 2));
}
