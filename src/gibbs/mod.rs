/// Blocked Gibbs sampler for a single pulsar's noise model, after
/// van Haasteren & Vallisneri (2014), "New advances in the Gaussian-process
/// approach to pulsar-timing data analysis", PRD 90, 104012.
///
/// The Gaussian process coefficients `b` are kept explicitly. Each iteration
/// updates the white noise, ECORR, red noise and free spectrum
/// hyperparameters conditioned on `b`, then redraws `b` conditioned on the
/// hyperparameters.
pub mod adaptive;
pub mod conditional;
pub mod likelihood;
pub mod metropolis;

use crate::constants::{
    CONDITIONAL_GRID_POINTS, RED_ADAPT_ITERS, RED_STEPS_PER_ITER, RHO_MH_STEPS, SAVE_EVERY, SHORT_CHAIN_BURN,
    WHITE_ADAPT_ITERS,
};
use crate::error::{GibbsError, Result};
use crate::model::parameter::{Parameter, ParameterKind, Prior};
use crate::model::signals::SignalKind;
use crate::model::{ParamMap, PulsarModel};
use crate::utils::io::{ChainDir, BASIS_NAMES_FILE, PARAM_NAMES_FILE};
use adaptive::{AdaptiveSampler, JumpWeights};
use conditional::{draw_rho_analytic, draw_rho_on_grid, draw_variance_on_grid, log_grid};
use indicatif::{ProgressBar, ProgressStyle};
use likelihood::{BlockState, Likelihood};
use metropolis::{single_component_mh, MhTuning};
use nalgebra::{DMatrix, DVector};
use ndarray::{s, Array1, Array2};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;

/// How a block of hyperparameters is updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleMethod {
    /// Exact draw from the conditional posterior
    Conditional,
    /// Short Metropolis-Hastings chain
    Mh,
}

impl FromStr for SampleMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conditional" => Ok(SampleMethod::Conditional),
            "mh" => Ok(SampleMethod::Mh),
            other => Err(format!("unknown sampling method '{other}', expected 'conditional' or 'mh'")),
        }
    }
}

impl fmt::Display for SampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleMethod::Conditional => write!(f, "conditional"),
            SampleMethod::Mh => write!(f, "mh"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GibbsConfig {
    /// Free spectrum update
    pub hypersample: SampleMethod,
    /// ECORR update
    pub ecorrsample: SampleMethod,
    /// Seed for the sampler's generator. Drawn from the OS when absent.
    pub seed: Option<u64>,
    /// Length of the short chains tuning the white noise and ECORR steps
    pub white_adapt_iters: usize,
    /// Length of the full-likelihood run learning the red noise proposal
    pub red_adapt_iters: usize,
    pub red_steps_per_iter: usize,
    pub jump_weights: JumpWeights,
    /// Chains are written every this many iterations
    pub save_every: usize,
}

impl Default for GibbsConfig {
    fn default() -> Self {
        GibbsConfig {
            hypersample: SampleMethod::Conditional,
            ecorrsample: SampleMethod::Mh,
            seed: None,
            white_adapt_iters: WHITE_ADAPT_ITERS,
            red_adapt_iters: RED_ADAPT_ITERS,
            red_steps_per_iter: RED_STEPS_PER_ITER,
            jump_weights: JumpWeights::default(),
            save_every: SAVE_EVERY,
        }
    }
}

/// Chains produced by [`PulsarBlockGibbs::sample`].
#[derive(Debug, Clone)]
pub struct Chains {
    /// One row of hyperparameters per iteration
    pub chain: Array2<f64>,
    /// One row of basis coefficients per iteration
    pub bchain: Array2<f64>,
}

/// Per-backend ECORR update: parameter slot and absolute basis columns.
#[derive(Debug, Clone)]
struct EcorrSlot {
    index: usize,
    columns: Range<usize>,
}

pub struct PulsarBlockGibbs {
    pub pulsar_name: String,
    config: GibbsConfig,
    state: BlockState,
    param_names: Vec<String>,
    b_param_names: Vec<String>,

    white_idx: Vec<usize>,
    ecorr_idx: Vec<usize>,
    red_idx: Vec<usize>,
    rho_idx: Vec<usize>,

    /// Allowed range of the free spectrum variances
    rho_range: Option<(f64, f64)>,
    /// Allowed range of the ECORR variances
    ecorr_range: Option<(f64, f64)>,
    ecorr_slots: Vec<EcorrSlot>,

    white_tuning: Option<MhTuning>,
    ecorr_tuning: Option<MhTuning>,
    red_sampler: Option<AdaptiveSampler>,
    rng: Xoshiro256PlusPlus,
}

/// Variance range `[10^(2 pmin), 10^(2 pmax)]` of a log10 amplitude prior.
fn variance_range(prior: Prior) -> (f64, f64) {
    if let Prior::LinearExp { .. } = prior {
        log::warn!("conditional variance draws assume a log-uniform prior, not {prior:?}");
    }
    let (pmin, pmax) = prior.bounds();
    (10_f64.powf(2.0 * pmin), 10_f64.powf(2.0 * pmax))
}

/// `log10` amplitude of a drawn variance, clamped to the prior support.
fn log10_amplitude(variance: f64, prior: Option<Prior>) -> f64 {
    let x = 0.5 * variance.log10();
    match prior {
        Some(prior) => {
            let (pmin, pmax) = prior.bounds();
            x.clamp(pmin, pmax)
        }
        None => x,
    }
}

impl PulsarBlockGibbs {
    pub fn new(model: PulsarModel, config: GibbsConfig) -> Result<PulsarBlockGibbs> {
        let param_names = model.param_names();
        let b_param_names = model.basis_names();

        let white_idx = model.indices_where(|k| k.is_white());
        let ecorr_idx = model.indices_where(|k| k == ParameterKind::Ecorr);
        let red_idx = model.indices_where(|k| k.is_red());
        let rho_idx = model.indices_where(|k| k == ParameterKind::Rho);

        let rho_range = model.rho_prior().map(variance_range);
        let ecorr_range = model.ecorr().and_then(|e| e.ecorr_prior()).map(variance_range);

        // Locate each varied ECORR coefficient in the parameter vector and basis
        let mut ecorr_slots = vec![];
        if let (Some(ecorr), Some(block)) = (model.ecorr(), model.block_of(SignalKind::BasisEcorr)) {
            for group in ecorr.groups() {
                let Some(name) = group.param_name() else {
                    continue;
                };
                let index = param_names
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| GibbsError::UnknownParameter(name.to_string()))?;
                ecorr_slots.push(EcorrSlot {
                    index,
                    columns: block.columns.start + group.columns.start..block.columns.start + group.columns.end,
                });
            }
        }

        let rng = match config.seed {
            Some(seed) => Xoshiro256PlusPlus::seed_from_u64(seed),
            None => Xoshiro256PlusPlus::from_entropy(),
        };

        log::info!(
            "Gibbs blocks for {}: {} white, {} ECORR, {} red, {} free spectrum parameters; {} coefficients",
            model.pulsar_name,
            white_idx.len(),
            ecorr_idx.len(),
            red_idx.len(),
            rho_idx.len(),
            b_param_names.len()
        );

        Ok(PulsarBlockGibbs {
            pulsar_name: model.pulsar_name.clone(),
            config,
            state: BlockState::new(model),
            param_names,
            b_param_names,
            white_idx,
            ecorr_idx,
            red_idx,
            rho_idx,
            rho_range,
            ecorr_range,
            ecorr_slots,
            white_tuning: None,
            ecorr_tuning: None,
            red_sampler: None,
            rng,
        })
    }

    pub fn model(&self) -> &PulsarModel {
        self.state.model()
    }

    pub fn params(&self) -> &[Parameter] {
        self.model().params()
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn b_param_names(&self) -> &[String] {
        &self.b_param_names
    }

    pub fn map_params(&self, xs: &[f64]) -> Result<ParamMap> {
        self.model().map_params(xs)
    }

    /// Current basis coefficients.
    pub fn b(&self) -> &DVector<f64> {
        self.state.b()
    }

    pub fn get_gwrho_param_indices(&self) -> &[usize] {
        &self.rho_idx
    }

    pub fn get_red_param_indices(&self) -> &[usize] {
        &self.red_idx
    }

    pub fn get_efacequad_indices(&self) -> &[usize] {
        &self.white_idx
    }

    pub fn get_ecorr_indices(&self) -> &[usize] {
        &self.ecorr_idx
    }

    pub fn rho_range(&self) -> Option<(f64, f64)> {
        self.rho_range
    }

    pub fn ecorr_range(&self) -> Option<(f64, f64)> {
        self.ecorr_range
    }

    pub fn get_lnlikelihood_white(&self, xs: &[f64]) -> Result<f64> {
        self.state.lnlikelihood(Likelihood::White, xs)
    }

    pub fn get_lnlikelihood_red(&self, xs: &[f64]) -> Result<f64> {
        self.state.lnlikelihood(Likelihood::Red, xs)
    }

    pub fn get_lnlikelihood_ecorr(&self, xs: &[f64]) -> Result<f64> {
        self.state.lnlikelihood(Likelihood::Ecorr, xs)
    }

    pub fn get_lnlikelihood_fullmarg(&self, xs: &[f64]) -> Result<f64> {
        self.state.lnlikelihood(Likelihood::FullMarginal, xs)
    }

    pub fn get_lnprior(&self, xs: &[f64]) -> Result<f64> {
        self.model().get_lnprior(xs)
    }

    /// Redraws the basis coefficients given the hyperparameters `xs`.
    pub fn update_b(&mut self, xs: &DVector<f64>) -> Result<()> {
        self.state.draw_b(xs.as_slice(), &mut self.rng)
    }

    /// Metropolis update of EFAC and EQUAD with `b` fixed. With `iters`, a
    /// tuning chain of that length is run first and sets the number of steps
    /// taken by later calls.
    pub fn update_white_params(&mut self, xs: &DVector<f64>, iters: Option<usize>) -> Result<DVector<f64>> {
        let iters = iters.or_else(|| self.white_tuning.is_none().then_some(self.config.white_adapt_iters));
        tuned_mh(
            &self.state,
            &mut self.rng,
            &mut self.white_tuning,
            &self.white_idx,
            Likelihood::White,
            xs,
            iters,
        )
    }

    /// ECORR update with `b` fixed, by Metropolis steps or by a direct draw
    /// per backend.
    pub fn update_ecorr_params(&mut self, xs: &DVector<f64>, iters: Option<usize>) -> Result<DVector<f64>> {
        match self.config.ecorrsample {
            SampleMethod::Mh => {
                let iters = iters.or_else(|| self.ecorr_tuning.is_none().then_some(self.config.white_adapt_iters));
                tuned_mh(
                    &self.state,
                    &mut self.rng,
                    &mut self.ecorr_tuning,
                    &self.ecorr_idx,
                    Likelihood::Ecorr,
                    xs,
                    iters,
                )
            }
            SampleMethod::Conditional => {
                let (lo, hi) = self
                    .ecorr_range
                    .ok_or_else(|| GibbsError::Config("model has no varied ECORR".to_string()))?;
                let grid = log_grid(lo, hi, CONDITIONAL_GRID_POINTS);
                let prior = self.model().ecorr().and_then(|e| e.ecorr_prior());
                let b = self.state.b();

                let mut xnew = xs.clone();
                for slot in &self.ecorr_slots {
                    let sum_sq: f64 = slot.columns.clone().map(|i| b[i] * b[i]).sum();
                    let phi = draw_variance_on_grid(slot.columns.len(), sum_sq, &grid, &mut self.rng);
                    xnew[slot.index] = log10_amplitude(phi, prior);
                }
                Ok(xnew)
            }
        }
    }

    /// Red noise update. With `iters`, first learns a proposal covariance by
    /// adaptive sampling of every parameter on the fully marginalised
    /// likelihood, then restricts it to the red noise parameters. Otherwise
    /// takes a few adaptive Metropolis steps on the red noise likelihood.
    pub fn update_red_params(&mut self, xs: &DVector<f64>, iters: Option<usize>) -> Result<DVector<f64>> {
        let iters = iters.or_else(|| self.red_sampler.is_none().then_some(self.config.red_adapt_iters));
        let state = &self.state;
        let rng = &mut self.rng;

        if let Some(iters) = iters {
            let mut sampler = AdaptiveSampler::new(xs.len(), self.config.jump_weights)?;
            let full = |x: &[f64]| state.lnposterior(Likelihood::FullMarginal, x);
            let (xnew, lnpost) = sampler.run(xs, iters, full, rng)?;
            log::info!(
                "learned red noise proposal from {} steps (acceptance {:.2}, ln posterior {:.3})",
                iters,
                sampler.acceptance_rate(),
                lnpost
            );
            sampler.restrict(&self.red_idx)?;
            self.red_sampler = Some(sampler);
            return Ok(xnew);
        }

        let Some(sampler) = self.red_sampler.as_mut() else {
            return Ok(xs.clone());
        };
        let mut red = |x: &[f64]| state.lnposterior(Likelihood::Red, x);
        let mut xnew = xs.clone();
        let mut lnpost = red(xnew.as_slice())?;
        for _ in 0..self.config.red_steps_per_iter {
            (xnew, lnpost) = sampler.step(&xnew, lnpost, &mut red, rng)?;
        }
        Ok(xnew)
    }

    /// Free spectrum update with `b` fixed.
    pub fn update_gwrho_params(&mut self, xs: &DVector<f64>) -> Result<DVector<f64>> {
        match self.config.hypersample {
            SampleMethod::Conditional => self.draw_gwrho_conditional(xs),
            SampleMethod::Mh => {
                let state = &self.state;
                let target = |x: &[f64]| state.lnposterior(Likelihood::Spectrum, x);
                let run = single_component_mh(xs, &self.rho_idx, RHO_MH_STEPS, target, &mut self.rng, false)?;
                Ok(run.x)
            }
        }
    }

    fn draw_gwrho_conditional(&mut self, xs: &DVector<f64>) -> Result<DVector<f64>> {
        let (rhomin, rhomax) = self
            .rho_range
            .ok_or_else(|| GibbsError::Config("model has no free spectrum".to_string()))?;
        let columns = self
            .state
            .spectrum_columns()
            .ok_or_else(|| GibbsError::Config("model has no free spectrum basis".to_string()))?;
        let tau = self.state.pair_tau(columns);

        let rhonew: Vec<f64> = if self.state.red_shares_spectrum() {
            // Numerical conditional, with the red noise variance added
            let params = self.map_params(xs.as_slice())?;
            let red_phi = self
                .model()
                .signal_phi(SignalKind::RedNoise, &params)?
                .ok_or_else(|| GibbsError::Config("red noise has no prior variances".to_string()))?;
            let grid = log_grid(rhomin, rhomax, CONDITIONAL_GRID_POINTS);
            tau.iter()
                .enumerate()
                .map(|(k, &t)| draw_rho_on_grid(t, red_phi[2 * k], &grid, &mut self.rng))
                .collect()
        } else {
            tau.iter()
                .map(|&t| draw_rho_analytic(t, rhomin, rhomax, &mut self.rng))
                .collect()
        };

        let prior = self.model().rho_prior();
        let mut xnew = xs.clone();
        for (&index, rho) in self.rho_idx.iter().zip(rhonew) {
            xnew[index] = log10_amplitude(rho, prior);
        }
        Ok(xnew)
    }

    /// Runs the sampler from `x0` for `niter` iterations, writing the chains
    /// to `outdir`. With `resume`, continues from chains already in `outdir`.
    pub fn sample(&mut self, x0: &DVector<f64>, outdir: impl AsRef<Path>, niter: usize, resume: bool) -> Result<Chains> {
        let ndim = self.param_names.len();
        if x0.len() != ndim {
            return Err(GibbsError::DimensionMismatch {
                expected: ndim,
                actual: x0.len(),
            });
        }
        let nb = self.b_param_names.len();

        let dir = ChainDir::create(outdir)?;
        dir.write_names(PARAM_NAMES_FILE, &self.param_names)?;
        dir.write_names(BASIS_NAMES_FILE, &self.b_param_names)?;

        let mut chain = Array2::<f64>::zeros((niter, ndim));
        let mut bchain = Array2::<f64>::zeros((niter, nb));

        let mut start = 0;
        let mut x = x0.clone();
        if resume {
            log::info!("Resuming from previous run in {}", dir.path().display());
            let (old, bold) = dir.load()?;
            if old.ncols() != ndim || bold.ncols() != nb {
                return Err(GibbsError::Resume {
                    path: dir.path().to_path_buf(),
                    reason: format!(
                        "saved chains have {} and {} columns, expected {} and {}",
                        old.ncols(),
                        bold.ncols(),
                        ndim,
                        nb
                    ),
                });
            }

            start = old.nrows().min(niter);
            chain.slice_mut(s![..start, ..]).assign(&old.slice(s![..start, ..]));
            bchain.slice_mut(s![..start, ..]).assign(&bold.slice(s![..start, ..]));
            if start > 0 {
                x = DVector::from_iterator(ndim, chain.row(start - 1).iter().copied());
                let b = DVector::from_iterator(nb, bchain.row(start - 1).iter().copied());
                self.state.set_b(b)?;
            }
            log::info!("loaded {start} previous iterations");
        }

        let progress = ProgressBar::new(niter.saturating_sub(start) as u64);
        if let Ok(style) = ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta})") {
            progress.set_style(style.progress_chars("#>-"));
        }

        for ii in start..niter {
            chain.row_mut(ii).assign(&Array1::from_iter(x.iter().copied()));
            bchain.row_mut(ii).assign(&Array1::from_iter(self.state.b().iter().copied()));

            if ii == 0 {
                self.update_b(&x)?;
            }
            self.state.invalidate_cache();

            // The first iteration of a run tunes each Metropolis block
            let first = ii == start;
            let previous = x.clone();

            if !self.white_idx.is_empty() {
                x = self.update_white_params(&x, first.then_some(self.config.white_adapt_iters))?;
            }
            if !self.ecorr_idx.is_empty() {
                x = self.update_ecorr_params(&x, first.then_some(self.config.white_adapt_iters))?;
            }
            if !self.red_idx.is_empty() {
                x = self.update_red_params(&x, first.then_some(self.config.red_adapt_iters))?;
            }
            if !self.rho_idx.is_empty() {
                x = self.update_gwrho_params(&x)?;
            }

            if x != previous {
                self.update_b(&x)?;
            }

            if ii > 0 && ii % self.config.save_every.max(1) == 0 {
                dir.save(chain.view(), bchain.view(), ii + 1)?;
            }
            progress.inc(1);
        }
        progress.finish();

        dir.save(chain.view(), bchain.view(), niter)?;
        log::info!("finished {} iterations for {}", niter, self.pulsar_name);

        Ok(Chains { chain, bchain })
    }
}

/// Single-component Metropolis steps on one block. With `iters`, runs a
/// tuning chain of that length and stores what it learned in `tuning`;
/// otherwise takes as many steps as the stored tuning says.
fn tuned_mh(
    state: &BlockState,
    rng: &mut Xoshiro256PlusPlus,
    tuning: &mut Option<MhTuning>,
    indices: &[usize],
    kind: Likelihood,
    xs: &DVector<f64>,
    iters: Option<usize>,
) -> Result<DVector<f64>> {
    let target = |x: &[f64]| state.lnposterior(kind, x);

    match iters {
        Some(iters) => {
            let run = single_component_mh(xs, indices, iters, target, rng, true)?;
            let samples = run.samples.unwrap_or_else(|| DMatrix::zeros(0, indices.len()));
            let learned = MhTuning::from_samples(&samples, SHORT_CHAIN_BURN);
            log::info!(
                "{:?} block: accepted {}/{} tuning steps, autocorrelation length {}",
                kind,
                run.accepted,
                iters,
                learned.aclength
            );
            *tuning = Some(learned);
            Ok(run.x)
        }
        None => {
            let steps = tuning.as_ref().map_or(1, |t| t.aclength);
            Ok(single_component_mh(xs, indices, steps, target, rng, false)?.x)
        }
    }
}

#[cfg(test)]
use crate::model::{model_general, test_pulsar, ModelConfig};

#[cfg(test)]
fn quick_config(seed: u64) -> GibbsConfig {
    GibbsConfig {
        seed: Some(seed),
        white_adapt_iters: 300,
        red_adapt_iters: 2000,
        red_steps_per_iter: 5,
        save_every: 10,
        ..GibbsConfig::default()
    }
}

#[cfg(test)]
fn quick_gibbs(model_config: ModelConfig, config: GibbsConfig) -> PulsarBlockGibbs {
    let psr = test_pulsar(51);
    let model = model_general(&psr, &model_config).unwrap();
    PulsarBlockGibbs::new(model, config).unwrap()
}

#[cfg(test)]
fn small_model() -> ModelConfig {
    ModelConfig {
        red_components: 5,
        common_components: 5,
        ..ModelConfig::default()
    }
}

#[test]
fn test_sample_method_parsing() {
    assert_eq!("conditional".parse::<SampleMethod>().unwrap(), SampleMethod::Conditional);
    assert_eq!("MH".parse::<SampleMethod>().unwrap(), SampleMethod::Mh);
    assert!("gibbs".parse::<SampleMethod>().is_err());
    assert_eq!(SampleMethod::Mh.to_string(), "mh");
}

#[test]
fn test_block_indices_partition_parameters() {
    let gibbs = quick_gibbs(small_model(), quick_config(1));
    let mut all: Vec<usize> = [
        gibbs.get_efacequad_indices(),
        gibbs.get_ecorr_indices(),
        gibbs.get_red_param_indices(),
        gibbs.get_gwrho_param_indices(),
    ]
    .concat();
    all.sort_unstable();
    assert_eq!(all, (0..gibbs.param_names().len()).collect::<Vec<_>>());
    assert_eq!(gibbs.get_gwrho_param_indices().len(), 5);

    let (rhomin, rhomax) = gibbs.rho_range().unwrap();
    approx::assert_relative_eq!(rhomin, 1e-20, max_relative = 1e-12);
    approx::assert_relative_eq!(rhomax, 1e-8, max_relative = 1e-12);
}

#[test]
fn test_conditional_rho_within_prior() {
    let mut gibbs = quick_gibbs(small_model(), quick_config(2));
    let x = gibbs.model().sample_initial(&mut Xoshiro256PlusPlus::seed_from_u64(99));
    gibbs.update_b(&x).unwrap();

    for _ in 0..20 {
        let xnew = gibbs.update_gwrho_params(&x).unwrap();
        for &i in gibbs.get_gwrho_param_indices() {
            assert!((-10.0 - 1e-9..=-4.0 + 1e-9).contains(&xnew[i]), "rho {}", xnew[i]);
        }
        // Other parameters are untouched
        for &i in gibbs.get_efacequad_indices() {
            assert_eq!(xnew[i], x[i]);
        }
    }
}

#[test]
fn test_analytic_rho_without_red_noise() {
    let config = ModelConfig {
        red_var: false,
        ..small_model()
    };
    let mut gibbs = quick_gibbs(config, quick_config(3));
    assert!(gibbs.get_red_param_indices().is_empty());
    let x = gibbs.model().sample_initial(&mut Xoshiro256PlusPlus::seed_from_u64(99));
    gibbs.update_b(&x).unwrap();
    let xnew = gibbs.update_gwrho_params(&x).unwrap();
    assert!(xnew.iter().all(|v| v.is_finite()));
}

#[test]
fn test_white_update_tunes_then_steps() {
    let mut gibbs = quick_gibbs(small_model(), quick_config(4));
    let x = gibbs.model().sample_initial(&mut Xoshiro256PlusPlus::seed_from_u64(99));
    gibbs.update_b(&x).unwrap();

    let xnew = gibbs.update_white_params(&x, Some(300)).unwrap();
    assert!(gibbs.white_tuning.as_ref().unwrap().aclength >= 1);
    assert!(gibbs.get_lnprior(xnew.as_slice()).unwrap().is_finite());

    let xnext = gibbs.update_white_params(&xnew, None).unwrap();
    for &i in gibbs.get_red_param_indices() {
        assert_eq!(xnext[i], x[i]);
    }
}

#[test]
fn test_ecorr_conditional_and_mh() {
    let config = ModelConfig {
        inc_ecorr: true,
        ..small_model()
    };
    for method in [SampleMethod::Conditional, SampleMethod::Mh] {
        let mut gibbs = quick_gibbs(
            config.clone(),
            GibbsConfig {
                ecorrsample: method,
                ..quick_config(5)
            },
        );
        assert_eq!(gibbs.get_ecorr_indices().len(), 2);

        let x = gibbs.model().sample_initial(&mut Xoshiro256PlusPlus::seed_from_u64(99));
        gibbs.update_b(&x).unwrap();
        let xnew = gibbs.update_ecorr_params(&x, Some(200)).unwrap();
        for &i in gibbs.get_ecorr_indices() {
            assert!((-8.5 - 1e-9..=-5.0 + 1e-9).contains(&xnew[i]));
        }
        assert!(gibbs.get_lnlikelihood_ecorr(xnew.as_slice()).unwrap().is_finite());
    }
}

#[test]
fn test_red_update_adapts_then_moves_only_red() {
    let mut gibbs = quick_gibbs(small_model(), quick_config(6));
    let x = gibbs.model().sample_initial(&mut Xoshiro256PlusPlus::seed_from_u64(99));
    gibbs.update_b(&x).unwrap();

    let adapted = gibbs.update_red_params(&x, Some(1000)).unwrap();
    assert!(gibbs.get_lnprior(adapted.as_slice()).unwrap().is_finite());
    assert_eq!(gibbs.red_sampler.as_ref().unwrap().group(), gibbs.get_red_param_indices());

    let stepped = gibbs.update_red_params(&adapted, None).unwrap();
    for i in 0..stepped.len() {
        if !gibbs.get_red_param_indices().contains(&i) {
            assert_eq!(stepped[i], adapted[i]);
        }
    }
}

#[test]
fn test_sample_writes_chains() {
    let dir = tempfile::tempdir().unwrap();
    let mut gibbs = quick_gibbs(small_model(), quick_config(7));
    let x0 = gibbs.model().sample_initial(&mut Xoshiro256PlusPlus::seed_from_u64(99));

    let chains = gibbs.sample(&x0, dir.path(), 25, false).unwrap();
    assert_eq!(chains.chain.shape(), &[25, gibbs.param_names().len()]);
    assert_eq!(chains.bchain.shape(), &[25, gibbs.b_param_names().len()]);

    // Row 0 is the starting point and b before the first draw
    for (a, b) in chains.chain.row(0).iter().zip(x0.iter()) {
        assert_eq!(a, b);
    }
    assert!(chains.bchain.row(0).iter().all(|&v| v == 0.0));
    assert!(chains.bchain.row(1).iter().any(|&v| v != 0.0));
    assert!(chains.chain.iter().all(|v| v.is_finite()));

    for file in ["pars_chain.txt", "pars_bchain.txt", "chain.npy", "bchain.npy"] {
        assert!(dir.path().join(file).exists(), "{file} missing");
    }
}

#[test]
fn test_sample_rejects_wrong_length() {
    let dir = tempfile::tempdir().unwrap();
    let mut gibbs = quick_gibbs(small_model(), quick_config(8));
    let err = gibbs.sample(&DVector::zeros(2), dir.path(), 5, false).unwrap_err();
    assert!(matches!(err, GibbsError::DimensionMismatch { actual: 2, .. }));
}
