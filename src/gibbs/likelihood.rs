//! Conditional likelihoods of each hyperparameter block given the current
//! Gaussian process coefficients `b`, and the fully marginalised likelihood.
use crate::error::{GibbsError, Result};
use crate::model::signals::SignalKind;
use crate::model::{tnt_and_d, PulsarModel};
use crate::utils::svd::sample_precision_gaussian;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use std::ops::Range;

/// Which likelihood a block is sampled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Likelihood {
    /// White noise given `b`
    White,
    /// Fourier coefficients of the block holding the intrinsic red noise
    Red,
    /// Fourier coefficients of the block holding the free spectrum
    Spectrum,
    /// ECORR epoch coefficients
    Ecorr,
    /// Every process marginalised
    FullMarginal,
}

/// The model with the current coefficients `b`.
#[derive(Debug)]
pub struct BlockState {
    model: PulsarModel,
    b: DVector<f64>,
    /// `T b`, kept in step with `b`
    tb: DVector<f64>,
    /// `T^T N^-1 T` and `T^T N^-1 r` for the white noise state of this iteration
    cache: Option<(DMatrix<f64>, DVector<f64>)>,
    red_columns: Option<Range<usize>>,
    spectrum_columns: Option<Range<usize>>,
    ecorr_columns: Option<Range<usize>>,
}

impl BlockState {
    pub fn new(model: PulsarModel) -> BlockState {
        let ncols = model.get_basis().ncols();
        let columns = |kind| model.block_of(kind).map(|block| block.columns.clone());
        BlockState {
            red_columns: columns(SignalKind::RedNoise),
            spectrum_columns: columns(SignalKind::FreeSpectrum),
            ecorr_columns: columns(SignalKind::BasisEcorr),
            b: DVector::zeros(ncols),
            tb: DVector::zeros(model.get_residuals().len()),
            cache: None,
            model,
        }
    }

    pub fn model(&self) -> &PulsarModel {
        &self.model
    }

    pub fn b(&self) -> &DVector<f64> {
        &self.b
    }

    pub fn set_b(&mut self, b: DVector<f64>) -> Result<()> {
        if b.len() != self.b.len() {
            return Err(GibbsError::DimensionMismatch {
                expected: self.b.len(),
                actual: b.len(),
            });
        }
        self.tb = self.model.get_basis() * &b;
        self.b = b;
        Ok(())
    }

    pub fn red_columns(&self) -> Option<&Range<usize>> {
        self.red_columns.as_ref()
    }

    pub fn spectrum_columns(&self) -> Option<&Range<usize>> {
        self.spectrum_columns.as_ref()
    }

    pub fn ecorr_columns(&self) -> Option<&Range<usize>> {
        self.ecorr_columns.as_ref()
    }

    /// True when the red noise and free spectrum share Fourier coefficients.
    pub fn red_shares_spectrum(&self) -> bool {
        self.red_columns.is_some() && self.red_columns == self.spectrum_columns
    }

    pub fn invalidate_cache(&mut self) {
        self.cache = None;
    }

    /// Mean square of each sine/cosine pair of coefficients in `columns`.
    pub fn pair_tau(&self, columns: &Range<usize>) -> DVector<f64> {
        let pairs = columns.len() / 2;
        DVector::from_iterator(
            pairs,
            (0..pairs).map(|k| {
                let i = columns.start + 2 * k;
                0.5 * (self.b[i] * self.b[i] + self.b[i + 1] * self.b[i + 1])
            }),
        )
    }

    /// Draws `b ~ N(Sigma^-1 d, Sigma^-1)` with `Sigma = T^T N^-1 T + phi^-1`.
    pub fn draw_b<R: Rng + ?Sized>(&mut self, xs: &[f64], rng: &mut R) -> Result<()> {
        let params = self.model.map_params(xs)?;
        let (phiinv, _) = self.model.get_phiinv(&params)?;

        let model = &self.model;
        let (tnt, d) = match self.cache.take() {
            Some(cached) => cached,
            None => {
                let ndiag = model.get_ndiag(&params)?;
                tnt_and_d(model.get_basis(), &ndiag, model.get_residuals())
            }
        };

        let sigma = &tnt + DMatrix::from_diagonal(&phiinv);
        let b = sample_precision_gaussian(&sigma, &d, rng);
        self.cache = Some((tnt, d));
        self.set_b(b?)
    }

    pub fn lnlikelihood(&self, kind: Likelihood, xs: &[f64]) -> Result<f64> {
        match kind {
            Likelihood::White => self.lnlikelihood_white(xs),
            Likelihood::Red => self.fourier_lnlikelihood(Self::required(&self.red_columns, "red noise")?, xs),
            Likelihood::Spectrum => {
                self.fourier_lnlikelihood(Self::required(&self.spectrum_columns, "free spectrum")?, xs)
            }
            Likelihood::Ecorr => self.lnlikelihood_ecorr(xs),
            Likelihood::FullMarginal => self.model.get_lnlikelihood(xs),
        }
    }

    /// Log prior plus the chosen log likelihood. The likelihood is not
    /// evaluated outside the prior support.
    pub fn lnposterior(&self, kind: Likelihood, xs: &[f64]) -> Result<f64> {
        let lnprior = self.model.get_lnprior(xs)?;
        if lnprior == f64::NEG_INFINITY {
            return Ok(lnprior);
        }
        Ok(lnprior + self.lnlikelihood(kind, xs)?)
    }

    fn required<'a>(columns: &'a Option<Range<usize>>, what: &str) -> Result<&'a Range<usize>> {
        columns
            .as_ref()
            .ok_or_else(|| GibbsError::Config(format!("model has no {what} basis")))
    }

    /// `-1/2 (ln|N| + (r - T b)^T N^-1 (r - T b))`
    pub fn lnlikelihood_white(&self, xs: &[f64]) -> Result<f64> {
        let params = self.model.map_params(xs)?;
        let ndiag = self.model.get_ndiag(&params)?;
        let yred = self.model.get_residuals() - &self.tb;

        let logdet_n: f64 = ndiag.iter().map(|n| n.ln()).sum();
        let rnr: f64 = yred.iter().zip(ndiag.iter()).map(|(y, n)| y * y / n).sum();
        Ok(-0.5 * (logdet_n + rnr))
    }

    /// Likelihood of the coefficient pairs in `columns` given their summed
    /// prior variances, up to a constant.
    pub fn fourier_lnlikelihood(&self, columns: &Range<usize>, xs: &[f64]) -> Result<f64> {
        let params = self.model.map_params(xs)?;
        let phi = self.model.get_phi(&params)?;
        let tau = self.pair_tau(columns);

        Ok(tau
            .iter()
            .enumerate()
            .map(|(k, t)| {
                let logratio = t.ln() - phi[columns.start + 2 * k].ln();
                logratio - logratio.exp()
            })
            .sum())
    }

    /// `-1/2 sum (ln phi + b^2 / phi)` over the ECORR coefficients.
    pub fn lnlikelihood_ecorr(&self, xs: &[f64]) -> Result<f64> {
        let columns = Self::required(&self.ecorr_columns, "ECORR")?;
        let params = self.model.map_params(xs)?;
        let phi = self.model.get_phi(&params)?;

        Ok(columns
            .clone()
            .map(|i| -0.5 * (phi[i].ln() + self.b[i] * self.b[i] / phi[i]))
            .sum())
    }
}

#[cfg(test)]
use crate::model::{model_general, test_pulsar, ModelConfig};

#[cfg(test)]
fn small_state(inc_ecorr: bool) -> BlockState {
    let psr = test_pulsar(41);
    let config = ModelConfig {
        inc_ecorr,
        red_components: 4,
        common_components: 4,
        ..ModelConfig::default()
    };
    BlockState::new(model_general(&psr, &config).unwrap())
}

#[test]
fn test_column_ranges() {
    let state = small_state(true);
    assert_eq!(state.red_columns(), Some(&(3..11)));
    assert!(state.red_shares_spectrum());
    assert_eq!(state.ecorr_columns().unwrap().len(), 30);
}

#[test]
fn test_white_likelihood_with_zero_b_ignores_basis() {
    let state = small_state(false);
    let x = state.model().sample_initial(&mut rand::thread_rng());
    let params = state.model().map_params(x.as_slice()).unwrap();
    let ndiag = state.model().get_ndiag(&params).unwrap();
    let r = state.model().get_residuals();

    let expected: f64 = -0.5
        * r.iter()
            .zip(ndiag.iter())
            .map(|(r, n)| n.ln() + r * r / n)
            .sum::<f64>();
    approx::assert_relative_eq!(state.lnlikelihood_white(x.as_slice()).unwrap(), expected, max_relative = 1e-12);
}

#[test]
fn test_drawn_b_reduces_white_residuals() {
    use rand::SeedableRng;
    let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(42);
    let mut state = small_state(false);
    let mut x = state.model().sample_initial(&mut rng);
    for (i, name) in state.model().param_names().iter().enumerate() {
        x[i] = match name.rsplit('_').next() {
            Some("efac") => 1.0,
            Some("tnequad") => -8.0,
            Some("A") => -13.0,
            Some("gamma") => 4.0,
            _ => -7.0,
        };
    }

    let before = state.lnlikelihood_white(x.as_slice()).unwrap();
    state.draw_b(x.as_slice(), &mut rng).unwrap();
    let after = state.lnlikelihood_white(x.as_slice()).unwrap();

    assert!(state.b().iter().all(|v| v.is_finite()));
    assert!(after > before);
}

#[test]
fn test_fourier_likelihood_prefers_matching_variance() {
    let mut state = small_state(false);
    let columns = state.red_columns().unwrap().clone();

    // Coefficients with mean square 1e-14 in every pair
    let mut b = DVector::zeros(state.b().len());
    for i in columns.clone() {
        b[i] = 1e-7;
    }
    state.set_b(b).unwrap();

    let names = state.model().param_names();
    let mut x = state.model().sample_initial(&mut rand::thread_rng());
    let set_rho = |x: &mut DVector<f64>, value: f64| {
        for (i, name) in names.iter().enumerate() {
            if name.starts_with("gw_log10_rho") {
                x[i] = value;
            }
        }
    };
    // Make red noise negligible
    for (i, name) in names.iter().enumerate() {
        if name.ends_with("red_noise_log10_A") {
            x[i] = -20.0;
        }
    }

    set_rho(&mut x, -7.0);
    let matched = state.fourier_lnlikelihood(&columns, x.as_slice()).unwrap();
    set_rho(&mut x, -5.0);
    let too_large = state.fourier_lnlikelihood(&columns, x.as_slice()).unwrap();
    set_rho(&mut x, -9.0);
    let too_small = state.fourier_lnlikelihood(&columns, x.as_slice()).unwrap();

    assert!(matched > too_large);
    assert!(matched > too_small);
}

#[test]
fn test_ecorr_likelihood_requires_ecorr() {
    let state = small_state(false);
    let x = state.model().sample_initial(&mut rand::thread_rng());
    assert!(matches!(
        state.lnlikelihood(Likelihood::Ecorr, x.as_slice()),
        Err(GibbsError::Config(_))
    ));
}

#[test]
fn test_lnposterior_outside_prior() {
    let state = small_state(false);
    let mut x = state.model().sample_initial(&mut rand::thread_rng());
    x[0] = -1.0;
    assert_eq!(
        state.lnposterior(Likelihood::White, x.as_slice()).unwrap(),
        f64::NEG_INFINITY
    );
}
