/// This module builds the single-pulsar noise model: the parameters, the
/// signals, and the assembled basis/prior/white noise quantities the
/// likelihood and the Gibbs sampler need.
pub mod basis;
pub mod parameter;
pub mod signals;

use crate::error::{GibbsError, Result};
use crate::pulsar::Pulsar;
use nalgebra::{DMatrix, DVector};
use parameter::{Parameter, ParameterKind, Prior};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use signals::{BasisEcorr, BasisKey, FreeSpectrum, MeasurementNoise, RedNoise, Signal, SignalKind, TimingModel};
use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;

/// Parameter values keyed by parameter name.
#[derive(Debug, Clone, Default)]
pub struct ParamMap {
    values: HashMap<String, Vec<f64>>,
}

impl ParamMap {
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.values.insert(name.into(), values);
    }

    pub fn scalar(&self, name: &str) -> Result<f64> {
        self.values
            .get(name)
            .and_then(|v| v.first())
            .copied()
            .ok_or_else(|| GibbsError::UnknownParameter(name.to_string()))
    }

    pub fn vector(&self, name: &str) -> Result<&[f64]> {
        self.values
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| GibbsError::UnknownParameter(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Options for [`model_general`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Vary EFAC/EQUAD (and ECORR). When false they are fixed from `noise_dict`.
    pub white_vary: bool,
    /// Include an EQUAD per backend
    pub tnequad: bool,
    /// Include basis ECORR per backend
    pub inc_ecorr: bool,
    /// Include intrinsic power-law red noise
    pub red_var: bool,
    pub red_components: usize,
    /// Include the common free-spectrum process
    pub common_spectrum: bool,
    pub common_components: usize,
    /// Overrides the span used for Fourier frequencies, in seconds
    pub tspan: Option<f64>,
    pub efac_prior: Prior,
    pub equad_prior: Prior,
    pub ecorr_prior: Prior,
    pub red_log10_a_prior: Prior,
    pub red_gamma_prior: Prior,
    pub rho_prior: Prior,
    /// Fixed white noise values, enterprise noise-file style
    pub noise_dict: Option<HashMap<String, f64>>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            white_vary: true,
            tnequad: true,
            inc_ecorr: false,
            red_var: true,
            red_components: 30,
            common_spectrum: true,
            common_components: 30,
            tspan: None,
            efac_prior: Prior::Uniform { pmin: 0.01, pmax: 10.0 },
            equad_prior: Prior::Uniform { pmin: -8.5, pmax: -5.0 },
            ecorr_prior: Prior::Uniform { pmin: -8.5, pmax: -5.0 },
            red_log10_a_prior: Prior::Uniform { pmin: -20.0, pmax: -11.0 },
            red_gamma_prior: Prior::Uniform { pmin: 0.0, pmax: 7.0 },
            rho_prior: Prior::Uniform { pmin: -10.0, pmax: -4.0 },
            noise_dict: None,
        }
    }
}

impl ModelConfig {
    /// Reads a config from JSON. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<ModelConfig> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Reads an enterprise-style JSON noise dictionary (parameter name -> value).
pub fn read_noise_dict(path: impl AsRef<Path>) -> Result<HashMap<String, f64>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// A contiguous range of basis columns shared by one or more signals.
#[derive(Debug, Clone)]
pub struct BasisBlock {
    pub key: BasisKey,
    pub columns: Range<usize>,
    /// Indices into the model's signal list
    pub members: Vec<usize>,
    pub name: String,
}

/// The single-pulsar noise model.
#[derive(Debug)]
pub struct PulsarModel {
    pub pulsar_name: String,
    residuals: DVector<f64>,
    signals: Vec<Box<dyn Signal>>,
    params: Vec<Parameter>,
    basis: DMatrix<f64>,
    blocks: Vec<BasisBlock>,
    /// Kept separately for the sampler, which needs its epoch layout
    ecorr: Option<BasisEcorr>,
}

/// Builds the noise model for one pulsar: measurement noise, the linear timing
/// model, optional ECORR, optional intrinsic red noise and the optional
/// common free-spectrum process.
pub fn model_general(psr: &Pulsar, config: &ModelConfig) -> Result<PulsarModel> {
    if config.red_var && config.red_components == 0 {
        return Err(GibbsError::Config("red_components must be positive".to_string()));
    }
    if config.common_spectrum && config.common_components == 0 {
        return Err(GibbsError::Config("common_components must be positive".to_string()));
    }

    let tspan = config.tspan.unwrap_or_else(|| psr.tspan());
    if tspan <= 0.0 {
        return Err(GibbsError::Config(format!("invalid time span {tspan}")));
    }
    let noise_dict = config.noise_dict.as_ref();

    // Signals with a basis are listed in basis order
    let mut signals: Vec<Box<dyn Signal>> = vec![
        Box::new(MeasurementNoise::new(
            psr,
            config.white_vary,
            config.tnequad,
            config.efac_prior,
            config.equad_prior,
            noise_dict,
        )),
        Box::new(TimingModel::new(psr)),
    ];
    if config.red_var {
        signals.push(Box::new(RedNoise::new(
            psr,
            config.red_components,
            tspan,
            config.red_log10_a_prior,
            config.red_gamma_prior,
        )));
    }
    if config.common_spectrum {
        signals.push(Box::new(FreeSpectrum::new(
            psr,
            config.common_components,
            tspan,
            config.rho_prior,
        )));
    }
    let ecorr = config
        .inc_ecorr
        .then(|| BasisEcorr::new(psr, config.white_vary, config.ecorr_prior, noise_dict));
    if let Some(ecorr) = &ecorr {
        signals.push(Box::new(ecorr.clone()));
    }

    PulsarModel::new(psr, signals, ecorr)
}

impl PulsarModel {
    fn new(psr: &Pulsar, signals: Vec<Box<dyn Signal>>, ecorr: Option<BasisEcorr>) -> Result<Self> {
        // Unique parameters, ordered by name
        let mut params: Vec<Parameter> = signals.iter().flat_map(|s| s.params()).collect();
        params.sort_by(|a, b| a.name.cmp(&b.name));
        params.dedup_by(|a, b| a.name == b.name);

        // Group signals into basis blocks, appending columns for each new basis
        let mut blocks: Vec<BasisBlock> = vec![];
        let mut columns: Vec<&DMatrix<f64>> = vec![];
        let mut ncols = 0;
        for (index, signal) in signals.iter().enumerate() {
            let (Some(key), Some(basis)) = (signal.basis_key(), signal.get_basis()) else {
                continue;
            };

            if let Some(block) = blocks.iter_mut().find(|block| block.key == key) {
                block.members.push(index);
                // Red noise does not name a block it shares
                if signal.kind() != SignalKind::RedNoise {
                    block.name = signal.name().to_string();
                }
                continue;
            }

            blocks.push(BasisBlock {
                key,
                columns: ncols..ncols + basis.ncols(),
                members: vec![index],
                name: signal.name().to_string(),
            });
            columns.push(basis);
            ncols += basis.ncols();
        }

        let mut basis = DMatrix::zeros(psr.len(), ncols);
        for (block, matrix) in blocks.iter().zip(&columns) {
            basis
                .columns_mut(block.columns.start, block.columns.len())
                .copy_from(*matrix);
        }

        log::info!(
            "built model for {} with {} signals, {} parameters and {} basis columns",
            psr.name,
            signals.len(),
            params.iter().map(Parameter::dim).sum::<usize>(),
            ncols
        );

        Ok(PulsarModel {
            pulsar_name: psr.name.clone(),
            residuals: psr.residuals.clone(),
            signals,
            params,
            basis,
            blocks,
            ecorr,
        })
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    /// Total length of the parameter vector.
    pub fn ndim(&self) -> usize {
        self.params.iter().map(Parameter::dim).sum()
    }

    /// Names of every slot in the parameter vector.
    pub fn param_names(&self) -> Vec<String> {
        self.params.iter().flat_map(Parameter::component_names).collect()
    }

    /// Kind of every slot in the parameter vector.
    pub fn param_kinds(&self) -> Vec<ParameterKind> {
        self.params
            .iter()
            .flat_map(|p| std::iter::repeat(p.kind).take(p.dim()))
            .collect()
    }

    /// Slot indices of parameters satisfying `predicate`.
    pub fn indices_where(&self, predicate: impl Fn(ParameterKind) -> bool) -> Vec<usize> {
        self.param_kinds()
            .into_iter()
            .enumerate()
            .filter(|(_, kind)| predicate(*kind))
            .map(|(i, _)| i)
            .collect()
    }

    /// Splits a parameter vector into named values.
    pub fn map_params(&self, xs: &[f64]) -> Result<ParamMap> {
        if xs.len() != self.ndim() {
            return Err(GibbsError::DimensionMismatch {
                expected: self.ndim(),
                actual: xs.len(),
            });
        }

        let mut map = ParamMap::default();
        let mut offset = 0;
        for param in &self.params {
            map.insert(param.name.clone(), xs[offset..offset + param.dim()].to_vec());
            offset += param.dim();
        }
        Ok(map)
    }

    /// Concatenated prior draws of every parameter, in parameter order.
    pub fn sample_initial<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        DVector::from_iterator(self.ndim(), self.params.iter().flat_map(|p| p.sample(rng)))
    }

    pub fn get_lnprior(&self, xs: &[f64]) -> Result<f64> {
        let map = self.map_params(xs)?;
        self.params
            .iter()
            .map(|p| map.vector(&p.name).map(|values| p.logpdf(values)))
            .sum()
    }

    pub fn get_residuals(&self) -> &DVector<f64> {
        &self.residuals
    }

    pub fn get_basis(&self) -> &DMatrix<f64> {
        &self.basis
    }

    pub fn blocks(&self) -> &[BasisBlock] {
        &self.blocks
    }

    /// Names of the basis coefficients, `{block}_{i}`.
    pub fn basis_names(&self) -> Vec<String> {
        self.blocks
            .iter()
            .flat_map(|block| (0..block.columns.len()).map(move |i| format!("{}_{}", block.name, i)))
            .collect()
    }

    /// The block holding the basis of the first signal of `kind`.
    pub fn block_of(&self, kind: SignalKind) -> Option<&BasisBlock> {
        self.blocks
            .iter()
            .find(|block| block.members.iter().any(|&m| self.signals[m].kind() == kind))
    }

    pub fn signal(&self, kind: SignalKind) -> Option<&dyn Signal> {
        self.signals.iter().find(|s| s.kind() == kind).map(|s| s.as_ref())
    }

    pub fn has_signal(&self, kind: SignalKind) -> bool {
        self.signal(kind).is_some()
    }

    pub fn ecorr(&self) -> Option<&BasisEcorr> {
        self.ecorr.as_ref()
    }

    /// Prior on the free spectrum components, if the model has one.
    pub fn rho_prior(&self) -> Option<Prior> {
        self.params.iter().find(|p| p.kind == ParameterKind::Rho).map(|p| p.prior)
    }

    /// Prior variances of one signal's basis coefficients.
    pub fn signal_phi(&self, kind: SignalKind, params: &ParamMap) -> Result<Option<DVector<f64>>> {
        match self.signal(kind) {
            Some(signal) => signal.get_phi(params),
            None => Ok(None),
        }
    }

    /// Diagonal of the white noise covariance N.
    pub fn get_ndiag(&self, params: &ParamMap) -> Result<DVector<f64>> {
        let mut ndiag = DVector::zeros(self.residuals.len());
        for signal in &self.signals {
            if let Some(contribution) = signal.get_ndiag(params)? {
                ndiag += contribution;
            }
        }
        Ok(ndiag)
    }

    /// Prior variances of every basis coefficient. Signals sharing a block add.
    pub fn get_phi(&self, params: &ParamMap) -> Result<DVector<f64>> {
        let mut phi = DVector::zeros(self.basis.ncols());
        for block in &self.blocks {
            for &member in &block.members {
                if let Some(member_phi) = self.signals[member].get_phi(params)? {
                    let mut rows = phi.rows_mut(block.columns.start, block.columns.len());
                    rows += member_phi;
                }
            }
        }
        Ok(phi)
    }

    /// Inverse prior variances and the log determinant of phi.
    pub fn get_phiinv(&self, params: &ParamMap) -> Result<(DVector<f64>, f64)> {
        let phi = self.get_phi(params)?;
        let logdet = phi.iter().map(|x| x.ln()).sum();
        Ok((phi.map(f64::recip), logdet))
    }

    /// Log likelihood with every Gaussian process marginalized analytically:
    ///
    /// `-1/2 (r^T N^-1 r + ln|N|) + 1/2 (d^T Sigma^-1 d - ln|Sigma| - ln|phi|)`,
    /// with `Sigma = T^T N^-1 T + phi^-1` and `d = T^T N^-1 r`.
    /// Returns `-inf` when Sigma is not positive definite.
    pub fn get_lnlikelihood(&self, xs: &[f64]) -> Result<f64> {
        let params = self.map_params(xs)?;
        let ndiag = self.get_ndiag(&params)?;
        let (phiinv, logdet_phi) = self.get_phiinv(&params)?;

        let (tnt, d) = tnt_and_d(&self.basis, &ndiag, &self.residuals);
        Ok(marginalized_lnlikelihood(&self.residuals, &ndiag, &tnt, &d, &phiinv, logdet_phi))
    }
}

/// `T^T N^-1 T` and `T^T N^-1 r` for diagonal N.
pub fn tnt_and_d(t: &DMatrix<f64>, ndiag: &DVector<f64>, residuals: &DVector<f64>) -> (DMatrix<f64>, DVector<f64>) {
    let mut t_over_n = t.clone();
    for (mut row, n) in t_over_n.row_iter_mut().zip(ndiag.iter()) {
        row /= *n;
    }
    (t.transpose() * &t_over_n, t_over_n.transpose() * residuals)
}

pub fn marginalized_lnlikelihood(
    residuals: &DVector<f64>,
    ndiag: &DVector<f64>,
    tnt: &DMatrix<f64>,
    d: &DVector<f64>,
    phiinv: &DVector<f64>,
    logdet_phi: f64,
) -> f64 {
    // White noise piece
    let logdet_n: f64 = ndiag.iter().map(|n| n.ln()).sum();
    let rnr: f64 = residuals.iter().zip(ndiag.iter()).map(|(r, n)| r * r / n).sum();
    let mut loglike = -0.5 * (logdet_n + rnr);

    // Gaussian process piece
    let sigma = tnt + DMatrix::from_diagonal(phiinv);
    let Some(cholesky) = sigma.cholesky() else {
        return f64::NEG_INFINITY;
    };
    let expval = cholesky.solve(d);
    let logdet_sigma: f64 = cholesky.l().diagonal().iter().map(|x| 2.0 * x.ln()).sum();

    loglike += 0.5 * (d.dot(&expval) - logdet_sigma - logdet_phi);
    loglike
}

#[cfg(test)]
pub(crate) fn test_pulsar(seed: u64) -> Pulsar {
    use crate::simulate::{simulate_pulsar, SimulationConfig};
    let config = SimulationConfig {
        ntoas: 60,
        backends: vec!["ASP".to_string(), "GUPPI".to_string()],
        toas_per_epoch: 2,
        seed,
        ..SimulationConfig::default()
    };
    let (par, toas) = simulate_pulsar(&config);
    Pulsar::from_parts(par, toas).unwrap()
}

#[test]
fn test_param_names_sorted_and_expanded() {
    let psr = test_pulsar(1);
    let config = ModelConfig {
        common_components: 5,
        red_components: 5,
        ..ModelConfig::default()
    };
    let model = model_general(&psr, &config).unwrap();
    let names = model.param_names();

    // 2 backends x (efac + equad) + red (2) + rho (5)
    assert_eq!(names.len(), 4 + 2 + 5);
    assert_eq!(model.ndim(), names.len());
    assert_eq!(names[0], "J1234+5678_ASP_efac");
    assert_eq!(names[2], "J1234+5678_GUPPI_efac");
    assert_eq!(names[4], "J1234+5678_red_noise_gamma");
    assert_eq!(names[5], "J1234+5678_red_noise_log10_A");
    assert_eq!(names[6], "gw_log10_rho_0");

    let red = model.indices_where(|k| k.is_red());
    assert_eq!(red, vec![4, 5]);
}

#[test]
fn test_red_and_free_spectrum_share_basis() {
    let psr = test_pulsar(2);
    let config = ModelConfig {
        common_components: 5,
        red_components: 5,
        ..ModelConfig::default()
    };
    let model = model_general(&psr, &config).unwrap();

    // Timing model (3) + shared Fourier (10)
    assert_eq!(model.get_basis().ncols(), 13);
    assert_eq!(model.blocks().len(), 2);
    let fourier = model.block_of(SignalKind::FreeSpectrum).unwrap();
    assert_eq!(fourier.columns, 3..13);
    assert_eq!(fourier.name, "gw");
    assert_eq!(model.block_of(SignalKind::RedNoise).unwrap().columns, 3..13);
    assert_eq!(model.basis_names()[3], "gw_0");

    // phi is the sum of red and free spectrum variances
    let x = model.sample_initial(&mut rand::thread_rng());
    let params = model.map_params(x.as_slice()).unwrap();
    let phi = model.get_phi(&params).unwrap();
    let red = model.signal_phi(SignalKind::RedNoise, &params).unwrap().unwrap();
    let gw = model.signal_phi(SignalKind::FreeSpectrum, &params).unwrap().unwrap();
    for i in 0..10 {
        assert!((phi[3 + i] - red[i] - gw[i]).abs() <= 1e-12 * phi[3 + i]);
    }
}

#[test]
fn test_different_components_do_not_share_basis() {
    let psr = test_pulsar(3);
    let config = ModelConfig {
        common_components: 4,
        red_components: 6,
        ..ModelConfig::default()
    };
    let model = model_general(&psr, &config).unwrap();
    assert_eq!(model.get_basis().ncols(), 3 + 12 + 8);
    assert_eq!(model.blocks().len(), 3);
}

#[test]
fn test_map_params_checks_length() {
    let psr = test_pulsar(4);
    let model = model_general(&psr, &ModelConfig::default()).unwrap();
    let err = model.map_params(&[0.0; 3]).unwrap_err();
    assert!(matches!(err, GibbsError::DimensionMismatch { actual: 3, .. }));
}

#[test]
fn test_lnprior_outside_bounds() {
    let psr = test_pulsar(5);
    let model = model_general(&psr, &ModelConfig::default()).unwrap();
    let mut x = model.sample_initial(&mut rand::thread_rng());
    assert!(model.get_lnprior(x.as_slice()).unwrap().is_finite());

    x[0] = 100.0;
    assert_eq!(model.get_lnprior(x.as_slice()).unwrap(), f64::NEG_INFINITY);
}

#[test]
fn test_marginalized_likelihood_matches_dense_gaussian() {
    // With a tiny model, compare against the log density of N(0, N + T phi T^T)
    let t = DMatrix::from_row_slice(3, 1, &[1.0, 2.0, -1.0]);
    let ndiag = DVector::from_vec(vec![1.0, 2.0, 0.5]);
    let r = DVector::from_vec(vec![0.3, -0.2, 1.1]);
    let phi = 2.0;

    let (tnt, d) = tnt_and_d(&t, &ndiag, &r);
    let phiinv = DVector::from_element(1, 1.0 / phi);
    let loglike = marginalized_lnlikelihood(&r, &ndiag, &tnt, &d, &phiinv, phi.ln());

    let c = DMatrix::from_diagonal(&ndiag) + &t * t.transpose() * phi;
    let c_inv = c.clone().try_inverse().unwrap();
    let expected = -0.5 * (r.dot(&(c_inv * &r)) + c.determinant().ln());
    assert!((loglike - expected).abs() < 1e-10);
}

#[test]
fn test_fixed_white_noise_from_noise_dict() {
    let psr = test_pulsar(6);
    let mut dict = HashMap::new();
    dict.insert("J1234+5678_ASP_efac".to_string(), 2.0);
    dict.insert("J1234+5678_GUPPI_efac".to_string(), 1.0);
    let config = ModelConfig {
        white_vary: false,
        tnequad: false,
        common_components: 3,
        red_components: 3,
        noise_dict: Some(dict),
        ..ModelConfig::default()
    };
    let model = model_general(&psr, &config).unwrap();
    assert!(model.indices_where(|k| k.is_white()).is_empty());

    let x = model.sample_initial(&mut rand::thread_rng());
    let ndiag = model.get_ndiag(&model.map_params(x.as_slice()).unwrap()).unwrap();
    for i in 0..psr.len() {
        let efac = if psr.backend_flags[i] == "ASP" { 2.0 } else { 1.0 };
        assert!((ndiag[i] - (efac * psr.toaerrs[i]).powi(2)).abs() < 1e-24);
    }
}

#[test]
fn test_ecorr_basis_columns() {
    let psr = test_pulsar(7);
    let config = ModelConfig {
        inc_ecorr: true,
        common_components: 3,
        red_components: 3,
        ..ModelConfig::default()
    };
    let model = model_general(&psr, &config).unwrap();
    let ecorr = model.ecorr().unwrap();
    assert_eq!(ecorr.groups().len(), 2);

    // 60 TOAs in pairs over two backends gives 30 epochs
    let block = model.block_of(SignalKind::BasisEcorr).unwrap();
    assert_eq!(block.columns.len(), 30);
    assert_eq!(model.indices_where(|k| k == ParameterKind::Ecorr).len(), 2);
}
