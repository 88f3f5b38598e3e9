use super::basis::{quantization_matrix, quantize_epochs, FourierBasis};
use super::parameter::{Parameter, ParameterKind, Prior};
use super::ParamMap;
use crate::constants::{FYR, TIMING_MODEL_PHI};
use crate::error::Result;
use crate::pulsar::{normalize_columns, Pulsar};
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt::Debug;
use std::ops::Range;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SignalKind {
    MeasurementNoise,
    TimingModel,
    RedNoise,
    FreeSpectrum,
    BasisEcorr,
}

/// Identifies a basis. Signals with equal keys share basis columns, and their
/// prior variances add.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum BasisKey {
    TimingModel,
    Fourier { components: usize, tspan: f64 },
    Ecorr,
}

/// A noise or signal process in the timing model. White noise processes
/// contribute to the diagonal of N; Gaussian processes contribute a basis T
/// and the prior variances phi of its coefficients.
pub trait Signal: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SignalKind;

    /// Free parameters of this signal.
    fn params(&self) -> Vec<Parameter>;

    /// Contribution to the diagonal white noise covariance.
    fn get_ndiag(&self, _params: &ParamMap) -> Result<Option<DVector<f64>>> {
        Ok(None)
    }

    fn get_basis(&self) -> Option<&DMatrix<f64>> {
        None
    }

    fn basis_key(&self) -> Option<BasisKey> {
        None
    }

    /// Prior variance of each basis coefficient.
    fn get_phi(&self, _params: &ParamMap) -> Result<Option<DVector<f64>>> {
        Ok(None)
    }
}

/// Either a free parameter or a value held fixed.
#[derive(Debug, Clone)]
pub enum Coefficient {
    Free(Parameter),
    Fixed(f64),
}

impl Coefficient {
    fn value(&self, params: &ParamMap) -> Result<f64> {
        match self {
            Coefficient::Free(param) => params.scalar(&param.name),
            Coefficient::Fixed(value) => Ok(*value),
        }
    }

    fn param(&self) -> Option<&Parameter> {
        match self {
            Coefficient::Free(param) => Some(param),
            Coefficient::Fixed(_) => None,
        }
    }
}

/// White noise per backend: `N_i = efac^2 sigma_i^2 + 10^(2 log10_tnequad)`.
#[derive(Debug, Clone)]
pub struct MeasurementNoise {
    name: String,
    toaerrs: DVector<f64>,
    /// (TOA indices, efac, equad) per backend
    backends: Vec<(Vec<usize>, Coefficient, Option<Coefficient>)>,
}

impl MeasurementNoise {
    /// When `vary` is false, values come from `noise_dict`; a missing EFAC
    /// defaults to one and a missing EQUAD is left out.
    pub fn new(
        psr: &Pulsar,
        vary: bool,
        tnequad: bool,
        efac_prior: Prior,
        equad_prior: Prior,
        noise_dict: Option<&HashMap<String, f64>>,
    ) -> Self {
        let backends = psr
            .backends()
            .into_iter()
            .map(|backend| {
                let members = backend_members(psr, &backend);
                let efac_name = format!("{}_{}_efac", psr.name, backend);
                let equad_name = format!("{}_{}_log10_tnequad", psr.name, backend);

                let (efac, equad) = if vary {
                    (
                        Coefficient::Free(Parameter::new(efac_name, efac_prior, ParameterKind::Efac)),
                        tnequad.then(|| {
                            Coefficient::Free(Parameter::new(equad_name, equad_prior, ParameterKind::Equad))
                        }),
                    )
                } else {
                    let lookup = |name: &str| noise_dict.and_then(|dict| dict.get(name)).copied();
                    let efac = lookup(&efac_name).unwrap_or_else(|| {
                        log::warn!("no fixed value for {efac_name}, using 1.0");
                        1.0
                    });
                    let equad = if tnequad { lookup(&equad_name) } else { None };
                    (Coefficient::Fixed(efac), equad.map(Coefficient::Fixed))
                };

                (members, efac, equad)
            })
            .collect();

        MeasurementNoise {
            name: format!("{}_measurement_noise", psr.name),
            toaerrs: psr.toaerrs.clone(),
            backends,
        }
    }
}

impl Signal for MeasurementNoise {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SignalKind {
        SignalKind::MeasurementNoise
    }

    fn params(&self) -> Vec<Parameter> {
        self.backends
            .iter()
            .flat_map(|(_, efac, equad)| {
                efac.param()
                    .cloned()
                    .into_iter()
                    .chain(equad.as_ref().and_then(Coefficient::param).cloned())
            })
            .collect()
    }

    fn get_ndiag(&self, params: &ParamMap) -> Result<Option<DVector<f64>>> {
        let mut ndiag = DVector::zeros(self.toaerrs.len());

        for (members, efac, equad) in &self.backends {
            let efac = efac.value(params)?;
            let equad_variance = match equad {
                Some(equad) => 10_f64.powf(2.0 * equad.value(params)?),
                None => 0.0,
            };

            for &i in members {
                ndiag[i] = efac * efac * self.toaerrs[i] * self.toaerrs[i] + equad_variance;
            }
        }

        Ok(Some(ndiag))
    }
}

/// Linearized timing model with an effectively infinite prior variance.
#[derive(Debug, Clone)]
pub struct TimingModel {
    name: String,
    basis: DMatrix<f64>,
}

impl TimingModel {
    pub fn new(psr: &Pulsar) -> Self {
        TimingModel {
            name: format!("{}_linear_timing_model", psr.name),
            basis: normalize_columns(&psr.design_matrix),
        }
    }
}

impl Signal for TimingModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SignalKind {
        SignalKind::TimingModel
    }

    fn params(&self) -> Vec<Parameter> {
        vec![]
    }

    fn get_basis(&self) -> Option<&DMatrix<f64>> {
        Some(&self.basis)
    }

    fn basis_key(&self) -> Option<BasisKey> {
        Some(BasisKey::TimingModel)
    }

    fn get_phi(&self, _params: &ParamMap) -> Result<Option<DVector<f64>>> {
        Ok(Some(DVector::from_element(self.basis.ncols(), TIMING_MODEL_PHI)))
    }
}

/// Intrinsic red noise with a power-law spectrum.
#[derive(Debug, Clone)]
pub struct RedNoise {
    name: String,
    basis: FourierBasis,
    log10_a: Parameter,
    gamma: Parameter,
}

impl RedNoise {
    pub fn new(psr: &Pulsar, components: usize, tspan: f64, log10_a_prior: Prior, gamma_prior: Prior) -> Self {
        let name = format!("{}_red_noise", psr.name);
        RedNoise {
            log10_a: Parameter::new(format!("{name}_log10_A"), log10_a_prior, ParameterKind::RedAmplitude),
            gamma: Parameter::new(format!("{name}_gamma"), gamma_prior, ParameterKind::RedIndex),
            basis: FourierBasis::new(&psr.toas, components, tspan),
            name,
        }
    }
}

/// Power-law spectrum evaluated on the basis frequencies.
pub fn powerlaw(freqs: &DVector<f64>, df: &DVector<f64>, log10_a: f64, gamma: f64) -> DVector<f64> {
    let amplitude2 = 10_f64.powf(2.0 * log10_a);
    freqs.zip_map(df, |f, df| {
        amplitude2 / (12.0 * PI * PI) * FYR.powf(gamma - 3.0) * f.powf(-gamma) * df
    })
}

impl Signal for RedNoise {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SignalKind {
        SignalKind::RedNoise
    }

    fn params(&self) -> Vec<Parameter> {
        vec![self.log10_a.clone(), self.gamma.clone()]
    }

    fn get_basis(&self) -> Option<&DMatrix<f64>> {
        Some(&self.basis.matrix)
    }

    fn basis_key(&self) -> Option<BasisKey> {
        Some(BasisKey::Fourier {
            components: self.basis.components(),
            tspan: self.basis.tspan,
        })
    }

    fn get_phi(&self, params: &ParamMap) -> Result<Option<DVector<f64>>> {
        let log10_a = params.scalar(&self.log10_a.name)?;
        let gamma = params.scalar(&self.gamma.name)?;
        Ok(Some(powerlaw(&self.basis.freqs, &self.basis.df, log10_a, gamma)))
    }
}

/// Common process with an independent variance `rho_k = 10^(2 log10_rho_k)`
/// at each frequency.
#[derive(Debug, Clone)]
pub struct FreeSpectrum {
    name: String,
    basis: FourierBasis,
    log10_rho: Parameter,
}

impl FreeSpectrum {
    pub fn new(psr: &Pulsar, components: usize, tspan: f64, rho_prior: Prior) -> Self {
        FreeSpectrum {
            name: "gw".to_string(),
            basis: FourierBasis::new(&psr.toas, components, tspan),
            log10_rho: Parameter::vector("gw_log10_rho", rho_prior, ParameterKind::Rho, components),
        }
    }

    pub fn rho_prior(&self) -> Prior {
        self.log10_rho.prior
    }
}

impl Signal for FreeSpectrum {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SignalKind {
        SignalKind::FreeSpectrum
    }

    fn params(&self) -> Vec<Parameter> {
        vec![self.log10_rho.clone()]
    }

    fn get_basis(&self) -> Option<&DMatrix<f64>> {
        Some(&self.basis.matrix)
    }

    fn basis_key(&self) -> Option<BasisKey> {
        Some(BasisKey::Fourier {
            components: self.basis.components(),
            tspan: self.basis.tspan,
        })
    }

    fn get_phi(&self, params: &ParamMap) -> Result<Option<DVector<f64>>> {
        let log10_rho = params.vector(&self.log10_rho.name)?;
        Ok(Some(DVector::from_iterator(
            2 * log10_rho.len(),
            log10_rho.iter().flat_map(|&x| {
                let rho = 10_f64.powf(2.0 * x);
                [rho, rho]
            }),
        )))
    }
}

/// ECORR epochs of one backend: the coefficient controlling them and the
/// columns they occupy in the ECORR basis.
#[derive(Debug, Clone)]
pub struct EcorrGroup {
    pub backend: String,
    pub coefficient: Coefficient,
    pub columns: Range<usize>,
}

impl EcorrGroup {
    pub fn param_name(&self) -> Option<&str> {
        self.coefficient.param().map(|p| p.name.as_str())
    }
}

/// Per-epoch correlated white noise, modeled with an explicit epoch basis so
/// that its coefficients can be sampled.
#[derive(Debug, Clone)]
pub struct BasisEcorr {
    name: String,
    basis: DMatrix<f64>,
    groups: Vec<EcorrGroup>,
}

impl BasisEcorr {
    pub fn new(psr: &Pulsar, vary: bool, ecorr_prior: Prior, noise_dict: Option<&HashMap<String, f64>>) -> Self {
        let mut epochs = vec![];
        let mut groups = vec![];

        for backend in psr.backends() {
            let members = backend_members(psr, &backend);
            let backend_epochs = quantize_epochs(&psr.toas, &members);
            let param_name = format!("{}_{}_log10_ecorr", psr.name, backend);

            let coefficient = if vary {
                Coefficient::Free(Parameter::new(param_name, ecorr_prior, ParameterKind::Ecorr))
            } else {
                match noise_dict.and_then(|dict| dict.get(&param_name)) {
                    Some(&value) => Coefficient::Fixed(value),
                    None => {
                        log::warn!("no fixed value for {param_name}, dropping ECORR for {backend}");
                        continue;
                    }
                }
            };

            log::debug!("backend {backend} has {} ECORR epochs", backend_epochs.len());
            let start = epochs.len();
            epochs.extend(backend_epochs);
            groups.push(EcorrGroup {
                backend,
                coefficient,
                columns: start..epochs.len(),
            });
        }

        BasisEcorr {
            name: format!("{}_basis_ecorr", psr.name),
            basis: quantization_matrix(psr.len(), &epochs),
            groups,
        }
    }

    pub fn groups(&self) -> &[EcorrGroup] {
        &self.groups
    }

    pub fn ecorr_prior(&self) -> Option<Prior> {
        self.groups.iter().find_map(|g| g.coefficient.param().map(|p| p.prior))
    }
}

impl Signal for BasisEcorr {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SignalKind {
        SignalKind::BasisEcorr
    }

    fn params(&self) -> Vec<Parameter> {
        self.groups
            .iter()
            .filter_map(|group| group.coefficient.param().cloned())
            .collect()
    }

    fn get_basis(&self) -> Option<&DMatrix<f64>> {
        Some(&self.basis)
    }

    fn basis_key(&self) -> Option<BasisKey> {
        Some(BasisKey::Ecorr)
    }

    fn get_phi(&self, params: &ParamMap) -> Result<Option<DVector<f64>>> {
        let mut phi = DVector::zeros(self.basis.ncols());
        for group in &self.groups {
            let variance = 10_f64.powf(2.0 * group.coefficient.value(params)?);
            phi.rows_mut(group.columns.start, group.columns.len()).fill(variance);
        }
        Ok(Some(phi))
    }
}

fn backend_members(psr: &Pulsar, backend: &str) -> Vec<usize> {
    psr.backend_flags
        .iter()
        .enumerate()
        .filter(|(_, b)| b.as_str() == backend)
        .map(|(i, _)| i)
        .collect()
}

#[test]
fn test_powerlaw_scaling() {
    let freqs = DVector::from_vec(vec![1e-8, 1e-8, 2e-8, 2e-8]);
    let df = DVector::from_element(4, 1e-8);
    let phi = powerlaw(&freqs, &df, -14.0, 13.0 / 3.0);

    // Doubling the frequency lowers the power by 2^gamma
    assert!((phi[0] / phi[2] - 2_f64.powf(13.0 / 3.0)).abs() < 1e-9);
    assert_eq!(phi[0], phi[1]);
}

#[test]
fn test_powerlaw_at_reference_frequency() {
    // At f = fyr and gamma = 3 the spectrum is A^2 / (12 pi^2) fyr^-3 df
    let freqs = DVector::from_element(2, FYR);
    let df = DVector::from_element(2, 1.0);
    let phi = powerlaw(&freqs, &df, -15.0, 3.0);
    let expected = 1e-30 / (12.0 * PI * PI) * FYR.powi(-3);
    assert!((phi[0] / expected - 1.0).abs() < 1e-12);
}
