//! A single pulsar's timing data: TOAs, their uncertainties, post-fit residuals
//! and the timing model design matrix.
use crate::error::{GibbsError, Result};
use crate::utils::loader::{ParFile, TimFile, Toa};
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;
use std::path::Path;

/// Flags checked, in order, when deciding which backend recorded a TOA.
const BACKEND_FLAGS: [&str; 2] = ["f", "be"];

#[derive(Debug, Clone)]
pub struct Pulsar {
    pub name: String,
    /// TOAs in seconds relative to PEPOCH
    pub toas: DVector<f64>,
    /// TOA uncertainties in seconds
    pub toaerrs: DVector<f64>,
    /// Post-fit timing residuals in seconds
    pub residuals: DVector<f64>,
    /// Observing frequencies in MHz
    pub freqs: DVector<f64>,
    pub flags: Vec<BTreeMap<String, String>>,
    /// Backend that recorded each TOA
    pub backend_flags: Vec<String>,
    /// Timing model design matrix, one column per entry of `fitpars`
    pub design_matrix: DMatrix<f64>,
    pub fitpars: Vec<String>,
    pub par: ParFile,
}

impl Pulsar {
    /// Loads a pulsar from its parameter and TOA files.
    pub fn new(par_path: impl AsRef<Path>, tim_path: impl AsRef<Path>) -> Result<Pulsar> {
        let par = ParFile::from_path(par_path)?;
        let tim = TimFile::from_path(tim_path)?;
        Pulsar::from_parts(par, tim.toas)
    }

    /// Builds a pulsar from an already parsed timing model and TOA list.
    pub fn from_parts(par: ParFile, toas: Vec<Toa>) -> Result<Pulsar> {
        if toas.is_empty() {
            return Err(GibbsError::NoToas(par.name.clone()));
        }
        let n = toas.len();

        // Time since PEPOCH, split so the whole-day part stays exact
        let day_seconds: Vec<f64> = toas
            .iter()
            .map(|toa| (toa.mjd.day - par.pepoch.day) as f64 * crate::constants::SECONDS_PER_DAY)
            .collect();
        let frac_seconds: Vec<f64> = toas
            .iter()
            .map(|toa| (toa.mjd.frac - par.pepoch.frac) * crate::constants::SECONDS_PER_DAY)
            .collect();
        let dt = DVector::from_iterator(n, day_seconds.iter().zip(&frac_seconds).map(|(d, f)| d + f));

        // Pre-fit residuals from the spin-down model, wrapped to the nearest pulse
        let prefit = DVector::from_iterator(
            n,
            (0..n).map(|i| {
                let phase = wrap(par.f0 * day_seconds[i])
                    + wrap(par.f0 * frac_seconds[i])
                    + wrap(0.5 * par.f1 * dt[i] * dt[i]);
                wrap(phase) / par.f0
            }),
        );

        let toaerrs = DVector::from_iterator(n, toas.iter().map(|toa| toa.error_us * 1e-6));
        let freqs = DVector::from_iterator(n, toas.iter().map(|toa| toa.freq_mhz));

        // Linearized timing model: offset, F0 and F1
        let fitpars = vec!["Offset".to_string(), "F0".to_string(), "F1".to_string()];
        let design_matrix = DMatrix::from_fn(n, fitpars.len(), |i, j| match j {
            0 => 1.0,
            1 => dt[i] / par.f0,
            2 => 0.5 * dt[i] * dt[i] / par.f0,
            _ => unreachable!("three timing model columns"),
        });

        let residuals = weighted_fit_residuals(&design_matrix, &prefit, &toaerrs)?;

        let backend_flags = toas
            .iter()
            .map(|toa| {
                BACKEND_FLAGS
                    .iter()
                    .find_map(|flag| toa.flags.get(*flag))
                    .cloned()
                    .unwrap_or_else(|| toa.site.clone())
            })
            .collect();
        let flags = toas.into_iter().map(|toa| toa.flags).collect();

        log::info!(
            "loaded pulsar {} with {} TOAs, post-fit rms {:.3} us",
            par.name,
            n,
            (residuals.norm_squared() / n as f64).sqrt() * 1e6
        );

        Ok(Pulsar {
            name: par.name.clone(),
            toas: dt,
            toaerrs,
            residuals,
            freqs,
            flags,
            backend_flags,
            design_matrix,
            fitpars,
            par,
        })
    }

    /// Sorted, unique backend names.
    pub fn backends(&self) -> Vec<String> {
        let mut backends = self.backend_flags.clone();
        backends.sort();
        backends.dedup();
        backends
    }

    /// Time spanned by the TOAs in seconds.
    pub fn tspan(&self) -> f64 {
        self.toas.max() - self.toas.min()
    }

    pub fn len(&self) -> usize {
        self.toas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toas.is_empty()
    }
}

/// Distance to the nearest integer, in (-0.5, 0.5].
fn wrap(x: f64) -> f64 {
    x - x.round()
}

/// Subtracts the weighted least-squares fit of `design` from `residuals`.
fn weighted_fit_residuals(
    design: &DMatrix<f64>,
    residuals: &DVector<f64>,
    errors: &DVector<f64>,
) -> Result<DVector<f64>> {
    // Column normalization keeps the problem well conditioned
    let normed = normalize_columns(design);

    // Whiten both sides
    let a = DMatrix::from_fn(normed.nrows(), normed.ncols(), |i, j| normed[(i, j)] / errors[i]);
    let y = residuals.component_div(errors);

    let coefficients = a
        .svd(true, true)
        .solve(&y, 1e-12)
        .map_err(|e| GibbsError::LinAlg(e.to_string()))?;

    Ok(residuals - normed * coefficients)
}

/// Returns a copy of `m` with every nonzero column scaled to unit norm.
pub fn normalize_columns(m: &DMatrix<f64>) -> DMatrix<f64> {
    let mut normed = m.clone();
    for mut column in normed.column_iter_mut() {
        let norm = column.norm();
        if norm > 0.0 {
            column /= norm;
        }
    }
    normed
}

#[cfg(test)]
fn toa(mjd: &str, backend: &str) -> Toa {
    let mut flags = BTreeMap::new();
    flags.insert("f".to_string(), backend.to_string());
    Toa {
        name: "fake".to_string(),
        freq_mhz: 1400.0,
        mjd: crate::utils::loader::Mjd::parse(mjd).unwrap(),
        error_us: 1.0,
        site: "ao".to_string(),
        flags,
    }
}

#[cfg(test)]
fn par() -> ParFile {
    ParFile::parse("PSRJ J0000+0000\nF0 100.0\nF1 0.0\nPEPOCH 55000.0\n", "test.par").unwrap()
}

#[test]
fn test_residuals_vanish_for_exact_pulses() {
    // Every TOA is an integer number of pulses from PEPOCH
    let toas = (0..20)
        .map(|i| toa(&format!("{}.0", 55000 + 10 * i), if i % 2 == 0 { "A" } else { "B" }))
        .collect();
    let psr = Pulsar::from_parts(par(), toas).unwrap();

    assert_eq!(psr.len(), 20);
    assert!(psr.residuals.amax() < 1e-9);
    assert_eq!(psr.backends(), vec!["A".to_string(), "B".to_string()]);
    assert!((psr.tspan() - 190.0 * 86400.0).abs() < 1e-6);
}

#[test]
fn test_postfit_residuals_are_orthogonal_to_offset() {
    // A constant phase offset is absorbed by the timing model fit
    let toas = (0..30)
        .map(|i| toa(&format!("{}.00000001", 55000 + 7 * i), "A"))
        .collect();
    let psr = Pulsar::from_parts(par(), toas).unwrap();

    assert!(psr.residuals.sum().abs() < 1e-9);
    assert_eq!(psr.design_matrix.shape(), (30, 3));
}

#[test]
fn test_backend_falls_back_to_site() {
    let mut t = toa("55000.0", "A");
    t.flags.clear();
    let psr = Pulsar::from_parts(par(), vec![t.clone(), t]).unwrap();
    assert_eq!(psr.backend_flags, vec!["ao".to_string(), "ao".to_string()]);
}

#[test]
fn test_normalize_columns() {
    let m = DMatrix::from_row_slice(2, 2, &[3.0, 0.0, 4.0, 0.0]);
    let normed = normalize_columns(&m);
    assert!((normed[(0, 0)] - 0.6).abs() < 1e-12);
    assert_eq!(normed[(1, 1)], 0.0);
}
