//! Fake pulsar datasets with known white and red noise, for demonstrations
//! and tests.
use crate::constants::SECONDS_PER_DAY;
use crate::error::Result;
use crate::model::basis::FourierBasis;
use crate::model::signals::powerlaw;
use crate::utils::loader::{Mjd, ParFile, Toa};
use nalgebra::DVector;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub name: String,
    pub f0: f64,
    pub f1: f64,
    pub pepoch: f64,
    pub ntoas: usize,
    pub span_years: f64,
    /// TOAs per observing epoch, recorded at the same time on different channels
    pub toas_per_epoch: usize,
    pub backends: Vec<String>,
    pub toaerr_us: f64,
    pub efac: f64,
    pub log10_equad: Option<f64>,
    /// Power-law red noise amplitude and spectral index
    pub red_noise: Option<(f64, f64)>,
    pub red_components: usize,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            name: "J1234+5678".to_string(),
            f0: 218.81184385,
            f1: 0.0,
            pepoch: 55000.0,
            ntoas: 200,
            span_years: 5.0,
            toas_per_epoch: 1,
            backends: vec!["ASP".to_string()],
            toaerr_us: 1.0,
            efac: 1.0,
            log10_equad: None,
            red_noise: Some((-13.0, 4.0)),
            red_components: 30,
            seed: 0,
        }
    }
}

/// Simulates TOAs of a pulsar obeying the spin-down model in its par file,
/// perturbed by white noise and optional power-law red noise.
pub fn simulate_pulsar(config: &SimulationConfig) -> (ParFile, Vec<Toa>) {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.seed);

    let pepoch = Mjd {
        day: config.pepoch.floor() as i64,
        frac: config.pepoch - config.pepoch.floor(),
    };
    let par = ParFile {
        name: config.name.clone(),
        f0: config.f0,
        f1: config.f1,
        pepoch,
        entries: HashMap::new(),
    };

    // Epochs evenly spread over the span, with some scatter
    let toas_per_epoch = config.toas_per_epoch.max(1);
    let nepochs = (config.ntoas / toas_per_epoch).max(1);
    let span = config.span_years * 365.25 * SECONDS_PER_DAY;
    let cadence = span / nepochs as f64;
    let epoch_times: Vec<f64> = (0..nepochs)
        .map(|k| k as f64 * cadence + rng.gen_range(0.0..0.5) * cadence)
        .collect();

    // Pulse arrival times nearest each requested time
    let times: Vec<f64> = epoch_times
        .iter()
        .flat_map(|&t| std::iter::repeat(nearest_pulse(&par, t)).take(toas_per_epoch))
        .collect();
    let ntoas = times.len();
    let times_vec = DVector::from_vec(times.clone());

    // White noise
    let equad_variance = config.log10_equad.map(|q| 10_f64.powf(2.0 * q)).unwrap_or(0.0);
    let sigma = config.toaerr_us * 1e-6;
    let white_std = (config.efac * config.efac * sigma * sigma + equad_variance).sqrt();
    let mut delays = DVector::from_iterator(
        ntoas,
        (0..ntoas).map(|_| white_std * rng.sample::<f64, _>(StandardNormal)),
    );

    // Red noise as a random draw of Fourier coefficients
    if let Some((log10_a, gamma)) = config.red_noise {
        let basis = FourierBasis::new(&times_vec, config.red_components, span);
        let phi = powerlaw(&basis.freqs, &basis.df, log10_a, gamma);
        let coefficients = phi.map(|p| p.sqrt() * rng.sample::<f64, _>(StandardNormal));
        delays += &basis.matrix * coefficients;
    }

    let toas = times
        .iter()
        .zip(delays.iter())
        .enumerate()
        .map(|(i, (&t, &delay))| {
            let backend = &config.backends[(i / toas_per_epoch) % config.backends.len()];
            let mut flags = BTreeMap::new();
            flags.insert("f".to_string(), backend.clone());
            flags.insert("be".to_string(), backend.clone());
            Toa {
                name: format!("fake_{i}"),
                freq_mhz: 1400.0 + 100.0 * (i % toas_per_epoch) as f64,
                mjd: pepoch.add_seconds(t + delay),
                error_us: config.toaerr_us,
                site: "ao".to_string(),
                flags,
            }
        })
        .collect();

    (par, toas)
}

/// Arrival time (seconds after PEPOCH) of the pulse nearest to `t`.
fn nearest_pulse(par: &ParFile, t: f64) -> f64 {
    let phase = |t: f64| par.f0 * t + 0.5 * par.f1 * t * t;
    let pulse = phase(t).round();

    // Newton iterations on phase(t) = pulse
    let mut t = t;
    for _ in 0..3 {
        t -= (phase(t) - pulse) / (par.f0 + par.f1 * t);
    }
    t
}

/// Writes a minimal tempo2-style par file.
pub fn write_par(path: impl AsRef<Path>, par: &ParFile) -> Result<()> {
    let mut text = String::new();
    let _ = writeln!(text, "PSRJ           {}", par.name);
    let _ = writeln!(text, "F0             {}  1", par.f0);
    let _ = writeln!(text, "F1             {:e}  1", par.f1);
    let _ = writeln!(text, "PEPOCH         {}", par.pepoch);
    fs::write(path, text)?;
    Ok(())
}

/// Writes TOAs as a tempo2 `FORMAT 1` tim file.
pub fn write_tim(path: impl AsRef<Path>, toas: &[Toa]) -> Result<()> {
    let mut text = String::from("FORMAT 1\n");
    for toa in toas {
        let _ = write!(
            text,
            "{} {:.6} {} {:.3} {}",
            toa.name, toa.freq_mhz, toa.mjd, toa.error_us, toa.site
        );
        for (key, value) in &toa.flags {
            let _ = write!(text, " -{key} {value}");
        }
        text.push('\n');
    }
    fs::write(path, text)?;
    Ok(())
}

#[test]
fn test_simulated_white_noise_level() {
    use crate::pulsar::Pulsar;

    let config = SimulationConfig {
        ntoas: 400,
        toaerr_us: 2.0,
        red_noise: None,
        ..SimulationConfig::default()
    };
    let (par, toas) = simulate_pulsar(&config);
    let psr = Pulsar::from_parts(par, toas).unwrap();

    // Post-fit rms should be close to the injected 2 us
    let rms = (psr.residuals.norm_squared() / psr.len() as f64).sqrt();
    assert!((rms - 2e-6).abs() < 0.3e-6, "rms was {rms}");
}

#[test]
fn test_simulated_epochs_and_backends() {
    let config = SimulationConfig {
        ntoas: 12,
        toas_per_epoch: 3,
        backends: vec!["A".to_string(), "B".to_string()],
        ..SimulationConfig::default()
    };
    let (_, toas) = simulate_pulsar(&config);

    assert_eq!(toas.len(), 12);
    assert_eq!(toas[0].flags["f"], "A");
    assert_eq!(toas[2].flags["f"], "A");
    assert_eq!(toas[3].flags["f"], "B");
    assert_eq!(toas[1].freq_mhz, 1500.0);
}

#[test]
fn test_written_files_load_back() {
    use crate::pulsar::Pulsar;

    let dir = tempfile::tempdir().unwrap();
    let (par, toas) = simulate_pulsar(&SimulationConfig {
        ntoas: 50,
        ..SimulationConfig::default()
    });
    write_par(dir.path().join("fake.par"), &par).unwrap();
    write_tim(dir.path().join("fake.tim"), &toas).unwrap();

    let from_files = Pulsar::new(dir.path().join("fake.par"), dir.path().join("fake.tim")).unwrap();
    let in_memory = Pulsar::from_parts(par, toas).unwrap();

    assert_eq!(from_files.name, "J1234+5678");
    assert_eq!(from_files.len(), 50);
    for (a, b) in from_files.residuals.iter().zip(in_memory.residuals.iter()) {
        assert!((a - b).abs() < 1e-9);
    }
}
