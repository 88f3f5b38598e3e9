//! Integrated autocorrelation time, after Goodman's `acor`: the
//! autocovariance is summed over a fixed window, and when the estimate is
//! long compared to the window the series is halved by summing neighbouring
//! pairs and the estimate repeated on the shorter series.

/// Autocovariance lags summed at each level
const MAXLAG: usize = 40;

/// The window must be this many times longer than the autocorrelation time
const WINMULT: f64 = 5.0;

/// A series must hold this many windows to be analysed
const MINFAC: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Acor {
    pub mean: f64,
    /// Standard error of the mean
    pub sigma: f64,
    /// Integrated autocorrelation time, in samples
    pub tau: f64,
}

/// Estimates the autocorrelation time of `series`. Returns `None` when the
/// series is too short to estimate anything.
pub fn acor(series: &[f64]) -> Option<Acor> {
    if series.is_empty() {
        return None;
    }
    let mean = series.iter().sum::<f64>() / series.len() as f64;
    let centered: Vec<f64> = series.iter().map(|x| x - mean).collect();

    let (sigma, tau) = centered_acor(&centered)?;
    Some(Acor { mean, sigma, tau })
}

fn centered_acor(x: &[f64]) -> Option<(f64, f64)> {
    let n = x.len();
    if n < MINFAC * MAXLAG {
        return None;
    }

    let imax = n - MAXLAG;
    let autocov: Vec<f64> = (0..=MAXLAG)
        .map(|lag| (0..imax).map(|i| x[i] * x[i + lag]).sum::<f64>() / imax as f64)
        .collect();

    // A constant series is uncorrelated
    if autocov[0] == 0.0 {
        return Some((0.0, 1.0));
    }

    let d = autocov[0] + 2.0 * autocov[1..].iter().sum::<f64>();
    let sigma = (d / n as f64).sqrt();
    let tau = d / autocov[0];
    if tau * WINMULT < MAXLAG as f64 {
        return Some((sigma, tau));
    }

    // Window too short: repeat on pairwise sums
    let pairs: Vec<f64> = x.chunks_exact(2).map(|pair| pair[0] + pair[1]).collect();
    let pair_mean = pairs.iter().sum::<f64>() / pairs.len() as f64;
    let pairs: Vec<f64> = pairs.iter().map(|p| p - pair_mean).collect();

    match centered_acor(&pairs) {
        Some((pair_sigma, _)) => {
            let d = 0.25 * pair_sigma * pair_sigma * n as f64;
            Some(((d / n as f64).sqrt(), d / autocov[0]))
        }
        None => Some((sigma, tau)),
    }
}

#[cfg(test)]
fn ar1(n: usize, phi: f64, seed: u64) -> Vec<f64> {
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut value = 0.0;
    (0..n)
        .map(|_| {
            value = phi * value + rng.sample::<f64, _>(StandardNormal);
            value
        })
        .collect()
}

#[test]
fn test_white_noise_has_unit_tau() {
    let series = ar1(5000, 0.0, 1);
    let result = acor(&series).unwrap();
    assert!(result.tau > 0.5 && result.tau < 2.0, "tau was {}", result.tau);
    assert!(result.mean.abs() < 0.1);
}

#[test]
fn test_correlated_series_tau() {
    // tau = (1 + phi) / (1 - phi) = 19 for phi = 0.9
    let series = ar1(50_000, 0.9, 2);
    let result = acor(&series).unwrap();
    assert!(result.tau > 12.0 && result.tau < 28.0, "tau was {}", result.tau);
}

#[test]
fn test_short_series_is_rejected() {
    assert!(acor(&[1.0; 100]).is_none());
    assert!(acor(&[]).is_none());
}

#[test]
fn test_constant_series() {
    let result = acor(&[3.0; 400]).unwrap();
    assert_eq!(result.tau, 1.0);
    assert_eq!(result.mean, 3.0);
}
