//! Direct draws of variance hyperparameters from their conditional
//! posteriors given the Gaussian process coefficients.
//!
//! Every variance here has a prior that is uniform in its logarithm, so on a
//! grid uniform in `log(rho)` the prior weight of each point is the same.
use rand::distributions::Distribution;
use rand::Rng;
use rand_distr::Gumbel;

lazy_static! {
    static ref STANDARD_GUMBEL: Gumbel<f64> =
        Gumbel::new(0.0, 1.0).expect("unit Gumbel parameters are valid");
}

/// `n` points evenly spaced in `log10` between `min` and `max`, inclusive.
pub fn log_grid(min: f64, max: f64, n: usize) -> Vec<f64> {
    let (lo, hi) = (min.log10(), max.log10());
    if n < 2 {
        return vec![min];
    }
    let step = (hi - lo) / (n - 1) as f64;
    (0..n).map(|i| 10_f64.powf(lo + step * i as f64)).collect()
}

/// Index of a draw from the discrete distribution with unnormalised log
/// probabilities `logpdf`, using the Gumbel-max trick.
pub fn gumbel_argmax<R: Rng + ?Sized>(logpdf: impl IntoIterator<Item = f64>, rng: &mut R) -> usize {
    let mut best = (0, f64::NEG_INFINITY);
    for (i, lp) in logpdf.into_iter().enumerate() {
        let perturbed = lp + STANDARD_GUMBEL.sample(rng);
        if perturbed > best.1 {
            best = (i, perturbed);
        }
    }
    best.0
}

/// Draws the variance of a sine/cosine coefficient pair with mean square
/// `tau = (a^2 + b^2) / 2`, under a log-uniform prior on `[rhomin, rhomax]`.
///
/// `1/rho` is then exponentially distributed with rate `tau`, truncated to
/// `[1/rhomax, 1/rhomin]`, which inverts in closed form.
pub fn draw_rho_analytic<R: Rng + ?Sized>(tau: f64, rhomin: f64, rhomax: f64, rng: &mut R) -> f64 {
    let tau = tau.max(f64::MIN_POSITIVE);
    let upper = -(tau / rhomax - tau / rhomin).exp_m1();
    let eta = upper * rng.gen::<f64>();
    tau / (tau / rhomax - (-eta).ln_1p())
}

/// As [`draw_rho_analytic`], when the pair also carries a fixed variance
/// `irn` from another process. The conditional is evaluated on `grid`.
pub fn draw_rho_on_grid<R: Rng + ?Sized>(tau: f64, irn: f64, grid: &[f64], rng: &mut R) -> f64 {
    let ln_tau = tau.ln();
    let logpdf = grid.iter().map(|&rho| {
        let logratio = ln_tau - (irn + rho).ln();
        logratio - logratio.exp()
    });
    grid[gumbel_argmax(logpdf, rng)]
}

/// Draws the common variance of `n` independent zero-mean coefficients whose
/// squares sum to `sum_sq`, under a log-uniform prior covering `grid`.
pub fn draw_variance_on_grid<R: Rng + ?Sized>(n: usize, sum_sq: f64, grid: &[f64], rng: &mut R) -> f64 {
    let half_n = 0.5 * n as f64;
    let logpdf = grid
        .iter()
        .map(|&phi| -half_n * phi.ln() - 0.5 * sum_sq / phi);
    grid[gumbel_argmax(logpdf, rng)]
}

#[cfg(test)]
fn seeded(seed: u64) -> rand_xoshiro::Xoshiro256PlusPlus {
    use rand::SeedableRng;
    rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(seed)
}

#[test]
fn test_log_grid_endpoints() {
    let grid = log_grid(1e-20, 1e-8, 1000);
    assert_eq!(grid.len(), 1000);
    approx::assert_relative_eq!(grid[0], 1e-20, max_relative = 1e-12);
    approx::assert_relative_eq!(grid[999], 1e-8, max_relative = 1e-12);
    assert!(grid.windows(2).all(|w| w[1] > w[0]));
}

#[test]
fn test_gumbel_argmax_frequencies() {
    let mut rng = seeded(11);
    let probs = [0.2_f64, 0.5, 0.3];
    let mut counts = [0usize; 3];
    for _ in 0..30_000 {
        counts[gumbel_argmax(probs.iter().map(|p| p.ln()), &mut rng)] += 1;
    }
    for (count, p) in counts.iter().zip(probs) {
        approx::assert_abs_diff_eq!(*count as f64 / 30_000.0, p, epsilon = 0.015);
    }
}

#[test]
fn test_analytic_rho_within_prior() {
    let mut rng = seeded(12);
    let (rhomin, rhomax) = (1e-20, 1e-8);
    for tau in [1e-30, 1e-16, 1e-14, 1e-6] {
        for _ in 0..200 {
            let rho = draw_rho_analytic(tau, rhomin, rhomax, &mut rng);
            assert!(rho >= rhomin * (1.0 - 1e-9) && rho <= rhomax * (1.0 + 1e-9), "rho {rho} for tau {tau}");
        }
    }
}

#[test]
fn test_analytic_rho_inverse_is_exponential() {
    // Far from the prior edges, 1/rho ~ Exp(tau), so E[tau/rho] = 1
    let mut rng = seeded(13);
    let tau = 1e-14;
    let n = 20_000;
    let mean: f64 = (0..n)
        .map(|_| tau / draw_rho_analytic(tau, 1e-20, 1e-8, &mut rng))
        .sum::<f64>()
        / n as f64;
    approx::assert_abs_diff_eq!(mean, 1.0, epsilon = 0.03);
}

#[test]
fn test_grid_rho_matches_analytic_without_red_noise() {
    let mut rng = seeded(14);
    let tau = 1e-14;
    let grid = log_grid(1e-20, 1e-8, 1000);
    let n = 5000;

    let analytic: f64 = (0..n)
        .map(|_| draw_rho_analytic(tau, 1e-20, 1e-8, &mut rng).ln())
        .sum::<f64>()
        / n as f64;
    let gridded: f64 = (0..n)
        .map(|_| draw_rho_on_grid(tau, 0.0, &grid, &mut rng).ln())
        .sum::<f64>()
        / n as f64;
    approx::assert_abs_diff_eq!(analytic, gridded, epsilon = 0.1);
}

#[test]
fn test_grid_rho_is_suppressed_by_large_red_noise() {
    // When red noise alone explains tau, the free spectrum is pushed down
    let mut rng = seeded(15);
    let tau = 1e-14;
    let grid = log_grid(1e-20, 1e-8, 1000);
    let n = 2000;
    let below = (0..n)
        .filter(|_| draw_rho_on_grid(tau, tau, &grid, &mut rng) < tau)
        .count();
    assert!(below as f64 / n as f64 > 0.7);
}

#[test]
fn test_variance_on_grid_concentrates() {
    let mut rng = seeded(16);
    let grid = log_grid(1e-17, 1e-10, 1000);
    let variance = 1e-13;
    let n = 400;
    let mut draws: Vec<f64> = (0..501)
        .map(|_| draw_variance_on_grid(n, n as f64 * variance, &grid, &mut rng))
        .collect();
    draws.sort_by(|a, b| a.total_cmp(b));
    let median = draws[250];
    assert!((median / variance - 1.0).abs() < 0.2, "median was {median}");
}
