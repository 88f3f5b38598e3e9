use crate::error::{GibbsError, Result};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

/// SVD of a symmetric matrix, returning U and the singular values.
pub fn symmetric_svd(a: &DMatrix<f64>) -> Result<(DMatrix<f64>, DVector<f64>)> {
    let svd = a
        .clone()
        .try_svd(true, false, f64::EPSILON, 0)
        .ok_or_else(|| GibbsError::LinAlg("SVD did not converge".to_string()))?;
    let u = svd
        .u
        .ok_or_else(|| GibbsError::LinAlg("SVD did not return U".to_string()))?;
    Ok((u, svd.singular_values))
}

/// Scales column `i` of `u` by `f(s_i)`.
fn scale_columns(u: &DMatrix<f64>, s: &DVector<f64>, f: impl Fn(f64) -> f64) -> DMatrix<f64> {
    let mut scaled = u.clone();
    for (mut column, &value) in scaled.column_iter_mut().zip(s.iter()) {
        column *= f(value);
    }
    scaled
}

/// Draws from `N(Sigma^-1 d, Sigma^-1)` for a symmetric positive definite
/// precision matrix `Sigma`. Uses its SVD, falling back to a QR inverse when
/// the decomposition fails or is singular.
pub fn sample_precision_gaussian<R: Rng + ?Sized>(
    sigma: &DMatrix<f64>,
    d: &DVector<f64>,
    rng: &mut R,
) -> Result<DVector<f64>> {
    let n = d.len();
    if sigma.nrows() != n || sigma.ncols() != n {
        return Err(GibbsError::DimensionMismatch {
            expected: n,
            actual: sigma.nrows(),
        });
    }
    let z = DVector::from_iterator(n, (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)));

    match symmetric_svd(sigma) {
        Ok((u, s)) if s.iter().all(|&x| x > 0.0 && x.is_finite()) => {
            let mean = &u * (u.transpose() * d).component_div(&s);
            let li = scale_columns(&u, &s, |x| x.sqrt().recip());
            Ok(mean + li * z)
        }
        _ => {
            log::warn!("SVD of the coefficient precision failed, falling back to QR");
            let sigma_inv = sigma
                .clone()
                .qr()
                .solve(&DMatrix::identity(n, n))
                .ok_or_else(|| GibbsError::LinAlg("coefficient precision is singular".to_string()))?;
            let mean = &sigma_inv * d;
            let (u, s) = symmetric_svd(&sigma_inv)?;
            let li = scale_columns(&u, &s, |x| x.max(0.0).sqrt());
            Ok(mean + li * z)
        }
    }
}

#[test]
fn test_symmetric_svd_reconstructs() {
    let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0]);
    let (u, s) = symmetric_svd(&a).unwrap();
    let rebuilt = &u * DMatrix::from_diagonal(&s) * u.transpose();
    for (x, y) in rebuilt.iter().zip(a.iter()) {
        approx::assert_relative_eq!(*x, *y, epsilon = 1e-12);
    }
}

#[test]
fn test_precision_gaussian_moments() {
    use rand::SeedableRng;

    let sigma = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
    let d = DVector::from_vec(vec![1.0, -1.0]);
    let cov = sigma.clone().try_inverse().unwrap();
    let expected_mean = &cov * &d;

    let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(7);
    let draws: Vec<DVector<f64>> = (0..20_000)
        .map(|_| sample_precision_gaussian(&sigma, &d, &mut rng).unwrap())
        .collect();

    let mean = draws.iter().fold(DVector::zeros(2), |acc, x| acc + x) / draws.len() as f64;
    let mut sample_cov = DMatrix::zeros(2, 2);
    for x in &draws {
        let dx = x - &mean;
        sample_cov += &dx * dx.transpose();
    }
    sample_cov /= (draws.len() - 1) as f64;

    for i in 0..2 {
        approx::assert_abs_diff_eq!(mean[i], expected_mean[i], epsilon = 0.03);
        for j in 0..2 {
            approx::assert_abs_diff_eq!(sample_cov[(i, j)], cov[(i, j)], epsilon = 0.03);
        }
    }
}

#[test]
fn test_dimension_mismatch() {
    let sigma = DMatrix::identity(3, 3);
    let d = DVector::zeros(2);
    let mut rng = rand::thread_rng();
    assert!(sample_precision_gaussian(&sigma, &d, &mut rng).is_err());
}
