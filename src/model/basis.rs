use crate::constants::{ECORR_EPOCH_DT, ECORR_EPOCH_NMIN};
use itertools::Itertools;
use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;

/// Fourier design matrix for a Gaussian process with `components`
/// frequencies `k / tspan`, k = 1..=components. Columns alternate sine and
/// cosine of the same frequency.
#[derive(Debug, Clone)]
pub struct FourierBasis {
    pub matrix: DMatrix<f64>,
    /// Frequency of each column (each frequency appears twice)
    pub freqs: DVector<f64>,
    /// Frequency bin width of each column
    pub df: DVector<f64>,
    pub tspan: f64,
}

impl FourierBasis {
    pub fn new(toas: &DVector<f64>, components: usize, tspan: f64) -> Self {
        let freqs = DVector::from_iterator(
            2 * components,
            (1..=components).flat_map(|k| {
                let f = k as f64 / tspan;
                [f, f]
            }),
        );

        let matrix = DMatrix::from_fn(toas.len(), 2 * components, |i, j| {
            let arg = 2.0 * PI * toas[i] * freqs[j];
            if j % 2 == 0 {
                arg.sin()
            } else {
                arg.cos()
            }
        });

        let df = DVector::from_element(2 * components, tspan.recip());

        FourierBasis {
            matrix,
            freqs,
            df,
            tspan,
        }
    }

    pub fn components(&self) -> usize {
        self.freqs.len() / 2
    }
}

/// Groups TOAs into observing epochs. Two TOAs share an epoch when they are
/// within `ECORR_EPOCH_DT` seconds of the first TOA of the epoch; epochs with
/// fewer than `ECORR_EPOCH_NMIN` TOAs are dropped. Returns TOA indices per epoch,
/// ordered in time.
pub fn quantize_epochs(toas: &DVector<f64>, members: &[usize]) -> Vec<Vec<usize>> {
    // Sort by time
    let sorted: Vec<usize> = members
        .iter()
        .copied()
        .sorted_by(|&a, &b| toas[a].total_cmp(&toas[b]))
        .collect();

    let mut epochs: Vec<(f64, Vec<usize>)> = vec![];
    for index in sorted {
        match epochs.last_mut() {
            Some((reference, epoch)) if toas[index] - *reference < ECORR_EPOCH_DT => epoch.push(index),
            _ => epochs.push((toas[index], vec![index])),
        }
    }

    epochs
        .into_iter()
        .map(|(_, epoch)| epoch)
        .filter(|epoch| epoch.len() >= ECORR_EPOCH_NMIN)
        .collect()
}

/// Quantization matrix with one column per epoch, `U[i, j] = 1` when TOA `i`
/// belongs to epoch `j`.
pub fn quantization_matrix(ntoas: usize, epochs: &[Vec<usize>]) -> DMatrix<f64> {
    let mut u = DMatrix::zeros(ntoas, epochs.len());
    for (j, epoch) in epochs.iter().enumerate() {
        for &i in epoch {
            u[(i, j)] = 1.0;
        }
    }
    u
}

#[test]
fn test_fourier_basis_shape_and_frequencies() {
    let toas = DVector::from_iterator(50, (0..50).map(|i| i as f64 * 1e5));
    let basis = FourierBasis::new(&toas, 10, 5e6);

    assert_eq!(basis.matrix.shape(), (50, 20));
    assert_eq!(basis.components(), 10);
    assert_eq!(basis.freqs[0], basis.freqs[1]);
    assert!((basis.freqs[19] - 10.0 / 5e6).abs() < 1e-20);

    // At t = 0 the sine columns vanish and cosine columns are one
    assert_eq!(basis.matrix[(0, 0)], 0.0);
    assert_eq!(basis.matrix[(0, 1)], 1.0);
}

#[test]
fn test_quantize_epochs_drops_singletons() {
    let toas = DVector::from_vec(vec![0.0, 0.2, 0.5, 100.0, 200.0, 200.1]);
    let epochs = quantize_epochs(&toas, &[0, 1, 2, 3, 4, 5]);
    assert_eq!(epochs, vec![vec![0, 1, 2], vec![4, 5]]);

    let u = quantization_matrix(6, &epochs);
    assert_eq!(u.shape(), (6, 2));
    assert_eq!(u.column(0).sum(), 3.0);
    assert_eq!(u[(3, 0)] + u[(3, 1)], 0.0);
}

#[test]
fn test_quantize_epochs_respects_membership() {
    let toas = DVector::from_vec(vec![0.0, 0.1, 0.2, 0.3]);
    let epochs = quantize_epochs(&toas, &[1, 3]);
    assert_eq!(epochs, vec![vec![1, 3]]);
}
