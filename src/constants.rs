/// Seconds in a day
pub const SECONDS_PER_DAY: f64 = 86400.0;

/// One over a Julian year, in Hz. Reference frequency for power-law spectra.
pub const FYR: f64 = 1.0 / (365.25 * SECONDS_PER_DAY);

/// Prior variance given to timing model coefficients. Large enough that the
/// timing model is effectively marginalized over with a flat prior.
pub const TIMING_MODEL_PHI: f64 = 1e40;

/// TOAs closer than this many seconds belong to the same ECORR epoch.
pub const ECORR_EPOCH_DT: f64 = 1.0;

/// Minimum number of TOAs required for an ECORR epoch.
pub const ECORR_EPOCH_NMIN: usize = 2;

/// Number of grid points used for the numerical conditional draws of
/// variance hyperparameters.
pub const CONDITIONAL_GRID_POINTS: usize = 1000;

/// Length of the short white-noise (and ECORR) chain used to tune step counts.
pub const WHITE_ADAPT_ITERS: usize = 1000;

/// Samples dropped from the front of the short tuning chains.
pub const SHORT_CHAIN_BURN: usize = 100;

/// Length of the full-likelihood run used to learn the red noise proposal.
pub const RED_ADAPT_ITERS: usize = 10_000;

/// Metropolis steps on the red noise block per Gibbs iteration.
pub const RED_STEPS_PER_ITER: usize = 20;

/// Metropolis steps on the free spectrum per Gibbs iteration when it is
/// not drawn from its conditional.
pub const RHO_MH_STEPS: usize = 10;

/// Chains are flushed to disk every this many iterations.
pub const SAVE_EVERY: usize = 100;

/// Jump size multipliers for single-component Metropolis updates, and the
/// probability of choosing each.
pub const JUMP_SIZES: [f64; 5] = [0.1, 0.5, 1.0, 3.0, 10.0];
pub const JUMP_PROBS: [f64; 5] = [0.1, 0.15, 0.5, 0.15, 0.1];

/// Base step size per parameter in the block for single-component jumps.
pub const JUMP_SIGMA_PER_PARAM: f64 = 0.05;
