//! Estimation configuration.
//!
//! All tolerances and iteration caps live in [`EstimationOptions`], which is
//! threaded explicitly through every call. A process-wide default value can be
//! installed once with [`EstimationOptions::set_global`]; it is read at the
//! start of an estimation call and never consulted again mid-estimation.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Tolerances and iteration caps for the demeaning and IRLS loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimationOptions {
    /// Relative sum-of-squared-changes tolerance for one demeaning sweep.
    pub demean_tolerance: f64,
    /// Cap on alternating-projection sweeps per column.
    pub demean_max_iterations: usize,
    /// Relative deviance-change tolerance for IRLS convergence.
    pub irls_tolerance: f64,
    /// Cap on IRLS iterations.
    pub irls_max_iterations: usize,
    /// Cap on outer dispersion updates for the negative binomial family.
    pub dispersion_max_iterations: usize,
    /// Dispersion values above this bound count as runaway (divergence).
    pub dispersion_bound: f64,
    /// Relative pivot threshold below which a covariate column is dropped as
    /// collinear.
    pub collinearity_tolerance: f64,
    /// Floor applied to working weights to keep the WLS system well posed.
    pub min_working_weight: f64,
    /// Cap on step-halving attempts within one IRLS iteration.
    pub max_step_halvings: usize,
    /// Demeaning runs its columns on rayon workers once `rows * columns`
    /// exceeds this threshold.
    pub parallel_threshold: usize,
}

impl Default for EstimationOptions {
    fn default() -> Self {
        Self {
            demean_tolerance: 1e-8,
            demean_max_iterations: 10_000,
            irls_tolerance: 1e-8,
            irls_max_iterations: 200,
            dispersion_max_iterations: 50,
            dispersion_bound: 1e8,
            collinearity_tolerance: 1e-10,
            min_working_weight: 1e-10,
            max_step_halvings: 30,
            parallel_threshold: 50_000,
        }
    }
}

static GLOBAL_OPTIONS: OnceLock<EstimationOptions> = OnceLock::new();

impl EstimationOptions {
    /// The process-wide defaults. Initialized to [`Default`] on first read if
    /// nothing was installed via [`EstimationOptions::set_global`].
    pub fn global() -> &'static EstimationOptions {
        GLOBAL_OPTIONS.get_or_init(EstimationOptions::default)
    }

    /// Install process-wide defaults. Succeeds at most once, and only before
    /// the first [`EstimationOptions::global`] read; afterwards the installed
    /// value is immutable and the rejected candidate is handed back.
    pub fn set_global(options: EstimationOptions) -> Result<(), EstimationOptions> {
        GLOBAL_OPTIONS.set(options)
    }
}

/// Small-sample-correction policy for the variance engine.
///
/// The corrections are applied as a single scalar multiplier on top of the raw
/// sandwich, so one sandwich can be reused across policies. The implemented
/// convention: `adj` contributes `(N-1)/(N-K)`; `cluster_adj` contributes
/// `G/(G-1)` with `G` the smallest cluster count among the requested
/// dimensions. `K` counts the kept covariates, plus the absorbed fixed-effect
/// parameters when `count_fixed_effects` is set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ssc {
    pub adj: bool,
    pub cluster_adj: bool,
    pub count_fixed_effects: bool,
}

impl Default for Ssc {
    fn default() -> Self {
        Self {
            adj: true,
            cluster_adj: true,
            count_fixed_effects: true,
        }
    }
}
