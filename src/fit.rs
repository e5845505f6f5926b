//! Estimation entry points and the IRLS driver.
//!
//! Every family runs through the same loop: compute the family's working
//! response and weights from the current linear predictor, demean the working
//! response and covariates jointly against the fixed effects, solve the
//! weighted least-squares system, update the linear predictor, and test the
//! relative deviance change. The Gaussian family is the degenerate
//! single-iteration case and reproduces the pure linear core bit for bit.
//!
//! The negative binomial family nests this loop inside an outer fixed point
//! that re-estimates the dispersion by a guarded Newton step on the profile
//! log-likelihood between IRLS passes.
//!
//! Advisory conditions (collinearity drops, demeaning non-convergence,
//! stalled IRLS) are collected on the returned model; only numerical
//! divergence aborts the call.

use crate::config::EstimationOptions;
use crate::demean::{self, DemeanOptions};
use crate::factors::{FactorError, FactorRegistry, FactorSpec};
use crate::family::{Family, negbin_theta_score};
use crate::solve::{self, CollinearityInfo, SolveError};
use ndarray::{Array1, Array2, ArrayView1, s};
use std::fmt;
use thiserror::Error;

/// Fatal estimation failures. Advisory conditions never surface here; they
/// ride on the successful [`FittedModel`].
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("invalid fixed-effect specification: {0}")]
    InvalidFactor(#[from] FactorError),

    #[error("linear solve failed: {0}")]
    Solve(#[from] SolveError),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("no observations remain after excluding {excluded} incomplete row(s)")]
    NoObservations { excluded: usize },

    #[error("estimation diverged at iteration {iteration}: {reason}")]
    Diverged { iteration: usize, reason: String },

    #[error("unknown level {level} of factor '{dim}' in prediction data")]
    UnknownLevel { dim: String, level: i64 },
}

/// Everything the engine needs for one estimation call. Formula parsing,
/// label handling and multi-model expansion live with the callers; this is
/// the fully resolved numeric problem.
#[derive(Debug, Clone)]
pub struct EstimationData {
    pub y: Array1<f64>,
    /// Covariate matrix, shape `(n, p)`. No intercept column: the fixed
    /// effects (or the demeaning of a factor-free model) absorb the level.
    pub x: Array2<f64>,
    /// One name per covariate column; generated as `x0..` when empty.
    pub covariate_names: Vec<String>,
    pub factors: Vec<FactorSpec>,
    /// Non-negative observation weights; uniform when `None`.
    pub weights: Option<Array1<f64>>,
    /// Added to the linear predictor; zero when `None`.
    pub offset: Option<Array1<f64>>,
}

impl EstimationData {
    pub fn new(y: Array1<f64>, x: Array2<f64>) -> Self {
        Self {
            y,
            x,
            covariate_names: Vec::new(),
            factors: Vec::new(),
            weights: None,
            offset: None,
        }
    }

    pub fn with_factors(mut self, factors: Vec<FactorSpec>) -> Self {
        self.factors = factors;
        self
    }

    pub fn with_weights(mut self, weights: Array1<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_offset(mut self, offset: Array1<f64>) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.covariate_names = names;
        self
    }
}

/// Terminal state of the IRLS loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrlsStatus {
    Converged,
    /// Hit the iteration cap; best available fit returned.
    MaxIterationsReached,
    /// Step halving could not find a deviance-improving step; the previous
    /// iterate is returned.
    Stalled,
}

impl fmt::Display for IrlsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrlsStatus::Converged => write!(f, "converged"),
            IrlsStatus::MaxIterationsReached => write!(f, "maximum iterations reached"),
            IrlsStatus::Stalled => write!(f, "stalled"),
        }
    }
}

/// Recovered fixed-effect coefficients for one dimension.
#[derive(Debug, Clone)]
pub struct FixedEffects {
    pub name: String,
    /// Raw level codes, aligned with `values`.
    pub levels: Vec<i64>,
    pub values: Array1<f64>,
}

/// A fitted model: point estimates, per-observation quantities for the
/// variance engine, fit statistics and structured diagnostics.
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub family: Family,
    /// Full-length coefficients; dropped columns carry 0.0.
    pub coefficients: Array1<f64>,
    pub covariate_names: Vec<String>,
    pub kept: Vec<usize>,
    pub collinearity: CollinearityInfo,
    /// Linear predictor including offset, kept rows only.
    pub linear_predictor: Array1<f64>,
    pub fitted_values: Array1<f64>,
    pub working_residuals: Array1<f64>,
    pub response_residuals: Array1<f64>,
    /// Per-observation score contributions, shape `(n, kept)`.
    pub scores: Array2<f64>,
    /// `(X'WX)^{-1}` over kept columns at convergence.
    pub bread: Array2<f64>,
    /// Final combined working weights.
    pub weights: Array1<f64>,
    pub prior_weights: Array1<f64>,
    pub offset: Array1<f64>,
    pub loglik: f64,
    pub deviance: f64,
    pub null_deviance: f64,
    /// McFadden pseudo R-squared (non-Gaussian families).
    pub pseudo_r2: Option<f64>,
    /// Within R-squared (Gaussian family).
    pub r2_within: Option<f64>,
    /// Estimated (or fixed) negative binomial dispersion.
    pub theta: Option<f64>,
    pub n_obs: usize,
    /// Original row indices dropped for missing values.
    pub excluded_rows: Vec<usize>,
    /// Original row indices that entered the fit.
    pub kept_rows: Vec<usize>,
    pub absorbed_df: usize,
    pub residual_df: usize,
    pub iterations: usize,
    pub status: IrlsStatus,
    /// False when any demeaning column hit the sweep cap in any iteration.
    pub demean_converged: bool,
    /// Logit separation heuristic tripped (max |eta| escaped).
    pub separation_suspected: bool,

    registry: Option<FactorRegistry>,
    x: Array2<f64>,
    options: EstimationOptions,
}

impl FittedModel {
    pub fn converged(&self) -> bool {
        self.status == IrlsStatus::Converged && self.demean_converged
    }

    pub fn n_excluded(&self) -> usize {
        self.excluded_rows.len()
    }

    /// Recover the fixed-effect coefficients per dimension by
    /// back-substitution on the working scale.
    ///
    /// Returns `None` for a factor-free model and flags non-convergence of
    /// the recovery sweep through the second tuple element.
    pub fn fixed_effects(&self) -> Option<(Vec<FixedEffects>, bool)> {
        let registry = self.registry.as_ref()?;
        let target = &self.linear_predictor - &self.offset - self.x.dot(&self.coefficients);
        let (values, converged) = demean::recover_fixed_effects(
            target.view(),
            self.weights.view(),
            registry,
            &DemeanOptions::from(&self.options),
        );
        let tables = registry
            .dims()
            .iter()
            .zip(values)
            .map(|(dim, vals)| FixedEffects {
                name: dim.name().to_string(),
                levels: dim.levels().to_vec(),
                values: vals,
            })
            .collect();
        Some((tables, converged))
    }

    /// Predict the response-scale mean for new data.
    ///
    /// `factors` must align with the estimation call's dimensions (order and
    /// slope presence); every level must have been seen during estimation.
    pub fn predict(
        &self,
        x_new: &Array2<f64>,
        factors: &[FactorSpec],
        offset: Option<&Array1<f64>>,
    ) -> Result<Array1<f64>, EstimationError> {
        let m = x_new.nrows();
        if x_new.ncols() != self.coefficients.len() {
            return Err(EstimationError::DimensionMismatch(format!(
                "prediction matrix has {} columns, model has {}",
                x_new.ncols(),
                self.coefficients.len()
            )));
        }

        let mut eta = x_new.dot(&self.coefficients);
        if let Some(o) = offset {
            if o.len() != m {
                return Err(EstimationError::DimensionMismatch(format!(
                    "offset has {} rows, prediction data has {}",
                    o.len(),
                    m
                )));
            }
            eta += o;
        }

        if let Some((tables, _)) = self.fixed_effects() {
            if factors.len() != tables.len() {
                return Err(EstimationError::DimensionMismatch(format!(
                    "prediction supplies {} factor dimension(s), model has {}",
                    factors.len(),
                    tables.len()
                )));
            }
            for (spec, table) in factors.iter().zip(&tables) {
                if spec.codes.len() != m {
                    return Err(EstimationError::DimensionMismatch(format!(
                        "factor '{}' has {} codes, prediction data has {}",
                        spec.name,
                        spec.codes.len(),
                        m
                    )));
                }
                let lookup: ahash::AHashMap<i64, usize> = table
                    .levels
                    .iter()
                    .enumerate()
                    .map(|(g, &code)| (code, g))
                    .collect();
                for i in 0..m {
                    let g = *lookup.get(&spec.codes[i]).ok_or_else(|| {
                        EstimationError::UnknownLevel {
                            dim: table.name.clone(),
                            level: spec.codes[i],
                        }
                    })?;
                    let scale = match &spec.slope {
                        Some(slope) => slope[i],
                        None => 1.0,
                    };
                    eta[i] += table.values[g] * scale;
                }
            }
        }

        Ok(self.family.mu(&eta))
    }
}

/// Fit a linear fixed-effects model (the Gaussian family).
pub fn feols(
    data: &EstimationData,
    options: &EstimationOptions,
) -> Result<FittedModel, EstimationError> {
    feglm(data, &Family::Gaussian, options)
}

/// Fit a (generalized) linear model with any number of fixed-effect
/// dimensions. The main entry point of the engine.
pub fn feglm(
    data: &EstimationData,
    family: &Family,
    options: &EstimationOptions,
) -> Result<FittedModel, EstimationError> {
    let sample = Sample::prepare(data)?;
    log::info!(
        "fitting {} model: {} observation(s) ({} excluded), {} covariate(s), {} fixed-effect dimension(s)",
        family.name(),
        sample.y.len(),
        sample.excluded_rows.len(),
        sample.x.ncols(),
        sample.registry.as_ref().map_or(0, |r| r.n_dims()),
    );

    match family {
        Family::NegativeBinomial { theta: None } => fit_negbin_profile(&sample, options),
        _ => {
            let inner = fit_irls(&sample, family, options)?;
            Ok(assemble(sample, family.clone(), inner, options))
        }
    }
}

// ---------------------------------------------------------------------------
// Sample preparation (missing-value policy)
// ---------------------------------------------------------------------------

/// The estimation sample after row exclusion: all vectors aligned, all
/// values finite, weights non-negative.
struct Sample {
    y: Array1<f64>,
    x: Array2<f64>,
    covariate_names: Vec<String>,
    prior_weights: Array1<f64>,
    offset: Array1<f64>,
    registry: Option<FactorRegistry>,
    kept_rows: Vec<usize>,
    excluded_rows: Vec<usize>,
}

impl Sample {
    fn prepare(data: &EstimationData) -> Result<Self, EstimationError> {
        let n_all = data.y.len();
        if data.x.nrows() != n_all {
            return Err(EstimationError::DimensionMismatch(format!(
                "x has {} rows but y has {}",
                data.x.nrows(),
                n_all
            )));
        }
        for opt in [&data.weights, &data.offset] {
            if let Some(v) = opt {
                if v.len() != n_all {
                    return Err(EstimationError::DimensionMismatch(format!(
                        "weights/offset has {} rows but y has {}",
                        v.len(),
                        n_all
                    )));
                }
            }
        }
        for spec in &data.factors {
            if spec.codes.len() != n_all {
                return Err(EstimationError::DimensionMismatch(format!(
                    "factor '{}' has {} rows but y has {}",
                    spec.name,
                    spec.codes.len(),
                    n_all
                )));
            }
        }

        // Rows with a non-finite outcome, covariate, offset or slope value,
        // or an invalid weight, leave the sample; the exclusion is reported.
        let mut keep = vec![true; n_all];
        for i in 0..n_all {
            if !data.y[i].is_finite() {
                keep[i] = false;
                continue;
            }
            if data.x.row(i).iter().any(|v| !v.is_finite()) {
                keep[i] = false;
                continue;
            }
            if let Some(w) = &data.weights {
                if !w[i].is_finite() || w[i] < 0.0 {
                    keep[i] = false;
                    continue;
                }
            }
            if let Some(o) = &data.offset {
                if !o[i].is_finite() {
                    keep[i] = false;
                    continue;
                }
            }
            for spec in &data.factors {
                if let Some(slope) = &spec.slope {
                    if !slope[i].is_finite() {
                        keep[i] = false;
                        break;
                    }
                }
            }
        }

        let kept_rows: Vec<usize> = (0..n_all).filter(|&i| keep[i]).collect();
        let excluded_rows: Vec<usize> = (0..n_all).filter(|&i| !keep[i]).collect();
        if kept_rows.is_empty() {
            return Err(EstimationError::NoObservations {
                excluded: excluded_rows.len(),
            });
        }
        if !excluded_rows.is_empty() {
            log::info!(
                "excluded {} of {} row(s) with missing values",
                excluded_rows.len(),
                n_all
            );
        }

        let n = kept_rows.len();
        let p = data.x.ncols();
        let y = Array1::from_iter(kept_rows.iter().map(|&i| data.y[i]));
        let mut x = Array2::zeros((n, p));
        for (row, &i) in kept_rows.iter().enumerate() {
            x.row_mut(row).assign(&data.x.row(i));
        }
        let prior_weights = match &data.weights {
            Some(w) => Array1::from_iter(kept_rows.iter().map(|&i| w[i])),
            None => Array1::ones(n),
        };
        let offset = match &data.offset {
            Some(o) => Array1::from_iter(kept_rows.iter().map(|&i| o[i])),
            None => Array1::zeros(n),
        };

        let registry = if data.factors.is_empty() {
            None
        } else {
            let subset: Vec<FactorSpec> = data
                .factors
                .iter()
                .map(|spec| FactorSpec {
                    name: spec.name.clone(),
                    codes: kept_rows.iter().map(|&i| spec.codes[i]).collect(),
                    slope: spec
                        .slope
                        .as_ref()
                        .map(|s| kept_rows.iter().map(|&i| s[i]).collect()),
                })
                .collect();
            Some(FactorRegistry::build(&subset)?)
        };

        let covariate_names = if data.covariate_names.len() == p {
            data.covariate_names.clone()
        } else {
            (0..p).map(|j| format!("x{j}")).collect()
        };

        Ok(Self {
            y,
            x,
            covariate_names,
            prior_weights,
            offset,
            registry,
            kept_rows,
            excluded_rows,
        })
    }
}

// ---------------------------------------------------------------------------
// IRLS inner loop
// ---------------------------------------------------------------------------

/// State accepted at the end of one IRLS iteration.
struct IterState {
    wls: solve::WlsFit,
    zd: Array1<f64>,
    xd: Array2<f64>,
    w: Array1<f64>,
    eta: Array1<f64>,
    mu: Array1<f64>,
    deviance: f64,
}

struct InnerFit {
    state: IterState,
    iterations: usize,
    status: IrlsStatus,
    demean_converged: bool,
    separation_suspected: bool,
}

fn fit_irls(
    sample: &Sample,
    family: &Family,
    options: &EstimationOptions,
) -> Result<InnerFit, EstimationError> {
    let n = sample.y.len();
    let p = sample.x.ncols();
    let dm_opts = DemeanOptions::from(options);

    let mut eta = family.initial_eta(sample.y.view()) + &sample.offset;
    let mut mu = family.mu(&eta);
    let mut deviance = family.deviance(
        sample.y.view(),
        &mu,
        &eta,
        sample.prior_weights.view(),
    );

    let mut accepted: Option<IterState> = None;
    let mut status = IrlsStatus::MaxIterationsReached;
    let mut demean_converged = true;
    let mut separation_suspected = false;
    let mut iterations = 0;

    for iter in 1..=options.irls_max_iterations {
        iterations = iter;

        let (z, w) = family.working(
            sample.y.view(),
            &eta,
            sample.prior_weights.view(),
            options.min_working_weight,
        );
        let z_adj = &z - &sample.offset;

        // Joint demeaning of the working response and every covariate with
        // the current weights; columns run in parallel inside.
        let (zd, xd) = match &sample.registry {
            Some(registry) => {
                let mut cols = Array2::zeros((n, p + 1));
                cols.column_mut(0).assign(&z_adj);
                cols.slice_mut(s![.., 1..]).assign(&sample.x);
                let res = demean::demean(cols.view(), w.view(), registry, &dm_opts);
                demean_converged &= res.all_converged();
                let zd = res.columns.column(0).to_owned();
                let xd = res.columns.slice(s![.., 1..]).to_owned();
                (zd, xd)
            }
            None => (z_adj.clone(), sample.x.clone()),
        };

        let wls = solve::wls_solve(
            xd.view(),
            zd.view(),
            w.view(),
            options.collinearity_tolerance,
        )?;
        // An empty identified set is still a model when fixed effects are
        // being absorbed; without them there is nothing left to estimate.
        if wls.kept.is_empty() && sample.registry.is_none() {
            return Err(EstimationError::Solve(SolveError::Singular { dropped: p }));
        }

        // The demeaned residual estimates the working error, so the full
        // fitted working response (covariates + fixed effects + offset) is
        // z minus that residual.
        let resid = &zd - &wls.fitted;
        let mut eta_trial = &z - &resid;
        let mut mu_trial = family.mu(&eta_trial);
        let mut dev_trial = family.deviance(
            sample.y.view(),
            &mu_trial,
            &eta_trial,
            sample.prior_weights.view(),
        );

        // Step halving, as long as the trial is non-finite — or, from the
        // second iteration on, fails to improve the deviance. The first
        // iteration moves off the heuristic starting values and may
        // legitimately raise the deviance.
        let mut halvings = 0;
        loop {
            let finite = dev_trial.is_finite() && eta_trial.iter().all(|v| v.is_finite());
            let acceptable = finite && (iter == 1 || dev_trial <= deviance);
            if acceptable || halvings >= options.max_step_halvings {
                break;
            }
            eta_trial = (&eta_trial + &eta) * 0.5;
            mu_trial = family.mu(&eta_trial);
            dev_trial = family.deviance(
                sample.y.view(),
                &mu_trial,
                &eta_trial,
                sample.prior_weights.view(),
            );
            halvings += 1;
        }

        let finite = dev_trial.is_finite() && eta_trial.iter().all(|v| v.is_finite());
        if !finite {
            return Err(EstimationError::Diverged {
                iteration: iter,
                reason: format!(
                    "non-finite deviance or linear predictor after {halvings} step halving(s)"
                ),
            });
        }
        if iter > 1 && dev_trial > deviance {
            // Finite but no improving step: keep the previous iterate.
            log::warn!(
                "IRLS stalled at iteration {iter}: no deviance-improving step after {halvings} halving(s)"
            );
            status = IrlsStatus::Stalled;
            break;
        }

        let dev_prev = deviance;
        eta = eta_trial;
        mu = mu_trial;
        deviance = dev_trial;
        accepted = Some(IterState {
            wls,
            zd,
            xd,
            w,
            eta: eta.clone(),
            mu: mu.clone(),
            deviance,
        });

        // Separation heuristic for the logit family: a runaway linear
        // predictor means the probabilities have pinned at the clamp bounds.
        if matches!(family, Family::Logit) {
            let max_abs_eta = eta.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
            if max_abs_eta > 100.0 && !separation_suspected {
                separation_suspected = true;
                log::warn!(
                    "possible perfect separation: max |eta| = {max_abs_eta:.2e} at iteration {iter}"
                );
            }
        }

        log::debug!(
            "IRLS iteration {iter}: deviance {deviance:.8e}, change {:.3e}, halvings {halvings}",
            dev_prev - deviance
        );

        if family.has_closed_form() {
            status = IrlsStatus::Converged;
            break;
        }
        let rel = (dev_prev - deviance).abs() / (0.1 + deviance.abs());
        if iter > 1 && rel < options.irls_tolerance {
            status = IrlsStatus::Converged;
            break;
        }
    }

    let state = accepted.ok_or_else(|| EstimationError::Diverged {
        iteration: iterations,
        reason: "no IRLS iteration produced an acceptable step".to_string(),
    })?;

    Ok(InnerFit {
        state,
        iterations,
        status,
        demean_converged,
        separation_suspected,
    })
}

// ---------------------------------------------------------------------------
// Negative binomial dispersion outer loop
// ---------------------------------------------------------------------------

fn fit_negbin_profile(
    sample: &Sample,
    options: &EstimationOptions,
) -> Result<FittedModel, EstimationError> {
    let mut theta = 1.0;
    let mut family = Family::NegativeBinomial { theta: Some(theta) };
    let mut inner = fit_irls(sample, &family, options)?;
    let mut over_bound = 0usize;

    for outer in 1..=options.dispersion_max_iterations {
        let new_theta = update_theta(
            sample.y.view(),
            &inner.state.mu,
            sample.prior_weights.view(),
            theta,
        );
        if !new_theta.is_finite() {
            return Err(EstimationError::Diverged {
                iteration: outer,
                reason: "dispersion update produced a non-finite value".to_string(),
            });
        }
        if new_theta > options.dispersion_bound {
            over_bound += 1;
            if over_bound >= 2 {
                return Err(EstimationError::Diverged {
                    iteration: outer,
                    reason: format!(
                        "dispersion parameter ran away ({new_theta:.3e} > {:.1e} twice)",
                        options.dispersion_bound
                    ),
                });
            }
        } else {
            over_bound = 0;
        }

        let rel = (new_theta.ln() - theta.ln()).abs();
        theta = new_theta;
        family = Family::NegativeBinomial { theta: Some(theta) };
        inner = fit_irls(sample, &family, options)?;
        log::debug!("dispersion outer iteration {outer}: theta = {theta:.6e}, change {rel:.3e}");
        if rel < 1e-6 {
            break;
        }
    }

    // `assemble` consumes the sample; clone only the cheap parts it reads.
    Ok(assemble(
        Sample {
            y: sample.y.clone(),
            x: sample.x.clone(),
            covariate_names: sample.covariate_names.clone(),
            prior_weights: sample.prior_weights.clone(),
            offset: sample.offset.clone(),
            registry: sample.registry.clone(),
            kept_rows: sample.kept_rows.clone(),
            excluded_rows: sample.excluded_rows.clone(),
        },
        family,
        inner,
        options,
    ))
}

/// One guarded Newton step on the profile log-likelihood in `ln(theta)`.
fn update_theta(
    y: ArrayView1<'_, f64>,
    mu: &Array1<f64>,
    weights: ArrayView1<'_, f64>,
    theta: f64,
) -> f64 {
    // Score in u = ln(theta): du = theta * d(theta).
    let score_u = |th: f64| th * negbin_theta_score(y, mu, weights, th);
    let s = score_u(theta);
    let h: f64 = 1e-4;
    let d = (score_u(theta * h.exp()) - score_u(theta * (-h).exp())) / (2.0 * h);
    // Fall back to a fixed uphill step when the numeric curvature is not
    // usable (flat or convex region).
    let step = if d < 0.0 { (-s / d).clamp(-2.0, 2.0) } else { 0.5_f64.copysign(s) };
    (theta.ln() + step).exp().max(1e-4)
}

// ---------------------------------------------------------------------------
// Model assembly
// ---------------------------------------------------------------------------

fn assemble(
    sample: Sample,
    family: Family,
    inner: InnerFit,
    options: &EstimationOptions,
) -> FittedModel {
    let InnerFit {
        state,
        iterations,
        status,
        demean_converged,
        separation_suspected,
    } = inner;
    let IterState {
        wls,
        zd,
        xd,
        w,
        eta,
        mu,
        deviance,
    } = state;

    let n = sample.y.len();
    let kept = wls.kept.clone();

    // Working residuals and score contributions for the variance engine:
    // s_i = x~_i * (w_i * e_i) over the kept demeaned columns.
    let working_residuals = &zd - &xd.dot(&wls.coefficients);
    let mut scores = Array2::zeros((n, kept.len()));
    for (slot, &j) in kept.iter().enumerate() {
        for i in 0..n {
            scores[[i, slot]] = xd[[i, j]] * w[i] * working_residuals[i];
        }
    }

    let loglik = family.loglik(sample.y.view(), &mu, &eta, sample.prior_weights.view());

    // Null model: the weighted mean of the outcome as a constant.
    let wsum: f64 = sample.prior_weights.sum();
    let ybar = sample.y.dot(&sample.prior_weights) / wsum.max(f64::MIN_POSITIVE);
    let mu_null = Array1::from_elem(n, ybar);
    let mu_null = match &family {
        Family::Logit => mu_null.mapv(|v| v.clamp(1e-8, 1.0 - 1e-8)),
        Family::Poisson | Family::NegativeBinomial { .. } => mu_null.mapv(|v| v.max(1e-10)),
        _ => mu_null,
    };
    let eta_null = Array1::zeros(n);
    let null_deviance = family.deviance(
        sample.y.view(),
        &mu_null,
        &eta_null,
        sample.prior_weights.view(),
    );

    let (pseudo_r2, r2_within) = if family.has_closed_form() {
        let tss: f64 = zd
            .iter()
            .zip(w.iter())
            .map(|(&zi, &wi)| wi * zi * zi)
            .sum();
        let r2 = if tss > 0.0 { 1.0 - wls.rss / tss } else { 0.0 };
        (None, Some(r2))
    } else {
        let ll_null = family.loglik(
            sample.y.view(),
            &mu_null,
            &eta_null,
            sample.prior_weights.view(),
        );
        let r2 = if ll_null.is_finite() && ll_null != 0.0 {
            Some(1.0 - loglik / ll_null)
        } else {
            None
        };
        (r2, None)
    };

    let absorbed_df = sample
        .registry
        .as_ref()
        .map_or(0, |r| r.absorbed_degrees_of_freedom());
    let residual_df = n.saturating_sub(kept.len() + absorbed_df).max(1);

    let theta = family.theta();
    let response_residuals = &sample.y - &mu;

    log::info!(
        "fit {}: deviance {:.6e}, loglik {:.6e}, {} iteration(s), {}",
        family.name(),
        deviance,
        loglik,
        iterations,
        status
    );

    FittedModel {
        family,
        coefficients: wls.coefficients,
        covariate_names: sample.covariate_names,
        kept,
        collinearity: wls.collinearity,
        linear_predictor: eta,
        fitted_values: mu,
        working_residuals,
        response_residuals,
        scores,
        bread: wls.xtx_inv,
        weights: w,
        prior_weights: sample.prior_weights,
        offset: sample.offset,
        loglik,
        deviance,
        null_deviance,
        pseudo_r2,
        r2_within,
        theta,
        n_obs: n,
        excluded_rows: sample.excluded_rows,
        kept_rows: sample.kept_rows,
        absorbed_df,
        residual_df,
        iterations,
        status,
        demean_converged,
        separation_suspected,
        registry: sample.registry,
        x: sample.x,
        options: options.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, array};

    fn opts() -> EstimationOptions {
        EstimationOptions::default()
    }

    #[test]
    fn gaussian_one_way_recovers_within_slope() {
        // Two entities with different intercepts, common slope 2.
        let y = array![2.0, 4.0, 6.0, 20.0, 40.0, 60.0];
        let x = arr2(&[[1.0], [2.0], [3.0], [10.0], [20.0], [30.0]]);
        let data = EstimationData::new(y, x)
            .with_factors(vec![FactorSpec::new("entity", vec![1, 1, 1, 2, 2, 2])]);
        let model = feols(&data, &opts()).unwrap();
        assert_eq!(model.iterations, 1);
        assert_eq!(model.status, IrlsStatus::Converged);
        assert_abs_diff_eq!(model.coefficients[0], 2.0, epsilon = 1e-10);
        assert!(model.r2_within.unwrap() > 0.999);
    }

    #[test]
    fn gaussian_reports_excluded_rows() {
        let y = array![1.0, f64::NAN, 3.0, 4.0, 5.0, 6.0];
        let x = arr2(&[[1.0], [2.0], [3.0], [4.0], [5.0], [6.0]]);
        let data = EstimationData::new(y, x)
            .with_factors(vec![FactorSpec::new("g", vec![0, 0, 0, 1, 1, 1])]);
        let model = feols(&data, &opts()).unwrap();
        assert_eq!(model.excluded_rows, vec![1]);
        assert_eq!(model.n_obs, 5);
    }

    #[test]
    fn collinear_covariate_is_reported_not_fatal() {
        // x is the group index itself, so demeaning reduces it to exactly
        // zero and it must be dropped. The model survives as the
        // fixed-effects-only fit.
        let y = array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x = arr2(&[[1.0], [1.0], [2.0], [2.0], [3.0], [3.0]]);
        let data = EstimationData::new(y, x)
            .with_factors(vec![FactorSpec::new("g", vec![0, 0, 1, 1, 2, 2])]);
        let model = feols(&data, &opts()).unwrap();
        assert_eq!(model.collinearity.dropped, vec![0]);
        assert_eq!(model.coefficients[0], 0.0);
        assert!(model.kept.is_empty());
        assert_eq!(model.status, IrlsStatus::Converged);
        // Within-group residuals of y are +-0.5, so the deviance is 6 * 0.25.
        assert_abs_diff_eq!(model.deviance, 1.5, epsilon = 1e-10);
    }

    #[test]
    fn factor_free_all_collinear_is_fatal() {
        // No fixed effects and a zero design column: nothing identifies the
        // model, so the call aborts instead of returning an empty fit.
        let y = array![1.0, 2.0, 3.0];
        let x = arr2(&[[0.0], [0.0], [0.0]]);
        let err = feols(&EstimationData::new(y, x), &opts()).unwrap_err();
        assert!(matches!(
            err,
            EstimationError::Solve(SolveError::Singular { dropped: 1 })
        ));
    }

    #[test]
    fn poisson_converges_on_count_panel() {
        // log(mu) = entity_fe + 0.5 * x.
        let y = array![1.0, 2.0, 3.0, 2.0, 5.0, 9.0];
        let x = arr2(&[[0.0], [1.0], [2.0], [0.0], [1.0], [2.0]]);
        let data = EstimationData::new(y, x)
            .with_factors(vec![FactorSpec::new("entity", vec![0, 0, 0, 1, 1, 1])]);
        let model = feglm(&data, &Family::Poisson, &opts()).unwrap();
        assert_eq!(model.status, IrlsStatus::Converged);
        assert!(model.iterations > 1);
        assert!(model.fitted_values.iter().all(|&m| m > 0.0));
        // Slope should be positive and in a plausible range.
        assert!(model.coefficients[0] > 0.2 && model.coefficients[0] < 1.0);
    }

    #[test]
    fn logit_fits_binary_outcome() {
        let y = array![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
        let x = arr2(&[
            [-2.0],
            [-1.0],
            [0.5],
            [-0.5],
            [1.0],
            [2.0],
            [-1.5],
            [1.5],
        ]);
        let data = EstimationData::new(y, x)
            .with_factors(vec![FactorSpec::new("g", vec![0, 0, 0, 0, 1, 1, 1, 1])]);
        let model = feglm(&data, &Family::Logit, &opts()).unwrap();
        assert!(model.coefficients[0] > 0.0);
        assert!(model
            .fitted_values
            .iter()
            .all(|&m| m > 0.0 && m < 1.0));
    }

    #[test]
    fn negbin_fixed_theta_close_to_poisson_for_large_theta() {
        let y = array![1.0, 2.0, 3.0, 2.0, 5.0, 9.0];
        let x = arr2(&[[0.0], [1.0], [2.0], [0.0], [1.0], [2.0]]);
        let data = EstimationData::new(y.clone(), x.clone())
            .with_factors(vec![FactorSpec::new("entity", vec![0, 0, 0, 1, 1, 1])]);
        let pois = feglm(&data, &Family::Poisson, &opts()).unwrap();
        let nb = feglm(
            &data,
            &Family::NegativeBinomial { theta: Some(1e7) },
            &opts(),
        )
        .unwrap();
        assert_abs_diff_eq!(pois.coefficients[0], nb.coefficients[0], epsilon = 1e-4);
    }

    #[test]
    fn fixed_effects_reproduce_linear_predictor() {
        let y = array![6.0, 7.0, 8.0, 11.0, 12.0, 13.0];
        let x = arr2(&[[0.5], [0.1], [0.9], [0.3], [0.7], [0.2]]);
        let entity = vec![0, 0, 0, 1, 1, 1];
        let time = vec![0, 1, 2, 0, 1, 2];
        let data = EstimationData::new(y, x).with_factors(vec![
            FactorSpec::new("entity", entity.clone()),
            FactorSpec::new("time", time.clone()),
        ]);
        let model = feols(&data, &opts()).unwrap();
        let (fe, converged) = model.fixed_effects().unwrap();
        assert!(converged);
        for i in 0..6 {
            let fe_part: f64 = fe[0].values[entity[i] as usize] + fe[1].values[time[i] as usize];
            let eta = model.x_row_dot(i) + fe_part;
            assert_abs_diff_eq!(eta, model.linear_predictor[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn predict_matches_in_sample_fit() {
        let y = array![2.0, 4.0, 6.0, 20.0, 40.0, 60.0];
        let x = arr2(&[[1.0], [2.0], [3.0], [10.0], [20.0], [30.0]]);
        let codes = vec![1, 1, 1, 2, 2, 2];
        let data = EstimationData::new(y, x.clone())
            .with_factors(vec![FactorSpec::new("entity", codes.clone())]);
        let model = feols(&data, &opts()).unwrap();
        let pred = model
            .predict(&x, &[FactorSpec::new("entity", codes)], None)
            .unwrap();
        for i in 0..6 {
            assert_abs_diff_eq!(pred[i], model.fitted_values[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn predict_rejects_unseen_level() {
        let y = array![1.0, 2.0, 3.0, 4.0];
        let x = arr2(&[[1.0], [2.0], [3.0], [4.0]]);
        let data = EstimationData::new(y, x.clone())
            .with_factors(vec![FactorSpec::new("g", vec![0, 0, 1, 1])]);
        let model = feols(&data, &opts()).unwrap();
        let err = model
            .predict(&x, &[FactorSpec::new("g", vec![0, 0, 1, 9])], None)
            .unwrap_err();
        assert!(matches!(err, EstimationError::UnknownLevel { level: 9, .. }));
    }

    #[test]
    fn degenerate_factor_fails_before_iterating() {
        let y = array![1.0, 2.0, 3.0];
        let x = arr2(&[[1.0], [2.0], [3.0]]);
        let data =
            EstimationData::new(y, x).with_factors(vec![FactorSpec::new("g", vec![5, 5, 5])]);
        let err = feols(&data, &opts()).unwrap_err();
        assert!(matches!(err, EstimationError::InvalidFactor(_)));
    }

    impl FittedModel {
        fn x_row_dot(&self, i: usize) -> f64 {
            self.x.row(i).dot(&self.coefficients)
        }
    }
}
