//! Model families for the IRLS driver.
//!
//! A closed set of tagged variants, each supplying the capability set the
//! driver needs: starting values, inverse link with clamping, working
//! response/weights, log-likelihood and deviance. The driver is generic over
//! this set only — there is no open-ended subclassing.
//!
//! The `Custom` variant is the femlm-style general maximum-likelihood family:
//! the caller supplies per-observation log-likelihood, score and negative
//! Hessian diagonal in the linear predictor, and the Newton step on the score
//! flows through the same demeaning path as the closed-form families (working
//! weight `-H_ii`, working response `eta + score / weight`).

use ndarray::{Array1, ArrayView1};
use statrs::function::gamma::{digamma, ln_gamma};
use std::fmt;
use std::sync::Arc;

/// Clamp bound on the linear predictor before exponentiation.
const ETA_CLAMP: f64 = 700.0;
/// Clamp keeping probabilities strictly inside (0, 1).
const PROB_EPS: f64 = 1e-8;
/// Floor for strictly positive means.
const MU_FLOOR: f64 = 1e-10;

/// Total log-likelihood in `(y, eta)`.
pub type LogLikFn = Arc<dyn Fn(ArrayView1<'_, f64>, ArrayView1<'_, f64>) -> f64 + Send + Sync>;
/// Per-observation quantity in `(y, eta)`.
pub type ObsFn =
    Arc<dyn Fn(ArrayView1<'_, f64>, ArrayView1<'_, f64>) -> Array1<f64> + Send + Sync>;

/// User-supplied maximum-likelihood family.
#[derive(Clone)]
pub struct CustomFamily {
    pub name: String,
    /// Total log-likelihood `l(y, eta)`.
    pub loglik: LogLikFn,
    /// Per-observation score `dl_i / d eta_i`.
    pub score: ObsFn,
    /// Per-observation negative Hessian diagonal `-d2 l_i / d eta_i^2`.
    pub neg_hessian: ObsFn,
}

impl fmt::Debug for CustomFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomFamily").field("name", &self.name).finish()
    }
}

/// The supported model families.
#[derive(Debug, Clone)]
pub enum Family {
    /// Linear model; the IRLS loop degenerates to a single iteration.
    Gaussian,
    /// Poisson with log link.
    Poisson,
    /// Binomial with logit link.
    Logit,
    /// Negative binomial with log link. `theta: None` requests dispersion
    /// estimation via the outer profile loop.
    NegativeBinomial { theta: Option<f64> },
    /// General maximum-likelihood model (femlm-style).
    Custom(CustomFamily),
}

impl Family {
    pub fn name(&self) -> &str {
        match self {
            Family::Gaussian => "gaussian",
            Family::Poisson => "poisson",
            Family::Logit => "logit",
            Family::NegativeBinomial { .. } => "negbin",
            Family::Custom(c) => &c.name,
        }
    }

    /// Whether a single weighted least-squares pass is exact.
    pub fn has_closed_form(&self) -> bool {
        matches!(self, Family::Gaussian)
    }

    pub fn theta(&self) -> Option<f64> {
        match self {
            Family::NegativeBinomial { theta } => *theta,
            _ => None,
        }
    }

    /// Starting linear predictor. Count families start from a damped log of
    /// the outcome rather than zero to avoid immediate divergence.
    pub fn initial_eta(&self, y: ArrayView1<'_, f64>) -> Array1<f64> {
        match self {
            Family::Gaussian | Family::Custom(_) => Array1::zeros(y.len()),
            Family::Poisson | Family::NegativeBinomial { .. } => {
                y.mapv(|yi| (yi.max(0.0) + 0.1).ln())
            }
            Family::Logit => y.mapv(|yi| {
                let p = (yi.clamp(0.0, 1.0) + 0.5) / 2.0;
                (p / (1.0 - p)).ln()
            }),
        }
    }

    /// Inverse link, clamped to the family's valid mean range.
    pub fn mu(&self, eta: &Array1<f64>) -> Array1<f64> {
        match self {
            Family::Gaussian | Family::Custom(_) => eta.clone(),
            Family::Poisson | Family::NegativeBinomial { .. } => {
                eta.mapv(|e| e.clamp(-ETA_CLAMP, ETA_CLAMP).exp().max(MU_FLOOR))
            }
            Family::Logit => eta.mapv(|e| {
                let p = 1.0 / (1.0 + (-e.clamp(-ETA_CLAMP, ETA_CLAMP)).exp());
                p.clamp(PROB_EPS, 1.0 - PROB_EPS)
            }),
        }
    }

    /// Working response and combined working weights for one IRLS step.
    ///
    /// For the closed-form families this is the textbook `z = eta +
    /// (y - mu) g'(mu)`, `w = prior / (V(mu) g'(mu)^2)`; the custom family
    /// substitutes its Newton quantities.
    pub fn working(
        &self,
        y: ArrayView1<'_, f64>,
        eta: &Array1<f64>,
        prior_weights: ArrayView1<'_, f64>,
        min_weight: f64,
    ) -> (Array1<f64>, Array1<f64>) {
        let n = y.len();
        match self {
            Family::Gaussian => (y.to_owned(), prior_weights.to_owned()),
            Family::Poisson => {
                let mu = self.mu(eta);
                let mut z = Array1::zeros(n);
                let mut w = Array1::zeros(n);
                for i in 0..n {
                    let m = mu[i];
                    w[i] = prior_weights[i] * m.max(min_weight);
                    z[i] = eta[i] + (y[i] - m) / m;
                }
                (z, w)
            }
            Family::Logit => {
                let mu = self.mu(eta);
                let mut z = Array1::zeros(n);
                let mut w = Array1::zeros(n);
                for i in 0..n {
                    let v = (mu[i] * (1.0 - mu[i])).max(min_weight);
                    w[i] = prior_weights[i] * v;
                    z[i] = eta[i] + (y[i] - mu[i]) / v;
                }
                (z, w)
            }
            Family::NegativeBinomial { theta } => {
                let th = theta.unwrap_or(1.0);
                let mu = self.mu(eta);
                let mut z = Array1::zeros(n);
                let mut w = Array1::zeros(n);
                for i in 0..n {
                    let m = mu[i];
                    // Var = mu + mu^2/theta; with log link the working weight
                    // is mu^2 / Var = mu / (1 + mu/theta). The floor applies
                    // to the family part only, so zero prior weights stay zero.
                    w[i] = prior_weights[i] * (m / (1.0 + m / th)).max(min_weight);
                    z[i] = eta[i] + (y[i] - m) / m;
                }
                (z, w)
            }
            Family::Custom(c) => {
                let score = (c.score)(y, eta.view());
                let hess = (c.neg_hessian)(y, eta.view());
                let mut z = Array1::zeros(n);
                let mut w = Array1::zeros(n);
                for i in 0..n {
                    let h = hess[i].max(min_weight);
                    w[i] = prior_weights[i] * h;
                    z[i] = eta[i] + score[i] / h;
                }
                (z, w)
            }
        }
    }

    /// Log-likelihood of the fit (up to family-standard constants).
    pub fn loglik(
        &self,
        y: ArrayView1<'_, f64>,
        mu: &Array1<f64>,
        eta: &Array1<f64>,
        weights: ArrayView1<'_, f64>,
    ) -> f64 {
        match self {
            Family::Gaussian => {
                let mut rss = 0.0;
                let mut wsum = 0.0;
                for i in 0..y.len() {
                    let r = y[i] - mu[i];
                    rss += weights[i] * r * r;
                    wsum += weights[i];
                }
                if wsum <= 0.0 || rss <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                -0.5 * wsum * ((2.0 * std::f64::consts::PI * rss / wsum).ln() + 1.0)
            }
            Family::Poisson => y
                .iter()
                .zip(mu.iter())
                .zip(weights.iter())
                .map(|((&yi, &mi), &wi)| wi * (yi * mi.ln() - mi - ln_gamma(yi + 1.0)))
                .sum(),
            Family::Logit => y
                .iter()
                .zip(mu.iter())
                .zip(weights.iter())
                .map(|((&yi, &mi), &wi)| wi * (yi * mi.ln() + (1.0 - yi) * (1.0 - mi).ln()))
                .sum(),
            Family::NegativeBinomial { theta } => {
                let th = theta.unwrap_or(1.0);
                negbin_loglik(y, mu, weights, th)
            }
            Family::Custom(c) => (c.loglik)(y, eta.view()),
        }
    }

    /// Family deviance: the quantity whose relative change drives IRLS
    /// convergence.
    pub fn deviance(
        &self,
        y: ArrayView1<'_, f64>,
        mu: &Array1<f64>,
        eta: &Array1<f64>,
        weights: ArrayView1<'_, f64>,
    ) -> f64 {
        match self {
            Family::Gaussian => y
                .iter()
                .zip(mu.iter())
                .zip(weights.iter())
                .map(|((&yi, &mi), &wi)| wi * (yi - mi) * (yi - mi))
                .sum(),
            Family::Poisson => {
                2.0 * y
                    .iter()
                    .zip(mu.iter())
                    .zip(weights.iter())
                    .map(|((&yi, &mi), &wi)| {
                        let term = if yi > 0.0 { yi * (yi / mi).ln() } else { 0.0 };
                        wi * (term - (yi - mi))
                    })
                    .sum::<f64>()
            }
            Family::Logit => {
                2.0 * y
                    .iter()
                    .zip(mu.iter())
                    .zip(weights.iter())
                    .map(|((&yi, &mi), &wi)| {
                        let mi_c = mi.clamp(PROB_EPS, 1.0 - PROB_EPS);
                        let t1 = if yi > PROB_EPS { yi * (yi.ln() - mi_c.ln()) } else { 0.0 };
                        let t0 = if yi < 1.0 - PROB_EPS {
                            (1.0 - yi) * ((1.0 - yi).ln() - (1.0 - mi_c).ln())
                        } else {
                            0.0
                        };
                        wi * (t1 + t0)
                    })
                    .sum::<f64>()
            }
            Family::NegativeBinomial { theta } => {
                let th = theta.unwrap_or(1.0);
                2.0 * y
                    .iter()
                    .zip(mu.iter())
                    .zip(weights.iter())
                    .map(|((&yi, &mi), &wi)| {
                        let term = if yi > 0.0 { yi * (yi / mi).ln() } else { 0.0 };
                        wi * (term - (yi + th) * ((yi + th) / (mi + th)).ln())
                    })
                    .sum::<f64>()
            }
            Family::Custom(_) => -2.0 * self.loglik(y, mu, eta, weights),
        }
    }
}

/// Negative binomial log-likelihood at fixed dispersion `theta`.
pub fn negbin_loglik(
    y: ArrayView1<'_, f64>,
    mu: &Array1<f64>,
    weights: ArrayView1<'_, f64>,
    theta: f64,
) -> f64 {
    y.iter()
        .zip(mu.iter())
        .zip(weights.iter())
        .map(|((&yi, &mi), &wi)| {
            wi * (ln_gamma(yi + theta) - ln_gamma(theta) - ln_gamma(yi + 1.0)
                + theta * (theta / (theta + mi)).ln()
                + yi * (mi / (theta + mi)).ln())
        })
        .sum()
}

/// Derivative of the negative binomial profile log-likelihood in `theta`,
/// used by the outer dispersion update.
pub fn negbin_theta_score(
    y: ArrayView1<'_, f64>,
    mu: &Array1<f64>,
    weights: ArrayView1<'_, f64>,
    theta: f64,
) -> f64 {
    y.iter()
        .zip(mu.iter())
        .zip(weights.iter())
        .map(|((&yi, &mi), &wi)| {
            wi * (digamma(yi + theta) - digamma(theta) + (theta / (theta + mi)).ln() + 1.0
                - (yi + theta) / (theta + mi))
        })
        .sum()
}
