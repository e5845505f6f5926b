//! Linear core: weighted least squares on demeaned data, with collinearity
//! detection and dropping.
//!
//! The system is small (parameter-count squared), so it is assembled as
//! `X'WX` / `X'Wz` and solved single-threaded. Collinear columns are detected
//! up front by a pivoted Cholesky elimination on `X'WX`: a column whose
//! remaining pivot falls below a relative threshold is dropped and reported,
//! and the model proceeds on the reduced rank. Dropping is advisory even when
//! every column goes: the empty fit carries zero coefficients and leaves the
//! response untouched, which is exactly the fixed-effects-only model.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Inverse, InverseH, Solve, SolveH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SolveError {
    /// Raised by the estimation driver when every covariate column was
    /// dropped and no fixed effects remain to identify the model.
    #[error(
        "design matrix is singular: no identified columns remain after dropping {dropped} collinear column(s)"
    )]
    Singular { dropped: usize },

    #[error("linear system solve failed: {0}")]
    Factorization(#[from] ndarray_linalg::error::LinalgError),
}

/// Advisory record of dropped covariate columns.
#[derive(Debug, Clone, Default)]
pub struct CollinearityInfo {
    /// Indices (into the original covariate order) of dropped columns.
    pub dropped: Vec<usize>,
}

impl CollinearityInfo {
    pub fn is_empty(&self) -> bool {
        self.dropped.is_empty()
    }
}

/// Solution of one weighted least-squares problem.
#[derive(Debug, Clone)]
pub struct WlsFit {
    /// Full-length coefficient vector; dropped columns carry 0.0.
    pub coefficients: Array1<f64>,
    /// Indices of the kept (identified) columns.
    pub kept: Vec<usize>,
    pub collinearity: CollinearityInfo,
    /// `(X'WX)^{-1}` over the kept columns.
    pub xtx_inv: Array2<f64>,
    /// Weighted residual sum of squares.
    pub rss: f64,
    /// Fitted values `X β` (full design; dropped coefficients are zero).
    pub fitted: Array1<f64>,
}

/// Identify a maximal well-conditioned column subset of the Gram matrix.
///
/// Left-looking Cholesky over candidate columns; column `j` is dropped when
/// its remaining pivot is below `tol` times its original diagonal (or the
/// diagonal is not strictly positive, i.e. an all-zero column). Returns the
/// kept indices in order.
pub fn detect_collinear(xtx: &ArrayView2<'_, f64>, tol: f64) -> Vec<usize> {
    let p = xtx.nrows();
    let mut l = Array2::<f64>::zeros((p, p));
    let mut kept: Vec<usize> = Vec::with_capacity(p);

    for j in 0..p {
        let diag = xtx[[j, j]];
        let mut d = diag;
        for &c in &kept {
            d -= l[[j, c]] * l[[j, c]];
        }
        if !(diag > 0.0) || d <= tol * diag {
            continue; // collinear with the kept set (or identically zero)
        }
        let ljj = d.sqrt();
        l[[j, j]] = ljj;
        for i in (j + 1)..p {
            let mut v = xtx[[i, j]];
            for &c in &kept {
                v -= l[[i, c]] * l[[j, c]];
            }
            l[[i, j]] = v / ljj;
        }
        kept.push(j);
    }
    kept
}

/// Solve the weighted least-squares normal equations `(X'WX) β = X'Wz`.
///
/// Collinear columns are dropped first (see [`detect_collinear`]); the
/// reduced system is solved by a symmetric factorization with an LU fallback.
/// When every column is dropped the fit degenerates to zero coefficients and
/// `fitted = 0`; callers decide whether anything else identifies the model.
pub fn wls_solve(
    x: ArrayView2<'_, f64>,
    z: ArrayView1<'_, f64>,
    weights: ArrayView1<'_, f64>,
    collinearity_tolerance: f64,
) -> Result<WlsFit, SolveError> {
    let (n, p) = x.dim();
    debug_assert_eq!(n, z.len());
    debug_assert_eq!(n, weights.len());

    // X'WX and X'Wz via a weight-scaled copy of X.
    let mut wx = x.to_owned();
    for (mut row, &w) in wx.outer_iter_mut().zip(weights.iter()) {
        row *= w;
    }
    let xtx = x.t().dot(&wx);
    let xtz = wx.t().dot(&z);

    let kept = detect_collinear(&xtx.view(), collinearity_tolerance);
    let dropped: Vec<usize> = (0..p).filter(|j| !kept.contains(j)).collect();
    if !dropped.is_empty() {
        log::info!(
            "dropped {} collinear covariate column(s): {:?}",
            dropped.len(),
            dropped
        );
    }
    if kept.is_empty() {
        let rss = z
            .iter()
            .zip(weights.iter())
            .map(|(&zi, &wi)| wi * zi * zi)
            .sum();
        return Ok(WlsFit {
            coefficients: Array1::zeros(p),
            kept,
            collinearity: CollinearityInfo { dropped },
            xtx_inv: Array2::zeros((0, 0)),
            rss,
            fitted: Array1::zeros(n),
        });
    }

    let xtx_r = xtx.select(Axis(0), &kept).select(Axis(1), &kept);
    let xtz_r = xtz.select(Axis(0), &kept);

    let beta_r = match xtx_r.solveh(&xtz_r) {
        Ok(b) => b,
        Err(_) => xtx_r.solve(&xtz_r)?,
    };
    let xtx_inv = match xtx_r.invh() {
        Ok(inv) => inv,
        Err(_) => xtx_r.inv()?,
    };

    let mut coefficients = Array1::zeros(p);
    for (slot, &j) in kept.iter().enumerate() {
        coefficients[j] = beta_r[slot];
    }

    let fitted = x.dot(&coefficients);
    let rss = z
        .iter()
        .zip(fitted.iter())
        .zip(weights.iter())
        .map(|((&zi, &fi), &wi)| wi * (zi - fi) * (zi - fi))
        .sum();

    Ok(WlsFit {
        coefficients,
        kept,
        collinearity: CollinearityInfo { dropped },
        xtx_inv,
        rss,
        fitted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, arr2};

    #[test]
    fn plain_ols_recovers_coefficients() {
        // z = 2*x1 + 3*x2 exactly.
        let x = arr2(&[
            [1.0, 0.0],
            [0.0, 1.0],
            [1.0, 1.0],
            [2.0, 1.0],
            [1.0, 3.0],
        ]);
        let z = array![2.0, 3.0, 5.0, 7.0, 11.0];
        let w = Array1::ones(5);
        let fit = wls_solve(x.view(), z.view(), w.view(), 1e-10).unwrap();
        assert!(fit.collinearity.is_empty());
        assert_abs_diff_eq!(fit.coefficients[0], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(fit.coefficients[1], 3.0, epsilon = 1e-10);
        assert!(fit.rss < 1e-18);
    }

    #[test]
    fn weights_change_the_solution() {
        let x = arr2(&[[1.0], [1.0], [1.0]]);
        let z = array![0.0, 0.0, 3.0];
        let w_uniform = Array1::ones(3);
        let w_skewed = array![1.0, 1.0, 4.0];
        let a = wls_solve(x.view(), z.view(), w_uniform.view(), 1e-10).unwrap();
        let b = wls_solve(x.view(), z.view(), w_skewed.view(), 1e-10).unwrap();
        assert_abs_diff_eq!(a.coefficients[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(b.coefficients[0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn exact_linear_combination_is_dropped() {
        // Third column = col0 + col1.
        let x = arr2(&[
            [1.0, 0.0, 1.0],
            [0.0, 1.0, 1.0],
            [1.0, 1.0, 2.0],
            [2.0, 1.0, 3.0],
            [1.0, 3.0, 4.0],
        ]);
        let z = array![2.0, 3.0, 5.0, 7.0, 11.0];
        let w = Array1::ones(5);
        let fit = wls_solve(x.view(), z.view(), w.view(), 1e-10).unwrap();
        assert_eq!(fit.collinearity.dropped, vec![2]);
        assert_eq!(fit.kept, vec![0, 1]);
        assert_eq!(fit.coefficients[2], 0.0);
        // The reduced fit is still exact.
        assert_abs_diff_eq!(fit.coefficients[0], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(fit.coefficients[1], 3.0, epsilon = 1e-10);
    }

    #[test]
    fn zero_column_is_dropped_immediately() {
        let x = arr2(&[[0.0, 1.0], [0.0, 2.0], [0.0, 3.0]]);
        let z = array![2.0, 4.0, 6.0];
        let w = Array1::ones(3);
        let fit = wls_solve(x.view(), z.view(), w.view(), 1e-10).unwrap();
        assert_eq!(fit.collinearity.dropped, vec![0]);
        assert_abs_diff_eq!(fit.coefficients[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn all_columns_dropped_yields_the_empty_fit() {
        let x = arr2(&[[0.0], [0.0], [0.0]]);
        let z = array![1.0, 2.0, 3.0];
        let w = Array1::ones(3);
        let fit = wls_solve(x.view(), z.view(), w.view(), 1e-10).unwrap();
        assert!(fit.kept.is_empty());
        assert_eq!(fit.collinearity.dropped, vec![0]);
        assert_eq!(fit.coefficients[0], 0.0);
        assert_eq!(fit.xtx_inv.dim(), (0, 0));
        // Nothing fitted: the residual is z itself.
        assert!(fit.fitted.iter().all(|&v| v == 0.0));
        assert_abs_diff_eq!(fit.rss, 14.0, epsilon = 1e-12);
    }

    #[test]
    fn cholesky_factor_consistency() {
        // Full-rank Gram matrix keeps every column.
        let x = arr2(&[[1.0, 0.5], [0.2, 1.0], [0.7, 0.3]]);
        let xtx = x.t().dot(&x);
        assert_eq!(detect_collinear(&xtx.view(), 1e-10), vec![0, 1]);
    }

    #[test]
    fn detect_collinear_reports_true_rank() {
        // Rank 2: col2 = 2*col0 - col1.
        let x = arr2(&[
            [1.0, 2.0, 0.0],
            [2.0, 1.0, 3.0],
            [3.0, 1.0, 5.0],
            [1.0, 0.0, 2.0],
        ]);
        let xtx = x.t().dot(&x);
        let kept = detect_collinear(&xtx.view(), 1e-10);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept, vec![0, 1]);
    }
}
