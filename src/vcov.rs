//! Variance engine: sandwich estimators over the fitted model's score
//! contributions.
//!
//! Every estimator shares the same bread, `(X'WX)^{-1}` from the final
//! weighted solve; the meat varies. Cluster-robust variances aggregate scores
//! within clusters before forming the outer product, and multiway clustering
//! combines the one-way meats by inclusion-exclusion over the non-empty
//! subsets of the requested dimensions (Cameron, Gelbach & Miller 2011).
//!
//! Small-sample corrections enter as one scalar multiplier on the finished
//! sandwich, so the same sandwich serves every correction policy.

use crate::config::Ssc;
use crate::fit::FittedModel;
use ahash::AHashMap;
use itertools::Itertools;
use ndarray::{Array1, Array2};
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VcovError {
    #[error("cluster dimension '{name}' has {found} rows, expected {expected} (pre-exclusion)")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("cluster request names no dimensions")]
    NoClusterDimensions,

    #[error("{found} cluster dimensions requested; inclusion-exclusion supports at most 8")]
    TooManyClusterDimensions { found: usize },

    #[error("cluster dimension '{name}' has a single cluster; variance is not identified")]
    SingleCluster { name: String },
}

/// One clustering dimension, specified over the ORIGINAL (pre-exclusion)
/// rows; the engine subsets to the estimation sample internally.
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    pub name: String,
    pub codes: Vec<i64>,
}

impl ClusterSpec {
    pub fn new(name: impl Into<String>, codes: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            codes,
        }
    }
}

/// Which variance estimator to compute.
#[derive(Debug, Clone)]
pub enum VcovKind {
    /// Homoskedastic: dispersion times the bread.
    Iid,
    /// Heteroskedasticity-robust (White).
    Hetero,
    /// Cluster-robust in one or more dimensions.
    Cluster(Vec<ClusterSpec>),
}

/// A computed variance matrix with its provenance.
#[derive(Debug, Clone)]
pub struct VcovResult {
    pub kind_label: String,
    /// Variance matrix over the kept columns.
    pub matrix: Array2<f64>,
    /// The scalar small-sample correction that was applied.
    pub ssc_factor: f64,
    /// Degrees of freedom for inference (smallest cluster count minus one
    /// under clustering, residual df otherwise).
    pub df: usize,
    /// Full-length standard errors; dropped columns carry NaN.
    pub se: Array1<f64>,
}

/// One row of the coefficient table.
#[derive(Debug, Clone)]
pub struct CoefRow {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
    pub z_value: f64,
    pub p_value: f64,
    /// 95% confidence bounds on the normal reference.
    pub conf_low: f64,
    pub conf_high: f64,
    /// False when the column was dropped as collinear.
    pub identified: bool,
}

/// Compute a variance matrix for a fitted model.
pub fn vcov(
    model: &FittedModel,
    kind: &VcovKind,
    ssc: &Ssc,
) -> Result<VcovResult, VcovError> {
    let n = model.n_obs as f64;
    let k_model = model.kept.len()
        + if ssc.count_fixed_effects {
            model.absorbed_df
        } else {
            0
        };
    let adj = if ssc.adj && n > k_model as f64 {
        (n - 1.0) / (n - k_model as f64)
    } else {
        1.0
    };

    match kind {
        VcovKind::Iid => {
            // Gaussian dispersion from the weighted working residuals; the
            // one-parameter families fix the dispersion at 1.
            let dispersion = if model.family.has_closed_form() {
                let rss: f64 = model
                    .working_residuals
                    .iter()
                    .zip(model.weights.iter())
                    .map(|(&e, &w)| w * e * e)
                    .sum();
                rss / model.residual_df as f64
            } else {
                1.0
            };
            let matrix = &model.bread * dispersion;
            Ok(finish(model, "iid".to_string(), matrix, 1.0, model.residual_df))
        }
        VcovKind::Hetero => {
            let meat = model.scores.t().dot(&model.scores);
            let matrix = sandwich(&model.bread, &meat);
            Ok(finish(model, "hetero".to_string(), matrix, adj, model.residual_df))
        }
        VcovKind::Cluster(specs) => {
            if specs.is_empty() {
                return Err(VcovError::NoClusterDimensions);
            }
            if specs.len() > 8 {
                return Err(VcovError::TooManyClusterDimensions { found: specs.len() });
            }

            // Subset each dimension's codes to the estimation sample.
            let mut codes: Vec<Vec<i64>> = Vec::with_capacity(specs.len());
            for spec in specs {
                let expected = model.kept_rows.len() + model.excluded_rows.len();
                if spec.codes.len() != expected {
                    return Err(VcovError::LengthMismatch {
                        name: spec.name.clone(),
                        expected,
                        found: spec.codes.len(),
                    });
                }
                codes.push(model.kept_rows.iter().map(|&i| spec.codes[i]).collect());
            }

            // Smallest cluster count across the single dimensions drives the
            // correction and the reported df.
            let mut g_min = usize::MAX;
            for (spec, dim_codes) in specs.iter().zip(&codes) {
                let g = distinct_count(dim_codes);
                if g < 2 {
                    return Err(VcovError::SingleCluster {
                        name: spec.name.clone(),
                    });
                }
                g_min = g_min.min(g);
            }

            // Inclusion-exclusion over non-empty dimension subsets: single
            // dimensions add, pairwise intersections subtract, and so on.
            let k = model.kept.len();
            let mut meat = Array2::<f64>::zeros((k, k));
            for mask in 1u32..(1 << specs.len()) {
                let sign = if mask.count_ones() % 2 == 1 { 1.0 } else { -1.0 };
                let subset: Vec<usize> = (0..specs.len())
                    .filter(|d| mask & (1 << d) != 0)
                    .collect();
                meat = meat + cluster_meat(&model.scores, &codes, &subset) * sign;
            }

            let cluster_adj = if ssc.cluster_adj {
                g_min as f64 / (g_min - 1) as f64
            } else {
                1.0
            };
            let matrix = sandwich(&model.bread, &meat);
            let label = format!(
                "cluster({})",
                specs.iter().map(|s| s.name.as_str()).join("^")
            );
            Ok(finish(model, label, matrix, adj * cluster_adj, g_min - 1))
        }
    }
}

/// The coefficient table for a model under a given variance estimate.
///
/// Inference uses the normal reference distribution; the `df` recorded on the
/// variance result is informational.
pub fn coef_table(model: &FittedModel, vcov: &VcovResult) -> Vec<CoefRow> {
    let normal = Normal::new(0.0, 1.0).ok();
    let crit = normal
        .as_ref()
        .map_or(f64::NAN, |n| n.inverse_cdf(0.975));
    model
        .covariate_names
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let identified = model.kept.contains(&j);
            let estimate = model.coefficients[j];
            let std_error = vcov.se[j];
            let z_value = if identified && std_error > 0.0 {
                estimate / std_error
            } else {
                f64::NAN
            };
            let p_value = match (&normal, z_value.is_finite()) {
                (Some(n), true) => 2.0 * (1.0 - n.cdf(z_value.abs())),
                _ => f64::NAN,
            };
            CoefRow {
                name: name.clone(),
                estimate,
                std_error,
                z_value,
                p_value,
                conf_low: estimate - crit * std_error,
                conf_high: estimate + crit * std_error,
                identified,
            }
        })
        .collect()
}

fn sandwich(bread: &Array2<f64>, meat: &Array2<f64>) -> Array2<f64> {
    let m = bread.dot(meat).dot(bread);
    // Symmetrize against factorization round-off.
    (&m + &m.t()) * 0.5
}

fn distinct_count(codes: &[i64]) -> usize {
    let mut seen = ahash::AHashSet::with_capacity(64);
    for &c in codes {
        seen.insert(c);
    }
    seen.len()
}

/// Meat for one (interacted) clustering subset: scores are summed within
/// each cluster and the summed vectors' outer products accumulated.
fn cluster_meat(scores: &Array2<f64>, codes: &[Vec<i64>], subset: &[usize]) -> Array2<f64> {
    let (n, k) = scores.dim();
    let mut group_of: AHashMap<Vec<i64>, usize> = AHashMap::with_capacity(64);
    let mut sums: Vec<Array1<f64>> = Vec::new();
    let mut key = Vec::with_capacity(subset.len());

    for i in 0..n {
        key.clear();
        for &d in subset {
            key.push(codes[d][i]);
        }
        let g = match group_of.get(&key) {
            Some(&g) => g,
            None => {
                let g = sums.len();
                group_of.insert(key.clone(), g);
                sums.push(Array1::zeros(k));
                g
            }
        };
        let row = scores.row(i);
        for (acc, &v) in sums[g].iter_mut().zip(row.iter()) {
            *acc += v;
        }
    }

    let mut meat = Array2::<f64>::zeros((k, k));
    for s in &sums {
        for a in 0..k {
            for b in 0..k {
                meat[[a, b]] += s[a] * s[b];
            }
        }
    }
    meat
}

fn finish(
    model: &FittedModel,
    kind_label: String,
    matrix: Array2<f64>,
    ssc_factor: f64,
    df: usize,
) -> VcovResult {
    let matrix = matrix * ssc_factor;
    let p = model.coefficients.len();
    let mut se = Array1::from_elem(p, f64::NAN);
    for (slot, &j) in model.kept.iter().enumerate() {
        let var = matrix[[slot, slot]];
        se[j] = if var >= 0.0 { var.sqrt() } else { f64::NAN };
    }
    if se.iter().any(|v| v.is_nan()) && se.len() > model.kept.len() {
        log::debug!("standard errors of dropped column(s) reported as NaN");
    }
    VcovResult {
        kind_label,
        matrix,
        ssc_factor,
        df,
        se,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EstimationOptions;
    use crate::factors::FactorSpec;
    use crate::fit::{EstimationData, feols};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, array};

    fn ssc_none() -> Ssc {
        Ssc {
            adj: false,
            cluster_adj: false,
            count_fixed_effects: false,
        }
    }

    fn small_panel() -> (EstimationData, Vec<i64>) {
        let y = array![1.2, 2.1, 2.9, 4.4, 5.1, 5.8, 7.3, 8.2];
        let x = arr2(&[
            [1.0],
            [2.0],
            [3.0],
            [4.0],
            [5.0],
            [6.0],
            [7.0],
            [8.0],
        ]);
        let entity = vec![0, 0, 0, 0, 1, 1, 1, 1];
        let data = EstimationData::new(y, x)
            .with_factors(vec![FactorSpec::new("entity", entity.clone())]);
        (data, entity)
    }

    #[test]
    fn iid_gaussian_matches_textbook_formula() {
        let (data, _) = small_panel();
        let model = feols(&data, &EstimationOptions::default()).unwrap();
        let v = vcov(&model, &VcovKind::Iid, &Ssc::default()).unwrap();

        let rss: f64 = model
            .working_residuals
            .iter()
            .zip(model.weights.iter())
            .map(|(&e, &w)| w * e * e)
            .sum();
        let sigma2 = rss / model.residual_df as f64;
        assert_abs_diff_eq!(v.matrix[[0, 0]], sigma2 * model.bread[[0, 0]], epsilon = 1e-14);
        assert_abs_diff_eq!(v.se[0], v.matrix[[0, 0]].sqrt(), epsilon = 1e-14);
    }

    #[test]
    fn singleton_clusters_reduce_to_hetero() {
        // One cluster per observation with corrections off: the cluster meat
        // is exactly the heteroskedastic meat.
        let (data, _) = small_panel();
        let model = feols(&data, &EstimationOptions::default()).unwrap();
        let hetero = vcov(&model, &VcovKind::Hetero, &ssc_none()).unwrap();
        let spec = ClusterSpec::new("obs", (0..8).collect());
        let clustered = vcov(&model, &VcovKind::Cluster(vec![spec]), &ssc_none()).unwrap();
        assert_abs_diff_eq!(
            hetero.matrix[[0, 0]],
            clustered.matrix[[0, 0]],
            epsilon = 1e-14
        );
    }

    #[test]
    fn cluster_ssc_factor_composition() {
        let (data, entity) = small_panel();
        let model = feols(&data, &EstimationOptions::default()).unwrap();
        let spec = ClusterSpec::new("entity", entity);
        let v = vcov(&model, &VcovKind::Cluster(vec![spec]), &Ssc::default()).unwrap();
        // N = 8, K = 1 kept + 2 absorbed, G = 2.
        let expected = (7.0 / 5.0) * (2.0 / 1.0);
        assert_abs_diff_eq!(v.ssc_factor, expected, epsilon = 1e-14);
        assert_eq!(v.df, 1);
    }

    #[test]
    fn two_way_clustering_is_order_invariant() {
        let y = array![1.0, 2.5, 3.2, 4.1, 5.7, 6.2, 7.9, 8.4, 9.1, 10.6, 11.2, 12.8];
        let x = arr2(&[
            [0.2],
            [1.1],
            [2.3],
            [3.1],
            [4.4],
            [5.2],
            [6.3],
            [7.1],
            [8.2],
            [9.4],
            [10.1],
            [11.3],
        ]);
        let a = vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3];
        let b = vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0, 1, 2];
        let data = EstimationData::new(y, x);
        let model = feols(&data, &EstimationOptions::default()).unwrap();

        let ab = vcov(
            &model,
            &VcovKind::Cluster(vec![
                ClusterSpec::new("a", a.clone()),
                ClusterSpec::new("b", b.clone()),
            ]),
            &Ssc::default(),
        )
        .unwrap();
        let ba = vcov(
            &model,
            &VcovKind::Cluster(vec![ClusterSpec::new("b", b), ClusterSpec::new("a", a)]),
            &Ssc::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(ab.matrix[[0, 0]], ba.matrix[[0, 0]], epsilon = 1e-12);
        assert_abs_diff_eq!(ab.ssc_factor, ba.ssc_factor, epsilon = 1e-14);
    }

    #[test]
    fn single_cluster_is_rejected() {
        let (data, _) = small_panel();
        let model = feols(&data, &EstimationOptions::default()).unwrap();
        let spec = ClusterSpec::new("all", vec![7; 8]);
        let err = vcov(&model, &VcovKind::Cluster(vec![spec]), &Ssc::default()).unwrap_err();
        assert!(matches!(err, VcovError::SingleCluster { .. }));
    }

    #[test]
    fn cluster_codes_use_pre_exclusion_rows() {
        // Row 2 is excluded for a NaN outcome; cluster codes stay full-length.
        let y = array![1.0, 2.0, f64::NAN, 4.0, 5.0, 6.0];
        let x = arr2(&[[1.0], [2.0], [3.0], [4.0], [5.0], [6.0]]);
        let data = EstimationData::new(y, x)
            .with_factors(vec![FactorSpec::new("g", vec![0, 0, 0, 1, 1, 1])]);
        let model = feols(&data, &EstimationOptions::default()).unwrap();
        assert_eq!(model.n_obs, 5);

        let spec = ClusterSpec::new("c", vec![0, 0, 1, 1, 2, 2]);
        let v = vcov(&model, &VcovKind::Cluster(vec![spec]), &Ssc::default()).unwrap();
        assert_eq!(v.df, 2); // 3 clusters survive exclusion

        let short = ClusterSpec::new("c", vec![0, 0, 1, 1, 2]);
        let err = vcov(&model, &VcovKind::Cluster(vec![short]), &Ssc::default()).unwrap_err();
        assert!(matches!(err, VcovError::LengthMismatch { .. }));
    }

    #[test]
    fn coef_table_reports_dropped_columns_as_unidentified() {
        let y = array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        // Second column is the group index: demeaned away, dropped.
        let x = arr2(&[
            [0.3, 1.0],
            [0.9, 1.0],
            [0.1, 2.0],
            [0.8, 2.0],
            [0.5, 3.0],
            [0.2, 3.0],
        ]);
        let data = EstimationData::new(y, x)
            .with_names(vec!["x".to_string(), "level".to_string()])
            .with_factors(vec![FactorSpec::new("g", vec![0, 0, 1, 1, 2, 2])]);
        let model = feols(&data, &EstimationOptions::default()).unwrap();
        let v = vcov(&model, &VcovKind::Hetero, &Ssc::default()).unwrap();
        let table = coef_table(&model, &v);
        assert_eq!(table.len(), 2);
        assert!(table[0].identified);
        assert!(table[0].p_value >= 0.0 && table[0].p_value <= 1.0);
        assert!(table[0].conf_low < table[0].estimate && table[0].estimate < table[0].conf_high);
        assert!(!table[1].identified);
        assert!(table[1].std_error.is_nan());
        assert_eq!(table[1].estimate, 0.0);
    }
}
