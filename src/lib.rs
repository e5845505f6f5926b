//! Fixed-effects regression for linear and generalized linear models.
//!
//! The engine estimates models of the form
//!
//! ```text
//! g(E[y]) = X beta + fe_1 + fe_2 + ... + offset
//! ```
//!
//! where any number of high-dimensional fixed-effect dimensions are absorbed
//! by alternating projections rather than materialized as dummy columns
//! (Gaure 2013; Correia 2017). Non-Gaussian families (Poisson, logit,
//! negative binomial, user-supplied likelihoods) run the demeaning inside an
//! iteratively reweighted least squares loop (Berge 2018); the Gaussian
//! family is the single-iteration special case.
//!
//! Inference is sandwich-based: heteroskedasticity-robust and multiway
//! cluster-robust variance matrices share the bread of the final weighted
//! solve, with small-sample corrections applied as a single scalar.
//!
//! ```no_run
//! use feglm::{EstimationData, EstimationOptions, FactorSpec, Family, feglm};
//! use ndarray::{Array1, Array2};
//!
//! # fn demo(y: Array1<f64>, x: Array2<f64>, firm: Vec<i64>, year: Vec<i64>)
//! # -> Result<(), feglm::EstimationError> {
//! let data = EstimationData::new(y, x).with_factors(vec![
//!     FactorSpec::new("firm", firm),
//!     FactorSpec::new("year", year),
//! ]);
//! let model = feglm(&data, &Family::Poisson, EstimationOptions::global())?;
//! println!("{:?}", model.coefficients);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod demean;
pub mod factors;
pub mod family;
pub mod fit;
pub mod solve;
pub mod vcov;

pub use config::{EstimationOptions, Ssc};
pub use demean::{DemeanOptions, DemeanResult, demean, demean_vector};
pub use factors::{FactorDimension, FactorError, FactorRegistry, FactorSpec};
pub use family::{CustomFamily, Family};
pub use fit::{
    EstimationData, EstimationError, FittedModel, FixedEffects, IrlsStatus, feglm, feols,
};
pub use solve::{CollinearityInfo, SolveError, WlsFit, wls_solve};
pub use vcov::{ClusterSpec, CoefRow, VcovKind, VcovResult, coef_table, vcov};
