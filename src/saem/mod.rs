pub mod algorithm;
pub mod history;
pub mod mcmc;

pub use algorithm::SaemEstimator;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Residual-error summary returned alongside the main estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResInfo {
    /// `statrese`-based residual variance per endpoint; NaN for kinds where
    /// the statistic is a no-op and the estimate lives in `res_mat`.
    pub sigma2: Vec<f64>,
    pub ares: Vec<f64>,
    pub bres: Vec<f64>,
    pub cres: Vec<f64>,
    pub lres: Vec<f64>,
    pub res_mod: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaemResults {
    /// Residual scalars `(a, b, c, lambda)` per endpoint.
    pub res_mat: DMatrix<f64>,
    /// Transform table `(lambda, yj tag, low, high)` per endpoint.
    pub trans_mat: DMatrix<f64>,
    pub mprior_phi: DMatrix<f64>,
    pub mpost_phi: DMatrix<f64>,
    pub cpost_phi: DMatrix<f64>,
    pub gamma2_phi1: DMatrix<f64>,
    pub plambda: DVector<f64>,
    pub ha: DMatrix<f64>,
    pub hb: DMatrix<f64>,
    pub sig2: Vec<f64>,
    /// Posterior random effects, masked by `ue`.
    pub eta: DMatrix<f64>,
    /// One row per completed iteration: kept coefficients, kept variances,
    /// active residual scalars.
    pub par_hist: DMatrix<f64>,
    pub res_info: ResInfo,
    pub n_iterations: usize,
    pub interrupted: bool,
}

impl SaemResults {
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
