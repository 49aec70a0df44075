use crate::predictor::SolverOptions;
use crate::residual::{EndpointSpec, ResidualKind, ResidualParams};
use crate::transform::{Transform, TransformKind};
use nalgebra::DMatrix;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Invalid(String),

    #[error("observation {index} (y = {value}) transforms to NaN for endpoint {endpoint}")]
    TransformedNan {
        index: usize,
        value: f64,
        endpoint: usize,
    },
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Derived sorting/replication fields of [`SaemConfig`] for a
/// single-replicate observation table.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub ix_sorting: Vec<usize>,
    pub y_offset: Vec<usize>,
    pub res_offset: Vec<usize>,
    pub ys_m: Vec<f64>,
    pub ix_id_m: Vec<usize>,
    pub indio_m: Vec<usize>,
    pub mlen: usize,
}

/// Builds the endpoint-sorted and chain-replicated index tables from the raw
/// observation table: `ix_endpnt` is each observation's endpoint and `ix_id`
/// its subject. Rows of the replicated block are chain-major, so subject `s`
/// of chain `m` is column `m·n + s`.
pub fn build_data_layout(
    y: &[f64],
    ix_endpnt: &[usize],
    ix_id: &[usize],
    n: usize,
    nmc: usize,
    nendpnt: usize,
) -> DataLayout {
    let k = y.len();
    let mut ix_sorting: Vec<usize> = (0..k).collect();
    ix_sorting.sort_by_key(|&i| ix_endpnt[i]);

    let mut y_offset = vec![0usize; nendpnt + 1];
    for &b in ix_endpnt {
        y_offset[b + 1] += 1;
    }
    for b in 0..nendpnt {
        y_offset[b + 1] += y_offset[b];
    }

    let mut res_offset = vec![0usize; nendpnt + 1];
    let mut ys_m = Vec::with_capacity(k * nmc);
    for b in 0..nendpnt {
        let kb = y_offset[b + 1] - y_offset[b];
        res_offset[b + 1] = res_offset[b] + kb * nmc;
        for _m in 0..nmc {
            for j in 0..kb {
                ys_m.push(y[ix_sorting[y_offset[b] + j]]);
            }
        }
    }

    let mut within = vec![0usize; n];
    let mut indio = Vec::with_capacity(k);
    for &s in ix_id {
        indio.push(within[s]);
        within[s] += 1;
    }
    let mlen = within.iter().copied().max().unwrap_or(0);

    let mut ix_id_m = Vec::with_capacity(k * nmc);
    let mut indio_m = Vec::with_capacity(k * nmc);
    for m in 0..nmc {
        for i in 0..k {
            ix_id_m.push(m * n + ix_id[i]);
            indio_m.push(indio[i]);
        }
    }

    DataLayout {
        ix_sorting,
        y_offset,
        res_offset,
        ys_m,
        ix_id_m,
        indio_m,
        mlen,
    }
}

/// The full estimation record handed to [`crate::SaemEstimator`]. Shapes use
/// `N` subjects, `M = nmc` chains, `nphi = nphi1 + nphi0` individual
/// parameters, `K = ntotal` observations.
#[derive(Debug, Clone)]
pub struct SaemConfig {
    // iteration schedule
    pub niter: usize,
    pub nmc: usize,
    /// Sweep counts for the three Metropolis kernels.
    pub nu: [usize; 3],
    pub nb_sa: usize,
    pub nb_correl: usize,
    pub nb_fix_omega: usize,
    pub nb_fix_resid: usize,
    pub niter_phi0: usize,
    pub coef_sa: f64,
    pub coef_phi0: f64,
    /// Random-walk proposal variance scale.
    pub rmcmc: f64,
    /// Step-size sequence for the sufficient statistics, length `niter`.
    pub pas: Vec<f64>,
    /// Step-size sequence for the Fisher accumulators, length `niter`.
    pub pash: Vec<f64>,
    /// Diagonal floor for the random-effect covariance, length `nphi`.
    pub minv: Vec<f64>,

    // model topology
    pub n: usize,
    pub ntotal: usize,
    /// phi columns with a regression mean (block 1) and fixed mean (block 0).
    pub i1: Vec<usize>,
    pub i0: Vec<usize>,
    /// Covariate design `N × nlambda1`; column l drives coefficient l.
    pub cov1: DMatrix<f64>,
    /// Loading pattern `nlambda1 × nphi1`; row l is the unit row of the phi
    /// column coefficient l enters.
    pub lcov1: DMatrix<f64>,
    /// `cov1ᵀ · cov1`.
    pub cov21: DMatrix<f64>,
    /// Coefficient matrix `nlambda1 × nphi1`, initial values filled in.
    pub mcov1: DMatrix<f64>,
    /// Positions of the free coefficients inside `mcov1`.
    pub jcov1: Vec<(usize, usize)>,
    pub cov0: DMatrix<f64>,
    pub lcov0: DMatrix<f64>,
    pub cov20: DMatrix<f64>,
    pub mcov0: DMatrix<f64>,
    pub jcov0: Vec<(usize, usize)>,
    /// Structural mask over `gamma2_phi1`; zero entries stay zero.
    pub covstruct1: DMatrix<f64>,
    /// Coefficients held at their initial values.
    pub fixed_ix1: Vec<usize>,
    pub fixed_ix0: Vec<usize>,
    pub gamma2_phi1_init: DMatrix<f64>,
    pub gamma2_phi0_init: DMatrix<f64>,

    // random-effect freezing
    pub gamma2_phi1_fixed: bool,
    pub gamma2_phi1_fixed_ix: DMatrix<f64>,
    pub gamma2_phi1_fixed_values: DMatrix<f64>,

    // data
    pub y: Vec<f64>,
    pub evt: DMatrix<f64>,
    /// Event matrix replicated over the `nmc` chains, ids `0..N·M`.
    pub evt_m: DMatrix<f64>,
    /// Initial individual-parameter sample, `(N·M) × nphi`, chain-major rows.
    pub phi_m: DMatrix<f64>,
    /// Row-within-subject of each replicated observation, length `K·M`.
    pub indio_m: Vec<usize>,
    /// Largest observation count of any subject.
    pub mlen: usize,
    /// Permutation of `0..K` grouping observations by endpoint.
    pub ix_sorting: Vec<usize>,
    /// Endpoint slice offsets into the sorted observations, length `nendpnt+1`.
    pub y_offset: Vec<usize>,
    /// Endpoint slice offsets into the replicated sorted block, length `nendpnt+1`.
    pub res_offset: Vec<usize>,
    /// Endpoint of each observation, length `K`.
    pub ix_endpnt: Vec<usize>,
    /// Subject-chain column of each replicated observation, length `K·M`.
    pub ix_id_m: Vec<usize>,
    /// Observations sorted by endpoint and replicated per chain, length `K·M`.
    pub ys_m: Vec<f64>,
    pub nendpnt: usize,

    // residual model per endpoint
    pub res_mod: Vec<i32>,
    pub ares: Vec<f64>,
    pub bres: Vec<f64>,
    pub cres: Vec<f64>,
    pub lres: Vec<f64>,
    /// Pin values for frozen residual scalars, `(a, b, c, lambda)` each.
    pub res_value: Vec<[f64; 4]>,
    pub res_fixed: Vec<[bool; 4]>,
    /// Combine rule for add+prop / add+pow, 1 or 2.
    pub add_prop: Vec<u8>,
    pub prop_t: Vec<bool>,
    pub yj: Vec<i32>,
    pub low: Vec<f64>,
    pub hi: Vec<f64>,
    pub lambda: Vec<f64>,

    // optimizer tuning
    pub itmax: usize,
    pub tol: f64,
    /// 1 = Nelder–Mead, 2 = coordinate descent with simplex fallback.
    pub opt_type: i32,
    pub lambda_range: f64,
    pub pow_range: f64,
    pub max_ode_recalc: usize,
    pub ode_recalc_factor: f64,
    pub solver: SolverOptions,

    // masking
    /// `N × nphi`; a zero entry pins that coordinate to its prior mean.
    pub ue: DMatrix<f64>,

    // reporting
    /// Log every `print` iterations; 0 disables.
    pub print: usize,
    pub par_hist_theta_keep: Vec<usize>,
    pub par_hist_omega_keep: Vec<usize>,
    /// 1 = Gaussian, 2 = Poisson, 3 = Bernoulli.
    pub distribution: i32,
    pub phi_m_file: Option<PathBuf>,
    pub seed: Option<u64>,
    /// Checked at the end of each iteration; when set the fit returns its
    /// partial state.
    pub interrupt: Option<Arc<AtomicBool>>,
}

impl SaemConfig {
    pub fn nphi1(&self) -> usize {
        self.i1.len()
    }

    pub fn nphi0(&self) -> usize {
        self.i0.len()
    }

    pub fn nphi(&self) -> usize {
        self.i1.len() + self.i0.len()
    }

    pub fn nlambda1(&self) -> usize {
        self.jcov1.len()
    }

    pub fn nlambda0(&self) -> usize {
        self.jcov0.len()
    }

    /// Per-endpoint residual context assembled from the raw tag fields.
    pub fn endpoint_specs(&self) -> Result<Vec<EndpointSpec>, ConfigError> {
        (0..self.nendpnt)
            .map(|b| {
                let kind = ResidualKind::from_tag(self.res_mod[b])
                    .ok_or_else(|| invalid(format!("unknown res_mod tag {}", self.res_mod[b])))?;
                let tkind = TransformKind::from_tag(self.yj[b])
                    .ok_or_else(|| invalid(format!("unknown transform tag {}", self.yj[b])))?;
                Ok(EndpointSpec {
                    kind,
                    transform: Transform::new(tkind, self.lambda[b], self.low[b], self.hi[b]),
                    prop_t: self.prop_t[b],
                    add_prop: self.add_prop[b],
                    frozen: self.res_fixed[b],
                    frozen_values: self.res_value[b],
                    lambda_range: self.lambda_range,
                    pow_range: self.pow_range,
                })
            })
            .collect()
    }

    pub fn initial_res_params(&self) -> Vec<ResidualParams> {
        (0..self.nendpnt)
            .map(|b| ResidualParams {
                ares: self.ares[b],
                bres: self.bres[b],
                cres: self.cres[b],
                lres: self.lres[b],
            })
            .collect()
    }

    /// Shape and consistency checks; fails fast before the iteration loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = self.n;
        let k = self.ntotal;
        let km = k * self.nmc;
        let nphi = self.nphi();
        let nphi1 = self.nphi1();
        let nphi0 = self.nphi0();
        let nl1 = self.nlambda1();
        let nl0 = self.nlambda0();

        if self.niter == 0 {
            return Err(invalid("niter must be positive"));
        }
        if self.nmc == 0 {
            return Err(invalid("nmc must be positive"));
        }
        if n == 0 || k == 0 {
            return Err(invalid("N and ntotal must be positive"));
        }
        if nphi1 == 0 {
            return Err(invalid("at least one regressed parameter is required"));
        }
        if self.pas.len() != self.niter || self.pash.len() != self.niter {
            return Err(invalid(format!(
                "pas/pash must have length niter = {} (got {} / {})",
                self.niter,
                self.pas.len(),
                self.pash.len()
            )));
        }
        if self.pas.iter().chain(self.pash.iter()).any(|&p| p <= 0.0 || p > 1.0) {
            return Err(invalid("step sizes must lie in (0, 1]"));
        }
        if self.minv.len() != nphi {
            return Err(invalid(format!(
                "minv must have length nphi = {nphi} (got {})",
                self.minv.len()
            )));
        }
        let mut seen = vec![false; nphi];
        for &c in self.i1.iter().chain(self.i0.iter()) {
            if c >= nphi || seen[c] {
                return Err(invalid("i1/i0 must partition the phi columns"));
            }
            seen[c] = true;
        }
        if self.cov1.shape() != (n, nl1) {
            return Err(invalid(format!(
                "COV1 must be N x nlambda1 = {n} x {nl1}, got {:?}",
                self.cov1.shape()
            )));
        }
        for (mat, name) in [(&self.lcov1, "LCOV1"), (&self.mcov1, "MCOV1")] {
            if mat.shape() != (nl1, nphi1) {
                return Err(invalid(format!(
                    "{name} must be nlambda1 x nphi1 = {nl1} x {nphi1}, got {:?}",
                    mat.shape()
                )));
            }
        }
        if self.cov21.shape() != (nl1, nl1) {
            return Err(invalid("COV21 must be nlambda1 x nlambda1"));
        }
        for &(r, c) in &self.jcov1 {
            if r >= nl1 || c >= nphi1 {
                return Err(invalid("jcov1 position out of range"));
            }
        }
        if nphi0 > 0 {
            if self.cov0.shape() != (n, nl0) {
                return Err(invalid("COV0 must be N x nlambda0"));
            }
            if self.lcov0.shape() != (nl0, nphi0) || self.mcov0.shape() != (nl0, nphi0) {
                return Err(invalid("LCOV0/MCOV0 must be nlambda0 x nphi0"));
            }
            if self.cov20.shape() != (nl0, nl0) {
                return Err(invalid("COV20 must be nlambda0 x nlambda0"));
            }
            if self.gamma2_phi0_init.shape() != (nphi0, nphi0) {
                return Err(invalid("gamma2_phi0_init must be nphi0 x nphi0"));
            }
        }
        for (mat, name) in [
            (&self.gamma2_phi1_init, "gamma2_phi1_init"),
            (&self.covstruct1, "covstruct1"),
            (&self.gamma2_phi1_fixed_ix, "Gamma2_phi1fixedIx"),
            (&self.gamma2_phi1_fixed_values, "Gamma2_phi1fixedValues"),
        ] {
            if mat.shape() != (nphi1, nphi1) {
                return Err(invalid(format!("{name} must be nphi1 x nphi1")));
            }
        }
        for &ix in self.fixed_ix1.iter() {
            if ix >= nl1 {
                return Err(invalid("fixed.i1 index out of range"));
            }
        }
        for &ix in self.fixed_ix0.iter() {
            if ix >= nl0 {
                return Err(invalid("fixed.i0 index out of range"));
            }
        }

        if self.y.len() != k {
            return Err(invalid("y must have length ntotal"));
        }
        if self.phi_m.shape() != (n * self.nmc, nphi) {
            return Err(invalid(format!(
                "phiM must be (N*nmc) x nphi = {} x {nphi}, got {:?}",
                n * self.nmc,
                self.phi_m.shape()
            )));
        }
        if self.ue.shape() != (n, nphi) {
            return Err(invalid("ue must be N x nphi"));
        }
        if self.ix_endpnt.len() != k {
            return Err(invalid("ix_endpnt must have length ntotal"));
        }
        if self.ix_endpnt.iter().any(|&b| b >= self.nendpnt) {
            return Err(invalid("ix_endpnt entry out of range"));
        }
        if self.ix_id_m.len() != km || self.indio_m.len() != km || self.ys_m.len() != km {
            return Err(invalid("ix_idM / indioM / ysM must have length ntotal*nmc"));
        }
        if self.ix_id_m.iter().any(|&c| c >= n * self.nmc) {
            return Err(invalid("ix_idM entry out of range"));
        }
        if self.indio_m.iter().any(|&r| r >= self.mlen) {
            return Err(invalid("indioM entry exceeds mlen"));
        }
        let mut perm = self.ix_sorting.clone();
        perm.sort_unstable();
        if perm.len() != k || perm.iter().enumerate().any(|(i, &v)| i != v) {
            return Err(invalid("ix_sorting must be a permutation of 0..ntotal"));
        }
        for (offsets, total, name) in [
            (&self.y_offset, k, "y_offset"),
            (&self.res_offset, km, "res_offset"),
        ] {
            if offsets.len() != self.nendpnt + 1
                || offsets[0] != 0
                || *offsets.last().unwrap_or(&0) != total
                || offsets.windows(2).any(|w| w[0] > w[1])
            {
                return Err(invalid(format!(
                    "{name} must be a non-decreasing offset table ending at {total}"
                )));
            }
        }
        // ysM must be the endpoint-major replication of the sorted observations
        for b in 0..self.nendpnt {
            let kb = self.y_offset[b + 1] - self.y_offset[b];
            if self.res_offset[b + 1] - self.res_offset[b] != kb * self.nmc {
                return Err(invalid("res_offset is inconsistent with y_offset"));
            }
            for m in 0..self.nmc {
                for j in 0..kb {
                    let src = self.y[self.ix_sorting[self.y_offset[b] + j]];
                    let dst = self.ys_m[self.res_offset[b] + m * kb + j];
                    if src != dst && !(src.is_nan() && dst.is_nan()) {
                        return Err(invalid("ysM does not match the sorted observations"));
                    }
                }
            }
        }

        if !self.evt.is_empty() {
            let mut prev = f64::NEG_INFINITY;
            for r in 0..self.evt.nrows() {
                let id = self.evt[(r, 0)];
                if id < prev {
                    return Err(invalid("event id column must be non-decreasing"));
                }
                prev = id;
            }
        }
        if self.evt_m.is_empty() {
            return Err(invalid("replicated event matrix evtM is required"));
        }

        for (v, name) in [
            (self.res_mod.len(), "res.mod"),
            (self.ares.len(), "ares"),
            (self.bres.len(), "bres"),
            (self.cres.len(), "cres"),
            (self.lres.len(), "lres"),
            (self.res_value.len(), "resValue"),
            (self.res_fixed.len(), "resFixed"),
            (self.add_prop.len(), "addProp"),
            (self.prop_t.len(), "propT"),
            (self.yj.len(), "yj"),
            (self.low.len(), "low"),
            (self.hi.len(), "hi"),
            (self.lambda.len(), "lambda"),
        ] {
            if v != self.nendpnt {
                return Err(invalid(format!("{name} must have one entry per endpoint")));
            }
        }
        if self.add_prop.iter().any(|&c| c != 1 && c != 2) {
            return Err(invalid("addProp entries must be 1 or 2"));
        }
        if !(self.opt_type == 1 || self.opt_type == 2) {
            return Err(invalid("optimizer type must be 1 or 2"));
        }
        if self.lambda_range <= 0.0 || self.pow_range <= 0.0 {
            return Err(invalid("lambdaRange and powRange must be positive"));
        }
        if self.ode_recalc_factor <= 1.0 {
            return Err(invalid("odeRecalcFactor must exceed 1"));
        }
        for &ix in &self.par_hist_theta_keep {
            if ix >= nl1 + nl0 {
                return Err(invalid("parHistThetaKeep index out of range"));
            }
        }
        for &ix in &self.par_hist_omega_keep {
            if ix >= nphi1 {
                return Err(invalid("parHistOmegaKeep index out of range"));
            }
        }

        // transformed observations must be finite; this is a hard error
        let specs = self.endpoint_specs()?;
        for (i, &yi) in self.y.iter().enumerate() {
            let b = self.ix_endpnt[i];
            let spec = &specs[b];
            let params = ResidualParams {
                ares: self.ares[b],
                bres: self.bres[b],
                cres: self.cres[b],
                lres: self.lres[b],
            };
            if spec.current_transform(&params).forward(yi).is_nan() {
                return Err(ConfigError::TransformedNan {
                    index: i,
                    value: yi,
                    endpoint: b,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::linear_config;

    #[test]
    fn test_valid_config_passes() {
        let cfg = linear_config(4, 3, 2, 42);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_step_size_length_checked() {
        let mut cfg = linear_config(4, 3, 2, 42);
        cfg.pas.pop();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("pas"));
    }

    #[test]
    fn test_phi_m_shape_checked() {
        let mut cfg = linear_config(4, 3, 2, 42);
        cfg.phi_m = DMatrix::zeros(3, 1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_transform_nan_is_hard_error() {
        let mut cfg = linear_config(4, 3, 2, 42);
        cfg.yj = vec![3]; // log transform
        cfg.y[0] = -1.0;
        // keep the sorted replication consistent with the mutated observation
        let k = cfg.ntotal;
        for m in 0..cfg.nmc {
            for j in 0..k {
                cfg.ys_m[m * k + j] = cfg.y[cfg.ix_sorting[j]];
            }
        }
        match cfg.validate() {
            Err(ConfigError::TransformedNan { index, .. }) => assert_eq!(index, 0),
            other => panic!("expected TransformedNan, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_res_mod_rejected() {
        let mut cfg = linear_config(4, 3, 2, 42);
        cfg.res_mod = vec![99];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_sorting_permutation_checked() {
        let mut cfg = linear_config(4, 3, 2, 42);
        cfg.ix_sorting[0] = cfg.ix_sorting[1];
        assert!(cfg.validate().is_err());
    }
}
