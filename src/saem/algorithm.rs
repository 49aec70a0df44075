use super::history::ChainDump;
use super::{ResInfo, SaemResults};
use crate::config::{ConfigError, SaemConfig};
use crate::likelihood::{column_deviance, fill_dyf, ObservationDistribution};
use crate::predictor::{Predictor, RetryingPredictor};
use crate::residual::{
    optimize_endpoint, residual_stat, step_update, EndpointSpec, OptimizerSettings, ResidualKind,
    ResidualParams,
};
use anyhow::{anyhow, Context, Result};
use log::{error, info};
use nalgebra::{Cholesky, DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::Ordering;

/// The SAEM estimation engine. Owns every piece of mutable state for the
/// duration of one `fit`; the MCMC kernels and the residual optimizer borrow
/// it one call at a time.
pub struct SaemEstimator<P: Predictor> {
    pub(super) cfg: SaemConfig,
    pub(super) predictor: RetryingPredictor<P>,
    pub(super) rng: StdRng,
    pub(super) dist: ObservationDistribution,

    // per-endpoint residual context
    pub(super) specs: Vec<EndpointSpec>,
    pub(super) res_params: Vec<ResidualParams>,
    opt_settings: OptimizerSettings,

    // replicated observation data
    pub(super) y_m: Vec<f64>,
    pub(super) ix_endpnt_m: Vec<usize>,
    pub(super) cens: Vec<f64>,
    pub(super) limit: Vec<f64>,
    /// Observation indices per subject-chain column.
    pub(super) col_obs: Vec<Vec<usize>>,

    // sampled state
    pub(super) phi_m: DMatrix<f64>,
    pub(super) fsave: Vec<f64>,
    pub(super) u_y: DVector<f64>,
    fs_m: Vec<f64>,

    // prior moments and their decompositions, refreshed each iteration
    pub(super) mprior_phi1: DMatrix<f64>,
    pub(super) mprior_phi0: DMatrix<f64>,
    pub(super) gamma2_phi1: DMatrix<f64>,
    pub(super) gamma2_phi0: DMatrix<f64>,
    pub(super) chol1: DMatrix<f64>,
    pub(super) chol0: DMatrix<f64>,
    pub(super) igamma1: DMatrix<f64>,
    pub(super) igamma0: DMatrix<f64>,

    // regression coefficients
    plambda1: DVector<f64>,
    plambda0: DVector<f64>,
    plambda1_init: DVector<f64>,
    plambda0_init: DVector<f64>,
    mcov1: DMatrix<f64>,
    mcov0: DMatrix<f64>,

    // sufficient statistics
    statphi11: DMatrix<f64>,
    statphi12: DMatrix<f64>,
    statphi01: DMatrix<f64>,
    statphi02: DMatrix<f64>,
    statrese: Vec<f64>,

    // posterior moments
    mpost_phi: DMatrix<f64>,
    cpost_phi: DMatrix<f64>,

    // Fisher-information accumulators over (Plambda1, diag Gamma1)
    fisher_l: DVector<f64>,
    ha: DMatrix<f64>,
    hb: DMatrix<f64>,

    par_hist: DMatrix<f64>,
    completed: usize,
    interrupted: bool,
}

impl<P: Predictor> SaemEstimator<P> {
    pub fn new(cfg: SaemConfig, predictor: P) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let specs = cfg.endpoint_specs()?;
        let res_params = cfg.initial_res_params();

        let n = cfg.n;
        let k = cfg.ntotal;
        let km = k * cfg.nmc;
        let nm = n * cfg.nmc;
        let nphi1 = cfg.nphi1();
        let nphi0 = cfg.nphi0();
        let nphi = cfg.nphi();
        let nl1 = cfg.nlambda1();
        let nl0 = cfg.nlambda0();

        let rng = match cfg.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let y_m: Vec<f64> = (0..km).map(|i| cfg.y[i % k]).collect();
        let ix_endpnt_m: Vec<usize> = (0..km).map(|i| cfg.ix_endpnt[i % k]).collect();
        let mut col_obs: Vec<Vec<usize>> = vec![Vec::new(); nm];
        for (i, &c) in cfg.ix_id_m.iter().enumerate() {
            col_obs[c].push(i);
        }

        let plambda1_init = DVector::from_fn(nl1, |l, _| cfg.mcov1[cfg.jcov1[l]]);
        let plambda0_init = DVector::from_fn(nl0, |l, _| cfg.mcov0[cfg.jcov0[l]]);
        let mprior_phi1 = &cfg.cov1 * &cfg.mcov1;
        let mprior_phi0 = if nphi0 > 0 {
            &cfg.cov0 * &cfg.mcov0
        } else {
            DMatrix::zeros(n, 0)
        };

        let res_cols: usize = specs
            .iter()
            .map(|s| s.kind.active().iter().filter(|&&a| a).count())
            .sum();
        let hist_cols = cfg.par_hist_theta_keep.len() + cfg.par_hist_omega_keep.len() + res_cols;
        let nb_param = nl1 + nphi1;

        let predictor = RetryingPredictor::new(
            predictor,
            cfg.solver.clone(),
            cfg.max_ode_recalc,
            cfg.ode_recalc_factor,
        );

        Ok(Self {
            dist: ObservationDistribution::Gaussian,
            specs,
            res_params,
            opt_settings: OptimizerSettings {
                opt_type: cfg.opt_type,
                itmax: cfg.itmax,
                tol: cfg.tol,
            },
            y_m,
            ix_endpnt_m,
            cens: vec![0.0; km],
            limit: vec![f64::NEG_INFINITY; km],
            col_obs,
            phi_m: cfg.phi_m.clone(),
            fsave: vec![0.0; km],
            u_y: DVector::zeros(nm),
            fs_m: vec![0.0; km],
            mprior_phi1,
            mprior_phi0,
            gamma2_phi1: cfg.gamma2_phi1_init.clone(),
            gamma2_phi0: cfg.gamma2_phi0_init.clone(),
            chol1: DMatrix::zeros(nphi1, nphi1),
            chol0: DMatrix::zeros(nphi0, nphi0),
            igamma1: DMatrix::zeros(nphi1, nphi1),
            igamma0: DMatrix::zeros(nphi0, nphi0),
            plambda1: plambda1_init.clone(),
            plambda0: plambda0_init.clone(),
            plambda1_init,
            plambda0_init,
            mcov1: cfg.mcov1.clone(),
            mcov0: cfg.mcov0.clone(),
            statphi11: DMatrix::zeros(n, nphi1),
            statphi12: DMatrix::zeros(nphi1, nphi1),
            statphi01: DMatrix::zeros(n, nphi0),
            statphi02: DMatrix::zeros(nphi0, nphi0),
            statrese: vec![0.0; cfg.nendpnt],
            mpost_phi: DMatrix::zeros(n, nphi),
            cpost_phi: DMatrix::zeros(nphi, nphi),
            fisher_l: DVector::zeros(nb_param),
            ha: DMatrix::zeros(nb_param, nb_param),
            hb: DMatrix::zeros(nb_param, nb_param),
            par_hist: DMatrix::zeros(cfg.niter, hist_cols),
            completed: 0,
            interrupted: false,
            rng,
            predictor,
            cfg,
        })
    }

    pub fn config(&self) -> &SaemConfig {
        &self.cfg
    }

    pub fn fit(&mut self) -> Result<SaemResults> {
        match ObservationDistribution::from_tag(self.cfg.distribution) {
            Some(d) => self.dist = d,
            None => {
                error!(
                    "unknown distribution tag {}; no iterations run",
                    self.cfg.distribution
                );
                return Ok(self.results());
            }
        }

        info!(
            "starting SAEM: {} subjects, {} chains, {} iterations, {} endpoint(s)",
            self.cfg.n, self.cfg.nmc, self.cfg.niter, self.cfg.nendpnt
        );
        let mut dump = ChainDump::create(self.cfg.phi_m_file.as_deref())
            .context("opening phiM dump file")?;

        self.initial_predict().context("initial prediction failed")?;

        for k in 0..self.cfg.niter {
            self.refresh_prior(k)?;
            self.run_mcmc_cycle(k)?;
            self.accumulate_statistics(k);
            self.mstep_means(k)?;
            self.mstep_covariance(k);
            self.mstep_residual(k);
            self.update_fisher(k);
            self.record_history(k);
            dump.append(&self.phi_m).context("writing phiM dump")?;

            if self.cfg.print > 0 && k % self.cfg.print == 0 {
                info!(
                    "iteration {k}: Plambda1 = {:?}, diag(Gamma1) = {:?}",
                    self.plambda1.as_slice(),
                    self.gamma2_phi1.diagonal().as_slice()
                );
            }
            if let Some(flag) = &self.cfg.interrupt {
                if flag.load(Ordering::Relaxed) {
                    info!("interrupt requested; stopping after iteration {k}");
                    self.interrupted = true;
                    break;
                }
            }
        }

        info!("SAEM finished after {} iteration(s)", self.completed);
        Ok(self.results())
    }

    /// Solve for the initial sample: caches predictions, captures the
    /// per-observation censoring flags and limits, and computes the starting
    /// deviance.
    fn initial_predict(&mut self) -> Result<()> {
        let preds = self
            .predictor
            .predict(&self.phi_m, &self.cfg.evt_m)
            .context("predictor rejected the initial sample")?;
        if preds.nrows() != self.y_m.len() {
            return Err(anyhow!(
                "predictor returned {} observation rows, expected {}",
                preds.nrows(),
                self.y_m.len()
            ));
        }
        for i in 0..preds.nrows() {
            self.fsave[i] = preds[(i, 0)];
            self.cens[i] = preds[(i, 1)];
            self.limit[i] = preds[(i, 2)];
        }
        self.u_y = self.deviance_of(&self.fsave);
        Ok(())
    }

    pub(super) fn deviance_of(&self, f: &[f64]) -> DVector<f64> {
        let mut dyf = DMatrix::zeros(self.cfg.mlen, self.phi_m.nrows());
        fill_dyf(
            &mut dyf,
            self.dist,
            &self.specs,
            &self.res_params,
            &self.y_m,
            f,
            &self.cens,
            &self.limit,
            &self.ix_endpnt_m,
            &self.cfg.indio_m,
            &self.cfg.ix_id_m,
        );
        column_deviance(&dyf)
    }

    /// Evaluate a proposed parameter block: one predictor call for the whole
    /// replicated population, then per-column deviance sums.
    pub(super) fn eval_block(&mut self, phi_c: &DMatrix<f64>) -> Result<(DVector<f64>, Vec<f64>)> {
        let preds = self
            .predictor
            .predict(phi_c, &self.cfg.evt_m)
            .context("prediction failed during MCMC")?;
        if preds.nrows() != self.y_m.len() {
            return Err(anyhow!(
                "predictor returned {} observation rows, expected {}",
                preds.nrows(),
                self.y_m.len()
            ));
        }
        let f: Vec<f64> = (0..preds.nrows()).map(|i| preds[(i, 0)]).collect();
        let u = self.deviance_of(&f);
        Ok((u, f))
    }

    /// Iteration step 1: Cholesky and symmetric inverse of the random-effect
    /// covariances used by both the kernels and the M-step.
    fn refresh_prior(&mut self, k: usize) -> Result<()> {
        let chol = Cholesky::new(self.gamma2_phi1.clone()).ok_or_else(|| {
            anyhow!("random-effect covariance is not positive definite at iteration {k}")
        })?;
        self.igamma1 = chol.inverse();
        self.chol1 = chol.l();
        if self.cfg.nphi0() > 0 {
            let chol0 = Cholesky::new(self.gamma2_phi0.clone()).ok_or_else(|| {
                anyhow!("fixed-block covariance is not positive definite at iteration {k}")
            })?;
            self.igamma0 = chol0.inverse();
            self.chol0 = chol0.l();
        }
        Ok(())
    }

    /// Iteration steps 3–4: per-chain sums of the sampled parameters and
    /// their cross-products, stochastic-approximation update of every
    /// accumulator, and the cached sorted predictions for the residual step.
    fn accumulate_statistics(&mut self, k: usize) {
        let pas = self.cfg.pas[k];
        let n = self.cfg.n;
        let m = self.cfg.nmc as f64;
        let nphi1 = self.cfg.nphi1();
        let nphi0 = self.cfg.nphi0();
        let nphi = self.cfg.nphi();

        let mut stat11 = DMatrix::zeros(n, nphi1);
        let mut stat12 = DMatrix::zeros(nphi1, nphi1);
        let mut stat01 = DMatrix::zeros(n, nphi0);
        let mut stat02 = DMatrix::zeros(nphi0, nphi0);
        for chain in 0..self.cfg.nmc {
            let phi1 =
                DMatrix::from_fn(n, nphi1, |r, c| self.phi_m[(chain * n + r, self.cfg.i1[c])]);
            stat12 += phi1.transpose() * &phi1;
            stat11 += phi1;
            if nphi0 > 0 {
                let phi0 =
                    DMatrix::from_fn(n, nphi0, |r, c| self.phi_m[(chain * n + r, self.cfg.i0[c])]);
                stat02 += phi0.transpose() * &phi0;
                stat01 += phi0;
            }
        }
        self.statphi11 = &self.statphi11 + (&stat11 / m - &self.statphi11) * pas;
        self.statphi12 = &self.statphi12 + (&stat12 / m - &self.statphi12) * pas;
        if nphi0 > 0 {
            self.statphi01 = &self.statphi01 + (&stat01 / m - &self.statphi01) * pas;
            self.statphi02 = &self.statphi02 + (&stat02 / m - &self.statphi02) * pas;
        }

        // posterior moments of the individual parameters
        let nm = self.phi_m.nrows() as f64;
        let chain_mean = DMatrix::from_fn(n, nphi, |r, c| {
            (0..self.cfg.nmc)
                .map(|chain| self.phi_m[(chain * n + r, c)])
                .sum::<f64>()
                / m
        });
        self.mpost_phi = &self.mpost_phi + (chain_mean - &self.mpost_phi) * pas;
        let col_mean = DVector::from_fn(nphi, |c, _| self.phi_m.column(c).sum() / nm);
        let second = self.phi_m.transpose() * &self.phi_m / nm;
        let cov = second - &col_mean * col_mean.transpose();
        self.cpost_phi = &self.cpost_phi + (cov - &self.cpost_phi) * pas;

        // cached predictions, sorted by endpoint and chain
        let kt = self.cfg.ntotal;
        for b in 0..self.cfg.nendpnt {
            let kb = self.cfg.y_offset[b + 1] - self.cfg.y_offset[b];
            for chain in 0..self.cfg.nmc {
                for j in 0..kb {
                    let orig = self.cfg.ix_sorting[self.cfg.y_offset[b] + j];
                    self.fs_m[self.cfg.res_offset[b] + chain * kb + j] =
                        self.fsave[chain * kt + orig];
                }
            }
        }

        // residual statistic; a no-op for kinds where it is a placeholder
        if self.dist == ObservationDistribution::Gaussian {
            for b in 0..self.cfg.nendpnt {
                let kb = self.cfg.y_offset[b + 1] - self.cfg.y_offset[b];
                let mut total = 0.0;
                let mut seen = false;
                for chain in 0..self.cfg.nmc {
                    let lo = self.cfg.res_offset[b] + chain * kb;
                    if let Some(s) = residual_stat(
                        &self.specs[b],
                        &self.res_params[b],
                        &self.cfg.ys_m[lo..lo + kb],
                        &self.fs_m[lo..lo + kb],
                    ) {
                        total += s;
                        seen = true;
                    }
                }
                if seen {
                    self.statrese[b] += pas * (total / m - self.statrese[b]);
                }
            }
        }
    }

    /// Iteration step 5: normal equations for the regression coefficients,
    /// honoring the frozen indices, then the refreshed prior means.
    fn mstep_means(&mut self, k: usize) -> Result<()> {
        let d1 = &self.cfg.lcov1 * &self.igamma1;
        let d2 = &d1 * self.cfg.lcov1.transpose();
        let cgamma = self.cfg.cov21.component_mul(&d2);
        let temp = d1.component_mul(&(self.cfg.cov1.transpose() * &self.statphi11));
        let pc = DVector::from_fn(self.cfg.nlambda1(), |l, _| temp.row(l).sum());
        self.plambda1 = cgamma
            .lu()
            .solve(&pc)
            .ok_or_else(|| anyhow!("singular coefficient normal equations at iteration {k}"))?;
        for &ix in &self.cfg.fixed_ix1 {
            self.plambda1[ix] = self.plambda1_init[ix];
        }
        for (l, &pos) in self.cfg.jcov1.iter().enumerate() {
            self.mcov1[pos] = self.plambda1[l];
        }
        self.mprior_phi1 = &self.cfg.cov1 * &self.mcov1;

        if self.cfg.nphi0() > 0 {
            let d1 = &self.cfg.lcov0 * &self.igamma0;
            let d2 = &d1 * self.cfg.lcov0.transpose();
            let cgamma = self.cfg.cov20.component_mul(&d2);
            let temp = d1.component_mul(&(self.cfg.cov0.transpose() * &self.statphi01));
            let pc = DVector::from_fn(self.cfg.nlambda0(), |l, _| temp.row(l).sum());
            self.plambda0 = cgamma
                .lu()
                .solve(&pc)
                .ok_or_else(|| anyhow!("singular block-0 normal equations at iteration {k}"))?;
            for &ix in &self.cfg.fixed_ix0 {
                self.plambda0[ix] = self.plambda0_init[ix];
            }
            for (l, &pos) in self.cfg.jcov0.iter().enumerate() {
                self.mcov0[pos] = self.plambda0[l];
            }
            self.mprior_phi0 = &self.cfg.cov0 * &self.mcov0;
        }
        Ok(())
    }

    /// Iteration step 6: covariance update with simulated-annealing floor,
    /// structural mask, diagonal floor, early diagonal forcing, and the
    /// frozen-entry overlay.
    fn mstep_covariance(&mut self, k: usize) {
        let n = self.cfg.n as f64;
        let nphi1 = self.cfg.nphi1();

        let g = (&self.statphi12 + self.mprior_phi1.transpose() * &self.mprior_phi1
            - self.statphi11.transpose() * &self.mprior_phi1
            - self.mprior_phi1.transpose() * &self.statphi11)
            / n;
        let g = (&g + g.transpose()) * 0.5;

        if k < self.cfg.nb_sa {
            let mut annealed = DMatrix::zeros(nphi1, nphi1);
            for i in 0..nphi1 {
                annealed[(i, i)] = (self.gamma2_phi1[(i, i)] * self.cfg.coef_sa).max(g[(i, i)]);
            }
            self.gamma2_phi1 = annealed;
        } else {
            self.gamma2_phi1 = g;
        }

        self.gamma2_phi1.component_mul_assign(&self.cfg.covstruct1);
        for i in 0..nphi1 {
            let floor = self.cfg.minv[self.cfg.i1[i]];
            if self.gamma2_phi1[(i, i)] < floor {
                self.gamma2_phi1[(i, i)] = floor;
            }
        }
        if k <= self.cfg.nb_correl {
            for i in 0..nphi1 {
                for j in 0..nphi1 {
                    if i != j {
                        self.gamma2_phi1[(i, j)] = 0.0;
                    }
                }
            }
        }
        if self.cfg.gamma2_phi1_fixed && k >= self.cfg.nb_fix_omega {
            for i in 0..nphi1 {
                for j in 0..nphi1 {
                    if self.cfg.gamma2_phi1_fixed_ix[(i, j)] != 0.0 {
                        self.gamma2_phi1[(i, j)] = self.cfg.gamma2_phi1_fixed_values[(i, j)];
                    }
                }
            }
        }

        let nphi0 = self.cfg.nphi0();
        if nphi0 > 0 {
            if k <= self.cfg.niter_phi0 {
                let g0 = (&self.statphi02 + self.mprior_phi0.transpose() * &self.mprior_phi0
                    - self.statphi01.transpose() * &self.mprior_phi0
                    - self.mprior_phi0.transpose() * &self.statphi01)
                    / n;
                let mut fresh = DMatrix::zeros(nphi0, nphi0);
                for i in 0..nphi0 {
                    fresh[(i, i)] = g0[(i, i)].max(self.cfg.minv[self.cfg.i0[i]]);
                }
                self.gamma2_phi0 = fresh;
            } else {
                for i in 0..nphi0 {
                    self.gamma2_phi0[(i, i)] *= self.cfg.coef_phi0;
                }
            }
        }
    }

    /// Iteration step 7: per-endpoint residual-model optimization on the
    /// cached sorted predictions, snap-then-SA update.
    fn mstep_residual(&mut self, k: usize) {
        if self.dist != ObservationDistribution::Gaussian {
            return;
        }
        let pas = self.cfg.pas[k];
        let snap = k < self.cfg.nb_fix_resid;
        for b in 0..self.cfg.nendpnt {
            let lo = self.cfg.res_offset[b];
            let hi = self.cfg.res_offset[b + 1];
            if let Some(opt) = optimize_endpoint(
                &self.specs[b],
                &self.res_params[b],
                &self.cfg.ys_m[lo..hi],
                &self.fs_m[lo..hi],
                &self.opt_settings,
            ) {
                step_update(&mut self.res_params[b], &opt, &self.specs[b], pas, snap);
            }
        }
    }

    /// Iteration step 8: complete-data score and observed-information
    /// surrogate over `(Plambda1, diag Gamma1)`, combined per the missing
    /// information principle.
    fn update_fisher(&mut self, k: usize) {
        let n = self.cfg.n;
        let nphi1 = self.cfg.nphi1();
        let nl1 = self.cfg.nlambda1();
        let nb = nl1 + nphi1;
        let m = self.cfg.nmc as f64;

        let mut d1_sum = DVector::zeros(nb);
        let mut d11 = DMatrix::zeros(nb, nb);
        let mut d2_sum = DMatrix::zeros(nb, nb);

        for chain in 0..self.cfg.nmc {
            let mut d1 = DVector::zeros(nb);
            let mut d2 = DMatrix::zeros(nb, nb);
            for (l, &(rl, cl)) in self.cfg.jcov1.iter().enumerate() {
                for (lp, &(rlp, clp)) in self.cfg.jcov1.iter().enumerate() {
                    d2[(l, lp)] = -self.cfg.cov21[(rl, rlp)] * self.igamma1[(cl, clp)];
                }
            }
            for i in 0..n {
                let diff = DVector::from_fn(nphi1, |j, _| {
                    self.phi_m[(chain * n + i, self.cfg.i1[j])] - self.mprior_phi1[(i, j)]
                });
                let z = &self.igamma1 * &diff;
                for (l, &(rl, cl)) in self.cfg.jcov1.iter().enumerate() {
                    d1[l] += self.cfg.cov1[(i, rl)] * z[cl];
                    for e in 0..nphi1 {
                        d2[(l, nl1 + e)] -= self.cfg.cov1[(i, rl)] * self.igamma1[(cl, e)] * z[e];
                    }
                }
                for d in 0..nphi1 {
                    d1[nl1 + d] += 0.5 * (z[d] * z[d] - self.igamma1[(d, d)]);
                    for e in 0..nphi1 {
                        d2[(nl1 + d, nl1 + e)] += 0.5 * self.igamma1[(d, e)].powi(2)
                            - self.igamma1[(d, e)] * z[d] * z[e];
                    }
                }
            }
            for l in 0..nl1 {
                for e in 0..nphi1 {
                    d2[(nl1 + e, l)] = d2[(l, nl1 + e)];
                }
            }
            d11 += &d1 * d1.transpose();
            d2_sum += d2;
            d1_sum += d1;
        }

        let d1m = d1_sum / m;
        let dda = &d1m * d1m.transpose() - &d11 / m - &d2_sum / m;
        let ddb = -&d11 / m - &d2_sum / m;
        let pash = self.cfg.pash[k];
        self.fisher_l = &self.fisher_l + (d1m - &self.fisher_l) * pash;
        self.ha = &self.ha + (dda - &self.ha) * pash;
        self.hb = &self.hb + (ddb - &self.hb) * pash;
    }

    /// Iteration step 9: one row of kept coefficients, kept variances, and
    /// active residual scalars.
    fn record_history(&mut self, k: usize) {
        let mut col = 0;
        let nl1 = self.cfg.nlambda1();
        for &ix in &self.cfg.par_hist_theta_keep {
            self.par_hist[(k, col)] = if ix < nl1 {
                self.plambda1[ix]
            } else {
                self.plambda0[ix - nl1]
            };
            col += 1;
        }
        for &ix in &self.cfg.par_hist_omega_keep {
            self.par_hist[(k, col)] = self.gamma2_phi1[(ix, ix)];
            col += 1;
        }
        for b in 0..self.cfg.nendpnt {
            let active = self.specs[b].kind.active();
            let vals = self.res_params[b].as_array();
            for i in 0..4 {
                if active[i] {
                    self.par_hist[(k, col)] = vals[i];
                    col += 1;
                }
            }
        }
        self.completed = k + 1;
    }

    fn results(&self) -> SaemResults {
        let n = self.cfg.n;
        let nphi = self.cfg.nphi();
        let nphi1 = self.cfg.nphi1();
        let nendpnt = self.cfg.nendpnt;

        let mut res_mat = DMatrix::zeros(nendpnt, 4);
        let mut trans_mat = DMatrix::zeros(nendpnt, 4);
        let mut sig2 = vec![f64::NAN; nendpnt];
        for b in 0..nendpnt {
            let p = &self.res_params[b];
            let tr = self.specs[b].current_transform(p);
            res_mat[(b, 0)] = p.ares;
            res_mat[(b, 1)] = p.bres;
            res_mat[(b, 2)] = p.cres;
            res_mat[(b, 3)] = tr.lambda;
            trans_mat[(b, 0)] = tr.lambda;
            trans_mat[(b, 1)] = tr.kind.tag() as f64;
            trans_mat[(b, 2)] = tr.low;
            trans_mat[(b, 3)] = tr.high;
            if matches!(self.specs[b].kind, ResidualKind::Add | ResidualKind::Prop) {
                let kb = self.cfg.y_offset[b + 1] - self.cfg.y_offset[b];
                if kb > 0 {
                    sig2[b] = self.statrese[b] / kb as f64;
                }
            }
        }

        let mut mprior_phi = DMatrix::zeros(n, nphi);
        for (j, &col) in self.cfg.i1.iter().enumerate() {
            for r in 0..n {
                mprior_phi[(r, col)] = self.mprior_phi1[(r, j)];
            }
        }
        for (j, &col) in self.cfg.i0.iter().enumerate() {
            for r in 0..n {
                mprior_phi[(r, col)] = self.mprior_phi0[(r, j)];
            }
        }

        let eta = DMatrix::from_fn(n, nphi1, |r, j| {
            let col = self.cfg.i1[j];
            (self.mpost_phi[(r, col)] - self.mprior_phi1[(r, j)]) * self.cfg.ue[(r, col)]
        });

        let mut plambda = DVector::zeros(self.cfg.nlambda1() + self.cfg.nlambda0());
        for l in 0..self.cfg.nlambda1() {
            plambda[l] = self.plambda1[l];
        }
        for l in 0..self.cfg.nlambda0() {
            plambda[self.cfg.nlambda1() + l] = self.plambda0[l];
        }

        SaemResults {
            res_mat,
            trans_mat,
            mprior_phi,
            mpost_phi: self.mpost_phi.clone(),
            cpost_phi: self.cpost_phi.clone(),
            gamma2_phi1: self.gamma2_phi1.clone(),
            plambda,
            ha: self.ha.clone(),
            hb: self.hb.clone(),
            sig2: sig2.clone(),
            eta,
            par_hist: self.par_hist.rows(0, self.completed).into_owned(),
            res_info: ResInfo {
                sigma2: sig2,
                ares: self.res_params.iter().map(|p| p.ares).collect(),
                bres: self.res_params.iter().map(|p| p.bres).collect(),
                cres: self.res_params.iter().map(|p| p.cres).collect(),
                lres: self.res_params.iter().map(|p| p.lres).collect(),
                res_mod: self.cfg.res_mod.clone(),
            },
            n_iterations: self.completed,
            interrupted: self.interrupted,
        }
    }
}
