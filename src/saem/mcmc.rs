//! The three Metropolis kernels over the replicated individual-parameter
//! block. All three share the accept/reject step: a per-column deviance
//! delta against `-ln U`, with accepted predictions written back into the
//! cached `fsave` so later statistics never re-solve.

use super::algorithm::SaemEstimator;
use crate::predictor::Predictor;
use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

impl<P: Predictor> SaemEstimator<P> {
    /// One MCMC sub-cycle: kernels 1 → 2 → 3 in fixed order, each running
    /// its configured sweep count, expanded twentyfold on the first
    /// iteration.
    pub(super) fn run_mcmc_cycle(&mut self, k: usize) -> Result<()> {
        let expand = if k == 0 { 20 } else { 1 };
        for _ in 0..self.cfg.nu[0] * expand {
            self.kernel_prior()?;
        }
        for _ in 0..self.cfg.nu[1] * expand {
            self.kernel_random_walk()?;
        }
        for _ in 0..self.cfg.nu[2] * expand {
            self.kernel_coordinate()?;
        }
        Ok(())
    }

    /// Kernel 1: independent draws from the prior. The proposal density
    /// cancels against the prior, so acceptance uses the data deviance only.
    fn kernel_prior(&mut self) -> Result<()> {
        let n = self.cfg.n;
        let nm = self.phi_m.nrows();
        let nphi1 = self.cfg.nphi1();
        let nphi0 = self.cfg.nphi0();

        let mut phi_c = self.phi_m.clone();
        for r in 0..nm {
            let s = r % n;
            let z = DVector::from_fn(nphi1, |_, _| self.rng.sample::<f64, _>(StandardNormal));
            let eta = &self.chol1 * z;
            for (j, &col) in self.cfg.i1.iter().enumerate() {
                phi_c[(r, col)] =
                    self.mprior_phi1[(s, j)] + self.cfg.ue[(s, col)] * eta[j];
            }
            if nphi0 > 0 {
                let z0 = DVector::from_fn(nphi0, |_, _| self.rng.sample::<f64, _>(StandardNormal));
                let eta0 = &self.chol0 * z0;
                for (j, &col) in self.cfg.i0.iter().enumerate() {
                    phi_c[(r, col)] =
                        self.mprior_phi0[(s, j)] + self.cfg.ue[(s, col)] * eta0[j];
                }
            }
        }

        let (u_c, f_c) = self.eval_block(&phi_c)?;
        for r in 0..nm {
            let delta = u_c[r] - self.u_y[r];
            if self.accepts(delta) {
                self.take_row(r, &phi_c, u_c[r], &f_c);
            }
        }
        Ok(())
    }

    /// Kernel 2: full random walk, proposal scale `rmcmc · diag(Gamma)`,
    /// acceptance on data deviance plus prior quadratic form.
    fn kernel_random_walk(&mut self) -> Result<()> {
        let n = self.cfg.n;
        let nm = self.phi_m.nrows();
        let nphi1 = self.cfg.nphi1();
        let nphi0 = self.cfg.nphi0();

        let sd1: Vec<f64> = (0..nphi1)
            .map(|j| (self.cfg.rmcmc * self.gamma2_phi1[(j, j)]).sqrt())
            .collect();
        let sd0: Vec<f64> = (0..nphi0)
            .map(|j| (self.cfg.rmcmc * self.gamma2_phi0[(j, j)]).sqrt())
            .collect();

        let mut phi_c = self.phi_m.clone();
        for r in 0..nm {
            let s = r % n;
            for (j, &col) in self.cfg.i1.iter().enumerate() {
                let z: f64 = self.rng.sample(StandardNormal);
                phi_c[(r, col)] += self.cfg.ue[(s, col)] * sd1[j] * z;
            }
            for (j, &col) in self.cfg.i0.iter().enumerate() {
                let z: f64 = self.rng.sample(StandardNormal);
                phi_c[(r, col)] += self.cfg.ue[(s, col)] * sd0[j] * z;
            }
        }

        self.walk_accept(&phi_c)
    }

    /// Kernel 3: one coordinate at a time, otherwise identical to kernel 2.
    fn kernel_coordinate(&mut self) -> Result<()> {
        let n = self.cfg.n;
        let nm = self.phi_m.nrows();

        let coords: Vec<(usize, f64)> = self
            .cfg
            .i1
            .iter()
            .enumerate()
            .map(|(j, &col)| (col, self.gamma2_phi1[(j, j)]))
            .chain(
                self.cfg
                    .i0
                    .iter()
                    .enumerate()
                    .map(|(j, &col)| (col, self.gamma2_phi0[(j, j)])),
            )
            .collect();

        for (col, var) in coords {
            let sd = (self.cfg.rmcmc * var).sqrt();
            let mut phi_c = self.phi_m.clone();
            for r in 0..nm {
                let s = r % n;
                let z: f64 = self.rng.sample(StandardNormal);
                phi_c[(r, col)] += self.cfg.ue[(s, col)] * sd * z;
            }
            self.walk_accept(&phi_c)?;
        }
        Ok(())
    }

    fn walk_accept(&mut self, phi_c: &DMatrix<f64>) -> Result<()> {
        let (u_c, f_c) = self.eval_block(phi_c)?;
        let u_phi = self.prior_quadratic(&self.phi_m);
        let u_phi_c = self.prior_quadratic(phi_c);
        for r in 0..self.phi_m.nrows() {
            let delta = u_c[r] - self.u_y[r] + u_phi_c[r] - u_phi[r];
            if self.accepts(delta) {
                self.take_row(r, phi_c, u_c[r], &f_c);
            }
        }
        Ok(())
    }

    fn accepts(&mut self, delta: f64) -> bool {
        let u: f64 = self.rng.gen();
        delta < -u.ln()
    }

    fn take_row(&mut self, r: usize, phi_c: &DMatrix<f64>, u_c: f64, f_c: &[f64]) {
        for c in 0..self.phi_m.ncols() {
            self.phi_m[(r, c)] = phi_c[(r, c)];
        }
        self.u_y[r] = u_c;
        for &i in &self.col_obs[r] {
            self.fsave[i] = f_c[i];
        }
    }

    /// Per-column prior quadratic form `0.5 (phi - m)' IGamma (phi - m)`
    /// summed over both blocks.
    fn prior_quadratic(&self, phi: &DMatrix<f64>) -> DVector<f64> {
        let n = self.cfg.n;
        let nphi1 = self.cfg.nphi1();
        let nphi0 = self.cfg.nphi0();
        let mut out = DVector::zeros(phi.nrows());
        for r in 0..phi.nrows() {
            let s = r % n;
            let d1 = DVector::from_fn(nphi1, |j, _| {
                phi[(r, self.cfg.i1[j])] - self.mprior_phi1[(s, j)]
            });
            let mut q = 0.5 * (&self.igamma1 * &d1).dot(&d1);
            if nphi0 > 0 {
                let d0 = DVector::from_fn(nphi0, |j, _| {
                    phi[(r, self.cfg.i0[j])] - self.mprior_phi0[(s, j)]
                });
                q += 0.5 * (&self.igamma0 * &d0).dot(&d0);
            }
            out[r] = q;
        }
        out
    }
}
