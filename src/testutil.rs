//! Shared fixtures for the unit tests: a small intercept-only configuration
//! over a single additive-error endpoint.

use crate::config::{build_data_layout, SaemConfig};
use crate::predictor::SolverOptions;
use nalgebra::DMatrix;

/// Intercept-only model: `nphi1` regressed parameters, one endpoint, additive
/// residual, identity transform. Observations are a deterministic ramp; the
/// fixture is meant for shape/validation tests, not recovery tests.
pub(crate) fn linear_config(n: usize, k_per: usize, nphi1: usize, seed: u64) -> SaemConfig {
    let nmc = 2;
    let niter = 10;
    let k = n * k_per;

    let y: Vec<f64> = (0..k).map(|i| 1.0 + 0.1 * i as f64).collect();
    let ix_endpnt = vec![0usize; k];
    let ix_id: Vec<usize> = (0..k).map(|i| i / k_per).collect();
    let layout = build_data_layout(&y, &ix_endpnt, &ix_id, n, nmc, 1);

    let mut evt = DMatrix::zeros(k, 5);
    for i in 0..k {
        evt[(i, 0)] = ix_id[i] as f64;
        evt[(i, 1)] = (i % k_per + 1) as f64;
    }
    let mut evt_m = DMatrix::zeros(k * nmc, 5);
    for m in 0..nmc {
        for i in 0..k {
            let r = m * k + i;
            evt_m[(r, 0)] = (m * n + ix_id[i]) as f64;
            evt_m[(r, 1)] = evt[(i, 1)];
        }
    }

    let pas: Vec<f64> = (0..niter)
        .map(|k| if k < niter / 2 { 1.0 } else { 1.0 / (k - niter / 2 + 1) as f64 })
        .collect();

    SaemConfig {
        niter,
        nmc,
        nu: [2, 2, 2],
        nb_sa: 5,
        nb_correl: 2,
        nb_fix_omega: 100,
        nb_fix_resid: 3,
        niter_phi0: 5,
        coef_sa: 0.95,
        coef_phi0: 0.9,
        rmcmc: 0.5,
        pash: pas.clone(),
        pas,
        minv: vec![1e-6; nphi1],

        n,
        ntotal: k,
        i1: (0..nphi1).collect(),
        i0: Vec::new(),
        cov1: DMatrix::from_element(n, nphi1, 1.0),
        lcov1: DMatrix::identity(nphi1, nphi1),
        cov21: DMatrix::from_element(nphi1, nphi1, n as f64),
        mcov1: DMatrix::identity(nphi1, nphi1) * 0.5,
        jcov1: (0..nphi1).map(|l| (l, l)).collect(),
        cov0: DMatrix::zeros(0, 0),
        lcov0: DMatrix::zeros(0, 0),
        cov20: DMatrix::zeros(0, 0),
        mcov0: DMatrix::zeros(0, 0),
        jcov0: Vec::new(),
        covstruct1: DMatrix::from_element(nphi1, nphi1, 1.0),
        fixed_ix1: Vec::new(),
        fixed_ix0: Vec::new(),
        gamma2_phi1_init: DMatrix::identity(nphi1, nphi1) * 0.1,
        gamma2_phi0_init: DMatrix::zeros(0, 0),

        gamma2_phi1_fixed: false,
        gamma2_phi1_fixed_ix: DMatrix::zeros(nphi1, nphi1),
        gamma2_phi1_fixed_values: DMatrix::zeros(nphi1, nphi1),

        y,
        evt,
        evt_m,
        phi_m: DMatrix::from_element(n * nmc, nphi1, 0.5),
        indio_m: layout.indio_m,
        mlen: layout.mlen,
        ix_sorting: layout.ix_sorting,
        y_offset: layout.y_offset,
        res_offset: layout.res_offset,
        ix_endpnt,
        ix_id_m: layout.ix_id_m,
        ys_m: layout.ys_m,
        nendpnt: 1,

        res_mod: vec![1],
        ares: vec![0.5],
        bres: vec![0.1],
        cres: vec![1.0],
        lres: vec![0.0],
        res_value: vec![[0.5, 0.1, 1.0, 0.0]],
        res_fixed: vec![[false; 4]],
        add_prop: vec![1],
        prop_t: vec![false],
        yj: vec![2],
        low: vec![0.0],
        hi: vec![0.0],
        lambda: vec![0.0],

        itmax: 100,
        tol: 1e-8,
        opt_type: 1,
        lambda_range: 3.0,
        pow_range: 10.0,
        max_ode_recalc: 3,
        ode_recalc_factor: 10.0,
        solver: SolverOptions::default(),

        ue: DMatrix::from_element(n, nphi1, 1.0),

        print: 0,
        par_hist_theta_keep: (0..nphi1).collect(),
        par_hist_omega_keep: (0..nphi1).collect(),
        distribution: 1,
        phi_m_file: None,
        seed: Some(seed),
        interrupt: None,
    }
}
