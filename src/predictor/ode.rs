use super::{PredictError, Predictor, SolverOptions};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

/// Structural model solved per subject. `phi` is the subject's individual
/// parameter row; `observe` maps the compartment state to the observed
/// quantity.
pub trait OdeSystem: Sync {
    fn dimension(&self) -> usize;
    fn derivatives(&self, t: f64, y: &DVector<f64>, phi: &[f64]) -> DVector<f64>;
    fn observe(&self, state: &DVector<f64>, phi: &[f64], cmt: usize) -> f64;
}

/// Reference predictor: walks a bolus event schedule and integrates the
/// system with fixed-step RK4 between events. Subjects solve in parallel.
///
/// Event matrix columns: `id, time, evid, amt, cmt` with optional `cens,
/// limit` columns appended. `evid` 0 is an observation, 1 a dose; the id
/// column is a 0-based row index into `phi` and must be non-decreasing.
pub struct OdePredictor<S> {
    system: S,
}

impl<S: OdeSystem> OdePredictor<S> {
    pub fn new(system: S) -> Self {
        Self { system }
    }

    fn rk4_step(&self, t: f64, y: &DVector<f64>, phi: &[f64], h: f64) -> DVector<f64> {
        let k1 = self.system.derivatives(t, y, phi);
        let k2 = self
            .system
            .derivatives(t + h / 2.0, &(y + &k1 * (h / 2.0)), phi);
        let k3 = self
            .system
            .derivatives(t + h / 2.0, &(y + &k2 * (h / 2.0)), phi);
        let k4 = self.system.derivatives(t + h, &(y + &k3 * h), phi);
        y + (&k1 + &k2 * 2.0 + &k3 * 2.0 + &k4) * (h / 6.0)
    }

    fn advance(
        &self,
        t0: f64,
        t1: f64,
        state: &mut DVector<f64>,
        phi: &[f64],
        opts: &SolverOptions,
    ) -> bool {
        if t1 <= t0 {
            return true;
        }
        let n_steps = ((t1 - t0) / opts.max_step).ceil().max(1.0) as usize;
        let h = (t1 - t0) / n_steps as f64;
        let mut t = t0;
        for _ in 0..n_steps {
            *state = self.rk4_step(t, state, phi, h);
            t += h;
            if state.iter().any(|v| !v.is_finite()) {
                return false;
            }
        }
        true
    }
}

struct SubjectSlice {
    id: usize,
    rows: std::ops::Range<usize>,
    obs_base: usize,
}

impl<S: OdeSystem> Predictor for OdePredictor<S> {
    fn predict(
        &mut self,
        phi: &DMatrix<f64>,
        events: &DMatrix<f64>,
        opts: &SolverOptions,
    ) -> Result<DMatrix<f64>, PredictError> {
        if events.ncols() < 5 {
            return Err(PredictError::BadEvents(format!(
                "expected at least 5 event columns, got {}",
                events.ncols()
            )));
        }
        let has_cens = events.ncols() >= 7;

        // Partition event rows into contiguous per-subject slices.
        let mut slices: Vec<SubjectSlice> = Vec::new();
        let mut obs_count = 0usize;
        let mut row = 0;
        while row < events.nrows() {
            let id = events[(row, 0)] as usize;
            if let Some(prev) = slices.last() {
                if id < prev.id {
                    return Err(PredictError::BadEvents(
                        "id column must be non-decreasing".into(),
                    ));
                }
            }
            if id >= phi.nrows() {
                return Err(PredictError::BadEvents(format!(
                    "event id {} exceeds parameter rows {}",
                    id,
                    phi.nrows()
                )));
            }
            let start = row;
            let obs_base = obs_count;
            while row < events.nrows() && events[(row, 0)] as usize == id {
                if events[(row, 2)] == 0.0 {
                    obs_count += 1;
                }
                row += 1;
            }
            slices.push(SubjectSlice {
                id,
                rows: start..row,
                obs_base,
            });
        }

        let results: Vec<(Vec<(usize, f64, f64, f64)>, bool)> = slices
            .par_iter()
            .map(|slice| {
                let phi_i: Vec<f64> = phi.row(slice.id).iter().copied().collect();
                let mut state = DVector::zeros(self.system.dimension());
                let mut last_t = 0.0;
                let mut out = Vec::new();
                let mut obs_idx = slice.obs_base;
                let mut ok = true;
                for r in slice.rows.clone() {
                    let t = events[(r, 1)];
                    if ok && !self.advance(last_t, t, &mut state, &phi_i, opts) {
                        ok = false;
                    }
                    last_t = last_t.max(t);
                    let cmt = events[(r, 4)] as usize;
                    if events[(r, 2)] == 1.0 {
                        if cmt < state.nrows() {
                            state[cmt] += events[(r, 3)];
                        }
                    } else {
                        let f = if ok {
                            self.system.observe(&state, &phi_i, cmt)
                        } else {
                            f64::NAN
                        };
                        let (cens, limit) = if has_cens {
                            (events[(r, 5)], events[(r, 6)])
                        } else {
                            (0.0, f64::NEG_INFINITY)
                        };
                        out.push((obs_idx, f, cens, limit));
                        obs_idx += 1;
                    }
                }
                (out, !ok)
            })
            .collect();

        let mut preds = DMatrix::zeros(obs_count, 3);
        let mut any_bad = false;
        for (entries, bad) in &results {
            any_bad |= bad;
            for &(idx, f, cens, limit) in entries {
                preds[(idx, 0)] = f;
                preds[(idx, 1)] = cens;
                preds[(idx, 2)] = limit;
            }
        }

        if any_bad {
            return Err(PredictError::BadSolve {
                predictions: preds,
                message: "non-finite state during integration".into(),
            });
        }
        Ok(preds)
    }
}
