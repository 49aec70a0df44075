pub mod ode;

pub use ode::{OdePredictor, OdeSystem};

use log::{debug, warn};
use nalgebra::DMatrix;
use thiserror::Error;

/// Predictions flagged NaN by the solver are replaced by this sentinel so a
/// single bad subject cannot poison the whole likelihood.
pub const BAD_PREDICTION: f64 = 1e99;

#[derive(Error, Debug)]
pub enum PredictError {
    /// The solver finished but flagged the solve as unreliable; carries
    /// whatever output it produced so the caller can keep it after retries
    /// are exhausted.
    #[error("bad solve: {message}")]
    BadSolve {
        predictions: DMatrix<f64>,
        message: String,
    },

    #[error("event matrix malformed: {0}")]
    BadEvents(String),
}

#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub atol: f64,
    pub rtol: f64,
    pub max_step: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            atol: 1e-8,
            rtol: 1e-6,
            max_step: 0.1,
        }
    }
}

/// Individual-prediction interface the estimator talks to. For a
/// `(rows × nphi)` matrix of individual parameters and an event matrix whose
/// id column indexes those rows, produces one row per non-dose observation:
/// `(prediction, censoring flag in {-1, 0, +1}, limit or -inf)`. Row order
/// follows the event matrix.
pub trait Predictor {
    fn predict(
        &mut self,
        phi: &DMatrix<f64>,
        events: &DMatrix<f64>,
        opts: &SolverOptions,
    ) -> Result<DMatrix<f64>, PredictError>;
}

/// Wraps a [`Predictor`] with the bad-solve recovery policy: on a bad solve
/// both tolerances are multiplied by `ode_recalc_factor` and the call is
/// retried, up to `max_ode_recalc` times; afterwards the tolerances are
/// restored by the inverse product. If the last attempt is still bad the
/// solver's own output is kept. NaN predictions become [`BAD_PREDICTION`]
/// with a one-shot warning per fit.
pub struct RetryingPredictor<P> {
    inner: P,
    opts: SolverOptions,
    max_ode_recalc: usize,
    ode_recalc_factor: f64,
    nan_warned: bool,
}

impl<P: Predictor> RetryingPredictor<P> {
    pub fn new(
        inner: P,
        opts: SolverOptions,
        max_ode_recalc: usize,
        ode_recalc_factor: f64,
    ) -> Self {
        Self {
            inner,
            opts,
            max_ode_recalc,
            ode_recalc_factor,
            nan_warned: false,
        }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.opts
    }

    pub fn predict(
        &mut self,
        phi: &DMatrix<f64>,
        events: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, PredictError> {
        let mut relax = 1.0;
        let mut attempts = 0;
        let outcome = loop {
            match self.inner.predict(phi, events, &self.opts) {
                Ok(m) => break Ok(m),
                Err(PredictError::BadSolve {
                    predictions,
                    message,
                }) => {
                    if attempts >= self.max_ode_recalc {
                        debug!("bad solve after {} retries, keeping solver output", attempts);
                        break Ok(predictions);
                    }
                    attempts += 1;
                    relax *= self.ode_recalc_factor;
                    self.opts.atol *= self.ode_recalc_factor;
                    self.opts.rtol *= self.ode_recalc_factor;
                    debug!(
                        "bad solve ({message}); relaxing tolerances to atol={:.3e} rtol={:.3e}",
                        self.opts.atol, self.opts.rtol
                    );
                }
                Err(e) => break Err(e),
            }
        };
        self.opts.atol /= relax;
        self.opts.rtol /= relax;

        let mut preds = outcome?;
        let mut saw_nan = false;
        for r in 0..preds.nrows() {
            if preds[(r, 0)].is_nan() {
                preds[(r, 0)] = BAD_PREDICTION;
                saw_nan = true;
            }
        }
        if saw_nan && !self.nan_warned {
            warn!("NaN prediction replaced by {BAD_PREDICTION:.0e}; further occurrences are silent");
            self.nan_warned = true;
        }
        Ok(preds)
    }
}
