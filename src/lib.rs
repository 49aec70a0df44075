pub mod config;
pub mod likelihood;
pub mod optim;
pub mod predictor;
pub mod residual;
pub mod saem;
pub mod transform;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{build_data_layout, ConfigError, DataLayout, SaemConfig};
pub use likelihood::ObservationDistribution;
pub use predictor::{OdePredictor, OdeSystem, PredictError, Predictor, RetryingPredictor, SolverOptions};
pub use residual::{EndpointSpec, ResidualKind, ResidualParams};
pub use saem::{ResInfo, SaemEstimator, SaemResults};
pub use transform::{Transform, TransformKind};
