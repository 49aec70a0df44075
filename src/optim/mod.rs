pub mod nelder_mead;
pub mod scalar;

pub use nelder_mead::{nelder_mead, NelderMeadOptions};
pub use scalar::{coordinate_descent, minimize_scalar};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptimError {
    #[error("empty parameter vector")]
    EmptyProblem,

    #[error("objective is not finite at the starting point")]
    NonFiniteStart,
}
