use serde::{Deserialize, Serialize};

const LAMBDA_EPS: f64 = 1e-10;

/// Monotone transform applied to observations and predictions before the
/// residual is formed. The bounded variants clamp the inverse into
/// `[low, high]` so back-transformed predictions stay inside the response
/// range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformKind {
    BoxCox,
    YeoJohnson,
    Identity,
    Log,
    BoundedBoxCox,
    BoundedYeoJohnson,
}

impl TransformKind {
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(TransformKind::BoxCox),
            1 => Some(TransformKind::YeoJohnson),
            2 => Some(TransformKind::Identity),
            3 => Some(TransformKind::Log),
            4 => Some(TransformKind::BoundedBoxCox),
            5 => Some(TransformKind::BoundedYeoJohnson),
            _ => None,
        }
    }

    pub fn tag(self) -> i32 {
        match self {
            TransformKind::BoxCox => 0,
            TransformKind::YeoJohnson => 1,
            TransformKind::Identity => 2,
            TransformKind::Log => 3,
            TransformKind::BoundedBoxCox => 4,
            TransformKind::BoundedYeoJohnson => 5,
        }
    }

    /// Whether the transform has a shape parameter at all.
    pub fn uses_lambda(self) -> bool {
        !matches!(self, TransformKind::Identity | TransformKind::Log)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Transform {
    pub kind: TransformKind,
    pub lambda: f64,
    pub low: f64,
    pub high: f64,
}

impl Transform {
    pub fn new(kind: TransformKind, lambda: f64, low: f64, high: f64) -> Self {
        Self {
            kind,
            lambda,
            low,
            high,
        }
    }

    /// Same transform with a different shape parameter; used while the
    /// residual optimizer is searching over lambda.
    pub fn with_lambda(self, lambda: f64) -> Self {
        Self { lambda, ..self }
    }

    /// Forward map. Domain violations (log of a non-positive value and the
    /// like) surface as NaN; intake treats NaN observations as a hard error
    /// while the prediction path guards them downstream.
    pub fn forward(&self, y: f64) -> f64 {
        match self.kind {
            TransformKind::Identity => y,
            TransformKind::Log => {
                if y <= 0.0 {
                    f64::NAN
                } else {
                    y.ln()
                }
            }
            TransformKind::BoxCox => box_cox(y, self.lambda),
            TransformKind::YeoJohnson => yeo_johnson(y, self.lambda),
            TransformKind::BoundedBoxCox => box_cox(y.clamp(self.low, self.high), self.lambda),
            TransformKind::BoundedYeoJohnson => {
                yeo_johnson(y.clamp(self.low, self.high), self.lambda)
            }
        }
    }

    pub fn inverse(&self, z: f64) -> f64 {
        match self.kind {
            TransformKind::Identity => z,
            TransformKind::Log => z.exp(),
            TransformKind::BoxCox => box_cox_inv(z, self.lambda),
            TransformKind::YeoJohnson => yeo_johnson_inv(z, self.lambda),
            TransformKind::BoundedBoxCox => box_cox_inv(z, self.lambda).clamp(self.low, self.high),
            TransformKind::BoundedYeoJohnson => {
                yeo_johnson_inv(z, self.lambda).clamp(self.low, self.high)
            }
        }
    }
}

fn box_cox(y: f64, lambda: f64) -> f64 {
    if y <= 0.0 {
        return f64::NAN;
    }
    if lambda.abs() < LAMBDA_EPS {
        y.ln()
    } else {
        (y.powf(lambda) - 1.0) / lambda
    }
}

fn box_cox_inv(z: f64, lambda: f64) -> f64 {
    if lambda.abs() < LAMBDA_EPS {
        z.exp()
    } else {
        (lambda * z + 1.0).powf(1.0 / lambda)
    }
}

fn yeo_johnson(y: f64, lambda: f64) -> f64 {
    if y >= 0.0 {
        if lambda.abs() < LAMBDA_EPS {
            (y + 1.0).ln()
        } else {
            ((y + 1.0).powf(lambda) - 1.0) / lambda
        }
    } else if (lambda - 2.0).abs() < LAMBDA_EPS {
        -(1.0 - y).ln()
    } else {
        -(((1.0 - y).powf(2.0 - lambda) - 1.0) / (2.0 - lambda))
    }
}

fn yeo_johnson_inv(z: f64, lambda: f64) -> f64 {
    if z >= 0.0 {
        if lambda.abs() < LAMBDA_EPS {
            z.exp() - 1.0
        } else {
            (lambda * z + 1.0).powf(1.0 / lambda) - 1.0
        }
    } else if (lambda - 2.0).abs() < LAMBDA_EPS {
        1.0 - (-z).exp()
    } else {
        1.0 - (1.0 - (2.0 - lambda) * z).powf(1.0 / (2.0 - lambda))
    }
}

/// Maps an unconstrained optimizer coordinate into `(-range, range)`.
pub fn to_lambda(x: f64, range: f64) -> f64 {
    range * x.tanh()
}

/// Estimation-scale inverse of [`to_lambda`]. Inputs are pinned to
/// `(-0.99 range, 0.99 range)` so the map stays invertible.
pub fn lambda_est(lambda: f64, range: f64) -> f64 {
    (lambda / range).clamp(-0.99, 0.99).atanh()
}

/// Power-exponent analogue of [`to_lambda`] driven by `powRange`.
pub fn to_pow(x: f64, range: f64) -> f64 {
    to_lambda(x, range)
}

pub fn pow_est(c: f64, range: f64) -> f64 {
    lambda_est(c, range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn round_trip(kind: TransformKind, lambda: f64, low: f64, high: f64, ys: &[f64]) {
        let tr = Transform::new(kind, lambda, low, high);
        for &y in ys {
            let z = tr.forward(y);
            assert!(z.is_finite(), "{:?} forward({}) not finite", kind, y);
            assert_relative_eq!(tr.inverse(z), y, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_round_trips() {
        round_trip(TransformKind::Identity, 0.0, 0.0, 0.0, &[-3.0, 0.0, 2.5]);
        round_trip(TransformKind::Log, 0.0, 0.0, 0.0, &[0.1, 1.0, 42.0]);
        round_trip(TransformKind::BoxCox, 0.5, 0.0, 0.0, &[0.1, 1.0, 42.0]);
        round_trip(TransformKind::BoxCox, 0.0, 0.0, 0.0, &[0.5, 7.0]);
        round_trip(TransformKind::YeoJohnson, 0.5, 0.0, 0.0, &[-4.0, -0.5, 0.0, 3.0]);
        round_trip(TransformKind::YeoJohnson, 2.0, 0.0, 0.0, &[-4.0, 1.5]);
        round_trip(TransformKind::BoundedBoxCox, 0.5, 0.1, 10.0, &[0.2, 5.0, 9.9]);
        round_trip(TransformKind::BoundedYeoJohnson, 0.7, -2.0, 2.0, &[-1.5, 0.0, 1.9]);
    }

    #[test]
    fn test_log_domain() {
        let tr = Transform::new(TransformKind::Log, 0.0, 0.0, 0.0);
        assert!(tr.forward(0.0).is_nan());
        assert!(tr.forward(-1.0).is_nan());
        let bc = Transform::new(TransformKind::BoxCox, 0.3, 0.0, 0.0);
        assert!(bc.forward(-2.0).is_nan());
    }

    #[test]
    fn test_bounded_inverse_clamps() {
        let tr = Transform::new(TransformKind::BoundedBoxCox, 0.5, 1.0, 5.0);
        let z_hi = tr.forward(5.0) + 10.0;
        assert_relative_eq!(tr.inverse(z_hi), 5.0);
    }

    #[test]
    fn test_lambda_bijection() {
        let range = 2.0;
        for &l in &[-1.9, -0.5, 0.0, 0.3, 1.97] {
            assert_relative_eq!(to_lambda(lambda_est(l, range), range), l, epsilon = 1e-12);
        }
        // outside the pinned window the inverse saturates
        let pinned = to_lambda(lambda_est(1.999, range), range);
        assert_relative_eq!(pinned, 0.99 * range, epsilon = 1e-12);
    }

    #[test]
    fn test_yeo_johnson_identity_at_lambda_one() {
        let tr = Transform::new(TransformKind::YeoJohnson, 1.0, 0.0, 0.0);
        assert_relative_eq!(tr.forward(3.0), 3.0, epsilon = 1e-12);
        assert_relative_eq!(tr.forward(-3.0), -3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_tag_round_trip() {
        for tag in 0..6 {
            let kind = TransformKind::from_tag(tag).unwrap();
            assert_eq!(kind.tag(), tag);
        }
        assert!(TransformKind::from_tag(7).is_none());
    }
}
