use crate::optim::{coordinate_descent, minimize_scalar, nelder_mead, NelderMeadOptions};
use crate::transform::{lambda_est, pow_est, to_lambda, to_pow, Transform};
use serde::{Deserialize, Serialize};

const SIGMA_FLOOR: f64 = 1e-200;
const SIGMA_CEIL: f64 = 1e300;
const PROP_SCALE_FLOOR: f64 = 1e-12;

/// Residual-error specification for one endpoint. Tags follow the
/// conventional 1..=10 coding: the five base shapes, then the same five with
/// the transform shape parameter estimated jointly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResidualKind {
    Add,
    Prop,
    Pow,
    AddProp,
    AddPow,
    AddLam,
    PropLam,
    PowLam,
    AddPropLam,
    AddPowLam,
}

impl ResidualKind {
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            1 => Some(ResidualKind::Add),
            2 => Some(ResidualKind::Prop),
            3 => Some(ResidualKind::Pow),
            4 => Some(ResidualKind::AddProp),
            5 => Some(ResidualKind::AddPow),
            6 => Some(ResidualKind::AddLam),
            7 => Some(ResidualKind::PropLam),
            8 => Some(ResidualKind::PowLam),
            9 => Some(ResidualKind::AddPropLam),
            10 => Some(ResidualKind::AddPowLam),
            _ => None,
        }
    }

    pub fn tag(self) -> i32 {
        match self {
            ResidualKind::Add => 1,
            ResidualKind::Prop => 2,
            ResidualKind::Pow => 3,
            ResidualKind::AddProp => 4,
            ResidualKind::AddPow => 5,
            ResidualKind::AddLam => 6,
            ResidualKind::PropLam => 7,
            ResidualKind::PowLam => 8,
            ResidualKind::AddPropLam => 9,
            ResidualKind::AddPowLam => 10,
        }
    }

    /// Which of `(a, b, c, lambda)` this kind estimates.
    pub fn active(self) -> [bool; 4] {
        match self {
            ResidualKind::Add => [true, false, false, false],
            ResidualKind::Prop => [false, true, false, false],
            ResidualKind::Pow => [false, true, true, false],
            ResidualKind::AddProp => [true, true, false, false],
            ResidualKind::AddPow => [true, true, true, false],
            ResidualKind::AddLam => [true, false, false, true],
            ResidualKind::PropLam => [false, true, false, true],
            ResidualKind::PowLam => [false, true, true, true],
            ResidualKind::AddPropLam => [true, true, false, true],
            ResidualKind::AddPowLam => [true, true, true, true],
        }
    }

    pub fn estimates_lambda(self) -> bool {
        self.active()[3]
    }
}

/// The four residual scalars. Only the entries selected by the endpoint's
/// [`ResidualKind`] are meaningful; the rest ride along at their initial
/// values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResidualParams {
    pub ares: f64,
    pub bres: f64,
    pub cres: f64,
    pub lres: f64,
}

impl ResidualParams {
    pub fn as_array(&self) -> [f64; 4] {
        [self.ares, self.bres, self.cres, self.lres]
    }

    pub fn from_array(v: [f64; 4]) -> Self {
        Self {
            ares: v[0],
            bres: v[1],
            cres: v[2],
            lres: v[3],
        }
    }
}

/// Immutable per-endpoint context: residual kind, observation transform,
/// proportional-scale convention, combine rule, and the freeze mask.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub kind: ResidualKind,
    pub transform: Transform,
    /// Proportional term on the transformed prediction instead of the raw one.
    pub prop_t: bool,
    /// Combine rule for add+prop / add+pow: 1 = a + b·F, 2 = sqrt(a² + b²·F²).
    pub add_prop: u8,
    /// Freeze mask over `(a, b, c, lambda)`.
    pub frozen: [bool; 4],
    /// Values frozen entries are pinned to.
    pub frozen_values: [f64; 4],
    pub lambda_range: f64,
    pub pow_range: f64,
}

impl EndpointSpec {
    /// The transform in effect for the given parameter state; kinds that
    /// estimate lambda read it from the parameters.
    pub fn current_transform(&self, params: &ResidualParams) -> Transform {
        if self.kind.estimates_lambda() {
            self.transform.with_lambda(params.lres)
        } else {
            self.transform
        }
    }

    /// Proportional scale factor `F`: the transformed prediction floored away
    /// from zero when `prop_t` is set, otherwise the raw prediction with zero
    /// replaced by one so proportional error stays defined at `f = 0`.
    fn prop_scale(&self, f: f64, ft: f64) -> f64 {
        if self.prop_t {
            ft.abs().max(PROP_SCALE_FLOOR)
        } else if f == 0.0 {
            1.0
        } else {
            f.abs()
        }
    }

    /// Residual standard deviation at one prediction, clamped into
    /// `[1e-200, 1e300]`.
    pub fn sigma(&self, params: &ResidualParams, f: f64, ft: f64) -> f64 {
        let a = params.ares;
        let b = params.bres;
        let c = params.cres;
        let fs = self.prop_scale(f, ft);
        let raw = match self.kind {
            ResidualKind::Add | ResidualKind::AddLam => a,
            ResidualKind::Prop | ResidualKind::PropLam => b * fs,
            ResidualKind::Pow | ResidualKind::PowLam => b * fs.powf(c),
            ResidualKind::AddProp | ResidualKind::AddPropLam => {
                if self.add_prop == 2 {
                    (a * a + b * b * fs * fs).sqrt()
                } else {
                    a + b * fs
                }
            }
            ResidualKind::AddPow | ResidualKind::AddPowLam => {
                if self.add_prop == 2 {
                    (a * a + b * b * fs.powf(2.0 * c)).sqrt()
                } else {
                    a + b * fs.powf(c)
                }
            }
        };
        raw.clamp(SIGMA_FLOOR, SIGMA_CEIL)
    }

    fn free_coords(&self) -> Vec<usize> {
        let active = self.kind.active();
        (0..4).filter(|&i| active[i] && !self.frozen[i]).collect()
    }
}

#[derive(Debug, Clone)]
pub struct OptimizerSettings {
    /// 1 = Nelder–Mead, 2 = coordinate descent with Nelder–Mead fallback.
    pub opt_type: i32,
    pub itmax: usize,
    pub tol: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            opt_type: 1,
            itmax: 100,
            tol: 1e-8,
        }
    }
}

/// The `-2 log L` objective (constants dropped) over the free residual
/// coordinates, on the transformed scale. Scale parameters travel through
/// the optimizer as their square roots; `c` and `lambda` through their
/// range bijections.
struct ResidualObjective<'a> {
    spec: &'a EndpointSpec,
    y: &'a [f64],
    f: &'a [f64],
    base: ResidualParams,
    free: &'a [usize],
}

impl ResidualObjective<'_> {
    fn decode(&self, x: &[f64]) -> ResidualParams {
        let mut v = self.base.as_array();
        for (i, &coord) in self.free.iter().enumerate() {
            v[coord] = match coord {
                0 | 1 => x[i] * x[i],
                2 => to_pow(x[i], self.spec.pow_range),
                _ => to_lambda(x[i], self.spec.lambda_range),
            };
        }
        for i in 0..4 {
            if self.spec.frozen[i] {
                v[i] = self.spec.frozen_values[i];
            }
        }
        ResidualParams::from_array(v)
    }

    fn encode(&self) -> Vec<f64> {
        let v = self.base.as_array();
        self.free
            .iter()
            .map(|&coord| match coord {
                0 | 1 => v[coord].max(0.0).sqrt(),
                2 => pow_est(v[coord], self.spec.pow_range),
                _ => lambda_est(v[coord], self.spec.lambda_range),
            })
            .collect()
    }

    fn eval(&self, x: &[f64]) -> f64 {
        let params = self.decode(x);
        let tr = self.spec.current_transform(&params);
        let mut obj = 0.0;
        for (&yi, &fi) in self.y.iter().zip(self.f.iter()) {
            let yt = tr.forward(yi);
            let ft = tr.forward(fi);
            let g = self.spec.sigma(&params, fi, ft);
            let r = (yt - ft) / g;
            obj += r * r + 2.0 * g.ln();
        }
        obj
    }
}

/// Optimize the endpoint's free residual coordinates against the current
/// `(y, f)` slices. Returns `None` when there is nothing to optimize or when
/// the search produced a non-finite result; the caller then keeps the
/// previous parameter values.
pub fn optimize_endpoint(
    spec: &EndpointSpec,
    params: &ResidualParams,
    y: &[f64],
    f: &[f64],
    settings: &OptimizerSettings,
) -> Option<ResidualParams> {
    let free = spec.free_coords();
    if free.is_empty() || y.is_empty() {
        return None;
    }
    let objective = ResidualObjective {
        spec,
        y,
        f,
        base: *params,
        free: &free,
    };
    let x0 = objective.encode();

    let (x_opt, f_opt) = if free.len() == 1 {
        let (x, fx) = minimize_scalar(
            |v| objective.eval(&[v]),
            x0[0],
            settings.tol,
            settings.itmax.max(100),
        );
        (vec![x], fx)
    } else if settings.opt_type == 2 {
        let (x, fx) = coordinate_descent(|v| objective.eval(v), &x0, settings.tol, settings.itmax);
        if fx.is_finite() {
            (x, fx)
        } else {
            run_simplex(&objective, &x0, settings)?
        }
    } else {
        run_simplex(&objective, &x0, settings)?
    };

    if !f_opt.is_finite() {
        return None;
    }
    let out = objective.decode(&x_opt);
    let v = out.as_array();
    if v.iter().any(|x| !x.is_finite()) {
        return None;
    }
    Some(out)
}

fn run_simplex(
    objective: &ResidualObjective<'_>,
    x0: &[f64],
    settings: &OptimizerSettings,
) -> Option<(Vec<f64>, f64)> {
    let opts = NelderMeadOptions {
        tol: settings.tol,
        itmax: settings.itmax,
    };
    nelder_mead(|v| objective.eval(v), x0, &opts).ok()
}

/// Move the live residual parameters toward the optimizer result: snap during
/// the burn-in phase, step by `pas_k` afterwards. Frozen entries stay pinned.
pub fn step_update(
    current: &mut ResidualParams,
    optimum: &ResidualParams,
    spec: &EndpointSpec,
    pas_k: f64,
    snap: bool,
) {
    let active = spec.kind.active();
    let mut cur = current.as_array();
    let opt = optimum.as_array();
    for i in 0..4 {
        if !active[i] {
            continue;
        }
        if spec.frozen[i] {
            cur[i] = spec.frozen_values[i];
        } else if snap {
            cur[i] = opt[i];
        } else {
            cur[i] += pas_k * (opt[i] - cur[i]);
        }
    }
    *current = ResidualParams::from_array(cur);
}

/// Per-iteration residual statistic feeding the `statrese` accumulator: the
/// sum of squared transformed residuals for the pure additive kind, the same
/// divided by the proportional scale for the pure proportional kind. For
/// every other kind the statistic is an explicit no-op and the accumulator
/// is left untouched.
pub fn residual_stat(
    spec: &EndpointSpec,
    params: &ResidualParams,
    y: &[f64],
    f: &[f64],
) -> Option<f64> {
    let tr = spec.current_transform(params);
    match spec.kind {
        ResidualKind::Add => Some(
            y.iter()
                .zip(f.iter())
                .map(|(&yi, &fi)| {
                    let r = tr.forward(yi) - tr.forward(fi);
                    r * r
                })
                .sum(),
        ),
        ResidualKind::Prop => Some(
            y.iter()
                .zip(f.iter())
                .map(|(&yi, &fi)| {
                    let ft = tr.forward(fi);
                    let r = (tr.forward(yi) - ft) / spec.prop_scale(fi, ft);
                    r * r
                })
                .sum(),
        ),
        _ => None,
    }
}
