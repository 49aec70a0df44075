use super::OptimError;

#[derive(Debug, Clone)]
pub struct NelderMeadOptions {
    /// Relative tolerance on the simplex function-value spread.
    pub tol: f64,
    /// Iteration cap, scaled by the problem dimension.
    pub itmax: usize,
}

impl Default for NelderMeadOptions {
    fn default() -> Self {
        Self {
            tol: 1e-8,
            itmax: 100,
        }
    }
}

const REFLECT: f64 = 1.0;
const EXPAND: f64 = 2.0;
const CONTRACT: f64 = 0.5;
const SHRINK: f64 = 0.5;

/// Downhill simplex minimization of `f` starting at `x0`. Runs at most
/// `itmax * n` iterations and stops when the relative spread of the simplex
/// function values drops below `tol`.
pub fn nelder_mead<F>(
    f: F,
    x0: &[f64],
    opts: &NelderMeadOptions,
) -> Result<(Vec<f64>, f64), OptimError>
where
    F: Fn(&[f64]) -> f64,
{
    let n = x0.len();
    if n == 0 {
        return Err(OptimError::EmptyProblem);
    }
    let f0 = f(x0);
    if !f0.is_finite() {
        return Err(OptimError::NonFiniteStart);
    }

    // Initial simplex: x0 plus one perturbed vertex per coordinate.
    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
    let mut fvals: Vec<f64> = Vec::with_capacity(n + 1);
    simplex.push(x0.to_vec());
    fvals.push(f0);
    for i in 0..n {
        let mut v = x0.to_vec();
        v[i] += if v[i] != 0.0 { 0.1 * v[i].abs() } else { 0.1 };
        fvals.push(f(&v));
        simplex.push(v);
    }

    let max_iter = opts.itmax * n;
    for _ in 0..max_iter {
        // Order vertices: best first, worst last.
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&a, &b| fvals[a].partial_cmp(&fvals[b]).unwrap_or(std::cmp::Ordering::Equal));
        let best = order[0];
        let worst = order[n];
        let second_worst = order[n - 1];

        let spread = 2.0 * (fvals[worst] - fvals[best]).abs()
            / (fvals[worst].abs() + fvals[best].abs() + f64::MIN_POSITIVE);
        if spread < opts.tol {
            break;
        }

        // Centroid of all vertices except the worst.
        let mut centroid = vec![0.0; n];
        for (idx, v) in simplex.iter().enumerate() {
            if idx == worst {
                continue;
            }
            for j in 0..n {
                centroid[j] += v[j] / n as f64;
            }
        }

        let blend = |coef: f64| -> Vec<f64> {
            (0..n)
                .map(|j| centroid[j] + coef * (centroid[j] - simplex[worst][j]))
                .collect()
        };

        let reflected = blend(REFLECT);
        let f_reflected = f(&reflected);

        if f_reflected < fvals[best] {
            let expanded = blend(EXPAND);
            let f_expanded = f(&expanded);
            if f_expanded < f_reflected {
                simplex[worst] = expanded;
                fvals[worst] = f_expanded;
            } else {
                simplex[worst] = reflected;
                fvals[worst] = f_reflected;
            }
        } else if f_reflected < fvals[second_worst] {
            simplex[worst] = reflected;
            fvals[worst] = f_reflected;
        } else {
            let contracted = if f_reflected < fvals[worst] {
                blend(CONTRACT)
            } else {
                blend(-CONTRACT)
            };
            let f_contracted = f(&contracted);
            if f_contracted < fvals[worst].min(f_reflected) {
                simplex[worst] = contracted;
                fvals[worst] = f_contracted;
            } else {
                // Shrink everything toward the best vertex.
                let best_v = simplex[best].clone();
                for idx in 0..=n {
                    if idx == best {
                        continue;
                    }
                    for j in 0..n {
                        simplex[idx][j] = best_v[j] + SHRINK * (simplex[idx][j] - best_v[j]);
                    }
                    fvals[idx] = f(&simplex[idx]);
                }
            }
        }
    }

    let mut best = 0;
    for i in 1..=n {
        if fvals[i] < fvals[best] {
            best = i;
        }
    }
    Ok((simplex[best].clone(), fvals[best]))
}
