//! MINRES for symmetric, possibly indefinite, operators.
//!
//! This is the Paige–Saunders three-term Lanczos recurrence with a QR
//! factorization of the tridiagonal matrix updated by plane rotations. Besides
//! the usual operator application the callback returns a second "companion"
//! image of the Lanczos vector (for the Jacobi-Davidson correction this is the
//! raw Hessian action). The same recurrences that build the solution are
//! applied to the companion images, so the companion image of the solution is
//! available at the end without another operator call.

use crate::TrustRegionError;
use ndarray::Array1;
use std::fmt;

/// Options for a MINRES solve.
#[derive(Debug, Clone, Copy)]
pub struct MinresOptions {
    /// Relative tolerance for the `Ax = b` and least-squares stopping tests.
    pub rtol: f64,
    /// Iteration cap; defaults to five times the problem dimension.
    pub max_iterations: Option<usize>,
}

impl Default for MinresOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-8,
            max_iterations: None,
        }
    }
}

/// Why MINRES stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinresStop {
    /// The initial residual was exactly zero.
    ExactInitialGuess,
    /// The second Lanczos vector vanished: `b` and `x` are eigenvectors.
    EigenvectorRhs,
    /// `||r|| / (||A|| ||x||)` fell below the tolerance.
    Solved,
    /// `||A r|| / (||A|| ||r||)` fell below the tolerance.
    LeastSquaresSolved,
    /// Further progress is limited by machine precision.
    MachinePrecision,
    /// The condition estimate exceeded `0.1 / eps`; `x` approximates an eigenvector.
    ConditionLimit,
    /// The iteration cap was reached.
    IterationLimit,
}

impl MinresStop {
    /// Every stop except the iteration cap counts as convergence.
    pub fn is_converged(self) -> bool {
        !matches!(self, MinresStop::IterationLimit)
    }
}

impl fmt::Display for MinresStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MinresStop::ExactInitialGuess => "beta1 = 0, the exact solution is x0",
            MinresStop::EigenvectorRhs => "beta2 = 0, b and x are eigenvectors",
            MinresStop::Solved => "a solution to Ax = b was found, given rtol",
            MinresStop::LeastSquaresSolved => "a least-squares solution was found, given rtol",
            MinresStop::MachinePrecision => "reasonable accuracy achieved, given eps",
            MinresStop::ConditionLimit => "x has converged to an eigenvector (acond >= 0.1/eps)",
            MinresStop::IterationLimit => "the iteration limit was reached",
        };
        f.write_str(text)
    }
}

/// Converged MINRES result.
#[derive(Debug, Clone)]
pub struct MinresOutcome {
    pub solution: Array1<f64>,
    /// Companion image of `solution`.
    pub image: Array1<f64>,
    pub iterations: usize,
    pub stop: MinresStop,
    /// Residual-norm estimate before the first and after every iteration.
    pub residual_norms: Vec<f64>,
}

/// Solves `A x = b`.
///
/// `operator(v)` must return `(A v, C v)` for a linear companion `C`. An
/// optional warm start costs one extra operator call. Hitting the iteration
/// cap is an error.
pub fn minres<Op>(
    mut operator: Op,
    rhs: &Array1<f64>,
    warm_start: Option<&Array1<f64>>,
    options: MinresOptions,
) -> Result<MinresOutcome, TrustRegionError>
where
    Op: FnMut(&Array1<f64>) -> (Array1<f64>, Array1<f64>),
{
    let n = rhs.len();
    let eps = f64::EPSILON;
    let max_iterations = options.max_iterations.unwrap_or(5 * n).max(1);
    let rtol = options.rtol;

    let (mut x, mut image, r1_init) = match warm_start {
        Some(x0) => {
            let (ax0, cx0) = operator(x0);
            (x0.clone(), cx0, rhs - &ax0)
        }
        None => (Array1::zeros(n), Array1::zeros(n), rhs.clone()),
    };

    let beta1 = r1_init.dot(&r1_init).sqrt();
    if beta1 == 0.0 {
        return Ok(MinresOutcome {
            solution: x,
            image,
            iterations: 0,
            stop: MinresStop::ExactInitialGuess,
            residual_norms: vec![0.0],
        });
    }

    let mut r1 = r1_init.clone();
    let mut r2 = r1_init.clone();
    let mut y = r1_init;
    let mut residual_norms = vec![beta1];

    let mut oldb = 0.0;
    let mut beta = beta1;
    let mut dbar = 0.0;
    let mut epsln = 0.0;
    let mut phibar = beta1;
    let mut rhs1 = beta1;
    let mut rhs2 = 0.0;
    let mut tnorm2 = 0.0;
    let mut gmax: f64 = 0.0;
    let mut gmin = f64::MAX;
    let mut cs = -1.0;
    let mut sn = 0.0;
    let mut w: Array1<f64> = Array1::zeros(n);
    let mut w2: Array1<f64> = Array1::zeros(n);
    let mut hw: Array1<f64> = Array1::zeros(n);
    let mut hw2: Array1<f64> = Array1::zeros(n);

    let mut stop: Option<MinresStop> = None;
    let mut itn = 0;

    while itn < max_iterations {
        itn += 1;

        let s = 1.0 / beta;
        let v = &y * s;
        let (av, cv) = operator(&v);
        y = av;
        if itn >= 2 {
            y.scaled_add(-beta / oldb, &r1);
        }
        let alfa = v.dot(&y);
        y.scaled_add(-alfa / beta, &r2);
        r1 = std::mem::replace(&mut r2, y.clone());
        oldb = beta;
        beta = r2.dot(&y).sqrt();
        tnorm2 += alfa * alfa + oldb * oldb + beta * beta;

        if itn == 1 && beta / beta1 <= 10.0 * eps {
            stop = Some(MinresStop::EigenvectorRhs);
        }

        // Apply the previous rotation.
        let oldeps = epsln;
        let delta = cs * dbar + sn * alfa;
        let gbar = sn * dbar - cs * alfa;
        epsln = sn * beta;
        dbar = -cs * beta;
        let root = gbar.hypot(dbar);

        // Next rotation.
        let gamma = gbar.hypot(beta).max(eps);
        cs = gbar / gamma;
        sn = beta / gamma;
        let phi = cs * phibar;
        phibar *= sn;

        let denom = 1.0 / gamma;
        let w1 = std::mem::replace(&mut w2, w.clone());
        w = (&v - &(&w1 * oldeps) - &(&w2 * delta)) * denom;
        x.scaled_add(phi, &w);
        let hw1 = std::mem::replace(&mut hw2, hw.clone());
        hw = (&cv - &(&hw1 * oldeps) - &(&hw2 * delta)) * denom;
        image.scaled_add(phi, &hw);

        gmax = gmax.max(gamma);
        gmin = gmin.min(gamma);
        let z = rhs1 / gamma;
        rhs1 = rhs2 - delta * z;
        rhs2 = -epsln * z;

        let anorm = tnorm2.sqrt();
        let ynorm = x.dot(&x).sqrt();
        let epsx = anorm * ynorm * eps;
        let rnorm = phibar;
        residual_norms.push(rnorm);

        let test1 = if ynorm == 0.0 || anorm == 0.0 {
            f64::INFINITY
        } else {
            rnorm / (anorm * ynorm)
        };
        let test2 = if anorm == 0.0 {
            f64::INFINITY
        } else {
            root / anorm
        };
        let acond = gmax / gmin;

        if stop.is_none() {
            let mut reason = None;
            if 1.0 + test2 <= 1.0 {
                reason = Some(MinresStop::LeastSquaresSolved);
            }
            if 1.0 + test1 <= 1.0 {
                reason = Some(MinresStop::Solved);
            }
            if itn >= max_iterations {
                reason = Some(MinresStop::IterationLimit);
            }
            if acond >= 0.1 / eps {
                reason = Some(MinresStop::ConditionLimit);
            }
            if epsx >= beta1 {
                reason = Some(MinresStop::MachinePrecision);
            }
            if test2 <= rtol {
                reason = Some(MinresStop::LeastSquaresSolved);
            }
            if test1 <= rtol {
                reason = Some(MinresStop::Solved);
            }
            stop = reason;
        }
        if stop.is_some() {
            break;
        }
    }

    match stop {
        Some(stop) if stop.is_converged() => Ok(MinresOutcome {
            solution: x,
            image,
            iterations: itn,
            stop,
            residual_norms,
        }),
        _ => Err(TrustRegionError::MinresIterationLimit { iterations: itn }),
    }
}
