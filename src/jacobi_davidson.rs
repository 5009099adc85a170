//! Jacobi-Davidson correction equation.
//!
//! With `u` the normalized current solution and `P = I - u uᵀ`, the correction
//! solves `P (H - μ I) P t = -P r` approximately with MINRES. Each MINRES
//! operator call applies the Hessian once to the projected Lanczos vector; that
//! raw action is MINRES's companion image, so `H t` comes back for free.

use crate::TrustRegionError;
use crate::context::RunContext;
use crate::minres::{MinresOptions, minres};
use ndarray::Array1;

#[inline]
fn project_out(u: &Array1<f64>, v: &Array1<f64>) -> Array1<f64> {
    let mut out = v.clone();
    out.scaled_add(-u.dot(v), u);
    out
}

/// Returns the correction `t` and its Hessian image `H t`.
pub(crate) fn correction(
    hessian_action: &dyn Fn(&Array1<f64>) -> Array1<f64>,
    solution: &Array1<f64>,
    residual: &Array1<f64>,
    level_shift: f64,
    rtol: f64,
    ctx: &mut RunContext,
) -> Result<(Array1<f64>, Array1<f64>), TrustRegionError> {
    let rhs = -project_out(solution, residual);
    let mut actions = 0usize;
    let outcome = minres(
        |v: &Array1<f64>| {
            let pv = project_out(solution, v);
            actions += 1;
            let hv = hessian_action(&pv);
            let mut shifted = hv.clone();
            shifted.scaled_add(-level_shift, &pv);
            (project_out(solution, &shifted), hv)
        },
        &rhs,
        None,
        MinresOptions {
            rtol,
            max_iterations: None,
        },
    );
    ctx.count_hessian_actions(actions);
    let outcome = outcome?;
    ctx.reporter.detail(&format!(
        "[MINRES] {} after {} iterations (rtol {:.2e})",
        outcome.stop, outcome.iterations, rtol
    ));
    Ok((outcome.solution, outcome.image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Reporter;
    use ndarray::{Array2, array};
    use spectral::prelude::*;

    #[test]
    fn correction_solves_projected_equation() {
        let h = array![
            [3.0, 0.5, 0.0, 0.1],
            [0.5, 2.0, 0.3, 0.0],
            [0.0, 0.3, 4.0, 0.2],
            [0.1, 0.0, 0.2, 5.0]
        ];
        let hess = {
            let h = h.clone();
            move |v: &Array1<f64>| h.dot(v)
        };
        let u = array![1.0, 1.0, 0.0, 0.0] / 2f64.sqrt();
        let mu = 1.0;
        let residual = h.dot(&u) - &u * mu;
        let mut ctx = RunContext::new(0, Reporter::default());
        let (t, ht) = correction(&hess, &u, &residual, mu, 1e-12, &mut ctx).unwrap();

        // t is orthogonal to u and satisfies the projected equation.
        assert_that!(&t.dot(&u).abs()).is_less_than(1e-10);
        let shifted = &h - &(Array2::<f64>::eye(4) * mu);
        let lhs = project_out(&u, &shifted.dot(&project_out(&u, &t)));
        let rhs = -project_out(&u, &residual);
        let err = &lhs - &rhs;
        assert_that!(&err.dot(&err).sqrt()).is_less_than(1e-8);

        // The byproduct image matches a direct Hessian application.
        let direct = h.dot(&t);
        let diff = &ht - &direct;
        assert_that!(&diff.dot(&diff).sqrt()).is_less_than(1e-8);
        assert!(ctx.counters().hessian_actions > 0);
    }
}
