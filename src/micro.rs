//! Reduced-subspace solver for the level-shifted trust-region subproblem.
//!
//! The basis starts from the normalized gradient plus a few random vectors and
//! grows by one vector per micro-iteration. In basis coordinates the problem is
//! the augmented Hessian
//!
//! ```text
//! [ 0      α gᵀB ]
//! [ α Bᵀg  BᵀHB  ]
//! ```
//!
//! whose lowest eigenvector `(v₀, v)` gives the step `s = v / (α v₀)` solving
//! `(H - μ) s = -g` with level shift `μ` equal to the eigenvalue. Bisection on
//! `α` places the step on the trust-region boundary.

use crate::TrustRegionError;
use crate::context::RunContext;
use crate::jacobi_davidson;
use crate::subspace::{ReducedBasis, ReducedMatrix, lowest_eigenpair, norm, symmetric_solve};
use ndarray::{Array1, s};

/// Reduced Hessians whose lowest eigenvalue is above this are treated as
/// positive definite and get a plain Newton step.
const NEWTON_EIGENVALUE_CUTOFF: f64 = -1e-5;
const ALPHA_LOWER: f64 = 1e-4;
const ALPHA_UPPER: f64 = 1e6;
const BISECTION_TOL: f64 = 1e-10;
const MAX_BISECTION_ITERATIONS: usize = 100;
/// Level-shift eigenvector components below this cannot represent a step.
const MIN_SHIFT_COMPONENT: f64 = 1e-14;
/// Shifts smaller than this count as the local (Newton) regime.
const LOCAL_REGIME_SHIFT: f64 = 1e-12;
const MIN_RESIDUAL_TARGET: f64 = 1e-12;
/// Consecutive solutions with squared overlap below this restart the stall window.
const DIRECTION_CHANGE_OVERLAP: f64 = 0.5;
const STALL_ITERATIONS: usize = 5;
const STALL_RESIDUAL_FRACTION: f64 = 0.9;
/// Beyond this many micro-iterations Jacobi-Davidson takes over regardless.
pub(crate) const JACOBI_DAVIDSON_START: usize = 30;
/// Floor of the default diagonal preconditioner.
const PRECONDITIONER_FLOOR: f64 = 1e-10;

pub(crate) type HessianActionRef<'a> = &'a dyn Fn(&Array1<f64>) -> Array1<f64>;
pub(crate) type PreconditionerRef<'a> = &'a dyn Fn(&Array1<f64>, f64) -> Array1<f64>;

/// Settings the micro-solver reads from the solver configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MicroSettings {
    pub(crate) max_iterations: usize,
    pub(crate) n_random_trial_vectors: usize,
    pub(crate) global_red_factor: f64,
    pub(crate) local_red_factor: f64,
    pub(crate) jacobi_davidson: bool,
    /// Micro-iteration after which Jacobi-Davidson is forced.
    pub(crate) jacobi_davidson_start: usize,
}

/// Everything known about the model at the current macro iterate.
pub(crate) struct LocalModel<'a> {
    pub(crate) gradient: &'a Array1<f64>,
    pub(crate) hessian_diagonal: &'a Array1<f64>,
    pub(crate) hessian_action: HessianActionRef<'a>,
    pub(crate) preconditioner: Option<PreconditionerRef<'a>>,
}

#[derive(Debug, Clone)]
pub(crate) struct MicroOutcome {
    pub(crate) step: Array1<f64>,
    /// `H s`, assembled from stored basis images.
    pub(crate) hessian_step: Array1<f64>,
    pub(crate) level_shift: f64,
    pub(crate) iterations: usize,
    pub(crate) converged: bool,
    /// False when the bisection could not enclose the trust radius.
    pub(crate) bracketed: bool,
    pub(crate) jacobi_davidson_iterations: usize,
}

struct ReducedStep {
    coefficients: Array1<f64>,
    level_shift: f64,
    bracketed: bool,
}

/// Default preconditioner: `r / (diag - μ)` with the denominator's magnitude
/// floored at 1e-10.
pub(crate) fn diagonal_precondition(
    residual: &Array1<f64>,
    hessian_diagonal: &Array1<f64>,
    level_shift: f64,
) -> Array1<f64> {
    let mut out = residual.clone();
    out.zip_mut_with(hessian_diagonal, |r, &h| {
        let d = h - level_shift;
        let d = if d.abs() < PRECONDITIONER_FLOOR {
            PRECONDITIONER_FLOOR
        } else {
            d
        };
        *r /= d;
    });
    out
}

/// Number of random trial vectors actually used: never more than half the
/// dimension.
pub(crate) fn clamp_trial_vectors(requested: usize, dim: usize) -> usize {
    requested.min(dim / 2)
}

/// Lowest eigenpair of the augmented Hessian with its gradient coupling scaled
/// by `alpha`; returns the reduced step and the level shift.
fn level_shifted_step(
    aug_hessian: &mut ReducedMatrix,
    reduced_gradient: &Array1<f64>,
    alpha: f64,
) -> Result<(Array1<f64>, f64), TrustRegionError> {
    for (k, &g) in reduced_gradient.iter().enumerate() {
        aug_hessian.set_symmetric(0, k + 1, alpha * g);
    }
    let (level_shift, eigenvector) = lowest_eigenpair(aug_hessian.view())?;
    let shift_component = eigenvector[0];
    if shift_component.abs() < MIN_SHIFT_COMPONENT {
        return Err(TrustRegionError::DegenerateSubspace {
            reason: "level-shift eigenvector has no gradient component; \
                     increase the number of random trial vectors"
                .to_string(),
        });
    }
    let step = eigenvector.slice(s![1..]).to_owned() / (alpha * shift_component);
    Ok((step, level_shift))
}

/// Newton step if the reduced Hessian allows it and it fits, otherwise the
/// boundary step found by bisection on `alpha`.
fn reduced_step(
    aug_hessian: &mut ReducedMatrix,
    reduced_gradient: &Array1<f64>,
    trust_radius: f64,
) -> Result<ReducedStep, TrustRegionError> {
    let (min_eigenvalue, _) = lowest_eigenpair(aug_hessian.view().slice(s![1.., 1..]))?;
    if min_eigenvalue > NEWTON_EIGENVALUE_CUTOFF {
        let hessian_block = aug_hessian.view().slice(s![1.., 1..]).to_owned();
        // A singular block with the gradient outside its range has no Newton step.
        let newton = symmetric_solve(hessian_block.view(), &-reduced_gradient)?;
        if let Some(newton) = newton.filter(|step| norm(step) <= trust_radius) {
            return Ok(ReducedStep {
                coefficients: newton,
                level_shift: 0.0,
                bracketed: true,
            });
        }
    }

    let (mut lower, mut upper) = (ALPHA_LOWER, ALPHA_UPPER);
    let (step_lower, _) = level_shifted_step(aug_hessian, reduced_gradient, lower)?;
    let mut f_lower = norm(&step_lower) - trust_radius;
    let upper_step = level_shifted_step(aug_hessian, reduced_gradient, upper)?;
    let f_upper = norm(&upper_step.0) - trust_radius;
    if f_lower * f_upper > 0.0 {
        return Ok(ReducedStep {
            coefficients: Array1::zeros(reduced_gradient.len()),
            level_shift: 0.0,
            bracketed: false,
        });
    }

    let mut best = upper_step;
    for _ in 0..MAX_BISECTION_ITERATIONS {
        let alpha = 0.5 * (lower + upper);
        best = level_shifted_step(aug_hessian, reduced_gradient, alpha)?;
        let f_mid = norm(&best.0) - trust_radius;
        if f_mid.abs() < BISECTION_TOL {
            break;
        }
        if f_mid * f_lower > 0.0 {
            lower = alpha;
            f_lower = f_mid;
        } else {
            upper = alpha;
        }
        if upper - lower <= f64::EPSILON * upper {
            break;
        }
    }
    let (coefficients, level_shift) = best;
    Ok(ReducedStep {
        coefficients,
        level_shift,
        bracketed: true,
    })
}

fn append(
    basis: &mut ReducedBasis,
    aug_hessian: &mut ReducedMatrix,
    gradient: &Array1<f64>,
    vector: Array1<f64>,
    image: Array1<f64>,
) -> Result<(), TrustRegionError> {
    basis.add_column(vector.view(), image.view())?;
    let mut couplings = Array1::zeros(aug_hessian.len() + 1);
    couplings[0] = gradient.dot(&vector);
    couplings.slice_mut(s![1..]).assign(&basis.last_couplings());
    aug_hessian.extend_symm(couplings.view());
    Ok(())
}

/// Tracks whether subspace expansion has stopped paying off.
struct StallMonitor {
    previous_direction: Option<Array1<f64>>,
    start_iteration: usize,
    start_residual: f64,
}

impl StallMonitor {
    fn new() -> Self {
        Self {
            previous_direction: None,
            start_iteration: 0,
            start_residual: f64::INFINITY,
        }
    }

    /// Records this iteration; returns true once the stall criterion fires.
    fn observe(&mut self, iteration: usize, direction: &Array1<f64>, residual_norm: f64) -> bool {
        let restart = match &self.previous_direction {
            Some(previous) => previous.dot(direction).powi(2) < DIRECTION_CHANGE_OVERLAP,
            None => true,
        };
        if restart {
            self.start_iteration = iteration;
            self.start_residual = residual_norm;
        }
        self.previous_direction = Some(direction.clone());
        iteration - self.start_iteration >= STALL_ITERATIONS
            && residual_norm > STALL_RESIDUAL_FRACTION * self.start_residual
    }
}

/// Solves the trust-region subproblem at the current iterate.
pub(crate) fn solve_subproblem(
    model: &LocalModel<'_>,
    trust_radius: f64,
    settings: &MicroSettings,
    ctx: &mut RunContext,
) -> Result<MicroOutcome, TrustRegionError> {
    solve_in_subspace(model, trust_radius, settings, ctx).map(|(outcome, _)| outcome)
}

/// As [`solve_subproblem`], also handing back the final basis.
fn solve_in_subspace(
    model: &LocalModel<'_>,
    trust_radius: f64,
    settings: &MicroSettings,
    ctx: &mut RunContext,
) -> Result<(MicroOutcome, ReducedBasis), TrustRegionError> {
    let gradient = model.gradient;
    let n = gradient.len();
    let grad_norm = norm(gradient);
    let n_random = clamp_trial_vectors(settings.n_random_trial_vectors, n);
    let capacity = (1 + n_random + settings.max_iterations).min(n);

    let mut basis = ReducedBasis::with_capacity(n, capacity);
    let mut aug_hessian = ReducedMatrix::with_capacity(capacity + 1);
    aug_hessian.extend_symm(Array1::zeros(1).view());

    let first = gradient / grad_norm;
    let image = ctx.apply_hessian(model.hessian_action, &first);
    append(&mut basis, &mut aug_hessian, gradient, first, image)?;
    for _ in 0..n_random {
        let trial = ctx.random_vector(n);
        let trial = basis.orthonormalize(trial)?;
        let image = ctx.apply_hessian(model.hessian_action, &trial);
        append(&mut basis, &mut aug_hessian, gradient, trial, image)?;
    }

    let mut monitor = StallMonitor::new();
    let mut jacobi_davidson_active = false;
    let mut outcome = MicroOutcome {
        step: Array1::zeros(n),
        hessian_step: Array1::zeros(n),
        level_shift: 0.0,
        iterations: 0,
        converged: false,
        bracketed: true,
        jacobi_davidson_iterations: 0,
    };

    for iteration in 1..=settings.max_iterations {
        let reduced_gradient = basis.vectors().dot(gradient);
        let reduced = reduced_step(&mut aug_hessian, &reduced_gradient, trust_radius)?;
        outcome.iterations = iteration;
        outcome.level_shift = reduced.level_shift;
        if !reduced.bracketed {
            ctx.reporter.detail(&format!(
                "[TR] micro-iteration {iteration}: trust radius {trust_radius:.3e} not bracketed"
            ));
            outcome.step = Array1::zeros(n);
            outcome.hessian_step = Array1::zeros(n);
            outcome.bracketed = false;
            return Ok((outcome, basis));
        }
        outcome.step = basis.expand(&reduced.coefficients);
        outcome.hessian_step = basis.expand_image(&reduced.coefficients);

        let mut residual = gradient + &outcome.hessian_step;
        residual.scaled_add(-reduced.level_shift, &outcome.step);
        let residual_norm = norm(&residual);
        let red_factor = if reduced.level_shift.abs() < LOCAL_REGIME_SHIFT {
            settings.local_red_factor
        } else {
            settings.global_red_factor
        };
        let target = (red_factor * grad_norm).max(MIN_RESIDUAL_TARGET);
        ctx.reporter.detail(&format!(
            "[TR] micro-iteration {iteration}: residual {residual_norm:.3e} (target {target:.3e}), μ = {:.3e}",
            reduced.level_shift
        ));
        if residual_norm < target || basis.is_full() {
            outcome.converged = true;
            return Ok((outcome, basis));
        }
        if iteration == settings.max_iterations {
            break;
        }

        let step_norm = norm(&outcome.step);
        let direction = if step_norm > 0.0 {
            &outcome.step / step_norm
        } else {
            first_basis_vector(&basis)
        };
        let stalled = monitor.observe(iteration, &direction, residual_norm);
        if settings.jacobi_davidson
            && !jacobi_davidson_active
            && (stalled || iteration > settings.jacobi_davidson_start)
        {
            jacobi_davidson_active = true;
            ctx.reporter.detail(&format!(
                "[TR] switching to Jacobi-Davidson expansion at micro-iteration {iteration}"
            ));
        }

        if jacobi_davidson_active {
            outcome.jacobi_davidson_iterations += 1;
            let rtol = 3f64.powi(-(outcome.jacobi_davidson_iterations as i32));
            let (correction, image) = jacobi_davidson::correction(
                model.hessian_action,
                &direction,
                &residual,
                reduced.level_shift,
                rtol,
                ctx,
            )?;
            let (vector, image) = basis.orthonormalize_with_image(correction, image)?;
            append(&mut basis, &mut aug_hessian, gradient, vector, image)?;
        } else {
            let preconditioned = match model.preconditioner {
                Some(precondition) => precondition(&residual, reduced.level_shift),
                None => diagonal_precondition(&residual, model.hessian_diagonal, reduced.level_shift),
            };
            let vector = basis.orthonormalize(preconditioned)?;
            let image = ctx.apply_hessian(model.hessian_action, &vector);
            append(&mut basis, &mut aug_hessian, gradient, vector, image)?;
        }
    }

    ctx.reporter.detail(&format!(
        "[TR] micro-iterations exhausted ({}) without reaching the residual target",
        settings.max_iterations
    ));
    Ok((outcome, basis))
}

fn first_basis_vector(basis: &ReducedBasis) -> Array1<f64> {
    basis.vectors().row(0).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Reporter;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use spectral::prelude::*;

    fn settings() -> MicroSettings {
        MicroSettings {
            max_iterations: 50,
            n_random_trial_vectors: 1,
            global_red_factor: 1e-3,
            local_red_factor: 1e-4,
            jacobi_davidson: true,
            jacobi_davidson_start: JACOBI_DAVIDSON_START,
        }
    }

    fn random_symmetric(n: usize, shift: f64, rng: &mut StdRng) -> Array2<f64> {
        let a = Array2::from_shape_fn((n, n), |_| rng.gen_range(-1.0..1.0));
        (&a + &a.t()) * 0.5 + Array2::<f64>::eye(n) * shift
    }

    fn solve(h: &Array2<f64>, g: &Array1<f64>, radius: f64, settings: &MicroSettings) -> (MicroOutcome, RunContext) {
        let (out, _, ctx) = solve_keeping_basis(h, g, radius, settings);
        (out, ctx)
    }

    fn solve_keeping_basis(
        h: &Array2<f64>,
        g: &Array1<f64>,
        radius: f64,
        settings: &MicroSettings,
    ) -> (MicroOutcome, ReducedBasis, RunContext) {
        let diag = h.diag().to_owned();
        let hess = {
            let h = h.clone();
            move |v: &Array1<f64>| h.dot(v)
        };
        let model = LocalModel {
            gradient: g,
            hessian_diagonal: &diag,
            hessian_action: &hess,
            preconditioner: None,
        };
        let mut ctx = RunContext::new(42, Reporter::default());
        let (out, basis) = solve_in_subspace(&model, radius, settings, &mut ctx).unwrap();
        (out, basis, ctx)
    }

    #[test]
    fn newton_step_inside_large_trust_region() {
        let h = array![[4.0, 1.0, 0.0], [1.0, 3.0, 0.5], [0.0, 0.5, 2.0]];
        let g = array![1.0, -2.0, 0.5];
        let (out, _) = solve(&h, &g, 10.0, &settings());
        assert!(out.converged);
        assert_eq!(out.level_shift, 0.0);
        let residual = h.dot(&out.step) + &g;
        assert_that!(&norm(&residual)).is_less_than(1e-4 * norm(&g) + 1e-12);
    }

    #[test]
    fn boundary_step_matches_trust_radius() {
        let mut rng = StdRng::seed_from_u64(9);
        let n = 20;
        let h = random_symmetric(n, 0.5, &mut rng);
        let g = Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0));
        let radius = 0.1;
        let (out, _) = solve(&h, &g, radius, &settings());
        assert!(out.converged);
        assert_that!(&(norm(&out.step) - radius).abs()).is_less_than(1e-9);
        // Level-shifted steps on a boundary sit below the lowest eigenvalue.
        assert!(out.level_shift < 0.0);
        // Model decrease is negative.
        let model_change = g.dot(&out.step) + 0.5 * out.step.dot(&out.hessian_step);
        assert!(model_change < 0.0);
    }

    #[test]
    fn bisection_hits_every_bracketed_radius() {
        let h = array![[2.0, 0.3, 0.0], [0.3, -1.0, 0.2], [0.0, 0.2, 1.5]];
        let g = array![0.4, 0.3, -0.2];
        let mut aug = ReducedMatrix::with_capacity(4);
        aug.extend_symm(array![0.0].view());
        for k in 0..3 {
            let mut couplings = Array1::zeros(k + 2);
            couplings[0] = g[k];
            for j in 0..=k {
                couplings[j + 1] = h[(j, k)];
            }
            aug.extend_symm(couplings.view());
        }
        let (lo, _) = level_shifted_step(&mut aug, &g, ALPHA_LOWER).unwrap();
        let (hi, _) = level_shifted_step(&mut aug, &g, ALPHA_UPPER).unwrap();
        let (n_lo, n_hi) = (norm(&lo), norm(&hi));
        for radius in [0.01, 0.05, 0.2, 0.5, 1.0, 2.0] {
            assert!(n_hi < radius && radius < n_lo);
            let step = reduced_step(&mut aug, &g, radius).unwrap();
            assert!(step.bracketed);
            assert_that!(&(norm(&step.coefficients) - radius).abs()).is_less_than(1e-9);
        }
    }

    #[test]
    fn unbracketed_radius_gives_zero_step() {
        let h = array![[2.0, 0.3, 0.0], [0.3, -1.0, 0.2], [0.0, 0.2, 1.5]];
        let g = array![0.4, 0.3, -0.2];
        let mut aug = ReducedMatrix::with_capacity(4);
        aug.extend_symm(array![0.0].view());
        for k in 0..3 {
            let mut couplings = Array1::zeros(k + 2);
            couplings[0] = g[k];
            for j in 0..=k {
                couplings[j + 1] = h[(j, k)];
            }
            aug.extend_symm(couplings.view());
        }
        let step = reduced_step(&mut aug, &g, 1e-12).unwrap();
        assert!(!step.bracketed);
        assert!(step.coefficients.iter().all(|&c| c == 0.0));
    }

    #[test]
    fn jacobi_davidson_expansion_converges_and_keeps_images() {
        let mut rng = StdRng::seed_from_u64(21);
        let n = 30;
        let h = random_symmetric(n, 3.0, &mut rng);
        let g = Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0));
        let mut forced = settings();
        forced.jacobi_davidson_start = 0;
        let (out, basis, ctx) = solve_keeping_basis(&h, &g, 0.2, &forced);
        assert!(out.converged);
        assert!(out.jacobi_davidson_iterations > 0);
        // Vectors added through the correction path stay orthonormal.
        let gram = basis.vectors().dot(&basis.vectors().t());
        let drift = (&gram - &Array2::<f64>::eye(basis.len()))
            .iter()
            .fold(0.0_f64, |m, v| m.max(v.abs()));
        assert_that!(&drift).is_less_than(1e-10);
        assert_that!(&(norm(&out.step) - 0.2).abs()).is_less_than(1e-9);
        // H s assembled from propagated images agrees with a direct product.
        let direct = h.dot(&out.step);
        assert_that!(&norm(&(&direct - &out.hessian_step))).is_less_than(1e-8);
        assert!(ctx.counters().hessian_actions > 2);
    }

    #[test]
    fn disabled_jacobi_davidson_never_switches() {
        let mut rng = StdRng::seed_from_u64(22);
        let n = 16;
        let h = random_symmetric(n, 2.0, &mut rng);
        let g = Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0));
        let mut plain = settings();
        plain.jacobi_davidson = false;
        plain.jacobi_davidson_start = 0;
        let (out, _) = solve(&h, &g, 0.3, &plain);
        assert!(out.converged);
        assert_eq!(out.jacobi_davidson_iterations, 0);
    }

    #[test]
    fn stall_monitor_fires_after_flat_window() {
        let mut monitor = StallMonitor::new();
        let d = array![1.0, 0.0];
        for it in 1..=5 {
            assert!(!monitor.observe(it, &d, 1.0));
        }
        assert!(monitor.observe(6, &d, 0.95));
        // A large change in direction restarts the window.
        let turned = array![0.0, 1.0];
        assert!(!monitor.observe(7, &turned, 0.95));
    }

    #[test]
    fn diagonal_preconditioner_floors_small_denominators() {
        let r = array![1.0, 1.0, 1.0];
        let diag = array![2.0, 0.5, -1.0];
        let out = diagonal_precondition(&r, &diag, 0.5);
        assert_that!(&out[0]).is_close_to(1.0 / 1.5, 1e-15);
        assert_that!(&out[1]).is_close_to(1e10, 1.0);
        assert_that!(&out[2]).is_close_to(-1.0 / 1.5, 1e-15);
    }

    #[test]
    fn zero_hessian_gets_a_boundary_step_from_a_clamped_basis() {
        let h = Array2::<f64>::zeros((4, 4));
        let g = Array1::ones(4);
        let mut requested = settings();
        requested.n_random_trial_vectors = 3;
        let (out, basis, ctx) = solve_keeping_basis(&h, &g, 0.4, &requested);
        assert!(out.converged);
        assert!(out.bracketed);
        assert_eq!(out.iterations, 1);
        // Gradient direction plus min(3, 4 / 2) random vectors.
        assert_eq!(basis.len(), 3);
        assert_eq!(ctx.counters().hessian_actions, 3);
        // Steepest descent onto the boundary: s = -0.4 g / |g|, shift -|g| / 0.4.
        assert_that!(&norm(&out.step)).is_close_to(0.4, 1e-9);
        for &component in out.step.iter() {
            assert_that!(&component).is_close_to(-0.2, 1e-9);
        }
        assert_that!(&out.level_shift).is_close_to(-5.0, 1e-6);
    }

    #[test]
    fn rank_deficient_reduced_hessian_takes_the_newton_step() {
        // PSD with a two-dimensional kernel; the gradient lies in the range.
        let mut rng = StdRng::seed_from_u64(31);
        let a = Array2::from_shape_fn((3, 5), |_| rng.gen_range(-1.0..1.0));
        let h = a.t().dot(&a);
        let g = h.dot(&Array1::from_shape_fn(5, |_| rng.gen_range(-0.1..0.1)));
        let mut full = settings();
        full.n_random_trial_vectors = 2;
        let (out, _) = solve(&h, &g, 10.0, &full);
        assert!(out.converged);
        assert_eq!(out.level_shift, 0.0);
        let residual = h.dot(&out.step) + &g;
        assert_that!(&norm(&residual)).is_less_than(1e-4 * norm(&g) + 1e-12);
    }

    #[test]
    fn trial_vectors_are_clamped_to_half_the_dimension() {
        assert_eq!(clamp_trial_vectors(3, 4), 2);
        assert_eq!(clamp_trial_vectors(1, 4), 1);
        assert_eq!(clamp_trial_vectors(5, 1), 0);
    }
}
