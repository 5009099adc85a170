//! Second-order check of a stationary point.
//!
//! The lowest eigenpair of the doubled Hessian is found with a Davidson
//! iteration (diagonal preconditioning first, Jacobi-Davidson corrections after
//! [`JACOBI_DAVIDSON_START`] iterations). A clearly negative eigenvalue marks a
//! saddle point and its eigenvector is the direction to escape along.

use crate::context::{Reporter, RunContext};
use crate::jacobi_davidson;
use crate::micro::{
    HessianActionRef, JACOBI_DAVIDSON_START, PreconditionerRef, clamp_trial_vectors,
    diagonal_precondition,
};
use crate::subspace::{ReducedBasis, ReducedMatrix, lowest_eigenpair, norm};
use crate::{HessianAction, Preconditioner, Sink, TrustRegionError};
use ndarray::Array1;

/// Eigenvalues of the doubled Hessian above this count as non-negative.
pub const STABILITY_THRESHOLD: f64 = -1e-3;
/// Gradients shorter than this do not contribute a starting vector.
const MIN_GRADIENT_NORM: f64 = 1e-14;

/// Settings of the stability analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilitySettings {
    /// Residual norm at which the lowest eigenpair counts as converged (default: 1e-4).
    pub tolerance: f64,
    /// Davidson iteration cap (default: 100).
    pub max_iterations: usize,
    /// Random starting vectors, clamped to half the dimension (default: 20).
    pub n_random_trial_vectors: usize,
    /// Switch to Jacobi-Davidson corrections after 30 iterations (default: true).
    pub jacobi_davidson: bool,
}

impl Default for StabilitySettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-4,
            max_iterations: 100,
            n_random_trial_vectors: 20,
            jacobi_davidson: true,
        }
    }
}

/// Outcome of a stability analysis.
#[derive(Debug, Clone)]
pub struct StabilityReport {
    /// True when the lowest eigenvalue is above [`STABILITY_THRESHOLD`].
    pub stable: bool,
    /// Lowest eigenvalue estimate of the doubled Hessian.
    pub eigenvalue: f64,
    /// Unit negative-curvature direction when the point is unstable.
    pub direction: Option<Array1<f64>>,
    pub iterations: usize,
    /// False when the iteration cap was hit first; the last estimate is reported.
    pub converged: bool,
    /// Hessian-vector products spent by this analysis.
    pub hessian_actions: usize,
}

fn append(
    basis: &mut ReducedBasis,
    reduced: &mut ReducedMatrix,
    vector: Array1<f64>,
    image: Array1<f64>,
) -> Result<(), TrustRegionError> {
    basis.add_column(vector.view(), image.view())?;
    reduced.extend_symm(basis.last_couplings().view());
    Ok(())
}

/// Runs the analysis inside an existing run context.
pub(crate) fn analyze(
    gradient: &Array1<f64>,
    hessian_diagonal: &Array1<f64>,
    hessian_action: HessianActionRef<'_>,
    preconditioner: Option<PreconditionerRef<'_>>,
    settings: &StabilitySettings,
    ctx: &mut RunContext,
) -> Result<StabilityReport, TrustRegionError> {
    let n = gradient.len();
    if n == 0 {
        return Ok(StabilityReport {
            stable: true,
            eigenvalue: 0.0,
            direction: None,
            iterations: 0,
            converged: true,
            hessian_actions: 0,
        });
    }
    let actions_before = ctx.counters().hessian_actions;
    let doubled = |v: &Array1<f64>| hessian_action(v) * 2.0;
    let doubled_diagonal = hessian_diagonal * 2.0;
    let n_random = clamp_trial_vectors(settings.n_random_trial_vectors, n);
    let capacity = (2 + n_random + settings.max_iterations).min(n);

    let mut basis = ReducedBasis::with_capacity(n, capacity);
    let mut reduced = ReducedMatrix::with_capacity(capacity);
    let grad_norm = norm(gradient);
    if grad_norm > MIN_GRADIENT_NORM {
        let first = gradient / grad_norm;
        let image = ctx.apply_hessian(&doubled, &first);
        append(&mut basis, &mut reduced, first, image)?;
    }
    let (min_index, min_diagonal) = hessian_diagonal
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |(bi, bv), (i, &v)| if v < bv { (i, v) } else { (bi, bv) });
    if min_diagonal < 0.0 || basis.len() == 0 {
        let mut unit = Array1::zeros(n);
        unit[min_index] = 1.0;
        if let Some((vector, _)) = basis.try_orthonormalize(unit, None) {
            let image = ctx.apply_hessian(&doubled, &vector);
            append(&mut basis, &mut reduced, vector, image)?;
        }
    }
    for _ in 0..n_random {
        if basis.is_full() {
            break;
        }
        let trial = ctx.random_vector(n);
        let vector = basis.orthonormalize(trial)?;
        let image = ctx.apply_hessian(&doubled, &vector);
        append(&mut basis, &mut reduced, vector, image)?;
    }

    let mut eigenvalue = 0.0;
    let mut solution = Array1::zeros(n);
    let mut converged = false;
    let mut iterations = 0;
    for iteration in 1..=settings.max_iterations {
        iterations = iteration;
        let (value, coefficients) = lowest_eigenpair(reduced.view())?;
        eigenvalue = value;
        solution = basis.expand(&coefficients);
        let mut residual = basis.expand_image(&coefficients);
        residual.scaled_add(-eigenvalue, &solution);
        let residual_norm = norm(&residual);
        ctx.reporter.detail(&format!(
            "[Stability] iteration {iteration}: λ = {eigenvalue:.6e}, residual {residual_norm:.3e}"
        ));
        if residual_norm < settings.tolerance || basis.is_full() {
            converged = true;
            break;
        }
        if iteration == settings.max_iterations {
            break;
        }

        if settings.jacobi_davidson && iteration > JACOBI_DAVIDSON_START {
            let k = (iteration - JACOBI_DAVIDSON_START) as i32;
            let direction = &solution / norm(&solution);
            let (correction, image) = jacobi_davidson::correction(
                &doubled,
                &direction,
                &residual,
                eigenvalue,
                3f64.powi(-k),
                ctx,
            )?;
            let (vector, image) = basis.orthonormalize_with_image(correction, image)?;
            append(&mut basis, &mut reduced, vector, image)?;
        } else {
            let preconditioned = match preconditioner {
                // (2H - λ)⁻¹ = ½ (H - λ/2)⁻¹
                Some(precondition) => precondition(&residual, 0.5 * eigenvalue) * 0.5,
                None => diagonal_precondition(&residual, &doubled_diagonal, eigenvalue),
            };
            let vector = basis.orthonormalize(preconditioned)?;
            let image = ctx.apply_hessian(&doubled, &vector);
            append(&mut basis, &mut reduced, vector, image)?;
        }
    }

    if !converged {
        ctx.reporter.warn(&format!(
            "[Stability] lowest eigenpair not converged after {} iterations; continuing with λ = {:.6e}",
            settings.max_iterations, eigenvalue
        ));
    }
    let stable = eigenvalue > STABILITY_THRESHOLD;
    let direction = if stable {
        None
    } else {
        let length = norm(&solution);
        Some(solution / length)
    };
    Ok(StabilityReport {
        stable,
        eigenvalue,
        direction,
        iterations,
        converged,
        hessian_actions: ctx.counters().hessian_actions - actions_before,
    })
}

/// Standalone stability analysis of a point whose gradient, Hessian diagonal
/// and Hessian action are already known.
///
/// ```
/// use ndarray::array;
/// use trust_davidson::StabilityCheck;
///
/// // f = x² - y² has a saddle at the origin.
/// let report = StabilityCheck::new(
///     array![0.0, 0.0],
///     array![2.0, -2.0],
///     |v: &ndarray::Array1<f64>| array![2.0 * v[0], -2.0 * v[1]],
/// )
/// .run()
/// .unwrap();
/// assert!(!report.stable);
/// assert!((report.eigenvalue + 4.0).abs() < 1e-8);
/// ```
pub struct StabilityCheck {
    gradient: Array1<f64>,
    hessian_diagonal: Array1<f64>,
    hessian_action: HessianAction,
    preconditioner: Option<Preconditioner>,
    settings: StabilitySettings,
    seed: u64,
    verbosity: usize,
    output: Option<Sink>,
    diagnostics: Option<Sink>,
}

impl StabilityCheck {
    pub fn new<H>(gradient: Array1<f64>, hessian_diagonal: Array1<f64>, hessian_action: H) -> Self
    where
        H: Fn(&Array1<f64>) -> Array1<f64> + 'static,
    {
        Self {
            gradient,
            hessian_diagonal,
            hessian_action: Box::new(hessian_action),
            preconditioner: None,
            settings: StabilitySettings::default(),
            seed: 42,
            verbosity: 0,
            output: None,
            diagnostics: None,
        }
    }

    pub fn with_settings(mut self, settings: StabilitySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the seed of the random starting vectors (default: 42).
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_preconditioner<P>(mut self, preconditioner: P) -> Self
    where
        P: Fn(&Array1<f64>, f64) -> Array1<f64> + 'static,
    {
        self.preconditioner = Some(Box::new(preconditioner));
        self
    }

    pub fn with_verbosity(mut self, verbosity: usize) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_output_sink(mut self, sink: Sink) -> Self {
        self.output = Some(sink);
        self
    }

    pub fn with_diagnostic_sink(mut self, sink: Sink) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn run(&self) -> Result<StabilityReport, TrustRegionError> {
        if self.hessian_diagonal.len() != self.gradient.len() {
            return Err(TrustRegionError::DimensionMismatch {
                expected: self.gradient.len(),
                found: self.hessian_diagonal.len(),
            });
        }
        let reporter = Reporter::new(self.verbosity, self.output.clone(), self.diagnostics.clone());
        let mut ctx = RunContext::new(self.seed, reporter);
        let result = analyze(
            &self.gradient,
            &self.hessian_diagonal,
            self.hessian_action.as_ref(),
            self.preconditioner.as_deref(),
            &self.settings,
            &mut ctx,
        );
        ctx.finish();
        if let Err(e) = &result {
            ctx.reporter.error(&format!("[Stability] {e}"));
        }
        result
    }
}
