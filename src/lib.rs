//! A trust-region Newton optimizer for smooth objectives whose Hessian is only
//! available through Hessian-vector products.
//!
//! Each macro-iteration solves the level-shifted Newton subproblem in a small,
//! growing Davidson subspace, so the full Hessian is never formed. Once the
//! gradient has converged, the point is checked for negative curvature and, if
//! it is a saddle, the solver escapes along the lowest Hessian eigenvector and
//! keeps going.
//!
//! # Features
//! - Level-shifted augmented-Hessian steps with bisection onto the trust-region
//!   boundary; unshifted Newton steps when the reduced Hessian allows them.
//! - Diagonal (or user-supplied) preconditioning of the subspace expansion, with
//!   a Jacobi-Davidson/MINRES fallback once the expansion stalls.
//! - Stability analysis of converged points and escape from saddle points.
//!   The analysis is also available on its own through [`StabilityCheck`].
//! - Reproducible runs: every random trial vector comes from a per-run seeded
//!   generator.
//!
//! ## Defaults (key settings)
//! - Tolerance on the gradient RMS: 1e-5; starting trust radius: 0.4.
//! - Macro-iterations: 150; micro-iterations: 50; random trial vectors: 1.
//! - Residual reduction factors: 1e-3 (level-shifted) / 1e-4 (Newton).
//! - Stability check on; line search off; Jacobi-Davidson on; seed 42.
//!
//! # Example
//!
//! Minimize a convex quadratic `f(x) = ½ xᵀAx - bᵀx` given only `A·v`.
//!
//! ```
//! use ndarray::{array, Array1};
//! use trust_davidson::{Evaluation, Solution, TrustRegion};
//!
//! let a = array![[4.0, 1.0, 0.0], [1.0, 3.0, 0.5], [0.0, 0.5, 2.0]];
//! let b = array![1.0, -2.0, 0.5];
//! let objective = {
//!     let (a, b) = (a.clone(), b.clone());
//!     move |x: &Array1<f64>| 0.5 * x.dot(&a.dot(x)) - b.dot(x)
//! };
//! let evaluate = {
//!     let (a, b) = (a.clone(), b.clone());
//!     let objective = objective.clone();
//!     move |x: &Array1<f64>| {
//!         let a = a.clone();
//!         Evaluation::new(
//!             objective(x),
//!             a.dot(x) - &b,
//!             a.diag().to_owned(),
//!             move |v: &Array1<f64>| a.dot(v),
//!         )
//!     }
//! };
//!
//! let Solution {
//!     final_point,
//!     final_gradient_rms,
//!     stable,
//!     ..
//! } = TrustRegion::new(Array1::zeros(3), evaluate, objective)
//!     .with_tolerance(1e-8)
//!     .run()
//!     .expect("trust-region solve failed");
//!
//! assert!(final_gradient_rms < 1e-8);
//! assert_eq!(stable, Some(true));
//! let residual = a.dot(&final_point) - &b;
//! assert!(residual.dot(&residual).sqrt() < 1e-7);
//! ```

mod context;
mod driver;
mod jacobi_davidson;
pub mod line_search;
mod micro;
pub mod minres;
mod stability;
mod subspace;

use driver::TrustRegionCore;
use ndarray::Array1;
use std::sync::Arc;

pub use stability::{STABILITY_THRESHOLD, StabilityCheck, StabilityReport, StabilitySettings};

/// Hessian-vector product at the point it was evaluated at.
pub type HessianAction = Box<dyn Fn(&Array1<f64>) -> Array1<f64>>;

/// Approximate inverse of `H - shift` applied to a residual.
pub type Preconditioner = Box<dyn Fn(&Array1<f64>, f64) -> Array1<f64>>;

/// Receiver of formatted diagnostic lines.
pub type Sink = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything the solver needs at one point.
pub struct Evaluation {
    pub value: f64,
    pub gradient: Array1<f64>,
    pub hessian_diagonal: Array1<f64>,
    /// Valid only at the point this evaluation belongs to.
    pub hessian_action: HessianAction,
}

impl Evaluation {
    pub fn new<H>(
        value: f64,
        gradient: Array1<f64>,
        hessian_diagonal: Array1<f64>,
        hessian_action: H,
    ) -> Self
    where
        H: Fn(&Array1<f64>) -> Array1<f64> + 'static,
    {
        Self {
            value,
            gradient,
            hessian_diagonal,
            hessian_action: Box::new(hessian_action),
        }
    }
}

/// An error type for clear diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum TrustRegionError {
    #[error("The evaluator returned a vector of length {found}, but the problem has {expected} parameters.")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("A dense symmetric kernel failed: {reason}")]
    LinearAlgebra { reason: String },
    #[error("The reduced subspace degenerated ({reason}). Try more random trial vectors.")]
    DegenerateSubspace { reason: String },
    #[error("The trust radius shrank to {trust_radius:.3e}, below the lower limit of 1e-10.")]
    TrustRadiusUnderflow { trust_radius: f64 },
    #[error(
        "No point with a lower objective was found along the negative-curvature direction (eigenvalue {eigenvalue:.6e})."
    )]
    EscapeFailed { eigenvalue: f64 },
    #[error("MINRES did not converge within {iterations} iterations.")]
    MinresIterationLimit { iterations: usize },
    #[error("The objective or gradient was NaN or infinite at macro-iteration {iteration}.")]
    NonFiniteGradient { iteration: usize },
    #[error("Maximum number of macro-iterations reached without converging. The last iterate is returned.")]
    MaxIterationsReached {
        /// The state after the final macro-iteration.
        last_solution: Box<Solution>,
    },
}

/// A summary of a successful optimization run.
///
/// For non-convex objectives the stability flag only certifies the final point
/// against the lowest eigenvalue estimate; it is not a global guarantee.
#[derive(Debug, Clone)]
pub struct Solution {
    pub final_point: Array1<f64>,
    pub final_value: f64,
    /// `‖g‖ / sqrt(n)` at the final point.
    pub final_gradient_rms: f64,
    /// Macro-iterations performed, rejected steps and saddle escapes included.
    pub iterations: usize,
    pub hessian_actions: usize,
    /// Accepted steps plus saddle escapes.
    pub parameter_updates: usize,
    pub trust_radius: f64,
    /// Outcome of the last stability analysis; `None` if none ran.
    pub stable: Option<bool>,
    pub saddle_escapes: usize,
}

/// A configurable trust-region solver.
pub struct TrustRegion<EvalFn, ObjFn> {
    core: TrustRegionCore,
    evaluate: EvalFn,
    objective: ObjFn,
}

impl<EvalFn, ObjFn> TrustRegion<EvalFn, ObjFn>
where
    EvalFn: FnMut(&Array1<f64>) -> Evaluation,
    ObjFn: FnMut(&Array1<f64>) -> f64,
{
    /// Creates a new solver.
    ///
    /// # Arguments
    /// * `x0` - The starting point.
    /// * `evaluate` - Returns value, gradient, Hessian diagonal and Hessian action at a point.
    /// * `objective` - Value only; used by the ratio test and the line searches.
    pub fn new(x0: Array1<f64>, evaluate: EvalFn, objective: ObjFn) -> Self {
        Self {
            core: TrustRegionCore::new(x0),
            evaluate,
            objective,
        }
    }

    /// Sets the convergence tolerance on the gradient RMS (default: 1e-5).
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.core.tolerance = tolerance.max(f64::EPSILON);
        self
    }

    /// Sets the starting trust radius (default: 0.4).
    pub fn with_start_trust_radius(mut self, trust_radius: f64) -> Self {
        if trust_radius.is_finite() && trust_radius > 0.0 {
            self.core.start_trust_radius = trust_radius;
        }
        self
    }

    /// Sets the maximum number of macro-iterations (default: 150).
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.core.max_macro_iterations = max_iterations.max(1);
        self
    }

    /// Sets the maximum number of micro-iterations per subproblem (default: 50).
    pub fn with_max_micro_iterations(mut self, max_iterations: usize) -> Self {
        self.core.micro.max_iterations = max_iterations.max(1);
        self
    }

    /// Random vectors added to the gradient in the starting subspace (default: 1).
    /// Never more than half the number of parameters are used.
    pub fn with_random_trial_vectors(mut self, count: usize) -> Self {
        self.core.micro.n_random_trial_vectors = count;
        self
    }

    /// Residual reduction required of a level-shifted step, relative to the
    /// gradient norm (default: 1e-3).
    pub fn with_global_reduction_factor(mut self, factor: f64) -> Self {
        self.core.micro.global_red_factor = factor.clamp(f64::EPSILON, 1.0);
        self
    }

    /// Residual reduction required of a Newton step (default: 1e-4).
    pub fn with_local_reduction_factor(mut self, factor: f64) -> Self {
        self.core.micro.local_red_factor = factor.clamp(f64::EPSILON, 1.0);
        self
    }

    /// Set the RNG seed used for random trial vectors (for reproducibility).
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.core.seed = seed;
        self
    }

    /// Diagnostic verbosity (default: 0). Above 2 a progress line is emitted
    /// per macro-iteration; above 3 inner-solver details follow.
    pub fn with_verbosity(mut self, verbosity: usize) -> Self {
        self.core.verbosity = verbosity;
        self
    }

    /// Check converged points for negative curvature (default: true). The
    /// starting point is checked regardless when it is already converged.
    pub fn with_stability_check(mut self, enable: bool) -> Self {
        self.core.stability_check = enable;
        self
    }

    /// Refine accepted steps with a bracketing line search (default: false).
    pub fn with_line_search(mut self, enable: bool) -> Self {
        self.core.line_search = enable;
        self
    }

    /// Fall back to Jacobi-Davidson corrections when the subspace expansion
    /// stalls (default: true).
    pub fn with_jacobi_davidson(mut self, enable: bool) -> Self {
        self.core.micro.jacobi_davidson = enable;
        self
    }

    /// Replaces the default diagonal preconditioner `r / (diag(H) - shift)`.
    pub fn with_preconditioner<P>(mut self, preconditioner: P) -> Self
    where
        P: Fn(&Array1<f64>, f64) -> Array1<f64> + 'static,
    {
        self.core.preconditioner = Some(Box::new(preconditioner));
        self
    }

    /// Receives progress lines instead of the `log` facade.
    pub fn with_output_sink(mut self, sink: Sink) -> Self {
        self.core.output = Some(sink);
        self
    }

    /// Receives warnings and errors instead of the `log` facade.
    pub fn with_diagnostic_sink(mut self, sink: Sink) -> Self {
        self.core.diagnostics = Some(sink);
        self
    }

    /// Replaces all stability-analysis settings at once.
    pub fn with_stability_settings(mut self, settings: StabilitySettings) -> Self {
        self.core.stability = settings;
        self
    }

    /// Residual tolerance of the stability analysis (default: 1e-4).
    pub fn with_stability_tolerance(mut self, tolerance: f64) -> Self {
        self.core.stability.tolerance = tolerance.max(f64::EPSILON);
        self
    }

    /// Iteration cap of the stability analysis (default: 100).
    pub fn with_stability_max_iterations(mut self, max_iterations: usize) -> Self {
        self.core.stability.max_iterations = max_iterations.max(1);
        self
    }

    /// Random starting vectors of the stability analysis (default: 20).
    pub fn with_stability_random_trial_vectors(mut self, count: usize) -> Self {
        self.core.stability.n_random_trial_vectors = count;
        self
    }

    /// Executes the trust-region algorithm.
    pub fn run(&mut self) -> Result<Solution, TrustRegionError> {
        self.core.run(&mut self.evaluate, &mut self.objective)
    }
}
