//! Macro trust-region loop.

use crate::context::{Reporter, RunContext};
use crate::line_search::{bracket_minimize, logarithmic_scan};
use crate::micro::{self, LocalModel, MicroSettings};
use crate::stability::{self, StabilitySettings};
use crate::subspace::norm;
use crate::{Evaluation, Preconditioner, Sink, Solution, TrustRegionError};
use ndarray::Array1;
use std::f64::consts::FRAC_PI_4;

const SHRINK_FACTOR: f64 = 0.7;
const GROW_FACTOR: f64 = 1.2;
const MIN_TRUST_RADIUS: f64 = 1e-10;
/// Steps moving any single parameter further than this are rejected.
const MAX_PARAMETER_STEP: f64 = FRAC_PI_4;
const ESCAPE_SCAN_POINTS: usize = 21;
const ESCAPE_SCAN_DECADES: f64 = 10.0;
const LINE_SEARCH_TOLERANCE: f64 = 1e-8;

/// Ratio-test outcome for a trial step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepVerdict {
    Reject,
    AcceptShrink,
    Accept,
    AcceptGrow,
}

impl StepVerdict {
    /// Classifies `actual / predicted` reduction. NaN is rejected.
    pub(crate) fn from_ratio(ratio: f64) -> Self {
        if ratio.is_nan() || ratio < 0.0 {
            Self::Reject
        } else if ratio < 0.25 {
            Self::AcceptShrink
        } else if ratio < 0.75 {
            Self::Accept
        } else {
            Self::AcceptGrow
        }
    }

    pub(crate) fn radius_factor(self) -> f64 {
        match self {
            Self::Reject | Self::AcceptShrink => SHRINK_FACTOR,
            Self::Accept => 1.0,
            Self::AcceptGrow => GROW_FACTOR,
        }
    }

    pub(crate) fn accepts(self) -> bool {
        !matches!(self, Self::Reject)
    }
}

pub(crate) fn progress_line(
    iteration: usize,
    value: f64,
    gradient_rms: f64,
    level_shift: f64,
    micro_iterations: usize,
    trust_radius: f64,
    step_norm: f64,
) -> String {
    format!(
        "{iteration:>6} {value:>21.13e} {gradient_rms:>11.2e} {level_shift:>11.2e} {micro_iterations:>7} {trust_radius:>11.2e} {step_norm:>11.2e}"
    )
}

/// Largest line-search scale keeping the step inside the trust region and
/// every parameter move within `MAX_PARAMETER_STEP`.
pub(crate) fn line_search_scale_limit(step: &Array1<f64>, trust_radius: f64) -> f64 {
    let step_norm = norm(step);
    let largest_component = step.iter().fold(0.0f64, |m, s| m.max(s.abs()));
    if step_norm == 0.0 {
        return 1.0;
    }
    (trust_radius / step_norm).min(MAX_PARAMETER_STEP / largest_component)
}

const PROGRESS_HEADER: &str =
    "  iter             objective    grad rms   lvl shift   micro   trust rad   step norm";

/// Frozen configuration of one solver.
pub(crate) struct TrustRegionCore {
    pub(crate) x0: Array1<f64>,
    pub(crate) tolerance: f64,
    pub(crate) start_trust_radius: f64,
    pub(crate) max_macro_iterations: usize,
    pub(crate) micro: MicroSettings,
    pub(crate) stability: StabilitySettings,
    pub(crate) stability_check: bool,
    pub(crate) line_search: bool,
    pub(crate) seed: u64,
    pub(crate) verbosity: usize,
    pub(crate) preconditioner: Option<Preconditioner>,
    pub(crate) output: Option<Sink>,
    pub(crate) diagnostics: Option<Sink>,
}

/// Mutable iterate state of one run.
struct Iterate {
    x: Array1<f64>,
    value: f64,
    gradient_rms: f64,
    trust_radius: f64,
    stable: Option<bool>,
    saddle_escapes: usize,
}

impl TrustRegionCore {
    pub(crate) fn new(x0: Array1<f64>) -> Self {
        Self {
            x0,
            tolerance: 1e-5,
            start_trust_radius: 0.4,
            max_macro_iterations: 150,
            micro: MicroSettings {
                max_iterations: 50,
                n_random_trial_vectors: 1,
                global_red_factor: 1e-3,
                local_red_factor: 1e-4,
                jacobi_davidson: true,
                jacobi_davidson_start: micro::JACOBI_DAVIDSON_START,
            },
            stability: StabilitySettings::default(),
            stability_check: true,
            line_search: false,
            seed: 42,
            verbosity: 0,
            preconditioner: None,
            output: None,
            diagnostics: None,
        }
    }

    /// Runs one invocation with a fresh context; counters and the random
    /// stream are rebuilt here and discarded on return.
    pub(crate) fn run<EvalFn, ObjFn>(
        &self,
        evaluate: &mut EvalFn,
        objective: &mut ObjFn,
    ) -> Result<Solution, TrustRegionError>
    where
        EvalFn: FnMut(&Array1<f64>) -> Evaluation,
        ObjFn: FnMut(&Array1<f64>) -> f64,
    {
        let reporter = Reporter::new(self.verbosity, self.output.clone(), self.diagnostics.clone());
        let mut ctx = RunContext::new(self.seed, reporter);
        let result = self.iterate(evaluate, objective, &mut ctx);
        let counters = ctx.finish();
        match &result {
            Ok(solution) => ctx.reporter.progress(&format!(
                "[TR] converged after {} macro-iterations: {} Hessian actions, {} parameter updates",
                solution.iterations, counters.hessian_actions, counters.parameter_updates
            )),
            Err(e) => ctx.reporter.error(&format!("[TR] {e}")),
        }
        result
    }

    fn iterate<EvalFn, ObjFn>(
        &self,
        evaluate: &mut EvalFn,
        objective: &mut ObjFn,
        ctx: &mut RunContext,
    ) -> Result<Solution, TrustRegionError>
    where
        EvalFn: FnMut(&Array1<f64>) -> Evaluation,
        ObjFn: FnMut(&Array1<f64>) -> f64,
    {
        let n = self.x0.len();
        let mut state = Iterate {
            x: self.x0.clone(),
            value: f64::NAN,
            gradient_rms: f64::NAN,
            trust_radius: self.start_trust_radius,
            stable: None,
            saddle_escapes: 0,
        };
        // Kept across a rejected step; the point did not move.
        let mut pending: Option<Evaluation> = None;
        ctx.reporter.progress(PROGRESS_HEADER);

        for imacro in 1..=self.max_macro_iterations {
            ctx.set_macro_iteration(imacro);
            let eval = match pending.take() {
                Some(eval) => eval,
                None => {
                    let eval = evaluate(&state.x);
                    if imacro == 1 {
                        for found in [eval.gradient.len(), eval.hessian_diagonal.len()] {
                            if found != n {
                                return Err(TrustRegionError::DimensionMismatch { expected: n, found });
                            }
                        }
                    }
                    if !eval.value.is_finite() || eval.gradient.iter().any(|g| !g.is_finite()) {
                        return Err(TrustRegionError::NonFiniteGradient { iteration: imacro });
                    }
                    eval
                }
            };
            state.value = eval.value;
            state.gradient_rms = norm(&eval.gradient) / (n.max(1) as f64).sqrt();

            if state.gradient_rms < self.tolerance {
                ctx.reporter.progress(&progress_line(
                    imacro,
                    state.value,
                    state.gradient_rms,
                    0.0,
                    0,
                    state.trust_radius,
                    0.0,
                ));
                // The starting point may be a saddle even with checks disabled.
                if !(self.stability_check || imacro == 1) {
                    return Ok(self.solution(state, ctx));
                }
                let report = stability::analyze(
                    &eval.gradient,
                    &eval.hessian_diagonal,
                    eval.hessian_action.as_ref(),
                    self.preconditioner.as_deref(),
                    &self.stability,
                    ctx,
                )?;
                state.stable = Some(report.stable);
                let Some(mut direction) = report.direction else {
                    return Ok(self.solution(state, ctx));
                };
                if direction.dot(&eval.gradient) > 0.0 {
                    direction.mapv_inplace(|d| -d);
                }
                ctx.reporter.warn(&format!(
                    "[TR] saddle point at iteration {imacro}: lowest eigenvalue {:.6e}",
                    report.eigenvalue
                ));
                let x = &state.x;
                let found = logarithmic_scan(
                    |scale| objective(&(x + &(&direction * scale))),
                    state.value,
                    ESCAPE_SCAN_POINTS,
                    ESCAPE_SCAN_DECADES,
                );
                let Some((scale, value)) = found else {
                    return Err(TrustRegionError::EscapeFailed {
                        eigenvalue: report.eigenvalue,
                    });
                };
                ctx.reporter.progress(&format!(
                    "[TR] escaping along negative curvature: scale {scale:.3e}, objective {value:.13e}"
                ));
                state.x.scaled_add(scale, &direction);
                state.saddle_escapes += 1;
                ctx.record_parameter_update();
                continue;
            }

            let model = LocalModel {
                gradient: &eval.gradient,
                hessian_diagonal: &eval.hessian_diagonal,
                hessian_action: eval.hessian_action.as_ref(),
                preconditioner: self.preconditioner.as_deref(),
            };
            let outcome = micro::solve_subproblem(&model, state.trust_radius, &self.micro, ctx)?;
            let step_norm = norm(&outcome.step);
            ctx.reporter.detail(&format!(
                "[TR] micro-solver: bracketed {}, converged {}, {} Jacobi-Davidson corrections",
                outcome.bracketed, outcome.converged, outcome.jacobi_davidson_iterations
            ));
            if !outcome.bracketed {
                ctx.reporter.warn(&format!(
                    "[TR] trust radius {:.3e} not bracketed by the level shift at iteration {imacro}",
                    state.trust_radius
                ));
            }
            ctx.reporter.progress(&progress_line(
                imacro,
                state.value,
                state.gradient_rms,
                outcome.level_shift,
                outcome.iterations,
                state.trust_radius,
                step_norm,
            ));

            let largest_component = outcome.step.iter().fold(0.0f64, |m, s| m.max(s.abs()));
            let verdict = if !outcome.converged || largest_component > MAX_PARAMETER_STEP {
                StepVerdict::Reject
            } else {
                let trial = &state.x + &outcome.step;
                let trial_value = objective(&trial);
                let predicted =
                    eval.gradient.dot(&outcome.step) + 0.5 * outcome.step.dot(&outcome.hessian_step);
                StepVerdict::from_ratio((trial_value - state.value) / predicted)
            };

            state.trust_radius *= verdict.radius_factor();
            if state.trust_radius < MIN_TRUST_RADIUS {
                return Err(TrustRegionError::TrustRadiusUnderflow {
                    trust_radius: state.trust_radius,
                });
            }
            if !verdict.accepts() {
                if ctx.reporter.verbosity() > 1 {
                    ctx.reporter.warn(&format!(
                        "[TR] step rejected at iteration {imacro}; trust radius now {:.3e}",
                        state.trust_radius
                    ));
                }
                pending = Some(eval);
                continue;
            }

            let mut step = outcome.step;
            if self.line_search {
                let x = &state.x;
                let line = bracket_minimize(
                    |t| objective(&(x + &(&step * t))),
                    0.0,
                    1.0,
                    LINE_SEARCH_TOLERANCE,
                );
                if !line.converged {
                    ctx.reporter.warn(&format!(
                        "[LineSearch] no converged minimum along the step at iteration {imacro}; using the best point seen"
                    ));
                }
                let limit = line_search_scale_limit(&step, state.trust_radius);
                let scale = if line.position.is_finite() {
                    line.position.clamp(0.0, limit)
                } else {
                    1.0
                };
                ctx.reporter.detail(&format!(
                    "[TR] line search: scale {scale:.6e} (unclamped {:.6e}) after {} evaluations",
                    line.position, line.evaluations
                ));
                step *= scale;
            }
            state.x += &step;
            ctx.record_parameter_update();
        }

        Err(TrustRegionError::MaxIterationsReached {
            last_solution: Box::new(self.solution(state, ctx)),
        })
    }

    fn solution(&self, state: Iterate, ctx: &RunContext) -> Solution {
        let counters = ctx.counters();
        Solution {
            final_point: state.x,
            final_value: state.value,
            final_gradient_rms: state.gradient_rms,
            iterations: counters.macro_iterations,
            hessian_actions: counters.hessian_actions,
            parameter_updates: counters.parameter_updates,
            trust_radius: state.trust_radius,
            stable: state.stable,
            saddle_escapes: state.saddle_escapes,
        }
    }
}
