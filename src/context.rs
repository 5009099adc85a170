//! Run-scoped state threaded through every level of one solver invocation.
//!
//! A fresh [`RunContext`] is built at the start of each top-level call and torn
//! down at the end, so counters and the random stream never leak between runs.

use crate::Sink;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Routes diagnostics either to user sinks or to the `log` facade.
#[derive(Clone, Default)]
pub(crate) struct Reporter {
    verbosity: usize,
    output: Option<Sink>,
    diagnostics: Option<Sink>,
}

impl Reporter {
    pub(crate) fn new(verbosity: usize, output: Option<Sink>, diagnostics: Option<Sink>) -> Self {
        Self {
            verbosity,
            output,
            diagnostics,
        }
    }

    pub(crate) fn verbosity(&self) -> usize {
        self.verbosity
    }

    /// Progress lines, emitted at verbosity > 2.
    pub(crate) fn progress(&self, message: &str) {
        if self.verbosity <= 2 {
            return;
        }
        match &self.output {
            Some(sink) => sink(message),
            None => log::info!("{message}"),
        }
    }

    /// Inner-solver chatter, emitted at verbosity > 3.
    pub(crate) fn detail(&self, message: &str) {
        if self.verbosity <= 3 {
            return;
        }
        match &self.output {
            Some(sink) => sink(message),
            None => log::debug!("{message}"),
        }
    }

    pub(crate) fn warn(&self, message: &str) {
        match &self.diagnostics {
            Some(sink) => sink(message),
            None => log::warn!("{message}"),
        }
    }

    pub(crate) fn error(&self, message: &str) {
        match &self.diagnostics {
            Some(sink) => sink(message),
            None => log::error!("{message}"),
        }
    }
}

/// Counters accumulated over one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RunCounters {
    pub(crate) hessian_actions: usize,
    pub(crate) macro_iterations: usize,
    pub(crate) parameter_updates: usize,
}

pub(crate) struct RunContext {
    rng: StdRng,
    counters: RunCounters,
    pub(crate) reporter: Reporter,
}

impl RunContext {
    pub(crate) fn new(seed: u64, reporter: Reporter) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            counters: RunCounters::default(),
            reporter,
        }
    }

    /// Applies a Hessian-vector product and counts it.
    pub(crate) fn apply_hessian(
        &mut self,
        hessian_action: &dyn Fn(&Array1<f64>) -> Array1<f64>,
        vector: &Array1<f64>,
    ) -> Array1<f64> {
        self.counters.hessian_actions += 1;
        hessian_action(vector)
    }

    pub(crate) fn count_hessian_actions(&mut self, n: usize) {
        self.counters.hessian_actions += n;
    }

    /// Uniform random trial vector with entries in [-1, 1).
    pub(crate) fn random_vector(&mut self, n: usize) -> Array1<f64> {
        Array1::from_shape_fn(n, |_| self.rng.gen_range(-1.0..1.0))
    }

    pub(crate) fn set_macro_iteration(&mut self, iteration: usize) {
        self.counters.macro_iterations = iteration;
    }

    pub(crate) fn record_parameter_update(&mut self) {
        self.counters.parameter_updates += 1;
    }

    pub(crate) fn counters(&self) -> RunCounters {
        self.counters
    }

    /// Returns the accumulated counters and zeroes them.
    pub(crate) fn finish(&mut self) -> RunCounters {
        std::mem::take(&mut self.counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn same_seed_gives_same_vectors() {
        let mut a = RunContext::new(42, Reporter::default());
        let mut b = RunContext::new(42, Reporter::default());
        assert_eq!(a.random_vector(16), b.random_vector(16));
        let v = a.random_vector(1000);
        assert!(v.iter().all(|x| (-1.0..1.0).contains(x)));
    }

    #[test]
    fn finish_resets_counters() {
        let mut ctx = RunContext::new(1, Reporter::default());
        let identity = |v: &Array1<f64>| v.clone();
        ctx.apply_hessian(&identity, &Array1::ones(3));
        ctx.count_hessian_actions(2);
        ctx.set_macro_iteration(4);
        let counters = ctx.finish();
        assert_eq!(counters.hessian_actions, 3);
        assert_eq!(counters.macro_iterations, 4);
        assert_eq!(ctx.counters(), RunCounters::default());
    }

    #[test]
    fn progress_respects_verbosity() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let captured = Arc::clone(&lines);
        let sink: Sink = Arc::new(move |line: &str| {
            captured.lock().unwrap().push(line.to_string());
        });
        let quiet = Reporter::new(2, Some(sink.clone()), None);
        quiet.progress("hidden");
        let chatty = Reporter::new(4, Some(sink), None);
        chatty.progress("shown");
        chatty.detail("detail");
        assert_eq!(*lines.lock().unwrap(), vec!["shown", "detail"]);
    }
}
