//! One-dimensional minimization along a fixed direction.
//!
//! [`bracket_minimize`] first walks downhill from two starting abscissae until
//! a minimum is enclosed (golden-ratio expansion with parabolic extrapolation),
//! then shrinks the bracket with Brent's golden-section/parabolic method.
//! [`logarithmic_scan`] is the coarse search used to leave a saddle point.

/// Golden-ratio growth factor for bracket expansion.
const GOLD: f64 = 1.618_034;
/// Largest parabolic extrapolation, in units of the current bracket.
const GROW_LIMIT: f64 = 100.0;
const TINY: f64 = 1e-20;
/// Golden-section fraction (2 - golden ratio).
const CGOLD: f64 = 0.381_966_0;
const MAX_BRACKET_STEPS: usize = 50;
const MAX_BRENT_ITERATIONS: usize = 100;

/// Result of a line minimization.
#[derive(Debug, Clone, Copy)]
pub struct LineMinimum {
    /// Abscissa of the best point found.
    pub position: f64,
    /// Function value at `position`.
    pub value: f64,
    /// Number of function evaluations spent.
    pub evaluations: usize,
    /// False when no minimum was enclosed within the expansion budget or the
    /// Brent iterations ran out; `position` is then the best point seen.
    pub converged: bool,
}

struct Counted<F> {
    f: F,
    evaluations: usize,
}

impl<F: FnMut(f64) -> f64> Counted<F> {
    fn eval(&mut self, t: f64) -> f64 {
        self.evaluations += 1;
        let value = (self.f)(t);
        // Treat non-finite values as a wall.
        if value.is_finite() { value } else { f64::INFINITY }
    }
}

#[inline]
fn sign(magnitude: f64, of: f64) -> f64 {
    if of >= 0.0 { magnitude.abs() } else { -magnitude.abs() }
}

/// Minimizes `f` starting from the abscissae `a` and `b`.
///
/// `tolerance` is the relative precision on the abscissa; values below
/// `sqrt(eps)` gain nothing and are raised to it.
pub fn bracket_minimize<F>(f: F, a: f64, b: f64, tolerance: f64) -> LineMinimum
where
    F: FnMut(f64) -> f64,
{
    let mut f = Counted { f, evaluations: 0 };
    let ((ax, bx, cx, fb), bracketed) = bracket(&mut f, a, b);
    let tolerance = tolerance.max(f64::EPSILON.sqrt());
    let (position, value, refined) = brent(&mut f, ax, bx, cx, fb, tolerance);
    LineMinimum {
        position,
        value,
        evaluations: f.evaluations,
        converged: bracketed && refined,
    }
}

type Bracket = (f64, f64, f64, f64);

/// Returns `(a, b, c, f(b))` with `f(b)` no larger than the outer values,
/// or the best point seen (flagged false) once the expansion budget runs out.
fn bracket<F: FnMut(f64) -> f64>(f: &mut Counted<F>, a: f64, b: f64) -> (Bracket, bool) {
    let (mut a, mut b) = (a, b);
    let mut fa = f.eval(a);
    let mut fb = f.eval(b);
    if fb > fa {
        std::mem::swap(&mut a, &mut b);
        std::mem::swap(&mut fa, &mut fb);
    }
    let mut c = b + GOLD * (b - a);
    let mut fc = f.eval(c);
    let mut steps = 0;
    while fb > fc {
        steps += 1;
        if steps > MAX_BRACKET_STEPS {
            return ((b, c, c, fc), false);
        }
        let r = (b - a) * (fb - fc);
        let q = (b - c) * (fb - fa);
        let mut u = b - ((b - c) * q - (b - a) * r) / (2.0 * sign((q - r).abs().max(TINY), q - r));
        let ulim = b + GROW_LIMIT * (c - b);
        let mut fu;
        if (b - u) * (u - c) > 0.0 {
            fu = f.eval(u);
            if fu < fc {
                return ((b, u, c, fu), true);
            } else if fu > fb {
                return ((a, b, u, fb), true);
            }
            u = c + GOLD * (c - b);
            fu = f.eval(u);
        } else if (c - u) * (u - ulim) > 0.0 {
            fu = f.eval(u);
            if fu < fc {
                b = c;
                c = u;
                u = c + GOLD * (c - b);
                fb = fc;
                fc = fu;
                fu = f.eval(u);
            }
        } else if (u - ulim) * (ulim - c) >= 0.0 {
            u = ulim;
            fu = f.eval(u);
        } else {
            u = c + GOLD * (c - b);
            fu = f.eval(u);
        }
        a = b;
        b = c;
        c = u;
        fa = fb;
        fb = fc;
        fc = fu;
    }
    ((a, b, c, fb), true)
}

fn brent<F: FnMut(f64) -> f64>(
    f: &mut Counted<F>,
    ax: f64,
    bx: f64,
    cx: f64,
    fbx: f64,
    tolerance: f64,
) -> (f64, f64, bool) {
    let mut a = ax.min(cx);
    let mut b = ax.max(cx);
    let (mut x, mut w, mut v) = (bx, bx, bx);
    let (mut fx, mut fw, mut fv) = (fbx, fbx, fbx);
    let mut d: f64 = 0.0;
    let mut e: f64 = 0.0;
    for _ in 0..MAX_BRENT_ITERATIONS {
        let xm = 0.5 * (a + b);
        let tol1 = tolerance * x.abs() + 1e-10 * tolerance;
        let tol2 = 2.0 * tol1;
        if (x - xm).abs() <= tol2 - 0.5 * (b - a) {
            return (x, fx, true);
        }
        let mut golden = true;
        if e.abs() > tol1 {
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let etemp = e;
            e = d;
            if !(p.abs() >= (0.5 * q * etemp).abs() || p <= q * (a - x) || p >= q * (b - x)) {
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = sign(tol1, xm - x);
                }
                golden = false;
            }
        }
        if golden {
            e = if x >= xm { a - x } else { b - x };
            d = CGOLD * e;
        }
        let u = if d.abs() >= tol1 { x + d } else { x + sign(tol1, d) };
        let fu = f.eval(u);
        if fu <= fx {
            if u >= x {
                a = x;
            } else {
                b = x;
            }
            v = w;
            w = x;
            x = u;
            fv = fw;
            fw = fx;
            fx = fu;
        } else {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                v = w;
                w = u;
                fv = fw;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        }
    }
    (x, fx, false)
}

/// Probes `f` at `10^(-(i-1)/(points-1) * decades)` for `i = 1..=points`,
/// largest scale first, and returns the first scale whose value is below
/// `reference` together with that value.
pub fn logarithmic_scan<F>(mut f: F, reference: f64, points: usize, decades: f64) -> Option<(f64, f64)>
where
    F: FnMut(f64) -> f64,
{
    let points = points.max(2);
    (0..points).find_map(|i| {
        let scale = 10f64.powf(-(i as f64) / ((points - 1) as f64) * decades);
        let value = f(scale);
        (value.is_finite() && value < reference).then_some((scale, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    #[test]
    fn finds_parabola_minimum() {
        let res = bracket_minimize(|t| (t - 2.5).powi(2) + 1.0, 0.0, 1.0, 1e-10);
        assert_that!(&res.position).is_close_to(2.5, 1e-6);
        assert_that!(&res.value).is_close_to(1.0, 1e-10);
        assert!(res.evaluations > 3);
        assert!(res.converged);
    }

    #[test]
    fn finds_minimum_behind_the_start() {
        let res = bracket_minimize(|t| (t + 0.3).powi(4) + (t + 0.3).powi(2), 0.0, 1.0, 1e-10);
        assert_that!(&res.position).is_close_to(-0.3, 1e-5);
    }

    #[test]
    fn non_smooth_but_unimodal() {
        let res = bracket_minimize(|t| (t - 0.7).abs(), 0.0, 1.0, 1e-10);
        assert_that!(&res.position).is_close_to(0.7, 1e-6);
    }

    #[test]
    fn unbounded_function_returns_best_seen() {
        let res = bracket_minimize(|t| -t, 0.0, 1.0, 1e-8);
        assert!(res.position > 1.0);
        assert!(res.value < -1.0);
        assert!(!res.converged);
    }

    #[test]
    fn scan_returns_first_improving_scale() {
        // Only steps shorter than 0.05 improve on the reference.
        let hit = logarithmic_scan(|s| if s < 0.05 { -s } else { 1.0 }, 0.0, 21, 10.0);
        let (scale, value) = hit.unwrap();
        assert_that!(&scale).is_close_to(10f64.powf(-1.5), 1e-12);
        assert_that!(&value).is_less_than(0.0);
    }

    #[test]
    fn scan_reports_exhaustion() {
        let mut calls = 0;
        let hit = logarithmic_scan(
            |_| {
                calls += 1;
                1.0
            },
            0.0,
            21,
            10.0,
        );
        assert!(hit.is_none());
        assert_eq!(calls, 21);
    }
}
