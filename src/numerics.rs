//! Bounded numerical searches used by the regime solvers
//!
//! - Brent's bounded scalar minimization (golden section with parabolic steps)
//! - Nelder-Mead simplex with every trial point clipped into a box
//! - Brent's bracketed root finder
//! - Trapezoidal quadrature on arbitrary grids
//!
//! Every routine takes a fallible objective so evaluator failures propagate
//! with `?`, and every loop is capped by [`Tolerances::max_iter`].
//!
//! References:
//! - Brent, R. P. "Algorithms for Minimization without Derivatives" (1973)
//! - Lagarias, J. C., et al. "Convergence Properties of the Nelder-Mead
//!   Simplex Method in Low Dimensions" (1998)

use thiserror::Error;

/// (3 - sqrt(5)) / 2
const GOLDEN: f64 = 0.381_966_011_250_105_1;

/// Stopping criteria shared by all searches
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tolerances {
    /// Absolute tolerance on the abscissa
    pub xtol: f64,
    /// Relative tolerance on the objective spread (simplex only)
    pub ftol: f64,
    /// Hard cap on iterations
    pub max_iter: usize,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            xtol: 1e-4,
            ftol: 1e-8,
            max_iter: 200,
        }
    }
}

/// Best point found by a minimization
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Minimum<X> {
    pub x: X,
    pub fx: f64,
    pub iterations: usize,
    /// False when the iteration cap was hit before the tolerance was met
    pub converged: bool,
}

/// Result of a bracketed root search
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Root {
    pub x: f64,
    pub fx: f64,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Debug, Error)]
pub enum RootError<E> {
    /// f(lo) and f(hi) have the same sign, so the bracket holds no root.
    #[error("no sign change on [{lo}, {hi}]: f(lo)={f_lo:e}, f(hi)={f_hi:e}")]
    NoSignChange {
        lo: f64,
        hi: f64,
        f_lo: f64,
        f_hi: f64,
    },
    #[error("objective failed: {0}")]
    Objective(#[source] E),
}

/// np.sign(v) + (v == 0)
fn step_sign(v: f64) -> f64 {
    if v >= 0.0 {
        1.0
    } else {
        -1.0
    }
}

/// Minimize a scalar function on `[lo, hi]` with Brent's bounded method.
///
/// The objective is only ever evaluated inside the closed interval.
pub fn minimize_bounded<F, E>(
    mut f: F,
    bounds: (f64, f64),
    tol: &Tolerances,
) -> Result<Minimum<f64>, E>
where
    F: FnMut(f64) -> Result<f64, E>,
{
    let (lower, upper) = bounds;
    if upper - lower <= 0.0 {
        let fx = f(lower)?;
        return Ok(Minimum {
            x: lower,
            fx,
            iterations: 0,
            converged: true,
        });
    }

    let sqrt_eps = f64::EPSILON.sqrt();
    let (mut a, mut b) = (lower, upper);
    let mut fulc = a + GOLDEN * (b - a);
    let mut nfc = fulc;
    let mut xf = fulc;
    let mut rat = 0.0_f64;
    let mut e = 0.0_f64;

    let mut fx = f(xf)?;
    let mut ffulc = fx;
    let mut fnfc = fx;

    let mut xm = 0.5 * (a + b);
    let mut tol1 = sqrt_eps * xf.abs() + tol.xtol / 3.0;
    let mut tol2 = 2.0 * tol1;

    let mut iterations = 0;
    let mut converged = true;

    while (xf - xm).abs() > tol2 - 0.5 * (b - a) {
        if iterations >= tol.max_iter {
            converged = false;
            break;
        }
        iterations += 1;

        let mut golden = true;
        if e.abs() > tol1 {
            // Try a parabola through the three best points
            golden = false;
            let mut r = (xf - nfc) * (fx - ffulc);
            let mut q = (xf - fulc) * (fx - fnfc);
            let mut p = (xf - fulc) * q - (xf - nfc) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            r = e;
            e = rat;

            if p.abs() < (0.5 * q * r).abs() && p > q * (a - xf) && p < q * (b - xf) {
                rat = p / q;
                let x = xf + rat;
                if (x - a) < tol2 || (b - x) < tol2 {
                    rat = tol1 * step_sign(xm - xf);
                }
            } else {
                golden = true;
            }
        }

        if golden {
            e = if xf >= xm { a - xf } else { b - xf };
            rat = GOLDEN * e;
        }

        let x = (xf + step_sign(rat) * rat.abs().max(tol1)).clamp(lower, upper);
        let fu = f(x)?;

        if fu <= fx {
            if x >= xf {
                a = xf;
            } else {
                b = xf;
            }
            fulc = nfc;
            ffulc = fnfc;
            nfc = xf;
            fnfc = fx;
            xf = x;
            fx = fu;
        } else {
            if x < xf {
                a = x;
            } else {
                b = x;
            }
            if fu <= fnfc || nfc == xf {
                fulc = nfc;
                ffulc = fnfc;
                nfc = x;
                fnfc = fu;
            } else if fu <= ffulc || fulc == xf || fulc == nfc {
                fulc = x;
                ffulc = fu;
            }
        }

        xm = 0.5 * (a + b);
        tol1 = sqrt_eps * xf.abs() + tol.xtol / 3.0;
        tol2 = 2.0 * tol1;
    }

    Ok(Minimum {
        x: xf,
        fx,
        iterations,
        converged,
    })
}

fn clip<const N: usize>(mut x: [f64; N], lower: &[f64; N], upper: &[f64; N]) -> [f64; N] {
    for i in 0..N {
        x[i] = x[i].max(lower[i]).min(upper[i]);
    }
    x
}

/// a + s * (b - a), componentwise
fn lerp<const N: usize>(a: &[f64; N], b: &[f64; N], s: f64) -> [f64; N] {
    let mut out = [0.0; N];
    for i in 0..N {
        out[i] = a[i] + s * (b[i] - a[i]);
    }
    out
}

/// Minimize `f` over the box `[lower, upper]` with the Nelder-Mead simplex.
///
/// Trial points leaving the box are clipped back onto its faces, so the
/// objective never sees an out-of-bounds point. Convergence requires both
/// the simplex diameter (`xtol`, absolute) and the spread of objective
/// values (`ftol`, relative to the best value) to fall below tolerance.
pub fn nelder_mead_bounded<F, E, const N: usize>(
    mut f: F,
    x0: [f64; N],
    lower: [f64; N],
    upper: [f64; N],
    tol: &Tolerances,
) -> Result<Minimum<[f64; N]>, E>
where
    F: FnMut(&[f64; N]) -> Result<f64, E>,
{
    const RHO: f64 = 1.0;
    const CHI: f64 = 2.0;
    const PSI: f64 = 0.5;
    const SIGMA: f64 = 0.5;
    const NONZDELT: f64 = 0.05;
    const ZDELT: f64 = 0.000_25;

    let start = clip(x0, &lower, &upper);

    // Initial simplex: perturb one coordinate per vertex, reflect off the
    // upper face if that overshoots, then clip.
    let mut sim: Vec<[f64; N]> = Vec::with_capacity(N + 1);
    sim.push(start);
    for k in 0..N {
        let mut y = start;
        y[k] = if y[k] != 0.0 {
            (1.0 + NONZDELT) * y[k]
        } else {
            ZDELT
        };
        if y[k] > upper[k] {
            y[k] = 2.0 * upper[k] - y[k];
        }
        sim.push(clip(y, &lower, &upper));
    }

    let mut fsim = Vec::with_capacity(N + 1);
    for vertex in &sim {
        fsim.push(f(vertex)?);
    }
    sort_simplex(&mut sim, &mut fsim);

    let mut iterations = 0;
    let mut converged = false;

    loop {
        let diameter = sim[1..]
            .iter()
            .flat_map(|v| v.iter().zip(sim[0].iter()).map(|(a, b)| (a - b).abs()))
            .fold(0.0_f64, f64::max);
        let spread = fsim[1..]
            .iter()
            .map(|v| (v - fsim[0]).abs())
            .fold(0.0_f64, f64::max);
        if diameter <= tol.xtol && spread <= tol.ftol * fsim[0].abs().max(1.0) {
            converged = true;
            break;
        }
        if iterations >= tol.max_iter {
            break;
        }
        iterations += 1;

        let worst = sim[N];
        let mut xbar = [0.0; N];
        for vertex in &sim[..N] {
            for i in 0..N {
                xbar[i] += vertex[i] / N as f64;
            }
        }

        let xr = clip(lerp(&xbar, &worst, -RHO), &lower, &upper);
        let fxr = f(&xr)?;
        let mut shrink = false;

        if fxr < fsim[0] {
            let xe = clip(lerp(&xbar, &worst, -RHO * CHI), &lower, &upper);
            let fxe = f(&xe)?;
            if fxe < fxr {
                sim[N] = xe;
                fsim[N] = fxe;
            } else {
                sim[N] = xr;
                fsim[N] = fxr;
            }
        } else if fxr < fsim[N - 1] {
            sim[N] = xr;
            fsim[N] = fxr;
        } else if fxr < fsim[N] {
            // Outside contraction
            let xc = clip(lerp(&xbar, &worst, -PSI * RHO), &lower, &upper);
            let fxc = f(&xc)?;
            if fxc <= fxr {
                sim[N] = xc;
                fsim[N] = fxc;
            } else {
                shrink = true;
            }
        } else {
            // Inside contraction
            let xcc = clip(lerp(&xbar, &worst, PSI), &lower, &upper);
            let fxcc = f(&xcc)?;
            if fxcc < fsim[N] {
                sim[N] = xcc;
                fsim[N] = fxcc;
            } else {
                shrink = true;
            }
        }

        if shrink {
            let best = sim[0];
            for j in 1..=N {
                sim[j] = clip(lerp(&best, &sim[j], SIGMA), &lower, &upper);
                fsim[j] = f(&sim[j])?;
            }
        }

        sort_simplex(&mut sim, &mut fsim);
    }

    Ok(Minimum {
        x: sim[0],
        fx: fsim[0],
        iterations,
        converged,
    })
}

/// Order vertices by ascending objective; stable so ties keep their age.
fn sort_simplex<const N: usize>(sim: &mut Vec<[f64; N]>, fsim: &mut Vec<f64>) {
    let mut order: Vec<usize> = (0..fsim.len()).collect();
    order.sort_by(|&a, &b| fsim[a].total_cmp(&fsim[b]));
    *sim = order.iter().map(|&i| sim[i]).collect();
    *fsim = order.iter().map(|&i| fsim[i]).collect();
}

/// Find a root of `f` inside `[lo, hi]` with Brent's method.
///
/// Fails with [`RootError::NoSignChange`] when the endpoint values share a
/// sign; callers decide how to recover. Hitting the iteration cap is not an
/// error: the last iterate is returned with `converged = false`.
pub fn find_root<F, E>(
    mut f: F,
    bracket: (f64, f64),
    tol: &Tolerances,
) -> Result<Root, RootError<E>>
where
    F: FnMut(f64) -> Result<f64, E>,
{
    let (lo, hi) = bracket;
    let rtol = 4.0 * f64::EPSILON;

    let mut xpre = lo;
    let mut xcur = hi;
    let mut fpre = f(xpre).map_err(RootError::Objective)?;
    let mut fcur = f(xcur).map_err(RootError::Objective)?;

    if fpre * fcur > 0.0 || fpre.is_nan() || fcur.is_nan() {
        return Err(RootError::NoSignChange {
            lo,
            hi,
            f_lo: fpre,
            f_hi: fcur,
        });
    }
    if fpre == 0.0 {
        return Ok(Root {
            x: xpre,
            fx: fpre,
            iterations: 0,
            converged: true,
        });
    }
    if fcur == 0.0 {
        return Ok(Root {
            x: xcur,
            fx: fcur,
            iterations: 0,
            converged: true,
        });
    }

    let mut xblk = 0.0;
    let mut fblk = 0.0;
    let mut spre = 0.0;
    let mut scur = 0.0;

    for iterations in 1..=tol.max_iter {
        if fpre != 0.0 && fcur != 0.0 && fpre.is_sign_negative() != fcur.is_sign_negative() {
            xblk = xpre;
            fblk = fpre;
            spre = xcur - xpre;
            scur = spre;
        }
        if fblk.abs() < fcur.abs() {
            xpre = xcur;
            xcur = xblk;
            xblk = xpre;
            fpre = fcur;
            fcur = fblk;
            fblk = fpre;
        }

        let delta = (tol.xtol + rtol * xcur.abs()) / 2.0;
        let sbis = (xblk - xcur) / 2.0;
        if fcur == 0.0 || sbis.abs() < delta {
            return Ok(Root {
                x: xcur,
                fx: fcur,
                iterations,
                converged: true,
            });
        }

        if spre.abs() > delta && fcur.abs() < fpre.abs() {
            let stry = if xpre == xblk {
                // Secant
                -fcur * (xcur - xpre) / (fcur - fpre)
            } else {
                // Inverse quadratic
                let dpre = (fpre - fcur) / (xpre - xcur);
                let dblk = (fblk - fcur) / (xblk - xcur);
                -fcur * (fblk * dblk - fpre * dpre) / (dblk * dpre * (fblk - fpre))
            };
            if 2.0 * stry.abs() < spre.abs().min(3.0 * sbis.abs() - delta) {
                spre = scur;
                scur = stry;
            } else {
                spre = sbis;
                scur = sbis;
            }
        } else {
            spre = sbis;
            scur = sbis;
        }

        xpre = xcur;
        fpre = fcur;
        if scur.abs() > delta {
            xcur += scur;
        } else {
            xcur += if sbis > 0.0 { delta } else { -delta };
        }
        fcur = f(xcur).map_err(RootError::Objective)?;
    }

    Ok(Root {
        x: xcur,
        fx: fcur,
        iterations: tol.max_iter,
        converged: false,
    })
}

/// Trapezoidal integral of `y` over the abscissae `x` (any spacing).
pub fn trapezoid(y: &[f64], x: &[f64]) -> f64 {
    debug_assert_eq!(y.len(), x.len());
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| 0.5 * (xs[1] - xs[0]) * (ys[0] + ys[1]))
        .sum()
}

/// `n` evenly spaced points from `start` to `end` inclusive
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::convert::Infallible;

    fn ok(v: f64) -> Result<f64, Infallible> {
        Ok(v)
    }

    #[test]
    fn test_bounded_minimum_interior() {
        let tol = Tolerances::default();
        let min = minimize_bounded(|x| ok((x - 1.3).powi(2) + 2.0), (-4.0, 5.0), &tol).unwrap();
        assert!(min.converged);
        assert_abs_diff_eq!(min.x, 1.3, epsilon = 1e-4);
        assert_abs_diff_eq!(min.fx, 2.0, epsilon = 1e-8);
        assert!(min.iterations > 0 && min.iterations < 50);
    }

    #[test]
    fn test_bounded_minimum_stays_in_bounds() {
        let tol = Tolerances::default();
        let mut seen = Vec::new();
        let min = minimize_bounded(
            |x| {
                seen.push(x);
                ok(x)
            },
            (2.0, 3.0),
            &tol,
        )
        .unwrap();
        assert!(seen.iter().all(|&x| (2.0..=3.0).contains(&x)));
        // Monotone objective: optimum sits on the lower face
        assert_abs_diff_eq!(min.x, 2.0, epsilon = 1e-3);
    }

    #[test]
    fn test_bounded_minimum_iteration_cap() {
        let tol = Tolerances {
            max_iter: 3,
            ..Default::default()
        };
        let min = minimize_bounded(|x| ok((x - 0.1).powi(2)), (-10.0, 10.0), &tol).unwrap();
        assert!(!min.converged);
        assert_eq!(min.iterations, 3);
    }

    #[test]
    fn test_bounded_minimum_propagates_error() {
        let tol = Tolerances::default();
        let res = minimize_bounded(
            |x| if x > 0.5 { Err("boom") } else { Ok(x) },
            (0.0, 1.0),
            &tol,
        );
        assert_eq!(res.unwrap_err(), "boom");
    }

    #[test]
    fn test_nelder_mead_interior() {
        let tol = Tolerances {
            xtol: 1e-7,
            ftol: 1e-10,
            max_iter: 500,
        };
        let min = nelder_mead_bounded(
            |x: &[f64; 2]| ok((x[0] - 3.0).powi(2) + 2.0 * (x[1] + 1.0).powi(2)),
            [1.0, 1.0],
            [0.0, -5.0],
            [10.0, 5.0],
            &tol,
        )
        .unwrap();
        assert!(min.converged);
        assert_abs_diff_eq!(min.x[0], 3.0, epsilon = 1e-4);
        assert_abs_diff_eq!(min.x[1], -1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_nelder_mead_active_bound() {
        let tol = Tolerances {
            xtol: 1e-6,
            ftol: 1e-12,
            max_iter: 500,
        };
        let mut outside = 0;
        let min = nelder_mead_bounded(
            |x: &[f64; 2]| {
                if !(0.0..=2.0).contains(&x[0]) || !(0.0..=2.0).contains(&x[1]) {
                    outside += 1;
                }
                ok((x[0] - 5.0).powi(2) + (x[1] - 1.0).powi(2))
            },
            [0.5, 0.5],
            [0.0, 0.0],
            [2.0, 2.0],
            &tol,
        )
        .unwrap();
        assert_eq!(outside, 0, "objective evaluated outside the box");
        assert_abs_diff_eq!(min.x[0], 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(min.x[1], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_find_root() {
        let tol = Tolerances {
            xtol: 1e-12,
            ..Default::default()
        };
        let root = find_root(|x| ok(x * x * x - 2.0), (0.0, 3.0), &tol).unwrap();
        assert!(root.converged);
        assert_abs_diff_eq!(root.x, 2.0_f64.cbrt(), epsilon = 1e-10);
    }

    #[test]
    fn test_find_root_no_sign_change() {
        let tol = Tolerances::default();
        let err = find_root(|x| ok(x * x + 1.0), (-1.0, 1.0), &tol).unwrap_err();
        match err {
            RootError::NoSignChange { f_lo, f_hi, .. } => {
                assert_eq!(f_lo, 2.0);
                assert_eq!(f_hi, 2.0);
            }
            RootError::Objective(e) => match e {},
        }
    }

    #[test]
    fn test_find_root_at_endpoint() {
        let tol = Tolerances::default();
        let root = find_root(|x| ok(x - 1.0), (1.0, 4.0), &tol).unwrap();
        assert_eq!(root.x, 1.0);
        assert_eq!(root.iterations, 0);
    }

    #[test]
    fn test_trapezoid_nonuniform() {
        // Linear integrands are exact under the trapezoid rule
        let x = [0.0, 0.1, 0.5, 1.7, 2.0];
        let y: Vec<f64> = x.iter().map(|v| 3.0 * v + 1.0).collect();
        assert_abs_diff_eq!(trapezoid(&y, &x), 8.0, epsilon = 1e-12);
    }

    #[test]
    fn test_linspace_endpoints() {
        let v = linspace(0.0, 60.0, 50);
        assert_eq!(v.len(), 50);
        assert_eq!(v[0], 0.0);
        assert_eq!(v[49], 60.0);
        assert!(linspace(1.0, 2.0, 0).is_empty());
        assert_eq!(linspace(1.0, 2.0, 1), vec![1.0]);
    }
}
