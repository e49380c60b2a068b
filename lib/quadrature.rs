//! Quadrature rules on a finite interval.
//!
//! Gauss rules are generated by the Golub-Welsch method: the nodes of an
//! `n`-point rule are the eigenvalues of the symmetric tridiagonal Jacobi
//! matrix of the weight function, and the weights come from the first
//! components of its eigenvectors. The Gauss-Kronrod extension is built by
//! Laurie's mixed-moment algorithm, which produces the Jacobi-Kronrod matrix
//! of the `(2n+1)`-point rule from the first `ceil(3n/2)+1` ordinary
//! recurrence coefficients.
//!
//! Paired rules ([`Quadrature::Kronrod`], [`Quadrature::TrapezoidDouble`])
//! return two weight rows over shared abscissas, one low-order and one
//! high-order, so that an error estimate costs no extra function
//! evaluations.

use ndarray::{ self as nd, s };
use ndarray_linalg::{ self as la, Eigh };
use crate::error::QuadratureError;

/// Available quadrature rules.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Quadrature {
    /// `n`-point Gauss-Legendre rule; one weight row.
    GaussLegendre,
    /// `(2n+1)`-point Gauss-Kronrod extension of the `n`-point
    /// Gauss-Legendre rule; two weight rows (embedded Gauss first, Kronrod
    /// second).
    Kronrod,
    /// `n`-point trapezoid rule on uniform nodes; one weight row.
    Trapezoid,
    /// `(2n-1)`-point uniform rule; two weight rows (every-second-node
    /// trapezoid first, full trapezoid second).
    TrapezoidDouble,
}

impl Quadrature {
    /// Lower-case rule name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::GaussLegendre => "gauss-legendre",
            Self::Kronrod => "gauss-kronrod",
            Self::Trapezoid => "trapezoid",
            Self::TrapezoidDouble => "trapezoid-double",
        }
    }
}

/// Legendre recurrence coefficients `b_k` (all `a_k` vanish); `b_0` is the
/// total weight-function mass.
fn legendre_b(len: usize) -> nd::Array1<f64> {
    nd::Array1::from_iter(
        (0..len)
            .map(|k| {
                if k == 0 {
                    2.0
                } else {
                    let kk = (k * k) as f64;
                    kk / (4.0 * kk - 1.0)
                }
            })
    )
}

/// Nodes and weights of the rule whose Jacobi matrix has diagonal `diag` and
/// squared off-diagonal `b[1..]`, with `b[0]` the weight-function mass.
fn golub_welsch(diag: &nd::Array1<f64>, b: &nd::Array1<f64>)
    -> (nd::Array1<f64>, nd::Array1<f64>)
{
    let n = diag.len();
    let mut jac: nd::Array2<f64> = nd::Array2::zeros((n, n));
    jac.diag_mut().assign(diag);
    for k in 1..n {
        let off = b[k].sqrt();
        jac[[k, k - 1]] = off;
        jac[[k - 1, k]] = off;
    }
    let (x, v): (nd::Array1<f64>, nd::Array2<f64>)
        = jac.eigh(la::UPLO::Lower)
        .expect("golub_welsch: diagonalization error");
    let w: nd::Array1<f64>
        = v.slice(s![0, ..]).mapv(|v0| b[0] * v0 * v0);
    (x, w)
}

/// Jacobi-Kronrod matrix coefficients for the `(2n+1)`-point extension
/// (Laurie, Math. Comp. 66, 1133 (1997)).
fn jacobi_kronrod(n: usize) -> (nd::Array1<f64>, nd::Array1<f64>) {
    // ceil(3n/2) + 1 ordinary coefficients seed the extension
    let b0 = legendre_b((3 * n + 1) / 2 + 1);
    let a: nd::Array1<f64> = nd::Array1::zeros(2 * n + 1);
    let mut b: nd::Array1<f64> = nd::Array1::zeros(2 * n + 1);
    b.slice_mut(s![..b0.len().min(2 * n + 1)])
        .assign(&b0.slice(s![..b0.len().min(2 * n + 1)]));
    // Legendre symmetry keeps every a_k at zero, so only the b recurrence
    // needs the mixed-moment sweeps.
    let mut svec: Vec<f64> = vec![0.0; n / 2 + 2];
    let mut tvec: Vec<f64> = vec![0.0; n / 2 + 2];
    tvec[1] = b[n + 1];
    for m in 0..n.saturating_sub(1) {
        let mut u: f64 = 0.0;
        for k in (0..=(m + 1) / 2).rev() {
            let l = m - k;
            u += b[k + n + 1] * svec[k] - b[l] * svec[k + 1];
            svec[k + 1] = u;
        }
        std::mem::swap(&mut svec, &mut tvec);
    }
    for j in (0..=n / 2).rev() {
        svec[j + 1] = svec[j];
    }
    for m in (n - 1)..(2 * n - 2) {
        let mut u: f64 = 0.0;
        let mut j: usize = 0;
        for k in (m + 1 - n)..=((m - 1) / 2) {
            let l = m - k;
            j = n - 1 - l;
            u -= b[k + n + 1] * svec[j + 1] - b[l] * svec[j + 2];
            svec[j + 1] = u;
        }
        if m % 2 != 0 {
            let k = (m + 1) / 2;
            b[k + n + 1] = svec[j + 1] / svec[j + 2];
        }
        std::mem::swap(&mut svec, &mut tvec);
    }
    (a, b)
}

/// Abscissas and quadrature-weight rows of a rule on `[a, b]`.
///
/// `n` is the base order of the rule; paired rules return more nodes than
/// `n` (see [`Quadrature`]). The weight matrix has one row per estimate,
/// ordered low to high, each row summing the function values at the shared
/// abscissas into one integral estimate.
pub fn calc_abscissas_and_weights(
    a: f64,
    b: f64,
    n: usize,
    quadrature: Quadrature,
) -> Result<(nd::Array1<f64>, nd::Array2<f64>), QuadratureError>
{
    QuadratureError::check_bounds(a, b)?;
    let nmin = match quadrature {
        Quadrature::GaussLegendre | Quadrature::Kronrod => 1,
        Quadrature::Trapezoid | Quadrature::TrapezoidDouble => 2,
    };
    QuadratureError::check_order(n, nmin)?;
    let half = 0.5 * (b - a);
    let mid = 0.5 * (b + a);
    match quadrature {
        Quadrature::GaussLegendre => {
            let bcoef = legendre_b(n);
            let diag: nd::Array1<f64> = nd::Array1::zeros(n);
            let (x, w) = golub_welsch(&diag, &bcoef);
            let mut weights: nd::Array2<f64> = nd::Array2::zeros((1, n));
            weights.slice_mut(s![0, ..]).assign(&(&w * half));
            Ok((x.mapv(|xk| mid + half * xk), weights))
        },
        Quadrature::Kronrod => {
            let (diag, bcoef) = jacobi_kronrod(n);
            let (x, wk) = golub_welsch(&diag, &bcoef);
            let bg = legendre_b(n);
            let diag_g: nd::Array1<f64> = nd::Array1::zeros(n);
            let (xg, wg) = golub_welsch(&diag_g, &bg);
            let mut weights: nd::Array2<f64>
                = nd::Array2::zeros((2, 2 * n + 1));
            weights.slice_mut(s![1, ..]).assign(&(&wk * half));
            // the Gauss nodes interleave the Kronrod-only ones; place each
            // embedded weight at the nearest extended abscissa
            for (xj, wj) in xg.iter().zip(wg.iter()) {
                let (jmin, _) = x.iter()
                    .enumerate()
                    .map(|(j, xk)| (j, (xk - xj).abs()))
                    .min_by(|l, r| l.1.total_cmp(&r.1))
                    .expect("calc_abscissas_and_weights: empty node set");
                weights[[0, jmin]] = wj * half;
            }
            Ok((x.mapv(|xk| mid + half * xk), weights))
        },
        Quadrature::Trapezoid => {
            let x = nd::Array1::linspace(a, b, n);
            let h = (b - a) / (n - 1) as f64;
            let mut weights: nd::Array2<f64>
                = nd::Array2::from_elem((1, n), h);
            weights[[0, 0]] = 0.5 * h;
            weights[[0, n - 1]] = 0.5 * h;
            Ok((x, weights))
        },
        Quadrature::TrapezoidDouble => {
            let npts = 2 * n - 1;
            let x = nd::Array1::linspace(a, b, npts);
            let h = (b - a) / (npts - 1) as f64;
            let mut weights: nd::Array2<f64>
                = nd::Array2::zeros((2, npts));
            for j in 0..npts {
                weights[[1, j]] = h;
                if j % 2 == 0 { weights[[0, j]] = 2.0 * h; }
            }
            weights[[0, 0]] = h;
            weights[[0, npts - 1]] = h;
            weights[[1, 0]] = 0.5 * h;
            weights[[1, npts - 1]] = 0.5 * h;
            Ok((x, weights))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integrate(
        f: impl Fn(f64) -> f64,
        x: &nd::Array1<f64>,
        w: &nd::ArrayView1<f64>,
    ) -> f64
    {
        x.iter().zip(w.iter()).map(|(xk, wk)| wk * f(*xk)).sum()
    }

    #[test]
    fn gauss_legendre_small_orders() {
        // n = 2: nodes ±1/√3, weights 1
        let (x, w)
            = calc_abscissas_and_weights(
                -1.0, 1.0, 2, Quadrature::GaussLegendre).unwrap();
        let k = 1.0 / 3.0_f64.sqrt();
        assert!((x[0] + k).abs() < 1e-12 && (x[1] - k).abs() < 1e-12);
        assert!((w[[0, 0]] - 1.0).abs() < 1e-12);
        assert!((w[[0, 1]] - 1.0).abs() < 1e-12);
        // n = 3: nodes ±√(3/5), 0; weights 5/9, 8/9
        let (x, w)
            = calc_abscissas_and_weights(
                -1.0, 1.0, 3, Quadrature::GaussLegendre).unwrap();
        let k = (3.0 / 5.0_f64).sqrt();
        assert!((x[0] + k).abs() < 1e-12);
        assert!(x[1].abs() < 1e-12);
        assert!((x[2] - k).abs() < 1e-12);
        assert!((w[[0, 0]] - 5.0 / 9.0).abs() < 1e-12);
        assert!((w[[0, 1]] - 8.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn gauss_legendre_polynomial_exactness() {
        // an n-point rule is exact through degree 2n - 1
        let (x, w)
            = calc_abscissas_and_weights(
                0.0, 2.0, 5, Quadrature::GaussLegendre).unwrap();
        let w = w.slice(s![0, ..]);
        for p in 0..=9 {
            let exact = 2.0_f64.powi(p + 1) / (p + 1) as f64;
            let quad = integrate(|xk| xk.powi(p), &x, &w);
            assert!(
                (quad - exact).abs() < 1e-10 * exact.max(1.0),
                "degree {} off: {} vs {}", p, quad, exact,
            );
        }
    }

    #[test]
    fn kronrod_pair_structure() {
        let n: usize = 10;
        let (x, w)
            = calc_abscissas_and_weights(
                -1.0, 3.0, n, Quadrature::Kronrod).unwrap();
        assert_eq!(x.len(), 2 * n + 1);
        assert_eq!(w.dim(), (2, 2 * n + 1));
        // both rows integrate 1 to the interval length
        assert!((w.slice(s![0, ..]).sum() - 4.0).abs() < 1e-10);
        assert!((w.slice(s![1, ..]).sum() - 4.0).abs() < 1e-10);
        // embedded Gauss weights sit only on the interleaved (odd) nodes
        for j in (0..2 * n + 1).step_by(2) {
            assert!(w[[0, j]].abs() < 1e-13);
        }
        // abscissas ascend
        assert!(x.windows(2).into_iter().all(|p| p[0] < p[1]));
    }

    #[test]
    fn kronrod_pair_convergence() {
        // on a smooth integrand both rows converge, the Kronrod row faster
        let f = |x: f64| (2.0 * x).cos() * (-x * x).exp();
        let exact = {
            // dense fine trapezoid as reference
            let (x, w)
                = calc_abscissas_and_weights(
                    -2.0, 2.0, 20001, Quadrature::Trapezoid).unwrap();
            integrate(f, &x, &w.slice(s![0, ..]))
        };
        let (x, w)
            = calc_abscissas_and_weights(
                -2.0, 2.0, 10, Quadrature::Kronrod).unwrap();
        let gauss = integrate(f, &x, &w.slice(s![0, ..]));
        let kron = integrate(f, &x, &w.slice(s![1, ..]));
        assert!((kron - exact).abs() < 1e-8);
        assert!((kron - exact).abs() <= (gauss - exact).abs() + 1e-12);
    }

    #[test]
    fn trapezoid_rules() {
        let (x, w)
            = calc_abscissas_and_weights(
                0.0, 1.0, 101, Quadrature::Trapezoid).unwrap();
        let quad = integrate(|xk| xk * xk, &x, &w.slice(s![0, ..]));
        assert!((quad - 1.0 / 3.0).abs() < 1e-4);

        let (x, w)
            = calc_abscissas_and_weights(
                0.0, 1.0, 51, Quadrature::TrapezoidDouble).unwrap();
        assert_eq!(x.len(), 101);
        let coarse = integrate(|xk| xk * xk, &x, &w.slice(s![0, ..]));
        let fine = integrate(|xk| xk * xk, &x, &w.slice(s![1, ..]));
        assert!((fine - 1.0 / 3.0).abs() < (coarse - 1.0 / 3.0).abs());
    }

    #[test]
    fn bad_arguments() {
        assert!(
            calc_abscissas_and_weights(
                1.0, 1.0, 5, Quadrature::GaussLegendre).is_err());
        assert!(
            calc_abscissas_and_weights(
                1.0, 0.0, 5, Quadrature::Kronrod).is_err());
        assert!(
            calc_abscissas_and_weights(
                0.0, 1.0, 0, Quadrature::GaussLegendre).is_err());
        assert!(
            calc_abscissas_and_weights(
                0.0, 1.0, 1, Quadrature::Trapezoid).is_err());
    }
}
