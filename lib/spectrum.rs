//! Band-structure oracle for translation-invariant leads.
//!
//! A [`Spectrum`] answers pointwise dispersion queries (`E_n(k)` and its
//! momentum derivatives) and structural ones: on which momentum intervals a
//! derivative of the dispersion stays inside a window, where it crosses a
//! given curve, and which open scattering mode a momentum or energy belongs
//! to. The structural queries have default implementations built on dense
//! sampling with bisection refinement, so an implementor only has to supply
//! the dispersion itself.
//!
//! Open scattering modes at a fixed energy are counted per band among the
//! momenta with positive velocity, ordered by momentum.

/// Samples per band used by the default interval/intersection searches.
const NSAMPLE: usize = 2003;

/// Bisection iterations; enough to pin a root of a smooth function to the
/// last few ulps of a Brillouin-zone-sized bracket.
const NBISECT: usize = 80;

/// Dispersion relation of a periodic lead with one or more bands.
///
/// Momenta live on the fundamental domain `[kmin, kmax]`. `derivative(k,
/// band, 0)` must agree with `energy(k, band)`.
pub trait Spectrum {
    fn nbands(&self) -> usize;

    /// Lower edge of the momentum domain.
    fn kmin(&self) -> f64 { -std::f64::consts::PI }

    /// Upper edge of the momentum domain.
    fn kmax(&self) -> f64 { std::f64::consts::PI }

    fn energy(&self, k: f64, band: usize) -> f64;

    /// `order`-th momentum derivative of the dispersion; `order == 1` is the
    /// group velocity.
    ///
    /// The default is a central finite difference on `energy`; analytic
    /// implementations should override it.
    fn derivative(&self, k: f64, band: usize, order: usize) -> f64 {
        if order == 0 {
            self.energy(k, band)
        } else {
            let h: f64 = 1e-5;
            let lo = self.derivative(k - h, band, order - 1);
            let hi = self.derivative(k + h, band, order - 1);
            (hi - lo) / (2.0 * h)
        }
    }

    /// Momentum intervals on which `lower <= E^(order)(k) <= upper`,
    /// restricted to `[kmin, kmax]` (defaulting to the fundamental domain).
    /// Returned intervals are disjoint and ascend.
    fn intervals(
        &self,
        band: usize,
        order: usize,
        lower: Option<f64>,
        upper: Option<f64>,
        kmin: Option<f64>,
        kmax: Option<f64>,
    ) -> Vec<(f64, f64)>
    {
        let ka = kmin.unwrap_or(self.kmin());
        let kb = kmax.unwrap_or(self.kmax());
        if ka >= kb { return Vec::new(); }
        let lo = lower.unwrap_or(f64::NEG_INFINITY);
        let hi = upper.unwrap_or(f64::INFINITY);
        let inside = |k: f64| {
            let e = self.derivative(k, band, order);
            lo <= e && e <= hi
        };
        // refine the window edge between an inside sample and an outside one
        let edge = |mut kin: f64, mut kout: f64| {
            for _ in 0..NBISECT {
                let km = 0.5 * (kin + kout);
                if inside(km) { kin = km; } else { kout = km; }
            }
            0.5 * (kin + kout)
        };
        let dk = (kb - ka) / (NSAMPLE - 1) as f64;
        let mut acc: Vec<(f64, f64)> = Vec::new();
        let mut start: Option<f64> = None;
        let mut prev = ka;
        for j in 0..NSAMPLE {
            let k = ka + j as f64 * dk;
            match (start, inside(k)) {
                (None, true) => {
                    start = Some(if j == 0 { k } else { edge(k, prev) });
                },
                (Some(k0), false) => {
                    acc.push((k0, edge(prev, k)));
                    start = None;
                },
                _ => { },
            }
            prev = k;
        }
        if let Some(k0) = start { acc.push((k0, kb)); }
        acc
    }

    /// Momenta in `[kmin, kmax]` where `E^(order)(k) = f(k)`, ascending.
    fn intersect(
        &self,
        f: &dyn Fn(f64) -> f64,
        band: usize,
        order: usize,
        kmin: Option<f64>,
        kmax: Option<f64>,
    ) -> Vec<f64>
    {
        let ka = kmin.unwrap_or(self.kmin());
        let kb = kmax.unwrap_or(self.kmax());
        if ka >= kb { return Vec::new(); }
        let g = |k: f64| self.derivative(k, band, order) - f(k);
        let dk = (kb - ka) / (NSAMPLE - 1) as f64;
        let mut zeros: Vec<f64> = Vec::new();
        let mut kprev = ka;
        let mut gprev = g(ka);
        for j in 1..NSAMPLE {
            let k = ka + j as f64 * dk;
            let gk = g(k);
            if gprev == 0.0 {
                zeros.push(kprev);
            } else if gprev * gk < 0.0 {
                let (mut a, mut b) = (kprev, k);
                let mut ga = gprev;
                for _ in 0..NBISECT {
                    let m = 0.5 * (a + b);
                    let gm = g(m);
                    if ga * gm <= 0.0 { b = m; } else { a = m; ga = gm; }
                }
                zeros.push(0.5 * (a + b));
            }
            kprev = k;
            gprev = gk;
        }
        if gprev == 0.0 { zeros.push(kb); }
        zeros
    }

    /// All momenta in the fundamental domain with `E(k, band) = energy`.
    fn momenta(&self, energy: f64, band: usize) -> Vec<f64> {
        self.intersect(&|_| energy, band, 0, None, None)
    }

    /// Index of the open scattering mode the momentum `k` belongs to, or
    /// `None` if the mode is closed (non-positive group velocity). Open
    /// modes at a fixed energy are numbered by ascending momentum across
    /// all bands.
    fn momentum_to_scattering_mode(&self, k: f64, band: usize)
        -> Option<usize>
    {
        if self.derivative(k, band, 1) <= 0.0 { return None; }
        let energy = self.energy(k, band);
        let mut open: Vec<f64> = Vec::new();
        for b in 0..self.nbands() {
            open.extend(
                self.momenta(energy, b)
                    .into_iter()
                    .filter(|kb| self.derivative(*kb, b, 1) > 0.0)
            );
        }
        open.sort_by(|l, r| l.total_cmp(r));
        let tol = 1e-8 * (self.kmax() - self.kmin());
        open.iter().position(|kb| (kb - k).abs() < tol)
    }

    /// Momentum and mode index of the unique open mode of `band` at `energy`
    /// inside `[kmin, kmax]`, or `None` when no such mode is open there.
    fn energy_to_scattering_mode(
        &self,
        energy: f64,
        band: usize,
        kmin: f64,
        kmax: f64,
    ) -> Option<(f64, usize)>
    {
        self.intersect(&|_| energy, band, 0, Some(kmin), Some(kmax))
            .into_iter()
            .find(|k| self.derivative(*k, band, 1) > 0.0)
            .and_then(|k| {
                self.momentum_to_scattering_mode(k, band)
                    .map(|mode| (k, mode))
            })
    }
}

/// Pairwise intersection of two sets of disjoint ascending intervals.
pub fn intersect_intervals(
    a: &[(f64, f64)],
    b: &[(f64, f64)],
) -> Vec<(f64, f64)>
{
    let mut acc: Vec<(f64, f64)> = Vec::new();
    for (a0, a1) in a.iter() {
        for (b0, b1) in b.iter() {
            let lo = a0.max(*b0);
            let hi = a1.min(*b1);
            if lo < hi { acc.push((lo, hi)); }
        }
    }
    acc.sort_by(|l, r| l.0.total_cmp(&r.0));
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::CosineBand;
    use std::f64::consts::PI;

    #[test]
    fn cosine_band_intervals() {
        // E(k) = -2 cos k; E in [-2, 0] for |k| <= pi/2
        let sp = CosineBand::new(0.0, 1.0);
        let iv = sp.intervals(0, 0, None, Some(0.0), None, None);
        assert_eq!(iv.len(), 1);
        assert!((iv[0].0 + PI / 2.0).abs() < 1e-6);
        assert!((iv[0].1 - PI / 2.0).abs() < 1e-6);
        // positive velocity on (0, pi)
        let iv = sp.intervals(0, 1, Some(0.0), None, None, None);
        assert_eq!(iv.len(), 1);
        assert!(iv[0].0.abs() < 1e-6);
        assert!((iv[0].1 - PI).abs() < 1e-9);
    }

    #[test]
    fn cosine_band_intersect() {
        let sp = CosineBand::new(0.0, 1.0);
        // E(k) = -1 at k = ±pi/3
        let ks = sp.intersect(&|_| -1.0, 0, 0, None, None);
        assert_eq!(ks.len(), 2);
        assert!((ks[0] + PI / 3.0).abs() < 1e-9);
        assert!((ks[1] - PI / 3.0).abs() < 1e-9);
    }

    #[test]
    fn scattering_mode_lookup() {
        let sp = CosineBand::new(0.0, 1.0);
        // at E = 0 the open mode sits at k = pi/2
        assert_eq!(sp.momentum_to_scattering_mode(PI / 2.0, 0), Some(0));
        // the left mover is closed
        assert_eq!(sp.momentum_to_scattering_mode(-PI / 2.0, 0), None);
        let (k, mode)
            = sp.energy_to_scattering_mode(0.0, 0, -PI, PI).unwrap();
        assert!((k - PI / 2.0).abs() < 1e-9);
        assert_eq!(mode, 0);
        // outside the band
        assert!(sp.energy_to_scattering_mode(5.0, 0, -PI, PI).is_none());
    }

    #[test]
    fn interval_intersection() {
        let a = [(0.0, 1.0), (2.0, 3.0)];
        let b = [(0.5, 2.5)];
        let c = intersect_intervals(&a, &b);
        assert_eq!(c, vec![(0.5, 1.0), (2.0, 2.5)]);
    }
}
