//! Analytic uniform chain: a single-orbital tight-binding wire.
//!
//! The chain with onsite energy `eps` and hopping amplitude `-gamma` has
//! the single cosine band `E(k) = eps - 2 gamma cos k`, and its
//! scattering states are plane waves with transmission one. This makes it
//! the exactly solvable reference model: [`CosineBand`] is the spectrum
//! oracle and [`UniformChain`] the equilibrium scattering solver.

use ndarray::{ self as nd };
use num_complex::Complex64 as C64;
use crate::boundary::LeadCell;
use crate::error::ScatteringError;
use crate::onebody::{ EquilibriumSolver, ScatteringState };
use crate::spectrum::Spectrum;
use crate::system::{ ExtendedSystem, OpenSystem };

/// `E(k) = onsite - 2 hopping cos k` on `[-pi, pi]`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CosineBand {
    pub onsite: f64,
    pub hopping: f64,
}

impl CosineBand {
    pub fn new(onsite: f64, hopping: f64) -> Self {
        Self { onsite, hopping }
    }
}

impl Spectrum for CosineBand {
    fn nbands(&self) -> usize { 1 }

    fn energy(&self, k: f64, _band: usize) -> f64 {
        self.onsite - 2.0 * self.hopping * k.cos()
    }

    fn derivative(&self, k: f64, band: usize, order: usize) -> f64 {
        match order % 4 {
            0 if order == 0 => self.energy(k, band),
            0 => -2.0 * self.hopping * k.cos(),
            1 => 2.0 * self.hopping * k.sin(),
            2 => 2.0 * self.hopping * k.cos(),
            _ => -2.0 * self.hopping * k.sin(),
        }
    }
}

/// A perfect chain of `num_sites` central sites with one lead on each
/// end; lead 0 extends to the left, lead 1 to the right.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UniformChain {
    pub num_sites: usize,
    pub onsite: f64,
    /// Hopping amplitude `gamma > 0`; the matrix element is `-gamma`.
    pub hopping: f64,
}

impl UniformChain {
    pub fn new(num_sites: usize, onsite: f64, hopping: f64) -> Self {
        Self { num_sites, onsite, hopping }
    }

    pub fn spectrum(&self) -> CosineBand {
        CosineBand::new(self.onsite, self.hopping)
    }

    fn lead_cell(&self) -> LeadCell {
        LeadCell::new(
            nd::arr2(&[[C64::from(self.onsite)]]),
            nd::arr2(&[[C64::from(-self.hopping)]]),
        ).expect("uniform chain: 1x1 lead cell cannot be malformed")
    }

    pub fn system(&self) -> OpenSystem {
        let n = self.num_sites;
        let mut h: nd::Array2<C64> = nd::Array2::zeros((n, n));
        for j in 0..n {
            h[[j, j]] = C64::from(self.onsite);
            if j + 1 < n {
                h[[j, j + 1]] = C64::from(-self.hopping);
                h[[j + 1, j]] = C64::from(-self.hopping);
            }
        }
        OpenSystem {
            hamiltonian: h,
            leads: vec![self.lead_cell(), self.lead_cell()],
            interfaces: vec![vec![0], vec![n - 1]],
        }
    }

    /// Physical coordinate of every extended-system orbital; central site
    /// `j` sits at `j`, the left boundary at `-1, -2, ...`, the right at
    /// `n, n + 1, ...`.
    fn coordinates(&self, syst: &ExtendedSystem) -> Vec<f64> {
        let n = self.num_sites as isize;
        let mut x: Vec<f64> = (0..syst.len()).map(|j| j as f64).collect();
        if let Some((a, b)) = syst.lead_ranges.first() {
            for (c, xj) in x[*a..*b].iter_mut().enumerate() {
                *xj = -1.0 - c as f64;
            }
        }
        if let Some((a, b)) = syst.lead_ranges.get(1) {
            for (c, xj) in x[*a..*b].iter_mut().enumerate() {
                *xj = (n + c as isize) as f64;
            }
        }
        x
    }
}

impl EquilibriumSolver for UniformChain {
    fn num_leads(&self) -> usize { 2 }

    /// Plane wave of unit incoming flux: `psi(x) = e^{i s k x} / sqrt(v)`
    /// with `s = +1` for the left lead and `-1` for the right one.
    fn scattering_states(
        &self,
        energy: f64,
        lead: usize,
        syst: &ExtendedSystem,
    ) -> Result<Vec<ScatteringState>, ScatteringError>
    {
        if lead >= 2 { return Err(ScatteringError::BadLead(lead, 2)); }
        let cosk = (self.onsite - energy) / (2.0 * self.hopping);
        if cosk.abs() >= 1.0 { return Ok(Vec::new()); }
        let k = cosk.acos();
        let velocity = 2.0 * self.hopping * k.sin();
        if velocity <= 0.0 { return Ok(Vec::new()); }
        let sign = if lead == 0 { 1.0 } else { -1.0 };
        let amp = C64::from(1.0 / velocity.sqrt());
        let psi: nd::Array1<C64> = self.coordinates(syst)
            .into_iter()
            .map(|x| amp * (C64::i() * sign * k * x).exp())
            .collect();
        Ok(vec![ScatteringState { momentum: k, velocity, psi }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;
    use crate::boundary::Boundary;
    use std::f64::consts::PI;

    #[test]
    fn band_derivatives() {
        let sp = CosineBand::new(0.5, 1.0);
        let k = 0.37;
        assert!((sp.energy(k, 0) - (0.5 - 2.0 * k.cos())).abs() < 1e-15);
        assert!((sp.derivative(k, 0, 1) - 2.0 * k.sin()).abs() < 1e-15);
        assert!((sp.derivative(k, 0, 2) - 2.0 * k.cos()).abs() < 1e-15);
        assert!((sp.derivative(k, 0, 3) + 2.0 * k.sin()).abs() < 1e-15);
        assert!((sp.derivative(k, 0, 4) + 2.0 * k.cos()).abs() < 1e-15);
    }

    #[test]
    fn scattering_state_is_eigenstate_in_the_bulk() {
        let chain = UniformChain::new(5, 0.0, 1.0);
        let syst = chain.system();
        let ext = syst.hamiltonian_with_boundaries(&[
            Boundary::simple_cells(6).unwrap(),
            Boundary::simple_cells(6).unwrap(),
        ]).unwrap();
        for lead in 0..2 {
            let energy = -0.7;
            let states
                = chain.scattering_states(energy, lead, &ext).unwrap();
            assert_eq!(states.len(), 1);
            let st = &states[0];
            // unit-flux normalization
            assert!(
                (st.psi[0].norm_sqr() - 1.0 / st.velocity).abs() < 1e-12);
            // eigenstate on the central sites (every neighbor present)
            let hpsi = ext.hamiltonian.dot(&st.psi);
            for (hp, p) in hpsi.slice(s![..5]).iter()
                .zip(st.psi.slice(s![..5]).iter())
            {
                assert!((hp - p * energy).norm() < 1e-10);
            }
        }
    }

    #[test]
    fn band_edges_are_closed() {
        let chain = UniformChain::new(3, 0.0, 1.0);
        let syst = chain.system();
        let ext = syst.hamiltonian_with_boundaries(&[
            Boundary::simple_cells(2).unwrap(),
            Boundary::simple_cells(2).unwrap(),
        ]).unwrap();
        assert!(chain.scattering_states(2.0, 0, &ext).unwrap().is_empty());
        assert!(chain.scattering_states(-2.5, 0, &ext).unwrap().is_empty());
        assert!(chain.scattering_states(0.0, 5, &ext).is_err());
    }

    #[test]
    fn momentum_matches_band() {
        let chain = UniformChain::new(3, 0.0, 1.0);
        let sp = chain.spectrum();
        let syst = chain.system();
        let ext = syst.hamiltonian_with_boundaries(&[
            Boundary::simple_cells(2).unwrap(),
            Boundary::simple_cells(2).unwrap(),
        ]).unwrap();
        let st = &chain.scattering_states(-1.0, 0, &ext).unwrap()[0];
        assert!((st.momentum - PI / 3.0).abs() < 1e-12);
        assert!(
            (st.velocity - sp.derivative(st.momentum, 0, 1)).abs()
            < 1e-12);
    }
}
