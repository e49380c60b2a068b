//! Open tight-binding systems and observables.
//!
//! An [`OpenSystem`] is a finite central scattering region together with
//! the unit cells of its semi-infinite leads. Attaching evaluated boundary
//! blocks produces an [`ExtendedSystem`]: one dense Hamiltonian over the
//! central orbitals followed by the boundary blocks of every lead, with
//! the interface couplings filled in, plus the combined validity
//! predicates of the boundaries.

use ndarray::{ self as nd, s };
use num_complex::Complex64 as C64;
use crate::boundary::{ Boundary, EvaluatedBoundary, LeadCell };
use crate::error::BoundaryError;

/// Finite central region with semi-infinite leads.
#[derive(Clone, Debug)]
pub struct OpenSystem {
    /// Hamiltonian of the central region.
    pub hamiltonian: nd::Array2<C64>,
    pub leads: Vec<LeadCell>,
    /// Central orbitals each lead's first cell couples to; entry `c` of a
    /// lead's list is the central orbital reached through column `c` of
    /// its hopping.
    pub interfaces: Vec<Vec<usize>>,
}

impl OpenSystem {
    pub fn num_orbitals(&self) -> usize { self.hamiltonian.dim().0 }

    pub fn num_leads(&self) -> usize { self.leads.len() }

    /// Evaluate one boundary per lead and assemble the extended
    /// Hamiltonian.
    pub fn hamiltonian_with_boundaries(&self, boundaries: &[Boundary])
        -> Result<ExtendedSystem, BoundaryError>
    {
        if boundaries.len() != self.leads.len() {
            return Err(BoundaryError::BadLeadCell(
                self.leads.len(), boundaries.len(), 0));
        }
        let evaluated: Vec<EvaluatedBoundary> = boundaries.iter()
            .zip(self.leads.iter())
            .map(|(b, lead)| b.evaluate(lead))
            .collect();
        let c = self.num_orbitals();
        let total: usize = c
            + evaluated.iter().map(|bc| bc.num_orbitals()).sum::<usize>();
        let mut h: nd::Array2<C64> = nd::Array2::zeros((total, total));
        h.slice_mut(s![..c, ..c]).assign(&self.hamiltonian);
        let mut offset = c;
        let mut lead_ranges: Vec<(usize, usize)> = Vec::new();
        for ((bc, lead), interface)
            in evaluated.iter().zip(self.leads.iter())
                .zip(self.interfaces.iter())
        {
            let n = bc.num_orbitals();
            h.slice_mut(s![offset..offset + n, offset..offset + n])
                .assign(&bc.hamiltonian);
            let v = lead.hopping();
            for (a, b) in bc.to_slices.iter() {
                for r in 0..(b - a) {
                    for (col_idx, col) in interface.iter().enumerate() {
                        h[[offset + a + r, *col]] += v[[r, col_idx]];
                    }
                }
            }
            for (a, b) in bc.from_slices.iter() {
                for r in 0..(b - a) {
                    for col in interface.iter() {
                        h[[*col, offset + a + r]]
                            = h[[offset + a + r, *col]].conj();
                    }
                }
            }
            lead_ranges.push((offset, offset + n));
            offset += n;
        }
        Ok(ExtendedSystem {
            hamiltonian: h,
            central_len: c,
            lead_ranges,
            boundaries: evaluated,
        })
    }
}

/// Central region plus boundary blocks, ready for time evolution.
#[derive(Clone, Debug)]
pub struct ExtendedSystem {
    pub hamiltonian: nd::Array2<C64>,
    pub central_len: usize,
    /// Orbital span of each lead's boundary block in the extended
    /// Hamiltonian.
    pub lead_ranges: Vec<(usize, usize)>,
    boundaries: Vec<EvaluatedBoundary>,
}

impl ExtendedSystem {
    pub fn len(&self) -> usize { self.hamiltonian.dim().0 }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn boundaries(&self) -> &[EvaluatedBoundary] { &self.boundaries }

    /// All boundary blocks still exact at time `t`.
    pub fn time_is_valid(&self, t: f64) -> bool {
        self.boundaries.iter().all(|bc| bc.time_is_valid(t))
    }

    /// No boundary block flags a spurious reflection in `psi` (full
    /// extended length).
    pub fn solution_is_valid(&self, psi: &nd::ArrayView1<C64>) -> bool {
        self.lead_ranges.iter()
            .zip(self.boundaries.iter())
            .all(|((a, b), bc)| {
                bc.solution_is_valid(&psi.slice(s![*a..*b]))
            })
    }
}

/// One-body observable evaluated on a central-region wavefunction.
pub trait Operator {
    /// Expectation values; the output length is a property of the
    /// operator, not of the state.
    fn evaluate(&self, psi: &nd::ArrayView1<C64>) -> nd::Array1<f64>;
}

/// Particle density, site-resolved.
#[derive(Copy, Clone, Debug, Default)]
pub struct Density;

impl Operator for Density {
    fn evaluate(&self, psi: &nd::ArrayView1<C64>) -> nd::Array1<f64> {
        psi.mapv(|z| z.norm_sqr())
    }
}

/// Total particle number on the central region.
#[derive(Copy, Clone, Debug, Default)]
pub struct TotalDensity;

impl Operator for TotalDensity {
    fn evaluate(&self, psi: &nd::ArrayView1<C64>) -> nd::Array1<f64> {
        nd::arr1(&[psi.iter().map(|z| z.norm_sqr()).sum()])
    }
}
