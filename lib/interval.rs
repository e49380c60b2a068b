//! Momentum intervals and the one-body tasks sampled on them.
//!
//! The statistical average over a lead is an integral over the occupied,
//! right-moving part of its band structure. [`calc_intervals`] cuts that
//! region into momentum intervals, one per band and energy window, each
//! carrying a quadrature rule. [`calc_tasks`] then turns an interval into
//! concrete one-body states: the quadrature abscissas become momenta (or
//! energies), and each node gets a weight combining the quadrature weight
//! with the physical factor `v f(E) / 2pi`.
//!
//! Intervals hash and compare exactly (momentum bounds by bit pattern), so
//! they can key the bookkeeping of an adaptive refinement loop.

use std::hash::{ Hash, Hasher };
use indexmap::IndexMap;
use itertools::Itertools;
use log::{ debug, warn };
use ndarray::{ self as nd, s };
use crate::error::IntervalError;
use crate::occupation::Occupation;
use crate::quadrature::{ Quadrature, calc_abscissas_and_weights };
use crate::spectrum::{ Spectrum, intersect_intervals };

/// Variable the quadrature abscissas live on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IntegrationVariable {
    Momentum,
    Energy,
}

/// Default quadrature order for new intervals.
pub const DEFAULT_ORDER: usize = 10;

/// One quadrature interval of the many-body average.
///
/// `leads` usually holds a single lead; [`combine_intervals`] merges
/// intervals that differ only in the lead index into one entry with several
/// leads.
#[derive(Clone, Debug)]
pub struct Interval {
    pub leads: Vec<usize>,
    pub band: usize,
    /// Lower momentum bound; for energy integration still a momentum, the
    /// energy window is `[E(kmin), E(kmax)]`.
    pub kmin: f64,
    pub kmax: f64,
    pub order: usize,
    pub quadrature: Quadrature,
    pub integration_variable: IntegrationVariable,
}

impl Interval {
    /// Interval with the default rule: order-10 Gauss-Kronrod over
    /// momentum.
    pub fn new(lead: usize, band: usize, kmin: f64, kmax: f64)
        -> Result<Self, IntervalError>
    {
        IntervalError::check_bounds(kmin, kmax)?;
        Ok(Self {
            leads: vec![lead],
            band,
            kmin,
            kmax,
            order: DEFAULT_ORDER,
            quadrature: Quadrature::Kronrod,
            integration_variable: IntegrationVariable::Momentum,
        })
    }

    pub fn width(&self) -> f64 { self.kmax - self.kmin }
}

impl PartialEq for Interval {
    fn eq(&self, other: &Self) -> bool {
        self.leads == other.leads
            && self.band == other.band
            && self.kmin.to_bits() == other.kmin.to_bits()
            && self.kmax.to_bits() == other.kmax.to_bits()
            && self.order == other.order
            && self.quadrature == other.quadrature
            && self.integration_variable == other.integration_variable
    }
}

impl Eq for Interval { }

impl Hash for Interval {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.leads.hash(state);
        self.band.hash(state);
        self.kmin.to_bits().hash(state);
        self.kmax.to_bits().hash(state);
        self.order.hash(state);
        self.quadrature.hash(state);
        self.integration_variable.hash(state);
    }
}

/// Momentum windows of one band on which the energy lies in
/// `[emin, emax]` and the group velocity is positive.
fn occupied_momentum_windows(
    spectrum: &dyn Spectrum,
    band: usize,
    emin: Option<f64>,
    emax: Option<f64>,
) -> Vec<(f64, f64)>
{
    let energy_ok = spectrum.intervals(band, 0, emin, emax, None, None);
    let right_moving = spectrum.intervals(band, 1, Some(0.0), None, None, None);
    intersect_intervals(&energy_ok, &right_moving)
}

/// Quadrature intervals covering the occupied part of every lead.
///
/// A single occupation entry is broadcast over all leads; otherwise there
/// must be one entry per spectrum, with `None` marking an unoccupied lead.
pub fn calc_intervals(
    spectra: &[&dyn Spectrum],
    occupations: &[Option<Occupation>],
) -> Result<Vec<Interval>, IntervalError>
{
    if occupations.len() != 1 {
        IntervalError::check_lead_count(spectra.len(), occupations.len())?;
    } else {
        debug!("occupation in all leads assumed identical");
    }
    let mut intervals: Vec<Interval> = Vec::new();
    for (lead, spectrum) in spectra.iter().enumerate() {
        let occupation = if occupations.len() == 1 {
            &occupations[0]
        } else {
            &occupations[lead]
        };
        let Some(occupation) = occupation else { continue; };
        let bands: Vec<usize> = match occupation.bands.as_ref() {
            Some(bands) => {
                if let Some(bad)
                    = bands.iter().find(|b| **b >= spectrum.nbands())
                {
                    return Err(IntervalError::BadBand(
                        *bad, spectrum.nbands()));
                }
                bands.clone()
            },
            None => (0..spectrum.nbands()).collect(),
        };
        for (emin, emax) in occupation.energy_range.iter() {
            for band in bands.iter() {
                for (kmin, kmax) in occupied_momentum_windows(
                    *spectrum, *band, *emin, *emax)
                {
                    intervals.push(Interval::new(lead, *band, kmin, kmax)?);
                }
            }
        }
    }
    Ok(intervals)
}

/// Equidistant subdivision of one interval; only the momentum bounds
/// change.
pub fn split_interval(interval: &Interval, num_subintervals: usize)
    -> Result<Vec<Interval>, IntervalError>
{
    if num_subintervals == 0 {
        return Err(IntervalError::BadSplit(num_subintervals));
    }
    let dk = interval.width() / num_subintervals as f64;
    Ok(
        (0..num_subintervals)
            .map(|j| {
                let mut sub = interval.clone();
                sub.kmin = interval.kmin + j as f64 * dk;
                sub.kmax = interval.kmin + (j + 1) as f64 * dk;
                sub
            })
            .collect()
    )
}

/// Equidistant subdivision of every interval.
pub fn split_intervals(intervals: &[Interval], num_subintervals: usize)
    -> Result<Vec<Interval>, IntervalError>
{
    intervals.iter()
        .map(|interval| split_interval(interval, num_subintervals))
        .flatten_ok()
        .collect()
}

fn close(a: f64, b: f64, atol: f64, rtol: f64) -> bool {
    (a - b).abs() < atol + rtol * b.abs()
}

/// Everything except the lead set must match for two intervals to merge.
fn similar(a: &Interval, b: &Interval, atol: f64, rtol: f64) -> bool {
    a.band == b.band
        && close(a.kmin, b.kmin, atol, rtol)
        && close(a.kmax, b.kmax, atol, rtol)
        && a.order == b.order
        && a.quadrature == b.quadrature
        && a.integration_variable == b.integration_variable
}

/// Merge intervals differing only in the lead index into single entries
/// with the union of the lead sets. Momentum bounds compare to within
/// `atol + rtol * |b|`.
pub fn combine_intervals(intervals: &[Interval], atol: f64, rtol: f64)
    -> Vec<Interval>
{
    let mut pending: Vec<Interval> = intervals.to_vec();
    let mut combined: Vec<Interval> = Vec::new();
    while !pending.is_empty() {
        let mut head = pending.remove(0);
        let (matching, rest): (Vec<Interval>, Vec<Interval>)
            = pending.into_iter()
            .partition(|other| similar(&head, other, atol, rtol));
        pending = rest;
        for other in matching.iter() {
            head.leads.extend_from_slice(&other.leads);
        }
        head.leads.sort_unstable();
        head.leads.dedup();
        combined.push(head);
    }
    combined
}

/// Quantum numbers and weight of one one-body state in the many-body sum.
#[derive(Clone, Debug)]
pub struct Task {
    /// `None` for states outside the lead continuum, e.g. bound states.
    pub lead: Option<usize>,
    /// Open scattering mode index at `energy`; `None` for bound states.
    pub mode: Option<usize>,
    pub energy: f64,
    /// Only known for momentum integration.
    pub momentum: Option<f64>,
    /// `math_weight * phys_weight`; one entry per weight row of the
    /// interval's quadrature rule.
    pub weight: nd::Array1<f64>,
    /// Quadrature weights of the node, one entry per weight row.
    pub math_weight: nd::Array1<f64>,
    /// `v f(E) / 2pi` for momentum integration, `f(E) / 2pi` for energy
    /// integration.
    pub phys_weight: f64,
}

/// Default threshold below which a node's weights are dropped entirely.
pub const DEFAULT_WEIGHT_TOL: f64 = 1e-10;

/// One-body tasks sampling the given intervals, keyed by consecutive
/// integers starting at `first_key`.
///
/// Nodes whose weights are all below `tol` in magnitude are dropped, as
/// are nodes falling on a closed mode; a closed mode carrying
/// non-negligible weight is logged as a warning. Tasks are ordered as the
/// intervals, and within an interval by ascending abscissa.
pub fn calc_tasks(
    intervals: &[Interval],
    spectra: &[&dyn Spectrum],
    occupations: &[Option<Occupation>],
    first_key: usize,
    tol: f64,
) -> Result<IndexMap<usize, Task>, IntervalError>
{
    if occupations.len() != 1 {
        IntervalError::check_lead_count(spectra.len(), occupations.len())?;
    }
    let mut tasks: IndexMap<usize, Task> = IndexMap::new();
    let mut key = first_key;
    for interval in intervals.iter() {
        for lead in interval.leads.iter().copied() {
            if lead >= spectra.len() {
                return Err(IntervalError::LeadCount(spectra.len(), lead + 1));
            }
            let spectrum = spectra[lead];
            let occupation = if occupations.len() == 1 {
                &occupations[0]
            } else {
                &occupations[lead]
            };
            let Some(occupation) = occupation else { continue; };
            debug!("calc quadrature weights for lead={}", lead);
            let nodes = sample_interval(interval, spectrum)?;
            for node in nodes.into_iter() {
                let phys_weight = node.jacobian
                    * (occupation.distribution)(node.energy)
                    / std::f64::consts::TAU;
                let weight = node.math_weight.mapv(|w| w * phys_weight);
                let negligible = weight.iter().all(|w| w.abs() < tol);
                match node.mode {
                    None if !negligible => {
                        warn!(
                            "no open mode at energy={}, lead={}, but the \
                            node weight {} exceeds tolerance {}",
                            node.energy, lead, weight, tol,
                        );
                    },
                    Some(mode) if !negligible => {
                        tasks.insert(key, Task {
                            lead: Some(lead),
                            mode: Some(mode),
                            energy: node.energy,
                            momentum: node.momentum,
                            weight,
                            math_weight: node.math_weight,
                            phys_weight,
                        });
                        key += 1;
                    },
                    _ => { },
                }
            }
        }
    }
    debug!("number of tasks={}", tasks.len());
    Ok(tasks)
}

struct Node {
    mode: Option<usize>,
    energy: f64,
    momentum: Option<f64>,
    math_weight: nd::Array1<f64>,
    jacobian: f64,
}

fn sample_interval(interval: &Interval, spectrum: &dyn Spectrum)
    -> Result<Vec<Node>, IntervalError>
{
    let band = interval.band;
    match interval.integration_variable {
        IntegrationVariable::Momentum => {
            let (momenta, math_weights) = calc_abscissas_and_weights(
                interval.kmin, interval.kmax, interval.order,
                interval.quadrature)?;
            Ok(
                momenta.iter()
                    .enumerate()
                    .map(|(j, k)| Node {
                        mode: spectrum.momentum_to_scattering_mode(*k, band),
                        energy: spectrum.energy(*k, band),
                        momentum: Some(*k),
                        math_weight: math_weights.slice(s![.., j]).to_owned(),
                        jacobian: spectrum.derivative(*k, band, 1),
                    })
                    .collect()
            )
        },
        IntegrationVariable::Energy => {
            let emin = spectrum.energy(interval.kmin, band);
            let emax = spectrum.energy(interval.kmax, band);
            let (energies, math_weights) = calc_abscissas_and_weights(
                emin, emax, interval.order, interval.quadrature)?;
            Ok(
                energies.iter()
                    .enumerate()
                    .map(|(j, energy)| {
                        let mode = spectrum.energy_to_scattering_mode(
                            *energy, band, interval.kmin, interval.kmax);
                        Node {
                            mode: mode.map(|(_, m)| m),
                            energy: *energy,
                            momentum: None,
                            math_weight:
                                math_weights.slice(s![.., j]).to_owned(),
                            jacobian: 1.0,
                        }
                    })
                    .collect()
            )
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;
    use crate::chain::CosineBand;
    use crate::occupation::lead_occupation;

    fn two_lead_setup()
        -> (Vec<CosineBand>, Vec<Option<Occupation>>)
    {
        let spectra = vec![CosineBand::new(0.0, 1.0), CosineBand::new(0.0, 1.0)];
        let occupations = vec![lead_occupation(0.0, 0.0, None, None).unwrap()];
        (spectra, occupations)
    }

    #[test]
    fn half_filled_chain_intervals() {
        // occupied right movers of E = -2 cos k live on (0, pi/2)
        let (spectra, occupations) = two_lead_setup();
        let refs: Vec<&dyn Spectrum>
            = spectra.iter().map(|sp| sp as &dyn Spectrum).collect();
        let intervals = calc_intervals(&refs, &occupations).unwrap();
        assert_eq!(intervals.len(), 2);
        for (lead, interval) in intervals.iter().enumerate() {
            assert_eq!(interval.leads, vec![lead]);
            assert_eq!(interval.band, 0);
            assert!(interval.kmin.abs() < 1e-6);
            assert!((interval.kmax - PI / 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn split_partitions_the_interval() {
        let interval = Interval::new(0, 0, 0.0, 1.5).unwrap();
        let subs = split_interval(&interval, 3).unwrap();
        assert_eq!(subs.len(), 3);
        for (j, sub) in subs.iter().enumerate() {
            assert!((sub.width() - 0.5).abs() < 1e-15);
            assert!((sub.kmin - 0.5 * j as f64).abs() < 1e-15);
            assert_eq!(sub.order, interval.order);
            assert_eq!(sub.quadrature, interval.quadrature);
        }
        assert!(split_interval(&interval, 0).is_err());
    }

    #[test]
    fn combine_groups_leads() {
        let a = Interval::new(0, 0, 0.0, 1.0).unwrap();
        let b = Interval::new(1, 0, 0.0, 1.0 + 1e-12).unwrap();
        let mut c = Interval::new(0, 0, 0.0, 1.0).unwrap();
        c.order = 20;
        let combined = combine_intervals(&[a, b, c], 1e-10, 1e-10);
        assert_eq!(combined.len(), 2);
        assert_eq!(combined[0].leads, vec![0, 1]);
        assert_eq!(combined[1].order, 20);
    }

    #[test]
    fn task_weights_integrate_the_velocity() {
        // sum_k w_k v(k) f(E) / 2pi over (0, pi/2) equals
        // (E(pi/2) - E(0)) / 2pi = 2 / 2pi
        let (spectra, occupations) = two_lead_setup();
        let refs: Vec<&dyn Spectrum>
            = spectra.iter().map(|sp| sp as &dyn Spectrum).collect();
        let intervals
            = vec![Interval::new(0, 0, 1e-12, PI / 2.0).unwrap()];
        let tasks = calc_tasks(
            &intervals, &refs, &occupations, 0, DEFAULT_WEIGHT_TOL).unwrap();
        assert_eq!(tasks.len(), 21);
        let total: f64 = tasks.values().map(|t| t.weight[1]).sum();
        assert!((total - 1.0 / PI).abs() < 1e-6);
        // keys ascend from the offset, node data is consistent
        let keys: Vec<usize> = tasks.keys().copied().collect();
        assert_eq!(keys, (0..21).collect::<Vec<usize>>());
        for task in tasks.values() {
            assert_eq!(task.lead, Some(0));
            assert_eq!(task.mode, Some(0));
            let k = task.momentum.unwrap();
            assert!((task.energy + 2.0 * k.cos()).abs() < 1e-9);
            assert!(
                (task.weight[1] - task.math_weight[1] * task.phys_weight)
                    .abs() < 1e-15
            );
        }
    }

    #[test]
    fn negligible_weights_are_dropped() {
        // left movers are closed modes with zero weight at T = 0 above mu
        let spectra = vec![CosineBand::new(0.0, 1.0)];
        let refs: Vec<&dyn Spectrum>
            = spectra.iter().map(|sp| sp as &dyn Spectrum).collect();
        // occupied nowhere: mu below the band bottom
        let occupations
            = vec![lead_occupation(-5.0, 0.0, None, None).unwrap()];
        let intervals = vec![Interval::new(0, 0, 0.1, 1.0).unwrap()];
        let tasks = calc_tasks(
            &intervals, &refs, &occupations, 0, DEFAULT_WEIGHT_TOL).unwrap();
        assert!(tasks.is_empty());
    }
}
