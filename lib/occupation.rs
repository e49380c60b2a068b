//! Thermal occupation of the leads.
//!
//! An [`Occupation`] bundles a distribution function `f(E)` with the energy
//! windows over which a lead contributes to the statistical average and an
//! optional band selection. [`lead_occupation`] builds one for the
//! non-interacting Fermi-Dirac distribution and estimates the energy cutoffs
//! from `f(E)` alone, without band-structure knowledge:
//!
//! - at `T = 0` the distribution is a sharp step and the chemical potential
//!   is a hard upper cutoff;
//! - at `T > 0` an effective upper cutoff `Eeff` is chosen so that
//!   `f(E) <= epsilon` for all `E >= Eeff`;
//! - a user-supplied distribution gets no cutoff at all.
//!
//! `None` inside an energy window means the absence of a bound on that side.

use std::rc::Rc;
use log::info;
use crate::error::OccupationError;

/// Distribution function `f(E)` of a lead.
pub type Distribution = Rc<dyn Fn(f64) -> f64>;

/// Window `f(E) < epsilon` for the finite-temperature Fermi function.
const CUTOFF_EPSILON: f64 = 1e-10;

/// Below this the temperature is treated as exactly zero.
const ZERO_TEMPERATURE_TOL: f64 = 1e-8;

/// Occupation of a single lead.
#[derive(Clone)]
pub struct Occupation {
    /// Distribution function `f(E)`.
    pub distribution: Distribution,
    /// Energy windows `(emin, emax)` contributing to the average; `None`
    /// means unbounded on that side. Windows are not required to be sorted
    /// or disjoint.
    pub energy_range: Vec<(Option<f64>, Option<f64>)>,
    /// Band indices to consider; `None` means all bands.
    pub bands: Option<Vec<usize>>,
}

impl Default for Occupation {
    /// Zero-temperature Fermi-Dirac step at chemical potential zero, over
    /// all bands.
    fn default() -> Self {
        Self {
            distribution: Rc::new(
                |energy| if energy <= 0.0 { 1.0 } else { 0.0 }),
            energy_range: vec![(None, Some(0.0))],
            bands: None,
        }
    }
}

impl Occupation {
    /// Occupation with a caller-supplied distribution. No cutoff is
    /// estimated; missing windows default to a single unbounded one.
    pub fn from_distribution(
        distribution: Distribution,
        energy_range: Option<Vec<(Option<f64>, Option<f64>)>>,
        bands: Option<Vec<usize>>,
    ) -> Result<Self, OccupationError>
    {
        let energy_range = match energy_range {
            Some(ranges) => {
                for (emin, emax) in ranges.iter() {
                    check_window(*emin, *emax)?;
                }
                ranges
            },
            None => vec![(None, None)],
        };
        Ok(Self {
            distribution,
            energy_range,
            bands: normalize_bands(bands),
        })
    }
}

fn check_window(emin: Option<f64>, emax: Option<f64>)
    -> Result<(), OccupationError>
{
    if let (Some(lo), Some(hi)) = (emin, emax) {
        if hi < lo {
            return Err(OccupationError::BadEnergyRange(lo, hi));
        }
    }
    Ok(())
}

fn normalize_bands(bands: Option<Vec<usize>>) -> Option<Vec<usize>> {
    bands.map(|mut b| { b.sort_unstable(); b.dedup(); b })
}

/// Energy above which `1 / (1 + exp(E / T)) < epsilon`.
fn fermi_tail_energy(temperature: f64, epsilon: f64) -> f64 {
    temperature * ((1.0 - epsilon) / epsilon).ln()
}

/// Fermi-Dirac occupation of one lead at chemical potential `mu` and
/// temperature `temperature`.
///
/// `energy_range` overrides the cutoffs estimated by this routine, except
/// that at zero temperature the upper cutoff is always clipped to `mu`.
/// Windows that end up empty after clipping are dropped; if none survive
/// the lead is unoccupied and `None` is returned.
pub fn lead_occupation(
    mu: f64,
    temperature: f64,
    energy_range: Option<&[(Option<f64>, Option<f64>)]>,
    bands: Option<Vec<usize>>,
) -> Result<Option<Occupation>, OccupationError>
{
    if temperature < 0.0 {
        return Err(OccupationError::BadTemperature(temperature));
    }
    let (distribution, effective_emax): (Distribution, f64)
        = if temperature.abs() < ZERO_TEMPERATURE_TOL {
            info!("distribution function: zero-temperature fermi-dirac");
            let f = move |energy: f64| -> f64 {
                if energy <= mu { 1.0 } else { 0.0 }
            };
            (Rc::new(f), mu)
        } else {
            info!("distribution function: finite-temperature fermi-dirac");
            let t = temperature;
            let f = move |energy: f64| -> f64 {
                1.0 / (1.0 + ((energy - mu) / t).exp())
            };
            (Rc::new(f), mu + fermi_tail_energy(temperature, CUTOFF_EPSILON))
        };
    let zero_temperature = temperature.abs() < ZERO_TEMPERATURE_TOL;

    let mut windows: Vec<(Option<f64>, Option<f64>)> = Vec::new();
    match energy_range {
        Some(ranges) => {
            for (emin, emax) in ranges.iter() {
                check_window(*emin, *emax)?;
                let emax = match emax {
                    // the step function vanishes above mu regardless of
                    // any user-given bound
                    Some(hi) if zero_temperature => hi.min(effective_emax),
                    Some(hi) => *hi,
                    None => effective_emax,
                };
                match emin {
                    Some(lo) if *lo >= emax => { },
                    _ => { windows.push((*emin, Some(emax))); },
                }
            }
        },
        None => { windows.push((None, Some(effective_emax))); },
    }
    if windows.is_empty() {
        info!("lead is unoccupied");
        return Ok(None);
    }
    Ok(Some(Occupation {
        distribution,
        energy_range: windows,
        bands: normalize_bands(bands),
    }))
}

/// Hull `(emin, emax)` of a set of windows; `None` propagates as an
/// unbounded side.
fn window_hull(windows: &[(Option<f64>, Option<f64>)])
    -> (Option<f64>, Option<f64>)
{
    let mut lower = Some(f64::INFINITY);
    let mut upper = Some(f64::NEG_INFINITY);
    for (lo, hi) in windows.iter() {
        lower = match (lower, lo) {
            (Some(acc), Some(l)) => Some(acc.min(*l)),
            _ => None,
        };
        upper = match (upper, hi) {
            (Some(acc), Some(h)) => Some(acc.max(*h)),
            _ => None,
        };
    }
    (lower, upper)
}

/// Smallest energy window containing every occupied lead's windows.
///
/// Unoccupied leads (`None` entries) do not contribute. If all leads are
/// unoccupied, or any occupied lead is unbounded on a side, that side of
/// the result is `None`.
pub fn calc_energy_cutoffs(occupations: &[Option<Occupation>])
    -> (Option<f64>, Option<f64>)
{
    let mut lowers: Vec<Option<f64>> = Vec::new();
    let mut uppers: Vec<Option<f64>> = Vec::new();
    for occupation in occupations.iter().flatten() {
        let (lo, hi) = window_hull(&occupation.energy_range);
        lowers.push(lo);
        uppers.push(hi);
    }
    let lower = if lowers.is_empty() || lowers.contains(&None) {
        None
    } else {
        lowers.iter().flatten().copied().reduce(f64::min)
    };
    let upper = if uppers.is_empty() || uppers.contains(&None) {
        None
    } else {
        uppers.iter().flatten().copied().reduce(f64::max)
    };
    (lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_temperature_step() {
        let occ = lead_occupation(0.5, 0.0, None, None).unwrap().unwrap();
        assert_eq!((occ.distribution)(0.4), 1.0);
        assert_eq!((occ.distribution)(0.5), 1.0);
        assert_eq!((occ.distribution)(0.6), 0.0);
        assert_eq!(occ.energy_range, vec![(None, Some(0.5))]);
        assert!(occ.bands.is_none());
    }

    #[test]
    fn zero_temperature_clips_user_cutoff() {
        let ranges = [(Some(-1.0), Some(2.0))];
        let occ = lead_occupation(0.0, 0.0, Some(&ranges), None)
            .unwrap().unwrap();
        assert_eq!(occ.energy_range, vec![(Some(-1.0), Some(0.0))]);
        // a window entirely above mu leaves the lead unoccupied
        let ranges = [(Some(1.0), None)];
        assert!(lead_occupation(0.0, 0.0, Some(&ranges), None)
            .unwrap().is_none());
    }

    #[test]
    fn finite_temperature_cutoff_law() {
        let t = 0.3;
        let occ = lead_occupation(0.0, t, None, None).unwrap().unwrap();
        let emax = occ.energy_range[0].1.unwrap();
        assert!((emax - t * ((1.0 - 1e-10_f64) / 1e-10).ln()).abs() < 1e-12);
        // the distribution is indeed negligible at the cutoff
        assert!((occ.distribution)(emax) < 2e-10);
        assert!((occ.distribution)(0.0) == 0.5);
    }

    #[test]
    fn bad_arguments() {
        assert!(lead_occupation(0.0, -1.0, None, None).is_err());
        let ranges = [(Some(2.0), Some(1.0))];
        assert!(lead_occupation(0.0, 0.0, Some(&ranges), None).is_err());
    }

    #[test]
    fn energy_cutoffs_hull() {
        let occ = |ranges: Vec<(Option<f64>, Option<f64>)>| {
            Occupation::from_distribution(
                Rc::new(|_| 1.0), Some(ranges), None).unwrap()
        };
        let occs = vec![
            Some(occ(vec![(None, Some(1.0)), (Some(2.0), Some(3.0))])),
            Some(occ(vec![(Some(-5.0), Some(0.0))])),
        ];
        assert_eq!(calc_energy_cutoffs(&occs), (None, Some(3.0)));
        // unoccupied leads do not contribute
        let occs = vec![None, Some(occ(vec![(Some(-1.0), Some(1.0))]))];
        assert_eq!(calc_energy_cutoffs(&occs), (Some(-1.0), Some(1.0)));
        assert_eq!(calc_energy_cutoffs(&[None]), (None, None));
    }

    #[test]
    fn bands_are_sorted_and_deduplicated() {
        let occ = lead_occupation(0.0, 0.0, None, Some(vec![2, 0, 2, 1]))
            .unwrap().unwrap();
        assert_eq!(occ.bands, Some(vec![0, 1, 2]));
    }
}
