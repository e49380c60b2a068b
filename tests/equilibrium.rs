//! End-to-end check of the full pipeline on a uniform chain.
//!
//! At `mu = 0`, `T = 0` half the cosine band is occupied and both leads
//! together fill every site to a density of one half. The density must
//! hold at the initial time, survive an evolution without perturbation,
//! and respond to an onsite quench without breaking mirror symmetry.

use std::rc::Rc;
use ndarray as nd;
use num_complex::Complex64 as C64;
use manybody_sim::chain::UniformChain;
use manybody_sim::manybody::State;
use manybody_sim::onebody::Perturbation;
use manybody_sim::spectrum::Spectrum;
use manybody_sim::system::Density;

const NUM_SITES: usize = 5;

fn chain_state(
    tmax: f64,
    w: Option<Perturbation>,
    refine: bool,
) -> State
{
    let chain = UniformChain::new(NUM_SITES, 0.0, 1.0);
    let mut builder = State::builder(
        chain.system(),
        vec![Rc::new(chain.spectrum()) as Rc<dyn Spectrum>; 2],
        Rc::new(chain),
    )
        .tmax(tmax)
        .refine(refine);
    if let Some(w) = w {
        builder = builder.perturbation(w);
    }
    builder.build().expect("state construction failed")
}

#[test]
fn equilibrium_density_half_per_site() {
    let state = chain_state(10.0, None, false);
    let density = state.evaluate(&Density, None).unwrap();
    assert_eq!(density.len(), NUM_SITES);
    for (j, d) in density.iter().enumerate() {
        assert!(
            (d - 0.5).abs() < 1e-2,
            "site {}: density {} deviates from 1/2", j, d,
        );
    }
}

#[test]
fn equilibrium_density_is_time_independent() {
    let mut state = chain_state(10.0, None, false);
    let before = state.evaluate(&Density, None).unwrap();
    state.evolve(5.0).unwrap();
    let after = state.evaluate(&Density, None).unwrap();
    for (b, a) in before.iter().zip(after.iter()) {
        assert!((b - a).abs() < 1e-8, "{} vs {}", b, a);
    }
}

#[test]
fn refinement_does_not_grow_the_error() {
    let mut state = chain_state(10.0, None, false);
    let err0 = state.estimate_error(None).unwrap();
    let report
        = state.refine_intervals(1e-5, 1e-5, 2000, None, None).unwrap();
    assert!(report.abserr <= err0 + 1e-12);
    assert!(report.abserr <= 1e-5);
    // the density is unchanged by re-partitioning
    let density = state.evaluate(&Density, None).unwrap();
    for d in density.iter() {
        assert!((d - 0.5).abs() < 1e-2);
    }
}

#[test]
fn onsite_quench_depletes_the_perturbed_site() {
    // a smoothly switched repulsive shift on the middle site pushes
    // density out; the mirror symmetry of the chain survives
    let ramp = |t: f64| if t <= 0.0 { 0.0 } else { 1.0 - (-t / 0.5).exp() };
    let w: Perturbation = Rc::new(move |t: f64| {
        let mut m: nd::Array2<C64> = nd::Array2::zeros((NUM_SITES, NUM_SITES));
        m[[NUM_SITES / 2, NUM_SITES / 2]] = C64::from(0.3 * ramp(t));
        m
    });
    let mut state = chain_state(6.0, Some(w), false);
    let before = state.evaluate(&Density, None).unwrap();
    state.evolve(3.0).unwrap();
    let after = state.evaluate(&Density, None).unwrap();
    // the repulsive shift depletes the perturbed site
    assert!(after[NUM_SITES / 2] < before[NUM_SITES / 2]);
    for j in 0..NUM_SITES {
        assert!(after[j] > 0.0 && after[j] < 1.0);
        // left-right mirror symmetry of geometry and occupation
        assert!(
            (after[j] - after[NUM_SITES - 1 - j]).abs() < 1e-6,
            "density asymmetry at site {}", j,
        );
    }
}
