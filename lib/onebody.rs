//! One-body wavefunctions evolved under a time-dependent perturbation.
//!
//! Scattering states are stored in the deviation convention: with a
//! stationary scattering state `psi_st` at energy `E` of the unperturbed
//! Hamiltonian `H0` and a perturbation `W(t)` on the central region, the
//! dynamical variable is `psibar` with
//!
//! ```text
//! i d/dt psibar = (H0 - E) psibar + W(t) (psibar + psi_st)
//! psi(t) = (psibar + psi_st) * exp(-i E (t - t0))
//! ```
//!
//! so that `psibar` starts at zero and stays smooth. States without a
//! stationary reference (no `psi_st`, no energy) evolve their full
//! wavefunction under `H0 + W(t)` directly.
//!
//! The clock only moves forward; before every step the boundary horizon
//! is checked, after every step the boundary validity of the solution.

use std::rc::Rc;
use ndarray::{ self as nd, s };
use num_complex::Complex64 as C64;
use crate::error::{ EvolveError, ScatteringError };
use crate::system::{ ExtendedSystem, Operator };

/// Time-dependent perturbation on the central region.
pub type Perturbation = Rc<dyn Fn(f64) -> nd::Array2<C64>>;

/// Integrator for the deviation equation of motion.
pub trait Solver {
    /// Advance `psi` from `t0` to `t1` under `d/dt psi = rhs(t, psi)`.
    fn propagate(
        &self,
        rhs: &dyn Fn(f64, &nd::Array1<C64>) -> nd::Array1<C64>,
        psi: nd::Array1<C64>,
        t0: f64,
        t1: f64,
    ) -> nd::Array1<C64>;
}

/// Fixed-step fourth-order Runge-Kutta.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Rk4 {
    /// Upper bound on the step size; the interval is split evenly into
    /// the smallest number of steps respecting it.
    pub dt: f64,
}

impl Default for Rk4 {
    fn default() -> Self { Self { dt: 0.01 } }
}

impl Solver for Rk4 {
    fn propagate(
        &self,
        rhs: &dyn Fn(f64, &nd::Array1<C64>) -> nd::Array1<C64>,
        psi: nd::Array1<C64>,
        t0: f64,
        t1: f64,
    ) -> nd::Array1<C64>
    {
        let span = t1 - t0;
        if span <= 0.0 { return psi; }
        let nsteps = (span / self.dt).ceil().max(1.0) as usize;
        let dt = span / nsteps as f64;
        let mut z = psi;
        let mut t = t0;
        for _ in 0..nsteps {
            let k1: nd::Array1<C64> = rhs(t, &z);
            let k2: nd::Array1<C64>
                = rhs(t + dt / 2.0, &(&z + &(&k1 * C64::from(dt / 2.0))));
            let k3: nd::Array1<C64>
                = rhs(t + dt / 2.0, &(&z + &(&k2 * C64::from(dt / 2.0))));
            let k4: nd::Array1<C64>
                = rhs(t + dt, &(&z + &(&k3 * C64::from(dt))));
            z = &z
                + &(
                    (k1 + k2 * C64::from(2.0) + k3 * C64::from(2.0) + k4)
                    * C64::from(dt / 6.0)
                );
            t += dt;
        }
        z
    }
}

/// A single one-body state over an extended system.
pub struct WaveFunction {
    syst: Rc<ExtendedSystem>,
    w: Option<Perturbation>,
    psibar: nd::Array1<C64>,
    psi_st: Option<nd::Array1<C64>>,
    energy: Option<f64>,
    time: f64,
    time_start: f64,
    solver: Rc<dyn Solver>,
}

impl WaveFunction {
    /// Scattering-state form: `psibar` starts at zero, `psi_st` carries
    /// the equilibrium state at `energy` over the full extended system.
    pub fn from_scattering_state(
        syst: Rc<ExtendedSystem>,
        w: Option<Perturbation>,
        psi_st: nd::Array1<C64>,
        energy: f64,
        time_start: f64,
        solver: Rc<dyn Solver>,
    ) -> Result<Self, EvolveError>
    {
        if psi_st.len() != syst.len() {
            return Err(EvolveError::BadStateLength(
                syst.len(), psi_st.len()));
        }
        let psibar: nd::Array1<C64> = nd::Array1::zeros(syst.len());
        Ok(Self {
            syst, w, psibar,
            psi_st: Some(psi_st),
            energy: Some(energy),
            time: time_start,
            time_start,
            solver,
        })
    }

    /// Plain form: `psi` (central region, zero in the boundaries) evolves
    /// under `H0 + W(t)` with no stationary reference.
    pub fn from_initial_state(
        syst: Rc<ExtendedSystem>,
        w: Option<Perturbation>,
        psi_init: nd::Array1<C64>,
        time_start: f64,
        solver: Rc<dyn Solver>,
    ) -> Result<Self, EvolveError>
    {
        if psi_init.len() != syst.central_len {
            return Err(EvolveError::BadStateLength(
                syst.central_len, psi_init.len()));
        }
        let mut psibar: nd::Array1<C64> = nd::Array1::zeros(syst.len());
        psibar.slice_mut(s![..syst.central_len]).assign(&psi_init);
        Ok(Self {
            syst, w, psibar,
            psi_st: None,
            energy: None,
            time: time_start,
            time_start,
            solver,
        })
    }

    pub fn time(&self) -> f64 { self.time }

    pub fn energy(&self) -> Option<f64> { self.energy }

    /// Advance to `time`. Equal times are a no-op; earlier times and
    /// times beyond the boundary horizon are hard errors.
    pub fn evolve(&mut self, time: f64) -> Result<(), EvolveError> {
        EvolveError::check_forward(self.time, time)?;
        if time == self.time { return Ok(()); }
        if !self.syst.time_is_valid(time) {
            return Err(EvolveError::TimeInvalid(time));
        }
        let syst = Rc::clone(&self.syst);
        let w = self.w.clone();
        let psi_st = self.psi_st.clone();
        let energy = self.energy;
        let c = syst.central_len;
        let rhs = move |t: f64, x: &nd::Array1<C64>| -> nd::Array1<C64> {
            let mut hx: nd::Array1<C64> = syst.hamiltonian.dot(x);
            if let Some(en) = energy {
                hx = hx - x.mapv(|z| z * en);
            }
            if let Some(wt) = w.as_ref() {
                let wmat = wt(t);
                let source: nd::Array1<C64> = match psi_st.as_ref() {
                    Some(st) => (&x.slice(s![..c]) + &st.slice(s![..c]))
                        .to_owned(),
                    None => x.slice(s![..c]).to_owned(),
                };
                let drive = wmat.dot(&source);
                let mut central = hx.slice_mut(s![..c]);
                central += &drive;
            }
            hx.mapv(|z| -C64::i() * z)
        };
        let psibar = std::mem::replace(
            &mut self.psibar, nd::Array1::zeros(0));
        self.psibar
            = self.solver.propagate(&rhs, psibar, self.time, time);
        self.time = time;
        if !self.syst.solution_is_valid(&self.psibar.view()) {
            return Err(EvolveError::SolutionInvalid(time));
        }
        Ok(())
    }

    /// Physical wavefunction on the central region at the current time.
    pub fn psi(&self) -> nd::Array1<C64> {
        let c = self.syst.central_len;
        let mut p: nd::Array1<C64>
            = self.psibar.slice(s![..c]).to_owned();
        if let Some(st) = self.psi_st.as_ref() {
            p += &st.slice(s![..c]);
        }
        if let Some(en) = self.energy {
            let phase = (-C64::i() * en * (self.time - self.time_start))
                .exp();
            p.mapv_inplace(|z| z * phase);
        }
        p
    }

    /// Expectation values of `op` at the current time.
    pub fn evaluate(&self, op: &dyn Operator) -> nd::Array1<f64> {
        op.evaluate(&self.psi().view())
    }
}

/// One open scattering mode at a fixed energy: momentum, group velocity
/// and the stationary wavefunction over the extended system, normalized
/// to unit incoming flux.
#[derive(Clone, Debug)]
pub struct ScatteringState {
    pub momentum: f64,
    pub velocity: f64,
    pub psi: nd::Array1<C64>,
}

/// Stationary scattering solver of the unperturbed open system.
///
/// This is the seam to an external equilibrium solver; the crate ships an
/// analytic implementation for the uniform chain
/// ([`UniformChain`][crate::chain::UniformChain]).
pub trait EquilibriumSolver {
    fn num_leads(&self) -> usize;

    /// Open modes incoming from `lead` at `energy`, ordered by mode
    /// index, with wavefunctions over the full extended system.
    fn scattering_states(
        &self,
        energy: f64,
        lead: usize,
        syst: &ExtendedSystem,
    ) -> Result<Vec<ScatteringState>, ScatteringError>;
}

/// All scattering states incoming from one lead at one energy; a factory
/// for the corresponding dynamical [`WaveFunction`]s.
pub struct ScatteringStates {
    syst: Rc<ExtendedSystem>,
    w: Option<Perturbation>,
    states: Vec<ScatteringState>,
    energy: f64,
    lead: usize,
    time_start: f64,
}

impl ScatteringStates {
    pub fn new(
        solver: &dyn EquilibriumSolver,
        syst: Rc<ExtendedSystem>,
        energy: f64,
        lead: usize,
        w: Option<Perturbation>,
        time_start: f64,
    ) -> Result<Self, ScatteringError>
    {
        if lead >= solver.num_leads() {
            return Err(ScatteringError::BadLead(
                lead, solver.num_leads()));
        }
        let states = solver.scattering_states(energy, lead, &syst)?;
        Ok(Self { syst, w, states, energy, lead, time_start })
    }

    /// Number of open modes.
    pub fn len(&self) -> usize { self.states.len() }

    pub fn is_empty(&self) -> bool { self.states.is_empty() }

    pub fn energy(&self) -> f64 { self.energy }

    pub fn lead(&self) -> usize { self.lead }

    pub fn state(&self, mode: usize) -> Option<&ScatteringState> {
        self.states.get(mode)
    }

    /// Dynamical wavefunction for one open mode.
    pub fn wave_function(&self, mode: usize, solver: Rc<dyn Solver>)
        -> Result<WaveFunction, ScatteringError>
    {
        let state = self.states.get(mode)
            .ok_or(ScatteringError::BadMode(mode, self.states.len()))?;
        // the state comes from the same extended system, so the length
        // check cannot fail here
        WaveFunction::from_scattering_state(
            Rc::clone(&self.syst),
            self.w.clone(),
            state.psi.clone(),
            self.energy,
            self.time_start,
            solver,
        ).map_err(|_| ScatteringError::BadMode(mode, self.states.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::Boundary;
    use crate::system::{ Density, OpenSystem };
    use crate::boundary::LeadCell;

    fn two_site_closed() -> Rc<ExtendedSystem> {
        // no leads: the extended system is the central one
        let h = nd::arr2(&[
            [C64::from(0.0), C64::from(-1.0)],
            [C64::from(-1.0), C64::from(0.0)],
        ]);
        let syst = OpenSystem {
            hamiltonian: h,
            leads: Vec::new(),
            interfaces: Vec::new(),
        };
        Rc::new(syst.hamiltonian_with_boundaries(&[]).unwrap())
    }

    fn chain_extended(tmax: f64) -> Rc<ExtendedSystem> {
        let cell = || LeadCell::new(
            nd::Array2::zeros((1, 1)),
            nd::arr2(&[[C64::from(-1.0)]]),
        ).unwrap();
        let mut h: nd::Array2<C64> = nd::Array2::zeros((3, 3));
        for j in 0..2 {
            h[[j, j + 1]] = C64::from(-1.0);
            h[[j + 1, j]] = C64::from(-1.0);
        }
        let syst = OpenSystem {
            hamiltonian: h,
            leads: vec![cell(), cell()],
            interfaces: vec![vec![0], vec![2]],
        };
        Rc::new(syst.hamiltonian_with_boundaries(&[
            Boundary::simple_tmax(tmax).unwrap(),
            Boundary::simple_tmax(tmax).unwrap(),
        ]).unwrap())
    }

    #[test]
    fn rabi_oscillation_two_sites() {
        // H = -sx: |0> -> cos(t) |0> + i sin(t) |1>
        let syst = two_site_closed();
        let mut wf = WaveFunction::from_initial_state(
            syst,
            None,
            nd::arr1(&[C64::from(1.0), C64::from(0.0)]),
            0.0,
            Rc::new(Rk4 { dt: 1e-3 }),
        ).unwrap();
        wf.evolve(std::f64::consts::PI / 2.0).unwrap();
        let d = wf.evaluate(&Density);
        assert!(d[0].abs() < 1e-6);
        assert!((d[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn forward_only_clock() {
        let syst = two_site_closed();
        let mut wf = WaveFunction::from_initial_state(
            syst,
            None,
            nd::arr1(&[C64::from(1.0), C64::from(0.0)]),
            0.0,
            Rc::new(Rk4::default()),
        ).unwrap();
        wf.evolve(1.0).unwrap();
        // equal time is a no-op
        wf.evolve(1.0).unwrap();
        assert_eq!(wf.time(), 1.0);
        assert!(matches!(
            wf.evolve(0.5),
            Err(EvolveError::BackwardTime(_, _)),
        ));
    }

    #[test]
    fn horizon_is_enforced() {
        let syst = chain_extended(2.0);
        let mut wf = WaveFunction::from_initial_state(
            syst,
            None,
            nd::Array1::zeros(3),
            0.0,
            Rc::new(Rk4::default()),
        ).unwrap();
        wf.evolve(2.5).unwrap();
        assert!(matches!(
            wf.evolve(10.0),
            Err(EvolveError::TimeInvalid(_)),
        ));
    }

    #[test]
    fn stationary_scattering_state_is_stationary() {
        // without perturbation psibar stays zero and |psi| is constant
        let syst = chain_extended(5.0);
        let n = syst.len();
        // plane wave e^{ikx} at E = -2 cos k, k = pi / 2
        let k = std::f64::consts::PI / 2.0;
        let psi_st: nd::Array1<C64> = nd::Array1::from_iter(
            (0..n).map(|x| (C64::i() * k * x as f64).exp())
        );
        let mut wf = WaveFunction::from_scattering_state(
            syst,
            None,
            psi_st,
            0.0,
            0.0,
            Rc::new(Rk4 { dt: 1e-2 }),
        ).unwrap();
        let before = wf.evaluate(&Density);
        wf.evolve(3.0).unwrap();
        let after = wf.evaluate(&Density);
        for (b, a) in before.iter().zip(after.iter()) {
            assert!((b - a).abs() < 1e-8);
        }
    }
}
