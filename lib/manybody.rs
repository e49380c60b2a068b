//! Many-body ensemble of one-body states and its adaptive refinement.
//!
//! A many-body expectation value is a statistical average over occupied
//! scattering states,
//!
//! ```text
//! <A(t)> = sum_leads int dk/2pi v(k) f(E(k)) <psi_k(t)| A |psi_k(t)>
//! ```
//!
//! discretized by the quadrature intervals of [`crate::interval`]. The
//! [`WaveFunction`] here holds the ensemble: one dynamical one-body state
//! per quadrature node, sharded over the communicator, each carrying the
//! weight rows of its rule. Evaluating an observable sums the outer
//! product `weight (x) expect` over all members and reduces across ranks,
//! so a paired rule yields a low-order and a high-order estimate in one
//! sweep.
//!
//! [`State`] drives the full pipeline (occupations, intervals, boundaries,
//! tasks, initial states) and refines the interval partition adaptively: a
//! globally adaptive loop in the manner of QUADPACK's QAG, bisecting the
//! interval with the worst error estimate until the error bound
//! `max(atol, rtol |result|)` holds elementwise, plus a simpler local
//! variant testing `|G - K|` per interval.

use std::rc::Rc;
use indexmap::IndexMap;
use log::{ debug, info, warn };
use ndarray as nd;
use num_complex::Complex64 as C64;
use rustc_hash::FxHashMap;
use crate::boundary::{ Boundary, automatic_boundary };
use crate::comm::{ Communicator, DistributedMap };
use crate::error::{ EnsembleError, RefineError };
use crate::interval::{
    Interval,
    Task,
    calc_intervals,
    calc_tasks,
    combine_intervals,
    split_interval,
    split_intervals,
};
use crate::occupation::{ Occupation, calc_energy_cutoffs };
use crate::onebody::{
    EquilibriumSolver,
    Perturbation,
    Rk4,
    ScatteringStates,
    Solver,
    WaveFunction as OnebodyWaveFunction,
};
use crate::quadrature::Quadrature;
use crate::spectrum::Spectrum;
use crate::system::{ Density, ExtendedSystem, OpenSystem, Operator };

/// `refl_max` passed to the automatic boundary search by default.
pub const DEFAULT_REFL_MAX: f64 = 1e-6;

/// Monomial degree passed to the automatic boundary search by default.
pub const DEFAULT_DEGREE: usize = 6;

/// Task-pruning tolerance used when intervals are first sampled.
const TASK_TOL: f64 = 1e-10;

/// Ensemble of weighted one-body states.
///
/// Keys are replicated on every rank, states live on their owning rank
/// only; the task table (weights) is replicated so that collective sums
/// need a single reduction.
pub struct WaveFunction {
    states: DistributedMap<OnebodyWaveFunction>,
    tasks: IndexMap<usize, Task>,
    comm: Communicator,
    time: f64,
}

impl WaveFunction {
    pub fn new(comm: Communicator, time: f64) -> Self {
        Self {
            states: DistributedMap::new(comm),
            tasks: IndexMap::new(),
            comm,
            time,
        }
    }

    pub fn comm(&self) -> Communicator { self.comm }

    pub fn time(&self) -> f64 { self.time }

    /// All state keys, in insertion order.
    pub fn keys(&self) -> &[usize] { self.states.keys() }

    pub fn len(&self) -> usize { self.states.len() }

    pub fn is_empty(&self) -> bool { self.states.is_empty() }

    /// Smallest integer key above every key in the ensemble.
    pub fn get_free_key(&self) -> usize { self.states.next_free_key() }

    /// Number of weight rows every member carries, or `None` while the
    /// ensemble is empty.
    pub fn weight_len(&self) -> Option<usize> {
        self.tasks.first().map(|(_, task)| task.weight.len())
    }

    pub fn task(&self, key: usize) -> Option<&Task> { self.tasks.get(&key) }

    /// One-body state under `key`, if the calling rank owns it.
    pub fn get_onebody_state(&self, key: usize)
        -> Option<&OnebodyWaveFunction>
    {
        self.states.get(key)
    }

    /// Register one state under `key` (a fresh key when `None`). The
    /// weight row count must match the rest of the ensemble.
    pub fn add_onebody_state(
        &mut self,
        state: OnebodyWaveFunction,
        task: Task,
        key: Option<usize>,
    ) -> Result<usize, EnsembleError>
    {
        if let Some(expected) = self.weight_len() {
            if task.weight.len() != expected {
                return Err(EnsembleError::BadWeightShape(
                    expected, task.weight.len()));
            }
        }
        let key = key.unwrap_or_else(|| self.get_free_key());
        self.states.add(key, move || state)?;
        self.tasks.insert(key, task);
        Ok(key)
    }

    /// Register a batch of states already sharded by key.
    pub fn add_distributed_onebody_states(
        &mut self,
        states: Vec<(usize, OnebodyWaveFunction, Task)>,
    ) -> Result<(), EnsembleError>
    {
        for (key, state, task) in states.into_iter() {
            self.add_onebody_state(state, task, Some(key))?;
        }
        self.check_consistency()
    }

    /// Register externally computed bound states. No key may collide
    /// with a stored state; single-row weights are broadcast over the
    /// ensemble's weight rows.
    pub fn add_boundstates(
        &mut self,
        states: Vec<(usize, OnebodyWaveFunction, Task)>,
    ) -> Result<(), EnsembleError>
    {
        for (key, _, _) in states.iter() {
            if self.tasks.contains_key(key) {
                return Err(EnsembleError::DuplicateKey(*key));
            }
        }
        let rows = self.weight_len().unwrap_or(1);
        let states: Vec<(usize, OnebodyWaveFunction, Task)>
            = states.into_iter()
            .map(|(key, psi, mut task)| {
                if task.weight.len() == 1 && rows != 1 {
                    task.weight
                        = nd::Array1::from_elem(rows, task.weight[0]);
                    task.math_weight
                        = nd::Array1::from_elem(rows, task.math_weight[0]);
                }
                (key, psi, task)
            })
            .collect();
        self.add_distributed_onebody_states(states)
    }

    pub fn delete_onebody_state(&mut self, key: usize)
        -> Result<(), EnsembleError>
    {
        self.states.delete(key)?;
        self.tasks.shift_remove(&key);
        Ok(())
    }

    /// Keys must be unique and the task table must mirror the state store
    /// exactly.
    pub fn check_consistency(&self) -> Result<(), EnsembleError> {
        self.states.check_consistency()?;
        if self.states.len() != self.tasks.len()
            || self.states.keys().iter()
                .any(|key| !self.tasks.contains_key(key))
        {
            return Err(EnsembleError::Inconsistent(
                "task table does not mirror the state store"));
        }
        Ok(())
    }

    /// Advance every member to `time`. A member failing its boundary
    /// checks aborts the collective step.
    pub fn evolve(&mut self, time: f64) -> Result<(), EnsembleError> {
        for (_, psi) in self.states.local_iter_mut() {
            psi.evolve(time)?;
        }
        self.time = time;
        Ok(())
    }

    /// Weighted sum `sum_key weight (x) <observable>` over the selected
    /// keys (all local keys when `None`), reduced over all ranks. Row `r`
    /// of the result belongs to weight row `r` of the quadrature rules.
    ///
    /// With `root = Some(r)` only rank `r` receives the result; `None`
    /// delivers it everywhere.
    pub fn evaluate_keyed(
        &self,
        observable: &dyn Operator,
        keys: Option<&[usize]>,
        root: Option<usize>,
    ) -> Option<nd::Array2<f64>>
    {
        let integral = self.local_integral(observable, keys);
        match root {
            Some(r) => self.comm.reduce(integral, r),
            None => Some(self.comm.allreduce(integral)),
        }
    }

    /// Expectation value of `observable` over the whole ensemble.
    pub fn evaluate(&self, observable: &dyn Operator, root: Option<usize>)
        -> Option<nd::Array2<f64>>
    {
        self.evaluate_keyed(observable, None, root)
    }

    /// Local part of the weighted sum; shape `(0, 0)` when no selected
    /// state lives on this rank.
    fn local_integral(
        &self,
        observable: &dyn Operator,
        keys: Option<&[usize]>,
    ) -> nd::Array2<f64>
    {
        let mut integral: Option<nd::Array2<f64>> = None;
        for (key, psi) in self.states.local_iter() {
            if let Some(selected) = keys {
                if !selected.contains(&key) { continue; }
            }
            let expect = psi.evaluate(observable);
            let weight = &self.tasks[&key].weight;
            let acc = integral.get_or_insert_with(
                || nd::Array2::zeros((weight.len(), expect.len())));
            for (r, w) in weight.iter().enumerate() {
                for (j, e) in expect.iter().enumerate() {
                    acc[[r, j]] += w * e;
                }
            }
        }
        integral.unwrap_or_else(|| nd::Array2::zeros((0, 0)))
    }

    /// Like [`Self::evaluate_keyed`] with `root = None`, additionally
    /// returning the physical integrand `phys_weight * <observable>` per
    /// selected local key.
    fn evaluate_with_integrand(
        &self,
        observable: &dyn Operator,
        keys: &[usize],
    ) -> (nd::Array2<f64>, FxHashMap<usize, nd::Array1<f64>>)
    {
        let mut integrand: FxHashMap<usize, nd::Array1<f64>>
            = FxHashMap::default();
        for (key, psi) in self.states.local_iter() {
            if !keys.contains(&key) { continue; }
            let expect = psi.evaluate(observable);
            let phys = self.tasks[&key].phys_weight;
            integrand.insert(key, expect.mapv(|e| phys * e));
        }
        let integral = self.comm.allreduce(
            self.local_integral(observable, Some(keys)));
        (integral, integrand)
    }
}

/// Outcome of a global refinement pass.
pub struct RefinementReport {
    /// Maximal element of the summed interval errors; bounded by
    /// `max(atol, rtol |result|)` elementwise when the pass converged.
    pub abserr: f64,
    /// All Gauss-Kronrod intervals after refinement, worst error first.
    pub intervals: Vec<Interval>,
    /// Elementwise error estimates, ordered like `intervals`.
    pub errors: Vec<nd::Array1<f64>>,
}

/// Builder for [`State`]; all pipeline stages can be overridden before
/// [`StateBuilder::build`].
pub struct StateBuilder {
    syst: OpenSystem,
    spectra: Vec<Rc<dyn Spectrum>>,
    equilibrium: Rc<dyn EquilibriumSolver>,
    w: Option<Perturbation>,
    tmax: Option<f64>,
    boundaries: Option<Vec<Boundary>>,
    occupations: Option<Vec<Option<Occupation>>>,
    intervals: Option<Vec<Interval>>,
    solver: Rc<dyn Solver>,
    error_op: Rc<dyn Operator>,
    refine: bool,
    combine: bool,
    refl_max: f64,
    degree: usize,
    time_start: f64,
    comm: Communicator,
}

impl StateBuilder {
    /// Start from an open system, the spectra of its leads (in lead
    /// order) and a stationary scattering solver for the unperturbed
    /// Hamiltonian.
    pub fn new(
        syst: OpenSystem,
        spectra: Vec<Rc<dyn Spectrum>>,
        equilibrium: Rc<dyn EquilibriumSolver>,
    ) -> Self
    {
        Self {
            syst,
            spectra,
            equilibrium,
            w: None,
            tmax: None,
            boundaries: None,
            occupations: None,
            intervals: None,
            solver: Rc::new(Rk4::default()),
            error_op: Rc::new(Density),
            refine: true,
            combine: false,
            refl_max: DEFAULT_REFL_MAX,
            degree: DEFAULT_DEGREE,
            time_start: 0.0,
            comm: Communicator::local(),
        }
    }

    /// Perturbation `W(t)` on the central region.
    pub fn perturbation(mut self, w: Perturbation) -> Self {
        self.w = Some(w);
        self
    }

    /// Horizon for automatically chosen boundaries; mutually exclusive
    /// with [`Self::boundaries`].
    pub fn tmax(mut self, tmax: f64) -> Self {
        self.tmax = Some(tmax);
        self
    }

    /// Explicit boundary conditions, one per lead; mutually exclusive
    /// with [`Self::tmax`].
    pub fn boundaries(mut self, boundaries: Vec<Boundary>) -> Self {
        self.boundaries = Some(boundaries);
        self
    }

    /// Lead occupations. A single entry is broadcast over all leads, a
    /// `None` entry marks an unoccupied lead. Default: `mu = 0`, `T = 0`
    /// Fermi-Dirac everywhere.
    pub fn occupations(mut self, occupations: Vec<Option<Occupation>>)
        -> Self
    {
        self.occupations = Some(occupations);
        self
    }

    /// Quadrature intervals to use instead of computing them from the
    /// occupations.
    pub fn intervals(mut self, intervals: Vec<Interval>) -> Self {
        self.intervals = Some(intervals);
        self
    }

    pub fn solver(mut self, solver: Rc<dyn Solver>) -> Self {
        self.solver = solver;
        self
    }

    /// Observable used for quadrature error estimates. Default:
    /// [`Density`].
    pub fn error_op(mut self, error_op: Rc<dyn Operator>) -> Self {
        self.error_op = error_op;
        self
    }

    /// Refine the initial interval partition before returning; on by
    /// default.
    pub fn refine(mut self, refine: bool) -> Self {
        self.refine = refine;
        self
    }

    /// Merge intervals that differ only in the lead index; off by
    /// default.
    pub fn combine(mut self, combine: bool) -> Self {
        self.combine = combine;
        self
    }

    /// Target reflection for the automatic boundary search.
    pub fn refl_max(mut self, refl_max: f64) -> Self {
        self.refl_max = refl_max;
        self
    }

    /// Monomial degree for the automatic boundary search.
    pub fn degree(mut self, degree: usize) -> Self {
        self.degree = degree;
        self
    }

    pub fn time_start(mut self, time_start: f64) -> Self {
        self.time_start = time_start;
        self
    }

    pub fn comm(mut self, comm: Communicator) -> Self {
        self.comm = comm;
        self
    }

    pub fn build(self) -> Result<State, RefineError> {
        info!("initialize many-body state");
        let occupations = self.occupations
            .unwrap_or_else(|| vec![Some(Occupation::default())]);
        let spectra_refs: Vec<&dyn Spectrum>
            = self.spectra.iter().map(|sp| sp.as_ref()).collect();

        let intervals: Vec<Interval> = match self.intervals {
            Some(intervals) => intervals,
            None => calc_intervals(&spectra_refs, &occupations)
                .map_err(EnsembleError::from)?,
        };
        let intervals = if self.combine {
            combine_intervals(&intervals, 1e-10, 1e-10)
        } else {
            intervals
        };
        if intervals.is_empty() {
            warn!(
                "no occupied states found; the chemical potential is \
                probably wrong");
        } else {
            info!("initial number of intervals={}", intervals.len());
        }

        let boundaries: Vec<Boundary> = match (self.boundaries, self.tmax) {
            (Some(_), Some(_)) => {
                return Err(RefineError::Ensemble(
                    EnsembleError::Inconsistent(
                        "tmax and explicit boundaries are mutually \
                        exclusive")));
            },
            (Some(boundaries), None) => boundaries,
            (None, Some(tmax)) => {
                let (emin, emax) = calc_energy_cutoffs(&occupations);
                automatic_boundary(
                    &spectra_refs, tmax, self.refl_max, self.degree,
                    emin, emax,
                ).map_err(EnsembleError::from)?
            },
            (None, None) => {
                return Err(RefineError::Ensemble(
                    EnsembleError::Inconsistent(
                        "either tmax or explicit boundaries must be \
                        given")));
            },
        };
        let syst = Rc::new(
            self.syst.hamiltonian_with_boundaries(&boundaries)
                .map_err(EnsembleError::from)?
        );

        let mut state = State {
            syst,
            spectra: self.spectra,
            occupations,
            equilibrium: self.equilibrium,
            w: self.w,
            solver: self.solver,
            error_op: self.error_op,
            ensemble: WaveFunction::new(self.comm, self.time_start),
            keys_from_interval: FxHashMap::default(),
            time: self.time_start,
            time_start: self.time_start,
        };
        for interval in intervals.into_iter() {
            state.add_interval(interval, TASK_TOL)?;
        }
        state.ensemble.check_consistency()?;
        if state.ensemble.is_empty() {
            warn!("the many-body ensemble is empty");
        }
        if state.refine_is_sensible() && self.refine {
            state.refine_intervals(1e-5, 1e-5, 2000, None, None)?;
        }
        info!("many-body state initialization done");
        Ok(state)
    }
}

/// Externally computed bound state: a central-region amplitude with its
/// energy and scalar occupation weight.
#[derive(Clone, Debug)]
pub struct BoundState {
    pub psi: nd::Array1<C64>,
    pub energy: f64,
    pub weight: f64,
}

/// Many-body state over an open system: the ensemble plus the interval
/// bookkeeping needed to refine it.
pub struct State {
    syst: Rc<ExtendedSystem>,
    spectra: Vec<Rc<dyn Spectrum>>,
    occupations: Vec<Option<Occupation>>,
    equilibrium: Rc<dyn EquilibriumSolver>,
    w: Option<Perturbation>,
    solver: Rc<dyn Solver>,
    error_op: Rc<dyn Operator>,
    ensemble: WaveFunction,
    keys_from_interval: FxHashMap<Interval, Vec<usize>>,
    time: f64,
    time_start: f64,
}

impl State {
    pub fn builder(
        syst: OpenSystem,
        spectra: Vec<Rc<dyn Spectrum>>,
        equilibrium: Rc<dyn EquilibriumSolver>,
    ) -> StateBuilder
    {
        StateBuilder::new(syst, spectra, equilibrium)
    }

    pub fn time(&self) -> f64 { self.time }

    pub fn system(&self) -> &Rc<ExtendedSystem> { &self.syst }

    pub fn ensemble(&self) -> &WaveFunction { &self.ensemble }

    pub fn ensemble_mut(&mut self) -> &mut WaveFunction {
        &mut self.ensemble
    }

    /// All intervals stored in the solver, ordered by lead set, band and
    /// lower momentum bound.
    pub fn get_intervals(&self) -> Vec<Interval> {
        let mut intervals: Vec<Interval>
            = self.keys_from_interval.keys().cloned().collect();
        intervals.sort_by(|a, b| {
            a.leads.cmp(&b.leads)
                .then(a.band.cmp(&b.band))
                .then(a.kmin.total_cmp(&b.kmin))
        });
        intervals
    }

    /// Advance the whole ensemble to `time`.
    pub fn evolve(&mut self, time: f64) -> Result<(), EnsembleError> {
        self.ensemble.evolve(time)?;
        self.time = time;
        Ok(())
    }

    /// Attach externally computed bound states to the ensemble. The
    /// amplitudes are promoted to dynamical one-body states evolving
    /// under the full Hamiltonian; the scalar weights are broadcast over
    /// the ensemble's weight rows. Keys must not collide with stored
    /// states.
    pub fn add_boundstates(&mut self, boundstates: Vec<(usize, BoundState)>)
        -> Result<(), EnsembleError>
    {
        let mut states: Vec<(usize, OnebodyWaveFunction, Task)>
            = Vec::with_capacity(boundstates.len());
        for (key, boundstate) in boundstates.into_iter() {
            let psi = OnebodyWaveFunction::from_initial_state(
                Rc::clone(&self.syst),
                self.w.clone(),
                boundstate.psi,
                self.time_start,
                Rc::clone(&self.solver),
            )?;
            let task = Task {
                lead: None,
                mode: None,
                energy: boundstate.energy,
                momentum: None,
                weight: nd::arr1(&[boundstate.weight]),
                math_weight: nd::arr1(&[boundstate.weight]),
                phys_weight: 1.0,
            };
            states.push((key, psi, task));
        }
        self.ensemble.add_boundstates(states)?;
        self.ensemble.evolve(self.time)
    }

    /// Expectation value of `observable` at the current time; the
    /// high-order quadrature row. `root` as in
    /// [`WaveFunction::evaluate`].
    pub fn evaluate(&self, observable: &dyn Operator, root: Option<usize>)
        -> Option<nd::Array1<f64>>
    {
        let result = self.ensemble.evaluate(observable, root)?;
        Some(self.high_order_row(observable, &result))
    }

    /// Last row of `result`, falling back to zeros of the observable's
    /// output size when the ensemble is empty.
    fn high_order_row(
        &self,
        observable: &dyn Operator,
        result: &nd::Array2<f64>,
    ) -> nd::Array1<f64>
    {
        match result.nrows() {
            0 => nd::Array1::zeros(self.observable_len(observable)),
            n => result.row(n - 1).to_owned(),
        }
    }

    /// Output length of `observable` on the central region.
    fn observable_len(&self, observable: &dyn Operator) -> usize {
        let probe: nd::Array1<C64>
            = nd::Array1::zeros(self.syst.central_len);
        observable.evaluate(&probe.view()).len()
    }

    /// Sample `interval` into tasks and add the corresponding one-body
    /// scattering states to the ensemble.
    fn add_interval(&mut self, interval: Interval, tol: f64)
        -> Result<(), EnsembleError>
    {
        let spectra_refs: Vec<&dyn Spectrum>
            = self.spectra.iter().map(|sp| sp.as_ref()).collect();
        let tasks = calc_tasks(
            std::slice::from_ref(&interval),
            &spectra_refs,
            &self.occupations,
            self.ensemble.get_free_key(),
            tol,
        )?;
        if tasks.is_empty() {
            debug!("interval carries no tasks, skipping");
            return Ok(());
        }
        let mut keys: Vec<usize> = Vec::with_capacity(tasks.len());
        for (key, task) in tasks.into_iter() {
            let (lead, mode) = match (task.lead, task.mode) {
                (Some(lead), Some(mode)) => (lead, mode),
                _ => return Err(EnsembleError::Inconsistent(
                    "interval task without a lead and mode")),
            };
            debug!(
                "calc scattering state: energy={}, lead={}, mode={}",
                task.energy, lead, mode,
            );
            let factory = ScatteringStates::new(
                self.equilibrium.as_ref(),
                Rc::clone(&self.syst),
                task.energy,
                lead,
                self.w.clone(),
                self.time_start,
            )?;
            let psi = factory.wave_function(mode, Rc::clone(&self.solver))?;
            self.ensemble.add_onebody_state(psi, task, Some(key))?;
            keys.push(key);
        }
        self.keys_from_interval.insert(interval, keys);
        Ok(())
    }

    /// Drop an interval's one-body states from the ensemble.
    fn remove_interval(&mut self, interval: &Interval)
        -> Result<(), EnsembleError>
    {
        let keys = self.keys_from_interval.remove(interval)
            .ok_or(EnsembleError::Inconsistent(
                "interval not stored in the solver"))?;
        for key in keys.into_iter() {
            self.ensemble.delete_onebody_state(key)?;
        }
        Ok(())
    }

    /// QUADPACK QAG error estimate on one Gauss-Kronrod interval:
    ///
    /// ```text
    /// E = Itilde * min(1, (200 |G - K| / Itilde)^1.5)
    /// Itilde = sum_k w_k^K |f(x_k) - K / (b - a)|
    /// ```
    ///
    /// evaluated elementwise over the observable. Also returns the
    /// Kronrod estimate `K`.
    fn error_estimate_quadpack(
        &self,
        interval: &Interval,
        error_op: &dyn Operator,
    ) -> Result<(nd::Array1<f64>, nd::Array1<f64>), EnsembleError>
    {
        if interval.quadrature != Quadrature::Kronrod {
            return Err(EnsembleError::NotKronrod(
                interval.quadrature.name()));
        }
        let nop = self.observable_len(error_op);
        let Some(keys) = self.keys_from_interval.get(interval) else {
            // an interval whose tasks were all pruned carries no weight
            return Ok((nd::Array1::zeros(nop), nd::Array1::zeros(nop)));
        };
        let (estimates, integrand)
            = self.ensemble.evaluate_with_integrand(error_op, keys);
        if estimates.nrows() < 2 {
            return Ok((nd::Array1::zeros(nop), nd::Array1::zeros(nop)));
        }
        let gauss = estimates.row(0);
        let kronrod = estimates.row(1);
        let dk = interval.width();
        let kronrod_scaled = kronrod.mapv(|x| x / dk);
        let mut itilde: nd::Array1<f64> = nd::Array1::zeros(nop);
        for (key, f) in integrand.iter() {
            let wk = self.ensemble.tasks[key].math_weight[1];
            itilde += &(
                (f - &kronrod_scaled).mapv(|x| wk * x.abs())
            );
        }
        let itilde = self.ensemble.comm.allreduce(
            itilde.insert_axis(nd::Axis(0)));
        let error = nd::Array1::from_iter(
            itilde.row(0).iter()
                .zip(gauss.iter().zip(kronrod.iter()))
                .map(|(ik, (g, k))| {
                    if *ik <= 0.0 {
                        0.0
                    } else {
                        let tmp = 200.0 * (g - k).abs() / ik;
                        ik * (tmp * tmp.sqrt()).min(1.0)
                    }
                })
        );
        Ok((error, kronrod.to_owned()))
    }

    /// Elementwise `|G - K|` over one Gauss-Kronrod interval.
    fn error_estimate_gauss_kronrod(
        &self,
        interval: &Interval,
        error_op: &dyn Operator,
    ) -> Result<nd::Array1<f64>, EnsembleError>
    {
        if interval.quadrature != Quadrature::Kronrod {
            return Err(EnsembleError::NotKronrod(
                interval.quadrature.name()));
        }
        let nop = self.observable_len(error_op);
        let Some(keys) = self.keys_from_interval.get(interval) else {
            return Ok(nd::Array1::zeros(nop));
        };
        let estimates = self.ensemble
            .evaluate_keyed(error_op, Some(keys.as_slice()), None)
            .unwrap_or_else(|| nd::Array2::zeros((0, 0)));
        if estimates.nrows() < 2 {
            return Ok(nd::Array1::zeros(nop));
        }
        Ok((&estimates.row(0) - &estimates.row(1)).mapv(f64::abs))
    }

    /// Total quadrature error: the maximal element of the summed
    /// per-interval QUADPACK estimates.
    pub fn estimate_error(&self, error_op: Option<&dyn Operator>)
        -> Result<f64, EnsembleError>
    {
        let op = error_op.unwrap_or(self.error_op.as_ref());
        let mut total: nd::Array1<f64>
            = nd::Array1::zeros(self.observable_len(op));
        for interval in self.kronrod_intervals().iter() {
            let (error, _) = self.error_estimate_quadpack(interval, op)?;
            total += &error;
        }
        Ok(total.iter().copied().fold(0.0, f64::max))
    }

    /// Maximal QUADPACK error per given interval; the intervals must be
    /// stored in the solver.
    pub fn estimate_interval_errors(
        &self,
        intervals: &[Interval],
        error_op: Option<&dyn Operator>,
    ) -> Result<Vec<f64>, EnsembleError>
    {
        let op = error_op.unwrap_or(self.error_op.as_ref());
        intervals.iter()
            .map(|interval| {
                self.error_estimate_quadpack(interval, op)
                    .map(|(error, _)| {
                        error.iter().copied().fold(0.0, f64::max)
                    })
            })
            .collect()
    }

    fn kronrod_intervals(&self) -> Vec<Interval> {
        self.get_intervals()
            .into_iter()
            .filter(|interval| interval.quadrature == Quadrature::Kronrod)
            .collect()
    }

    /// Refinement needs at least one Gauss-Kronrod interval to act on.
    fn refine_is_sensible(&self) -> bool {
        !self.kronrod_intervals().is_empty()
    }

    /// Globally adaptive refinement in the manner of QUADPACK's QAG.
    ///
    /// Repeatedly bisects the Gauss-Kronrod interval with the largest
    /// signed slack `max_j(E_i[j] - errbnd[j])` until the summed errors
    /// satisfy `errsum <= max(atol, rtol |result|)` elementwise, or the
    /// interval count reaches `limit` (logged as a warning). Newly
    /// created member states are evolved to the current time, so the
    /// bound holds at the time of the call.
    ///
    /// `intervals` restricts the refinement to the given subset; every
    /// entry must be stored in the solver. All Gauss-Kronrod intervals
    /// are refined when `None`.
    pub fn refine_intervals(
        &mut self,
        atol: f64,
        rtol: f64,
        limit: usize,
        error_op: Option<Rc<dyn Operator>>,
        intervals: Option<&[Interval]>,
    ) -> Result<RefinementReport, RefineError>
    {
        RefineError::check_tolerances(atol, rtol)?;
        RefineError::check_limit(limit)?;
        let tol = 1e-14_f64.min(0.5 * (atol + rtol));
        let op: Rc<dyn Operator>
            = error_op.unwrap_or_else(|| Rc::clone(&self.error_op));

        let mut intervals: Vec<Interval> = match intervals {
            Some(subset) => {
                for interval in subset.iter() {
                    if !self.keys_from_interval.contains_key(interval) {
                        return Err(RefineError::Ensemble(
                            EnsembleError::Inconsistent(
                                "interval not stored in the solver")));
                    }
                }
                subset.to_vec()
            },
            None => self.kronrod_intervals(),
        };
        let mut results: Vec<nd::Array1<f64>> = Vec::new();
        let mut errors: Vec<nd::Array1<f64>> = Vec::new();
        for interval in intervals.iter() {
            let (error, kronrod)
                = self.error_estimate_quadpack(interval, op.as_ref())?;
            results.push(kronrod);
            errors.push(error);
        }
        let nop = self.observable_len(op.as_ref());
        let mut result: nd::Array1<f64> = nd::Array1::zeros(nop);
        let mut errsum: nd::Array1<f64> = nd::Array1::zeros(nop);
        for (r, e) in results.iter().zip(errors.iter()) {
            result += r;
            errsum += e;
        }

        let mut step: usize = 0;
        loop {
            let errbnd = result.mapv(|r| atol.max(rtol * r.abs()));
            // rank intervals by their worst element relative to the bound
            let slack = |error: &nd::Array1<f64>| -> f64 {
                error.iter()
                    .zip(errbnd.iter())
                    .map(|(e, b)| e - b)
                    .fold(f64::NEG_INFINITY, f64::max)
            };
            let mut order: Vec<usize> = (0..intervals.len()).collect();
            order.sort_by(|i, j| {
                slack(&errors[*j]).total_cmp(&slack(&errors[*i]))
            });
            intervals = order.iter().map(|i| intervals[*i].clone()).collect();
            results = order.iter().map(|i| results[*i].clone()).collect();
            errors = order.iter().map(|i| errors[*i].clone()).collect();

            info!(
                "refinement step={}, max errsum={:e}, min errbnd={:e}, \
                intervals={}",
                step,
                errsum.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                errbnd.iter().copied().fold(f64::INFINITY, f64::min),
                intervals.len(),
            );

            let converged = errsum.iter()
                .zip(errbnd.iter())
                .all(|(e, b)| e <= b);
            if converged {
                info!("refinement converged");
                break;
            }
            if intervals.len() >= limit {
                warn!("maximum number of intervals reached");
                break;
            }

            let worst = intervals.remove(0);
            let result_worst = results.remove(0);
            let error_worst = errors.remove(0);
            let children = split_interval(&worst, 2)
                .map_err(EnsembleError::from)?;
            self.remove_interval(&worst)?;
            for child in children.iter() {
                self.add_interval(child.clone(), tol)?;
            }
            self.ensemble.evolve(self.time)?;
            for child in children.into_iter() {
                let (error, kronrod)
                    = self.error_estimate_quadpack(&child, op.as_ref())?;
                result += &kronrod;
                errsum += &error;
                intervals.push(child);
                results.push(kronrod);
                errors.push(error);
            }
            result -= &result_worst;
            errsum -= &error_worst;
            step += 1;
        }
        let abserr
            = errsum.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Ok(RefinementReport { abserr, intervals, errors })
    }

    /// Locally adaptive refinement: bisect every Gauss-Kronrod interval
    /// whose `|G - K|` exceeds `atol + rtol |total|` elementwise, until
    /// none does or the interval count reaches `limit`.
    pub fn refine_intervals_local(
        &mut self,
        atol: f64,
        rtol: f64,
        limit: usize,
        error_op: Option<Rc<dyn Operator>>,
    ) -> Result<(), RefineError>
    {
        RefineError::check_tolerances(atol, rtol)?;
        RefineError::check_limit(limit)?;
        let tol = 1e-14_f64.min(0.5 * (atol + rtol));
        let op: Rc<dyn Operator>
            = error_op.unwrap_or_else(|| Rc::clone(&self.error_op));

        let mut step: usize = 0;
        loop {
            step += 1;
            let total = self.evaluate(op.as_ref(), None)
                .unwrap_or_else(
                    || nd::Array1::zeros(
                        self.observable_len(op.as_ref())));
            let bound = total.mapv(|x| atol + rtol * x.abs());
            let intervals = self.kronrod_intervals();
            let mut to_refine: Vec<Interval> = Vec::new();
            for interval in intervals.iter() {
                let error = self.error_estimate_gauss_kronrod(
                    interval, op.as_ref())?;
                if error.iter().zip(bound.iter()).any(|(e, b)| e > b) {
                    info!(
                        "refine step={}, max error={:e}, \
                        splitting an interval",
                        step,
                        error.iter().copied().fold(0.0, f64::max),
                    );
                    to_refine.push(interval.clone());
                }
            }
            if to_refine.is_empty() { break; }
            if intervals.len() >= limit {
                warn!("maximum number of intervals reached");
                break;
            }
            info!(
                "refinement step={}, intervals to refine={}, total={}",
                step, to_refine.len(), intervals.len(),
            );
            let mut children: Vec<Interval> = Vec::new();
            for interval in to_refine.iter() {
                self.remove_interval(interval)?;
                children.extend(
                    split_intervals(std::slice::from_ref(interval), 2)
                        .map_err(EnsembleError::from)?
                );
            }
            for child in children.into_iter() {
                self.add_interval(child, tol)?;
            }
            self.ensemble.check_consistency()?;
            self.ensemble.evolve(self.time)?;
        }
        Ok(())
    }
}
