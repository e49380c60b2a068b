//! Collection of all error types.
//!
//! All errors derive [`thiserror::Error`], making them composable when allowed
//! and compatible with application code using [`anyhow`][anyhow].
//!
//! [anyhow]: https://crates.io/crates/anyhow

use thiserror::Error;

/// Returned from [`calc_abscissas_and_weights`][crate::quadrature::calc_abscissas_and_weights].
#[derive(Debug, Error)]
pub enum QuadratureError {
    /// Returned when the lower integration bound is not strictly below the
    /// upper one.
    #[error("integration bounds must satisfy a < b; got a={0}, b={1}")]
    BadBounds(f64, f64),

    /// Returned when the requested number of base points is too small for the
    /// rule.
    #[error("quadrature order must be at least {1} for this rule; got {0}")]
    BadOrder(usize, usize),
}

impl QuadratureError {
    pub(crate) fn check_bounds(a: f64, b: f64) -> Result<(), Self> {
        (a < b).then_some(()).ok_or(Self::BadBounds(a, b))
    }

    pub(crate) fn check_order(n: usize, nmin: usize) -> Result<(), Self> {
        (n >= nmin).then_some(()).ok_or(Self::BadOrder(n, nmin))
    }
}

/// Returned from [`Occupation`][crate::occupation::Occupation] constructors.
#[derive(Debug, Error)]
pub enum OccupationError {
    /// Returned when a temperature below zero is encountered.
    #[error("temperature must be non-negative; got {0}")]
    BadTemperature(f64),

    /// Returned when an energy window has its lower bound at or above its
    /// upper bound.
    #[error("energy range must satisfy emin < emax; got emin={0}, emax={1}")]
    BadEnergyRange(f64, f64),
}

/// Returned from [`Interval`][crate::interval::Interval] construction and the
/// interval-manipulation routines.
#[derive(Debug, Error)]
pub enum IntervalError {
    /// Returned when a momentum or energy window is empty or inverted.
    #[error("interval bounds must satisfy kmin < kmax; got kmin={0}, kmax={1}")]
    BadBounds(f64, f64),

    /// Returned when an interval carries no quadrature points.
    #[error("interval order must be at least 1; got {0}")]
    BadOrder(usize),

    /// Returned when a requested number of subdivisions is zero.
    #[error("number of subintervals must be at least 1; got {0}")]
    BadSplit(usize),

    /// Returned when a per-interval argument list does not match the number
    /// of spectra.
    #[error("per-lead argument length mismatch; expected {0}, got {1}")]
    LeadCount(usize, usize),

    /// Returned when an interval references a band the spectrum does not
    /// have.
    #[error("band index {0} out of range for spectrum with {1} bands")]
    BadBand(usize, usize),

    /// [`QuadratureError`]
    #[error("quadrature error: {0}")]
    Quadrature(#[from] QuadratureError),
}

impl IntervalError {
    pub(crate) fn check_bounds(kmin: f64, kmax: f64) -> Result<(), Self> {
        (kmin < kmax).then_some(()).ok_or(Self::BadBounds(kmin, kmax))
    }

    pub(crate) fn check_lead_count(expected: usize, got: usize)
        -> Result<(), Self>
    {
        (expected == got).then_some(())
            .ok_or(Self::LeadCount(expected, got))
    }
}

/// Returned from [`Boundary`][crate::boundary::Boundary] construction and
/// evaluation.
#[derive(Debug, Error)]
pub enum BoundaryError {
    /// Returned when a boundary is sized with a non-positive cell count.
    #[error("number of boundary cells must be at least 1; got {0}")]
    BadNumCells(usize),

    /// Returned when a simple boundary is sized from a non-positive maximal
    /// time.
    #[error("tmax must be greater than 0; got {0}")]
    BadTmax(f64),

    /// Returned when an absorbing boundary has a non-positive strength.
    #[error("absorbing strength must be greater than 0; got {0}")]
    BadStrength(f64),

    /// Returned when a lead cell Hamiltonian and its hopping have
    /// incompatible shapes.
    #[error("lead cell blocks have incompatible shapes; cell is {0}x{0} but hopping is {1}x{2}")]
    BadLeadCell(usize, usize, usize),

    /// Returned when a hopping matrix has more columns than rows; only
    /// upright-rectangular hoppings can be zero-padded square.
    #[error("lead hopping must have at least as many rows as columns; got {0}x{1}")]
    BadHopping(usize, usize),

    /// Returned when the analytic reflection model is asked for a
    /// monomial of degree zero.
    #[error("monomial degree must be at least 1 for the reflection analysis")]
    BadDegree,
}

impl BoundaryError {
    pub(crate) fn check_num_cells(n: usize) -> Result<(), Self> {
        (n >= 1).then_some(()).ok_or(Self::BadNumCells(n))
    }
}

/// Returned from the dispersion-analysis routines backing
/// [`automatic_boundary`][crate::boundary::automatic_boundary].
///
/// These are consumed internally: any analysis failure downgrades the
/// affected lead to a simple boundary with a logged warning.
#[derive(Debug, Error)]
pub enum SpectrumAnalysisError {
    /// Returned when no momentum point with positive velocity exists inside
    /// the energy window.
    #[error("no propagating mode with positive velocity found in the energy window")]
    NoFastMode,

    /// Returned when no dispersion extremum exists inside the energy window.
    #[error("no dispersion extremum found in the energy window")]
    NoSlowMode,

    /// Returned when a bracketing root search fails to converge.
    #[error("root search failed to converge on [{0}, {1}]")]
    RootFind(f64, f64),

    /// Returned when a root search is started on a bracket without a sign
    /// change.
    #[error("root search bracket [{0}, {1}] does not straddle a zero")]
    BadBracket(f64, f64),

    /// Returned when the reflection model becomes degenerate (e.g. zero
    /// momentum or energy at the evaluation point).
    #[error("degenerate point in reflection analysis: {0}")]
    Degenerate(&'static str),
}

/// Returned from one-body and many-body time evolution.
#[derive(Debug, Error)]
pub enum EvolveError {
    /// Returned when a state is asked to evolve backward in time.
    #[error("cannot evolve backward; state is at t={0} but t={1} was requested")]
    BackwardTime(f64, f64),

    /// Returned when a requested time lies beyond the validity horizon of a
    /// boundary condition.
    #[error("boundary conditions are no longer valid at t={0}")]
    TimeInvalid(f64),

    /// Returned when a solution fails its boundary validity check after a
    /// step.
    #[error("solution failed the boundary validity check at t={0}")]
    SolutionInvalid(f64),

    /// Returned when initial data does not match the extended system size.
    #[error("state length mismatch; system has {0} orbitals but the state has {1}")]
    BadStateLength(usize, usize),
}

impl EvolveError {
    pub(crate) fn check_forward(now: f64, target: f64) -> Result<(), Self> {
        (target >= now).then_some(())
            .ok_or(Self::BackwardTime(now, target))
    }
}

/// Returned from scattering-state construction.
#[derive(Debug, Error)]
pub enum ScatteringError {
    /// Returned when a mode index is at or above the number of open modes.
    #[error("mode index {0} out of range; {1} modes are open at this energy")]
    BadMode(usize, usize),

    /// Returned when a lead index is out of range.
    #[error("lead index {0} out of range for a system with {1} leads")]
    BadLead(usize, usize),

    /// Returned when no mode is open at the requested energy.
    #[error("no open scattering mode at energy {0}")]
    NoOpenMode(f64),
}

/// Returned from the many-body ensemble bookkeeping.
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// Returned when a key is added twice.
    #[error("one-body state key {0} is already present")]
    DuplicateKey(usize),

    /// Returned when a key is looked up but absent.
    #[error("no one-body state with key {0}")]
    UnknownKey(usize),

    /// Returned when the task metadata and the sharded state store disagree.
    #[error("task and state stores are inconsistent: {0}")]
    Inconsistent(&'static str),

    /// Returned when the QUADPACK error estimate is requested on an interval
    /// that does not carry a Gauss-Kronrod rule.
    #[error("error estimate requires a Gauss-Kronrod interval; got {0}")]
    NotKronrod(&'static str),

    /// Returned when attached weights cannot be broadcast against the
    /// ensemble weight shape.
    #[error("weight length mismatch; ensemble carries {0} weights per task, got {1}")]
    BadWeightShape(usize, usize),

    /// [`EvolveError`]
    #[error("evolve error: {0}")]
    Evolve(#[from] EvolveError),

    /// [`IntervalError`]
    #[error("interval error: {0}")]
    Interval(#[from] IntervalError),

    /// [`ScatteringError`]
    #[error("scattering state error: {0}")]
    Scattering(#[from] ScatteringError),

    /// [`BoundaryError`]
    #[error("boundary error: {0}")]
    Boundary(#[from] BoundaryError),
}

/// Returned from the adaptive refinement drivers.
#[derive(Debug, Error)]
pub enum RefineError {
    /// Returned when both tolerances are so small that no target is
    /// attainable.
    #[error("tolerances too small; atol={0}, rtol={1}")]
    BadTolerance(f64, f64),

    /// Returned when the interval limit leaves no room for bisection.
    #[error("interval limit must be greater than 1; got {0}")]
    BadLimit(usize),

    /// [`EnsembleError`]
    #[error("ensemble error: {0}")]
    Ensemble(#[from] EnsembleError),

    /// [`IntervalError`]
    #[error("interval error: {0}")]
    Interval(#[from] IntervalError),

    /// [`EvolveError`]
    #[error("evolve error: {0}")]
    Evolve(#[from] EvolveError),
}

impl RefineError {
    pub(crate) fn check_tolerances(atol: f64, rtol: f64) -> Result<(), Self> {
        (atol > 0.0 || rtol > 50.0 * f64::EPSILON).then_some(())
            .ok_or(Self::BadTolerance(atol, rtol))
    }

    pub(crate) fn check_limit(limit: usize) -> Result<(), Self> {
        (limit > 1).then_some(()).ok_or(Self::BadLimit(limit))
    }
}
