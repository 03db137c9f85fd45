//! Adaptive integration of the mass-action system.
//!
//! Two single-step methods share one stepping loop: classic RK4 with an
//! embedded third-order estimate (explicit mode) and a two-stage Rosenbrock
//! method with a linearly implicit Euler error estimate (implicit mode).
//!
//! The Rosenbrock step is the ROS2 form of Verwer et al. (1999). With
//! gamma = 1/2 + sqrt(3)/6 it is A-stable but not L-stable: the stability
//! function tends to 1 - 1/(2 gamma^2), about -0.73, so very fast modes are
//! damped by that factor per step instead of being removed at once. The
//! embedded error estimate sees the remaining oscillation and shortens the
//! step when it matters.
//!
//! Explicit mode hands over to implicit mode when the step-size cap stays
//! far below the error-controlled step, when explicit steps keep failing at
//! a step size where `h ||J||` shows a stability limit, or when a step
//! produces an unphysical state. Implicit mode hands back once its steps
//! are long and `h ||J||` is small enough for RK4.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use log::{debug, warn};
use ndarray::{Array1, Array2};
use serde::{Serialize, Deserialize};

use crate::LuDecomposition;
use crate::OdeSystem;
use crate::timeseries::TimeRow;
use crate::timeseries::Timeseries;

/// Diagonal coefficient of the Rosenbrock method, 1/2 + sqrt(3)/6.
pub const ROSENBROCK_GAMMA: f64 = 0.788_675_134_594_812_9;

/// Relative growth of a species per step beyond which a step is rejected.
const MAX_GROWTH: f64 = 1e6;

/// `h ||J||` above which a rejected explicit step counts as stability limited.
const STABILITY_BOUND: f64 = 1.;

/// `h ||J||` below which an implicit step may hand back to RK4.
const RETURN_BOUND: f64 = 0.5;

/// Consecutive stiffness signals tolerated before switching to implicit mode.
const MAX_SIGNALS: usize = 3;

#[derive(Debug)]
pub enum IntegrationError {
    /// The step size collapsed while steps were still rejected.
    Failure {
        time: f64,
        state: Vec<f64>,
        partial: Timeseries,
    },
    Cancelled {
        partial: Timeseries,
    },
    InvalidPhase {
        phase: usize,
        reason: String,
    },
    StateLength {
        found: usize,
        expected: usize,
    },
}

impl fmt::Display for IntegrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failure { time, partial, .. } =>
                write!(f, "Integration failed at t = {time} ({} rows recorded)", partial.len()),
            Self::Cancelled { partial } =>
                write!(f, "Integration cancelled ({} rows recorded)", partial.len()),
            Self::InvalidPhase { phase, reason } =>
                write!(f, "Invalid simulation phase {phase}: {reason}"),
            Self::StateLength { found, expected } =>
                write!(f, "Initial state has {found} values, expected {expected}"),
        }
    }
}

impl std::error::Error for IntegrationError {}

impl IntegrationError {
    /// The rows recorded before the error, if any.
    pub fn partial(&self) -> Option<&Timeseries> {
        match self {
            Self::Failure { partial, .. } | Self::Cancelled { partial } => Some(partial),
            _ => None,
        }
    }
}

/// Why a phase stopped before its last output row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Interrupt {
    Failure(f64),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub atol: f64,
    pub rtol: f64,
    /// Largest fraction by which a decreasing species may drop in one
    /// explicit step.
    pub max_relative_change: f64,
    /// Jacobian refresh interval, as a fraction of the output interval.
    pub jacobian_refresh: f64,
    /// First step size; defaults to 1e-3 of the output interval.
    pub initial_step: Option<f64>,
    pub min_step: f64,
    /// Step attempts allowed per output interval.
    pub max_steps: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            atol: 1e-8,
            rtol: 1e-6,
            max_relative_change: 0.5,
            jacobian_refresh: 0.1,
            initial_step: None,
            min_step: 1e-14,
            max_steps: 500_000,
        }
    }
}

impl SolverOptions {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.atol >= 0. && self.rtol >= 0.) || self.atol + self.rtol <= 0. {
            return Err(format!("tolerances must be >= 0 and not both zero (atol {}, rtol {})", self.atol, self.rtol));
        }
        if !(self.max_relative_change > 0.) {
            return Err(format!("max_relative_change must be > 0 (got {})", self.max_relative_change));
        }
        if !(self.jacobian_refresh > 0.) {
            return Err(format!("jacobian_refresh must be > 0 (got {})", self.jacobian_refresh));
        }
        if let Some(h) = self.initial_step.filter(|h| !(*h > 0.)) {
            return Err(format!("initial_step must be > 0 (got {})", h));
        }
        if !(self.min_step > 0.) || self.max_steps == 0 {
            return Err("min_step and max_steps must be > 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverMode {
    Explicit,
    Implicit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatistics {
    pub explicit_steps: usize,
    pub implicit_steps: usize,
    pub rejected: usize,
    pub switches: usize,
    pub factorizations: usize,
}

impl StepStatistics {
    pub fn accepted(&self) -> usize {
        self.explicit_steps + self.implicit_steps
    }
}

#[derive(Debug, Clone)]
struct Factorization {
    lu: LuDecomposition,
    time: f64,
    h: f64,
    /// Infinity norm of the Jacobian.
    norm: f64,
}

/// Solver state of one simulation phase.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    mode: SolverMode,
    stiff: bool,
    h: f64,
    output_interval: f64,
    /// Consecutive explicit steps capped far below the proposed step.
    tight_caps: usize,
    /// Consecutive stability-limited explicit rejections.
    unstable_rejects: usize,
    /// Infinity norm of the last Jacobian evaluated in explicit mode.
    jacobian_norm: Option<f64>,
    /// f(t, y) at the current state, if already known.
    fsal: Option<Array1<f64>>,
    factorization: Option<Factorization>,
}

impl PhaseContext {
    pub fn new(stiff: bool, output_interval: f64, options: &SolverOptions) -> Self {
        Self {
            mode: if stiff { SolverMode::Implicit } else { SolverMode::Explicit },
            stiff,
            h: options.initial_step.unwrap_or(1e-3 * output_interval).min(output_interval),
            output_interval,
            tight_caps: 0,
            unstable_rejects: 0,
            jacobian_norm: None,
            fsal: None,
            factorization: None,
        }
    }

    pub fn mode(&self) -> SolverMode {
        self.mode
    }

    pub fn step_size(&self) -> f64 {
        self.h
    }

    fn switch(&mut self, mode: SolverMode, stats: &mut StepStatistics) {
        if self.mode == mode {
            return;
        }
        self.mode = mode;
        self.tight_caps = 0;
        self.unstable_rejects = 0;
        self.jacobian_norm = None;
        if mode == SolverMode::Implicit {
            self.factorization = None;
        }
        stats.switches += 1;
    }

    fn needs_factorization(&self, t: f64, h: f64, refresh: f64) -> bool {
        match &self.factorization {
            None => true,
            Some(f) => t - f.time > refresh || (h - f.h).abs() > 0.5 * f.h,
        }
    }
}

/// Largest explicit step for which no decreasing species drops by more than
/// `max_change` of its value.
pub(crate) fn step_cap(y: &Array1<f64>, dy: &Array1<f64>, max_change: f64, atol: f64) -> f64 {
    y.iter().zip(dy.iter())
        .filter(|&(_, &d)| d < 0.)
        .map(|(&v, &d)| max_change * (v.abs() + atol) / -d)
        .fold(f64::INFINITY, f64::min)
}

/// False for non-finite values, negative concentrations beyond `atol`, and
/// runaway growth.
pub(crate) fn is_sane(y: &Array1<f64>, y_new: &Array1<f64>, atol: f64) -> bool {
    let scale = y.iter().fold(atol, |m, v| m.max(v.abs()));
    y_new.iter().all(|&v| v.is_finite() && v >= -atol && v.abs() <= MAX_GROWTH * scale)
}

/// RMS of the error scaled by `atol + rtol * max(|y|, |y_new|)`. The scale
/// never drops below the smallest positive normal number, so a zero `atol`
/// on a zero species cannot turn the norm into NaN.
pub(crate) fn error_norm(err: &Array1<f64>, y: &Array1<f64>, y_new: &Array1<f64>, atol: f64, rtol: f64) -> f64 {
    let n = err.len();
    if n == 0 {
        return 0.;
    }
    let sum: f64 = err.iter().zip(y.iter()).zip(y_new.iter())
        .map(|((e, a), b)| {
            let scale = (atol + rtol * a.abs().max(b.abs())).max(f64::MIN_POSITIVE);
            (e / scale).powi(2)
        })
        .sum();
    (sum / n as f64).sqrt()
}

/// Maximum absolute row sum, an upper bound on the spectral radius.
pub(crate) fn norm_inf(m: &Array2<f64>) -> f64 {
    m.rows().into_iter()
        .map(|row| row.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0., f64::max)
}

/// Integrates an [`OdeSystem`] through simulation phases.
pub struct Simulator {
    system: OdeSystem,
    options: SolverOptions,
    stats: StepStatistics,
}

impl Simulator {
    pub fn new(system: OdeSystem, options: SolverOptions) -> Self {
        Self { system, options, stats: StepStatistics::default() }
    }

    pub fn system(&self) -> &OdeSystem {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut OdeSystem {
        &mut self.system
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn statistics(&self) -> StepStatistics {
        self.stats
    }

    pub fn row(&self, t: f64, y: &Array1<f64>) -> TimeRow {
        let species = y.to_vec();
        TimeRow {
            time: t,
            observables: self.system.observables().evaluate(&species),
            species,
        }
    }

    /// True if every |dy_i/dt| is below `max(atol, rtol * |y_i|)`.
    pub fn is_steady(&self, t: f64, y: &Array1<f64>) -> bool {
        let dy = self.system.derivative(t, y);
        dy.iter().zip(y.iter())
            .all(|(d, v)| d.abs() < self.options.atol.max(self.options.rtol * v.abs()))
    }

    fn min_step(&self, t: f64) -> f64 {
        self.options.min_step.max(4. * f64::EPSILON * t.abs())
    }

    /// Classic RK4. Returns the new state, the difference to the embedded
    /// third-order solution and f at the new state.
    fn rk4_step(&self, t: f64, y: &Array1<f64>, k1: &Array1<f64>, h: f64) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
        let f = |t: f64, y: &Array1<f64>| self.system.derivative(t, y);
        let k2 = f(t + 0.5 * h, &(y + &(k1 * (0.5 * h))));
        let k3 = f(t + 0.5 * h, &(y + &(&k2 * (0.5 * h))));
        let k4 = f(t + h, &(y + &(&k3 * h)));
        let y4 = y + &((k1 + &(&k2 * 2.) + &(&k3 * 2.) + &k4) * (h / 6.));
        let k5 = f(t + h, &y4);
        let err = (&k4 - &k5) * (h / 6.);
        (y4, err, k5)
    }

    /// Two-stage Rosenbrock step with a factorized `I - gamma h J`.
    fn rosenbrock_step(&self, t: f64, y: &Array1<f64>, f0: &Array1<f64>, h: f64, lu: &LuDecomposition) -> (Array1<f64>, Array1<f64>) {
        let k1 = lu.solve(f0);
        let y1 = y + &(&k1 * h);
        let f1 = self.system.derivative(t + h, &y1);
        let k2 = lu.solve(&(&f1 - &(&k1 * 2.)));
        let y2 = y + &(&k1 * (1.5 * h)) + &(&k2 * (0.5 * h));
        let err = &y2 - &y1;
        (y2, err)
    }

    /// Advance `(t, y)` to exactly `t_out`.
    pub(crate) fn advance(
        &mut self,
        ctx: &mut PhaseContext,
        t: &mut f64,
        y: &mut Array1<f64>,
        t_out: f64,
        cancel: Option<&AtomicBool>,
    ) -> Result<(), Interrupt> {
        let SolverOptions { atol, rtol, max_relative_change, jacobian_refresh, max_steps, .. } = self.options.clone();
        let refresh = jacobian_refresh * ctx.output_interval;
        let mut attempts = 0;

        while *t < t_out {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                return Err(Interrupt::Cancelled);
            }
            attempts += 1;
            if attempts > max_steps {
                warn!("Step limit of {} reached at t = {}", max_steps, t);
                return Err(Interrupt::Failure(*t));
            }

            let remaining = t_out - *t;
            let (mut h, mut last) = if ctx.h >= remaining { (remaining, true) } else { (ctx.h, false) };
            let mut capped = false;
            let f0 = match &ctx.fsal {
                Some(f) => f.clone(),
                None => self.system.derivative(*t, y),
            };

            let (y_new, err, f_new) = match ctx.mode {
                SolverMode::Explicit => {
                    let cap = step_cap(y, &f0, max_relative_change, atol);
                    if cap < h {
                        // ctx.h is the step error control would take.
                        if cap < 1e-3 * ctx.h {
                            ctx.tight_caps += 1;
                        } else {
                            ctx.tight_caps = 0;
                        }
                        if ctx.tight_caps > MAX_SIGNALS {
                            debug!("Explicit step capped at {:e} (t = {}), switching to implicit solver", cap, t);
                            ctx.switch(SolverMode::Implicit, &mut self.stats);
                            ctx.fsal = Some(f0);
                            continue;
                        }
                        h = cap.max(self.min_step(*t));
                        last = false;
                        capped = true;
                    } else {
                        ctx.tight_caps = 0;
                    }
                    let (y4, err, k5) = self.rk4_step(*t, y, &f0, h);
                    (y4, err, Some(k5))
                }
                SolverMode::Implicit => {
                    if ctx.needs_factorization(*t, h, refresh) {
                        let jac = self.system.jacobian(*t, y, &f0);
                        let norm = norm_inf(&jac);
                        let w = Array2::<f64>::eye(y.len()) - &(jac * (ROSENBROCK_GAMMA * h));
                        match LuDecomposition::factor(w) {
                            Ok(lu) => {
                                self.stats.factorizations += 1;
                                ctx.factorization = Some(Factorization { lu, time: *t, h, norm });
                            }
                            Err(e) => {
                                debug!("{} at t = {} (h = {:e}), halving step", e, t, h);
                                ctx.h = 0.5 * h;
                                ctx.factorization = None;
                                ctx.fsal = Some(f0);
                                if ctx.h < self.min_step(*t) {
                                    return Err(Interrupt::Failure(*t));
                                }
                                continue;
                            }
                        }
                    }
                    let Some(factorization) = &ctx.factorization else {
                        continue;
                    };
                    let (y2, err) = self.rosenbrock_step(*t, y, &f0, h, &factorization.lu);
                    (y2, err, None)
                }
            };

            if !is_sane(y, &y_new, atol) {
                self.stats.rejected += 1;
                if ctx.mode == SolverMode::Explicit {
                    warn!("Unstable explicit step at t = {} (h = {:e}), switching to implicit solver", t, h);
                }
                ctx.switch(SolverMode::Implicit, &mut self.stats);
                ctx.h = 0.25 * h;
                ctx.fsal = Some(f0);
                if ctx.h < self.min_step(*t) {
                    warn!("Step size collapsed at t = {}", t);
                    return Err(Interrupt::Failure(*t));
                }
                continue;
            }

            let e = error_norm(&err, y, &y_new, atol, rtol);
            if e <= 1. {
                *t = if last { t_out } else { *t + h };
                let clamped = y_new.iter().any(|&v| v < 0.);
                *y = y_new.mapv(|v| v.max(0.));
                ctx.fsal = if clamped { None } else { f_new };
                match ctx.mode {
                    SolverMode::Explicit => {
                        self.stats.explicit_steps += 1;
                        if ctx.jacobian_norm.is_none_or(|norm| h * norm <= STABILITY_BOUND) {
                            ctx.unstable_rejects = 0;
                        }
                    }
                    SolverMode::Implicit => self.stats.implicit_steps += 1,
                }
                let growth = if e < 0.1 { 2. } else if e < 0.5 { 1.2 } else { 1. };
                // A capped step says nothing about the error-controlled step.
                let next = if capped { ctx.h } else { (h * growth).min(ctx.output_interval) };
                ctx.h = if last { ctx.h.max(next) } else { next };
                let explicit_stable = ctx.factorization.as_ref()
                    .is_some_and(|f| h * f.norm < RETURN_BOUND);
                if ctx.mode == SolverMode::Implicit && !ctx.stiff && h > 0.05 * ctx.output_interval && explicit_stable {
                    debug!("Implicit step {:e} at t = {}, switching to explicit solver", h, t);
                    ctx.switch(SolverMode::Explicit, &mut self.stats);
                }
            } else {
                self.stats.rejected += 1;
                if ctx.mode == SolverMode::Explicit {
                    let norm = norm_inf(&self.system.jacobian(*t, y, &f0));
                    ctx.jacobian_norm = Some(norm);
                    if h * norm > STABILITY_BOUND {
                        ctx.unstable_rejects += 1;
                    }
                    if ctx.unstable_rejects > MAX_SIGNALS {
                        debug!("Explicit steps stability limited (h ||J|| = {:.2}, t = {}), switching to implicit solver", h * norm, t);
                        ctx.switch(SolverMode::Implicit, &mut self.stats);
                    }
                }
                ctx.h = h * (0.9 / e.sqrt()).max(0.2);
                ctx.fsal = Some(f0);
                if ctx.h < self.min_step(*t) {
                    warn!("Step size collapsed at t = {} (error norm {:e})", t, e);
                    return Err(Interrupt::Failure(*t));
                }
            }
        }
        Ok(())
    }
}
