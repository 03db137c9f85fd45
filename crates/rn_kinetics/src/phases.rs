use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use log::info;
use ndarray::Array1;
use serde::{Serialize, Deserialize};

use crate::IntegrationError;
use crate::integrator::Interrupt;
use crate::PhaseContext;
use crate::Simulator;
use crate::timeseries::Timeseries;

/// A species addressed by index or by canonical name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpeciesRef {
    Index(usize),
    Name(String),
}

impl fmt::Display for SpeciesRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeciesRef::Index(i) => write!(f, "S{}", i),
            SpeciesRef::Name(n) => write!(f, "{}", n),
        }
    }
}

/// One integration interval with its output grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationPhase {
    pub t_start: f64,
    pub t_end: f64,
    pub n_steps: usize,
    #[serde(default)]
    pub steady_state: bool,
    #[serde(default)]
    pub stiff: bool,
    #[serde(default)]
    pub continue_from_previous: bool,
    /// Concentrations set before the phase starts.
    #[serde(default)]
    pub concentrations: Vec<(SpeciesRef, f64)>,
    /// Parameter values set before the phase starts. They stay in effect for
    /// later phases.
    #[serde(default)]
    pub parameters: Vec<(String, f64)>,
}

impl SimulationPhase {
    pub fn new(t_start: f64, t_end: f64, n_steps: usize) -> Self {
        Self {
            t_start,
            t_end,
            n_steps,
            steady_state: false,
            stiff: false,
            continue_from_previous: false,
            concentrations: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn with_steady_state(mut self, steady_state: bool) -> Self {
        self.steady_state = steady_state;
        self
    }

    pub fn with_stiff(mut self, stiff: bool) -> Self {
        self.stiff = stiff;
        self
    }

    pub fn continuing(mut self) -> Self {
        self.continue_from_previous = true;
        self
    }

    pub fn set_concentration(mut self, species: SpeciesRef, value: f64) -> Self {
        self.concentrations.push((species, value));
        self
    }

    pub fn set_parameter(mut self, name: &str, value: f64) -> Self {
        self.parameters.push((name.to_string(), value));
        self
    }

    pub fn output_interval(&self) -> f64 {
        (self.t_end - self.t_start) / self.n_steps as f64
    }

    fn output_time(&self, k: usize) -> f64 {
        if k == self.n_steps {
            self.t_end
        } else {
            self.t_start + k as f64 * self.output_interval()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.n_steps == 0 {
            return Err("n_steps must be positive".to_string());
        }
        if !(self.t_start.is_finite() && self.t_end.is_finite()) || self.t_end <= self.t_start {
            return Err(format!("invalid time interval [{}, {}]", self.t_start, self.t_end));
        }
        if let Some((s, v)) = self.concentrations.iter().find(|(_, v)| !v.is_finite() || *v < 0.) {
            return Err(format!("invalid concentration {} for {}", v, s));
        }
        Ok(())
    }
}

impl Simulator {
    /// Integrate through `phases`, starting from `initial` concentrations.
    pub fn simulate(&mut self, initial: &[f64], phases: &[SimulationPhase]) -> Result<Timeseries, IntegrationError> {
        self.simulate_with(initial, phases, None)
    }

    /// Like [`Simulator::simulate`], with a cancellation flag that is polled
    /// at every step.
    ///
    /// A phase that does not continue from the previous one restarts from
    /// `initial` and emits a row at its start time. A continuing phase picks
    /// up the final state of the previous phase and skips that row.
    pub fn simulate_with(
        &mut self,
        initial: &[f64],
        phases: &[SimulationPhase],
        cancel: Option<&AtomicBool>,
    ) -> Result<Timeseries, IntegrationError> {
        let expected = self.system().species_count();
        if initial.len() != expected {
            return Err(IntegrationError::StateLength { found: initial.len(), expected });
        }
        let initial = Array1::from(initial.to_vec());
        let mut y = initial.clone();
        let mut series = Timeseries::new(self.system().observables().names().to_vec());

        for (p, phase) in phases.iter().enumerate() {
            phase.validate()
                .map_err(|reason| IntegrationError::InvalidPhase { phase: p, reason })?;
            let continuing = p > 0 && phase.continue_from_previous;
            if !continuing {
                y = initial.clone();
            }
            for (name, value) in &phase.parameters {
                self.system_mut().set_parameter(name, *value);
            }
            for (species, value) in &phase.concentrations {
                let i = self.resolve(species).ok_or_else(|| IntegrationError::InvalidPhase {
                    phase: p,
                    reason: format!("unknown species {}", species),
                })?;
                y[i] = *value;
            }

            info!("Phase {}: t = {} to {} in {} steps{}{}",
                p, phase.t_start, phase.t_end, phase.n_steps,
                if phase.stiff { ", stiff" } else { "" },
                if phase.steady_state { ", until steady state" } else { "" });
            match self.integrate_phase(phase, &mut y, &mut series, !continuing, cancel) {
                Ok(()) => {}
                Err(Interrupt::Cancelled) => {
                    info!("Integration cancelled in phase {}.", p);
                    return Err(IntegrationError::Cancelled { partial: series });
                }
                Err(Interrupt::Failure(time)) => {
                    return Err(IntegrationError::Failure { time, state: y.to_vec(), partial: series });
                }
            }
        }
        let stats = self.statistics();
        info!("Integration done: {} explicit, {} implicit, {} rejected steps, {} solver switches.",
            stats.explicit_steps, stats.implicit_steps, stats.rejected, stats.switches);
        Ok(series)
    }

    fn resolve(&self, species: &SpeciesRef) -> Option<usize> {
        match species {
            SpeciesRef::Index(i) => (*i < self.system().species_count()).then_some(*i),
            SpeciesRef::Name(name) => self.system().species_index(name),
        }
    }

    fn integrate_phase(
        &mut self,
        phase: &SimulationPhase,
        y: &mut Array1<f64>,
        series: &mut Timeseries,
        emit_initial: bool,
        cancel: Option<&AtomicBool>,
    ) -> Result<(), Interrupt> {
        let mut ctx = PhaseContext::new(phase.stiff, phase.output_interval(), self.options());
        let mut t = phase.t_start;
        if emit_initial {
            series.push(self.row(t, y));
        }
        let mut frozen = phase.steady_state && self.is_steady(t, y);
        for k in 1..=phase.n_steps {
            let t_out = phase.output_time(k);
            if frozen {
                if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                    return Err(Interrupt::Cancelled);
                }
            } else {
                self.advance(&mut ctx, &mut t, y, t_out, cancel)?;
                if phase.steady_state && self.is_steady(t, y) {
                    info!("Steady state reached at t = {}.", t);
                    frozen = true;
                }
            }
            series.push(self.row(t_out, y));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rn_network::GenerationLimits;
    use rn_network::NetworkGenerator;
    use rn_network::Observable;
    use rn_network::ObservableKind;
    use rn_network::Parameters;
    use rn_network::RateLaw;
    use rn_network::ReactionRule;
    use crate::OdeSystem;
    use crate::SolverOptions;

    /// L + R <-> LR with parameters kon and koff.
    fn binding(kon: f64, koff: f64) -> Simulator {
        let rules = ReactionRule::parse_all(
            "bind", "L(r) + R(l) <-> L(r!1).R(l!1)",
            RateLaw::parameter("kon"), Some(RateLaw::parameter("koff")),
        ).unwrap();
        let seeds = vec!["L(r)".parse().unwrap(), "R(l)".parse().unwrap()];
        let network = NetworkGenerator::new(rules, GenerationLimits::default()).generate(&seeds).unwrap();
        let observables = vec![
            Observable::from_notation("Ltot", ObservableKind::Molecules, &["L()"]).unwrap(),
            Observable::from_notation("Rtot", ObservableKind::Molecules, &["R()"]).unwrap(),
            Observable::from_notation("LR", ObservableKind::Species, &["L(r!1).R(l!1)"]).unwrap(),
        ];
        let params: Parameters = [("kon", kon), ("koff", koff)].into_iter().collect();
        Simulator::new(OdeSystem::new(&network, &observables, params), SolverOptions::default())
    }

    fn initial(sim: &Simulator, l: f64, r: f64) -> Vec<f64> {
        let mut y = vec![0.; sim.system().species_count()];
        y[sim.system().species_index("L(r)").unwrap()] = l;
        y[sim.system().species_index("R(l)").unwrap()] = r;
        y
    }

    fn assert_conserved(sim: &Simulator, series: &Timeseries, l0: f64, r0: f64) {
        let atol = sim.options().atol;
        for (l, r) in series.observable("Ltot").unwrap().into_iter()
            .zip(series.observable("Rtot").unwrap()) {
            assert!((l - l0).abs() <= atol, "Ltot {} vs {}", l, l0);
            assert!((r - r0).abs() <= atol, "Rtot {} vs {}", r, r0);
        }
        assert!(series.rows.iter().all(|row| row.species.iter().all(|&c| c >= 0.)));
    }

    #[test]
    fn test_binding_conserves_mass() {
        for stiff in [false, true] {
            let mut sim = binding(1., 0.1);
            let y0 = initial(&sim, 1., 0.5);
            let phase = SimulationPhase::new(0., 10., 50).with_stiff(stiff);
            let series = sim.simulate(&y0, &[phase]).unwrap();
            assert_eq!(series.len(), 51);
            assert_conserved(&sim, &series, 1., 0.5);
            let lr = series.observable("LR").unwrap();
            assert!(lr[50] > lr[1] && lr[1] > lr[0]);
        }
    }

    #[test]
    fn test_mass_conserved_across_solver_switch() {
        // Fast binding equilibrates within microseconds, so the explicit
        // start has to hand over to the implicit method.
        let mut sim = binding(1e6, 1e5);
        let y0 = initial(&sim, 1., 0.5);
        let series = sim.simulate(&y0, &[SimulationPhase::new(0., 1., 10)]).unwrap();
        let stats = sim.statistics();
        assert!(stats.switches > 0, "{:?}", stats);
        assert!(stats.explicit_steps > 0 && stats.implicit_steps > 0, "{:?}", stats);
        assert_conserved(&sim, &series, 1., 0.5);

        let last = &series.last().unwrap().species;
        let s = sim.system();
        let l = last[s.species_index("L(r)").unwrap()];
        let r = last[s.species_index("R(l)").unwrap()];
        let c = last[s.species_index("L(r!1).R(l!1)").unwrap()];
        assert!((l * r - 0.1 * c).abs() < 1e-5);
    }

    #[test]
    fn test_steady_state_freezes_rows() {
        let mut sim = binding(1., 0.1);
        let y0 = initial(&sim, 1., 0.5);
        let phase = SimulationPhase::new(0., 1000., 100).with_steady_state(true);
        let series = sim.simulate(&y0, &[phase]).unwrap();
        assert_eq!(series.len(), 101);
        assert_eq!(series.rows[99].species, series.rows[100].species);
        assert_eq!(series.last().unwrap().time, 1000.);

        let s = sim.system();
        let last = &series.last().unwrap().species;
        let l = last[s.species_index("L(r)").unwrap()];
        let r = last[s.species_index("R(l)").unwrap()];
        let c = last[s.species_index("L(r!1).R(l!1)").unwrap()];
        assert!((l * r - 0.1 * c).abs() < 1e-5);
    }

    #[test]
    fn test_continuation_reset_and_overrides() {
        let mut sim = binding(1., 0.1);
        let y0 = initial(&sim, 1., 0.5);
        let phases = vec![
            SimulationPhase::new(0., 1., 10),
            SimulationPhase::new(1., 2., 10)
                .continuing()
                .set_parameter("kon", 0.)
                .set_parameter("koff", 0.),
            SimulationPhase::new(0., 1., 10)
                .set_concentration(SpeciesRef::Name("L(r)".to_string()), 2.),
        ];
        let series = sim.simulate(&y0, &phases).unwrap();
        assert_eq!(series.len(), 11 + 10 + 11);

        // Frozen kinetics in the second phase.
        assert_eq!(series.rows[11].time, 1.1);
        assert_eq!(series.rows[10].species, series.rows[20].species);
        assert_ne!(series.rows[0].species, series.rows[10].species);

        // The third phase restarts from the initial state with L = 2.
        let restart = &series.rows[21];
        assert_eq!(restart.time, 0.);
        assert_eq!(restart.observables, vec![2., 0.5, 0.]);
        assert_eq!(series.rows[31].species, restart.species);
    }

    #[test]
    fn test_invalid_phases() {
        let mut sim = binding(1., 0.1);
        let y0 = initial(&sim, 1., 0.5);
        let err = sim.simulate(&y0, &[SimulationPhase::new(1., 1., 10)]).unwrap_err();
        assert!(matches!(err, IntegrationError::InvalidPhase { phase: 0, .. }));
        let unknown = SimulationPhase::new(0., 1., 10).set_concentration(SpeciesRef::Name("X()".to_string()), 1.);
        let err = sim.simulate(&y0, &[SimulationPhase::new(0., 1., 1), unknown]).unwrap_err();
        assert!(matches!(err, IntegrationError::InvalidPhase { phase: 1, .. }));
        assert!(matches!(sim.simulate(&[1.], &[]), Err(IntegrationError::StateLength { found: 1, expected: 3 })));
    }

    #[test]
    fn test_cancellation_returns_partial_rows() {
        let mut sim = binding(1., 0.1);
        let y0 = initial(&sim, 1., 0.5);
        let cancel = AtomicBool::new(true);
        let err = sim.simulate_with(&y0, &[SimulationPhase::new(0., 1., 10)], Some(&cancel)).unwrap_err();
        match err {
            IntegrationError::Cancelled { partial } => {
                assert_eq!(partial.len(), 1);
                assert_eq!(partial.rows[0].time, 0.);
            }
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_failure_keeps_last_state() {
        let mut sim = binding(1., 0.1);
        sim = Simulator::new(
            OdeSystem::from_reactions(
                sim.system().species_names().to_vec(),
                sim.system().reactions().to_vec(),
                sim.system().observables().clone(),
                sim.system().parameters().clone(),
            ),
            SolverOptions { initial_step: Some(1e-9), max_steps: 3, ..Default::default() },
        );
        let y0 = initial(&sim, 1., 0.5);
        match sim.simulate(&y0, &[SimulationPhase::new(0., 1., 1)]).unwrap_err() {
            IntegrationError::Failure { time, state, partial } => {
                assert!(time > 0. && time < 1e-6);
                assert_eq!(partial.len(), 1);
                assert!((state.iter().sum::<f64>() - 1.5).abs() < 1e-6);
            }
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_phase_from_json() {
        let phase: SimulationPhase = serde_json::from_str(
            r#"{"t_start": 0, "t_end": 5, "n_steps": 5, "continue_from_previous": true,
                "concentrations": [["L(r)", 1.5], [2, 0.0]], "parameters": [["kon", 2.0]]}"#
        ).unwrap();
        assert!(phase.continue_from_previous && !phase.stiff);
        assert_eq!(phase.concentrations[0].0, SpeciesRef::Name("L(r)".to_string()));
        assert_eq!(phase.concentrations[1].0, SpeciesRef::Index(2));
        assert_eq!(phase.output_interval(), 1.);
    }
}
