use std::sync::Arc;
use ndarray::{Array1, Array2};
use nohash_hasher::IntMap;

use rn_network::Network;
use rn_network::Observable;
use rn_network::Parameters;
use rn_network::RateContext;
use rn_network::RateExpression;
use rn_network::Reaction;
use rn_network::ReactionRate;
use rn_network::ResolvedObservables;

/// Replacement rate expressions, keyed by reaction index.
pub type RateOverrides = IntMap<usize, Arc<dyn RateExpression>>;

/// The mass-action ODE system of a generated network.
///
/// `dy/dt` is the sum over reactions of `k * pf * prod(y[reactants])`,
/// subtracted from every reactant and added to every product, where `k` is
/// the reaction's rate constant (or its override) and `pf` its propensity
/// factor.
pub struct OdeSystem {
    species_names: Vec<String>,
    reactions: Vec<Reaction>,
    observables: ResolvedObservables,
    parameters: Parameters,
    overrides: RateOverrides,
    /// Effective constants of reactions that do not need re-evaluation.
    constants: Vec<Option<f64>>,
}

impl OdeSystem {
    pub fn new(network: &Network, observables: &[Observable], parameters: Parameters) -> Self {
        Self::from_reactions(
            network.species.iter().map(|s| s.canonical().to_string()).collect(),
            network.reactions.clone(),
            ResolvedObservables::resolve(observables, &network.species),
            parameters,
        )
    }

    pub fn from_reactions(
        species_names: Vec<String>,
        reactions: Vec<Reaction>,
        observables: ResolvedObservables,
        parameters: Parameters,
    ) -> Self {
        let mut system = Self {
            species_names,
            reactions,
            observables,
            parameters,
            overrides: IntMap::default(),
            constants: Vec::new(),
        };
        system.refresh_constants();
        system
    }

    pub fn with_overrides(mut self, overrides: RateOverrides) -> Self {
        self.overrides = overrides;
        self.refresh_constants();
        self
    }

    pub fn species_count(&self) -> usize {
        self.species_names.len()
    }

    pub fn species_names(&self) -> &[String] {
        &self.species_names
    }

    pub fn species_index(&self, name: &str) -> Option<usize> {
        self.species_names.iter().position(|s| s == name)
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    pub fn observables(&self) -> &ResolvedObservables {
        &self.observables
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn set_parameter(&mut self, name: &str, value: f64) {
        self.parameters.set(name, value);
        self.refresh_constants();
    }

    fn refresh_constants(&mut self) {
        let ctx = RateContext::new(&self.parameters);
        self.constants = self.reactions.iter().enumerate()
            .map(|(i, r)| match (self.overrides.get(&i), r.rate()) {
                (None, ReactionRate::Constant(k)) => Some(k * r.propensity_factor()),
                // Parameters only change between phases.
                (None, ReactionRate::Dynamic { expression, scale })
                    if !expression.depends_on_state() => {
                    Some(scale * expression.evaluate(&ctx) * r.propensity_factor())
                }
                _ => None,
            })
            .collect();
    }

    fn needs_observables(&self) -> bool {
        !self.observables.is_empty() && self.constants.iter().any(|c| c.is_none())
    }

    /// Effective rate constants (including propensity factors) at time `t`.
    pub fn rate_constants(&self, t: f64, y: &Array1<f64>) -> Vec<f64> {
        let values = match (self.needs_observables(), y.as_slice()) {
            (true, Some(conc)) => self.observables.evaluate(conc),
            (true, None) => self.observables.evaluate(&y.to_vec()),
            (false, _) => Vec::new(),
        };
        let ctx = RateContext {
            time: t,
            parameters: &self.parameters,
            observable_names: self.observables.names(),
            observables: &values,
        };
        self.reactions.iter().enumerate()
            .map(|(i, r)| match self.constants[i] {
                Some(k) => k,
                None => {
                    let k = match self.overrides.get(&i) {
                        Some(expr) => expr.evaluate(&ctx),
                        None => r.rate_constant(&ctx),
                    };
                    k * r.propensity_factor()
                }
            })
            .collect()
    }

    /// Reaction velocities at state `y`.
    pub fn velocities(&self, t: f64, y: &Array1<f64>) -> Vec<f64> {
        self.rate_constants(t, y).into_iter()
            .zip(&self.reactions)
            .map(|(k, r)| r.reactants().iter().fold(k, |v, &s| v * y[s]))
            .collect()
    }

    pub fn derivative(&self, t: f64, y: &Array1<f64>) -> Array1<f64> {
        let mut dy = Array1::zeros(y.len());
        for (v, r) in self.velocities(t, y).into_iter().zip(&self.reactions) {
            if v == 0. {
                continue;
            }
            for &s in r.reactants() {
                dy[s] -= v;
            }
            for &s in r.products() {
                dy[s] += v;
            }
        }
        dy
    }

    /// One-sided finite-difference Jacobian around `(t, y)`, with `f0 = f(t, y)`.
    pub fn jacobian(&self, t: f64, y: &Array1<f64>, f0: &Array1<f64>) -> Array2<f64> {
        let n = y.len();
        let mut jac = Array2::zeros((n, n));
        let mut probe = y.clone();
        for j in 0..n {
            let delta = (f64::EPSILON.sqrt() * y[j].abs()).max(1e-10);
            probe[j] = y[j] + delta;
            let f1 = self.derivative(t, &probe);
            probe[j] = y[j];
            for i in 0..n {
                jac[[i, j]] = (f1[i] - f0[i]) / delta;
            }
        }
        jac
    }
}
