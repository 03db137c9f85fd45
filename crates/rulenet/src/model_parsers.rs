use std::fs;
use std::path::Path;
use std::collections::BTreeMap;
use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use serde::{Serialize, Deserialize};

use rn_structure::Canonicalizer;
use rn_structure::MolGraph;
use rn_network::GenerationLimits;
use rn_network::Network;
use rn_network::Observable;
use rn_network::ObservableKind;
use rn_network::Parameters;
use rn_network::RateLaw;
use rn_network::ReactionRule;
use rn_network::RuleConstraints;
use rn_kinetics::SimulationPhase;
use rn_kinetics::SolverOptions;

/// A number, or the name of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueSpec {
    Value(f64),
    Parameter(String),
}

impl ValueSpec {
    pub fn resolve(&self, parameters: &Parameters) -> Result<f64> {
        match self {
            ValueSpec::Value(v) => Ok(*v),
            ValueSpec::Parameter(name) => parameters.get(name)
                .ok_or_else(|| anyhow!("Unknown parameter '{}'", name)),
        }
    }

    /// Constants stay constants; parameters are read at evaluation time.
    pub fn rate_law(&self, parameters: &Parameters) -> Result<RateLaw> {
        match self {
            ValueSpec::Value(v) => Ok(RateLaw::Constant(*v)),
            ValueSpec::Parameter(name) if parameters.contains(name) => Ok(RateLaw::parameter(name)),
            ValueSpec::Parameter(name) => bail!("Unknown rate parameter '{}'", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedSpec {
    pub species: String,
    pub concentration: ValueSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    /// Pattern notation, e.g. `L(r) + R(l) <-> L(r!1).R(l!1)`.
    pub rule: String,
    pub rate: ValueSpec,
    #[serde(default)]
    pub reverse_rate: Option<ValueSpec>,
    #[serde(default)]
    pub delete_molecules: bool,
    #[serde(default)]
    pub max_aggregate_size: Option<usize>,
    #[serde(default)]
    pub max_stoich: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservableSpec {
    pub name: String,
    #[serde(default = "molecules")]
    pub kind: ObservableKind,
    pub patterns: Vec<String>,
}

fn molecules() -> ObservableKind {
    ObservableKind::Molecules
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSpec {
    pub max_species: Option<usize>,
    pub max_reactions: Option<usize>,
    pub max_iterations: Option<usize>,
    pub max_aggregate_size: Option<usize>,
    pub max_stoich: BTreeMap<String, usize>,
}

/// A model as read from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    pub parameters: BTreeMap<String, f64>,
    pub seeds: Vec<SeedSpec>,
    pub rules: Vec<RuleSpec>,
    pub observables: Vec<ObservableSpec>,
    pub limits: LimitsSpec,
    pub phases: Vec<SimulationPhase>,
    pub solver: Option<SolverOptions>,
}

/// A model with parsed seeds, rules and observables.
#[derive(Debug)]
pub struct Model {
    pub parameters: Parameters,
    pub seeds: Vec<MolGraph>,
    pub concentrations: Vec<f64>,
    pub rules: Vec<ReactionRule>,
    pub observables: Vec<Observable>,
    pub limits: GenerationLimits,
    pub phases: Vec<SimulationPhase>,
    pub solver: Option<SolverOptions>,
}

impl ModelSpec {
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("Cannot read model file {}", path.display()))?;
        Self::from_json(&data)
            .with_context(|| format!("Invalid model file {}", path.display()))
    }

    pub fn build(&self) -> Result<Model> {
        let parameters: Parameters = self.parameters.iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();

        let mut seeds = Vec::with_capacity(self.seeds.len());
        let mut concentrations = Vec::with_capacity(self.seeds.len());
        for seed in &self.seeds {
            let graph: MolGraph = seed.species.parse()
                .with_context(|| format!("Invalid seed species '{}'", seed.species))?;
            let c = seed.concentration.resolve(&parameters)?;
            if !c.is_finite() || c < 0. {
                bail!("Invalid concentration {} for seed '{}'", c, seed.species);
            }
            seeds.push(graph);
            concentrations.push(c);
        }

        let mut rules = Vec::new();
        for spec in &self.rules {
            let forward = spec.rate.rate_law(&parameters)?;
            let reverse = spec.reverse_rate.as_ref()
                .map(|r| r.rate_law(&parameters))
                .transpose()?;
            let constraints = RuleConstraints {
                max_aggregate_size: spec.max_aggregate_size,
                max_stoich: spec.max_stoich.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            };
            for rule in ReactionRule::parse_all(&spec.name, &spec.rule, forward, reverse)? {
                let rule = rule.with_constraints(constraints.clone())
                    .with_delete_molecules(spec.delete_molecules)?;
                debug!("Rule {}", rule);
                rules.push(rule);
            }
        }

        let observables = self.observables.iter()
            .map(|o| {
                let patterns: Vec<&str> = o.patterns.iter().map(String::as_str).collect();
                Observable::from_notation(&o.name, o.kind, &patterns)
                    .with_context(|| format!("Invalid observable '{}'", o.name))
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(solver) = &self.solver {
            solver.validate().map_err(|e| anyhow!("Invalid solver options: {}", e))?;
        }

        Ok(Model {
            parameters,
            seeds,
            concentrations,
            rules,
            observables,
            limits: self.limits.to_limits(),
            phases: self.phases.clone(),
            solver: self.solver.clone(),
        })
    }
}

impl LimitsSpec {
    pub fn to_limits(&self) -> GenerationLimits {
        GenerationLimits {
            max_species: self.max_species,
            max_reactions: self.max_reactions,
            max_iterations: self.max_iterations,
            max_aggregate_size: self.max_aggregate_size,
            max_stoich: self.max_stoich.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            ..Default::default()
        }
    }
}

impl Model {
    /// Seed concentrations aligned to the species of `network`. Seeds that
    /// are isomorphic add up.
    pub fn initial_state(&self, network: &Network) -> Result<Vec<f64>> {
        let canonicalizer = Canonicalizer::new(self.limits.max_orbit);
        let mut y = vec![0.; network.species.len()];
        for (seed, c) in self.seeds.iter().zip(&self.concentrations) {
            let canonical = canonicalizer.canonicalize(seed)?;
            let i = network.species_index(&canonical)
                .ok_or_else(|| anyhow!("Seed species {} is not part of the network", canonical))?;
            y[i] += c;
        }
        Ok(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rn_network::NetworkGenerator;

    const MODEL: &str = r#"{
        "parameters": {"kon": 1.0, "koff": 0.1, "L0": 2.0},
        "seeds": [
            {"species": "L(r)", "concentration": "L0"},
            {"species": "R(l)", "concentration": 0.5},
            {"species": "R(l)", "concentration": 0.25}
        ],
        "rules": [
            {"name": "bind", "rule": "L(r) + R(l) <-> L(r!1).R(l!1)", "rate": "kon", "reverse_rate": "koff"}
        ],
        "observables": [
            {"name": "Ltot", "patterns": ["L()"]},
            {"name": "Complex", "kind": "Species", "patterns": ["L(r!1).R(l!1)"]}
        ],
        "limits": {"max_species": 10},
        "phases": [{"t_start": 0, "t_end": 1, "n_steps": 10}]
    }"#;

    #[test]
    fn test_build_model() {
        let model = ModelSpec::from_json(MODEL).unwrap().build().unwrap();
        assert_eq!(model.rules.len(), 2);
        assert_eq!(model.rules[1].name(), "bind_reverse");
        assert_eq!(model.observables[0].kind(), ObservableKind::Molecules);
        assert_eq!(model.limits.max_species, Some(10));
        assert_eq!(model.concentrations, vec![2., 0.5, 0.25]);
        assert!(model.solver.is_none());

        let network = NetworkGenerator::new(model.rules.clone(), model.limits.clone())
            .generate(&model.seeds).unwrap();
        let y0 = model.initial_state(&network).unwrap();
        assert_eq!(y0.len(), 3);
        assert_eq!(y0[network.species_index("R(l)").unwrap()], 0.75);
        assert_eq!(y0[network.species_index("L(r)").unwrap()], 2.);
    }

    #[test]
    fn test_unknown_parameters() {
        let spec = ModelSpec::from_json(&MODEL.replace("\"rate\": \"kon\"", "\"rate\": \"kx\"")).unwrap();
        assert!(spec.build().unwrap_err().to_string().contains("kx"));
        let spec = ModelSpec::from_json(&MODEL.replace("\"L0\"}", "\"L1\"}")).unwrap();
        assert!(spec.build().is_err());
    }

    #[test]
    fn test_solver_options_are_validated() {
        let spec = ModelSpec::from_json(&MODEL.replace("\"limits\"", "\"solver\": {\"atol\": 0, \"rtol\": 1e-4}, \"limits\"")).unwrap();
        let model = spec.build().unwrap();
        assert_eq!(model.solver.unwrap().rtol, 1e-4);
        let spec = ModelSpec::from_json(&MODEL.replace("\"limits\"", "\"solver\": {\"atol\": -1}, \"limits\"")).unwrap();
        assert!(spec.build().unwrap_err().to_string().contains("solver"));
    }

    #[test]
    fn test_invalid_notation() {
        let spec = ModelSpec::from_json(&MODEL.replace("L(r!1).R(l!1)\", \"rate\"", "L(r!1).R(l)\", \"rate\"")).unwrap();
        assert!(spec.build().is_err());
    }
}
