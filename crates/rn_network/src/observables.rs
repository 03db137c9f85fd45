use serde::{Serialize, Deserialize};

use rn_structure::MolGraph;
use rn_structure::StructureError;

use crate::Species;
use crate::distinct_images;
use crate::embeddings_into;
use crate::matches;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservableKind {
    /// Number of distinct pattern matches per species.
    Molecules,
    /// 1 for every species matching any of the patterns.
    Species,
}

#[derive(Debug, Clone)]
pub struct Observable {
    name: String,
    kind: ObservableKind,
    patterns: Vec<MolGraph>,
}

impl Observable {
    pub fn new(name: &str, kind: ObservableKind, patterns: Vec<MolGraph>) -> Self {
        Self { name: name.to_string(), kind, patterns }
    }

    pub fn from_notation(name: &str, kind: ObservableKind, patterns: &[&str]) -> Result<Self, StructureError> {
        let patterns = patterns.iter()
            .map(|p| p.parse())
            .collect::<Result<Vec<MolGraph>, _>>()?;
        Ok(Self::new(name, kind, patterns))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ObservableKind {
        self.kind
    }

    pub fn patterns(&self) -> &[MolGraph] {
        &self.patterns
    }

    /// Weight of one species.
    pub fn weight(&self, species: &Species) -> f64 {
        match self.kind {
            ObservableKind::Molecules => self.patterns.iter()
                .map(|p| distinct_images(&embeddings_into(p, species.graph())).len())
                .sum::<usize>() as f64,
            ObservableKind::Species => {
                if self.patterns.iter().any(|p| matches(p, species.graph())) { 1. } else { 0. }
            }
        }
    }

    /// Non-zero weights as (species index, weight).
    pub fn weights(&self, species: &[Species]) -> Vec<(usize, f64)> {
        species.iter().enumerate()
            .map(|(i, s)| (i, self.weight(s)))
            .filter(|&(_, w)| w != 0.)
            .collect()
    }
}

/// Observables with their weights resolved against a species list.
#[derive(Debug, Clone, Default)]
pub struct ResolvedObservables {
    names: Vec<String>,
    weights: Vec<Vec<(usize, f64)>>,
}

impl ResolvedObservables {
    pub fn resolve(observables: &[Observable], species: &[Species]) -> Self {
        Self {
            names: observables.iter().map(|o| o.name().to_string()).collect(),
            weights: observables.iter().map(|o| o.weights(species)).collect(),
        }
    }

    /// Observables given directly as sparse (species index, weight) lists.
    pub fn from_weights(names: Vec<String>, weights: Vec<Vec<(usize, f64)>>) -> Result<Self, String> {
        if names.len() != weights.len() {
            return Err(format!("{} observable names for {} weight lists", names.len(), weights.len()));
        }
        Ok(Self { names, weights })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn weights(&self) -> &[Vec<(usize, f64)>] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Observable values for a vector of species concentrations.
    pub fn evaluate(&self, concentrations: &[f64]) -> Vec<f64> {
        self.weights.iter()
            .map(|w| w.iter().map(|&(i, x)| x * concentrations[i]).sum())
            .collect()
    }
}
