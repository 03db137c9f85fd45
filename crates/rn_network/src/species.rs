use std::fmt;
use ahash::AHashMap;

use rn_structure::Canonicalizer;
use rn_structure::MolGraph;
use rn_structure::StructureError;

/// A concrete species: its graph in canonical order and the canonical string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Species {
    graph: MolGraph,
    canonical: String,
}

impl Species {
    pub fn graph(&self) -> &MolGraph {
        &self.graph
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn molecule_count(&self) -> usize {
        self.graph.molecule_count()
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical)
    }
}

/// Index-addressable species store keyed by canonical string.
#[derive(Debug, Clone, Default)]
pub struct SpeciesTable {
    species: Vec<Species>,
    index: AHashMap<String, usize>,
    canonicalizer: Canonicalizer,
}

impl SpeciesTable {
    pub fn new(canonicalizer: Canonicalizer) -> Self {
        Self {
            species: Vec::new(),
            index: AHashMap::new(),
            canonicalizer,
        }
    }

    pub fn canonical(&self, graph: &MolGraph) -> Result<String, StructureError> {
        self.canonicalizer.canonicalize(graph)
    }

    /// Insert a graph; returns its index and whether it was new.
    pub fn insert(&mut self, graph: &MolGraph) -> Result<(usize, bool), StructureError> {
        let canonical = self.canonical(graph)?;
        self.insert_canonical(canonical)
    }

    /// Insert a species by its canonical string.
    pub fn insert_canonical(&mut self, canonical: String) -> Result<(usize, bool), StructureError> {
        if let Some(&i) = self.index.get(&canonical) {
            return Ok((i, false));
        }
        let graph: MolGraph = canonical.parse()?;
        let i = self.species.len();
        self.index.insert(canonical.clone(), i);
        self.species.push(Species { graph, canonical });
        Ok((i, true))
    }

    pub fn index_of(&self, canonical: &str) -> Option<usize> {
        self.index.get(canonical).copied()
    }

    /// Index of a graph that is isomorphic to `graph`, if present.
    pub fn lookup(&self, graph: &MolGraph) -> Result<Option<usize>, StructureError> {
        Ok(self.index_of(&self.canonical(graph)?))
    }

    pub fn get(&self, i: usize) -> Option<&Species> {
        self.species.get(i)
    }

    pub fn species(&self) -> &[Species] {
        &self.species
    }

    pub fn len(&self) -> usize {
        self.species.len()
    }

    pub fn is_empty(&self) -> bool {
        self.species.is_empty()
    }

    pub fn into_species(self) -> Vec<Species> {
        self.species
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_collapses_isomorphic_graphs() {
        let mut table = SpeciesTable::default();
        let a: MolGraph = "A(x!1,y~P).B(z!1)".parse().unwrap();
        let b: MolGraph = "B(z!4).A(y~P,x!4)".parse().unwrap();
        assert_eq!(table.insert(&a).unwrap(), (0, true));
        assert_eq!(table.insert(&b).unwrap(), (0, false));
        assert_eq!(table.insert(&"A(x,y~P)".parse().unwrap()).unwrap(), (1, true));
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(&b).unwrap(), Some(0));
        assert_eq!(table.get(0).unwrap().canonical(), "A(x!1,y~P).B(z!1)");
        assert_eq!(table.get(0).unwrap().graph().to_string(), "A(x!1,y~P).B(z!1)");
    }
}
