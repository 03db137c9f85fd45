//! Subgraph embedding of patterns into molecule graphs.
//!
//! Pattern molecules are visited in breadth-first order along pattern bonds:
//! the first molecule of each connected part of the pattern may go to any
//! compatible molecule of the target, every further molecule is forced by
//! the bond that reaches it. Components are assigned injectively per
//! molecule, so symmetric sites (e.g. `L(r,r)`) produce one embedding per
//! choice.

use itertools::Itertools;
use rustc_hash::FxHashSet;

use rn_structure::BondState;
use rn_structure::Component;
use rn_structure::MolGraph;
use rn_structure::Molecule;
use rn_structure::Site;

/// An injective map from a pattern into `graphs[target]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Embedding {
    pub target: usize,
    /// Target molecule of each pattern molecule.
    pub molecules: Vec<usize>,
    /// Target component of each pattern component, per pattern molecule.
    pub components: Vec<Vec<usize>>,
}

impl Embedding {
    /// Target site of a pattern site.
    pub fn site(&self, pattern_site: Site) -> Site {
        Site::new(
            self.molecules[pattern_site.molecule],
            self.components[pattern_site.molecule][pattern_site.component],
        )
    }

    /// Sorted set of target sites covered by the embedding. Molecules
    /// without components are listed with `usize::MAX` as component.
    pub fn image(&self) -> Vec<Site> {
        self.molecules.iter().zip(&self.components)
            .flat_map(|(&m, comps)| {
                let marker = comps.is_empty().then(|| Site::new(m, usize::MAX));
                comps.iter().map(move |&c| Site::new(m, c)).chain(marker)
            })
            .sorted()
            .collect()
    }
}

/// All embeddings of `pattern` into each of `graphs`.
pub fn find_embeddings(pattern: &MolGraph, graphs: &[MolGraph]) -> Vec<Embedding> {
    graphs.iter().enumerate()
        .flat_map(|(target, graph)| {
            embed(pattern, graph).into_iter().map(move |(molecules, components)| Embedding {
                target,
                molecules,
                components,
            })
        })
        .collect()
}

/// Embeddings of `pattern` into a single graph, with `target` set to 0.
pub fn embeddings_into(pattern: &MolGraph, graph: &MolGraph) -> Vec<Embedding> {
    find_embeddings(pattern, std::slice::from_ref(graph))
}

/// True if `pattern` has at least one embedding into `graph`.
pub fn matches(pattern: &MolGraph, graph: &MolGraph) -> bool {
    let mut m = Matcher::new(pattern, graph);
    m.stop_at_first = true;
    m.run();
    !m.found.is_empty()
}

/// Keep one embedding per (target, image) pair.
pub fn distinct_images(embeddings: &[Embedding]) -> Vec<&Embedding> {
    let mut seen = FxHashSet::default();
    embeddings.iter()
        .filter(|e| seen.insert((e.target, e.image())))
        .collect()
}

fn embed(pattern: &MolGraph, graph: &MolGraph) -> Vec<(Vec<usize>, Vec<Vec<usize>>)> {
    let mut m = Matcher::new(pattern, graph);
    m.run();
    m.found
}

/// Visit order: (pattern molecule, the pattern bond that reaches it).
fn visit_order(pattern: &MolGraph) -> Vec<(usize, Option<(Site, usize)>)> {
    let mut order = Vec::with_capacity(pattern.molecule_count());
    for group in pattern.connected_components() {
        let root = group[0];
        let mut seen = vec![false; pattern.molecule_count()];
        seen[root] = true;
        order.push((root, None));
        let mut k = order.len() - 1;
        while k < order.len() {
            let (u, _) = order[k];
            for (ci, p) in pattern.neighbors(u) {
                if !seen[p.molecule] {
                    seen[p.molecule] = true;
                    order.push((p.molecule, Some((Site::new(u, ci), p.component))));
                }
            }
            k += 1;
        }
    }
    order
}

fn molecule_compatible(pm: &Molecule, gm: &Molecule) -> bool {
    pm.name() == gm.name()
        && pm.compartment().is_none_or(|c| gm.compartment() == Some(c))
        && pm.len() <= gm.len()
}

fn component_compatible(pc: &Component, gc: &Component) -> bool {
    if pc.name() != gc.name() {
        return false;
    }
    if let Some(s) = pc.state() {
        if gc.state() != Some(s) {
            return false;
        }
    }
    match pc.bond() {
        BondState::Free => gc.bond() == BondState::Free,
        BondState::Any => true,
        BondState::Occupied | BondState::Bound(_) => gc.bond().is_bound(),
    }
}

struct Matcher<'a> {
    pattern: &'a MolGraph,
    graph: &'a MolGraph,
    order: Vec<(usize, Option<(Site, usize)>)>,
    mol_map: Vec<usize>,
    comp_map: Vec<Vec<usize>>,
    used_mol: Vec<bool>,
    found: Vec<(Vec<usize>, Vec<Vec<usize>>)>,
    stop_at_first: bool,
}

impl<'a> Matcher<'a> {
    fn new(pattern: &'a MolGraph, graph: &'a MolGraph) -> Self {
        Self {
            pattern,
            graph,
            order: visit_order(pattern),
            mol_map: vec![usize::MAX; pattern.molecule_count()],
            comp_map: pattern.molecules().iter().map(|m| vec![usize::MAX; m.len()]).collect(),
            used_mol: vec![false; graph.molecule_count()],
            found: Vec::new(),
            stop_at_first: false,
        }
    }

    fn done(&self) -> bool {
        self.stop_at_first && !self.found.is_empty()
    }

    fn run(&mut self) {
        if self.pattern.is_empty() {
            return;
        }
        if let Some(c) = self.pattern.compartment() {
            if self.graph.compartment() != Some(c) {
                return;
            }
        }
        self.extend(0);
    }

    fn extend(&mut self, k: usize) {
        if self.done() {
            return;
        }
        if k == self.order.len() {
            self.found.push((self.mol_map.clone(), self.comp_map.clone()));
            return;
        }
        let (pm, link) = self.order[k];
        let candidates: Vec<usize> = match link {
            None => (0..self.graph.molecule_count()).collect(),
            Some((parent, _)) => {
                let image = Site::new(
                    self.mol_map[parent.molecule],
                    self.comp_map[parent.molecule][parent.component],
                );
                self.graph.partner(image).map(|p| p.molecule).into_iter().collect()
            }
        };
        for gm in candidates {
            if self.used_mol[gm]
                || !molecule_compatible(&self.pattern.molecules()[pm], &self.graph.molecules()[gm])
            {
                continue;
            }
            self.mol_map[pm] = gm;
            self.used_mol[gm] = true;
            let mut used_comp = vec![false; self.graph.molecules()[gm].len()];
            self.assign_components(k, pm, gm, 0, &mut used_comp);
            self.used_mol[gm] = false;
            self.mol_map[pm] = usize::MAX;
            if self.done() {
                return;
            }
        }
    }

    fn assign_components(&mut self, k: usize, pm: usize, gm: usize, j: usize, used: &mut [bool]) {
        if self.done() {
            return;
        }
        let (pattern, graph) = (self.pattern, self.graph);
        let pmol = &pattern.molecules()[pm];
        if j == pmol.len() {
            self.extend(k + 1);
            return;
        }
        let pc = &pmol.components()[j];
        for (gi, gc) in graph.molecules()[gm].components().iter().enumerate() {
            if used[gi] || !component_compatible(pc, gc) {
                continue;
            }
            if let BondState::Bound(p) = pc.bond() {
                let mapped = self.mol_map[p.molecule] != usize::MAX
                    && self.comp_map[p.molecule][p.component] != usize::MAX;
                if mapped {
                    let want = Site::new(self.mol_map[p.molecule], self.comp_map[p.molecule][p.component]);
                    if graph.partner(Site::new(gm, gi)) != Some(want) {
                        continue;
                    }
                }
            }
            used[gi] = true;
            self.comp_map[pm][j] = gi;
            self.assign_components(k, pm, gm, j + 1, used);
            self.comp_map[pm][j] = usize::MAX;
            used[gi] = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g(s: &str) -> MolGraph {
        s.parse().unwrap()
    }

    #[test]
    fn test_symmetric_sites_give_separate_embeddings() {
        let embs = embeddings_into(&g("L(r)"), &g("L(r,r)"));
        assert_eq!(embs.len(), 2);
        assert_eq!(distinct_images(&embs).len(), 2);
        assert_eq!(embeddings_into(&g("L()"), &g("L(r,r)")).len(), 1);
    }

    #[test]
    fn test_bond_constraints() {
        let dimer = g("A(x!1,y).B(z!1)");
        assert_eq!(embeddings_into(&g("A(x)"), &dimer).len(), 0);
        assert_eq!(embeddings_into(&g("A(x!+)"), &dimer).len(), 1);
        assert_eq!(embeddings_into(&g("A(x!?)"), &dimer).len(), 1);
        assert_eq!(embeddings_into(&g("A(y!?)"), &dimer).len(), 1);
        assert_eq!(embeddings_into(&g("A(x!1).B(z!1)"), &dimer).len(), 1);
        assert_eq!(embeddings_into(&g("B(z!1).A(x!1)"), &dimer).len(), 1);
        assert_eq!(embeddings_into(&g("A(y!1).B(z!1)"), &dimer).len(), 0);
    }

    #[test]
    fn test_states_and_compartments() {
        let s = g("@EC::K(a~P,b~U)@PM");
        assert!(matches(&g("K(a~P)"), &s));
        assert!(matches(&g("K(a)"), &s));
        assert!(!matches(&g("K(a~U)"), &s));
        assert!(matches(&g("K()@PM"), &s));
        assert!(!matches(&g("K()@CY"), &s));
        assert!(matches(&g("@EC::K()"), &s));
        assert!(!matches(&g("@CY::K()"), &s));
    }

    #[test]
    fn test_automorphic_embeddings_and_images() {
        let dimer = g("A(x!1).A(x!1)");
        let embs = embeddings_into(&g("A(x!1).A(x!1)"), &dimer);
        assert_eq!(embs.len(), 2);
        assert_eq!(distinct_images(&embs).len(), 1);

        let pair = g("A(x).A(x)");
        let embs = embeddings_into(&g("A()"), &pair);
        assert_eq!(embs.len(), 2);
    }

    #[test]
    fn test_disconnected_pattern_needs_distinct_molecules() {
        let pattern = g("A().A()");
        assert_eq!(embeddings_into(&pattern, &g("A(x)")).len(), 0);
        assert_eq!(embeddings_into(&pattern, &g("A(x!1).A(x!1)")).len(), 2);
    }

    #[test]
    fn test_find_embeddings_targets() {
        let graphs = vec![g("A(x)"), g("B(y)"), g("A(x!1).A(x!1)")];
        let embs = find_embeddings(&g("A()"), &graphs);
        assert_eq!(embs.iter().map(|e| e.target).collect::<Vec<_>>(), vec![0, 2, 2]);

        let e = &embeddings_into(&g("B(y)"), &g("A(x!1).B(y,z!1)"))[0];
        assert_eq!(e.site(Site::new(0, 0)), Site::new(1, 0));
        assert_eq!(e.image(), vec![Site::new(1, 0)]);
    }
}
