//! The graph edit a rule performs, derived once from its two sides and then
//! replayed on every set of reactant embeddings.
//!
//! Molecules correspond left to right: each product molecule takes the first
//! unused reactant molecule of the same name. Components of corresponding
//! molecules correspond by the k-th occurrence of their name.

use std::fmt;
use ahash::AHashSet;

use rn_structure::BondState;
use rn_structure::Component;
use rn_structure::Molecule;
use rn_structure::MolGraph;
use rn_structure::Site;
use rn_structure::StructureError;

use crate::Embedding;

/// A component of one of the reactant patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatternSite {
    pub pattern: usize,
    pub site: Site,
}

/// One end of a bond created by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Reactant(PatternSite),
    /// Site on a molecule added by the rule (index into the added molecules).
    Created(Site),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    StateChange(PatternSite, String),
    AddBond(Endpoint, Endpoint),
    DeleteBond(PatternSite),
    AddMolecule(Molecule),
    DeleteMolecule { pattern: usize, molecule: usize },
    DeleteSpecies(usize),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::StateChange(s, state) => write!(f, "StateChange({}:{} -> {})", s.pattern, s.site, state),
            Operation::AddBond(a, b) => write!(f, "AddBond({:?}, {:?})", a, b),
            Operation::DeleteBond(s) => write!(f, "DeleteBond({}:{})", s.pattern, s.site),
            Operation::AddMolecule(m) => write!(f, "AddMolecule({})", m.name()),
            Operation::DeleteMolecule { pattern, molecule } => write!(f, "DeleteMolecule({}:{})", pattern, molecule),
            Operation::DeleteSpecies(p) => write!(f, "DeleteSpecies({})", p),
        }
    }
}

/// A concrete edit on the joined reactant graph. Added molecules are
/// numbered after all reactant molecules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Edit {
    State(Site, String),
    Unbind(Site, Site),
    Bind(Site, Site),
    Create(usize),
    Remove(usize),
}

impl Edit {
    /// The same edit with molecule indices mapped through `f`.
    pub fn relabel(&self, f: impl Fn(usize) -> usize) -> Edit {
        let site = |s: &Site| Site::new(f(s.molecule), s.component);
        match self {
            Edit::State(s, state) => Edit::State(site(s), state.clone()),
            Edit::Unbind(a, b) => {
                let (a, b) = pair(site(a), site(b));
                Edit::Unbind(a, b)
            }
            Edit::Bind(a, b) => {
                let (a, b) = pair(site(a), site(b));
                Edit::Bind(a, b)
            }
            Edit::Create(c) => Edit::Create(*c),
            Edit::Remove(m) => Edit::Remove(f(*m)),
        }
    }
}

/// Where the first molecule of a product pattern comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    Reactant { pattern: usize, molecule: usize },
    Created(usize),
}

/// Result of replaying a transform on concrete reactants.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// The joined reactant graph after all edits.
    pub graph: MolGraph,
    /// Sorted list of the edits that were applied.
    pub edits: Vec<Edit>,
    /// Molecule of `graph` that carries each product pattern.
    pub anchors: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleTransform {
    operations: Vec<Operation>,
    anchors: Vec<Anchor>,
}

fn pair<T: Ord>(a: T, b: T) -> (T, T) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Index of the `k`-th component named `name`.
fn nth_named(m: &Molecule, name: &str, k: usize) -> Option<usize> {
    m.components().iter().enumerate()
        .filter(|(_, c)| c.name() == name)
        .nth(k)
        .map(|(i, _)| i)
}

impl RuleTransform {
    /// Derive the operations that turn `reactants` into `products`. Errors
    /// carry a human readable reason.
    pub fn new(reactants: &[MolGraph], products: &[MolGraph], delete_molecules: bool) -> Result<Self, String> {
        let lhs: Vec<(usize, usize)> = reactants.iter().enumerate()
            .flat_map(|(p, g)| (0..g.molecule_count()).map(move |m| (p, m)))
            .collect();
        let rhs: Vec<(usize, usize)> = products.iter().enumerate()
            .flat_map(|(q, g)| (0..g.molecule_count()).map(move |m| (q, m)))
            .collect();
        let lmol = |(p, m): (usize, usize)| &reactants[p].molecules()[m];
        let rmol = |(q, m): (usize, usize)| &products[q].molecules()[m];

        let mut lhs_used = vec![false; lhs.len()];
        let mut counterpart: Vec<Option<usize>> = Vec::with_capacity(rhs.len());
        for &r in &rhs {
            let found = (0..lhs.len()).find(|&i| !lhs_used[i] && lmol(lhs[i]).name() == rmol(r).name());
            if let Some(i) = found {
                lhs_used[i] = true;
            }
            counterpart.push(found);
        }

        // component map RHS -> LHS for corresponding molecules
        let mut comp_map: Vec<Vec<usize>> = Vec::with_capacity(rhs.len());
        for (ri, &r) in rhs.iter().enumerate() {
            let rm = rmol(r);
            let Some(li) = counterpart[ri] else {
                comp_map.push(Vec::new());
                continue;
            };
            let lm = lmol(lhs[li]);
            if lm.len() != rm.len() {
                return Err(format!("molecule {} lists different components on both sides", rm.name()));
            }
            let mut map = Vec::with_capacity(rm.len());
            for (j, c) in rm.components().iter().enumerate() {
                let k = rm.components()[..j].iter().filter(|o| o.name() == c.name()).count();
                match nth_named(lm, c.name(), k) {
                    Some(i) => map.push(i),
                    None => return Err(format!("component {}.{} missing on the reactant side", rm.name(), c.name())),
                }
            }
            comp_map.push(map);
        }

        let mut created: Vec<usize> = vec![usize::MAX; rhs.len()];
        let mut added = Vec::new();
        for (ri, &r) in rhs.iter().enumerate() {
            if counterpart[ri].is_some() {
                continue;
            }
            let m = rmol(r);
            if m.components().iter().any(|c| c.bond().is_wildcard()) {
                return Err(format!("added molecule {} uses a bond wildcard", m.name()));
            }
            created[ri] = added.len();
            let comps: Vec<Component> = m.components().iter()
                .map(|c| match c.state() {
                    Some(s) => Component::with_state(c.name(), s),
                    None => Component::new(c.name()),
                })
                .collect();
            let mut fresh = Molecule::new(m.name(), comps);
            if let Some(c) = m.compartment() {
                fresh = fresh.with_compartment(c);
            }
            added.push(fresh);
        }

        let flat_rhs = |q: usize, m: usize| rhs.iter().position(|&x| x == (q, m)).unwrap_or(usize::MAX);
        let endpoint = |q: usize, s: Site| -> Endpoint {
            let ri = flat_rhs(q, s.molecule);
            match counterpart[ri] {
                Some(li) => Endpoint::Reactant(PatternSite {
                    pattern: lhs[li].0,
                    site: Site::new(lhs[li].1, comp_map[ri][s.component]),
                }),
                None => Endpoint::Created(Site::new(created[ri], s.component)),
            }
        };

        // RHS bond state per LHS site of corresponding molecules
        let mut rhs_bond_at: Vec<Vec<Vec<Option<BondState>>>> = reactants.iter()
            .map(|g| g.molecules().iter().map(|m| vec![None; m.len()]).collect())
            .collect();
        for (ri, &(q, m)) in rhs.iter().enumerate() {
            if let Some(li) = counterpart[ri] {
                let (p, lm) = lhs[li];
                for (j, c) in products[q].molecules()[m].components().iter().enumerate() {
                    rhs_bond_at[p][lm][comp_map[ri][j]] = Some(c.bond());
                }
            }
        }

        let rhs_bonds: AHashSet<(Endpoint, Endpoint)> = products.iter().enumerate()
            .flat_map(|(q, g)| g.bonds().into_iter().map(move |(a, b)| (q, a, b)))
            .map(|(q, a, b)| pair(endpoint(q, a), endpoint(q, b)))
            .collect();
        let lhs_bonds: AHashSet<(Endpoint, Endpoint)> = reactants.iter().enumerate()
            .flat_map(|(p, g)| g.bonds().into_iter().map(move |(a, b)| (p, a, b)))
            .map(|(p, a, b)| pair(
                Endpoint::Reactant(PatternSite { pattern: p, site: a }),
                Endpoint::Reactant(PatternSite { pattern: p, site: b }),
            ))
            .collect();

        let mut operations = Vec::new();

        // state changes
        for (ri, &(q, m)) in rhs.iter().enumerate() {
            let Some(li) = counterpart[ri] else { continue };
            let (p, lm) = lhs[li];
            for (j, c) in products[q].molecules()[m].components().iter().enumerate() {
                let lc = comp_map[ri][j];
                let before = reactants[p].molecules()[lm].components()[lc].state();
                if let Some(after) = c.state() {
                    if before != Some(after) {
                        let site = PatternSite { pattern: p, site: Site::new(lm, lc) };
                        operations.push(Operation::StateChange(site, after.to_string()));
                    }
                }
            }
        }

        // bonds that disappear
        for (p, g) in reactants.iter().enumerate() {
            for (mi, m) in g.molecules().iter().enumerate() {
                for (ci, c) in m.components().iter().enumerate() {
                    let here = PatternSite { pattern: p, site: Site::new(mi, ci) };
                    let Some(after) = rhs_bond_at[p][mi][ci] else { continue };
                    match (c.bond(), after) {
                        (BondState::Occupied, BondState::Free) => operations.push(Operation::DeleteBond(here)),
                        (BondState::Occupied, BondState::Bound(_)) | (BondState::Any, BondState::Bound(_)) => {
                            return Err(format!("{}.{} binds a site that may already be bound", m.name(), c.name()));
                        }
                        (BondState::Any, BondState::Free) | (BondState::Any, BondState::Occupied) => {
                            return Err(format!("{}.{} changes a site of unknown bond state", m.name(), c.name()));
                        }
                        (BondState::Bound(there), _) if here.site < there => {
                            let e = pair(Endpoint::Reactant(here), Endpoint::Reactant(PatternSite { pattern: p, site: there }));
                            let partner_kept = rhs_bond_at[p][there.molecule][there.component].is_some();
                            if partner_kept && !after.is_wildcard() && !rhs_bonds.contains(&e) {
                                operations.push(Operation::DeleteBond(here));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        for m in &added {
            operations.push(Operation::AddMolecule(m.clone()));
        }

        // bonds that appear
        let mut new_bonds: Vec<&(Endpoint, Endpoint)> = rhs_bonds.iter()
            .filter(|b| !lhs_bonds.contains(b))
            .collect();
        new_bonds.sort();
        for &(a, b) in new_bonds {
            operations.push(Operation::AddBond(a, b));
        }

        // deletions
        for (p, g) in reactants.iter().enumerate() {
            let gone: Vec<usize> = (0..g.molecule_count())
                .filter(|&m| {
                    let li = lhs.iter().position(|&x| x == (p, m)).unwrap_or(usize::MAX);
                    !lhs_used[li]
                })
                .collect();
            if !gone.is_empty() && gone.len() == g.molecule_count() && !delete_molecules {
                operations.push(Operation::DeleteSpecies(p));
            } else {
                for molecule in gone {
                    operations.push(Operation::DeleteMolecule { pattern: p, molecule });
                }
            }
        }

        let anchors = products.iter().enumerate()
            .map(|(q, _)| {
                let ri = flat_rhs(q, 0);
                match counterpart[ri] {
                    Some(li) => Anchor::Reactant { pattern: lhs[li].0, molecule: lhs[li].1 },
                    None => Anchor::Created(created[ri]),
                }
            })
            .collect();

        Ok(Self { operations, anchors })
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// True if the rule creates a bond between components with the same
    /// molecule name and component label on reactant roles `a` and `b`.
    pub fn binds_equivalent_sites(&self, reactants: &[MolGraph], a: usize, b: usize) -> bool {
        let label = |s: &PatternSite| {
            let m = &reactants[s.pattern].molecules()[s.site.molecule];
            (m.name().to_string(), m.components()[s.site.component].label())
        };
        self.operations.iter().any(|op| match op {
            Operation::AddBond(Endpoint::Reactant(x), Endpoint::Reactant(y)) => {
                let roles = (x.pattern, y.pattern);
                (roles == (a, b) || roles == (b, a)) && label(x) == label(y)
            }
            _ => false,
        })
    }

    /// Replay the operations on `species[p]` matched by `embeddings[p]`.
    pub fn apply(&self, species: &[&MolGraph], embeddings: &[&Embedding]) -> Result<Outcome, StructureError> {
        let mut graph = MolGraph::new();
        let offsets: Vec<usize> = species.iter().map(|s| graph.append(s)).collect();
        if let Some(first) = species.first() {
            if species.iter().all(|s| s.compartment() == first.compartment()) {
                graph.set_compartment(first.compartment());
            }
        }
        let base = graph.molecule_count();

        let locate = |ps: &PatternSite| {
            let s = embeddings[ps.pattern].site(ps.site);
            Site::new(offsets[ps.pattern] + s.molecule, s.component)
        };
        let resolve = |e: &Endpoint| match e {
            Endpoint::Reactant(ps) => locate(ps),
            Endpoint::Created(s) => Site::new(base + s.molecule, s.component),
        };

        let mut edits = Vec::new();
        let mut removed: Vec<usize> = Vec::new();
        let mut created = 0;
        for op in &self.operations {
            match op {
                Operation::StateChange(ps, state) => {
                    let site = locate(ps);
                    graph.set_state(site, Some(state.as_str()))?;
                    edits.push(Edit::State(site, state.clone()));
                }
                Operation::DeleteBond(ps) => {
                    let site = locate(ps);
                    if let Some(partner) = graph.unbind(site)? {
                        let (a, b) = pair(site, partner);
                        edits.push(Edit::Unbind(a, b));
                    }
                }
                Operation::AddMolecule(m) => {
                    graph.add_molecule(m.clone());
                    edits.push(Edit::Create(created));
                    created += 1;
                }
                Operation::AddBond(x, y) => {
                    let (a, b) = pair(resolve(x), resolve(y));
                    graph.bind(a, b)?;
                    edits.push(Edit::Bind(a, b));
                }
                Operation::DeleteMolecule { pattern, molecule } => {
                    removed.push(offsets[*pattern] + embeddings[*pattern].molecules[*molecule]);
                }
                Operation::DeleteSpecies(p) => {
                    removed.extend(offsets[*p]..offsets[*p] + species[*p].molecule_count());
                }
            }
        }
        removed.sort_unstable();
        removed.dedup();
        edits.extend(removed.iter().map(|&m| Edit::Remove(m)));
        edits.sort();

        let shift = |m: usize| m - removed.partition_point(|&r| r < m);
        let anchors = self.anchors.iter()
            .map(|a| match a {
                Anchor::Reactant { pattern, molecule } => {
                    shift(offsets[*pattern] + embeddings[*pattern].molecules[*molecule])
                }
                Anchor::Created(c) => shift(base + c),
            })
            .collect();
        graph.remove_molecules(&removed);

        Ok(Outcome { graph, edits, anchors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings_into;

    fn g(s: &str) -> MolGraph {
        s.parse().unwrap()
    }

    fn transform(lhs: &[&str], rhs: &[&str]) -> RuleTransform {
        let l: Vec<MolGraph> = lhs.iter().map(|s| g(s)).collect();
        let r: Vec<MolGraph> = rhs.iter().map(|s| g(s)).collect();
        RuleTransform::new(&l, &r, false).unwrap()
    }

    #[test]
    fn test_binding_operations() {
        let t = transform(&["L(r,r)", "R(l)"], &["L(r!1,r).R(l!1)"]);
        assert_eq!(t.operations().len(), 1);
        let a = PatternSite { pattern: 0, site: Site::new(0, 0) };
        let b = PatternSite { pattern: 1, site: Site::new(0, 0) };
        assert_eq!(t.operations()[0], Operation::AddBond(Endpoint::Reactant(a), Endpoint::Reactant(b)));
    }

    #[test]
    fn test_unbinding_and_state_change() {
        let t = transform(&["A(x!1,p~U).B(y!1)"], &["A(x,p~P)", "B(y)"]);
        let ops = t.operations();
        assert!(ops.contains(&Operation::StateChange(PatternSite { pattern: 0, site: Site::new(0, 1) }, "P".into())));
        assert!(ops.contains(&Operation::DeleteBond(PatternSite { pattern: 0, site: Site::new(0, 0) })));
        assert_eq!(ops.len(), 2);

        let occupied = transform(&["A(x!+)"], &["A(x)"]);
        assert_eq!(occupied.operations(), &[Operation::DeleteBond(PatternSite { pattern: 0, site: Site::new(0, 0) })]);
    }

    #[test]
    fn test_synthesis_and_degradation() {
        let t = transform(&[], &["A(x~U)"]);
        assert!(matches!(t.operations()[0], Operation::AddMolecule(_)));

        let t = transform(&["A()"], &[]);
        assert_eq!(t.operations(), &[Operation::DeleteSpecies(0)]);

        let l = vec![g("A()")];
        let t = RuleTransform::new(&l, &[], true).unwrap();
        assert_eq!(t.operations(), &[Operation::DeleteMolecule { pattern: 0, molecule: 0 }]);
    }

    #[test]
    fn test_invalid_rules() {
        let l = vec![g("A(x)")];
        assert!(RuleTransform::new(&l, &[g("A(y)")], false).is_err());
        assert!(RuleTransform::new(&[g("A(x!?)")], &[g("A(x!1).B(y!1)")], false).is_err());
        assert!(RuleTransform::new(&[], &[g("A(x!+)")], false).is_err());
    }

    #[test]
    fn test_apply_dissociation_dedups_edits() {
        let t = transform(&["A(x!1).A(x!1)"], &["A(x)", "A(x)"]);
        let dimer = g("A(x!1).A(x!1)");
        let embs = embeddings_into(&g("A(x!1).A(x!1)"), &dimer);
        assert_eq!(embs.len(), 2);
        let first = t.apply(&[&dimer], &[&embs[0]]).unwrap();
        let second = t.apply(&[&dimer], &[&embs[1]]).unwrap();
        assert_eq!(first.edits, second.edits);
        assert_eq!(first.graph.connected_components().len(), 2);
        assert!(dimer.partner(Site::new(0, 0)).is_some());
    }

    #[test]
    fn test_apply_binding_and_anchors() {
        let t = transform(&["L(r,r)", "R(l)"], &["L(r!1,r).R(l!1)"]);
        let l = g("L(r,r)");
        let r = g("R(l)");
        let el = embeddings_into(&g("L(r,r)"), &l);
        let er = embeddings_into(&g("R(l)"), &r);
        let a = t.apply(&[&l, &r], &[&el[0], &er[0]]).unwrap();
        let b = t.apply(&[&l, &r], &[&el[1], &er[0]]).unwrap();
        assert_ne!(a.edits, b.edits);
        assert!(a.graph.is_connected());
        assert_eq!(a.anchors, vec![0]);
    }

    #[test]
    fn test_apply_degradation_keeps_partner() {
        let t = transform(&["A(x!1).B(y!1)"], &["A(x)"]);
        let s = g("A(x!1).B(y!1,z!2).C(w!2)");
        let e = embeddings_into(&g("A(x!1).B(y!1)"), &s);
        let out = t.apply(&[&s], &[&e[0]]).unwrap();
        assert_eq!(out.graph.molecule_count(), 2);
        assert_eq!(out.graph.connected_components().len(), 2);
        assert_eq!(out.anchors, vec![0]);
    }

    #[test]
    fn test_relabel_keeps_bond_pairs_ordered() {
        let swap = |m: usize| 1 - m;
        let bind = Edit::Bind(Site::new(0, 0), Site::new(1, 2));
        assert_eq!(bind.relabel(swap), Edit::Bind(Site::new(0, 2), Site::new(1, 0)));
        assert_eq!(Edit::Remove(0).relabel(swap), Edit::Remove(1));
        assert_eq!(Edit::Create(0).relabel(swap), Edit::Create(0));
    }
}
