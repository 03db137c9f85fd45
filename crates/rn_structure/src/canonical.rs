//! Canonical labeling of molecule graphs.
//!
//! The canonical string of a graph is invariant under reordering of
//! molecules, of components within molecules and under renumbering of bond
//! labels. Two species are the same chemical entity iff their canonical
//! strings agree.

use itertools::Itertools;
use log::trace;

use crate::BondState;
use crate::MolGraph;
use crate::Site;
use crate::StructureError;
use crate::notation::serialize;

/// Default bound on the number of complete labelings explored for one
/// fragment before giving up.
pub const DEFAULT_MAX_ORBIT: usize = 50_000;

#[derive(Debug, Clone, Copy)]
pub struct Canonicalizer {
    max_orbit: usize,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self { max_orbit: DEFAULT_MAX_ORBIT }
    }
}

impl Canonicalizer {
    pub fn new(max_orbit: usize) -> Self {
        Self { max_orbit: max_orbit.max(1) }
    }

    pub fn max_orbit(&self) -> usize {
        self.max_orbit
    }

    /// Canonical string of a (possibly disconnected) graph. Connected
    /// fragments are canonicalized separately, sorted and joined by `.`.
    pub fn canonicalize(&self, graph: &MolGraph) -> Result<String, StructureError> {
        let mut parts = Vec::new();
        for group in graph.connected_components() {
            let mut frag = graph.subgraph(&group);
            frag.set_compartment(None);
            parts.push(self.canonicalize_fragment(&frag)?);
        }
        parts.sort();
        let body = parts.join(".");
        Ok(match graph.compartment() {
            Some(c) => format!("@{}::{}", c, body),
            None => body,
        })
    }

    fn canonicalize_fragment(&self, frag: &MolGraph) -> Result<String, StructureError> {
        let prep = Fragment::new(frag);
        let colors = prep.refine(prep.sig.clone());

        if is_discrete(&colors) {
            return Ok(prep.serialize_by_colors(&colors));
        }
        if prep.is_tree() {
            return Ok(prep.centers().into_iter()
                .map(|root| prep.serialize(&prep.tree_order(root)))
                .min()
                .unwrap_or_default());
        }

        let mut best: Option<String> = None;
        let mut leaves = 0;
        self.search(&prep, colors, &mut best, &mut leaves)?;
        trace!("canonical search explored {} labelings for {}", leaves, frag);
        Ok(best.unwrap_or_default())
    }

    /// Individualization-refinement: branch on every (non-interchangeable)
    /// member of the first non-singleton color class and keep the smallest
    /// serialization.
    fn search(
        &self,
        prep: &Fragment,
        colors: Vec<usize>,
        best: &mut Option<String>,
        leaves: &mut usize,
    ) -> Result<(), StructureError> {
        let colors = prep.refine(colors);
        if is_discrete(&colors) {
            *leaves += 1;
            if *leaves > self.max_orbit {
                return Err(StructureError::CanonicalizationOverflow {
                    leaves: *leaves,
                    limit: self.max_orbit,
                });
            }
            let s = prep.serialize_by_colors(&colors);
            if best.as_ref().is_none_or(|b| s < *b) {
                *best = Some(s);
            }
            return Ok(());
        }

        let Some(target) = first_shared_color(&colors) else {
            return Ok(());
        };
        let members: Vec<usize> = (0..colors.len()).filter(|&u| colors[u] == target).collect();

        let mut representatives: Vec<usize> = Vec::new();
        for &u in &members {
            if !representatives.iter().any(|&r| prep.swap_is_automorphism(r, u)) {
                representatives.push(u);
            }
        }

        for u in representatives {
            let individualized: Vec<usize> = colors.iter().enumerate()
                .map(|(x, &c)| if x == u { 2 * c } else { 2 * c + 1 })
                .collect();
            self.search(prep, individualized, best, leaves)?;
        }
        Ok(())
    }
}

/// Canonical string with the default bounds.
pub fn canonical_form(graph: &MolGraph) -> Result<String, StructureError> {
    Canonicalizer::default().canonicalize(graph)
}

fn is_discrete(colors: &[usize]) -> bool {
    colors.iter().all_unique()
}

/// The smallest color that is shared by more than one molecule.
fn first_shared_color(colors: &[usize]) -> Option<usize> {
    colors.iter().copied()
        .counts()
        .into_iter()
        .filter(|&(_, n)| n > 1)
        .map(|(c, _)| c)
        .min()
}

/// Rank values by sorted order, so that equal values get equal ranks and the
/// ranks only depend on the values themselves.
fn rank<T: Ord + Clone>(values: &[T]) -> Vec<usize> {
    let sorted: Vec<T> = values.iter().cloned().sorted().dedup().collect();
    values.iter()
        .map(|v| sorted.binary_search(v).unwrap_or_else(|i| i))
        .collect()
}

/// Per-fragment invariants shared by all steps of the labeling.
struct Fragment<'a> {
    graph: &'a MolGraph,
    /// Invariant rank of (label, bond kind) per component.
    comp_keys: Vec<Vec<usize>>,
    /// Initial molecule colors from local invariants.
    sig: Vec<usize>,
    /// Per molecule: (own component key, partner component key, partner).
    adj: Vec<Vec<(usize, usize, usize)>>,
    /// Directed bond list (u, key at u, v, key at v), sorted.
    edges: Vec<(usize, usize, usize, usize)>,
}

impl<'a> Fragment<'a> {
    fn new(graph: &'a MolGraph) -> Self {
        let raw_keys: Vec<Vec<String>> = graph.molecules().iter()
            .map(|m| m.components().iter()
                .map(|c| {
                    let kind = match c.bond() {
                        BondState::Free => "",
                        BondState::Bound(_) => "!",
                        BondState::Occupied => "!+",
                        BondState::Any => "!?",
                    };
                    format!("{}{}", c.label(), kind)
                })
                .collect())
            .collect();
        let flat: Vec<String> = raw_keys.iter().flatten().cloned().collect();
        let flat_ranks = rank(&flat);
        let mut it = flat_ranks.into_iter();
        let comp_keys: Vec<Vec<usize>> = raw_keys.iter()
            .map(|row| row.iter().map(|_| it.next().unwrap_or(0)).collect())
            .collect();

        let signatures: Vec<String> = graph.molecules().iter().map(|m| m.signature()).collect();
        let sig = rank(&signatures);

        let mut adj = vec![Vec::new(); graph.molecule_count()];
        let mut edges = Vec::new();
        for (u, row) in adj.iter_mut().enumerate() {
            for (ci, partner) in graph.neighbors(u) {
                let ku = comp_keys[u][ci];
                let kv = comp_keys[partner.molecule][partner.component];
                row.push((ku, kv, partner.molecule));
                edges.push((u, ku, partner.molecule, kv));
            }
        }
        edges.sort_unstable();

        Self { graph, comp_keys, sig, adj, edges }
    }

    /// Color refinement until the number of classes stops growing.
    fn refine(&self, mut colors: Vec<usize>) -> Vec<usize> {
        let n = colors.len();
        let mut classes = colors.iter().unique().count();
        for _ in 0..=n {
            let sigs: Vec<(usize, Vec<(usize, usize, usize)>)> = (0..n)
                .map(|u| {
                    let mut nb: Vec<(usize, usize, usize)> = self.adj[u].iter()
                        .map(|&(ka, kb, v)| (ka, kb, colors[v]))
                        .collect();
                    nb.sort_unstable();
                    (colors[u], nb)
                })
                .collect();
            colors = rank(&sigs);
            let refined = colors.iter().unique().count();
            if refined == classes {
                break;
            }
            classes = refined;
        }
        colors
    }

    fn is_tree(&self) -> bool {
        let n = self.graph.molecule_count();
        let directed = self.edges.len();
        if directed != 2 * (n.saturating_sub(1)) {
            return false;
        }
        // no parallel bonds and no bonds within one molecule
        self.adj.iter().enumerate().all(|(u, row)| {
            row.iter().map(|&(_, _, v)| v).all_unique() && row.iter().all(|&(_, _, v)| v != u)
        })
    }

    /// One or two center molecules of a tree.
    fn centers(&self) -> Vec<usize> {
        let n = self.graph.molecule_count();
        if n <= 2 {
            return (0..n).collect();
        }
        let mut degree: Vec<usize> = self.adj.iter().map(|row| row.len()).collect();
        let mut layer: Vec<usize> = (0..n).filter(|&u| degree[u] <= 1).collect();
        let mut remaining = n;
        while remaining > 2 {
            remaining -= layer.len();
            let mut next = Vec::new();
            for &leaf in &layer {
                for &(_, _, v) in &self.adj[leaf] {
                    if degree[v] > 1 {
                        degree[v] -= 1;
                        if degree[v] == 1 {
                            next.push(v);
                        }
                    }
                }
                degree[leaf] = 0;
            }
            layer = next;
        }
        layer
    }

    /// Preorder of a tree rooted at `root`, children sorted by the canonical
    /// code of the subtree they carry.
    fn tree_order(&self, root: usize) -> Vec<usize> {
        let n = self.graph.molecule_count();
        let mut parent = vec![usize::MAX; n];
        let mut bfs = vec![root];
        parent[root] = root;
        let mut k = 0;
        while k < bfs.len() {
            let u = bfs[k];
            for &(_, _, v) in &self.adj[u] {
                if parent[v] == usize::MAX {
                    parent[v] = u;
                    bfs.push(v);
                }
            }
            k += 1;
        }

        let mut code = vec![String::new(); n];
        let mut children: Vec<Vec<(String, usize)>> = vec![Vec::new(); n];
        for &u in bfs.iter().rev() {
            let mut entries: Vec<(String, usize)> = self.adj[u].iter()
                .filter(|&&(_, _, v)| v != u && v != root && parent[v] == u)
                .map(|&(ka, kb, v)| (format!("{}-{}:{}", ka, kb, code[v]), v))
                .collect();
            entries.sort();
            code[u] = format!("{}[{}]", self.sig[u], entries.iter().map(|(e, _)| e.as_str()).join(","));
            children[u] = entries;
        }

        let mut order = Vec::with_capacity(n);
        let mut stack = vec![root];
        while let Some(u) = stack.pop() {
            order.push(u);
            for (_, v) in children[u].iter().rev() {
                stack.push(*v);
            }
        }
        order
    }

    /// True if exchanging molecules `a` and `b` maps the bond set onto
    /// itself (the two are interchangeable).
    fn swap_is_automorphism(&self, a: usize, b: usize) -> bool {
        if a == b {
            return true;
        }
        let swap = |x: usize| if x == a { b } else if x == b { a } else { x };
        let mut mapped: Vec<(usize, usize, usize, usize)> = self.edges.iter()
            .map(|&(u, ku, v, kv)| (swap(u), ku, swap(v), kv))
            .collect();
        mapped.sort_unstable();
        mapped == self.edges
    }

    fn serialize_by_colors(&self, colors: &[usize]) -> String {
        let order: Vec<usize> = (0..colors.len()).sorted_by_key(|&u| colors[u]).collect();
        self.serialize(&order)
    }

    /// Serialize molecules in `order`. Components are placed greedily:
    /// smallest (key, partner position, partner key, partner slot) first,
    /// where the slot is only known once the partner has been placed. Ties
    /// left after that are between interchangeable components.
    fn serialize(&self, order: &[usize]) -> String {
        let mut pos = vec![0; order.len()];
        for (p, &u) in order.iter().enumerate() {
            pos[u] = p;
        }
        let mut slot: Vec<Vec<Option<usize>>> = self.graph.molecules().iter()
            .map(|m| vec![None; m.len()])
            .collect();
        let mut comp_orders: Vec<Vec<usize>> = vec![Vec::new(); order.len()];
        let mut next = 0;
        for &u in order {
            let mut remaining: Vec<usize> = (0..self.comp_keys[u].len()).collect();
            while !remaining.is_empty() {
                let key = |c: usize| {
                    let partner = self.graph.partner(Site::new(u, c)).map(|p| (
                        pos[p.molecule],
                        self.comp_keys[p.molecule][p.component],
                        slot[p.molecule][p.component],
                    ));
                    (self.comp_keys[u][c], partner)
                };
                let Some(k) = (0..remaining.len()).min_by_key(|&k| key(remaining[k])) else {
                    break;
                };
                let c = remaining.remove(k);
                slot[u][c] = Some(next);
                next += 1;
                comp_orders[u].push(c);
            }
        }
        serialize(self.graph, order, &comp_orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use crate::Molecule;

    /// Rebuild `g` with shuffled molecules and components.
    fn shuffled(g: &MolGraph, rng: &mut StdRng) -> MolGraph {
        let n = g.molecule_count();
        let mut mol_perm: Vec<usize> = (0..n).collect();
        mol_perm.shuffle(rng);
        let mut comp_perm: Vec<Vec<usize>> = Vec::new();
        for m in g.molecules() {
            let mut p: Vec<usize> = (0..m.len()).collect();
            p.shuffle(rng);
            comp_perm.push(p);
        }
        // new position of old molecule / old component
        let mut new_mol = vec![0; n];
        for (new, &old) in mol_perm.iter().enumerate() {
            new_mol[old] = new;
        }
        let mut out = MolGraph::new();
        for &old in &mol_perm {
            let m = &g.molecules()[old];
            let comps = comp_perm[old].iter().map(|&c| m.components()[c].clone()).collect();
            let mut nm = Molecule::new(m.name(), comps);
            if let Some(c) = m.compartment() {
                nm = nm.with_compartment(c);
            }
            out.add_molecule(nm);
        }
        let new_site = |s: Site| {
            let pos = comp_perm[s.molecule].iter().position(|&c| c == s.component).unwrap();
            Site::new(new_mol[s.molecule], pos)
        };
        for (a, b) in g.bonds() {
            out.bind(new_site(a), new_site(b)).unwrap();
        }
        out.set_compartment(g.compartment());
        out
    }

    fn canon(s: &str) -> String {
        canonical_form(&s.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_simple_forms() {
        assert_eq!(canon("B(y!1).A(x!1)"), "A(x!1).B(y!1)");
        assert_eq!(canon("R(l!1).L(r!1,r)"), "L(r,r!1).R(l!1)");
        assert_eq!(canon("A(y~P,x)"), "A(x,y~P)");
        assert_eq!(canon("B(y).A(x)"), "A(x).B(y)");
        assert_eq!(canon("@EC::B(y).A(x)@PM"), "@EC::A(x)@PM.B(y)");
    }

    #[test]
    fn test_bond_label_invariance() {
        assert_eq!(
            canon("A(x!5,y!9).B(a!5).C(c!9)"),
            canon("C(c!1).A(y!1,x!2).B(a!2)")
        );
    }

    #[test]
    fn test_distinguishes_structures() {
        assert_ne!(canon("A(x!1).A(x!1)"), canon("A(x).A(x)"));
        assert_ne!(canon("A(x~P!1).B(y!1)"), canon("A(x~U!1).B(y!1)"));
        assert_ne!(canon("A(x!1,y).B(b!1)"), canon("A(x,y!1).B(b!1)"));
        // same molecule content, different bonding pattern
        assert_ne!(
            canon("A(a!1,b!2).B(x!1,y~P).B(x!2,y~U)"),
            canon("A(a!1,b!2).B(x!1,y~P).B(x!2,y~P)")
        );
    }

    #[test]
    fn test_shuffle_stability() {
        let mut rng = StdRng::seed_from_u64(42);
        let examples = [
            "A(x!1,y!2).B(a!1,b~P).B(a!2,b~U)",
            "R(l!1,l!2,l!3).L(r!1,s!4).L(r!2).L(r!3).X(s!4)",
            "A(l!1,r!2).A(l!2,r!3).A(l!3,r!4).A(l!4,r!1)",
            "A(b!1,b!2).A(b!2,b!3).A(b!3,b!4).A(b!4,b!5).A(b!5,b!6).A(b!6,b!1)",
            "E(s!1,s!2).S(e!1,p~P).S(e!2,p~U).E(s,s)",
            "@C::K(a!1).K(a!1,b~P)",
            "A(x!1,x!2).B(y!1,y!2)",
        ];
        for ex in examples {
            let g: MolGraph = ex.parse().unwrap();
            let reference = canonical_form(&g).unwrap();
            for _ in 0..20 {
                let h = shuffled(&g, &mut rng);
                assert_eq!(canonical_form(&h).unwrap(), reference, "shuffled {}", h);
            }
        }
    }

    #[test]
    fn test_idempotent() {
        for ex in ["L(r!1,r!2).R(l!1).R(l!2)", "A(l!1,r!2).A(l!2,r!3).A(l!3,r!1)", "A(x!+,y!?)"] {
            let once = canon(ex);
            assert_eq!(canon(&once), once);
        }
    }

    #[test]
    fn test_symmetric_star() {
        // twelve identical arms must not blow up the search
        let arms = (1..=12).map(|i| format!("s!{}", i)).join(",");
        let ligands = (1..=12).map(|i| format!("L(r!{})", i)).join(".");
        let star: MolGraph = format!("R({}).{}", arms, ligands).parse().unwrap();
        let c = Canonicalizer::new(10).canonicalize(&star).unwrap();
        assert!(c.starts_with("R(s!1,s!2,"));
        assert!(c.ends_with("L(r!12)"));
    }

    #[test]
    fn test_overflow() {
        let ring: MolGraph = "A(l!1,r!2).A(l!2,r!3).A(l!3,r!4).A(l!4,r!1)".parse().unwrap();
        assert!(matches!(
            Canonicalizer::new(1).canonicalize(&ring),
            Err(StructureError::CanonicalizationOverflow { limit: 1, .. })
        ));
        assert!(Canonicalizer::default().canonicalize(&ring).is_ok());
    }

    #[test]
    fn test_pattern_wildcards() {
        assert_eq!(canon("A(y!?,x!+)"), "A(x!+,y!?)");
        assert_ne!(canon("A(x!+)"), canon("A(x!?)"));
    }
}
