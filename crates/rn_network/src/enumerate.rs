use std::fmt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use serde::{Serialize, Deserialize};

use rn_structure::Canonicalizer;
use rn_structure::DEFAULT_MAX_ORBIT;
use rn_structure::MolGraph;
use rn_structure::Site;
use rn_structure::StructureError;

use crate::Edit;
use crate::Embedding;
use crate::Outcome;
use crate::Reaction;
use crate::ReactionRule;
use crate::Species;
use crate::SpeciesTable;
use crate::embeddings_into;

#[derive(Debug)]
pub enum NetworkError {
    Structure(StructureError),
    InvalidRule(String, String), // rule name and reason
    InvalidSeed(String),
}

impl From<StructureError> for NetworkError {
    fn from(e: StructureError) -> Self {
        NetworkError::Structure(e)
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Structure(e) => write!(f, "Structure error: {}", e),
            NetworkError::InvalidRule(name, reason) => write!(f, "Invalid rule '{}': {}", name, reason),
            NetworkError::InvalidSeed(s) => write!(f, "Seed species '{}' is not fully specified", s),
        }
    }
}

impl std::error::Error for NetworkError {}

/// Bounds on network expansion.
#[derive(Debug, Clone)]
pub struct GenerationLimits {
    pub max_species: Option<usize>,
    pub max_reactions: Option<usize>,
    pub max_iterations: Option<usize>,
    pub max_aggregate_size: Option<usize>,
    pub max_stoich: AHashMap<String, usize>,
    /// Report progress every this many worklist pops.
    pub progress_interval: usize,
    /// Labeling budget of the canonicalizer.
    pub max_orbit: usize,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            max_species: None,
            max_reactions: None,
            max_iterations: None,
            max_aggregate_size: None,
            max_stoich: AHashMap::new(),
            progress_interval: 100,
            max_orbit: DEFAULT_MAX_ORBIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Limit {
    MaxSpecies(usize),
    MaxReactions(usize),
    MaxIterations(usize),
    AggregateSize(usize),
    Stoichiometry(String, usize),
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::MaxSpecies(n) => write!(f, "more than {} species", n),
            Limit::MaxReactions(n) => write!(f, "more than {} reactions", n),
            Limit::MaxIterations(n) => write!(f, "more than {} iterations", n),
            Limit::AggregateSize(n) => write!(f, "aggregates larger than {} molecules", n),
            Limit::Stoichiometry(name, n) => write!(f, "more than {} copies of {}", n, name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationStatus {
    Complete,
    LimitExceeded(Limit),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationPhase {
    Pending,
    Processing(usize),
    Done(GenerationStatus),
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationProgress {
    pub iteration: usize,
    pub species: usize,
    pub reactions: usize,
    pub elapsed: Duration,
}

/// Mutable state of one generation run.
#[derive(Debug)]
pub struct GenerationState {
    table: SpeciesTable,
    worklist: VecDeque<usize>,
    processed: Vec<usize>,
    reactions: Vec<Reaction>,
    phase: GenerationPhase,
    iteration: usize,
    pruned: Option<Limit>,
}

impl GenerationState {
    pub fn phase(&self) -> &GenerationPhase {
        &self.phase
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, GenerationPhase::Done(_))
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn species(&self) -> &[Species] {
        self.table.species()
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    pub fn pending(&self) -> usize {
        self.worklist.len()
    }

    fn finish(&mut self, status: GenerationStatus) {
        match &status {
            GenerationStatus::Complete => info!(
                "Network complete: {} species, {} reactions after {} iterations.",
                self.table.len(), self.reactions.len(), self.iteration
            ),
            GenerationStatus::LimitExceeded(l) => warn!(
                "Network generation stopped ({}): {} species, {} reactions.",
                l, self.table.len(), self.reactions.len()
            ),
            GenerationStatus::Cancelled => info!("Network generation cancelled."),
        }
        self.phase = GenerationPhase::Done(status);
    }

    pub fn into_network(self) -> Network {
        let status = match self.phase {
            GenerationPhase::Done(status) => status,
            _ => GenerationStatus::Cancelled,
        };
        Network {
            species: self.table.into_species(),
            reactions: self.reactions,
            status,
        }
    }
}

/// The generated species and reactions.
#[derive(Debug, Clone)]
pub struct Network {
    pub species: Vec<Species>,
    pub reactions: Vec<Reaction>,
    pub status: GenerationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionExport {
    pub rule: String,
    pub reactants: Vec<usize>,
    pub products: Vec<usize>,
    pub rate: String,
    pub dynamic: bool,
    pub propensity_factor: f64,
    pub multiplicity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkExport {
    pub species: Vec<String>,
    pub reactions: Vec<ReactionExport>,
    pub status: GenerationStatus,
}

impl Network {
    pub fn species_index(&self, canonical: &str) -> Option<usize> {
        self.species.iter().position(|s| s.canonical() == canonical)
    }

    pub fn is_complete(&self) -> bool {
        self.status == GenerationStatus::Complete
    }

    pub fn to_serializable(&self) -> NetworkExport {
        NetworkExport {
            species: self.species.iter().map(|s| s.canonical().to_string()).collect(),
            reactions: self.reactions.iter()
                .map(|r| ReactionExport {
                    rule: r.rule().to_string(),
                    reactants: r.reactants().to_vec(),
                    products: r.products().to_vec(),
                    rate: r.rate().to_string(),
                    dynamic: r.rate().is_dynamic(),
                    propensity_factor: r.propensity_factor(),
                    multiplicity: r.multiplicity(),
                })
                .collect(),
            status: self.status.clone(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "begin species")?;
        for (i, s) in self.species.iter().enumerate() {
            writeln!(f, "  S{} {}", i, s)?;
        }
        writeln!(f, "end species")?;
        writeln!(f, "begin reactions")?;
        for r in &self.reactions {
            writeln!(f, "  {}", r)?;
        }
        write!(f, "end reactions")
    }
}

/// Products of one reactant tuple that share the same species list.
struct ProductGroup {
    products: Vec<usize>,
    multiplicity: usize,
}

pub struct NetworkGenerator {
    rules: Vec<ReactionRule>,
    limits: GenerationLimits,
}

impl NetworkGenerator {
    pub fn new(rules: Vec<ReactionRule>, limits: GenerationLimits) -> Self {
        Self { rules, limits }
    }

    pub fn rules(&self) -> &[ReactionRule] {
        &self.rules
    }

    pub fn limits(&self) -> &GenerationLimits {
        &self.limits
    }

    /// Expand the network until the worklist runs empty or a limit is hit.
    pub fn generate(&self, seeds: &[MolGraph]) -> Result<Network, NetworkError> {
        self.generate_with(seeds, None, |_| {})
    }

    /// Like [`NetworkGenerator::generate`], with a cancellation flag that is
    /// polled before each worklist pop and a progress callback invoked every
    /// `progress_interval` pops.
    pub fn generate_with<F>(
        &self,
        seeds: &[MolGraph],
        cancel: Option<&AtomicBool>,
        mut progress: F,
    ) -> Result<Network, NetworkError>
    where
        F: FnMut(&GenerationProgress),
    {
        let start = Instant::now();
        let interval = self.limits.progress_interval.max(1);
        let mut state = self.initialize(seeds)?;
        while !state.is_done() {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                state.finish(GenerationStatus::Cancelled);
                break;
            }
            let before = state.iteration;
            self.step(&mut state)?;
            if state.iteration != before && state.iteration % interval == 0 {
                progress(&GenerationProgress {
                    iteration: state.iteration,
                    species: state.table.len(),
                    reactions: state.reactions.len(),
                    elapsed: start.elapsed(),
                });
            }
        }
        Ok(state.into_network())
    }

    /// Insert the seeds and apply rules without reactants once.
    pub fn initialize(&self, seeds: &[MolGraph]) -> Result<GenerationState, NetworkError> {
        let mut state = GenerationState {
            table: SpeciesTable::new(Canonicalizer::new(self.limits.max_orbit)),
            worklist: VecDeque::new(),
            processed: Vec::new(),
            reactions: Vec::new(),
            phase: GenerationPhase::Pending,
            iteration: 0,
            pruned: None,
        };
        for seed in seeds {
            if !seed.is_concrete() {
                return Err(NetworkError::InvalidSeed(seed.to_string()));
            }
            let canonical = state.table.canonical(seed)?;
            if state.table.index_of(&canonical).is_some() {
                continue;
            }
            if let Some(limit) = self.species_limit(&state) {
                state.finish(GenerationStatus::LimitExceeded(limit));
                return Ok(state);
            }
            let (i, _) = state.table.insert_canonical(canonical)?;
            state.worklist.push_back(i);
        }
        for rule in self.rules.iter().filter(|r| r.reactants().is_empty()) {
            if let Some(limit) = self.apply_rule(rule, &[], &mut state)? {
                state.finish(GenerationStatus::LimitExceeded(limit));
                return Ok(state);
            }
        }
        Ok(state)
    }

    /// Pop one species and apply every rule to every reactant tuple that
    /// contains it and otherwise only uses processed species.
    pub fn step(&self, state: &mut GenerationState) -> Result<(), NetworkError> {
        if state.is_done() {
            return Ok(());
        }
        if let Some(max) = self.limits.max_iterations {
            if state.iteration >= max && !state.worklist.is_empty() {
                state.finish(GenerationStatus::LimitExceeded(Limit::MaxIterations(max)));
                return Ok(());
            }
        }
        let Some(current) = state.worklist.pop_front() else {
            let status = match state.pruned.take() {
                Some(limit) => GenerationStatus::LimitExceeded(limit),
                None => GenerationStatus::Complete,
            };
            state.finish(status);
            return Ok(());
        };
        state.phase = GenerationPhase::Processing(current);
        state.iteration += 1;
        debug!("Iteration {}: processing S{} {}", state.iteration, current, state.table.species()[current]);

        let pool: Vec<usize> = state.processed.iter().copied().chain([current]).collect();
        for rule in self.rules.iter().filter(|r| !r.reactants().is_empty()) {
            let n = rule.reactants().len();
            let tuples = (0..n).map(|_| pool.iter().copied()).multi_cartesian_product();
            for tuple in tuples {
                if !tuple.contains(&current) || !rule.accepts_tuple(&tuple) {
                    continue;
                }
                if let Some(limit) = self.apply_rule(rule, &tuple, state)? {
                    state.finish(GenerationStatus::LimitExceeded(limit));
                    return Ok(());
                }
            }
        }
        state.processed.push(current);
        state.phase = GenerationPhase::Pending;
        Ok(())
    }

    /// Applies `rule` to one reactant tuple. Returns a limit if expansion has
    /// to stop.
    ///
    /// Species of `tuple` are tried in every role order the rule allows.
    /// Matches are compared in the frame of `tuple`, so two orders that
    /// perform the same edits on the same sites count once.
    fn apply_rule(
        &self,
        rule: &ReactionRule,
        tuple: &[usize],
        state: &mut GenerationState,
    ) -> Result<Option<Limit>, NetworkError> {
        let graphs: Vec<MolGraph> = tuple.iter()
            .map(|&i| state.table.species()[i].graph().clone())
            .collect();
        let slot_offsets: Vec<usize> = graphs.iter()
            .scan(0, |acc, g| {
                let offset = *acc;
                *acc += g.molecule_count();
                Some(offset)
            })
            .collect();

        let mut seen: AHashSet<(Vec<(usize, Site)>, Vec<Edit>)> = AHashSet::new();
        let mut groups: Vec<ProductGroup> = Vec::new();
        let mut group_of: FxHashMap<Vec<usize>, usize> = FxHashMap::default();

        for order in rule.role_orders(tuple) {
            let role_graphs: Vec<&MolGraph> = order.iter().map(|&slot| &graphs[slot]).collect();
            let per_role: Vec<Vec<Embedding>> = rule.reactants().iter().zip(&role_graphs)
                .map(|(p, g)| embeddings_into(p, g))
                .collect();
            if per_role.iter().any(|e| e.is_empty()) {
                continue;
            }
            let role_offsets: Vec<usize> = order.iter().map(|&slot| slot_offsets[slot]).collect();
            let role_sizes: Vec<usize> = role_graphs.iter().map(|g| g.molecule_count()).collect();
            let reactant_molecules: usize = role_sizes.iter().sum();
            // Joined graph of this order -> joined graph in tuple order.
            let to_slot = |m: usize| {
                if m >= reactant_molecules {
                    return m;
                }
                let mut start = 0;
                for (role, &size) in role_sizes.iter().enumerate() {
                    if m < start + size {
                        return role_offsets[role] + m - start;
                    }
                    start += size;
                }
                m
            };

            let combos: Box<dyn Iterator<Item = Vec<&Embedding>>> = if per_role.is_empty() {
                Box::new(std::iter::once(Vec::new()))
            } else {
                Box::new(per_role.iter().map(|e| e.iter()).multi_cartesian_product())
            };
            for combo in combos {
                let outcome = rule.transform().apply(&role_graphs, &combo)?;
                let image: Vec<(usize, Site)> = combo.iter().enumerate()
                    .flat_map(|(role, e)| {
                        let slot = order[role];
                        e.image().into_iter().map(move |s| (slot, s))
                    })
                    .sorted()
                    .collect();
                let edits: Vec<Edit> = outcome.edits.iter()
                    .map(|e| e.relabel(to_slot))
                    .sorted()
                    .collect();
                if !seen.insert((image, edits)) {
                    continue;
                }

                if let Some(limit) = self.record_outcome(rule, &outcome, state, &mut groups, &mut group_of)? {
                    return Ok(Some(limit));
                }
            }
        }

        for group in groups {
            if let Some(max) = self.limits.max_reactions {
                if state.reactions.len() >= max {
                    return Ok(Some(Limit::MaxReactions(max)));
                }
            }
            let (baked, propensity_factor) = symmetry_correction(rule, tuple, group.multiplicity);
            let rate = rule.rate().reaction_rate().scaled(group.multiplicity as f64 * baked);
            let reaction = Reaction::new(
                tuple.to_vec(),
                group.products,
                rate,
                propensity_factor,
                rule.name(),
                group.multiplicity,
            );
            debug!("New reaction {}", reaction);
            state.reactions.push(reaction);
        }
        Ok(None)
    }

    /// Splits one rule outcome into product species and adds it to the
    /// group with the same product list.
    fn record_outcome(
        &self,
        rule: &ReactionRule,
        outcome: &Outcome,
        state: &mut GenerationState,
        groups: &mut Vec<ProductGroup>,
        group_of: &mut FxHashMap<Vec<usize>, usize>,
    ) -> Result<Option<Limit>, NetworkError> {
        let parts = outcome.graph.connected_components();
        if !rule.delete_molecules() && parts.len() != rule.products().len() {
            return Ok(None);
        }
        let mut keyed: Vec<(usize, MolGraph)> = parts.iter()
            .map(|group| {
                let key = outcome.anchors.iter()
                    .position(|a| group.contains(a))
                    .unwrap_or(usize::MAX);
                (key, outcome.graph.subgraph(group))
            })
            .collect();
        keyed.sort_by_key(|(k, _)| *k);

        if let Some(limit) = self.violation(rule, keyed.iter().map(|(_, g)| g)) {
            debug!("Rule {} pruned a product: {}", rule.name(), limit);
            state.pruned.get_or_insert(limit);
            return Ok(None);
        }

        let mut products = Vec::with_capacity(keyed.len());
        for (_, g) in &keyed {
            let canonical = state.table.canonical(g)?;
            let index = match state.table.index_of(&canonical) {
                Some(i) => i,
                None => {
                    if let Some(limit) = self.species_limit(state) {
                        return Ok(Some(limit));
                    }
                    let (i, _) = state.table.insert_canonical(canonical)?;
                    debug!("New species S{} {}", i, state.table.species()[i]);
                    state.worklist.push_back(i);
                    i
                }
            };
            products.push(index);
        }

        let key: Vec<usize> = products.iter().copied().sorted().collect();
        match group_of.get(&key) {
            Some(&g) => groups[g].multiplicity += 1,
            None => {
                group_of.insert(key, groups.len());
                groups.push(ProductGroup { products, multiplicity: 1 });
            }
        }
        Ok(None)
    }

    /// `MaxSpecies` if the table cannot take another species.
    fn species_limit(&self, state: &GenerationState) -> Option<Limit> {
        self.limits.max_species
            .filter(|&max| state.table.len() >= max)
            .map(Limit::MaxSpecies)
    }

    /// The first aggregate-size or stoichiometry bound a product breaks.
    fn violation<'a>(
        &self,
        rule: &ReactionRule,
        products: impl Iterator<Item = &'a MolGraph>,
    ) -> Option<Limit> {
        let constraints = rule.constraints();
        let max_size = constraints.max_aggregate_size.or(self.limits.max_aggregate_size);
        let names: Vec<&String> = constraints.max_stoich.keys()
            .chain(self.limits.max_stoich.keys())
            .unique()
            .collect();
        for g in products {
            if let Some(max) = max_size {
                if g.molecule_count() > max {
                    return Some(Limit::AggregateSize(max));
                }
            }
            for name in &names {
                let max = constraints.max_stoich.get(*name)
                    .or_else(|| self.limits.max_stoich.get(*name));
                if let Some(&max) = max {
                    if g.count_of(name) > max {
                        return Some(Limit::Stoichiometry(name.to_string(), max));
                    }
                }
            }
        }
        None
    }
}

/// Rate factor for reactant roles that are filled by the same species and
/// have isomorphic patterns: `1/k!` per group of `k` such roles. Returns
/// (factor folded into the rate, propensity factor).
fn symmetry_correction(rule: &ReactionRule, tuple: &[usize], multiplicity: usize) -> (f64, f64) {
    let classes = rule.pattern_classes();
    let mut groups: FxHashMap<(usize, usize), Vec<usize>> = FxHashMap::default();
    for (role, &s) in tuple.iter().enumerate() {
        groups.entry((classes[role], s)).or_default().push(role);
    }
    let mut baked = 1.;
    let mut propensity = 1.;
    for roles in groups.values().filter(|r| r.len() > 1) {
        let factor = 1. / (1..=roles.len()).product::<usize>() as f64;
        let binds = roles.iter().tuple_combinations()
            .any(|(&a, &b)| rule.binds_equivalent_sites(a, b));
        if binds && multiplicity == 1 {
            baked *= factor;
        } else {
            propensity *= factor;
        }
    }
    (baked, propensity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RateLaw;
    use crate::Parameters;
    use crate::RateContext;

    fn rule(name: &str, text: &str, k: f64) -> ReactionRule {
        ReactionRule::from_notation(name, text, RateLaw::Constant(k)).unwrap()
    }

    fn seeds(species: &[&str]) -> Vec<MolGraph> {
        species.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn only_reaction(network: &Network, rule: &str) -> Reaction {
        let found: Vec<&Reaction> = network.reactions.iter().filter(|r| r.rule() == rule).collect();
        assert_eq!(found.len(), 1, "{}", network);
        found[0].clone()
    }

    fn constant(r: &Reaction) -> f64 {
        let params = Parameters::new();
        r.rate_constant(&RateContext::new(&params))
    }

    #[test]
    fn test_symmetric_sites_multiply_rate() {
        let generator = NetworkGenerator::new(
            vec![rule("bind", "L(r,r) + R(l) -> L(r!1,r).R(l!1)", 0.1)],
            GenerationLimits::default(),
        );
        let network = generator.generate(&seeds(&["L(r,r)", "R(l)"])).unwrap();
        let rxn = only_reaction(&network, "bind");
        assert!((constant(&rxn) - 0.2).abs() < 1e-12);
        assert_eq!(rxn.propensity_factor(), 1.);
        assert_eq!(rxn.multiplicity(), 2);
        assert_eq!(network.species.len(), 3);
        assert!(network.is_complete());
    }

    #[test]
    fn test_symmetric_dimer_dissociation() {
        let generator = NetworkGenerator::new(
            vec![rule("split", "A(x!1).A(x!1) -> A(x) + A(x)", 0.3)],
            GenerationLimits::default(),
        );
        let network = generator.generate(&seeds(&["A(x!1).A(x!1)"])).unwrap();
        let rxn = only_reaction(&network, "split");
        assert!((constant(&rxn) - 0.3).abs() < 1e-12);
        assert_eq!(rxn.propensity_factor(), 1.);
        let monomer = network.species_index("A(x)").unwrap();
        assert_eq!(rxn.products(), &[monomer, monomer]);
    }

    #[test]
    fn test_homodimerization_bakes_half() {
        let generator = NetworkGenerator::new(
            vec![rule("dimerize", "A(x) + A(x) -> A(x!1).A(x!1)", 1.23)],
            GenerationLimits::default(),
        );
        let network = generator.generate(&seeds(&["A(x)"])).unwrap();
        let rxn = only_reaction(&network, "dimerize");
        assert!((constant(&rxn) - 0.615).abs() < 1e-12);
        assert_eq!(rxn.propensity_factor(), 1.);
        assert_eq!(rxn.reactants(), &[0, 0]);
    }

    #[test]
    fn test_symmetric_sites_on_identical_reactants() {
        let generator = NetworkGenerator::new(
            vec![rule("dimerize", "A(x,x) + A(x,x) -> A(x!1,x).A(x!1,x)", 0.1)],
            GenerationLimits { max_species: Some(2), ..Default::default() },
        );
        let network = generator.generate(&seeds(&["A(x,x)"])).unwrap();
        let first = &network.reactions[0];
        assert_eq!(first.reactants(), &[0, 0]);
        assert!((constant(first) - 0.4).abs() < 1e-12);
        assert!((first.propensity_factor() - 0.5).abs() < 1e-12);
        assert_eq!(first.multiplicity(), 4);
    }

    #[test]
    fn test_distinct_species_pair_counted_once() {
        let generator = NetworkGenerator::new(
            vec![rule("dimerize", "A(x) + A(x) -> A(x!1).A(x!1)", 1.0)],
            GenerationLimits::default(),
        );
        let network = generator.generate(&seeds(&["A(x,y~P)", "A(x,y~U)"])).unwrap();
        let p = network.species_index("A(x,y~P)").unwrap();
        let u = network.species_index("A(x,y~U)").unwrap();
        let mixed: Vec<&Reaction> = network.reactions.iter()
            .filter(|r| r.reactants().contains(&p) && r.reactants().contains(&u))
            .collect();
        assert_eq!(mixed.len(), 1);
        assert_eq!(constant(mixed[0]), 1.0);
        assert_eq!(mixed[0].propensity_factor(), 1.);
        assert_eq!(network.species.len(), 5);
        assert_eq!(network.reactions.len(), 3);
    }

    #[test]
    fn test_asymmetric_edit_on_distinct_species_yields_both_products() {
        let generator = NetworkGenerator::new(
            vec![rule("mark", "A(x,s~0) + A(x,s~0) -> A(x!1,s~1).A(x!1,s~0)", 1.)],
            GenerationLimits::default(),
        );
        let network = generator.generate(&seeds(&["A(x,s~0,y~P)", "A(x,s~0,y~U)"])).unwrap();
        let index = |s: &str| {
            let canonical = rn_structure::canonical_form(&s.parse().unwrap()).unwrap();
            network.species_index(&canonical).unwrap()
        };
        let p = index("A(x,s~0,y~P)");
        let u = index("A(x,s~0,y~U)");
        let p_marked = index("A(x!1,s~1,y~P).A(x!1,s~0,y~U)");
        let u_marked = index("A(x!1,s~0,y~P).A(x!1,s~1,y~U)");

        let mixed: Vec<&Reaction> = network.reactions.iter()
            .filter(|r| r.reactants().contains(&p) && r.reactants().contains(&u))
            .collect();
        assert_eq!(mixed.len(), 2, "{}", network);
        let mut products: Vec<usize> = mixed.iter().flat_map(|r| r.products().to_vec()).collect();
        products.sort_unstable();
        let mut expected = vec![p_marked, u_marked];
        expected.sort_unstable();
        assert_eq!(products, expected);
        for r in mixed {
            assert_eq!(constant(r), 1.);
            assert_eq!(r.multiplicity(), 1);
            assert_eq!(r.propensity_factor(), 1.);
        }
        assert_eq!(network.species.len(), 6);
        assert_eq!(network.reactions.len(), 4);
    }

    #[test]
    fn test_max_species_applies_to_seeds() {
        let generator = NetworkGenerator::new(Vec::new(), GenerationLimits { max_species: Some(1), ..Default::default() });
        let network = generator.generate(&seeds(&["A(x)", "B(y)", "C(z)"])).unwrap();
        assert_eq!(network.species.len(), 1);
        assert_eq!(network.status, GenerationStatus::LimitExceeded(Limit::MaxSpecies(1)));

        let network = generator.generate(&seeds(&["A(x)", "A(x)"])).unwrap();
        assert_eq!(network.species.len(), 1);
        assert!(network.is_complete());
    }

    #[test]
    fn test_seed_duplicates_collapse_and_closed_network() {
        let rules = ReactionRule::parse_all(
            "bind", "L(r) + R(l) <-> L(r!1).R(l!1)",
            RateLaw::Constant(1.), Some(RateLaw::Constant(2.)),
        ).unwrap();
        let generator = NetworkGenerator::new(rules, GenerationLimits::default());
        let network = generator.generate(&seeds(&["L(r)", "R(l)", "R(l)", "R(l)"])).unwrap();
        assert_eq!(network.species.len(), 3);
        assert_eq!(network.reactions.len(), 2);
        let back = only_reaction(&network, "bind_reverse");
        assert_eq!(constant(&back), 2.);
        assert_eq!(back.products().len(), 2);
    }

    #[test]
    fn test_max_species_halts_polymerization() {
        let generator = NetworkGenerator::new(
            vec![rule("grow", "A(r) + A(l) -> A(r!1).A(l!1)", 1.)],
            GenerationLimits { max_species: Some(5), ..Default::default() },
        );
        let network = generator.generate(&seeds(&["A(l,r)"])).unwrap();
        assert_eq!(network.species.len(), 5);
        assert_eq!(network.status, GenerationStatus::LimitExceeded(Limit::MaxSpecies(5)));
        for r in &network.reactions {
            assert!(r.reactants().iter().chain(r.products()).all(|&i| i < 5));
        }
    }

    #[test]
    fn test_aggregate_size_prunes() {
        let generator = NetworkGenerator::new(
            vec![rule("grow", "A(r) + A(l) -> A(r!1).A(l!1)", 1.)],
            GenerationLimits { max_aggregate_size: Some(3), ..Default::default() },
        );
        let network = generator.generate(&seeds(&["A(l,r)"])).unwrap();
        // linear chains of length 1, 2 and 3
        assert_eq!(network.species.len(), 3);
        assert!(network.species.iter().all(|s| s.molecule_count() <= 3));
        assert_eq!(network.status, GenerationStatus::LimitExceeded(Limit::AggregateSize(3)));
    }

    #[test]
    fn test_max_stoich_per_rule() {
        let mut constraints = crate::RuleConstraints::default();
        constraints.max_stoich.insert("A".to_string(), 2);
        let grow = rule("grow", "A(r) + A(l) -> A(r!1).A(l!1)", 1.).with_constraints(constraints);
        let generator = NetworkGenerator::new(vec![grow], GenerationLimits::default());
        let network = generator.generate(&seeds(&["A(l,r)"])).unwrap();
        assert_eq!(network.species.len(), 2);
        assert!(matches!(network.status, GenerationStatus::LimitExceeded(Limit::Stoichiometry(_, 2))));
    }

    #[test]
    fn test_synthesis_degradation_and_state_changes() {
        let rules = vec![
            rule("syn", "0 -> K(a~U)", 5.),
            rule("phos", "K(a~U) -> K(a~P)", 1.),
            rule("deg", "K(a~P) -> 0", 0.5),
        ];
        let generator = NetworkGenerator::new(rules, GenerationLimits::default());
        let network = generator.generate(&[]).unwrap();
        assert_eq!(network.species.len(), 2);
        let syn = only_reaction(&network, "syn");
        assert!(syn.reactants().is_empty());
        let deg = only_reaction(&network, "deg");
        assert!(deg.products().is_empty());
        assert_eq!(network.species[only_reaction(&network, "phos").products()[0]].canonical(), "K(a~P)");
    }

    #[test]
    fn test_dynamic_rates_keep_scale() {
        let generator = NetworkGenerator::new(
            vec![ReactionRule::from_notation("bind", "L(r,r) + R(l) -> L(r!1,r).R(l!1)", RateLaw::parameter("kon")).unwrap()],
            GenerationLimits::default(),
        );
        let network = generator.generate(&seeds(&["L(r,r)", "R(l)"])).unwrap();
        let rxn = only_reaction(&network, "bind");
        let params: Parameters = [("kon", 3.0)].into_iter().collect();
        assert_eq!(rxn.rate_constant(&RateContext::new(&params)), 6.0);
        assert!(rxn.rate().is_dynamic());
    }

    #[test]
    fn test_cancel_and_progress() {
        let generator = NetworkGenerator::new(
            vec![rule("grow", "A(r) + A(l) -> A(r!1).A(l!1)", 1.)],
            GenerationLimits { max_aggregate_size: Some(6), progress_interval: 1, ..Default::default() },
        );
        let cancel = AtomicBool::new(true);
        let network = generator.generate_with(&seeds(&["A(l,r)"]), Some(&cancel), |_| {}).unwrap();
        assert_eq!(network.status, GenerationStatus::Cancelled);
        assert_eq!(network.species.len(), 1);

        let mut reports = Vec::new();
        let network = generator.generate_with(&seeds(&["A(l,r)"]), None, |p| reports.push(p.iteration)).unwrap();
        assert_eq!(reports, (1..=6).collect::<Vec<_>>());
        assert_eq!(network.species.len(), 6);
    }

    #[test]
    fn test_step_state_machine() {
        let generator = NetworkGenerator::new(
            vec![rule("split", "A(x!1).B(y!1) -> A(x) + B(y)", 1.)],
            GenerationLimits::default(),
        );
        let mut state = generator.initialize(&seeds(&["A(x!1).B(y!1)"])).unwrap();
        assert_eq!(state.phase(), &GenerationPhase::Pending);
        assert_eq!(state.pending(), 1);
        generator.step(&mut state).unwrap();
        assert_eq!(state.phase(), &GenerationPhase::Pending);
        assert_eq!(state.species().len(), 3);
        generator.step(&mut state).unwrap();
        generator.step(&mut state).unwrap();
        generator.step(&mut state).unwrap();
        assert_eq!(state.phase(), &GenerationPhase::Done(GenerationStatus::Complete));
        let network = state.into_network();
        assert_eq!(network.reactions.len(), 1);

        let export = network.to_serializable();
        let json = serde_json::to_string(&export).unwrap();
        let back: NetworkExport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, export);
    }
}
