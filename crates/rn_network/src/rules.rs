use std::fmt;
use std::sync::Arc;
use ahash::{AHashMap, AHashSet};
use itertools::Itertools;

use rn_structure::MolGraph;
use rn_structure::canonical_form;

use crate::NetworkError;
use crate::ParameterRate;
use crate::RateExpression;
use crate::ReactionRate;
use crate::RuleTransform;

/// The base rate of a rule.
#[derive(Clone)]
pub enum RateLaw {
    Constant(f64),
    Dynamic(Arc<dyn RateExpression>),
}

impl RateLaw {
    /// A rate that reads parameter `name` whenever it is evaluated.
    pub fn parameter(name: &str) -> Self {
        RateLaw::Dynamic(Arc::new(ParameterRate(name.to_string())))
    }

    pub(crate) fn reaction_rate(&self) -> ReactionRate {
        match self {
            RateLaw::Constant(k) => ReactionRate::Constant(*k),
            RateLaw::Dynamic(e) => ReactionRate::Dynamic { expression: Arc::clone(e), scale: 1. },
        }
    }
}

impl fmt::Debug for RateLaw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLaw::Constant(k) => write!(f, "Constant({})", k),
            RateLaw::Dynamic(e) => write!(f, "Dynamic({})", e.describe()),
        }
    }
}

/// Rule level restrictions on the products a rule may create.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleConstraints {
    pub max_aggregate_size: Option<usize>,
    pub max_stoich: AHashMap<String, usize>,
}

/// A graph rewriting rule with mass-action kinetics.
#[derive(Debug, Clone)]
pub struct ReactionRule {
    name: String,
    reactants: Vec<MolGraph>,
    products: Vec<MolGraph>,
    rate: RateLaw,
    constraints: RuleConstraints,
    delete_molecules: bool,
    transform: RuleTransform,
    /// Per reactant role: the first role with an isomorphic pattern.
    pattern_classes: Vec<usize>,
}

/// Split a side of a rule at `+` signs that are not part of a `!+` bond.
fn split_patterns(side: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut prev = ' ';
    for (i, c) in side.char_indices() {
        if c == '+' && prev != '!' {
            parts.push(&side[start..i]);
            start = i + 1;
        }
        if !c.is_whitespace() {
            prev = c;
        }
    }
    parts.push(&side[start..]);
    parts
}

fn parse_side(rule: &str, side: &str) -> Result<Vec<MolGraph>, NetworkError> {
    let side = side.trim();
    if side == "0" {
        return Ok(Vec::new());
    }
    split_patterns(side).into_iter()
        .map(|p| p.trim().parse::<MolGraph>()
            .map_err(|e| NetworkError::InvalidRule(rule.to_string(), format!("'{}': {}", p.trim(), e))))
        .collect()
}

/// Reactant and product patterns of `text`, and whether the arrow is `<->`.
fn parse_rule(name: &str, text: &str) -> Result<(Vec<MolGraph>, Vec<MolGraph>, bool), NetworkError> {
    let (lhs, rhs, reversible) = if let Some((l, r)) = text.split_once("<->") {
        (l, r, true)
    } else if let Some((l, r)) = text.split_once("->") {
        (l, r, false)
    } else {
        return Err(NetworkError::InvalidRule(name.to_string(), "missing reaction arrow".to_string()));
    };
    Ok((parse_side(name, lhs)?, parse_side(name, rhs)?, reversible))
}

impl ReactionRule {
    pub fn new(
        name: &str,
        reactants: Vec<MolGraph>,
        products: Vec<MolGraph>,
        rate: RateLaw,
    ) -> Result<Self, NetworkError> {
        Self::build(name, reactants, products, rate, RuleConstraints::default(), false)
    }

    fn build(
        name: &str,
        reactants: Vec<MolGraph>,
        products: Vec<MolGraph>,
        rate: RateLaw,
        constraints: RuleConstraints,
        delete_molecules: bool,
    ) -> Result<Self, NetworkError> {
        if reactants.iter().any(|r| r.is_empty()) || products.iter().any(|p| p.is_empty()) {
            return Err(NetworkError::InvalidRule(name.to_string(), "empty pattern".to_string()));
        }
        let transform = RuleTransform::new(&reactants, &products, delete_molecules)
            .map_err(|reason| NetworkError::InvalidRule(name.to_string(), reason))?;
        let forms: Vec<String> = reactants.iter()
            .map(canonical_form)
            .collect::<Result<_, _>>()?;
        let pattern_classes = (0..forms.len())
            .map(|i| forms.iter().position(|f| *f == forms[i]).unwrap_or(i))
            .collect();
        Ok(Self {
            name: name.to_string(),
            reactants,
            products,
            rate,
            constraints,
            delete_molecules,
            transform,
            pattern_classes,
        })
    }

    /// Parse an irreversible rule such as `L(r) + R(l) -> L(r!1).R(l!1)`.
    /// `0` stands for an empty side.
    pub fn from_notation(name: &str, text: &str, rate: RateLaw) -> Result<Self, NetworkError> {
        let (reactants, products, reversible) = parse_rule(name, text)?;
        if reversible {
            return Err(NetworkError::InvalidRule(name.to_string(), "reversible rule needs two rates".to_string()));
        }
        Self::new(name, reactants, products, rate)
    }

    /// Parse a rule written with either arrow. A `<->` rule expands into a
    /// forward and a reverse rule, the latter requires `reverse` to be given.
    pub fn parse_all(
        name: &str,
        text: &str,
        forward: RateLaw,
        reverse: Option<RateLaw>,
    ) -> Result<Vec<Self>, NetworkError> {
        let (reactants, products, reversible) = parse_rule(name, text)?;
        match (reversible, reverse) {
            (false, None) => Ok(vec![Self::new(name, reactants, products, forward)?]),
            (true, Some(rev)) => {
                let fwd = Self::new(name, reactants, products, forward)?;
                let back = fwd.reverse(rev)?;
                Ok(vec![fwd, back])
            }
            (false, Some(_)) => Err(NetworkError::InvalidRule(
                name.to_string(), "reverse rate given for an irreversible rule".to_string(),
            )),
            (true, None) => Err(NetworkError::InvalidRule(
                name.to_string(), "reversible rule needs two rates".to_string(),
            )),
        }
    }

    /// Forward and reverse rule of a `<->` rule.
    pub fn reversible(name: &str, text: &str, forward: RateLaw, reverse: RateLaw) -> Result<(Self, Self), NetworkError> {
        let mut rules = Self::parse_all(name, text, forward, Some(reverse))?.into_iter();
        match (rules.next(), rules.next()) {
            (Some(f), Some(r)) => Ok((f, r)),
            _ => Err(NetworkError::InvalidRule(name.to_string(), "expected a '<->' arrow".to_string())),
        }
    }

    /// The same rule with both sides swapped.
    pub fn reverse(&self, rate: RateLaw) -> Result<Self, NetworkError> {
        Self::build(
            &format!("{}_reverse", self.name),
            self.products.clone(),
            self.reactants.clone(),
            rate,
            self.constraints.clone(),
            self.delete_molecules,
        )
    }

    pub fn with_constraints(mut self, constraints: RuleConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Delete only the matched molecules when a reactant pattern vanishes,
    /// instead of the whole species.
    pub fn with_delete_molecules(self, delete_molecules: bool) -> Result<Self, NetworkError> {
        Self::build(&self.name, self.reactants, self.products, self.rate, self.constraints, delete_molecules)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reactants(&self) -> &[MolGraph] {
        &self.reactants
    }

    pub fn products(&self) -> &[MolGraph] {
        &self.products
    }

    pub fn rate(&self) -> &RateLaw {
        &self.rate
    }

    pub fn constraints(&self) -> &RuleConstraints {
        &self.constraints
    }

    pub fn delete_molecules(&self) -> bool {
        self.delete_molecules
    }

    pub fn transform(&self) -> &RuleTransform {
        &self.transform
    }

    pub(crate) fn pattern_classes(&self) -> &[usize] {
        &self.pattern_classes
    }

    /// Roles with isomorphic patterns draw from the same species multiset;
    /// only tuples that list their species in non-decreasing order are
    /// enumerated. [`ReactionRule::role_orders`] recovers the other
    /// assignments of a tuple.
    pub(crate) fn accepts_tuple(&self, tuple: &[usize]) -> bool {
        (0..tuple.len()).tuple_combinations()
            .all(|(i, j)| self.pattern_classes[i] != self.pattern_classes[j] || tuple[i] <= tuple[j])
    }

    /// Distinct ways to fill the roles with the species of `tuple` by
    /// permuting species among roles with isomorphic patterns. Each order
    /// maps a role to the slot of `tuple` that fills it; the identity comes
    /// first.
    pub(crate) fn role_orders(&self, tuple: &[usize]) -> Vec<Vec<usize>> {
        let n = tuple.len();
        let mut seen: AHashSet<Vec<usize>> = AHashSet::new();
        (0..n).permutations(n)
            .filter(|order| order.iter().enumerate()
                .all(|(role, &slot)| self.pattern_classes[role] == self.pattern_classes[slot]))
            .filter(|order| seen.insert(order.iter().map(|&slot| tuple[slot]).collect()))
            .collect()
    }

    pub(crate) fn binds_equivalent_sites(&self, a: usize, b: usize) -> bool {
        self.transform.binds_equivalent_sites(&self.reactants, a, b)
    }
}

impl fmt::Display for ReactionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |v: &[MolGraph]| if v.is_empty() {
            "0".to_string()
        } else {
            v.iter().map(|g| g.to_string()).join(" + ")
        };
        write!(f, "{}: {} -> {} {:?}", self.name, side(&self.reactants), side(&self.products), self.rate)
    }
}
