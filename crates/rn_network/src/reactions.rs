use std::fmt;
use std::sync::Arc;
use ahash::AHashMap;

/// Named numeric model parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    values: AHashMap<String, f64>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn set(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parameters sorted by name.
    pub fn iter_sorted(&self) -> Vec<(&str, f64)> {
        let mut v: Vec<(&str, f64)> = self.values.iter().map(|(k, &x)| (k.as_str(), x)).collect();
        v.sort_by(|a, b| a.0.cmp(b.0));
        v
    }
}

impl<S: AsRef<str>> FromIterator<(S, f64)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.as_ref().to_string(), v)).collect(),
        }
    }
}

/// Everything a dynamic rate may depend on at evaluation time.
#[derive(Debug, Clone, Copy)]
pub struct RateContext<'a> {
    pub time: f64,
    pub parameters: &'a Parameters,
    pub observable_names: &'a [String],
    pub observables: &'a [f64],
}

impl<'a> RateContext<'a> {
    pub fn new(parameters: &'a Parameters) -> Self {
        Self {
            time: 0.,
            parameters,
            observable_names: &[],
            observables: &[],
        }
    }

    pub fn observable(&self, name: &str) -> Option<f64> {
        self.observable_names.iter()
            .position(|n| n == name)
            .and_then(|i| self.observables.get(i).copied())
    }
}

/// A rate constant that is re-evaluated during integration.
pub trait RateExpression: Send + Sync {
    fn evaluate(&self, ctx: &RateContext) -> f64;

    /// Short human readable form, used in network exports.
    fn describe(&self) -> String {
        "function".to_string()
    }

    /// False if the value only depends on parameters, so that it can be
    /// evaluated once per phase.
    fn depends_on_state(&self) -> bool {
        true
    }
}

impl<F> RateExpression for F
where
    F: Fn(&RateContext) -> f64 + Send + Sync,
{
    fn evaluate(&self, ctx: &RateContext) -> f64 {
        self(ctx)
    }
}

/// Reads a named parameter, so that parameter overrides change the rate.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterRate(pub String);

impl RateExpression for ParameterRate {
    fn evaluate(&self, ctx: &RateContext) -> f64 {
        ctx.parameters.get(&self.0).unwrap_or(0.)
    }

    fn describe(&self) -> String {
        self.0.clone()
    }

    fn depends_on_state(&self) -> bool {
        false
    }
}

/// The rate of a generated reaction: a number, or an expression times a
/// fixed scale (multiplicity and symmetry corrections).
#[derive(Clone)]
pub enum ReactionRate {
    Constant(f64),
    Dynamic {
        expression: Arc<dyn RateExpression>,
        scale: f64,
    },
}

impl ReactionRate {
    pub fn evaluate(&self, ctx: &RateContext) -> f64 {
        match self {
            ReactionRate::Constant(k) => *k,
            ReactionRate::Dynamic { expression, scale } => scale * expression.evaluate(ctx),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, ReactionRate::Dynamic { .. })
    }

    pub(crate) fn scaled(&self, factor: f64) -> Self {
        match self {
            ReactionRate::Constant(k) => ReactionRate::Constant(k * factor),
            ReactionRate::Dynamic { expression, scale } => ReactionRate::Dynamic {
                expression: Arc::clone(expression),
                scale: scale * factor,
            },
        }
    }
}

impl fmt::Debug for ReactionRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactionRate::Constant(k) => write!(f, "Constant({})", k),
            ReactionRate::Dynamic { expression, scale } => {
                write!(f, "Dynamic({} * {})", scale, expression.describe())
            }
        }
    }
}

impl fmt::Display for ReactionRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactionRate::Constant(k) => write!(f, "{}", k),
            ReactionRate::Dynamic { expression, scale } if *scale == 1. => {
                write!(f, "{}", expression.describe())
            }
            ReactionRate::Dynamic { expression, scale } => {
                write!(f, "{}*{}", scale, expression.describe())
            }
        }
    }
}

/// A concrete reaction between species of a generated network.
#[derive(Debug, Clone)]
pub struct Reaction {
    reactants: Vec<usize>,
    products: Vec<usize>,
    rate: ReactionRate,
    propensity_factor: f64,
    rule: String,
    multiplicity: usize,
}

impl Reaction {
    pub fn new(
        reactants: Vec<usize>,
        products: Vec<usize>,
        rate: ReactionRate,
        propensity_factor: f64,
        rule: &str,
        multiplicity: usize,
    ) -> Self {
        Self {
            reactants,
            products,
            rate,
            propensity_factor,
            rule: rule.to_string(),
            multiplicity,
        }
    }

    pub fn reactants(&self) -> &[usize] {
        &self.reactants
    }

    pub fn products(&self) -> &[usize] {
        &self.products
    }

    pub fn rate(&self) -> &ReactionRate {
        &self.rate
    }

    /// Rate constant as stored (multiplicity and baked symmetry included).
    /// Dynamic rates are evaluated with `ctx`.
    pub fn rate_constant(&self, ctx: &RateContext) -> f64 {
        self.rate.evaluate(ctx)
    }

    pub fn propensity_factor(&self) -> f64 {
        self.propensity_factor
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }

    pub fn multiplicity(&self) -> usize {
        self.multiplicity
    }

    /// Net change of each species, as (species, delta) pairs sorted by
    /// species index. Species that cancel out are omitted.
    pub fn stoichiometry(&self) -> Vec<(usize, i32)> {
        let mut net: AHashMap<usize, i32> = AHashMap::new();
        for &r in &self.reactants {
            *net.entry(r).or_default() -= 1;
        }
        for &p in &self.products {
            *net.entry(p).or_default() += 1;
        }
        let mut v: Vec<(usize, i32)> = net.into_iter().filter(|&(_, d)| d != 0).collect();
        v.sort_unstable();
        v
    }
}

impl fmt::Display for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |v: &[usize]| if v.is_empty() {
            "0".to_string()
        } else {
            v.iter().map(|i| format!("S{}", i)).collect::<Vec<_>>().join(" + ")
        };
        write!(f, "[{}] {} -> {} ({}", self.rule, side(&self.reactants), side(&self.products), self.rate)?;
        if self.propensity_factor != 1. {
            write!(f, ", x{}", self.propensity_factor)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_rate_follows_overrides() {
        let mut params: Parameters = [("kf", 2.0)].into_iter().collect();
        let rate = ReactionRate::Dynamic {
            expression: Arc::new(ParameterRate("kf".to_string())),
            scale: 0.5,
        };
        assert_eq!(rate.evaluate(&RateContext::new(&params)), 1.0);
        params.set("kf", 10.0);
        assert_eq!(rate.evaluate(&RateContext::new(&params)), 5.0);
        assert_eq!(format!("{}", rate), "0.5*kf");
    }

    #[test]
    fn test_closure_rate_and_scaling() {
        fn ramp(ctx: &RateContext) -> f64 {
            1.0 + ctx.time
        }
        let params = Parameters::new();
        let expression: Arc<dyn RateExpression> = Arc::new(ramp);
        let rate = ReactionRate::Dynamic { expression, scale: 1. }.scaled(3.);
        let mut ctx = RateContext::new(&params);
        ctx.time = 1.0;
        assert_eq!(rate.evaluate(&ctx), 6.0);
        assert!(rate.is_dynamic());
        assert_eq!(ReactionRate::Constant(0.2).scaled(2.).evaluate(&ctx), 0.4);
    }

    #[test]
    fn test_observable_lookup() {
        let params = Parameters::new();
        let names = vec!["Atot".to_string(), "Btot".to_string()];
        let values = vec![1.5, 2.5];
        let ctx = RateContext {
            time: 0.,
            parameters: &params,
            observable_names: &names,
            observables: &values,
        };
        assert_eq!(ctx.observable("Btot"), Some(2.5));
        assert_eq!(ctx.observable("Ctot"), None);
    }

    #[test]
    fn test_reaction_display_and_stoichiometry() {
        let rxn = Reaction::new(vec![0, 0], vec![1], ReactionRate::Constant(0.615), 1., "dimerize", 1);
        assert_eq!(format!("{}", rxn), "[dimerize] S0 + S0 -> S1 (0.615)");
        assert_eq!(rxn.stoichiometry(), vec![(0, -2), (1, 1)]);

        let cat = Reaction::new(vec![0, 1], vec![0, 2], ReactionRate::Constant(1.), 0.5, "cat", 2);
        assert_eq!(cat.stoichiometry(), vec![(1, -1), (2, 1)]);
        assert_eq!(format!("{}", cat), "[cat] S0 + S1 -> S0 + S2 (1, x0.5)");
    }
}
