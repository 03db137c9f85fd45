use std::fmt;

/// Address of a component inside a [`crate::MolGraph`]: the molecule index
/// and the component index within that molecule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Site {
    pub molecule: usize,
    pub component: usize,
}

impl Site {
    pub fn new(molecule: usize, component: usize) -> Self {
        Self { molecule, component }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.molecule, self.component)
    }
}

/// The bond slot of a component.
///
/// Species only ever use `Free` and `Bound`. Patterns may additionally use
/// `Occupied` (`!+`, bound to an unspecified partner) and `Any` (`!?`, bound
/// or not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BondState {
    Free,
    Bound(Site),
    Occupied,
    Any,
}

impl BondState {
    pub fn partner(&self) -> Option<Site> {
        match self {
            BondState::Bound(site) => Some(*site),
            _ => None,
        }
    }

    /// True if the slot is (known to be) taken.
    pub fn is_bound(&self) -> bool {
        matches!(self, BondState::Bound(_) | BondState::Occupied)
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, BondState::Occupied | BondState::Any)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Component {
    name: String,
    state: Option<String>,
    bond: BondState,
}

impl Component {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: None,
            bond: BondState::Free,
        }
    }

    pub fn with_state(name: &str, state: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Some(state.to_string()),
            bond: BondState::Free,
        }
    }

    pub fn with_bond(mut self, bond: BondState) -> Self {
        self.bond = bond;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    pub fn bond(&self) -> BondState {
        self.bond
    }

    pub(crate) fn set_bond(&mut self, bond: BondState) {
        self.bond = bond;
    }

    pub(crate) fn set_state(&mut self, state: Option<String>) {
        self.state = state;
    }

    /// Name and state, the part of a component that does not depend on
    /// bonds (e.g. `"x~P"`).
    pub fn label(&self) -> String {
        match &self.state {
            Some(s) => format!("{}~{}", self.name, s),
            None => self.name.clone(),
        }
    }
}

/// A molecule instance: a name, its components and an optional compartment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Molecule {
    name: String,
    components: Vec<Component>,
    compartment: Option<String>,
}

impl Molecule {
    pub fn new(name: &str, components: Vec<Component>) -> Self {
        Self {
            name: name.to_string(),
            components,
            compartment: None,
        }
    }

    pub fn with_compartment(mut self, compartment: &str) -> Self {
        self.compartment = Some(compartment.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compartment(&self) -> Option<&str> {
        self.compartment.as_deref()
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn component(&self, idx: usize) -> Option<&Component> {
        self.components.get(idx)
    }

    pub(crate) fn components_mut(&mut self) -> &mut [Component] {
        &mut self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Two molecules are of the same type iff names and component-name
    /// multisets agree. States and bonds are ignored.
    pub fn same_type(&self, other: &Molecule) -> bool {
        if self.name != other.name || self.components.len() != other.components.len() {
            return false;
        }
        let mut a: Vec<&str> = self.components.iter().map(|c| c.name()).collect();
        let mut b: Vec<&str> = other.components.iter().map(|c| c.name()).collect();
        a.sort_unstable();
        b.sort_unstable();
        a == b
    }

    /// Local invariant used to seed canonical coloring.
    pub(crate) fn signature(&self) -> String {
        let mut labels: Vec<String> = self.components.iter()
            .map(|c| {
                let b = match c.bond() {
                    BondState::Free => "",
                    BondState::Bound(_) => "!",
                    BondState::Occupied => "!+",
                    BondState::Any => "!?",
                };
                format!("{}{}", c.label(), b)
            })
            .collect();
        labels.sort();
        format!("{}@{}({})", self.name, self.compartment.as_deref().unwrap_or(""), labels.join(","))
    }
}
