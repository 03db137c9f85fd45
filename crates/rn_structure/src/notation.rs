//! Compact text notation for molecule graphs and patterns.
//!
//! ```text
//! A(x~P!1,y).B(z!1)      two bonded molecules
//! A(x!+)                 x bound to something
//! A(x!?,y~?)             x bound or not, any state of y
//! R(l)@PM                molecule in compartment PM
//! @EC::L(r!1).R(l!1)     species-level compartment
//! ```

use std::fmt;
use std::str::FromStr;
use rustc_hash::FxHashMap;

use crate::BondState;
use crate::Component;
use crate::Molecule;
use crate::MolGraph;
use crate::Site;
use crate::StructureError;

const SOURCE: &str = "molecule notation";

struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().filter(|c| !c.is_whitespace()).collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), StructureError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    fn error(&self) -> StructureError {
        let tok = match self.peek() {
            Some(c) => c.to_string(),
            None => "end of string".to_string(),
        };
        StructureError::InvalidToken(tok, SOURCE.to_string(), self.pos)
    }

    fn identifier(&mut self) -> Result<String, StructureError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error());
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }
}

enum BondToken {
    Label(String),
    Occupied,
    Any,
}

fn parse_component(cur: &mut Cursor) -> Result<(Component, Option<BondToken>), StructureError> {
    let name = cur.identifier()?;
    let mut comp = Component::new(&name);
    let mut bond = None;
    loop {
        if cur.eat('~') {
            if cur.eat('?') {
                comp.set_state(None);
            } else {
                let state = cur.identifier()?;
                comp.set_state(Some(state));
            }
        } else if cur.eat('!') {
            if bond.is_some() {
                return Err(cur.error());
            }
            bond = Some(if cur.eat('+') {
                BondToken::Occupied
            } else if cur.eat('?') {
                BondToken::Any
            } else {
                BondToken::Label(cur.identifier()?)
            });
        } else {
            break;
        }
    }
    Ok((comp, bond))
}

impl FromStr for MolGraph {
    type Err = StructureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cur = Cursor::new(s);
        let mut graph = MolGraph::new();

        if cur.eat('@') {
            let comp = cur.identifier()?;
            cur.expect(':')?;
            cur.expect(':')?;
            graph.set_compartment(Some(&comp));
        }

        let mut open: FxHashMap<String, Site> = FxHashMap::default();
        let mut closed: Vec<String> = Vec::new();
        loop {
            let name = cur.identifier()?;
            let mut comps = Vec::new();
            let mut bonds = Vec::new();
            if cur.eat('(') {
                if !cur.eat(')') {
                    loop {
                        let (comp, bond) = parse_component(&mut cur)?;
                        bonds.push(bond);
                        comps.push(comp);
                        if cur.eat(')') {
                            break;
                        }
                        cur.expect(',')?;
                    }
                }
            }
            let mut molecule = Molecule::new(&name, comps);
            if cur.eat('@') {
                let comp = cur.identifier()?;
                molecule = molecule.with_compartment(&comp);
            }
            let mi = graph.add_molecule(molecule);

            for (ci, bond) in bonds.into_iter().enumerate() {
                let here = Site::new(mi, ci);
                match bond {
                    None => {}
                    Some(BondToken::Occupied) => graph.set_bond_wildcard(here, BondState::Occupied)?,
                    Some(BondToken::Any) => graph.set_bond_wildcard(here, BondState::Any)?,
                    Some(BondToken::Label(label)) => {
                        if closed.contains(&label) {
                            return Err(StructureError::OverusedBond(label));
                        }
                        match open.remove(&label) {
                            Some(there) => {
                                graph.bind(there, here)?;
                                closed.push(label);
                            }
                            None => {
                                open.insert(label, here);
                            }
                        }
                    }
                }
            }

            if cur.eat('.') {
                continue;
            }
            if cur.peek().is_some() {
                return Err(cur.error());
            }
            break;
        }

        if let Some(label) = open.into_keys().min() {
            return Err(StructureError::UnmatchedBond(label));
        }
        Ok(graph)
    }
}

impl TryFrom<&str> for MolGraph {
    type Error = StructureError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Serialize molecules in the given order, each molecule's components in
/// the given order. Bond labels are numbered by first appearance.
pub(crate) fn serialize(graph: &MolGraph, mol_order: &[usize], comp_order: &[Vec<usize>]) -> String {
    let mut labels: FxHashMap<Site, usize> = FxHashMap::default();
    let mut next_label = 1;
    let mut out = String::new();
    if let Some(c) = graph.compartment() {
        out.push('@');
        out.push_str(c);
        out.push_str("::");
    }
    for (k, &mi) in mol_order.iter().enumerate() {
        if k > 0 {
            out.push('.');
        }
        let m = &graph.molecules()[mi];
        out.push_str(m.name());
        out.push('(');
        for (j, &ci) in comp_order[mi].iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            let c = &m.components()[ci];
            out.push_str(&c.label());
            match c.bond() {
                BondState::Free => {}
                BondState::Occupied => out.push_str("!+"),
                BondState::Any => out.push_str("!?"),
                BondState::Bound(partner) => {
                    let here = Site::new(mi, ci);
                    let label = match labels.get(&here) {
                        Some(&l) => l,
                        None => {
                            let l = next_label;
                            next_label += 1;
                            labels.insert(partner, l);
                            l
                        }
                    };
                    out.push('!');
                    out.push_str(&label.to_string());
                }
            }
        }
        out.push(')');
        if let Some(c) = m.compartment() {
            out.push('@');
            out.push_str(c);
        }
    }
    out
}

impl fmt::Display for MolGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order: Vec<usize> = (0..self.molecule_count()).collect();
        let comps: Vec<Vec<usize>> = self.molecules().iter()
            .map(|m| (0..m.len()).collect())
            .collect();
        write!(f, "{}", serialize(self, &order, &comps))
    }
}
