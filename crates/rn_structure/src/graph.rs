use std::collections::VecDeque;

use crate::BondState;
use crate::Molecule;
use crate::Site;
use crate::Component;
use crate::StructureError;

/// An undirected graph of molecule instances connected by bonds between
/// components.
///
/// The same type is used for concrete species and for (partially specified)
/// patterns. Each graph owns its storage, so `clone()` gives an independent
/// copy that can be edited freely.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MolGraph {
    molecules: Vec<Molecule>,
    compartment: Option<String>,
}

impl MolGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from molecules whose bond slots already reference each
    /// other. Fails if a bond is not mirrored on the partner site.
    pub fn from_molecules(molecules: Vec<Molecule>) -> Result<Self, StructureError> {
        let graph = Self { molecules, compartment: None };
        graph.validate()?;
        Ok(graph)
    }

    pub fn molecules(&self) -> &[Molecule] {
        &self.molecules
    }

    pub fn molecule(&self, idx: usize) -> Option<&Molecule> {
        self.molecules.get(idx)
    }

    pub fn molecule_count(&self) -> usize {
        self.molecules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.molecules.is_empty()
    }

    pub fn compartment(&self) -> Option<&str> {
        self.compartment.as_deref()
    }

    pub fn set_compartment(&mut self, compartment: Option<&str>) {
        self.compartment = compartment.map(|c| c.to_string());
    }

    /// Number of molecules with the given name.
    pub fn count_of(&self, name: &str) -> usize {
        self.molecules.iter().filter(|m| m.name() == name).count()
    }

    /// Append a molecule and return its index. Any `Bound` slots on the new
    /// molecule are reset to `Free`; use [`MolGraph::bind`] afterwards.
    pub fn add_molecule(&mut self, mut molecule: Molecule) -> usize {
        for c in molecule.components_mut() {
            if let BondState::Bound(_) = c.bond() {
                c.set_bond(BondState::Free);
            }
        }
        self.molecules.push(molecule);
        self.molecules.len() - 1
    }

    pub fn component(&self, site: Site) -> Option<&Component> {
        self.molecules.get(site.molecule)
            .and_then(|m| m.component(site.component))
    }

    fn component_mut(&mut self, site: Site) -> Result<&mut Component, StructureError> {
        self.molecules.get_mut(site.molecule)
            .and_then(|m| m.components_mut().get_mut(site.component))
            .ok_or(StructureError::InvalidSite(site))
    }

    pub fn partner(&self, site: Site) -> Option<Site> {
        self.component(site).and_then(|c| c.bond().partner())
    }

    pub fn state(&self, site: Site) -> Option<&str> {
        self.component(site).and_then(|c| c.state())
    }

    /// Create a bond between two free components.
    pub fn bind(&mut self, a: Site, b: Site) -> Result<(), StructureError> {
        if a == b {
            return Err(StructureError::InvalidBond(a, b));
        }
        let free_a = self.component(a).ok_or(StructureError::InvalidSite(a))?.bond();
        let free_b = self.component(b).ok_or(StructureError::InvalidSite(b))?.bond();
        if free_a != BondState::Free || free_b != BondState::Free {
            return Err(StructureError::InvalidBond(a, b));
        }
        self.component_mut(a)?.set_bond(BondState::Bound(b));
        self.component_mut(b)?.set_bond(BondState::Bound(a));
        Ok(())
    }

    /// Release the bond at `site`; returns the former partner, if the slot
    /// held a concrete bond.
    pub fn unbind(&mut self, site: Site) -> Result<Option<Site>, StructureError> {
        let old = self.component(site).ok_or(StructureError::InvalidSite(site))?.bond();
        self.component_mut(site)?.set_bond(BondState::Free);
        if let BondState::Bound(partner) = old {
            self.component_mut(partner)?.set_bond(BondState::Free);
            return Ok(Some(partner));
        }
        Ok(None)
    }

    pub fn set_state(&mut self, site: Site, state: Option<&str>) -> Result<(), StructureError> {
        self.component_mut(site)?.set_state(state.map(|s| s.to_string()));
        Ok(())
    }

    /// Overwrite a bond slot without touching the partner. Only meant for
    /// pattern construction (wildcards).
    pub fn set_bond_wildcard(&mut self, site: Site, bond: BondState) -> Result<(), StructureError> {
        if let BondState::Bound(_) = bond {
            return Err(StructureError::InvalidSite(site));
        }
        let comp = self.component_mut(site)?;
        if let BondState::Bound(_) = comp.bond() {
            return Err(StructureError::InvalidBond(site, site));
        }
        comp.set_bond(bond);
        Ok(())
    }

    /// All bonds, each reported once with the smaller site first.
    pub fn bonds(&self) -> Vec<(Site, Site)> {
        let mut bonds = Vec::new();
        for (mi, m) in self.molecules.iter().enumerate() {
            for (ci, c) in m.components().iter().enumerate() {
                let here = Site::new(mi, ci);
                if let BondState::Bound(there) = c.bond() {
                    if here < there {
                        bonds.push((here, there));
                    }
                }
            }
        }
        bonds
    }

    /// Iterate (component index, partner site) over the bonds of a molecule.
    pub fn neighbors(&self, molecule: usize) -> impl Iterator<Item = (usize, Site)> + '_ {
        self.molecules[molecule].components().iter().enumerate()
            .filter_map(|(ci, c)| c.bond().partner().map(|p| (ci, p)))
    }

    /// True if no component uses a bond wildcard.
    pub fn is_concrete(&self) -> bool {
        self.molecules.iter()
            .all(|m| m.components().iter().all(|c| !c.bond().is_wildcard()))
    }

    /// Molecule indices grouped by connectivity. Groups are sorted internally
    /// and ordered by their smallest member.
    pub fn connected_components(&self) -> Vec<Vec<usize>> {
        let n = self.molecules.len();
        let mut seen = vec![false; n];
        let mut groups = Vec::new();
        for start in 0..n {
            if seen[start] {
                continue;
            }
            seen[start] = true;
            let mut group = vec![start];
            let mut queue = VecDeque::from([start]);
            while let Some(m) = queue.pop_front() {
                for (_, p) in self.neighbors(m) {
                    if !seen[p.molecule] {
                        seen[p.molecule] = true;
                        group.push(p.molecule);
                        queue.push_back(p.molecule);
                    }
                }
            }
            group.sort_unstable();
            groups.push(group);
        }
        groups
    }

    pub fn is_connected(&self) -> bool {
        self.connected_components().len() <= 1
    }

    /// Copy the given molecules into a new graph (in the given order). Bonds
    /// leaving the selection are dropped.
    pub fn subgraph(&self, molecules: &[usize]) -> MolGraph {
        let mut remap = vec![usize::MAX; self.molecules.len()];
        for (new, &old) in molecules.iter().enumerate() {
            remap[old] = new;
        }
        let mols = molecules.iter()
            .map(|&old| {
                let mut m = self.molecules[old].clone();
                for c in m.components_mut() {
                    if let BondState::Bound(p) = c.bond() {
                        let target = remap[p.molecule];
                        c.set_bond(if target == usize::MAX {
                            BondState::Free
                        } else {
                            BondState::Bound(Site::new(target, p.component))
                        });
                    }
                }
                m
            })
            .collect();
        MolGraph { molecules: mols, compartment: self.compartment.clone() }
    }

    /// Disjoint union: append all molecules of `other`, returning the index
    /// offset of its first molecule.
    pub fn append(&mut self, other: &MolGraph) -> usize {
        let offset = self.molecules.len();
        for m in &other.molecules {
            let mut m = m.clone();
            for c in m.components_mut() {
                if let BondState::Bound(p) = c.bond() {
                    c.set_bond(BondState::Bound(Site::new(p.molecule + offset, p.component)));
                }
            }
            self.molecules.push(m);
        }
        offset
    }

    /// Delete molecules, compacting the remaining indices. Bonds to deleted
    /// molecules become free.
    pub fn remove_molecules(&mut self, remove: &[usize]) {
        if remove.is_empty() {
            return;
        }
        let mut keep: Vec<usize> = (0..self.molecules.len()).collect();
        keep.retain(|i| !remove.contains(i));
        *self = self.subgraph(&keep);
    }

    /// Check bond symmetry.
    pub fn validate(&self) -> Result<(), StructureError> {
        for (mi, m) in self.molecules.iter().enumerate() {
            for (ci, c) in m.components().iter().enumerate() {
                let here = Site::new(mi, ci);
                if let BondState::Bound(there) = c.bond() {
                    if there == here || self.partner(there) != Some(here) {
                        return Err(StructureError::InvalidBond(here, there));
                    }
                }
            }
        }
        Ok(())
    }
}
