use std::fmt;

use crate::Site;

#[derive(Debug, Clone, PartialEq)]
pub enum StructureError {
    InvalidBond(Site, Site),           // one of the two slots is already occupied
    InvalidSite(Site),                 // site does not exist in this graph
    InvalidToken(String, String, usize), // token, source and position
    UnmatchedBond(String),             // bond label used only once
    OverusedBond(String),              // bond label used more than twice
    CanonicalizationOverflow { leaves: usize, limit: usize },
}

impl fmt::Display for StructureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructureError::InvalidBond(a, b) => {
                write!(f, "Cannot bind {} and {}: bond slot already occupied", a, b)
            }
            StructureError::InvalidSite(s) => {
                write!(f, "No component at {}", s)
            }
            StructureError::InvalidToken(tok, src, i) => {
                write!(f, "Invalid {} in {} at position {}", tok, src, i)
            }
            StructureError::UnmatchedBond(label) => {
                write!(f, "Bond label !{} has no partner", label)
            }
            StructureError::OverusedBond(label) => {
                write!(f, "Bond label !{} is used more than twice", label)
            }
            StructureError::CanonicalizationOverflow { leaves, limit } => {
                write!(f, "Canonical labeling explored {} symmetric choices (limit {})", leaves, limit)
            }
        }
    }
}

impl std::error::Error for StructureError {}
