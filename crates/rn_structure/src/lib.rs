mod error;
mod molecule;
mod graph;
mod notation;
mod canonical;

pub use error::*;
pub use molecule::*;
pub use graph::*;
pub use canonical::*;
