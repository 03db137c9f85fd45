mod matcher;
mod reactions;
mod transform;
mod rules;
mod species;
mod observables;
mod enumerate;

pub use matcher::*;
pub use reactions::*;
pub use transform::*;
pub use rules::*;
pub use species::*;
pub use observables::*;
pub use enumerate::*;
