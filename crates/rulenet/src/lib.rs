//! # rulenet
//!
//! Rule-based reaction network generation and deterministic simulation.
//!
//! This crate re-exports the main functionality from its submodules.

pub mod model_parsers;
pub mod simulation_parsers;

pub mod structure {
    pub use ::rn_structure::*;
}

pub mod network {
    pub use ::rn_network::*;
}

pub mod kinetics {
    pub use ::rn_kinetics::*;
}
