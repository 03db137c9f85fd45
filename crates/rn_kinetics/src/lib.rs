pub mod timeseries;
pub mod timeseries_io;

mod linalg;
mod ode_system;
mod integrator;
mod phases;

pub use linalg::*;
pub use ode_system::*;
pub use integrator::*;
pub use phases::*;
