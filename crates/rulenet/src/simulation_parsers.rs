use clap::Args;
use anyhow::Result;
use anyhow::bail;

use rn_structure::DEFAULT_MAX_ORBIT;
use rn_network::GenerationLimits;
use rn_kinetics::SimulationPhase;
use rn_kinetics::SolverOptions;

/// Network generation limits. Given values override the model file.
#[derive(Debug, Args)]
pub struct GenerationArguments {
    /// Stop generation once this many species exist.
    #[arg(long)]
    pub max_species: Option<usize>,

    /// Stop generation once this many reactions exist.
    #[arg(long)]
    pub max_reactions: Option<usize>,

    /// Stop generation after this many worklist iterations.
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Discard products with more molecules than this.
    #[arg(long)]
    pub max_aggregate_size: Option<usize>,

    /// Labeling budget of the canonicalizer per species.
    #[arg(long, default_value_t = DEFAULT_MAX_ORBIT)]
    pub max_orbit: usize,
}

impl GenerationArguments {
    pub fn validate(&self) -> Result<()> {
        if self.max_species == Some(0) {
            bail!("max_species must be > 0");
        }
        if self.max_aggregate_size == Some(0) {
            bail!("max_aggregate_size must be > 0");
        }
        if self.max_orbit == 0 {
            bail!("max_orbit must be > 0");
        }
        Ok(())
    }

    pub fn apply(&self, limits: &mut GenerationLimits) {
        if self.max_species.is_some() {
            limits.max_species = self.max_species;
        }
        if self.max_reactions.is_some() {
            limits.max_reactions = self.max_reactions;
        }
        if self.max_iterations.is_some() {
            limits.max_iterations = self.max_iterations;
        }
        if self.max_aggregate_size.is_some() {
            limits.max_aggregate_size = self.max_aggregate_size;
        }
        limits.max_orbit = self.max_orbit;
    }
}

/// ODE solver settings and the fallback phase for models without phases.
#[derive(Debug, Args)]
pub struct SolverArguments {
    /// Absolute tolerance (overrides the model file).
    #[arg(long)]
    pub atol: Option<f64>,

    /// Relative tolerance (overrides the model file).
    #[arg(long)]
    pub rtol: Option<f64>,

    /// Simulation stop time of the fallback phase.
    #[arg(long, default_value_t = 10.0)]
    pub t_end: f64,

    /// Number of output intervals of the fallback phase.
    #[arg(long, default_value_t = 100)]
    pub n_steps: usize,

    /// Start the fallback phase with the implicit solver.
    #[arg(long)]
    pub stiff: bool,

    /// Stop integrating the fallback phase at steady state.
    #[arg(long)]
    pub steady_state: bool,
}

impl SolverArguments {
    /// Validate that all parameters make sense.
    pub fn validate(&self) -> Result<()> {
        for (name, tol) in [("atol", self.atol), ("rtol", self.rtol)] {
            if let Some(tol) = tol {
                if !(tol > 0.) {
                    bail!("{} must be > 0 (got {})", name, tol);
                }
            }
        }
        if !(self.t_end > 0.) {
            bail!("t_end must be > 0 (got {})", self.t_end);
        }
        if self.n_steps == 0 {
            bail!("n_steps must be > 0");
        }
        Ok(())
    }

    pub fn options(&self, model: Option<&SolverOptions>) -> SolverOptions {
        let mut options = model.cloned().unwrap_or_default();
        if let Some(atol) = self.atol {
            options.atol = atol;
        }
        if let Some(rtol) = self.rtol {
            options.rtol = rtol;
        }
        options
    }

    pub fn default_phase(&self) -> SimulationPhase {
        SimulationPhase::new(0., self.t_end, self.n_steps)
            .with_stiff(self.stiff)
            .with_steady_state(self.steady_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        generation: GenerationArguments,
        #[command(flatten)]
        solver: SolverArguments,
    }

    #[test]
    fn test_defaults_and_overrides() {
        let cli = TestCli::parse_from(["test", "--max-species", "50", "--rtol", "1e-4", "--stiff"]);
        cli.generation.validate().unwrap();
        cli.solver.validate().unwrap();

        let mut limits = GenerationLimits { max_reactions: Some(7), ..Default::default() };
        cli.generation.apply(&mut limits);
        assert_eq!(limits.max_species, Some(50));
        assert_eq!(limits.max_reactions, Some(7));

        let model = SolverOptions { atol: 1e-12, rtol: 1e-9, ..Default::default() };
        let options = cli.solver.options(Some(&model));
        assert_eq!(options.atol, 1e-12);
        assert_eq!(options.rtol, 1e-4);

        let phase = cli.solver.default_phase();
        assert!(phase.stiff && !phase.steady_state);
        assert_eq!((phase.t_end, phase.n_steps), (10., 100));
    }

    #[test]
    fn test_validation() {
        let cli = TestCli::parse_from(["test", "--n-steps", "0"]);
        assert!(cli.solver.validate().is_err());
        let cli = TestCli::parse_from(["test", "--atol", "0"]);
        assert!(cli.solver.validate().is_err());
        let cli = TestCli::parse_from(["test", "--max-orbit", "0"]);
        assert!(cli.generation.validate().is_err());
    }
}
