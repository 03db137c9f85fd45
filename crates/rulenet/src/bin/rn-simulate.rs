use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use log::{debug, info, warn};
use colored::*;
use env_logger::Builder;
use clap::ArgAction;
use clap::Parser;
use anyhow::Result;
use anyhow::bail;
use rayon::prelude::*;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;

use rn_network::GenerationStatus;
use rn_network::Network;
use rn_network::NetworkGenerator;
use rn_kinetics::IntegrationError;
use rn_kinetics::OdeSystem;
use rn_kinetics::Simulator;
use rn_kinetics::StepStatistics;
use rn_kinetics::timeseries::Timeseries;

use rulenet::model_parsers::ModelSpec;
use rulenet::simulation_parsers::GenerationArguments;
use rulenet::simulation_parsers::SolverArguments;

#[derive(Debug, Parser)]
#[command(name = "rn-simulate")]
#[command(version, about = "Generate and simulate rule-based reaction networks")]
pub struct Cli {
    /// Model files (JSON).
    #[arg(value_name = "MODEL", required = true, num_args = 1..)]
    models: Vec<PathBuf>,

    /// Write networks and time series into this directory.
    #[arg(short, long, value_name = "DIR")]
    outdir: Option<PathBuf>,

    /// Stop after network generation.
    #[arg(long)]
    network_only: bool,

    /// Verbosity (-v = info, -vv = debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(flatten, next_help_heading = "Network generation")]
    generation: GenerationArguments,

    #[command(flatten, next_help_heading = "ODE solver")]
    solver: SolverArguments,
}

struct Report {
    name: String,
    species: usize,
    reactions: usize,
    status: GenerationStatus,
    series: Option<Timeseries>,
    stats: StepStatistics,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };

    Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(buf, "{}", record.args())
        })
        .init();
}

fn model_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "model".to_string())
}

fn write_network(cli: &Cli, name: &str, network: &Network) -> Result<()> {
    if let Some(dir) = &cli.outdir {
        let path = dir.join(format!("{}.net.json", name));
        let json = serde_json::to_string_pretty(&network.to_serializable())?;
        std::fs::write(&path, json)?;
        debug!("Network written to {}", path.display());
    }
    Ok(())
}

fn write_series(cli: &Cli, name: &str, series: &Timeseries) -> Result<()> {
    if let Some(dir) = &cli.outdir {
        series.to_file(dir.join(format!("{}.json", name)))?;
        series.to_table_file(dir.join(format!("{}.gdat", name)))?;
    }
    Ok(())
}

fn run_model(cli: &Cli, path: &Path) -> Result<Report> {
    let name = model_name(path);
    let model = ModelSpec::from_file(path)?.build()?;
    let mut limits = model.limits.clone();
    cli.generation.apply(&mut limits);

    let generator = NetworkGenerator::new(model.rules.clone(), limits);
    let network = generator.generate_with(&model.seeds, None, |p| {
        info!("{}: iteration {}, {} species, {} reactions ({:.2?})",
            name, p.iteration, p.species, p.reactions, p.elapsed);
    })?;
    if network.status != GenerationStatus::Complete {
        warn!("{}: network is incomplete ({:?})", name, network.status);
    }
    write_network(cli, &name, &network)?;

    let mut report = Report {
        name: name.clone(),
        species: network.species.len(),
        reactions: network.reactions.len(),
        status: network.status.clone(),
        series: None,
        stats: StepStatistics::default(),
    };
    if cli.network_only {
        return Ok(report);
    }

    let y0 = model.initial_state(&network)?;
    let system = OdeSystem::new(&network, &model.observables, model.parameters.clone());
    let mut simulator = Simulator::new(system, cli.solver.options(model.solver.as_ref()));
    let phases = if model.phases.is_empty() {
        vec![cli.solver.default_phase()]
    } else {
        model.phases.clone()
    };

    match simulator.simulate(&y0, &phases) {
        Ok(series) => {
            write_series(cli, &name, &series)?;
            report.series = Some(series);
            report.stats = simulator.statistics();
            Ok(report)
        }
        Err(e) => {
            if let Some(partial) = e.partial() {
                write_series(cli, &name, partial)?;
            }
            if let IntegrationError::Failure { state, .. } = &e {
                debug!("{}: last stable state {:?}", name, state);
            }
            Err(e.into())
        }
    }
}

fn print_report(report: &Report, show_series: bool) {
    let status = match &report.status {
        GenerationStatus::Complete => "complete".green(),
        GenerationStatus::LimitExceeded(limit) => format!("limit: {}", limit).yellow(),
        GenerationStatus::Cancelled => "cancelled".red(),
    };
    println!("{} {} species, {} reactions ({})",
        report.name.yellow(), report.species, report.reactions, status);
    if let Some(series) = &report.series {
        println!(" - {} rows, {} explicit and {} implicit steps, {} rejected, {} switches",
            series.len(), report.stats.explicit_steps, report.stats.implicit_steps,
            report.stats.rejected, report.stats.switches);
        if show_series {
            println!("{}", series);
        } else if let Some(last) = series.last() {
            for (name, value) in series.observable_names.iter().zip(&last.observables) {
                println!("   {:<16} {}", name, format!("{:.6e}", value).cyan());
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    cli.generation.validate()?;
    cli.solver.validate()?;
    if let Some(dir) = &cli.outdir {
        std::fs::create_dir_all(dir)?;
    }

    let results: Vec<(PathBuf, Result<Report>)> = if cli.models.len() == 1 {
        let path = cli.models[0].clone();
        let result = run_model(&cli, &path);
        vec![(path, result)]
    } else {
        let pb = ProgressBar::new(cli.models.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
        );
        let results = cli.models.par_iter()
            .map_init(
                || pb.clone(),
                |pb, path| {
                    let result = run_model(&cli, path);
                    pb.inc(1);
                    (path.clone(), result)
                },
            ).collect();
        pb.finish_with_message("All models complete!");
        results
    };

    let show_series = results.len() == 1 && cli.outdir.is_none();
    let mut failed = 0;
    for (path, result) in &results {
        match result {
            Ok(report) => print_report(report, show_series),
            Err(e) => {
                failed += 1;
                println!("{} {}", path.display().to_string().yellow(), format!("{:#}", e).red());
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} models failed", failed, results.len());
    }
    Ok(())
}
