//! Stampede simulator CLI
//!
//! Runs orchestration scenarios against an in-process cluster.

use clap::Parser;
use stampede_sim::scenarios::ScenarioId;
use stampede_sim::{LinkKind, ScenarioRunner, SimExport};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "stampede-sim")]
#[command(about = "Run orchestration scenarios against a simulated Stampede cluster", long_about = None)]
struct Args {
    /// Master seed (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of agents
    #[arg(short, long, default_value = "1")]
    agents: u32,

    /// Workers per agent
    #[arg(short, long, default_value = "2")]
    workers: u32,

    /// Scenario to run (baseline, critical_failure, tolerated_failure,
    /// phase_timeout, failure_storm, paced, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to run
    #[arg(long, default_value = "1")]
    seeds: u64,

    /// Length of the RUN phase in seconds
    #[arg(short, long, default_value = "1")]
    duration: f64,

    /// Link between processes (channel, tcp)
    #[arg(short, long, default_value = "channel")]
    link: String,

    /// Directory receiving one file per failure record
    #[arg(long)]
    failure_dir: Option<PathBuf>,

    /// Verbose output (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,

    /// Print the results as JSON
    #[arg(long)]
    json: bool,

    /// Write the results as JSON to this file
    #[arg(long)]
    export: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                std::process::exit(2);
            }
        }
    };

    let link: LinkKind = match args.link.parse() {
        Ok(link) => link,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    if !args.duration.is_finite() || args.duration <= 0.0 {
        eprintln!("Error: --duration must be a positive number of seconds");
        std::process::exit(2);
    }

    let base_seed = if args.seed == 0 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    if !args.json {
        info!("Stampede simulator v{}", env!("CARGO_PKG_VERSION"));
    }

    let mut export = SimExport::new(base_seed);
    for offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(offset);
        let mut runner = ScenarioRunner::new(seed)
            .with_agents(args.agents)
            .with_workers(args.workers)
            .with_link(link)
            .with_duration(Duration::from_secs_f64(args.duration));
        if let Some(dir) = &args.failure_dir {
            runner = runner.with_failure_dir(dir);
        }

        for result in runner.run_all(&scenarios).await {
            if !args.json {
                match &result.failure_reason {
                    None => info!("✓ {} (seed={}) PASSED", result.scenario, seed),
                    Some(reason) => error!("✗ {} (seed={}) FAILED: {}", result.scenario, seed, reason),
                }
            }
            export.add(result);
        }
    }

    if args.json {
        match export.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => error!(error = %e, "could not encode results"),
        }
    } else if export.all_passed() {
        info!("All {} scenario runs passed", export.total);
    } else {
        error!("{}/{} scenario runs failed", export.failed, export.total);
        for result in export.results.iter().filter(|r| !r.passed) {
            error!(
                "  - {} seed={}: {}",
                result.scenario,
                result.seed,
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
    }

    if let Some(path) = &args.export {
        match export.write_to_file(path) {
            Ok(()) => info!(path = %path.display(), "results exported"),
            Err(e) => {
                error!(path = %path.display(), error = %e, "export failed");
                std::process::exit(1);
            }
        }
    }

    if !export.all_passed() {
        std::process::exit(1);
    }
}
