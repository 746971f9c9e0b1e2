//! In-situ pull simulator CLI
//!
//! Runs producer/consumer pull scenarios inside one process.

use clap::Parser;
use insitu_core::{GridDims, ParticleLayout};
use insitu_sim::scenarios::ScenarioId;
use insitu_sim::{DatasetExport, ScenarioResult, ScenarioRunner, SimConfig};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// In-situ pull simulator
#[derive(Parser, Debug)]
#[command(name = "insitu-sim")]
#[command(about = "Run in-process producer/consumer pull scenarios", long_about = None)]
struct Args {
    /// Master seed for the particle sources (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of producer workers
    #[arg(short, long, default_value = "3")]
    producers: usize,

    /// Number of consumer workers
    #[arg(short, long, default_value = "2")]
    consumers: usize,

    /// Particles per producer worker
    #[arg(long, default_value = "100")]
    particles: usize,

    /// Block decomposition, "N" or "NxMxK"
    #[arg(long, default_value = "2x2x2")]
    dims: GridDims,

    /// Ghost width around every block
    #[arg(long, default_value = "0.015")]
    ghost: f32,

    /// Floats per particle record (3 = positions only)
    #[arg(long, default_value = "3")]
    stride: usize,

    /// Pulls per consumer run
    #[arg(long, default_value = "3")]
    rounds: usize,

    /// Scenario to run (single_particle, union_of_cubes, reconnect, ..., all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export the received datasets to a JSON file
    #[arg(long)]
    export: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error: failed to set tracing subscriber: {}", e);
        std::process::exit(1);
    }

    if !args.json {
        info!("In-situ pull simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(id) => vec![id],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<_> = ScenarioId::all().iter().map(|id| id.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                std::process::exit(1);
            }
        }
    };

    if args.export.is_some() && scenarios.len() > 1 {
        eprintln!("Error: --export only supports a single scenario, not 'all'");
        std::process::exit(1);
    }

    let layout = match ParticleLayout::new(args.stride) {
        Ok(layout) => layout,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    // Determine seed
    let seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    let runner = ScenarioRunner::from_config(SimConfig {
        seed,
        ghost_width: args.ghost,
        ..SimConfig::default()
    })
    .with_producers(args.producers)
    .with_consumers(args.consumers)
    .with_particles(args.particles)
    .with_dims(args.dims)
    .with_layout(layout)
    .with_rounds(args.rounds);

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for scenario in &scenarios {
        let result = runner.run(*scenario).await;

        if !args.json {
            if result.passed {
                info!(
                    "✓ {} (seed={}) PASSED | pulls={} particles={} ghosts={}",
                    scenario.name(),
                    seed,
                    result.metrics.pulls_ok,
                    result.metrics.particles_received,
                    result.metrics.ghost_particles
                );
            } else {
                error!(
                    "✗ {} (seed={}) FAILED: {}",
                    scenario.name(),
                    seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }

        if let Some(path) = &args.export {
            let export = DatasetExport::from_result(&result);
            match export.write_to_file(path) {
                Ok(()) => info!("Exported {} particles to {}", export.particle_count(), path),
                Err(e) => error!("Failed to write export: {}", e),
            }
        }

        if !result.passed {
            failed_count += 1;
        }
        all_results.push(result);
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "metrics": r.metrics,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in &all_results {
                if !result.passed {
                    error!(
                        "  - {} seed={}: {}",
                        result.scenario.name(),
                        result.seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
