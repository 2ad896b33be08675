use std::process::ExitCode;

use bikecast::{
    init_logging, log_command_finish, log_command_start, log_store_opened,
    logging_config_from_env, parse_city, parse_model_family, parse_scenario, BackfillConfig,
    BackfillCoordinator, BackfillRequest, BackfillTarget, City, FeatureStore,
    LocalArchiveTripSource, ModelFamily, PipelineConfig, Scenario, SqliteModelRegistry,
    ALL_SCENARIOS,
};
use chrono::NaiveDate;
use clap::Parser;

const COMMAND: &str = "backfill";

/// Recompute stored features or predictions for an inclusive date range.
#[derive(Parser)]
#[command(name = "backfill")]
struct Cli {
    #[arg(long, value_parser = parse_city)]
    city: City,

    /// Scenarios to backfill (defaults to start,end)
    #[arg(long, value_delimiter = ',', value_parser = parse_scenario)]
    scenarios: Vec<Scenario>,

    /// features or predictions
    #[arg(long, value_parser = parse_target)]
    target: BackfillTarget,

    #[arg(long)]
    start_date: NaiveDate,

    /// Inclusive
    #[arg(long)]
    end_date: NaiveDate,

    /// Model family for predictions (defaults to the best scoring family)
    #[arg(long, value_parser = parse_model_family)]
    model: Option<ModelFamily>,

    /// Build and predict on one thread
    #[arg(long)]
    sequential: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let logging = logging_config_from_env();
    if let Err(err) = init_logging(&logging) {
        eprintln!("{err}");
    }
    log_command_start(COMMAND, &logging);

    let ok = match run(&cli) {
        Ok(ok) => ok,
        Err(err) => {
            eprintln!("{COMMAND} failed: {err}");
            false
        }
    };
    log_command_finish(COMMAND, ok);

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn parse_target(raw: &str) -> Result<BackfillTarget, String> {
    raw.parse().map_err(|err: bikecast::BackfillError| err.to_string())
}

fn run(cli: &Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let pipeline = PipelineConfig::from_env()?;
    let store_path = pipeline.store_path(cli.city);
    let mut store = FeatureStore::open(&store_path)?;
    let registry = SqliteModelRegistry::open(&store_path)?;
    log_store_opened(COMMAND, cli.city, &store_path);

    let coordinator = BackfillCoordinator::new(BackfillConfig {
        model_family: cli.model,
        force_sequential: cli.sequential,
        ..BackfillConfig::new(cli.city)
    })?;
    let request = BackfillRequest {
        scenarios: if cli.scenarios.is_empty() {
            ALL_SCENARIOS.to_vec()
        } else {
            cli.scenarios.clone()
        },
        target: cli.target,
        start_date: cli.start_date,
        end_date: cli.end_date,
    };
    let source = LocalArchiveTripSource::new(pipeline.data_root.clone());

    let report = coordinator.run(&request, &source, &mut store, &registry)?;
    println!(
        "{} {} {}..={}",
        report.city, report.target, report.start_date, report.end_date
    );
    for scenario in &report.scenarios {
        match &scenario.outcome {
            Ok(summary) => println!(
                "  {}: {} rows written over {} hours for {} stations",
                scenario.scenario, summary.rows_written, summary.hours, summary.entities
            ),
            Err(err) => println!("  {}: FAILED {err}", scenario.scenario),
        }
    }

    Ok(!report.has_failures())
}
