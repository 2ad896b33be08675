use std::process::ExitCode;

use bikecast::{
    init_logging, log_command_finish, log_command_start, log_store_opened,
    logging_config_from_env, parse_city, parse_model_family, parse_scenario, City, FeatureStore,
    HourRange, ModelFamily, NormalizeRequest, Partition, PipelineConfig, Scenario,
    SqliteModelRegistry, TrainingConfig, TrainingMetric, TrainingOrchestrator, TrainingRequest,
    TuningConfig, ALL_MODEL_FAMILIES, ALL_SCENARIOS, DEFAULT_TRIAL_COUNT, HOUR_MS,
};
use chrono::NaiveDate;
use clap::Parser;

const COMMAND: &str = "train_models";

/// Train one model per family and scenario on stored feature rows.
#[derive(Parser)]
#[command(name = "train_models")]
struct Cli {
    #[arg(long, value_parser = parse_city)]
    city: City,

    /// Scenarios to train (defaults to start,end)
    #[arg(long, value_delimiter = ',', value_parser = parse_scenario)]
    scenarios: Vec<Scenario>,

    /// Model families to train (defaults to every family)
    #[arg(long, value_delimiter = ',', value_parser = parse_model_family)]
    models: Vec<ModelFamily>,

    /// Run a seeded random search before the final fit
    #[arg(long)]
    tune: bool,

    #[arg(long, default_value_t = DEFAULT_TRIAL_COUNT)]
    trials: u32,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// First day of the training window (defaults to the first stored hour)
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// Last day of the training window, inclusive (defaults to the last stored hour)
    #[arg(long)]
    end_date: Option<NaiveDate>,
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

fn run(cli: &Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let pipeline = PipelineConfig::from_env()?;
    let store_path = pipeline.store_path(cli.city);
    let store = FeatureStore::open(&store_path)?;
    let registry = SqliteModelRegistry::open(&store_path)?;
    log_store_opened(COMMAND, cli.city, &store_path);

    let scenarios = if cli.scenarios.is_empty() {
        ALL_SCENARIOS.to_vec()
    } else {
        cli.scenarios.clone()
    };
    let families = if cli.models.is_empty() {
        ALL_MODEL_FAMILIES.to_vec()
    } else {
        cli.models.clone()
    };
    // The orchestrator carries the seed; it reaches every trial plan from there.
    let tuning = TuningConfig {
        enabled: cli.tune,
        trial_count: cli.trials,
        ..TuningConfig::default()
    };
    let orchestrator = TrainingOrchestrator::new(TrainingConfig {
        seed: cli.seed,
        ..TrainingConfig::default()
    })?;

    let mut ok = true;
    for scenario in scenarios {
        let Some(window) = training_window(cli, &store, scenario)? else {
            println!("{scenario}: no stored feature rows");
            ok = false;
            continue;
        };

        let mut request = TrainingRequest::new(scenario, families.clone(), window);
        request.tuning = tuning;
        match orchestrator.train(&store, &registry, &request) {
            Ok(report) => {
                println!(
                    "{scenario}: {} train rows, {} validation rows",
                    report.split.train_rows, report.split.validation_rows
                );
                for result in &report.results {
                    match &result.metric {
                        TrainingMetric::Scored(score) => println!(
                            "  {}: mae={:.4} rmse={:.4} trials={} artifact={}",
                            result.model_family,
                            score.mae,
                            score.rmse,
                            result.trials_evaluated,
                            result.artifact_id.as_deref().unwrap_or("-")
                        ),
                        TrainingMetric::Failed { reason } => {
                            println!("  {}: FAILED {reason}", result.model_family)
                        }
                    }
                }
                if report.all_failed() {
                    ok = false;
                }
            }
            Err(err) => {
                println!("{scenario}: FAILED {err}");
                ok = false;
            }
        }
    }

    Ok(ok)
}

fn training_window(
    cli: &Cli,
    store: &FeatureStore,
    scenario: Scenario,
) -> Result<Option<HourRange>, Box<dyn std::error::Error>> {
    let Some((first, last)) = store.hour_bounds(Partition::Features, scenario)? else {
        return Ok(None);
    };
    let start = match cli.start_date {
        Some(date) => NormalizeRequest::new(cli.city, date, date).hour_bounds()?.0,
        None => first,
    };
    let end = match cli.end_date {
        Some(date) => NormalizeRequest::new(cli.city, date, date).hour_bounds()?.1,
        None => last + HOUR_MS,
    };
    Ok(Some(HourRange::new(start, end)?))
}
