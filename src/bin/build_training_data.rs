use std::process::ExitCode;

use bikecast::{
    init_logging, log_command_finish, log_command_start, log_store_opened,
    logging_config_from_env, parse_city, plan_trip_archives, sync_trip_archives, BackfillConfig,
    BackfillCoordinator, City, FeatureStore, LocalArchiveTripSource, PipelineConfig,
    TripArchiveRef, TripArchiveRequest, ALL_SCENARIOS,
};
use chrono::{Days, Months, NaiveDate, Utc};
use clap::Parser;

const COMMAND: &str = "build_training_data";

/// Turn a city's trip archives for one year into stored feature rows for both scenarios.
#[derive(Parser)]
#[command(name = "build_training_data")]
struct Cli {
    #[arg(long, value_parser = parse_city)]
    city: City,

    #[arg(long)]
    year: i32,

    /// Download missing archives before building
    #[arg(long)]
    download: bool,
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
    let archive_cfg = pipeline.archive_config();
    let request = TripArchiveRequest {
        city: cli.city,
        year: cli.year,
        months: None,
    };

    let planned: Vec<TripArchiveRef> = if cli.download {
        sync_trip_archives(&request, &archive_cfg)?
            .into_iter()
            .map(|local| local.archive)
            .collect()
    } else {
        plan_trip_archives(&request, Utc::now().date_naive())?
    };
    let Some(last_month) = planned.last().map(|archive| archive.month) else {
        println!("{} {}: nothing to build", cli.city, cli.year);
        return Ok(true);
    };

    let coordinator = BackfillCoordinator::new(BackfillConfig::new(cli.city))?;
    let history_days =
        u64::from(coordinator.config().feature.required_history_hours()).div_ceil(24);

    // The year's first days only serve as history for later hours. One more day keeps the
    // history window off UTC hours that fall in the previous year's local December.
    let start_date = NaiveDate::from_ymd_opt(cli.year, 1, 1)
        .and_then(|jan_first| jan_first.checked_add_days(Days::new(history_days + 1)))
        .ok_or("invalid year")?;
    let end_date = NaiveDate::from_ymd_opt(cli.year, last_month, 1)
        .and_then(|first| first.checked_add_months(Months::new(1)))
        .and_then(|next| next.pred_opt())
        .map(|last| last.min(Utc::now().date_naive()))
        .ok_or("invalid month")?;
    if end_date < start_date {
        println!("{} {}: not enough days for feature history", cli.city, cli.year);
        return Ok(true);
    }

    let store_path = pipeline.store_path(cli.city);
    let mut store = FeatureStore::open(&store_path)?;
    log_store_opened(COMMAND, cli.city, &store_path);

    let source = LocalArchiveTripSource::new(archive_cfg.data_root.clone());
    let report = coordinator.backfill_features(
        &source,
        &mut store,
        &ALL_SCENARIOS,
        start_date,
        end_date,
    )?;

    println!(
        "{} {}..={} (source rejected {}, normalize rejected {})",
        cli.city,
        start_date,
        end_date,
        report.source_rejected_records,
        report.normalize_rejected_events
    );
    for scenario in &report.scenarios {
        match &scenario.outcome {
            Ok(summary) => println!(
                "  {}: {} rows for {} stations ({} without history)",
                scenario.scenario,
                summary.rows_written,
                summary.entities,
                summary.entities_without_history
            ),
            Err(err) => println!("  {}: FAILED {err}", scenario.scenario),
        }
    }
    Ok(!report.has_failures())
}
