use std::process::ExitCode;

use bikecast::{
    city_has_data, init_logging, log_command_finish, log_command_start, logging_config_from_env,
    parse_city, sync_trip_archives, City, LocalArchiveSource, PipelineConfig, TripArchiveRequest,
    ALL_CITIES,
};
use clap::Parser;
use rayon::prelude::*;
use tracing::warn;

const COMMAND: &str = "source_trip_data";

/// Download monthly trip archives for one or more cities.
#[derive(Parser)]
#[command(name = "source_trip_data")]
struct Cli {
    /// Cities to source (defaults to every supported city)
    #[arg(long, value_delimiter = ',', value_parser = parse_city)]
    cities: Vec<City>,

    /// Calendar year to source
    #[arg(long)]
    year: i32,

    /// Months of the year (defaults to every published month)
    #[arg(long, value_delimiter = ',')]
    months: Option<Vec<u32>>,

    /// Skip the system-data page probe before downloading
    #[arg(long)]
    skip_availability_check: bool,
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
    let cfg = PipelineConfig::from_env()?.archive_config();
    let cities: Vec<City> = if cli.cities.is_empty() {
        ALL_CITIES.to_vec()
    } else {
        cli.cities.clone()
    };

    let outcomes: Vec<(City, Result<String, String>)> = cities
        .par_iter()
        .map(|&city| {
            if !cli.skip_availability_check {
                match city_has_data(city, &cfg) {
                    Ok(true) => {}
                    Ok(false) => {
                        return (city, Ok("no published data, skipped".to_string()));
                    }
                    Err(err) => return (city, Err(err.to_string())),
                }
            }

            let req = TripArchiveRequest {
                city,
                year: cli.year,
                months: cli.months.clone(),
            };
            let outcome = sync_trip_archives(&req, &cfg)
                .map(|archives| {
                    let downloaded = archives
                        .iter()
                        .filter(|a| a.source == LocalArchiveSource::Downloaded)
                        .count();
                    format!(
                        "{} archives ({} downloaded, {} cached)",
                        archives.len(),
                        downloaded,
                        archives.len() - downloaded
                    )
                })
                .map_err(|err| err.to_string());
            (city, outcome)
        })
        .collect();

    let mut ok = true;
    for (city, outcome) in outcomes {
        match outcome {
            Ok(summary) => println!("{} {}: {summary}", city.display_name(), cli.year),
            Err(err) => {
                ok = false;
                warn!(
                    component = COMMAND,
                    event = "sourcing.city.failed",
                    city = city.as_str(),
                    error = %err
                );
                println!("{} {}: FAILED {err}", city.display_name(), cli.year);
            }
        }
    }

    Ok(ok)
}
