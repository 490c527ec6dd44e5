mod api_client;
mod config;
mod credentials;
mod data;
mod error;
mod extractor;
mod models;
mod reference_loader;
mod report;
mod runner;
mod staging;
mod transform;
mod warehouse;

use clap::{Parser, Subcommand};
use config::Config;
use env_logger::Env;
use error::Error;
use extractor::ExtractionReport;
use log::{error, info, warn};

const EXIT_FAILURE: i32 = 1;
const EXIT_PARTIAL_EXTRACTION: i32 = 2;

/// Extracts Spotify listening data and loads it into a local star-schema warehouse.
#[derive(Parser)]
#[command(name = "spotify-warehouse", version)]
struct Args {
    #[command(flatten)]
    config: Config,

    /// Runs `extract` when omitted
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Prints the URL to visit once to authorize the app
    AuthorizeUrl,

    /// Stages the user's listening data as a new batch
    Extract,

    /// Cleans and enriches a staged batch into the warehouse tables
    Transform {
        /// Batch id such as batch_20240301_120000; defaults to the latest batch
        #[arg(long)]
        batch: Option<String>,
    },

    /// Loads a transformed batch into the warehouse
    Load {
        /// Batch id such as batch_20240301_120000; defaults to the latest batch
        #[arg(long)]
        batch: Option<String>,
    },

    /// Extract, transform and load
    Run,

    /// Prints plays per year and the change against the previous year
    Report {
        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },
}

fn exit_on_partial_extraction(report: &ExtractionReport) {
    if report.is_complete() {
        return;
    }

    let failed: Vec<&str> = report
        .manifest
        .failed()
        .iter()
        .map(|dataset| dataset.file_prefix())
        .collect();
    warn!(
        "batch {} is missing data for: {}",
        report.batch.id(),
        failed.join(", ")
    );
    std::process::exit(EXIT_PARTIAL_EXTRACTION);
}

async fn execute(args: Args) -> Result<(), Error> {
    let config = args.config;

    match args.command.unwrap_or(Command::Extract) {
        Command::AuthorizeUrl => {
            println!("{}", runner::authorize_url(&config)?);
        }
        Command::Extract => {
            let report = runner::run_extract(&config).await?;
            exit_on_partial_extraction(&report);
        }
        Command::Transform { batch } => {
            let batch = runner::run_transform(&config, batch.as_deref()).await?;
            info!("transformed batch {}", batch.id());
        }
        Command::Load { batch } => {
            runner::run_load(&config, batch.as_deref()).await?;
        }
        Command::Run => {
            let report = runner::run_pipeline(&config).await?;
            exit_on_partial_extraction(&report);
        }
        Command::Report { json } => {
            let report = runner::run_report(&config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for year in &report {
                    println!("{}", year);
                }
            }
        }
    };

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(err) = execute(args).await {
        error!("spotify-warehouse failed: {}", err);
        std::process::exit(EXIT_FAILURE);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults_to_extract() {
        let args = Args::try_parse_from(["spotify-warehouse"]).unwrap();
        assert!(args.command.is_none());
    }

    #[test]
    fn test_parses_batch_argument() {
        let args =
            Args::try_parse_from(["spotify-warehouse", "load", "--batch", "batch_20240301_120000"])
                .unwrap();
        assert!(matches!(
            args.command,
            Some(Command::Load { batch: Some(ref id) }) if id == "batch_20240301_120000"
        ));
    }

    #[test]
    fn test_rejects_recently_played_limit_above_api_maximum() {
        let result = Args::try_parse_from([
            "spotify-warehouse",
            "--recently-played-limit",
            "51",
            "extract",
        ]);
        assert!(result.is_err());
    }
}
