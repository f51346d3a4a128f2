use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use atom_ingest::app::DefaultApp;
use atom_ingest::config::{Config, ConfigLoader, FeedRequest, ResolvedConfig};
use atom_ingest::copy::CopyMode;
use atom_ingest::error::IngestError;
use atom_ingest::feed::AtomHttpTransport;
use atom_ingest::output::{JsonOutput, LogProgress};
use atom_ingest::store::Store;

#[derive(Parser)]
#[command(name = "atom-ingest")]
#[command(about = "Ingest paginated Atom dataset feeds into the research-data repository")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Ingest one feed, or every configured feed")]
    Ingest(IngestArgs),
    #[command(about = "Show the provenance schemas in use")]
    Schemas,
}

#[derive(Args)]
struct IngestArgs {
    feed_url: Option<String>,

    #[arg(long, value_enum)]
    copy_mode: Option<CopyMode>,

    #[arg(long, conflicts_with = "copy_mode")]
    sync_copy: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<IngestError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error {
        IngestError::MissingConfig
        | IngestError::ConfigRead(_)
        | IngestError::ConfigParse(_)
        | IngestError::InvalidLocationPattern(_)
        | IngestError::SchemaNotFound(_) => 2,
        IngestError::FeedHttp(_) | IngestError::FeedStatus { .. } | IngestError::FeedParse(_) => 3,
        IngestError::Persistence(_) | IngestError::Contention(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Ingest(args) => {
            let mut config = load_config(cli.config.as_deref(), args.feed_url.is_some())?;
            if let Some(url) = args.feed_url {
                config.feeds.retain(|feed| feed.url == url);
                if config.feeds.is_empty() {
                    config.feeds.push(FeedRequest {
                        url,
                        credentials: None,
                    });
                }
            }
            if config.feeds.is_empty() {
                return Err(miette::Report::msg(
                    "no feeds configured (pass a feed URL or add `feeds` to atom-ingest.json)",
                ));
            }
            let copy_mode = if args.sync_copy {
                Some(CopyMode::Sync)
            } else {
                args.copy_mode
            };

            let app = DefaultApp::bootstrap(&config, store_for(&config)?, copy_mode)?;
            let result = app.ingest_all(
                &config.feeds,
                |feed| AtomHttpTransport::new(feed.credentials.clone()),
                &LogProgress,
            );
            app.finish();
            JsonOutput::print_run(&result).into_diagnostic()?;
            Ok(if result.has_failures() {
                ExitCode::from(5)
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::Schemas => {
            let config = load_config(cli.config.as_deref(), true)?;
            let app = DefaultApp::bootstrap(&config, store_for(&config)?, None)?;
            JsonOutput::print_schemas(&app.schemas()).into_diagnostic()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&str>, allow_missing: bool) -> Result<ResolvedConfig, IngestError> {
    match ConfigLoader::resolve(path) {
        Err(IngestError::MissingConfig) if allow_missing => {
            ConfigLoader::resolve_config(Config::default())
        }
        other => other,
    }
}

fn store_for(config: &ResolvedConfig) -> Result<Store, IngestError> {
    let defaults = Store::new()?;
    Ok(Store::new_with_paths(
        config
            .state_path
            .clone()
            .unwrap_or_else(|| defaults.state_path().to_path_buf()),
        config
            .data_dir
            .clone()
            .unwrap_or_else(|| defaults.data_root().to_path_buf()),
    ))
}
