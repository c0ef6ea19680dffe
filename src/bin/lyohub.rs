use std::process::ExitCode;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lyohub::app::{Pipeline, RunOptions};
use lyohub::config::{ConfigLoader, ResolvedConfig};
use lyohub::dailymed::DailyMedHttpClient;
use lyohub::error::LyoError;
use lyohub::feed::ApprovalFeedHttpClient;
use lyohub::http::RequestClient;
use lyohub::labels::ResolveScope;
use lyohub::output::{JsonOutput, LogProgress};
use lyohub::report::{TableQuery, ingredient_occurrences, search_bar_data, table_rows};
use lyohub::store::Store;

#[derive(Parser)]
#[command(name = "lyohub")]
#[command(about = "Ingest FDA approvals and DailyMed labels into a store of lyophilized drugs")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to ./lyohub.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run every ingestion stage in order")]
    Run(RunArgs),
    #[command(about = "Download and store the FDA approval feed")]
    Approvals(ApprovalsArgs),
    #[command(about = "Resolve DailyMed labels and classify drugs")]
    Labels(LabelsArgs),
    #[command(about = "Extract ingredients for lyophilized drugs")]
    Ingredients,
    #[command(about = "Cross-check the DailyMed lyophilized search against the store")]
    Reconcile,
    #[command(about = "Print products and ingredient names for search")]
    SearchData,
    #[command(about = "Print ingredient occurrences per year")]
    Timeseries,
    #[command(about = "Print table rows of lyophilized drugs")]
    Table(TableArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    skip_download: bool,

    #[arg(long)]
    all: bool,
}

#[derive(Args)]
struct ApprovalsArgs {
    /// Reuse the staged payload instead of downloading
    #[arg(long)]
    skip_download: bool,
}

#[derive(Args)]
struct LabelsArgs {
    /// Re-resolve drugs that already have labels
    #[arg(long)]
    all: bool,
}

#[derive(Args)]
struct TableArgs {
    #[arg(long, conflicts_with_all = ["active", "inactive"])]
    product: Vec<String>,

    #[arg(long, conflicts_with = "inactive")]
    active: Vec<String>,

    #[arg(long)]
    inactive: Vec<String>,

    /// First day of the window (YYYY-MM-DD)
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Day after the window (YYYY-MM-DD)
    #[arg(long)]
    until: Option<NaiveDate>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<LyoError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &LyoError) -> u8 {
    match error {
        LyoError::MissingConfig(_) | LyoError::ConfigRead(_) | LyoError::ConfigParse(_) => 2,
        LyoError::HttpSetup(_)
        | LyoError::TransientNetwork { .. }
        | LyoError::HttpStatus { .. } => 3,
        LyoError::StoreConnectivity(_) | LyoError::Store(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = Store::open(&config.database_path)?;
    info!(path = %config.database_path, "store opened");

    let outcome = execute(cli.command, &store, &config);
    let closed = store.close();
    outcome?;
    closed?;
    Ok(())
}

fn execute(command: Commands, store: &Store, config: &ResolvedConfig) -> miette::Result<()> {
    match command {
        Commands::Run(args) => {
            let options = RunOptions {
                skip_download: args.skip_download,
                scope: scope(args.all),
            };
            let result = pipeline(store, config)?.run(options, &LogProgress)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Commands::Approvals(args) => {
            let result = pipeline(store, config)?.approvals(args.skip_download, &LogProgress)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Commands::Labels(args) => {
            let result = pipeline(store, config)?.labels(scope(args.all), &LogProgress)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Commands::Ingredients => {
            let result = pipeline(store, config)?.ingredients(&LogProgress)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Commands::Reconcile => {
            let result = pipeline(store, config)?.reconcile(&LogProgress)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Commands::SearchData => JsonOutput::print(&search_bar_data(store)?).into_diagnostic(),
        Commands::Timeseries => {
            JsonOutput::print(&ingredient_occurrences(store)?).into_diagnostic()
        }
        Commands::Table(args) => {
            let query = TableQuery {
                products: args.product,
                active: args.active,
                inactive: args.inactive,
                from: args.from,
                until: args.until,
            };
            JsonOutput::print(&table_rows(store, &query)?).into_diagnostic()
        }
    }
}

fn pipeline<'a>(
    store: &'a Store,
    config: &'a ResolvedConfig,
) -> Result<Pipeline<'a, ApprovalFeedHttpClient, DailyMedHttpClient>, LyoError> {
    let http = RequestClient::new(config.http_timeout)?;
    Ok(Pipeline::new(
        store,
        config,
        ApprovalFeedHttpClient::new(http.clone()),
        DailyMedHttpClient::new(http),
    ))
}

fn scope(all: bool) -> ResolveScope {
    if all {
        ResolveScope::All
    } else {
        ResolveScope::Missing
    }
}
