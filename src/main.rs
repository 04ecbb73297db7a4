mod cli;
mod error;
mod exophase;
mod models;
mod output;
mod pipeline;
mod source;
mod store;

use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::cli::{Cli, Commands, CredentialArgs, FetchArgs, OutputFormat, SettingsSubcommands};
use crate::error::AppError;
use crate::exophase::Endpoints;
use crate::models::{Credentials, DataSource, PipelineReport, Snapshot, StepOutcome};
use crate::output::{print_error, print_success};
use crate::pipeline::{Aggregator, CredentialStore, PipelineConfig};
use crate::source::HttpSource;
use crate::store::SettingsStore;

#[derive(Debug, Serialize)]
struct FetchData {
    credentials: Credentials,
    snapshot: Snapshot,
    report: PipelineReport,
}

#[derive(Debug, Serialize)]
struct SettingsData {
    credentials: Credentials,
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();
    let format = cli.resolved_format();

    let result = run(cli, format).await;
    if let Err(err) = result {
        print_error(format, err);
        std::process::exit(1);
    }
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .init();
}

async fn run(cli: Cli, format: OutputFormat) -> Result<(), AppError> {
    let store = SettingsStore::open()?;

    match cli.command {
        Commands::Fetch(args) => handle_fetch(format, store, args).await,
        Commands::Settings(cmd) => match cmd.action {
            SettingsSubcommands::Show => handle_settings_show(format, &store),
            SettingsSubcommands::Set(args) => handle_settings_set(format, &store, args),
        },
    }
}

async fn handle_fetch(
    format: OutputFormat,
    store: SettingsStore,
    args: FetchArgs,
) -> Result<(), AppError> {
    if args.concurrency == 0 {
        return Err(AppError::InvalidArgument(
            "--concurrency must be at least 1".to_string(),
        ));
    }

    let config = PipelineConfig {
        endpoints: Endpoints::new(&args.web_base, &args.api_base, &args.platform)?,
        max_in_flight: args.concurrency,
    };
    let stored = store.credentials()?;
    let source = Arc::new(HttpSource::new()?);

    let mut aggregator = Aggregator::new(source, Box::new(store), config, stored.clone());
    let progress = tokio::spawn(log_progress(aggregator.subscribe()));

    if args.credentials.is_empty() {
        aggregator.start();
    } else {
        aggregator.update_credentials(merge_credentials(stored, args.credentials))?;
    }

    let report = aggregator.wait().await?;
    let snapshot = aggregator.subscribe().borrow().clone();
    progress.abort();

    if report.is_terminal_failure() {
        return Err(AppError::Incomplete(terminal_reason(&report)));
    }

    let data = FetchData {
        credentials: aggregator.credentials().clone(),
        snapshot,
        report,
    };

    print_success(format, data, DataSource::Exophase, print_fetch_human);
    Ok(())
}

fn handle_settings_show(format: OutputFormat, store: &SettingsStore) -> Result<(), AppError> {
    let data = SettingsData {
        credentials: store.credentials()?,
    };
    print_success(format, data, DataSource::LocalDb, |d| {
        print_credentials_human(&d.credentials)
    });
    Ok(())
}

fn handle_settings_set(
    format: OutputFormat,
    store: &SettingsStore,
    args: CredentialArgs,
) -> Result<(), AppError> {
    if args.is_empty() {
        return Err(AppError::InvalidArgument(
            "provide --handle and/or --username".to_string(),
        ));
    }

    let credentials = merge_credentials(store.credentials()?, args);
    store.save_credentials(&credentials)?;

    let data = SettingsData { credentials };
    print_success(format, data, DataSource::LocalDb, |d| {
        print_credentials_human(&d.credentials)
    });
    Ok(())
}

fn merge_credentials(stored: Credentials, args: CredentialArgs) -> Credentials {
    Credentials {
        handle: args.handle.unwrap_or(stored.handle),
        username: args.username.unwrap_or(stored.username),
    }
}

fn terminal_reason(report: &PipelineReport) -> String {
    match (&report.profile, &report.games) {
        (StepOutcome::Failed { reason }, _) => format!("profile: {reason}"),
        (_, Some(StepOutcome::Failed { reason })) => format!("game list: {reason}"),
        _ => "unknown step".to_string(),
    }
}

async fn log_progress(mut updates: watch::Receiver<Snapshot>) {
    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update();
        info!(
            run = snapshot.run,
            loading = snapshot.loading,
            games = snapshot.games.len(),
            achievements = snapshot.achievements.len(),
            "progress"
        );
    }
}

fn print_credentials_human(credentials: &Credentials) {
    println!("handle:   {}", credentials.handle);
    println!("username: {}", credentials.username);
}

fn print_fetch_human(data: &FetchData) {
    let snapshot = &data.snapshot;
    println!(
        "games for {} ({})",
        data.credentials.username,
        snapshot.games.len()
    );
    for game in &snapshot.games {
        let earned = snapshot
            .achievements
            .iter()
            .filter(|a| a.game_id == game.id)
            .count();
        println!(
            "{}\t{}\t{}h {}m\t{} earned",
            game.id,
            game.title,
            game.playtime_min / 60,
            game.playtime_min % 60,
            earned
        );
    }

    println!("\nachievements ({})", snapshot.achievements.len());
    for achievement in &snapshot.achievements {
        println!(
            "{}\t{}\t{}\t{}",
            achievement.earned_at.format("%Y-%m-%d %H:%M"),
            achievement.game_id,
            achievement.name,
            achievement.description
        );
    }

    let problems = data
        .report
        .achievements
        .iter()
        .filter(|g| !matches!(g.outcome, StepOutcome::Success))
        .collect::<Vec<_>>();
    if !problems.is_empty() {
        println!("\nincomplete games ({})", problems.len());
        for game in problems {
            match &game.outcome {
                StepOutcome::Partial { dropped, .. } => {
                    println!("{}\tpartial\t{} dropped", game.game_id, dropped)
                }
                StepOutcome::Failed { reason } => println!("{}\tfailed\t{}", game.game_id, reason),
                StepOutcome::Skipped { reason } => {
                    println!("{}\tskipped\t{}", game.game_id, reason)
                }
                StepOutcome::Success => {}
            }
        }
    }
}
