use anyhow::{bail, Context};
use clap::Parser;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::path::Path;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use gleaner_cli::{Command, Config};
use gleaner_client::{CkanCatalog, ContentFetcher, DcatJsonFormat, HeaderHook, SessionHook};
use gleaner_core::{
    load_sources_config, validate_config, AppError, BatchHarvestSummary, DbConfig, FetchConfig,
    HarvestService, SourceEntry, SourceHarvestResult,
};
use gleaner_db::HarvestRepository;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    let config = Config::parse();

    // Setup logging (stderr to keep stdout clean for command output)
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install the log subscriber")?;

    match &config.command {
        Command::Harvest {
            source_url,
            source,
            config: config_path,
            force_import,
            headers,
        } => {
            let repo = connect(&config).await?;
            let catalog = catalog(&config)?;
            let entries = resolve_sources(
                source_url.as_deref(),
                source.as_deref(),
                config_path.as_deref(),
            )?;

            let header_hook = HeaderHook::parse(headers).map_err(user_error)?;
            let hooks: Vec<&dyn SessionHook> = if header_hook.is_empty() {
                Vec::new()
            } else {
                vec![&header_hook as &dyn SessionHook]
            };
            let fetcher =
                ContentFetcher::with_hooks(FetchConfig::default(), &hooks).map_err(user_error)?;

            let service = HarvestService::new(fetcher, repo, catalog, DcatJsonFormat);
            harvest(&service, &entries, *force_import).await?;
        }
        Command::ValidateConfig { json } => {
            let catalog = catalog(&config)?;
            let parsed = validate_config(json, &catalog).await.map_err(user_error)?;
            println!("\nConfiguration is valid\n");
            println!("  default_tags:     {:?}", parsed.default_tags);
            println!("  default_groups:   {:?}", parsed.default_groups);
            println!("  default_extras:   {} keys", parsed.default_extras.len());
            println!("  override_extras:  {}", parsed.override_extras);
            println!();
        }
        Command::Errors { run, limit } => {
            let repo = connect(&config).await?;
            show_errors(&repo, *run, *limit).await?;
        }
        Command::Stats => {
            let repo = connect(&config).await?;
            show_stats(&repo).await?;
        }
        Command::InitDb => {
            let repo = connect(&config).await?;
            repo.ensure_schema().await.map_err(user_error)?;
            println!("Database schema is ready.");
        }
    }

    Ok(())
}

fn user_error(e: AppError) -> anyhow::Error {
    anyhow::anyhow!(e.user_message())
}

async fn connect(config: &Config) -> anyhow::Result<HarvestRepository> {
    let Some(url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL is not set");
    };

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(DbConfig::default().max_connections)
        .connect(url)
        .await
        .context("Failed to connect to database")?;

    Ok(HarvestRepository::new(pool))
}

fn catalog(config: &Config) -> anyhow::Result<CkanCatalog> {
    let Some(url) = config.catalog_url.as_deref() else {
        bail!("CATALOG_URL is not set");
    };
    CkanCatalog::new(url, config.catalog_api_key.clone()).map_err(user_error)
}

/// Picks the sources to harvest: a single URL, one named source, or every
/// enabled source in the config file.
fn resolve_sources(
    source_url: Option<&str>,
    source_name: Option<&str>,
    config_path: Option<&Path>,
) -> anyhow::Result<Vec<SourceEntry>> {
    if let Some(url) = source_url {
        return Ok(vec![SourceEntry::from_url(url)]);
    }

    let sources = load_sources_config(config_path).map_err(user_error)?;
    match source_name {
        Some(name) => match sources.find_by_name(name) {
            Some(entry) => Ok(vec![entry.clone()]),
            None => bail!("Source '{}' not found in configuration", name),
        },
        None => {
            let enabled: Vec<SourceEntry> =
                sources.enabled_sources().into_iter().cloned().collect();
            if enabled.is_empty() {
                bail!("No enabled sources in configuration");
            }
            Ok(enabled)
        }
    }
}

async fn harvest(
    service: &HarvestService<ContentFetcher, HarvestRepository, CkanCatalog>,
    entries: &[SourceEntry],
    force_import: bool,
) -> anyhow::Result<()> {
    if let [entry] = entries {
        info!(source = %entry.name, url = %entry.url, "Starting harvest");
        let result = service
            .run_source(entry, force_import)
            .await
            .map_err(user_error)?;
        print_result(&result);
        if let Some(error) = &result.error {
            bail!("Harvest of {} failed: {}", entry.name, error);
        }
        return Ok(());
    }

    info!(sources = entries.len(), "Starting batch harvest");
    let refs: Vec<&SourceEntry> = entries.iter().collect();
    let summary = service.batch_harvest(&refs, force_import).await;
    print_summary(&summary);

    if summary.successful_count() == 0 {
        bail!("All {} sources failed", summary.total_sources());
    }
    Ok(())
}

fn print_result(result: &SourceHarvestResult) {
    let gather = &result.gather;
    let import = &result.import;
    let mark = if result.is_success() { "ok" } else { "FAILED" };

    println!("\n[{}] {} ({})", mark, result.source_name, result.source_url);
    println!(
        "  gathered: {} pages, {} new, {} changed ({} unchanged content), {} deleted",
        gather.pages, gather.new, gather.changed, gather.unchanged_content, gather.deleted
    );
    println!(
        "  imported: {} created, {} updated, {} deleted, {} skipped, {} failed",
        import.created, import.updated, import.deleted, import.skipped, import.failed
    );
    if let Some(error) = &result.error {
        println!("  error:    {}", error);
    }
}

fn print_summary(summary: &BatchHarvestSummary) {
    for result in &summary.results {
        print_result(result);
    }
    println!(
        "\n{} sources: {} successful, {} failed, {} records imported\n",
        summary.total_sources(),
        summary.successful_count(),
        summary.failed_count(),
        summary.total_records()
    );
}

async fn show_errors(
    repo: &HarvestRepository,
    run: Option<Uuid>,
    limit: usize,
) -> anyhow::Result<()> {
    let errors = repo.list_errors(run, limit).await.map_err(user_error)?;

    if errors.is_empty() {
        println!("\nNo harvest errors recorded.\n");
        return Ok(());
    }

    println!("\nHarvest errors ({})\n", errors.len());
    for entry in errors {
        let scope = match (&entry.guid, entry.phase) {
            (Some(guid), Some(phase)) => format!("{} [{}]", guid, phase),
            (Some(guid), None) => guid.clone(),
            _ => "gather".to_string(),
        };
        println!(
            "  {}  run {}  {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.run_id,
            scope
        );
        println!("    {}", entry.message);
    }
    println!();

    Ok(())
}

/// Show database statistics
async fn show_stats(repo: &HarvestRepository) -> anyhow::Result<()> {
    let stats = repo.get_stats().await.map_err(user_error)?;

    println!("\nDatabase Statistics\n");
    println!("  Harvest sources:       {}", stats.total_sources);
    println!("  Harvest runs:          {}", stats.total_runs);
    println!("  Harvest records:       {}", stats.total_records);
    println!("  Current records:       {}", stats.current_records);
    println!("  Errors:                {}", stats.total_errors);
    if let Some(last_run) = stats.last_run {
        println!("  Last run:              {}", last_run);
    }
    println!();

    Ok(())
}
