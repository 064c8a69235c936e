use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "gleaner")]
#[command(
    author,
    version,
    about = "Harvests remote metadata catalogs into a CKAN catalog"
)]
#[command(after_help = "Examples:
  gleaner init-db
  gleaner harvest https://data.example.org/data.json
  gleaner harvest --source city-data --force-import
  gleaner errors --run 6f1c0d2e-0000-4000-8000-000000000000
  gleaner stats")]
pub struct Config {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Base URL of the target CKAN catalog
    #[arg(long, env = "CATALOG_URL", global = true)]
    pub catalog_url: Option<String>,

    /// API token used for catalog writes
    #[arg(long, env = "CATALOG_API_KEY", global = true, hide_env_values = true)]
    pub catalog_api_key: Option<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Gather, fetch and import records from harvest sources
    #[command(after_help = "Examples:
  gleaner harvest                                   # Harvest all enabled sources from config
  gleaner harvest https://data.example.org/data.json
  gleaner harvest --source city-data                # Harvest a source by name from config
  gleaner harvest --config ~/custom.toml            # Use custom config file
  gleaner harvest URL --header 'X-Api-Key: secret'  # Extra request headers")]
    Harvest {
        /// URL or local path of a single source to harvest
        #[arg(value_name = "URL")]
        source_url: Option<String>,

        /// Harvest a specific source by name from config file
        #[arg(short, long, value_name = "NAME", conflicts_with = "source_url")]
        source: Option<String>,

        /// Custom path to sources.toml configuration file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Re-import every record even when the target is already current
        #[arg(long)]
        force_import: bool,

        /// Extra HTTP header sent with every source request ("Name: value")
        #[arg(long = "header", value_name = "NAME:VALUE")]
        headers: Vec<String>,
    },
    /// Check a source configuration JSON object against the catalog
    #[command(after_help = "Example: gleaner validate-config '{\"default_groups\": [\"environment\"]}'")]
    ValidateConfig {
        /// Source configuration as a JSON object
        json: String,
    },
    /// List gather and record errors, newest first
    Errors {
        /// Only show errors of this run
        #[arg(short, long, value_name = "ID")]
        run: Option<Uuid>,

        /// Maximum number of errors to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Show database statistics
    Stats,
    /// Create the database schema if it does not exist
    InitDb,
}
