use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fhirmarshal_db_postgres::LoadMode;

use crate::config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "fhirmarshal")]
#[command(about = "Load FHIR resources into PostgreSQL and fetch bulk exports")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: fhirmarshal.toml when present)
    #[arg(short, long, global = true, env = "FHIRMARSHAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (overrides logging.level; RUST_LOG still wins)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Applies the command-line overrides to `cfg`, then validates it.
    pub fn resolve_config(&self, cfg: &mut AppConfig) -> Result<(), String> {
        if let Some(level) = &self.log_level {
            cfg.logging.level = level.clone();
        }
        match &self.command {
            Commands::Load(args) => args.load.apply(cfg),
            Commands::BulkExport(args) => args.apply(cfg),
            Commands::Config => {}
        }
        cfg.validate()
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Transform and load NDJSON / single-resource files into PostgreSQL
    Load(LoadArgs),
    /// Run a FHIR Bulk Data export and merge it into one NDJSON file
    BulkExport(BulkExportArgs),
    /// Print the effective configuration
    Config,
}

#[derive(clap::Args, Debug)]
pub struct LoadArgs {
    /// Input files or directories (gzip accepted)
    #[arg(short, long = "input", required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,

    #[command(flatten)]
    pub load: LoadOptions,
}

/// Loader flags shared by `load` and `bulk-export --load`.
#[derive(clap::Args, Debug, Default)]
pub struct LoadOptions {
    /// Write strategy: insert or copy
    #[arg(short, long)]
    pub mode: Option<LoadMode>,

    /// FHIR version selecting the rule table
    #[arg(long = "fhir")]
    pub fhir_version: Option<String>,

    /// Rows per INSERT statement
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Directory holding fhirbase-import-<version>.json rule files
    #[arg(long)]
    pub rules_dir: Option<PathBuf>,

    /// Database URL (overrides storage.postgres)
    #[arg(long, env = "DATABASE_URL")]
    pub db_url: Option<String>,
}

impl LoadOptions {
    pub fn apply(&self, cfg: &mut AppConfig) {
        if let Some(mode) = self.mode {
            cfg.loader.mode = mode;
        }
        if let Some(version) = &self.fhir_version {
            cfg.fhir.version = version.clone();
        }
        if let Some(size) = self.batch_size {
            cfg.loader.batch_size = size;
        }
        if let Some(dir) = &self.rules_dir {
            cfg.transform.rules_dir = dir.clone();
        }
        if let Some(url) = &self.db_url {
            cfg.storage.postgres.url = Some(url.clone());
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct BulkExportArgs {
    /// `$export` endpoint, or a `$export-poll-status` URL to resume polling
    #[arg(short, long)]
    pub url: String,

    /// Output directory (receives staging/ and output.ndjson)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Concurrent downloads
    #[arg(long)]
    pub num_dl: Option<usize>,

    /// Bearer token for the export server
    #[arg(long, env = "FHIRMARSHAL_BULK_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Load the merged output into PostgreSQL afterwards
    #[arg(long)]
    pub load: bool,

    #[command(flatten)]
    pub load_options: LoadOptions,
}

impl BulkExportArgs {
    pub fn apply(&self, cfg: &mut AppConfig) {
        if let Some(dir) = &self.output {
            cfg.bulk.output_dir = dir.clone();
        }
        if let Some(n) = self.num_dl {
            cfg.bulk.num_dl = n;
        }
        self.load_options.apply(cfg);
    }
}
