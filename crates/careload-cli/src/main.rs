use std::path::PathBuf;

use anyhow::{Context, Result};
use careload_core::LoadMode;
use careload_sync::{LoadConfig, LoadPipeline};
use clap::{Args, Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "careload")]
#[command(about = "Healthcare batch loader: full and delta loads into keyed tables")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replace every table with the contents of raw/full_load/.
    FullLoad(JobArgs),
    /// Upsert raw/delta_load/ changes by primary key.
    DeltaLoad(JobArgs),
}

/// Flags override the environment variable of the same meaning.
#[derive(Debug, Clone, Default, Args)]
struct JobArgs {
    /// Source location holding the raw CSV files [env: SOURCE_BUCKET]
    #[arg(long)]
    source_bucket: Option<String>,
    /// Target location for processed CSV files [env: TARGET_BUCKET]
    #[arg(long)]
    target_bucket: Option<String>,
    /// Table name suffix, e.g. dev or prod [env: ENVIRONMENT]
    #[arg(long)]
    environment: Option<String>,
    /// Notification topic; http(s) URLs are posted to, anything else goes to the outbox [env: SNS_TOPIC_ARN]
    #[arg(long)]
    sns_topic_arn: Option<String>,
    /// Root directory for object locations [env: CARELOAD_DATA_DIR]
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Root directory for table documents [env: CARELOAD_TABLES_DIR]
    #[arg(long)]
    tables_dir: Option<PathBuf>,
    /// Root directory for outbox notifications [env: CARELOAD_OUTBOX_DIR]
    #[arg(long)]
    outbox_dir: Option<PathBuf>,
    /// Also write the run summary as JSON to this path
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

impl JobArgs {
    fn flag(&self, name: &str) -> Option<String> {
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());
        match name {
            "SOURCE_BUCKET" => self.source_bucket.clone(),
            "TARGET_BUCKET" => self.target_bucket.clone(),
            "ENVIRONMENT" => self.environment.clone(),
            "SNS_TOPIC_ARN" => self.sns_topic_arn.clone(),
            "CARELOAD_DATA_DIR" => path(&self.data_dir),
            "CARELOAD_TABLES_DIR" => path(&self.tables_dir),
            "CARELOAD_OUTBOX_DIR" => path(&self.outbox_dir),
            _ => None,
        }
    }

    fn has_overrides(&self) -> bool {
        self.source_bucket.is_some()
            || self.target_bucket.is_some()
            || self.environment.is_some()
            || self.sns_topic_arn.is_some()
            || self.data_dir.is_some()
            || self.tables_dir.is_some()
            || self.outbox_dir.is_some()
    }

    fn config(&self) -> Result<LoadConfig> {
        if !self.has_overrides() {
            return LoadConfig::from_env();
        }
        LoadConfig::resolve(|name| self.flag(name).or_else(|| std::env::var(name).ok()))
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_job(mode: LoadMode, args: JobArgs) -> Result<()> {
    let config = args.config()?;
    let pipeline = LoadPipeline::from_config(&config)?;
    let summary = pipeline
        .run(mode)
        .await
        .with_context(|| format!("{mode} run failed"))?;

    if let Some(path) = &args.summary_json {
        let body = serde_json::to_vec_pretty(&summary)?;
        std::fs::write(path, body)
            .with_context(|| format!("writing summary to {}", path.display()))?;
        info!(path = %path.display(), "wrote run summary");
    }

    println!(
        "{} complete: run_id={} successful={}/{} total_records={}",
        mode,
        summary.run_id,
        summary.successful_entities,
        summary.entity_count,
        summary.total_records
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::FullLoad(args) => run_job(LoadMode::Full, args).await,
        Commands::DeltaLoad(args) => run_job(LoadMode::Delta, args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_load_flags() {
        let cli = Cli::try_parse_from([
            "careload",
            "full-load",
            "--source-bucket",
            "healthcare-source",
            "--environment",
            "dev",
            "--data-dir",
            "/tmp/data",
        ])
        .expect("parse");
        let Commands::FullLoad(args) = cli.command else {
            panic!("expected full-load");
        };
        assert_eq!(args.flag("SOURCE_BUCKET").as_deref(), Some("healthcare-source"));
        assert_eq!(args.flag("CARELOAD_DATA_DIR").as_deref(), Some("/tmp/data"));
        assert_eq!(args.flag("TARGET_BUCKET"), None);
    }

    #[test]
    fn flags_complete_config_without_environment() {
        let args = JobArgs {
            source_bucket: Some("src".into()),
            target_bucket: Some("dst".into()),
            environment: Some("test".into()),
            sns_topic_arn: Some("https://hooks.example.test/etl".into()),
            ..JobArgs::default()
        };
        let config = LoadConfig::resolve(|name| args.flag(name)).expect("config");
        assert_eq!(config.targets.environment, "test");
        assert_eq!(config.tables_dir, PathBuf::from("./tables"));
    }

    #[test]
    fn summary_path_alone_is_not_a_config_override() {
        let args = JobArgs {
            summary_json: Some(PathBuf::from("summary.json")),
            ..JobArgs::default()
        };
        assert!(!args.has_overrides());
        let args = JobArgs {
            outbox_dir: Some(PathBuf::from("/tmp/outbox")),
            ..JobArgs::default()
        };
        assert!(args.has_overrides());
    }

    #[test]
    fn delta_load_parses_without_flags() {
        let cli = Cli::try_parse_from(["careload", "delta-load"]).expect("parse");
        assert!(matches!(cli.command, Commands::DeltaLoad(_)));
    }
}
