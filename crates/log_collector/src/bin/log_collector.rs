//! `log-collector` command-line entry point
//!
//! Polls a tracking log source, ingests new units and runs the aggregation
//! pipelines, sleeping between cycles until interrupted.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use log_collector::{source::build_backend, BackendKind, CollectorConfig, LogCollector};

/// Tracking log collector
#[derive(Debug, Parser)]
#[command(name = "log-collector", version, about)]
struct Args {
    /// Directory with tracking logs [default: /edx/var/log/tracking]
    #[arg(long, alias = "tracking_log_dir")]
    tracking_log_dir: Option<PathBuf>,

    /// Seconds to sleep between cycles [default: 300]
    #[arg(long, alias = "sleep_time")]
    sleep_time: Option<u64>,

    /// Source backend [default: file-system]
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Reload all logs, including archives already processed
    #[arg(long, alias = "reload_logs")]
    reload_logs: bool,

    /// Delete consumed raw events after each archive is processed
    #[arg(long, alias = "delete_logs")]
    delete_logs: bool,

    /// S3 bucket with tracking logs
    #[arg(long, alias = "bucket_name")]
    bucket_name: Option<String>,

    /// AWS access key id
    #[arg(long, alias = "aws_access_key_id", env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    aws_access_key_id: Option<String>,

    /// AWS secret access key
    #[arg(long, alias = "aws_secret_access_key", env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    aws_secret_access_key: Option<String>,

    /// AWS region
    #[arg(long, env = "AWS_REGION")]
    aws_region: Option<String>,

    /// Azure blob container with tracking logs
    #[arg(long)]
    container_name: Option<String>,

    /// Azure storage account
    #[arg(long, env = "AZURE_STORAGE_ACCOUNT")]
    azure_account: Option<String>,

    /// Azure storage access key
    #[arg(long, env = "AZURE_STORAGE_ACCESS_KEY", hide_env_values = true)]
    azure_access_key: Option<String>,

    /// Database file [default: ./data/log_collector.redb]
    #[arg(long)]
    database: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// Command-line values take precedence over file and environment
    fn apply(&self, config: &mut CollectorConfig) {
        let source = &mut config.source;
        if let Some(ref dir) = self.tracking_log_dir {
            source.tracking_log_dir.clone_from(dir);
        }
        if let Some(backend) = self.backend {
            source.backend = backend;
        }
        override_with(&mut source.bucket_name, self.bucket_name.as_ref());
        override_with(&mut source.aws_access_key_id, self.aws_access_key_id.as_ref());
        override_with(&mut source.aws_secret_access_key, self.aws_secret_access_key.as_ref());
        override_with(&mut source.aws_region, self.aws_region.as_ref());
        override_with(&mut source.container_name, self.container_name.as_ref());
        override_with(&mut source.azure_account, self.azure_account.as_ref());
        override_with(&mut source.azure_access_key, self.azure_access_key.as_ref());

        if let Some(seconds) = self.sleep_time {
            config.scheduler.sleep_interval_secs = seconds;
        }
        config.scheduler.reload_logs |= self.reload_logs;
        config.scheduler.delete_logs |= self.delete_logs;

        if let Some(ref path) = self.database {
            config.storage.database_path = Some(path.clone());
            config.storage.use_memory_storage = false;
        }
    }
}

fn override_with(target: &mut Option<String>, value: Option<&String>) {
    if let Some(value) = value {
        *target = Some(value.clone());
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = CollectorConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate_config()?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let backend = build_backend(&config.source)?;
    let collector = LogCollector::open(config).context("Failed to open collector database")?;

    if args.once {
        let report = collector.load_and_process(backend).await?;
        info!(
            "Cycle finished: {} units, {} events stored, {} records applied, {} deleted",
            report.units, report.ingest.stored, report.applied, report.deleted
        );
        return Ok(());
    }

    collector.run(backend).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_tracing(args.log_json);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
