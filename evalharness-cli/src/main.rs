// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Evalharness CLI
//!
//! Runs one metric over a JSON-lines file of records and prints the report.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use evalharness_core::{load_records, HarnessConfig};
use evalharness_evals::{AdapterKind, AdapterRegistry, BatchReport, BatchRunner};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "evalharness")]
#[command(about = "Evalharness - score LLM outputs against reference answers", long_about = None)]
struct Cli {
    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate records with one metric
    Run {
        /// Harness configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Metric id, e.g. "llmjudge"
        #[arg(short, long)]
        metric: String,

        /// Records file (JSON lines)
        #[arg(short, long)]
        records: PathBuf,

        /// Metric parameter overrides as a JSON object
        #[arg(long)]
        params: Option<String>,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List registered metric and connector adapters
    Adapters,
}

/// Token cancelled on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling evaluation");
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; stdout is reserved for the report
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(LevelFilter::from_level(level).into()),
            )
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Run {
            config,
            metric,
            records,
            params,
            output,
        } => {
            let cancel = cancel_on_ctrl_c();
            let report = run(&config, &metric, &records, params.as_deref(), cancel).await?;
            let rendered = serde_json::to_string_pretty(&report)?;

            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("Failed to write report to {:?}", path))?;
                    info!("Report written to {:?}", path);
                }
                None => println!("{}", rendered),
            }

            if !report.failures.is_empty() {
                warn!(
                    "{} of {} records could not be evaluated",
                    report.failures.len(),
                    report.records.len()
                );
            }
        }

        Commands::Adapters => {
            let registry = AdapterRegistry::with_builtin_adapters(Arc::new(HarnessConfig::default()));
            for kind in [AdapterKind::Metric, AdapterKind::Connector] {
                for handle in registry.list(kind) {
                    println!("{:<10} {:<18} {}", handle.kind, handle.id, handle.description);
                }
            }
        }
    }

    Ok(())
}

/// Metric parameter overrides given on the command line
fn parse_params(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw).context("--params is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--params must be a JSON object, got {}", other),
    }
}

async fn run(
    config_path: &Path,
    metric_id: &str,
    records_path: &Path,
    params: Option<&str>,
    cancel: CancellationToken,
) -> Result<BatchReport> {
    let config = HarnessConfig::from_path(config_path)
        .with_context(|| format!("Failed to load configuration {:?}", config_path))?;
    let runner = BatchRunner::new(config.runner.clone());
    let registry = AdapterRegistry::with_builtin_adapters(Arc::new(config));

    let metric = registry
        .load_metric(metric_id)
        .with_context(|| format!("Failed to load metric '{}'", metric_id))?;
    if let Some(raw) = params {
        metric.update_metric_params(parse_params(raw)?);
    }

    let records = load_records(records_path)
        .with_context(|| format!("Failed to read records {:?}", records_path))?;
    info!("Loaded {} records from {:?}", records.len(), records_path);

    let report = runner.run_with_cancel(metric, records, cancel).await?;
    Ok(report)
}
