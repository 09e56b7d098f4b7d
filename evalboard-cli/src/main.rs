// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Evalboard CLI
//!
//! Inspect evaluation-run metrics from the command line.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use evalboard_core::{BasicStats, EngineConfig, RunStatus};
use evalboard_engine::{EvalEngine, LoadReport, MetricValue, RunRef, StatsQuery, ValueQuery};
use std::path::PathBuf;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "evalboard")]
#[command(about = "Evalboard - evaluation run metrics", long_about = None)]
struct Cli {
    /// Config file (TOML); EVALBOARD_API_URL / EVALBOARD_API_KEY override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Output as JSON (machine-readable)
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run-level statistics for a metric
    RunStats {
        /// Project ID
        #[arg(long)]
        project: String,

        /// Run ID
        #[arg(long)]
        run: String,

        /// Metric key, e.g. totalCost or costs.total
        #[arg(long)]
        metric: String,

        /// Step key scoping the metric
        #[arg(long)]
        step: Option<String>,

        /// Run status as reported by the backend
        #[arg(long, default_value = "completed")]
        status: String,
    },

    /// Value of one metric for a scenario
    ScenarioValue {
        #[arg(long)]
        project: String,

        #[arg(long)]
        run: String,

        /// Scenario ID
        #[arg(long)]
        scenario: String,

        /// Dot-separated metric path
        path: String,

        #[arg(long)]
        metric: Option<String>,

        #[arg(long)]
        step: Option<String>,

        /// Evaluator key for nested output lookups
        #[arg(long)]
        evaluator: Option<String>,

        #[arg(long, default_value = "completed")]
        status: String,
    },

    /// Time series of a live run's metric
    Temporal {
        #[arg(long)]
        project: String,

        #[arg(long)]
        run: String,

        #[arg(long)]
        metric: String,

        #[arg(long)]
        step: Option<String>,

        /// Point in time (epoch ms or RFC 3339); latest when omitted
        #[arg(long)]
        at: Option<String>,

        #[arg(long, default_value = "running")]
        status: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn parse_at(raw: &str) -> Result<i64> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    let parsed = chrono::DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp: {raw}"))?;
    Ok(parsed.timestamp_millis())
}

fn report_gaps(report: &LoadReport) {
    for gap in &report.gaps {
        warn!(%gap, "No metric data yet");
    }
    if report.refreshed {
        info!("Metrics were recomputed by the backend");
    }
}

fn print_stats(stats: &BasicStats) {
    let field = |name: &str, value: Option<f64>| {
        if let Some(value) = value {
            println!("  {:<8} {}", name, value);
        }
    };
    field("count", stats.count);
    field("sum", stats.sum);
    field("mean", stats.mean);
    field("min", stats.min);
    field("max", stats.max);
    field("range", stats.range);
    for entry in &stats.rank {
        println!("  {:<8} {} x{}", "value", entry.value, entry.count);
    }
    if !stats.distribution.is_empty() {
        println!(
            "  {:<8} {} buckets (bin size {})",
            "hist",
            stats.distribution.len(),
            stats.bin_size.map_or("-".to_string(), |b| b.to_string())
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = load_config(cli.config.as_ref())?;
    let engine = EvalEngine::from_config(&config).context("Failed to build engine")?;

    match cli.command {
        Commands::RunStats {
            project,
            run,
            metric,
            step,
            status,
        } => {
            let run = RunRef::new(project, run, RunStatus::parse(&status));
            let report = engine.store.load_run(&run, &[]).await?;
            report_gaps(&report);

            let query = StatsQuery {
                metric_key: Some(metric.clone()),
                step_key: step,
            };
            let stats = engine.store.get_run_level_stats(&run.run_id, &query);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }
            match stats {
                Some(stats) => {
                    let kind = if engine.store.is_temporal(&run.run_id) {
                        "latest snapshot"
                    } else {
                        "aggregate"
                    };
                    println!("{} ({}) for run {}:", metric, kind, run.run_id);
                    print_stats(&stats);
                }
                None => println!("No data for {} in run {}", metric, run.run_id),
            }
        }

        Commands::ScenarioValue {
            project,
            run,
            scenario,
            path,
            metric,
            step,
            evaluator,
            status,
        } => {
            let run = RunRef::new(project, run, RunStatus::parse(&status));
            let report = engine
                .store
                .load_run(&run, std::slice::from_ref(&scenario))
                .await?;
            report_gaps(&report);

            let query = ValueQuery {
                metric_key: metric,
                step_key: step,
                evaluator_key: evaluator,
            };
            let value = engine.store.get_value(&scenario, &path, &query);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&value)?);
                return Ok(());
            }
            match value {
                Some(MetricValue::Stats(stats)) => {
                    println!("{} for scenario {}:", path, scenario);
                    print_stats(&stats);
                }
                Some(MetricValue::Raw(raw)) => println!("{} = {}", path, raw),
                None => println!("No data for {} in scenario {}", path, scenario),
            }
        }

        Commands::Temporal {
            project,
            run,
            metric,
            step,
            at,
            status,
        } => {
            let at = at.as_deref().map(parse_at).transpose()?;
            let run = RunRef::new(project, run, RunStatus::parse(&status));
            let report = engine.store.load_run(&run, &[]).await?;
            report_gaps(&report);

            let query = StatsQuery {
                metric_key: Some(metric.clone()),
                step_key: step,
            };
            let series = engine.store.temporal_series(&run.run_id, &query);
            if series.is_empty() {
                bail!("Run {} has no time series for {}", run.run_id, metric);
            }
            let point = engine.store.get_temporal_as_of(&run.run_id, &query, at);

            if cli.json {
                let out = serde_json::json!({"series": series, "as_of": point});
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }
            for p in &series {
                let when = chrono::DateTime::from_timestamp_millis(p.timestamp)
                    .map_or_else(|| p.timestamp.to_string(), |dt| dt.to_rfc3339());
                let headline = p
                    .stats
                    .headline()
                    .map_or_else(|| "-".to_string(), |v| v.to_string());
                println!("  {}  {}", when, headline);
            }
            if let Some(stats) = point {
                println!("{} as of {}:", metric, at.map_or("latest".to_string(), |ts| ts.to_string()));
                print_stats(&stats);
            }
        }
    }

    Ok(())
}
