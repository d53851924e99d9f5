//! moveaudit CLI
//!
//! `moveaudit audit <path>` runs the full pipeline against a Move project
//! and writes a Markdown report. Provider credentials come from the
//! environment (`MOVEAUDIT_PROVIDER`, `MOVEAUDIT_MODEL`, `MOVEAUDIT_API_KEY`,
//! `MOVEAUDIT_BASE_URL`) or a local `.env` file.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use moveaudit::prelude::*;

#[derive(Parser)]
#[command(name = "moveaudit", version, about = "LLM-powered Move smart contract security audit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full security audit over a Move project
    Audit {
        /// Path to the project root (the directory containing Move.toml)
        path: PathBuf,
        /// Project name used in the report (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
        /// Directory for the Markdown report
        #[arg(long, default_value = "audit-reports")]
        output_dir: PathBuf,
        /// Findings per verification group
        #[arg(long, default_value_t = 5)]
        group_size: usize,
        /// Max concurrent verification groups
        #[arg(long, default_value_t = 3)]
        max_concurrent_verify: usize,
        /// Disable grouped verification (one call per finding)
        #[arg(long)]
        no_group_verify: bool,
        /// Disable Phase 4 exploit-chain analysis
        #[arg(long)]
        no_exploit_verification: bool,
        /// Also run the broad whole-module analysis pass
        #[arg(long)]
        broad_analysis: bool,
        /// Also run the targeted per-vulnerability-type pass
        #[arg(long)]
        targeted_analysis: bool,
    },
    /// Print the project index summary without calling any LLM
    Index {
        /// Path to the project root
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Audit {
            path,
            name,
            output_dir,
            group_size,
            max_concurrent_verify,
            no_group_verify,
            no_exploit_verification,
            broad_analysis,
            targeted_analysis,
        } => {
            let project_name = name.unwrap_or_else(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "project".to_string())
            });

            let llm = LlmSettings::from_env()
                .context("LLM settings missing; set MOVEAUDIT_MODEL and MOVEAUDIT_API_KEY")?;
            let mut config = AuditConfig::new(llm).with_output_dir(&output_dir);
            config.group_size = group_size.max(1);
            config.concurrency.max_concurrent_verify = max_concurrent_verify.max(1);
            config.use_group_verify = !no_group_verify;
            config.enable_exploit_verification = !no_exploit_verification;
            config.enable_broad_analysis = broad_analysis;
            config.enable_targeted_analysis = targeted_analysis;

            let engine = SecurityAuditEngine::new(config)?.with_progress_callback(Arc::new(
                |phase, percent, message| {
                    println!(
                        "{} {}",
                        format!("[phase {phase} {percent:5.1}%]").dimmed(),
                        message
                    );
                },
            ));

            // Ctrl-C requests cooperative cancellation
            let cancel = engine.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("{}", "cancellation requested...".yellow());
                    cancel.cancel();
                }
            });

            let result = engine.audit(&path, &project_name).await;
            print_summary(&result);
            match result.status {
                AuditStatus::Completed => Ok(()),
                AuditStatus::Cancelled => {
                    anyhow::bail!("audit cancelled")
                }
                AuditStatus::Failed => {
                    anyhow::bail!("audit failed: {}", result.error.unwrap_or_default())
                }
            }
        }
        Command::Index { path } => {
            let index = ProjectIndex::build(&path, true)?;
            println!("{}", index.project_overview(8000));
            println!(
                "\n{} modules, {} functions, callgraph: {}",
                index.modules.len(),
                index.function_count(),
                index.callgraph_status.as_str()
            );
            Ok(())
        }
    }
}

fn print_summary(result: &AuditResult) {
    println!();
    println!("{}", "=== Audit summary ===".bold());
    println!("project:  {}", result.project_name);
    println!("status:   {:?}", result.status);
    println!(
        "findings: {} confirmed, {} false positives, {} needs review",
        result.stats.total_confirmed.to_string().red().bold(),
        result.stats.total_false_positive.to_string().green(),
        result.stats.total_needs_review,
    );
    for severity in ["critical", "high", "medium", "low", "advisory"] {
        if let Some(count) = result.stats.severity_counts.get(severity) {
            let label = format!("  {severity}: {count}");
            let colored_label = match severity {
                "critical" | "high" => label.red().to_string(),
                "medium" => label.yellow().to_string(),
                _ => label.normal().to_string(),
            };
            println!("{colored_label}");
        }
    }
    let total = moveaudit::report::total_token_usage(&result.token_usage);
    println!(
        "tokens:   {} calls, {} total",
        total.call_count, total.total_tokens
    );
    if let Some(error) = &result.error {
        println!("{} {error}", "error:".red().bold());
    }
}
