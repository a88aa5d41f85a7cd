//! Canvas Runtime Admin CLI
//!
//! Offline tooling for definitions documents: validate them, evaluate rules against a
//! context, dispatch a test event, and preview when time triggers would fire.

use anyhow::{bail, Context, Result};
use canvas_runtime::engine::ActionStatus;
use canvas_runtime::models::Definitions;
use canvas_runtime::{CanvasRuntime, EvaluationContext, RuntimeConfig};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "canvas-runtime-admin")]
#[command(about = "Canvas Runtime Admin CLI - Validate and try out behavior definitions")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a definitions document for problems
    Validate {
        /// Definitions document (JSON)
        file: PathBuf,
    },

    /// Evaluate the rules of a document for one element
    Evaluate {
        /// Definitions document (JSON)
        file: PathBuf,

        /// Element to evaluate rules for
        #[arg(long)]
        element: String,

        /// Evaluation context as a JSON object, or @path to read it from a file
        #[arg(long, default_value = "{}")]
        context: String,

        /// Dispatch an event of this type instead of only evaluating, running matched actions
        #[arg(long)]
        event_type: Option<String>,
    },

    /// Show the upcoming executions of every time trigger
    PreviewTriggers {
        /// Definitions document (JSON)
        file: PathBuf,

        /// Number of executions to show per trigger
        #[arg(long, default_value_t = 3)]
        count: usize,

        /// Reference instant (RFC 3339); defaults to now
        #[arg(long)]
        from: Option<DateTime<Utc>>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Evaluate {
            file,
            element,
            context,
            event_type,
        } => evaluate(&file, &element, &context, event_type.as_deref()),
        Commands::PreviewTriggers { file, count, from } => {
            preview_triggers(&file, count, from.unwrap_or_else(Utc::now))
        }
    }
}

fn load(file: &Path) -> Result<Definitions> {
    let text = std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    Definitions::from_json(&text).with_context(|| format!("failed to parse {}", file.display()))
}

fn validate(file: &Path) -> Result<()> {
    let definitions = load(file)?;
    println!("{}", format!("Definitions in {}:", file.display()).bold());
    println!("  Rules:          {}", definitions.rules.len());
    println!("  Time triggers:  {}", definitions.triggers.len());
    println!("  State machines: {}", definitions.state_machines.len());

    let problems = definitions.problems();
    if problems.is_empty() {
        println!("{}", "✅ No problems found".green());
        return Ok(());
    }
    for problem in &problems {
        println!("  {} {}", "✗".red(), problem);
    }
    bail!("{} problem(s) found", problems.len())
}

fn parse_context(raw: &str) -> Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?,
        None => raw.to_string(),
    };
    let value: Value = serde_json::from_str(&text).context("context is not valid JSON")?;
    if !value.is_object() {
        bail!("context must be a JSON object");
    }
    Ok(value)
}

fn evaluate(file: &Path, element: &str, raw_context: &str, event_type: Option<&str>) -> Result<()> {
    let definitions = load(file)?;
    let context = parse_context(raw_context)?;

    let runtime = CanvasRuntime::new(RuntimeConfig::default());
    runtime.install(definitions)?;

    match event_type {
        None => {
            let context = EvaluationContext::from_value(context, Utc::now());
            let matches = runtime.rules().evaluate_rules(element, &context);
            if matches.is_empty() {
                println!("{}", format!("No rules match {}", element).yellow());
                return Ok(());
            }
            println!("{}", format!("Rules matching {} (by priority):", element).green().bold());
            for rule in matches {
                println!(
                    "  {} [{:?}, priority {}] {} action(s)",
                    rule.rule_id.cyan(),
                    rule.rule_type,
                    rule.priority,
                    rule.actions.len()
                );
            }
        }
        Some(event_type) => {
            let report = runtime.dispatch(element, event_type, context);
            println!("{}", format!("Dispatched {} to {}", event_type, element).green().bold());
            println!("  Matched rules: {}", report.matched_rules.join(", "));
            for outcome in &report.action_outcomes {
                let status = match outcome.status {
                    ActionStatus::Applied => "applied".green(),
                    ActionStatus::Failed => "failed".red(),
                    ActionStatus::Skipped => "skipped".yellow(),
                };
                println!("  {:<16} {} {}", outcome.kind, status, outcome.result);
                if let Some(message) = &outcome.message {
                    println!("  {:<16} {}", "", message.dimmed());
                }
            }
            if !report.handled {
                println!("{}", format!("No handler for event type {}", event_type).yellow());
            }
        }
    }
    Ok(())
}

fn preview_triggers(file: &Path, count: usize, from: DateTime<Utc>) -> Result<()> {
    let definitions = load(file)?;
    if definitions.triggers.is_empty() {
        println!("{}", "No time triggers defined".yellow());
        return Ok(());
    }

    for trigger in definitions.triggers {
        let header = format!("{} ({})", trigger.id, trigger.schedule.kind());
        if !trigger.enabled {
            println!("{} {}", header.bold(), "disabled".dimmed());
            continue;
        }
        if let Err(reason) = trigger.schedule.validate() {
            println!("{} {}", header.bold(), reason.red());
            continue;
        }

        println!("{}", header.bold());
        let mut schedule = trigger.schedule.clone();
        let mut next = schedule.first_execution(from);
        for _ in 0..count {
            let Some(at) = next else {
                println!("  {}", "no further executions".dimmed());
                break;
            };
            println!("  {}", at.to_rfc3339().cyan());
            next = schedule.advance(at);
        }
    }
    Ok(())
}
