//! Operator surface for the score relay.
//!
//! `relay serve` adapts the coordinator to a line-delimited JSON substrate:
//! inbound messages on stdin, outbound dispatches on stdout, logs on stderr.

use std::io::{BufRead, Stdout};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use score_relay_coordinator::{
    Coordinator, CoordinatorConfig, JsonLinesDispatcher, UnknownReplyPolicy,
};
use score_relay_core::{
    default_rules, digest, evaluate, explain, load_rules_json, now_utc, EntityMetrics,
    InboundMessage, Rule,
};
use score_relay_store_sqlite::SqliteRecordStore;
use score_relay_tracker::{RecordStore, Tracker};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relay")]
#[command(about = "Score relay orchestration CLI")]
pub struct Cli {
    /// Rule set JSON file; the built-in rules are used when absent.
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },
    Evaluate(EvaluateArgs),
    Serve(ServeArgs),
    Requests {
        #[command(subcommand)]
        command: RequestsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum RulesCommand {
    List,
}

#[derive(Debug, Args)]
pub struct EvaluateArgs {
    #[arg(long)]
    metrics: PathBuf,
    #[arg(long)]
    explain: bool,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Durable tracker database; requests are tracked in memory when absent.
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    stale_after_seconds: Option<u64>,
    #[arg(long)]
    sweep_interval_seconds: Option<u64>,
    #[arg(long)]
    unknown_reply_policy: Option<PolicyArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    Recover,
    Drop,
}

#[derive(Debug, Subcommand)]
pub enum RequestsCommand {
    List(DbArgs),
    Show(ShowArgs),
}

#[derive(Debug, Args)]
pub struct DbArgs {
    #[arg(long, default_value = "./score_relay.sqlite3")]
    db: PathBuf,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long, default_value = "./score_relay.sqlite3")]
    db: PathBuf,
    #[arg(long)]
    request_id: String,
}

/// Executes a parsed `relay` command line.
///
/// # Errors
/// Returns an error when input files cannot be read or decoded, the
/// configuration is invalid, or the tracker store fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing();

    match cli.command {
        Command::Rules {
            command: RulesCommand::List,
        } => {
            let rules = load_rules(cli.rules.as_deref())?;
            let listing = rules.iter().map(rule_listing).collect::<Vec<_>>();
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(())
        }
        Command::Evaluate(args) => {
            let rules = load_rules(cli.rules.as_deref())?;
            run_evaluate(&args, &rules)
        }
        Command::Serve(args) => {
            let rules = load_rules(cli.rules.as_deref())?;
            run_serve(&args, rules)
        }
        Command::Requests { command } => run_requests(command),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_json_file(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn load_rules(path: Option<&Path>) -> Result<Vec<Rule>> {
    match path {
        Some(path) => {
            let value = read_json_file(path)?;
            load_rules_json(&value).with_context(|| format!("invalid rule set {}", path.display()))
        }
        None => Ok(default_rules()),
    }
}

fn rule_listing(rule: &Rule) -> Value {
    json!({
        "name": rule.name,
        "description": rule.description,
        "priority": rule.priority,
        "when": rule.conditions.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "then": rule.effects,
    })
}

fn run_evaluate(args: &EvaluateArgs, rules: &[Rule]) -> Result<()> {
    let value = read_json_file(&args.metrics)?;
    let metrics = EntityMetrics::from_json(&value)
        .with_context(|| format!("invalid metrics in {}", args.metrics.display()))?;

    let result = evaluate(&metrics, rules);
    let signature = digest(&result)?;
    let mut output = json!({
        "result": result,
        "digest": signature,
    });
    if args.explain {
        output["explanation"] = Value::String(explain(&result));
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn serve_config(args: &ServeArgs) -> Result<CoordinatorConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let value = read_json_file(path)?;
            CoordinatorConfig::from_json(&value)
                .with_context(|| format!("invalid coordinator config {}", path.display()))?
        }
        None => CoordinatorConfig::default(),
    };

    if let Some(value) = args.stale_after_seconds {
        config.stale_after_seconds = value;
    }
    if let Some(value) = args.sweep_interval_seconds {
        config.sweep_interval_seconds = value;
    }
    if let Some(policy) = args.unknown_reply_policy {
        config.unknown_reply_policy = match policy {
            PolicyArg::Recover => UnknownReplyPolicy::Recover,
            PolicyArg::Drop => UnknownReplyPolicy::Drop,
        };
    }
    config.validate()?;
    Ok(config)
}

fn run_serve(args: &ServeArgs, rules: Vec<Rule>) -> Result<()> {
    let config = serve_config(args)?;
    match &args.db {
        Some(path) => {
            let store = SqliteRecordStore::open_migrated(path)?;
            serve(Tracker::new(store), config, rules, false)
        }
        None => serve(Tracker::in_memory(), config, rules, true),
    }
}

/// In-memory records do not outlive the process, so `drain_on_exit` fails
/// them with a terminal notification once stdin closes.
fn serve<S: RecordStore>(
    tracker: Tracker<S>,
    config: CoordinatorConfig,
    rules: Vec<Rule>,
    drain_on_exit: bool,
) -> Result<()> {
    let dispatcher = JsonLinesDispatcher::new(std::io::stdout());
    let mut coordinator: Coordinator<S, JsonLinesDispatcher<Stdout>> =
        Coordinator::new(config, rules, tracker, dispatcher)?;
    let sweep_interval = coordinator.config().sweep_interval();
    info!(
        metrics_endpoint = %coordinator.config().metrics_endpoint,
        ledger_endpoint = %coordinator.config().ledger_endpoint,
        notifier_endpoint = %coordinator.config().notifier_endpoint,
        policy = coordinator.config().unknown_reply_policy.as_str(),
        "relay serving"
    );

    let (sender, receiver) = mpsc::channel::<String>();
    let reader = thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if sender.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        match receiver.recv_timeout(sweep_interval) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<InboundMessage>(&line) {
                    Ok(message) => {
                        coordinator.handle(message, now_utc())?;
                    }
                    Err(err) => warn!(error = %err, "malformed inbound message skipped"),
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        coordinator.tick(now_utc())?;
    }

    reader
        .join()
        .map_err(|_| anyhow!("stdin reader thread panicked"))?;

    if drain_on_exit {
        coordinator.shutdown(now_utc())?;
    }

    let stats = coordinator.stats();
    info!(
        requests_received = stats.requests_received,
        duplicates_rejected = stats.duplicates_rejected,
        scored = stats.scored,
        completed = stats.completed,
        failed = stats.failed,
        recovered = stats.recovered,
        dropped = stats.dropped,
        discarded = stats.discarded,
        stale_evictions = stats.stale_evictions,
        dispatch_failures = stats.dispatch_failures,
        status_queries = stats.status_queries,
        "relay stopped"
    );
    Ok(())
}

fn run_requests(command: RequestsCommand) -> Result<()> {
    match command {
        RequestsCommand::List(args) => {
            let tracker = Tracker::new(SqliteRecordStore::open_migrated(&args.db)?);
            let records = tracker.list()?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        RequestsCommand::Show(args) => {
            let tracker = Tracker::new(SqliteRecordStore::open_migrated(&args.db)?);
            let record = tracker
                .get(&args.request_id)?
                .ok_or_else(|| anyhow!("request {} is not tracked", args.request_id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
    }
}
