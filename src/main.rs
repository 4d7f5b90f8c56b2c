//! meter -- operator tool for tenant LLM usage metering.
//!
//! Commands:
//!   - `ingest`: replay generation events (JSON lines on stdin) through the
//!     `PostGeneration` hooks, then print per-tenant usage
//!   - `summary`: cost totals from the metrics log
//!   - `subscription`: a tenant's subscription row and overage records
//!   - `provision`: create or update a tenant's subscription

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use tenant_metering::AppState;
use tenant_metering::billing::{NewSubscription, OverageRecord, Subscription, TenantUsage};
use tenant_metering::config::Config;
use tenant_metering::db::Database;
use tenant_metering::hooks::{HookContext, HookEvent};
use tenant_metering::store::MemoryCounterStore;
use tenant_metering::telemetry::init_tracing;

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

enum Command {
    Ingest,
    Summary,
    Subscription { tenant_id: String },
    Provision(NewSubscription),
}

struct CliArgs {
    config_path: Option<PathBuf>,
    command: Command,
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {message}");
    eprintln!("Run with --help for usage information.");
    std::process::exit(1);
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut positional = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => fail("--config requires a path argument"),
            },
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("meter {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other if other.starts_with('-') => fail(&format!("unknown argument: {other}")),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("ingest") => Command::Ingest,
        Some("summary") => Command::Summary,
        Some("subscription") => match positional.next() {
            Some(tenant_id) => Command::Subscription { tenant_id },
            None => fail("subscription requires a tenant id"),
        },
        Some("provision") => {
            let rest: Vec<String> = positional.by_ref().collect();
            let [tenant, allowance, rate, start, end] = rest.as_slice() else {
                fail("provision requires <TENANT> <ALLOWANCE> <RATE> <PERIOD_START> <PERIOD_END>");
            };
            let Ok(usage_allowance) = allowance.parse::<u64>() else {
                fail(&format!("invalid allowance: {allowance}"));
            };
            let Ok(overage_rate) = rate.parse::<f64>() else {
                fail(&format!("invalid overage rate: {rate}"));
            };
            if !overage_rate.is_finite() || overage_rate < 0.0 {
                fail(&format!("invalid overage rate: {rate}"));
            }
            Command::Provision(NewSubscription {
                location_id: tenant.clone(),
                usage_allowance,
                overage_rate,
                current_period_start: start.clone(),
                current_period_end: end.clone(),
            })
        }
        Some(other) => fail(&format!("unknown command: {other}")),
        None => fail("missing command"),
    };

    if let Some(extra) = positional.next() {
        fail(&format!("unexpected argument: {extra}"));
    }

    CliArgs {
        config_path,
        command,
    }
}

fn print_usage() {
    println!(
        "\
meter {version} -- tenant LLM usage metering

USAGE:
    meter [OPTIONS] <COMMAND>

COMMANDS:
    ingest                      Replay generation events (JSON lines on stdin)
    summary                     Print cost totals from the metrics log
    subscription <TENANT>       Print a subscription and its overage records
    provision <TENANT> <ALLOWANCE> <RATE> <PERIOD_START> <PERIOD_END>
                                Create or update a subscription

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: meter.toml]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log level (e.g. RUST_LOG=debug)
    METER_CONFIG           Alternative to --config flag
",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let cli = parse_args();

    let config_path = cli
        .config_path
        .or_else(|| std::env::var("METER_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("meter.toml"));

    let config = Config::load(&config_path)?;
    init_tracing(&config.logging);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting meter"
    );

    let db = Database::open(&config.database.path)?;
    tracing::debug!(path = %config.database.path.display(), "Database opened");

    let state = AppState::new(config, db, Arc::new(MemoryCounterStore::new()));

    match cli.command {
        Command::Ingest => ingest(&state).await,
        Command::Summary => print_json(&state.metrics.try_metrics_summary()?),
        Command::Subscription { tenant_id } => subscription_report(&state, &tenant_id),
        Command::Provision(new) => {
            let subscription = state.billing.subscriptions().upsert(&new)?;
            print_json(&subscription)
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Serialize, Default)]
struct IngestReport {
    events: usize,
    invalid_lines: usize,
    hook_failures: usize,
    tenants: BTreeMap<String, TenantUsage>,
}

async fn ingest(state: &AppState) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut report = IngestReport::default();
    let mut tenants = BTreeSet::new();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let mut metadata: Map<String, Value> = match serde_json::from_str(&line) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Skipping invalid event line");
                report.invalid_lines += 1;
                continue;
            }
        };

        let agent_name = match metadata.remove("agent_name") {
            Some(Value::String(name)) => name,
            _ => "ingest".to_string(),
        };
        if let Some(tenant) = metadata.get("tenant_id").and_then(Value::as_str) {
            tenants.insert(tenant.to_string());
        }

        let mut context = HookContext::new(HookEvent::PostGeneration, agent_name);
        context.metadata = metadata;
        let dispatch = state.hooks.atrigger(HookEvent::PostGeneration, &context).await;

        report.events += 1;
        report.hook_failures += dispatch.failed;
    }

    state.billing.drain().await;

    for tenant in tenants {
        let usage = state.billing.get_tenant_usage(&tenant).await;
        // Final reconcile so the durable row reflects the whole batch.
        state.billing.sync_to_db(&tenant).await;
        report.tenants.insert(tenant, usage);
    }

    tracing::info!(
        events = report.events,
        invalid = report.invalid_lines,
        failures = report.hook_failures,
        "Ingest complete"
    );
    print_json(&report)
}

#[derive(Serialize)]
struct SubscriptionReport {
    subscription: Subscription,
    overage_records: Vec<OverageRecord>,
    overage_total: f64,
}

fn subscription_report(state: &AppState, tenant_id: &str) -> anyhow::Result<()> {
    let repo = state.billing.subscriptions();
    let Some(subscription) = repo.get_by_location(tenant_id)? else {
        anyhow::bail!("no subscription for tenant {tenant_id}");
    };
    let overage_records = repo.overage_records(tenant_id)?;
    let overage_total = overage_records.iter().map(|r| r.amount).sum();

    print_json(&SubscriptionReport {
        subscription,
        overage_records,
        overage_total,
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
