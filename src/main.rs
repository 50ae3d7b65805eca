//! # ReachClaw — multi-account outreach dispatcher
//!
//! Usage:
//!   reachclaw serve [--dry-run]                    # Run the dispatcher and alert loop
//!   reachclaw status --tenant acme                 # Queue and account overview
//!   reachclaw enqueue --tenant acme --account a1 --target @lan --text "Hi"
//!   reachclaw cancel --tenant acme 42
//!   reachclaw plan                                 # Connection offsets per account
//!   reachclaw match --tenant acme "bao nhiêu tiền" # Keyword hits for a text
//!   reachclaw score signals.json                   # Score a contact

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use reachclaw_channels::{DryRunPlatform, HttpBridgePlatform};
use reachclaw_core::traits::ChatPlatform;
use reachclaw_core::types::{AccountId, ContactSignals, NewMessage, Priority, Scope, TenantId};
use reachclaw_core::ReachClawConfig;
use reachclaw_db::FleetDb;
use reachclaw_keywords::KeywordIndex;
use reachclaw_leads::LeadScorer;
use reachclaw_monitor::{AlertEngine, AlertHistory, CheckRegistry, KeywordHitTally, sinks_from_config, spawn_alert_loop};
use reachclaw_scheduler::{ConnectionScheduler, Dispatcher, DispatchQueue, InboundPipeline};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// How often `serve` picks up keyword-set and rule edits.
const RELOAD_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(
    name = "reachclaw",
    version,
    about = "📣 ReachClaw — staggered multi-account dispatch with keyword triggers and alerts"
)]
struct Cli {
    /// Config file (default ~/.reachclaw/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher, inbound pipeline and alert loop until Ctrl-C.
    Serve {
        /// Log sends instead of talking to the bridge
        #[arg(long)]
        dry_run: bool,
    },
    /// Queue counts and accounts for a tenant.
    Status {
        /// Tenant id; omit only in single-tenant installs
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Queue one text message.
    Enqueue {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        account: String,
        #[arg(long)]
        target: String,
        #[arg(long)]
        text: String,
        /// urgent, high, normal or low
        #[arg(long, default_value = "normal")]
        priority: String,
    },
    /// Cancel a pending or retrying message.
    Cancel {
        #[arg(long)]
        tenant: String,
        id: i64,
    },
    /// Print each account's connection offset from service start.
    Plan,
    /// Show keyword hits for a text.
    Match {
        #[arg(long)]
        tenant: String,
        text: String,
    },
    /// Score a contact from a JSON ContactSignals document (stdin when omitted).
    Score { file: Option<PathBuf> },
}

fn scope_for(tenant: Option<&str>) -> Scope {
    match tenant {
        Some(t) => Scope::tenant(t),
        None => Scope::Installation,
    }
}

fn open_db(config: &ReachClawConfig) -> Result<Arc<FleetDb>> {
    let path = config.database.resolved_path();
    let db = FleetDb::open(
        &path,
        Duration::from_millis(config.database.busy_timeout_ms),
        config.tenancy.single_tenant,
    )
    .with_context(|| format!("opening database {}", path.display()))?;
    Ok(Arc::new(db))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => ReachClawConfig::load_from(&PathBuf::from(shellexpand::tilde(path).as_ref()))?,
        None => ReachClawConfig::load()?,
    };

    match cli.command {
        Commands::Serve { dry_run } => serve(config, dry_run).await,
        Commands::Status { tenant } => status(&config, tenant.as_deref()),
        Commands::Enqueue {
            tenant,
            account,
            target,
            text,
            priority,
        } => {
            let priority: Priority = priority.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
            let queue = DispatchQueue::new(open_db(&config)?, &config);
            let scope = Scope::tenant(tenant.as_str());
            let account = AccountId::new(account);
            // The account must belong to the tenant.
            queue.db().get_account(&scope, &account)?;
            let msg = NewMessage::text(TenantId::new(tenant), account, target, text).with_priority(priority);
            let queued = queue.enqueue(msg)?;
            println!("📥 Queued message {} ({})", queued.id, queued.priority.as_str());
            Ok(())
        }
        Commands::Cancel { tenant, id } => {
            let queue = DispatchQueue::new(open_db(&config)?, &config);
            let msg = queue.cancel(&Scope::tenant(tenant), id)?;
            println!("Message {} is {}", msg.id, msg.state.as_str());
            Ok(())
        }
        Commands::Plan => {
            let db = open_db(&config)?;
            let scheduler = ConnectionScheduler::new(&config.connect);
            let ids: Vec<AccountId> = db.dispatch_accounts()?.into_iter().map(|a| a.id).collect();
            println!("{:<24} {:>5} {:>10}", "ACCOUNT", "HOUR", "DELAY");
            for row in scheduler.plan(&ids) {
                let d = row.delay_secs;
                println!(
                    "{:<24} {:>5} {:>4}h{:02}m{:02}s",
                    row.account_id.as_str(),
                    row.hour,
                    d / 3600,
                    (d % 3600) / 60,
                    d % 60
                );
            }
            Ok(())
        }
        Commands::Match { tenant, text } => {
            let db = open_db(&config)?;
            let index = KeywordIndex::new(config.keywords.match_cache_capacity);
            let report = index.reload(&db)?;
            for skipped in &report.skipped {
                eprintln!("⚠️  Skipped {}/{}: {}", skipped.set_name, skipped.pattern, skipped.reason);
            }
            let matches = index.matches_for(&TenantId::new(tenant), &text);
            println!("{}", serde_json::to_string_pretty(&matches)?);
            Ok(())
        }
        Commands::Score { file } => {
            let raw = match file {
                Some(path) => std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
                None => std::io::read_to_string(std::io::stdin())?,
            };
            let signals: ContactSignals = serde_json::from_str(&raw).context("parsing ContactSignals JSON")?;
            let score = LeadScorer::new().score(&signals);
            println!("{}", serde_json::to_string_pretty(&score)?);
            Ok(())
        }
    }
}

fn status(config: &ReachClawConfig, tenant: Option<&str>) -> Result<()> {
    let db = open_db(config)?;
    let scope = scope_for(tenant);
    let counts = db.count_by_state(&scope)?;
    let accounts = db.list_accounts(&scope)?;

    println!("📊 Queue");
    println!(
        "   pending {}  sending {}  retrying {}  sent {}  failed {}  expired {}",
        counts.pending, counts.sending, counts.retrying, counts.sent, counts.failed, counts.expired
    );
    println!("👥 Accounts ({})", accounts.len());
    for a in &accounts {
        let detail = match (&a.status_reason, a.rate_limited_until) {
            (_, Some(until)) if until > Utc::now() => format!("until {}", until.format("%Y-%m-%d %H:%M")),
            (Some(reason), _) => reason.clone(),
            _ if a.is_warming_up() => format!("stage {} day {}", a.warmup_stage, a.warmup_day),
            _ => String::new(),
        };
        println!("   {:<20} {:<9} {:<13} {}", a.id.as_str(), a.role.as_str(), a.status.as_str(), detail);
    }
    let alerts = db.recent_alerts(&scope, 5)?;
    if !alerts.is_empty() {
        println!("🔔 Recent alerts");
        for alert in alerts {
            println!("   {} [{}] {}", alert.fired_at.format("%m-%d %H:%M"), alert.rule_id, alert.message);
        }
    }
    Ok(())
}

/// Predicates available to `custom` rules.
fn builtin_checks() -> CheckRegistry {
    let mut registry = CheckRegistry::new();
    registry.register("fleet_down", |ctx| {
        let usable = ctx.metrics.get("accounts.active").copied().unwrap_or(0.0)
            + ctx.metrics.get("accounts.warming_up").copied().unwrap_or(0.0);
        Ok(usable == 0.0)
    });
    registry.register("failures_outpace_sends", |ctx| {
        let failed = ctx.metrics.get("queue.failed_1h").copied().unwrap_or(0.0);
        let sent = ctx.metrics.get("queue.sent_1h").copied().unwrap_or(0.0);
        Ok(failed > 0.0 && failed > sent)
    });
    registry
}

async fn serve(config: ReachClawConfig, dry_run: bool) -> Result<()> {
    let platform: Arc<dyn ChatPlatform> = if dry_run {
        Arc::new(DryRunPlatform::new())
    } else {
        match &config.bridge {
            Some(bridge) => Arc::new(HttpBridgePlatform::new(bridge)),
            None => anyhow::bail!("no [bridge] section in config; run with --dry-run to rehearse"),
        }
    };

    let db = open_db(&config)?;
    let queue = Arc::new(DispatchQueue::new(db.clone(), &config));

    let index = Arc::new(KeywordIndex::new(config.keywords.match_cache_capacity));
    let report = index.reload(&db)?;
    tracing::info!(
        "🔎 Keyword index: {} sets, {} literals, {} regexes, {} skipped",
        report.sets,
        report.literals,
        report.regexes,
        report.skipped.len()
    );

    let tally = Arc::new(KeywordHitTally::new());
    let history = Arc::new(AlertHistory::new(config.alerts.alert_history_capacity));
    let engine = Arc::new(
        AlertEngine::new(builtin_checks(), queue.clone(), tally.clone(), history)
            .with_default_cooldown(config.alerts.default_cooldown_secs),
    );
    let rules = engine.reload(&db)?;
    tracing::info!("🔔 {rules} trigger rules loaded");

    let cancel = CancellationToken::new();
    let alerts = spawn_alert_loop(
        engine.clone(),
        sinks_from_config(&config.notify, db.clone()),
        Duration::from_secs(config.alerts.evaluation_interval_secs.max(1)),
        Duration::from_secs(config.alerts.notify_timeout_secs),
        cancel.clone(),
    );

    let reload = {
        let (db, index, engine, cancel) = (db.clone(), index.clone(), engine.clone(), cancel.clone());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RELOAD_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = index.reload(&db) {
                            tracing::warn!("Keyword index reload failed: {e}");
                        }
                        if let Err(e) = engine.reload(&db) {
                            tracing::warn!("Rule reload failed: {e}");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    };

    let inbound = Arc::new(InboundPipeline::new(index, tally, LeadScorer::new(), queue.clone()));
    let dispatcher = Arc::new(Dispatcher::new(&config, queue, platform, inbound));
    let running = tokio::spawn(dispatcher.run(cancel.clone()));

    println!("📣 ReachClaw serving{} — Ctrl-C to stop", if dry_run { " (dry run)" } else { "" });
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    cancel.cancel();

    for (name, handle) in [("dispatcher", running), ("alerts", alerts), ("reload", reload)] {
        if let Err(e) = handle.await {
            tracing::error!("{name} task ended abnormally: {e}");
        }
    }
    Ok(())
}
