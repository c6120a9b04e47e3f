// ===============================
// src/main.rs
// ===============================
/*
 # run the scheduler (default command)
 cargo run --release -- serve

 # one-shot operations against the same database
 cargo run -- deposit 50000
 cargo run -- buy RU000A0JX0J2 10
 cargo run -- tasks

 # lifecycle activity
 curl -s localhost:9898/metrics | egrep '^(events_fired_total|ledger_entries_total|scheduled_jobs)'
*/
/*
=============================================================================
Project : bond_bot_rust — bond portfolio ledger & lifecycle scheduler
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Tracks bond holdings and a cash ledger, fires coupon / partial /
          full redemption events from a durable job store, quotes MOEX ISS,
          recommends purchases, notifies admins, exposes Prometheus metrics,
          and records JSONL events.
=============================================================================
*/
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, timeout, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bond_bot_rust::{
    config::{self, Args, Limits},
    domain::Event,
    feed::{MarketFeed, MoexFeed},
    jobs::JobStore,
    ledger::Ledger,
    lifecycle::{rub, Lifecycle},
    metrics,
    notify::{Journaled, LogNotifier, Notifier, TelegramNotifier},
    portfolio::{DepositOutcome, Portfolio, PurchaseOutcome},
    recommend::DohodSource,
    recorder,
    retry::Retry,
    scheduler::{self, SchedulerHandle},
    store::Store,
};

#[derive(Parser, Debug)]
#[command(name = "bond_bot_rust", version, about = "Bond portfolio ledger & lifecycle scheduler")]
struct Cli {
    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the scheduler until interrupted
    Serve,
    /// Buy `qty` units of a security at the current market price
    Buy { isin: String, qty: i64 },
    /// Deposit (or, negative, withdraw) cash, in rubles
    Deposit {
        #[arg(allow_hyphen_values = true)]
        amount: String,
    },
    /// Holdings with fresh quotes
    Holdings,
    /// Outstanding coupon / redemption events
    Tasks,
    /// Suggested purchases for a budget in rubles (defaults to the cash balance)
    Recommend { budget: Option<String> },
    /// Cash balance and performance
    Balance,
}

struct App {
    portfolio: Portfolio,
    scheduler: SchedulerHandle,
}

/// "1234.56" rubles -> minor units.
fn parse_rub(s: &str) -> Result<i64> {
    let v: f64 = s.trim().replace(',', ".").parse().with_context(|| format!("bad amount {s:?}"))?;
    if !v.is_finite() {
        bail!("bad amount {s:?}");
    }
    Ok((v * 100.0).round() as i64)
}

fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn build(
    args: &Args,
    limits: Limits,
    rec_tx: Option<mpsc::Sender<Event>>,
) -> Result<(App, JoinHandle<()>)> {
    let store = Store::open(&args.database_path)
        .with_context(|| format!("open database {}", args.database_path.display()))?;

    let mut notifier: Arc<dyn Notifier> = match &args.telegram_token {
        Some(token) if !args.admin_ids.is_empty() => Arc::new(TelegramNotifier::new(
            args.telegram_api_url.clone(),
            token.clone(),
            args.admin_ids.clone(),
        )),
        Some(_) => {
            warn!("TELEGRAM_BOT_TOKEN set but ADMIN_IDS empty; notifications go to the log");
            Arc::new(LogNotifier)
        }
        None => Arc::new(LogNotifier),
    };
    if let Some(tx) = &rec_tx {
        notifier = Arc::new(Journaled::new(notifier, tx.clone()));
    }

    let retry = Retry::new(args.store_retries, args.store_retry_delay, notifier.clone());
    let ledger = Ledger::new(store.clone(), retry.clone());
    let jobs = JobStore::new(store, retry);
    let feed: Arc<dyn MarketFeed> =
        Arc::new(MoexFeed::new(args.moex_url.clone(), args.feed_retries, args.feed_retry_delay));

    let mut lifecycle = Lifecycle::new(ledger.clone(), feed.clone(), notifier, args.partial_delay_days);
    if let Some(tx) = &rec_tx {
        lifecycle = lifecycle.with_journal(tx.clone());
    }
    let (handle, task) = scheduler::spawn(jobs, ledger.clone(), feed.clone(), Arc::new(lifecycle), args.schedule());

    let candidates = Arc::new(DohodSource::new(args.dohod_url.clone()));
    let mut portfolio =
        Portfolio::new(ledger, feed, candidates, handle.clone(), limits, args.candidates_top_n);
    if let Some(tx) = rec_tx {
        portfolio = portfolio.with_journal(tx);
    }
    Ok((App { portfolio, scheduler: handle }, task))
}

async fn serve(app: &App) -> Result<()> {
    match app.scheduler.start().await {
        Some(n) => info!(securities = n, "schedule derived"),
        None => error!("initial schedule incomplete; daily reconcile will retry"),
    }

    let mut beats: u64 = 0;
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
            _ = sleep(Duration::from_secs(60)) => {
                beats += 1;
                let tasks = app.scheduler.list_scheduled_tasks().await;
                let next = tasks.first().map(|t| format!("{} {} @ {}", t.isin, t.kind.as_str(), t.fire_at));
                info!(beats, outstanding = tasks.len(), next = ?next, "heartbeat");
            }
        }
    }
}

async fn run_cmd(app: &App, cmd: Cmd) -> Result<()> {
    let p = &app.portfolio;
    match cmd {
        Cmd::Serve => serve(app).await,
        Cmd::Buy { isin, qty } => match p.record_purchase(&isin, qty).await {
            PurchaseOutcome::Bought { isin, quantity, price, .. } => {
                println!("bought {quantity} x {isin} for {}", rub(price));
                Ok(())
            }
            PurchaseOutcome::Rejected(r) => bail!("purchase rejected: {r}"),
        },
        Cmd::Deposit { amount } => match p.deposit_cash(parse_rub(&amount)?).await {
            DepositOutcome::Accepted { balance, .. } => {
                println!("balance {}", rub(balance));
                Ok(())
            }
            DepositOutcome::Rejected(r) => bail!("deposit rejected: {r}"),
        },
        Cmd::Holdings => print_json(&p.list_holdings_view().await?),
        Cmd::Tasks => print_json(&p.list_scheduled_tasks_view().await),
        Cmd::Recommend { budget } => {
            let budget = match budget {
                Some(b) => parse_rub(&b)?,
                None => p.performance().await?.balance,
            };
            print_json(&p.get_recommendations_view(budget).await?)
        }
        Cmd::Balance => print_json(&p.performance().await?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config ----
    let cli = Cli::parse();
    let cmd = cli.cmd.unwrap_or(Cmd::Serve);
    let (args, limits) = config::load();

    // ---- Metrics (serve only) ----
    metrics::init();
    if matches!(cmd, Cmd::Serve) {
        metrics::serve_metrics(args.metrics_port);
        info!(
            db = %args.database_path.display(),
            moex = %args.moex_url,
            admins = args.admin_ids.len(),
            telegram = args.telegram_token.is_some(),
            fire_hour = args.fire_hour,
            reconcile = %args.reconcile_cron,
            "startup config"
        );
    }

    // ---- Recorder (optional) ----
    let (rec_tx, rec_task) = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(1024);
            (Some(tx), Some(tokio::spawn(recorder::run(rx, path))))
        }
        None => (None, None),
    };

    let (app, sched_task) = build(&args, limits, rec_tx)?;
    let result = run_cmd(&app, cmd).await;

    // dropping the app stops the scheduler actor, which closes the journal
    drop(app);
    let _ = timeout(Duration::from_secs(5), sched_task).await;
    if let Some(task) = rec_task {
        let _ = timeout(Duration::from_secs(5), task).await;
    }
    result
}
