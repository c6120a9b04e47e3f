// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : bond_bot_rust — bond portfolio ledger & lifecycle scheduler
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Tracks bond holdings and a cash ledger, fires coupon / partial /
          full redemption events from a durable job store, quotes MOEX ISS,
          recommends purchases, notifies admins, exposes Prometheus metrics,
          and records JSONL events.
=============================================================================
*/
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

use crate::scheduler::ScheduleCfg;

pub const DEFAULT_DOHOD_URL: &str =
    "https://www.dohod.ru/assets/components/dohodbonds/connectorweb.php?action=info";

#[derive(Clone, Debug)]
pub struct Args {
    // storage
    pub database_path: PathBuf,

    // notifications
    pub telegram_token: Option<String>,
    pub telegram_api_url: String,
    pub admin_ids: Vec<i64>,

    // upstreams
    pub moex_url: String,
    pub dohod_url: String,
    pub candidates_top_n: usize,

    // retry policies
    pub feed_retries: u32,
    pub feed_retry_delay: Duration,
    pub store_retries: u32,
    pub store_retry_delay: Duration,

    // scheduling
    pub fire_hour: u32,
    pub partial_delay_days: u64,
    pub reconcile_cron: String,
    pub poll: Duration,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

impl Args {
    pub fn schedule(&self) -> ScheduleCfg {
        ScheduleCfg { fire_hour: self.fire_hour, reconcile_cron: self.reconcile_cron.clone(), poll: self.poll }
    }
}

#[derive(Clone, Debug)]
pub struct Limits {
    pub max_purchase_qty: i64,
    pub max_deposit: i64,
}

fn var_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// ADMIN_IDS=123,456 ; unparsable entries are dropped.
pub fn parse_ids(raw: &str) -> Vec<i64> {
    raw.split(',').filter_map(|x| x.trim().parse().ok()).collect()
}

pub fn load() -> (Args, Limits) {
    // .env first so every key below can come from it
    let _ = dotenv();

    let args = Args {
        database_path: PathBuf::from(non_empty("DATABASE_PATH").unwrap_or_else(|| "bonds.sqlite3".into())),

        telegram_token: non_empty("TELEGRAM_BOT_TOKEN"),
        telegram_api_url: non_empty("TELEGRAM_API_URL").unwrap_or_else(|| "https://api.telegram.org".into()),
        admin_ids: env::var("ADMIN_IDS").map(|s| parse_ids(&s)).unwrap_or_default(),

        moex_url: non_empty("MOEX_URL").unwrap_or_else(|| "https://iss.moex.com".into()),
        dohod_url: non_empty("DOHOD_URL").unwrap_or_else(|| DEFAULT_DOHOD_URL.into()),
        candidates_top_n: var_or("CANDIDATES_TOP_N", 5),

        feed_retries: var_or("FEED_RETRIES", 10),
        feed_retry_delay: Duration::from_millis(var_or("FEED_RETRY_DELAY_MS", 3_000)),
        store_retries: var_or("STORE_RETRIES", 7),
        store_retry_delay: Duration::from_millis(var_or("STORE_RETRY_DELAY_MS", 1_000)),

        fire_hour: var_or("FIRE_HOUR", 5),
        partial_delay_days: var_or("PARTIAL_DELAY_DAYS", 3),
        reconcile_cron: non_empty("RECONCILE_CRON").unwrap_or_else(|| "0 0 5 * * *".into()),
        poll: Duration::from_secs(var_or::<u64>("POLL_SECS", 30).max(1)),

        record_file: non_empty("RECORD_FILE"),
        metrics_port: var_or("METRICS_PORT", 9898),
    };

    let limits = Limits {
        max_purchase_qty: var_or("MAX_PURCHASE_QTY", 100_000),
        max_deposit: var_or("MAX_DEPOSIT", 100_000_000_000),
    };
    (args, limits)
}
