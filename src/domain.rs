// ===============================
// src/domain.rs
// ===============================
//
// Amounts are integer minor currency units (kopecks) everywhere.
//
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Ledger category used for cash deposits (tracked separately for performance).
pub const DEPOSIT: &str = "deposit";
pub const PURCHASE: &str = "bond purchase";
pub const COUPON_PAYMENT: &str = "coupon payment";
pub const PART_REDEMPTION: &str = "part redemption";
pub const BOND_REDEMPTION: &str = "bond redemption";

/// One row per held security. `face_value` and `coupon` are tracked per unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub isin: String,
    pub quantity: i64,
    pub face_value: i64,
    pub coupon: i64,
}

/// Partial update for a holding row; `None` fields stay untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoldingPatch {
    pub quantity: Option<i64>,
    pub face_value: Option<i64>,
    pub coupon: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub amount: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Fresh snapshot of a security's terms, scaled to the held quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub isin: String,
    pub title: String,
    pub quantity: i64,
    pub coupon_date: Option<NaiveDate>,
    pub redemption_date: NaiveDate,
    /// Next coupon for the held quantity.
    pub coupon: i64,
    /// Face value for the held quantity.
    pub face_value: i64,
    /// Mark-to-market price (incl. accrued interest) for the held quantity.
    pub price: i64,
    pub unit_face_value: i64,
    pub unit_coupon: i64,
}

/// Outcome of the transactional purchase path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purchase {
    /// New holding row was created.
    Opened,
    /// Quantity was added to an existing holding.
    Added,
    InsufficientFunds,
}

impl Purchase {
    pub fn succeeded(&self) -> bool {
        !matches!(self, Purchase::InsufficientFunds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Coupon,
    PartialRedemption,
    FullRedemption,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Coupon => "coupon",
            EventKind::PartialRedemption => "partial_redemption",
            EventKind::FullRedemption => "full_redemption",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "coupon" => Some(EventKind::Coupon),
            "partial_redemption" => Some(EventKind::PartialRedemption),
            "full_redemption" => Some(EventKind::FullRedemption),
            _ => None,
        }
    }
}

/// When a job fires: once a day by cron expression, or once at a timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Recurring { cron: String },
    OneShot { at: DateTime<Utc> },
}

/// What a job does when it fires. The kind is stored with the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobAction {
    Bond { isin: String, kind: EventKind },
    Reconcile,
}

impl JobAction {
    /// Storage key; at most one job per key exists.
    pub fn key(&self) -> String {
        match self {
            JobAction::Bond { isin, kind } => format!("{}:{}", isin, kind.as_str()),
            JobAction::Reconcile => "reconcile".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub action: JobAction,
    pub trigger: Trigger,
    pub fire_at: DateTime<Utc>,
}

/// Read-only projection of an outstanding bond event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub isin: String,
    pub kind: EventKind,
    pub fire_at: DateTime<Utc>,
}

/// Externally ranked purchase candidate. `price` is per unit, `yield_bp` in basis points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub isin: String,
    pub price: i64,
    pub yield_bp: i64,
    #[serde(default)]
    pub held: i64,
}

// Journal events (see recorder.rs). `Note` carries every admin message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Fired { isin: String, kind: EventKind, date: NaiveDate, amount: i64 },
    Rescheduled { isin: String, kind: EventKind, date: NaiveDate },
    Ledger { amount: i64, description: String },
    Note(String),
}
