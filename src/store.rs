// ===============================
// src/store.rs
// ===============================
//
// SQLite persistence for holdings, the append-only ledger, fired-event marks
// and the durable job table. Every multi-row mutation runs in one IMMEDIATE
// transaction, so a balance check and its debit cannot interleave with
// another writer.
//
// Methods here are raw: callers go through `Ledger` / `JobStore`, which add
// the retry policy.
//
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::domain::{EventKind, Holding, HoldingPatch, LedgerEntry, Purchase, PART_REDEMPTION, PURCHASE};
use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS holdings (
    isin        TEXT PRIMARY KEY,
    quantity    INTEGER NOT NULL CHECK (quantity >= 0),
    face_value  INTEGER NOT NULL,
    coupon      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    amount      INTEGER NOT NULL,
    description TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_description ON ledger(description);

CREATE TABLE IF NOT EXISTS fired_events (
    isin        TEXT NOT NULL,
    kind        TEXT NOT NULL,
    event_date  TEXT NOT NULL,
    ledger_id   INTEGER,
    PRIMARY KEY (isin, kind, event_date)
);

CREATE TABLE IF NOT EXISTS scheduled_jobs (
    job_key     TEXT PRIMARY KEY,
    action      TEXT NOT NULL,
    trigger     TEXT NOT NULL,
    fire_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_fire_at ON scheduled_jobs(fire_at);
"#;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.init_schema()?;
        info!(path = ?path.as_ref(), "store opened");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.init_schema()?;
        debug!("in-memory store created");
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|c| Ok(c.execute_batch(SCHEMA)?))
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut conn)
    }

    fn in_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.with_conn(|c| {
            let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    // ---- ledger ----

    pub fn create_entry(&self, amount: i64, description: &str) -> Result<i64, StoreError> {
        self.in_tx(|tx| append(tx, amount, description))
    }

    pub fn balance(&self, description: Option<&str>) -> Result<i64, StoreError> {
        self.with_conn(|c| {
            let sum = match description {
                Some(d) => c.query_row(
                    "SELECT COALESCE(SUM(amount), 0) FROM ledger WHERE description = ?1",
                    params![d],
                    |r| r.get(0),
                )?,
                None => c.query_row("SELECT COALESCE(SUM(amount), 0) FROM ledger", [], |r| r.get(0))?,
            };
            Ok(sum)
        })
    }

    pub fn entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        self.with_conn(|c| {
            let mut stmt =
                c.prepare("SELECT id, amount, description, created_at FROM ledger ORDER BY id")?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, String>(2)?, r.get::<_, String>(3)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, amount, description, ts) = row?;
                let created_at = DateTime::parse_from_rfc3339(&ts)
                    .map_err(|e| StoreError::Corrupt(format!("ledger {id}: {e}")))?
                    .with_timezone(&Utc);
                out.push(LedgerEntry { id, amount, description, created_at });
            }
            Ok(out)
        })
    }

    /// Appends a deposit (or withdrawal) unless it would drive the balance negative.
    pub fn deposit(&self, amount: i64, description: &str) -> Result<Option<i64>, StoreError> {
        self.in_tx(|tx| {
            if total(tx)? + amount < 0 {
                return Ok(None);
            }
            append(tx, amount, description).map(Some)
        })
    }

    // ---- holdings ----

    pub fn holding(&self, isin: &str) -> Result<Option<Holding>, StoreError> {
        self.with_conn(|c| {
            Ok(c.query_row(
                "SELECT isin, quantity, face_value, coupon FROM holdings WHERE isin = ?1",
                params![isin],
                row_to_holding,
            )
            .optional()?)
        })
    }

    pub fn holdings(&self, isin: Option<&str>) -> Result<Vec<Holding>, StoreError> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT isin, quantity, face_value, coupon FROM holdings
                 WHERE ?1 IS NULL OR isin = ?1 ORDER BY isin",
            )?;
            let rows = stmt.query_map(params![isin], row_to_holding)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn insert_holding(&self, h: &Holding) -> Result<(), StoreError> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO holdings (isin, quantity, face_value, coupon) VALUES (?1, ?2, ?3, ?4)",
                params![h.isin, h.quantity, h.face_value, h.coupon],
            )?;
            Ok(())
        })
    }

    pub fn update_holding(&self, isin: &str, patch: &HoldingPatch) -> Result<bool, StoreError> {
        self.in_tx(|tx| patch_holding(tx, isin, patch))
    }

    pub fn delete_holding(&self, isin: &str) -> Result<bool, StoreError> {
        self.with_conn(|c| Ok(c.execute("DELETE FROM holdings WHERE isin = ?1", params![isin])? > 0))
    }

    /// The only purchase path: checks the cash balance and debits it in the
    /// same transaction as the holding upsert.
    ///
    /// Topping up a position whose quoted face value already stepped below the
    /// tracked one first credits that step-down for the units held before, then
    /// tracks the new per-unit terms for the whole position.
    pub fn create_or_accumulate(
        &self,
        isin: &str,
        quantity: i64,
        price: i64,
        face_value: i64,
        coupon: i64,
    ) -> Result<Purchase, StoreError> {
        self.in_tx(|tx| {
            if total(tx)? < price {
                return Ok(Purchase::InsufficientFunds);
            }
            append(tx, -price, PURCHASE)?;
            let existing: Option<(i64, i64)> = tx
                .query_row("SELECT quantity, face_value FROM holdings WHERE isin = ?1", params![isin], |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })
                .optional()?;
            match existing {
                Some((held, tracked_face)) => {
                    if tracked_face > face_value {
                        let amount = (tracked_face - face_value) * held;
                        append(tx, amount, PART_REDEMPTION)?;
                        info!(%isin, held, amount, face = face_value, "pending step-down settled on top-up");
                    }
                    tx.execute(
                        "UPDATE holdings SET quantity = ?2, face_value = ?3, coupon = ?4 WHERE isin = ?1",
                        params![isin, held + quantity, face_value, coupon],
                    )?;
                    Ok(Purchase::Added)
                }
                None => {
                    tx.execute(
                        "INSERT INTO holdings (isin, quantity, face_value, coupon) VALUES (?1, ?2, ?3, ?4)",
                        params![isin, quantity, face_value, coupon],
                    )?;
                    Ok(Purchase::Opened)
                }
            }
        })
    }

    // ---- lifecycle events (idempotent per isin/kind/date) ----

    pub fn event_fired(&self, isin: &str, kind: EventKind, date: NaiveDate) -> Result<bool, StoreError> {
        self.with_conn(|c| {
            let n: i64 = c.query_row(
                "SELECT COUNT(*) FROM fired_events WHERE isin = ?1 AND kind = ?2 AND event_date = ?3",
                params![isin, kind.as_str(), date.to_string()],
                |r| r.get(0),
            )?;
            Ok(n > 0)
        })
    }

    /// Marks the event and posts its ledger entry. `false` if it was already marked.
    pub fn post_event(
        &self,
        isin: &str,
        kind: EventKind,
        date: NaiveDate,
        amount: i64,
        description: &str,
    ) -> Result<bool, StoreError> {
        self.in_tx(|tx| {
            if !mark(tx, isin, kind, date)? {
                return Ok(false);
            }
            let id = append(tx, amount, description)?;
            link(tx, isin, kind, date, id)?;
            Ok(true)
        })
    }

    /// Partial redemption: mark + ledger entry + new tracked face/coupon, atomically.
    pub fn amortize(
        &self,
        isin: &str,
        date: NaiveDate,
        amount: i64,
        description: &str,
        face_value: i64,
        coupon: i64,
    ) -> Result<bool, StoreError> {
        self.in_tx(|tx| {
            let kind = EventKind::PartialRedemption;
            if !mark(tx, isin, kind, date)? {
                return Ok(false);
            }
            let id = append(tx, amount, description)?;
            link(tx, isin, kind, date, id)?;
            let patch = HoldingPatch { face_value: Some(face_value), coupon: Some(coupon), ..Default::default() };
            patch_holding(tx, isin, &patch)?;
            Ok(true)
        })
    }

    /// Full redemption: mark + ledger entry + holding removal, atomically.
    pub fn redeem(&self, isin: &str, date: NaiveDate, amount: i64, description: &str) -> Result<bool, StoreError> {
        self.in_tx(|tx| {
            let kind = EventKind::FullRedemption;
            if !mark(tx, isin, kind, date)? {
                return Ok(false);
            }
            let id = append(tx, amount, description)?;
            link(tx, isin, kind, date, id)?;
            tx.execute("DELETE FROM holdings WHERE isin = ?1", params![isin])?;
            Ok(true)
        })
    }
}

fn row_to_holding(r: &rusqlite::Row<'_>) -> rusqlite::Result<Holding> {
    Ok(Holding { isin: r.get(0)?, quantity: r.get(1)?, face_value: r.get(2)?, coupon: r.get(3)? })
}

fn total(tx: &Transaction<'_>) -> Result<i64, StoreError> {
    Ok(tx.query_row("SELECT COALESCE(SUM(amount), 0) FROM ledger", [], |r| r.get(0))?)
}

fn append(tx: &Transaction<'_>, amount: i64, description: &str) -> Result<i64, StoreError> {
    tx.execute(
        "INSERT INTO ledger (amount, description, created_at) VALUES (?1, ?2, ?3)",
        params![amount, description, Utc::now().to_rfc3339()],
    )?;
    Ok(tx.last_insert_rowid())
}

fn mark(tx: &Transaction<'_>, isin: &str, kind: EventKind, date: NaiveDate) -> Result<bool, StoreError> {
    let n = tx.execute(
        "INSERT OR IGNORE INTO fired_events (isin, kind, event_date) VALUES (?1, ?2, ?3)",
        params![isin, kind.as_str(), date.to_string()],
    )?;
    Ok(n > 0)
}

fn link(tx: &Transaction<'_>, isin: &str, kind: EventKind, date: NaiveDate, ledger_id: i64) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE fired_events SET ledger_id = ?4 WHERE isin = ?1 AND kind = ?2 AND event_date = ?3",
        params![isin, kind.as_str(), date.to_string(), ledger_id],
    )?;
    Ok(())
}

fn patch_holding(tx: &Transaction<'_>, isin: &str, patch: &HoldingPatch) -> Result<bool, StoreError> {
    let n = tx.execute(
        "UPDATE holdings SET
            quantity   = COALESCE(?2, quantity),
            face_value = COALESCE(?3, face_value),
            coupon     = COALESCE(?4, coupon)
         WHERE isin = ?1",
        params![isin, patch.quantity, patch.face_value, patch.coupon],
    )?;
    Ok(n > 0)
}
