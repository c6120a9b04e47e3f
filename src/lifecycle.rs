// ===============================
// src/lifecycle.rs
// ===============================
//
// Handlers for one firing of a bond event. Each handler:
// - re-reads the holding and fetches a fresh quote (never a cached one),
// - skips if (isin, kind, date) was already committed,
// - notifies, then commits ledger + holding changes in one store transaction,
// - returns follow-ups for the scheduler actor (it alone touches the job store).
//
// Notification happens before the commit: a crash in between means the admin
// may be told twice, but the money moves at most once.
//
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::{
    Event, EventKind, Holding, HoldingPatch, Quote, BOND_REDEMPTION, COUPON_PAYMENT, PART_REDEMPTION,
};
use crate::error::FireError;
use crate::feed::MarketFeed;
use crate::ledger::Ledger;
use crate::metrics::{EVENTS_FIRED, EVENTS_SKIPPED};
use crate::notify::Notifier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    Schedule { isin: String, kind: EventKind, date: NaiveDate },
    /// Security is gone: drop every remaining job for it.
    Retire { isin: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fired {
    Committed(i64),
    Duplicate,
    NoChange,
    NotHeld,
    Rescheduled,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub fired: Fired,
    pub follow_ups: Vec<FollowUp>,
}

impl Outcome {
    fn skip(kind: EventKind, fired: Fired, reason: &str) -> Self {
        EVENTS_SKIPPED.with_label_values(&[kind.as_str(), reason]).inc();
        Self { fired, follow_ups: Vec::new() }
    }
}

pub struct Lifecycle {
    ledger: Ledger,
    feed: Arc<dyn MarketFeed>,
    notifier: Arc<dyn Notifier>,
    partial_delay_days: u64,
    journal: Option<mpsc::Sender<Event>>,
}

impl Lifecycle {
    pub fn new(
        ledger: Ledger,
        feed: Arc<dyn MarketFeed>,
        notifier: Arc<dyn Notifier>,
        partial_delay_days: u64,
    ) -> Self {
        Self { ledger, feed, notifier, partial_delay_days, journal: None }
    }

    pub fn with_journal(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.journal = Some(tx);
        self
    }

    pub async fn fire(&self, isin: &str, kind: EventKind, date: NaiveDate) -> Result<Outcome, FireError> {
        let Some(holding) = self.ledger.get_holding(isin).await? else {
            info!(%isin, ?kind, "security no longer held");
            let mut out = Outcome::skip(kind, Fired::NotHeld, "not_held");
            out.follow_ups.push(FollowUp::Retire { isin: isin.to_string() });
            return Ok(out);
        };

        if self.ledger.event_fired(isin, kind, date).await? {
            info!(%isin, ?kind, %date, "already committed, skipping");
            return Ok(Outcome::skip(kind, Fired::Duplicate, "duplicate"));
        }

        let quote = self.feed.fetch_quote(isin, holding.quantity).await?;
        let out = match kind {
            EventKind::Coupon => self.coupon(&holding, quote, date).await?,
            EventKind::PartialRedemption => self.partial_redemption(&holding, quote, date).await?,
            EventKind::FullRedemption => self.full_redemption(&holding, quote, date).await?,
        };
        if let Fired::Committed(amount) = out.fired {
            EVENTS_FIRED.with_label_values(&[kind.as_str()]).inc();
            self.record(Event::Fired { isin: isin.to_string(), kind, date, amount });
        }
        Ok(out)
    }

    async fn coupon(&self, h: &Holding, quote: Option<Quote>, date: NaiveDate) -> Result<Outcome, FireError> {
        let Some(q) = quote else {
            warn!(isin = %h.isin, "coupon due but security not quoted");
            return Ok(Outcome::skip(EventKind::Coupon, Fired::NoChange, "not_quoted"));
        };

        self.notifier
            .notify(&format!(
                "💡 Coupon paid <i>{}₽</i> on <i>{}</i> <i>({} pcs)</i>",
                rub(q.coupon),
                q.title,
                h.quantity
            ))
            .await;
        if !self.ledger.post_event(&h.isin, EventKind::Coupon, date, q.coupon, COUPON_PAYMENT).await? {
            return Ok(Outcome::skip(EventKind::Coupon, Fired::Duplicate, "duplicate"));
        }
        info!(isin = %h.isin, amount = q.coupon, %date, "coupon posted");

        let check = date.checked_add_days(Days::new(self.partial_delay_days)).unwrap_or(date);
        Ok(Outcome {
            fired: Fired::Committed(q.coupon),
            follow_ups: vec![FollowUp::Schedule {
                isin: h.isin.clone(),
                kind: EventKind::PartialRedemption,
                date: check,
            }],
        })
    }

    async fn partial_redemption(
        &self,
        h: &Holding,
        quote: Option<Quote>,
        date: NaiveDate,
    ) -> Result<Outcome, FireError> {
        let Some(q) = quote else {
            warn!(isin = %h.isin, "partial redemption check but security not quoted");
            return Ok(Outcome::skip(EventKind::PartialRedemption, Fired::NoChange, "not_quoted"));
        };
        // the coupon cycle continues from the fresh quote
        let next = next_coupon(&q, date);
        let diff = h.face_value - q.unit_face_value;

        if diff == 0 {
            let mut out = Outcome::skip(EventKind::PartialRedemption, Fired::NoChange, "no_change");
            out.follow_ups.extend(next);
            return Ok(out);
        }
        if diff < 0 {
            // face value never steps up; resync tracking without moving cash
            warn!(isin = %h.isin, tracked = h.face_value, quoted = q.unit_face_value, "quoted face above tracked");
            let patch = HoldingPatch {
                face_value: Some(q.unit_face_value),
                coupon: Some(q.unit_coupon),
                ..Default::default()
            };
            match self.ledger.update_holding(&h.isin, patch).await {
                Ok(true) => {}
                Ok(false) => warn!(isin = %h.isin, "resync skipped, holding vanished"),
                Err(e) => warn!(isin = %h.isin, error = %e, "resync of tracked face failed"),
            }
            let mut out = Outcome::skip(EventKind::PartialRedemption, Fired::NoChange, "face_up");
            out.follow_ups.extend(next);
            return Ok(out);
        }

        let amount = diff * h.quantity;
        self.notifier
            .notify(&format!(
                "💡 Partial redemption <i>{}₽</i> on <i>{}</i> <i>({} pcs)</i>",
                rub(amount),
                q.title,
                h.quantity
            ))
            .await;
        let fresh = self
            .ledger
            .amortize(&h.isin, date, amount, PART_REDEMPTION, q.unit_face_value, q.unit_coupon)
            .await?;
        if !fresh {
            return Ok(Outcome::skip(EventKind::PartialRedemption, Fired::Duplicate, "duplicate"));
        }
        info!(isin = %h.isin, amount, face = q.unit_face_value, "partial redemption posted");
        Ok(Outcome { fired: Fired::Committed(amount), follow_ups: next.into_iter().collect() })
    }

    async fn full_redemption(
        &self,
        h: &Holding,
        quote: Option<Quote>,
        date: NaiveDate,
    ) -> Result<Outcome, FireError> {
        let (title, principal, coupon) = match &quote {
            Some(q) if q.redemption_date > date => {
                info!(isin = %h.isin, from = %date, to = %q.redemption_date, "redemption date moved");
                self.record(Event::Rescheduled {
                    isin: h.isin.clone(),
                    kind: EventKind::FullRedemption,
                    date: q.redemption_date,
                });
                return Ok(Outcome {
                    fired: Fired::Rescheduled,
                    follow_ups: vec![FollowUp::Schedule {
                        isin: h.isin.clone(),
                        kind: EventKind::FullRedemption,
                        date: q.redemption_date,
                    }],
                });
            }
            Some(q) => (q.title.clone(), q.price, q.coupon),
            // delisted at maturity: fall back to tracked terms
            None => (h.isin.clone(), h.face_value * h.quantity, h.coupon * h.quantity),
        };

        self.notifier
            .notify(&format!(
                "💡 Full redemption <i>{}₽</i> on <i>{}</i> <i>({} pcs)</i>",
                rub(principal),
                title,
                h.quantity
            ))
            .await;
        self.notifier
            .notify(&format!(
                "💡 Coupon paid <i>{}₽</i> on <i>{}</i> <i>({} pcs)</i>",
                rub(coupon),
                title,
                h.quantity
            ))
            .await;

        let amount = principal + coupon;
        if !self.ledger.redeem(&h.isin, date, amount, BOND_REDEMPTION).await? {
            return Ok(Outcome::skip(EventKind::FullRedemption, Fired::Duplicate, "duplicate"));
        }
        info!(isin = %h.isin, amount, "bond redeemed");
        Ok(Outcome {
            fired: Fired::Committed(amount),
            follow_ups: vec![FollowUp::Retire { isin: h.isin.clone() }],
        })
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.journal {
            let _ = tx.try_send(ev);
        }
    }
}

/// Next coupon strictly after `after`, if it falls before redemption.
pub fn next_coupon(q: &Quote, after: NaiveDate) -> Option<FollowUp> {
    let date = q.coupon_date.filter(|d| *d > after && *d < q.redemption_date)?;
    Some(FollowUp::Schedule { isin: q.isin.clone(), kind: EventKind::Coupon, date })
}

/// Minor units as "1234.56".
pub fn rub(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    format!("{}{}.{:02}", sign, minor.abs() / 100, minor.abs() % 100)
}
