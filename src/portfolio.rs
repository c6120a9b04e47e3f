// ===============================
// src/portfolio.rs
// ===============================
//
// Entry points for the chat / dashboard / CLI layers. Every rejection is an
// outcome value with a reason; nothing here panics or leaks an error into the
// scheduler.
//
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Limits;
use crate::domain::{Event, Holding, Purchase, Quote, ScheduledTask, DEPOSIT, PURCHASE};
use crate::error::{FeedError, StoreError};
use crate::feed::MarketFeed;
use crate::ledger::Ledger;
use crate::metrics::PURCHASES_REJECTED;
use crate::recommend::{recommend, CandidateSource};
use crate::risk::{check_deposit, check_purchase, RiskError};
use crate::scheduler::SchedulerHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("{0}")]
    Invalid(#[from] RiskError),
    #[error("security not listed on any board")]
    UnknownSecurity,
    #[error("market data unavailable: {0}")]
    FeedUnavailable(String),
    #[error("insufficient funds: need {price}, have {balance}")]
    InsufficientFunds { price: i64, balance: i64 },
    #[error("withdrawal would overdraw the balance")]
    Overdraft,
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("store failure: {0}")]
    StoreFailed(String),
}

impl From<StoreError> for Rejection {
    fn from(e: StoreError) -> Self {
        if e.is_exhausted() {
            Rejection::StoreUnavailable
        } else {
            Rejection::StoreFailed(e.to_string())
        }
    }
}

impl Rejection {
    fn label(&self) -> &'static str {
        match self {
            Rejection::Invalid(_) => "invalid",
            Rejection::UnknownSecurity => "unknown_security",
            Rejection::FeedUnavailable(_) => "feed_unavailable",
            Rejection::InsufficientFunds { .. } => "insufficient_funds",
            Rejection::Overdraft => "overdraft",
            Rejection::StoreUnavailable => "store_unavailable",
            Rejection::StoreFailed(_) => "store_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseOutcome {
    Bought {
        isin: String,
        quantity: i64,
        price: i64,
        /// First purchase of this security (events were scheduled).
        opened: bool,
        /// false when a new security's events could not be scheduled; reconcile restores them.
        scheduled: bool,
    },
    Rejected(Rejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositOutcome {
    Accepted { entry_id: i64, balance: i64 },
    Rejected(Rejection),
}

#[derive(Debug, Clone, Serialize)]
pub struct HoldingView {
    pub holding: Holding,
    /// Absent when the feed was unreachable or no longer lists the security.
    pub quote: Option<Quote>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecommendationLine {
    pub isin: String,
    pub units: i64,
    pub unit_price: i64,
    pub cost: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub budget: i64,
    pub lines: Vec<RecommendationLine>,
    pub spent: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Performance {
    pub balance: i64,
    pub market_value: i64,
    pub deposits: i64,
    /// balance + market value - deposits
    pub profit: i64,
}

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("market data: {0}")]
    Feed(#[from] FeedError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

pub struct Portfolio {
    ledger: Ledger,
    feed: Arc<dyn MarketFeed>,
    candidates: Arc<dyn CandidateSource>,
    scheduler: SchedulerHandle,
    limits: Limits,
    top_n: usize,
    journal: Option<mpsc::Sender<Event>>,
}

impl Portfolio {
    pub fn new(
        ledger: Ledger,
        feed: Arc<dyn MarketFeed>,
        candidates: Arc<dyn CandidateSource>,
        scheduler: SchedulerHandle,
        limits: Limits,
        top_n: usize,
    ) -> Self {
        Self { ledger, feed, candidates, scheduler, limits, top_n, journal: None }
    }

    pub fn with_journal(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.journal = Some(tx);
        self
    }

    pub async fn record_purchase(&self, isin: &str, quantity: i64) -> PurchaseOutcome {
        match self.purchase(isin, quantity).await {
            Ok(out) => out,
            Err(r) => {
                PURCHASES_REJECTED.with_label_values(&[r.label()]).inc();
                warn!(%isin, quantity, reason = %r, "purchase rejected");
                PurchaseOutcome::Rejected(r)
            }
        }
    }

    async fn purchase(&self, isin: &str, quantity: i64) -> Result<PurchaseOutcome, Rejection> {
        let isin = check_purchase(isin, quantity, &self.limits)?;
        let quote = match self.feed.fetch_quote(&isin, quantity).await {
            Ok(Some(q)) => q,
            Ok(None) => return Err(Rejection::UnknownSecurity),
            Err(e) => return Err(Rejection::FeedUnavailable(e.to_string())),
        };

        let purchase = self
            .ledger
            .create_or_accumulate_holding(&isin, quantity, quote.price, quote.unit_face_value, quote.unit_coupon)
            .await?;

        let opened = match purchase {
            Purchase::InsufficientFunds => {
                let balance = self.ledger.get_balance(None).await?;
                return Err(Rejection::InsufficientFunds { price: quote.price, balance });
            }
            Purchase::Opened => true,
            Purchase::Added => false,
        };
        self.record(Event::Ledger { amount: -quote.price, description: PURCHASE.to_string() });

        // an existing position already has its coupon/redemption jobs
        let scheduled = !opened
            || self.scheduler.set_bond(&isin, quote.coupon_date, quote.redemption_date).await;
        if !scheduled {
            warn!(%isin, "purchase booked but events not scheduled yet");
        }
        info!(%isin, quantity, price = quote.price, opened, "purchase booked");
        Ok(PurchaseOutcome::Bought { isin, quantity, price: quote.price, opened, scheduled })
    }

    /// Positive amounts deposit, negative withdraw; never overdraws.
    pub async fn deposit_cash(&self, amount: i64) -> DepositOutcome {
        let rejected = |r: Rejection| {
            warn!(amount, reason = %r, "deposit rejected");
            DepositOutcome::Rejected(r)
        };
        if let Err(e) = check_deposit(amount, &self.limits) {
            return rejected(e.into());
        }
        let entry_id = match self.ledger.deposit(amount).await {
            Ok(Some(id)) => id,
            Ok(None) => return rejected(Rejection::Overdraft),
            Err(e) => return rejected(e.into()),
        };
        self.record(Event::Ledger { amount, description: DEPOSIT.to_string() });
        let balance = self.ledger.get_balance(None).await.unwrap_or_default();
        info!(amount, balance, "deposit booked");
        DepositOutcome::Accepted { entry_id, balance }
    }

    pub async fn list_holdings_view(&self) -> Result<Vec<HoldingView>, ViewError> {
        let holdings = self.ledger.list_holdings(None).await?;
        let items: Vec<(String, i64)> = holdings.iter().map(|h| (h.isin.clone(), h.quantity)).collect();
        let quotes = match self.feed.fetch_quotes(&items).await {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, "holdings view without quotes");
                vec![None; holdings.len()]
            }
        };
        Ok(holdings.into_iter().zip(quotes).map(|(holding, quote)| HoldingView { holding, quote }).collect())
    }

    pub async fn list_scheduled_tasks_view(&self) -> Vec<ScheduledTask> {
        self.scheduler.list_scheduled_tasks().await
    }

    pub async fn get_recommendations_view(&self, budget: i64) -> Result<Recommendation, ViewError> {
        let holdings = self.ledger.list_holdings(None).await?;
        let candidates = self.candidates.top(self.top_n).await?;
        let picks = recommend(&candidates, &holdings, budget);

        let lines: Vec<RecommendationLine> = picks
            .into_iter()
            .filter_map(|(isin, units)| {
                let unit_price = candidates.iter().find(|c| c.isin == isin)?.price;
                Some(RecommendationLine { isin, units, unit_price, cost: units * unit_price })
            })
            .collect();
        let spent = lines.iter().map(|l| l.cost).sum();
        Ok(Recommendation { budget, lines, spent })
    }

    pub async fn performance(&self) -> Result<Performance, ViewError> {
        let balance = self.ledger.get_balance(None).await?;
        let deposits = self.ledger.get_balance(Some(DEPOSIT)).await?;
        let market_value = self
            .list_holdings_view()
            .await?
            .iter()
            .map(|v| v.quote.as_ref().map(|q| q.price).unwrap_or(v.holding.face_value * v.holding.quantity))
            .sum::<i64>();
        Ok(Performance { balance, market_value, deposits, profit: balance + market_value - deposits })
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.journal {
            let _ = tx.try_send(ev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Candidate, EventKind};
    use crate::jobs::JobStore;
    use crate::lifecycle::Lifecycle;
    use crate::notify::MemoryNotifier;
    use crate::retry::Retry;
    use crate::scheduler::{self, ScheduleCfg};
    use crate::store::Store;
    use async_trait::async_trait;
    use chrono::{Days, Utc};
    use std::time::Duration;

    struct OneBond(Quote);

    #[async_trait]
    impl MarketFeed for OneBond {
        async fn fetch_quote(&self, isin: &str, quantity: i64) -> Result<Option<Quote>, FeedError> {
            if isin != self.0.isin {
                return Ok(None);
            }
            let q = &self.0;
            Ok(Some(Quote {
                quantity,
                coupon: q.unit_coupon * quantity,
                face_value: q.unit_face_value * quantity,
                price: q.price * quantity,
                ..q.clone()
            }))
        }
    }

    struct Fixed(Vec<Candidate>);

    #[async_trait]
    impl CandidateSource for Fixed {
        async fn top(&self, n: usize) -> Result<Vec<Candidate>, FeedError> {
            Ok(self.0.iter().take(n).cloned().collect())
        }
    }

    fn portfolio() -> Portfolio {
        portfolio_on(Store::in_memory().unwrap())
    }

    fn portfolio_on(store: Store) -> Portfolio {
        let today = Utc::now().date_naive();
        let quote = Quote {
            isin: "RU0001".into(),
            title: "Test bond".into(),
            quantity: 1,
            coupon_date: today.checked_add_days(Days::new(30)),
            redemption_date: today.checked_add_days(Days::new(400)).unwrap(),
            coupon: 2_500,
            face_value: 100_000,
            price: 99_000,
            unit_face_value: 100_000,
            unit_coupon: 2_500,
        };
        let notifier = Arc::new(MemoryNotifier::default());
        let retry = Retry::new(2, Duration::ZERO, notifier.clone());
        let ledger = Ledger::new(store.clone(), retry.clone());
        let feed: Arc<dyn MarketFeed> = Arc::new(OneBond(quote));
        let lifecycle = Arc::new(Lifecycle::new(ledger.clone(), feed.clone(), notifier, 3));
        let (handle, _task) =
            scheduler::spawn(JobStore::new(store, retry), ledger.clone(), feed.clone(), lifecycle, ScheduleCfg::default());
        let candidates = Arc::new(Fixed(vec![
            Candidate { isin: "A".into(), price: 300, yield_bp: 700, held: 0 },
            Candidate { isin: "B".into(), price: 400, yield_bp: 500, held: 0 },
        ]));
        let limits = Limits { max_purchase_qty: 1_000, max_deposit: 10_000_000 };
        Portfolio::new(ledger, feed, candidates, handle, limits, 5)
    }

    #[tokio::test]
    async fn purchase_debits_and_schedules_new_security() {
        let p = portfolio();
        assert!(matches!(p.deposit_cash(500_000).await, DepositOutcome::Accepted { balance: 500_000, .. }));

        let out = p.record_purchase("ru0001", 3).await;
        assert_eq!(
            out,
            PurchaseOutcome::Bought { isin: "RU0001".into(), quantity: 3, price: 297_000, opened: true, scheduled: true }
        );
        let kinds: Vec<EventKind> = p.list_scheduled_tasks_view().await.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![EventKind::Coupon, EventKind::FullRedemption]);

        let again = p.record_purchase("RU0001", 1).await;
        assert!(matches!(again, PurchaseOutcome::Bought { opened: false, .. }));
        assert_eq!(p.list_scheduled_tasks_view().await.len(), 2);

        let perf = p.performance().await.unwrap();
        assert_eq!(perf.balance, 500_000 - 297_000 - 99_000);
        assert_eq!(perf.market_value, 4 * 99_000);
        assert_eq!(perf.profit, 0);
    }

    #[tokio::test]
    async fn purchase_rejections_leave_state_untouched() {
        let p = portfolio();
        p.deposit_cash(50_000).await;

        assert_eq!(
            p.record_purchase("RU0001", 1).await,
            PurchaseOutcome::Rejected(Rejection::InsufficientFunds { price: 99_000, balance: 50_000 })
        );
        assert_eq!(p.record_purchase("RU9999", 1).await, PurchaseOutcome::Rejected(Rejection::UnknownSecurity));
        assert!(matches!(p.record_purchase("RU0001", 0).await, PurchaseOutcome::Rejected(Rejection::Invalid(_))));

        assert!(p.list_holdings_view().await.unwrap().is_empty());
        assert!(p.list_scheduled_tasks_view().await.is_empty());
        assert_eq!(p.ledger.get_balance(None).await.unwrap(), 50_000);
    }

    #[tokio::test]
    async fn broken_store_is_not_reported_as_an_outage() {
        let store = Store::in_memory().unwrap();
        let p = portfolio_on(store.clone());
        p.deposit_cash(500_000).await;
        store.with_conn(|c| Ok(c.execute_batch("DROP TABLE holdings")?)).unwrap();

        match p.record_purchase("RU0001", 1).await {
            PurchaseOutcome::Rejected(Rejection::StoreFailed(msg)) => assert!(msg.contains("holdings"), "{msg}"),
            other => panic!("expected a store failure, got {other:?}"),
        }
        // the purchase transaction rolled back with the failure
        assert_eq!(p.ledger.get_balance(None).await.unwrap(), 500_000);
    }

    #[tokio::test]
    async fn withdrawal_cannot_overdraw() {
        let p = portfolio();
        p.deposit_cash(1_000).await;
        assert_eq!(p.deposit_cash(-1_500).await, DepositOutcome::Rejected(Rejection::Overdraft));
        assert!(matches!(p.deposit_cash(-1_000).await, DepositOutcome::Accepted { balance: 0, .. }));
    }

    #[tokio::test]
    async fn recommendations_carry_unit_prices() {
        let p = portfolio();
        let rec = p.get_recommendations_view(1_000).await.unwrap();
        assert_eq!(rec.spent, 1_000);
        assert_eq!(
            rec.lines,
            vec![
                RecommendationLine { isin: "A".into(), units: 2, unit_price: 300, cost: 600 },
                RecommendationLine { isin: "B".into(), units: 1, unit_price: 400, cost: 400 },
            ]
        );
    }
}
