// ===============================
// src/ledger.rs
// ===============================
//
// Ledger Store: balance entries + holdings, every call routed through the
// retry wrapper. `StoreError::Exhausted` means the store stayed unreachable
// after retries (already alerted); callers treat it as a no-op. Any other
// error is a real failure and is reported as such.
//
use chrono::NaiveDate;

use crate::domain::{EventKind, Holding, HoldingPatch, LedgerEntry, Purchase, DEPOSIT};
use crate::error::StoreError;
use crate::metrics::{CASH_BALANCE, LEDGER_ENTRIES};
use crate::retry::Retry;
use crate::store::Store;

#[derive(Clone)]
pub struct Ledger {
    store: Store,
    retry: Retry,
}

impl Ledger {
    pub fn new(store: Store, retry: Retry) -> Self {
        Self { store, retry }
    }

    pub async fn create_entry(&self, amount: i64, description: &str) -> Result<i64, StoreError> {
        let id = self.retry.run("create_entry", || self.store.create_entry(amount, description)).await?;
        self.posted(description).await;
        Ok(id)
    }

    /// Sum of all entries, or of one category. Zero when nothing matches.
    pub async fn get_balance(&self, description: Option<&str>) -> Result<i64, StoreError> {
        self.retry.run("get_balance", || self.store.balance(description)).await
    }

    pub async fn entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        self.retry.run("list_entries", || self.store.entries()).await
    }

    pub async fn get_holding(&self, isin: &str) -> Result<Option<Holding>, StoreError> {
        self.retry.run("get_holding", || self.store.holding(isin)).await
    }

    pub async fn list_holdings(&self, isin: Option<&str>) -> Result<Vec<Holding>, StoreError> {
        self.retry.run("list_holdings", || self.store.holdings(isin)).await
    }

    pub async fn create_holding(
        &self,
        isin: &str,
        quantity: i64,
        face_value: i64,
        coupon: i64,
    ) -> Result<(), StoreError> {
        let h = Holding { isin: isin.to_string(), quantity, face_value, coupon };
        self.retry.run("create_holding", || self.store.insert_holding(&h)).await
    }

    pub async fn update_holding(&self, isin: &str, patch: HoldingPatch) -> Result<bool, StoreError> {
        self.retry.run("update_holding", || self.store.update_holding(isin, &patch)).await
    }

    pub async fn delete_holding(&self, isin: &str) -> Result<bool, StoreError> {
        self.retry.run("delete_holding", || self.store.delete_holding(isin)).await
    }

    /// Debits `price` and upserts the holding only if the cash balance covers it.
    pub async fn create_or_accumulate_holding(
        &self,
        isin: &str,
        quantity: i64,
        price: i64,
        face_value: i64,
        coupon: i64,
    ) -> Result<Purchase, StoreError> {
        let out = self
            .retry
            .run("create_or_accumulate_holding", || {
                self.store.create_or_accumulate(isin, quantity, price, face_value, coupon)
            })
            .await?;
        if out.succeeded() {
            self.posted(crate::domain::PURCHASE).await;
        }
        Ok(out)
    }

    /// `Ok(None)` when the amount would overdraw the balance.
    pub async fn deposit(&self, amount: i64) -> Result<Option<i64>, StoreError> {
        let id = self.retry.run("deposit", || self.store.deposit(amount, DEPOSIT)).await?;
        if id.is_some() {
            self.posted(DEPOSIT).await;
        }
        Ok(id)
    }

    pub async fn event_fired(&self, isin: &str, kind: EventKind, date: NaiveDate) -> Result<bool, StoreError> {
        self.retry.run("event_fired", || self.store.event_fired(isin, kind, date)).await
    }

    /// `Ok(false)` when this (isin, kind, date) was already committed.
    pub async fn post_event(
        &self,
        isin: &str,
        kind: EventKind,
        date: NaiveDate,
        amount: i64,
        description: &str,
    ) -> Result<bool, StoreError> {
        let fresh = self
            .retry
            .run("post_event", || self.store.post_event(isin, kind, date, amount, description))
            .await?;
        if fresh {
            self.posted(description).await;
        }
        Ok(fresh)
    }

    pub async fn amortize(
        &self,
        isin: &str,
        date: NaiveDate,
        amount: i64,
        description: &str,
        face_value: i64,
        coupon: i64,
    ) -> Result<bool, StoreError> {
        let fresh = self
            .retry
            .run("amortize", || self.store.amortize(isin, date, amount, description, face_value, coupon))
            .await?;
        if fresh {
            self.posted(description).await;
        }
        Ok(fresh)
    }

    pub async fn redeem(&self, isin: &str, date: NaiveDate, amount: i64, description: &str) -> Result<bool, StoreError> {
        let fresh = self
            .retry
            .run("redeem", || self.store.redeem(isin, date, amount, description))
            .await?;
        if fresh {
            self.posted(description).await;
        }
        Ok(fresh)
    }

    async fn posted(&self, category: &str) {
        LEDGER_ENTRIES.with_label_values(&[category]).inc();
        if let Ok(balance) = self.get_balance(None).await {
            CASH_BALANCE.set(balance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;
    use std::sync::Arc;
    use std::time::Duration;

    fn ledger() -> Ledger {
        let retry = Retry::new(7, Duration::ZERO, Arc::new(MemoryNotifier::default()));
        Ledger::new(Store::in_memory().unwrap(), retry)
    }

    #[tokio::test]
    async fn balance_equals_sum_of_entries_after_each_purchase() {
        let ledger = ledger();
        ledger.deposit(10_000).await.unwrap().unwrap();
        let prices = [3_000, 4_500, 4_000, 2_500, 500];
        for (i, price) in prices.iter().enumerate() {
            let isin = format!("RU000{}", i % 2);
            let _ = ledger.create_or_accumulate_holding(&isin, 1, *price, 1_000, 10).await.unwrap();
            let balance = ledger.get_balance(None).await.unwrap();
            let sum: i64 = ledger.entries().await.unwrap().iter().map(|e| e.amount).sum();
            assert_eq!(balance, sum);
            assert!(balance >= 0);
        }
        // 3000 + 4500 + 2500 fit; 4000 and the final 500 do not
        assert_eq!(ledger.get_balance(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deposits_are_tracked_by_category() {
        let ledger = ledger();
        ledger.deposit(7_000).await.unwrap().unwrap();
        ledger.create_entry(300, "coupon payment").await.unwrap();
        assert_eq!(ledger.get_balance(Some(DEPOSIT)).await.unwrap(), 7_000);
        assert_eq!(ledger.get_balance(None).await.unwrap(), 7_300);
        assert_eq!(ledger.deposit(-8_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn holding_crud() {
        let ledger = ledger();
        ledger.create_holding("RU0001", 10, 10_000, 0).await.unwrap();
        let patch = HoldingPatch { quantity: Some(12), ..Default::default() };
        assert!(ledger.update_holding("RU0001", patch).await.unwrap());
        let listed = ledger.list_holdings(Some("RU0001")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].quantity, 12);
        assert!(ledger.delete_holding("RU0001").await.unwrap());
        assert_eq!(ledger.get_holding("RU0001").await.unwrap(), None);
    }

    #[tokio::test]
    async fn constraint_violation_is_reported_not_degraded() {
        let notifier = Arc::new(MemoryNotifier::default());
        let ledger = Ledger::new(Store::in_memory().unwrap(), Retry::new(7, Duration::ZERO, notifier.clone()));
        ledger.create_holding("RU0001", 1, 10_000, 0).await.unwrap();

        let err = ledger.create_holding("RU0001", 2, 10_000, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)), "got {err:?}");
        assert!(!err.is_exhausted());
        // a permanent failure is not an outage: no operator alert
        assert!(notifier.messages().is_empty());
        assert_eq!(ledger.get_holding("RU0001").await.unwrap().unwrap().quantity, 1);
    }
}
