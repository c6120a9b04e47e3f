// ===============================
// src/recommend.rs
// ===============================
//
// Recommendation engine: greedy spread of a cash budget over a short,
// externally ranked candidate list.
//
// Each step buys one unit of the candidate with the smallest held value
// (held * price), ties to the higher yield, then to the ISIN. If that
// candidate is not affordable the loop stops; cheaper candidates are not tried.
//
use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{Candidate, Holding};
use crate::error::FeedError;

/// Units to buy per ISIN. Ordered map so output is reproducible.
pub fn recommend(candidates: &[Candidate], holdings: &[Holding], budget: i64) -> BTreeMap<String, i64> {
    let mut pool: Vec<Candidate> = candidates
        .iter()
        .filter(|c| c.price > 0)
        .map(|c| Candidate { held: held_of(holdings, &c.isin).unwrap_or(c.held), ..c.clone() })
        .collect();

    let mut budget = budget;
    let mut out = BTreeMap::new();
    loop {
        let Some(pick) = pool.iter_mut().min_by(|a, b| {
            (a.held.saturating_mul(a.price), -a.yield_bp, &a.isin)
                .cmp(&(b.held.saturating_mul(b.price), -b.yield_bp, &b.isin))
        }) else {
            break;
        };
        if budget < pick.price {
            break;
        }
        pick.held += 1;
        budget -= pick.price;
        *out.entry(pick.isin.clone()).or_insert(0) += 1;
    }
    debug!(left = budget, picks = out.len(), "recommend: budget spread");
    out
}

fn held_of(holdings: &[Holding], isin: &str) -> Option<i64> {
    holdings.iter().find(|h| h.isin == isin).map(|h| h.quantity)
}

/// Externally ranked purchase candidates, best yield first.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn top(&self, n: usize) -> Result<Vec<Candidate>, FeedError>;
}

/// dohod.ru bond screener connector.
pub struct DohodSource {
    http: reqwest::Client,
    url: String,
}

impl DohodSource {
    pub fn new(url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, url }
    }
}

#[async_trait]
impl CandidateSource for DohodSource {
    async fn top(&self, n: usize) -> Result<Vec<Candidate>, FeedError> {
        let form = [("customFilters[strategy][]", "strategy1")];
        let rsp = self.http.post(&self.url).form(&form).send().await?;
        if !rsp.status().is_success() {
            return Err(FeedError::Status(rsp.status().as_u16()));
        }
        let rows: Vec<Value> = rsp.json().await?;
        Ok(rank(&rows, n))
    }
}

fn num(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Top `n` screener rows by `price_return`, converted to per-unit minor units:
/// price = nominal * price% + accrued * 100, yield in basis points.
pub fn rank(rows: &[Value], n: usize) -> Vec<Candidate> {
    let mut parsed: Vec<(f64, Candidate)> = rows
        .iter()
        .filter_map(|row| {
            let isin = row.get("xml_isin")?.as_str()?.to_string();
            let ret = num(row, "price_return")?;
            let nominal = num(row, "nominal")?;
            let pct = num(row, "price")?;
            let accrued = num(row, "nkd").unwrap_or(0.0);
            let price = (nominal * pct).round() as i64 + (accrued * 100.0).round() as i64;
            Some((ret, Candidate { isin, price, yield_bp: (ret * 100.0).round() as i64, held: 0 }))
        })
        .collect();
    if parsed.len() < rows.len() {
        warn!(skipped = rows.len() - parsed.len(), "dohod: rows without usable fields");
    }
    parsed.sort_by(|a, b| b.0.total_cmp(&a.0));
    parsed.into_iter().take(n).map(|(_, c)| c).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cand(isin: &str, price: i64, yield_bp: i64, held: i64) -> Candidate {
        Candidate { isin: isin.into(), price, yield_bp, held }
    }

    #[test]
    fn spreads_budget_towards_underweight_candidates() {
        let candidates = vec![cand("A", 300, 7, 0), cand("B", 400, 5, 0)];
        let out = recommend(&candidates, &[], 1000);
        // A (300) -> B (400, held value 0 < 300) -> A (300 < 400); 0 left
        assert_eq!(out, BTreeMap::from([("A".to_string(), 2), ("B".to_string(), 1)]));
        assert_eq!(recommend(&candidates, &[], 1000), out);
    }

    #[test]
    fn ties_go_to_higher_yield() {
        let candidates = vec![cand("LOW", 500, 3, 0), cand("HIGH", 500, 9, 0)];
        let out = recommend(&candidates, &[], 500);
        assert_eq!(out, BTreeMap::from([("HIGH".to_string(), 1)]));
    }

    #[test]
    fn stops_when_the_cheapest_to_grow_is_unaffordable() {
        // A is held heavily, B is the next pick but costs more than what is left
        let holdings = vec![Holding { isin: "A".into(), quantity: 10, face_value: 100, coupon: 0 }];
        let candidates = vec![cand("A", 100, 9, 0), cand("B", 900, 1, 0)];
        let out = recommend(&candidates, &holdings, 800);
        assert!(out.is_empty());
    }

    #[test]
    fn empty_or_unpriced_candidates_yield_nothing() {
        assert!(recommend(&[], &[], 10_000).is_empty());
        assert!(recommend(&[cand("Z", 0, 5, 0)], &[], 10_000).is_empty());
    }

    #[test]
    fn screener_rows_rank_by_return() {
        let rows = vec![
            json!({"xml_isin": "RU1", "price_return": "12.5", "nominal": "1000", "price": "98.5", "nkd": "4.2"}),
            json!({"xml_isin": "RU2", "price_return": 15.1, "nominal": 1000, "price": 101.0, "nkd": 0}),
            json!({"xml_isin": "RU3", "price_return": "9.0", "nominal": "500", "price": "100"}),
            json!({"price_return": "30"}),
        ];
        let top = rank(&rows, 2);
        assert_eq!(top, vec![cand("RU2", 101_000, 1510, 0), cand("RU1", 98_920, 1250, 0)]);
    }
}
