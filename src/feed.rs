// ===============================
// src/feed.rs
// ===============================
//
// Market data client (MOEX ISS, JSON flavour).
// - Boards are searched in a fixed order: corporate (TQCB) first, then OFZ (TQOB).
//   The first board carrying the SECID wins.
// - Network failures / non-2xx responses: fixed-delay retry, bounded attempts.
//   Exhaustion is returned to the caller, it never takes the process down.
//
// Scale (minor units = kopecks), pinned:
//   unit face   = round(FACEVALUE * 100)
//   unit coupon = round(COUPONVALUE * 100)
//   unit price  = round(PREVWAPRICE% * FACEVALUE) + round(ACCRUEDINT * 100)
//   totals      = unit value * held quantity
//
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::domain::Quote;
use crate::error::FeedError;
use crate::metrics::{FEED_FAILURES, FEED_RETRIES};

/// Search order for a security.
pub const BOARDS: [&str; 2] = ["TQCB", "TQOB"];

const COLUMNS: &str =
    "SECID,SECNAME,NEXTCOUPON,COUPONVALUE,FACEVALUE,PREVWAPRICE,PREVPRICE,ACCRUEDINT,MATDATE,BUYBACKDATE";

#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// `Ok(None)` when no board lists the security.
    async fn fetch_quote(&self, isin: &str, quantity: i64) -> Result<Option<Quote>, FeedError>;

    async fn fetch_quotes(&self, items: &[(String, i64)]) -> Result<Vec<Option<Quote>>, FeedError> {
        let futs = items.iter().map(|(isin, qty)| self.fetch_quote(isin, *qty));
        join_all(futs).await.into_iter().collect()
    }
}

#[derive(Debug, Deserialize)]
struct IssResponse {
    securities: IssTable,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssTable {
    pub columns: Vec<String>,
    pub data: Vec<Vec<Value>>,
}

struct Row<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl<'a> Row<'a> {
    fn get(&self, name: &str) -> Option<&'a Value> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx).filter(|v| !v.is_null())
    }

    fn text(&self, name: &str) -> Option<&'a str> {
        self.get(name).and_then(|v| v.as_str())
    }

    fn number(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// ISS writes "0000-00-00" for "no date".
    fn date(&self, name: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.text(name)?, "%Y-%m-%d").ok()
    }
}

impl IssTable {
    fn row(&self, secid: &str) -> Option<Row<'_>> {
        let idx = self.columns.iter().position(|c| c == "SECID")?;
        self.data
            .iter()
            .find(|vals| vals.get(idx).and_then(|v| v.as_str()) == Some(secid))
            .map(|values| Row { columns: &self.columns, values })
    }
}

fn minor(v: f64) -> i64 {
    (v * 100.0).round() as i64
}

/// Builds a quote from the first board table that lists `isin`.
pub fn parse_quote(tables: &[IssTable], isin: &str, quantity: i64) -> Result<Option<Quote>, FeedError> {
    let Some(row) = tables.iter().find_map(|t| t.row(isin)) else {
        return Ok(None);
    };

    let redemption_date = row
        .date("BUYBACKDATE")
        .or_else(|| row.date("MATDATE"))
        .ok_or_else(|| FeedError::Decode(format!("{isin}: no redemption date")))?;
    let face = row
        .number("FACEVALUE")
        .ok_or_else(|| FeedError::Decode(format!("{isin}: no FACEVALUE")))?;
    let price_pct = row.number("PREVWAPRICE").or_else(|| row.number("PREVPRICE")).unwrap_or(100.0);
    let accrued = row.number("ACCRUEDINT").unwrap_or(0.0);

    let unit_face_value = minor(face);
    let unit_coupon = minor(row.number("COUPONVALUE").unwrap_or(0.0));
    let unit_price = (price_pct * face).round() as i64 + minor(accrued);

    Ok(Some(Quote {
        isin: isin.to_string(),
        title: row.text("SECNAME").unwrap_or(isin).to_string(),
        quantity,
        coupon_date: row.date("NEXTCOUPON"),
        redemption_date,
        coupon: unit_coupon * quantity,
        face_value: unit_face_value * quantity,
        price: unit_price * quantity,
        unit_face_value,
        unit_coupon,
    }))
}

pub struct MoexFeed {
    http: reqwest::Client,
    base_url: String,
    retries: u32,
    delay: Duration,
}

impl MoexFeed {
    pub fn new(base_url: String, retries: u32, delay: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, base_url, retries: retries.max(1), delay }
    }

    async fn request(&self, url: &str) -> Result<IssTable, FeedError> {
        let rsp = self.http.get(url).send().await?;
        if !rsp.status().is_success() {
            return Err(FeedError::Status(rsp.status().as_u16()));
        }
        let body: IssResponse = rsp.json().await?;
        Ok(body.securities)
    }

    async fn board(&self, board: &str) -> Result<IssTable, FeedError> {
        let url = format!(
            "{}/iss/engines/stock/markets/bonds/boards/{}/securities.json?iss.meta=off&iss.only=securities&securities.columns={}",
            self.base_url.trim_end_matches('/'),
            board,
            COLUMNS
        );
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.request(&url).await {
                Ok(table) => {
                    debug!(board, rows = table.data.len(), "moex board fetched");
                    return Ok(table);
                }
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    FEED_RETRIES.inc();
                    warn!(board, attempt, max = self.retries, error = %e, "moex request failed, retrying");
                    sleep(self.delay).await;
                }
                Err(e) if e.is_retryable() => {
                    FEED_FAILURES.inc();
                    error!(board, attempts = attempt, error = %e, "moex request gave up");
                    return Err(FeedError::Exhausted { attempts: attempt, last: e.to_string() });
                }
                Err(e) => {
                    FEED_FAILURES.inc();
                    error!(board, error = %e, "moex response unusable");
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl MarketFeed for MoexFeed {
    async fn fetch_quote(&self, isin: &str, quantity: i64) -> Result<Option<Quote>, FeedError> {
        let mut tables = Vec::with_capacity(BOARDS.len());
        for board in BOARDS {
            tables.push(self.board(board).await?);
            if let Some(q) = parse_quote(&tables, isin, quantity)? {
                return Ok(Some(q));
            }
        }
        Ok(None)
    }

    // One download per board for the whole batch.
    async fn fetch_quotes(&self, items: &[(String, i64)]) -> Result<Vec<Option<Quote>>, FeedError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let mut tables = Vec::with_capacity(BOARDS.len());
        for board in BOARDS {
            tables.push(self.board(board).await?);
        }
        items.iter().map(|(isin, qty)| parse_quote(&tables, isin, *qty)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn table(rows: Value) -> IssTable {
        serde_json::from_value(serde_json::json!({
            "columns": ["SECID", "SECNAME", "NEXTCOUPON", "COUPONVALUE", "FACEVALUE",
                        "PREVWAPRICE", "PREVPRICE", "ACCRUEDINT", "MATDATE", "BUYBACKDATE"],
            "data": rows,
        }))
        .unwrap()
    }

    fn corp() -> IssTable {
        table(serde_json::json!([
            ["RU000A0JX0J2", "Corp 1P1", "2025-03-12", 35.9, 1000, 98.53, 98.1, 12.34, "2027-06-01", "0000-00-00"],
            ["RU000A1002C2", "Corp 2P1", "2025-04-02", 41.14, 700, 101.2, null, 3.5, "2026-10-01", "2025-10-02"]
        ]))
    }

    fn ofz() -> IssTable {
        table(serde_json::json!([
            ["SU26238RMFS4", "OFZ 26238", "2025-06-04", 35.4, 1000, null, 57.2, 1.0, "2041-05-15", null]
        ]))
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn scales_to_minor_units_for_held_quantity() {
        let q = parse_quote(&[corp(), ofz()], "RU000A0JX0J2", 10).unwrap().unwrap();
        assert_eq!(q.title, "Corp 1P1");
        assert_eq!(q.unit_face_value, 100_000);
        assert_eq!(q.face_value, 1_000_000);
        assert_eq!(q.unit_coupon, 3_590);
        assert_eq!(q.coupon, 35_900);
        // (98.53% of 1000 = 985.30 + accrued 12.34) * 10
        assert_eq!(q.price, 997_640);
        assert_eq!(q.coupon_date, Some(d("2025-03-12")));
        assert_eq!(q.redemption_date, d("2027-06-01"));
    }

    #[test]
    fn buyback_date_wins_over_maturity() {
        let q = parse_quote(&[corp()], "RU000A1002C2", 1).unwrap().unwrap();
        assert_eq!(q.redemption_date, d("2025-10-02"));
        // 101.2% of 700 = 708.40 + 3.50
        assert_eq!(q.price, 71_190);
        assert_eq!(q.unit_coupon, 4_114);
    }

    #[test]
    fn falls_back_to_prev_price_and_second_board() {
        let q = parse_quote(&[corp(), ofz()], "SU26238RMFS4", 2).unwrap().unwrap();
        assert_eq!(q.price, (57_200 + 100) * 2);
        assert_eq!(q.redemption_date, d("2041-05-15"));
    }

    #[test]
    fn unknown_security_is_absent_not_error() {
        assert!(parse_quote(&[corp(), ofz()], "RU0000000000", 1).unwrap().is_none());
    }

    #[test]
    fn first_board_wins() {
        let dup = table(serde_json::json!([
            ["RU000A0JX0J2", "Shadow", "2025-03-12", 1.0, 1000, 50.0, null, 0.0, "2027-06-01", null]
        ]));
        let q = parse_quote(&[corp(), dup], "RU000A0JX0J2", 1).unwrap().unwrap();
        assert_eq!(q.title, "Corp 1P1");
    }

    // Answers `fail_first` requests with 503, the rest with the corporate board.
    async fn serve(fail_first: u32) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let body = serde_json::json!({ "securities": {
            "columns": corp().columns,
            "data": corp().data,
        }})
        .to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { break };
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let rsp = if n < fail_first {
                    "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                } else {
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                };
                let _ = sock.write_all(rsp.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    #[tokio::test]
    async fn retries_non_success_status_then_succeeds() {
        let (url, hits) = serve(2).await;
        let feed = MoexFeed::new(url, 5, Duration::ZERO);
        let q = feed.fetch_quote("RU000A0JX0J2", 1).await.unwrap().unwrap();
        assert_eq!(q.unit_face_value, 100_000);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_error() {
        let (url, hits) = serve(u32::MAX).await;
        let feed = MoexFeed::new(url, 3, Duration::ZERO);
        let err = feed.fetch_quote("RU000A0JX0J2", 1).await.unwrap_err();
        assert!(matches!(err, FeedError::Exhausted { attempts: 3, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
