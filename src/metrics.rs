// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Lifecycle --------
pub static EVENTS_FIRED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("events_fired_total", "lifecycle events committed (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

pub static EVENTS_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "events_skipped_total",
            "firings that committed nothing (labels: kind, reason)",
        ),
        &["kind", "reason"],
    )
    .unwrap()
});

pub static SCHEDULED_JOBS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("scheduled_jobs", "outstanding jobs in the job store").unwrap());

// -------- Ledger --------
pub static LEDGER_ENTRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ledger_entries_total", "ledger entries written (label: category)"),
        &["category"],
    )
    .unwrap()
});

pub static CASH_BALANCE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("cash_balance_minor", "cash balance (minor units)").unwrap());

pub static PURCHASES_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("purchases_rejected_total", "rejected purchases (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

// -------- Infra health --------
pub static STORE_RETRIES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("store_retries_total", "transient store failures retried").unwrap());

pub static STORE_DEGRADED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("store_degraded_total", "store calls that exhausted retries").unwrap()
});

pub static FEED_RETRIES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("feed_retries_total", "market feed requests retried").unwrap());

pub static FEED_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("feed_failures_total", "market feed requests that gave up").unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(EVENTS_FIRED.clone())),
        REGISTRY.register(Box::new(EVENTS_SKIPPED.clone())),
        REGISTRY.register(Box::new(SCHEDULED_JOBS.clone())),
        REGISTRY.register(Box::new(LEDGER_ENTRIES.clone())),
        REGISTRY.register(Box::new(CASH_BALANCE.clone())),
        REGISTRY.register(Box::new(PURCHASES_REJECTED.clone())),
        REGISTRY.register(Box::new(STORE_RETRIES.clone())),
        REGISTRY.register(Box::new(STORE_DEGRADED.clone())),
        REGISTRY.register(Box::new(FEED_RETRIES.clone())),
        REGISTRY.register(Box::new(FEED_FAILURES.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics): tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, ?e, "metrics bind failed");
                return;
            }
        };
        tracing::info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_counters() {
        init();
        LEDGER_ENTRIES.with_label_values(&["deposit"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("ledger_entries_total"));
    }
}
