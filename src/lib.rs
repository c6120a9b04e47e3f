// ===============================
// src/lib.rs
// ===============================
pub mod config;
pub mod domain;
pub mod error;
pub mod feed;
pub mod jobs;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod portfolio;
pub mod recommend;
pub mod recorder;
pub mod retry;
pub mod risk;
pub mod scheduler;
pub mod store;
