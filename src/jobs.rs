// ===============================
// src/jobs.rs
// ===============================
//
// Durable job table. Jobs are keyed by `JobAction::key()`, so scheduling an
// action that already has a job replaces it: at most one outstanding job per
// (security, kind). Only the scheduler actor mutates this table.
//
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use cron::Schedule;
use rusqlite::params;

use crate::domain::{EventKind, Job, JobAction, ScheduledTask, Trigger};
use crate::error::StoreError;
use crate::metrics::SCHEDULED_JOBS;
use crate::retry::Retry;
use crate::store::Store;

/// One-shot fire time for an event date: `hour`:00 UTC on that day.
pub fn fire_time(date: NaiveDate, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    Utc.from_utc_datetime(&date.and_time(time))
}

/// Next cron fire strictly after `after`.
pub fn next_cron(expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Schedule::from_str(expr).ok()?.after(&after).next()
}

#[derive(Clone)]
pub struct JobStore {
    store: Store,
    retry: Retry,
}

impl JobStore {
    pub fn new(store: Store, retry: Retry) -> Self {
        Self { store, retry }
    }

    pub async fn put(&self, job: &Job) -> Result<(), StoreError> {
        self.retry.run("put_job", || put(&self.store, job)).await?;
        self.refresh_gauge().await;
        Ok(())
    }

    /// Removes the job if it still has the given fire time (claim before firing).
    pub async fn claim(&self, job: &Job) -> Result<bool, StoreError> {
        let key = job.action.key();
        let at = job.fire_at.timestamp();
        self.retry
            .run("claim_job", || {
                self.store.with_conn(|c| {
                    Ok(c.execute(
                        "DELETE FROM scheduled_jobs WHERE job_key = ?1 AND fire_at = ?2",
                        params![key, at],
                    )? > 0)
                })
            })
            .await
    }

    pub async fn remove(&self, action: &JobAction) -> Result<bool, StoreError> {
        let key = action.key();
        self.retry
            .run("remove_job", || {
                self.store.with_conn(|c| {
                    Ok(c.execute("DELETE FROM scheduled_jobs WHERE job_key = ?1", params![key])? > 0)
                })
            })
            .await
    }

    /// Drops every bond job of one security.
    pub async fn clear_security(&self, isin: &str) -> Result<usize, StoreError> {
        let n = self
            .retry
            .run("clear_security_jobs", || {
                self.store.with_conn(|c| {
                    let mut n = 0;
                    for kind in [EventKind::Coupon, EventKind::PartialRedemption, EventKind::FullRedemption] {
                        let key = JobAction::Bond { isin: isin.to_string(), kind }.key();
                        n += c.execute("DELETE FROM scheduled_jobs WHERE job_key = ?1", params![key])?;
                    }
                    Ok(n)
                })
            })
            .await?;
        self.refresh_gauge().await;
        Ok(n)
    }

    /// Drops every bond job; recurring jobs stay.
    pub async fn clear_bonds(&self) -> Result<usize, StoreError> {
        let jobs = self.all().await?;
        let mut n = 0;
        for job in jobs.iter().filter(|j| matches!(j.action, JobAction::Bond { .. })) {
            if self.remove(&job.action).await? {
                n += 1;
            }
        }
        self.refresh_gauge().await;
        Ok(n)
    }

    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.retry.run("due_jobs", || query(&self.store, Some(now.timestamp()))).await
    }

    pub async fn all(&self) -> Result<Vec<Job>, StoreError> {
        self.retry.run("list_jobs", || query(&self.store, None)).await
    }

    /// Outstanding bond events, soonest first.
    pub async fn tasks(&self) -> Result<Vec<ScheduledTask>, StoreError> {
        let jobs = self.all().await?;
        Ok(
            jobs.into_iter()
                .filter_map(|j| match j.action {
                    JobAction::Bond { isin, kind } => Some(ScheduledTask { isin, kind, fire_at: j.fire_at }),
                    JobAction::Reconcile => None,
                })
                .collect(),
        )
    }

    async fn refresh_gauge(&self) {
        if let Ok(jobs) = self.all().await {
            SCHEDULED_JOBS.set(jobs.len() as i64);
        }
    }
}

fn put(store: &Store, job: &Job) -> Result<(), StoreError> {
    let action = serde_json::to_string(&job.action)?;
    let trigger = serde_json::to_string(&job.trigger)?;
    store.with_conn(|c| {
        c.execute(
            "INSERT INTO scheduled_jobs (job_key, action, trigger, fire_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(job_key) DO UPDATE SET
                action = excluded.action, trigger = excluded.trigger, fire_at = excluded.fire_at",
            params![job.action.key(), action, trigger, job.fire_at.timestamp()],
        )?;
        Ok(())
    })
}

fn query(store: &Store, due_at: Option<i64>) -> Result<Vec<Job>, StoreError> {
    store.with_conn(|c| {
        let mut stmt = c.prepare(
            "SELECT action, trigger, fire_at FROM scheduled_jobs
             WHERE ?1 IS NULL OR fire_at <= ?1 ORDER BY fire_at, job_key",
        )?;
        let rows = stmt.query_map(params![due_at], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (action, trigger, ts) = row?;
            let fire_at = Utc
                .timestamp_opt(ts, 0)
                .single()
                .ok_or_else(|| StoreError::Corrupt(format!("job fire_at {ts}")))?;
            out.push(Job {
                action: serde_json::from_str::<JobAction>(&action)?,
                trigger: serde_json::from_str::<Trigger>(&trigger)?,
                fire_at,
            });
        }
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;
    use std::sync::Arc;
    use std::time::Duration;

    fn jobs(store: Store) -> JobStore {
        JobStore::new(store, Retry::new(1, Duration::ZERO, Arc::new(MemoryNotifier::default())))
    }

    fn bond(isin: &str, kind: EventKind, at: DateTime<Utc>) -> Job {
        Job {
            action: JobAction::Bond { isin: isin.into(), kind },
            trigger: Trigger::OneShot { at },
            fire_at: at,
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn fire_time_is_fixed_hour_utc() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 12).unwrap();
        assert_eq!(fire_time(date, 5), at("2025-03-12T05:00:00Z"));
    }

    #[test]
    fn daily_cron_moves_to_next_day() {
        let next = next_cron("0 0 5 * * *", at("2025-03-12T05:00:00Z")).unwrap();
        assert_eq!(next, at("2025-03-13T05:00:00Z"));
        assert!(next_cron("not a cron", at("2025-03-12T05:00:00Z")).is_none());
    }

    #[tokio::test]
    async fn same_action_replaces_previous_job() {
        let js = jobs(Store::in_memory().unwrap());
        js.put(&bond("RU0001", EventKind::Coupon, at("2025-03-12T05:00:00Z"))).await.unwrap();
        js.put(&bond("RU0001", EventKind::Coupon, at("2025-06-12T05:00:00Z"))).await.unwrap();
        let tasks = js.tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].fire_at, at("2025-06-12T05:00:00Z"));
    }

    #[tokio::test]
    async fn due_returns_overdue_jobs_in_fire_order() {
        let js = jobs(Store::in_memory().unwrap());
        js.put(&bond("RU0002", EventKind::FullRedemption, at("2025-03-10T05:00:00Z"))).await.unwrap();
        js.put(&bond("RU0001", EventKind::Coupon, at("2025-03-01T05:00:00Z"))).await.unwrap();
        js.put(&bond("RU0003", EventKind::Coupon, at("2025-04-01T05:00:00Z"))).await.unwrap();
        let due = js.due(at("2025-03-15T00:00:00Z")).await.unwrap();
        let keys: Vec<String> = due.iter().map(|j| j.action.key()).collect();
        assert_eq!(keys, vec!["RU0001:coupon", "RU0002:full_redemption"]);
    }

    #[tokio::test]
    async fn claim_succeeds_once() {
        let js = jobs(Store::in_memory().unwrap());
        let job = bond("RU0001", EventKind::Coupon, at("2025-03-12T05:00:00Z"));
        js.put(&job).await.unwrap();
        assert!(js.claim(&job).await.unwrap());
        assert!(!js.claim(&job).await.unwrap());
    }

    #[tokio::test]
    async fn clear_bonds_keeps_recurring_jobs() {
        let js = jobs(Store::in_memory().unwrap());
        js.put(&bond("RU0001", EventKind::Coupon, at("2025-03-12T05:00:00Z"))).await.unwrap();
        js.put(&bond("RU0001", EventKind::FullRedemption, at("2027-03-12T05:00:00Z"))).await.unwrap();
        js.put(&Job {
            action: JobAction::Reconcile,
            trigger: Trigger::Recurring { cron: "0 0 5 * * *".into() },
            fire_at: at("2025-03-13T05:00:00Z"),
        })
        .await
        .unwrap();
        assert_eq!(js.clear_bonds().await.unwrap(), 2);
        let left = js.all().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].action, JobAction::Reconcile);
    }

    #[tokio::test]
    async fn jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bonds.sqlite3");
        {
            let js = jobs(Store::open(&path).unwrap());
            js.put(&bond("RU0001", EventKind::Coupon, at("2025-03-12T05:00:00Z"))).await.unwrap();
        }
        let js = jobs(Store::open(&path).unwrap());
        let tasks = js.tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, EventKind::Coupon);
    }
}
