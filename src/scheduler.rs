// ===============================
// src/scheduler.rs
// ===============================
//
// Lifecycle scheduler. One actor task owns every job-store mutation
// (start / set_bond / follow-ups / due dispatch), so a clear-and-rederive can
// never interleave with a set_bond for a fresh purchase. Firings run as their
// own tokio tasks; their follow-ups come back as the task output and are
// applied by the actor. Firings never write to the command channel.
//
// Duplicate protection:
// - jobs are keyed by (isin, kind); rescheduling replaces,
// - a due job is claimed (deleted at its fire time) before it is fired,
// - the store refuses a second commit for the same (isin, kind, date).
//
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::domain::{EventKind, Job, JobAction, Quote, ScheduledTask, Trigger};
use crate::error::StoreError;
use crate::feed::MarketFeed;
use crate::jobs::{fire_time, next_cron, JobStore};
use crate::ledger::Ledger;
use crate::lifecycle::{FollowUp, Lifecycle};

#[derive(Debug, Clone)]
pub struct ScheduleCfg {
    /// UTC hour at which one-shot events fire.
    pub fire_hour: u32,
    pub reconcile_cron: String,
    pub poll: Duration,
}

impl Default for ScheduleCfg {
    fn default() -> Self {
        Self { fire_hour: 5, reconcile_cron: "0 0 5 * * *".to_string(), poll: Duration::from_secs(30) }
    }
}

enum Command {
    Start { reply: oneshot::Sender<Option<usize>> },
    SetBond {
        isin: String,
        coupon_date: Option<NaiveDate>,
        redemption_date: NaiveDate,
        reply: oneshot::Sender<bool>,
    },
    ListTasks { reply: oneshot::Sender<Vec<ScheduledTask>> },
    Dispatch { now: DateTime<Utc>, reply: oneshot::Sender<usize> },
}

/// A claimed job, ready to fire.
struct Firing {
    isin: String,
    kind: EventKind,
    date: NaiveDate,
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Fires overdue jobs, then clears every bond job and re-derives coupon and
    /// redemption events from fresh quotes. Returns how many securities got a schedule.
    pub async fn start(&self) -> Option<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Start { reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Schedules coupon + full redemption for one newly bought security. A coupon
    /// whose fire time has already passed belongs to the previous owner and is skipped.
    pub async fn set_bond(&self, isin: &str, coupon_date: Option<NaiveDate>, redemption_date: NaiveDate) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::SetBond { isin: isin.to_string(), coupon_date, redemption_date, reply };
        if self.tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Outstanding bond events, soonest first.
    pub async fn list_scheduled_tasks(&self) -> Vec<ScheduledTask> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::ListTasks { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Fires everything due at `now`, waits for those firings and applies their
    /// follow-ups before returning.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Dispatch { now, reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

pub struct Scheduler {
    jobs: JobStore,
    ledger: Ledger,
    feed: Arc<dyn MarketFeed>,
    lifecycle: Arc<Lifecycle>,
    cfg: ScheduleCfg,
    rx: mpsc::Receiver<Command>,
    // firings started by the poll tick
    detached: JoinSet<Vec<FollowUp>>,
}

pub fn spawn(
    jobs: JobStore,
    ledger: Ledger,
    feed: Arc<dyn MarketFeed>,
    lifecycle: Arc<Lifecycle>,
    cfg: ScheduleCfg,
) -> (SchedulerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<Command>(256);
    let scheduler = Scheduler { jobs, ledger, feed, lifecycle, cfg, rx, detached: JoinSet::new() };
    let task = tokio::spawn(scheduler.run());
    (SchedulerHandle { tx }, task)
}

impl Scheduler {
    async fn run(mut self) {
        // first poll after one period; start() does the initial catch-up
        let mut tick = interval_at(Instant::now() + self.cfg.poll, self.cfg.poll);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(poll = ?self.cfg.poll, fire_hour = self.cfg.fire_hour, "scheduler: started");

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => {
                            while let Some(done) = self.detached.join_next().await {
                                for item in finished(done) {
                                    self.follow_up(item).await;
                                }
                            }
                            info!("scheduler: all handles dropped, stopped");
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    let due = self.claim_due(Utc::now()).await;
                    for firing in due {
                        spawn_firing(&mut self.detached, self.lifecycle.clone(), firing);
                    }
                }
                Some(done) = self.detached.join_next(), if !self.detached.is_empty() => {
                    for item in finished(done) {
                        self.follow_up(item).await;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Start { reply } => {
                let _ = reply.send(self.start().await);
            }
            Command::SetBond { isin, coupon_date, redemption_date, reply } => {
                let now = Utc::now();
                let coupon = coupon_date.filter(|c| fire_time(*c, self.cfg.fire_hour) > now);
                let _ = reply.send(self.set_bond(&isin, coupon, redemption_date).await);
            }
            Command::ListTasks { reply } => {
                let _ = reply.send(self.jobs.tasks().await.unwrap_or_default());
            }
            Command::Dispatch { now, reply } => {
                let (n, follow_ups) = self.fire_due(now).await;
                for item in follow_ups {
                    self.follow_up(item).await;
                }
                let _ = reply.send(n);
            }
        }
    }

    async fn start(&mut self) -> Option<usize> {
        let now = Utc::now();
        let (caught_up, follow_ups) = self.fire_due(now).await;
        if caught_up > 0 {
            info!(caught_up, "scheduler: fired overdue jobs before re-deriving");
        }
        let scheduled = self.rederive(now).await;
        // catch-up follow-ups (partial checks, moved redemptions) land on the fresh schedule
        for item in follow_ups {
            self.follow_up(item).await;
        }
        scheduled
    }

    async fn rederive(&self, now: DateTime<Utc>) -> Option<usize> {
        let cleared = self.jobs.clear_bonds().await.ok()?;
        self.ensure_reconcile(now).await;

        let holdings = self.ledger.list_holdings(None).await.ok()?;
        let items: Vec<(String, i64)> = holdings.iter().map(|h| (h.isin.clone(), h.quantity)).collect();
        let quotes = match self.feed.fetch_quotes(&items).await {
            Ok(q) => q,
            Err(e) => {
                error!(error = %e, "scheduler: quotes unavailable, schedule left empty until reconcile");
                return None;
            }
        };

        let today = now.date_naive();
        let mut scheduled = 0;
        for (holding, quote) in holdings.iter().zip(quotes) {
            match quote {
                Some(q) => {
                    if self.schedule_quote(&q, today).await {
                        scheduled += 1;
                    }
                }
                None => warn!(isin = %holding.isin, "scheduler: held security not quoted"),
            }
        }
        info!(cleared, scheduled, holdings = holdings.len(), "scheduler: schedule re-derived");
        Some(scheduled)
    }

    async fn set_bond(&self, isin: &str, coupon_date: Option<NaiveDate>, redemption_date: NaiveDate) -> bool {
        if let Some(c) = coupon_date.filter(|c| *c < redemption_date) {
            if self.put_bond(isin, EventKind::Coupon, c).await.is_err() {
                return false;
            }
        }
        self.put_bond(isin, EventKind::FullRedemption, redemption_date).await.is_ok()
    }

    /// Re-derivation keeps a coupon dated today even past the fire hour: the
    /// security was already held, so the coupon is owed.
    async fn schedule_quote(&self, q: &Quote, today: NaiveDate) -> bool {
        self.set_bond(&q.isin, q.coupon_date.filter(|c| *c >= today), q.redemption_date).await
    }

    async fn put_bond(&self, isin: &str, kind: EventKind, date: NaiveDate) -> Result<(), StoreError> {
        let at = fire_time(date, self.cfg.fire_hour);
        let job = Job {
            action: JobAction::Bond { isin: isin.to_string(), kind },
            trigger: Trigger::OneShot { at },
            fire_at: at,
        };
        debug!(%isin, ?kind, %at, "scheduler: job scheduled");
        self.jobs.put(&job).await
    }

    async fn ensure_reconcile(&self, now: DateTime<Utc>) {
        let Some(at) = next_cron(&self.cfg.reconcile_cron, now) else {
            error!(cron = %self.cfg.reconcile_cron, "scheduler: bad reconcile cron, recurring job disabled");
            return;
        };
        let job = Job {
            action: JobAction::Reconcile,
            trigger: Trigger::Recurring { cron: self.cfg.reconcile_cron.clone() },
            fire_at: at,
        };
        let _ = self.jobs.put(&job).await;
    }

    /// Fires every job due at `now` and waits for the firings. Returns how many
    /// fired and the follow-ups they produced, not yet applied.
    async fn fire_due(&self, now: DateTime<Utc>) -> (usize, Vec<FollowUp>) {
        let claimed = self.claim_due(now).await;
        let n = claimed.len();
        let mut set = JoinSet::new();
        for firing in claimed {
            spawn_firing(&mut set, self.lifecycle.clone(), firing);
        }
        let mut follow_ups = Vec::new();
        while let Some(done) = set.join_next().await {
            follow_ups.extend(finished(done));
        }
        (n, follow_ups)
    }

    /// Claims every bond job due at `now` and runs due reconcile jobs inline.
    async fn claim_due(&self, now: DateTime<Utc>) -> Vec<Firing> {
        let due = match self.jobs.due(now).await {
            Ok(due) if !due.is_empty() => due,
            _ => return Vec::new(),
        };

        // a redemption pays the final coupon itself; other jobs of that security go
        let redeeming: AHashSet<String> = due
            .iter()
            .filter_map(|j| match &j.action {
                JobAction::Bond { isin, kind: EventKind::FullRedemption } => Some(isin.clone()),
                _ => None,
            })
            .collect();

        let mut claimed = Vec::new();
        for job in due {
            match &job.action {
                JobAction::Reconcile => {
                    self.rearm(&job, now).await;
                    self.reconcile(now.date_naive()).await;
                }
                JobAction::Bond { isin, kind } => {
                    if *kind != EventKind::FullRedemption && redeeming.contains(isin) {
                        debug!(%isin, ?kind, "scheduler: dropped, redemption due");
                        let _ = self.jobs.remove(&job.action).await;
                        continue;
                    }
                    if !matches!(self.jobs.claim(&job).await, Ok(true)) {
                        continue;
                    }
                    if *kind == EventKind::FullRedemption {
                        let _ = self.jobs.clear_security(isin).await;
                    }
                    claimed.push(Firing { isin: isin.clone(), kind: *kind, date: job.fire_at.date_naive() });
                }
            }
        }
        claimed
    }

    async fn rearm(&self, job: &Job, now: DateTime<Utc>) {
        let Trigger::Recurring { cron } = &job.trigger else {
            let _ = self.jobs.remove(&job.action).await;
            return;
        };
        match next_cron(cron, now) {
            Some(at) => {
                let _ = self.jobs.put(&Job { fire_at: at, ..job.clone() }).await;
            }
            None => {
                error!(%cron, "scheduler: bad cron on stored job, removed");
                let _ = self.jobs.remove(&job.action).await;
            }
        }
    }

    async fn follow_up(&self, item: FollowUp) {
        match item {
            FollowUp::Schedule { isin, kind, date } => {
                // a late follow-up must not resurrect a retired security
                if !matches!(self.ledger.get_holding(&isin).await, Ok(Some(_))) {
                    debug!(%isin, ?kind, "scheduler: follow-up for unheld security ignored");
                    return;
                }
                let _ = self.put_bond(&isin, kind, date).await;
                if kind == EventKind::FullRedemption {
                    // redemption moved; its claim dropped the coupon cycle
                    self.reconcile_one(&isin, Utc::now().date_naive()).await;
                }
            }
            FollowUp::Retire { isin } => {
                let n = self.jobs.clear_security(&isin).await.unwrap_or(0);
                info!(%isin, cleared = n, "scheduler: security retired");
            }
        }
    }

    /// Restores missing coupon/redemption jobs and drops jobs of unheld securities.
    async fn reconcile(&self, today: NaiveDate) {
        let (Ok(holdings), Ok(tasks)) = (self.ledger.list_holdings(None).await, self.jobs.tasks().await)
        else {
            return;
        };
        let held: AHashSet<&str> = holdings.iter().map(|h| h.isin.as_str()).collect();
        let stale: AHashSet<&str> = tasks.iter().map(|t| t.isin.as_str()).filter(|i| !held.contains(i)).collect();
        for isin in stale {
            let _ = self.jobs.clear_security(isin).await;
        }
        for h in &holdings {
            self.reconcile_with(&h.isin, h.quantity, &tasks, today).await;
        }
    }

    async fn reconcile_one(&self, isin: &str, today: NaiveDate) {
        let (Ok(Some(h)), Ok(tasks)) = (self.ledger.get_holding(isin).await, self.jobs.tasks().await) else {
            return;
        };
        self.reconcile_with(isin, h.quantity, &tasks, today).await;
    }

    async fn reconcile_with(&self, isin: &str, quantity: i64, tasks: &[ScheduledTask], today: NaiveDate) {
        let mine: Vec<EventKind> = tasks.iter().filter(|t| t.isin == isin).map(|t| t.kind).collect();
        let has_full = mine.contains(&EventKind::FullRedemption);
        let has_cycle = mine.iter().any(|k| *k != EventKind::FullRedemption);
        if has_full && has_cycle {
            return;
        }
        let q = match self.feed.fetch_quote(isin, quantity).await {
            Ok(Some(q)) => q,
            Ok(None) => {
                warn!(%isin, "reconcile: held security not quoted");
                return;
            }
            Err(e) => {
                warn!(%isin, error = %e, "reconcile: quote unavailable");
                return;
            }
        };
        if !has_full {
            let _ = self.put_bond(isin, EventKind::FullRedemption, q.redemption_date).await;
        }
        if !has_cycle {
            if let Some(c) = q.coupon_date.filter(|c| *c >= today && *c < q.redemption_date) {
                let _ = self.put_bond(isin, EventKind::Coupon, c).await;
            }
        }
        info!(%isin, restored_full = !has_full, restored_coupon = !has_cycle, "reconcile: schedule restored");
    }
}

fn spawn_firing(set: &mut JoinSet<Vec<FollowUp>>, lifecycle: Arc<Lifecycle>, f: Firing) {
    set.spawn(async move {
        let Firing { isin, kind, date } = f;
        info!(%isin, ?kind, %date, "scheduler: firing");
        match lifecycle.fire(&isin, kind, date).await {
            Ok(out) => {
                debug!(%isin, ?kind, fired = ?out.fired, "scheduler: fired");
                out.follow_ups
            }
            Err(e) => {
                error!(%isin, ?kind, %date, error = %e, "scheduler: firing failed");
                Vec::new()
            }
        }
    });
}

fn finished(done: Result<Vec<FollowUp>, JoinError>) -> Vec<FollowUp> {
    done.unwrap_or_else(|e| {
        error!(error = %e, "scheduler: firing task aborted");
        Vec::new()
    })
}
