//! Per-user crawl state machine.
//!
//! Each job expands the collection graph around one fan in two stages:
//! stage 1 walks every item the fan collected and records who else collected
//! it; stage 2 fully enumerates each collector discovered that way. Work
//! units live in durable queue tables, so a restarted process recomputes the
//! remaining requirements from the store and continues. Fetch concurrency is
//! bounded globally to stay inside Bandcamp's rate limits, and every unit is
//! claimed exactly once at a time within a job.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use cratedig_common::{Collector, CrateDigError, CrawlTarget, Item, Result, Stage};
use cratedig_graph::GraphStore;

use crate::eta::EtaTracker;
use crate::fetcher::Fetcher;

/// Tuning knobs for the crawl loops.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Entities older than this are re-crawled on next access.
    pub stale_days: i64,
    /// Concurrent workers draining a stage within one job.
    pub stage_workers: usize,
    /// Delay after a transient fetch failure; doubles per consecutive
    /// failure up to `backoff_cap`.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            stale_days: 30,
            stage_workers: 4,
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(300),
        }
    }
}

pub struct Orchestrator<F: Fetcher> {
    store: GraphStore,
    fetcher: Arc<F>,
    /// Global cap on concurrent Bandcamp fetches across all jobs.
    fetch_slots: Arc<Semaphore>,
    eta: Arc<EtaTracker>,
    cfg: CrawlConfig,
}

impl<F: Fetcher> Clone for Orchestrator<F> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            fetcher: Arc::clone(&self.fetcher),
            fetch_slots: Arc::clone(&self.fetch_slots),
            eta: Arc::clone(&self.eta),
            cfg: self.cfg.clone(),
        }
    }
}

impl<F: Fetcher + 'static> Orchestrator<F> {
    pub fn new(store: GraphStore, fetcher: Arc<F>, fetch_slots: usize, cfg: CrawlConfig) -> Self {
        Self {
            store,
            fetcher,
            fetch_slots: Arc::new(Semaphore::new(fetch_slots)),
            eta: Arc::new(EtaTracker::new()),
            cfg,
        }
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn stale_cutoff(&self) -> i64 {
        chrono::Utc::now().timestamp() - self.cfg.stale_days * 86_400
    }

    /// The NEW state: resolve the username and make sure the user's own
    /// collection is current, committed in one transaction. Returns the fan
    /// id the job is keyed by.
    pub async fn prepare_user(&self, username: &str) -> Result<i64> {
        let cutoff = self.stale_cutoff();
        if let Some(existing) = self.store.collector_by_username(username).await? {
            if self.store.collector_fresh(existing.fan_id, cutoff).await?
                && self.store.collection_size(existing.fan_id).await? > 0
            {
                debug!(username, fan_id = existing.fan_id, "Collection is fresh");
                return Ok(existing.fan_id);
            }
        }

        let (collector, items) = self.fetch_full_collection(username).await?;
        if items.len() < 2 {
            return Err(CrateDigError::CollectionTooSmall(username.to_string()));
        }
        let fan_id = collector.fan_id;
        let item_count = items.len();
        self.store.commit_collection(&collector, &items).await?;
        info!(username, fan_id, items = item_count, "Committed full collection");

        // The stage-1 counters are visible before the job task spawns; a
        // status poll between the two must not read the fresh collection as
        // already done.
        let stage1 = self.store.stage1_requirements(fan_id, cutoff).await?;
        self.start_stage(fan_id, Stage::Stage1, stage1.len() as i64).await?;
        Ok(fan_id)
    }

    /// Drive one job through both stages. Stage 1 fully drains before any
    /// stage-2 unit starts: stage-2 work is discovered by stage 1. Safe to
    /// re-run: requirements are recomputed from the store, so a fresh job
    /// finds nothing to do and lands straight on stage 3.
    pub async fn run_job(&self, fan_id: i64) -> Result<()> {
        let cutoff = self.stale_cutoff();
        // Any previous job's counters are superseded.
        self.store.delete_target(fan_id).await?;

        let stage1 = self.store.stage1_requirements(fan_id, cutoff).await?;
        self.store.enqueue_items(&stage1).await?;
        self.start_stage(fan_id, Stage::Stage1, stage1.len() as i64).await?;
        info!(fan_id, items = stage1.len(), "Stage 1 starting");
        self.drain_stage(fan_id, Stage::Stage1).await?;

        let stage2 = self.store.stage2_requirements(fan_id, cutoff).await?;
        self.store.enqueue_collectors(&stage2).await?;
        self.start_stage(fan_id, Stage::Stage2, stage2.len() as i64).await?;
        info!(fan_id, collectors = stage2.len(), "Stage 2 starting");
        self.drain_stage(fan_id, Stage::Stage2).await?;

        self.start_stage(fan_id, Stage::Done, 0).await?;
        info!(fan_id, "Crawl complete");
        Ok(())
    }

    /// Reset the target row for a new stage. Within the stage, updates go
    /// through `refresh_target` and `count_total` only grows.
    async fn start_stage(&self, fan_id: i64, stage: Stage, total: i64) -> Result<()> {
        self.store.delete_target(fan_id).await?;
        self.store
            .upsert_target(&CrawlTarget {
                fan_id,
                stage: stage.as_i64(),
                count_left: total,
                count_total: total,
                eta: self.eta.estimate_secs(stage, total),
            })
            .await
    }

    /// Recompute the counters after a processed unit.
    async fn refresh_target(&self, fan_id: i64, stage: Stage) -> Result<()> {
        let left = match stage {
            Stage::Stage1 => self.store.pending_job_items(fan_id).await?.len() as i64,
            Stage::Stage2 => self.store.pending_job_collectors(fan_id).await?.len() as i64,
            Stage::Done => 0,
        };
        self.store
            .upsert_target(&CrawlTarget {
                fan_id,
                stage: stage.as_i64(),
                count_left: left,
                count_total: left,
                eta: self.eta.estimate_secs(stage, left),
            })
            .await
    }

    /// Drain one stage with a pool of workers. The `JoinSet` is the stage
    /// barrier: this returns only after every in-flight unit has committed.
    async fn drain_stage(&self, fan_id: i64, stage: Stage) -> Result<()> {
        let claims: Arc<Mutex<HashSet<i64>>> = Arc::default();
        let mut workers = JoinSet::new();
        for worker in 0..self.cfg.stage_workers.max(1) {
            let orchestrator = self.clone();
            let claims = Arc::clone(&claims);
            workers.spawn(async move {
                orchestrator.stage_worker(fan_id, stage, claims, worker).await
            });
        }
        while let Some(joined) = workers.join_next().await {
            joined.expect("stage worker panicked")?;
        }
        Ok(())
    }

    async fn stage_worker(
        self,
        fan_id: i64,
        stage: Stage,
        claims: Arc<Mutex<HashSet<i64>>>,
        worker: usize,
    ) -> Result<()> {
        let mut backoff = self.cfg.backoff_base;
        loop {
            let Some(unit_id) = self.claim_unit(fan_id, stage, &claims).await? else {
                if claims.lock().await.is_empty() {
                    return Ok(());
                }
                // Peers are still in flight and may fail their units back
                // onto the queue; look again shortly.
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };

            let started = Instant::now();
            let outcome = match stage {
                Stage::Stage1 => self.process_item(unit_id).await,
                Stage::Stage2 | Stage::Done => self.process_collector(unit_id).await,
            };
            match outcome {
                Ok(()) => {
                    self.finish_unit(fan_id, stage, unit_id, false).await?;
                    self.eta.record(stage, started.elapsed());
                    backoff = self.cfg.backoff_base;
                }
                Err(err) if err.is_transient() => {
                    warn!(worker, unit_id, error = %err, "Transient failure, unit stays queued");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.cfg.backoff_cap);
                }
                Err(err) => {
                    warn!(worker, unit_id, error = %err, "Dropping unit");
                    self.finish_unit(fan_id, stage, unit_id, true).await?;
                }
            }
            claims.lock().await.remove(&unit_id);
        }
    }

    /// Atomically claim the next queued unit of this job. The claim set is
    /// held until the unit commits or fails, so no unit is processed twice
    /// concurrently; a crash simply leaves the row queued for the next run.
    async fn claim_unit(
        &self,
        fan_id: i64,
        stage: Stage,
        claims: &Mutex<HashSet<i64>>,
    ) -> Result<Option<i64>> {
        let pending = match stage {
            Stage::Stage1 => self.store.pending_job_items(fan_id).await?,
            Stage::Stage2 | Stage::Done => self.store.pending_job_collectors(fan_id).await?,
        };
        let mut claims = claims.lock().await;
        for unit_id in pending {
            if !claims.contains(&unit_id) {
                claims.insert(unit_id);
                return Ok(Some(unit_id));
            }
        }
        Ok(None)
    }

    /// Dequeue a unit after it completed or was dropped. Dropped units are
    /// stamped done anyway so the requirement queries stop reselecting them.
    async fn finish_unit(&self, fan_id: i64, stage: Stage, unit_id: i64, dropped: bool) -> Result<()> {
        match stage {
            Stage::Stage1 => {
                if dropped {
                    self.store.mark_item_done(unit_id).await?;
                }
                self.store.remove_item_from_queue(unit_id).await?;
            }
            Stage::Stage2 | Stage::Done => {
                if dropped {
                    self.store.mark_collector_done(unit_id).await?;
                }
                self.store.remove_collector_from_queue(unit_id).await?;
            }
        }
        self.refresh_target(fan_id, stage).await
    }

    /// Stage-1 unit: expand one item's "also collected by" listing. Each
    /// completed page commits its edges and the advanced resume token, so a
    /// transient failure mid-listing loses nothing: the item stays queued
    /// with the token set and the next attempt continues from it.
    pub async fn process_item(&self, item_id: i64) -> Result<()> {
        let Some(item) = self.store.get_item(item_id).await? else {
            return Err(CrateDigError::Gone(format!(
                "item {item_id} is no longer in the store"
            )));
        };

        let mut resume = item.token.clone();
        if resume.is_none() {
            // Fresh pass over the listing: the sampled edges from the last
            // crawl get re-seeded from scratch.
            self.store.clear_collected_by(item_id).await?;
        }

        let cutoff = self.stale_cutoff();
        loop {
            let page = {
                let _permit = self.fetch_slots.acquire().await.expect("fetch slots closed");
                self.fetcher.collectors_page(&item, resume.as_deref()).await?
            };

            let mut discovered = Vec::with_capacity(page.collectors.len());
            for collector in &page.collectors {
                self.store.upsert_collector(collector).await?;
                self.store.insert_collected_by(item_id, collector.fan_id).await?;
                discovered.push(collector.fan_id);
            }
            self.store.enqueue_stale_collectors(&discovered, cutoff).await?;
            self.store.recompute_also_collected_count(item_id).await?;

            match page.resume {
                Some(token) => {
                    self.store.set_item_token(item_id, &token).await?;
                    resume = Some(token);
                }
                None => break,
            }
        }

        self.store.mark_item_done(item_id).await
    }

    /// Stage-2 unit: fully enumerate one collector's collection and commit it
    /// in a single transaction. Pages are buffered; a partial collection is
    /// never visible in `collects`.
    pub async fn process_collector(&self, fan_id: i64) -> Result<()> {
        let Some(known) = self.store.get_collector(fan_id).await? else {
            return Err(CrateDigError::Gone(format!(
                "collector {fan_id} is no longer in the store"
            )));
        };
        if self.store.collector_fresh(fan_id, self.stale_cutoff()).await? {
            // Another job already refreshed this collection.
            return Ok(());
        }

        let (collector, items) = self.fetch_full_collection(&known.username).await?;
        self.store.commit_collection(&collector, &items).await
    }

    /// Enumerate a fan's entire collection, following resume tokens until the
    /// listing is exhausted. Pages are buffered in memory; the caller commits
    /// the complete set.
    async fn fetch_full_collection(&self, username: &str) -> Result<(Collector, Vec<Item>)> {
        let resolved = {
            let _permit = self.fetch_slots.acquire().await.expect("fetch slots closed");
            self.fetcher.resolve_fan(username).await?
        };
        let collector = resolved.collector;
        let mut items: Vec<Item> = resolved.page.items.into_iter().map(Item::canonical).collect();
        let mut resume = resolved.page.resume;

        while let Some(token) = resume {
            let page = {
                let _permit = self.fetch_slots.acquire().await.expect("fetch slots closed");
                self.fetcher.collection_page(collector.fan_id, &token).await?
            };
            items.extend(page.items.into_iter().map(Item::canonical));
            resume = page.resume;
        }

        // The album collapse can fold several tracks onto one release.
        items.sort_by_key(|item| item.item_id);
        items.dedup_by_key(|item| item.item_id);
        Ok((collector, items))
    }

    /// Opportunistic cache refresh: re-crawl the stalest known entity on a
    /// slow tick so future jobs start warm. Runs until the task is dropped.
    pub async fn run_background_refresh(self) -> Result<()> {
        let mut timer = tokio::time::interval(Duration::from_secs(3));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            timer.tick().await;
            let cutoff = self.stale_cutoff();
            if let Some(item_id) = self.store.stalest_item(cutoff).await? {
                if let Err(err) = self.process_item(item_id).await {
                    warn!(item_id, error = %err, "Background item refresh failed");
                    if !err.is_transient() {
                        self.store.mark_item_done(item_id).await?;
                    }
                }
                continue;
            }
            if let Some(fan_id) = self.store.stalest_collector(cutoff).await? {
                if let Err(err) = self.process_collector(fan_id).await {
                    warn!(fan_id, error = %err, "Background collector refresh failed");
                    if !err.is_transient() {
                        self.store.mark_collector_done(fan_id).await?;
                    }
                }
            }
        }
    }
}
