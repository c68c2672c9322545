// SQLite persistence for the collection graph. All durable crawl state
// (entities, edges, queues, progress targets) lives here, so a process
// restart resumes from the tables alone.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::QueryBuilder;

use cratedig_common::{Collector, CrawlTarget, Item, Result};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Clone)]
pub struct GraphStore {
    pool: SqlitePool,
}

impl GraphStore {
    /// Open (creating if missing) the database at `database_url`.
    /// Foreign keys are enabled on every connection; cascading deletes are
    /// how a stale entity's downstream edges are purged atomically.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory store. `:memory:` databases exist per
    /// connection, so the pool must not grow past one.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }

    // --- Entities ---

    /// Idempotent insert-or-update by item id. A stored resume token survives
    /// rediscovery unless it was NULL. The wire-provided popularity only
    /// seeds brand-new rows; once a row exists its count belongs to the
    /// edge-recompute path.
    pub async fn upsert_item(&self, item: &Item) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO item
                (item_id, item_type, item_title, item_url, band_id, band_name,
                 token, also_collected_count, last_updated)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT (item_id) DO UPDATE SET
                item_title = excluded.item_title,
                item_url = excluded.item_url,
                band_name = excluded.band_name,
                token = CASE WHEN token IS NULL THEN excluded.token ELSE token END
            "#,
        )
        .bind(item.item_id)
        .bind(item.item_type)
        .bind(&item.item_title)
        .bind(&item.item_url)
        .bind(item.band_id)
        .bind(&item.band_name)
        .bind(&item.token)
        .bind(item.also_collected_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Idempotent insert-or-update by fan id, same token rule as items.
    pub async fn upsert_collector(&self, collector: &Collector) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collector (fan_id, username, name, token, last_updated)
            VALUES (?, ?, ?, ?, 0)
            ON CONFLICT (fan_id) DO UPDATE SET
                username = excluded.username,
                name = excluded.name,
                token = CASE WHEN token IS NULL THEN excluded.token ELSE token END
            "#,
        )
        .bind(collector.fan_id)
        .bind(&collector.username)
        .bind(&collector.name)
        .bind(&collector.token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_item(&self, item_id: i64) -> Result<Option<Item>> {
        let row = sqlx::query_as::<_, Item>(
            "SELECT item_id, item_type, item_title, item_url, band_id, band_name, \
             token, also_collected_count FROM item WHERE item_id = ?",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_collector(&self, fan_id: i64) -> Result<Option<Collector>> {
        let row = sqlx::query_as::<_, Collector>(
            "SELECT fan_id, username, name, token FROM collector WHERE fan_id = ?",
        )
        .bind(fan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn collector_by_username(&self, username: &str) -> Result<Option<Collector>> {
        let row = sqlx::query_as::<_, Collector>(
            "SELECT fan_id, username, name, token FROM collector WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn fan_id_for_username(&self, username: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>("SELECT fan_id FROM collector WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// Whether the collector's collection was fully crawled at or after the
    /// staleness cutoff.
    pub async fn collector_fresh(&self, fan_id: i64, cutoff: i64) -> Result<bool> {
        let fresh = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM collector WHERE fan_id = ? AND last_updated >= ?",
        )
        .bind(fan_id)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(fresh > 0)
    }

    pub async fn collection_size(&self, fan_id: i64) -> Result<i64> {
        let size = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM collects WHERE fan_id = ?")
            .bind(fan_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(size)
    }

    /// Remove an item entirely; cascades its edges.
    pub async fn purge_item(&self, item_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM item WHERE item_id = ?")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a collector entirely; cascades its edges.
    pub async fn purge_collector(&self, fan_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM collector WHERE fan_id = ?")
            .bind(fan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Edges ---

    /// Record that `fan_id` was observed collecting `item_id`. Returns true
    /// if the edge was new.
    pub async fn insert_collected_by(&self, item_id: i64, fan_id: i64) -> Result<bool> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO collected_by (item_id, fan_id) VALUES (?, ?)")
                .bind(item_id)
                .bind(fan_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Distinct observed collectors for an item.
    pub async fn collected_by_count(&self, item_id: i64) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM collected_by WHERE item_id = ?")
                .bind(item_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Drop an item's observed edges ahead of a stale re-crawl, so the fresh
    /// listing re-seeds them from scratch.
    pub async fn clear_collected_by(&self, item_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM collected_by WHERE item_id = ?")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Recompute `also_collected_count` as the exact distinct-edge count.
    /// Edges only accumulate while a listing is being expanded, so the value
    /// never decreases within a job; a staleness re-crawl purges the edges
    /// first and re-observes from scratch.
    pub async fn recompute_also_collected_count(&self, item_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE item
            SET also_collected_count =
                (SELECT COUNT(*) FROM collected_by WHERE item_id = ?1)
            WHERE item_id = ?1
            RETURNING also_collected_count
            "#,
        )
        .bind(item_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Atomically publish a fully-enumerated collection: upsert the collector
    /// and its items, replace the fan's `collects` rows wholesale, and stamp
    /// the collector fresh. This is the only writer of `collects`; partial
    /// collections are never visible.
    pub async fn commit_collection(&self, collector: &Collector, items: &[Item]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO collector (fan_id, username, name, token, last_updated)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (fan_id) DO UPDATE SET
                username = excluded.username,
                name = excluded.name,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(collector.fan_id)
        .bind(&collector.username)
        .bind(&collector.name)
        .bind(&collector.token)
        .bind(now())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM collects WHERE fan_id = ?")
            .bind(collector.fan_id)
            .execute(&mut *tx)
            .await?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO item
                    (item_id, item_type, item_title, item_url, band_id, band_name,
                     token, also_collected_count, last_updated)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
                ON CONFLICT (item_id) DO UPDATE SET
                    item_title = excluded.item_title,
                    item_url = excluded.item_url,
                    band_name = excluded.band_name,
                    token = CASE WHEN token IS NULL THEN excluded.token ELSE token END
                "#,
            )
            .bind(item.item_id)
            .bind(item.item_type)
            .bind(&item.item_title)
            .bind(&item.item_url)
            .bind(item.band_id)
            .bind(&item.band_name)
            .bind(&item.token)
            .bind(item.also_collected_count)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT OR IGNORE INTO collects (fan_id, item_id) VALUES (?, ?)")
                .bind(collector.fan_id)
                .bind(item.item_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        tracing::debug!(
            fan_id = collector.fan_id,
            items = items.len(),
            "Committed collection"
        );
        Ok(())
    }

    // --- Item crawl lifecycle ---

    /// Persist the resume token of a partially-fetched collectors listing.
    pub async fn set_item_token(&self, item_id: i64, token: &str) -> Result<()> {
        sqlx::query("UPDATE item SET token = ? WHERE item_id = ?")
            .bind(token)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark an item's collectors listing complete: clear the resume token and
    /// stamp it fresh.
    pub async fn mark_item_done(&self, item_id: i64) -> Result<()> {
        sqlx::query("UPDATE item SET token = NULL, last_updated = ? WHERE item_id = ?")
            .bind(now())
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stamp a collector fresh without touching its collection. Used when a
    /// vanished collector is dropped from the queue so requirement queries
    /// stop reselecting it.
    pub async fn mark_collector_done(&self, fan_id: i64) -> Result<()> {
        sqlx::query("UPDATE collector SET last_updated = ? WHERE fan_id = ?")
            .bind(now())
            .bind(fan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Queues ---

    pub async fn enqueue_items(&self, item_ids: &[i64]) -> Result<()> {
        for id in item_ids {
            sqlx::query("INSERT OR IGNORE INTO item_collected_by_queue (item_id) VALUES (?)")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn enqueue_collectors(&self, fan_ids: &[i64]) -> Result<()> {
        for id in fan_ids {
            sqlx::query("INSERT OR IGNORE INTO collector_collection_queue (fan_id) VALUES (?)")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Enqueue only the given collectors that are stale. Used while stage 1
    /// discovers collectors page by page.
    pub async fn enqueue_stale_collectors(&self, fan_ids: &[i64], cutoff: i64) -> Result<()> {
        for id in fan_ids {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO collector_collection_queue (fan_id)
                SELECT fan_id FROM collector WHERE fan_id = ? AND last_updated < ?
                "#,
            )
            .bind(id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn remove_item_from_queue(&self, item_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM item_collected_by_queue WHERE item_id = ?")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_collector_from_queue(&self, fan_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM collector_collection_queue WHERE fan_id = ?")
            .bind(fan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Queued items belonging to this job: the intersection of the item queue
    /// with the requesting fan's collection.
    pub async fn pending_job_items(&self, fan_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT item_id FROM item_collected_by_queue
            WHERE item_id IN (SELECT item_id FROM collects WHERE fan_id = ?)
            ORDER BY item_id
            "#,
        )
        .bind(fan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Queued collectors belonging to this job: the intersection of the
    /// collector queue with collectors observed on the fan's items.
    pub async fn pending_job_collectors(&self, fan_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT fan_id FROM collector_collection_queue
            WHERE fan_id IN (
                SELECT DISTINCT fan_id FROM collected_by
                WHERE item_id IN (SELECT item_id FROM collects WHERE fan_id = ?)
            )
            ORDER BY fan_id
            "#,
        )
        .bind(fan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Stalest known item beyond the cutoff, for opportunistic background
    /// refresh. Queued items are skipped; they are active job work.
    pub async fn stalest_item(&self, cutoff: i64) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT item_id FROM item
            WHERE last_updated < ?
              AND item_id NOT IN (SELECT item_id FROM item_collected_by_queue)
            ORDER BY last_updated, item_id
            LIMIT 1
            "#,
        )
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Stalest known collector beyond the cutoff, skipping queued ones.
    pub async fn stalest_collector(&self, cutoff: i64) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT fan_id FROM collector
            WHERE last_updated < ?
              AND fan_id NOT IN (SELECT fan_id FROM collector_collection_queue)
            ORDER BY last_updated, fan_id
            LIMIT 1
            "#,
        )
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    // --- Staleness requirements ---

    /// Stage-1 work for a job: items in the fan's collection whose collectors
    /// listing is stale.
    pub async fn stage1_requirements(&self, fan_id: i64, cutoff: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT c.item_id FROM collects c
            JOIN item i ON i.item_id = c.item_id
            WHERE c.fan_id = ? AND i.last_updated < ?
            ORDER BY c.item_id
            "#,
        )
        .bind(fan_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Stage-2 work for a job: collectors observed on the fan's items whose
    /// own collection is stale. The requesting fan is excluded; their
    /// collection was refreshed when the job started.
    pub async fn stage2_requirements(&self, fan_id: i64, cutoff: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT DISTINCT cb.fan_id FROM collected_by cb
            JOIN collector co ON co.fan_id = cb.fan_id
            WHERE cb.item_id IN (SELECT item_id FROM collects WHERE fan_id = ?1)
              AND cb.fan_id <> ?1
              AND co.last_updated < ?2
            ORDER BY cb.fan_id
            "#,
        )
        .bind(fan_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    // --- Progress targets ---

    /// Upsert a job's progress counters. `count_total` only ever grows within
    /// a job; restarting a job deletes the row first.
    pub async fn upsert_target(&self, target: &CrawlTarget) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collection_target (fan_id, stage, count_left, count_total, eta)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (fan_id) DO UPDATE SET
                stage = excluded.stage,
                count_left = excluded.count_left,
                count_total = CASE
                    WHEN excluded.count_total > count_total THEN excluded.count_total
                    ELSE count_total
                END,
                eta = excluded.eta
            "#,
        )
        .bind(target.fan_id)
        .bind(target.stage)
        .bind(target.count_left)
        .bind(target.count_total)
        .bind(target.eta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_target(&self, fan_id: i64) -> Result<Option<CrawlTarget>> {
        let row = sqlx::query_as::<_, CrawlTarget>(
            "SELECT fan_id, stage, count_left, count_total, eta \
             FROM collection_target WHERE fan_id = ?",
        )
        .bind(fan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn delete_target(&self, fan_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM collection_target WHERE fan_id = ?")
            .bind(fan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Scorer reads ---

    /// The fan's own (complete) collection.
    pub async fn user_item_ids(&self, fan_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT item_id FROM collects WHERE fan_id = ?")
            .bind(fan_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Every (fan, item) edge, complete or observed, belonging to a
    /// collector who shares at least one item with the requesting fan.
    pub async fn neighbor_edges(&self, fan_id: i64) -> Result<Vec<(i64, i64)>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            r#"
            WITH edges (fan_id, item_id) AS (
                SELECT fan_id, item_id FROM collects
                UNION
                SELECT fan_id, item_id FROM collected_by
            )
            SELECT e.fan_id, e.item_id FROM edges e
            WHERE e.fan_id IN (
                SELECT DISTINCT fan_id FROM edges
                WHERE item_id IN (SELECT item_id FROM collects WHERE fan_id = ?1)
                  AND fan_id <> ?1
            )
            "#,
        )
        .bind(fan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Hydrate item rows for a candidate id set.
    pub async fn items_by_ids(&self, item_ids: &[i64]) -> Result<Vec<Item>> {
        let mut items = Vec::with_capacity(item_ids.len());
        for chunk in item_ids.chunks(500) {
            let mut qb = QueryBuilder::<sqlx::Sqlite>::new(
                "SELECT item_id, item_type, item_title, item_url, band_id, band_name, \
                 token, also_collected_count FROM item WHERE item_id IN (",
            );
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            qb.push(")");
            let rows = qb.build_query_as::<Item>().fetch_all(&self.pool).await?;
            items.extend(rows);
        }
        Ok(items)
    }
}
