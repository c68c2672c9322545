//! Read-only progress reporting for polling clients.

use cratedig_common::{CrateDigError, CrawlTarget, Result};
use cratedig_graph::GraphStore;

/// Current stage and counts for a user's crawl. Stage 3 tells the caller to
/// stop polling and fetch recommendations instead. Never mutates: all queue
/// and counter writes happen in the orchestrator.
pub async fn status_for(store: &GraphStore, username: &str, cutoff: i64) -> Result<CrawlTarget> {
    let fan_id = store
        .fan_id_for_username(username)
        .await?
        .ok_or_else(|| CrateDigError::UnknownUser(username.to_string()))?;

    if let Some(target) = store.get_target(fan_id).await? {
        return Ok(target);
    }

    // No live job, but the graph around this user is fully crawled and
    // fresh: report done so the client moves on to recommendations.
    if store.collector_fresh(fan_id, cutoff).await? && store.collection_size(fan_id).await? > 0 {
        return Ok(CrawlTarget {
            fan_id,
            stage: 3,
            count_left: 0,
            count_total: 0,
            eta: 0,
        });
    }

    Err(CrateDigError::NoActiveJob(username.to_string()))
}
