//! End-to-end crawl tests: a scripted fetcher drives the orchestrator
//! against an in-memory store, covering stage ordering, resumable partial
//! listings, retry behavior, and idempotent re-runs.

use std::sync::Arc;
use std::time::Duration;

use cratedig_common::CrateDigError;
use cratedig_crawler::jobs::{JobRegistry, JobStart};
use cratedig_crawler::orchestrator::{CrawlConfig, Orchestrator};
use cratedig_crawler::progress::status_for;
use cratedig_crawler::testing::{test_collector, test_item, FetchEvent, MockFetcher};
use cratedig_graph::testutil::memory_store;
use cratedig_graph::GraphStore;

fn crawl_config() -> CrawlConfig {
    CrawlConfig {
        stale_days: 30,
        stage_workers: 2,
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(40),
    }
}

async fn orchestrator(
    fetcher: MockFetcher,
) -> (Orchestrator<MockFetcher>, Arc<MockFetcher>, GraphStore) {
    let store = memory_store().await;
    let fetcher = Arc::new(fetcher);
    let orch = Orchestrator::new(store.clone(), Arc::clone(&fetcher), 4, crawl_config());
    (orch, fetcher, store)
}

fn recent_cutoff() -> i64 {
    chrono::Utc::now().timestamp() - 60
}

/// alice (fan 1) collected items 10 and 11; bob (fan 2) shows up on item
/// 10's listing and himself collected items 10 and 30.
fn alice_and_bob() -> MockFetcher {
    MockFetcher::new()
        .on_fan(
            test_collector(1, "alice"),
            vec![vec![test_item(10, "A"), test_item(11, "B")]],
        )
        .on_fan(
            test_collector(2, "bob"),
            vec![vec![test_item(10, "A"), test_item(30, "C")]],
        )
        .on_listing(10, vec![vec![test_collector(2, "bob")]])
        .on_listing(11, vec![vec![]])
}

#[tokio::test]
async fn full_crawl_completes_and_stage1_precedes_stage2() {
    let (orch, fetcher, store) = orchestrator(alice_and_bob()).await;

    let fan_id = orch.prepare_user("alice").await.expect("prepare");
    assert_eq!(fan_id, 1);
    orch.run_job(fan_id).await.expect("job");

    let target = store.get_target(1).await.expect("read").expect("target");
    assert_eq!(target.stage, 3);
    assert_eq!(target.count_left, 0);

    // Bob's full collection was committed during stage 2.
    assert_eq!(store.collection_size(2).await.expect("size"), 2);

    // Popularity tracks the observed edges.
    let item = store.get_item(10).await.expect("read").expect("item");
    assert_eq!(item.also_collected_count, 1);

    // Every listing expansion happened before bob's collection crawl.
    let events = fetcher.events();
    let last_listing = events
        .iter()
        .rposition(|e| matches!(e, FetchEvent::CollectorsPage(_)))
        .expect("listings fetched");
    let bob_resolved = events
        .iter()
        .position(|e| matches!(e, FetchEvent::ResolveFan(u) if u == "bob"))
        .expect("bob resolved");
    assert!(
        last_listing < bob_resolved,
        "stage 1 must fully drain before stage 2 starts"
    );

    // Nothing left queued for this job.
    assert!(store.pending_job_items(1).await.expect("items").is_empty());
    assert!(store.pending_job_collectors(1).await.expect("fans").is_empty());
}

#[tokio::test]
async fn partial_listing_resumes_from_the_persisted_token() {
    let fetcher = MockFetcher::new()
        .on_fan(
            test_collector(1, "alice"),
            vec![vec![test_item(10, "A"), test_item(11, "B")]],
        )
        .on_listing(
            10,
            vec![vec![test_collector(2, "bob")], vec![test_collector(3, "carol")]],
        )
        .fail_listing_resume(10, 1);
    let (orch, _fetcher, store) = orchestrator(fetcher).await;

    orch.prepare_user("alice").await.expect("prepare");
    store.enqueue_items(&[10]).await.expect("enqueue");

    let err = orch.process_item(10).await.expect_err("second page fails");
    assert!(err.is_transient());

    // The completed first page is committed: edge written, token persisted,
    // item still queued and still stale.
    let item = store.get_item(10).await.expect("read").expect("item");
    assert_eq!(item.token.as_deref(), Some("page:1"));
    assert_eq!(store.collected_by_count(10).await.expect("count"), 1);
    assert_eq!(store.pending_job_items(1).await.expect("pending"), vec![10]);
    assert!(!store
        .stage1_requirements(1, recent_cutoff())
        .await
        .expect("reqs")
        .is_empty());

    // The retry picks up from the token instead of restarting the listing.
    orch.process_item(10).await.expect("resume");
    let item = store.get_item(10).await.expect("read").expect("item");
    assert!(item.token.is_none());
    assert_eq!(store.collected_by_count(10).await.expect("count"), 2);
}

#[tokio::test]
async fn transient_stage2_failures_retry_until_success() {
    let fetcher = alice_and_bob().fail_fan("bob", 2);
    let (orch, fetcher, store) = orchestrator(fetcher).await;

    let fan_id = orch.prepare_user("alice").await.expect("prepare");
    orch.run_job(fan_id).await.expect("job survives transients");

    assert_eq!(fetcher.resolve_count("bob"), 3);
    assert_eq!(store.collection_size(2).await.expect("size"), 2);
}

#[tokio::test]
async fn rerunning_a_fresh_job_fetches_nothing_and_changes_nothing() {
    let (orch, fetcher, store) = orchestrator(alice_and_bob()).await;

    let fan_id = orch.prepare_user("alice").await.expect("prepare");
    orch.run_job(fan_id).await.expect("job");

    let events_before = fetcher.events().len();
    let edges_before = store.collected_by_count(10).await.expect("count");

    let fan_id = orch.prepare_user("alice").await.expect("prepare again");
    orch.run_job(fan_id).await.expect("idempotent job");

    assert_eq!(fetcher.events().len(), events_before);
    assert_eq!(store.collected_by_count(10).await.expect("count"), edges_before);
    let target = store.get_target(1).await.expect("read").expect("target");
    assert_eq!(target.stage, 3);
}

#[tokio::test]
async fn failed_collection_crawls_leave_no_partial_rows() {
    let fetcher = MockFetcher::new()
        .on_fan(
            test_collector(2, "bob"),
            vec![vec![test_item(10, "A")], vec![test_item(30, "C")]],
        )
        .fail_collection(2, 1);
    let (orch, _fetcher, store) = orchestrator(fetcher).await;
    store
        .upsert_collector(&test_collector(2, "bob"))
        .await
        .expect("seed");

    let err = orch.process_collector(2).await.expect_err("page 2 fails");
    assert!(err.is_transient());
    assert_eq!(
        store.collection_size(2).await.expect("size"),
        0,
        "a partial collection must never reach collects"
    );

    orch.process_collector(2).await.expect("retry");
    assert_eq!(store.collection_size(2).await.expect("size"), 2);
}

#[tokio::test]
async fn unknown_user_is_surfaced_by_prepare_and_status() {
    let (orch, _fetcher, store) = orchestrator(MockFetcher::new()).await;

    let err = orch.prepare_user("ghost").await.expect_err("unknown");
    assert!(matches!(err, CrateDigError::UnknownUser(_)));

    let err = status_for(&store, "ghost", recent_cutoff())
        .await
        .expect_err("no job");
    assert!(matches!(err, CrateDigError::UnknownUser(_)));
}

#[tokio::test]
async fn tiny_collections_are_rejected() {
    let fetcher = MockFetcher::new().on_fan(
        test_collector(5, "mini"),
        vec![vec![test_item(10, "Only One")]],
    );
    let (orch, _fetcher, _store) = orchestrator(fetcher).await;

    let err = orch.prepare_user("mini").await.expect_err("too small");
    assert!(matches!(err, CrateDigError::CollectionTooSmall(_)));
}

#[tokio::test]
async fn unscrapeable_items_are_dropped_without_stalling_the_job() {
    // Item 11 has no listing behind it; the unit is dropped and the job
    // still reaches stage 3.
    let fetcher = MockFetcher::new()
        .on_fan(
            test_collector(1, "alice"),
            vec![vec![test_item(10, "A"), test_item(11, "B")]],
        )
        .on_fan(
            test_collector(2, "bob"),
            vec![vec![test_item(10, "A"), test_item(30, "C")]],
        )
        .on_listing(10, vec![vec![test_collector(2, "bob")]]);
    let (orch, _fetcher, store) = orchestrator(fetcher).await;

    let fan_id = orch.prepare_user("alice").await.expect("prepare");
    orch.run_job(fan_id).await.expect("job");

    let target = store.get_target(1).await.expect("read").expect("target");
    assert_eq!(target.stage, 3);
    // The dropped item is stamped so requirement queries stop reselecting it.
    assert!(store
        .stage1_requirements(1, recent_cutoff())
        .await
        .expect("reqs")
        .is_empty());
}

#[tokio::test]
async fn multi_page_collections_are_buffered_and_collapsed() {
    let mut track = test_item(40, "Song");
    track.album_id = Some(41);
    track.album_title = Some("The Album".into());

    let fetcher = MockFetcher::new().on_fan(
        test_collector(1, "alice"),
        vec![vec![test_item(10, "A")], vec![test_item(11, "B"), track]],
    );
    let (orch, fetcher, store) = orchestrator(fetcher).await;

    orch.prepare_user("alice").await.expect("prepare");

    let ids = store.user_item_ids(1).await.expect("ids");
    assert_eq!(ids.len(), 3);
    assert!(ids.contains(&41), "track entries collapse onto their album");
    assert!(!ids.contains(&40));
    let album = store.get_item(41).await.expect("read").expect("album row");
    assert_eq!(album.item_title, "The Album");

    assert_eq!(fetcher.resolve_count("alice"), 1);
    let collection_pages = fetcher
        .events()
        .iter()
        .filter(|e| matches!(e, FetchEvent::CollectionPage(1)))
        .count();
    assert_eq!(collection_pages, 1);
}

#[tokio::test]
async fn status_reports_done_for_fresh_users_without_a_target_row() {
    let (orch, _fetcher, store) = orchestrator(alice_and_bob()).await;
    let fan_id = orch.prepare_user("alice").await.expect("prepare");
    orch.run_job(fan_id).await.expect("job");

    let live = status_for(&store, "alice", recent_cutoff()).await.expect("status");
    assert_eq!(live.stage, 3);

    store.delete_target(1).await.expect("delete");
    let synthesized = status_for(&store, "alice", recent_cutoff())
        .await
        .expect("status");
    assert_eq!(synthesized.stage, 3);
    assert_eq!(synthesized.count_left, 0);
}

#[tokio::test]
async fn registry_keeps_one_job_per_fan_and_restarts_finished_ones() {
    // Slow the job down with transient failures so the second request
    // observably attaches to the running job.
    let fetcher = alice_and_bob().fail_fan("bob", 2);
    let (orch, _fetcher, store) = orchestrator(fetcher).await;
    let registry = JobRegistry::new();

    let fan_id = orch.prepare_user("alice").await.expect("prepare");
    let first = registry.start_or_attach(orch.clone(), fan_id).await;
    let second = registry.start_or_attach(orch.clone(), fan_id).await;
    assert_eq!(first, JobStart::Started);
    assert_eq!(second, JobStart::Attached);

    registry.wait_for(fan_id).await;
    assert!(!registry.is_active(fan_id).await);
    assert_eq!(store.collection_size(2).await.expect("size"), 2);

    // A finished job can be started again.
    let third = registry.start_or_attach(orch, fan_id).await;
    assert_eq!(third, JobStart::Started);
    registry.wait_for(fan_id).await;
}
