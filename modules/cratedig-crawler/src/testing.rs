// Test doubles for the crawl pipeline.
//
// MockFetcher scripts fan collections and collectors listings as page
// sequences, hands out "page:N" resume tokens, optionally injects transient
// failures, and records every call so tests can assert fetch ordering.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use cratedig_common::{Collector, CrateDigError, Item, ItemType, Result};

use crate::fetcher::{CollectionPage, CollectorsPage, Fetcher, ResolvedFan};

/// What the mock was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    ResolveFan(String),
    CollectionPage(i64),
    CollectorsPage(i64),
}

#[derive(Default)]
struct MockState {
    fans: HashMap<String, (Collector, Vec<Vec<Item>>)>,
    fans_by_id: HashMap<i64, String>,
    listings: HashMap<i64, Vec<Vec<Collector>>>,
    fail_fan: HashMap<String, u32>,
    fail_collection: HashMap<i64, u32>,
    fail_listing_resume: HashMap<i64, u32>,
    events: Vec<FetchEvent>,
}

#[derive(Default)]
pub struct MockFetcher {
    state: Mutex<MockState>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fan and their collection, split into pages.
    pub fn on_fan(self, collector: Collector, pages: Vec<Vec<Item>>) -> Self {
        {
            let mut state = self.state.lock().expect("mock state");
            state.fans_by_id.insert(collector.fan_id, collector.username.clone());
            state.fans.insert(collector.username.clone(), (collector, pages));
        }
        self
    }

    /// Register an item's collectors listing, split into pages.
    pub fn on_listing(self, item_id: i64, pages: Vec<Vec<Collector>>) -> Self {
        self.state
            .lock()
            .expect("mock state")
            .listings
            .insert(item_id, pages);
        self
    }

    /// Fail the next `times` fan-page fetches for `username` transiently.
    pub fn fail_fan(self, username: &str, times: u32) -> Self {
        self.state
            .lock()
            .expect("mock state")
            .fail_fan
            .insert(username.to_string(), times);
        self
    }

    /// Fail the next `times` collection-page fetches for `fan_id` transiently.
    pub fn fail_collection(self, fan_id: i64, times: u32) -> Self {
        self.state
            .lock()
            .expect("mock state")
            .fail_collection
            .insert(fan_id, times);
        self
    }

    /// Fail the next `times` resumed listing fetches for `item_id`
    /// transiently. The initial page still succeeds, simulating a listing
    /// that breaks partway through.
    pub fn fail_listing_resume(self, item_id: i64, times: u32) -> Self {
        self.state
            .lock()
            .expect("mock state")
            .fail_listing_resume
            .insert(item_id, times);
        self
    }

    /// Every call made so far, in order.
    pub fn events(&self) -> Vec<FetchEvent> {
        self.state.lock().expect("mock state").events.clone()
    }

    /// How many times `username` was resolved.
    pub fn resolve_count(&self, username: &str) -> usize {
        self.state
            .lock()
            .expect("mock state")
            .events
            .iter()
            .filter(|e| matches!(e, FetchEvent::ResolveFan(u) if u == username))
            .count()
    }
}

fn page_index(resume: &str) -> usize {
    resume.strip_prefix("page:").and_then(|n| n.parse().ok()).unwrap_or(0)
}

fn next_token(index: usize, page_count: usize) -> Option<String> {
    (index + 1 < page_count).then(|| format!("page:{}", index + 1))
}

fn take_failure(counter: &mut HashMap<String, u32>, key: &str) -> bool {
    match counter.get_mut(key) {
        Some(left) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    }
}

fn take_failure_id(counter: &mut HashMap<i64, u32>, key: i64) -> bool {
    match counter.get_mut(&key) {
        Some(left) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn resolve_fan(&self, username: &str) -> Result<ResolvedFan> {
        let mut state = self.state.lock().expect("mock state");
        state.events.push(FetchEvent::ResolveFan(username.to_string()));
        if take_failure(&mut state.fail_fan, username) {
            return Err(CrateDigError::TransientFetch(format!(
                "scripted failure resolving {username}"
            )));
        }
        let Some((collector, pages)) = state.fans.get(username) else {
            return Err(CrateDigError::UnknownUser(username.to_string()));
        };
        let items = pages.first().cloned().unwrap_or_default();
        Ok(ResolvedFan {
            collector: collector.clone(),
            page: CollectionPage {
                items,
                resume: next_token(0, pages.len()),
            },
        })
    }

    async fn collection_page(&self, fan_id: i64, resume: &str) -> Result<CollectionPage> {
        let mut state = self.state.lock().expect("mock state");
        state.events.push(FetchEvent::CollectionPage(fan_id));
        if take_failure_id(&mut state.fail_collection, fan_id) {
            return Err(CrateDigError::TransientFetch(format!(
                "scripted failure paging fan {fan_id}"
            )));
        }
        let Some(username) = state.fans_by_id.get(&fan_id).cloned() else {
            return Err(CrateDigError::Gone(format!("fan {fan_id} vanished")));
        };
        let (_, pages) = &state.fans[&username];
        let index = page_index(resume);
        Ok(CollectionPage {
            items: pages.get(index).cloned().unwrap_or_default(),
            resume: next_token(index, pages.len()),
        })
    }

    async fn collectors_page(&self, item: &Item, resume: Option<&str>) -> Result<CollectorsPage> {
        let mut state = self.state.lock().expect("mock state");
        state.events.push(FetchEvent::CollectorsPage(item.item_id));
        if resume.is_some() && take_failure_id(&mut state.fail_listing_resume, item.item_id) {
            return Err(CrateDigError::TransientFetch(format!(
                "scripted failure paging listing {}",
                item.item_id
            )));
        }
        let Some(pages) = state.listings.get(&item.item_id) else {
            return Err(CrateDigError::Gone(format!(
                "item {} has no listing",
                item.item_id
            )));
        };
        let index = resume.map(page_index).unwrap_or(0);
        Ok(CollectorsPage {
            collectors: pages.get(index).cloned().unwrap_or_default(),
            resume: next_token(index, pages.len()),
        })
    }
}

// ---------------------------------------------------------------------------
// Fixture helpers
// ---------------------------------------------------------------------------

pub fn test_item(item_id: i64, title: &str) -> Item {
    Item {
        item_id,
        item_type: ItemType::Album,
        item_title: title.into(),
        item_url: format!("https://band{item_id}.bandcamp.com/album/a{item_id}"),
        album_id: None,
        album_title: None,
        band_id: item_id * 10,
        band_name: format!("Band {item_id}"),
        token: None,
        also_collected_count: 0,
    }
}

pub fn test_collector(fan_id: i64, username: &str) -> Collector {
    Collector {
        fan_id,
        username: username.into(),
        name: username.to_uppercase(),
        token: None,
    }
}
