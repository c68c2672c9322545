//! Fetch seam for Bandcamp pages and pagination APIs.
//!
//! Everything the orchestrator needs from the outside world sits behind the
//! [`Fetcher`] trait, so the crawl loops are testable with a scripted mock,
//! no network involved. [`BandcampFetcher`] is the real implementation: fan pages and
//! item pages embed their payload as JSON blobs in element attributes, and
//! both listings paginate through JSON POST endpoints with opaque cursors.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use cratedig_common::{Collector, CrateDigError, Item, Result};

const BANDCAMP_BASE: &str = "https://bandcamp.com";

/// One page of a fan's own collection.
#[derive(Debug, Clone)]
pub struct CollectionPage {
    pub items: Vec<Item>,
    /// Present when more pages remain; feed back into `collection_page`.
    pub resume: Option<String>,
}

/// One page of an item's "also collected by" listing.
#[derive(Debug, Clone)]
pub struct CollectorsPage {
    pub collectors: Vec<Collector>,
    /// Present when more pages remain; feed back into `collectors_page`.
    pub resume: Option<String>,
}

/// Result of resolving a username: the fan identity plus the first
/// collection page.
#[derive(Debug, Clone)]
pub struct ResolvedFan {
    pub collector: Collector,
    pub page: CollectionPage,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Resolve a username to its fan identity and first collection page.
    /// Fails with `UnknownUser` when Bandcamp has no such fan.
    async fn resolve_fan(&self, username: &str) -> Result<ResolvedFan>;

    /// Fetch a further collection page using a resume token.
    async fn collection_page(&self, fan_id: i64, resume: &str) -> Result<CollectionPage>;

    /// Fetch one page of an item's collectors listing. `None` starts from
    /// the item page itself; `Some` continues from a prior page's cursor.
    async fn collectors_page(&self, item: &Item, resume: Option<&str>) -> Result<CollectorsPage>;
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct FanPageBlob {
    fan_data: Collector,
    collection_data: CollectionData,
    item_cache: ItemCache,
}

#[derive(Deserialize)]
struct CollectionData {
    last_token: Option<String>,
    item_count: i64,
    batch_size: i64,
}

#[derive(Deserialize)]
struct ItemCache {
    collection: HashMap<String, Item>,
}

#[derive(Deserialize)]
struct CollectionItemsResponse {
    items: Vec<Item>,
    more_available: bool,
}

#[derive(Deserialize)]
struct CollectorsBlob {
    thumbs: Vec<Collector>,
    more_thumbs_available: bool,
}

#[derive(Deserialize)]
struct CollectorsResponse {
    results: Vec<Collector>,
    more_available: bool,
}

/// The `bc-page-properties` meta blob on an item page; carries the identity
/// the thumbs endpoint paginates by.
#[derive(Deserialize)]
struct PageProperties {
    item_type: String,
    item_id: i64,
}

/// Opaque resume cursor for a collectors listing, persisted on the item row
/// between pages.
#[derive(Serialize, Deserialize)]
struct CollectorsCursor {
    token: String,
    tralbum_id: i64,
    tralbum_type: String,
}

// ---------------------------------------------------------------------------
// BandcampFetcher
// ---------------------------------------------------------------------------

pub struct BandcampFetcher {
    client: Client,
    page_size: u32,
}

impl BandcampFetcher {
    pub fn new(timeout: Duration, page_size: u32) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self { client, page_size }
    }

    async fn get_page(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CrateDigError::TransientFetch(e.to_string()))?;
        check_status(response.status(), url)?;
        response
            .text()
            .await
            .map_err(|e| CrateDigError::TransientFetch(e.to_string()))
    }

    async fn post_api(&self, url: &str, body: serde_json::Value) -> Result<String> {
        let response = self
            .client
            .post(url)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| CrateDigError::TransientFetch(e.to_string()))?;
        check_status(response.status(), url)?;
        response
            .text()
            .await
            .map_err(|e| CrateDigError::TransientFetch(e.to_string()))
    }
}

fn check_status(status: StatusCode, url: &str) -> Result<()> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(CrateDigError::TransientFetch(format!(
            "rate limited fetching {url}"
        )));
    }
    if status == StatusCode::NOT_FOUND {
        return Err(CrateDigError::Gone(format!("{url} returned 404")));
    }
    if status.is_server_error() {
        return Err(CrateDigError::TransientFetch(format!(
            "{url} returned {status}"
        )));
    }
    if !status.is_success() {
        return Err(CrateDigError::PageFormat(format!(
            "{url} returned unexpected status {status}"
        )));
    }
    Ok(())
}

/// Extract an attribute payload from the element matching
/// `key_attr="key_value"`, tolerating either attribute order.
fn attr_blob(html: &str, key_attr: &str, key_value: &str, target_attr: &str) -> Option<String> {
    let forward = format!(r#"{key_attr}="{key_value}"[^>]*{target_attr}="([^"]*)""#);
    let backward = format!(r#"{target_attr}="([^"]*)"[^>]*{key_attr}="{key_value}""#);
    for pattern in [forward, backward] {
        if let Some(caps) = Regex::new(&pattern).ok()?.captures(html) {
            return Some(unescape_attr(&caps[1]));
        }
    }
    None
}

/// Decode the HTML entity escapes Bandcamp uses inside attribute blobs.
fn unescape_attr(raw: &str) -> String {
    raw.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn is_bandcamp_url(raw: &str) -> bool {
    Url::parse(raw)
        .ok()
        .and_then(|url| url.host_str().map(|h| h.ends_with(".bandcamp.com")))
        .unwrap_or(false)
}

#[async_trait]
impl Fetcher for BandcampFetcher {
    async fn resolve_fan(&self, username: &str) -> Result<ResolvedFan> {
        let url = format!("{BANDCAMP_BASE}/{username}");
        let html = self.get_page(&url).await.map_err(|err| match err {
            CrateDigError::Gone(_) => CrateDigError::UnknownUser(username.to_string()),
            other => other,
        })?;

        let blob = attr_blob(&html, "id", "pagedata", "data-blob")
            .ok_or_else(|| CrateDigError::PageFormat(format!("{url} has no pagedata blob")))?;
        let parsed: FanPageBlob = serde_json::from_str(&blob)?;

        let items: Vec<Item> = parsed.item_cache.collection.into_values().collect();
        let more = parsed.collection_data.item_count > parsed.collection_data.batch_size;
        let resume = if more {
            parsed.collection_data.last_token
        } else {
            None
        };
        Ok(ResolvedFan {
            collector: parsed.fan_data,
            page: CollectionPage { items, resume },
        })
    }

    async fn collection_page(&self, fan_id: i64, resume: &str) -> Result<CollectionPage> {
        let body = json!({
            "count": self.page_size,
            "fan_id": fan_id,
            "older_than_token": resume,
        });
        let text = self
            .post_api(
                &format!("{BANDCAMP_BASE}/api/fancollection/1/collection_items"),
                body,
            )
            .await?;
        let parsed: CollectionItemsResponse = serde_json::from_str(&text)?;

        let resume = if parsed.more_available {
            parsed.items.iter().rev().find_map(|item| item.token.clone())
        } else {
            None
        };
        Ok(CollectionPage {
            items: parsed.items,
            resume,
        })
    }

    async fn collectors_page(&self, item: &Item, resume: Option<&str>) -> Result<CollectorsPage> {
        if !is_bandcamp_url(&item.item_url) {
            return Err(CrateDigError::Gone(format!(
                "{} is not a bandcamp release page",
                item.item_url
            )));
        }

        if let Some(cursor) = resume {
            let mut cursor: CollectorsCursor = serde_json::from_str(cursor).map_err(|_| {
                CrateDigError::PageFormat(format!("bad resume cursor for item {}", item.item_id))
            })?;
            let body = json!({
                "count": self.page_size,
                "token": cursor.token,
                "tralbum_id": cursor.tralbum_id,
                "tralbum_type": cursor.tralbum_type,
            });
            let text = self
                .post_api(
                    &format!("{BANDCAMP_BASE}/api/tralbumcollectors/2/thumbs"),
                    body,
                )
                .await?;
            let parsed: CollectorsResponse = serde_json::from_str(&text)?;

            let resume = if parsed.more_available {
                if let Some(token) = parsed.results.iter().rev().find_map(|c| c.token.clone()) {
                    cursor.token = token;
                }
                Some(serde_json::to_string(&cursor)?)
            } else {
                None
            };
            return Ok(CollectorsPage {
                collectors: parsed.results,
                resume,
            });
        }

        let html = self.get_page(&item.item_url).await?;
        let Some(blob) = attr_blob(&html, "id", "collectors-data", "data-blob") else {
            // Subscription pages carry their own collectors element with no
            // scrapeable listing behind it.
            return Err(
                if html.contains("subscription-collectors-data") {
                    CrateDigError::Gone(format!(
                        "{} is a subscription page with no collectors listing",
                        item.item_url
                    ))
                } else {
                    CrateDigError::PageFormat(format!(
                        "{} has no collectors-data blob",
                        item.item_url
                    ))
                },
            );
        };
        let parsed: CollectorsBlob = serde_json::from_str(&blob)?;

        let resume = if parsed.more_thumbs_available {
            let props = attr_blob(&html, "name", "bc-page-properties", "content").ok_or_else(
                || {
                    CrateDigError::PageFormat(format!(
                        "{} has no bc-page-properties meta",
                        item.item_url
                    ))
                },
            )?;
            let props: PageProperties = serde_json::from_str(&props)?;
            let token = parsed
                .thumbs
                .iter()
                .rev()
                .find_map(|c| c.token.clone())
                .unwrap_or_default();
            Some(serde_json::to_string(&CollectorsCursor {
                token,
                tralbum_id: props.item_id,
                tralbum_type: props.item_type,
            })?)
        } else {
            None
        };
        Ok(CollectorsPage {
            collectors: parsed.thumbs,
            resume,
        })
    }
}
