use serde::{Deserialize, Serialize};

/// Kind of collectible release. Stored as lowercase text, matching the wire
/// values Bandcamp uses in its collection blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ItemType {
    Album,
    Track,
    Package,
    Lepledge,
    Subscription,
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemType::Album => write!(f, "album"),
            ItemType::Track => write!(f, "track"),
            ItemType::Package => write!(f, "package"),
            ItemType::Lepledge => write!(f, "lepledge"),
            ItemType::Subscription => write!(f, "subscription"),
        }
    }
}

/// A collectible release as it appears both on the wire and in the store.
///
/// `album_id`/`album_title` are only populated by collection fetches: a track
/// entry that belongs to an album carries its parent's identity there, and
/// [`Item::canonical`] collapses the entry onto the album before persistence.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Item {
    pub item_id: i64,
    pub item_type: ItemType,
    pub item_title: String,
    pub item_url: String,
    #[serde(default)]
    #[sqlx(default)]
    pub album_id: Option<i64>,
    #[serde(default)]
    #[sqlx(default)]
    pub album_title: Option<String>,
    pub band_id: i64,
    pub band_name: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub also_collected_count: i64,
}

impl Item {
    /// Collapse onto the parent album identity when present. Collection
    /// listings surface individual tracks of collected albums; the graph
    /// tracks the album.
    pub fn canonical(mut self) -> Item {
        if let Some(album_id) = self.album_id.take() {
            self.item_id = album_id;
        }
        if let Some(album_title) = self.album_title.take() {
            self.item_title = album_title;
        }
        self
    }
}

/// A Bandcamp fan.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Collector {
    pub fan_id: i64,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Crawl phase of a job. Stage 1 expands via items, stage 2 via collectors,
/// stage 3 means the graph around the user is stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Stage1,
    Stage2,
    Done,
}

impl Stage {
    pub fn as_i64(self) -> i64 {
        match self {
            Stage::Stage1 => 1,
            Stage::Stage2 => 2,
            Stage::Done => 3,
        }
    }
}

/// Progress record for one user-initiated crawl job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CrawlTarget {
    #[serde(skip_serializing, default)]
    pub fan_id: i64,
    pub stage: i64,
    pub count_left: i64,
    pub count_total: i64,
    /// Estimated seconds until the current stage drains.
    pub eta: i64,
}

/// One scored recommendation row, ready for the HTTP response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub item_title: String,
    pub item_url: String,
    pub band_name: String,
    pub also_collected_count: i64,
    /// Blended score, floor-truncated for display.
    pub score: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track_of_album() -> Item {
        Item {
            item_id: 11,
            item_type: ItemType::Track,
            item_title: "Opening Track".into(),
            item_url: "https://band.bandcamp.com/album/full-length".into(),
            album_id: Some(100),
            album_title: Some("Full Length".into()),
            band_id: 7,
            band_name: "Band".into(),
            token: None,
            also_collected_count: 3,
        }
    }

    #[test]
    fn canonical_collapses_onto_album() {
        let item = track_of_album().canonical();
        assert_eq!(item.item_id, 100);
        assert_eq!(item.item_title, "Full Length");
        assert!(item.album_id.is_none());
        assert!(item.album_title.is_none());
    }

    #[test]
    fn canonical_is_identity_for_standalone_items() {
        let mut item = track_of_album();
        item.album_id = None;
        item.album_title = None;
        let item = item.canonical();
        assert_eq!(item.item_id, 11);
        assert_eq!(item.item_title, "Opening Track");
    }

    #[test]
    fn crawl_target_wire_shape_omits_fan_id() {
        let target = CrawlTarget {
            fan_id: 42,
            stage: 1,
            count_left: 10,
            count_total: 12,
            eta: 20,
        };
        let json = serde_json::to_value(&target).expect("serialize");
        assert!(json.get("fan_id").is_none());
        assert_eq!(json["stage"], 1);
        assert_eq!(json["count_left"], 10);
        assert_eq!(json["count_total"], 12);
        assert_eq!(json["eta"], 20);
    }
}
