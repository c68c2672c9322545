use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub database_url: String,

    // Web server
    pub host: String,
    pub port: u16,

    // Crawling
    /// Entities whose `last_updated` is older than this many days are
    /// re-crawled on next access.
    pub stale_days: i64,
    /// Per-request timeout for Bandcamp fetches, in seconds.
    pub fetch_timeout_secs: u64,
    /// Global cap on concurrent Bandcamp fetches across all jobs.
    pub crawl_workers: usize,
    /// Page size for the Bandcamp pagination APIs.
    pub page_size: u32,
    /// When set, idle workers refresh the stalest known entity to keep the
    /// shared cache warm.
    pub background_refresh: bool,
}

impl Config {
    /// Load configuration from environment variables, with defaults suitable
    /// for a local single-node deployment.
    pub fn from_env() -> Self {
        Self {
            database_url: env_or("CRATEDIG_DATABASE_URL", "sqlite://cratedig.db?mode=rwc"),
            host: env_or("CRATEDIG_HOST", "0.0.0.0"),
            port: env_or("CRATEDIG_PORT", "3000")
                .parse()
                .expect("CRATEDIG_PORT must be a number"),
            stale_days: env_or("CRATEDIG_STALE_DAYS", "30")
                .parse()
                .expect("CRATEDIG_STALE_DAYS must be a number"),
            fetch_timeout_secs: env_or("CRATEDIG_FETCH_TIMEOUT_SECS", "30")
                .parse()
                .expect("CRATEDIG_FETCH_TIMEOUT_SECS must be a number"),
            crawl_workers: env_or("CRATEDIG_CRAWL_WORKERS", "4")
                .parse()
                .expect("CRATEDIG_CRAWL_WORKERS must be a number"),
            page_size: env_or("CRATEDIG_PAGE_SIZE", "500")
                .parse()
                .expect("CRATEDIG_PAGE_SIZE must be a number"),
            background_refresh: env::var("CRATEDIG_BACKGROUND_REFRESH")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Staleness cutoff as a unix timestamp: rows with `last_updated` below
    /// this are due for a re-crawl.
    pub fn stale_cutoff(&self) -> i64 {
        chrono::Utc::now().timestamp() - self.stale_days * 86_400
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
