use std::time::Duration;

use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_GRAPHQL_PATH: &str = "/graphql";
pub const DEFAULT_PAGE_SIZE: u32 = 10;
/// Page size used when the table is loaded in one request.
pub const FULL_TABLE_PAGE_SIZE: u32 = 10_000;

/// Fixed-delay retry for queries and mutations. The live feed reuses `delay`
/// between reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(1_000))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub graphql_path: String,
    /// Websocket endpoint for subscriptions; derived from `base_url` when unset.
    pub ws_url: Option<String>,
    pub page_size: u32,
    /// Background (prefetch) requests allowed in flight at once.
    pub background_concurrency: usize,
    pub retry: RetryPolicy,
    pub user_agent: String,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::builtin()
        }
    }

    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = Some(ws_url.into());
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_background_concurrency(mut self, n: usize) -> Self {
        self.background_concurrency = n.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn graphql_url(&self) -> String {
        join_url(&self.base_url, &self.graphql_path)
    }

    pub fn subscription_url(&self) -> String {
        match &self.ws_url {
            Some(url) => url.clone(),
            None => {
                let http = self.graphql_url();
                if let Some(rest) = http.strip_prefix("https://") {
                    format!("wss://{rest}")
                } else if let Some(rest) = http.strip_prefix("http://") {
                    format!("ws://{rest}")
                } else {
                    http
                }
            }
        }
    }

    fn builtin() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            graphql_path: DEFAULT_GRAPHQL_PATH.to_string(),
            ws_url: None,
            page_size: DEFAULT_PAGE_SIZE,
            background_concurrency: 1,
            retry: RetryPolicy::default(),
            user_agent: "damnit-dashboard/0.1".to_string(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let mut cfg = Self::builtin();
        if let Ok(url) = std::env::var("DAMNIT_BASE_URL") {
            cfg.base_url = url;
        }
        if let Ok(url) = std::env::var("DAMNIT_WS_URL") {
            cfg.ws_url = Some(url);
        }
        if let Some(size) = env_parse::<u32>("DAMNIT_PAGE_SIZE") {
            cfg.page_size = size.max(1);
        }
        if let Some(n) = env_parse::<usize>("DAMNIT_BACKGROUND_CONCURRENCY") {
            cfg.background_concurrency = n.max(1);
        }
        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
