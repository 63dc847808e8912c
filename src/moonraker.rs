//! Moonraker HTTP transport for telemetry polling and job history.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info};
use url::Url;

use crate::config::PrinterConfig;
use crate::jobs::{history_jobs, FeedError, HistoryFeed};
use crate::telemetry::{TelemetryError, TelemetrySource, TelemetryStream};

const USER_AGENT: &str = concat!("spoolkeeper/", env!("CARGO_PKG_VERSION"));

/// Objects always included in the status query.
const BASE_OBJECTS: [&str; 2] = ["print_stats", "virtual_sdcard"];
/// Substrings marking filament-changer objects.
const CHANGER_HINTS: [&str; 6] = ["cfs", "ams", "mmu", "spool", "filament_box", "filamentbox"];
/// Keeps the query URL short.
const MAX_CHANGER_OBJECTS: usize = 12;

pub struct MoonrakerClient {
    client: reqwest::Client,
    base: Url,
    poll_interval: Duration,
}

impl MoonrakerClient {
    pub fn new(config: &PrinterConfig) -> anyhow::Result<Self> {
        let trimmed = config.url.trim().trim_end_matches('/');
        let base = Url::parse(&format!("{}/", trimmed))
            .map_err(|e| anyhow::anyhow!("Invalid printer URL '{}': {}", config.url, e))?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base,
            poll_interval: config.poll_interval(),
        })
    }

    async fn get_json(&self, url: Url) -> Result<Value, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await
    }

    fn endpoint(&self, path: &str) -> Result<Url, String> {
        self.base
            .join(path)
            .map_err(|e| format!("Invalid endpoint '{}': {}", path, e))
    }
}

/// Pick the changer-related objects out of `printer/objects/list`.
pub fn select_objects(available: &[String]) -> Vec<String> {
    available
        .iter()
        .filter(|name| {
            let lower = name.to_lowercase();
            lower == "box"
                || lower == "filament_rack"
                || CHANGER_HINTS.iter().any(|hint| lower.contains(hint))
        })
        .take(MAX_CHANGER_OBJECTS)
        .cloned()
        .collect()
}

/// `printer/objects/query?print_stats&virtual_sdcard&box&...` (ampersand form).
pub fn query_url(base: &Url, objects: &[String]) -> Result<Url, String> {
    let mut url = base
        .join("printer/objects/query")
        .map_err(|e| format!("Invalid query URL: {}", e))?;
    let query = BASE_OBJECTS
        .iter()
        .map(|s| s.to_string())
        .chain(objects.iter().filter(|o| !BASE_OBJECTS.contains(&o.as_str())).cloned())
        .collect::<Vec<_>>()
        .join("&");
    url.set_query(Some(&query));
    Ok(url)
}

#[async_trait]
impl TelemetrySource for MoonrakerClient {
    async fn connect(&self) -> Result<Box<dyn TelemetryStream>, TelemetryError> {
        let list_url = self.endpoint("printer/objects/list").map_err(TelemetryError::Connect)?;
        let listing = self
            .get_json(list_url)
            .await
            .map_err(|e| TelemetryError::Connect(e.to_string()))?;
        let available: Vec<String> = listing
            .get("result")
            .and_then(|r| r.get("objects"))
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        let objects = select_objects(&available);
        info!("Polling printer objects: {:?}", objects);
        let url = query_url(&self.base, &objects).map_err(TelemetryError::Connect)?;

        Ok(Box::new(MoonrakerStream {
            client: self.client.clone(),
            url,
            interval: self.poll_interval,
            first: true,
        }))
    }
}

/// Polls the status query; the first poll is immediate.
struct MoonrakerStream {
    client: reqwest::Client,
    url: Url,
    interval: Duration,
    first: bool,
}

#[async_trait]
impl TelemetryStream for MoonrakerStream {
    async fn next_frame(&mut self) -> Result<Option<Value>, TelemetryError> {
        if !self.first {
            sleep(self.interval).await;
        }
        self.first = false;

        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TelemetryError::Receive(e.to_string()))?;
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| TelemetryError::Malformed(e.to_string()))?;
        Ok(Some(body))
    }
}

#[async_trait]
impl HistoryFeed for MoonrakerClient {
    async fn fetch_jobs(&self, limit: usize) -> Result<Vec<Value>, FeedError> {
        let mut url = self.endpoint("server/history/list").map_err(FeedError::Request)?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string())
            .append_pair("order", "desc");
        debug!("GET {}", url);
        let body = self
            .get_json(url)
            .await
            .map_err(|e| FeedError::Request(e.to_string()))?;
        history_jobs(&body)
    }
}
