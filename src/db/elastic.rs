//! Elasticsearch observation backend over the REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::models::*;
use super::store::{ObservationBackend, StoreError};

/// Hits fetched per page while looking for the newest readable document.
const LATEST_PAGE_SIZE: usize = 10;

/// Client for one Elasticsearch index.
///
/// `reqwest::Client` pools connections internally; cloning shares the pool.
#[derive(Clone)]
pub struct ElasticsearchBackend {
    client: reqwest::Client,
    base_url: String,
    index: String,
}

impl ElasticsearchBackend {
    pub fn new(base_url: &str, index: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.base_url, self.index, path)
    }

    /// Run a search. `None` means the index does not exist yet.
    async fn search(&self, body: &Value) -> Result<Option<SearchResponse>, StoreError> {
        let response = self
            .client
            .post(self.url("/_search"))
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(e, false))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(read_status_error(status, &text));
        }

        response
            .json::<SearchResponse>()
            .await
            .map(Some)
            .map_err(|e| StoreError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ObservationBackend for ElasticsearchBackend {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let response = self
            .client
            .get(&self.base_url)
            .send()
            .await
            .map_err(|e| transport_error(e, false))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("cluster answered {}", response.status())))
        }
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let exists = self
            .client
            .head(self.url(""))
            .send()
            .await
            .map_err(|e| transport_error(e, false))?;

        match exists.status() {
            s if s.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {}
            s => return Err(read_status_error(s, "")),
        }

        let response = self
            .client
            .put(self.url(""))
            .json(&index_definition())
            .send()
            .await
            .map_err(|e| transport_error(e, true))?;

        let status = response.status();
        if status.is_success() {
            tracing::info!("Created Elasticsearch index: {}", self.index);
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        // Another instance created it between HEAD and PUT
        if status == StatusCode::BAD_REQUEST && text.contains("resource_already_exists_exception") {
            return Ok(());
        }
        Err(write_status_error(status, &text))
    }

    async fn append(&self, record: &ObservationRecord) -> Result<StoreId, StoreError> {
        let response = self
            .client
            .post(self.url("/_doc?refresh=wait_for"))
            .json(record)
            .send()
            .await
            .map_err(|e| transport_error(e, true))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(write_status_error(status, &text));
        }

        // The document is in; failing to read the acknowledgement leaves the id unknown
        let ack: IndexResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Indeterminate(format!("unreadable index response: {}", e)))?;
        Ok(StoreId(ack.id))
    }

    async fn latest(&self, service: &str) -> Result<Option<StoredObservation>, StoreError> {
        let mut from = 0;
        loop {
            let Some(found) = self.search(&latest_query(service, from, LATEST_PAGE_SIZE)).await? else {
                return Ok(None);
            };
            let fetched = found.hits.hits.len();
            let (valid, _) = decode_hits(found.hits.hits);
            if let Some(newest) = valid.into_iter().next() {
                return Ok(Some(newest));
            }
            if fetched < LATEST_PAGE_SIZE {
                return Ok(None);
            }
            from += fetched;
        }
    }

    async fn history(&self, service: Option<&str>, limit: usize) -> Result<HistoryPage, StoreError> {
        let Some(found) = self.search(&history_query(service, limit)).await? else {
            return Ok(HistoryPage::default());
        };

        let hits = found.hits.hits.len() as u64;
        let total = found.hits.total.map(|t| t.value()).unwrap_or(hits);
        let (valid, skipped) = decode_hits(found.hits.hits);
        Ok(HistoryPage {
            // Only malformed documents on this page are known to be unreadable
            total: total.saturating_sub(skipped as u64),
            results: valid.into_iter().map(|stored| stored.record).collect(),
        })
    }
}

// ============================================================================
// Request bodies
// ============================================================================

/// Index settings and field typing: exact-match keywords and a real date.
pub(crate) fn index_definition() -> Value {
    json!({
        "settings": {
            "number_of_shards": 1
        },
        "mappings": {
            "properties": {
                "service_name": {"type": "keyword"},
                "service_status": {"type": "keyword"},
                "host_name": {"type": "keyword"},
                "timestamp": {"type": "date"}
            }
        }
    })
}

fn service_query(service: Option<&str>) -> Value {
    match service {
        Some(service) => json!({"term": {"service_name": service}}),
        None => json!({"match_all": {}}),
    }
}

/// Newest first; index order breaks timestamp ties (single shard).
fn sort_clause() -> Value {
    json!([
        {"timestamp": {"order": "desc"}},
        {"_doc": {"order": "desc"}}
    ])
}

pub(crate) fn latest_query(service: &str, from: usize, size: usize) -> Value {
    json!({
        "from": from,
        "size": size,
        "query": service_query(Some(service)),
        "sort": sort_clause()
    })
}

pub(crate) fn history_query(service: Option<&str>, limit: usize) -> Value {
    json!({
        "size": limit,
        "track_total_hits": true,
        "query": service_query(service),
        "sort": sort_clause()
    })
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Deserialize)]
struct IndexResponse {
    #[serde(rename = "_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    total: Option<TotalHits>,
    #[serde(default)]
    hits: Vec<Hit>,
}

/// 7.x reports `{"value": n}`, older clusters a bare number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TotalHits {
    Object { value: u64 },
    Count(u64),
}

impl TotalHits {
    fn value(&self) -> u64 {
        match self {
            TotalHits::Object { value } => *value,
            TotalHits::Count(n) => *n,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: Value,
}

/// Decode hits in order, skipping documents that do not match the record shape.
///
/// Returns the decoded records and the number skipped.
fn decode_hits(hits: Vec<Hit>) -> (Vec<StoredObservation>, usize) {
    let mut skipped = 0;
    let valid = hits
        .into_iter()
        .filter_map(|hit| match serde_json::from_value::<ObservationRecord>(hit.source) {
            Ok(record) => Some(StoredObservation {
                id: StoreId(hit.id),
                record,
            }),
            Err(e) => {
                tracing::warn!("Skipping malformed document {}: {}", hit.id, e);
                skipped += 1;
                None
            }
        })
        .collect();
    (valid, skipped)
}

// ============================================================================
// Error classification
// ============================================================================

fn transport_error(e: reqwest::Error, is_write: bool) -> StoreError {
    if e.is_connect() || e.is_builder() {
        StoreError::Unavailable(e.to_string())
    } else if is_write {
        // The request may have reached the cluster
        StoreError::Indeterminate(e.to_string())
    } else {
        StoreError::Unavailable(e.to_string())
    }
}

fn is_transient(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn write_status_error(status: StatusCode, body: &str) -> StoreError {
    if is_transient(status) {
        StoreError::Unavailable(format!("{}: {}", status, snippet(body)))
    } else {
        StoreError::Write(format!("{}: {}", status, snippet(body)))
    }
}

fn read_status_error(status: StatusCode, body: &str) -> StoreError {
    if is_transient(status) || status.is_server_error() {
        StoreError::Unavailable(format!("{}: {}", status, snippet(body)))
    } else {
        StoreError::Decode(format!("{}: {}", status, snippet(body)))
    }
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
