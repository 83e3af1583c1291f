//! Structured storage contract and implementations
//!
//! The pipeline persists through [`TableStore`]: tenant-scoped create,
//! query and update against named tables of JSON records.
//!
//! - [`InMemoryStore`]: process-local tables with failure injection, used by
//!   tests and by the CLI when no storage URL is configured
//! - [`HttpTableStore`]: the document store's JSON-over-HTTP protocol
//!
//! Record ids are assigned client-side (UUID v4) and stored in the `id`
//! field, so a create is a single idempotent-by-id write.

use crate::TenantId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// One stored row.
pub type Record = Map<String, Value>;

/// Field holding a record's id.
pub const ID_FIELD: &str = "id";

/// Equality filter on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Field name.
    pub field: String,
    /// Comparison operator; only `eq` is used by the pipeline.
    pub operator: String,
    /// Value to compare against.
    pub value: Value,
}

impl Filter {
    /// `field == value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator: "eq".to_string(),
            value: value.into(),
        }
    }

    fn matches(&self, record: &Record) -> bool {
        record.get(&self.field) == Some(&self.value)
    }
}

/// Storage failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Could not reach the store.
    #[error("storage transport failure: {0}")]
    Transport(String),
    /// The store answered with `success: false` or a non-2xx status.
    #[error("storage rejected the request: {0}")]
    Rejected(String),
    /// The store's answer could not be decoded.
    #[error("storage response could not be decoded: {0}")]
    Decode(String),
    /// No record with this id.
    #[error("no record `{id}` in `{table}`")]
    NotFound {
        /// Table searched.
        table: String,
        /// Missing id.
        id: String,
    },
    /// Failure injected by [`InMemoryStore`].
    #[error("injected failure writing to `{0}`")]
    Injected(String),
}

/// Tenant-scoped table storage.
///
/// Implementations must be thread-safe; the fan-out writer issues child
/// creates concurrently.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Insert `record`, returning its assigned id.
    async fn create(
        &self,
        tenant: &TenantId,
        table: &str,
        record: Record,
    ) -> Result<String, StoreError>;

    /// Records in `table` matching every filter.
    async fn query(
        &self,
        tenant: &TenantId,
        table: &str,
        filters: &[Filter],
    ) -> Result<Vec<Record>, StoreError>;

    /// Merge `fields` into the record with id `id`.
    async fn update(
        &self,
        tenant: &TenantId,
        table: &str,
        id: &str,
        fields: Record,
    ) -> Result<(), StoreError>;
}

fn assign_id(record: &mut Record) -> String {
    match record.get(ID_FIELD).and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => {
            let id = Uuid::new_v4().to_string();
            record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            id
        }
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug)]
enum FailRule {
    Always,
    Nth(Vec<usize>),
}

/// Process-local store.
///
/// Failure injection is per table: [`fail_table`](Self::fail_table) rejects
/// every create, [`fail_creates`](Self::fail_creates) rejects the listed
/// create calls (0-based, counted per table in call order).
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: DashMap<(String, String), Vec<Record>>,
    failures: DashMap<String, FailRule>,
    create_counts: DashMap<String, AtomicUsize>,
}

impl InMemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every create into `table`.
    pub fn fail_table(self, table: &str) -> Self {
        self.failures.insert(table.to_string(), FailRule::Always);
        self
    }

    /// Reject the `nth` creates into `table`.
    pub fn fail_creates(self, table: &str, nth: &[usize]) -> Self {
        self.failures
            .insert(table.to_string(), FailRule::Nth(nth.to_vec()));
        self
    }

    /// Every record in `table` for `tenant`.
    pub fn records(&self, tenant: &TenantId, table: &str) -> Vec<Record> {
        self.tables
            .get(&(tenant.as_str().to_string(), table.to_string()))
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    /// Number of records in `table` for `tenant`.
    pub fn count(&self, tenant: &TenantId, table: &str) -> usize {
        self.tables
            .get(&(tenant.as_str().to_string(), table.to_string()))
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    fn should_fail(&self, table: &str) -> bool {
        let n = self
            .create_counts
            .entry(table.to_string())
            .or_default()
            .fetch_add(1, Ordering::SeqCst);
        match self.failures.get(table).as_deref() {
            Some(FailRule::Always) => true,
            Some(FailRule::Nth(list)) => list.contains(&n),
            None => false,
        }
    }
}

#[async_trait]
impl TableStore for InMemoryStore {
    async fn create(
        &self,
        tenant: &TenantId,
        table: &str,
        mut record: Record,
    ) -> Result<String, StoreError> {
        if self.should_fail(table) {
            return Err(StoreError::Injected(table.to_string()));
        }
        let id = assign_id(&mut record);
        self.tables
            .entry((tenant.as_str().to_string(), table.to_string()))
            .or_default()
            .push(record);
        Ok(id)
    }

    async fn query(
        &self,
        tenant: &TenantId,
        table: &str,
        filters: &[Filter],
    ) -> Result<Vec<Record>, StoreError> {
        Ok(self
            .records(tenant, table)
            .into_iter()
            .filter(|r| filters.iter().all(|f| f.matches(r)))
            .collect())
    }

    async fn update(
        &self,
        tenant: &TenantId,
        table: &str,
        id: &str,
        fields: Record,
    ) -> Result<(), StoreError> {
        let not_found = || StoreError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        };
        let mut rows = self
            .tables
            .get_mut(&(tenant.as_str().to_string(), table.to_string()))
            .ok_or_else(not_found)?;
        let row = rows
            .iter_mut()
            .find(|r| r.get(ID_FIELD).and_then(Value::as_str) == Some(id))
            .ok_or_else(not_found)?;
        row.extend(fields);
        Ok(())
    }
}

// ============================================================================
// HTTP store
// ============================================================================

#[derive(Debug, Deserialize)]
struct StoreResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    data: Option<StoreData>,
}

#[derive(Debug, Deserialize)]
struct StoreData {
    #[serde(default)]
    records: Vec<Record>,
}

/// Client for the document store's single-endpoint JSON protocol.
///
/// Every request is a POST of `{operation, table, tenant_id, namespace, ...}`
/// authenticated with an `x-api-key` header. The store renders missing
/// numbers as bare `NaN` and missing timestamps as `"NaT"`; both are read
/// as `null`.
pub struct HttpTableStore {
    client: reqwest::Client,
    url: String,
    api_key: String,
    namespace: String,
    query_limit: u32,
}

impl HttpTableStore {
    /// Store at `url` in the `default` namespace.
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(29))
                .build()
                .unwrap_or_default(),
            url: url.into(),
            api_key: api_key.into(),
            namespace: "default".to_string(),
            query_limit: 50,
        }
    }

    /// Use another namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Cap on records returned per query (the store allows at most 1000).
    pub fn with_query_limit(mut self, limit: u32) -> Self {
        self.query_limit = limit.min(1000);
        self
    }

    async fn call(&self, tenant: &TenantId, mut payload: Value) -> Result<StoreResponse, StoreError> {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("tenant_id".into(), json!(tenant.as_str()));
            obj.insert("namespace".into(), json!(self.namespace));
        }
        let operation = payload["operation"].as_str().unwrap_or_default().to_string();
        debug!(%operation, table = %payload["table"], "storage call");

        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !status.is_success() {
            let message: String = text.chars().take(512).collect();
            return Err(StoreError::Rejected(format!("{status}: {message}")));
        }

        let parsed: StoreResponse = serde_json::from_str(&sanitize(&text))
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        if !parsed.success {
            let reason = match &parsed.error {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Object(o)) => o
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified error")
                    .to_string(),
                _ => "unspecified error".to_string(),
            };
            return Err(StoreError::Rejected(reason));
        }
        Ok(parsed)
    }
}

/// Replace bare `NaN` tokens and `"NaT"` strings with `null`.
fn sanitize(text: &str) -> String {
    let text = text.replace("\"NaT\"", "null");
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut rest = text.as_str();
    while let Some(c) = rest.chars().next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            rest = &rest[c.len_utf8()..];
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if rest.starts_with("NaN") {
            out.push_str("null");
            rest = &rest[3..];
            continue;
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

#[async_trait]
impl TableStore for HttpTableStore {
    async fn create(
        &self,
        tenant: &TenantId,
        table: &str,
        mut record: Record,
    ) -> Result<String, StoreError> {
        let id = assign_id(&mut record);
        self.call(
            tenant,
            json!({ "operation": "WRITE", "table": table, "records": [record] }),
        )
        .await?;
        Ok(id)
    }

    async fn query(
        &self,
        tenant: &TenantId,
        table: &str,
        filters: &[Filter],
    ) -> Result<Vec<Record>, StoreError> {
        let response = self
            .call(
                tenant,
                json!({
                    "operation": "QUERY",
                    "table": table,
                    "filters": filters,
                    "limit": self.query_limit,
                    "skip_versioning": true,
                }),
            )
            .await?;
        Ok(response.data.map(|d| d.records).unwrap_or_default())
    }

    async fn update(
        &self,
        tenant: &TenantId,
        table: &str,
        id: &str,
        fields: Record,
    ) -> Result<(), StoreError> {
        self.call(
            tenant,
            json!({
                "operation": "UPDATE",
                "table": table,
                "filters": [Filter::eq(ID_FIELD, id)],
                "updates": fields,
            }),
        )
        .await?;
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
