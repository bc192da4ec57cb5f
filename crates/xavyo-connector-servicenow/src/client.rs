//! ServiceNow Table API and Service Catalog API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::filter::EncodedQuery;
use crate::{ServiceNowConfig, ServiceNowError, ServiceNowResult};

const TABLE_PATH: &str = "api/now/table";
const CATALOG_PATH: &str = "api/sn_sc/servicecatalog";

/// How the instance reported whether more records follow a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSignal {
    /// Total matching records, from `X-Total-Count`.
    Total(u64),
    /// Whether a `Link` header advertised a `next` relation.
    HasMore(bool),
}

impl PageSignal {
    /// Returns true when the page fetched at `offset` with `returned` records
    /// is the last one.
    ///
    /// A total count wins over the `Link` header. An empty page is always
    /// last.
    #[must_use]
    pub fn is_last(&self, offset: u64, returned: usize) -> bool {
        if returned == 0 {
            return true;
        }
        match *self {
            PageSignal::Total(total) => offset + returned as u64 >= total,
            PageSignal::HasMore(has_more) => !has_more,
        }
    }

    /// Reads the signal from response headers.
    pub(crate) fn from_headers(headers: &HeaderMap) -> Self {
        let total = headers
            .get("X-Total-Count")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        match total {
            Some(total) => PageSignal::Total(total),
            None => PageSignal::HasMore(
                headers
                    .get(header::LINK)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(has_next_link),
            ),
        }
    }
}

/// Returns true when a `Link` header value contains a `rel="next"` entry.
fn has_next_link(link: &str) -> bool {
    link.split(',').any(|entry| {
        entry.split(';').skip(1).any(|param| {
            let param = param.trim();
            param
                .strip_prefix("rel=")
                .map(|rel| rel.trim_matches('"'))
                .is_some_and(|rel| rel.split_whitespace().any(|r| r == "next"))
        })
    })
}

/// A filtered, paged read against one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableQuery {
    pub query: EncodedQuery,
    pub fields: Vec<String>,
    pub limit: u32,
    pub offset: u64,
}

impl TableQuery {
    #[must_use]
    pub fn new(query: EncodedQuery) -> Self {
        Self {
            query,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Query string parameters for this read.
    pub(crate) fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::with_capacity(4);
        if !self.query.is_empty() {
            params.push(("sysparm_query", self.query.to_string()));
        }
        if !self.fields.is_empty() {
            params.push(("sysparm_fields", self.fields.join(",")));
        }
        if self.limit > 0 {
            params.push(("sysparm_limit", self.limit.to_string()));
        }
        if self.offset > 0 {
            params.push(("sysparm_offset", self.offset.to_string()));
        }
        params
    }
}

/// One page of raw records.
#[derive(Debug, Clone, PartialEq)]
pub struct TablePage {
    pub records: Vec<Value>,
    pub signal: PageSignal,
}

impl TablePage {
    #[must_use]
    pub fn new(records: Vec<Value>, signal: PageSignal) -> Self {
        Self { records, signal }
    }

    /// Decodes every record into `T`.
    pub fn decode<T: DeserializeOwned>(self) -> ServiceNowResult<Vec<T>> {
        self.records
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(ServiceNowError::from))
            .collect()
    }

    #[must_use]
    pub fn is_last(&self, offset: u64) -> bool {
        self.signal.is_last(offset, self.records.len())
    }
}

/// Backing store operations the connector needs.
///
/// Implemented over HTTP by [`ServiceNowClient`]. Tests substitute an
/// in-memory store.
#[async_trait]
pub trait TableApi: Send + Sync {
    /// Filtered, paged read.
    async fn query(&self, table: &str, query: &TableQuery) -> ServiceNowResult<TablePage>;

    /// Reads one record by `sys_id`.
    async fn get(&self, table: &str, id: &str, fields: &[&str]) -> ServiceNowResult<Value>;

    /// Inserts a record and returns it.
    async fn create(&self, table: &str, payload: Value) -> ServiceNowResult<Value>;

    /// Patches a record and returns it.
    async fn update(&self, table: &str, id: &str, payload: Value) -> ServiceNowResult<Value>;

    /// Deletes a record by `sys_id`.
    async fn delete(&self, table: &str, id: &str) -> ServiceNowResult<()>;

    /// GET against the Service Catalog API. A single-object result becomes a
    /// one-record page.
    async fn catalog_get(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> ServiceNowResult<TablePage>;

    /// POST against the Service Catalog API, returning the `result` object.
    async fn catalog_post(&self, path: &str, body: Value) -> ServiceNowResult<Value>;
}

/// Error document returned by the instance on failure.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    detail: Option<String>,
}

/// HTTP client for one ServiceNow instance.
///
/// Requests use basic auth and never retry; callers decide what to do with
/// transient failures.
#[derive(Debug, Clone)]
pub struct ServiceNowClient {
    http_client: reqwest::Client,
    base_url: String,
    username: String,
    password: secrecy::SecretString,
}

impl ServiceNowClient {
    /// Creates a client for the configured instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: &ServiceNowConfig) -> ServiceNowResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceNowError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url: config.instance_url(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// Returns the instance root URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str, id: Option<&str>) -> String {
        match id {
            Some(id) => format!(
                "{}/{TABLE_PATH}/{table}/{}",
                self.base_url,
                urlencoding::encode(id)
            ),
            None => format!("{}/{TABLE_PATH}/{table}", self.base_url),
        }
    }

    fn catalog_url(&self, path: &str) -> String {
        format!(
            "{}/{CATALOG_PATH}/{}",
            self.base_url,
            path.trim_start_matches('/')
        )
    }

    /// Sends one request and returns the decoded body and page signal.
    ///
    /// DELETE and empty bodies yield `Value::Null`.
    async fn send(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, String)],
        body: Option<&Value>,
    ) -> ServiceNowResult<(Value, PageSignal)> {
        use secrecy::ExposeSecret;

        debug!(%method, url, "ServiceNow request");

        let mut request = self
            .http_client
            .request(method.clone(), url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .header(header::ACCEPT, "application/json")
            .query(&[("sysparm_exclude_reference_link", "true")])
            .query(params);

        if let Some(b) = body {
            request = request.json(b);
        }

        let response = request.send().await?;
        let status = response.status();
        let signal = PageSignal::from_headers(response.headers());

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &error_body));
        }

        if method == Method::DELETE || status == StatusCode::NO_CONTENT {
            return Ok((Value::Null, signal));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok((Value::Null, signal));
        }
        let body: Value = serde_json::from_slice(&bytes)?;
        Ok((body, signal))
    }
}

/// Builds a status error, preferring the instance's error message.
fn status_error(status: StatusCode, body: &str) -> ServiceNowError {
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(parsed) => {
            let message = match parsed.error.detail.filter(|d| !d.is_empty()) {
                Some(detail) => format!("{}: {detail}", parsed.error.message),
                None => parsed.error.message,
            };
            ServiceNowError::status(status, message)
        }
        Err(_) => ServiceNowError::status(status, body),
    }
}

/// Takes the `result` member out of a response envelope.
fn take_result(body: Value) -> ServiceNowResult<Value> {
    match body {
        Value::Object(mut map) => map
            .remove("result")
            .ok_or_else(|| ServiceNowError::Decode("response has no result member".into())),
        Value::Null => Ok(Value::Null),
        other => Err(ServiceNowError::Decode(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

fn into_records(result: Value) -> ServiceNowResult<Vec<Value>> {
    match result {
        Value::Array(records) => Ok(records),
        Value::Null => Ok(Vec::new()),
        record @ Value::Object(_) => Ok(vec![record]),
        other => Err(ServiceNowError::Decode(format!(
            "expected records, got {other}"
        ))),
    }
}

#[async_trait]
impl TableApi for ServiceNowClient {
    #[instrument(skip(self))]
    async fn query(&self, table: &str, query: &TableQuery) -> ServiceNowResult<TablePage> {
        let (body, signal) = self
            .send(Method::GET, &self.table_url(table, None), &query.params(), None)
            .await?;
        let records = into_records(take_result(body)?)?;
        debug!(table, returned = records.len(), ?signal, "Fetched page");
        Ok(TablePage::new(records, signal))
    }

    #[instrument(skip(self))]
    async fn get(&self, table: &str, id: &str, fields: &[&str]) -> ServiceNowResult<Value> {
        let mut params = Vec::new();
        if !fields.is_empty() {
            params.push(("sysparm_fields", fields.join(",")));
        }
        let (body, _) = self
            .send(Method::GET, &self.table_url(table, Some(id)), &params, None)
            .await?;
        take_result(body)
    }

    #[instrument(skip(self, payload))]
    async fn create(&self, table: &str, payload: Value) -> ServiceNowResult<Value> {
        let (body, _) = self
            .send(Method::POST, &self.table_url(table, None), &[], Some(&payload))
            .await?;
        take_result(body)
    }

    #[instrument(skip(self, payload))]
    async fn update(&self, table: &str, id: &str, payload: Value) -> ServiceNowResult<Value> {
        let (body, _) = self
            .send(
                Method::PATCH,
                &self.table_url(table, Some(id)),
                &[],
                Some(&payload),
            )
            .await?;
        take_result(body)
    }

    #[instrument(skip(self))]
    async fn delete(&self, table: &str, id: &str) -> ServiceNowResult<()> {
        self.send(Method::DELETE, &self.table_url(table, Some(id)), &[], None)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn catalog_get(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> ServiceNowResult<TablePage> {
        let (body, signal) = self
            .send(Method::GET, &self.catalog_url(path), params, None)
            .await?;
        let records = into_records(take_result(body)?)?;
        Ok(TablePage::new(records, signal))
    }

    #[instrument(skip(self, body))]
    async fn catalog_post(&self, path: &str, body: Value) -> ServiceNowResult<Value> {
        let (response, _) = self
            .send(Method::POST, &self.catalog_url(path), &[], Some(&body))
            .await?;
        take_result(response)
    }
}
