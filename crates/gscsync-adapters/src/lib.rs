//! Source and destination API contracts plus their REST implementations
//! (Search Console analytics, Notion database pages).

use async_trait::async_trait;
use chrono::NaiveDate;
use gscsync_core::{
    AnalyticsRow, DestinationRecord, DimensionFilters, RecordId, RowKey, RowProperties,
    SyncWindow, DATE_FORMAT,
};
use gscsync_http::{check_response, ApiError};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{instrument, warn};

pub const CRATE_NAME: &str = "gscsync-adapters";

pub const SEARCH_CONSOLE_API_BASE: &str = "https://www.googleapis.com";
pub const NOTION_API_BASE: &str = "https://api.notion.com";
pub const NOTION_VERSION: &str = "2022-06-28";

/// Largest page the Search Console query endpoint accepts.
pub const MAX_ROW_LIMIT: u32 = 25_000;

/// Text properties longer than this are rejected by the destination. The
/// identity key is held to the same bound by [`gscsync_core::MAX_KEY_CHARS`].
pub const MAX_TEXT_CHARS: usize = 2000;

const DIMENSIONS: [&str; 5] = ["date", "query", "page", "country", "device"];

/// One page request against the analytics source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    pub site_url: String,
    pub window: SyncWindow,
    pub filters: DimensionFilters,
    pub limit: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteEntry {
    #[serde(rename = "siteUrl")]
    pub site_url: String,
    #[serde(rename = "permissionLevel", default)]
    pub permission_level: String,
}

#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    /// Rows of one page, in the order the API returns them. A page shorter
    /// than `query.limit` means the source is exhausted.
    async fn query(&self, query: &SourceQuery) -> Result<Vec<AnalyticsRow>, ApiError>;

    async fn list_sites(&self) -> Result<Vec<SiteEntry>, ApiError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Ids of the records whose identity property equals `key`, in the
    /// store's listing order. Other properties of the matches are not read.
    async fn find_by_key(&self, key: &RowKey) -> Result<Vec<RecordId>, ApiError>;

    async fn create(&self, properties: &RowProperties) -> Result<DestinationRecord, ApiError>;

    async fn update(
        &self,
        id: &RecordId,
        properties: &RowProperties,
    ) -> Result<DestinationRecord, ApiError>;
}

fn endpoint(base: &str, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url = Url::parse(base).map_err(|_| ApiError::InvalidUrl(base.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| ApiError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

// ----------------------------------------------------------------------------
// Search Console
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchAnalyticsRequest {
    start_date: String,
    end_date: String,
    dimensions: Vec<&'static str>,
    row_limit: u32,
    start_row: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dimension_filter_groups: Vec<FilterGroup>,
}

#[derive(Debug, Serialize)]
struct FilterGroup {
    filters: Vec<DimensionFilter>,
}

#[derive(Debug, Serialize)]
struct DimensionFilter {
    dimension: &'static str,
    operator: &'static str,
    expression: String,
}

impl SearchAnalyticsRequest {
    pub fn from_query(query: &SourceQuery) -> Self {
        let mut filters = Vec::new();
        if let Some(country) = &query.filters.country {
            filters.push(DimensionFilter {
                dimension: "country",
                operator: "equals",
                expression: country.clone(),
            });
        }
        if let Some(device) = &query.filters.device {
            filters.push(DimensionFilter {
                dimension: "device",
                operator: "equals",
                expression: device.clone(),
            });
        }
        let dimension_filter_groups = if filters.is_empty() {
            Vec::new()
        } else {
            vec![FilterGroup { filters }]
        };

        Self {
            start_date: query.window.start().format(DATE_FORMAT).to_string(),
            end_date: query.window.end().format(DATE_FORMAT).to_string(),
            dimensions: DIMENSIONS.to_vec(),
            row_limit: query.limit,
            start_row: query.offset,
            dimension_filter_groups,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchAnalyticsResponse {
    #[serde(default)]
    pub rows: Vec<SearchAnalyticsRow>,
}

#[derive(Debug, Deserialize)]
pub struct SearchAnalyticsRow {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub clicks: f64,
    #[serde(default)]
    pub impressions: f64,
    #[serde(default)]
    pub ctr: f64,
    #[serde(default)]
    pub position: f64,
}

#[derive(Debug, Default, Deserialize)]
struct SitesResponse {
    #[serde(rename = "siteEntry", default)]
    site_entry: Vec<SiteEntry>,
}

/// Map API rows to [`AnalyticsRow`]s, dropping rows whose keys do not carry
/// the five requested dimensions.
pub fn rows_from_response(response: SearchAnalyticsResponse) -> Vec<AnalyticsRow> {
    response
        .rows
        .into_iter()
        .filter_map(|raw| {
            let [date, query, page, country, device]: [String; 5] = match raw.keys.try_into() {
                Ok(keys) => keys,
                Err(keys) => {
                    warn!(?keys, "skipping source row without five dimension keys");
                    return None;
                }
            };
            let date = match NaiveDate::parse_from_str(&date, DATE_FORMAT) {
                Ok(date) => date,
                Err(_) => {
                    warn!(%date, "skipping source row with unparseable date");
                    return None;
                }
            };
            Some(AnalyticsRow {
                date,
                query,
                page,
                country,
                device,
                clicks: count(raw.clicks),
                impressions: count(raw.impressions),
                ctr: raw.ctr.clamp(0.0, 1.0),
                position: raw.position.max(0.0),
            })
        })
        .collect()
}

fn count(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}

#[derive(Debug, Clone)]
pub struct SearchConsoleClient {
    client: Client,
    api_base: String,
    access_token: String,
}

impl SearchConsoleClient {
    pub fn new(client: Client, access_token: impl Into<String>) -> Self {
        Self {
            client,
            api_base: SEARCH_CONSOLE_API_BASE.to_string(),
            access_token: access_token.into(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn query_url(&self, site_url: &str) -> Result<Url, ApiError> {
        endpoint(
            &self.api_base,
            &["webmasters", "v3", "sites", site_url, "searchAnalytics", "query"],
        )
    }
}

#[async_trait]
impl AnalyticsSource for SearchConsoleClient {
    #[instrument(skip(self, query), fields(site = %query.site_url, window = %query.window, offset = query.offset))]
    async fn query(&self, query: &SourceQuery) -> Result<Vec<AnalyticsRow>, ApiError> {
        let url = self.query_url(&query.site_url)?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&SearchAnalyticsRequest::from_query(query))
            .send()
            .await?;
        let body: SearchAnalyticsResponse = check_response(resp).await?.json().await?;
        Ok(rows_from_response(body))
    }

    #[instrument(skip(self))]
    async fn list_sites(&self) -> Result<Vec<SiteEntry>, ApiError> {
        let url = endpoint(&self.api_base, &["webmasters", "v3", "sites"])?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let body: SitesResponse = check_response(resp).await?.json().await?;
        Ok(body.site_entry)
    }
}

// ----------------------------------------------------------------------------
// Notion
// ----------------------------------------------------------------------------

/// Names of the destination database properties. The database itself is
/// provisioned out of band; these only have to match it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertySchema {
    pub key: String,
    pub date: String,
    pub query: String,
    pub page: String,
    pub country: String,
    pub device: String,
    pub clicks: String,
    pub impressions: String,
    pub ctr: String,
    pub position: String,
}

impl Default for PropertySchema {
    fn default() -> Self {
        Self {
            key: "Key".into(),
            date: "Date".into(),
            query: "Query".into(),
            page: "Page".into(),
            country: "Country".into(),
            device: "Device".into(),
            clicks: "Clicks".into(),
            impressions: "Impressions".into(),
            ctr: "CTR".into(),
            position: "Position".into(),
        }
    }
}

impl PropertySchema {
    pub fn encode(&self, props: &RowProperties) -> JsonValue {
        let mut out = serde_json::Map::new();
        out.insert(self.key.clone(), text_value("title", props.key.as_str()));
        out.insert(
            self.date.clone(),
            json!({ "date": { "start": props.date.format(DATE_FORMAT).to_string() } }),
        );
        out.insert(
            self.query.clone(),
            text_value("rich_text", &truncate_chars(&props.query, MAX_TEXT_CHARS)),
        );
        out.insert(
            self.page.clone(),
            json!({ "url": non_empty(&props.page) }),
        );
        out.insert(self.country.clone(), select_value(&props.country));
        out.insert(self.device.clone(), select_value(&props.device));
        out.insert(self.clicks.clone(), json!({ "number": props.clicks }));
        out.insert(self.impressions.clone(), json!({ "number": props.impressions }));
        out.insert(self.ctr.clone(), json!({ "number": props.ctr }));
        out.insert(self.position.clone(), json!({ "number": props.position }));
        JsonValue::Object(out)
    }

    /// Read a page object back into a [`DestinationRecord`].
    pub fn decode_page(&self, page: &JsonValue) -> Result<DestinationRecord, String> {
        let id = json_str(page, &["id"]).ok_or("page has no id")?;
        let props = page
            .get("properties")
            .ok_or("page has no properties object")?;
        let prop = |name: &str| -> Result<&JsonValue, String> {
            props
                .get(name)
                .ok_or_else(|| format!("page {id} is missing property {name:?}"))
        };

        let date_raw = json_str(prop(&self.date)?, &["date", "start"])
            .ok_or_else(|| format!("page {id} has no {:?} start date", self.date))?;
        // Date properties may carry a time component; only the day matters here.
        let date = NaiveDate::parse_from_str(date_raw.get(..10).unwrap_or(date_raw), DATE_FORMAT)
            .map_err(|e| format!("page {id} has malformed date {date_raw:?}: {e}"))?;

        Ok(DestinationRecord {
            id: RecordId::new(id),
            properties: RowProperties {
                key: RowKey::from_stored(plain_text(prop(&self.key)?, "title")),
                date,
                query: plain_text(prop(&self.query)?, "rich_text"),
                page: json_str(prop(&self.page)?, &["url"]).unwrap_or_default().to_string(),
                country: json_str(prop(&self.country)?, &["select", "name"])
                    .unwrap_or_default()
                    .to_string(),
                device: json_str(prop(&self.device)?, &["select", "name"])
                    .unwrap_or_default()
                    .to_string(),
                clicks: count(json_f64(prop(&self.clicks)?, &["number"]).unwrap_or_default()),
                impressions: count(
                    json_f64(prop(&self.impressions)?, &["number"]).unwrap_or_default(),
                ),
                ctr: json_f64(prop(&self.ctr)?, &["number"]).unwrap_or_default(),
                position: json_f64(prop(&self.position)?, &["number"]).unwrap_or_default(),
            },
        })
    }

    pub fn key_filter(&self, key: &RowKey) -> JsonValue {
        json!({
            "property": self.key,
            "title": { "equals": key.as_str() },
        })
    }
}

fn text_value(kind: &str, content: &str) -> JsonValue {
    let mut out = serde_json::Map::new();
    out.insert(
        kind.to_string(),
        json!([{ "type": "text", "text": { "content": content } }]),
    );
    JsonValue::Object(out)
}

fn select_value(name: &str) -> JsonValue {
    match non_empty(name) {
        Some(name) => json!({ "select": { "name": name } }),
        None => json!({ "select": null }),
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(value)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_f64()
}

fn plain_text(value: &JsonValue, kind: &str) -> String {
    value
        .get(kind)
        .and_then(|v| v.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| {
                    json_str(part, &["plain_text"]).or_else(|| json_str(part, &["text", "content"]))
                })
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Ids of query results. Pages edited by hand may lack properties; only the
/// id is required here.
fn page_ids(results: &[JsonValue]) -> Result<Vec<RecordId>, String> {
    results
        .iter()
        .map(|page| {
            json_str(page, &["id"])
                .map(RecordId::new)
                .ok_or_else(|| "query result without an id".to_string())
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct NotionRecordStore {
    client: Client,
    api_base: String,
    token: String,
    database_id: String,
    schema: PropertySchema,
}

#[derive(Debug, Deserialize)]
struct NotionQueryResponse {
    #[serde(default)]
    results: Vec<JsonValue>,
}

impl NotionRecordStore {
    pub fn new(client: Client, token: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            client,
            api_base: NOTION_API_BASE.to_string(),
            token: token.into(),
            database_id: database_id.into(),
            schema: PropertySchema::default(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_schema(mut self, schema: PropertySchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn schema(&self) -> &PropertySchema {
        &self.schema
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION)
    }

    async fn send_for_page(&self, req: reqwest::RequestBuilder) -> Result<DestinationRecord, ApiError> {
        let resp = check_response(req.send().await?).await?;
        let url = resp.url().to_string();
        let page: JsonValue = resp.json().await?;
        self.schema
            .decode_page(&page)
            .map_err(|message| ApiError::Decode { url, message })
    }
}

#[async_trait]
impl RecordStore for NotionRecordStore {
    #[instrument(skip(self, key), fields(key = %key))]
    async fn find_by_key(&self, key: &RowKey) -> Result<Vec<RecordId>, ApiError> {
        let url = endpoint(
            &self.api_base,
            &["v1", "databases", self.database_id.as_str(), "query"],
        )?;
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&json!({
                "filter": self.schema.key_filter(key),
                "page_size": 100,
            }))
            .send()
            .await?;
        let resp = check_response(resp).await?;
        let url = resp.url().to_string();
        let body: NotionQueryResponse = resp.json().await?;
        page_ids(&body.results).map_err(|message| ApiError::Decode { url, message })
    }

    #[instrument(skip(self, properties), fields(key = %properties.key))]
    async fn create(&self, properties: &RowProperties) -> Result<DestinationRecord, ApiError> {
        let url = endpoint(&self.api_base, &["v1", "pages"])?;
        let req = self.request(reqwest::Method::POST, url).json(&json!({
            "parent": { "database_id": self.database_id },
            "properties": self.schema.encode(properties),
        }));
        self.send_for_page(req).await
    }

    #[instrument(skip(self, properties), fields(key = %properties.key))]
    async fn update(
        &self,
        id: &RecordId,
        properties: &RowProperties,
    ) -> Result<DestinationRecord, ApiError> {
        let url = endpoint(&self.api_base, &["v1", "pages", id.as_str()])?;
        let req = self
            .request(reqwest::Method::PATCH, url)
            .json(&json!({ "properties": self.schema.encode(properties) }));
        self.send_for_page(req).await
    }
}
