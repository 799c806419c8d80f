use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use gscsync_adapters::{
    NotionRecordStore, PropertySchema, SearchConsoleClient, NOTION_API_BASE,
    SEARCH_CONSOLE_API_BASE,
};
use gscsync_http::HttpClientConfig;

/// Credentials and endpoints read from the process environment.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub gsc_access_token: Option<String>,
    pub gsc_api_base: String,
    pub notion_token: Option<String>,
    pub notion_database_id: Option<String>,
    pub notion_api_base: String,
    pub http_timeout_secs: u64,
    pub user_agent: Option<String>,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            gsc_access_token: non_empty_var("GSC_ACCESS_TOKEN"),
            gsc_api_base: non_empty_var("GSC_API_BASE")
                .unwrap_or_else(|| SEARCH_CONSOLE_API_BASE.to_string()),
            notion_token: non_empty_var("NOTION_TOKEN"),
            notion_database_id: non_empty_var("NOTION_DATABASE_ID"),
            notion_api_base: non_empty_var("NOTION_API_BASE")
                .unwrap_or_else(|| NOTION_API_BASE.to_string()),
            http_timeout_secs: non_empty_var("GSCSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: non_empty_var("GSCSYNC_USER_AGENT"),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        let defaults = HttpClientConfig::default();
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone().or(defaults.user_agent),
        }
    }

    pub fn search_console(&self, client: reqwest::Client) -> Result<SearchConsoleClient> {
        let token = self
            .gsc_access_token
            .clone()
            .context("GSC_ACCESS_TOKEN is required")?;
        Ok(SearchConsoleClient::new(client, token).with_api_base(self.gsc_api_base.clone()))
    }

    pub fn notion(&self, client: reqwest::Client, schema: PropertySchema) -> Result<NotionRecordStore> {
        let token = self.notion_token.clone().context("NOTION_TOKEN is required")?;
        let database_id = self
            .notion_database_id
            .clone()
            .context("NOTION_DATABASE_ID is required")?;
        Ok(NotionRecordStore::new(client, token, database_id)
            .with_api_base(self.notion_api_base.clone())
            .with_schema(schema))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Destination property names from a YAML file; keys left out keep their
/// defaults.
pub fn load_property_schema(path: impl AsRef<Path>) -> Result<PropertySchema> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
