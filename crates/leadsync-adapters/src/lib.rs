//! Graph lead adapters: paginated fetch, field normalization, sample fixtures.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use leadsync_core::{ConfigError, ContactRecord, LeadSyncConfig, RawRecord};
use leadsync_storage::{
    redact_access_token, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "leadsync-adapters";

/// Fields requested from the leads edge on the first page.
pub const LEAD_FIELDS: &str = "field_data,created_time,id";

/// Pause before the single in-page retry on a 5xx.
pub const INLINE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid JSON page from {url}: {source}")]
    InvalidPage {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactAttribute {
    Email,
    Name,
    Phone,
}

/// Ordered `(substring, target)` table applied to lower-cased field names.
/// The first substring contained in the key decides the target.
pub const FIELD_CLASSIFIERS: &[(&str, ContactAttribute)] = &[
    ("email", ContactAttribute::Email),
    ("name", ContactAttribute::Name),
    ("phone", ContactAttribute::Phone),
    ("mobile", ContactAttribute::Phone),
];

/// Top-level keys consulted when `field_data` did not yield a value.
const FALLBACK_KEYS: &[(ContactAttribute, &[&str])] = &[
    (ContactAttribute::Email, &["email", "email_address"]),
    (ContactAttribute::Phone, &["phone", "phone_number"]),
    (ContactAttribute::Name, &["name", "full_name"]),
];

pub fn classify_field_key(lowered_key: &str) -> Option<ContactAttribute> {
    FIELD_CLASSIFIERS
        .iter()
        .find(|(needle, _)| lowered_key.contains(needle))
        .map(|(_, attr)| *attr)
}

#[derive(Debug, Default)]
struct ContactSlots {
    email: Option<String>,
    name: Option<String>,
    phone: Option<String>,
}

impl ContactSlots {
    fn slot_mut(&mut self, attr: ContactAttribute) -> &mut Option<String> {
        match attr {
            ContactAttribute::Email => &mut self.email,
            ContactAttribute::Name => &mut self.name,
            ContactAttribute::Phone => &mut self.phone,
        }
    }

    /// First non-empty assignment sticks.
    fn fill(&mut self, attr: ContactAttribute, value: String) {
        let slot = self.slot_mut(attr);
        if slot.as_deref().map_or(true, str::is_empty) {
            *slot = Some(value);
        }
    }

    fn is_unset(&mut self, attr: ContactAttribute) -> bool {
        self.slot_mut(attr).as_deref().map_or(true, str::is_empty)
    }
}

/// Stringifies an identifier-like scalar. Strings pass through verbatim.
fn stringify_scalar(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Text of a truthy string or number; empty strings, zero, null, bools and
/// containers yield nothing.
fn truthy_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}

/// First entry of a `values` payload; a bare string counts as a one-element list.
fn first_field_value(values: Option<&JsonValue>) -> Option<&JsonValue> {
    match values? {
        JsonValue::Array(items) => items.first(),
        single @ JsonValue::String(_) => Some(single),
        _ => None,
    }
}

/// Maps a raw Graph lead into a flat [`ContactRecord`]. Never fails; anything
/// missing or oddly shaped is simply left unset.
pub fn normalize_lead(raw: &RawRecord) -> ContactRecord {
    let id = raw.get("id").and_then(stringify_scalar);
    let created_time = raw.get("created_time").and_then(stringify_scalar);

    let mut slots = ContactSlots::default();
    let entries = raw
        .get("field_data")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for entry in entries {
        let key = entry
            .get("name")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_lowercase();
        let Some(value) = first_field_value(entry.get("values")).and_then(truthy_text) else {
            continue;
        };
        let Some(attr) = classify_field_key(&key) else {
            continue;
        };
        let value = match attr {
            ContactAttribute::Email => value.trim().to_lowercase(),
            ContactAttribute::Name | ContactAttribute::Phone => value.trim().to_string(),
        };
        slots.fill(attr, value);
    }

    for (attr, keys) in FALLBACK_KEYS {
        if !slots.is_unset(*attr) {
            continue;
        }
        if let Some(value) = keys.iter().find_map(|k| raw.get(*k).and_then(truthy_text)) {
            *slots.slot_mut(*attr) = Some(value);
        }
    }

    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
    ContactRecord {
        id,
        name: non_empty(slots.name),
        email: non_empty(slots.email),
        phone: non_empty(slots.phone),
        created_time,
        raw: raw.clone(),
    }
}

/// One decoded page of the leads edge.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LeadPage {
    pub records: Vec<RawRecord>,
    pub next: Option<String>,
}

impl LeadPage {
    /// Accepts `{"data": [...], "paging": {"next": ...}}` or a bare array.
    /// A missing or non-array `data` is an empty page.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Array(records) => Self {
                records,
                next: None,
            },
            JsonValue::Object(mut map) => {
                let records = match map.remove("data") {
                    Some(JsonValue::Array(records)) => records,
                    _ => Vec::new(),
                };
                let next = map
                    .get("paging")
                    .and_then(|p| p.get("next"))
                    .and_then(JsonValue::as_str)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string);
                Self { records, next }
            }
            _ => Self::default(),
        }
    }
}

/// Transport seam for the leads fetcher.
#[async_trait]
pub trait PageClient: Send + Sync {
    async fn get_page(
        &self,
        url: &str,
        query: Option<&[(String, String)]>,
    ) -> Result<FetchedResponse, FetchError>;
}

#[async_trait]
impl PageClient for HttpFetcher {
    async fn get_page(
        &self,
        url: &str,
        query: Option<&[(String, String)]>,
    ) -> Result<FetchedResponse, FetchError> {
        self.get(url, query).await
    }
}

/// Walks the Graph `/{form}/leads` edge following `paging.next` cursors.
#[derive(Debug)]
pub struct GraphLeadsFetcher<C = HttpFetcher> {
    client: C,
    access_token: Option<String>,
    leads_url: Option<String>,
    page_size: u32,
    inline_retry_delay: Duration,
}

impl GraphLeadsFetcher<HttpFetcher> {
    pub fn from_config(config: &LeadSyncConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(format!("leadsync/{}", env!("CARGO_PKG_VERSION"))),
            ..Default::default()
        })?;
        Ok(Self::with_client(http, config))
    }
}

impl<C: PageClient> GraphLeadsFetcher<C> {
    pub fn with_client(client: C, config: &LeadSyncConfig) -> Self {
        Self {
            client,
            access_token: config.access_token.clone(),
            leads_url: config
                .lead_form_id
                .as_deref()
                .map(|form_id| config.leads_url(form_id)),
            page_size: config.page_size,
            inline_retry_delay: INLINE_RETRY_DELAY,
        }
    }

    pub fn with_inline_retry_delay(mut self, delay: Duration) -> Self {
        self.inline_retry_delay = delay;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn initial_query(&self, access_token: &str, since: Option<&str>) -> Vec<(String, String)> {
        let mut query = vec![
            ("access_token".to_string(), access_token.to_string()),
            ("fields".to_string(), LEAD_FIELDS.to_string()),
            ("limit".to_string(), self.page_size.to_string()),
        ];
        if let Some(since) = since {
            query.push(("since".to_string(), since.to_string()));
        }
        query
    }

    /// Fetches every page and returns the records in upstream order.
    ///
    /// Only the first request carries query parameters; cursor URLs are used
    /// verbatim. `max_pages` stops the walk early when set.
    pub async fn fetch_leads(
        &self,
        since: Option<&str>,
        max_pages: Option<usize>,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let access_token = self
            .access_token
            .as_deref()
            .ok_or(ConfigError::MissingAccessToken)?;
        let Some(leads_url) = &self.leads_url else {
            return Err(ConfigError::MissingLeadFormId.into());
        };

        let mut next_url = Some(leads_url.clone());
        let mut query = Some(self.initial_query(access_token, since));
        let mut leads = Vec::new();
        let mut pages = 0usize;

        while let Some(url) = next_url.take() {
            if let Some(cap) = max_pages {
                if pages >= cap {
                    warn!(max_pages = cap, "page cap reached; remaining pages not fetched");
                    break;
                }
            }

            info!(url = %redact_access_token(&url), "fetching leads page");
            let page = self.fetch_page(&url, query.as_deref()).await?;
            pages += 1;

            if page.records.is_empty() {
                info!("no data in page response");
            } else {
                info!(items = page.records.len(), "fetched page items");
            }
            leads.extend(page.records);

            next_url = page.next;
            query = None;
        }

        info!(total = leads.len(), pages, "total raw leads fetched");
        Ok(leads)
    }

    async fn fetch_page(
        &self,
        url: &str,
        query: Option<&[(String, String)]>,
    ) -> Result<LeadPage, AdapterError> {
        let mut resp = self.client.get_page(url, query).await?;
        if resp.status.is_server_error() {
            warn!(
                status = resp.status.as_u16(),
                delay_ms = self.inline_retry_delay.as_millis() as u64,
                "server error; retrying page once"
            );
            tokio::time::sleep(self.inline_retry_delay).await;
            resp = self.client.get_page(url, query).await?;
        }

        if !resp.status.is_success() {
            return Err(FetchError::HttpStatus {
                status: resp.status.as_u16(),
                url: redact_access_token(&resp.final_url),
            }
            .into());
        }

        let value: JsonValue =
            serde_json::from_slice(&resp.body).map_err(|source| AdapterError::InvalidPage {
                url: redact_access_token(url),
                source,
            })?;
        Ok(LeadPage::from_json(value))
    }
}

/// Loads raw leads from a local JSON fixture instead of the API.
///
/// A missing file is logged and treated as zero leads.
pub fn load_sample_leads(path: impl AsRef<Path>) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        error!(path = %path.display(), "sample file not found");
        return Ok(Vec::new());
    }
    let value: JsonValue = read_json_file(path)?;
    Ok(LeadPage::from_json(value).records)
}

fn read_json_file(path: &Path) -> Result<JsonValue> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
