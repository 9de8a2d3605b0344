//! Core lead model and run configuration for leadsync.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "leadsync-core";

/// Lead object exactly as returned by the upstream API. No schema is enforced.
pub type RawRecord = JsonValue;

/// Flat contact record produced by the normalizer and handed to the writer.
///
/// Field order here is the serialized column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_time: Option<String>,
    pub raw: RawRecord,
}

impl ContactRecord {
    /// Identifier, if present and non-empty.
    pub fn lead_id(&self) -> Option<&str> {
        non_empty(self.id.as_deref())
    }

    /// True when at least one of email or phone carries a value.
    pub fn has_contact_channel(&self) -> bool {
        non_empty(self.email.as_deref()).is_some() || non_empty(self.phone.as_deref()).is_some()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

impl OutputFormat {
    pub fn file_name(self) -> &'static str {
        match self {
            OutputFormat::Json => "new_leads.json",
            OutputFormat::Csv => "new_leads.csv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("META_ACCESS_TOKEN is not set; add it to the environment or .env, or use --mock-sample")]
    MissingAccessToken,
    #[error("LEAD_FORM_ID is not set; add it to the environment or .env, or use --mock-sample")]
    MissingLeadFormId,
}

/// Credential pair required for any call against the Graph leads endpoint.
#[derive(Debug, Clone, Copy)]
pub struct GraphCredentials<'a> {
    pub access_token: &'a str,
    pub lead_form_id: &'a str,
}

pub const DEFAULT_GRAPH_API_VERSION: &str = "v16.0";
pub const DEFAULT_GRAPH_API_BASE: &str = "https://graph.facebook.com";
pub const DEFAULT_DB_PATH: &str = "data/seen_leads.db";
pub const DEFAULT_SAMPLE_PATH: &str = "data/meta_leads_sample.json";
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Process configuration, read once at startup and passed by reference.
#[derive(Debug, Clone)]
pub struct LeadSyncConfig {
    pub access_token: Option<String>,
    pub lead_form_id: Option<String>,
    pub graph_api_version: String,
    pub graph_api_base: String,
    pub db_path: PathBuf,
    pub page_size: u32,
    pub sample_path: PathBuf,
    pub output_dir: PathBuf,
    pub http_timeout_secs: u64,
}

impl Default for LeadSyncConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            lead_form_id: None,
            graph_api_version: DEFAULT_GRAPH_API_VERSION.to_string(),
            graph_api_base: DEFAULT_GRAPH_API_BASE.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            page_size: DEFAULT_PAGE_SIZE,
            sample_path: PathBuf::from(DEFAULT_SAMPLE_PATH),
            output_dir: PathBuf::from("."),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl LeadSyncConfig {
    /// Loads `.env` (if any) and reads the process environment.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            access_token: var("META_ACCESS_TOKEN"),
            lead_form_id: var("LEAD_FORM_ID"),
            graph_api_version: var("GRAPH_API_VERSION").unwrap_or(defaults.graph_api_version),
            graph_api_base: var("GRAPH_API_BASE").unwrap_or(defaults.graph_api_base),
            db_path: var("DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            page_size: var("PAGE_SIZE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.page_size),
            sample_path: var("SAMPLE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.sample_path),
            output_dir: var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            http_timeout_secs: var("HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
        }
    }

    pub fn require_credentials(&self) -> Result<GraphCredentials<'_>, ConfigError> {
        let access_token = self
            .access_token
            .as_deref()
            .ok_or(ConfigError::MissingAccessToken)?;
        let lead_form_id = self
            .lead_form_id
            .as_deref()
            .ok_or(ConfigError::MissingLeadFormId)?;
        Ok(GraphCredentials {
            access_token,
            lead_form_id,
        })
    }

    /// `{base}/{version}/{form_id}/leads`
    pub fn leads_url(&self, lead_form_id: &str) -> String {
        format!(
            "{}/{}/{}/leads",
            self.graph_api_base.trim_end_matches('/'),
            self.graph_api_version.trim_matches('/'),
            lead_form_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = LeadSyncConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config.graph_api_version, "v16.0");
        assert_eq!(config.graph_api_base, "https://graph.facebook.com");
        assert_eq!(config.db_path, PathBuf::from("data/seen_leads.db"));
        assert_eq!(config.page_size, 100);
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(
            config.require_credentials().unwrap_err(),
            ConfigError::MissingAccessToken
        );
    }

    #[test]
    fn unparsable_page_size_falls_back_and_blank_token_counts_as_missing() {
        let config = LeadSyncConfig::from_lookup(lookup_from(&[
            ("PAGE_SIZE", "lots"),
            ("META_ACCESS_TOKEN", "   "),
            ("LEAD_FORM_ID", "123"),
        ]));
        assert_eq!(config.page_size, 100);
        assert!(config.access_token.is_none());
        assert_eq!(config.lead_form_id.as_deref(), Some("123"));
    }

    #[test]
    fn credentials_require_form_id_too() {
        let config = LeadSyncConfig::from_lookup(lookup_from(&[("META_ACCESS_TOKEN", "tok")]));
        assert_eq!(
            config.require_credentials().unwrap_err(),
            ConfigError::MissingLeadFormId
        );

        let config = LeadSyncConfig::from_lookup(lookup_from(&[
            ("META_ACCESS_TOKEN", "tok"),
            ("LEAD_FORM_ID", "987"),
        ]));
        let creds = config.require_credentials().expect("credentials");
        assert_eq!(creds.access_token, "tok");
        assert_eq!(creds.lead_form_id, "987");
    }

    #[test]
    fn leads_url_joins_base_version_and_form() {
        let config = LeadSyncConfig::from_lookup(lookup_from(&[
            ("GRAPH_API_BASE", "http://localhost:9000/"),
            ("GRAPH_API_VERSION", "v24.0"),
        ]));
        assert_eq!(
            config.leads_url("555"),
            "http://localhost:9000/v24.0/555/leads"
        );
    }

    #[test]
    fn contact_channel_ignores_empty_strings() {
        let record = ContactRecord {
            id: Some(String::new()),
            name: Some("Ann".to_string()),
            email: Some(String::new()),
            phone: None,
            created_time: None,
            raw: JsonValue::Null,
        };
        assert!(record.lead_id().is_none());
        assert!(!record.has_contact_channel());
    }
}
