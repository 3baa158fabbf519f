use crate::http::build_client;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

/// Registry term for a granted permit, lowercase. Matching is
/// case-insensitive against this exact word.
const ISSUED_STATUS: &str = "выдан";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Request(String),
    #[error("registry returned error: {0}")]
    Api(String),
    #[error("invalid registry response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_url: String,
    pub api_token: String,
}

impl RegistryConfig {
    /// Both the endpoint and the token must be configured; otherwise the
    /// registry gate in the pipeline stays closed.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("REGISTRY_BASE_URL").ok()?;
        let api_token = std::env::var("REGISTRY_API_TOKEN").ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }
}

/// One historical permit record for a registration number.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEntry {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default, rename = "startdate")]
    pub start_date: Option<String>,
    #[serde(default, rename = "validitydate")]
    pub validity_date: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default, rename = "type")]
    pub permit_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistryResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    list: Vec<RegistryEntry>,
}

/// Permit registry lookup, behind a trait so pipeline tests can script
/// the responses.
#[async_trait]
pub trait PermitRegistry: Send + Sync {
    /// Looks up the authoritative permit entry for a vehicle registration
    /// number. The registry returns every historical record it holds; the
    /// latest issued one wins.
    async fn lookup(&self, reg_number: &str) -> Result<Option<RegistryEntry>, RegistryError>;
}

pub struct RegistryClient {
    config: RegistryConfig,
    http: Client,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            http: build_client(),
        }
    }
}

#[async_trait]
impl PermitRegistry for RegistryClient {
    async fn lookup(&self, reg_number: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        let url = format!(
            "{}/api/permits?regnum={}",
            self.config.base_url,
            urlencoding::encode(reg_number.trim())
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .map_err(|err| RegistryError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(RegistryError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let payload: RegistryResponse = response
            .json()
            .await
            .map_err(|err| RegistryError::Deserialize(err.to_string()))?;

        if let Some(message) = payload.error {
            return Err(RegistryError::Api(message));
        }

        Ok(select_entry(payload.list))
    }
}

/// Picks the authoritative record: issued entries are preferred, and within
/// the preferred set (or the full set when nothing is issued) the latest
/// validity-end date wins. Unparsable dates rank lowest.
pub fn select_entry(entries: Vec<RegistryEntry>) -> Option<RegistryEntry> {
    if entries.is_empty() {
        return None;
    }

    let issued: Vec<&RegistryEntry> = entries
        .iter()
        .filter(|entry| {
            entry
                .status
                .as_deref()
                .is_some_and(|s| s.trim().to_lowercase() == ISSUED_STATUS)
        })
        .collect();

    let pool: Vec<&RegistryEntry> = if issued.is_empty() {
        entries.iter().collect()
    } else {
        issued
    };

    pool.into_iter()
        .max_by_key(|entry| {
            parse_validity(entry.validity_date.as_deref()).unwrap_or(NaiveDateTime::MIN)
        })
        .cloned()
}

/// Registry dates come as `DD.MM.YYYY` with an optional ` HH:mm` tail.
fn parse_validity(raw: Option<&str>) -> Option<NaiveDateTime> {
    let raw = raw?.trim();
    if let Ok(stamp) = NaiveDateTime::parse_from_str(raw, "%d.%m.%Y %H:%M") {
        return Some(stamp);
    }
    NaiveDate::parse_from_str(raw, "%d.%m.%Y")
        .ok()
        .map(|date| date.and_time(Default::default()))
}
