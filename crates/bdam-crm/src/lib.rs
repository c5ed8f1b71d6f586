//! Typed client for the Bitrix REST endpoints plus the list-field dictionary.

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use bdam_core::{fields, CompanyRecord, DealRecord};

pub const CRATE_NAME: &str = "bdam-crm";

#[derive(Debug, Clone)]
pub struct CrmClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl CrmClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(20),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("crm returned http status {status} for {method}")]
    HttpStatus { status: u16, method: &'static str },
    #[error("crm returned an empty result envelope for {method}")]
    EmptyResult { method: &'static str },
}

/// Every REST method wraps its payload in `{ "result": ... }`.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ResultEnvelope<T> {
    #[serde(default)]
    result: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldMeta {
    #[serde(default)]
    pub items: Vec<FieldOption>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldOption {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "VALUE")]
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
}

impl CrmClient {
    pub fn new(config: CrmClientConfig) -> Result<Self, CrmError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn get_deal(&self, id: &str) -> Result<DealRecord, CrmError> {
        self.get_entity("crm.deal.get", id).await
    }

    pub async fn get_company(&self, id: &str) -> Result<CompanyRecord, CrmError> {
        self.get_entity("crm.company.get", id).await
    }

    async fn get_entity<T: DeserializeOwned>(
        &self,
        method: &'static str,
        id: &str,
    ) -> Result<T, CrmError> {
        let url = format!("{}/{}?id={}", self.base_url, method, id);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CrmError::HttpStatus {
                status: status.as_u16(),
                method,
            });
        }
        let envelope: ResultEnvelope<T> = response.json().await?;
        envelope.result.ok_or(CrmError::EmptyResult { method })
    }

    /// Field metadata for the deal entity, keyed by field code.
    pub async fn get_deal_fields(&self) -> Result<HashMap<String, FieldMeta>, CrmError> {
        let method = "crm.deal.fields.json";
        let url = format!("{}/{}", self.base_url, method);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CrmError::HttpStatus {
                status: status.as_u16(),
                method,
            });
        }
        let envelope: ResultEnvelope<HashMap<String, FieldMeta>> = response.json().await?;
        envelope.result.ok_or(CrmError::EmptyResult { method })
    }

    /// Best-effort title push. A rejected or failed update is logged with the
    /// response body and swallowed; the caller proceeds with its local title.
    pub async fn update_deal_title(&self, id: &str, title: &str) {
        let url = format!("{}/crm.deal.update.json", self.base_url);
        let body = serde_json::json!({ "id": id, "fields": { "TITLE": title } });
        match self.http.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                info!(deal_id = id, title, "deal title updated in crm");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(deal_id = id, %status, body, "crm rejected the title update");
            }
            Err(err) => {
                warn!(deal_id = id, error = %err, "title update request failed");
            }
        }
    }
}

/// The three tracked list fields whose option ids get translated to labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListFieldGroup {
    ReturnType,
    DemandType,
    Executor,
}

impl ListFieldGroup {
    pub const ALL: [ListFieldGroup; 3] = [
        ListFieldGroup::ReturnType,
        ListFieldGroup::DemandType,
        ListFieldGroup::Executor,
    ];

    pub fn field_code(self) -> &'static str {
        match self {
            Self::ReturnType => fields::RETURN_TYPE,
            Self::DemandType => fields::DEMAND_TYPE,
            Self::Executor => fields::EXECUTOR,
        }
    }
}

/// Option-id-to-label mapping for the tracked list fields.
///
/// Built once at startup and immutable afterwards; a failed load leaves the
/// dictionary empty and every translation degrades to `None`. Picking up
/// CRM-side option changes requires a process restart.
#[derive(Debug, Default)]
pub struct ListFieldDictionary {
    maps: HashMap<ListFieldGroup, HashMap<String, String>>,
}

impl ListFieldDictionary {
    /// Fetch field metadata and build the dictionary. Never fails past this
    /// boundary: any fetch or shape error is logged and yields the empty
    /// dictionary.
    pub async fn load(client: &CrmClient) -> Self {
        match Self::try_load(client).await {
            Ok(dictionary) => dictionary,
            Err(err) => {
                warn!(error = %err, "list-field dictionary load failed; translations degrade to null");
                Self::default()
            }
        }
    }

    async fn try_load(client: &CrmClient) -> Result<Self, CrmError> {
        let all_fields = client.get_deal_fields().await?;
        let mut maps = HashMap::new();
        for group in ListFieldGroup::ALL {
            match all_fields.get(group.field_code()) {
                Some(meta) if !meta.items.is_empty() => {
                    let map: HashMap<String, String> = meta
                        .items
                        .iter()
                        .map(|option| (option.id.clone(), option.value.clone()))
                        .collect();
                    info!(?group, options = map.len(), "list-field dictionary loaded");
                    maps.insert(group, map);
                }
                _ => {
                    warn!(?group, code = group.field_code(), "no options found for list field");
                }
            }
        }
        Ok(Self { maps })
    }

    /// Build a dictionary from literal entries; used by tests and tools.
    pub fn from_entries<I, J>(entries: I) -> Self
    where
        I: IntoIterator<Item = (ListFieldGroup, J)>,
        J: IntoIterator<Item = (String, String)>,
    {
        let maps = entries
            .into_iter()
            .map(|(group, options)| (group, options.into_iter().collect()))
            .collect();
        Self { maps }
    }

    /// Pure lookup; `None` on unknown group or option id.
    pub fn translate(&self, group: ListFieldGroup, option_id: &str) -> Option<&str> {
        self.maps.get(&group)?.get(option_id).map(String::as_str)
    }
}
