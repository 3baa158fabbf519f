use crate::amo::session::{AmoSession, CrmError};
use crate::store::TokenStore;
use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct CustomFieldValue {
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomField {
    pub field_id: i64,
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default)]
    pub values: Vec<CustomFieldValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Lead {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub status_id: i64,
    #[serde(default)]
    pub responsible_user_id: Option<i64>,
    /// Unix seconds of the last CRM-side change; used as the submission
    /// instant for deadline computation.
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub custom_fields_values: Option<Vec<CustomField>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Deserialize)]
pub struct Contact {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub custom_fields_values: Option<Vec<CustomField>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddedUsers {
    #[serde(default)]
    pub users: Vec<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub current_user_id: Option<i64>,
    #[serde(default, rename = "_embedded")]
    pub embedded: Option<EmbeddedUsers>,
}

/// The CRM operations the reconciliation pipeline depends on. Narrowed to a
/// trait so pipeline tests can substitute a scripted CRM.
#[async_trait]
pub trait CrmApi: Send + Sync {
    async fn lead(&self, id: i64) -> Result<Option<Lead>, CrmError>;
    async fn user(&self, id: i64) -> Result<Option<User>, CrmError>;
    async fn add_note(&self, lead_id: i64, text: &str) -> Result<(), CrmError>;
}

/// Typed gateway over the [`AmoSession`]. Missing entities come back as
/// `None` with a warning; auth and transport failures propagate.
pub struct AmoClient<T: TokenStore> {
    session: AmoSession<T>,
}

impl<T: TokenStore> AmoClient<T> {
    pub fn new(session: AmoSession<T>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &AmoSession<T> {
        &self.session
    }

    pub async fn account(&self) -> Result<Option<Account>, CrmError> {
        let response = self
            .session
            .request(Method::GET, "/api/v4/account?with=users", None)
            .await?;
        let account: Account = parse_checked(response).await?;
        if account.id.is_none() {
            return Ok(None);
        }
        Ok(Some(account))
    }

    #[allow(dead_code)]
    pub async fn contact(&self, id: i64) -> Result<Option<Contact>, CrmError> {
        self.fetch_entity("contact", &format!("/api/v4/contacts/{id}"), id)
            .await
    }

    async fn fetch_entity<E>(
        &self,
        kind: &'static str,
        path: &str,
        id: i64,
    ) -> Result<Option<E>, CrmError>
    where
        E: for<'de> Deserialize<'de>,
    {
        let response = self.session.request(Method::GET, path, None).await?;
        if is_missing(response.status()) {
            warn!(target = "permit.amo", kind = kind, id = id, "entity not found");
            return Ok(None);
        }
        parse_checked(response).await.map(Some)
    }
}

#[async_trait]
impl<T: TokenStore> CrmApi for AmoClient<T> {
    async fn lead(&self, id: i64) -> Result<Option<Lead>, CrmError> {
        self.fetch_entity("lead", &format!("/api/v4/leads/{id}"), id)
            .await
    }

    async fn user(&self, id: i64) -> Result<Option<User>, CrmError> {
        self.fetch_entity("user", &format!("/api/v4/users/{id}"), id)
            .await
    }

    async fn add_note(&self, lead_id: i64, text: &str) -> Result<(), CrmError> {
        let body = json!([{
            "note_type": "common",
            "params": { "text": text },
        }]);
        let response = self
            .session
            .request(
                Method::POST,
                &format!("/api/v4/leads/{lead_id}/notes"),
                Some(&body),
            )
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(CrmError::Request(format!(
                "note create failed: HTTP {status}. {detail}"
            )));
        }
        Ok(())
    }
}

/// AmoCRM answers both 404 and 204 for absent entities depending on the
/// endpoint.
fn is_missing(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT
}

async fn parse_checked<E>(response: Response) -> Result<E, CrmError>
where
    E: for<'de> Deserialize<'de>,
{
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        let detail = response.text().await.unwrap_or_default();
        return Err(CrmError::Unauthorized(format!("HTTP 401. {detail}")));
    }
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(CrmError::Request(format!("HTTP {status}. {detail}")));
    }
    response
        .json::<E>()
        .await
        .map_err(|err| CrmError::Deserialize(err.to_string()))
}
