use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::HashMap;

/// Closed set of AmoCRM pipeline statuses this bridge reacts to. The raw
/// ids come from the agency's pipeline configuration; anything else is
/// carried as `Unknown` and rendered as step 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadStatus {
    DocumentCheck,
    PreparingSubmission,
    DocumentsSubmitted,
    PermitReleased,
    Rejected,
    Unknown(i64),
}

impl LeadStatus {
    pub fn from_id(status_id: i64) -> Self {
        match status_id {
            41_138_302 => LeadStatus::DocumentCheck,
            41_138_689 => LeadStatus::PreparingSubmission,
            41_138_692 => LeadStatus::DocumentsSubmitted,
            41_138_695 => LeadStatus::PermitReleased,
            41_138_698 => LeadStatus::Rejected,
            other => LeadStatus::Unknown(other),
        }
    }

    /// Progress step shown on the tracking page. Rejected is terminal and
    /// shares the final step with PermitReleased.
    pub fn step(&self) -> i32 {
        match self {
            LeadStatus::DocumentCheck => 1,
            LeadStatus::PreparingSubmission => 2,
            LeadStatus::DocumentsSubmitted => 3,
            LeadStatus::PermitReleased => 4,
            LeadStatus::Rejected => 4,
            LeadStatus::Unknown(_) => 1,
        }
    }

    /// The first status at which a public slug is assigned.
    pub fn qualifies_for_slug(&self) -> bool {
        matches!(self, LeadStatus::PreparingSubmission)
    }

    /// Early statuses at which the tracking link note is posted back to
    /// the lead (guarded elsewhere by "no slug existed before this cycle").
    pub fn posts_tracking_link(&self) -> bool {
        matches!(
            self,
            LeadStatus::DocumentCheck | LeadStatus::PreparingSubmission
        )
    }
}

/// Denormalized order record exposed on the tracking page, one row per
/// AmoCRM lead.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderProjection {
    pub amo_lead_id: i64,
    pub hash_slug: Option<String>,
    pub status_id: i64,
    pub status_step: i32,
    pub status_label: Option<String>,
    pub car_info: Value,
    pub permit_info: Value,
    pub manager_contact: Value,
    pub updated_at: DateTime<Utc>,
}

/// Upsert payload handed to the store. `status_step` is derived from
/// `status_id` when not supplied; the slug is computed inside the store.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub amo_lead_id: i64,
    pub status_id: i64,
    pub status_step: Option<i32>,
    pub status_label: Option<String>,
    pub car_info: Value,
    pub permit_info: Value,
    pub manager_contact: Value,
}

/// Access/refresh pair for the AmoCRM session, persisted as a singleton.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Manually curated manager contact details, keyed by AmoCRM user id.
/// Loaded once from `MANAGER_PROFILES_JSON`; the CRM only exposes id and
/// name, everything else here is maintained by the agency by hand.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerProfile {
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub whatsapp: Option<String>,
    pub telegram: Option<String>,
    pub site: Option<String>,
}

static MANAGER_DIRECTORY: Lazy<HashMap<i64, ManagerProfile>> = Lazy::new(|| {
    let Ok(raw) = std::env::var("MANAGER_PROFILES_JSON") else {
        return HashMap::new();
    };
    match serde_json::from_str(&raw) {
        Ok(profiles) => profiles,
        Err(err) => {
            tracing::warn!(
                target = "permit.config",
                error = %err,
                "MANAGER_PROFILES_JSON is not valid JSON, ignoring"
            );
            HashMap::new()
        }
    }
});

pub fn manager_profile(user_id: i64) -> Option<&'static ManagerProfile> {
    MANAGER_DIRECTORY.get(&user_id)
}
