use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::service::ServiceStatus;

/// One deployed metrics/dashboard stack. Same lifecycle shape as a
/// service, without health probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorInstance {
    pub id: String,
    pub recipe_name: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MonitorInstance {
    pub fn new(recipe_name: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            recipe_name,
            status: ServiceStatus::Pending,
            job_id: None,
            endpoint: None,
            created_at: Utc::now(),
            error: None,
        }
    }
}
