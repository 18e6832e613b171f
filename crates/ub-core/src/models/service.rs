use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ServiceStatus {
    Pending,
    Scheduling,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceStatus {
    /// Legal forward transitions. Terminal states admit no successor;
    /// a stop request (`Stopping`) is allowed from any live state.
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        match (self, next) {
            (Pending, Scheduling) | (Scheduling, Starting) | (Starting, Running) => true,
            (Pending | Scheduling | Starting | Running, Stopping) => true,
            (Pending | Scheduling | Starting | Running, Failed) => true,
            (Stopping, Stopped) | (Stopping, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed)
    }
}

/// One deployed (or attempting-to-run) inference server. Owned by the
/// service registry and mutated only by the service manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: String,
    pub recipe_name: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub nodes: Vec<String>,
    /// Resolved endpoint URLs keyed by port name, e.g. `api` ->
    /// `http://node042:8000`. Populated once the job is running.
    pub endpoints: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceInstance {
    pub fn new(recipe_name: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            recipe_name,
            status: ServiceStatus::Pending,
            job_id: None,
            nodes: Vec::new(),
            endpoints: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_is_legal() {
        use ServiceStatus::*;
        assert!(Pending.can_transition_to(Scheduling));
        assert!(Scheduling.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn no_backward_transitions() {
        use ServiceStatus::*;
        assert!(!Running.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Scheduling));
        assert!(!Starting.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn terminal_states_are_final() {
        use ServiceStatus::*;
        for next in [Pending, Scheduling, Starting, Running, Stopping, Stopped, Failed] {
            assert!(!Stopped.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn new_instance_starts_pending() {
        let instance = ServiceInstance::new("vllm-inference".into());
        assert_eq!(instance.status, ServiceStatus::Pending);
        assert!(instance.job_id.is_none());
        assert!(instance.endpoints.is_empty());
    }
}
