use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Pending,
    Scheduling,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Scheduling) | (Scheduling, Running) => true,
            (Running, Completed) => true,
            (Pending | Scheduling | Running, Failed) => true,
            (Pending | Scheduling | Running, Cancelled) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// One benchmark client execution. `target_service_id` is a non-owning
/// back-reference: the run keeps the plain id and may outlive the service
/// it pointed at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRun {
    pub id: String,
    pub recipe_name: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_service_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClientRun {
    pub fn new(recipe_name: String, target_service_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            recipe_name,
            status: RunStatus::Pending,
            job_id: None,
            target_service_id,
            created_at: Utc::now(),
            finished_at: None,
            results_path: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_is_legal() {
        use RunStatus::*;
        assert!(Pending.can_transition_to(Scheduling));
        assert!(Scheduling.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));
    }

    #[test]
    fn completed_requires_running() {
        use RunStatus::*;
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Scheduling.can_transition_to(Completed));
    }

    #[test]
    fn terminal_states_are_final() {
        use RunStatus::*;
        for next in [Pending, Scheduling, Running, Completed, Failed, Cancelled] {
            assert!(!Completed.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
            assert!(!Cancelled.can_transition_to(next));
        }
    }
}
