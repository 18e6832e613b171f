use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;

use crate::error::{OrchestratorError, Result};
use crate::models::{ClientRun, MonitorInstance, ServiceInstance};

/// Entities stored in a registry expose their identity.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for ServiceInstance {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for ClientRun {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for MonitorInstance {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Concurrency-safe id -> entity map; the single source of truth for live
/// orchestration state.
///
/// Each entity sits behind its own mutex, so `update` is serialized per id
/// rather than globally; the outer lock is held only to look entries up or
/// change the index. `list` and `get` hand out point-in-time clones, never
/// live handles — all mutation goes through `update`.
pub struct Registry<T> {
    entries: RwLock<Vec<(String, Arc<Mutex<T>>)>>,
    not_found: fn(String) -> OrchestratorError,
}

pub type ServiceRegistry = Registry<ServiceInstance>;
pub type RunRegistry = Registry<ClientRun>;
pub type MonitorRegistry = Registry<MonitorInstance>;

impl<T: Keyed + Clone> Registry<T> {
    pub fn new(not_found: fn(String) -> OrchestratorError) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            not_found,
        }
    }

    pub async fn insert(&self, entity: T) -> Result<()> {
        let mut entries = self.entries.write().await;
        let key = entity.key().to_string();
        if entries.iter().any(|(k, _)| *k == key) {
            return Err(OrchestratorError::AlreadyExists(key));
        }
        entries.push((key, Arc::new(Mutex::new(entity))));
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<T> {
        let slot = self.slot(id).await?;
        let entity = slot.lock().unwrap();
        Ok(entity.clone())
    }

    /// Atomic read-modify-write of one entity, returning the updated value.
    pub async fn update<F: FnOnce(&mut T)>(&self, id: &str, mutator: F) -> Result<T> {
        let slot = self.slot(id).await?;
        let mut entity = slot.lock().unwrap();
        mutator(&mut entity);
        Ok(entity.clone())
    }

    /// Snapshot of matching entities in insertion order.
    pub async fn list<F: Fn(&T) -> bool>(&self, filter: F) -> Vec<T> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(_, slot)| slot.lock().unwrap().clone())
            .filter(|entity| filter(entity))
            .collect()
    }

    pub async fn list_all(&self) -> Vec<T> {
        self.list(|_| true).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(k, _)| k != id);
        if entries.len() == before {
            return Err((self.not_found)(id.to_string()));
        }
        Ok(())
    }

    async fn slot(&self, id: &str) -> Result<Arc<Mutex<T>>> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .find(|(k, _)| k == id)
            .map(|(_, slot)| Arc::clone(slot))
            .ok_or_else(|| (self.not_found)(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ServiceInstance, ServiceStatus};

    fn registry() -> ServiceRegistry {
        Registry::new(OrchestratorError::ServiceNotFound)
    }

    #[tokio::test]
    async fn insert_then_get() {
        let registry = registry();
        let instance = ServiceInstance::new("vllm-inference".into());
        let id = instance.id.clone();
        registry.insert(instance).await.unwrap();
        let fetched = registry.get(&id).await.unwrap();
        assert_eq!(fetched.recipe_name, "vllm-inference");
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let registry = registry();
        let instance = ServiceInstance::new("a".into());
        registry.insert(instance.clone()).await.unwrap();
        assert!(matches!(
            registry.insert(instance).await,
            Err(OrchestratorError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let registry = registry();
        assert!(matches!(
            registry.get("nope").await,
            Err(OrchestratorError::ServiceNotFound(_))
        ));
        assert!(matches!(
            registry.update("nope", |_| {}).await,
            Err(OrchestratorError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_preserves_insertion_order() {
        let registry = registry();
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let instance = ServiceInstance::new(name.into());
            ids.push(instance.id.clone());
            registry.insert(instance).await.unwrap();
        }
        let listed = registry.list_all().await;
        let listed_ids: Vec<_> = listed.iter().map(|s| s.id.clone()).collect();
        assert_eq!(listed_ids, ids);
    }

    #[tokio::test]
    async fn list_filter_applies() {
        let registry = registry();
        let mut running = ServiceInstance::new("a".into());
        running.status = ServiceStatus::Running;
        registry.insert(running).await.unwrap();
        registry
            .insert(ServiceInstance::new("b".into()))
            .await
            .unwrap();
        let listed = registry
            .list(|s| s.status == ServiceStatus::Running)
            .await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].recipe_name, "a");
    }

    #[tokio::test]
    async fn remove_then_get_fails() {
        let registry = registry();
        let instance = ServiceInstance::new("a".into());
        let id = instance.id.clone();
        registry.insert(instance).await.unwrap();
        registry.remove(&id).await.unwrap();
        assert!(registry.get(&id).await.is_err());
        assert!(registry.remove(&id).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_updates_stay_inside_the_state_machine() {
        let registry = Arc::new(registry());
        let instance = ServiceInstance::new("a".into());
        let id = instance.id.clone();
        registry.insert(instance).await.unwrap();

        // Many tasks race to advance the same entity; every update checks
        // adjacency before applying, so the observed status sequence can
        // never leave the declared state machine.
        let path = [
            ServiceStatus::Scheduling,
            ServiceStatus::Starting,
            ServiceStatus::Running,
            ServiceStatus::Stopping,
            ServiceStatus::Stopped,
        ];
        let mut handles = Vec::new();
        for next in path {
            for _ in 0..4 {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                handles.push(tokio::spawn(async move {
                    registry
                        .update(&id, |s| {
                            if s.status.can_transition_to(next) {
                                s.status = next;
                            }
                        })
                        .await
                        .unwrap();
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let final_state = registry.get(&id).await.unwrap();
        // Whatever interleaving happened, the result is a reachable state.
        assert!(matches!(
            final_state.status,
            ServiceStatus::Scheduling
                | ServiceStatus::Starting
                | ServiceStatus::Running
                | ServiceStatus::Stopping
                | ServiceStatus::Stopped
        ));
    }

    #[tokio::test]
    async fn updates_on_same_id_do_not_lose_writes() {
        let registry = Arc::new(registry());
        let instance = ServiceInstance::new("a".into());
        let id = instance.id.clone();
        registry.insert(instance).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .update(&id, |s| s.nodes.push(format!("node{i}")))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let final_state = registry.get(&id).await.unwrap();
        assert_eq!(final_state.nodes.len(), 50);
    }
}
