//! Registry of live state machines.
//!
//! Owned by whichever component constructs it and passed down explicitly;
//! there is no process-global registry so tests can run isolated instances.

use crate::machine::{LifecycleError, StateMachine};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct MachineRegistry {
    machines: DashMap<String, Arc<StateMachine>>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, machine: StateMachine) -> Arc<StateMachine> {
        let machine = Arc::new(machine);
        self.machines
            .insert(machine.id().to_string(), machine.clone());
        machine
    }

    pub fn get(&self, id: &str) -> Result<Arc<StateMachine>, LifecycleError> {
        self.machines
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LifecycleError::MachineNotFound(id.to_string()))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<StateMachine>> {
        self.machines.remove(id).map(|(_, machine)| machine)
    }

    pub fn ids(&self) -> Vec<String> {
        self.machines.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::deployment_machine;

    #[tokio::test]
    async fn insert_get_remove() {
        let registry = MachineRegistry::new();
        registry.insert(deployment_machine("intent-a", 3));
        registry.insert(deployment_machine("intent-b", 3));

        assert_eq!(registry.len(), 2);
        let machine = registry.get("intent-a").unwrap();
        assert_eq!(machine.id(), "intent-a");

        registry.remove("intent-a");
        assert!(registry.get("intent-a").is_err());
        assert_eq!(registry.len(), 1);
    }
}
