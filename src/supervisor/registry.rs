use std::collections::BTreeMap;

use crate::config::{ManagerSettings, SupervisorConfig};
use crate::error::{Result, WardenError};
use crate::store::Store;

/// Affinity -> manager settings mapping, built once at supervisor startup.
///
/// Components referencing an affinity nobody manages are a configuration
/// error and are surfaced before any manager is launched, not at runtime.
pub struct ManagerRegistry {
    settings: BTreeMap<String, ManagerSettings>,
}

impl ManagerRegistry {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            settings: config.managers.clone(),
        }
    }

    pub fn get(&self, affinity: &str) -> Option<&ManagerSettings> {
        self.settings.get(affinity)
    }

    pub fn affinities(&self) -> impl Iterator<Item = (&String, &ManagerSettings)> {
        self.settings.iter()
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// Verify every affinity referenced by the store is registered.
    pub fn validate_store(&self, store: &Store) -> Result<()> {
        for record in store.list_all_components()? {
            if !self.settings.contains_key(&record.manager_affinity) {
                return Err(WardenError::UnknownAffinity {
                    affinity: record.manager_affinity,
                    component: record.component_id,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{ComponentRecord, DesiredState};

    fn seeded_store() -> Store {
        let store = Store::open_memory().unwrap();
        store.migrate().unwrap();
        store
            .insert_component(&ComponentRecord {
                component_id: "c1".to_string(),
                base_script_name: "c1.py".to_string(),
                manager_affinity: "daemon_manager".to_string(),
                desired_state: DesiredState::Active,
                launch_args_json: "{}".to_string(),
                run_type_on_boot: "PRIMARY_RUN".to_string(),
                description: None,
            })
            .unwrap();
        store
    }

    #[test]
    fn known_affinities_validate() {
        let registry = ManagerRegistry::from_config(&SupervisorConfig::default());
        registry.validate_store(&seeded_store()).unwrap();
        assert!(registry.get("daemon_manager").is_some());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn unknown_affinity_is_a_startup_error() {
        let store = seeded_store();
        store
            .insert_component(&ComponentRecord {
                component_id: "orphan".to_string(),
                base_script_name: "orphan.py".to_string(),
                manager_affinity: "nobody_manager".to_string(),
                desired_state: DesiredState::Active,
                launch_args_json: "{}".to_string(),
                run_type_on_boot: "PRIMARY_RUN".to_string(),
                description: None,
            })
            .unwrap();

        let registry = ManagerRegistry::from_config(&SupervisorConfig::default());
        let err = registry.validate_store(&store).unwrap_err();
        assert!(matches!(err, WardenError::UnknownAffinity { .. }));
    }
}
