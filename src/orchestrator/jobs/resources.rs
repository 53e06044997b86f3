use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use uuid::Uuid;

use super::{JobError, ResourceRef, ResourceType};

/// Lifecycle hooks for one resource type. Operations report the states they
/// move a resource through with `enter_state`; `force_fail` moves a resource
/// stuck in a transient state (starting, creating, ...) into an error state
/// and must be safe to call more than once.
pub trait ResourceLifecycle: Send + Sync {
    fn enter_state(&self, resource_id: &str, state: &str, transient: bool) -> Result<(), String>;
    fn is_transient(&self, resource_id: &str) -> Result<bool, String>;
    fn force_fail(&self, resource_id: &str, job_id: Uuid) -> Result<(), String>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    AlreadySettled,
    ForceFailed,
    NoLifecycle,
}

#[derive(Default)]
pub struct ResourceRegistry {
    lifecycles: RwLock<HashMap<ResourceType, Arc<dyn ResourceLifecycle>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        resource_type: ResourceType,
        lifecycle: Arc<dyn ResourceLifecycle>,
    ) -> Result<(), JobError> {
        let mut lifecycles = match self.lifecycles.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if lifecycles.contains_key(&resource_type) {
            return Err(JobError::DuplicateRegistration {
                key: resource_type.as_str().to_owned(),
            });
        }
        lifecycles.insert(resource_type, lifecycle);
        Ok(())
    }

    fn lifecycle(&self, resource_type: ResourceType) -> Option<Arc<dyn ResourceLifecycle>> {
        let lifecycles = match self.lifecycles.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        lifecycles.get(&resource_type).cloned()
    }

    /// Resources without a registered lifecycle are not tracked.
    pub fn enter_state(&self, resource: &ResourceRef, state: &str, transient: bool) -> Result<(), String> {
        let Some(lifecycle) = self.lifecycle(resource.resource_type) else {
            return Ok(());
        };
        lifecycle.enter_state(&resource.resource_id, state, transient)?;
        tracing::debug!(target: "jobs::resources", %resource, state, transient, "resource state recorded");
        Ok(())
    }

    /// Forces the resource out of any transient state left behind by a
    /// failed job.
    pub fn reconcile(&self, resource: &ResourceRef, job_id: Uuid) -> Result<Reconciliation, String> {
        let Some(lifecycle) = self.lifecycle(resource.resource_type) else {
            tracing::debug!(target: "jobs::resources", %resource, "no lifecycle registered");
            return Ok(Reconciliation::NoLifecycle);
        };

        if !lifecycle.is_transient(&resource.resource_id)? {
            return Ok(Reconciliation::AlreadySettled);
        }
        lifecycle.force_fail(&resource.resource_id, job_id)?;
        tracing::warn!(target: "jobs::resources", %resource, %job_id, "resource force-failed");
        Ok(Reconciliation::ForceFailed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedState {
    pub name: String,
    pub transient: bool,
}

/// In-process state table for resources whose authoritative records live
/// elsewhere. Unknown resources count as settled.
#[derive(Debug)]
pub struct TrackedResourceLifecycle {
    failed_state: String,
    states: Mutex<HashMap<String, TrackedState>>,
}

impl TrackedResourceLifecycle {
    pub fn new(failed_state: impl Into<String>) -> Self {
        Self {
            failed_state: failed_state.into(),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, TrackedState>> {
        match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_state(&self, resource_id: impl Into<String>, name: impl Into<String>, transient: bool) {
        self.states().insert(
            resource_id.into(),
            TrackedState {
                name: name.into(),
                transient,
            },
        );
    }

    pub fn state(&self, resource_id: &str) -> Option<TrackedState> {
        self.states().get(resource_id).cloned()
    }
}

impl ResourceLifecycle for TrackedResourceLifecycle {
    fn enter_state(&self, resource_id: &str, state: &str, transient: bool) -> Result<(), String> {
        self.set_state(resource_id, state, transient);
        Ok(())
    }

    fn is_transient(&self, resource_id: &str) -> Result<bool, String> {
        Ok(self
            .states()
            .get(resource_id)
            .is_some_and(|state| state.transient))
    }

    fn force_fail(&self, resource_id: &str, _job_id: Uuid) -> Result<(), String> {
        self.set_state(resource_id, self.failed_state.clone(), false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use crate::orchestrator::jobs::{JobError, ResourceRef, ResourceType};

    use super::{Reconciliation, ResourceRegistry, TrackedResourceLifecycle};

    #[test]
    fn reconcile_force_fails_transient_resource_once() {
        let vms = Arc::new(TrackedResourceLifecycle::new("Error"));
        vms.set_state("vm-1", "Starting", true);
        let registry = ResourceRegistry::new();
        registry
            .register(ResourceType::VirtualMachine, vms.clone())
            .expect("register should pass");

        let vm = ResourceRef::new(ResourceType::VirtualMachine, "vm-1");
        let job_id = Uuid::new_v4();
        assert_eq!(registry.reconcile(&vm, job_id), Ok(Reconciliation::ForceFailed));
        assert_eq!(vms.state("vm-1").expect("tracked").name, "Error");
        assert_eq!(
            registry.reconcile(&vm, job_id),
            Ok(Reconciliation::AlreadySettled)
        );
    }

    #[test]
    fn settled_state_survives_reconciliation() {
        let volumes = Arc::new(TrackedResourceLifecycle::new("Error"));
        let registry = ResourceRegistry::new();
        registry
            .register(ResourceType::Volume, volumes.clone())
            .expect("register should pass");

        let volume = ResourceRef::new(ResourceType::Volume, "vol-3");
        registry
            .enter_state(&volume, "Creating", true)
            .expect("transient state should record");
        registry
            .enter_state(&volume, "Ready", false)
            .expect("settled state should record");

        assert_eq!(
            registry.reconcile(&volume, Uuid::new_v4()),
            Ok(Reconciliation::AlreadySettled)
        );
        assert_eq!(volumes.state("vol-3").expect("tracked").name, "Ready");
    }

    #[test]
    fn unregistered_resource_types_are_skipped() {
        let registry = ResourceRegistry::new();
        let host = ResourceRef::new(ResourceType::Host, "h-1");
        assert_eq!(
            registry.reconcile(&host, Uuid::new_v4()),
            Ok(Reconciliation::NoLifecycle)
        );
        assert_eq!(registry.enter_state(&host, "Maintenance", true), Ok(()));
    }

    #[test]
    fn duplicate_lifecycle_registration_fails() {
        let registry = ResourceRegistry::new();
        registry
            .register(
                ResourceType::Volume,
                Arc::new(TrackedResourceLifecycle::new("Error")),
            )
            .expect("first register should pass");
        assert!(matches!(
            registry.register(
                ResourceType::Volume,
                Arc::new(TrackedResourceLifecycle::new("Error"))
            ),
            Err(JobError::DuplicateRegistration { .. })
        ));
    }
}
