//! Workflow definition lookup capability.
//!
//! Definition CRUD lives in the admin service; the engine only needs two
//! read paths, expressed as a trait so tests and the simulator can inject
//! an in-memory catalogue.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use model::{Trigger, WorkflowDefinition};
use store::StoreError;

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Look one definition up by ID.
    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Active definitions for an organization and trigger class.
    async fn find_active(
        &self,
        org_id: &str,
        trigger: Trigger,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;
}

/// In-memory catalogue for tests and the CLI simulator.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, definition: WorkflowDefinition) {
        self.definitions
            .write()
            .insert(definition.id.clone(), definition);
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.definitions.read().get(workflow_id).cloned())
    }

    async fn find_active(
        &self,
        org_id: &str,
        trigger: Trigger,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        Ok(self
            .definitions
            .read()
            .values()
            .filter(|def| def.is_active && def.org_id == org_id && def.trigger == trigger)
            .cloned()
            .collect())
    }
}
