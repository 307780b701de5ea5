//! The `OperationInitializer` trait (§4.E) — a flavor-specific contract for
//! validating a requested change and building the plan that realizes it.
//!
//! Grounded on `gator-core::harness::Harness`: object-safe `async_trait`,
//! stored as `Box<dyn OperationInitializer>` in [`super::registry::InitializerRegistry`],
//! generalized from "LLM harness name" to "operation flavor".

use async_trait::async_trait;
use sqlx::PgPool;

use keel_db::models::{Operation, OperationFlavor};
use keel_db::queries::plans::NewPhase;

use crate::errors::EngineError;

#[async_trait]
pub trait OperationInitializer: Send + Sync {
    /// The flavor this initializer answers to.
    fn flavor(&self) -> OperationFlavor;

    /// Reject impossible configurations before any operation record is
    /// created, e.g. CIDR conflicts with the local advertise-IP.
    async fn validate_preconditions(&self, payload: &serde_json::Value) -> Result<(), EngineError>;

    /// Create the operation record. Flavors with no support (the stubs)
    /// return `NotImplemented` with a user-facing hint per §4.E.
    async fn new_operation(
        &self,
        pool: &PgPool,
        account: &str,
        cluster: &str,
    ) -> Result<Operation, EngineError>;

    /// Build the phase DAG realizing this operation, as a pure function of
    /// `(existing cluster state, requested resource)`.
    async fn new_operation_plan(
        &self,
        operation: &Operation,
        payload: &serde_json::Value,
    ) -> Result<Vec<NewPhase>, EngineError>;

    /// Confirms the initializer is ready to drive further `ExecutePlan`
    /// calls against an existing operation. The plan engine in this
    /// workspace is a long-lived singleton rather than reconstructed per
    /// operation, so this defaults to a no-op rather than building a new
    /// engine handle (see DESIGN.md's Open Question resolution).
    async fn new_updater(&self, _operation: &Operation) -> Result<(), EngineError> {
        Ok(())
    }

    /// Hook to amend the agent-deployment request. Kept as an identity
    /// default per the spec's own resolution of this Open Question.
    fn update_deploy_request(&self, req: serde_json::Value) -> serde_json::Value {
        req
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn OperationInitializer) {}
};
