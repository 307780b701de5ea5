//! Stub initializers for flavors not yet implemented: install, upgrade,
//! shrink, expand. Each responds `NotImplemented` per §4.E's guidance that
//! unsupported flavors surface a clear, user-facing error rather than
//! silently no-opping.

use async_trait::async_trait;
use sqlx::PgPool;

use keel_db::models::{Operation, OperationFlavor};
use keel_db::queries::plans::NewPhase;

use super::trait_def::OperationInitializer;
use crate::errors::EngineError;

pub struct StubInitializer {
    flavor: OperationFlavor,
}

impl StubInitializer {
    pub fn new(flavor: OperationFlavor) -> Self {
        Self { flavor }
    }

    fn not_implemented(&self) -> EngineError {
        EngineError::NotImplemented(format!("operation flavor '{}' is not yet supported", self.flavor))
    }
}

#[async_trait]
impl OperationInitializer for StubInitializer {
    fn flavor(&self) -> OperationFlavor {
        self.flavor
    }

    async fn validate_preconditions(&self, _payload: &serde_json::Value) -> Result<(), EngineError> {
        Err(self.not_implemented())
    }

    async fn new_operation(
        &self,
        _pool: &PgPool,
        _account: &str,
        _cluster: &str,
    ) -> Result<Operation, EngineError> {
        Err(self.not_implemented())
    }

    async fn new_operation_plan(
        &self,
        _operation: &Operation,
        _payload: &serde_json::Value,
    ) -> Result<Vec<NewPhase>, EngineError> {
        Err(self.not_implemented())
    }
}
