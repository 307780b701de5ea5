//! The `reconfigure` operation flavor: apply a new config value (e.g. a pod
//! CIDR) across every server already joined to the cluster, without
//! changing membership. Grounded on §4.E's example plan shape
//! (validate -> apply per server -> restart) and §8's CIDR-conflict
//! end-to-end scenario.

use async_trait::async_trait;
use sqlx::PgPool;

use keel_db::models::{Operation, OperationFlavor};
use keel_db::queries::{operations, plans::NewPhase};

use super::trait_def::OperationInitializer;
use crate::cidr;
use crate::errors::EngineError;

/// `payload` is expected shaped:
/// ```json
/// {
///   "requested_cidr": "10.1.0.0/24",
///   "existing_cidrs": ["10.0.0.0/24"],
///   "servers": ["10.0.0.5", "10.0.0.6"]
/// }
/// ```
pub struct ReconfigureInitializer;

impl ReconfigureInitializer {
    fn requested_cidr(payload: &serde_json::Value) -> Result<&str, EngineError> {
        payload
            .get("requested_cidr")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                EngineError::PreconditionFailed("reconfigure payload missing requested_cidr".to_string())
            })
    }

    fn existing_cidrs(payload: &serde_json::Value) -> Vec<&str> {
        payload
            .get("existing_cidrs")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }

    fn servers(payload: &serde_json::Value) -> Result<Vec<&str>, EngineError> {
        let servers: Vec<&str> = payload
            .get("servers")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        if servers.is_empty() {
            return Err(EngineError::PreconditionFailed(
                "reconfigure payload lists no servers".to_string(),
            ));
        }
        Ok(servers)
    }
}

#[async_trait]
impl OperationInitializer for ReconfigureInitializer {
    fn flavor(&self) -> OperationFlavor {
        OperationFlavor::Reconfigure
    }

    async fn validate_preconditions(&self, payload: &serde_json::Value) -> Result<(), EngineError> {
        let requested = Self::requested_cidr(payload)?;
        let existing = Self::existing_cidrs(payload);
        let conflict = cidr::find_conflict(requested, &existing)
            .map_err(EngineError::PreconditionFailed)?;
        if let Some(other) = conflict {
            return Err(EngineError::PreconditionFailed(format!(
                "requested CIDR {requested} conflicts with existing CIDR {other}"
            )));
        }
        Self::servers(payload)?;
        Ok(())
    }

    async fn new_operation(
        &self,
        pool: &PgPool,
        account: &str,
        cluster: &str,
    ) -> Result<Operation, EngineError> {
        operations::insert_operation(pool, account, cluster, OperationFlavor::Reconfigure)
            .await
            .map_err(EngineError::from)
    }

    async fn new_operation_plan(
        &self,
        _operation: &Operation,
        payload: &serde_json::Value,
    ) -> Result<Vec<NewPhase>, EngineError> {
        let requested = Self::requested_cidr(payload)?;
        let existing = Self::existing_cidrs(payload);
        let servers = Self::servers(payload)?;

        let mut phases = vec![NewPhase {
            id: "validate".to_string(),
            parent_id: None,
            executor: "validate".to_string(),
            data: serde_json::json!({
                "requested_cidr": requested,
                "existing_cidrs": existing,
            }),
            requires: Vec::new(),
        }];

        let mut apply_ids = Vec::with_capacity(servers.len());
        for server in &servers {
            let id = format!("apply/{server}");
            phases.push(NewPhase {
                id: id.clone(),
                parent_id: None,
                executor: "fabric".to_string(),
                data: serde_json::json!({
                    "server": server,
                    "pod_cidr": requested,
                }),
                requires: vec!["validate".to_string()],
            });
            apply_ids.push(id);
        }

        phases.push(NewPhase {
            id: "restart".to_string(),
            parent_id: None,
            executor: "fabric".to_string(),
            data: serde_json::json!({ "servers": servers }),
            requires: apply_ids,
        });

        Ok(phases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> serde_json::Value {
        serde_json::json!({
            "requested_cidr": "10.1.0.0/24",
            "existing_cidrs": ["10.0.0.0/24"],
            "servers": ["10.0.0.5", "10.0.0.6"],
        })
    }

    #[tokio::test]
    async fn validate_preconditions_accepts_disjoint_cidr() {
        let initializer = ReconfigureInitializer;
        assert!(initializer.validate_preconditions(&payload()).await.is_ok());
    }

    #[tokio::test]
    async fn validate_preconditions_rejects_conflicting_cidr() {
        let initializer = ReconfigureInitializer;
        let mut p = payload();
        p["requested_cidr"] = serde_json::json!("10.0.0.128/25");
        let result = initializer.validate_preconditions(&p).await;
        assert!(matches!(result, Err(EngineError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn validate_preconditions_rejects_empty_servers() {
        let initializer = ReconfigureInitializer;
        let mut p = payload();
        p["servers"] = serde_json::json!([]);
        let result = initializer.validate_preconditions(&p).await;
        assert!(matches!(result, Err(EngineError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn new_operation_plan_builds_validate_apply_restart_chain() {
        let initializer = ReconfigureInitializer;
        let operation = Operation {
            id: uuid::Uuid::new_v4(),
            account: "acme".to_string(),
            cluster: "prod".to_string(),
            flavor: OperationFlavor::Reconfigure,
            state: keel_db::models::OperationState::Initialized,
            plan_id: None,
            created_at: chrono::Utc::now(),
            completed_at: None,
        };
        let phases = initializer
            .new_operation_plan(&operation, &payload())
            .await
            .unwrap();

        assert_eq!(phases.len(), 4);
        assert_eq!(phases[0].id, "validate");
        assert!(phases[0].requires.is_empty());

        let apply_phases: Vec<_> = phases
            .iter()
            .filter(|p| p.id.starts_with("apply/"))
            .collect();
        assert_eq!(apply_phases.len(), 2);
        for p in &apply_phases {
            assert_eq!(p.requires, vec!["validate".to_string()]);
            assert_eq!(p.executor, "fabric");
        }

        let restart = phases.iter().find(|p| p.id == "restart").unwrap();
        assert_eq!(restart.requires.len(), 2);
    }
}
