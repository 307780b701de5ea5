//! Local (controller-side) phase executors: implementations that don't
//! need a remote peer dial because the work they do -- validating request
//! data against existing cluster state -- is pure. Grounded on the same
//! "implementation selected by name, re-entrant, terminal progress event"
//! shape as [`super::fabric_executor::FabricExecutor`], just without the
//! network hop.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use keel_db::models::Phase;

use super::trait_def::{ExecutorContext, PhaseExecutor};
use crate::cidr;
use crate::errors::EngineError;
use crate::fabric::ProgressEvent;

/// Validates a requested CIDR against the set of CIDRs already in use by
/// the cluster, per §4.E's `validatePreconditions` example ("reject
/// impossible configurations, e.g. CIDR conflicts with the local
/// advertise-IP") and §8's CIDR-conflict E2E scenario.
///
/// Expects `phase.data` shaped `{"requested_cidr": "10.1.0.0/24",
/// "existing_cidrs": ["10.0.0.0/24", ...]}`.
pub struct CidrValidateExecutor;

#[async_trait]
impl PhaseExecutor for CidrValidateExecutor {
    fn name(&self) -> &str {
        "validate"
    }

    async fn execute(
        &self,
        _ctx: &ExecutorContext,
        phase: &Phase,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<ProgressEvent, EngineError>> + Send>>, EngineError>
    {
        let requested = phase
            .data
            .get("requested_cidr")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                EngineError::PreconditionFailed(format!(
                    "phase {} is missing requested_cidr",
                    phase.id
                ))
            })?;

        let existing: Vec<&str> = phase
            .data
            .get("existing_cidrs")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        let conflict = cidr::find_conflict(requested, &existing)
            .map_err(|e| EngineError::PreconditionFailed(format!("phase {}: {e}", phase.id)))?;

        if let Some(other) = conflict {
            return Err(EngineError::PreconditionFailed(format!(
                "requested CIDR {requested} conflicts with existing CIDR {other}"
            )));
        }

        let phase_id = phase.id.clone();
        Ok(Box::pin(futures::stream::iter(vec![
            Ok(ProgressEvent::running(phase_id.clone(), "checking CIDR conflicts")),
            Ok(ProgressEvent::completed(phase_id)),
        ])))
    }
}
