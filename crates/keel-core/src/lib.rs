//! `keel-core`: the plan engine (§4.D), phase executor (§4.B), agent fabric
//! (§4.C), operation initializer contract (§4.E), controller server (§4.F),
//! and lifecycle supervisor (§4.G) that together drive a cluster-lifecycle
//! operation to completion.

pub mod cidr;
pub mod errors;
pub mod executor;
pub mod fabric;
pub mod initializer;
pub mod phase_graph;
pub mod plan_engine;
pub mod server;
pub mod supervisor;
pub mod token;

pub use errors::EngineError;
pub use phase_graph::PhaseGraph;
pub use plan_engine::{PlanEngine, PlanOutcome};
