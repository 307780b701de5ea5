//! Operation initializer (§4.E): the flavor-specific contract for rejecting
//! impossible requests and building the phase DAG that realizes them.

pub mod reconfigure;
pub mod registry;
pub mod stub;
pub mod trait_def;

pub use reconfigure::ReconfigureInitializer;
pub use registry::{InitializerRegistry, default_registry};
pub use stub::StubInitializer;
pub use trait_def::OperationInitializer;
