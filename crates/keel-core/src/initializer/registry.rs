//! Registry of [`OperationInitializer`]s keyed by flavor. Grounded on
//! `gator-core::harness::HarnessRegistry`'s name-keyed `HashMap` of boxed
//! trait objects, generalized from harness name to [`OperationFlavor`].

use std::collections::HashMap;

use keel_db::models::OperationFlavor;

use super::trait_def::OperationInitializer;

#[derive(Default)]
pub struct InitializerRegistry {
    initializers: HashMap<OperationFlavor, Box<dyn OperationInitializer>>,
}

impl InitializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, initializer: impl OperationInitializer + 'static) {
        self.initializers.insert(initializer.flavor(), Box::new(initializer));
    }

    pub fn get(&self, flavor: OperationFlavor) -> Option<&dyn OperationInitializer> {
        self.initializers.get(&flavor).map(|b| b.as_ref())
    }
}

impl std::fmt::Debug for InitializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializerRegistry")
            .field("flavors", &self.initializers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Build the registry used in production: `reconfigure` is fully
/// implemented; the remaining flavors are stubs until their plan shapes are
/// defined.
pub fn default_registry() -> InitializerRegistry {
    let mut registry = InitializerRegistry::new();
    registry.register(super::reconfigure::ReconfigureInitializer);
    registry.register(super::stub::StubInitializer::new(OperationFlavor::Install));
    registry.register(super::stub::StubInitializer::new(OperationFlavor::Upgrade));
    registry.register(super::stub::StubInitializer::new(OperationFlavor::Shrink));
    registry.register(super::stub::StubInitializer::new(OperationFlavor::Expand));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_all_five_flavors() {
        let registry = default_registry();
        assert!(registry.get(OperationFlavor::Reconfigure).is_some());
        assert!(registry.get(OperationFlavor::Install).is_some());
        assert!(registry.get(OperationFlavor::Upgrade).is_some());
        assert!(registry.get(OperationFlavor::Shrink).is_some());
        assert!(registry.get(OperationFlavor::Expand).is_some());
    }

    #[test]
    fn get_returns_none_for_unregistered_flavor() {
        let registry = InitializerRegistry::new();
        assert!(registry.get(OperationFlavor::Reconfigure).is_none());
    }
}
