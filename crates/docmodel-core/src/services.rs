//! Service resolution contract used to build per-context data filters.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves a service by type, or returns `None` when it is not available.
pub trait ServiceResolver: Send + Sync {
    fn resolve_any(&self, service: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;
}

impl dyn ServiceResolver + '_ {
    /// Typed convenience over [`ServiceResolver::resolve_any`].
    pub fn resolve<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resolve_any(TypeId::of::<T>())
            .and_then(|service| service.downcast::<T>().ok())
    }
}

/// A fixed map of services keyed by type.
#[derive(Default, Clone)]
pub struct ServiceMap {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with<T: Any + Send + Sync>(mut self, service: T) -> Self {
        self.insert(service);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, service: T) {
        self.services.insert(TypeId::of::<T>(), Arc::new(service));
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl ServiceResolver for ServiceMap {
    fn resolve_any(&self, service: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(&service).cloned()
    }
}

impl std::fmt::Debug for ServiceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMap")
            .field("services", &self.services.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct TenantId(String);

    #[test]
    fn resolves_registered_services_only() {
        let map = ServiceMap::new().with(TenantId("acme".to_string()));
        let resolver: &dyn ServiceResolver = &map;

        let tenant = resolver.resolve::<TenantId>().expect("tenant registered");
        assert_eq!(*tenant, TenantId("acme".to_string()));
        assert!(resolver.resolve::<String>().is_none());
        assert_eq!(map.len(), 1);
    }
}
