//! Adapter lookup by protocol kind.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::LinkError;
use crate::protocol::{ProtocolAdapter, ProtocolKind};

/// Immutable-after-startup table of protocol adapters.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ProtocolKind, Arc<dyn ProtocolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) -> &mut Self {
        let kind = adapter.kind();
        if self.adapters.insert(kind.clone(), adapter).is_some() {
            tracing::warn!(protocol = %kind, "Replacing previously registered protocol adapter");
        }
        self
    }

    pub fn with(mut self, adapter: Arc<dyn ProtocolAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, kind: &ProtocolKind) -> Result<Arc<dyn ProtocolAdapter>, LinkError> {
        self.adapters
            .get(kind)
            .cloned()
            .ok_or_else(|| LinkError::UnknownProtocol(kind.clone()))
    }

    pub fn contains(&self, kind: &ProtocolKind) -> bool {
        self.adapters.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<ProtocolKind> {
        let mut kinds: Vec<_> = self.adapters.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
