use std::sync::Arc;

use serde::Deserialize;

use crate::{
    backends::MemoryStore,
    repository::{EventRepository, MessageRepository, SuppressionRepository, TenantRepository},
};

/// Configuration for the repository backend
///
/// # Examples
///
/// Memory-backed store (unlimited capacity):
/// ```ron
/// Courier (
///     store: (type: "Memory"),
/// )
/// ```
///
/// Memory-backed store with capacity limit:
/// ```ron
/// Courier (
///     store: (
///         type: "Memory",
///         capacity: 100000,
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StoreConfig {
    /// Memory-based store
    ///
    /// Can optionally specify a capacity limit to prevent unbounded memory growth
    Memory(MemoryConfig),
}

/// Configuration for memory-backed store
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryConfig {
    /// Maximum number of messages to store (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory(MemoryConfig::default())
    }
}

/// Every repository the pipeline needs, as shared trait objects
#[derive(Debug, Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageRepository>,
    pub events: Arc<dyn EventRepository>,
    pub suppressions: Arc<dyn SuppressionRepository>,
    pub tenants: Arc<dyn TenantRepository>,
}

impl Stores {
    /// Serve every repository from one store
    pub fn from_store<S>(store: S) -> Self
    where
        S: MessageRepository
            + EventRepository
            + SuppressionRepository
            + TenantRepository
            + 'static,
    {
        let store = Arc::new(store);
        Self {
            messages: store.clone(),
            events: store.clone(),
            suppressions: store.clone(),
            tenants: store,
        }
    }
}

impl StoreConfig {
    /// Convert the configuration into concrete repositories
    #[must_use]
    pub fn into_stores(self) -> Stores {
        match self {
            Self::Memory(config) => Stores::from_store(
                config
                    .capacity
                    .map_or_else(MemoryStore::new, MemoryStore::with_capacity),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_memory() {
        let config: StoreConfig =
            ron::from_str(r#"(type: "Memory", capacity: Some(10))"#).expect("valid config");
        let StoreConfig::Memory(memory) = config;
        assert_eq!(memory.capacity, Some(10));

        let config: StoreConfig = ron::from_str(r#"(type: "Memory")"#).expect("valid config");
        let StoreConfig::Memory(memory) = config;
        assert_eq!(memory.capacity, None);
    }
}
