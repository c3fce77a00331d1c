//! Storage backend selection.
//!
//! Backends register a factory under a name; the `storage.backend` setting picks one
//! at startup. The acquisition engine only ever sees the resulting
//! `Arc<dyn StorageGateway>`.
use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::{CsvDirectoryGateway, SqliteGateway, StorageError, StorageGateway};
use crate::config::StorageSettings;

type GatewayFactory =
    Box<dyn Fn(&StorageSettings) -> Result<Arc<dyn StorageGateway>, StorageError> + Send + Sync>;

/// Registry of storage gateway factories.
///
/// # Examples
///
/// ```
/// use pulse_train_daq::storage::GatewayRegistry;
///
/// let registry = GatewayRegistry::new();
/// assert_eq!(registry.list_backends(), vec!["csv", "sqlite"]);
/// ```
pub struct GatewayRegistry {
    factories: HashMap<String, GatewayFactory>,
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayRegistry {
    /// Registry with the built-in `sqlite` and `csv` backends.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        registry.register("sqlite", |settings| {
            Ok(Arc::new(
                SqliteGateway::open(&settings.sqlite_path)?.with_call_timeout(settings.call_timeout()),
            ))
        });
        registry.register("csv", |settings| {
            Ok(Arc::new(
                CsvDirectoryGateway::open(&settings.csv_dir)?.with_call_timeout(settings.call_timeout()),
            ))
        });

        registry
    }

    /// Register (or replace) a backend factory.
    pub fn register<F>(&mut self, backend: &str, factory: F)
    where
        F: Fn(&StorageSettings) -> Result<Arc<dyn StorageGateway>, StorageError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(backend.to_string(), Box::new(factory));
    }

    /// Build the gateway named by `settings.backend`.
    pub fn create(&self, settings: &StorageSettings) -> Result<Arc<dyn StorageGateway>, StorageError> {
        let factory = self.factories.get(&settings.backend).ok_or_else(|| {
            StorageError::Unavailable(format!(
                "Unsupported storage backend: '{}'. Available backends: [{}]",
                settings.backend,
                self.list_backends().join(", ")
            ))
        })?;
        let gateway = factory(settings)?;
        info!(backend = gateway.backend_name(), "Storage gateway selected");
        Ok(gateway)
    }

    /// Registered backend names, sorted.
    pub fn list_backends(&self) -> Vec<String> {
        let mut backends: Vec<String> = self.factories.keys().cloned().collect();
        backends.sort();
        backends
    }

    /// Whether `backend` is registered.
    pub fn is_available(&self, backend: &str) -> bool {
        self.factories.contains_key(backend)
    }
}

/// Build the configured gateway from the built-in registry.
pub fn open_gateway(settings: &StorageSettings) -> Result<Arc<dyn StorageGateway>, StorageError> {
    GatewayRegistry::new().create(settings)
}
