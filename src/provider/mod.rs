mod openstack;

pub use openstack::OpenStackProvider;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::model::{BootstrapInstance, ProviderInstance};

/// Concurrent create/delete calls allowed per provider, so one slow cloud
/// cannot starve the others.
pub const PROVIDER_CONCURRENCY: usize = 4;

/// Cloud operations the pool manager drives instances through.
///
/// `delete_instance` is idempotent: deleting an instance the provider no
/// longer knows about succeeds.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn create_instance(&self, bootstrap: &BootstrapInstance) -> Result<ProviderInstance>;

    /// `instance_id` is the provider id when known, the instance name
    /// otherwise.
    async fn delete_instance(&self, instance_id: &str) -> Result<()>;

    async fn get_instance(&self, instance_id: &str) -> Result<ProviderInstance>;

    async fn list_instances(&self, pool_id: Uuid) -> Result<Vec<ProviderInstance>>;

    async fn start(&self, instance_id: &str) -> Result<()>;

    async fn stop(&self, instance_id: &str, force: bool) -> Result<()>;

    async fn remove_all_instances(&self) -> Result<()>;
}

struct ProviderEntry {
    provider: Arc<dyn Provider>,
    limiter: Arc<Semaphore>,
}

/// Providers available to pool managers, each paired with its concurrency
/// limiter.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: HashMap<String, ProviderEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.entries.insert(
            provider.name().to_string(),
            ProviderEntry {
                provider,
                limiter: Arc::new(Semaphore::new(PROVIDER_CONCURRENCY)),
            },
        );
    }

    pub fn get(&self, name: &str) -> Result<(Arc<dyn Provider>, Arc<Semaphore>)> {
        self.entries
            .get(name)
            .map(|entry| (entry.provider.clone(), entry.limiter.clone()))
            .ok_or_else(|| Error::NotFound(format!("provider {name}")))
    }
}
