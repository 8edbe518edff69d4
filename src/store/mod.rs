mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::Result;
use crate::model::{
    ControllerInfo, CreateInstanceParams, Credentials, Entity, EntityType, Instance, Pool,
    UpdateInstanceParams,
};

/// Persistence contract used by the pool managers. All mutating operations
/// are serializable per instance; a manager reads its own writes.
///
/// Mutations to entities, credentials and the controller record are fanned
/// out through the watcher hub by the implementation.
#[async_trait]
pub trait Store: Send + Sync {
    // Controller identity, minted on first use.
    async fn controller_info(&self) -> Result<ControllerInfo>;

    async fn upsert_credentials(&self, credentials: Credentials) -> Result<Credentials>;
    async fn get_credentials(&self, name: &str) -> Result<Credentials>;
    async fn update_credentials(&self, credentials: Credentials) -> Result<Credentials>;

    async fn create_entity(&self, entity: Entity) -> Result<Entity>;
    async fn get_entity(&self, id: Uuid) -> Result<Entity>;
    async fn find_entity(&self, entity_type: EntityType, owner: &str, name: &str)
        -> Result<Entity>;
    async fn list_entities(&self) -> Result<Vec<Entity>>;
    async fn update_entity(&self, entity: Entity) -> Result<Entity>;
    async fn delete_entity(&self, id: Uuid) -> Result<()>;

    async fn create_pool(&self, pool: Pool) -> Result<Pool>;
    async fn get_pool(&self, id: Uuid) -> Result<Pool>;
    async fn list_entity_pools(&self, entity_id: Uuid) -> Result<Vec<Pool>>;
    /// First enabled pool of the entity whose tag set covers all of `tags`,
    /// preferring higher priority; ties break on pool id.
    async fn find_entity_pool_by_tags(&self, entity_id: Uuid, tags: &[String]) -> Result<Pool>;
    async fn pool_instance_count(&self, pool_id: Uuid) -> Result<u64>;

    async fn create_instance(&self, pool_id: Uuid, params: CreateInstanceParams)
        -> Result<Instance>;
    /// Partial update keyed by the globally unique instance name.
    async fn update_instance(&self, name: &str, params: UpdateInstanceParams) -> Result<Instance>;
    async fn delete_instance(&self, pool_id: Uuid, name: &str) -> Result<()>;
    async fn get_instance_by_name(&self, name: &str) -> Result<Instance>;
    async fn get_pool_instance_by_name(&self, pool_id: Uuid, name: &str) -> Result<Instance>;
    async fn list_pool_instances(&self, pool_id: Uuid) -> Result<Vec<Instance>>;
    async fn list_all_instances(&self) -> Result<Vec<Instance>>;
    async fn list_entity_instances(&self, entity_id: Uuid) -> Result<Vec<Instance>>;
}
