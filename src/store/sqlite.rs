use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::model::{
    Address, ControllerInfo, CreateInstanceParams, Credentials, Entity, EntityType, Instance,
    InstanceStatus, OsArch, OsType, Pool, RunnerStatus, UpdateInstanceParams,
};
use crate::store::Store;
use crate::watcher::{ChangeEvent, ChangeOperation, ChangePayload, WatcherHub};

/// SQLite-backed store. Structured columns (tags, addresses) are stored as
/// JSON text, timestamps as RFC 3339 text.
pub struct SqliteStore {
    pool: SqlitePool,
    hub: WatcherHub,
}

impl SqliteStore {
    pub async fn connect(url: &str, hub: WatcherHub) -> Result<Self> {
        let options = SqlitePoolOptions::new();
        // In-memory databases exist per connection; everything must go
        // through a single one that never retires.
        let options = if url.contains(":memory:") {
            options.max_connections(1).idle_timeout(None).max_lifetime(None)
        } else {
            options
        };
        let pool = options.connect(url).await.map_err(Error::from)?;
        let store = Self { pool, hub };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS controller_info (
                id TEXT PRIMARY KEY
            )",
            "CREATE TABLE IF NOT EXISTS credentials (
                name TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                forge_url TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                credentials_name TEXT NOT NULL REFERENCES credentials(name),
                webhook_secret TEXT NOT NULL,
                UNIQUE(entity_type, owner, name)
            )",
            "CREATE TABLE IF NOT EXISTS pools (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                provider_name TEXT NOT NULL,
                image TEXT NOT NULL,
                flavor TEXT NOT NULL,
                os_type TEXT NOT NULL,
                os_arch TEXT NOT NULL,
                tags TEXT NOT NULL,
                max_runners INTEGER NOT NULL,
                min_idle_runners INTEGER NOT NULL,
                enabled INTEGER NOT NULL,
                runner_timeout_minutes INTEGER NOT NULL,
                runner_group TEXT NOT NULL DEFAULT '',
                priority INTEGER NOT NULL DEFAULT 0,
                runner_prefix TEXT NOT NULL,
                scale_down_factor REAL NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                pool_id TEXT NOT NULL REFERENCES pools(id) ON DELETE CASCADE,
                provider_id TEXT,
                status TEXT NOT NULL,
                runner_status TEXT NOT NULL,
                os_type TEXT NOT NULL,
                os_arch TEXT NOT NULL,
                agent_id INTEGER NOT NULL DEFAULT 0,
                create_attempt INTEGER NOT NULL DEFAULT 1,
                addresses TEXT NOT NULL DEFAULT '[]',
                provider_fault TEXT NOT NULL DEFAULT '',
                token_fetched INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_instances_pool ON instances(pool_id)",
            "CREATE INDEX IF NOT EXISTS idx_pools_entity ON pools(entity_id)",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn publish(&self, operation: ChangeOperation, payload: ChangePayload) {
        self.hub.publish(ChangeEvent { operation, payload });
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(e.into()))
}

fn credentials_from_row(row: &SqliteRow) -> Result<Credentials> {
    Ok(Credentials {
        name: row.try_get("name").map_err(Error::from)?,
        token: row.try_get("token").map_err(Error::from)?,
        forge_url: row.try_get("forge_url").map_err(Error::from)?,
    })
}

fn entity_from_row(row: &SqliteRow) -> Result<Entity> {
    let id: String = row.try_get("id").map_err(Error::from)?;
    let entity_type: String = row.try_get("entity_type").map_err(Error::from)?;
    Ok(Entity {
        id: Uuid::parse_str(&id).map_err(|e| Error::Other(e.into()))?,
        entity_type: EntityType::parse(&entity_type),
        owner: row.try_get("owner").map_err(Error::from)?,
        name: row.try_get("name").map_err(Error::from)?,
        credentials_name: row.try_get("credentials_name").map_err(Error::from)?,
        webhook_secret: row.try_get("webhook_secret").map_err(Error::from)?,
    })
}

fn pool_from_row(row: &SqliteRow) -> Result<Pool> {
    let id: String = row.try_get("id").map_err(Error::from)?;
    let entity_id: String = row.try_get("entity_id").map_err(Error::from)?;
    let os_type: String = row.try_get("os_type").map_err(Error::from)?;
    let os_arch: String = row.try_get("os_arch").map_err(Error::from)?;
    let tags: String = row.try_get("tags").map_err(Error::from)?;
    Ok(Pool {
        id: Uuid::parse_str(&id).map_err(|e| Error::Other(e.into()))?,
        entity_id: Uuid::parse_str(&entity_id).map_err(|e| Error::Other(e.into()))?,
        provider_name: row.try_get("provider_name").map_err(Error::from)?,
        image: row.try_get("image").map_err(Error::from)?,
        flavor: row.try_get("flavor").map_err(Error::from)?,
        os_type: OsType::parse(&os_type),
        os_arch: OsArch::parse(&os_arch),
        tags: serde_json::from_str(&tags)?,
        max_runners: row.try_get::<i64, _>("max_runners").map_err(Error::from)? as u32,
        min_idle_runners: row.try_get::<i64, _>("min_idle_runners").map_err(Error::from)? as u32,
        enabled: row.try_get::<i64, _>("enabled").map_err(Error::from)? != 0,
        runner_timeout_minutes: row
            .try_get::<i64, _>("runner_timeout_minutes")
            .map_err(Error::from)? as u32,
        runner_group: row.try_get("runner_group").map_err(Error::from)?,
        priority: row.try_get::<i64, _>("priority").map_err(Error::from)? as u32,
        runner_prefix: row.try_get("runner_prefix").map_err(Error::from)?,
        scale_down_factor: row.try_get("scale_down_factor").map_err(Error::from)?,
    })
}

fn instance_from_row(row: &SqliteRow) -> Result<Instance> {
    let id: String = row.try_get("id").map_err(Error::from)?;
    let pool_id: String = row.try_get("pool_id").map_err(Error::from)?;
    let status: String = row.try_get("status").map_err(Error::from)?;
    let runner_status: String = row.try_get("runner_status").map_err(Error::from)?;
    let os_type: String = row.try_get("os_type").map_err(Error::from)?;
    let os_arch: String = row.try_get("os_arch").map_err(Error::from)?;
    let addresses: String = row.try_get("addresses").map_err(Error::from)?;
    let created_at: String = row.try_get("created_at").map_err(Error::from)?;
    let updated_at: String = row.try_get("updated_at").map_err(Error::from)?;
    let addresses: Vec<Address> = serde_json::from_str(&addresses)?;
    Ok(Instance {
        id: Uuid::parse_str(&id).map_err(|e| Error::Other(e.into()))?,
        name: row.try_get("name").map_err(Error::from)?,
        pool_id: Uuid::parse_str(&pool_id).map_err(|e| Error::Other(e.into()))?,
        provider_id: row.try_get("provider_id").map_err(Error::from)?,
        status: InstanceStatus::parse(&status),
        runner_status: RunnerStatus::parse(&runner_status),
        os_type: OsType::parse(&os_type),
        os_arch: OsArch::parse(&os_arch),
        agent_id: row.try_get("agent_id").map_err(Error::from)?,
        create_attempt: row.try_get::<i64, _>("create_attempt").map_err(Error::from)? as u32,
        addresses,
        provider_fault: row.try_get("provider_fault").map_err(Error::from)?,
        token_fetched: row.try_get::<i64, _>("token_fetched").map_err(Error::from)? != 0,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn controller_info(&self) -> Result<ControllerInfo> {
        let row = sqlx::query("SELECT id FROM controller_info LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)?;
        if let Some(row) = row {
            let id: String = row.try_get("id").map_err(Error::from)?;
            return Ok(ControllerInfo {
                controller_id: Uuid::parse_str(&id).map_err(|e| Error::Other(e.into()))?,
            });
        }

        let controller_id = Uuid::new_v4();
        sqlx::query("INSERT INTO controller_info (id) VALUES (?1)")
            .bind(controller_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(Error::from)?;
        tracing::info!(%controller_id, "initialised controller identity");
        Ok(ControllerInfo { controller_id })
    }

    async fn upsert_credentials(&self, credentials: Credentials) -> Result<Credentials> {
        sqlx::query(
            "INSERT INTO credentials (name, token, forge_url) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET token = excluded.token,
                                             forge_url = excluded.forge_url",
        )
        .bind(&credentials.name)
        .bind(&credentials.token)
        .bind(&credentials.forge_url)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;
        Ok(credentials)
    }

    async fn get_credentials(&self, name: &str) -> Result<Credentials> {
        let row = sqlx::query("SELECT * FROM credentials WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::NotFound(format!("credentials {name}")))?;
        credentials_from_row(&row)
    }

    async fn update_credentials(&self, credentials: Credentials) -> Result<Credentials> {
        let result = sqlx::query(
            "UPDATE credentials SET token = ?2, forge_url = ?3 WHERE name = ?1",
        )
        .bind(&credentials.name)
        .bind(&credentials.token)
        .bind(&credentials.forge_url)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("credentials {}", credentials.name)));
        }
        self.publish(
            ChangeOperation::Update,
            ChangePayload::Credentials(credentials.clone()),
        );
        Ok(credentials)
    }

    async fn create_entity(&self, entity: Entity) -> Result<Entity> {
        let result = sqlx::query(
            "INSERT INTO entities (id, entity_type, owner, name, credentials_name, webhook_secret)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(entity.id.to_string())
        .bind(entity.entity_type.as_str())
        .bind(&entity.owner)
        .bind(&entity.name)
        .bind(&entity.credentials_name)
        .bind(&entity.webhook_secret)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(Error::Conflict(format!("entity {} exists", entity.slug())));
            }
            Err(other) => return Err(other.into()),
        }
        self.publish(ChangeOperation::Create, ChangePayload::Entity(entity.clone()));
        Ok(entity)
    }

    async fn get_entity(&self, id: Uuid) -> Result<Entity> {
        let row = sqlx::query("SELECT * FROM entities WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::NotFound(format!("entity {id}")))?;
        entity_from_row(&row)
    }

    async fn find_entity(
        &self,
        entity_type: EntityType,
        owner: &str,
        name: &str,
    ) -> Result<Entity> {
        let row = sqlx::query(
            "SELECT * FROM entities WHERE entity_type = ?1 AND owner = ?2 AND name = ?3",
        )
        .bind(entity_type.as_str())
        .bind(owner)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::NotFound(format!("entity {owner}/{name}")))?;
        entity_from_row(&row)
    }

    async fn list_entities(&self) -> Result<Vec<Entity>> {
        let rows = sqlx::query("SELECT * FROM entities ORDER BY entity_type, owner, name")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn update_entity(&self, entity: Entity) -> Result<Entity> {
        let result = sqlx::query(
            "UPDATE entities SET credentials_name = ?2, webhook_secret = ?3 WHERE id = ?1",
        )
        .bind(entity.id.to_string())
        .bind(&entity.credentials_name)
        .bind(&entity.webhook_secret)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("entity {}", entity.id)));
        }
        self.publish(ChangeOperation::Update, ChangePayload::Entity(entity.clone()));
        Ok(entity)
    }

    async fn delete_entity(&self, id: Uuid) -> Result<()> {
        let entity = self.get_entity(id).await?;
        sqlx::query("DELETE FROM entities WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(Error::from)?;
        self.publish(ChangeOperation::Delete, ChangePayload::Entity(entity));
        Ok(())
    }

    async fn create_pool(&self, pool: Pool) -> Result<Pool> {
        sqlx::query(
            "INSERT INTO pools (id, entity_id, provider_name, image, flavor, os_type, os_arch,
                                tags, max_runners, min_idle_runners, enabled,
                                runner_timeout_minutes, runner_group, priority, runner_prefix,
                                scale_down_factor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )
        .bind(pool.id.to_string())
        .bind(pool.entity_id.to_string())
        .bind(&pool.provider_name)
        .bind(&pool.image)
        .bind(&pool.flavor)
        .bind(pool.os_type.as_str())
        .bind(pool.os_arch.as_str())
        .bind(serde_json::to_string(&pool.tags)?)
        .bind(pool.max_runners as i64)
        .bind(pool.min_idle_runners as i64)
        .bind(pool.enabled as i64)
        .bind(pool.runner_timeout_minutes as i64)
        .bind(&pool.runner_group)
        .bind(pool.priority as i64)
        .bind(&pool.runner_prefix)
        .bind(pool.scale_down_factor)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;
        Ok(pool)
    }

    async fn get_pool(&self, id: Uuid) -> Result<Pool> {
        let row = sqlx::query("SELECT * FROM pools WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::NotFound(format!("pool {id}")))?;
        pool_from_row(&row)
    }

    async fn list_entity_pools(&self, entity_id: Uuid) -> Result<Vec<Pool>> {
        let rows = sqlx::query(
            "SELECT * FROM pools WHERE entity_id = ?1 ORDER BY priority DESC, id",
        )
        .bind(entity_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)?;
        rows.iter().map(pool_from_row).collect()
    }

    async fn find_entity_pool_by_tags(&self, entity_id: Uuid, tags: &[String]) -> Result<Pool> {
        if tags.is_empty() {
            return Err(Error::BadRequest("no labels requested".to_string()));
        }
        let pools = self.list_entity_pools(entity_id).await?;
        pools
            .into_iter()
            .filter(|pool| pool.enabled)
            .find(|pool| pool.matches_labels(tags))
            .ok_or_else(|| Error::NotFound(format!("pool matching {tags:?}")))
    }

    async fn pool_instance_count(&self, pool_id: Uuid) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM instances WHERE pool_id = ?1")
            .bind(pool_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(Error::from)?;
        let count: i64 = row.try_get("count").map_err(Error::from)?;
        Ok(count as u64)
    }

    async fn create_instance(
        &self,
        pool_id: Uuid,
        params: CreateInstanceParams,
    ) -> Result<Instance> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let result = sqlx::query(
            "INSERT INTO instances (id, name, pool_id, provider_id, status, runner_status,
                                    os_type, os_arch, agent_id, create_attempt, addresses,
                                    provider_fault, token_fetched, created_at, updated_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, 0, ?8, '[]', '', 0, ?9, ?9)",
        )
        .bind(id.to_string())
        .bind(&params.name)
        .bind(pool_id.to_string())
        .bind(params.status.as_str())
        .bind(params.runner_status.as_str())
        .bind(params.os_type.as_str())
        .bind(params.os_arch.as_str())
        .bind(params.create_attempt as i64)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(Error::Conflict(format!("instance {} exists", params.name)));
            }
            Err(other) => return Err(other.into()),
        }
        self.get_instance_by_name(&params.name).await
    }

    async fn update_instance(&self, name: &str, params: UpdateInstanceParams) -> Result<Instance> {
        let mut tx = self.pool.begin().await.map_err(Error::from)?;
        let row = sqlx::query("SELECT * FROM instances WHERE name = ?1")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::NotFound(format!("instance {name}")))?;
        let mut instance = instance_from_row(&row)?;

        if let Some(provider_id) = params.provider_id {
            instance.provider_id = Some(provider_id);
        }
        if let Some(status) = params.status {
            instance.status = status;
        }
        if let Some(runner_status) = params.runner_status {
            instance.runner_status = runner_status;
        }
        if let Some(agent_id) = params.agent_id {
            instance.agent_id = agent_id;
        }
        if let Some(addresses) = params.addresses {
            instance.addresses = addresses;
        }
        if let Some(provider_fault) = params.provider_fault {
            instance.provider_fault = provider_fault;
        }
        if let Some(create_attempt) = params.create_attempt {
            instance.create_attempt = create_attempt;
        }
        if let Some(token_fetched) = params.token_fetched {
            instance.token_fetched = token_fetched;
        }
        if let Some(os_type) = params.os_type {
            instance.os_type = os_type;
        }
        if let Some(os_arch) = params.os_arch {
            instance.os_arch = os_arch;
        }
        instance.updated_at = Utc::now();

        sqlx::query(
            "UPDATE instances SET provider_id = ?2, status = ?3, runner_status = ?4,
                                  agent_id = ?5, addresses = ?6, provider_fault = ?7,
                                  create_attempt = ?8, token_fetched = ?9, os_type = ?10,
                                  os_arch = ?11, updated_at = ?12
             WHERE name = ?1",
        )
        .bind(name)
        .bind(&instance.provider_id)
        .bind(instance.status.as_str())
        .bind(instance.runner_status.as_str())
        .bind(instance.agent_id)
        .bind(serde_json::to_string(&instance.addresses)?)
        .bind(&instance.provider_fault)
        .bind(instance.create_attempt as i64)
        .bind(instance.token_fetched as i64)
        .bind(instance.os_type.as_str())
        .bind(instance.os_arch.as_str())
        .bind(instance.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(Error::from)?;
        tx.commit().await.map_err(Error::from)?;
        Ok(instance)
    }

    async fn delete_instance(&self, pool_id: Uuid, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM instances WHERE pool_id = ?1 AND name = ?2")
            .bind(pool_id.to_string())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn get_instance_by_name(&self, name: &str) -> Result<Instance> {
        let row = sqlx::query("SELECT * FROM instances WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::NotFound(format!("instance {name}")))?;
        instance_from_row(&row)
    }

    async fn get_pool_instance_by_name(&self, pool_id: Uuid, name: &str) -> Result<Instance> {
        let row = sqlx::query("SELECT * FROM instances WHERE pool_id = ?1 AND name = ?2")
            .bind(pool_id.to_string())
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::NotFound(format!("instance {name}")))?;
        instance_from_row(&row)
    }

    async fn list_pool_instances(&self, pool_id: Uuid) -> Result<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances WHERE pool_id = ?1 ORDER BY created_at")
            .bind(pool_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn list_all_instances(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn list_entity_instances(&self, entity_id: Uuid) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            "SELECT instances.* FROM instances
             JOIN pools ON pools.id = instances.pool_id
             WHERE pools.entity_id = ?1
             ORDER BY instances.created_at",
        )
        .bind(entity_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)?;
        rows.iter().map(instance_from_row).collect()
    }
}
