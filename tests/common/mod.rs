#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use github_runner_fleet::errors::{Error, Result};
use github_runner_fleet::forge::ForgeClient;
use github_runner_fleet::locking::KeyMuxRegistry;
use github_runner_fleet::manager::{ForgeClientFactory, ManagerOptions, PoolManager};
use github_runner_fleet::model::{
    Address, AddressKind, BootstrapInstance, Credentials, Entity, EntityType, EventAccount,
    ForgeHook, ForgeRunner, Instance, JitConfig, JobAction, OsArch, OsType, Pool,
    ProviderInstance, ProviderInstanceStatus, RegistrationToken, ToolDownload, WorkflowJob,
    WorkflowJobEvent,
};
use github_runner_fleet::provider::{Provider, ProviderRegistry};
use github_runner_fleet::store::{SqliteStore, Store};
use github_runner_fleet::tools::ToolsCache;
use github_runner_fleet::watcher::WatcherHub;

pub struct MockForge {
    entity: Entity,
    pub runners: Mutex<Vec<ForgeRunner>>,
    pub removed: Mutex<Vec<i64>>,
    pub jobs: Mutex<HashMap<i64, WorkflowJob>>,
    pub hooks: Mutex<Vec<ForgeHook>>,
    pub unauthorized: AtomicBool,
    next_runner_id: AtomicI64,
}

impl MockForge {
    pub fn new(entity: Entity) -> Arc<Self> {
        Arc::new(Self {
            entity,
            runners: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            jobs: Mutex::new(HashMap::new()),
            hooks: Mutex::new(Vec::new()),
            unauthorized: AtomicBool::new(false),
            next_runner_id: AtomicI64::new(1001),
        })
    }

    pub fn set_unauthorized(&self, value: bool) {
        self.unauthorized.store(value, Ordering::SeqCst);
    }

    pub fn add_runner(&self, runner: ForgeRunner) {
        self.runners.lock().unwrap().push(runner);
    }

    pub fn removed_ids(&self) -> Vec<i64> {
        self.removed.lock().unwrap().clone()
    }

    fn check_auth(&self) -> Result<()> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(Error::Unauthorized("bad credentials".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ForgeClient for MockForge {
    fn entity(&self) -> &Entity {
        &self.entity
    }

    async fn list_runners(&self) -> Result<Vec<ForgeRunner>> {
        self.check_auth()?;
        Ok(self.runners.lock().unwrap().clone())
    }

    async fn list_tool_downloads(&self) -> Result<Vec<ToolDownload>> {
        self.check_auth()?;
        Ok(vec![ToolDownload {
            os: "linux".to_string(),
            architecture: "x64".to_string(),
            filename: "actions-runner-linux-x64.tar.gz".to_string(),
            download_url: "https://example.com/actions-runner-linux-x64.tar.gz".to_string(),
            temp_download_token: None,
        }])
    }

    async fn create_registration_token(&self) -> Result<RegistrationToken> {
        self.check_auth()?;
        Ok(RegistrationToken {
            token: "registration-token".to_string(),
            expires_at: None,
        })
    }

    async fn create_jit_config(
        &self,
        runner_name: &str,
        _pool: &Pool,
        labels: &[String],
    ) -> Result<JitConfig> {
        self.check_auth()?;
        let id = self.next_runner_id.fetch_add(1, Ordering::SeqCst);
        Ok(JitConfig {
            encoded_jit_config: format!("jit-{runner_name}"),
            runner: ForgeRunner {
                id,
                name: runner_name.to_string(),
                status: "offline".to_string(),
                busy: false,
                labels: labels.to_vec(),
            },
        })
    }

    async fn remove_runner(&self, runner_id: i64) -> Result<()> {
        self.check_auth()?;
        self.removed.lock().unwrap().push(runner_id);
        let mut runners = self.runners.lock().unwrap();
        let before = runners.len();
        runners.retain(|runner| runner.id != runner_id);
        if runners.len() == before {
            return Err(Error::NotFound(format!("runner {runner_id}")));
        }
        Ok(())
    }

    async fn workflow_job(&self, _owner: &str, _repo: &str, job_id: i64) -> Result<WorkflowJob> {
        self.check_auth()?;
        self.jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    async fn list_hooks(&self) -> Result<Vec<ForgeHook>> {
        self.check_auth()?;
        Ok(self.hooks.lock().unwrap().clone())
    }

    async fn create_hook(&self, url: &str, _secret: &str) -> Result<ForgeHook> {
        self.check_auth()?;
        let mut hooks = self.hooks.lock().unwrap();
        let hook = ForgeHook {
            id: hooks.len() as i64 + 1,
            url: url.to_string(),
            active: true,
        };
        hooks.push(hook.clone());
        Ok(hook)
    }

    async fn delete_hook(&self, hook_id: i64) -> Result<()> {
        self.check_auth()?;
        let mut hooks = self.hooks.lock().unwrap();
        let before = hooks.len();
        hooks.retain(|hook| hook.id != hook_id);
        if hooks.len() == before {
            return Err(Error::NotFound(format!("hook {hook_id}")));
        }
        Ok(())
    }

    async fn ping_hook(&self, _hook_id: i64) -> Result<()> {
        self.check_auth()
    }
}

pub struct MockProvider {
    name: String,
    pub created: Mutex<Vec<BootstrapInstance>>,
    pub servers: Mutex<HashMap<String, ProviderInstance>>,
    pub fail_create: AtomicBool,
    pub fail_delete: AtomicBool,
    pub create_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    next_server_id: AtomicI64,
}

impl MockProvider {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            created: Mutex::new(Vec::new()),
            servers: Mutex::new(HashMap::new()),
            fail_create: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            create_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            next_server_id: AtomicI64::new(1),
        })
    }

    pub fn created_bootstraps(&self) -> Vec<BootstrapInstance> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_instance(&self, bootstrap: &BootstrapInstance) -> Result<ProviderInstance> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Provider("simulated boot failure".to_string()));
        }
        self.created.lock().unwrap().push(bootstrap.clone());
        let id = self.next_server_id.fetch_add(1, Ordering::SeqCst);
        let instance = ProviderInstance {
            provider_id: format!("srv-{id}"),
            name: bootstrap.name.clone(),
            status: ProviderInstanceStatus::Running,
            os_type: Some(bootstrap.os_type),
            os_arch: Some(bootstrap.os_arch),
            addresses: vec![Address {
                address: format!("10.0.0.{id}"),
                kind: AddressKind::Private,
            }],
            fault: None,
        };
        self.servers
            .lock()
            .unwrap()
            .insert(bootstrap.name.clone(), instance.clone());
        Ok(instance)
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::Provider("simulated delete failure".to_string()));
        }
        let mut servers = self.servers.lock().unwrap();
        servers.retain(|name, server| name != instance_id && server.provider_id != instance_id);
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<ProviderInstance> {
        self.servers
            .lock()
            .unwrap()
            .values()
            .find(|server| server.name == instance_id || server.provider_id == instance_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("server {instance_id}")))
    }

    async fn list_instances(&self, _pool_id: Uuid) -> Result<Vec<ProviderInstance>> {
        Ok(self.servers.lock().unwrap().values().cloned().collect())
    }

    async fn start(&self, _instance_id: &str) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _instance_id: &str, _force: bool) -> Result<()> {
        Ok(())
    }

    async fn remove_all_instances(&self) -> Result<()> {
        self.servers.lock().unwrap().clear();
        Ok(())
    }
}

pub struct PoolSpec {
    pub max_runners: u32,
    pub min_idle_runners: u32,
    pub scale_down_factor: f64,
}

impl Default for PoolSpec {
    fn default() -> Self {
        Self {
            max_runners: 5,
            min_idle_runners: 0,
            scale_down_factor: 0.5,
        }
    }
}

pub struct Harness {
    pub manager: Arc<PoolManager>,
    pub store: Arc<SqliteStore>,
    pub forge: Arc<MockForge>,
    pub provider: Arc<MockProvider>,
    pub entity: Entity,
    pub pool: Pool,
    pub hub: WatcherHub,
    pub db_url: String,
    _tmp: TempDir,
}

pub async fn harness(spec: PoolSpec) -> Harness {
    let tmp = TempDir::new().expect("temp dir");
    let db_url = format!(
        "sqlite://{}?mode=rwc",
        tmp.path().join("fleet.db").display()
    );
    let hub = WatcherHub::new();
    let store = Arc::new(
        SqliteStore::connect(&db_url, hub.clone())
            .await
            .expect("store"),
    );

    store
        .upsert_credentials(Credentials {
            name: "default".to_string(),
            token: "token".to_string(),
            forge_url: "https://github.com".to_string(),
        })
        .await
        .unwrap();

    let entity = Entity {
        id: Uuid::new_v4(),
        entity_type: EntityType::Organization,
        owner: String::new(),
        name: "acme".to_string(),
        credentials_name: "default".to_string(),
        webhook_secret: "hush".to_string(),
    };
    store.create_entity(entity.clone()).await.unwrap();

    let pool = Pool {
        id: Uuid::new_v4(),
        entity_id: entity.id,
        provider_name: "mock".to_string(),
        image: "ubuntu-24.04".to_string(),
        flavor: "m1.small".to_string(),
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        tags: vec![
            "self-hosted".to_string(),
            "linux".to_string(),
            "x64".to_string(),
        ],
        max_runners: spec.max_runners,
        min_idle_runners: spec.min_idle_runners,
        enabled: true,
        runner_timeout_minutes: 20,
        runner_group: String::new(),
        priority: 10,
        runner_prefix: "gha".to_string(),
        scale_down_factor: spec.scale_down_factor,
    };
    store.create_pool(pool.clone()).await.unwrap();

    let provider = MockProvider::new("mock");
    let mut registry = ProviderRegistry::new();
    registry.register(provider.clone());

    let forge = MockForge::new(entity.clone());
    let factory: ForgeClientFactory = {
        let forge = forge.clone();
        Arc::new(move |_entity, _credentials| Ok(forge.clone() as Arc<dyn ForgeClient>))
    };

    let manager = PoolManager::with_factory(
        entity.clone(),
        store.clone() as Arc<dyn Store>,
        Arc::new(registry),
        KeyMuxRegistry::new(),
        ToolsCache::new(),
        hub.clone(),
        ManagerOptions {
            jwt_secret: "secret".to_string(),
            use_jit_config: true,
        },
        factory,
    )
    .await
    .expect("manager");
    manager.update_tools().await.expect("tool catalog");

    Harness {
        manager,
        store,
        forge,
        provider,
        entity,
        pool,
        hub,
        db_url,
        _tmp: tmp,
    }
}

pub fn workflow_event(action: JobAction, org: &str, labels: &[&str]) -> WorkflowJobEvent {
    WorkflowJobEvent {
        action,
        workflow_job: WorkflowJob {
            id: 42,
            runner_name: None,
            labels: labels.iter().map(|label| label.to_string()).collect(),
            conclusion: None,
        },
        repository: None,
        organization: Some(EventAccount {
            login: org.to_string(),
        }),
        enterprise: None,
    }
}

pub fn workflow_event_for_runner(action: JobAction, org: &str, runner: &str) -> WorkflowJobEvent {
    let mut event = workflow_event(action, org, &[]);
    event.workflow_job.runner_name = Some(runner.to_string());
    event
}

/// Rewrite an instance's `updated_at` through a second connection, so age
/// based reconcilers can be exercised without waiting.
pub async fn backdate_instance(db_url: &str, name: &str, minutes: i64) {
    let pool = sqlx::SqlitePool::connect(db_url).await.expect("raw pool");
    let stamp = (Utc::now() - chrono::Duration::minutes(minutes)).to_rfc3339();
    sqlx::query("UPDATE instances SET updated_at = ?1 WHERE name = ?2")
        .bind(stamp)
        .bind(name)
        .execute(&pool)
        .await
        .expect("backdate");
    pool.close().await;
}

pub async fn wait_for_instance<F>(
    store: &SqliteStore,
    name: &str,
    what: &str,
    predicate: F,
) -> Instance
where
    F: Fn(&Instance) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(instance) = store.get_instance_by_name(name).await {
            if predicate(&instance) {
                return instance;
            }
        }
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub async fn wait_for_instance_gone(store: &SqliteStore, name: &str) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        match store.get_instance_by_name(name).await {
            Err(error) if error.is_not_found() => return,
            _ => {}
        }
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {name} to be deleted");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub async fn wait_for_pool_instances<F>(
    store: &SqliteStore,
    pool_id: Uuid,
    what: &str,
    predicate: F,
) -> Vec<Instance>
where
    F: Fn(&[Instance]) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let instances = store.list_pool_instances(pool_id).await.expect("list");
        if predicate(&instances) {
            return instances;
        }
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub async fn wait_until<F>(what: &str, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if predicate() {
            return;
        }
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
