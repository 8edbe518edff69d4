mod reconcile;
mod webhook;

pub use reconcile::LoopKind;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backoff::DeleteBackoffRegistry;
use crate::errors::{Error, Result};
use crate::forge::{ForgeClient, GithubEntityClient};
use crate::locking::KeyMuxRegistry;
use crate::model::{Credentials, Entity, Instance, InstanceStatus, RunnerStatus};
use crate::provider::ProviderRegistry;
use crate::store::Store;
use crate::tools::ToolsCache;
use crate::watcher::{
    ChangeConsumer, ChangeEvent, ChangeOperation, ChangePayload, WatcherHub, entity_scope_filter,
};

/// Cadence of the consolidation family of reconcilers.
pub const CONSOLIDATION_INTERVAL: Duration = Duration::from_secs(5);
pub const SCALE_DOWN_INTERVAL: Duration = Duration::from_secs(60);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const UNAUTHORIZED_BACKOFF: Duration = Duration::from_secs(5 * 60);
/// Instances that failed this many creations are left alone for a human.
pub const MAX_CREATE_ATTEMPTS: u32 = 5;
/// How long a runner must sit idle before scale-down may take it.
pub const IDLE_GRACE: Duration = Duration::from_secs(5 * 60);
/// Minimum instance age before it can be considered orphaned.
pub const ORPHAN_GRACE: Duration = Duration::from_secs(5 * 60);
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const BLOCKING_LOCK_DEADLINE: Duration = Duration::from_secs(10);
pub(crate) const TOOLS_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds a forge client for an entity; swapped out in tests.
pub type ForgeClientFactory =
    Arc<dyn Fn(&Entity, &Credentials) -> Result<Arc<dyn ForgeClient>> + Send + Sync>;

pub fn github_client_factory() -> ForgeClientFactory {
    Arc::new(|entity, credentials| {
        Ok(Arc::new(GithubEntityClient::new(entity.clone(), credentials)?)
            as Arc<dyn ForgeClient>)
    })
}

#[derive(Clone, Debug)]
pub struct ManagerOptions {
    pub jwt_secret: String,
    pub use_jit_config: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PoolManagerStatus {
    pub is_running: bool,
    pub failure_reason: Option<String>,
}

struct ManagerState {
    running: bool,
    failure_reason: Option<String>,
    entity: Entity,
    forge: Arc<dyn ForgeClient>,
}

/// Control loop for one forge entity. Reconciles the entity's desired
/// instances against the forge's runner registry and the cloud provider,
/// driven by periodic tasks and workflow-job webhooks.
pub struct PoolManager {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) providers: Arc<ProviderRegistry>,
    pub(crate) locker: KeyMuxRegistry,
    pub(crate) backoff: DeleteBackoffRegistry,
    pub(crate) tools: ToolsCache,
    pub(crate) controller_id: Uuid,
    pub(crate) options: ManagerOptions,
    entity_id: Uuid,
    state: Mutex<ManagerState>,
    forge_factory: ForgeClientFactory,
    tools_ready: watch::Sender<bool>,
    quit: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    hub: WatcherHub,
}

impl PoolManager {
    /// Build a manager with a real GitHub client for the entity.
    pub async fn new(
        entity: Entity,
        store: Arc<dyn Store>,
        providers: Arc<ProviderRegistry>,
        locker: KeyMuxRegistry,
        tools: ToolsCache,
        hub: WatcherHub,
        options: ManagerOptions,
    ) -> Result<Arc<Self>> {
        Self::with_factory(
            entity,
            store,
            providers,
            locker,
            tools,
            hub,
            options,
            github_client_factory(),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn with_factory(
        entity: Entity,
        store: Arc<dyn Store>,
        providers: Arc<ProviderRegistry>,
        locker: KeyMuxRegistry,
        tools: ToolsCache,
        hub: WatcherHub,
        options: ManagerOptions,
        forge_factory: ForgeClientFactory,
    ) -> Result<Arc<Self>> {
        let controller = store.controller_info().await?;
        let credentials = store.get_credentials(&entity.credentials_name).await?;
        let forge = forge_factory(&entity, &credentials)?;

        let (quit, _) = broadcast::channel(1);
        let (tools_ready, _) = watch::channel(false);
        Ok(Arc::new(Self {
            store,
            providers,
            locker,
            backoff: DeleteBackoffRegistry::new(CONSOLIDATION_INTERVAL),
            tools,
            controller_id: controller.controller_id,
            options,
            entity_id: entity.id,
            state: Mutex::new(ManagerState {
                running: true,
                failure_reason: None,
                entity,
                forge,
            }),
            forge_factory,
            tools_ready,
            quit,
            handles: Mutex::new(Vec::new()),
            hub,
        }))
    }

    /// Spawn the reconciliation loops, the tools updater and the watcher
    /// consumer.
    pub fn start(self: &Arc<Self>) {
        let entity = self.entity();
        tracing::info!(entity = %entity.slug(), "starting pool manager");

        let mut handles = self.handles.lock().expect("manager handles poisoned");
        for kind in LoopKind::all() {
            let manager = Arc::clone(self);
            handles.push(tokio::spawn(manager.run_periodic(kind)));
        }

        let consumer = self
            .hub
            .register(&entity.slug(), entity_scope_filter(&entity));
        let manager = Arc::clone(self);
        handles.push(tokio::spawn(manager.run_consumer(consumer)));
    }

    pub fn stop(&self) {
        let _ = self.quit.send(());
    }

    /// Wait for every loop to drain, bounded by the shutdown ceiling.
    pub async fn wait(&self) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("manager handles poisoned");
            guard.drain(..).collect()
        };
        tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(handles))
            .await
            .map_err(|_| Error::Timeout("pool manager shutdown".to_string()))?;
        Ok(())
    }

    pub fn status(&self) -> PoolManagerStatus {
        let state = self.state.lock().expect("manager state poisoned");
        PoolManagerStatus {
            is_running: state.running,
            failure_reason: state.failure_reason.clone(),
        }
    }

    pub fn entity(&self) -> Entity {
        self.state.lock().expect("manager state poisoned").entity.clone()
    }

    pub(crate) fn running(&self) -> bool {
        self.state.lock().expect("manager state poisoned").running
    }

    pub(crate) fn set_running(&self, running: bool, failure_reason: Option<String>) {
        let mut state = self.state.lock().expect("manager state poisoned");
        if state.running != running {
            if running {
                tracing::info!(entity = %state.entity.slug(), "pool manager recovered");
            } else {
                tracing::warn!(
                    entity = %state.entity.slug(),
                    reason = failure_reason.as_deref().unwrap_or(""),
                    "pool manager suspended"
                );
            }
        }
        state.running = running;
        state.failure_reason = failure_reason;
    }

    pub(crate) fn forge(&self) -> Arc<dyn ForgeClient> {
        self.state.lock().expect("manager state poisoned").forge.clone()
    }

    pub(crate) fn quit_rx(&self) -> broadcast::Receiver<()> {
        self.quit.subscribe()
    }

    pub(crate) fn tools_ready(&self) -> &watch::Sender<bool> {
        &self.tools_ready
    }

    /// Register this controller's webhook endpoint with the forge.
    /// Idempotent: an existing hook pointing at the same URL is reused.
    pub async fn install_webhook(&self, base_url: &str) -> Result<crate::model::ForgeHook> {
        if !self.running() {
            return Err(Error::Conflict("pool manager is not running".to_string()));
        }
        let entity = self.entity();
        let url = format!("{}/webhook", base_url.trim_end_matches('/'));
        let forge = self.forge();
        if let Some(existing) = forge
            .list_hooks()
            .await?
            .into_iter()
            .find(|hook| hook.url == url)
        {
            return Ok(existing);
        }
        let hook = forge.create_hook(&url, &entity.webhook_secret).await?;
        if let Err(error) = forge.ping_hook(hook.id).await {
            tracing::warn!(hook_id = hook.id, error = %error, "webhook ping failed");
        }
        Ok(hook)
    }

    /// Remove this controller's webhook registration, if present.
    pub async fn uninstall_webhook(&self, base_url: &str) -> Result<()> {
        let url = format!("{}/webhook", base_url.trim_end_matches('/'));
        let forge = self.forge();
        let Some(hook) = forge
            .list_hooks()
            .await?
            .into_iter()
            .find(|hook| hook.url == url)
        else {
            return Ok(());
        };
        match forge.delete_hook(hook.id).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Synchronously remove a runner from the forge and queue its instance
    /// for deletion. External command entry point.
    pub async fn force_delete_runner(&self, name: &str) -> Result<()> {
        if !self.running() {
            return Err(Error::Conflict("pool manager is not running".to_string()));
        }
        let instance = self.store.get_instance_by_name(name).await?;
        self.locker
            .lock_with_deadline(name, "force-delete", BLOCKING_LOCK_DEADLINE)
            .await?;
        let result = self.force_delete_locked(&instance).await;
        self.locker.unlock(name, false);
        result
    }

    /// Caller must hold the instance's key mutex.
    pub(crate) async fn force_delete_locked(&self, instance: &Instance) -> Result<()> {
        if instance.agent_id != 0 {
            match self.forge().remove_runner(instance.agent_id).await {
                Ok(()) => {}
                // Already unregistered; nothing left forge-side.
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error),
            }
        }
        self.store
            .update_instance(
                &instance.name,
                crate::model::UpdateInstanceParams {
                    status: Some(InstanceStatus::PendingDelete),
                    runner_status: Some(RunnerStatus::Terminated),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Try-lock variant used from periodic loops; returns false when the
    /// instance is busy elsewhere.
    pub(crate) async fn try_force_delete(&self, instance: &Instance) -> Result<bool> {
        if !self.locker.try_lock(&instance.name, "force-delete") {
            return Ok(false);
        }
        let result = self.force_delete_locked(instance).await;
        self.locker.unlock(&instance.name, false);
        result.map(|()| true)
    }

    async fn run_consumer(self: Arc<Self>, mut consumer: ChangeConsumer) {
        let mut quit = self.quit_rx();
        loop {
            tokio::select! {
                event = consumer.recv() => match event {
                    Some(event) => self.handle_change(event).await,
                    None => break,
                },
                _ = quit.recv() => break,
            }
        }
        consumer.close();
    }

    async fn handle_change(&self, event: ChangeEvent) {
        match (event.operation, event.payload) {
            (ChangeOperation::Delete, ChangePayload::Entity(changed)) => {
                if changed.id != self.entity_id {
                    tracing::warn!(got = %changed.id, "dropping stale entity event");
                    return;
                }
                tracing::info!(entity = %changed.slug(), "entity deleted, shutting down");
                self.stop();
            }
            (_, ChangePayload::Entity(changed)) => {
                if changed.id != self.entity_id {
                    tracing::warn!(got = %changed.id, "dropping stale entity event");
                    return;
                }
                let credentials_changed = {
                    let mut state = self.state.lock().expect("manager state poisoned");
                    let changed_credentials =
                        state.entity.credentials_name != changed.credentials_name;
                    state.entity = changed;
                    changed_credentials
                };
                if credentials_changed {
                    self.rebuild_forge_client().await;
                }
            }
            (_, ChangePayload::Credentials(credentials)) => {
                if credentials.name != self.entity().credentials_name {
                    tracing::warn!(credentials = %credentials.name, "dropping stale credentials event");
                    return;
                }
                self.rebuild_forge_client().await;
            }
            (_, ChangePayload::Controller(info)) => {
                tracing::debug!(controller_id = %info.controller_id, "controller info refreshed");
            }
        }
    }

    /// Credentials changed: rebuild the forge client, drop the cached tool
    /// catalog and probe the new credentials right away.
    async fn rebuild_forge_client(&self) {
        let entity = self.entity();
        let credentials = match self.store.get_credentials(&entity.credentials_name).await {
            Ok(credentials) => credentials,
            Err(error) => {
                tracing::error!(error = %error, "cannot load updated credentials");
                return;
            }
        };
        match (self.forge_factory)(&entity, &credentials) {
            Ok(forge) => {
                self.state.lock().expect("manager state poisoned").forge = forge;
                tracing::info!(entity = %entity.slug(), "rebuilt forge client");
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to rebuild forge client");
                return;
            }
        }

        self.tools.reset(entity.id);
        let _ = self.tools_ready.send(false);
        match self.update_tools().await {
            Ok(()) => {
                if !self.running() {
                    self.set_running(true, None);
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "tool refresh after credential change failed");
            }
        }
    }
}
