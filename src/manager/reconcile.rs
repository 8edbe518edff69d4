use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;

use crate::auth;
use crate::errors::{Error, Result};
use crate::manager::{
    CLEANUP_INTERVAL, CONSOLIDATION_INTERVAL, IDLE_GRACE, MAX_CREATE_ATTEMPTS, ORPHAN_GRACE,
    PoolManager, SCALE_DOWN_INTERVAL, UNAUTHORIZED_BACKOFF,
};
use crate::model::{
    BootstrapInstance, ForgeRunner, Instance, InstanceStatus, RunnerStatus, UpdateInstanceParams,
    controller_id_label, pool_id_label,
};
use crate::tools;

/// The periodic tasks a pool manager runs. They share one loop skeleton:
/// tick, check the manager-running gate, run a pass, log failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopKind {
    RunnerCleanup,
    ScaleDown,
    DeletePending,
    AddPending,
    EnsureMinIdle,
    RetryFailed,
    UpdateTools,
    AuthRecovery,
}

impl LoopKind {
    pub fn all() -> [LoopKind; 8] {
        [
            LoopKind::RunnerCleanup,
            LoopKind::ScaleDown,
            LoopKind::DeletePending,
            LoopKind::AddPending,
            LoopKind::EnsureMinIdle,
            LoopKind::RetryFailed,
            LoopKind::UpdateTools,
            LoopKind::AuthRecovery,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            LoopKind::RunnerCleanup => "runner_cleanup",
            LoopKind::ScaleDown => "scale_down",
            LoopKind::DeletePending => "consolidate[delete_pending]",
            LoopKind::AddPending => "consolidate[add_pending]",
            LoopKind::EnsureMinIdle => "consolidate[ensure_min_idle]",
            LoopKind::RetryFailed => "consolidate[retry_failed]",
            LoopKind::UpdateTools => "update_tools",
            LoopKind::AuthRecovery => "bad_auth_backoff",
        }
    }

    fn period(&self) -> Duration {
        match self {
            LoopKind::RunnerCleanup => CLEANUP_INTERVAL,
            LoopKind::ScaleDown => SCALE_DOWN_INTERVAL,
            LoopKind::DeletePending
            | LoopKind::AddPending
            | LoopKind::EnsureMinIdle
            | LoopKind::RetryFailed => CONSOLIDATION_INTERVAL,
            LoopKind::UpdateTools => tools::jittered_update_interval(),
            LoopKind::AuthRecovery => UNAUTHORIZED_BACKOFF,
        }
    }
}

/// Runner states that satisfy a pool's idle floor: registered-but-unclaimed
/// runners and those still coming up.
fn counts_as_available(instance: &Instance) -> bool {
    matches!(
        instance.runner_status,
        RunnerStatus::Pending | RunnerStatus::Installing | RunnerStatus::Idle
    ) && !instance.status.is_terminating()
        && instance.status != InstanceStatus::Error
}

impl PoolManager {
    pub(crate) async fn run_periodic(self: Arc<Self>, kind: LoopKind) {
        let mut quit = self.quit_rx();
        let mut ticker = tokio::time::interval(kind.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = quit.recv() => {
                    tracing::debug!(task = kind.name(), "loop stopping");
                    return;
                }
            }

            if kind == LoopKind::AuthRecovery {
                self.try_auth_recovery().await;
                continue;
            }
            if !self.running() {
                continue;
            }

            if let Err(error) = self.run_pass(kind).await {
                if error.is_unauthorized() {
                    self.set_running(false, Some(error.to_string()));
                }
                tracing::warn!(task = kind.name(), error = %error, "reconciliation pass failed");
            }
        }
    }

    async fn run_pass(self: &Arc<Self>, kind: LoopKind) -> Result<()> {
        match kind {
            LoopKind::RunnerCleanup => self.runner_cleanup().await,
            LoopKind::ScaleDown => self.scale_down().await,
            LoopKind::DeletePending => self.delete_pending_instances().await,
            LoopKind::AddPending => self.add_pending_instances().await,
            LoopKind::EnsureMinIdle => self.ensure_min_idle_runners().await,
            LoopKind::RetryFailed => self.retry_failed_instances().await,
            LoopKind::UpdateTools => self.update_tools().await,
            LoopKind::AuthRecovery => unreachable!("handled before the gate"),
        }
    }

    /// Refresh the entity's runner-tool catalog.
    pub async fn update_tools(&self) -> Result<()> {
        let entity = self.entity();
        let downloads = self.forge().list_tool_downloads().await?;
        tracing::debug!(entity = %entity.slug(), tools = downloads.len(), "refreshed tool catalog");
        self.tools.set(entity.id, downloads);
        let _ = self.tools_ready().send(true);
        Ok(())
    }

    /// Probe the forge after an authorization failure; flips the manager
    /// back on when the credentials work again.
    pub async fn try_auth_recovery(&self) {
        if self.running() {
            return;
        }
        match self.forge().list_runners().await {
            Ok(_) => self.set_running(true, None),
            Err(error) => {
                tracing::debug!(error = %error, "forge auth probe failed");
            }
        }
    }

    /// Pick up `pending_create` instances and drive each through provider
    /// creation in its own task, under its key mutex.
    pub async fn add_pending_instances(self: &Arc<Self>) -> Result<()> {
        let entity = self.entity();
        let instances = self.store.list_entity_instances(entity.id).await?;
        for instance in instances
            .into_iter()
            .filter(|instance| instance.status == InstanceStatus::PendingCreate)
        {
            if !self.locker.try_lock(&instance.name, "add-pending") {
                continue;
            }
            // Flip to creating before spawning so the next tick skips it.
            let update = UpdateInstanceParams {
                status: Some(InstanceStatus::Creating),
                runner_status: Some(RunnerStatus::Installing),
                ..Default::default()
            };
            if let Err(error) = self.store.update_instance(&instance.name, update).await {
                tracing::error!(instance = %instance.name, error = %error, "cannot mark instance as creating");
                self.locker.unlock(&instance.name, false);
                continue;
            }

            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let name = instance.name.clone();
                if let Err(error) = manager.provision_instance(instance).await {
                    if error.is_unauthorized() {
                        manager.set_running(false, Some(error.to_string()));
                    }
                    tracing::error!(instance = %name, error = %error, "instance provisioning failed");
                    let update = UpdateInstanceParams {
                        status: Some(InstanceStatus::Error),
                        provider_fault: Some(error.to_string()),
                        ..Default::default()
                    };
                    if let Err(update_error) = manager.store.update_instance(&name, update).await {
                        tracing::error!(instance = %name, error = %update_error, "cannot record provisioning failure");
                    }
                }
                manager.locker.unlock(&name, false);
            });
        }
        Ok(())
    }

    async fn provision_instance(&self, instance: Instance) -> Result<()> {
        let entity = self.entity();
        let pool = self.store.get_pool(instance.pool_id).await?;
        let (provider, limiter) = self.providers.get(&pool.provider_name)?;
        let tools = self
            .tools
            .get(entity.id)
            .ok_or_else(|| Error::Conflict("tool catalog not yet available".to_string()))?;
        let credentials = self.store.get_credentials(&entity.credentials_name).await?;

        let mut labels = pool.tags.clone();
        labels.push(pool_id_label(pool.id));
        labels.push(controller_id_label(self.controller_id));

        let forge = self.forge();
        let (jit_config, registration_token, agent_id) = if self.options.use_jit_config {
            let jit = forge
                .create_jit_config(&instance.name, &pool, &labels)
                .await?;
            (Some(jit.encoded_jit_config), None, jit.runner.id)
        } else {
            let token = forge.create_registration_token().await?;
            (None, Some(token.token), 0)
        };
        self.store
            .update_instance(
                &instance.name,
                UpdateInstanceParams {
                    token_fetched: Some(true),
                    agent_id: Some(agent_id),
                    ..Default::default()
                },
            )
            .await?;

        let instance_token = auth::mint_instance_token(
            &self.options.jwt_secret,
            &instance.name,
            pool.id,
            Duration::from_secs(u64::from(pool.runner_timeout_minutes) * 60),
        )?;
        let bootstrap = BootstrapInstance {
            name: instance.name.clone(),
            pool_id: pool.id,
            image: pool.image.clone(),
            flavor: pool.flavor.clone(),
            os_type: pool.os_type,
            os_arch: pool.os_arch,
            labels,
            tools,
            jit_config,
            registration_token,
            instance_token,
            forge_url: format!(
                "{}/{}",
                credentials.forge_url.trim_end_matches('/'),
                entity.slug()
            ),
            runner_group: pool.runner_group.clone(),
        };

        let permit = limiter
            .acquire_owned()
            .await
            .map_err(|e| Error::Other(e.into()))?;
        let created = provider.create_instance(&bootstrap).await;
        drop(permit);

        let provider_instance = match created {
            Ok(provider_instance) => provider_instance,
            Err(error) => {
                // A failed boot can leave artifacts on both sides; clear the
                // forge registration now, the partial VM before any retry.
                if agent_id != 0 {
                    if let Err(cleanup) = forge.remove_runner(agent_id).await {
                        if !cleanup.is_not_found() {
                            tracing::warn!(instance = %instance.name, error = %cleanup, "failed to remove runner after boot failure");
                        }
                    }
                }
                if let Err(cleanup) = provider.delete_instance(&instance.name).await {
                    tracing::warn!(instance = %instance.name, error = %cleanup, "failed to clear partial instance");
                }
                return Err(error);
            }
        };

        self.store
            .update_instance(
                &instance.name,
                UpdateInstanceParams {
                    provider_id: Some(provider_instance.provider_id),
                    status: Some(provider_instance.status.instance_status()),
                    runner_status: Some(RunnerStatus::Installing),
                    addresses: Some(provider_instance.addresses),
                    provider_fault: provider_instance.fault,
                    os_type: provider_instance.os_type,
                    os_arch: provider_instance.os_arch,
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(instance = %instance.name, pool_id = %pool.id, "instance provisioned");
        Ok(())
    }

    /// Tear down `pending_delete` instances, one task per instance.
    pub async fn delete_pending_instances(self: &Arc<Self>) -> Result<()> {
        let entity = self.entity();
        let instances = self.store.list_entity_instances(entity.id).await?;
        for instance in instances
            .into_iter()
            .filter(|instance| instance.status == InstanceStatus::PendingDelete)
        {
            let (clear, earliest) = self.backoff.should_process(&instance.name);
            if !clear {
                tracing::debug!(instance = %instance.name, retry_at = ?earliest, "deletion backed off");
                continue;
            }
            if !self.locker.try_lock(&instance.name, "delete-pending") {
                continue;
            }
            if let Err(error) = self
                .store
                .update_instance(
                    &instance.name,
                    UpdateInstanceParams::status(InstanceStatus::Deleting),
                )
                .await
            {
                tracing::error!(instance = %instance.name, error = %error, "cannot mark instance as deleting");
                self.locker.unlock(&instance.name, false);
                continue;
            }

            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let name = instance.name.clone();
                match manager.deprovision_instance(&instance).await {
                    Ok(()) => {
                        manager.backoff.delete(&name);
                        manager.locker.unlock(&name, true);
                        tracing::info!(instance = %name, "instance deleted");
                    }
                    Err(error) => {
                        tracing::error!(instance = %name, error = %error, "instance deletion failed");
                        manager.backoff.record_failure(&name);
                        // Back to pending_delete; the next tick retries.
                        if let Err(revert) = manager
                            .store
                            .update_instance(
                                &name,
                                UpdateInstanceParams::status(InstanceStatus::PendingDelete),
                            )
                            .await
                        {
                            tracing::error!(instance = %name, error = %revert, "cannot requeue instance deletion");
                        }
                        manager.locker.unlock(&name, false);
                    }
                }
            });
        }
        Ok(())
    }

    async fn deprovision_instance(&self, instance: &Instance) -> Result<()> {
        let pool = self.store.get_pool(instance.pool_id).await?;
        let (provider, limiter) = self.providers.get(&pool.provider_name)?;
        let target = instance
            .provider_id
            .clone()
            .unwrap_or_else(|| instance.name.clone());

        let permit = limiter
            .acquire_owned()
            .await
            .map_err(|e| Error::Other(e.into()))?;
        let result = provider.delete_instance(&target).await;
        drop(permit);
        match result {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }
        self.store.delete_instance(instance.pool_id, &instance.name).await
    }

    /// Top pools up to their idle floor, bounded by their runner ceiling.
    pub async fn ensure_min_idle_runners(&self) -> Result<()> {
        let entity = self.entity();
        let pools = self.store.list_entity_pools(entity.id).await?;
        for pool in pools.into_iter().filter(|pool| pool.enabled) {
            if pool.min_idle_runners == 0 {
                continue;
            }
            let instances = self.store.list_pool_instances(pool.id).await?;
            let existing = instances
                .iter()
                .filter(|instance| !instance.status.is_terminating())
                .count();
            let available = instances.iter().filter(|i| counts_as_available(i)).count();
            if available >= pool.min_idle_runners as usize {
                continue;
            }

            let deficit = pool.min_idle_runners as usize - available;
            let headroom = (pool.max_runners as usize).saturating_sub(existing);
            let to_create = deficit.min(headroom);
            for _ in 0..to_create {
                let params = crate::model::CreateInstanceParams::for_pool(&pool);
                if let Err(error) = self.store.create_instance(pool.id, params).await {
                    tracing::error!(pool_id = %pool.id, error = %error, "cannot queue idle runner");
                    break;
                }
            }
            if to_create > 0 {
                tracing::info!(pool_id = %pool.id, created = to_create, "topped up idle runners");
            }
        }
        Ok(())
    }

    /// Remove surplus idle runners that have been idle past the grace
    /// period, oldest first, a configurable fraction per tick.
    pub async fn scale_down(&self) -> Result<()> {
        let entity = self.entity();
        let pools = self.store.list_entity_pools(entity.id).await?;
        for pool in pools.into_iter().filter(|pool| pool.enabled) {
            let instances = self.store.list_pool_instances(pool.id).await?;
            let idle: Vec<&Instance> = instances
                .iter()
                .filter(|instance| {
                    instance.runner_status == RunnerStatus::Idle
                        && instance.status == InstanceStatus::Running
                })
                .collect();
            let surplus = idle.len().saturating_sub(pool.min_idle_runners as usize);
            if surplus == 0 {
                continue;
            }

            let grace = chrono::Duration::seconds(IDLE_GRACE.as_secs() as i64);
            let now = Utc::now();
            let mut aged: Vec<&Instance> = idle
                .into_iter()
                .filter(|instance| now - instance.updated_at > grace)
                .collect();
            aged.sort_by_key(|instance| instance.updated_at);

            let to_remove = ((surplus as f64) * pool.scale_down_factor).ceil() as usize;
            for instance in aged.into_iter().take(to_remove) {
                match self.try_force_delete(instance).await {
                    Ok(true) => {
                        tracing::info!(instance = %instance.name, pool_id = %pool.id, "scaled down idle runner");
                    }
                    Ok(false) => {
                        tracing::debug!(instance = %instance.name, "instance busy, skipping scale-down");
                    }
                    Err(error) if error.is_unauthorized() => return Err(error),
                    Err(error) => {
                        tracing::error!(instance = %instance.name, error = %error, "scale-down failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Reap timed-out runners, then converge the database, the provider and
    /// the forge on each other after crashes on any side.
    pub async fn runner_cleanup(&self) -> Result<()> {
        let runners = self.forge().list_runners().await?;
        let managed: Vec<ForgeRunner> = runners
            .into_iter()
            .filter(|runner| runner.managed_by(self.controller_id))
            .collect();

        self.reap_timed_out_runners(&managed).await?;
        self.cleanup_orphaned_instances(&managed).await?;
        self.cleanup_orphaned_forge_runners(&managed).await?;
        Ok(())
    }

    /// Instances older than their pool's runner timeout whose runner never
    /// came online (or died) are force-deleted.
    async fn reap_timed_out_runners(&self, managed: &[ForgeRunner]) -> Result<()> {
        let entity = self.entity();
        let by_name: HashMap<&str, &ForgeRunner> = managed
            .iter()
            .map(|runner| (runner.name.as_str(), runner))
            .collect();
        let pools: HashMap<_, _> = self
            .store
            .list_entity_pools(entity.id)
            .await?
            .into_iter()
            .map(|pool| (pool.id, pool))
            .collect();

        for instance in self.store.list_entity_instances(entity.id).await? {
            if instance.status.is_terminating() {
                continue;
            }
            let Some(pool) = pools.get(&instance.pool_id) else {
                continue;
            };
            let timeout = chrono::Duration::minutes(i64::from(pool.runner_timeout_minutes));
            if Utc::now() - instance.updated_at < timeout {
                continue;
            }
            let expendable = match by_name.get(instance.name.as_str()) {
                None => true,
                Some(runner) => {
                    !runner.is_online() && instance.runner_status == RunnerStatus::Failed
                }
            };
            if !expendable {
                continue;
            }

            tracing::warn!(
                instance = %instance.name,
                updated_at = %instance.updated_at,
                "reaping timed out runner"
            );
            match self.try_force_delete(&instance).await {
                Ok(_) => {}
                Err(error) if error.is_unauthorized() => return Err(error),
                Err(error) => {
                    tracing::error!(instance = %instance.name, error = %error, "failed to reap runner");
                }
            }
        }
        Ok(())
    }

    /// Instances the forge no longer lists, past the orphan grace, go to
    /// `pending_delete` so the delete loop clears the VM and the row.
    async fn cleanup_orphaned_instances(&self, managed: &[ForgeRunner]) -> Result<()> {
        let entity = self.entity();
        let by_name: HashMap<&str, &ForgeRunner> = managed
            .iter()
            .map(|runner| (runner.name.as_str(), runner))
            .collect();
        let grace = chrono::Duration::seconds(ORPHAN_GRACE.as_secs() as i64);

        for instance in self.store.list_entity_instances(entity.id).await? {
            if matches!(
                instance.status,
                InstanceStatus::PendingCreate
                    | InstanceStatus::Creating
                    | InstanceStatus::PendingDelete
                    | InstanceStatus::Deleting
            ) {
                continue;
            }
            if matches!(
                instance.runner_status,
                RunnerStatus::Pending | RunnerStatus::Installing
            ) {
                continue;
            }
            if Utc::now() - instance.updated_at < grace {
                continue;
            }
            if by_name.contains_key(instance.name.as_str()) {
                continue;
            }

            if !self.locker.try_lock(&instance.name, "cleanup") {
                continue;
            }
            tracing::warn!(instance = %instance.name, "instance has no forge runner, queueing deletion");
            if let Err(error) = self
                .store
                .update_instance(
                    &instance.name,
                    UpdateInstanceParams::status(InstanceStatus::PendingDelete),
                )
                .await
            {
                tracing::error!(instance = %instance.name, error = %error, "cannot queue orphan deletion");
            }
            self.locker.unlock(&instance.name, false);
        }
        Ok(())
    }

    /// Offline forge runners whose instance row is gone, or whose VM the
    /// provider has forgotten, are unregistered from the forge.
    async fn cleanup_orphaned_forge_runners(&self, managed: &[ForgeRunner]) -> Result<()> {
        let forge = self.forge();
        for runner in managed.iter().filter(|runner| !runner.is_online()) {
            let instance = match self.store.get_instance_by_name(&runner.name).await {
                Ok(instance) => instance,
                Err(error) if error.is_not_found() => {
                    tracing::warn!(runner = %runner.name, "removing forge runner without instance record");
                    match forge.remove_runner(runner.id).await {
                        Ok(()) => {}
                        Err(error) if error.is_not_found() => {}
                        Err(error) => return Err(error),
                    }
                    continue;
                }
                Err(error) => return Err(error),
            };

            if matches!(
                instance.status,
                InstanceStatus::PendingCreate
                    | InstanceStatus::Creating
                    | InstanceStatus::PendingDelete
                    | InstanceStatus::Deleting
            ) {
                continue;
            }

            let pool = self.store.get_pool(instance.pool_id).await?;
            let (provider, _) = self.providers.get(&pool.provider_name)?;
            let target = instance
                .provider_id
                .clone()
                .unwrap_or_else(|| instance.name.clone());
            match provider.get_instance(&target).await {
                Ok(_) => {}
                Err(error) if error.is_not_found() => {
                    tracing::warn!(runner = %runner.name, "provider lost the instance, removing forge runner");
                    match forge.remove_runner(runner.id).await {
                        Ok(()) => {}
                        Err(remove_error) if remove_error.is_not_found() => {}
                        Err(remove_error) => return Err(remove_error),
                    }
                    if self.locker.try_lock(&instance.name, "cleanup") {
                        if let Err(update_error) = self
                            .store
                            .update_instance(
                                &instance.name,
                                UpdateInstanceParams {
                                    status: Some(InstanceStatus::PendingDelete),
                                    runner_status: Some(RunnerStatus::Terminated),
                                    agent_id: Some(0),
                                    ..Default::default()
                                },
                            )
                            .await
                        {
                            tracing::error!(instance = %instance.name, error = %update_error, "cannot queue lost instance deletion");
                        }
                        self.locker.unlock(&instance.name, false);
                    }
                }
                Err(error) => {
                    tracing::error!(instance = %instance.name, error = %error, "cannot query provider for instance");
                }
            }
        }
        Ok(())
    }

    /// Requeue errored instances that still have attempts left, after
    /// clearing any partial provider artifact.
    pub async fn retry_failed_instances(&self) -> Result<()> {
        let entity = self.entity();
        let instances = self.store.list_entity_instances(entity.id).await?;
        for instance in instances.into_iter().filter(|instance| {
            instance.status == InstanceStatus::Error
                && instance.create_attempt < MAX_CREATE_ATTEMPTS
        }) {
            if !self.locker.try_lock(&instance.name, "retry-failed") {
                continue;
            }
            let result = self.requeue_failed_instance(&instance).await;
            self.locker.unlock(&instance.name, false);
            if let Err(error) = result {
                tracing::error!(instance = %instance.name, error = %error, "cannot retry failed instance");
            }
        }
        Ok(())
    }

    async fn requeue_failed_instance(&self, instance: &Instance) -> Result<()> {
        let pool = self.store.get_pool(instance.pool_id).await?;
        let (provider, _) = self.providers.get(&pool.provider_name)?;
        let target = instance
            .provider_id
            .clone()
            .unwrap_or_else(|| instance.name.clone());
        match provider.delete_instance(&target).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }

        self.store
            .update_instance(
                &instance.name,
                UpdateInstanceParams {
                    status: Some(InstanceStatus::PendingCreate),
                    runner_status: Some(RunnerStatus::Pending),
                    create_attempt: Some(instance.create_attempt + 1),
                    token_fetched: Some(false),
                    provider_fault: Some(String::new()),
                    agent_id: Some(0),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(
            instance = %instance.name,
            attempt = instance.create_attempt + 1,
            "requeued failed instance"
        );
        Ok(())
    }
}
