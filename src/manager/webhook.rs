use crate::errors::{Error, Result};
use crate::manager::{BLOCKING_LOCK_DEADLINE, PoolManager, TOOLS_WAIT_TIMEOUT};
use crate::model::{
    CreateInstanceParams, InstanceStatus, JobAction, RunnerStatus, UpdateInstanceParams,
    WorkflowJobEvent,
};

impl PoolManager {
    /// Entry point for workflow-job webhook deliveries. Only `BadRequest`
    /// and `Conflict` surface to the caller; everything else is absorbed
    /// into instance state or logs.
    pub async fn handle_workflow_job(&self, event: WorkflowJobEvent) -> Result<()> {
        let entity = self.entity();
        if !entity.owns_event(&event) {
            return Err(Error::BadRequest(format!(
                "event owner does not match {}",
                entity.slug()
            )));
        }

        let result = match event.action {
            JobAction::Queued => self.handle_job_queued(&event).await,
            JobAction::Completed => self.handle_job_completed(&event).await,
            JobAction::InProgress => self.handle_job_in_progress(&event).await,
            JobAction::Other => Ok(()),
        };

        match result {
            Ok(()) => Ok(()),
            Err(error) if error.is_unauthorized() => {
                self.set_running(false, Some(error.to_string()));
                Ok(())
            }
            Err(error) if error.is_bad_request() || error.is_conflict() => Err(error),
            // Another manager (or a previous delivery) already handled it.
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => {
                tracing::warn!(error = %error, "workflow job handling failed");
                Ok(())
            }
        }
    }

    /// A job is waiting for a runner: create a `pending_create` instance in
    /// the best matching pool, unless idle capacity already covers it.
    async fn handle_job_queued(&self, event: &WorkflowJobEvent) -> Result<()> {
        if !self.running() {
            return Err(Error::Conflict("pool manager is not running".to_string()));
        }
        let entity = self.entity();
        let labels = &event.workflow_job.labels;
        if labels.is_empty() {
            return Ok(());
        }

        let pool = match self.store.find_entity_pool_by_tags(entity.id, labels).await {
            Ok(pool) => pool,
            Err(error) if error.is_not_found() => {
                tracing::debug!(?labels, "no pool services the requested labels");
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        self.wait_for_tools().await?;

        let count = self.store.pool_instance_count(pool.id).await?;
        if count >= u64::from(pool.max_runners) {
            tracing::info!(pool_id = %pool.id, "pool at capacity, job will wait for a free runner");
            return Ok(());
        }
        if pool.min_idle_runners > 0 {
            let instances = self.store.list_pool_instances(pool.id).await?;
            let available = instances
                .iter()
                .filter(|instance| {
                    matches!(
                        instance.runner_status,
                        RunnerStatus::Pending | RunnerStatus::Installing | RunnerStatus::Idle
                    ) && !instance.status.is_terminating()
                        && instance.status != InstanceStatus::Error
                })
                .count();
            if available >= pool.min_idle_runners as usize {
                tracing::debug!(pool_id = %pool.id, available, "idle capacity covers the queued job");
                return Ok(());
            }
        }

        let params = CreateInstanceParams::for_pool(&pool);
        let instance = self.store.create_instance(pool.id, params).await?;
        tracing::info!(
            instance = %instance.name,
            pool_id = %pool.id,
            job_id = event.workflow_job.id,
            "queued job accepted, instance scheduled"
        );
        Ok(())
    }

    /// The job finished: its runner is ephemeral and comes down.
    async fn handle_job_completed(&self, event: &WorkflowJobEvent) -> Result<()> {
        let Some(name) = self.runner_name_for_event(event).await? else {
            return Ok(());
        };
        // NotFound propagates and is ignored by the caller; a sibling
        // controller owns that runner.
        let instance = self.store.get_instance_by_name(&name).await?;

        self.locker
            .lock_with_deadline(&instance.name, "workflow-completed", BLOCKING_LOCK_DEADLINE)
            .await?;
        let result = self
            .store
            .update_instance(
                &instance.name,
                UpdateInstanceParams {
                    runner_status: Some(RunnerStatus::Terminated),
                    status: Some(InstanceStatus::PendingDelete),
                    ..Default::default()
                },
            )
            .await;
        self.locker.unlock(&instance.name, false);
        result?;
        tracing::info!(instance = %instance.name, job_id = event.workflow_job.id, "job completed, instance queued for deletion");
        Ok(())
    }

    async fn handle_job_in_progress(&self, event: &WorkflowJobEvent) -> Result<()> {
        let Some(name) = self.runner_name_for_event(event).await? else {
            return Ok(());
        };
        let instance = self.store.get_instance_by_name(&name).await?;

        self.locker
            .lock_with_deadline(&instance.name, "workflow-in-progress", BLOCKING_LOCK_DEADLINE)
            .await?;
        let result = self
            .store
            .update_instance(
                &instance.name,
                UpdateInstanceParams {
                    runner_status: Some(RunnerStatus::Active),
                    ..Default::default()
                },
            )
            .await;
        self.locker.unlock(&instance.name, false);
        result?;
        tracing::debug!(instance = %instance.name, job_id = event.workflow_job.id, "runner picked up a job");
        Ok(())
    }

    /// Deliveries occasionally omit the runner name; fall back to the
    /// forge's workflow-job endpoint before giving up.
    async fn runner_name_for_event(&self, event: &WorkflowJobEvent) -> Result<Option<String>> {
        if let Some(name) = &event.workflow_job.runner_name {
            return Ok(Some(name.clone()));
        }
        let Some(repository) = &event.repository else {
            return Ok(None);
        };
        let job = self
            .forge()
            .workflow_job(
                &repository.owner.login,
                &repository.name,
                event.workflow_job.id,
            )
            .await?;
        Ok(job.runner_name)
    }

    /// Webhook paths that need the tool catalog block until the updater has
    /// populated it, bounded by a timeout.
    async fn wait_for_tools(&self) -> Result<()> {
        if self.tools.get(self.entity().id).is_some() {
            return Ok(());
        }
        let mut ready = self.tools_ready().subscribe();
        tokio::time::timeout(TOOLS_WAIT_TIMEOUT, ready.wait_for(|ready| *ready))
            .await
            .map_err(|_| Error::Timeout("tool catalog".to_string()))?
            .map_err(|e| Error::Other(e.into()))?;
        Ok(())
    }
}
