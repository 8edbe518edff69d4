mod common;

use common::*;

use github_runner_fleet::model::{
    ForgeRunner, InstanceStatus, JobAction, RunnerStatus, UpdateInstanceParams,
    controller_id_label, pool_id_label,
};
use github_runner_fleet::store::Store;

#[tokio::test]
async fn queued_webhook_creates_and_provisions_an_instance() {
    let h = harness(PoolSpec::default()).await;

    let event = workflow_event(JobAction::Queued, "acme", &["self-hosted", "linux"]);
    h.manager.handle_workflow_job(event).await.unwrap();

    let instances = h.store.list_pool_instances(h.pool.id).await.unwrap();
    assert_eq!(instances.len(), 1);
    let name = instances[0].name.clone();
    assert_eq!(instances[0].status, InstanceStatus::PendingCreate);
    assert_eq!(instances[0].runner_status, RunnerStatus::Pending);
    assert!(name.starts_with("gha-"));

    h.manager.add_pending_instances().await.unwrap();
    let instance = wait_for_instance(&h.store, &name, "instance provisioned", |instance| {
        instance.status == InstanceStatus::Running && instance.provider_id.is_some()
    })
    .await;
    assert_eq!(instance.runner_status, RunnerStatus::Installing);
    assert_ne!(instance.agent_id, 0);
    assert!(instance.token_fetched);

    let bootstraps = h.provider.created_bootstraps();
    assert_eq!(bootstraps.len(), 1);
    assert_eq!(bootstraps[0].pool_id, h.pool.id);
    assert!(bootstraps[0].jit_config.is_some());
    assert!(bootstraps[0].labels.contains(&pool_id_label(h.pool.id)));
    let controller = h.store.controller_info().await.unwrap().controller_id;
    assert!(bootstraps[0].labels.contains(&controller_id_label(controller)));
}

#[tokio::test]
async fn webhook_rejects_events_for_other_owners() {
    let h = harness(PoolSpec::default()).await;
    let event = workflow_event(JobAction::Queued, "umbrella", &["self-hosted", "linux"]);
    let error = h.manager.handle_workflow_job(event).await.unwrap_err();
    assert!(error.is_bad_request());
    assert!(h.store.list_pool_instances(h.pool.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn queued_webhook_respects_pool_capacity() {
    let h = harness(PoolSpec {
        max_runners: 2,
        ..PoolSpec::default()
    })
    .await;

    for _ in 0..2 {
        let params = github_runner_fleet::model::CreateInstanceParams::for_pool(&h.pool);
        h.store.create_instance(h.pool.id, params).await.unwrap();
    }

    let event = workflow_event(JobAction::Queued, "acme", &["self-hosted", "linux"]);
    h.manager.handle_workflow_job(event).await.unwrap();
    assert_eq!(h.store.list_pool_instances(h.pool.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn queued_webhook_skips_when_idle_capacity_covers_it() {
    let h = harness(PoolSpec {
        min_idle_runners: 1,
        ..PoolSpec::default()
    })
    .await;

    let params = github_runner_fleet::model::CreateInstanceParams::for_pool(&h.pool);
    let idle = h.store.create_instance(h.pool.id, params).await.unwrap();
    h.store
        .update_instance(
            &idle.name,
            UpdateInstanceParams {
                status: Some(InstanceStatus::Running),
                runner_status: Some(RunnerStatus::Idle),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let event = workflow_event(JobAction::Queued, "acme", &["self-hosted", "linux"]);
    h.manager.handle_workflow_job(event).await.unwrap();
    assert_eq!(h.store.list_pool_instances(h.pool.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn completed_webhook_terminates_and_deletes_the_instance() {
    let h = harness(PoolSpec::default()).await;

    let params = github_runner_fleet::model::CreateInstanceParams::for_pool(&h.pool);
    let instance = h.store.create_instance(h.pool.id, params).await.unwrap();
    h.store
        .update_instance(
            &instance.name,
            UpdateInstanceParams {
                status: Some(InstanceStatus::Running),
                runner_status: Some(RunnerStatus::Active),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let event = workflow_event_for_runner(JobAction::Completed, "acme", &instance.name);
    h.manager.handle_workflow_job(event).await.unwrap();

    let updated = h.store.get_instance_by_name(&instance.name).await.unwrap();
    assert_eq!(updated.status, InstanceStatus::PendingDelete);
    assert_eq!(updated.runner_status, RunnerStatus::Terminated);

    h.manager.delete_pending_instances().await.unwrap();
    wait_for_instance_gone(&h.store, &instance.name).await;
    assert!(h.provider.delete_calls.load(std::sync::atomic::Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn completed_webhook_for_unknown_runner_is_ignored() {
    let h = harness(PoolSpec::default()).await;
    let event = workflow_event_for_runner(JobAction::Completed, "acme", "gha-elsewhere");
    h.manager.handle_workflow_job(event).await.unwrap();
}

#[tokio::test]
async fn in_progress_webhook_marks_the_runner_active() {
    let h = harness(PoolSpec::default()).await;

    let params = github_runner_fleet::model::CreateInstanceParams::for_pool(&h.pool);
    let instance = h.store.create_instance(h.pool.id, params).await.unwrap();
    h.store
        .update_instance(
            &instance.name,
            UpdateInstanceParams {
                status: Some(InstanceStatus::Running),
                runner_status: Some(RunnerStatus::Idle),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let event = workflow_event_for_runner(JobAction::InProgress, "acme", &instance.name);
    h.manager.handle_workflow_job(event).await.unwrap();

    let updated = h.store.get_instance_by_name(&instance.name).await.unwrap();
    assert_eq!(updated.runner_status, RunnerStatus::Active);
    assert_eq!(updated.status, InstanceStatus::Running);
}

#[tokio::test]
async fn min_idle_reconciler_tops_up_and_is_idempotent() {
    let h = harness(PoolSpec {
        max_runners: 3,
        min_idle_runners: 2,
        ..PoolSpec::default()
    })
    .await;

    h.manager.ensure_min_idle_runners().await.unwrap();
    let pending = h.store.list_pool_instances(h.pool.id).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|i| i.status == InstanceStatus::PendingCreate));

    // A second pass with no external changes creates nothing new.
    h.manager.ensure_min_idle_runners().await.unwrap();
    assert_eq!(h.store.list_pool_instances(h.pool.id).await.unwrap().len(), 2);

    h.manager.add_pending_instances().await.unwrap();
    wait_for_pool_instances(&h.store, h.pool.id, "both instances running", |instances| {
        instances.len() == 2
            && instances.iter().all(|i| i.status == InstanceStatus::Running)
    })
    .await;

    // Still satisfied once they are up; no third instance appears.
    h.manager.ensure_min_idle_runners().await.unwrap();
    h.manager.add_pending_instances().await.unwrap();
    assert_eq!(h.store.list_pool_instances(h.pool.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn min_idle_is_clamped_by_max_runners() {
    let h = harness(PoolSpec {
        max_runners: 2,
        min_idle_runners: 5,
        ..PoolSpec::default()
    })
    .await;

    h.manager.ensure_min_idle_runners().await.unwrap();
    assert_eq!(h.store.list_pool_instances(h.pool.id).await.unwrap().len(), 2);

    h.manager.ensure_min_idle_runners().await.unwrap();
    assert_eq!(h.store.list_pool_instances(h.pool.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn scale_down_removes_aged_surplus_oldest_first() {
    let h = harness(PoolSpec {
        max_runners: 5,
        min_idle_runners: 1,
        ..PoolSpec::default()
    })
    .await;

    let mut names = Vec::new();
    for _ in 0..3 {
        let params = github_runner_fleet::model::CreateInstanceParams::for_pool(&h.pool);
        let instance = h.store.create_instance(h.pool.id, params).await.unwrap();
        h.store
            .update_instance(
                &instance.name,
                UpdateInstanceParams {
                    status: Some(InstanceStatus::Running),
                    runner_status: Some(RunnerStatus::Idle),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        names.push(instance.name);
    }
    // One fresh idle runner, one aged, one very aged.
    backdate_instance(&h.db_url, &names[1], 8).await;
    backdate_instance(&h.db_url, &names[2], 10).await;

    h.manager.scale_down().await.unwrap();

    // surplus = 3 idle - 1 min_idle = 2; ceil(2 * 0.5) = 1 removal, the
    // oldest of the aged pair.
    let oldest = h.store.get_instance_by_name(&names[2]).await.unwrap();
    assert_eq!(oldest.status, InstanceStatus::PendingDelete);
    let aged = h.store.get_instance_by_name(&names[1]).await.unwrap();
    assert_eq!(aged.status, InstanceStatus::Running);
    let fresh = h.store.get_instance_by_name(&names[0]).await.unwrap();
    assert_eq!(fresh.status, InstanceStatus::Running);
}

#[tokio::test]
async fn retry_budget_exhaustion_leaves_the_instance_alone() {
    let h = harness(PoolSpec::default()).await;

    let params = github_runner_fleet::model::CreateInstanceParams::for_pool(&h.pool);
    let instance = h.store.create_instance(h.pool.id, params).await.unwrap();
    h.store
        .update_instance(
            &instance.name,
            UpdateInstanceParams {
                status: Some(InstanceStatus::Error),
                provider_fault: Some("boot failure".to_string()),
                create_attempt: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    for _ in 0..10 {
        h.manager.retry_failed_instances().await.unwrap();
    }

    let unchanged = h.store.get_instance_by_name(&instance.name).await.unwrap();
    assert_eq!(unchanged.status, InstanceStatus::Error);
    assert_eq!(unchanged.create_attempt, 5);
    assert_eq!(h.provider.delete_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn retry_failed_requeues_within_the_attempt_budget() {
    let h = harness(PoolSpec::default()).await;

    let params = github_runner_fleet::model::CreateInstanceParams::for_pool(&h.pool);
    let instance = h.store.create_instance(h.pool.id, params).await.unwrap();
    h.store
        .update_instance(
            &instance.name,
            UpdateInstanceParams {
                status: Some(InstanceStatus::Error),
                provider_fault: Some("boot failure".to_string()),
                provider_id: Some("srv-stale".to_string()),
                token_fetched: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    h.manager.retry_failed_instances().await.unwrap();

    let requeued = h.store.get_instance_by_name(&instance.name).await.unwrap();
    assert_eq!(requeued.status, InstanceStatus::PendingCreate);
    assert_eq!(requeued.runner_status, RunnerStatus::Pending);
    assert_eq!(requeued.create_attempt, 2);
    assert!(!requeued.token_fetched);
    assert!(requeued.provider_fault.is_empty());
    assert_eq!(h.provider.delete_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_provisioning_records_the_fault_and_clears_the_forge_runner() {
    let h = harness(PoolSpec::default()).await;
    h.provider
        .fail_create
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let event = workflow_event(JobAction::Queued, "acme", &["self-hosted", "linux"]);
    h.manager.handle_workflow_job(event).await.unwrap();
    let name = h.store.list_pool_instances(h.pool.id).await.unwrap()[0]
        .name
        .clone();

    h.manager.add_pending_instances().await.unwrap();
    let failed = wait_for_instance(&h.store, &name, "provisioning failure recorded", |i| {
        i.status == InstanceStatus::Error
    })
    .await;
    assert!(failed.provider_fault.contains("simulated boot failure"));
    // The JIT registration was rolled back on the forge side.
    wait_until("forge runner rollback", || !h.forge.removed_ids().is_empty()).await;
}

#[tokio::test]
async fn failed_deletion_requeues_and_backs_off() {
    let h = harness(PoolSpec::default()).await;
    h.provider
        .fail_delete
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let params = github_runner_fleet::model::CreateInstanceParams::for_pool(&h.pool);
    let instance = h.store.create_instance(h.pool.id, params).await.unwrap();
    h.store
        .update_instance(
            &instance.name,
            UpdateInstanceParams::status(InstanceStatus::PendingDelete),
        )
        .await
        .unwrap();

    h.manager.delete_pending_instances().await.unwrap();
    wait_for_instance(&h.store, &instance.name, "deletion requeued", |i| {
        i.status == InstanceStatus::PendingDelete
    })
    .await;
    assert_eq!(h.provider.delete_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    // The fresh failure backs the instance off; the next tick skips it.
    h.manager.delete_pending_instances().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(h.provider.delete_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn runner_cleanup_reaps_timed_out_instances() {
    let h = harness(PoolSpec::default()).await;

    let params = github_runner_fleet::model::CreateInstanceParams::for_pool(&h.pool);
    let instance = h.store.create_instance(h.pool.id, params).await.unwrap();
    h.store
        .update_instance(
            &instance.name,
            UpdateInstanceParams {
                status: Some(InstanceStatus::Running),
                runner_status: Some(RunnerStatus::Installing),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    // Way past the pool's 20 minute runner timeout, never seen by the forge.
    backdate_instance(&h.db_url, &instance.name, 30).await;

    h.manager.runner_cleanup().await.unwrap();

    let reaped = h.store.get_instance_by_name(&instance.name).await.unwrap();
    assert_eq!(reaped.status, InstanceStatus::PendingDelete);
}

#[tokio::test]
async fn runner_cleanup_marks_forge_orphaned_instances_for_deletion() {
    let h = harness(PoolSpec::default()).await;

    let params = github_runner_fleet::model::CreateInstanceParams::for_pool(&h.pool);
    let instance = h.store.create_instance(h.pool.id, params).await.unwrap();
    h.store
        .update_instance(
            &instance.name,
            UpdateInstanceParams {
                status: Some(InstanceStatus::Running),
                runner_status: Some(RunnerStatus::Idle),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    // Old enough to be an orphan, but younger than the reap timeout.
    backdate_instance(&h.db_url, &instance.name, 10).await;

    h.manager.runner_cleanup().await.unwrap();

    let orphan = h.store.get_instance_by_name(&instance.name).await.unwrap();
    assert_eq!(orphan.status, InstanceStatus::PendingDelete);
}

#[tokio::test]
async fn runner_cleanup_only_removes_runners_managed_by_this_controller() {
    let h = harness(PoolSpec::default()).await;
    let controller = h.store.controller_info().await.unwrap().controller_id;

    h.forge.add_runner(ForgeRunner {
        id: 7,
        name: "gha-ours".to_string(),
        status: "offline".to_string(),
        busy: false,
        labels: vec![
            controller_id_label(controller),
            pool_id_label(h.pool.id),
        ],
    });
    h.forge.add_runner(ForgeRunner {
        id: 8,
        name: "gha-theirs".to_string(),
        status: "offline".to_string(),
        busy: false,
        labels: vec![controller_id_label(uuid::Uuid::new_v4())],
    });

    h.manager.runner_cleanup().await.unwrap();

    assert_eq!(h.forge.removed_ids(), vec![7]);
}

#[tokio::test]
async fn unauthorized_trips_the_manager_and_credentials_update_recovers_it() {
    let h = harness(PoolSpec::default()).await;
    h.forge.set_unauthorized(true);
    h.manager.start();

    wait_until("manager suspended", || !h.manager.status().is_running).await;
    assert!(h.manager.status().failure_reason.is_some());

    h.forge.set_unauthorized(false);
    h.store
        .update_credentials(github_runner_fleet::model::Credentials {
            name: "default".to_string(),
            token: "rotated-token".to_string(),
            forge_url: "https://github.com".to_string(),
        })
        .await
        .unwrap();

    wait_until("manager recovered", || h.manager.status().is_running).await;
    assert!(h.manager.status().failure_reason.is_none());

    h.manager.stop();
    h.manager.wait().await.unwrap();
}

#[tokio::test]
async fn force_delete_is_refused_while_the_manager_is_suspended() {
    let h = harness(PoolSpec::default()).await;

    // An unauthorized forge lookup during webhook handling suspends the
    // manager without propagating the error.
    h.forge.set_unauthorized(true);
    let mut event = workflow_event(JobAction::Completed, "acme", &[]);
    event.repository = Some(github_runner_fleet::model::EventRepository {
        name: "widgets".to_string(),
        full_name: "acme/widgets".to_string(),
        owner: github_runner_fleet::model::EventAccount {
            login: "acme".to_string(),
        },
    });
    h.manager.handle_workflow_job(event).await.unwrap();
    assert!(!h.manager.status().is_running);

    let error = h.manager.force_delete_runner("gha-whatever").await.unwrap_err();
    assert!(error.is_conflict());
}

#[tokio::test]
async fn webhook_installation_is_idempotent() {
    let h = harness(PoolSpec::default()).await;

    let first = h
        .manager
        .install_webhook("https://fleet.example.com")
        .await
        .unwrap();
    assert_eq!(first.url, "https://fleet.example.com/webhook");

    let second = h
        .manager
        .install_webhook("https://fleet.example.com/")
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(h.forge.hooks.lock().unwrap().len(), 1);

    h.manager
        .uninstall_webhook("https://fleet.example.com")
        .await
        .unwrap();
    assert!(h.forge.hooks.lock().unwrap().is_empty());
    // Uninstalling again is a no-op.
    h.manager
        .uninstall_webhook("https://fleet.example.com")
        .await
        .unwrap();
}

#[tokio::test]
async fn entity_deletion_shuts_the_manager_down() {
    let h = harness(PoolSpec::default()).await;
    h.manager.start();
    assert!(h.manager.status().is_running);

    h.store.delete_entity(h.entity.id).await.unwrap();

    // The watcher consumer observes the delete and the loops drain.
    h.manager.wait().await.unwrap();
}
