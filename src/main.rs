use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use github_runner_fleet::config::{Config, ProviderConfig};
use github_runner_fleet::locking::KeyMuxRegistry;
use github_runner_fleet::manager::{ManagerOptions, PoolManager, PoolManagerStatus};
use github_runner_fleet::model::{Credentials, Entity, Pool, WorkflowJobEvent};
use github_runner_fleet::provider::{OpenStackProvider, ProviderRegistry};
use github_runner_fleet::store::{SqliteStore, Store};
use github_runner_fleet::tools::ToolsCache;
use github_runner_fleet::watcher::WatcherHub;

#[derive(Clone)]
struct AppState {
    managers: Arc<Vec<Arc<PoolManager>>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load("config").context("loading configuration")?;
    let _log_guard = init_tracing(config.log_file.as_deref())?;

    let hub = WatcherHub::new();
    let store: Arc<SqliteStore> =
        Arc::new(SqliteStore::connect(&config.database.url, hub.clone()).await?);
    seed_database(store.as_ref(), &config).await?;

    let mut registry = ProviderRegistry::new();
    for provider in &config.providers {
        match provider {
            ProviderConfig::Openstack(openstack) => {
                registry.register(Arc::new(OpenStackProvider::new(openstack.clone()).await?));
            }
        }
    }
    let providers = Arc::new(registry);

    let locker = KeyMuxRegistry::new();
    let tools = ToolsCache::new();
    let options = ManagerOptions {
        jwt_secret: config.jwt_secret.clone(),
        use_jit_config: config.use_jit_config,
    };

    let mut managers = Vec::new();
    for entity in store.list_entities().await? {
        let manager = PoolManager::new(
            entity,
            store.clone() as Arc<dyn Store>,
            providers.clone(),
            locker.clone(),
            tools.clone(),
            hub.clone(),
            options.clone(),
        )
        .await?;
        manager.start();
        if let Some(base_url) = &config.webhook_base_url {
            if let Err(error) = manager.install_webhook(base_url).await {
                tracing::warn!(
                    entity = %manager.entity().slug(),
                    error = %error,
                    "webhook installation failed"
                );
            }
        }
        managers.push(manager);
    }
    tracing::info!(managers = managers.len(), "pool managers started");

    let app_state = AppState {
        managers: Arc::new(managers),
    };
    let app = Router::new()
        .route("/webhook", post(webhook))
        .route("/status", get(status))
        .with_state(app_state.clone());

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("binding {}", config.bind_address))?;
    tracing::info!(address = %config.bind_address, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for manager in app_state.managers.iter() {
        manager.stop();
    }
    for manager in app_state.managers.iter() {
        if let Err(error) = manager.wait().await {
            tracing::warn!(entity = %manager.entity().slug(), error = %error, "manager did not drain cleanly");
        }
    }
    Ok(())
}

fn init_tracing(log_file: Option<&str>) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let registry = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(EnvFilter::from_default_env());

    match log_file {
        Some(path) => {
            let path = Path::new(path);
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .context("log_file must name a file")?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}

/// Bring the database in line with the configuration file: credentials,
/// entities and their pools.
async fn seed_database(store: &dyn Store, config: &Config) -> Result<()> {
    for credentials in &config.credentials {
        store
            .upsert_credentials(Credentials {
                name: credentials.name.clone(),
                token: credentials.token.clone(),
                forge_url: credentials.forge_url.clone(),
            })
            .await?;
    }

    for entity_config in &config.entities {
        let found = store
            .find_entity(
                entity_config.entity_type,
                &entity_config.owner,
                &entity_config.name,
            )
            .await;
        match found {
            Ok(existing) => {
                if existing.credentials_name != entity_config.credentials
                    || existing.webhook_secret != entity_config.webhook_secret
                {
                    let mut updated = existing;
                    updated.credentials_name = entity_config.credentials.clone();
                    updated.webhook_secret = entity_config.webhook_secret.clone();
                    store.update_entity(updated).await?;
                }
            }
            Err(error) if error.is_not_found() => {
                store
                    .create_entity(Entity {
                        id: Uuid::new_v4(),
                        entity_type: entity_config.entity_type,
                        owner: entity_config.owner.clone(),
                        name: entity_config.name.clone(),
                        credentials_name: entity_config.credentials.clone(),
                        webhook_secret: entity_config.webhook_secret.clone(),
                    })
                    .await?;
            }
            Err(error) => return Err(error.into()),
        }
    }

    for pool_config in &config.pools {
        let entity_config = config
            .entities
            .iter()
            .find(|candidate| candidate.slug() == pool_config.entity)
            .expect("validated on load");
        let entity = store
            .find_entity(
                entity_config.entity_type,
                &entity_config.owner,
                &entity_config.name,
            )
            .await?;

        let pools = store.list_entity_pools(entity.id).await?;
        let exists = pools.iter().any(|pool| {
            pool.provider_name == pool_config.provider
                && pool.image == pool_config.image
                && pool.flavor == pool_config.flavor
                && pool.tags == pool_config.tags
        });
        if exists {
            continue;
        }
        store
            .create_pool(Pool {
                id: Uuid::new_v4(),
                entity_id: entity.id,
                provider_name: pool_config.provider.clone(),
                image: pool_config.image.clone(),
                flavor: pool_config.flavor.clone(),
                os_type: pool_config.os_type,
                os_arch: pool_config.os_arch,
                tags: pool_config.tags.clone(),
                max_runners: pool_config.max_runners,
                min_idle_runners: pool_config.min_idle_runners,
                enabled: pool_config.enabled,
                runner_timeout_minutes: pool_config.runner_timeout_minutes,
                runner_group: pool_config.runner_group.clone(),
                priority: pool_config.priority,
                runner_prefix: pool_config.runner_prefix.clone(),
                scale_down_factor: pool_config.scale_down_factor,
            })
            .await?;
    }
    Ok(())
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let event: WorkflowJobEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(error) => {
            tracing::debug!(error = %error, "undecodable webhook payload");
            return (StatusCode::BAD_REQUEST, "invalid payload").into_response();
        }
    };

    let Some(manager) = state
        .managers
        .iter()
        .find(|manager| manager.entity().owns_event(&event))
    else {
        return (StatusCode::NOT_FOUND, "no manager for event owner").into_response();
    };

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok());
    if !signature_valid(&manager.entity().webhook_secret, &body, signature) {
        return (StatusCode::UNAUTHORIZED, "signature mismatch").into_response();
    }

    match manager.handle_workflow_job(event).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error) if error.is_bad_request() => {
            (StatusCode::BAD_REQUEST, error.to_string()).into_response()
        }
        Err(error) if error.is_conflict() => {
            (StatusCode::CONFLICT, error.to_string()).into_response()
        }
        Err(error) => {
            tracing::error!(error = %error, "webhook handling failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn signature_valid(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Serialize)]
struct ManagerReport {
    entity: String,
    #[serde(flatten)]
    status: PoolManagerStatus,
}

async fn status(State(state): State<AppState>) -> Json<Vec<ManagerReport>> {
    Json(
        state
            .managers
            .iter()
            .map(|manager| ManagerReport {
                entity: manager.entity().slug(),
                status: manager.status(),
            })
            .collect(),
    )
}
