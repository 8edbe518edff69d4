use std::borrow::Cow;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::TimeDelta;
use openstack_sdk::{
    AsyncOpenStack,
    api::{
        self, QueryAsync,
        compute::v2::server::{create_20, delete, list_detailed},
    },
    auth::AuthState,
    config::ConfigFile,
    types::ServiceType,
};
use openstack_types::compute::v2::server::response::{
    create::ServerResponse as CreateServerResponse,
    list_detailed::ServerResponse as ListServerResponse,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cloudinit;
use crate::config::OpenStackConfig;
use crate::errors::{Error, Result};
use crate::model::{BootstrapInstance, ProviderInstance, ProviderInstanceStatus};
use crate::provider::Provider;

/// OpenStack compute provider. Servers are matched to instances by name;
/// the compute API carries no pool marker, so `list_instances` is scoped by
/// the configured name prefix and callers reconcile against their own
/// instance table.
pub struct OpenStackProvider {
    name: String,
    network: String,
    key_name: String,
    server_prefix: String,
    session: Mutex<AsyncOpenStack>,
}

impl OpenStackProvider {
    pub async fn new(config: OpenStackConfig) -> Result<Self> {
        let profile = ConfigFile::new()
            .map_err(provider_err)?
            .get_cloud_config(&config.cloud)
            .map_err(provider_err)?
            .ok_or_else(|| Error::NotFound(format!("openstack profile {}", config.cloud)))?;

        let mut session = AsyncOpenStack::new(&profile).await.map_err(provider_err)?;
        session
            .discover_service_endpoint(&ServiceType::Compute)
            .await
            .map_err(provider_err)?;

        Ok(Self {
            name: config.name,
            network: config.network,
            key_name: config.key_name,
            server_prefix: config.server_prefix,
            session: Mutex::new(session),
        })
    }

    async fn list_servers(&self) -> Result<Vec<ListServerResponse>> {
        let mut session = self.session.lock().await;
        refresh_session(&mut session).await?;

        let ep = list_detailed::Request::builder()
            .build()
            .map_err(provider_err)?;
        let servers: Vec<ListServerResponse> =
            ep.query_async(&*session).await.map_err(provider_err)?;
        Ok(servers
            .into_iter()
            .filter(|s| s.name.starts_with(&self.server_prefix))
            .collect())
    }

    async fn find_server(&self, instance_id: &str) -> Result<Option<ListServerResponse>> {
        let servers = self.list_servers().await?;
        Ok(servers
            .into_iter()
            .find(|s| s.id == instance_id || s.name == instance_id))
    }

    async fn delete_by_server_id(&self, server_id: &str) -> Result<()> {
        let session = self.session.lock().await;
        let ep = delete::Request::builder()
            .id(server_id)
            .build()
            .map_err(provider_err)?;
        api::ignore(ep).query_async(&*session).await.map_err(provider_err)?;
        Ok(())
    }
}

#[async_trait]
impl Provider for OpenStackProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(
        skip(self, bootstrap),
        fields(
            provider = %self.name,
            instance = %bootstrap.name,
            image = %bootstrap.image,
            flavor = %bootstrap.flavor,
        )
    )]
    async fn create_instance(&self, bootstrap: &BootstrapInstance) -> Result<ProviderInstance> {
        let user_data = cloudinit::user_data(bootstrap).map_err(provider_err)?;

        let mut session = self.session.lock().await;
        refresh_session(&mut session).await?;

        let ep = create_20::Request::builder()
            .server(
                create_20::ServerBuilder::default()
                    .name(&bootstrap.name)
                    .image_ref(&bootstrap.image)
                    .flavor_ref(&bootstrap.flavor)
                    .networks(vec![
                        create_20::NetworksBuilder::default()
                            .uuid(&self.network)
                            .build()
                            .map_err(provider_err)?,
                    ])
                    .key_name(&self.key_name)
                    .user_data(Some(Cow::Owned(BASE64_STANDARD.encode(user_data))))
                    .build()
                    .map_err(provider_err)?,
            )
            .build()
            .map_err(provider_err)?;

        let server: CreateServerResponse =
            ep.query_async(&*session).await.map_err(provider_err)?;

        tracing::info!("spawned server");
        Ok(ProviderInstance {
            provider_id: server.id,
            name: bootstrap.name.clone(),
            // The server is still building; it either comes up or the
            // runner never registers and the reaper collects it.
            status: ProviderInstanceStatus::Running,
            os_type: Some(bootstrap.os_type),
            os_arch: Some(bootstrap.os_arch),
            addresses: Vec::new(),
            fault: None,
        })
    }

    #[tracing::instrument(skip(self), fields(provider = %self.name))]
    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        // Resolving first keeps the delete idempotent: a server the cloud
        // already forgot is a success, not an error.
        match self.find_server(instance_id).await? {
            None => Ok(()),
            Some(server) => self.delete_by_server_id(&server.id).await,
        }
    }

    #[tracing::instrument(skip(self), fields(provider = %self.name))]
    async fn get_instance(&self, instance_id: &str) -> Result<ProviderInstance> {
        self.find_server(instance_id)
            .await?
            .map(|server| provider_instance_from_server(&server))
            .ok_or_else(|| Error::NotFound(format!("server {instance_id}")))
    }

    #[tracing::instrument(skip(self), fields(provider = %self.name))]
    async fn list_instances(&self, _pool_id: Uuid) -> Result<Vec<ProviderInstance>> {
        let servers = self.list_servers().await?;
        Ok(servers
            .iter()
            .map(provider_instance_from_server)
            .collect())
    }

    async fn start(&self, instance_id: &str) -> Result<()> {
        Err(Error::Provider(format!(
            "provider {} does not support starting server {instance_id}",
            self.name
        )))
    }

    async fn stop(&self, instance_id: &str, _force: bool) -> Result<()> {
        Err(Error::Provider(format!(
            "provider {} does not support stopping server {instance_id}",
            self.name
        )))
    }

    #[tracing::instrument(skip(self), fields(provider = %self.name))]
    async fn remove_all_instances(&self) -> Result<()> {
        let servers = self.list_servers().await?;
        for server in servers {
            if let Err(error) = self.delete_by_server_id(&server.id).await {
                tracing::error!(server = %server.name, error = %error, "failed to delete server");
            }
        }
        Ok(())
    }
}

fn provider_instance_from_server(server: &ListServerResponse) -> ProviderInstance {
    let status = match server.status.as_deref() {
        Some("ACTIVE") | Some("BUILD") => ProviderInstanceStatus::Running,
        Some("SHUTOFF") | Some("PAUSED") | Some("SUSPENDED") => ProviderInstanceStatus::Stopped,
        Some("ERROR") => ProviderInstanceStatus::Error,
        _ => ProviderInstanceStatus::Unknown,
    };
    ProviderInstance {
        provider_id: server.id.clone(),
        name: server.name.clone(),
        status,
        os_type: None,
        os_arch: None,
        addresses: Vec::new(),
        fault: None,
    }
}

/// Re-authorize the session when its token is about to lapse.
async fn refresh_session(session: &mut AsyncOpenStack) -> Result<()> {
    match session.get_auth_state(Some(TimeDelta::seconds(10))) {
        Some(AuthState::Expired) | Some(AuthState::AboutToExpire) => {
            session
                .authorize(None, false, true)
                .await
                .map_err(provider_err)?;
            session
                .discover_service_endpoint(&ServiceType::Compute)
                .await
                .map_err(provider_err)?;
        }
        _ => {}
    }
    Ok(())
}

fn provider_err<E: std::fmt::Display>(err: E) -> Error {
    Error::Provider(err.to_string())
}
