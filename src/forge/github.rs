use async_trait::async_trait;
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_FORGE_URL;
use crate::errors::{Error, Result};
use crate::forge::ForgeClient;
use crate::model::{
    Credentials, Entity, EntityType, ForgeHook, ForgeRunner, JitConfig, Pool, RegistrationToken,
    ToolDownload, WorkflowJob,
};

const PAGE_SIZE: u8 = 100;
/// Runner group hosting repository-level runners and unconfigured pools.
const DEFAULT_RUNNER_GROUP_ID: i64 = 1;

#[derive(Serialize)]
struct PageParams {
    per_page: u8,
    page: u32,
}

#[derive(Deserialize)]
struct RunnerDto {
    id: i64,
    name: String,
    status: String,
    busy: bool,
    #[serde(default)]
    labels: Vec<LabelDto>,
}

#[derive(Deserialize)]
struct LabelDto {
    name: String,
}

impl From<RunnerDto> for ForgeRunner {
    fn from(dto: RunnerDto) -> Self {
        ForgeRunner {
            id: dto.id,
            name: dto.name,
            status: dto.status,
            busy: dto.busy,
            labels: dto.labels.into_iter().map(|label| label.name).collect(),
        }
    }
}

#[derive(Deserialize)]
struct RunnersPage {
    total_count: i64,
    runners: Vec<RunnerDto>,
}

#[derive(Deserialize)]
struct RunnerGroupsPage {
    total_count: i64,
    runner_groups: Vec<RunnerGroupDto>,
}

#[derive(Deserialize)]
struct RunnerGroupDto {
    id: i64,
    name: String,
}

#[derive(Serialize)]
struct JitConfigRequest<'a> {
    name: &'a str,
    runner_group_id: i64,
    labels: &'a [String],
}

#[derive(Deserialize)]
struct JitConfigResponse {
    runner: RunnerDto,
    encoded_jit_config: String,
}

#[derive(Serialize)]
struct HookRequest<'a> {
    name: &'a str,
    active: bool,
    events: &'a [&'a str],
    config: HookConfigRequest<'a>,
}

#[derive(Serialize)]
struct HookConfigRequest<'a> {
    url: &'a str,
    content_type: &'a str,
    secret: &'a str,
    insecure_ssl: &'a str,
}

#[derive(Deserialize)]
struct HookDto {
    id: i64,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    config: HookConfigDto,
}

#[derive(Default, Deserialize)]
struct HookConfigDto {
    #[serde(default)]
    url: Option<String>,
}

impl From<HookDto> for ForgeHook {
    fn from(dto: HookDto) -> Self {
        ForgeHook {
            id: dto.id,
            url: dto.config.url.unwrap_or_default(),
            active: dto.active,
        }
    }
}

/// GitHub client scoped to one entity. Repository, organization and
/// enterprise endpoints differ only in their path prefix, so all calls
/// share the generic octocrab transport and one set of wire types.
pub struct GithubEntityClient {
    entity: Entity,
    crab: Octocrab,
}

impl GithubEntityClient {
    pub fn new(entity: Entity, credentials: &Credentials) -> Result<Self> {
        let mut builder =
            octocrab::OctocrabBuilder::default().personal_token(credentials.token.clone());
        if credentials.forge_url.trim_end_matches('/') != DEFAULT_FORGE_URL {
            let api_root = format!("{}/api/v3", credentials.forge_url.trim_end_matches('/'));
            builder = builder
                .base_uri(api_root)
                .map_err(|e| Error::Other(e.into()))?;
        }
        let crab = builder.build().map_err(map_forge_error)?;
        Ok(Self { entity, crab })
    }

    fn api_prefix(&self) -> String {
        match self.entity.entity_type {
            EntityType::Repository => {
                format!("/repos/{}/{}", self.entity.owner, self.entity.name)
            }
            EntityType::Organization => format!("/orgs/{}", self.entity.name),
            EntityType::Enterprise => format!("/enterprises/{}", self.entity.name),
        }
    }

    /// Webhooks exist for repositories and organizations; enterprise hooks
    /// have no REST surface and are configured out of band.
    fn hooks_path(&self) -> Result<String> {
        match self.entity.entity_type {
            EntityType::Repository => Ok(format!(
                "/repos/{}/{}/hooks",
                self.entity.owner, self.entity.name
            )),
            EntityType::Organization => Ok(format!("/orgs/{}/hooks", self.entity.name)),
            EntityType::Enterprise => Err(Error::BadRequest(
                "enterprise webhooks cannot be managed through the API".to_string(),
            )),
        }
    }

    async fn runner_group_id(&self, group: &str) -> Result<i64> {
        if group.is_empty() || self.entity.entity_type == EntityType::Repository {
            return Ok(DEFAULT_RUNNER_GROUP_ID);
        }

        let mut page = 1u32;
        let mut seen = 0i64;
        loop {
            let groups: RunnerGroupsPage = self
                .crab
                .get(
                    format!("{}/actions/runner-groups", self.api_prefix()),
                    Some(&PageParams {
                        per_page: PAGE_SIZE,
                        page,
                    }),
                )
                .await
                .map_err(map_forge_error)?;
            seen += groups.runner_groups.len() as i64;
            if let Some(group) = groups
                .runner_groups
                .into_iter()
                .find(|candidate| candidate.name.eq_ignore_ascii_case(group))
            {
                return Ok(group.id);
            }
            if seen >= groups.total_count || seen == 0 {
                return Err(Error::NotFound(format!("runner group {group}")));
            }
            page += 1;
        }
    }
}

#[async_trait]
impl ForgeClient for GithubEntityClient {
    fn entity(&self) -> &Entity {
        &self.entity
    }

    #[tracing::instrument(skip(self), fields(entity = %self.entity.slug()))]
    async fn list_runners(&self) -> Result<Vec<ForgeRunner>> {
        let mut runners = Vec::new();
        let mut page = 1u32;
        loop {
            let chunk: RunnersPage = self
                .crab
                .get(
                    format!("{}/actions/runners", self.api_prefix()),
                    Some(&PageParams {
                        per_page: PAGE_SIZE,
                        page,
                    }),
                )
                .await
                .map_err(map_forge_error)?;
            if chunk.runners.is_empty() {
                break;
            }
            runners.extend(chunk.runners.into_iter().map(ForgeRunner::from));
            if runners.len() as i64 >= chunk.total_count {
                break;
            }
            page += 1;
        }
        Ok(runners)
    }

    #[tracing::instrument(skip(self), fields(entity = %self.entity.slug()))]
    async fn list_tool_downloads(&self) -> Result<Vec<ToolDownload>> {
        self.crab
            .get(
                format!("{}/actions/runners/downloads", self.api_prefix()),
                None::<&()>,
            )
            .await
            .map_err(map_forge_error)
    }

    #[tracing::instrument(skip(self), fields(entity = %self.entity.slug()))]
    async fn create_registration_token(&self) -> Result<RegistrationToken> {
        self.crab
            .post(
                format!("{}/actions/runners/registration-token", self.api_prefix()),
                None::<&()>,
            )
            .await
            .map_err(map_forge_error)
    }

    #[tracing::instrument(
        skip(self, pool, labels),
        fields(entity = %self.entity.slug(), pool_id = %pool.id)
    )]
    async fn create_jit_config(
        &self,
        runner_name: &str,
        pool: &Pool,
        labels: &[String],
    ) -> Result<JitConfig> {
        let runner_group_id = self.runner_group_id(&pool.runner_group).await?;
        let response: JitConfigResponse = self
            .crab
            .post(
                format!("{}/actions/runners/generate-jitconfig", self.api_prefix()),
                Some(&JitConfigRequest {
                    name: runner_name,
                    runner_group_id,
                    labels,
                }),
            )
            .await
            .map_err(map_forge_error)?;
        tracing::info!(runner_name, "generated jit runner configuration");
        Ok(JitConfig {
            encoded_jit_config: response.encoded_jit_config,
            runner: response.runner.into(),
        })
    }

    #[tracing::instrument(skip(self), fields(entity = %self.entity.slug()))]
    async fn remove_runner(&self, runner_id: i64) -> Result<()> {
        let route = format!("{}/actions/runners/{}", self.api_prefix(), runner_id);
        let response = self
            .crab
            ._delete(route, None::<&()>)
            .await
            .map_err(map_forge_error)?;
        let status = response.status();
        match status.as_u16() {
            200..=299 => Ok(()),
            401 | 403 => Err(Error::Unauthorized(format!(
                "removing runner {runner_id} from {}",
                self.entity.slug()
            ))),
            404 => Err(Error::NotFound(format!("runner {runner_id}"))),
            _ => Err(Error::Other(anyhow::anyhow!(
                "unexpected status {status} removing runner {runner_id}"
            ))),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn workflow_job(&self, owner: &str, repo: &str, job_id: i64) -> Result<WorkflowJob> {
        self.crab
            .get(
                format!("/repos/{owner}/{repo}/actions/jobs/{job_id}"),
                None::<&()>,
            )
            .await
            .map_err(map_forge_error)
    }

    #[tracing::instrument(skip(self), fields(entity = %self.entity.slug()))]
    async fn list_hooks(&self) -> Result<Vec<ForgeHook>> {
        let hooks: Vec<HookDto> = self
            .crab
            .get(self.hooks_path()?, None::<&()>)
            .await
            .map_err(map_forge_error)?;
        Ok(hooks.into_iter().map(ForgeHook::from).collect())
    }

    #[tracing::instrument(skip(self, secret), fields(entity = %self.entity.slug()))]
    async fn create_hook(&self, url: &str, secret: &str) -> Result<ForgeHook> {
        let hook: HookDto = self
            .crab
            .post(
                self.hooks_path()?,
                Some(&HookRequest {
                    name: "web",
                    active: true,
                    events: &["workflow_job"],
                    config: HookConfigRequest {
                        url,
                        content_type: "json",
                        secret,
                        insecure_ssl: "0",
                    },
                }),
            )
            .await
            .map_err(map_forge_error)?;
        tracing::info!(hook_id = hook.id, "installed webhook");
        Ok(hook.into())
    }

    #[tracing::instrument(skip(self), fields(entity = %self.entity.slug()))]
    async fn delete_hook(&self, hook_id: i64) -> Result<()> {
        let route = format!("{}/{}", self.hooks_path()?, hook_id);
        let response = self
            .crab
            ._delete(route, None::<&()>)
            .await
            .map_err(map_forge_error)?;
        let status = response.status();
        match status.as_u16() {
            200..=299 => Ok(()),
            401 | 403 => Err(Error::Unauthorized(format!("deleting hook {hook_id}"))),
            404 => Err(Error::NotFound(format!("hook {hook_id}"))),
            _ => Err(Error::Other(anyhow::anyhow!(
                "unexpected status {status} deleting hook {hook_id}"
            ))),
        }
    }

    #[tracing::instrument(skip(self), fields(entity = %self.entity.slug()))]
    async fn ping_hook(&self, hook_id: i64) -> Result<()> {
        let route = format!("{}/{}/pings", self.hooks_path()?, hook_id);
        let response = self
            .crab
            ._post(route, None::<&()>)
            .await
            .map_err(map_forge_error)?;
        let status = response.status();
        match status.as_u16() {
            200..=299 => Ok(()),
            404 => Err(Error::NotFound(format!("hook {hook_id}"))),
            _ => Err(Error::Other(anyhow::anyhow!(
                "unexpected status {status} pinging hook {hook_id}"
            ))),
        }
    }
}

fn map_forge_error(err: octocrab::Error) -> Error {
    match &err {
        octocrab::Error::GitHub { source, .. } => match source.status_code.as_u16() {
            401 | 403 => Error::Unauthorized(source.message.clone()),
            404 => Error::NotFound(source.message.clone()),
            409 => Error::Conflict(source.message.clone()),
            422 => Error::BadRequest(source.message.clone()),
            _ => Error::Other(err.into()),
        },
        _ => Error::Other(err.into()),
    }
}
