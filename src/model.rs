use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Label stamped on every runner so it can be traced back to its pool.
pub const POOL_ID_LABEL_PREFIX: &str = "runner-pool-id:";
/// Label stamped on every runner so ownership by a controller can be checked.
pub const CONTROLLER_ID_LABEL_PREFIX: &str = "runner-controller-id:";

pub fn pool_id_label(pool_id: Uuid) -> String {
    format!("{POOL_ID_LABEL_PREFIX}{pool_id}")
}

pub fn controller_id_label(controller_id: Uuid) -> String {
    format!("{CONTROLLER_ID_LABEL_PREFIX}{controller_id}")
}

/// Extract the value of a prefixed label from a runner's label set.
pub fn label_value<'a>(labels: &'a [String], prefix: &str) -> Option<&'a str> {
    labels
        .iter()
        .find_map(|label| label.strip_prefix(prefix))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Repository,
    Organization,
    Enterprise,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Repository => "repository",
            EntityType::Organization => "organization",
            EntityType::Enterprise => "enterprise",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "repository" => EntityType::Repository,
            "organization" => EntityType::Organization,
            _ => EntityType::Enterprise,
        }
    }
}

/// Credentials used to talk to the forge, referenced by name from entities.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub name: String,
    pub token: String,
    pub forge_url: String,
}

/// A forge scope (repository, organization or enterprise) that owns runners.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub entity_type: EntityType,
    /// Owner login for repositories; empty for organizations and enterprises.
    pub owner: String,
    pub name: String,
    pub credentials_name: String,
    pub webhook_secret: String,
}

impl Entity {
    /// `owner/name` for repositories, the plain name otherwise.
    pub fn slug(&self) -> String {
        match self.entity_type {
            EntityType::Repository => format!("{}/{}", self.owner, self.name),
            _ => self.name.clone(),
        }
    }

    /// Whether a workflow-job event belongs to this entity. Owners are
    /// compared with an ASCII case fold, matching forge semantics.
    pub fn owns_event(&self, event: &WorkflowJobEvent) -> bool {
        match self.entity_type {
            EntityType::Repository => event
                .repository
                .as_ref()
                .is_some_and(|repo| repo.full_name.eq_ignore_ascii_case(&self.slug())),
            EntityType::Organization => event
                .organization
                .as_ref()
                .is_some_and(|org| org.login.eq_ignore_ascii_case(&self.name)),
            EntityType::Enterprise => event
                .enterprise
                .as_ref()
                .is_some_and(|ent| ent.slug.eq_ignore_ascii_case(&self.name)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsType {
    Linux,
    Windows,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::Linux => "linux",
            OsType::Windows => "windows",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "windows" => OsType::Windows,
            _ => OsType::Linux,
        }
    }

    /// Name the forge uses for this OS in its tool download catalog.
    pub fn tool_os(&self) -> &'static str {
        match self {
            OsType::Linux => "linux",
            OsType::Windows => "win",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsArch {
    Amd64,
    Arm64,
}

impl OsArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsArch::Amd64 => "amd64",
            OsArch::Arm64 => "arm64",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "arm64" => OsArch::Arm64,
            _ => OsArch::Amd64,
        }
    }

    /// Name the forge uses for this architecture in its tool catalog.
    pub fn tool_arch(&self) -> &'static str {
        match self {
            OsArch::Amd64 => "x64",
            OsArch::Arm64 => "arm64",
        }
    }
}

/// A template that says "keep N runners of this shape available".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pool {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub provider_name: String,
    pub image: String,
    pub flavor: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub tags: Vec<String>,
    pub max_runners: u32,
    pub min_idle_runners: u32,
    pub enabled: bool,
    pub runner_timeout_minutes: u32,
    pub runner_group: String,
    pub priority: u32,
    pub runner_prefix: String,
    pub scale_down_factor: f64,
}

impl Pool {
    /// Whether this pool can service a job that requires all of `labels`.
    pub fn matches_labels(&self, labels: &[String]) -> bool {
        labels.iter().all(|wanted| {
            self.tags
                .iter()
                .any(|tag| tag.eq_ignore_ascii_case(wanted))
        })
    }

    pub fn new_runner_name(&self) -> String {
        let suffix: String = rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .take(8)
            .map(char::from)
            .collect();
        format!("{}-{}", self.runner_prefix, suffix)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    PendingCreate,
    Creating,
    Running,
    PendingDelete,
    Deleting,
    Error,
    Stopped,
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::PendingCreate => "pending_create",
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::PendingDelete => "pending_delete",
            InstanceStatus::Deleting => "deleting",
            InstanceStatus::Error => "error",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "pending_create" => InstanceStatus::PendingCreate,
            "creating" => InstanceStatus::Creating,
            "running" => InstanceStatus::Running,
            "pending_delete" => InstanceStatus::PendingDelete,
            "deleting" => InstanceStatus::Deleting,
            "error" => InstanceStatus::Error,
            "stopped" => InstanceStatus::Stopped,
            _ => InstanceStatus::Unknown,
        }
    }

    /// Statuses on the way out of existence; instances in these states no
    /// longer count toward pool capacity.
    pub fn is_terminating(&self) -> bool {
        matches!(self, InstanceStatus::PendingDelete | InstanceStatus::Deleting)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Pending,
    Installing,
    Idle,
    Active,
    Terminated,
    Failed,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Pending => "pending",
            RunnerStatus::Installing => "installing",
            RunnerStatus::Idle => "idle",
            RunnerStatus::Active => "active",
            RunnerStatus::Terminated => "terminated",
            RunnerStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "installing" => RunnerStatus::Installing,
            "idle" => RunnerStatus::Idle,
            "active" => RunnerStatus::Active,
            "terminated" => RunnerStatus::Terminated,
            "failed" => RunnerStatus::Failed,
            _ => RunnerStatus::Pending,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    Public,
    Private,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    pub kind: AddressKind,
}

/// One concrete, ephemeral runner VM tracked in the local database.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub name: String,
    pub pool_id: Uuid,
    pub provider_id: Option<String>,
    pub status: InstanceStatus,
    pub runner_status: RunnerStatus,
    pub os_type: OsType,
    pub os_arch: OsArch,
    /// Forge-side runner id; 0 until the runner registers.
    pub agent_id: i64,
    pub create_attempt: u32,
    pub addresses: Vec<Address>,
    pub provider_fault: String,
    pub token_fetched: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct CreateInstanceParams {
    pub name: String,
    pub status: InstanceStatus,
    pub runner_status: RunnerStatus,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub create_attempt: u32,
}

impl CreateInstanceParams {
    pub fn for_pool(pool: &Pool) -> Self {
        Self {
            name: pool.new_runner_name(),
            status: InstanceStatus::PendingCreate,
            runner_status: RunnerStatus::Pending,
            os_type: pool.os_type,
            os_arch: pool.os_arch,
            create_attempt: 1,
        }
    }
}

/// Partial instance update; only `Some` fields are written. `updated_at` is
/// bumped on every call.
#[derive(Clone, Debug, Default)]
pub struct UpdateInstanceParams {
    pub provider_id: Option<String>,
    pub status: Option<InstanceStatus>,
    pub runner_status: Option<RunnerStatus>,
    pub agent_id: Option<i64>,
    pub addresses: Option<Vec<Address>>,
    pub provider_fault: Option<String>,
    pub create_attempt: Option<u32>,
    pub token_fetched: Option<bool>,
    pub os_type: Option<OsType>,
    pub os_arch: Option<OsArch>,
}

impl UpdateInstanceParams {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderInstanceStatus {
    Running,
    Stopped,
    Error,
    Unknown,
}

impl ProviderInstanceStatus {
    pub fn instance_status(&self) -> InstanceStatus {
        match self {
            ProviderInstanceStatus::Running => InstanceStatus::Running,
            ProviderInstanceStatus::Stopped => InstanceStatus::Stopped,
            ProviderInstanceStatus::Error => InstanceStatus::Error,
            ProviderInstanceStatus::Unknown => InstanceStatus::Unknown,
        }
    }
}

/// The provider's view of a VM backing an instance.
#[derive(Clone, Debug)]
pub struct ProviderInstance {
    pub provider_id: String,
    pub name: String,
    pub status: ProviderInstanceStatus,
    pub os_type: Option<OsType>,
    pub os_arch: Option<OsArch>,
    pub addresses: Vec<Address>,
    pub fault: Option<String>,
}

/// Read-only projection of a runner registration on the forge side.
#[derive(Clone, Debug)]
pub struct ForgeRunner {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub busy: bool,
    pub labels: Vec<String>,
}

impl ForgeRunner {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }

    /// Whether this runner is stamped with the given controller id.
    pub fn managed_by(&self, controller_id: Uuid) -> bool {
        label_value(&self.labels, CONTROLLER_ID_LABEL_PREFIX)
            .is_some_and(|value| value == controller_id.to_string())
    }

    pub fn pool_id(&self) -> Option<Uuid> {
        label_value(&self.labels, POOL_ID_LABEL_PREFIX)
            .and_then(|value| Uuid::parse_str(value).ok())
    }
}

/// A webhook registration on the forge side.
#[derive(Clone, Debug)]
pub struct ForgeHook {
    pub id: i64,
    pub url: String,
    pub active: bool,
}

/// One entry of the runner-tool download catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDownload {
    pub os: String,
    pub architecture: String,
    pub filename: String,
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_download_token: Option<String>,
}

impl ToolDownload {
    pub fn matches(&self, os_type: OsType, os_arch: OsArch) -> bool {
        self.os == os_type.tool_os() && self.architecture == os_arch.tool_arch()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: Option<String>,
}

#[derive(Clone, Debug)]
pub struct JitConfig {
    pub encoded_jit_config: String,
    pub runner: ForgeRunner,
}

/// Everything a provider needs to boot a runner VM.
#[derive(Clone, Debug)]
pub struct BootstrapInstance {
    pub name: String,
    pub pool_id: Uuid,
    pub image: String,
    pub flavor: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub labels: Vec<String>,
    pub tools: Vec<ToolDownload>,
    /// One-shot pre-authenticated runner configuration, when the forge
    /// issued one; mutually exclusive with `registration_token`.
    pub jit_config: Option<String>,
    pub registration_token: Option<String>,
    /// JWT handed to the VM for metadata callbacks.
    pub instance_token: String,
    /// URL the runner registers against when using a registration token.
    pub forge_url: String,
    pub runner_group: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Queued,
    InProgress,
    Completed,
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WorkflowJob {
    pub id: i64,
    #[serde(default)]
    pub runner_name: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EventRepository {
    pub name: String,
    pub full_name: String,
    pub owner: EventAccount,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EventAccount {
    pub login: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EventEnterprise {
    pub slug: String,
}

/// A `workflow_job` webhook delivery, reduced to the fields the pool
/// manager dispatches on.
#[derive(Clone, Debug, Deserialize)]
pub struct WorkflowJobEvent {
    pub action: JobAction,
    pub workflow_job: WorkflowJob,
    #[serde(default)]
    pub repository: Option<EventRepository>,
    #[serde(default)]
    pub organization: Option<EventAccount>,
    #[serde(default)]
    pub enterprise: Option<EventEnterprise>,
}

/// Identity of this controller process; stamped onto every runner label.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub controller_id: Uuid,
}
