mod github;

pub use github::GithubEntityClient;

use async_trait::async_trait;

use crate::errors::Result;
use crate::model::{
    Entity, ForgeHook, ForgeRunner, JitConfig, Pool, RegistrationToken, ToolDownload, WorkflowJob,
};

/// Forge operations the pool manager needs, already scoped to one entity.
/// Repository, organization and enterprise differences are resolved inside
/// the implementation; the core sees a single interface.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    fn entity(&self) -> &Entity;

    async fn list_runners(&self) -> Result<Vec<ForgeRunner>>;

    async fn list_tool_downloads(&self) -> Result<Vec<ToolDownload>>;

    async fn create_registration_token(&self) -> Result<RegistrationToken>;

    /// Generate a one-shot pre-authenticated runner configuration.
    async fn create_jit_config(
        &self,
        runner_name: &str,
        pool: &Pool,
        labels: &[String],
    ) -> Result<JitConfig>;

    async fn remove_runner(&self, runner_id: i64) -> Result<()>;

    async fn workflow_job(&self, owner: &str, repo: &str, job_id: i64) -> Result<WorkflowJob>;

    async fn list_hooks(&self) -> Result<Vec<ForgeHook>>;

    async fn create_hook(&self, url: &str, secret: &str) -> Result<ForgeHook>;

    async fn delete_hook(&self, hook_id: i64) -> Result<()>;

    async fn ping_hook(&self, hook_id: i64) -> Result<()>;
}
