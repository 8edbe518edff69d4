use serde::Serialize;

use crate::errors::{Error, Result};
use crate::model::{BootstrapInstance, ToolDownload};

#[derive(Debug, Serialize)]
pub struct Data {
    pub write_files: Vec<WriteFile>,
    pub runcmd: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    pub permissions: String,
}

impl Data {
    pub fn from_bootstrap(bootstrap: &BootstrapInstance) -> Result<Self> {
        let tool = matching_tool(bootstrap)?;
        let template = include_str!("../scripts/start.sh");
        let content = template
            .replace("___RUNNER_NAME___", &bootstrap.name)
            .replace("___FILENAME___", &tool.filename)
            .replace("___DOWNLOAD_URL___", &tool.download_url)
            .replace(
                "___DOWNLOAD_TOKEN___",
                tool.temp_download_token.as_deref().unwrap_or_default(),
            )
            .replace(
                "___JIT_CONFIG___",
                bootstrap.jit_config.as_deref().unwrap_or_default(),
            )
            .replace(
                "___REGISTRATION_TOKEN___",
                bootstrap.registration_token.as_deref().unwrap_or_default(),
            )
            .replace("___FORGE_URL___", &bootstrap.forge_url)
            .replace("___LABELS___", &bootstrap.labels.join(","))
            .replace("___RUNNER_GROUP___", &bootstrap.runner_group)
            .replace("___INSTANCE_TOKEN___", &bootstrap.instance_token);

        Ok(Self {
            write_files: vec![WriteFile {
                path: "/start.sh".into(),
                permissions: "0755".into(),
                content,
            }],
            runcmd: vec!["/start.sh".into()],
        })
    }

    pub fn to_user_data(&self) -> serde_yaml::Result<String> {
        Ok(format!("#cloud-config\n{}", serde_yaml::to_string(self)?))
    }
}

/// Render the cloud-init user data for a runner VM.
pub fn user_data(bootstrap: &BootstrapInstance) -> Result<String> {
    Data::from_bootstrap(bootstrap)?
        .to_user_data()
        .map_err(|e| Error::Other(e.into()))
}

fn matching_tool(bootstrap: &BootstrapInstance) -> Result<&ToolDownload> {
    bootstrap
        .tools
        .iter()
        .find(|tool| tool.matches(bootstrap.os_type, bootstrap.os_arch))
        .ok_or_else(|| {
            Error::NotFound(format!(
                "runner tool for {}/{}",
                bootstrap.os_type.as_str(),
                bootstrap.os_arch.as_str()
            ))
        })
}
