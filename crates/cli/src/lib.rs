use std::{
    env, io,
    path::{Path, PathBuf},
};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::Serialize;
use thiserror::Error;
use tools::RegistryError;
use types::{AgentConfig, ConfigError, MemoryError, ProviderError};

mod bootstrap;

pub use bootstrap::{GatewayApp, bootstrap_gateway, bootstrap_gateway_with_provider};

const SYSTEM_CONFIG_DIR: &str = "/etc/wayfarer";
const USER_CONFIG_DIR: &str = ".config/wayfarer";
const WORKSPACE_CONFIG_DIR: &str = ".wayfarer";
const AGENT_CONFIG_FILE: &str = "agent.toml";
const TOOLS_CONFIG_FILE: &str = "tools.toml";
const CONFIG_ENV_PREFIX: &str = "WAYFARER__";
const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Clone)]
pub struct ConfigSearchPaths {
    pub system_dir: PathBuf,
    pub user_dir: Option<PathBuf>,
    pub workspace_dir: PathBuf,
}

impl ConfigSearchPaths {
    pub fn discover() -> Result<Self, CliError> {
        let workspace_dir = env::current_dir()?.join(WORKSPACE_CONFIG_DIR);
        let user_dir = env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(USER_CONFIG_DIR));
        Ok(Self {
            system_dir: PathBuf::from(SYSTEM_CONFIG_DIR),
            user_dir,
            workspace_dir,
        })
    }
}

/// Highest-precedence configuration layer, filled from command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<ProviderOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reliability: Option<ReliabilityOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayOverrides>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_call_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectionOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai: Option<OpenAIProviderOverrides>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OpenAIProviderOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReliabilityOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_base_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_max_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GatewayOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_chars: Option<usize>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to resolve configuration path: {0}")]
    Io(#[from] io::Error),
    #[error("failed to load configuration: {0}")]
    ConfigExtract(#[source] Box<figment::Error>),
    #[error(transparent)]
    ConfigValidation(#[from] ConfigError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to bind gateway listener `{address}`: {source}")]
    BindGateway {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("gateway server terminated: {0}")]
    ServeGateway(#[source] io::Error),
    #[error("failed to render configuration: {0}")]
    RenderConfig(#[from] toml::ser::Error),
}

impl From<figment::Error> for CliError {
    fn from(value: figment::Error) -> Self {
        Self::ConfigExtract(Box::new(value))
    }
}

pub fn load_agent_config(
    profile: Option<&str>,
    cli_overrides: CliOverrides,
) -> Result<AgentConfig, CliError> {
    let paths = ConfigSearchPaths::discover()?;
    load_agent_config_with_paths(&paths, profile, cli_overrides)
}

/// Layers, lowest precedence first: built-in defaults, system, user and
/// workspace directories, `WAYFARER__*` environment variables, then CLI
/// overrides.
pub fn load_agent_config_with_paths(
    paths: &ConfigSearchPaths,
    profile: Option<&str>,
    cli_overrides: CliOverrides,
) -> Result<AgentConfig, CliError> {
    let selected_profile = profile
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_PROFILE);

    let mut figment = Figment::from(Serialized::defaults(AgentConfig::default()));
    figment = merge_directory(figment, &paths.system_dir, selected_profile);
    if let Some(user_dir) = &paths.user_dir {
        figment = merge_directory(figment, user_dir, selected_profile);
    }
    figment = merge_directory(figment, &paths.workspace_dir, selected_profile);
    figment = figment.merge(Env::prefixed(CONFIG_ENV_PREFIX).split("__"));
    figment = figment.merge(Serialized::defaults(cli_overrides));

    let config: AgentConfig = figment.select(selected_profile).extract()?;
    config.validate()?;
    Ok(config)
}

fn merge_directory(mut figment: Figment, directory: &Path, selected_profile: &str) -> Figment {
    for file_name in [AGENT_CONFIG_FILE, TOOLS_CONFIG_FILE] {
        let path = directory.join(file_name);
        if path.is_file() {
            tracing::debug!(path = %path.display(), "merging config file");
            figment = if file_uses_profiles(&path, selected_profile) {
                figment.merge(Toml::file(path).nested())
            } else {
                figment.merge(Toml::file(path))
            };
        }
    }
    figment
}

fn file_uses_profiles(path: &Path, selected_profile: &str) -> bool {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(value) = toml::from_str::<toml::Value>(&contents) else {
        return false;
    };
    let Some(table) = value.as_table() else {
        return false;
    };

    table.contains_key("default")
        || table.contains_key("global")
        || table.contains_key(selected_profile)
}
