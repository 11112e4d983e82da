use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level Agora configuration, loaded from `config.toml`.
///
/// Resolution order: `AGORA_CONFIG_DIR` env → `AGORA_WORKSPACE` env → `~/.agora/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,
    /// API key for the completion provider. Overridden by `AGORA_API_KEY`, then `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    /// Base URL override for the provider API (any OpenAI-compatible endpoint).
    pub api_url: Option<String>,
    /// Provider ID. Default: `"openai"`.
    pub default_provider: Option<String>,
    /// Model used by agents that do not pin their own. Default: `"gpt-4o-mini"`.
    pub default_model: Option<String>,
    /// Default sampling temperature (0.0–2.0). Default: `0.7`.
    pub default_temperature: f64,

    /// Gateway server configuration (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Session memory configuration (`[memory]`).
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Agent routing and registry configuration (`[agents]`).
    #[serde(default)]
    pub agents: AgentsConfig,
}

// ── Gateway ──────────────────────────────────────────────────────

/// Gateway server configuration (`[gateway]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Gateway port (default: 8000)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Browser origins allowed by CORS. Empty disables the CORS layer.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body size in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Timeout applied to HTTP requests, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".into(),
        "http://frontend:3000".into(),
    ]
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            cors_origins: default_cors_origins(),
            max_body_bytes: default_max_body_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ── Memory ───────────────────────────────────────────────────────

/// Session memory configuration (`[memory]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MemoryConfig {
    /// "sqlite" | "memory" (`memory` keeps history only for the process lifetime)
    #[serde(default = "default_memory_backend")]
    pub backend: String,
    /// Most recent messages handed to an agent as context. Default: `5`.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// When set, sessions holding more than twice this many messages are
    /// trimmed to the newest `prune_keep_recent` after every turn.
    #[serde(default)]
    pub prune_keep_recent: Option<usize>,
}

fn default_memory_backend() -> String {
    "sqlite".into()
}

fn default_context_window() -> usize {
    5
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            context_window: default_context_window(),
            prune_keep_recent: None,
        }
    }
}

// ── Agents ───────────────────────────────────────────────────────

/// Agent routing and registry configuration (`[agents]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentsConfig {
    /// Agent used when neither an explicit choice, a slash command nor a keyword matches.
    #[serde(default = "default_agent_name")]
    pub default_agent: String,
    /// Prefix that marks a slash command (`/shopper find me a desk`).
    #[serde(default = "default_command_prefix")]
    pub command_prefix: char,
    /// Cache constructed agent handles. When false every request rebuilds the
    /// handle, so prompt files edited on disk apply to the next request.
    #[serde(default)]
    pub cache_handles: bool,
    /// Deadline for a single agent invocation, including the whole stream.
    #[serde(default)]
    pub handler_timeout_secs: Option<u64>,
    /// Per-agent overrides keyed by agent name (`[agents.definitions.shopper]`).
    #[serde(default)]
    pub definitions: BTreeMap<String, AgentDefinitionConfig>,
}

fn default_agent_name() -> String {
    "paper_writer".into()
}

fn default_command_prefix() -> char {
    '/'
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_agent: default_agent_name(),
            command_prefix: default_command_prefix(),
            cache_handles: false,
            handler_timeout_secs: None,
            definitions: BTreeMap::new(),
        }
    }
}

/// Overrides for one agent. Unset fields keep the built-in value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AgentDefinitionConfig {
    pub description: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u32>,
    /// Replaces the built-in routing keywords.
    pub keywords: Option<Vec<String>>,
    /// System prompt file. Relative paths resolve under the workspace directory.
    pub prompt_file: Option<String>,
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let agora_dir = home.join(".agora");

        Self {
            workspace_dir: agora_dir.join("workspace"),
            config_path: agora_dir.join("config.toml"),
            api_key: None,
            api_url: None,
            default_provider: Some("openai".to_string()),
            default_model: Some("gpt-4o-mini".to_string()),
            default_temperature: 0.7,
            gateway: GatewayConfig::default(),
            memory: MemoryConfig::default(),
            agents: AgentsConfig::default(),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".agora"))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ConfigResolutionSource {
    EnvConfigDir,
    EnvWorkspace,
    DefaultConfigDir,
}

impl ConfigResolutionSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::EnvConfigDir => "AGORA_CONFIG_DIR",
            Self::EnvWorkspace => "AGORA_WORKSPACE",
            Self::DefaultConfigDir => "default",
        }
    }
}

fn resolve_runtime_config_dirs() -> Result<(PathBuf, PathBuf, ConfigResolutionSource)> {
    if let Ok(custom_config_dir) = std::env::var("AGORA_CONFIG_DIR") {
        let custom_config_dir = custom_config_dir.trim();
        if !custom_config_dir.is_empty() {
            let agora_dir = PathBuf::from(custom_config_dir);
            return Ok((
                agora_dir.clone(),
                agora_dir.join("workspace"),
                ConfigResolutionSource::EnvConfigDir,
            ));
        }
    }

    if let Ok(custom_workspace) = std::env::var("AGORA_WORKSPACE") {
        let custom_workspace = custom_workspace.trim();
        if !custom_workspace.is_empty() {
            let workspace_dir = PathBuf::from(custom_workspace);
            let agora_dir = workspace_dir
                .parent()
                .map_or_else(|| workspace_dir.clone(), Path::to_path_buf);
            return Ok((agora_dir, workspace_dir, ConfigResolutionSource::EnvWorkspace));
        }
    }

    let agora_dir = default_config_dir()?;
    Ok((
        agora_dir.clone(),
        agora_dir.join("workspace"),
        ConfigResolutionSource::DefaultConfigDir,
    ))
}

const SUPPORTED_MEMORY_BACKENDS: &[&str] = &["sqlite", "memory"];

impl Config {
    pub async fn load_or_init() -> Result<Self> {
        let (agora_dir, workspace_dir, resolution_source) = resolve_runtime_config_dirs()?;
        let config_path = agora_dir.join("config.toml");

        fs::create_dir_all(&agora_dir).await.with_context(|| {
            format!("Failed to create config directory: {}", agora_dir.display())
        })?;
        fs::create_dir_all(&workspace_dir)
            .await
            .context("Failed to create workspace directory")?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.workspace_dir = workspace_dir;
            config.save().await?;

            // Restrict permissions on newly created config file (may contain API keys)
            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            config
        } else {
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            // Set computed paths that are skipped during serialization
            config.config_path = config_path.clone();
            config.workspace_dir = workspace_dir;
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            workspace = %config.workspace_dir.display(),
            source = resolution_source.as_str(),
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if !(0.0..=2.0).contains(&self.default_temperature) {
            anyhow::bail!(
                "default_temperature must be between 0.0 and 2.0 (got {})",
                self.default_temperature
            );
        }
        if self.memory.context_window == 0 {
            anyhow::bail!("memory.context_window must be greater than 0");
        }
        if self.memory.prune_keep_recent == Some(0) {
            anyhow::bail!("memory.prune_keep_recent must be greater than 0 when set");
        }
        let backend = self.memory.backend.trim().to_ascii_lowercase();
        if !SUPPORTED_MEMORY_BACKENDS.contains(&backend.as_str()) {
            anyhow::bail!(
                "memory.backend '{}' is not supported (expected one of: {})",
                self.memory.backend,
                SUPPORTED_MEMORY_BACKENDS.join(", ")
            );
        }
        if self.agents.default_agent.trim().is_empty() {
            anyhow::bail!("agents.default_agent must not be empty");
        }
        if self.agents.command_prefix.is_whitespace() {
            anyhow::bail!("agents.command_prefix must not be whitespace");
        }
        if self.agents.handler_timeout_secs == Some(0) {
            anyhow::bail!("agents.handler_timeout_secs must be greater than 0 when set");
        }
        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // API Key: AGORA_API_KEY, then the provider-native OPENAI_API_KEY
        if let Ok(key) = std::env::var("AGORA_API_KEY").or_else(|_| std::env::var("OPENAI_API_KEY"))
        {
            if !key.trim().is_empty() {
                self.api_key = Some(key.trim().to_string());
            }
        }

        if let Ok(url) = std::env::var("AGORA_API_URL") {
            if !url.trim().is_empty() {
                self.api_url = Some(url.trim().to_string());
            }
        }

        if let Ok(model) = std::env::var("AGORA_MODEL") {
            if !model.is_empty() {
                self.default_model = Some(model);
            }
        }

        if let Ok(workspace) = std::env::var("AGORA_WORKSPACE") {
            if !workspace.is_empty() {
                self.workspace_dir = PathBuf::from(workspace);
            }
        }

        // Gateway port: AGORA_GATEWAY_PORT or PORT
        if let Ok(port_str) =
            std::env::var("AGORA_GATEWAY_PORT").or_else(|_| std::env::var("PORT"))
        {
            if let Ok(port) = port_str.parse::<u16>() {
                self.gateway.port = port;
            }
        }

        // Gateway host: AGORA_GATEWAY_HOST or HOST
        if let Ok(host) = std::env::var("AGORA_GATEWAY_HOST").or_else(|_| std::env::var("HOST")) {
            if !host.is_empty() {
                self.gateway.host = host;
            }
        }
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_context_window() {
        let mut config = Config::default();
        config.memory.context_window = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("context_window"));
    }

    #[test]
    fn validate_rejects_unknown_memory_backend() {
        let mut config = Config::default();
        config.memory.backend = "postgres".into();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("postgres"));
    }

    #[test]
    fn validate_rejects_out_of_range_temperature() {
        let mut config = Config::default();
        config.default_temperature = 3.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn minimal_toml_fills_section_defaults() {
        let raw = r#"
default_temperature = 0.2

[agents.definitions.shopper]
model = "gpt-4o"
keywords = ["laptop", "deal"]
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.gateway.port, 8000);
        assert_eq!(config.memory.context_window, 5);
        assert_eq!(config.agents.default_agent, "paper_writer");
        assert_eq!(config.agents.command_prefix, '/');
        let shopper = &config.agents.definitions["shopper"];
        assert_eq!(shopper.model.as_deref(), Some("gpt-4o"));
        assert_eq!(
            shopper.keywords.as_deref(),
            Some(&["laptop".to_string(), "deal".to_string()][..])
        );
        assert!(shopper.temperature.is_none());
    }

    #[tokio::test]
    async fn save_writes_parseable_toml() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.config_path = tmp.path().join("config.toml");
        config.workspace_dir = tmp.path().join("workspace");
        config.gateway.port = 9123;

        config.save().await.unwrap();

        let raw = std::fs::read_to_string(&config.config_path).unwrap();
        let parsed: Config = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.gateway.port, 9123);
        assert_eq!(parsed.default_model.as_deref(), Some("gpt-4o-mini"));
    }

    #[tokio::test]
    async fn load_or_init_creates_file_and_applies_env_overrides() {
        let tmp = TempDir::new().unwrap();
        std::env::set_var("AGORA_CONFIG_DIR", tmp.path());
        std::env::set_var("AGORA_MODEL", "env-model");

        let created = Config::load_or_init().await.unwrap();
        let reloaded = Config::load_or_init().await.unwrap();

        std::env::remove_var("AGORA_MODEL");
        std::env::remove_var("AGORA_CONFIG_DIR");

        assert!(tmp.path().join("config.toml").exists());
        assert_eq!(created.default_model.as_deref(), Some("env-model"));
        assert_eq!(reloaded.default_model.as_deref(), Some("env-model"));
        assert_eq!(reloaded.workspace_dir, tmp.path().join("workspace"));

        let raw = std::fs::read_to_string(tmp.path().join("config.toml")).unwrap();
        assert!(!raw.contains("env-model"));
    }
}
