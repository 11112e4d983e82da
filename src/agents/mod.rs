//! Agent registry: the static table of agents and how each one is built.
//!
//! Agents are registered once at startup through [`AgentRegistry::builder`].
//! [`AgentRegistry::load`] turns a name into an [`AgentHandle`], applying any
//! `[agents.definitions.<name>]` overrides from the config file.

pub mod llm;
pub mod paper_writer;
pub mod shopper;
pub mod traits;

pub use traits::{AgentHandler, AgentRecord, FragmentStream, HandlerOutput};

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{AgentDefinitionConfig, Config};
use crate::providers::Provider;
use crate::routing::AgentRoute;
use llm::LlmAgent;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent '{0}' not found")]
    NotFound(String),
    #[error("failed to load agent '{name}': {reason}")]
    Load { name: String, reason: String },
}

/// A ready-to-run agent.
#[derive(Clone)]
pub struct AgentHandle {
    pub record: AgentRecord,
    pub handler: Arc<dyn AgentHandler>,
}

/// Fully resolved settings handed to a handler factory.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub record: AgentRecord,
    pub system_prompt: String,
}

/// Built-in values for one agent; config overrides win over these.
#[derive(Debug, Clone)]
pub struct AgentDefaults {
    pub description: String,
    pub keywords: Vec<String>,
    pub system_prompt: String,
    /// `None` uses the registry-wide default model.
    pub model: Option<String>,
    /// `None` uses the registry-wide default temperature.
    pub temperature: Option<f64>,
    pub max_output_tokens: u32,
}

pub type HandlerFactory =
    Arc<dyn Fn(&AgentSettings) -> anyhow::Result<Arc<dyn AgentHandler>> + Send + Sync>;

struct Registration {
    name: String,
    defaults: AgentDefaults,
    factory: HandlerFactory,
}

pub struct AgentRegistryBuilder {
    registrations: Vec<Registration>,
    default_model: String,
    default_temperature: f64,
    overrides: BTreeMap<String, AgentDefinitionConfig>,
    workspace_dir: PathBuf,
    cache_handles: bool,
}

impl AgentRegistryBuilder {
    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn default_temperature(mut self, temperature: f64) -> Self {
        self.default_temperature = temperature;
        self
    }

    pub fn overrides(mut self, overrides: BTreeMap<String, AgentDefinitionConfig>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Base for relative `prompt_file` paths.
    pub fn workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    pub fn cache_handles(mut self, cache: bool) -> Self {
        self.cache_handles = cache;
        self
    }

    /// Add an agent. Registering a name twice replaces the earlier entry in place.
    pub fn register<F>(mut self, name: &str, defaults: AgentDefaults, factory: F) -> Self
    where
        F: Fn(&AgentSettings) -> anyhow::Result<Arc<dyn AgentHandler>> + Send + Sync + 'static,
    {
        let registration = Registration {
            name: name.to_string(),
            defaults,
            factory: Arc::new(factory),
        };
        if let Some(existing) = self.registrations.iter_mut().find(|r| r.name == name) {
            tracing::warn!(agent = name, "Agent registered twice; keeping the later definition");
            *existing = registration;
        } else {
            self.registrations.push(registration);
        }
        self
    }

    pub fn build(self) -> AgentRegistry {
        for name in self.overrides.keys() {
            if !self.registrations.iter().any(|r| &r.name == name) {
                tracing::warn!(agent = %name, "Config defines an agent that is not registered; ignoring");
            }
        }
        AgentRegistry {
            registrations: self.registrations,
            default_model: self.default_model,
            default_temperature: self.default_temperature,
            overrides: self.overrides,
            workspace_dir: self.workspace_dir,
            cache_handles: self.cache_handles,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

pub struct AgentRegistry {
    registrations: Vec<Registration>,
    default_model: String,
    default_temperature: f64,
    overrides: BTreeMap<String, AgentDefinitionConfig>,
    workspace_dir: PathBuf,
    cache_handles: bool,
    cache: Mutex<HashMap<String, AgentHandle>>,
}

impl AgentRegistry {
    pub fn builder() -> AgentRegistryBuilder {
        AgentRegistryBuilder {
            registrations: Vec::new(),
            default_model: "gpt-4o-mini".into(),
            default_temperature: 0.7,
            overrides: BTreeMap::new(),
            workspace_dir: PathBuf::from("."),
            cache_handles: false,
        }
    }

    /// The built-in `paper_writer` and `shopper` agents, configured from `config`.
    pub fn with_builtin_agents(config: &Config, provider: Arc<dyn Provider>) -> Self {
        let writer_provider = Arc::clone(&provider);
        let shopper_provider = provider;

        Self::builder()
            .default_model(
                config
                    .default_model
                    .clone()
                    .unwrap_or_else(|| "gpt-4o-mini".into()),
            )
            .default_temperature(config.default_temperature)
            .overrides(config.agents.definitions.clone())
            .workspace_dir(config.workspace_dir.clone())
            .cache_handles(config.agents.cache_handles)
            .register(
                paper_writer::NAME,
                AgentDefaults {
                    description: paper_writer::DESCRIPTION.into(),
                    keywords: paper_writer::KEYWORDS.iter().map(|k| (*k).to_string()).collect(),
                    system_prompt: paper_writer::SYSTEM_PROMPT.into(),
                    model: None,
                    temperature: None,
                    max_output_tokens: paper_writer::MAX_OUTPUT_TOKENS,
                },
                move |settings| {
                    let llm = LlmAgent::new(settings.record.clone(), Arc::clone(&writer_provider));
                    let handler: Arc<dyn AgentHandler> = Arc::new(paper_writer::PaperWriter::new(
                        llm,
                        settings.system_prompt.clone(),
                    ));
                    Ok(handler)
                },
            )
            .register(
                shopper::NAME,
                AgentDefaults {
                    description: shopper::DESCRIPTION.into(),
                    keywords: shopper::KEYWORDS.iter().map(|k| (*k).to_string()).collect(),
                    system_prompt: shopper::SYSTEM_PROMPT.into(),
                    model: None,
                    temperature: None,
                    max_output_tokens: shopper::MAX_OUTPUT_TOKENS,
                },
                move |settings| {
                    let llm = LlmAgent::new(settings.record.clone(), Arc::clone(&shopper_provider));
                    let handler: Arc<dyn AgentHandler> =
                        Arc::new(shopper::Shopper::new(llm, settings.system_prompt.clone()));
                    Ok(handler)
                },
            )
            .build()
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registrations.iter().any(|r| r.name == name)
    }

    /// Routing keywords per agent, in registration order.
    pub fn routes(&self) -> Vec<AgentRoute> {
        self.registrations
            .iter()
            .map(|r| {
                let keywords = self
                    .overrides
                    .get(&r.name)
                    .and_then(|o| o.keywords.clone())
                    .unwrap_or_else(|| r.defaults.keywords.clone());
                AgentRoute::new(r.name.clone(), keywords)
            })
            .collect()
    }

    /// Resolve `name` to a runnable handle.
    pub async fn load(&self, name: &str) -> Result<AgentHandle, AgentError> {
        let registration = self
            .registrations
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| AgentError::NotFound(name.to_string()))?;

        if self.cache_handles {
            if let Some(handle) = self.cache.lock().get(name) {
                return Ok(handle.clone());
            }
        }

        let load_error = |reason: String| AgentError::Load {
            name: name.to_string(),
            reason,
        };
        let settings = self
            .resolve_settings(registration)
            .await
            .map_err(load_error)?;
        let handler =
            (registration.factory)(&settings).map_err(|e| load_error(format!("{e:#}")))?;

        let handle = AgentHandle {
            record: settings.record,
            handler,
        };
        if self.cache_handles {
            self.cache
                .lock()
                .insert(name.to_string(), handle.clone());
        }
        tracing::debug!(agent = name, cached = self.cache_handles, "Agent loaded");
        Ok(handle)
    }

    /// Every agent that loads cleanly, in registration order.
    pub async fn list(&self) -> Vec<AgentRecord> {
        let mut records = Vec::with_capacity(self.registrations.len());
        for registration in &self.registrations {
            match self.load(&registration.name).await {
                Ok(handle) => records.push(handle.record),
                Err(e) => tracing::warn!(
                    agent = %registration.name,
                    error = %e,
                    "Skipping agent that failed to load"
                ),
            }
        }
        records
    }

    pub async fn get(&self, name: &str) -> Result<AgentRecord, AgentError> {
        self.load(name).await.map(|handle| handle.record)
    }

    /// Drop cached handles: one agent, or all of them with `None`.
    pub fn invalidate(&self, name: Option<&str>) {
        let mut cache = self.cache.lock();
        match name {
            Some(name) => {
                cache.remove(name);
            }
            None => cache.clear(),
        }
    }

    async fn resolve_settings(&self, registration: &Registration) -> Result<AgentSettings, String> {
        let defaults = &registration.defaults;
        let overrides = self.overrides.get(&registration.name);

        let description = overrides
            .and_then(|o| o.description.clone())
            .unwrap_or_else(|| defaults.description.clone());

        let model = overrides
            .and_then(|o| o.model.clone())
            .or_else(|| defaults.model.clone())
            .unwrap_or_else(|| self.default_model.clone());
        let model = model.trim().to_string();
        if model.is_empty() {
            return Err("model must not be empty".into());
        }

        let temperature = overrides
            .and_then(|o| o.temperature)
            .or(defaults.temperature)
            .unwrap_or(self.default_temperature);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(format!(
                "temperature must be between 0.0 and 2.0 (got {temperature})"
            ));
        }

        let max_output_tokens = overrides
            .and_then(|o| o.max_output_tokens)
            .unwrap_or(defaults.max_output_tokens);
        if max_output_tokens == 0 {
            return Err("max_output_tokens must be greater than 0".into());
        }

        let system_prompt = match overrides.and_then(|o| o.prompt_file.as_deref()) {
            Some(raw) => {
                let path = if std::path::Path::new(raw).is_absolute() {
                    PathBuf::from(raw)
                } else {
                    self.workspace_dir.join(raw)
                };
                let prompt = tokio::fs::read_to_string(&path).await.map_err(|e| {
                    format!("cannot read prompt file {}: {e}", path.display())
                })?;
                if prompt.trim().is_empty() {
                    return Err(format!("prompt file {} is empty", path.display()));
                }
                prompt
            }
            None => defaults.system_prompt.clone(),
        };

        Ok(AgentSettings {
            record: AgentRecord {
                name: registration.name.clone(),
                description,
                model,
                temperature,
                max_output_tokens,
            },
            system_prompt,
        })
    }
}
