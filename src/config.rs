//! YAML configuration loading and the immutable descriptors built from it
//! ([`ProviderDescriptor`], [`KeyDescriptor`], [`ModelMapping`]).

use std::collections::HashMap;

use crate::{prelude::*, selector::Strategy};

/// Default path to the config file, overridden by `CONDUCTOR_CONFIG_PATH`.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

/// Built-in unified-model-name mappings, overlaid with user config.
fn builtin_model_map() -> HashMap<String, HashMap<String, String>> {
    let mut map = HashMap::new();
    map.insert(
        "llama-70b".to_string(),
        HashMap::from([
            ("cerebras".to_string(), "llama-3.3-70b".to_string()),
            ("nvidia".to_string(), "meta/llama-3.3-70b-instruct".to_string()),
        ]),
    );
    map.insert(
        "llama-8b".to_string(),
        HashMap::from([
            ("cerebras".to_string(), "llama3.1-8b".to_string()),
            ("nvidia".to_string(), "meta/llama-3.1-8b-instruct".to_string()),
        ]),
    );
    map.insert(
        "llama-3.3-70b".to_string(),
        HashMap::from([
            ("cerebras".to_string(), "llama-3.3-70b".to_string()),
            ("nvidia".to_string(), "meta/llama-3.3-70b-instruct".to_string()),
        ]),
    );
    map.insert(
        "llama-3.1-8b".to_string(),
        HashMap::from([
            ("cerebras".to_string(), "llama3.1-8b".to_string()),
            ("nvidia".to_string(), "meta/llama-3.1-8b-instruct".to_string()),
        ]),
    );
    map.insert(
        "llama-3.1-70b".to_string(),
        HashMap::from([
            ("cerebras".to_string(), "llama3.1-70b".to_string()),
            ("nvidia".to_string(), "meta/llama-3.1-70b-instruct".to_string()),
        ]),
    );
    map
}

/// Raw, on-disk shape of one key entry under `providers.<id>.keys[]`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawKeyConfig {
    pub name: String,
    pub api_key: String,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
}

/// Raw, on-disk shape of one entry under `providers`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_url: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default)]
    pub keys: Vec<RawKeyConfig>,
}

fn default_true() -> bool {
    true
}

fn default_chat_path() -> String {
    "/chat/completions".to_string()
}

/// Raw, on-disk shape of the `conductor` block.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConductorConfig {
    #[serde(default)]
    pub scheduling_strategy: Strategy,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    1.0
}

impl Default for RawConductorConfig {
    fn default() -> Self {
        Self {
            scheduling_strategy: Strategy::default(),
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

/// Optional server bind configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// The top-level shape of `config/config.yaml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfig {
    #[serde(default)]
    pub conductor: RawConductorConfig,
    #[serde(default)]
    pub server: RawServerConfig,
    #[serde(default)]
    pub models: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub providers: HashMap<String, RawProviderConfig>,
}

impl RawConfig {
    /// Load from a YAML file at `path`, falling back to an empty
    /// (zero-provider) configuration if the file does not exist, so the
    /// process can still come up and answer `/health`.
    pub fn load(path: &std::path::Path) -> Result<Self, ConductorError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_yaml::from_str(&contents)
                .map_err(|e| ConductorError::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, starting with no providers");
                Ok(Self::default())
            }
            Err(e) => Err(ConductorError::Config(format!("{}: {e}", path.display()))),
        }
    }

    /// Resolve `CONDUCTOR_CONFIG_PATH`, defaulting to
    /// [`DEFAULT_CONFIG_PATH`], and load it.
    pub fn load_from_env() -> Result<Self, ConductorError> {
        let path = std::env::var("CONDUCTOR_CONFIG_PATH")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(std::path::Path::new(&path))
    }
}

/// Immutable configuration of an upstream provider.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub id: String,
    pub base_url: String,
    pub chat_path: String,
    pub enabled: bool,
}

/// One API key belonging to one provider.
#[derive(Debug, Clone)]
pub struct KeyDescriptor {
    pub provider: Arc<ProviderDescriptor>,
    pub name: String,
    pub api_key: String,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
}

/// Unified model name → provider id → provider-native model id.
#[derive(Debug, Clone, Default)]
pub struct ModelMapping {
    map: HashMap<String, HashMap<String, String>>,
}

/// The outcome of resolving a unified model name for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The provider-native model id to send upstream.
    Supported(String),
    /// The unified name is known, but this provider has no entry for it.
    NotSupported,
}

impl ModelMapping {
    /// Build the mapping from built-in defaults overlaid with user config
    /// (user wins on collision).
    pub fn new(user_map: &HashMap<String, HashMap<String, String>>) -> Self {
        let mut map = builtin_model_map();
        for (unified_name, per_provider) in user_map {
            map.entry(unified_name.clone())
                .or_default()
                .extend(per_provider.clone());
        }
        Self { map }
    }

    /// Resolve `unified_name` for `provider_id`.
    ///
    /// If `unified_name` is absent from the map entirely, we pass it through
    /// unchanged (supports clients sending provider-native names directly).
    /// If it's present but has no entry for `provider_id`, we signal
    /// [`Resolution::NotSupported`].
    pub fn resolve(&self, unified_name: &str, provider_id: &str) -> Resolution {
        match self.map.get(unified_name) {
            None => Resolution::Supported(unified_name.to_string()),
            Some(per_provider) => match per_provider.get(provider_id) {
                Some(native) => Resolution::Supported(native.clone()),
                None => Resolution::NotSupported,
            },
        }
    }

    /// All unified model names known to the mapping, for `/v1/models`.
    pub fn unified_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.keys().cloned().collect();
        if !names.iter().any(|n| n == "llama-70b") {
            names.push("llama-70b".to_string());
        }
        names.sort();
        names
    }
}

/// Everything resolved at startup from [`RawConfig`]: providers, keys, the
/// model mapping, and the conductor's scheduling parameters.
pub struct Config {
    pub conductor: RawConductorConfig,
    pub server: RawServerConfig,
    pub providers: Vec<Arc<ProviderDescriptor>>,
    pub keys: Vec<Arc<KeyDescriptor>>,
    pub models: ModelMapping,
}

impl Config {
    /// Validate and flatten a [`RawConfig`] into immutable descriptors.
    ///
    /// A provider/key with a non-positive rate limit is a configuration
    /// error at startup; zero enabled providers/keys is *not*
    /// an error here: it's handled at request time as [`ConductorError::NoProviders`].
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConductorError> {
        let mut providers = Vec::new();
        let mut keys = Vec::new();

        // Config maps don't preserve insertion order; sort by provider id so
        // the selector's config order is deterministic across runs.
        let mut provider_ids: Vec<&String> = raw.providers.keys().collect();
        provider_ids.sort();

        for provider_id in provider_ids {
            let raw_provider = &raw.providers[provider_id];
            let descriptor = Arc::new(ProviderDescriptor {
                id: provider_id.clone(),
                base_url: raw_provider.base_url.clone(),
                chat_path: raw_provider.chat_path.clone(),
                enabled: raw_provider.enabled,
            });
            for raw_key in &raw_provider.keys {
                if raw_key.requests_per_minute == 0 || raw_key.tokens_per_minute == 0 {
                    return Err(ConductorError::Config(format!(
                        "key {:?} on provider {:?} must have positive RPM and TPM",
                        raw_key.name, provider_id
                    )));
                }
                keys.push(Arc::new(KeyDescriptor {
                    provider: descriptor.clone(),
                    name: raw_key.name.clone(),
                    api_key: raw_key.api_key.clone(),
                    requests_per_minute: raw_key.requests_per_minute,
                    tokens_per_minute: raw_key.tokens_per_minute,
                }));
            }
            providers.push(descriptor);
        }

        Ok(Self {
            conductor: raw.conductor,
            server: raw.server,
            providers,
            keys,
            models: ModelMapping::new(&raw.models),
        })
    }

    /// Load configuration end to end: YAML file (via `CONDUCTOR_CONFIG_PATH`)
    /// validated into descriptors.
    pub fn load_from_env() -> Result<Self, ConductorError> {
        Self::from_raw(RawConfig::load_from_env()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_falls_back_to_passthrough() {
        let models = ModelMapping::new(&HashMap::new());
        assert_eq!(
            models.resolve("some-custom-model", "cerebras"),
            Resolution::Supported("some-custom-model".to_string())
        );
    }

    #[test]
    fn resolve_builtin_mapping() {
        let models = ModelMapping::new(&HashMap::new());
        assert_eq!(
            models.resolve("llama-70b", "cerebras"),
            Resolution::Supported("llama-3.3-70b".to_string())
        );
    }

    #[test]
    fn resolve_not_supported_for_missing_provider_entry() {
        let models = ModelMapping::new(&HashMap::new());
        assert_eq!(
            models.resolve("llama-70b", "azure"),
            Resolution::NotSupported
        );
    }

    #[test]
    fn user_map_wins_on_collision() {
        let mut user_map = HashMap::new();
        user_map.insert(
            "llama-70b".to_string(),
            HashMap::from([("cerebras".to_string(), "custom-llama".to_string())]),
        );
        let models = ModelMapping::new(&user_map);
        assert_eq!(
            models.resolve("llama-70b", "cerebras"),
            Resolution::Supported("custom-llama".to_string())
        );
        // nvidia entry from the builtin map survives the merge.
        assert_eq!(
            models.resolve("llama-70b", "nvidia"),
            Resolution::Supported("meta/llama-3.3-70b-instruct".to_string())
        );
    }

    #[test]
    fn rejects_zero_rate_limits() {
        let mut raw = RawConfig::default();
        raw.providers.insert(
            "cerebras".to_string(),
            RawProviderConfig {
                enabled: true,
                base_url: "https://api.cerebras.ai/v1".to_string(),
                chat_path: default_chat_path(),
                keys: vec![RawKeyConfig {
                    name: "k1".to_string(),
                    api_key: "secret".to_string(),
                    requests_per_minute: 0,
                    tokens_per_minute: 100,
                }],
            },
        );
        assert!(Config::from_raw(raw).is_err());
    }

    #[test]
    fn missing_file_yields_empty_config() {
        let raw = RawConfig::load(std::path::Path::new("/nonexistent/config.yaml")).unwrap();
        assert!(raw.providers.is_empty());
    }
}
