use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use steward_types::ExecutionPath;

/// Environment names are also honored with this prefix, which wins over
/// the bare form when both are set.
pub const ENV_PREFIX: &str = "CONNECTION_CONFIGS_CONFIG_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{name}`: {detail}")]
    Invalid { name: &'static str, detail: String },
    #[error("config file {path}: {detail}")]
    File { path: PathBuf, detail: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSettings {
    pub hub_url: String,
    pub relay_url: String,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            hub_url: "https://hub.snapshot.org/graphql".to_string(),
            relay_url: "https://seq.snapshot.org".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletSettings {
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafeSettings {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub service_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    pub snapshot_secs: u64,
    pub provider_secs: u64,
    pub vote_secs: u64,
    pub rpc_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            snapshot_secs: 30,
            provider_secs: 60,
            vote_secs: 30,
            rpc_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    pub backups: usize,
    pub checkpoint_runs: usize,
    pub decision_log_runs: usize,
    pub log_days: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            backups: 5,
            checkpoint_runs: 100,
            decision_log_runs: 100,
            log_days: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8716,
        }
    }
}

/// Process configuration, merged from built-in defaults, an optional JSON
/// file, and the environment (file overrides defaults, env overrides the
/// file). Read once at startup and again on SIGHUP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub spaces: Vec<String>,
    #[serde(default = "default_execution_path")]
    pub execution_path: ExecutionPath,
    #[serde(default)]
    pub snapshot: SnapshotSettings,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub wallet: WalletSettings,
    #[serde(default)]
    pub safe: SafeSettings,
    /// Governor contract per space, for the on-chain vote path.
    #[serde(default)]
    pub governors: HashMap<String, String>,
    /// RPC endpoint per chain name.
    #[serde(default)]
    pub rpc_endpoints: HashMap<String, String>,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default = "default_health_staleness")]
    pub health_staleness_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_store_root() -> PathBuf {
    PathBuf::from(".steward")
}

fn default_poll_interval() -> u64 {
    300
}

fn default_execution_path() -> ExecutionPath {
    ExecutionPath::DryRun
}

fn default_chain_id() -> u64 {
    100
}

fn default_health_staleness() -> u64 {
    600
}

fn default_shutdown_grace() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        serde_json::from_value(json!({})).expect("defaults deserialize")
    }
}

impl AgentConfig {
    /// Loads and validates the effective configuration.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(file, |name| std::env::var(name).ok())
    }

    /// Loads without validating, for callers that apply CLI overrides
    /// before the final `validate`.
    pub fn load_unchecked(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::merge_layers(file, |name| std::env::var(name).ok())
    }

    pub fn load_with_env(
        file: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self::merge_layers(file, lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn merge_layers(
        file: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut merged = json!({});
        if let Some(path) = file {
            if path.exists() {
                let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::File {
                    path: path.to_path_buf(),
                    detail: err.to_string(),
                })?;
                let value: Value =
                    serde_json::from_str(&raw).map_err(|err| ConfigError::File {
                        path: path.to_path_buf(),
                        detail: err.to_string(),
                    })?;
                deep_merge(&mut merged, &value);
            }
        }
        deep_merge(&mut merged, &env_layer(&lookup));

        serde_json::from_value(merged).map_err(|err| ConfigError::Invalid {
            name: "config",
            detail: err.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spaces.is_empty() {
            return Err(ConfigError::Missing("spaces"));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "poll_interval_secs",
                detail: "must be positive".to_string(),
            });
        }
        match self.execution_path {
            ExecutionPath::DryRun => {}
            ExecutionPath::Eoa => {
                if self.wallet.private_key.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::Missing("wallet.private_key"));
                }
            }
            ExecutionPath::Safe => {
                if self.wallet.private_key.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::Missing("wallet.private_key"));
                }
                let address = self.safe.address.as_deref().unwrap_or("");
                if address.is_empty() {
                    return Err(ConfigError::Missing("safe.address"));
                }
                if !looks_like_address(address) {
                    return Err(ConfigError::Invalid {
                        name: "safe.address",
                        detail: format!("`{address}` is not a checksummed or hex address"),
                    });
                }
                if self.safe.service_url.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::Missing("safe.service_url"));
                }
            }
        }
        for (space, governor) in &self.governors {
            if !looks_like_address(governor) {
                return Err(ConfigError::Invalid {
                    name: "governors",
                    detail: format!("`{governor}` for space `{space}` is not an address"),
                });
            }
        }
        Ok(())
    }
}

fn looks_like_address(raw: &str) -> bool {
    raw.strip_prefix("0x")
        .map(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

/// Reads `<name>`, preferring `CONNECTION_CONFIGS_CONFIG_<name>`.
fn env_value(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(&format!("{ENV_PREFIX}{name}"))
        .or_else(|| lookup(name))
        .filter(|v| !v.trim().is_empty())
}

fn env_layer(lookup: &impl Fn(&str) -> Option<String>) -> Value {
    let mut root = json!({});

    let mut set = |pointer: &[&str], value: Value| {
        let mut node = &mut root;
        for key in &pointer[..pointer.len() - 1] {
            node = node
                .as_object_mut()
                .expect("object layer")
                .entry(key.to_string())
                .or_insert_with(|| json!({}));
        }
        node.as_object_mut()
            .expect("object layer")
            .insert(pointer[pointer.len() - 1].to_string(), value);
    };

    if let Some(value) = env_value(lookup, "STORE_ROOT") {
        set(&["store_root"], json!(value));
    }
    if let Some(value) = env_value(lookup, "POLL_INTERVAL_SECONDS") {
        if let Ok(parsed) = value.parse::<u64>() {
            set(&["poll_interval_secs"], json!(parsed));
        }
    }
    if let Some(value) = env_value(lookup, "SPACE_IDS") {
        set(&["spaces"], json!(parse_csv(&value)));
    }
    if let Some(value) = env_value(lookup, "EXECUTION_PATH") {
        set(&["execution_path"], json!(value.to_ascii_lowercase()));
    }
    if let Some(value) = env_value(lookup, "SNAPSHOT_HUB_URL") {
        set(&["snapshot", "hub_url"], json!(value));
    }
    if let Some(value) = env_value(lookup, "SNAPSHOT_RELAY_URL") {
        set(&["snapshot", "relay_url"], json!(value));
    }
    if let Some(value) = env_value(lookup, "AI_PROVIDER_URL") {
        set(&["provider", "url"], json!(value));
    }
    if let Some(value) = env_value(lookup, "AI_API_KEY") {
        set(&["provider", "api_key"], json!(value));
    }
    if let Some(value) = env_value(lookup, "AI_MODEL") {
        set(&["provider", "model"], json!(value));
    }
    if let Some(value) = env_value(lookup, "WALLET_PRIVATE_KEY") {
        set(&["wallet", "private_key"], json!(value));
    }
    if let Some(value) = env_value(lookup, "CHAIN_ID") {
        if let Ok(parsed) = value.parse::<u64>() {
            set(&["wallet", "chain_id"], json!(parsed));
        }
    }
    if let Some(value) = env_value(lookup, "SAFE_ADDRESS") {
        set(&["safe", "address"], json!(value));
    }
    if let Some(value) = env_value(lookup, "SAFE_SERVICE_URL") {
        set(&["safe", "service_url"], json!(value));
    }
    if let Some(value) = env_value(lookup, "GOVERNOR_ADDRESSES") {
        set(&["governors"], json!(parse_pairs(&value)));
    }
    if let Some(value) = env_value(lookup, "RPC_ENDPOINTS") {
        set(&["rpc_endpoints"], json!(parse_pairs(&value)));
    }
    if let Some(value) = env_value(lookup, "HTTP_HOST") {
        set(&["server", "host"], json!(value));
    }
    if let Some(value) = env_value(lookup, "HTTP_PORT") {
        if let Ok(parsed) = value.parse::<u16>() {
            set(&["server", "port"], json!(parsed));
        }
    }
    if let Some(value) = env_value(lookup, "HEALTH_STALENESS_SECONDS") {
        if let Ok(parsed) = value.parse::<u64>() {
            set(&["health_staleness_secs"], json!(parsed));
        }
    }

    root
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `key=value,key=value` pairs, as used for per-space and per-chain maps.
fn parse_pairs(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn defaults_fail_validation_without_spaces() {
        let err = AgentConfig::load_with_env(None, |_| None).expect_err("no spaces");
        assert!(matches!(err, ConfigError::Missing("spaces")));
    }

    #[test]
    fn env_layer_fills_in_the_essentials() {
        let env = [
            ("SPACE_IDS", "dao.eth, other.eth"),
            ("EXECUTION_PATH", "dry_run"),
            ("POLL_INTERVAL_SECONDS", "120"),
        ];
        let config = AgentConfig::load_with_env(None, env_of(&env)).expect("load");
        assert_eq!(config.spaces, vec!["dao.eth", "other.eth"]);
        assert_eq!(config.execution_path, ExecutionPath::DryRun);
        assert_eq!(config.poll_interval_secs, 120);
    }

    #[test]
    fn prefixed_env_names_win_over_bare_ones() {
        let env = [
            ("SPACE_IDS", "bare.eth"),
            ("CONNECTION_CONFIGS_CONFIG_SPACE_IDS", "prefixed.eth"),
        ];
        let config = AgentConfig::load_with_env(None, env_of(&env)).expect("load");
        assert_eq!(config.spaces, vec!["prefixed.eth"]);
    }

    #[test]
    fn eoa_path_requires_a_private_key() {
        let env = [("SPACE_IDS", "dao.eth"), ("EXECUTION_PATH", "eoa")];
        let err = AgentConfig::load_with_env(None, env_of(&env)).expect_err("no key");
        assert!(matches!(err, ConfigError::Missing("wallet.private_key")));
    }

    #[test]
    fn safe_path_requires_safe_settings() {
        let env = [
            ("SPACE_IDS", "dao.eth"),
            ("EXECUTION_PATH", "safe"),
            ("WALLET_PRIVATE_KEY", "abc123"),
        ];
        let err = AgentConfig::load_with_env(None, env_of(&env)).expect_err("no safe");
        assert!(matches!(err, ConfigError::Missing("safe.address")));

        let env = [
            ("SPACE_IDS", "dao.eth"),
            ("EXECUTION_PATH", "safe"),
            ("WALLET_PRIVATE_KEY", "abc123"),
            ("SAFE_ADDRESS", "0x00000000000000000000000000000000000000f0"),
            (
                "SAFE_SERVICE_URL",
                "https://safe-transaction.example.com",
            ),
        ];
        let config = AgentConfig::load_with_env(None, env_of(&env)).expect("load");
        assert_eq!(config.execution_path, ExecutionPath::Safe);
    }

    #[test]
    fn malformed_safe_address_is_rejected() {
        let env = [
            ("SPACE_IDS", "dao.eth"),
            ("EXECUTION_PATH", "safe"),
            ("WALLET_PRIVATE_KEY", "abc123"),
            ("SAFE_ADDRESS", "0x1234"),
            ("SAFE_SERVICE_URL", "https://example.com"),
        ];
        let err = AgentConfig::load_with_env(None, env_of(&env)).expect_err("bad address");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "safe.address",
                ..
            }
        ));
    }

    #[test]
    fn governor_pairs_parse_from_env() {
        let env = [
            ("SPACE_IDS", "dao.eth"),
            (
                "GOVERNOR_ADDRESSES",
                "dao.eth=0x00000000000000000000000000000000000000aa,other.eth=0x00000000000000000000000000000000000000bb",
            ),
        ];
        let config = AgentConfig::load_with_env(None, env_of(&env)).expect("load");
        assert_eq!(config.governors.len(), 2);
        assert_eq!(
            config.governors.get("dao.eth").map(String::as_str),
            Some("0x00000000000000000000000000000000000000aa")
        );
    }

    #[test]
    fn file_layer_is_overridden_by_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            serde_json::to_string_pretty(&json!({
                "spaces": ["file.eth"],
                "poll_interval_secs": 60
            }))
            .expect("serialize"),
        )
        .expect("write");

        let env = [("SPACE_IDS", "env.eth")];
        let config = AgentConfig::load_with_env(Some(&path), env_of(&env)).expect("load");
        assert_eq!(config.spaces, vec!["env.eth"]);
        // Untouched file settings survive the merge.
        assert_eq!(config.poll_interval_secs, 60);
    }

    #[test]
    fn timeouts_have_sane_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.timeouts.snapshot_secs, 30);
        assert_eq!(config.timeouts.provider_secs, 60);
        assert_eq!(config.timeouts.vote_secs, 30);
        assert_eq!(config.timeouts.rpc_secs, 20);
    }
}
