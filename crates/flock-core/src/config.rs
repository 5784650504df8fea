//! Configuration resolution for Flock.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/flock/settings.json)
//! 3. Project config (.flock/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are merged as JSON documents, so an overlay only replaces the keys
//! it actually names.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Flock configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub agents: AgentDefaults,
    pub permissions: PermissionConfig,
}

/// Daemon-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Upper bound on concurrently running project agents.
    pub max_concurrent_agents: usize,
    /// Path to the agent CLI binary.
    pub claude_bin: PathBuf,
    /// Grace period between the terminate and the kill signal.
    pub terminate_timeout_secs: u64,
    /// Delay before re-probing an orphan that received a terminate signal.
    pub orphan_recheck_delay_ms: u64,
    /// Where the process tracker persists its pid table, if anywhere.
    pub tracker_state_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 3,
            claude_bin: PathBuf::from("claude"),
            terminate_timeout_secs: 5,
            orphan_recheck_delay_ms: 500,
            tracker_state_path: None,
            log_level: "info".to_string(),
        }
    }
}

/// Defaults applied to every spawned agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefaults {
    pub default_model: Option<String>,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub include_partial_messages: bool,
    pub no_session_persistence: bool,
    /// Context window used to compute `percent_used`.
    pub max_context_tokens: u64,
    pub plugin_dirs: Vec<PathBuf>,
    /// MCP server definitions keyed by server name, written verbatim into
    /// the generated `--mcp-config` file.
    pub mcp_servers: BTreeMap<String, Value>,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            default_model: None,
            max_turns: None,
            max_budget_usd: None,
            include_partial_messages: true,
            no_session_persistence: false,
            max_context_tokens: 200_000,
            plugin_dirs: Vec::new(),
            mcp_servers: BTreeMap::new(),
        }
    }
}

/// Permission defaults handed to the permission-argument generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Pass `--dangerously-skip-permissions`.
    pub skip_permissions: bool,
    /// Value for `--permission-mode` (`default`, `acceptEdits`, `plan`, ...).
    pub default_mode: String,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub append_system_prompt: Option<String>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            skip_permissions: false,
            default_mode: "default".to_string(),
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            append_system_prompt: None,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_json(&mut merged, load_config_file(&global_path)?);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".flock").join("settings.json");
        if project_path.exists() {
            merge_json(&mut merged, load_config_file(&project_path)?);
        }
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid merged configuration: {e}")))?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".flock").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/flock/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("flock").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively merge `overlay` into `base`; objects merge key by key, every
/// other value replaces.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let nested = value.is_object() && base_map.get(&key).is_some_and(Value::is_object);
                if nested {
                    if let Some(existing) = base_map.get_mut(&key) {
                        merge_json(existing, value);
                    }
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("FLOCK_MAX_AGENTS")
        && let Ok(n) = val.parse()
    {
        config.daemon.max_concurrent_agents = n;
    }
    if let Ok(val) = std::env::var("FLOCK_CLAUDE_BIN") {
        config.daemon.claude_bin = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("FLOCK_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Ok(val) = std::env::var("FLOCK_DEFAULT_MODEL") {
        config.agents.default_model = Some(val);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = Config::default();
        assert_eq!(config.daemon.max_concurrent_agents, 3);
        assert_eq!(config.daemon.terminate_timeout_secs, 5);
        assert_eq!(config.agents.max_context_tokens, 200_000);
        assert_eq!(config.permissions.default_mode, "default");
    }

    #[test]
    fn overlay_replaces_only_named_keys() {
        let mut base = serde_json::to_value(Config::default()).unwrap();
        merge_json(
            &mut base,
            serde_json::json!({"daemon": {"max_concurrent_agents": 7}}),
        );
        let config: Config = serde_json::from_value(base).unwrap();
        assert_eq!(config.daemon.max_concurrent_agents, 7);
        assert_eq!(config.daemon.terminate_timeout_secs, 5);
        assert_eq!(config.daemon.claude_bin, PathBuf::from("claude"));
    }

    #[test]
    fn project_file_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".flock")).unwrap();
        std::fs::write(
            dir.path().join(".flock").join("settings.json"),
            r#"{"permissions": {"allowed_tools": ["Read", "Grep"]},
                "agents": {"mcp_servers": {"docs": {"command": "docs-mcp"}}}}"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert_eq!(config.permissions.allowed_tools, vec!["Read", "Grep"]);
        assert!(config.agents.mcp_servers.contains_key("docs"));
    }

    #[test]
    fn malformed_project_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".flock")).unwrap();
        std::fs::write(dir.path().join(".flock").join("settings.json"), "{nope").unwrap();

        let err = load_config(Some(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
