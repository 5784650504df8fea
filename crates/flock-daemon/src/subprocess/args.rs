//! Worker command line construction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::supervisor::AgentConfig;

/// Effective permission flags for one worker, as resolved by a
/// [`PermissionArgsGenerator`](crate::store::PermissionArgsGenerator).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionArgs {
    pub skip_permissions: bool,
    pub permission_mode: String,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub append_system_prompt: Option<String>,
}

/// Build the worker argument vector (program name excluded).
pub fn build_args(config: &AgentConfig, mcp_config: Option<&Path>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--print".into(),
        "--verbose".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--input-format".into(),
        "stream-json".into(),
    ];

    let perms = &config.permissions;
    if perms.skip_permissions {
        args.push("--dangerously-skip-permissions".into());
    } else {
        args.push("--permission-mode".into());
        args.push(perms.permission_mode.clone());
        if !perms.allowed_tools.is_empty() {
            args.push("--allowedTools".into());
            args.push(perms.allowed_tools.join(" "));
        }
        if !perms.disallowed_tools.is_empty() {
            args.push("--disallowedTools".into());
            args.push(perms.disallowed_tools.join(" "));
        }
    }
    if let Some(ref prompt) = perms.append_system_prompt {
        args.push("--append-system-prompt".into());
        args.push(prompt.clone());
    }

    if let Some(turns) = config.max_turns {
        args.push("--max-turns".into());
        args.push(turns.to_string());
    }
    if let Some(budget) = config.max_budget_usd {
        args.push("--max-budget-usd".into());
        args.push(budget.to_string());
    }
    if config.include_partial_messages {
        args.push("--include-partial-messages".into());
    }
    if config.no_session_persistence {
        args.push("--no-session-persistence".into());
    }

    if let Some(path) = mcp_config {
        args.push("--mcp-config".into());
        args.push(path.display().to_string());
    }
    for dir in &config.plugin_dirs {
        args.push("--plugin-dir".into());
        args.push(dir.display().to_string());
    }

    if let Some(ref session_id) = config.session_id {
        if config.is_new_session {
            args.push("--session-id".into());
        } else {
            args.push("--resume".into());
        }
        args.push(session_id.clone());
    }

    if let Some(ref model) = config.model {
        args.push("--model".into());
        args.push(model.clone());
    }

    args
}

/// Quote one argument for the platform shell.
pub fn shell_escape(arg: &str) -> String {
    if cfg!(windows) {
        escape_windows(arg)
    } else {
        escape_posix(arg)
    }
}

/// Single-quote wrap; embedded single quotes become `'\''`.
pub fn escape_posix(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Double-quote wrap with doubled embedded quotes. `cmd.exe` treats a
/// literal newline as a command separator, so newlines are dropped.
pub fn escape_windows(arg: &str) -> String {
    let flattened: String = arg
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .collect();
    format!("\"{}\"", flattened.replace('"', "\"\""))
}

/// Full command line for the platform shell, every token quoted.
pub fn build_command_line(program: &Path, args: &[String]) -> String {
    let mut line = shell_escape(&program.display().to_string());
    for arg in args {
        line.push(' ');
        line.push_str(&shell_escape(arg));
    }
    line
}

/// Write the MCP server definitions to a fresh temp file and return its path.
pub fn write_mcp_config(servers: &BTreeMap<String, Value>) -> std::io::Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("flock-mcp-{}.json", uuid::Uuid::new_v4()));
    let body = serde_json::json!({ "mcpServers": servers });
    std::fs::write(&path, serde_json::to_vec_pretty(&body)?)?;
    debug!(path = %path.display(), servers = servers.len(), "Wrote MCP config");
    Ok(path)
}

/// Delete a previously written MCP config file. Missing files are ignored.
pub fn remove_mcp_config(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed MCP config"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove MCP config"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::subprocess::supervisor::AgentMode;

    fn config() -> AgentConfig {
        AgentConfig::new("proj-1", "/tmp/proj", AgentMode::Autonomous)
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn fixed_framing_flags_are_present() {
        let args = build_args(&config(), None);
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"--verbose".to_string()));
        assert_eq!(value_after(&args, "--output-format"), Some("stream-json"));
        assert_eq!(value_after(&args, "--input-format"), Some("stream-json"));
    }

    #[test]
    fn new_session_uses_session_id_flag() {
        let mut cfg = config();
        cfg.session_id = Some("0b7c9a52-7a37-4a8e-9a5e-0d1f3e0c2f11".into());
        cfg.is_new_session = true;
        let args = build_args(&cfg, None);
        assert!(value_after(&args, "--session-id").is_some());
        assert!(!args.contains(&"--resume".to_string()));

        cfg.is_new_session = false;
        let args = build_args(&cfg, None);
        assert!(value_after(&args, "--resume").is_some());
        assert!(!args.contains(&"--session-id".to_string()));
    }

    #[test]
    fn skip_permissions_omits_mode_and_tool_lists() {
        let mut cfg = config();
        cfg.permissions.skip_permissions = true;
        cfg.permissions.allowed_tools = vec!["Read".into()];
        let args = build_args(&cfg, None);
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!args.contains(&"--permission-mode".to_string()));
        assert!(!args.contains(&"--allowedTools".to_string()));
    }

    #[test]
    fn mode_with_tool_lists_space_joined() {
        let mut cfg = config();
        cfg.permissions.permission_mode = "acceptEdits".into();
        cfg.permissions.allowed_tools = vec!["Read".into(), "Bash(git:*)".into()];
        cfg.permissions.disallowed_tools = vec!["WebFetch".into()];
        cfg.permissions.append_system_prompt = Some("Be brief.".into());
        let args = build_args(&cfg, None);
        assert_eq!(value_after(&args, "--permission-mode"), Some("acceptEdits"));
        assert_eq!(value_after(&args, "--allowedTools"), Some("Read Bash(git:*)"));
        assert_eq!(value_after(&args, "--disallowedTools"), Some("WebFetch"));
        assert_eq!(value_after(&args, "--append-system-prompt"), Some("Be brief."));
    }

    #[test]
    fn optional_limits_and_paths() {
        let mut cfg = config();
        cfg.max_turns = Some(12);
        cfg.model = Some("opus".into());
        cfg.plugin_dirs = vec![PathBuf::from("/plugins/a")];
        let args = build_args(&cfg, Some(Path::new("/tmp/mcp.json")));
        assert_eq!(value_after(&args, "--max-turns"), Some("12"));
        assert_eq!(value_after(&args, "--model"), Some("opus"));
        assert_eq!(value_after(&args, "--plugin-dir"), Some("/plugins/a"));
        assert_eq!(value_after(&args, "--mcp-config"), Some("/tmp/mcp.json"));
        assert!(args.contains(&"--include-partial-messages".to_string()));
    }

    #[test]
    fn posix_escaping() {
        assert_eq!(escape_posix("plain"), "'plain'");
        assert_eq!(escape_posix("it's"), r"'it'\''s'");
        assert_eq!(escape_posix("$HOME; rm -rf /"), "'$HOME; rm -rf /'");
    }

    #[test]
    fn windows_escaping() {
        assert_eq!(escape_windows("plain"), "\"plain\"");
        assert_eq!(escape_windows("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_windows("line1\nline2\r\n"), "\"line1line2\"");
    }

    #[test]
    fn mcp_config_round_trip() {
        let mut servers = BTreeMap::new();
        servers.insert(
            "docs".to_string(),
            serde_json::json!({"command": "docs-mcp", "args": ["--stdio"]}),
        );
        let path = write_mcp_config(&servers).unwrap();
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["mcpServers"]["docs"]["command"], "docs-mcp");

        remove_mcp_config(&path);
        assert!(!path.exists());
        // Second removal is silent.
        remove_mcp_config(&path);
    }
}
