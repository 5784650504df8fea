//! Reference settings, permission and instruction policies.

use std::sync::{Arc, RwLock};

use flock_core::config::Config;

use super::{
    InstructionGenerator, PermissionArgsGenerator, PermissionOverrides, Project,
    SettingsProvider,
};
use crate::subprocess::PermissionArgs;

/// Permission mode that always wins over a skip request.
pub const PLAN_MODE: &str = "plan";

/// Settings held in memory and replaceable at runtime.
#[derive(Debug, Clone, Default)]
pub struct ConfigSettings {
    config: Arc<RwLock<Config>>,
}

impl ConfigSettings {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub fn replace(&self, config: Config) {
        *self
            .config
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = config;
    }
}

impl SettingsProvider for ConfigSettings {
    fn get(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

/// Settings defaults, then overrides. An effective `plan` mode disables
/// `skip_permissions` so a plan-mode restart actually plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPermissionArgs;

impl PermissionArgsGenerator for DefaultPermissionArgs {
    fn generate_args(&self, settings: &Config, overrides: &PermissionOverrides) -> PermissionArgs {
        let perms = &settings.permissions;
        let permission_mode = overrides
            .permission_mode
            .clone()
            .unwrap_or_else(|| perms.default_mode.clone());
        let skip_permissions = overrides
            .skip_permissions
            .unwrap_or(perms.skip_permissions)
            && permission_mode != PLAN_MODE;

        PermissionArgs {
            skip_permissions,
            permission_mode,
            allowed_tools: perms.allowed_tools.clone(),
            disallowed_tools: perms.disallowed_tools.clone(),
            append_system_prompt: perms.append_system_prompt.clone(),
        }
    }
}

/// Prefixes the caller's instructions with the project context.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultInstructions;

impl InstructionGenerator for DefaultInstructions {
    fn generate(&self, project: &Project, instructions: &str) -> String {
        format!(
            "You are working autonomously on the project \"{}\" located at {}.\n\
             Complete the following task without asking for confirmation:\n\n{}",
            project.name,
            project.path.display(),
            instructions.trim()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(skip: bool, mode: &str) -> Config {
        let mut config = Config::default();
        config.permissions.skip_permissions = skip;
        config.permissions.default_mode = mode.to_string();
        config
    }

    #[test]
    fn skip_applies_outside_plan_mode() {
        let args = DefaultPermissionArgs
            .generate_args(&settings(true, "default"), &PermissionOverrides::default());
        assert!(args.skip_permissions);
    }

    #[test]
    fn plan_default_mode_wins_over_skip() {
        let args = DefaultPermissionArgs
            .generate_args(&settings(true, "plan"), &PermissionOverrides::default());
        assert!(!args.skip_permissions);
        assert_eq!(args.permission_mode, "plan");
    }

    #[test]
    fn plan_override_wins_over_skip() {
        let overrides = PermissionOverrides {
            permission_mode: Some("plan".into()),
            skip_permissions: None,
        };
        let args = DefaultPermissionArgs.generate_args(&settings(true, "default"), &overrides);
        assert!(!args.skip_permissions);
        assert_eq!(args.permission_mode, "plan");
    }

    #[test]
    fn skip_override_beats_settings() {
        let overrides = PermissionOverrides {
            permission_mode: None,
            skip_permissions: Some(false),
        };
        let args = DefaultPermissionArgs.generate_args(&settings(true, "default"), &overrides);
        assert!(!args.skip_permissions);
    }

    #[test]
    fn instructions_mention_project() {
        let project = Project::new("p1", "demo", "/work/demo");
        let prompt = DefaultInstructions.generate(&project, "  fix the build \n");
        assert!(prompt.contains("\"demo\""));
        assert!(prompt.ends_with("fix the build"));
    }

    #[test]
    fn settings_replace_is_visible() {
        let provider = ConfigSettings::new(Config::default());
        let mut next = Config::default();
        next.daemon.max_concurrent_agents = 9;
        provider.replace(next);
        assert_eq!(provider.get().daemon.max_concurrent_agents, 9);
    }
}
