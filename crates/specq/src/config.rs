//! Three-layer configuration: team file, personal override, environment.
//!
//! Layer 1 `.specq/config.yaml` is deep-merged with layer 2
//! `.specq/local.config.yaml` (field-level; lists replace wholesale,
//! `null` is ignored), then layer 3 environment variables override
//! provider API keys only — highest priority, never written back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use specq_types::{ModelRef, Risk, RiskPolicy, VerificationStrategy};

use crate::scanner::default_changes_dir;

pub const CONFIG_FILE: &str = "config.yaml";
pub const LOCAL_CONFIG_FILE: &str = "local.config.yaml";
pub const CONFIG_DIR: &str = ".specq";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub changes_dir: Option<PathBuf>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    pub compiler: CompilerConfig,
    pub executor: ExecutorConfig,
    pub verification: VerificationConfig,
    pub risk_policy: RiskPolicy,
    pub budgets: BudgetsConfig,
    pub notify: NotifyConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
}

fn default_base_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    #[serde(rename = "type")]
    pub executor_type: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub voters: Vec<ModelRef>,
    pub checks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetsConfig {
    pub max_retries: u32,
    pub max_duration_sec: u64,
    pub max_turns: u32,
    pub daily_task_limit: Option<u32>,
}

impl Default for BudgetsConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_duration_sec: 600,
            max_turns: 20,
            daily_task_limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub events: Vec<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
}

/// Provider name -> environment variable name, used for the final
/// (highest-precedence) layer.
const PROVIDER_ENV_VARS: &[(&str, &str)] = &[
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("openai", "OPENAI_API_KEY"),
    ("google", "GOOGLE_API_KEY"),
    ("glm", "GLM_API_KEY"),
    ("deepseek", "DEEPSEEK_API_KEY"),
];

/// Load and merge all three layers rooted at `project_root`.
pub fn load_config(project_root: &Path) -> Result<Config> {
    load_config_with_env(project_root, |name| std::env::var(name).ok())
}

/// Same as [`load_config`] but with an injectable env lookup, so tests
/// don't need to mutate process-global environment variables.
pub fn load_config_with_env(project_root: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let dir = project_root.join(CONFIG_DIR);
    let team = read_yaml_layer(&dir.join(CONFIG_FILE))?;
    let personal = read_yaml_layer(&dir.join(LOCAL_CONFIG_FILE))?;

    let merged = match (team, personal) {
        (Some(team), Some(personal)) => merge_yaml(team, personal),
        (Some(team), None) => team,
        (None, Some(personal)) => personal,
        (None, None) => serde_yaml::Value::Mapping(Default::default()),
    };

    let mut config: Config = serde_yaml::from_value(merged).context("failed to parse merged config")?;

    if config.changes_dir.is_none() {
        config.changes_dir = Some(default_changes_dir(project_root));
    }

    for (provider, var) in PROVIDER_ENV_VARS {
        if let Some(key) = env(var) {
            config
                .providers
                .entry((*provider).to_string())
                .or_default()
                .api_key = Some(key);
        }
    }

    Ok(config)
}

fn read_yaml_layer(path: &Path) -> Result<Option<serde_yaml::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read config file: {}", path.display()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(Some(value))
}

/// Recursive deep merge: `override_value` wins field-by-field. Mappings
/// merge key by key; any other value (including sequences) replaces
/// wholesale. A `null` in `override_value` leaves the base untouched.
fn merge_yaml(base: serde_yaml::Value, override_value: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;

    match (base, override_value) {
        (Value::Mapping(mut base_map), Value::Mapping(override_map)) => {
            for (key, override_val) in override_map {
                if override_val.is_null() {
                    continue;
                }
                let merged = match base_map.remove(&key) {
                    Some(base_val) => merge_yaml(base_val, override_val),
                    None => override_val,
                };
                base_map.insert(key, merged);
            }
            Value::Mapping(base_map)
        }
        (_, override_value) if override_value.is_null() => Value::Null,
        (_, override_value) => override_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn missing_config_falls_back_to_defaults_with_detected_changes_dir() {
        let td = tempdir().unwrap();
        let config = load_config_with_env(td.path(), |_| None).unwrap();
        assert_eq!(config.base_branch, "main");
        assert_eq!(config.budgets.max_retries, 3);
        assert_eq!(config.changes_dir, Some(td.path().join("changes")));
    }

    #[test]
    fn team_layer_alone_is_honored() {
        let td = tempdir().unwrap();
        write(
            &td.path().join(CONFIG_DIR),
            CONFIG_FILE,
            "base_branch: develop\nbudgets:\n  max_retries: 5\n",
        );
        let config = load_config_with_env(td.path(), |_| None).unwrap();
        assert_eq!(config.base_branch, "develop");
        assert_eq!(config.budgets.max_retries, 5);
    }

    #[test]
    fn local_layer_overrides_team_layer_field_by_field() {
        let td = tempdir().unwrap();
        write(
            &td.path().join(CONFIG_DIR),
            CONFIG_FILE,
            "base_branch: develop\nbudgets:\n  max_retries: 5\n  max_duration_sec: 900\n",
        );
        write(
            &td.path().join(CONFIG_DIR),
            LOCAL_CONFIG_FILE,
            "budgets:\n  max_retries: 8\n",
        );
        let config = load_config_with_env(td.path(), |_| None).unwrap();
        assert_eq!(config.base_branch, "develop");
        assert_eq!(config.budgets.max_retries, 8);
        assert_eq!(config.budgets.max_duration_sec, 900);
    }

    #[test]
    fn lists_replace_wholesale_rather_than_concatenating() {
        let td = tempdir().unwrap();
        write(
            &td.path().join(CONFIG_DIR),
            CONFIG_FILE,
            "verification:\n  voters:\n    - anthropic/claude\n    - openai/gpt\n",
        );
        write(
            &td.path().join(CONFIG_DIR),
            LOCAL_CONFIG_FILE,
            "verification:\n  voters:\n    - google/gemini\n",
        );
        let config = load_config_with_env(td.path(), |_| None).unwrap();
        assert_eq!(config.verification.voters, vec!["google/gemini".to_string()]);
    }

    #[test]
    fn env_vars_override_provider_api_keys_with_highest_precedence() {
        let td = tempdir().unwrap();
        write(
            &td.path().join(CONFIG_DIR),
            CONFIG_FILE,
            "providers:\n  anthropic:\n    api_key: from-file\n",
        );
        let config = load_config_with_env(td.path(), |name| {
            (name == "ANTHROPIC_API_KEY").then(|| "from-env".to_string())
        })
        .unwrap();
        assert_eq!(config.providers["anthropic"].api_key, Some("from-env".to_string()));
    }

    #[test]
    fn explicit_changes_dir_is_not_overridden_by_auto_detection() {
        let td = tempdir().unwrap();
        write(&td.path().join(CONFIG_DIR), CONFIG_FILE, "changes_dir: /tmp/custom-changes\n");
        let config = load_config_with_env(td.path(), |_| None).unwrap();
        assert_eq!(config.changes_dir, Some(PathBuf::from("/tmp/custom-changes")));
    }

    #[test]
    fn malformed_yaml_is_a_configuration_error() {
        let td = tempdir().unwrap();
        write(&td.path().join(CONFIG_DIR), CONFIG_FILE, "not: [valid: yaml");
        assert!(load_config_with_env(td.path(), |_| None).is_err());
    }

    #[test]
    fn risk_policy_round_trips_through_yaml() {
        let td = tempdir().unwrap();
        write(
            &td.path().join(CONFIG_DIR),
            CONFIG_FILE,
            "risk_policy:\n  low: skip\n  medium: unanimous\n  high: unanimous\n",
        );
        let config = load_config_with_env(td.path(), |_| None).unwrap();
        assert_eq!(config.risk_policy.strategy_for(Risk::Medium), VerificationStrategy::Unanimous);
    }
}
