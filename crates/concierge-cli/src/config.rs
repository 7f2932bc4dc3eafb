use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use concierge_core::completion::DEFAULT_MODEL;
use concierge_core::orchestrator::OrchestratorConfig;
use concierge_core::types::AgentConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConciergeConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    pub completion: CompletionConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

// ── Completion ──────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_provider_name")]
    pub name: String,
    #[serde(default = "default_completion_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,
    /// Attempts per provider before moving to the next one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backup providers tried in order when the primary fails
    #[serde(default)]
    pub failover: Vec<FailoverProviderConfig>,
}

impl std::fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &mask_secret(&self.api_key))
            .field("default_model", &self.default_model)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("failover", &self.failover)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct FailoverProviderConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

impl std::fmt::Debug for FailoverProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverProviderConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &mask_secret(&self.api_key))
            .finish()
    }
}

fn default_provider_name() -> String {
    "openai".to_string()
}
fn default_completion_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}
fn default_completion_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    2
}

// ── Delivery ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryKind {
    Webhook,
    #[default]
    Log,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub kind: DeliveryKind,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for DeliveryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryConfig")
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("token", &mask_secret(&self.token))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn default_delivery_timeout() -> u64 {
    15
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            kind: DeliveryKind::default(),
            url: String::new(),
            token: String::new(),
            timeout_secs: default_delivery_timeout(),
        }
    }
}

// ── Store / dispatch / memory ───────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "~/.concierge/concierge.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// How often `start` looks for pending messages
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_queue_size() -> usize {
    256
}
fn default_max_concurrent() -> usize {
    10
}
fn default_poll_interval() -> u64 {
    5
}
fn default_batch_size() -> usize {
    50
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            max_concurrent: default_max_concurrent(),
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_memory_results")]
    pub max_results: usize,
}

fn default_true() -> bool {
    true
}
fn default_memory_results() -> usize {
    5
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_results: default_memory_results(),
        }
    }
}

// ── Agents file ─────────────────────────────────────────────────

/// `[[agents]]` tables as written by hand
#[derive(Debug, Deserialize)]
struct AgentsFile {
    #[serde(default)]
    agents: Vec<AgentConfig>,
}

/// Parse an agents TOML file
pub fn load_agents_file(path: &Path) -> Result<Vec<AgentConfig>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read agents file {}", path.display()))?;
    let file: AgentsFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse agents file {}", path.display()))?;
    Ok(file.agents)
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".concierge")
}

/// Expand a leading `~/`
pub fn expand_home(s: &str) -> PathBuf {
    match (s.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(s),
    }
}

impl ConciergeConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // Refuse to start if group or other can read
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `concierge init` first.",
                path.display()
            )
        })?;

        Self::parse(&content).with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        // Check the raw text so `${VAR}` references don't trip the warning
        let raw: Self = toml::from_str(content)?;
        if raw.completion.api_key.starts_with("sk-") {
            warn!(
                "Completion API key is hardcoded in config file. For security, use environment variables: api_key = \"${{OPENAI_API_KEY}}\""
            );
        }
        if !raw.delivery.token.is_empty() && !raw.delivery.token.contains("${") {
            warn!(
                "Delivery token is hardcoded in config file. For security, use environment variables: token = \"${{CONCIERGE_WEBHOOK_TOKEN}}\""
            );
        }

        let config: Self = toml::from_str(&expand_env_vars(content))?;
        Ok(config)
    }

    /// Copy safe to print
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.completion.api_key = mask_secret(&copy.completion.api_key);
        for provider in &mut copy.completion.failover {
            provider.api_key = mask_secret(&provider.api_key);
        }
        copy.delivery.token = mask_secret(&copy.delivery.token);
        copy
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
/// This prevents an attacker who can modify the config from reading arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &[
    "OPENAI_API_KEY",
    "GROQ_API_KEY",
    "TOGETHER_API_KEY",
    "CUSTOM_LLM_API_KEY",
    "CONCIERGE_WEBHOOK_URL",
    "CONCIERGE_WEBHOOK_TOKEN",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

    #[test]
    fn test_default_config_parses() {
        let config = ConciergeConfig::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.orchestrator.max_agent_iterations, 5);
        assert_eq!(config.completion.default_model, DEFAULT_MODEL);
        assert_eq!(config.delivery.kind, DeliveryKind::Log);
        assert!(config.memory.enabled);
        assert_eq!(config.dispatch.max_concurrent, 10);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ConciergeConfig::parse("[completion]\n").unwrap();
        assert_eq!(config.completion.base_url, "https://api.openai.com");
        assert_eq!(config.store.path, "~/.concierge/concierge.db");
        assert!(config.orchestrator.fallback_agent_id.is_none());
        assert!(config.orchestrator.save_responses);
    }

    #[test]
    fn test_orchestrator_overrides() {
        let config = ConciergeConfig::parse(
            "[orchestrator]\nmax_agent_iterations = 3\nfallback_agent_id = \"general\"\n\n[completion]\n",
        )
        .unwrap();
        assert_eq!(config.orchestrator.max_agent_iterations, 3);
        assert_eq!(config.orchestrator.fallback_agent_id.as_deref(), Some("general"));
        assert_eq!(config.orchestrator.history_limit, 10);
    }

    #[test]
    fn test_unlisted_env_var_left_alone() {
        let expanded = expand_env_vars("key = \"${PATH}\"");
        assert_eq!(expanded, "key = \"${PATH}\"");
    }

    #[test]
    fn test_allowlisted_env_var_expanded() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(expand_env_vars("dir = \"${HOME}/x\""), format!("dir = \"{}/x\"", home));
        assert_eq!(expand_env_vars("a = \"${HOME\""), "a = \"${HOME\"");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "(empty)");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("sk-abcdefghijkl"), "sk-...ijkl");
    }

    #[test]
    fn test_debug_and_redacted_hide_secrets() {
        let mut config = ConciergeConfig::parse("[completion]\n").unwrap();
        config.completion.api_key = "sk-verysecretkey".to_string();
        config.delivery.token = "webhook-token-123".to_string();

        let debug = format!("{:?}", config);
        assert!(!debug.contains("verysecret"));
        assert!(!debug.contains("webhook-token-123"));

        let printed = toml::to_string_pretty(&config.redacted()).unwrap();
        assert!(!printed.contains("verysecret"));
        assert!(printed.contains("sk-...tkey"));
    }

    #[test]
    fn test_agents_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.toml");
        std::fs::write(&path, include_str!("../../../config/agents.example.toml")).unwrap();

        let agents = load_agents_file(&path).unwrap();
        assert!(agents.iter().any(|a| a.id == "rules"));
        let rules = agents.iter().find(|a| a.id == "rules").unwrap();
        assert!(rules.config["rules"].is_array());
    }

    #[cfg(unix)]
    #[test]
    fn test_permissive_config_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[completion]\n").unwrap();

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(ConciergeConfig::load(&Some(path.clone())).is_err());

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert!(ConciergeConfig::load(&Some(path)).is_ok());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/tmp/db"), PathBuf::from("/tmp/db"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/x.db"), home.join("x.db"));
        }
    }
}
