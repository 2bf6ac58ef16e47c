//! Runtime configuration for the YokeFlow engine.
//!
//! Loaded from `yokeflow.toml` in the data directory, with every key
//! optional and falling back to the documented default. Sections mirror the
//! recognized configuration keys: models, timing, review, epic_testing,
//! epic_retesting, sandbox, security, agent.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YokeConfig {
    /// Directory holding the database, project workspaces, and logs.
    pub data_dir: PathBuf,
    /// SQLite URL; relative paths are resolved under `data_dir`.
    pub database_url: String,
    pub models: ModelsConfig,
    pub timing: TimingConfig,
    pub review: ReviewConfig,
    pub epic_testing: EpicTestingConfig,
    pub epic_retesting: EpicRetestingConfig,
    pub sandbox: SandboxConfig,
    pub security: SecurityConfig,
    pub agent: AgentConfig,
}

impl Default for YokeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".yokeflow"),
            database_url: "sqlite:yokeflow.db".to_string(),
            models: ModelsConfig::default(),
            timing: TimingConfig::default(),
            review: ReviewConfig::default(),
            epic_testing: EpicTestingConfig::default(),
            epic_retesting: EpicRetestingConfig::default(),
            sandbox: SandboxConfig::default(),
            security: SecurityConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

/// Opaque model identifiers handed to the Agent Runner per session type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub initializer: String,
    pub coding: String,
    pub review: String,
    pub prompt_improvement: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            initializer: "default".to_string(),
            coding: "default".to_string(),
            review: "default".to_string(),
            prompt_improvement: "default".to_string(),
        }
    }
}

impl ModelsConfig {
    pub fn for_session_type(&self, session_type: &str) -> &str {
        match session_type {
            "initializer" => &self.initializer,
            "review" => &self.review,
            _ => &self.coding,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between a completed session and the next auto-continued one.
    pub auto_continue_delay_seconds: u64,
    /// Periodic checkpoint interval during a session.
    pub checkpoint_interval_seconds: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            auto_continue_delay_seconds: 3,
            checkpoint_interval_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub min_reviews_for_analysis: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            min_reviews_for_analysis: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicTestingMode {
    Strict,
    Autonomous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpicTestingConfig {
    pub mode: EpicTestingMode,
    /// Name substrings marking epics whose tests always gate completion.
    pub critical_epics: Vec<String>,
    /// Failed repeats of the same tool invocation tolerated before a pause.
    pub auto_failure_tolerance: u32,
    /// Quality violations tolerated in a session before a pause.
    pub quality_violation_threshold: u32,
}

impl Default for EpicTestingConfig {
    fn default() -> Self {
        Self {
            mode: EpicTestingMode::Strict,
            critical_epics: Vec::new(),
            auto_failure_tolerance: 3,
            quality_violation_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpicRetestingConfig {
    pub enabled: bool,
    /// Re-test selection runs after every this many completed epics.
    pub trigger_frequency: u32,
    /// A foundation epic not retested for this many days counts as stale.
    pub foundation_retest_days: i64,
    pub max_retests_per_trigger: usize,
    /// Window of recent retests folded into the stability EMA.
    pub stability_window: usize,
}

impl Default for EpicRetestingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_frequency: 2,
            foundation_retest_days: 7,
            max_retests_per_trigger: 2,
            stability_window: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    None,
    Container,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    #[serde(rename = "type")]
    pub kind: SandboxKind,
    pub memory_limit: String,
    pub cpu_limit: f64,
    pub image: String,
    /// Per-call exec timeout when the agent does not specify one.
    pub default_timeout_seconds: u64,
    /// Upper bound on agent-requested exec timeouts.
    pub max_timeout_seconds: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            kind: SandboxKind::Container,
            memory_limit: "3g".to_string(),
            cpu_limit: 2.0,
            image: "yokeflow/workspace:latest".to_string(),
            default_timeout_seconds: 120,
            max_timeout_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Extra program names rejected by the sandbox blocklist.
    pub additional_blocked_commands: Vec<String>,
}

/// How to spawn the external Agent Runner process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
            ],
        }
    }
}

impl YokeConfig {
    /// Load configuration from `<dir>/yokeflow.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("yokeflow.toml");
        if !path.exists() {
            let mut config = Self::default();
            config.data_dir = dir.to_path_buf();
            return Ok(config);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        if config.data_dir == PathBuf::from(".yokeflow") {
            config.data_dir = dir.to_path_buf();
        }
        Ok(config)
    }

    /// Absolute database URL, resolving relative sqlite paths under data_dir.
    pub fn resolved_database_url(&self) -> String {
        match self.database_url.strip_prefix("sqlite:") {
            Some(rest) if !rest.starts_with('/') && rest != ":memory:" => {
                format!("sqlite:{}", self.data_dir.join(rest).display())
            }
            _ => self.database_url.clone(),
        }
    }

    /// Directory holding per-project workspaces.
    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_dir.join("workspaces")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).context("Failed to create data directory")?;
        std::fs::create_dir_all(self.workspaces_dir())
            .context("Failed to create workspaces directory")?;
        std::fs::create_dir_all(self.data_dir.join("logs"))
            .context("Failed to create log directory")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = YokeConfig::default();
        assert_eq!(config.timing.auto_continue_delay_seconds, 3);
        assert_eq!(config.review.min_reviews_for_analysis, 5);
        assert_eq!(config.epic_testing.auto_failure_tolerance, 3);
        assert_eq!(config.epic_retesting.trigger_frequency, 2);
        assert_eq!(config.epic_retesting.foundation_retest_days, 7);
        assert_eq!(config.epic_retesting.max_retests_per_trigger, 2);
        assert_eq!(config.sandbox.kind, SandboxKind::Container);
        assert_eq!(config.sandbox.memory_limit, "3g");
        assert_eq!(config.sandbox.default_timeout_seconds, 120);
        assert!(config.security.additional_blocked_commands.is_empty());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = YokeConfig::load(dir.path()).unwrap();
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.epic_testing.mode, EpicTestingMode::Strict);
    }

    #[test]
    fn test_load_partial_file_overlays_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("yokeflow.toml"),
            r#"
[timing]
auto_continue_delay_seconds = 10

[epic_retesting]
trigger_frequency = 4

[sandbox]
type = "none"
memory_limit = "1g"

[security]
additional_blocked_commands = ["nc"]
"#,
        )
        .unwrap();

        let config = YokeConfig::load(dir.path()).unwrap();
        assert_eq!(config.timing.auto_continue_delay_seconds, 10);
        assert_eq!(config.timing.checkpoint_interval_seconds, 120); // default
        assert_eq!(config.epic_retesting.trigger_frequency, 4);
        assert_eq!(config.epic_retesting.foundation_retest_days, 7); // default
        assert_eq!(config.sandbox.kind, SandboxKind::None);
        assert_eq!(config.sandbox.memory_limit, "1g");
        assert_eq!(config.security.additional_blocked_commands, vec!["nc"]);
    }

    #[test]
    fn test_load_invalid_toml_errors() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("yokeflow.toml"), "not valid {{{{").unwrap();
        assert!(YokeConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_resolved_database_url_keeps_memory_and_absolute() {
        let mut config = YokeConfig::default();
        config.database_url = "sqlite::memory:".to_string();
        assert_eq!(config.resolved_database_url(), "sqlite::memory:");

        config.database_url = "sqlite:/var/lib/yokeflow.db".to_string();
        assert_eq!(config.resolved_database_url(), "sqlite:/var/lib/yokeflow.db");
    }

    #[test]
    fn test_resolved_database_url_anchors_relative_paths() {
        let mut config = YokeConfig::default();
        config.data_dir = PathBuf::from("/data");
        config.database_url = "sqlite:yokeflow.db".to_string();
        assert_eq!(config.resolved_database_url(), "sqlite:/data/yokeflow.db");
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = YokeConfig::load(dir.path()).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.workspaces_dir().exists());
        assert!(config.data_dir.join("logs").exists());
    }

    #[test]
    fn test_models_for_session_type() {
        let mut models = ModelsConfig::default();
        models.initializer = "init-model".to_string();
        models.coding = "code-model".to_string();
        assert_eq!(models.for_session_type("initializer"), "init-model");
        assert_eq!(models.for_session_type("coding"), "code-model");
        assert_eq!(models.for_session_type("retest"), "code-model");
    }
}
