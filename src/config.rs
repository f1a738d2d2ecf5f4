//! Layered configuration for the surveyor service.
//!
//! Settings come from `surveyor.toml` (every section optional), with CLI
//! flags overriding the file. Secrets are never stored in the file: the
//! GitHub token and the plan task's scoped credential are read from the
//! environment variables named here.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 1618
//!
//! [store]
//! db_path = ".surveyor/runs.db"
//!
//! [artifacts]
//! root = ".surveyor/artifacts"
//!
//! [classifier]
//! deep_label = "deep-scan"
//! max_changed_files = 10
//! max_additions = 500
//!
//! [fast_pass]
//! tool_timeout_secs = 120
//! aggregate_deadline_secs = 300
//!
//! [deep_pass]
//! image = "surveyor-planner:latest"
//! poll_interval_secs = 10
//! ceiling_secs = 900
//!
//! [github]
//! api_base = "https://api.github.com"
//!
//! [tools]
//! pr-context = "http://tools.internal/pr-context"
//! security-scan = "http://tools.internal/security-scan"
//! cost-estimate = "http://tools.internal/cost-estimate"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 1618;
pub const DEFAULT_DB_PATH: &str = ".surveyor/runs.db";
pub const DEFAULT_ARTIFACT_ROOT: &str = ".surveyor/artifacts";
pub const DEFAULT_DEEP_LABEL: &str = "deep-scan";
pub const DEFAULT_MAX_CHANGED_FILES: u64 = 10;
pub const DEFAULT_MAX_ADDITIONS: u64 = 500;
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_AGGREGATE_DEADLINE_SECS: u64 = 300;
pub const DEFAULT_PLAN_IMAGE: &str = "surveyor-planner:latest";
pub const DEFAULT_LAUNCH_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 200;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_CEILING_SECS: u64 = 900;
pub const DEFAULT_PLAN_ARTIFACT: &str = "plan.json";
pub const DEFAULT_GRACE_SECS: u64 = 60;
pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const PLAN_TOKEN_ENV: &str = "SURVEYOR_PLAN_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Permissive CORS for local dashboards.
    pub dev: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            dev: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub root: PathBuf,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ARTIFACT_ROOT),
        }
    }
}

/// Thresholds for the fast/deep trigger decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub deep_label: String,
    pub max_changed_files: u64,
    pub max_additions: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            deep_label: DEFAULT_DEEP_LABEL.to_string(),
            max_changed_files: DEFAULT_MAX_CHANGED_FILES,
            max_additions: DEFAULT_MAX_ADDITIONS,
        }
    }
}

impl ClassifierConfig {
    pub fn with_max_changed_files(mut self, n: u64) -> Self {
        self.max_changed_files = n;
        self
    }

    pub fn with_max_additions(mut self, n: u64) -> Self {
        self.max_additions = n;
        self
    }
}

/// Deadlines for the bounded parallel tool pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FastPassConfig {
    pub tool_timeout_secs: u64,
    pub aggregate_deadline_secs: u64,
}

impl Default for FastPassConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            aggregate_deadline_secs: DEFAULT_AGGREGATE_DEADLINE_SECS,
        }
    }
}

impl FastPassConfig {
    pub fn with_tool_timeout_secs(mut self, secs: u64) -> Self {
        self.tool_timeout_secs = secs;
        self
    }

    pub fn with_aggregate_deadline_secs(mut self, secs: u64) -> Self {
        self.aggregate_deadline_secs = secs;
        self
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn aggregate_deadline(&self) -> Duration {
        Duration::from_secs(self.aggregate_deadline_secs)
    }
}

/// Launch, supervision, and sandbox settings for the plan task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepPassConfig {
    pub image: String,
    pub memory: String,
    pub cpus: f64,
    pub launch_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub poll_interval_secs: u64,
    pub ceiling_secs: u64,
    pub plan_artifact: String,
}

impl Default for DeepPassConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_PLAN_IMAGE.to_string(),
            memory: "4g".to_string(),
            cpus: 2.0,
            launch_attempts: DEFAULT_LAUNCH_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            ceiling_secs: DEFAULT_CEILING_SECS,
            plan_artifact: DEFAULT_PLAN_ARTIFACT.to_string(),
        }
    }
}

impl DeepPassConfig {
    pub fn with_launch_attempts(mut self, n: u32) -> Self {
        self.launch_attempts = n;
        self
    }

    pub fn with_backoff_base_ms(mut self, ms: u64) -> Self {
        self.backoff_base_ms = ms;
        self
    }

    pub fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    pub fn with_ceiling_secs(mut self, secs: u64) -> Self {
        self.ceiling_secs = secs;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.ceiling_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub api_base: String,
    pub token_env: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_GITHUB_API_BASE.to_string(),
            token_env: GITHUB_TOKEN_ENV.to_string(),
        }
    }
}

impl GitHubConfig {
    pub fn resolve_token(&self) -> Option<String> {
        std::env::var(&self.token_env).ok().filter(|t| !t.is_empty())
    }
}

/// Watchdog slack on top of the per-stage deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub grace_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            grace_secs: DEFAULT_GRACE_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyorConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub artifacts: ArtifactConfig,
    pub classifier: ClassifierConfig,
    pub fast_pass: FastPassConfig,
    pub deep_pass: DeepPassConfig,
    pub github: GitHubConfig,
    pub run: RunConfig,
    /// Tool name -> HTTP endpoint. Empty means no tools are registered.
    pub tools: HashMap<String, String>,
}

impl SurveyorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load `surveyor.toml` from the given directory, or defaults if absent.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join("surveyor.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Ceiling for a whole run: both passes plus reconcile slack. The
    /// watchdog forces a terminal state past this point.
    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(
            self.fast_pass.aggregate_deadline_secs
                + self.deep_pass.ceiling_secs
                + self.run.grace_secs,
        )
    }

    /// Annotated starter config written by `surveyor init`.
    pub fn default_toml() -> &'static str {
        r#"# surveyor configuration

[server]
port = 1618

[store]
db_path = ".surveyor/runs.db"

[artifacts]
root = ".surveyor/artifacts"

[classifier]
deep_label = "deep-scan"
max_changed_files = 10
max_additions = 500

[fast_pass]
tool_timeout_secs = 120
aggregate_deadline_secs = 300

[deep_pass]
image = "surveyor-planner:latest"
memory = "4g"
cpus = 2.0
launch_attempts = 3
backoff_base_ms = 200
backoff_factor = 2.0
poll_interval_secs = 10
ceiling_secs = 900
plan_artifact = "plan.json"

[github]
api_base = "https://api.github.com"
token_env = "GITHUB_TOKEN"

# Tool name -> endpoint. Uncomment and point at your tool processes.
# [tools]
# pr-context = "http://localhost:8701/invoke"
# security-scan = "http://localhost:8702/invoke"
# cost-estimate = "http://localhost:8703/invoke"
# cost-deep = "http://localhost:8704/invoke"
# compliance-check = "http://localhost:8705/invoke"
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = SurveyorConfig::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.classifier.deep_label, "deep-scan");
        assert_eq!(config.classifier.max_changed_files, 10);
        assert_eq!(config.classifier.max_additions, 500);
        assert_eq!(config.deep_pass.poll_interval_secs, 10);
        assert_eq!(config.deep_pass.ceiling_secs, 900);
        assert_eq!(config.deep_pass.plan_artifact, "plan.json");
        assert!(config.tools.is_empty());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SurveyorConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("surveyor.toml"),
            r#"
[classifier]
max_changed_files = 25

[tools]
security-scan = "http://localhost:9000/invoke"
"#,
        )
        .unwrap();

        let config = SurveyorConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.classifier.max_changed_files, 25);
        // untouched sections keep their defaults
        assert_eq!(config.classifier.max_additions, DEFAULT_MAX_ADDITIONS);
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(
            config.tools.get("security-scan").map(String::as_str),
            Some("http://localhost:9000/invoke")
        );
    }

    #[test]
    fn test_default_toml_parses() {
        let config: SurveyorConfig = toml::from_str(SurveyorConfig::default_toml()).unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.deep_pass.launch_attempts, DEFAULT_LAUNCH_ATTEMPTS);
    }

    #[test]
    fn test_run_deadline_sums_stages() {
        let config = SurveyorConfig::default();
        assert_eq!(
            config.run_deadline(),
            Duration::from_secs(300 + 900 + DEFAULT_GRACE_SECS)
        );
    }

    #[test]
    fn test_builders() {
        let fp = FastPassConfig::default()
            .with_tool_timeout_secs(5)
            .with_aggregate_deadline_secs(10);
        assert_eq!(fp.tool_timeout(), Duration::from_secs(5));
        assert_eq!(fp.aggregate_deadline(), Duration::from_secs(10));

        let dp = DeepPassConfig::default()
            .with_launch_attempts(1)
            .with_poll_interval_secs(1)
            .with_ceiling_secs(2);
        assert_eq!(dp.launch_attempts, 1);
        assert_eq!(dp.ceiling(), Duration::from_secs(2));
    }
}
