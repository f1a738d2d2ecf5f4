use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Composite key for one analysis attempt: a specific commit on a specific PR.
/// Immutable once created; every store row, artifact path, and log line is
/// keyed off this triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunIdentity {
    pub owner_repo: String,
    pub pr_number: i64,
    pub commit_sha: String,
}

impl RunIdentity {
    pub fn new(
        owner_repo: impl Into<String>,
        pr_number: i64,
        commit_sha: impl Into<String>,
    ) -> Self {
        Self {
            owner_repo: owner_repo.into(),
            pr_number,
            commit_sha: commit_sha.into(),
        }
    }

    /// The `owner` half of `owner/repo`, or the whole string if no slash.
    pub fn owner(&self) -> &str {
        self.owner_repo
            .split_once('/')
            .map(|(o, _)| o)
            .unwrap_or(&self.owner_repo)
    }

    /// The `repo` half of `owner/repo`, or the whole string if no slash.
    pub fn repo(&self) -> &str {
        self.owner_repo
            .split_once('/')
            .map(|(_, r)| r)
            .unwrap_or(&self.owner_repo)
    }

    /// Abbreviated commit for logs and report bodies. Truncates on a char
    /// boundary so an ill-formed sha never panics the formatter.
    pub fn sha_short(&self) -> &str {
        match self.commit_sha.char_indices().nth(12) {
            Some((end, _)) => &self.commit_sha[..end],
            None => &self.commit_sha,
        }
    }
}

impl std::fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{}@{}",
            self.owner_repo,
            self.pr_number,
            self.sha_short()
        )
    }
}

/// Lifecycle status of a Run. Transitions are monotonic; the last three
/// variants are terminal and immutable once written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    RunningFast,
    RunningDeep,
    Completed,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::RunningFast => "running_fast",
            Self::RunningDeep => "running_deep",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Forward-only transition table. Terminal states have no successors,
    /// which is what makes them immutable at the store layer.
    pub fn can_transition_to(&self, next: &RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, RunningFast)
                | (Pending, Failed)
                | (Pending, TimedOut)
                | (RunningFast, RunningDeep)
                | (RunningFast, Completed)
                | (RunningFast, Failed)
                | (RunningFast, TimedOut)
                | (RunningDeep, Completed)
                | (RunningDeep, Failed)
                | (RunningDeep, TimedOut)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running_fast" => Ok(Self::RunningFast),
            "running_deep" => Ok(Self::RunningDeep),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// How deeply a PR gets analyzed: fast is the bounded parallel tool pass,
/// deep additionally executes a full plan in an isolated sandbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisDepth {
    Fast,
    Deep,
}

impl AnalysisDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Deep => "deep",
        }
    }
}

impl std::fmt::Display for AnalysisDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisDepth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(Self::Fast),
            "deep" => Ok(Self::Deep),
            _ => Err(format!("Invalid analysis depth: {}", s)),
        }
    }
}

/// Terminal status of a single tool invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Failed,
    TimedOut,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            _ => Err(format!("Invalid tool status: {}", s)),
        }
    }
}

/// Security finding counts by severity, aggregated from the static scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FindingsSummary {
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl FindingsSummary {
    pub fn total(&self) -> u32 {
        self.high + self.medium + self.low
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estimated monthly cost delta for the change, with how much the estimate
/// can be trusted (plan-backed estimates are high confidence, heuristic
/// ones are not).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostSummary {
    pub monthly_delta_usd: f64,
    pub confidence: Confidence,
}

/// One analysis attempt as recorded in the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub owner_repo: String,
    pub pr_number: i64,
    pub commit_sha: String,
    pub status: RunStatus,
    pub run_type: AnalysisDepth,
    pub created_at: String,
    pub updated_at: String,
    pub duration_ms: Option<i64>,
    pub findings_summary: Option<FindingsSummary>,
    pub cost_summary: Option<CostSummary>,
    pub artifact_root: Option<String>,
    pub error: Option<String>,
    pub partial: bool,
}

impl Run {
    pub fn identity(&self) -> RunIdentity {
        RunIdentity::new(self.owner_repo.clone(), self.pr_number, self.commit_sha.clone())
    }
}

/// One call to an external analysis tool, owned by the Run that made it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: i64,
    pub owner_repo: String,
    pub pr_number: i64,
    pub commit_sha: String,
    pub tool_name: String,
    pub input_digest: String,
    pub status: ToolStatus,
    pub output_ref: Option<String>,
    pub error_detail: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: String,
}

/// A PR event as delivered by the (already signature-verified) webhook
/// intake. Delivery is at-least-once; duplicates are collapsed at admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub repository: String,
    pub pr_number: i64,
    pub commit_sha: String,
    #[serde(default)]
    pub changed_files_count: u64,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl WebhookEvent {
    pub fn identity(&self) -> RunIdentity {
        RunIdentity::new(self.repository.clone(), self.pr_number, self.commit_sha.clone())
    }

    /// Rejects events that cannot form a usable run identity.
    pub fn validate(&self) -> Result<(), String> {
        if !self.repository.contains('/') {
            return Err(format!("Invalid repository (want owner/repo): {}", self.repository));
        }
        if self.pr_number <= 0 {
            return Err(format!("Invalid pr_number: {}", self.pr_number));
        }
        if self.commit_sha.is_empty() {
            return Err("Empty commit_sha".to_string());
        }
        if !self.commit_sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("Invalid commit_sha (want hex): {}", self.commit_sha));
        }
        Ok(())
    }
}
