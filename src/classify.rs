//! Trigger classifier: decides fast vs deep analysis for an incoming event.
//!
//! Pure and total. Precedence is fixed: an explicit deep-scan label wins,
//! then size thresholds, then the fast default. First match decides.

use crate::config::ClassifierConfig;
use crate::models::{AnalysisDepth, WebhookEvent};

/// Why the classifier picked a depth. Carried into logs and the report
/// header so reviewers can see what triggered a deep scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerReason {
    DeepLabel { label: String },
    ChangedFiles { count: u64, threshold: u64 },
    Additions { count: u64, threshold: u64 },
    WithinThresholds,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerReason::DeepLabel { label } => {
                write!(f, "'{}' label present", label)
            }
            TriggerReason::ChangedFiles { count, threshold } => {
                write!(f, "{} changed files (threshold {})", count, threshold)
            }
            TriggerReason::Additions { count, threshold } => {
                write!(f, "{} added lines (threshold {})", count, threshold)
            }
            TriggerReason::WithinThresholds => write!(f, "within fast-pass thresholds"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub depth: AnalysisDepth,
    pub reason: TriggerReason,
}

/// Classify an event against the configured label and size thresholds.
/// Labels compare case-insensitively, matching how GitHub treats them.
pub fn classify(event: &WebhookEvent, config: &ClassifierConfig) -> Classification {
    if let Some(label) = event
        .labels
        .iter()
        .find(|l| l.eq_ignore_ascii_case(&config.deep_label))
    {
        return Classification {
            depth: AnalysisDepth::Deep,
            reason: TriggerReason::DeepLabel {
                label: label.clone(),
            },
        };
    }
    if event.changed_files_count > config.max_changed_files {
        return Classification {
            depth: AnalysisDepth::Deep,
            reason: TriggerReason::ChangedFiles {
                count: event.changed_files_count,
                threshold: config.max_changed_files,
            },
        };
    }
    if event.additions > config.max_additions {
        return Classification {
            depth: AnalysisDepth::Deep,
            reason: TriggerReason::Additions {
                count: event.additions,
                threshold: config.max_additions,
            },
        };
    }
    Classification {
        depth: AnalysisDepth::Fast,
        reason: TriggerReason::WithinThresholds,
    }
}
