//! Markdown report assembly.
//!
//! One report per Run, built from the persisted tool invocations and their
//! artifacts rather than from in-flight state, so a re-render after a crash
//! produces the same body. The body opens with a hidden HTML marker that the
//! reconciler uses to find the live comment on subsequent runs.

use std::time::Duration;

use serde_json::Value;

use crate::deeppass::TaskState;
use crate::fastpass::FastPassReport;
use crate::models::{AnalysisDepth, Confidence, CostSummary, FindingsSummary, RunIdentity, RunStatus};
use crate::tools::{TOOL_COST_ESTIMATE, TOOL_PR_CONTEXT, TOOL_SECURITY_SCAN};

/// Hidden marker identifying the surveyor comment on a PR. Invisible in
/// rendered Markdown; must stay stable across releases or the reconciler
/// will orphan old comments instead of updating them.
pub const REPORT_MARKER: &str = "<!-- surveyor-report -->";

/// Deep-pass material for the report: the dispatcher outcome plus whatever
/// the enhanced tools produced. `plan`, `cost_deep` and `compliance` are
/// only populated when the plan task succeeded.
#[derive(Debug)]
pub struct DeepReport {
    pub state: TaskState,
    pub detail: Option<String>,
    pub plan: Option<Value>,
    pub cost_deep: Option<Value>,
    pub compliance: Option<Value>,
}

impl DeepReport {
    pub fn unavailable(state: TaskState, detail: Option<String>) -> Self {
        Self {
            state,
            detail,
            plan: None,
            cost_deep: None,
            compliance: None,
        }
    }
}

/// Everything the renderer needs. Borrowed so the orchestrator can keep
/// using the fast-pass report for summary extraction afterwards.
pub struct ReportInput<'a> {
    pub identity: &'a RunIdentity,
    pub depth: AnalysisDepth,
    pub status: RunStatus,
    pub trigger: &'a str,
    pub duration: Duration,
    pub fast: &'a FastPassReport,
    pub deep: Option<&'a DeepReport>,
}

/// Renders the full comment body. Deterministic for a given input: section
/// order is fixed and every list preserves its source order.
pub fn render(input: &ReportInput<'_>) -> String {
    let mut body = String::new();
    body.push_str(REPORT_MARKER);
    body.push_str("\n## Surveyor analysis\n\n");
    body.push_str(&format!(
        "**PR:** {}#{} at `{}`\n",
        input.identity.owner_repo,
        input.identity.pr_number,
        input.identity.sha_short()
    ));
    body.push_str(&format!("**Depth:** {} ({})\n", input.depth, input.trigger));
    body.push_str(&format!(
        "**Status:** {} ({:.1}s)\n",
        input.status,
        input.duration.as_secs_f64()
    ));

    if let Some(summary) = input
        .fast
        .section(TOOL_PR_CONTEXT)
        .and_then(|s| s.get("summary"))
        .and_then(Value::as_str)
    {
        body.push_str(&format!("**Scope:** {}\n", summary));
    }
    body.push('\n');

    if input.fast.partial {
        body.push_str("> Some fast checks did not finish; the sections below are partial.\n\n");
    }

    body.push_str(&cost_section(input.fast, input.deep));
    body.push('\n');
    body.push_str(&security_section(input.fast));

    match input.deep {
        None => {}
        Some(deep) if deep.state == TaskState::Succeeded => {
            body.push('\n');
            body.push_str(&plan_section(deep));
            body.push('\n');
            body.push_str(&compliance_section(deep));
        }
        Some(deep) => {
            body.push('\n');
            body.push_str("### Deep analysis\n\n");
            body.push_str(&format!(
                "_Deep analysis unavailable: {}._\n",
                deep.detail.as_deref().unwrap_or("plan task did not succeed")
            ));
        }
    }

    body.push_str(&format!(
        "\n---\n_Generated by surveyor for commit `{}`._\n",
        input.identity.commit_sha
    ));
    body
}

/// Severity counts for the Run row, taken from the security scan output.
pub fn findings_summary(fast: &FastPassReport) -> Option<FindingsSummary> {
    fast.section(TOOL_SECURITY_SCAN).and_then(severity_counts)
}

/// Cost estimate for the Run row. The plan-backed deep estimate replaces
/// the fast heuristic one when both exist.
pub fn cost_summary(fast: &FastPassReport, deep: Option<&DeepReport>) -> Option<CostSummary> {
    let section = deep
        .and_then(|d| d.cost_deep.as_ref())
        .or_else(|| fast.section(TOOL_COST_ESTIMATE))?;
    parse_cost(section)
}

fn cost_section(fast: &FastPassReport, deep: Option<&DeepReport>) -> String {
    let mut out = String::from("### Cost impact\n\n");
    let section = deep
        .and_then(|d| d.cost_deep.as_ref())
        .or_else(|| fast.section(TOOL_COST_ESTIMATE));
    let Some(value) = section else {
        out.push_str(&unavailable_note(fast, TOOL_COST_ESTIMATE, "Cost estimate"));
        return out;
    };
    let Some(cost) = parse_cost(value) else {
        out.push_str("_Cost estimate could not be interpreted._\n");
        return out;
    };

    if cost.monthly_delta_usd == 0.0 {
        out.push_str("No significant cost change detected.\n");
        return out;
    }
    out.push_str(&format!(
        "Estimated monthly delta: **{}** ({} confidence)\n",
        format_usd(cost.monthly_delta_usd),
        cost.confidence
    ));
    if let Some(drivers) = value.get("top_drivers").and_then(Value::as_array) {
        let mut lines = Vec::new();
        for driver in drivers.iter().take(3) {
            let (Some(service), Some(delta)) = (
                driver.get("service").and_then(Value::as_str),
                driver.get("delta").and_then(Value::as_f64),
            ) else {
                continue;
            };
            lines.push(format!("- {}: {}/month", service, format_usd(delta)));
        }
        if !lines.is_empty() {
            out.push_str("\n**Top drivers:**\n");
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
        }
    }
    out
}

fn security_section(fast: &FastPassReport) -> String {
    let mut out = String::from("### Security findings\n\n");
    let Some(value) = fast.section(TOOL_SECURITY_SCAN) else {
        out.push_str(&unavailable_note(fast, TOOL_SECURITY_SCAN, "Security scan"));
        return out;
    };
    let Some(counts) = severity_counts(value) else {
        out.push_str("_Security scan output could not be interpreted._\n");
        return out;
    };
    if counts.total() == 0 {
        out.push_str("No security findings.\n");
        return out;
    }
    out.push_str(&format!(
        "Found {} finding(s): {} high, {} medium, {} low.\n",
        counts.total(),
        counts.high,
        counts.medium,
        counts.low
    ));
    if let Some(findings) = value.get("findings").and_then(Value::as_array) {
        let mut lines = Vec::new();
        for finding in findings.iter().take(5) {
            let Some(message) = finding.get("message").and_then(Value::as_str) else {
                continue;
            };
            let severity = finding
                .get("severity")
                .and_then(Value::as_str)
                .unwrap_or("low")
                .to_ascii_lowercase();
            match finding.get("rule").and_then(Value::as_str) {
                Some(rule) => lines.push(format!("- **{}** {}: {}", severity, rule, message)),
                None => lines.push(format!("- **{}** {}", severity, message)),
            }
        }
        if !lines.is_empty() {
            out.push('\n');
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
        }
    }
    out
}

fn plan_section(deep: &DeepReport) -> String {
    let mut out = String::from("### Infrastructure plan\n\n");
    let Some(plan) = deep.plan.as_ref() else {
        out.push_str("_Plan artifact was not readable._\n");
        return out;
    };
    let (create, update, delete) = plan_counts(plan);
    out.push_str(&format!(
        "Plan verified: {} to create, {} to change, {} to destroy.\n",
        create, update, delete
    ));
    out
}

fn compliance_section(deep: &DeepReport) -> String {
    let mut out = String::from("### Compliance\n\n");
    let Some(value) = deep.compliance.as_ref() else {
        out.push_str("_Compliance check unavailable._\n");
        return out;
    };
    let violations = value
        .get("violations")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    if violations.is_empty() {
        out.push_str("No compliance violations.\n");
        return out;
    }
    out.push_str(&format!("{} violation(s):\n\n", violations.len()));
    for violation in violations.iter().take(5) {
        match violation {
            Value::String(text) => out.push_str(&format!("- {}\n", text)),
            other => {
                let rule = other.get("rule").and_then(Value::as_str).unwrap_or("policy");
                let message = other
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("violation");
                out.push_str(&format!("- {}: {}\n", rule, message));
            }
        }
    }
    out
}

/// Counts create/update/delete actions in a terraform-style plan document.
fn plan_counts(plan: &Value) -> (u64, u64, u64) {
    let changes = plan
        .get("resource_changes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let (mut create, mut update, mut delete) = (0, 0, 0);
    for change in changes {
        let actions = change
            .get("change")
            .and_then(|c| c.get("actions"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let has = |name: &str| actions.iter().any(|a| a.as_str() == Some(name));
        if has("create") {
            create += 1;
        } else if has("update") {
            update += 1;
        } else if has("delete") {
            delete += 1;
        }
    }
    (create, update, delete)
}

fn severity_counts(section: &Value) -> Option<FindingsSummary> {
    if let Some(findings) = section.get("findings").and_then(Value::as_array) {
        let mut summary = FindingsSummary::default();
        for finding in findings {
            let severity = finding
                .get("severity")
                .and_then(Value::as_str)
                .map(str::to_ascii_lowercase);
            match severity.as_deref() {
                Some("high" | "critical") => summary.high += 1,
                Some("medium") => summary.medium += 1,
                _ => summary.low += 1,
            }
        }
        return Some(summary);
    }
    let counts = section.get("counts")?.as_object()?;
    let mut summary = FindingsSummary::default();
    for (severity, count) in counts {
        let count = count.as_u64().unwrap_or(0) as u32;
        match severity.to_ascii_lowercase().as_str() {
            "high" | "critical" => summary.high += count,
            "medium" => summary.medium += count,
            _ => summary.low += count,
        }
    }
    Some(summary)
}

fn parse_cost(value: &Value) -> Option<CostSummary> {
    let monthly_delta_usd = value.get("monthly_delta_usd")?.as_f64()?;
    let confidence = match value.get("confidence").and_then(Value::as_str) {
        Some(level) => parse_confidence(level),
        None => value
            .get("confidence_pct")
            .and_then(Value::as_f64)
            .map(confidence_from_pct)
            .unwrap_or(Confidence::Low),
    };
    Some(CostSummary {
        monthly_delta_usd,
        confidence,
    })
}

fn parse_confidence(level: &str) -> Confidence {
    match level.to_ascii_lowercase().as_str() {
        "high" => Confidence::High,
        "medium" => Confidence::Medium,
        _ => Confidence::Low,
    }
}

fn confidence_from_pct(pct: f64) -> Confidence {
    if pct >= 75.0 {
        Confidence::High
    } else if pct >= 50.0 {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

fn format_usd(delta: f64) -> String {
    if delta < 0.0 {
        format!("-${:.2}", delta.abs())
    } else {
        format!("+${:.2}", delta)
    }
}

/// Explains a missing section from the persisted invocation row, so the
/// reader sees "timed out" rather than a silently absent heading.
fn unavailable_note(fast: &FastPassReport, tool: &str, label: &str) -> String {
    let detail = fast
        .invocations
        .iter()
        .find(|inv| inv.tool_name == tool)
        .map(|inv| match &inv.error_detail {
            Some(detail) => format!("{}: {}", inv.status, detail),
            None => inv.status.to_string(),
        });
    match detail {
        Some(detail) => format!("_{} unavailable ({})._\n", label, detail),
        None => format!("_{} unavailable._\n", label),
    }
}
