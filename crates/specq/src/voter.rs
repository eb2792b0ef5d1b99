//! Verification committee: parallel reviewers, JSON verdict parsing,
//! per-voter failure isolation.

use std::panic::{self, AssertUnwindSafe};

use serde::Deserialize;
use serde_json::Value;
use specq_types::{Finding, Severity, Verdict, VoteResult};

use crate::textgen::TextGenerator;

const REVIEW_SYSTEM_PROMPT: &str = "You are an independent code reviewer on a verification \
committee. Review the provided diff against the proposal and any project rules. Respond with \
ONLY a JSON object of the shape {\"verdict\": \"pass\"|\"fail\", \"confidence\": 0..1, \
\"findings\": [{\"severity\": \"info\"|\"warning\"|\"critical\", \"category\": string, \
\"description\": string}], \"summary\": string}. No prose outside the JSON object.";

const MAX_DIFF_CHARS: usize = 50_000;

/// One configured reviewer: a name (surfaced on its [`VoteResult`])
/// and the capability used to produce a verdict.
pub trait VoterLike: Send + Sync {
    fn name(&self) -> &str;
    fn review(&self, ctx: &ReviewContext<'_>) -> VoteResult;
}

/// Everything a voter needs to review one change.
pub struct ReviewContext<'a> {
    pub diff: &'a str,
    pub proposal: &'a str,
    pub project_rules: Option<&'a str>,
    pub checks: &'a [String],
}

/// A voter backed by a [`TextGenerator`] — the HTTP-backed concrete
/// providers, or a local-CLI wrapper presenting the same capability.
pub struct TextGeneratorVoter<T: TextGenerator> {
    name: String,
    generator: T,
}

impl<T: TextGenerator> TextGeneratorVoter<T> {
    pub fn new(name: impl Into<String>, generator: T) -> Self {
        Self {
            name: name.into(),
            generator,
        }
    }
}

impl<T: TextGenerator + Send + Sync> VoterLike for TextGeneratorVoter<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn review(&self, ctx: &ReviewContext<'_>) -> VoteResult {
        let user_message = assemble_user_message(ctx);
        match self.generator.chat(REVIEW_SYSTEM_PROMPT, &user_message) {
            Ok(raw) => parse_verdict(&self.name, &raw),
            Err(err) => VoteResult::error(&self.name, format!("Voter error: {err}")),
        }
    }
}

fn assemble_user_message(ctx: &ReviewContext<'_>) -> String {
    let diff = truncate(ctx.diff, MAX_DIFF_CHARS);
    let mut out = String::new();
    out.push_str("## Diff\n");
    out.push_str(&diff);
    out.push_str("\n\n## Proposal\n");
    out.push_str(ctx.proposal.trim());
    if let Some(rules) = ctx.project_rules {
        if !rules.trim().is_empty() {
            out.push_str("\n\n## Project Rules\n");
            out.push_str(rules.trim());
        }
    }
    if !ctx.checks.is_empty() {
        out.push_str("\n\n## Required Checks\n");
        for check in ctx.checks {
            out.push_str("- ");
            out.push_str(check);
            out.push('\n');
        }
    }
    out
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawVerdict {
    verdict: String,
    confidence: f64,
    findings: Vec<RawFinding>,
    summary: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawFinding {
    severity: String,
    category: String,
    description: String,
}

/// Parse a voter's raw text response into a [`VoteResult`]. Strips an
/// enclosing code fence if present; a parse failure (or a verdict
/// outside `{pass, fail}`, coerced to `fail`) never panics — it always
/// yields a usable `VoteResult`.
fn parse_verdict(voter: &str, raw: &str) -> VoteResult {
    let cleaned = strip_code_fence(raw.trim());
    let Ok(value) = serde_json::from_str::<Value>(&cleaned) else {
        return VoteResult {
            voter: voter.to_string(),
            verdict: Verdict::Error,
            confidence: 0.0,
            findings: Vec::new(),
            summary: "Failed to parse voter response as JSON".to_string(),
        };
    };
    let Ok(raw_verdict) = serde_json::from_value::<RawVerdict>(value) else {
        return VoteResult {
            voter: voter.to_string(),
            verdict: Verdict::Error,
            confidence: 0.0,
            findings: Vec::new(),
            summary: "Failed to parse voter response as JSON".to_string(),
        };
    };

    let verdict = match raw_verdict.verdict.as_str() {
        "pass" => Verdict::Pass,
        _ => Verdict::Fail,
    };

    let findings = raw_verdict
        .findings
        .into_iter()
        .map(|f| Finding {
            severity: match f.severity.as_str() {
                "warning" => Severity::Warning,
                "critical" => Severity::Critical,
                _ => Severity::Info,
            },
            category: f.category,
            description: f.description,
        })
        .collect();

    VoteResult {
        voter: voter.to_string(),
        verdict,
        confidence: raw_verdict.confidence,
        findings,
        summary: raw_verdict.summary,
    }
}

fn strip_code_fence(s: &str) -> String {
    let Some(rest) = s.strip_prefix("```") else {
        return s.to_string();
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    match rest.rfind("```") {
        Some(end) => rest[..end].trim().to_string(),
        None => rest.trim().to_string(),
    }
}

/// Run every voter concurrently and collect every result. A voter
/// that panics is converted to an `error` verdict — one voter's
/// failure must never prevent the others' results from being
/// recorded. Result order is unspecified.
pub fn run_voters(voters: &[Box<dyn VoterLike>], ctx: &ReviewContext<'_>) -> Vec<VoteResult> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = voters
            .iter()
            .map(|voter| {
                scope.spawn(move || {
                    let name = voter.name().to_string();
                    match panic::catch_unwind(AssertUnwindSafe(|| voter.review(ctx))) {
                        Ok(result) => result,
                        Err(_) => VoteResult::error(&name, format!("Voter error: {name} panicked")),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap_or_else(|_| VoteResult::error("unknown", "Voter error: thread join failed"))).collect()
    })
}
