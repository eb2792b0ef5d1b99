//! Assembles the per-task briefing handed to the [`crate::agent::Agent`].

use anyhow::Result;
use specq_types::Finding;

use crate::textgen::TextGenerator;

const REFINE_SYSTEM_PROMPT: &str = "You are a tech lead preparing a concise, \
actionable brief for an engineer about to implement one task. Keep it tight: \
state what to build, what's already done, and any findings to address. No \
preamble, no sign-off.";

/// A previously-completed task, summarized for the "Completed Tasks"
/// section of a later task's brief.
pub struct CompletedTask {
    pub title: String,
    pub files_changed: Vec<String>,
    pub commit_hash: String,
}

/// Everything the compiler needs to assemble one task's brief.
pub struct BriefContext<'a> {
    pub proposal_body: &'a str,
    pub all_task_titles: &'a [String],
    pub current_task_title: &'a str,
    pub current_task_description: &'a str,
    pub completed_tasks: &'a [CompletedTask],
    pub project_rules: Option<&'a str>,
    pub retry_findings: Option<&'a [Finding]>,
}

pub trait BriefCompiler {
    fn compile(&self, ctx: &BriefContext<'_>) -> Result<String>;
}

/// Deterministic concatenation of labeled sections. No model involved.
pub struct Passthrough;

impl BriefCompiler for Passthrough {
    fn compile(&self, ctx: &BriefContext<'_>) -> Result<String> {
        Ok(assemble(ctx))
    }
}

/// Sends the assembled context to a [`TextGenerator`] for a tighter,
/// tech-lead-style rewrite. With `fallback_on_error` set, a generator
/// failure falls back to the raw assembled context instead of
/// propagating.
pub struct Refined<T: TextGenerator> {
    generator: T,
    fallback_on_error: bool,
}

impl<T: TextGenerator> Refined<T> {
    pub fn new(generator: T, fallback_on_error: bool) -> Self {
        Self {
            generator,
            fallback_on_error,
        }
    }
}

impl<T: TextGenerator> BriefCompiler for Refined<T> {
    fn compile(&self, ctx: &BriefContext<'_>) -> Result<String> {
        let assembled = assemble(ctx);
        match self.generator.chat(REFINE_SYSTEM_PROMPT, &assembled) {
            Ok(refined) => Ok(refined),
            Err(_) if self.fallback_on_error => Ok(assembled),
            Err(err) => Err(err),
        }
    }
}

fn assemble(ctx: &BriefContext<'_>) -> String {
    let mut out = String::new();

    out.push_str("## Task\n");
    out.push_str(ctx.current_task_title);
    out.push('\n');
    if !ctx.current_task_description.is_empty() {
        out.push('\n');
        out.push_str(ctx.current_task_description);
        out.push('\n');
    }

    out.push_str("\n## Proposal\n");
    out.push_str(ctx.proposal_body.trim());
    out.push('\n');

    if !ctx.all_task_titles.is_empty() {
        out.push_str("\n## All Tasks\n");
        for title in ctx.all_task_titles {
            out.push_str("- ");
            out.push_str(title);
            out.push('\n');
        }
    }

    if !ctx.completed_tasks.is_empty() {
        out.push_str("\n## Completed Tasks\n");
        for task in ctx.completed_tasks {
            out.push_str("- ");
            out.push_str(&task.title);
            if !task.commit_hash.is_empty() {
                out.push_str(" (");
                out.push_str(&task.commit_hash);
                out.push(')');
            }
            out.push('\n');
            for file in &task.files_changed {
                out.push_str("  - ");
                out.push_str(file);
                out.push('\n');
            }
        }
    }

    if let Some(rules) = ctx.project_rules {
        if !rules.trim().is_empty() {
            out.push_str("\n## Project Rules\n");
            out.push_str(rules.trim());
            out.push('\n');
        }
    }

    if let Some(findings) = ctx.retry_findings {
        if !findings.is_empty() {
            out.push_str("\n## Previous Review Findings\n");
            for finding in findings {
                out.push_str(&format!(
                    "- [{:?}] {}: {}\n",
                    finding.severity, finding.category, finding.description
                ));
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use specq_types::Severity;
    use std::cell::RefCell;

    #[test]
    fn passthrough_includes_all_sections_in_order() {
        let completed = vec![CompletedTask {
            title: "task-a".to_string(),
            files_changed: vec!["src/lib.rs".to_string()],
            commit_hash: "abc123".to_string(),
        }];
        let findings = vec![Finding {
            severity: Severity::Warning,
            category: "style".to_string(),
            description: "missing doc comment".to_string(),
        }];
        let ctx = BriefContext {
            proposal_body: "Add rate limiting.",
            all_task_titles: &["task-a".to_string(), "task-b".to_string()],
            current_task_title: "task-b",
            current_task_description: "Wire the limiter into the router.",
            completed_tasks: &completed,
            project_rules: Some("Use thiserror for typed errors."),
            retry_findings: Some(&findings),
        };

        let brief = Passthrough.compile(&ctx).unwrap();
        let task_pos = brief.find("## Task").unwrap();
        let proposal_pos = brief.find("## Proposal").unwrap();
        let all_tasks_pos = brief.find("## All Tasks").unwrap();
        let completed_pos = brief.find("## Completed Tasks").unwrap();
        let rules_pos = brief.find("## Project Rules").unwrap();
        let findings_pos = brief.find("## Previous Review Findings").unwrap();
        assert!(task_pos < proposal_pos);
        assert!(proposal_pos < all_tasks_pos);
        assert!(all_tasks_pos < completed_pos);
        assert!(completed_pos < rules_pos);
        assert!(rules_pos < findings_pos);
        assert!(brief.contains("- [warning] style: missing doc comment") || brief.contains("Warning"));
        assert!(brief.contains("abc123"));
        assert!(brief.contains("src/lib.rs"));
    }

    #[test]
    fn passthrough_omits_empty_sections() {
        let ctx = BriefContext {
            proposal_body: "Body.",
            all_task_titles: &[],
            current_task_title: "task-a",
            current_task_description: "",
            completed_tasks: &[],
            project_rules: None,
            retry_findings: None,
        };
        let brief = Passthrough.compile(&ctx).unwrap();
        assert!(!brief.contains("## All Tasks"));
        assert!(!brief.contains("## Completed Tasks"));
        assert!(!brief.contains("## Project Rules"));
        assert!(!brief.contains("## Previous Review Findings"));
    }

    struct FakeGenerator {
        response: RefCell<Result<String>>,
    }

    impl TextGenerator for FakeGenerator {
        fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            self.response.replace(Err(anyhow::anyhow!("consumed")))
        }
    }

    #[test]
    fn refined_returns_generator_output_on_success() {
        let gen = FakeGenerator {
            response: RefCell::new(Ok("refined brief".to_string())),
        };
        let compiler = Refined::new(gen, false);
        let ctx = BriefContext {
            proposal_body: "Body.",
            all_task_titles: &[],
            current_task_title: "task-a",
            current_task_description: "",
            completed_tasks: &[],
            project_rules: None,
            retry_findings: None,
        };
        assert_eq!(compiler.compile(&ctx).unwrap(), "refined brief");
    }

    #[test]
    fn refined_falls_back_to_assembled_context_on_error_when_configured() {
        let gen = FakeGenerator {
            response: RefCell::new(Err(anyhow::anyhow!("provider down"))),
        };
        let compiler = Refined::new(gen, true);
        let ctx = BriefContext {
            proposal_body: "Body text.",
            all_task_titles: &[],
            current_task_title: "task-a",
            current_task_description: "",
            completed_tasks: &[],
            project_rules: None,
            retry_findings: None,
        };
        let brief = compiler.compile(&ctx).unwrap();
        assert!(brief.contains("Body text."));
    }

    #[test]
    fn refined_propagates_error_without_fallback_flag() {
        let gen = FakeGenerator {
            response: RefCell::new(Err(anyhow::anyhow!("provider down"))),
        };
        let compiler = Refined::new(gen, false);
        let ctx = BriefContext {
            proposal_body: "Body.",
            all_task_titles: &[],
            current_task_title: "task-a",
            current_task_description: "",
            completed_tasks: &[],
            project_rules: None,
            retry_findings: None,
        };
        assert!(compiler.compile(&ctx).is_err());
    }
}
