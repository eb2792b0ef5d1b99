//! Runs one task's agent, collects its git fingerprint, and returns
//! an [`ExecutionResult`]. Thin domain wrapper around an [`Agent`].

use std::path::Path;
use std::process::Command;

use specq_types::{AgentRun, ExecutionResult};

use crate::agent::Agent;

/// Capability port for the two git facts the executor needs: what the
/// agent touched, and where `HEAD` landed. Failures degrade to empty
/// values rather than failing the execution — the agent may
/// legitimately have made no changes.
pub trait GitPort {
    fn changed_and_untracked_files(&self, cwd: &Path) -> Vec<String>;
    fn short_head(&self, cwd: &Path) -> String;
    /// Unified diff from `base_branch` to `HEAD`, truncated by the
    /// caller (the voter committee), not here.
    fn diff(&self, cwd: &Path, base_branch: &str) -> String;
}

impl GitPort for Box<dyn GitPort> {
    fn changed_and_untracked_files(&self, cwd: &Path) -> Vec<String> {
        (**self).changed_and_untracked_files(cwd)
    }
    fn short_head(&self, cwd: &Path) -> String {
        (**self).short_head(cwd)
    }
    fn diff(&self, cwd: &Path, base_branch: &str) -> String {
        (**self).diff(cwd, base_branch)
    }
}

/// Shells out to the system `git`.
pub struct ShellGit;

impl GitPort for ShellGit {
    fn changed_and_untracked_files(&self, cwd: &Path) -> Vec<String> {
        let mut files = std::collections::BTreeSet::new();

        if let Some(out) = run_git(cwd, &["diff", "--name-only", "HEAD~1", "HEAD"]) {
            files.extend(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()));
        }
        if let Some(out) = run_git(cwd, &["ls-files", "--others", "--exclude-standard"]) {
            files.extend(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()));
        }

        files.into_iter().collect()
    }

    fn short_head(&self, cwd: &Path) -> String {
        run_git(cwd, &["rev-parse", "--short", "HEAD"]).unwrap_or_default()
    }

    fn diff(&self, cwd: &Path, base_branch: &str) -> String {
        run_git(cwd, &["diff", &format!("{base_branch}...HEAD")]).unwrap_or_default()
    }
}

fn run_git(cwd: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).current_dir(cwd).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Drives one agent call to completion and reports what it produced.
pub struct Executor<A: Agent, G: GitPort> {
    agent: A,
    git: G,
}

impl<A: Agent, G: GitPort> Executor<A, G> {
    pub fn new(agent: A, git: G) -> Self {
        Self { agent, git }
    }

    /// Commit-enforcement system prompt handed to every agent call —
    /// the executor assumes the agent will leave a commit behind.
    pub fn system_prompt(change_id: &str) -> String {
        format!("Complete, then commit. Message format: feat({change_id}): …")
    }

    pub fn execute(&self, change_id: &str, brief: &str, cwd: &Path) -> ExecutionResult {
        let system_prompt = Self::system_prompt(change_id);
        let run: AgentRun = self.agent.run(brief, cwd, Some(&system_prompt));

        if !run.success {
            return ExecutionResult {
                success: false,
                output: run.output,
                files_changed: Vec::new(),
                commit_hash: String::new(),
                duration_sec: run.duration_sec,
                turns_used: run.turns,
                tokens_in: run.tokens_in,
                tokens_out: run.tokens_out,
            };
        }

        let files_changed = self.git.changed_and_untracked_files(cwd);
        let commit_hash = self.git.short_head(cwd);

        ExecutionResult {
            success: true,
            output: run.output,
            files_changed,
            commit_hash,
            duration_sec: run.duration_sec,
            turns_used: run.turns,
            tokens_in: run.tokens_in,
            tokens_out: run.tokens_out,
        }
    }
}
