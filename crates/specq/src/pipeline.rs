//! The pipeline loop: scan, schedule, compile, execute, verify, decide.
//!
//! One cooperative loop keyed by change id. Concurrency lives below this
//! module, inside the agent subprocess and the voter committee; the loop
//! itself is single-threaded and serial per change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use specq_types::{webhook_events, Decision, Finding, ModelRef, Status, VerificationStrategy, WorkItem};

use crate::agent::{AcpAgent, Agent};
use crate::aggregator::{aggregate, resolve_strategy};
use crate::brief::{BriefCompiler, BriefContext, CompletedTask, Passthrough, Refined};
use crate::config::{Config, CONFIG_DIR};
use crate::dag::{reconcile_status, select_next, Dag};
use crate::executor::{Executor, GitPort, ShellGit};
use crate::lock::RunLock;
use crate::notifier::{self, NotificationPayload, NotifierConfig};
use crate::reporter::Reporter;
use crate::scanner::scan;
use crate::store::Store;
use crate::textgen::{self, TextGenerator};
use crate::voter::{run_voters, ReviewContext, TextGeneratorVoter, VoterLike};

const PROJECT_RULES_FILE: &str = "CLAUDE.md";

/// What one call to [`Pipeline::cycle`] accomplished, so [`Pipeline::run`]
/// knows whether to keep looping.
#[derive(Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was `ready`; the loop should stop.
    NoReadyItem,
    /// The selected change was rejected but retry budget remains — the
    /// outer loop should continue even in `target_id` mode.
    Retried { change_id: String },
    /// The selected change reached a stable outcome this cycle.
    Dispatched { change_id: String, decision: Decision },
}

pub struct Pipeline<R: Reporter> {
    project_root: PathBuf,
    config: Config,
    store: Store,
    reporter: R,
}

impl<R: Reporter> Pipeline<R> {
    pub fn new(project_root: impl Into<PathBuf>, config: Config, store: Store, reporter: R) -> Self {
        Self {
            project_root: project_root.into(),
            config,
            store,
            reporter,
        }
    }

    /// Drive the loop. With `target_id`, exits as soon as that change
    /// reaches a stable (non-retry) outcome; otherwise runs until no
    /// change is `ready`.
    pub fn run(&mut self, target_id: Option<&str>) -> Result<()> {
        let lock = RunLock::acquire(&self.project_root.join(CONFIG_DIR))
            .context("failed to acquire run lock")?;
        if let Some(id) = target_id {
            let _ = lock.set_change(id);
        }

        loop {
            match self.cycle(target_id)? {
                CycleOutcome::NoReadyItem => return Ok(()),
                CycleOutcome::Retried { .. } => continue,
                CycleOutcome::Dispatched { .. } => {
                    if target_id.is_some() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One full cycle: scan, reconcile, persist, select, and — if a
    /// change was selected — drive it through compile/execute/verify/decide.
    pub fn cycle(&mut self, target_id: Option<&str>) -> Result<CycleOutcome> {
        let changes_dir = self
            .config
            .changes_dir
            .clone()
            .context("changes_dir must be resolved before running the pipeline")?;

        let mut items = scan(&changes_dir).context("failed to scan changes directory")?;

        for item in items.iter_mut() {
            if let Some(existing) = self.store.load_work_item(&item.id)? {
                item.status = existing.status;
                item.retry_count = existing.retry_count;
            }
        }

        reconcile_status(&mut items);

        for item in &items {
            self.store.upsert_work_item(item)?;
        }

        let dag = Dag::build(&items).map_err(|e| anyhow::anyhow!("{e}"))?;

        let selected_id = match select_next(&dag, &items, target_id) {
            Some(item) => item.id.clone(),
            None => {
                self.reporter.info("no ready changes");
                return Ok(CycleOutcome::NoReadyItem);
            }
        };

        let mut work_item = items
            .into_iter()
            .find(|i| i.id == selected_id)
            .expect("selected id came from this same item list");

        self.process_change(&mut work_item)
    }

    fn process_change(&mut self, item: &mut WorkItem) -> Result<CycleOutcome> {
        self.reporter.info(&format!("processing {}", item.id));

        let project_rules = read_project_rules(&self.project_root);
        let all_task_titles: Vec<String> = item.tasks.iter().map(|t| t.title.clone()).collect();
        let prior_findings = load_retry_findings(&self.store, &item.id, item.retry_count)?;

        let mut completed: Vec<CompletedTask> = Vec::new();
        let mut all_tasks_succeeded = true;

        let tasks = std::mem::take(&mut item.tasks);
        let mut executed_tasks = Vec::with_capacity(tasks.len());

        for mut task in tasks {
            item.status = Status::Compiling;
            self.log(&item.id, "compile", json!({"task": task.id}))?;

            let compiler = self.build_compiler()?;
            let ctx = BriefContext {
                proposal_body: &item.description,
                all_task_titles: &all_task_titles,
                current_task_title: &task.title,
                current_task_description: &task.description,
                completed_tasks: &completed,
                project_rules: project_rules.as_deref(),
                retry_findings: if item.retry_count > 0 { Some(&prior_findings) } else { None },
            };
            let brief = compiler.compile(&ctx).context("brief compilation failed")?;
            item.compiled_brief = brief.clone();
            self.store.upsert_work_item(item)?;

            item.status = Status::Running;
            self.log(&item.id, "execute", json!({"task": task.id}))?;

            let agent = self.build_agent(item);
            let git: Box<dyn GitPort> = Box::new(ShellGit);
            let executor = Executor::new(agent, git);
            let result = executor.execute(&item.id, &brief, &self.project_root);

            task.execution_output = result.output;
            task.files_changed = result.files_changed;
            task.commit_hash = result.commit_hash;
            task.turns_used = result.turns_used;
            task.tokens_in = result.tokens_in;
            task.tokens_out = result.tokens_out;
            task.duration_sec = result.duration_sec;
            task.status = if result.success { Status::Accepted } else { Status::Failed };
            self.reporter.info(&format!(
                "task {} finished in {}",
                task.id,
                humantime::format_duration(Duration::from_secs_f64(result.duration_sec.max(0.0))),
            ));

            let succeeded = result.success;
            if succeeded {
                completed.push(CompletedTask {
                    title: task.title.clone(),
                    files_changed: task.files_changed.clone(),
                    commit_hash: task.commit_hash.clone(),
                });
            }

            executed_tasks.push(task);

            if !succeeded {
                all_tasks_succeeded = false;
                break;
            }
        }

        item.tasks = executed_tasks;
        self.store.upsert_work_item(item)?;

        if !all_tasks_succeeded {
            return self.fail_or_retry(item, Vec::new());
        }

        let strategy = resolve_strategy(item.verification_strategy, item.risk, &self.config.risk_policy);

        let (decision, findings) = if strategy == VerificationStrategy::Skip {
            (Decision::Approved, Vec::new())
        } else {
            item.status = Status::Verifying;
            self.store.upsert_work_item(item)?;

            let git = ShellGit;
            let diff = git.diff(&self.project_root, &self.config.base_branch);
            let voters = self.build_voters()?;
            let ctx = ReviewContext {
                diff: &diff,
                proposal: &item.description,
                project_rules: project_rules.as_deref(),
                checks: &self.config.verification.checks,
            };
            let votes = run_voters(&voters, &ctx);
            item.vote_results = votes.clone();
            self.store.record_votes(&item.id, item.retry_count + 1, &votes)?;
            self.log(
                &item.id,
                "vote",
                json!({"votes": votes.iter().map(|v| json!({"voter": v.voter, "verdict": format!("{:?}", v.verdict)})).collect::<Vec<_>>()}),
            )?;

            aggregate(&votes, strategy, item.risk)
        };

        self.dispatch(item, decision, findings)
    }

    fn dispatch(&mut self, item: &mut WorkItem, decision: Decision, findings: Vec<Finding>) -> Result<CycleOutcome> {
        match decision {
            Decision::Approved => {
                item.status = Status::Accepted;
                self.store.upsert_work_item(item)?;
                self.log(&item.id, "approve", json!({}))?;
                self.notify(item, webhook_events::CHANGE_COMPLETED);
                Ok(CycleOutcome::Dispatched { change_id: item.id.clone(), decision })
            }
            Decision::NeedsReview => {
                item.status = Status::NeedsReview;
                self.store.upsert_work_item(item)?;
                self.log(&item.id, "needs_review", json!({"findings": findings}))?;
                self.notify(item, webhook_events::CHANGE_NEEDS_REVIEW);
                Ok(CycleOutcome::Dispatched { change_id: item.id.clone(), decision })
            }
            Decision::Rejected => self.fail_or_retry(item, findings),
        }
    }

    fn fail_or_retry(&mut self, item: &mut WorkItem, findings: Vec<Finding>) -> Result<CycleOutcome> {
        if item.retry_count < item.max_retries {
            item.retry_count += 1;
            item.status = Status::Ready;
            self.store.upsert_work_item(item)?;
            self.log(&item.id, "retry", json!({"retry_count": item.retry_count, "findings": findings}))?;
            Ok(CycleOutcome::Retried { change_id: item.id.clone() })
        } else {
            item.status = Status::Failed;
            self.store.upsert_work_item(item)?;
            self.log(&item.id, "failed", json!({"findings": findings}))?;
            self.notify(item, webhook_events::CHANGE_FAILED);
            Ok(CycleOutcome::Dispatched { change_id: item.id.clone(), decision: Decision::Rejected })
        }
    }

    // --- manual transitions (invoked from the CLI, out of band) ---

    pub fn accept(&mut self, change_id: &str) -> Result<()> {
        let mut item = self.require_item(change_id)?;
        if item.status != Status::NeedsReview {
            bail!("{change_id} is {:?}, not needs_review", item.status);
        }
        item.status = Status::Accepted;
        self.store.upsert_work_item(&item)?;
        self.log(change_id, "approve", json!({"manual": true}))?;
        self.notify(&item, webhook_events::CHANGE_COMPLETED);
        Ok(())
    }

    pub fn reject(&mut self, change_id: &str) -> Result<()> {
        let mut item = self.require_item(change_id)?;
        item.status = Status::Failed;
        self.store.upsert_work_item(&item)?;
        self.log(change_id, "failed", json!({"manual": true}))?;
        self.notify(&item, webhook_events::CHANGE_FAILED);
        Ok(())
    }

    pub fn retry(&mut self, change_id: &str) -> Result<()> {
        let mut item = self.require_item(change_id)?;
        if item.status != Status::Failed {
            bail!("{change_id} is {:?}, not failed", item.status);
        }
        item.status = Status::Ready;
        self.store.upsert_work_item(&item)?;
        self.log(change_id, "retry", json!({"manual": true}))?;
        Ok(())
    }

    pub fn skip(&mut self, change_id: &str) -> Result<()> {
        let mut item = self.require_item(change_id)?;
        item.status = Status::Skipped;
        self.store.upsert_work_item(&item)?;
        self.log(change_id, "skip", json!({"manual": true}))?;
        Ok(())
    }

    fn require_item(&self, change_id: &str) -> Result<WorkItem> {
        self.store
            .load_work_item(change_id)?
            .with_context(|| format!("no such change: {change_id}"))
    }

    // --- wiring helpers ---

    fn build_agent(&self, item: &WorkItem) -> Box<dyn Agent> {
        let executor_type = if item.executor_type.is_empty() {
            self.config.executor.executor_type.clone().unwrap_or_else(|| "claude".to_string())
        } else {
            item.executor_type.clone()
        };
        let model = if !item.executor_model.is_empty() {
            Some(item.executor_model.clone())
        } else {
            self.config.executor.model.clone()
        };

        match executor_type.as_str() {
            "gemini" => Box::new(AcpAgent::gemini(model.as_deref())),
            "codex" => Box::new(AcpAgent::codex(model.as_deref())),
            _ => Box::new(AcpAgent::claude_code(model.as_deref())),
        }
    }

    fn build_compiler(&self) -> Result<Box<dyn BriefCompiler>> {
        let Some(provider) = self.config.compiler.provider.as_deref() else {
            return Ok(Box::new(Passthrough));
        };
        let model = self.config.compiler.model.as_deref().unwrap_or_default();
        let api_key = self.provider_api_key(provider)?;
        let generator = textgen::build(provider, model, &api_key)?;
        Ok(Box::new(Refined::new(generator, true)))
    }

    fn build_voters(&self) -> Result<Vec<Box<dyn VoterLike>>> {
        let refs: &[ModelRef] = if self.config.verification.voters.is_empty() {
            &[]
        } else {
            &self.config.verification.voters
        };

        refs.iter()
            .map(|m| {
                let api_key = self.provider_api_key(&m.provider)?;
                let generator = textgen::build(&m.provider, &m.model, &api_key)?;
                let name = format!("{}/{}", m.provider, m.model);
                Ok(Box::new(TextGeneratorVoter::new(name, generator)) as Box<dyn VoterLike>)
            })
            .collect()
    }

    fn provider_api_key(&self, provider: &str) -> Result<String> {
        self.config
            .providers
            .get(provider)
            .and_then(|p| p.api_key.clone())
            .with_context(|| format!("no API key configured for provider {provider}"))
    }

    fn log(&mut self, change_id: &str, event: &str, detail: serde_json::Value) -> Result<()> {
        self.store.append_log(&specq_types::LogEvent::new(change_id, event, detail))
    }

    fn notify(&self, item: &WorkItem, event: &str) {
        let notifier_config = NotifierConfig {
            webhook_url: self.config.notify.webhook_url.clone(),
            events: self.config.notify.events.clone(),
            secret: self.config.notify.secret.clone(),
        };
        notifier::notify(
            &notifier_config,
            NotificationPayload {
                event: event.to_string(),
                change_id: item.id.clone(),
                title: item.title.clone(),
                status: format!("{:?}", item.status),
                retry_count: item.retry_count,
            },
        );
    }
}

fn read_project_rules(project_root: &Path) -> Option<String> {
    std::fs::read_to_string(project_root.join(PROJECT_RULES_FILE)).ok()
}

/// Findings from the previous verification attempt, for the retry brief
/// section. `retry_count` has already been incremented for a retry cycle,
/// so the previous attempt is `retry_count` itself (attempts are
/// `retry_count + 1`-indexed; attempt 1 is the first try, before any
/// retry_count increment).
fn load_retry_findings(store: &Store, change_id: &str, retry_count: u32) -> Result<Vec<Finding>> {
    if retry_count == 0 {
        return Ok(Vec::new());
    }
    Ok(store
        .votes_for_attempt(change_id, retry_count)?
        .into_iter()
        .flat_map(|v| v.findings)
        .collect())
}
