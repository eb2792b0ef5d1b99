//! Filesystem → in-memory change set with front-matter and tasks parsed.
//!
//! The scanner is pure: the same directory tree always produces the same
//! [`WorkItem`] list, sorted by directory name. It never touches the
//! store — [`crate::pipeline`] is responsible for the upsert.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use specq_types::{ModelRef, Risk, Task, VerificationStrategy, WorkItem};

use crate::error::ScanError;

const PROPOSAL_FILE: &str = "proposal.md";
const TASKS_FILE: &str = "tasks.md";
const ARCHIVE_DIR: &str = "archive";

/// Resolve the changes directory when none is configured: prefer
/// `openspec/changes/` if it exists, else fall back to `changes/`.
pub fn default_changes_dir(project_root: &Path) -> PathBuf {
    let openspec = project_root.join("openspec").join("changes");
    if openspec.is_dir() {
        return openspec;
    }
    project_root.join("changes")
}

/// Scan `changes_dir` and return every valid change, sorted by id.
///
/// Directories without a `proposal.md`, the `archive/` directory, and
/// non-directory entries are skipped silently. An I/O error reading a
/// directory that *does* look like a change (has `proposal.md`) is
/// surfaced — that is a real failure, not an absent change.
pub fn scan(changes_dir: &Path) -> Result<Vec<WorkItem>, ScanError> {
    let mut items = Vec::new();

    let entries = match std::fs::read_dir(changes_dir) {
        Ok(entries) => entries,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(items),
        Err(source) => {
            return Err(ScanError::Io {
                path: changes_dir.display().to_string(),
                source,
            });
        }
    };

    for entry in entries {
        let entry = entry.map_err(|source| ScanError::Io {
            path: changes_dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == ARCHIVE_DIR {
            continue;
        }
        let proposal_path = path.join(PROPOSAL_FILE);
        if !proposal_path.is_file() {
            continue;
        }
        items.push(scan_one(&path, name)?);
    }

    items.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(items)
}

fn scan_one(dir: &Path, id: &str) -> Result<WorkItem, ScanError> {
    let proposal_path = dir.join(PROPOSAL_FILE);
    let raw = std::fs::read_to_string(&proposal_path).map_err(|source| ScanError::Io {
        path: proposal_path.display().to_string(),
        source,
    })?;

    let (front_matter, body) = split_front_matter(&raw).map_err(|source| ScanError::FrontMatter {
        path: proposal_path.display().to_string(),
        source,
    })?;

    let mut item = WorkItem::new(id, dir.display().to_string());
    item.title = extract_title(&body, id);
    item.description = body.trim().to_string();
    item.deps = front_matter.depends_on;
    item.priority = front_matter.priority;
    item.risk = front_matter.risk;
    item.executor_type = front_matter.executor_type;
    item.executor_model = front_matter.executor_model;
    item.executor_max_turns = front_matter.max_turns;
    item.executor_tools = front_matter.executor_tools;
    item.verification_strategy = front_matter.verification.strategy;
    item.voters = front_matter.voters;

    let tasks_path = dir.join(TASKS_FILE);
    if tasks_path.is_file() {
        let raw_tasks = std::fs::read_to_string(&tasks_path).map_err(|source| ScanError::Io {
            path: tasks_path.display().to_string(),
            source,
        })?;
        item.tasks = parse_tasks(&raw_tasks);
    }

    Ok(item)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FrontMatter {
    depends_on: Vec<String>,
    risk: Risk,
    priority: i32,
    executor_type: String,
    executor_model: String,
    max_turns: u32,
    executor_tools: Vec<String>,
    verification: VerificationOverride,
    voters: Vec<ModelRef>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerificationOverride {
    strategy: Option<VerificationStrategy>,
}

/// Split `---\n<yaml>\n---\n<body>` front-matter off the top of a
/// proposal file. Files that don't open with the fence are returned
/// whole as the body with empty front-matter.
fn split_front_matter(raw: &str) -> Result<(FrontMatter, String), serde_yaml::Error> {
    let Some(rest) = raw.strip_prefix("---\n") else {
        return Ok((FrontMatter::default(), raw.to_string()));
    };
    let Some(end) = rest.find("\n---\n") else {
        return Ok((FrontMatter::default(), raw.to_string()));
    };

    let yaml_block = &rest[..end];
    let body = rest[end + "\n---\n".len()..].to_string();

    if yaml_block.trim().is_empty() {
        return Ok((FrontMatter::default(), body));
    }

    let front_matter: FrontMatter = serde_yaml::from_str(yaml_block)?;
    Ok((front_matter, body))
}

fn extract_title(body: &str, fallback_id: &str) -> String {
    for line in body.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("# ") {
            let title = rest.trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }
    fallback_id.to_string()
}

/// Parse `## task-<slug>: title` headings from `tasks.md`, preserving
/// source order. Everything up to the next heading (or EOF) becomes
/// the task's trimmed description.
fn parse_tasks(raw: &str) -> Vec<Task> {
    let mut tasks = Vec::new();
    let mut current: Option<(String, String, Vec<&str>)> = None;

    for line in raw.lines() {
        if let Some((id, title)) = match_task_heading(line) {
            if let Some((id, title, body_lines)) = current.take() {
                tasks.push(Task::new(id, title, body_lines.join("\n").trim().to_string()));
            }
            current = Some((id, title, Vec::new()));
        } else if let Some((_, _, body_lines)) = current.as_mut() {
            body_lines.push(line);
        }
    }
    if let Some((id, title, body_lines)) = current.take() {
        tasks.push(Task::new(id, title, body_lines.join("\n").trim().to_string()));
    }

    tasks
}

/// Match `^##\s+(task-\S+):\s*(.+)$`, case-insensitive on the `task-`
/// prefix, rejecting deeper headings (`###`).
fn match_task_heading(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix("##")?;
    if rest.starts_with('#') {
        return None;
    }
    let rest = rest.strip_prefix(char::is_whitespace)?;
    let rest = rest.trim_start();
    let (head, title) = rest.split_once(':')?;
    let head = head.trim();
    if head.is_empty() || !head.to_ascii_lowercase().starts_with("task-") {
        return None;
    }
    let title = title.trim();
    if title.is_empty() {
        return None;
    }
    Some((head.to_string(), title.to_string()))
}
