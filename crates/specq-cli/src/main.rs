use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use specq::config::{self, Config, CONFIG_DIR, CONFIG_FILE};
use specq::dag::Dag;
use specq::reporter::Reporter;
use specq::scanner::scan;
use specq::store::Store;
use specq::pipeline::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "specq", version)]
#[command(about = "Spec-driven orchestration for AI-agent-executed changes")]
struct Cli {
    /// Project root. Defaults to the current directory.
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    /// Path to the state database. Defaults to `<project_root>/.specq/state.db`.
    #[arg(long)]
    state_db: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scaffold a `.specq/` directory with a starter config.
    Init,
    /// Print the dependency order without running anything.
    Plan,
    /// Show the status of one change, or every change if omitted.
    Status { id: Option<String> },
    /// Print the dependency graph.
    Deps,
    /// Drive the pipeline loop, optionally pinned to a single change.
    Run {
        id: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Print the run log for a change.
    Logs { id: String },
    /// Print the most recent vote results for a change.
    Votes { id: String },
    /// Manually accept a change that is `needs_review`.
    Accept { id: String },
    /// Manually reject a change.
    Reject { id: String },
    /// Manually retry a `failed` change.
    Retry { id: String },
    /// Manually skip a change.
    Skip { id: String },
    /// Print the merged, resolved configuration.
    Config,
    /// Run the scanner and print the resulting change set without
    /// persisting or executing anything.
    Scan,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Init => run_init(&cli.project_root),
        Commands::Config => run_config(&cli.project_root),
        Commands::Scan => run_scan(&cli.project_root),
        Commands::Plan => run_plan(&cli.project_root),
        Commands::Deps => run_deps(&cli.project_root),
        Commands::Status { id } => run_status(&cli, id.as_deref()),
        Commands::Logs { id } => run_logs(&cli, &id),
        Commands::Votes { id } => run_votes(&cli, &id),
        Commands::Run { id, all } => run_pipeline(&cli, id.as_deref(), all),
        Commands::Accept { id } => run_manual(&cli, &id, |p, id| p.accept(id)),
        Commands::Reject { id } => run_manual(&cli, &id, |p, id| p.reject(id)),
        Commands::Retry { id } => run_manual(&cli, &id, |p, id| p.retry(id)),
        Commands::Skip { id } => run_manual(&cli, &id, |p, id| p.skip(id)),
    }
}

fn state_db_path(cli: &Cli) -> PathBuf {
    cli.state_db
        .clone()
        .unwrap_or_else(|| cli.project_root.join(CONFIG_DIR).join("state.db"))
}

fn load_config(project_root: &PathBuf) -> Result<Config> {
    config::load_config(project_root).context("failed to load configuration")
}

fn open_store(cli: &Cli) -> Result<Store> {
    Store::open(&state_db_path(cli)).context("failed to open state store")
}

fn run_init(project_root: &PathBuf) -> Result<()> {
    let dir = project_root.join(CONFIG_DIR);
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config_path = dir.join(CONFIG_FILE);
    if !config_path.exists() {
        let starter = "base_branch: main\n\
compiler:\n  provider: anthropic\n  model: claude-haiku-4-5\n\
executor:\n  type: claude_code\n\
verification:\n  voters: []\n  checks: []\n\
risk_policy:\n  low: skip\n  medium: majority\n  high: unanimous\n\
budgets:\n  max_retries: 3\n  max_duration_sec: 600\n  max_turns: 20\n\
notify:\n  events: []\n";
        fs::write(&config_path, starter)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
    }

    println!("initialized {}", dir.display());
    Ok(())
}

fn run_config(project_root: &PathBuf) -> Result<()> {
    let config = load_config(project_root)?;
    let yaml = serde_yaml::to_string(&config).context("failed to serialize resolved config")?;
    print!("{yaml}");
    Ok(())
}

fn run_scan(project_root: &PathBuf) -> Result<()> {
    let config = load_config(project_root)?;
    let changes_dir = config.changes_dir.expect("load_config always resolves changes_dir");
    let items = scan(&changes_dir)?;
    for item in &items {
        println!("{}: {} [{:?}/{:?}]", item.id, item.title, item.status, item.risk);
    }
    if items.is_empty() {
        println!("no changes found under {}", changes_dir.display());
    }
    Ok(())
}

fn run_plan(project_root: &PathBuf) -> Result<()> {
    let config = load_config(project_root)?;
    let changes_dir = config.changes_dir.expect("load_config always resolves changes_dir");
    let items = scan(&changes_dir)?;
    let dag = Dag::build(&items)?;
    for (idx, id) in dag.topo_order().iter().enumerate() {
        println!("{:>3}. {id}", idx + 1);
    }
    Ok(())
}

fn run_deps(project_root: &PathBuf) -> Result<()> {
    let config = load_config(project_root)?;
    let changes_dir = config.changes_dir.expect("load_config always resolves changes_dir");
    let items = scan(&changes_dir)?;
    Dag::build(&items)?;
    for item in &items {
        if item.deps.is_empty() {
            println!("{}: (no dependencies)", item.id);
        } else {
            println!("{}: {}", item.id, item.deps.join(", "));
        }
    }
    Ok(())
}

fn run_status(cli: &Cli, id: Option<&str>) -> Result<()> {
    let store = open_store(cli)?;
    match id {
        Some(id) => {
            let item = store
                .load_work_item(id)?
                .with_context(|| format!("no such change: {id}"))?;
            println!("{}: {:?} (retry {}/{})", item.id, item.status, item.retry_count, item.max_retries);
            println!("title: {}", item.title);
            println!("risk: {:?}", item.risk);
            if !item.error_message.is_empty() {
                println!("error: {}", item.error_message);
            }
        }
        None => {
            for item in store.load_all()? {
                println!("{}: {:?} (retry {}/{})", item.id, item.status, item.retry_count, item.max_retries);
            }
        }
    }
    Ok(())
}

fn run_logs(cli: &Cli, id: &str) -> Result<()> {
    let store = open_store(cli)?;
    for event in store.log_for(id)? {
        println!("{} {} {}", event.created_at.to_rfc3339(), event.event, event.detail);
    }
    Ok(())
}

fn run_votes(cli: &Cli, id: &str) -> Result<()> {
    let store = open_store(cli)?;
    let item = store.load_work_item(id)?.with_context(|| format!("no such change: {id}"))?;
    if item.vote_results.is_empty() {
        println!("no votes recorded for {id}");
    }
    for vote in &item.vote_results {
        println!("{}: {:?} (confidence {:.2})", vote.voter, vote.verdict, vote.confidence);
        for finding in &vote.findings {
            println!("  [{:?}] {}: {}", finding.severity, finding.category, finding.description);
        }
    }
    Ok(())
}

fn run_pipeline(cli: &Cli, id: Option<&str>, all: bool) -> Result<()> {
    if id.is_some() && all {
        anyhow::bail!("pass either an id or --all, not both");
    }
    let config = load_config(&cli.project_root)?;
    let store = open_store(cli)?;
    let mut pipeline = Pipeline::new(cli.project_root.clone(), config, store, CliReporter);
    pipeline.run(id)
}

fn run_manual(cli: &Cli, id: &str, op: impl FnOnce(&mut Pipeline<CliReporter>, &str) -> Result<()>) -> Result<()> {
    let config = load_config(&cli.project_root)?;
    let store = open_store(cli)?;
    let mut pipeline = Pipeline::new(cli.project_root.clone(), config, store, CliReporter);
    op(&mut pipeline, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestReporter {
        infos: Vec<String>,
        warns: Vec<String>,
        errors: Vec<String>,
    }

    impl Reporter for TestReporter {
        fn info(&mut self, msg: &str) {
            self.infos.push(msg.to_string());
        }

        fn warn(&mut self, msg: &str) {
            self.warns.push(msg.to_string());
        }

        fn error(&mut self, msg: &str) {
            self.errors.push(msg.to_string());
        }
    }

    #[test]
    fn cli_reporter_methods_are_callable() {
        let mut rep = CliReporter;
        rep.info("info");
        rep.warn("warn");
        rep.error("error");
    }

    #[test]
    fn test_reporter_collects_all_levels() {
        let mut reporter = TestReporter::default();
        reporter.info("i");
        reporter.warn("w");
        reporter.error("e");
        assert_eq!(reporter.infos, vec!["i".to_string()]);
        assert_eq!(reporter.warns, vec!["w".to_string()]);
        assert_eq!(reporter.errors, vec!["e".to_string()]);
    }

    #[test]
    fn run_init_is_idempotent_and_writes_starter_config() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path().to_path_buf();
        run_init(&root).unwrap();
        run_init(&root).unwrap();
        let contents = std::fs::read_to_string(root.join(CONFIG_DIR).join(CONFIG_FILE)).unwrap();
        assert!(contents.contains("base_branch: main"));
    }

    #[test]
    fn run_scan_reports_empty_changes_dir() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path().to_path_buf();
        run_scan(&root).unwrap();
    }

    #[test]
    fn state_db_path_defaults_under_config_dir() {
        let cli = Cli {
            project_root: PathBuf::from("/tmp/proj"),
            state_db: None,
            cmd: Commands::Scan,
        };
        assert_eq!(state_db_path(&cli), PathBuf::from("/tmp/proj/.specq/state.db"));
    }
}
