use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use anvil::agent::cli::CliAgent;
use anvil::agent::AgentSet;
use anvil::architect::decompose_prd;
use anvil::config::RunnerConfig;
use anvil::errors::SessionError;
use anvil::model::{validate_backlog, Backlog};
use anvil::orchestrator::runner::RunSummary;
use anvil::orchestrator::{CancelToken, Orchestrator};
use anvil::prp::PrpRuntime;
use anvil::qa::{plan_fix_cycle, run_fix_cycle, QaReviewer};
use anvil::scope::parse_scope;
use anvil::session::{self, delta, SessionManager};

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version, about = "Autonomous development orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Root directory holding session directories
    #[arg(long, default_value = "plans", global = true)]
    pub plan_root: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive a PRD to implemented code
    Run {
        /// Path to the PRD document
        #[arg(long, default_value = "PRD.md")]
        prd: PathBuf,
        /// Scope to execute (P<n>[.M<n>[.T<n>[.S<n>]]]); defaults to the first phase
        #[arg(short, long)]
        scope: Option<String>,
        /// Maximum subtasks in flight (1 = strict serial DFS)
        #[arg(long, default_value = "1")]
        parallelism: usize,
        /// Stop dispatching after the first surfaced failure
        #[arg(long)]
        fail_fast: bool,
        /// Skip the git commit step after completed subtasks
        #[arg(long)]
        no_commit: bool,
        /// Skip the QA review and fix cycle
        #[arg(long)]
        no_qa: bool,
        /// Agent CLI command (defaults to $ANVIL_AGENT_CMD, then `claude`)
        #[arg(long)]
        agent_cmd: Option<String>,
        /// Project working directory agents and gates operate in
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },
    /// List sessions under the plan root
    Sessions,
    /// Validate a session's tasks.json against the schema
    Validate {
        /// Session id (directory name under the plan root)
        session: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match dispatch(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", console::style("error:").red().bold());
            2
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "anvil=debug" } else { "anvil=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Commands::Run {
            prd,
            scope,
            parallelism,
            fail_fast,
            no_commit,
            no_qa,
            agent_cmd,
            project_dir,
        } => {
            let config = RunnerConfig::default()
                .with_parallelism(*parallelism)
                .with_fail_fast(*fail_fast)
                .with_commits(!*no_commit);
            let project_dir = match project_dir {
                Some(dir) => dir.clone(),
                None => std::env::current_dir().context("Failed to get current directory")?,
            };
            cmd_run(
                prd,
                &cli.plan_root,
                scope.as_deref(),
                agent_cmd.clone(),
                &project_dir,
                config,
                !*no_qa,
            )
            .await
        }
        Commands::Sessions => cmd_sessions(&cli.plan_root),
        Commands::Validate { session } => cmd_validate(&cli.plan_root, session),
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    prd: &Path,
    plan_root: &Path,
    scope: Option<&str>,
    agent_cmd: Option<String>,
    project_dir: &Path,
    config: RunnerConfig,
    qa_enabled: bool,
) -> Result<i32> {
    let scope_id = scope.map(parse_scope).transpose()?;

    let agent: Arc<CliAgent> =
        Arc::new(CliAgent::new(agent_cmd, project_dir, config.agent_timeout()));
    let agents = AgentSet::uniform(agent);

    let manager = Arc::new(open_session(prd, plan_root, &agents, &config).await?);
    let runtime = Arc::new(PrpRuntime::new(&agents, project_dir, config.clone()));

    let cancel = CancelToken::new();
    let ctrlc_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancellation requested, stopping at the next quiescent point");
            ctrlc_token.cancel();
        }
    });

    let mut orchestrator = Orchestrator::new(
        Arc::clone(&manager),
        Arc::clone(&runtime),
        scope_id,
        config.clone(),
    )?
    .with_cancel_token(cancel.clone());
    let mut summary = orchestrator.run().await?;

    // QA review and fix cycle over a clean run.
    if qa_enabled && !summary.cancelled && summary.failed == 0 && summary.completed > 0 {
        let backlog = manager.backlog()?;
        let reviewer = QaReviewer::new(agents.qa.clone());
        match reviewer.review(&summary, &backlog).await {
            Ok(review) if !review.bugs.is_empty() => {
                info!(bugs = review.bugs.len(), "QA reported defects, entering fix cycle");
                let (updated, fix_ids) = plan_fix_cycle(&backlog, &review.bugs)?;
                manager.set_backlog(updated)?;
                let fix_summaries =
                    run_fix_cycle(Arc::clone(&manager), runtime, &config, &fix_ids, &cancel)
                        .await?;
                for fixes in &fix_summaries {
                    summary.completed += fixes.completed;
                    summary.failed += fixes.failed;
                    summary.blocked += fixes.blocked;
                    summary.failures.extend(fixes.failures.iter().cloned());
                    summary.cancelled |= fixes.cancelled;
                }
            }
            Ok(_) => info!("QA approved the scope"),
            Err(e) => warn!(error = %e, "QA review failed; skipping fix cycle"),
        }
    }

    print_summary(&summary);
    if summary.cancelled {
        return Ok(130);
    }
    Ok(if summary.failed > 0 || summary.blocked > 0 { 1 } else { 0 })
}

/// Load the session matching the PRD hash, derive a delta session from the
/// latest session when the PRD changed, or start fresh.
async fn open_session(
    prd: &Path,
    plan_root: &Path,
    agents: &AgentSet,
    config: &RunnerConfig,
) -> Result<SessionManager> {
    let bytes = std::fs::read(prd).map_err(|source| SessionError::PrdRead {
        path: prd.to_path_buf(),
        source,
    })?;
    let prd_text = std::str::from_utf8(&bytes)
        .map_err(|_| SessionError::PrdEncoding {
            path: prd.to_path_buf(),
        })?
        .to_string();
    std::fs::create_dir_all(plan_root).map_err(|source| SessionError::PlanRoot {
        path: plan_root.to_path_buf(),
        source,
    })?;

    let hash12 = session::short_hash(&session::hash_prd(&bytes)).to_string();
    if session::find_by_hash(plan_root, &hash12)?.is_some() {
        let manager = SessionManager::initialize(prd, plan_root)?;
        if !manager.session().tasks_path().exists() {
            let backlog = decompose_prd(agents.architect.clone(), &prd_text, config).await?;
            manager.set_backlog(backlog)?;
        }
        return Ok(manager);
    }

    // PRD hash is new. If a previous session exists with a usable backlog,
    // derive a delta session from it instead of starting over.
    if let Some(parent) = latest_usable_session(plan_root)? {
        info!(parent = %parent.info.id, "PRD changed, deriving delta session");
        let new_backlog = decompose_prd(agents.architect.clone(), &prd_text, config).await?;
        let delta_spec = delta::compute_delta(
            &parent.prd_snapshot,
            &prd_text,
            &parent.backlog,
            &new_backlog,
        );
        let manager = delta::create_delta_session(
            plan_root,
            &parent.info.id,
            &parent.backlog,
            &bytes,
            &new_backlog,
            &delta_spec,
        )?;
        return Ok(manager);
    }

    let manager = SessionManager::initialize(prd, plan_root)?;
    let backlog = decompose_prd(agents.architect.clone(), &prd_text, config).await?;
    manager.set_backlog(backlog)?;
    Ok(manager)
}

struct ParentSession {
    info: session::SessionInfo,
    prd_snapshot: String,
    backlog: Backlog,
}

fn latest_usable_session(plan_root: &Path) -> Result<Option<ParentSession>> {
    let Some(info) = session::list_sessions(plan_root)?.into_iter().next_back() else {
        return Ok(None);
    };
    let snapshot_path = info.path.join("prd_snapshot.md");
    let tasks_path = info.path.join("tasks.json");
    if !snapshot_path.exists() || !tasks_path.exists() {
        return Ok(None);
    }
    let prd_snapshot = std::fs::read_to_string(&snapshot_path)?;
    let backlog: Backlog = serde_json::from_str(&std::fs::read_to_string(&tasks_path)?)
        .context("parent session tasks.json does not parse")?;
    validate_backlog(&backlog).context("parent session tasks.json fails schema validation")?;
    Ok(Some(ParentSession {
        info,
        prd_snapshot,
        backlog,
    }))
}

fn cmd_sessions(plan_root: &Path) -> Result<i32> {
    let sessions = session::list_sessions(plan_root)?;
    if sessions.is_empty() {
        println!("No sessions under {}", plan_root.display());
        return Ok(0);
    }
    for info in sessions {
        let parent = info
            .parent
            .as_deref()
            .map(|p| format!("  (delta of {p})"))
            .unwrap_or_default();
        println!(
            "{}  hash {}{}",
            console::style(&info.id).bold(),
            info.hash12,
            console::style(parent).dim()
        );
    }
    Ok(0)
}

fn cmd_validate(plan_root: &Path, session_id: &str) -> Result<i32> {
    let tasks_path = plan_root.join(session_id).join("tasks.json");
    let content = std::fs::read_to_string(&tasks_path)
        .with_context(|| format!("Failed to read {}", tasks_path.display()))?;
    let backlog: Backlog = serde_json::from_str(&content).context("tasks.json does not parse")?;
    validate_backlog(&backlog).context("tasks.json fails schema validation")?;

    let subtasks = backlog.subtasks().count();
    println!(
        "{} {} items, {} subtasks",
        console::style("valid:").green().bold(),
        backlog.item_count(),
        subtasks
    );
    Ok(0)
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "{}  {} items  {} completed  {} failed  {} blocked  in {:.1}s",
        console::style("run summary").bold(),
        summary.total_items,
        console::style(summary.completed).green(),
        console::style(summary.failed).red(),
        console::style(summary.blocked).yellow(),
        summary.duration_ms as f64 / 1000.0
    );
    println!("session: {}", summary.session_path.display());
    for failure in &summary.failures {
        println!(
            "  {} {}: {}",
            console::style("✗").red(),
            failure.subtask,
            failure.reason
        );
    }
}
