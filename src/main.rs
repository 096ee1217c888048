mod console;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use phaseflow_core::config::AppConfig;
use phaseflow_core::context::ExecutionContext;
use phaseflow_core::error::PhaseflowError;
use phaseflow_core::process::{PhaseReport, PhaseResult, ProcessStatus};
use phaseflow_core::traits::{LlmClient, MemoryStore, VibeCheckEvaluator};
use phaseflow_core::types::ExecutionId;

use phaseflow_engine::{
    AutoPassEvaluator, CommandLlmClient, LlmVibeEvaluator, ProcessBundle, ProcessEngine, RunLogger,
    WorkflowTemplate,
};
use phaseflow_memory::SqliteMemoryStore;

use console::ConsoleVibeEvaluator;

#[derive(Parser)]
#[command(name = "phaseflow", version, about = "Phased engineering processes driven by workflow graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "phaseflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow template (JSON)
    Validate {
        template: PathBuf,
    },
    /// Run a process bundle against a project, answering on the terminal
    Run {
        /// Bundle JSON: process, templates and catalog questions
        bundle: PathBuf,
        #[arg(long, default_value = ".")]
        project: String,
        #[arg(long, default_value = "main")]
        branch: String,
        /// Pass every vibe check without asking
        #[arg(long, conflicts_with = "ai_checks")]
        auto_pass: bool,
        /// Let the configured LLM judge vibe checks
        #[arg(long)]
        ai_checks: bool,
    },
    /// Show the stored state of an execution
    Status {
        execution_id: String,
        /// Print the full execution context as JSON
        #[arg(long)]
        json: bool,
    },
    /// Abort an execution
    Abort {
        execution_id: String,
        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },
    /// Show current configuration
    Config,
}

/// Who judges a phase's vibe checks.
#[derive(Clone, Copy)]
enum Checks {
    Console,
    AutoPass,
    Llm,
}

/// Stand-in when no `[llm] command` is configured. Workflows without LLM
/// nodes still run; an LLM node fails its run.
struct UnconfiguredLlm;

impl LlmClient for UnconfiguredLlm {
    fn complete<'a>(
        &'a self,
        _prompt: &'a str,
        _tools: &'a [String],
    ) -> BoxFuture<'a, phaseflow_core::Result<String>> {
        Box::pin(async {
            Err(PhaseflowError::Llm(
                "no [llm] command configured".to_string(),
            ))
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("phaseflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { template } => validate_template(&template)?,
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Status { execution_id, json } => {
            let config = load_config(&cli.config)?;
            let store = SqliteMemoryStore::open(&config.memory_path())?;
            let id = ExecutionId::from_str(&execution_id);
            let ctx = store
                .find_by_execution_id(&id)
                .await?
                .ok_or_else(|| PhaseflowError::ExecutionNotFound(execution_id.clone()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ctx)?);
            } else {
                print_status(&ctx);
            }
        }
        Commands::Abort {
            execution_id,
            reason,
        } => {
            let config = load_config(&cli.config)?;
            let engine = build_engine(&config, None, Checks::AutoPass, None)?;
            let execution = engine
                .fail_execution(&ExecutionId::from_str(&execution_id), &reason)
                .await?;
            println!("Execution {} is {}: {}", execution.id, execution.status, reason);
        }
        Commands::Run {
            bundle,
            project,
            branch,
            auto_pass,
            ai_checks,
        } => {
            let config = load_config(&cli.config)?;
            let bundle = ProcessBundle::load(&bundle)?;
            let checks = match (auto_pass, ai_checks) {
                (true, _) => Checks::AutoPass,
                (_, true) => Checks::Llm,
                _ => Checks::Console,
            };
            let engine = Arc::new(build_engine(
                &config,
                Some(bundle.clone()),
                checks,
                Some(&project),
            )?);
            run_process(&engine, &config, &bundle, &project, &branch).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = phaseflow_core::config::expand_home("~/.phaseflow/config.toml");
    if home_config.exists() {
        info!(path = %home_config.display(), "Using home config");
        return Ok(AppConfig::load(&home_config)?);
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn validate_template(path: &Path) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(path)?;
    let template = WorkflowTemplate::from_json(&json)?;
    let issues = template.issues();
    if issues.is_empty() {
        println!(
            "Template '{}' is valid ({} nodes, {} edges)",
            template.name,
            template.nodes.len(),
            template.graph.edges.len()
        );
        return Ok(());
    }
    for issue in &issues {
        eprintln!("  - {}", issue);
    }
    anyhow::bail!(
        "template '{}' has {} issue(s)",
        template.name,
        issues.len()
    )
}

fn select_evaluator(
    checks: Checks,
    config: &AppConfig,
    llm: &Arc<dyn LlmClient>,
) -> anyhow::Result<Arc<dyn VibeCheckEvaluator>> {
    Ok(match checks {
        Checks::Console => Arc::new(ConsoleVibeEvaluator),
        Checks::AutoPass => Arc::new(AutoPassEvaluator),
        Checks::Llm => {
            if config.llm.command.is_none() {
                anyhow::bail!("--ai-checks needs an [llm] command in the config");
            }
            Arc::new(LlmVibeEvaluator::new(llm.clone()))
        }
    })
}

/// System commands run in `project` unless `engine.working_dir` is set.
fn build_engine(
    config: &AppConfig,
    bundle: Option<ProcessBundle>,
    checks: Checks,
    project: Option<&str>,
) -> anyhow::Result<ProcessEngine> {
    let memory: Arc<dyn MemoryStore> = Arc::new(SqliteMemoryStore::open(&config.memory_path())?);
    let llm: Arc<dyn LlmClient> = match &config.llm.command {
        Some(command) => Arc::new(CommandLlmClient::new(command, config.llm.timeout_secs)),
        None => Arc::new(UnconfiguredLlm),
    };
    let evaluator = select_evaluator(checks, config, &llm)?;

    let mut engine_config = config.engine.clone();
    if engine_config.working_dir.is_none() {
        engine_config.working_dir = project.map(String::from);
    }

    let mut builder = ProcessEngine::builder()
        .with_config(engine_config)
        .with_default_tools(config.llm.tools.clone())
        .with_llm(llm)
        .with_evaluator(evaluator)
        .with_memory(memory);
    if let Some(bundle) = bundle {
        builder = builder.with_bundle(bundle);
    }
    Ok(builder.build()?)
}

async fn run_process(
    engine: &Arc<ProcessEngine>,
    config: &AppConfig,
    bundle: &ProcessBundle,
    project: &str,
    branch: &str,
) -> anyhow::Result<()> {
    let process_id = bundle.process.id.as_str();

    let execution = match engine.find_for_project(project, branch).await? {
        Some(ctx) if ctx.execution.process_id == process_id && !ctx.execution.is_finished() => {
            info!(execution_id = %ctx.execution.id, "Resuming existing execution");
            ctx.execution
        }
        _ => engine.start_execution(process_id, project, branch).await?,
    };
    let id = execution.id.clone();
    eprintln!("Execution {} ({})", id, bundle.process.name);

    let log_cancel = CancellationToken::new();
    if let (Some(log_dir), Some(log_config)) = (config.log_dir(), config.log.as_ref()) {
        let logger = RunLogger::new(log_dir, log_config.level);
        tokio::spawn(logger.run(engine.event_bus().clone(), id.clone(), log_cancel.clone()));
        info!("RunLogger started (level {})", log_config.level);
    }

    loop {
        let ctx = engine.get_context(&id).await?;
        if ctx.execution.is_finished() {
            break;
        }

        match ctx.execution.status {
            ProcessStatus::InProgress => {
                let pending = ctx.active_run.as_ref().and_then(|r| r.pending.clone());
                let result = match pending {
                    Some(request) => {
                        let answer = console::ask(&request).await?;
                        match engine.answer_phase(&id, &answer).await {
                            Err(PhaseflowError::InvalidInteraction(msg)) => {
                                eprintln!("Answer not accepted: {}", msg);
                                continue;
                            }
                            other => other?,
                        }
                    }
                    None => {
                        let phase = bundle
                            .process
                            .phase(ctx.execution.current_phase_index)
                            .map(|p| p.name.as_str())
                            .unwrap_or("?");
                        eprintln!(
                            "\n== Phase {}/{}: {} ==",
                            ctx.execution.current_phase_index + 1,
                            ctx.execution.phase_count,
                            phase
                        );
                        engine.run_phase(&id).await?
                    }
                };
                if let PhaseResult::Completed(report) = result {
                    print_report(&report);
                }
            }
            ProcessStatus::Failed => {
                let reason = ctx.execution.failure_reason.clone().unwrap_or_default();
                eprintln!("\nPhase failed: {}", reason);
                let retry = tokio::task::spawn_blocking(|| {
                    dialoguer::Confirm::new()
                        .with_prompt("Retry this phase?")
                        .default(true)
                        .interact()
                        .unwrap_or(false)
                })
                .await?;
                if !retry {
                    break;
                }
                engine.retry_phase(&id).await?;
            }
            other => {
                warn!(execution_id = %id, status = %other, "Unexpected execution status");
                break;
            }
        }
    }

    log_cancel.cancel();
    let ctx = engine.get_context(&id).await?;
    println!("Execution {} stopped as {}", id, ctx.execution.status);
    Ok(())
}

fn print_report(report: &PhaseReport) {
    eprintln!("\n{}", report.summary);
    for result in &report.vibe_checks {
        let mark = if result.passed { "PASS" } else { "FAIL" };
        let kind = if result.check.required { "" } else { " (optional)" };
        eprintln!("  [{}] {}{}", mark, result.check.question, kind);
        if !result.findings.is_empty() {
            eprintln!("         {}", result.findings);
        }
    }
    if let Some(reason) = report.failure_reason() {
        eprintln!("  -> {}", reason);
    }
}

fn print_status(ctx: &ExecutionContext) {
    let exec = &ctx.execution;
    println!("Execution:  {}", exec.id);
    println!("Process:    {}", exec.process_id);
    println!("Project:    {} ({})", ctx.project_path, ctx.branch);
    println!("Status:     {}", exec.status);
    println!(
        "Phase:      {} of {}",
        exec.current_phase_index + 1,
        exec.phase_count
    );
    if let Some(reason) = &exec.failure_reason {
        println!("Failure:    {}", reason);
    }
    if let Some(run) = &ctx.active_run {
        println!("Run:        {} ({})", run.run_id, run.status);
        if let Some(request) = &run.pending {
            println!("Waiting on: [{}] {}", request.interaction_type, request.question);
        }
    }
    println!("Updated:    {}", ctx.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));

    if !ctx.phase_reports.is_empty() {
        println!("\nPhase reports:");
        for report in &ctx.phase_reports {
            let gate = report.gate();
            let verdict = match report.failure_reason() {
                None => "passed".to_string(),
                Some(reason) => reason,
            };
            println!(
                "  {}. {} - {} ({} checks, {} optional failures)",
                report.phase_index + 1,
                report.phase_name,
                verdict,
                report.vibe_checks.len(),
                gate.optional_failures.len()
            );
        }
    }
    println!("\nInteractions: {}", ctx.interaction_history.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaseflow_core::vibe::{VibeCheck, VibeCheckContext};

    #[test]
    fn test_ai_checks_conflicts_with_auto_pass() {
        let parsed =
            Cli::try_parse_from(["phaseflow", "run", "bundle.json", "--auto-pass", "--ai-checks"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_ai_checks_need_an_llm_command() {
        let llm: Arc<dyn LlmClient> = Arc::new(UnconfiguredLlm);
        let Err(err) = select_evaluator(Checks::Llm, &AppConfig::default(), &llm) else {
            panic!("--ai-checks accepted without an LLM command");
        };
        assert!(err.to_string().contains("[llm] command"));
    }

    #[tokio::test]
    async fn test_ai_checks_ask_the_configured_llm() {
        let mut config = AppConfig::default();
        config.llm.command = Some("unused".into());
        let llm: Arc<dyn LlmClient> = Arc::new(phaseflow_test_utils::ScriptedLlm::new(vec![
            r#"{"passed": true, "findings": "suite is green"}"#,
        ]));
        let evaluator = select_evaluator(Checks::Llm, &config, &llm).unwrap();
        let result = evaluator
            .evaluate(&VibeCheck::required("Are the tests green?"), &VibeCheckContext::default())
            .await
            .unwrap();
        assert!(result.passed);
    }
}
